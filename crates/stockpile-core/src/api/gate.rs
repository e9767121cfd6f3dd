//! Credential-attaching request gate.
//!
//! Every authenticated call goes through `RequestGate::send`:
//!
//! 1. `/auth/*` session endpoints pass through untouched.
//! 2. Otherwise the current access token is attached and the call dispatched.
//! 3. If the server answers `TOKEN_EXPIRED`, the gate asks the session store
//!    for a refresh and redispatches the original request exactly once with
//!    whatever credential is current at that moment.
//! 4. Every other failure propagates unchanged.
//!
//! The gate keeps no state of its own; refresh coordination between
//! concurrent calls lives entirely in `SessionStore`.

use reqwest::Response;
use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;

use crate::auth::SessionStore;

use super::client::ApiRequest;
use super::ApiError;

#[derive(Clone)]
pub struct RequestGate {
    store: SessionStore,
}

impl RequestGate {
    pub fn new(store: SessionStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub async fn send(&self, request: &ApiRequest) -> Result<Response, ApiError> {
        let api = self.store.api();
        if request.is_unauthenticated() {
            return api.execute(request, None).await;
        }

        let sent_with = self.store.credential();
        let sent_token = sent_with.as_ref().map(|c| c.access_token());

        let error = match api.execute(request, sent_token).await {
            Err(e) if e.is_token_expired() => e,
            other => return other,
        };

        debug!(method = %request.method, path = %request.path, "Access token expired; refreshing");
        if let Err(refresh_error) = self.store.refresh_rejected(sent_token).await {
            debug!(error = %refresh_error, "Refresh failed; propagating original error");
            return Err(error);
        }

        // Re-read rather than reuse the refresh result: the credential may
        // have moved on again while this call was waiting.
        let Some(credential) = self.store.credential() else {
            return Err(error);
        };

        // A second rejection is final; no further refresh is attempted
        api.execute(request, Some(credential.access_token())).await
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let response = self.send(&ApiRequest::get(path)).await?;
        Self::decode(response).await
    }

    pub async fn post_json<T: DeserializeOwned, B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        let response = self
            .send(&ApiRequest::post(path, Self::encode(body)?))
            .await?;
        Self::decode(response).await
    }

    pub async fn put_json<T: DeserializeOwned, B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        let response = self
            .send(&ApiRequest::put(path, Self::encode(body)?))
            .await?;
        Self::decode(response).await
    }

    pub async fn delete(&self, path: &str) -> Result<(), ApiError> {
        self.send(&ApiRequest::delete(path)).await.map(|_| ())
    }

    fn encode<B: Serialize>(body: &B) -> Result<serde_json::Value, ApiError> {
        serde_json::to_value(body)
            .map_err(|e| ApiError::Configuration(format!("Failed to serialize request body: {}", e)))
    }

    async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, ApiError> {
        let url = response.url().to_string();
        let text = response.text().await?;
        serde_json::from_str(&text).map_err(|e| {
            ApiError::InvalidResponse(format!("Failed to parse JSON response from {}: {}", url, e))
        })
    }
}
