//! HTTP client for the inventory API.
//!
//! `ApiClient` knows the wire format of the `/auth/*` endpoints and how to
//! dispatch an arbitrary `ApiRequest`. It holds no session state: the
//! bearer token is passed in per call by whoever owns the session.

use std::time::Duration;

use reqwest::{header, Client, Method, Response};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::auth::{AuthError, Credential, Identity, RefreshError, Role};

use super::error::ErrorBody;
use super::ApiError;

pub const LOGIN_PATH: &str = "/auth/login";
pub const REFRESH_PATH: &str = "/auth/refresh-token";
pub const LOGOUT_PATH: &str = "/auth/logout";
pub const REGISTER_PATH: &str = "/auth/register";

/// Endpoints that must never carry a bearer token or trigger a refresh.
const UNAUTHENTICATED_PATHS: [&str; 4] = [LOGIN_PATH, REFRESH_PATH, LOGOUT_PATH, REGISTER_PATH];

/// An outbound call, kept owned so it can be rebuilt for a redispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub body: Option<Value>,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::POST, path).with_body(body)
    }

    pub fn put(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::PUT, path).with_body(body)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Whether the request targets one of the `/auth/*` session endpoints
    pub fn is_unauthenticated(&self) -> bool {
        let path = self.path.split('?').next().unwrap_or_default();
        let path = path.trim_end_matches('/');
        UNAUTHENTICATED_PATHS.contains(&path)
    }
}

#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Debug, Serialize)]
struct RegisterRequest<'a> {
    username: &'a str,
    password: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<Role>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginResponse {
    status: Option<String>,
    access_token: Option<String>,
    refresh_token: Option<String>,
    user: Option<Identity>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshResponse {
    access_token: Option<String>,
    refresh_token: Option<String>,
}

/// Tokens returned by a successful refresh
#[derive(Debug, Clone)]
pub struct RefreshedTokens {
    pub access_token: String,
    /// Present only when the server rotates refresh tokens
    pub refresh_token: Option<String>,
}

/// API client for the inventory backend.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
}

impl ApiClient {
    /// Create a new API client
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ApiError> {
        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    /// Authenticate and return the new credential and identity
    pub async fn login(
        &self,
        username: &str,
        password: &str,
    ) -> Result<(Credential, Identity), AuthError> {
        let response = self
            .client
            .post(self.url(LOGIN_PATH))
            .json(&LoginRequest { username, password })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::auth_failure(status, &body));
        }

        let login: LoginResponse = response
            .json()
            .await
            .map_err(|e| AuthError::InvalidResponse(format!("Failed to parse login response: {}", e)))?;

        if login.status.as_deref() == Some("error") {
            return Err(AuthError::Rejected(
                login.message.unwrap_or_else(|| "Login rejected".to_string()),
            ));
        }

        match (login.access_token, login.refresh_token, login.user) {
            (Some(access), Some(refresh), Some(user)) => {
                Ok((Credential::new(access, refresh), user))
            }
            _ => Err(AuthError::InvalidResponse(
                "Login response is missing tokens or user".to_string(),
            )),
        }
    }

    /// Create an account. Does not sign in.
    pub async fn register(
        &self,
        username: &str,
        password: &str,
        role: Option<Role>,
    ) -> Result<(), AuthError> {
        let response = self
            .client
            .post(self.url(REGISTER_PATH))
            .json(&RegisterRequest {
                username,
                password,
                role,
            })
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(Self::auth_failure(status, &body))
    }

    fn auth_failure(status: reqwest::StatusCode, body: &str) -> AuthError {
        let message = ErrorBody::parse(body)
            .message
            .unwrap_or_else(|| ApiError::truncate_body(body));
        if status.is_server_error() {
            AuthError::Server(message)
        } else {
            AuthError::Rejected(message)
        }
    }

    /// Exchange a refresh token for a new access token
    pub async fn refresh(&self, refresh_token: &str) -> Result<RefreshedTokens, RefreshError> {
        let response = self
            .client
            .post(self.url(REFRESH_PATH))
            .json(&RefreshRequest { refresh_token })
            .send()
            .await
            .map_err(|e| RefreshError::Transient(format!("Failed to send refresh request: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let parsed = ErrorBody::parse(&body);
            let message = parsed
                .message
                .unwrap_or_else(|| format!("status {}: {}", status, ApiError::truncate_body(&body)));
            debug!(%status, code = ?parsed.code, "Refresh rejected");
            return Err(RefreshError::from_code(parsed.code.as_deref(), message));
        }

        let refreshed: RefreshResponse = response
            .json()
            .await
            .map_err(|e| RefreshError::Transient(format!("Failed to parse refresh response: {}", e)))?;

        let access_token = refreshed.access_token.ok_or_else(|| {
            RefreshError::Transient("Refresh response is missing accessToken".to_string())
        })?;

        Ok(RefreshedTokens {
            access_token,
            refresh_token: refreshed.refresh_token,
        })
    }

    /// Tell the server the session is over. Sends no credentials.
    pub async fn logout(&self) -> Result<(), ApiError> {
        let response = self
            .client
            .post(self.url(LOGOUT_PATH))
            .json(&serde_json::json!({}))
            .send()
            .await?;
        Self::check_response(response).await.map(|_| ())
    }

    /// Dispatch a request, attaching the bearer token when one is given
    pub async fn execute(
        &self,
        request: &ApiRequest,
        bearer: Option<&str>,
    ) -> Result<Response, ApiError> {
        let mut builder = self
            .client
            .request(request.method.clone(), self.url(&request.path))
            .header(header::ACCEPT, "application/json");

        if let Some(token) = bearer {
            let value = header::HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|_| ApiError::Configuration("Access token is not a valid header value".into()))?;
            builder = builder.header(header::AUTHORIZATION, value);
        }
        if let Some(ref body) = request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await?;
        Self::check_response(response).await
    }

    /// Check if response is successful, returning a classified error if not.
    async fn check_response(response: Response) -> Result<Response, ApiError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body))
        }
    }
}
