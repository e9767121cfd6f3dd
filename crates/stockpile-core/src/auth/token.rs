//! Access token claim decoding and the `Credential` pair.
//!
//! The expiry of a credential is always read from the access token's own
//! `exp` claim. The client never verifies signatures; it only needs to know
//! when the server will start rejecting the token.

use std::fmt;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct Claims {
    exp: i64,
}

/// Decode the `exp` claim of a JWT access token.
///
/// Returns `None` for anything that is not a three-segment token with a
/// base64url JSON payload carrying an integer `exp`.
pub fn decode_expiry(access_token: &str) -> Option<DateTime<Utc>> {
    let mut segments = access_token.split('.');
    let (_header, payload, _signature) = (segments.next()?, segments.next()?, segments.next()?);
    if segments.next().is_some() {
        return None;
    }

    // Some issuers pad the payload even though JWTs should not be padded
    let payload = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: Claims = serde_json::from_slice(&payload).ok()?;
    DateTime::from_timestamp(claims.exp, 0)
}

/// Access/refresh token pair owned by the session store.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    access_token: String,
    refresh_token: String,
    expires_at: Option<DateTime<Utc>>,
}

impl Credential {
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        let access_token = access_token.into();
        let expires_at = decode_expiry(&access_token);
        Self {
            access_token,
            refresh_token: refresh_token.into(),
            expires_at,
        }
    }

    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    pub fn refresh_token(&self) -> &str {
        &self.refresh_token
    }

    /// Expiry decoded from the access token, `None` if it could not be parsed
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|exp| exp > now).unwrap_or(false)
    }

    /// Check if the access token has not yet expired
    pub fn is_valid(&self) -> bool {
        self.is_valid_at(Utc::now())
    }

    /// Same credential with a new access token and, if the server rotated
    /// it, a new refresh token.
    pub(crate) fn renewed(&self, access_token: String, refresh_token: Option<String>) -> Self {
        Self::new(
            access_token,
            refresh_token.unwrap_or_else(|| self.refresh_token.clone()),
        )
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}
