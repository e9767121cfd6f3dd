//! Core library for the stockpile inventory client.
//!
//! Owns the authenticated session (login, token refresh, logout, persisted
//! restore) and the request gate every authenticated API call goes through.

pub mod api;
pub mod auth;
pub mod config;

pub use api::{ApiClient, ApiError, ApiRequest, RequestGate};
pub use auth::{
    authorize, Access, AuthError, Credential, Identity, LogoutReason, RefreshError, Role,
    SessionConfig, SessionEvent, SessionStore,
};
pub use config::Config;
