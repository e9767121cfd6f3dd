use thiserror::Error;

/// Refresh error codes meaning the refresh token itself is no longer usable.
pub const REFRESH_TOKEN_EXPIRED_CODE: &str = "REFRESH_TOKEN_EXPIRED";
pub const INVALID_REFRESH_TOKEN_CODE: &str = "INVALID_REFRESH_TOKEN";

/// Login and registration failures.
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Invalid credentials: {0}")]
    Rejected(String),

    #[error("Unable to reach server: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Server error: {0}")]
    Server(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl AuthError {
    /// True when the user can fix this by retyping their credentials
    pub fn is_invalid_credentials(&self) -> bool {
        matches!(self, AuthError::Rejected(_))
    }

    /// Message suitable for showing next to a login form
    pub fn user_message(&self) -> String {
        match self {
            AuthError::Rejected(_) => "Invalid username or password".to_string(),
            AuthError::Transport(e) if e.is_timeout() => {
                "Connection timed out. Please try again.".to_string()
            }
            AuthError::Transport(_) => {
                "Unable to connect to server. Check your network connection.".to_string()
            }
            other => format!("Login failed: {}", other),
        }
    }
}

/// Outcome of a failed refresh episode, shared by every waiter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RefreshError {
    /// The refresh token was rejected; the session has been torn down.
    #[error("Refresh token expired or invalid: {0}")]
    Expired(String),

    /// Network or server trouble; the session is kept for a later retry.
    #[error("Refresh failed: {0}")]
    Transient(String),

    #[error("No session to refresh")]
    NoSession,

    #[error("Session was logged out")]
    LoggedOut,
}

impl RefreshError {
    /// Classify a refresh endpoint error code
    pub(crate) fn from_code(code: Option<&str>, message: String) -> Self {
        match code {
            Some(REFRESH_TOKEN_EXPIRED_CODE) | Some(INVALID_REFRESH_TOKEN_CODE) => {
                RefreshError::Expired(message)
            }
            _ => RefreshError::Transient(message),
        }
    }

    /// Whether this failure ends the session
    pub fn forces_logout(&self) -> bool {
        matches!(self, RefreshError::Expired(_))
    }
}
