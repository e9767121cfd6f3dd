//! Authentication module: the signed-in session and everything around it.
//!
//! This module provides:
//! - `SessionStore`: credential/identity owner, single-flight token refresh,
//!   pre-emptive refresh timer and idempotent logout
//! - `Credential`, `Identity`: the session pair, expiry read from the token
//! - `SessionStorage` backends: memory, JSON file, OS keychain
//! - `InactivityWatcher`: idle logout
//! - `authorize`: route guard decision

pub mod credentials;
pub mod error;
pub mod guard;
pub mod identity;
pub mod inactivity;
pub mod session;
pub mod storage;
pub mod token;

pub use credentials::KeyringStorage;
pub use error::{AuthError, RefreshError};
pub use guard::{authorize, Access};
pub use identity::{Identity, Role};
pub use inactivity::InactivityWatcher;
pub use session::{LogoutReason, SessionConfig, SessionEvent, SessionStore};
pub use storage::{FileStorage, MemoryStorage, PersistedSession, SessionStorage};
pub use token::{decode_expiry, Credential};
