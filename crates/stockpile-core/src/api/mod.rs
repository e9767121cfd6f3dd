//! REST API access for the inventory backend.
//!
//! `ApiClient` speaks the wire format; `RequestGate` is what application
//! code calls: it attaches the bearer token and turns an expired access
//! token into a refresh plus a single redispatch.

pub mod client;
pub mod error;
pub mod gate;

pub use client::{ApiClient, ApiRequest};
pub use error::ApiError;
pub use gate::RequestGate;
