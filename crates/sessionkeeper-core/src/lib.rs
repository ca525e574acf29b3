//! Session core for mobile clients.
//!
//! Issues, caches and renews bearer tokens against a remote issuer, and
//! retries authenticated requests across token expiry without looping or
//! racing concurrent renewals.

pub mod api;
pub mod auth;
pub mod config;

#[cfg(test)]
mod testing;

pub use api::{ApiClient, ApiError, HttpRequest, HttpResponse, RequestInterceptor, Transport};
pub use auth::{CredentialStore, KeyringStore, MemoryStore, SessionManager, SessionState};
pub use config::Config;
