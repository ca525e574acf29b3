//! Session ownership and token issuance.
//!
//! This module provides:
//! - `SessionManager`: bootstrap and reissue of bearer tokens, single-flight
//! - `CredentialStore`: durable storage for the token record and reauth flag
//! - Token types and best-effort JWT claim reading
//!
//! Tokens are persisted together as one record; a failed issuance never
//! leaves half of a pair behind.

pub mod credentials;
pub mod session;
pub mod state;
pub mod token;

pub use credentials::{
    CredentialStore, Durability, KeyringStore, MemoryStore, StoreError, REAUTH_KEY, TOKENS_KEY,
};
pub use session::SessionManager;
pub use state::{SessionState, StoredCredentials};
pub use token::{decode_expiry, decode_subject, AccessToken, RefreshToken, TokenPair};
