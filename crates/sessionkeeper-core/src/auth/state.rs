use std::fmt;

use serde::{Deserialize, Serialize};

use super::token::{AccessToken, RefreshToken, TokenPair};

/// Process-wide session state, derived from the stored tokens, the
/// reauthentication flag and any issuance currently in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Nothing to renew from; the next issuance bootstraps.
    NoCredentials,
    /// A bootstrap issuance is in flight.
    Bootstrapping,
    /// Tokens are present and usable.
    Authenticated,
    /// Silent renewal is blocked until full re-registration installs fresh
    /// tokens.
    ReauthRequired,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SessionState::NoCredentials => "no credentials",
            SessionState::Bootstrapping => "bootstrapping",
            SessionState::Authenticated => "authenticated",
            SessionState::ReauthRequired => "reauthentication required",
        };
        f.write_str(label)
    }
}

/// Token record as persisted under a single store key.
///
/// `refresh` is absent for installs that predate refresh tokens and only ever
/// held an access token.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredCredentials {
    pub access: Option<AccessToken>,
    pub refresh: Option<RefreshToken>,
}

impl StoredCredentials {
    /// Both tokens, if both are present
    pub fn pair(&self) -> Option<TokenPair> {
        Some(TokenPair {
            access: self.access.clone()?,
            refresh: self.refresh.clone()?,
        })
    }
}

impl From<TokenPair> for StoredCredentials {
    fn from(pair: TokenPair) -> Self {
        Self {
            access: Some(pair.access),
            refresh: Some(pair.refresh),
        }
    }
}
