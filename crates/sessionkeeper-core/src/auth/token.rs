//! Bearer token types and best-effort JWT claim reading.
//!
//! The claims reader never verifies the signature. Tokens arrive over an
//! authenticated channel and the claims are only used to parameterize the
//! reissue call, so decoding is a convenience accessor, not a validator.

use std::fmt;

use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Subject claim name
const SUBJECT_CLAIM: &str = "sub";

/// Expiry claim name (seconds since the epoch)
const EXPIRY_CLAIM: &str = "exp";

/// Short-lived bearer credential attached to authenticated requests.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccessToken(String);

impl AccessToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Subject (`sub`) claim, if the payload carries one
    pub fn subject(&self) -> Option<String> {
        decode_subject(&self.0)
    }

    /// Expiry (`exp`) claim, if the payload carries one
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        decode_expiry(&self.0)
    }

    /// True when the expiry claim is in the past. Tokens without a readable
    /// expiry are not considered expired; the server decides.
    pub fn is_expired(&self) -> bool {
        self.expires_at().map(|exp| Utc::now() >= exp).unwrap_or(false)
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AccessToken(<redacted>)")
    }
}

/// Longer-lived credential exchanged for a new access token.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RefreshToken(String);

impl RefreshToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for RefreshToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RefreshToken(<redacted>)")
    }
}

/// Tokens issued together by one bootstrap or reissue call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenPair {
    pub access: AccessToken,
    pub refresh: RefreshToken,
}

/// Extract the subject claim from a compact token.
pub fn decode_subject(token: &str) -> Option<String> {
    payload_claims(token)?
        .get(SUBJECT_CLAIM)
        .and_then(Value::as_str)
        .map(String::from)
}

/// Extract the expiry claim from a compact token.
pub fn decode_expiry(token: &str) -> Option<DateTime<Utc>> {
    let exp = payload_claims(token)?.get(EXPIRY_CLAIM)?.as_f64()?;
    let secs = exp.trunc() as i64;
    let nanos = (exp.fract() * 1e9) as u32;
    DateTime::from_timestamp(secs, nanos)
}

fn payload_claims(token: &str) -> Option<Map<String, Value>> {
    let payload = token.split('.').nth(1)?;
    let bytes = decode_segment(payload)?;
    match serde_json::from_slice::<Value>(&bytes).ok()? {
        Value::Object(claims) => Some(claims),
        _ => None,
    }
}

/// Right-pad to a multiple of four and decode. Issuers are expected to use the
/// URL-safe alphabet, but the standard one is accepted too.
fn decode_segment(segment: &str) -> Option<Vec<u8>> {
    let mut padded = String::with_capacity(segment.len() + 3);
    padded.push_str(segment);
    while padded.len() % 4 != 0 {
        padded.push('=');
    }

    URL_SAFE
        .decode(&padded)
        .or_else(|_| STANDARD.decode(&padded))
        .ok()
}
