//! Scripted transport, stores and token builders shared by unit tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use reqwest::StatusCode;

use crate::api::{HttpRequest, HttpResponse, Transport, TransportError};
use crate::auth::{
    AccessToken, CredentialStore, Durability, MemoryStore, SessionManager, StoreError,
    StoredCredentials, REAUTH_KEY, TOKENS_KEY,
};
use crate::config::Config;

pub const BASE_URL: &str = "https://api.test";
pub const ISSUE_PATH: &str = "/auth/token";
pub const REISSUE_PATH: &str = "/auth/token/reissue";

type Handler = dyn Fn(&HttpRequest) -> Result<HttpResponse, TransportError> + Send + Sync;

/// Transport answering from a closure and recording every request it sees.
pub struct MockTransport {
    handler: Box<Handler>,
    delays: Vec<(String, Duration)>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl MockTransport {
    pub fn new(
        handler: impl Fn(&HttpRequest) -> Result<HttpResponse, TransportError>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Self {
            handler: Box::new(handler),
            delays: Vec::new(),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Delay responses to URLs ending in `path`
    pub fn with_delay(mut self, path: &str, delay: Duration) -> Self {
        self.delays.push((path.to_string(), delay));
        self
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Number of requests sent to URLs ending in `path`
    pub fn calls_to(&self, path: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.url.ends_with(path))
            .count()
    }

    pub fn total_calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        self.requests.lock().unwrap().push(request.clone());
        if let Some((_, delay)) = self.delays.iter().find(|(p, _)| request.url.ends_with(p)) {
            tokio::time::sleep(*delay).await;
        }
        (self.handler)(request)
    }
}

/// Memory store whose writes can be made to fail on demand.
#[derive(Default)]
pub struct FlakyStore {
    inner: MemoryStore,
    fail_writes: AtomicBool,
}

impl FlakyStore {
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

impl CredentialStore for FlakyStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.inner.get(key)
    }

    fn set(&self, key: &str, value: &str, durability: Durability) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("simulated write failure".to_string()));
        }
        self.inner.set(key, value, durability)
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.inner.delete(key)
    }
}

pub fn test_config() -> Config {
    Config {
        base_url: BASE_URL.to_string(),
        issue_path: ISSUE_PATH.to_string(),
        reissue_path: REISSUE_PATH.to_string(),
        ..Config::default()
    }
}

/// Unsigned compact token with the given subject and a far-future expiry
pub fn jwt(subject: &str) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let claims = serde_json::json!({"sub": subject, "exp": 4_102_444_800u64});
    let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims).unwrap());
    format!("{header}.{payload}.c2lnbmF0dXJl")
}

pub fn json_response(status: StatusCode, body: serde_json::Value) -> HttpResponse {
    HttpResponse::new(status, serde_json::to_vec(&body).unwrap())
}

pub fn token_response(access: &str, refresh: &str) -> HttpResponse {
    json_response(
        StatusCode::OK,
        serde_json::json!({"token": access, "refreshToken": refresh}),
    )
}

/// Write a token record and flag directly, bypassing the session manager
pub fn seed(
    store: &dyn CredentialStore,
    access: Option<&str>,
    refresh: Option<&str>,
    reauth: bool,
) {
    let credentials = StoredCredentials {
        access: access.map(AccessToken::new),
        refresh: refresh.map(crate::auth::RefreshToken::new),
    };
    store
        .set(
            TOKENS_KEY,
            &serde_json::to_string(&credentials).unwrap(),
            Durability::AfterFirstUnlock,
        )
        .unwrap();
    if reauth {
        store
            .set(REAUTH_KEY, "true", Durability::AfterFirstUnlock)
            .unwrap();
    }
}

/// Stored token record, read straight from the store
pub fn stored(store: &dyn CredentialStore) -> StoredCredentials {
    store
        .get(TOKENS_KEY)
        .unwrap()
        .map(|json| serde_json::from_str(&json).unwrap())
        .unwrap_or_default()
}

pub fn session(transport: Arc<MockTransport>, store: Arc<dyn CredentialStore>) -> SessionManager {
    SessionManager::new(&test_config(), transport, store).unwrap()
}
