//! Token issuance and session state ownership.
//!
//! `SessionManager` is the only writer of the credential store. It runs the
//! two issuance flows:
//!
//! - bootstrap: no refresh token yet, ask the issuer for a fresh pair
//! - reissue: exchange the stored refresh token and the access token's
//!   subject for a new pair
//!
//! Concurrent callers of [`SessionManager::issue_tokens`] share one in-flight
//! issuance. The work runs on its own task, so a caller that gives up waiting
//! does not cancel the issuance the other waiters depend on.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::credentials::{CredentialStore, Durability, StoreError, REAUTH_KEY, TOKENS_KEY};
use super::state::{SessionState, StoredCredentials};
use super::token::{AccessToken, RefreshToken, TokenPair};
use crate::api::{ApiError, HttpRequest, Transport};
use crate::config::Config;

/// Stored value of the reauthentication flag when raised
const FLAG_SET: &str = "true";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IssueResponse {
    token: String,
    refresh_token: String,
}

#[derive(Debug, Serialize)]
struct ReissueRequest<'a> {
    subject: &'a str,
    refresh: &'a str,
}

type IssueOutcome = Shared<BoxFuture<'static, Result<TokenPair, ApiError>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlightKind {
    Bootstrap,
    Reissue,
}

struct Flight {
    id: u64,
    kind: FlightKind,
    outcome: IssueOutcome,
}

#[derive(Default)]
struct Snapshot {
    credentials: StoredCredentials,
    reauth_needed: bool,
}

struct Inner {
    transport: Arc<dyn Transport>,
    store: Arc<dyn CredentialStore>,
    issue_url: String,
    reissue_url: String,
    snapshot: RwLock<Snapshot>,
    in_flight: Mutex<Option<Flight>>,
    next_flight: AtomicU64,
}

/// Clears the in-flight slot when the issuance task ends, even by panic.
struct FlightGuard {
    inner: Arc<Inner>,
    id: u64,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        let mut slot = self
            .inner
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().map(|f| f.id) == Some(self.id) {
            *slot = None;
        }
    }
}

/// Process-wide session handle.
/// Clone is cheap - all clones share the same state and in-flight issuance.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    /// Create a manager, loading the persisted tokens and flag from `store`.
    pub fn new(
        config: &Config,
        transport: Arc<dyn Transport>,
        store: Arc<dyn CredentialStore>,
    ) -> Result<Self, StoreError> {
        // An unreadable record is replaced by the next bootstrap.
        let credentials = match store.get(TOKENS_KEY)? {
            Some(json) => serde_json::from_str(&json).unwrap_or_else(|e| {
                warn!(error = %e, "Stored session tokens are unreadable, starting over");
                StoredCredentials::default()
            }),
            None => StoredCredentials::default(),
        };
        let reauth_needed = store.get(REAUTH_KEY)?.as_deref() == Some(FLAG_SET);

        debug!(
            has_access = credentials.access.is_some(),
            has_refresh = credentials.refresh.is_some(),
            reauth_needed,
            "Loaded session"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                transport,
                store,
                issue_url: config.endpoint(&config.issue_path),
                reissue_url: config.endpoint(&config.reissue_path),
                snapshot: RwLock::new(Snapshot {
                    credentials,
                    reauth_needed,
                }),
                in_flight: Mutex::new(None),
                next_flight: AtomicU64::new(0),
            }),
        })
    }

    /// Obtain a fresh token pair, bootstrapping or reissuing as the stored
    /// state requires.
    ///
    /// Fails with [`ApiError::TokenExpired`] without touching the network when
    /// reauthentication is pending. Any reissue failure raises the
    /// reauthentication flag and also reports `TokenExpired`.
    pub async fn issue_tokens(&self) -> Result<TokenPair, ApiError> {
        let outcome = self.join_or_start_flight();
        outcome.await
    }

    fn join_or_start_flight(&self) -> IssueOutcome {
        let mut slot = self
            .inner
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(ref flight) = *slot {
            debug!(flight = flight.id, "Joining in-flight token issuance");
            return flight.outcome.clone();
        }

        let id = self.inner.next_flight.fetch_add(1, Ordering::Relaxed);
        let kind = if self.inner.read().credentials.refresh.is_some() {
            FlightKind::Reissue
        } else {
            FlightKind::Bootstrap
        };

        // The task cannot clear the slot before it is filled: we hold the lock.
        let guard = FlightGuard {
            inner: Arc::clone(&self.inner),
            id,
        };
        let handle = tokio::spawn(async move {
            let result = guard.inner.run_issue().await;
            drop(guard);
            result
        });

        let outcome = async move {
            handle.await.unwrap_or_else(|e| {
                error!(error = %e, "Token issuance task failed");
                Err(ApiError::Unknown(format!("Token issuance task failed: {}", e)))
            })
        }
        .boxed()
        .shared();

        *slot = Some(Flight {
            id,
            kind,
            outcome: outcome.clone(),
        });
        outcome
    }

    /// Current session state
    pub fn state(&self) -> SessionState {
        let bootstrapping = self
            .inner
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|f| f.kind == FlightKind::Bootstrap)
            .unwrap_or(false);
        let snapshot = self.inner.read();

        if snapshot.reauth_needed {
            SessionState::ReauthRequired
        } else if bootstrapping {
            SessionState::Bootstrapping
        } else if snapshot.credentials.pair().is_some() {
            SessionState::Authenticated
        } else {
            SessionState::NoCredentials
        }
    }

    pub fn access_token(&self) -> Option<AccessToken> {
        self.inner.read().credentials.access.clone()
    }

    pub fn has_refresh_token(&self) -> bool {
        self.inner.read().credentials.refresh.is_some()
    }

    pub fn reauth_needed(&self) -> bool {
        self.inner.read().reauth_needed
    }

    /// True when the stored refresh token must not be used: reauthentication
    /// is pending and there is a refresh token it applies to.
    pub fn renewal_blocked(&self) -> bool {
        let snapshot = self.inner.read();
        snapshot.reauth_needed && snapshot.credentials.refresh.is_some()
    }

    /// Subject of the current access token
    pub fn subject(&self) -> Option<String> {
        self.access_token().and_then(|t| t.subject())
    }

    /// Expiry of the current access token
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.access_token().and_then(|t| t.expires_at())
    }

    /// Install tokens obtained by full re-registration and clear the
    /// reauthentication flag.
    pub fn install_tokens(&self, pair: TokenPair) -> Result<(), StoreError> {
        self.inner.persist(&pair)?;
        info!("Installed tokens from re-registration");
        Ok(())
    }

    /// Forget both tokens and the reauthentication flag.
    pub fn reset(&self) -> Result<(), StoreError> {
        let mut snapshot = self.inner.write();
        self.inner.store.delete(TOKENS_KEY)?;
        snapshot.credentials = StoredCredentials::default();
        self.inner.store.delete(REAUTH_KEY)?;
        snapshot.reauth_needed = false;
        info!("Session reset");
        Ok(())
    }
}

impl Inner {
    fn read(&self) -> RwLockReadGuard<'_, Snapshot> {
        self.snapshot.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Snapshot> {
        self.snapshot.write().unwrap_or_else(PoisonError::into_inner)
    }

    async fn run_issue(&self) -> Result<TokenPair, ApiError> {
        let (credentials, reauth_needed) = {
            let snapshot = self.read();
            (snapshot.credentials.clone(), snapshot.reauth_needed)
        };

        let Some(refresh) = credentials.refresh else {
            return self.bootstrap().await;
        };

        if reauth_needed {
            debug!("Reauthentication pending, refusing silent renewal");
            return Err(ApiError::TokenExpired);
        }

        let Some(subject) = credentials.access.as_ref().and_then(AccessToken::subject) else {
            warn!("Stored access token has no readable subject");
            return Err(ApiError::TokenExpired);
        };

        match self.reissue(&subject, &refresh).await {
            Ok(pair) => {
                self.persist(&pair).map_err(store_failure)?;
                info!("Access token reissued");
                Ok(pair)
            }
            Err(e) => {
                warn!(error = %e, "Token reissue failed, reauthentication required");
                self.raise_reauth().map_err(store_failure)?;
                Err(ApiError::TokenExpired)
            }
        }
    }

    async fn bootstrap(&self) -> Result<TokenPair, ApiError> {
        debug!("Bootstrapping session tokens");
        let pair = self.call_issuer(&HttpRequest::post(&self.issue_url)).await?;
        self.persist(&pair).map_err(store_failure)?;
        info!("Session tokens issued");
        Ok(pair)
    }

    async fn reissue(&self, subject: &str, refresh: &RefreshToken) -> Result<TokenPair, ApiError> {
        let body = ReissueRequest {
            subject,
            refresh: refresh.as_str(),
        };
        let request = HttpRequest::post(&self.reissue_url)
            .json(&body)
            .map_err(|e| ApiError::from_transport(&e))?;
        self.call_issuer(&request).await
    }

    async fn call_issuer(&self, request: &HttpRequest) -> Result<TokenPair, ApiError> {
        let response = self
            .transport
            .send(request)
            .await
            .map_err(|e| ApiError::from_transport(&e))?;

        if !response.is_success() {
            return Err(ApiError::from_response(response.status, &response.body));
        }

        let issued: IssueResponse = serde_json::from_slice(&response.body)
            .map_err(|e| ApiError::Response(format!("Failed to parse token response: {}", e)))?;

        Ok(TokenPair {
            access: AccessToken::new(issued.token),
            refresh: RefreshToken::new(issued.refresh_token),
        })
    }

    /// Write both tokens as one record, then clear the flag. Memory follows
    /// the store: nothing changes in memory for a write that failed.
    fn persist(&self, pair: &TokenPair) -> Result<(), StoreError> {
        let credentials = StoredCredentials::from(pair.clone());
        let json = serde_json::to_string(&credentials)?;

        let mut snapshot = self.write();
        self.store
            .set(TOKENS_KEY, &json, Durability::AfterFirstUnlock)?;
        snapshot.credentials = credentials;
        self.store.delete(REAUTH_KEY)?;
        snapshot.reauth_needed = false;
        Ok(())
    }

    /// Block renewal in memory, then persist the flag. The in-memory block
    /// holds for this process even when the write fails.
    fn raise_reauth(&self) -> Result<(), StoreError> {
        let mut snapshot = self.write();
        snapshot.reauth_needed = true;
        self.store
            .set(REAUTH_KEY, FLAG_SET, Durability::AfterFirstUnlock)
    }
}

fn store_failure(err: StoreError) -> ApiError {
    error!(error = %err, "Failed to persist session state");
    ApiError::Unknown(format!("Failed to persist session state: {}", err))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use reqwest::StatusCode;

    use super::*;
    use crate::api::TransportError;
    use crate::auth::MemoryStore;
    use crate::testing::{
        jwt, json_response, seed, session, stored, token_response, FlakyStore, MockTransport,
        ISSUE_PATH, REISSUE_PATH,
    };

    fn issuer() -> Arc<MockTransport> {
        Arc::new(MockTransport::new(|req| {
            if req.url.ends_with(REISSUE_PATH) {
                Ok(token_response(&jwt("user-1"), "refresh-2"))
            } else {
                Ok(token_response(&jwt("user-1"), "refresh-1"))
            }
        }))
    }

    #[tokio::test]
    async fn test_bootstrap_when_no_refresh_token() {
        let transport = issuer();
        let store = Arc::new(MemoryStore::new());
        let session = session(transport.clone(), store.clone());
        assert_eq!(session.state(), SessionState::NoCredentials);

        let pair = session.issue_tokens().await.unwrap();

        assert_eq!(pair.refresh.as_str(), "refresh-1");
        assert_eq!(transport.calls_to(ISSUE_PATH), 1);
        assert_eq!(transport.calls_to(REISSUE_PATH), 0);
        assert!(transport.requests()[0].body.is_none());
        assert_eq!(stored(&*store).pair(), Some(pair));
        assert_eq!(store.durability(TOKENS_KEY), Some(Durability::AfterFirstUnlock));
        assert_eq!(session.state(), SessionState::Authenticated);
        assert_eq!(session.subject().as_deref(), Some("user-1"));
    }

    #[tokio::test]
    async fn test_reissue_when_refresh_token_stored() {
        let transport = issuer();
        let store = Arc::new(MemoryStore::new());
        seed(&*store, Some(&jwt("user-7")), Some("refresh-1"), false);
        let session = session(transport.clone(), store.clone());

        let pair = session.issue_tokens().await.unwrap();

        assert_eq!(pair.refresh.as_str(), "refresh-2");
        assert_eq!(transport.calls_to(ISSUE_PATH), 0);
        assert_eq!(transport.calls_to(REISSUE_PATH), 1);

        let body: serde_json::Value =
            serde_json::from_slice(transport.requests()[0].body.as_deref().unwrap()).unwrap();
        assert_eq!(
            body,
            serde_json::json!({"subject": "user-7", "refresh": "refresh-1"})
        );
        assert_eq!(stored(&*store).refresh.unwrap().as_str(), "refresh-2");
    }

    #[tokio::test]
    async fn test_pending_reauth_blocks_without_network() {
        let transport = issuer();
        let store = Arc::new(MemoryStore::new());
        seed(&*store, Some(&jwt("user-1")), Some("refresh-1"), true);
        let session = session(transport.clone(), store);

        assert_eq!(session.state(), SessionState::ReauthRequired);
        assert!(session.renewal_blocked());
        assert_eq!(session.issue_tokens().await, Err(ApiError::TokenExpired));
        assert_eq!(transport.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_reissue_failure_raises_reauth_and_keeps_tokens() {
        let transport = Arc::new(MockTransport::new(|_| {
            Ok(json_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                serde_json::json!({"message": "boom"}),
            ))
        }));
        let store = Arc::new(MemoryStore::new());
        let access = jwt("user-1");
        seed(&*store, Some(&access), Some("refresh-1"), false);
        let session = session(transport.clone(), store.clone());

        assert_eq!(session.issue_tokens().await, Err(ApiError::TokenExpired));

        assert!(session.reauth_needed());
        assert_eq!(session.state(), SessionState::ReauthRequired);
        assert_eq!(store.get(REAUTH_KEY).unwrap().as_deref(), Some(FLAG_SET));
        let kept = stored(&*store);
        assert_eq!(kept.access.unwrap().as_str(), access);
        assert_eq!(kept.refresh.unwrap().as_str(), "refresh-1");

        // Blocked from now on, no further network calls
        assert_eq!(session.issue_tokens().await, Err(ApiError::TokenExpired));
        assert_eq!(transport.total_calls(), 1);
    }

    #[tokio::test]
    async fn test_bootstrap_failure_is_classified_and_leaves_flag() {
        let transport = Arc::new(MockTransport::new(|_| {
            Ok(json_response(
                StatusCode::BAD_REQUEST,
                serde_json::json!({"message": "nope"}),
            ))
        }));
        let store = Arc::new(MemoryStore::new());
        let session = session(transport, store.clone());

        let err = session.issue_tokens().await.unwrap_err();
        assert!(matches!(err, ApiError::Request(_)));
        assert!(!session.reauth_needed());
        assert_eq!(store.get(TOKENS_KEY).unwrap(), None);
    }

    #[tokio::test]
    async fn test_bootstrap_undecodable_body_is_response_error() {
        let transport = Arc::new(MockTransport::new(|_| {
            Ok(json_response(StatusCode::OK, serde_json::json!({"unexpected": true})))
        }));
        let session = session(transport, Arc::new(MemoryStore::new()));

        assert!(matches!(
            session.issue_tokens().await,
            Err(ApiError::Response(_))
        ));
    }

    #[tokio::test]
    async fn test_bootstrap_transport_failure_is_server_error() {
        let transport = Arc::new(MockTransport::new(|_| Err(TransportError::Timeout)));
        let session = session(transport, Arc::new(MemoryStore::new()));

        assert!(matches!(
            session.issue_tokens().await,
            Err(ApiError::Server(_))
        ));
    }

    #[tokio::test]
    async fn test_bootstrap_with_pending_flag_clears_it() {
        let transport = issuer();
        let store = Arc::new(MemoryStore::new());
        seed(&*store, None, None, true);
        let session = session(transport.clone(), store.clone());

        session.issue_tokens().await.unwrap();

        assert_eq!(transport.calls_to(ISSUE_PATH), 1);
        assert!(!session.reauth_needed());
        assert_eq!(store.get(REAUTH_KEY).unwrap(), None);
    }

    #[tokio::test]
    async fn test_unreadable_subject_is_token_expired() {
        let transport = issuer();
        let store = Arc::new(MemoryStore::new());
        seed(&*store, Some("opaque-token"), Some("refresh-1"), false);
        let session = session(transport.clone(), store);

        assert_eq!(session.issue_tokens().await, Err(ApiError::TokenExpired));
        assert_eq!(transport.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_failed_write_never_leaves_partial_pair() {
        let transport = issuer();
        let store = Arc::new(FlakyStore::default());
        let access = jwt("user-1");
        seed(&*store, Some(&access), Some("refresh-1"), false);
        let session = session(transport, store.clone());

        store.fail_writes(true);
        let err = session.issue_tokens().await.unwrap_err();
        assert!(matches!(err, ApiError::Unknown(_)));

        let kept = stored(&*store);
        assert_eq!(kept.access.unwrap().as_str(), access);
        assert_eq!(kept.refresh.unwrap().as_str(), "refresh-1");
        assert_eq!(session.access_token().unwrap().as_str(), access);

        store.fail_writes(false);
        let pair = session.issue_tokens().await.unwrap();
        assert_eq!(stored(&*store).pair(), Some(pair));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_one_issuance() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let transport = Arc::new(
            MockTransport::new(move |_| {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                Ok(token_response(&jwt("user-1"), &format!("refresh-{n}")))
            })
            .with_delay(REISSUE_PATH, Duration::from_millis(200)),
        );
        let store = Arc::new(MemoryStore::new());
        seed(&*store, Some(&jwt("user-1")), Some("refresh-0"), false);
        let session = session(transport.clone(), store);

        let (a, b, c) = tokio::join!(
            session.issue_tokens(),
            session.issue_tokens(),
            session.issue_tokens()
        );

        assert_eq!(transport.calls_to(REISSUE_PATH), 1);
        assert_eq!(a.clone().unwrap(), b.unwrap());
        assert_eq!(a.unwrap(), c.unwrap());

        // The slot is free again once the flight is over
        session.issue_tokens().await.unwrap();
        assert_eq!(transport.calls_to(REISSUE_PATH), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_waiter_does_not_cancel_issuance() {
        let transport = Arc::new(
            MockTransport::new(|_| Ok(token_response(&jwt("user-1"), "refresh-new")))
                .with_delay(ISSUE_PATH, Duration::from_millis(500)),
        );
        let store = Arc::new(MemoryStore::new());
        let session = session(transport.clone(), store.clone());

        let gave_up =
            tokio::time::timeout(Duration::from_millis(100), session.issue_tokens()).await;
        assert!(gave_up.is_err());
        assert_eq!(session.state(), SessionState::Bootstrapping);

        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(transport.calls_to(ISSUE_PATH), 1);
        assert_eq!(
            stored(&*store).refresh.unwrap().as_str(),
            "refresh-new"
        );
        assert_eq!(session.state(), SessionState::Authenticated);
    }

    #[tokio::test]
    async fn test_install_tokens_clears_reauth() {
        let store = Arc::new(MemoryStore::new());
        seed(&*store, Some(&jwt("user-1")), Some("refresh-1"), true);
        let session = session(issuer(), store.clone());

        session
            .install_tokens(TokenPair {
                access: AccessToken::new(jwt("user-2")),
                refresh: RefreshToken::new("refresh-9"),
            })
            .unwrap();

        assert_eq!(session.state(), SessionState::Authenticated);
        assert_eq!(session.subject().as_deref(), Some("user-2"));
        assert_eq!(store.get(REAUTH_KEY).unwrap(), None);
    }

    #[tokio::test]
    async fn test_reset_forgets_everything() {
        let store = Arc::new(MemoryStore::new());
        seed(&*store, Some(&jwt("user-1")), Some("refresh-1"), true);
        let session = session(issuer(), store.clone());

        session.reset().unwrap();

        assert_eq!(session.state(), SessionState::NoCredentials);
        assert!(session.access_token().is_none());
        assert_eq!(store.get(TOKENS_KEY).unwrap(), None);
        assert_eq!(store.get(REAUTH_KEY).unwrap(), None);
    }

    #[test]
    fn test_corrupt_record_loads_empty_and_resets() {
        let store = Arc::new(MemoryStore::new());
        store
            .set(TOKENS_KEY, "{not json", Durability::AfterFirstUnlock)
            .unwrap();
        store
            .set(REAUTH_KEY, FLAG_SET, Durability::AfterFirstUnlock)
            .unwrap();

        let session = session(issuer(), store.clone());
        assert!(session.access_token().is_none());
        assert!(!session.has_refresh_token());

        session.reset().unwrap();
        assert_eq!(session.state(), SessionState::NoCredentials);
        assert_eq!(store.get(TOKENS_KEY).unwrap(), None);
        assert_eq!(store.get(REAUTH_KEY).unwrap(), None);
    }

    #[tokio::test]
    async fn test_corrupt_record_is_replaced_by_bootstrap() {
        let transport = issuer();
        let store = Arc::new(MemoryStore::new());
        store
            .set(TOKENS_KEY, "[1, 2", Durability::AfterFirstUnlock)
            .unwrap();
        let session = session(transport.clone(), store.clone());

        let pair = session.issue_tokens().await.unwrap();

        assert_eq!(transport.calls_to(ISSUE_PATH), 1);
        assert_eq!(stored(&*store).pair(), Some(pair));
    }

    #[tokio::test]
    async fn test_unpersisted_reauth_flag_is_unknown_but_blocks_in_memory() {
        let transport = Arc::new(MockTransport::new(|_| {
            Ok(json_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                serde_json::json!({"message": "boom"}),
            ))
        }));
        let store = Arc::new(FlakyStore::default());
        seed(&*store, Some(&jwt("user-1")), Some("refresh-1"), false);
        let session = session(transport.clone(), store.clone());

        store.fail_writes(true);
        let err = session.issue_tokens().await.unwrap_err();

        assert!(matches!(err, ApiError::Unknown(_)));
        assert_eq!(store.get(REAUTH_KEY).unwrap(), None);
        assert!(session.renewal_blocked());
        assert_eq!(session.issue_tokens().await, Err(ApiError::TokenExpired));
        assert_eq!(transport.total_calls(), 1);
    }
}
