//! Per-request token attachment and retry policy.
//!
//! A [`RequestInterceptor`] lives for exactly one logical request. Each pass
//! through [`RequestInterceptor::execute`] adapts the request (attach or mint
//! the bearer token), sends it and, on failure, asks the retry policy what to
//! do next. Every retry advances `retries_executed`, so a request is sent at
//! most `max_retries + 1` times.

use std::time::Duration;

use reqwest::StatusCode;
use tracing::{debug, warn};

use super::error::ApiError;
use super::transport::{HttpRequest, HttpResponse, Transport, TransportError};
use crate::auth::SessionManager;
use crate::config::Config;

/// What to do after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry(Duration),
    DoNotRetry,
}

/// Why an attempt failed
#[derive(Debug, Clone)]
pub enum Failure {
    /// Rejected while adapting; nothing was sent.
    Adapt(ApiError),
    /// Sent, but no HTTP response came back.
    Transport(TransportError),
    /// Non-success HTTP response.
    Status(HttpResponse),
}

impl Failure {
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Failure::Status(response) => Some(response.status),
            _ => None,
        }
    }

    /// Classified cause known before any response was seen
    pub fn cause(&self) -> Option<&ApiError> {
        match self {
            Failure::Adapt(err) => Some(err),
            _ => None,
        }
    }

    pub fn is_trust_failure(&self) -> bool {
        matches!(self, Failure::Transport(err) if err.is_trust_failure())
    }

    /// Classify into the caller-facing taxonomy
    pub fn into_error(self) -> ApiError {
        match self {
            Failure::Adapt(err) => err,
            Failure::Transport(err) => ApiError::from_transport(&err),
            Failure::Status(response) => ApiError::from_response(response.status, &response.body),
        }
    }
}

pub struct RequestInterceptor {
    session: SessionManager,
    max_retries: u32,
    retry_delay: Duration,
    retries_executed: u32,
    tried_refresh: bool,
    /// Bearer token carried by the most recent send
    sent_token: Option<String>,
}

impl RequestInterceptor {
    pub fn new(session: SessionManager, max_retries: u32, retry_delay: Duration) -> Self {
        Self {
            session,
            max_retries,
            retry_delay,
            retries_executed: 0,
            tried_refresh: false,
            sent_token: None,
        }
    }

    pub fn from_config(session: SessionManager, config: &Config) -> Self {
        Self::new(session, config.max_retries, config.retry_delay())
    }

    pub fn retries_executed(&self) -> u32 {
        self.retries_executed
    }

    pub fn tried_refresh(&self) -> bool {
        self.tried_refresh
    }

    /// Send `request` until it succeeds or the retry policy gives up.
    ///
    /// Dropping the returned future stops further sends. An issuance it was
    /// waiting on still completes for the other requests sharing it.
    pub async fn execute(
        &mut self,
        transport: &dyn Transport,
        mut request: HttpRequest,
    ) -> Result<HttpResponse, ApiError> {
        loop {
            let failure = match self.adapt(&mut request).await {
                Err(e) => Failure::Adapt(e),
                Ok(()) => {
                    self.sent_token = request.bearer_token().map(String::from);
                    match transport.send(&request).await {
                        Ok(response) if response.is_success() => return Ok(response),
                        Ok(response) => Failure::Status(response),
                        Err(e) => Failure::Transport(e),
                    }
                }
            };

            match self.retry(&failure).await {
                RetryDecision::Retry(delay) => {
                    debug!(
                        url = %request.url,
                        retry = self.retries_executed,
                        delay_ms = delay.as_millis() as u64,
                        "Retrying request"
                    );
                    tokio::time::sleep(delay).await;
                }
                RetryDecision::DoNotRetry => return Err(failure.into_error()),
            }
        }
    }

    /// Prepare `request` for sending.
    pub async fn adapt(&mut self, request: &mut HttpRequest) -> Result<(), ApiError> {
        if self.session.renewal_blocked() {
            debug!(url = %request.url, "Reauthentication pending, request not sent");
            return Err(ApiError::TokenExpired);
        }

        if !self.session.has_refresh_token() && self.session.access_token().is_some() {
            debug!("No refresh token yet, issuing tokens before send");
            match self.session.issue_tokens().await {
                Ok(pair) => request
                    .set_bearer(&pair.access)
                    .map_err(|e| ApiError::from_transport(&e))?,
                Err(e) => {
                    warn!(error = %e, "Token issuance before send failed, sending as is");
                }
            }
        } else if request.has_authorization() {
            if let Some(token) = self.session.access_token() {
                request
                    .set_bearer(&token)
                    .map_err(|e| ApiError::from_transport(&e))?;
            }
        }

        Ok(())
    }

    /// Decide what follows a failed attempt.
    pub async fn retry(&mut self, failure: &Failure) -> RetryDecision {
        if self.retries_executed >= self.max_retries {
            debug!(retries = self.retries_executed, "Retry budget exhausted");
            return RetryDecision::DoNotRetry;
        }

        if matches!(failure.cause(), Some(ApiError::TokenExpired)) {
            self.retries_executed = self.max_retries;
            return RetryDecision::DoNotRetry;
        }

        let auth_rejected = matches!(failure.status().map(|s| s.as_u16()), Some(401) | Some(403));

        if !auth_rejected {
            if failure.is_trust_failure() {
                warn!("Trust evaluation failed, not retrying");
                return RetryDecision::DoNotRetry;
            }
            self.retries_executed += 1;
            return RetryDecision::Retry(self.retry_delay);
        }

        if self.tried_refresh {
            debug!("Authorization rejected after refresh, giving up");
            return RetryDecision::DoNotRetry;
        }

        self.tried_refresh = true;
        self.retries_executed += 1;

        if self.token_rotated_since_send() {
            debug!("Token already rotated by another request, resending");
            return RetryDecision::Retry(self.retry_delay);
        }

        // TokenExpired also resends: the next adapt refuses and surfaces it.
        match self.session.issue_tokens().await {
            Ok(_) | Err(ApiError::TokenExpired) => RetryDecision::Retry(self.retry_delay),
            Err(e) => {
                warn!(error = %e, "Token issuance after rejection failed");
                RetryDecision::DoNotRetry
            }
        }
    }

    fn token_rotated_since_send(&self) -> bool {
        match (&self.sent_token, self.session.access_token()) {
            (Some(sent), Some(current)) => sent != current.as_str(),
            _ => false,
        }
    }
}
