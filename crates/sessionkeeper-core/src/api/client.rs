//! Caller-facing client for authenticated endpoints.
//!
//! Business APIs build a request here, and every send goes through a fresh
//! [`RequestInterceptor`]. Callers get back a decoded value or an [`ApiError`],
//! never raw status codes.

use std::sync::Arc;

use anyhow::{Context, Result};
use reqwest::header::{self, HeaderValue};
use reqwest::Method;
use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;

use super::interceptor::RequestInterceptor;
use super::transport::{HttpRequest, HttpResponse, ReqwestTransport, Transport};
use super::ApiError;
use crate::auth::{CredentialStore, SessionManager};
use crate::config::Config;

/// API client bound to one session.
/// Clone is cheap - the transport and session are shared.
#[derive(Clone)]
pub struct ApiClient {
    transport: Arc<dyn Transport>,
    session: SessionManager,
    config: Arc<Config>,
}

impl ApiClient {
    /// Create a client over the reqwest transport
    pub fn new(config: Config, store: Arc<dyn CredentialStore>) -> Result<Self> {
        let transport = ReqwestTransport::new(config.request_timeout())
            .context("Failed to build HTTP client")?;
        Self::with_transport(config, Arc::new(transport), store)
    }

    pub fn with_transport(
        config: Config,
        transport: Arc<dyn Transport>,
        store: Arc<dyn CredentialStore>,
    ) -> Result<Self> {
        let session = SessionManager::new(&config, Arc::clone(&transport), store)
            .context("Failed to load stored session")?;
        Ok(Self {
            transport,
            session,
            config: Arc::new(config),
        })
    }

    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Build an authenticated request for `path`.
    ///
    /// Without a token yet the Authorization header carries only the scheme;
    /// the interceptor fills in the token once one has been issued.
    pub fn request(&self, method: Method, path: &str) -> Result<HttpRequest, ApiError> {
        let request = HttpRequest::new(method, self.config.endpoint(path));
        match self.session.access_token() {
            Some(token) => request
                .bearer_auth(&token)
                .map_err(|e| ApiError::from_transport(&e)),
            None => {
                let mut request = request;
                request
                    .headers
                    .insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer"));
                Ok(request)
            }
        }
    }

    /// Send through a fresh interceptor
    pub async fn send(&self, request: HttpRequest) -> Result<HttpResponse, ApiError> {
        let mut interceptor = RequestInterceptor::from_config(self.session.clone(), &self.config);
        let result = interceptor.execute(&*self.transport, request).await;
        debug!(
            retries = interceptor.retries_executed(),
            tried_refresh = interceptor.tried_refresh(),
            ok = result.is_ok(),
            "Request finished"
        );
        result
    }

    /// Send and decode a JSON success body
    pub async fn send_json<T: DeserializeOwned>(
        &self,
        request: HttpRequest,
    ) -> Result<T, ApiError> {
        let url = request.url.clone();
        let response = self.send(request).await?;
        serde_json::from_slice(&response.body).map_err(|e| {
            ApiError::Response(format!("Failed to parse JSON response from {}: {}", url, e))
        })
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let request = self.request(Method::GET, path)?;
        self.send_json(request).await
    }

    pub async fn post<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        let request = self
            .request(Method::POST, path)?
            .json(body)
            .map_err(|e| ApiError::from_transport(&e))?;
        self.send_json(request).await
    }
}
