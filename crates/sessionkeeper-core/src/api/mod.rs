//! Authenticated request plumbing.
//!
//! This module provides the `ApiClient` callers use, the per-request
//! `RequestInterceptor` that attaches bearer tokens and decides on retries,
//! the `Transport` boundary and the `ApiError` taxonomy every outcome is
//! classified into.

pub mod client;
pub mod error;
pub mod interceptor;
pub mod transport;

pub use client::ApiClient;
pub use error::ApiError;
pub use interceptor::{Failure, RequestInterceptor, RetryDecision};
pub use transport::{HttpRequest, HttpResponse, ReqwestTransport, Transport, TransportError};
