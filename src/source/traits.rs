// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use async_trait::async_trait;
use thiserror::Error;

use crate::record::{NullPolicy, Record, StreamDescriptor};
use crate::window::FetchWindow;

/// Credential produced by [`SourceAdapter::authenticate`] and passed back to
/// every later call of the same run.
#[derive(Clone)]
pub enum Credential {
    /// OAuth access token
    Bearer(String),
    /// Session cookie held by the adapter's HTTP client
    Session,
    /// Source needs no credential
    None,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credential::Bearer(_) => f.write_str("Bearer(***)"),
            Credential::Session => f.write_str("Session"),
            Credential::None => f.write_str("None"),
        }
    }
}

impl Credential {
    /// Bearer token or an `Unauthorized` fetch error.
    pub fn bearer(&self) -> Result<&str, FetchError> {
        match self {
            Credential::Bearer(token) => Ok(token),
            _ => Err(FetchError::Unauthorized),
        }
    }
}

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Invalid credentials: {0}")]
    InvalidCredentials(String),
    #[error("Authentication endpoint unreachable: {0}")]
    Unreachable(String),
    #[error("Unexpected authentication response: {0}")]
    Protocol(String),
}

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Request timed out")]
    Timeout,
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("Credential rejected")]
    Unauthorized,
    #[error("Malformed payload: {0}")]
    Malformed(String),
}

impl FetchError {
    /// Transport failures, timeouts, 5xx and 429 are worth another attempt.
    /// Everything else fails the same way twice.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Transport(_) | FetchError::Timeout => true,
            FetchError::Status { status, .. } => *status >= 500 || *status == 429,
            FetchError::Unauthorized | FetchError::Malformed(_) => false,
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            FetchError::Timeout
        } else if e.is_decode() {
            FetchError::Malformed(e.to_string())
        } else if let Some(status) = e.status() {
            FetchError::Status { status: status.as_u16(), body: e.to_string() }
        } else {
            FetchError::Transport(e.to_string())
        }
    }
}

impl From<reqwest::Error> for AuthError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() || e.is_timeout() || e.is_request() {
            AuthError::Unreachable(e.to_string())
        } else {
            AuthError::Protocol(e.to_string())
        }
    }
}

/// One vendor API.
///
/// Implementations must be safe to share across the stream workers of a run:
/// `fetch` is called concurrently for different streams.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Short source name, used for logging, metrics and the catalog collection.
    fn name(&self) -> &str;

    /// How vendor nulls become record fields.
    fn null_policy(&self) -> NullPolicy;

    async fn authenticate(&self) -> Result<Credential, AuthError>;

    async fn list_streams(&self, credential: &Credential) -> Result<Vec<StreamDescriptor>, FetchError>;

    /// Records with `window.from <= timestamp < window.to`, timestamps in UTC.
    async fn fetch(
        &self,
        credential: &Credential,
        stream: &StreamDescriptor,
        window: FetchWindow,
    ) -> Result<Vec<Record>, FetchError>;
}
