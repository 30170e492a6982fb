// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Shared HTTP plumbing for the vendor adapters.

use std::time::Duration;

use reqwest::{Client, Response, StatusCode};

use super::traits::{AuthError, FetchError};

const USER_AGENT: &str = concat!("telemetry-sync/", env!("CARGO_PKG_VERSION"));

// Vendor error pages can be large; keep log lines readable
const MAX_BODY_IN_ERROR: usize = 512;

/// Build the client an adapter uses for its whole lifetime.
pub(crate) fn client(timeout: Duration, cookies: bool) -> Result<Client, FetchError> {
    Client::builder()
        .timeout(timeout)
        .user_agent(USER_AGENT)
        .cookie_store(cookies)
        .build()
        .map_err(|e| FetchError::Transport(e.to_string()))
}

/// Map a non-2xx data response to a [`FetchError`].
pub(crate) async fn check_status(response: Response) -> Result<Response, FetchError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(FetchError::Unauthorized);
    }
    let body = truncated_body(response).await;
    Err(FetchError::Status { status: status.as_u16(), body })
}

/// Map a non-2xx authentication response to an [`AuthError`].
pub(crate) async fn check_auth_status(response: Response) -> Result<Response, AuthError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = truncated_body(response).await;
    if status.is_client_error() {
        Err(AuthError::InvalidCredentials(format!("HTTP {}: {}", status.as_u16(), body)))
    } else {
        Err(AuthError::Unreachable(format!("HTTP {}: {}", status.as_u16(), body)))
    }
}

async fn truncated_body(response: Response) -> String {
    let mut body = response.text().await.unwrap_or_default();
    if body.len() > MAX_BODY_IN_ERROR {
        let mut cut = MAX_BODY_IN_ERROR;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    body
}
