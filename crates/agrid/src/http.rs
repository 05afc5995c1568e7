//! Shared reqwest plumbing for the upstream clients.

use agri_common::{AgriError, AgriResult, Stage};
use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use std::time::Duration;

/// Build an HTTP client with a transport timeout
pub(crate) fn build_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(concat!("agrid/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("Failed to build HTTP client")
}

/// Map a transport failure; timeouts count as cancellation
pub(crate) fn transport_error(stage: Stage, err: reqwest::Error) -> AgriError {
    if err.is_timeout() {
        AgriError::cancelled(stage)
    } else {
        AgriError::upstream(stage, format!("request failed: {}", err))
    }
}

/// Require HTTP 200 and decode the JSON body
pub(crate) async fn expect_json<T: DeserializeOwned>(
    stage: Stage,
    response: reqwest::Response,
) -> AgriResult<T> {
    let status = response.status();
    if status != reqwest::StatusCode::OK {
        let body = response.text().await.unwrap_or_default();
        return Err(AgriError::upstream(
            stage,
            format!("HTTP {}: {}", status.as_u16(), truncate(&body, 200)),
        ));
    }

    response
        .json::<T>()
        .await
        .map_err(|e| AgriError::upstream(stage, format!("malformed response body: {}", e)))
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
