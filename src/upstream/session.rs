//! Backend session creation.
//!
//! Before opening a WebSocket the backend wants an HTTP call that returns the
//! socket URL and a per-session publisher token.

use super::UpstreamError;
use crate::config::UpstreamConfig;
use serde::Deserialize;
use serde_json::json;
use tracing::info;

/// Response of the session-storage endpoint.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BackendSession {
    pub id: String,
    pub ws_url: String,
    pub publisher: String,
}

impl BackendSession {
    /// WebSocket URL with the publisher token attached.
    pub fn connect_url(&self) -> String {
        let separator = if self.ws_url.contains('?') { '&' } else { '?' };
        format!("{}{}token={}", self.ws_url, separator, self.publisher)
    }
}

/// Create a backend session with the configured client credentials.
pub async fn create_session(
    http: &reqwest::Client,
    config: &UpstreamConfig,
) -> Result<BackendSession, UpstreamError> {
    let response = http
        .post(&config.session_url)
        .header("ClientId", &config.client_id)
        .header("ClientSecret", &config.client_secret)
        .json(&json!({
            "data": {
                "subscriber_count": 0,
                "publisher_can_subscribe": true
            }
        }))
        .timeout(config.connect_timeout())
        .send()
        .await
        .map_err(|e| UpstreamError::SessionCreation(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        return Err(UpstreamError::SessionCreation(format!(
            "session endpoint returned {}",
            status
        )));
    }

    let session: BackendSession = response
        .json()
        .await
        .map_err(|e| UpstreamError::SessionCreation(format!("invalid session response: {}", e)))?;

    info!(backend_session = %session.id, "Created translation backend session");
    Ok(session)
}
