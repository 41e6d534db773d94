//! # Configuration Management
//!
//! This module loads the relay configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `HOST` / `PORT` (deployment platforms)
//! 2. Environment variables (`APP_SERVER__PORT`, `APP_UPSTREAM__CLIENT_ID`, ...)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)
//!
//! Nested keys are separated by a double underscore so that field names which
//! contain an underscore (`client_id`, `reconnect_delay_ms`) survive intact.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Main application configuration that contains all settings.
///
/// ## Sections:
/// - **server**: where the HTTP/WebSocket listener binds
/// - **upstream**: how to reach and configure the translation backend
/// - **relay**: limits and timers for client sessions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    pub relay: RelayConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Translation backend settings.
///
/// ## Connection modes:
/// - `ws_url` empty: create a backend session through `session_url` using the
///   client credentials, then open the returned WebSocket URL with its token
/// - `ws_url` set: connect straight to that URL (local backends, tests)
///
/// ## Pipeline:
/// `source_language`, `target_language` and the audio fields are sent once per
/// connection in the pipeline-configuration message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    pub session_url: String,
    pub ws_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub source_language: String,
    pub target_language: String,
    pub audio_format: String,
    pub sample_rate: u32,
    pub channels: u16,
    /// Fixed wait between a lost connection and the next attempt.
    pub reconnect_delay_ms: u64,
    pub connect_timeout_secs: u64,
    pub send_timeout_secs: u64,
}

/// Client session settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Upper bound on translation requests waiting for a backend answer,
    /// across all sessions.
    pub max_in_flight: usize,
    pub heartbeat_interval_secs: u64,
    pub client_timeout_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            upstream: UpstreamConfig {
                session_url: "https://api.palabra.ai/session-storage/session".to_string(),
                ws_url: String::new(),
                client_id: String::new(),
                client_secret: String::new(),
                source_language: "en".to_string(),
                target_language: "es".to_string(),
                audio_format: "pcm_s16le".to_string(),
                sample_rate: 24000,
                channels: 1,
                reconnect_delay_ms: 5000,
                connect_timeout_secs: 10,
                send_timeout_secs: 10,
            },
            relay: RelayConfig {
                max_in_flight: 64,
                heartbeat_interval_secs: 30,
                client_timeout_secs: 60,
            },
        }
    }
}

impl UpstreamConfig {
    /// The configured direct WebSocket URL, if any.
    pub fn direct_ws_url(&self) -> Option<&str> {
        let url = self.ws_url.trim();
        if url.is_empty() {
            None
        } else {
            Some(url)
        }
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }
}

impl RelayConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout_secs)
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__PORT=3000`: Override server port
    /// - `APP_UPSTREAM__CLIENT_ID=...`: Backend credentials
    /// - `APP_UPSTREAM__WS_URL=ws://127.0.0.1:9000`: Skip session creation
    /// - `PORT=3000`: Special case for deployment platforms
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - Server port is not 0
    /// - The backend is reachable somehow: either a direct URL, or a session
    ///   URL plus both credentials
    /// - Languages are set
    /// - Timers and the in-flight bound are non-zero
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        let upstream = &self.upstream;
        if upstream.direct_ws_url().is_none() {
            if upstream.session_url.trim().is_empty() {
                return Err(anyhow::anyhow!(
                    "Either upstream.ws_url or upstream.session_url must be set"
                ));
            }
            if upstream.client_id.is_empty() || upstream.client_secret.is_empty() {
                return Err(anyhow::anyhow!(
                    "upstream.client_id and upstream.client_secret are required for session creation"
                ));
            }
        }

        if upstream.source_language.is_empty() || upstream.target_language.is_empty() {
            return Err(anyhow::anyhow!("Source and target languages must be set"));
        }

        if upstream.reconnect_delay_ms == 0 {
            return Err(anyhow::anyhow!("Reconnect delay must be greater than 0"));
        }

        if upstream.connect_timeout_secs == 0 || upstream.send_timeout_secs == 0 {
            return Err(anyhow::anyhow!("Upstream timeouts must be greater than 0"));
        }

        if self.relay.max_in_flight == 0 {
            return Err(anyhow::anyhow!("Max in-flight requests must be greater than 0"));
        }

        if self.relay.heartbeat_interval_secs == 0
            || self.relay.client_timeout_secs <= self.relay.heartbeat_interval_secs
        {
            return Err(anyhow::anyhow!(
                "Client timeout must be longer than a non-zero heartbeat interval"
            ));
        }

        Ok(())
    }
}
