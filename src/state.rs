//! # Application State
//!
//! Shared by every HTTP handler and WebSocket actor through `web::Data`.
//! Clones are cheap; everything heavy sits behind an `Arc`.

use crate::config::AppConfig;
use crate::relay::Relay;
use std::sync::Arc;
use std::time::Instant;

#[derive(Clone)]
pub struct AppState {
    /// Configuration as loaded at startup. It does not change at runtime.
    pub config: Arc<AppConfig>,

    /// The relay joining client sessions to the translation backend.
    pub relay: Arc<Relay>,

    /// When the server started, for uptime reporting.
    pub start_time: Instant,
}

impl AppState {
    pub fn new(config: AppConfig, relay: Arc<Relay>) -> Self {
        Self {
            config: Arc::new(config),
            relay,
            start_time: Instant::now(),
        }
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
