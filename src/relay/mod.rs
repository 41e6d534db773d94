//! # Translation Relay
//!
//! Joins browser sessions to the single upstream backend connection.
//!
//! ## Key Components:
//! - **envelope**: client-facing JSON frames
//! - **registry**: connected sessions and their pending request
//! - **router**: FIFO correlation of backend answers to requests
//!
//! ## Request Flow:
//! 1. A session submits a `TRANSLATE` request
//! 2. Under the submit lock the request takes a FIFO slot, becomes the
//!    session's pending request and goes out on the wire
//! 3. The router pairs the backend's transcription and translation with the
//!    slot whose text the transcript repeats, delivers to the owning session
//!    and persists one record

pub mod envelope;
pub mod registry;
pub mod router;

use crate::config::RelayConfig;
use crate::store::TranslationStore;
use crate::upstream::{TextRequest, UpstreamError, UpstreamLink};
use envelope::TranslateRequest;
use registry::{Outbox, SessionRegistry};
use router::ResultRouter;

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub enum RelayError {
    UnknownSession(String),
    /// The in-flight FIFO is at capacity.
    QueueFull(usize),
    Upstream(UpstreamError),
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayError::UnknownSession(id) => write!(f, "Unknown session: {}", id),
            RelayError::QueueFull(_) => write!(f, "Too many translation requests in flight"),
            RelayError::Upstream(e) => write!(f, "Translation backend error: {}", e),
        }
    }
}

impl std::error::Error for RelayError {}

impl From<UpstreamError> for RelayError {
    fn from(error: UpstreamError) -> Self {
        RelayError::Upstream(error)
    }
}

/// Running totals for the health endpoint.
#[derive(Debug, Default)]
pub struct RelayStats {
    sessions_opened: AtomicU64,
    requests_submitted: AtomicU64,
    requests_failed: AtomicU64,
    requests_abandoned: AtomicU64,
    results_delivered: AtomicU64,
    results_undelivered: AtomicU64,
    results_unmatched: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RelayStatsSnapshot {
    pub sessions_opened: u64,
    pub requests_submitted: u64,
    pub requests_failed: u64,
    pub requests_abandoned: u64,
    pub results_delivered: u64,
    pub results_undelivered: u64,
    pub results_unmatched: u64,
}

impl RelayStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_session(&self) {
        Self::bump(&self.sessions_opened);
    }

    pub fn record_submitted(&self) {
        Self::bump(&self.requests_submitted);
    }

    pub fn record_failed(&self) {
        Self::bump(&self.requests_failed);
    }

    pub fn record_abandoned(&self) {
        Self::bump(&self.requests_abandoned);
    }

    pub fn record_delivered(&self) {
        Self::bump(&self.results_delivered);
    }

    pub fn record_undelivered(&self) {
        Self::bump(&self.results_undelivered);
    }

    pub fn record_unmatched(&self) {
        Self::bump(&self.results_unmatched);
    }

    pub fn snapshot(&self) -> RelayStatsSnapshot {
        RelayStatsSnapshot {
            sessions_opened: self.sessions_opened.load(Ordering::Relaxed),
            requests_submitted: self.requests_submitted.load(Ordering::Relaxed),
            requests_failed: self.requests_failed.load(Ordering::Relaxed),
            requests_abandoned: self.requests_abandoned.load(Ordering::Relaxed),
            results_delivered: self.results_delivered.load(Ordering::Relaxed),
            results_undelivered: self.results_undelivered.load(Ordering::Relaxed),
            results_unmatched: self.results_unmatched.load(Ordering::Relaxed),
        }
    }
}

pub struct Relay {
    registry: Arc<SessionRegistry>,
    router: Arc<ResultRouter>,
    link: Arc<UpstreamLink>,
    store: Arc<dyn TranslationStore>,
    stats: Arc<RelayStats>,
    /// Serializes enqueue-and-send so FIFO order matches wire order.
    submit_lock: Mutex<()>,
}

impl Relay {
    /// Build the relay and install its router as the link's only handler.
    pub fn new(
        link: Arc<UpstreamLink>,
        store: Arc<dyn TranslationStore>,
        config: &RelayConfig,
    ) -> Self {
        let registry = Arc::new(SessionRegistry::new());
        let stats = Arc::new(RelayStats::default());
        let router = Arc::new(ResultRouter::new(
            registry.clone(),
            store.clone(),
            stats.clone(),
            config.max_in_flight,
        ));
        link.on_message(router.clone());

        Self {
            registry,
            router,
            link,
            store,
            stats,
            submit_lock: Mutex::new(()),
        }
    }

    /// Register a new client session that receives envelopes on `outbox`.
    pub fn open_session(&self, outbox: Outbox) -> String {
        loop {
            let session_id = Uuid::new_v4().to_string();
            if self.registry.register(&session_id, outbox.clone()) {
                self.stats.record_session();
                info!(%session_id, sessions = self.registry.len(), "Client session opened");
                return session_id;
            }
        }
    }

    /// Forward a translation request upstream on behalf of a session.
    ///
    /// The request replaces whatever the session was waiting on. If it cannot
    /// be written it stops being pending and the error is returned.
    pub async fn submit(
        &self,
        session_id: &str,
        request: TranslateRequest,
    ) -> Result<Uuid, RelayError> {
        let _guard = self.submit_lock.lock().await;

        if !self.registry.is_open(session_id) {
            return Err(RelayError::UnknownSession(session_id.to_string()));
        }

        let request_id = Uuid::new_v4();
        self.router
            .enqueue(session_id, request_id, &request.original_text)?;

        match self
            .registry
            .set_pending_timestamp(session_id, request_id, &request.timestamp)
        {
            Ok(Some(previous)) => {
                debug!(%session_id, %previous, "Pending request superseded");
            }
            Ok(None) => {}
            Err(e) => {
                self.router.cancel(request_id);
                return Err(e);
            }
        }

        let text = TextRequest {
            text: request.original_text,
            source_language: request.source_lang,
            target_language: request.target_lang,
        };

        if let Err(e) = self.link.send_text(&text).await {
            // A failed write may still reach the backend. The link drops that
            // connection and the router abandons every slot sent on it.
            if !matches!(e, UpstreamError::SendFailed(_)) {
                self.router.cancel(request_id);
            }
            self.registry.take_pending(session_id, request_id);
            self.stats.record_failed();
            warn!(%session_id, error = %e, "Translation request not forwarded");
            return Err(e.into());
        }

        self.stats.record_submitted();
        debug!(
            %session_id,
            %request_id,
            source = %text.source_language,
            target = %text.target_language,
            "Translation request forwarded"
        );
        Ok(request_id)
    }

    /// Forward a base64 audio chunk upstream. Its transcription and
    /// translation arrive without a requesting session and are only persisted.
    pub async fn send_audio(&self, data: String) -> Result<(), RelayError> {
        let _guard = self.submit_lock.lock().await;
        self.link.send_audio(data).await?;
        Ok(())
    }

    /// Stop delivering to a session and forget it. Its in-flight requests
    /// keep their FIFO slots so later answers still line up.
    pub fn close_session(&self, session_id: &str) {
        if let Some(session) = self.registry.remove(session_id) {
            let connected_secs = (chrono::Utc::now() - session.connected_at).num_seconds();
            info!(
                %session_id,
                connected_secs,
                sessions = self.registry.len(),
                "Client session closed"
            );
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn link(&self) -> &Arc<UpstreamLink> {
        &self.link
    }

    pub fn store(&self) -> &Arc<dyn TranslationStore> {
        &self.store
    }

    pub fn stats(&self) -> RelayStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn in_flight(&self) -> usize {
        self.router.in_flight()
    }
}
