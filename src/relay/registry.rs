//! # Session Registry
//!
//! Tracks every connected browser client and the one translation request each
//! of them is currently waiting on.
//!
//! ## Thread Safety:
//! Client actors register and remove themselves while the upstream receive
//! task looks sessions up to deliver results. Everything sits behind one
//! `RwLock`; no lock is held across an `.await`.

use super::envelope::ServerEnvelope;
use super::RelayError;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Channel a session's actor drains into its WebSocket.
pub type Outbox = mpsc::UnboundedSender<ServerEnvelope>;

/// The request a session is waiting on.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingRequest {
    pub request_id: Uuid,
    /// Client-supplied timestamp, echoed back verbatim with the result.
    pub timestamp: String,
}

/// One connected browser client.
#[derive(Debug)]
pub struct ClientSession {
    pub session_id: String,
    pub connected_at: DateTime<Utc>,
    pending: Option<PendingRequest>,
    outbox: Outbox,
}

impl ClientSession {
    fn new(session_id: String, outbox: Outbox) -> Self {
        Self {
            session_id,
            connected_at: Utc::now(),
            pending: None,
            outbox,
        }
    }
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, ClientSession>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, ClientSession>> {
        self.sessions.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, ClientSession>> {
        self.sessions.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Add a session with no outstanding request. Returns `false` if the id is
    /// already taken.
    pub fn register(&self, session_id: &str, outbox: Outbox) -> bool {
        let mut sessions = self.write();
        if sessions.contains_key(session_id) {
            return false;
        }
        sessions.insert(
            session_id.to_string(),
            ClientSession::new(session_id.to_string(), outbox),
        );
        true
    }

    /// Record the request a session now waits on, replacing any earlier one.
    ///
    /// Returns the superseded request id, if the slot was occupied.
    pub fn set_pending_timestamp(
        &self,
        session_id: &str,
        request_id: Uuid,
        timestamp: &str,
    ) -> Result<Option<Uuid>, RelayError> {
        let mut sessions = self.write();
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| RelayError::UnknownSession(session_id.to_string()))?;
        let previous = session.pending.replace(PendingRequest {
            request_id,
            timestamp: timestamp.to_string(),
        });
        Ok(previous.map(|p| p.request_id))
    }

    /// Pending timestamp of a session, left in place.
    pub fn resolve(&self, session_id: &str) -> Option<String> {
        self.read()
            .get(session_id)
            .and_then(|s| s.pending.as_ref())
            .map(|p| p.timestamp.clone())
    }

    /// Clear the pending slot if, and only if, it still belongs to
    /// `request_id`, returning its timestamp.
    pub fn take_pending(&self, session_id: &str, request_id: Uuid) -> Option<String> {
        let mut sessions = self.write();
        let session = sessions.get_mut(session_id)?;
        match &session.pending {
            Some(pending) if pending.request_id == request_id => {
                session.pending.take().map(|p| p.timestamp)
            }
            _ => None,
        }
    }

    /// Queue an envelope for a registered session. Returns `false` when the
    /// session is gone or its actor has stopped reading.
    pub fn deliver(&self, session_id: &str, envelope: ServerEnvelope) -> bool {
        match self.read().get(session_id) {
            Some(session) => session.outbox.send(envelope).is_ok(),
            None => false,
        }
    }

    pub fn is_open(&self, session_id: &str) -> bool {
        self.read().contains_key(session_id)
    }

    /// Forget a session and everything it was waiting on.
    pub fn remove(&self, session_id: &str) -> Option<ClientSession> {
        self.write().remove(session_id)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with(session_id: &str) -> (SessionRegistry, mpsc::UnboundedReceiver<ServerEnvelope>) {
        let registry = SessionRegistry::new();
        let (tx, rx) = mpsc::unbounded_channel();
        assert!(registry.register(session_id, tx));
        (registry, rx)
    }

    #[test]
    fn test_register_rejects_duplicates() {
        let (registry, _rx) = registry_with("a");
        let (tx, _rx2) = mpsc::unbounded_channel();
        assert!(!registry.register("a", tx));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_pending_overwrites_and_resolve_keeps_it() {
        let (registry, _rx) = registry_with("a");
        assert_eq!(registry.resolve("a"), None);

        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        assert_eq!(registry.set_pending_timestamp("a", first, "t1"), Ok(None));
        assert_eq!(registry.set_pending_timestamp("a", second, "t2"), Ok(Some(first)));

        assert_eq!(registry.resolve("a"), Some("t2".to_string()));
        assert_eq!(registry.resolve("a"), Some("t2".to_string()));
        assert!(registry.set_pending_timestamp("missing", first, "t").is_err());
    }

    #[test]
    fn test_take_pending_only_clears_matching_request() {
        let (registry, _rx) = registry_with("a");
        let stale = Uuid::new_v4();
        let current = Uuid::new_v4();
        registry.set_pending_timestamp("a", current, "t").unwrap();

        assert_eq!(registry.take_pending("a", stale), None);
        assert_eq!(registry.resolve("a"), Some("t".to_string()));

        assert_eq!(registry.take_pending("a", current), Some("t".to_string()));
        assert_eq!(registry.take_pending("a", current), None);
        assert_eq!(registry.resolve("a"), None);
    }

    #[test]
    fn test_deliver_respects_liveness() {
        let (registry, mut rx) = registry_with("a");
        let envelope = ServerEnvelope::error("boom");

        assert!(registry.deliver("a", envelope.clone()));
        assert_eq!(rx.try_recv().unwrap(), envelope);

        assert!(registry.is_open("a"));
        assert!(registry.remove("a").is_some());
        assert!(!registry.is_open("a"));
        assert!(!registry.deliver("a", envelope));
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn test_deliver_fails_when_actor_is_gone() {
        let (registry, rx) = registry_with("a");
        drop(rx);
        assert!(!registry.deliver("a", ServerEnvelope::error("late")));
    }
}
