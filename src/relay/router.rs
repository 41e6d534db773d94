//! # Result Router
//!
//! Matches asynchronous backend answers to the client requests that caused
//! them.
//!
//! The backend never echoes a request id. Every request submitted upstream
//! takes a slot at the back of one FIFO. A `final_transcription` attaches to
//! the oldest slot still missing a transcript whose request text it repeats
//! (case, punctuation and spacing ignored); a transcript that repeats no
//! request came from audio posted over HTTP and is held apart from the
//! request slots. Translations complete transcripts in the order the
//! transcripts arrived, or the oldest slot when no transcript is waiting.
//!
//! ## Invariants:
//! - FIFO order equals wire order (the relay enqueues and sends under one lock)
//! - a slot stays in the FIFO until its answer arrives or the upstream
//!   connection drops, even if its session is gone, so later answers never
//!   shift onto the wrong request
//! - a result is delivered only if the owning session is open and its pending
//!   slot still holds this request; every completed slot is persisted once
//! - transcripts without a request never occupy request capacity and at most
//!   `UNSOLICITED_LIMIT` of them wait for a translation

use super::envelope::ServerEnvelope;
use super::registry::SessionRegistry;
use super::{RelayError, RelayStats};
use crate::store::{NewTranscription, TranslationStore, ORIGINAL_UNKNOWN, TRANSLATION_PENDING};
use crate::upstream::{LinkEvent, UpstreamHandler, UpstreamMessage};

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Transcripts without a request that may wait for their translation.
pub const UNSOLICITED_LIMIT: usize = 32;

#[derive(Debug, Clone)]
struct Origin {
    session_id: String,
    request_id: Uuid,
}

#[derive(Debug, Clone)]
struct InFlight {
    origin: Origin,
    original_text: String,
    transcript: Option<String>,
}

/// A transcript whose translation is still to come.
#[derive(Debug, Clone)]
enum Awaiting {
    Request(Uuid),
    Unsolicited(String),
}

#[derive(Debug, Default)]
struct Queues {
    requests: VecDeque<InFlight>,
    awaiting: VecDeque<Awaiting>,
}

impl Queues {
    fn unsolicited(&self) -> usize {
        self.awaiting
            .iter()
            .filter(|a| matches!(a, Awaiting::Unsolicited(_)))
            .count()
    }

    fn take_request(&mut self, request_id: Uuid) -> Option<InFlight> {
        let index = self
            .requests
            .iter()
            .position(|entry| entry.origin.request_id == request_id)?;
        self.requests.remove(index)
    }
}

/// Lowercased words of `text` with punctuation dropped.
fn normalize(text: &str) -> String {
    text.split_whitespace()
        .map(|word| {
            word.chars()
                .filter(|c| c.is_alphanumeric())
                .flat_map(char::to_lowercase)
                .collect::<String>()
        })
        .filter(|word| !word.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

pub struct ResultRouter {
    registry: Arc<SessionRegistry>,
    store: Arc<dyn TranslationStore>,
    stats: Arc<RelayStats>,
    queues: Mutex<Queues>,
    max_in_flight: usize,
}

impl ResultRouter {
    pub fn new(
        registry: Arc<SessionRegistry>,
        store: Arc<dyn TranslationStore>,
        stats: Arc<RelayStats>,
        max_in_flight: usize,
    ) -> Self {
        Self {
            registry,
            store,
            stats,
            queues: Mutex::new(Queues::default()),
            max_in_flight,
        }
    }

    fn queues(&self) -> MutexGuard<'_, Queues> {
        self.queues.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Reserve the next FIFO slot for a request about to be sent upstream.
    pub fn enqueue(
        &self,
        session_id: &str,
        request_id: Uuid,
        original_text: &str,
    ) -> Result<(), RelayError> {
        let mut queues = self.queues();
        if queues.requests.len() >= self.max_in_flight {
            return Err(RelayError::QueueFull(self.max_in_flight));
        }
        queues.requests.push_back(InFlight {
            origin: Origin {
                session_id: session_id.to_string(),
                request_id,
            },
            original_text: original_text.to_string(),
            transcript: None,
        });
        Ok(())
    }

    /// Withdraw a slot whose request never made it onto the wire.
    pub fn cancel(&self, request_id: Uuid) -> bool {
        let mut queues = self.queues();
        queues
            .awaiting
            .retain(|a| !matches!(a, Awaiting::Request(id) if *id == request_id));
        queues.take_request(request_id).is_some()
    }

    /// Number of request slots waiting for a backend answer.
    pub fn in_flight(&self) -> usize {
        self.queues().requests.len()
    }

    fn on_final_transcription(&self, text: String) {
        let key = normalize(&text);
        let mut skipped = Vec::new();
        let mut evicted = None;

        {
            let mut queues = self.queues();
            let matched = queues.requests.iter().position(|entry| {
                entry.transcript.is_none() && normalize(&entry.original_text) == key
            });

            match matched {
                Some(index) => {
                    // The backend answers in wire order; untranscribed slots
                    // ahead of this one were passed over.
                    let mut kept = VecDeque::with_capacity(queues.requests.len());
                    for (position, entry) in queues.requests.drain(..).enumerate() {
                        if position < index && entry.transcript.is_none() {
                            skipped.push(entry);
                        } else {
                            kept.push_back(entry);
                        }
                    }
                    queues.requests = kept;

                    let index = index - skipped.len();
                    let entry = &mut queues.requests[index];
                    debug!(%text, request_id = %entry.origin.request_id, "Final transcription matched to in-flight request");
                    entry.transcript = Some(text);
                    let request_id = entry.origin.request_id;
                    queues.awaiting.push_back(Awaiting::Request(request_id));
                }
                None => {
                    debug!(%text, "Final transcription without a request, holding for its translation");
                    if queues.unsolicited() >= UNSOLICITED_LIMIT {
                        let oldest = queues
                            .awaiting
                            .iter()
                            .position(|a| matches!(a, Awaiting::Unsolicited(_)));
                        evicted = oldest.and_then(|index| queues.awaiting.remove(index));
                    }
                    queues.awaiting.push_back(Awaiting::Unsolicited(text));
                }
            }
        }

        for entry in skipped {
            warn!(request_id = %entry.origin.request_id, "Request passed over by the backend");
            self.abandon(entry);
        }
        if let Some(Awaiting::Unsolicited(transcript)) = evicted {
            warn!(%transcript, "Too many transcripts waiting for a translation, storing the oldest");
            self.store
                .append(NewTranscription::new(transcript, TRANSLATION_PENDING));
        }
    }

    fn on_translation(&self, translated_text: String) {
        let next = {
            let mut queues = self.queues();
            match queues.awaiting.pop_front() {
                Some(Awaiting::Request(request_id)) => queues.take_request(request_id).map(Ok),
                Some(Awaiting::Unsolicited(transcript)) => Some(Err(transcript)),
                None => queues.requests.pop_front().map(Ok),
            }
        };

        let entry = match next {
            Some(Ok(entry)) => entry,
            Some(Err(transcript)) => {
                let record = self
                    .store
                    .append(NewTranscription::new(transcript, translated_text));
                debug!(record_id = record.id, "Translation of unrequested audio persisted");
                return;
            }
            None => {
                warn!(%translated_text, "Translation without a matching request");
                self.stats.record_unmatched();
                self.store
                    .append(NewTranscription::new(ORIGINAL_UNKNOWN, translated_text));
                return;
            }
        };

        let original_text = entry.transcript.unwrap_or(entry.original_text);
        let delivered = self.deliver(&entry.origin, &original_text, &translated_text);
        if delivered {
            self.stats.record_delivered();
        } else {
            self.stats.record_undelivered();
        }

        let record = self
            .store
            .append(NewTranscription::new(original_text, translated_text));
        debug!(record_id = record.id, delivered, "Translation persisted");
    }

    fn deliver(&self, origin: &Origin, original_text: &str, translated_text: &str) -> bool {
        let Some(timestamp) = self
            .registry
            .take_pending(&origin.session_id, origin.request_id)
        else {
            info!(
                session_id = %origin.session_id,
                request_id = %origin.request_id,
                "Result for a closed or superseded request, not delivered"
            );
            return false;
        };

        let delivered = self.registry.deliver(
            &origin.session_id,
            ServerEnvelope::TranslationResult {
                original_text: original_text.to_string(),
                translated_text: translated_text.to_string(),
                timestamp,
            },
        );

        if delivered {
            info!(session_id = %origin.session_id, request_id = %origin.request_id, "Translation delivered");
        } else {
            info!(session_id = %origin.session_id, "Session closed before its translation arrived");
        }
        delivered
    }

    /// Drop a slot that will never be answered.
    fn abandon(&self, entry: InFlight) {
        self.registry
            .take_pending(&entry.origin.session_id, entry.origin.request_id);
        self.stats.record_abandoned();
        if let Some(transcript) = entry.transcript {
            self.store
                .append(NewTranscription::new(transcript, TRANSLATION_PENDING));
        }
    }

    /// The connection that carried every in-flight request is gone; none of
    /// them will be answered.
    fn on_disconnected(&self) {
        let (requests, awaiting) = {
            let mut queues = self.queues();
            let requests: Vec<InFlight> = queues.requests.drain(..).collect();
            let awaiting: Vec<Awaiting> = queues.awaiting.drain(..).collect();
            (requests, awaiting)
        };

        if !requests.is_empty() {
            warn!(count = requests.len(), "Upstream connection lost with requests in flight");
        }
        for entry in requests {
            self.abandon(entry);
        }
        for waiting in awaiting {
            if let Awaiting::Unsolicited(transcript) = waiting {
                self.store
                    .append(NewTranscription::new(transcript, TRANSLATION_PENDING));
            }
        }
    }
}

impl UpstreamHandler for ResultRouter {
    fn handle(&self, event: LinkEvent) {
        match event {
            LinkEvent::Connected => info!("Translation backend ready"),
            LinkEvent::Disconnected => self.on_disconnected(),
            LinkEvent::Message(UpstreamMessage::FinalTranscription { text, language }) => {
                info!(%language, %text, "Final transcription received");
                self.on_final_transcription(text);
            }
            LinkEvent::Message(UpstreamMessage::Translation {
                text,
                target_language,
            }) => {
                info!(%target_language, %text, "Translation received");
                self.on_translation(text);
            }
            LinkEvent::Message(other) => debug!(?other, "Not routed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use tokio::sync::mpsc;

    struct Harness {
        registry: Arc<SessionRegistry>,
        store: Arc<MemoryStore>,
        stats: Arc<RelayStats>,
        router: ResultRouter,
    }

    impl Harness {
        fn new(max_in_flight: usize) -> Self {
            let registry = Arc::new(SessionRegistry::new());
            let store = Arc::new(MemoryStore::new());
            let stats = Arc::new(RelayStats::default());
            let router = ResultRouter::new(
                registry.clone(),
                store.clone(),
                stats.clone(),
                max_in_flight,
            );
            Self {
                registry,
                store,
                stats,
                router,
            }
        }

        fn session(&self, id: &str) -> mpsc::UnboundedReceiver<ServerEnvelope> {
            let (tx, rx) = mpsc::unbounded_channel();
            self.registry.register(id, tx);
            rx
        }

        fn request(&self, session_id: &str, text: &str, timestamp: &str) -> Uuid {
            let request_id = Uuid::new_v4();
            self.router.enqueue(session_id, request_id, text).unwrap();
            self.registry
                .set_pending_timestamp(session_id, request_id, timestamp)
                .unwrap();
            request_id
        }

        fn transcription(&self, text: &str) {
            self.router
                .handle(LinkEvent::Message(UpstreamMessage::FinalTranscription {
                    text: text.to_string(),
                    language: "en".to_string(),
                }));
        }

        fn translation(&self, text: &str) {
            self.router
                .handle(LinkEvent::Message(UpstreamMessage::Translation {
                    text: text.to_string(),
                    target_language: "es".to_string(),
                }));
        }
    }

    fn result(original: &str, translated: &str, timestamp: &str) -> ServerEnvelope {
        ServerEnvelope::TranslationResult {
            original_text: original.to_string(),
            translated_text: translated.to_string(),
            timestamp: timestamp.to_string(),
        }
    }

    #[test]
    fn test_hello_hola_is_one_result_and_one_record() {
        let h = Harness::new(8);
        let mut rx = h.session("a");
        h.request("a", "Hello", "2024-01-01T00:00:00Z");

        h.transcription("Hello");
        assert!(rx.try_recv().is_err());
        h.translation("Hola");

        assert_eq!(
            rx.try_recv().unwrap(),
            result("Hello", "Hola", "2024-01-01T00:00:00Z")
        );
        assert!(rx.try_recv().is_err());

        let records = h.store.list_all_desc();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].original_text, "Hello");
        assert_eq!(records[0].translated_text, "Hola");
        assert_eq!(h.router.in_flight(), 0);
        assert_eq!(h.registry.resolve("a"), None);
    }

    #[test]
    fn test_concurrent_sessions_stay_isolated() {
        let h = Harness::new(8);
        let mut rx_a = h.session("a");
        let mut rx_b = h.session("b");
        h.request("a", "Good morning", "ta");
        h.request("b", "Good night", "tb");

        h.transcription("Good morning");
        h.transcription("Good night");
        h.translation("Buenos días");
        h.translation("Buenas noches");

        assert_eq!(rx_a.try_recv().unwrap(), result("Good morning", "Buenos días", "ta"));
        assert_eq!(rx_b.try_recv().unwrap(), result("Good night", "Buenas noches", "tb"));
        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_err());
        assert_eq!(h.stats.snapshot().results_delivered, 2);
    }

    #[test]
    fn test_disconnected_session_does_not_steal_results() {
        let h = Harness::new(8);
        let _rx_a = h.session("a");
        let mut rx_b = h.session("b");
        h.request("a", "first", "ta");
        h.request("b", "second", "tb");

        assert!(h.registry.remove("a").is_some());

        h.translation("primero");
        h.translation("segundo");

        assert_eq!(rx_b.try_recv().unwrap(), result("second", "segundo", "tb"));
        assert!(rx_b.try_recv().is_err());

        // A's answer is still persisted, just not delivered.
        assert_eq!(h.store.list_all_desc().len(), 2);
        let stats = h.stats.snapshot();
        assert_eq!(stats.results_delivered, 1);
        assert_eq!(stats.results_undelivered, 1);
    }

    #[test]
    fn test_superseded_request_is_absorbed() {
        let h = Harness::new(8);
        let mut rx = h.session("a");
        h.request("a", "one", "t1");
        h.request("a", "two", "t2");

        h.translation("uno");
        assert!(rx.try_recv().is_err());

        h.translation("dos");
        assert_eq!(rx.try_recv().unwrap(), result("two", "dos", "t2"));
    }

    #[test]
    fn test_translation_without_transcript_uses_request_text() {
        let h = Harness::new(8);
        let mut rx = h.session("a");
        h.request("a", "Hello", "t");

        h.translation("Hola");
        assert_eq!(rx.try_recv().unwrap(), result("Hello", "Hola", "t"));
    }

    #[test]
    fn test_unsolicited_messages_are_persisted() {
        let h = Harness::new(8);

        h.transcription("from audio");
        assert_eq!(h.router.in_flight(), 0);
        h.translation("desde audio");

        h.translation("stray");

        let records = h.store.list_all_desc();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].original_text, ORIGINAL_UNKNOWN);
        assert_eq!(records[0].translated_text, "stray");
        assert_eq!(records[1].original_text, "from audio");
        assert_eq!(records[1].translated_text, "desde audio");
        assert_eq!(h.stats.snapshot().results_unmatched, 1);
    }

    #[test]
    fn test_audio_results_do_not_reach_text_requesters() {
        let h = Harness::new(8);
        let mut rx = h.session("a");
        h.request("a", "Hello", "ta");

        h.transcription("audio words");
        h.translation("palabras de audio");
        assert!(rx.try_recv().is_err());
        assert_eq!(h.router.in_flight(), 1);
        assert_eq!(h.registry.resolve("a"), Some("ta".to_string()));

        h.transcription("  hello. ");
        h.translation("Hola");
        assert_eq!(rx.try_recv().unwrap(), result("  hello. ", "Hola", "ta"));

        let records = h.store.list_all_desc();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].original_text, "audio words");
        assert_eq!(records[1].translated_text, "palabras de audio");
    }

    #[test]
    fn test_interleaved_audio_keeps_translation_order() {
        let h = Harness::new(8);
        let mut rx = h.session("a");
        h.request("a", "Good morning", "ta");

        h.transcription("from the microphone");
        h.transcription("Good morning");
        h.translation("desde el micrófono");
        h.translation("Buenos días");

        assert_eq!(
            rx.try_recv().unwrap(),
            result("Good morning", "Buenos días", "ta")
        );
        assert_eq!(h.store.list_all_desc()[1].original_text, "from the microphone");
    }

    #[test]
    fn test_unsolicited_transcripts_do_not_take_request_slots() {
        let h = Harness::new(2);
        let _rx = h.session("a");

        for i in 0..=UNSOLICITED_LIMIT {
            h.transcription(&format!("audio {}", i));
        }
        assert_eq!(h.router.in_flight(), 0);

        // The oldest waiting transcript is stored once the holder overflows.
        let records = h.store.list_all_desc();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].original_text, "audio 0");
        assert_eq!(records[0].translated_text, TRANSLATION_PENDING);

        assert!(h.router.enqueue("a", Uuid::new_v4(), "one").is_ok());
        assert!(h.router.enqueue("a", Uuid::new_v4(), "two").is_ok());
    }

    #[test]
    fn test_passed_over_request_is_abandoned() {
        let h = Harness::new(8);
        let mut rx = h.session("a");
        let mut rx_b = h.session("b");
        h.request("a", "first", "ta");
        h.request("b", "second", "tb");

        h.transcription("second");
        assert_eq!(h.router.in_flight(), 1);
        assert_eq!(h.registry.resolve("a"), None);

        h.translation("segundo");
        assert_eq!(rx_b.try_recv().unwrap(), result("second", "segundo", "tb"));
        assert!(rx.try_recv().is_err());
        assert_eq!(h.stats.snapshot().requests_abandoned, 1);
    }

    #[test]
    fn test_queue_is_bounded_and_cancel_frees_a_slot() {
        let h = Harness::new(1);
        let _rx = h.session("a");
        let first = Uuid::new_v4();

        h.router.enqueue("a", first, "one").unwrap();
        assert_eq!(
            h.router.enqueue("a", Uuid::new_v4(), "two"),
            Err(RelayError::QueueFull(1))
        );

        assert!(h.router.cancel(first));
        assert!(!h.router.cancel(first));
        assert!(h.router.enqueue("a", Uuid::new_v4(), "two").is_ok());
    }

    #[test]
    fn test_upstream_disconnect_abandons_in_flight() {
        let h = Harness::new(8);
        let mut rx = h.session("a");
        h.request("a", "lost", "t1");
        h.transcription("lost");
        h.transcription("from audio");

        h.router.handle(LinkEvent::Disconnected);

        assert_eq!(h.router.in_flight(), 0);
        assert_eq!(h.registry.resolve("a"), None);
        let records = h.store.list_all_desc();
        assert_eq!(records.len(), 2);
        assert!(records
            .iter()
            .all(|record| record.translated_text == TRANSLATION_PENDING));

        // After reconnecting, a new request lines up cleanly.
        h.router.handle(LinkEvent::Connected);
        h.request("a", "again", "t2");
        h.translation("otra vez");
        assert_eq!(rx.try_recv().unwrap(), result("again", "otra vez", "t2"));
        assert_eq!(h.stats.snapshot().requests_abandoned, 1);
    }

    #[test]
    fn test_normalize_ignores_case_punctuation_and_spacing() {
        assert_eq!(normalize("  Hello,   World! "), "hello world");
        assert_eq!(normalize("hello world"), normalize("HELLO WORLD."));
        assert_eq!(normalize("..."), "");
    }
}
