//! # Transcription History Store
//!
//! Keeps the (original, translated, timestamp) records produced by the relay.
//! The relay only talks to the [`TranslationStore`] trait, so a database-backed
//! store can replace [`MemoryStore`] without touching the routing code.
//!
//! ## Contract:
//! - **append**: assigns the id and the creation time, returns the stored record
//! - **list_all_desc**: newest record first
//! - **clear**: drops every record
//!
//! Calls are synchronous and never fail; the relay treats persistence as
//! fire-and-forget.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

/// Stand-in for a translation that has not arrived yet.
pub const TRANSLATION_PENDING: &str = "[Translation pending]";

/// Stand-in for an original text the relay never saw.
pub const ORIGINAL_UNKNOWN: &str = "[Original text]";

/// A translation pair before it has been persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTranscription {
    pub original_text: String,
    pub translated_text: String,
}

impl NewTranscription {
    pub fn new(original_text: impl Into<String>, translated_text: impl Into<String>) -> Self {
        Self {
            original_text: original_text.into(),
            translated_text: translated_text.into(),
        }
    }
}

/// A persisted translation pair, as returned by the history API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptionRecord {
    pub id: u64,
    pub original_text: String,
    pub translated_text: String,
    pub created_at: DateTime<Utc>,
}

/// Storage boundary used by the relay and the history endpoints.
pub trait TranslationStore: Send + Sync {
    /// Persist a record; the store assigns `id` and `created_at`.
    fn append(&self, record: NewTranscription) -> TranscriptionRecord;

    /// Every record, newest first.
    fn list_all_desc(&self) -> Vec<TranscriptionRecord>;

    /// Remove every record and return how many were dropped.
    fn clear(&self) -> usize;

    fn count(&self) -> usize;
}

/// In-process store backed by a vector.
///
/// ## Thread Safety:
/// The records sit behind a `RwLock` so the history endpoints can read while
/// the upstream task appends. Ids come from an atomic counter and keep
/// increasing across `clear()` calls.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<Vec<TranscriptionRecord>>,
    next_id: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TranslationStore for MemoryStore {
    fn append(&self, record: NewTranscription) -> TranscriptionRecord {
        let stored = TranscriptionRecord {
            id: self.next_id.fetch_add(1, Ordering::SeqCst) + 1,
            original_text: record.original_text,
            translated_text: record.translated_text,
            created_at: Utc::now(),
        };

        match self.records.write() {
            Ok(mut records) => records.push(stored.clone()),
            Err(poisoned) => poisoned.into_inner().push(stored.clone()),
        }

        stored
    }

    fn list_all_desc(&self) -> Vec<TranscriptionRecord> {
        let mut records = match self.records.read() {
            Ok(records) => records.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        records
    }

    fn clear(&self) -> usize {
        let mut records = match self.records.write() {
            Ok(records) => records,
            Err(poisoned) => poisoned.into_inner(),
        };
        let removed = records.len();
        records.clear();
        removed
    }

    fn count(&self) -> usize {
        match self.records.read() {
            Ok(records) => records.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_assigns_increasing_ids() {
        let store = MemoryStore::new();
        let first = store.append(NewTranscription::new("Hello", "Hola"));
        let second = store.append(NewTranscription::new("Bye", "Adiós"));

        assert_eq!(first.id, 1);
        assert_eq!(second.id, 2);
        assert!(second.created_at >= first.created_at);
        assert_eq!(store.count(), 2);
    }

    #[test]
    fn test_list_is_newest_first() {
        let store = MemoryStore::new();
        store.append(NewTranscription::new("one", "uno"));
        store.append(NewTranscription::new("two", "dos"));
        store.append(NewTranscription::new("three", "tres"));

        let texts: Vec<_> = store
            .list_all_desc()
            .into_iter()
            .map(|r| r.original_text)
            .collect();
        assert_eq!(texts, vec!["three", "two", "one"]);
    }

    #[test]
    fn test_clear_keeps_id_sequence() {
        let store = MemoryStore::new();
        store.append(NewTranscription::new("one", "uno"));
        store.append(NewTranscription::new("two", "dos"));

        assert_eq!(store.clear(), 2);
        assert!(store.list_all_desc().is_empty());

        let next = store.append(NewTranscription::new("three", "tres"));
        assert_eq!(next.id, 3);
    }

    #[test]
    fn test_record_serializes_camel_case() {
        let store = MemoryStore::new();
        let record = store.append(NewTranscription::new("Hello", TRANSLATION_PENDING));
        let json = serde_json::to_value(&record).unwrap();

        assert_eq!(json["originalText"], "Hello");
        assert_eq!(json["translatedText"], "[Translation pending]");
        assert!(json["createdAt"].is_string());
        assert_eq!(json["id"], 1);
    }
}
