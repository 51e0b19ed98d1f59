use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::EventRecord;

/// A handler invocation that failed or panicked.
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetter {
    pub id: Uuid,
    pub record: EventRecord,
    pub handler: String,
    /// Error class, `panic` when the handler panicked.
    pub kind: &'static str,
    pub error: String,
    pub failed_at: DateTime<Utc>,
    pub replayed: bool,
}

/// Failed handler invocations awaiting operator attention or replay.
#[derive(Debug, Default)]
pub struct DeadLetterSink {
    entries: Mutex<Vec<DeadLetter>>,
}

impl DeadLetterSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, letter: DeadLetter) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.push(letter);
        }
    }

    pub fn entries(&self) -> Vec<DeadLetter> {
        self.entries
            .lock()
            .map(|entries| entries.clone())
            .unwrap_or_default()
    }

    pub fn pending(&self) -> Vec<DeadLetter> {
        self.entries()
            .into_iter()
            .filter(|letter| !letter.replayed)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn mark_replayed(&self, record_id: Uuid) {
        if let Ok(mut entries) = self.entries.lock() {
            for letter in entries.iter_mut().filter(|l| l.record.record_id == record_id) {
                letter.replayed = true;
            }
        }
    }
}
