//! Ordered, append-only message log for one room.
//!
//! History seeds the log once; live frames are appended after it by a single
//! pump task. Entries are never reordered or de-duplicated.

use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;
use tokio::sync::watch;
use tracing::warn;

use crate::message::{ChatMessage, Rendered, classify};

#[derive(Clone)]
pub struct MessageStream {
    log: Arc<Mutex<Vec<ChatMessage>>>,
    generation: Arc<watch::Sender<u64>>,
}

impl Default for MessageStream {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageStream {
    #[must_use]
    pub fn new() -> Self {
        let (generation, _) = watch::channel(0);
        Self { log: Arc::new(Mutex::new(Vec::new())), generation: Arc::new(generation) }
    }

    /// Replace the log with a history batch. Records that are not
    /// message-shaped are skipped.
    pub fn seed_history(&self, records: Vec<Value>) {
        let messages: Vec<ChatMessage> = records
            .into_iter()
            .filter_map(|record| match ChatMessage::from_value(record) {
                Ok(message) => Some(message),
                Err(e) => {
                    warn!(error = %e, "stream: skipping malformed history record");
                    None
                }
            })
            .collect();

        *self.lock() = messages;
        self.bump();
    }

    /// Parse and append a live frame body. Returns the stored message.
    pub fn append(&self, raw: &str) -> Option<ChatMessage> {
        match ChatMessage::parse(raw) {
            Ok(message) => {
                self.push(message.clone());
                Some(message)
            }
            Err(e) => {
                warn!(error = %e, "stream: dropping non-json frame body");
                None
            }
        }
    }

    pub fn push(&self, message: ChatMessage) {
        self.lock().push(message);
        self.bump();
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<ChatMessage> {
        self.lock().clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Display view of the log for `local_user`; unknown types are omitted.
    #[must_use]
    pub fn rendered(&self, local_user: &str) -> Vec<Rendered> {
        self.lock().iter().filter_map(|m| classify(m, local_user)).collect()
    }

    /// Fires after every mutation with a monotonically increasing counter.
    #[must_use]
    pub fn updates(&self) -> watch::Receiver<u64> {
        self.generation.subscribe()
    }

    fn bump(&self) {
        self.generation.send_modify(|g| *g += 1);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<ChatMessage>> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
#[path = "stream_test.rs"]
mod tests;
