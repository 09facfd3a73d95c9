use std::sync::Arc;

use tracing::warn;

use coach_core::{KeyValueStore, Message};

use crate::error::Result;

/// Storage key for one phase's conversation.
pub fn transcript_key(unit_id: &str, phase_id: &str) -> String {
    format!("unit-chat-{unit_id}-{phase_id}")
}

/// Per-phase chat history, stored as a JSON array of messages.
#[derive(Clone)]
pub struct TranscriptStore {
    store: Arc<dyn KeyValueStore>,
}

impl TranscriptStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// A missing or unreadable record loads as an empty transcript.
    pub fn load(&self, unit_id: &str, phase_id: &str) -> Result<Vec<Message>> {
        let key = transcript_key(unit_id, phase_id);
        let Some(raw) = self.store.get(&key)? else {
            return Ok(Vec::new());
        };
        match serde_json::from_str(&raw) {
            Ok(messages) => Ok(messages),
            Err(e) => {
                warn!(key, error = %e, "discarding unreadable transcript");
                Ok(Vec::new())
            }
        }
    }

    pub fn save(&self, unit_id: &str, phase_id: &str, transcript: &[Message]) -> Result<()> {
        let raw = serde_json::to_string(transcript)?;
        self.store.set(&transcript_key(unit_id, phase_id), &raw)?;
        Ok(())
    }

    pub fn clear(&self, unit_id: &str, phase_id: &str) -> Result<()> {
        self.store.remove(&transcript_key(unit_id, phase_id))?;
        Ok(())
    }
}
