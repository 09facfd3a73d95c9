use coach_core::{CoachError, StorageError};
use coach_llm::secrets::SecretError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("{0}")]
    Coach(#[from] CoachError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("credential error: {0}")]
    Secret(#[from] SecretError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("phase index {index} out of range for unit {unit} ({count} phases)")]
    InvalidPhaseIndex {
        unit: String,
        index: usize,
        count: usize,
    },

    #[error("unknown phase {phase} in unit {unit}")]
    UnknownPhase { unit: String, phase: String },

    #[error("phase {0} is locked")]
    PhaseLocked(String),

    #[error("checklist item {index} out of range ({len} items)")]
    ChecklistIndex { index: usize, len: usize },

    #[error("unknown credential: {0}")]
    UnknownCredential(String),

    #[error("message is empty")]
    EmptyMessage,
}

pub type Result<T> = std::result::Result<T, EngineError>;
