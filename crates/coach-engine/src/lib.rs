//! Coaching logic on top of the backends: prompt assembly, token budgeting,
//! phase progress, persisted transcripts and the exchange driver.

pub mod budget;
pub mod error;
pub mod preferences;
pub mod progress;
pub mod prompt;
pub mod session;
pub mod transcript;

pub use budget::{check_context_usage, truncate_conversation, ContextUsage, UsageWarning};
pub use error::{EngineError, Result};
pub use preferences::PreferencesStore;
pub use progress::{PhaseProgress, ProgressStore, UnitProgress};
pub use prompt::{assemble_system_prompt, initial_greeting};
pub use session::{CoachSession, Exchange};
pub use transcript::{transcript_key, TranscriptStore};
