//! Shared types for the coaching companion: messages, the model catalog,
//! backend capability trait, curriculum records, credentials and the
//! key/value storage port.

pub mod backend;
pub mod curriculum;
pub mod errors;
pub mod messages;
pub mod models;
pub mod security;
pub mod status;
pub mod storage;

pub use backend::{BackendConfig, ChatBackend, GenerationOptions, TokenStream};
pub use errors::{CoachError, ErrorKind};
pub use messages::{Message, Role};
pub use models::{ModelDescriptor, ProviderKind, Tier};
pub use status::{AdapterStatus, StatusCell, StatusListener, StatusUpdate};
pub use storage::{KeyValueStore, MemoryStore, StorageError};
