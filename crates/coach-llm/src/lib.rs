pub mod anthropic;
pub mod google;
pub mod local;
pub mod mistral;
pub mod remote;
pub mod secrets;
pub mod sse;
pub mod unified;

pub mod mock;

pub use anthropic::AnthropicAdapter;
pub use google::GoogleAdapter;
pub use local::LocalAdapter;
pub use mistral::MistralAdapter;
pub use remote::{RemoteAdapter, RemoteConfig};
pub use secrets::CredentialCipher;
pub use unified::{BackendFactory, DefaultBackendFactory, UnifiedAdapter};
