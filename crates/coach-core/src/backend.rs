use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::errors::CoachError;
use crate::messages::Message;
use crate::security::ApiKey;
use crate::status::{AdapterStatus, StatusListener};

/// Lazy, ordered sequence of text fragments produced by one generation call.
/// Dropping the stream abandons the call.
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String, CoachError>> + Send>>;

/// Per-backend configuration handed to [`ChatBackend::initialize`].
#[derive(Clone, Debug, Default)]
pub struct BackendConfig {
    pub api_key: Option<ApiKey>,
}

impl BackendConfig {
    pub fn with_api_key(api_key: ApiKey) -> Self {
        Self {
            api_key: Some(api_key),
        }
    }
}

/// Sampling parameters sent to hosted providers.
#[derive(Clone, Debug, PartialEq)]
pub struct GenerationOptions {
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            max_tokens: 1024,
            temperature: 0.7,
            top_p: 0.9,
        }
    }
}

/// Capability set shared by every inference backend.
///
/// A backend is constructed idle, becomes `ready` after [`initialize`], flips to
/// `generating` for the lifetime of each [`chat_stream`] call and returns to
/// `ready` however the call ends. After [`destroy`] it is inert.
///
/// [`initialize`]: ChatBackend::initialize
/// [`chat_stream`]: ChatBackend::chat_stream
/// [`destroy`]: ChatBackend::destroy
#[async_trait]
pub trait ChatBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn initialize(&self, config: BackendConfig) -> Result<(), CoachError>;

    /// Start a generation. Failures detected before the first token (missing
    /// credential, HTTP status) are returned directly; failures afterwards
    /// arrive as an `Err` item and end the stream.
    async fn chat_stream(
        &self,
        transcript: &[Message],
        system_prompt: &str,
    ) -> Result<TokenStream, CoachError>;

    fn status(&self) -> AdapterStatus;

    fn context_limit(&self) -> usize;

    fn set_status_listener(&self, listener: StatusListener);

    fn destroy(&self);
}
