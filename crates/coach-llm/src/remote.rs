//! Hosted-provider backend.
//!
//! [`RemoteAdapter`] owns everything the three providers share: credential
//! handling, the status lifecycle, HTTP error mapping, SSE decoding and the
//! idle timeout. A [`WireProtocol`] supplies the provider-specific request
//! envelope and the rule for pulling text out of one event payload.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::RwLock;
use reqwest::{Client, RequestBuilder};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use coach_core::security::ApiKey;
use coach_core::{
    AdapterStatus, BackendConfig, ChatBackend, CoachError, GenerationOptions, Message, Role,
    StatusCell, StatusListener, TokenStream,
};

use crate::sse::SseStream;

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
pub const SSE_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Provider-specific half of a hosted backend.
pub trait WireProtocol: Send + Sync + 'static {
    fn provider(&self) -> &'static str;

    fn default_base_url(&self) -> &'static str;

    fn context_limit(&self) -> usize;

    fn build_request(
        &self,
        client: &Client,
        base_url: &str,
        api_key: &ApiKey,
        transcript: &[Message],
        system_prompt: &str,
        options: &GenerationOptions,
    ) -> RequestBuilder;

    /// Text carried by one event payload. `Ok(None)` for events without text
    /// and for malformed JSON; `Err` when the provider reports a failure
    /// inside the stream.
    fn extract_text(&self, payload: &str) -> Result<Option<String>, CoachError>;
}

/// Transcript turns a provider should see. The system prompt always travels
/// separately.
pub(crate) fn conversation_turns(transcript: &[Message]) -> impl Iterator<Item = &Message> {
    transcript.iter().filter(|m| m.role != Role::System)
}

#[derive(Clone, Debug)]
pub struct RemoteConfig {
    /// Overrides the provider's public endpoint (proxies, tests).
    pub base_url: Option<String>,
    pub options: GenerationOptions,
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            options: GenerationOptions::default(),
            connect_timeout: CONNECT_TIMEOUT,
            idle_timeout: SSE_IDLE_TIMEOUT,
        }
    }
}

pub struct RemoteAdapter<P> {
    protocol: Arc<P>,
    client: Client,
    base_url: String,
    options: GenerationOptions,
    idle_timeout: Duration,
    api_key: RwLock<Option<ApiKey>>,
    status: Arc<StatusCell>,
    destroyed: AtomicBool,
    cancel: CancellationToken,
}

impl<P: WireProtocol> RemoteAdapter<P> {
    pub fn new(protocol: P, config: RemoteConfig) -> Result<Self, CoachError> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| CoachError::Network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self::with_client(protocol, client, config))
    }

    /// Share an existing connection pool.
    pub fn with_client(protocol: P, client: Client, config: RemoteConfig) -> Self {
        let base_url = config
            .base_url
            .unwrap_or_else(|| protocol.default_base_url().to_string())
            .trim_end_matches('/')
            .to_string();
        Self {
            protocol: Arc::new(protocol),
            client,
            base_url,
            options: config.options,
            idle_timeout: config.idle_timeout,
            api_key: RwLock::new(None),
            status: Arc::new(StatusCell::new()),
            destroyed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn ensure_live(&self) -> Result<(), CoachError> {
        if self.destroyed.load(Ordering::Acquire) {
            return Err(CoachError::Destroyed);
        }
        Ok(())
    }

    fn missing_credential(&self) -> CoachError {
        CoachError::missing_credential(self.protocol.provider())
    }
}

/// Holds the adapter in `generating` and restores `ready` when dropped,
/// whether the call succeeded, failed or was abandoned.
struct GeneratingGuard {
    status: Arc<StatusCell>,
}

impl GeneratingGuard {
    fn enter(status: Arc<StatusCell>) -> Self {
        status.set(AdapterStatus::Generating);
        Self { status }
    }
}

impl Drop for GeneratingGuard {
    fn drop(&mut self) {
        self.status
            .transition(AdapterStatus::Generating, AdapterStatus::Ready);
    }
}

#[async_trait]
impl<P: WireProtocol> ChatBackend for RemoteAdapter<P> {
    fn name(&self) -> &str {
        self.protocol.provider()
    }

    async fn initialize(&self, config: BackendConfig) -> Result<(), CoachError> {
        self.ensure_live()?;
        let key = config
            .api_key
            .filter(|k| !k.is_blank())
            .ok_or_else(|| self.missing_credential())?;
        *self.api_key.write() = Some(key);
        self.status.set(AdapterStatus::Ready);
        debug!(provider = self.protocol.provider(), "remote backend ready");
        Ok(())
    }

    #[instrument(skip_all, fields(provider = self.protocol.provider(), turns = transcript.len()))]
    async fn chat_stream(
        &self,
        transcript: &[Message],
        system_prompt: &str,
    ) -> Result<TokenStream, CoachError> {
        self.ensure_live()?;
        let api_key = self
            .api_key
            .read()
            .clone()
            .ok_or_else(|| self.missing_credential())?;

        let guard = GeneratingGuard::enter(self.status.clone());
        let provider = self.protocol.provider();

        let resp = self
            .protocol
            .build_request(
                &self.client,
                &self.base_url,
                &api_key,
                transcript,
                system_prompt,
                &self.options,
            )
            .send()
            .await
            .map_err(|e| CoachError::Network(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            warn!(status, "provider rejected request");
            return Err(CoachError::from_status(provider, status, body));
        }

        let mut payloads = SseStream::with_idle_timeout(resp.bytes_stream(), self.idle_timeout);
        let protocol = self.protocol.clone();
        let cancel = self.cancel.clone();

        let stream = async_stream::stream! {
            let _guard = guard;
            loop {
                let item = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    item = payloads.next() => item,
                };
                let Some(item) = item else { break };
                match item.and_then(|payload| protocol.extract_text(&payload)) {
                    Ok(Some(text)) => yield Ok(text),
                    Ok(None) => {}
                    Err(e) => {
                        warn!(provider, error = %e, "stream ended with error");
                        yield Err(e);
                        break;
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }

    fn status(&self) -> AdapterStatus {
        self.status.get()
    }

    fn context_limit(&self) -> usize {
        self.protocol.context_limit()
    }

    fn set_status_listener(&self, listener: StatusListener) {
        self.status.set_listener(listener);
    }

    fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
        *self.api_key.write() = None;
        self.status.set(AdapterStatus::Idle);
        debug!(provider = self.protocol.provider(), "remote backend destroyed");
    }
}
