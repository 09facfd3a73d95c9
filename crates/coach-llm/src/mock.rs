use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use coach_core::{
    AdapterStatus, BackendConfig, ChatBackend, CoachError, Message, ModelDescriptor, StatusCell,
    StatusListener, TokenStream,
};

use crate::unified::BackendFactory;

/// Shared, ordered log of lifecycle calls across mock backends.
pub type Journal = Arc<Mutex<Vec<String>>>;

/// Pre-programmed replies for deterministic testing without a model.
#[derive(Clone, Debug)]
pub enum MockReply {
    /// Yield these tokens, then end.
    Tokens(Vec<String>),
    /// Fail the `chat_stream` call itself.
    Error(CoachError),
    /// Yield these tokens, then an error item.
    Interrupted(Vec<String>, CoachError),
    /// Pause between every token.
    Paced(Duration, Vec<String>),
}

impl MockReply {
    pub fn text(tokens: &[&str]) -> Self {
        Self::Tokens(tokens.iter().map(|t| t.to_string()).collect())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordedCall {
    pub transcript: Vec<Message>,
    pub system_prompt: String,
}

/// Backend that returns replies in sequence and records what it was asked.
pub struct MockBackend {
    label: String,
    replies: Vec<MockReply>,
    call_count: AtomicUsize,
    calls: Mutex<Vec<RecordedCall>>,
    fail_initialize: Option<CoachError>,
    context_limit: usize,
    status: Arc<StatusCell>,
    journal: Journal,
    destroyed: AtomicBool,
    cancel: CancellationToken,
}

impl MockBackend {
    pub fn new(replies: Vec<MockReply>) -> Self {
        Self {
            label: "mock".into(),
            replies,
            call_count: AtomicUsize::new(0),
            calls: Mutex::new(Vec::new()),
            fail_initialize: None,
            context_limit: coach_core::models::LOCAL_CONTEXT_LIMIT,
            status: Arc::new(StatusCell::new()),
            journal: Journal::default(),
            destroyed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }
    }

    pub fn failing_initialize(mut self, error: CoachError) -> Self {
        self.fail_initialize = Some(error);
        self
    }

    pub fn with_context_limit(mut self, limit: usize) -> Self {
        self.context_limit = limit;
        self
    }

    pub fn with_journal(mut self, label: impl Into<String>, journal: Journal) -> Self {
        self.label = label.into();
        self.journal = journal;
        self
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    fn log(&self, event: &str) {
        self.journal.lock().push(format!("{event}:{}", self.label));
    }
}

/// Ends the generating phase when the stream is dropped.
struct ReadyOnDrop(Arc<StatusCell>);

impl Drop for ReadyOnDrop {
    fn drop(&mut self) {
        self.0.transition(AdapterStatus::Generating, AdapterStatus::Ready);
    }
}

#[async_trait]
impl ChatBackend for MockBackend {
    fn name(&self) -> &str {
        &self.label
    }

    async fn initialize(&self, _config: BackendConfig) -> Result<(), CoachError> {
        self.log("initialize");
        if self.is_destroyed() {
            return Err(CoachError::Destroyed);
        }
        if let Some(error) = &self.fail_initialize {
            self.status
                .set_with_message(AdapterStatus::Error, error.to_string());
            return Err(error.clone());
        }
        self.status.set(AdapterStatus::Ready);
        Ok(())
    }

    async fn chat_stream(
        &self,
        transcript: &[Message],
        system_prompt: &str,
    ) -> Result<TokenStream, CoachError> {
        if self.is_destroyed() {
            return Err(CoachError::Destroyed);
        }
        let idx = self.call_count.fetch_add(1, Ordering::Relaxed);
        self.calls.lock().push(RecordedCall {
            transcript: transcript.to_vec(),
            system_prompt: system_prompt.to_string(),
        });

        let reply = self.replies.get(idx).cloned().ok_or_else(|| {
            CoachError::Inference(format!("mock backend: no reply configured for call {idx}"))
        })?;

        let (tokens, pace, tail) = match reply {
            MockReply::Error(e) => return Err(e),
            MockReply::Tokens(tokens) => (tokens, None, None),
            MockReply::Interrupted(tokens, e) => (tokens, None, Some(e)),
            MockReply::Paced(delay, tokens) => (tokens, Some(delay), None),
        };

        self.status.set(AdapterStatus::Generating);
        let guard = ReadyOnDrop(self.status.clone());
        let cancel = self.cancel.clone();
        let items = tokens
            .into_iter()
            .map(Ok)
            .chain(tail.map(Err))
            .collect::<Vec<_>>();

        let stream = async_stream::stream! {
            let _guard = guard;
            for item in items {
                if let Some(delay) = pace {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                if cancel.is_cancelled() {
                    break;
                }
                yield item;
            }
        };
        Ok(Box::pin(stream))
    }

    fn status(&self) -> AdapterStatus {
        self.status.get()
    }

    fn context_limit(&self) -> usize {
        self.context_limit
    }

    fn set_status_listener(&self, listener: StatusListener) {
        self.status.set_listener(listener);
    }

    fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.log("destroy");
        self.cancel.cancel();
        self.status.set(AdapterStatus::Idle);
    }
}

type Blueprint = Box<dyn Fn(&'static ModelDescriptor) -> MockBackend + Send + Sync>;

/// Factory handing out [`MockBackend`]s that share one journal.
pub struct MockFactory {
    blueprint: Blueprint,
    journal: Journal,
    created: Mutex<Vec<Arc<MockBackend>>>,
}

impl MockFactory {
    pub fn new(
        blueprint: impl Fn(&'static ModelDescriptor) -> MockBackend + Send + Sync + 'static,
    ) -> Self {
        Self {
            blueprint: Box::new(blueprint),
            journal: Journal::default(),
            created: Mutex::new(Vec::new()),
        }
    }

    /// Every backend answers with the same tokens.
    pub fn replying(tokens: &'static [&'static str]) -> Self {
        Self::new(move |_| MockBackend::new(vec![MockReply::text(tokens); 16]))
    }

    pub fn journal(&self) -> Vec<String> {
        self.journal.lock().clone()
    }

    pub fn created(&self) -> Vec<Arc<MockBackend>> {
        self.created.lock().clone()
    }
}

impl BackendFactory for MockFactory {
    fn create(&self, model: &'static ModelDescriptor) -> Result<Arc<dyn ChatBackend>, CoachError> {
        self.journal.lock().push(format!("create:{}", model.id));
        let backend =
            Arc::new((self.blueprint)(model).with_journal(model.id, self.journal.clone()));
        self.created.lock().push(backend.clone());
        Ok(backend)
    }
}
