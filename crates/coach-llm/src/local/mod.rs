//! On-device backend.
//!
//! [`LocalAdapter`] drives an [`InferenceEngine`] on a dedicated worker thread
//! and correlates worker responses back to the call that caused them through
//! a table keyed by request id.

pub mod engine;
#[cfg(feature = "llama")]
pub mod llama;
pub mod protocol;
mod worker;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use coach_core::models::LOCAL_CONTEXT_LIMIT;
use coach_core::{
    AdapterStatus, BackendConfig, ChatBackend, CoachError, Message, Role, StatusCell,
    StatusListener, TokenStream,
};

pub use engine::{EngineFactory, GenerationParams, InferenceEngine, InferenceError, TokenAction};
pub use protocol::{RequestId, WorkerRequest, WorkerResponse};

use worker::WorkerHandle;

const INITIALIZING_MESSAGE: &str = "Initializing worker...";

/// Where responses for an in-flight request are delivered.
enum PendingCall {
    Init(oneshot::Sender<Result<(), CoachError>>),
    Generate(mpsc::UnboundedSender<Result<String, CoachError>>),
}

type PendingTable = Arc<DashMap<RequestId, PendingCall>>;

/// Id of the generation that owns the Generating status. Request ids start
/// at 1, so 0 means none.
const NO_GENERATION: RequestId = 0;

pub struct LocalAdapter {
    engine_factory: EngineFactory,
    params: GenerationParams,
    status: Arc<StatusCell>,
    next_id: AtomicU64,
    pending: PendingTable,
    active_generation: Arc<AtomicU64>,
    worker: Mutex<Option<WorkerHandle>>,
    cancel: CancellationToken,
}

impl LocalAdapter {
    pub fn new(engine_factory: EngineFactory, params: GenerationParams) -> Self {
        Self {
            engine_factory,
            params,
            status: Arc::new(StatusCell::new()),
            next_id: AtomicU64::new(1),
            pending: Arc::new(DashMap::new()),
            active_generation: Arc::new(AtomicU64::new(NO_GENERATION)),
            worker: Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    fn next_request_id(&self) -> RequestId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Spawn the worker and its response dispatcher on first use.
    fn ensure_worker(&self) -> Result<std::sync::mpsc::Sender<WorkerRequest>, CoachError> {
        let mut worker = self.worker.lock();
        if let Some(handle) = worker.as_ref() {
            return Ok(handle.sender());
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = WorkerHandle::spawn((self.engine_factory)(), self.params.clone(), tx)?;
        tokio::spawn(dispatch(
            rx,
            self.pending.clone(),
            self.active_generation.clone(),
            self.status.clone(),
            self.cancel.clone(),
        ));
        let sender = handle.sender();
        *worker = Some(handle);
        Ok(sender)
    }

    fn worker_gone(&self) -> CoachError {
        if self.cancel.is_cancelled() {
            CoachError::Destroyed
        } else {
            CoachError::Inference("inference worker exited".into())
        }
    }
}

/// Route worker responses to pending calls and mirror them into the status
/// cell. Stops once the adapter is destroyed or the worker hangs up.
async fn dispatch(
    mut responses: mpsc::UnboundedReceiver<WorkerResponse>,
    pending: PendingTable,
    active_generation: Arc<AtomicU64>,
    status: Arc<StatusCell>,
    cancel: CancellationToken,
) {
    // Clears the active generation if `id` still owns it.
    let finish = |id: RequestId| {
        active_generation
            .compare_exchange(id, NO_GENERATION, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    };

    loop {
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            response = responses.recv() => response,
        };
        let Some(response) = response else { break };
        if cancel.is_cancelled() {
            break;
        }

        let id = response.id();
        match response {
            WorkerResponse::Status { message, .. } => {
                status.set_with_message(AdapterStatus::Loading, message);
            }
            WorkerResponse::Ready { .. } => {
                status.set(AdapterStatus::Ready);
                if let Some((_, PendingCall::Init(tx))) = pending.remove(&id) {
                    let _ = tx.send(Ok(()));
                }
            }
            WorkerResponse::Token { token, .. } => {
                if let Some(entry) = pending.get(&id) {
                    if let PendingCall::Generate(tx) = entry.value() {
                        let _ = tx.send(Ok(token));
                    }
                }
            }
            WorkerResponse::Done { .. } => {
                if finish(id) {
                    status.transition(AdapterStatus::Generating, AdapterStatus::Ready);
                } else {
                    debug!(id, "superseded generation finished");
                }
                pending.remove(&id);
            }
            WorkerResponse::Error { error, .. } => {
                let current = finish(id);
                match pending.remove(&id).map(|(_, call)| call) {
                    Some(PendingCall::Init(tx)) => {
                        status.set_with_message(AdapterStatus::Error, error.clone());
                        let _ = tx.send(Err(CoachError::Inference(error)));
                    }
                    Some(PendingCall::Generate(tx)) => {
                        if current {
                            status.set_with_message(AdapterStatus::Error, error.clone());
                        }
                        let _ = tx.send(Err(CoachError::Inference(error)));
                    }
                    None if current => {
                        status.set_with_message(AdapterStatus::Error, error);
                    }
                    None => debug!(id, "error for unknown request"),
                }
            }
        }
    }
    debug!("local dispatcher stopped");
}

/// Sends `Abort` for the request when the consumer drops the stream before
/// the worker finished it.
struct AbortOnDrop {
    id: RequestId,
    requests: std::sync::mpsc::Sender<WorkerRequest>,
    armed: bool,
}

impl AbortOnDrop {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        if self.armed {
            debug!(id = self.id, "stream dropped, aborting generation");
            let _ = self.requests.send(WorkerRequest::Abort { id: self.id });
        }
    }
}

#[async_trait]
impl ChatBackend for LocalAdapter {
    fn name(&self) -> &str {
        "local"
    }

    async fn initialize(&self, _config: BackendConfig) -> Result<(), CoachError> {
        if self.cancel.is_cancelled() {
            return Err(CoachError::Destroyed);
        }
        if matches!(
            self.status.get(),
            AdapterStatus::Ready | AdapterStatus::Generating
        ) {
            return Ok(());
        }

        self.status
            .set_with_message(AdapterStatus::Loading, INITIALIZING_MESSAGE);
        let requests = self.ensure_worker()?;

        let id = self.next_request_id();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, PendingCall::Init(tx));
        if requests.send(WorkerRequest::Init { id }).is_err() {
            self.pending.remove(&id);
            return Err(self.worker_gone());
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(self.worker_gone()),
        }
    }

    #[instrument(skip_all, fields(turns = transcript.len()))]
    async fn chat_stream(
        &self,
        transcript: &[Message],
        system_prompt: &str,
    ) -> Result<TokenStream, CoachError> {
        if self.cancel.is_cancelled() {
            return Err(CoachError::Destroyed);
        }
        let requests = self
            .worker
            .lock()
            .as_ref()
            .map(WorkerHandle::sender)
            .ok_or(CoachError::NotInitialized)?;
        if !matches!(
            self.status.get(),
            AdapterStatus::Ready | AdapterStatus::Generating
        ) {
            return Err(CoachError::NotInitialized);
        }

        let mut messages = Vec::with_capacity(transcript.len() + 1);
        if !system_prompt.is_empty() {
            messages.push(Message::system(system_prompt));
        }
        messages.extend(transcript.iter().filter(|m| m.role != Role::System).cloned());

        let id = self.next_request_id();
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.pending.insert(id, PendingCall::Generate(tx));
        self.active_generation.store(id, Ordering::Release);
        self.status.set(AdapterStatus::Generating);

        if requests.send(WorkerRequest::Generate { id, messages }).is_err() {
            self.pending.remove(&id);
            self.active_generation.store(NO_GENERATION, Ordering::Release);
            let err = self.worker_gone();
            self.status
                .set_with_message(AdapterStatus::Error, err.to_string());
            return Err(err);
        }

        let abort = AbortOnDrop {
            id,
            requests,
            armed: true,
        };
        let cancel = self.cancel.clone();

        let stream = async_stream::stream! {
            let mut abort = abort;
            loop {
                let item = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    item = rx.recv() => item,
                };
                match item {
                    Some(Ok(token)) => yield Ok(token),
                    Some(Err(e)) => {
                        abort.disarm();
                        warn!(error = %e, "local generation failed");
                        yield Err(e);
                        break;
                    }
                    None => {
                        abort.disarm();
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
        LOCAL_CONTEXT_LIMIT
    }

    fn set_status_listener(&self, listener: StatusListener) {
        self.status.set_listener(listener);
    }

    fn destroy(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        if let Some(worker) = self.worker.lock().take() {
            let in_flight: Vec<RequestId> = self
                .pending
                .iter()
                .filter(|entry| matches!(entry.value(), PendingCall::Generate(_)))
                .map(|entry| *entry.key())
                .collect();
            for id in in_flight {
                let _ = worker.send(WorkerRequest::Abort { id });
            }
        }
        self.pending.clear();
        self.active_generation.store(NO_GENERATION, Ordering::Release);
        self.status.set(AdapterStatus::Idle);
        debug!("local backend destroyed");
    }
}
