//! Dedicated inference thread.
//!
//! Model loading and token generation are blocking and CPU-bound, so they run
//! on their own OS thread. Requests arrive over a std channel; responses leave
//! over a tokio channel so the async side can await them. While a generation
//! runs, the thread polls its inbox between tokens so an `Abort` takes effect
//! before the next token is sent.

use std::collections::VecDeque;
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};

use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use coach_core::{CoachError, Message};

use super::engine::{GenerationParams, InferenceEngine, TokenAction};
use super::protocol::{RequestId, WorkerRequest, WorkerResponse};

pub(crate) const THREAD_NAME: &str = "coach-local-inference";

/// Owning handle to the worker thread. Dropping the last sender closes the
/// inbox and the thread exits after its current request.
pub(crate) struct WorkerHandle {
    requests: Sender<WorkerRequest>,
}

impl WorkerHandle {
    pub(crate) fn spawn(
        engine: Box<dyn InferenceEngine>,
        params: GenerationParams,
        responses: UnboundedSender<WorkerResponse>,
    ) -> Result<Self, CoachError> {
        let (requests, inbox) = mpsc::channel();
        std::thread::Builder::new()
            .name(THREAD_NAME.into())
            .spawn(move || run(engine, &params, &inbox, &responses))
            .map_err(|e| CoachError::Inference(format!("failed to spawn inference worker: {e}")))?;
        Ok(Self { requests })
    }

    pub(crate) fn sender(&self) -> Sender<WorkerRequest> {
        self.requests.clone()
    }

    pub(crate) fn send(&self, request: WorkerRequest) -> Result<(), CoachError> {
        self.requests
            .send(request)
            .map_err(|_| CoachError::Inference("inference worker exited".into()))
    }
}

fn run(
    mut engine: Box<dyn InferenceEngine>,
    params: &GenerationParams,
    inbox: &Receiver<WorkerRequest>,
    outbox: &UnboundedSender<WorkerResponse>,
) {
    debug!("inference worker started");
    let mut deferred = VecDeque::new();
    loop {
        let request = match deferred.pop_front() {
            Some(request) => request,
            None => match inbox.recv() {
                Ok(request) => request,
                Err(_) => break,
            },
        };
        match request {
            WorkerRequest::Init { id } => handle_init(engine.as_mut(), id, outbox),
            WorkerRequest::Generate { id, messages } => handle_generate(
                engine.as_mut(),
                id,
                &messages,
                params,
                inbox,
                &mut deferred,
                outbox,
            ),
            WorkerRequest::Abort { id } => debug!(id, "abort for finished request ignored"),
        }
        if outbox.is_closed() {
            break;
        }
    }
    debug!("inference worker exiting");
}

fn handle_init(
    engine: &mut dyn InferenceEngine,
    id: RequestId,
    outbox: &UnboundedSender<WorkerResponse>,
) {
    if engine.is_loaded() {
        let _ = outbox.send(WorkerResponse::Ready { id });
        return;
    }
    let mut report = |message: String| {
        let _ = outbox.send(WorkerResponse::Status { id, message });
    };
    let response = match engine.load(&mut report) {
        Ok(()) => {
            info!("local model loaded");
            WorkerResponse::Ready { id }
        }
        Err(e) => {
            warn!(error = %e, "local model failed to load");
            WorkerResponse::Error {
                id,
                error: e.to_string(),
            }
        }
    };
    let _ = outbox.send(response);
}

fn handle_generate(
    engine: &mut dyn InferenceEngine,
    id: RequestId,
    messages: &[Message],
    params: &GenerationParams,
    inbox: &Receiver<WorkerRequest>,
    deferred: &mut VecDeque<WorkerRequest>,
    outbox: &UnboundedSender<WorkerResponse>,
) {
    if !engine.is_loaded() {
        let _ = outbox.send(WorkerResponse::Error {
            id,
            error: "model not loaded".into(),
        });
        return;
    }

    let mut aborted = false;
    let mut on_piece = |piece: &str| -> TokenAction {
        loop {
            match inbox.try_recv() {
                Ok(WorkerRequest::Abort { id: target }) if target == id => {
                    aborted = true;
                    return TokenAction::Stop;
                }
                Ok(WorkerRequest::Abort { id: target }) => {
                    cancel_deferred(deferred, target, outbox)
                }
                Ok(other) => deferred.push_back(other),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    aborted = true;
                    return TokenAction::Stop;
                }
            }
        }
        if outbox
            .send(WorkerResponse::Token {
                id,
                token: piece.to_string(),
            })
            .is_err()
        {
            return TokenAction::Stop;
        }
        TokenAction::Continue
    };

    let response = match engine.generate(messages, params, &mut on_piece) {
        Ok(text) => {
            debug!(id, aborted, chars = text.len(), "generation finished");
            WorkerResponse::Done { id, text }
        }
        Err(e) => {
            warn!(id, error = %e, "generation failed");
            WorkerResponse::Error {
                id,
                error: e.to_string(),
            }
        }
    };
    let _ = outbox.send(response);
}

/// Drop a queued generation that was aborted before it started.
fn cancel_deferred(
    deferred: &mut VecDeque<WorkerRequest>,
    target: RequestId,
    outbox: &UnboundedSender<WorkerResponse>,
) {
    let before = deferred.len();
    deferred.retain(|r| !matches!(r, WorkerRequest::Generate { id, .. } if *id == target));
    if deferred.len() != before {
        let _ = outbox.send(WorkerResponse::Done {
            id: target,
            text: String::new(),
        });
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc::unbounded_channel;

    use super::super::engine::scripted::ScriptedEngine;
    use super::*;

    async fn next(rx: &mut tokio::sync::mpsc::UnboundedReceiver<WorkerResponse>) -> WorkerResponse {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("worker response")
            .expect("worker alive")
    }

    #[tokio::test]
    async fn init_reports_progress_then_ready() {
        let (tx, mut rx) = unbounded_channel();
        let engine = Box::new(ScriptedEngine::new(&[]));
        let worker = WorkerHandle::spawn(engine, GenerationParams::default(), tx).unwrap();
        worker.send(WorkerRequest::Init { id: 1 }).unwrap();

        let mut statuses = Vec::new();
        loop {
            match next(&mut rx).await {
                WorkerResponse::Status { id, message } => {
                    assert_eq!(id, 1);
                    statuses.push(message);
                }
                WorkerResponse::Ready { id } => {
                    assert_eq!(id, 1);
                    break;
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(statuses.first().map(String::as_str), Some("Downloading model.gguf... 0%"));
        assert!(statuses.iter().any(|s| s == "Loading model into memory..."));

        // Already loaded: no progress, immediate ready.
        worker.send(WorkerRequest::Init { id: 2 }).unwrap();
        assert_eq!(next(&mut rx).await, WorkerResponse::Ready { id: 2 });
    }

    #[tokio::test]
    async fn generate_streams_tokens_then_done() {
        let (tx, mut rx) = unbounded_channel();
        let worker = WorkerHandle::spawn(
            Box::new(ScriptedEngine::new(&["Why ", "that?"])),
            GenerationParams::default(),
            tx,
        )
        .unwrap();
        worker.send(WorkerRequest::Init { id: 1 }).unwrap();
        while !matches!(next(&mut rx).await, WorkerResponse::Ready { .. }) {}

        worker
            .send(WorkerRequest::Generate {
                id: 2,
                messages: vec![Message::user("hi")],
            })
            .unwrap();
        assert_eq!(
            next(&mut rx).await,
            WorkerResponse::Token { id: 2, token: "Why ".into() }
        );
        assert_eq!(
            next(&mut rx).await,
            WorkerResponse::Token { id: 2, token: "that?".into() }
        );
        assert_eq!(
            next(&mut rx).await,
            WorkerResponse::Done { id: 2, text: "Why that?".into() }
        );
    }

    #[tokio::test]
    async fn generate_before_load_errors() {
        let (tx, mut rx) = unbounded_channel();
        let engine = Box::new(ScriptedEngine::new(&["x"]));
        let worker = WorkerHandle::spawn(engine, GenerationParams::default(), tx).unwrap();
        worker
            .send(WorkerRequest::Generate { id: 5, messages: vec![] })
            .unwrap();
        assert_eq!(
            next(&mut rx).await,
            WorkerResponse::Error { id: 5, error: "model not loaded".into() }
        );
    }

    #[tokio::test]
    async fn abort_stops_generation_early() {
        let pieces: Vec<String> = (0..200).map(|i| format!("t{i} ")).collect();
        let refs: Vec<&str> = pieces.iter().map(String::as_str).collect();
        let engine = ScriptedEngine::new(&refs).with_delay(Duration::from_millis(5));
        let emitted = engine.emitted.clone();

        let (tx, mut rx) = unbounded_channel();
        let worker =
            WorkerHandle::spawn(Box::new(engine), GenerationParams::default(), tx).unwrap();
        worker.send(WorkerRequest::Init { id: 1 }).unwrap();
        while !matches!(next(&mut rx).await, WorkerResponse::Ready { .. }) {}

        worker
            .send(WorkerRequest::Generate { id: 2, messages: vec![] })
            .unwrap();
        assert!(matches!(next(&mut rx).await, WorkerResponse::Token { id: 2, .. }));
        worker.send(WorkerRequest::Abort { id: 2 }).unwrap();

        let done = loop {
            match next(&mut rx).await {
                WorkerResponse::Token { .. } => {}
                other => break other,
            }
        };
        assert!(matches!(done, WorkerResponse::Done { id: 2, .. }));
        assert!(emitted.load(std::sync::atomic::Ordering::SeqCst) < 200);
    }
}
