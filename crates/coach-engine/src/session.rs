//! One coaching conversation for a single phase of a unit.
//!
//! The session owns the transcript and persists it after every exchange.
//! It never holds the adapter; callers pass it in per call so a model switch
//! between exchanges needs no coordination with the session.

use std::sync::Arc;

use futures::StreamExt;
use tracing::{debug, instrument, warn};

use coach_core::curriculum::{CurriculumPhase, CurriculumUnit};
use coach_core::{CoachError, Message, Tier};
use coach_llm::UnifiedAdapter;

use crate::budget::{check_context_usage, truncate_conversation, ContextUsage};
use crate::error::{EngineError, Result};
use crate::prompt::{assemble_system_prompt, initial_greeting};
use crate::transcript::TranscriptStore;

/// Result of one exchange. A failed generation still produces a reply,
/// the `Error: ...` message recorded in the transcript.
#[derive(Debug)]
pub struct Exchange {
    pub reply: Message,
    pub error: Option<CoachError>,
}

impl Exchange {
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

pub struct CoachSession {
    unit: Arc<CurriculumUnit>,
    phase_index: usize,
    transcripts: TranscriptStore,
    transcript: Vec<Message>,
}

impl CoachSession {
    /// Load the phase's transcript, seeding it with the opening question when
    /// the conversation has not started yet.
    pub fn open(
        unit: Arc<CurriculumUnit>,
        phase_index: usize,
        transcripts: TranscriptStore,
    ) -> Result<Self> {
        let Some(phase) = unit.phase(phase_index) else {
            return Err(EngineError::InvalidPhaseIndex {
                unit: unit.id.clone(),
                index: phase_index,
                count: unit.phases.len(),
            });
        };

        let mut transcript = transcripts.load(&unit.id, &phase.id)?;
        if transcript.is_empty() {
            if let Some(greeting) = initial_greeting(&unit, phase_index) {
                transcript.push(Message::assistant(greeting));
                transcripts.save(&unit.id, &phase.id, &transcript)?;
            }
        }

        Ok(Self {
            unit,
            phase_index,
            transcripts,
            transcript,
        })
    }

    pub fn unit(&self) -> &CurriculumUnit {
        &self.unit
    }

    pub fn phase_index(&self) -> usize {
        self.phase_index
    }

    pub fn phase(&self) -> &CurriculumPhase {
        // Index validated in `open`.
        &self.unit.phases[self.phase_index]
    }

    pub fn transcript(&self) -> &[Message] {
        &self.transcript
    }

    pub fn system_prompt(&self, tier: Tier) -> String {
        assemble_system_prompt(&self.unit, self.phase_index, tier).unwrap_or_default()
    }

    pub fn context_usage(&self, tier: Tier) -> ContextUsage {
        check_context_usage(&self.system_prompt(tier), &self.transcript, tier)
    }

    /// Send one student message and stream the coach's reply into `on_token`.
    ///
    /// Generation failures do not fail the call: they are recorded as an
    /// assistant message and reported through [`Exchange::error`]. Only
    /// storage failures and empty input return `Err`.
    #[instrument(skip_all, fields(unit = %self.unit.id, phase = %self.phase().id))]
    pub async fn send(
        &mut self,
        adapter: &UnifiedAdapter,
        text: &str,
        mut on_token: impl FnMut(&str),
    ) -> Result<Exchange> {
        if text.trim().is_empty() {
            return Err(EngineError::EmptyMessage);
        }
        self.transcript.push(Message::user(text));

        let tier = adapter.model_tier();
        let system_prompt = self.system_prompt(tier);
        let mut window = truncate_conversation(&self.transcript, &system_prompt, tier);
        if window.last() != self.transcript.last() {
            warn!(%tier, "latest message exceeds budget; sending it alone");
            window = self.transcript.last().cloned().into_iter().collect();
        }
        debug!(sent = window.len(), total = self.transcript.len(), "dispatching exchange");

        let mut reply = String::new();
        let mut error = None;
        match adapter.chat_stream(&window, &system_prompt).await {
            Ok(mut stream) => {
                while let Some(item) = stream.next().await {
                    match item {
                        Ok(token) => {
                            on_token(&token);
                            reply.push_str(&token);
                        }
                        Err(e) => {
                            error = Some(e);
                            break;
                        }
                    }
                }
            }
            Err(e) => error = Some(e),
        }

        let reply = match &error {
            Some(e) => {
                warn!(error = %e, kind = e.error_kind(), "exchange failed");
                Message::assistant(format!("Error: {e}"))
            }
            None => Message::assistant(reply),
        };
        self.transcript.push(reply.clone());
        self.save()?;
        Ok(Exchange { reply, error })
    }

    /// Drop the conversation and start over from the opening question.
    pub fn reset(&mut self) -> Result<()> {
        self.transcript.clear();
        if let Some(greeting) = initial_greeting(&self.unit, self.phase_index) {
            self.transcript.push(Message::assistant(greeting));
        }
        self.save()
    }

    fn save(&self) -> Result<()> {
        self.transcripts
            .save(&self.unit.id, &self.phase().id, &self.transcript)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coach_core::security::Credentials;
    use coach_core::MemoryStore;
    use coach_llm::mock::{MockBackend, MockFactory, MockReply};

    fn unit() -> Arc<CurriculumUnit> {
        Arc::new(
            serde_json::from_value(serde_json::json!({
                "id": "etude-01",
                "title": "Intro",
                "coach_prompt_local": "Be brief.",
                "coach_prompt_frontier": "Be Socratic.",
                "phases": [
                    { "id": "setup", "label": "Setup",
                      "suggested_questions": ["What will you build?"] },
                    { "id": "reflect", "label": "Reflect" }
                ]
            }))
            .unwrap(),
        )
    }

    fn stores() -> (Arc<MemoryStore>, TranscriptStore) {
        let kv = Arc::new(MemoryStore::new());
        (kv.clone(), TranscriptStore::new(kv))
    }

    async fn adapter(factory: Arc<MockFactory>, model: &str) -> UnifiedAdapter {
        let mut adapter = UnifiedAdapter::new(factory);
        adapter.switch_model(model, &Credentials::new()).await.unwrap();
        adapter
    }

    #[test]
    fn open_seeds_and_persists_greeting() {
        let (_, transcripts) = stores();
        let session = CoachSession::open(unit(), 0, transcripts.clone()).unwrap();
        assert_eq!(session.transcript(), &[Message::assistant("What will you build?")]);
        assert_eq!(transcripts.load("etude-01", "setup").unwrap(), session.transcript());

        let generic = CoachSession::open(unit(), 1, transcripts).unwrap();
        assert!(generic.transcript()[0].content.contains("\"Reflect\""));
    }

    #[test]
    fn open_resumes_existing_transcript() {
        let (_, transcripts) = stores();
        let history = vec![Message::assistant("hi"), Message::user("hello")];
        transcripts.save("etude-01", "setup", &history).unwrap();
        let session = CoachSession::open(unit(), 0, transcripts).unwrap();
        assert_eq!(session.transcript(), history.as_slice());
    }

    #[test]
    fn open_rejects_bad_phase() {
        let (_, transcripts) = stores();
        assert!(matches!(
            CoachSession::open(unit(), 2, transcripts),
            Err(EngineError::InvalidPhaseIndex { index: 2, count: 2, .. })
        ));
    }

    #[tokio::test]
    async fn send_streams_and_persists_exchange() {
        let (_, transcripts) = stores();
        let factory = Arc::new(MockFactory::replying(&["Why ", "a parser?"]));
        let adapter = adapter(factory.clone(), "smol").await;
        let mut session = CoachSession::open(unit(), 0, transcripts.clone()).unwrap();

        let mut streamed = Vec::new();
        let exchange = session
            .send(&adapter, "A parser", |t| streamed.push(t.to_string()))
            .await
            .unwrap();

        assert!(!exchange.is_error());
        assert_eq!(streamed, vec!["Why ", "a parser?"]);
        assert_eq!(exchange.reply, Message::assistant("Why a parser?"));
        assert_eq!(
            transcripts.load("etude-01", "setup").unwrap(),
            vec![
                Message::assistant("What will you build?"),
                Message::user("A parser"),
                Message::assistant("Why a parser?"),
            ]
        );

        let call = &factory.created()[0].calls()[0];
        assert!(call.system_prompt.starts_with("Be brief.\n\nCurrent phase: Setup"));
        assert_eq!(call.transcript.len(), 2);
    }

    #[tokio::test]
    async fn frontier_model_gets_frontier_prompt() {
        let (_, transcripts) = stores();
        let factory = Arc::new(MockFactory::replying(&["ok"]));
        let adapter = adapter(factory.clone(), "mistral").await;
        let mut session = CoachSession::open(unit(), 0, transcripts).unwrap();
        session.send(&adapter, "hi", |_| {}).await.unwrap();
        let prompt = &factory.created()[0].calls()[0].system_prompt;
        assert!(prompt.starts_with("Be Socratic.\n\n--- Current Phase: Setup ---"));
    }

    #[tokio::test]
    async fn failure_is_recorded_as_error_message() {
        let (_, transcripts) = stores();
        let factory = Arc::new(MockFactory::new(|_| {
            MockBackend::new(vec![MockReply::Interrupted(
                vec!["Partial".into()],
                CoachError::StreamInterrupted("connection reset".into()),
            )])
        }));
        let adapter = adapter(factory, "smol").await;
        let mut session = CoachSession::open(unit(), 0, transcripts.clone()).unwrap();

        let exchange = session.send(&adapter, "hello", |_| {}).await.unwrap();
        assert_eq!(
            exchange.error,
            Some(CoachError::StreamInterrupted("connection reset".into()))
        );
        assert_eq!(
            exchange.reply.content,
            "Error: stream interrupted: connection reset"
        );
        assert_eq!(transcripts.load("etude-01", "setup").unwrap().len(), 3);
    }

    #[tokio::test]
    async fn no_model_loaded_becomes_error_reply() {
        let (_, transcripts) = stores();
        let adapter = UnifiedAdapter::new(Arc::new(MockFactory::replying(&["x"])));
        let mut session = CoachSession::open(unit(), 0, transcripts).unwrap();
        let exchange = session.send(&adapter, "hello", |_| {}).await.unwrap();
        assert_eq!(exchange.reply, Message::assistant("Error: no model loaded"));
    }

    #[tokio::test]
    async fn empty_input_is_rejected() {
        let (_, transcripts) = stores();
        let adapter = UnifiedAdapter::new(Arc::new(MockFactory::replying(&["x"])));
        let mut session = CoachSession::open(unit(), 0, transcripts).unwrap();
        assert!(matches!(
            session.send(&adapter, "   ", |_| {}).await,
            Err(EngineError::EmptyMessage)
        ));
        assert_eq!(session.transcript().len(), 1);
    }

    #[tokio::test]
    async fn oversized_history_falls_back_to_latest_message() {
        let (_, transcripts) = stores();
        // The greeting fits the local window; the 9000-token question does not.
        let huge = "x".repeat(36_000);
        let factory = Arc::new(MockFactory::replying(&["ok"]));
        let adapter = adapter(factory.clone(), "smol").await;
        let mut session = CoachSession::open(unit(), 0, transcripts).unwrap();

        session.send(&adapter, &huge, |_| {}).await.unwrap();
        let sent = &factory.created()[0].calls()[0].transcript;
        assert_eq!(sent, &vec![Message::user(huge)]);
    }

    #[test]
    fn usage_tracks_transcript() {
        let (_, transcripts) = stores();
        let session = CoachSession::open(unit(), 0, transcripts).unwrap();
        let usage = session.context_usage(Tier::Local);
        assert_eq!(usage.limit, 8192);
        assert!(usage.used > 0);
        assert_eq!(usage.warning, None);
    }

    #[test]
    fn reset_reseeds_greeting() {
        let (_, transcripts) = stores();
        transcripts
            .save("etude-01", "setup", &[Message::assistant("old"), Message::user("q")])
            .unwrap();
        let mut session = CoachSession::open(unit(), 0, transcripts.clone()).unwrap();
        session.reset().unwrap();
        assert_eq!(
            transcripts.load("etude-01", "setup").unwrap(),
            vec![Message::assistant("What will you build?")]
        );
    }
}
