//! Single entry point over every backend.
//!
//! [`UnifiedAdapter`] holds at most one active backend. Switching models
//! destroys the current backend before the next one is created, so a
//! resident local model is released before another is loaded.

use std::collections::HashMap;
use std::sync::Arc;

use reqwest::Client;
use tracing::{info, instrument, warn};

use coach_core::models::{find_model, LOCAL_CONTEXT_LIMIT};
use coach_core::security::Credentials;
use coach_core::{
    AdapterStatus, BackendConfig, ChatBackend, CoachError, Message, ModelDescriptor,
    ProviderKind, StatusListener, Tier, TokenStream,
};

use crate::anthropic::{AnthropicAdapter, AnthropicProtocol};
use crate::google::{GoogleAdapter, GoogleProtocol};
use crate::local::{EngineFactory, GenerationParams, LocalAdapter};
use crate::mistral::{MistralAdapter, MistralProtocol};
use crate::remote::RemoteConfig;

/// Builds an uninitialised backend for a catalog entry.
pub trait BackendFactory: Send + Sync {
    fn create(&self, model: &'static ModelDescriptor) -> Result<Arc<dyn ChatBackend>, CoachError>;
}

/// Production factory: hosted providers over one shared HTTP client, plus the
/// local engine when one is compiled in.
pub struct DefaultBackendFactory {
    client: Client,
    remote: RemoteConfig,
    base_urls: HashMap<ProviderKind, String>,
    local: Option<(EngineFactory, GenerationParams)>,
}

impl DefaultBackendFactory {
    pub fn new(remote: RemoteConfig) -> Result<Self, CoachError> {
        let client = Client::builder()
            .connect_timeout(remote.connect_timeout)
            .build()
            .map_err(|e| CoachError::Network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            remote,
            base_urls: HashMap::new(),
            local: None,
        })
    }

    pub fn with_base_url(mut self, provider: ProviderKind, url: impl Into<String>) -> Self {
        self.base_urls.insert(provider, url.into());
        self
    }

    pub fn with_local_engine(mut self, engine: EngineFactory, params: GenerationParams) -> Self {
        self.local = Some((engine, params));
        self
    }

    fn remote_config(&self, provider: ProviderKind) -> RemoteConfig {
        RemoteConfig {
            base_url: self.base_urls.get(&provider).cloned(),
            ..self.remote.clone()
        }
    }
}

impl BackendFactory for DefaultBackendFactory {
    fn create(&self, model: &'static ModelDescriptor) -> Result<Arc<dyn ChatBackend>, CoachError> {
        let backend: Arc<dyn ChatBackend> = match model.provider {
            ProviderKind::Local => {
                let (engine, params) = self
                    .local
                    .as_ref()
                    .ok_or(CoachError::LocalEngineUnavailable)?;
                Arc::new(LocalAdapter::new(engine.clone(), params.clone()))
            }
            ProviderKind::Anthropic => Arc::new(AnthropicAdapter::with_client(
                AnthropicProtocol::new(model.api_model),
                self.client.clone(),
                self.remote_config(ProviderKind::Anthropic),
            )),
            ProviderKind::Google => Arc::new(GoogleAdapter::with_client(
                GoogleProtocol::new(model.api_model),
                self.client.clone(),
                self.remote_config(ProviderKind::Google),
            )),
            ProviderKind::Mistral => Arc::new(MistralAdapter::with_client(
                MistralProtocol::new(model.api_model),
                self.client.clone(),
                self.remote_config(ProviderKind::Mistral),
            )),
        };
        Ok(backend)
    }
}

struct ActiveBackend {
    model: &'static ModelDescriptor,
    backend: Arc<dyn ChatBackend>,
}

pub struct UnifiedAdapter {
    factory: Arc<dyn BackendFactory>,
    active: Option<ActiveBackend>,
    listener: Option<StatusListener>,
}

impl UnifiedAdapter {
    pub fn new(factory: Arc<dyn BackendFactory>) -> Self {
        Self {
            factory,
            active: None,
            listener: None,
        }
    }

    /// Register the listener relayed to the active backend and every backend
    /// created by later switches.
    pub fn on_status_change(&mut self, listener: StatusListener) {
        if let Some(active) = &self.active {
            active.backend.set_status_listener(listener.clone());
        }
        self.listener = Some(listener);
    }

    /// Make `model_id` the active model. The previous backend is always
    /// destroyed first; on failure no backend is active.
    #[instrument(skip(self, credentials))]
    pub async fn switch_model(
        &mut self,
        model_id: &str,
        credentials: &Credentials,
    ) -> Result<(), CoachError> {
        if let Some(previous) = self.active.take() {
            info!(from = previous.model.id, "releasing previous backend");
            previous.backend.destroy();
        }

        let model = find_model(model_id).ok_or_else(|| CoachError::UnknownModel(model_id.into()))?;
        let backend = self.factory.create(model)?;
        if let Some(listener) = &self.listener {
            backend.set_status_listener(listener.clone());
        }

        let config = BackendConfig {
            api_key: model
                .credential_name
                .and_then(|name| credentials.get(name))
                .cloned(),
        };
        if let Err(e) = backend.initialize(config).await {
            warn!(model = model.id, error = %e, "backend failed to initialize");
            backend.destroy();
            return Err(e);
        }

        info!(model = model.id, tier = %model.tier, "model active");
        self.active = Some(ActiveBackend { model, backend });
        Ok(())
    }

    pub async fn chat_stream(
        &self,
        transcript: &[Message],
        system_prompt: &str,
    ) -> Result<TokenStream, CoachError> {
        let backend = self
            .active
            .as_ref()
            .map(|a| a.backend.clone())
            .ok_or(CoachError::NoModelLoaded)?;
        backend.chat_stream(transcript, system_prompt).await
    }

    pub fn status(&self) -> AdapterStatus {
        self.active
            .as_ref()
            .map_or(AdapterStatus::Idle, |a| a.backend.status())
    }

    pub fn context_limit(&self) -> usize {
        self.active
            .as_ref()
            .map_or(LOCAL_CONTEXT_LIMIT, |a| a.backend.context_limit())
    }

    pub fn model_tier(&self) -> Tier {
        self.active.as_ref().map_or(Tier::Local, |a| a.model.tier)
    }

    pub fn current_model(&self) -> Option<&'static ModelDescriptor> {
        self.active.as_ref().map(|a| a.model)
    }

    pub fn destroy(&mut self) {
        if let Some(active) = self.active.take() {
            active.backend.destroy();
        }
    }
}

impl Drop for UnifiedAdapter {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::engine::scripted::ScriptedEngine;
    use crate::mock::{Journal, MockBackend, MockFactory, MockReply};
    use async_trait::async_trait;
    use std::time::Duration;
    use coach_core::security::ApiKey;
    use coach_core::StatusUpdate;
    use futures::StreamExt;
    use parking_lot::Mutex;

    fn keys() -> Credentials {
        let mut creds = Credentials::new();
        creds.insert("anthropic", ApiKey::new("sk-ant"));
        creds
    }

    #[tokio::test]
    async fn defaults_without_active_model() {
        let adapter = UnifiedAdapter::new(Arc::new(MockFactory::replying(&["x"])));
        assert_eq!(adapter.status(), AdapterStatus::Idle);
        assert_eq!(adapter.context_limit(), 8192);
        assert_eq!(adapter.model_tier(), Tier::Local);
        assert!(adapter.current_model().is_none());
        let err = match adapter.chat_stream(&[], "").await {
            Err(e) => e,
            Ok(_) => panic!("expected no model"),
        };
        assert_eq!(err, CoachError::NoModelLoaded);
    }

    #[tokio::test]
    async fn switch_destroys_previous_before_initializing_next() {
        let factory = Arc::new(MockFactory::replying(&["hi"]));
        let mut adapter = UnifiedAdapter::new(factory.clone());

        adapter.switch_model("smol", &keys()).await.unwrap();
        adapter.switch_model("anthropic", &keys()).await.unwrap();

        assert_eq!(
            factory.journal(),
            vec![
                "create:smol",
                "initialize:smol",
                "destroy:smol",
                "create:anthropic",
                "initialize:anthropic",
            ]
        );
        assert_eq!(adapter.model_tier(), Tier::Frontier);
        assert_eq!(adapter.current_model().map(|m| m.id), Some("anthropic"));
    }

    /// Journals the lifecycle of a real local adapter.
    struct JournaledLocal {
        inner: LocalAdapter,
        journal: Journal,
    }

    #[async_trait]
    impl ChatBackend for JournaledLocal {
        fn name(&self) -> &str {
            self.inner.name()
        }

        async fn initialize(&self, config: BackendConfig) -> Result<(), CoachError> {
            self.journal.lock().push("initialize:smol".into());
            self.inner.initialize(config).await
        }

        async fn chat_stream(
            &self,
            transcript: &[Message],
            system_prompt: &str,
        ) -> Result<TokenStream, CoachError> {
            self.inner.chat_stream(transcript, system_prompt).await
        }

        fn status(&self) -> AdapterStatus {
            self.inner.status()
        }

        fn context_limit(&self) -> usize {
            self.inner.context_limit()
        }

        fn set_status_listener(&self, listener: StatusListener) {
            self.inner.set_status_listener(listener);
        }

        fn destroy(&self) {
            self.journal.lock().push("destroy:smol".into());
            self.inner.destroy();
        }
    }

    /// Local models run on a scripted engine; hosted ones are mocks.
    struct ScriptedLocalFactory {
        engine: EngineFactory,
        journal: Journal,
    }

    impl BackendFactory for ScriptedLocalFactory {
        fn create(
            &self,
            model: &'static ModelDescriptor,
        ) -> Result<Arc<dyn ChatBackend>, CoachError> {
            self.journal.lock().push(format!("create:{}", model.id));
            let backend: Arc<dyn ChatBackend> = match model.provider {
                ProviderKind::Local => Arc::new(JournaledLocal {
                    inner: LocalAdapter::new(self.engine.clone(), GenerationParams::default()),
                    journal: self.journal.clone(),
                }),
                _ => Arc::new(
                    MockBackend::new(vec![MockReply::text(&["Hello"])])
                        .with_journal(model.id, self.journal.clone()),
                ),
            };
            Ok(backend)
        }
    }

    #[tokio::test]
    async fn switch_while_local_streams_ends_the_old_stream() {
        let pieces: Vec<String> = (0..200).map(|i| format!("w{i} ")).collect();
        let refs: Vec<&str> = pieces.iter().map(String::as_str).collect();
        let engine = ScriptedEngine::new(&refs).with_delay(Duration::from_millis(5));
        let journal = Journal::default();
        let mut adapter = UnifiedAdapter::new(Arc::new(ScriptedLocalFactory {
            engine: engine.factory(),
            journal: journal.clone(),
        }));

        adapter.switch_model("smol", &keys()).await.unwrap();
        let mut old = adapter.chat_stream(&[Message::user("go")], "").await.unwrap();
        assert_eq!(old.next().await.unwrap().unwrap(), "w0 ");
        assert_eq!(adapter.status(), AdapterStatus::Generating);

        adapter.switch_model("anthropic", &keys()).await.unwrap();

        let rest: Vec<_> = old.collect().await;
        assert!(rest.is_empty(), "old stream kept yielding: {rest:?}");
        let journal = journal.lock().clone();
        assert_eq!(
            journal,
            vec![
                "create:smol",
                "initialize:smol",
                "destroy:smol",
                "create:anthropic",
                "initialize:anthropic",
            ]
        );
        assert_eq!(adapter.model_tier(), Tier::Frontier);
        assert_eq!(adapter.status(), AdapterStatus::Ready);
    }

    #[tokio::test]
    async fn failed_switch_leaves_nothing_active() {
        let factory = Arc::new(MockFactory::new(|model| {
            let backend = MockBackend::new(vec![MockReply::text(&["ok"])]);
            if model.id == "google" {
                backend.failing_initialize(CoachError::missing_credential("google"))
            } else {
                backend
            }
        }));
        let mut adapter = UnifiedAdapter::new(factory.clone());
        adapter.switch_model("smol", &keys()).await.unwrap();

        let err = adapter.switch_model("google", &keys()).await.unwrap_err();
        assert_eq!(err, CoachError::missing_credential("google"));
        assert!(adapter.current_model().is_none());
        assert_eq!(adapter.status(), AdapterStatus::Idle);
        assert!(factory.created().iter().all(|b| b.is_destroyed()));
    }

    #[tokio::test]
    async fn unknown_model_rejected_after_release() {
        let factory = Arc::new(MockFactory::replying(&["x"]));
        let mut adapter = UnifiedAdapter::new(factory.clone());
        adapter.switch_model("smol", &keys()).await.unwrap();

        let err = adapter.switch_model("gpt-9", &keys()).await.unwrap_err();
        assert_eq!(err, CoachError::UnknownModel("gpt-9".into()));
        assert!(adapter.current_model().is_none());
        assert_eq!(factory.journal().last().map(String::as_str), Some("destroy:smol"));
    }

    #[tokio::test]
    async fn relays_listener_and_streams_from_active_backend() {
        let factory = Arc::new(MockFactory::replying(&["Wh", "y?"]));
        let mut adapter = UnifiedAdapter::new(factory.clone());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        adapter.on_status_change(Arc::new(move |u: &StatusUpdate| sink.lock().push(u.status)));

        adapter.switch_model("mistral", &keys()).await.unwrap();
        let text: String = adapter
            .chat_stream(&[Message::user("q")], "sys")
            .await
            .unwrap()
            .map(|t| t.unwrap())
            .collect::<Vec<_>>()
            .await
            .concat();

        assert_eq!(text, "Why?");
        assert_eq!(
            *seen.lock(),
            vec![AdapterStatus::Ready, AdapterStatus::Generating, AdapterStatus::Ready]
        );
        assert_eq!(factory.created()[0].calls()[0].system_prompt, "sys");
    }

    #[tokio::test]
    async fn drop_destroys_active_backend() {
        let factory = Arc::new(MockFactory::replying(&["x"]));
        {
            let mut adapter = UnifiedAdapter::new(factory.clone());
            adapter.switch_model("smol", &Credentials::new()).await.unwrap();
        }
        assert!(factory.created()[0].is_destroyed());
    }

    #[test]
    fn default_factory_without_engine_refuses_local() {
        let factory = DefaultBackendFactory::new(RemoteConfig::default()).unwrap();
        let err = match factory.create(&coach_core::models::SMOL_LOCAL) {
            Err(e) => e,
            Ok(_) => panic!("expected missing engine"),
        };
        assert_eq!(err, CoachError::LocalEngineUnavailable);
        assert!(factory.create(&coach_core::models::CLAUDE_HAIKU).is_ok());
    }
}
