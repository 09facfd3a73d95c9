use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use coach_core::curriculum::CurriculumUnit;
use coach_core::{KeyValueStore, ProviderKind};
use coach_engine::{transcript_key, PreferencesStore, ProgressStore, TranscriptStore};
use coach_llm::{CredentialCipher, DefaultBackendFactory, RemoteConfig};
use coach_settings::CoachSettings;
use coach_store::{Database, SqliteKvStore};

/// Everything a command needs, built once from settings.
pub struct App {
    pub settings: CoachSettings,
    pub progress: ProgressStore,
    pub transcripts: TranscriptStore,
    pub preferences: PreferencesStore,
    kv: SqliteKvStore,
}

impl App {
    pub fn open(settings: CoachSettings) -> anyhow::Result<Self> {
        let db_path = settings.storage.database_path();
        let db = Database::open(&db_path)
            .with_context(|| format!("failed to open database at {}", db_path.display()))?;
        let kv = SqliteKvStore::new(db);
        let store: Arc<dyn KeyValueStore> = Arc::new(kv.clone());

        let mut preferences = PreferencesStore::new(store.clone())
            .with_fallback_model(&settings.models.default_model);
        if settings.storage.encrypt_credentials {
            let key_path = settings.storage.key_path();
            let cipher = CredentialCipher::from_key_file(&key_path)
                .with_context(|| format!("failed to load key file {}", key_path.display()))?;
            preferences = preferences.with_cipher(cipher);
        }

        Ok(Self {
            progress: ProgressStore::new(store.clone()),
            transcripts: TranscriptStore::new(store),
            preferences,
            settings,
            kv,
        })
    }

    /// Per phase, whether a conversation is saved for it.
    pub fn saved_transcripts(&self, unit: &CurriculumUnit) -> anyhow::Result<Vec<bool>> {
        let keys = self.kv.keys_with_prefix(&format!("unit-chat-{}-", unit.id))?;
        Ok(unit
            .phases
            .iter()
            .map(|phase| keys.contains(&transcript_key(&unit.id, &phase.id)))
            .collect())
    }

    pub fn backend_factory(&self) -> anyhow::Result<DefaultBackendFactory> {
        let models = &self.settings.models;
        let remote = RemoteConfig {
            base_url: None,
            options: self.settings.generation.options(),
            connect_timeout: self.settings.network.connect_timeout(),
            idle_timeout: self.settings.network.stream_idle_timeout(),
        };
        let factory = DefaultBackendFactory::new(remote)?
            .with_base_url(ProviderKind::Anthropic, &models.anthropic_base_url)
            .with_base_url(ProviderKind::Google, &models.google_base_url)
            .with_base_url(ProviderKind::Mistral, &models.mistral_base_url);
        Ok(self.with_local_engine(factory))
    }

    #[cfg(feature = "llama")]
    fn with_local_engine(&self, factory: DefaultBackendFactory) -> DefaultBackendFactory {
        use coach_llm::local::llama::{LlamaEngine, LlamaSettings};
        use coach_llm::local::GenerationParams;

        let local = &self.settings.local;
        let engine = LlamaEngine::factory(LlamaSettings {
            repo_id: local.repo_id.clone(),
            file_name: local.file_name.clone(),
            context_size: local.context_size,
            gpu_layers: local.gpu_layers,
        });
        factory.with_local_engine(
            engine,
            GenerationParams {
                max_new_tokens: local.max_new_tokens,
                temperature: local.temperature,
                top_p: local.top_p,
            },
        )
    }

    #[cfg(not(feature = "llama"))]
    fn with_local_engine(&self, factory: DefaultBackendFactory) -> DefaultBackendFactory {
        factory
    }
}

pub fn load_unit(path: &Path) -> anyhow::Result<Arc<CurriculumUnit>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read unit {}", path.display()))?;
    let unit: CurriculumUnit = serde_json::from_str(&raw)
        .with_context(|| format!("invalid unit record in {}", path.display()))?;
    if unit.phases.is_empty() {
        anyhow::bail!("unit {} has no phases", unit.id);
    }
    info!(unit = %unit.id, phases = unit.phases.len(), "unit loaded");
    Ok(Arc::new(unit))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_unit_with_legacy_field_names() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("unit.json");
        std::fs::write(
            &path,
            r#"{"etude_id":"etude-01","title":"Intro","coach_prompt_smol":"Be brief.",
                "phases":[{"id":"setup","label":"Setup","coach_goals":["Scope it"]}]}"#,
        )
        .unwrap();
        let unit = load_unit(&path).unwrap();
        assert_eq!(unit.id, "etude-01");
        assert_eq!(unit.phases[0].goals, vec!["Scope it"]);
    }

    #[test]
    fn rejects_unit_without_phases() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("unit.json");
        std::fs::write(&path, r#"{"id":"u","title":"Empty","phases":[]}"#).unwrap();
        assert!(load_unit(&path).is_err());
    }

    #[test]
    fn opens_stores_under_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = CoachSettings::default();
        settings.storage.data_dir = dir.path().to_string_lossy().into_owned();

        let app = App::open(settings).unwrap();
        app.preferences.set_credential("anthropic", "sk-test").unwrap();
        assert!(dir.path().join("coach.db").exists());
        assert!(dir.path().join("credentials.key").exists());
        assert_eq!(app.preferences.credential_names().unwrap(), vec!["anthropic"]);
        assert!(app.backend_factory().is_ok());
    }

    #[test]
    fn reports_phases_with_saved_transcripts() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = CoachSettings::default();
        settings.storage.data_dir = dir.path().to_string_lossy().into_owned();
        let app = App::open(settings).unwrap();

        let raw = r#"{"id":"e1","title":"T","phases":[
            {"id":"setup","label":"Setup"},{"id":"work","label":"Work"}]}"#;
        let unit: CurriculumUnit = serde_json::from_str(raw).unwrap();
        app.transcripts
            .save("e1", "work", &[coach_core::Message::assistant("Hello")])
            .unwrap();
        // Another unit whose id extends this one must not leak in.
        app.transcripts
            .save("e1-extra", "setup", &[coach_core::Message::assistant("Hi")])
            .unwrap();

        assert_eq!(app.saved_transcripts(&unit).unwrap(), vec![false, true]);
    }
}
