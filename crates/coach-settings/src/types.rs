//! Settings type definitions.
//!
//! Field names are camelCase on disk. Every section implements [`Default`]
//! and is `#[serde(default)]`, so a partial file only overrides what it names.

use std::path::PathBuf;
use std::time::Duration;

use coach_core::GenerationOptions;
use serde::{Deserialize, Serialize};

/// Root settings type.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CoachSettings {
    pub storage: StorageSettings,
    pub logging: LoggingSettings,
    pub models: ModelSettings,
    pub generation: GenerationSettings,
    pub network: NetworkSettings,
    pub local: LocalModelSettings,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StorageSettings {
    /// Directory holding the database and the credential key file.
    pub data_dir: String,
    /// Encrypt stored provider keys at rest.
    pub encrypt_credentials: bool,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            data_dir: "~/.coach".to_string(),
            encrypt_credentials: true,
        }
    }
}

impl StorageSettings {
    /// `data_dir` with a leading `~` expanded against `$HOME`.
    pub fn resolved_data_dir(&self) -> PathBuf {
        expand_home(&self.data_dir)
    }

    pub fn database_path(&self) -> PathBuf {
        self.resolved_data_dir().join("coach.db")
    }

    pub fn key_path(&self) -> PathBuf {
        self.resolved_data_dir().join("credentials.key")
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModelSettings {
    /// Model used when no preference has been stored.
    pub default_model: String,
    pub anthropic_base_url: String,
    pub google_base_url: String,
    pub mistral_base_url: String,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            default_model: "smol".to_string(),
            anthropic_base_url: "https://api.anthropic.com".to_string(),
            google_base_url: "https://generativelanguage.googleapis.com".to_string(),
            mistral_base_url: "https://api.mistral.ai".to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GenerationSettings {
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        let defaults = GenerationOptions::default();
        Self {
            max_tokens: defaults.max_tokens,
            temperature: defaults.temperature,
            top_p: defaults.top_p,
        }
    }
}

impl GenerationSettings {
    pub fn options(&self) -> GenerationOptions {
        GenerationOptions {
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            top_p: self.top_p,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NetworkSettings {
    pub connect_timeout_ms: u64,
    /// Abort a provider stream after this long without a byte.
    pub stream_idle_timeout_ms: u64,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 30_000,
            stream_idle_timeout_ms: 90_000,
        }
    }
}

impl NetworkSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn stream_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.stream_idle_timeout_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LocalModelSettings {
    /// Hugging Face repository holding the GGUF weights.
    pub repo_id: String,
    pub file_name: String,
    pub context_size: u32,
    pub max_new_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub gpu_layers: Option<u32>,
}

impl Default for LocalModelSettings {
    fn default() -> Self {
        Self {
            repo_id: "bartowski/SmolLM2-1.7B-Instruct-GGUF".to_string(),
            file_name: "SmolLM2-1.7B-Instruct-Q4_K_M.gguf".to_string(),
            context_size: 8192,
            max_new_tokens: 512,
            temperature: 0.7,
            top_p: 0.9,
            gpu_layers: None,
        }
    }
}

fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~") {
        Some(rest) => {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(rest.trim_start_matches('/'))
        }
        None => PathBuf::from(path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_provider_parameters() {
        let settings = CoachSettings::default();
        assert_eq!(settings.generation.max_tokens, 1024);
        assert_eq!(settings.local.max_new_tokens, 512);
        assert_eq!(settings.network.stream_idle_timeout(), Duration::from_secs(90));
        assert_eq!(settings.models.default_model, "smol");
    }

    #[test]
    fn camel_case_on_disk() {
        let json = serde_json::to_value(CoachSettings::default()).unwrap();
        assert!(json["network"]["streamIdleTimeoutMs"].is_u64());
        assert!(json["local"]["maxNewTokens"].is_u64());
    }

    #[test]
    fn expand_home_only_touches_tilde() {
        assert_eq!(expand_home("/var/lib/coach"), PathBuf::from("/var/lib/coach"));
        assert!(!expand_home("~/.coach").to_string_lossy().starts_with('~'));
    }
}
