//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`CoachSettings::default()`]
//! 2. If `~/.coach/settings.json` exists, deep-merge user values over defaults
//! 3. Apply `COACH_*` environment variable overrides (highest priority)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::CoachSettings;

/// Resolve the path to the settings file (`~/.coach/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".coach").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<CoachSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults; a file with invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<CoachSettings> {
    let defaults = serde_json::to_value(CoachSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: CoachSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
///
/// - Objects are merged recursively (source overrides target per-key)
/// - Arrays and primitives are replaced entirely by source
/// - Null values in source are skipped (preserving target)
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply environment variable overrides to loaded settings.
///
/// Invalid values are ignored with a warning and the file/default value kept.
pub fn apply_env_overrides(settings: &mut CoachSettings) {
    if let Some(v) = read_env_string("COACH_DATA_DIR") {
        settings.storage.data_dir = v;
    }
    if let Some(v) = read_env_bool("COACH_ENCRYPT_CREDENTIALS") {
        settings.storage.encrypt_credentials = v;
    }

    if let Some(v) = read_env_string("COACH_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = read_env_bool("COACH_LOG_JSON") {
        settings.logging.json = v;
    }

    if let Some(v) = read_env_string("COACH_DEFAULT_MODEL") {
        settings.models.default_model = v;
    }
    if let Some(v) = read_env_string("COACH_ANTHROPIC_BASE_URL") {
        settings.models.anthropic_base_url = v;
    }
    if let Some(v) = read_env_string("COACH_GOOGLE_BASE_URL") {
        settings.models.google_base_url = v;
    }
    if let Some(v) = read_env_string("COACH_MISTRAL_BASE_URL") {
        settings.models.mistral_base_url = v;
    }

    if let Some(v) = read_env_u32("COACH_MAX_TOKENS", 1, 65_536) {
        settings.generation.max_tokens = v;
    }
    if let Some(v) = read_env_f32("COACH_TEMPERATURE", 0.0, 2.0) {
        settings.generation.temperature = v;
    }

    if let Some(v) = read_env_u64("COACH_CONNECT_TIMEOUT_MS", 100, 600_000) {
        settings.network.connect_timeout_ms = v;
    }
    if let Some(v) = read_env_u64("COACH_STREAM_IDLE_TIMEOUT_MS", 1_000, 3_600_000) {
        settings.network.stream_idle_timeout_ms = v;
    }

    if let Some(v) = read_env_string("COACH_LOCAL_REPO") {
        settings.local.repo_id = v;
    }
    if let Some(v) = read_env_string("COACH_LOCAL_FILE") {
        settings.local.file_name = v;
    }
    if let Some(v) = read_env_u32("COACH_LOCAL_GPU_LAYERS", 0, 1_000) {
        settings.local.gpu_layers = Some(v);
    }
}

// ── Pure parsing functions (testable without env vars) ──

/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn parse_u32_range(val: &str, min: u32, max: u32) -> Option<u32> {
    let n: u32 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

pub fn parse_f32_range(val: &str, min: f32, max: f32) -> Option<f32> {
    let n: f32 = val.parse().ok()?;
    (n.is_finite() && n >= min && n <= max).then_some(n)
}

// ── Env var readers (thin wrappers) ──

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn read_env_bool(name: &str) -> Option<bool> {
    let val = std::env::var(name).ok()?;
    let result = parse_bool(&val);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid boolean env var, ignoring");
    }
    result
}

fn read_env_u32(name: &str, min: u32, max: u32) -> Option<u32> {
    let val = std::env::var(name).ok()?;
    let result = parse_u32_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid u32 env var, ignoring");
    }
    result
}

fn read_env_u64(name: &str, min: u64, max: u64) -> Option<u64> {
    let val = std::env::var(name).ok()?;
    let result = parse_u64_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid u64 env var, ignoring");
    }
    result
}

fn read_env_f32(name: &str, min: f32, max: f32) -> Option<f32> {
    let val = std::env::var(name).ok()?;
    let result = parse_f32_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid float env var, ignoring");
    }
    result
}
