//! Stored provider keys and the selected model.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, warn};

use coach_core::models::{all_models, default_model, find_model};
use coach_core::security::{ApiKey, Credentials};
use coach_core::{CoachError, KeyValueStore, ModelDescriptor};
use coach_llm::CredentialCipher;

use crate::error::{EngineError, Result};

pub const API_KEYS_KEY: &str = "unit-api-keys";
pub const MODEL_KEY: &str = "unit-model";

#[derive(Clone)]
pub struct PreferencesStore {
    store: Arc<dyn KeyValueStore>,
    cipher: Option<CredentialCipher>,
    fallback_model: &'static ModelDescriptor,
}

impl PreferencesStore {
    /// Keys are stored as given. Use [`with_cipher`](Self::with_cipher) to
    /// seal them at rest.
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            cipher: None,
            fallback_model: default_model(),
        }
    }

    pub fn with_cipher(mut self, cipher: CredentialCipher) -> Self {
        self.cipher = Some(cipher);
        self
    }

    /// Model reported when no valid preference is stored. Unknown ids keep
    /// the catalog default.
    pub fn with_fallback_model(mut self, id: &str) -> Self {
        match find_model(id) {
            Some(model) => self.fallback_model = model,
            None => warn!(model = id, "configured default model is not in the catalog"),
        }
        self
    }

    fn load_raw(&self) -> Result<BTreeMap<String, String>> {
        let Some(raw) = self.store.get(API_KEYS_KEY)? else {
            return Ok(BTreeMap::new());
        };
        match serde_json::from_str(&raw) {
            Ok(map) => Ok(map),
            Err(e) => {
                warn!(error = %e, "discarding unreadable credential record");
                Ok(BTreeMap::new())
            }
        }
    }

    fn save_raw(&self, map: &BTreeMap<String, String>) -> Result<()> {
        if map.is_empty() {
            self.store.remove(API_KEYS_KEY)?;
        } else {
            self.store.set(API_KEYS_KEY, &serde_json::to_string(map)?)?;
        }
        Ok(())
    }

    /// Stored keys, decrypted. Entries that cannot be opened are skipped.
    pub fn credentials(&self) -> Result<Credentials> {
        let mut credentials = Credentials::new();
        for (name, value) in self.load_raw()? {
            let plain = match (&self.cipher, CredentialCipher::is_sealed(&value)) {
                (Some(cipher), _) => match cipher.open(&value) {
                    Ok(plain) => plain,
                    Err(e) => {
                        warn!(credential = %name, error = %e, "cannot open stored key");
                        continue;
                    }
                },
                (None, true) => {
                    warn!(credential = %name, "stored key is sealed but no cipher is configured");
                    continue;
                }
                (None, false) => value,
            };
            credentials.insert(name, ApiKey::new(plain));
        }
        Ok(credentials)
    }

    /// Stored keys with any provider keys from the environment laid over them.
    pub fn effective_credentials(&self) -> Result<Credentials> {
        let mut credentials = self.credentials()?;
        credentials.merge_env();
        Ok(credentials)
    }

    /// Store a provider key. A blank value removes it.
    pub fn set_credential(&self, name: &str, value: &str) -> Result<()> {
        if !is_credential_name(name) {
            return Err(EngineError::UnknownCredential(name.to_string()));
        }
        let value = value.trim();
        if value.is_empty() {
            self.remove_credential(name)?;
            return Ok(());
        }

        let stored = match &self.cipher {
            Some(cipher) => cipher.seal(value)?,
            None => value.to_string(),
        };
        let mut map = self.load_raw()?;
        map.insert(name.to_string(), stored);
        self.save_raw(&map)?;
        debug!(credential = name, sealed = self.cipher.is_some(), "credential stored");
        Ok(())
    }

    /// Returns whether a key was stored under `name`.
    pub fn remove_credential(&self, name: &str) -> Result<bool> {
        let mut map = self.load_raw()?;
        let removed = map.remove(name).is_some();
        if removed {
            self.save_raw(&map)?;
        }
        Ok(removed)
    }

    pub fn credential_names(&self) -> Result<Vec<String>> {
        Ok(self.load_raw()?.into_keys().collect())
    }

    /// The selected model, falling back to the default when nothing valid is
    /// stored.
    pub fn model_preference(&self) -> Result<&'static ModelDescriptor> {
        let Some(id) = self.store.get(MODEL_KEY)? else {
            return Ok(self.fallback_model);
        };
        Ok(find_model(id.trim()).unwrap_or_else(|| {
            warn!(model = %id, "stored model is not in the catalog");
            self.fallback_model
        }))
    }

    pub fn set_model_preference(&self, id: &str) -> Result<&'static ModelDescriptor> {
        let model = find_model(id).ok_or_else(|| CoachError::UnknownModel(id.to_string()))?;
        self.store.set(MODEL_KEY, model.id)?;
        Ok(model)
    }
}

fn is_credential_name(name: &str) -> bool {
    all_models().iter().any(|m| m.credential_name == Some(name))
}
