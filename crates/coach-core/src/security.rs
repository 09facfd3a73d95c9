use std::collections::BTreeMap;

use secrecy::{ExposeSecret, SecretString};

/// Wraps an API key with secrecy protection (zeroized on drop, redacted in Debug).
#[derive(Clone)]
pub struct ApiKey(pub SecretString);

impl ApiKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(SecretString::from(key.into()))
    }

    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }

    pub fn is_blank(&self) -> bool {
        self.expose().trim().is_empty()
    }
}

impl std::fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ApiKey([REDACTED])")
    }
}

/// Credential name (`"anthropic"`, `"google"`, ...) to secret.
#[derive(Clone, Debug, Default)]
pub struct Credentials {
    keys: BTreeMap<String, ApiKey>,
}

impl Credentials {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blank values are dropped so that a cleared field reads as "not set".
    pub fn insert(&mut self, name: impl Into<String>, key: ApiKey) {
        let name = name.into();
        if key.is_blank() {
            self.keys.remove(&name);
        } else {
            self.keys.insert(name, key);
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<ApiKey> {
        self.keys.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&ApiKey> {
        self.keys.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.keys.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Overlay keys found in the process environment.
    pub fn merge_env(&mut self) {
        for (name, vars) in env_vars::BY_CREDENTIAL {
            if let Some(value) = vars.iter().find_map(|v| std::env::var(v).ok()) {
                self.insert(*name, ApiKey::new(value));
            }
        }
    }
}

/// Environment variable names for each provider.
pub mod env_vars {
    pub const ANTHROPIC_API_KEY: &str = "ANTHROPIC_API_KEY";
    pub const GOOGLE_API_KEY: &str = "GOOGLE_API_KEY";
    pub const GEMINI_API_KEY: &str = "GEMINI_API_KEY";
    pub const MISTRAL_API_KEY: &str = "MISTRAL_API_KEY";

    pub(crate) const BY_CREDENTIAL: &[(&str, &[&str])] = &[
        ("anthropic", &[ANTHROPIC_API_KEY]),
        ("google", &[GOOGLE_API_KEY, GEMINI_API_KEY]),
        ("mistral", &[MISTRAL_API_KEY]),
    ];
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_key_debug_redacted() {
        let key = ApiKey::new("sk-ant-12345");
        let debug = format!("{:?}", key);
        assert!(!debug.contains("sk-ant"), "key leaked in debug: {debug}");
        assert!(debug.contains("REDACTED"));
    }

    #[test]
    fn api_key_expose_secret() {
        let key = ApiKey::new("sk-ant-12345");
        assert_eq!(key.expose(), "sk-ant-12345");
    }

    #[test]
    fn credentials_drop_blank_values() {
        let mut creds = Credentials::new();
        creds.insert("anthropic", ApiKey::new("sk-1"));
        creds.insert("anthropic", ApiKey::new("   "));
        assert!(creds.get("anthropic").is_none());
        assert!(creds.is_empty());
    }

    #[test]
    fn credentials_debug_redacted() {
        let mut creds = Credentials::new();
        creds.insert("mistral", ApiKey::new("secret-mistral"));
        let debug = format!("{creds:?}");
        assert!(!debug.contains("secret-mistral"));
        assert_eq!(creds.names().collect::<Vec<_>>(), vec!["mistral"]);
    }
}
