use serde::{Deserialize, Serialize};

pub const LOCAL_CONTEXT_LIMIT: usize = 8_192;
pub const FRONTIER_CONTEXT_LIMIT: usize = 200_000;

/// Capability class of a model. Drives prompt richness and token budgeting.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    #[default]
    Local,
    Frontier,
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => f.write_str("local"),
            Self::Frontier => f.write_str("frontier"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Local,
    Anthropic,
    Google,
    Mistral,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => f.write_str("local"),
            Self::Anthropic => f.write_str("anthropic"),
            Self::Google => f.write_str("google"),
            Self::Mistral => f.write_str("mistral"),
        }
    }
}

/// Static description of a selectable model.
#[derive(Clone, Debug)]
pub struct ModelDescriptor {
    pub id: &'static str,
    pub label: &'static str,
    pub tier: Tier,
    pub provider: ProviderKind,
    /// Key under which the credential is stored, when one is required.
    pub credential_name: Option<&'static str>,
    pub context_limit: usize,
    /// Model name sent to the provider (or the local model family).
    pub api_model: &'static str,
}

impl ModelDescriptor {
    pub fn requires_credential(&self) -> bool {
        self.credential_name.is_some()
    }
}

pub static SMOL_LOCAL: ModelDescriptor = ModelDescriptor {
    id: "smol",
    label: "SmolLM2 (Local)",
    tier: Tier::Local,
    provider: ProviderKind::Local,
    credential_name: None,
    context_limit: LOCAL_CONTEXT_LIMIT,
    api_model: "SmolLM2-1.7B-Instruct",
};

pub static CLAUDE_HAIKU: ModelDescriptor = ModelDescriptor {
    id: "anthropic",
    label: "Claude Haiku",
    tier: Tier::Frontier,
    provider: ProviderKind::Anthropic,
    credential_name: Some("anthropic"),
    context_limit: FRONTIER_CONTEXT_LIMIT,
    api_model: "claude-haiku-4-5-20251001",
};

pub static GEMINI_FLASH: ModelDescriptor = ModelDescriptor {
    id: "google",
    label: "Gemini Flash",
    tier: Tier::Frontier,
    provider: ProviderKind::Google,
    credential_name: Some("google"),
    context_limit: 1_000_000,
    api_model: "gemini-2.0-flash",
};

pub static MISTRAL_SMALL: ModelDescriptor = ModelDescriptor {
    id: "mistral",
    label: "Mistral Small",
    tier: Tier::Frontier,
    provider: ProviderKind::Mistral,
    credential_name: Some("mistral"),
    context_limit: 32_000,
    api_model: "mistral-small-latest",
};

static ALL_MODELS: [&ModelDescriptor; 4] =
    [&SMOL_LOCAL, &CLAUDE_HAIKU, &GEMINI_FLASH, &MISTRAL_SMALL];

/// Look up a model by its catalog id.
pub fn find_model(id: &str) -> Option<&'static ModelDescriptor> {
    ALL_MODELS.iter().copied().find(|m| m.id == id)
}

pub fn default_model() -> &'static ModelDescriptor {
    &SMOL_LOCAL
}

pub fn all_models() -> &'static [&'static ModelDescriptor] {
    &ALL_MODELS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_known_models() {
        assert_eq!(find_model("smol").unwrap().tier, Tier::Local);
        assert_eq!(find_model("anthropic").unwrap().context_limit, 200_000);
        assert_eq!(find_model("google").unwrap().context_limit, 1_000_000);
        assert_eq!(find_model("mistral").unwrap().context_limit, 32_000);
        assert!(find_model("gpt-9").is_none());
    }

    #[test]
    fn only_remote_models_require_credentials() {
        for model in all_models() {
            assert_eq!(model.requires_credential(), model.provider != ProviderKind::Local);
        }
        assert_eq!(CLAUDE_HAIKU.credential_name, Some("anthropic"));
    }

    #[test]
    fn default_model_is_local() {
        assert_eq!(default_model().id, "smol");
        assert_eq!(default_model().context_limit, LOCAL_CONTEXT_LIMIT);
    }

    #[test]
    fn tier_serde() {
        assert_eq!(serde_json::to_string(&Tier::Frontier).unwrap(), r#""frontier""#);
        let tier: Tier = serde_json::from_str(r#""local""#).unwrap();
        assert_eq!(tier, Tier::Local);
    }
}
