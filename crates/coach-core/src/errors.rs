/// Typed error hierarchy for backend and facade operations.
/// Grouped by [`ErrorKind`] so callers can tell a bad configuration apart from
/// a dropped connection.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum CoachError {
    // Configuration
    #[error("unknown model: {0}")]
    UnknownModel(String),
    #[error("{provider} API key not set")]
    MissingCredential { provider: String },
    #[error("local inference engine not available in this build")]
    LocalEngineUnavailable,

    // Transport
    #[error("{provider} API error: {status} {body}")]
    Http {
        provider: String,
        status: u16,
        body: String,
    },
    #[error("network error: {0}")]
    Network(String),
    #[error("stream interrupted: {0}")]
    StreamInterrupted(String),

    // Lifecycle
    #[error("no model loaded")]
    NoModelLoaded,
    #[error("model not initialized")]
    NotInitialized,
    #[error("backend destroyed")]
    Destroyed,

    // Local inference
    #[error("inference failed: {0}")]
    Inference(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Transport,
    Lifecycle,
    Inference,
}

impl CoachError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnknownModel(_)
            | Self::MissingCredential { .. }
            | Self::LocalEngineUnavailable => ErrorKind::Configuration,
            Self::Http { .. } | Self::Network(_) | Self::StreamInterrupted(_) => {
                ErrorKind::Transport
            }
            Self::NoModelLoaded | Self::NotInitialized | Self::Destroyed => ErrorKind::Lifecycle,
            Self::Inference(_) => ErrorKind::Inference,
        }
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::UnknownModel(_) => "unknown_model",
            Self::MissingCredential { .. } => "missing_credential",
            Self::LocalEngineUnavailable => "local_engine_unavailable",
            Self::Http { .. } => "http_status",
            Self::Network(_) => "network_error",
            Self::StreamInterrupted(_) => "stream_interrupted",
            Self::NoModelLoaded => "no_model_loaded",
            Self::NotInitialized => "not_initialized",
            Self::Destroyed => "destroyed",
            Self::Inference(_) => "inference_failed",
        }
    }

    pub fn missing_credential(provider: impl Into<String>) -> Self {
        Self::MissingCredential {
            provider: provider.into(),
        }
    }

    pub fn from_status(provider: impl Into<String>, status: u16, body: String) -> Self {
        Self::Http {
            provider: provider.into(),
            status,
            body,
        }
    }
}
