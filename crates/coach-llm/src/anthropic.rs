use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};

use coach_core::models::CLAUDE_HAIKU;
use coach_core::security::ApiKey;
use coach_core::{CoachError, GenerationOptions, Message};

use crate::remote::{conversation_turns, RemoteAdapter, WireProtocol};
use crate::sse::parse_sse_data;

pub const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Anthropic Messages API: system prompt in a dedicated field, text from
/// `content_block_delta` events.
#[derive(Clone, Debug)]
pub struct AnthropicProtocol {
    model: String,
}

pub type AnthropicAdapter = RemoteAdapter<AnthropicProtocol>;

impl AnthropicProtocol {
    pub fn new(model: impl Into<String>) -> Self {
        Self { model: model.into() }
    }
}

impl Default for AnthropicProtocol {
    fn default() -> Self {
        Self::new(CLAUDE_HAIKU.api_model)
    }
}

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    #[serde(skip_serializing_if = "str::is_empty")]
    system: &'a str,
    messages: Vec<TurnBody<'a>>,
    stream: bool,
}

#[derive(Serialize)]
struct TurnBody<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct StreamEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    delta: Option<Delta>,
    #[serde(default)]
    error: Option<ApiError>,
}

#[derive(Deserialize)]
struct Delta {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize)]
struct ApiError {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    message: String,
}

impl WireProtocol for AnthropicProtocol {
    fn provider(&self) -> &'static str {
        "anthropic"
    }

    fn default_base_url(&self) -> &'static str {
        "https://api.anthropic.com"
    }

    fn context_limit(&self) -> usize {
        CLAUDE_HAIKU.context_limit
    }

    fn build_request(
        &self,
        client: &Client,
        base_url: &str,
        api_key: &ApiKey,
        transcript: &[Message],
        system_prompt: &str,
        options: &GenerationOptions,
    ) -> RequestBuilder {
        let body = MessagesRequest {
            model: &self.model,
            max_tokens: options.max_tokens,
            system: system_prompt,
            messages: conversation_turns(transcript)
                .map(|m| TurnBody {
                    role: m.role.as_str(),
                    content: &m.content,
                })
                .collect(),
            stream: true,
        };

        client
            .post(format!("{base_url}/v1/messages"))
            .header("x-api-key", api_key.expose())
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&body)
    }

    fn extract_text(&self, payload: &str) -> Result<Option<String>, CoachError> {
        let Some(event) = parse_sse_data::<StreamEvent>(payload, self.provider()) else {
            return Ok(None);
        };
        match event.kind.as_str() {
            "content_block_delta" => Ok(event
                .delta
                .and_then(|d| d.text)
                .filter(|t| !t.is_empty())),
            "error" => {
                let error = event.error.unwrap_or(ApiError {
                    kind: "error".into(),
                    message: String::new(),
                });
                Err(CoachError::StreamInterrupted(format!(
                    "{}: {}",
                    error.kind, error.message
                )))
            }
            _ => Ok(None),
        }
    }
}
