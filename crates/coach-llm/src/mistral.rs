use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};

use coach_core::models::MISTRAL_SMALL;
use coach_core::security::ApiKey;
use coach_core::{CoachError, GenerationOptions, Message};

use crate::remote::{conversation_turns, RemoteAdapter, WireProtocol};
use crate::sse::parse_sse_data;

/// OpenAI-style chat completions. The system prompt is the first element of
/// the message array and the stream ends with `data: [DONE]`.
#[derive(Clone, Debug)]
pub struct MistralProtocol {
    model: String,
}

pub type MistralAdapter = RemoteAdapter<MistralProtocol>;

impl MistralProtocol {
    pub fn new(model: impl Into<String>) -> Self {
        Self { model: model.into() }
    }
}

impl Default for MistralProtocol {
    fn default() -> Self {
        Self::new(MISTRAL_SMALL.api_model)
    }
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatTurn<'a>>,
    max_tokens: u32,
    temperature: f32,
    top_p: f32,
    stream: bool,
}

#[derive(Serialize)]
struct ChatTurn<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct CompletionChunk {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    #[serde(default)]
    delta: Option<ChoiceDelta>,
}

#[derive(Deserialize)]
struct ChoiceDelta {
    #[serde(default)]
    content: Option<String>,
}

impl WireProtocol for MistralProtocol {
    fn provider(&self) -> &'static str {
        "mistral"
    }

    fn default_base_url(&self) -> &'static str {
        "https://api.mistral.ai"
    }

    fn context_limit(&self) -> usize {
        MISTRAL_SMALL.context_limit
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
        let system = (!system_prompt.is_empty()).then_some(ChatTurn {
            role: "system",
            content: system_prompt,
        });
        let messages = system
            .into_iter()
            .chain(conversation_turns(transcript).map(|m| ChatTurn {
                role: m.role.as_str(),
                content: &m.content,
            }))
            .collect();

        let body = CompletionRequest {
            model: &self.model,
            messages,
            max_tokens: options.max_tokens,
            temperature: options.temperature,
            top_p: options.top_p,
            stream: true,
        };

        client
            .post(format!("{base_url}/v1/chat/completions"))
            .bearer_auth(api_key.expose())
            .json(&body)
    }

    fn extract_text(&self, payload: &str) -> Result<Option<String>, CoachError> {
        let text = parse_sse_data::<CompletionChunk>(payload, self.provider())
            .and_then(|chunk| chunk.choices.into_iter().next())
            .and_then(|choice| choice.delta)
            .and_then(|delta| delta.content)
            .filter(|t| !t.is_empty());
        Ok(text)
    }
}
