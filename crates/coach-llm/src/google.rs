use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};

use coach_core::models::GEMINI_FLASH;
use coach_core::security::ApiKey;
use coach_core::{CoachError, GenerationOptions, Message, Role};

use crate::remote::{conversation_turns, RemoteAdapter, WireProtocol};
use crate::sse::parse_sse_data;

/// Gemini `streamGenerateContent` with `alt=sse`. Assistant turns are sent
/// with role `model`; the system prompt goes in `systemInstruction`.
#[derive(Clone, Debug)]
pub struct GoogleProtocol {
    model: String,
}

pub type GoogleAdapter = RemoteAdapter<GoogleProtocol>;

impl GoogleProtocol {
    pub fn new(model: impl Into<String>) -> Self {
        Self { model: model.into() }
    }
}

impl Default for GoogleProtocol {
    fn default() -> Self {
        Self::new(GEMINI_FLASH.api_model)
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    contents: Vec<Content<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<SystemInstruction<'a>>,
    generation_config: GenerationConfig,
}

#[derive(Serialize)]
struct Content<'a> {
    role: &'static str,
    parts: [TextPart<'a>; 1],
}

#[derive(Serialize)]
struct SystemInstruction<'a> {
    parts: [TextPart<'a>; 1],
}

#[derive(Serialize)]
struct TextPart<'a> {
    text: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    max_output_tokens: u32,
    temperature: f32,
    top_p: f32,
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    error: Option<ChunkError>,
}

#[derive(Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Deserialize)]
struct CandidatePart {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize)]
struct ChunkError {
    #[serde(default)]
    code: Option<u16>,
    #[serde(default)]
    message: String,
}

fn wire_role(role: Role) -> &'static str {
    match role {
        Role::Assistant => "model",
        Role::User | Role::System => "user",
    }
}

impl WireProtocol for GoogleProtocol {
    fn provider(&self) -> &'static str {
        "google"
    }

    fn default_base_url(&self) -> &'static str {
        "https://generativelanguage.googleapis.com"
    }

    fn context_limit(&self) -> usize {
        GEMINI_FLASH.context_limit
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
        let body = GenerateRequest {
            contents: conversation_turns(transcript)
                .map(|m| Content {
                    role: wire_role(m.role),
                    parts: [TextPart { text: &m.content }],
                })
                .collect(),
            system_instruction: (!system_prompt.is_empty()).then(|| SystemInstruction {
                parts: [TextPart {
                    text: system_prompt,
                }],
            }),
            generation_config: GenerationConfig {
                max_output_tokens: options.max_tokens,
                temperature: options.temperature,
                top_p: options.top_p,
            },
        };

        client
            .post(format!(
                "{base_url}/v1beta/models/{}:streamGenerateContent",
                self.model
            ))
            .query(&[("alt", "sse")])
            .header("x-goog-api-key", api_key.expose())
            .json(&body)
    }

    fn extract_text(&self, payload: &str) -> Result<Option<String>, CoachError> {
        let Some(chunk) = parse_sse_data::<StreamChunk>(payload, self.provider()) else {
            return Ok(None);
        };
        if let Some(error) = chunk.error {
            let code = error.code.map(|c| format!("{c} ")).unwrap_or_default();
            return Err(CoachError::StreamInterrupted(format!("{code}{}", error.message)));
        }

        let text: String = chunk
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
            .unwrap_or_default();
        Ok((!text.is_empty()).then_some(text))
    }
}
