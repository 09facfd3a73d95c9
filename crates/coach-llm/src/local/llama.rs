//! GGUF inference through llama.cpp, with weights fetched from the Hugging
//! Face hub on first load.

use std::num::NonZeroU32;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaChatMessage, LlamaChatTemplate, LlamaModel};
use llama_cpp_2::sampling::LlamaSampler;
use tracing::{debug, info, warn};

use coach_core::Message;

use super::engine::{
    download_message, EngineFactory, GenerationParams, InferenceEngine, InferenceError,
    TokenAction, LOADING_MESSAGE, WARMUP_MESSAGE,
};

#[derive(Clone, Debug)]
pub struct LlamaSettings {
    pub repo_id: String,
    pub file_name: String,
    pub context_size: u32,
    pub gpu_layers: Option<u32>,
}

struct LoadedModel {
    model: LlamaModel,
    template: LlamaChatTemplate,
}

pub struct LlamaEngine {
    settings: LlamaSettings,
    loaded: Option<LoadedModel>,
}

impl LlamaEngine {
    pub fn new(settings: LlamaSettings) -> Self {
        Self {
            settings,
            loaded: None,
        }
    }

    pub fn factory(settings: LlamaSettings) -> EngineFactory {
        Arc::new(move || Box::new(Self::new(settings.clone())) as Box<dyn InferenceEngine>)
    }

    fn fetch_weights(&self, report: &mut dyn FnMut(String)) -> Result<PathBuf, InferenceError> {
        let file = &self.settings.file_name;
        if let Some(path) = hf_hub::Cache::default()
            .model(self.settings.repo_id.clone())
            .get(file)
        {
            debug!(path = %path.display(), "using cached weights");
            return Ok(path);
        }

        info!(repo = %self.settings.repo_id, file = %file, "downloading model weights");
        let api = hf_hub::api::sync::Api::new()
            .map_err(|e| InferenceError::Download(format!("HF API init: {e}")))?;
        let progress = DownloadProgress {
            file: file.clone(),
            total: 0,
            received: 0,
            last_percent: None,
            report,
        };
        api.model(self.settings.repo_id.clone())
            .download_with_progress(file, progress)
            .map_err(|e| InferenceError::Download(format!("{file}: {e}")))
    }
}

/// The llama.cpp backend may be initialised once per process.
fn backend() -> Result<&'static LlamaBackend, InferenceError> {
    static BACKEND: OnceLock<Result<LlamaBackend, String>> = OnceLock::new();
    BACKEND
        .get_or_init(|| LlamaBackend::init().map_err(|e| e.to_string()))
        .as_ref()
        .map_err(|e| InferenceError::Load(format!("llama backend: {e}")))
}

struct DownloadProgress<'a> {
    file: String,
    total: usize,
    received: usize,
    last_percent: Option<u32>,
    report: &'a mut dyn FnMut(String),
}

impl DownloadProgress<'_> {
    fn emit(&mut self, percent: u32) {
        if self.last_percent != Some(percent) {
            self.last_percent = Some(percent);
            (self.report)(download_message(&self.file, percent));
        }
    }
}

impl hf_hub::api::Progress for DownloadProgress<'_> {
    fn init(&mut self, size: usize, _filename: &str) {
        self.total = size;
        self.emit(0);
    }

    fn update(&mut self, size: usize) {
        self.received += size;
        if self.total > 0 {
            let percent = (self.received.saturating_mul(100) / self.total).min(100);
            self.emit(percent as u32);
        }
    }

    fn finish(&mut self) {
        self.emit(100);
    }
}

fn generation_error(context: &str, e: impl std::fmt::Display) -> InferenceError {
    InferenceError::Generation(format!("{context}: {e}"))
}

impl InferenceEngine for LlamaEngine {
    fn load(&mut self, report: &mut dyn FnMut(String)) -> Result<(), InferenceError> {
        if self.loaded.is_some() {
            return Ok(());
        }
        let path = self.fetch_weights(report)?;

        report(LOADING_MESSAGE.to_string());
        let backend = backend()?;
        let mut params = LlamaModelParams::default();
        if let Some(layers) = self.settings.gpu_layers {
            params = params.with_n_gpu_layers(layers);
        }
        let model = LlamaModel::load_from_file(backend, &path, &params)
            .map_err(|e| InferenceError::Load(e.to_string()))?;

        report(WARMUP_MESSAGE.to_string());
        let template = match model.chat_template(None) {
            Ok(t) => t,
            Err(_) => {
                warn!("model has no embedded chat template, falling back to chatml");
                LlamaChatTemplate::new("chatml")
                    .map_err(|e| InferenceError::Load(format!("fallback chat template: {e}")))?
            }
        };

        info!(path = %path.display(), "model loaded");
        self.loaded = Some(LoadedModel { model, template });
        Ok(())
    }

    fn is_loaded(&self) -> bool {
        self.loaded.is_some()
    }

    fn generate(
        &mut self,
        messages: &[Message],
        params: &GenerationParams,
        on_piece: &mut dyn FnMut(&str) -> TokenAction,
    ) -> Result<String, InferenceError> {
        let loaded = self.loaded.as_ref().ok_or(InferenceError::NotLoaded)?;
        let backend = backend()?;

        let chat = messages
            .iter()
            .map(|m| LlamaChatMessage::new(m.role.as_str().to_string(), m.content.clone()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| generation_error("chat message", e))?;
        let prompt = loaded
            .model
            .apply_chat_template(&loaded.template, &chat, true)
            .map_err(|e| generation_error("chat template", e))?;
        let tokens = loaded
            .model
            .str_to_token(&prompt, AddBos::Never)
            .map_err(|e| generation_error("tokenize", e))?;

        let context_size = self.settings.context_size as usize;
        if tokens.len() >= context_size {
            return Err(InferenceError::Generation(format!(
                "prompt of {} tokens exceeds context of {context_size}",
                tokens.len()
            )));
        }

        let ctx_params =
            LlamaContextParams::default().with_n_ctx(NonZeroU32::new(self.settings.context_size));
        let mut ctx = loaded
            .model
            .new_context(backend, ctx_params)
            .map_err(|e| generation_error("context", e))?;

        let n_batch = (ctx.n_batch() as usize).max(1);
        for chunk in tokens.chunks(n_batch) {
            let mut batch = LlamaBatch::get_one(chunk)
                .map_err(|e| generation_error("batch", e))?;
            ctx.decode(&mut batch)
                .map_err(|e| generation_error("prefill", e))?;
        }

        let mut sampler = LlamaSampler::chain_simple([
            LlamaSampler::top_p(params.top_p, 1),
            LlamaSampler::temp(params.temperature),
            LlamaSampler::dist(rand::random::<u32>()),
        ]);
        let mut decoder = encoding_rs::UTF_8.new_decoder();
        let budget = (context_size - tokens.len()).min(params.max_new_tokens as usize);
        let mut text = String::new();

        for _ in 0..budget {
            let token = sampler.sample(&ctx, -1);
            sampler.accept(token);
            if loaded.model.is_eog_token(token) {
                break;
            }

            let piece = loaded
                .model
                .token_to_piece(token, &mut decoder, true, None)
                .map_err(|e| generation_error("detokenize", e))?;
            if !piece.is_empty() {
                text.push_str(&piece);
                if on_piece(&piece) == TokenAction::Stop {
                    break;
                }
            }

            let next = [token];
            let mut batch = LlamaBatch::get_one(&next)
                .map_err(|e| generation_error("batch", e))?;
            ctx.decode(&mut batch)
                .map_err(|e| generation_error("decode", e))?;
        }

        debug!(prompt_tokens = tokens.len(), chars = text.len(), "local generation complete");
        Ok(text)
    }
}
