use std::sync::Arc;

use coach_core::Message;

pub const LOADING_MESSAGE: &str = "Loading model into memory...";
pub const WARMUP_MESSAGE: &str = "Compiling shaders and warming up...";

pub fn download_message(file: &str, percent: u32) -> String {
    format!("Downloading {file}... {percent}%")
}

#[derive(Clone, Debug, PartialEq)]
pub struct GenerationParams {
    pub max_new_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_new_tokens: 512,
            temperature: 0.7,
            top_p: 0.9,
        }
    }
}

/// Returned by the per-piece callback to continue or stop generation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenAction {
    Continue,
    Stop,
}

#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("model not loaded")]
    NotLoaded,
    #[error("model download failed: {0}")]
    Download(String),
    #[error("model load failed: {0}")]
    Load(String),
    #[error("generation failed: {0}")]
    Generation(String),
}

/// Blocking model runtime driven by the inference worker thread.
pub trait InferenceEngine: Send {
    /// Fetch and load weights. `report` receives human-readable progress.
    fn load(&mut self, report: &mut dyn FnMut(String)) -> Result<(), InferenceError>;

    fn is_loaded(&self) -> bool;

    /// Generate a reply to `messages` (system turn first, if any). `on_piece`
    /// is called between tokens and may stop generation early; the text
    /// produced so far is returned either way.
    fn generate(
        &mut self,
        messages: &[Message],
        params: &GenerationParams,
        on_piece: &mut dyn FnMut(&str) -> TokenAction,
    ) -> Result<String, InferenceError>;
}

/// Builds a fresh engine for each worker.
pub type EngineFactory = Arc<dyn Fn() -> Box<dyn InferenceEngine> + Send + Sync>;
