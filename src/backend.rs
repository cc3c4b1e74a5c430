//! Narrow capability surface of the native inference backend.
//!
//! The kernel only ever talks to a backend through these traits. Freeing a
//! model or a context is dropping it.

pub mod candle;
#[cfg(any(test, feature = "scripted"))]
pub mod scripted;
mod tokenizer;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::errors::BackendError;
use crate::prompting::{ChatTemplate, PromptFamily};
use crate::sampling::SamplerChain;

pub type Token = u32;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackendOptions {
    /// Overrides the family inferred from the model file name.
    pub family: Option<PromptFamily>,
    pub tokenizer: Option<PathBuf>,
    /// Layers to offload to an accelerator. Backends without one reject a
    /// non-zero count.
    pub gpu_layers: u32,
}

/// Parameters a decode context is created with.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextParams {
    pub context_length: u32,
    pub batch_size: u32,
    pub thread_count: u32,
    pub batch_thread_count: u32,
    pub flash_attention: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoraAdapter {
    pub name: String,
    pub path: PathBuf,
    #[serde(default = "default_lora_scale")]
    pub scale: f32,
}

fn default_lora_scale() -> f32 {
    1.0
}

pub trait Backend: Send + Sync {
    fn name(&self) -> &'static str;

    fn load(
        &self,
        path: &Path,
        total_budget: u32,
        options: &BackendOptions,
    ) -> Result<Arc<dyn LoadedModel>, BackendError>;
}

pub trait LoadedModel: Send + Sync {
    fn family(&self) -> PromptFamily;

    fn template(&self) -> ChatTemplate {
        ChatTemplate::for_family(self.family())
    }

    fn tokenize(&self, text: &str) -> Result<Vec<Token>, BackendError>;

    fn token_to_piece(&self, token: Token) -> Result<String, BackendError>;

    fn is_end_of_generation(&self, token: Token) -> bool;

    fn create_context(&self, params: &ContextParams) -> Result<Box<dyn DecodeContext>, BackendError>;

    /// Whether the weights produce sequence embeddings rather than
    /// next-token logits.
    fn is_embedding_model(&self) -> bool {
        false
    }

    fn create_embedder(&self, _params: &ContextParams) -> Result<Box<dyn EmbedContext>, BackendError> {
        Err(BackendError::Unsupported("embedding context".to_string()))
    }

    /// Validates and loads an adapter so contexts can attach it.
    fn load_adapter(&self, adapter: &LoraAdapter) -> Result<(), BackendError>;
}

/// Per-context decode state. Only ever touched by the owning context's
/// worker thread.
pub trait DecodeContext: Send {
    /// Appends `batch` to the cache and computes logits for its last token.
    fn decode(&mut self, batch: &[Token]) -> Result<(), BackendError>;

    /// Draws the next token from the logits of the last decode. `history` is
    /// the token sequence currently held in the cache.
    fn sample(&mut self, chain: &SamplerChain, history: &[Token]) -> Result<Token, BackendError>;

    /// Drops every cached position at or after `keep`.
    fn truncate_cache(&mut self, keep: usize) -> Result<(), BackendError>;

    /// Remembers the current cache position as a prefix worth keeping.
    fn mark_checkpoint(&mut self) {}

    fn reset_sampler(&mut self) {}

    fn set_adapters(&mut self, adapters: &[LoraAdapter]) -> Result<(), BackendError>;
}

/// Per-context embedding state of an embedding model.
pub trait EmbedContext: Send {
    /// Width of every vector `embed` returns.
    fn embedding_length(&self) -> usize;

    /// Runs all sequences through the model as one batch on a cleared cache
    /// and returns one pooled vector per sequence, in input order.
    fn embed(&mut self, sequences: &[Vec<Token>]) -> Result<Vec<Vec<f32>>, BackendError>;
}
