//! Callback surfaces the kernel reports through.
//!
//! Every callback runs synchronously on the thread that drives
//! `ModelController::update` (embedding vectors: the thread calling
//! `EmbedderContext::next`), never on a worker thread.

use serde::Serialize;

use crate::backend::{LoraAdapter, Token};
use crate::context::ProcessingContext;
use crate::embedder::EmbedderContext;
use crate::errors::{ContextFailCode, InitFailCode};
use crate::model::ModelController;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// The model produced an end-of-generation token.
    Finished,
    /// The cursor reached the context length.
    TokenLimitReached,
    /// The context was destroyed mid-generation.
    Abandoned,
}

/// Consumer of a context's decode results. A context holds its client
/// weakly and accepts one at a time.
pub trait InferenceClient: Send + Sync {
    fn on_register(&self, _ctx: &ProcessingContext) {}

    fn on_unregister(&self, _ctx: &ProcessingContext) {}

    fn on_batch_processed(&self, ctx: &ProcessingContext, processed_len: usize, is_kv_locked: bool);

    /// `is_finish = true` carries no tokens and precedes `on_finish`.
    fn on_write(&self, ctx: &ProcessingContext, tokens: &[Token], is_finish: bool);

    fn on_finish(&self, ctx: &ProcessingContext, total_tokens: usize, reason: FinishReason);
}

pub trait ContextEvents: Send + Sync {
    fn on_initialize(&self, _ctx: &ProcessingContext) {}

    fn on_initialize_fail(&self, _ctx: &ProcessingContext, _code: ContextFailCode) {}

    fn on_destroy(&self, _ctx: &ProcessingContext) {}
}

/// Consumer of an embedder's vectors. Vectors are handed out one per
/// [`EmbedderContext::next`] call, on the thread making that call.
pub trait EmbedderClient: Send + Sync {
    fn on_register(&self, _ctx: &EmbedderContext) {}

    fn on_unregister(&self, _ctx: &EmbedderContext) {}

    fn on_batch_processed(&self, ctx: &EmbedderContext, processed_len: usize);

    /// `index` is the position of the source sequence in the input.
    fn on_write(&self, ctx: &EmbedderContext, embedding: &[f32], index: usize, is_finish: bool);

    /// `total_values` is the embedding length times the vectors written.
    fn on_finish(&self, ctx: &EmbedderContext, total_values: usize, reason: FinishReason);
}

pub trait EmbedderEvents: Send + Sync {
    fn on_initialize(&self, _ctx: &EmbedderContext) {}

    fn on_initialize_fail(&self, _ctx: &EmbedderContext, _code: ContextFailCode) {}

    fn on_destroy(&self, _ctx: &EmbedderContext) {}
}

pub trait ModelEvents: Send + Sync {
    fn on_initialize(&self, _model: &ModelController) {}

    fn on_initialize_fail(&self, _model: &ModelController, _code: InitFailCode) {}

    fn on_destroy(&self, _model: &ModelController) {}

    fn on_lora_operate(&self, _model: &ModelController, _active: &[LoraAdapter]) {}
}
