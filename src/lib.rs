//! Inference context kernel: loads a model, partitions its context budget
//! among processing and embedding contexts and drives their work on worker
//! threads, reporting results through client callbacks from a non-blocking
//! update sweep.

pub mod backend;
pub mod client;
pub mod config;
pub mod context;
pub mod driver;
pub mod embedder;
pub mod errors;
pub mod logging;
pub mod model;
pub mod prompting;
pub mod registry;
pub mod sampling;
pub mod signal;

pub use backend::{Backend, BackendOptions, EmbedContext, LoraAdapter, Token};
pub use client::{
    ContextEvents, EmbedderClient, EmbedderEvents, FinishReason, InferenceClient, ModelEvents,
};
pub use config::RuntimeConfig;
pub use context::{
    CacheMode, ContextDiagnostics, ContextStatus, DecodeKind, DecodeRequest, Dispatch,
    ProcessingContext,
};
pub use driver::Driver;
pub use embedder::EmbedderContext;
pub use errors::{
    BackendError, ConfigError, ContextError, ContextFailCode, ErrorKind, InitFailCode, ModelError,
    RegisterError,
};
pub use model::{ContextSettings, ModelController, ModelStatus};
pub use prompting::{ContextLine, PromptFamily, Role};
pub use registry::ContextHandle;
pub use sampling::{SamplerSet, SamplerStage};
