//! Deterministic in-process backend.
//!
//! Tokenizes one token per byte, replays a fixed reply when sampled and
//! records every decode batch, so callers can observe exactly what reached
//! the decode routine. With `embedding_length` set the model is an embedding
//! model whose vectors are folded from the token values.

use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use super::{
    Backend, BackendOptions, ContextParams, DecodeContext, EmbedContext, LoadedModel, LoraAdapter,
    Token,
};
use crate::errors::BackendError;
use crate::prompting::PromptFamily;
use crate::sampling::SamplerChain;

/// Token sampled once the reply is exhausted and no end token is scripted.
pub const FILLER_TOKEN: Token = b'x' as Token;

#[derive(Debug, Clone, Default)]
pub struct Script {
    pub family: Option<PromptFamily>,
    /// Tokens sampled in order after every fresh input.
    pub reply: Vec<Token>,
    /// Sampled once `reply` is exhausted; without it generation runs until
    /// the context is full.
    pub end_token: Option<Token>,
    pub load_delay: Duration,
    /// Slept before every context or embedder is created.
    pub create_delay: Duration,
    pub decode_delay: Duration,
    pub fail_load: Option<BackendError>,
    pub fail_context: Option<BackendError>,
    pub reject_adapters: bool,
    /// Honor partial truncations; when unset only a full reset succeeds.
    pub checkpoints: bool,
    pub embedding_length: Option<usize>,
}

impl Script {
    pub fn replying(text: &str) -> Self {
        Self {
            reply: text.bytes().map(Token::from).collect(),
            end_token: Some(0),
            checkpoints: true,
            ..Self::default()
        }
    }

    pub fn endless() -> Self {
        Self {
            checkpoints: true,
            ..Self::default()
        }
    }

    pub fn embedding(embedding_length: usize) -> Self {
        Self {
            embedding_length: Some(embedding_length),
            ..Self::default()
        }
    }
}

/// Vector the scripted embedder produces for `sequence`: token values
/// summed into `embedding_length` buckets by position.
pub fn folded_embedding(sequence: &[Token], embedding_length: usize) -> Vec<f32> {
    let mut values = vec![0.0; embedding_length.max(1)];
    let width = values.len();
    for (position, token) in sequence.iter().enumerate() {
        values[position % width] += *token as f32;
    }
    values
}

#[derive(Debug, Clone, Default)]
pub struct DecodeLog {
    batches: Arc<Mutex<Vec<Vec<Token>>>>,
}

impl DecodeLog {
    fn push(&self, batch: &[Token]) {
        self.batches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(batch.to_vec());
    }

    pub fn batches(&self) -> Vec<Vec<Token>> {
        self.batches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn tokens(&self) -> Vec<Token> {
        self.batches().into_iter().flatten().collect()
    }

    pub fn clear(&self) {
        self.batches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

#[derive(Debug, Clone)]
pub struct ScriptedBackend {
    script: Script,
    log: DecodeLog,
}

impl ScriptedBackend {
    pub fn new(script: Script) -> Self {
        Self {
            script,
            log: DecodeLog::default(),
        }
    }

    pub fn decode_log(&self) -> DecodeLog {
        self.log.clone()
    }
}

impl Backend for ScriptedBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn load(
        &self,
        path: &Path,
        _total_budget: u32,
        options: &BackendOptions,
    ) -> Result<Arc<dyn LoadedModel>, BackendError> {
        if !self.script.load_delay.is_zero() {
            thread::sleep(self.script.load_delay);
        }
        if let Some(err) = &self.script.fail_load {
            return Err(err.clone());
        }

        let family = options
            .family
            .or(self.script.family)
            .unwrap_or_else(|| PromptFamily::infer_from_filename(&path.to_string_lossy()));

        Ok(Arc::new(ScriptedModel {
            family,
            script: self.script.clone(),
            log: self.log.clone(),
        }))
    }
}

struct ScriptedModel {
    family: PromptFamily,
    script: Script,
    log: DecodeLog,
}

impl LoadedModel for ScriptedModel {
    fn family(&self) -> PromptFamily {
        self.family
    }

    fn tokenize(&self, text: &str) -> Result<Vec<Token>, BackendError> {
        if text.contains('\0') {
            return Err(BackendError::Tokenize("interior nul byte".to_string()));
        }
        Ok(text.bytes().map(Token::from).collect())
    }

    fn token_to_piece(&self, token: Token) -> Result<String, BackendError> {
        u8::try_from(token)
            .map(|byte| char::from(byte).to_string())
            .map_err(|_| BackendError::Tokenize(format!("token {} is not a byte", token)))
    }

    fn is_end_of_generation(&self, token: Token) -> bool {
        self.script.end_token == Some(token)
    }

    fn create_context(&self, params: &ContextParams) -> Result<Box<dyn DecodeContext>, BackendError> {
        self.before_create()?;

        Ok(Box::new(ScriptedContext {
            script: self.script.clone(),
            log: self.log.clone(),
            context_length: params.context_length as usize,
            position: 0,
            checkpoint: None,
            reply_cursor: 0,
        }))
    }

    fn is_embedding_model(&self) -> bool {
        self.script.embedding_length.is_some()
    }

    fn create_embedder(&self, params: &ContextParams) -> Result<Box<dyn EmbedContext>, BackendError> {
        let Some(embedding_length) = self.script.embedding_length else {
            return Err(BackendError::Unsupported("embedding on a generative model".to_string()));
        };
        self.before_create()?;

        Ok(Box::new(ScriptedEmbedder {
            script: self.script.clone(),
            log: self.log.clone(),
            context_length: params.context_length as usize,
            embedding_length,
        }))
    }

    fn load_adapter(&self, adapter: &LoraAdapter) -> Result<(), BackendError> {
        if self.script.reject_adapters {
            return Err(BackendError::Unsupported(format!("adapter {}", adapter.name)));
        }
        Ok(())
    }
}

impl ScriptedModel {
    fn before_create(&self) -> Result<(), BackendError> {
        if !self.script.create_delay.is_zero() {
            thread::sleep(self.script.create_delay);
        }
        match &self.script.fail_context {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

struct ScriptedEmbedder {
    script: Script,
    log: DecodeLog,
    context_length: usize,
    embedding_length: usize,
}

impl EmbedContext for ScriptedEmbedder {
    fn embedding_length(&self) -> usize {
        self.embedding_length
    }

    fn embed(&mut self, sequences: &[Vec<Token>]) -> Result<Vec<Vec<f32>>, BackendError> {
        let batch: Vec<Token> = sequences.iter().flatten().copied().collect();
        if batch.len() > self.context_length {
            return Err(BackendError::Decode("embedding batch overflow".to_string()));
        }
        if !self.script.decode_delay.is_zero() {
            thread::sleep(self.script.decode_delay);
        }

        self.log.push(&batch);
        Ok(sequences
            .iter()
            .map(|sequence| folded_embedding(sequence, self.embedding_length))
            .collect())
    }
}

struct ScriptedContext {
    script: Script,
    log: DecodeLog,
    context_length: usize,
    position: usize,
    checkpoint: Option<usize>,
    reply_cursor: usize,
}

impl DecodeContext for ScriptedContext {
    fn decode(&mut self, batch: &[Token]) -> Result<(), BackendError> {
        if self.position + batch.len() > self.context_length {
            return Err(BackendError::Decode("context overflow".to_string()));
        }
        if !self.script.decode_delay.is_zero() {
            thread::sleep(self.script.decode_delay);
        }

        // a multi-token batch is fresh input, the reply starts over
        if batch.len() > 1 {
            self.reply_cursor = 0;
        }

        self.log.push(batch);
        self.position += batch.len();
        Ok(())
    }

    fn sample(&mut self, _chain: &SamplerChain, _history: &[Token]) -> Result<Token, BackendError> {
        let token = match self.script.reply.get(self.reply_cursor) {
            Some(token) => *token,
            None => self.script.end_token.unwrap_or(FILLER_TOKEN),
        };
        self.reply_cursor += 1;
        Ok(token)
    }

    fn truncate_cache(&mut self, keep: usize) -> Result<(), BackendError> {
        if keep == 0 || keep == self.position {
            self.position = keep;
            return Ok(());
        }
        if self.script.checkpoints && self.checkpoint == Some(keep) {
            self.position = keep;
            return Ok(());
        }
        Err(BackendError::Unsupported(format!("truncate to {}", keep)))
    }

    fn mark_checkpoint(&mut self) {
        self.checkpoint = Some(self.position);
    }

    fn reset_sampler(&mut self) {
        self.reply_cursor = 0;
    }

    fn set_adapters(&mut self, adapters: &[LoraAdapter]) -> Result<(), BackendError> {
        if self.script.reject_adapters && !adapters.is_empty() {
            return Err(BackendError::Unsupported("adapters".to_string()));
        }
        Ok(())
    }
}
