use std::mem;
use std::sync::{Arc, PoisonError};
use std::thread;
use std::time::Instant;

use super::{ContextConfig, ContextCore, DecodeRequest};
use crate::backend::{DecodeContext, LoadedModel, LoraAdapter, Token};
use crate::client::FinishReason;
use crate::errors::{BackendError, ContextFailCode};
use crate::sampling::SamplerChain;

/// Buffers owned by the worker while any decode signal is raised. The
/// driver thread only touches them between requests.
pub(super) struct WorkerState {
    pub model: Option<Arc<dyn LoadedModel>>,
    pub decoder: Option<Box<dyn DecodeContext>>,
    pub config: Option<ContextConfig>,
    pub chain: SamplerChain,
    /// Tokens currently held in the backend cache.
    pub history: Vec<Token>,
    /// Tokens evicted from the cache that are re-fed before the next input.
    /// Non-empty only while `history` is empty.
    pub replay: Vec<Token>,
    pub locked_len: usize,
    pub pending: Vec<Token>,
    pub request: DecodeRequest,
    pub generated: Vec<Token>,
    pub outcome: Option<FinishReason>,
    pub processed: usize,
    pub failure: Option<BackendError>,
    pub init_failure: Option<ContextFailCode>,
    pub adapters: Vec<LoraAdapter>,
}

impl WorkerState {
    pub fn empty(chain: SamplerChain) -> Self {
        Self {
            model: None,
            decoder: None,
            config: None,
            chain,
            history: Vec::new(),
            replay: Vec::new(),
            locked_len: 0,
            pending: Vec::new(),
            request: DecodeRequest::default(),
            generated: Vec::new(),
            outcome: None,
            processed: 0,
            failure: None,
            init_failure: None,
            adapters: Vec::new(),
        }
    }

    /// Drops cached positions at or after `keep`. A backend that cannot cut
    /// its cache partially is reset instead and the kept prefix is queued
    /// for replay.
    pub fn truncate_to(&mut self, keep: usize) -> Result<(), BackendError> {
        if !self.replay.is_empty() {
            self.replay.truncate(keep);
            return Ok(());
        }
        if keep >= self.history.len() {
            return Ok(());
        }

        let decoder = self.decoder.as_mut().ok_or_else(missing_decoder)?;
        match decoder.truncate_cache(keep) {
            Ok(()) => self.history.truncate(keep),
            Err(BackendError::Unsupported(reason)) => {
                tracing::debug!(keep, %reason, "partial truncation unsupported, replaying prefix");
                decoder.truncate_cache(0)?;
                self.history.truncate(keep);
                self.replay = mem::take(&mut self.history);
            }
            Err(err) => return Err(err),
        }
        Ok(())
    }

    pub fn reset_cache(&mut self) -> Result<(), BackendError> {
        if let Some(decoder) = self.decoder.as_mut() {
            decoder.truncate_cache(0)?;
            decoder.reset_sampler();
        }
        self.history.clear();
        self.replay.clear();
        self.locked_len = 0;
        Ok(())
    }

    fn batch_size(&self) -> usize {
        self.config
            .as_ref()
            .map(|c| c.params.batch_size as usize)
            .unwrap_or(1)
            .max(1)
    }

    fn context_length(&self) -> usize {
        self.config
            .as_ref()
            .map(|c| c.params.context_length as usize)
            .unwrap_or(0)
    }
}

fn missing_decoder() -> BackendError {
    BackendError::Decode("context has no decoder".to_string())
}

pub(super) fn common_prefix_len(a: &[Token], b: &[Token]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

/// Worker loop of one processing context. Services one raised signal at a
/// time in priority order and parks when nothing is pending.
pub(super) fn run(core: Arc<ContextCore>) {
    loop {
        if core.destroy.is_raised() {
            teardown(&core);
            core.destroy.mark_finished();
            return;
        }

        if core.init.is_raised() {
            let ready = initialize(&core);
            core.init.mark_finished();
            if !ready {
                return;
            }
            continue;
        }

        if core.lora.is_raised() {
            apply_adapters(&core);
            core.lora.mark_finished();
        } else if core.kv_locked.is_raised() {
            decode_input(&core, true);
            core.kv_locked.mark_finished();
        } else if core.input.is_raised() {
            decode_input(&core, false);
            core.input.mark_finished();
        } else if core.generation.is_raised() {
            generate(&core);
            core.generation.mark_finished();
        } else {
            thread::park();
        }
    }
}

fn initialize(core: &ContextCore) -> bool {
    let started = Instant::now();
    let mut state = core.work.lock().unwrap_or_else(PoisonError::into_inner);

    let (Some(model), Some(config)) = (state.model.clone(), state.config.clone()) else {
        state.init_failure = Some(ContextFailCode::ModelNotInitialized);
        return false;
    };

    match model.create_context(&config.params) {
        Ok(mut decoder) => {
            if let Err(err) = decoder.set_adapters(&config.adapters) {
                tracing::warn!(context = %core.id, %err, "active adapters were not applied");
            }
            state.decoder = Some(decoder);
            drop(state);

            let elapsed = started.elapsed();
            core.diagnostics().record_load(elapsed);
            tracing::debug!(context = %core.id, load_ms = elapsed.as_millis() as u64, "decode context created");
            true
        }
        Err(err) => {
            tracing::warn!(context = %core.id, %err, "decode context creation failed");
            state.init_failure = Some(ContextFailCode::from(&err));
            false
        }
    }
}

fn teardown(core: &ContextCore) {
    let mut state = core.work.lock().unwrap_or_else(PoisonError::into_inner);
    state.decoder = None;
    state.model = None;
    state.history.clear();
    state.replay.clear();
    state.pending.clear();
    state.generated.clear();
    tracing::debug!(context = %core.id, "decode context freed");
}

fn apply_adapters(core: &ContextCore) {
    let mut state = core.work.lock().unwrap_or_else(PoisonError::into_inner);
    let adapters = state.adapters.clone();
    let result = match state.decoder.as_mut() {
        Some(decoder) => decoder.set_adapters(&adapters),
        None => Err(missing_decoder()),
    };
    if let Err(err) = result {
        state.failure = Some(err);
    }
}

fn decode_chunks(
    core: &ContextCore,
    state: &mut WorkerState,
    tokens: &[Token],
) -> Result<usize, BackendError> {
    let batch_size = state.batch_size();
    let decoder = state.decoder.as_mut().ok_or_else(missing_decoder)?;
    let mut decoded = 0;
    for chunk in tokens.chunks(batch_size) {
        if core.destroy.is_raised() {
            break;
        }
        decoder.decode(chunk)?;
        state.history.extend_from_slice(chunk);
        decoded += chunk.len();
    }
    Ok(decoded)
}

fn decode_into(
    core: &ContextCore,
    state: &mut WorkerState,
    pending: &[Token],
    kv_locked: bool,
) -> Result<usize, BackendError> {
    // a locked prefix shared with the cache is kept, not decoded again
    if kv_locked {
        let cached = if state.replay.is_empty() {
            &state.history
        } else {
            &state.replay
        };
        let common = common_prefix_len(cached, pending);
        state.truncate_to(common)?;
    }

    let replay = mem::take(&mut state.replay);
    let mut decoded = decode_chunks(core, state, &replay)?;

    let start = if kv_locked {
        state.history.len().min(pending.len())
    } else {
        0
    };
    decoded += decode_chunks(core, state, &pending[start..])?;

    if kv_locked {
        state.locked_len = pending.len();
        if let Some(decoder) = state.decoder.as_mut() {
            decoder.mark_checkpoint();
        }
    }
    Ok(decoded)
}

fn decode_input(core: &ContextCore, kv_locked: bool) {
    let started = Instant::now();
    let mut guard = core.work.lock().unwrap_or_else(PoisonError::into_inner);
    let state = &mut *guard;

    let pending = mem::take(&mut state.pending);
    let result = decode_into(core, state, &pending, kv_locked);

    match result {
        Ok(decoded) => {
            state.processed = pending.len();
            core.publish(state);
            drop(guard);
            core.diagnostics().record_prompt(decoded, started.elapsed());
            tracing::trace!(context = %core.id, decoded, kv_locked, "input decoded");
        }
        Err(err) => {
            tracing::warn!(context = %core.id, %err, kv_locked, "input decode failed");
            state.failure = Some(err);
            core.publish(state);
        }
    }
}

fn generate(core: &ContextCore) {
    let started = Instant::now();
    let mut guard = core.work.lock().unwrap_or_else(PoisonError::into_inner);
    let state = &mut *guard;

    state.generated.clear();
    state.outcome = None;

    if let Err(err) = generate_step(core, state) {
        tracing::warn!(context = %core.id, %err, "generation failed");
        state.failure = Some(err);
    }

    let produced = state.generated.len();
    core.publish(state);
    drop(guard);
    core.diagnostics().record_generation(produced, started.elapsed());
}

fn generate_step(core: &ContextCore, state: &mut WorkerState) -> Result<(), BackendError> {
    let request = state.request;
    let limit = state.context_length();
    let budget = request.token_at_most.max(1) as usize;
    let model = state.model.clone().ok_or_else(missing_decoder)?;
    let decoder = state.decoder.as_mut().ok_or_else(missing_decoder)?;

    loop {
        if core.destroy.is_raised() {
            return Ok(());
        }
        if state.history.len() >= limit {
            state.outcome = Some(FinishReason::TokenLimitReached);
            return Ok(());
        }
        if state.generated.len() >= budget {
            return Ok(());
        }

        let token = decoder.sample(&state.chain, &state.history)?;
        if model.is_end_of_generation(token) {
            state.outcome = Some(FinishReason::Finished);
            return Ok(());
        }

        state.generated.push(token);
        decoder.decode(&[token])?;
        state.history.push(token);

        if state.history.len() >= limit {
            state.outcome = Some(FinishReason::TokenLimitReached);
            return Ok(());
        }
    }
}
