//! Processing contexts: one conversation against a loaded model.
//!
//! Mutating requests raise a [`Signal`] and return at once. The context's
//! worker thread services the signal and marks it finished; the next
//! [`ProcessingContext::update`] on the driver thread observes that and
//! reports to the attached [`InferenceClient`].

mod diagnostics;
mod worker;

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use diagnostics::ContextDiagnostics;

use crate::backend::{ContextParams, LoadedModel, LoraAdapter, Token};
use crate::client::{ContextEvents, FinishReason, InferenceClient};
use crate::errors::{ContextError, RegisterError};
use crate::model::Registrant;
use crate::prompting::ContextLine;
use crate::registry::Claim;
use crate::sampling::{SamplerChain, SamplerSet};
use crate::signal::Signal;
use worker::WorkerState;

/// Smallest context a model will register.
pub const MIN_CONTEXT_LENGTH: u32 = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheMode {
    /// The whole cache is evicted on `clear_response`; evicted tokens are
    /// replayed before the next input.
    #[default]
    AutoLogitStore,
    /// A locked prompt prefix survives `clear_response` and is reused by
    /// later kv-locked inputs.
    KvLock,
}

/// Parameters of one generation step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodeRequest {
    pub token_at_most: u32,
    /// Halt the context as this step is written; further requests return
    /// `Halted` until [`ProcessingContext::resume`].
    pub halt_on_write: bool,
    /// Pause in milliseconds a client intends before resuming. Carried for
    /// the client, the kernel does not wait on it.
    pub halt_delay: u32,
}

impl Default for DecodeRequest {
    fn default() -> Self {
        Self {
            token_at_most: 1,
            halt_on_write: false,
            halt_delay: 0,
        }
    }
}

impl DecodeRequest {
    pub fn tokens(token_at_most: u32) -> Self {
        Self {
            token_at_most,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecodeKind {
    Input,
    Generation,
    KvLocked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextStatus {
    Uninitialized,
    Initializing,
    Ready,
    Decoding(DecodeKind),
    Destroying,
    Destroyed,
}

/// Outcome of a request that was accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Scheduled,
    /// Completed synchronously on the calling thread.
    Applied,
    /// Merged into a generation step that is already pending.
    Coalesced,
    /// The context is being destroyed; nothing was scheduled.
    Destroying,
}

/// Configuration a context receives when its model registers it.
#[derive(Debug, Clone)]
pub struct ContextConfig {
    pub params: ContextParams,
    pub cache_mode: CacheMode,
    pub samplers: SamplerSet,
    pub adapters: Vec<LoraAdapter>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum Lifecycle {
    Uninitialized = 0,
    Initializing = 1,
    Ready = 2,
    Destroying = 3,
    Destroyed = 4,
}

impl Lifecycle {
    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Initializing,
            2 => Self::Ready,
            3 => Self::Destroying,
            4 => Self::Destroyed,
            _ => Self::Uninitialized,
        }
    }
}

/// State shared between a context and its worker thread.
pub(crate) struct ContextCore {
    id: Uuid,
    init: Signal,
    destroy: Signal,
    lora: Signal,
    kv_locked: Signal,
    input: Signal,
    generation: Signal,
    lifecycle: AtomicU8,
    released: AtomicBool,
    claim: Claim,
    cursor: AtomicUsize,
    replay_len: AtomicUsize,
    work: Mutex<WorkerState>,
    diagnostics: Mutex<ContextDiagnostics>,
}

impl ContextCore {
    fn lifecycle(&self) -> Lifecycle {
        Lifecycle::from_u8(self.lifecycle.load(Ordering::Acquire))
    }

    fn set_lifecycle(&self, lifecycle: Lifecycle) {
        self.lifecycle.store(lifecycle as u8, Ordering::Release);
    }

    fn work(&self) -> MutexGuard<'_, WorkerState> {
        self.work.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn diagnostics(&self) -> MutexGuard<'_, ContextDiagnostics> {
        self.diagnostics.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, state: &WorkerState) {
        self.cursor.store(state.history.len(), Ordering::Release);
        self.replay_len.store(state.replay.len(), Ordering::Release);
    }

    fn decode_engaged(&self) -> bool {
        self.kv_locked.is_engaged()
            || self.input.is_engaged()
            || self.generation.is_engaged()
            || self.lora.is_engaged()
    }
}

struct MainState {
    client: Option<Weak<dyn InferenceClient>>,
    model: Option<Arc<dyn LoadedModel>>,
    config: Option<ContextConfig>,
    halted: bool,
    input_open: bool,
}

pub struct ProcessingContext {
    core: Arc<ContextCore>,
    main: Mutex<MainState>,
    worker: Mutex<Option<JoinHandle<()>>>,
    events: Option<Arc<dyn ContextEvents>>,
}

impl Default for ProcessingContext {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessingContext {
    pub fn new() -> Self {
        let chain = SamplerChain::from_set(&SamplerSet::new());
        Self {
            core: Arc::new(ContextCore {
                id: Uuid::new_v4(),
                init: Signal::new(),
                destroy: Signal::new(),
                lora: Signal::new(),
                kv_locked: Signal::new(),
                input: Signal::new(),
                generation: Signal::new(),
                lifecycle: AtomicU8::new(Lifecycle::Uninitialized as u8),
                released: AtomicBool::new(false),
                claim: Claim::new(),
                cursor: AtomicUsize::new(0),
                replay_len: AtomicUsize::new(0),
                work: Mutex::new(WorkerState::empty(chain)),
                diagnostics: Mutex::new(ContextDiagnostics::default()),
            }),
            main: Mutex::new(MainState {
                client: None,
                model: None,
                config: None,
                halted: false,
                input_open: false,
            }),
            worker: Mutex::new(None),
            events: None,
        }
    }

    pub fn with_events(events: Arc<dyn ContextEvents>) -> Self {
        let mut ctx = Self::new();
        ctx.events = Some(events);
        ctx
    }

    pub fn id(&self) -> Uuid {
        self.core.id
    }

    fn main(&self) -> MutexGuard<'_, MainState> {
        self.main.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wake(&self) {
        if let Some(handle) = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            handle.thread().unpark();
        }
    }

    fn worker_exited(&self) -> bool {
        self.worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|handle| handle.is_finished())
            .unwrap_or(true)
    }

    fn join_worker(&self) {
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::error!(context = %self.core.id, "context worker panicked");
            }
        }
    }

    fn client(&self) -> Option<Arc<dyn InferenceClient>> {
        self.main().client.as_ref().and_then(Weak::upgrade)
    }

    pub fn status(&self) -> ContextStatus {
        match self.core.lifecycle() {
            Lifecycle::Uninitialized => ContextStatus::Uninitialized,
            Lifecycle::Initializing => ContextStatus::Initializing,
            Lifecycle::Destroying => ContextStatus::Destroying,
            Lifecycle::Destroyed => ContextStatus::Destroyed,
            Lifecycle::Ready => {
                if self.core.kv_locked.is_raised() {
                    ContextStatus::Decoding(DecodeKind::KvLocked)
                } else if self.core.input.is_raised() {
                    ContextStatus::Decoding(DecodeKind::Input)
                } else if self.core.generation.is_raised() {
                    ContextStatus::Decoding(DecodeKind::Generation)
                } else {
                    ContextStatus::Ready
                }
            }
        }
    }

    /// Whether a new input or generation request would be scheduled now.
    pub fn is_available(&self) -> bool {
        self.core.lifecycle() == Lifecycle::Ready && !self.main().halted && !self.core.decode_engaged()
    }

    /// No request is in flight and none is waiting to be reported. A
    /// context still initializing is not drained.
    pub fn is_drained(&self) -> bool {
        self.core.lifecycle() != Lifecycle::Initializing && !self.core.decode_engaged()
    }

    pub fn is_registered(&self) -> bool {
        matches!(
            self.core.lifecycle(),
            Lifecycle::Initializing | Lifecycle::Ready | Lifecycle::Destroying
        )
    }

    pub fn is_halted(&self) -> bool {
        self.main().halted
    }

    pub fn has_client(&self) -> bool {
        self.client().is_some()
    }

    /// Tokens held in the backend cache.
    pub fn cursor(&self) -> usize {
        self.core.cursor.load(Ordering::Acquire)
    }

    /// Tokens counted against the context length, including evicted tokens
    /// waiting for replay.
    pub fn cached_tokens(&self) -> usize {
        self.cursor() + self.core.replay_len.load(Ordering::Acquire)
    }

    pub fn context_length(&self) -> Option<u32> {
        self.main().config.as_ref().map(|c| c.params.context_length)
    }

    pub fn cache_mode(&self) -> Option<CacheMode> {
        self.main().config.as_ref().map(|c| c.cache_mode)
    }

    pub fn diagnostics(&self) -> ContextDiagnostics {
        self.core.diagnostics().clone()
    }

    pub(crate) fn registration_released(&self) -> bool {
        self.core.released.load(Ordering::Acquire)
    }

    /// Claims the context for a model and starts its worker.
    pub(crate) fn start(
        &self,
        model: Arc<dyn LoadedModel>,
        config: ContextConfig,
    ) -> Result<(), RegisterError> {
        // held until the previous owner prunes its entry
        if !self.core.claim.acquire() {
            return Err(RegisterError::AlreadyRegistered);
        }
        let current = self.core.lifecycle();
        if !matches!(current, Lifecycle::Uninitialized | Lifecycle::Destroyed) {
            self.core.claim.release();
            return Err(RegisterError::AlreadyRegistered);
        }
        if self
            .core
            .lifecycle
            .compare_exchange(
                current as u8,
                Lifecycle::Initializing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            self.core.claim.release();
            return Err(RegisterError::AlreadyRegistered);
        }

        self.join_worker();
        for signal in self.signals() {
            signal.hard_reset();
        }

        {
            let mut state = self.core.work();
            *state = WorkerState::empty(SamplerChain::from_set(&config.samplers));
            state.model = Some(Arc::clone(&model));
            state.adapters = config.adapters.clone();
            state.config = Some(config.clone());
            self.core.publish(&state);
        }
        {
            let mut main = self.main();
            main.model = Some(model);
            main.config = Some(config);
            main.halted = false;
            main.input_open = false;
        }
        self.core.released.store(false, Ordering::Release);
        self.core.init.raise();

        let core = Arc::clone(&self.core);
        let spawned = thread::Builder::new()
            .name(format!("ctx-{}", &self.core.id.simple().to_string()[..8]))
            .spawn(move || worker::run(core));

        match spawned {
            Ok(handle) => {
                *self.worker.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
                tracing::debug!(context = %self.core.id, "context worker started");
                Ok(())
            }
            Err(err) => {
                self.core.init.hard_reset();
                {
                    let mut main = self.main();
                    main.model = None;
                    main.config = None;
                }
                self.core.set_lifecycle(current);
                self.core.claim.release();
                Err(RegisterError::WorkerSpawn(err))
            }
        }
    }

    fn signals(&self) -> [&Signal; 6] {
        [
            &self.core.init,
            &self.core.destroy,
            &self.core.lora,
            &self.core.kv_locked,
            &self.core.input,
            &self.core.generation,
        ]
    }

    /// Checks shared by every request. `Ok(Some(_))` short-circuits with an
    /// informational dispatch.
    fn admit(&self, main: &MainState) -> Result<Option<Dispatch>, ContextError> {
        match self.core.lifecycle() {
            Lifecycle::Uninitialized | Lifecycle::Destroyed => Err(ContextError::NotRegistered),
            Lifecycle::Initializing => Err(ContextError::Initializing),
            Lifecycle::Destroying => Ok(Some(Dispatch::Destroying)),
            Lifecycle::Ready if main.halted => Err(ContextError::Halted),
            Lifecycle::Ready => Ok(None),
        }
    }

    fn loaded_model(&self) -> Result<Arc<dyn LoadedModel>, ContextError> {
        self.main().model.clone().ok_or(ContextError::NotRegistered)
    }

    pub fn tokenize_input(&self, text: &str) -> Result<Vec<Token>, ContextError> {
        self.loaded_model()?
            .tokenize(text)
            .map_err(|e| ContextError::TokenizationFailed(e.to_string()))
    }

    /// Wraps every line in the model's chat markers and tokenizes the result.
    pub fn tokenize_conversation(
        &self,
        lines: &[ContextLine],
        append_assistant: bool,
    ) -> Result<Vec<Token>, ContextError> {
        let model = self.loaded_model()?;
        let rendered = model.template().render(lines, append_assistant);
        model
            .tokenize(&rendered)
            .map_err(|e| ContextError::TokenizationFailed(e.to_string()))
    }

    pub fn token_to_piece(&self, token: Token) -> Result<String, ContextError> {
        self.loaded_model()?
            .token_to_piece(token)
            .map_err(|e| ContextError::TokenizationFailed(e.to_string()))
    }

    pub fn execute_input(&self, tokens: &[Token], kv_locked: bool) -> Result<Dispatch, ContextError> {
        let main = self.main();
        if let Some(dispatch) = self.admit(&main)? {
            return Ok(dispatch);
        }
        if tokens.is_empty() {
            return Err(ContextError::InputIsEmpty);
        }

        let config = main.config.as_ref().ok_or(ContextError::NotRegistered)?;
        if kv_locked && config.cache_mode != CacheMode::KvLock {
            return Err(ContextError::OperationNotSupported(
                "kv-locked input outside the kv-lock cache mode",
            ));
        }
        if self.core.decode_engaged() {
            return Err(ContextError::AlreadyProcessing);
        }

        let limit = config.params.context_length;
        let cached = if kv_locked { 0 } else { self.cached_tokens() };
        if tokens.len() + cached > limit as usize {
            return Err(ContextError::InputExceedsLimit {
                requested: tokens.len(),
                cached,
                limit,
            });
        }

        self.core.work().pending = tokens.to_vec();
        let signal = if kv_locked {
            &self.core.kv_locked
        } else {
            &self.core.input
        };
        signal.raise();
        drop(main);
        self.wake();

        tracing::trace!(context = %self.core.id, tokens = tokens.len(), kv_locked, "input scheduled");
        Ok(Dispatch::Scheduled)
    }

    /// Schedules one generation step. Call again after every non-final
    /// `on_write` to keep generating.
    pub fn next(&self, request: DecodeRequest) -> Result<Dispatch, ContextError> {
        let main = self.main();
        if let Some(dispatch) = self.admit(&main)? {
            return Ok(dispatch);
        }
        if self.core.generation.is_raised() {
            return Ok(Dispatch::Coalesced);
        }
        if self.core.decode_engaged() {
            return Err(ContextError::AlreadyProcessing);
        }
        if !main.input_open {
            return Err(ContextError::MissingInput);
        }

        self.core.work().request = request;
        self.core.generation.raise();
        drop(main);
        self.wake();
        Ok(Dispatch::Scheduled)
    }

    /// Blocking form of [`ProcessingContext::next`]: waits out a pending
    /// input decode, schedules the step and delivers its results before
    /// returning.
    pub fn next_sync(&self, request: DecodeRequest) -> Result<Dispatch, ContextError> {
        if self.core.kv_locked.is_engaged() || self.core.input.is_engaged() {
            self.core.kv_locked.wait_finished();
            self.core.input.wait_finished();
            self.update();
        }

        let dispatch = self.next(request)?;
        if dispatch != Dispatch::Destroying {
            self.core.generation.wait_finished();
            self.update();
        }
        Ok(dispatch)
    }

    /// `Ok(None)` while the context is being destroyed.
    fn idle_config(&self, main: &MainState) -> Result<Option<ContextConfig>, ContextError> {
        match self.core.lifecycle() {
            Lifecycle::Ready => {}
            Lifecycle::Initializing => return Err(ContextError::Initializing),
            Lifecycle::Destroying => return Ok(None),
            Lifecycle::Uninitialized | Lifecycle::Destroyed => {
                return Err(ContextError::NotRegistered)
            }
        }
        if self.core.decode_engaged() {
            return Err(ContextError::AlreadyProcessing);
        }
        main.config.clone().map(Some).ok_or(ContextError::NotRegistered)
    }

    /// Evicts the last response. In kv-lock mode the locked prefix stays
    /// cached; otherwise the whole cache is evicted and replayed before the
    /// next input.
    pub fn clear_response(&self) -> Result<Dispatch, ContextError> {
        let mut main = self.main();
        let Some(config) = self.idle_config(&main)? else {
            return Ok(Dispatch::Destroying);
        };

        let mut state = self.core.work();
        let result = match config.cache_mode {
            CacheMode::KvLock => {
                let keep = state.locked_len;
                state.truncate_to(keep)
            }
            CacheMode::AutoLogitStore => {
                let history = std::mem::take(&mut state.history);
                let reset = match state.decoder.as_mut() {
                    Some(decoder) => decoder.truncate_cache(0),
                    None => Ok(()),
                };
                state.replay.extend(history);
                reset
            }
        };
        if let Some(decoder) = state.decoder.as_mut() {
            decoder.reset_sampler();
        }
        self.core.publish(&state);
        main.input_open = false;

        result.map(|()| Dispatch::Applied).map_err(|err| {
            tracing::warn!(context = %self.core.id, %err, "cache eviction failed");
            ContextError::OperationNotSupported("cache eviction rejected by backend")
        })
    }

    pub fn clear_kv_cache(&self) -> Result<Dispatch, ContextError> {
        let mut main = self.main();
        if self.idle_config(&main)?.is_none() {
            return Ok(Dispatch::Destroying);
        }

        let mut state = self.core.work();
        let result = state.reset_cache();
        self.core.publish(&state);
        main.input_open = false;

        result.map(|()| Dispatch::Applied).map_err(|err| {
            tracing::warn!(context = %self.core.id, %err, "cache reset failed");
            ContextError::OperationNotSupported("cache reset rejected by backend")
        })
    }

    /// Attaches the single client of this context. `on_register` runs on the
    /// calling thread before this returns.
    pub fn set_inference_client(&self, client: Arc<dyn InferenceClient>) -> Result<(), ContextError> {
        {
            let mut main = self.main();
            if main.client.as_ref().and_then(Weak::upgrade).is_some() {
                return Err(ContextError::AlreadyProcessing);
            }
            main.client = Some(Arc::downgrade(&client));
        }
        client.on_register(self);
        Ok(())
    }

    /// Returns `true` when a live client was detached.
    pub fn release_inference_client(&self) -> bool {
        let client = self.main().client.take().and_then(|weak| weak.upgrade());
        match client {
            Some(client) => {
                client.on_unregister(self);
                true
            }
            None => false,
        }
    }

    /// Stops accepting inputs and generation steps. In-flight work still
    /// completes and is reported.
    pub fn halt(&self) {
        self.main().halted = true;
    }

    pub fn resume(&self) {
        self.main().halted = false;
    }

    pub fn destroy(&self) -> Result<Dispatch, ContextError> {
        match self.core.lifecycle() {
            Lifecycle::Uninitialized => Err(ContextError::NotRegistered),
            Lifecycle::Destroying | Lifecycle::Destroyed => Ok(Dispatch::Destroying),
            Lifecycle::Initializing | Lifecycle::Ready => {
                self.request_teardown();
                Ok(Dispatch::Scheduled)
            }
        }
    }

    /// Blocks until the worker has torn the context down, then delivers the
    /// destroy callbacks on the calling thread.
    pub fn destroy_sync(&self) -> Result<Dispatch, ContextError> {
        let dispatch = self.destroy()?;
        self.wait_torn_down();
        self.update();
        Ok(dispatch)
    }

    /// Raises the destroy signal without delivering any callback.
    pub(crate) fn request_teardown(&self) {
        let current = self.core.lifecycle();
        if matches!(current, Lifecycle::Initializing | Lifecycle::Ready) {
            self.core.set_lifecycle(Lifecycle::Destroying);
        }
        if self.core.lifecycle() == Lifecycle::Destroying && self.core.destroy.raise() {
            tracing::debug!(context = %self.core.id, "teardown requested");
            self.wake();
        }
    }

    pub(crate) fn wait_torn_down(&self) {
        while !self.core.destroy.wait_finished_timeout(Duration::from_millis(10)) {
            if self.worker_exited() {
                break;
            }
        }
    }

    pub(crate) fn apply_adapters(&self, adapters: Vec<LoraAdapter>) {
        if self.core.lifecycle() != Lifecycle::Ready {
            self.resume();
            return;
        }
        self.core.work().adapters = adapters;
        self.core.lora.raise();
        self.wake();
    }

    /// Observes finished work and reports it. Never blocks on the worker.
    pub fn update(&self) {
        match self.core.lifecycle() {
            Lifecycle::Uninitialized | Lifecycle::Destroyed => return,
            _ => {}
        }

        if self.core.destroy.is_raised() && !self.worker_exited() {
            return;
        }
        if self.core.destroy.is_engaged() {
            self.finalize_destroy();
            return;
        }

        if self.core.init.acknowledge() {
            self.finish_init();
            return;
        }
        if self.core.lifecycle() != Lifecycle::Ready {
            return;
        }

        if self.core.lora.acknowledge() {
            self.finish_lora();
        }
        if self.core.kv_locked.acknowledge() {
            self.finish_input(true);
        }
        if self.core.input.acknowledge() {
            self.finish_input(false);
        }
        if self.core.generation.acknowledge() {
            self.finish_generation();
        }
    }

    fn finish_init(&self) {
        let failure = self.core.work().init_failure.take();
        match failure {
            None => {
                self.core.set_lifecycle(Lifecycle::Ready);
                tracing::info!(context = %self.core.id, "context ready");
                if let Some(events) = &self.events {
                    events.on_initialize(self);
                }
            }
            Some(code) => {
                self.join_worker();
                {
                    let mut main = self.main();
                    main.model = None;
                    main.config = None;
                }
                self.core.work().model = None;
                self.core.set_lifecycle(Lifecycle::Uninitialized);
                self.core.released.store(true, Ordering::Release);
                tracing::warn!(context = %self.core.id, ?code, "context initialization failed");
                if let Some(events) = &self.events {
                    events.on_initialize_fail(self, code);
                }
            }
        }
    }

    fn finish_lora(&self) {
        if let Some(err) = self.core.work().failure.take() {
            tracing::warn!(context = %self.core.id, %err, "adapter switch failed");
        }
        self.resume();
    }

    fn finish_input(&self, kv_locked: bool) {
        let (processed, failure) = {
            let mut state = self.core.work();
            (state.processed, state.failure.take())
        };
        let client = self.client();

        match failure {
            None => {
                self.main().input_open = true;
                if let Some(client) = client {
                    client.on_batch_processed(self, processed, kv_locked);
                }
            }
            Some(err) => {
                self.main().input_open = false;
                tracing::error!(context = %self.core.id, %err, "input abandoned");
                if let Some(client) = client {
                    client.on_finish(self, self.cursor(), FinishReason::Abandoned);
                }
            }
        }
    }

    fn finish_generation(&self) {
        let (tokens, outcome, halt_on_write) = {
            let mut state = self.core.work();
            let tokens = std::mem::take(&mut state.generated);
            let outcome = match state.failure.take() {
                Some(err) => {
                    tracing::error!(context = %self.core.id, %err, "generation abandoned");
                    Some(FinishReason::Abandoned)
                }
                None => state.outcome.take(),
            };
            (tokens, outcome, state.request.halt_on_write)
        };
        if outcome.is_some() {
            self.main().input_open = false;
        }

        let Some(client) = self.client() else {
            return;
        };
        if halt_on_write {
            self.halt();
            tracing::trace!(context = %self.core.id, "halted on write");
        }
        if !tokens.is_empty() {
            client.on_write(self, &tokens, false);
        }
        if let Some(reason) = outcome {
            tracing::debug!(context = %self.core.id, cursor = self.cursor(), ?reason, "generation finished");
            client.on_write(self, &[], true);
            client.on_finish(self, self.cursor(), reason);
        }
    }

    fn finalize_destroy(&self) {
        self.core.destroy.acknowledge();
        self.join_worker();

        let in_flight = self.core.generation.is_engaged();
        for signal in self.signals() {
            signal.hard_reset();
        }

        let client = {
            let mut main = self.main();
            main.model = None;
            main.input_open = false;
            main.halted = false;
            main.client.take().and_then(|weak| weak.upgrade())
        };
        self.core.set_lifecycle(Lifecycle::Destroyed);
        self.core.released.store(true, Ordering::Release);
        tracing::info!(context = %self.core.id, "context destroyed");

        if let Some(client) = client {
            if in_flight {
                client.on_finish(self, self.cursor(), FinishReason::Abandoned);
            }
            client.on_unregister(self);
        }
        if let Some(events) = &self.events {
            events.on_destroy(self);
        }
    }
}

impl Registrant for ProcessingContext {
    fn id(&self) -> Uuid {
        self.core.id
    }

    fn registration_released(&self) -> bool {
        ProcessingContext::registration_released(self)
    }

    fn release_claim(&self) {
        self.core.claim.release();
    }

    fn update(&self) {
        ProcessingContext::update(self);
    }

    fn halt(&self) {
        ProcessingContext::halt(self);
    }

    fn resume(&self) {
        ProcessingContext::resume(self);
    }

    fn is_drained(&self) -> bool {
        ProcessingContext::is_drained(self)
    }

    fn apply_adapters(&self, adapters: Vec<LoraAdapter>) {
        ProcessingContext::apply_adapters(self, adapters);
    }

    fn request_teardown(&self) {
        ProcessingContext::request_teardown(self);
    }

    fn wait_torn_down(&self) {
        ProcessingContext::wait_torn_down(self);
    }
}

impl Drop for ProcessingContext {
    fn drop(&mut self) {
        let handle = self
            .worker
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            self.core.destroy.raise();
            handle.thread().unpark();
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::scripted::{Script, ScriptedBackend, FILLER_TOKEN};
    use crate::backend::{Backend, BackendOptions};
    use crate::client::recording::{Event, Recorder};
    use std::path::Path;

    fn config(context_length: u32, cache_mode: CacheMode) -> ContextConfig {
        ContextConfig {
            params: ContextParams {
                context_length,
                batch_size: 4,
                thread_count: 1,
                batch_thread_count: 1,
                flash_attention: false,
            },
            cache_mode,
            samplers: SamplerSet::new(),
            adapters: Vec::new(),
        }
    }

    fn started(script: Script, context_length: u32, cache_mode: CacheMode) -> (ProcessingContext, ScriptedBackend) {
        let backend = ScriptedBackend::new(script);
        let model = backend
            .load(Path::new("qwen-test.gguf"), 4096, &BackendOptions::default())
            .expect("load scripted model");
        let ctx = ProcessingContext::new();
        ctx.start(model, config(context_length, cache_mode))
            .expect("start context");
        pump_until(&ctx, |c| c.status() == ContextStatus::Ready);
        (ctx, backend)
    }

    fn pump_until(ctx: &ProcessingContext, done: impl Fn(&ProcessingContext) -> bool) {
        for _ in 0..400 {
            ctx.update();
            if done(ctx) {
                return;
            }
            thread::sleep(Duration::from_millis(5));
        }
        panic!("context did not reach the expected state in time");
    }

    #[test]
    fn tokenize_execute_next_round_trip_finishes() {
        let (ctx, _backend) = started(Script::replying("ok"), 64, CacheMode::AutoLogitStore);
        let client = Recorder::pulling(DecodeRequest::tokens(1));
        ctx.set_inference_client(client.clone()).expect("attach");

        let tokens = ctx.tokenize_input("hello").expect("tokenize");
        assert_eq!(ctx.execute_input(&tokens, false), Ok(Dispatch::Scheduled));
        pump_until(&ctx, |_| client.count(|e| matches!(e, Event::Batch { .. })) == 1);

        assert_eq!(ctx.next(DecodeRequest::tokens(1)), Ok(Dispatch::Scheduled));
        pump_until(&ctx, |_| client.finish().is_some());

        assert_eq!(client.written(), vec![Token::from(b'o'), Token::from(b'k')]);
        assert_eq!(client.finish(), Some((7, FinishReason::Finished)));
        let events = client.events();
        let finish_write = events
            .iter()
            .position(|e| matches!(e, Event::Write { finish: true, .. }))
            .expect("final write");
        assert!(matches!(events[finish_write + 1], Event::Finish { .. }));
    }

    #[test]
    fn empty_input_is_rejected_without_state_change() {
        let (ctx, backend) = started(Script::endless(), 64, CacheMode::AutoLogitStore);
        let client = Recorder::new();
        ctx.set_inference_client(client.clone()).expect("attach");

        assert_eq!(ctx.execute_input(&[], false), Err(ContextError::InputIsEmpty));
        for _ in 0..5 {
            ctx.update();
            thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(ctx.status(), ContextStatus::Ready);
        assert_eq!(ctx.cursor(), 0);
        assert!(backend.decode_log().batches().is_empty());
        assert_eq!(client.events(), vec![Event::Register]);
    }

    #[test]
    fn second_client_is_rejected() {
        let (ctx, _backend) = started(Script::endless(), 64, CacheMode::AutoLogitStore);
        let first = Recorder::new();
        let second = Recorder::new();

        ctx.set_inference_client(first.clone()).expect("attach first");
        assert_eq!(
            ctx.set_inference_client(second.clone()),
            Err(ContextError::AlreadyProcessing)
        );
        assert_eq!(first.count(|e| *e == Event::Register), 1);
        assert!(second.events().is_empty());

        assert!(ctx.release_inference_client());
        assert_eq!(first.count(|e| *e == Event::Unregister), 1);
        ctx.set_inference_client(second.clone()).expect("attach after release");
    }

    #[test]
    fn single_token_steps_stop_exactly_at_context_length() {
        let (ctx, _backend) = started(Script::endless(), 40, CacheMode::AutoLogitStore);
        let client = Recorder::pulling(DecodeRequest::tokens(1));
        ctx.set_inference_client(client.clone()).expect("attach");

        let prompt = vec![7; 30];
        ctx.execute_input(&prompt, false).expect("execute");
        pump_until(&ctx, |_| client.count(|e| matches!(e, Event::Batch { .. })) == 1);
        ctx.next(DecodeRequest::tokens(1)).expect("next");
        pump_until(&ctx, |_| client.finish().is_some());

        assert_eq!(client.finish(), Some((40, FinishReason::TokenLimitReached)));
        assert_eq!(client.written(), vec![FILLER_TOKEN; 10]);
        assert_eq!(ctx.cursor(), 40);
        assert_eq!(ctx.next(DecodeRequest::tokens(1)), Err(ContextError::MissingInput));
    }

    #[test]
    fn input_beyond_context_length_is_rejected() {
        let (ctx, _backend) = started(Script::endless(), 32, CacheMode::AutoLogitStore);
        let err = ctx.execute_input(&[1; 33], false).expect_err("too long");
        assert_eq!(
            err,
            ContextError::InputExceedsLimit {
                requested: 33,
                cached: 0,
                limit: 32
            }
        );
    }

    #[test]
    fn kv_locked_input_requires_kv_lock_mode() {
        let (ctx, _backend) = started(Script::endless(), 64, CacheMode::AutoLogitStore);
        assert!(matches!(
            ctx.execute_input(&[1, 2], true),
            Err(ContextError::OperationNotSupported(_))
        ));
    }

    #[test]
    fn kv_locked_prefix_is_not_decoded_again() {
        let (ctx, backend) = started(Script::replying("ab"), 128, CacheMode::KvLock);
        let client = Recorder::pulling(DecodeRequest::tokens(4));
        ctx.set_inference_client(client.clone()).expect("attach");

        let prefix = ctx.tokenize_input("system prompt").expect("tokenize");
        ctx.execute_input(&prefix, true).expect("locked prefix");
        pump_until(&ctx, |_| client.count(|e| matches!(e, Event::Batch { .. })) == 1);
        ctx.execute_input(&[b'q'.into(), b'?'.into()], false).expect("question");
        pump_until(&ctx, |_| client.count(|e| matches!(e, Event::Batch { .. })) == 2);
        ctx.next(DecodeRequest::tokens(4)).expect("next");
        pump_until(&ctx, |_| client.finish().is_some());

        ctx.clear_response().expect("clear response");
        assert_eq!(ctx.cached_tokens(), prefix.len());
        backend.decode_log().clear();

        ctx.execute_input(&prefix, true).expect("reuse prefix");
        pump_until(&ctx, |_| client.count(|e| matches!(e, Event::Batch { .. })) == 3);

        assert!(backend.decode_log().tokens().is_empty());
        assert_eq!(ctx.cursor(), prefix.len());
        assert!(client
            .events()
            .contains(&Event::Batch { processed: prefix.len(), kv_locked: true }));
    }

    #[test]
    fn auto_store_replays_evicted_tokens_before_next_input() {
        let (ctx, backend) = started(Script::replying("z"), 64, CacheMode::AutoLogitStore);
        let client = Recorder::new();
        ctx.set_inference_client(client.clone()).expect("attach");

        ctx.execute_input(&[1, 2, 3], false).expect("execute");
        pump_until(&ctx, |_| client.count(|e| matches!(e, Event::Batch { .. })) == 1);
        ctx.clear_response().expect("clear");
        assert_eq!(ctx.cursor(), 0);
        assert_eq!(ctx.cached_tokens(), 3);

        backend.decode_log().clear();
        ctx.execute_input(&[4, 5], false).expect("execute");
        pump_until(&ctx, |_| client.count(|e| matches!(e, Event::Batch { .. })) == 2);
        assert_eq!(backend.decode_log().tokens(), vec![1, 2, 3, 4, 5]);
        assert_eq!(ctx.cursor(), 5);

        ctx.clear_kv_cache().expect("reset");
        assert_eq!(ctx.cached_tokens(), 0);
    }

    #[test]
    fn destroy_pre_empts_generation_and_silences_writes() {
        let script = Script {
            decode_delay: Duration::from_millis(5),
            ..Script::endless()
        };
        let events = Recorder::new();
        let backend = ScriptedBackend::new(script);
        let model = backend
            .load(Path::new("m.gguf"), 4096, &BackendOptions::default())
            .expect("load");
        let ctx = ProcessingContext::with_events(events.clone());
        ctx.start(model, config(4096, CacheMode::AutoLogitStore)).expect("start");
        pump_until(&ctx, |c| c.status() == ContextStatus::Ready);

        let client = Recorder::new();
        ctx.set_inference_client(client.clone()).expect("attach");
        ctx.execute_input(&[1, 2], false).expect("execute");
        pump_until(&ctx, |_| client.count(|e| matches!(e, Event::Batch { .. })) == 1);
        ctx.next(DecodeRequest::tokens(4000)).expect("long generation");
        thread::sleep(Duration::from_millis(20));

        assert_eq!(ctx.destroy(), Ok(Dispatch::Scheduled));
        assert_eq!(ctx.destroy(), Ok(Dispatch::Destroying));
        assert_eq!(ctx.next(DecodeRequest::default()), Ok(Dispatch::Destroying));
        pump_until(&ctx, |c| c.status() == ContextStatus::Destroyed);

        let seen = client.events();
        let unregister = seen
            .iter()
            .position(|e| *e == Event::Unregister)
            .expect("unregistered");
        assert!(seen[..unregister]
            .iter()
            .all(|e| !matches!(e, Event::Write { .. })));
        assert_eq!(
            seen[unregister - 1],
            Event::Finish {
                total: ctx.cursor(),
                reason: FinishReason::Abandoned
            }
        );
        assert!(ctx.registration_released());

        ctx.destroy_sync().expect("destroy again");
        for _ in 0..3 {
            ctx.update();
        }
        assert_eq!(events.count(|e| *e == Event::CtxDestroy), 1);
        assert!(!ctx.has_client());
    }

    #[test]
    fn context_creation_failure_releases_registration() {
        let script = Script {
            fail_context: Some(crate::errors::BackendError::OutOfMemory("kv".into())),
            ..Script::default()
        };
        let events = Recorder::new();
        let backend = ScriptedBackend::new(script);
        let model = backend
            .load(Path::new("m.gguf"), 4096, &BackendOptions::default())
            .expect("load");
        let ctx = ProcessingContext::with_events(events.clone());
        ctx.start(model, config(64, CacheMode::AutoLogitStore)).expect("start");

        pump_until(&ctx, |c| c.status() == ContextStatus::Uninitialized);
        assert!(ctx.registration_released());
        assert_eq!(
            events.events(),
            vec![Event::CtxInitFail(crate::errors::ContextFailCode::OutOfMemory)]
        );
    }

    #[test]
    fn halted_context_refuses_requests_until_resumed() {
        let (ctx, _backend) = started(Script::endless(), 64, CacheMode::AutoLogitStore);
        ctx.halt();
        assert!(!ctx.is_available());
        assert_eq!(ctx.execute_input(&[1], false), Err(ContextError::Halted));
        assert!(ContextError::Halted.is_informational());

        ctx.resume();
        assert!(ctx.is_available());
        assert_eq!(ctx.execute_input(&[1], false), Ok(Dispatch::Scheduled));
        assert_eq!(ctx.execute_input(&[1], false), Err(ContextError::AlreadyProcessing));
    }

    #[test]
    fn next_sync_delivers_the_step_before_returning() {
        let (ctx, _backend) = started(Script::replying("hey"), 64, CacheMode::AutoLogitStore);
        let client = Recorder::new();
        ctx.set_inference_client(client.clone()).expect("attach");

        ctx.execute_input(&[1, 2], false).expect("execute");
        assert_eq!(ctx.next_sync(DecodeRequest::tokens(8)), Ok(Dispatch::Scheduled));
        assert_eq!(client.written(), b"hey".iter().map(|b| Token::from(*b)).collect::<Vec<_>>());
        assert_eq!(client.finish(), Some((5, FinishReason::Finished)));

        let diag = ctx.diagnostics();
        assert_eq!(diag.generated_tokens, 3);
        assert_eq!(diag.prompt_tokens, 2);
    }

    #[test]
    fn halt_on_write_halts_until_resumed() {
        let (ctx, _backend) = started(Script::endless(), 64, CacheMode::AutoLogitStore);
        let client = Recorder::new();
        ctx.set_inference_client(client.clone()).expect("attach");
        ctx.execute_input(&[1, 2], false).expect("execute");
        pump_until(&ctx, |_| client.count(|e| matches!(e, Event::Batch { .. })) == 1);

        let request = DecodeRequest {
            token_at_most: 4,
            halt_on_write: true,
            halt_delay: 0,
        };
        assert_eq!(ctx.next(request), Ok(Dispatch::Scheduled));
        pump_until(&ctx, |_| !client.written().is_empty());

        assert_eq!(client.written(), vec![FILLER_TOKEN; 4]);
        assert!(ctx.is_halted());
        assert!(!ctx.is_available());
        assert_eq!(ctx.next(DecodeRequest::tokens(1)), Err(ContextError::Halted));

        ctx.resume();
        assert_eq!(ctx.next(DecodeRequest::tokens(1)), Ok(Dispatch::Scheduled));
        pump_until(&ctx, |_| client.written().len() == 5);
        assert!(!ctx.is_halted());
    }

    #[test]
    fn next_while_a_step_is_pending_is_coalesced() {
        let script = Script {
            decode_delay: Duration::from_millis(5),
            ..Script::endless()
        };
        let (ctx, _backend) = started(script, 256, CacheMode::AutoLogitStore);
        let client = Recorder::new();
        ctx.set_inference_client(client.clone()).expect("attach");
        ctx.execute_input(&[1, 2], false).expect("execute");
        pump_until(&ctx, |_| client.count(|e| matches!(e, Event::Batch { .. })) == 1);

        assert_eq!(ctx.next(DecodeRequest::tokens(40)), Ok(Dispatch::Scheduled));
        assert_eq!(ctx.next(DecodeRequest::tokens(1)), Ok(Dispatch::Coalesced));
        assert_eq!(ctx.status(), ContextStatus::Decoding(DecodeKind::Generation));
        pump_until(&ctx, |_| client.count(|e| matches!(e, Event::Write { .. })) == 1);
        assert_eq!(client.written().len(), 40);

        for _ in 0..5 {
            ctx.update();
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(client.count(|e| matches!(e, Event::Write { .. })), 1);
        assert!(ctx.is_available());
    }

    #[test]
    fn destroy_during_initialization_wins() {
        let script = Script {
            create_delay: Duration::from_millis(30),
            ..Script::endless()
        };
        let events = Recorder::new();
        let backend = ScriptedBackend::new(script);
        let model = backend
            .load(Path::new("m.gguf"), 4096, &BackendOptions::default())
            .expect("load");
        let ctx = ProcessingContext::with_events(events.clone());
        ctx.start(model, config(64, CacheMode::AutoLogitStore)).expect("start");

        assert_eq!(ctx.status(), ContextStatus::Initializing);
        assert_eq!(ctx.execute_input(&[1], false), Err(ContextError::Initializing));
        assert_eq!(ctx.destroy(), Ok(Dispatch::Scheduled));
        assert_eq!(ctx.status(), ContextStatus::Destroying);
        pump_until(&ctx, |c| c.status() == ContextStatus::Destroyed);

        assert_eq!(events.events(), vec![Event::CtxDestroy]);
        assert!(ctx.registration_released());
    }

    #[test]
    fn finished_step_is_not_written_once_destroy_is_raised() {
        let (ctx, _backend) = started(Script::endless(), 64, CacheMode::AutoLogitStore);
        let client = Recorder::new();
        ctx.set_inference_client(client.clone()).expect("attach");
        ctx.execute_input(&[1, 2], false).expect("execute");
        pump_until(&ctx, |_| client.count(|e| matches!(e, Event::Batch { .. })) == 1);

        ctx.next(DecodeRequest::tokens(3)).expect("next");
        for _ in 0..400 {
            if ctx.core.generation.is_finished() {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert!(ctx.core.generation.is_finished());

        assert_eq!(ctx.destroy(), Ok(Dispatch::Scheduled));
        pump_until(&ctx, |c| c.status() == ContextStatus::Destroyed);

        let seen = client.events();
        assert_eq!(client.count(|e| matches!(e, Event::Write { .. })), 0);
        assert!(matches!(
            seen[seen.len() - 2],
            Event::Finish {
                reason: FinishReason::Abandoned,
                ..
            }
        ));
        assert_eq!(seen.last(), Some(&Event::Unregister));
    }

    #[test]
    fn cache_operations_report_destroying() {
        let (ctx, _backend) = started(Script::endless(), 64, CacheMode::AutoLogitStore);
        assert_eq!(ctx.clear_response(), Ok(Dispatch::Applied));
        assert_eq!(ctx.clear_kv_cache(), Ok(Dispatch::Applied));

        assert_eq!(ctx.destroy(), Ok(Dispatch::Scheduled));
        assert_eq!(ctx.clear_response(), Ok(Dispatch::Destroying));
        assert_eq!(ctx.clear_kv_cache(), Ok(Dispatch::Destroying));

        pump_until(&ctx, |c| c.status() == ContextStatus::Destroyed);
        assert_eq!(ctx.clear_kv_cache(), Err(ContextError::NotRegistered));
    }
}
