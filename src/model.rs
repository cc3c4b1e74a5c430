//! Model lifecycle: loading, the context-length budget, the registry of
//! processing and embedding contexts, teardown and adapter hot-swap.

mod worker;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde::Serialize;
use uuid::Uuid;

use crate::backend::{Backend, BackendOptions, ContextParams, LoadedModel, LoraAdapter};
use crate::client::ModelEvents;
use crate::context::{CacheMode, ContextConfig, ProcessingContext, MIN_CONTEXT_LENGTH};
use crate::embedder::EmbedderContext;
use crate::errors::{BackendError, InitFailCode, ModelError, RegisterError};
use crate::logging::{log_event, LogImportance, LogLevel};
use crate::registry::{Arena, ContextHandle};
use crate::sampling::SamplerSet;
use crate::signal::Signal;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ModelStatus {
    Uninitialized = 0,
    Initializing = 1,
    Ready = 2,
    Destroying = 3,
    Destroyed = 4,
}

impl ModelStatus {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Initializing,
            2 => Self::Ready,
            3 => Self::Destroying,
            4 => Self::Destroyed,
            _ => Self::Uninitialized,
        }
    }
}

/// Registration request for one processing context.
#[derive(Debug, Clone)]
pub struct ContextSettings {
    pub context_length: u32,
    /// Zero picks an eighth of the context length.
    pub batch_size: u32,
    pub thread_count: u32,
    /// Zero uses `thread_count`.
    pub batch_thread_count: u32,
    pub flash_attention: bool,
    pub cache_mode: CacheMode,
    pub samplers: SamplerSet,
}

impl ContextSettings {
    pub fn new(context_length: u32) -> Self {
        Self {
            context_length,
            batch_size: 0,
            thread_count: 1,
            batch_thread_count: 0,
            flash_attention: false,
            cache_mode: CacheMode::default(),
            samplers: SamplerSet::new(),
        }
    }

    pub fn with_cache_mode(mut self, cache_mode: CacheMode) -> Self {
        self.cache_mode = cache_mode;
        self
    }

    pub fn with_samplers(mut self, samplers: SamplerSet) -> Self {
        self.samplers = samplers;
        self
    }

    fn params(&self) -> Result<ContextParams, RegisterError> {
        check_lengths(self.context_length, self.thread_count)?;

        let batch_size = match self.batch_size {
            0 => self.context_length / 8,
            size => size.min(self.context_length),
        };
        let batch_thread_count = match self.batch_thread_count {
            0 => self.thread_count,
            count => count,
        };

        Ok(ContextParams {
            context_length: self.context_length,
            batch_size,
            thread_count: self.thread_count,
            batch_thread_count,
            flash_attention: self.flash_attention,
        })
    }
}

fn check_lengths(context_length: u32, thread_count: u32) -> Result<(), RegisterError> {
    if context_length == 0 {
        return Err(RegisterError::InvalidInput("context length is zero"));
    }
    if thread_count == 0 {
        return Err(RegisterError::InvalidInput("thread count is zero"));
    }
    if context_length < MIN_CONTEXT_LENGTH {
        return Err(RegisterError::ContextTooSmall {
            requested: context_length,
            minimum: MIN_CONTEXT_LENGTH,
        });
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
enum LoraOp {
    Assign(LoraAdapter),
    Remove(String),
}

/// What the model needs from anything it registers.
pub(crate) trait Registrant: Send + Sync {
    fn id(&self) -> Uuid;

    /// The registrant destroyed itself or failed to initialize.
    fn registration_released(&self) -> bool;

    fn release_claim(&self);

    fn update(&self);

    fn halt(&self);

    fn resume(&self);

    fn is_drained(&self) -> bool;

    /// Installs the new adapter set and resumes.
    fn apply_adapters(&self, adapters: Vec<LoraAdapter>);

    fn request_teardown(&self);

    fn wait_torn_down(&self);
}

#[derive(Clone)]
enum Process {
    Text(Arc<ProcessingContext>),
    Embedding(Arc<EmbedderContext>),
}

impl Process {
    fn registrant(&self) -> &dyn Registrant {
        match self {
            Self::Text(ctx) => &**ctx,
            Self::Embedding(ctx) => &**ctx,
        }
    }
}

struct Entry {
    process: Process,
    reserved: u32,
}

impl Drop for Entry {
    fn drop(&mut self) {
        self.process.registrant().release_claim();
    }
}

struct Registry {
    contexts: Arena<Entry>,
    occupied: u32,
    total: u32,
}

impl Registry {
    /// Drops contexts that gave their registration back and credits their
    /// reservation.
    fn prune_released(&mut self) -> usize {
        let released: Vec<ContextHandle> = self
            .contexts
            .iter()
            .filter(|(_, entry)| entry.process.registrant().registration_released())
            .map(|(handle, _)| handle)
            .collect();

        for handle in &released {
            if let Some(entry) = self.contexts.remove(*handle) {
                self.occupied -= entry.reserved;
                tracing::debug!(
                    handle = %handle,
                    id = %entry.process.registrant().id(),
                    reserved = entry.reserved,
                    "registration released"
                );
            }
        }
        released.len()
    }

    fn snapshot(&self) -> Vec<Process> {
        self.contexts
            .iter()
            .map(|(_, entry)| entry.process.clone())
            .collect()
    }

    /// Budget check against a freshly pruned registry.
    fn reserve(&mut self, requested: u32) -> Result<(), RegisterError> {
        self.prune_released();
        let fits = self
            .occupied
            .checked_add(requested)
            .map(|total| total <= self.total)
            .unwrap_or(false);
        if !fits {
            tracing::warn!(
                requested,
                occupied = self.occupied,
                total = self.total,
                "context registration exceeds budget"
            );
            return Err(RegisterError::BudgetExceeded {
                requested,
                occupied: self.occupied,
                total: self.total,
            });
        }
        Ok(())
    }

    fn insert(&mut self, process: Process, reserved: u32) -> ContextHandle {
        let handle = self.contexts.insert(Entry { process, reserved });
        self.occupied += reserved;
        handle
    }
}

/// Work handed to the model worker, guarded by the model signals.
struct ModelWork {
    path: PathBuf,
    options: BackendOptions,
    loaded: Option<Arc<dyn LoadedModel>>,
    failure: Option<BackendError>,
    load_time: Duration,
    pending_lora: Vec<LoraOp>,
    active_lora: Vec<LoraAdapter>,
    lora_failure: Option<BackendError>,
}

pub(crate) struct ModelCore {
    init: Signal,
    destroy: Signal,
    lora: Signal,
    status: AtomicU8,
    backend: Arc<dyn Backend>,
    registry: Mutex<Registry>,
    work: Mutex<ModelWork>,
}

impl ModelCore {
    fn status(&self) -> ModelStatus {
        ModelStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    fn set_status(&self, status: ModelStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn work(&self) -> MutexGuard<'_, ModelWork> {
        self.work.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct MainState {
    pending_lora: Vec<LoraOp>,
    lora_in_progress: bool,
    loaded: Option<Arc<dyn LoadedModel>>,
}

/// Owns a loaded model and every context registered against it.
pub struct ModelController {
    core: Arc<ModelCore>,
    main: Mutex<MainState>,
    worker: Mutex<Option<JoinHandle<()>>>,
    events: Option<Arc<dyn ModelEvents>>,
}

impl ModelController {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            core: Arc::new(ModelCore {
                init: Signal::new(),
                destroy: Signal::new(),
                lora: Signal::new(),
                status: AtomicU8::new(ModelStatus::Uninitialized as u8),
                backend,
                registry: Mutex::new(Registry {
                    contexts: Arena::new(),
                    occupied: 0,
                    total: 0,
                }),
                work: Mutex::new(ModelWork {
                    path: PathBuf::new(),
                    options: BackendOptions::default(),
                    loaded: None,
                    failure: None,
                    load_time: Duration::ZERO,
                    pending_lora: Vec::new(),
                    active_lora: Vec::new(),
                    lora_failure: None,
                }),
            }),
            main: Mutex::new(MainState {
                pending_lora: Vec::new(),
                lora_in_progress: false,
                loaded: None,
            }),
            worker: Mutex::new(None),
            events: None,
        }
    }

    pub fn with_events(backend: Arc<dyn Backend>, events: Arc<dyn ModelEvents>) -> Self {
        let mut model = Self::new(backend);
        model.events = Some(events);
        model
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
                tracing::error!("model worker panicked");
            }
        }
    }

    pub fn status(&self) -> ModelStatus {
        self.core.status()
    }

    pub fn total_budget(&self) -> u32 {
        self.core.registry().total
    }

    pub fn occupied_budget(&self) -> u32 {
        self.core.registry().occupied
    }

    pub fn context_count(&self) -> usize {
        self.core.registry().contexts.len()
    }

    pub fn path(&self) -> PathBuf {
        self.core.work().path.clone()
    }

    pub fn load_time(&self) -> Duration {
        self.core.work().load_time
    }

    /// Whether a context of `context_length` would be registered right now.
    pub fn is_available(&self, context_length: u32) -> bool {
        if self.status() != ModelStatus::Ready || context_length < MIN_CONTEXT_LENGTH {
            return false;
        }
        let registry = self.core.registry();
        registry
            .occupied
            .checked_add(context_length)
            .map(|total| total <= registry.total)
            .unwrap_or(false)
    }

    pub fn context(&self, handle: ContextHandle) -> Option<Arc<ProcessingContext>> {
        match self.core.registry().contexts.get(handle).map(|entry| &entry.process) {
            Some(Process::Text(ctx)) => Some(Arc::clone(ctx)),
            _ => None,
        }
    }

    pub fn embedder(&self, handle: ContextHandle) -> Option<Arc<EmbedderContext>> {
        match self.core.registry().contexts.get(handle).map(|entry| &entry.process) {
            Some(Process::Embedding(ctx)) => Some(Arc::clone(ctx)),
            _ => None,
        }
    }

    pub fn contexts(&self) -> Vec<Arc<ProcessingContext>> {
        self.core
            .registry()
            .snapshot()
            .into_iter()
            .filter_map(|process| match process {
                Process::Text(ctx) => Some(ctx),
                Process::Embedding(_) => None,
            })
            .collect()
    }

    pub fn embedders(&self) -> Vec<Arc<EmbedderContext>> {
        self.core
            .registry()
            .snapshot()
            .into_iter()
            .filter_map(|process| match process {
                Process::Embedding(ctx) => Some(ctx),
                Process::Text(_) => None,
            })
            .collect()
    }

    /// The loaded weights produce embeddings; only embedders register.
    pub fn is_embedding_model(&self) -> bool {
        self.main()
            .loaded
            .as_ref()
            .map(|loaded| loaded.is_embedding_model())
            .unwrap_or(false)
    }

    pub fn active_adapters(&self) -> Vec<LoraAdapter> {
        self.core.work().active_lora.clone()
    }

    /// Starts loading the model in the background. Completion is reported
    /// through `on_initialize` or `on_initialize_fail` on a later `update`.
    pub fn initialize(
        &self,
        path: impl AsRef<Path>,
        total_budget: u32,
        options: BackendOptions,
    ) -> Result<ModelStatus, ModelError> {
        let path = path.as_ref();
        if path.as_os_str().is_empty() {
            return Err(ModelError::MissingPath);
        }
        if total_budget == 0 {
            return Err(ModelError::ZeroBudget);
        }

        match self.status() {
            ModelStatus::Uninitialized => {}
            ModelStatus::Initializing => return Ok(ModelStatus::Initializing),
            other => return Err(ModelError::InvalidState(other)),
        }

        self.join_worker();
        {
            let mut work = self.core.work();
            work.path = path.to_path_buf();
            work.options = options;
            work.failure = None;
            work.loaded = None;
        }
        {
            let mut registry = self.core.registry();
            registry.total = total_budget;
            registry.occupied = 0;
        }
        self.core.set_status(ModelStatus::Initializing);
        self.core.init.raise();

        let core = Arc::clone(&self.core);
        let spawned = thread::Builder::new()
            .name("model-worker".to_string())
            .spawn(move || worker::run(core));
        match spawned {
            Ok(handle) => {
                *self.worker.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
            }
            Err(err) => {
                self.core.init.hard_reset();
                self.core.set_status(ModelStatus::Uninitialized);
                return Err(ModelError::WorkerSpawn(err));
            }
        }

        tracing::info!(
            path = %path.display(),
            backend = self.core.backend.name(),
            total_budget,
            "model initialization scheduled"
        );
        Ok(ModelStatus::Initializing)
    }

    /// Blocking form of [`ModelController::initialize`]; callbacks are
    /// delivered before it returns.
    pub fn initialize_sync(
        &self,
        path: impl AsRef<Path>,
        total_budget: u32,
        options: BackendOptions,
    ) -> Result<ModelStatus, ModelError> {
        self.initialize(path, total_budget, options)?;
        self.core.init.wait_finished();
        self.update();
        Ok(self.status())
    }

    fn ready_model(&self) -> Result<Arc<dyn LoadedModel>, RegisterError> {
        let status = self.status();
        if status != ModelStatus::Ready {
            return Err(RegisterError::ModelNotReady(status));
        }
        self.main()
            .loaded
            .clone()
            .ok_or(RegisterError::ModelNotReady(status))
    }

    /// Locks the registry once the model is confirmed Ready under the lock,
    /// so a concurrent `destroy` either sees the new entry or rejects it.
    fn lock_ready_registry(&self) -> Result<MutexGuard<'_, Registry>, RegisterError> {
        let registry = self.core.registry();
        let status = self.status();
        if status != ModelStatus::Ready {
            return Err(RegisterError::ModelNotReady(status));
        }
        Ok(registry)
    }

    /// Validates the request, debits the budget and starts the context.
    /// Nothing is mutated when an error is returned.
    pub fn register_context_process(
        &self,
        ctx: &Arc<ProcessingContext>,
        settings: ContextSettings,
    ) -> Result<ContextHandle, RegisterError> {
        let loaded = self.ready_model()?;
        if loaded.is_embedding_model() {
            return Err(RegisterError::ProcessorMismatch {
                processor: "text",
                model: "embedding",
            });
        }
        let params = settings.params()?;
        if ctx.is_registered() {
            return Err(RegisterError::AlreadyRegistered);
        }
        let adapters = self.core.work().active_lora.clone();

        let mut registry = self.lock_ready_registry()?;
        let requested = params.context_length;
        registry.reserve(requested)?;

        ctx.start(
            loaded,
            ContextConfig {
                params,
                cache_mode: settings.cache_mode,
                samplers: settings.samplers,
                adapters,
            },
        )?;
        let handle = registry.insert(Process::Text(Arc::clone(ctx)), requested);

        tracing::info!(
            context_id = %ctx.id(),
            handle = %handle,
            context_length = requested,
            occupied = registry.occupied,
            total = registry.total,
            "context registered"
        );
        Ok(handle)
    }

    /// Registers an embedding context. The whole context length is one
    /// batch; the budget is debited the same way as for text contexts.
    pub fn register_embedder_process(
        &self,
        ctx: &Arc<EmbedderContext>,
        context_length: u32,
        thread_count: u32,
    ) -> Result<ContextHandle, RegisterError> {
        let loaded = self.ready_model()?;
        if !loaded.is_embedding_model() {
            return Err(RegisterError::ProcessorMismatch {
                processor: "embedding",
                model: "text-generation",
            });
        }
        check_lengths(context_length, thread_count)?;
        if ctx.is_registered() {
            return Err(RegisterError::AlreadyRegistered);
        }

        let mut registry = self.lock_ready_registry()?;
        registry.reserve(context_length)?;

        ctx.start(
            loaded,
            ContextParams {
                context_length,
                batch_size: context_length,
                thread_count,
                batch_thread_count: thread_count,
                flash_attention: false,
            },
        )?;
        let handle = registry.insert(Process::Embedding(Arc::clone(ctx)), context_length);

        tracing::info!(
            embedder_id = %ctx.id(),
            handle = %handle,
            context_length,
            occupied = registry.occupied,
            total = registry.total,
            "embedder registered"
        );
        Ok(handle)
    }

    pub fn assign_lora(&self, adapter: LoraAdapter) -> Result<(), ModelError> {
        self.queue_lora(LoraOp::Assign(adapter))
    }

    pub fn remove_lora(&self, name: impl Into<String>) -> Result<(), ModelError> {
        self.queue_lora(LoraOp::Remove(name.into()))
    }

    fn queue_lora(&self, op: LoraOp) -> Result<(), ModelError> {
        let status = self.status();
        if status != ModelStatus::Ready {
            return Err(ModelError::InvalidState(status));
        }
        self.main().pending_lora.push(op);
        Ok(())
    }

    /// Idempotent. Every registered context is torn down before the
    /// backend model is released; `on_destroy` follows on a later `update`.
    pub fn destroy(&self) -> ModelStatus {
        // under the registry lock so no registration slips in behind it
        let registry = self.core.registry();
        match self.status() {
            ModelStatus::Initializing | ModelStatus::Ready => {
                self.core.set_status(ModelStatus::Destroying);
                drop(registry);
                self.core.destroy.raise();
                self.wake();
                log_event(
                    LogLevel::Info,
                    LogImportance::High,
                    format_args!("model destroy requested for {}", self.path().display()),
                );
                ModelStatus::Destroying
            }
            other => other,
        }
    }

    pub fn destroy_sync(&self) -> ModelStatus {
        self.destroy();
        while !self.core.destroy.wait_finished_timeout(Duration::from_millis(10)) {
            if self.worker_exited() {
                break;
            }
        }
        self.update();
        self.status()
    }

    /// One non-blocking sweep: model completions first, then released
    /// contexts are pruned, then every context is updated.
    pub fn update(&self) {
        match self.status() {
            ModelStatus::Uninitialized | ModelStatus::Destroyed => return,
            ModelStatus::Initializing => {
                if self.core.init.acknowledge() {
                    self.finish_init();
                }
                return;
            }
            ModelStatus::Destroying => {
                // a worker that exited on a failed load never marks destroy
                if self.core.destroy.acknowledge() || self.worker_exited() {
                    self.finish_destroy();
                }
                return;
            }
            ModelStatus::Ready => {}
        }

        self.service_lora();

        let processes = {
            let mut registry = self.core.registry();
            registry.prune_released();
            registry.snapshot()
        };
        for process in processes {
            process.registrant().update();
        }
    }

    fn finish_init(&self) {
        let (loaded, failure, load_time) = {
            let mut work = self.core.work();
            (work.loaded.clone(), work.failure.take(), work.load_time)
        };

        match (loaded, failure) {
            (Some(loaded), None) => {
                self.main().loaded = Some(loaded);
                self.core.set_status(ModelStatus::Ready);
                tracing::info!(load_ms = load_time.as_millis() as u64, "model ready");
                if let Some(events) = &self.events {
                    events.on_initialize(self);
                }
            }
            (_, failure) => {
                self.join_worker();
                self.core.set_status(ModelStatus::Uninitialized);
                let code = failure
                    .as_ref()
                    .map(InitFailCode::from)
                    .unwrap_or(InitFailCode::BackendError);
                log_event(
                    LogLevel::Error,
                    LogImportance::Critical,
                    format_args!(
                        "model load failed ({:?}): {}",
                        code,
                        failure.map(|e| e.to_string()).unwrap_or_default()
                    ),
                );
                if let Some(events) = &self.events {
                    events.on_initialize_fail(self, code);
                }
            }
        }
    }

    fn finish_destroy(&self) {
        self.join_worker();
        self.core.init.hard_reset();
        self.core.lora.hard_reset();

        let processes = self.core.registry().snapshot();
        for process in &processes {
            process.registrant().update();
        }
        {
            let mut registry = self.core.registry();
            registry.contexts.drain();
            registry.occupied = 0;
        }
        {
            let mut main = self.main();
            main.loaded = None;
            main.pending_lora.clear();
            main.lora_in_progress = false;
        }
        self.core.set_status(ModelStatus::Destroyed);
        tracing::info!(contexts = processes.len(), "model destroyed");

        if let Some(events) = &self.events {
            events.on_destroy(self);
        }
    }

    /// Drives adapter changes: halt every context, wait until all are idle,
    /// let the worker load the new set, then hand it to each context.
    fn service_lora(&self) {
        if self.core.lora.is_raised() {
            return;
        }

        let processes = self.core.registry().snapshot();
        if self.core.lora.acknowledge() {
            let (active, failure) = {
                let mut work = self.core.work();
                (work.active_lora.clone(), work.lora_failure.take())
            };
            self.main().lora_in_progress = false;

            match failure {
                None => {
                    for process in &processes {
                        process.registrant().apply_adapters(active.clone());
                    }
                    tracing::info!(adapters = active.len(), "adapter set switched");
                    if let Some(events) = &self.events {
                        events.on_lora_operate(self, &active);
                    }
                }
                Some(err) => {
                    tracing::warn!(%err, "adapter switch rejected");
                    for process in &processes {
                        process.registrant().resume();
                    }
                }
            }
            return;
        }

        let mut main = self.main();
        if main.pending_lora.is_empty() && !main.lora_in_progress {
            return;
        }
        main.lora_in_progress = true;
        for process in &processes {
            process.registrant().halt();
        }
        if processes.iter().any(|process| !process.registrant().is_drained()) {
            return;
        }

        self.core.work().pending_lora = std::mem::take(&mut main.pending_lora);
        drop(main);
        self.core.lora.raise();
        self.wake();
    }
}

impl Drop for ModelController {
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
    use crate::backend::scripted::{Script, ScriptedBackend};
    use crate::client::recording::{Event, Recorder};
    use crate::context::{ContextStatus, DecodeRequest};
    use crate::embedder::EmbedderContext;
    use crate::client::FinishReason;
    use crate::errors::ErrorKind;

    fn ready_model(script: Script, budget: u32) -> (ModelController, Arc<Recorder>) {
        let events = Recorder::new();
        let model = ModelController::with_events(Arc::new(ScriptedBackend::new(script)), events.clone());
        let status = model
            .initialize_sync("models/qwen-test.gguf", budget, BackendOptions::default())
            .expect("initialize");
        assert_eq!(status, ModelStatus::Ready);
        (model, events)
    }

    fn pump_until(model: &ModelController, done: impl Fn() -> bool) {
        for _ in 0..400 {
            model.update();
            if done() {
                return;
            }
            thread::sleep(Duration::from_millis(5));
        }
        panic!("model did not reach the expected state in time");
    }

    #[test]
    fn budget_is_never_exceeded() {
        let (model, _events) = ready_model(Script::endless(), 2048);
        let first = Arc::new(ProcessingContext::new());
        model
            .register_context_process(&first, ContextSettings::new(2048))
            .expect("first registration fits");
        assert_eq!(model.occupied_budget(), 2048);
        assert!(!model.is_available(32));

        for _ in 0..3 {
            let extra = Arc::new(ProcessingContext::new());
            let err = model
                .register_context_process(&extra, ContextSettings::new(64))
                .expect_err("budget is full");
            assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
            assert_eq!(model.occupied_budget(), 2048);
            assert_eq!(extra.status(), ContextStatus::Uninitialized);
        }
        assert_eq!(model.context_count(), 1);
    }

    #[test]
    fn malformed_registrations_are_rejected_synchronously() {
        let (model, _events) = ready_model(Script::endless(), 4096);
        let ctx = Arc::new(ProcessingContext::new());

        let err = model
            .register_context_process(&ctx, ContextSettings::new(0))
            .expect_err("zero length");
        assert!(matches!(err, RegisterError::InvalidInput(_)));

        let err = model
            .register_context_process(&ctx, ContextSettings::new(16))
            .expect_err("below floor");
        assert!(matches!(
            err,
            RegisterError::ContextTooSmall {
                requested: 16,
                minimum: 32
            }
        ));

        let mut settings = ContextSettings::new(64);
        settings.thread_count = 0;
        assert!(matches!(
            model.register_context_process(&ctx, settings),
            Err(RegisterError::InvalidInput(_))
        ));

        model
            .register_context_process(&ctx, ContextSettings::new(64))
            .expect("register");
        assert!(matches!(
            model.register_context_process(&ctx, ContextSettings::new(64)),
            Err(RegisterError::AlreadyRegistered)
        ));
        assert_eq!(model.occupied_budget(), 64);
    }

    #[test]
    fn batch_size_defaults_and_clamps() {
        let params = ContextSettings::new(256).params().expect("params");
        assert_eq!(params.batch_size, 32);
        assert_eq!(params.batch_thread_count, 1);

        let mut settings = ContextSettings::new(64);
        settings.batch_size = 1000;
        assert_eq!(settings.params().expect("params").batch_size, 64);
    }

    #[test]
    fn missing_model_fails_asynchronously() {
        let events = Recorder::new();
        let backend = ScriptedBackend::new(Script {
            fail_load: Some(BackendError::PathNotFound(PathBuf::from("models/none.gguf"))),
            load_delay: Duration::from_millis(10),
            ..Script::default()
        });
        let model = ModelController::with_events(Arc::new(backend), events.clone());

        assert!(matches!(
            model.initialize("", 1024, BackendOptions::default()),
            Err(ModelError::MissingPath)
        ));
        assert_eq!(
            model
                .initialize("models/none.gguf", 1024, BackendOptions::default())
                .expect("scheduled"),
            ModelStatus::Initializing
        );
        pump_until(&model, || model.status() != ModelStatus::Initializing);

        assert_eq!(model.status(), ModelStatus::Uninitialized);
        assert_eq!(
            events.events(),
            vec![Event::ModelInitFail(InitFailCode::PathNotFound)]
        );
    }

    #[test]
    fn destroyed_context_returns_its_budget() {
        let (model, _events) = ready_model(Script::endless(), 1024);
        let ctx = Arc::new(ProcessingContext::new());
        model
            .register_context_process(&ctx, ContextSettings::new(512))
            .expect("register");
        pump_until(&model, || ctx.status() == ContextStatus::Ready);

        ctx.destroy().expect("destroy");
        pump_until(&model, || model.context_count() == 0);
        assert_eq!(model.occupied_budget(), 0);
        assert_eq!(ctx.status(), ContextStatus::Destroyed);

        model
            .register_context_process(&ctx, ContextSettings::new(1024))
            .expect("register again after destroy");
        assert_eq!(model.occupied_budget(), 1024);
    }

    #[test]
    fn model_destroy_tears_down_contexts_once() {
        let (model, events) = ready_model(
            Script {
                decode_delay: Duration::from_millis(2),
                ..Script::endless()
            },
            4096,
        );
        let ctx_events = Recorder::new();
        let ctx = Arc::new(ProcessingContext::with_events(ctx_events.clone()));
        let client = Recorder::pulling(DecodeRequest::tokens(2));
        model
            .register_context_process(&ctx, ContextSettings::new(1024))
            .expect("register");
        pump_until(&model, || ctx.status() == ContextStatus::Ready);
        ctx.set_inference_client(client.clone()).expect("attach");
        ctx.execute_input(&[1, 2, 3], false).expect("input");
        pump_until(&model, || client.count(|e| matches!(e, Event::Batch { .. })) == 1);
        ctx.next(DecodeRequest::tokens(2)).expect("next");

        assert_eq!(model.destroy(), ModelStatus::Destroying);
        assert_eq!(model.destroy(), ModelStatus::Destroying);
        pump_until(&model, || model.status() == ModelStatus::Destroyed);

        assert_eq!(model.destroy_sync(), ModelStatus::Destroyed);
        for _ in 0..3 {
            model.update();
        }
        assert_eq!(events.count(|e| *e == Event::ModelDestroy), 1);
        assert_eq!(ctx_events.count(|e| *e == Event::CtxDestroy), 1);
        assert_eq!(ctx.status(), ContextStatus::Destroyed);
        assert_eq!(model.occupied_budget(), 0);
        assert_eq!(model.context_count(), 0);

        let unregister = client
            .events()
            .iter()
            .position(|e| *e == Event::Unregister)
            .expect("client released");
        assert!(client.events()[unregister..]
            .iter()
            .all(|e| !matches!(e, Event::Write { .. })));
        assert!(client.count(|e| matches!(e, Event::Finish { reason: FinishReason::Finished, .. })) == 0);
    }

    #[test]
    fn lora_switch_halts_then_resumes_contexts() {
        let (model, events) = ready_model(Script::endless(), 4096);
        let ctx = Arc::new(ProcessingContext::new());
        model
            .register_context_process(&ctx, ContextSettings::new(256))
            .expect("register");
        pump_until(&model, || ctx.status() == ContextStatus::Ready);

        model
            .assign_lora(LoraAdapter {
                name: "tone".to_string(),
                path: PathBuf::from("adapters/tone.gguf"),
                scale: 0.5,
            })
            .expect("assign");
        pump_until(&model, || events.count(|e| matches!(e, Event::Lora(_))) == 1);
        assert_eq!(events.events().last(), Some(&Event::Lora(vec!["tone".to_string()])));

        pump_until(&model, || ctx.is_available());
        assert!(!ctx.is_halted());

        let late = Arc::new(ProcessingContext::new());
        model
            .register_context_process(&late, ContextSettings::new(256))
            .expect("register late");
        assert_eq!(model.active_adapters().len(), 1);

        model.remove_lora("tone").expect("remove");
        pump_until(&model, || events.count(|e| matches!(e, Event::Lora(_))) == 2);
        assert_eq!(events.events().last(), Some(&Event::Lora(Vec::new())));
        assert!(model.active_adapters().is_empty());
    }

    #[test]
    fn rejected_adapter_resumes_contexts_without_switching() {
        let (model, events) = ready_model(
            Script {
                reject_adapters: true,
                ..Script::endless()
            },
            4096,
        );
        let ctx = Arc::new(ProcessingContext::new());
        model
            .register_context_process(&ctx, ContextSettings::new(128))
            .expect("register");
        pump_until(&model, || ctx.status() == ContextStatus::Ready);

        model
            .assign_lora(LoraAdapter {
                name: "bad".to_string(),
                path: PathBuf::from("adapters/bad.gguf"),
                scale: 1.0,
            })
            .expect("assign");
        pump_until(&model, || !ctx.is_halted() && !model.main().lora_in_progress);

        assert!(model.active_adapters().is_empty());
        assert_eq!(events.count(|e| matches!(e, Event::Lora(_))), 0);
    }

    #[test]
    fn destroyed_context_cannot_move_until_its_owner_prunes_it() {
        let (a, _a_events) = ready_model(Script::endless(), 1024);
        let (b, _b_events) = ready_model(Script::endless(), 1024);
        let ctx = Arc::new(ProcessingContext::new());
        a.register_context_process(&ctx, ContextSettings::new(512))
            .expect("register on a");
        pump_until(&a, || ctx.status() == ContextStatus::Ready);
        ctx.destroy_sync().expect("destroy");
        assert_eq!(ctx.status(), ContextStatus::Destroyed);

        assert!(matches!(
            b.register_context_process(&ctx, ContextSettings::new(512)),
            Err(RegisterError::AlreadyRegistered)
        ));
        assert_eq!(b.occupied_budget(), 0);

        a.update();
        assert_eq!(a.occupied_budget(), 0);
        assert_eq!(a.context_count(), 0);

        b.register_context_process(&ctx, ContextSettings::new(512))
            .expect("register on b");
        pump_until(&b, || ctx.status() == ContextStatus::Ready);
        for _ in 0..20 {
            a.update();
            b.update();
        }
        assert_eq!(a.occupied_budget(), 0);
        assert_eq!(a.context_count(), 0);
        assert_eq!(b.occupied_budget(), 512);
        assert_eq!(ctx.status(), ContextStatus::Ready);
    }

    #[test]
    fn registration_after_destroy_is_refused() {
        let (model, _events) = ready_model(Script::endless(), 1024);
        model.destroy();
        let ctx = Arc::new(ProcessingContext::new());
        assert!(matches!(
            model.register_context_process(&ctx, ContextSettings::new(64)),
            Err(RegisterError::ModelNotReady(ModelStatus::Destroying))
        ));
        assert_eq!(ctx.status(), ContextStatus::Uninitialized);
        pump_until(&model, || model.status() == ModelStatus::Destroyed);
    }

    #[test]
    fn registrations_racing_destroy_are_all_torn_down() {
        let (model, _events) = ready_model(Script::endless(), 32 * 256);

        let registered = thread::scope(|scope| {
            let registrar = scope.spawn(|| {
                let mut registered = Vec::new();
                loop {
                    let ctx = Arc::new(ProcessingContext::new());
                    match model.register_context_process(&ctx, ContextSettings::new(32)) {
                        Ok(_) => registered.push(ctx),
                        Err(err) => {
                            assert!(matches!(
                                err,
                                RegisterError::ModelNotReady(_) | RegisterError::BudgetExceeded { .. }
                            ));
                            return registered;
                        }
                    }
                }
            });
            thread::sleep(Duration::from_millis(2));
            model.destroy_sync();
            registrar.join().expect("registrar thread")
        });

        assert_eq!(model.status(), ModelStatus::Destroyed);
        assert_eq!(model.context_count(), 0);
        assert_eq!(model.occupied_budget(), 0);
        for ctx in &registered {
            assert_eq!(ctx.status(), ContextStatus::Destroyed);
        }
    }

    #[test]
    fn destroy_during_load_wins() {
        let scripts = [
            Script {
                load_delay: Duration::from_millis(30),
                ..Script::endless()
            },
            Script {
                load_delay: Duration::from_millis(30),
                fail_load: Some(BackendError::OutOfMemory("weights".into())),
                ..Script::default()
            },
        ];

        for script in scripts {
            let events = Recorder::new();
            let model = ModelController::with_events(Arc::new(ScriptedBackend::new(script)), events.clone());
            model
                .initialize("models/qwen-test.gguf", 1024, BackendOptions::default())
                .expect("scheduled");
            assert_eq!(model.destroy(), ModelStatus::Destroying);
            pump_until(&model, || model.status() == ModelStatus::Destroyed);

            assert_eq!(events.events(), vec![Event::ModelDestroy]);
            assert!(matches!(
                model.initialize("models/qwen-test.gguf", 1024, BackendOptions::default()),
                Err(ModelError::InvalidState(ModelStatus::Destroyed))
            ));
        }
    }

    #[test]
    fn processor_kind_must_match_the_weights() {
        let (text_model, _text_events) = ready_model(Script::endless(), 1024);
        let (embed_model, _embed_events) = ready_model(Script::embedding(4), 1024);
        assert!(!text_model.is_embedding_model());
        assert!(embed_model.is_embedding_model());

        let embedder = Arc::new(EmbedderContext::new());
        let err = text_model
            .register_embedder_process(&embedder, 256, 1)
            .expect_err("embedder on generative weights");
        assert!(matches!(
            err,
            RegisterError::ProcessorMismatch {
                processor: "embedding",
                ..
            }
        ));

        let ctx = Arc::new(ProcessingContext::new());
        let err = embed_model
            .register_context_process(&ctx, ContextSettings::new(256))
            .expect_err("text context on embedding weights");
        assert!(matches!(err, RegisterError::ProcessorMismatch { processor: "text", .. }));
        assert_eq!(err.kind(), ErrorKind::ProtocolMisuse);

        assert_eq!(text_model.occupied_budget(), 0);
        assert_eq!(embed_model.occupied_budget(), 0);
        assert_eq!(embedder.status(), ContextStatus::Uninitialized);
        assert_eq!(ctx.status(), ContextStatus::Uninitialized);
    }

    #[test]
    fn embedder_round_trip_through_the_model() {
        let (model, _events) = ready_model(Script::embedding(2), 1024);
        let embedder = Arc::new(EmbedderContext::new());
        assert!(matches!(
            model.register_embedder_process(&embedder, 16, 1),
            Err(RegisterError::ContextTooSmall { requested: 16, .. })
        ));

        let handle = model
            .register_embedder_process(&embedder, 256, 1)
            .expect("register embedder");
        assert_eq!(model.occupied_budget(), 256);
        assert!(model.embedder(handle).is_some());
        assert!(model.context(handle).is_none());
        assert_eq!(model.embedders().len(), 1);
        pump_until(&model, || embedder.status() == ContextStatus::Ready);

        let client = Recorder::pulling(DecodeRequest::default());
        embedder.set_inference_client(client.clone()).expect("attach");
        embedder
            .execute_input(&[vec![1, 2], vec![3]])
            .expect("execute");
        pump_until(&model, || client.finish().is_some());
        assert_eq!(client.count(|e| matches!(e, Event::Vector { .. })), 2);
        assert_eq!(client.finish(), Some((4, FinishReason::Finished)));

        embedder.destroy().expect("destroy");
        pump_until(&model, || model.context_count() == 0);
        assert_eq!(model.occupied_budget(), 0);
        assert_eq!(embedder.status(), ContextStatus::Destroyed);
    }
}
