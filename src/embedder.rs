//! Embedding contexts: every input is a set of token sequences encoded as
//! one batch, yielding one vector per sequence.
//!
//! The handoff is the same as for processing contexts. `execute_input`
//! raises the embedding signal, the worker encodes the batch, and the next
//! `update` reports `on_batch_processed`. The vectors are then handed out
//! one per `next` call.

mod worker;

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use uuid::Uuid;

use crate::backend::{ContextParams, EmbedContext, LoadedModel, LoraAdapter, Token};
use crate::client::{EmbedderClient, EmbedderEvents, FinishReason};
use crate::context::{ContextStatus, DecodeKind, Dispatch, Lifecycle};
use crate::errors::{BackendError, ContextError, ContextFailCode, RegisterError};
use crate::model::Registrant;
use crate::registry::Claim;
use crate::signal::Signal;

pub(crate) struct EmbedderCore {
    id: Uuid,
    init: Signal,
    destroy: Signal,
    embedding: Signal,
    lifecycle: AtomicU8,
    released: AtomicBool,
    claim: Claim,
    work: Mutex<EmbedWork>,
}

impl EmbedderCore {
    fn lifecycle(&self) -> Lifecycle {
        Lifecycle::from_u8(self.lifecycle.load(Ordering::Acquire))
    }

    fn set_lifecycle(&self, lifecycle: Lifecycle) {
        self.lifecycle.store(lifecycle as u8, Ordering::Release);
    }

    fn work(&self) -> MutexGuard<'_, EmbedWork> {
        self.work.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Owned by the worker while the embedding signal is raised.
struct EmbedWork {
    model: Option<Arc<dyn LoadedModel>>,
    params: Option<ContextParams>,
    encoder: Option<Box<dyn EmbedContext>>,
    pending: Vec<Vec<Token>>,
    vectors: Vec<Vec<f32>>,
    processed: usize,
    embedding_length: usize,
    failure: Option<BackendError>,
    init_failure: Option<ContextFailCode>,
}

impl EmbedWork {
    fn empty() -> Self {
        Self {
            model: None,
            params: None,
            encoder: None,
            pending: Vec::new(),
            vectors: Vec::new(),
            processed: 0,
            embedding_length: 0,
            failure: None,
            init_failure: None,
        }
    }
}

struct MainState {
    client: Option<Weak<dyn EmbedderClient>>,
    model: Option<Arc<dyn LoadedModel>>,
    context_length: u32,
    embedding_length: usize,
    halted: bool,
    /// Vectors of the last input; `cursor` of them are handed out.
    vectors: Vec<Vec<f32>>,
    cursor: usize,
}

pub struct EmbedderContext {
    core: Arc<EmbedderCore>,
    main: Mutex<MainState>,
    worker: Mutex<Option<JoinHandle<()>>>,
    events: Option<Arc<dyn EmbedderEvents>>,
}

impl Default for EmbedderContext {
    fn default() -> Self {
        Self::new()
    }
}

impl EmbedderContext {
    pub fn new() -> Self {
        Self {
            core: Arc::new(EmbedderCore {
                id: Uuid::new_v4(),
                init: Signal::new(),
                destroy: Signal::new(),
                embedding: Signal::new(),
                lifecycle: AtomicU8::new(Lifecycle::Uninitialized as u8),
                released: AtomicBool::new(false),
                claim: Claim::new(),
                work: Mutex::new(EmbedWork::empty()),
            }),
            main: Mutex::new(MainState {
                client: None,
                model: None,
                context_length: 0,
                embedding_length: 0,
                halted: false,
                vectors: Vec::new(),
                cursor: 0,
            }),
            worker: Mutex::new(None),
            events: None,
        }
    }

    pub fn with_events(events: Arc<dyn EmbedderEvents>) -> Self {
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
                tracing::error!(embedder = %self.core.id, "embedder worker panicked");
            }
        }
    }

    fn client(&self) -> Option<Arc<dyn EmbedderClient>> {
        self.main().client.as_ref().and_then(Weak::upgrade)
    }

    pub fn status(&self) -> ContextStatus {
        match self.core.lifecycle() {
            Lifecycle::Uninitialized => ContextStatus::Uninitialized,
            Lifecycle::Initializing => ContextStatus::Initializing,
            Lifecycle::Destroying => ContextStatus::Destroying,
            Lifecycle::Destroyed => ContextStatus::Destroyed,
            Lifecycle::Ready if self.core.embedding.is_raised() => {
                ContextStatus::Decoding(DecodeKind::Input)
            }
            Lifecycle::Ready => ContextStatus::Ready,
        }
    }

    pub fn is_available(&self) -> bool {
        self.core.lifecycle() == Lifecycle::Ready
            && !self.main().halted
            && !self.core.embedding.is_engaged()
    }

    pub fn is_drained(&self) -> bool {
        self.core.lifecycle() != Lifecycle::Initializing && !self.core.embedding.is_engaged()
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

    pub fn context_length(&self) -> Option<u32> {
        let main = self.main();
        main.model.as_ref().map(|_| main.context_length)
    }

    /// Width of the produced vectors; zero until initialized.
    pub fn embedding_length(&self) -> usize {
        self.main().embedding_length
    }

    /// Vectors of the last input not yet handed out by `next`.
    pub fn pending_vectors(&self) -> usize {
        let main = self.main();
        main.vectors.len() - main.cursor
    }

    pub(crate) fn registration_released(&self) -> bool {
        self.core.released.load(Ordering::Acquire)
    }

    /// Claims the embedder for a model and starts its worker. The whole
    /// context length is one batch.
    pub(crate) fn start(
        &self,
        model: Arc<dyn LoadedModel>,
        params: ContextParams,
    ) -> Result<(), RegisterError> {
        if !self.core.claim.acquire() {
            return Err(RegisterError::AlreadyRegistered);
        }
        let current = self.core.lifecycle();
        let started = matches!(current, Lifecycle::Uninitialized | Lifecycle::Destroyed)
            && self
                .core
                .lifecycle
                .compare_exchange(
                    current as u8,
                    Lifecycle::Initializing as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok();
        if !started {
            self.core.claim.release();
            return Err(RegisterError::AlreadyRegistered);
        }

        self.join_worker();
        for signal in [&self.core.init, &self.core.destroy, &self.core.embedding] {
            signal.hard_reset();
        }

        let context_length = params.context_length;
        {
            let mut work = self.core.work();
            *work = EmbedWork::empty();
            work.model = Some(Arc::clone(&model));
            work.params = Some(params);
        }
        {
            let mut main = self.main();
            main.model = Some(model);
            main.context_length = context_length;
            main.embedding_length = 0;
            main.halted = false;
            main.vectors.clear();
            main.cursor = 0;
        }
        self.core.released.store(false, Ordering::Release);
        self.core.init.raise();

        let core = Arc::clone(&self.core);
        let spawned = thread::Builder::new()
            .name(format!("emb-{}", &self.core.id.simple().to_string()[..8]))
            .spawn(move || worker::run(core));

        match spawned {
            Ok(handle) => {
                *self.worker.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
                tracing::debug!(embedder = %self.core.id, "embedder worker started");
                Ok(())
            }
            Err(err) => {
                self.core.init.hard_reset();
                self.main().model = None;
                self.core.set_lifecycle(current);
                self.core.claim.release();
                Err(RegisterError::WorkerSpawn(err))
            }
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

    /// Schedules one embedding batch. The summed length of all sequences
    /// must fit the context length.
    pub fn execute_input(&self, sequences: &[Vec<Token>]) -> Result<Dispatch, ContextError> {
        let mut main = self.main();
        match self.core.lifecycle() {
            Lifecycle::Uninitialized | Lifecycle::Destroyed => return Err(ContextError::NotRegistered),
            Lifecycle::Initializing => return Err(ContextError::Initializing),
            Lifecycle::Destroying => return Ok(Dispatch::Destroying),
            Lifecycle::Ready => {}
        }
        if sequences.is_empty() || sequences.iter().any(Vec::is_empty) {
            return Err(ContextError::InputIsEmpty);
        }

        let requested: usize = sequences.iter().map(Vec::len).sum();
        if requested > main.context_length as usize {
            return Err(ContextError::InputExceedsLimit {
                requested,
                cached: 0,
                limit: main.context_length,
            });
        }
        if main.halted {
            return Err(ContextError::Halted);
        }
        if self.core.embedding.is_engaged() {
            return Err(ContextError::AlreadyProcessing);
        }

        main.vectors.clear();
        main.cursor = 0;
        self.core.work().pending = sequences.to_vec();
        self.core.embedding.raise();
        drop(main);
        self.wake();

        tracing::trace!(embedder = %self.core.id, sequences = sequences.len(), requested, "embedding scheduled");
        Ok(Dispatch::Scheduled)
    }

    /// Hands the next vector of the last input to the client on the calling
    /// thread. The last vector is followed by `on_finish`.
    pub fn next(&self) -> Result<Dispatch, ContextError> {
        let (client, vector, index, is_finish, total_values) = {
            let mut main = self.main();
            match self.core.lifecycle() {
                Lifecycle::Uninitialized | Lifecycle::Destroyed => {
                    return Err(ContextError::NotRegistered)
                }
                Lifecycle::Initializing => return Err(ContextError::Initializing),
                Lifecycle::Destroying => return Ok(Dispatch::Destroying),
                Lifecycle::Ready => {}
            }
            // finished but not yet reported counts as in flight
            if self.core.embedding.is_engaged() {
                return Err(ContextError::AlreadyProcessing);
            }
            if main.halted {
                return Err(ContextError::Halted);
            }
            if main.cursor >= main.vectors.len() {
                return Err(ContextError::MissingInput);
            }

            let index = main.cursor;
            main.cursor += 1;
            let is_finish = main.cursor == main.vectors.len();
            let vector = std::mem::take(&mut main.vectors[index]);
            let total_values = main.embedding_length * main.cursor;
            if is_finish {
                main.vectors.clear();
                main.cursor = 0;
            }
            let client = main.client.as_ref().and_then(Weak::upgrade);
            (client, vector, index, is_finish, total_values)
        };

        if let Some(client) = client {
            client.on_write(self, &vector, index, is_finish);
            if is_finish {
                client.on_finish(self, total_values, FinishReason::Finished);
            }
        }
        Ok(Dispatch::Applied)
    }

    pub fn set_inference_client(&self, client: Arc<dyn EmbedderClient>) -> Result<(), ContextError> {
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

    pub fn destroy_sync(&self) -> Result<Dispatch, ContextError> {
        let dispatch = self.destroy()?;
        self.wait_torn_down();
        self.update();
        Ok(dispatch)
    }

    pub(crate) fn request_teardown(&self) {
        if matches!(self.core.lifecycle(), Lifecycle::Initializing | Lifecycle::Ready) {
            self.core.set_lifecycle(Lifecycle::Destroying);
        }
        if self.core.lifecycle() == Lifecycle::Destroying && self.core.destroy.raise() {
            tracing::debug!(embedder = %self.core.id, "teardown requested");
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
        if self.core.lifecycle() == Lifecycle::Ready && self.core.embedding.acknowledge() {
            self.finish_embedding();
        }
    }

    fn finish_init(&self) {
        let (failure, embedding_length) = {
            let mut work = self.core.work();
            (work.init_failure.take(), work.embedding_length)
        };
        match failure {
            None => {
                self.main().embedding_length = embedding_length;
                self.core.set_lifecycle(Lifecycle::Ready);
                tracing::info!(embedder = %self.core.id, embedding_length, "embedder ready");
                if let Some(events) = &self.events {
                    events.on_initialize(self);
                }
            }
            Some(code) => {
                self.join_worker();
                self.main().model = None;
                self.core.work().model = None;
                self.core.set_lifecycle(Lifecycle::Uninitialized);
                self.core.released.store(true, Ordering::Release);
                tracing::warn!(embedder = %self.core.id, ?code, "embedder initialization failed");
                if let Some(events) = &self.events {
                    events.on_initialize_fail(self, code);
                }
            }
        }
    }

    fn finish_embedding(&self) {
        let (vectors, processed, failure) = {
            let mut work = self.core.work();
            (
                std::mem::take(&mut work.vectors),
                work.processed,
                work.failure.take(),
            )
        };
        let client = self.client();

        match failure {
            None => {
                {
                    let mut main = self.main();
                    main.vectors = vectors;
                    main.cursor = 0;
                }
                if let Some(client) = client {
                    client.on_batch_processed(self, processed);
                }
            }
            Some(err) => {
                tracing::error!(embedder = %self.core.id, %err, "embedding abandoned");
                if let Some(client) = client {
                    client.on_finish(self, 0, FinishReason::Abandoned);
                }
            }
        }
    }

    fn finalize_destroy(&self) {
        self.core.destroy.acknowledge();
        self.join_worker();

        let in_flight = self.core.embedding.is_engaged();
        for signal in [&self.core.init, &self.core.destroy, &self.core.embedding] {
            signal.hard_reset();
        }

        let (client, undelivered, total_values) = {
            let mut main = self.main();
            let undelivered = main.cursor < main.vectors.len();
            let total_values = main.embedding_length * main.cursor;
            main.model = None;
            main.halted = false;
            main.vectors.clear();
            main.cursor = 0;
            (
                main.client.take().and_then(|weak| weak.upgrade()),
                undelivered,
                total_values,
            )
        };
        self.core.set_lifecycle(Lifecycle::Destroyed);
        self.core.released.store(true, Ordering::Release);
        tracing::info!(embedder = %self.core.id, "embedder destroyed");

        if let Some(client) = client {
            if in_flight || undelivered {
                client.on_finish(self, total_values, FinishReason::Abandoned);
            }
            client.on_unregister(self);
        }
        if let Some(events) = &self.events {
            events.on_destroy(self);
        }
    }
}

impl Registrant for EmbedderContext {
    fn id(&self) -> Uuid {
        self.core.id
    }

    fn registration_released(&self) -> bool {
        EmbedderContext::registration_released(self)
    }

    fn release_claim(&self) {
        self.core.claim.release();
    }

    fn update(&self) {
        EmbedderContext::update(self);
    }

    fn halt(&self) {
        EmbedderContext::halt(self);
    }

    fn resume(&self) {
        EmbedderContext::resume(self);
    }

    fn is_drained(&self) -> bool {
        EmbedderContext::is_drained(self)
    }

    // embedding weights take no adapters
    fn apply_adapters(&self, _adapters: Vec<LoraAdapter>) {
        self.resume();
    }

    fn request_teardown(&self) {
        EmbedderContext::request_teardown(self);
    }

    fn wait_torn_down(&self) {
        EmbedderContext::wait_torn_down(self);
    }
}

impl Drop for EmbedderContext {
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
