use std::mem;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use super::EmbedderCore;
use crate::errors::{BackendError, ContextFailCode};

/// Worker loop of one embedder: destroy, then init, then the pending batch.
pub(super) fn run(core: Arc<EmbedderCore>) {
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

        if core.embedding.is_raised() {
            embed(&core);
            core.embedding.mark_finished();
        } else {
            thread::park();
        }
    }
}

fn initialize(core: &EmbedderCore) -> bool {
    let started = Instant::now();
    let mut work = core.work();

    let (Some(model), Some(params)) = (work.model.clone(), work.params.clone()) else {
        work.init_failure = Some(ContextFailCode::ModelNotInitialized);
        return false;
    };
    if !model.is_embedding_model() {
        work.init_failure = Some(ContextFailCode::InvalidModelType);
        return false;
    }

    match model.create_embedder(&params) {
        Ok(encoder) => {
            work.embedding_length = encoder.embedding_length();
            work.encoder = Some(encoder);
            tracing::debug!(
                embedder = %core.id,
                embedding_length = work.embedding_length,
                load_ms = started.elapsed().as_millis() as u64,
                "embedding context created"
            );
            true
        }
        Err(err) => {
            tracing::warn!(embedder = %core.id, %err, "embedding context creation failed");
            work.init_failure = Some(match &err {
                BackendError::Unsupported(_) => ContextFailCode::InvalidModelType,
                other => ContextFailCode::from(other),
            });
            false
        }
    }
}

fn teardown(core: &EmbedderCore) {
    let mut work = core.work();
    work.encoder = None;
    work.model = None;
    work.pending.clear();
    work.vectors.clear();
    tracing::debug!(embedder = %core.id, "embedding context freed");
}

fn embed(core: &EmbedderCore) {
    let started = Instant::now();
    let mut guard = core.work();
    let work = &mut *guard;

    let pending = mem::take(&mut work.pending);
    work.vectors.clear();
    work.processed = 0;

    let result = match work.encoder.as_mut() {
        Some(encoder) => encoder.embed(&pending),
        None => Err(BackendError::Decode("embedder has no encoder".to_string())),
    };
    match result {
        Ok(vectors) if vectors.len() == pending.len() => {
            work.processed = pending.iter().map(Vec::len).sum();
            work.vectors = vectors;
            tracing::trace!(
                embedder = %core.id,
                sequences = pending.len(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "batch embedded"
            );
        }
        Ok(vectors) => {
            work.failure = Some(BackendError::Decode(format!(
                "{} vectors for {} sequences",
                vectors.len(),
                pending.len()
            )));
        }
        Err(err) => {
            tracing::warn!(embedder = %core.id, %err, "embedding failed");
            work.failure = Some(err);
        }
    }
}
