use std::sync::Arc;
use std::thread;
use std::time::Instant;

use super::{LoraOp, ModelCore};
use crate::backend::LoraAdapter;
use crate::errors::BackendError;

/// Worker loop of one model. Loading, teardown and adapter switches all run
/// here so the driver thread never blocks on the backend.
pub(super) fn run(core: Arc<ModelCore>) {
    loop {
        if core.destroy.is_raised() {
            teardown(&core);
            core.destroy.mark_finished();
            return;
        }

        if core.init.is_raised() {
            let loaded = load(&core);
            core.init.mark_finished();
            if !loaded {
                return;
            }
            continue;
        }

        if core.lora.is_raised() {
            switch_adapters(&core);
            core.lora.mark_finished();
            continue;
        }

        thread::park();
    }
}

fn load(core: &ModelCore) -> bool {
    let (path, options) = {
        let work = core.work();
        (work.path.clone(), work.options.clone())
    };
    let total_budget = core.registry().total;

    let started = Instant::now();
    let result = core.backend.load(&path, total_budget, &options);
    let elapsed = started.elapsed();

    let mut work = core.work();
    work.load_time = elapsed;
    match result {
        Ok(loaded) => {
            tracing::debug!(
                path = %path.display(),
                family = ?loaded.family(),
                load_ms = elapsed.as_millis() as u64,
                "model weights loaded"
            );
            work.loaded = Some(loaded);
            true
        }
        Err(err) => {
            tracing::warn!(path = %path.display(), %err, "model load failed");
            work.failure = Some(err);
            false
        }
    }
}

/// Tears every registered context and embedder down, then frees the
/// model. All are signalled first so they shut down concurrently.
fn teardown(core: &ModelCore) {
    let processes = core.registry().snapshot();
    for process in &processes {
        process.registrant().request_teardown();
    }
    for process in &processes {
        process.registrant().wait_torn_down();
    }

    let mut work = core.work();
    work.loaded = None;
    work.pending_lora.clear();
    work.active_lora.clear();
    tracing::debug!(contexts = processes.len(), "model freed");
}

fn switch_adapters(core: &ModelCore) {
    let mut work = core.work();
    let ops = std::mem::take(&mut work.pending_lora);
    let Some(loaded) = work.loaded.clone() else {
        work.lora_failure = Some(BackendError::Load("model is not loaded".to_string()));
        return;
    };

    let mut next = work.active_lora.clone();
    for op in ops {
        match op {
            LoraOp::Assign(adapter) => {
                if let Err(err) = loaded.load_adapter(&adapter) {
                    tracing::warn!(adapter = %adapter.name, %err, "adapter load failed");
                    work.lora_failure = Some(err);
                    return;
                }
                upsert(&mut next, adapter);
            }
            LoraOp::Remove(name) => next.retain(|active| active.name != name),
        }
    }
    work.active_lora = next;
}

fn upsert(active: &mut Vec<LoraAdapter>, adapter: LoraAdapter) {
    match active.iter_mut().find(|a| a.name == adapter.name) {
        Some(slot) => *slot = adapter,
        None => active.push(adapter),
    }
}
