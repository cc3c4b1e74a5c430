use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::model::{ModelController, ModelStatus};

/// Application-owned update loop. Every callback of every registered model
/// and context is delivered from `tick` on the thread that calls it.
#[derive(Default)]
pub struct Driver {
    models: Vec<Arc<ModelController>>,
}

impl Driver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_model(&mut self, model: Arc<ModelController>) {
        self.models.push(model);
    }

    pub fn models(&self) -> &[Arc<ModelController>] {
        &self.models
    }

    /// One non-blocking sweep over all models.
    pub fn tick(&self) {
        for model in &self.models {
            model.update();
        }
    }

    /// Ticks every `interval` until `done` holds. Returns `false` when
    /// `max_ticks` sweeps were not enough.
    pub fn run_until(&self, mut done: impl FnMut() -> bool, interval: Duration, max_ticks: usize) -> bool {
        for _ in 0..max_ticks {
            self.tick();
            if done() {
                return true;
            }
            thread::sleep(interval);
        }
        false
    }

    /// Forgets models that reached `Destroyed`.
    pub fn prune_destroyed(&mut self) -> usize {
        let before = self.models.len();
        self.models
            .retain(|model| model.status() != ModelStatus::Destroyed);
        before - self.models.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::scripted::{Script, ScriptedBackend};
    use crate::backend::BackendOptions;
    use crate::client::recording::Recorder;
    use crate::client::FinishReason;
    use crate::context::{DecodeRequest, ProcessingContext};
    use crate::model::ContextSettings;

    #[test]
    fn driver_delivers_a_whole_conversation() {
        let model = Arc::new(ModelController::new(Arc::new(ScriptedBackend::new(
            Script::replying("fine"),
        ))));
        let mut driver = Driver::new();
        driver.add_model(Arc::clone(&model));

        model
            .initialize("models/llama-3-test.gguf", 1024, BackendOptions::default())
            .expect("initialize");
        assert!(driver.run_until(
            || model.status() == ModelStatus::Ready,
            Duration::from_millis(5),
            400
        ));

        let ctx = Arc::new(ProcessingContext::new());
        model
            .register_context_process(&ctx, ContextSettings::new(256))
            .expect("register");
        assert!(driver.run_until(|| ctx.is_available(), Duration::from_millis(5), 400));

        let client = Recorder::pulling(DecodeRequest::tokens(2));
        ctx.set_inference_client(client.clone()).expect("attach");
        let prompt = ctx.tokenize_input("how are you").expect("tokenize");
        ctx.execute_input(&prompt, false).expect("execute");
        assert!(driver.run_until(|| ctx.is_available(), Duration::from_millis(5), 400));
        ctx.next(DecodeRequest::tokens(2)).expect("next");

        assert!(driver.run_until(|| client.finish().is_some(), Duration::from_millis(5), 400));
        assert_eq!(client.written(), b"fine".iter().map(|b| u32::from(*b)).collect::<Vec<_>>());
        assert_eq!(client.finish(), Some((prompt.len() + 4, FinishReason::Finished)));

        model.destroy();
        assert!(driver.run_until(
            || model.status() == ModelStatus::Destroyed,
            Duration::from_millis(5),
            400
        ));
        assert_eq!(driver.prune_destroyed(), 1);
        assert!(driver.models().is_empty());
    }
}
