use std::env;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use inference_kernel::backend::candle::CandleBackend;
use inference_kernel::logging::init_tracing;
use inference_kernel::prompting::should_stop_on_text;
use inference_kernel::{
    CacheMode, ContextLine, ContextStatus, DecodeRequest, Driver, FinishReason, InferenceClient,
    ModelController, ModelStatus, ProcessingContext, PromptFamily, RuntimeConfig, Token,
};

const DEFAULT_CONFIG: &str = "kernel.toml";
const DEFAULT_PROMPT: &str = "Hello! Who are you?";
const TICK: Duration = Duration::from_millis(2);

/// Streams generated pieces to stdout and keeps pulling until the model
/// finishes or writes a stop marker of its family.
struct StdoutClient {
    request: DecodeRequest,
    family: PromptFamily,
    text: Mutex<String>,
    done: AtomicBool,
}

impl StdoutClient {
    fn new(request: DecodeRequest, family: PromptFamily) -> Self {
        Self {
            request,
            family,
            text: Mutex::new(String::new()),
            done: AtomicBool::new(false),
        }
    }

    fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    fn pull(&self, ctx: &ProcessingContext) {
        if let Err(err) = ctx.next(self.request) {
            tracing::warn!(%err, "generation not scheduled");
            self.done.store(true, Ordering::Release);
        }
    }
}

impl InferenceClient for StdoutClient {
    fn on_batch_processed(&self, ctx: &ProcessingContext, processed_len: usize, is_kv_locked: bool) {
        tracing::info!(processed_len, is_kv_locked, "prompt decoded");
        self.pull(ctx);
    }

    fn on_write(&self, ctx: &ProcessingContext, tokens: &[Token], is_finish: bool) {
        if is_finish {
            return;
        }

        let mut text = self.text.lock().unwrap_or_else(PoisonError::into_inner);
        let mut out = io::stdout().lock();
        for token in tokens {
            match ctx.token_to_piece(*token) {
                Ok(piece) => {
                    let _ = write!(out, "{piece}");
                    text.push_str(&piece);
                }
                Err(err) => tracing::debug!(token, %err, "token has no printable piece"),
            }
        }
        let _ = out.flush();

        if should_stop_on_text(self.family, &text) {
            tracing::debug!("stop marker written");
            self.done.store(true, Ordering::Release);
            return;
        }
        drop(text);
        self.pull(ctx);
    }

    fn on_finish(&self, _ctx: &ProcessingContext, total_tokens: usize, reason: FinishReason) {
        println!();
        tracing::info!(total_tokens, ?reason, "generation finished");
        self.done.store(true, Ordering::Release);
    }
}

fn main() -> Result<()> {
    let mut args = env::args().skip(1);
    let config_path = args.next().unwrap_or_else(|| DEFAULT_CONFIG.to_string());
    let prompt = args.collect::<Vec<_>>().join(" ");
    let prompt = if prompt.trim().is_empty() {
        DEFAULT_PROMPT.to_string()
    } else {
        prompt
    };

    let config = RuntimeConfig::load(&config_path)
        .with_context(|| format!("failed to load config {config_path}"))?;
    if let Err(err) = init_tracing(&config.logging.filter) {
        eprintln!("tracing already initialized: {err}");
    }
    tracing::info!("inference_kernel v{}", env!("CARGO_PKG_VERSION"));

    let model = Arc::new(ModelController::new(Arc::new(CandleBackend::new())));
    let mut driver = Driver::new();
    driver.add_model(Arc::clone(&model));

    let status = model
        .initialize_sync(
            &config.model.path,
            config.model.total_budget,
            config.backend_options(),
        )
        .context("model initialization rejected")?;
    if status != ModelStatus::Ready {
        bail!("model {} failed to load", config.model.path.display());
    }

    let ctx = Arc::new(ProcessingContext::new());
    let handle = model
        .register_context_process(&ctx, config.context_settings())
        .context("context registration rejected")?;
    tracing::info!(handle = %handle, context = %ctx.id(), "context registered");

    driver.run_until(
        || ctx.status() != ContextStatus::Initializing,
        TICK,
        usize::MAX,
    );
    if ctx.status() != ContextStatus::Ready {
        model.destroy_sync();
        bail!("context failed to initialize");
    }

    let family = config
        .model
        .family
        .unwrap_or_else(|| PromptFamily::infer_from_filename(&config.model.path.to_string_lossy()));
    let client = Arc::new(StdoutClient::new(config.decode_request(), family));
    ctx.set_inference_client(client.clone())?;

    let tokens = ctx.tokenize_conversation(
        &[
            ContextLine::system("You are a helpful assistant."),
            ContextLine::user(prompt),
        ],
        true,
    )?;
    let kv_locked = config.context.cache_mode == CacheMode::KvLock;
    ctx.execute_input(&tokens, kv_locked)?;

    driver.run_until(|| client.is_done() && ctx.is_available(), TICK, usize::MAX);

    match ctx.diagnostics().to_json() {
        Ok(json) => tracing::info!(diagnostics = %json, "context diagnostics"),
        Err(err) => tracing::warn!(%err, "diagnostics not serializable"),
    }

    ctx.release_inference_client();
    model.destroy_sync();
    tracing::info!(status = ?model.status(), "shutdown complete");
    Ok(())
}
