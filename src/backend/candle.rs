use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use candle_core::quantized::gguf_file;
use candle_core::{DType, Device, Tensor};
use candle_transformers::generation::{LogitsProcessor, Sampling};
use candle_transformers::models::quantized_llama;
use candle_transformers::models::quantized_qwen2;
use tokenizers::Tokenizer;

use super::tokenizer::{resolve_special_tokens, resolve_tokenizer_path, SpecialTokens};
use super::{Backend, BackendOptions, ContextParams, DecodeContext, LoadedModel, LoraAdapter, Token};
use crate::errors::BackendError;
use crate::prompting::PromptFamily;
use crate::sampling::{SamplerChain, SamplerKind, SamplerStage, DEFAULT_DIST_SEED};

fn backend_err(prefix: &'static str) -> impl Fn(candle_core::Error) -> BackendError {
    move |e| BackendError::Decode(format!("{}: {}", prefix, e))
}

enum RuntimeWeights {
    Llama(quantized_llama::ModelWeights),
    Qwen2(quantized_qwen2::ModelWeights),
}

impl RuntimeWeights {
    fn load_from_gguf(path: &Path, family: PromptFamily, device: &Device) -> Result<Self, BackendError> {
        let mut file = File::open(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => BackendError::PathNotFound(path.to_path_buf()),
            _ => BackendError::Load(format!("failed to open model file: {}", e)),
        })?;
        let content = gguf_file::Content::read(&mut file)
            .map_err(|e| BackendError::Load(format!("invalid gguf file: {}", e)))?;

        match family {
            PromptFamily::Llama | PromptFamily::Mistral | PromptFamily::Phi3 => {
                quantized_llama::ModelWeights::from_gguf(content, &mut file, device)
                    .map(Self::Llama)
                    .map_err(|e| BackendError::Load(e.to_string()))
            }
            PromptFamily::Qwen => quantized_qwen2::ModelWeights::from_gguf(content, &mut file, device)
                .map(Self::Qwen2)
                .map_err(|e| {
                    let msg = e.to_string();
                    if msg.contains("cannot find tensor info for output_norm.weight") {
                        BackendError::Load(
                            "qwen load failed: missing 'output_norm.weight', the gguf is likely an incomplete split shard"
                                .to_string(),
                        )
                    } else {
                        BackendError::Load(msg)
                    }
                }),
            PromptFamily::Unknown => Err(BackendError::Unsupported(
                "unknown model family, cannot choose runtime weights".to_string(),
            )),
        }
    }

    fn forward(&mut self, input: &Tensor, position: usize) -> candle_core::Result<Tensor> {
        match self {
            Self::Llama(model) => model.forward(input, position),
            Self::Qwen2(model) => model.forward(input, position),
        }
    }

    fn duplicate_if_supported(&self) -> Option<Self> {
        match self {
            Self::Llama(model) => Some(Self::Llama(model.clone())),
            Self::Qwen2(_) => None,
        }
    }
}

/// Quantized GGUF weights evaluated with candle on the CPU.
pub struct CandleBackend {
    device: Device,
}

impl Default for CandleBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl CandleBackend {
    pub fn new() -> Self {
        Self { device: Device::Cpu }
    }
}

impl Backend for CandleBackend {
    fn name(&self) -> &'static str {
        "candle"
    }

    fn load(
        &self,
        path: &Path,
        total_budget: u32,
        options: &BackendOptions,
    ) -> Result<Arc<dyn LoadedModel>, BackendError> {
        if options.gpu_layers > 0 && self.device.is_cpu() {
            return Err(BackendError::Unsupported(format!(
                "{} gpu layers requested on a cpu-only device",
                options.gpu_layers
            )));
        }
        if !path.exists() {
            return Err(BackendError::PathNotFound(path.to_path_buf()));
        }

        let family = options.family.unwrap_or_else(|| {
            let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
            PromptFamily::infer_from_filename(stem)
        });

        tracing::info!(path = %path.display(), ?family, total_budget, "loading gguf weights");
        let master = RuntimeWeights::load_from_gguf(path, family, &self.device)?;

        let tokenizer_path = resolve_tokenizer_path(path, options.tokenizer.as_deref())
            .ok_or_else(|| BackendError::Load("tokenizer.json not found next to the model".to_string()))?;
        let tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| BackendError::Load(format!("tokenizer {}: {}", tokenizer_path.display(), e)))?;
        let special = resolve_special_tokens(&tokenizer, family)?;

        tracing::debug!(
            tokenizer = %tokenizer_path.display(),
            eos = special.eos,
            eot = special.eot,
            "tokenizer ready"
        );

        Ok(Arc::new(CandleModel {
            path: path.to_path_buf(),
            family,
            device: self.device.clone(),
            master,
            tokenizer,
            special,
        }))
    }
}

struct CandleModel {
    path: PathBuf,
    family: PromptFamily,
    device: Device,
    master: RuntimeWeights,
    tokenizer: Tokenizer,
    special: SpecialTokens,
}

impl LoadedModel for CandleModel {
    fn family(&self) -> PromptFamily {
        self.family
    }

    fn tokenize(&self, text: &str) -> Result<Vec<Token>, BackendError> {
        self.tokenizer
            .encode(text, true)
            .map(|encoding| encoding.get_ids().to_vec())
            .map_err(|e| BackendError::Tokenize(e.to_string()))
    }

    fn token_to_piece(&self, token: Token) -> Result<String, BackendError> {
        self.tokenizer
            .decode(&[token], false)
            .map_err(|e| BackendError::Tokenize(e.to_string()))
    }

    fn is_end_of_generation(&self, token: Token) -> bool {
        self.special.contains(token)
    }

    fn create_context(&self, params: &ContextParams) -> Result<Box<dyn DecodeContext>, BackendError> {
        let weights = match self.master.duplicate_if_supported() {
            Some(weights) => weights,
            None => {
                tracing::debug!(family = ?self.family, "weights are not cloneable, reloading for new context");
                RuntimeWeights::load_from_gguf(&self.path, self.family, &self.device)
                    .map_err(|e| BackendError::ContextCreation(e.to_string()))?
            }
        };

        Ok(Box::new(CandleContext {
            weights,
            device: self.device.clone(),
            context_length: params.context_length as usize,
            position: 0,
            logits: None,
            checkpoint: None,
            processor: None,
        }))
    }

    fn load_adapter(&self, adapter: &LoraAdapter) -> Result<(), BackendError> {
        Err(BackendError::Unsupported(format!(
            "lora adapter {} on quantized candle weights",
            adapter.name
        )))
    }
}

struct Checkpoint {
    weights: RuntimeWeights,
    position: usize,
    logits: Option<Tensor>,
}

struct CandleContext {
    weights: RuntimeWeights,
    device: Device,
    context_length: usize,
    position: usize,
    logits: Option<Tensor>,
    checkpoint: Option<Checkpoint>,
    processor: Option<LogitsProcessor>,
}

fn build_sampling(chain: &SamplerChain) -> Sampling {
    if chain.is_greedy() {
        return Sampling::ArgMax;
    }

    let temperature = match chain.stage(SamplerKind::Temperature) {
        Some(SamplerStage::Temperature { temperature }) => *temperature,
        _ => 1.0,
    };
    if temperature <= 0.0 {
        return Sampling::ArgMax;
    }

    let top_k = match chain.stage(SamplerKind::TopK) {
        Some(SamplerStage::TopK { k }) => Some(*k),
        _ => None,
    };
    let top_p = match chain.stage(SamplerKind::TopP) {
        Some(SamplerStage::TopP { p }) => Some(*p),
        _ => None,
    };

    match (top_k, top_p) {
        (None, None) => Sampling::All { temperature },
        (Some(k), None) => Sampling::TopK { k, temperature },
        (None, Some(p)) => Sampling::TopP { p, temperature },
        (Some(k), Some(p)) => Sampling::TopKThenTopP { k, p, temperature },
    }
}

impl DecodeContext for CandleContext {
    fn decode(&mut self, batch: &[Token]) -> Result<(), BackendError> {
        if batch.is_empty() {
            return Ok(());
        }
        if self.position + batch.len() > self.context_length {
            return Err(BackendError::Decode(format!(
                "batch of {} at position {} overflows context of {}",
                batch.len(),
                self.position,
                self.context_length
            )));
        }

        let input = Tensor::new(batch, &self.device)
            .and_then(|t| t.unsqueeze(0))
            .map_err(backend_err("input tensor"))?;
        let logits = self
            .weights
            .forward(&input, self.position)
            .map_err(backend_err("forward"))?;
        let logits = logits
            .squeeze(0)
            .and_then(|t| t.to_dtype(DType::F32))
            .map_err(backend_err("logits"))?;

        self.logits = Some(logits);
        self.position += batch.len();
        Ok(())
    }

    fn sample(&mut self, chain: &SamplerChain, history: &[Token]) -> Result<Token, BackendError> {
        let mut logits = self
            .logits
            .clone()
            .ok_or_else(|| BackendError::Sample("no logits, decode something first".to_string()))?;

        if let Some(SamplerStage::RepetitionPenalty { penalty, last_n }) =
            chain.stage(SamplerKind::RepetitionPenalty)
        {
            if *penalty != 1.0 {
                let start = history.len().saturating_sub(*last_n);
                logits = candle_transformers::utils::apply_repeat_penalty(&logits, *penalty, &history[start..])
                    .map_err(|e| BackendError::Sample(e.to_string()))?;
            }
        }

        let processor = self.processor.get_or_insert_with(|| {
            let seed = chain.seed().unwrap_or(DEFAULT_DIST_SEED);
            LogitsProcessor::from_sampling(seed, build_sampling(chain))
        });

        processor
            .sample(&logits)
            .map_err(|e| BackendError::Sample(e.to_string()))
    }

    fn truncate_cache(&mut self, keep: usize) -> Result<(), BackendError> {
        if keep == self.position {
            return Ok(());
        }

        // forward at position 0 discards the attention cache
        if keep == 0 {
            self.position = 0;
            self.logits = None;
            return Ok(());
        }

        match &self.checkpoint {
            Some(checkpoint) if checkpoint.position == keep => {
                let weights = checkpoint.weights.duplicate_if_supported().ok_or_else(|| {
                    BackendError::Unsupported("checkpoint weights are not cloneable".to_string())
                })?;
                self.weights = weights;
                self.position = checkpoint.position;
                self.logits = checkpoint.logits.clone();
                Ok(())
            }
            _ => Err(BackendError::Unsupported(format!(
                "partial truncation to {} without a checkpoint",
                keep
            ))),
        }
    }

    fn mark_checkpoint(&mut self) {
        self.checkpoint = self.weights.duplicate_if_supported().map(|weights| Checkpoint {
            weights,
            position: self.position,
            logits: self.logits.clone(),
        });
    }

    fn reset_sampler(&mut self) {
        self.processor = None;
    }

    fn set_adapters(&mut self, adapters: &[LoraAdapter]) -> Result<(), BackendError> {
        if adapters.is_empty() {
            return Ok(());
        }
        Err(BackendError::Unsupported(
            "lora adapters on quantized candle weights".to_string(),
        ))
    }
}
