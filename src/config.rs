//! TOML runtime configuration of the demo driver and embedders.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::backend::BackendOptions;
use crate::context::{CacheMode, DecodeRequest, MIN_CONTEXT_LENGTH};
use crate::errors::ConfigError;
use crate::model::ContextSettings;
use crate::prompting::PromptFamily;
use crate::sampling::{SamplerSet, SamplerStage};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub model: ModelSection,
    pub context: ContextSection,
    pub decode: DecodeSection,
    pub logging: LoggingSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSection {
    pub path: PathBuf,
    /// Sum of the context lengths that may be registered at once.
    pub total_budget: u32,
    /// Chat template family; inferred from the file name when unset.
    pub family: Option<PromptFamily>,
    /// `tokenizer.json` location; looked up next to the model when unset.
    pub tokenizer: Option<PathBuf>,
    /// Accelerator offload; the CPU backend only accepts zero.
    pub gpu_layers: u32,
}

impl Default for ModelSection {
    fn default() -> Self {
        Self {
            path: PathBuf::new(),
            total_budget: 4096,
            family: None,
            tokenizer: None,
            gpu_layers: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextSection {
    pub context_length: u32,
    pub batch_size: u32,
    pub thread_count: u32,
    pub batch_thread_count: u32,
    pub flash_attention: bool,
    pub cache_mode: CacheMode,
    pub samplers: Vec<SamplerStage>,
}

impl Default for ContextSection {
    fn default() -> Self {
        Self {
            context_length: 2048,
            batch_size: 0,
            thread_count: 1,
            batch_thread_count: 1,
            flash_attention: false,
            cache_mode: CacheMode::default(),
            samplers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecodeSection {
    pub token_at_most: u32,
    pub halt_on_write: bool,
    pub halt_delay_ms: u32,
}

impl Default for DecodeSection {
    fn default() -> Self {
        Self {
            token_at_most: 16,
            halt_on_write: false,
            halt_delay_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    pub filter: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            filter: "inference_kernel=info".to_string(),
        }
    }
}

impl RuntimeConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.model.path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("model.path is required".to_string()));
        }
        if self.model.total_budget == 0 {
            return Err(ConfigError::Invalid(
                "model.total_budget must be greater than zero".to_string(),
            ));
        }
        if self.context.context_length < MIN_CONTEXT_LENGTH {
            return Err(ConfigError::Invalid(format!(
                "context.context_length must be at least {}",
                MIN_CONTEXT_LENGTH
            )));
        }
        if self.context.context_length > self.model.total_budget {
            return Err(ConfigError::Invalid(format!(
                "context.context_length {} exceeds model.total_budget {}",
                self.context.context_length, self.model.total_budget
            )));
        }
        if self.context.thread_count == 0 {
            return Err(ConfigError::Invalid(
                "context.thread_count must be greater than zero".to_string(),
            ));
        }

        let mut seen = SamplerSet::new();
        for stage in &self.context.samplers {
            if seen.insert(stage.clone()).is_some() {
                return Err(ConfigError::Invalid(format!(
                    "sampler {:?} is configured twice",
                    stage.kind()
                )));
            }
        }
        Ok(())
    }

    pub fn backend_options(&self) -> BackendOptions {
        BackendOptions {
            family: self.model.family,
            tokenizer: self.model.tokenizer.clone(),
            gpu_layers: self.model.gpu_layers,
        }
    }

    pub fn context_settings(&self) -> ContextSettings {
        let section = &self.context;
        ContextSettings {
            context_length: section.context_length,
            batch_size: section.batch_size,
            thread_count: section.thread_count,
            batch_thread_count: section.batch_thread_count,
            flash_attention: section.flash_attention,
            cache_mode: section.cache_mode,
            samplers: section.samplers.iter().cloned().collect(),
        }
    }

    pub fn decode_request(&self) -> DecodeRequest {
        DecodeRequest {
            token_at_most: self.decode.token_at_most,
            halt_on_write: self.decode.halt_on_write,
            halt_delay: self.decode.halt_delay_ms,
        }
    }
}
