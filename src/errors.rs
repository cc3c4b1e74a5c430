use std::path::PathBuf;

use thiserror::Error;

use crate::model::ModelStatus;

/// Coarse classification shared by every error of the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Invalid counts, lengths or paths; caught synchronously.
    Configuration,
    /// Budget exhausted; nothing was mutated.
    ResourceExhausted,
    /// Native load/decode failure.
    BackendFailure,
    /// Request not valid in the current state (re-entrant call, double
    /// attach, unsupported cache mode).
    ProtocolMisuse,
    /// Informational: the target is stopped, stop issuing requests.
    Halted,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("model path not found: {0}")]
    PathNotFound(PathBuf),

    #[error("backend out of memory: {0}")]
    OutOfMemory(String),

    #[error("model load failed: {0}")]
    Load(String),

    #[error("context creation failed: {0}")]
    ContextCreation(String),

    #[error("decode failed: {0}")]
    Decode(String),

    #[error("tokenization failed: {0}")]
    Tokenize(String),

    #[error("sampling failed: {0}")]
    Sample(String),

    #[error("not supported by this backend: {0}")]
    Unsupported(String),
}

impl BackendError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::PathNotFound(_) => ErrorKind::Configuration,
            Self::Unsupported(_) => ErrorKind::ProtocolMisuse,
            _ => ErrorKind::BackendFailure,
        }
    }
}

/// Asynchronous model load failure, delivered through `on_initialize_fail`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitFailCode {
    PathNotFound,
    BackendError,
    OutOfMemory,
}

impl From<&BackendError> for InitFailCode {
    fn from(err: &BackendError) -> Self {
        match err {
            BackendError::PathNotFound(_) => Self::PathNotFound,
            BackendError::OutOfMemory(_) => Self::OutOfMemory,
            _ => Self::BackendError,
        }
    }
}

/// Asynchronous context creation failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextFailCode {
    ModelNotInitialized,
    OutOfMemory,
    BackendError,
    /// The model cannot serve this kind of context.
    InvalidModelType,
}

impl From<&BackendError> for ContextFailCode {
    fn from(err: &BackendError) -> Self {
        match err {
            BackendError::OutOfMemory(_) => Self::OutOfMemory,
            _ => Self::BackendError,
        }
    }
}

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("model path is missing")]
    MissingPath,

    #[error("total context budget must be greater than zero")]
    ZeroBudget,

    #[error("model is {0:?}, operation not valid in this state")]
    InvalidState(ModelStatus),

    #[error("failed to spawn model worker: {0}")]
    WorkerSpawn(#[source] std::io::Error),
}

impl ModelError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MissingPath | Self::ZeroBudget => ErrorKind::Configuration,
            Self::InvalidState(_) => ErrorKind::ProtocolMisuse,
            Self::WorkerSpawn(_) => ErrorKind::BackendFailure,
        }
    }
}

#[derive(Debug, Error)]
pub enum RegisterError {
    #[error("invalid registration input: {0}")]
    InvalidInput(&'static str),

    #[error("context length {requested} is below the minimum of {minimum} tokens")]
    ContextTooSmall { requested: u32, minimum: u32 },

    #[error("context is already registered")]
    AlreadyRegistered,

    #[error("context budget exceeded: requested {requested}, occupied {occupied} of {total}")]
    BudgetExceeded {
        requested: u32,
        occupied: u32,
        total: u32,
    },

    #[error("model is {0:?}, registration requires Ready")]
    ModelNotReady(ModelStatus),

    #[error("{processor} context cannot run on {model} weights")]
    ProcessorMismatch {
        processor: &'static str,
        model: &'static str,
    },

    #[error("failed to spawn context worker: {0}")]
    WorkerSpawn(#[source] std::io::Error),
}

impl RegisterError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidInput(_) | Self::ContextTooSmall { .. } => ErrorKind::Configuration,
            Self::BudgetExceeded { .. } => ErrorKind::ResourceExhausted,
            Self::AlreadyRegistered | Self::ModelNotReady(_) | Self::ProcessorMismatch { .. } => {
                ErrorKind::ProtocolMisuse
            }
            Self::WorkerSpawn(_) => ErrorKind::BackendFailure,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ContextError {
    #[error("context is not registered with a model")]
    NotRegistered,

    #[error("context is still initializing")]
    Initializing,

    #[error("input is empty")]
    InputIsEmpty,

    #[error("input of {requested} tokens with {cached} cached exceeds context length {limit}")]
    InputExceedsLimit {
        requested: usize,
        cached: usize,
        limit: u32,
    },

    #[error("context is already processing")]
    AlreadyProcessing,

    #[error("operation not supported: {0}")]
    OperationNotSupported(&'static str),

    #[error("unable to tokenize input: {0}")]
    TokenizationFailed(String),

    #[error("no processed input to generate from")]
    MissingInput,

    #[error("context is halted")]
    Halted,
}

impl ContextError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InputIsEmpty | Self::InputExceedsLimit { .. } => ErrorKind::Configuration,
            Self::TokenizationFailed(_) => ErrorKind::BackendFailure,
            Self::Halted => ErrorKind::Halted,
            Self::NotRegistered
            | Self::Initializing
            | Self::AlreadyProcessing
            | Self::OperationNotSupported(_)
            | Self::MissingInput => ErrorKind::ProtocolMisuse,
        }
    }

    pub fn is_informational(&self) -> bool {
        self.kind() == ErrorKind::Halted
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

impl ConfigError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Configuration
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_rejection_is_resource_exhaustion() {
        let err = RegisterError::BudgetExceeded {
            requested: 64,
            occupied: 2048,
            total: 2048,
        };
        assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
        assert!(err.to_string().contains("requested 64"));
    }

    #[test]
    fn halted_is_informational_only() {
        assert!(ContextError::Halted.is_informational());
        assert!(!ContextError::AlreadyProcessing.is_informational());
        assert_eq!(ContextError::AlreadyProcessing.kind(), ErrorKind::ProtocolMisuse);
    }

    #[test]
    fn backend_errors_map_to_fail_codes() {
        let missing = BackendError::PathNotFound(PathBuf::from("models/none.gguf"));
        assert_eq!(InitFailCode::from(&missing), InitFailCode::PathNotFound);
        assert_eq!(
            InitFailCode::from(&BackendError::OutOfMemory("kv".into())),
            InitFailCode::OutOfMemory
        );
        assert_eq!(
            ContextFailCode::from(&BackendError::Load("bad".into())),
            ContextFailCode::BackendError
        );
    }

    #[test]
    fn processor_mismatch_names_both_sides() {
        let err = RegisterError::ProcessorMismatch {
            processor: "text",
            model: "embedding",
        };
        assert_eq!(err.kind(), ErrorKind::ProtocolMisuse);
        assert_eq!(err.to_string(), "text context cannot run on embedding weights");
    }
}
