//! Tracing setup and the leveled event hook used for lifecycle reporting.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::EnvFilter;

/// Installs the global `fmt` subscriber. `RUST_LOG` wins over
/// `default_filter` when set.
pub fn init_tracing(default_filter: &str) -> Result<(), TryInitError> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()))
        .with(tracing_subscriber::fmt::layer())
        .try_init()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogImportance {
    Low,
    Normal,
    High,
    Critical,
}

impl LogImportance {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

/// Emits one event at `level`, tagged with its importance.
pub fn log_event(level: LogLevel, importance: LogImportance, message: fmt::Arguments<'_>) {
    let importance = importance.as_str();
    match level {
        LogLevel::Trace => tracing::trace!(importance, "{}", message),
        LogLevel::Debug => tracing::debug!(importance, "{}", message),
        LogLevel::Info => tracing::info!(importance, "{}", message),
        LogLevel::Warn => tracing::warn!(importance, "{}", message),
        LogLevel::Error => tracing::error!(importance, "{}", message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_install_is_reported_not_fatal() {
        let _ = init_tracing("inference_kernel=debug");
        assert!(init_tracing("inference_kernel=debug").is_err());
        log_event(LogLevel::Info, LogImportance::High, format_args!("model {} ready", "m"));
    }

    #[test]
    fn importance_orders_and_parses() {
        assert!(LogImportance::Critical > LogImportance::Low);
        let parsed: LogImportance = serde_json::from_str("\"high\"").expect("parse importance");
        assert_eq!(parsed, LogImportance::High);
    }
}
