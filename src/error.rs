//! Error taxonomy for the orchestrator
//!
//! Per-request failures (`RouterError`) are always returned to the caller.
//! Subsystem failures (`ProbeError`, `CatalogError::InvalidTransition`) are
//! contained by their owners and degrade functionality instead of aborting.

use crate::config::ConfigError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Errors reported by an opaque capability (local backend, transport, cloud)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BackendError {
    /// Remote API answered with an error
    ApiError {
        message: String,
        status_code: Option<u16>,
    },

    /// Request timed out after the specified duration (in seconds)
    TimeoutError { seconds: u64 },

    /// Network-related error
    NetworkError { message: String },

    /// Response could not be interpreted
    InvalidResponse {
        message: String,
        raw_response: Option<String>,
    },

    /// Missing credentials, bad endpoint and similar
    ConfigurationError { message: String },

    /// Generic error for other cases
    Other { message: String },
}

impl BackendError {
    pub fn other(message: impl Into<String>) -> Self {
        BackendError::Other {
            message: message.into(),
        }
    }
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendError::ApiError {
                message,
                status_code,
            } => {
                if let Some(code) = status_code {
                    write!(f, "API error ({}): {}", code, message)
                } else {
                    write!(f, "API error: {}", message)
                }
            }
            BackendError::TimeoutError { seconds } => {
                write!(f, "Request timed out after {} seconds", seconds)
            }
            BackendError::NetworkError { message } => {
                write!(f, "Network error: {}", message)
            }
            BackendError::InvalidResponse { message, .. } => {
                write!(f, "Invalid response from backend: {}", message)
            }
            BackendError::ConfigurationError { message } => {
                write!(f, "Configuration error: {}", message)
            }
            BackendError::Other { message } => {
                write!(f, "Error: {}", message)
            }
        }
    }
}

impl std::error::Error for BackendError {}

impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            BackendError::TimeoutError { seconds: 0 }
        } else if let Some(status) = err.status() {
            BackendError::ApiError {
                message: err.to_string(),
                status_code: Some(status.as_u16()),
            }
        } else if err.is_decode() {
            BackendError::InvalidResponse {
                message: err.to_string(),
                raw_response: None,
            }
        } else {
            BackendError::NetworkError {
                message: err.to_string(),
            }
        }
    }
}

/// Hardware probing failed; callers fall back to a conservative snapshot
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProbeError {
    #[error("system memory information is unavailable")]
    MemoryUnavailable,

    #[error("hardware probe failed: {0}")]
    Failed(String),
}

/// Errors raised by the model catalog
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CatalogError {
    #[error("no catalog model fits {available_gb:.1}GB usable memory on {tier} hardware")]
    NoFittingModel { available_gb: f64, tier: String },

    #[error("invalid download state transition for '{model_id}': {from} -> {to}")]
    InvalidTransition {
        model_id: String,
        from: String,
        to: String,
    },

    #[error("unknown model '{0}'")]
    UnknownModel(String),

    #[error("model '{0}' is already registered")]
    DuplicateModel(String),

    #[error("invalid model descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("model '{0}' is the active model")]
    ModelInUse(String),
}

/// Errors raised while making a model available locally
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DownloadError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error("download of '{model_id}' failed: {source}")]
    Transport {
        model_id: String,
        source: BackendError,
    },

    #[error("download of '{0}' was cancelled")]
    Cancelled(String),
}

/// Errors raised by slot transitions
#[derive(Debug, Clone, Error, PartialEq)]
pub enum LifecycleError {
    #[error("backend refused to load '{model_id}': {source}")]
    ModelLoad {
        model_id: String,
        source: BackendError,
    },

    #[error(transparent)]
    Download(#[from] DownloadError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error("model '{model_id}' needs {required_gb:.1}GB but only {usable_gb:.1}GB is usable")]
    DoesNotFit {
        model_id: String,
        required_gb: f64,
        usable_gb: f64,
    },

    #[error("local inference is disabled")]
    LocalDisabled,
}

/// Errors raised while assembling or starting the orchestrator
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error("failed to set up backend: {0}")]
    Backend(#[from] BackendError),
}

/// Per-request failures returned by the router
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RouterError {
    #[error("admission rejected: {in_flight} requests already in flight (limit {limit})")]
    AdmissionRejected { in_flight: usize, limit: usize },

    #[error("local inference failed: {reason}")]
    LocalInferenceFailed { reason: String },

    #[error("cloud fallback failed after local failure ({local_reason}): {source}")]
    CloudFallbackFailed {
        local_reason: String,
        source: BackendError,
    },

    #[error("request timed out after {elapsed:?}")]
    Timeout { elapsed: Duration },
}

impl RouterError {
    /// Whether retrying the same request later may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            RouterError::AdmissionRejected { .. } | RouterError::Timeout { .. } => true,
            RouterError::LocalInferenceFailed { .. } => true,
            RouterError::CloudFallbackFailed { source, .. } => !matches!(
                source,
                BackendError::ConfigurationError { .. }
            ),
        }
    }

    /// Short stable label used in logs and monitor entries
    pub fn kind(&self) -> &'static str {
        match self {
            RouterError::AdmissionRejected { .. } => "admission_rejected",
            RouterError::LocalInferenceFailed { .. } => "local_inference_failed",
            RouterError::CloudFallbackFailed { .. } => "cloud_fallback_failed",
            RouterError::Timeout { .. } => "timeout",
        }
    }
}
