//! Request and response shapes of the orchestrator's external interface

use crate::catalog::{CatalogStats, DownloadState, ModelDescriptor, TaskType};
use crate::config::MAX_REQUEST_TIMEOUT_SECS;
use crate::error::RouterError;
use crate::hardware::{ComputeTier, HardwareSnapshot};
use crate::lifecycle::{ForcedEvictionWarning, SlotPhase};
use crate::monitor::PerformanceSummary;
use crate::router::InferenceResult;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Performance figures included in the status report
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceReport {
    pub overall: PerformanceSummary,
    /// Window of the active model, if any
    pub active_model: Option<PerformanceSummary>,
    pub by_model: BTreeMap<String, PerformanceSummary>,
}

/// Answer to the status query
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    pub hardware: HardwareSnapshot,
    pub active_model: Option<ModelDescriptor>,
    pub slot: SlotPhase,
    pub in_flight_requests: usize,
    pub pending_specialization: Option<TaskType>,
    pub performance: PerformanceReport,
    pub catalog: CatalogStats,
    pub downloads_in_progress: Vec<String>,
    pub forced_evictions: Vec<ForcedEvictionWarning>,
    pub local_enabled: bool,
    pub cloud_configured: bool,
}

/// One row of the model listing
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelListing {
    pub id: String,
    pub display_name: String,
    pub memory_gb: f64,
    pub tags: Vec<String>,
    pub min_tier: ComputeTier,
    pub available: bool,
    pub download_state: DownloadState,
    /// Fits the current hardware snapshot
    pub recommended: bool,
    pub active: bool,
}

impl ModelListing {
    pub fn new(model: ModelDescriptor, recommended: bool, active: bool) -> Self {
        Self {
            id: model.id,
            display_name: model.display_name,
            memory_gb: model.memory_gb,
            tags: model.tags.into_iter().collect(),
            min_tier: model.min_tier,
            available: model.available_locally,
            download_state: model.download_state,
            recommended,
            active,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DownloadCommand {
    pub model_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DownloadResponse {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn failed(error: impl ToString) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct InferenceCommand {
    pub input: String,
    #[serde(default)]
    pub task_type: String,
    /// Request deadline in seconds
    #[serde(default)]
    pub timeout_secs: Option<f64>,
}

impl InferenceCommand {
    pub fn new(input: impl Into<String>, task_type: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            task_type: task_type.into(),
            timeout_secs: None,
        }
    }

    /// The requested deadline, capped at the maximum request timeout
    ///
    /// Non-positive and NaN values mean no deadline was given.
    pub fn deadline(&self) -> Option<Duration> {
        let secs = self.timeout_secs.filter(|s| *s > 0.0 && !s.is_nan())?;
        let ceiling = Duration::from_secs(MAX_REQUEST_TIMEOUT_SECS);
        Some(Duration::try_from_secs_f64(secs).map_or(ceiling, |d| d.min(ceiling)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceResponse {
    pub success: bool,
    pub response: String,
    /// Local model id, or `cloud:<provider>` for fallback answers
    pub model_used: String,
    /// Seconds
    pub processing_time: f64,
    pub tokens_per_second: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Stable failure label, see [`RouterError::kind`]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
}

impl From<Result<InferenceResult, RouterError>> for InferenceResponse {
    fn from(outcome: Result<InferenceResult, RouterError>) -> Self {
        match outcome {
            Ok(result) => Self {
                success: true,
                response: result.response,
                model_used: result.model_used.to_string(),
                processing_time: result.processing_time.as_secs_f64(),
                tokens_per_second: result.tokens_per_second,
                error: None,
                error_kind: None,
            },
            Err(e) => Self {
                success: false,
                response: String::new(),
                model_used: String::new(),
                processing_time: 0.0,
                tokens_per_second: 0.0,
                error: Some(e.to_string()),
                error_kind: Some(e.kind().to_string()),
            },
        }
    }
}
