//! Inference router: admission control, local dispatch and cloud fallback
//!
//! Admission is a non-blocking semaphore acquire: when the ceiling is reached
//! the request is rejected, never queued. An admitted request first tries the
//! local model under its deadline and, if that fails or times out, makes at
//! most one cloud attempt. Every outcome is recorded to the monitor.

use crate::backend::CloudClient;
use crate::catalog::TaskType;
use crate::config::{InferenceParams, MAX_REQUEST_TIMEOUT_SECS};
use crate::error::{BackendError, LifecycleError, RouterError};
use crate::hardware::HardwareProfiler;
use crate::lifecycle::{InFlightGuard, LifecycleManager};
use crate::monitor::{PerformanceEntry, PerformanceMonitor, CLOUD_MODEL_ID, NO_MODEL_ID};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A single inference request, consumed by [`InferenceRouter::submit`]
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceRequest {
    pub id: Uuid,
    pub input: String,
    pub task_type: TaskType,
    pub submitted_at: DateTime<Utc>,
    /// Falls back to the router's default timeout when unset
    pub deadline: Option<Duration>,
}

impl InferenceRequest {
    pub fn new(input: impl Into<String>, task_type: TaskType) -> Self {
        Self {
            id: Uuid::new_v4(),
            input: input.into(),
            task_type,
            submitted_at: Utc::now(),
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Where an answer came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "origin", rename_all = "snake_case")]
pub enum ModelOrigin {
    Local { model_id: String },
    Cloud { provider: String },
}

impl ModelOrigin {
    pub fn is_cloud(&self) -> bool {
        matches!(self, ModelOrigin::Cloud { .. })
    }

    /// Local model id, `None` for cloud answers
    pub fn local_model(&self) -> Option<&str> {
        match self {
            ModelOrigin::Local { model_id } => Some(model_id),
            ModelOrigin::Cloud { .. } => None,
        }
    }
}

impl fmt::Display for ModelOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelOrigin::Local { model_id } => f.write_str(model_id),
            ModelOrigin::Cloud { provider } => write!(f, "cloud:{}", provider),
        }
    }
}

/// Successful outcome of a request
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InferenceResult {
    pub request_id: Uuid,
    pub response: String,
    pub model_used: ModelOrigin,
    pub processing_time: Duration,
    pub tokens_per_second: f64,
}

/// Routing policy
#[derive(Debug, Clone)]
pub struct RouterSettings {
    pub max_concurrent_requests: usize,
    pub default_timeout: Duration,
    pub prefer_local: bool,
    pub fallback_to_cloud: bool,
    pub cloud_timeout: Duration,
    pub params: InferenceParams,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            max_concurrent_requests: 3,
            default_timeout: Duration::from_secs(120),
            prefer_local: true,
            fallback_to_cloud: true,
            cloud_timeout: Duration::from_secs(60),
            params: InferenceParams::default(),
        }
    }
}

/// Why the local path produced no answer
#[derive(Debug)]
enum LocalFailure {
    Skipped(String),
    Failed(String),
    TimedOut,
}

impl LocalFailure {
    fn reason(&self) -> String {
        match self {
            LocalFailure::Skipped(reason) | LocalFailure::Failed(reason) => reason.clone(),
            LocalFailure::TimedOut => "local inference timed out".to_string(),
        }
    }
}

pub struct InferenceRouter {
    lifecycle: Arc<LifecycleManager>,
    profiler: Arc<HardwareProfiler>,
    monitor: Arc<PerformanceMonitor>,
    cloud: Option<Arc<dyn CloudClient>>,
    admission: Arc<Semaphore>,
    settings: RouterSettings,
}

impl InferenceRouter {
    pub fn new(
        lifecycle: Arc<LifecycleManager>,
        profiler: Arc<HardwareProfiler>,
        monitor: Arc<PerformanceMonitor>,
        cloud: Option<Arc<dyn CloudClient>>,
        settings: RouterSettings,
    ) -> Self {
        let limit = settings.max_concurrent_requests.max(1);
        Self {
            lifecycle,
            profiler,
            monitor,
            cloud,
            admission: Arc::new(Semaphore::new(limit)),
            settings: RouterSettings {
                max_concurrent_requests: limit,
                ..settings
            },
        }
    }

    pub fn settings(&self) -> &RouterSettings {
        &self.settings
    }

    /// Requests currently admitted
    pub fn in_flight(&self) -> usize {
        self.settings.max_concurrent_requests - self.admission.available_permits()
    }

    pub fn has_cloud(&self) -> bool {
        self.cloud.is_some()
    }

    /// Routes `request` to the local model or the cloud fallback
    pub async fn submit(&self, request: InferenceRequest) -> Result<InferenceResult, RouterError> {
        let limit = self.settings.max_concurrent_requests;
        let Ok(_permit) = self.admission.clone().try_acquire_owned() else {
            warn!(request = %request.id, limit, "Admission rejected");
            self.monitor
                .record(PerformanceEntry::failure(NO_MODEL_ID, Duration::ZERO, 0.0));
            return Err(RouterError::AdmissionRejected {
                in_flight: self.in_flight(),
                limit,
            });
        };

        let started = Instant::now();
        let deadline = deadline_from(started, request.deadline, self.settings.default_timeout);
        debug!(
            request = %request.id,
            task = %request.task_type,
            "Request admitted"
        );

        let local_enabled = self.lifecycle.settings().enabled;
        let local = if !local_enabled {
            Err(LocalFailure::Skipped(
                LifecycleError::LocalDisabled.to_string(),
            ))
        } else if !self.settings.prefer_local && self.cloud.is_some() {
            Err(LocalFailure::Skipped("local inference not preferred".to_string()))
        } else {
            self.run_local(&request, started, deadline).await
        };

        let failure = match local {
            Ok(result) => return Ok(result),
            Err(failure) => failure,
        };

        let cloud_allowed = match &failure {
            LocalFailure::Skipped(_) => true,
            _ => self.settings.fallback_to_cloud,
        };
        match (&self.cloud, cloud_allowed) {
            (Some(cloud), true) => self.run_cloud(cloud.as_ref(), &request, failure, started).await,
            _ => Err(match failure {
                LocalFailure::TimedOut => RouterError::Timeout {
                    elapsed: started.elapsed(),
                },
                other => RouterError::LocalInferenceFailed {
                    reason: other.reason(),
                },
            }),
        }
    }

    async fn lease(
        &self,
        task: TaskType,
        deadline: Instant,
    ) -> Result<InFlightGuard, LocalFailure> {
        if let Some(lease) = self.lifecycle.try_lease_for(task) {
            return Ok(lease);
        }

        // Activation runs detached so an expired deadline cannot abandon a
        // half-finished transition; a late lease is simply dropped
        let lifecycle = self.lifecycle.clone();
        let profiler = self.profiler.clone();
        let activation = tokio::spawn(async move {
            let snapshot = profiler.refresh_async().await;
            lifecycle.acquire(&snapshot, task).await
        });

        match tokio::time::timeout_at(deadline, activation).await {
            Err(_) => Err(LocalFailure::TimedOut),
            Ok(Err(join_error)) => Err(LocalFailure::Failed(format!(
                "activation task failed: {}",
                join_error
            ))),
            Ok(Ok(Err(e))) => Err(LocalFailure::Failed(e.to_string())),
            Ok(Ok(Ok(lease))) => Ok(lease),
        }
    }

    async fn run_local(
        &self,
        request: &InferenceRequest,
        started: Instant,
        deadline: Instant,
    ) -> Result<InferenceResult, LocalFailure> {
        let lease = match self.lease(request.task_type, deadline).await {
            Ok(lease) => lease,
            Err(failure) => {
                warn!(request = %request.id, "No local model: {}", failure.reason());
                self.monitor.record(PerformanceEntry::failure(
                    NO_MODEL_ID,
                    started.elapsed(),
                    0.0,
                ));
                return Err(failure);
            }
        };

        let model_id = lease.handle().model_id().to_string();
        let memory_gb = lease.handle().descriptor().memory_gb;
        let inference = self
            .lifecycle
            .infer(&lease, &request.input, &self.settings.params);

        let outcome = tokio::time::timeout_at(deadline, inference).await;
        // Released before any fallback so a pending swap is not held up
        drop(lease);

        match outcome {
            Ok(Ok(output)) => {
                let elapsed = started.elapsed();
                let entry =
                    PerformanceEntry::success(&model_id, output.tokens_generated, elapsed, memory_gb);
                let tokens_per_second = entry.tokens_per_second;
                self.monitor.record(entry);
                info!(
                    request = %request.id,
                    model = %model_id,
                    latency_ms = elapsed.as_millis() as u64,
                    "Local inference completed"
                );
                Ok(InferenceResult {
                    request_id: request.id,
                    response: output.text,
                    model_used: ModelOrigin::Local { model_id },
                    processing_time: elapsed,
                    tokens_per_second,
                })
            }
            Ok(Err(e)) => {
                warn!(request = %request.id, model = %model_id, "Local inference failed: {}", e);
                self.monitor.record(PerformanceEntry::failure(
                    &model_id,
                    started.elapsed(),
                    memory_gb,
                ));
                Err(LocalFailure::Failed(format!("{}: {}", model_id, e)))
            }
            Err(_) => {
                warn!(request = %request.id, model = %model_id, "Local inference timed out");
                self.monitor.record(PerformanceEntry::failure(
                    &model_id,
                    started.elapsed(),
                    memory_gb,
                ));
                Err(LocalFailure::TimedOut)
            }
        }
    }

    async fn run_cloud(
        &self,
        cloud: &dyn CloudClient,
        request: &InferenceRequest,
        local_failure: LocalFailure,
        started: Instant,
    ) -> Result<InferenceResult, RouterError> {
        let local_reason = local_failure.reason();
        info!(
            request = %request.id,
            provider = cloud.name(),
            "Falling back to cloud ({})",
            local_reason
        );

        let cloud_started = Instant::now();
        let outcome = tokio::time::timeout(
            self.settings.cloud_timeout,
            cloud.complete(&request.input, request.task_type, &self.settings.params),
        )
        .await
        .unwrap_or_else(|_| {
            Err(BackendError::TimeoutError {
                seconds: self.settings.cloud_timeout.as_secs(),
            })
        });

        match outcome {
            Ok(output) => {
                let entry = PerformanceEntry::success(
                    CLOUD_MODEL_ID,
                    output.tokens_generated,
                    cloud_started.elapsed(),
                    0.0,
                );
                let tokens_per_second = entry.tokens_per_second;
                self.monitor.record(entry);
                Ok(InferenceResult {
                    request_id: request.id,
                    response: output.text,
                    model_used: ModelOrigin::Cloud {
                        provider: cloud.name().to_string(),
                    },
                    processing_time: started.elapsed(),
                    tokens_per_second,
                })
            }
            Err(source) => {
                warn!(request = %request.id, "Cloud fallback failed: {}", source);
                self.monitor.record(PerformanceEntry::failure(
                    CLOUD_MODEL_ID,
                    cloud_started.elapsed(),
                    0.0,
                ));
                Err(RouterError::CloudFallbackFailed {
                    local_reason,
                    source,
                })
            }
        }
    }
}

/// Deadline for a request admitted at `started`, capped at the maximum timeout
fn deadline_from(started: Instant, requested: Option<Duration>, default: Duration) -> Instant {
    let ceiling = Duration::from_secs(MAX_REQUEST_TIMEOUT_SECS);
    let budget = requested.unwrap_or(default).min(ceiling);
    started.checked_add(budget).unwrap_or(started)
}

impl fmt::Debug for InferenceRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InferenceRouter")
            .field("in_flight", &self.in_flight())
            .field("has_cloud", &self.has_cloud())
            .field("settings", &self.settings)
            .finish()
    }
}
