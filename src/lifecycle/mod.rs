//! Model lifecycle manager
//!
//! Owns the single model slot. Every slot transition (activation, drain,
//! unload) runs under one async transition lock, while request admission
//! only touches the per-handle lease mutex. A swap therefore never blocks
//! running inference until the drain step, which stops new admissions and
//! waits for the in-flight count to reach zero, bounded by the drain timeout.

mod slot;

pub use slot::{ActiveModelHandle, InFlightGuard, SlotPhase, SlotState};

use crate::backend::{InferenceBackend, InferenceOutput};
use crate::catalog::{ModelCatalog, ModelDescriptor, TaskType};
use crate::config::InferenceParams;
use crate::download::DownloadManager;
use crate::error::{BackendError, CatalogError, LifecycleError};
use crate::hardware::HardwareSnapshot;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

const MAX_RECORDED_WARNINGS: usize = 32;

/// Recorded when a drain timed out and the model was unloaded under load
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ForcedEvictionWarning {
    pub model_id: String,
    /// Requests still running at eviction time
    pub in_flight: usize,
    pub waited_s: f64,
    pub at: DateTime<Utc>,
}

/// Result of a policy evaluation
#[derive(Debug, Clone, PartialEq)]
pub enum Reevaluation {
    /// Active model is still the best choice, or the slot is empty
    Unchanged,
    /// A different model is preferred but the hysteresis delay has not passed
    Deferred { current: String, preferred: Option<String> },
    Swapped { from: String, to: String },
    /// Nothing fits any more and the model was unloaded
    Evicted { model_id: String },
}

/// Static lifecycle policy
#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    pub enabled: bool,
    pub auto_model_management: bool,
    pub drain_timeout: Duration,
    pub swap_delay: Duration,
    pub task_models: BTreeMap<TaskType, String>,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            auto_model_management: true,
            drain_timeout: Duration::from_secs(30),
            swap_delay: Duration::from_secs(10),
            task_models: BTreeMap::new(),
        }
    }
}

/// Resets the slot to `EMPTY` if an activation is abandoned midway
struct ActivationReset<'a> {
    slot: &'a RwLock<SlotState>,
    armed: bool,
}

impl Drop for ActivationReset<'_> {
    fn drop(&mut self) {
        if self.armed {
            *self.slot.write().unwrap_or_else(|e| e.into_inner()) = SlotState::Empty;
        }
    }
}

pub struct LifecycleManager {
    catalog: Arc<ModelCatalog>,
    downloads: Arc<DownloadManager>,
    backend: Arc<dyn InferenceBackend>,
    settings: LifecycleSettings,
    transition: tokio::sync::Mutex<()>,
    slot: RwLock<SlotState>,
    warnings: Mutex<VecDeque<ForcedEvictionWarning>>,
    pending: Mutex<Option<TaskType>>,
}

impl LifecycleManager {
    pub fn new(
        catalog: Arc<ModelCatalog>,
        downloads: Arc<DownloadManager>,
        backend: Arc<dyn InferenceBackend>,
        settings: LifecycleSettings,
    ) -> Self {
        Self {
            catalog,
            downloads,
            backend,
            settings,
            transition: tokio::sync::Mutex::new(()),
            slot: RwLock::new(SlotState::Empty),
            warnings: Mutex::new(VecDeque::new()),
            pending: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &LifecycleSettings {
        &self.settings
    }

    pub fn state(&self) -> SlotState {
        self.slot.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn set_state(&self, state: SlotState) {
        let mut slot = self.slot.write().unwrap_or_else(|e| e.into_inner());
        debug!("Slot: {} -> {}", slot.phase(), state.phase());
        *slot = state;
    }

    /// The active handle, only while the slot is `ACTIVE`
    pub fn active(&self) -> Option<Arc<ActiveModelHandle>> {
        match &*self.slot.read().unwrap_or_else(|e| e.into_inner()) {
            SlotState::Active(handle) => Some(handle.clone()),
            _ => None,
        }
    }

    pub fn active_descriptor(&self) -> Option<ModelDescriptor> {
        self.active().map(|h| h.descriptor().clone())
    }

    pub fn forced_evictions(&self) -> Vec<ForcedEvictionWarning> {
        self.warnings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    /// Task seen without a suitable model that could not be swapped in yet
    pub fn pending_specialization(&self) -> Option<TaskType> {
        *self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_pending(&self, task: Option<TaskType>) {
        *self.pending.lock().unwrap_or_else(|e| e.into_inner()) = task;
    }

    /// Model the policy would run for `task`: the configured default when it
    /// fits, otherwise the catalog's selection
    pub fn preferred_model(
        &self,
        snapshot: &HardwareSnapshot,
        task: TaskType,
    ) -> Result<ModelDescriptor, CatalogError> {
        if let Some(id) = self.settings.task_models.get(&task) {
            match self.catalog.get(id) {
                Some(model) if self.catalog.fits(&model, snapshot) => {
                    debug!("Using configured default {} for task {}", id, task);
                    return Ok(model);
                }
                Some(_) => debug!("Configured default {} for task {} does not fit", id, task),
                None => warn!("Configured default {} for task {} is not in the catalog", id, task),
            }
        }
        self.catalog.select(snapshot, task)
    }

    /// Runs `prompt` on the model held by `lease`
    pub async fn infer(
        &self,
        lease: &InFlightGuard,
        prompt: &str,
        params: &InferenceParams,
    ) -> Result<InferenceOutput, BackendError> {
        self.backend
            .infer(lease.handle().backend_handle(), prompt, params)
            .await
    }

    /// Fast path: a lease on the active model without consulting the policy
    ///
    /// Taken when the model is specialized for `task`, or when it is a
    /// general fallback the policy already kept for this task type.
    pub fn try_lease_for(&self, task: TaskType) -> Option<InFlightGuard> {
        let active = self.active()?;
        let descriptor = active.descriptor();
        let settled =
            descriptor.serves(task) || (descriptor.suits(task) && active.has_evaluated(task));
        if !settled {
            return None;
        }
        active.try_lease()
    }

    /// Makes `model_id` the active model
    ///
    /// Idempotent when `model_id` is already active. Otherwise the current
    /// model is drained and unloaded, the artifact is fetched if missing and
    /// the new model is loaded.
    pub async fn activate(
        &self,
        model_id: &str,
        snapshot: &HardwareSnapshot,
    ) -> Result<Arc<ActiveModelHandle>, LifecycleError> {
        if !self.settings.enabled {
            return Err(LifecycleError::LocalDisabled);
        }
        let _transition = self.transition.lock().await;
        self.activate_locked(model_id, snapshot, TaskType::General)
            .await
    }

    async fn activate_locked(
        &self,
        model_id: &str,
        snapshot: &HardwareSnapshot,
        task: TaskType,
    ) -> Result<Arc<ActiveModelHandle>, LifecycleError> {
        let current = self.active();
        if let Some(active) = current.as_ref().filter(|a| a.model_id() == model_id) {
            debug!("{} already active", model_id);
            return Ok(active.clone());
        }

        let descriptor = self.catalog.require(model_id)?;
        // Memory held by the outgoing model is released before the new load
        let effective = match &current {
            Some(active) => snapshot.with_credit(active.descriptor().memory_gb),
            None => snapshot.clone(),
        };
        if !self.catalog.fits(&descriptor, &effective) {
            return Err(LifecycleError::DoesNotFit {
                model_id: model_id.to_string(),
                required_gb: descriptor.memory_gb,
                usable_gb: effective.usable_memory_gb(self.catalog.safety_margin()),
            });
        }

        self.drain_and_unload().await;

        self.set_state(SlotState::Activating {
            model_id: model_id.to_string(),
        });
        let mut reset = ActivationReset {
            slot: &self.slot,
            armed: true,
        };
        info!("Activating {} for task {}", model_id, task);

        let descriptor = match self.downloads.ensure_local(model_id).await {
            Ok(descriptor) => descriptor,
            Err(e) => {
                self.fail_activation(model_id, &e.to_string());
                reset.armed = false;
                return Err(e.into());
            }
        };

        match self.backend.load(&descriptor).await {
            Ok(backend_handle) => {
                let handle = Arc::new(ActiveModelHandle::new(descriptor, backend_handle, task));
                self.set_state(SlotState::Active(handle.clone()));
                reset.armed = false;
                info!(
                    "Model {} active ({:.1}GB)",
                    handle.model_id(),
                    handle.descriptor().memory_gb
                );
                Ok(handle)
            }
            Err(source) => {
                self.fail_activation(model_id, &source.to_string());
                reset.armed = false;
                Err(LifecycleError::ModelLoad {
                    model_id: model_id.to_string(),
                    source,
                })
            }
        }
    }

    fn fail_activation(&self, model_id: &str, reason: &str) {
        warn!("Activation of {} failed: {}", model_id, reason);
        self.set_state(SlotState::Failed {
            model_id: model_id.to_string(),
        });
        self.set_state(SlotState::Empty);
    }

    /// Drains and unloads the active model; caller must hold the transition lock
    async fn drain_and_unload(&self) -> Option<String> {
        let handle = match self.state() {
            SlotState::Active(handle) | SlotState::Draining(handle) => handle,
            SlotState::Failed { .. } | SlotState::Activating { .. } => {
                self.set_state(SlotState::Empty);
                return None;
            }
            SlotState::Empty => return None,
        };

        handle.stop_admitting();
        self.set_state(SlotState::Draining(handle.clone()));
        let in_flight = handle.in_flight_requests();
        info!("Draining {} ({} in flight)", handle.model_id(), in_flight);

        if tokio::time::timeout(self.settings.drain_timeout, handle.wait_idle())
            .await
            .is_err()
        {
            let warning = ForcedEvictionWarning {
                model_id: handle.model_id().to_string(),
                in_flight: handle.in_flight_requests(),
                waited_s: self.settings.drain_timeout.as_secs_f64(),
                at: Utc::now(),
            };
            warn!(
                model = %warning.model_id,
                in_flight = warning.in_flight,
                "Drain timeout exceeded, forcing eviction"
            );
            let mut warnings = self.warnings.lock().unwrap_or_else(|e| e.into_inner());
            warnings.push_back(warning);
            while warnings.len() > MAX_RECORDED_WARNINGS {
                warnings.pop_front();
            }
        }

        if let Err(e) = self.backend.unload(handle.backend_handle().clone()).await {
            warn!("Unloading {} failed: {}", handle.model_id(), e);
        }
        self.set_state(SlotState::Empty);
        info!("Model {} unloaded", handle.model_id());
        Some(handle.model_id().to_string())
    }

    /// Drains and unloads the active model, returning its id
    pub async fn deactivate(&self) -> Option<String> {
        let _transition = self.transition.lock().await;
        self.drain_and_unload().await
    }

    /// Unloads the active model if it has been idle for at least `idle_after`
    pub async fn unload_if_idle(&self, idle_after: Duration) -> Option<String> {
        let _transition = self.transition.lock().await;
        let active = self.active()?;
        if active.idle_for()? < idle_after {
            return None;
        }
        info!(
            "Unloading {} after {:?} without traffic",
            active.model_id(),
            idle_after
        );
        self.drain_and_unload().await
    }

    /// Activates the preferred general-purpose model, if one fits
    pub async fn preload(
        &self,
        snapshot: &HardwareSnapshot,
    ) -> Result<Arc<ActiveModelHandle>, LifecycleError> {
        if !self.settings.enabled {
            return Err(LifecycleError::LocalDisabled);
        }
        let _transition = self.transition.lock().await;
        let target = self.preferred_model(snapshot, TaskType::General)?;
        self.activate_locked(&target.id, snapshot, TaskType::General)
            .await
    }

    /// Leases a model able to serve `task`, activating or swapping as needed
    ///
    /// When a better model exists for `task` but the hysteresis delay forbids
    /// a swap, the active model serves the request anyway and the task is
    /// remembered for the next policy evaluation.
    pub async fn acquire(
        &self,
        snapshot: &HardwareSnapshot,
        task: TaskType,
    ) -> Result<InFlightGuard, LifecycleError> {
        if !self.settings.enabled {
            return Err(LifecycleError::LocalDisabled);
        }
        if let Some(lease) = self.try_lease_for(task) {
            return Ok(lease);
        }

        let _transition = self.transition.lock().await;
        // Another request may have finished a transition while we waited
        if let Some(lease) = self.try_lease_for(task) {
            return Ok(lease);
        }

        let Some(active) = self.active() else {
            let target = self.preferred_model(snapshot, task)?;
            let handle = self.activate_locked(&target.id, snapshot, task).await?;
            return lease_new(&handle);
        };

        let credited = snapshot.with_credit(active.descriptor().memory_gb);
        let target = if self.settings.auto_model_management {
            self.preferred_model(&credited, task).ok()
        } else {
            None
        };
        let idle_enough = active
            .idle_for()
            .is_some_and(|idle| idle >= self.settings.swap_delay);

        match target {
            Some(target) if target.id != active.model_id() && idle_enough => {
                info!(
                    "Swapping {} -> {} for task {}",
                    active.model_id(),
                    target.id,
                    task
                );
                let handle = self.activate_locked(&target.id, snapshot, task).await?;
                self.set_pending(None);
                lease_new(&handle)
            }
            Some(target) if target.id != active.model_id() => {
                debug!(
                    "{} serves task {} until {} can be swapped in",
                    active.model_id(),
                    task,
                    target.id
                );
                self.set_pending(Some(task));
                active.mark_evaluated(task);
                lease_new(&active)
            }
            _ => {
                active.mark_evaluated(task);
                lease_new(&active)
            }
        }
    }

    /// Re-validates the active model against a fresh snapshot
    ///
    /// The target is chosen for the pending specialization if any, otherwise
    /// for the task the active model was activated for. Swaps and evictions
    /// observe the same hysteresis delay as request-driven swaps.
    pub async fn reevaluate(
        &self,
        snapshot: &HardwareSnapshot,
    ) -> Result<Reevaluation, LifecycleError> {
        if !self.settings.enabled || !self.settings.auto_model_management {
            return Ok(Reevaluation::Unchanged);
        }
        let _transition = self.transition.lock().await;
        let Some(active) = self.active() else {
            return Ok(Reevaluation::Unchanged);
        };

        let credited = snapshot.with_credit(active.descriptor().memory_gb);
        let pending = self.pending_specialization();
        let task = pending.unwrap_or(active.activated_for());
        let still_fits = self.catalog.fits(active.descriptor(), &credited);
        let idle_enough = active
            .idle_for()
            .is_some_and(|idle| idle >= self.settings.swap_delay);

        match self.preferred_model(&credited, task) {
            Ok(target) if target.id == active.model_id() => {
                if pending.is_some() {
                    self.set_pending(None);
                }
                Ok(Reevaluation::Unchanged)
            }
            Ok(target) if idle_enough => {
                let from = active.model_id().to_string();
                info!("Re-evaluation swaps {} -> {} (task {})", from, target.id, task);
                self.activate_locked(&target.id, snapshot, task).await?;
                self.set_pending(None);
                Ok(Reevaluation::Swapped {
                    from,
                    to: target.id,
                })
            }
            Ok(target) => Ok(Reevaluation::Deferred {
                current: active.model_id().to_string(),
                preferred: Some(target.id),
            }),
            Err(_) if still_fits => Ok(Reevaluation::Unchanged),
            Err(_) if idle_enough => {
                warn!(
                    "{} no longer fits available memory, unloading",
                    active.model_id()
                );
                let model_id = active.model_id().to_string();
                self.drain_and_unload().await;
                Ok(Reevaluation::Evicted { model_id })
            }
            Err(_) => Ok(Reevaluation::Deferred {
                current: active.model_id().to_string(),
                preferred: None,
            }),
        }
    }
}

/// Leases `handle`; the caller holds the transition lock, so it still admits
fn lease_new(handle: &Arc<ActiveModelHandle>) -> Result<InFlightGuard, LifecycleError> {
    handle.try_lease().ok_or_else(|| LifecycleError::ModelLoad {
        model_id: handle.model_id().to_string(),
        source: BackendError::other("model stopped admitting"),
    })
}

impl std::fmt::Debug for LifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleManager")
            .field("state", &self.state().phase())
            .field("model", &self.state().model_id().map(str::to_string))
            .field("settings", &self.settings)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MockBackend, MockTransport};
    use crate::catalog::DownloadState;

    struct Fixture {
        catalog: Arc<ModelCatalog>,
        backend: Arc<MockBackend>,
        transport: Arc<MockTransport>,
        lifecycle: Arc<LifecycleManager>,
    }

    fn fixture(settings: LifecycleSettings) -> Fixture {
        let catalog = Arc::new(
            ModelCatalog::new(
                vec![
                    ModelDescriptor::new("A", 4.0).with_tags(["general"]).ready(),
                    ModelDescriptor::new("B", 8.0).with_tags(["general"]).ready(),
                    ModelDescriptor::new("coder", 3.0).with_tags(["coding"]),
                ],
                0.85,
            )
            .unwrap(),
        );
        let backend = Arc::new(MockBackend::new());
        let transport = Arc::new(MockTransport::new());
        let downloads = Arc::new(DownloadManager::new(catalog.clone(), transport.clone()));
        let lifecycle = Arc::new(LifecycleManager::new(
            catalog.clone(),
            downloads,
            backend.clone(),
            settings,
        ));
        Fixture {
            catalog,
            backend,
            transport,
            lifecycle,
        }
    }

    fn no_delay() -> LifecycleSettings {
        LifecycleSettings {
            swap_delay: Duration::ZERO,
            ..LifecycleSettings::default()
        }
    }

    fn snapshot(available_gb: f64) -> HardwareSnapshot {
        HardwareSnapshot::new(32.0, available_gb, Some("GTX 1650".into()), Some(4.0))
    }

    #[tokio::test]
    async fn test_activate_is_idempotent() {
        let f = fixture(no_delay());
        let first = f.lifecycle.activate("A", &snapshot(6.0)).await.unwrap();
        let second = f.lifecycle.activate("A", &snapshot(6.0)).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(f.backend.load_count(), 1);
        assert_eq!(f.transport.fetch_count(), 0);
    }

    #[tokio::test]
    async fn test_activate_downloads_missing_model() {
        let f = fixture(no_delay());
        let handle = f.lifecycle.activate("coder", &snapshot(6.0)).await.unwrap();

        assert_eq!(handle.model_id(), "coder");
        assert_eq!(f.transport.fetch_count(), 1);
        assert_eq!(
            f.catalog.get("coder").unwrap().download_state,
            DownloadState::Ready
        );
    }

    #[tokio::test]
    async fn test_load_failure_returns_slot_to_empty() {
        let f = fixture(no_delay());
        f.backend.fail_loads_of("A");

        let err = f.lifecycle.activate("A", &snapshot(6.0)).await.unwrap_err();
        assert!(matches!(err, LifecycleError::ModelLoad { .. }));
        assert_eq!(f.lifecycle.state().phase(), SlotPhase::Empty);

        // Retryable by a later call
        f.backend.allow_loads_of("A");
        assert!(f.lifecycle.activate("A", &snapshot(6.0)).await.is_ok());
    }

    #[tokio::test]
    async fn test_model_that_does_not_fit_is_refused() {
        let f = fixture(no_delay());
        let err = f.lifecycle.activate("B", &snapshot(6.0)).await.unwrap_err();
        assert!(matches!(err, LifecycleError::DoesNotFit { .. }));
        assert_eq!(f.backend.load_count(), 0);
    }

    #[tokio::test]
    async fn test_swap_unloads_previous_model() {
        let f = fixture(no_delay());
        f.lifecycle.activate("A", &snapshot(6.0)).await.unwrap();
        f.lifecycle.activate("B", &snapshot(12.0)).await.unwrap();

        assert_eq!(f.backend.loaded_models(), vec!["B"]);
        assert_eq!(f.backend.unload_count(), 1);
        assert!(f.lifecycle.forced_evictions().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_waits_for_in_flight_requests() {
        let f = fixture(LifecycleSettings {
            drain_timeout: Duration::from_secs(30),
            ..no_delay()
        });
        let active = f.lifecycle.activate("A", &snapshot(12.0)).await.unwrap();
        let lease = active.try_lease().unwrap();

        let swap = {
            let lifecycle = f.lifecycle.clone();
            tokio::spawn(async move { lifecycle.activate("B", &snapshot(12.0)).await })
        };
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(f.lifecycle.state().phase(), SlotPhase::Draining);
        assert!(active.try_lease().is_none());
        assert_eq!(f.backend.unload_count(), 0);

        drop(lease);
        let handle = swap.await.unwrap().unwrap();
        assert_eq!(handle.model_id(), "B");
        assert!(f.lifecycle.forced_evictions().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_timeout_forces_eviction() {
        let f = fixture(LifecycleSettings {
            drain_timeout: Duration::from_secs(30),
            ..no_delay()
        });
        let active = f.lifecycle.activate("A", &snapshot(12.0)).await.unwrap();
        let _stuck = active.try_lease().unwrap();

        let handle = f.lifecycle.activate("B", &snapshot(12.0)).await.unwrap();
        assert_eq!(handle.model_id(), "B");

        let warnings = f.lifecycle.forced_evictions();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].model_id, "A");
        assert_eq!(warnings[0].in_flight, 1);
    }

    #[tokio::test]
    async fn test_acquire_activates_preferred_model() {
        let f = fixture(no_delay());
        let lease = f
            .lifecycle
            .acquire(&snapshot(6.0), TaskType::Coding)
            .await
            .unwrap();
        assert_eq!(lease.handle().model_id(), "coder");
        assert_eq!(lease.handle().in_flight_requests(), 1);
        drop(lease);
        assert_eq!(f.lifecycle.active().unwrap().in_flight_requests(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hysteresis_serves_with_active_model() {
        let f = fixture(LifecycleSettings {
            swap_delay: Duration::from_secs(10),
            ..LifecycleSettings::default()
        });
        f.lifecycle.activate("A", &snapshot(6.0)).await.unwrap();

        // Too soon after activation: served by A, coding remembered
        let lease = f
            .lifecycle
            .acquire(&snapshot(6.0), TaskType::Coding)
            .await
            .unwrap();
        assert_eq!(lease.handle().model_id(), "A");
        assert_eq!(f.lifecycle.pending_specialization(), Some(TaskType::Coding));
        drop(lease);

        tokio::time::advance(Duration::from_secs(11)).await;
        let outcome = f.lifecycle.reevaluate(&snapshot(6.0)).await.unwrap();
        assert_eq!(
            outcome,
            Reevaluation::Swapped {
                from: "A".to_string(),
                to: "coder".to_string()
            }
        );
        assert_eq!(f.lifecycle.pending_specialization(), None);
    }

    #[tokio::test]
    async fn test_reevaluate_swaps_on_hardware_growth() {
        let f = fixture(no_delay());
        f.lifecycle.activate("A", &snapshot(6.0)).await.unwrap();

        // Credited: 8 + 4 = 12GB * 0.85 = 10.2GB usable, B (8GB) now fits
        let outcome = f.lifecycle.reevaluate(&snapshot(8.0)).await.unwrap();
        assert_eq!(
            outcome,
            Reevaluation::Swapped {
                from: "A".to_string(),
                to: "B".to_string()
            }
        );
        assert_eq!(f.lifecycle.active().unwrap().model_id(), "B");
        assert!(f.lifecycle.forced_evictions().is_empty());
    }

    #[tokio::test]
    async fn test_reevaluate_evicts_when_nothing_fits() {
        let f = fixture(no_delay());
        f.lifecycle.activate("A", &snapshot(6.0)).await.unwrap();

        // Credit capped at 2GB total: 1.7GB usable, nothing fits
        let outcome = f
            .lifecycle
            .reevaluate(&HardwareSnapshot::new(2.0, 0.0, None, None))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            Reevaluation::Evicted {
                model_id: "A".to_string()
            }
        );
        assert!(f.lifecycle.active().is_none());
        assert_eq!(f.backend.unload_count(), 1);
    }

    #[tokio::test]
    async fn test_reevaluate_keeps_fitting_model() {
        let f = fixture(no_delay());
        f.lifecycle.activate("A", &snapshot(6.0)).await.unwrap();

        let outcome = f.lifecycle.reevaluate(&snapshot(1.0)).await.unwrap();
        assert_eq!(outcome, Reevaluation::Unchanged);
        assert_eq!(f.lifecycle.active().unwrap().model_id(), "A");
    }

    #[tokio::test]
    async fn test_general_model_serves_unmatched_task_without_swap() {
        let f = fixture(no_delay());
        f.lifecycle.activate("A", &snapshot(6.0)).await.unwrap();

        let lease = f
            .lifecycle
            .acquire(&snapshot(2.0), TaskType::Creative)
            .await
            .unwrap();
        assert_eq!(lease.handle().model_id(), "A");
        assert_eq!(f.lifecycle.pending_specialization(), None);
    }

    #[tokio::test]
    async fn test_evaluated_task_takes_fast_path_until_swap() {
        let f = fixture(no_delay());
        f.lifecycle.activate("A", &snapshot(6.0)).await.unwrap();
        assert!(f.lifecycle.try_lease_for(TaskType::Creative).is_none());

        drop(
            f.lifecycle
                .acquire(&snapshot(2.0), TaskType::Creative)
                .await
                .unwrap(),
        );
        let lease = f.lifecycle.try_lease_for(TaskType::Creative).unwrap();
        assert_eq!(lease.handle().model_id(), "A");
        assert!(lease.handle().has_evaluated(TaskType::Creative));
        // Only tagged or evaluated tasks skip the policy
        assert!(f.lifecycle.try_lease_for(TaskType::Analysis).is_none());
        drop(lease);

        let swapped = f.lifecycle.activate("B", &snapshot(12.0)).await.unwrap();
        assert!(!swapped.has_evaluated(TaskType::Creative));
        assert!(f.lifecycle.try_lease_for(TaskType::Creative).is_none());
    }

    #[tokio::test]
    async fn test_unload_if_idle() {
        let f = fixture(no_delay());
        f.lifecycle.activate("A", &snapshot(6.0)).await.unwrap();

        assert_eq!(
            f.lifecycle.unload_if_idle(Duration::from_secs(3600)).await,
            None
        );
        assert_eq!(
            f.lifecycle.unload_if_idle(Duration::ZERO).await,
            Some("A".to_string())
        );
        assert_eq!(f.lifecycle.state().phase(), SlotPhase::Empty);
    }

    #[tokio::test]
    async fn test_disabled_local_inference() {
        let f = fixture(LifecycleSettings {
            enabled: false,
            ..LifecycleSettings::default()
        });
        let err = f
            .lifecycle
            .acquire(&snapshot(6.0), TaskType::General)
            .await
            .unwrap_err();
        assert_eq!(err, LifecycleError::LocalDisabled);
    }

    #[tokio::test]
    async fn test_configured_task_default_preferred() {
        let mut task_models = BTreeMap::new();
        task_models.insert(TaskType::General, "A".to_string());
        let f = fixture(LifecycleSettings {
            task_models,
            ..no_delay()
        });

        // B fits and is larger, but A is the configured default
        let target = f
            .lifecycle
            .preferred_model(&snapshot(12.0), TaskType::General)
            .unwrap();
        assert_eq!(target.id, "A");
    }
}
