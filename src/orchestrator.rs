//! Orchestrator facade
//!
//! Wires the profiler, catalog, download manager, lifecycle manager,
//! monitor and router together from an [`OrchestratorConfig`], runs the
//! periodic maintenance loop and exposes the external commands.

use crate::api::{
    DownloadCommand, DownloadResponse, InferenceCommand, InferenceResponse, ModelListing,
    PerformanceReport, StatusReport,
};
use crate::backend::{
    CloudClient, HttpCloudClient, InferenceBackend, ModelTransport, OllamaBackend,
};
use crate::catalog::{ModelCatalog, ModelDescriptor, TaskType};
use crate::config::OrchestratorConfig;
use crate::download::{DownloadEvent, DownloadManager};
use crate::error::{CatalogError, LifecycleError, OrchestratorError, RouterError};
use crate::hardware::{HardwareProbe, HardwareProfiler, HardwareSnapshot, SystemProbe};
use crate::lifecycle::{ActiveModelHandle, LifecycleManager, LifecycleSettings, Reevaluation};
use crate::monitor::PerformanceMonitor;
use crate::router::{InferenceRequest, InferenceResult, InferenceRouter, RouterSettings};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

impl From<&OrchestratorConfig> for LifecycleSettings {
    fn from(config: &OrchestratorConfig) -> Self {
        Self {
            enabled: config.local_ai.enabled,
            auto_model_management: config.local_ai.auto_model_management,
            drain_timeout: config.local_ai.drain_timeout(),
            swap_delay: config.local_ai.swap_delay(),
            task_models: config.task_models.clone(),
        }
    }
}

impl From<&OrchestratorConfig> for RouterSettings {
    fn from(config: &OrchestratorConfig) -> Self {
        Self {
            max_concurrent_requests: config.local_ai.max_concurrent_requests,
            default_timeout: config.local_ai.request_timeout(),
            prefer_local: config.local_ai.prefer_local,
            fallback_to_cloud: config.local_ai.fallback_to_cloud,
            cloud_timeout: config
                .cloud
                .as_ref()
                .map(|c| c.timeout())
                .unwrap_or(Duration::from_secs(60)),
            params: config.inference.clone(),
        }
    }
}

/// Work done on every maintenance tick
///
/// Holds its own component handles so the spawned loop does not keep the
/// orchestrator alive.
struct Maintenance {
    profiler: Arc<HardwareProfiler>,
    catalog: Arc<ModelCatalog>,
    backend: Arc<dyn InferenceBackend>,
    lifecycle: Arc<LifecycleManager>,
    idle_unload: Option<Duration>,
}

impl Maintenance {
    async fn sync_inventory(&self) {
        match self.backend.installed_models().await {
            Ok(installed) => {
                debug!("Backend reports {} installed models", installed.len());
                self.catalog.sync_inventory(&installed);
            }
            Err(e) => warn!("Could not list installed models: {}", e),
        }
    }

    async fn tick(&self) -> Reevaluation {
        let snapshot = self.profiler.refresh_async().await;
        self.sync_inventory().await;

        let outcome = match self.lifecycle.reevaluate(&snapshot).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("Policy re-evaluation failed: {}", e);
                Reevaluation::Unchanged
            }
        };
        match &outcome {
            Reevaluation::Unchanged => {}
            Reevaluation::Deferred { current, preferred } => debug!(
                "Keeping {} for now (preferred: {:?})",
                current, preferred
            ),
            Reevaluation::Swapped { from, to } => info!("Re-evaluation swapped {} -> {}", from, to),
            Reevaluation::Evicted { model_id } => {
                warn!("Re-evaluation evicted {}: nothing fits", model_id)
            }
        }

        if let Some(idle_after) = self.idle_unload {
            self.lifecycle.unload_if_idle(idle_after).await;
        }
        outcome
    }
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    profiler: Arc<HardwareProfiler>,
    catalog: Arc<ModelCatalog>,
    downloads: Arc<DownloadManager>,
    lifecycle: Arc<LifecycleManager>,
    monitor: Arc<PerformanceMonitor>,
    router: InferenceRouter,
    maintenance: Arc<Maintenance>,
    shutdown: watch::Sender<bool>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Orchestrator {
    /// Assembles the orchestrator from injected capabilities
    pub fn new(
        config: OrchestratorConfig,
        probe: Box<dyn HardwareProbe>,
        backend: Arc<dyn InferenceBackend>,
        transport: Arc<dyn ModelTransport>,
        cloud: Option<Arc<dyn CloudClient>>,
    ) -> Result<Self, OrchestratorError> {
        config.validate()?;

        let profiler = Arc::new(HardwareProfiler::new(
            probe,
            config.local_ai.conservative_memory_gb,
        ));
        let catalog = Arc::new(ModelCatalog::new(
            config.models.clone(),
            config.local_ai.safety_margin,
        )?);
        let downloads = Arc::new(DownloadManager::new(catalog.clone(), transport));
        let lifecycle = Arc::new(LifecycleManager::new(
            catalog.clone(),
            downloads.clone(),
            backend.clone(),
            LifecycleSettings::from(&config),
        ));
        let monitor = Arc::new(PerformanceMonitor::new(
            config.local_ai.performance_window,
            config.local_ai.performance_max_age(),
        ));
        let router = InferenceRouter::new(
            lifecycle.clone(),
            profiler.clone(),
            monitor.clone(),
            cloud,
            RouterSettings::from(&config),
        );
        let maintenance = Arc::new(Maintenance {
            profiler: profiler.clone(),
            catalog: catalog.clone(),
            backend,
            lifecycle: lifecycle.clone(),
            idle_unload: config.local_ai.idle_unload(),
        });
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            config,
            profiler,
            catalog,
            downloads,
            lifecycle,
            monitor,
            router,
            maintenance,
            shutdown,
            loop_handle: Mutex::new(None),
        })
    }

    /// Production wiring: system probe, Ollama backend and the configured
    /// cloud endpoint
    pub fn from_config(config: OrchestratorConfig) -> Result<Self, OrchestratorError> {
        let ollama = Arc::new(OllamaBackend::new(&config.backend)?);
        let cloud = match &config.cloud {
            Some(cloud_config) => {
                Some(Arc::new(HttpCloudClient::new(cloud_config)?) as Arc<dyn CloudClient>)
            }
            None => None,
        };
        Self::new(
            config,
            Box::new(SystemProbe),
            ollama.clone(),
            ollama,
            cloud,
        )
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn catalog(&self) -> &Arc<ModelCatalog> {
        &self.catalog
    }

    pub fn lifecycle(&self) -> &Arc<LifecycleManager> {
        &self.lifecycle
    }

    pub fn monitor(&self) -> &Arc<PerformanceMonitor> {
        &self.monitor
    }

    pub fn router(&self) -> &InferenceRouter {
        &self.router
    }

    /// Probes hardware, syncs the installed inventory, optionally preloads a
    /// model and starts the maintenance loop
    pub async fn start(&self) {
        let snapshot = self.profiler.refresh_async().await;
        info!(
            "Hardware: {:.1}GB total, {:.1}GB available, tier {}",
            snapshot.memory_total_gb, snapshot.memory_available_gb, snapshot.tier
        );
        self.maintenance.sync_inventory().await;

        if self.config.local_ai.enabled && self.config.local_ai.preload_on_start {
            match self.lifecycle.preload(&snapshot).await {
                Ok(handle) => info!("Preloaded {}", handle.model_id()),
                Err(e) => warn!("Preload failed, starting with an empty slot: {}", e),
            }
        }

        self.spawn_maintenance_loop();
    }

    fn spawn_maintenance_loop(&self) {
        let mut handle_slot = self.loop_handle.lock().unwrap_or_else(|e| e.into_inner());
        if handle_slot.is_some() {
            debug!("Maintenance loop already running");
            return;
        }

        let maintenance = self.maintenance.clone();
        let period = self.config.local_ai.probe_interval();
        let mut shutdown = self.shutdown.subscribe();

        *handle_slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately and start() already probed
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        maintenance.tick().await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            debug!("Maintenance loop stopping");
                            break;
                        }
                    }
                }
            }
        }));
    }

    /// Runs one maintenance pass immediately
    pub async fn run_maintenance(&self) -> Reevaluation {
        self.maintenance.tick().await
    }

    /// Stops the maintenance loop, cancels downloads and unloads the model
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let handle = self
            .loop_handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Maintenance loop ended abnormally: {}", e);
            }
        }

        for model_id in self.downloads.in_progress() {
            self.downloads.cancel(&model_id);
        }
        if let Some(model_id) = self.lifecycle.deactivate().await {
            info!("Unloaded {} on shutdown", model_id);
        }
    }

    /// Reconciles catalog availability with the backend's installed models
    pub async fn sync_inventory(&self) {
        self.maintenance.sync_inventory().await;
    }

    /// Re-probes hardware now instead of waiting for the next tick
    pub async fn refresh_hardware(&self) -> Arc<HardwareSnapshot> {
        self.profiler.refresh_async().await
    }

    pub fn hardware(&self) -> Arc<HardwareSnapshot> {
        self.profiler.latest()
    }

    pub fn status(&self) -> StatusReport {
        let hardware = self.profiler.latest();
        let state = self.lifecycle.state();
        let active = self.lifecycle.active();
        let by_model = self.monitor.summaries();

        StatusReport {
            hardware: hardware.as_ref().clone(),
            active_model: active.as_ref().map(|h| h.descriptor().clone()),
            slot: state.phase(),
            in_flight_requests: self.router.in_flight(),
            pending_specialization: self.lifecycle.pending_specialization(),
            performance: PerformanceReport {
                overall: self.monitor.overall(),
                active_model: active
                    .as_ref()
                    .map(|h| self.monitor.snapshot(h.model_id())),
                by_model,
            },
            catalog: self.catalog.stats(),
            downloads_in_progress: self.downloads.in_progress(),
            forced_evictions: self.lifecycle.forced_evictions(),
            local_enabled: self.config.local_ai.enabled,
            cloud_configured: self.router.has_cloud(),
        }
    }

    /// Catalog in listing order with fit and activity flags
    pub fn list_models(&self) -> Vec<ModelListing> {
        let snapshot = self.profiler.latest();
        let active_id = self.lifecycle.active().map(|h| h.model_id().to_string());
        self.catalog
            .list(&snapshot)
            .into_iter()
            .map(|model| {
                let recommended = self.catalog.fits(&model, &snapshot);
                let active = active_id.as_deref() == Some(model.id.as_str());
                ModelListing::new(model, recommended, active)
            })
            .collect()
    }

    pub async fn download(&self, command: DownloadCommand) -> DownloadResponse {
        match self.downloads.ensure_local(&command.model_name).await {
            Ok(model) => {
                info!("Model {} is available locally", model.id);
                DownloadResponse::ok()
            }
            Err(e) => {
                warn!("Download of {} failed: {}", command.model_name, e);
                DownloadResponse::failed(e)
            }
        }
    }

    pub fn cancel_download(&self, model_id: &str) -> bool {
        self.downloads.cancel(model_id)
    }

    pub fn subscribe_downloads(&self) -> broadcast::Receiver<DownloadEvent> {
        self.downloads.subscribe()
    }

    pub async fn submit(&self, request: InferenceRequest) -> Result<InferenceResult, RouterError> {
        self.router.submit(request).await
    }

    /// Parses the task type, applies the optional deadline and submits
    pub async fn infer(&self, command: InferenceCommand) -> InferenceResponse {
        let deadline = command.deadline();
        let task_type: TaskType = command.task_type.into();
        let mut request = InferenceRequest::new(command.input, task_type);
        if let Some(deadline) = deadline {
            request = request.with_deadline(deadline);
        }
        InferenceResponse::from(self.submit(request).await)
    }

    /// Makes `model_id` active against the latest snapshot
    pub async fn activate(&self, model_id: &str) -> Result<Arc<ActiveModelHandle>, LifecycleError> {
        let snapshot = self.profiler.latest();
        self.lifecycle.activate(model_id, &snapshot).await
    }

    pub fn register_model(&self, descriptor: ModelDescriptor) -> Result<(), CatalogError> {
        self.catalog.register(descriptor)
    }

    /// Removes a model from the catalog; the active model cannot be removed
    pub fn unregister_model(&self, model_id: &str) -> Result<ModelDescriptor, CatalogError> {
        if self.lifecycle.state().model_id() == Some(model_id) {
            return Err(CatalogError::ModelInUse(model_id.to_string()));
        }
        self.catalog.unregister(model_id)
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("slot", &self.lifecycle.state().phase())
            .field("catalog_size", &self.catalog.len())
            .field("cloud", &self.router.has_cloud())
            .finish()
    }
}
