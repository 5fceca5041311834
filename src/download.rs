//! Download manager: makes catalog models available locally
//!
//! Every download runs as its own task so a caller giving up (deadline,
//! dropped future) never aborts a half-finished transfer. Concurrent
//! [`DownloadManager::ensure_local`] calls for the same model share one task
//! and await its outcome through a `watch` channel. Progress is published on
//! a `broadcast` channel that any number of observers may subscribe to.

use crate::backend::ModelTransport;
use crate::catalog::{DownloadState, ModelCatalog, ModelDescriptor};
use crate::error::DownloadError;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{broadcast, watch};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Download lifecycle notifications
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DownloadEvent {
    Started {
        model_id: String,
    },
    Progress {
        model_id: String,
        bytes_done: u64,
        bytes_total: Option<u64>,
    },
    Completed {
        model_id: String,
    },
    Failed {
        model_id: String,
        error: String,
    },
}

impl DownloadEvent {
    pub fn model_id(&self) -> &str {
        match self {
            DownloadEvent::Started { model_id }
            | DownloadEvent::Progress { model_id, .. }
            | DownloadEvent::Completed { model_id }
            | DownloadEvent::Failed { model_id, .. } => model_id,
        }
    }
}

/// Handed to a [`ModelTransport`] to publish progress for one model
#[derive(Debug, Clone)]
pub struct ProgressSink {
    model_id: String,
    events: broadcast::Sender<DownloadEvent>,
}

impl ProgressSink {
    pub fn new(model_id: impl Into<String>, events: broadcast::Sender<DownloadEvent>) -> Self {
        Self {
            model_id: model_id.into(),
            events,
        }
    }

    /// Sink nobody listens to
    pub fn detached(model_id: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(1);
        Self::new(model_id, events)
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn report(&self, bytes_done: u64, bytes_total: Option<u64>) {
        // No subscribers is not an error
        let _ = self.events.send(DownloadEvent::Progress {
            model_id: self.model_id.clone(),
            bytes_done,
            bytes_total,
        });
    }
}

type Outcome = Option<Result<ModelDescriptor, DownloadError>>;

struct InFlight {
    generation: u64,
    outcome: watch::Receiver<Outcome>,
    abort: AbortHandle,
}

type InFlightMap = Arc<Mutex<HashMap<String, InFlight>>>;

/// Coordinates artifact downloads and the catalog's download state
pub struct DownloadManager {
    catalog: Arc<ModelCatalog>,
    transport: Arc<dyn ModelTransport>,
    inflight: InFlightMap,
    events: broadcast::Sender<DownloadEvent>,
    generation: AtomicU64,
}

impl DownloadManager {
    pub fn new(catalog: Arc<ModelCatalog>, transport: Arc<dyn ModelTransport>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            catalog,
            transport,
            inflight: Arc::new(Mutex::new(HashMap::new())),
            events,
            generation: AtomicU64::new(0),
        }
    }

    /// Receives every download event emitted after this call
    pub fn subscribe(&self) -> broadcast::Receiver<DownloadEvent> {
        self.events.subscribe()
    }

    pub fn is_downloading(&self, model_id: &str) -> bool {
        lock(&self.inflight).contains_key(model_id)
    }

    /// Ids of the models currently being downloaded
    pub fn in_progress(&self) -> Vec<String> {
        let mut ids: Vec<String> = lock(&self.inflight).keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Returns the model once its artifact is present, downloading it if needed
    ///
    /// A `READY` model returns immediately. Failed downloads are not retried
    /// here; calling again after a failure starts a fresh attempt.
    pub async fn ensure_local(&self, model_id: &str) -> Result<ModelDescriptor, DownloadError> {
        let mut outcome = {
            let mut inflight = lock(&self.inflight);
            match inflight.get(model_id) {
                Some(existing) => {
                    debug!("Joining in-flight download of {}", model_id);
                    existing.outcome.clone()
                }
                None => {
                    let descriptor = self.catalog.require(model_id)?;
                    if descriptor.is_ready() {
                        return Ok(descriptor);
                    }
                    self.catalog
                        .mark_download_state(model_id, DownloadState::Downloading)?;

                    let generation = self.generation.fetch_add(1, Ordering::Relaxed);
                    let (tx, rx) = watch::channel(None);
                    let task = tokio::spawn(run_download(
                        DownloadTask {
                            catalog: self.catalog.clone(),
                            transport: self.transport.clone(),
                            inflight: self.inflight.clone(),
                            events: self.events.clone(),
                            generation,
                        },
                        descriptor,
                        tx,
                    ));
                    inflight.insert(
                        model_id.to_string(),
                        InFlight {
                            generation,
                            outcome: rx.clone(),
                            abort: task.abort_handle(),
                        },
                    );
                    rx
                }
            }
        };

        let resolved = match outcome.wait_for(Option::is_some).await {
            Ok(result) => (*result).clone(),
            // Sender dropped without an outcome: the task was aborted
            Err(_) => None,
        };
        resolved.unwrap_or_else(|| Err(DownloadError::Cancelled(model_id.to_string())))
    }

    /// Aborts an in-flight download and marks the model `FAILED`
    ///
    /// Returns `false` when nothing was downloading.
    pub fn cancel(&self, model_id: &str) -> bool {
        let Some(entry) = lock(&self.inflight).remove(model_id) else {
            return false;
        };
        entry.abort.abort();

        if let Err(e) = self
            .catalog
            .mark_download_state(model_id, DownloadState::Failed)
        {
            debug!("Cancelled download of {} had already settled: {}", model_id, e);
        }
        let _ = self.events.send(DownloadEvent::Failed {
            model_id: model_id.to_string(),
            error: "cancelled".to_string(),
        });
        warn!("Download of {} cancelled", model_id);
        true
    }
}

impl Drop for DownloadManager {
    fn drop(&mut self) {
        for (_, entry) in lock(&self.inflight).drain() {
            entry.abort.abort();
        }
    }
}

impl std::fmt::Debug for DownloadManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadManager")
            .field("in_progress", &self.in_progress())
            .finish()
    }
}

struct DownloadTask {
    catalog: Arc<ModelCatalog>,
    transport: Arc<dyn ModelTransport>,
    inflight: InFlightMap,
    events: broadcast::Sender<DownloadEvent>,
    generation: u64,
}

async fn run_download(
    task: DownloadTask,
    descriptor: ModelDescriptor,
    outcome: watch::Sender<Outcome>,
) {
    let model_id = descriptor.id.clone();
    let sink = ProgressSink::new(model_id.clone(), task.events.clone());
    let _ = task.events.send(DownloadEvent::Started {
        model_id: model_id.clone(),
    });
    info!(
        "Downloading {} ({:.1}GB)",
        descriptor.display_name, descriptor.memory_gb
    );

    let result = match task.transport.fetch(&descriptor, &sink).await {
        Ok(()) => task
            .catalog
            .mark_download_state(&model_id, DownloadState::Ready)
            .map_err(DownloadError::from),
        Err(source) => {
            if let Err(e) = task
                .catalog
                .mark_download_state(&model_id, DownloadState::Failed)
            {
                warn!("Could not record failed download of {}: {}", model_id, e);
            }
            Err(DownloadError::Transport {
                model_id: model_id.clone(),
                source,
            })
        }
    };

    match &result {
        Ok(_) => {
            info!("Model {} downloaded", model_id);
            let _ = task.events.send(DownloadEvent::Completed {
                model_id: model_id.clone(),
            });
        }
        Err(e) => {
            warn!("Download of {} failed: {}", model_id, e);
            let _ = task.events.send(DownloadEvent::Failed {
                model_id: model_id.clone(),
                error: e.to_string(),
            });
        }
    }

    {
        let mut inflight = lock(&task.inflight);
        if inflight
            .get(&model_id)
            .is_some_and(|entry| entry.generation == task.generation)
        {
            inflight.remove(&model_id);
        }
    }
    let _ = outcome.send(Some(result));
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockTransport;
    use crate::error::BackendError;
    use std::time::Duration;

    fn catalog() -> Arc<ModelCatalog> {
        Arc::new(
            ModelCatalog::new(
                vec![
                    ModelDescriptor::new("tiny", 1.0),
                    ModelDescriptor::new("local", 2.0).ready(),
                ],
                0.85,
            )
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_ready_model_returns_immediately() {
        let transport = Arc::new(MockTransport::new());
        let manager = DownloadManager::new(catalog(), transport.clone());

        let descriptor = manager.ensure_local("local").await.unwrap();
        assert!(descriptor.is_ready());
        assert_eq!(transport.fetch_count(), 0);
    }

    #[tokio::test]
    async fn test_download_marks_ready() {
        let catalog = catalog();
        let transport = Arc::new(MockTransport::new());
        let manager = DownloadManager::new(catalog.clone(), transport.clone());

        let descriptor = manager.ensure_local("tiny").await.unwrap();
        assert!(descriptor.available_locally);
        assert_eq!(
            catalog.get("tiny").unwrap().download_state,
            DownloadState::Ready
        );
        assert!(!manager.is_downloading("tiny"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_calls_collapse() {
        let transport = Arc::new(MockTransport::new().with_delay(Duration::from_millis(100)));
        let manager = Arc::new(DownloadManager::new(catalog(), transport.clone()));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let manager = manager.clone();
            handles.push(tokio::spawn(
                async move { manager.ensure_local("tiny").await },
            ));
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }

        assert_eq!(transport.fetch_count(), 1);
    }

    #[tokio::test]
    async fn test_failure_marks_failed_and_allows_retry() {
        let catalog = catalog();
        let transport = Arc::new(MockTransport::new());
        transport.fail_next(BackendError::NetworkError {
            message: "connection reset".to_string(),
        });
        let manager = DownloadManager::new(catalog.clone(), transport.clone());

        let err = manager.ensure_local("tiny").await.unwrap_err();
        assert!(matches!(err, DownloadError::Transport { .. }));
        assert_eq!(
            catalog.get("tiny").unwrap().download_state,
            DownloadState::Failed
        );

        // Caller-driven retry
        assert!(manager.ensure_local("tiny").await.is_ok());
        assert_eq!(transport.fetch_count(), 2);
    }

    #[tokio::test]
    async fn test_unknown_model() {
        let manager = DownloadManager::new(catalog(), Arc::new(MockTransport::new()));
        let err = manager.ensure_local("ghost").await.unwrap_err();
        assert!(matches!(err, DownloadError::Catalog(_)));
    }

    #[tokio::test]
    async fn test_events_are_published() {
        let transport = Arc::new(MockTransport::new());
        let manager = DownloadManager::new(catalog(), transport);
        let mut events = manager.subscribe();

        manager.ensure_local("tiny").await.unwrap();

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            assert_eq!(event.model_id(), "tiny");
            seen.push(event);
        }
        assert!(matches!(seen.first(), Some(DownloadEvent::Started { .. })));
        assert!(seen
            .iter()
            .any(|e| matches!(e, DownloadEvent::Progress { .. })));
        assert!(matches!(seen.last(), Some(DownloadEvent::Completed { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_resolves_waiters() {
        let catalog = catalog();
        let transport = Arc::new(MockTransport::new().with_delay(Duration::from_secs(60)));
        let manager = Arc::new(DownloadManager::new(catalog.clone(), transport));

        let waiter = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.ensure_local("tiny").await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(manager.is_downloading("tiny"));

        assert!(manager.cancel("tiny"));
        let err = waiter.await.unwrap().unwrap_err();
        assert_eq!(err, DownloadError::Cancelled("tiny".to_string()));
        assert_eq!(
            catalog.get("tiny").unwrap().download_state,
            DownloadState::Failed
        );
        assert!(!manager.cancel("tiny"));
    }
}
