//! In-memory doubles for the backend capabilities
//!
//! Used by unit and integration tests to drive the orchestrator without an
//! Ollama server: every call is counted, delays are configurable and failures
//! can be queued.

use super::{BackendHandle, CloudClient, InferenceBackend, InferenceOutput, ModelTransport};
use crate::catalog::{ModelDescriptor, TaskType};
use crate::config::InferenceParams;
use crate::download::ProgressSink;
use crate::error::BackendError;
use async_trait::async_trait;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

fn token_count(text: &str) -> u64 {
    text.split_whitespace().count().max(1) as u64
}

/// Local backend double
pub struct MockBackend {
    name: String,
    infer_delay: Mutex<Duration>,
    load_delay: Mutex<Duration>,
    failing_loads: Mutex<HashSet<String>>,
    infer_failures: Mutex<VecDeque<BackendError>>,
    loaded: Mutex<Vec<BackendHandle>>,
    installed: Mutex<Vec<String>>,
    loads: AtomicUsize,
    unloads: AtomicUsize,
    inferences: AtomicUsize,
    next_token: AtomicUsize,
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            name: "MockBackend".to_string(),
            infer_delay: Mutex::new(Duration::ZERO),
            load_delay: Mutex::new(Duration::ZERO),
            failing_loads: Mutex::new(HashSet::new()),
            infer_failures: Mutex::new(VecDeque::new()),
            loaded: Mutex::new(Vec::new()),
            installed: Mutex::new(Vec::new()),
            loads: AtomicUsize::new(0),
            unloads: AtomicUsize::new(0),
            inferences: AtomicUsize::new(0),
            next_token: AtomicUsize::new(1),
        }
    }

    pub fn with_infer_delay(self, delay: Duration) -> Self {
        self.set_infer_delay(delay);
        self
    }

    pub fn with_load_delay(self, delay: Duration) -> Self {
        *self.load_delay.lock().unwrap() = delay;
        self
    }

    pub fn set_infer_delay(&self, delay: Duration) {
        *self.infer_delay.lock().unwrap() = delay;
    }

    /// Every later `load` of `model_id` fails
    pub fn fail_loads_of(&self, model_id: impl Into<String>) {
        self.failing_loads.lock().unwrap().insert(model_id.into());
    }

    pub fn allow_loads_of(&self, model_id: &str) {
        self.failing_loads.lock().unwrap().remove(model_id);
    }

    /// The next `infer` call fails with `error`
    pub fn fail_next_inference(&self, error: BackendError) {
        self.infer_failures.lock().unwrap().push_back(error);
    }

    /// Ids reported by `installed_models`
    pub fn set_installed<I, S>(&self, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        *self.installed.lock().unwrap() = ids.into_iter().map(Into::into).collect();
    }

    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn unload_count(&self) -> usize {
        self.unloads.load(Ordering::SeqCst)
    }

    pub fn inference_count(&self) -> usize {
        self.inferences.load(Ordering::SeqCst)
    }

    /// Model ids currently loaded
    pub fn loaded_models(&self) -> Vec<String> {
        self.loaded
            .lock()
            .unwrap()
            .iter()
            .map(|h| h.model_id().to_string())
            .collect()
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MockBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockBackend")
            .field("name", &self.name)
            .field("loaded", &self.loaded_models())
            .field("loads", &self.load_count())
            .field("unloads", &self.unload_count())
            .finish()
    }
}

#[async_trait]
impl InferenceBackend for MockBackend {
    async fn load(&self, model: &ModelDescriptor) -> Result<BackendHandle, BackendError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        let delay = *self.load_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if self.failing_loads.lock().unwrap().contains(&model.id) {
            return Err(BackendError::ApiError {
                message: format!("model '{}' failed to load", model.id),
                status_code: Some(500),
            });
        }

        let token = self.next_token.fetch_add(1, Ordering::SeqCst);
        let handle = BackendHandle::new(&model.id, format!("mock-{}", token));
        self.loaded.lock().unwrap().push(handle.clone());
        Ok(handle)
    }

    async fn infer(
        &self,
        handle: &BackendHandle,
        prompt: &str,
        _params: &InferenceParams,
    ) -> Result<InferenceOutput, BackendError> {
        self.inferences.fetch_add(1, Ordering::SeqCst);
        let delay = *self.infer_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if let Some(error) = self.infer_failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        if !self.loaded.lock().unwrap().contains(handle) {
            return Err(BackendError::InvalidResponse {
                message: format!("handle {} is not loaded", handle.token()),
                raw_response: None,
            });
        }

        let text = format!("[{}] {}", handle.model_id(), prompt);
        let tokens = token_count(&text);
        Ok(InferenceOutput::new(text, tokens))
    }

    async fn unload(&self, handle: BackendHandle) -> Result<(), BackendError> {
        self.unloads.fetch_add(1, Ordering::SeqCst);
        self.loaded.lock().unwrap().retain(|h| h != &handle);
        Ok(())
    }

    async fn installed_models(&self) -> Result<Vec<String>, BackendError> {
        Ok(self.installed.lock().unwrap().clone())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Transport double reporting two progress steps per fetch
pub struct MockTransport {
    delay: Duration,
    failures: Mutex<VecDeque<BackendError>>,
    fetches: AtomicUsize,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            delay: Duration::ZERO,
            failures: Mutex::new(VecDeque::new()),
            fetches: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// The next fetch fails with `error`
    pub fn fail_next(&self, error: BackendError) {
        self.failures.lock().unwrap().push_back(error);
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ModelTransport for MockTransport {
    async fn fetch(
        &self,
        model: &ModelDescriptor,
        progress: &ProgressSink,
    ) -> Result<(), BackendError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let total = (model.memory_gb * 1024.0 * 1024.0 * 1024.0) as u64;

        progress.report(0, Some(total));
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(error) = self.failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        progress.report(total, Some(total));
        Ok(())
    }
}

/// Cloud client double
pub struct MockCloud {
    name: String,
    delay: Duration,
    failure: Mutex<Option<BackendError>>,
    calls: AtomicUsize,
}

impl MockCloud {
    pub fn new() -> Self {
        Self {
            name: "mock-cloud".to_string(),
            delay: Duration::ZERO,
            failure: Mutex::new(None),
            calls: AtomicUsize::new(0),
        }
    }

    /// Cloud whose every call fails with `error`
    pub fn failing(error: BackendError) -> Self {
        let cloud = Self::new();
        *cloud.failure.lock().unwrap() = Some(error);
        cloud
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Default for MockCloud {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CloudClient for MockCloud {
    async fn complete(
        &self,
        prompt: &str,
        task: TaskType,
        _params: &InferenceParams,
    ) -> Result<InferenceOutput, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(error) = self.failure.lock().unwrap().clone() {
            return Err(error);
        }
        let text = format!("[cloud:{}] {}", task, prompt);
        let tokens = token_count(&text);
        Ok(InferenceOutput::new(text, tokens))
    }

    fn name(&self) -> &str {
        &self.name
    }
}
