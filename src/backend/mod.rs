//! Opaque capabilities the orchestrator drives
//!
//! The core never looks inside these: a local [`InferenceBackend`] loads,
//! runs and unloads models, a [`ModelTransport`] fetches missing artifacts
//! and a [`CloudClient`] answers when local inference is not possible.

pub mod cloud;
pub mod mock;
pub mod ollama;

pub use cloud::HttpCloudClient;
pub use mock::{MockBackend, MockCloud, MockTransport};
pub use ollama::OllamaBackend;

use crate::catalog::{ModelDescriptor, TaskType};
use crate::config::InferenceParams;
use crate::download::ProgressSink;
use crate::error::BackendError;
use async_trait::async_trait;

/// Token returned by [`InferenceBackend::load`], required for every later call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendHandle {
    model_id: String,
    token: String,
}

impl BackendHandle {
    pub fn new(model_id: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            token: token.into(),
        }
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

/// Text produced by a backend together with the number of generated tokens
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceOutput {
    pub text: String,
    pub tokens_generated: u64,
}

impl InferenceOutput {
    pub fn new(text: impl Into<String>, tokens_generated: u64) -> Self {
        Self {
            text: text.into(),
            tokens_generated,
        }
    }
}

/// Local inference engine
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    async fn load(&self, model: &ModelDescriptor) -> Result<BackendHandle, BackendError>;

    async fn infer(
        &self,
        handle: &BackendHandle,
        prompt: &str,
        params: &InferenceParams,
    ) -> Result<InferenceOutput, BackendError>;

    async fn unload(&self, handle: BackendHandle) -> Result<(), BackendError>;

    /// Ids of the models whose artifacts are present locally
    async fn installed_models(&self) -> Result<Vec<String>, BackendError> {
        Ok(Vec::new())
    }

    fn name(&self) -> &str;
}

/// Fetches a model artifact, reporting progress through `progress`
#[async_trait]
pub trait ModelTransport: Send + Sync {
    async fn fetch(
        &self,
        model: &ModelDescriptor,
        progress: &ProgressSink,
    ) -> Result<(), BackendError>;
}

/// Remote completion service used as fallback
#[async_trait]
pub trait CloudClient: Send + Sync {
    async fn complete(
        &self,
        prompt: &str,
        task: TaskType,
        params: &InferenceParams,
    ) -> Result<InferenceOutput, BackendError>;

    /// Provider label reported as the origin of cloud answers
    fn name(&self) -> &str;
}
