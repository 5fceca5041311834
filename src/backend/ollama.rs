//! Ollama HTTP backend
//!
//! Loading a model means asking the server to keep it resident
//! (`keep_alive = -1`), unloading sends `keep_alive = 0`. Any generate call
//! loads its model, so inference is refused on handles that were unloaded.
//! Artifacts are fetched with `/api/pull`, whose streamed status lines feed
//! the progress sink.

use super::{BackendHandle, InferenceBackend, InferenceOutput, ModelTransport};
use crate::catalog::ModelDescriptor;
use crate::config::{BackendConfig, InferenceParams};
use crate::download::ProgressSink;
use crate::error::BackendError;
use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

const AVAILABILITY_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Serialize)]
struct GenerateOptions {
    num_batch: u32,
    num_ctx: u32,
    temperature: f32,
    top_p: f32,
    repeat_penalty: f32,
}

impl From<&InferenceParams> for GenerateOptions {
    fn from(params: &InferenceParams) -> Self {
        Self {
            num_batch: params.batch_size,
            num_ctx: params.context_length,
            temperature: params.temperature,
            top_p: params.top_p,
            repeat_penalty: params.repeat_penalty,
        }
    }
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
    #[serde(default)]
    eval_count: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagEntry>,
}

#[derive(Debug, Deserialize)]
struct TagEntry {
    name: String,
}

#[derive(Debug, Deserialize)]
struct PullStatus {
    #[serde(default)]
    status: String,
    #[serde(default)]
    total: Option<u64>,
    #[serde(default)]
    completed: Option<u64>,
    #[serde(default)]
    error: Option<String>,
}

/// Client for a local Ollama server
#[derive(Debug, Clone)]
pub struct OllamaBackend {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
    /// Tokens of handles loaded and not yet unloaded
    live: Arc<Mutex<HashSet<String>>>,
}

impl OllamaBackend {
    pub fn new(config: &BackendConfig) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| BackendError::ConfigurationError {
                message: format!("failed to build HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            base_url: config.base_url(),
            timeout: config.timeout(),
            live: Arc::new(Mutex::new(HashSet::new())),
        })
    }

    fn live(&self) -> MutexGuard<'_, HashSet<String>> {
        self.live.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Whether the server answers its tag listing
    pub async fn is_available(&self) -> bool {
        match self
            .client
            .get(self.url("/api/tags"))
            .timeout(AVAILABILITY_TIMEOUT)
            .send()
            .await
        {
            Ok(resp) => {
                let available = resp.status().is_success();
                debug!("Ollama availability check: {}", available);
                available
            }
            Err(e) => {
                debug!("Ollama not available: {}", e);
                false
            }
        }
    }

    async fn generate(&self, body: serde_json::Value) -> Result<GenerateResponse, BackendError> {
        let response = self
            .client
            .post(self.url("/api/generate"))
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.map_request_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(BackendError::ApiError {
                message,
                status_code: Some(status.as_u16()),
            });
        }

        let raw = response.text().await?;
        serde_json::from_str(&raw).map_err(|e| BackendError::InvalidResponse {
            message: e.to_string(),
            raw_response: Some(raw),
        })
    }

    fn map_request_error(&self, err: reqwest::Error) -> BackendError {
        if err.is_timeout() {
            BackendError::TimeoutError {
                seconds: self.timeout.as_secs(),
            }
        } else {
            err.into()
        }
    }
}

#[async_trait]
impl InferenceBackend for OllamaBackend {
    async fn load(&self, model: &ModelDescriptor) -> Result<BackendHandle, BackendError> {
        info!("Loading {} into Ollama", model.id);
        self.generate(json!({
            "model": model.id,
            "prompt": "",
            "stream": false,
            "keep_alive": -1,
        }))
        .await?;
        let handle = BackendHandle::new(&model.id, Uuid::new_v4().to_string());
        self.live().insert(handle.token().to_string());
        Ok(handle)
    }

    async fn infer(
        &self,
        handle: &BackendHandle,
        prompt: &str,
        params: &InferenceParams,
    ) -> Result<InferenceOutput, BackendError> {
        if !self.live().contains(handle.token()) {
            warn!("Refusing inference on unloaded {}", handle.model_id());
            return Err(BackendError::other(format!(
                "model {} is no longer loaded",
                handle.model_id()
            )));
        }
        let response = self
            .generate(json!({
                "model": handle.model_id(),
                "prompt": prompt,
                "stream": false,
                "keep_alive": -1,
                "options": GenerateOptions::from(params),
            }))
            .await?;

        let tokens = response
            .eval_count
            .unwrap_or_else(|| response.response.split_whitespace().count() as u64);
        Ok(InferenceOutput::new(response.response, tokens))
    }

    async fn unload(&self, handle: BackendHandle) -> Result<(), BackendError> {
        info!("Unloading {} from Ollama", handle.model_id());
        self.live().remove(handle.token());
        self.generate(json!({
            "model": handle.model_id(),
            "keep_alive": 0,
        }))
        .await?;
        Ok(())
    }

    async fn installed_models(&self) -> Result<Vec<String>, BackendError> {
        let response = self
            .client
            .get(self.url("/api/tags"))
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| self.map_request_error(e))?
            .error_for_status()?;
        let tags: TagsResponse = response.json().await?;
        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }

    fn name(&self) -> &str {
        "ollama"
    }
}

#[async_trait]
impl ModelTransport for OllamaBackend {
    async fn fetch(
        &self,
        model: &ModelDescriptor,
        progress: &ProgressSink,
    ) -> Result<(), BackendError> {
        // No overall timeout: pulls of large models legitimately take long
        let response = self
            .client
            .post(self.url("/api/pull"))
            .json(&json!({ "model": model.id, "stream": true }))
            .send()
            .await?
            .error_for_status()?;

        let mut stream = response.bytes_stream();
        let mut buffer: Vec<u8> = Vec::new();
        while let Some(chunk) = stream.next().await {
            buffer.extend_from_slice(&chunk?);
            while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=pos).collect();
                handle_pull_line(&line, progress)?;
            }
        }
        if !buffer.is_empty() {
            handle_pull_line(&buffer, progress)?;
        }
        Ok(())
    }
}

fn handle_pull_line(line: &[u8], progress: &ProgressSink) -> Result<(), BackendError> {
    let line = String::from_utf8_lossy(line);
    let line = line.trim();
    if line.is_empty() {
        return Ok(());
    }

    let status: PullStatus =
        serde_json::from_str(line).map_err(|e| BackendError::InvalidResponse {
            message: format!("unparsable pull status: {}", e),
            raw_response: Some(line.to_string()),
        })?;

    if let Some(message) = status.error {
        return Err(BackendError::ApiError {
            message,
            status_code: None,
        });
    }
    if let Some(completed) = status.completed {
        progress.report(completed, status.total);
    } else {
        debug!("pull {}: {}", progress.model_id(), status.status);
    }
    Ok(())
}
