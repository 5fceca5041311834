//! HTTP cloud client used as inference fallback

use super::{CloudClient, InferenceOutput};
use crate::catalog::TaskType;
use crate::config::{CloudConfig, CloudFormat, InferenceParams};
use crate::error::BackendError;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    completion_tokens: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct OllamaCompletion {
    #[serde(default)]
    response: Option<String>,
    #[serde(default)]
    eval_count: Option<u64>,
}

/// Remote completion endpoint speaking either the OpenAI-compatible chat API
/// or the Ollama generate API
#[derive(Debug, Clone)]
pub struct HttpCloudClient {
    client: reqwest::Client,
    base_url: String,
    model: String,
    format: CloudFormat,
    api_key: Option<String>,
    timeout: Duration,
}

impl HttpCloudClient {
    /// Builds the client, reading the API key from the configured variable
    pub fn new(config: &CloudConfig) -> Result<Self, BackendError> {
        let api_key = match &config.api_key_env {
            Some(var) => Some(std::env::var(var).map_err(|_| {
                BackendError::ConfigurationError {
                    message: format!("API key variable {} is not set", var),
                }
            })?),
            None => None,
        };

        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| BackendError::ConfigurationError {
                message: format!("failed to build HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            format: config.format,
            api_key,
            timeout: config.timeout(),
        })
    }

    fn request_body(&self, prompt: &str, params: &InferenceParams) -> (&'static str, Value) {
        match self.format {
            CloudFormat::OpenaiCompatible => (
                "/v1/chat/completions",
                json!({
                    "model": self.model,
                    "messages": [{ "role": "user", "content": prompt }],
                    "temperature": params.temperature,
                    "top_p": params.top_p,
                    "stream": false,
                }),
            ),
            CloudFormat::Ollama => (
                "/api/generate",
                json!({
                    "model": self.model,
                    "prompt": prompt,
                    "stream": false,
                    "options": {
                        "temperature": params.temperature,
                        "top_p": params.top_p,
                        "repeat_penalty": params.repeat_penalty,
                        "num_ctx": params.context_length,
                    },
                }),
            ),
        }
    }

    fn parse_response(&self, raw: &str) -> Result<InferenceOutput, BackendError> {
        let invalid = |message: String| BackendError::InvalidResponse {
            message,
            raw_response: Some(raw.to_string()),
        };

        let (text, tokens) = match self.format {
            CloudFormat::OpenaiCompatible => {
                let completion: ChatCompletion =
                    serde_json::from_str(raw).map_err(|e| invalid(e.to_string()))?;
                let text = completion
                    .choices
                    .into_iter()
                    .next()
                    .and_then(|c| c.message.content)
                    .ok_or_else(|| invalid("response has no message content".to_string()))?;
                let tokens = completion.usage.and_then(|u| u.completion_tokens);
                (text, tokens)
            }
            CloudFormat::Ollama => {
                let completion: OllamaCompletion =
                    serde_json::from_str(raw).map_err(|e| invalid(e.to_string()))?;
                let text = completion
                    .response
                    .ok_or_else(|| invalid("response field missing".to_string()))?;
                (text, completion.eval_count)
            }
        };

        let tokens = tokens.unwrap_or_else(|| text.split_whitespace().count() as u64);
        Ok(InferenceOutput::new(text, tokens))
    }
}

#[async_trait]
impl CloudClient for HttpCloudClient {
    async fn complete(
        &self,
        prompt: &str,
        task: TaskType,
        params: &InferenceParams,
    ) -> Result<InferenceOutput, BackendError> {
        let (path, body) = self.request_body(prompt, params);
        debug!(model = %self.model, task = %task, "Sending cloud completion request");

        let mut request = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                BackendError::TimeoutError {
                    seconds: self.timeout.as_secs(),
                }
            } else {
                e.into()
            }
        })?;

        let status = response.status();
        let raw = response.text().await?;
        if !status.is_success() {
            return Err(BackendError::ApiError {
                message: raw,
                status_code: Some(status.as_u16()),
            });
        }
        self.parse_response(&raw)
    }

    fn name(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn config(format: CloudFormat) -> CloudConfig {
        CloudConfig {
            base_url: "https://api.example.com/".to_string(),
            model: "remote-large".to_string(),
            format,
            api_key_env: None,
            timeout_secs: 5,
        }
    }

    #[test]
    fn test_openai_request_and_response() {
        let client = HttpCloudClient::new(&config(CloudFormat::OpenaiCompatible)).unwrap();
        let (path, body) = client.request_body("hello", &InferenceParams::default());
        assert_eq!(path, "/v1/chat/completions");
        assert_eq!(body["messages"][0]["content"], "hello");
        assert_eq!(body["model"], "remote-large");

        let output = client
            .parse_response(
                r#"{"choices":[{"message":{"role":"assistant","content":"hi there"}}],"usage":{"completion_tokens":7}}"#,
            )
            .unwrap();
        assert_eq!(output.text, "hi there");
        assert_eq!(output.tokens_generated, 7);
    }

    #[test]
    fn test_ollama_request_and_response() {
        let client = HttpCloudClient::new(&config(CloudFormat::Ollama)).unwrap();
        let (path, body) = client.request_body("hello", &InferenceParams::default());
        assert_eq!(path, "/api/generate");
        assert_eq!(body["prompt"], "hello");
        assert_eq!(body["stream"], false);

        let output = client
            .parse_response(r#"{"response":"one two three"}"#)
            .unwrap();
        assert_eq!(output.tokens_generated, 3);
    }

    #[test]
    fn test_malformed_response() {
        let client = HttpCloudClient::new(&config(CloudFormat::OpenaiCompatible)).unwrap();
        let err = client.parse_response(r#"{"choices":[]}"#).unwrap_err();
        assert!(matches!(err, BackendError::InvalidResponse { .. }));
    }

    #[test]
    #[serial]
    fn test_missing_api_key_is_configuration_error() {
        std::env::remove_var("LOCALMIND_TEST_MISSING_KEY");
        let mut cfg = config(CloudFormat::OpenaiCompatible);
        cfg.api_key_env = Some("LOCALMIND_TEST_MISSING_KEY".to_string());

        let err = HttpCloudClient::new(&cfg).unwrap_err();
        assert!(matches!(err, BackendError::ConfigurationError { .. }));
    }
}
