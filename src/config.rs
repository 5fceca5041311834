//! Configuration management for localmind
//!
//! Settings come from built-in defaults, an optional TOML file and
//! `LOCALMIND_*` environment variables, applied in that order.
//!
//! # Environment Variables
//!
//! ## Local AI
//! - `LOCALMIND_LOCAL_AI_ENABLED`: Enable local inference (true|false) - default: "true"
//! - `LOCALMIND_AUTO_MODEL_MANAGEMENT`: Let the orchestrator pick and swap models - default: "true"
//! - `LOCALMIND_PRELOAD_ON_START`: Activate a model at startup - default: "false"
//! - `LOCALMIND_PREFER_LOCAL`: Try local before cloud - default: "true"
//! - `LOCALMIND_FALLBACK_TO_CLOUD`: Use the cloud client when local fails - default: "true"
//! - `LOCALMIND_MAX_CONCURRENT_REQUESTS`: Admission ceiling - default: "3"
//! - `LOCALMIND_SAFETY_MARGIN`: Fraction of available memory a model may use - default: "0.85"
//! - `LOCALMIND_DRAIN_TIMEOUT`: Seconds to wait for in-flight requests before forced eviction - default: "30"
//! - `LOCALMIND_SWAP_DELAY`: Seconds a model must be idle before a policy swap - default: "10"
//! - `LOCALMIND_IDLE_UNLOAD`: Seconds without traffic before unloading (0 disables) - default: "600"
//! - `LOCALMIND_PROBE_INTERVAL`: Seconds between hardware re-probes - default: "60"
//! - `LOCALMIND_REQUEST_TIMEOUT`: Default request deadline in seconds - default: "120"
//!
//! ## Local backend (Ollama)
//! - `LOCALMIND_OLLAMA_HOST`: Host - default: "127.0.0.1"
//! - `LOCALMIND_OLLAMA_PORT`: Port - default: "11434"
//! - `LOCALMIND_OLLAMA_TIMEOUT`: Timeout in seconds - default: "300"
//!
//! ## Cloud fallback
//! - `LOCALMIND_CLOUD_URL`: Base URL; setting it enables the cloud client
//! - `LOCALMIND_CLOUD_MODEL`: Remote model name
//! - `LOCALMIND_CLOUD_FORMAT`: `openai-compatible` | `ollama` - default: "openai-compatible"
//! - `LOCALMIND_CLOUD_API_KEY_ENV`: Name of the variable holding the API key
//!
//! ## Inference tuning
//! - `LOCALMIND_TEMPERATURE`, `LOCALMIND_TOP_P`, `LOCALMIND_REPEAT_PENALTY`,
//!   `LOCALMIND_CONTEXT_LENGTH`, `LOCALMIND_BATCH_SIZE`
//!
//! - `LOCALMIND_LOG_LEVEL`: Logging level - default: "info"

use crate::catalog::{ModelDescriptor, ModelCatalog, TaskType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_OLLAMA_HOST: &str = "127.0.0.1";
const DEFAULT_OLLAMA_PORT: u16 = 11434;
/// Upper bound for any request deadline, configured or caller-supplied
pub const MAX_REQUEST_TIMEOUT_SECS: u64 = 3600;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Configuration validation failed
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    /// Failed to parse configuration value
    #[error("Failed to parse {field}: {error}")]
    ParseError { field: String, error: String },

    /// Failed to read the configuration file
    #[error("Failed to read config file {path}: {error}")]
    ReadError { path: String, error: String },
}

/// Local inference policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalAiConfig {
    pub enabled: bool,
    pub auto_model_management: bool,
    pub preload_on_start: bool,
    pub prefer_local: bool,
    pub fallback_to_cloud: bool,
    pub max_concurrent_requests: usize,
    pub safety_margin: f64,
    pub drain_timeout_secs: u64,
    pub swap_delay_secs: u64,
    pub idle_unload_secs: u64,
    pub probe_interval_secs: u64,
    pub request_timeout_secs: u64,
    pub performance_window: usize,
    pub performance_max_age_secs: u64,
    /// Memory assumed when the hardware probe fails
    pub conservative_memory_gb: f64,
}

impl Default for LocalAiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            auto_model_management: true,
            preload_on_start: false,
            prefer_local: true,
            fallback_to_cloud: true,
            max_concurrent_requests: 3,
            safety_margin: 0.85,
            drain_timeout_secs: 30,
            swap_delay_secs: 10,
            idle_unload_secs: 600,
            probe_interval_secs: 60,
            request_timeout_secs: 120,
            performance_window: 100,
            performance_max_age_secs: 3600,
            conservative_memory_gb: 4.0,
        }
    }
}

impl LocalAiConfig {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    pub fn swap_delay(&self) -> Duration {
        Duration::from_secs(self.swap_delay_secs)
    }

    /// `None` when idle unloading is disabled
    pub fn idle_unload(&self) -> Option<Duration> {
        (self.idle_unload_secs > 0).then(|| Duration::from_secs(self.idle_unload_secs))
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn performance_max_age(&self) -> Duration {
        Duration::from_secs(self.performance_max_age_secs)
    }
}

/// Connection parameters of the local backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub host: String,
    pub port: u16,
    pub timeout_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_OLLAMA_HOST.to_string(),
            port: DEFAULT_OLLAMA_PORT,
            timeout_secs: 300,
        }
    }
}

impl BackendConfig {
    pub fn base_url(&self) -> String {
        if self.host.starts_with("http://") || self.host.starts_with("https://") {
            format!("{}:{}", self.host.trim_end_matches('/'), self.port)
        } else {
            format!("http://{}:{}", self.host, self.port)
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Wire format spoken by the cloud endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CloudFormat {
    #[default]
    OpenaiCompatible,
    Ollama,
}

impl FromStr for CloudFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "openai-compatible" | "openai" => Ok(CloudFormat::OpenaiCompatible),
            "ollama" => Ok(CloudFormat::Ollama),
            other => Err(format!(
                "unknown cloud format '{}'. Valid options: openai-compatible, ollama",
                other
            )),
        }
    }
}

/// Remote model used as fallback
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudConfig {
    pub base_url: String,
    pub model: String,
    #[serde(default)]
    pub format: CloudFormat,
    /// Environment variable holding the API key
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_cloud_timeout")]
    pub timeout_secs: u64,
}

fn default_cloud_timeout() -> u64 {
    60
}

impl CloudConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Generation parameters passed through to the backends untouched
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceParams {
    pub batch_size: u32,
    pub context_length: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub repeat_penalty: f32,
}

impl Default for InferenceParams {
    fn default() -> Self {
        Self {
            batch_size: 512,
            context_length: 4096,
            temperature: 0.7,
            top_p: 0.9,
            repeat_penalty: 1.1,
        }
    }
}

/// Main configuration structure for localmind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub local_ai: LocalAiConfig,
    pub backend: BackendConfig,
    pub cloud: Option<CloudConfig>,
    pub inference: InferenceParams,
    /// Preferred model id per task type
    pub task_models: BTreeMap<TaskType, String>,
    pub models: Vec<ModelDescriptor>,
    pub log_level: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            local_ai: LocalAiConfig::default(),
            backend: BackendConfig::default(),
            cloud: None,
            inference: InferenceParams::default(),
            task_models: BTreeMap::new(),
            models: ModelCatalog::default_models(),
            log_level: DEFAULT_LOG_LEVEL.to_string(),
        }
    }
}

impl OrchestratorConfig {
    /// Defaults with environment overrides applied
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Loads a TOML file, then applies environment overrides
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.display().to_string(),
            error: e.to_string(),
        })?;
        let mut config = Self::from_toml(&content)?;
        config.apply_env()?;
        Ok(config)
    }

    /// Parses a TOML document without looking at the environment
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::ParseError {
            field: "config file".to_string(),
            error: e.to_string(),
        })
    }

    /// Overrides fields from `LOCALMIND_*` variables
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        let local = &mut self.local_ai;
        override_from_env(&mut local.enabled, "LOCALMIND_LOCAL_AI_ENABLED")?;
        override_from_env(
            &mut local.auto_model_management,
            "LOCALMIND_AUTO_MODEL_MANAGEMENT",
        )?;
        override_from_env(&mut local.preload_on_start, "LOCALMIND_PRELOAD_ON_START")?;
        override_from_env(&mut local.prefer_local, "LOCALMIND_PREFER_LOCAL")?;
        override_from_env(&mut local.fallback_to_cloud, "LOCALMIND_FALLBACK_TO_CLOUD")?;
        override_from_env(
            &mut local.max_concurrent_requests,
            "LOCALMIND_MAX_CONCURRENT_REQUESTS",
        )?;
        override_from_env(&mut local.safety_margin, "LOCALMIND_SAFETY_MARGIN")?;
        override_from_env(&mut local.drain_timeout_secs, "LOCALMIND_DRAIN_TIMEOUT")?;
        override_from_env(&mut local.swap_delay_secs, "LOCALMIND_SWAP_DELAY")?;
        override_from_env(&mut local.idle_unload_secs, "LOCALMIND_IDLE_UNLOAD")?;
        override_from_env(&mut local.probe_interval_secs, "LOCALMIND_PROBE_INTERVAL")?;
        override_from_env(&mut local.request_timeout_secs, "LOCALMIND_REQUEST_TIMEOUT")?;

        override_from_env(&mut self.backend.host, "LOCALMIND_OLLAMA_HOST")?;
        override_from_env(&mut self.backend.port, "LOCALMIND_OLLAMA_PORT")?;
        override_from_env(&mut self.backend.timeout_secs, "LOCALMIND_OLLAMA_TIMEOUT")?;

        let inference = &mut self.inference;
        override_from_env(&mut inference.temperature, "LOCALMIND_TEMPERATURE")?;
        override_from_env(&mut inference.top_p, "LOCALMIND_TOP_P")?;
        override_from_env(&mut inference.repeat_penalty, "LOCALMIND_REPEAT_PENALTY")?;
        override_from_env(&mut inference.context_length, "LOCALMIND_CONTEXT_LENGTH")?;
        override_from_env(&mut inference.batch_size, "LOCALMIND_BATCH_SIZE")?;

        if let Ok(base_url) = env::var("LOCALMIND_CLOUD_URL") {
            let cloud = self.cloud.get_or_insert_with(|| CloudConfig {
                base_url: String::new(),
                model: String::new(),
                format: CloudFormat::default(),
                api_key_env: None,
                timeout_secs: default_cloud_timeout(),
            });
            cloud.base_url = base_url;
        }
        if let Some(cloud) = self.cloud.as_mut() {
            override_from_env(&mut cloud.model, "LOCALMIND_CLOUD_MODEL")?;
            if let Ok(format) = env::var("LOCALMIND_CLOUD_FORMAT") {
                cloud.format = format.parse().map_err(|error| ConfigError::ParseError {
                    field: "LOCALMIND_CLOUD_FORMAT".to_string(),
                    error,
                })?;
            }
            if let Ok(var) = env::var("LOCALMIND_CLOUD_API_KEY_ENV") {
                cloud.api_key_env = Some(var);
            }
        }

        if let Ok(level) = env::var("LOCALMIND_LOG_LEVEL") {
            self.log_level = level.to_lowercase();
        }

        Ok(())
    }

    /// Validates the configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` describing the first problem found
    pub fn validate(&self) -> Result<(), ConfigError> {
        let local = &self.local_ai;
        if local.max_concurrent_requests == 0 {
            return Err(invalid("max_concurrent_requests must be at least 1"));
        }
        if !(local.safety_margin > 0.0 && local.safety_margin <= 1.0) {
            return Err(invalid(format!(
                "safety_margin must be in (0, 1], got {}",
                local.safety_margin
            )));
        }
        if local.request_timeout_secs == 0 || local.request_timeout_secs > MAX_REQUEST_TIMEOUT_SECS
        {
            return Err(invalid(format!(
                "request_timeout_secs must be between 1 and {}",
                MAX_REQUEST_TIMEOUT_SECS
            )));
        }
        if local.drain_timeout_secs == 0 {
            return Err(invalid("drain_timeout_secs must be at least 1"));
        }
        if local.probe_interval_secs == 0 {
            return Err(invalid("probe_interval_secs must be at least 1"));
        }
        if local.performance_window == 0 {
            return Err(invalid("performance_window must be at least 1"));
        }
        if !(local.conservative_memory_gb >= 0.0) {
            return Err(invalid("conservative_memory_gb must not be negative"));
        }

        if self.backend.host.trim().is_empty() {
            return Err(invalid("backend host must not be empty"));
        }

        if let Some(cloud) = &self.cloud {
            if cloud.base_url.trim().is_empty() {
                return Err(invalid("cloud base_url must not be empty"));
            }
            if cloud.timeout_secs == 0 {
                return Err(invalid("cloud timeout_secs must be at least 1"));
            }
        }

        let inference = &self.inference;
        if !(0.0..=2.0).contains(&inference.temperature) {
            return Err(invalid("temperature must be between 0.0 and 2.0"));
        }
        if !(0.0..=1.0).contains(&inference.top_p) {
            return Err(invalid("top_p must be between 0.0 and 1.0"));
        }
        if inference.context_length == 0 || inference.batch_size == 0 {
            return Err(invalid("context_length and batch_size must be positive"));
        }

        for (task, model_id) in &self.task_models {
            if !self.models.iter().any(|m| &m.id == model_id) {
                return Err(invalid(format!(
                    "default model '{}' for task '{}' is not in the catalog",
                    model_id, task
                )));
            }
        }

        match self.log_level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => {
                return Err(invalid(format!(
                    "Invalid log level: {}. Valid options: trace, debug, info, warn, error",
                    self.log_level
                )))
            }
        }

        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::ValidationFailed(message.into())
}

fn override_from_env<T>(target: &mut T, var: &str) -> Result<(), ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    if let Ok(raw) = env::var(var) {
        *target = raw.trim().parse().map_err(|e: T::Err| ConfigError::ParseError {
            field: var.to_string(),
            error: e.to_string(),
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    fn clear_env() {
        for (key, _) in env::vars() {
            if key.starts_with("LOCALMIND_") {
                env::remove_var(key);
            }
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = OrchestratorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.local_ai.max_concurrent_requests, 3);
        assert!(config.local_ai.fallback_to_cloud);
        assert!(config.cloud.is_none());
        assert!(!config.models.is_empty());
    }

    #[test]
    fn test_backend_base_url() {
        let backend = BackendConfig::default();
        assert_eq!(backend.base_url(), "http://127.0.0.1:11434");

        let backend = BackendConfig {
            host: "https://gpu-box/".to_string(),
            port: 8443,
            timeout_secs: 10,
        };
        assert_eq!(backend.base_url(), "https://gpu-box:8443");
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        clear_env();
        env::set_var("LOCALMIND_MAX_CONCURRENT_REQUESTS", "5");
        env::set_var("LOCALMIND_FALLBACK_TO_CLOUD", "false");
        env::set_var("LOCALMIND_OLLAMA_PORT", "9000");
        env::set_var("LOCALMIND_CLOUD_URL", "https://api.example.com");
        env::set_var("LOCALMIND_CLOUD_MODEL", "remote-large");
        env::set_var("LOCALMIND_CLOUD_FORMAT", "ollama");

        let config = OrchestratorConfig::from_env().unwrap();
        clear_env();

        assert_eq!(config.local_ai.max_concurrent_requests, 5);
        assert!(!config.local_ai.fallback_to_cloud);
        assert_eq!(config.backend.port, 9000);
        let cloud = config.cloud.unwrap();
        assert_eq!(cloud.base_url, "https://api.example.com");
        assert_eq!(cloud.model, "remote-large");
        assert_eq!(cloud.format, CloudFormat::Ollama);
    }

    #[test]
    #[serial]
    fn test_env_parse_error() {
        clear_env();
        env::set_var("LOCALMIND_SAFETY_MARGIN", "lots");
        let result = OrchestratorConfig::from_env();
        clear_env();

        match result {
            Err(ConfigError::ParseError { field, .. }) => {
                assert_eq!(field, "LOCALMIND_SAFETY_MARGIN")
            }
            other => panic!("expected parse error, got {:?}", other),
        }
    }

    #[test]
    #[serial]
    fn test_from_file() {
        clear_env();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
log_level = "debug"

[local_ai]
max_concurrent_requests = 2
swap_delay_secs = 0

[backend]
host = "10.0.0.5"

[cloud]
base_url = "https://api.example.com"
model = "gpt-small"
api_key_env = "EXAMPLE_API_KEY"

[task_models]
coding = "coder"

[[models]]
id = "coder"
display_name = "Coder"
memory_gb = 4.5
tags = ["coding"]
min_tier = "GPU_LOW"
"#
        )
        .unwrap();

        let config = OrchestratorConfig::from_file(file.path()).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.local_ai.max_concurrent_requests, 2);
        assert_eq!(config.local_ai.swap_delay_secs, 0);
        // Unset fields keep their defaults
        assert_eq!(config.local_ai.drain_timeout_secs, 30);
        assert_eq!(config.backend.port, 11434);
        assert_eq!(config.models.len(), 1);
        assert_eq!(config.task_models.get(&TaskType::Coding).unwrap(), "coder");
        let cloud = config.cloud.unwrap();
        assert_eq!(cloud.format, CloudFormat::OpenaiCompatible);
        assert_eq!(cloud.timeout_secs, 60);
    }

    #[test]
    fn test_missing_file() {
        let result = OrchestratorConfig::from_file("/definitely/not/here.toml");
        assert!(matches!(result, Err(ConfigError::ReadError { .. })));
    }

    #[test]
    fn test_validation_failures() {
        let mut config = OrchestratorConfig::default();
        config.local_ai.max_concurrent_requests = 0;
        assert!(config.validate().is_err());

        let mut config = OrchestratorConfig::default();
        config.local_ai.safety_margin = 1.5;
        assert!(config.validate().is_err());

        let mut config = OrchestratorConfig::default();
        config.inference.top_p = 2.0;
        assert!(config.validate().is_err());

        let mut config = OrchestratorConfig::default();
        config.log_level = "loud".to_string();
        assert!(config.validate().is_err());

        let mut config = OrchestratorConfig::default();
        config
            .task_models
            .insert(TaskType::Coding, "missing-model".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_idle_unload_disabled() {
        let mut local = LocalAiConfig::default();
        assert_eq!(local.idle_unload(), Some(Duration::from_secs(600)));
        local.idle_unload_secs = 0;
        assert_eq!(local.idle_unload(), None);
    }

    #[test]
    fn test_cloud_format_parse() {
        assert_eq!(
            "openai".parse::<CloudFormat>().unwrap(),
            CloudFormat::OpenaiCompatible
        );
        assert_eq!("OLLAMA".parse::<CloudFormat>().unwrap(), CloudFormat::Ollama);
        assert!("grpc".parse::<CloudFormat>().is_err());
    }
}
