//! localmind - local model orchestrator with cloud fallback
//!
//! Keeps at most one local model resident, chosen to fit the machine's
//! available memory and the task at hand, and routes inference requests to
//! it under an admission ceiling. When local inference is unavailable or
//! fails, a configured cloud endpoint answers instead.
//!
//! # Core Concepts
//!
//! - **Hardware profiling**: periodic snapshots of memory and GPU, see [`hardware`]
//! - **Catalog**: known models with memory footprints and task tags, see [`catalog`]
//! - **Lifecycle**: the single active-model slot with drain-then-unload
//!   swaps, see [`lifecycle`]
//! - **Routing**: admission, local attempt, single cloud fallback, see [`router`]
//!
//! # Example Usage
//!
//! ```no_run
//! use localmind::{InferenceCommand, Orchestrator, OrchestratorConfig};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let orchestrator = Orchestrator::from_config(OrchestratorConfig::from_env()?)?;
//! orchestrator.start().await;
//!
//! let response = orchestrator
//!     .infer(InferenceCommand::new("Write a haiku about rust", "creative"))
//!     .await;
//! println!("{} (via {})", response.response, response.model_used);
//!
//! orchestrator.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod backend;
pub mod catalog;
pub mod cli;
pub mod config;
pub mod download;
pub mod error;
pub mod hardware;
pub mod lifecycle;
pub mod monitor;
pub mod orchestrator;
pub mod router;
pub mod util;

pub use api::{
    DownloadCommand, DownloadResponse, InferenceCommand, InferenceResponse, ModelListing,
    StatusReport,
};
pub use backend::{CloudClient, InferenceBackend, ModelTransport};
pub use catalog::{ModelCatalog, ModelDescriptor, TaskType};
pub use config::{ConfigError, OrchestratorConfig};
pub use error::{
    BackendError, CatalogError, DownloadError, LifecycleError, OrchestratorError, RouterError,
};
pub use hardware::{ComputeTier, HardwareSnapshot};
pub use orchestrator::Orchestrator;
pub use router::{InferenceRequest, InferenceResult, ModelOrigin};
pub use util::{init_default, init_from_env, init_logging, LoggingConfig};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_exists() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_name_is_localmind() {
        assert_eq!(NAME, "localmind");
    }
}
