//! Model catalog: known models, their requirements and download state
//!
//! The catalog is the single owner of [`ModelDescriptor`]s. Download state only
//! moves through [`ModelCatalog::mark_download_state`], which enforces
//! `NOT_DOWNLOADED -> DOWNLOADING -> {READY, FAILED}`; availability is
//! refreshed from the backend's inventory through [`ModelCatalog::sync_inventory`].

mod descriptor;
mod selection;

pub use descriptor::{DownloadState, ModelDescriptor, TaskType, GENERAL_TAG};
pub use selection::{fits, listing_order, select};

use crate::error::CatalogError;
use crate::hardware::{ComputeTier, HardwareSnapshot};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};

/// Aggregate numbers about the catalog
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CatalogStats {
    pub total_models: usize,
    pub ready_models: usize,
    pub models_by_tag: BTreeMap<String, usize>,
    pub total_memory_gb: f64,
}

/// Registry of known models
#[derive(Debug)]
pub struct ModelCatalog {
    entries: RwLock<Vec<ModelDescriptor>>,
    safety_margin: f64,
}

impl ModelCatalog {
    /// Creates a catalog, rejecting invalid or duplicate descriptors
    pub fn new(
        descriptors: impl IntoIterator<Item = ModelDescriptor>,
        safety_margin: f64,
    ) -> Result<Self, CatalogError> {
        let catalog = Self {
            entries: RwLock::new(Vec::new()),
            safety_margin,
        };
        for descriptor in descriptors {
            catalog.register(descriptor)?;
        }
        Ok(catalog)
    }

    /// Built-in catalog of common Ollama models
    pub fn default_models() -> Vec<ModelDescriptor> {
        vec![
            ModelDescriptor::new("llama3.2:1b", 1.5)
                .with_display_name("Llama 3.2 1B")
                .with_tags(["general"]),
            ModelDescriptor::new("qwen2.5-coder:1.5b", 1.8)
                .with_display_name("Qwen2.5-Coder 1.5B")
                .with_tags(["coding", "technical"]),
            ModelDescriptor::new("llama3.2:3b", 3.4)
                .with_display_name("Llama 3.2 3B")
                .with_tags(["general", "creative"]),
            ModelDescriptor::new("mistral:7b", 5.0)
                .with_display_name("Mistral 7B")
                .with_tags(["general", "creative", "analysis"]),
            ModelDescriptor::new("qwen2.5-coder:7b", 5.5)
                .with_display_name("Qwen2.5-Coder 7B")
                .with_tags(["coding", "technical"]),
            ModelDescriptor::new("llama3.1:8b", 6.2)
                .with_display_name("Llama 3.1 8B")
                .with_tags(["general", "analysis", "technical"]),
            ModelDescriptor::new("deepseek-r1:14b", 10.5)
                .with_display_name("DeepSeek-R1 14B")
                .with_tags(["analysis", "technical"])
                .with_min_tier(ComputeTier::GpuHigh),
        ]
    }

    pub fn safety_margin(&self) -> f64 {
        self.safety_margin
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<ModelDescriptor>> {
        self.entries.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<ModelDescriptor>> {
        self.entries.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn get(&self, id: &str) -> Option<ModelDescriptor> {
        self.read().iter().find(|m| m.id == id).cloned()
    }

    pub fn require(&self, id: &str) -> Result<ModelDescriptor, CatalogError> {
        self.get(id)
            .ok_or_else(|| CatalogError::UnknownModel(id.to_string()))
    }

    /// All models, fitting ones first, each group by ascending memory
    pub fn list(&self, snapshot: &HardwareSnapshot) -> Vec<ModelDescriptor> {
        let mut models = self.read().clone();
        models.sort_by(|a, b| listing_order(a, b, snapshot, self.safety_margin));
        models
    }

    /// Whether `model` fits `snapshot` under this catalog's safety margin
    pub fn fits(&self, model: &ModelDescriptor, snapshot: &HardwareSnapshot) -> bool {
        fits(model, snapshot, self.safety_margin)
    }

    /// Best model for `task` on `snapshot`
    pub fn select(
        &self,
        snapshot: &HardwareSnapshot,
        task: TaskType,
    ) -> Result<ModelDescriptor, CatalogError> {
        let entries = self.read();
        select(entries.iter(), snapshot, task, self.safety_margin)
    }

    /// Moves a model's download state, rejecting out-of-order transitions
    pub fn mark_download_state(
        &self,
        id: &str,
        state: DownloadState,
    ) -> Result<ModelDescriptor, CatalogError> {
        let mut entries = self.write();
        let entry = entries
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or_else(|| CatalogError::UnknownModel(id.to_string()))?;

        if !entry.download_state.can_transition_to(state) {
            warn!(
                "Rejected download state transition for {}: {} -> {}",
                id, entry.download_state, state
            );
            return Err(CatalogError::InvalidTransition {
                model_id: id.to_string(),
                from: entry.download_state.to_string(),
                to: state.to_string(),
            });
        }

        debug!("Download state for {}: {} -> {}", id, entry.download_state, state);
        entry.download_state = state;
        entry.available_locally = state == DownloadState::Ready;
        Ok(entry.clone())
    }

    /// Reconciles availability with the ids the backend reports as installed
    ///
    /// Returns how many entries changed. Downloads in progress are left alone.
    pub fn sync_inventory<S: AsRef<str>>(&self, installed: &[S]) -> usize {
        let installed: HashSet<&str> = installed.iter().map(AsRef::as_ref).collect();
        let mut changed = 0;

        for entry in self.write().iter_mut() {
            if entry.download_state == DownloadState::Downloading {
                continue;
            }
            let present = installed.contains(entry.id.as_str());
            if present && !entry.available_locally {
                entry.download_state = DownloadState::Ready;
                entry.available_locally = true;
                changed += 1;
            } else if !present && entry.download_state == DownloadState::Ready {
                entry.download_state = DownloadState::NotDownloaded;
                entry.available_locally = false;
                changed += 1;
            }
        }

        if changed > 0 {
            info!("Catalog inventory synced: {} entries changed", changed);
        }
        changed
    }

    /// Adds a new model
    pub fn register(&self, descriptor: ModelDescriptor) -> Result<(), CatalogError> {
        descriptor
            .validate()
            .map_err(CatalogError::InvalidDescriptor)?;

        let mut entries = self.write();
        if entries.iter().any(|m| m.id == descriptor.id) {
            return Err(CatalogError::DuplicateModel(descriptor.id));
        }
        debug!("Registered model {} ({:.1}GB)", descriptor.id, descriptor.memory_gb);
        entries.push(descriptor);
        Ok(())
    }

    /// Removes a model, returning its last descriptor
    pub fn unregister(&self, id: &str) -> Result<ModelDescriptor, CatalogError> {
        let mut entries = self.write();
        let index = entries
            .iter()
            .position(|m| m.id == id)
            .ok_or_else(|| CatalogError::UnknownModel(id.to_string()))?;
        info!("Unregistered model {}", id);
        Ok(entries.remove(index))
    }

    pub fn stats(&self) -> CatalogStats {
        let entries = self.read();
        let mut models_by_tag = BTreeMap::new();
        for tag in entries.iter().flat_map(|m| m.tags.iter()) {
            *models_by_tag.entry(tag.clone()).or_insert(0) += 1;
        }

        CatalogStats {
            total_models: entries.len(),
            ready_models: entries.iter().filter(|m| m.is_ready()).count(),
            models_by_tag,
            total_memory_gb: entries.iter().map(|m| m.memory_gb).sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> ModelCatalog {
        ModelCatalog::new(
            vec![
                ModelDescriptor::new("A", 4.0).with_tags(["general"]),
                ModelDescriptor::new("B", 8.0).with_tags(["coding"]),
                ModelDescriptor::new("C", 1.0).with_tags(["general", "creative"]).ready(),
            ],
            0.85,
        )
        .unwrap()
    }

    #[test]
    fn test_default_models_are_valid() {
        let catalog = ModelCatalog::new(ModelCatalog::default_models(), 0.85).unwrap();
        assert!(!catalog.is_empty());
        assert!(catalog.get("qwen2.5-coder:7b").is_some());
    }

    #[test]
    fn test_rejects_duplicates_and_invalid() {
        let catalog = catalog();
        assert_eq!(
            catalog.register(ModelDescriptor::new("A", 2.0)),
            Err(CatalogError::DuplicateModel("A".to_string()))
        );
        assert!(matches!(
            catalog.register(ModelDescriptor::new("", 2.0)),
            Err(CatalogError::InvalidDescriptor(_))
        ));

        let mut stuck = ModelDescriptor::new("D", 2.0);
        stuck.download_state = DownloadState::Downloading;
        assert!(matches!(
            catalog.register(stuck),
            Err(CatalogError::InvalidDescriptor(_))
        ));
        assert_eq!(catalog.len(), 3);
    }

    #[test]
    fn test_download_state_machine() {
        let catalog = catalog();

        let err = catalog
            .mark_download_state("A", DownloadState::Ready)
            .unwrap_err();
        assert!(matches!(err, CatalogError::InvalidTransition { .. }));

        let a = catalog
            .mark_download_state("A", DownloadState::Downloading)
            .unwrap();
        assert!(!a.available_locally);

        let a = catalog.mark_download_state("A", DownloadState::Ready).unwrap();
        assert!(a.available_locally);
        assert!(a.is_ready());

        assert!(catalog
            .mark_download_state("A", DownloadState::Downloading)
            .is_err());
    }

    #[test]
    fn test_failed_download_is_retryable() {
        let catalog = catalog();
        catalog
            .mark_download_state("B", DownloadState::Downloading)
            .unwrap();
        let b = catalog.mark_download_state("B", DownloadState::Failed).unwrap();
        assert!(!b.available_locally);
        assert!(catalog
            .mark_download_state("B", DownloadState::Downloading)
            .is_ok());
    }

    #[test]
    fn test_unknown_model_transition() {
        assert_eq!(
            catalog().mark_download_state("nope", DownloadState::Downloading),
            Err(CatalogError::UnknownModel("nope".to_string()))
        );
    }

    #[test]
    fn test_sync_inventory() {
        let catalog = catalog();
        catalog
            .mark_download_state("B", DownloadState::Downloading)
            .unwrap();

        // A appears, C vanished, B is mid-download and untouched
        let changed = catalog.sync_inventory(&["A", "B"]);
        assert_eq!(changed, 2);

        let a = catalog.get("A").unwrap();
        assert!(a.available_locally && a.is_ready());
        let b = catalog.get("B").unwrap();
        assert_eq!(b.download_state, DownloadState::Downloading);
        let c = catalog.get("C").unwrap();
        assert!(!c.available_locally);
        assert_eq!(c.download_state, DownloadState::NotDownloaded);
    }

    #[test]
    fn test_availability_never_without_ready() {
        let catalog = catalog();
        catalog.sync_inventory(&["A"]);
        catalog
            .mark_download_state("B", DownloadState::Downloading)
            .unwrap();
        catalog.mark_download_state("B", DownloadState::Failed).unwrap();

        let snapshot = HardwareSnapshot::new(64.0, 64.0, None, None);
        for model in catalog.list(&snapshot) {
            assert!(!model.available_locally || model.download_state == DownloadState::Ready);
        }
    }

    #[test]
    fn test_list_orders_fitting_first() {
        let snapshot = HardwareSnapshot::new(16.0, 6.0, None, None);
        let ids: Vec<_> = catalog()
            .list(&snapshot)
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(ids, vec!["C", "A", "B"]);
    }

    #[test]
    fn test_stats() {
        let stats = catalog().stats();
        assert_eq!(stats.total_models, 3);
        assert_eq!(stats.ready_models, 1);
        assert_eq!(stats.models_by_tag.get("general"), Some(&2));
        assert_eq!(stats.models_by_tag.get("coding"), Some(&1));
        assert!((stats.total_memory_gb - 13.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_unregister() {
        let catalog = catalog();
        let removed = catalog.unregister("B").unwrap();
        assert_eq!(removed.id, "B");
        assert!(catalog.get("B").is_none());
        assert!(catalog.unregister("B").is_err());
    }
}
