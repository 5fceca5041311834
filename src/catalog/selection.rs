//! Model fit and selection under hardware constraints

use super::descriptor::{ModelDescriptor, TaskType};
use crate::error::CatalogError;
use crate::hardware::HardwareSnapshot;
use std::cmp::Ordering;
use tracing::{debug, info};

/// Whether `model` fits `snapshot` under `safety_margin`
pub fn fits(model: &ModelDescriptor, snapshot: &HardwareSnapshot, safety_margin: f64) -> bool {
    model.memory_gb <= snapshot.usable_memory_gb(safety_margin) && model.min_tier <= snapshot.tier
}

/// Picks the model to run for `task` on `snapshot`
///
/// Among the fitting candidates, models tagged for the task win; otherwise
/// the largest fitting model is taken. Ties keep catalog order.
pub fn select<'a, I>(
    models: I,
    snapshot: &HardwareSnapshot,
    task: TaskType,
    safety_margin: f64,
) -> Result<ModelDescriptor, CatalogError>
where
    I: IntoIterator<Item = &'a ModelDescriptor>,
{
    let usable_gb = snapshot.usable_memory_gb(safety_margin);
    let candidates: Vec<&ModelDescriptor> = models
        .into_iter()
        .filter(|m| fits(m, snapshot, safety_margin))
        .collect();

    debug!(
        "Model selection: {:.1}GB available, {:.1}GB usable, {} candidates for task {}",
        snapshot.memory_available_gb,
        usable_gb,
        candidates.len(),
        task
    );

    let specialized = candidates
        .iter()
        .copied()
        .filter(|m| m.serves(task))
        .fold(None, largest);

    let selected = match specialized {
        Some(model) => Some(model),
        None => candidates.iter().copied().fold(None, largest),
    };

    match selected {
        Some(model) => {
            info!(
                "Selected model: {} (requires {:.1}GB, task {}, {})",
                model.id,
                model.memory_gb,
                task,
                if model.serves(task) {
                    "specialized"
                } else {
                    "largest fit"
                }
            );
            Ok(model.clone())
        }
        None => Err(CatalogError::NoFittingModel {
            available_gb: usable_gb,
            tier: snapshot.tier.to_string(),
        }),
    }
}

fn largest<'a>(best: Option<&'a ModelDescriptor>, m: &'a ModelDescriptor) -> Option<&'a ModelDescriptor> {
    match best {
        Some(b) if b.memory_gb >= m.memory_gb => Some(b),
        _ => Some(m),
    }
}

/// Listing order: fitting models first, each group by ascending memory
pub fn listing_order(
    a: &ModelDescriptor,
    b: &ModelDescriptor,
    snapshot: &HardwareSnapshot,
    safety_margin: f64,
) -> Ordering {
    let fa = fits(a, snapshot, safety_margin);
    let fb = fits(b, snapshot, safety_margin);
    fb.cmp(&fa).then_with(|| a.memory_gb.total_cmp(&b.memory_gb))
}
