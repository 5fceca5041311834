//! Hardware profiling for model selection
//!
//! A [`HardwareProbe`] reads the machine once and produces an immutable
//! [`HardwareSnapshot`]. The [`HardwareProfiler`] keeps only the latest
//! snapshot and replaces it wholesale on every re-probe.

use crate::error::ProbeError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use sysinfo::System;
use tracing::{debug, info, warn};

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// GPUs with at least this much memory are classified as high tier
pub const GPU_HIGH_MIN_MEMORY_GB: f64 = 8.0;

/// Coarse compute class, ordered from weakest to strongest
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ComputeTier {
    CpuOnly,
    GpuLow,
    GpuHigh,
}

impl ComputeTier {
    /// Classifies a machine from its GPU information
    pub fn classify(gpu_name: Option<&str>, gpu_memory_gb: Option<f64>) -> Self {
        match (gpu_name, gpu_memory_gb) {
            (None, None) => ComputeTier::CpuOnly,
            (_, Some(mem)) if mem >= GPU_HIGH_MIN_MEMORY_GB => ComputeTier::GpuHigh,
            _ => ComputeTier::GpuLow,
        }
    }
}

impl std::fmt::Display for ComputeTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ComputeTier::CpuOnly => write!(f, "CPU_ONLY"),
            ComputeTier::GpuLow => write!(f, "GPU_LOW"),
            ComputeTier::GpuHigh => write!(f, "GPU_HIGH"),
        }
    }
}

/// Point-in-time view of the machine's capabilities
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HardwareSnapshot {
    pub tier: ComputeTier,
    pub memory_total_gb: f64,
    /// Never exceeds `memory_total_gb`
    pub memory_available_gb: f64,
    pub gpu_name: Option<String>,
    pub gpu_memory_gb: Option<f64>,
    pub captured_at: DateTime<Utc>,
}

impl HardwareSnapshot {
    /// Builds a snapshot, clamping available memory to the total
    pub fn new(
        memory_total_gb: f64,
        memory_available_gb: f64,
        gpu_name: Option<String>,
        gpu_memory_gb: Option<f64>,
    ) -> Self {
        let memory_total_gb = memory_total_gb.max(0.0);
        let memory_available_gb = memory_available_gb.clamp(0.0, memory_total_gb);
        let tier = ComputeTier::classify(gpu_name.as_deref(), gpu_memory_gb);

        Self {
            tier,
            memory_total_gb,
            memory_available_gb,
            gpu_name,
            gpu_memory_gb,
            captured_at: Utc::now(),
        }
    }

    /// CPU-only snapshot used when probing fails
    pub fn conservative(memory_gb: f64) -> Self {
        Self::new(memory_gb, memory_gb, None, None)
    }

    /// Memory a model may occupy under the given safety margin
    pub fn usable_memory_gb(&self, safety_margin: f64) -> f64 {
        self.memory_available_gb * safety_margin
    }

    /// Same snapshot with `credit_gb` added back to the available memory
    ///
    /// Used when re-validating an active model whose own footprint already
    /// reduced the measured available memory.
    pub fn with_credit(&self, credit_gb: f64) -> Self {
        let mut snapshot = self.clone();
        snapshot.memory_available_gb =
            (self.memory_available_gb + credit_gb.max(0.0)).min(self.memory_total_gb);
        snapshot
    }
}

/// Source of hardware snapshots
pub trait HardwareProbe: Send + Sync {
    fn probe(&self) -> Result<HardwareSnapshot, ProbeError>;
}

/// Reads memory through `sysinfo` and GPU details through `nvidia-smi`
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProbe;

impl SystemProbe {
    fn detect_gpu() -> Option<(String, f64)> {
        let output = Command::new("nvidia-smi")
            .args([
                "--query-gpu=name,memory.total",
                "--format=csv,noheader,nounits",
            ])
            .output();

        match output {
            Ok(out) if out.status.success() => {
                let stdout = String::from_utf8_lossy(&out.stdout);
                let gpu = parse_nvidia_smi(&stdout);
                if gpu.is_none() {
                    debug!("nvidia-smi returned no parsable GPU line");
                }
                gpu
            }
            Ok(out) => {
                debug!("nvidia-smi exited with {}", out.status);
                None
            }
            Err(e) => {
                debug!("GPU not detected (nvidia-smi unavailable: {})", e);
                None
            }
        }
    }
}

impl HardwareProbe for SystemProbe {
    fn probe(&self) -> Result<HardwareSnapshot, ProbeError> {
        let mut sys = System::new();
        sys.refresh_memory();

        let total_bytes = sys.total_memory();
        if total_bytes == 0 {
            return Err(ProbeError::MemoryUnavailable);
        }
        let available_bytes = sys.available_memory();

        let (gpu_name, gpu_memory_gb) = match Self::detect_gpu() {
            Some((name, mem)) => (Some(name), Some(mem)),
            None => (None, None),
        };

        Ok(HardwareSnapshot::new(
            total_bytes as f64 / BYTES_PER_GB,
            available_bytes as f64 / BYTES_PER_GB,
            gpu_name,
            gpu_memory_gb,
        ))
    }
}

/// Parses the first line of `nvidia-smi --query-gpu=name,memory.total` (MiB)
pub fn parse_nvidia_smi(output: &str) -> Option<(String, f64)> {
    let line = output.lines().find(|l| !l.trim().is_empty())?;
    let (name, mem) = line.rsplit_once(',')?;
    let mib: f64 = mem.trim().parse().ok()?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    Some((name.to_string(), mib / 1024.0))
}

/// Probe returning a fixed snapshot, or a fixed error
#[derive(Debug, Clone)]
pub struct StaticProbe {
    result: Arc<RwLock<Result<HardwareSnapshot, ProbeError>>>,
    probes: Arc<AtomicUsize>,
}

impl StaticProbe {
    pub fn new(snapshot: HardwareSnapshot) -> Self {
        Self {
            result: Arc::new(RwLock::new(Ok(snapshot))),
            probes: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn failing(error: ProbeError) -> Self {
        Self {
            result: Arc::new(RwLock::new(Err(error))),
            probes: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Replaces what the next probe returns
    pub fn set(&self, snapshot: HardwareSnapshot) {
        *self.result.write().unwrap_or_else(|e| e.into_inner()) = Ok(snapshot);
    }

    /// Probes taken so far, across all clones
    pub fn probe_count(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }
}

impl HardwareProbe for StaticProbe {
    fn probe(&self) -> Result<HardwareSnapshot, ProbeError> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        let mut result = self
            .result
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Ok(snapshot) = result.as_mut() {
            snapshot.captured_at = Utc::now();
        }
        result
    }
}

/// Holds the latest snapshot and re-probes on demand
pub struct HardwareProfiler {
    probe: Box<dyn HardwareProbe>,
    latest: RwLock<Arc<HardwareSnapshot>>,
    conservative_memory_gb: f64,
}

impl HardwareProfiler {
    /// Creates a profiler and takes an initial snapshot
    pub fn new(probe: Box<dyn HardwareProbe>, conservative_memory_gb: f64) -> Self {
        let initial = Self::probe_or_default(probe.as_ref(), conservative_memory_gb);
        Self {
            probe,
            latest: RwLock::new(Arc::new(initial)),
            conservative_memory_gb,
        }
    }

    /// Latest snapshot without probing
    pub fn latest(&self) -> Arc<HardwareSnapshot> {
        self.latest
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Probes again and replaces the latest snapshot
    pub fn refresh(&self) -> Arc<HardwareSnapshot> {
        let snapshot = Arc::new(Self::probe_or_default(
            self.probe.as_ref(),
            self.conservative_memory_gb,
        ));
        *self.latest.write().unwrap_or_else(|e| e.into_inner()) = snapshot.clone();
        snapshot
    }

    /// [`refresh`](Self::refresh) on the blocking pool
    pub async fn refresh_async(self: &Arc<Self>) -> Arc<HardwareSnapshot> {
        let profiler = Arc::clone(self);
        match tokio::task::spawn_blocking(move || profiler.refresh()).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("Hardware re-probe task failed: {}", e);
                self.latest()
            }
        }
    }

    fn probe_or_default(probe: &dyn HardwareProbe, conservative_memory_gb: f64) -> HardwareSnapshot {
        match probe.probe() {
            Ok(snapshot) => {
                info!(
                    "Hardware detected: {:.1}GB RAM available ({:.1}GB total), tier: {}",
                    snapshot.memory_available_gb, snapshot.memory_total_gb, snapshot.tier
                );
                debug!("Hardware snapshot: {:?}", snapshot);
                snapshot
            }
            Err(e) => {
                warn!(
                    "Hardware probe failed ({}), assuming CPU_ONLY with {:.1}GB",
                    e, conservative_memory_gb
                );
                HardwareSnapshot::conservative(conservative_memory_gb)
            }
        }
    }
}

impl std::fmt::Debug for HardwareProfiler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HardwareProfiler")
            .field("latest", &self.latest())
            .finish()
    }
}
