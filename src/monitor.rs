//! Rolling performance record
//!
//! Samples are kept per model in a window bounded both by count and by age.
//! Entries are immutable once recorded; summaries are computed on read.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::debug;

/// Model id under which cloud outcomes are recorded
pub const CLOUD_MODEL_ID: &str = "cloud";

/// Model id for requests that never reached a model
pub const NO_MODEL_ID: &str = "none";

/// One completed (or failed) request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceEntry {
    pub model_id: String,
    pub tokens_per_second: f64,
    pub latency_s: f64,
    pub memory_usage_gb: f64,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
}

impl PerformanceEntry {
    pub fn success(
        model_id: impl Into<String>,
        tokens: u64,
        latency: Duration,
        memory_usage_gb: f64,
    ) -> Self {
        let latency_s = latency.as_secs_f64();
        let tokens_per_second = if latency_s > 0.0 {
            tokens as f64 / latency_s
        } else {
            0.0
        };
        Self {
            model_id: model_id.into(),
            tokens_per_second,
            latency_s,
            memory_usage_gb,
            timestamp: Utc::now(),
            success: true,
        }
    }

    pub fn failure(model_id: impl Into<String>, latency: Duration, memory_usage_gb: f64) -> Self {
        Self {
            model_id: model_id.into(),
            tokens_per_second: 0.0,
            latency_s: latency.as_secs_f64(),
            memory_usage_gb,
            timestamp: Utc::now(),
            success: false,
        }
    }
}

/// Averages over the current window
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSummary {
    /// Mean over successful samples only
    pub avg_tokens_per_second: f64,
    /// Mean over all samples
    pub avg_latency_s: f64,
    pub sample_count: usize,
    pub failure_count: usize,
}

impl PerformanceSummary {
    fn from_entries<'a>(entries: impl Iterator<Item = &'a PerformanceEntry>) -> Self {
        let mut summary = Self::default();
        let mut throughput_total = 0.0;
        let mut latency_total = 0.0;

        for entry in entries {
            summary.sample_count += 1;
            latency_total += entry.latency_s;
            if entry.success {
                throughput_total += entry.tokens_per_second;
            } else {
                summary.failure_count += 1;
            }
        }

        let successes = summary.sample_count - summary.failure_count;
        if successes > 0 {
            summary.avg_tokens_per_second = throughput_total / successes as f64;
        }
        if summary.sample_count > 0 {
            summary.avg_latency_s = latency_total / summary.sample_count as f64;
        }
        summary
    }

    pub fn success_rate(&self) -> f64 {
        if self.sample_count == 0 {
            return 0.0;
        }
        (self.sample_count - self.failure_count) as f64 / self.sample_count as f64
    }
}

/// Per-model rolling windows of [`PerformanceEntry`]
#[derive(Debug)]
pub struct PerformanceMonitor {
    window: usize,
    max_age: Duration,
    samples: RwLock<HashMap<String, VecDeque<Arc<PerformanceEntry>>>>,
}

impl PerformanceMonitor {
    pub fn new(window: usize, max_age: Duration) -> Self {
        Self {
            window: window.max(1),
            max_age,
            samples: RwLock::new(HashMap::new()),
        }
    }

    fn cutoff(&self) -> DateTime<Utc> {
        chrono::Duration::from_std(self.max_age)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    pub fn record(&self, entry: PerformanceEntry) {
        debug!(
            model = %entry.model_id,
            success = entry.success,
            latency_ms = (entry.latency_s * 1000.0) as u64,
            tokens_per_second = entry.tokens_per_second,
            "Recorded inference outcome"
        );
        let cutoff = self.cutoff();
        let mut samples = self.samples.write().unwrap_or_else(|e| e.into_inner());
        let window = samples.entry(entry.model_id.clone()).or_default();
        window.push_back(Arc::new(entry));
        while window.len() > self.window {
            window.pop_front();
        }
        while window.front().is_some_and(|e| e.timestamp < cutoff) {
            window.pop_front();
        }
    }

    /// Summary of the window for `model_id`; empty when nothing was recorded
    pub fn snapshot(&self, model_id: &str) -> PerformanceSummary {
        let cutoff = self.cutoff();
        let samples = self.samples.read().unwrap_or_else(|e| e.into_inner());
        match samples.get(model_id) {
            Some(window) => PerformanceSummary::from_entries(
                window
                    .iter()
                    .map(Arc::as_ref)
                    .filter(|e| e.timestamp >= cutoff),
            ),
            None => PerformanceSummary::default(),
        }
    }

    /// Summary across every model's window
    pub fn overall(&self) -> PerformanceSummary {
        let cutoff = self.cutoff();
        let samples = self.samples.read().unwrap_or_else(|e| e.into_inner());
        PerformanceSummary::from_entries(
            samples
                .values()
                .flat_map(|w| w.iter())
                .map(Arc::as_ref)
                .filter(|e| e.timestamp >= cutoff),
        )
    }

    /// Summaries keyed by model id
    pub fn summaries(&self) -> BTreeMap<String, PerformanceSummary> {
        let ids: Vec<String> = self
            .samples
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        ids.into_iter()
            .map(|id| {
                let summary = self.snapshot(&id);
                (id, summary)
            })
            .filter(|(_, s)| s.sample_count > 0)
            .collect()
    }

    /// Up to `limit` most recent entries, newest first
    pub fn recent(&self, limit: usize) -> Vec<PerformanceEntry> {
        let samples = self.samples.read().unwrap_or_else(|e| e.into_inner());
        let mut entries: Vec<Arc<PerformanceEntry>> =
            samples.values().flat_map(|w| w.iter().cloned()).collect();
        drop(samples);

        entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        entries
            .into_iter()
            .take(limit)
            .map(|e| e.as_ref().clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_snapshot() {
        let monitor = PerformanceMonitor::new(10, Duration::from_secs(60));
        assert_eq!(monitor.snapshot("A"), PerformanceSummary::default());
        assert_eq!(monitor.overall().sample_count, 0);
    }

    #[test]
    fn test_averages() {
        let monitor = PerformanceMonitor::new(10, Duration::from_secs(3600));
        monitor.record(PerformanceEntry::success("A", 100, Duration::from_secs(2), 4.0));
        monitor.record(PerformanceEntry::success("A", 60, Duration::from_secs(2), 4.0));
        monitor.record(PerformanceEntry::failure("A", Duration::from_secs(5), 4.0));

        let summary = monitor.snapshot("A");
        assert_eq!(summary.sample_count, 3);
        assert_eq!(summary.failure_count, 1);
        // (50 + 30) / 2 successes
        assert!((summary.avg_tokens_per_second - 40.0).abs() < 1e-9);
        // (2 + 2 + 5) / 3
        assert!((summary.avg_latency_s - 3.0).abs() < 1e-9);
        assert!((summary.success_rate() - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_window_evicts_oldest() {
        let monitor = PerformanceMonitor::new(2, Duration::from_secs(3600));
        monitor.record(PerformanceEntry::success("A", 10, Duration::from_secs(10), 1.0));
        monitor.record(PerformanceEntry::success("A", 10, Duration::from_secs(1), 1.0));
        monitor.record(PerformanceEntry::success("A", 10, Duration::from_secs(1), 1.0));

        let summary = monitor.snapshot("A");
        assert_eq!(summary.sample_count, 2);
        assert!((summary.avg_latency_s - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_age_eviction() {
        let monitor = PerformanceMonitor::new(10, Duration::from_secs(60));
        let mut stale = PerformanceEntry::success("A", 10, Duration::from_secs(1), 1.0);
        stale.timestamp = Utc::now() - chrono::Duration::seconds(120);
        monitor.record(stale);
        monitor.record(PerformanceEntry::success("A", 10, Duration::from_secs(1), 1.0));

        assert_eq!(monitor.snapshot("A").sample_count, 1);
    }

    #[test]
    fn test_models_are_separate() {
        let monitor = PerformanceMonitor::new(10, Duration::from_secs(3600));
        monitor.record(PerformanceEntry::success("A", 10, Duration::from_secs(1), 1.0));
        monitor.record(PerformanceEntry::failure(CLOUD_MODEL_ID, Duration::from_secs(1), 0.0));
        monitor.record(PerformanceEntry::failure(NO_MODEL_ID, Duration::ZERO, 0.0));

        assert_eq!(monitor.snapshot("A").sample_count, 1);
        assert_eq!(monitor.snapshot(CLOUD_MODEL_ID).failure_count, 1);
        assert_eq!(monitor.overall().sample_count, 3);
        assert_eq!(monitor.summaries().len(), 3);
        assert_eq!(monitor.recent(2).len(), 2);
    }

    #[test]
    fn test_zero_latency_has_no_throughput() {
        let entry = PerformanceEntry::success("A", 10, Duration::ZERO, 1.0);
        assert_eq!(entry.tokens_per_second, 0.0);
    }
}
