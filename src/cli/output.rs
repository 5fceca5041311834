//! Output formatting for JSON, YAML and human-readable text

use anyhow::{Context, Result};
use serde::Serialize;

use crate::api::{DownloadResponse, InferenceResponse, ModelListing, StatusReport};
use crate::hardware::HardwareSnapshot;

const RULE: &str = "\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Json,
    Yaml,
    Human,
}

pub struct OutputFormatter {
    format: OutputFormat,
}

impl OutputFormatter {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    pub fn format(&self) -> OutputFormat {
        self.format
    }

    fn structured<T: Serialize>(&self, value: &T, what: &str) -> Result<Option<String>> {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(value)
                .map(Some)
                .with_context(|| format!("Failed to serialize {} to JSON", what)),
            OutputFormat::Yaml => serde_yaml::to_string(value)
                .map(Some)
                .with_context(|| format!("Failed to serialize {} to YAML", what)),
            OutputFormat::Human => Ok(None),
        }
    }

    pub fn format_hardware(&self, snapshot: &HardwareSnapshot) -> Result<String> {
        if let Some(out) = self.structured(snapshot, "hardware snapshot")? {
            return Ok(out);
        }
        let mut output = String::new();
        output.push_str("Hardware\n");
        output.push_str(RULE);
        output.push_str("\n\n");
        push_hardware(&mut output, snapshot);
        Ok(output)
    }

    pub fn format_status(&self, status: &StatusReport) -> Result<String> {
        if let Some(out) = self.structured(status, "status")? {
            return Ok(out);
        }

        let mut output = String::new();
        output.push_str("Orchestrator Status\n");
        output.push_str(RULE);
        output.push_str("\n\n");

        push_hardware(&mut output, &status.hardware);
        output.push('\n');

        output.push_str(&format!("Slot:            {}\n", status.slot));
        match &status.active_model {
            Some(model) => output.push_str(&format!(
                "Active model:    {} ({:.1}GB)\n",
                model.id, model.memory_gb
            )),
            None => output.push_str("Active model:    none\n"),
        }
        if let Some(task) = status.pending_specialization {
            output.push_str(&format!("Pending swap:    better model available for {}\n", task));
        }
        output.push_str(&format!("In flight:       {}\n", status.in_flight_requests));
        output.push_str(&format!(
            "Local inference: {}\n",
            if status.local_enabled { "enabled" } else { "disabled" }
        ));
        output.push_str(&format!(
            "Cloud fallback:  {}\n",
            if status.cloud_configured {
                "configured"
            } else {
                "not configured"
            }
        ));

        let catalog = &status.catalog;
        output.push_str(&format!(
            "Catalog:         {} models, {} ready, {:.1}GB total footprint\n",
            catalog.total_models, catalog.ready_models, catalog.total_memory_gb
        ));
        if !status.downloads_in_progress.is_empty() {
            output.push_str(&format!(
                "Downloading:     {}\n",
                status.downloads_in_progress.join(", ")
            ));
        }

        let overall = &status.performance.overall;
        if overall.sample_count > 0 {
            output.push_str(&format!(
                "Performance:     {:.1} tok/s, {:.2}s avg latency, {:.0}% success ({} samples)\n",
                overall.avg_tokens_per_second,
                overall.avg_latency_s,
                overall.success_rate() * 100.0,
                overall.sample_count
            ));
        }

        if !status.forced_evictions.is_empty() {
            output.push_str("\nForced evictions\n");
            for warning in &status.forced_evictions {
                output.push_str(&format!(
                    "  \u{26A0} {} unloaded with {} requests in flight after {:.1}s ({})\n",
                    warning.model_id,
                    warning.in_flight,
                    warning.waited_s,
                    warning.at.to_rfc3339()
                ));
            }
        }

        Ok(output)
    }

    pub fn format_models(&self, models: &[ModelListing]) -> Result<String> {
        if let Some(out) = self.structured(&models, "model listing")? {
            return Ok(out);
        }

        let mut output = String::new();
        output.push_str("Models\n");
        output.push_str(RULE);
        output.push_str("\n\n");

        if models.is_empty() {
            output.push_str("No models in the catalog\n");
            return Ok(output);
        }

        for model in models {
            let marker = if model.active {
                "\u{25B6}"
            } else if model.recommended {
                "\u{2713}"
            } else {
                "\u{2717}"
            };
            output.push_str(&format!(
                "{} {:<24} {:>6.1}GB  {:<12} {}\n",
                marker,
                model.id,
                model.memory_gb,
                model.download_state.to_string(),
                model.tags.join(",")
            ));
        }
        output.push_str("\n\u{25B6} active  \u{2713} fits this machine  \u{2717} too large\n");
        Ok(output)
    }

    pub fn format_download(&self, model_name: &str, response: &DownloadResponse) -> Result<String> {
        if let Some(out) = self.structured(response, "download result")? {
            return Ok(out);
        }
        Ok(match &response.error {
            None => format!("\u{2713} {} is ready\n", model_name),
            Some(error) => format!("\u{2717} {}: {}\n", model_name, error),
        })
    }

    pub fn format_inference(&self, response: &InferenceResponse) -> Result<String> {
        if let Some(out) = self.structured(response, "inference result")? {
            return Ok(out);
        }
        if !response.success {
            return Ok(format!(
                "\u{2717} {}\n",
                response.error.as_deref().unwrap_or("inference failed")
            ));
        }
        Ok(format!(
            "{}\n\n[{} in {:.2}s, {:.1} tok/s]\n",
            response.response.trim_end(),
            response.model_used,
            response.processing_time,
            response.tokens_per_second
        ))
    }
}

fn push_hardware(output: &mut String, snapshot: &HardwareSnapshot) {
    output.push_str(&format!("Compute tier:    {}\n", snapshot.tier));
    output.push_str(&format!(
        "Memory:          {:.1}GB available of {:.1}GB\n",
        snapshot.memory_available_gb, snapshot.memory_total_gb
    ));
    match (&snapshot.gpu_name, snapshot.gpu_memory_gb) {
        (Some(name), Some(mem)) => {
            output.push_str(&format!("GPU:             {} ({:.1}GB)\n", name, mem))
        }
        (Some(name), None) => output.push_str(&format!("GPU:             {}\n", name)),
        _ => output.push_str("GPU:             none\n"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ModelDescriptor;

    fn listing() -> Vec<ModelListing> {
        vec![
            ModelListing::new(
                ModelDescriptor::new("llama3.2:3b", 3.0)
                    .with_tags(["general"])
                    .ready(),
                true,
                true,
            ),
            ModelListing::new(
                ModelDescriptor::new("llama3.1:70b", 48.0).with_tags(["general", "analysis"]),
                false,
                false,
            ),
        ]
    }

    #[test]
    fn test_models_human() {
        let output = OutputFormatter::new(OutputFormat::Human)
            .format_models(&listing())
            .unwrap();
        assert!(output.contains("\u{25B6} llama3.2:3b"));
        assert!(output.contains("\u{2717} llama3.1:70b"));
        assert!(output.contains("analysis,general"));
    }

    #[test]
    fn test_models_json() {
        let output = OutputFormatter::new(OutputFormat::Json)
            .format_models(&listing())
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&output).unwrap();
        assert_eq!(value.as_array().unwrap().len(), 2);
        assert_eq!(value[0]["id"], "llama3.2:3b");
        assert_eq!(value[0]["active"], true);
    }

    #[test]
    fn test_models_yaml() {
        let output = OutputFormatter::new(OutputFormat::Yaml)
            .format_models(&listing())
            .unwrap();
        assert!(output.contains("id: llama3.2:3b"));
    }

    #[test]
    fn test_inference_human() {
        let formatter = OutputFormatter::new(OutputFormat::Human);
        let ok = InferenceResponse {
            success: true,
            response: "4\n".to_string(),
            model_used: "llama3.2:3b".to_string(),
            processing_time: 0.5,
            tokens_per_second: 2.0,
            error: None,
            error_kind: None,
        };
        let output = formatter.format_inference(&ok).unwrap();
        assert!(output.starts_with("4\n"));
        assert!(output.contains("llama3.2:3b in 0.50s"));

        let failed = InferenceResponse {
            success: false,
            error: Some("local inference failed: boom".to_string()),
            ..ok
        };
        assert!(formatter
            .format_inference(&failed)
            .unwrap()
            .contains("boom"));
    }

    #[test]
    fn test_download_human() {
        let formatter = OutputFormatter::new(OutputFormat::Human);
        assert!(formatter
            .format_download("A", &DownloadResponse::ok())
            .unwrap()
            .contains("A is ready"));
        assert!(formatter
            .format_download("A", &DownloadResponse::failed("disk full"))
            .unwrap()
            .contains("disk full"));
    }

    #[test]
    fn test_hardware_human() {
        let snapshot = HardwareSnapshot::new(32.0, 20.0, Some("RTX 4090".to_string()), Some(24.0));
        let output = OutputFormatter::new(OutputFormat::Human)
            .format_hardware(&snapshot)
            .unwrap();
        assert!(output.contains("RTX 4090 (24.0GB)"));
        assert!(output.contains("20.0GB available of 32.0GB"));
    }
}
