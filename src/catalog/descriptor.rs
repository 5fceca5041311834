//! Catalog entry types

use crate::hardware::ComputeTier;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Tag carried by models that can serve any task type
pub const GENERAL_TAG: &str = "general";

/// Where a model's artifact stands on this machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DownloadState {
    #[default]
    NotDownloaded,
    Downloading,
    Ready,
    Failed,
}

impl DownloadState {
    /// Whether `self -> next` is an accepted transition
    ///
    /// `Failed -> Downloading` is the caller-driven retry edge.
    pub fn can_transition_to(self, next: DownloadState) -> bool {
        use DownloadState::*;
        matches!(
            (self, next),
            (NotDownloaded, Downloading)
                | (Failed, Downloading)
                | (Downloading, Ready)
                | (Downloading, Failed)
        )
    }
}

impl fmt::Display for DownloadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DownloadState::NotDownloaded => "NOT_DOWNLOADED",
            DownloadState::Downloading => "DOWNLOADING",
            DownloadState::Ready => "READY",
            DownloadState::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// Kind of work a request asks for
///
/// Unknown task names parse to [`TaskType::Other`], which has no tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", from = "String")]
pub enum TaskType {
    #[default]
    General,
    Coding,
    Creative,
    Technical,
    Analysis,
    Other,
}

impl TaskType {
    pub const ALL: [TaskType; 6] = [
        TaskType::General,
        TaskType::Coding,
        TaskType::Creative,
        TaskType::Technical,
        TaskType::Analysis,
        TaskType::Other,
    ];

    /// Catalog tag matching this task, if any
    pub fn tag(self) -> Option<&'static str> {
        match self {
            TaskType::General => Some(GENERAL_TAG),
            TaskType::Coding => Some("coding"),
            TaskType::Creative => Some("creative"),
            TaskType::Technical => Some("technical"),
            TaskType::Analysis => Some("analysis"),
            TaskType::Other => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        self.tag().unwrap_or("other")
    }
}

impl FromStr for TaskType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let task = match s.trim().to_lowercase().as_str() {
            "" | "general" | "chat" => TaskType::General,
            "coding" | "code" => TaskType::Coding,
            "creative" | "writing" => TaskType::Creative,
            "technical" => TaskType::Technical,
            "analysis" | "analytical" => TaskType::Analysis,
            _ => TaskType::Other,
        };
        Ok(task)
    }
}

impl From<String> for TaskType {
    fn from(s: String) -> Self {
        match s.parse() {
            Ok(task) => task,
            Err(never) => match never {},
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A model known to the catalog
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    /// Unique id, also the name the local backend knows the model by
    pub id: String,
    pub display_name: String,
    /// Approximate memory required once loaded
    pub memory_gb: f64,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default = "default_min_tier")]
    pub min_tier: ComputeTier,
    #[serde(default)]
    pub available_locally: bool,
    #[serde(default)]
    pub download_state: DownloadState,
}

fn default_min_tier() -> ComputeTier {
    ComputeTier::CpuOnly
}

impl ModelDescriptor {
    pub fn new(id: impl Into<String>, memory_gb: f64) -> Self {
        let id = id.into();
        Self {
            display_name: id.clone(),
            id,
            memory_gb,
            tags: BTreeSet::new(),
            min_tier: ComputeTier::CpuOnly,
            available_locally: false,
            download_state: DownloadState::NotDownloaded,
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_min_tier(mut self, tier: ComputeTier) -> Self {
        self.min_tier = tier;
        self
    }

    /// Marks the artifact as already present
    pub fn ready(mut self) -> Self {
        self.download_state = DownloadState::Ready;
        self.available_locally = true;
        self
    }

    pub fn is_ready(&self) -> bool {
        self.download_state == DownloadState::Ready
    }

    pub fn is_general(&self) -> bool {
        self.tags.contains(GENERAL_TAG)
    }

    pub fn serves(&self, task: TaskType) -> bool {
        task.tag().is_some_and(|tag| self.tags.contains(tag))
    }

    /// Whether this model can handle `task`, directly or as general fallback
    pub fn suits(&self, task: TaskType) -> bool {
        self.serves(task) || self.is_general()
    }

    pub(crate) fn validate(&self) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("model id must be a non-empty string".to_string());
        }
        if !self.memory_gb.is_finite() || self.memory_gb <= 0.0 {
            return Err(format!(
                "memory_gb for '{}' must be a positive number (got {})",
                self.id, self.memory_gb
            ));
        }
        // Only the download manager may put a model into this state
        if self.download_state == DownloadState::Downloading {
            return Err(format!(
                "'{}' cannot be registered while {}",
                self.id, self.download_state
            ));
        }
        if self.available_locally && !self.is_ready() {
            return Err(format!(
                "'{}' cannot be available locally while {}",
                self.id, self.download_state
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use yare::parameterized;

    #[parameterized(
        start = { DownloadState::NotDownloaded, DownloadState::Downloading, true },
        success = { DownloadState::Downloading, DownloadState::Ready, true },
        failure = { DownloadState::Downloading, DownloadState::Failed, true },
        retry = { DownloadState::Failed, DownloadState::Downloading, true },
        skip_download = { DownloadState::NotDownloaded, DownloadState::Ready, false },
        double_start = { DownloadState::Downloading, DownloadState::Downloading, false },
        from_ready = { DownloadState::Ready, DownloadState::Downloading, false },
        ready_to_failed = { DownloadState::Ready, DownloadState::Failed, false },
    )]
    fn test_download_transitions(from: DownloadState, to: DownloadState, allowed: bool) {
        assert_eq!(from.can_transition_to(to), allowed);
    }

    #[parameterized(
        general = { "general", TaskType::General },
        empty = { "", TaskType::General },
        coding_upper = { "CODING", TaskType::Coding },
        code_alias = { "code", TaskType::Coding },
        creative = { "creative", TaskType::Creative },
        technical = { " technical ", TaskType::Technical },
        analysis = { "analysis", TaskType::Analysis },
        unknown = { "astrology", TaskType::Other },
    )]
    fn test_task_type_parsing(input: &str, expected: TaskType) {
        assert_eq!(input.parse::<TaskType>().unwrap(), expected);
    }

    #[test]
    fn test_task_type_serde_unknown_is_other() {
        let task: TaskType = serde_json::from_str("\"poetry\"").unwrap();
        assert_eq!(task, TaskType::Other);
        assert_eq!(serde_json::to_string(&TaskType::Coding).unwrap(), "\"coding\"");
    }

    #[test]
    fn test_suits_task() {
        let coder = ModelDescriptor::new("coder", 4.0).with_tags(["coding"]);
        assert!(coder.suits(TaskType::Coding));
        assert!(!coder.suits(TaskType::Creative));
        assert!(!coder.suits(TaskType::Other));

        let general = ModelDescriptor::new("general", 4.0).with_tags([GENERAL_TAG]);
        assert!(general.suits(TaskType::Creative));
        assert!(general.suits(TaskType::Other));
    }

    #[test]
    fn test_validate_descriptor() {
        assert!(ModelDescriptor::new("ok", 1.0).validate().is_ok());
        assert!(ModelDescriptor::new(" ", 1.0).validate().is_err());
        assert!(ModelDescriptor::new("zero", 0.0).validate().is_err());
        assert!(ModelDescriptor::new("nan", f64::NAN).validate().is_err());

        let mut inconsistent = ModelDescriptor::new("x", 1.0);
        inconsistent.available_locally = true;
        assert!(inconsistent.validate().is_err());

        let mut mid_download = ModelDescriptor::new("y", 1.0);
        mid_download.download_state = DownloadState::Downloading;
        assert!(mid_download.validate().is_err());

        let mut failed = ModelDescriptor::new("z", 1.0);
        failed.download_state = DownloadState::Failed;
        assert!(failed.validate().is_ok());
    }

    #[test]
    fn test_descriptor_deserialize_defaults() {
        let descriptor: ModelDescriptor = serde_json::from_str(
            r#"{"id": "llama3.2:3b", "display_name": "Llama 3.2 3B", "memory_gb": 3.2}"#,
        )
        .unwrap();
        assert_eq!(descriptor.download_state, DownloadState::NotDownloaded);
        assert_eq!(descriptor.min_tier, ComputeTier::CpuOnly);
        assert!(!descriptor.available_locally);
        assert!(descriptor.tags.is_empty());
    }
}
