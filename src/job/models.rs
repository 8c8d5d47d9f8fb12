use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::JobError;

/// Identifies one connected observer for the lifetime of its connection.
pub type ObserverId = uuid::Uuid;

/// Parameters handed to the worker for one run. Immutable once started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobConfig {
    pub charset: String,
    pub min: i64,
    pub max: i64,
}

impl JobConfig {
    pub fn new(charset: impl Into<String>, min: i64, max: i64) -> Self {
        Self {
            charset: charset.into(),
            min,
            max,
        }
    }

    /// Reject configurations the worker cannot run.
    pub fn validate(&self) -> Result<(), JobError> {
        if self.charset.is_empty() {
            return Err(JobError::InvalidConfig("charset must not be empty".into()));
        }
        if self.min < 0 || self.max < 0 {
            return Err(JobError::InvalidConfig(format!(
                "lengths must be non-negative (min={}, max={})",
                self.min, self.max
            )));
        }
        if self.min > self.max {
            return Err(JobError::InvalidConfig(format!(
                "min ({}) must not exceed max ({})",
                self.min, self.max
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Idle,
    Running,
    Stopped,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Idle => "idle",
            JobState::Running => "running",
            JobState::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One of the output files the worker writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    Txt,
    Md,
    Pdf,
}

impl ArtifactKind {
    pub const ALL: [ArtifactKind; 3] = [ArtifactKind::Txt, ArtifactKind::Md, ArtifactKind::Pdf];

    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Txt => "txt",
            ArtifactKind::Md => "md",
            ArtifactKind::Pdf => "pdf",
        }
    }

    /// Fixed file name inside the artifact directory.
    pub fn file_name(&self) -> &'static str {
        match self {
            ArtifactKind::Txt => "output.txt",
            ArtifactKind::Md => "output.md",
            ArtifactKind::Pdf => "output.pdf",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            ArtifactKind::Txt => "text/plain; charset=utf-8",
            ArtifactKind::Md => "text/markdown; charset=utf-8",
            ArtifactKind::Pdf => "application/pdf",
        }
    }
}

impl std::str::FromStr for ArtifactKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "txt" => Ok(ArtifactKind::Txt),
            "md" => Ok(ArtifactKind::Md),
            "pdf" => Ok(ArtifactKind::Pdf),
            _ => anyhow::bail!("Invalid file type '{}'. Valid values: txt, md, pdf", s),
        }
    }
}

/// Human-readable sizes of the three artifacts at one instant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSizes {
    pub txt: String,
    pub md: String,
    pub pdf: String,
}

impl Default for FileSizes {
    fn default() -> Self {
        Self {
            txt: "0 B".to_string(),
            md: "0 B".to_string(),
            pdf: "0 B".to_string(),
        }
    }
}

impl FileSizes {
    pub fn set(&mut self, kind: ArtifactKind, value: String) {
        match kind {
            ArtifactKind::Txt => self.txt = value,
            ArtifactKind::Md => self.md = value,
            ArtifactKind::Pdf => self.pdf = value,
        }
    }
}

/// Record of the most recently finished run. Kept in memory only.
#[derive(Debug, Clone, Serialize)]
pub struct JobOutcome {
    pub run_id: u64,
    pub config: JobConfig,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// `None` when the worker was ended by a signal.
    pub exit_code: Option<i32>,
    pub stop_requested: bool,
    pub last_count: Option<u64>,
}

/// Point-in-time view of the job slot, served by `GET /api/job`.
#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    pub state: JobState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<JobConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_outcome: Option<JobOutcome>,
}
