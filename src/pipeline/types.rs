//! Core types for pipeline domain
//!
//! This module contains the status enums and the per-stage and per-run
//! result records produced by the engine.

#![allow(clippy::must_use_candidate)]

use super::options::duration_format;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

/// Possible outcomes of a stage execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    /// Execution completed successfully
    Success,
    /// Execution failed
    Failure,
    /// Execution completed with unstable state
    Unstable,
    /// Execution was skipped
    Skipped,
}

impl StageStatus {
    /// Returns true if result is successful
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    /// Returns true if result is a failure
    #[must_use]
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failure)
    }

    /// Returns true if result is unstable
    #[must_use]
    pub fn is_unstable(&self) -> bool {
        matches!(self, Self::Unstable)
    }

    /// Returns true if result is skipped
    #[must_use]
    pub fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped)
    }

    /// Severity rank used for aggregation. Skipped stages rank with success.
    fn severity(self) -> u8 {
        match self {
            Self::Success | Self::Skipped => 0,
            Self::Unstable => 1,
            Self::Failure => 2,
        }
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "SUCCESS"),
            Self::Failure => write!(f, "FAILURE"),
            Self::Unstable => write!(f, "UNSTABLE"),
            Self::Skipped => write!(f, "SKIPPED"),
        }
    }
}

/// Terminal status of a whole pipeline run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineStatus {
    /// Every executed stage succeeded
    Success,
    /// No stage failed but at least one was unstable
    Unstable,
    /// At least one executed stage failed
    Failure,
    /// The global timeout interrupted the run
    Aborted,
}

impl PipelineStatus {
    /// Folds stage statuses into an overall status. Skipped stages do not
    /// contribute; an all-skipped run is a success.
    pub fn aggregate<'a>(statuses: impl IntoIterator<Item = &'a StageStatus>) -> Self {
        let worst = statuses
            .into_iter()
            .copied()
            .max_by_key(|s| s.severity())
            .unwrap_or(StageStatus::Success);

        match worst {
            StageStatus::Failure => Self::Failure,
            StageStatus::Unstable => Self::Unstable,
            StageStatus::Success | StageStatus::Skipped => Self::Success,
        }
    }

    /// Status seen by post hooks. An aborted run fires `failure` hooks.
    pub fn as_stage_status(self) -> StageStatus {
        match self {
            Self::Success => StageStatus::Success,
            Self::Unstable => StageStatus::Unstable,
            Self::Failure | Self::Aborted => StageStatus::Failure,
        }
    }

    /// Returns true for `Failure` and `Aborted`
    pub fn is_failure(self) -> bool {
        matches!(self, Self::Failure | Self::Aborted)
    }
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "SUCCESS"),
            Self::Unstable => write!(f, "UNSTABLE"),
            Self::Failure => write!(f, "FAILURE"),
            Self::Aborted => write!(f, "ABORTED"),
        }
    }
}

/// Classification of a stage failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// An external tool exited non-zero
    CommandFailure,
    /// A command, poll or the global budget ran out
    Timeout,
    /// The run was interrupted from outside
    Cancelled,
    /// The analysis server rejected the submitted analysis
    QualityGateRejected,
    /// Uploading an artifact failed
    PublishFailure,
    /// A required input file was missing
    NotFound,
    /// A secret could not be resolved
    Credential,
    /// Local filesystem error
    Io,
    /// The definition itself was invalid
    Validation,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::CommandFailure => "COMMAND_FAILURE",
            Self::Timeout => "TIMEOUT",
            Self::Cancelled => "CANCELLED",
            Self::QualityGateRejected => "QUALITY_GATE_REJECTED",
            Self::PublishFailure => "PUBLISH_FAILURE",
            Self::NotFound => "NOT_FOUND",
            Self::Credential => "CREDENTIAL",
            Self::Io => "IO",
            Self::Validation => "VALIDATION",
        };
        f.write_str(name)
    }
}

/// A file produced or consumed by a stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactReference {
    /// Resolved file path (or upload URL for published artifacts)
    pub path: PathBuf,
    /// Human-readable label
    pub label: String,
}

impl ArtifactReference {
    /// Creates a new artifact reference
    pub fn new(path: impl Into<PathBuf>, label: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            label: label.into(),
        }
    }
}

impl fmt::Display for ArtifactReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.path.display(), self.label)
    }
}

/// Record of a single stage execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Stage name
    pub stage: String,
    /// Final status
    pub status: StageStatus,
    /// Exit code of the last external command the stage ran
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Failure classification, set when the body failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
    /// Human-readable failure message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Artifacts archived or published by the stage, in order
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub artifacts: Vec<ArtifactReference>,
    /// Errors raised by post hooks
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub post_failures: Vec<String>,
    /// Wall-clock duration of body and post phases
    #[serde(with = "duration_format")]
    pub duration: Duration,
}

impl ExecutionResult {
    /// Result for a stage whose condition was not satisfied
    pub fn skipped(stage: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            status: StageStatus::Skipped,
            exit_code: None,
            failure: None,
            message: None,
            artifacts: Vec::new(),
            post_failures: Vec::new(),
            duration: Duration::ZERO,
        }
    }
}

/// Terminal, immutable record of a pipeline run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineResult {
    /// Unique run id
    pub run_id: Uuid,
    /// Pipeline name
    pub pipeline: String,
    /// Sequential run number
    pub run_number: u64,
    /// Overall status
    pub status: PipelineStatus,
    /// Failure classification of the stage that decided the status
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
    /// Per-stage results in declaration order (stages after a halt are absent)
    pub stages: Vec<ExecutionResult>,
    /// Artifacts archived by the cleanup block
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub cleanup_artifacts: Vec<ArtifactReference>,
    /// Best-effort cleanup failures; never affect `status`
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub cleanup_errors: Vec<String>,
    /// Start time
    pub started_at: DateTime<Utc>,
    /// Total duration
    #[serde(with = "duration_format")]
    pub duration: Duration,
}

impl PipelineResult {
    /// Looks up the result of a stage by name
    pub fn stage(&self, name: &str) -> Option<&ExecutionResult> {
        self.stages.iter().find(|s| s.stage == name)
    }

    /// All artifacts produced during the run, stages first, then cleanup
    pub fn artifacts(&self) -> impl Iterator<Item = &ArtifactReference> {
        self.stages
            .iter()
            .flat_map(|s| s.artifacts.iter())
            .chain(self.cleanup_artifacts.iter())
    }
}

/// Trait for types that can be validated
#[allow(clippy::missing_errors_doc)]
pub trait Validate {
    /// Type of validation error
    type Error;

    /// Validates this type
    fn validate(&self) -> std::result::Result<(), Self::Error>;
}
