//! Error types for pipeline domain

use super::types::FailureKind;
use thiserror::Error;

/// Errors that can occur while a stage body or post hook runs.
///
/// Every variant maps onto one [`FailureKind`], which is what ends up in the
/// stage's [`ExecutionResult`](super::ExecutionResult).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    /// Validation failed with specified reason
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// Command execution failed
    #[error("Command failed with exit code {code}: {stderr}")]
    CommandFailed {
        /// Exit code returned by the command.
        code: i32,
        /// Tail of the standard error output from the command.
        stderr: String,
    },

    /// Timeout exceeded
    #[error("{operation} timed out after {duration:?}")]
    Timeout {
        /// What was being waited on (command, health check, quality gate).
        operation: String,
        /// Budget that was exhausted.
        duration: std::time::Duration,
    },

    /// The run was interrupted before it finished
    #[error("run cancelled")]
    Cancelled,

    /// The analysis server returned a verdict other than OK
    #[error("Quality gate for '{project_key}' rejected the analysis: {status}")]
    QualityGateRejected {
        /// Project key the analysis belongs to.
        project_key: String,
        /// Verdict returned by the gate.
        status: String,
    },

    /// No file matched an artifact pattern
    #[error("No files match pattern '{pattern}'")]
    NotFound {
        /// The glob pattern that matched nothing.
        pattern: String,
    },

    /// Uploading an artifact failed
    #[error("Publishing to {destination} failed: {reason}")]
    PublishFailed {
        /// Upload target URL.
        destination: String,
        /// Transport or server error.
        reason: String,
    },

    /// A credential could not be resolved
    #[error("Credential error: {0}")]
    Credential(String),

    /// IO error occurred
    #[error("IO error: {0}")]
    Io(String),

    /// Pipeline definition could not be parsed
    #[error("Parse error: {0}")]
    Parse(String),
}

impl PipelineError {
    /// Classifies this error for the stage result.
    #[must_use]
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Validation(_) | Self::Parse(_) => FailureKind::Validation,
            Self::CommandFailed { .. } => FailureKind::CommandFailure,
            Self::Timeout { .. } => FailureKind::Timeout,
            Self::Cancelled => FailureKind::Cancelled,
            Self::QualityGateRejected { .. } => FailureKind::QualityGateRejected,
            Self::NotFound { .. } => FailureKind::NotFound,
            Self::PublishFailed { .. } => FailureKind::PublishFailure,
            Self::Credential(_) => FailureKind::Credential,
            Self::Io(_) => FailureKind::Io,
        }
    }

    /// Exit code carried by this error, if it came from an external command.
    #[must_use]
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::CommandFailed { code, .. } => Some(*code),
            _ => None,
        }
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_yaml::Error> for PipelineError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Parse(err.to_string())
    }
}

/// Validation errors for pipeline components
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Name cannot be empty
    #[error("Name cannot be empty")]
    EmptyName,

    /// Name too long
    #[error("Name too long: max {max} characters, got {len}")]
    NameTooLong {
        /// Maximum allowed length.
        max: usize,
        /// Actual length of the name.
        len: usize,
    },

    /// Invalid characters in name
    #[error("Invalid characters in name: '{name}'")]
    InvalidNameChars {
        /// The invalid name.
        name: String,
    },

    /// Pipeline must have at least one stage
    #[error("Pipeline must have at least one stage")]
    EmptyPipeline,

    /// Stage must have at least one step
    #[error("Stage '{stage}' must have at least one step")]
    EmptyStage {
        /// Name of the empty stage.
        stage: String,
    },

    /// Two stages share a name
    #[error("Stage name '{stage}' is declared more than once")]
    DuplicateStage {
        /// The duplicated name.
        stage: String,
    },

    /// Invalid timeout value
    #[error("Invalid timeout: must be positive, got {value}")]
    InvalidTimeout {
        /// The invalid timeout value in seconds.
        value: u64,
    },

    /// Invalid attempt count
    #[error("Invalid attempt count: must be positive, got {value}")]
    InvalidAttempts {
        /// The invalid count.
        value: u32,
    },

    /// Condition is malformed
    #[error("Invalid condition: {0}")]
    InvalidCondition(String),

    /// A step is missing a required field
    #[error("Invalid step: {0}")]
    InvalidStep(String),
}
