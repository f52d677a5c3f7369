//! Prelude module for common imports

// Pipeline definition types
pub use crate::pipeline::condition::Condition;
pub use crate::pipeline::errors::{PipelineError, ValidationError};
pub use crate::pipeline::options::{
    BuildDiscarder, ConcurrencyPolicy, LogColor, PipelineOptions,
};
pub use crate::pipeline::pipeline_def::{Pipeline, PipelineBuilder, ScmSource};
pub use crate::pipeline::post::PostCondition;
pub use crate::pipeline::stage::{Stage, StageBuilder};
pub use crate::pipeline::steps::{Step, StepType};
pub use crate::pipeline::types::{
    ExecutionResult, FailureKind, PipelineResult, PipelineStatus, StageStatus, Validate,
};
pub use crate::pipeline::Environment;

// Execution types
pub use crate::executor::{
    Collaborators, CommandRunner, EngineError, EngineSettings, PipelineEngine, RunRequest,
    ShellRunner,
};

// Reference pipeline
pub use crate::delivery::DeliveryConfig;
