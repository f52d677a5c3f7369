//! Pipeline execution layer
//!
//! This module contains the collaborator seams (commands, health probes, the
//! analysis server, artifact uploads, secrets), the stage executor and the
//! engine that drives a run.

mod command;
mod credentials;
mod engine;
mod health;
mod publisher;
mod quality_gate;
mod stage;
mod workspace;

#[cfg(test)]
pub(crate) mod testing;

pub use command::{
    CommandError, CommandOutput, CommandRequest, CommandRunner, MASK, ShellRunner, mask_secrets,
    quote,
};
pub use credentials::{
    ConfiguredSecretStore, Credential, CredentialError, CredentialSpec, SecretStore,
};
pub use engine::{
    CHECKOUT_STAGE, EngineError, EngineSettings, PipelineEngine, RunRequest,
};
pub use health::{
    HEALTH_ATTEMPTS, HEALTH_INTERVAL, HealthPoller, HealthProbe, HttpProbe, REACHABILITY_ATTEMPTS,
    REACHABILITY_INTERVAL,
};
pub use publisher::{
    ArtifactPublisher, ArtifactUploader, HttpUploader, PublishError, is_snapshot, select_artifact,
};
pub use quality_gate::{
    DEFAULT_REPORT_TASK_FILE, GateApi, GateError, GateStatus, QualityGateClient, SonarQubeApi,
    TaskState, read_task_id,
};
pub use stage::{
    CleanupOutcome, Collaborators, Interrupted, RunBudget, StageExecutor, StageRun, deadline_after,
};
pub use workspace::{RunWorkspace, glob_files};
