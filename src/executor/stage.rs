//! Stage execution
//!
//! A stage runs in two phases. The body runs its steps in order and stops
//! at the first error; the post phase then runs the hooks matching the body
//! outcome. Stages whose condition is not met are skipped outright: no body,
//! no hooks, no artifacts.
//!
//! The body is bounded by the run deadline and the run's cancellation
//! signal. When either fires the body future is dropped (child processes
//! are killed with it) and the hooks still run within the cleanup grace
//! period.

use super::command::{CommandRequest, CommandRunner, mask_secrets};
use super::credentials::{ConfiguredSecretStore, Credential, SecretStore};
use super::health::{HealthPoller, HealthProbe, HttpProbe};
use super::publisher::{ArtifactPublisher, ArtifactUploader, HttpUploader};
use super::quality_gate::{DEFAULT_REPORT_TASK_FILE, GateApi, QualityGateClient};
use super::workspace::RunWorkspace;
use crate::infrastructure::DockerCli;
use crate::pipeline::{
    ArtifactReference, Environment, ExecutionResult, PipelineError, PipelineStatus,
    PostCondition, Stage, StageStatus, Step, StepType,
};
use futures::FutureExt;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Stand-in deadline for timeouts too large to represent as an instant
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// External systems a run talks to
#[derive(Clone)]
pub struct Collaborators {
    /// Runs shell steps and container CLI calls
    pub runner: Arc<dyn CommandRunner>,
    /// Probes health endpoints
    pub probe: Arc<dyn HealthProbe>,
    /// Analysis server; quality gates fail when absent
    pub gate_api: Option<Arc<dyn GateApi>>,
    /// Artifact repository uploads
    pub uploader: Arc<dyn ArtifactUploader>,
    /// Credential lookup
    pub secrets: Arc<dyn SecretStore>,
}

impl Collaborators {
    /// HTTP-backed collaborators around the given runner, with no analysis
    /// server and no declared credentials
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            probe: Arc::new(HttpProbe::new()),
            gate_api: None,
            uploader: Arc::new(HttpUploader::new()),
            secrets: Arc::new(ConfiguredSecretStore::default()),
        }
    }

    #[must_use]
    pub fn with_probe(mut self, probe: Arc<dyn HealthProbe>) -> Self {
        self.probe = probe;
        self
    }

    #[must_use]
    pub fn with_gate_api(mut self, api: Arc<dyn GateApi>) -> Self {
        self.gate_api = Some(api);
        self
    }

    #[must_use]
    pub fn with_uploader(mut self, uploader: Arc<dyn ArtifactUploader>) -> Self {
        self.uploader = uploader;
        self
    }

    #[must_use]
    pub fn with_secrets(mut self, secrets: Arc<dyn SecretStore>) -> Self {
        self.secrets = secrets;
        self
    }
}

/// `now + after`, saturating far in the future instead of overflowing
pub fn deadline_after(now: Instant, after: Duration) -> Instant {
    now.checked_add(after)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

/// Work cut short by the global timeout or a cancellation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interrupted;

/// Time limits of a run, plus its cancellation signal
#[derive(Debug, Clone)]
pub struct RunBudget {
    /// When the global timeout fires
    pub deadline: Instant,
    /// The global timeout itself
    pub timeout: Duration,
    /// Extra time granted to hooks and cleanup after an abort
    pub grace: Duration,
    cancel: Option<watch::Receiver<bool>>,
}

impl RunBudget {
    /// Budget whose global timeout starts counting now
    pub fn starting_now(timeout: Duration, grace: Duration) -> Self {
        Self {
            deadline: deadline_after(Instant::now(), timeout),
            timeout,
            grace,
            cancel: None,
        }
    }

    /// Also interrupts the run once `cancel` holds `true`
    #[must_use]
    pub fn with_cancellation(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Returns true once the run has been cancelled
    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Returns true once the global timeout has fired or the run was
    /// cancelled
    pub fn expired(&self) -> bool {
        self.is_cancelled() || Instant::now() >= self.deadline
    }

    /// Error recorded for interrupted work
    pub fn abort_error(&self) -> PipelineError {
        if self.is_cancelled() {
            PipelineError::Cancelled
        } else {
            PipelineError::Timeout {
                operation: "pipeline".to_string(),
                duration: self.timeout,
            }
        }
    }

    /// Deadline for hooks that start after an abort
    pub fn grace_deadline(&self) -> Instant {
        deadline_after(Instant::now(), self.grace)
    }

    /// Resolves when the deadline passes or the run is cancelled. A dropped
    /// cancellation sender never cancels.
    pub async fn interrupted(&self) {
        let mut cancel = self.cancel.clone();
        let cancelled = async {
            match cancel.as_mut() {
                Some(rx) => rx.wait_for(|cancelled| *cancelled).await.is_ok(),
                None => false,
            }
        };
        tokio::select! {
            () = tokio::time::sleep_until(self.deadline) => {}
            true = cancelled => {}
        }
    }

    /// Runs `work` unless the run is interrupted first
    ///
    /// # Errors
    ///
    /// Returns [`Interrupted`] when the deadline or a cancellation wins; the
    /// work future is dropped.
    pub async fn bound<F: Future>(&self, work: F) -> Result<F::Output, Interrupted> {
        tokio::select! {
            output = work => Ok(output),
            () = self.interrupted() => Err(Interrupted),
        }
    }
}

fn interruption(budget: &RunBudget) -> &'static str {
    if budget.is_cancelled() {
        "interrupted by cancellation"
    } else {
        "interrupted by timeout"
    }
}

/// Outcome of [`StageExecutor::execute`]
#[derive(Debug, Clone)]
pub struct StageRun {
    /// Stage record
    pub result: ExecutionResult,
    /// The global timeout fired while the stage ran
    pub aborted: bool,
}

/// Outcome of the pipeline-level post block
#[derive(Debug, Clone, Default)]
pub struct CleanupOutcome {
    /// Artifacts archived by cleanup hooks
    pub artifacts: Vec<ArtifactReference>,
    /// Hook failures, one message each
    pub errors: Vec<String>,
}

/// Scope of nested steps: overrides and credential bindings live here and
/// disappear when the nesting step returns
#[derive(Debug, Clone)]
struct StepFrame {
    overrides: HashMap<String, String>,
    cwd: PathBuf,
    masked: Vec<String>,
}

/// What a stage accumulates while its steps run
#[derive(Debug, Default)]
struct StageRecord {
    artifacts: Vec<ArtifactReference>,
    exit_code: Option<i32>,
    unstable: bool,
}

/// Runs single stages against a run workspace
#[derive(Clone)]
pub struct StageExecutor {
    runner: Arc<dyn CommandRunner>,
    poller: HealthPoller,
    gate: QualityGateClient,
    publisher: ArtifactPublisher,
    secrets: Arc<dyn SecretStore>,
    docker: DockerCli,
    workspace: Arc<RunWorkspace>,
}

impl StageExecutor {
    /// Creates an executor for one run
    pub fn new(collaborators: &Collaborators, workspace: Arc<RunWorkspace>) -> Self {
        let gate = QualityGateClient::new(collaborators.gate_api.clone())
            .with_report_file(workspace.workspace().join(DEFAULT_REPORT_TASK_FILE));
        Self {
            runner: Arc::clone(&collaborators.runner),
            poller: HealthPoller::new(Arc::clone(&collaborators.probe)),
            gate,
            publisher: ArtifactPublisher::new(Arc::clone(&collaborators.uploader)),
            secrets: Arc::clone(&collaborators.secrets),
            docker: DockerCli::new(Arc::clone(&collaborators.runner)),
            workspace,
        }
    }

    /// Sets the pause between analysis server polls
    #[must_use]
    pub fn with_gate_poll_interval(mut self, interval: Duration) -> Self {
        self.gate = self.gate.with_poll_interval(interval);
        self
    }

    /// Sets the scanner report-task file, relative to the workspace
    #[must_use]
    pub fn with_report_task_file(mut self, path: impl AsRef<Path>) -> Self {
        self.gate = self
            .gate
            .with_report_file(self.workspace.workspace().join(path));
        self
    }

    /// Run workspace
    pub fn workspace(&self) -> &RunWorkspace {
        &self.workspace
    }

    fn root_frame(&self) -> StepFrame {
        StepFrame {
            overrides: HashMap::new(),
            cwd: self.workspace.workspace().to_path_buf(),
            masked: Vec::new(),
        }
    }

    /// Runs `stage`: condition, body, then post hooks.
    pub async fn execute(&self, stage: &Stage, env: &Arc<Environment>, budget: &RunBudget) -> StageRun {
        if !stage.is_eligible(env) {
            tracing::info!(stage = %stage.name, "Stage skipped, condition not met");
            return StageRun {
                result: ExecutionResult::skipped(&stage.name),
                aborted: false,
            };
        }

        tracing::info!(stage = %stage.name, steps = stage.steps.len(), "Stage started");
        let start = std::time::Instant::now();
        let frame = self.root_frame();
        let mut record = StageRecord::default();

        let body = budget
            .bound(self.run_steps(&stage.steps, env, &frame, &mut record))
            .await;

        let (body_status, error, mut aborted) = match body {
            Ok(Ok(())) if record.unstable => (StageStatus::Unstable, None, false),
            Ok(Ok(())) => (StageStatus::Success, None, false),
            Ok(Err(e)) => (StageStatus::Failure, Some(e), false),
            Err(Interrupted) => {
                tracing::error!(stage = %stage.name, "Run interrupted, stage aborted");
                (StageStatus::Failure, Some(budget.abort_error()), true)
            }
        };
        if let Some(e) = &error {
            tracing::error!(stage = %stage.name, error = %e, "Stage body failed");
        }

        // The reported exit code is the body's, not a hook's
        let exit_code = error
            .as_ref()
            .and_then(PipelineError::exit_code)
            .or(record.exit_code);

        let post_failures = self
            .run_post_block(&stage.post, body_status, env, budget, &mut aborted, &mut record)
            .await;

        let status = if body_status.is_success() && !post_failures.is_empty() {
            StageStatus::Unstable
        } else {
            body_status
        };

        let duration = start.elapsed();
        tracing::info!(
            stage = %stage.name,
            status = %status,
            duration_ms = duration.as_millis() as u64,
            "Stage completed"
        );

        StageRun {
            result: ExecutionResult {
                stage: stage.name.clone(),
                status,
                exit_code,
                failure: error.as_ref().map(PipelineError::kind),
                message: error.map(|e| e.to_string()),
                artifacts: record.artifacts,
                post_failures,
                duration,
            },
            aborted,
        }
    }

    /// Runs the matching hooks in declaration order. A failing hook does not
    /// stop the ones after it. Returns the hook failures.
    ///
    /// Hooks are bounded by the run; if it is interrupted here `aborted` is
    /// set and the remaining hooks get the grace period instead.
    async fn run_post_block(
        &self,
        hooks: &[PostCondition],
        owner_status: StageStatus,
        env: &Environment,
        budget: &RunBudget,
        aborted: &mut bool,
        record: &mut StageRecord,
    ) -> Vec<String> {
        let mut failures = Vec::new();
        let mut grace = aborted.then(|| budget.grace_deadline());
        let frame = self.root_frame();

        for hook in hooks.iter().filter(|h| h.should_execute(owner_status)) {
            tracing::debug!(hook = hook.label(), "Running post hook");
            match self
                .bounded_hook(hook.steps(), env, &frame, record, budget, &mut grace)
                .await
            {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(hook = hook.label(), error = %e, "Post hook failed");
                    failures.push(format!("{}: {e}", hook.label()));
                }
                Err(Interrupted) => {
                    tracing::warn!(hook = hook.label(), "Post hook interrupted");
                    failures.push(format!("{}: {}", hook.label(), interruption(budget)));
                    *aborted = true;
                }
            }
        }

        failures
    }

    /// Runs the pipeline-level post block once.
    ///
    /// Hooks share the run's remaining budget. After an abort, or once a hook
    /// is interrupted, the remaining hooks get the grace period instead.
    /// Failures are collected, never propagated.
    pub async fn run_cleanup(
        &self,
        hooks: &[PostCondition],
        status: PipelineStatus,
        env: &Arc<Environment>,
        budget: &RunBudget,
        aborted: bool,
    ) -> CleanupOutcome {
        let owner_status = status.as_stage_status();
        let frame = self.root_frame();
        let mut record = StageRecord::default();
        let mut errors = Vec::new();
        let mut grace = aborted.then(|| budget.grace_deadline());

        for hook in hooks.iter().filter(|h| h.should_execute(owner_status)) {
            tracing::info!(hook = hook.label(), "Running cleanup hook");
            match self
                .bounded_hook(hook.steps(), env, &frame, &mut record, budget, &mut grace)
                .await
            {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(hook = hook.label(), error = %e, "Cleanup hook failed");
                    errors.push(format!("{}: {e}", hook.label()));
                }
                Err(Interrupted) => {
                    tracing::warn!(hook = hook.label(), "Cleanup hook interrupted");
                    errors.push(format!("{}: {}", hook.label(), interruption(budget)));
                }
            }
        }

        CleanupOutcome {
            artifacts: record.artifacts,
            errors,
        }
    }

    /// Runs hook steps until the run is interrupted, or until `grace` once it
    /// is set. The first interruption starts the grace period.
    async fn bounded_hook(
        &self,
        steps: &[Step],
        env: &Environment,
        frame: &StepFrame,
        record: &mut StageRecord,
        budget: &RunBudget,
        grace: &mut Option<Instant>,
    ) -> Result<Result<(), PipelineError>, Interrupted> {
        let work = self.run_steps(steps, env, frame, record);
        let outcome = match *grace {
            Some(limit) => tokio::time::timeout_at(limit, work)
                .await
                .map_err(|_| Interrupted),
            None => budget.bound(work).await,
        };
        if outcome.is_err() && grace.is_none() {
            *grace = Some(budget.grace_deadline());
        }
        outcome
    }

    fn run_steps<'a>(
        &'a self,
        steps: &'a [Step],
        env: &'a Environment,
        frame: &'a StepFrame,
        record: &'a mut StageRecord,
    ) -> BoxFuture<'a, Result<(), PipelineError>> {
        async move {
            for step in steps {
                self.run_step(step, env, frame, record).await?;
            }
            Ok(())
        }
        .boxed()
    }

    fn run_step<'a>(
        &'a self,
        step: &'a Step,
        env: &'a Environment,
        frame: &'a StepFrame,
        record: &'a mut StageRecord,
    ) -> BoxFuture<'a, Result<(), PipelineError>> {
        async move {
            let label = step.name.as_deref().unwrap_or(step.step_type.kind());
            tracing::debug!(step = label, "Running step");
            match step.timeout {
                Some(limit) => tokio::time::timeout(
                    limit,
                    self.run_step_type(&step.step_type, env, frame, record),
                )
                .await
                .map_err(|_| PipelineError::Timeout {
                    operation: format!("step '{label}'"),
                    duration: limit,
                })?,
                None => self.run_step_type(&step.step_type, env, frame, record).await,
            }
        }
        .boxed()
    }

    async fn run_step_type(
        &self,
        step: &StepType,
        env: &Environment,
        frame: &StepFrame,
        record: &mut StageRecord,
    ) -> Result<(), PipelineError> {
        match step {
            StepType::Shell {
                command,
                tolerated_exit_codes,
            } => {
                let request = CommandRequest::new(command.as_str())
                    .in_dir(&frame.cwd)
                    .envs(&frame.overrides)
                    .masking(frame.masked.iter().cloned());
                let output = self.runner.run(env, request).await?;
                record.exit_code = Some(output.exit_code);

                if output.is_success() {
                    Ok(())
                } else if tolerated_exit_codes.contains(&output.exit_code) {
                    tracing::warn!(
                        exit_code = output.exit_code,
                        "Command exited with a tolerated code, marking stage unstable"
                    );
                    record.unstable = true;
                    Ok(())
                } else {
                    output.check().map(|_| ())
                }
            }

            StepType::Echo { message } => {
                let merged = env.overlay(&frame.overrides);
                let mut secrets = frame.masked.clone();
                secrets.extend(merged.sensitive_values());
                let text = mask_secrets(&merged.resolve(message), &secrets);
                tracing::info!(target: "shipline::output", "{text}");
                Ok(())
            }

            StepType::Dir { path, steps } => {
                let resolved = env.overlay(&frame.overrides).resolve(path);
                let cwd = frame.cwd.join(resolved);
                tokio::fs::create_dir_all(&cwd).await?;
                let nested = StepFrame {
                    cwd,
                    ..frame.clone()
                };
                self.run_steps(steps, env, &nested, record).await
            }

            StepType::Timeout { duration, step } => {
                let label = step.step_type.kind();
                tokio::time::timeout(*duration, self.run_step(step, env, frame, record))
                    .await
                    .map_err(|_| PipelineError::Timeout {
                        operation: format!("{label} step"),
                        duration: *duration,
                    })?
            }

            StepType::WithCredentials {
                credential_id,
                username_variable,
                password_variable,
                steps,
            } => {
                let merged = env.overlay(&frame.overrides);
                let credential = self.secrets.resolve(credential_id, &merged)?;
                let mut nested = frame.clone();
                match &credential {
                    Credential::UsernamePassword { username, password } => {
                        if let Some(var) = username_variable {
                            nested.overrides.insert(var.clone(), username.clone());
                        }
                        nested
                            .overrides
                            .insert(password_variable.clone(), password.clone());
                    }
                    Credential::Token(token) => {
                        nested
                            .overrides
                            .insert(password_variable.clone(), token.clone());
                    }
                }
                nested.masked.extend(credential.masked_values());
                tracing::debug!(credential_id = %credential_id, "Bound credential");
                self.run_steps(steps, env, &nested, record).await
            }

            StepType::HealthCheck {
                url,
                max_attempts,
                interval,
            } => {
                let url = env.overlay(&frame.overrides).resolve(url);
                if self.poller.poll(&url, *max_attempts, *interval).await {
                    Ok(())
                } else {
                    Err(PipelineError::Timeout {
                        operation: format!("health check of {url}"),
                        duration: interval.saturating_mul(*max_attempts),
                    })
                }
            }

            StepType::QualityGate {
                project_key,
                poll_timeout,
            } => {
                let project_key = env.overlay(&frame.overrides).resolve(project_key);
                let status = self.gate.await_gate(&project_key, *poll_timeout).await;
                if status.is_ok() {
                    Ok(())
                } else {
                    Err(PipelineError::QualityGateRejected {
                        project_key,
                        status: status.to_string(),
                    })
                }
            }

            StepType::Publish {
                pattern,
                destination,
                credential_id,
            } => {
                let merged = env.overlay(&frame.overrides);
                let pattern = frame.cwd.join(merged.resolve(pattern));
                let destination = merged.resolve(destination);
                let credential = self.secrets.resolve(credential_id, &merged)?;
                let reference = self
                    .publisher
                    .publish(&pattern.to_string_lossy(), &destination, &credential)
                    .await?;
                record.artifacts.push(reference);
                Ok(())
            }

            StepType::Archive {
                pattern,
                label,
                allow_empty,
            } => {
                let pattern = env.overlay(&frame.overrides).resolve(pattern);
                let archived = self.workspace.archive(&frame.cwd, &pattern, label)?;
                if archived.is_empty() && !allow_empty {
                    return Err(PipelineError::NotFound { pattern });
                }
                tracing::info!(pattern = %pattern, files = archived.len(), "Archived artifacts");
                record.artifacts.extend(archived);
                Ok(())
            }

            StepType::RemoveContainer { container } => {
                let merged = env.overlay(&frame.overrides);
                let container = merged.resolve(container);
                self.docker.remove_if_exists(&merged, &container).await?;
                Ok(())
            }
        }
    }
}
