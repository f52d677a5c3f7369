//! Pipeline engine
//!
//! Drives one run from start to terminal status:
//!
//! 1. Validate the definition and take the run lock
//! 2. Prepare the run workspace and assemble the environment
//! 3. Check out sources, when configured
//! 4. Run stages in order, halting at the first failure
//! 5. Run the pipeline post block exactly once
//! 6. Persist `result.json`, record metrics, discard old runs
//!
//! The global timeout covers steps 1 to 5: cleanup only gets what is left
//! of it. Once the timeout fires, or the caller cancels the run, the current
//! stage is aborted, no further stage starts, and the remaining hooks and
//! cleanup run within the grace period.

use super::stage::{Collaborators, Interrupted, RunBudget, StageExecutor};
use super::workspace::RunWorkspace;
use crate::infrastructure::{GitCheckout, LockError, LockRegistry, MetricsCollector, RunLockGuard};
use crate::pipeline::{
    ConcurrencyPolicy, Environment, ExecutionResult, Pipeline, PipelineError,
    PipelineResult, PipelineStatus, StageStatus, Validate, ValidationError,
};
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use uuid::Uuid;

/// Name of the synthetic stage recording a failed checkout
pub const CHECKOUT_STAGE: &str = "Checkout SCM";

/// Errors that prevent a run from producing a [`PipelineResult`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// The definition is invalid
    #[error("invalid pipeline: {0}")]
    Validation(#[from] ValidationError),

    /// Another run holds the lock
    #[error("resource '{resource}' is in use by another run")]
    ResourceConflict {
        /// Lock identity
        resource: String,
    },

    /// The run directories could not be prepared
    #[error("cannot prepare run workspace: {0}")]
    Workspace(String),
}

/// Engine-wide settings
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Root of run directories, workspaces and lock files
    pub state_dir: PathBuf,
    /// Working tree override
    pub workspace: Option<PathBuf>,
    /// Pause between analysis server polls
    pub gate_poll_interval: Duration,
    /// Scanner report-task file, relative to the workspace
    pub report_task_file: Option<PathBuf>,
    /// Site-wide environment defaults
    pub environment: Environment,
}

impl EngineSettings {
    /// Settings rooted at `state_dir`
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            workspace: None,
            gate_poll_interval: Duration::from_secs(5),
            report_task_file: None,
            environment: Environment::new(),
        }
    }

    #[must_use]
    pub fn with_workspace(mut self, workspace: impl Into<PathBuf>) -> Self {
        self.workspace = Some(workspace.into());
        self
    }

    #[must_use]
    pub fn with_gate_poll_interval(mut self, interval: Duration) -> Self {
        self.gate_poll_interval = interval;
        self
    }

    #[must_use]
    pub fn with_report_task_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.report_task_file = Some(path.into());
        self
    }

    #[must_use]
    pub fn with_environment(mut self, environment: Environment) -> Self {
        self.environment = environment;
        self
    }
}

/// Per-run inputs
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    /// Externally supplied variables, layered over the declared defaults
    pub overrides: Environment,
    /// Explicit run number; the next free number when absent
    pub run_number: Option<u64>,
    /// Aborts the run once it holds `true`
    pub cancel: Option<watch::Receiver<bool>>,
}

impl RunRequest {
    /// Empty request
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_overrides(mut self, overrides: Environment) -> Self {
        self.overrides = overrides;
        self
    }

    #[must_use]
    pub fn with_run_number(mut self, number: u64) -> Self {
        self.run_number = Some(number);
        self
    }

    #[must_use]
    pub fn with_cancellation(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

/// Runs pipelines
pub struct PipelineEngine {
    collaborators: Collaborators,
    settings: EngineSettings,
    locks: Arc<LockRegistry>,
    metrics: Arc<MetricsCollector>,
}

impl PipelineEngine {
    /// Creates an engine with its own lock registry
    pub fn new(collaborators: Collaborators, settings: EngineSettings) -> Self {
        let locks = Arc::new(LockRegistry::new(&settings.state_dir));
        Self {
            collaborators,
            settings,
            locks,
            metrics: Arc::new(MetricsCollector::new()),
        }
    }

    /// Shares a lock registry with other engines
    #[must_use]
    pub fn with_locks(mut self, locks: Arc<LockRegistry>) -> Self {
        self.locks = locks;
        self
    }

    /// Run locks held by this engine
    pub fn locks(&self) -> &Arc<LockRegistry> {
        &self.locks
    }

    /// Summaries of finished runs
    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    /// Executes `pipeline` to a terminal status.
    ///
    /// Stage failures, aborts and cleanup errors are reported inside the
    /// returned [`PipelineResult`].
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] when no run took place: invalid definition,
    /// lock held by another run, or unusable state directory.
    pub async fn run(
        &self,
        pipeline: &Pipeline,
        request: RunRequest,
    ) -> Result<PipelineResult, EngineError> {
        pipeline.validate()?;

        let options = &pipeline.options;
        let mut budget = RunBudget::starting_now(options.timeout, options.cleanup_grace);
        if let Some(cancel) = request.cancel.clone() {
            budget = budget.with_cancellation(cancel);
        }
        let started_at = Utc::now();
        let start = std::time::Instant::now();
        let run_id = Uuid::new_v4();

        let _lock = if options.allow_concurrent_runs {
            None
        } else {
            Some(self.lock(pipeline, &budget).await?)
        };

        let workspace = RunWorkspace::prepare(
            &self.settings.state_dir,
            &pipeline.name,
            run_id,
            request.run_number,
            self.settings.workspace.clone(),
        )
        .map_err(|e| EngineError::Workspace(e.to_string()))?;
        let workspace = Arc::new(workspace);

        let mut executor = StageExecutor::new(&self.collaborators, Arc::clone(&workspace))
            .with_gate_poll_interval(self.settings.gate_poll_interval);
        if let Some(path) = &self.settings.report_task_file {
            executor = executor.with_report_task_file(path);
        }

        let mut env = self.assemble_environment(pipeline, &request, run_id, &workspace);

        tracing::info!(
            pipeline = %pipeline.name,
            run = workspace.run_number(),
            run_id = %run_id,
            stages = pipeline.stage_count(),
            "Pipeline started"
        );

        let mut stages = Vec::with_capacity(pipeline.stage_count());
        let mut aborted = false;

        if let Some(scm) = &pipeline.scm
            && !options.skip_default_checkout
        {
            let checkout_start = std::time::Instant::now();
            let git = GitCheckout::new(Arc::clone(&self.collaborators.runner));
            let outcome = budget
                .bound(git.checkout(&env, scm, workspace.workspace()))
                .await;
            match outcome {
                Ok(Ok(commit)) => {
                    env.insert("GIT_COMMIT", commit.clone());
                    if !request.overrides.contains("REVISION") {
                        env.insert("REVISION", commit);
                    }
                }
                Ok(Err(e)) => stages.push(checkout_failure(e, checkout_start.elapsed())),
                Err(Interrupted) => {
                    aborted = true;
                    stages.push(checkout_failure(budget.abort_error(), checkout_start.elapsed()));
                }
            }
        }

        let env = Arc::new(env);

        if stages.is_empty() {
            for stage in &pipeline.stages {
                if budget.expired() {
                    aborted = true;
                    break;
                }

                let run = executor.execute(stage, &env, &budget).await;
                let failed = run.result.status.is_failure();
                stages.push(run.result);

                if run.aborted {
                    aborted = true;
                    break;
                }
                if failed {
                    tracing::error!(stage = %stage.name, "Stage failed, halting pipeline");
                    break;
                }
            }
        }

        let status = if aborted {
            PipelineStatus::Aborted
        } else {
            PipelineStatus::aggregate(stages.iter().map(|s| &s.status))
        };
        let failure = if aborted {
            Some(budget.abort_error().kind())
        } else {
            stages
                .iter()
                .find(|s| s.status.is_failure())
                .and_then(|s| s.failure)
        };

        let cleanup = executor
            .run_cleanup(&pipeline.post, status, &env, &budget, aborted)
            .await;

        let result = PipelineResult {
            run_id,
            pipeline: pipeline.name.clone(),
            run_number: workspace.run_number(),
            status,
            failure,
            stages,
            cleanup_artifacts: cleanup.artifacts,
            cleanup_errors: cleanup.errors,
            started_at,
            duration: start.elapsed(),
        };

        match workspace.write_result(&result) {
            Ok(path) => tracing::debug!(path = %path.display(), "Wrote run result"),
            Err(e) => tracing::warn!(error = %e, "Failed to write run result"),
        }
        self.metrics.record(&result);

        if let Some(discarder) = &options.build_discarder
            && let Err(e) = workspace.prune(discarder.num_to_keep)
        {
            tracing::warn!(error = %e, "Failed to discard old runs");
        }

        tracing::info!(
            pipeline = %pipeline.name,
            run = result.run_number,
            status = %result.status,
            duration_ms = result.duration.as_millis() as u64,
            "Pipeline finished"
        );

        Ok(result)
    }

    async fn lock(&self, pipeline: &Pipeline, budget: &RunBudget) -> Result<RunLockGuard, EngineError> {
        let resource = pipeline.lock_identity();
        let acquired = match pipeline.options.concurrency {
            ConcurrencyPolicy::Reject => self.locks.try_acquire(resource),
            ConcurrencyPolicy::Queue => self.locks.acquire(resource, budget.deadline).await,
        };

        acquired.map_err(|e| match e {
            LockError::Held { resource } => {
                tracing::error!(resource = %resource, "Another run holds the lock");
                EngineError::ResourceConflict { resource }
            }
            LockError::Io(reason) => EngineError::Workspace(reason),
        })
    }

    /// Layers, lowest first: pipeline defaults, site defaults, request
    /// overrides, built-in run variables.
    fn assemble_environment(
        &self,
        pipeline: &Pipeline,
        request: &RunRequest,
        run_id: Uuid,
        workspace: &RunWorkspace,
    ) -> Environment {
        let mut env = pipeline.environment.clone();
        env.extend(&self.settings.environment);
        env.extend(&request.overrides);

        let number = workspace.run_number().to_string();
        if !env.contains("REVISION") {
            env.insert("REVISION", number.clone());
        }
        env.insert("BUILD_NUMBER", number);
        env.insert("BUILD_ID", run_id.to_string());
        env.insert("JOB_NAME", pipeline.name.clone());
        env.insert("WORKSPACE", path_string(workspace.workspace()));
        env.insert("RUN_ARTIFACTS_DIR", path_string(workspace.artifacts_dir()));
        env
    }
}

fn path_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn checkout_failure(error: PipelineError, duration: Duration) -> ExecutionResult {
    tracing::error!(error = %error, "Source checkout failed");
    ExecutionResult {
        stage: CHECKOUT_STAGE.to_string(),
        status: StageStatus::Failure,
        exit_code: error.exit_code(),
        failure: Some(error.kind()),
        message: Some(error.to_string()),
        artifacts: Vec::new(),
        post_failures: Vec::new(),
        duration,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::quality_gate::GateStatus;
    use crate::executor::testing::{RecordingUploader, ScriptedGateApi, ScriptedProbe, ScriptedRunner};
    use crate::pipeline::{
        BuildDiscarder, Condition, FailureKind, PipelineOptions, PostCondition, ScmSource,
        StageBuilder, Step,
    };
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    struct Fixture {
        state: TempDir,
        runner: Arc<ScriptedRunner>,
        engine: Arc<PipelineEngine>,
    }

    fn fixture_with(runner: ScriptedRunner, gate: GateStatus) -> Fixture {
        let state = TempDir::new().unwrap();
        let runner = Arc::new(runner);
        let collaborators = Collaborators::new(runner.clone())
            .with_probe(Arc::new(ScriptedProbe::always(Err("refused".to_string()))))
            .with_gate_api(Arc::new(ScriptedGateApi::new(gate)))
            .with_uploader(Arc::new(RecordingUploader::default()));
        let settings =
            EngineSettings::new(state.path()).with_gate_poll_interval(Duration::from_millis(1));
        Fixture {
            engine: Arc::new(PipelineEngine::new(collaborators, settings)),
            state,
            runner,
        }
    }

    fn fixture(runner: ScriptedRunner) -> Fixture {
        fixture_with(runner, GateStatus::Ok)
    }

    fn three_stages() -> Pipeline {
        Pipeline::builder()
            .name("shop-api")
            .stage(
                StageBuilder::new("Build")
                    .step(Step::shell("mvn -B verify"))
                    .build_unchecked(),
            )
            .stage(
                StageBuilder::new("Analyze")
                    .step(Step::shell("mvn sonar:sonar"))
                    .step(Step::quality_gate("shop-api", Duration::from_secs(5)))
                    .build_unchecked(),
            )
            .stage(
                StageBuilder::new("Package")
                    .step(Step::shell("docker build -t shop:${REVISION} ."))
                    .build_unchecked(),
            )
            .post(PostCondition::always(vec![Step::shell("cleanup-hook")]))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_successful_run() {
        let f = fixture(ScriptedRunner::new());
        let result = f.engine.run(&three_stages(), RunRequest::new()).await.unwrap();

        assert_eq!(result.status, PipelineStatus::Success);
        assert_eq!(result.failure, None);
        assert_eq!(result.stages.len(), 3);
        assert_eq!(result.run_number, 1);
        assert!(f.runner.ran("docker build -t shop:1 ."));
        assert_eq!(f.runner.count("cleanup-hook"), 1);

        let metrics = f.engine.metrics().get("shop-api").unwrap();
        assert_eq!(metrics.successful_stages, 3);
    }

    #[tokio::test]
    async fn test_gate_rejection_halts_and_keeps_earlier_results() {
        let f = fixture_with(ScriptedRunner::new(), GateStatus::Error);
        let result = f.engine.run(&three_stages(), RunRequest::new()).await.unwrap();

        assert_eq!(result.status, PipelineStatus::Failure);
        assert_eq!(result.failure, Some(FailureKind::QualityGateRejected));
        assert_eq!(result.stages.len(), 2);
        assert_eq!(result.stage("Build").unwrap().status, StageStatus::Success);
        assert!(result.stage("Package").is_none());
        assert!(!f.runner.ran("docker build"));
        assert_eq!(f.runner.count("cleanup-hook"), 1);
    }

    #[tokio::test]
    async fn test_cleanup_runs_once_and_never_downgrades() {
        let f = fixture(ScriptedRunner::new().on("cleanup-hook", 1));
        let result = f.engine.run(&three_stages(), RunRequest::new()).await.unwrap();

        assert_eq!(result.status, PipelineStatus::Success);
        assert_eq!(result.cleanup_errors.len(), 1);
        assert_eq!(f.runner.count("cleanup-hook"), 1);
    }

    #[tokio::test]
    async fn test_cleanup_runs_after_failure() {
        let f = fixture(ScriptedRunner::new().on("mvn -B verify", 1));
        let result = f.engine.run(&three_stages(), RunRequest::new()).await.unwrap();

        assert_eq!(result.status, PipelineStatus::Failure);
        assert_eq!(result.failure, Some(FailureKind::CommandFailure));
        assert_eq!(result.stages.len(), 1);
        assert_eq!(f.runner.count("cleanup-hook"), 1);
    }

    #[tokio::test]
    async fn test_skipped_stages_do_not_contribute() {
        let f = fixture(ScriptedRunner::new());
        let pipeline = Pipeline::builder()
            .name("shop-api")
            .stage(StageBuilder::new("Build").step(Step::shell("make")).build_unchecked())
            .stage(
                StageBuilder::new("Push")
                    .when(Condition::all_present(["DOCKER_REGISTRY"]))
                    .step(Step::shell("docker push"))
                    .build_unchecked(),
            )
            .build()
            .unwrap();

        let result = f.engine.run(&pipeline, RunRequest::new()).await.unwrap();
        assert_eq!(result.status, PipelineStatus::Success);
        assert_eq!(result.stage("Push").unwrap().status, StageStatus::Skipped);
        assert!(!f.runner.ran("docker push"));

        let request = RunRequest::new()
            .with_overrides(Environment::new().set("DOCKER_REGISTRY", "registry.local"));
        let result = f.engine.run(&pipeline, request).await.unwrap();
        assert_eq!(result.stage("Push").unwrap().status, StageStatus::Success);
        assert_eq!(result.run_number, 2);
    }

    #[tokio::test]
    async fn test_global_timeout_aborts_run() {
        let f = fixture(ScriptedRunner::new().hang_on("sleep"));
        let pipeline = Pipeline::builder()
            .name("slow")
            .options(PipelineOptions::new().with_timeout(Duration::from_millis(100)))
            .stage(StageBuilder::new("Wait").step(Step::shell("sleep 600")).build_unchecked())
            .stage(StageBuilder::new("Never").step(Step::shell("never")).build_unchecked())
            .post(PostCondition::always(vec![Step::shell("cleanup-hook")]))
            .post(PostCondition::failure(vec![Step::shell("failure-hook")]))
            .build()
            .unwrap();

        let result = f.engine.run(&pipeline, RunRequest::new()).await.unwrap();

        assert_eq!(result.status, PipelineStatus::Aborted);
        assert_eq!(result.failure, Some(FailureKind::Timeout));
        assert_eq!(result.stages.len(), 1);
        assert!(!f.runner.ran("never"));
        assert_eq!(f.runner.count("cleanup-hook"), 1);
        assert!(f.runner.ran("failure-hook"));
    }

    #[tokio::test]
    async fn test_concurrent_run_rejected() {
        let f = fixture(ScriptedRunner::new().hang_on("sleep"));
        let pipeline = Pipeline::builder()
            .name("shop-api")
            .options(PipelineOptions::new().with_timeout(Duration::from_millis(500)))
            .stage(StageBuilder::new("Wait").step(Step::shell("sleep 600")).build_unchecked())
            .build()
            .unwrap();

        let first = {
            let engine = Arc::clone(&f.engine);
            let pipeline = pipeline.clone();
            tokio::spawn(async move { engine.run(&pipeline, RunRequest::new()).await })
        };
        while !f.engine.locks().is_held("shop-api") {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let second = f.engine.run(&pipeline, RunRequest::new()).await;
        assert_eq!(
            second,
            Err(EngineError::ResourceConflict {
                resource: "shop-api".to_string()
            })
        );

        let first = first.await.unwrap().unwrap();
        assert_eq!(first.status, PipelineStatus::Aborted);
        assert!(!f.engine.locks().is_held("shop-api"));
    }

    #[tokio::test]
    async fn test_queued_run_waits_for_lock() {
        let f = fixture(ScriptedRunner::new().hang_on("sleep"));
        let options = PipelineOptions::new()
            .with_timeout(Duration::from_secs(10))
            .with_concurrency(ConcurrencyPolicy::Queue);
        let blocking = Pipeline::builder()
            .name("shop-api")
            .options(options.clone().with_timeout(Duration::from_millis(200)))
            .stage(StageBuilder::new("Wait").step(Step::shell("sleep 600")).build_unchecked())
            .build()
            .unwrap();
        let queued = Pipeline::builder()
            .name("shop-api")
            .options(options)
            .stage(StageBuilder::new("Build").step(Step::shell("make")).build_unchecked())
            .build()
            .unwrap();

        let first = {
            let engine = Arc::clone(&f.engine);
            tokio::spawn(async move { engine.run(&blocking, RunRequest::new()).await })
        };
        while !f.engine.locks().is_held("shop-api") {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let second = f.engine.run(&queued, RunRequest::new()).await.unwrap();
        assert_eq!(second.status, PipelineStatus::Success);
        assert_eq!(first.await.unwrap().unwrap().status, PipelineStatus::Aborted);
    }

    #[tokio::test]
    async fn test_concurrent_runs_allowed_skip_lock() {
        let f = fixture(ScriptedRunner::new());
        let pipeline = Pipeline::builder()
            .name("shop-api")
            .options(PipelineOptions::new().with_concurrent_runs(true))
            .stage(StageBuilder::new("Build").step(Step::shell("make")).build_unchecked())
            .build()
            .unwrap();

        let _held = f.engine.locks().try_acquire("shop-api").unwrap();
        let result = f.engine.run(&pipeline, RunRequest::new()).await.unwrap();
        assert_eq!(result.status, PipelineStatus::Success);
    }

    #[tokio::test]
    async fn test_environment_layering_and_builtins() {
        let f = fixture(ScriptedRunner::new());
        let pipeline = Pipeline::builder()
            .name("shop-api")
            .environment(|env| env.set("APP_PORT", "8080").set("BUILD_NUMBER", "999"))
            .stage(
                StageBuilder::new("Print")
                    .step(Step::shell("echo ${APP_PORT} ${BUILD_NUMBER} ${JOB_NAME} ${REVISION}"))
                    .build_unchecked(),
            )
            .build()
            .unwrap();
        let request = RunRequest::new()
            .with_run_number(12)
            .with_overrides(Environment::new().set("APP_PORT", "9090"));

        f.engine.run(&pipeline, request).await.unwrap();

        assert_eq!(f.runner.commands(), vec!["echo 9090 12 shop-api 12".to_string()]);
    }

    #[tokio::test]
    async fn test_checkout_sets_revision() {
        let f = fixture(ScriptedRunner::new().on_output("rev-parse", "abc1234\n"));
        let pipeline = Pipeline::builder()
            .name("shop-api")
            .scm(ScmSource::new("https://git.example.com/shop.git"))
            .stage(
                StageBuilder::new("Tag")
                    .step(Step::shell("docker tag shop:${REVISION} shop:${GIT_COMMIT}"))
                    .build_unchecked(),
            )
            .build()
            .unwrap();

        f.engine.run(&pipeline, RunRequest::new()).await.unwrap();
        assert!(f.runner.ran("git clone --depth 1 https://git.example.com/shop.git ."));
        assert!(f.runner.ran("docker tag shop:abc1234 shop:abc1234"));
    }

    #[tokio::test]
    async fn test_checkout_failure_halts_before_stages() {
        let f = fixture(ScriptedRunner::new().on("git clone", 128));
        let pipeline = Pipeline::builder()
            .name("shop-api")
            .scm(ScmSource::new("https://git.example.com/shop.git"))
            .stage(StageBuilder::new("Build").step(Step::shell("make")).build_unchecked())
            .post(PostCondition::always(vec![Step::shell("cleanup-hook")]))
            .build()
            .unwrap();

        let result = f.engine.run(&pipeline, RunRequest::new()).await.unwrap();

        assert_eq!(result.status, PipelineStatus::Failure);
        assert_eq!(result.stages.len(), 1);
        assert_eq!(result.stages[0].stage, CHECKOUT_STAGE);
        assert_eq!(result.stages[0].exit_code, Some(128));
        assert!(!f.runner.ran("make"));
        assert!(f.runner.ran("cleanup-hook"));
    }

    #[tokio::test]
    async fn test_result_written_and_old_runs_discarded() {
        let f = fixture(ScriptedRunner::new());
        let pipeline = Pipeline::builder()
            .name("shop-api")
            .options(PipelineOptions::new().with_build_discarder(BuildDiscarder::new(2)))
            .stage(StageBuilder::new("Build").step(Step::shell("make")).build_unchecked())
            .build()
            .unwrap();

        for _ in 0..3 {
            f.engine.run(&pipeline, RunRequest::new()).await.unwrap();
        }

        let runs_dir = f.state.path().join("shop-api/runs");
        let mut runs: Vec<String> = std::fs::read_dir(&runs_dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        runs.sort();
        assert_eq!(runs.len(), 2);
        assert!(runs[0].starts_with("2-"));
        assert!(runs_dir.join(&runs[1]).join("result.json").is_file());
    }

    #[tokio::test]
    async fn test_invalid_pipeline_rejected() {
        let f = fixture(ScriptedRunner::new());
        let pipeline = Pipeline::builder().name("empty").build_unchecked();
        assert_eq!(
            f.engine.run(&pipeline, RunRequest::new()).await,
            Err(EngineError::Validation(ValidationError::EmptyPipeline))
        );
    }

    #[tokio::test]
    async fn test_hanging_cleanup_is_bounded_by_the_run_timeout() {
        let f = fixture(ScriptedRunner::new().hang_on("sleep"));
        let pipeline = Pipeline::builder()
            .name("shop-api")
            .options(
                PipelineOptions::new()
                    .with_timeout(Duration::from_millis(200))
                    .with_cleanup_grace(Duration::from_secs(30)),
            )
            .stage(StageBuilder::new("Build").step(Step::shell("make")).build_unchecked())
            .post(PostCondition::always(vec![Step::shell("sleep 600")]))
            .build()
            .unwrap();
        let start = std::time::Instant::now();

        let result = f.engine.run(&pipeline, RunRequest::new()).await.unwrap();

        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(result.status, PipelineStatus::Success);
        assert_eq!(result.cleanup_errors, vec!["always: interrupted by timeout".to_string()]);
    }

    #[tokio::test]
    async fn test_cancelled_run_aborts_and_cleans_up() {
        let f = fixture(ScriptedRunner::new().hang_on("sleep"));
        let pipeline = Pipeline::builder()
            .name("shop-api")
            .stage(StageBuilder::new("Wait").step(Step::shell("sleep 600")).build_unchecked())
            .stage(StageBuilder::new("Never").step(Step::shell("never")).build_unchecked())
            .post(PostCondition::always(vec![Step::shell("cleanup-hook")]))
            .build()
            .unwrap();
        let (cancel, cancelled) = watch::channel(false);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let _ = cancel.send(true);
        });

        let request = RunRequest::new().with_cancellation(cancelled);
        let result = f.engine.run(&pipeline, request).await.unwrap();

        assert_eq!(result.status, PipelineStatus::Aborted);
        assert_eq!(result.failure, Some(FailureKind::Cancelled));
        assert_eq!(result.stages.len(), 1);
        assert!(!f.runner.ran("never"));
        assert_eq!(f.runner.count("cleanup-hook"), 1);
        assert!(!f.engine.locks().is_held("shop-api"));
    }

    #[tokio::test]
    async fn test_only_bound_secrets_reach_commands() {
        use crate::executor::ShellRunner;

        let state = TempDir::new().unwrap();
        let workspace = TempDir::new().unwrap();
        let collaborators = Collaborators::new(Arc::new(ShellRunner::new().with_echo(false)));
        let settings = EngineSettings::new(state.path()).with_workspace(workspace.path());
        let engine = PipelineEngine::new(collaborators, settings);
        let pipeline = Pipeline::builder()
            .name("shop-api")
            .stage(
                StageBuilder::new("Build")
                    .step(Step::shell("printf '%s' \"$NEXUS_PASSWORD\" > build.txt"))
                    .build_unchecked(),
            )
            .stage(
                StageBuilder::new("Publish")
                    .step(Step::with_credentials(
                        "nexus",
                        "NEXUS_USERNAME",
                        "NEXUS_PASSWORD",
                        vec![Step::shell("printf '%s' \"$NEXUS_PASSWORD\" > publish.txt")],
                    ))
                    .build_unchecked(),
            )
            .build()
            .unwrap();
        let request = RunRequest::new().with_overrides(
            Environment::new()
                .set("NEXUS_USERNAME", "deployer")
                .set("NEXUS_PASSWORD", "n3xus-pw"),
        );

        let result = engine.run(&pipeline, request).await.unwrap();

        assert_eq!(result.status, PipelineStatus::Success);
        let read = |name: &str| std::fs::read_to_string(workspace.path().join(name)).unwrap();
        assert_eq!(read("build.txt"), "");
        assert_eq!(read("publish.txt"), "n3xus-pw");
    }
}
