//! `shipline run` - Execute a pipeline
//!
//! Wires the production collaborators from the tool config, runs the
//! pipeline and maps the outcome to the process exit status:
//!
//! | Outcome | Exit |
//! |---|---|
//! | SUCCESS | 0 |
//! | UNSTABLE | 0, or 2 with `--fail-on-unstable` |
//! | FAILURE | 1 |
//! | ABORTED | 3 |
//! | lock held by another run | 4 |
//!
//! SIGINT or SIGTERM cancels the run: the current stage is aborted, cleanup
//! still runs, and the run ends ABORTED.

use anyhow::{Context, Result};
use shipline::executor::{
    Collaborators, ConfiguredSecretStore, EngineError, EngineSettings, HttpProbe, HttpUploader,
    PipelineEngine, RunRequest, ShellRunner, SonarQubeApi,
};
use shipline::infrastructure::Config;
use shipline::pipeline::{Environment, Pipeline, PipelineResult, PipelineStatus};
use std::future::Future;
use std::sync::Arc;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::watch;

/// Exit status when the pipeline's lock is held
pub const RESOURCE_CONFLICT_EXIT: u8 = 4;

/// Options of one `run` invocation
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub overrides: Environment,
    pub run_number: Option<u64>,
    pub fail_on_unstable: bool,
    pub json: bool,
}

/// Production collaborators described by `config`
pub fn collaborators(config: &Config) -> Result<Collaborators> {
    let mut collaborators = Collaborators::new(Arc::new(ShellRunner::new()))
        .with_probe(Arc::new(HttpProbe::new()))
        .with_uploader(Arc::new(HttpUploader::new()))
        .with_secrets(Arc::new(ConfiguredSecretStore::new(
            config.credentials.clone(),
        )));

    if let Some(sonar) = &config.sonar {
        let api = SonarQubeApi::new(&sonar.url, sonar.token.clone())
            .context("Invalid analysis server configuration")?;
        collaborators = collaborators.with_gate_api(Arc::new(api));
    }

    Ok(collaborators)
}

/// Engine settings described by `config`
pub fn settings(config: &Config) -> EngineSettings {
    let mut settings = EngineSettings::new(&config.state_dir)
        .with_environment(config.environment.clone());
    if let Some(workspace) = &config.workspace {
        settings = settings.with_workspace(workspace);
    }
    settings
}

/// Exit status for a finished run
pub fn exit_code(status: PipelineStatus, fail_on_unstable: bool) -> u8 {
    match status {
        PipelineStatus::Success => 0,
        PipelineStatus::Unstable if fail_on_unstable => 2,
        PipelineStatus::Unstable => 0,
        PipelineStatus::Failure => 1,
        PipelineStatus::Aborted => 3,
    }
}

/// Human-readable run summary
pub fn format_summary(result: &PipelineResult) -> String {
    let width = result
        .stages
        .iter()
        .map(|s| s.stage.len())
        .max()
        .unwrap_or(0);

    let mut out = format!("{} #{}\n", result.pipeline, result.run_number);
    for stage in &result.stages {
        out.push_str(&format!(
            "  {:<width$}  {:<8}  {:>8}ms",
            stage.stage,
            stage.status.to_string(),
            stage.duration.as_millis()
        ));
        if let Some(message) = &stage.message {
            out.push_str(&format!("  {message}"));
        }
        out.push('\n');
    }
    for error in &result.cleanup_errors {
        out.push_str(&format!("  cleanup: {error}\n"));
    }
    out.push_str(&format!("{} in {}ms\n", result.status, result.duration.as_millis()));
    out
}

/// Resolves with the signal name on SIGINT or SIGTERM
async fn interrupt() -> std::io::Result<&'static str> {
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.map(|()| "SIGINT"),
        _ = terminate.recv() => Ok("SIGTERM"),
    }
}

/// Runs `pipeline`; once `interrupt` resolves the run is cancelled and
/// awaited through its cleanup.
async fn run_cancellable<F>(
    engine: &PipelineEngine,
    pipeline: &Pipeline,
    request: RunRequest,
    interrupt: F,
) -> Result<PipelineResult, EngineError>
where
    F: Future<Output = std::io::Result<&'static str>>,
{
    let (cancel, cancelled) = watch::channel(false);
    let run = engine.run(pipeline, request.with_cancellation(cancelled));
    tokio::pin!(run);

    tokio::select! {
        result = &mut run => result,
        Ok(name) = interrupt => {
            tracing::warn!(signal = name, "Interrupted, aborting run");
            let _ = cancel.send(true);
            run.await
        }
    }
}

/// Runs `pipeline` and returns the process exit status
pub fn run_pipeline(config: &Config, pipeline: &Pipeline, options: RunOptions) -> Result<u8> {
    let engine = PipelineEngine::new(collaborators(config)?, settings(config));
    let mut request = RunRequest::new().with_overrides(options.overrides);
    if let Some(number) = options.run_number {
        request = request.with_run_number(number);
    }

    let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;
    let result = match runtime.block_on(run_cancellable(&engine, pipeline, request, interrupt())) {
        Ok(result) => result,
        Err(EngineError::ResourceConflict { resource }) => {
            eprintln!("Another run holds the lock on '{resource}'");
            return Ok(RESOURCE_CONFLICT_EXIT);
        }
        Err(e) => return Err(e).context("Pipeline could not start"),
    };

    if options.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&result).context("Failed to serialize result")?
        );
    } else {
        print!("{}", format_summary(&result));
    }

    Ok(exit_code(result.status, options.fail_on_unstable))
}
