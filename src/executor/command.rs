//! External command execution
//!
//! Every external tool the pipeline drives (build tool, scanners, container
//! CLI, git) goes through a [`CommandRunner`]. The shell implementation runs
//! `sh -c <command>` with:
//!
//! - Variable expansion (`${VAR}`) from the run environment plus overrides
//! - Captured stdout and stderr, with secret values masked as `****`
//! - A per-command timeout that kills the shell and everything it started
//!
//! Variables whose names look like secrets (see
//! [`is_sensitive_key`][crate::pipeline::is_sensitive_key]) reach the child
//! only when the request binds them, which is what a credentials step does.
//! Everything else in the run environment is exported as-is.
//!
//! Non-zero exits are not errors at this layer; they are reported in
//! [`CommandOutput`] and the caller decides what they mean.

use crate::pipeline::{Environment, PipelineError, is_sensitive_key};
use async_trait::async_trait;
use std::collections::HashMap;
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::process::{Child, Command};

/// Replacement for masked secret values
pub const MASK: &str = "****";

/// Number of stderr lines kept in failure messages
const STDERR_TAIL_LINES: usize = 20;

/// A single command invocation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandRequest {
    /// Command line, before variable expansion
    pub command: String,
    /// Working directory; the process cwd when absent
    pub cwd: Option<PathBuf>,
    /// Variables layered over the run environment for this command only
    pub env_overrides: HashMap<String, String>,
    /// Kill the child after this long
    pub timeout: Option<Duration>,
    /// Extra values to mask in logged and captured output
    pub masked: Vec<String>,
}

impl CommandRequest {
    /// Creates a request for the given command line
    #[must_use]
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Self::default()
        }
    }

    /// Sets the working directory
    #[must_use]
    pub fn in_dir(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Adds one environment override
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_overrides.insert(key.into(), value.into());
        self
    }

    /// Adds a set of environment overrides
    #[must_use]
    pub fn envs(mut self, overrides: &HashMap<String, String>) -> Self {
        self.env_overrides
            .extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    /// Sets the timeout
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Registers values that must never appear in output
    #[must_use]
    pub fn masking(mut self, values: impl IntoIterator<Item = String>) -> Self {
        self.masked.extend(values);
        self
    }
}

/// Result of a command that ran to completion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code; `-1` when the process was terminated by a signal
    pub exit_code: i32,
    /// Standard output, masked
    pub stdout: String,
    /// Standard error, masked
    pub stderr: String,
    /// Wall-clock duration
    pub duration: Duration,
}

impl CommandOutput {
    /// Returns true if command succeeded (exit code 0)
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }

    /// Last lines of stderr, for failure messages
    #[must_use]
    pub fn stderr_tail(&self) -> String {
        let lines: Vec<&str> = self.stderr.lines().collect();
        let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
        lines[start..].join("\n")
    }

    /// Converts a non-zero exit into [`PipelineError::CommandFailed`]
    ///
    /// # Errors
    ///
    /// Returns the error when the exit code is not zero.
    pub fn check(self) -> Result<Self, PipelineError> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(PipelineError::CommandFailed {
                code: self.exit_code,
                stderr: self.stderr_tail(),
            })
        }
    }
}

/// Errors that prevent a command from producing an exit status
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// The shell could not be started
    #[error("failed to spawn '{command}': {reason}")]
    Spawn {
        /// Masked command line
        command: String,
        /// OS error
        reason: String,
    },

    /// The command exceeded its timeout and was killed
    #[error("command timed out after {duration:?}")]
    Timeout {
        /// Configured timeout
        duration: Duration,
    },

    /// Waiting on the child failed
    #[error("I/O error while running command: {0}")]
    Io(String),
}

impl From<CommandError> for PipelineError {
    fn from(err: CommandError) -> Self {
        match err {
            CommandError::Timeout { duration } => PipelineError::Timeout {
                operation: "command".to_string(),
                duration,
            },
            CommandError::Spawn { .. } | CommandError::Io(_) => PipelineError::Io(err.to_string()),
        }
    }
}

/// Runs external commands on behalf of steps
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs `request` with `env` as the base environment.
    ///
    /// # Errors
    ///
    /// Fails only when no exit status could be obtained: spawn failure,
    /// timeout, or I/O error. Non-zero exits are returned as output.
    async fn run(
        &self,
        env: &Environment,
        request: CommandRequest,
    ) -> Result<CommandOutput, CommandError>;
}

/// Runs commands through a POSIX shell
#[derive(Debug, Clone)]
pub struct ShellRunner {
    shell: String,
    echo_output: bool,
}

impl Default for ShellRunner {
    fn default() -> Self {
        Self {
            shell: "sh".to_string(),
            echo_output: true,
        }
    }
}

impl ShellRunner {
    /// Creates a runner using `sh`
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses a different shell binary
    #[must_use]
    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    /// Enables or disables logging every output line
    #[must_use]
    pub fn with_echo(mut self, echo: bool) -> Self {
        self.echo_output = echo;
        self
    }
}

#[async_trait]
impl CommandRunner for ShellRunner {
    async fn run(
        &self,
        env: &Environment,
        request: CommandRequest,
    ) -> Result<CommandOutput, CommandError> {
        let scoped = env.without_sensitive().overlay(&request.env_overrides);
        let expanded = scoped.resolve(&request.command);

        let mut secrets = request.masked.clone();
        secrets.extend(env.overlay(&request.env_overrides).sensitive_values());
        let shown = mask_secrets(&request.command, &secrets);

        tracing::info!(command = %shown, cwd = ?request.cwd, "Running command");

        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c")
            .arg(&expanded)
            .envs(&scoped.vars)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);
        for key in inherited_secrets(&request.env_overrides) {
            cmd.env_remove(key);
        }
        if let Some(cwd) = &request.cwd {
            cmd.current_dir(cwd);
        }

        let start = Instant::now();
        let child = cmd.spawn().map_err(|e| CommandError::Spawn {
            command: shown.clone(),
            reason: e.to_string(),
        })?;
        let group = ProcessGroup::of(&child);

        // Timing out or dropping this future drops `group`, which kills the
        // shell's whole process group.
        let output = match request.timeout {
            Some(limit) => tokio::time::timeout(limit, child.wait_with_output())
                .await
                .map_err(|_| CommandError::Timeout { duration: limit })?,
            None => child.wait_with_output().await,
        }
        .map_err(|e| CommandError::Io(e.to_string()))?;
        group.release();

        let stdout = mask_secrets(&String::from_utf8_lossy(&output.stdout), &secrets);
        let stderr = mask_secrets(&String::from_utf8_lossy(&output.stderr), &secrets);
        let exit_code = output.status.code().unwrap_or(-1);
        let duration = start.elapsed();

        if self.echo_output {
            for line in stdout.lines() {
                tracing::info!(target: "shipline::output", "{line}");
            }
            for line in stderr.lines() {
                tracing::warn!(target: "shipline::output", "{line}");
            }
        }

        tracing::debug!(
            command = %shown,
            exit_code,
            duration_ms = duration.as_millis() as u64,
            "Command finished"
        );

        Ok(CommandOutput {
            exit_code,
            stdout,
            stderr,
            duration,
        })
    }
}

/// Process group led by a spawned shell, killed on drop unless released.
///
/// The shell is spawned with `process_group(0)`, so its pid is also the
/// group id and every pipeline member or background job it forks joins it.
struct ProcessGroup {
    pgid: Option<i32>,
}

impl ProcessGroup {
    fn of(child: &Child) -> Self {
        Self {
            pgid: child.id().and_then(|pid| i32::try_from(pid).ok()),
        }
    }

    /// The shell exited on its own; leave its group alone.
    fn release(mut self) {
        self.pgid = None;
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        if let Some(pgid) = self.pgid
            && kill_process_group(pgid)
        {
            tracing::debug!(pgid, "Killed command process group");
        }
    }
}

/// Sends SIGKILL to every process in group `pgid`
fn kill_process_group(pgid: i32) -> bool {
    unsafe { libc::killpg(pgid, libc::SIGKILL) == 0 }
}

/// Secret-looking variables of this process that the child would inherit
/// without being bound for it.
fn inherited_secrets(bound: &HashMap<String, String>) -> Vec<OsString> {
    std::env::vars_os()
        .map(|(key, _)| key)
        .filter(|key| {
            key.to_str()
                .is_some_and(|k| is_sensitive_key(k) && !bound.contains_key(k))
        })
        .collect()
}

/// Replaces every occurrence of each secret with [`MASK`].
///
/// Longer secrets are replaced first so a secret containing another one is
/// fully hidden. Empty values are ignored.
#[must_use]
pub fn mask_secrets(text: &str, secrets: &[String]) -> String {
    let mut ordered: Vec<&String> = secrets.iter().filter(|s| !s.is_empty()).collect();
    ordered.sort_by_key(|s| std::cmp::Reverse(s.len()));
    ordered.dedup();

    ordered
        .into_iter()
        .fold(text.to_string(), |acc, secret| acc.replace(secret.as_str(), MASK))
}

/// Quotes one argument for inclusion in a shell command line
#[must_use]
pub fn quote(arg: &str) -> String {
    shell_words::quote(arg).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_captures_stdout_and_exit_code() {
        let runner = ShellRunner::new().with_echo(false);
        let out = runner
            .run(&Environment::new(), CommandRequest::new("echo hello"))
            .await
            .unwrap();
        assert_eq!(out.stdout.trim(), "hello");
        assert!(out.is_success());
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_not_an_error() {
        let runner = ShellRunner::new().with_echo(false);
        let out = runner
            .run(
                &Environment::new(),
                CommandRequest::new("echo failing >&2; exit 3"),
            )
            .await
            .unwrap();
        assert_eq!(out.exit_code, 3);
        assert_eq!(out.stderr_tail(), "failing");
        assert!(matches!(
            out.check(),
            Err(PipelineError::CommandFailed { code: 3, .. })
        ));
    }

    #[tokio::test]
    async fn test_timeout_kills_child() {
        let runner = ShellRunner::new().with_echo(false);
        let start = Instant::now();
        let err = runner
            .run(
                &Environment::new(),
                CommandRequest::new("sleep 5").with_timeout(Duration::from_millis(100)),
            )
            .await
            .unwrap_err();
        assert_eq!(
            err,
            CommandError::Timeout {
                duration: Duration::from_millis(100)
            }
        );
        assert!(start.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_overrides_and_expansion() {
        let runner = ShellRunner::new().with_echo(false);
        let env = Environment::new().set("IMAGE", "shop/api").set("TAG", "1");
        let out = runner
            .run(
                &env,
                CommandRequest::new("echo ${IMAGE}:${TAG} ${UNKNOWN_VAR_X}")
                    .env("TAG", "2"),
            )
            .await
            .unwrap();
        assert_eq!(out.stdout.trim(), "shop/api:2");
        // the base environment is untouched
        assert_eq!(env.get("TAG").map(String::as_str), Some("1"));
    }

    #[tokio::test]
    async fn test_child_sees_environment() {
        let runner = ShellRunner::new().with_echo(false);
        let env = Environment::new().set("GREETING", "hola");
        let out = runner
            .run(&env, CommandRequest::new("printf '%s' \"$GREETING\""))
            .await
            .unwrap();
        assert_eq!(out.stdout, "hola");
    }

    #[tokio::test]
    async fn test_timeout_kills_background_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("late.txt");
        let command = format!(
            "(sleep 1; touch {}) & sleep 5",
            quote(&marker.to_string_lossy())
        );
        let runner = ShellRunner::new().with_echo(false);
        let err = runner
            .run(
                &Environment::new(),
                CommandRequest::new(command).with_timeout(Duration::from_millis(200)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::Timeout { .. }));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_dropped_run_kills_process_group() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("late.txt");
        let command = format!("sleep 1; touch {}", quote(&marker.to_string_lossy()));
        let runner = ShellRunner::new().with_echo(false);
        let env = Environment::new();
        let abandoned = tokio::time::timeout(
            Duration::from_millis(200),
            runner.run(&env, CommandRequest::new(command)),
        )
        .await;
        assert!(abandoned.is_err());

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_secrets_are_masked_in_output() {
        let runner = ShellRunner::new().with_echo(false);
        let out = runner
            .run(
                &Environment::new(),
                CommandRequest::new("echo \"$DOCKER_PASSWORD\" token-abc")
                    .env("DOCKER_PASSWORD", "s3cr3t-value")
                    .masking(["token-abc".to_string()]),
            )
            .await
            .unwrap();
        assert_eq!(out.stdout.trim(), "**** ****");
    }

    #[tokio::test]
    async fn test_unbound_secrets_stay_out_of_the_child() {
        let runner = ShellRunner::new().with_echo(false);
        let env = Environment::new()
            .set("NEXUS_PASSWORD", "pw-123")
            .set("NEXUS_URL", "https://nexus.local");
        let out = runner
            .run(
                &env,
                CommandRequest::new(
                    "printf '[%s][%s][%s]' \"$NEXUS_PASSWORD\" \"${NEXUS_PASSWORD}\" \"$NEXUS_URL\"",
                ),
            )
            .await
            .unwrap();
        assert_eq!(out.stdout, "[][][https://nexus.local]");
    }

    #[tokio::test]
    async fn test_bound_secret_reaches_the_child() {
        let runner = ShellRunner::new().with_echo(false);
        let env = Environment::new().set("SONAR_TOKEN", "from-run");
        let out = runner
            .run(
                &env,
                CommandRequest::new("printf '%s' \"$SONAR_TOKEN\" | wc -c")
                    .env("SONAR_TOKEN", "bound"),
            )
            .await
            .unwrap();
        assert_eq!(out.stdout.trim(), "5");
    }

    #[tokio::test]
    async fn test_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "x").unwrap();
        let runner = ShellRunner::new().with_echo(false);
        let out = runner
            .run(
                &Environment::new(),
                CommandRequest::new("ls").in_dir(dir.path()),
            )
            .await
            .unwrap();
        assert!(out.stdout.contains("marker.txt"));
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let runner = ShellRunner::new().with_shell("/nonexistent/shell");
        let err = runner
            .run(&Environment::new(), CommandRequest::new("true"))
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::Spawn { .. }));
    }

    #[test]
    fn test_mask_secrets_longest_first() {
        let secrets = vec!["abc".to_string(), "abcdef".to_string(), String::new()];
        assert_eq!(mask_secrets("x abcdef abc", &secrets), "x **** ****");
    }

    #[test]
    fn test_quote() {
        assert_eq!(quote("simple"), "simple");
        assert_eq!(quote("it's"), "'it'\\''s'");
    }

    #[test]
    fn test_command_error_conversion() {
        let err: PipelineError = CommandError::Timeout {
            duration: Duration::from_secs(1),
        }
        .into();
        assert_eq!(err.kind(), crate::pipeline::FailureKind::Timeout);
    }
}
