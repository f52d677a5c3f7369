//! Container CLI adapter
//!
//! Thin wrapper over the `docker` binary for the operations the engine
//! performs itself. Image builds, pushes and `docker run` stay plain shell
//! steps of the pipeline definition.

use crate::executor::{CommandRequest, CommandRunner};
use crate::pipeline::{Environment, PipelineError};
use std::sync::Arc;
use std::time::Duration;

/// Timeout for a single container CLI call
const CLI_TIMEOUT: Duration = Duration::from_secs(60);

/// Container operations through the CLI
#[derive(Clone)]
pub struct DockerCli {
    runner: Arc<dyn CommandRunner>,
    binary: String,
}

impl DockerCli {
    /// Creates an adapter using the `docker` binary
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            binary: "docker".to_string(),
        }
    }

    /// Uses a different CLI binary (e.g. `podman`)
    #[must_use]
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    /// Returns true if a container with exactly this name exists, running or not
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError`] if the CLI cannot be run or fails.
    pub async fn exists(&self, env: &Environment, name: &str) -> Result<bool, PipelineError> {
        let command = format!(
            "{} ps -a --filter {} --format '{{{{.Names}}}}'",
            self.binary,
            shell_words::quote(&format!("name=^/{name}$"))
        );
        let output = self
            .runner
            .run(env, CommandRequest::new(command).with_timeout(CLI_TIMEOUT))
            .await?
            .check()?;

        Ok(output.stdout.lines().any(|line| line.trim() == name))
    }

    /// Removes the container if present. Absence is not an error, so calling
    /// this twice in a row succeeds both times.
    ///
    /// Returns whether a container was removed.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError`] if the CLI cannot be run or the removal fails.
    pub async fn remove_if_exists(
        &self,
        env: &Environment,
        name: &str,
    ) -> Result<bool, PipelineError> {
        if !self.exists(env, name).await? {
            tracing::debug!(container = name, "Container not present, nothing to remove");
            return Ok(false);
        }

        let command = format!("{} rm -f {}", self.binary, shell_words::quote(name));
        self.runner
            .run(env, CommandRequest::new(command).with_timeout(CLI_TIMEOUT))
            .await?
            .check()?;

        tracing::info!(container = name, "Removed container");
        Ok(true)
    }
}
