//! Source checkout
//!
//! Clones the configured repository into the run workspace before any stage
//! starts, or refreshes an existing clone.

use crate::executor::{CommandRequest, CommandRunner};
use crate::pipeline::{Environment, PipelineError, ScmSource};
use std::path::Path;
use std::sync::Arc;

/// Git operations on the run workspace
#[derive(Clone)]
pub struct GitCheckout {
    runner: Arc<dyn CommandRunner>,
}

impl GitCheckout {
    /// Creates a checkout helper
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    /// Brings `workspace` to the head of `source` and returns the short commit id.
    ///
    /// An empty workspace gets a shallow clone. A workspace that already
    /// holds a clone is fetched and checked out instead.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError`] if any git command fails.
    pub async fn checkout(
        &self,
        env: &Environment,
        source: &ScmSource,
        workspace: &Path,
    ) -> Result<String, PipelineError> {
        let url = shell_words::quote(&source.url).into_owned();
        let branch = source.branch.as_deref().map(|b| shell_words::quote(b).into_owned());

        if is_empty_dir(workspace)? {
            tracing::info!(url = %source.url, branch = ?source.branch, "Cloning repository");
            let command = match &branch {
                Some(branch) => format!("git clone --depth 1 --branch {branch} {url} ."),
                None => format!("git clone --depth 1 {url} ."),
            };
            self.git(env, workspace, command).await?;
        } else {
            tracing::info!(url = %source.url, branch = ?source.branch, "Updating existing checkout");
            let target = branch.as_deref().unwrap_or("HEAD");
            self.git(env, workspace, format!("git fetch --depth 1 {url} {target}"))
                .await?;
            self.git(env, workspace, "git checkout --force FETCH_HEAD".to_string())
                .await?;
        }

        let commit = self
            .git(env, workspace, "git rev-parse --short HEAD".to_string())
            .await?;
        let commit = commit.trim().to_string();
        tracing::info!(commit = %commit, "Checked out revision");
        Ok(commit)
    }

    async fn git(
        &self,
        env: &Environment,
        workspace: &Path,
        command: String,
    ) -> Result<String, PipelineError> {
        let output = self
            .runner
            .run(env, CommandRequest::new(command).in_dir(workspace))
            .await?
            .check()?;
        Ok(output.stdout)
    }
}

fn is_empty_dir(path: &Path) -> Result<bool, PipelineError> {
    match std::fs::read_dir(path) {
        Ok(mut entries) => Ok(entries.next().is_none()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            std::fs::create_dir_all(path)?;
            Ok(true)
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::testing::ScriptedRunner;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_clone_into_empty_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new().on_output("rev-parse", "a1b2c3d\n"));
        let git = GitCheckout::new(runner.clone());
        let source = ScmSource::new("https://git.example.com/shop.git").with_branch("main");

        let commit = git
            .checkout(&Environment::new(), &source, dir.path())
            .await
            .unwrap();

        assert_eq!(commit, "a1b2c3d");
        let commands = runner.commands();
        assert_eq!(
            commands[0],
            "git clone --depth 1 --branch main https://git.example.com/shop.git ."
        );
        assert_eq!(runner.calls()[0].cwd.as_deref(), Some(dir.path()));
    }

    #[tokio::test]
    async fn test_existing_checkout_is_fetched() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join(".git")).unwrap();
        let runner = Arc::new(ScriptedRunner::new().on_output("rev-parse", "ffff000\n"));
        let git = GitCheckout::new(runner.clone());
        let source = ScmSource::new("https://git.example.com/shop.git");

        git.checkout(&Environment::new(), &source, dir.path())
            .await
            .unwrap();

        assert!(!runner.ran("git clone"));
        assert!(runner.ran("git fetch --depth 1 https://git.example.com/shop.git HEAD"));
        assert!(runner.ran("git checkout --force FETCH_HEAD"));
    }

    #[tokio::test]
    async fn test_clone_failure() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new().on("git clone", 128));
        let git = GitCheckout::new(runner.clone());
        let source = ScmSource::new("https://git.example.com/missing.git");

        let err = git
            .checkout(&Environment::new(), &source, dir.path())
            .await
            .unwrap_err();
        assert_eq!(err.exit_code(), Some(128));
        assert!(!runner.ran("rev-parse"));
    }
}
