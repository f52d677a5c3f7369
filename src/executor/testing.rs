//! Scripted collaborators for tests

use super::command::{CommandError, CommandOutput, CommandRequest, CommandRunner};
use super::credentials::Credential;
use super::health::HealthProbe;
use super::publisher::ArtifactUploader;
use super::quality_gate::{GateApi, GateError, GateStatus, TaskState};
use crate::pipeline::Environment;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use url::Url;

static SHELL_VAR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$([A-Za-z_][A-Za-z0-9_]*)").unwrap());

/// Canned reaction of [`ScriptedRunner`]
#[derive(Debug, Clone)]
pub enum Reply {
    /// Exit with the code and output
    Exit {
        code: i32,
        stdout: String,
    },
    /// Never finish; honors the request timeout
    Hang,
}

/// One command seen by [`ScriptedRunner`]
#[derive(Debug, Clone)]
pub struct RecordedCommand {
    /// Command after `${VAR}` expansion and the shell's own `$VAR`
    /// expansion, as seen by a child that only gets bound secrets
    pub command: String,
    /// Working directory
    pub cwd: Option<PathBuf>,
    /// Overrides passed with the request
    pub overrides: HashMap<String, String>,
}

/// Runner that matches commands by substring and records every call
#[derive(Default)]
pub struct ScriptedRunner {
    rules: Vec<(String, Reply)>,
    calls: Mutex<Vec<RecordedCommand>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Commands containing `pattern` exit with `code`
    pub fn on(mut self, pattern: &str, code: i32) -> Self {
        self.rules.push((
            pattern.to_string(),
            Reply::Exit {
                code,
                stdout: String::new(),
            },
        ));
        self
    }

    /// Commands containing `pattern` print `stdout` and exit 0
    pub fn on_output(mut self, pattern: &str, stdout: &str) -> Self {
        self.rules.push((
            pattern.to_string(),
            Reply::Exit {
                code: 0,
                stdout: stdout.to_string(),
            },
        ));
        self
    }

    /// Commands containing `pattern` never finish
    pub fn hang_on(mut self, pattern: &str) -> Self {
        self.rules.push((pattern.to_string(), Reply::Hang));
        self
    }

    pub fn calls(&self) -> Vec<RecordedCommand> {
        self.calls.lock().clone()
    }

    pub fn commands(&self) -> Vec<String> {
        self.calls.lock().iter().map(|c| c.command.clone()).collect()
    }

    pub fn count(&self, pattern: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.command.contains(pattern))
            .count()
    }

    pub fn ran(&self, pattern: &str) -> bool {
        self.count(pattern) > 0
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(
        &self,
        env: &Environment,
        request: CommandRequest,
    ) -> Result<CommandOutput, CommandError> {
        let visible = env.without_sensitive().overlay(&request.env_overrides);
        let command = SHELL_VAR
            .replace_all(&visible.resolve(&request.command), |caps: &regex::Captures<'_>| {
                visible
                    .get(&caps[1])
                    .cloned()
                    .unwrap_or_else(|| caps[0].to_string())
            })
            .into_owned();
        self.calls.lock().push(RecordedCommand {
            command: command.clone(),
            cwd: request.cwd.clone(),
            overrides: request.env_overrides.clone(),
        });

        let reply = self
            .rules
            .iter()
            .find(|(pattern, _)| command.contains(pattern.as_str()))
            .map(|(_, reply)| reply.clone())
            .unwrap_or(Reply::Exit {
                code: 0,
                stdout: String::new(),
            });

        match reply {
            Reply::Exit { code, stdout } => Ok(CommandOutput {
                exit_code: code,
                stdout,
                stderr: if code == 0 {
                    String::new()
                } else {
                    format!("{command} failed")
                },
                duration: Duration::from_millis(1),
            }),
            Reply::Hang => match request.timeout {
                Some(limit) => {
                    tokio::time::sleep(limit).await;
                    Err(CommandError::Timeout { duration: limit })
                }
                None => std::future::pending().await,
            },
        }
    }
}

/// Probe answering from a script; the last reply repeats
pub struct ScriptedProbe {
    replies: Vec<Result<u16, String>>,
    calls: AtomicUsize,
}

impl ScriptedProbe {
    pub fn always(reply: Result<u16, String>) -> Self {
        Self::sequence(vec![reply])
    }

    pub fn sequence(replies: Vec<Result<u16, String>>) -> Self {
        Self {
            replies,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HealthProbe for ScriptedProbe {
    async fn probe(&self, _url: &str) -> Result<u16, String> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        let idx = n.min(self.replies.len().saturating_sub(1));
        self.replies
            .get(idx)
            .cloned()
            .unwrap_or_else(|| Err("no scripted reply".to_string()))
    }
}

/// Analysis server with a fixed verdict
pub struct ScriptedGateApi {
    verdict: GateStatus,
    tasks: Vec<TaskState>,
    failures_left: AtomicUsize,
    task_polls: AtomicUsize,
    status_queries: Mutex<Vec<Option<String>>>,
}

impl ScriptedGateApi {
    pub fn new(verdict: GateStatus) -> Self {
        Self {
            verdict,
            tasks: vec![TaskState::Success(None)],
            failures_left: AtomicUsize::new(0),
            task_polls: AtomicUsize::new(0),
            status_queries: Mutex::new(Vec::new()),
        }
    }

    /// Task states returned in order; the last one repeats
    pub fn with_tasks(mut self, tasks: Vec<TaskState>) -> Self {
        self.tasks = tasks;
        self
    }

    /// The first `n` status queries fail with a transport error
    pub fn failing_first(self, n: usize) -> Self {
        self.failures_left.store(n, Ordering::SeqCst);
        self
    }

    pub fn task_polls(&self) -> usize {
        self.task_polls.load(Ordering::SeqCst)
    }

    pub fn status_queries(&self) -> Vec<Option<String>> {
        self.status_queries.lock().clone()
    }
}

#[async_trait]
impl GateApi for ScriptedGateApi {
    async fn task_state(&self, _task_id: &str) -> Result<TaskState, GateError> {
        let n = self.task_polls.fetch_add(1, Ordering::SeqCst);
        let idx = n.min(self.tasks.len().saturating_sub(1));
        Ok(self.tasks.get(idx).cloned().unwrap_or(TaskState::Pending))
    }

    async fn project_status(
        &self,
        _project_key: &str,
        analysis_id: Option<&str>,
    ) -> Result<GateStatus, GateError> {
        self.status_queries
            .lock()
            .push(analysis_id.map(str::to_string));
        let pending_failure = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if pending_failure {
            return Err(GateError::Http("connection reset".to_string()));
        }
        Ok(self.verdict)
    }
}

/// Uploader that records target URLs
#[derive(Default)]
pub struct RecordingUploader {
    failure: Option<String>,
    uploads: Mutex<Vec<String>>,
    usernames: Mutex<Vec<String>>,
}

impl RecordingUploader {
    pub fn failing(reason: &str) -> Self {
        Self {
            failure: Some(reason.to_string()),
            ..Self::default()
        }
    }

    pub fn uploads(&self) -> Vec<String> {
        self.uploads.lock().clone()
    }

    pub fn usernames(&self) -> Vec<String> {
        self.usernames.lock().clone()
    }
}

#[async_trait]
impl ArtifactUploader for RecordingUploader {
    async fn upload(&self, _file: &Path, url: &Url, credential: &Credential) -> Result<(), String> {
        self.uploads.lock().push(url.to_string());
        if let Credential::UsernamePassword { username, .. } = credential {
            self.usernames.lock().push(username.clone());
        }
        match &self.failure {
            Some(reason) => Err(reason.clone()),
            None => Ok(()),
        }
    }
}
