//! Quality gate client
//!
//! Waits for the analysis server's verdict on an analysis that an earlier
//! command already submitted. The scanner leaves a report-task file with the
//! server-side task id; when it is present the client first waits for that
//! task to finish, then asks for the gate status of the resulting analysis.

use async_trait::async_trait;
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Where the scanner writes its report-task file, relative to the workspace
pub const DEFAULT_REPORT_TASK_FILE: &str = "target/sonar/report-task.txt";

/// Pause between server polls
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Verdict of the quality gate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateStatus {
    /// Passed
    Ok,
    /// Passed with warnings; treated as a rejection
    Warn,
    /// Failed
    Error,
    /// No verdict within the poll budget
    Timeout,
}

impl GateStatus {
    /// Only `Ok` lets the pipeline continue
    #[must_use]
    pub fn is_ok(self) -> bool {
        matches!(self, Self::Ok)
    }
}

impl fmt::Display for GateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ok => "OK",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
            Self::Timeout => "TIMEOUT",
        })
    }
}

/// State of the server-side analysis task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskState {
    /// Queued or running
    Pending,
    /// Finished; carries the analysis id when the server reported one
    Success(Option<String>),
    /// Failed or canceled on the server
    Failed,
}

/// Errors talking to the analysis server
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GateError {
    /// Transport failure
    #[error("request to analysis server failed: {0}")]
    Http(String),

    /// Non-success HTTP status
    #[error("analysis server answered {status}: {message}")]
    Api {
        /// HTTP status code
        status: u16,
        /// Response body or reason
        message: String,
    },

    /// Unexpected response shape
    #[error("unexpected analysis server response: {0}")]
    Parse(String),
}

impl From<reqwest::Error> for GateError {
    fn from(err: reqwest::Error) -> Self {
        Self::Http(err.to_string())
    }
}

/// Access to the analysis server
#[async_trait]
pub trait GateApi: Send + Sync {
    /// Looks up a background task by id.
    ///
    /// # Errors
    ///
    /// Returns [`GateError`] on transport or protocol failures.
    async fn task_state(&self, task_id: &str) -> Result<TaskState, GateError>;

    /// Fetches the gate status, by analysis id when known, else by project.
    ///
    /// # Errors
    ///
    /// Returns [`GateError`] on transport or protocol failures.
    async fn project_status(
        &self,
        project_key: &str,
        analysis_id: Option<&str>,
    ) -> Result<GateStatus, GateError>;
}

/// [`GateApi`] for a SonarQube server
#[derive(Debug, Clone)]
pub struct SonarQubeApi {
    base_url: Url,
    token: Option<String>,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct TaskResponse {
    task: TaskBody,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskBody {
    status: String,
    #[serde(default)]
    analysis_id: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProjectStatusResponse {
    project_status: ProjectStatusBody,
}

#[derive(Deserialize)]
struct ProjectStatusBody {
    status: String,
}

impl SonarQubeApi {
    /// Creates a client for the server at `base_url`
    ///
    /// # Errors
    ///
    /// Returns [`GateError::Parse`] if the URL is invalid.
    pub fn new(base_url: &str, token: Option<String>) -> Result<Self, GateError> {
        // Trailing slash so joins keep any context path
        let normalized = format!("{}/", base_url.trim_end_matches('/'));
        let base_url = Url::parse(&normalized)
            .map_err(|e| GateError::Parse(format!("invalid server URL '{base_url}': {e}")))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            base_url,
            token,
            client,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, GateError> {
        self.base_url
            .join(path)
            .map_err(|e| GateError::Parse(e.to_string()))
    }

    async fn get<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, GateError> {
        let mut request = self.client.get(self.endpoint(path)?).query(query);
        if let Some(token) = &self.token {
            request = request.basic_auth(token, None::<&str>);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(GateError::Api {
                status: status.as_u16(),
                message,
            });
        }

        response
            .json::<T>()
            .await
            .map_err(|e| GateError::Parse(e.to_string()))
    }
}

/// Maps a gate status string from the server
fn parse_gate_status(status: &str) -> Result<GateStatus, GateError> {
    match status {
        "OK" | "NONE" => Ok(GateStatus::Ok),
        "WARN" => Ok(GateStatus::Warn),
        "ERROR" => Ok(GateStatus::Error),
        other => Err(GateError::Parse(format!("unknown gate status '{other}'"))),
    }
}

#[async_trait]
impl GateApi for SonarQubeApi {
    async fn task_state(&self, task_id: &str) -> Result<TaskState, GateError> {
        let response: TaskResponse = self.get("api/ce/task", &[("id", task_id)]).await?;
        Ok(match response.task.status.as_str() {
            "SUCCESS" => TaskState::Success(response.task.analysis_id),
            "FAILED" | "CANCELED" => TaskState::Failed,
            _ => TaskState::Pending,
        })
    }

    async fn project_status(
        &self,
        project_key: &str,
        analysis_id: Option<&str>,
    ) -> Result<GateStatus, GateError> {
        let query = match analysis_id {
            Some(id) => [("analysisId", id)],
            None => [("projectKey", project_key)],
        };
        let response: ProjectStatusResponse = self
            .get("api/qualitygates/project_status", &query)
            .await?;
        parse_gate_status(&response.project_status.status)
    }
}

/// Reads `ceTaskId` from a scanner report-task file
pub fn read_task_id(contents: &str) -> Option<String> {
    contents
        .lines()
        .filter_map(|line| line.trim().strip_prefix("ceTaskId="))
        .map(str::trim)
        .find(|id| !id.is_empty())
        .map(str::to_string)
}

/// Waits for quality gate verdicts
#[derive(Clone)]
pub struct QualityGateClient {
    api: Option<Arc<dyn GateApi>>,
    report_task_file: PathBuf,
    poll_interval: Duration,
}

impl QualityGateClient {
    /// Creates a client; without an API every gate reports `Error`
    pub fn new(api: Option<Arc<dyn GateApi>>) -> Self {
        Self {
            api,
            report_task_file: PathBuf::from(DEFAULT_REPORT_TASK_FILE),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Sets the report-task file location
    #[must_use]
    pub fn with_report_file(mut self, path: impl AsRef<Path>) -> Self {
        self.report_task_file = path.as_ref().to_path_buf();
        self
    }

    /// Sets the pause between server polls
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Waits up to `poll_timeout` for the verdict on `project_key`.
    pub async fn await_gate(&self, project_key: &str, poll_timeout: Duration) -> GateStatus {
        let Some(api) = &self.api else {
            tracing::error!(project_key, "No analysis server configured; failing the quality gate");
            return GateStatus::Error;
        };

        match tokio::time::timeout(poll_timeout, self.wait_for_verdict(api.as_ref(), project_key))
            .await
        {
            Ok(status) => {
                tracing::info!(project_key, %status, "Quality gate verdict");
                status
            }
            Err(_) => {
                tracing::warn!(project_key, timeout_ms = poll_timeout.as_millis() as u64, "Quality gate timed out");
                GateStatus::Timeout
            }
        }
    }

    async fn wait_for_verdict(&self, api: &dyn GateApi, project_key: &str) -> GateStatus {
        let task_id = match tokio::fs::read_to_string(&self.report_task_file).await {
            Ok(contents) => read_task_id(&contents),
            Err(_) => None,
        };

        let mut analysis_id = None;
        if let Some(task_id) = task_id {
            tracing::debug!(project_key, task_id = %task_id, "Waiting for analysis task");
            loop {
                match api.task_state(&task_id).await {
                    Ok(TaskState::Success(id)) => {
                        analysis_id = id;
                        break;
                    }
                    Ok(TaskState::Failed) => {
                        tracing::warn!(project_key, task_id = %task_id, "Analysis task failed");
                        return GateStatus::Error;
                    }
                    Ok(TaskState::Pending) => {}
                    Err(error) => tracing::warn!(project_key, %error, "Polling analysis task failed"),
                }
                tokio::time::sleep(self.poll_interval).await;
            }
        }

        loop {
            match api.project_status(project_key, analysis_id.as_deref()).await {
                Ok(status) => return status,
                Err(error) => tracing::warn!(project_key, %error, "Fetching gate status failed"),
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::testing::ScriptedGateApi;
    use pretty_assertions::assert_eq;

    fn client(api: Arc<ScriptedGateApi>, report: &Path) -> QualityGateClient {
        QualityGateClient::new(Some(api))
            .with_report_file(report)
            .with_poll_interval(Duration::from_millis(5))
    }

    #[test]
    fn test_read_task_id() {
        let contents = "projectKey=shop\nserverUrl=http://sonar\nceTaskId=AXyz123\n";
        assert_eq!(read_task_id(contents), Some("AXyz123".to_string()));
        assert_eq!(read_task_id("projectKey=shop\n"), None);
        assert_eq!(read_task_id("ceTaskId=\n"), None);
    }

    #[test]
    fn test_parse_gate_status() {
        assert_eq!(parse_gate_status("OK"), Ok(GateStatus::Ok));
        assert_eq!(parse_gate_status("NONE"), Ok(GateStatus::Ok));
        assert_eq!(parse_gate_status("WARN"), Ok(GateStatus::Warn));
        assert_eq!(parse_gate_status("ERROR"), Ok(GateStatus::Error));
        assert!(parse_gate_status("???").is_err());
    }

    #[tokio::test]
    async fn test_waits_for_task_then_uses_analysis_id() {
        let dir = tempfile::tempdir().unwrap();
        let report = dir.path().join("report-task.txt");
        std::fs::write(&report, "ceTaskId=T1\n").unwrap();

        let api = Arc::new(
            ScriptedGateApi::new(GateStatus::Ok)
                .with_tasks(vec![TaskState::Pending, TaskState::Success(Some("A1".to_string()))]),
        );
        let status = client(api.clone(), &report)
            .await_gate("shop", Duration::from_secs(2))
            .await;

        assert_eq!(status, GateStatus::Ok);
        assert_eq!(api.task_polls(), 2);
        assert_eq!(api.status_queries(), vec![Some("A1".to_string())]);
    }

    #[tokio::test]
    async fn test_failed_task_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let report = dir.path().join("report-task.txt");
        std::fs::write(&report, "ceTaskId=T1\n").unwrap();

        let api = Arc::new(ScriptedGateApi::new(GateStatus::Ok).with_tasks(vec![TaskState::Failed]));
        let status = client(api.clone(), &report)
            .await_gate("shop", Duration::from_secs(2))
            .await;
        assert_eq!(status, GateStatus::Error);
        assert!(api.status_queries().is_empty());
    }

    #[tokio::test]
    async fn test_without_report_file_queries_by_project() {
        let dir = tempfile::tempdir().unwrap();
        let api = Arc::new(ScriptedGateApi::new(GateStatus::Warn));
        let status = client(api.clone(), &dir.path().join("missing.txt"))
            .await_gate("shop", Duration::from_secs(2))
            .await;
        assert_eq!(status, GateStatus::Warn);
        assert!(!status.is_ok());
        assert_eq!(api.status_queries(), vec![None]);
    }

    #[tokio::test]
    async fn test_pending_forever_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let report = dir.path().join("report-task.txt");
        std::fs::write(&report, "ceTaskId=T1\n").unwrap();

        let api = Arc::new(ScriptedGateApi::new(GateStatus::Ok).with_tasks(vec![TaskState::Pending]));
        let status = client(api, &report)
            .await_gate("shop", Duration::from_millis(50))
            .await;
        assert_eq!(status, GateStatus::Timeout);
    }

    #[tokio::test]
    async fn test_transport_errors_are_retried() {
        let dir = tempfile::tempdir().unwrap();
        let api = Arc::new(ScriptedGateApi::new(GateStatus::Ok).failing_first(2));
        let status = client(api.clone(), &dir.path().join("none"))
            .await_gate("shop", Duration::from_secs(2))
            .await;
        assert_eq!(status, GateStatus::Ok);
        assert_eq!(api.status_queries().len(), 3);
    }

    #[tokio::test]
    async fn test_no_server_is_error() {
        let status = QualityGateClient::new(None)
            .await_gate("shop", Duration::from_secs(1))
            .await;
        assert_eq!(status, GateStatus::Error);
    }

    #[test]
    fn test_sonarqube_api_rejects_bad_url() {
        assert!(SonarQubeApi::new("not a url", None).is_err());
        assert!(SonarQubeApi::new("http://sonar.example.com/", Some("t".to_string())).is_ok());
    }
}
