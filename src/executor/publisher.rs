//! Artifact publishing
//!
//! Locates one build artifact by glob and uploads it to a repository with an
//! HTTP PUT. Uploads are attempted once; a failed upload fails the step.

use super::credentials::Credential;
use crate::pipeline::{ArtifactReference, PipelineError, ValidationError};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use url::Url;

/// Snapshot or pre-release qualifier as a whole version segment, e.g.
/// `-SNAPSHOT`, `-rc1`, `.beta.`
static PRE_RELEASE: Lazy<Regex> = Lazy::new(|| {
    #[allow(clippy::expect_used)]
    Regex::new(r"(?i)[-.](snapshot|rc|alpha|beta|pre)\d*([-.+_]|$)")
        .expect("pre-release pattern is valid")
});

/// Publishing failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    /// Nothing matched the pattern
    #[error("no artifact matches '{pattern}'")]
    NotFound {
        /// Glob pattern
        pattern: String,
    },

    /// The pattern itself is malformed
    #[error("invalid artifact pattern '{pattern}': {reason}")]
    Pattern {
        /// Glob pattern
        pattern: String,
        /// Parser message
        reason: String,
    },

    /// The upload was rejected or never reached the server
    #[error("upload to {destination} failed: {reason}")]
    Failure {
        /// Target URL
        destination: String,
        /// Transport error or HTTP status
        reason: String,
    },
}

impl From<PublishError> for PipelineError {
    fn from(err: PublishError) -> Self {
        match err {
            PublishError::NotFound { pattern } => PipelineError::NotFound { pattern },
            PublishError::Pattern { .. } => {
                PipelineError::Validation(ValidationError::InvalidStep(err.to_string()))
            }
            PublishError::Failure {
                destination,
                reason,
            } => PipelineError::PublishFailed {
                destination,
                reason,
            },
        }
    }
}

/// Transfers one file to a URL
#[async_trait]
pub trait ArtifactUploader: Send + Sync {
    /// Uploads `file` to `url`.
    ///
    /// # Errors
    ///
    /// Returns a description of the failure; any non-2xx answer is a failure.
    async fn upload(&self, file: &Path, url: &Url, credential: &Credential) -> Result<(), String>;
}

/// [`ArtifactUploader`] doing an authenticated HTTP PUT
#[derive(Debug, Clone, Default)]
pub struct HttpUploader {
    client: reqwest::Client,
}

impl HttpUploader {
    /// Creates an uploader with a fresh client
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ArtifactUploader for HttpUploader {
    async fn upload(&self, file: &Path, url: &Url, credential: &Credential) -> Result<(), String> {
        let body = tokio::fs::read(file)
            .await
            .map_err(|e| format!("cannot read {}: {e}", file.display()))?;

        let request = self.client.put(url.clone()).body(body);
        let request = match credential {
            Credential::UsernamePassword { username, password } => {
                request.basic_auth(username, Some(password))
            }
            Credential::Token(token) => request.bearer_auth(token),
        };

        let response = request.send().await.map_err(|e| e.to_string())?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(format!("server answered HTTP {}", status.as_u16()))
        }
    }
}

/// Returns true for snapshot or pre-release file names
pub fn is_snapshot(file_name: &str) -> bool {
    PRE_RELEASE.is_match(file_name)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Picks the artifact to publish among several matches.
///
/// Snapshot or pre-release names win. Ties are broken by the
/// lexicographically first path.
pub fn select_artifact(mut candidates: Vec<PathBuf>) -> Option<PathBuf> {
    candidates.sort();
    candidates
        .iter()
        .find(|path| is_snapshot(&file_name(path)))
        .or_else(|| candidates.first())
        .cloned()
}

/// Publishes artifacts through an [`ArtifactUploader`]
#[derive(Clone)]
pub struct ArtifactPublisher {
    uploader: Arc<dyn ArtifactUploader>,
}

impl ArtifactPublisher {
    /// Creates a publisher
    pub fn new(uploader: Arc<dyn ArtifactUploader>) -> Self {
        Self { uploader }
    }

    /// Uploads the artifact selected by `pattern` to
    /// `{destination}/{file name}`.
    ///
    /// # Errors
    ///
    /// [`PublishError::NotFound`] when nothing matches, [`PublishError::Pattern`]
    /// for a malformed glob and [`PublishError::Failure`] for a bad
    /// destination or a failed upload.
    pub async fn publish(
        &self,
        pattern: &str,
        destination: &str,
        credential: &Credential,
    ) -> Result<ArtifactReference, PublishError> {
        let matches = glob::glob(pattern).map_err(|e| PublishError::Pattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;
        let candidates: Vec<PathBuf> = matches
            .filter_map(Result::ok)
            .filter(|path| path.is_file())
            .collect();

        tracing::debug!(pattern, matches = candidates.len(), "Resolved artifact pattern");

        let artifact = select_artifact(candidates).ok_or_else(|| PublishError::NotFound {
            pattern: pattern.to_string(),
        })?;
        let name = file_name(&artifact);

        let failure = |reason: String| PublishError::Failure {
            destination: destination.to_string(),
            reason,
        };
        let mut url = Url::parse(destination).map_err(|e| failure(format!("invalid URL: {e}")))?;
        url.path_segments_mut()
            .map_err(|()| failure("URL cannot have a path".to_string()))?
            .pop_if_empty()
            .push(&name);

        tracing::info!(artifact = %artifact.display(), url = %url, "Publishing artifact");
        self.uploader
            .upload(&artifact, &url, credential)
            .await
            .map_err(failure)?;

        Ok(ArtifactReference::new(url.as_str(), name))
    }
}
