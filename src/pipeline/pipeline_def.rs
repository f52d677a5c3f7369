//! Pipeline definition and builder

#![allow(clippy::must_use_candidate, clippy::return_self_not_must_use)]

use crate::pipeline::Environment;
use crate::pipeline::errors::{PipelineError, ValidationError};
use crate::pipeline::options::PipelineOptions;
use crate::pipeline::post::PostCondition;
use crate::pipeline::stage::Stage;
use crate::pipeline::types::Validate;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::Path;

/// Longest accepted pipeline name
pub const MAX_PIPELINE_NAME_LEN: usize = 64;

/// Source repository checked out into the workspace before the first stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScmSource {
    /// Clone URL
    pub url: String,
    /// Branch to check out; the remote default when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
}

impl ScmSource {
    /// Creates a source for the given URL
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            branch: None,
        }
    }

    /// Sets the branch
    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }
}

/// Main pipeline structure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pipeline {
    /// Pipeline name; also the default lock identity and state directory name
    pub name: String,

    /// Free-form description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Declared environment defaults
    #[serde(default, skip_serializing_if = "Environment::is_empty")]
    pub environment: Environment,

    /// Pipeline options
    #[serde(default)]
    pub options: PipelineOptions,

    /// Optional source checkout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scm: Option<ScmSource>,

    /// Stages in declaration order
    pub stages: Vec<Stage>,

    /// Cleanup hooks run once after all stages
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub post: Vec<PostCondition>,
}

impl Validate for Pipeline {
    type Error = ValidationError;

    fn validate(&self) -> Result<(), Self::Error> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::EmptyName);
        }

        if self.name.len() > MAX_PIPELINE_NAME_LEN {
            return Err(ValidationError::NameTooLong {
                max: MAX_PIPELINE_NAME_LEN,
                len: self.name.len(),
            });
        }

        // The name becomes a directory and lock file name
        let valid_chars = self
            .name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !valid_chars || self.name.starts_with('.') {
            return Err(ValidationError::InvalidNameChars {
                name: self.name.clone(),
            });
        }

        if self.stages.is_empty() {
            return Err(ValidationError::EmptyPipeline);
        }

        let mut seen = HashSet::new();
        for stage in &self.stages {
            stage.validate()?;
            if !seen.insert(stage.name.as_str()) {
                return Err(ValidationError::DuplicateStage {
                    stage: stage.name.clone(),
                });
            }
        }

        for post in &self.post {
            post.validate()?;
        }

        if let Some(scm) = &self.scm
            && scm.url.trim().is_empty()
        {
            return Err(ValidationError::InvalidStep(
                "scm url cannot be empty".to_string(),
            ));
        }

        self.options.validate()?;

        Ok(())
    }
}

impl Pipeline {
    /// Creates a new pipeline builder
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::new()
    }

    /// Returns pipeline name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns number of stages
    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Identity used for the run lock
    pub fn lock_identity(&self) -> &str {
        self.options.lock_resource.as_deref().unwrap_or(&self.name)
    }

    /// Parses and validates a YAML definition
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Parse`] for malformed YAML and
    /// [`PipelineError::Validation`] for an invalid definition.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, PipelineError> {
        let pipeline: Self = serde_yaml::from_str(yaml)?;
        pipeline.validate()?;
        Ok(pipeline)
    }

    /// Loads and validates a YAML definition from disk
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Io`] when the file cannot be read, otherwise
    /// the errors of [`Pipeline::from_yaml_str`].
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, PipelineError> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&contents)
    }

    /// Serializes the definition back to YAML
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Parse`] if serialization fails.
    pub fn to_yaml(&self) -> Result<String, PipelineError> {
        Ok(serde_yaml::to_string(self)?)
    }
}

impl fmt::Display for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pipeline({}): {} stages", self.name, self.stages.len())
    }
}

/// Builder for creating pipelines
#[derive(Debug, Clone)]
pub struct PipelineBuilder {
    pipeline: Pipeline,
}

impl PipelineBuilder {
    /// Creates a new pipeline builder
    pub fn new() -> Self {
        Self {
            pipeline: Pipeline {
                name: String::new(),
                description: None,
                environment: Environment::new(),
                options: PipelineOptions::default(),
                scm: None,
                stages: Vec::new(),
                post: Vec::new(),
            },
        }
    }

    /// Sets pipeline name
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.pipeline.name = name.into();
        self
    }

    /// Sets the description
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.pipeline.description = Some(description.into());
        self
    }

    /// Adds a stage to pipeline
    pub fn stage(mut self, stage: Stage) -> Self {
        self.pipeline.stages.push(stage);
        self
    }

    /// Adds multiple stages to pipeline
    pub fn stages(mut self, mut stages: Vec<Stage>) -> Self {
        self.pipeline.stages.append(&mut stages);
        self
    }

    /// Configures environment with a closure
    pub fn environment<F>(mut self, f: F) -> Self
    where
        F: FnOnce(Environment) -> Environment,
    {
        self.pipeline.environment = f(self.pipeline.environment);
        self
    }

    /// Sets environment directly
    #[must_use]
    pub fn with_environment(mut self, environment: Environment) -> Self {
        self.pipeline.environment = environment;
        self
    }

    /// Sets pipeline options
    pub fn options(mut self, options: PipelineOptions) -> Self {
        self.pipeline.options = options;
        self
    }

    /// Sets the source checkout
    pub fn scm(mut self, scm: ScmSource) -> Self {
        self.pipeline.scm = Some(scm);
        self
    }

    /// Adds a cleanup hook to pipeline
    pub fn post(mut self, condition: PostCondition) -> Self {
        self.pipeline.post.push(condition);
        self
    }

    /// Builds pipeline
    #[allow(clippy::missing_errors_doc)]
    pub fn build(self) -> Result<Pipeline, ValidationError> {
        self.pipeline.validate()?;
        Ok(self.pipeline)
    }

    /// Builds pipeline without validation
    #[must_use]
    pub fn build_unchecked(self) -> Pipeline {
        self.pipeline
    }
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}
