//! Stage types for pipeline definition
//!
//! This module defines stage types and their builder pattern.

#![allow(clippy::must_use_candidate, clippy::return_self_not_must_use)]

use super::Validate;
use super::condition::Condition;
use super::errors::ValidationError;
use super::post::PostCondition;
use super::steps::Step;
use super::Environment;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Longest accepted stage name
pub const MAX_STAGE_NAME_LEN: usize = 100;

/// A stage in a pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    /// Stage name, unique within its pipeline
    pub name: String,

    /// Optional gating condition; absent means always eligible
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<Condition>,

    /// Steps in this stage
    pub steps: Vec<Step>,

    /// Post hooks for this stage, in declaration order
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub post: Vec<PostCondition>,
}

impl Validate for Stage {
    type Error = ValidationError;

    fn validate(&self) -> Result<(), Self::Error> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::EmptyName);
        }

        if self.name.len() > MAX_STAGE_NAME_LEN {
            return Err(ValidationError::NameTooLong {
                max: MAX_STAGE_NAME_LEN,
                len: self.name.len(),
            });
        }

        if self.name.chars().any(char::is_control) {
            return Err(ValidationError::InvalidNameChars {
                name: self.name.clone(),
            });
        }

        if self.steps.is_empty() {
            return Err(ValidationError::EmptyStage {
                stage: self.name.clone(),
            });
        }

        if let Some(ref when) = self.when {
            when.validate()?;
        }

        for step in &self.steps {
            step.validate()?;
        }

        for post in &self.post {
            post.validate()?;
        }

        Ok(())
    }
}

impl Stage {
    /// Creates a new stage
    pub fn new(name: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            name: name.into(),
            when: None,
            steps,
            post: Vec::new(),
        }
    }

    /// Sets when condition for this stage
    pub fn with_when(mut self, when: Condition) -> Self {
        self.when = Some(when);
        self
    }

    /// Adds a post hook to this stage
    pub fn with_post(mut self, post: PostCondition) -> Self {
        self.post.push(post);
        self
    }

    /// Evaluates the gating condition against the run environment
    pub fn is_eligible(&self, env: &Environment) -> bool {
        self.when.as_ref().is_none_or(|cond| cond.evaluate(env))
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Stage({}): {} steps", self.name, self.steps.len())?;
        if let Some(when) = &self.when {
            write!(f, " when {when}")?;
        }
        Ok(())
    }
}

/// Builder for creating stages
pub struct StageBuilder {
    stage: Stage,
}

impl StageBuilder {
    /// Creates a new stage builder
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            stage: Stage::new(name, Vec::new()),
        }
    }

    /// Sets when condition for the stage
    pub fn when(mut self, when: Condition) -> Self {
        self.stage.when = Some(when);
        self
    }

    /// Adds a step to the stage
    pub fn step(mut self, step: Step) -> Self {
        self.stage.steps.push(step);
        self
    }

    /// Adds multiple steps to the stage
    pub fn steps(mut self, mut steps: Vec<Step>) -> Self {
        self.stage.steps.append(&mut steps);
        self
    }

    /// Adds a post hook to the stage
    pub fn post(mut self, condition: PostCondition) -> Self {
        self.stage.post.push(condition);
        self
    }

    /// Builds the stage
    #[allow(clippy::missing_errors_doc)]
    pub fn build(self) -> Result<Stage, ValidationError> {
        self.stage.validate()?;
        Ok(self.stage)
    }

    /// Builds the stage without validation
    #[must_use]
    pub fn build_unchecked(self) -> Stage {
        self.stage
    }
}
