//! Post-condition types for pipeline execution
//!
//! This module defines hooks that execute after pipeline or stage completion.
//! Hooks run in declaration order; each one is matched against the final
//! status of its owner.

#![allow(clippy::must_use_candidate)]

use super::Validate;
use super::errors::ValidationError;
use super::steps::Step;
use super::types::StageStatus;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Hooks that execute after pipeline or stage completion
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PostCondition {
    /// Always execute regardless of result
    Always {
        /// Steps to execute
        steps: Vec<Step>,
    },

    /// Execute only on success
    Success {
        /// Steps to execute
        steps: Vec<Step>,
    },

    /// Execute only on failure
    Failure {
        /// Steps to execute
        steps: Vec<Step>,
    },

    /// Execute only when the result is unstable
    Unstable {
        /// Steps to execute
        steps: Vec<Step>,
    },
}

impl PostCondition {
    /// Creates an "always" hook
    pub fn always(steps: Vec<Step>) -> Self {
        Self::Always { steps }
    }

    /// Creates a "success" hook
    pub fn success(steps: Vec<Step>) -> Self {
        Self::Success { steps }
    }

    /// Creates a "failure" hook
    pub fn failure(steps: Vec<Step>) -> Self {
        Self::Failure { steps }
    }

    /// Creates an "unstable" hook
    pub fn unstable(steps: Vec<Step>) -> Self {
        Self::Unstable { steps }
    }

    /// Returns the steps for this hook
    pub fn steps(&self) -> &[Step] {
        match self {
            Self::Always { steps }
            | Self::Success { steps }
            | Self::Failure { steps }
            | Self::Unstable { steps } => steps,
        }
    }

    /// Hook label used in logs
    pub fn label(&self) -> &'static str {
        match self {
            Self::Always { .. } => "always",
            Self::Success { .. } => "success",
            Self::Failure { .. } => "failure",
            Self::Unstable { .. } => "unstable",
        }
    }

    /// Returns true if this hook fires for the given result.
    /// Skipped owners never fire hooks.
    pub fn should_execute(&self, result: StageStatus) -> bool {
        match self {
            _ if result.is_skipped() => false,
            Self::Always { .. } => true,
            Self::Success { .. } => result.is_success(),
            Self::Failure { .. } => result.is_failure(),
            Self::Unstable { .. } => result.is_unstable(),
        }
    }
}

impl Validate for PostCondition {
    type Error = ValidationError;

    fn validate(&self) -> Result<(), Self::Error> {
        self.steps().iter().try_for_each(Validate::validate)
    }
}

impl fmt::Display for PostCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({} steps)", self.label(), self.steps().len())
    }
}
