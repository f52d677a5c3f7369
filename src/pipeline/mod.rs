//! Pipeline domain types and logic

pub mod condition;
pub mod errors;
pub mod options;
pub mod pipeline_def;
pub mod post;
pub mod stage;
pub mod steps;
pub mod types;


pub use serde::{Deserialize, Serialize};

pub use condition::Condition;
pub use errors::{PipelineError, ValidationError};
pub use options::{BuildDiscarder, ConcurrencyPolicy, LogColor, PipelineOptions};
pub use pipeline_def::{Pipeline, PipelineBuilder, ScmSource};
pub use post::PostCondition;
pub use stage::{Stage, StageBuilder};
pub use steps::{Step, StepType};
pub use types::{
    ArtifactReference, ExecutionResult, FailureKind, PipelineResult, PipelineStatus, StageStatus,
    Validate,
};

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;

static VAR_PATTERN: Lazy<Regex> = Lazy::new(|| {
    #[allow(clippy::expect_used)]
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("variable pattern is valid")
});

/// Key fragments whose values are treated as secrets.
const SENSITIVE_MARKERS: [&str; 3] = ["PASSWORD", "TOKEN", "SECRET"];

/// String-to-string variables visible to every step of a run.
///
/// An absent key is different from a key bound to the empty string. Once a
/// run starts the environment is shared read-only; step-local bindings are
/// layered with [`overlay`][Environment::overlay] instead of mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Environment {
    /// Environment variables as key-value pairs.
    #[serde(flatten)]
    pub vars: HashMap<String, String>,
}

impl Environment {
    /// Creates a new empty environment.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets an environment variable.
    #[must_use]
    pub fn set(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(key.into(), value.into());
        self
    }

    /// Inserts a variable in place, replacing any previous value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(key.into(), value.into());
    }

    /// Gets an environment variable by name.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&String> {
        self.vars.get(key)
    }

    /// Returns true if the key is bound, even to an empty string.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.vars.contains_key(key)
    }

    /// Number of bound variables.
    #[must_use]
    pub fn len(&self) -> usize {
        self.vars.len()
    }

    /// Returns true when nothing is bound.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Iterates over variables sorted by key.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        let mut entries: Vec<_> = self.vars.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        entries.into_iter()
    }

    /// Copies every variable of `other` over this one.
    pub fn extend(&mut self, other: &Environment) {
        for (key, value) in &other.vars {
            self.vars.insert(key.clone(), value.clone());
        }
    }

    /// Returns a new environment with `overrides` layered on top.
    #[must_use]
    pub fn overlay<'a, I>(&self, overrides: I) -> Self
    where
        I: IntoIterator<Item = (&'a String, &'a String)>,
    {
        let mut merged = self.clone();
        for (key, value) in overrides {
            merged.vars.insert(key.clone(), value.clone());
        }
        merged
    }

    /// Expands `${VAR}` references. Unknown variables are kept verbatim.
    #[must_use]
    pub fn resolve(&self, value: &str) -> String {
        VAR_PATTERN
            .replace_all(value, |caps: &regex::Captures<'_>| {
                self.vars
                    .get(&caps[1])
                    .cloned()
                    .unwrap_or_else(|| caps[0].to_string())
            })
            .into_owned()
    }

    /// Non-empty values of keys that look like secrets.
    #[must_use]
    pub fn sensitive_values(&self) -> Vec<String> {
        self.vars
            .iter()
            .filter(|(key, value)| is_sensitive_key(key) && !value.trim().is_empty())
            .map(|(_, value)| value.clone())
            .collect()
    }

    /// Copy without the keys that look like secrets.
    #[must_use]
    pub fn without_sensitive(&self) -> Self {
        self.vars
            .iter()
            .filter(|(key, _)| !is_sensitive_key(key))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }
}

/// Returns true for keys such as `DOCKER_PASSWORD` or `SONAR_TOKEN`.
#[must_use]
pub fn is_sensitive_key(key: &str) -> bool {
    let upper = key.to_ascii_uppercase();
    SENSITIVE_MARKERS.iter().any(|marker| upper.contains(marker))
}

impl FromIterator<(String, String)> for Environment {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self {
            vars: iter.into_iter().collect(),
        }
    }
}
