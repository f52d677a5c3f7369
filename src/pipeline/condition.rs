//! Stage gating conditions
//!
//! A [`Condition`] is a pure predicate over the run's [`Environment`]
//! snapshot. Evaluation never fails: a missing key is treated as absent or
//! false, depending on the predicate.

#![allow(clippy::must_use_candidate)]

use super::Environment;
use super::Validate;
use super::errors::ValidationError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Declarative predicate deciding whether a stage runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Condition {
    /// Every listed key is present with a non-blank value
    AllPresent {
        /// Keys that must be set
        keys: Vec<String>,
    },

    /// The key parses as a true flag (`true` or `1`, case-insensitive)
    IsTrue {
        /// Flag name
        key: String,
    },

    /// All conditions must be true
    All {
        /// List of conditions
        conditions: Vec<Condition>,
    },

    /// At least one condition must be true
    Any {
        /// List of conditions
        conditions: Vec<Condition>,
    },

    /// Negates the inner condition
    Not {
        /// Condition to negate
        condition: Box<Condition>,
    },
}

impl Condition {
    /// Creates a presence-of-all condition
    pub fn all_present<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::AllPresent {
            keys: keys.into_iter().map(Into::into).collect(),
        }
    }

    /// Creates a boolean flag condition
    pub fn is_true(key: impl Into<String>) -> Self {
        Self::IsTrue { key: key.into() }
    }

    /// Creates an all-of condition
    pub fn all(conditions: Vec<Condition>) -> Self {
        Self::All { conditions }
    }

    /// Creates an any-of condition
    pub fn any(conditions: Vec<Condition>) -> Self {
        Self::Any { conditions }
    }

    /// Creates a negated condition
    #[allow(clippy::should_implement_trait)]
    pub fn not(condition: Condition) -> Self {
        Self::Not {
            condition: Box::new(condition),
        }
    }

    /// Evaluates the condition against an environment snapshot
    pub fn evaluate(&self, env: &Environment) -> bool {
        match self {
            Self::AllPresent { keys } => keys
                .iter()
                .all(|key| env.get(key).is_some_and(|v| !v.trim().is_empty())),
            Self::IsTrue { key } => parse_flag(env.get(key).map(String::as_str)),
            Self::All { conditions } => conditions.iter().all(|c| c.evaluate(env)),
            Self::Any { conditions } => conditions.iter().any(|c| c.evaluate(env)),
            Self::Not { condition } => !condition.evaluate(env),
        }
    }

    /// Keys this condition reads, in declaration order
    pub fn keys(&self) -> Vec<&str> {
        match self {
            Self::AllPresent { keys } => keys.iter().map(String::as_str).collect(),
            Self::IsTrue { key } => vec![key.as_str()],
            Self::All { conditions } | Self::Any { conditions } => {
                conditions.iter().flat_map(Condition::keys).collect()
            }
            Self::Not { condition } => condition.keys(),
        }
    }
}

/// Parses a boolean flag value. Only `true` and `1` are truthy.
pub fn parse_flag(value: Option<&str>) -> bool {
    value.is_some_and(|v| {
        let v = v.trim();
        v.eq_ignore_ascii_case("true") || v == "1"
    })
}

impl Validate for Condition {
    type Error = ValidationError;

    fn validate(&self) -> Result<(), Self::Error> {
        match self {
            Self::AllPresent { keys } => {
                if keys.is_empty() {
                    return Err(ValidationError::InvalidCondition(
                        "all_present needs at least one key".to_string(),
                    ));
                }
                if keys.iter().any(|k| k.trim().is_empty()) {
                    return Err(ValidationError::InvalidCondition(
                        "key names cannot be empty".to_string(),
                    ));
                }
            }
            Self::IsTrue { key } => {
                if key.trim().is_empty() {
                    return Err(ValidationError::InvalidCondition(
                        "key names cannot be empty".to_string(),
                    ));
                }
            }
            Self::All { conditions } | Self::Any { conditions } => {
                for cond in conditions {
                    cond.validate()?;
                }
            }
            Self::Not { condition } => condition.validate()?,
        }
        Ok(())
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let join = |conditions: &[Condition], sep: &str| {
            conditions
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(sep)
        };
        match self {
            Self::AllPresent { keys } => write!(f, "present({})", keys.join(", ")),
            Self::IsTrue { key } => write!(f, "true({key})"),
            Self::All { conditions } => write!(f, "({})", join(conditions, " && ")),
            Self::Any { conditions } => write!(f, "({})", join(conditions, " || ")),
            Self::Not { condition } => write!(f, "!{condition}"),
        }
    }
}
