//! Pipeline options
//!
//! This module defines run-wide configuration options for pipelines, plus the
//! human-readable duration format used throughout definitions.

use super::errors::ValidationError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default global budget for one run.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(45 * 60);

/// Default budget for post hooks and cleanup after an abort.
pub const DEFAULT_CLEANUP_GRACE: Duration = Duration::from_secs(5 * 60);

/// ANSI color handling for console logs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogColor {
    /// Color when stdout is a terminal
    #[default]
    Auto,
    /// Always emit ANSI escapes
    Always,
    /// Never emit ANSI escapes
    Never,
}

impl LogColor {
    /// Resolves the mode against the current stdout
    #[must_use]
    pub fn enabled(self) -> bool {
        match self {
            Self::Auto => std::io::IsTerminal::is_terminal(&std::io::stdout()),
            Self::Always => true,
            Self::Never => false,
        }
    }
}

/// What to do when another run holds the lock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConcurrencyPolicy {
    /// Fail the new run immediately
    #[default]
    Reject,
    /// Wait for the lock until the global timeout
    Queue,
}

/// Pipeline configuration options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineOptions {
    /// Global timeout for the entire run
    #[serde(with = "duration_format")]
    pub timeout: Duration,

    /// Whether runs of this pipeline may overlap
    pub allow_concurrent_runs: bool,

    /// Behavior when a run is already in flight
    pub concurrency: ConcurrencyPolicy,

    /// Lock identity; defaults to the pipeline name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lock_resource: Option<String>,

    /// Console color mode
    pub log_color: LogColor,

    /// Prefix log lines with timestamps
    pub timestamps: bool,

    /// Budget for post hooks and cleanup once the global timeout fired
    #[serde(with = "duration_format")]
    pub cleanup_grace: Duration,

    /// Skip default checkout
    pub skip_default_checkout: bool,

    /// Build discarder configuration
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build_discarder: Option<BuildDiscarder>,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            allow_concurrent_runs: false,
            concurrency: ConcurrencyPolicy::Reject,
            lock_resource: None,
            log_color: LogColor::Auto,
            timestamps: true,
            cleanup_grace: DEFAULT_CLEANUP_GRACE,
            skip_default_checkout: false,
            build_discarder: None,
        }
    }
}

/// Build discarder configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct BuildDiscarder {
    /// Number of run directories to keep
    pub num_to_keep: usize,
}

impl BuildDiscarder {
    /// Creates new build discarder
    #[must_use]
    pub fn new(num_to_keep: usize) -> Self {
        Self { num_to_keep }
    }
}

impl super::Validate for PipelineOptions {
    type Error = ValidationError;

    fn validate(&self) -> Result<(), Self::Error> {
        if self.timeout.is_zero() {
            return Err(ValidationError::InvalidTimeout { value: 0 });
        }

        if let Some(resource) = &self.lock_resource
            && resource.trim().is_empty()
        {
            return Err(ValidationError::EmptyName);
        }

        if let Some(discarder) = &self.build_discarder
            && discarder.num_to_keep == 0
        {
            return Err(ValidationError::InvalidStep(
                "build_discarder.num_to_keep must be positive".to_string(),
            ));
        }

        Ok(())
    }
}

impl PipelineOptions {
    /// Creates new pipeline options
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets global timeout
    #[must_use]
    pub fn with_timeout(mut self, duration: Duration) -> Self {
        self.timeout = duration;
        self
    }

    /// Allows or forbids overlapping runs
    #[must_use]
    pub fn with_concurrent_runs(mut self, allow: bool) -> Self {
        self.allow_concurrent_runs = allow;
        self
    }

    /// Sets the lock contention policy
    #[must_use]
    pub fn with_concurrency(mut self, policy: ConcurrencyPolicy) -> Self {
        self.concurrency = policy;
        self
    }

    /// Sets an explicit lock identity
    #[must_use]
    pub fn with_lock_resource(mut self, resource: impl Into<String>) -> Self {
        self.lock_resource = Some(resource.into());
        self
    }

    /// Sets console color mode
    #[must_use]
    pub fn with_log_color(mut self, color: LogColor) -> Self {
        self.log_color = color;
        self
    }

    /// Sets the post-abort cleanup budget
    #[must_use]
    pub fn with_cleanup_grace(mut self, grace: Duration) -> Self {
        self.cleanup_grace = grace;
        self
    }

    /// Sets skip default checkout
    #[must_use]
    pub fn with_skip_default_checkout(mut self, skip: bool) -> Self {
        self.skip_default_checkout = skip;
        self
    }

    /// Sets build discarder
    #[must_use]
    pub fn with_build_discarder(mut self, discarder: BuildDiscarder) -> Self {
        self.build_discarder = Some(discarder);
        self
    }
}

/// Parses durations like `45m`, `3s`, `250ms`, `1h` or a bare number of seconds.
///
/// # Errors
///
/// Returns a message when the unit is unknown, the number is malformed or
/// the duration does not fit in 64-bit seconds.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let input = input.trim();
    let split = input
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(input.len());
    let (number, unit) = input.split_at(split);
    let value: u64 = number
        .parse()
        .map_err(|_| format!("invalid duration '{input}'"))?;

    let scaled = |factor: u64| {
        value
            .checked_mul(factor)
            .map(Duration::from_secs)
            .ok_or_else(|| format!("duration '{input}' is too large"))
    };

    match unit.trim() {
        "" | "s" | "sec" | "secs" => Ok(Duration::from_secs(value)),
        "ms" => Ok(Duration::from_millis(value)),
        "m" | "min" | "mins" => scaled(60),
        "h" => scaled(3600),
        other => Err(format!("unknown duration unit '{other}' in '{input}'")),
    }
}

/// Formats a duration with the largest unit that represents it exactly.
#[must_use]
pub fn format_duration(duration: Duration) -> String {
    let millis = duration.as_millis();
    if millis == 0 {
        return "0s".to_string();
    }
    if millis % 1000 != 0 {
        return format!("{millis}ms");
    }
    let secs = duration.as_secs();
    if secs % 3600 == 0 {
        format!("{}h", secs / 3600)
    } else if secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{secs}s")
    }
}

/// Serde adapter for [`Duration`] fields using [`parse_duration`] and
/// [`format_duration`].
pub mod duration_format {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Seconds(u64),
        Text(String),
    }

    /// Serializes a duration as a human-readable string
    ///
    /// # Errors
    ///
    /// Propagates serializer errors.
    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_duration(*value))
    }

    /// Deserializes a duration from a string or a number of seconds
    ///
    /// # Errors
    ///
    /// Fails on malformed durations.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        match Raw::deserialize(deserializer)? {
            Raw::Seconds(secs) => Ok(Duration::from_secs(secs)),
            Raw::Text(text) => super::parse_duration(&text).map_err(serde::de::Error::custom),
        }
    }

    /// Same format for `Option<Duration>` fields
    pub mod option {
        use serde::{Deserialize, Deserializer, Serializer};
        use std::time::Duration;

        /// Serializes an optional duration
        ///
        /// # Errors
        ///
        /// Propagates serializer errors.
        pub fn serialize<S: Serializer>(
            value: &Option<Duration>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(duration) => super::serialize(duration, serializer),
                None => serializer.serialize_none(),
            }
        }

        /// Deserializes an optional duration
        ///
        /// # Errors
        ///
        /// Fails on malformed durations.
        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Duration>, D::Error> {
            match Option::<super::Raw>::deserialize(deserializer)? {
                None => Ok(None),
                Some(super::Raw::Seconds(secs)) => Ok(Some(Duration::from_secs(secs))),
                Some(super::Raw::Text(text)) => super::super::parse_duration(&text)
                    .map(Some)
                    .map_err(serde::de::Error::custom),
            }
        }
    }
}
