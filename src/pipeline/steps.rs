//! Step types for pipeline execution
//!
//! This module defines step types that represent atomic units of work. Steps
//! are plain data; the stage executor gives them behavior.

#![allow(clippy::must_use_candidate, clippy::return_self_not_must_use)]

use super::Validate;
use super::errors::ValidationError;
use super::options::{duration_format, format_duration};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Types of steps available in pipelines
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepType {
    /// Shell command execution
    Shell {
        /// Command to execute
        command: String,
        /// Non-zero exit codes that mark the stage unstable instead of failed
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tolerated_exit_codes: Vec<i32>,
    },

    /// Echo message
    Echo {
        /// Message to output
        message: String,
    },

    /// Change directory
    Dir {
        /// Directory path, relative to the workspace
        path: String,
        /// Steps to execute in directory
        steps: Vec<Step>,
    },

    /// Timeout for a step
    Timeout {
        /// Maximum duration
        #[serde(with = "duration_format")]
        duration: Duration,
        /// Step to execute with timeout
        step: Box<Step>,
    },

    /// Bind a credential for the nested steps
    WithCredentials {
        /// Credential id in the secret store
        credential_id: String,
        /// Variable receiving the username, for username/password credentials
        #[serde(default, skip_serializing_if = "Option::is_none")]
        username_variable: Option<String>,
        /// Variable receiving the password or token
        password_variable: String,
        /// Steps that see the binding
        steps: Vec<Step>,
    },

    /// Poll an HTTP endpoint until it answers 2xx
    HealthCheck {
        /// Endpoint URL, may reference variables
        url: String,
        /// Maximum number of attempts
        max_attempts: u32,
        /// Pause between attempts
        #[serde(with = "duration_format")]
        interval: Duration,
    },

    /// Wait for the analysis server's verdict
    QualityGate {
        /// Project key the analysis was submitted under
        project_key: String,
        /// Maximum time to wait for the verdict
        #[serde(with = "duration_format")]
        poll_timeout: Duration,
    },

    /// Upload one build artifact
    Publish {
        /// Glob pattern locating the artifact
        pattern: String,
        /// Destination base URL
        destination: String,
        /// Credential id used for authentication
        credential_id: String,
    },

    /// Copy files into the run's artifact directory
    Archive {
        /// Glob pattern relative to the working directory
        pattern: String,
        /// Label recorded on each artifact
        label: String,
        /// Succeed when nothing matches
        #[serde(default)]
        allow_empty: bool,
    },

    /// Remove a container if it exists
    RemoveContainer {
        /// Container name
        container: String,
    },
}

impl StepType {
    /// Creates a shell command step
    pub fn shell(command: impl Into<String>) -> Self {
        Self::Shell {
            command: command.into(),
            tolerated_exit_codes: Vec::new(),
        }
    }

    /// Creates an echo step
    pub fn echo(message: impl Into<String>) -> Self {
        Self::Echo {
            message: message.into(),
        }
    }

    /// Creates a directory change step
    pub fn dir(path: impl Into<String>, steps: Vec<Step>) -> Self {
        Self::Dir {
            path: path.into(),
            steps,
        }
    }

    /// Creates a timeout step
    pub fn timeout(duration: Duration, step: Step) -> Self {
        Self::Timeout {
            duration,
            step: Box::new(step),
        }
    }

    /// Short name of the step kind, used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Shell { .. } => "sh",
            Self::Echo { .. } => "echo",
            Self::Dir { .. } => "dir",
            Self::Timeout { .. } => "timeout",
            Self::WithCredentials { .. } => "withCredentials",
            Self::HealthCheck { .. } => "healthCheck",
            Self::QualityGate { .. } => "waitForQualityGate",
            Self::Publish { .. } => "publish",
            Self::Archive { .. } => "archiveArtifacts",
            Self::RemoveContainer { .. } => "removeContainer",
        }
    }
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shell { command, .. } => write!(f, "sh({command})"),
            Self::Echo { message } => write!(f, "echo({message})"),
            Self::Dir { path, steps } => write!(f, "dir({path}, {} steps)", steps.len()),
            Self::Timeout { duration, step } => {
                write!(f, "timeout({}, {})", format_duration(*duration), step.step_type)
            }
            Self::WithCredentials {
                credential_id,
                steps,
                ..
            } => write!(f, "withCredentials({credential_id}, {} steps)", steps.len()),
            Self::HealthCheck {
                url,
                max_attempts,
                interval,
            } => write!(
                f,
                "healthCheck({url}, {max_attempts}x{})",
                format_duration(*interval)
            ),
            Self::QualityGate {
                project_key,
                poll_timeout,
            } => write!(
                f,
                "waitForQualityGate({project_key}, {})",
                format_duration(*poll_timeout)
            ),
            Self::Publish {
                pattern,
                destination,
                ..
            } => write!(f, "publish({pattern} -> {destination})"),
            Self::Archive { pattern, .. } => write!(f, "archiveArtifacts({pattern})"),
            Self::RemoveContainer { container } => write!(f, "removeContainer({container})"),
        }
    }
}

/// A single step in a pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    /// Type of step
    #[serde(flatten)]
    pub step_type: StepType,

    /// Optional name for the step
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Optional timeout override for this step
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "duration_format::option"
    )]
    pub timeout: Option<Duration>,
}

impl Step {
    /// Creates a new step
    pub fn new(step_type: StepType) -> Self {
        Self {
            step_type,
            name: None,
            timeout: None,
        }
    }

    /// Sets the name of the step
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the timeout for the step
    pub fn with_timeout(mut self, duration: Duration) -> Self {
        self.timeout = Some(duration);
        self
    }

    /// Creates a shell command step
    pub fn shell(command: impl Into<String>) -> Self {
        Self::new(StepType::shell(command))
    }

    /// Creates a shell step where the given exit codes only make the stage unstable
    pub fn shell_tolerating(command: impl Into<String>, codes: impl Into<Vec<i32>>) -> Self {
        Self::new(StepType::Shell {
            command: command.into(),
            tolerated_exit_codes: codes.into(),
        })
    }

    /// Creates an echo step
    pub fn echo(message: impl Into<String>) -> Self {
        Self::new(StepType::echo(message))
    }

    /// Creates a directory change step
    pub fn dir(path: impl Into<String>, steps: Vec<Step>) -> Self {
        Self::new(StepType::dir(path, steps))
    }

    /// Creates a timeout step
    pub fn timeout(duration: Duration, step: Self) -> Self {
        Self::new(StepType::timeout(duration, step))
    }

    /// Binds a username/password credential around `steps`
    pub fn with_credentials(
        credential_id: impl Into<String>,
        username_variable: impl Into<String>,
        password_variable: impl Into<String>,
        steps: Vec<Step>,
    ) -> Self {
        Self::new(StepType::WithCredentials {
            credential_id: credential_id.into(),
            username_variable: Some(username_variable.into()),
            password_variable: password_variable.into(),
            steps,
        })
    }

    /// Binds a token credential around `steps`
    pub fn with_token(
        credential_id: impl Into<String>,
        variable: impl Into<String>,
        steps: Vec<Step>,
    ) -> Self {
        Self::new(StepType::WithCredentials {
            credential_id: credential_id.into(),
            username_variable: None,
            password_variable: variable.into(),
            steps,
        })
    }

    /// Creates a health check step
    pub fn health_check(url: impl Into<String>, max_attempts: u32, interval: Duration) -> Self {
        Self::new(StepType::HealthCheck {
            url: url.into(),
            max_attempts,
            interval,
        })
    }

    /// Creates a quality gate step
    pub fn quality_gate(project_key: impl Into<String>, poll_timeout: Duration) -> Self {
        Self::new(StepType::QualityGate {
            project_key: project_key.into(),
            poll_timeout,
        })
    }

    /// Creates a publish step
    pub fn publish(
        pattern: impl Into<String>,
        destination: impl Into<String>,
        credential_id: impl Into<String>,
    ) -> Self {
        Self::new(StepType::Publish {
            pattern: pattern.into(),
            destination: destination.into(),
            credential_id: credential_id.into(),
        })
    }

    /// Creates an archive step
    pub fn archive(pattern: impl Into<String>, label: impl Into<String>) -> Self {
        Self::new(StepType::Archive {
            pattern: pattern.into(),
            label: label.into(),
            allow_empty: false,
        })
    }

    /// Creates an archive step that tolerates no matches
    pub fn archive_optional(pattern: impl Into<String>, label: impl Into<String>) -> Self {
        Self::new(StepType::Archive {
            pattern: pattern.into(),
            label: label.into(),
            allow_empty: true,
        })
    }

    /// Creates a container removal step
    pub fn remove_container(container: impl Into<String>) -> Self {
        Self::new(StepType::RemoveContainer {
            container: container.into(),
        })
    }
}

fn require(value: &str, what: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::InvalidStep(format!("{what} cannot be empty")));
    }
    Ok(())
}

fn validate_all(steps: &[Step], what: &str) -> Result<(), ValidationError> {
    if steps.is_empty() {
        return Err(ValidationError::InvalidStep(format!(
            "{what} needs at least one nested step"
        )));
    }
    steps.iter().try_for_each(Validate::validate)
}

impl Validate for Step {
    type Error = ValidationError;

    fn validate(&self) -> Result<(), Self::Error> {
        if let Some(timeout) = self.timeout
            && timeout.is_zero()
        {
            return Err(ValidationError::InvalidTimeout { value: 0 });
        }

        match &self.step_type {
            StepType::Shell { command, .. } => require(command, "sh command"),
            StepType::Echo { .. } => Ok(()),
            StepType::Dir { path, steps } => {
                require(path, "dir path")?;
                validate_all(steps, "dir")
            }
            StepType::Timeout { duration, step } => {
                if duration.is_zero() {
                    return Err(ValidationError::InvalidTimeout { value: 0 });
                }
                step.validate()
            }
            StepType::WithCredentials {
                credential_id,
                username_variable,
                password_variable,
                steps,
            } => {
                require(credential_id, "credential id")?;
                require(password_variable, "password variable")?;
                if let Some(var) = username_variable {
                    require(var, "username variable")?;
                }
                validate_all(steps, "withCredentials")
            }
            StepType::HealthCheck {
                url, max_attempts, ..
            } => {
                require(url, "health check url")?;
                if *max_attempts == 0 {
                    return Err(ValidationError::InvalidAttempts { value: 0 });
                }
                Ok(())
            }
            StepType::QualityGate {
                project_key,
                poll_timeout,
            } => {
                require(project_key, "project key")?;
                if poll_timeout.is_zero() {
                    return Err(ValidationError::InvalidTimeout { value: 0 });
                }
                Ok(())
            }
            StepType::Publish {
                pattern,
                destination,
                credential_id,
            } => {
                require(pattern, "publish pattern")?;
                require(destination, "publish destination")?;
                require(credential_id, "credential id")
            }
            StepType::Archive { pattern, .. } => require(pattern, "archive pattern"),
            StepType::RemoveContainer { container } => require(container, "container name"),
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "Step({}): {}", name, self.step_type),
            None => write!(f, "Step: {}", self.step_type),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_step_type_shell() {
        let step_type = StepType::shell("mvn clean verify");
        assert!(matches!(step_type, StepType::Shell { .. }));
        assert_eq!(step_type.to_string(), "sh(mvn clean verify)");
    }

    #[test]
    fn test_step_with_name() {
        let step = Step::shell("mvn package").with_name("Build");
        assert_eq!(step.name, Some("Build".to_string()));
        assert_eq!(step.to_string(), "Step(Build): sh(mvn package)");
    }

    #[test]
    fn test_step_timeout_display() {
        let step = Step::timeout(Duration::from_secs(60), Step::shell("make"));
        assert_eq!(step.step_type.to_string(), "timeout(1m, sh(make))");
    }

    #[test]
    fn test_step_validation() {
        assert!(Step::shell("ls").validate().is_ok());
        assert!(Step::shell("  ").validate().is_err());
        assert!(matches!(
            Step::health_check("http://x", 0, Duration::from_secs(1)).validate(),
            Err(ValidationError::InvalidAttempts { value: 0 })
        ));
        assert!(
            Step::quality_gate("app", Duration::ZERO)
                .validate()
                .is_err()
        );
        assert!(Step::dir("sub", vec![]).validate().is_err());
        assert!(
            Step::with_credentials("nexus", "U", "P", vec![Step::shell("")])
                .validate()
                .is_err()
        );
        assert!(
            Step::shell("ls")
                .with_timeout(Duration::ZERO)
                .validate()
                .is_err()
        );
    }

    #[test]
    fn test_step_yaml_shape() {
        let yaml = r"
type: shell
command: zap-baseline.py -t ${STAGING_URL}
tolerated_exit_codes: [2]
timeout: 10m
";
        let step: Step = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(
            step.step_type,
            StepType::Shell {
                command: "zap-baseline.py -t ${STAGING_URL}".to_string(),
                tolerated_exit_codes: vec![2],
            }
        );
        assert_eq!(step.timeout, Some(Duration::from_secs(600)));
    }

    #[test]
    fn test_health_check_yaml() {
        let yaml = "type: health_check\nurl: http://localhost:8080/health\nmax_attempts: 10\ninterval: 3s\n";
        let step: Step = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(
            step,
            Step::health_check("http://localhost:8080/health", 10, Duration::from_secs(3))
        );
    }

    #[test]
    fn test_nested_steps_serialize() {
        let step = Step::with_token(
            "sonar",
            "SONAR_TOKEN",
            vec![Step::dir("app", vec![Step::shell("mvn sonar:sonar")])],
        );
        let yaml = serde_yaml::to_string(&step).unwrap();
        let back: Step = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back, step);
    }

    #[test]
    fn test_step_kind() {
        assert_eq!(Step::remove_container("app").step_type.kind(), "removeContainer");
        assert_eq!(Step::archive("*.xml", "reports").step_type.kind(), "archiveArtifacts");
    }
}
