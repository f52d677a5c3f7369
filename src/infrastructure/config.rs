//! Configuration management
//!
//! Tool-level settings read from `shipline.yaml`, then overridden by
//! `SHIPLINE_*` environment variables:
//!
//! ```yaml
//! state_dir: .shipline
//! log_level: info
//! sonar:
//!   url: https://sonar.example.com
//!   token: squ_xxx
//! credentials:
//!   nexus:
//!     kind: environment
//!     username_var: NEXUS_USERNAME
//!     secret_var: NEXUS_PASSWORD
//! environment:
//!   STAGING_URL: http://staging:8080
//! ```

use crate::executor::CredentialSpec;
use crate::pipeline::{Environment, Validate};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// File looked up in the working directory when no path is given
pub const DEFAULT_CONFIG_FILE: &str = "shipline.yaml";

/// Prefix of environment variables overriding the file
const ENV_PREFIX: &str = "SHIPLINE_";

/// Configuration errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The file could not be read
    #[error("cannot read config file {path}: {reason}")]
    Io {
        /// Config file path
        path: PathBuf,
        /// OS error
        reason: String,
    },

    /// The file is not valid YAML for [`Config`]
    #[error("invalid config file: {0}")]
    Parse(String),

    /// A value is out of range
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Analysis server connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SonarConfig {
    /// Server base URL
    pub url: String,
    /// API token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// Application configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root of run directories, workspaces and lock files
    pub state_dir: PathBuf,
    /// Working tree override; defaults to `<state_dir>/<pipeline>/workspace`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace: Option<PathBuf>,
    /// Log level
    pub log_level: String,
    /// Analysis server for quality gates
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sonar: Option<SonarConfig>,
    /// Credential declarations by id
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub credentials: HashMap<String, CredentialSpec>,
    /// Site-wide environment defaults, layered over the pipeline's own
    #[serde(skip_serializing_if = "Environment::is_empty")]
    pub environment: Environment,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(".shipline"),
            workspace: None,
            log_level: "info".to_string(),
            sonar: None,
            credentials: HashMap::new(),
            environment: Environment::new(),
        }
    }
}

impl Validate for Config {
    type Error = ConfigError;

    fn validate(&self) -> Result<(), Self::Error> {
        if self.state_dir.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("state_dir cannot be empty".to_string()));
        }
        if let Some(sonar) = &self.sonar
            && sonar.url.trim().is_empty()
        {
            return Err(ConfigError::Invalid("sonar.url cannot be empty".to_string()));
        }
        Ok(())
    }
}

impl Config {
    /// Parses a YAML document
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] or [`ConfigError::Invalid`].
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_yaml::from_str(yaml).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads `path`, or `shipline.yaml` when it exists and no path is given,
    /// else the defaults. `SHIPLINE_*` variables of the process are applied
    /// last.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if an explicit file is missing or any file is
    /// invalid.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None if Path::new(DEFAULT_CONFIG_FILE).is_file() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => Self::default(),
        };
        config.apply_env_overrides(std::env::vars());
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a config file
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let yaml = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        tracing::debug!(path = %path.display(), "Loaded config file");
        Self::from_yaml_str(&yaml)
    }

    /// Applies `SHIPLINE_STATE_DIR`, `SHIPLINE_WORKSPACE`,
    /// `SHIPLINE_LOG_LEVEL`, `SHIPLINE_SONAR_URL` and `SHIPLINE_SONAR_TOKEN`
    /// from `vars`. Other variables are ignored.
    pub fn apply_env_overrides<I>(&mut self, vars: I)
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut overrides: HashMap<String, String> = vars
            .into_iter()
            .filter_map(|(key, value)| Some((key.strip_prefix(ENV_PREFIX)?.to_string(), value)))
            .collect();

        if let Some(value) = overrides.remove("STATE_DIR") {
            self.state_dir = PathBuf::from(value);
        }
        if let Some(value) = overrides.remove("WORKSPACE") {
            self.workspace = Some(PathBuf::from(value));
        }
        if let Some(value) = overrides.remove("LOG_LEVEL") {
            self.log_level = value;
        }
        if let Some(url) = overrides.remove("SONAR_URL") {
            match &mut self.sonar {
                Some(sonar) => sonar.url = url,
                None => {
                    self.sonar = Some(SonarConfig { url, token: None });
                }
            }
        }
        // A token without any server URL has nothing to attach to
        if let Some(token) = overrides.remove("SONAR_TOKEN")
            && let Some(sonar) = &mut self.sonar
        {
            sonar.token = Some(token);
        }

        for key in overrides.keys() {
            tracing::debug!(variable = %format!("{ENV_PREFIX}{key}"), "Ignoring unknown override");
        }
    }
}
