//! Credential resolution
//!
//! Credentials are looked up by id only when the step that binds them runs,
//! and live only as long as that step's nested steps.

use crate::pipeline::{Environment, PipelineError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// A resolved secret
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    /// Username and password pair
    UsernamePassword {
        /// Username
        username: String,
        /// Password
        password: String,
    },
    /// Bearer token
    Token(String),
}

impl Credential {
    /// The secret part of the credential
    #[must_use]
    pub fn secret(&self) -> &str {
        match self {
            Self::UsernamePassword { password, .. } => password,
            Self::Token(token) => token,
        }
    }

    /// Values to mask in output
    #[must_use]
    pub fn masked_values(&self) -> Vec<String> {
        match self {
            Self::UsernamePassword { password, .. } => vec![password.clone()],
            Self::Token(token) => vec![token.clone()],
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UsernamePassword { username, .. } => f
                .debug_struct("UsernamePassword")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
            Self::Token(_) => f.debug_tuple("Token").field(&"<redacted>").finish(),
        }
    }
}

/// How a credential is declared in the tool configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CredentialSpec {
    /// Literal username and password
    UsernamePassword {
        /// Username
        username: String,
        /// Password
        password: String,
    },
    /// Literal token
    Token {
        /// Token value
        token: String,
    },
    /// Read from run environment variables at resolution time
    Environment {
        /// Variable holding the username
        #[serde(default, skip_serializing_if = "Option::is_none")]
        username_var: Option<String>,
        /// Variable holding the password or token
        secret_var: String,
    },
}

/// Credential lookup failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CredentialError {
    /// No declaration and no environment fallback
    #[error("credential '{0}' is not defined")]
    Unknown(String),

    /// A referenced variable is missing or blank
    #[error("credential '{id}' needs variable '{variable}', which is not set")]
    MissingVariable {
        /// Credential id
        id: String,
        /// Missing variable
        variable: String,
    },
}

impl From<CredentialError> for PipelineError {
    fn from(err: CredentialError) -> Self {
        PipelineError::Credential(err.to_string())
    }
}

/// Source of named secrets
pub trait SecretStore: Send + Sync {
    /// Resolves the credential `id`, reading `env` for environment-backed
    /// declarations and fallbacks.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError`] when the credential cannot be produced.
    fn resolve(&self, id: &str, env: &Environment) -> Result<Credential, CredentialError>;
}

/// Secret store backed by configuration, falling back to conventional
/// environment variables.
///
/// For an undeclared id `nexus` the fallback reads `NEXUS_USERNAME` and
/// `NEXUS_PASSWORD`, or `NEXUS_TOKEN` when no password is set.
#[derive(Debug, Clone, Default)]
pub struct ConfiguredSecretStore {
    specs: HashMap<String, CredentialSpec>,
}

impl ConfiguredSecretStore {
    /// Creates a store from declarations
    #[must_use]
    pub fn new(specs: HashMap<String, CredentialSpec>) -> Self {
        Self { specs }
    }

    /// Adds a declaration
    #[must_use]
    pub fn with(mut self, id: impl Into<String>, spec: CredentialSpec) -> Self {
        self.specs.insert(id.into(), spec);
        self
    }
}

fn non_blank<'a>(env: &'a Environment, key: &str) -> Option<&'a String> {
    env.get(key).filter(|v| !v.trim().is_empty())
}

fn env_prefix(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

impl SecretStore for ConfiguredSecretStore {
    fn resolve(&self, id: &str, env: &Environment) -> Result<Credential, CredentialError> {
        match self.specs.get(id) {
            Some(CredentialSpec::UsernamePassword { username, password }) => {
                Ok(Credential::UsernamePassword {
                    username: username.clone(),
                    password: password.clone(),
                })
            }
            Some(CredentialSpec::Token { token }) => Ok(Credential::Token(token.clone())),
            Some(CredentialSpec::Environment {
                username_var,
                secret_var,
            }) => {
                let missing = |variable: &str| CredentialError::MissingVariable {
                    id: id.to_string(),
                    variable: variable.to_string(),
                };
                let secret = non_blank(env, secret_var).ok_or_else(|| missing(secret_var))?;
                match username_var {
                    Some(var) => {
                        let username = non_blank(env, var).ok_or_else(|| missing(var))?;
                        Ok(Credential::UsernamePassword {
                            username: username.clone(),
                            password: secret.clone(),
                        })
                    }
                    None => Ok(Credential::Token(secret.clone())),
                }
            }
            None => {
                let prefix = env_prefix(id);
                let username = non_blank(env, &format!("{prefix}_USERNAME"));
                let password = non_blank(env, &format!("{prefix}_PASSWORD"));
                if let (Some(username), Some(password)) = (username, password) {
                    return Ok(Credential::UsernamePassword {
                        username: username.clone(),
                        password: password.clone(),
                    });
                }
                non_blank(env, &format!("{prefix}_TOKEN"))
                    .map(|token| Credential::Token(token.clone()))
                    .ok_or_else(|| CredentialError::Unknown(id.to_string()))
            }
        }
    }
}
