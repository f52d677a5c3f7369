//! Infrastructure layer
//!
//! This module contains external integrations and adapters.

mod config;
mod docker;
mod lock;
mod logging;
mod metrics;
mod scm;

pub use config::{Config, ConfigError, DEFAULT_CONFIG_FILE, SonarConfig};
pub use docker::DockerCli;
pub use lock::{LockError, LockRegistry, RunLockGuard};
pub use logging::init_logging;
pub use metrics::{MetricsCollector, PipelineMetrics};
pub use scm::GitCheckout;
