//! # Shipline - declarative delivery pipelines
//!
//! Shipline runs multi-stage delivery pipelines (build, scan, package,
//! publish, deploy, dynamic scan) described as data. Stages are gated on
//! environment conditions, every stage has a guaranteed post block, and a
//! pipeline-level cleanup runs exactly once whatever happened before it.
//!
//! ## Quick Start
//!
//! ```no_run
//! use shipline::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let pipeline = Pipeline::builder()
//!     .name("shop")
//!     .stage(
//!         StageBuilder::new("Build")
//!             .step(Step::shell("mvn -B verify"))
//!             .build()?,
//!     )
//!     .stage(
//!         StageBuilder::new("Deploy")
//!             .when(Condition::all_present(["STAGING_URL"]))
//!             .step(Step::health_check("${STAGING_URL}/health", 10, std::time::Duration::from_secs(3)))
//!             .build()?,
//!     )
//!     .build()?;
//!
//! let engine = PipelineEngine::new(
//!     Collaborators::new(Arc::new(ShellRunner::new())),
//!     EngineSettings::new(".shipline"),
//! );
//! let result = engine.run(&pipeline, RunRequest::new()).await?;
//! println!("{}", result.status);
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! - **Conditional stages**: `when` predicates over the run environment
//! - **Guaranteed post hooks**: per stage and once per run, bounded by a grace period
//! - **Collaborator seams**: commands, health probes, quality gates and uploads behind traits
//! - **Run isolation**: per-pipeline locks, run directories and archived reports
//!
//! ## License
//!
//! Licensed under either of
//! - Apache License, Version 2.0 ([LICENSE-APACHE](LICENSE-APACHE) or <https://www.apache.org/licenses/LICENSE-2.0>)
//! - MIT license ([LICENSE-MIT](LICENSE-MIT) or <https://opensource.org/licenses/MIT>)
//!
//! at your option.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod delivery;
pub mod executor;
pub mod infrastructure;
pub mod pipeline;

// Prelude module for common imports
pub mod prelude;

// Re-export commonly used types
pub use delivery::DeliveryConfig;
pub use executor::{
    Collaborators, CommandRunner, EngineError, EngineSettings, PipelineEngine, RunRequest,
    ShellRunner,
};
pub use infrastructure::{Config, MetricsCollector, PipelineMetrics};
pub use pipeline::{
    Condition, Environment, Pipeline, PipelineBuilder, PipelineOptions, PipelineResult,
    PipelineStatus, PostCondition, Stage, StageBuilder, StageStatus, Step, StepType, Validate,
};

/// Version of the shipline crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
