//! `shipline check` - Validate a pipeline definition
//!
//! Parses the YAML and runs the same validation the engine applies before a
//! run, without touching the state directory.
//!
//! ## Example
//!
//! ```bash
//! shipline check pipeline.yaml
//! # Exit code 0: definition is valid
//! # Exit code 1: parse or validation error
//! ```

use anyhow::{Context, Result};
use shipline::pipeline::Pipeline;
use std::path::Path;

/// Validates the pipeline at `file` and returns a one-line summary
pub fn check_pipeline(file: &Path) -> Result<String> {
    tracing::debug!(file = %file.display(), "Validating pipeline");

    if !file.exists() {
        anyhow::bail!("Pipeline file not found: {}", file.display());
    }

    if !matches!(
        file.extension().and_then(|e| e.to_str()),
        Some("yaml" | "yml")
    ) {
        tracing::warn!(file = %file.display(), "File does not have a .yaml extension");
    }

    let pipeline = Pipeline::from_file(file).context("Pipeline validation failed")?;

    let conditional = pipeline.stages.iter().filter(|s| s.when.is_some()).count();
    let summary = format!(
        "{} ({} stages, {conditional} conditional, {} cleanup hooks)",
        pipeline.name,
        pipeline.stage_count(),
        pipeline.post.len()
    );
    tracing::info!(pipeline = %pipeline.name, "Pipeline validation successful");
    Ok(summary)
}
