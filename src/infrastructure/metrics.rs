//! Metrics collection
//!
//! Keeps the latest run summary per pipeline, in memory.

use crate::pipeline::{PipelineResult, PipelineStatus, StageStatus};
use ahash::AHashMap;
use parking_lot::RwLock;
use std::time::Duration;

/// Summary of one pipeline run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineMetrics {
    /// Pipeline name
    pub pipeline_name: String,

    /// Run number
    pub run_number: u64,

    /// Overall status
    pub status: PipelineStatus,

    /// Execution duration
    pub duration: Duration,

    /// Number of stages that produced a result
    pub stage_count: usize,

    /// Number of successful stages
    pub successful_stages: usize,

    /// Number of unstable stages
    pub unstable_stages: usize,

    /// Number of failed stages
    pub failed_stages: usize,

    /// Number of skipped stages
    pub skipped_stages: usize,

    /// Number of artifacts archived or published
    pub artifact_count: usize,
}

impl PipelineMetrics {
    /// Summarizes a finished run
    pub fn from_result(result: &PipelineResult) -> Self {
        let count = |status: StageStatus| {
            result
                .stages
                .iter()
                .filter(|stage| stage.status == status)
                .count()
        };

        Self {
            pipeline_name: result.pipeline.clone(),
            run_number: result.run_number,
            status: result.status,
            duration: result.duration,
            stage_count: result.stages.len(),
            successful_stages: count(StageStatus::Success),
            unstable_stages: count(StageStatus::Unstable),
            failed_stages: count(StageStatus::Failure),
            skipped_stages: count(StageStatus::Skipped),
            artifact_count: result.artifacts().count(),
        }
    }
}

/// Metrics collector for pipeline executions
#[derive(Debug, Default)]
pub struct MetricsCollector {
    metrics: RwLock<AHashMap<String, PipelineMetrics>>,
}

impl MetricsCollector {
    /// Creates a new metrics collector
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the summary of a finished run, replacing the previous one
    pub fn record(&self, result: &PipelineResult) {
        let metrics = PipelineMetrics::from_result(result);
        tracing::debug!(
            pipeline = %metrics.pipeline_name,
            status = %metrics.status,
            failed = metrics.failed_stages,
            skipped = metrics.skipped_stages,
            "Recorded run metrics"
        );
        self.metrics
            .write()
            .insert(metrics.pipeline_name.clone(), metrics);
    }

    /// Gets metrics for a specific pipeline
    #[must_use]
    pub fn get(&self, pipeline_name: &str) -> Option<PipelineMetrics> {
        self.metrics.read().get(pipeline_name).cloned()
    }

    /// Gets all recorded metrics
    #[must_use]
    pub fn get_all(&self) -> Vec<PipelineMetrics> {
        self.metrics.read().values().cloned().collect()
    }
}
