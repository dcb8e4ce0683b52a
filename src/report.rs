//! Run reporting.
//!
//! Progress and outcome reporting goes through an injected [`Reporter`]
//! rather than process-wide flags; suppression is a configuration field on
//! the reporter itself.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Reporter behavior knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReporterConfig {
    /// Suppress per-partition progress lines (summary still emitted).
    pub quiet: bool,
    /// Emit a progress line every N queries.
    pub progress_every: u64,
}

impl Default for ReporterConfig {
    fn default() -> Self {
        Self {
            quiet: false,
            progress_every: 10,
        }
    }
}

/// Counters for one partition's run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PartitionStats {
    pub queries: u64,
    pub saved: u64,
    pub updated: u64,
    pub not_found: u64,
    pub errors: u64,
    pub worker_restarts: u32,
}

/// Final state of one partition after the run.
#[derive(Debug, Clone, Serialize)]
pub struct PartitionReport {
    pub partition: String,
    pub stats: PartitionStats,
    pub failed: bool,
    pub failure: Option<String>,
}

/// Aggregated result of a whole run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub mode: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub partitions: Vec<PartitionReport>,
    pub interrupted: bool,
}

impl RunSummary {
    /// Sum of all partition counters.
    pub fn totals(&self) -> PartitionStats {
        let mut total = PartitionStats::default();
        for report in &self.partitions {
            total.queries += report.stats.queries;
            total.saved += report.stats.saved;
            total.updated += report.stats.updated;
            total.not_found += report.stats.not_found;
            total.errors += report.stats.errors;
            total.worker_restarts += report.stats.worker_restarts;
        }
        total
    }

    pub fn failed_partitions(&self) -> usize {
        self.partitions.iter().filter(|p| p.failed).count()
    }
}

/// Progress and outcome sink injected into the orchestrator.
pub trait Reporter: Send + Sync {
    fn partition_started(&self, partition: &str);
    fn progress(&self, partition: &str, stats: &PartitionStats);
    fn partition_finished(&self, partition: &str, stats: &PartitionStats);
    fn partition_failed(&self, partition: &str, reason: &str);
    fn run_finished(&self, summary: &RunSummary);
}

/// Default reporter: structured log lines through `tracing`.
pub struct TracingReporter {
    config: ReporterConfig,
}

impl TracingReporter {
    pub fn new(config: ReporterConfig) -> Self {
        Self { config }
    }
}

impl Reporter for TracingReporter {
    fn partition_started(&self, partition: &str) {
        if !self.config.quiet {
            info!(partition, "partition started");
        }
    }

    fn progress(&self, partition: &str, stats: &PartitionStats) {
        if self.config.quiet || self.config.progress_every == 0 {
            return;
        }
        if stats.queries > 0 && stats.queries % self.config.progress_every == 0 {
            info!(partition, queries = stats.queries, saved = stats.saved,
                  updated = stats.updated, not_found = stats.not_found,
                  errors = stats.errors, "progress");
        }
    }

    fn partition_finished(&self, partition: &str, stats: &PartitionStats) {
        if !self.config.quiet {
            info!(partition, queries = stats.queries, saved = stats.saved,
                  updated = stats.updated, not_found = stats.not_found,
                  errors = stats.errors, restarts = stats.worker_restarts,
                  "partition finished");
        }
    }

    fn partition_failed(&self, partition: &str, reason: &str) {
        warn!(partition, reason, "partition failed for this run");
    }

    fn run_finished(&self, summary: &RunSummary) {
        let totals = summary.totals();
        info!(
            mode = %summary.mode,
            partitions = summary.partitions.len(),
            failed_partitions = summary.failed_partitions(),
            queries = totals.queries,
            saved = totals.saved,
            updated = totals.updated,
            not_found = totals.not_found,
            errors = totals.errors,
            interrupted = summary.interrupted,
            "run finished"
        );
    }
}
