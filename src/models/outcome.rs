use std::collections::HashMap;
use std::time::Duration;

use serde::Serialize;

/// What happened to a single asset during a processing pass.
#[derive(Debug, Clone, PartialEq)]
pub enum AssetOutcome {
    /// Newly classified and tagged.
    Tagged { labels: Vec<String> },
    /// Already carries the processed marker; nothing to do.
    AlreadyProcessed,
    /// Non-image kind. Terminal non-eligibility, never a failure.
    Unsupported,
    /// Processing aborted; recorded with the failure tracker.
    Failed { error: String },
}

#[derive(Debug, Clone)]
pub struct AssetReport {
    pub asset_id: String,
    pub outcome: AssetOutcome,
    pub elapsed: Duration,
}

/// Aggregate counts for one processed page of assets.
///
/// Only `processed` items count toward lifetime progress totals; skips and
/// unsupported items do not.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchStats {
    pub batch_size: usize,
    pub processed: usize,
    pub skipped: usize,
    pub unsupported: usize,
    pub failed: usize,
    pub labels_assigned: usize,
    pub elapsed: Duration,
}

impl BatchStats {
    pub fn record(&mut self, report: &AssetReport) {
        match &report.outcome {
            AssetOutcome::Tagged { labels } => {
                self.processed += 1;
                self.labels_assigned += labels.len();
            }
            AssetOutcome::AlreadyProcessed => self.skipped += 1,
            AssetOutcome::Unsupported => self.unsupported += 1,
            AssetOutcome::Failed { .. } => self.failed += 1,
        }
    }
}

/// Per-library slice of the lifetime progress counters.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct LibraryProgress {
    pub assets_processed: u64,
    pub tags_assigned: u64,
}

/// Monotonic process-lifetime totals, reset only by explicit operator action.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProgressCounters {
    pub total_processed: u64,
    pub total_tags_assigned: u64,
    pub per_library: HashMap<String, LibraryProgress>,
}

impl ProgressCounters {
    pub fn record_batch(&mut self, library: &str, stats: &BatchStats) {
        self.total_processed += stats.processed as u64;
        self.total_tags_assigned += stats.labels_assigned as u64;
        let entry = self.per_library.entry(library.to_string()).or_default();
        entry.assets_processed += stats.processed as u64;
        entry.tags_assigned += stats.labels_assigned as u64;
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
