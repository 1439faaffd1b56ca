//! Durable per-asset failure tracking.
//!
//! Every failed processing attempt is counted; once the configured threshold
//! is reached the asset is marked permanently failed and excluded from all
//! future cycles until explicitly reset. State lives in a single JSON file
//! that is rewritten whole on every mutation and may be edited or deleted
//! externally between cycles — `reconcile_external_changes` picks that up via
//! the file's modification time.
//!
//! Persistence problems are warnings, never fatal: a load error starts with
//! an empty store, a save error leaves the in-memory state authoritative
//! until the next successful save. Two processes sharing one failure file
//! are not coordinated; concurrent writers can lose updates.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailureRecord {
    pub attempts: u32,
    pub last_failed: DateTime<Utc>,
    pub permanently_failed: bool,
}

/// On-disk layout: the record map plus bookkeeping, serialized as a whole.
#[derive(Debug, Serialize, Deserialize)]
struct FailureStore {
    failures: HashMap<String, FailureRecord>,
    updated_at: DateTime<Utc>,
    failure_threshold: u32,
}

/// Operator-facing snapshot of failure state.
#[derive(Debug, Clone, Serialize)]
pub struct FailureSummary {
    pub total_failed_assets: usize,
    pub permanently_failed: usize,
    pub retry_candidates: usize,
    pub failure_threshold: u32,
    pub permanently_failed_ids: Vec<String>,
}

pub struct FailureTracker {
    path: PathBuf,
    threshold: u32,
    failures: HashMap<String, FailureRecord>,
    last_mtime: Option<SystemTime>,
}

impl FailureTracker {
    /// Open (or start) the failure store at `path`. A `threshold` of 0 means
    /// an asset becomes permanent on its first failure.
    pub fn new(path: impl Into<PathBuf>, threshold: u32) -> Self {
        let mut tracker = Self {
            path: path.into(),
            threshold,
            failures: HashMap::new(),
            last_mtime: None,
        };
        tracker.load();
        tracker
    }

    fn load(&mut self) {
        if !self.path.exists() {
            tracing::debug!(path = %self.path.display(), "no failure file, starting fresh");
            self.failures = HashMap::new();
            self.last_mtime = None;
            return;
        }

        self.last_mtime = file_mtime(&self.path);
        match fs::read_to_string(&self.path)
            .map_err(|e| e.to_string())
            .and_then(|text| serde_json::from_str::<FailureStore>(&text).map_err(|e| e.to_string()))
        {
            Ok(store) => {
                tracing::debug!(count = store.failures.len(), "loaded failure records");
                self.failures = store.failures;
            }
            Err(error) => {
                tracing::warn!(%error, path = %self.path.display(),
                    "failed to load failure data, starting fresh");
                self.failures = HashMap::new();
            }
        }
    }

    fn save(&mut self) {
        let store = FailureStore {
            failures: self.failures.clone(),
            updated_at: Utc::now(),
            failure_threshold: self.threshold,
        };
        let result = serde_json::to_string_pretty(&store)
            .map_err(|e| e.to_string())
            .and_then(|json| fs::write(&self.path, json).map_err(|e| e.to_string()));

        match result {
            Ok(()) => {
                self.last_mtime = file_mtime(&self.path);
                tracing::debug!(count = self.failures.len(), "saved failure records");
            }
            Err(error) => {
                // In-memory state stays authoritative until the next good save.
                tracing::warn!(%error, path = %self.path.display(), "failed to save failure data");
            }
        }
    }

    /// Record a failed attempt. Returns `false` once the asset must not be
    /// retried. Permanently failed records are immutable: a further call
    /// neither increments the count nor touches the timestamp.
    pub fn record_failure(&mut self, asset_id: &str) -> bool {
        if let Some(existing) = self.failures.get(asset_id) {
            if existing.permanently_failed {
                return false;
            }
        }

        let record = self
            .failures
            .entry(asset_id.to_string())
            .and_modify(|r| {
                r.attempts += 1;
                r.last_failed = Utc::now();
            })
            .or_insert_with(|| FailureRecord {
                attempts: 1,
                last_failed: Utc::now(),
                permanently_failed: false,
            });

        let should_retry = if self.threshold == 0 || record.attempts >= self.threshold {
            record.permanently_failed = true;
            false
        } else {
            true
        };

        if should_retry {
            tracing::debug!(
                asset_id,
                attempts = self.failures[asset_id].attempts,
                threshold = self.threshold,
                "asset failed, will retry"
            );
        } else {
            tracing::warn!(
                asset_id,
                attempts = self.failures[asset_id].attempts,
                "asset marked permanently failed"
            );
        }
        self.save();
        should_retry
    }

    pub fn is_permanently_failed(&self, asset_id: &str) -> bool {
        self.failures
            .get(asset_id)
            .is_some_and(|r| r.permanently_failed)
    }

    /// Drop permanently failed assets from a fetched page. Fast no-op when
    /// the store is empty.
    pub fn filter_eligible<T, F>(&self, items: Vec<T>, id_of: F) -> Vec<T>
    where
        F: Fn(&T) -> &str,
    {
        if self.failures.is_empty() {
            return items;
        }
        let before = items.len();
        let eligible: Vec<T> = items
            .into_iter()
            .filter(|item| !self.is_permanently_failed(id_of(item)))
            .collect();
        let dropped = before - eligible.len();
        if dropped > 0 {
            tracing::info!(dropped, "filtered out permanently failed assets");
        }
        eligible
    }

    /// Clear specific records, or the entire store when `asset_ids` is None.
    pub fn reset(&mut self, asset_ids: Option<&[String]>) {
        match asset_ids {
            None => {
                let count = self.failures.len();
                self.failures.clear();
                tracing::info!(count, "reset all failure records");
            }
            Some(ids) => {
                let mut count = 0;
                for id in ids {
                    if self.failures.remove(id).is_some() {
                        count += 1;
                    }
                }
                tracing::info!(count, "reset failure records");
            }
        }
        self.save();
    }

    /// Detect an external edit or deletion of the backing file and reload.
    /// Returns whether in-memory state changed. Safe to call every tick.
    pub fn reconcile_external_changes(&mut self) -> bool {
        if !self.path.exists() {
            if !self.failures.is_empty() {
                tracing::info!("failure file deleted externally, clearing records");
                self.failures.clear();
                self.last_mtime = None;
                return true;
            }
            return false;
        }

        let Some(current) = file_mtime(&self.path) else {
            return false;
        };
        let modified = match self.last_mtime {
            Some(known) => current > known,
            None => true,
        };
        if modified {
            let old_count = self.failures.len();
            tracing::info!("failure file modified externally, reloading");
            self.load();
            if old_count != self.failures.len() {
                tracing::info!(
                    old_count,
                    new_count = self.failures.len(),
                    "failure record count changed"
                );
            }
            return true;
        }
        false
    }

    pub fn failed_records(&self) -> &HashMap<String, FailureRecord> {
        &self.failures
    }

    pub fn permanently_failed_ids(&self) -> Vec<String> {
        self.failures
            .iter()
            .filter(|(_, r)| r.permanently_failed)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn retry_candidates(&self) -> Vec<String> {
        self.failures
            .iter()
            .filter(|(_, r)| !r.permanently_failed)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn summary(&self) -> FailureSummary {
        let mut permanently_failed_ids = self.permanently_failed_ids();
        permanently_failed_ids.sort();
        permanently_failed_ids.truncate(10);
        FailureSummary {
            total_failed_assets: self.failures.len(),
            permanently_failed: self
                .failures
                .values()
                .filter(|r| r.permanently_failed)
                .count(),
            retry_candidates: self
                .failures
                .values()
                .filter(|r| !r.permanently_failed)
                .count(),
            failure_threshold: self.threshold,
            permanently_failed_ids,
        }
    }
}

fn file_mtime(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}
