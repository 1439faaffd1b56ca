//! Cron-driven outer loop wrapping continuous processing.
//!
//! Dueness is computed from the last completed run forward, never from
//! wall-clock drift: the next eligible trigger is the first cron occurrence
//! strictly after `last_run`, and the run fires once "now" passes it. A
//! trigger missed while the process was down is caught on the first check
//! after restart, as long as it falls inside the lookback window.

use std::fs;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::services::orchestrator::Orchestrator;

const TICK_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Serialize, Deserialize)]
struct ScheduleState {
    last_run: DateTime<Utc>,
}

/// Persisted last-completed-run timestamp.
///
/// Without it a restart would reset the dueness baseline to "now" and a
/// trigger missed during the downtime would be skipped. Persistence problems
/// are warnings; the in-memory timestamp stays authoritative.
pub struct LastRunStore {
    path: PathBuf,
}

impl LastRunStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn load(&self) -> Option<DateTime<Utc>> {
        let text = fs::read_to_string(&self.path).ok()?;
        match serde_json::from_str::<ScheduleState>(&text) {
            Ok(state) => Some(state.last_run),
            Err(error) => {
                tracing::warn!(%error, path = %self.path.display(),
                    "failed to parse schedule state, ignoring");
                None
            }
        }
    }

    pub fn save(&self, last_run: DateTime<Utc>) {
        let result = serde_json::to_string(&ScheduleState { last_run })
            .map_err(|e| e.to_string())
            .and_then(|json| fs::write(&self.path, json).map_err(|e| e.to_string()));
        if let Err(error) = result {
            tracing::warn!(%error, path = %self.path.display(), "failed to save schedule state");
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("invalid cron expression '{expression}': {source}")]
    BadCron {
        expression: String,
        source: cron::error::Error,
    },

    #[error("unknown time zone '{0}'")]
    UnknownTimezone(String),
}

pub struct Scheduler {
    schedule: Schedule,
    timezone: Tz,
    lookback: chrono::Duration,
}

impl Scheduler {
    /// Parse a five-field crontab expression evaluated in `timezone`.
    pub fn new(
        expression: &str,
        timezone: &str,
        lookback_hours: i64,
    ) -> Result<Self, SchedulerError> {
        // The cron crate wants a seconds field; crontab expressions omit it.
        let normalized = if expression.split_whitespace().count() == 5 {
            format!("0 {expression}")
        } else {
            expression.to_string()
        };
        let schedule = Schedule::from_str(&normalized).map_err(|source| SchedulerError::BadCron {
            expression: expression.to_string(),
            source,
        })?;
        let timezone: Tz = timezone
            .parse()
            .map_err(|_| SchedulerError::UnknownTimezone(timezone.to_string()))?;
        Ok(Self {
            schedule,
            timezone,
            lookback: chrono::Duration::hours(lookback_hours),
        })
    }

    /// First occurrence strictly after `after`, in the configured zone.
    pub fn next_occurrence(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule
            .after(&after.with_timezone(&self.timezone))
            .next()
            .map(|dt| dt.with_timezone(&Utc))
    }

    /// Whether a run is due at `now`, given the last completed run.
    /// Due iff the next occurrence after `last_run` has passed and is still
    /// within the lookback window.
    pub fn is_due(&self, last_run: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        match self.next_occurrence(last_run) {
            Some(next) => next <= now && now - next <= self.lookback,
            None => false,
        }
    }

    /// Tick loop: wake once a minute, run all libraries when due, record the
    /// completion time as the new `last_run`.
    ///
    /// The baseline comes from the persisted state, so a trigger missed while
    /// the process was down is caught on the first check after restart (as
    /// long as it falls inside the lookback window).
    pub async fn run(
        &self,
        state: LastRunStore,
        orchestrator: Arc<Mutex<Orchestrator>>,
        stop: Arc<AtomicBool>,
    ) {
        let mut last_run = match state.load() {
            Some(persisted) => {
                tracing::info!(%persisted, "restored last run time");
                persisted
            }
            None => {
                let now = Utc::now();
                state.save(now);
                now
            }
        };
        tracing::info!(
            timezone = %self.timezone,
            next_run = ?self.next_occurrence(last_run),
            "scheduler started"
        );

        while !stop.load(Ordering::Relaxed) {
            tokio::time::sleep(TICK_INTERVAL).await;

            let now = Utc::now();
            if !self.is_due(last_run, now) {
                continue;
            }

            tracing::info!("scheduled run triggered");
            orchestrator.lock().await.run_all_libraries(None).await;
            last_run = Utc::now();
            state.save(last_run);
            tracing::info!(
                next_run = ?self.next_occurrence(last_run),
                "scheduled run complete"
            );
        }
        tracing::info!("scheduler stopped");
    }
}
