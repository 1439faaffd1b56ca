//! The orchestration loop: drives fetching and processing across one or
//! many libraries, in single or continuous mode, and owns the cross-cycle
//! progress counters.
//!
//! A single logical worker drives this state machine; the active-library
//! pointer, the tag caches, and the failure store are only ever touched
//! through its call sequence. The health surface shares the orchestrator
//! behind a mutex and uses the client's silent variants.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::AppConfig;
use crate::models::{Asset, BatchStats, ProgressCounters, Tag};
use crate::services::classifier::Classifier;
use crate::services::failure_tracker::{FailureRecord, FailureSummary, FailureTracker};
use crate::services::immich::{ImmichClient, ImmichError};
use crate::services::processor::BatchProcessor;

/// Loop knobs, split from `AppConfig` so tests can construct them directly.
#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    pub confidence_threshold: f32,
    pub processed_tag_name: String,
    pub batch_size: usize,
    pub cycle_delay: Duration,
}

impl OrchestratorOptions {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            confidence_threshold: config.confidence_threshold,
            processed_tag_name: config.processed_tag_name.clone(),
            batch_size: config.batch_size,
            cycle_delay: Duration::from_millis(config.cycle_delay_ms),
        }
    }
}

pub struct Orchestrator {
    client: ImmichClient,
    classifier: Box<dyn Classifier>,
    tracker: FailureTracker,
    processor: BatchProcessor,
    progress: ProgressCounters,
    batch_size: usize,
    cycle_delay: Duration,
    stop: Arc<AtomicBool>,
    // Marker tag identity is library-scoped; resolved lazily per library.
    markers: HashMap<String, Tag>,
}

impl Orchestrator {
    pub fn new(
        client: ImmichClient,
        classifier: Box<dyn Classifier>,
        tracker: FailureTracker,
        options: OrchestratorOptions,
    ) -> Self {
        let processor = BatchProcessor::new(
            options.confidence_threshold,
            options.processed_tag_name.clone(),
        );
        Self {
            client,
            classifier,
            tracker,
            processor,
            progress: ProgressCounters::default(),
            batch_size: options.batch_size,
            cycle_delay: options.cycle_delay,
            stop: Arc::new(AtomicBool::new(false)),
            markers: HashMap::new(),
        }
    }

    /// Shared stop flag; setting it halts the loop between assets, never
    /// inside one, leaving persisted state consistent.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn client(&self) -> &ImmichClient {
        &self.client
    }

    pub fn client_mut(&mut self) -> &mut ImmichClient {
        &mut self.client
    }

    pub fn progress(&self) -> &ProgressCounters {
        &self.progress
    }

    pub fn reset_progress(&mut self) {
        self.progress.reset();
        tracing::info!("progress counters reset");
    }

    pub fn failure_summary(&self) -> FailureSummary {
        self.tracker.summary()
    }

    pub fn list_failures(&self) -> &HashMap<String, FailureRecord> {
        self.tracker.failed_records()
    }

    pub fn reset_failures(&mut self, asset_ids: Option<&[String]>) {
        self.tracker.reset(asset_ids);
    }

    async fn marker_for_current_library(&mut self) -> Result<Tag, ImmichError> {
        let library = self.client.current_library_name().to_string();
        if let Some(tag) = self.markers.get(&library) {
            return Ok(tag.clone());
        }
        let tag = self
            .client
            .get_or_create_tag(self.processor.processed_tag_name())
            .await?;
        tracing::info!(library, tag_id = %tag.id, name = %tag.name, "resolved processed marker tag");
        self.markers.insert(library, tag.clone());
        Ok(tag)
    }

    /// One `FetchingPage → ProcessingBatch` transition for the active
    /// library. Returns the batch stats, or None when the page was empty or
    /// held only permanently failed assets.
    pub async fn run_single_cycle(&mut self) -> Result<Option<BatchStats>, ImmichError> {
        self.tracker.reconcile_external_changes();

        let page = self.client.fetch_untagged_page().await?;
        if page.is_empty() {
            tracing::info!(
                library = %self.client.current_library_name(),
                "no untagged assets found"
            );
            return Ok(None);
        }

        let mut eligible: Vec<Asset> = self.tracker.filter_eligible(page, |a| a.id.as_str());
        eligible.truncate(self.batch_size);
        if eligible.is_empty() {
            // Everything on the page is permanently failed; fetching again
            // would return the same assets forever.
            tracing::info!(
                library = %self.client.current_library_name(),
                "page contains only permanently failed assets, stopping"
            );
            return Ok(None);
        }

        let marker = self.marker_for_current_library().await?;
        let stats = self
            .processor
            .process_batch(
                &mut self.client,
                self.classifier.as_ref(),
                &mut self.tracker,
                &eligible,
                &marker,
                self.stop.as_ref(),
            )
            .await;

        let library = self.client.current_library_name().to_string();
        self.progress.record_batch(&library, &stats);
        Ok(Some(stats))
    }

    /// Loop cycles for the active library until an empty page, the optional
    /// cycle cap, or a stop request. Returns the number of cycles run.
    pub async fn run_continuous(&mut self, max_cycles: Option<u64>) -> Result<u64, ImmichError> {
        let mut cycles = 0u64;
        tracing::info!(
            library = %self.client.current_library_name(),
            ?max_cycles,
            "starting continuous processing"
        );

        loop {
            if self.stop.load(Ordering::Relaxed) {
                tracing::info!("stop requested, ending continuous processing");
                break;
            }
            if let Some(cap) = max_cycles {
                if cycles >= cap {
                    tracing::info!(max_cycles = cap, "reached maximum cycles");
                    break;
                }
            }

            cycles += 1;
            tracing::info!(cycle = cycles, "starting processing cycle");
            match self.run_single_cycle().await? {
                Some(stats) => {
                    // A batch that made no forward progress at all would
                    // refetch the same page; back off by stopping.
                    if stats.processed == 0 && stats.failed == 0 && stats.unsupported == 0 {
                        tracing::info!("cycle made no progress, stopping");
                        break;
                    }
                }
                None => {
                    tracing::info!("no more assets to process");
                    break;
                }
            }

            tokio::time::sleep(self.cycle_delay).await;
        }

        tracing::info!(total_cycles = cycles, "continuous processing complete");
        Ok(cycles)
    }

    /// Drain every configured library in order, fully finishing one before
    /// advancing to the next. A page-level error aborts that library's run
    /// and moves on rather than failing the whole pass.
    pub async fn run_all_libraries(&mut self, max_cycles: Option<u64>) {
        for index in 0..self.client.library_count() {
            if self.stop.load(Ordering::Relaxed) {
                break;
            }
            if let Err(error) = self.client.switch_library(index) {
                tracing::error!(%error, index, "failed to switch library");
                continue;
            }
            if let Err(error) = self.run_continuous(max_cycles).await {
                tracing::error!(
                    %error,
                    library = %self.client.current_library_name(),
                    "library cycle aborted, moving to next library"
                );
            }
        }
    }
}
