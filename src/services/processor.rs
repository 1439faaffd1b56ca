//! Per-asset and per-batch processing.
//!
//! One asset at a time: gate on media kind, skip already-marked assets,
//! download the thumbnail, classify, resolve surviving labels through the
//! tag cache, apply them plus the processed marker. A failure anywhere in
//! that pipeline is recorded with the failure tracker and never blocks the
//! rest of the batch.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use crate::models::{Asset, AssetKind, AssetOutcome, AssetReport, BatchStats, Tag};
use crate::services::classifier::Classifier;
use crate::services::failure_tracker::FailureTracker;
use crate::services::immich::{ImmichClient, ImmichError};

#[derive(Debug, thiserror::Error)]
pub enum ProcessorError {
    #[error(transparent)]
    Immich(#[from] ImmichError),

    #[error("classification failed: {0}")]
    Classification(#[from] crate::services::classifier::ClassifierError),
}

pub struct BatchProcessor {
    confidence_threshold: f32,
    processed_tag_name: String,
}

impl BatchProcessor {
    pub fn new(confidence_threshold: f32, processed_tag_name: impl Into<String>) -> Self {
        Self {
            confidence_threshold,
            processed_tag_name: processed_tag_name.into(),
        }
    }

    pub fn processed_tag_name(&self) -> &str {
        &self.processed_tag_name
    }

    /// Process one asset through download → classify → tag.
    pub async fn process_asset(
        &self,
        client: &mut ImmichClient,
        classifier: &dyn Classifier,
        asset: &Asset,
        marker: &Tag,
    ) -> AssetReport {
        let started = Instant::now();

        if asset.kind != AssetKind::Image {
            tracing::warn!(asset_id = %asset.id, kind = ?asset.kind, "skipping non-image asset");
            return AssetReport {
                asset_id: asset.id.clone(),
                outcome: AssetOutcome::Unsupported,
                elapsed: started.elapsed(),
            };
        }

        // Authoritative only when the search response included tags; when it
        // didn't, we process anyway and rely on tagging being idempotent.
        if asset.has_tag_named(&self.processed_tag_name) {
            tracing::debug!(asset_id = %asset.id, "asset already processed, skipping");
            return AssetReport {
                asset_id: asset.id.clone(),
                outcome: AssetOutcome::AlreadyProcessed,
                elapsed: started.elapsed(),
            };
        }

        let outcome = match self.tag_asset(client, classifier, asset, marker).await {
            Ok(labels) => {
                metrics::counter!("assets_processed_total").increment(1);
                metrics::counter!("tags_assigned_total").increment(labels.len() as u64);
                tracing::info!(
                    asset_id = %asset.id,
                    name = %asset.original_file_name,
                    tags_assigned = labels.len(),
                    "asset processed"
                );
                AssetOutcome::Tagged { labels }
            }
            Err(error) => {
                metrics::counter!("assets_failed_total").increment(1);
                tracing::error!(asset_id = %asset.id, %error, "asset processing failed");
                AssetOutcome::Failed {
                    error: error.to_string(),
                }
            }
        };

        let elapsed = started.elapsed();
        metrics::histogram!("asset_processing_seconds").record(elapsed.as_secs_f64());
        AssetReport {
            asset_id: asset.id.clone(),
            outcome,
            elapsed,
        }
    }

    async fn tag_asset(
        &self,
        client: &mut ImmichClient,
        classifier: &dyn Classifier,
        asset: &Asset,
        marker: &Tag,
    ) -> Result<Vec<String>, ProcessorError> {
        let image = client.download_asset(&asset.id, true).await?;
        let predictions = classifier.classify(&image).await?;

        let names: Vec<String> = predictions
            .into_iter()
            .filter(|p| p.confidence >= self.confidence_threshold)
            .map(|p| p.name)
            .collect();

        let mut labels = Vec::new();
        if !names.is_empty() {
            let resolved = client.get_or_create_tags_bulk(&names).await?;
            let tag_ids: Vec<String> = resolved.values().map(|t| t.id.clone()).collect();
            if !tag_ids.is_empty() {
                client.tag_asset(&asset.id, &tag_ids).await?;
            }
            labels = resolved.into_keys().collect();
        } else {
            tracing::debug!(asset_id = %asset.id, "no predictions above threshold");
        }

        client.tag_asset(&asset.id, &[marker.id.clone()]).await?;
        Ok(labels)
    }

    /// Process a fetched page. Failures are isolated per asset and recorded
    /// with the tracker; unsupported and already-done assets never touch it.
    /// The stop flag is honored between assets, never mid-asset.
    pub async fn process_batch(
        &self,
        client: &mut ImmichClient,
        classifier: &dyn Classifier,
        tracker: &mut FailureTracker,
        assets: &[Asset],
        marker: &Tag,
        stop: &AtomicBool,
    ) -> BatchStats {
        let started = Instant::now();
        let mut stats = BatchStats {
            batch_size: assets.len(),
            ..Default::default()
        };
        tracing::info!(batch_size = assets.len(), "starting batch");

        for asset in assets {
            if stop.load(Ordering::Relaxed) {
                tracing::info!("stop requested, ending batch early");
                break;
            }

            let report = self.process_asset(client, classifier, asset, marker).await;
            if matches!(report.outcome, AssetOutcome::Failed { .. }) {
                tracker.record_failure(&asset.id);
            }
            stats.record(&report);
        }

        stats.elapsed = started.elapsed();
        metrics::counter!("batches_processed_total").increment(1);
        tracing::info!(
            batch_size = stats.batch_size,
            processed = stats.processed,
            skipped = stats.skipped,
            unsupported = stats.unsupported,
            failed = stats.failed,
            labels_assigned = stats.labels_assigned,
            elapsed_ms = stats.elapsed.as_millis() as u64,
            "batch complete"
        );
        stats
    }
}
