//! Pluggable AI classification strategies.
//!
//! Every strategy implements the same contract: image bytes in, an
//! unfiltered list of label/confidence pairs out. Confidence thresholding is
//! the batch processor's job. The strategy is a static startup choice — a
//! strategy that cannot initialize (missing model files, missing endpoint)
//! fails the process before any loop iteration.

pub mod deepdanbooru;
pub mod wd14;

use async_trait::async_trait;

use crate::config::{AppConfig, ClassifierKind};
use crate::models::TagPrediction;

#[derive(Debug, thiserror::Error)]
pub enum ClassifierError {
    /// Startup-time failure: missing model file, labels, or endpoint.
    #[error("classifier initialization failed: {0}")]
    Init(String),

    #[error("failed to decode image: {0}")]
    Decode(#[from] image::ImageError),

    #[error("inference failed: {0}")]
    Inference(String),

    #[error("inference request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("failed to parse inference response: {0}")]
    Parse(#[from] serde_json::Error),
}

#[async_trait]
pub trait Classifier: Send + Sync {
    fn name(&self) -> &'static str;

    /// Predict labels for an image. Results are sorted by confidence
    /// descending and not thresholded.
    async fn classify(&self, image: &[u8]) -> Result<Vec<TagPrediction>, ClassifierError>;
}

/// Build the configured strategy, failing fast when it cannot initialize.
pub fn create_classifier(config: &AppConfig) -> Result<Box<dyn Classifier>, ClassifierError> {
    match config.tagging_model {
        ClassifierKind::Wd14 => Ok(Box::new(wd14::Wd14Classifier::new(
            std::path::Path::new(&config.model_cache_dir),
        )?)),
        ClassifierKind::DeepDanbooru => {
            let endpoint = config.deepdanbooru_url.as_deref().ok_or_else(|| {
                ClassifierError::Init(
                    "DEEPDANBOORU_URL is required when TAGGING_MODEL=deepdanbooru".to_string(),
                )
            })?;
            Ok(Box::new(deepdanbooru::DeepDanbooruClassifier::new(
                endpoint,
                std::time::Duration::from_secs(config.request_timeout_secs),
            )?))
        }
    }
}

/// Order predictions by confidence, highest first.
pub(crate) fn sort_by_confidence(predictions: &mut [TagPrediction]) {
    predictions.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
}
