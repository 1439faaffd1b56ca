//! DeepDanbooru strategy backed by a remote inference service.
//!
//! Talks to a deepdanbooru HTTP wrapper (e.g. deepdanbooru-docker's REST
//! frontend): base64 image in, `{"tags": [{"name", "score"}]}` out. The
//! endpoint is required configuration; its absence is a startup failure.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;

use super::{sort_by_confidence, Classifier, ClassifierError};
use crate::models::TagPrediction;

pub struct DeepDanbooruClassifier {
    http: reqwest::Client,
    endpoint: String,
}

#[derive(Debug, Deserialize)]
struct PredictResponse {
    tags: Vec<PredictedTag>,
}

#[derive(Debug, Deserialize)]
struct PredictedTag {
    name: String,
    score: f32,
}

impl DeepDanbooruClassifier {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, ClassifierError> {
        if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
            return Err(ClassifierError::Init(format!(
                "DEEPDANBOORU_URL must be an http(s) URL, got '{endpoint}'"
            )));
        }
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ClassifierError::Init(e.to_string()))?;
        tracing::info!(endpoint, "initialized DeepDanbooru client");
        Ok(Self {
            http,
            endpoint: endpoint.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl Classifier for DeepDanbooruClassifier {
    fn name(&self) -> &'static str {
        "deepdanbooru"
    }

    async fn classify(&self, image: &[u8]) -> Result<Vec<TagPrediction>, ClassifierError> {
        let body = serde_json::json!({
            "image": base64::engine::general_purpose::STANDARD.encode(image),
        });

        let response = self
            .http
            .post(format!("{}/predict", self.endpoint))
            .json(&body)
            .send()
            .await?
            .error_for_status()?;

        let parsed: PredictResponse = response.json().await?;
        let mut predictions: Vec<TagPrediction> = parsed
            .tags
            .into_iter()
            .map(|t| TagPrediction {
                name: t.name,
                confidence: t.score.clamp(0.0, 1.0),
            })
            .collect();
        sort_by_confidence(&mut predictions);

        tracing::debug!(
            predictions = predictions.len(),
            "DeepDanbooru inference complete"
        );
        Ok(predictions)
    }
}
