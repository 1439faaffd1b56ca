//! WD14 (SmilingWolf wd-swinv2-tagger-v3) local ONNX strategy.
//!
//! Expects `wd-swinv2-tagger-v3.onnx` and `selected_tags.csv` in the model
//! cache directory. Input is a 448x448 BGR float tensor in NHWC layout with
//! raw 0-255 values; outputs are per-label sigmoid scores aligned with the
//! label file rows.

use std::fs;
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use image::imageops::FilterType;
use ndarray::Array4;
use ort::session::Session;
use ort::value::Value;

use super::{sort_by_confidence, Classifier, ClassifierError};
use crate::models::TagPrediction;

const MODEL_FILE: &str = "wd-swinv2-tagger-v3.onnx";
const LABELS_FILE: &str = "selected_tags.csv";
const INPUT_SIZE: u32 = 448;

pub struct Wd14Classifier {
    // Session::run needs &mut; classification is serialized anyway.
    session: Mutex<Session>,
    labels: Vec<String>,
}

impl Wd14Classifier {
    pub fn new(model_dir: &Path) -> Result<Self, ClassifierError> {
        let model_path = model_dir.join(MODEL_FILE);
        let labels_path = model_dir.join(LABELS_FILE);
        if !model_path.exists() {
            return Err(ClassifierError::Init(format!(
                "model file not found: {}",
                model_path.display()
            )));
        }
        if !labels_path.exists() {
            return Err(ClassifierError::Init(format!(
                "labels file not found: {}",
                labels_path.display()
            )));
        }

        let labels = load_labels(&labels_path)?;
        let session = Session::builder()
            .map_err(|e| ClassifierError::Init(e.to_string()))?
            .commit_from_file(&model_path)
            .map_err(|e| ClassifierError::Init(e.to_string()))?;

        tracing::info!(
            model = %model_path.display(),
            labels = labels.len(),
            "loaded WD14 model"
        );
        Ok(Self {
            session: Mutex::new(session),
            labels,
        })
    }

    fn preprocess(&self, image_bytes: &[u8]) -> Result<Array4<f32>, ClassifierError> {
        let img = image::load_from_memory(image_bytes)?;
        let resized = img.resize_exact(INPUT_SIZE, INPUT_SIZE, FilterType::Triangle);
        let rgb = resized.to_rgb8();

        let hw = (INPUT_SIZE * INPUT_SIZE) as usize;
        let mut data = vec![0f32; hw * 3];
        // NHWC with channels in BGR order, raw 0-255 floats.
        for (i, pixel) in rgb.into_raw().chunks_exact(3).enumerate() {
            let off = i * 3;
            data[off] = pixel[2] as f32;
            data[off + 1] = pixel[1] as f32;
            data[off + 2] = pixel[0] as f32;
        }

        Array4::from_shape_vec((1, INPUT_SIZE as usize, INPUT_SIZE as usize, 3), data)
            .map_err(|e| ClassifierError::Inference(format!("failed to build input tensor: {e}")))
    }
}

#[async_trait]
impl Classifier for Wd14Classifier {
    fn name(&self) -> &'static str {
        "wd14"
    }

    async fn classify(&self, image: &[u8]) -> Result<Vec<TagPrediction>, ClassifierError> {
        let input = self.preprocess(image)?;

        let mut session = self
            .session
            .lock()
            .map_err(|_| ClassifierError::Inference("model lock poisoned".to_string()))?;

        let input_name = session.inputs()[0].name().to_string();
        let input_tensor = Value::from_array(input)
            .map_err(|e| ClassifierError::Inference(format!("failed to create tensor: {e}")))?;

        let outputs = session
            .run(ort::inputs![input_name.as_str() => input_tensor])
            .map_err(|e| ClassifierError::Inference(e.to_string()))?;

        let output = outputs
            .values()
            .next()
            .ok_or_else(|| ClassifierError::Inference("model produced no outputs".to_string()))?;
        let (_, scores) = output
            .try_extract_tensor::<f32>()
            .map_err(|e| ClassifierError::Inference(e.to_string()))?;

        let mut predictions: Vec<TagPrediction> = scores
            .iter()
            .zip(self.labels.iter())
            .map(|(&score, label)| TagPrediction {
                name: label.clone(),
                confidence: score.clamp(0.0, 1.0),
            })
            .collect();
        sort_by_confidence(&mut predictions);

        tracing::debug!(predictions = predictions.len(), "WD14 inference complete");
        Ok(predictions)
    }
}

/// Parse the `selected_tags.csv` shipped with the model. Column 1 is the tag
/// name; row order matches the model's output vector.
fn load_labels(path: &Path) -> Result<Vec<String>, ClassifierError> {
    let text = fs::read_to_string(path)
        .map_err(|e| ClassifierError::Init(format!("failed to read {}: {e}", path.display())))?;
    let labels: Vec<String> = text
        .lines()
        .skip(1) // header: tag_id,name,category,count
        .filter_map(|line| line.split(',').nth(1))
        .map(|name| name.to_string())
        .collect();
    if labels.is_empty() {
        return Err(ClassifierError::Init(format!(
            "no labels parsed from {}",
            path.display()
        )));
    }
    Ok(labels)
}
