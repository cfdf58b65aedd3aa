//! Facial expression labels via the FER+ ONNX model.

use image::{imageops, imageops::FilterType, RgbImage};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;

const FERPLUS_INPUT_SIZE: u32 = 64;
const FERPLUS_LABELS: [&str; 8] = [
    "neutral",
    "happiness",
    "surprise",
    "sadness",
    "anger",
    "disgust",
    "fear",
    "contempt",
];

#[derive(Error, Debug)]
pub enum EmotionError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Assigns an expression label to a cropped face.
pub trait EmotionClassifier: Send + Sync {
    fn classify(&self, face: &RgbImage) -> Result<String, EmotionError>;
}

/// FER+ (emotion-ferplus-8) classifier.
pub struct FerPlusClassifier {
    session: Mutex<Session>,
}

impl FerPlusClassifier {
    pub fn load(model_path: &str) -> Result<Self, EmotionError> {
        if !Path::new(model_path).exists() {
            return Err(EmotionError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(1)?
            .commit_from_file(model_path)?;

        tracing::info!(path = model_path, "loaded FER+ emotion model");

        Ok(Self {
            session: Mutex::new(session),
        })
    }
}

impl EmotionClassifier for FerPlusClassifier {
    fn classify(&self, face: &RgbImage) -> Result<String, EmotionError> {
        let input = preprocess(face);

        let mut session = self
            .session
            .lock()
            .map_err(|_| EmotionError::InferenceFailed("emotion session poisoned".into()))?;
        let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, scores) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EmotionError::InferenceFailed(format!("scores: {e}")))?;

        best_label(scores)
            .map(str::to_string)
            .ok_or_else(|| EmotionError::InferenceFailed(format!("expected 8 scores, got {}", scores.len())))
    }
}

/// Grayscale 64×64 tensor with raw 0–255 intensities, as FER+ expects.
fn preprocess(face: &RgbImage) -> Array4<f32> {
    let size = FERPLUS_INPUT_SIZE;
    let gray = imageops::grayscale(face);
    let resized = imageops::resize(&gray, size, size, FilterType::Triangle);

    let mut tensor = Array4::<f32>::zeros((1, 1, size as usize, size as usize));
    for (x, y, pixel) in resized.enumerate_pixels() {
        tensor[[0, 0, y as usize, x as usize]] = pixel.0[0] as f32;
    }
    tensor
}

fn best_label(scores: &[f32]) -> Option<&'static str> {
    if scores.len() != FERPLUS_LABELS.len() {
        return None;
    }
    let (idx, _) = scores
        .iter()
        .enumerate()
        .fold((0usize, f32::NEG_INFINITY), |best, (i, &s)| if s > best.1 { (i, s) } else { best });
    Some(FERPLUS_LABELS[idx])
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_best_label_picks_argmax() {
        let scores = [0.1, 3.0, 0.2, 0.0, -1.0, 0.0, 0.0, 0.0];
        assert_eq!(best_label(&scores), Some("happiness"));
    }

    #[test]
    fn test_best_label_tie_keeps_first() {
        let scores = [1.0, 1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0];
        assert_eq!(best_label(&scores), Some("neutral"));
    }

    #[test]
    fn test_best_label_wrong_length() {
        assert_eq!(best_label(&[1.0, 2.0]), None);
    }

    #[test]
    fn test_preprocess_shape_and_range() {
        let face = RgbImage::from_pixel(30, 40, Rgb([200, 200, 200]));
        let tensor = preprocess(&face);
        assert_eq!(tensor.shape(), &[1, 1, 64, 64]);
        assert!(tensor.iter().all(|&v| (0.0..=255.0).contains(&v)));
    }
}
