//! Image → detections contract, and the ONNX-backed implementation.

use crate::detector::{DetectorError, FaceDetector};
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::types::Detection;
use image::RgbImage;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExtractError {
    /// The input could not be decoded. Callers record this against the item
    /// and move on.
    #[error("image could not be decoded: {0}")]
    Decode(String),
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("model handle poisoned by a panicked worker")]
    Poisoned,
}

impl ExtractError {
    /// True for data errors that only concern the current image.
    pub fn is_item_level(&self) -> bool {
        matches!(self, ExtractError::Decode(_))
    }
}

/// Finds faces in an image and embeds each of them.
///
/// Implementations are shared by every running pipeline, so they must be
/// usable through `&self` from several threads.
pub trait FaceExtractor: Send + Sync {
    fn extract(&self, image: &RgbImage) -> Result<Vec<Detection>, ExtractError>;

    /// Decode encoded image bytes (JPEG, PNG, BMP, ...) and extract.
    fn extract_encoded(&self, bytes: &[u8]) -> Result<Vec<Detection>, ExtractError> {
        let image = decode_rgb(bytes)?;
        self.extract(&image)
    }
}

/// Decode encoded image bytes into RGB.
pub fn decode_rgb(bytes: &[u8]) -> Result<RgbImage, ExtractError> {
    image::load_from_memory(bytes)
        .map(|img| img.to_rgb8())
        .map_err(|e| ExtractError::Decode(e.to_string()))
}

/// SCRFD detector + ArcFace recognizer, loaded once per process.
///
/// ONNX sessions need exclusive access while running, so each sits behind its
/// own mutex; callers only ever see `&self`.
pub struct FaceAnalyzer {
    detector: Mutex<FaceDetector>,
    recognizer: Mutex<FaceRecognizer>,
}

impl FaceAnalyzer {
    pub fn load(detector_path: &str, recognizer_path: &str) -> Result<Self, ExtractError> {
        let detector = FaceDetector::load(detector_path)?;
        tracing::info!(path = detector_path, "SCRFD detector loaded");

        let recognizer = FaceRecognizer::load(recognizer_path)?;
        tracing::info!(path = recognizer_path, "ArcFace recognizer loaded");

        Ok(Self {
            detector: Mutex::new(detector),
            recognizer: Mutex::new(recognizer),
        })
    }
}

impl FaceExtractor for FaceAnalyzer {
    fn extract(&self, image: &RgbImage) -> Result<Vec<Detection>, ExtractError> {
        let faces = {
            let mut detector = self.detector.lock().map_err(|_| ExtractError::Poisoned)?;
            detector.detect(image)?
        };
        if faces.is_empty() {
            return Ok(Vec::new());
        }

        let mut recognizer = self.recognizer.lock().map_err(|_| ExtractError::Poisoned)?;
        let mut detections = Vec::with_capacity(faces.len());
        for face in faces {
            match recognizer.extract(image, &face) {
                Ok(embedding) => detections.push(Detection { face, embedding }),
                Err(RecognizerError::NoLandmarks) => {
                    tracing::debug!(confidence = face.confidence, "dropping face without landmarks");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(detections)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_rgb_rejects_garbage() {
        let err = decode_rgb(b"definitely not a jpeg").unwrap_err();
        assert!(err.is_item_level());
    }

    #[test]
    fn test_decode_rgb_png() {
        let img = RgbImage::from_pixel(4, 3, image::Rgb([10, 20, 30]));
        let mut buf = std::io::Cursor::new(Vec::new());
        img.write_to(&mut buf, image::ImageFormat::Png).unwrap();
        let decoded = decode_rgb(buf.get_ref()).unwrap();
        assert_eq!(decoded.dimensions(), (4, 3));
        assert_eq!(decoded.get_pixel(0, 0).0, [10, 20, 30]);
    }

    #[test]
    fn test_model_errors_are_not_item_level() {
        let err = ExtractError::Detector(DetectorError::InferenceFailed("boom".into()));
        assert!(!err.is_item_level());
        assert!(!ExtractError::Poisoned.is_item_level());
    }

    #[test]
    fn test_load_missing_models() {
        let err = FaceAnalyzer::load("/nonexistent/det_10g.onnx", "/nonexistent/w600k_r50.onnx")
            .err()
            .unwrap();
        assert!(matches!(err, ExtractError::Detector(DetectorError::ModelNotFound(_))));
    }
}
