//! edusense-core: face detection, embedding and matching.
//!
//! Uses SCRFD for face detection, ArcFace for 512-d embeddings and FER+ for
//! optional expression labels, all running via ONNX Runtime on CPU.

use std::path::PathBuf;

pub mod alignment;
pub mod detector;
pub mod emotion;
pub mod extractor;
pub mod matcher;
pub mod recognizer;
pub mod types;

pub use detector::FaceDetector;
pub use emotion::{EmotionClassifier, FerPlusClassifier};
pub use extractor::{decode_rgb, ExtractError, FaceAnalyzer, FaceExtractor};
pub use matcher::{CosineMatcher, Matcher, DEFAULT_SIMILARITY_THRESHOLD};
pub use recognizer::FaceRecognizer;
pub use types::{BoundingBox, Candidate, Detection, Embedding, MatchResult, EMBEDDING_DIM};

/// SCRFD detector file inside the model directory.
pub const DETECTOR_MODEL_FILE: &str = "det_10g.onnx";
/// ArcFace recognizer file inside the model directory.
pub const RECOGNIZER_MODEL_FILE: &str = "w600k_r50.onnx";
/// FER+ emotion model file inside the model directory.
pub const EMOTION_MODEL_FILE: &str = "emotion-ferplus-8.onnx";

/// Default data directory: `$XDG_DATA_HOME/edusense`, falling back to `~/.local/share/edusense`.
pub fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("edusense")
}

/// Default model directory: `<data dir>/models`.
pub fn default_model_dir() -> PathBuf {
    default_data_dir().join("models")
}
