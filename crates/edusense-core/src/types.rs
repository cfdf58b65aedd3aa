use serde::{Deserialize, Serialize};

/// Length of an ArcFace (w600k_r50) embedding.
pub const EMBEDDING_DIM: usize = 512;

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

/// Face embedding vector (512-dimensional for ArcFace).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    /// Cosine similarity in [-1, 1]. Higher = more similar.
    ///
    /// Vectors of different length, or with a zero norm, score 0.0.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        if self.values.len() != other.values.len() {
            return 0.0;
        }

        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 { dot / denom } else { 0.0 }
    }

    /// Encode as little-endian f32 bytes for BLOB storage.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    /// Decode little-endian f32 bytes. Returns `None` if the length is not a multiple of 4.
    pub fn from_le_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() % 4 != 0 {
            return None;
        }
        let values = bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Some(Self::new(values))
    }
}

/// One face found in an image: where it is, how sure the detector is, and its embedding.
#[derive(Debug, Clone)]
pub struct Detection {
    pub face: BoundingBox,
    pub embedding: Embedding,
}

impl Detection {
    pub fn confidence(&self) -> f32 {
        self.face.confidence
    }
}

/// An enrolled identity offered to the matcher.
///
/// Identities that were enrolled but never registered carry no embedding.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub identity_id: String,
    pub embedding: Option<Embedding>,
}

/// Result of matching a query embedding against a candidate set.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    /// Matched identity, or `None` for "unknown".
    pub identity_id: Option<String>,
    /// Cosine similarity of the best-scoring candidate [-1, 1].
    pub similarity: f32,
}

impl MatchResult {
    pub fn unknown(similarity: f32) -> Self {
        Self {
            identity_id: None,
            similarity,
        }
    }

    pub fn is_match(&self) -> bool {
        self.identity_id.is_some()
    }
}
