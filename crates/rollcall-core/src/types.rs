use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, Serialize, Deserialize)]
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
///
/// Immutable once computed; values are only comparable between embeddings
/// produced by the same model version.
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

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Euclidean distance between two embeddings.
    ///
    /// Returns `None` when the dimensions differ; such vectors come from
    /// different models and have no meaningful distance.
    pub fn euclidean_distance(&self, other: &Embedding) -> Option<f32> {
        if self.values.len() != other.values.len() {
            return None;
        }
        let sum: f32 = self
            .values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum();
        Some(sum.sqrt())
    }
}

/// A face found in an image, paired with its embedding.
#[derive(Debug, Clone)]
pub struct DetectedFace {
    pub bbox: BoundingBox,
    pub embedding: Embedding,
}

/// One (identity, embedding) pair of the enrolled gallery.
#[derive(Debug, Clone)]
pub struct GalleryEntry {
    pub identity: String,
    pub embedding: Embedding,
}

/// Delimiter of the ledger file; identities must never contain it.
pub const FIELD_DELIMITER: char = ',';

#[derive(Error, Debug, PartialEq, Eq)]
pub enum IdentityError {
    #[error("identity must not be empty")]
    Empty,
    #[error("identity {0:?} contains the ledger delimiter ','")]
    ContainsDelimiter(String),
    #[error("identity {0:?} is not a valid folder name")]
    InvalidPathComponent(String),
}

/// Validate a user-supplied identity and return it trimmed.
///
/// Identities key both the enrollment folder and the ledger line, so they
/// must be a single path component free of the field delimiter.
pub fn validate_identity(identity: &str) -> Result<&str, IdentityError> {
    let trimmed = identity.trim();
    if trimmed.is_empty() {
        return Err(IdentityError::Empty);
    }
    if trimmed.contains(FIELD_DELIMITER) {
        return Err(IdentityError::ContainsDelimiter(trimmed.to_string()));
    }
    if trimmed == "."
        || trimmed == ".."
        || trimmed.contains(['/', '\\', '\n', '\r', '\0'])
    {
        return Err(IdentityError::InvalidPathComponent(trimmed.to_string()));
    }
    Ok(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_euclidean_distance_identical() {
        let a = Embedding::new(vec![0.25, -0.5, 1.0]);
        assert_eq!(a.euclidean_distance(&a), Some(0.0));
    }

    #[test]
    fn test_euclidean_distance_pythagorean() {
        let a = Embedding::new(vec![0.0, 0.0]);
        let b = Embedding::new(vec![3.0, 4.0]);
        assert_eq!(a.euclidean_distance(&b), Some(5.0));
        assert_eq!(b.euclidean_distance(&a), Some(5.0));
    }

    #[test]
    fn test_euclidean_distance_dimension_mismatch() {
        let a = Embedding::new(vec![1.0, 0.0]);
        let b = Embedding::new(vec![1.0, 0.0, 0.0]);
        assert_eq!(a.euclidean_distance(&b), None);
    }

    #[test]
    fn test_validate_identity_trims() {
        assert_eq!(validate_identity("  Alice "), Ok("Alice"));
        assert_eq!(validate_identity("Mary Jane"), Ok("Mary Jane"));
    }

    #[test]
    fn test_validate_identity_rejects_empty() {
        assert_eq!(validate_identity(""), Err(IdentityError::Empty));
        assert_eq!(validate_identity("   "), Err(IdentityError::Empty));
    }

    #[test]
    fn test_validate_identity_rejects_delimiter() {
        assert!(matches!(
            validate_identity("Doe, John"),
            Err(IdentityError::ContainsDelimiter(_))
        ));
    }

    #[test]
    fn test_validate_identity_rejects_path_components() {
        for bad in ["..", ".", "a/b", "a\\b"] {
            assert!(
                matches!(validate_identity(bad), Err(IdentityError::InvalidPathComponent(_))),
                "{bad:?} should be rejected"
            );
        }
    }
}
