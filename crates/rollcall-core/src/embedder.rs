//! Face detection + embedding collaborator.

use crate::detector::{DetectorError, FaceDetector};
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::types::DetectedFace;
use image::RgbImage;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EmbedError {
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] RecognizerError),
}

/// Turns an image into the faces it contains, each with an embedding.
///
/// An empty result means no face was found. Embedding values are only
/// stable in their relative distances, not across model versions.
pub trait FaceEmbedder: Send {
    fn detect_and_embed(&mut self, image: &RgbImage) -> Result<Vec<DetectedFace>, EmbedError>;
}

/// Embedder shared between the recognition thread and registration.
pub type SharedEmbedder = Arc<Mutex<Box<dyn FaceEmbedder>>>;

pub fn shared(embedder: impl FaceEmbedder + 'static) -> SharedEmbedder {
    Arc::new(Mutex::new(Box::new(embedder)))
}

/// SCRFD detection followed by ArcFace embedding of every detected face.
pub struct OnnxEmbedder {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

impl OnnxEmbedder {
    pub fn load(scrfd_path: &str, arcface_path: &str) -> Result<Self, EmbedError> {
        let detector = FaceDetector::load(scrfd_path)?;
        tracing::info!(path = scrfd_path, "SCRFD detector loaded");

        let recognizer = FaceRecognizer::load(arcface_path)?;
        tracing::info!(path = arcface_path, "ArcFace recognizer loaded");

        Ok(Self {
            detector,
            recognizer,
        })
    }
}

impl FaceEmbedder for OnnxEmbedder {
    fn detect_and_embed(&mut self, image: &RgbImage) -> Result<Vec<DetectedFace>, EmbedError> {
        let faces = self.detector.detect(image)?;
        let mut out = Vec::with_capacity(faces.len());

        for bbox in faces {
            if bbox.landmarks.is_none() {
                tracing::debug!(confidence = bbox.confidence, "face without landmarks skipped");
                continue;
            }
            let embedding = self.recognizer.extract(image, &bbox)?;
            out.push(DetectedFace { bbox, embedding });
        }

        Ok(out)
    }
}
