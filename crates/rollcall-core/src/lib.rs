//! rollcall-core — face-recognition attendance engine.
//!
//! Known faces are enrolled from a directory tree, matched by Euclidean
//! distance on ArcFace embeddings (SCRFD detection, both via ONNX Runtime)
//! and recorded in a CSV attendance ledger by a background recognition loop.

pub mod alignment;
pub mod capture;
pub mod detector;
pub mod embedder;
pub mod gallery;
pub mod ledger;
pub mod matcher;
pub mod recognition;
pub mod recognizer;
pub mod session;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use capture::{CaptureDevice, CaptureError, CaptureSource};
pub use embedder::{EmbedError, FaceEmbedder, OnnxEmbedder, SharedEmbedder};
pub use gallery::{Gallery, GalleryError, LoadReport, SharedGallery};
pub use ledger::{Ledger, LedgerEntry, LedgerError, RecordOutcome, ShiftState};
pub use matcher::{EuclideanMatcher, MatchResult, Matcher};
pub use recognition::{LoopPolicy, LoopState, LoopStats, RecognitionError, RecognitionLoop};
pub use types::{validate_identity, BoundingBox, DetectedFace, Embedding, GalleryEntry, IdentityError};
