//! Daemon-wide shared state and the blocking operations behind each D-Bus method.

use rollcall_core::{
    GalleryError, Ledger, LedgerEntry, LedgerError, RecognitionError, RecognitionLoop, SharedEmbedder,
    SharedGallery,
};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

pub struct AppState {
    gallery: SharedGallery,
    embedder: SharedEmbedder,
    ledger: Arc<Ledger>,
    recognition: RecognitionLoop,
}

impl AppState {
    pub fn new(
        gallery: SharedGallery,
        embedder: SharedEmbedder,
        ledger: Arc<Ledger>,
        recognition: RecognitionLoop,
    ) -> Self {
        Self {
            gallery,
            embedder,
            ledger,
            recognition,
        }
    }

    /// Enroll an image and rebuild the gallery. Returns the new gallery size.
    pub fn register(&self, identity: &str, image_path: &Path) -> Result<usize, GalleryError> {
        // Gallery before embedder; the recognition thread never holds both.
        let mut gallery = write(&self.gallery);
        let mut embedder = lock(&self.embedder);
        gallery.register(identity, image_path, &mut **embedder)?;

        let identity = identity.trim();
        if gallery.count_for(identity) == 0 {
            tracing::warn!(identity, "registered image produced no usable face");
        }
        Ok(gallery.len())
    }

    pub fn start(&self) -> Result<(), RecognitionError> {
        self.recognition.start()
    }

    pub fn stop(&self) {
        self.recognition.stop();
    }

    pub fn list_all(&self) -> Result<Vec<LedgerEntry>, LedgerError> {
        self.ledger.list_all()
    }

    pub fn export(&self, destination: &Path) -> Result<usize, LedgerError> {
        self.ledger.export(destination)
    }

    pub fn status(&self) -> serde_json::Value {
        let gallery = read(&self.gallery);
        serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "state": self.recognition.state(),
            "camera": self.recognition.source_name(),
            "threshold": self.recognition.policy().threshold,
            "gallery": {
                "root": gallery.root().display().to_string(),
                "faces": gallery.len(),
                "identities": gallery.identities(),
            },
            "ledger": {
                "path": self.ledger.path().display().to_string(),
                "min_shift_secs": self.ledger.min_shift().num_seconds(),
            },
            "session": self.recognition.session_identities(),
            "stats": self.recognition.stats(),
        })
    }
}

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use rollcall_core::embedder::{self, EmbedError, FaceEmbedder};
    use rollcall_core::{
        BoundingBox, CaptureDevice, CaptureError, CaptureSource, DetectedFace, Embedding, Gallery, LoopPolicy,
    };
    use tempfile::TempDir;

    /// One face per image, embedded as its top-left pixel.
    struct PixelEmbedder;

    impl FaceEmbedder for PixelEmbedder {
        fn detect_and_embed(&mut self, image: &RgbImage) -> Result<Vec<DetectedFace>, EmbedError> {
            let px = image.get_pixel(0, 0).0;
            Ok(vec![DetectedFace {
                bbox: BoundingBox {
                    x: 0.0,
                    y: 0.0,
                    width: 1.0,
                    height: 1.0,
                    confidence: 1.0,
                    landmarks: None,
                },
                embedding: Embedding::new(px.iter().map(|&c| c as f32 / 255.0).collect()),
            }])
        }
    }

    struct NoCamera;

    impl CaptureSource for NoCamera {
        fn open(&self) -> Result<Box<dyn CaptureDevice>, CaptureError> {
            Err(CaptureError::Unavailable("no camera in tests".into()))
        }

        fn describe(&self) -> String {
            "none".into()
        }
    }

    fn state() -> (AppState, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let gallery = Arc::new(RwLock::new(Gallery::new(dir.path().join("known_faces"))));
        let embedder = embedder::shared(PixelEmbedder);
        let ledger = Arc::new(Ledger::new(dir.path().join("attendance.csv"), chrono::Duration::hours(8)));
        let recognition = RecognitionLoop::new(
            Arc::new(NoCamera),
            Arc::clone(&embedder),
            Arc::clone(&gallery),
            Arc::clone(&ledger),
            LoopPolicy::default(),
        );
        (AppState::new(gallery, embedder, ledger, recognition), dir)
    }

    #[test]
    fn test_register_grows_gallery() {
        let (state, dir) = state();
        let upload = dir.path().join("alice.png");
        RgbImage::from_pixel(2, 2, Rgb([10, 20, 30])).save(&upload).unwrap();

        assert_eq!(state.register("Alice", &upload).unwrap(), 1);
        let status = state.status();
        assert_eq!(status["gallery"]["identities"], serde_json::json!(["Alice"]));
    }

    #[test]
    fn test_register_rejects_delimiter_in_identity() {
        let (state, dir) = state();
        let upload = dir.path().join("x.png");
        RgbImage::from_pixel(2, 2, Rgb([1, 2, 3])).save(&upload).unwrap();

        let err = state.register("Doe, Jane", &upload).unwrap_err();
        assert!(matches!(err, GalleryError::Validation(_)));
    }

    #[test]
    fn test_start_without_camera_stays_idle() {
        let (state, _dir) = state();
        assert!(matches!(state.start(), Err(RecognitionError::Device(_))));
        assert_eq!(state.status()["state"], "idle");
        state.stop();
    }

    #[test]
    fn test_status_reports_configuration() {
        let (state, _dir) = state();
        let status = state.status();
        assert_eq!(status["camera"], "none");
        assert_eq!(status["ledger"]["min_shift_secs"], 28800);
        assert_eq!(status["gallery"]["faces"], 0);
        assert_eq!(status["stats"]["frames_read"], 0);
    }

    #[test]
    fn test_export_empty_ledger_writes_header() {
        let (state, dir) = state();
        let dest = dir.path().join("out.csv");
        assert_eq!(state.export(&dest).unwrap(), 0);
        assert!(state.list_all().unwrap().is_empty());
        let text = std::fs::read_to_string(dest).unwrap();
        assert!(text.starts_with("Name,Timestamp,ExitTime"));
    }
}
