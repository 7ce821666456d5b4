//! Test doubles: a colour-keyed embedder and a scripted capture source.

use crate::capture::{CaptureDevice, CaptureError, CaptureSource};
use crate::embedder::{EmbedError, FaceEmbedder};
use crate::types::{BoundingBox, DetectedFace, Embedding};
use image::{Rgb, RgbImage};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub const RED: [u8; 3] = [200, 0, 0];
pub const GREEN: [u8; 3] = [0, 200, 0];
pub const BLUE: [u8; 3] = [0, 0, 200];
pub const BLACK: [u8; 3] = [0, 0, 0];

/// Every non-black pixel of the first row is a face whose embedding is its colour.
pub struct ColorEmbedder;

pub fn color_embedding(rgb: [u8; 3]) -> Embedding {
    Embedding::new(rgb.iter().map(|&c| c as f32 / 255.0).collect())
}

impl FaceEmbedder for ColorEmbedder {
    fn detect_and_embed(&mut self, image: &RgbImage) -> Result<Vec<DetectedFace>, EmbedError> {
        if image.height() == 0 {
            return Ok(Vec::new());
        }
        Ok((0..image.width())
            .map(|x| image.get_pixel(x, 0).0)
            .filter(|rgb| *rgb != BLACK)
            .enumerate()
            .map(|(i, rgb)| DetectedFace {
                bbox: BoundingBox {
                    x: i as f32,
                    y: 0.0,
                    width: 1.0,
                    height: 1.0,
                    confidence: 1.0,
                    landmarks: None,
                },
                embedding: color_embedding(rgb),
            })
            .collect())
    }
}

/// A one-row frame holding one face per colour.
pub fn frame_with(faces: &[[u8; 3]]) -> RgbImage {
    if faces.is_empty() {
        return RgbImage::from_pixel(4, 1, Rgb(BLACK));
    }
    RgbImage::from_fn(faces.len() as u32, 1, |x, _| Rgb(faces[x as usize]))
}

/// Save a single-face enrollment image under `root/<identity>/<file>`.
pub fn write_face(root: &Path, identity: &str, file: &str, rgb: [u8; 3]) -> PathBuf {
    let dir = root.join(identity);
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(file);
    RgbImage::from_pixel(2, 2, Rgb(rgb)).save(&path).unwrap();
    path
}

pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}

enum Step {
    Frame(RgbImage),
    Fail(String),
    /// Wait, then fail the read as a timed-out device would.
    Stall(Duration),
}

#[derive(Default)]
struct Script {
    steps: Mutex<VecDeque<Step>>,
    fail_open: AtomicBool,
    opens: AtomicUsize,
    releases: AtomicUsize,
}

/// Capture source replaying queued frames, then empty frames forever.
#[derive(Clone, Default)]
pub struct ScriptedSource {
    script: Arc<Script>,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_frames(&self, frames: Vec<RgbImage>) {
        self.script.steps.lock().unwrap().extend(frames.into_iter().map(Step::Frame));
    }

    pub fn push_failures(&self, count: usize) {
        let mut steps = self.script.steps.lock().unwrap();
        for i in 0..count {
            steps.push_back(Step::Fail(format!("scripted failure {i}")));
        }
    }

    pub fn push_stall(&self, wait: Duration) {
        self.script.steps.lock().unwrap().push_back(Step::Stall(wait));
    }

    pub fn set_fail_open(&self, fail: bool) {
        self.script.fail_open.store(fail, Ordering::SeqCst);
    }

    pub fn opens(&self) -> usize {
        self.script.opens.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> usize {
        self.script.releases.load(Ordering::SeqCst)
    }
}

impl CaptureSource for ScriptedSource {
    fn open(&self) -> Result<Box<dyn CaptureDevice>, CaptureError> {
        if self.script.fail_open.load(Ordering::SeqCst) {
            return Err(CaptureError::Unavailable("scripted".into()));
        }
        self.script.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedDevice {
            script: Arc::clone(&self.script),
        }))
    }

    fn describe(&self) -> String {
        "scripted".into()
    }
}

struct ScriptedDevice {
    script: Arc<Script>,
}

impl CaptureDevice for ScriptedDevice {
    fn read_frame(&mut self) -> Result<RgbImage, CaptureError> {
        std::thread::sleep(Duration::from_millis(1));
        let next = self.script.steps.lock().unwrap().pop_front();
        match next {
            Some(Step::Frame(frame)) => Ok(frame),
            Some(Step::Fail(reason)) => Err(CaptureError::ReadFailed(reason)),
            Some(Step::Stall(wait)) => {
                std::thread::sleep(wait);
                Err(CaptureError::ReadFailed("timed out waiting for frame".into()))
            }
            None => Ok(frame_with(&[])),
        }
    }

    fn release(self: Box<Self>) {
        self.script.releases.fetch_add(1, Ordering::SeqCst);
    }
}
