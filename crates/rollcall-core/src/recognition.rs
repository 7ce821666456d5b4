//! Continuous recognition: capture frames, identify faces, record attendance.
//!
//! The loop runs on its own OS thread because every step (camera read,
//! inference, ledger write) blocks. At most one run exists at a time; each
//! run starts with an empty [`SessionTracker`], so a person is recorded at
//! most once per run.

use crate::capture::{CaptureDevice, CaptureError, CaptureSource};
use crate::embedder::SharedEmbedder;
use crate::gallery::SharedGallery;
use crate::ledger::{Ledger, RecordOutcome};
use crate::matcher::{EuclideanMatcher, DEFAULT_MATCH_THRESHOLD};
use crate::session::SessionTracker;
use chrono::Local;
use image::imageops::{self, FilterType};
use image::RgbImage;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;

const STOP_POLL_INTERVAL: Duration = Duration::from_millis(20);
/// Ceiling on the linear backoff between read attempts.
const MAX_READ_BACKOFF: Duration = Duration::from_secs(60);

pub const DEFAULT_FRAME_STRIDE: u32 = 3;
pub const DEFAULT_READ_RETRY: Duration = Duration::from_millis(500);
pub const DEFAULT_MAX_READ_FAILURES: u32 = 10;

#[derive(Error, Debug)]
pub enum RecognitionError {
    #[error("capture device error: {0}")]
    Device(#[from] CaptureError),
    #[error("recognition is already running")]
    AlreadyRunning,
    #[error("failed to spawn recognition thread: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Tunables for a recognition run.
#[derive(Debug, Clone)]
pub struct LoopPolicy {
    pub threshold: f32,
    /// Process one frame out of every `frame_stride` read.
    pub frame_stride: u32,
    /// Frames wider than this are downscaled before detection.
    pub max_frame_width: Option<u32>,
    /// Base backoff after a failed read; grows linearly with consecutive failures.
    pub read_retry_delay: Duration,
    /// Consecutive read failures tolerated before the run ends.
    pub max_read_failures: u32,
}

impl Default for LoopPolicy {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_MATCH_THRESHOLD,
            frame_stride: DEFAULT_FRAME_STRIDE,
            max_frame_width: None,
            read_retry_delay: DEFAULT_READ_RETRY,
            max_read_failures: DEFAULT_MAX_READ_FAILURES,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LoopState {
    Idle,
    Running,
}

/// Counters for the current (or last) run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoopStats {
    pub frames_read: u64,
    pub frames_processed: u64,
    pub faces_detected: u64,
    pub records_written: u64,
    pub read_failures: u64,
}

#[derive(Debug, Default)]
struct Counters {
    frames_read: AtomicU64,
    frames_processed: AtomicU64,
    faces_detected: AtomicU64,
    records_written: AtomicU64,
    read_failures: AtomicU64,
}

impl Counters {
    fn reset(&self) {
        for counter in [
            &self.frames_read,
            &self.frames_processed,
            &self.faces_detected,
            &self.records_written,
            &self.read_failures,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    fn snapshot(&self) -> LoopStats {
        LoopStats {
            frames_read: self.frames_read.load(Ordering::Relaxed),
            frames_processed: self.frames_processed.load(Ordering::Relaxed),
            faces_detected: self.faces_detected.load(Ordering::Relaxed),
            records_written: self.records_written.load(Ordering::Relaxed),
            read_failures: self.read_failures.load(Ordering::Relaxed),
        }
    }
}

struct Worker {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl Worker {
    fn join(self) {
        if self.handle.join().is_err() {
            tracing::error!("recognition thread panicked");
        }
    }
}

/// Owner of the recognition thread.
pub struct RecognitionLoop {
    source: Arc<dyn CaptureSource>,
    embedder: SharedEmbedder,
    gallery: SharedGallery,
    ledger: Arc<Ledger>,
    policy: LoopPolicy,
    session: Arc<Mutex<SessionTracker>>,
    counters: Arc<Counters>,
    worker: Mutex<Option<Worker>>,
}

impl RecognitionLoop {
    pub fn new(
        source: Arc<dyn CaptureSource>,
        embedder: SharedEmbedder,
        gallery: SharedGallery,
        ledger: Arc<Ledger>,
        policy: LoopPolicy,
    ) -> Self {
        Self {
            source,
            embedder,
            gallery,
            ledger,
            policy,
            session: Arc::new(Mutex::new(SessionTracker::new())),
            counters: Arc::new(Counters::default()),
            worker: Mutex::new(None),
        }
    }

    pub fn policy(&self) -> &LoopPolicy {
        &self.policy
    }

    pub fn source_name(&self) -> String {
        self.source.describe()
    }

    /// Open the capture device and spawn the recognition thread.
    ///
    /// Fails with [`RecognitionError::AlreadyRunning`] if a run is active and
    /// with [`RecognitionError::Device`] if the device cannot be opened; in
    /// both cases nothing changes.
    pub fn start(&self) -> Result<(), RecognitionError> {
        let mut worker = lock(&self.worker);
        if let Some(active) = worker.as_ref() {
            if !active.handle.is_finished() {
                tracing::warn!("start requested while recognition is running, ignoring");
                return Err(RecognitionError::AlreadyRunning);
            }
        }
        // Reap a run that ended on its own (camera lost).
        if let Some(finished) = worker.take() {
            finished.join();
        }

        let device = self.source.open().map_err(|e| {
            tracing::error!(source = %self.source.describe(), error = %e, "cannot open capture device");
            e
        })?;

        lock(&self.session).clear();
        self.counters.reset();

        let stop = Arc::new(AtomicBool::new(false));
        let run = Run {
            source: Arc::clone(&self.source),
            embedder: Arc::clone(&self.embedder),
            gallery: Arc::clone(&self.gallery),
            ledger: Arc::clone(&self.ledger),
            policy: self.policy.clone(),
            session: Arc::clone(&self.session),
            counters: Arc::clone(&self.counters),
            stop: Arc::clone(&stop),
            matcher: EuclideanMatcher,
        };
        let handle = std::thread::Builder::new()
            .name("rollcall-recognition".into())
            .spawn(move || run.run(device))
            .map_err(RecognitionError::Spawn)?;

        *worker = Some(Worker { stop, handle });
        tracing::info!(
            source = %self.source.describe(),
            threshold = self.policy.threshold,
            frame_stride = self.policy.frame_stride,
            "recognition started"
        );
        Ok(())
    }

    /// Signal the thread to stop and wait for it to release the device.
    /// A no-op when idle.
    pub fn stop(&self) {
        let Some(worker) = lock(&self.worker).take() else {
            tracing::debug!("stop requested while idle");
            return;
        };
        worker.stop.store(true, Ordering::Release);
        worker.join();
        tracing::info!(stats = ?self.counters.snapshot(), "recognition stopped");
    }

    pub fn state(&self) -> LoopState {
        match lock(&self.worker).as_ref() {
            Some(worker) if !worker.handle.is_finished() => LoopState::Running,
            _ => LoopState::Idle,
        }
    }

    pub fn stats(&self) -> LoopStats {
        self.counters.snapshot()
    }

    /// Identities already recorded during the current (or last) run.
    pub fn session_identities(&self) -> Vec<String> {
        lock(&self.session).identities()
    }
}

impl Drop for RecognitionLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Everything the recognition thread owns or shares.
struct Run {
    source: Arc<dyn CaptureSource>,
    embedder: SharedEmbedder,
    gallery: SharedGallery,
    ledger: Arc<Ledger>,
    policy: LoopPolicy,
    session: Arc<Mutex<SessionTracker>>,
    counters: Arc<Counters>,
    stop: Arc<AtomicBool>,
    matcher: EuclideanMatcher,
}

impl Run {
    fn run(self, device: Box<dyn CaptureDevice>) {
        let stride = u64::from(self.policy.frame_stride.max(1));
        let mut device = Some(device);
        let mut frame_index: u64 = 0;
        let mut failures: u32 = 0;

        while !self.stop.load(Ordering::Acquire) {
            let result = match device.as_mut() {
                Some(dev) => dev.read_frame(),
                None => match self.source.open() {
                    Ok(dev) => {
                        tracing::info!(source = %self.source.describe(), "capture device reacquired");
                        device = Some(dev);
                        continue;
                    }
                    Err(e) => Err(e),
                },
            };

            match result {
                Ok(frame) => {
                    failures = 0;
                    self.counters.frames_read.fetch_add(1, Ordering::Relaxed);
                    frame_index += 1;
                    if frame_index % stride != 0 {
                        continue;
                    }
                    self.process_frame(frame);
                }
                Err(e) => {
                    failures += 1;
                    self.counters.read_failures.fetch_add(1, Ordering::Relaxed);
                    if let Some(dev) = device.take() {
                        dev.release();
                    }
                    if failures > self.policy.max_read_failures {
                        tracing::error!(failures, error = %e, "capture device lost, recognition stopping");
                        break;
                    }
                    tracing::warn!(
                        attempt = failures,
                        max = self.policy.max_read_failures,
                        error = %e,
                        "capture failed, reacquiring device"
                    );
                    let backoff = self.policy.read_retry_delay.saturating_mul(failures);
                    self.sleep_unless_stopped(backoff.min(MAX_READ_BACKOFF));
                }
            }
        }

        if let Some(dev) = device.take() {
            dev.release();
        }
        tracing::debug!("recognition thread exiting");
    }

    fn process_frame(&self, frame: RgbImage) {
        self.counters.frames_processed.fetch_add(1, Ordering::Relaxed);
        let frame = downscale(frame, self.policy.max_frame_width);

        // The embedder lock is released before the gallery is read.
        let detected = lock(&self.embedder).detect_and_embed(&frame);
        let faces = match detected {
            Ok(faces) => faces,
            Err(e) => {
                tracing::warn!(error = %e, "face detection failed, frame skipped");
                return;
            }
        };
        if faces.is_empty() {
            return;
        }
        self.counters
            .faces_detected
            .fetch_add(faces.len() as u64, Ordering::Relaxed);

        for face in &faces {
            let result = read(&self.gallery).identify(&face.embedding, &self.matcher, self.policy.threshold);
            let Some(identity) = result.identity else {
                tracing::debug!(distance = ?result.distance, "unknown face");
                continue;
            };
            if lock(&self.session).seen(&identity) {
                tracing::trace!(identity = %identity, "already recorded this session");
                continue;
            }

            let now = Local::now().naive_local();
            match self.ledger.record(&identity, now) {
                Ok(outcome) => {
                    if matches!(outcome, RecordOutcome::EntryMarked | RecordOutcome::ExitMarked) {
                        self.counters.records_written.fetch_add(1, Ordering::Relaxed);
                    }
                    tracing::debug!(identity = %identity, distance = ?result.distance, ?outcome, "face recognised");
                }
                Err(e) => {
                    tracing::error!(identity = %identity, error = %e, "attendance record dropped");
                }
            }
            lock(&self.session).mark(&identity);
        }
    }

    fn sleep_unless_stopped(&self, total: Duration) {
        let deadline = Instant::now() + total;
        while !self.stop.load(Ordering::Acquire) {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            std::thread::sleep((deadline - now).min(STOP_POLL_INTERVAL));
        }
    }
}

/// Shrink `frame` to at most `max_width` pixels wide, keeping aspect ratio.
fn downscale(frame: RgbImage, max_width: Option<u32>) -> RgbImage {
    match max_width {
        Some(max) if max > 0 && frame.width() > max => {
            let height = (u64::from(frame.height()) * u64::from(max) / u64::from(frame.width())).max(1) as u32;
            imageops::resize(&frame, max, height, FilterType::Triangle)
        }
        _ => frame,
    }
}

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}
