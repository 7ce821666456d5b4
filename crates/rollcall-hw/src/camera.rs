//! V4L2 camera capture via the `v4l` crate.

use crate::frame::{self, PixelFormat};
use image::RgbImage;
use rollcall_core::capture::{CaptureDevice, CaptureError, CaptureSource};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

const STREAM_BUFFERS: u32 = 4;

/// Bounds on how long a dequeue may wait for the driver.
const MIN_DEQUEUE_TIMEOUT: Duration = Duration::from_millis(250);
const MAX_DEQUEUE_TIMEOUT: Duration = Duration::from_secs(2);
/// Used when the driver does not report a frame interval.
const DEFAULT_DEQUEUE_TIMEOUT: Duration = Duration::from_secs(1);

/// Formats requested from the driver, in order of preference.
const PREFERRED_FORMATS: [PixelFormat; 3] = [PixelFormat::Yuyv, PixelFormat::Mjpeg, PixelFormat::Rgb24];

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
}

/// Info about a discovered V4L2 device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// An open, streaming V4L2 camera.
pub struct Camera {
    stream: MmapStream<'static>,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pixel_format: PixelFormat,
}

impl Camera {
    /// Open `device_path` (e.g. "/dev/video0") and start streaming at roughly
    /// `width`×`height`. The driver may pick a different size.
    pub fn open(device_path: &str, width: u32, height: u32) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path.to_string()));
        }

        let device = Device::with_path(device_path).map_err(|e| {
            if e.to_string().contains("busy") || e.to_string().contains("EBUSY") {
                CameraError::DeviceBusy
            } else {
                CameraError::DeviceNotFound(format!("{device_path}: {e}"))
            }
        })?;

        let caps = device.query_caps().map_err(|e| {
            CameraError::CaptureFailed(format!("failed to query capabilities: {e}"))
        })?;
        tracing::info!(
            device = device_path,
            driver = %caps.driver,
            card = %caps.card,
            "opened camera"
        );
        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CameraError::StreamingNotSupported);
        }

        let (pixel_format, negotiated) = negotiate(&device, width, height)?;
        tracing::info!(
            width = negotiated.width,
            height = negotiated.height,
            format = ?pixel_format,
            "negotiated format"
        );

        let timeout = match device.params() {
            Ok(params) => dequeue_timeout(params.interval.numerator, params.interval.denominator),
            Err(e) => {
                tracing::debug!(error = %e, "frame interval unavailable");
                DEFAULT_DEQUEUE_TIMEOUT
            }
        };

        let mut stream = MmapStream::with_buffers(&device, BufType::VideoCapture, STREAM_BUFFERS)
            .map_err(|e| CameraError::CaptureFailed(format!("failed to create mmap stream: {e}")))?;
        // A stalled driver then surfaces as a failed read instead of blocking forever.
        stream.set_timeout(timeout);
        tracing::debug!(timeout_ms = timeout.as_millis() as u64, "dequeue timeout set");

        Ok(Self {
            stream,
            width: negotiated.width,
            height: negotiated.height,
            device_path: device_path.to_string(),
            pixel_format,
        })
    }

    /// Wait for the next frame and convert it to RGB. A driver that delivers
    /// nothing within the dequeue timeout yields [`CameraError::CaptureFailed`].
    pub fn capture_frame(&mut self) -> Result<RgbImage, CameraError> {
        let (buf, meta) = self
            .stream
            .next()
            .map_err(|e| CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}")))?;

        let used = (meta.bytesused as usize).min(buf.len());
        let data = if used > 0 { &buf[..used] } else { buf };
        frame::decode(self.pixel_format, data, self.width, self.height).map_err(|e| {
            CameraError::CaptureFailed(format!("frame {} conversion failed: {e}", meta.sequence))
        })
    }

    /// Capture-capable `/dev/video*` nodes, sorted by path.
    pub fn list_devices() -> Vec<DeviceInfo> {
        let Ok(dir) = std::fs::read_dir("/dev") else {
            return Vec::new();
        };
        let mut paths: Vec<String> = dir
            .filter_map(Result::ok)
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| name.starts_with("video"))
            .map(|name| format!("/dev/{name}"))
            .collect();
        paths.sort_by_key(|p| (p.len(), p.clone()));

        paths.into_iter().filter_map(|path| probe(&path)).collect()
    }
}

fn probe(path: &str) -> Option<DeviceInfo> {
    let caps = Device::with_path(path).ok()?.query_caps().ok()?;
    if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
        tracing::debug!(path, card = %caps.card, "not a capture node");
        return None;
    }
    Some(DeviceInfo {
        path: path.to_string(),
        name: caps.card,
        driver: caps.driver,
        bus: caps.bus,
    })
}

/// Two frame intervals (`numerator / denominator` seconds), kept within sane bounds.
fn dequeue_timeout(numerator: u32, denominator: u32) -> Duration {
    if numerator == 0 || denominator == 0 {
        return DEFAULT_DEQUEUE_TIMEOUT;
    }
    let interval = Duration::from_secs_f64(f64::from(numerator) / f64::from(denominator));
    (interval * 2).clamp(MIN_DEQUEUE_TIMEOUT, MAX_DEQUEUE_TIMEOUT)
}

fn negotiate(device: &Device, width: u32, height: u32) -> Result<(PixelFormat, v4l::Format), CameraError> {
    let mut fmt = device
        .format()
        .map_err(|e| CameraError::FormatNegotiationFailed(format!("failed to get format: {e}")))?;

    for wanted in PREFERRED_FORMATS {
        fmt.fourcc = FourCC::new(wanted.fourcc());
        fmt.width = width;
        fmt.height = height;

        let negotiated = match device.set_format(&fmt) {
            Ok(negotiated) => negotiated,
            Err(e) => {
                tracing::debug!(format = ?wanted, error = %e, "format rejected");
                continue;
            }
        };
        // Drivers answer with their nearest supported format, which may be another one we decode.
        if let Some(actual) = PixelFormat::from_fourcc(&negotiated.fourcc.repr) {
            return Ok((actual, negotiated));
        }
    }

    Err(CameraError::FormatNegotiationFailed(
        "no supported pixel format (need YUYV, MJPG, or RGB3)".into(),
    ))
}

impl CaptureDevice for Camera {
    fn read_frame(&mut self) -> Result<RgbImage, CaptureError> {
        self.capture_frame()
            .map_err(|e| CaptureError::ReadFailed(e.to_string()))
    }

    fn release(self: Box<Self>) {
        tracing::debug!(device = %self.device_path, "releasing camera");
        // Dropping the stream stops capture and unmaps the buffers.
        drop(self);
    }
}

/// Opens a fresh [`Camera`] on every call, so the recognition loop can
/// reacquire the device after a failure.
#[derive(Debug, Clone)]
pub struct V4lSource {
    pub device_path: String,
    pub width: u32,
    pub height: u32,
}

impl V4lSource {
    pub fn new(device_path: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            device_path: device_path.into(),
            width,
            height,
        }
    }
}

impl CaptureSource for V4lSource {
    fn open(&self) -> Result<Box<dyn CaptureDevice>, CaptureError> {
        let camera = Camera::open(&self.device_path, self.width, self.height)
            .map_err(|e| CaptureError::Unavailable(format!("{}: {e}", self.device_path)))?;
        Ok(Box::new(camera))
    }

    fn describe(&self) -> String {
        format!("{} ({}x{})", self.device_path, self.width, self.height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_device_is_unavailable() {
        let source = V4lSource::new("/dev/rollcall-no-such-camera", 640, 480);
        let err = match source.open() {
            Ok(_) => panic!("opened a nonexistent device"),
            Err(e) => e,
        };
        assert!(matches!(err, CaptureError::Unavailable(msg) if msg.contains("no-such-camera")));
    }

    #[test]
    fn test_dequeue_timeout_follows_frame_interval() {
        // 30 fps is below the floor, 2 fps is two intervals, 1 frame per 5 s hits the ceiling.
        assert_eq!(dequeue_timeout(1, 30), MIN_DEQUEUE_TIMEOUT);
        assert_eq!(dequeue_timeout(1, 2), Duration::from_secs(1));
        assert_eq!(dequeue_timeout(5, 1), MAX_DEQUEUE_TIMEOUT);
    }

    #[test]
    fn test_dequeue_timeout_without_interval() {
        assert_eq!(dequeue_timeout(0, 30), DEFAULT_DEQUEUE_TIMEOUT);
        assert_eq!(dequeue_timeout(1, 0), DEFAULT_DEQUEUE_TIMEOUT);
    }

    #[test]
    fn test_describe_names_device_and_size() {
        let source = V4lSource::new("/dev/video2", 1280, 720);
        assert_eq!(source.describe(), "/dev/video2 (1280x720)");
    }
}
