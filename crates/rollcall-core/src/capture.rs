//! Capture device collaborator used by the recognition loop.

use image::RgbImage;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    #[error("capture device unavailable: {0}")]
    Unavailable(String),
    #[error("frame read failed: {0}")]
    ReadFailed(String),
}

/// An opened capture device. Exclusively owned by whoever opened it.
pub trait CaptureDevice: Send {
    /// Block until the next frame is available or the read fails.
    ///
    /// Implementations must give up after a bounded wait and return
    /// [`CaptureError::ReadFailed`]: the recognition loop only sees its stop
    /// flag between reads.
    fn read_frame(&mut self) -> Result<RgbImage, CaptureError>;

    /// Give the device back to the system.
    fn release(self: Box<Self>);
}

/// Something that can (re)open a capture device.
pub trait CaptureSource: Send + Sync {
    fn open(&self) -> Result<Box<dyn CaptureDevice>, CaptureError>;

    /// Human-readable name for logs and status output.
    fn describe(&self) -> String;
}
