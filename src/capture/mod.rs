mod access;
mod threaded;
mod v4l_capture;

pub use access::{platform_access, AccessState, AlwaysGranted, DeviceAccess, DeviceNodeAccess};
pub use threaded::{CaptureThread, FrameGrabber};
pub use v4l_capture::WebcamCapture;

use crate::error::Result;
use crate::frame::Frame;

/// Requested capture size. Mobile sensors get a smaller default.
#[cfg(target_os = "android")]
pub const DEFAULT_CAPTURE_SIZE: (u32, u32) = (640, 480);
#[cfg(not(target_os = "android"))]
pub const DEFAULT_CAPTURE_SIZE: (u32, u32) = (1280, 720);

/// Trait for camera capture sources
///
/// Implementations deliver frames already normalized to RGB with a
/// top-left origin (see [`Frame::from_image`]).
pub trait FrameSource {
    /// Fetch the newest frame. Must not block on the device.
    ///
    /// * `Ok(Some(frame))` - a frame captured since the previous poll
    /// * `Ok(None)` - nothing new yet
    /// * `Err(DeviceUnavailable)` - the device is down
    fn poll_frame(&mut self) -> Result<Option<Frame>>;

    /// Try to bring a lost device back
    fn restart(&mut self) -> Result<()> {
        Ok(())
    }

    /// Release the device
    fn stop(&mut self) {}

    /// Get the resolution of captured frames
    fn resolution(&self) -> (u32, u32);
}
