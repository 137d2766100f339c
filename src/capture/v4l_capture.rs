use super::access::{AccessState, DeviceAccess};
use super::threaded::{CaptureThread, FrameGrabber};
use super::FrameSource;
use crate::error::{PipelineError, Result};
use crate::frame::{Frame, Origin};
use nokhwa::pixel_format::RgbFormat;
use nokhwa::utils::{
    CameraFormat, CameraIndex, FrameFormat, RequestedFormat, RequestedFormatType, Resolution,
};
use nokhwa::Camera;

/// nokhwa camera, owned by the capture thread.
struct NokhwaGrabber {
    camera: Camera,
    origin: Origin,
}

impl NokhwaGrabber {
    fn open(device_index: u32, width: u32, height: u32, fps: u32, origin: Origin) -> Result<Self> {
        let index = CameraIndex::Index(device_index);
        let format = CameraFormat::new(Resolution::new(width, height), FrameFormat::MJPEG, fps);
        let requested = RequestedFormat::new::<RgbFormat>(RequestedFormatType::Closest(format));

        let mut camera = Camera::new(index, requested)
            .map_err(|e| PipelineError::DeviceUnavailable(format!("failed to open camera: {}", e)))?;

        camera.open_stream().map_err(|e| {
            PipelineError::DeviceUnavailable(format!("failed to open camera stream: {}", e))
        })?;

        let resolution = camera.resolution();
        tracing::info!(
            "Camera {} streaming at {}x{}",
            device_index,
            resolution.width(),
            resolution.height()
        );

        Ok(Self { camera, origin })
    }
}

impl FrameGrabber for NokhwaGrabber {
    fn grab(&mut self) -> Result<Frame> {
        // Blocks until the driver hands over a buffer
        let frame = self
            .camera
            .frame()
            .map_err(|e| PipelineError::DeviceUnavailable(format!("failed to capture frame: {}", e)))?;

        let decoded = frame.decode_image::<RgbFormat>().map_err(|e| {
            PipelineError::DeviceUnavailable(format!("failed to decode frame: {}", e))
        })?;

        Ok(Frame::from_image(decoded, self.origin))
    }

    fn close(&mut self) {
        if let Err(e) = self.camera.stop_stream() {
            tracing::warn!("Failed to stop camera stream: {}", e);
        }
    }
}

/// Webcam source backed by nokhwa.
///
/// The camera lives on a [`CaptureThread`], so polling never waits on the
/// driver. The device may be absent or refused at construction; in that case
/// the source reports `DeviceUnavailable` until [`FrameSource::restart`]
/// manages to open it.
pub struct WebcamCapture {
    capture: Option<CaptureThread>,
    access: Box<dyn DeviceAccess>,
    device_index: u32,
    width: u32,
    height: u32,
    fps: u32,
    origin: Origin,
    /// Size of the last delivered frame.
    delivered: Option<(u32, u32)>,
}

impl WebcamCapture {
    pub fn new(
        device_index: u32,
        width: u32,
        height: u32,
        fps: u32,
        origin: Origin,
        access: Box<dyn DeviceAccess>,
    ) -> Self {
        tracing::info!(
            "Initializing webcam {} at {}x{}",
            device_index,
            width,
            height
        );

        let mut capture = Self {
            capture: None,
            access,
            device_index,
            width,
            height,
            fps,
            origin,
            delivered: None,
        };

        match capture.open() {
            Ok(()) => tracing::info!("Webcam capture thread started"),
            Err(e) => tracing::warn!("Webcam not available yet: {}", e),
        }

        capture
    }

    /// Check access, then open the camera on a fresh capture thread.
    ///
    /// Failures while opening the device arrive through the next poll.
    fn open(&mut self) -> Result<()> {
        match self.access.request() {
            AccessState::Granted => {}
            AccessState::Denied => {
                return Err(PipelineError::DeviceUnavailable(format!(
                    "permission to use camera {} denied",
                    self.device_index
                )))
            }
            AccessState::Missing => {
                return Err(PipelineError::DeviceUnavailable(format!(
                    "camera {} not present",
                    self.device_index
                )))
            }
        }

        let (index, width, height, fps, origin) = (
            self.device_index,
            self.width,
            self.height,
            self.fps,
            self.origin,
        );
        let capture = CaptureThread::spawn("nncam-capture", move || {
            NokhwaGrabber::open(index, width, height, fps, origin)
        })?;
        self.capture = Some(capture);
        Ok(())
    }
}

impl FrameSource for WebcamCapture {
    fn poll_frame(&mut self) -> Result<Option<Frame>> {
        let capture = self
            .capture
            .as_ref()
            .ok_or_else(|| PipelineError::DeviceUnavailable("camera not open".to_string()))?;

        let frame = capture.poll()?;
        if let Some(frame) = &frame {
            self.delivered = Some(frame.dimensions());
        }
        Ok(frame)
    }

    fn restart(&mut self) -> Result<()> {
        tracing::warn!("Restarting camera {}", self.device_index);
        self.stop();
        self.open()
    }

    fn stop(&mut self) {
        if let Some(mut capture) = self.capture.take() {
            capture.stop();
        }
    }

    fn resolution(&self) -> (u32, u32) {
        self.delivered.unwrap_or((self.width, self.height))
    }
}

impl Drop for WebcamCapture {
    fn drop(&mut self) {
        self.stop();
    }
}
