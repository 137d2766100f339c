use crate::error::{PipelineError, Result};
use crate::frame::Frame;
use crossbeam_channel::{Receiver, TryRecvError, TrySendError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Blocking frame producer driven by a [`CaptureThread`].
pub trait FrameGrabber {
    /// Wait for the next frame. May block for as long as the driver does.
    fn grab(&mut self) -> Result<Frame>;

    /// Release the device. Called once, on the capture thread, before it exits.
    fn close(&mut self) {}
}

enum Captured {
    Frame(Frame),
    Failed(PipelineError),
}

/// Runs a [`FrameGrabber`] on its own thread and keeps only the newest frame.
///
/// Polling never blocks: a device that stops delivering simply yields
/// `Ok(None)` until the pipeline's stall detection gives up on it. The first
/// error ends the thread and is reported by the next [`CaptureThread::poll`].
pub struct CaptureThread {
    events: Receiver<Captured>,
    stop_requested: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
}

impl CaptureThread {
    /// Start a capture thread. `open` runs on the new thread, so the grabber
    /// itself does not need to be `Send`.
    pub fn spawn<O, G>(name: &str, open: O) -> Result<Self>
    where
        O: FnOnce() -> Result<G> + Send + 'static,
        G: FrameGrabber + 'static,
    {
        let (sender, events) = crossbeam_channel::bounded::<Captured>(1);
        let stale = events.clone();
        let stop_requested = Arc::new(AtomicBool::new(false));
        let stop = stop_requested.clone();

        let thread_handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let publish = |event: Captured| {
                    if let Err(TrySendError::Full(event)) = sender.try_send(event) {
                        // Newest frame wins
                        let _ = stale.try_recv();
                        let _ = sender.try_send(event);
                    }
                };

                let mut grabber = match open() {
                    Ok(grabber) => grabber,
                    Err(e) => {
                        publish(Captured::Failed(e));
                        return;
                    }
                };

                while !stop.load(Ordering::Acquire) {
                    match grabber.grab() {
                        Ok(frame) => publish(Captured::Frame(frame)),
                        Err(e) => {
                            publish(Captured::Failed(e));
                            break;
                        }
                    }
                }

                grabber.close();
                tracing::debug!("Capture thread stopped");
            })
            .map_err(|e| {
                PipelineError::DeviceUnavailable(format!("failed to spawn capture thread: {}", e))
            })?;

        Ok(Self {
            events,
            stop_requested,
            thread_handle: Some(thread_handle),
        })
    }

    /// Newest frame since the last poll, without waiting.
    pub fn poll(&self) -> Result<Option<Frame>> {
        match self.events.try_recv() {
            Ok(Captured::Frame(frame)) => Ok(Some(frame)),
            Ok(Captured::Failed(e)) => Err(e),
            Err(TryRecvError::Empty) if self.is_running() => Ok(None),
            Err(_) => Err(PipelineError::DeviceUnavailable(
                "capture thread stopped".to_string(),
            )),
        }
    }

    pub fn is_running(&self) -> bool {
        self.thread_handle
            .as_ref()
            .map_or(false, |handle| !handle.is_finished())
    }

    /// Ask the thread to stop. Never waits on the driver: a thread still
    /// blocked in `grab` is detached and exits once the call returns.
    pub fn stop(&mut self) {
        self.stop_requested.store(true, Ordering::Release);
        let Some(handle) = self.thread_handle.take() else {
            return;
        };

        if handle.is_finished() {
            if handle.join().is_err() {
                tracing::warn!("Capture thread panicked");
            }
        } else {
            tracing::debug!("Capture thread still blocked in the driver, detaching it");
        }
    }
}

impl Drop for CaptureThread {
    fn drop(&mut self) {
        self.stop();
    }
}
