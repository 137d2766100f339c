use super::engine::{SegmentationEngine, SharedMask};
use crate::error::{PipelineError, Result};
use crate::frame::Frame;
use crate::mask::Mask;
use crossbeam_channel::{Receiver, Sender, TrySendError};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Counters shared with the inference thread.
#[derive(Default)]
struct WorkerStats {
    completed: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

/// Runs a [`SegmentationEngine`] on a dedicated thread.
///
/// At most one frame is pending and one is being inferred. Submitting while
/// a frame is still pending replaces it, so the worker always picks up the
/// newest frame and nothing queues behind a slow model.
pub struct InferenceWorker {
    /// Channel to send frames to inference thread
    frame_sender: Option<Sender<Arc<Frame>>>,
    /// Second handle on the pending slot, used to evict stale frames
    pending: Receiver<Arc<Frame>>,
    mask: SharedMask,
    stats: Arc<WorkerStats>,
    reset_requested: Arc<AtomicBool>,
    death_reported: AtomicBool,
    output_size: (u32, u32),
    thread_handle: Option<std::thread::JoinHandle<()>>,
}

impl InferenceWorker {
    /// Move `engine` onto a new inference thread.
    pub fn spawn(engine: SegmentationEngine) -> Result<Self> {
        let (frame_sender, frame_receiver) = crossbeam_channel::bounded::<Arc<Frame>>(1);
        let mask = engine.shared_mask();
        let output_size = engine.output_size();
        let stats = Arc::new(WorkerStats::default());
        let reset_requested = Arc::new(AtomicBool::new(false));

        let pending = frame_receiver.clone();
        let stats_clone = stats.clone();
        let reset_clone = reset_requested.clone();

        let thread_handle = std::thread::Builder::new()
            .name("nncam-inference".to_string())
            .spawn(move || {
                Self::inference_thread(engine, frame_receiver, stats_clone, reset_clone);
            })
            .map_err(|e| {
                PipelineError::ResourceLoadFailed(format!("failed to spawn inference thread: {}", e))
            })?;

        Ok(Self {
            frame_sender: Some(frame_sender),
            pending,
            mask,
            stats,
            reset_requested,
            death_reported: AtomicBool::new(false),
            output_size,
            thread_handle: Some(thread_handle),
        })
    }

    /// Inference thread main loop
    fn inference_thread(
        mut engine: SegmentationEngine,
        frame_receiver: Receiver<Arc<Frame>>,
        stats: Arc<WorkerStats>,
        reset_requested: Arc<AtomicBool>,
    ) {
        tracing::info!("Inference thread started");

        // Ends once every sender is dropped
        while let Ok(frame) = frame_receiver.recv() {
            if reset_requested.swap(false, Ordering::AcqRel) {
                engine.reset_state();
            }
            match engine.process_image(&frame) {
                Ok(()) => {
                    stats.completed.fetch_add(1, Ordering::Release);
                }
                Err(_) => {
                    // Already logged by the engine; the previous mask stays current.
                    stats.failed.fetch_add(1, Ordering::Release);
                }
            }
        }

        engine.dispose();
        tracing::info!("Inference thread stopped");
    }

    /// Hand a frame to the inference thread without blocking.
    ///
    /// If the thread has died the frame counts as a failed inference and the
    /// last mask stays current.
    pub fn submit(&self, frame: Arc<Frame>) {
        let Some(sender) = self.frame_sender.as_ref() else {
            return;
        };

        if !self.is_running() {
            if !self.death_reported.swap(true, Ordering::AcqRel) {
                tracing::error!("Inference thread has stopped; the mask will no longer update");
            }
            self.stats.failed.fetch_add(1, Ordering::Release);
            return;
        }

        // `pending` keeps the channel connected, so Full is the only error.
        if let Err(TrySendError::Full(frame)) = sender.try_send(frame) {
            // Newest frame wins: evict whatever is still waiting.
            if self.pending.try_recv().is_ok() {
                self.stats.dropped.fetch_add(1, Ordering::Release);
            }
            if sender.try_send(frame).is_err() {
                self.stats.dropped.fetch_add(1, Ordering::Release);
            }
        }
    }

    /// Latest completed mask. Never waits for inference.
    pub fn current_mask(&self) -> Arc<Mask> {
        self.mask.load()
    }

    /// Ask the thread to clear recurrent state before its next inference.
    pub fn reset_state(&self) {
        self.reset_requested.store(true, Ordering::Release);
    }

    pub fn output_size(&self) -> (u32, u32) {
        self.output_size
    }

    pub fn completed(&self) -> u64 {
        self.stats.completed.load(Ordering::Acquire)
    }

    pub fn failed(&self) -> u64 {
        self.stats.failed.load(Ordering::Acquire)
    }

    /// Frames replaced or discarded before inference picked them up.
    pub fn dropped(&self) -> u64 {
        self.stats.dropped.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        self.thread_handle
            .as_ref()
            .map_or(false, |handle| !handle.is_finished())
    }

    /// Stop the inference thread and release the model. Idempotent.
    pub fn shutdown(&mut self) {
        // Drop sender to signal thread to stop
        self.frame_sender = None;
        // Discard a frame nobody will process
        while self.pending.try_recv().is_ok() {}

        // Wait for thread to finish
        if let Some(handle) = self.thread_handle.take() {
            if handle.join().is_err() {
                tracing::warn!("Inference thread panicked during shutdown");
            }
        }
    }
}

impl Drop for InferenceWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}
