//! Pipeline state machine.
//!
//! An external scheduler drives the pipeline by calling [`Pipeline::tick`]
//! at the processing rate (capture and inference submission) and
//! [`Pipeline::render`] at the display rate. Rendering never waits for
//! inference; it composites the newest frame with whatever mask is current.

use crate::capture::FrameSource;
use crate::compositor::{CompositeParameters, Compositor};
use crate::config::{validate_threshold, InferenceMode, PipelineConfig, RenderView, RetryPolicy};
use crate::error::{PipelineError, Result};
use crate::frame::Frame;
use crate::mask::Mask;
use crate::segmentation::{InferenceWorker, ResourceBundle, SegmentationEngine};
use std::fmt;
use std::sync::Arc;

/// Every state except `Disposed`.
const LIVE_STATES: [PipelineState; 4] = [
    PipelineState::Uninitialized,
    PipelineState::Ready,
    PipelineState::Running,
    PipelineState::Suspended,
];

/// Lifecycle of a [`Pipeline`].
///
/// `Uninitialized → Ready → Running ⇄ Suspended`, and any state `→ Disposed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Uninitialized,
    /// Model loaded, no frame seen yet.
    Ready,
    Running,
    /// Capture device lost; waiting for it to come back.
    Suspended,
    Disposed,
}

impl PipelineState {
    pub fn name(self) -> &'static str {
        match self {
            PipelineState::Uninitialized => "uninitialized",
            PipelineState::Ready => "ready",
            PipelineState::Running => "running",
            PipelineState::Suspended => "suspended",
            PipelineState::Disposed => "disposed",
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Counters for logging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub frames_ingested: u64,
    pub frames_rendered: u64,
    pub inferences_completed: u64,
    pub inference_failures: u64,
    /// Frames the inference worker skipped because a newer one arrived.
    pub frames_dropped: u64,
    pub device_losses: u64,
    pub restart_attempts: u64,
    pub model_loads: u64,
}

/// Where masks come from.
enum Inference {
    Inline {
        engine: SegmentationEngine,
        completed: u64,
        failed: u64,
    },
    Offloaded(InferenceWorker),
}

impl Inference {
    fn submit(&mut self, frame: &Arc<Frame>) {
        match self {
            Inference::Inline {
                engine,
                completed,
                failed,
            } => match engine.process_image(frame) {
                Ok(()) => *completed += 1,
                // Logged by the engine; the previous mask stays current.
                Err(_) => *failed += 1,
            },
            Inference::Offloaded(worker) => worker.submit(Arc::clone(frame)),
        }
    }

    fn current_mask(&self) -> Arc<Mask> {
        match self {
            Inference::Inline { engine, .. } => engine.current_mask(),
            Inference::Offloaded(worker) => worker.current_mask(),
        }
    }

    fn reset_state(&mut self) {
        match self {
            Inference::Inline { engine, .. } => engine.reset_state(),
            Inference::Offloaded(worker) => worker.reset_state(),
        }
    }

    fn counters(&self) -> (u64, u64, u64) {
        match self {
            Inference::Inline {
                completed, failed, ..
            } => (*completed, *failed, 0),
            Inference::Offloaded(worker) => (worker.completed(), worker.failed(), worker.dropped()),
        }
    }

    fn dispose(self) {
        match self {
            Inference::Inline { mut engine, .. } => engine.dispose(),
            Inference::Offloaded(mut worker) => worker.shutdown(),
        }
    }
}

/// Restart bookkeeping while suspended.
struct Suspension {
    attempts: u32,
    ticks_until_retry: u32,
    gave_up: bool,
}

impl Suspension {
    fn new(policy: &RetryPolicy) -> Self {
        Self {
            attempts: 0,
            ticks_until_retry: policy.delay_for(0),
            gave_up: false,
        }
    }
}

/// Camera → segmentation → compositing pipeline.
pub struct Pipeline {
    config: PipelineConfig,
    background: Frame,
    state: PipelineState,
    source: Option<Box<dyn FrameSource>>,
    inference: Option<Inference>,
    compositor: Option<Compositor>,
    latest_frame: Option<Arc<Frame>>,
    next_sequence: u64,
    idle_ticks: u32,
    suspension: Option<Suspension>,
    stats: PipelineStats,
}

impl Pipeline {
    /// Create an uninitialized pipeline. Fails on invalid configuration.
    pub fn new(config: PipelineConfig, background: Frame) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            background,
            state: PipelineState::Uninitialized,
            source: None,
            inference: None,
            compositor: None,
            latest_frame: None,
            next_sequence: 1,
            idle_ticks: 0,
            suspension: None,
            stats: PipelineStats::default(),
        })
    }

    /// Load the model from `resources` and take ownership of `source`.
    ///
    /// On `ResourceLoadFailed` the pipeline stays uninitialized.
    pub fn initialize(
        &mut self,
        resources: &ResourceBundle,
        source: Box<dyn FrameSource>,
    ) -> Result<()> {
        self.expect_state("initialize", &[PipelineState::Uninitialized])?;
        let engine = SegmentationEngine::initialize(resources)?;
        self.initialize_with_engine(engine, source)
    }

    /// Like [`Pipeline::initialize`] with an already loaded engine.
    pub fn initialize_with_engine(
        &mut self,
        engine: SegmentationEngine,
        source: Box<dyn FrameSource>,
    ) -> Result<()> {
        self.expect_state("initialize", &[PipelineState::Uninitialized])?;

        let compositor = Compositor::initialize(
            self.config.output_width,
            self.config.output_height,
            CompositeParameters {
                background: self.background.clone(),
                threshold: self.config.threshold,
                blend: self.config.blend,
            },
            self.config.smooth_sigma,
        )?;

        let inference = match self.config.inference {
            InferenceMode::Inline => Inference::Inline {
                engine,
                completed: 0,
                failed: 0,
            },
            InferenceMode::Offloaded => Inference::Offloaded(InferenceWorker::spawn(engine)?),
        };

        tracing::info!(
            "Pipeline ready: {}x{} output, threshold {}, {:?} inference",
            self.config.output_width,
            self.config.output_height,
            self.config.threshold,
            self.config.inference
        );

        self.compositor = Some(compositor);
        self.inference = Some(inference);
        self.source = Some(source);
        self.stats.model_loads += 1;
        self.state = PipelineState::Ready;
        Ok(())
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Processing tick: poll the source and submit the newest frame.
    ///
    /// Device problems never surface here; they move the pipeline to
    /// `Suspended`. Errors are only returned for invalid states.
    pub fn tick(&mut self) -> Result<()> {
        self.expect_state(
            "tick",
            &[
                PipelineState::Ready,
                PipelineState::Running,
                PipelineState::Suspended,
            ],
        )?;
        let _span = tracing::debug_span!("tick").entered();

        let polled = match self.source.as_mut() {
            Some(source) => source.poll_frame(),
            None => Err(PipelineError::DeviceUnavailable("no capture source".to_string())),
        };

        match polled {
            Ok(Some(frame)) if frame.has_valid_dimensions() => self.accept_frame(frame),
            Ok(Some(frame)) => {
                let (width, height) = frame.dimensions();
                self.device_lost(format!("device delivered a {}x{} placeholder", width, height));
            }
            Ok(None) => {
                self.idle_ticks = self.idle_ticks.saturating_add(1);
                if self.state != PipelineState::Suspended && self.idle_ticks >= self.config.stall_ticks
                {
                    self.device_lost(format!("no new frame for {} ticks", self.idle_ticks));
                } else if self.state == PipelineState::Suspended {
                    self.retry_step();
                }
            }
            Err(e) => self.device_lost(e.to_string()),
        }

        Ok(())
    }

    /// Render tick: emit exactly one frame.
    ///
    /// Running composites the newest frame with the current mask. Suspended
    /// repeats the last composite. Ready (no frame yet) shows the background.
    pub fn render(&mut self) -> Result<&Frame> {
        self.expect_state(
            "render",
            &[
                PipelineState::Ready,
                PipelineState::Running,
                PipelineState::Suspended,
            ],
        )?;

        let frame = self.latest_frame.clone();
        let mask = self.inference.as_ref().map(Inference::current_mask);
        let view = self.config.view;
        let state = self.state;
        let compositor = self.compositor.as_mut().ok_or(PipelineError::InvalidState {
            operation: "render",
            state: "released",
        })?;

        self.stats.frames_rendered += 1;
        match (state, frame, mask) {
            (PipelineState::Running, Some(frame), Some(mask)) => match view {
                RenderView::Composite => compositor.render(&frame, &mask),
                RenderView::Matte => compositor.render_matte(&mask),
            },
            (PipelineState::Ready, _, _) => compositor.render_background(),
            _ => compositor.render_frozen(),
        }
    }

    /// Latest completed mask.
    pub fn current_mask(&self) -> Option<Arc<Mask>> {
        self.inference.as_ref().map(Inference::current_mask)
    }

    pub fn latest_frame(&self) -> Option<&Arc<Frame>> {
        self.latest_frame.as_ref()
    }

    /// How many frames the current mask lags behind the newest frame.
    ///
    /// `None` until both a frame and an inferred mask exist.
    pub fn mask_age(&self) -> Option<u64> {
        let latest = self.latest_frame.as_ref()?.sequence();
        let source = self.current_mask()?.source_sequence()?;
        Some(latest.saturating_sub(source))
    }

    /// Change the foreground cutoff. Rejected once disposed.
    pub fn set_threshold(&mut self, threshold: f32) -> Result<()> {
        self.expect_state("set_threshold", &LIVE_STATES)?;
        let threshold = validate_threshold(threshold)?;
        if let Some(compositor) = self.compositor.as_mut() {
            compositor.set_threshold(threshold)?;
        }
        self.config.threshold = threshold;
        Ok(())
    }

    /// Replace the background image. Rejected once disposed.
    pub fn set_background(&mut self, background: Frame) -> Result<()> {
        self.expect_state("set_background", &LIVE_STATES)?;
        if let Some(compositor) = self.compositor.as_mut() {
            compositor.set_background(&background)?;
        }
        self.background = background;
        Ok(())
    }

    pub fn stats(&self) -> PipelineStats {
        let mut stats = self.stats;
        if let Some(inference) = &self.inference {
            let (completed, failed, dropped) = inference.counters();
            stats.inferences_completed = completed;
            stats.inference_failures = failed;
            stats.frames_dropped = dropped;
        }
        stats
    }

    /// Release everything. Valid from any state; repeated calls do nothing.
    pub fn dispose(&mut self) {
        if self.state == PipelineState::Disposed {
            return;
        }

        if let Some(inference) = self.inference.take() {
            inference.dispose();
        }
        if let Some(mut compositor) = self.compositor.take() {
            compositor.release();
        }
        if let Some(mut source) = self.source.take() {
            source.stop();
        }
        self.latest_frame = None;
        self.suspension = None;

        tracing::info!("Pipeline disposed (was {})", self.state);
        self.state = PipelineState::Disposed;
    }

    fn accept_frame(&mut self, frame: Frame) {
        let frame = Arc::new(frame.with_sequence(self.next_sequence));
        self.next_sequence += 1;
        self.idle_ticks = 0;
        self.stats.frames_ingested += 1;

        match self.state {
            PipelineState::Suspended => {
                let attempts = self.suspension.take().map_or(0, |s| s.attempts);
                tracing::info!(
                    "Capture recovered after {} restart attempt(s), resuming",
                    attempts
                );
            }
            PipelineState::Ready => {
                let (width, height) = frame.dimensions();
                tracing::info!("First frame received ({}x{})", width, height);
            }
            _ => {}
        }
        self.state = PipelineState::Running;

        if let Some(inference) = self.inference.as_mut() {
            inference.submit(&frame);
        }
        self.latest_frame = Some(frame);
    }

    fn device_lost(&mut self, reason: String) {
        if self.state == PipelineState::Suspended {
            self.retry_step();
            return;
        }

        tracing::warn!("Capture device lost: {}. Suspending pipeline", reason);
        self.stats.device_losses += 1;
        self.state = PipelineState::Suspended;
        self.suspension = Some(Suspension::new(&self.config.retry));
        // Temporal context from before the gap no longer applies.
        if let Some(inference) = self.inference.as_mut() {
            inference.reset_state();
        }
    }

    fn retry_step(&mut self) {
        let policy = self.config.retry;
        let Some(suspension) = self.suspension.as_mut() else {
            return;
        };

        suspension.ticks_until_retry = suspension.ticks_until_retry.saturating_sub(1);
        if suspension.ticks_until_retry > 0 {
            return;
        }

        if !policy.allows(suspension.attempts) {
            if !suspension.gave_up {
                tracing::error!(
                    "Camera still unavailable after {} restart attempts; no further restarts",
                    suspension.attempts
                );
                suspension.gave_up = true;
            }
            return;
        }

        suspension.attempts += 1;
        suspension.ticks_until_retry = policy.delay_for(suspension.attempts);
        self.stats.restart_attempts += 1;
        let attempt = suspension.attempts;

        if let Some(source) = self.source.as_mut() {
            match source.restart() {
                Ok(()) => tracing::info!("Camera restart attempt {} started", attempt),
                Err(e) => tracing::warn!("Camera restart attempt {} failed: {}", attempt, e),
            }
        }
    }

    fn expect_state(&self, operation: &'static str, allowed: &[PipelineState]) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(PipelineError::InvalidState {
                operation,
                state: self.state.name(),
            })
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.dispose();
    }
}
