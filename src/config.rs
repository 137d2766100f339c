use crate::error::{PipelineError, Result};

pub const MIN_THRESHOLD: f32 = 0.001;
pub const MAX_THRESHOLD: f32 = 0.99;
/// Midpoint of the model's foreground probability.
pub const DEFAULT_THRESHOLD: f32 = 0.5;

/// Reject thresholds outside the supported range.
pub fn validate_threshold(threshold: f32) -> Result<f32> {
    if (MIN_THRESHOLD..=MAX_THRESHOLD).contains(&threshold) {
        Ok(threshold)
    } else {
        Err(PipelineError::InvalidThreshold(threshold))
    }
}

/// How mask values at or above the threshold blend toward the camera.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum BlendPolicy {
    /// Camera where mask >= threshold, background elsewhere.
    #[default]
    Hard,
    /// Smoothstep from the threshold up to `threshold + feather`.
    Smooth { feather: f32 },
}

/// Where inference runs relative to the processing tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InferenceMode {
    /// Inside `tick()`, on the caller's thread.
    Inline,
    /// On a dedicated worker thread; `tick()` only submits.
    #[default]
    Offloaded,
}

/// Restart schedule used while the capture device is down.
///
/// The delay between restart attempts starts at `initial_delay_ticks` and
/// doubles up to `max_delay_ticks`. With `max_attempts` set, restarts stop
/// after that many failures but the source keeps being polled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub initial_delay_ticks: u32,
    pub max_delay_ticks: u32,
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ticks: 3,
            max_delay_ticks: 90,
            max_attempts: None,
        }
    }
}

impl RetryPolicy {
    /// Ticks to wait before restart attempt number `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> u32 {
        let initial = self.initial_delay_ticks.max(1);
        let delay = initial.saturating_mul(1u32 << attempt.min(16));
        delay.min(self.max_delay_ticks.max(initial))
    }

    pub fn allows(&self, attempt: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempt < max)
    }
}

/// Which image the render tick emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RenderView {
    #[default]
    Composite,
    /// Grayscale view of the processed mask.
    Matte,
}

/// Settings for one pipeline instance.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// Render surface size.
    pub output_width: u32,
    pub output_height: u32,
    pub threshold: f32,
    pub blend: BlendPolicy,
    /// Gaussian sigma applied to the resampled mask; `None` disables it.
    pub smooth_sigma: Option<f32>,
    pub inference: InferenceMode,
    /// Consecutive ticks without a new frame before the device counts as lost.
    pub stall_ticks: u32,
    pub retry: RetryPolicy,
    pub view: RenderView,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            output_width: 1280,
            output_height: 720,
            threshold: DEFAULT_THRESHOLD,
            blend: BlendPolicy::default(),
            smooth_sigma: None,
            inference: InferenceMode::default(),
            stall_ticks: 30,
            retry: RetryPolicy::default(),
            view: RenderView::default(),
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        validate_threshold(self.threshold)?;
        if self.output_width == 0 || self.output_height == 0 {
            return Err(PipelineError::InvalidConfig(format!(
                "output size {}x{}",
                self.output_width, self.output_height
            )));
        }
        if let BlendPolicy::Smooth { feather } = self.blend {
            if feather.is_nan() || feather <= 0.0 {
                return Err(PipelineError::InvalidConfig(format!(
                    "feather must be positive, got {}",
                    feather
                )));
            }
        }
        Ok(())
    }
}
