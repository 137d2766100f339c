use thiserror::Error;

/// Errors surfaced by the segmentation/compositing pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Model assets missing or corrupt. Fatal: the pipeline stays uninitialized.
    #[error("failed to load model resources: {0}")]
    ResourceLoadFailed(String),

    /// Capture source produced no usable frame. Recoverable.
    #[error("capture device unavailable: {0}")]
    DeviceUnavailable(String),

    /// A single inference call failed. The previous mask is kept.
    #[error("inference failed: {0}")]
    InferenceFailure(String),

    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    /// Rejected pipeline settings, other than the threshold.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("threshold {0} outside [{min}, {max}]", min = crate::config::MIN_THRESHOLD, max = crate::config::MAX_THRESHOLD)]
    InvalidThreshold(f32),

    #[error("{operation} is not valid while the pipeline is {state}")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },
}

impl PipelineError {
    /// Whether the render loop can keep going after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            PipelineError::DeviceUnavailable(_) | PipelineError::InferenceFailure(_)
        )
    }
}

/// Convenience Result alias.
pub type Result<T> = std::result::Result<T, PipelineError>;
