//! Real-time webcam background replacement.
//!
//! Frames flow from a [`capture::FrameSource`] through a
//! [`segmentation::SegmentationEngine`] (inline or on an inference thread),
//! the mask is adapted by [`postprocess`] and blended with a background by
//! the [`compositor`]. [`pipeline::Pipeline`] ties the stages together as an
//! explicit state machine driven by the caller's scheduler.

pub mod capture;
pub mod compositor;
pub mod config;
pub mod error;
pub mod frame;
pub mod mask;
pub mod output;
pub mod pipeline;
pub mod postprocess;
pub mod segmentation;

pub use compositor::{composite, CompositeParameters, Compositor};
pub use config::{BlendPolicy, InferenceMode, PipelineConfig, RenderView, RetryPolicy};
pub use error::{PipelineError, Result};
pub use frame::{Frame, Origin, PixelFormat};
pub use mask::Mask;
pub use pipeline::{Pipeline, PipelineState, PipelineStats};
pub use postprocess::MaskPostProcessor;
