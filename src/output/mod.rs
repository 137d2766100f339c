mod loopback;

pub use loopback::V4L2Output;

use crate::frame::Frame;
use anyhow::Result;

/// Trait for output destinations
pub trait OutputSink {
    /// Write one composed frame to the output
    fn write_frame(&mut self, frame: &Frame) -> Result<()>;

    /// Get the expected output resolution
    fn resolution(&self) -> (u32, u32);
}
