use crate::error::{PipelineError, Result};
use image::{ImageBuffer, Luma};

/// Single-channel f32 image backing a [`Mask`].
pub type MaskBuffer = ImageBuffer<Luma<f32>, Vec<f32>>;

/// Per-pixel foreground probability: 0.0 = background, 1.0 = foreground.
///
/// Values are clamped to [0, 1] on construction. A mask remembers the
/// sequence number of the frame it was inferred from so renderers can tell
/// how stale it is.
#[derive(Debug, Clone, PartialEq)]
pub struct Mask {
    buffer: MaskBuffer,
    source_sequence: Option<u64>,
}

impl Mask {
    /// All-background mask used before the first inference completes.
    pub fn empty(width: u32, height: u32) -> Self {
        Self::filled(width, height, 0.0)
    }

    pub fn filled(width: u32, height: u32, value: f32) -> Self {
        Self {
            buffer: MaskBuffer::from_pixel(width, height, Luma([value.clamp(0.0, 1.0)])),
            source_sequence: None,
        }
    }

    /// Build a mask from row-major values.
    pub fn from_vec(width: u32, height: u32, mut values: Vec<f32>) -> Result<Self> {
        let expected = width as usize * height as usize;
        if values.len() != expected {
            return Err(PipelineError::InferenceFailure(format!(
                "mask {}x{} needs {} values, got {}",
                width,
                height,
                expected,
                values.len()
            )));
        }
        for v in values.iter_mut() {
            // NaN from a misbehaving model counts as background.
            *v = if v.is_nan() { 0.0 } else { v.clamp(0.0, 1.0) };
        }
        let buffer = MaskBuffer::from_raw(width, height, values)
            .ok_or_else(|| PipelineError::InferenceFailure("mask buffer rejected".to_string()))?;
        Ok(Self {
            buffer,
            source_sequence: None,
        })
    }

    pub(crate) fn from_buffer(buffer: MaskBuffer, source_sequence: Option<u64>) -> Self {
        Self {
            buffer,
            source_sequence,
        }
    }

    pub fn with_source_sequence(mut self, sequence: u64) -> Self {
        self.source_sequence = Some(sequence);
        self
    }

    /// Sequence of the frame this mask was inferred from; `None` if synthetic.
    pub fn source_sequence(&self) -> Option<u64> {
        self.source_sequence
    }

    pub fn width(&self) -> u32 {
        self.buffer.width()
    }

    pub fn height(&self) -> u32 {
        self.buffer.height()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.buffer.dimensions()
    }

    pub fn value(&self, x: u32, y: u32) -> f32 {
        self.buffer.get_pixel(x, y)[0]
    }

    pub fn values(&self) -> &[f32] {
        self.buffer.as_raw()
    }

    pub fn buffer(&self) -> &MaskBuffer {
        &self.buffer
    }

    /// Number of pixels with a non-zero value.
    pub fn coverage(&self) -> usize {
        self.values().iter().filter(|&&v| v > 0.0).count()
    }
}
