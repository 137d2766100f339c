use crate::mask::Mask;
use anyhow::Result;
use ndarray::Array4;

/// Trait for segmentation models
/// Allows swapping between different backends (RVM, selfie segmentation, test doubles)
pub trait SegmentationModel: Send {
    /// Run the network on a preprocessed input tensor
    ///
    /// # Arguments
    /// * `input` - Tensor shaped for this model (see [`super::Preprocessor`])
    ///
    /// # Returns
    /// * Foreground probability mask at [`SegmentationModel::output_size`]
    fn infer(&mut self, input: Array4<f32>) -> Result<Mask>;

    /// Reset internal state (for models with temporal/recurrent components)
    ///
    /// Called when the capture device drops out, so temporal context from
    /// before the gap is not blended into new frames.
    fn reset_state(&mut self) {
        // Default implementation: no-op for stateless models
    }

    /// Get the model's input dimensions
    ///
    /// Returns (width, height)
    fn input_size(&self) -> (u32, u32);

    /// Get the mask dimensions (usually matches input)
    ///
    /// Returns (width, height)
    fn output_size(&self) -> (u32, u32) {
        self.input_size()
    }
}
