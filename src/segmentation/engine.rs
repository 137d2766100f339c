use super::bundle::ResourceBundle;
use super::preprocess::Preprocessor;
use super::types::SegmentationModel;
use crate::error::{PipelineError, Result};
use crate::frame::Frame;
use crate::mask::Mask;
use parking_lot::Mutex;
use std::sync::Arc;

/// Latest-mask slot shared between the inference writer and render readers.
///
/// Writers swap in a whole new `Arc<Mask>`; readers clone the current `Arc`.
/// The lock is only held for the pointer swap, never across inference.
#[derive(Clone)]
pub struct SharedMask {
    inner: Arc<Mutex<Arc<Mask>>>,
}

impl SharedMask {
    pub fn new(initial: Mask) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Arc::new(initial))),
        }
    }

    pub fn load(&self) -> Arc<Mask> {
        Arc::clone(&self.inner.lock())
    }

    pub fn store(&self, mask: Mask) {
        *self.inner.lock() = Arc::new(mask);
    }
}

/// Owns a segmentation model and publishes its latest mask.
pub struct SegmentationEngine {
    model: Option<Box<dyn SegmentationModel>>,
    preprocessor: Preprocessor,
    latest: SharedMask,
    output_size: (u32, u32),
}

impl SegmentationEngine {
    /// Load the model described by `resources`.
    pub fn initialize(resources: &ResourceBundle) -> Result<Self> {
        resources.validate()?;
        let model = super::create_model(resources).map_err(|e| {
            tracing::error!("Failed to load segmentation model: {:#}", e);
            PipelineError::ResourceLoadFailed(format!("{:#}", e))
        })?;
        Ok(Self::with_model(model, Preprocessor::for_bundle(resources)))
    }

    /// Wrap an already constructed model.
    pub fn with_model(model: Box<dyn SegmentationModel>, preprocessor: Preprocessor) -> Self {
        let output_size = model.output_size();
        tracing::debug!(
            "Segmentation engine ready: input {:?}, mask {:?}",
            model.input_size(),
            output_size
        );
        Self {
            model: Some(model),
            preprocessor,
            latest: SharedMask::new(Mask::empty(output_size.0, output_size.1)),
            output_size,
        }
    }

    /// Run inference on `frame` and publish the result.
    ///
    /// On failure the previously published mask stays current.
    pub fn process_image(&mut self, frame: &Frame) -> Result<()> {
        let model = self.model.as_mut().ok_or(PipelineError::InvalidState {
            operation: "process_image",
            state: "disposed",
        })?;

        let input = self.preprocessor.preprocess(frame.image());
        let mask = model.infer(input).map_err(|e| {
            tracing::warn!("Inference failed on frame {}: {:#}", frame.sequence(), e);
            PipelineError::InferenceFailure(format!("{:#}", e))
        })?;

        if mask.dimensions() != self.output_size {
            tracing::warn!(
                "Model returned a {:?} mask, expected {:?}",
                mask.dimensions(),
                self.output_size
            );
            return Err(PipelineError::InferenceFailure(format!(
                "mask size changed from {:?} to {:?}",
                self.output_size,
                mask.dimensions()
            )));
        }

        self.latest
            .store(mask.with_source_sequence(frame.sequence()));
        Ok(())
    }

    /// Most recent completed mask; all background before the first one.
    pub fn current_mask(&self) -> Arc<Mask> {
        self.latest.load()
    }

    /// Handle for reading masks from another thread.
    pub fn shared_mask(&self) -> SharedMask {
        self.latest.clone()
    }

    pub fn output_size(&self) -> (u32, u32) {
        self.output_size
    }

    /// Forget recurrent context, e.g. after the camera dropped out.
    pub fn reset_state(&mut self) {
        if let Some(model) = self.model.as_mut() {
            model.reset_state();
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.model.is_none()
    }

    /// Release the model. Safe to call repeatedly.
    pub fn dispose(&mut self) {
        if self.model.take().is_some() {
            tracing::info!("Segmentation model released");
        }
    }
}
