use super::bundle::ResourceBundle;
use super::session::{load_session, to_array4};
use super::types::SegmentationModel;
use crate::mask::Mask;
use anyhow::{ensure, Context, Result};
use ndarray::{arr1, Array4};
use ort::session::Session;
use ort::value::Tensor;

/// RobustVideoMatting segmentation model
///
/// This model uses recurrent connections to maintain temporal consistency.
/// Hidden states (r1-r4) are carried between frames for smooth results.
pub struct RobustVideoMatting {
    session: Session,
    width: u32,
    height: u32,

    // Recurrent hidden states
    // These are updated after each inference and fed back in the next frame
    r1: Array4<f32>,
    r2: Array4<f32>,
    r3: Array4<f32>,
    r4: Array4<f32>,

    // Downsample ratio the network applies before its recurrent decoder
    downsample_ratio: f32,
}

/// The exported graph accepts 1x1x1x1 zeros as "no history" and grows the
/// states to their real shapes on the first frame.
fn empty_state() -> Array4<f32> {
    Array4::zeros((1, 1, 1, 1))
}

impl RobustVideoMatting {
    /// Create a new RVM model from a resource bundle
    ///
    /// Input size and downsample ratio come from the bundle; the defaults
    /// (512x512, 0.25) trade quality for speed on a 720p feed.
    pub fn new(bundle: &ResourceBundle) -> Result<Self> {
        tracing::info!("Loading RVM model from {}", bundle.model.display());

        let session = load_session(&bundle.model)?;

        tracing::info!("RVM model loaded successfully");

        Ok(Self {
            session,
            width: bundle.input_width,
            height: bundle.input_height,
            r1: empty_state(),
            r2: empty_state(),
            r3: empty_state(),
            r4: empty_state(),
            downsample_ratio: bundle.downsample_ratio,
        })
    }
}

impl SegmentationModel for RobustVideoMatting {
    fn infer(&mut self, input: Array4<f32>) -> Result<Mask> {
        let _span = tracing::debug_span!("rvm_segment").entered();

        // RVM expects: src (frame), r1i..r4i, downsample_ratio
        let outputs = self
            .session
            .run(ort::inputs![
                "src" => Tensor::from_array(input)?,
                "r1i" => Tensor::from_array(self.r1.clone())?,
                "r2i" => Tensor::from_array(self.r2.clone())?,
                "r3i" => Tensor::from_array(self.r3.clone())?,
                "r4i" => Tensor::from_array(self.r4.clone())?,
                "downsample_ratio" => Tensor::from_array(arr1(&[self.downsample_ratio]))?,
            ])
            .context("Failed to run inference")?;

        // Outputs: fgr (foreground), pha (alpha), r1o..r4o
        // We only need pha (the matte) and the updated hidden states
        let read = |name: &str| -> Result<Array4<f32>> {
            let value = outputs
                .get(name)
                .with_context(|| format!("model has no output named {}", name))?;
            let (shape, data) = value.try_extract_tensor::<f32>()?;
            to_array4(&shape, data)
        };
        let pha = read("pha")?;

        // Update hidden states for next frame
        let (r1, r2, r3, r4) = (read("r1o")?, read("r2o")?, read("r3o")?, read("r4o")?);
        self.r1 = r1;
        self.r2 = r2;
        self.r3 = r3;
        self.r4 = r4;

        // Alpha matte shape: [1, 1, H, W]
        let shape = pha.shape();
        ensure!(
            shape[0] == 1 && shape[1] == 1,
            "unexpected alpha shape {:?}",
            shape
        );
        let (height, width) = (shape[2] as u32, shape[3] as u32);

        Ok(Mask::from_vec(
            width,
            height,
            pha.into_raw_vec_and_offset().0,
        )?)
    }

    fn reset_state(&mut self) {
        tracing::info!("Resetting RVM hidden states");
        self.r1 = empty_state();
        self.r2 = empty_state();
        self.r3 = empty_state();
        self.r4 = empty_state();
    }

    fn input_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}
