use super::bundle::{ResourceBundle, TensorLayout};
use super::session::load_session;
use super::types::SegmentationModel;
use crate::mask::Mask;
use anyhow::{bail, ensure, Context, Result};
use ndarray::Array4;
use ort::session::Session;
use ort::value::Tensor;

/// Stateless model with one image input and a mask output, such as
/// MediaPipe selfie segmentation.
pub struct SingleOutputSegmenter {
    session: Session,
    width: u32,
    height: u32,
    output_index: usize,
    layout: TensorLayout,
}

impl SingleOutputSegmenter {
    pub fn new(bundle: &ResourceBundle) -> Result<Self> {
        tracing::info!(
            "Loading single-output segmentation model from {}",
            bundle.model.display()
        );
        let session = load_session(&bundle.model)?;
        Ok(Self {
            session,
            width: bundle.input_width,
            height: bundle.input_height,
            output_index: bundle.output_index,
            layout: bundle.layout,
        })
    }
}

/// Pick the foreground plane out of a mask tensor.
///
/// Accepts `[1, H, W]` and four-dimensional outputs with one or two class
/// channels, where the last class is foreground. `layout` says where the
/// class axis sits; a shape that only fits the other layout is read that way.
pub(crate) fn foreground_plane(
    shape: &[i64],
    data: &[f32],
    layout: TensorLayout,
) -> Result<(u32, u32, Vec<f32>)> {
    let dims: Vec<usize> = shape.iter().map(|d| (*d).max(0) as usize).collect();
    let channels_first = |dims: &[usize]| matches!(dims, [1, 1 | 2, _, _]);
    let channels_last = |dims: &[usize]| matches!(dims, [1, _, _, 1 | 2]);

    let (width, height, values) = match dims.as_slice() {
        [1, h, w] => (*w, *h, data.to_vec()),
        [1, a, b, c] => {
            let nchw = match layout {
                TensorLayout::Nchw => channels_first(&dims) || !channels_last(&dims),
                TensorLayout::Nhwc => !channels_last(&dims),
            };
            if nchw {
                if !channels_first(&dims) {
                    bail!("unsupported mask output shape {:?}", shape);
                }
                let plane = b * c;
                let start = (a - 1) * plane;
                let values = data
                    .get(start..start + plane)
                    .context("mask tensor shorter than its shape")?;
                (*c, *b, values.to_vec())
            } else {
                let values: Vec<f32> = data.iter().skip(c - 1).step_by(*c).copied().collect();
                ensure!(values.len() == a * b, "mask tensor shorter than its shape");
                (*b, *a, values)
            }
        }
        _ => bail!("unsupported mask output shape {:?}", shape),
    };
    Ok((width as u32, height as u32, values))
}

impl SegmentationModel for SingleOutputSegmenter {
    fn infer(&mut self, input: Array4<f32>) -> Result<Mask> {
        let _span = tracing::debug_span!("single_output_segment").entered();

        let outputs = self
            .session
            .run(ort::inputs![Tensor::from_array(input)?])
            .context("Failed to run inference")?;

        let (_name, output) = outputs
            .iter()
            .nth(self.output_index)
            .with_context(|| format!("model has no output #{}", self.output_index))?;
        let (shape, data) = output.try_extract_tensor::<f32>()?;
        let (width, height, values) = foreground_plane(&shape, data, self.layout)?;

        Ok(Mask::from_vec(width, height, values)?)
    }

    fn input_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}
