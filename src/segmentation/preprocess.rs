use super::bundle::{Normalization, ResourceBundle, TensorLayout};
use image::{imageops, RgbImage};
use ndarray::Array4;

/// Converts frames into model input tensors. Pure: no state changes between calls.
#[derive(Debug, Clone)]
pub struct Preprocessor {
    target_width: u32,
    target_height: u32,
    layout: TensorLayout,
    normalization: Normalization,
}

impl Preprocessor {
    pub fn new(target_width: u32, target_height: u32) -> Self {
        Self {
            target_width,
            target_height,
            layout: TensorLayout::Nchw,
            normalization: Normalization::default(),
        }
    }

    pub fn for_bundle(bundle: &ResourceBundle) -> Self {
        Self::new(bundle.input_width, bundle.input_height)
            .with_layout(bundle.layout)
            .with_normalization(bundle.normalization)
    }

    pub fn with_layout(mut self, layout: TensorLayout) -> Self {
        self.layout = layout;
        self
    }

    pub fn with_normalization(mut self, normalization: Normalization) -> Self {
        self.normalization = normalization;
        self
    }

    pub fn target_size(&self) -> (u32, u32) {
        (self.target_width, self.target_height)
    }

    /// Preprocess an RGB image into a normalized input tensor
    ///
    /// Steps:
    /// 1. Bilinear resize to target dimensions
    /// 2. Scale to [0, 1], then apply (v - mean) / std per channel
    /// 3. Lay out as NCHW `[1, 3, H, W]` or NHWC `[1, H, W, 3]`
    pub fn preprocess(&self, image: &RgbImage) -> Array4<f32> {
        let _span = tracing::debug_span!("preprocess").entered();

        let resized;
        let source = if image.dimensions() != (self.target_width, self.target_height) {
            resized = imageops::resize(
                image,
                self.target_width,
                self.target_height,
                imageops::FilterType::Triangle,
            );
            &resized
        } else {
            image
        };

        let (width, height) = (self.target_width as usize, self.target_height as usize);
        let mut tensor = match self.layout {
            TensorLayout::Nchw => Array4::<f32>::zeros((1, 3, height, width)),
            TensorLayout::Nhwc => Array4::<f32>::zeros((1, height, width, 3)),
        };

        let Normalization { mean, std } = self.normalization;
        for (x, y, pixel) in source.enumerate_pixels() {
            let (x, y) = (x as usize, y as usize);
            for c in 0..3 {
                let value = (pixel[c] as f32 / 255.0 - mean[c]) / std[c];
                match self.layout {
                    TensorLayout::Nchw => tensor[[0, c, y, x]] = value,
                    TensorLayout::Nhwc => tensor[[0, y, x, c]] = value,
                }
            }
        }

        tensor
    }
}
