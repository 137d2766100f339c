use crate::config::BlendPolicy;
use crate::frame::Frame;
use crate::mask::{Mask, MaskBuffer};
use image::{imageops, Rgb, RgbImage};

/// Foreground weight of a single mask value.
///
/// Values below `threshold` are always background (0.0). At and above it the
/// hard policy jumps to 1.0 while the smooth policy ramps up over `feather`.
#[inline]
pub fn foreground_alpha(value: f32, threshold: f32, policy: BlendPolicy) -> f32 {
    if value < threshold {
        return 0.0;
    }
    match policy {
        BlendPolicy::Hard => 1.0,
        BlendPolicy::Smooth { feather } => {
            let x = ((value - threshold) / feather).clamp(0.0, 1.0);
            x * x * (3.0 - 2.0 * x)
        }
    }
}

/// Bilinear resample. Returns an identical copy when the size already matches.
pub fn resample(mask: &Mask, target_width: u32, target_height: u32) -> Mask {
    if mask.dimensions() == (target_width, target_height) {
        return mask.clone();
    }
    let resized = imageops::resize(
        mask.buffer(),
        target_width,
        target_height,
        imageops::FilterType::Triangle,
    );
    Mask::from_buffer(resized, mask.source_sequence())
}

/// Gaussian blur to soften stair-stepping from low resolution masks.
pub fn smooth(mask: &Mask, sigma: f32) -> Mask {
    if sigma <= 0.0 {
        return mask.clone();
    }
    let blurred: MaskBuffer = imageops::blur(mask.buffer(), sigma);
    Mask::from_buffer(blurred, mask.source_sequence())
}

/// Map every value to its foreground weight at `threshold`.
pub fn threshold(mask: &Mask, threshold: f32, policy: BlendPolicy) -> Mask {
    let buffer = MaskBuffer::from_fn(mask.width(), mask.height(), |x, y| {
        image::Luma([foreground_alpha(mask.value(x, y), threshold, policy)])
    });
    Mask::from_buffer(buffer, mask.source_sequence())
}

/// Grayscale rendering of a mask for debugging.
pub fn mask_to_frame(mask: &Mask) -> Frame {
    let image = RgbImage::from_fn(mask.width(), mask.height(), |x, y| {
        let value = (mask.value(x, y) * 255.0).round().clamp(0.0, 255.0) as u8;
        Rgb([value, value, value])
    });
    Frame::new(image)
}

/// Adapts raw model masks to the render resolution.
#[derive(Debug, Clone)]
pub struct MaskPostProcessor {
    target_width: u32,
    target_height: u32,
    smooth_sigma: Option<f32>,
}

impl MaskPostProcessor {
    pub fn new(target_width: u32, target_height: u32) -> Self {
        Self {
            target_width,
            target_height,
            smooth_sigma: None,
        }
    }

    pub fn with_smoothing(mut self, sigma: Option<f32>) -> Self {
        self.smooth_sigma = sigma.filter(|s| *s > 0.0);
        self
    }

    pub fn target_size(&self) -> (u32, u32) {
        (self.target_width, self.target_height)
    }

    /// Resample and optionally smooth. Thresholding is left to the caller so
    /// the same processed mask can be shown as a matte or composited.
    pub fn prepare(&self, mask: &Mask) -> Mask {
        let _span = tracing::debug_span!("postprocess").entered();
        let resampled = resample(mask, self.target_width, self.target_height);
        match self.smooth_sigma {
            Some(sigma) => smooth(&resampled, sigma),
            None => resampled,
        }
    }

    /// Resample, smooth and threshold in one step.
    pub fn process(&self, mask: &Mask, t: f32, policy: BlendPolicy) -> Mask {
        threshold(&self.prepare(mask), t, policy)
    }
}
