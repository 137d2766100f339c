use crate::config::{validate_threshold, BlendPolicy};
use crate::error::{PipelineError, Result};
use crate::frame::Frame;
use crate::mask::Mask;
use crate::postprocess::{self, foreground_alpha, MaskPostProcessor};
use image::{Rgb, RgbImage};
use std::sync::Arc;

/// Per-render inputs other than the camera frame and mask.
#[derive(Debug, Clone)]
pub struct CompositeParameters {
    pub background: Frame,
    pub threshold: f32,
    pub blend: BlendPolicy,
}

/// Blend `camera` over `background` wherever `mask` passes the threshold.
///
/// Pure and deterministic. The background and mask are resampled to the
/// camera size when they differ from it.
pub fn composite(
    camera: &Frame,
    background: &Frame,
    mask: &Mask,
    threshold: f32,
    policy: BlendPolicy,
) -> Frame {
    let (width, height) = camera.dimensions();
    let background = background.resized(width, height);
    let mask = postprocess::resample(mask, width, height);

    let mut out = RgbImage::new(width, height);
    blend_into(
        &mut out,
        camera.image(),
        background.image(),
        &mask,
        threshold,
        policy,
    );
    Frame::new(out).with_sequence(camera.sequence())
}

/// All four buffers must share the same dimensions.
fn blend_into(
    out: &mut RgbImage,
    camera: &RgbImage,
    background: &RgbImage,
    mask: &Mask,
    threshold: f32,
    policy: BlendPolicy,
) {
    let values = mask.values();
    let pixels = out
        .pixels_mut()
        .zip(camera.pixels())
        .zip(background.pixels())
        .zip(values.iter());

    for (((dst, cam), bg), &value) in pixels {
        let alpha = foreground_alpha(value, threshold, policy);
        *dst = if alpha <= 0.0 {
            *bg
        } else if alpha >= 1.0 {
            *cam
        } else {
            Rgb([
                lerp(bg[0], cam[0], alpha),
                lerp(bg[1], cam[1], alpha),
                lerp(bg[2], cam[2], alpha),
            ])
        };
    }
}

#[inline]
fn lerp(from: u8, to: u8, t: f32) -> u8 {
    (from as f32 + (to as f32 - from as f32) * t)
        .round()
        .clamp(0.0, 255.0) as u8
}

/// Render-side state: the output surface and its scaled background.
struct RenderSurface {
    frame: Frame,
    background: Frame,
    /// Whether `frame` currently holds a finished composite.
    composed: bool,
}

/// Owns the render surface and compositing parameters.
///
/// The surface is acquired in [`Compositor::initialize`] and dropped in
/// [`Compositor::release`]; rendering after release fails with
/// `InvalidState` instead of touching freed state.
pub struct Compositor {
    surface: Option<RenderSurface>,
    postprocessor: MaskPostProcessor,
    /// Last model mask and its surface-sized version.
    prepared: Option<(Arc<Mask>, Arc<Mask>)>,
    preparations: u64,
    threshold: f32,
    blend: BlendPolicy,
}

impl Compositor {
    pub fn initialize(
        width: u32,
        height: u32,
        params: CompositeParameters,
        smooth_sigma: Option<f32>,
    ) -> Result<Self> {
        let threshold = validate_threshold(params.threshold)?;
        if width == 0 || height == 0 {
            return Err(PipelineError::InvalidConfig(format!(
                "render surface {}x{}",
                width, height
            )));
        }

        tracing::debug!("Allocating {}x{} render surface", width, height);
        let background = params.background.resized(width, height);
        let surface = RenderSurface {
            frame: background.clone(),
            background,
            composed: false,
        };

        Ok(Self {
            surface: Some(surface),
            postprocessor: MaskPostProcessor::new(width, height).with_smoothing(smooth_sigma),
            prepared: None,
            preparations: 0,
            threshold,
            blend: params.blend,
        })
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn set_threshold(&mut self, threshold: f32) -> Result<()> {
        self.threshold = validate_threshold(threshold)?;
        Ok(())
    }

    pub fn set_background(&mut self, background: &Frame) -> Result<()> {
        let surface = self.surface_mut("set_background")?;
        let (width, height) = surface.frame.dimensions();
        surface.background = background.resized(width, height);
        Ok(())
    }

    pub fn size(&self) -> (u32, u32) {
        self.postprocessor.target_size()
    }

    pub fn is_released(&self) -> bool {
        self.surface.is_none()
    }

    /// Compose one frame onto the surface using whatever mask is current.
    ///
    /// The mask is resampled once per distinct `Arc`; rendering the same
    /// mask again reuses the prepared copy.
    pub fn render(&mut self, camera: &Frame, mask: &Arc<Mask>) -> Result<&Frame> {
        let _span = tracing::debug_span!("composite").entered();
        let (width, height) = self.size();
        let mask = self.prepare(mask);
        let camera = camera.resized(width, height);
        let (threshold, blend) = (self.threshold, self.blend);

        let surface = self.surface_mut("render")?;
        let mut out = std::mem::replace(&mut surface.frame, Frame::new(RgbImage::new(0, 0)))
            .into_image();
        blend_into(
            &mut out,
            camera.image(),
            surface.background.image(),
            &mask,
            threshold,
            blend,
        );
        surface.frame = Frame::new(out).with_sequence(camera.sequence());
        surface.composed = true;
        Ok(&surface.frame)
    }

    /// Show the processed (unthresholded) mask instead of the composite.
    pub fn render_matte(&mut self, mask: &Arc<Mask>) -> Result<&Frame> {
        let matte = postprocess::mask_to_frame(&self.prepare(mask));
        let surface = self.surface_mut("render_matte")?;
        surface.frame = matte;
        surface.composed = true;
        Ok(&surface.frame)
    }

    /// Background only, for when no camera frame has arrived yet.
    pub fn render_background(&mut self) -> Result<&Frame> {
        let surface = self.surface_mut("render_background")?;
        surface.frame = surface.background.clone();
        surface.composed = false;
        Ok(&surface.frame)
    }

    /// Re-emit the last composite, or the background if there is none.
    pub fn render_frozen(&mut self) -> Result<&Frame> {
        let surface = self.surface_mut("render_frozen")?;
        if !surface.composed {
            surface.frame = surface.background.clone();
        }
        Ok(&surface.frame)
    }

    /// Most recent finished composite, if any.
    pub fn last_frame(&self) -> Option<&Frame> {
        self.surface
            .as_ref()
            .filter(|s| s.composed)
            .map(|s| &s.frame)
    }

    /// Drop the render surface. Safe to call repeatedly.
    pub fn release(&mut self) {
        self.prepared = None;
        if self.surface.take().is_some() {
            tracing::debug!("Render surface released");
        }
    }

    fn prepare(&mut self, mask: &Arc<Mask>) -> Arc<Mask> {
        if let Some((source, prepared)) = &self.prepared {
            if Arc::ptr_eq(source, mask) {
                return Arc::clone(prepared);
            }
        }
        let prepared = Arc::new(self.postprocessor.prepare(mask));
        self.prepared = Some((Arc::clone(mask), Arc::clone(&prepared)));
        self.preparations += 1;
        prepared
    }

    fn surface_mut(&mut self, operation: &'static str) -> Result<&mut RenderSurface> {
        self.surface.as_mut().ok_or(PipelineError::InvalidState {
            operation,
            state: "released",
        })
    }
}
