use super::OutputSink;
use crate::frame::Frame;
use anyhow::{Context, Result};
use image::RgbImage;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use v4l::video::Output;
use v4l::{Device, Format, FourCC};

/// Writes YUYV frames to a v4l2loopback device.
pub struct V4L2Output {
    file: File,
    // Held open so the negotiated format stays in place
    _device: Device,
    width: u32,
    height: u32,
}

impl V4L2Output {
    pub fn new<P: AsRef<Path>>(device_path: P, width: u32, height: u32) -> Result<Self> {
        let path = device_path.as_ref();
        tracing::info!(
            "Opening v4l2loopback device at {} ({}x{})",
            path.display(),
            width,
            height
        );

        let device = Device::with_path(path)
            .with_context(|| format!("Failed to open v4l2 device at {}", path.display()))?;

        let requested = Format::new(width, height, FourCC::new(b"YUYV"));
        let actual = Output::set_format(&device, &requested)
            .context("Failed to set YUYV output format")?;
        if (actual.width, actual.height) != (width, height) {
            tracing::warn!(
                "Loopback device accepted {}x{} instead of {}x{}",
                actual.width,
                actual.height,
                width,
                height
            );
        }

        // v4l2loopback accepts raw frame data written to the device file
        let file = File::options()
            .write(true)
            .open(path)
            .with_context(|| format!("Failed to open v4l2loopback device at {}", path.display()))?;

        tracing::info!("v4l2loopback device opened successfully");

        Ok(Self {
            file,
            _device: device,
            width,
            height,
        })
    }
}

/// Pack an RGB image as YUYV 4:2:2, averaging chroma over each pixel pair.
///
/// An odd last column is paired with itself.
pub(crate) fn rgb_to_yuyv(rgb_image: &RgbImage) -> Vec<u8> {
    let (width, height) = rgb_image.dimensions();
    let mut yuyv = Vec::with_capacity((width.div_ceil(2) * 4 * height) as usize);
    if width == 0 {
        return yuyv;
    }

    for row in rgb_image.as_raw().chunks_exact(width as usize * 3) {
        for pair in row.chunks(6) {
            let (y0, u0, v0) = rgb_to_yuv(pair[0], pair[1], pair[2]);
            let (y1, u1, v1) = match pair {
                [_, _, _, r, g, b] => rgb_to_yuv(*r, *g, *b),
                _ => (y0, u0, v0),
            };
            let u = ((u0 as u16 + u1 as u16) / 2) as u8;
            let v = ((v0 as u16 + v1 as u16) / 2) as u8;
            yuyv.extend_from_slice(&[y0, u, y1, v]);
        }
    }

    yuyv
}

/// BT.601 RGB to YUV, rounded
fn rgb_to_yuv(r: u8, g: u8, b: u8) -> (u8, u8, u8) {
    let r = r as f32;
    let g = g as f32;
    let b = b as f32;

    let y = (0.299 * r + 0.587 * g + 0.114 * b).round().clamp(0.0, 255.0) as u8;
    let u = ((-0.147 * r - 0.289 * g + 0.436 * b) + 128.0)
        .round()
        .clamp(0.0, 255.0) as u8;
    let v = ((0.615 * r - 0.515 * g - 0.100 * b) + 128.0)
        .round()
        .clamp(0.0, 255.0) as u8;

    (y, u, v)
}

impl OutputSink for V4L2Output {
    fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        // Composites are rendered at output size; anything else is scaled
        let yuyv_data = if frame.dimensions() == (self.width, self.height) {
            rgb_to_yuyv(frame.image())
        } else {
            rgb_to_yuyv(frame.resized(self.width, self.height).image())
        };

        self.file
            .write_all(&yuyv_data)
            .context("Failed to write frame to v4l2loopback device")?;

        Ok(())
    }

    fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}
