use crate::error::{PipelineError, Result};
use image::{imageops, Rgb, RgbImage};

/// Capture devices report this size (or smaller) while they are not
/// actually delivering video.
pub const MIN_VALID_DIMENSION: u32 = 16;

/// Pixel layout of raw capture bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Rgb,
    Rgba,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Rgb => 3,
            PixelFormat::Rgba => 4,
        }
    }
}

/// Row order of raw capture bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Origin {
    #[default]
    TopLeft,
    /// Rows stored bottom-up (vertically mirrored capture).
    BottomLeft,
}

/// One RGB image with a top-left origin.
///
/// Orientation and pixel format are normalized at ingestion, so every frame
/// past the capture boundary has the same layout.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    image: RgbImage,
    sequence: u64,
}

impl Frame {
    pub fn new(image: RgbImage) -> Self {
        Self { image, sequence: 0 }
    }

    /// Ingest raw capture bytes, correcting orientation and dropping alpha.
    pub fn from_raw(
        width: u32,
        height: u32,
        format: PixelFormat,
        origin: Origin,
        data: &[u8],
    ) -> Result<Self> {
        let expected = width as usize * height as usize * format.bytes_per_pixel();
        if data.len() != expected {
            return Err(PipelineError::InvalidFrame(format!(
                "{}x{} {:?} needs {} bytes, got {}",
                width,
                height,
                format,
                expected,
                data.len()
            )));
        }

        let image = match format {
            PixelFormat::Rgb => RgbImage::from_raw(width, height, data.to_vec()),
            PixelFormat::Rgba => RgbImage::from_raw(
                width,
                height,
                data.chunks_exact(4)
                    .flat_map(|px| [px[0], px[1], px[2]])
                    .collect(),
            ),
        }
        .ok_or_else(|| PipelineError::InvalidFrame("buffer rejected".to_string()))?;

        Ok(Self::from_image(image, origin))
    }

    /// Wrap a decoded image, flipping it if its rows are bottom-up.
    pub fn from_image(image: RgbImage, origin: Origin) -> Self {
        let image = match origin {
            Origin::TopLeft => image,
            Origin::BottomLeft => imageops::flip_vertical(&image),
        };
        Self::new(image)
    }

    /// Single-color frame.
    pub fn solid(width: u32, height: u32, color: [u8; 3]) -> Self {
        Self::new(RgbImage::from_pixel(width, height, Rgb(color)))
    }

    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }

    /// Capture order assigned at ingestion; 0 for synthesized frames.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    pub fn into_image(self) -> RgbImage {
        self.image
    }

    /// False for the placeholder frames devices emit while not streaming.
    pub fn has_valid_dimensions(&self) -> bool {
        self.width() > MIN_VALID_DIMENSION && self.height() > MIN_VALID_DIMENSION
    }

    /// Bilinear resize; returns a copy when the size already matches.
    pub fn resized(&self, width: u32, height: u32) -> Frame {
        if self.dimensions() == (width, height) {
            return self.clone();
        }
        let image = imageops::resize(&self.image, width, height, imageops::FilterType::Triangle);
        Frame {
            image,
            sequence: self.sequence,
        }
    }
}
