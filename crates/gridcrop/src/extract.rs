//! Region extraction: crop a decoded buffer and encode the result.
//!
//! The crop is always copied into a fresh buffer. Results leave the worker as
//! encoded bytes, so nothing may borrow from the source image.

use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::{ColorType, DynamicImage, ImageEncoder, RgbaImage, imageops};

use crate::geometry::{Paddings, PixelRect, Rectangle, clip, pad};

/// Decoded image as held by the worker.
pub type PixelBuffer = RgbaImage;

#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("failed to decode image: {0}")]
    Decode(#[source] image::ImageError),
    #[error("failed to encode region: {0}")]
    Encode(#[source] image::ImageError),
}

/// Encoding used for extracted boxes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputFormat {
    /// Lossless; the default.
    #[default]
    Png,
    Jpeg { quality: u8 },
}

impl OutputFormat {
    /// Parses `png` or `jpeg`/`jpg` (case-insensitive).
    pub fn parse(name: &str, jpeg_quality: u8) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "png" => Some(Self::Png),
            "jpeg" | "jpg" => Some(Self::Jpeg {
                quality: jpeg_quality.clamp(1, 100),
            }),
            _ => None,
        }
    }
}

/// Decode/encode capability used by the worker store.
pub trait ImageCodec: Send + Sync {
    fn decode(&self, bytes: &[u8]) -> Result<PixelBuffer, ExtractError>;

    fn encode(&self, buffer: &PixelBuffer) -> Result<Vec<u8>, ExtractError>;
}

/// [`ImageCodec`] backed by the `image` crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageCrateCodec {
    format: OutputFormat,
}

impl ImageCrateCodec {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    pub fn format(&self) -> OutputFormat {
        self.format
    }
}

impl ImageCodec for ImageCrateCodec {
    fn decode(&self, bytes: &[u8]) -> Result<PixelBuffer, ExtractError> {
        let image = image::load_from_memory(bytes).map_err(ExtractError::Decode)?;
        Ok(image.into_rgba8())
    }

    fn encode(&self, buffer: &PixelBuffer) -> Result<Vec<u8>, ExtractError> {
        let mut out = Vec::new();
        match self.format {
            OutputFormat::Png => PngEncoder::new(&mut out).write_image(
                buffer.as_raw(),
                buffer.width(),
                buffer.height(),
                ColorType::Rgba8,
            ),
            OutputFormat::Jpeg { quality } => {
                // JPEG has no alpha channel.
                let rgb = DynamicImage::ImageRgba8(buffer.clone()).into_rgb8();
                JpegEncoder::new_with_quality(&mut out, quality).write_image(
                    rgb.as_raw(),
                    rgb.width(),
                    rgb.height(),
                    ColorType::Rgb8,
                )
            }
        }
        .map_err(ExtractError::Encode)?;
        tracing::trace!(
            width = buffer.width(),
            height = buffer.height(),
            encoded_bytes = out.len(),
            "Encoded region"
        );
        Ok(out)
    }
}

/// Copies `rect` out of `buffer`. `rect` must already be clipped to the buffer.
///
/// Returns `None` for an empty region.
pub fn crop(buffer: &PixelBuffer, rect: PixelRect) -> Option<PixelBuffer> {
    if rect.is_empty() {
        return None;
    }
    let x = u32::try_from(rect.x).ok()?;
    let y = u32::try_from(rect.y).ok()?;
    let width = u32::try_from(rect.width).ok()?;
    let height = u32::try_from(rect.height).ok()?;
    Some(imageops::crop_imm(buffer, x, y, width, height).to_image())
}

/// Pads, clips, crops and encodes one box.
///
/// `None` when the clipped region is empty or encoding fails.
pub fn extract_region(
    buffer: &PixelBuffer,
    rect: &Rectangle,
    pads: &Paddings,
    codec: &dyn ImageCodec,
) -> Option<Vec<u8>> {
    let padded = pad(rect, pads);
    let clipped = clip(padded, buffer.width(), buffer.height());
    tracing::trace!(?padded, ?clipped, "Region of interest");
    let Some(region) = crop(buffer, clipped) else {
        tracing::debug!(?clipped, "Empty region after clipping");
        return None;
    };
    match codec.encode(&region) {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to encode region");
            None
        }
    }
}
