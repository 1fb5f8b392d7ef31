//! Texture re-encoding and thumbnails.
//!
//! Decoding, resampling and encoding are CPU-bound and run on the blocking
//! pool when called through the async wrappers.

use std::time::Instant;

use bytes::Bytes;
use image::codecs::avif::AvifEncoder;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType as PngFilter, PngEncoder};
use image::codecs::webp::WebPEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ExtendedColorType, ImageEncoder};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use tracing::debug;

use crate::error::PipelineError;
use crate::optimize::size_ratio;

/// Sizes textures are snapped to.
pub const POWER_OF_TWO_LADDER: [u32; 7] = [64, 128, 256, 512, 1024, 2048, 4096];

const THUMBNAIL_QUALITY: u8 = 80;
const AVIF_SPEED: u8 = 8;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum TextureCodec {
    /// Lossless WebP; `quality` is ignored.
    Webp,
    Jpeg,
    Avif,
    /// Lossless PNG at best compression; `quality` is ignored.
    Png,
}

impl TextureCodec {
    pub fn extension(self) -> &'static str {
        match self {
            TextureCodec::Webp => "webp",
            TextureCodec::Jpeg => "jpg",
            TextureCodec::Avif => "avif",
            TextureCodec::Png => "png",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TextureOptions {
    pub max_dimension: u32,
    pub codec: TextureCodec,
    /// 1..=100, used by lossy codecs.
    pub quality: u8,
}

impl Default for TextureOptions {
    fn default() -> Self {
        Self {
            max_dimension: 2048,
            codec: TextureCodec::Webp,
            quality: 85,
        }
    }
}

impl TextureOptions {
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.max_dimension < POWER_OF_TWO_LADDER[0] {
            return Err(PipelineError::InvalidOptions(format!(
                "max dimension {} is below {}",
                self.max_dimension, POWER_OF_TWO_LADDER[0]
            )));
        }
        if !(1..=100).contains(&self.quality) {
            return Err(PipelineError::InvalidOptions(format!(
                "quality {} is outside 1..=100",
                self.quality
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TextureResult {
    #[serde(skip)]
    pub output: Bytes,
    pub codec: TextureCodec,
    pub width: u32,
    pub height: u32,
    pub original_width: u32,
    pub original_height: u32,
    pub original_size: u64,
    pub encoded_size: u64,
    /// `encoded_size / original_size`.
    pub compression_ratio: f64,
    pub elapsed_ms: u64,
}

/// Nearest ladder entry; ties resolve to the smaller size.
pub fn nearest_power_of_two(value: u32) -> u32 {
    POWER_OF_TWO_LADDER
        .iter()
        .copied()
        .min_by_key(|p| p.abs_diff(value))
        .unwrap_or(POWER_OF_TWO_LADDER[0])
}

/// Largest ladder entry not above `max_dimension`.
fn ladder_cap(max_dimension: u32) -> u32 {
    POWER_OF_TWO_LADDER
        .iter()
        .copied()
        .filter(|p| *p <= max_dimension)
        .max()
        .unwrap_or(POWER_OF_TWO_LADDER[0])
}

/// Fit within `max_dimension` keeping aspect ratio, then snap each side.
pub fn target_dimensions(width: u32, height: u32, max_dimension: u32) -> (u32, u32) {
    let longest = width.max(height).max(1);
    let scale = if longest > max_dimension {
        max_dimension as f64 / longest as f64
    } else {
        1.0
    };
    let cap = ladder_cap(max_dimension);
    let snap = |side: u32| {
        let scaled = ((side as f64) * scale).round().max(1.0) as u32;
        nearest_power_of_two(scaled).min(cap)
    };
    (snap(width), snap(height))
}

fn encode(image: &DynamicImage, codec: TextureCodec, quality: u8) -> Result<Vec<u8>, PipelineError> {
    let (width, height) = (image.width(), image.height());
    let mut buf = Vec::new();
    match codec {
        TextureCodec::Jpeg => {
            let rgb = image.to_rgb8();
            JpegEncoder::new_with_quality(&mut buf, quality).write_image(
                rgb.as_raw(),
                width,
                height,
                ExtendedColorType::Rgb8,
            )?;
        }
        TextureCodec::Webp => {
            let rgba = image.to_rgba8();
            WebPEncoder::new_lossless(&mut buf).write_image(
                rgba.as_raw(),
                width,
                height,
                ExtendedColorType::Rgba8,
            )?;
        }
        TextureCodec::Avif => {
            let rgba = image.to_rgba8();
            AvifEncoder::new_with_speed_quality(&mut buf, AVIF_SPEED, quality).write_image(
                rgba.as_raw(),
                width,
                height,
                ExtendedColorType::Rgba8,
            )?;
        }
        TextureCodec::Png => {
            let rgba = image.to_rgba8();
            PngEncoder::new_with_quality(&mut buf, CompressionType::Best, PngFilter::Adaptive)
                .write_image(rgba.as_raw(), width, height, ExtendedColorType::Rgba8)?;
        }
    }
    Ok(buf)
}

#[derive(Debug, Clone, Default)]
pub struct TextureEncoder {
    options: TextureOptions,
}

impl TextureEncoder {
    pub fn new(options: TextureOptions) -> Result<Self, PipelineError> {
        options.validate()?;
        Ok(Self { options })
    }

    pub fn options(&self) -> &TextureOptions {
        &self.options
    }

    /// Decode, resize to a power-of-two size and re-encode.
    pub fn reencode(&self, input: &[u8]) -> Result<TextureResult, PipelineError> {
        let started = Instant::now();
        let image = image::load_from_memory(input)?;
        let (original_width, original_height) = (image.width(), image.height());
        let (width, height) =
            target_dimensions(original_width, original_height, self.options.max_dimension);

        let resized = if (width, height) == (original_width, original_height) {
            image
        } else {
            image.resize_exact(width, height, FilterType::Lanczos3)
        };
        let encoded = encode(&resized, self.options.codec, self.options.quality)?;

        let original_size = input.len() as u64;
        let encoded_size = encoded.len() as u64;
        debug!(
            codec = %self.options.codec,
            original_width,
            original_height,
            width,
            height,
            encoded_size,
            "texture re-encoded"
        );
        Ok(TextureResult {
            output: Bytes::from(encoded),
            codec: self.options.codec,
            width,
            height,
            original_width,
            original_height,
            original_size,
            encoded_size,
            compression_ratio: size_ratio(original_size, encoded_size),
            elapsed_ms: started.elapsed().as_millis() as u64,
        })
    }

    pub async fn reencode_async(&self, input: Bytes) -> Result<TextureResult, PipelineError> {
        let encoder = self.clone();
        tokio::task::spawn_blocking(move || encoder.reencode(&input))
            .await
            .map_err(|e| PipelineError::Image(format!("texture worker: {e}")))?
    }
}

/// Square, center-cropped JPEG preview of `size` pixels.
pub fn thumbnail(input: &[u8], size: u32) -> Result<Bytes, PipelineError> {
    if size == 0 {
        return Err(PipelineError::InvalidOptions(
            "thumbnail size must be positive".to_owned(),
        ));
    }
    let image = image::load_from_memory(input)?;
    let side = image.width().min(image.height());
    let x = (image.width() - side) / 2;
    let y = (image.height() - side) / 2;
    let square = image
        .crop_imm(x, y, side, side)
        .resize_exact(size, size, FilterType::Lanczos3);
    Ok(Bytes::from(encode(&square, TextureCodec::Jpeg, THUMBNAIL_QUALITY)?))
}

pub async fn thumbnail_async(input: Bytes, size: u32) -> Result<Bytes, PipelineError> {
    tokio::task::spawn_blocking(move || thumbnail(&input, size))
        .await
        .map_err(|e| PipelineError::Image(format!("thumbnail worker: {e}")))?
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use image::{ImageFormat, Rgba, RgbaImage};

    use super::*;

    fn png(width: u32, height: u32) -> Vec<u8> {
        let img = RgbaImage::from_fn(width, height, |x, y| {
            Rgba([(x % 256) as u8, (y % 256) as u8, 128, 255])
        });
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgba8(img)
            .write_to(&mut out, ImageFormat::Png)
            .unwrap();
        out.into_inner()
    }

    #[test]
    fn snapping_picks_nearest_ladder_entry() {
        assert_eq!(nearest_power_of_two(1000), 1024);
        assert_eq!(nearest_power_of_two(700), 512);
        assert_eq!(nearest_power_of_two(10), 64);
        assert_eq!(nearest_power_of_two(9000), 4096);
        assert_eq!(nearest_power_of_two(192), 128);
    }

    #[test]
    fn dimensions_fit_cap_and_keep_aspect() {
        assert_eq!(target_dimensions(4000, 2000, 2048), (2048, 1024));
        assert_eq!(target_dimensions(300, 300, 2048), (256, 256));
        assert_eq!(target_dimensions(1600, 1600, 1500), (1024, 1024));
    }

    #[test]
    fn reencode_resizes_to_power_of_two_jpeg() {
        let encoder = TextureEncoder::new(TextureOptions {
            max_dimension: 256,
            codec: TextureCodec::Jpeg,
            quality: 80,
        })
        .unwrap();
        let input = png(600, 300);
        let result = encoder.reencode(&input).unwrap();
        assert_eq!((result.original_width, result.original_height), (600, 300));
        assert_eq!((result.width, result.height), (256, 128));
        assert_eq!(
            image::guess_format(&result.output).unwrap(),
            ImageFormat::Jpeg
        );
        assert_eq!(result.original_size, input.len() as u64);
    }

    #[tokio::test]
    async fn webp_reencode_runs_on_blocking_pool() {
        let encoder = TextureEncoder::default();
        let result = encoder
            .reencode_async(Bytes::from(png(128, 128)))
            .await
            .unwrap();
        assert_eq!((result.width, result.height), (128, 128));
        assert_eq!(
            image::guess_format(&result.output).unwrap(),
            ImageFormat::WebP
        );
    }

    #[test]
    fn invalid_quality_is_rejected() {
        let err = TextureEncoder::new(TextureOptions {
            quality: 0,
            ..TextureOptions::default()
        })
        .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidOptions(_)));
    }

    #[test]
    fn garbage_input_is_image_error() {
        let err = TextureEncoder::default().reencode(b"not an image").unwrap_err();
        assert!(matches!(err, PipelineError::Image(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn thumbnail_is_square() {
        let thumb = thumbnail(&png(400, 200), 64).unwrap();
        let decoded = image::load_from_memory(&thumb).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (64, 64));
    }
}
