// SPDX-License-Identifier: GPL-3.0-only

//! Photo encoding
//!
//! This module handles encoding decoded frames to image files:
//! - JPEG (with quality control)
//! - PNG (lossless)

use super::processing::CapturedImage;
use crate::constants::QualityPreset;
use crate::errors::FrameError;
use crate::storage;
use image::RgbImage;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Supported encoding formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodingFormat {
    /// JPEG format (lossy compression)
    Jpeg,
    /// PNG format (lossless compression)
    Png,
}

impl EncodingFormat {
    /// Get file extension for this format
    pub fn extension(&self) -> &'static str {
        match self {
            EncodingFormat::Jpeg => "jpg",
            EncodingFormat::Png => "png",
        }
    }
}

impl From<crate::config::PhotoOutputFormat> for EncodingFormat {
    fn from(format: crate::config::PhotoOutputFormat) -> Self {
        match format {
            crate::config::PhotoOutputFormat::Jpeg => EncodingFormat::Jpeg,
            crate::config::PhotoOutputFormat::Png => EncodingFormat::Png,
        }
    }
}

/// Encoded image data ready for saving
pub struct EncodedImage {
    pub data: Vec<u8>,
    pub format: EncodingFormat,
    pub width: u32,
    pub height: u32,
}

/// Photo encoder
#[derive(Debug, Clone)]
pub struct PhotoEncoder {
    format: EncodingFormat,
    quality: QualityPreset,
}

impl PhotoEncoder {
    /// Create a new encoder with JPEG format and high quality
    pub fn new() -> Self {
        Self {
            format: EncodingFormat::Jpeg,
            quality: QualityPreset::High,
        }
    }

    /// Set encoding format
    pub fn set_format(&mut self, format: EncodingFormat) {
        self.format = format;
    }

    /// Set encoding quality (only affects JPEG)
    pub fn set_quality(&mut self, quality: QualityPreset) {
        self.quality = quality;
    }

    pub fn format(&self) -> EncodingFormat {
        self.format
    }

    /// Encode a decoded frame
    pub fn encode(&self, captured: &CapturedImage) -> Result<EncodedImage, FrameError> {
        let data = match self.format {
            EncodingFormat::Jpeg => Self::encode_jpeg(&captured.image, self.quality)?,
            EncodingFormat::Png => Self::encode_png(&captured.image)?,
        };

        debug!(size = data.len(), format = ?self.format, "Encoding complete");

        Ok(EncodedImage {
            data,
            format: self.format,
            width: captured.width(),
            height: captured.height(),
        })
    }

    /// Save encoded image to `path`
    ///
    /// The file appears complete or not at all.
    pub fn save(&self, encoded: &EncodedImage, path: &Path) -> Result<PathBuf, FrameError> {
        storage::write_atomic(path, &encoded.data)
            .map_err(|e| FrameError::WriteFailed(format!("{}: {}", path.display(), e)))?;

        info!(
            path = %path.display(),
            width = encoded.width,
            height = encoded.height,
            "Photo saved successfully"
        );
        Ok(path.to_path_buf())
    }

    /// Encode image as JPEG
    fn encode_jpeg(image: &RgbImage, quality: QualityPreset) -> Result<Vec<u8>, FrameError> {
        let mut buffer = Vec::new();
        let mut cursor = std::io::Cursor::new(&mut buffer);

        // Create JPEG encoder with quality setting
        let mut encoder =
            image::codecs::jpeg::JpegEncoder::new_with_quality(&mut cursor, quality.jpeg_quality());

        encoder
            .encode(
                image.as_raw(),
                image.width(),
                image.height(),
                image::ExtendedColorType::Rgb8,
            )
            .map_err(|e| FrameError::EncodeFailed(format!("JPEG encoding failed: {}", e)))?;

        Ok(buffer)
    }

    /// Encode image as PNG
    fn encode_png(image: &RgbImage) -> Result<Vec<u8>, FrameError> {
        let mut buffer = Vec::new();

        image
            .write_to(
                &mut std::io::Cursor::new(&mut buffer),
                image::ImageFormat::Png,
            )
            .map_err(|e| FrameError::EncodeFailed(format!("PNG encoding failed: {}", e)))?;

        Ok(buffer)
    }
}

impl Default for PhotoEncoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::camera::types::PixelFormat;

    fn captured(width: u32, height: u32) -> CapturedImage {
        CapturedImage {
            image: RgbImage::from_pixel(width, height, image::Rgb([200, 100, 50])),
            source_format: PixelFormat::RGB888,
            sequence: 0,
        }
    }

    #[test]
    fn test_format_extensions() {
        assert_eq!(EncodingFormat::Jpeg.extension(), "jpg");
        assert_eq!(EncodingFormat::Png.extension(), "png");
    }

    #[test]
    fn test_jpeg_output_has_soi_marker() {
        let encoded = PhotoEncoder::new().encode(&captured(32, 16)).unwrap();
        assert_eq!(&encoded.data[..2], &[0xFF, 0xD8]);
        assert_eq!((encoded.width, encoded.height), (32, 16));
    }

    #[test]
    fn test_png_decodes_to_same_size() {
        let mut encoder = PhotoEncoder::new();
        encoder.set_format(EncodingFormat::Png);
        let encoded = encoder.encode(&captured(7, 5)).unwrap();
        let decoded = image::load_from_memory(&encoded.data).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (7, 5));
    }

    #[test]
    fn test_lower_quality_is_smaller() {
        let image = CapturedImage {
            image: RgbImage::from_fn(64, 64, |x, y| image::Rgb([(x * 4) as u8, (y * 4) as u8, 0])),
            source_format: PixelFormat::RGB888,
            sequence: 0,
        };
        let mut encoder = PhotoEncoder::new();
        encoder.set_quality(QualityPreset::Low);
        let low = encoder.encode(&image).unwrap();
        encoder.set_quality(QualityPreset::Maximum);
        let max = encoder.encode(&image).unwrap();
        assert!(low.data.len() < max.data.len());
    }
}
