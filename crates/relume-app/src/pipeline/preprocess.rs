//! Admission-side image preprocessing.
//!
//! Inline uploads are sniffed by magic bytes, auto-oriented, bounded to
//! 2048 px on the longest side, and re-encoded as JPEG. Re-encoding drops
//! every metadata segment; pixels are carried in sRGB.

use std::io::Cursor;

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::metadata::Orientation;
use image::{DynamicImage, GenericImageView, ImageDecoder, ImageReader};
use thiserror::Error;

pub const MAX_INLINE_IMAGE_BYTES: usize = 10 * 1024 * 1024;
pub const MAX_EDGE_PX: u32 = 2_048;
pub const JPEG_QUALITY: u8 = 85;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SniffedFormat {
    Jpeg,
    Png,
    Webp,
}

impl SniffedFormat {
    pub fn slug(self) -> &'static str {
        match self {
            SniffedFormat::Jpeg => "jpeg",
            SniffedFormat::Png => "png",
            SniffedFormat::Webp => "webp",
        }
    }
}

/// Identify the container by magic bytes; the declared content type is never
/// trusted.
pub fn sniff_format(bytes: &[u8]) -> Option<SniffedFormat> {
    if bytes.len() >= 3 && bytes[..3] == [0xFF, 0xD8, 0xFF] {
        return Some(SniffedFormat::Jpeg);
    }
    if bytes.len() >= 8 && bytes[..8] == [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A] {
        return Some(SniffedFormat::Png);
    }
    if bytes.len() >= 12 && &bytes[..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        return Some(SniffedFormat::Webp);
    }
    None
}

/// Immutable output of preprocessing, fed onward to moderation and storage.
#[derive(Debug, Clone)]
pub struct PreparedImage {
    pub bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub source_format: SniffedFormat,
    /// Applied operation list, recorded on the job record.
    pub operations: Vec<String>,
}

#[derive(Debug, Error)]
pub enum PreprocessError {
    #[error("unrecognized image format")]
    UnsupportedFormat,
    #[error("failed to decode image: {0}")]
    Decode(#[source] image::ImageError),
    #[error("failed to re-encode image: {0}")]
    Encode(#[source] image::ImageError),
    #[error("failed to read image data: {0}")]
    Io(#[from] std::io::Error),
}

pub fn prepare_image(bytes: &[u8]) -> Result<PreparedImage, PreprocessError> {
    let source_format = sniff_format(bytes).ok_or(PreprocessError::UnsupportedFormat)?;
    let mut operations = Vec::new();

    let mut decoder = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()?
        .into_decoder()
        .map_err(PreprocessError::Decode)?;
    let orientation = decoder
        .orientation()
        .unwrap_or(Orientation::NoTransforms);
    let mut image = DynamicImage::from_decoder(decoder).map_err(PreprocessError::Decode)?;

    if orientation != Orientation::NoTransforms {
        image.apply_orientation(orientation);
        operations.push("auto-orient".to_string());
    }

    let (width, height) = image.dimensions();
    if width.max(height) > MAX_EDGE_PX {
        image = image.resize(MAX_EDGE_PX, MAX_EDGE_PX, FilterType::CatmullRom);
        let (w, h) = image.dimensions();
        operations.push(format!("resize:{w}x{h}"));
    }

    let rgb = DynamicImage::ImageRgb8(image.to_rgb8());
    let (width, height) = rgb.dimensions();

    let mut encoded = Vec::new();
    let encoder = JpegEncoder::new_with_quality(&mut encoded, JPEG_QUALITY);
    rgb.write_with_encoder(encoder)
        .map_err(PreprocessError::Encode)?;
    operations.push(format!("reencode:jpeg-q{JPEG_QUALITY}"));
    operations.push("strip-metadata".to_string());
    operations.push("srgb-colorspace".to_string());

    Ok(PreparedImage {
        bytes: encoded,
        width,
        height,
        source_format,
        operations,
    })
}
