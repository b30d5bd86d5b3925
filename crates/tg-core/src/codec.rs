//! Payload Codec: raw response bytes to a canonical [`PixelBuffer`].
//!
//! The format is always sniffed from the content signature. The declared
//! [`PayloadKind`] only tells the codec whether a textual payload may need
//! base64 unwrapping first.

use std::io::{Cursor, ErrorKind};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use image::{DynamicImage, ImageBuffer, ImageError, ImageFormat, ImageReader, RgbaImage};
use serde::{Deserialize, Serialize};

use crate::error::DecodeError;

const PNG_SIGNATURE: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
const JPEG_SIGNATURE: &[u8] = &[0xFF, 0xD8, 0xFF];
const JPEG_EOI: [u8; 2] = [0xFF, 0xD9];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PayloadKind {
    BinaryImage,
    Base64Image,
}

/// Response body as handed from transport to the codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPayload {
    pub bytes: Bytes,
    pub kind: PayloadKind,
}

impl RawPayload {
    pub fn binary(bytes: impl Into<Bytes>) -> Self {
        Self {
            bytes: bytes.into(),
            kind: PayloadKind::BinaryImage,
        }
    }

    pub fn base64(text: impl Into<Bytes>) -> Self {
        Self {
            bytes: text.into(),
            kind: PayloadKind::Base64Image,
        }
    }
}

/// Raster formats the codec understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceFormat {
    Png,
    Jpeg,
    WebP,
}

impl SourceFormat {
    fn image_format(self) -> ImageFormat {
        match self {
            Self::Png => ImageFormat::Png,
            Self::Jpeg => ImageFormat::Jpeg,
            Self::WebP => ImageFormat::WebP,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Png => "png",
            Self::Jpeg => "jpeg",
            Self::WebP => "webp",
        }
    }
}

enum Sniffed {
    Format(SourceFormat),
    /// A signature prefix matched but the payload ends before it completes
    Partial,
    Unknown,
}

fn sniff(bytes: &[u8]) -> Sniffed {
    if bytes.is_empty() {
        return Sniffed::Partial;
    }
    let riff_webp = |b: &[u8]| b.len() >= 12 && &b[..4] == b"RIFF" && &b[8..12] == b"WEBP";

    if bytes.starts_with(PNG_SIGNATURE) {
        Sniffed::Format(SourceFormat::Png)
    } else if bytes.starts_with(JPEG_SIGNATURE) {
        Sniffed::Format(SourceFormat::Jpeg)
    } else if riff_webp(bytes) {
        Sniffed::Format(SourceFormat::WebP)
    } else if PNG_SIGNATURE.starts_with(bytes)
        || JPEG_SIGNATURE.starts_with(bytes)
        || (bytes.len() < 12 && b"RIFF".starts_with(&bytes[..bytes.len().min(4)]))
    {
        Sniffed::Partial
    } else {
        Sniffed::Unknown
    }
}

/// Canonical decoded raster.
///
/// Samples are interleaved row-major. 16-bit samples are stored little-endian.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelBuffer {
    pub width: u32,
    pub height: u32,
    pub channels: u8,
    pub bit_depth: u8,
    pub data: Vec<u8>,
    pub source_format: Option<SourceFormat>,
}

impl PixelBuffer {
    pub fn bytes_per_pixel(&self) -> usize {
        self.channels as usize * (self.bit_depth as usize / 8)
    }

    /// Raw sample bytes of one pixel.
    pub fn pixel(&self, x: u32, y: u32) -> Option<&[u8]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let bpp = self.bytes_per_pixel();
        let start = (y as usize * self.width as usize + x as usize) * bpp;
        self.data.get(start..start + bpp)
    }

    /// Convert to 8-bit RGBA for consumers that only handle one layout.
    pub fn to_rgba8(&self) -> Option<RgbaImage> {
        let (w, h) = (self.width, self.height);
        let image = match (self.channels, self.bit_depth) {
            (1, 8) => DynamicImage::ImageLuma8(ImageBuffer::from_raw(w, h, self.data.clone())?),
            (2, 8) => DynamicImage::ImageLumaA8(ImageBuffer::from_raw(w, h, self.data.clone())?),
            (3, 8) => DynamicImage::ImageRgb8(ImageBuffer::from_raw(w, h, self.data.clone())?),
            (4, 8) => return ImageBuffer::from_raw(w, h, self.data.clone()),
            (1, 16) => DynamicImage::ImageLuma16(ImageBuffer::from_raw(w, h, self.samples16())?),
            (2, 16) => DynamicImage::ImageLumaA16(ImageBuffer::from_raw(w, h, self.samples16())?),
            (3, 16) => DynamicImage::ImageRgb16(ImageBuffer::from_raw(w, h, self.samples16())?),
            (4, 16) => DynamicImage::ImageRgba16(ImageBuffer::from_raw(w, h, self.samples16())?),
            _ => return None,
        };
        Some(image.to_rgba8())
    }

    fn samples16(&self) -> Vec<u16> {
        self.data
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DecodeLimits {
    /// Largest accepted width or height
    pub max_dimension: u32,
}

impl Default for DecodeLimits {
    fn default() -> Self {
        Self { max_dimension: 8192 }
    }
}

/// Decode a payload. Deterministic: equal bytes yield equal buffers.
pub fn decode(payload: RawPayload, limits: &DecodeLimits) -> Result<PixelBuffer, DecodeError> {
    let RawPayload { bytes, kind } = payload;

    let bytes = match sniff(&bytes) {
        Sniffed::Format(_) => bytes,
        Sniffed::Partial if kind == PayloadKind::BinaryImage || bytes.is_empty() => {
            return Err(DecodeError::Truncated);
        }
        _ if kind == PayloadKind::Base64Image || bytes.starts_with(b"data:") => {
            Bytes::from(unwrap_base64(&bytes)?)
        }
        Sniffed::Partial => return Err(DecodeError::Truncated),
        Sniffed::Unknown => return Err(DecodeError::UnsupportedFormat),
    };

    let format = match sniff(&bytes) {
        Sniffed::Format(format) => format,
        Sniffed::Partial => return Err(DecodeError::Truncated),
        Sniffed::Unknown => return Err(DecodeError::UnsupportedFormat),
    };

    check_complete(format, &bytes)?;

    let (width, height) = ImageReader::with_format(Cursor::new(&bytes[..]), format.image_format())
        .into_dimensions()
        .map_err(map_image_error)?;
    if width == 0 || height == 0 || width > limits.max_dimension || height > limits.max_dimension {
        return Err(DecodeError::DimensionMismatch {
            width,
            height,
            max: limits.max_dimension,
        });
    }

    let image = image::load_from_memory_with_format(&bytes, format.image_format())
        .map_err(map_image_error)?;

    let (channels, bit_depth, data) = match image {
        DynamicImage::ImageLuma8(buf) => (1, 8, buf.into_raw()),
        DynamicImage::ImageLumaA8(buf) => (2, 8, buf.into_raw()),
        DynamicImage::ImageRgb8(buf) => (3, 8, buf.into_raw()),
        DynamicImage::ImageRgba8(buf) => (4, 8, buf.into_raw()),
        DynamicImage::ImageLuma16(buf) => (1, 16, le_bytes(buf.into_raw())),
        DynamicImage::ImageLumaA16(buf) => (2, 16, le_bytes(buf.into_raw())),
        DynamicImage::ImageRgb16(buf) => (3, 16, le_bytes(buf.into_raw())),
        DynamicImage::ImageRgba16(buf) => (4, 16, le_bytes(buf.into_raw())),
        other => (4, 8, other.to_rgba8().into_raw()),
    };

    Ok(PixelBuffer {
        width,
        height,
        channels,
        bit_depth,
        data,
        source_format: Some(format),
    })
}

fn unwrap_base64(text: &[u8]) -> Result<Vec<u8>, DecodeError> {
    let text = std::str::from_utf8(text)
        .map_err(|_| DecodeError::Malformed("base64 payload is not UTF-8".into()))?
        .trim();
    let encoded = match text.strip_prefix("data:") {
        Some(uri) => uri
            .split_once(";base64,")
            .map(|(_, data)| data)
            .ok_or_else(|| DecodeError::Malformed("data URI is not base64 encoded".into()))?,
        None => text,
    };
    let compact: String = encoded.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    BASE64
        .decode(compact)
        .map_err(|e| DecodeError::Malformed(format!("invalid base64: {e}")))
}

/// Container-level completeness check, before any pixel decoding.
fn check_complete(format: SourceFormat, bytes: &[u8]) -> Result<(), DecodeError> {
    match format {
        SourceFormat::Png => {
            let mut offset = PNG_SIGNATURE.len();
            loop {
                let header = bytes.get(offset..offset + 8).ok_or(DecodeError::Truncated)?;
                let length = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
                let end = offset + 8 + length + 4;
                if end > bytes.len() {
                    return Err(DecodeError::Truncated);
                }
                if &header[4..8] == b"IEND" {
                    return Ok(());
                }
                offset = end;
            }
        }
        SourceFormat::Jpeg => {
            if bytes.windows(2).any(|w| w == JPEG_EOI) {
                Ok(())
            } else {
                Err(DecodeError::Truncated)
            }
        }
        SourceFormat::WebP => {
            let declared = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;
            if declared + 8 > bytes.len() {
                Err(DecodeError::Truncated)
            } else {
                Ok(())
            }
        }
    }
}

fn map_image_error(e: ImageError) -> DecodeError {
    match e {
        ImageError::IoError(io) if io.kind() == ErrorKind::UnexpectedEof => DecodeError::Truncated,
        ImageError::Unsupported(_) => DecodeError::UnsupportedFormat,
        other => DecodeError::Malformed(other.to_string()),
    }
}

fn le_bytes(samples: Vec<u16>) -> Vec<u8> {
    samples.into_iter().flat_map(u16::to_le_bytes).collect()
}
