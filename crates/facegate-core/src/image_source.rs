//! Image intake: payload decoding and detector preprocessing.
//!
//! Payloads arrive as raw image bytes, bare base64, or `data:image/...;base64,`
//! URLs. Every image is downscaled to a fixed bound and re-encoded at reduced
//! JPEG quality before it reaches the detector, so inference cost does not
//! depend on the upload size.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ImageDecoder, ImageFormat, ImageReader, RgbImage};
use std::borrow::Cow;
use std::io::Cursor;
use thiserror::Error;

pub const DEFAULT_MAX_IMAGE_DIM: u32 = 320;
pub const DEFAULT_JPEG_QUALITY: u8 = 80;

#[derive(Error, Debug)]
pub enum ImageDataError {
    #[error("empty image payload")]
    Empty,
    #[error("payload is neither a known image format nor valid base64: {0}")]
    InvalidBase64(#[from] base64::DecodeError),
    #[error("could not decode image: {0}")]
    Decode(#[source] image::ImageError),
    #[error("could not re-encode image: {0}")]
    Encode(#[source] image::ImageError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Resolve an opaque payload to encoded image bytes.
///
/// Raw bytes in a recognised image format pass through untouched. Anything else
/// is treated as base64 text, with an optional data-URL prefix and surrounding
/// whitespace stripped.
pub fn payload_bytes(payload: &[u8]) -> Result<Cow<'_, [u8]>, ImageDataError> {
    if payload.is_empty() {
        return Err(ImageDataError::Empty);
    }
    if image::guess_format(payload).is_ok() {
        return Ok(Cow::Borrowed(payload));
    }

    let text = trim_ascii(payload);
    let body = match text.iter().position(|&b| b == b',') {
        Some(comma) if text.starts_with(b"data:") => &text[comma + 1..],
        _ => text,
    };
    let cleaned: Vec<u8> = body
        .iter()
        .copied()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();
    if cleaned.is_empty() {
        return Err(ImageDataError::Empty);
    }
    Ok(Cow::Owned(STANDARD.decode(cleaned)?))
}

fn trim_ascii(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    &bytes[start..end]
}

/// Image decoding capability injected into the extraction pipeline.
pub trait FrameDecoder: Send + Sync {
    /// Decode encoded image bytes into an upright image.
    fn decode(&self, bytes: &[u8]) -> Result<DynamicImage, ImageDataError>;
}

/// [`FrameDecoder`] backed by the `image` crate, honouring EXIF orientation.
#[derive(Debug, Default, Clone, Copy)]
pub struct ImageCrateDecoder;

impl FrameDecoder for ImageCrateDecoder {
    fn decode(&self, bytes: &[u8]) -> Result<DynamicImage, ImageDataError> {
        let reader = ImageReader::new(Cursor::new(bytes)).with_guessed_format()?;
        let mut decoder = reader.into_decoder().map_err(ImageDataError::Decode)?;
        let orientation = decoder.orientation().map_err(ImageDataError::Decode)?;
        let mut img = DynamicImage::from_decoder(decoder).map_err(ImageDataError::Decode)?;
        img.apply_orientation(orientation);
        Ok(img)
    }
}

/// Bounds applied to every image before detection.
#[derive(Debug, Clone, Copy)]
pub struct PreprocessOptions {
    /// Images are downscaled to fit inside `max_dim × max_dim`.
    pub max_dim: u32,
    pub jpeg_quality: u8,
}

impl Default for PreprocessOptions {
    fn default() -> Self {
        Self {
            max_dim: DEFAULT_MAX_IMAGE_DIM,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
        }
    }
}

/// Decode, bound and re-encode a payload, returning the detector input.
pub fn preprocess(
    decoder: &dyn FrameDecoder,
    payload: &[u8],
    options: &PreprocessOptions,
) -> Result<RgbImage, ImageDataError> {
    let bytes = payload_bytes(payload)?;
    let img = decoder.decode(&bytes)?;
    let (width, height) = (img.width(), img.height());

    // Fit inside the bound without upscaling; aspect ratio is preserved so
    // faces are not squashed.
    let bounded = if width > options.max_dim || height > options.max_dim {
        img.resize(options.max_dim, options.max_dim, FilterType::Triangle)
    } else {
        img
    };
    let rgb = bounded.to_rgb8();

    let mut encoded = Vec::new();
    let encoder = JpegEncoder::new_with_quality(&mut encoded, options.jpeg_quality);
    DynamicImage::ImageRgb8(rgb)
        .write_with_encoder(encoder)
        .map_err(ImageDataError::Encode)?;

    let reduced = image::load_from_memory_with_format(&encoded, ImageFormat::Jpeg)
        .map_err(ImageDataError::Decode)?
        .to_rgb8();

    tracing::debug!(
        input_bytes = payload.len(),
        source_width = width,
        source_height = height,
        width = reduced.width(),
        height = reduced.height(),
        reencoded_bytes = encoded.len(),
        "preprocessed image"
    );

    Ok(reduced)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb};

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img: RgbImage = ImageBuffer::from_fn(width, height, |x, y| {
            Rgb([(x % 256) as u8, (y % 256) as u8, 128])
        });
        let mut out = Vec::new();
        DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
            .unwrap();
        out
    }

    #[test]
    fn test_payload_raw_passthrough() {
        let png = png_bytes(4, 4);
        let bytes = payload_bytes(&png).unwrap();
        assert!(matches!(bytes, Cow::Borrowed(_)));
        assert_eq!(&*bytes, &png[..]);
    }

    #[test]
    fn test_payload_bare_base64() {
        let png = png_bytes(4, 4);
        let encoded = STANDARD.encode(&png);
        assert_eq!(&*payload_bytes(encoded.as_bytes()).unwrap(), &png[..]);
    }

    #[test]
    fn test_payload_data_url_with_whitespace() {
        let png = png_bytes(4, 4);
        let encoded = STANDARD.encode(&png);
        let (head, tail) = encoded.split_at(encoded.len() / 2);
        let url = format!("  data:image/png;base64,{head}\n{tail}\n");
        assert_eq!(&*payload_bytes(url.as_bytes()).unwrap(), &png[..]);
    }

    #[test]
    fn test_payload_rejects_garbage() {
        assert!(matches!(
            payload_bytes(b"not an image!!"),
            Err(ImageDataError::InvalidBase64(_))
        ));
        assert!(matches!(payload_bytes(b""), Err(ImageDataError::Empty)));
        assert!(matches!(payload_bytes(b" \n "), Err(ImageDataError::Empty)));
    }

    #[test]
    fn test_preprocess_bounds_large_image() {
        let png = png_bytes(1280, 640);
        let out = preprocess(&ImageCrateDecoder, &png, &PreprocessOptions::default()).unwrap();
        assert_eq!(out.width(), 320);
        assert_eq!(out.height(), 160);
    }

    #[test]
    fn test_preprocess_keeps_small_image_size() {
        let png = png_bytes(200, 100);
        let out = preprocess(&ImageCrateDecoder, &png, &PreprocessOptions::default()).unwrap();
        assert_eq!((out.width(), out.height()), (200, 100));
    }

    #[test]
    fn test_preprocess_valid_base64_but_not_an_image() {
        let payload = STANDARD.encode(b"hello world, definitely not a picture");
        let err = preprocess(
            &ImageCrateDecoder,
            payload.as_bytes(),
            &PreprocessOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, ImageDataError::Decode(_) | ImageDataError::Io(_)));
    }
}
