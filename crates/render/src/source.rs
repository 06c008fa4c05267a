//! Encoded-image pixel source
//!
//! A [`PixelSource`] over caller-provided encoded bytes (PNG, JPEG, ...).
//! Dimensions are probed from the header at construction so the cache can
//! derive keys without decoding; pixel decode happens lazily on a worker.

use image::ImageReader;
use rasterline_core::{Bitmap, IntSize, PixelSource, PixelSourceError};
use std::io::Cursor;

/// Pixel source backed by in-memory encoded image bytes.
pub struct EncodedImageSource {
    bytes: Vec<u8>,
    size: IntSize,
}

impl EncodedImageSource {
    /// Wrap encoded bytes, probing the image header for dimensions.
    ///
    /// Fails if the bytes are not a recognizable image format.
    pub fn new(bytes: Vec<u8>) -> Result<Self, PixelSourceError> {
        let reader = ImageReader::new(Cursor::new(&bytes))
            .with_guessed_format()
            .map_err(|e| PixelSourceError::Malformed(e.to_string()))?;
        let (width, height) = reader
            .into_dimensions()
            .map_err(|e| PixelSourceError::Malformed(e.to_string()))?;
        if width == 0 || height == 0 {
            return Err(PixelSourceError::UnsupportedDimensions { width, height });
        }
        Ok(Self {
            bytes,
            size: IntSize::new(width, height),
        })
    }
}

impl PixelSource for EncodedImageSource {
    fn size(&self) -> IntSize {
        self.size
    }

    fn decode(&self) -> Result<Bitmap, PixelSourceError> {
        let decoded = image::load_from_memory(&self.bytes)
            .map_err(|e| PixelSourceError::Malformed(e.to_string()))?;
        let rgba = decoded.to_rgba8();
        let size = IntSize::new(rgba.width(), rgba.height());
        Ok(Bitmap::new(size, rgba.into_raw()))
    }
}
