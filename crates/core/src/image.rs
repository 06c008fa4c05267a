//! Image identities, pixel sources and draw descriptions
//!
//! A [`SourceImage`] pairs a stable identity with an opaque pixel source.
//! The scene-graph layer describes each use of an image with a
//! [`DrawImage`]: the sub-rectangle it wants, the filter quality it asked
//! for and the transform it will be drawn under.

use crate::geometry::{IntRect, IntSize};
use crate::transform::Transform2d;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Filter quality requested for drawing an image.
///
/// Ordered so quality downgrades can be expressed as `min`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FilterQuality {
    /// Nearest-neighbor sampling
    None,
    /// Bilinear sampling
    Low,
    /// Bilinear sampling from a pre-scaled mip variant
    Medium,
    /// High-quality resampling of the exact target size
    High,
}

/// Stable identity of a source image.
///
/// Two draw descriptions with the same `ImageId` refer to the same pixel
/// content; the id stays stable across frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ImageId(u64);

static NEXT_IMAGE_ID: AtomicU64 = AtomicU64::new(1);

impl ImageId {
    /// Allocate a fresh, process-unique image id
    pub fn next() -> Self {
        Self(NEXT_IMAGE_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// The raw id value, for diagnostics
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "image#{}", self.0)
    }
}

/// Error produced by a pixel source that cannot decode its content.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PixelSourceError {
    #[error("malformed image data: {0}")]
    Malformed(String),

    #[error("image dimensions unsupported: {width}x{height}")]
    UnsupportedDimensions { width: u32, height: u32 },
}

/// A decoded RGBA8 bitmap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitmap {
    pub size: IntSize,
    /// Tightly packed RGBA8 rows, `size.width * size.height * 4` bytes
    pub pixels: Vec<u8>,
}

impl Bitmap {
    /// Bytes per RGBA8 pixel
    pub const BYTES_PER_PIXEL: usize = 4;

    /// Create a bitmap from pre-built pixel data.
    ///
    /// Panics if the pixel buffer does not match the size; a mismatch is a
    /// programmer error in the decoder, not a runtime condition.
    pub fn new(size: IntSize, pixels: Vec<u8>) -> Self {
        assert_eq!(pixels.len(), size.area() * Self::BYTES_PER_PIXEL);
        Self { size, pixels }
    }

    /// A bitmap filled with a single RGBA value
    pub fn new_filled(size: IntSize, rgba: [u8; 4]) -> Self {
        let mut pixels = Vec::with_capacity(size.area() * Self::BYTES_PER_PIXEL);
        for _ in 0..size.area() {
            pixels.extend_from_slice(&rgba);
        }
        Self { size, pixels }
    }

    /// Size of the pixel data in bytes
    pub fn byte_size(&self) -> usize {
        self.pixels.len()
    }
}

/// Produces the full-resolution pixels of one source image.
///
/// Implementations decode from whatever backing content they hold (encoded
/// bytes, a generated pattern, a test fixture). `decode` may be called from
/// any worker thread, concurrently with other decodes.
pub trait PixelSource: Send + Sync {
    /// Full-resolution dimensions, known without decoding
    fn size(&self) -> IntSize;

    /// Decode the full-resolution bitmap
    fn decode(&self) -> Result<Bitmap, PixelSourceError>;
}

/// A source image: stable identity plus shared pixel source.
#[derive(Clone)]
pub struct SourceImage {
    id: ImageId,
    source: Arc<dyn PixelSource>,
}

impl SourceImage {
    /// Wrap a pixel source with a fresh identity
    pub fn new(source: Arc<dyn PixelSource>) -> Self {
        Self {
            id: ImageId::next(),
            source,
        }
    }

    /// Wrap a pixel source under an existing identity (same content,
    /// re-registered)
    pub fn with_id(id: ImageId, source: Arc<dyn PixelSource>) -> Self {
        Self { id, source }
    }

    pub fn id(&self) -> ImageId {
        self.id
    }

    /// Full-resolution dimensions of the source
    pub fn size(&self) -> IntSize {
        self.source.size()
    }

    /// The bounds rectangle of the source, at the origin
    pub fn bounds(&self) -> IntRect {
        IntRect::from_size(self.size())
    }

    pub fn pixel_source(&self) -> &Arc<dyn PixelSource> {
        &self.source
    }
}

impl fmt::Debug for SourceImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceImage")
            .field("id", &self.id)
            .field("size", &self.size())
            .finish()
    }
}

/// One requested use of an image: which part, at what quality, under what
/// transform. This is the unit the cache keys on.
#[derive(Debug, Clone)]
pub struct DrawImage {
    pub image: SourceImage,
    /// Requested sub-rectangle in source pixels; clipped to the image
    /// bounds during key derivation
    pub src_rect: IntRect,
    pub quality: FilterQuality,
    pub transform: Transform2d,
}

impl DrawImage {
    /// Describe drawing the whole image under `transform`
    pub fn new(image: SourceImage, quality: FilterQuality, transform: Transform2d) -> Self {
        let src_rect = image.bounds();
        Self {
            image,
            src_rect,
            quality,
            transform,
        }
    }

    /// Restrict the draw to a sub-rectangle of the source
    pub fn with_src_rect(mut self, src_rect: IntRect) -> Self {
        self.src_rect = src_rect;
        self
    }
}
