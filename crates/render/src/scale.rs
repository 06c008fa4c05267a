//! Quality-graded bitmap scaling
//!
//! Maps the pipeline's filter quality grades onto concrete resampling
//! filters. Decode tasks use this to produce the pre-scaled variant a
//! cache key asks for.

use image::imageops::{self, FilterType};
use image::{ImageBuffer, Rgba};
use rasterline_core::{Bitmap, FilterQuality, IntSize};

/// Resampling filter for a quality grade.
///
/// `None` is straight nearest-neighbor; `Low` matches bilinear drawing;
/// `Medium` is used for mip-level pre-scales; `High` pays for a windowed
/// sinc on the exact target size.
fn filter_for_quality(quality: FilterQuality) -> FilterType {
    match quality {
        FilterQuality::None => FilterType::Nearest,
        FilterQuality::Low => FilterType::Triangle,
        FilterQuality::Medium => FilterType::CatmullRom,
        FilterQuality::High => FilterType::Lanczos3,
    }
}

/// Scale a bitmap to `target` with the filter implied by `quality`.
///
/// An identity target returns a copy without resampling.
pub fn scale_bitmap(src: &Bitmap, target: IntSize, quality: FilterQuality) -> Bitmap {
    if target == src.size || target.is_empty() {
        return src.clone();
    }

    let buffer: ImageBuffer<Rgba<u8>, Vec<u8>> =
        ImageBuffer::from_raw(src.size.width, src.size.height, src.pixels.clone())
            .expect("bitmap pixel buffer matches its dimensions");
    let resized = imageops::resize(
        &buffer,
        target.width,
        target.height,
        filter_for_quality(quality),
    );
    Bitmap::new(target, resized.into_raw())
}

/// Extract a sub-rectangle of a bitmap as a new bitmap.
///
/// The rectangle must lie within the source bounds.
pub fn crop_bitmap(src: &Bitmap, x: u32, y: u32, size: IntSize) -> Bitmap {
    debug_assert!(x + size.width <= src.size.width);
    debug_assert!(y + size.height <= src.size.height);

    let row_bytes = size.width as usize * Bitmap::BYTES_PER_PIXEL;
    let src_stride = src.size.width as usize * Bitmap::BYTES_PER_PIXEL;
    let mut pixels = Vec::with_capacity(size.area() * Bitmap::BYTES_PER_PIXEL);
    for row in 0..size.height as usize {
        let start = (y as usize + row) * src_stride + x as usize * Bitmap::BYTES_PER_PIXEL;
        pixels.extend_from_slice(&src.pixels[start..start + row_bytes]);
    }
    Bitmap::new(size, pixels)
}
