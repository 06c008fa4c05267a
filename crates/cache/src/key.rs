//! Cache key derivation
//!
//! An [`ImageKey`] is the canonical identity of "this source image, drawn
//! at this sub-region, scale and filter quality". Derivation applies the
//! quality downgrade rules in a fixed order; the order is a behavioral
//! contract (it decides which variants are considered equal, and so what
//! the hit rate looks like), so the steps below are numbered and must not
//! be reordered.

use rasterline_core::{Bitmap, DrawImage, FilterQuality, ImageId, IntRect, IntSize};
use std::hash::{Hash, Hasher};

/// Above this many bytes of target RGBA pixels, High quality falls back
/// to Medium rather than paying for an exact high-quality rescale.
const HIGH_QUALITY_BYTE_CEILING: usize = 64 * 1024 * 1024;

/// Canonical identity for a requested image variant.
///
/// Two keys with `unscaled_usable` set compare equal on source identity
/// alone, because all unscaled uses of one image share a single canonical
/// full-resolution decode.
#[derive(Debug, Clone, Copy)]
pub struct ImageKey {
    image_id: ImageId,
    src_rect: IntRect,
    target_size: IntSize,
    quality: FilterQuality,
    unscaled_usable: bool,
    mip_level: u32,
}

impl ImageKey {
    /// Derive the canonical key for a draw description.
    ///
    /// Returns `None` when the request is a pure no-op (empty clipped
    /// sub-rectangle or a zero scale component): no key, no task, the
    /// draw produces nothing.
    pub fn from_draw_image(draw: &DrawImage) -> Option<ImageKey> {
        // 1. Clip to the image bounds; empty rect or zero scale skips the
        //    request entirely.
        let src_rect = draw.src_rect.intersect(&draw.image.bounds());
        let (sx, sy) = draw.transform.scale_factors();
        if src_rect.is_empty() || sx == 0.0 || sy == 0.0 {
            return None;
        }

        // 2. Target pixel size from the clipped rect and the scale.
        let mut target_size = src_rect.size.scaled(sx, sy);
        let mut quality = draw.quality;

        // 3. No real scaling: Low is as good as it gets.
        if target_size == src_rect.size {
            quality = quality.min(FilterQuality::Low);
        }

        // 4. High only pays off for decomposable scales below the byte
        //    ceiling.
        if quality == FilterQuality::High {
            let target_bytes = target_size.area() * Bitmap::BYTES_PER_PIXEL;
            if !draw.transform.is_scale_translate() || target_bytes > HIGH_QUALITY_BYTE_CEILING {
                quality = FilterQuality::Medium;
            }
        }

        // 5. Medium needs a decomposable scale and an actual downscale;
        //    enlarging gains nothing from pre-scaling.
        if quality == FilterQuality::Medium
            && (!draw.transform.is_scale_translate() || (sx >= 1.0 && sy >= 1.0))
        {
            quality = FilterQuality::Low;
        }

        // 6. Low and None draw from the canonical full-resolution decode;
        //    the target resets to the full image size so every unscaled
        //    variant of one image shares a single key.
        let unscaled_usable = quality <= FilterQuality::Low;
        if unscaled_usable {
            target_size = draw.image.size();
        }

        // 7. Medium snaps the target to the nearest covering mip level to
        //    maximize reuse across nearby scale factors.
        let mut mip_level = 0;
        if quality == FilterQuality::Medium {
            mip_level = mip_level_for(src_rect.size, target_size);
            target_size = mip_size(src_rect.size, mip_level);
        }

        Some(ImageKey {
            image_id: draw.image.id(),
            src_rect,
            target_size,
            quality,
            unscaled_usable,
            mip_level,
        })
    }

    pub fn image_id(&self) -> ImageId {
        self.image_id
    }

    pub fn src_rect(&self) -> IntRect {
        self.src_rect
    }

    pub fn target_size(&self) -> IntSize {
        self.target_size
    }

    pub fn quality(&self) -> FilterQuality {
        self.quality
    }

    /// True when the canonical full-resolution decode serves this key
    pub fn unscaled_usable(&self) -> bool {
        self.unscaled_usable
    }

    /// Power-of-two downsample level this key decodes at (0 = full
    /// resolution of the sub-rectangle)
    pub fn mip_level(&self) -> u32 {
        self.mip_level
    }

    /// Byte cost of the decoded/uploaded variant, fixed by key geometry
    pub fn byte_estimate(&self) -> usize {
        self.target_size.area() * Bitmap::BYTES_PER_PIXEL
    }
}

impl PartialEq for ImageKey {
    fn eq(&self, other: &Self) -> bool {
        if self.unscaled_usable && other.unscaled_usable {
            return self.image_id == other.image_id;
        }
        self.unscaled_usable == other.unscaled_usable
            && self.image_id == other.image_id
            && self.src_rect == other.src_rect
            && self.target_size == other.target_size
            && self.quality == other.quality
    }
}

impl Eq for ImageKey {}

impl Hash for ImageKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.image_id.hash(state);
        if !self.unscaled_usable {
            self.src_rect.hash(state);
            self.target_size.hash(state);
            self.quality.hash(state);
        }
    }
}

/// Deepest mip level of `src` that still covers `target` in both axes.
pub(crate) fn mip_level_for(src: IntSize, target: IntSize) -> u32 {
    let mut level = 0;
    let mut size = src;
    loop {
        let next = size.halved();
        if next == size || !target.fits_within(next) {
            return level;
        }
        level += 1;
        size = next;
    }
}

/// Dimensions of `src` at a mip level, halving with round-up per step.
pub(crate) fn mip_size(src: IntSize, level: u32) -> IntSize {
    let mut size = src;
    for _ in 0..level {
        size = size.halved();
    }
    size
}
