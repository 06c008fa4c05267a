//! Image records
//!
//! The unit of cached state: one record per canonical image variant
//! family, holding a decode sub-record (raw pixels in evictable memory)
//! and an upload sub-record (resident drawable surface), each
//! independently ref-counted.
//!
//! Records are reference-counted heap allocations shared by the
//! persistent cache, the in-use cache, task closures and draw-held
//! references. The record mutex is only ever acquired while holding the
//! controller's state mutex, or alone by a task that will not take the
//! state mutex while holding it.

use crate::key::ImageKey;
use crate::tasks::{DecodeTask, UploadTask};
use rasterline_core::{Bitmap, FilterQuality, SourceImage};
use rasterline_render::DrawSurface;
use std::sync::{Arc, Mutex};

pub(crate) type RecordHandle = Arc<Mutex<ImageRecord>>;

/// Decode sub-record: raw pixels in evictable memory.
pub(crate) struct DecodeData {
    /// Decoded (and pre-scaled) pixels; `None` until decode completes or
    /// after the memory was discarded
    pub data: Option<Arc<Bitmap>>,
    /// Pinned against discard while a decode reference exists, or while
    /// the pixels back an upload (in-flight for GPU, resident for CPU)
    pub locked: bool,
    pub ref_count: u32,
    /// Sticky: once a decode fails, no further attempts are made
    pub failed: bool,
    /// Non-null while a decode task is outstanding
    pub task: Option<Arc<DecodeTask>>,
}

/// Upload sub-record: the resident drawable surface, if any.
pub(crate) struct UploadData {
    pub surface: Option<DrawSurface>,
    /// True iff this record's byte estimate is currently charged against
    /// the budget
    pub budgeted: bool,
    pub ref_count: u32,
    /// Non-null while an upload task is outstanding
    pub task: Option<Arc<UploadTask>>,
}

pub(crate) struct ImageRecord {
    pub key: ImageKey,
    pub image: SourceImage,
    /// Fixed at creation from key geometry x bytes-per-pixel
    pub byte_estimate: usize,
    /// Power-of-two downsample chosen at decode time
    pub mip_level: u32,
    /// Filter quality actually used for this record
    pub quality_ceiling: FilterQuality,
    /// True for full-image, full-resolution decodes, which serve any
    /// request for this image
    pub unscaled: bool,
    /// Superseded by an incompatible variant; kept alive only until the
    /// reference count reaches zero
    pub orphaned: bool,
    /// A synchronous decode is in flight (or its result is resident but
    /// not yet adopted into the budget)
    pub at_raster: bool,
    /// In-use cache keys currently pointing at this record
    pub in_use_keys: Vec<ImageKey>,
    pub decode: DecodeData,
    pub upload: UploadData,
}

impl ImageRecord {
    pub fn new(key: ImageKey, image: SourceImage) -> Self {
        let unscaled = key.unscaled_usable()
            || (key.target_size() == image.size() && key.src_rect() == image.bounds());
        Self {
            byte_estimate: key.byte_estimate(),
            mip_level: key.mip_level(),
            quality_ceiling: key.quality(),
            unscaled,
            orphaned: false,
            at_raster: false,
            in_use_keys: Vec::new(),
            decode: DecodeData {
                data: None,
                locked: false,
                ref_count: 0,
                failed: false,
                task: None,
            },
            upload: UploadData {
                surface: None,
                budgeted: false,
                ref_count: 0,
                task: None,
            },
            key,
            image,
        }
    }

    pub fn total_refs(&self) -> u32 {
        self.decode.ref_count + self.upload.ref_count
    }

    /// Bytes currently held by decoded pixels
    pub fn decoded_bytes(&self) -> usize {
        self.decode.data.as_ref().map_or(0, |d| d.byte_size())
    }

    /// Bytes currently held by the resident surface
    pub fn uploaded_bytes(&self) -> usize {
        self.upload
            .surface
            .as_ref()
            .map_or(0, |s| s.size().area() * Bitmap::BYTES_PER_PIXEL)
    }
}

impl Drop for ImageRecord {
    fn drop(&mut self) {
        // A record only dies once every cache entry, task closure and
        // draw-held reference has let go.
        debug_assert_eq!(self.decode.ref_count, 0, "record dropped with decode refs");
        debug_assert_eq!(self.upload.ref_count, 0, "record dropped with upload refs");
    }
}
