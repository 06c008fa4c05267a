//! Decode and upload task pair
//!
//! The cache hands these to the task-scheduling layer. A decode task may
//! run on any worker; the upload task runs only on the raster thread and
//! declares its decode task as its single dependency. Both task bodies
//! are idempotent short-circuiting operations, so a task whose work was
//! already done elsewhere (a concurrent at-raster decode, a piggybacked
//! duplicate) is a cheap no-op.
//!
//! `on_complete` fires exactly once per task, either after `run` or at
//! cancellation, and releases the task-held reference.

use crate::controller::ImageCache;
use crate::record::RecordHandle;
use rasterline_scheduler::{CacheTask, TaskAffinity};
use std::sync::Arc;
use tracing::trace;

/// Metadata attached to issued tasks, for correlating pipeline work with
/// the frame that requested it.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingInfo {
    pub frame_id: u64,
}

/// Decodes (and pre-scales) one record's pixels on a worker thread.
pub struct DecodeTask {
    cache: Arc<ImageCache>,
    record: RecordHandle,
    info: TracingInfo,
}

impl DecodeTask {
    pub(crate) fn new(cache: Arc<ImageCache>, record: RecordHandle, info: TracingInfo) -> Self {
        Self {
            cache,
            record,
            info,
        }
    }
}

impl CacheTask for DecodeTask {
    fn run(&self) {
        trace!(frame_id = self.info.frame_id, "decode task running");
        self.cache.run_pending_decode(&self.record);
    }

    fn on_complete(&self) {
        self.cache.decode_task_completed(&self.record);
    }

    fn affinity(&self) -> TaskAffinity {
        TaskAffinity::Worker
    }
}

/// Produces one record's drawable surface on the raster thread.
///
/// Acquires the graphics context lock for the duration of the upload, per
/// the lock discipline: context lock outside, cache lock inside.
pub struct UploadTask {
    cache: Arc<ImageCache>,
    record: RecordHandle,
    /// Absent when the record's decode data already exists and was
    /// re-locked at issuance; the upload then stands alone
    decode: Option<Arc<DecodeTask>>,
    info: TracingInfo,
}

impl UploadTask {
    pub(crate) fn new(
        cache: Arc<ImageCache>,
        record: RecordHandle,
        decode: Option<Arc<DecodeTask>>,
        info: TracingInfo,
    ) -> Self {
        Self {
            cache,
            record,
            decode,
            info,
        }
    }

    /// The decode task this upload depends on, if decode work is needed
    pub fn decode_task(&self) -> Option<&Arc<DecodeTask>> {
        self.decode.as_ref()
    }
}

impl CacheTask for UploadTask {
    fn run(&self) {
        trace!(frame_id = self.info.frame_id, "upload task running");
        let mut guard = self.cache.context().lock();
        self.cache.run_pending_upload(&mut guard, &self.record);
    }

    fn on_complete(&self) {
        self.cache.upload_task_completed(&self.record);
    }

    fn affinity(&self) -> TaskAffinity {
        TaskAffinity::Raster
    }

    fn dependency(&self) -> Option<Arc<dyn CacheTask>> {
        self.decode
            .clone()
            .map(|decode| decode as Arc<dyn CacheTask>)
    }
}
