//! Cache controller
//!
//! Orchestrates the whole subsystem: task issuance, the reference
//! counting protocol, the at-raster synchronous path and eviction.
//!
//! One mutex protects all cache bookkeeping (keys, records, reference
//! counts, budget). It is held for state transitions but released around
//! the expensive decode/scale/upload work; every unlocked stretch is
//! followed by re-validation, and races resolve as "first completed
//! wins, the duplicate is discarded". When the graphics context lock and
//! the cache mutex are both needed, the context lock is always the outer
//! one.

use crate::budget::BudgetTracker;
use crate::config::{CacheConfig, CacheMode};
use crate::key::ImageKey;
use crate::record::{ImageRecord, RecordHandle};
use crate::stats::CacheStats;
use crate::tasks::{DecodeTask, TracingInfo, UploadTask};
use rasterline_core::{
    Bitmap, DrawImage, FilterQuality, ImageId, IntRect, PixelSourceError, SourceImage,
};
use rasterline_render::scale::{crop_bitmap, scale_bitmap};
use rasterline_render::{ContextGuard, DrawSurface, GraphicsContext, TextureId};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Result of a task-issuance request.
///
/// `needs_unref` tells the caller whether it now holds a reference it
/// must release with [`ImageCache::unref_image`] once its draw no longer
/// needs the image.
#[derive(Clone)]
pub struct TaskIssueResult {
    /// The upload task to schedule (its decode task is its dependency),
    /// or `None` when no work is needed or none can be admitted
    pub task: Option<Arc<UploadTask>>,
    pub needs_unref: bool,
}

impl TaskIssueResult {
    fn no_task() -> Self {
        Self {
            task: None,
            needs_unref: false,
        }
    }
}

/// Result of the at-raster entry point.
#[derive(Debug, Clone)]
pub struct DecodedDrawImage {
    /// The drawable surface, or `None` when the image is unavailable
    /// this frame (decode failed or was skipped)
    pub surface: Option<DrawSurface>,
    /// True when the surface came from a synchronous decode that is not
    /// (yet) budgeted; such results are ephemeral
    pub at_raster: bool,
}

impl DecodedDrawImage {
    fn unavailable() -> Self {
        Self {
            surface: None,
            at_raster: false,
        }
    }
}

/// One record's worth of diagnostic accounting.
#[derive(Debug, Clone)]
pub struct RecordMemoryEntry {
    pub image_id: ImageId,
    pub decoded_bytes: usize,
    pub uploaded_bytes: usize,
    pub budgeted: bool,
    /// Decode memory is pinned against discard
    pub decode_locked: bool,
    pub decode_refs: u32,
    pub upload_refs: u32,
    pub orphaned: bool,
    pub at_raster: bool,
}

struct CacheState {
    /// Source identity -> record; survives zero refs, bounded by budget
    persistent: HashMap<ImageId, RecordHandle>,
    /// Eviction order over `persistent` (front = least recently used)
    lru: VecDeque<ImageId>,
    /// Canonical key -> record; entries die the instant the record's
    /// reference count reaches zero
    in_use: HashMap<ImageKey, RecordHandle>,
    budget: BudgetTracker,
    /// Previous byte limit while aggressive-free mode is active
    saved_byte_limit: Option<usize>,
    /// GPU textures awaiting destruction under the context lock
    zombie_textures: Vec<TextureId>,
    stats: CacheStats,
}

impl CacheState {
    /// Mark an identity as most recently used
    fn touch(&mut self, id: ImageId) {
        self.lru.retain(|&k| k != id);
        self.lru.push_back(id);
    }

    fn remove_entry(&mut self, id: ImageId) {
        self.persistent.remove(&id);
        self.lru.retain(|&k| k != id);
    }
}

/// The image decode/upload cache.
///
/// Shared as `Arc<ImageCache>`; task issuance needs the `Arc` receiver
/// because issued tasks keep the cache alive.
pub struct ImageCache {
    mode: CacheMode,
    context: Arc<GraphicsContext>,
    state: Mutex<CacheState>,
}

impl ImageCache {
    pub fn new(config: CacheConfig, context: Arc<GraphicsContext>) -> Self {
        Self {
            mode: config.mode,
            context,
            state: Mutex::new(CacheState {
                persistent: HashMap::new(),
                lru: VecDeque::new(),
                in_use: HashMap::new(),
                budget: BudgetTracker::new(config.byte_limit, config.preferred_item_limit),
                saved_byte_limit: None,
                zombie_textures: Vec::new(),
                stats: CacheStats::default(),
            }),
        }
    }

    /// The graphics context whose lock guards all backend work
    pub fn context(&self) -> &Arc<GraphicsContext> {
        &self.context
    }

    /// Request a task graph for a draw description, taking references.
    ///
    /// Returns no task (and no reference) when the request is a no-op,
    /// when the record's decode already failed, when a synchronous decode
    /// is in flight for the record, or when the budget cannot admit the
    /// work; in the latter cases the caller falls back to
    /// [`ImageCache::get_decoded_image_for_draw`].
    pub fn get_task_for_image_and_ref(
        self: &Arc<Self>,
        draw: &DrawImage,
        info: TracingInfo,
    ) -> TaskIssueResult {
        let Some(key) = ImageKey::from_draw_image(draw) else {
            return TaskIssueResult::no_task();
        };

        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        let (handle, is_new) = self.resolve_or_create_record(state, &key, &draw.image);
        let mut rec = handle.lock().unwrap();

        // A synchronous decode owns this record right now; the caller
        // must take the at-raster path itself.
        if rec.at_raster {
            return TaskIssueResult::no_task();
        }
        if rec.decode.failed {
            return TaskIssueResult::no_task();
        }
        if rec.upload.surface.is_some() {
            state.stats.hits += 1;
            self.ref_upload(state, &handle, &mut rec, &key);
            return TaskIssueResult {
                task: None,
                needs_unref: true,
            };
        }
        if let Some(task) = rec.upload.task.clone() {
            state.stats.piggybacks += 1;
            self.ref_upload(state, &handle, &mut rec, &key);
            return TaskIssueResult {
                task: Some(task),
                needs_unref: true,
            };
        }

        if !self.ensure_capacity(state, rec.byte_estimate, Some(&handle)) {
            debug!(image = %key.image_id(), bytes = rec.byte_estimate, "over budget, deferring to at-raster");
            return TaskIssueResult::no_task();
        }

        if is_new {
            state.persistent.insert(key.image_id(), handle.clone());
            state.lru.push_back(key.image_id());
        }

        // Decode data that survived an earlier surface eviction can be
        // re-locked; the upload then needs no decode dependency.
        let decode_task = if rec.decode.data.is_some() && rec.decode.task.is_none() {
            rec.decode.locked = true;
            None
        } else {
            Some(match rec.decode.task.clone() {
                Some(task) => task,
                None => {
                    let task = Arc::new(DecodeTask::new(self.clone(), handle.clone(), info));
                    rec.decode.task = Some(task.clone());
                    // Released when the decode task completes
                    self.ref_decode(state, &handle, &mut rec, &key);
                    task
                }
            })
        };
        let upload_task = Arc::new(UploadTask::new(
            self.clone(),
            handle.clone(),
            decode_task,
            info,
        ));
        rec.upload.task = Some(upload_task.clone());
        // Released when the upload task completes
        self.ref_upload(state, &handle, &mut rec, &key);
        // Owned by the caller, released by an explicit unref
        self.ref_upload(state, &handle, &mut rec, &key);
        state.stats.tasks_issued += 1;

        TaskIssueResult {
            task: Some(upload_task),
            needs_unref: true,
        }
    }

    /// Release the caller-held reference taken by a successful
    /// `get_task_for_image_and_ref` or at-raster request.
    pub fn unref_image(&self, draw: &DrawImage) {
        let Some(key) = ImageKey::from_draw_image(draw) else {
            debug_assert!(false, "unref for a skipped draw description");
            return;
        };
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        let handle = state.in_use.get(&key).cloned();
        debug_assert!(handle.is_some(), "unref without a matching ref");
        if let Some(handle) = handle {
            let mut rec = handle.lock().unwrap();
            debug_assert!(rec.upload.ref_count > 0);
            rec.upload.ref_count = rec.upload.ref_count.saturating_sub(1);
            self.ownership_changed(state, &mut rec);
        }
    }

    /// Synchronous decode+upload at draw time. The caller must hold the
    /// graphics context lock and must pair every surface-bearing result
    /// with [`ImageCache::draw_with_image_finished`].
    pub fn get_decoded_image_for_draw(
        &self,
        guard: &mut ContextGuard<'_>,
        draw: &DrawImage,
    ) -> DecodedDrawImage {
        let Some(key) = ImageKey::from_draw_image(draw) else {
            return DecodedDrawImage::unavailable();
        };

        let handle = {
            let mut state_guard = self.state.lock().unwrap();
            let state = &mut *state_guard;
            let (handle, is_new) = self.resolve_or_create_record(state, &key, &draw.image);
            let mut rec = handle.lock().unwrap();

            if rec.decode.failed {
                return DecodedDrawImage::unavailable();
            }
            if is_new {
                state.persistent.insert(key.image_id(), handle.clone());
                state.lru.push_back(key.image_id());
            }
            if rec.upload.surface.is_some() {
                state.stats.hits += 1;
                self.ref_upload(state, &handle, &mut rec, &key);
                return DecodedDrawImage {
                    surface: rec.upload.surface.clone(),
                    at_raster: rec.at_raster,
                };
            }

            // Not resident. Admit normally if the budget allows; flag the
            // record at-raster instead of failing otherwise.
            if !rec.upload.budgeted
                && !rec.at_raster
                && !self.ensure_capacity(state, rec.byte_estimate, Some(&handle))
            {
                rec.at_raster = true;
                state.stats.at_raster_decodes += 1;
                debug!(image = %key.image_id(), "at-raster decode");
            }

            self.ref_upload(state, &handle, &mut rec, &key);
            self.ref_decode(state, &handle, &mut rec, &key);
            drop(rec);
            handle
        };

        // Decode and upload inline, without the cache lock, reusing the
        // task bodies (they short-circuit if a task got there first).
        self.run_pending_decode(&handle);
        self.run_pending_upload(guard, &handle);

        let mut state_guard = self.state.lock().unwrap();
        let state = &mut *state_guard;
        let mut rec = handle.lock().unwrap();
        debug_assert!(rec.decode.ref_count > 0);
        rec.decode.ref_count = rec.decode.ref_count.saturating_sub(1);
        self.ownership_changed(state, &mut rec);

        let surface = rec.upload.surface.clone();
        let at_raster = rec.at_raster;
        if surface.is_none() {
            // Decode or upload failed; drop the draw reference as well
            debug_assert!(rec.upload.ref_count > 0);
            rec.upload.ref_count = rec.upload.ref_count.saturating_sub(1);
            self.ownership_changed(state, &mut rec);
            return DecodedDrawImage::unavailable();
        }
        DecodedDrawImage { surface, at_raster }
    }

    /// Signal that a draw using an at-raster (or cached) result finished.
    /// Releases the draw-held reference and flushes deferred surface
    /// destruction while the context lock is held.
    pub fn draw_with_image_finished(
        &self,
        guard: &mut ContextGuard<'_>,
        draw: &DrawImage,
        decoded: DecodedDrawImage,
    ) {
        if decoded.surface.is_some() {
            self.unref_image(draw);
        }
        self.flush_deferred_releases(guard);
    }

    /// Run eviction with zero additional headroom. Intended for a
    /// periodic maintenance callback.
    pub fn reduce_cache_usage(&self) {
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        self.ensure_capacity(state, 0, None);
    }

    /// Aggressive-free mode: zero the byte budget and evict everything
    /// evictable immediately; restore the previous limit when disabled.
    /// Freed GPU surfaces are destroyed at the next deferred-release
    /// flush.
    pub fn set_aggressively_free_resources(&self, enabled: bool) {
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        if enabled {
            if state.saved_byte_limit.is_none() {
                state.saved_byte_limit = Some(state.budget.byte_limit());
                state.budget.set_byte_limit(0);
            }
            self.ensure_capacity(state, 0, None);
            debug!("aggressive free enabled");
        } else if let Some(limit) = state.saved_byte_limit.take() {
            state.budget.set_byte_limit(limit);
            debug!("aggressive free disabled");
        }
    }

    /// Destroy any surfaces queued for deferred destruction. Requires the
    /// context lock; called automatically whenever the cache already
    /// holds it for other work.
    pub fn flush_deferred_releases(&self, guard: &mut ContextGuard<'_>) {
        let zombies: Vec<TextureId> = {
            let mut state = self.state.lock().unwrap();
            state.zombie_textures.drain(..).collect()
        };
        for texture in zombies {
            guard.delete_texture(texture);
        }
    }

    /// Enumerate all cached records for diagnostic memory accounting.
    pub fn memory_report(&self) -> Vec<RecordMemoryEntry> {
        let state = self.state.lock().unwrap();
        let mut seen: HashSet<usize> = HashSet::new();
        let mut entries = Vec::new();
        let handles = state
            .persistent
            .values()
            .chain(state.in_use.values());
        for handle in handles {
            if !seen.insert(Arc::as_ptr(handle) as usize) {
                continue;
            }
            let rec = handle.lock().unwrap();
            entries.push(RecordMemoryEntry {
                image_id: rec.key.image_id(),
                decoded_bytes: rec.decoded_bytes(),
                uploaded_bytes: rec.uploaded_bytes(),
                budgeted: rec.upload.budgeted,
                decode_locked: rec.decode.locked,
                decode_refs: rec.decode.ref_count,
                upload_refs: rec.upload.ref_count,
                orphaned: rec.orphaned,
                at_raster: rec.at_raster,
            });
        }
        entries
    }

    /// Snapshot of the cache's counters and occupancy
    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock().unwrap();
        let mut stats = state.stats;
        stats.bytes_used = state.budget.bytes_used();
        stats.byte_limit = state.budget.byte_limit();
        stats.item_count = state.persistent.len();
        stats.preferred_item_limit = state.budget.preferred_item_limit();
        stats
    }

    /// Bytes currently charged against the budget
    pub fn bytes_used(&self) -> usize {
        self.state.lock().unwrap().budget.bytes_used()
    }

    /// Entries currently in the persistent cache
    pub fn item_count(&self) -> usize {
        self.state.lock().unwrap().persistent.len()
    }

    // ------------------------------------------------------------------
    // Record resolution
    // ------------------------------------------------------------------

    /// Find the record for a key: in-use cache first (exact key), then
    /// the persistent cache (source identity, compatibility-checked).
    /// Incompatible persistent hits are orphaned and replaced. A newly
    /// created record is not yet registered anywhere.
    fn resolve_or_create_record(
        &self,
        state: &mut CacheState,
        key: &ImageKey,
        image: &SourceImage,
    ) -> (RecordHandle, bool) {
        if let Some(handle) = state.in_use.get(key).cloned() {
            state.touch(key.image_id());
            return (handle, false);
        }

        if let Some(handle) = state.persistent.get(&key.image_id()).cloned() {
            let compatible = {
                let rec = handle.lock().unwrap();
                Self::is_compatible(key, &rec)
            };
            if compatible {
                state.touch(key.image_id());
                return (handle, false);
            }

            // Superseded by an incompatible variant: evict from the
            // persistent cache now, destroy once the refs drain.
            state.remove_entry(key.image_id());
            state.stats.records_orphaned += 1;
            let mut rec = handle.lock().unwrap();
            rec.orphaned = true;
            debug!(image = %key.image_id(), "record orphaned by incompatible variant");
            self.ownership_changed(state, &mut rec);
        }

        state.stats.misses += 1;
        let record = ImageRecord::new(*key, image.clone());
        (Arc::new(Mutex::new(record)), true)
    }

    /// A persistent-cache hit for a different key on the same source
    /// identity is usable only if the cached record is an unscaled
    /// full-resolution decode (which serves anything), or if it carries
    /// at least as much detail and at least as good a filter as the new
    /// request needs. High-quality records decode at exact non-mip sizes
    /// and only ever match their own key.
    fn is_compatible(new_key: &ImageKey, rec: &ImageRecord) -> bool {
        if rec.key == *new_key {
            return true;
        }
        if rec.unscaled {
            return true;
        }
        if rec.key.quality() == FilterQuality::High || new_key.quality() == FilterQuality::High {
            return false;
        }
        rec.key.src_rect() == new_key.src_rect()
            && new_key.mip_level() >= rec.mip_level
            && new_key.quality() <= rec.quality_ceiling
    }

    // ------------------------------------------------------------------
    // Reference counting
    // ------------------------------------------------------------------

    fn ref_upload(
        &self,
        state: &mut CacheState,
        handle: &RecordHandle,
        rec: &mut ImageRecord,
        key: &ImageKey,
    ) {
        rec.upload.ref_count += 1;
        self.register_in_use(state, handle, rec, key);
        self.ownership_changed(state, rec);
    }

    fn ref_decode(
        &self,
        state: &mut CacheState,
        handle: &RecordHandle,
        rec: &mut ImageRecord,
        key: &ImageKey,
    ) {
        rec.decode.ref_count += 1;
        self.register_in_use(state, handle, rec, key);
        self.ownership_changed(state, rec);
    }

    fn register_in_use(
        &self,
        state: &mut CacheState,
        handle: &RecordHandle,
        rec: &mut ImageRecord,
        key: &ImageKey,
    ) {
        if !state.in_use.contains_key(key) {
            state.in_use.insert(*key, handle.clone());
            rec.in_use_keys.push(*key);
        }
    }

    /// The single ownership-changed handler: re-derives budget and lock
    /// state from the current counts. Idempotent; called after every
    /// mutation of either sub-record.
    fn ownership_changed(&self, state: &mut CacheState, rec: &mut ImageRecord) {
        let refs = rec.total_refs();

        // Orphaned and unreferenced: free everything now. GPU surfaces
        // go to the deferred-destruction queue.
        if rec.orphaned && refs == 0 {
            self.release_surface(state, rec);
            rec.decode.locked = false;
            rec.decode.data = None;
        }

        // Leaving at-raster mode on the last unref: adopt the surface
        // into the budget if it fits now, release it otherwise.
        if rec.at_raster && refs == 0 {
            if rec.upload.surface.is_some() && state.budget.can_fit(rec.byte_estimate) {
                rec.at_raster = false;
                state.budget.charge(rec.byte_estimate);
                rec.upload.budgeted = true;
            } else {
                self.release_surface(state, rec);
                rec.at_raster = false;
            }
        }

        // First upload reference on an admitted record charges its bytes
        // (capacity was confirmed at admission).
        if rec.upload.ref_count > 0 && !rec.upload.budgeted && !rec.at_raster {
            state.budget.charge(rec.byte_estimate);
            rec.upload.budgeted = true;
        }

        // Upload wound down without ever producing a surface (cancelled
        // before completion): refund the charge.
        if rec.upload.ref_count == 0 && rec.upload.budgeted && rec.upload.surface.is_none() {
            state.budget.release(rec.byte_estimate);
            rec.upload.budgeted = false;
        }

        // Decode memory pinning. In GPU mode the pixels are only needed
        // until the texture exists; CPU surfaces reference the decode
        // memory directly, so it stays locked while a surface is
        // resident.
        match self.mode {
            CacheMode::Gpu => {
                if refs == 0 || (rec.upload.surface.is_some() && rec.decode.ref_count == 0) {
                    rec.decode.locked = false;
                }
            }
            CacheMode::Cpu => {
                if refs == 0 && rec.upload.surface.is_none() {
                    rec.decode.locked = false;
                }
            }
        }

        // In-use entries die the instant the count reaches zero.
        if refs == 0 {
            for key in rec.in_use_keys.drain(..) {
                state.in_use.remove(&key);
            }
        }
    }

    /// Release the resident surface, returning its bytes to the budget
    /// and queueing GPU textures for destruction under the context lock.
    fn release_surface(&self, state: &mut CacheState, rec: &mut ImageRecord) {
        if let Some(surface) = rec.upload.surface.take() {
            if let Some(texture) = surface.texture() {
                state.zombie_textures.push(texture);
            }
            state.stats.surfaces_released += 1;
        }
        if rec.upload.budgeted {
            state.budget.release(rec.byte_estimate);
            rec.upload.budgeted = false;
        }
    }

    // ------------------------------------------------------------------
    // Eviction
    // ------------------------------------------------------------------

    /// Make room for `bytes` more. Scans the persistent cache in LRU
    /// order; entries with zero references lose their surface, and whole
    /// entries are removed while the item count exceeds the preferred
    /// limit. Referenced records are never touched, so the admission
    /// check is the only backpressure. Returns whether `bytes` fits.
    fn ensure_capacity(
        &self,
        state: &mut CacheState,
        bytes: usize,
        exclude: Option<&RecordHandle>,
    ) -> bool {
        let within = |state: &CacheState| {
            state.budget.can_fit(bytes) && !state.budget.over_item_limit(state.persistent.len())
        };
        if within(state) {
            return true;
        }

        let scan: Vec<ImageId> = state.lru.iter().copied().collect();
        for id in scan {
            if within(state) {
                break;
            }
            let Some(handle) = state.persistent.get(&id).cloned() else {
                continue;
            };
            if exclude.is_some_and(|e| Arc::ptr_eq(e, &handle)) {
                continue;
            }
            let mut rec = handle.lock().unwrap();
            if rec.total_refs() != 0 {
                continue;
            }
            self.release_surface(state, &mut rec);
            self.ownership_changed(state, &mut rec);
            if state.budget.over_item_limit(state.persistent.len()) {
                drop(rec);
                state.remove_entry(id);
                state.stats.records_evicted += 1;
            }
        }
        state.budget.can_fit(bytes)
    }

    // ------------------------------------------------------------------
    // Decode / upload execution (task bodies and at-raster inline work)
    // ------------------------------------------------------------------

    /// Decode one record's pixels if still needed. Safe on any worker,
    /// concurrently with other decodes and with the at-raster path: if
    /// another thread finished first while this one was decoding, the
    /// redundant result is discarded.
    pub(crate) fn run_pending_decode(&self, handle: &RecordHandle) {
        let work = {
            let mut rec = handle.lock().unwrap();
            if rec.decode.failed || rec.upload.surface.is_some() {
                None
            } else if rec.decode.data.is_some() {
                // Existing decode data can be re-locked; nothing to do
                rec.decode.locked = true;
                None
            } else {
                Some((rec.image.clone(), rec.key))
            }
        };
        let Some((image, key)) = work else {
            return;
        };

        // The expensive part runs without any cache lock held.
        let result = Self::decode_and_scale(&image, &key);

        let mut rec = handle.lock().unwrap();
        match result {
            Ok(bitmap) => {
                if rec.decode.data.is_none() {
                    rec.decode.data = Some(Arc::new(bitmap));
                    rec.decode.locked = true;
                }
                // Someone else already produced decode data while this
                // thread was unlocked; drop the duplicate.
            }
            Err(error) => {
                if rec.decode.data.is_none() && !rec.decode.failed {
                    warn!(image = %key.image_id(), %error, "image decode failed");
                    rec.decode.failed = true;
                    drop(rec);
                    self.state.lock().unwrap().stats.decode_failures += 1;
                }
            }
        }
    }

    fn decode_and_scale(image: &SourceImage, key: &ImageKey) -> Result<Bitmap, PixelSourceError> {
        let full = image.pixel_source().decode()?;
        let working = if key.unscaled_usable() || key.src_rect() == IntRect::from_size(full.size) {
            full
        } else {
            let rect = key.src_rect();
            crop_bitmap(&full, rect.x as u32, rect.y as u32, rect.size)
        };
        if working.size == key.target_size() {
            return Ok(working);
        }
        Ok(scale_bitmap(&working, key.target_size(), key.quality()))
    }

    /// Produce one record's drawable surface if still needed. Must run on
    /// the raster thread with the context lock held. Flushes deferred
    /// destruction first to keep backend memory in bounds, and only
    /// installs the result if no concurrent at-raster path installed one
    /// while the cache lock was released.
    pub(crate) fn run_pending_upload(&self, guard: &mut ContextGuard<'_>, handle: &RecordHandle) {
        let decode_data = {
            let mut state = self.state.lock().unwrap();
            let zombies: Vec<TextureId> = state.zombie_textures.drain(..).collect();
            drop(state);
            for texture in zombies {
                guard.delete_texture(texture);
            }

            let rec = handle.lock().unwrap();
            if rec.decode.failed || rec.upload.surface.is_some() {
                None
            } else {
                rec.decode.data.clone()
            }
        };
        let Some(data) = decode_data else {
            return;
        };

        // Backend work without the cache lock (the context lock is the
        // caller's and stays held).
        let surface = match self.mode {
            CacheMode::Cpu => Some(DrawSurface::Cpu(data.clone())),
            CacheMode::Gpu => match guard.create_texture(&data) {
                Ok(texture) => Some(DrawSurface::Gpu {
                    texture,
                    size: data.size,
                }),
                Err(error) => {
                    warn!(%error, "texture upload failed");
                    None
                }
            },
        };
        let Some(surface) = surface else {
            return;
        };

        let mut state_guard = self.state.lock().unwrap();
        let state = &mut *state_guard;
        let mut rec = handle.lock().unwrap();
        if rec.upload.surface.is_some() {
            // A concurrent at-raster upload won the race; ours is
            // redundant. We hold the context lock, destroy inline.
            if let Some(texture) = surface.texture() {
                guard.delete_texture(texture);
            }
        } else {
            rec.upload.surface = Some(surface);
        }
        self.ownership_changed(state, &mut rec);
    }

    /// Completion callback for decode tasks (run or cancelled): clears
    /// the pending-task handle and releases the task-held reference.
    pub(crate) fn decode_task_completed(&self, handle: &RecordHandle) {
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        let mut rec = handle.lock().unwrap();
        rec.decode.task = None;
        debug_assert!(rec.decode.ref_count > 0);
        rec.decode.ref_count = rec.decode.ref_count.saturating_sub(1);
        self.ownership_changed(state, &mut rec);
    }

    /// Completion callback for upload tasks (run or cancelled).
    pub(crate) fn upload_task_completed(&self, handle: &RecordHandle) {
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        let mut rec = handle.lock().unwrap();
        rec.upload.task = None;
        debug_assert!(rec.upload.ref_count > 0);
        rec.upload.ref_count = rec.upload.ref_count.saturating_sub(1);
        self.ownership_changed(state, &mut rec);
    }
}
