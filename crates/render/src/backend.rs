//! Graphics backend abstraction
//!
//! The backend owns GPU texture storage. All backend calls must happen on
//! the raster thread with the context lock held; the lock is expressed as
//! [`ContextGuard`], so entry points that require it simply take a guard
//! reference and the ordering rule ("context lock outside, cache lock
//! inside") cannot be violated by construction.

use rasterline_core::{Bitmap, IntSize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::warn;

/// Opaque handle to a backend texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureId(u64);

impl TextureId {
    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Error produced by backend operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendError {
    #[error("texture allocation failed: {0}")]
    AllocationFailed(String),

    #[error("operation not supported by this backend: {0}")]
    NotSupported(&'static str),
}

/// A graphics backend capable of creating and destroying textures.
///
/// Implementations are not required to be thread-safe; every call is made
/// through a held [`ContextGuard`].
pub trait RasterBackend: Send {
    /// Upload a bitmap into a new texture
    fn create_texture(&mut self, bitmap: &Bitmap) -> Result<TextureId, BackendError>;

    /// Destroy a texture previously returned by `create_texture`
    fn delete_texture(&mut self, texture: TextureId);
}

/// The shared graphics context: a backend behind its own lock.
///
/// This lock is separate from (and always acquired outside of) the image
/// cache's bookkeeping mutex.
pub struct GraphicsContext {
    backend: Mutex<Box<dyn RasterBackend>>,
}

impl GraphicsContext {
    pub fn new(backend: Box<dyn RasterBackend>) -> Self {
        Self {
            backend: Mutex::new(backend),
        }
    }

    /// A context for CPU-only pipelines; its backend has no texture
    /// storage, but the lock discipline is unchanged.
    pub fn software() -> Self {
        Self::new(Box::new(SoftwareBackend))
    }

    /// Acquire the context lock. Blocks until available.
    pub fn lock(&self) -> ContextGuard<'_> {
        ContextGuard {
            backend: self.backend.lock().unwrap(),
        }
    }
}

/// Proof that the context lock is held, plus access to the backend.
pub struct ContextGuard<'a> {
    backend: MutexGuard<'a, Box<dyn RasterBackend>>,
}

impl ContextGuard<'_> {
    pub fn create_texture(&mut self, bitmap: &Bitmap) -> Result<TextureId, BackendError> {
        self.backend.create_texture(bitmap)
    }

    pub fn delete_texture(&mut self, texture: TextureId) {
        self.backend.delete_texture(texture)
    }
}

/// A ready-to-draw surface handed back to draw calls.
///
/// CPU surfaces wrap the decoded pixels directly (the bitmap stays alive
/// as long as any surface clone does); GPU surfaces reference a backend
/// texture that must be destroyed under the context lock.
#[derive(Debug, Clone)]
pub enum DrawSurface {
    Cpu(Arc<Bitmap>),
    Gpu { texture: TextureId, size: IntSize },
}

impl DrawSurface {
    pub fn size(&self) -> IntSize {
        match self {
            DrawSurface::Cpu(bitmap) => bitmap.size,
            DrawSurface::Gpu { size, .. } => *size,
        }
    }

    /// The backend texture, if this is a GPU surface
    pub fn texture(&self) -> Option<TextureId> {
        match self {
            DrawSurface::Cpu(_) => None,
            DrawSurface::Gpu { texture, .. } => Some(*texture),
        }
    }

    pub fn is_gpu(&self) -> bool {
        matches!(self, DrawSurface::Gpu { .. })
    }
}

/// Backend for CPU-only pipelines: no texture storage.
pub struct SoftwareBackend;

impl RasterBackend for SoftwareBackend {
    fn create_texture(&mut self, _bitmap: &Bitmap) -> Result<TextureId, BackendError> {
        Err(BackendError::NotSupported(
            "software backend has no texture storage",
        ))
    }

    fn delete_texture(&mut self, _texture: TextureId) {}
}

/// Shared accounting handle for [`TestBackend`].
///
/// Clone it before boxing the backend into a context; counters stay
/// readable (and the failure switch armable) from tests while the backend
/// itself is locked away.
#[derive(Clone, Default)]
pub struct BackendCounters {
    inner: Arc<CounterInner>,
}

#[derive(Default)]
struct CounterInner {
    created: AtomicU64,
    deleted: AtomicU64,
    live_bytes: AtomicU64,
    fail_next: AtomicBool,
}

impl BackendCounters {
    /// Total textures created
    pub fn created(&self) -> u64 {
        self.inner.created.load(Ordering::SeqCst)
    }

    /// Total textures deleted
    pub fn deleted(&self) -> u64 {
        self.inner.deleted.load(Ordering::SeqCst)
    }

    /// Textures currently alive
    pub fn live_textures(&self) -> u64 {
        self.created() - self.deleted()
    }

    /// Bytes held by live textures
    pub fn live_bytes(&self) -> u64 {
        self.inner.live_bytes.load(Ordering::SeqCst)
    }

    /// Make the next `create_texture` call fail once
    pub fn arm_allocation_failure(&self) {
        self.inner.fail_next.store(true, Ordering::SeqCst);
    }
}

/// In-memory backend for tests: tracks live textures and byte usage, and
/// can be armed to fail an allocation.
pub struct TestBackend {
    next_id: u64,
    live: HashMap<TextureId, usize>,
    counters: BackendCounters,
}

impl TestBackend {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            live: HashMap::new(),
            counters: BackendCounters::default(),
        }
    }

    /// The accounting handle shared with this backend
    pub fn counters(&self) -> BackendCounters {
        self.counters.clone()
    }
}

impl Default for TestBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl RasterBackend for TestBackend {
    fn create_texture(&mut self, bitmap: &Bitmap) -> Result<TextureId, BackendError> {
        if self.counters.inner.fail_next.swap(false, Ordering::SeqCst) {
            return Err(BackendError::AllocationFailed(
                "allocation failure armed by test".into(),
            ));
        }
        let id = TextureId(self.next_id);
        self.next_id += 1;
        self.live.insert(id, bitmap.byte_size());
        self.counters.inner.created.fetch_add(1, Ordering::SeqCst);
        self.counters
            .inner
            .live_bytes
            .fetch_add(bitmap.byte_size() as u64, Ordering::SeqCst);
        Ok(id)
    }

    fn delete_texture(&mut self, texture: TextureId) {
        match self.live.remove(&texture) {
            Some(bytes) => {
                self.counters.inner.deleted.fetch_add(1, Ordering::SeqCst);
                self.counters
                    .inner
                    .live_bytes
                    .fetch_sub(bytes as u64, Ordering::SeqCst);
            }
            None => warn!(id = texture.raw(), "delete of unknown texture"),
        }
    }
}
