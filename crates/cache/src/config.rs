//! Cache configuration
//!
//! Byte limit, preferred item count and cache mode, with programmatic
//! builders and optional environment overrides.

use std::env;

/// Whether uploads produce CPU-wrapped bitmaps or GPU textures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMode {
    /// Surfaces wrap the decoded pixels directly
    Cpu,
    /// Surfaces are textures owned by the graphics backend
    Gpu,
}

/// Configuration for the image cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Hard byte limit for budgeted surfaces
    pub byte_limit: usize,
    /// Soft guideline for the persistent cache's entry count
    pub preferred_item_limit: usize,
    /// CPU or GPU upload mode
    pub mode: CacheMode,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            byte_limit: 256 * 1024 * 1024, // 256 MB
            preferred_item_limit: 1000,
            mode: CacheMode::Gpu,
        }
    }
}

impl CacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the byte limit in megabytes
    pub fn with_byte_limit_mb(mut self, mb: usize) -> Self {
        self.byte_limit = mb * 1024 * 1024;
        self
    }

    /// Set the byte limit in bytes
    pub fn with_byte_limit(mut self, bytes: usize) -> Self {
        self.byte_limit = bytes;
        self
    }

    /// Set the preferred item count
    pub fn with_preferred_item_limit(mut self, items: usize) -> Self {
        self.preferred_item_limit = items;
        self
    }

    /// Set the cache mode
    pub fn with_mode(mut self, mode: CacheMode) -> Self {
        self.mode = mode;
        self
    }

    /// Apply environment overrides: `RASTERLINE_CACHE_MB` for the byte
    /// limit and `RASTERLINE_CACHE_ITEMS` for the preferred item count.
    /// Unparseable values are ignored.
    pub fn from_env(mut self) -> Self {
        if let Ok(value) = env::var("RASTERLINE_CACHE_MB") {
            if let Ok(mb) = value.parse::<usize>() {
                self.byte_limit = mb * 1024 * 1024;
            }
        }
        if let Ok(value) = env::var("RASTERLINE_CACHE_ITEMS") {
            if let Ok(items) = value.parse::<usize>() {
                self.preferred_item_limit = items;
            }
        }
        self
    }
}
