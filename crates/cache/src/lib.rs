//! Rasterline Cache Library
//!
//! The image decode/upload cache: turns an opaque, possibly oversized
//! source image into a ready-to-draw raster resource (CPU bitmap or GPU
//! texture) at a requested sub-region, scale and filter quality, and
//! shares that resource across draw calls and frames.
//!
//! Two tiers with different lifetime policies back the cache: a bounded
//! LRU map keyed by source-image identity that survives the reference
//! count reaching zero, and an in-use map keyed by canonical variant key
//! that dies the instant its last reference is released. Work is split
//! into a decode task (any worker thread) and an upload task (the single
//! raster thread), with a synchronous at-raster fallback when the byte
//! budget has no room to admit the work ahead of time.

pub mod budget;
pub mod config;
pub mod controller;
pub mod key;
pub mod stats;
pub mod tasks;

mod record;

pub use budget::BudgetTracker;
pub use config::{CacheConfig, CacheMode};
pub use controller::{DecodedDrawImage, ImageCache, RecordMemoryEntry, TaskIssueResult};
pub use key::ImageKey;
pub use stats::CacheStats;
pub use tasks::{DecodeTask, TracingInfo, UploadTask};
