//! Cache statistics
//!
//! Diagnostic counters with no control-flow effect. Snapshots are taken
//! under the controller's mutex, so a snapshot is internally consistent.

/// Snapshot of cache activity and occupancy.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    /// Requests served from a resident surface
    pub hits: u64,

    /// Requests that created a new record
    pub misses: u64,

    /// Upload task graphs handed out
    pub tasks_issued: u64,

    /// Requests that joined an already in-flight upload task
    pub piggybacks: u64,

    /// Synchronous decodes taken because the budget had no room
    pub at_raster_decodes: u64,

    /// Records whose decode failed (sticky)
    pub decode_failures: u64,

    /// Surfaces released by eviction, orphaning or aggressive free
    pub surfaces_released: u64,

    /// Entries removed from the persistent cache by eviction
    pub records_evicted: u64,

    /// Records superseded by an incompatible variant
    pub records_orphaned: u64,

    /// Bytes currently charged against the budget
    pub bytes_used: usize,

    /// The budget's byte limit
    pub byte_limit: usize,

    /// Entries currently in the persistent cache
    pub item_count: usize,

    /// The budget's preferred item count
    pub preferred_item_limit: usize,
}

impl CacheStats {
    /// Fraction of resolved requests served from a resident surface
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses + self.piggybacks;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    /// Budget utilization (0.0 to 1.0)
    pub fn utilization(&self) -> f64 {
        if self.byte_limit == 0 {
            0.0
        } else {
            self.bytes_used as f64 / self.byte_limit as f64
        }
    }
}
