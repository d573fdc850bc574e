//! Chunk Cache
//!
//! Bounded pool of decoded chunk buffers owned by one dataset handle.
//!
//! ## Structure
//! ```text
//!   slots (direct-mapped, one entry per slot)
//!   ┌───┬───┬───┬───┬───┬───┐
//!   │ . │ 3 │ . │ 0 │ . │ 1 │ ──► arena indices
//!   └───┴───┴───┴───┴───┴───┘
//!
//!   recency list:  head ⇄ 0 ⇄ 3 ⇄ 1 ⇄ tail
//!                  (evict from here)   (new entries land here)
//! ```
//! Entries live in an arena and are addressed by generation-checked
//! [`EntryHandle`]s, so a handle to an evicted entry resolves to `None`
//! instead of aliasing whatever reused the arena slot.
//!
//! ## Eviction
//! Two cursors walk the list from the head while the budget is exceeded:
//! - cursor A evicts entries whose pending read or write accounting is
//!   exhausted (fully read, fully written)
//! - cursor B starts `nused * w0` steps later and evicts anything unlocked
//!
//! Dirty entries are flushed through a caller-supplied closure on the way
//! out; the cache itself never touches the file.

mod entry;
mod pool;

pub use entry::CacheEntry;
pub use pool::ChunkCache;

/// Generation-checked reference into the cache arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryHandle {
    index: usize,
    generation: u64,
}

/// Cache counters, cumulative for the life of the handle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Entries created from fill instead of a disk read
    pub inits: u64,
    /// Dirty entries written back
    pub flushes: u64,
    pub evictions: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            0.0
        } else {
            self.hits as f64 / lookups as f64
        }
    }
}
