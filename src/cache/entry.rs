//! Cache entries

use crate::layout::ChunkCoord;

/// One resident decoded chunk
#[derive(Debug)]
pub struct CacheEntry {
    pub coord: ChunkCoord,
    pub scaled: Vec<u64>,

    /// On-disk location, `None` until first flushed
    pub addr: Option<u64>,
    /// Stored (filtered) length
    pub nbytes: u64,
    pub filter_mask: u32,

    /// Decoded chunk, always `chunk_bytes` long
    pub buf: Vec<u8>,

    pub dirty: bool,
    /// Dropped without writing when evicted (chunk was pruned)
    pub deleted: bool,
    /// An I/O operation is in flight; never evicted while set
    pub locked: bool,

    /// Bytes not yet read / written since the entry was loaded
    pub rd_count: usize,
    pub wr_count: usize,

    pub(super) slot: usize,
    pub(super) prev: Option<usize>,
    pub(super) next: Option<usize>,
}

impl CacheEntry {
    pub fn new(
        coord: ChunkCoord,
        scaled: Vec<u64>,
        addr: Option<u64>,
        nbytes: u64,
        filter_mask: u32,
        buf: Vec<u8>,
    ) -> Self {
        let size = buf.len();
        Self {
            coord,
            scaled,
            addr,
            nbytes,
            filter_mask,
            buf,
            dirty: false,
            deleted: false,
            locked: false,
            rd_count: size,
            wr_count: size,
            slot: 0,
            prev: None,
            next: None,
        }
    }

    /// Hash slot the entry occupies
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Charge an access against the pending counters
    pub fn record_access(&mut self, nbytes: usize, write: bool) {
        if write {
            self.wr_count = self.wr_count.saturating_sub(nbytes);
        } else {
            self.rd_count = self.rd_count.saturating_sub(nbytes);
        }
    }

    /// Fully read, fully written, or both: unlikely to be touched again soon
    pub(super) fn fully_accessed(&self) -> bool {
        let size = self.buf.len();
        (self.rd_count == 0 && self.wr_count == 0)
            || (self.rd_count == 0 && self.wr_count == size)
            || (self.rd_count == size && self.wr_count == 0)
    }
}
