//! Chunk locking and write-back
//!
//! A chunk is "locked" for the duration of one transfer. Locking yields
//! the decoded bytes, either as a resident cache entry or, when the cache
//! cannot take it, as a private buffer that is written back on unlock.
//!
//! ```text
//! lock ──► cache hit? ── yes ──► entry.locked = true
//!            │
//!            no ──► bytes = overwrite ? zeros
//!                          : allocated ? read + reverse filters
//!                          : fill
//!                   │
//!                   └──► fits the cache? ── yes ──► evict slot occupant,
//!                                                   prune, insert locked
//!                                  no ──► Direct buffer
//! ```

use crate::cache::{CacheEntry, EntryHandle};
use crate::error::{ChunkError, Result};
use crate::filter::FilterPipeline;
use crate::index::{ChunkIndex, ChunkRecord};
use crate::layout::{ChunkCoord, ChunkLayout};
use crate::storage::StorageFile;

use super::Dataset;

// =============================================================================
// Backing Store
// =============================================================================

/// Everything needed to move decoded chunks to and from the file
pub(crate) struct Backing<'a> {
    pub file: &'a StorageFile,
    pub index: &'a mut ChunkIndex,
    pub pipeline: &'a FilterPipeline,
    pub layout: &'a ChunkLayout,
    pub filter_partial_edges: bool,
}

impl Backing<'_> {
    /// Encode and write one decoded chunk
    ///
    /// `addr` and `nbytes` describe the chunk's current block, if any.
    pub fn store(
        &mut self,
        coord: &ChunkCoord,
        buf: &[u8],
        addr: Option<u64>,
        nbytes: u64,
    ) -> Result<ChunkRecord> {
        if self.pipeline.is_empty() {
            // The block is only reused when it already holds a whole chunk
            if let Some(addr) = addr.filter(|_| nbytes == buf.len() as u64) {
                self.file.write_at(addr, buf)?;
                return Ok(ChunkRecord {
                    coord: coord.clone(),
                    addr: Some(addr),
                    nbytes: buf.len() as u64,
                    filter_mask: 0,
                });
            }
            let record = self.index.insert_or_resize(self.file, coord, buf.len() as u64, 0)?;
            self.write_record(&record, buf)?;
            return Ok(record);
        }

        if skips_filters(self.layout, self.pipeline, self.filter_partial_edges, coord) {
            let record = self.index.insert_or_resize(
                self.file,
                coord,
                buf.len() as u64,
                self.pipeline.all_skipped(),
            )?;
            self.write_record(&record, buf)?;
            return Ok(record);
        }

        let (encoded, mask) = self.pipeline.forward(buf, self.layout.elem_size())?;
        let record = self
            .index
            .insert_or_resize(self.file, coord, encoded.len() as u64, mask)?;
        self.write_record(&record, &encoded)?;
        Ok(record)
    }

    fn write_record(&self, record: &ChunkRecord, bytes: &[u8]) -> Result<()> {
        match record.addr {
            Some(addr) => self.file.write_at(addr, bytes),
            None => Err(ChunkError::ChunkNotAllocated),
        }
    }

    /// Write back a cache entry and record where it went
    pub fn flush_entry(&mut self, entry: &mut CacheEntry) -> Result<()> {
        let record = self.store(&entry.coord, &entry.buf, entry.addr, entry.nbytes)?;
        entry.addr = record.addr;
        entry.nbytes = record.nbytes;
        entry.filter_mask = record.filter_mask;
        Ok(())
    }

    /// Read an allocated chunk and undo its filters
    pub fn load(&self, record: &ChunkRecord) -> Result<Vec<u8>> {
        let Some(addr) = record.addr else {
            return Err(ChunkError::ChunkNotAllocated);
        };
        let mut raw = vec![0u8; record.nbytes as usize];
        self.file.read_at(addr, &mut raw)?;

        let chunk_bytes = self.layout.chunk_bytes();
        let decoded = if self.pipeline.is_empty() {
            raw
        } else {
            self.pipeline
                .reverse(raw, record.filter_mask, self.layout.elem_size())?
        };
        if decoded.len() != chunk_bytes {
            return Err(ChunkError::Filter(format!(
                "chunk {} decoded to {} bytes, expected {}",
                record.coord,
                decoded.len(),
                chunk_bytes
            )));
        }
        Ok(decoded)
    }
}

/// Partial edge chunks bypass the pipeline when edge filtering is off
fn skips_filters(
    layout: &ChunkLayout,
    pipeline: &FilterPipeline,
    filter_partial_edges: bool,
    coord: &ChunkCoord,
) -> bool {
    !filter_partial_edges && !pipeline.is_empty() && layout.is_partial_edge(&layout.scaled(coord))
}

// =============================================================================
// Locked Chunks
// =============================================================================

/// A chunk held outside the cache
pub(crate) struct DirectChunk {
    pub coord: ChunkCoord,
    pub addr: Option<u64>,
    pub nbytes: u64,
    pub buf: Vec<u8>,
}

/// Result of [`Dataset::lock_chunk`]
pub(crate) enum LockedChunk {
    Cached(EntryHandle),
    Direct(DirectChunk),
}

impl Dataset {
    /// Cache slot for a chunk, or `None` with the cache disabled
    pub(crate) fn slot_of(&self, scaled: &[u64]) -> Option<usize> {
        self.cache
            .is_enabled()
            .then(|| self.layout.hash_slot(scaled, self.cache.nslots()))
    }

    /// Whether this chunk is stored without running the filters
    pub(crate) fn skips_filters(&self, coord: &ChunkCoord) -> bool {
        skips_filters(&self.layout, &self.pipeline, self.filter_partial_edges, coord)
    }

    /// Resident entry for a chunk, without touching the hit counters
    pub(crate) fn cached(&self, coord: &ChunkCoord, scaled: &[u64]) -> Option<EntryHandle> {
        let slot = self.slot_of(scaled)?;
        self.cache.find(slot, coord)
    }

    /// Whether a transfer of this chunk should go through the cache
    ///
    /// Filtered chunks always do since they can only be handled whole. In
    /// parallel mode unfiltered writers bypass it so no process holds stale
    /// copies. A chunk too large for the cache only goes through it when a
    /// write must first materialize fill.
    pub(crate) fn is_cacheable(&self, record: &ChunkRecord, write: bool) -> bool {
        if !self.pipeline.is_empty() {
            return true;
        }
        if self.transport.is_parallel() && self.file.is_writable() {
            return false;
        }
        if self.layout.chunk_bytes() > self.cache.nbytes_max() {
            return write && !record.is_allocated() && self.fill.reads_as_fill();
        }
        true
    }

    /// Make a chunk's decoded bytes available for one transfer
    ///
    /// With `overwrite` the caller replaces every byte, so nothing is read.
    pub(crate) fn lock_chunk(
        &mut self,
        coord: &ChunkCoord,
        scaled: &[u64],
        record: &ChunkRecord,
        overwrite: bool,
    ) -> Result<LockedChunk> {
        let slot = self.slot_of(scaled);
        if let Some(slot) = slot {
            if let Some(handle) = self.cache.lookup(slot, coord) {
                if let Some(entry) = self.cache.get_mut(handle) {
                    entry.locked = true;
                }
                return Ok(LockedChunk::Cached(handle));
            }
        }

        // Step 1: Produce the bytes
        let chunk_bytes = self.layout.chunk_bytes();
        let elem = self.layout.elem_size();
        let buf = if overwrite {
            vec![0u8; chunk_bytes]
        } else if record.is_allocated() {
            let (_, backing) = self.parts();
            backing.load(record)?
        } else {
            self.cache.record_init();
            if self.fill.reads_as_fill() {
                self.fill.buffer(elem, self.layout.chunk_nelmts())
            } else {
                vec![0u8; chunk_bytes]
            }
        };

        // Step 2: Try to make it resident
        let buf = match slot {
            Some(slot) if chunk_bytes <= self.cache.nbytes_max() => {
                match self.try_insert(slot, coord, scaled, record, buf)? {
                    Ok(handle) => return Ok(LockedChunk::Cached(handle)),
                    Err(buf) => buf,
                }
            }
            _ => buf,
        };

        tracing::trace!("Chunk {} bypasses the cache", coord);
        Ok(LockedChunk::Direct(DirectChunk {
            coord: coord.clone(),
            addr: record.addr,
            nbytes: record.nbytes,
            buf,
        }))
    }

    /// Evict the slot's occupant, prune for room and insert a locked entry
    ///
    /// Hands the buffer back when the occupant is itself locked or the
    /// budget cannot be met.
    fn try_insert(
        &mut self,
        slot: usize,
        coord: &ChunkCoord,
        scaled: &[u64],
        record: &ChunkRecord,
        buf: Vec<u8>,
    ) -> Result<std::result::Result<EntryHandle, Vec<u8>>> {
        let (cache, mut backing) = self.parts();
        let mut flush = |entry: &mut CacheEntry| backing.flush_entry(entry);

        if let Some(occupant) = cache.occupant(slot) {
            if cache.get(occupant).is_some_and(|e| e.locked) {
                return Ok(Err(buf));
            }
            cache.evict(occupant, &mut flush)?;
        }
        cache.prune(buf.len(), &mut flush)?;
        if cache.nbytes_used() + buf.len() > cache.nbytes_max() {
            return Ok(Err(buf));
        }

        let mut entry = CacheEntry::new(
            coord.clone(),
            scaled.to_vec(),
            record.addr,
            record.nbytes,
            record.filter_mask,
            buf,
        );
        entry.locked = true;
        cache.insert(slot, entry).map(Ok)
    }

    /// Release a locked chunk
    ///
    /// `nbytes` is how much of the chunk the transfer touched. Cached
    /// entries only become dirty; direct buffers are written through.
    pub(crate) fn unlock_chunk(
        &mut self,
        locked: LockedChunk,
        dirty: bool,
        nbytes: usize,
        write: bool,
    ) -> Result<()> {
        match locked {
            LockedChunk::Cached(handle) => {
                if let Some(entry) = self.cache.get_mut(handle) {
                    entry.locked = false;
                    entry.dirty |= dirty;
                    entry.record_access(nbytes, write);
                }
                Ok(())
            }
            LockedChunk::Direct(chunk) => {
                if dirty {
                    let (_, mut backing) = self.parts();
                    backing.store(&chunk.coord, &chunk.buf, chunk.addr, chunk.nbytes)?;
                }
                Ok(())
            }
        }
    }

    /// Decoded bytes behind a lock
    pub(crate) fn locked_buf<'a>(&'a self, locked: &'a LockedChunk) -> Result<&'a [u8]> {
        match locked {
            LockedChunk::Cached(handle) => self
                .cache
                .get(*handle)
                .map(|e| e.buf.as_slice())
                .ok_or_else(|| ChunkError::Resource("locked cache entry vanished".into())),
            LockedChunk::Direct(chunk) => Ok(&chunk.buf),
        }
    }

    pub(crate) fn locked_buf_mut<'a>(&'a mut self, locked: &'a mut LockedChunk) -> Result<&'a mut [u8]> {
        match locked {
            LockedChunk::Cached(handle) => self
                .cache
                .get_mut(*handle)
                .map(|e| e.buf.as_mut_slice())
                .ok_or_else(|| ChunkError::Resource("locked cache entry vanished".into())),
            LockedChunk::Direct(chunk) => Ok(&mut chunk.buf),
        }
    }

    /// Mark entries of chunks that left the extent; they are never written back
    pub(crate) fn mark_deleted_outside_extent(&mut self) {
        for handle in self.cache.handles() {
            let outside = self
                .cache
                .get(handle)
                .is_some_and(|e| !self.layout.is_inside_extent(&e.scaled));
            if outside {
                if let Some(entry) = self.cache.get_mut(handle) {
                    entry.deleted = true;
                }
            }
        }
    }

    /// Drop entries marked deleted
    pub(crate) fn evict_deleted(&mut self) {
        for handle in self.cache.handles() {
            if self.cache.get(handle).is_some_and(|e| e.deleted && !e.locked) {
                self.cache.discard(handle);
            }
        }
    }

    /// Flush dirty entries and re-slot the cache after the extent changed
    pub(crate) fn rehash_cache(&mut self) -> Result<()> {
        let nslots = self.cache.nslots();
        let (cache, mut backing) = self.parts();
        let layout = backing.layout;
        let mut flush = |entry: &mut CacheEntry| backing.flush_entry(entry);
        cache.rehash(|e| layout.hash_slot(&e.scaled, nslots), &mut flush)
    }
}
