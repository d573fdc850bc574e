//! Raw chunk access
//!
//! Reads and writes stored chunk bytes as-is: no filters, no conversion.
//! Useful for copying already-compressed data between files.

use crate::error::{ChunkError, Result};
use crate::layout::ChunkCoord;

use super::Dataset;

impl Dataset {
    /// Stored bytes and filter mask of one chunk
    ///
    /// A dirty cached copy is written back first so the bytes are current.
    pub fn read_chunk(&mut self, coord: &ChunkCoord) -> Result<(Vec<u8>, u32)> {
        self.layout.validate_coord(coord)?;
        self.flush_cached(coord)?;
        self.sync_header()?;

        let record = self.index.get(&self.file, coord)?;
        let Some(addr) = record.addr else {
            return Err(ChunkError::ChunkNotAllocated);
        };
        let mut raw = vec![0u8; record.nbytes as usize];
        self.file.read_at(addr, &mut raw)?;
        Ok((raw, record.filter_mask))
    }

    /// Store already-encoded bytes for one chunk
    ///
    /// `filter_mask` records which filters were skipped when `raw` was
    /// produced. Any cached copy is dropped without being written. Without
    /// filters `raw` must be exactly one chunk.
    pub fn write_chunk(&mut self, coord: &ChunkCoord, raw: &[u8], filter_mask: u32) -> Result<()> {
        self.check_writable()?;
        self.layout.validate_coord(coord)?;
        if self.pipeline.is_empty() && raw.len() != self.layout.chunk_bytes() {
            return Err(ChunkError::Selection(format!(
                "unfiltered chunk {} needs {} bytes, got {}",
                coord,
                self.layout.chunk_bytes(),
                raw.len()
            )));
        }

        let scaled = self.layout.scaled(coord);
        if let Some(handle) = self.cached(coord, &scaled) {
            self.cache.discard(handle);
        }

        let record = self
            .index
            .insert_or_resize(&self.file, coord, raw.len() as u64, filter_mask)?;
        match record.addr {
            Some(addr) => self.file.write_at(addr, raw)?,
            None => return Err(ChunkError::ChunkNotAllocated),
        }
        tracing::trace!("Raw write of {} bytes to chunk {}", raw.len(), coord);
        self.sync_header()
    }
}
