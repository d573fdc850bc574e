//! Chunk lifecycle: allocation, pruning, extent changes, copy and delete
//!
//! Both `allocate` and `prune` visit only the chunks affected by an extent
//! change. For each dimension in turn they walk the band of chunks between
//! the old and new boundary, then narrow that dimension's range so the
//! next pass does not revisit the band.
//!
//! ```text
//!  grow 2-D, old = 2x2 chunks, new = 3x3 chunks
//!
//!   ┌───┬───┬───┐
//!   │   │   │ 1 │   pass 1 (dim 0): row 2, all columns
//!   ├───┼───┼───┤   pass 2 (dim 1): column 2, rows 0..=1
//!   │   │   │ 1 │
//!   ├───┼───┼───┤
//!   │ 0 │ 0 │ 0 │
//!   └───┴───┴───┘
//! ```

use std::sync::Arc;

use crate::config::Config;
use crate::error::{ChunkError, Result};
use crate::storage::StorageFile;

use super::header::DatasetHeader;
use super::io::convert_one;
use super::{AllocTime, CopyOptions, Dataset, DatasetOptions};

impl Dataset {
    // =========================================================================
    // Extent Changes
    // =========================================================================

    /// Change the current dimensions
    ///
    /// Steps:
    /// 1. Check the new dims against the max dims
    /// 2. Mark cached chunks that fall outside and re-slot the cache
    /// 3. Prune on shrink
    /// 4. Allocate on growth when allocation is early
    /// 5. Persist the header
    pub fn set_extent(&mut self, new_dims: &[u64]) -> Result<()> {
        self.check_writable()?;

        // Step 1: Validate and apply
        let old_dims = self.space.dims().to_vec();
        self.space.set_dims(new_dims)?;
        self.layout.set_extent(&self.space);

        // Step 2: Cache
        self.mark_deleted_outside_extent();
        self.rehash_cache()?;

        // Step 3: Shrink
        if new_dims.iter().zip(&old_dims).any(|(n, o)| n < o) {
            self.prune(&old_dims)?;
        }

        // Step 4: Grow
        if self.alloc_time == AllocTime::Early && new_dims.iter().zip(&old_dims).any(|(n, o)| n > o) {
            self.allocate(&old_dims)?;
        }

        // Step 5: Header
        self.persist_header()?;
        tracing::debug!("Extent changed from {:?} to {:?}", old_dims, new_dims);
        Ok(())
    }

    // =========================================================================
    // Allocate
    // =========================================================================

    /// Allocate every chunk inside the current extent that lies outside
    /// `old_dims`, writing fill where it materializes or filters exist
    ///
    /// Passing all zeros allocates the whole extent. Chunks that already
    /// have storage are left alone.
    pub fn allocate(&mut self, old_dims: &[u64]) -> Result<()> {
        self.check_writable()?;
        let rank = self.layout.rank();
        if old_dims.len() != rank {
            return Err(ChunkError::Selection(format!(
                "old extent has rank {}, dataset rank is {}",
                old_dims.len(),
                rank
            )));
        }

        let dims = self.space.dims().to_vec();
        if dims.iter().any(|&d| d == 0) {
            self.index.reset_last();
            return Ok(());
        }

        let chunk_dims = self.layout.chunk_dims().to_vec();
        let elem = self.layout.elem_size();
        let parallel = self.transport.is_parallel();

        // Step 1: One fill image for every chunk, filtered once
        let should_fill = self.fill.materializes() || !self.pipeline.is_empty();
        let write_fill = should_fill && (!parallel || self.transport.rank() == 0);
        let raw = if should_fill {
            self.fill.buffer(elem, self.layout.chunk_nelmts())
        } else {
            Vec::new()
        };
        let filtered = if should_fill && !self.pipeline.is_empty() {
            Some(self.pipeline.forward(&raw, elem)?)
        } else {
            None
        };
        let chunk_bytes = self.layout.chunk_bytes() as u64;

        // Step 2: Walk each dimension's band of new chunks
        let min: Vec<u64> = (0..rank).map(|d| old_dims[d].div_ceil(chunk_dims[d])).collect();
        let mut max: Vec<u64> = (0..rank).map(|d| (dims[d] - 1) / chunk_dims[d]).collect();
        let mut nallocated = 0usize;

        for op in 0..rank {
            if min[op] > max[op] {
                continue;
            }

            let mut scaled = vec![0u64; rank];
            scaled[op] = min[op];
            loop {
                let coord = self.layout.coord_from_scaled(&scaled);
                let record = self.index.get(&self.file, &coord)?;
                if !record.is_allocated() {
                    let (image, mask) = match &filtered {
                        Some(_) if self.skips_filters(&coord) => {
                            (raw.as_slice(), self.pipeline.all_skipped())
                        }
                        Some((image, mask)) => (image.as_slice(), *mask),
                        None => (raw.as_slice(), 0),
                    };
                    let nbytes = if should_fill { image.len() as u64 } else { chunk_bytes };
                    let record = self.index.insert_or_resize(&self.file, &coord, nbytes, mask)?;
                    if write_fill {
                        if let Some(addr) = record.addr {
                            self.file.write_at(addr, image)?;
                        }
                    }
                    nallocated += 1;
                }

                if !advance(&mut scaled, op, &min, &max) {
                    break;
                }
            }

            if min[op] == 0 {
                break;
            }
            max[op] = min[op] - 1;
        }

        // Step 3: Everyone waits for rank 0's fill
        if parallel && should_fill {
            self.transport.barrier()?;
        }

        self.index.reset_last();
        self.sync_header()?;
        tracing::debug!("Allocated {} chunks (fill={})", nallocated, write_fill);
        Ok(())
    }

    // =========================================================================
    // Prune
    // =========================================================================

    /// Drop chunks left wholly outside the current extent after a shrink
    /// from `old_dims`, and reset to fill the parts of edge chunks that
    /// fell outside
    pub fn prune(&mut self, old_dims: &[u64]) -> Result<()> {
        self.check_writable()?;
        let rank = self.layout.rank();
        if old_dims.len() != rank {
            return Err(ChunkError::Selection(format!(
                "old extent has rank {}, dataset rank is {}",
                old_dims.len(),
                rank
            )));
        }
        if old_dims.iter().any(|&d| d == 0) {
            self.index.reset_last();
            return Ok(());
        }

        let dims = self.space.dims().to_vec();
        let chunk_dims = self.layout.chunk_dims().to_vec();
        self.mark_deleted_outside_extent();

        // Step 1: Per-dimension bounds
        let shrunk: Vec<bool> = (0..rank).map(|d| dims[d] < old_dims[d]).collect();
        let mut max_mod: Vec<u64> = (0..rank).map(|d| (old_dims[d] - 1) / chunk_dims[d]).collect();
        // Last chunk index still (partly) inside; -1 when the dim is now empty
        let max_fill: Vec<i64> = (0..rank)
            .map(|d| {
                if dims[d] == 0 {
                    -1
                } else {
                    ((dims[d].min(old_dims[d]) - 1) / chunk_dims[d]) as i64
                }
            })
            .collect();
        let min_mod: Vec<u64> = (0..rank).map(|d| dims[d] / chunk_dims[d]).collect();
        let fill_dim: Vec<bool> = (0..rank)
            .map(|d| shrunk[d] && min_mod[d] as i64 == max_fill[d])
            .collect();

        let (mut nfilled, mut nremoved) = (0usize, 0usize);

        // Step 2: Walk each shrunk dimension's band
        for op in 0..rank {
            if !shrunk[op] {
                continue;
            }

            let mut scaled = vec![0u64; rank];
            scaled[op] = min_mod[op];
            let mut outside: Vec<bool> = (0..rank).map(|d| scaled[d] as i64 > max_fill[d]).collect();
            let mut noutside = outside.iter().filter(|&&o| o).count();

            loop {
                if noutside == 0 {
                    if self.prune_fill(&scaled)? {
                        nfilled += 1;
                    }
                } else if self.prune_remove(&scaled)? {
                    nremoved += 1;
                }

                // Increment with carry, tracking which dims sit outside
                let mut carry = true;
                for d in (0..rank).rev() {
                    scaled[d] += 1;
                    if scaled[d] > max_mod[d] {
                        if d == op {
                            scaled[d] = min_mod[d];
                            if outside[d] && fill_dim[d] {
                                outside[d] = false;
                                noutside -= 1;
                            }
                        } else {
                            scaled[d] = 0;
                            if outside[d] && max_fill[d] >= 0 {
                                outside[d] = false;
                                noutside -= 1;
                            }
                        }
                    } else {
                        if !outside[d] && scaled[d] as i64 > max_fill[d] {
                            outside[d] = true;
                            noutside += 1;
                        }
                        carry = false;
                        break;
                    }
                }
                if carry {
                    break;
                }
            }

            if min_mod[op] == 0 {
                break;
            }
            max_mod[op] = min_mod[op] - 1;
        }

        // Step 3: Whatever was marked and not visited goes too
        self.evict_deleted();
        self.index.reset_last();
        self.sync_header()?;
        tracing::debug!(
            "Pruned to {:?}: {} chunks removed, {} edge chunks refilled",
            dims,
            nremoved,
            nfilled
        );
        Ok(())
    }

    /// Reset the part of an edge chunk that lies outside the new extent
    fn prune_fill(&mut self, scaled: &[u64]) -> Result<bool> {
        let coord = self.layout.coord_from_scaled(scaled);
        let record = self.index.get(&self.file, &coord)?;
        if !record.is_allocated() && self.cached(&coord, scaled).is_none() {
            return Ok(false);
        }

        let chunk_dims = self.layout.chunk_dims().to_vec();
        let keep: Vec<u64> = (0..chunk_dims.len())
            .map(|d| chunk_dims[d].min(self.space.dims()[d] - coord.offsets()[d]))
            .collect();
        let elem = self.layout.elem_size();
        let pattern = self.fill.pattern(elem);

        let mut locked = self.lock_chunk(&coord, scaled, &record, false)?;
        let result = self
            .locked_buf_mut(&mut locked)
            .map(|chunk| fill_outside(chunk, &chunk_dims, &keep, &pattern));
        let filled = *result.as_ref().unwrap_or(&0);
        self.unlock_chunk(locked, result.is_ok(), filled * elem, true)?;
        result.map(|_| true)
    }

    /// Evict a chunk without writing it back and free its storage
    fn prune_remove(&mut self, scaled: &[u64]) -> Result<bool> {
        let coord = self.layout.coord_from_scaled(scaled);
        if let Some(handle) = self.cached(&coord, scaled) {
            self.cache.discard(handle);
        }
        let record = self.index.get(&self.file, &coord)?;
        if !record.is_allocated() {
            return Ok(false);
        }
        self.index.remove(&self.file, &coord)?;
        Ok(true)
    }

    // =========================================================================
    // Delete / Copy
    // =========================================================================

    /// Free every chunk, the index and the header
    ///
    /// Cached data is dropped without being written.
    pub fn delete(mut self) -> Result<()> {
        self.check_writable()?;
        self.cache.discard_all();

        let Dataset {
            file,
            header_addr,
            header_capacity,
            index,
            ..
        } = self;
        index.delete_all(&file)?;
        DatasetHeader::free(&file, header_addr, header_capacity)?;
        if file.root() == Some(header_addr) {
            file.set_root(None)?;
        }
        tracing::info!("Deleted dataset at {}", header_addr);
        Ok(())
    }

    /// Copy this dataset into `dest`, optionally converting every element
    ///
    /// Steps:
    /// 1. Flush the source cache so the index is complete
    /// 2. Create the destination with the same chunk shape and filters
    /// 3. Copy each allocated chunk: raw bytes when no conversion is given,
    ///    otherwise decode, convert and re-encode
    pub fn copy_to(
        &mut self,
        dest: Arc<StorageFile>,
        options: &CopyOptions<'_>,
        config: &Config,
    ) -> Result<Dataset> {
        // Step 1: Source
        self.flush_cache()?;
        self.sync_header()?;
        let elem = self.layout.elem_size();

        // Step 2: Destination
        let mut fill = self.fill.clone();
        let dest_elem = match options.conversion {
            Some(conv) => {
                if conv.src_size() != elem {
                    return Err(ChunkError::Conversion(format!(
                        "conversion source size {} does not match element size {}",
                        conv.src_size(),
                        elem
                    )));
                }
                if let Some(value) = fill.value.take() {
                    fill.value = Some(convert_one(conv, value)?);
                }
                conv.dst_size()
            }
            None => elem,
        };
        let mut builder = DatasetOptions::builder(
            &self.layout.chunk_dims().iter().map(|&d| d as u32).collect::<Vec<_>>(),
            dest_elem,
        )
        .index(options.index.unwrap_or_else(|| self.index.kind()))
        .fill(fill)
        .filter_partial_edges(self.filter_partial_edges);
        for filter in self.pipeline.descriptors() {
            builder = builder.filter(filter);
        }
        let mut copy = Dataset::create(dest, self.space.clone(), builder.build(), config)?;
        // Chunks are copied below; only record the policy
        copy.alloc_time = self.alloc_time;

        // Step 3: Chunks
        let records = self.index.records(&self.file)?.collect::<Result<Vec<_>>>()?;
        let nchunks = records.len();
        for record in records {
            let Some(addr) = record.addr else { continue };
            let mut raw = vec![0u8; record.nbytes as usize];
            self.file.read_at(addr, &mut raw)?;

            match options.conversion {
                None => {
                    let placed = copy.index.insert_or_resize(
                        &copy.file,
                        &record.coord,
                        record.nbytes,
                        record.filter_mask,
                    )?;
                    if let Some(dst) = placed.addr {
                        copy.file.write_at(dst, &raw)?;
                    }
                }
                Some(conv) => {
                    let n = self.layout.chunk_nelmts();
                    let decoded = if self.pipeline.is_empty() {
                        raw
                    } else {
                        self.pipeline.reverse(raw, record.filter_mask, elem)?
                    };
                    let mut stage = decoded;
                    stage.resize(n * conv.src_size().max(conv.dst_size()), 0);
                    let mut background = conv.needs_background().then(|| vec![0u8; n * conv.dst_size()]);
                    conv.convert(n, &mut stage, background.as_deref_mut())?;
                    stage.truncate(n * conv.dst_size());

                    let (_, mut backing) = copy.parts();
                    backing.store(&record.coord, &stage, None, 0)?;
                }
            }
        }

        copy.persist_header()?;
        tracing::debug!(
            "Copied {} chunks from dataset {} to {}",
            nchunks,
            self.header_addr,
            copy.header_addr
        );
        Ok(copy)
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Advance a band walk; returns false once the band is exhausted
///
/// Dimensions other than `op` run from 0; `op` runs from its band start.
fn advance(scaled: &mut [u64], op: usize, min: &[u64], max: &[u64]) -> bool {
    for d in (0..scaled.len()).rev() {
        scaled[d] += 1;
        if scaled[d] <= max[d] {
            return true;
        }
        scaled[d] = if d == op { min[d] } else { 0 };
    }
    false
}

/// Write `pattern` into every element outside the box `[0, keep)`;
/// returns how many elements were filled
fn fill_outside(chunk: &mut [u8], chunk_dims: &[u64], keep: &[u64], pattern: &[u8]) -> usize {
    let elem = pattern.len();
    let rank = chunk_dims.len();
    let row_len = chunk_dims[rank - 1] as usize;
    let keep_last = keep[rank - 1] as usize;
    let nrows = chunk.len() / (row_len * elem);

    let mut filled = 0usize;
    let mut row_index = vec![0u64; rank - 1];
    for row in 0..nrows {
        let inside = row_index.iter().zip(keep).all(|(&i, &k)| i < k);
        let start = if inside { keep_last } else { 0 };
        let base = row * row_len * elem;
        for slot in chunk[base + start * elem..base + row_len * elem].chunks_exact_mut(elem) {
            slot.copy_from_slice(pattern);
        }
        filled += row_len - start;

        // Next row, fastest outer dimension last
        for d in (0..rank - 1).rev() {
            row_index[d] += 1;
            if row_index[d] < chunk_dims[d] {
                break;
            }
            row_index[d] = 0;
        }
    }
    filled
}
