//! Dataset Layout
//!
//! Chunk geometry shared by the index, the cache and the I/O path.
//!
//! ## Coordinates
//! ```text
//! element offset   (e0, e1, ..., eN-1)
//! chunk coord      (c0, c1, ..., cN-1, 0)    ci = multiple of chunk_dims[i]
//! scaled coord     (s0, s1, ..., sN-1)       si = ci / chunk_dims[i]
//! linear index     sum(si * down_chunks[i])  row-major over chunks
//! ```
//! The trailing 0 is the synthetic element dimension; its extent is the
//! element size in bytes.

use std::fmt;

use crate::error::{ChunkError, Result};
use crate::selection::Dataspace;

/// Highest supported dataset rank
pub const MAX_RANK: usize = 32;

// =============================================================================
// Chunk Coordinate
// =============================================================================

/// Chunk-aligned element offsets plus the trailing element-dimension 0
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkCoord(Vec<u64>);

impl ChunkCoord {
    /// Build from the N real-dimension offsets
    pub fn new(offsets: &[u64]) -> Self {
        let mut v = Vec::with_capacity(offsets.len() + 1);
        v.extend_from_slice(offsets);
        v.push(0);
        Self(v)
    }

    /// Build from an N+1 tuple as stored on disk
    pub(crate) fn from_raw(raw: Vec<u64>) -> Self {
        debug_assert!(raw.last() == Some(&0));
        Self(raw)
    }

    /// Real-dimension offsets (without the element dimension)
    pub fn offsets(&self) -> &[u64] {
        &self.0[..self.0.len() - 1]
    }

    /// All N+1 entries
    pub fn as_raw(&self) -> &[u64] {
        &self.0
    }

    pub fn rank(&self) -> usize {
        self.0.len() - 1
    }
}

impl fmt::Display for ChunkCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, v) in self.offsets().iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{v}")?;
        }
        write!(f, ")")
    }
}

// =============================================================================
// Chunk Layout
// =============================================================================

#[derive(Debug, Clone)]
pub struct ChunkLayout {
    /// Chunk extent per real dimension (fixed at creation)
    chunk_dims: Vec<u64>,
    elem_size: usize,
    chunk_nelmts: usize,

    /// Current dataset extent
    dims: Vec<u64>,
    /// Chunks per dimension covering the current extent
    chunks: Vec<u64>,
    down_chunks: Vec<u64>,
    /// Chunks per dimension covering the max extent (u64::MAX if unlimited)
    max_chunks: Vec<u64>,
    max_down_chunks: Vec<u64>,

    /// Bits needed per dimension to encode a scaled coordinate, for hashing
    encode_bits: Vec<u32>,
}

impl ChunkLayout {
    pub fn new(chunk_dims: &[u32], elem_size: usize, space: &Dataspace) -> Result<Self> {
        let rank = chunk_dims.len();
        if rank == 0 || rank > MAX_RANK {
            return Err(ChunkError::Config(format!(
                "chunked datasets need rank 1..={MAX_RANK}, got {rank}"
            )));
        }
        if rank != space.rank() {
            return Err(ChunkError::Config(format!(
                "chunk rank {} does not match dataspace rank {}",
                rank,
                space.rank()
            )));
        }
        if chunk_dims.iter().any(|&d| d == 0) {
            return Err(ChunkError::Config("chunk dimensions must be non-zero".into()));
        }
        if elem_size == 0 {
            return Err(ChunkError::Config("element size must be non-zero".into()));
        }

        let chunk_nelmts = chunk_dims
            .iter()
            .try_fold(1u64, |acc, &d| acc.checked_mul(d as u64))
            .filter(|&n| n.saturating_mul(elem_size as u64) <= u32::MAX as u64)
            .ok_or_else(|| ChunkError::Config("chunk size must be below 4 GiB".into()))?;

        let mut layout = Self {
            chunk_dims: chunk_dims.iter().map(|&d| d as u64).collect(),
            elem_size,
            chunk_nelmts: chunk_nelmts as usize,
            dims: Vec::new(),
            chunks: Vec::new(),
            down_chunks: Vec::new(),
            max_chunks: Vec::new(),
            max_down_chunks: Vec::new(),
            encode_bits: Vec::new(),
        };
        layout.set_extent(space);
        Ok(layout)
    }

    /// Recompute the derived tables after an extent change
    pub(crate) fn set_extent(&mut self, space: &Dataspace) {
        let rank = self.rank();
        self.dims = space.dims().to_vec();
        self.chunks = (0..rank)
            .map(|d| self.dims[d].div_ceil(self.chunk_dims[d]))
            .collect();
        self.max_chunks = (0..rank)
            .map(|d| match space.max_dims()[d] {
                Some(m) => m.div_ceil(self.chunk_dims[d]),
                None => u64::MAX,
            })
            .collect();
        self.down_chunks = down_strides(&self.chunks);
        self.max_down_chunks = down_strides(&self.max_chunks);

        // Partial edge chunks count, so every chunk gets its own code
        self.encode_bits = self
            .chunks
            .iter()
            .map(|&n| if n <= 1 { 0 } else { 64 - (n - 1).leading_zeros() })
            .collect();
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn rank(&self) -> usize {
        self.chunk_dims.len()
    }

    pub fn chunk_dims(&self) -> &[u64] {
        &self.chunk_dims
    }

    pub fn elem_size(&self) -> usize {
        self.elem_size
    }

    pub fn chunk_nelmts(&self) -> usize {
        self.chunk_nelmts
    }

    /// Decoded chunk size in bytes
    pub fn chunk_bytes(&self) -> usize {
        self.chunk_nelmts * self.elem_size
    }

    pub fn dims(&self) -> &[u64] {
        &self.dims
    }

    /// Chunks per dimension for the current extent
    pub fn chunks(&self) -> &[u64] {
        &self.chunks
    }

    pub fn max_chunks(&self) -> &[u64] {
        &self.max_chunks
    }

    /// True when every dimension has a fixed maximum
    pub fn is_bounded(&self) -> bool {
        self.max_chunks.iter().all(|&n| n != u64::MAX)
    }

    /// Total chunk slots for the max extent (paged array capacity)
    pub fn max_nchunks(&self) -> Option<u64> {
        if !self.is_bounded() {
            return None;
        }
        self.max_chunks
            .iter()
            .try_fold(1u64, |acc, &n| acc.checked_mul(n))
    }

    /// Dataspace describing one chunk
    pub fn chunk_space(&self) -> Dataspace {
        Dataspace::simple(&self.chunk_dims)
    }

    // =========================================================================
    // Coordinate Conversions
    // =========================================================================

    pub fn scaled(&self, coord: &ChunkCoord) -> Vec<u64> {
        coord
            .offsets()
            .iter()
            .zip(&self.chunk_dims)
            .map(|(&o, &c)| o / c)
            .collect()
    }

    pub fn coord_from_scaled(&self, scaled: &[u64]) -> ChunkCoord {
        let offsets: Vec<u64> = scaled
            .iter()
            .zip(&self.chunk_dims)
            .map(|(&s, &c)| s * c)
            .collect();
        ChunkCoord::new(&offsets)
    }

    /// Scaled coordinate of the chunk holding an element
    pub fn scaled_of_element(&self, point: &[u64]) -> Vec<u64> {
        point
            .iter()
            .zip(&self.chunk_dims)
            .map(|(&p, &c)| p / c)
            .collect()
    }

    /// Check that `coord` is chunk-aligned and inside the current extent
    pub fn validate_coord(&self, coord: &ChunkCoord) -> Result<()> {
        if coord.rank() != self.rank() {
            return Err(ChunkError::Selection(format!(
                "chunk coordinate {} has rank {}, dataset rank is {}",
                coord,
                coord.rank(),
                self.rank()
            )));
        }
        for (d, &off) in coord.offsets().iter().enumerate() {
            if off % self.chunk_dims[d] != 0 {
                return Err(ChunkError::Selection(format!(
                    "chunk coordinate {coord} is not aligned to the chunk shape"
                )));
            }
            if off >= self.dims[d] {
                return Err(ChunkError::Selection(format!(
                    "chunk coordinate {coord} is outside the dataset extent"
                )));
            }
        }
        Ok(())
    }

    /// Row-major chunk index within the current extent
    pub fn linear_index(&self, scaled: &[u64]) -> u64 {
        scaled
            .iter()
            .zip(&self.down_chunks)
            .map(|(&s, &d)| s.wrapping_mul(d))
            .fold(0u64, u64::wrapping_add)
    }

    /// Row-major chunk index within the max extent (stable across resizes)
    pub fn max_linear_index(&self, scaled: &[u64]) -> u64 {
        scaled
            .iter()
            .zip(&self.max_down_chunks)
            .map(|(&s, &d)| s * d)
            .sum()
    }

    /// Inverse of `max_linear_index`
    pub fn scaled_from_max_linear(&self, mut idx: u64) -> Vec<u64> {
        self.max_down_chunks
            .iter()
            .map(|&d| {
                let s = idx / d;
                idx %= d;
                s
            })
            .collect()
    }

    /// Direct-mapped cache slot for a chunk
    ///
    /// When the fastest dimension has few chunks, the other dimensions are
    /// folded in so neighbouring rows don't collide.
    pub fn hash_slot(&self, scaled: &[u64], nslots: usize) -> usize {
        debug_assert!(nslots > 0);
        let rank = self.rank();
        let val = if rank > 1 && self.chunks[rank - 1] <= nslots as u64 {
            let mut v = scaled[0];
            for d in 1..rank {
                v = v.wrapping_shl(self.encode_bits[d]) ^ scaled[d];
            }
            v
        } else {
            scaled[rank - 1]
        };
        (val % nslots as u64) as usize
    }

    /// True if the chunk sticks out past the current extent
    pub fn is_partial_edge(&self, scaled: &[u64]) -> bool {
        scaled
            .iter()
            .enumerate()
            .any(|(d, &s)| (s + 1) * self.chunk_dims[d] > self.dims[d])
    }

    /// True if any part of the chunk lies inside the current extent
    pub fn is_inside_extent(&self, scaled: &[u64]) -> bool {
        scaled
            .iter()
            .enumerate()
            .all(|(d, &s)| s * self.chunk_dims[d] < self.dims[d])
    }
}

fn down_strides(counts: &[u64]) -> Vec<u64> {
    let mut down = vec![1u64; counts.len()];
    for d in (0..counts.len().saturating_sub(1)).rev() {
        down[d] = down[d + 1].saturating_mul(counts[d + 1].max(1));
    }
    down
}
