//! B-tree chunk keys
//!
//! ```text
//! ┌──────────────┬──────────────────┬─────────────────────────────┐
//! │ NBytes: u32  │ FilterMask: u32  │ Offset: u64 × (rank + 1)    │
//! └──────────────┴──────────────────┴─────────────────────────────┘
//! ```
//! Keys sort by offsets only (row-major). In leaves the length and mask
//! describe the chunk; in internal nodes they are zero.

use std::cmp::Ordering;

use crate::codec::{Decoder, Encoder};
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ChunkKey {
    pub nbytes: u32,
    pub filter_mask: u32,
    /// rank + 1 entries, the last always 0
    pub offsets: Vec<u64>,
}

impl ChunkKey {
    pub fn encoded_size(rank: usize) -> usize {
        4 + 4 + 8 * (rank + 1)
    }

    pub fn zero(rank: usize) -> Self {
        Self {
            nbytes: 0,
            filter_mask: 0,
            offsets: vec![0; rank + 1],
        }
    }

    /// Copy suitable for an internal node or sentinel (offsets only)
    pub fn bound(&self) -> Self {
        Self {
            nbytes: 0,
            filter_mask: 0,
            offsets: self.offsets.clone(),
        }
    }

    pub fn cmp_coord(&self, coord: &[u64]) -> Ordering {
        self.offsets.as_slice().cmp(coord)
    }

    pub fn encode(&self, enc: &mut Encoder) {
        enc.put_u32(self.nbytes);
        enc.put_u32(self.filter_mask);
        for &off in &self.offsets {
            enc.put_u64(off);
        }
    }

    pub fn decode(dec: &mut Decoder<'_>, rank: usize) -> Result<Self> {
        let nbytes = dec.get_u32()?;
        let filter_mask = dec.get_u32()?;
        let offsets = (0..=rank).map(|_| dec.get_u64()).collect::<Result<Vec<_>>>()?;
        Ok(Self {
            nbytes,
            filter_mask,
            offsets,
        })
    }
}
