//! Persisted dataset header
//!
//! ```text
//! ┌──────────────┬────────────────┬──────────────┬──────────────┬───────────┐
//! │ Magic "DSET" │ Capacity: u32  │ Length: u32  │ Payload      │ CRC32     │
//! │ (4 bytes)    │ (payload room) │ (bincode)    │ (Capacity)   │ (4 bytes) │
//! └──────────────┴────────────────┴──────────────┴──────────────┴───────────┘
//! ```
//! The block is allocated once with spare room, so rewriting it after the
//! index root moves or the extent changes never relocates it. The CRC covers
//! magic, capacity, length and the used part of the payload.

use serde::{Deserialize, Serialize};

use crate::error::{ChunkError, Result};
use crate::fill::FillValue;
use crate::filter::FilterDescriptor;
use crate::index::IndexDescriptor;
use crate::storage::StorageFile;

use super::AllocTime;

const HEADER_MAGIC: &[u8; 4] = b"DSET";
pub(crate) const HEADER_VERSION: u8 = 1;

/// magic + capacity + length
const PREFIX_SIZE: usize = 12;

/// Smallest payload room reserved for a new header
const MIN_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct DatasetHeader {
    pub version: u8,
    pub dims: Vec<u64>,
    pub max_dims: Vec<Option<u64>>,
    pub chunk_dims: Vec<u32>,
    pub elem_size: u64,
    pub index: IndexDescriptor,
    pub fill: FillValue,
    pub filters: Vec<FilterDescriptor>,
    pub filter_partial_edges: bool,
    pub alloc_time: AllocTime,
}

impl DatasetHeader {
    fn payload(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| ChunkError::Serialization(e.to_string()))
    }

    /// Allocate a block for this header and write it; returns (addr, capacity)
    pub fn create(&self, file: &StorageFile) -> Result<(u64, usize)> {
        let payload = self.payload()?;
        let capacity = (payload.len() * 2).max(MIN_CAPACITY);
        let addr = file.allocate(block_size(capacity))?;
        write_block(file, addr, capacity, &payload)?;
        Ok((addr, capacity))
    }

    /// Rewrite in place
    pub fn store(&self, file: &StorageFile, addr: u64, capacity: usize) -> Result<()> {
        let payload = self.payload()?;
        if payload.len() > capacity {
            return Err(ChunkError::Resource(format!(
                "dataset header needs {} bytes, block holds {}",
                payload.len(),
                capacity
            )));
        }
        write_block(file, addr, capacity, &payload)
    }

    /// Read and verify; returns the header and the block's capacity
    pub fn load(file: &StorageFile, addr: u64) -> Result<(Self, usize)> {
        let codec = file.codec();
        let mut prefix = [0u8; PREFIX_SIZE];
        file.read_at(addr, &mut prefix)?;

        let mut dec = codec.decoder(&prefix, "dataset header");
        if dec.get_bytes(4)? != HEADER_MAGIC {
            return Err(dec.corrupt("bad magic"));
        }
        let capacity = dec.get_u32()? as usize;
        let len = dec.get_u32()? as usize;
        if len > capacity {
            return Err(dec.corrupt(format!("payload of {len} bytes exceeds capacity {capacity}")));
        }

        let mut rest = vec![0u8; len + 4];
        file.read_at(addr + PREFIX_SIZE as u64, &mut rest)?;
        let mut crc = crc32fast::Hasher::new();
        crc.update(&prefix);
        crc.update(&rest[..len]);
        let stored = codec.decoder(&rest[len..], "dataset header").get_u32()?;
        if crc.finalize() != stored {
            return Err(ChunkError::cannot_load("dataset header", "checksum mismatch"));
        }

        let header: DatasetHeader = bincode::deserialize(&rest[..len])
            .map_err(|e| ChunkError::cannot_load("dataset header", e.to_string()))?;
        if header.version != HEADER_VERSION {
            return Err(ChunkError::cannot_load(
                "dataset header",
                format!("unsupported version {}", header.version),
            ));
        }
        Ok((header, capacity))
    }

    /// Release the block
    pub fn free(file: &StorageFile, addr: u64, capacity: usize) -> Result<()> {
        file.free(addr, block_size(capacity))
    }
}

fn block_size(capacity: usize) -> u64 {
    (PREFIX_SIZE + capacity + 4) as u64
}

fn write_block(file: &StorageFile, addr: u64, capacity: usize, payload: &[u8]) -> Result<()> {
    let mut enc = file.codec().encoder(PREFIX_SIZE + payload.len() + 4);
    enc.put_slice(HEADER_MAGIC);
    enc.put_u32(capacity as u32);
    enc.put_u32(payload.len() as u32);
    enc.put_slice(payload);
    let crc = crc32fast::hash(enc.as_slice());
    enc.put_u32(crc);
    file.write_at(addr, &enc.finish())
}
