//! Built-in filters

use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::error::{ChunkError, Result};

use super::{Filter, FILTER_CHECKSUM, FILTER_DEFLATE, FILTER_SHUFFLE};

// =============================================================================
// Deflate
// =============================================================================

/// zlib deflate; params = [level]
#[derive(Debug, Default, Clone, Copy)]
pub struct DeflateFilter;

impl Filter for DeflateFilter {
    fn id(&self) -> u16 {
        FILTER_DEFLATE
    }

    fn name(&self) -> &'static str {
        "deflate"
    }

    fn forward(&self, params: &[u32], _elem_size: usize, input: &[u8]) -> Result<Vec<u8>> {
        let level = params.first().copied().unwrap_or(6).min(9);
        let mut encoder = ZlibEncoder::new(Vec::with_capacity(input.len() / 2), Compression::new(level));
        encoder
            .write_all(input)
            .map_err(|e| ChunkError::Filter(format!("deflate: {e}")))?;
        encoder
            .finish()
            .map_err(|e| ChunkError::Filter(format!("deflate: {e}")))
    }

    fn reverse(&self, _params: &[u32], _elem_size: usize, input: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(input.len() * 2);
        ZlibDecoder::new(input)
            .read_to_end(&mut out)
            .map_err(|e| ChunkError::Filter(format!("inflate: {e}")))?;
        Ok(out)
    }
}

// =============================================================================
// Shuffle
// =============================================================================

/// Byte shuffle: groups byte 0 of every element, then byte 1, ...
///
/// params = [element size] (defaults to the dataset's element size).
/// Trailing bytes that don't form a whole element are left in place.
#[derive(Debug, Default, Clone, Copy)]
pub struct ShuffleFilter;

impl ShuffleFilter {
    fn width(params: &[u32], elem_size: usize) -> usize {
        params.first().map(|&w| w as usize).unwrap_or(elem_size).max(1)
    }
}

impl Filter for ShuffleFilter {
    fn id(&self) -> u16 {
        FILTER_SHUFFLE
    }

    fn name(&self) -> &'static str {
        "shuffle"
    }

    fn forward(&self, params: &[u32], elem_size: usize, input: &[u8]) -> Result<Vec<u8>> {
        let width = Self::width(params, elem_size);
        let n = input.len() / width;
        let mut out = input.to_vec();
        for i in 0..n {
            for b in 0..width {
                out[b * n + i] = input[i * width + b];
            }
        }
        Ok(out)
    }

    fn reverse(&self, params: &[u32], elem_size: usize, input: &[u8]) -> Result<Vec<u8>> {
        let width = Self::width(params, elem_size);
        let n = input.len() / width;
        let mut out = input.to_vec();
        for i in 0..n {
            for b in 0..width {
                out[i * width + b] = input[b * n + i];
            }
        }
        Ok(out)
    }
}

// =============================================================================
// Checksum
// =============================================================================

/// Appends a little-endian CRC-32 and verifies it on the way back
#[derive(Debug, Default, Clone, Copy)]
pub struct ChecksumFilter;

impl Filter for ChecksumFilter {
    fn id(&self) -> u16 {
        FILTER_CHECKSUM
    }

    fn name(&self) -> &'static str {
        "checksum"
    }

    fn forward(&self, _params: &[u32], _elem_size: usize, input: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(input.len() + 4);
        out.extend_from_slice(input);
        out.extend_from_slice(&crc32fast::hash(input).to_le_bytes());
        Ok(out)
    }

    fn reverse(&self, _params: &[u32], _elem_size: usize, input: &[u8]) -> Result<Vec<u8>> {
        if input.len() < 4 {
            return Err(ChunkError::Filter("checksum: input shorter than checksum".into()));
        }
        let (data, tail) = input.split_at(input.len() - 4);
        let stored = u32::from_le_bytes([tail[0], tail[1], tail[2], tail[3]]);
        let computed = crc32fast::hash(data);
        if stored != computed {
            return Err(ChunkError::Filter(format!(
                "checksum mismatch: stored {stored:#010x}, computed {computed:#010x}"
            )));
        }
        Ok(data.to_vec())
    }
}
