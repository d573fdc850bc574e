//! Byte Codec
//!
//! Fixed-width integer and file-address encoding for every on-disk structure.
//! Byte order and address width are properties of the container file, so a
//! `Codec` is built once from the superblock and handed to each structure.
//!
//! ## Address Encoding
//! ```text
//! width = 2, 4 or 8 bytes (file-defined)
//! undefined address = all ones at that width
//! ```

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{ChunkError, Result};

/// Byte order used for every multi-byte field in a file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ByteOrder {
    #[default]
    Little,
    Big,
}

impl ByteOrder {
    pub(crate) fn to_byte(self) -> u8 {
        match self {
            ByteOrder::Little => 0,
            ByteOrder::Big => 1,
        }
    }

    pub(crate) fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(ByteOrder::Little),
            1 => Some(ByteOrder::Big),
            _ => None,
        }
    }
}

/// Encoding parameters for one file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Codec {
    order: ByteOrder,
    addr_size: u8,
}

impl Codec {
    /// Create a codec; address width must be 2, 4 or 8 bytes
    pub fn new(order: ByteOrder, addr_size: u8) -> Result<Self> {
        match addr_size {
            2 | 4 | 8 => Ok(Self { order, addr_size }),
            other => Err(ChunkError::Config(format!(
                "unsupported address size {other}, expected 2, 4 or 8"
            ))),
        }
    }

    pub fn order(&self) -> ByteOrder {
        self.order
    }

    /// Address width in bytes
    pub fn addr_size(&self) -> usize {
        self.addr_size as usize
    }

    /// The all-ones pattern reserved for "undefined" at this width
    pub fn undef_addr(&self) -> u64 {
        if self.addr_size == 8 {
            u64::MAX
        } else {
            (1u64 << (8 * self.addr_size as u32)) - 1
        }
    }

    /// Largest end-of-allocation a file with this codec can describe
    pub fn addr_limit(&self) -> u64 {
        self.undef_addr()
    }

    pub fn encoder(&self, capacity: usize) -> Encoder {
        Encoder {
            codec: *self,
            buf: BytesMut::with_capacity(capacity),
        }
    }

    pub fn decoder<'a>(&self, buf: &'a [u8], structure: &'static str) -> Decoder<'a> {
        Decoder {
            codec: *self,
            buf,
            structure,
        }
    }
}

// =============================================================================
// Encoder
// =============================================================================

/// Append-only writer for one encoded structure
pub struct Encoder {
    codec: Codec,
    buf: BytesMut,
}

impl Encoder {
    pub fn put_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    pub fn put_u16(&mut self, v: u16) {
        match self.codec.order {
            ByteOrder::Little => self.buf.put_u16_le(v),
            ByteOrder::Big => self.buf.put_u16(v),
        }
    }

    pub fn put_u32(&mut self, v: u32) {
        match self.codec.order {
            ByteOrder::Little => self.buf.put_u32_le(v),
            ByteOrder::Big => self.buf.put_u32(v),
        }
    }

    pub fn put_u64(&mut self, v: u64) {
        match self.codec.order {
            ByteOrder::Little => self.buf.put_u64_le(v),
            ByteOrder::Big => self.buf.put_u64(v),
        }
    }

    /// Write an address at the file's width (`None` encodes as undefined)
    pub fn put_addr(&mut self, addr: Option<u64>) {
        let v = addr.unwrap_or_else(|| self.codec.undef_addr());
        let n = self.codec.addr_size();
        match self.codec.order {
            ByteOrder::Little => self.buf.put_uint_le(v, n),
            ByteOrder::Big => self.buf.put_uint(v, n),
        }
    }

    pub fn put_slice(&mut self, bytes: &[u8]) {
        self.buf.put_slice(bytes);
    }

    /// Zero-fill up to `len` bytes total
    pub fn pad_to(&mut self, len: usize) {
        if self.buf.len() < len {
            self.buf.resize(len, 0);
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Bytes written so far (used for trailing checksums)
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf.to_vec()
    }
}

// =============================================================================
// Decoder
// =============================================================================

/// Bounds-checked reader; running out of bytes is a `CannotLoad` error
pub struct Decoder<'a> {
    codec: Codec,
    buf: &'a [u8],
    structure: &'static str,
}

impl<'a> Decoder<'a> {
    fn need(&self, n: usize) -> Result<()> {
        if self.buf.remaining() < n {
            return Err(ChunkError::cannot_load(
                self.structure,
                format!("truncated: needed {} bytes, {} left", n, self.buf.remaining()),
            ));
        }
        Ok(())
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    pub fn get_u16(&mut self) -> Result<u16> {
        self.need(2)?;
        Ok(match self.codec.order {
            ByteOrder::Little => self.buf.get_u16_le(),
            ByteOrder::Big => self.buf.get_u16(),
        })
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        self.need(4)?;
        Ok(match self.codec.order {
            ByteOrder::Little => self.buf.get_u32_le(),
            ByteOrder::Big => self.buf.get_u32(),
        })
    }

    pub fn get_u64(&mut self) -> Result<u64> {
        self.need(8)?;
        Ok(match self.codec.order {
            ByteOrder::Little => self.buf.get_u64_le(),
            ByteOrder::Big => self.buf.get_u64(),
        })
    }

    /// Read an address at the file's width (`None` if undefined)
    pub fn get_addr(&mut self) -> Result<Option<u64>> {
        let n = self.codec.addr_size();
        self.need(n)?;
        let v = match self.codec.order {
            ByteOrder::Little => self.buf.get_uint_le(n),
            ByteOrder::Big => self.buf.get_uint(n),
        };
        Ok(if v == self.codec.undef_addr() { None } else { Some(v) })
    }

    pub fn get_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        self.need(n)?;
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.need(n)?;
        self.buf.advance(n);
        Ok(())
    }

    /// Build a corruption error tagged with this decoder's structure name
    pub fn corrupt(&self, reason: impl Into<String>) -> ChunkError {
        ChunkError::cannot_load(self.structure, reason)
    }
}
