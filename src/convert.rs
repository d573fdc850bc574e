//! Datatype conversion contract
//!
//! The engine does not know element types; it only moves fixed-size
//! elements. When the memory and file representations differ the caller
//! supplies a [`TypeConversion`] and the I/O path stages elements through it.

use std::fmt::Debug;

use crate::error::{ChunkError, Result};

/// Element-wise conversion from `src_size`-byte to `dst_size`-byte elements
pub trait TypeConversion: Send + Sync + Debug {
    fn src_size(&self) -> usize;

    fn dst_size(&self) -> usize;

    /// The conversion reads destination values already present (e.g. a
    /// partial compound member update)
    fn needs_background(&self) -> bool {
        false
    }

    /// Convert `nelmts` elements in place. `buf` holds
    /// `nelmts * max(src_size, dst_size)` bytes; input is packed at
    /// `src_size`, output must be packed at `dst_size`.
    fn convert(&self, nelmts: usize, buf: &mut [u8], background: Option<&mut [u8]>) -> Result<()>;
}

// =============================================================================
// Byte swap
// =============================================================================

/// Reverses the bytes of every element (endianness change)
#[derive(Debug, Clone, Copy)]
pub struct ByteSwap {
    size: usize,
}

impl ByteSwap {
    pub fn new(size: usize) -> Self {
        Self { size }
    }
}

impl TypeConversion for ByteSwap {
    fn src_size(&self) -> usize {
        self.size
    }

    fn dst_size(&self) -> usize {
        self.size
    }

    fn convert(&self, nelmts: usize, buf: &mut [u8], _background: Option<&mut [u8]>) -> Result<()> {
        check_len(buf, nelmts * self.size)?;
        for elem in buf[..nelmts * self.size].chunks_exact_mut(self.size) {
            elem.reverse();
        }
        Ok(())
    }
}

// =============================================================================
// Integer width conversion
// =============================================================================

/// Little-endian integer widening or narrowing
///
/// Narrowing saturates at the destination range; signed sources are
/// sign-extended.
#[derive(Debug, Clone, Copy)]
pub struct IntegerConversion {
    src: usize,
    dst: usize,
    signed: bool,
}

impl IntegerConversion {
    pub fn new(src: usize, dst: usize, signed: bool) -> Result<Self> {
        for size in [src, dst] {
            if !matches!(size, 1 | 2 | 4 | 8) {
                return Err(ChunkError::Conversion(format!(
                    "unsupported integer size {size}"
                )));
            }
        }
        Ok(Self { src, dst, signed })
    }

    fn load(&self, bytes: &[u8]) -> i128 {
        let mut raw = [0u8; 16];
        raw[..self.src].copy_from_slice(bytes);
        if self.signed && bytes[self.src - 1] & 0x80 != 0 {
            raw[self.src..].fill(0xff);
        }
        i128::from_le_bytes(raw)
    }

    fn store(&self, value: i128, out: &mut [u8]) {
        let bits = 8 * self.dst as u32;
        let (min, max) = if self.signed {
            (-(1i128 << (bits - 1)), (1i128 << (bits - 1)) - 1)
        } else {
            (0, (1i128 << bits) - 1)
        };
        let clamped = value.clamp(min, max);
        out.copy_from_slice(&clamped.to_le_bytes()[..self.dst]);
    }
}

impl TypeConversion for IntegerConversion {
    fn src_size(&self) -> usize {
        self.src
    }

    fn dst_size(&self) -> usize {
        self.dst
    }

    fn convert(&self, nelmts: usize, buf: &mut [u8], _background: Option<&mut [u8]>) -> Result<()> {
        check_len(buf, nelmts * self.src.max(self.dst))?;
        if self.dst > self.src {
            // Widening: walk backwards so outputs never clobber unread inputs
            for i in (0..nelmts).rev() {
                let v = self.load(&buf[i * self.src..(i + 1) * self.src]);
                self.store(v, &mut buf[i * self.dst..(i + 1) * self.dst]);
            }
        } else {
            for i in 0..nelmts {
                let v = self.load(&buf[i * self.src..(i + 1) * self.src]);
                self.store(v, &mut buf[i * self.dst..(i + 1) * self.dst]);
            }
        }
        Ok(())
    }
}

fn check_len(buf: &[u8], needed: usize) -> Result<()> {
    if buf.len() < needed {
        return Err(ChunkError::Conversion(format!(
            "conversion buffer holds {} bytes, needs {}",
            buf.len(),
            needed
        )));
    }
    Ok(())
}
