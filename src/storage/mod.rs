//! Storage Module
//!
//! The single container file every dataset, index node and chunk lives in.
//!
//! ## Responsibilities
//! - Superblock with byte order, address width and end-of-allocation
//! - Block allocation and release (coalescing free list)
//! - Positional reads/writes shared by all datasets in the file
//!
//! ## File Format
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ Superblock (32 bytes)                                    │
//! │   Magic: "CHKF" (4) | Version (1) | ByteOrder (1)        │
//! │   AddrSize (1) | Reserved (1) | EOA: u64 (8)             │
//! │   Root: u64 (8) | CRC32 of bytes 0..24 (4) | Pad (4)     │
//! ├──────────────────────────────────────────────────────────┤
//! │ Allocated blocks (dataset headers, index nodes, chunks)  │
//! │   ... addressed by absolute file offset ...              │
//! └──────────────────────────────────────────────────────────┘
//! ```

mod file;
mod free_space;

pub use file::StorageFile;

// =============================================================================
// Shared Constants
// =============================================================================

/// Magic bytes identifying a chunkstore container file
pub(crate) const MAGIC: &[u8; 4] = b"CHKF";

/// Current container format version
pub(crate) const VERSION: u8 = 1;

/// Superblock size, always at file offset 0
pub(crate) const SUPERBLOCK_SIZE: u64 = 32;
