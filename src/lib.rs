//! # chunkstore
//!
//! A chunked multi-dimensional array storage engine with:
//! - A chunk index (rebalancing B-tree or lazily paged fixed array)
//! - A direct-mapped, byte-budgeted cache of decoded chunks
//! - A per-chunk filter pipeline (deflate, shuffle, checksum)
//! - Selection-based read/write with optional element conversion
//! - Allocation on growth and pruning on shrink
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Dataset                              │
//! │        read / write / set_extent / copy_to / raw chunks      │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//!          ┌────────────┼────────────────┐
//!          │            │                │
//!          ▼            ▼                ▼
//!   ┌─────────────┐ ┌─────────────┐ ┌─────────────┐
//!   │ Chunk Cache │ │   Filter    │ │ Chunk Index │
//!   │  (decoded)  │ │  Pipeline   │ │ BTree/Paged │
//!   └──────┬──────┘ └──────┬──────┘ └──────┬──────┘
//!          │               │               │
//!          └───────────────┼───────────────┘
//!                          ▼
//!                  ┌─────────────┐
//!                  │ StorageFile │
//!                  │ (alloc/IO)  │
//!                  └─────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;
pub mod codec;

pub mod storage;
pub mod selection;
pub mod layout;
pub mod fill;
pub mod filter;
pub mod convert;
pub mod transport;
pub mod index;
pub mod cache;
pub mod dataset;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{ChunkError, Result};
pub use config::Config;
pub use codec::ByteOrder;
pub use storage::StorageFile;
pub use selection::{Dataspace, Selection};
pub use layout::{ChunkCoord, ChunkLayout};
pub use fill::{FillTime, FillValue};
pub use filter::{FilterDescriptor, FilterRegistry};
pub use convert::TypeConversion;
pub use index::{ChunkRecord, IndexKind};
pub use cache::CacheStats;
pub use dataset::{AllocTime, CopyOptions, Dataset, DatasetOptions};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of chunkstore
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
