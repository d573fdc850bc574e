//! Chunk Index
//!
//! Maps a chunk coordinate to its on-disk block: address, stored length and
//! filter mask. Two backends share one contract:
//!
//! - [`BTreeIndex`]: order-preserving, rebalancing tree of fixed-size nodes.
//!   Works with unlimited dimensions; lookups are O(log n).
//! - [`PagedArrayIndex`]: direct-addressed array over the maximum extent,
//!   paged lazily. Needs fixed maximum dimensions; lookups are O(1).
//!
//! ## Contract
//! ```text
//! get(coord)                         -> record (addr = None if never written)
//! insert_or_resize(coord, len, mask) -> record (same addr if len unchanged)
//! remove(coord)                      -> frees the block
//! records()                          -> lazy iterator over allocated records
//! delete_all()                       -> frees every block and all metadata
//! ```
//! The index does no locking; the owning dataset serializes calls.

mod btree;
mod paged_array;

use serde::{Deserialize, Serialize};

use crate::error::{ChunkError, Result};
use crate::layout::{ChunkCoord, ChunkLayout};
use crate::storage::StorageFile;

pub use btree::BTreeIndex;
pub use paged_array::PagedArrayIndex;

/// Default B-tree node half-capacity (nodes hold up to 2K entries)
pub const DEFAULT_BTREE_K: u16 = 32;

/// Default paged-array page size: 2^10 records per page
pub const DEFAULT_PAGE_BITS: u8 = 10;

/// Which backend a dataset uses, plus its tuning knob
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexKind {
    BTree { k: u16 },
    PagedArray { page_bits: u8 },
}

impl Default for IndexKind {
    fn default() -> Self {
        IndexKind::BTree { k: DEFAULT_BTREE_K }
    }
}

impl IndexKind {
    pub fn btree() -> Self {
        Self::default()
    }

    pub fn paged_array() -> Self {
        IndexKind::PagedArray {
            page_bits: DEFAULT_PAGE_BITS,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            IndexKind::BTree { .. } => "btree",
            IndexKind::PagedArray { .. } => "paged-array",
        }
    }
}

/// Enough to reopen an index: its kind and the address of its root/header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDescriptor {
    pub kind: IndexKind,
    pub addr: u64,
}

/// Location of one chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkRecord {
    pub coord: ChunkCoord,
    /// `None` until the chunk is first written
    pub addr: Option<u64>,
    /// Stored (possibly filtered) length in bytes
    pub nbytes: u64,
    pub filter_mask: u32,
}

impl ChunkRecord {
    pub fn unallocated(coord: ChunkCoord) -> Self {
        Self {
            coord,
            addr: None,
            nbytes: 0,
            filter_mask: 0,
        }
    }

    pub fn is_allocated(&self) -> bool {
        self.addr.is_some()
    }
}

// =============================================================================
// Chunk Index
// =============================================================================

enum Backend {
    BTree(BTreeIndex),
    PagedArray(PagedArrayIndex),
}

/// A dataset's chunk index with a one-record lookup cache in front
pub struct ChunkIndex {
    backend: Backend,
    /// Most recent lookup/insert, answered without touching disk
    last: Option<ChunkRecord>,
}

impl ChunkIndex {
    /// Create an empty index in `file`
    pub fn create(file: &StorageFile, layout: &ChunkLayout, kind: IndexKind) -> Result<Self> {
        let backend = match kind {
            IndexKind::BTree { k } => Backend::BTree(BTreeIndex::create(file, layout, k)?),
            IndexKind::PagedArray { page_bits } => {
                Backend::PagedArray(PagedArrayIndex::create(file, layout, page_bits)?)
            }
        };
        Ok(Self {
            backend,
            last: None,
        })
    }

    /// Load an existing index; malformed metadata is a `CannotLoad` error
    pub fn open(file: &StorageFile, layout: &ChunkLayout, desc: IndexDescriptor) -> Result<Self> {
        let backend = match desc.kind {
            IndexKind::BTree { k } => Backend::BTree(BTreeIndex::open(file, layout, k, desc.addr)?),
            IndexKind::PagedArray { page_bits } => {
                Backend::PagedArray(PagedArrayIndex::open(file, layout, page_bits, desc.addr)?)
            }
        };
        Ok(Self {
            backend,
            last: None,
        })
    }

    /// Current kind and address (the B-tree root moves on split/collapse)
    pub fn descriptor(&self) -> IndexDescriptor {
        match &self.backend {
            Backend::BTree(tree) => IndexDescriptor {
                kind: IndexKind::BTree { k: tree.k() },
                addr: tree.root(),
            },
            Backend::PagedArray(array) => IndexDescriptor {
                kind: IndexKind::PagedArray {
                    page_bits: array.page_bits(),
                },
                addr: array.addr(),
            },
        }
    }

    pub fn kind(&self) -> IndexKind {
        self.descriptor().kind
    }

    /// Tree height, for the B-tree backend
    pub fn height(&self, file: &StorageFile) -> Result<Option<u8>> {
        match &self.backend {
            Backend::BTree(tree) => tree.height(file).map(Some),
            Backend::PagedArray(_) => Ok(None),
        }
    }

    /// Record capacity, for the paged array backend
    pub fn capacity(&self) -> Option<u64> {
        match &self.backend {
            Backend::BTree(_) => None,
            Backend::PagedArray(array) => Some(array.capacity()),
        }
    }

    /// Look up a chunk; never-written chunks come back unallocated
    pub fn get(&mut self, file: &StorageFile, coord: &ChunkCoord) -> Result<ChunkRecord> {
        if let Some(last) = &self.last {
            if &last.coord == coord {
                return Ok(last.clone());
            }
        }

        let record = match &self.backend {
            Backend::BTree(tree) => tree.get(file, coord)?,
            Backend::PagedArray(array) => array.get(file, coord)?,
        };
        tracing::trace!("Index lookup {} -> {:?}", coord, record.addr);

        self.last = Some(record.clone());
        Ok(record)
    }

    /// Allocate space for a chunk, or move it if its stored length changed
    pub fn insert_or_resize(
        &mut self,
        file: &StorageFile,
        coord: &ChunkCoord,
        nbytes: u64,
        filter_mask: u32,
    ) -> Result<ChunkRecord> {
        if nbytes > u32::MAX as u64 {
            return Err(ChunkError::Resource(format!(
                "chunk of {nbytes} bytes does not fit a 32-bit stored length"
            )));
        }

        let existing = self.get(file, coord)?;
        let record = match existing.addr {
            Some(addr) if existing.nbytes == nbytes => {
                let record = ChunkRecord {
                    filter_mask,
                    ..existing.clone()
                };
                if existing.filter_mask != filter_mask {
                    self.set(file, &record)?;
                }
                debug_assert_eq!(record.addr, Some(addr));
                record
            }
            old_addr => {
                let new_addr = file.allocate(nbytes)?;
                let record = ChunkRecord {
                    coord: coord.clone(),
                    addr: Some(new_addr),
                    nbytes,
                    filter_mask,
                };
                if let Err(e) = self.set(file, &record) {
                    self.last = None;
                    if let Err(free_err) = file.free(new_addr, nbytes) {
                        tracing::warn!("Leaked {} bytes at {}: {}", nbytes, new_addr, free_err);
                    }
                    return Err(e);
                }
                if let Some(old) = old_addr {
                    file.free(old, existing.nbytes)?;
                }
                record
            }
        };

        self.last = Some(record.clone());
        Ok(record)
    }

    /// Remove a chunk and free its block
    pub fn remove(&mut self, file: &StorageFile, coord: &ChunkCoord) -> Result<()> {
        let existing = self.get(file, coord)?;
        let Some(addr) = existing.addr else {
            return Err(ChunkError::ChunkNotAllocated);
        };

        self.last = None;
        match &mut self.backend {
            Backend::BTree(tree) => {
                tree.remove(file, coord)?;
            }
            Backend::PagedArray(array) => array.remove(file, coord)?,
        }
        file.free(addr, existing.nbytes)?;

        self.last = Some(ChunkRecord::unallocated(coord.clone()));
        Ok(())
    }

    /// Lazy iteration over allocated chunks in a stable order
    pub fn records<'a>(&'a self, file: &'a StorageFile) -> Result<ChunkRecords<'a>> {
        Ok(match &self.backend {
            Backend::BTree(tree) => ChunkRecords::BTree(tree.records(file)?),
            Backend::PagedArray(array) => ChunkRecords::PagedArray(array.records(file)),
        })
    }

    /// Free every chunk and the index metadata
    pub fn delete_all(self, file: &StorageFile) -> Result<()> {
        let blocks = self
            .records(file)?
            .map(|r| r.map(|rec| (rec.addr, rec.nbytes)))
            .collect::<Result<Vec<_>>>()?;
        let nchunks = blocks.len();
        for (addr, nbytes) in blocks {
            if let Some(addr) = addr {
                file.free(addr, nbytes)?;
            }
        }

        match self.backend {
            Backend::BTree(tree) => tree.delete(file)?,
            Backend::PagedArray(array) => array.delete(file)?,
        }
        tracing::debug!("Deleted chunk index and {} chunks", nchunks);
        Ok(())
    }

    /// Drop the cached lookup (after out-of-band changes)
    pub(crate) fn reset_last(&mut self) {
        self.last = None;
    }

    fn set(&mut self, file: &StorageFile, record: &ChunkRecord) -> Result<()> {
        match &mut self.backend {
            Backend::BTree(tree) => tree.set(file, record),
            Backend::PagedArray(array) => array.set(file, record),
        }
    }
}

impl std::fmt::Debug for ChunkIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let desc = self.descriptor();
        f.debug_struct("ChunkIndex")
            .field("kind", &desc.kind)
            .field("addr", &desc.addr)
            .field("last", &self.last)
            .finish()
    }
}

/// Iterator returned by [`ChunkIndex::records`]
pub enum ChunkRecords<'a> {
    BTree(btree::LeafRecords<'a>),
    PagedArray(paged_array::PageRecords<'a>),
}

impl Iterator for ChunkRecords<'_> {
    type Item = Result<ChunkRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            ChunkRecords::BTree(it) => it.next(),
            ChunkRecords::PagedArray(it) => it.next(),
        }
    }
}
