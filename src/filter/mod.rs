//! Filter Pipeline
//!
//! Reversible per-chunk byte transforms (compression, shuffling, checksums).
//! A dataset stores an ordered list of [`FilterDescriptor`]s; at open time
//! they are resolved against a [`FilterRegistry`] into a [`FilterPipeline`].
//!
//! ## Filter Mask
//! ```text
//! bit i set  => filter i was skipped when the chunk was written
//!               (an optional filter that failed, or a raw direct write)
//! ```
//! `reverse` honours the mask recorded with each chunk, so chunks written
//! with different masks coexist in one dataset.

mod builtin;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{ChunkError, Result};

pub use builtin::{ChecksumFilter, DeflateFilter, ShuffleFilter};

// =============================================================================
// Filter Identifiers
// =============================================================================

pub const FILTER_DEFLATE: u16 = 1;
pub const FILTER_SHUFFLE: u16 = 2;
pub const FILTER_CHECKSUM: u16 = 3;

/// The mask is 32 bits wide, so a pipeline holds at most this many filters
pub const MAX_FILTERS: usize = 32;

/// A reversible byte-buffer transform
pub trait Filter: Send + Sync {
    fn id(&self) -> u16;

    fn name(&self) -> &'static str;

    /// Transform on the way to disk
    fn forward(&self, params: &[u32], elem_size: usize, input: &[u8]) -> Result<Vec<u8>>;

    /// Undo `forward` on the way back from disk
    fn reverse(&self, params: &[u32], elem_size: usize, input: &[u8]) -> Result<Vec<u8>>;
}

/// One pipeline stage as persisted in the dataset header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterDescriptor {
    pub id: u16,
    /// A failing optional filter is skipped (and masked) instead of failing the write
    pub optional: bool,
    pub params: Vec<u32>,
}

impl FilterDescriptor {
    pub fn new(id: u16, optional: bool, params: Vec<u32>) -> Self {
        Self {
            id,
            optional,
            params,
        }
    }

    /// zlib deflate at `level` (0-9)
    pub fn deflate(level: u32) -> Self {
        Self::new(FILTER_DEFLATE, false, vec![level])
    }

    pub fn shuffle() -> Self {
        Self::new(FILTER_SHUFFLE, false, Vec::new())
    }

    pub fn checksum() -> Self {
        Self::new(FILTER_CHECKSUM, false, Vec::new())
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Filters known to this process, keyed by id
#[derive(Clone)]
pub struct FilterRegistry {
    filters: HashMap<u16, Arc<dyn Filter>>,
}

impl Default for FilterRegistry {
    /// Registry with the built-in deflate, shuffle and checksum filters
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(DeflateFilter));
        registry.register(Arc::new(ShuffleFilter));
        registry.register(Arc::new(ChecksumFilter));
        registry
    }
}

impl FilterRegistry {
    pub fn empty() -> Self {
        Self {
            filters: HashMap::new(),
        }
    }

    /// Add or replace a filter
    pub fn register(&mut self, filter: Arc<dyn Filter>) {
        self.filters.insert(filter.id(), filter);
    }

    pub fn get(&self, id: u16) -> Option<Arc<dyn Filter>> {
        self.filters.get(&id).cloned()
    }
}

impl fmt::Debug for FilterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids: Vec<_> = self.filters.keys().copied().collect();
        ids.sort_unstable();
        f.debug_struct("FilterRegistry").field("ids", &ids).finish()
    }
}

// =============================================================================
// Pipeline
// =============================================================================

/// Resolved, ordered filter list for one dataset
#[derive(Clone, Default)]
pub struct FilterPipeline {
    stages: Vec<(FilterDescriptor, Arc<dyn Filter>)>,
}

impl FilterPipeline {
    /// Resolve descriptors; an unregistered id is a filter error
    pub fn new(descriptors: &[FilterDescriptor], registry: &FilterRegistry) -> Result<Self> {
        if descriptors.len() > MAX_FILTERS {
            return Err(ChunkError::Config(format!(
                "pipeline has {} filters, at most {} are supported",
                descriptors.len(),
                MAX_FILTERS
            )));
        }
        let stages = descriptors
            .iter()
            .map(|desc| {
                registry
                    .get(desc.id)
                    .map(|filter| (desc.clone(), filter))
                    .ok_or_else(|| ChunkError::Filter(format!("filter {} is not registered", desc.id)))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { stages })
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Mask marking every stage as skipped
    pub fn all_skipped(&self) -> u32 {
        ((1u64 << self.stages.len()) - 1) as u32
    }

    pub fn descriptors(&self) -> Vec<FilterDescriptor> {
        self.stages.iter().map(|(desc, _)| desc.clone()).collect()
    }

    /// Apply every stage in order; returns the output and the skip mask
    pub fn forward(&self, input: &[u8], elem_size: usize) -> Result<(Vec<u8>, u32)> {
        let mut buf = input.to_vec();
        let mut mask = 0u32;

        for (i, (desc, filter)) in self.stages.iter().enumerate() {
            match filter.forward(&desc.params, elem_size, &buf) {
                Ok(out) => buf = out,
                Err(e) if desc.optional => {
                    tracing::debug!("Optional filter {} skipped: {}", filter.name(), e);
                    mask |= 1 << i;
                }
                Err(e) => return Err(e),
            }
        }
        Ok((buf, mask))
    }

    /// Undo the stages in reverse order, skipping those set in `mask`
    pub fn reverse(&self, input: Vec<u8>, mask: u32, elem_size: usize) -> Result<Vec<u8>> {
        let mut buf = input;
        for (i, (desc, filter)) in self.stages.iter().enumerate().rev() {
            if mask & (1 << i) != 0 {
                continue;
            }
            buf = filter.reverse(&desc.params, elem_size, &buf)?;
        }
        Ok(buf)
    }
}

impl fmt::Debug for FilterPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.stages.iter().map(|(desc, _)| desc))
            .finish()
    }
}
