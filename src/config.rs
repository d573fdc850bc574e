//! Configuration for chunkstore
//!
//! Centralized configuration with sensible defaults. Per-dataset creation
//! properties (chunk shape, fill value, filters) live in
//! [`DatasetOptions`](crate::dataset::DatasetOptions); this struct holds the
//! settings a caller picks when opening files and dataset handles.

use std::sync::Arc;

use crate::codec::ByteOrder;
use crate::error::{ChunkError, Result};
use crate::filter::FilterRegistry;
use crate::transport::{SingleProcess, Transport};

/// Main configuration for files and dataset handles
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Chunk Cache Configuration
    // -------------------------------------------------------------------------
    /// Number of direct-mapped hash slots (0 disables caching)
    pub cache_slots: usize,

    /// Byte budget for resident decoded chunks
    pub cache_bytes: usize,

    /// Preemption weight in [0, 1]: fraction of resident entries the
    /// "fully accessed" cursor scans before the plain LRU cursor joins in
    pub cache_w0: f64,

    // -------------------------------------------------------------------------
    // File Format Configuration (used when creating files)
    // -------------------------------------------------------------------------
    /// Width of file addresses in bytes (2, 4 or 8)
    pub address_size: u8,

    /// Byte order of every on-disk integer
    pub byte_order: ByteOrder,

    /// Hard limit on the end of allocation (`None` = address width only)
    pub max_file_size: Option<u64>,

    // -------------------------------------------------------------------------
    // Collaborators
    // -------------------------------------------------------------------------
    /// Filters available to dataset pipelines, looked up by id
    pub filters: Arc<FilterRegistry>,

    /// Process coordination for parallel access to one file
    pub transport: Arc<dyn Transport>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_slots: 521,
            cache_bytes: 1024 * 1024, // 1 MB
            cache_w0: 0.75,
            address_size: 8,
            byte_order: ByteOrder::Little,
            max_file_size: None,
            filters: Arc::new(FilterRegistry::default()),
            transport: Arc::new(SingleProcess),
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Check value ranges that the type system can't express
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.cache_w0) {
            return Err(ChunkError::Config(format!(
                "cache_w0 must be in [0, 1], got {}",
                self.cache_w0
            )));
        }
        if !matches!(self.address_size, 2 | 4 | 8) {
            return Err(ChunkError::Config(format!(
                "address_size must be 2, 4 or 8, got {}",
                self.address_size
            )));
        }
        Ok(())
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the number of cache hash slots
    pub fn cache_slots(mut self, slots: usize) -> Self {
        self.config.cache_slots = slots;
        self
    }

    /// Set the cache byte budget
    pub fn cache_bytes(mut self, bytes: usize) -> Self {
        self.config.cache_bytes = bytes;
        self
    }

    /// Set the cache preemption weight
    pub fn cache_w0(mut self, w0: f64) -> Self {
        self.config.cache_w0 = w0;
        self
    }

    /// Set the file address width in bytes
    pub fn address_size(mut self, size: u8) -> Self {
        self.config.address_size = size;
        self
    }

    /// Set the on-disk byte order
    pub fn byte_order(mut self, order: ByteOrder) -> Self {
        self.config.byte_order = order;
        self
    }

    /// Cap the file's end of allocation
    pub fn max_file_size(mut self, bytes: u64) -> Self {
        self.config.max_file_size = Some(bytes);
        self
    }

    /// Use a custom filter registry
    pub fn filters(mut self, registry: Arc<FilterRegistry>) -> Self {
        self.config.filters = registry;
        self
    }

    /// Use a parallel (or otherwise custom) transport
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.config.transport = transport;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
