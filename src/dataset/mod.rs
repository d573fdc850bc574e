//! Dataset Module
//!
//! A chunked dataset handle: the layout, the chunk index, the chunk cache
//! and the filter pipeline of one array stored in a [`StorageFile`].
//!
//! ## Responsibilities
//! - Map caller selections onto chunks and move elements ([`io`])
//! - Allocate chunks on growth and prune them on shrink ([`lifecycle`])
//! - Raw chunk access that skips filters and conversion ([`direct`])
//! - Persist its own header so it can be reopened by address
//!
//! ## Data Flow
//! ```text
//! read/write ──► chunk map ──► per chunk: index lookup
//!                                  │
//!                       cacheable? ├── yes ──► lock ──► copy/convert ──► unlock
//!                                  │            (cache hit, disk + reverse
//!                                  │             filters, or fill)
//!                                  └── no ───► positional I/O, run by run
//!
//! eviction / flush ──► forward filters ──► insert_or_resize ──► write
//! ```
//!
//! ## Concurrency
//! Every mutating call takes `&mut self`. The file underneath is shared
//! through `Arc` and serializes its own I/O.

mod chunk_map;
mod direct;
mod header;
mod io;
mod lifecycle;
mod locking;
mod options;

use std::io::Write;
use std::sync::Arc;

use crate::cache::{CacheEntry, CacheStats, ChunkCache};
use crate::config::Config;
use crate::error::{ChunkError, Result};
use crate::fill::FillValue;
use crate::filter::{FilterDescriptor, FilterPipeline};
use crate::index::{ChunkIndex, ChunkRecord, ChunkRecords, IndexDescriptor, IndexKind};
use crate::layout::{ChunkCoord, ChunkLayout};
use crate::selection::Dataspace;
use crate::storage::StorageFile;
use crate::transport::Transport;

use header::{DatasetHeader, HEADER_VERSION};
use locking::Backing;

pub use options::{AllocTime, CopyOptions, DatasetOptions, DatasetOptionsBuilder};

/// Handle to one chunked dataset
pub struct Dataset {
    file: Arc<StorageFile>,

    /// Address and payload room of the persisted header
    header_addr: u64,
    header_capacity: usize,

    space: Dataspace,
    layout: ChunkLayout,
    index: ChunkIndex,
    cache: ChunkCache,
    pipeline: FilterPipeline,
    fill: FillValue,
    filter_partial_edges: bool,
    alloc_time: AllocTime,
    transport: Arc<dyn Transport>,

    /// Index descriptor as last written to the header
    persisted_index: IndexDescriptor,
}

impl Dataset {
    /// Create a new dataset in `file`
    ///
    /// Steps:
    /// 1. Validate the shape, fill value and filter list
    /// 2. Create an empty chunk index
    /// 3. Write the header block
    /// 4. Allocate every chunk when `AllocTime::Early`
    pub fn create(
        file: Arc<StorageFile>,
        space: Dataspace,
        options: DatasetOptions,
        config: &Config,
    ) -> Result<Self> {
        // Step 1: Validate
        config.validate()?;
        let layout = ChunkLayout::new(&options.chunk_dims, options.elem_size, &space)?;
        options.fill.validate(options.elem_size)?;
        let pipeline = FilterPipeline::new(&options.filters, &config.filters)?;

        // Step 2: Index
        let index = ChunkIndex::create(&file, &layout, options.index)?;
        let descriptor = index.descriptor();

        // Step 3: Header
        let header = DatasetHeader {
            version: HEADER_VERSION,
            dims: space.dims().to_vec(),
            max_dims: space.max_dims().to_vec(),
            chunk_dims: options.chunk_dims.clone(),
            elem_size: options.elem_size as u64,
            index: descriptor,
            fill: options.fill.clone(),
            filters: options.filters.clone(),
            filter_partial_edges: options.filter_partial_edges,
            alloc_time: options.alloc_time,
        };
        let (header_addr, header_capacity) = header.create(&file)?;
        if file.root().is_none() {
            file.set_root(Some(header_addr))?;
        }

        let mut dataset = Self {
            file,
            header_addr,
            header_capacity,
            space,
            layout,
            index,
            cache: ChunkCache::new(config.cache_slots, config.cache_bytes, config.cache_w0),
            pipeline,
            fill: options.fill,
            filter_partial_edges: options.filter_partial_edges,
            alloc_time: options.alloc_time,
            transport: Arc::clone(&config.transport),
            persisted_index: descriptor,
        };

        // Step 4: Early allocation
        if dataset.alloc_time == AllocTime::Early {
            let origin = vec![0u64; dataset.layout.rank()];
            dataset.allocate(&origin)?;
        }

        tracing::info!(
            "Created dataset at {} (dims={:?}, chunk={:?}, index={})",
            dataset.header_addr,
            dataset.space.dims(),
            dataset.layout.chunk_dims(),
            options.index.name()
        );
        Ok(dataset)
    }

    /// Open the dataset whose header lives at `header_addr`
    pub fn open(file: Arc<StorageFile>, header_addr: u64, config: &Config) -> Result<Self> {
        config.validate()?;
        let (header, header_capacity) = DatasetHeader::load(&file, header_addr)?;

        let space = Dataspace::new(&header.dims, &header.max_dims)
            .map_err(|e| ChunkError::cannot_load("dataset header", e.to_string()))?;
        let layout = ChunkLayout::new(&header.chunk_dims, header.elem_size as usize, &space)
            .map_err(|e| ChunkError::cannot_load("dataset header", e.to_string()))?;
        let pipeline = FilterPipeline::new(&header.filters, &config.filters)?;
        let index = ChunkIndex::open(&file, &layout, header.index)?;

        tracing::info!(
            "Opened dataset at {} (dims={:?}, index={})",
            header_addr,
            space.dims(),
            header.index.kind.name()
        );

        Ok(Self {
            file,
            header_addr,
            header_capacity,
            space,
            layout,
            index,
            cache: ChunkCache::new(config.cache_slots, config.cache_bytes, config.cache_w0),
            pipeline,
            fill: header.fill,
            filter_partial_edges: header.filter_partial_edges,
            alloc_time: header.alloc_time,
            transport: Arc::clone(&config.transport),
            persisted_index: header.index,
        })
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn file(&self) -> &Arc<StorageFile> {
        &self.file
    }

    /// Address to pass to [`Dataset::open`]
    pub fn header_addr(&self) -> u64 {
        self.header_addr
    }

    pub fn space(&self) -> &Dataspace {
        &self.space
    }

    pub fn dims(&self) -> &[u64] {
        self.space.dims()
    }

    pub fn layout(&self) -> &ChunkLayout {
        &self.layout
    }

    pub fn index_kind(&self) -> IndexKind {
        self.index.kind()
    }

    pub fn fill(&self) -> &FillValue {
        &self.fill
    }

    /// False when partial edge chunks are stored unfiltered
    pub fn filter_partial_edges(&self) -> bool {
        self.filter_partial_edges
    }

    pub fn alloc_time(&self) -> AllocTime {
        self.alloc_time
    }

    pub fn filters(&self) -> Vec<FilterDescriptor> {
        self.pipeline.descriptors()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Bytes held by resident cache entries
    pub fn cache_bytes_used(&self) -> usize {
        self.cache.nbytes_used()
    }

    // =========================================================================
    // Flush / Close
    // =========================================================================

    /// Write back dirty cached chunks, the header and the superblock
    pub fn flush(&mut self) -> Result<()> {
        self.flush_cache()?;
        self.sync_header()?;
        self.file.flush()
    }

    /// Flush and release the handle
    pub fn close(mut self) -> Result<()> {
        self.flush()?;
        tracing::info!("Closed dataset at {}", self.header_addr);
        Ok(())
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    /// Index record for one chunk, after writing back a dirty cached copy
    pub fn chunk_info(&mut self, coord: &ChunkCoord) -> Result<ChunkRecord> {
        self.layout.validate_coord(coord)?;
        self.flush_cached(coord)?;
        self.sync_header()?;
        self.index.get(&self.file, coord)
    }

    /// Every allocated chunk, in the index's order
    pub fn chunk_records(&mut self) -> Result<ChunkRecords<'_>> {
        self.flush_cache()?;
        self.sync_header()?;
        self.index.records(&self.file)
    }

    /// Stored bytes across all allocated chunks
    pub fn allocated_bytes(&mut self) -> Result<u64> {
        let mut total = 0u64;
        for record in self.chunk_records()? {
            total += record?.nbytes;
        }
        Ok(total)
    }

    /// One line per allocated chunk: coordinate, address, length, mask
    pub fn dump_index<W: Write>(&mut self, out: &mut W) -> Result<()> {
        let kind = self.index.kind().name();
        write!(out, "# index={} dims={:?}", kind, self.space.dims())?;
        if let Some(height) = self.index.height(&self.file)? {
            write!(out, " height={height}")?;
        }
        if let Some(capacity) = self.index.capacity() {
            write!(out, " capacity={capacity}")?;
        }
        writeln!(out)?;
        for record in self.chunk_records()? {
            let record = record?;
            writeln!(
                out,
                "{} addr={} nbytes={} mask={:#x}",
                record.coord,
                record.addr.map_or_else(|| "undef".to_string(), |a| a.to_string()),
                record.nbytes,
                record.filter_mask
            )?;
        }
        Ok(())
    }

    // =========================================================================
    // Internal Helpers
    // =========================================================================

    /// Split borrows: the cache, plus everything needed to write a chunk back
    pub(crate) fn parts(&mut self) -> (&mut ChunkCache, Backing<'_>) {
        (
            &mut self.cache,
            Backing {
                file: &self.file,
                index: &mut self.index,
                pipeline: &self.pipeline,
                layout: &self.layout,
                filter_partial_edges: self.filter_partial_edges,
            },
        )
    }

    pub(crate) fn flush_cache(&mut self) -> Result<()> {
        let (cache, mut backing) = self.parts();
        let mut flush = |entry: &mut CacheEntry| backing.flush_entry(entry);
        cache.flush_all(&mut flush)
    }

    /// Write back the cached copy of `coord`, if any
    pub(crate) fn flush_cached(&mut self, coord: &ChunkCoord) -> Result<()> {
        let scaled = self.layout.scaled(coord);
        if let Some(handle) = self.cached(coord, &scaled) {
            let (cache, mut backing) = self.parts();
            cache.flush_entry(handle, &mut |entry: &mut CacheEntry| backing.flush_entry(entry))?;
        }
        Ok(())
    }

    fn header(&self) -> DatasetHeader {
        DatasetHeader {
            version: HEADER_VERSION,
            dims: self.space.dims().to_vec(),
            max_dims: self.space.max_dims().to_vec(),
            chunk_dims: self.layout.chunk_dims().iter().map(|&d| d as u32).collect(),
            elem_size: self.layout.elem_size() as u64,
            index: self.index.descriptor(),
            fill: self.fill.clone(),
            filters: self.pipeline.descriptors(),
            filter_partial_edges: self.filter_partial_edges,
            alloc_time: self.alloc_time,
        }
    }

    /// Rewrite the header unconditionally
    pub(crate) fn persist_header(&mut self) -> Result<()> {
        let header = self.header();
        header.store(&self.file, self.header_addr, self.header_capacity)?;
        self.persisted_index = header.index;
        Ok(())
    }

    /// Rewrite the header if the index moved its root
    pub(crate) fn sync_header(&mut self) -> Result<()> {
        if self.index.descriptor() != self.persisted_index {
            self.persist_header()?;
        }
        Ok(())
    }

    pub(crate) fn check_writable(&self) -> Result<()> {
        if self.file.is_writable() {
            Ok(())
        } else {
            Err(ChunkError::Resource(format!(
                "{} is open read-only",
                self.file.path().display()
            )))
        }
    }
}

impl std::fmt::Debug for Dataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dataset")
            .field("header_addr", &self.header_addr)
            .field("dims", &self.space.dims())
            .field("chunk_dims", &self.layout.chunk_dims())
            .field("index", &self.index.kind())
            .field("cache", &self.cache)
            .finish()
    }
}
