//! Dataset creation and copy options

use serde::{Deserialize, Serialize};

use crate::convert::TypeConversion;
use crate::fill::{FillTime, FillValue};
use crate::filter::FilterDescriptor;
use crate::index::IndexKind;

/// When chunk storage is allocated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AllocTime {
    /// Every chunk of the extent at creation and on every growth
    Early,
    /// On first write, or an explicit `allocate`
    #[default]
    Incremental,
}

/// Creation properties fixed for the life of a dataset
#[derive(Debug, Clone)]
pub struct DatasetOptions {
    pub chunk_dims: Vec<u32>,
    /// Bytes per element
    pub elem_size: usize,
    pub index: IndexKind,
    pub fill: FillValue,
    pub filters: Vec<FilterDescriptor>,
    /// When false, chunks sticking out past the extent are stored unfiltered
    pub filter_partial_edges: bool,
    pub alloc_time: AllocTime,
}

impl DatasetOptions {
    /// Start building options for a chunk shape and element size
    pub fn builder(chunk_dims: &[u32], elem_size: usize) -> DatasetOptionsBuilder {
        DatasetOptionsBuilder {
            options: DatasetOptions {
                chunk_dims: chunk_dims.to_vec(),
                elem_size,
                index: IndexKind::default(),
                fill: FillValue::default(),
                filters: Vec::new(),
                filter_partial_edges: true,
                alloc_time: AllocTime::default(),
            },
        }
    }
}

/// Builder for DatasetOptions
pub struct DatasetOptionsBuilder {
    options: DatasetOptions,
}

impl DatasetOptionsBuilder {
    /// Choose the chunk index backend
    pub fn index(mut self, kind: IndexKind) -> Self {
        self.options.index = kind;
        self
    }

    /// Set the full fill policy
    pub fn fill(mut self, fill: FillValue) -> Self {
        self.options.fill = fill;
        self
    }

    /// Set a user fill value (one element's bytes)
    pub fn fill_value(mut self, value: Vec<u8>) -> Self {
        self.options.fill.value = Some(value);
        self
    }

    pub fn fill_time(mut self, time: FillTime) -> Self {
        self.options.fill.time = time;
        self
    }

    /// Append a filter to the pipeline
    pub fn filter(mut self, filter: FilterDescriptor) -> Self {
        self.options.filters.push(filter);
        self
    }

    /// Whether partial edge chunks go through the filter pipeline
    pub fn filter_partial_edges(mut self, enabled: bool) -> Self {
        self.options.filter_partial_edges = enabled;
        self
    }

    pub fn alloc_time(mut self, alloc_time: AllocTime) -> Self {
        self.options.alloc_time = alloc_time;
        self
    }

    pub fn build(self) -> DatasetOptions {
        self.options
    }
}

/// How [`Dataset::copy_to`](super::Dataset::copy_to) lays out the copy
#[derive(Debug, Default, Clone, Copy)]
pub struct CopyOptions<'a> {
    /// Index backend for the destination (defaults to the source's kind)
    pub index: Option<IndexKind>,
    /// Element conversion applied to every chunk and to the fill value
    pub conversion: Option<&'a dyn TypeConversion>,
}
