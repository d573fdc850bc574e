//! Fill values
//!
//! What a never-written element reads back as, and when that value is
//! physically written.

use serde::{Deserialize, Serialize};

use crate::error::{ChunkError, Result};

/// When fill values are materialized
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FillTime {
    /// Always write fill into newly allocated chunks
    Alloc,
    /// Only when the user set a fill value
    #[default]
    IfSet,
    /// Never: missing chunks leave the caller's buffer untouched on read
    Never,
}

/// Fill policy plus the optional user value (one element's bytes)
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FillValue {
    pub time: FillTime,
    /// `None` means the default value (all zero bytes)
    pub value: Option<Vec<u8>>,
}

impl FillValue {
    pub fn new(time: FillTime, value: Option<Vec<u8>>) -> Self {
        Self { time, value }
    }

    /// User-defined value, written if-set
    pub fn with_value(value: Vec<u8>) -> Self {
        Self::new(FillTime::IfSet, Some(value))
    }

    /// Whether fill is written into newly allocated chunks
    pub fn materializes(&self) -> bool {
        match self.time {
            FillTime::Alloc => true,
            FillTime::IfSet => self.value.is_some(),
            FillTime::Never => false,
        }
    }

    /// Whether a never-written chunk reads back as fill (the default value
    /// counts) instead of leaving the caller's buffer untouched
    pub fn reads_as_fill(&self) -> bool {
        self.time != FillTime::Never
    }

    pub fn validate(&self, elem_size: usize) -> Result<()> {
        match &self.value {
            Some(v) if v.len() != elem_size => Err(ChunkError::Config(format!(
                "fill value is {} bytes, element size is {}",
                v.len(),
                elem_size
            ))),
            _ => Ok(()),
        }
    }

    /// One element's worth of fill bytes
    pub fn pattern(&self, elem_size: usize) -> Vec<u8> {
        match &self.value {
            Some(v) => v.clone(),
            None => vec![0; elem_size],
        }
    }

    /// `nelmts` repetitions of the pattern
    pub fn buffer(&self, elem_size: usize, nelmts: usize) -> Vec<u8> {
        match &self.value {
            Some(v) if v.iter().any(|&b| b != 0) => v.repeat(nelmts),
            _ => vec![0; elem_size * nelmts],
        }
    }
}
