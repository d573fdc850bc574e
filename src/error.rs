//! Error types for chunkstore
//!
//! One error type covers every layer: storage file, index, cache, filters
//! and the dataset I/O path. Variants are grouped by failure class so callers
//! can tell data corruption (`Filter`) from structural corruption
//! (`CannotLoad`) and from plain I/O failures (`Io`).

use thiserror::Error;

/// Result type alias using ChunkError
pub type Result<T> = std::result::Result<T, ChunkError>;

/// Unified error type for chunkstore operations
#[derive(Debug, Error)]
pub enum ChunkError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // Resource Errors
    // -------------------------------------------------------------------------
    #[error("Out of file space: requested {requested} bytes, limit is {limit}")]
    OutOfSpace { requested: u64, limit: u64 },

    #[error("Resource error: {0}")]
    Resource(String),

    // -------------------------------------------------------------------------
    // Corruption Errors
    // -------------------------------------------------------------------------
    #[error("Cannot load {structure}: {reason}")]
    CannotLoad {
        structure: &'static str,
        reason: String,
    },

    // -------------------------------------------------------------------------
    // Selection / Shape Errors
    // -------------------------------------------------------------------------
    #[error("Selection error: {0}")]
    Selection(String),

    #[error("Chunk not allocated")]
    ChunkNotAllocated,

    // -------------------------------------------------------------------------
    // Filter & Conversion Errors
    // -------------------------------------------------------------------------
    #[error("Filter pipeline error: {0}")]
    Filter(String),

    #[error("Datatype conversion error: {0}")]
    Conversion(String),

    // -------------------------------------------------------------------------
    // Serialization Errors
    // -------------------------------------------------------------------------
    #[error("Serialization error: {0}")]
    Serialization(String),

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),

    // -------------------------------------------------------------------------
    // Transport Errors
    // -------------------------------------------------------------------------
    #[error("Transport error: {0}")]
    Transport(String),
}

impl ChunkError {
    /// Shorthand for a load-time corruption error
    pub(crate) fn cannot_load(structure: &'static str, reason: impl Into<String>) -> Self {
        ChunkError::CannotLoad {
            structure,
            reason: reason.into(),
        }
    }

    /// True for errors raised while decoding a malformed on-disk structure
    pub fn is_corruption(&self) -> bool {
        matches!(self, ChunkError::CannotLoad { .. })
    }
}
