//! Transport
//!
//! Hook for running several independent engine instances against one file.
//! The engine only needs to know whether it is in parallel mode, which rank
//! it is, and how to wait for everyone else.

use std::fmt::Debug;

use crate::error::Result;

pub trait Transport: Send + Sync + Debug {
    /// True when other processes share the file
    fn is_parallel(&self) -> bool;

    /// This process' rank (0 writes shared fill data)
    fn rank(&self) -> usize {
        0
    }

    /// Block until every process reaches this point
    fn barrier(&self) -> Result<()>;
}

/// Default: one process, barriers are no-ops
#[derive(Debug, Default, Clone, Copy)]
pub struct SingleProcess;

impl Transport for SingleProcess {
    fn is_parallel(&self) -> bool {
        false
    }

    fn barrier(&self) -> Result<()> {
        Ok(())
    }
}
