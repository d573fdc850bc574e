//! Free-space tracking
//!
//! Released blocks are kept as coalesced `(addr, len)` extents and handed
//! back out first-fit. The list lives in memory only; space freed in an
//! earlier session is not reclaimed after reopening.

use std::collections::BTreeMap;

#[derive(Debug, Default)]
pub(crate) struct FreeSpace {
    /// start address → length
    extents: BTreeMap<u64, u64>,
}

impl FreeSpace {
    /// Return a block to the pool, merging with adjacent extents
    pub(crate) fn release(&mut self, addr: u64, len: u64) {
        if len == 0 {
            return;
        }
        let mut start = addr;
        let mut end = addr + len;

        if let Some((&prev_addr, &prev_len)) = self.extents.range(..addr).next_back() {
            debug_assert!(prev_addr + prev_len <= addr, "double free at {addr}");
            if prev_addr + prev_len == addr {
                self.extents.remove(&prev_addr);
                start = prev_addr;
            }
        }
        if let Some(next_len) = self.extents.remove(&end) {
            end += next_len;
        }

        self.extents.insert(start, end - start);
    }

    /// First-fit allocation out of released space
    pub(crate) fn take(&mut self, len: u64) -> Option<u64> {
        let (&addr, &extent_len) = self.extents.iter().find(|(_, &l)| l >= len)?;
        self.extents.remove(&addr);
        if extent_len > len {
            self.extents.insert(addr + len, extent_len - len);
        }
        Some(addr)
    }

    /// If the last extent ends exactly at `eoa`, remove it and return its start
    pub(crate) fn take_tail(&mut self, eoa: u64) -> Option<u64> {
        let (&addr, &len) = self.extents.iter().next_back()?;
        if addr + len == eoa {
            self.extents.remove(&addr);
            Some(addr)
        } else {
            None
        }
    }

    /// Total bytes currently on the free list
    pub(crate) fn total(&self) -> u64 {
        self.extents.values().sum()
    }
}
