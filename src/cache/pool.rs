//! Chunk cache arena, slots and recency list

use crate::error::{ChunkError, Result};
use crate::layout::ChunkCoord;

use super::{CacheEntry, CacheStats, EntryHandle};

struct ArenaSlot {
    generation: u64,
    entry: Option<CacheEntry>,
}

/// Direct-mapped, byte-bounded cache of decoded chunks
pub struct ChunkCache {
    arena: Vec<ArenaSlot>,
    /// Arena indices available for reuse
    free: Vec<usize>,
    /// Hash slot -> arena index
    slots: Vec<Option<usize>>,

    head: Option<usize>,
    tail: Option<usize>,

    nused: usize,
    nbytes_used: usize,
    nbytes_max: usize,
    w0: f64,

    stats: CacheStats,
}

impl ChunkCache {
    pub fn new(nslots: usize, nbytes_max: usize, w0: f64) -> Self {
        Self {
            arena: Vec::new(),
            free: Vec::new(),
            slots: vec![None; nslots],
            head: None,
            tail: None,
            nused: 0,
            nbytes_used: 0,
            nbytes_max,
            w0,
            stats: CacheStats::default(),
        }
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// False when configured with no slots or no bytes
    pub fn is_enabled(&self) -> bool {
        !self.slots.is_empty() && self.nbytes_max > 0
    }

    pub fn nslots(&self) -> usize {
        self.slots.len()
    }

    pub fn nbytes_max(&self) -> usize {
        self.nbytes_max
    }

    pub fn nbytes_used(&self) -> usize {
        self.nbytes_used
    }

    pub fn len(&self) -> usize {
        self.nused
    }

    pub fn is_empty(&self) -> bool {
        self.nused == 0
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    /// Count an entry built from fill rather than read from disk
    pub fn record_init(&mut self) {
        self.stats.inits += 1;
    }

    pub fn get(&self, handle: EntryHandle) -> Option<&CacheEntry> {
        self.arena
            .get(handle.index)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.entry.as_ref())
    }

    pub fn get_mut(&mut self, handle: EntryHandle) -> Option<&mut CacheEntry> {
        self.arena
            .get_mut(handle.index)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.entry.as_mut())
    }

    fn handle_of(&self, index: usize) -> EntryHandle {
        EntryHandle {
            index,
            generation: self.arena[index].generation,
        }
    }

    /// Handles of every resident entry, head (oldest) first
    pub fn handles(&self) -> Vec<EntryHandle> {
        self.list_indices()
            .into_iter()
            .map(|i| self.handle_of(i))
            .collect()
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    /// Whatever occupies `slot`
    pub fn occupant(&self, slot: usize) -> Option<EntryHandle> {
        self.slots.get(slot).copied().flatten().map(|i| self.handle_of(i))
    }

    /// The entry for `coord` if it sits in `slot`, without touching stats
    /// or recency
    pub fn find(&self, slot: usize, coord: &ChunkCoord) -> Option<EntryHandle> {
        let handle = self.occupant(slot)?;
        let entry = self.get(handle)?;
        (&entry.coord == coord).then_some(handle)
    }

    /// Like [`find`](Self::find), counting a hit or miss and promoting the
    /// entry one step toward the tail on a hit
    pub fn lookup(&mut self, slot: usize, coord: &ChunkCoord) -> Option<EntryHandle> {
        match self.find(slot, coord) {
            Some(handle) => {
                self.stats.hits += 1;
                self.promote(handle.index);
                Some(handle)
            }
            None => {
                self.stats.misses += 1;
                None
            }
        }
    }

    // =========================================================================
    // Insert / Remove
    // =========================================================================

    /// Add an entry at the tail; `slot` must be free
    pub fn insert(&mut self, slot: usize, mut entry: CacheEntry) -> Result<EntryHandle> {
        if self.slots.get(slot).copied().flatten().is_some() || slot >= self.slots.len() {
            return Err(ChunkError::Resource(format!(
                "cache slot {slot} is not available"
            )));
        }
        entry.slot = slot;
        self.nbytes_used += entry.buf.len();
        self.nused += 1;

        let index = match self.free.pop() {
            Some(index) => {
                self.arena[index].entry = Some(entry);
                index
            }
            None => {
                self.arena.push(ArenaSlot {
                    generation: 0,
                    entry: Some(entry),
                });
                self.arena.len() - 1
            }
        };
        self.slots[slot] = Some(index);
        self.link_tail(index);
        Ok(self.handle_of(index))
    }

    /// Flush (if dirty and not deleted) and remove one entry
    ///
    /// A failed flush leaves the entry resident and dirty.
    pub fn evict<F>(&mut self, handle: EntryHandle, flush: &mut F) -> Result<()>
    where
        F: FnMut(&mut CacheEntry) -> Result<()>,
    {
        if self.get(handle).is_none() {
            return Ok(());
        }
        self.flush_index(handle.index, flush)?;
        self.remove_index(handle.index);
        self.stats.evictions += 1;
        Ok(())
    }

    /// Remove one entry without writing it back
    pub fn discard(&mut self, handle: EntryHandle) -> Option<CacheEntry> {
        self.get(handle)?;
        self.stats.evictions += 1;
        self.remove_index(handle.index)
    }

    /// Drop every entry without writing anything
    pub fn discard_all(&mut self) {
        for index in self.list_indices() {
            self.remove_index(index);
            self.stats.evictions += 1;
        }
    }

    // =========================================================================
    // Flush
    // =========================================================================

    /// Write back one entry if dirty; it stays resident
    pub fn flush_entry<F>(&mut self, handle: EntryHandle, flush: &mut F) -> Result<()>
    where
        F: FnMut(&mut CacheEntry) -> Result<()>,
    {
        if self.get(handle).is_none() {
            return Ok(());
        }
        self.flush_index(handle.index, flush)
    }

    /// Write back every dirty entry; returns the first failure after trying
    /// them all
    pub fn flush_all<F>(&mut self, flush: &mut F) -> Result<()>
    where
        F: FnMut(&mut CacheEntry) -> Result<()>,
    {
        let mut first_err = None;
        for index in self.list_indices() {
            if let Err(e) = self.flush_index(index, flush) {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    fn flush_index<F>(&mut self, index: usize, flush: &mut F) -> Result<()>
    where
        F: FnMut(&mut CacheEntry) -> Result<()>,
    {
        let Some(entry) = self.arena[index].entry.as_mut() else {
            return Ok(());
        };
        if entry.dirty && !entry.deleted {
            flush(entry)?;
            entry.dirty = false;
            self.stats.flushes += 1;
            tracing::debug!("Flushed cached chunk {}", entry.coord);
        }
        Ok(())
    }

    // =========================================================================
    // Eviction
    // =========================================================================

    /// Make room for `incoming` bytes
    ///
    /// Cursor A sweeps from the head evicting fully accessed entries; cursor
    /// B follows `nused * w0` steps behind and evicts any unlocked entry.
    /// Stops once the budget fits or both cursors run off the tail. Entries
    /// whose flush fails stay put; the first such error is returned.
    pub fn prune<F>(&mut self, incoming: usize, flush: &mut F) -> Result<()>
    where
        F: FnMut(&mut CacheEntry) -> Result<()>,
    {
        let mut first_err = None;
        let mut countdown = (self.nused as f64 * self.w0) as usize;
        let mut cursors = [self.head, None];
        let mut b_started = false;
        if countdown == 0 {
            cursors[1] = self.head;
            b_started = true;
        }
        let before = self.nused;

        while self.over_budget(incoming) && cursors.iter().any(Option::is_some) {
            let mut next = cursors.map(|c| c.and_then(|i| self.arena[i].entry.as_ref()?.next));

            for (j, cursor) in cursors.into_iter().enumerate() {
                let Some(index) = cursor else { continue };
                if !self.over_budget(incoming) {
                    break;
                }
                // the other cursor may have taken it this round
                let Some(entry) = self.arena[index].entry.as_ref() else {
                    continue;
                };
                if entry.locked || (j == 0 && !entry.fully_accessed()) {
                    continue;
                }

                let after = entry.next;
                match self.flush_index(index, flush) {
                    Ok(()) => {
                        self.remove_index(index);
                        self.stats.evictions += 1;
                        for n in next.iter_mut() {
                            if *n == Some(index) {
                                *n = after;
                            }
                        }
                    }
                    Err(e) => {
                        first_err.get_or_insert(e);
                    }
                }
            }

            cursors = next;
            if !b_started {
                if countdown == 0 {
                    cursors[1] = self.head;
                    b_started = true;
                } else {
                    countdown -= 1;
                }
            }
        }

        if before != self.nused {
            tracing::debug!(
                "Cache prune evicted {} entries ({} bytes resident)",
                before - self.nused,
                self.nbytes_used
            );
        }
        first_err.map_or(Ok(()), Err)
    }

    fn over_budget(&self, incoming: usize) -> bool {
        self.nbytes_used + incoming > self.nbytes_max
    }

    /// Reassign slots after an extent change
    ///
    /// Walks the list head first; an entry whose new slot is already claimed
    /// is flushed and evicted. Flushes happen before anything moves, so a
    /// failure leaves the cache as it was.
    pub fn rehash<S, F>(&mut self, slot_of: S, flush: &mut F) -> Result<()>
    where
        S: Fn(&CacheEntry) -> usize,
        F: FnMut(&mut CacheEntry) -> Result<()>,
    {
        let nslots = self.slots.len();
        let mut claimed = vec![false; nslots];
        let mut placed = Vec::new();
        let mut losers = Vec::new();

        for index in self.list_indices() {
            let Some(entry) = self.arena[index].entry.as_ref() else {
                continue;
            };
            let slot = slot_of(entry);
            debug_assert!(slot < nslots);
            if claimed[slot] {
                losers.push(index);
            } else {
                claimed[slot] = true;
                placed.push((index, slot));
            }
        }

        for &index in &losers {
            self.flush_index(index, flush)?;
        }
        for index in losers {
            self.remove_index(index);
            self.stats.evictions += 1;
        }

        self.slots.fill(None);
        for (index, slot) in placed {
            self.slots[slot] = Some(index);
            if let Some(entry) = self.arena[index].entry.as_mut() {
                entry.slot = slot;
            }
        }
        Ok(())
    }

    // =========================================================================
    // List Maintenance
    // =========================================================================

    fn list_indices(&self) -> Vec<usize> {
        let mut out = Vec::with_capacity(self.nused);
        let mut cur = self.head;
        while let Some(index) = cur {
            out.push(index);
            cur = self.arena[index].entry.as_ref().and_then(|e| e.next);
        }
        out
    }

    fn entry_mut(&mut self, index: usize) -> Option<&mut CacheEntry> {
        self.arena.get_mut(index).and_then(|s| s.entry.as_mut())
    }

    fn link_tail(&mut self, index: usize) {
        let old_tail = self.tail;
        if let Some(entry) = self.entry_mut(index) {
            entry.prev = old_tail;
            entry.next = None;
        }
        match old_tail {
            Some(t) => {
                if let Some(tail) = self.entry_mut(t) {
                    tail.next = Some(index);
                }
            }
            None => self.head = Some(index),
        }
        self.tail = Some(index);
    }

    fn unlink(&mut self, index: usize) {
        let (prev, next) = match self.entry_mut(index) {
            Some(entry) => (entry.prev.take(), entry.next.take()),
            None => return,
        };
        match prev {
            Some(p) => {
                if let Some(e) = self.entry_mut(p) {
                    e.next = next;
                }
            }
            None => self.head = next,
        }
        match next {
            Some(n) => {
                if let Some(e) = self.entry_mut(n) {
                    e.prev = prev;
                }
            }
            None => self.tail = prev,
        }
    }

    /// Move an entry one position toward the tail
    fn promote(&mut self, index: usize) {
        let Some(next) = self.arena[index].entry.as_ref().and_then(|e| e.next) else {
            return;
        };
        self.unlink(index);
        let after = self.entry_mut(next).and_then(|e| e.next);
        if let Some(entry) = self.entry_mut(index) {
            entry.prev = Some(next);
            entry.next = after;
        }
        if let Some(e) = self.entry_mut(next) {
            e.next = Some(index);
        }
        match after {
            Some(a) => {
                if let Some(e) = self.entry_mut(a) {
                    e.prev = Some(index);
                }
            }
            None => self.tail = Some(index),
        }
    }

    fn remove_index(&mut self, index: usize) -> Option<CacheEntry> {
        self.arena.get(index)?.entry.as_ref()?;
        self.unlink(index);
        let arena_slot = &mut self.arena[index];
        let entry = arena_slot.entry.take()?;
        arena_slot.generation += 1;
        self.free.push(index);

        if self.slots.get(entry.slot).copied().flatten() == Some(index) {
            self.slots[entry.slot] = None;
        }
        self.nused -= 1;
        self.nbytes_used -= entry.buf.len();
        Some(entry)
    }
}

impl std::fmt::Debug for ChunkCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkCache")
            .field("nslots", &self.slots.len())
            .field("nused", &self.nused)
            .field("nbytes_used", &self.nbytes_used)
            .field("nbytes_max", &self.nbytes_max)
            .field("stats", &self.stats)
            .finish()
    }
}
