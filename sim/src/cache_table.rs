//! Per-kamlet cache-line slot table: the lazy-eviction SRAM cache sitting in
//! front of a kamlet's memlet (spec.md §3.3).
//!
//! Each slot cycles through `Unallocated -> Invalid -> Reading -> Shared ->
//! Modified -> OldModified -> WritingReading -> Shared`. Reassignment (lazy
//! eviction, `_get_new_slot` in the original) is refused while any slot is
//! `WritingReading` the same `memory_loc`, since that slot's resident data is
//! mid-flight to DRAM and reusing the line would race the writeback.

use std::collections::VecDeque;

use crate::witem::{WaitingItem, WitemArbitration};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheLineState {
    Unallocated,
    Invalid,
    Reading,
    Shared,
    Modified,
    OldModified,
    WritingReading,
}

#[derive(Debug, Clone)]
pub struct CacheLineSlot {
    pub state: CacheLineState,
    /// Cache-line-aligned kamlet byte address currently resident in this
    /// slot, or `None` while `Unallocated`.
    pub memory_loc: Option<u64>,
}

impl CacheLineSlot {
    fn new() -> Self {
        CacheLineSlot {
            state: CacheLineState::Unallocated,
            memory_loc: None,
        }
    }
}

pub struct CacheTable {
    slots: Vec<CacheLineSlot>,
    cache_line_bytes: usize,
    /// FIFO of witems awaiting arbitration against the slot table, in the
    /// order they were submitted (`add_witem`).
    witem_queue: VecDeque<WaitingItem>,
    /// Slots reserved for message-driven witems, never handed out by the
    /// normal kinstr arbitration path.
    n_reserved: usize,
}

impl CacheTable {
    pub fn new(n_slots: usize, cache_line_bytes: usize, n_reserved: usize) -> Self {
        CacheTable {
            slots: (0..n_slots).map(|_| CacheLineSlot::new()).collect(),
            cache_line_bytes,
            witem_queue: VecDeque::new(),
            n_reserved,
        }
    }

    pub fn n_slots(&self) -> usize {
        self.slots.len()
    }

    pub fn slot(&self, index: usize) -> &CacheLineSlot {
        &self.slots[index]
    }

    pub fn slot_memory_loc(&self, index: usize) -> u64 {
        self.slots[index]
            .memory_loc
            .expect("to_k_maddr called against an unallocated slot")
            / self.cache_line_bytes as u64
    }

    /// Slot currently resident for a kamlet-memory byte address, if any.
    pub fn addr_to_slot(&self, addr: u64) -> Option<usize> {
        let line = (addr / self.cache_line_bytes as u64) * self.cache_line_bytes as u64;
        self.slots
            .iter()
            .position(|s| s.memory_loc == Some(line) && s.state != CacheLineState::Unallocated)
    }

    /// Finds a slot to (re)assign to `memory_loc`, honoring lazy eviction:
    /// an `Unallocated`/`Invalid` slot is preferred, then any `Shared` slot
    /// not currently the target of an in-flight writeback. Returns `None`
    /// if every candidate is pinned by a `WritingReading` peer on the same
    /// line (the caller must retry next cycle).
    pub fn get_new_slot(&mut self, memory_loc: u64) -> Option<usize> {
        if self
            .slots
            .iter()
            .any(|s| s.state == CacheLineState::WritingReading && s.memory_loc == Some(memory_loc))
        {
            return None;
        }
        let candidate = self
            .slots
            .iter()
            .position(|s| matches!(s.state, CacheLineState::Unallocated | CacheLineState::Invalid))
            .or_else(|| {
                self.slots.iter().position(|s| {
                    matches!(s.state, CacheLineState::Shared)
                        && s.memory_loc.map_or(true, |loc| {
                            !self.slots.iter().any(|o| {
                                o.state == CacheLineState::WritingReading && o.memory_loc == Some(loc)
                            })
                        })
                })
            })?;
        let slot = &mut self.slots[candidate];
        slot.state = CacheLineState::Invalid;
        slot.memory_loc = Some(memory_loc);
        Some(candidate)
    }

    pub fn set_state(&mut self, index: usize, state: CacheLineState) {
        self.slots[index].state = state;
    }

    pub fn add_witem(&mut self, witem: WaitingItem) {
        self.witem_queue.push_back(witem);
    }

    pub fn witems(&self) -> impl Iterator<Item = &WaitingItem> {
        self.witem_queue.iter()
    }

    pub fn witems_mut(&mut self) -> impl Iterator<Item = &mut WaitingItem> {
        self.witem_queue.iter_mut()
    }

    pub fn remove_witem<F: FnMut(&WaitingItem) -> bool>(&mut self, mut pred: F) -> Option<WaitingItem> {
        let pos = self.witem_queue.iter().position(|w| pred(w))?;
        self.witem_queue.remove(pos)
    }

    pub fn n_reserved(&self) -> usize {
        self.n_reserved
    }

    /// Arbitration rule 1 (spec.md §4.2): whether any `reads_all_memory`
    /// witem is currently outstanding on this kamlet (e.g. an
    /// `OrderedIndexedLoad` barrier). A new write witem must not be admitted
    /// while this holds.
    pub fn has_active_reads_all_memory(&self) -> bool {
        self.witem_queue.iter().any(|w| w.reads_all_memory())
    }

    /// Arbitration rule 2 (spec.md §4.2): whether a `writes_all_memory`
    /// witem from a *different* `writeset_ident` is outstanding. A new read,
    /// or a write from yet another writeset, must not be admitted while this
    /// holds.
    pub fn has_conflicting_writes_all_memory(&self, writeset_ident: Option<u32>) -> bool {
        self.witem_queue
            .iter()
            .any(|w| w.writes_all_memory() && w.writeset_ident() != writeset_ident)
    }

    /// Whether a write witem may be admitted right now: no `reads_all_memory`
    /// barrier outstanding, and no conflicting `writes_all_memory` witem
    /// (spec.md §4.2 rules 1, 2, 4).
    pub fn can_write(&self, writeset_ident: Option<u32>) -> bool {
        !self.has_active_reads_all_memory() && !self.has_conflicting_writes_all_memory(writeset_ident)
    }

    /// Whether a plain read may be admitted right now: no `writes_all_memory`
    /// witem outstanding, of any writeset (spec.md §4.2 rules 3, 5 — a read
    /// is never itself part of a writeset, so it yields to every pending
    /// memory-wide write barrier).
    pub fn can_read(&self) -> bool {
        !self.witem_queue.iter().any(|w| w.writes_all_memory())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::witem::{WaitingOrderedIndexedLoad, WaitingChunkTransfer};

    #[test]
    fn reads_all_memory_barrier_blocks_new_writes_but_not_reads() {
        let mut table = CacheTable::new(4, 64, 1);
        assert!(table.can_write(Some(1)));
        assert!(table.can_read());
        table.add_witem(WaitingItem::OrderedIndexedLoad(WaitingOrderedIndexedLoad::new(7)));
        assert!(!table.can_write(Some(1)), "a write must not be admitted while a read-all-memory barrier is active");
        assert!(table.can_read(), "a read-all-memory barrier does not block other reads");
    }

    #[test]
    fn writes_all_memory_blocks_reads_and_other_writesets_but_not_same_writeset() {
        let mut table = CacheTable::new(4, 64, 1);
        table.add_witem(WaitingItem::ChunkTransfer(WaitingChunkTransfer {
            instr_ident: 1,
            writeset_ident: Some(42),
            is_store: true,
            outstanding: 1,
        }));
        assert!(!table.can_read(), "a pending write-all-memory chunk blocks new reads");
        assert!(!table.can_write(Some(99)), "a different writeset must not be admitted concurrently");
        assert!(table.can_write(Some(42)), "the same writeset may keep submitting non-conflicting writes");
    }

    #[test]
    fn new_slots_start_unallocated() {
        let table = CacheTable::new(4, 64, 1);
        assert_eq!(table.n_slots(), 4);
        assert_eq!(table.slot(0).state, CacheLineState::Unallocated);
        assert!(table.addr_to_slot(0).is_none());
    }

    #[test]
    fn get_new_slot_prefers_unallocated_then_tracks_addr() {
        let mut table = CacheTable::new(2, 64, 0);
        let slot = table.get_new_slot(128).unwrap();
        table.set_state(slot, CacheLineState::Shared);
        assert_eq!(table.addr_to_slot(128), Some(slot));
        assert_eq!(table.addr_to_slot(192), None);
    }

    #[test]
    fn writing_reading_blocks_reassignment_of_same_line() {
        let mut table = CacheTable::new(1, 64, 0);
        let slot = table.get_new_slot(64).unwrap();
        table.set_state(slot, CacheLineState::WritingReading);
        assert!(table.get_new_slot(64).is_none());
    }
}
