//! Waiting items: units of in-flight kamlet work arbitrated against the
//! cache table (spec.md §3.4). The original models these as a class
//! hierarchy with per-subclass `ready()`/`monitor_kamlet()`/`finalize()`
//! overrides; here that becomes one tagged enum plus a small trait so
//! dispatch stays a `match` instead of a vtable.

use crate::address::KMAddr;

/// Cross-cutting properties every witem variant answers, used by the
/// arbitration barrier rules (a `reads_all_memory`/`writes_all_memory` item
/// cannot run concurrently with any other witem touching the same kamlet).
pub trait WitemArbitration {
    fn reads_all_memory(&self) -> bool {
        false
    }
    fn writes_all_memory(&self) -> bool {
        false
    }
    /// Items sharing a `writeset_ident` commit in the order they were
    /// submitted relative to each other.
    fn writeset_ident(&self) -> Option<u32> {
        None
    }
    /// Whether this witem is actively writing cache state right now (as
    /// opposed to merely reading it), for the `reads_all_memory` exclusivity
    /// check (spec.md §4.2 rule 1: a `reads_all_memory` witem cannot coexist
    /// with any write witem).
    fn is_active_write(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    NotStarted,
    InProgress,
    Complete,
}

/// A line fetch/allocate triggered by a kinstr that missed the cache table.
#[derive(Debug, Clone)]
pub struct WaitingCacheFetch {
    pub instr_ident: u32,
    pub k_maddr: KMAddr,
    pub is_write: bool,
    pub writeset_ident: Option<u32>,
    pub slot: Option<usize>,
}

impl WitemArbitration for WaitingCacheFetch {
    fn writeset_ident(&self) -> Option<u32> {
        self.writeset_ident
    }
    fn is_active_write(&self) -> bool {
        self.is_write
    }
}

/// Barrier witem for `OrderedIndexedLoad`: every kamlet must observe this
/// before any `LoadIndexedElement` response for the same `instr_ident` can
/// be trusted to reflect a consistent memory snapshot.
#[derive(Debug, Clone)]
pub struct WaitingOrderedIndexedLoad {
    pub instr_ident: u32,
    pub sync_state: SyncPhase,
}

impl WaitingOrderedIndexedLoad {
    pub fn new(instr_ident: u32) -> Self {
        WaitingOrderedIndexedLoad {
            instr_ident,
            sync_state: SyncPhase::NotStarted,
        }
    }

    pub fn ready(&self) -> bool {
        self.sync_state == SyncPhase::Complete
    }
}

impl WitemArbitration for WaitingOrderedIndexedLoad {
    fn reads_all_memory(&self) -> bool {
        true
    }
}

/// A strided or unordered-indexed load/store chunk awaiting per-byte
/// j2j transactions to complete.
#[derive(Debug, Clone)]
pub struct WaitingChunkTransfer {
    pub instr_ident: u32,
    pub writeset_ident: Option<u32>,
    pub is_store: bool,
    pub outstanding: usize,
}

impl WitemArbitration for WaitingChunkTransfer {
    fn writes_all_memory(&self) -> bool {
        self.is_store
    }
    fn writeset_ident(&self) -> Option<u32> {
        self.writeset_ident
    }
    fn is_active_write(&self) -> bool {
        self.is_store
    }
}

#[derive(Debug, Clone)]
pub enum WaitingItem {
    CacheFetch(WaitingCacheFetch),
    OrderedIndexedLoad(WaitingOrderedIndexedLoad),
    ChunkTransfer(WaitingChunkTransfer),
}

impl WaitingItem {
    pub fn instr_ident(&self) -> u32 {
        match self {
            WaitingItem::CacheFetch(w) => w.instr_ident,
            WaitingItem::OrderedIndexedLoad(w) => w.instr_ident,
            WaitingItem::ChunkTransfer(w) => w.instr_ident,
        }
    }

    pub fn ready(&self) -> bool {
        match self {
            WaitingItem::CacheFetch(w) => w.slot.is_some(),
            WaitingItem::OrderedIndexedLoad(w) => w.ready(),
            WaitingItem::ChunkTransfer(w) => w.outstanding == 0,
        }
    }
}

impl WitemArbitration for WaitingItem {
    fn reads_all_memory(&self) -> bool {
        match self {
            WaitingItem::CacheFetch(w) => w.reads_all_memory(),
            WaitingItem::OrderedIndexedLoad(w) => w.reads_all_memory(),
            WaitingItem::ChunkTransfer(w) => w.reads_all_memory(),
        }
    }

    fn writes_all_memory(&self) -> bool {
        match self {
            WaitingItem::CacheFetch(w) => w.writes_all_memory(),
            WaitingItem::OrderedIndexedLoad(w) => w.writes_all_memory(),
            WaitingItem::ChunkTransfer(w) => w.writes_all_memory(),
        }
    }

    fn writeset_ident(&self) -> Option<u32> {
        match self {
            WaitingItem::CacheFetch(w) => w.writeset_ident(),
            WaitingItem::OrderedIndexedLoad(w) => w.writeset_ident(),
            WaitingItem::ChunkTransfer(w) => w.writeset_ident(),
        }
    }

    fn is_active_write(&self) -> bool {
        match self {
            WaitingItem::CacheFetch(w) => w.is_active_write(),
            WaitingItem::OrderedIndexedLoad(w) => w.is_active_write(),
            WaitingItem::ChunkTransfer(w) => w.is_active_write(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordered_indexed_load_is_a_read_barrier() {
        let w = WaitingItem::OrderedIndexedLoad(WaitingOrderedIndexedLoad::new(7));
        assert!(w.reads_all_memory());
        assert!(!w.ready());
    }

    #[test]
    fn chunk_transfer_ready_when_drained() {
        let w = WaitingChunkTransfer {
            instr_ident: 1,
            writeset_ident: Some(2),
            is_store: true,
            outstanding: 0,
        };
        assert!(WaitingItem::ChunkTransfer(w).ready());
    }
}
