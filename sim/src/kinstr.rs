//! Kamlet instructions (kinstrs): the unit of work the lamlet dispatches down
//! to a kamlet (spec.md §4.5's dispatch table, §2's "kinstr" definition).
//!
//! The original gives every kinstr its own class with an `update_kamlet`
//! method (dynamic dispatch); per spec.md §9's translation note this becomes
//! one sum type consumed by `Kamlet::execute` with a `match`. Vector ALU
//! kinstrs (`VArithVvOp` and friends) are out of scope — only the
//! vector-*memory* subsystem's kinstrs are represented here.

use crate::address::{KMAddr, RegAddr};

/// Shared fields every kinstr carries for ident allocation and cache-arbiter
/// bookkeeping.
#[derive(Debug, Clone, Copy)]
pub struct KinstrMeta {
    pub instr_ident: u32,
    pub writeset_ident: Option<u32>,
}

/// One element's register slot and kamlet-memory address, used by the
/// whole-run `Load`/`Store` kinstrs below. Elements are not generally
/// byte-contiguous in kamlet memory even when they are contiguous in the
/// logical vline (spec.md §4.1's interleave), so a run of elements is
/// addressed as an explicit list rather than a single base address + stride.
#[derive(Debug, Clone, Copy)]
pub struct ElementAddr {
    pub element_index: u64,
    pub k_maddr: KMAddr,
}

#[derive(Debug, Clone)]
pub enum Kinstr {
    /// A cache-line-aligned run of whole elements, dispatched as one kinstr
    /// rather than one `LoadByte`/`LoadWord` per element (spec.md §4.5's
    /// "VPU, cache-line aligned, whole elements" dispatch row). `dst`/`src`
    /// pairs each element with its register slot so elements that land in
    /// different kamlet-memory regions of the same line still resolve
    /// correctly.
    Load {
        meta: KinstrMeta,
        dsts: Vec<(RegAddr, ElementAddr)>,
        eb: u64,
    },
    Store {
        meta: KinstrMeta,
        srcs: Vec<(RegAddr, ElementAddr)>,
        data: Vec<Vec<u8>>,
        eb: u64,
    },
    /// Single-bit-masked byte load from a kamlet address into a register.
    LoadByte {
        meta: KinstrMeta,
        dst: RegAddr,
        src: KMAddr,
        bit_mask: u8,
    },
    StoreByte {
        meta: KinstrMeta,
        src: RegAddr,
        dst: KMAddr,
        data: u8,
        bit_mask: u8,
    },
    /// Byte-masked word load/store (size > 1 byte, cache-line aligned).
    LoadWord {
        meta: KinstrMeta,
        dst: RegAddr,
        src: KMAddr,
        byte_mask: u8,
    },
    StoreWord {
        meta: KinstrMeta,
        src: RegAddr,
        dst: KMAddr,
        data: Vec<u8>,
        byte_mask: u8,
    },
    /// Scalar-memory immediate write, one byte/word per dispatched kinstr
    /// (immediate bytes are read from the lamlet's scalar memory at dispatch
    /// time, so no kamlet round-trip is needed — spec.md §4.5's scalar row).
    LoadImmByte {
        meta: KinstrMeta,
        dst: RegAddr,
        imm: u8,
        bit_mask: u8,
    },
    LoadImmWord {
        meta: KinstrMeta,
        dst: RegAddr,
        imm: [u8; 8],
        byte_mask: u8,
    },
    /// Barrier kinstr for ordered indexed ops: `reads_all_memory = true`,
    /// every kamlet must observe it before any `*IndexedElement` response for
    /// the same `instr_ident` is trustworthy (spec.md §4.5 "Indexed ordered
    /// ops").
    OrderedIndexedBarrier { meta: KinstrMeta },
    /// One element of an ordered indexed load/store, dispatched strictly in
    /// logical order by the lamlet's `OrderedBuffer`.
    LoadIndexedElement {
        meta: KinstrMeta,
        dst: RegAddr,
        src: KMAddr,
        element_index: u64,
        mask: bool,
    },
    StoreIndexedElement {
        meta: KinstrMeta,
        src: RegAddr,
        dst: KMAddr,
        data: Vec<u8>,
        element_index: u64,
        mask: bool,
    },
}

impl Kinstr {
    pub fn meta(&self) -> KinstrMeta {
        match self {
            Kinstr::Load { meta, .. }
            | Kinstr::Store { meta, .. }
            | Kinstr::LoadByte { meta, .. }
            | Kinstr::StoreByte { meta, .. }
            | Kinstr::LoadWord { meta, .. }
            | Kinstr::StoreWord { meta, .. }
            | Kinstr::LoadImmByte { meta, .. }
            | Kinstr::LoadImmWord { meta, .. }
            | Kinstr::OrderedIndexedBarrier { meta }
            | Kinstr::LoadIndexedElement { meta, .. }
            | Kinstr::StoreIndexedElement { meta, .. } => *meta,
        }
    }

    pub fn instr_ident(&self) -> u32 {
        self.meta().instr_ident
    }

    pub fn is_store(&self) -> bool {
        matches!(
            self,
            Kinstr::Store { .. }
                | Kinstr::StoreByte { .. }
                | Kinstr::StoreWord { .. }
                | Kinstr::StoreIndexedElement { .. }
        )
    }
}
