//! Error taxonomy surfaced at the lamlet boundary.
//!
//! Mirrors `vm/src/dram.rs`'s `thiserror`-derived `MemoryError` style: one flat
//! enum per concern, `#[error("...")]` messages, no `anyhow`.

use thiserror::Error;

/// TLB-level fault classification, carried into `VectorOpResult`. Distinct
/// from `MemoryError`: a fault type is a per-element outcome a vector op
/// reports and the caller may legitimately see (e.g. a partially-faulting
/// strided load), not a hard error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlbFaultType {
    #[default]
    None,
    PageFault,
    ReadFault,
    WriteFault,
    NotWaited,
}

impl TlbFaultType {
    pub fn is_fault(self) -> bool {
        !matches!(self, TlbFaultType::None)
    }
}

/// Errors that can occur while servicing a memory request.
#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("address not mapped in TLB: {0:#x}")]
    PageFault(u64),
    #[error("read permission denied at {0:#x}")]
    ReadFault(u64),
    #[error("write permission denied at {0:#x}")]
    WriteFault(u64),
    #[error("vector op completion syncs were not awaited before reuse (ident {0})")]
    NotWaited(u32),
    #[error("TLB exhausted its {0:?} backing pages")]
    OutOfPages(crate::tlb::MemoryType),
    #[error("address out of bounds for this backing store: {0:#x}")]
    OutOfBounds(u64),
    #[error("misaligned access at {0:#x} (required alignment {1})")]
    Misaligned(u64, usize),
}

/// Non-error control-flow signal: the simulated program exited via HTIF.
#[derive(Debug, Clone, Copy)]
pub struct HtifExit {
    pub exit_code: u64,
}

impl std::fmt::Display for HtifExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "program exited via HTIF with code {}", self.exit_code)
    }
}
