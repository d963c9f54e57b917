//! Static configuration for one simulated lamlet/kamlet/jamlet grid.
//!
//! Every bound used by the fixed-arena components (waiting-item table, cache
//! request table, ordered buffers, ident space) lives here so those arenas can
//! be sized once at construction instead of growing dynamically, matching the
//! "fixed arenas + free lists" translation note for the ident/table growth
//! pattern in the original Python.

use serde::{Deserialize, Serialize};

/// Simulation-wide parameters. Cheaply `Copy`-able; shared by reference from
/// every component (lamlet, kamlets, jamlets, memlets, synchronizers).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Params {
    /// Jamlets per kamlet (j_in_k).
    pub j_in_k: usize,
    /// Kamlets per lamlet (k_in_l).
    pub k_in_l: usize,
    /// Kamlet columns in the lamlet's 2-D grid (k_rows = k_in_l / k_cols).
    pub k_cols: usize,
    /// Jamlet columns within one kamlet's 2-D grid (j_rows = j_in_k / j_cols).
    pub j_cols: usize,
    /// Bytes in one machine word (register/cache granularity).
    pub word_bytes: usize,
    /// Bytes in one cache line, per kamlet.
    pub cache_line_bytes: usize,
    /// Bytes in one TLB page.
    pub page_bytes: usize,
    /// Size of the circular instr_ident space.
    pub max_response_tags: usize,
    /// Bytes in the largest vector register group (maxvl).
    pub maxvl_bytes: usize,
    /// Bytes of SRAM per jamlet.
    pub jamlet_sram_bytes: usize,
    /// Bytes of DRAM backing per kamlet's memlet.
    pub kamlet_memory_bytes: usize,
    /// Fixed-size cache request table entries, per kamlet.
    pub n_cache_requests: usize,
    /// Waiting-item slots reserved for message-driven (non-kinstr) witems.
    pub n_items_reserved: usize,
    /// Total waiting-item table slots, per kamlet.
    pub n_witems: usize,
    /// Ordered-buffer slots, per lamlet.
    pub n_ordered_buffers: usize,
    /// Elements each ordered buffer can hold in flight before it must drain.
    pub ordered_buffer_capacity: usize,
    /// Bits used for `sync_ident` on the sync bus.
    pub sync_ident_width: u32,
    /// HTIF tohost/fromhost addresses (global byte addresses).
    pub tohost_addr: u64,
    pub fromhost_addr: u64,
    /// Seed for the deterministic "uninitialized DRAM read" byte stream.
    pub dram_seed: u64,
    /// Total bytes of scalar memory backing (single address space shared by
    /// idempotent and non-idempotent scalar pages).
    pub scalar_memory_bytes: usize,
    /// Number of architectural vector registers.
    pub n_vregs: usize,
    /// Router channels a packet's `MessageType` can be mapped onto, so
    /// request/response traffic classes cannot deadlock each other.
    pub n_channels: usize,
    /// Gathering-slot table size per memlet (concurrent WRITE_LINE_READ_LINE
    /// in flight before a new one is DROPped).
    pub n_gathering_slots: usize,
}

impl Params {
    /// Total jamlets in the lamlet (j_in_l).
    pub fn j_in_l(&self) -> usize {
        self.j_in_k * self.k_in_l
    }

    /// Jamlet rows within one kamlet.
    pub fn j_rows(&self) -> usize {
        self.j_in_k / self.j_cols
    }

    /// Kamlet rows in the lamlet's grid.
    pub fn k_rows(&self) -> usize {
        self.k_in_l / self.k_cols
    }

    /// Total absolute jamlet grid width/height.
    pub fn grid_cols(&self) -> usize {
        self.j_cols * self.k_cols
    }
    pub fn grid_rows(&self) -> usize {
        self.j_rows() * self.k_rows()
    }

    /// Bytes in one physical vector line (one row across all jamlets).
    pub fn vline_bytes(&self) -> usize {
        self.j_in_l() * self.word_bytes
    }

    /// Cache slots per kamlet.
    pub fn n_slots(&self) -> usize {
        (self.jamlet_sram_bytes * self.j_in_k) / self.cache_line_bytes
    }

    /// L-cache-line size: one cache line's worth of bytes replicated across
    /// every kamlet in the lamlet (used by `get_memory_split`'s boundary
    /// computation).
    pub fn l_cache_line_bytes(&self) -> usize {
        self.cache_line_bytes * self.k_in_l
    }

    /// A small, deliberately toy configuration sized for unit tests and the
    /// end-to-end scenarios in spec.md §8 (j_in_l=4, word_bytes=8,
    /// cache_line_bytes=64, 2x1 kamlets, 1x1 jamlets per kamlet).
    pub fn toy() -> Self {
        Params {
            j_in_k: 2,
            k_in_l: 2,
            k_cols: 2,
            j_cols: 2,
            word_bytes: 8,
            cache_line_bytes: 64,
            page_bytes: 4096,
            max_response_tags: 256,
            maxvl_bytes: 256,
            jamlet_sram_bytes: 4096,
            kamlet_memory_bytes: 1 << 20,
            n_cache_requests: 16,
            n_items_reserved: 4,
            n_witems: 32,
            n_ordered_buffers: 4,
            ordered_buffer_capacity: 8,
            sync_ident_width: 9,
            tohost_addr: 0x9000_0000,
            fromhost_addr: 0x9000_0008,
            dram_seed: 0xC0FF_EE00_D15E_A5E5,
            scalar_memory_bytes: 1 << 20,
            n_vregs: 32,
            n_channels: 8,
            n_gathering_slots: 4,
        }
    }
}
