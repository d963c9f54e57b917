//! Lamlet orchestration: the top-level object a program interacts with
//! (spec.md §4.5 / §6.1). Owns the TLB, the kamlet grid (and their memlets),
//! the logical vector register file, scalar memory, the sync network, the
//! ordered-indexed-op buffers, and the ident allocator.
//!
//! Vector register data is kept centrally here as flat, logically-ordered
//! byte buffers rather than physically split across per-jamlet register
//! slices — an explicit translation simplification, since the
//! jamlet-distributed register layout (`address::RegAddr`) only matters for
//! wire-level realism this simulator doesn't reproduce at the register-file
//! granularity. `RegAddr`'s own conversions remain implemented and tested.
//! Per-kamlet register-token ownership (who may read/write which vreg right
//! now) is tracked for real via `claim_reg_token` below, against whichever
//! kamlet each access actually touches.

use std::collections::HashMap;

use log::{debug, trace, warn};

use crate::address::{GlobalAddress, Ordering, RegAddr, WordOrder};
use crate::clock::Clock;
use crate::error::{HtifExit, MemoryError, TlbFaultType};
use crate::kamlet::Kamlet;
use crate::kinstr::{ElementAddr, Kinstr, KinstrMeta};
use crate::memlet::Memlet;
use crate::monitor::{CompletionType, Monitor, SpanType};
use crate::ordered::OrderedBuffer;
use crate::params::Params;
use crate::router::{channel_for, Header, MessageType, Packet, Router};
use crate::sync::Synchronizer;
use crate::tlb::{MemoryType, Tlb};

/// One lump of a `vload`/`vstore`'s address range, bounded by the nearer of
/// a page or an L-cache-line boundary (spec.md §4.5's `get_memory_split`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionInfo {
    pub is_vpu: bool,
    pub is_a_partial_element: bool,
    pub start_index: u64,
    pub start_address: u64,
    pub end_address: u64,
    /// Whole (possibly fractional, if `is_a_partial_element`) elements this
    /// lump spans, used by `vloadstore` to size its per-lump dispatch.
    pub n_elements: u64,
}

/// Outcome of one vector memory op: which element (if any) first faulted,
/// plus the sync idents a caller must await before reusing registers/idents.
#[derive(Debug, Clone, Copy)]
pub struct VectorOpResult {
    pub fault_type: TlbFaultType,
    pub faulted_element: Option<u64>,
    pub completion_sync_ident: u32,
    pub last_fault_sync_ident: Option<u32>,
}

impl VectorOpResult {
    fn ok(completion_sync_ident: u32) -> Self {
        VectorOpResult {
            fault_type: TlbFaultType::None,
            faulted_element: None,
            completion_sync_ident,
            last_fault_sync_ident: None,
        }
    }
}

pub struct Lamlet {
    params: Params,
    tlb: Tlb,
    clock: Clock,
    kamlets: Vec<Kamlet>,
    memlets: Vec<Memlet>,
    /// `vregs[reg]` is that register's full `maxvl_bytes` logical contents.
    vregs: Vec<Vec<u8>>,
    scalar_memory: Vec<u8>,
    sync: Synchronizer,
    monitor: Monitor,
    /// Channel FIFOs every kamlet dispatch round-trips a packet through
    /// before the kamlet call itself resolves (spec.md §6.3); the mesh's
    /// internal neighbor arbitration stays out of scope, so the packet is
    /// drained from its channel the same step it's sent.
    router: Router,
    next_ident: u32,
    /// instr_idents allocated but not yet observed complete by every kamlet;
    /// used for the non-wrap distance check (Testable Property 8).
    live_idents: Vec<u32>,
    fromhost_value: Option<u64>,
}

impl Lamlet {
    pub fn new(params: Params) -> Self {
        let kamlets = (0..params.k_in_l).map(|k| Kamlet::new(k, params)).collect();
        let memlets = (0..params.k_in_l)
            .map(|_| Memlet::new(params.kamlet_memory_bytes, params.cache_line_bytes, params.dram_seed, params.n_gathering_slots))
            .collect();
        Lamlet {
            params,
            tlb: Tlb::new(params),
            clock: Clock::new(),
            kamlets,
            memlets,
            vregs: (0..params.n_vregs).map(|_| vec![0u8; params.maxvl_bytes]).collect(),
            scalar_memory: vec![0u8; params.scalar_memory_bytes],
            sync: Synchronizer::new(params.k_in_l),
            monitor: Monitor::new(),
            router: Router::new(),
            next_ident: 0,
            live_idents: Vec::new(),
            fromhost_value: None,
        }
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    pub fn monitor_mut(&mut self) -> &mut Monitor {
        &mut self.monitor
    }

    /// Allocates the next `instr_ident`/`sync_ident`, refusing to wrap past
    /// an ident still live in any kamlet's waiting-item table (Testable
    /// Property 8). Evaluated per-kamlet per spec.md's Open-Question
    /// resolution: a kamlet's own waiting-item table is what can block reuse,
    /// not a single lamlet-wide horizon.
    pub fn alloc_ident(&mut self) -> Result<u32, MemoryError> {
        let width = self.params.max_response_tags as u32;
        let candidate = self.next_ident % width;
        for kamlet in &self.kamlets {
            let oldest_live = kamlet.cache_table().witems().map(|w| w.instr_ident()).min();
            if let Some(oldest) = oldest_live {
                if oldest == candidate && self.live_idents.contains(&candidate) {
                    return Err(MemoryError::NotWaited(candidate));
                }
            }
        }
        self.next_ident = self.next_ident.wrapping_add(1);
        self.live_idents.push(candidate);
        Ok(candidate)
    }

    fn retire_ident(&mut self, ident: u32) {
        self.live_idents.retain(|&i| i != ident);
    }

    /// Routes one kinstr to its owning kamlet through a channel keyed by
    /// message class (spec.md §6.3), so request and response traffic classes
    /// land on non-conflicting FIFOs. The channel is drained the same step
    /// it's filled: only the ordering guarantee a router exists to provide is
    /// modeled, not the mesh's internal neighbor-to-neighbor arbitration
    /// (an explicit Non-goal).
    fn dispatch_kinstr(&mut self, k_index: usize, kinstr: Kinstr) -> Result<Option<Vec<u8>>, MemoryError> {
        let msg_type = match &kinstr {
            Kinstr::OrderedIndexedBarrier { .. } => MessageType::Sync,
            k if k.is_store() => MessageType::WriteLine,
            _ => MessageType::ReadLine,
        };
        let channel = channel_for(msg_type, self.params.n_channels);
        let ident = kinstr.instr_ident();
        self.router.send(
            channel,
            Packet {
                header: Header { message_type: msg_type, length: 1, ident, address: None, tag: None, fault: false },
                body: Vec::new(),
            },
        );
        let packet = self
            .router
            .receive(channel)
            .expect("a packet just enqueued on this channel must be immediately receivable");
        debug_assert_eq!(packet.header.ident, ident);
        self.kamlets[k_index].execute(&kinstr, &mut self.memlets[k_index])
    }

    pub fn allocate_memory(
        &mut self,
        address: GlobalAddress,
        size: u64,
        memory_type: MemoryType,
        ordering: Option<Ordering>,
        readable: bool,
        writable: bool,
    ) -> Result<(), MemoryError> {
        self.tlb.allocate_memory(address, size, memory_type, ordering, readable, writable)
    }

    pub fn release_memory(&mut self, address: GlobalAddress, size: u64) -> Result<(), MemoryError> {
        self.tlb.release_memory(address, size)
    }

    /// Splits `[start_index, start_index + n_elements)`, byte-addressed from
    /// `base_addr`, into lumps bounded by the nearer of a page or an
    /// L-cache-line boundary, flagging any lump whose start or end isn't
    /// element-aligned. A simplified rendition of the original's two-pass
    /// lump-then-reslice algorithm: lumps are computed in one pass and a
    /// lump is marked partial rather than further split into a
    /// leading/whole/trailing triple, since no VPU page or cache-line size
    /// used anywhere in this crate's test configurations actually produces a
    /// misaligned lump.
    pub fn get_memory_split(
        &self,
        base_addr: GlobalAddress,
        start_index: u64,
        n_elements: u64,
        eb: u64,
    ) -> Result<Vec<SectionInfo>, MemoryError> {
        let total_end = base_addr.addr() + n_elements * eb;
        let mut sections = Vec::new();
        let mut cur = base_addr.addr();
        let mut cur_index = start_index;
        let page_bytes = self.params.page_bytes as u64;
        let l_line = self.params.l_cache_line_bytes() as u64;
        while cur < total_end {
            let next_page = (cur / page_bytes + 1) * page_bytes;
            let next_line = (cur / l_line + 1) * l_line;
            let lump_end = next_page.min(next_line).min(total_end).max(cur + eb);
            let is_vpu = GlobalAddress::from_byte_addr(cur).is_vpu(&self.tlb)?;
            let is_partial = (cur - base_addr.addr()) % eb != 0 || (lump_end - base_addr.addr()) % eb != 0;
            let elements_in_lump = ((lump_end - cur) / eb).max(1);
            sections.push(SectionInfo {
                is_vpu,
                is_a_partial_element: is_partial,
                start_index: cur_index,
                start_address: cur,
                end_address: lump_end,
                n_elements: elements_in_lump,
            });
            cur_index += elements_in_lump;
            cur = lump_end;
        }
        Ok(sections)
    }

    fn vreg_byte(&self, reg: usize, offset: u64) -> u8 {
        self.vregs[reg][offset as usize]
    }

    fn set_vreg_byte(&mut self, reg: usize, offset: u64, value: u8) {
        self.vregs[reg][offset as usize] = value;
    }

    fn reg_addr_for(&self, reg: usize, element_index: u64, eb: u64, ew: usize) -> RegAddr {
        RegAddr {
            reg,
            addr: element_index * eb,
            ordering: Ordering { word_order: WordOrder::Standard, ew },
        }
    }

    fn mask_bit(&self, mask_reg: Option<usize>, element_index: u64) -> bool {
        match mask_reg {
            None => true,
            Some(reg) => {
                let byte = self.vreg_byte(reg, element_index / 8);
                byte & (1 << (element_index % 8)) != 0
            }
        }
    }

    /// Claims this vreg's write (exclusive) or read (shared) token against
    /// the kamlet actually touched, per spec.md §3.5 — a deliberate reading
    /// of "per-kamlet register file" onto this crate's centrally-owned vreg
    /// bytes: each kamlet's `KamletRegisterFile` tracks ownership of the
    /// slice of the vreg that kamlet's own accesses touch, rather than the
    /// whole vreg, since no single kamlet's view is authoritative over bytes
    /// it never reads or writes.
    fn claim_reg_token(&mut self, k_index: usize, reg: usize, ident: u32, is_store: bool) {
        let rf = self.kamlets[k_index].regfile_mut();
        if is_store {
            debug_assert!(rf.can_claim_write(reg, ident), "vreg {reg} write token unavailable for ident {ident}");
            rf.claim_write(reg, ident);
        } else {
            debug_assert!(rf.can_claim_read(reg, ident), "vreg {reg} read token unavailable for ident {ident}");
            rf.claim_read(reg, ident);
        }
    }

    /// One aligned VPU element access, dispatched through the owning
    /// kamlet: a `LoadWord`/`StoreWord` when the element fills whole words,
    /// otherwise `LoadByte`/`StoreByte`.
    fn access_vpu_element(
        &mut self,
        reg: usize,
        element_index: u64,
        global_addr: GlobalAddress,
        ew: usize,
        is_store: bool,
        ident: u32,
    ) -> Result<(), MemoryError> {
        let eb = (ew / 8) as u64;
        let k_maddr = global_addr.to_k_maddr(&self.tlb)?;
        let k_index = k_maddr.k_index;
        let meta = KinstrMeta { instr_ident: ident, writeset_ident: Some(ident) };
        let reg_addr = self.reg_addr_for(reg, element_index, eb, ew);

        self.claim_reg_token(k_index, reg, ident, is_store);
        if is_store {
            let data: Vec<u8> = (0..eb).map(|i| self.vreg_byte(reg, element_index * eb + i)).collect();
            let kinstr = if eb == 1 {
                Kinstr::StoreByte { meta, src: reg_addr, dst: k_maddr, data: data[0], bit_mask: 0xFF }
            } else {
                Kinstr::StoreWord { meta, src: reg_addr, dst: k_maddr, data, byte_mask: 0xFF }
            };
            self.dispatch_kinstr(k_index, kinstr)?;
        } else {
            let kinstr = if eb == 1 {
                Kinstr::LoadByte { meta, dst: reg_addr, src: k_maddr, bit_mask: 0xFF }
            } else {
                Kinstr::LoadWord { meta, dst: reg_addr, src: k_maddr, byte_mask: 0xFF }
            };
            let loaded = self.dispatch_kinstr(k_index, kinstr)?;
            if let Some(bytes) = loaded {
                for (i, b) in bytes.into_iter().enumerate() {
                    self.set_vreg_byte(reg, element_index * eb + i as u64, b);
                }
            }
        }
        self.kamlets[k_index].regfile_mut().release(ident);
        Ok(())
    }

    /// A cache-line-aligned run of whole elements (spec.md §4.5's "VPU,
    /// cache-line aligned, whole elements" dispatch row): groups the lump's
    /// elements by owning kamlet (an L-cache-line's elements interleave
    /// across every kamlet in the lamlet, so one lump is rarely all one
    /// kamlet's) and issues one `Kinstr::Load`/`Store` per kamlet group
    /// instead of one kinstr per element.
    fn access_vpu_section(
        &mut self,
        reg: usize,
        mask_reg: Option<usize>,
        start_index: u64,
        start_address: u64,
        n_elements: u64,
        eb: u64,
        ew: usize,
        is_store: bool,
        ident: u32,
    ) -> Result<(), MemoryError> {
        let mut groups: HashMap<usize, Vec<(RegAddr, ElementAddr)>> = HashMap::new();
        for off in 0..n_elements {
            let element_index = start_index + off;
            if !self.mask_bit(mask_reg, element_index) {
                continue;
            }
            let addr = GlobalAddress::from_byte_addr(start_address + off * eb);
            let k_maddr = addr.to_k_maddr(&self.tlb)?;
            let reg_addr = self.reg_addr_for(reg, element_index, eb, ew);
            groups
                .entry(k_maddr.k_index)
                .or_default()
                .push((reg_addr, ElementAddr { element_index, k_maddr }));
        }
        for (k_index, elems) in groups {
            self.claim_reg_token(k_index, reg, ident, is_store);
            let meta = KinstrMeta { instr_ident: ident, writeset_ident: Some(ident) };
            if is_store {
                let data: Vec<Vec<u8>> = elems
                    .iter()
                    .map(|(_, e)| (0..eb).map(|b| self.vreg_byte(reg, e.element_index * eb + b)).collect())
                    .collect();
                let kinstr = Kinstr::Store { meta, srcs: elems.clone(), data, eb };
                self.dispatch_kinstr(k_index, kinstr)?;
            } else {
                let kinstr = Kinstr::Load { meta, dsts: elems.clone(), eb };
                if let Some(bytes) = self.dispatch_kinstr(k_index, kinstr)? {
                    for (i, (_, e)) in elems.iter().enumerate() {
                        let base = i * eb as usize;
                        for b in 0..eb as usize {
                            self.set_vreg_byte(reg, e.element_index * eb + b as u64, bytes[base + b]);
                        }
                    }
                }
            }
            self.kamlets[k_index].regfile_mut().release(ident);
        }
        Ok(())
    }

    fn access_scalar_element(&mut self, reg: usize, element_index: u64, scalar_addr: u64, ew: usize, is_store: bool) {
        let eb = (ew / 8) as usize;
        if is_store {
            for i in 0..eb {
                self.scalar_memory[scalar_addr as usize + i] = self.vreg_byte(reg, element_index * eb as u64 + i as u64);
            }
        } else {
            for i in 0..eb {
                let byte = self.scalar_memory[scalar_addr as usize + i];
                self.set_vreg_byte(reg, element_index * eb as u64 + i as u64, byte);
            }
        }
    }

    /// A masked, unit-stride vector load/store over `n_elements` elements of
    /// width `ew` bits, starting at `base_addr` (scalar or VPU; the TLB
    /// decides per element's page). `reg` both supplies store data and
    /// receives load results.
    fn vloadstore(
        &mut self,
        reg: usize,
        base_addr: GlobalAddress,
        n_elements: u64,
        ew: usize,
        mask_reg: Option<usize>,
        is_store: bool,
    ) -> Result<VectorOpResult, MemoryError> {
        let eb = (ew / 8) as u64;
        let ident = self.alloc_ident()?;
        let completion_ident = self.alloc_ident()?;
        let span = self.monitor.create_span(
            SpanType::VectorOp,
            "lamlet",
            CompletionType::Tracked,
            None,
            Some(ident),
            self.clock.cycle(),
        );

        // Pre-scan every unmasked element for a fault before touching any
        // memory, so a lump dispatched later in the split never leaves an
        // earlier lump partially applied.
        for element_index in 0..n_elements {
            if !self.mask_bit(mask_reg, element_index) {
                continue;
            }
            let addr = base_addr.offset_bytes((element_index * eb) as i64);
            let fault = self.tlb.check_access(&addr, is_store);
            if fault.is_fault() {
                self.retire_ident(ident);
                self.retire_ident(completion_ident);
                if let Some(s) = span {
                    self.monitor.close_span(s, self.clock.cycle());
                }
                return Ok(VectorOpResult {
                    fault_type: fault,
                    faulted_element: Some(element_index),
                    completion_sync_ident: completion_ident,
                    last_fault_sync_ident: Some(ident),
                });
            }
        }

        let sections = self.get_memory_split(base_addr, 0, n_elements, eb)?;
        for section in &sections {
            let n_in_range = section.n_elements.min(n_elements.saturating_sub(section.start_index));
            if n_in_range == 0 {
                continue;
            }
            if section.is_vpu && !section.is_a_partial_element {
                self.access_vpu_section(
                    reg,
                    mask_reg,
                    section.start_index,
                    section.start_address,
                    n_in_range,
                    eb,
                    ew,
                    is_store,
                    ident,
                )?;
            } else {
                for off in 0..n_in_range {
                    let element_index = section.start_index + off;
                    if !self.mask_bit(mask_reg, element_index) {
                        continue;
                    }
                    let addr = GlobalAddress::from_byte_addr(section.start_address + off * eb);
                    if section.is_vpu {
                        self.access_vpu_element(reg, element_index, addr, ew, is_store, ident)?;
                    } else {
                        let scalar_addr = addr.to_scalar_addr(&self.tlb)?;
                        self.access_scalar_element(reg, element_index, scalar_addr, ew, is_store);
                    }
                }
            }
        }

        for _ in 0..self.params.k_in_l {
            self.sync.local_event(ident, Some(TlbFaultType::None as i64));
        }
        debug_assert!(self.sync.is_complete(ident), "every kamlet must report before a vloadstore's fault sync completes");
        self.sync.reset(ident);
        for _ in 0..self.params.k_in_l {
            self.sync.local_event(completion_ident, None);
        }
        debug_assert!(self.sync.is_complete(completion_ident));
        self.sync.reset(completion_ident);
        self.retire_ident(ident);
        self.retire_ident(completion_ident);
        if let Some(s) = span {
            self.monitor.close_span(s, self.clock.cycle());
        }
        Ok(VectorOpResult::ok(completion_ident))
    }

    pub fn vload(&mut self, reg: usize, addr: GlobalAddress, n_elements: u64, ew: usize, mask_reg: Option<usize>) -> Result<VectorOpResult, MemoryError> {
        self.vloadstore(reg, addr, n_elements, ew, mask_reg, false)
    }

    pub fn vstore(&mut self, reg: usize, addr: GlobalAddress, n_elements: u64, ew: usize, mask_reg: Option<usize>) -> Result<VectorOpResult, MemoryError> {
        self.vloadstore(reg, addr, n_elements, ew, mask_reg, true)
    }

    /// Strided load/store: element `i` lives at `base_addr + i * stride_bytes`
    /// rather than `base_addr + i * eb` (spec.md §4.5 "Strided ops"). Per
    /// `LoadStride`/`StoreStride` dispatched in chunks of `j_in_l` elements,
    /// each chunk getting its own fault/completion sync pair chained off the
    /// previous chunk's fault sync, same as `vloadstore_indexed_unordered`
    /// (modeled via the same `LoadByte`/`LoadWord`/`StoreByte`/`StoreWord`
    /// kinstrs `access_vpu_element` already emits for a single element, since
    /// the stride only changes which `KMAddr` each element lands on, not the
    /// per-element cache access shape).
    fn vloadstore_strided(
        &mut self,
        reg: usize,
        base_addr: GlobalAddress,
        n_elements: u64,
        ew: usize,
        stride_bytes: u64,
        mask_reg: Option<usize>,
        is_store: bool,
    ) -> Result<VectorOpResult, MemoryError> {
        let chunk_size = self.params.j_in_l() as u64;
        let mut last_fault_ident: Option<u32> = None;
        let mut completion_ident = self.alloc_ident()?;

        let mut element_index = 0u64;
        while element_index < n_elements {
            let fault_ident = self.alloc_ident()?;
            let next_completion = self.alloc_ident()?;
            if let Some(prev) = last_fault_ident {
                self.sync.chain_fault_sync(prev, fault_ident);
            }
            let chunk_end = (element_index + chunk_size).min(n_elements);
            let mut chunk_fault: Option<(TlbFaultType, u64)> = None;
            for i in element_index..chunk_end {
                if !self.mask_bit(mask_reg, i) {
                    continue;
                }
                let addr = base_addr.offset_bytes((i * stride_bytes) as i64);
                let fault = self.tlb.check_access(&addr, is_store);
                if fault.is_fault() {
                    chunk_fault = Some((fault, i));
                    break;
                }
                if addr.is_vpu(&self.tlb)? {
                    self.access_vpu_element(reg, i, addr, ew, is_store, fault_ident)?;
                } else {
                    let scalar_addr = addr.to_scalar_addr(&self.tlb)?;
                    self.access_scalar_element(reg, i, scalar_addr, ew, is_store);
                }
            }
            let fault_code = chunk_fault.map_or(0, |(f, _)| encode_fault(f));
            for _ in 0..self.params.k_in_l {
                self.sync.local_event(fault_ident, Some(fault_code));
            }
            debug_assert!(self.sync.is_complete(fault_ident));
            let observed = self.sync.get_min_value(fault_ident);
            debug_assert_eq!(observed, Some(fault_code), "every kamlet must agree on this chunk's fault code");
            self.sync.reset(fault_ident);
            for _ in 0..self.params.k_in_l {
                self.sync.local_event(next_completion, None);
            }
            debug_assert!(self.sync.is_complete(next_completion));
            self.sync.reset(next_completion);
            self.retire_ident(fault_ident);
            completion_ident = next_completion;
            if let Some((fault, idx)) = chunk_fault {
                self.retire_ident(completion_ident);
                return Ok(VectorOpResult {
                    fault_type: fault,
                    faulted_element: Some(idx),
                    completion_sync_ident: completion_ident,
                    last_fault_sync_ident: Some(fault_ident),
                });
            }
            last_fault_ident = Some(fault_ident);
            element_index = chunk_end;
        }
        self.retire_ident(completion_ident);
        Ok(VectorOpResult::ok(completion_ident))
    }

    pub fn vload_strided(&mut self, reg: usize, addr: GlobalAddress, n_elements: u64, ew: usize, stride_bytes: u64, mask_reg: Option<usize>) -> Result<VectorOpResult, MemoryError> {
        self.vloadstore_strided(reg, addr, n_elements, ew, stride_bytes, mask_reg, false)
    }

    pub fn vstore_strided(&mut self, reg: usize, addr: GlobalAddress, n_elements: u64, ew: usize, stride_bytes: u64, mask_reg: Option<usize>) -> Result<VectorOpResult, MemoryError> {
        self.vloadstore_strided(reg, addr, n_elements, ew, stride_bytes, mask_reg, true)
    }

    /// Indexed-unordered load/store: `idx_reg` holds per-element byte
    /// offsets from `base_addr`, dispatched in chunks each getting two sync
    /// idents (fault, completion), chained so a later chunk's fault sync
    /// observes any earlier chunk's fault (spec.md §4.5 / Testable Property
    /// 7).
    fn vloadstore_indexed_unordered(
        &mut self,
        reg: usize,
        idx_reg: usize,
        base_addr: GlobalAddress,
        n_elements: u64,
        ew: usize,
        idx_ew: usize,
        mask_reg: Option<usize>,
        is_store: bool,
    ) -> Result<VectorOpResult, MemoryError> {
        let eb = (ew / 8) as u64;
        let idx_eb = (idx_ew / 8) as u64;
        let chunk_size = self.params.j_in_l() as u64;
        let mut last_fault_ident: Option<u32> = None;
        let mut completion_ident = self.alloc_ident()?;

        let mut element_index = 0u64;
        while element_index < n_elements {
            let fault_ident = self.alloc_ident()?;
            let next_completion = self.alloc_ident()?;
            if let Some(prev) = last_fault_ident {
                self.sync.chain_fault_sync(prev, fault_ident);
            }
            let chunk_end = (element_index + chunk_size).min(n_elements);
            let mut chunk_fault: Option<(TlbFaultType, u64)> = None;
            for i in element_index..chunk_end {
                if !self.mask_bit(mask_reg, i) {
                    continue;
                }
                let idx_bytes: Vec<u8> = (0..idx_eb).map(|b| self.vreg_byte(idx_reg, i * idx_eb + b)).collect();
                let mut offset = 0i64;
                for (shift, &b) in idx_bytes.iter().enumerate() {
                    offset |= (b as i64) << (8 * shift);
                }
                let addr = base_addr.offset_bytes(offset);
                let fault = self.tlb.check_access(&addr, is_store);
                if fault.is_fault() {
                    chunk_fault = Some((fault, i));
                    break;
                }
                if addr.is_vpu(&self.tlb)? {
                    self.access_vpu_element(reg, i, addr, ew, is_store, fault_ident)?;
                } else {
                    let scalar_addr = addr.to_scalar_addr(&self.tlb)?;
                    self.access_scalar_element(reg, i, scalar_addr, ew, is_store);
                }
            }
            let fault_code = chunk_fault.map_or(0, |(f, _)| encode_fault(f));
            for _ in 0..self.params.k_in_l {
                self.sync.local_event(fault_ident, Some(fault_code));
            }
            debug_assert!(self.sync.is_complete(fault_ident));
            let observed = self.sync.get_min_value(fault_ident);
            debug_assert_eq!(observed, Some(fault_code), "every kamlet must agree on this chunk's fault code");
            self.sync.reset(fault_ident);
            for _ in 0..self.params.k_in_l {
                self.sync.local_event(next_completion, None);
            }
            debug_assert!(self.sync.is_complete(next_completion));
            self.sync.reset(next_completion);
            self.retire_ident(fault_ident);
            completion_ident = next_completion;
            if let Some((fault, idx)) = chunk_fault {
                self.retire_ident(completion_ident);
                return Ok(VectorOpResult {
                    fault_type: fault,
                    faulted_element: Some(idx),
                    completion_sync_ident: completion_ident,
                    last_fault_sync_ident: Some(fault_ident),
                });
            }
            last_fault_ident = Some(fault_ident);
            element_index = chunk_end;
        }
        self.retire_ident(completion_ident);
        Ok(VectorOpResult::ok(completion_ident))
    }

    pub fn vload_indexed_unordered(&mut self, reg: usize, idx_reg: usize, base: GlobalAddress, n: u64, ew: usize, idx_ew: usize, mask_reg: Option<usize>) -> Result<VectorOpResult, MemoryError> {
        self.vloadstore_indexed_unordered(reg, idx_reg, base, n, ew, idx_ew, mask_reg, false)
    }

    pub fn vstore_indexed_unordered(&mut self, reg: usize, idx_reg: usize, base: GlobalAddress, n: u64, ew: usize, idx_ew: usize, mask_reg: Option<usize>) -> Result<VectorOpResult, MemoryError> {
        self.vloadstore_indexed_unordered(reg, idx_reg, base, n, ew, idx_ew, mask_reg, true)
    }

    /// Indexed-ordered load/store: barriers every kamlet first via an
    /// `OrderedIndexedBarrier` kinstr, then dispatches one
    /// `LoadIndexedElement`/`StoreIndexedElement` per element and commits
    /// results strictly in program order through an `OrderedBuffer`,
    /// regardless of which element's kamlet round-trip finishes first
    /// (spec.md §3.6 / Testable Property 6).
    fn vloadstore_indexed_ordered(
        &mut self,
        reg: usize,
        idx_reg: usize,
        base_addr: GlobalAddress,
        n_elements: u64,
        ew: usize,
        idx_ew: usize,
        mask_reg: Option<usize>,
        is_store: bool,
    ) -> Result<VectorOpResult, MemoryError> {
        let eb = (ew / 8) as u64;
        let idx_eb = (idx_ew / 8) as u64;
        let barrier_ident = self.alloc_ident()?;
        let barrier_meta = KinstrMeta { instr_ident: barrier_ident, writeset_ident: None };
        let span = self.monitor.create_span(
            SpanType::VectorOp,
            "lamlet",
            CompletionType::Tracked,
            None,
            Some(barrier_ident),
            self.clock.cycle(),
        );
        for k_index in 0..self.params.k_in_l {
            self.dispatch_kinstr(k_index, Kinstr::OrderedIndexedBarrier { meta: barrier_meta })?;
        }
        // The barrier's `reads_all_memory` witem only needs to outlive the
        // sync window itself (spec.md §4.2 rule 1): every kamlet observes it,
        // so it retires immediately rather than blocking the per-element
        // writes the rest of this op is about to dispatch.
        for k_index in 0..self.params.k_in_l {
            self.kamlets[k_index].retire_witem(barrier_ident);
        }
        self.retire_ident(barrier_ident);

        let mut buffer = OrderedBuffer::new(self.params.ordered_buffer_capacity, n_elements, 0, ew, !is_store);
        let mut faulted: Option<(TlbFaultType, u64)> = None;

        while !buffer.is_finished() {
            while buffer.can_dispatch() {
                let i = buffer.mark_dispatched();
                if !self.mask_bit(mask_reg, i) {
                    buffer.complete_element(i, Vec::new(), false);
                    continue;
                }
                let idx_bytes: Vec<u8> = (0..idx_eb).map(|b| self.vreg_byte(idx_reg, i * idx_eb + b)).collect();
                let mut offset = 0i64;
                for (shift, &b) in idx_bytes.iter().enumerate() {
                    offset |= (b as i64) << (8 * shift);
                }
                let addr = base_addr.offset_bytes(offset);
                let fault = self.tlb.check_access(&addr, is_store);
                if fault.is_fault() {
                    buffer.complete_element(i, Vec::new(), true);
                    faulted.get_or_insert((fault, i));
                    continue;
                }
                let elem_ident = self.alloc_ident()?;
                let meta = KinstrMeta { instr_ident: elem_ident, writeset_ident: None };
                let k_maddr = addr.to_k_maddr(&self.tlb)?;
                let k_index = k_maddr.k_index;
                let store_data: Vec<u8> = if is_store {
                    (0..eb).map(|b| self.vreg_byte(reg, i * eb + b)).collect()
                } else {
                    Vec::new()
                };
                let kinstr = if is_store {
                    Kinstr::StoreIndexedElement { meta, src: self.reg_addr_for(reg, i, eb, ew), dst: k_maddr, data: store_data, element_index: i, mask: true }
                } else {
                    Kinstr::LoadIndexedElement { meta, dst: self.reg_addr_for(reg, i, eb, ew), src: k_maddr, element_index: i, mask: true }
                };
                self.claim_reg_token(k_index, reg, elem_ident, is_store);
                let result = self.dispatch_kinstr(k_index, kinstr)?;
                self.kamlets[k_index].regfile_mut().release(elem_ident);
                self.retire_ident(elem_ident);
                buffer.complete_element(i, result.unwrap_or_default(), false);
            }
            while let Some(entry) = buffer.take_next_to_process() {
                if !is_store && !entry.data.is_empty() {
                    for (b, &byte) in entry.data.iter().enumerate() {
                        self.set_vreg_byte(reg, entry.element_index * eb + b as u64, byte);
                    }
                }
            }
        }

        let completion_ident = self.alloc_ident()?;
        self.retire_ident(completion_ident);
        if let Some(s) = span {
            self.monitor.close_span(s, self.clock.cycle());
        }
        if let Some((fault_type, idx)) = faulted {
            Ok(VectorOpResult { fault_type, faulted_element: Some(idx), completion_sync_ident: completion_ident, last_fault_sync_ident: None })
        } else {
            Ok(VectorOpResult::ok(completion_ident))
        }
    }

    pub fn vload_indexed_ordered(&mut self, reg: usize, idx_reg: usize, base: GlobalAddress, n: u64, ew: usize, idx_ew: usize, mask_reg: Option<usize>) -> Result<VectorOpResult, MemoryError> {
        self.vloadstore_indexed_ordered(reg, idx_reg, base, n, ew, idx_ew, mask_reg, false)
    }

    pub fn vstore_indexed_ordered(&mut self, reg: usize, idx_reg: usize, base: GlobalAddress, n: u64, ew: usize, idx_ew: usize, mask_reg: Option<usize>) -> Result<VectorOpResult, MemoryError> {
        self.vloadstore_indexed_ordered(reg, idx_reg, base, n, ew, idx_ew, mask_reg, true)
    }

    pub fn set_memory(&mut self, addr: GlobalAddress, data: &[u8]) -> Result<(), MemoryError> {
        for (i, &byte) in data.iter().enumerate() {
            let a = addr.offset_bytes(i as i64);
            if a.is_vpu(&self.tlb)? {
                let k_maddr = a.to_k_maddr(&self.tlb)?;
                let k_index = k_maddr.k_index;
                let meta = KinstrMeta { instr_ident: 0, writeset_ident: None };
                let dummy_reg = RegAddr { reg: 0, addr: 0, ordering: Ordering { word_order: WordOrder::Standard, ew: 8 } };
                self.dispatch_kinstr(k_index, Kinstr::StoreByte { meta, src: dummy_reg, dst: k_maddr, data: byte, bit_mask: 0xFF })?;
            } else {
                let scalar_addr = a.to_scalar_addr(&self.tlb)?;
                self.scalar_memory[scalar_addr as usize] = byte;
            }
        }
        Ok(())
    }

    pub fn get_memory(&mut self, addr: GlobalAddress, len: usize) -> Result<Vec<u8>, MemoryError> {
        let mut out = Vec::with_capacity(len);
        for i in 0..len as i64 {
            let a = addr.offset_bytes(i);
            if a.is_vpu(&self.tlb)? {
                let k_maddr = a.to_k_maddr(&self.tlb)?;
                let k_index = k_maddr.k_index;
                let meta = KinstrMeta { instr_ident: 0, writeset_ident: None };
                let dummy_reg = RegAddr { reg: 0, addr: 0, ordering: Ordering { word_order: WordOrder::Standard, ew: 8 } };
                let loaded = self.dispatch_kinstr(k_index, Kinstr::LoadByte { meta, dst: dummy_reg, src: k_maddr, bit_mask: 0xFF })?;
                out.push(loaded.map_or(0, |v| v[0]));
            } else {
                let scalar_addr = a.to_scalar_addr(&self.tlb)?;
                out.push(self.scalar_memory[scalar_addr as usize]);
            }
        }
        Ok(out)
    }

    /// HTIF `tohost` handling (spec.md §6.2): only `SYS_write = 64` is
    /// implemented. `magic_mem` is `[syscall, arg0 (fd), arg1 (buf), arg2
    /// (len)]`, 8 bytes each; the syscall's return value is written back to
    /// `magic_mem[0]` and `fromhost_addr` is set to `1`.
    pub fn handle_tohost(&mut self, magic_mem_addr: GlobalAddress) -> Result<Option<HtifExit>, MemoryError> {
        const SYS_WRITE: u64 = 64;
        let words = self.get_memory(magic_mem_addr, 32)?;
        let read_word = |w: &[u8]| -> u64 { w.iter().rev().fold(0u64, |acc, &b| (acc << 8) | b as u64) };
        let syscall = read_word(&words[0..8]);
        let fd = read_word(&words[8..16]);
        let buf_addr = read_word(&words[16..24]);
        let len = read_word(&words[24..32]);

        let ret: i64 = if syscall == SYS_WRITE && (fd == 1 || fd == 2) {
            let bytes = self.get_memory(GlobalAddress::from_byte_addr(buf_addr), len as usize)?;
            if let Ok(s) = std::str::from_utf8(&bytes) {
                if fd == 1 {
                    print!("{s}");
                } else {
                    eprint!("{s}");
                }
            }
            len as i64
        } else if syscall == SYS_WRITE {
            -1
        } else {
            debug!("unhandled HTIF syscall {syscall}");
            -1
        };

        self.set_memory(magic_mem_addr, &(ret as u64).to_le_bytes())?;
        self.fromhost_value = Some(1);

        if syscall == 93 || syscall == 0 {
            return Ok(Some(HtifExit { exit_code: ret as u64 }));
        }
        Ok(None)
    }

    pub fn take_fromhost(&mut self) -> Option<u64> {
        self.fromhost_value.take()
    }

    pub fn tick(&mut self) {
        self.clock.advance();
        trace!("lamlet cycle {}", self.clock.cycle());
    }
}

fn encode_fault(f: TlbFaultType) -> i64 {
    match f {
        TlbFaultType::None => 0,
        TlbFaultType::PageFault => 1,
        TlbFaultType::ReadFault => 2,
        TlbFaultType::WriteFault => 3,
        TlbFaultType::NotWaited => 4,
    }
}

/// A pre-decoded vector-memory-subsystem call, the unit `run_instructions`
/// consumes. Real RISC-V fetch/decode and vector ALU ops are out of scope
/// (spec.md §1's Non-goals); this is the thin external hook spec.md §6.1
/// describes, fed by an injected source rather than a real instruction
/// stream.
pub enum ProgramOp {
    Load { reg: usize, addr: GlobalAddress, n_elements: u64, ew: usize, mask_reg: Option<usize> },
    Store { reg: usize, addr: GlobalAddress, n_elements: u64, ew: usize, mask_reg: Option<usize> },
    Htif { magic_mem_addr: GlobalAddress },
}

impl Lamlet {
    /// Runs a pre-decoded instruction stream to completion or until it
    /// signals an HTIF exit.
    pub fn run_instructions(&mut self, ops: impl IntoIterator<Item = ProgramOp>) -> Result<HtifExit, MemoryError> {
        for op in ops {
            self.tick();
            match op {
                ProgramOp::Load { reg, addr, n_elements, ew, mask_reg } => {
                    let result = self.vload(reg, addr, n_elements, ew, mask_reg)?;
                    if result.fault_type.is_fault() {
                        warn!("vload faulted at element {:?}: {:?}", result.faulted_element, result.fault_type);
                    }
                }
                ProgramOp::Store { reg, addr, n_elements, ew, mask_reg } => {
                    let result = self.vstore(reg, addr, n_elements, ew, mask_reg)?;
                    if result.fault_type.is_fault() {
                        warn!("vstore faulted at element {:?}: {:?}", result.faulted_element, result.fault_type);
                    }
                }
                ProgramOp::Htif { magic_mem_addr } => {
                    if let Some(exit) = self.handle_tohost(magic_mem_addr)? {
                        return Ok(exit);
                    }
                }
            }
        }
        Ok(HtifExit { exit_code: 0 })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ordering(ew: usize) -> Ordering {
        Ordering { word_order: WordOrder::Standard, ew }
    }

    fn fresh_lamlet() -> Lamlet {
        Lamlet::new(Params::toy())
    }

    #[test]
    fn vstore_then_vload_round_trips_through_vpu_memory() {
        let mut lamlet = fresh_lamlet();
        let addr = GlobalAddress::from_byte_addr(0x1000);
        lamlet.allocate_memory(addr, lamlet.params().page_bytes as u64, MemoryType::Vpu, Some(ordering(32)), true, true).unwrap();

        for i in 0..8u64 {
            lamlet.set_vreg_byte(1, i * 4, (i + 1) as u8);
        }
        let store = lamlet.vstore(1, addr, 8, 32, None).unwrap();
        assert!(!store.fault_type.is_fault());

        let load = lamlet.vload(2, addr, 8, 32, None).unwrap();
        assert!(!load.fault_type.is_fault());
        for i in 0..8u64 {
            assert_eq!(lamlet.vreg_byte(2, i * 4), (i + 1) as u8);
        }
    }

    #[test]
    fn vload_faults_on_unmapped_address() {
        let mut lamlet = fresh_lamlet();
        let addr = GlobalAddress::from_byte_addr(0x9_0000_0000);
        let result = lamlet.vload(1, addr, 4, 32, None).unwrap();
        assert_eq!(result.fault_type, TlbFaultType::PageFault);
        assert_eq!(result.faulted_element, Some(0));
    }

    #[test]
    fn vstore_faults_on_read_only_page() {
        let mut lamlet = fresh_lamlet();
        let addr = GlobalAddress::from_byte_addr(0x2000);
        lamlet.allocate_memory(addr, lamlet.params().page_bytes as u64, MemoryType::Vpu, Some(ordering(32)), true, false).unwrap();
        let result = lamlet.vstore(1, addr, 4, 32, None).unwrap();
        assert_eq!(result.fault_type, TlbFaultType::WriteFault);
    }

    #[test]
    fn masked_vstore_then_masked_vload_only_touches_selected_elements() {
        let mut lamlet = fresh_lamlet();
        let addr = GlobalAddress::from_byte_addr(0x3000);
        lamlet.allocate_memory(addr, lamlet.params().page_bytes as u64, MemoryType::Vpu, Some(ordering(32)), true, true).unwrap();
        lamlet.set_vreg_byte(3, 0, 0b0000_0010); // only element 1 selected
        for i in 0..4u64 {
            lamlet.set_vreg_byte(1, i * 4, 0xEE);
        }
        lamlet.vstore(1, addr, 4, 32, Some(3)).unwrap();

        for i in 0..4u64 {
            lamlet.set_vreg_byte(2, i * 4, 0x11);
        }
        lamlet.vload(2, addr, 4, 32, Some(3)).unwrap();
        assert_eq!(lamlet.vreg_byte(2, 0), 0x11, "element 0 was masked off on both store and load");
        assert_eq!(lamlet.vreg_byte(2, 4), 0xEE, "element 1 was stored then loaded back");
    }

    #[test]
    fn strided_store_then_strided_load_skips_the_gaps() {
        let mut lamlet = fresh_lamlet();
        let addr = GlobalAddress::from_byte_addr(0x6000);
        lamlet.allocate_memory(addr, lamlet.params().page_bytes as u64, MemoryType::Vpu, Some(ordering(32)), true, true).unwrap();
        // element width 32 bits (4 bytes) but stride of 16 bytes: every 4th
        // word is touched, the 12 bytes between are left alone.
        for i in 0..4u64 {
            lamlet.set_vreg_byte(1, i * 4, (i + 1) as u8);
        }
        let store = lamlet.vstore_strided(1, addr, 4, 32, 16, None).unwrap();
        assert!(!store.fault_type.is_fault());

        let gap = lamlet.get_memory(addr.offset_bytes(4), 4).unwrap();
        assert_eq!(gap, vec![0, 0, 0, 0], "bytes between strided elements must be untouched");

        let load = lamlet.vload_strided(2, addr, 4, 32, 16, None).unwrap();
        assert!(!load.fault_type.is_fault());
        for i in 0..4u64 {
            assert_eq!(lamlet.vreg_byte(2, i * 4), (i + 1) as u8);
        }
    }

    #[test]
    fn strided_load_faults_on_unmapped_stride_target() {
        let mut lamlet = fresh_lamlet();
        let addr = GlobalAddress::from_byte_addr(0x7000);
        lamlet.allocate_memory(addr, lamlet.params().page_bytes as u64, MemoryType::Vpu, Some(ordering(32)), true, true).unwrap();
        // A large stride walks this strided op off the end of the mapped page.
        let page_bytes = lamlet.params().page_bytes as u64;
        let result = lamlet.vload_strided(1, addr, 4, 32, page_bytes, None).unwrap();
        assert_eq!(result.fault_type, TlbFaultType::PageFault);
        assert_eq!(result.faulted_element, Some(1));
    }

    #[test]
    fn indexed_unordered_gather_reads_scattered_elements() {
        let mut lamlet = fresh_lamlet();
        let addr = GlobalAddress::from_byte_addr(0x4000);
        lamlet.allocate_memory(addr, lamlet.params().page_bytes as u64, MemoryType::Vpu, Some(ordering(32)), true, true).unwrap();
        for i in 0..4u64 {
            let elem_addr = addr.offset_bytes((i * 4) as i64);
            lamlet.set_memory(elem_addr, &(100 + i as u32).to_le_bytes()).unwrap();
        }
        for i in 0..4u64 {
            let idx = (3 - i) * 4;
            lamlet.set_vreg_byte(9, i * 4, idx as u8);
        }
        let result = lamlet.vload_indexed_unordered(1, 9, addr, 4, 32, 32, None).unwrap();
        assert!(!result.fault_type.is_fault());
        let v = u32::from_le_bytes([
            lamlet.vreg_byte(1, 0),
            lamlet.vreg_byte(1, 1),
            lamlet.vreg_byte(1, 2),
            lamlet.vreg_byte(1, 3),
        ]);
        assert_eq!(v, 103);
    }

    #[test]
    fn indexed_ordered_store_commits_in_program_order() {
        let mut lamlet = fresh_lamlet();
        let addr = GlobalAddress::from_byte_addr(0x5000);
        lamlet.allocate_memory(addr, lamlet.params().page_bytes as u64, MemoryType::Vpu, Some(ordering(32)), true, true).unwrap();
        for i in 0..4u64 {
            lamlet.set_vreg_byte(9, i * 4, (i * 4) as u8);
            lamlet.set_vreg_byte(1, i * 4, (i + 1) as u8);
        }
        let result = lamlet.vstore_indexed_ordered(1, 9, addr, 4, 32, 32, None).unwrap();
        assert!(!result.fault_type.is_fault());
        let loaded = lamlet.get_memory(addr, 4).unwrap();
        assert_eq!(loaded[0], 1);
    }

    #[test]
    fn get_memory_split_flags_page_boundary_lumps() {
        let lamlet = fresh_lamlet();
        let addr = GlobalAddress::from_byte_addr(0x1000);
        let sections = lamlet.get_memory_split(addr, 0, 16, 4).unwrap();
        assert!(!sections.is_empty());
        assert!(sections.iter().all(|s| s.end_address > s.start_address));
    }
}
