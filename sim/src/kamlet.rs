//! Per-kamlet dispatch: owns the cache table, this kamlet's memlet, its
//! jamlets, the register-token file, and a fixed-size cache request table
//! (spec.md §4.2 / §4.9).
//!
//! `update_kamlet` in the original is one big per-kinstr-class dynamic
//! dispatch; here `Kamlet::execute` is a single `match` over `Kinstr`. Cache
//! misses admit a real `WaitingCacheFetch` witem for the duration of the
//! fetch (spec.md §3.4), and a store only marks its line `Modified` — the
//! dirty data is written back lazily, only when the line's slot is actually
//! needed for something else (`evict_for`'s `Modified -> OldModified ->
//! WritingReading -> Shared` drain), matching spec.md §3.3/§4.2 rather than
//! writing through on every store.

use crate::address::{JSAddr, KMAddr, Ordering};
use crate::cache_table::{CacheLineState, CacheTable};
use crate::error::MemoryError;
use crate::jamlet::{apply_bit_mask, Jamlet};
use crate::kinstr::Kinstr;
use crate::memlet::Memlet;
use crate::params::Params;
use crate::regfile::KamletRegisterFile;
use crate::witem::{WaitingCacheFetch, WaitingItem, WaitingOrderedIndexedLoad};

/// One fixed-size cache-request-table entry (spec.md §4.9): tracks an
/// in-flight `READ_LINE`/`WRITE_LINE_READ_LINE` this kamlet has issued to its
/// memlet, keyed by the tag the memlet's response will carry.
#[derive(Debug, Clone, Copy)]
pub struct CacheRequestEntry {
    pub tag: u32,
    pub line_addr: u64,
    pub is_write: bool,
}

pub struct Kamlet {
    k_index: usize,
    params: Params,
    cache_table: CacheTable,
    jamlets: Vec<Jamlet>,
    regfile: KamletRegisterFile,
    /// Fixed-size table, sized `params.n_cache_requests`; `None` means free.
    cache_requests: Vec<Option<CacheRequestEntry>>,
    next_request_tag: u32,
}

impl Kamlet {
    pub fn new(k_index: usize, params: Params) -> Self {
        Kamlet {
            k_index,
            params,
            cache_table: CacheTable::new(params.n_slots(), params.cache_line_bytes, params.n_items_reserved),
            jamlets: (0..params.j_in_k).map(|_| Jamlet::new(&params)).collect(),
            regfile: KamletRegisterFile::new(),
            cache_requests: vec![None; params.n_cache_requests],
            next_request_tag: 0,
        }
    }

    pub fn k_index(&self) -> usize {
        self.k_index
    }

    pub fn regfile_mut(&mut self) -> &mut KamletRegisterFile {
        &mut self.regfile
    }

    pub fn cache_table(&self) -> &CacheTable {
        &self.cache_table
    }

    /// Admits an `OrderedIndexedLoad` read-all-memory barrier witem, held
    /// open until the caller (the lamlet, once its `OrderedBuffer` drains)
    /// calls `retire_witem` with the same ident (spec.md §3.4 / §4.2 rule 1).
    fn admit_ordered_barrier(&mut self, instr_ident: u32) {
        let mut w = WaitingOrderedIndexedLoad::new(instr_ident);
        w.sync_state = crate::witem::SyncPhase::Complete;
        self.cache_table.add_witem(WaitingItem::OrderedIndexedLoad(w));
    }

    /// Removes a previously-admitted witem (e.g. an ordered barrier) once its
    /// owning op has fully drained, per spec.md §3.4's witem lifecycle.
    pub fn retire_witem(&mut self, instr_ident: u32) {
        self.cache_table.remove_witem(|w| w.instr_ident() == instr_ident);
    }

    fn reserve_request_tag(&mut self, line_addr: u64, is_write: bool) -> Option<u32> {
        let slot = self.cache_requests.iter().position(|e| e.is_none())?;
        let tag = self.next_request_tag;
        self.next_request_tag = self.next_request_tag.wrapping_add(1);
        self.cache_requests[slot] = Some(CacheRequestEntry { tag, line_addr, is_write });
        Some(tag)
    }

    fn release_request_tag(&mut self, tag: u32) {
        if let Some(slot) = self.cache_requests.iter().position(|e| e.map_or(false, |r| r.tag == tag)) {
            self.cache_requests[slot] = None;
        }
    }

    /// Finds a slot for `memory_loc`, writing back a dirty victim first if
    /// every slot is occupied (spec.md §3.3's lazy-eviction writeback): a
    /// `Modified` line drains through `OldModified -> WritingReading ->
    /// Shared` before `CacheTable::get_new_slot` is retried against it.
    fn evict_for(&mut self, memlet: &mut Memlet, memory_loc: u64) -> Result<usize, MemoryError> {
        if let Some(slot) = self.cache_table.get_new_slot(memory_loc) {
            return Ok(slot);
        }
        let victim = (0..self.cache_table.n_slots())
            .find(|&i| self.cache_table.slot(i).state == CacheLineState::Modified)
            .ok_or(MemoryError::OutOfBounds(memory_loc))?;
        let victim_loc = self.cache_table.slot(victim).memory_loc.expect("a Modified slot always names its line");
        self.cache_table.set_state(victim, CacheLineState::OldModified);
        let dirty = self.gather_line_from_jamlets(victim_loc);
        self.cache_table.set_state(victim, CacheLineState::WritingReading);
        memlet.write_line(victim_loc, &dirty)?;
        self.cache_table.set_state(victim, CacheLineState::Shared);
        self.cache_table.get_new_slot(memory_loc).ok_or(MemoryError::OutOfBounds(memory_loc))
    }

    /// Ensures the cache line containing `addr` (a kamlet byte address) is
    /// resident, fetching it from the memlet if necessary. Admits a real
    /// `WaitingCacheFetch` witem for the duration of the fetch (spec.md
    /// §3.4), retired the moment the fetch resolves since dispatch is
    /// synchronous. Returns the slot index.
    fn ensure_resident(
        &mut self,
        memlet: &mut Memlet,
        addr: u64,
        instr_ident: u32,
        is_write: bool,
    ) -> Result<usize, MemoryError> {
        let line = (addr / self.params.cache_line_bytes as u64) * self.params.cache_line_bytes as u64;
        if let Some(slot) = self.cache_table.addr_to_slot(line) {
            return Ok(slot);
        }
        let tag = self
            .reserve_request_tag(line, is_write)
            .ok_or(MemoryError::OutOfBounds(addr))?;
        let ordering = Ordering { word_order: crate::address::WordOrder::Standard, ew: 8 };
        let k_maddr = KMAddr { k_index: self.k_index, bit_addr: line * 8, ordering };
        self.cache_table.add_witem(WaitingItem::CacheFetch(WaitingCacheFetch {
            instr_ident,
            k_maddr,
            is_write,
            writeset_ident: None,
            slot: None,
        }));
        let slot = self.evict_for(memlet, line)?;
        self.cache_table.set_state(slot, CacheLineState::Reading);
        let data = memlet.read_line(line)?;
        self.scatter_line_into_jamlets(line, &data);
        self.cache_table.set_state(slot, CacheLineState::Shared);
        self.release_request_tag(tag);
        self.cache_table
            .remove_witem(|w| matches!(w, WaitingItem::CacheFetch(f) if f.instr_ident == instr_ident));
        Ok(slot)
    }

    /// Distributes one freshly-fetched cache line's bytes out to the owning
    /// jamlet's SRAM at the right per-jamlet offset, one byte at a time (a
    /// byte's owning jamlet cycles every `word_bytes`, per `KMAddr`'s
    /// kamlet-local interleave).
    fn scatter_line_into_jamlets(&mut self, line_addr: u64, data: &[u8]) {
        let ordering = Ordering { word_order: crate::address::WordOrder::Standard, ew: 8 };
        for (i, &byte) in data.iter().enumerate() {
            let kaddr = KMAddr { k_index: self.k_index, bit_addr: (line_addr + i as u64) * 8, ordering };
            let j_index = kaddr.j_in_k_index(&self.params);
            if let Some(js) = kaddr.to_j_saddr(&self.params, &self.cache_table) {
                self.jamlets[j_index].write_sram(js.addr(), &[byte]);
            }
        }
    }

    /// Gathers one resident cache line's current bytes back out of the
    /// jamlets, for eviction writeback.
    fn gather_line_from_jamlets(&self, line_addr: u64) -> Vec<u8> {
        let ordering = Ordering { word_order: crate::address::WordOrder::Standard, ew: 8 };
        let mut out = Vec::with_capacity(self.params.cache_line_bytes);
        for i in 0..self.params.cache_line_bytes as u64 {
            let kaddr = KMAddr { k_index: self.k_index, bit_addr: (line_addr + i) * 8, ordering };
            let j_index = kaddr.j_in_k_index(&self.params);
            let js = kaddr
                .to_j_saddr(&self.params, &self.cache_table)
                .expect("line must be resident before gathering");
            out.push(self.jamlets[j_index].read_sram(js.addr(), 1)[0]);
        }
        out
    }

    fn js_addr_for(&self, k_maddr: KMAddr) -> Option<JSAddr> {
        k_maddr.to_j_saddr(&self.params, &self.cache_table)
    }

    /// Reads `len` bytes starting at `k_maddr`, ensuring every cache line
    /// touched is resident first. A byte's owning jamlet can change every
    /// `word_bytes`, so this walks byte-by-byte rather than assuming one
    /// jamlet holds a whole run.
    fn read_bytes(
        &mut self,
        memlet: &mut Memlet,
        k_maddr: KMAddr,
        len: usize,
        instr_ident: u32,
    ) -> Result<Vec<u8>, MemoryError> {
        debug_assert!(
            self.cache_table.can_read(),
            "read dispatched while a writes_all_memory witem is outstanding on kamlet {}",
            self.k_index
        );
        let mut out = Vec::with_capacity(len);
        for i in 0..len as i64 {
            let addr = k_maddr.bit_offset(i * 8);
            self.ensure_resident(memlet, addr.addr(), instr_ident, false)?;
            let js = self.js_addr_for(addr).ok_or(MemoryError::OutOfBounds(addr.addr()))?;
            out.push(self.jamlets[addr.j_in_k_index(&self.params)].read_sram(js.addr(), 1)[0]);
        }
        Ok(out)
    }

    /// Writes `data` starting at `k_maddr`. Only marks the touched line(s)
    /// `Modified`; the dirty bytes drain to the memlet lazily, at eviction
    /// time (`evict_for`), not on every store (spec.md §3.3).
    fn write_bytes(
        &mut self,
        memlet: &mut Memlet,
        k_maddr: KMAddr,
        data: &[u8],
        writeset_ident: Option<u32>,
        instr_ident: u32,
    ) -> Result<(), MemoryError> {
        debug_assert!(
            self.cache_table.can_write(writeset_ident),
            "write dispatched on kamlet {} while a conflicting reads_all_memory/writes_all_memory witem is outstanding",
            self.k_index
        );
        for (i, &byte) in data.iter().enumerate() {
            let addr = k_maddr.bit_offset(i as i64 * 8);
            let slot = self.ensure_resident(memlet, addr.addr(), instr_ident, true)?;
            self.cache_table.set_state(slot, CacheLineState::Modified);
            let js = self.js_addr_for(addr).ok_or(MemoryError::OutOfBounds(addr.addr()))?;
            self.jamlets[addr.j_in_k_index(&self.params)].write_sram(js.addr(), &[byte]);
        }
        Ok(())
    }

    /// Dispatches one kinstr against this kamlet. Loads return the bytes
    /// read (for the lamlet to place into its register file); stores return
    /// nothing.
    pub fn execute(&mut self, kinstr: &Kinstr, memlet: &mut Memlet) -> Result<Option<Vec<u8>>, MemoryError> {
        match kinstr {
            Kinstr::Load { meta, dsts, eb } => {
                let mut out = Vec::with_capacity(dsts.len() * *eb as usize);
                for (_, elem) in dsts {
                    out.extend(self.read_bytes(memlet, elem.k_maddr, *eb as usize, meta.instr_ident)?);
                }
                Ok(Some(out))
            }
            Kinstr::Store { meta, srcs, data, .. } => {
                for ((_, elem), bytes) in srcs.iter().zip(data.iter()) {
                    self.write_bytes(memlet, elem.k_maddr, bytes, meta.writeset_ident, meta.instr_ident)?;
                }
                Ok(None)
            }
            Kinstr::LoadByte { src, bit_mask, meta } => {
                let bytes = self.read_bytes(memlet, *src, 1, meta.instr_ident)?;
                Ok(Some(vec![bytes[0] & bit_mask]))
            }
            Kinstr::StoreByte { dst, data, bit_mask, meta } => {
                let current = self.read_bytes(memlet, *dst, 1, meta.instr_ident)?;
                let merged = apply_bit_mask(current[0], *data, *bit_mask);
                self.write_bytes(memlet, *dst, &[merged], meta.writeset_ident, meta.instr_ident)?;
                Ok(None)
            }
            Kinstr::LoadWord { src, byte_mask, meta } => {
                let bytes = self.read_bytes(memlet, *src, self.params.word_bytes, meta.instr_ident)?;
                let masked = bytes
                    .iter()
                    .enumerate()
                    .map(|(i, &b)| if byte_mask & (1 << i) != 0 { b } else { 0 })
                    .collect();
                Ok(Some(masked))
            }
            Kinstr::StoreWord { dst, data, byte_mask, meta } => {
                let current = self.read_bytes(memlet, *dst, data.len(), meta.instr_ident)?;
                let merged: Vec<u8> = current
                    .iter()
                    .zip(data.iter())
                    .enumerate()
                    .map(|(i, (&old, &new))| if byte_mask & (1 << i) != 0 { new } else { old })
                    .collect();
                self.write_bytes(memlet, *dst, &merged, meta.writeset_ident, meta.instr_ident)?;
                Ok(None)
            }
            Kinstr::LoadImmByte { imm, bit_mask, .. } => Ok(Some(vec![imm & bit_mask])),
            Kinstr::LoadImmWord { imm, byte_mask, .. } => {
                let masked = imm
                    .iter()
                    .enumerate()
                    .map(|(i, &b)| if byte_mask & (1 << i) != 0 { b } else { 0 })
                    .collect();
                Ok(Some(masked))
            }
            Kinstr::OrderedIndexedBarrier { meta } => {
                self.admit_ordered_barrier(meta.instr_ident);
                Ok(None)
            }
            Kinstr::LoadIndexedElement { src, mask, meta, .. } => {
                if !mask {
                    return Ok(Some(Vec::new()));
                }
                let eb = src.ordering.ew / 8;
                Ok(Some(self.read_bytes(memlet, *src, eb, meta.instr_ident)?))
            }
            Kinstr::StoreIndexedElement { dst, data, mask, meta, .. } => {
                if *mask {
                    self.write_bytes(memlet, *dst, data, meta.writeset_ident, meta.instr_ident)?;
                }
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::WordOrder;

    fn ordering(ew: usize) -> Ordering {
        Ordering { word_order: WordOrder::Standard, ew }
    }

    fn meta(ident: u32) -> crate::kinstr::KinstrMeta {
        crate::kinstr::KinstrMeta { instr_ident: ident, writeset_ident: None }
    }

    #[test]
    fn store_then_load_byte_round_trips() {
        let params = Params::toy();
        let mut kamlet = Kamlet::new(0, params);
        let mut memlet = Memlet::new(params.kamlet_memory_bytes, params.cache_line_bytes, 1, params.n_gathering_slots);
        let addr = KMAddr { k_index: 0, bit_addr: 0, ordering: ordering(8) };
        let reg = crate::address::RegAddr { reg: 0, addr: 0, ordering: ordering(8) };

        kamlet
            .execute(
                &Kinstr::StoreByte { meta: meta(1), src: reg, dst: addr, data: 0xAB, bit_mask: 0xFF },
                &mut memlet,
            )
            .unwrap();
        let loaded = kamlet
            .execute(&Kinstr::LoadByte { meta: meta(2), dst: reg, src: addr, bit_mask: 0xFF }, &mut memlet)
            .unwrap()
            .unwrap();
        assert_eq!(loaded, vec![0xAB]);
    }

    #[test]
    fn store_word_respects_byte_mask() {
        let params = Params::toy();
        let mut kamlet = Kamlet::new(0, params);
        let mut memlet = Memlet::new(params.kamlet_memory_bytes, params.cache_line_bytes, 1, params.n_gathering_slots);
        let addr = KMAddr { k_index: 0, bit_addr: 0, ordering: ordering(64) };
        let reg = crate::address::RegAddr { reg: 0, addr: 0, ordering: ordering(64) };

        kamlet
            .execute(
                &Kinstr::StoreWord {
                    meta: meta(1),
                    src: reg,
                    dst: addr,
                    data: vec![0xFF; 8],
                    byte_mask: 0b0000_0011,
                },
                &mut memlet,
            )
            .unwrap();
        let loaded = kamlet
            .execute(&Kinstr::LoadWord { meta: meta(2), dst: reg, src: addr, byte_mask: 0xFF }, &mut memlet)
            .unwrap()
            .unwrap();
        assert_eq!(&loaded[0..2], &[0xFF, 0xFF]);
        assert_eq!(&loaded[2..8], &[0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn masked_indexed_store_is_a_no_op_when_mask_is_false() {
        let params = Params::toy();
        let mut kamlet = Kamlet::new(0, params);
        let mut memlet = Memlet::new(params.kamlet_memory_bytes, params.cache_line_bytes, 1, params.n_gathering_slots);
        let addr = KMAddr { k_index: 0, bit_addr: 0, ordering: ordering(32) };
        let reg = crate::address::RegAddr { reg: 0, addr: 0, ordering: ordering(32) };

        kamlet
            .execute(
                &Kinstr::StoreIndexedElement {
                    meta: meta(1),
                    src: reg,
                    dst: addr,
                    data: vec![0x11; 4],
                    element_index: 0,
                    mask: false,
                },
                &mut memlet,
            )
            .unwrap();
        let loaded = kamlet
            .execute(
                &Kinstr::LoadIndexedElement { meta: meta(2), dst: reg, src: addr, element_index: 0, mask: true },
                &mut memlet,
            )
            .unwrap()
            .unwrap();
        assert_ne!(loaded, vec![0x11; 4]);
    }
}
