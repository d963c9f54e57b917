//! Page-table model: two independent bump allocators (VPU space, scalar
//! space) plus free lists, backing the `GlobalAddress -> VPUAddress` /
//! `GlobalAddress -> scalar addr` translation and permission/freshness
//! checks (spec.md §3.2).
//!
//! Idempotent and non-idempotent scalar pages share one address space and one
//! allocator, matching the original: the distinction only affects how a
//! memlet treats repeated writes, not where pages live.

use std::collections::HashMap;

use crate::address::{GlobalAddress, Ordering};
use crate::error::{MemoryError, TlbFaultType};
use crate::params::Params;

/// Region of the local (post-TLB) address space a page lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum MemoryType {
    Vpu,
    ScalarIdempotent,
    ScalarNonIdempotent,
}

impl MemoryType {
    pub fn is_vpu(self) -> bool {
        matches!(self, MemoryType::Vpu)
    }
}

/// Where a page's bytes actually live, once translated out of the flat
/// global address space.
#[derive(Debug, Clone, Copy)]
pub struct LocalAddress {
    pub memory_type: MemoryType,
    pub bit_addr: u64,
    /// Only set for VPU pages; scalar memory has no word/element order.
    pub ordering: Option<Ordering>,
}

#[derive(Debug, Clone)]
pub struct PageInfo {
    pub global: GlobalAddress,
    pub local: LocalAddress,
    /// One bit per cache line within the page, cleared the first time a
    /// memlet observes the line has been written, matching the
    /// uninitialized-DRAM-read behavior in `memlet.rs`.
    pub fresh: Vec<bool>,
    pub readable: bool,
    pub writable: bool,
}

pub struct Tlb {
    params: Params,
    /// Keyed by global (logical) page byte address.
    pages: HashMap<u64, PageInfo>,
    /// Keyed by physical VPU page byte address.
    vpu_pages: HashMap<u64, PageInfo>,
    vpu_freed_pages: Vec<u64>,
    vpu_lowest_never_used_page: u64,
    /// Keyed by physical scalar page byte address.
    scalar_pages: HashMap<u64, PageInfo>,
    scalar_freed_pages: Vec<u64>,
    scalar_lowest_never_used_page: u64,
}

impl Tlb {
    pub fn new(params: Params) -> Self {
        Tlb {
            params,
            pages: HashMap::new(),
            vpu_pages: HashMap::new(),
            vpu_freed_pages: Vec::new(),
            vpu_lowest_never_used_page: 0,
            scalar_pages: HashMap::new(),
            scalar_freed_pages: Vec::new(),
            scalar_lowest_never_used_page: 0,
        }
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    fn vpu_memory_bytes(&self) -> u64 {
        (self.params.k_in_l * self.params.kamlet_memory_bytes) as u64
    }

    fn get_lowest_free_page(&mut self, memory_type: MemoryType) -> Result<u64, MemoryError> {
        let page_bytes = self.params.page_bytes as u64;
        if memory_type.is_vpu() {
            if let Some(addr) = self.vpu_freed_pages.pop() {
                return Ok(addr);
            }
            let addr = self.vpu_lowest_never_used_page;
            if addr + page_bytes > self.vpu_memory_bytes() {
                return Err(MemoryError::OutOfPages(memory_type));
            }
            self.vpu_lowest_never_used_page += page_bytes;
            Ok(addr)
        } else {
            if let Some(addr) = self.scalar_freed_pages.pop() {
                return Ok(addr);
            }
            let addr = self.scalar_lowest_never_used_page;
            if addr + page_bytes > self.params.scalar_memory_bytes as u64 {
                return Err(MemoryError::OutOfPages(memory_type));
            }
            self.scalar_lowest_never_used_page += page_bytes;
            Ok(addr)
        }
    }

    /// Maps `size` bytes starting at `address` (must be page-aligned,
    /// `size` a multiple of `page_bytes`) into the given memory type.
    pub fn allocate_memory(
        &mut self,
        address: GlobalAddress,
        size: u64,
        memory_type: MemoryType,
        ordering: Option<Ordering>,
        readable: bool,
        writable: bool,
    ) -> Result<(), MemoryError> {
        let page_bytes = self.params.page_bytes as u64;
        debug_assert_eq!(size % page_bytes, 0);
        debug_assert_eq!(address.addr() % page_bytes, 0);
        let n_cache_lines = self.params.page_bytes / self.params.cache_line_bytes / self.params.k_in_l;
        let n_pages = size / page_bytes;
        for i in 0..n_pages {
            let logical_page_address = address.offset_bytes((i * page_bytes) as i64);
            let physical_addr = self.get_lowest_free_page(memory_type)?;
            let local = LocalAddress {
                memory_type,
                bit_addr: physical_addr * 8,
                ordering,
            };
            let info = PageInfo {
                global: logical_page_address,
                local,
                fresh: vec![true; n_cache_lines.max(1)],
                readable,
                writable,
            };
            self.pages.insert(logical_page_address.addr(), info.clone());
            if memory_type.is_vpu() {
                self.vpu_pages.insert(physical_addr, info);
            } else {
                self.scalar_pages.insert(physical_addr, info);
            }
        }
        Ok(())
    }

    pub fn release_memory(&mut self, address: GlobalAddress, size: u64) -> Result<(), MemoryError> {
        let page_bytes = self.params.page_bytes as u64;
        let n_pages = size / page_bytes;
        for i in 0..n_pages {
            let logical_page_address = address.offset_bytes((i * page_bytes) as i64);
            let info = self
                .pages
                .remove(&logical_page_address.addr())
                .ok_or(MemoryError::PageFault(logical_page_address.addr()))?;
            let physical_addr = info.local.bit_addr / 8;
            if info.local.memory_type.is_vpu() {
                self.vpu_pages.remove(&physical_addr);
                self.vpu_freed_pages.push(physical_addr);
            } else {
                self.scalar_pages.remove(&physical_addr);
                self.scalar_freed_pages.push(physical_addr);
            }
        }
        Ok(())
    }

    pub fn get_page_info(&self, page_address: &GlobalAddress) -> Result<&PageInfo, MemoryError> {
        debug_assert_eq!(page_address.addr() % self.params.page_bytes as u64, 0);
        self.pages
            .get(&page_address.addr())
            .ok_or(MemoryError::PageFault(page_address.addr()))
    }

    pub fn get_page_info_from_vpu_addr(&self, vpu_page_addr: u64) -> Result<&PageInfo, MemoryError> {
        debug_assert_eq!(vpu_page_addr % self.params.page_bytes as u64, 0);
        self.vpu_pages
            .get(&vpu_page_addr)
            .ok_or(MemoryError::PageFault(vpu_page_addr))
    }

    pub fn check_access(&self, address: &GlobalAddress, is_write: bool) -> TlbFaultType {
        let page_addr = address.get_page(&self.params);
        let info = match self.pages.get(&page_addr.addr()) {
            Some(info) => info,
            None => return TlbFaultType::PageFault,
        };
        if is_write && !info.writable {
            return TlbFaultType::WriteFault;
        }
        if !is_write && !info.readable {
            return TlbFaultType::ReadFault;
        }
        TlbFaultType::None
    }

    fn cache_line_index(&self, address: &GlobalAddress, page_info: &PageInfo) -> usize {
        let page_offset = address.addr() - page_info.global.addr();
        (page_offset as usize) / self.params.cache_line_bytes / self.params.k_in_l
    }

    pub fn get_is_fresh(&self, address: &GlobalAddress) -> Result<bool, MemoryError> {
        let page_addr = address.get_page(&self.params);
        let info = self.get_page_info(&page_addr)?;
        let idx = self.cache_line_index(address, info);
        Ok(info.fresh[idx])
    }

    pub fn set_not_fresh(&mut self, address: &GlobalAddress) -> Result<(), MemoryError> {
        let page_addr = address.get_page(&self.params);
        let idx = {
            let info = self.get_page_info(&page_addr)?;
            self.cache_line_index(address, info)
        };
        let info = self
            .pages
            .get_mut(&page_addr.addr())
            .ok_or(MemoryError::PageFault(page_addr.addr()))?;
        debug_assert!(info.fresh[idx], "set_not_fresh on an already-stale line");
        info.fresh[idx] = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::WordOrder;

    fn ordering() -> Ordering {
        Ordering {
            word_order: WordOrder::Standard,
            ew: 32,
        }
    }

    #[test]
    fn allocate_then_check_access() {
        let params = Params::toy();
        let mut tlb = Tlb::new(params);
        let addr = GlobalAddress::from_byte_addr(0x2000);
        tlb.allocate_memory(addr, params.page_bytes as u64, MemoryType::Vpu, Some(ordering()), true, false)
            .unwrap();
        assert_eq!(tlb.check_access(&addr, false), TlbFaultType::None);
        assert_eq!(tlb.check_access(&addr, true), TlbFaultType::WriteFault);
        let unmapped = GlobalAddress::from_byte_addr(0x9_0000_0000);
        assert_eq!(tlb.check_access(&unmapped, false), TlbFaultType::PageFault);
    }

    #[test]
    fn freed_pages_are_reused() {
        let params = Params::toy();
        let mut tlb = Tlb::new(params);
        let addr = GlobalAddress::from_byte_addr(0x4000);
        tlb.allocate_memory(addr, params.page_bytes as u64, MemoryType::Vpu, Some(ordering()), true, true)
            .unwrap();
        let physical_before = tlb.get_page_info(&addr).unwrap().local.bit_addr;
        tlb.release_memory(addr, params.page_bytes as u64).unwrap();
        assert!(tlb.get_page_info(&addr).is_err());
        tlb.allocate_memory(addr, params.page_bytes as u64, MemoryType::Vpu, Some(ordering()), true, true)
            .unwrap();
        assert_eq!(tlb.get_page_info(&addr).unwrap().local.bit_addr, physical_before);
    }

    #[test]
    fn freshness_tracks_cache_lines() {
        let params = Params::toy();
        let mut tlb = Tlb::new(params);
        let addr = GlobalAddress::from_byte_addr(0x6000);
        tlb.allocate_memory(addr, params.page_bytes as u64, MemoryType::Vpu, Some(ordering()), true, true)
            .unwrap();
        assert!(tlb.get_is_fresh(&addr).unwrap());
        tlb.set_not_fresh(&addr).unwrap();
        assert!(!tlb.get_is_fresh(&addr).unwrap());
    }
}
