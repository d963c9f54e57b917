//! Per-kamlet DRAM backing store (spec.md §3.6).
//!
//! Reads of never-written bytes return a deterministic-on-seed pseudorandom
//! stream rather than zero, matching the original's use of Python's global
//! `random.getrandbits(8)` for uninitialized memory — reproduced here with a
//! seeded `rand::rngs::StdRng` so repeated runs with the same
//! `Params::dram_seed` are bit-identical. Once a byte is read or written it
//! is "initialized" and keeps returning the same value forever after,
//! exactly like real DRAM contents would.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::MemoryError;

/// A cache line read alongside a logically-simultaneous write to the same
/// line, used by kamlet read-modify-write style requests. Concurrent
/// requests to different lines each get their own slot from a small fixed
/// table; once the table is full, a new `WRITE_LINE_READ_LINE` is dropped
/// and must be retried, mirroring the j2j protocol's own drop/retry idiom
/// rather than growing the table unboundedly.
#[derive(Debug, Clone)]
struct GatheringSlot {
    tag: u32,
    line_addr: u64,
    old_data: Vec<u8>,
}

pub struct Memlet {
    data: Vec<u8>,
    initialized: Vec<bool>,
    rng: StdRng,
    cache_line_bytes: usize,
    gathering_slots: Vec<GatheringSlot>,
    gathering_capacity: usize,
}

impl Memlet {
    pub fn new(size_bytes: usize, cache_line_bytes: usize, seed: u64, gathering_capacity: usize) -> Self {
        Memlet {
            data: vec![0; size_bytes],
            initialized: vec![false; size_bytes],
            rng: StdRng::seed_from_u64(seed),
            cache_line_bytes,
            gathering_slots: Vec::new(),
            gathering_capacity,
        }
    }

    fn materialize(&mut self, addr: usize, len: usize) -> Result<(), MemoryError> {
        let end = addr
            .checked_add(len)
            .ok_or(MemoryError::OutOfBounds(addr as u64))?;
        if end > self.data.len() {
            return Err(MemoryError::OutOfBounds(addr as u64));
        }
        for i in addr..end {
            if !self.initialized[i] {
                self.data[i] = self.rng.gen::<u8>();
                self.initialized[i] = true;
            }
        }
        Ok(())
    }

    /// READ_LINE: returns the full cache line at `line_addr` (must be
    /// cache-line-aligned), materializing any never-written bytes first.
    pub fn read_line(&mut self, line_addr: u64) -> Result<Vec<u8>, MemoryError> {
        debug_assert_eq!(line_addr % self.cache_line_bytes as u64, 0);
        let addr = line_addr as usize;
        self.materialize(addr, self.cache_line_bytes)?;
        Ok(self.data[addr..addr + self.cache_line_bytes].to_vec())
    }

    /// WRITE_LINE: overwrites the full cache line at `line_addr`.
    pub fn write_line(&mut self, line_addr: u64, data: &[u8]) -> Result<(), MemoryError> {
        debug_assert_eq!(line_addr % self.cache_line_bytes as u64, 0);
        debug_assert_eq!(data.len(), self.cache_line_bytes);
        let addr = line_addr as usize;
        let end = addr
            .checked_add(data.len())
            .ok_or(MemoryError::OutOfBounds(addr as u64))?;
        if end > self.data.len() {
            return Err(MemoryError::OutOfBounds(addr as u64));
        }
        self.data[addr..end].copy_from_slice(data);
        for i in addr..end {
            self.initialized[i] = true;
        }
        Ok(())
    }

    /// WRITE_LINE_READ_LINE: writes `new_data` into the line but returns the
    /// pre-write contents, used when a kamlet evicts a modified line while
    /// simultaneously needing the old contents for a concurrent reader.
    /// Returns `None` (a DROP) if the gathering-slot table is full.
    pub fn write_line_read_line(
        &mut self,
        tag: u32,
        line_addr: u64,
        new_data: &[u8],
    ) -> Result<Option<Vec<u8>>, MemoryError> {
        if self.gathering_slots.len() >= self.gathering_capacity {
            return Ok(None);
        }
        let old_data = self.read_line(line_addr)?;
        self.write_line(line_addr, new_data)?;
        self.gathering_slots.push(GatheringSlot {
            tag,
            line_addr,
            old_data: old_data.clone(),
        });
        Ok(Some(old_data))
    }

    /// Releases a gathering slot once its paired response has been sent.
    pub fn complete_gathering(&mut self, tag: u32) {
        self.gathering_slots.retain(|s| s.tag != tag);
    }

    pub fn gathering_slot_addr(&self, tag: u32) -> Option<u64> {
        self.gathering_slots.iter().find(|s| s.tag == tag).map(|s| s.line_addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uninitialized_reads_are_deterministic_per_seed() {
        let mut a = Memlet::new(4096, 64, 42, 4);
        let mut b = Memlet::new(4096, 64, 42, 4);
        assert_eq!(a.read_line(0).unwrap(), b.read_line(0).unwrap());
    }

    #[test]
    fn different_seeds_diverge() {
        let mut a = Memlet::new(4096, 64, 1, 4);
        let mut b = Memlet::new(4096, 64, 2, 4);
        assert_ne!(a.read_line(0).unwrap(), b.read_line(0).unwrap());
    }

    #[test]
    fn once_read_a_line_stays_stable() {
        let mut m = Memlet::new(4096, 64, 7, 4);
        let first = m.read_line(64).unwrap();
        let second = m.read_line(64).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn write_then_read_round_trips() {
        let mut m = Memlet::new(4096, 64, 7, 4);
        let data = vec![0xABu8; 64];
        m.write_line(128, &data).unwrap();
        assert_eq!(m.read_line(128).unwrap(), data);
    }

    #[test]
    fn write_line_read_line_returns_old_contents() {
        let mut m = Memlet::new(4096, 64, 7, 4);
        let initial = vec![0x11u8; 64];
        m.write_line(0, &initial).unwrap();
        let new_data = vec![0x22u8; 64];
        let old = m.write_line_read_line(5, 0, &new_data).unwrap().unwrap();
        assert_eq!(old, initial);
        assert_eq!(m.read_line(0).unwrap(), new_data);
    }

    #[test]
    fn gathering_table_drops_when_full() {
        let mut m = Memlet::new(4096, 64, 7, 1);
        let data = vec![0u8; 64];
        assert!(m.write_line_read_line(1, 0, &data).unwrap().is_some());
        assert!(m.write_line_read_line(2, 64, &data).unwrap().is_none());
        m.complete_gathering(1);
        assert!(m.write_line_read_line(2, 64, &data).unwrap().is_some());
    }
}
