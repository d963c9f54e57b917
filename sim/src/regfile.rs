//! Per-kamlet register-file token tracking (spec.md §3.5).
//!
//! This tracks *dependency* tokens, not data: actual register bytes live in
//! each jamlet's register slice (`jamlet.rs`). A kinstr claims a write token
//! (exclusive) or read tokens (shared, but exclusive against any writer)
//! before it is allowed to execute; a kinstr that can't yet claim what it
//! needs stays in the cache table's waiting-item queue, blocked on whichever
//! instr_ident currently holds the conflicting token.

use std::collections::HashMap;

#[derive(Debug, Default)]
struct RegState {
    write_token: Option<u32>,
    read_tokens: Vec<u32>,
}

/// Tracks, per vreg, which in-flight `instr_ident` currently holds the write
/// token and which hold read tokens.
#[derive(Debug, Default)]
pub struct KamletRegisterFile {
    regs: HashMap<usize, RegState>,
}

impl KamletRegisterFile {
    pub fn new() -> Self {
        KamletRegisterFile::default()
    }

    fn entry(&mut self, vreg: usize) -> &mut RegState {
        self.regs.entry(vreg).or_default()
    }

    /// Whether `instr_ident` can claim the write token for `vreg` right now
    /// (no other writer or reader holds it).
    pub fn can_claim_write(&self, vreg: usize, instr_ident: u32) -> bool {
        match self.regs.get(&vreg) {
            None => true,
            Some(s) => {
                (s.write_token.is_none() || s.write_token == Some(instr_ident)) && s.read_tokens.is_empty()
            }
        }
    }

    /// Whether `instr_ident` can claim a read token for `vreg` right now (no
    /// writer holds it, or that writer is this same instruction).
    pub fn can_claim_read(&self, vreg: usize, instr_ident: u32) -> bool {
        match self.regs.get(&vreg) {
            None => true,
            Some(s) => s.write_token.is_none() || s.write_token == Some(instr_ident),
        }
    }

    pub fn claim_write(&mut self, vreg: usize, instr_ident: u32) {
        debug_assert!(self.can_claim_write(vreg, instr_ident));
        self.entry(vreg).write_token = Some(instr_ident);
    }

    pub fn claim_read(&mut self, vreg: usize, instr_ident: u32) {
        debug_assert!(self.can_claim_read(vreg, instr_ident));
        let state = self.entry(vreg);
        if !state.read_tokens.contains(&instr_ident) {
            state.read_tokens.push(instr_ident);
        }
    }

    /// Releases every token `instr_ident` holds across all vregs, called when
    /// its witem completes.
    pub fn release(&mut self, instr_ident: u32) {
        for state in self.regs.values_mut() {
            if state.write_token == Some(instr_ident) {
                state.write_token = None;
            }
            state.read_tokens.retain(|&t| t != instr_ident);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_blocks_until_released() {
        let mut rf = KamletRegisterFile::new();
        rf.claim_write(3, 1);
        assert!(!rf.can_claim_read(3, 2));
        assert!(rf.can_claim_read(3, 1));
        rf.release(1);
        assert!(rf.can_claim_read(3, 2));
    }

    #[test]
    fn concurrent_readers_block_a_writer() {
        let mut rf = KamletRegisterFile::new();
        rf.claim_read(5, 1);
        rf.claim_read(5, 2);
        assert!(!rf.can_claim_write(5, 3));
        rf.release(1);
        assert!(!rf.can_claim_write(5, 3));
        rf.release(2);
        assert!(rf.can_claim_write(5, 3));
    }
}
