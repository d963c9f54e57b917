//! Sync network: a dedicated gather-tree bus kamlets use to agree on
//! min-reduced values (fault idents, completion barriers) without going
//! through the general-purpose router (spec.md §3.7).
//!
//! The original wires this as an explicit 8-neighbor quadrant/column/row
//! gather tree over a 9-bit `sync_ident`; that tree structure only matters
//! for wire-level timing the vector-memory subsystem doesn't need to
//! reproduce; the event-driven model here keeps the min-reduction semantics
//! (every participant's contribution needed before `is_complete`) without
//! hardcoding the physical topology, which belongs to router-internal
//! arbitration detail (an explicit Non-goal).

use std::collections::HashMap;

#[derive(Debug, Default)]
struct SyncEntry {
    received: usize,
    min_value: Option<i64>,
}

/// One lamlet-wide synchronizer instance, shared (by reference) across every
/// kamlet taking part in the gather.
pub struct Synchronizer {
    n_participants: usize,
    pending: HashMap<u32, SyncEntry>,
    /// `chain_fault_sync`: when `from` completes, its min value is fed as a
    /// contribution into `to` automatically. Used to propagate a fault
    /// ident's outcome into the next chunk's fault ident for strided ops
    /// (spec.md Testable Property 7).
    chains: HashMap<u32, u32>,
}

impl Synchronizer {
    pub fn new(n_participants: usize) -> Self {
        Synchronizer {
            n_participants,
            pending: HashMap::new(),
            chains: HashMap::new(),
        }
    }

    /// Registers one participant's contribution to `sync_ident`. `value` is
    /// `None` for a plain completion signal (no payload to reduce), `Some`
    /// for a fault sync where kamlets contribute their local fault code
    /// (`TlbFaultType` as `i64`, `0` meaning no fault) and the network keeps
    /// the minimum, so any non-zero fault anywhere wins only when every
    /// kamlet agrees a fault occurred at or before that point -- the
    /// original picks the numerically smallest reported value, which the
    /// kamlet-side fault encoding arranges to mean "most urgent."
    pub fn local_event(&mut self, sync_ident: u32, value: Option<i64>) {
        let entry = self.pending.entry(sync_ident).or_default();
        entry.received += 1;
        if let Some(v) = value {
            entry.min_value = Some(entry.min_value.map_or(v, |m| m.min(v)));
        }
        if entry.received >= self.n_participants {
            if let Some(&to) = self.chains.get(&sync_ident) {
                let propagated = entry.min_value;
                self.local_event(to, propagated);
            }
        }
    }

    pub fn is_complete(&self, sync_ident: u32) -> bool {
        self.pending
            .get(&sync_ident)
            .map_or(false, |e| e.received >= self.n_participants)
    }

    pub fn get_min_value(&self, sync_ident: u32) -> Option<i64> {
        self.pending.get(&sync_ident).and_then(|e| e.min_value)
    }

    /// Clears a completed sync's state once every waiter has consumed it, so
    /// the ident can be reused by a later instruction.
    pub fn reset(&mut self, sync_ident: u32) {
        self.pending.remove(&sync_ident);
    }

    pub fn chain_fault_sync(&mut self, from: u32, to: u32) {
        self.chains.insert(from, to);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completes_once_every_participant_reports() {
        let mut sync = Synchronizer::new(3);
        assert!(!sync.is_complete(1));
        sync.local_event(1, None);
        sync.local_event(1, None);
        assert!(!sync.is_complete(1));
        sync.local_event(1, None);
        assert!(sync.is_complete(1));
    }

    #[test]
    fn min_value_reduces_across_participants() {
        let mut sync = Synchronizer::new(2);
        sync.local_event(5, Some(3));
        sync.local_event(5, Some(0));
        assert_eq!(sync.get_min_value(5), Some(0));
    }

    #[test]
    fn chain_propagates_on_completion() {
        let mut sync = Synchronizer::new(1);
        sync.chain_fault_sync(10, 11);
        sync.local_event(10, Some(2));
        assert!(sync.is_complete(11));
        assert_eq!(sync.get_min_value(11), Some(2));
    }
}
