//! Stateid layout, validation and per-client index allocation

use std::collections::HashSet;

use crate::error::StateStatus;

/// NFSv4 stateid: a 32-bit sequence number plus 12 opaque bytes packing the
/// server boot epoch, the owning client record's index, and a per-client
/// state index. The opaque words are big-endian so handles dump legibly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StateId {
    /// Sequence number, bumped on every state-changing operation against
    /// this stateid
    pub seqid: u32,
    /// Opaque portion: boot epoch | client index | state index
    pub other: [u8; 12],
}

impl StateId {
    /// All-zero sentinel: "use no state" (anonymous I/O)
    pub const ANONYMOUS: StateId = StateId {
        seqid: 0,
        other: [0; 12],
    };

    /// All-ones sentinel: bypass locking checks for reads
    pub const READ_BYPASS: StateId = StateId {
        seqid: u32::MAX,
        other: [0xff; 12],
    };

    /// Build a fresh stateid with sequence 1
    pub fn new(boot_epoch: u32, client_index: u32, state_index: u32) -> Self {
        let mut other = [0u8; 12];
        other[0..4].copy_from_slice(&boot_epoch.to_be_bytes());
        other[4..8].copy_from_slice(&client_index.to_be_bytes());
        other[8..12].copy_from_slice(&state_index.to_be_bytes());
        Self { seqid: 1, other }
    }

    fn word(&self, i: usize) -> u32 {
        let mut b = [0u8; 4];
        b.copy_from_slice(&self.other[i * 4..i * 4 + 4]);
        u32::from_be_bytes(b)
    }

    /// Boot epoch that issued this stateid
    pub fn boot_epoch(&self) -> u32 {
        self.word(0)
    }

    /// Index of the owning client record
    pub fn client_index(&self) -> u32 {
        self.word(1)
    }

    /// Per-client state index
    pub fn state_index(&self) -> u32 {
        self.word(2)
    }

    /// True for the anonymous and read-bypass sentinels
    pub fn is_special(&self) -> bool {
        *self == StateId::ANONYMOUS || *self == StateId::READ_BYPASS
    }

    /// Reject stateids minted by a previous server instance. Sentinels are
    /// always accepted.
    pub fn check_epoch(&self, boot_epoch: u32) -> Result<(), StateStatus> {
        if self.is_special() || self.boot_epoch() == boot_epoch {
            Ok(())
        } else {
            Err(StateStatus::StaleStateId)
        }
    }

    /// Advance the sequence number
    pub fn bump(&mut self) {
        self.seqid = self.seqid.wrapping_add(1);
    }
}

/// Issues per-client state indices. The fast path is a bare increment; a
/// wraparound triggers a rescan of the client's outstanding indices for a
/// fresh sub-range, splitting around the 2^31 midpoint. If no gap exists
/// (pathological: billions of live states) it degrades to a linear
/// first-unused scan repeated on every allocation until the range clears.
#[derive(Debug, Default)]
pub(crate) struct StateIndexAllocator {
    next: u32,
    limit: u32,
    rescan: bool,
}

impl StateIndexAllocator {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Allocate an index not present in `in_use`
    pub(crate) fn allocate(&mut self, in_use: &HashSet<u32>) -> u32 {
        if self.rescan {
            // Degraded mode hands out the first unused index on every call.
            // Leave it only once a usable sub-range has reappeared, and even
            // then return the linear candidate so nothing outstanding is
            // reused.
            let candidate = Self::first_unused(in_use);
            if let Some((next, limit)) = Self::fresh_range(in_use) {
                self.rescan = false;
                self.next = next;
                self.limit = limit;
            }
            return candidate;
        }

        self.next = self.next.wrapping_add(1);
        if self.next != self.limit {
            return self.next;
        }

        // Exhausted the current sub-range: rescan the outstanding indices,
        // splitting around the midpoint, for a fresh [min+1, max) range.
        match Self::fresh_range(in_use) {
            Some((next, limit)) => {
                self.next = next;
                self.limit = limit;
                self.next
            }
            None => {
                self.rescan = true;
                Self::first_unused(in_use)
            }
        }
    }

    fn first_unused(in_use: &HashSet<u32>) -> u32 {
        let mut candidate: u32 = 1;
        while in_use.contains(&candidate) {
            candidate = candidate.wrapping_add(1);
        }
        candidate
    }

    /// A fresh `[min+1, max)` sub-range split around the midpoint, if the
    /// outstanding indices leave one
    fn fresh_range(in_use: &HashSet<u32>) -> Option<(u32, u32)> {
        let mut min_index: u32 = 0;
        let mut max_index: u32 = u32::MAX;
        for &idx in in_use {
            if idx > 0x8000_0000 {
                if idx < max_index {
                    max_index = idx;
                }
            } else if idx > min_index {
                min_index = idx;
            }
        }
        if max_index - min_index <= 1 {
            None
        } else {
            Some((min_index.wrapping_add(1), max_index))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stateid_pack_unpack() {
        let sid = StateId::new(0x1122_3344, 7, 99);
        assert_eq!(sid.seqid, 1);
        assert_eq!(sid.boot_epoch(), 0x1122_3344);
        assert_eq!(sid.client_index(), 7);
        assert_eq!(sid.state_index(), 99);
    }

    #[test]
    fn test_sentinels_pass_epoch_check() {
        assert!(StateId::ANONYMOUS.check_epoch(12345).is_ok());
        assert!(StateId::READ_BYPASS.check_epoch(12345).is_ok());
    }

    #[test]
    fn test_stale_epoch_rejected() {
        let sid = StateId::new(100, 1, 1);
        assert_eq!(sid.check_epoch(101), Err(StateStatus::StaleStateId));
        assert!(sid.check_epoch(100).is_ok());
    }

    #[test]
    fn test_allocator_monotonic() {
        let mut alloc = StateIndexAllocator::new();
        let in_use = HashSet::new();
        assert_eq!(alloc.allocate(&in_use), 1);
        assert_eq!(alloc.allocate(&in_use), 2);
        assert_eq!(alloc.allocate(&in_use), 3);
    }

    #[test]
    fn test_allocator_wraparound_rescan() {
        let mut alloc = StateIndexAllocator::new();
        // Simulate an allocator about to hit its limit with a few indices
        // outstanding below the midpoint.
        alloc.next = 41;
        alloc.limit = 43;
        let in_use: HashSet<u32> = [5u32, 10, 0x9000_0000].into_iter().collect();
        assert_eq!(alloc.allocate(&in_use), 42);
        // Next allocation hits the limit and rescans: new range starts past
        // the highest sub-midpoint index in use.
        let idx = alloc.allocate(&in_use);
        assert_eq!(idx, 11);
        assert!(!in_use.contains(&idx));
    }

    #[test]
    fn test_allocator_linear_fallback() {
        let mut alloc = StateIndexAllocator::new();
        alloc.next = 0;
        alloc.limit = 1;
        // Outstanding indices straddle the midpoint with no gap between.
        let in_use: HashSet<u32> = [1u32, 0x8000_0000, 0x8000_0001].into_iter().collect();
        let idx = alloc.allocate(&in_use);
        assert_eq!(idx, 2);
        assert!(alloc.rescan);
        // Still rescanning: freeing an index makes it reusable immediately,
        // and the gap that opened up switches the allocator back to ranged
        // allocation afterwards.
        let in_use: HashSet<u32> = [1u32, 3].into_iter().collect();
        assert_eq!(alloc.allocate(&in_use), 2);
        assert!(!alloc.rescan);
        let idx = alloc.allocate(&in_use);
        assert!(!in_use.contains(&idx));
        assert_ne!(idx, 2);
    }
}
