//! All counters use `Relaxed` ordering. Individual counter values are
//! eventually consistent. Cross-counter snapshots may be transiently
//! inconsistent. This is acceptable for diagnostic display.
//! Do NOT use these values for placement or commit decisions.

use crate::sync::atomic::{AtomicIsize, Ordering};

/// Diagnostic-only gauge counter.
///
/// Under contention, subtract-before-add races are tolerated and the raw value
/// may transiently dip below zero. Readers should always use `get()`, which
/// clamps negative values to zero.
pub struct Counter(AtomicIsize);

impl Counter {
    #[cfg(not(loom))]
    pub const fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[cfg(loom)]
    pub fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[inline]
    fn delta(val: usize) -> isize {
        // Diagnostic counters only: clamp absurd deltas instead of panicking.
        isize::try_from(val).unwrap_or(isize::MAX)
    }

    #[inline]
    pub fn add(&self, val: usize) {
        self.0.fetch_add(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    pub fn sub(&self, val: usize) {
        self.0.fetch_sub(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    pub fn get(&self) -> usize {
        usize::try_from(self.0.load(Ordering::Relaxed)).unwrap_or(0)
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

/// Counters kept by one [`super::region::VirtualMemory`].
#[derive(Default)]
pub(crate) struct VmCounters {
    /// Address space currently reserved.
    pub reserved: Counter,
    /// Bytes handed to successful commits minus bytes uncommitted. Commits
    /// of already-committed pages are counted again, so this is an upper
    /// bound on committed memory.
    pub committed: Counter,
    pub reservations: Counter,
    pub failed_reservations: Counter,
    pub failed_commits: Counter,
}

impl VmCounters {
    pub fn snapshot(&self) -> VmStats {
        VmStats {
            reserved_bytes: self.reserved.get(),
            committed_bytes: self.committed.get(),
            reservations: self.reservations.get(),
            failed_reservations: self.failed_reservations.get(),
            failed_commits: self.failed_commits.get(),
        }
    }
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VmStats {
    pub reserved_bytes: usize,
    pub committed_bytes: usize,
    pub reservations: usize,
    pub failed_reservations: usize,
    pub failed_commits: usize,
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn test_counter_clamps_at_zero() {
        let counter = Counter::new();
        counter.add(10);
        counter.sub(25);
        assert_eq!(counter.get(), 0);
        counter.add(20);
        assert_eq!(counter.get(), 5);
    }

    #[test]
    fn test_snapshot_copies_counters() {
        let counters = VmCounters::default();
        counters.reserved.add(4096);
        counters.reservations.add(1);
        let stats = counters.snapshot();
        assert_eq!(stats.reserved_bytes, 4096);
        assert_eq!(stats.reservations, 1);
        assert_eq!(stats.committed_bytes, 0);
    }
}
