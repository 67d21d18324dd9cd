//! All counters use `Relaxed` ordering. Individual counter values are
//! eventually consistent. Cross-counter snapshots may be transiently
//! inconsistent (e.g., bytes in use may briefly disagree with the live
//! block count). This is acceptable for diagnostic display. Do NOT use
//! these values for allocation decisions.

use crate::sync::atomic::{AtomicIsize, Ordering};

/// Diagnostic-only gauge counter.
///
/// Under contention, subtract-before-add races are tolerated and the raw
/// value may transiently dip below zero. Readers should always use `get()`,
/// which clamps negative values to zero.
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
        std::cmp::min(val, isize::MAX as usize).cast_signed()
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
        self.0.load(Ordering::Relaxed).max(0).cast_unsigned()
    }
}

// Bytes of backing buffer under management by live pools
crate::sync::static_atomic! {
    pub static TOTAL_CAPACITY: Counter = Counter::new();
}
// Bytes committed to live blocks (headers included) plus control structures
crate::sync::static_atomic! {
    pub static TOTAL_IN_USE: Counter = Counter::new();
}
// Live block count across all pools
crate::sync::static_atomic! {
    pub static LIVE_BLOCKS: Counter = Counter::new();
}
// Formatted pools currently alive
crate::sync::static_atomic! {
    pub static LIVE_POOLS: Counter = Counter::new();
}

/// Point-in-time view of the global gauges.
#[derive(Clone, Copy, Debug)]
pub struct PoolStats {
    pub total_capacity: usize,
    pub total_in_use: usize,
    pub live_blocks: usize,
    pub live_pools: usize,
}

impl PoolStats {
    #[must_use]
    pub fn snapshot() -> Self {
        Self {
            total_capacity: TOTAL_CAPACITY.get(),
            total_in_use: TOTAL_IN_USE.get(),
            live_blocks: LIVE_BLOCKS.get(),
            live_pools: LIVE_POOLS.get(),
        }
    }
}
