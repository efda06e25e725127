//! Region records.
//!
//! The volume address space is split into fixed-size regions, the unit of
//! write-grant arbitration with the server. A record exists for every region
//! that is currently owned, requested, or cached as desynced.
//!
//! The signed `count` encodes both the in-flight write count and two sentinel
//! states:
//!
//! -   `count >= 0`: the grant is held and `count` writes are in flight.
//! -   [`COUNT_REQUESTED`] (−1): a grant query is outstanding; deferred
//!     writes are parked on the table entry's wait list.
//! -   [`COUNT_CACHED`] (−2): no grant, but the region is known desynced and
//!     is kept so readers can find the desync bit.
//!
//! Increments happen only under the region table lock. Decrements are
//! deliberately lock-free: only the 1→0 transition is externally meaningful,
//! and exactly one decrementer observes it, so completion context never has
//! to take the table lock.

use std::sync::atomic::{AtomicI32, AtomicU8, Ordering};

pub(crate) mod table;

/// The server reports this region as dirty/unsynced.
pub(crate) const DESYNC: u8 = 1 << 0;
/// The server asked us to release as soon as in-flight writes finish; the
/// count must not be incremented further.
pub(crate) const DRAIN: u8 = 1 << 1;

/// Grant requested, waiting for the server reply.
pub(crate) const COUNT_REQUESTED: i32 = -1;
/// No grant held; record cached for reader lookups of the desync bit.
pub(crate) const COUNT_CACHED: i32 = -2;

pub(crate) struct Region {
    regnum: u64,
    count: AtomicI32,
    /// DESYNC | DRAIN. Written only under the region table lock; reads may
    /// happen anywhere.
    flags: AtomicU8,
}

impl Region {
    pub fn new(regnum: u64, flags: u8, count: i32) -> Self {
        Self {
            regnum,
            count: AtomicI32::new(count),
            flags: AtomicU8::new(flags),
        }
    }

    /// Reinitialize a spare record before insertion. Requires exclusive
    /// ownership, which the spare discipline guarantees.
    pub fn reinit(&mut self, regnum: u64, flags: u8, count: i32) {
        self.regnum = regnum;
        *self.count.get_mut() = count;
        *self.flags.get_mut() = flags;
    }

    pub fn regnum(&self) -> u64 {
        self.regnum
    }

    pub fn count(&self) -> i32 {
        self.count.load(Ordering::Acquire)
    }

    /// Take a reference for an in-flight write or a pending retire.
    /// Writers increment under the region table lock; the delayed-release
    /// arm re-raises 0→1 from completion context, which is safe because
    /// only the zero transition is externally meaningful.
    pub fn get(&self) {
        self.count.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop a reference; true exactly once, for the 1→0 transition.
    pub fn put_test_zero(&self) -> bool {
        self.count.fetch_sub(1, Ordering::AcqRel) == 1
    }

    /// Overwrite the count when moving between sentinel states.
    /// Callers hold the region table lock.
    pub fn set_count(&self, value: i32) {
        self.count.store(value, Ordering::Release);
    }

    pub fn is_desynced(&self) -> bool {
        self.flags.load(Ordering::Relaxed) & DESYNC != 0
    }

    pub fn is_draining(&self) -> bool {
        self.flags.load(Ordering::Relaxed) & DRAIN != 0
    }

    /// Callers hold the region table lock.
    pub fn set_flag(&self, flag: u8) {
        self.flags.fetch_or(flag, Ordering::Relaxed);
    }

    /// Callers hold the region table lock.
    pub fn clear_flag(&self, flag: u8) {
        self.flags.fetch_and(!flag, Ordering::Relaxed);
    }
}
