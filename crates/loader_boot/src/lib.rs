//! Cross-hart coordination for the boot protocol.
//!
//! There is no OS underneath: the only primitives are a handful of shared
//! words with explicit ordering. Exactly one hart performs setup while the
//! rest spin; the types here pin down the single-writer/multi-reader
//! contracts so the orchestrator cannot get the ordering wrong.

#![no_std]

#[cfg(test)]
extern crate std;

use core::hint::spin_loop;
use core::sync::atomic::{fence, AtomicU64, AtomicUsize, Ordering};

/// The primary-hart claim: unclaimed until the first hart arrives.
///
/// Lives in initialized data (the sentinel is nonzero) so a racing claim
/// is safe even while the winner is still clearing the zero-initialized
/// sections.
pub struct Election(AtomicUsize);

const UNCLAIMED: usize = usize::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HartRole {
    /// This hart won the claim and performs the one-time setup.
    Primary,
    /// Another hart won; wait for it to publish the entry point.
    Secondary,
}

impl Election {
    #[must_use]
    pub const fn new() -> Self {
        Self(AtomicUsize::new(UNCLAIMED))
    }

    /// First caller becomes primary, every later caller secondary.
    pub fn claim(&self, hartid: usize) -> HartRole {
        match self
            .0
            .compare_exchange(UNCLAIMED, hartid, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => HartRole::Primary,
            Err(_) => HartRole::Secondary,
        }
    }

    /// Id of the winning hart, once the claim has happened.
    #[must_use]
    pub fn winner(&self) -> Option<usize> {
        match self.0.load(Ordering::Acquire) {
            UNCLAIMED => None,
            id => Some(id),
        }
    }
}

impl Default for Election {
    fn default() -> Self {
        Self::new()
    }
}

/// The shared entry-point slot: zero until the primary hart publishes the
/// second guest's entry address, then immutable.
///
/// Single writer, single write; every loader-side store sequenced before
/// [`EntryLatch::publish`] is visible to a hart that has returned from
/// [`EntryLatch::wait`]. Waiting never times out: with no scheduler to
/// recover into, a hart that has nothing to run has nowhere else to go.
pub struct EntryLatch(AtomicUsize);

impl EntryLatch {
    #[must_use]
    pub const fn new() -> Self {
        Self(AtomicUsize::new(0))
    }

    /// Publish the entry address and make every prior write visible to the
    /// spinning harts. Must be called at most once, with a nonzero value.
    pub fn publish(&self, entry: usize) {
        debug_assert!(entry != 0);
        debug_assert!(self.0.load(Ordering::Relaxed) == 0);
        self.0.store(entry, Ordering::Release);
        fence(Ordering::SeqCst);
    }

    /// Spin until the entry address is published, re-reading the slot with
    /// acquire ordering on every turn rather than caching a stale value.
    #[must_use]
    pub fn wait(&self) -> usize {
        loop {
            let entry = self.0.load(Ordering::Acquire);
            if entry != 0 {
                return entry;
            }
            spin_loop();
        }
    }

    /// Non-blocking observation.
    #[must_use]
    pub fn get(&self) -> Option<usize> {
        match self.0.load(Ordering::Acquire) {
            0 => None,
            entry => Some(entry),
        }
    }
}

impl Default for EntryLatch {
    fn default() -> Self {
        Self::new()
    }
}

/// Bit-set of harts that must not run a guest, one bit per hart id.
///
/// Written only by the primary hart before it publishes the entry latch;
/// read concurrently afterwards. The latch's fence pair is what makes the
/// plain stores here visible, so relaxed ordering suffices.
pub struct HartMask(AtomicU64);

impl HartMask {
    #[must_use]
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn store(&self, mask: u64) {
        self.0.store(mask, Ordering::Relaxed);
    }

    #[must_use]
    pub fn load(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn contains(&self, hartid: usize) -> bool {
        hartid < u64::BITS as usize && (self.load() >> hartid) & 1 == 1
    }
}

impl Default for HartMask {
    fn default() -> Self {
        Self::new()
    }
}

/// Terminal state of a secondary hart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecondaryFate {
    /// Disabled hart: park forever, never configure protection, never run
    /// a guest.
    Park,
    /// Apply the partition and enter the published guest.
    Enter,
}

/// Decide a secondary hart's fate from the disabled-hart mask. Hart ids
/// past the mask width are never marked disabled.
#[must_use]
pub fn secondary_fate(hartid: usize, disabled_mask: u64) -> SecondaryFate {
    if hartid < u64::BITS as usize && (disabled_mask >> hartid) & 1 == 1 {
        SecondaryFate::Park
    } else {
        SecondaryFate::Enter
    }
}
