//! Atomic slot-state transitions.
//!
//! A word-width compare-and-set is the only cross-thread coordination on
//! the hot path.  A slot becomes visible to peers as allocated only after
//! a successful 0→1 CAS of its bitmap bit, and free only after a 1→0 CAS.
//! No operation reads or mutates a slot whose bit it has not set; an
//! operation touching several slots flips all of their bits to used in one
//! CAS before writing any slot value.
//!
//! Every function here takes one CAS *attempt* against an observed value,
//! except the `_spin` variants, whose termination follows from bit
//! ownership: no peer attempts the same transition on a bit we hold.

use crate::sync::{AtomicU64, Ordering};
use crate::sync::spin_loop;

/// View a raw metadata word as an atomic.
///
/// # Safety
/// `addr` must be 8-aligned and point into live zone memory for the
/// duration of the borrow.
///
/// Under `cfg(loom)` zone memory cannot hold loom's fat atomic objects, so
/// only the `&AtomicU64`-taking entry points below are exercised by the
/// loom models; this view is never produced there.
#[inline]
pub(crate) unsafe fn word_at(addr: usize) -> &'static AtomicU64 {
    debug_assert!(addr % 8 == 0);
    // Safety: upheld by caller.
    unsafe { &*(addr as *const AtomicU64) }
}

/// Acquire-load of a metadata word.
#[inline]
pub(crate) fn load(word: &AtomicU64) -> u64 {
    word.load(Ordering::Acquire)
}

/// One attempt to flip `bit` from 0 to 1 against the `observed` value.
///
/// Returns the updated word, or the current value on CAS loss.
#[inline]
pub(crate) fn try_set_bit(word: &AtomicU64, observed: u64, bit: u32) -> Result<u64, u64> {
    debug_assert!(observed & (1 << bit) == 0, "bit {bit} already set");
    try_set_bits(word, observed, 1 << bit)
}

/// One attempt to flip every bit in `mask` from 0 to 1.  This is the
/// multi-slot claim: peers can never observe a partially claimed group.
#[inline]
pub(crate) fn try_set_bits(word: &AtomicU64, observed: u64, mask: u64) -> Result<u64, u64> {
    debug_assert!(observed & mask == 0, "claim mask overlaps set bits");
    word.compare_exchange(observed, observed | mask, Ordering::AcqRel, Ordering::Acquire)
        .map(|_| observed | mask)
}

/// One attempt to flip `bit` from 1 to 0 against the `observed` value.
#[inline]
pub(crate) fn try_clear_bit(word: &AtomicU64, observed: u64, bit: u32) -> Result<u64, u64> {
    debug_assert!(observed & (1 << bit) != 0, "bit {bit} already clear");
    word.compare_exchange(
        observed,
        observed & !(1 << bit),
        Ordering::AcqRel,
        Ordering::Acquire,
    )
    .map(|_| observed & !(1 << bit))
}

/// Clear `bit` unconditionally, retrying until the CAS lands.
///
/// Only the owner of a set bit may call this; every CAS failure is caused
/// by peers transitioning *other* bits in the word, so the loop is bounded
/// in practice and cannot livelock on this bit.
pub(crate) fn clear_bit_spin(word: &AtomicU64, bit: u32) -> u64 {
    clear_bits_spin(word, 1 << bit)
}

/// Clear every bit in `mask`, retrying until the CAS lands.  Used both for
/// frees that must not fail and for rolling back a multi-slot claim.
pub(crate) fn clear_bits_spin(word: &AtomicU64, mask: u64) -> u64 {
    loop {
        let b = word.load(Ordering::Acquire);
        debug_assert!(b & mask == mask, "clearing bits we do not hold");
        match word.compare_exchange_weak(b, b & !mask, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => return b & !mask,
            Err(_) => spin_loop(),
        }
    }
}

/// Publish a slot value.  Callers hold the slot's bit (or the slot is
/// otherwise unreachable), so a plain release store suffices.
#[inline]
pub(crate) fn store_slot(word: &AtomicU64, value: u64) {
    word.store(value, Ordering::Release);
}
