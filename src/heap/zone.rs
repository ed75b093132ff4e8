//! Allocation zones and the master-block tree.
//!
//! A zone is a block-aligned region from the pages source, laid out as
//! `[master block][variable block][managed area ...]`.  The master block
//! is bookkeeping only: its slots name the zone's first allocation block
//! and the masters of later zones, forming a tree whose leaves are zones.
//! Allocation descends the tree and walks each zone's block chain; free
//! never touches the tree (the locator is O(1)).
//!
//! Blocks within a zone chain in address order: a fixed-class block is
//! followed immediately by the next block (growth always creates a fixed
//! block together with a trailing variable block, so the invariant holds
//! structurally), and a variable block names its successor in its
//! reserved word once one exists.  Two master blocks are never adjacent:
//! every zone interposes its variable block.

use std::ptr::NonNull;

use super::control::{BLOCK, BlockKind, SlotClass, WORD, classify};
use super::locate;
use super::pages::{HeapError, PageSource, PlatformPages};
use super::slots;
use super::stats;
use super::varblock::VarBlock;
use crate::sync::{AtomicU64, Ordering};

/// Child slots in a master block (words 0..=61).  Slot 0 always names the
/// zone's own first allocation block; the rest hold child masters.
pub(crate) const MASTER_CHILDREN: usize = 62;
const MASTER_SPARE_WORD: usize = 62; // zone end address
const MASTER_INFO_WORD: usize = 63;

/// Bitmap bit for master child slot `idx`.  Bit 0 is constantly 1: it is
/// the "first bitmap bit" of every master, and it keeps the final word's
/// low byte non-zero for the locator of the following block.
#[inline]
const fn child_bit(idx: usize) -> u32 {
    idx as u32 + 1
}

/// View over a live master block.
#[derive(Clone, Copy)]
pub(crate) struct MasterBlock {
    base: usize,
}

impl MasterBlock {
    /// # Safety
    /// `base` must be the 512-aligned base of a live master block.
    pub(crate) unsafe fn at(base: usize) -> Self {
        debug_assert!(base % BLOCK == 0);
        Self { base }
    }

    /// Format fresh zone memory as a master block for a zone ending at
    /// `zone_end`.  Slot 0 is pre-linked to the first allocation block.
    ///
    /// # Safety
    /// `base` must be 512-aligned, writable and unshared until published.
    pub(crate) unsafe fn format(base: usize, zone_end: usize) -> Self {
        debug_assert!(base % BLOCK == 0);
        let m = Self { base };
        for idx in 1..MASTER_CHILDREN {
            m.word(idx).store(0, Ordering::Relaxed);
        }
        m.word(0).store((base + BLOCK) as u64, Ordering::Relaxed);
        m.word(MASTER_SPARE_WORD).store(zone_end as u64, Ordering::Relaxed);
        // Bit 0 constant, bit 1 covering the pre-linked slot 0.  Trailing
        // zero bits are unmanaged slots.
        m.info().store(0b11, Ordering::Release);
        m
    }

    #[inline]
    fn word(&self, idx: usize) -> &AtomicU64 {
        debug_assert!(idx < 64);
        // Safety: the block is live for the lifetime of the view.
        unsafe { slots::word_at(self.base + idx * WORD) }
    }

    fn info(&self) -> &AtomicU64 {
        self.word(MASTER_INFO_WORD)
    }

    /// End address of this master's zone.
    pub(crate) fn zone_end(&self) -> usize {
        slots::load(self.word(MASTER_SPARE_WORD)) as usize
    }

    /// First allocation block of this master's zone.
    pub(crate) fn first_block(&self) -> usize {
        slots::load(self.word(0)) as usize
    }

    /// Link a child master.  Claims a slot bit before storing the address
    /// so readers never see a half-installed entry; once stored, tree
    /// pointers are immutable.
    pub(crate) fn add_child(&self, child: usize) -> bool {
        debug_assert!(child % BLOCK == 0 && child != 0);
        loop {
            let info = slots::load(self.info());
            let free = !info & (((1u64 << (MASTER_CHILDREN - 1)) - 1) << 2);
            if free == 0 {
                return false;
            }
            let bit = free.trailing_zeros();
            if slots::try_set_bit(self.info(), info, bit).is_ok() {
                slots::store_slot(self.word((bit - 1) as usize), child as u64);
                return true;
            }
        }
    }

    /// Installed child masters (slot 0 excluded).
    pub(crate) fn children(&self) -> impl Iterator<Item = usize> + '_ {
        let info = slots::load(self.info());
        (1..MASTER_CHILDREN).filter_map(move |idx| {
            if info & (1 << child_bit(idx)) == 0 {
                return None;
            }
            let w = slots::load(self.word(idx));
            if w == 0 { None } else { Some(w as usize) }
        })
    }
}

// ---------------------------------------------------------------------------
// Fixed-class block formatting and slot claims
// ---------------------------------------------------------------------------

/// Sub-block layout per class for a freshly formatted 512-byte block,
/// low-to-high.  Layouts tile the block exactly, so the final sub-block's
/// info word is the block's final word.
fn chain_layout(class: SlotClass) -> &'static [SlotClass] {
    use SlotClass::*;
    match class {
        // 64 one-word sub-blocks.
        C0 => &[C0; 64],
        // One word of 1-byte slots, then the big 8-byte sub-block.
        C1 => &[C0, C1],
        // Two words of 1-byte slots, then two 4-byte sub-blocks.
        C2 => &[C0, C0, C2, C2],
        // Four 2-byte sub-blocks.
        C3 => &[C3, C3, C3, C3],
    }
}

/// Format virgin memory at `base` as a chain of fixed-class sub-blocks
/// biased towards `class`.
///
/// # Safety
/// `base` must be 512-aligned, zeroed, writable, and unshared until the
/// block is published into a chain.
pub(crate) unsafe fn format_fixed_block(base: usize, class: SlotClass) {
    debug_assert!(base % BLOCK == 0);
    let mut at = base;
    for &sub in chain_layout(class) {
        let bm = at + sub.sub_block_bytes() - WORD;
        // Safety: in-bounds of the unshared block.
        unsafe { slots::word_at(bm) }.store(sub.info_template(), Ordering::Release);
        at += sub.sub_block_bytes();
    }
    debug_assert_eq!(at, base + BLOCK);
}

/// Sub-block info words of the fixed-class block at `base`, walked from
/// its final word downwards: `(info_word_address, class)`.
///
/// # Safety
/// `base` must be the base of a live fixed-class block.
pub(crate) unsafe fn fixed_sub_blocks(base: usize) -> impl Iterator<Item = (usize, SlotClass)> {
    let mut bm = Some(base + BLOCK - WORD);
    std::iter::from_fn(move || {
        let at = bm?;
        // Safety: `at` is a word inside the live block.
        let info = slots::load(unsafe { slots::word_at(at) });
        let class = match classify(info) {
            Some(BlockKind::Fixed(c)) => c,
            _ => {
                bm = None;
                return None;
            }
        };
        let next = at.checked_sub(class.sub_block_bytes()).filter(|&n| n >= base);
        bm = next;
        Some((at, class))
    })
}

/// Try to claim one `class` slot anywhere in the fixed block at `base`.
/// A lost CAS moves on to the next sub-block rather than retrying the
/// same word: locality matters, fairness does not.
///
/// # Safety
/// `base` must be the base of a live fixed-class block.
pub(crate) unsafe fn claim_in_fixed_block(base: usize, class: SlotClass) -> Option<usize> {
    // Safety: forwarded contract.
    for (bm, sub_class) in unsafe { fixed_sub_blocks(base) } {
        if sub_class != class {
            continue;
        }
        // Safety: bm is a live info word.
        let word = unsafe { slots::word_at(bm) };
        let info = slots::load(word);
        if let Some(bit) = super::control::find_free_bit(class, info) {
            match slots::try_set_bit(word, info, bit) {
                Ok(_) => return Some(super::control::slot_address(class, bm, bit)),
                Err(_) => {
                    stats::ALLOC_CAS_RETRIES.add(1);
                    continue;
                }
            }
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Zone lifecycle and block chain
// ---------------------------------------------------------------------------

/// An acquired zone.  Dropping releases the pages.
pub(crate) struct Zone {
    base: usize,
    bytes: usize,
}

// Safety: Zone owns its memory region; raw addresses are plain numbers.
unsafe impl Send for Zone {}

impl Zone {
    /// Acquire and format a fresh zone: master block, then an empty
    /// variable block owning everything after it.
    pub(crate) fn create(bytes: usize) -> Result<Zone, HeapError> {
        debug_assert!(bytes % BLOCK == 0 && bytes >= 3 * BLOCK);
        // Safety: FFI acquisition; released in Drop.
        let base = match unsafe { PlatformPages::acquire(bytes, BLOCK) } {
            Ok(p) => p.as_ptr() as usize,
            // The only error alloc() surfaces is out-of-memory.
            Err(HeapError::AcquireFailed(_)) => return Err(HeapError::OutOfMemory),
            Err(e) => return Err(e),
        };
        stats::TOTAL_ACQUIRED.add(bytes);
        stats::ZONES_LIVE.add(1);

        // Safety: freshly acquired, zeroed, unshared memory.
        unsafe {
            MasterBlock::format(base, base + bytes);
            VarBlock::format(base + BLOCK);
        }
        Ok(Zone { base, bytes })
    }

    pub(crate) fn base(&self) -> usize {
        self.base
    }

    pub(crate) fn end(&self) -> usize {
        self.base + self.bytes
    }

    pub(crate) fn master(&self) -> MasterBlock {
        // Safety: the master block lives at the zone base.
        unsafe { MasterBlock::at(self.base) }
    }
}

impl Drop for Zone {
    fn drop(&mut self) {
        // Safety: acquired in `create` with the same byte count.
        let _ = unsafe {
            PlatformPages::release(NonNull::new(self.base as *mut u8).unwrap(), self.bytes)
        };
        stats::TOTAL_ACQUIRED.sub(self.bytes);
        stats::ZONES_LIVE.sub(1);
    }
}

/// Successor of `block` in its zone's chain, or `None` for the tail.
///
/// A fixed block's successor follows immediately (growth creates fixed
/// blocks paired with a trailing variable block, so one always exists).
/// A variable block's reserved word is a successor only once it names a
/// formatted block: a block-aligned address whose final word is non-zero.
/// The wilderness boundary never qualifies — it is block-aligned only
/// while the word at that position is still virgin zero.
///
/// # Safety
/// `block` must be a live allocation block inside a live zone.
pub(crate) unsafe fn next_block(block: usize) -> Option<usize> {
    // Safety: forwarded contract.
    match unsafe { locate::kind_of_block(block) } {
        BlockKind::Fixed(_) => Some(block + BLOCK),
        BlockKind::Variable => {
            // Safety: forwarded contract.
            let vb = unsafe { VarBlock::at(block) };
            let r = vb.terminal();
            if r % BLOCK != 0 {
                return None;
            }
            // Safety: r is within the zone (a wilderness boundary or a
            // published block base).
            let final_word = slots::load(unsafe { slots::word_at(r + BLOCK - WORD) });
            if final_word == 0 { None } else { Some(r) }
        }
    }
}

/// The zone's tail variable block: the last block of the chain.
///
/// # Safety
/// `first` must be a live allocation block of a live zone.
pub(crate) unsafe fn tail_var_block(first: usize) -> Option<VarBlock> {
    let mut block = first;
    // Chains are short (they grow one pair at a time), but stay defensive
    // against metadata corruption: a zone holds at most bytes/512 blocks.
    for _ in 0..(1 << 20) {
        // Safety: forwarded contract.
        match unsafe { next_block(block) } {
            Some(n) => block = n,
            None => {
                // Safety: the tail is always a variable block.
                return match unsafe { locate::kind_of_block(block) } {
                    // Safety: just classified.
                    BlockKind::Variable => Some(unsafe { VarBlock::at(block) }),
                    BlockKind::Fixed(_) => None,
                };
            }
        }
    }
    None
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::heap::control::{bit_index, find_free_bit};

    #[test]
    fn test_zone_create_shape() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let zone = Zone::create(64 * BLOCK).unwrap();
        let m = zone.master();
        assert_eq!(m.zone_end(), zone.end());
        assert_eq!(m.first_block(), zone.base() + BLOCK);
        assert_eq!(m.children().count(), 0);

        // Master info: constant bit 0 plus the slot-0 bit.
        // Safety: master block is live.
        let info = slots::load(unsafe { slots::word_at(zone.base() + BLOCK - WORD) });
        assert_eq!(info, 0b11);

        // The first allocation block is an empty variable block whose
        // self-pointer makes the managed area locatable.
        // Safety: block is live.
        assert_eq!(
            unsafe { locate::kind_of_block(zone.base() + BLOCK) },
            BlockKind::Variable
        );
    }

    #[test]
    fn test_master_children_round_trip() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let zone = Zone::create(16 * BLOCK).unwrap();
        let other = Zone::create(16 * BLOCK).unwrap();
        let m = zone.master();

        assert!(m.add_child(other.base()));
        let children: Vec<_> = m.children().collect();
        assert_eq!(children, vec![other.base()]);
    }

    #[test]
    fn test_format_fixed_block_tiles_exactly() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        for class in [SlotClass::C0, SlotClass::C1, SlotClass::C2, SlotClass::C3] {
            let total: usize = chain_layout(class)
                .iter()
                .map(|c| c.sub_block_bytes())
                .sum();
            assert_eq!(total, BLOCK, "layout for {class:?} does not tile");
        }
    }

    #[test]
    fn test_fixed_block_walk_and_claim() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let zone = Zone::create(16 * BLOCK).unwrap();
        // Borrow a virgin block from the zone's far end for formatting.
        let base = zone.end() - 4 * BLOCK;
        // Safety: virgin zone memory, unshared in this test.
        unsafe { format_fixed_block(base, SlotClass::C2) };

        // Safety: block formatted above.
        let subs: Vec<_> = unsafe { fixed_sub_blocks(base) }.collect();
        assert_eq!(subs.len(), 4);
        assert_eq!(subs[0], (base + BLOCK - WORD, SlotClass::C2));
        assert_eq!(subs[1].1, SlotClass::C2);
        assert_eq!(subs[2].1, SlotClass::C0);
        assert_eq!(subs[3], (base, SlotClass::C0));

        // Claim a 4-byte slot and verify the bit maps back to it.
        // Safety: block formatted above.
        let p = unsafe { claim_in_fixed_block(base, SlotClass::C2) }.unwrap();
        let (bm, class) = unsafe { locate::find_sub_block(base, p) }.unwrap();
        assert_eq!(class, SlotClass::C2);
        let bit = bit_index(class, bm, p);
        // Safety: live info word.
        let info = slots::load(unsafe { slots::word_at(bm) });
        assert!(info & (1 << bit) != 0);
        assert_ne!(find_free_bit(class, info), Some(bit));
    }

    #[test]
    fn test_fixed_block_claims_exhaust() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let zone = Zone::create(16 * BLOCK).unwrap();
        let base = zone.end() - 2 * BLOCK;
        // Safety: virgin zone memory, unshared in this test.
        unsafe { format_fixed_block(base, SlotClass::C3) };

        // Four sub-blocks of sixty 2-byte slots each.
        let mut seen = std::collections::HashSet::new();
        for _ in 0..240 {
            // Safety: block formatted above.
            let p = unsafe { claim_in_fixed_block(base, SlotClass::C3) }.unwrap();
            assert!(seen.insert(p), "duplicate slot {p:#x}");
            assert_eq!(p % 2, 0);
        }
        // Safety: block formatted above.
        assert!(unsafe { claim_in_fixed_block(base, SlotClass::C3) }.is_none());
    }

    #[test]
    fn test_next_block_chain() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let zone = Zone::create(64 * BLOCK).unwrap();
        let v0 = zone.base() + BLOCK;

        // Fresh zone: single-block chain.
        // Safety: blocks are live.
        unsafe {
            assert_eq!(next_block(v0), None);
            let tail = tail_var_block(v0).unwrap();
            assert_eq!(tail.base(), v0);
        }
    }
}
