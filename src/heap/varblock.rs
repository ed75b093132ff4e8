//! Variable-size allocation block.
//!
//! One per 512-byte block, laid out as 64 words:
//!
//! ```text
//!   .------------------------------------------------------------.
//!   | slot0 | slot1 |  ...                                       |
//!   |---------------'                                            |
//!   |                     .--------.----------.--------.---------|
//!   |                ...  | slot60 | reserved | bitmap | address |
//!   '------------------------------------------------------------'
//! ```
//!
//! The 61 slots are region boundaries in ascending address order (or
//! inline payloads of up to seven bytes).  A region's size is the
//! difference between consecutive boundaries; the reserved word terminates
//! the last region with either the next allocation block's address or the
//! wilderness boundary.  The bitmap (bits 3..=63, one per slot) marks
//! regions in use; a clear bit over a boundary is a free region.  The
//! final word holds the block's own address, which doubles as the locator
//! tag for the first 512 bytes of the managed area.
//!
//! Every mutation follows the claim protocol: all touched slot bits are
//! flipped to used in a single CAS before any slot word is written, and
//! bits meant to read "free" are cleared only after their words are in
//! place.  A failed CAS restarts from a fresh snapshot.

use super::control::{BLOCK, SlotWord, WORD, decode_slot, inline_tag_word, rotate};
use super::slots;
use crate::sync::AtomicU64;

/// Boundary slots per block (words 0..=60).
pub(crate) const SLOT_COUNT: usize = 61;
const RESERVED_WORD: usize = 61;
const INFO_WORD: usize = 62;
const SELF_WORD: usize = 63;

/// Bitmap bit for slot `idx`; bits 0..=2 are the class discriminator.
#[inline]
const fn slot_bit(idx: usize) -> u32 {
    idx as u32 + 3
}

/// What a placement is carving out of free space.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum Placement {
    /// An ordinary allocated region; the locator reaches it through this
    /// block's tags.
    Region,
    /// A new 512-aligned allocation block; its own final word will be a
    /// valid tag, and the word before it is seeded with its base.
    Block,
}

/// Thin view over a live variable-size block.
#[derive(Clone, Copy)]
pub(crate) struct VarBlock {
    base: usize,
}

impl VarBlock {
    /// # Safety
    /// `base` must be the 512-aligned base of a live, formatted block.
    pub(crate) unsafe fn at(base: usize) -> Self {
        debug_assert!(base % BLOCK == 0);
        Self { base }
    }

    /// Format fresh memory as an empty variable-size block.  No regions,
    /// wilderness starting immediately after the control block.
    ///
    /// # Safety
    /// `base` must be 512-aligned, writable, and unshared until the
    /// returned view is published.
    pub(crate) unsafe fn format(base: usize) -> Self {
        debug_assert!(base % BLOCK == 0);
        for w in 0..INFO_WORD {
            // Safety: exclusive access during formatting.
            unsafe { slots::word_at(base + w * WORD) }.store(0, crate::sync::Ordering::Relaxed);
        }
        let vb = Self { base };
        slots::store_slot(vb.word(RESERVED_WORD), rotate((base + BLOCK) as u64));
        vb.info().store(0, crate::sync::Ordering::Relaxed);
        // Self-pointer last: it is the tag that makes the managed area
        // reachable, so everything above must be in place first.
        slots::store_slot(vb.word(SELF_WORD), base as u64);
        vb
    }

    pub(crate) fn base(&self) -> usize {
        self.base
    }

    #[inline]
    fn word(&self, idx: usize) -> &AtomicU64 {
        debug_assert!(idx < 64);
        // Safety: the block is live for the lifetime of the view.
        unsafe { slots::word_at(self.base + idx * WORD) }
    }

    pub(crate) fn info(&self) -> &AtomicU64 {
        self.word(INFO_WORD)
    }

    /// Address terminating the last region: the wilderness boundary, or
    /// the next allocation block once the zone chained one.
    pub(crate) fn terminal(&self) -> usize {
        match decode_slot(slots::load(self.word(RESERVED_WORD))) {
            SlotWord::Boundary(a) => a,
            _ => unreachable!("reserved word holds no address"),
        }
    }

    /// Swing the reserved word from the wilderness boundary to the next
    /// allocation block's base.  Fails if the wilderness moved meanwhile.
    pub(crate) fn chain_next_block(&self, expected_wilderness: usize, next: usize) -> bool {
        use crate::sync::Ordering;
        self.word(RESERVED_WORD)
            .compare_exchange(
                rotate(expected_wilderness as u64),
                rotate(next as u64),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Boundary address stored in slot `idx`, ignoring inline and empty
    /// slots and claimed-but-unwritten ones.
    fn boundary_at(&self, idx: usize) -> Option<usize> {
        match decode_slot(slots::load(self.word(idx))) {
            SlotWord::Boundary(a) => Some(a),
            _ => None,
        }
    }

    /// End of the region starting at slot `idx`: the next boundary in the
    /// array, or the terminal address.
    pub(crate) fn region_end(&self, idx: usize) -> usize {
        for k in idx + 1..SLOT_COUNT {
            if let Some(a) = self.boundary_at(k) {
                return a;
            }
        }
        self.terminal()
    }

    /// Slot index of the in-use region starting exactly at `p`.
    pub(crate) fn find_region(&self, p: usize) -> Option<usize> {
        let info = slots::load(self.info());
        (0..SLOT_COUNT).find(|&i| {
            info & (1 << slot_bit(i)) != 0 && self.boundary_at(i) == Some(p)
        })
    }

    /// Implicit size of the region at slot `idx`.
    pub(crate) fn region_size(&self, idx: usize) -> usize {
        let start = self.boundary_at(idx).expect("region slot holds no boundary");
        self.region_end(idx) - start
    }

    // -----------------------------------------------------------------
    // Placement
    // -----------------------------------------------------------------

    /// The tag word serving pointers of `a`'s 512-block.
    #[inline]
    fn tag_word_for(a: usize) -> usize {
        (a & !(BLOCK - 1)) - WORD
    }

    /// Resolve a placement start inside free space `[from, ..)`.
    ///
    /// A start whose 512-block tag word is dead (the free space begins at
    /// `mod 512 == 504`, the preserved-tag successor of a spanning region)
    /// advances past the boundary so the tag can be seeded.
    fn valid_start(from: usize, align: usize) -> usize {
        let mut a = (from + align - 1) & !(align - 1);
        if Self::tag_word_for(a) < from && from % BLOCK == BLOCK - WORD {
            // First block of this free space is unlocatable; skip to the
            // boundary, where the preserved tag serves us.
            a = (from + WORD + align - 1) & !(align - 1);
        }
        a
    }

    /// End of a region starting at `a` for a rounded request of `n8`
    /// bytes.  A region that crosses a 512-boundary (or whose tail would
    /// swallow a boundary's tag word) extends to one word short of the
    /// next boundary: the interior tags are dead while the region lives,
    /// so the space after it must begin at `mod 512 == 504` — the
    /// signature [`valid_start`](Self::valid_start) keys on — with one
    /// preserved tag word for whatever follows.
    fn region_extent(a: usize, n8: usize, kind: Placement) -> usize {
        let end = a + n8;
        if kind == Placement::Block {
            // Blocks end in their own metadata word; nothing to preserve.
            return end;
        }
        let crosses = (end - 1) & !(BLOCK - 1) > a & !(BLOCK - 1);
        let m = end % BLOCK;
        if crosses || m > BLOCK - WORD || m == 0 {
            // Round past the end to the next boundary, then step back one
            // word.
            ((end + WORD + BLOCK - 1) & !(BLOCK - 1)) - WORD
        } else {
            end
        }
    }

    /// Seed the locator tag for a region or block placed at `a`, when the
    /// tag word falls inside free space we own (at or past `from`).
    ///
    /// # Safety
    /// Caller must hold the claim covering `[from, ..)` so no region data
    /// lives at the tag word.
    unsafe fn seed_tag(&self, from: usize, a: usize, kind: Placement) {
        let g = Self::tag_word_for(a);
        if g >= from {
            let value = match kind {
                Placement::Region => self.base as u64,
                Placement::Block => a as u64,
            };
            // Safety: `g` is word-aligned free space under our claim.
            slots::store_slot(unsafe { slots::word_at(g) }, value);
        } else if kind == Placement::Block {
            // A block must be locatable from its own tag even when the
            // word precedes the claimed range (it then holds either an
            // info word, already valid, or this manager's address, which
            // must be narrowed to the new block).
            // Safety: tag words outside regions are allocator-owned.
            let w = unsafe { slots::word_at(g) };
            if slots::load(w) & 0xFF == 0 {
                slots::store_slot(w, a as u64);
            }
        }
    }

    /// Carve `n` bytes (aligned to `align`) out of the free region at slot
    /// `idx`.  Returns the placed address, or `None` when the region
    /// cannot satisfy the request or the CAS race was lost (callers
    /// rescan).  New allocation blocks are never carved from regions —
    /// only from the wilderness — so this always places `Placement::Region`.
    pub(crate) fn place_in_region(&self, idx: usize, n: usize, align: usize) -> Option<usize> {
        let kind = Placement::Region;
        let info = slots::load(self.info());
        if info & (1 << slot_bit(idx)) != 0 {
            return None; // no longer free
        }
        let region_start = self.boundary_at(idx)?;
        let region_end_addr = self.region_end(idx);
        let size = region_end_addr.checked_sub(region_start)?;
        if size <= WORD {
            // A lone word is a preserved tag; never hand it out.
            return None;
        }

        let n8 = (n.max(1) + WORD - 1) & !(WORD - 1);
        let start = Self::valid_start(region_start, align);
        let end = Self::region_extent(start, n8, kind);
        if end > region_end_addr {
            return None;
        }

        let leading = start > region_start;
        let trailing = end < region_end_addr;

        // Claim the region's slot plus one empty neighbour per extra
        // boundary, all in a single CAS so no peer sees a partial state.
        let extra = usize::from(leading) + usize::from(trailing);
        if idx + extra >= SLOT_COUNT {
            return None;
        }
        let mut mask = 1u64 << slot_bit(idx);
        for k in 1..=extra {
            if info & (1 << slot_bit(idx + k)) != 0 {
                return None; // neighbour not claimable
            }
            if !matches!(
                decode_slot(slots::load(self.word(idx + k))),
                SlotWord::Empty | SlotWord::Inline(_)
            ) {
                return None; // neighbour is an active boundary
            }
            mask |= 1 << slot_bit(idx + k);
        }

        if slots::try_set_bits(self.info(), info, mask).is_err() {
            return None;
        }

        // Recheck under the claim: the boundary must still be what we
        // measured, and claimed neighbours must still be vacant.
        let ok = self.boundary_at(idx) == Some(region_start)
            && (1..=extra).all(|k| {
                matches!(
                    decode_slot(slots::load(self.word(idx + k))),
                    SlotWord::Empty | SlotWord::Inline(_)
                )
            });
        if !ok {
            slots::clear_bits_spin(self.info(), mask);
            return None;
        }

        // Safety: bits claimed above cover the whole span we write into.
        unsafe { self.seed_tag(region_start, start, kind) };

        // Write boundaries, then release the bits that should read free.
        let mut release = 0u64;
        let mut k = idx;
        if leading {
            // Slot idx keeps the old address as the leading free fragment.
            release |= 1 << slot_bit(k);
            k += 1;
            slots::store_slot(self.word(k), rotate(start as u64));
        }
        if trailing {
            k += 1;
            slots::store_slot(self.word(k), rotate(end as u64));
            release |= 1 << slot_bit(k);
        }
        if release != 0 {
            slots::clear_bits_spin(self.info(), release);
        }
        Some(start)
    }

    /// Carve from the wilderness `[terminal, limit)`.  Only valid on the
    /// zone's tail block, whose reserved word still holds the wilderness
    /// boundary.
    pub(crate) fn place_in_wilderness(
        &self,
        n: usize,
        align: usize,
        limit: usize,
        kind: Placement,
    ) -> Option<usize> {
        use crate::sync::Ordering;

        let info = slots::load(self.info());
        let wilderness = self.terminal();
        if wilderness >= limit {
            return None;
        }
        let n8 = (n.max(1) + WORD - 1) & !(WORD - 1);
        let start = Self::valid_start(wilderness, align);
        let end = Self::region_extent(start, n8, kind);
        if end > limit {
            return None;
        }

        let leading = start > wilderness;

        // New boundaries append after the last active slot, two indices
        // apart: the empty slot behind each boundary is what a later
        // region split writes its new boundary into (index order must
        // keep matching address order, so the gap has to pre-exist).
        let tail = (0..SLOT_COUNT)
            .rev()
            .find(|&i| self.boundary_at(i).is_some())
            .map_or(0, |i| i + 2);
        let needed = 1 + usize::from(leading);
        if tail + (needed - 1) * 2 >= SLOT_COUNT {
            return None; // slot array exhausted; caller chains a new block
        }
        let mut mask = 0u64;
        for k in 0..needed {
            let i = tail + 2 * k;
            if info & (1 << slot_bit(i)) != 0 {
                return None;
            }
            if !matches!(
                decode_slot(slots::load(self.word(i))),
                SlotWord::Empty | SlotWord::Inline(_)
            ) {
                return None;
            }
            mask |= 1 << slot_bit(i);
        }

        if slots::try_set_bits(self.info(), info, mask).is_err() {
            return None;
        }

        // The reserved word is the true arbiter: advance it before any
        // boundary becomes visible.  Loss means another thread consumed
        // the wilderness first; roll the claim back and let them win.
        if self
            .word(RESERVED_WORD)
            .compare_exchange(
                rotate(wilderness as u64),
                rotate(end as u64),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            slots::clear_bits_spin(self.info(), mask);
            return None;
        }

        // Safety: everything in [wilderness, end) is virgin space below
        // the new boundary we now own.
        unsafe { self.seed_tag(wilderness, start, kind) };

        let mut release = 0u64;
        if leading {
            slots::store_slot(self.word(tail), rotate(wilderness as u64));
            release |= 1 << slot_bit(tail);
            slots::store_slot(self.word(tail + 2), rotate(start as u64));
        } else {
            slots::store_slot(self.word(tail), rotate(start as u64));
        }
        if release != 0 {
            slots::clear_bits_spin(self.info(), release);
        }
        Some(start)
    }

    // -----------------------------------------------------------------
    // Release
    // -----------------------------------------------------------------

    /// One attempt to mark the region at slot `idx` free.  Loss routes the
    /// caller to its hoard.
    pub(crate) fn try_release(&self, idx: usize) -> Result<(), ()> {
        let info = slots::load(self.info());
        debug_assert!(info & (1 << slot_bit(idx)) != 0, "double free of V region");
        match slots::try_clear_bit(self.info(), info, slot_bit(idx)) {
            Ok(_) => Ok(()),
            Err(_) => Err(()),
        }
    }

    /// Release unconditionally.  Termination per the bit-ownership rule.
    pub(crate) fn release_spin(&self, idx: usize) {
        slots::clear_bit_spin(self.info(), slot_bit(idx));
    }

    /// Opportunistic coalescing after slot `idx` went free: erase the next
    /// free boundary so the two regions read as one, then try the same
    /// backwards (erasing `idx` itself when its predecessor is free).
    /// Every step is best-effort; a lost CAS abandons the attempt.
    pub(crate) fn coalesce(&self, idx: usize) {
        self.try_erase_following(idx);
        // Predecessor: the nearest lower active boundary.
        let info = slots::load(self.info());
        if let Some(prev) = (0..idx).rev().find(|&i| self.boundary_at(i).is_some()) {
            if info & (1 << slot_bit(prev)) == 0 {
                self.try_erase(idx);
            }
        }
    }

    fn try_erase_following(&self, idx: usize) {
        if let Some(next) = (idx + 1..SLOT_COUNT).find(|&i| self.boundary_at(i).is_some()) {
            let info = slots::load(self.info());
            if info & (1 << slot_bit(next)) == 0 && next + 1 < SLOT_COUNT {
                // Never erase the last boundary before the terminal: the
                // wilderness must stay delimited.
                if (next + 1..SLOT_COUNT).any(|i| self.boundary_at(i).is_some()) {
                    self.try_erase(next);
                }
            }
        }
    }

    /// Remove the boundary of a region we hold (bit set): blank the word,
    /// then release the bit.  Used when carved space stops being a region
    /// and becomes a chained allocation block.
    pub(crate) fn dissolve_region(&self, idx: usize) {
        let info = slots::load(self.info());
        debug_assert!(info & (1 << slot_bit(idx)) != 0, "dissolving an unheld region");
        slots::store_slot(self.word(idx), 0);
        slots::clear_bit_spin(self.info(), slot_bit(idx));
    }

    /// Erase a free boundary slot: claim it, blank the word, release the
    /// bit.  The claim keeps the no-mutation-while-free rule intact.
    fn try_erase(&self, idx: usize) {
        let info = slots::load(self.info());
        let bit = slot_bit(idx);
        if info & (1 << bit) != 0 {
            return;
        }
        if slots::try_set_bit(self.info(), info, bit).is_err() {
            return;
        }
        slots::store_slot(self.word(idx), 0);
        slots::clear_bit_spin(self.info(), bit);
    }

    // -----------------------------------------------------------------
    // Inline slots (requests of up to seven bytes)
    // -----------------------------------------------------------------

    /// Allocate `len` bytes directly inside a slot word.  Searched from
    /// the top of the array down, away from the boundary slots.
    pub(crate) fn alloc_inline(&self, len: u8) -> Option<usize> {
        debug_assert!(len >= 1 && len <= 7);
        let info = slots::load(self.info());
        for idx in (0..SLOT_COUNT).rev() {
            let bit = slot_bit(idx);
            if info & (1 << bit) != 0 {
                continue;
            }
            if !matches!(
                decode_slot(slots::load(self.word(idx))),
                SlotWord::Empty | SlotWord::Inline(_)
            ) {
                continue;
            }
            if slots::try_set_bit(self.info(), info, bit).is_err() {
                return None; // snapshot went stale; caller rescans
            }
            // Recheck under the claim.
            if !matches!(
                decode_slot(slots::load(self.word(idx))),
                SlotWord::Empty | SlotWord::Inline(_)
            ) {
                slots::clear_bit_spin(self.info(), bit);
                return None;
            }
            slots::store_slot(self.word(idx), inline_tag_word(len));
            return Some(self.base + idx * WORD);
        }
        None
    }

    /// Whether `p` addresses an inline slot of this block, and its length.
    pub(crate) fn inline_len(&self, p: usize) -> Option<u8> {
        if p < self.base || p >= self.base + RESERVED_WORD * WORD || (p - self.base) % WORD != 0 {
            return None;
        }
        let idx = (p - self.base) / WORD;
        match decode_slot(slots::load(self.word(idx))) {
            SlotWord::Inline(len) => Some(len),
            _ => None,
        }
    }

    /// Free an inline slot.  Inline payloads are smaller than a pointer,
    /// so they never hoard; the clear spins until it lands.
    pub(crate) fn free_inline(&self, p: usize) {
        let idx = (p - self.base) / WORD;
        debug_assert!(self.inline_len(p).is_some(), "not an inline slot: {p:#x}");
        slots::clear_bit_spin(self.info(), slot_bit(idx));
    }

    /// Whether the slot array is too full for new boundaries.  The margin
    /// keeps enough indices for one more two-boundary placement — the
    /// successor-block carve itself needs them.
    pub(crate) fn exhausted(&self) -> bool {
        let tail = (0..SLOT_COUNT)
            .rev()
            .find(|&i| self.boundary_at(i).is_some())
            .map_or(0, |i| i + 2);
        tail + 4 >= SLOT_COUNT
    }

    /// Free-region candidates: `(idx, start, size)` for every clear-bit
    /// boundary, snapshot semantics.
    pub(crate) fn free_regions(&self) -> impl Iterator<Item = (usize, usize, usize)> + '_ {
        let info = slots::load(self.info());
        (0..SLOT_COUNT).filter_map(move |idx| {
            if info & (1 << slot_bit(idx)) != 0 {
                return None;
            }
            let start = self.boundary_at(idx)?;
            let end = self.region_end(idx);
            Some((idx, start, end - start))
        })
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::heap::control::LITTLE_ENDIAN;

    /// A zone-shaped scratch buffer: control block plus managed area.
    struct TestArea {
        ptr: *mut u8,
        layout: std::alloc::Layout,
    }

    impl TestArea {
        fn new(blocks: usize) -> Self {
            let layout = std::alloc::Layout::from_size_align(blocks * BLOCK, BLOCK).unwrap();
            // Safety: non-zero size.
            let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
            assert!(!ptr.is_null());
            Self { ptr, layout }
        }

        fn base(&self) -> usize {
            self.ptr as usize
        }

        fn limit(&self) -> usize {
            self.base() + self.layout.size()
        }
    }

    impl Drop for TestArea {
        fn drop(&mut self) {
            // Safety: allocated with the same layout.
            unsafe { std::alloc::dealloc(self.ptr, self.layout) };
        }
    }

    fn fresh_block(area: &TestArea) -> VarBlock {
        // Safety: the buffer is aligned, zeroed and exclusively owned.
        unsafe { VarBlock::format(area.base()) }
    }

    #[test]
    fn test_format_shape() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let area = TestArea::new(4);
        let vb = fresh_block(&area);
        assert_eq!(vb.terminal(), area.base() + BLOCK);
        assert_eq!(slots::load(vb.info()), 0);
        // Self-pointer is a plain address: whole low byte zero.
        // Safety: block is live.
        let self_word = slots::load(unsafe { slots::word_at(area.base() + BLOCK - WORD) });
        assert_eq!(self_word, area.base() as u64);
    }

    #[test]
    fn test_wilderness_alloc_and_size() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let area = TestArea::new(8);
        let vb = fresh_block(&area);

        let p = vb
            .place_in_wilderness(40, 8, area.limit(), Placement::Region)
            .unwrap();
        assert_eq!(p, area.base() + BLOCK);
        assert_eq!(vb.terminal(), p + 40);

        let idx = vb.find_region(p).unwrap();
        assert_eq!(vb.region_size(idx), 40);

        // Second carve continues at the boundary.
        let q = vb
            .place_in_wilderness(16, 8, area.limit(), Placement::Region)
            .unwrap();
        assert_eq!(q, p + 40);
        assert_eq!(vb.region_size(vb.find_region(q).unwrap()), 16);
    }

    #[test]
    fn test_wilderness_alignment_leaves_free_fragment() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let area = TestArea::new(8);
        let vb = fresh_block(&area);

        // Nudge the wilderness off the 256-byte grid first.
        let first = vb
            .place_in_wilderness(8, 8, area.limit(), Placement::Region)
            .unwrap();
        let p = vb
            .place_in_wilderness(32, 256, area.limit(), Placement::Region)
            .unwrap();
        assert_eq!(p % 256, 0);
        assert!(p > first + 8);

        // The gap before the aligned start is a free region.
        let (_, start, size) = vb.free_regions().next().unwrap();
        assert_eq!(start, first + 8);
        assert_eq!(size, p - start);
    }

    #[test]
    fn test_trim_splits_free_region() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        // Free [A, A+80) followed by used [A+80, A+160): a 40-byte
        // request rewrites the free run to [A+40, A+80) and a used region
        // at A appears.
        let area = TestArea::new(8);
        let vb = fresh_block(&area);
        let a = vb
            .place_in_wilderness(80, 8, area.limit(), Placement::Region)
            .unwrap();
        let used = vb
            .place_in_wilderness(80, 8, area.limit(), Placement::Region)
            .unwrap();
        assert_eq!(used, a + 80);
        let idx = vb.find_region(a).unwrap();
        vb.release_spin(idx);

        let p = vb.place_in_region(idx, 40, 8).unwrap();
        assert_eq!(p, a);

        let info = slots::load(vb.info());
        // Bit for A is used again.
        assert!(info & (1 << slot_bit(idx)) != 0);
        // The successor boundary A+40 exists and reads free.
        let succ = vb.find_region(a).map(|i| vb.region_size(i));
        assert_eq!(succ, Some(40));
        let frees: Vec<_> = vb.free_regions().collect();
        assert!(frees.iter().any(|&(_, s, n)| s == a + 40 && n == 40));
    }

    #[test]
    fn test_whole_region_reuse_without_neighbor() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let area = TestArea::new(8);
        let vb = fresh_block(&area);
        let a = vb
            .place_in_wilderness(48, 8, area.limit(), Placement::Region)
            .unwrap();
        let b = vb
            .place_in_wilderness(48, 8, area.limit(), Placement::Region)
            .unwrap();
        let idx = vb.find_region(a).unwrap();
        vb.release_spin(idx);

        // Exact refit: no extra slots claimed, same address returned.
        let p = vb.place_in_region(idx, 48, 8).unwrap();
        assert_eq!(p, a);
        assert_eq!(vb.region_size(vb.find_region(p).unwrap()), 48);
        // Untouched neighbour.
        assert_eq!(vb.region_size(vb.find_region(b).unwrap()), 48);
    }

    #[test]
    fn test_release_and_coalesce() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let area = TestArea::new(8);
        let vb = fresh_block(&area);
        let a = vb
            .place_in_wilderness(32, 8, area.limit(), Placement::Region)
            .unwrap();
        let b = vb
            .place_in_wilderness(32, 8, area.limit(), Placement::Region)
            .unwrap();
        let _c = vb
            .place_in_wilderness(32, 8, area.limit(), Placement::Region)
            .unwrap();

        let ia = vb.find_region(a).unwrap();
        let ib = vb.find_region(b).unwrap();
        vb.release_spin(ia);
        vb.coalesce(ia);
        vb.release_spin(ib);
        vb.coalesce(ib);

        // The two free neighbours merged: one free region of 64 bytes.
        let frees: Vec<_> = vb.free_regions().collect();
        assert_eq!(frees.len(), 1);
        assert_eq!(frees[0].1, a);
        assert_eq!(frees[0].2, 64);
    }

    #[test]
    fn test_inline_round_trip() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let area = TestArea::new(2);
        let vb = fresh_block(&area);

        let p = vb.alloc_inline(5).unwrap();
        assert!(p >= area.base() && p < area.base() + BLOCK - 3 * WORD);
        assert_eq!(vb.inline_len(p), Some(5));

        // The payload bytes never overlap the tag byte.
        // Safety: p addresses a live slot word; bytes 0..7 are payload.
        unsafe {
            for i in 0..5 {
                *(p as *mut u8).add(i) = 0xA0 + i as u8;
            }
        }
        assert_eq!(vb.inline_len(p), Some(5));
        if LITTLE_ENDIAN {
            // Safety: reading back test bytes.
            unsafe {
                assert_eq!(*(p as *const u8), 0xA0);
            }
        }

        vb.free_inline(p);
        let info = slots::load(vb.info());
        assert_eq!(info & (1 << slot_bit((p - area.base()) / WORD)), 0);
    }

    #[test]
    fn test_spanning_region_preserves_next_tag() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let area = TestArea::new(16);
        let vb = fresh_block(&area);

        // Spans two boundaries; the extent must stop one word short of a
        // boundary so the following space keeps a locator tag.
        let p = vb
            .place_in_wilderness(1000, 8, area.limit(), Placement::Region)
            .unwrap();
        let idx = vb.find_region(p).unwrap();
        let end = p + vb.region_size(idx);
        assert_eq!(end % BLOCK, BLOCK - WORD);
        assert!(vb.region_size(idx) >= 1000);

        // A follow-up placement skips the preserved tag word, seeds it
        // with the manager's address, and stays locatable.
        let q = vb
            .place_in_wilderness(24, 8, area.limit(), Placement::Region)
            .unwrap();
        assert_eq!(q % BLOCK, 0);
        assert_eq!(q, end + WORD);
        // Safety: the tag word is allocator-owned.
        let tag = slots::load(unsafe { slots::word_at(end) });
        assert_eq!(tag, vb.base() as u64);
        // Safety: q is in the live managed area.
        assert_eq!(unsafe { crate::heap::locate::locate(q) }, vb.base());
    }

    #[test]
    fn test_block_carve_is_exact_and_tagged() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let area = TestArea::new(8);
        let vb = fresh_block(&area);

        let p = vb
            .place_in_wilderness(BLOCK, BLOCK, area.limit(), Placement::Block)
            .unwrap();
        assert_eq!(p % BLOCK, 0);
        let idx = vb.find_region(p).unwrap();
        assert_eq!(vb.region_size(idx), BLOCK);

        // The word before the carved block names the block itself.
        // Safety: tag word is allocator-owned.
        let tag = slots::load(unsafe { slots::word_at(p - WORD) });
        assert_eq!(tag, p as u64);
    }

    #[test]
    fn test_chain_next_block() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let area = TestArea::new(8);
        let vb = fresh_block(&area);
        let w = vb.terminal();
        let next = area.base() + 4 * BLOCK;
        assert!(vb.chain_next_block(w, next));
        assert_eq!(vb.terminal(), next);
        // Stale expectation loses.
        assert!(!vb.chain_next_block(w, next));
    }
}
