//! Pointer → managing-metadata reverse lookup.
//!
//! The word preceding each 512-byte boundary makes the lookup possible.
//! Inside a fixed-class chain that word is the final info word of the
//! block that ends there (non-zero low byte); inside a managed area it
//! holds the plain address of the managing allocation block (addresses are
//! 8-aligned and block-aligned tags end in a zero byte).  Constant time,
//! lock-free, no tree traversal.

use super::control::{BLOCK, BlockKind, SlotClass, WORD, classify};
use super::slots;

/// 512-byte boundary at or below `p`.
#[inline]
pub(crate) fn block_boundary(p: usize) -> usize {
    p & !(BLOCK - 1)
}

/// Base address of the allocation block managing `p`.
///
/// # Safety
/// `p` must lie inside a live allocation zone, past its first block.
pub(crate) unsafe fn locate(p: usize) -> usize {
    let boundary = block_boundary(p);
    // Safety: the word below a boundary inside a zone is always mapped.
    let tag = slots::load(unsafe { slots::word_at(boundary - WORD) });
    if tag & 0xFF != 0 {
        // Preceding block ends in an info word: `p`'s own block carries its
        // metadata at its end.
        boundary
    } else {
        debug_assert!(tag != 0, "untagged boundary below {p:#x}");
        tag as usize
    }
}

/// What the block at `base` contains, judged from its final word.
///
/// A fixed-class chain ends in an info word; a variable-size block ends in
/// its self-pointer (whole low byte zero, being 512-aligned).
///
/// # Safety
/// `base` must be the base of a live allocation block.
pub(crate) unsafe fn kind_of_block(base: usize) -> BlockKind {
    debug_assert!(base % BLOCK == 0);
    // Safety: final word of a live block.
    let w = slots::load(unsafe { slots::word_at(base + BLOCK - WORD) });
    if w & 0xFF == 0 {
        // Usually the self-pointer; a block carved directly after this one
        // may have narrowed it to its own (still block-aligned) base.
        debug_assert!(w as usize % BLOCK == 0, "variable block final word unaligned");
        BlockKind::Variable
    } else {
        match classify(w) {
            Some(BlockKind::Fixed(c)) => BlockKind::Fixed(c),
            _ => unreachable!("info word {w:#x} at {:#x} decodes to no class", base + BLOCK - WORD),
        }
    }
}

/// Walk the fixed-class chain of the block at `base` and find the
/// sub-block owning `p`.  Returns the sub-block's info-word address and
/// class, or `None` when `p` falls below every formatted sub-block.
///
/// Each sub-block consumes at least one word, so the walk is a bounded
/// loop of at most 64 steps; in practice it stops at the first zero word
/// (unformatted space).
///
/// # Safety
/// `base` must be the base of a live block whose final word is a fixed
/// info word; `p` must lie within `[base, base + 512)`.
pub(crate) unsafe fn find_sub_block(base: usize, p: usize) -> Option<(usize, SlotClass)> {
    debug_assert!(p >= base && p < base + BLOCK);
    let mut bm = base + BLOCK - WORD;
    loop {
        // Safety: `bm` stays word-aligned within the live block.
        let info = slots::load(unsafe { slots::word_at(bm) });
        let class = match classify(info) {
            Some(BlockKind::Fixed(c)) => c,
            _ => return None,
        };
        let next = bm - class.sub_block_bytes();
        if p >= next + WORD {
            // Within this sub-block's payload range (for the 1-byte class
            // the payload shares the info word itself).
            return Some((bm, class));
        }
        if next < base + WORD {
            // A sub-block's info word can sit at `base` itself (a 1-byte
            // sub-block occupying word 0), but nothing fits below it.
            if next == base {
                bm = next;
                continue;
            }
            return None;
        }
        bm = next;
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::heap::control::{SlotClass, rotate, unrotate};

    /// 512-aligned scratch buffer for handcrafted block layouts.
    struct AlignedBuf {
        ptr: *mut u8,
        layout: std::alloc::Layout,
    }

    impl AlignedBuf {
        fn new(bytes: usize) -> Self {
            let layout = std::alloc::Layout::from_size_align(bytes, BLOCK).unwrap();
            // Safety: non-zero size.
            let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
            assert!(!ptr.is_null());
            Self { ptr, layout }
        }

        fn addr(&self) -> usize {
            self.ptr as usize
        }

        fn write_word(&self, offset: usize, value: u64) {
            assert!(offset % WORD == 0 && offset + WORD <= self.layout.size());
            // Safety: in-bounds, aligned, exclusively owned.
            unsafe { *(self.ptr.add(offset) as *mut u64) = value };
        }
    }

    impl Drop for AlignedBuf {
        fn drop(&mut self) {
            // Safety: allocated with the same layout.
            unsafe { std::alloc::dealloc(self.ptr, self.layout) };
        }
    }

    #[test]
    fn test_locate_via_stored_address() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        // A managing block's address before the boundary routes every
        // pointer of the next block to it.
        let buf = AlignedBuf::new(2 * BLOCK);
        let x = buf.addr();
        let manager = x + BLOCK;
        buf.write_word(BLOCK - WORD, manager as u64);

        for p in [manager, manager + 1, manager + 300, manager + BLOCK - 1] {
            // Safety: p is inside the live buffer.
            assert_eq!(unsafe { locate(p) }, manager);
        }
    }

    #[test]
    fn test_locate_self_describing() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        // A preceding block ending in an info word (non-zero low byte)
        // means the pointer's own block carries the metadata.
        let buf = AlignedBuf::new(2 * BLOCK);
        let x = buf.addr();
        buf.write_word(BLOCK - WORD, 0x19); // a C0 info word
        for p in [x + BLOCK, x + BLOCK + 42, x + 2 * BLOCK - 1] {
            // Safety: p is inside the live buffer.
            assert_eq!(unsafe { locate(p) }, x + BLOCK);
        }
    }

    #[test]
    fn test_kind_of_block() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let buf = AlignedBuf::new(BLOCK);
        let base = buf.addr();
        buf.write_word(BLOCK - WORD, base as u64); // self-pointer
        // Safety: block is live.
        assert_eq!(unsafe { kind_of_block(base) }, BlockKind::Variable);
        buf.write_word(BLOCK - WORD, SlotClass::C1.info_template());
        // Safety: block is live.
        assert_eq!(
            unsafe { kind_of_block(base) },
            BlockKind::Fixed(SlotClass::C1)
        );
    }

    #[test]
    fn test_walker_c0_and_c1_chain() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        // Low-to-high: one 1-byte sub-block (word 0), then the 8-byte
        // class filling the rest; its info word lands on the block end.
        let buf = AlignedBuf::new(BLOCK);
        let base = buf.addr();
        buf.write_word(0, SlotClass::C0.info_template());
        buf.write_word(BLOCK - WORD, SlotClass::C1.info_template());

        // Safety: block is live and formatted above.
        unsafe {
            let (bm, class) = find_sub_block(base, base + 16).unwrap();
            assert_eq!((bm, class), (base + BLOCK - WORD, SlotClass::C1));
            let (bm, class) = find_sub_block(base, base + 3).unwrap();
            assert_eq!((bm, class), (base, SlotClass::C0));
        }
    }

    #[test]
    fn test_walker_partial_chain() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        // 4-byte class at the top of the block, 2-byte class below it,
        // unformatted space underneath.
        let buf = AlignedBuf::new(BLOCK);
        let base = buf.addr();
        let c2_bm = base + BLOCK - WORD;
        let c3_bm = c2_bm - SlotClass::C2.sub_block_bytes();
        buf.write_word(c2_bm - base, SlotClass::C2.info_template());
        buf.write_word(c3_bm - base, SlotClass::C3.info_template());

        let c2_payload_start = c2_bm - SlotClass::C2.payload_bytes();
        let c3_payload_start = c3_bm - SlotClass::C3.payload_bytes();

        // Safety: block is live and formatted above.
        unsafe {
            assert_eq!(
                find_sub_block(base, c2_payload_start + 4),
                Some((c2_bm, SlotClass::C2))
            );
            assert_eq!(
                find_sub_block(base, c3_payload_start),
                Some((c3_bm, SlotClass::C3))
            );
            // Below the formatted chain: nothing owns the pointer.
            assert_eq!(find_sub_block(base, base + 8), None);
        }
    }

    #[test]
    fn test_rotation_survives_tag_round_trip() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        // A block address parked in a slot word unrotates to itself —
        // locate() depends on boundary tags, this guards the slot form.
        let buf = AlignedBuf::new(BLOCK);
        let addr = buf.addr() as u64;
        assert_eq!(unrotate(rotate(addr)), addr);
    }
}
