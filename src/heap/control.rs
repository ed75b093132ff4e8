//! Control-word format shared by every allocation block.
//!
//! A 512-byte block ends in one or more *info words*.  The low bits of an
//! info word say how the block's data is organised; the remaining bits are
//! a bitmap of slot occupancy:
//!
//! ```text
//!   .----------------------------.-------------------------------.
//!   |   Low bits                 |   Data                        |
//!   |----------------------------|-------------------------------|
//!   |     .......1               |   1-byte slots (7 in-word)    |
//!   |     ......10               |   8-byte slots (62 x 8B)      |
//!   |     ....0100               |   4-byte slots (60 x 4B)      |
//!   |     ....1100               |   2-byte slots (60 x 2B)      |
//!   |     .....000               |   variable-size block         |
//!   '------------------------------------------------------------'
//! ```
//!
//! The patterns are mutually exclusive and exhaustive: bit 0 set is the
//! 1-byte class, else bit 1 set is the 8-byte class, else bit 2 set is a
//! 4- or 2-byte class (bit 3 picks which), else the word belongs to a
//! variable-size block.  The bitmap therefore starts at a different bit per
//! class, and a variable-size block has 61 usable bits.

/// Machine word size.  All block metadata is word-granular.
pub(crate) const WORD: usize = 8;

/// Size and alignment of every allocation block.
pub(crate) const BLOCK: usize = 512;

/// Words per 512-byte block.
pub(crate) const WORDS_PER_BLOCK: usize = BLOCK / WORD; // 64

/// Host byte order, fixed at compile time.  `probe_endianness()` verifies
/// the constant against a runtime store/load in tests.
pub(crate) const LITTLE_ENDIAN: bool = cfg!(target_endian = "little");

/// Byte-order probe: write `1u32`, read its first byte.  The compile-time
/// constant is what gates the rotation paths; this exists so a port to an
/// untested target fails a unit test instead of corrupting slot words.
pub(crate) fn probe_endianness() -> bool {
    let probe: u32 = 1;
    probe.to_ne_bytes()[0] == 1
}

/// Fixed slot classes, ordered by discriminator test priority.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum SlotClass {
    /// 1-byte slots; bitmap and payload share one word.
    C0,
    /// 8-byte slots, 62 per sub-block.
    C1,
    /// 4-byte slots, 60 per sub-block.
    C2,
    /// 2-byte slots, 60 per sub-block.
    C3,
}

/// `(mask, pattern)` pairs, tested in order; first match wins.
const CLASS_PATTERNS: [(u64, u64); 4] = [
    (0b0000_0001, 0b0000_0001), // C0
    (0b0000_0011, 0b0000_0010), // C1
    (0b0000_1111, 0b0000_0100), // C2
    (0b0000_1111, 0b0000_1100), // C3
];

/// Low-bit pattern of a variable-size block's info word.
pub(crate) const VARIABLE_MASK: u64 = 0b111;

/// How the data preceding (or containing) an info word is organised.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum BlockKind {
    Fixed(SlotClass),
    Variable,
}

/// Decode the class of a non-zero info word.
///
/// Returns `None` for words that encode nothing (zero, or a pattern no
/// allocator path produces — only possible on corrupted input).
pub(crate) fn classify(info: u64) -> Option<BlockKind> {
    if info == 0 {
        return None;
    }
    for (class, (mask, pattern)) in CLASS_PATTERNS.iter().enumerate() {
        if info & mask == *pattern {
            let class = match class {
                0 => SlotClass::C0,
                1 => SlotClass::C1,
                2 => SlotClass::C2,
                _ => SlotClass::C3,
            };
            return Some(BlockKind::Fixed(class));
        }
    }
    if info & VARIABLE_MASK == 0 {
        return Some(BlockKind::Variable);
    }
    None
}

impl SlotClass {
    /// Bytes per slot.
    pub(crate) const fn slot_size(self) -> usize {
        match self {
            SlotClass::C0 => 1,
            SlotClass::C1 => 8,
            SlotClass::C2 => 4,
            SlotClass::C3 => 2,
        }
    }

    /// Total sub-block footprint, info word included.
    pub(crate) const fn sub_block_bytes(self) -> usize {
        match self {
            SlotClass::C0 => 8,
            SlotClass::C1 => 504,
            SlotClass::C2 => 248,
            SlotClass::C3 => 128,
        }
    }

    /// Payload bytes mapped by the bitmap.
    pub(crate) const fn payload_bytes(self) -> usize {
        self.sub_block_bytes() - if matches!(self, SlotClass::C0) { 1 } else { WORD }
    }

    /// Number of slots / bitmap bits.
    pub(crate) const fn slot_count(self) -> u32 {
        match self {
            SlotClass::C0 => 7,
            SlotClass::C1 => 62,
            SlotClass::C2 | SlotClass::C3 => 60,
        }
    }

    /// Lowest bitmap bit; everything below it is the discriminator.
    pub(crate) const fn first_bit(self) -> u32 {
        match self {
            SlotClass::C0 => 1,
            SlotClass::C1 => 2,
            SlotClass::C2 | SlotClass::C3 => 4,
        }
    }

    /// Bitmap bits as a word mask.
    pub(crate) const fn bitmap_mask(self) -> u64 {
        let count = self.slot_count();
        let first = self.first_bit();
        if count + first == 64 {
            !((1u64 << first) - 1)
        } else {
            ((1u64 << count) - 1) << first
        }
    }

    /// Discriminator pattern; the info word of a freshly formatted, empty
    /// sub-block.
    pub(crate) const fn info_template(self) -> u64 {
        match self {
            SlotClass::C0 => 0b0001,
            SlotClass::C1 => 0b0010,
            SlotClass::C2 => 0b0100,
            SlotClass::C3 => 0b1100,
        }
    }

    /// Smallest class able to hold `size` bytes at `align` alignment, if
    /// any.  Slot sizes are powers of two, so a slot satisfies any
    /// alignment up to its own size.
    pub(crate) fn for_request(size: usize, align: usize) -> Option<SlotClass> {
        debug_assert!(align.is_power_of_two());
        if size == 0 || size > 8 || align > 8 {
            return None;
        }
        let need = size.max(align);
        Some(match need {
            1 => SlotClass::C0,
            2 => SlotClass::C3,
            3 | 4 => SlotClass::C2,
            _ => SlotClass::C1,
        })
    }
}

/// Bit index inside the info word at `bm` for the slot at address `a`.
///
/// For C0 the payload shares the info word: the discriminator-plus-bitmap
/// byte is the word's least-significant byte, so payload byte `i` of the
/// word (1..=7 in value order) is tracked by bit `i`.  On little-endian
/// hosts value order equals address order; on big-endian it is reversed.
pub(crate) fn bit_index(class: SlotClass, bm: usize, a: usize) -> u32 {
    match class {
        SlotClass::C0 => {
            // Little-endian payloads occupy bytes 1..=7 of the word,
            // big-endian payloads bytes 0..=6.
            debug_assert!(a >= bm && a < bm + WORD);
            let off = (a - bm) as u32;
            if LITTLE_ENDIAN { off } else { 7 - off }
        }
        _ => {
            debug_assert!(a < bm && bm - a <= class.payload_bytes());
            debug_assert!((bm - a) % class.slot_size() == 0);
            ((bm - a) / class.slot_size()) as u32 + class.first_bit() - 1
        }
    }
}

/// Slot address for bitmap bit `bit`; inverse of [`bit_index`].
pub(crate) fn slot_address(class: SlotClass, bm: usize, bit: u32) -> usize {
    debug_assert!(bit >= class.first_bit() && bit < class.first_bit() + class.slot_count());
    match class {
        SlotClass::C0 => {
            if LITTLE_ENDIAN {
                bm + bit as usize
            } else {
                bm + (7 - bit as usize)
            }
        }
        _ => bm - (bit - class.first_bit() + 1) as usize * class.slot_size(),
    }
}

/// First unused bitmap bit in `info`, or `None` when the sub-block is full.
pub(crate) fn find_free_bit(class: SlotClass, info: u64) -> Option<u32> {
    let free = !info & class.bitmap_mask();
    if free == 0 {
        None
    } else {
        Some(free.trailing_zeros())
    }
}

// ---------------------------------------------------------------------------
// Address rotation (variable-size slot words)
// ---------------------------------------------------------------------------
//
// A slot word's byte at the highest address ("rightmost") is its tag: low
// three bits zero means the word carries an address, 1..=7 means that many
// bytes of inline payload live in the word itself.  Addresses are 8-aligned,
// so their low byte already ends in 000 — on little-endian hosts it merely
// sits at the wrong end of the word, and the value is rotated left one byte
// to park it in the rightmost position.  Big-endian hosts store addresses
// as-is: the low byte is naturally rightmost.

/// Store-format of an 8-aligned value.
#[inline]
pub(crate) fn rotate(v: u64) -> u64 {
    debug_assert!(v % WORD as u64 == 0);
    if LITTLE_ENDIAN {
        (v >> 8) | ((v & 0xFF) << 56)
    } else {
        v
    }
}

/// Inverse of [`rotate`]; restores a pointer before dereference.
#[inline]
pub(crate) fn unrotate(stored: u64) -> u64 {
    if LITTLE_ENDIAN {
        (stored << 8) | (stored >> 56)
    } else {
        stored
    }
}

/// Tag byte of a slot word: the byte at the word's highest address.
#[inline]
pub(crate) fn tag_of(word: u64) -> u8 {
    if LITTLE_ENDIAN {
        (word >> 56) as u8
    } else {
        word as u8
    }
}

/// Interpretation of one variable-block slot word.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum SlotWord {
    /// Nothing stored.
    Empty,
    /// A region boundary; payload is the unrotated address.
    Boundary(usize),
    /// Inline payload of the given length (1..=7), stored in the word.
    Inline(u8),
}

/// Decode a slot word.
pub(crate) fn decode_slot(word: u64) -> SlotWord {
    if word == 0 {
        return SlotWord::Empty;
    }
    let tag = tag_of(word) & 7;
    if tag == 0 {
        SlotWord::Boundary(unrotate(word) as usize)
    } else {
        SlotWord::Inline(tag)
    }
}

/// Encode an inline slot word: `len` bytes of payload already written to
/// the word's low-address bytes, tag byte set to `len`.
#[inline]
pub(crate) fn inline_tag_word(len: u8) -> u64 {
    debug_assert!(len >= 1 && len <= 7);
    if LITTLE_ENDIAN {
        (len as u64) << 56
    } else {
        len as u64
    }
}
