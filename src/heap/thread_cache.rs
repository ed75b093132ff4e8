//! Thread-local allocator state.
//!
//! Three strictly thread-local structures, none of them synchronized: a
//! short most-recently-used list of allocation blocks probed before any
//! shared structure, a hoard absorbing frees that lost their bitmap CAS,
//! and a size-frequency predictor whose median steers how new capacity is
//! shaped.  The owning handle lives in `heap.rs` behind `thread_local!`.

use super::control::{BlockKind, SlotClass, WORD};
use super::locate;
use super::varblock::VarBlock;

/// Blocks remembered per thread.
pub(crate) const CACHE_DEPTH: usize = 8;

/// Default hoard bound in bytes.
pub(crate) const MAX_HOARD: usize = 3000;

/// Predictor entries; the first four are pinned to the fixed classes.
pub(crate) const PREDICTOR_ENTRIES: usize = 12;
const PINNED: usize = 4;

/// Aging threshold: when the count total reaches this, every count is
/// halved.
pub(crate) const COMPRESS_THRESHOLD: u32 = 1000;

// ---------------------------------------------------------------------------
// Recently-used block cache
// ---------------------------------------------------------------------------

/// MRU list of allocation-block bases.  Probed front to back on every
/// allocation; the block that eventually serves a miss is pushed to the
/// front.
pub(crate) struct BlockCache {
    recent: [usize; CACHE_DEPTH],
    /// Misses feed the predictor's aging heuristic.
    pub(crate) misses: u64,
}

impl BlockCache {
    pub(crate) const fn new() -> Self {
        Self {
            recent: [0; CACHE_DEPTH],
            misses: 0,
        }
    }

    /// Move `block` to the front, inserting it if absent.
    pub(crate) fn touch(&mut self, block: usize) {
        debug_assert!(block != 0);
        let pos = self.recent.iter().position(|&b| b == block);
        let end = pos.unwrap_or(CACHE_DEPTH - 1);
        self.recent.copy_within(0..end, 1);
        self.recent[0] = block;
    }

    /// Copy of the list, front first, vacancies as zero — lets callers
    /// probe entries while mutating the cache (and allocates nothing).
    pub(crate) fn snapshot(&self) -> [usize; CACHE_DEPTH] {
        self.recent
    }
}

// ---------------------------------------------------------------------------
// Hoard
// ---------------------------------------------------------------------------

/// What an allocation request needs from a hoarded entry.
#[derive(Clone, Copy, Debug)]
pub(crate) enum Fit {
    Fixed(SlotClass),
    Region { size: usize, align: usize },
}

/// Size-bounded LIFO of freed addresses whose bitmap CAS lost its race.
/// Entries thread through their own first word; each entry's class and
/// size are re-derived from block metadata when popping, so nothing but
/// the pointer is stored.
pub(crate) struct Hoard {
    head: usize,
    pub(crate) bytes: usize,
    pub(crate) max: usize,
}

impl Hoard {
    pub(crate) const fn new(max: usize) -> Self {
        Self {
            head: 0,
            bytes: 0,
            max,
        }
    }

    /// Capture a freed slot.  Declined when the slot cannot hold a link
    /// pointer or the hoard is at its bound; the caller then busy-loops
    /// its CAS instead.
    ///
    /// # Safety
    /// `p` must be a live, exclusively-owned slot of `slot_bytes` bytes,
    /// 8-aligned when `slot_bytes >= 8`.
    pub(crate) unsafe fn push(&mut self, p: usize, slot_bytes: usize) -> bool {
        if slot_bytes < WORD || self.bytes + slot_bytes > self.max {
            return false;
        }
        // Safety: the slot is ours and big enough for a link.
        unsafe { *(p as *mut usize) = self.head };
        self.head = p;
        self.bytes += slot_bytes;
        true
    }

    /// Pop the first entry satisfying `fit`, re-deriving each entry's
    /// shape from its owning block's metadata.
    ///
    /// # Safety
    /// Every hoarded entry must still be inside live zone memory.
    pub(crate) unsafe fn pop_fit(&mut self, fit: Fit) -> Option<usize> {
        let mut prev: usize = 0;
        let mut at = self.head;
        while at != 0 {
            // Safety: entries are live hoard links.
            let next = unsafe { *(at as *const usize) };
            // Safety: entry points into a live zone.
            let (matches, entry_bytes) = unsafe { Self::entry_fits(at, fit) };
            if matches {
                if prev == 0 {
                    self.head = next;
                } else {
                    // Safety: prev is a live hoard link.
                    unsafe { *(prev as *mut usize) = next };
                }
                self.bytes -= entry_bytes;
                return Some(at);
            }
            prev = at;
            at = next;
        }
        None
    }

    /// Entries currently hoarded, front to back.
    ///
    /// # Safety
    /// Every hoarded entry must still be inside live zone memory.
    pub(crate) unsafe fn drain(&mut self) -> impl Iterator<Item = usize> {
        let mut at = std::mem::replace(&mut self.head, 0);
        self.bytes = 0;
        std::iter::from_fn(move || {
            if at == 0 {
                return None;
            }
            let entry = at;
            // Safety: entries are live hoard links.
            at = unsafe { *(at as *const usize) };
            Some(entry)
        })
    }

    /// Shape of the hoarded entry at `p`: `(fits, slot_bytes)`.
    unsafe fn entry_fits(p: usize, fit: Fit) -> (bool, usize) {
        // Safety: forwarded contract.
        let block = unsafe { locate::locate(p) };
        // Safety: locate returned a live block.
        match unsafe { locate::kind_of_block(block) } {
            BlockKind::Fixed(_) => {
                // Safety: p lies in the located block.
                let Some((_, class)) = (unsafe { locate::find_sub_block(block, p) }) else {
                    debug_assert!(false, "hoarded pointer {p:#x} lost its sub-block");
                    return (false, WORD);
                };
                let matches = matches!(fit, Fit::Fixed(want) if want == class);
                (matches, class.slot_size())
            }
            BlockKind::Variable => {
                // Safety: the block is a live variable block.
                let vb = unsafe { VarBlock::at(block) };
                let Some(idx) = vb.find_region(p) else {
                    debug_assert!(false, "hoarded pointer {p:#x} lost its region");
                    return (false, WORD);
                };
                let size = vb.region_size(idx);
                let matches = match fit {
                    Fit::Fixed(_) => false,
                    Fit::Region { size: need, align } => {
                        p % align == 0 && size >= need && size <= need.saturating_mul(2)
                    }
                };
                (matches, size)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Size predictor
// ---------------------------------------------------------------------------

/// Sparse size-frequency estimator with aging.
///
/// Twelve ascending candidate sizes, the first four pinned to the fixed
/// classes.  New sizes are learned only inside the fuzz zone — a window
/// of one entry left and two right of the median — by evicting the
/// weakest unprotected neighbour.
pub(crate) struct SizePredictor {
    sizes: [usize; PREDICTOR_ENTRIES],
    /// One count per entry plus an overflow sentinel.
    counts: [u32; PREDICTOR_ENTRIES + 1],
    total: u32,
    median: usize,
}

impl SizePredictor {
    pub(crate) const fn new() -> Self {
        Self {
            sizes: [1, 2, 4, 8, 16, 32, 64, 128, 256, 512, 1024, 4096],
            counts: [0; PREDICTOR_ENTRIES + 1],
            total: 0,
            median: 0,
        }
    }

    pub(crate) fn median_size(&self) -> usize {
        self.sizes[self.median]
    }

    fn fuzz_range(&self) -> std::ops::Range<usize> {
        let left = self.median.saturating_sub(1);
        let right = (self.median + 3).min(PREDICTOR_ENTRIES);
        left..right
    }

    /// Record an observed request size (on cache misses and block
    /// creation).  Variable sizes are tracked at word granularity, like
    /// the entries themselves, so learning can never create a duplicate.
    pub(crate) fn observe(&mut self, size: usize) {
        let size = if size > 8 {
            size.div_ceil(WORD) * WORD
        } else {
            size
        };
        let idx = self
            .sizes
            .iter()
            .position(|&s| s >= size)
            .unwrap_or(PREDICTOR_ENTRIES);

        let fuzz = self.fuzz_range();
        let exact = idx < PREDICTOR_ENTRIES && self.sizes[idx] == size;
        if !exact && size > 8 && idx < PREDICTOR_ENTRIES && fuzz.contains(&idx) {
            self.learn(size, idx, fuzz);
        } else {
            self.counts[idx] += 1;
        }
        self.total += 1;

        if self.total >= COMPRESS_THRESHOLD {
            self.compress();
        }
        self.recompute_median();
    }

    /// Insert `size` before position `at`, evicting the weakest fuzz-zone
    /// entry that is neither pinned, nor last, nor positioned where the
    /// eviction would disturb the insertion point itself.
    fn learn(&mut self, size: usize, at: usize, fuzz: std::ops::Range<usize>) {
        let victim = fuzz
            .filter(|&i| i >= PINNED && i != PREDICTOR_ENTRIES - 1 && i != at)
            .min_by_key(|&i| self.counts[i]);
        let Some(victim) = victim else {
            self.counts[at] += 1;
            return;
        };

        // The victim's history folds into its successor.
        self.counts[victim + 1] += self.counts[victim];

        // Close the gap, open one at the insertion point.
        let insert = if victim < at { at - 1 } else { at };
        if victim < insert {
            self.sizes.copy_within(victim + 1..=insert, victim);
            self.counts.copy_within(victim + 1..=insert, victim);
        } else {
            self.sizes.copy_within(insert..victim, insert + 1);
            self.counts.copy_within(insert..victim, insert + 1);
        }
        self.sizes[insert] = size;
        // The newcomer steals half of its successor's weight.
        let stolen = self.counts[insert + 1] / 2;
        self.counts[insert + 1] -= stolen;
        self.counts[insert] = stolen + 1;

        debug_assert!(self.sizes.windows(2).all(|w| w[0] < w[1]), "predictor order");
    }

    fn compress(&mut self) {
        for c in &mut self.counts {
            *c /= 2;
        }
        self.total = self.counts.iter().sum();
    }

    fn recompute_median(&mut self) {
        let half = self.total / 2;
        let mut sum = 0;
        for (i, &c) in self.counts[..PREDICTOR_ENTRIES].iter().enumerate() {
            sum += c;
            if sum > half || (sum == half && half > 0) {
                self.median = i;
                return;
            }
        }
        self.median = 0;
    }

    #[cfg(test)]
    fn count_sum(&self) -> u32 {
        self.counts.iter().sum()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    fn occupied(cache: &BlockCache) -> Vec<usize> {
        cache.snapshot().iter().copied().filter(|&b| b != 0).collect()
    }

    #[test]
    fn test_cache_mru_order() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let mut cache = BlockCache::new();
        cache.touch(0x1000);
        cache.touch(0x2000);
        cache.touch(0x3000);
        assert_eq!(occupied(&cache), vec![0x3000, 0x2000, 0x1000]);

        // Touching an existing block moves it to the front, no duplicate.
        cache.touch(0x1000);
        assert_eq!(occupied(&cache), vec![0x1000, 0x3000, 0x2000]);
    }

    #[test]
    fn test_cache_evicts_oldest() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let mut cache = BlockCache::new();
        for i in 1..=CACHE_DEPTH + 2 {
            cache.touch(i * 0x1000);
        }
        let blocks = occupied(&cache);
        assert_eq!(blocks.len(), CACHE_DEPTH);
        assert_eq!(blocks[0], (CACHE_DEPTH + 2) * 0x1000);
        assert!(!blocks.contains(&0x1000));
    }

    #[test]
    fn test_hoard_respects_bound() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let mut hoard = Hoard::new(24);
        let mut slots = [0u64; 8];
        let base = slots.as_mut_ptr() as usize;

        // Safety: the slots array outlives the hoard in this test.
        unsafe {
            assert!(hoard.push(base, 8));
            assert!(hoard.push(base + 8, 8));
            assert!(hoard.push(base + 16, 8));
            // Bound reached.
            assert!(!hoard.push(base + 24, 8));
            // Sub-pointer-size slots are always declined.
            assert!(!hoard.push(base + 32, 4));
        }
        assert_eq!(hoard.bytes, 24);

        // Safety: entries are the live array above.
        let drained: Vec<_> = unsafe { hoard.drain() }.collect();
        assert_eq!(drained, vec![base + 16, base + 8, base]);
        assert_eq!(hoard.bytes, 0);
    }

    #[test]
    fn test_predictor_pinned_and_observation() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let mut p = SizePredictor::new();
        assert_eq!(&p.sizes[..4], &[1, 2, 4, 8]);

        p.observe(3); // smallest entry >= 3 is the pinned 4
        assert_eq!(p.counts[2], 1);
        p.observe(8);
        assert_eq!(p.counts[3], 1);
        assert_eq!(p.count_sum(), p.total);
    }

    #[test]
    fn test_predictor_aging_halves_counts() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        // A single size observed exactly threshold times.
        let mut p = SizePredictor::new();
        for _ in 0..COMPRESS_THRESHOLD {
            p.observe(8);
        }
        assert_eq!(p.counts[3], COMPRESS_THRESHOLD / 2);
        assert_eq!(p.total, p.count_sum());
        assert!(p.total < 2 * COMPRESS_THRESHOLD);
        assert_eq!(p.median, 3);
    }

    #[test]
    fn test_predictor_total_invariant_over_mixed_trace() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let mut p = SizePredictor::new();
        for i in 0..5000usize {
            p.observe((i * 7) % 300 + 1);
            assert_eq!(p.total, p.count_sum(), "after observation {i}");
            assert!(p.total < 2 * COMPRESS_THRESHOLD);
        }
        // Order is preserved through any learning that happened.
        assert!(p.sizes.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(&p.sizes[..4], &[1, 2, 4, 8]);
    }

    #[test]
    fn test_predictor_learns_in_fuzz_zone() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let mut p = SizePredictor::new();
        // Drive the median towards the variable entries.
        for _ in 0..200 {
            p.observe(64);
        }
        assert_eq!(p.median_size(), 64);
        let before = p.sizes;

        // 48 is not an entry and falls inside the fuzz window around 64.
        for _ in 0..50 {
            p.observe(48);
        }
        assert_ne!(before, p.sizes);
        assert!(p.sizes.contains(&48));
        assert!(p.sizes.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(p.total, p.count_sum());
    }
}
