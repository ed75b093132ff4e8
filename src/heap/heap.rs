//! Heap front end: `alloc` / `free` / `realloc` over the master-block
//! tree, with the per-thread fast path (hoard, block cache, predictor)
//! wired in.
//!
//! The hot paths are lock-free: a request probes the thread-local hoard
//! and block cache, then descends the tree claiming slots by CAS.  The
//! zone mutex serializes only growth — chaining new blocks at a zone's
//! wilderness and creating zones.

use std::ptr::NonNull;

use super::control::{BLOCK, BlockKind, SlotClass, WORD, bit_index};
use super::locate;
use super::pages::HeapError;
use super::slots;
use super::stats;
use super::thread_cache::{BlockCache, Fit, Hoard, MAX_HOARD, SizePredictor};
use super::varblock::{Placement, VarBlock};
use super::zone::{self, MasterBlock, Zone};
use crate::sync::{Mutex, OnceLock, UnsafeCell};

/// Configuration for [`Heap`].  All fields have sensible defaults; set at
/// init time via [`Heap::with_config`].
#[derive(Clone, Debug)]
pub struct HeapConfig {
    /// Bytes acquired per zone.  Oversized requests get a zone of their
    /// own regardless.  Default: 256 KiB.
    pub zone_bytes: usize,

    /// Per-thread hoard bound in bytes.  Default: 3000.
    pub max_hoard: usize,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            zone_bytes: 256 * 1024,
            max_hoard: MAX_HOARD,
        }
    }
}

/// Per-thread allocator state; owned by the TLS handle for the global
/// heap, or passed explicitly for instance-level use.
pub(crate) struct ThreadState {
    pub(crate) cache: BlockCache,
    pub(crate) hoard: Hoard,
    pub(crate) predictor: SizePredictor,
}

impl ThreadState {
    pub(crate) const fn new(max_hoard: usize) -> Self {
        Self {
            cache: BlockCache::new(),
            hoard: Hoard::new(max_hoard),
            predictor: SizePredictor::new(),
        }
    }
}

pub struct Heap {
    config: HeapConfig,
    /// Base of the root master block; entry point of the tree.
    root: usize,
    /// Zone registry.  Guards growth; never taken on the alloc/free fast
    /// path.  Pre-reserved so steady-state growth rarely reallocates.
    zones: Mutex<Vec<Zone>>,
}

// Safety: all shared state is either behind the Mutex or reached through
// atomic words in zone memory.
unsafe impl Send for Heap {}
// Safety: see above; per-thread state is never shared.
unsafe impl Sync for Heap {}

impl Heap {
    /// Create a heap with default configuration.
    ///
    /// # Errors
    /// Returns an error when the pages source cannot supply the first
    /// zone.
    pub fn new() -> Result<Self, HeapError> {
        Self::with_config(HeapConfig::default())
    }

    /// Create a heap with custom configuration.
    ///
    /// # Errors
    /// Returns an error when the configuration is invalid or the first
    /// zone cannot be acquired.
    pub fn with_config(config: HeapConfig) -> Result<Self, HeapError> {
        // One-shot byte-order check: the rotation paths are compiled for
        // the target's endianness and must match what the hardware says.
        debug_assert_eq!(
            super::control::probe_endianness(),
            super::control::LITTLE_ENDIAN,
            "byte-order probe disagrees with compile-time endianness"
        );
        if config.zone_bytes < 4 * BLOCK || config.zone_bytes % BLOCK != 0 {
            return Err(HeapError::InitializationFailed(format!(
                "zone_bytes {} must be a multiple of {BLOCK} and at least {}",
                config.zone_bytes,
                4 * BLOCK
            )));
        }
        let first = Zone::create(config.zone_bytes)?;
        let root = first.base();
        let mut zones = Vec::with_capacity(64);
        zones.push(first);
        Ok(Self {
            config,
            root,
            zones: Mutex::new(zones),
        })
    }

    fn root(&self) -> MasterBlock {
        // Safety: the root master lives as long as the heap.
        unsafe { MasterBlock::at(self.root) }
    }

    #[inline]
    fn dangling_for_align(align: usize) -> NonNull<u8> {
        debug_assert!(align.is_power_of_two() && align > 0);
        // Non-dereferenceable pointer used for zero-sized allocations.
        // Safety: align is non-zero.
        unsafe { NonNull::new_unchecked(align as *mut u8) }
    }

    // -----------------------------------------------------------------
    // Public API (stateless wrappers)
    // -----------------------------------------------------------------

    /// Allocate `size` bytes aligned to `align`.
    ///
    /// # Errors
    /// Out-of-memory when the pages source fails, or an invalid layout.
    pub fn alloc(&self, size: usize, align: usize) -> Result<NonNull<u8>, HeapError> {
        let mut state = ThreadState::new(0); // no hoard on the direct path
        self.alloc_with_state(&mut state, size, align)
    }

    /// Free a pointer previously returned by this heap.
    ///
    /// # Safety
    /// `ptr` must come from this heap's `alloc`/`realloc` and must not
    /// have been freed already.
    pub unsafe fn free(&self, ptr: NonNull<u8>) {
        let mut state = ThreadState::new(0);
        // Safety: forwarded contract.
        unsafe { self.free_with_state(&mut state, ptr) };
    }

    /// Resize an allocation, in place when the owning slot already covers
    /// `new_size`, otherwise by allocate-copy-free.
    ///
    /// # Errors
    /// Out-of-memory when a required new region cannot be obtained.
    ///
    /// # Safety
    /// `ptr` must come from this heap and must not have been freed.
    pub unsafe fn realloc(
        &self,
        ptr: NonNull<u8>,
        new_size: usize,
    ) -> Result<NonNull<u8>, HeapError> {
        let mut state = ThreadState::new(0);
        // Safety: forwarded contract.
        unsafe { self.realloc_with_state(&mut state, ptr, new_size) }
    }

    // -----------------------------------------------------------------
    // Allocation
    // -----------------------------------------------------------------

    pub(crate) fn alloc_with_state(
        &self,
        state: &mut ThreadState,
        size: usize,
        align: usize,
    ) -> Result<NonNull<u8>, HeapError> {
        if !align.is_power_of_two() || align > BLOCK {
            return Err(HeapError::InvalidLayout { size, align });
        }
        if size == 0 {
            return Ok(Self::dangling_for_align(align));
        }

        let p = match SlotClass::for_request(size, align) {
            Some(class) => self.alloc_fixed(state, size, class)?,
            None => self.alloc_variable(state, size, align)?,
        };
        debug_assert!(p % align == 0, "misaligned result {p:#x} for align {align}");
        // Safety: a claimed slot address is never null.
        Ok(unsafe { NonNull::new_unchecked(p as *mut u8) })
    }

    fn alloc_fixed(
        &self,
        state: &mut ThreadState,
        size: usize,
        class: SlotClass,
    ) -> Result<usize, HeapError> {
        // Hoard first: contention refugees make the cheapest slots.
        // Safety: hoarded entries are live slots of this heap.
        if let Some(p) = unsafe { state.hoard.pop_fit(Fit::Fixed(class)) } {
            return Ok(p);
        }

        // Recently used blocks, most recent first.
        for block in state.cache.snapshot() {
            if block == 0 {
                continue;
            }
            // Safety: cached bases are live allocation blocks.
            if let BlockKind::Fixed(_) = unsafe { locate::kind_of_block(block) } {
                // Safety: block is live and fixed-class.
                if let Some(p) = unsafe { zone::claim_in_fixed_block(block, class) } {
                    state.cache.touch(block);
                    return Ok(p);
                }
            }
        }
        state.cache.misses += 1;
        state.predictor.observe(size);

        // Tree walk.
        let mut found = None;
        self.walk_blocks(|block, _zone_end| {
            // Safety: walked blocks are live.
            match unsafe { locate::kind_of_block(block) } {
                // Safety: block is live and fixed-class.
                BlockKind::Fixed(_) => unsafe { zone::claim_in_fixed_block(block, class) }
                    .map(|p| {
                        found = Some((p, block));
                    })
                    .is_some(),
                BlockKind::Variable => false,
            }
        });
        if let Some((p, block)) = found {
            state.cache.touch(block);
            return Ok(p);
        }

        // Small requests can fall back to an inline slot of a variable
        // block before forcing growth.
        if size <= 7 {
            let mut found = None;
            self.walk_blocks(|block, _| {
                // Safety: walked blocks are live.
                if let BlockKind::Variable = unsafe { locate::kind_of_block(block) } {
                    // Safety: block is live and variable.
                    let vb = unsafe { VarBlock::at(block) };
                    if let Some(p) = vb.alloc_inline(size as u8) {
                        found = Some((p, block));
                        return true;
                    }
                }
                false
            });
            if let Some((p, block)) = found {
                state.cache.touch(block);
                return Ok(p);
            }
        }

        // Growth: a fresh fixed block shaped for this class.
        let block = self.grow_fixed(state, class)?;
        // Safety: freshly formatted block.
        let p = unsafe { zone::claim_in_fixed_block(block, class) }
            .expect("fresh fixed block has no free slot");
        state.cache.touch(block);
        Ok(p)
    }

    fn alloc_variable(
        &self,
        state: &mut ThreadState,
        size: usize,
        align: usize,
    ) -> Result<usize, HeapError> {
        let need = (size + WORD - 1) & !(WORD - 1);

        // Safety: hoarded entries are live regions of this heap.
        if let Some(p) = unsafe { state.hoard.pop_fit(Fit::Region { size: need, align }) } {
            return Ok(p);
        }

        for block in state.cache.snapshot() {
            if block == 0 {
                continue;
            }
            // Safety: cached bases are live allocation blocks.
            if let BlockKind::Variable = unsafe { locate::kind_of_block(block) } {
                // Safety: block is live and variable.
                let vb = unsafe { VarBlock::at(block) };
                if let Some(p) = Self::place_in_free_regions(vb, need, align) {
                    state.cache.touch(block);
                    return Ok(p);
                }
            }
        }
        state.cache.misses += 1;
        state.predictor.observe(size);

        let mut found = None;
        self.walk_blocks(|block, zone_end| {
            // Safety: walked blocks are live.
            if let BlockKind::Variable = unsafe { locate::kind_of_block(block) } {
                // Safety: block is live and variable.
                let vb = unsafe { VarBlock::at(block) };
                if let Some(p) = Self::place_in_free_regions(vb, need, align) {
                    found = Some((p, block));
                    return true;
                }
                // The chain tail also owns the zone's wilderness.
                // Safety: block is live.
                if unsafe { zone::next_block(block) }.is_none() {
                    if let Some(p) =
                        vb.place_in_wilderness(need, align, zone_end, Placement::Region)
                    {
                        found = Some((p, block));
                        return true;
                    }
                }
            }
            false
        });
        if let Some((p, block)) = found {
            state.cache.touch(block);
            return Ok(p);
        }

        self.grow_variable(state, need, align)
    }

    fn place_in_free_regions(vb: VarBlock, need: usize, align: usize) -> Option<usize> {
        for (idx, _start, size) in vb.free_regions() {
            if size < need {
                continue;
            }
            if let Some(p) = vb.place_in_region(idx, need, align) {
                return Some(p);
            }
        }
        None
    }

    /// Walk every allocation block under the tree until `f` returns true.
    fn walk_blocks(&self, mut f: impl FnMut(usize, usize) -> bool) {
        fn descend(m: MasterBlock, f: &mut impl FnMut(usize, usize) -> bool) -> bool {
            let zone_end = m.zone_end();
            let mut block = m.first_block();
            loop {
                if f(block, zone_end) {
                    return true;
                }
                // Safety: chain blocks of a live zone.
                match unsafe { zone::next_block(block) } {
                    Some(next) => block = next,
                    None => break,
                }
            }
            for child in m.children() {
                // Safety: tree pointers are immutable once installed.
                if descend(unsafe { MasterBlock::at(child) }, f) {
                    return true;
                }
            }
            false
        }
        descend(self.root(), &mut f);
    }

    // -----------------------------------------------------------------
    // Growth (zone mutex held)
    // -----------------------------------------------------------------

    /// Chain a `[fixed block][variable block]` pair at some zone's
    /// wilderness, creating a zone if none has room.  Returns the fixed
    /// block's base.
    fn grow_fixed(&self, state: &mut ThreadState, class: SlotClass) -> Result<usize, HeapError> {
        let mut zones = self.zones.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        for zone in zones.iter().rev() {
            if let Some(base) = Self::chain_block_pair(zone, Some(class)) {
                return Ok(base);
            }
        }
        let zone = self.create_zone(&mut zones, state, 2 * BLOCK)?;
        Self::chain_block_pair(zone, Some(class)).ok_or(HeapError::OutOfMemory)
    }

    /// Place a variable request that no existing block could serve:
    /// chain a fresh variable block (or zone) and carve from its
    /// wilderness.
    fn grow_variable(
        &self,
        state: &mut ThreadState,
        need: usize,
        align: usize,
    ) -> Result<usize, HeapError> {
        let mut zones = self.zones.lock().unwrap_or_else(std::sync::PoisonError::into_inner);

        // A tail whose slot array filled up gets a successor block first.
        for zone in zones.iter().rev() {
            // Safety: zone blocks are live.
            let Some(tail) = (unsafe { zone::tail_var_block(zone.master().first_block()) }) else {
                continue;
            };
            let tail = if tail.exhausted() {
                match Self::chain_block_pair(zone, None) {
                    // Safety: freshly chained variable block.
                    Some(vb_base) => unsafe { VarBlock::at(vb_base) },
                    None => continue,
                }
            } else {
                tail
            };
            if let Some(p) = tail.place_in_wilderness(need, align, zone.end(), Placement::Region)
            {
                return Ok(p);
            }
        }

        let zone = self.create_zone(&mut zones, state, need + 4 * BLOCK)?;
        // Safety: fresh zone, blocks just formatted.
        let tail = unsafe { zone::tail_var_block(zone.master().first_block()) }
            .expect("fresh zone has a variable tail");
        tail.place_in_wilderness(need, align, zone.end(), Placement::Region)
            .ok_or(HeapError::OutOfMemory)
    }

    /// Carve and chain new capacity at `zone`'s wilderness: a fixed block
    /// shaped for `class` paired with a trailing variable block, or just
    /// a variable block when `class` is `None`.  Returns the first new
    /// block's base.
    ///
    /// Free-region placements race this lock-free; a lost chain CAS
    /// unwinds the carve and retries against the moved wilderness.
    fn chain_block_pair(zone: &Zone, class: Option<SlotClass>) -> Option<usize> {
        // Safety: zone blocks are live.
        let tail = unsafe { zone::tail_var_block(zone.master().first_block()) }?;
        let span = match class {
            Some(_) => 2 * BLOCK,
            None => BLOCK,
        };
        loop {
            let y = tail.place_in_wilderness(span, BLOCK, zone.end(), Placement::Block)?;
            // Format before publishing: once the chain CAS lands, walkers
            // will classify these blocks.
            // Safety: the carved span is claimed and unshared.
            unsafe {
                match class {
                    Some(c) => {
                        zone::format_fixed_block(y, c);
                        VarBlock::format(y + BLOCK);
                    }
                    None => {
                        VarBlock::format(y);
                    }
                }
            }
            if tail.chain_next_block(y + span, y) {
                // The carved span is chain structure now, not a region.
                if let Some(idx) = tail.find_region(y) {
                    tail.dissolve_region(idx);
                }
                return Some(y);
            }
            // Lost to a concurrent wilderness placement: the span stays a
            // plain free region.  Restore the narrowed tag first.
            // Safety: the span is still our claimed region.
            let tag = unsafe { slots::word_at(y - WORD) };
            if slots::load(tag) & 0xFF == 0 {
                slots::store_slot(tag, tail.base() as u64);
            }
            if let Some(idx) = tail.find_region(y) {
                tail.release_spin(idx);
                tail.coalesce(idx);
            }
        }
    }

    fn create_zone<'z>(
        &self,
        zones: &'z mut Vec<Zone>,
        state: &mut ThreadState,
        min_capacity: usize,
    ) -> Result<&'z Zone, HeapError> {
        // Predictor-guided sizing: reserve in proportion to the sizes this
        // thread has been asking for.
        let hint = state.predictor.median_size().saturating_mul(64);
        let bytes = self
            .config
            .zone_bytes
            .max((min_capacity + 3 * BLOCK + BLOCK - 1) / BLOCK * BLOCK)
            .max((hint + BLOCK - 1) / BLOCK * BLOCK);
        let zone = Zone::create(bytes)?;

        // Link the new zone's master into the tree; every master has 61
        // child slots, so a vacancy always turns up.
        fn link(m: MasterBlock, child: usize) -> bool {
            if m.add_child(child) {
                return true;
            }
            // Safety: tree pointers are immutable once installed.
            m.children().any(|c| link(unsafe { MasterBlock::at(c) }, child))
        }
        if !link(self.root(), zone.base()) {
            return Err(HeapError::InitializationFailed(
                "master tree rejected new zone".to_string(),
            ));
        }
        zones.push(zone);
        Ok(zones.last().expect("zone just pushed"))
    }

    // -----------------------------------------------------------------
    // Free
    // -----------------------------------------------------------------

    pub(crate) unsafe fn free_with_state(&self, state: &mut ThreadState, ptr: NonNull<u8>) {
        let p = ptr.as_ptr() as usize;
        // Safety: ptr came from this heap, so the locator tags are live.
        let block = unsafe { locate::locate(p) };
        // Safety: locate returned a live allocation block.
        match unsafe { locate::kind_of_block(block) } {
            BlockKind::Fixed(_) => {
                // Safety: p lies inside the located fixed block.
                let Some((bm, class)) = (unsafe { locate::find_sub_block(block, p) }) else {
                    debug_assert!(false, "free({p:#x}): no owning sub-block");
                    return;
                };
                let bit = bit_index(class, bm, p);
                // Safety: bm is a live info word.
                let word = unsafe { slots::word_at(bm) };
                let observed = slots::load(word);
                debug_assert!(observed & (1 << bit) != 0, "double free at {p:#x}");
                if slots::try_clear_bit(word, observed, bit).is_err() {
                    // Contention: donate to the thread-local reserve
                    // rather than fighting for the word.
                    // Safety: the slot is ours until its bit clears.
                    if unsafe { state.hoard.push(p, class.slot_size()) } {
                        stats::FREES_HOARDED.add(1);
                    } else {
                        slots::clear_bit_spin(word, bit);
                    }
                }
            }
            BlockKind::Variable => {
                // Safety: the block is a live variable block.
                let vb = unsafe { VarBlock::at(block) };
                if vb.inline_len(p).is_some() {
                    vb.free_inline(p);
                    return;
                }
                let Some(idx) = vb.find_region(p) else {
                    debug_assert!(false, "free({p:#x}): no owning region");
                    return;
                };
                if vb.try_release(idx).is_ok() {
                    vb.coalesce(idx);
                    return;
                }
                let size = vb.region_size(idx);
                // Safety: the region is ours until its bit clears.
                if unsafe { state.hoard.push(p, size) } {
                    stats::FREES_HOARDED.add(1);
                } else {
                    vb.release_spin(idx);
                    vb.coalesce(idx);
                }
            }
        }
    }

    // -----------------------------------------------------------------
    // Realloc
    // -----------------------------------------------------------------

    pub(crate) unsafe fn realloc_with_state(
        &self,
        state: &mut ThreadState,
        ptr: NonNull<u8>,
        new_size: usize,
    ) -> Result<NonNull<u8>, HeapError> {
        if new_size == 0 {
            // Safety: forwarded contract.
            unsafe { self.free_with_state(state, ptr) };
            return Ok(Self::dangling_for_align(1));
        }
        let p = ptr.as_ptr() as usize;
        // Safety: ptr came from this heap.
        let old_size = unsafe { self.size_of(p) };
        if new_size <= old_size {
            return Ok(ptr);
        }

        let fresh = self.alloc_with_state(state, new_size, WORD.min(old_size.max(1)))?;
        // Safety: both regions are live and at least old_size bytes.
        unsafe {
            std::ptr::copy_nonoverlapping(ptr.as_ptr(), fresh.as_ptr(), old_size);
            self.free_with_state(state, ptr);
        }
        Ok(fresh)
    }

    /// Usable size of the allocation at `p`, from metadata alone.
    ///
    /// # Safety
    /// `p` must be a live allocation of this heap.
    unsafe fn size_of(&self, p: usize) -> usize {
        // Safety: forwarded contract.
        let block = unsafe { locate::locate(p) };
        // Safety: locate returned a live block.
        match unsafe { locate::kind_of_block(block) } {
            BlockKind::Fixed(_) => {
                // Safety: p lies inside the located block.
                match unsafe { locate::find_sub_block(block, p) } {
                    Some((_, class)) => class.slot_size(),
                    None => 0,
                }
            }
            BlockKind::Variable => {
                // Safety: the block is a live variable block.
                let vb = unsafe { VarBlock::at(block) };
                if let Some(len) = vb.inline_len(p) {
                    return len as usize;
                }
                match vb.find_region(p) {
                    Some(idx) => vb.region_size(idx),
                    None => 0,
                }
            }
        }
    }

    /// Diagnostic snapshot.
    pub fn stats(&self) -> stats::HeapStats {
        stats::snapshot()
    }
}

// ---------------------------------------------------------------------------
// Global heap
// ---------------------------------------------------------------------------

static GLOBAL_HEAP: OnceLock<Heap> = OnceLock::new();

thread_local! {
    static HEAP_TLS: TlsHandle = TlsHandle::new();
}

/// Per-thread handle owning the thread-local state.
///
/// # Safety
///
/// `state` is wrapped in `UnsafeCell` because it is only ever accessed by
/// the owning thread (via TLS).  The heap entry points never re-enter the
/// TLS access point: they work on zone memory and the zone mutex only.
struct TlsHandle {
    state: UnsafeCell<ThreadState>,
}

// Safety: TlsHandle is confined to a single thread via thread_local!.
unsafe impl Sync for TlsHandle {}

impl TlsHandle {
    fn new() -> Self {
        // TLS is initialized lazily on the first global-heap call, by
        // which point the configured bound is known.
        let max_hoard = GLOBAL_HEAP
            .get()
            .map_or(MAX_HOARD, |heap| heap.config.max_hoard);
        Self {
            state: UnsafeCell::new(ThreadState::new(max_hoard)),
        }
    }
}

impl Drop for TlsHandle {
    fn drop(&mut self) {
        // Return hoarded pointers to their bitmaps on thread exit so none
        // are stranded.
        if let Some(heap) = GLOBAL_HEAP.get() {
            // Safety: Drop has exclusive access to the handle.
            let state = unsafe { crate::sync::cell_as_mut(&self.state) };
            // Safety: hoarded entries are live allocations of the global
            // heap; the spin path never touches TLS again.
            unsafe {
                let mut scratch = ThreadState::new(0);
                for p in state.hoard.drain() {
                    heap.free_with_state(&mut scratch, NonNull::new_unchecked(p as *mut u8));
                }
            }
        }
    }
}

/// Process-wide heap facade, usable as `#[global_allocator]` once
/// [`init`](GlobalHeap::init) has run.
pub struct GlobalHeap;

impl GlobalHeap {
    /// Initialize the global heap.
    ///
    /// # Errors
    /// Fails when already initialized or when the first zone cannot be
    /// acquired.
    pub fn init() -> Result<(), HeapError> {
        Self::init_with_config(HeapConfig::default())
    }

    /// Initialize the global heap with custom configuration.
    ///
    /// # Errors
    /// Fails when already initialized or when the first zone cannot be
    /// acquired.
    pub fn init_with_config(config: HeapConfig) -> Result<(), HeapError> {
        GLOBAL_HEAP
            .set(Heap::with_config(config)?)
            .map_err(|_| HeapError::InitializationFailed("already initialized".to_string()))
    }

    /// The initialized global heap.
    ///
    /// # Panics
    /// Panics when [`init`](Self::init) has not run.
    pub fn get() -> &'static Heap {
        GLOBAL_HEAP.get().expect("GlobalHeap not initialized")
    }

    /// Allocate through the calling thread's cache.
    ///
    /// # Errors
    /// Out-of-memory or invalid layout, as for [`Heap::alloc`].
    pub fn alloc(size: usize, align: usize) -> Result<NonNull<u8>, HeapError> {
        let heap = Self::get();
        HEAP_TLS.with(|handle| {
            // Safety: single-threaded TLS access; no re-entrancy (the heap
            // works on zone memory, never TLS).
            let state = unsafe { crate::sync::cell_as_mut(&handle.state) };
            heap.alloc_with_state(state, size, align)
        })
    }

    /// Free through the calling thread's cache.
    ///
    /// # Safety
    /// `ptr` must come from this global heap and not be freed twice.
    pub unsafe fn free(ptr: NonNull<u8>) {
        let heap = Self::get();
        HEAP_TLS.with(|handle| {
            // Safety: single-threaded TLS access; no re-entrancy.
            let state = unsafe { crate::sync::cell_as_mut(&handle.state) };
            // Safety: forwarded contract.
            unsafe { heap.free_with_state(state, ptr) };
        });
    }

    /// Reallocate through the calling thread's cache.
    ///
    /// # Errors
    /// Out-of-memory, as for [`Heap::realloc`].
    ///
    /// # Safety
    /// `ptr` must come from this global heap and not be freed.
    pub unsafe fn realloc(ptr: NonNull<u8>, new_size: usize) -> Result<NonNull<u8>, HeapError> {
        let heap = Self::get();
        HEAP_TLS.with(|handle| {
            // Safety: single-threaded TLS access; no re-entrancy.
            let state = unsafe { crate::sync::cell_as_mut(&handle.state) };
            // Safety: forwarded contract.
            unsafe { heap.realloc_with_state(state, ptr, new_size) }
        })
    }
}

// Safety: implementation follows the GlobalAlloc contract; alignment and
// size come from the layout, and null signals failure.
unsafe impl std::alloc::GlobalAlloc for GlobalHeap {
    unsafe fn alloc(&self, layout: std::alloc::Layout) -> *mut u8 {
        match GlobalHeap::alloc(layout.size(), layout.align().max(1)) {
            Ok(p) => p.as_ptr(),
            Err(_) => std::ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: std::alloc::Layout) {
        if let Some(ptr) = NonNull::new(ptr) {
            // Safety: forwarded contract.
            unsafe { GlobalHeap::free(ptr) };
        }
    }

    unsafe fn realloc(
        &self,
        ptr: *mut u8,
        _layout: std::alloc::Layout,
        new_size: usize,
    ) -> *mut u8 {
        let Some(nn) = NonNull::new(ptr) else {
            return std::ptr::null_mut();
        };
        // Safety: forwarded contract.
        match unsafe { GlobalHeap::realloc(nn, new_size) } {
            Ok(p) => p.as_ptr(),
            Err(_) => std::ptr::null_mut(),
        }
    }
}
