#[cfg(not(target_pointer_width = "64"))]
compile_error!("btmalloc supports only 64-bit targets.");

pub(crate) mod sync;

// public module: contains implementation details (hidden via pub(crate))
// and TEST_MUTEX (public for tests)
pub mod heap;

// allocator front end
pub use heap::heap::{GlobalHeap, Heap, HeapConfig};

// errors
pub use heap::pages::HeapError;

// diagnostics
pub use heap::stats::HeapStats;
