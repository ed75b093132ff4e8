//! Synchronization primitives, routed through one place.
//!
//! The crate touches a deliberately small set of primitives: `AtomicU64`
//! for info words and diagnostic gauges, `Mutex` around zone growth,
//! `RwLock` for test gating, and a once-cell for the global heap.
//! Normal builds take them from `std`; `cfg(loom)` builds take them from
//! loom so its scheduler sees every access.  Nothing elsewhere in the
//! crate may name `std::sync::atomic` directly — an import that bypasses
//! this module is invisible to the model checker.
#![allow(unused_imports)]

#[cfg(not(loom))]
pub(crate) use std::sync::atomic::{AtomicU64, Ordering};

#[cfg(loom)]
pub(crate) use loom::sync::atomic::{AtomicU64, Ordering};

#[cfg(not(loom))]
pub(crate) use std::{
    cell::UnsafeCell,
    hint::spin_loop,
    sync::{Arc, Mutex, RwLock},
    thread,
};

#[cfg(loom)]
pub(crate) use loom::{
    cell::UnsafeCell,
    hint::spin_loop,
    sync::{Arc, Mutex, RwLock},
    thread,
};

/// Exclusive view into an `UnsafeCell`, bridging the API gap between
/// std's `get()` (a raw pointer) and loom's `with_mut` (a tracked
/// closure).
///
/// # Safety
/// The caller must be the only accessor for the lifetime of the returned
/// borrow, as with `UnsafeCell::get`.
#[cfg(not(loom))]
pub(crate) unsafe fn cell_as_mut<T>(cell: &UnsafeCell<T>) -> &mut T {
    // Safety: exclusivity upheld by the caller.
    unsafe { &mut *cell.get() }
}

/// See the non-loom variant.
#[cfg(loom)]
pub(crate) unsafe fn cell_as_mut<T>(cell: &UnsafeCell<T>) -> &mut T {
    // Safety: exclusivity upheld by the caller.
    cell.with_mut(|p| unsafe { &mut *p })
}

// ---------------------------------------------------------------------------
// Once-cell
//
// Loom provides no `OnceLock`, and its `Mutex::new` is not const, so the
// loom stand-in serialises initialisation through a plain std mutex.
// That mutex is invisible to the model on purpose: init-once state is not
// an interleaving loom needs to explore.  The value lives in a `Box` so
// handed-out references stay valid while the guard is gone.
// ---------------------------------------------------------------------------

#[cfg(not(loom))]
pub(crate) use std::sync::OnceLock;

#[cfg(loom)]
pub(crate) struct OnceLock<T> {
    slot: std::sync::Mutex<Option<Box<T>>>,
}

#[cfg(loom)]
impl<T> OnceLock<T> {
    pub(crate) const fn new() -> Self {
        Self {
            slot: std::sync::Mutex::new(None),
        }
    }

    pub(crate) fn get(&self) -> Option<&T> {
        let guard = self.slot.lock().unwrap();
        guard.as_deref().map(|v| {
            // Safety: the box never moves or drops while &self is live.
            unsafe { &*(v as *const T) }
        })
    }

    pub(crate) fn get_or_init<F: FnOnce() -> T>(&self, init: F) -> &T {
        let mut guard = self.slot.lock().unwrap();
        let boxed = guard.get_or_insert_with(|| Box::new(init()));
        let stable: *const T = &**boxed;
        // Safety: same stability argument as `get`.
        unsafe { &*stable }
    }

    pub(crate) fn set(&self, value: T) -> Result<(), T> {
        let mut guard = self.slot.lock().unwrap();
        if guard.is_some() {
            return Err(value);
        }
        *guard = Some(Box::new(value));
        Ok(())
    }
}

#[cfg(loom)]
// Safety: every access path goes through the inner mutex.
unsafe impl<T: Send> Sync for OnceLock<T> {}

/// Declare a shared `static` that works under both std and loom.
///
/// Loom atomics and locks are not const-constructible, so loom builds
/// route through `loom::lazy_static!` (which also re-creates the value
/// for every model run); std builds get an ordinary const-initialised
/// static.
macro_rules! global_static {
    ($vis:vis static $NAME:ident: $Ty:ty = $init:expr;) => {
        #[cfg(not(loom))]
        $vis static $NAME: $Ty = $init;

        #[cfg(loom)]
        loom::lazy_static! {
            $vis static ref $NAME: $Ty = $init;
        }
    };
}
pub(crate) use global_static;
