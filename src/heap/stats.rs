//! Diagnostic gauges.  Relaxed ordering throughout: the values exist for
//! display and tests, never for allocation decisions, and cross-gauge
//! snapshots may be transiently inconsistent.

use crate::sync::{AtomicU64, Ordering};

/// Up/down tally that saturates at zero.
///
/// A `sub` racing ahead of its matching `add` would otherwise wrap the
/// unsigned count; saturating instead leaves a brief undercount, which a
/// diagnostic reader tolerates.
pub struct Gauge(AtomicU64);

impl Gauge {
    #[cfg(not(loom))]
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    #[cfg(loom)]
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    #[inline]
    pub fn add(&self, n: usize) {
        self.0.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn sub(&self, n: usize) {
        let mut seen = self.0.load(Ordering::Relaxed);
        loop {
            let next = seen.saturating_sub(n as u64);
            match self
                .0
                .compare_exchange_weak(seen, next, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(now) => seen = now,
            }
        }
    }

    #[inline]
    pub fn read(&self) -> usize {
        self.0.load(Ordering::Relaxed) as usize
    }
}

impl Default for Gauge {
    fn default() -> Self {
        Self::new()
    }
}

// Bytes currently held from the pages source
crate::sync::global_static! {
    pub static TOTAL_ACQUIRED: Gauge = Gauge::new();
}
// Zones currently linked into the master tree
crate::sync::global_static! {
    pub static ZONES_LIVE: Gauge = Gauge::new();
}

// Hot-path contention telemetry
crate::sync::global_static! {
    pub static ALLOC_CAS_RETRIES: Gauge = Gauge::new();
}
crate::sync::global_static! {
    pub static FREES_HOARDED: Gauge = Gauge::new();
}

/// Point-in-time snapshot of the diagnostic gauges.
pub struct HeapStats {
    pub total_acquired: usize,
    pub zones_live: usize,
    pub alloc_cas_retries: usize,
    pub frees_hoarded: usize,
}

pub(crate) fn snapshot() -> HeapStats {
    HeapStats {
        total_acquired: TOTAL_ACQUIRED.read(),
        zones_live: ZONES_LIVE.read(),
        alloc_cas_retries: ALLOC_CAS_RETRIES.read(),
        frees_hoarded: FREES_HOARDED.read(),
    }
}
