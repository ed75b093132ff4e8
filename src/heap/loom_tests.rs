//! Loom-based concurrency tests.
//!
//! Run w/ `RUSTFLAGS="--cfg loom" cargo test --lib --release`
//!
//! Exercise the CAS slot-transition protocol under every interleaving
//! loom can explore.
//!
//! # Design notes
//!
//! Zone memory cannot hold loom's fat atomic objects, so the models work
//! on directly constructed `AtomicU64` info words through the
//! `&AtomicU64`-taking entry points of `slots` — exactly the word-level
//! protocol every higher layer compiles down to.  Thread counts stay at
//! 2–3 and loop bodies at 1–3 operations; the recycling paths that need
//! real zone memory are covered by the threaded tests in `heap.rs`.

#[cfg(loom)]
mod tests {
    use crate::heap::slots;
    use crate::sync::Arc;
    use crate::sync::AtomicU64;

    fn bounded(preemption: usize) -> loom::model::Builder {
        let mut b = loom::model::Builder::new();
        b.preemption_bound = Some(preemption);
        b
    }

    #[test]
    fn loom_claim_is_exclusive() {
        loom::model(|| {
            // Two threads race one free bit; exactly one may win.
            let word = Arc::new(AtomicU64::new(0b0010));
            let w1 = word.clone();
            let w2 = word.clone();

            let t1 = loom::thread::spawn(move || {
                let b = slots::load(&w1);
                if b & (1 << 5) == 0 {
                    slots::try_set_bit(&w1, b, 5).is_ok()
                } else {
                    false
                }
            });
            let t2 = loom::thread::spawn(move || {
                let b = slots::load(&w2);
                if b & (1 << 5) == 0 {
                    slots::try_set_bit(&w2, b, 5).is_ok()
                } else {
                    false
                }
            });

            let wins = usize::from(t1.join().unwrap()) + usize::from(t2.join().unwrap());
            assert_eq!(wins, 1, "a slot bit must be claimed exactly once");
            assert_eq!(slots::load(&word), 0b10_0010);
        });
    }

    #[test]
    fn loom_clear_survives_neighbour_churn() {
        bounded(3).check(|| {
            // One thread owns bit 3 and must clear it regardless of a
            // peer claiming and releasing a neighbouring bit.
            let word = Arc::new(AtomicU64::new((1 << 3) | 0b0010));
            let owner = word.clone();
            let peer = word.clone();

            let t1 = loom::thread::spawn(move || {
                slots::clear_bit_spin(&owner, 3);
            });
            let t2 = loom::thread::spawn(move || {
                let b = slots::load(&peer);
                if b & (1 << 7) == 0 {
                    if slots::try_set_bit(&peer, b, 7).is_ok() {
                        slots::clear_bit_spin(&peer, 7);
                    }
                }
            });

            t1.join().unwrap();
            t2.join().unwrap();
            let end = slots::load(&word);
            assert_eq!(end & (1 << 3), 0);
            assert_eq!(end & (1 << 7), 0);
        });
    }

    #[test]
    fn loom_multi_slot_claim_never_partial() {
        bounded(2).check(|| {
            // A two-bit claim must be visible all-or-nothing to a reader.
            let word = Arc::new(AtomicU64::new(0));
            let writer = word.clone();
            let reader = word.clone();
            let mask = (1 << 4) | (1 << 5);

            let t1 = loom::thread::spawn(move || {
                let b = slots::load(&writer);
                let _ = slots::try_set_bits(&writer, b, mask);
            });
            let t2 = loom::thread::spawn(move || {
                let seen = slots::load(&reader) & mask;
                assert!(
                    seen == 0 || seen == mask,
                    "reader observed a partial claim: {seen:#x}"
                );
            });

            t1.join().unwrap();
            t2.join().unwrap();
        });
    }

    #[test]
    fn loom_lost_free_routes_to_hoard() {
        bounded(2).check(|| {
            // The free protocol: one CAS attempt against a snapshot, a
            // hoard capture on loss.  Whatever the interleaving, the slot
            // ends up either cleared or hoarded — never both, never lost.
            let word = Arc::new(AtomicU64::new((1 << 3) | (1 << 4) | 0b0010));
            let w1 = word.clone();
            let w2 = word.clone();

            // Peer frees bit 4 outright.
            let t2 = loom::thread::spawn(move || {
                slots::clear_bit_spin(&w2, 4);
            });

            // Main thread frees bit 3 with the hoard fallback.
            let hoarded = {
                let b = slots::load(&w1);
                match slots::try_clear_bit(&w1, b, 3) {
                    Ok(_) => false,
                    Err(_) => true, // captured by the hoard
                }
            };

            t2.join().unwrap();
            let end = slots::load(&word);
            if hoarded {
                assert_eq!(end & (1 << 3), 1 << 3, "hoarded slot keeps its bit");
            } else {
                assert_eq!(end & (1 << 3), 0, "freed slot clears its bit");
            }
            assert_eq!(end & (1 << 4), 0);
        });
    }
}
