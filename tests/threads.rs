//! Two-thread stress: every allocation is matched by a free. The
//! harness keeps its own outstanding-pointer count per worker, so at
//! join the balance must be zero and the heap must verify clean.

use rand::Rng;
use std::thread;

use palisade::heap::config::DEFAULT_ZONE_SIZES;

const PAIRS_PER_THREAD: usize = 100_000;
const BATCH: usize = 8;

#[test]
fn concurrent_alloc_free_pairs() {
    let workers: Vec<_> = (0..2)
        .map(|seed| {
            thread::spawn(move || {
                let mut rng = rand::rng();
                let mut held: Vec<*mut u8> = Vec::with_capacity(BATCH);
                let mut outstanding: usize = 0;
                for i in 0..PAIRS_PER_THREAD {
                    let class = DEFAULT_ZONE_SIZES[rng.random_range(0..DEFAULT_ZONE_SIZES.len())];
                    let p = palisade::alloc(class);
                    assert!(!p.is_null());
                    // SAFETY: p is a fresh chunk of at least `class` bytes.
                    unsafe { p.write((seed as u8) ^ (i as u8)) };
                    held.push(p);
                    outstanding += 1;
                    if held.len() == BATCH {
                        for p in held.drain(..) {
                            // SAFETY: allocated above, freed exactly once.
                            unsafe { palisade::free(p) };
                            outstanding -= 1;
                        }
                    }
                }
                for p in held {
                    // SAFETY: allocated above, freed exactly once.
                    unsafe { palisade::free(p) };
                    outstanding -= 1;
                }
                outstanding
            })
        })
        .collect();

    let leaked: usize = workers
        .into_iter()
        .map(|worker| worker.join().expect("worker panicked"))
        .sum();
    assert_eq!(leaked, 0);
    palisade::verify_all();
}
