//! Full lifecycle in an isolated binary: teardown verifies and unmaps
//! everything, and the next operation starts a fresh heap.

use palisade::heap::config::DEFAULT_ZONE_SIZES;

#[test]
fn teardown_and_reinitialize() {
    let ptrs: Vec<*mut u8> = DEFAULT_ZONE_SIZES
        .iter()
        .map(|&class| palisade::alloc(class))
        .collect();
    for p in ptrs {
        // SAFETY: allocated above, freed exactly once.
        unsafe { palisade::free(p) };
    }
    palisade::verify_all();
    // SAFETY: every chunk handed out above is dead.
    unsafe { palisade::teardown() };

    // Lazy construction brings the heap back on the next request.
    let p = palisade::alloc(64);
    assert_eq!(palisade::chunk_size_of(p), 64);
    // SAFETY: allocated above, freed exactly once.
    unsafe { palisade::free(p) };
    // SAFETY: nothing is live.
    unsafe { palisade::teardown() };
    // A second teardown with no intervening use is a no-op.
    unsafe { palisade::teardown() };
}
