//! Per-chunk canaries.
//!
//! A canary is the zone secret XORed with the chunk's own address, so a
//! value read out of one chunk is useless for forging another chunk's.
//! It sits in the first and last word of every freed or permanently
//! retired chunk.

use crate::heap::config::CANARY_SIZE;
use crate::heap::diagnostic;

/// A failed canary comparison, for callers that scan rather than abort.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CanaryFault {
    /// Address of the mismatching canary word.
    pub at: usize,
    pub expected: u64,
    pub observed: u64,
}

#[inline]
pub fn compute(secret: u64, chunk: usize) -> u64 {
    secret ^ chunk as u64
}

/// Place the canary at both ends of the chunk.
///
/// # Safety
/// `chunk` must point to `chunk_size` writable bytes, `chunk_size` at
/// least two canary words, both ends word-aligned.
pub unsafe fn write(secret: u64, chunk: usize, chunk_size: usize) {
    let value = compute(secret, chunk);
    // SAFETY: per the contract, both words lie inside the chunk.
    unsafe {
        (chunk as *mut u64).write(value);
        ((chunk + chunk_size - CANARY_SIZE) as *mut u64).write(value);
    }
}

/// Zero both canary words before a previously freed chunk is handed out
/// again, so the caller sees plain uninitialized memory.
///
/// # Safety
/// Same contract as [`write`].
pub unsafe fn erase(chunk: usize, chunk_size: usize) {
    // SAFETY: per the contract, both words lie inside the chunk.
    unsafe {
        (chunk as *mut u64).write(0);
        ((chunk + chunk_size - CANARY_SIZE) as *mut u64).write(0);
    }
}

/// Compare both canary words, reporting the first mismatch instead of
/// aborting. Scanning paths that enumerate many chunks build on this.
///
/// # Safety
/// Same contract as [`write`], readable instead of writable.
pub unsafe fn try_check(secret: u64, chunk: usize, chunk_size: usize) -> Result<(), CanaryFault> {
    let expected = compute(secret, chunk);
    let tail = chunk + chunk_size - CANARY_SIZE;
    for at in [chunk, tail] {
        // SAFETY: per the contract, the word lies inside the chunk.
        let observed = unsafe { (at as *const u64).read() };
        if observed != expected {
            return Err(CanaryFault {
                at,
                expected,
                observed,
            });
        }
    }
    Ok(())
}

/// Enforcing check: a mismatch aborts with the zone index and both the
/// expected and observed values.
///
/// # Safety
/// Same contract as [`try_check`].
pub unsafe fn check(zone_index: u16, secret: u64, chunk: usize, chunk_size: usize) {
    // SAFETY: forwarded contract.
    if let Err(fault) = unsafe { try_check(secret, chunk, chunk_size) } {
        diagnostic::canary_mismatch(zone_index, fault.at, fault.expected, fault.observed);
    }
}
