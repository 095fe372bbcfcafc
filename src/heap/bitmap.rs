//! Two-bit chunk occupancy and the per-zone free-slot cache.
//!
//! Each chunk owns a two-bit group in allocation order. Bit 0 of the
//! group is the in-use bit; bit 1 marks a chunk that carries a canary
//! (freed at least once, or retired as a permanent canary):
//!
//! | in-use | canary | meaning                                  |
//! |--------|--------|------------------------------------------|
//! |   0    |   0    | never allocated                          |
//! |   1    |   0    | live                                     |
//! |   0    |   1    | freed, canary at both ends, reusable     |
//! |   1    |   1    | permanent canary, never handed out       |

use rand::Rng;
use rand::rngs::SmallRng;

use crate::heap::config::{BAD_SLOT, BIT_SLOT_CACHE_SZ, BitSlot};
use crate::heap::diagnostic;

/// In-use flag within a two-bit group.
pub const CHUNK_IN_USE: u8 = 0b01;
/// Canary-bearing flag within a two-bit group.
pub const CHUNK_CARRIES_CANARY: u8 = 0b10;

/// Read the two-bit group starting at `slot`.
///
/// # Safety
/// `bitmap` must cover `slot`; `slot` must be even.
pub unsafe fn read_group(bitmap: *const u64, slot: BitSlot) -> u8 {
    let word = (slot / 64) as usize;
    let shift = (slot % 64) as u32;
    // SAFETY: the caller guarantees the word is in range.
    let w = unsafe { bitmap.add(word).read() };
    ((w >> shift) & 0b11) as u8
}

/// Overwrite the two-bit group starting at `slot`.
///
/// # Safety
/// Same contract as [`read_group`], writable.
pub unsafe fn write_group(bitmap: *mut u64, slot: BitSlot, bits: u8) {
    let word = (slot / 64) as usize;
    let shift = (slot % 64) as u32;
    // SAFETY: the caller guarantees the word is in range.
    unsafe {
        let p = bitmap.add(word);
        let w = p.read();
        p.write((w & !(0b11u64 << shift)) | (u64::from(bits & 0b11) << shift));
    }
}

/// Walk full 32-bit words; any word of sixteen never-touched chunks
/// yields its first slot. Partial tail words are left to [`slow_scan`].
///
/// # Safety
/// `bitmap` must cover `chunks` two-bit groups.
pub unsafe fn fast_scan(bitmap: *const u32, chunks: usize) -> BitSlot {
    let full_words = chunks * 2 / 32;
    for w in 0..full_words {
        // SAFETY: w indexes a full word within the bitmap.
        if unsafe { bitmap.add(w).read() } == 0 {
            return w as BitSlot * 32;
        }
    }
    BAD_SLOT
}

/// Walk group by group for the first chunk whose in-use bit is clear.
///
/// # Safety
/// `bitmap` must cover `chunks` two-bit groups.
pub unsafe fn slow_scan(bitmap: *const u64, chunks: usize) -> BitSlot {
    for chunk in 0..chunks {
        let slot = chunk as BitSlot * 2;
        // SAFETY: slot is within the bitmap.
        if unsafe { read_group(bitmap, slot) } & CHUNK_IN_USE == 0 {
            return slot;
        }
    }
    BAD_SLOT
}

/// Fixed-depth cache of precomputed free slots.
///
/// Not circular: the consumer chases the producer until a refill resets
/// both. A full cache drops insertions; the dropped slot is found again
/// by a later scan or refill.
#[repr(C)]
pub struct SlotCache {
    slots: [BitSlot; BIT_SLOT_CACHE_SZ],
    write: usize,
    read: usize,
}

impl SlotCache {
    pub const fn new() -> Self {
        Self {
            slots: [BAD_SLOT; BIT_SLOT_CACHE_SZ],
            write: 0,
            read: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.read >= self.write
    }

    /// Hand out the slot at the consumer index, overwriting the entry
    /// with [`BAD_SLOT`]. Returns [`BAD_SLOT`] when exhausted.
    pub fn pop(&mut self) -> BitSlot {
        if self.read >= BIT_SLOT_CACHE_SZ {
            return BAD_SLOT;
        }
        let slot = self.slots[self.read];
        self.slots[self.read] = BAD_SLOT;
        if slot != BAD_SLOT {
            self.read += 1;
        }
        slot
    }

    /// Record a freed slot for reuse. A slot already present between the
    /// consumer index and the end of the cache means the same chunk was
    /// freed into the cache twice; that is metadata corruption.
    pub fn insert(&mut self, slot: BitSlot, zone_index: u16) {
        for i in self.read..BIT_SLOT_CACHE_SZ {
            if self.slots[i] == slot {
                diagnostic::slot_cache_duplicate(zone_index, slot);
            }
        }
        if self.write >= BIT_SLOT_CACHE_SZ {
            return;
        }
        self.slots[self.write] = slot;
        self.write += 1;
    }

    /// Rebuild the cache from the bitmap. Starts at a random word within
    /// the first quarter so allocation order is not predictable from the
    /// front of the zone.
    ///
    /// # Safety
    /// `bitmap` must cover `chunks` two-bit groups.
    pub unsafe fn refill(&mut self, bitmap: *const u64, chunks: usize, rng: &mut SmallRng) {
        self.slots = [BAD_SLOT; BIT_SLOT_CACHE_SZ];
        self.read = 0;
        self.write = 0;

        let total_bits = chunks as BitSlot * 2;
        let words = total_bits.div_ceil(64) as usize;
        if words == 0 {
            return;
        }
        let start = rng.random_range(0..(words / 4).max(1));

        let mut filled = 0;
        'words: for w in start..words {
            // SAFETY: w < words, within the bitmap.
            let word = unsafe { bitmap.add(w).read() };
            let mut bit = 0;
            while bit < 64 {
                let slot = w as BitSlot * 64 + bit;
                if slot >= total_bits {
                    break 'words;
                }
                if (word >> bit) & u64::from(CHUNK_IN_USE) == 0 {
                    self.slots[filled] = slot;
                    filled += 1;
                    if filled == BIT_SLOT_CACHE_SZ {
                        break 'words;
                    }
                }
                bit += 2;
            }
        }
        self.write = filled;
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;

    use super::*;

    #[test]
    fn group_read_back() {
        let mut words = [0u64; 2];
        let bm = words.as_mut_ptr();
        unsafe {
            write_group(bm, 0, CHUNK_IN_USE);
            write_group(bm, 62, CHUNK_IN_USE | CHUNK_CARRIES_CANARY);
            write_group(bm, 64, CHUNK_CARRIES_CANARY);
            assert_eq!(read_group(bm, 0), CHUNK_IN_USE);
            assert_eq!(read_group(bm, 2), 0);
            assert_eq!(read_group(bm, 62), CHUNK_IN_USE | CHUNK_CARRIES_CANARY);
            assert_eq!(read_group(bm, 64), CHUNK_CARRIES_CANARY);
            // Clearing leaves the neighbors alone.
            write_group(bm, 62, 0);
            assert_eq!(read_group(bm, 62), 0);
            assert_eq!(read_group(bm, 0), CHUNK_IN_USE);
            assert_eq!(read_group(bm, 64), CHUNK_CARRIES_CANARY);
        }
    }

    #[test]
    fn scans_respect_occupancy() {
        let mut words = [0u64; 4];
        let bm = words.as_mut_ptr();
        unsafe {
            // Mark the first 32 chunks live so the first 32-bit word is dense.
            for chunk in 0..32u64 {
                write_group(bm, chunk * 2, CHUNK_IN_USE);
            }
            assert_eq!(fast_scan(bm as *const u32, 128), 64);
            assert_eq!(slow_scan(bm, 128), 64);
            write_group(bm, 64, CHUNK_IN_USE);
            assert_eq!(slow_scan(bm, 128), 66);
            // A freed chunk is a candidate for the slow scan.
            write_group(bm, 4, CHUNK_CARRIES_CANARY);
            assert_eq!(slow_scan(bm, 128), 4);
        }
    }

    #[test]
    fn scans_stay_within_chunk_count() {
        let mut words = [0u64; 1];
        let bm = words.as_mut_ptr();
        unsafe {
            for chunk in 0..3u64 {
                write_group(bm, chunk * 2, CHUNK_IN_USE);
            }
            // Bits past the third group are zero but out of range.
            assert_eq!(fast_scan(bm as *const u32, 3), BAD_SLOT);
            assert_eq!(slow_scan(bm, 3), BAD_SLOT);
        }
    }

    #[test]
    fn cache_pop_consumes_in_order() {
        let mut cache = SlotCache::new();
        cache.insert(10, 0);
        cache.insert(42, 0);
        assert!(!cache.is_empty());
        assert_eq!(cache.pop(), 10);
        assert_eq!(cache.pop(), 42);
        assert!(cache.is_empty());
        assert_eq!(cache.pop(), BAD_SLOT);
    }

    #[test]
    fn cache_drops_inserts_when_full() {
        let mut cache = SlotCache::new();
        for slot in 0..BIT_SLOT_CACHE_SZ as BitSlot {
            cache.insert(slot * 2, 0);
        }
        cache.insert(9999, 0);
        let mut drained = 0;
        while cache.pop() != BAD_SLOT {
            drained += 1;
        }
        assert_eq!(drained, BIT_SLOT_CACHE_SZ);
    }

    #[test]
    fn refill_collects_only_free_groups() {
        let chunks = 64;
        let mut words = [0u64; 2];
        let bm = words.as_mut_ptr();
        let mut rng = SmallRng::seed_from_u64(7);
        unsafe {
            for chunk in [3u64, 17, 40] {
                write_group(bm, chunk * 2, CHUNK_IN_USE);
            }
            let mut cache = SlotCache::new();
            cache.refill(bm, chunks, &mut rng);
            let mut seen = [false; 64];
            loop {
                let slot = cache.pop();
                if slot == BAD_SLOT {
                    break;
                }
                assert_eq!(slot % 2, 0);
                seen[(slot / 2) as usize] = true;
            }
            for taken in [3, 17, 40] {
                assert!(!seen[taken]);
            }
            assert_eq!(seen.iter().filter(|&&s| s).count(), 61);
        }
    }
}
