//! Zones: size-classed backing regions.
//!
//! A zone pairs a fixed-size user region with a bitmap tracking the
//! state of each chunk, both bracketed by inaccessible guard pages.
//! The header's four region pointers are stored XORed with a per-zone
//! mask at all times; [`Zone::regions`] decodes them by value, so no
//! control path ever leaves a plain address in the header.

use bitflags::bitflags;
use rand::Rng;
use rand::rngs::SmallRng;

use crate::heap::bitmap::{self, SlotCache};
use crate::heap::canary;
use crate::heap::config::{
    ALIGNMENT, BitSlot, CANARY_COUNT_DIV, DEFAULT_ZONE_SIZES, ZONE_USER_SIZE, round_up,
};
use crate::heap::diagnostic;
use crate::platform::{self, Advice, Protection};

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct ZoneFlags: u32 {
        /// Created by the allocator for a default size class. Zones
        /// without this flag are caller-owned and never satisfy a
        /// general allocation.
        const INTERNAL = 1 << 0;
        /// Hint that the last exhaustive search found nothing; cleared
        /// by the next free.
        const FULL = 1 << 1;
        /// Caller-owned zone whose pages were made inaccessible. The
        /// header survives so stale references fail loudly.
        const RETIRED = 1 << 2;
    }
}

/// Decoded region addresses, only ever held by value on the stack.
#[derive(Clone, Copy)]
pub struct Regions {
    pub bitmap_start: usize,
    pub bitmap_end: usize,
    pub user_start: usize,
    pub user_end: usize,
}

/// The masked form as it sits in the zone header.
#[repr(C)]
struct MaskedRegions {
    bitmap_start: usize,
    bitmap_end: usize,
    user_start: usize,
    user_end: usize,
}

impl MaskedRegions {
    fn encode(mask: u64, r: Regions) -> Self {
        let m = mask as usize;
        Self {
            bitmap_start: r.bitmap_start ^ m,
            bitmap_end: r.bitmap_end ^ m,
            user_start: r.user_start ^ m,
            user_end: r.user_end ^ m,
        }
    }

    fn decode(&self, mask: u64) -> Regions {
        let m = mask as usize;
        Regions {
            bitmap_start: self.bitmap_start ^ m,
            bitmap_end: self.bitmap_end ^ m,
            user_start: self.user_start ^ m,
            user_end: self.user_end ^ m,
        }
    }
}

#[repr(C)]
pub struct Zone {
    pub index: u16,
    pub flags: ZoneFlags,
    pub chunk_size: usize,
    /// `ZONE_USER_SIZE / chunk_size`, the number of two-bit groups.
    pub chunks: usize,
    /// Bytes of bitmap actually covering groups, before page padding.
    pub bitmap_size: usize,
    canary_secret: u64,
    pointer_mask: u64,
    masked: MaskedRegions,
    pub cache: SlotCache,
    pub next_free_slot: BitSlot,
}

impl Zone {
    /// Build a zone for `size`-byte chunks. `size` is rounded up to the
    /// smallest default class at minimum, or to the word alignment
    /// above the largest class.
    pub fn create(index: u16, size: usize, internal: bool, rng: &mut SmallRng) -> Zone {
        let chunk_size = round_up(size.max(DEFAULT_ZONE_SIZES[0]), ALIGNMENT);
        if chunk_size > ZONE_USER_SIZE {
            diagnostic::oversized_request(size);
        }
        let chunks = ZONE_USER_SIZE / chunk_size;
        let bitmap_size = (chunks * 2).div_ceil(8);

        let bitmap_start = platform::reserve_guarded(bitmap_size) as usize;
        let padded = platform::round_to_pages(bitmap_size);
        platform::advise(bitmap_start as *mut u8, padded, Advice::WillNeed);
        platform::advise(bitmap_start as *mut u8, padded, Advice::Sequential);

        let user_start = platform::reserve_guarded(ZONE_USER_SIZE) as usize;
        platform::advise(user_start as *mut u8, ZONE_USER_SIZE, Advice::WillNeed);
        platform::advise(user_start as *mut u8, ZONE_USER_SIZE, Advice::Random);

        let canary_secret = platform::random_u64();
        let pointer_mask = platform::random_u64();

        let bm = bitmap_start as *mut u64;
        if chunk_size <= DEFAULT_ZONE_SIZES[DEFAULT_ZONE_SIZES.len() - 1] {
            // Seed permanent canary chunks across the zone. Colliding
            // draws just seed the same chunk twice.
            for _ in 0..chunks / CANARY_COUNT_DIV {
                let chunk = rng.random_range(0..chunks);
                let slot = chunk as BitSlot * 2;
                // SAFETY: slot indexes one of the zone's groups.
                unsafe {
                    bitmap::write_group(
                        bm,
                        slot,
                        bitmap::CHUNK_IN_USE | bitmap::CHUNK_CARRIES_CANARY,
                    );
                }
                // SAFETY: the chunk lies in the fresh user region and
                // holds at least two canary words.
                unsafe { canary::write(canary_secret, user_start + chunk * chunk_size, chunk_size) };
            }
        }

        let mut cache = SlotCache::new();
        // SAFETY: the bitmap covers `chunks` groups.
        unsafe { cache.refill(bm, chunks, rng) };
        let next_free_slot = cache.pop();

        let mut flags = ZoneFlags::empty();
        if internal {
            flags |= ZoneFlags::INTERNAL;
        }

        log::debug!("zone {index}: chunk_size={chunk_size} chunks={chunks} internal={internal}");

        Zone {
            index,
            flags,
            chunk_size,
            chunks,
            bitmap_size,
            canary_secret,
            pointer_mask,
            masked: MaskedRegions::encode(
                pointer_mask,
                Regions {
                    bitmap_start,
                    bitmap_end: bitmap_start + bitmap_size,
                    user_start,
                    user_end: user_start + ZONE_USER_SIZE,
                },
            ),
            cache,
            next_free_slot,
        }
    }

    pub fn regions(&self) -> Regions {
        self.masked.decode(self.pointer_mask)
    }

    pub fn secret(&self) -> u64 {
        self.canary_secret
    }

    pub fn contains(&self, addr: usize) -> bool {
        let r = self.regions();
        addr >= r.user_start && addr < r.user_end
    }

    /// Walk every group; each canary-bearing chunk must hold an intact
    /// canary at both ends. Aborts on the first mismatch. Retired zones
    /// are skipped: their pages are gone.
    pub fn verify(&self) {
        if self.flags.contains(ZoneFlags::RETIRED) {
            return;
        }
        let r = self.regions();
        let bm = r.bitmap_start as *const u64;
        for chunk in 0..self.chunks {
            let slot = chunk as BitSlot * 2;
            // SAFETY: slot indexes one of the zone's groups.
            let bits = unsafe { bitmap::read_group(bm, slot) };
            if bits & bitmap::CHUNK_CARRIES_CANARY != 0 {
                // SAFETY: the chunk lies in the user region.
                unsafe {
                    canary::check(
                        self.index,
                        self.canary_secret,
                        r.user_start + chunk * self.chunk_size,
                        self.chunk_size,
                    );
                }
            }
        }
    }

    /// Retire a caller-owned zone without returning its pages: both
    /// regions become inaccessible so any stale access faults, and the
    /// header stays behind flagged [`ZoneFlags::RETIRED`].
    pub fn retire(&mut self) {
        let r = self.regions();
        let page = platform::page_size();
        let user_len = r.user_end - r.user_start;
        platform::advise(r.user_start as *mut u8, user_len, Advice::DontNeed);
        let bitmap_padded = platform::round_to_pages(self.bitmap_size);
        // Cover the guards too; they are already inaccessible.
        platform::protect(
            (r.bitmap_start - page) as *mut u8,
            bitmap_padded + 2 * page,
            Protection::None,
        );
        platform::protect(
            (r.user_start - page) as *mut u8,
            user_len + 2 * page,
            Protection::None,
        );
        self.flags.insert(ZoneFlags::RETIRED | ZoneFlags::FULL);
        log::debug!("zone {} retired", self.index);
    }

    /// Tear the zone down. Internal zones give their pages back and the
    /// header is zeroed so stale handles fault cleanly; caller-owned
    /// zones are retired instead.
    pub fn destroy(&mut self) {
        if self.flags.contains(ZoneFlags::RETIRED) {
            return;
        }
        if !self.flags.contains(ZoneFlags::INTERNAL) {
            self.retire();
            return;
        }
        let r = self.regions();
        platform::release_guarded(r.bitmap_start as *mut u8, r.bitmap_end - r.bitmap_start);
        platform::release_guarded(r.user_start as *mut u8, r.user_end - r.user_start);
        log::debug!("zone {} destroyed", self.index);
        // SAFETY: every field is plain data; a zeroed header is inert.
        unsafe { core::ptr::write_bytes(self as *mut Zone as *mut u8, 0, size_of::<Zone>()) };
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;

    use super::*;
    use crate::heap::config::BAD_SLOT;

    #[test]
    fn create_verify_destroy() {
        let mut rng = SmallRng::seed_from_u64(99);
        let mut zone = Zone::create(7, 64, true, &mut rng);
        assert_eq!(zone.chunk_size, 64);
        assert_eq!(zone.chunks, ZONE_USER_SIZE / 64);
        assert_eq!(zone.bitmap_size, zone.chunks * 2 / 8);
        let r = zone.regions();
        assert_eq!(r.user_end - r.user_start, ZONE_USER_SIZE);
        assert_eq!(r.bitmap_end - r.bitmap_start, zone.bitmap_size);
        assert_ne!(zone.next_free_slot, BAD_SLOT);
        assert!(zone.flags.contains(ZoneFlags::INTERNAL));
        // Fresh zones verify clean: seeded canary chunks are intact.
        zone.verify();
        // Nothing reads as live yet; every group is either untouched or
        // a seeded permanent canary.
        let bm = r.bitmap_start as *const u64;
        for chunk in 0..zone.chunks {
            let bits = unsafe { bitmap::read_group(bm, chunk as BitSlot * 2) };
            assert_ne!(bits, bitmap::CHUNK_IN_USE);
        }
        zone.destroy();
    }

    #[test]
    fn rounds_small_sizes_to_min_class() {
        let mut rng = SmallRng::seed_from_u64(3);
        let mut zone = Zone::create(0, 1, true, &mut rng);
        assert_eq!(zone.chunk_size, DEFAULT_ZONE_SIZES[0]);
        zone.destroy();
    }

    #[test]
    fn region_pointers_are_masked_in_the_header() {
        let mut rng = SmallRng::seed_from_u64(11);
        let mut zone = Zone::create(1, 256, true, &mut rng);
        let r = zone.regions();
        // The raw header words must not equal the decoded addresses.
        assert_ne!(zone.masked.user_start, r.user_start);
        assert_ne!(zone.masked.bitmap_start, r.bitmap_start);
        zone.destroy();
    }
}
