//! The allocator front end.
//!
//! Requests come in here, get routed to a size-classed zone, and leave
//! as chunk pointers. Every operation takes the global lock for its
//! whole duration and enforces the defense stack on the way through:
//! occupancy bits, canaries on reuse and on neighbors, poison on free.

pub mod config;
pub(crate) mod diagnostic;

mod bitmap;
mod canary;
mod root;
mod zone;

use core::ptr;

use rand::rngs::SmallRng;

use crate::heap::bitmap::{CHUNK_CARRIES_CANARY, CHUNK_IN_USE};
use crate::heap::config::{
    ALIGNMENT, BAD_SLOT, BitSlot, DEFAULT_ZONE_SIZES, POISON_BYTE, WASTED_MULTIPLIER, round_up,
};
use crate::heap::root::Root;
use crate::heap::zone::{Zone, ZoneFlags};

pub use crate::heap::root::{protect_root, teardown, unprotect_root};

/// The oversize screen only rejects zones for requests above this class.
const OVERSIZE_CHECK_FLOOR: usize = 1024;

/// An externally created zone, exported as an obfuscated index.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ZoneHandle(u64);

impl ZoneHandle {
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn into_raw(self) -> u64 {
        self.0
    }
}

/// Allocate `size` bytes from the smallest fitting size class.
///
/// Never returns null: any condition the allocator cannot satisfy is a
/// detected bug and aborts. The pointer is at least word-aligned and
/// backed by `chunk_size_of(p) >= size` bytes.
pub fn alloc(size: usize) -> *mut u8 {
    root::with_root(|r| alloc_in_root(r, size))
}

/// Allocate `nmemb * size` zeroed bytes. Aborts on product overflow.
pub fn calloc(nmemb: usize, size: usize) -> *mut u8 {
    let Some(total) = nmemb.checked_mul(size) else {
        diagnostic::calloc_overflow(nmemb, size);
    };
    let p = alloc(total);
    // SAFETY: the chunk backing p is at least `total` bytes.
    unsafe { ptr::write_bytes(p, 0, total) };
    p
}

/// Return a chunk to its zone.
///
/// Null is a no-op. The chunk body is poisoned, a fresh canary is
/// written at both ends, and the canaries of the address-adjacent
/// chunks are verified while we are here.
///
/// # Safety
/// `p` must be null or a live pointer from this allocator with no other
/// outstanding user. (A foreign or already-freed pointer aborts rather
/// than corrupting, but cannot be made safe.)
pub unsafe fn free(p: *mut u8) {
    free_inner(p, false)
}

/// Free `p` and retire its chunk as a permanent canary: it keeps its
/// canary forever and is never handed out again.
///
/// # Safety
/// Same contract as [`free`].
pub unsafe fn free_permanent(p: *mut u8) {
    free_inner(p, true)
}

/// Size class of the chunk backing `p`, for reallocation arithmetic.
/// Returns 0 for null; aborts for pointers the allocator never issued.
pub fn chunk_size_of(p: *const u8) -> usize {
    if p.is_null() {
        return 0;
    }
    root::with_root(|r| {
        let addr = p as usize;
        let Some(zi) = find_zone_range(r, addr) else {
            diagnostic::unknown_pointer(addr);
        };
        r.zones[zi].chunk_size
    })
}

/// Verify the canaries of every canary-bearing chunk in every zone.
/// Read-only; aborts on the first corruption found.
pub fn verify_all() {
    root::with_root(|r| {
        for i in 0..r.zones_used {
            r.zones[i].verify();
        }
    });
}

/// Create a caller-owned zone for `size`-byte chunks and export it as
/// an opaque handle. Such zones never satisfy a general [`alloc`].
pub fn new_zone(size: usize) -> ZoneHandle {
    root::with_root(|r| {
        let index = root::create_zone(r, size, false);
        ZoneHandle(u64::from(index) ^ r.handle_mask)
    })
}

/// Allocate from exactly the zone behind `handle`.
///
/// # Safety
/// `handle` must come from [`new_zone`] in this process and the zone
/// must not have been destroyed. (Stale handles abort.)
pub unsafe fn alloc_from_zone(handle: ZoneHandle, size: usize) -> *mut u8 {
    root::with_root(|r| {
        let zi = resolve_handle(r, handle);
        let Root { zones, rng, .. } = r;
        let zone = &mut zones[zi];
        if size > zone.chunk_size {
            diagnostic::oversized_request(size);
        }
        if !is_zone_usable(zone, rng, size) {
            diagnostic::no_free_slot(zone.index);
        }
        take_primed_chunk(zone)
    })
}

/// Retire the caller-owned zone behind `handle`. Its pages become
/// inaccessible and are never reused by the allocator.
///
/// # Safety
/// Same contract as [`alloc_from_zone`]; all chunks handed out of the
/// zone must be dead to their users.
pub unsafe fn destroy_zone(handle: ZoneHandle) {
    root::with_root(|r| {
        let zi = resolve_handle(r, handle);
        r.zones[zi].retire();
    });
}

fn resolve_handle(root: &Root, handle: ZoneHandle) -> usize {
    let index = (handle.0 ^ root.handle_mask) as usize;
    if index >= root.zones_used {
        diagnostic::bad_zone_handle(handle.0);
    }
    let flags = root.zones[index].flags;
    if flags.contains(ZoneFlags::INTERNAL) || flags.contains(ZoneFlags::RETIRED) {
        diagnostic::bad_zone_handle(handle.0);
    }
    index
}

fn alloc_in_root(root: &mut Root, size: usize) -> *mut u8 {
    let zi = match find_zone_fit(root, size) {
        Some(zi) => zi,
        // No existing zone fits; a brand-new right-sized one must.
        None => root::create_zone(root, size_class_for(size), true) as usize,
    };
    take_primed_chunk(&mut root.zones[zi])
}

/// Smallest default class holding `size`, or word-rounded above them.
fn size_class_for(size: usize) -> usize {
    for class in DEFAULT_ZONE_SIZES {
        if class >= size {
            return class;
        }
    }
    round_up(size, ALIGNMENT)
}

/// Linear scan for an internal, non-full zone of sufficient class that
/// passes the usability screen.
fn find_zone_fit(root: &mut Root, size: usize) -> Option<usize> {
    let Root {
        zones,
        zones_used,
        rng,
        ..
    } = root;
    for (zi, zone) in zones[..*zones_used].iter_mut().enumerate() {
        if zone.chunk_size < size
            || !zone.flags.contains(ZoneFlags::INTERNAL)
            || zone.flags.intersects(ZoneFlags::FULL | ZoneFlags::RETIRED)
        {
            continue;
        }
        if is_zone_usable(zone, rng, size) {
            return Some(zi);
        }
    }
    None
}

/// Prime the zone's `next_free_slot` if any path can produce one:
/// the already-primed slot, the cache (refilled if dry), the fast word
/// scan, then the slow group scan. A zone that fails all of them is
/// marked full.
fn is_zone_usable(zone: &mut Zone, rng: &mut SmallRng, size: usize) -> bool {
    if zone.next_free_slot != BAD_SLOT {
        return true;
    }
    // A massively oversized zone would waste most of each chunk; force
    // creation of a right-sized zone for large requests instead.
    if size > OVERSIZE_CHECK_FLOOR && zone.chunk_size >= size.saturating_mul(WASTED_MULTIPLIER) {
        return false;
    }
    let r = zone.regions();
    let bm = r.bitmap_start as *mut u64;
    let chunks = zone.chunks;
    if zone.cache.is_empty() {
        // SAFETY: the bitmap covers `chunks` groups.
        unsafe { zone.cache.refill(bm, chunks, rng) };
    }
    let mut slot = zone.cache.pop();
    if slot == BAD_SLOT {
        // SAFETY: the bitmap covers `chunks` groups.
        slot = unsafe { bitmap::fast_scan(bm as *const u32, chunks) };
    }
    if slot == BAD_SLOT {
        // SAFETY: the bitmap covers `chunks` groups.
        slot = unsafe { bitmap::slow_scan(bm, chunks) };
    }
    if slot == BAD_SLOT {
        zone.flags.insert(ZoneFlags::FULL);
        return false;
    }
    zone.next_free_slot = slot;
    true
}

/// Turn the primed slot into a live chunk pointer, validating the slot
/// range, the occupancy bits, and (for reused chunks) the canary.
fn take_primed_chunk(zone: &mut Zone) -> *mut u8 {
    let slot = zone.next_free_slot;
    if slot == BAD_SLOT {
        diagnostic::no_free_slot(zone.index);
    }
    let r = zone.regions();
    let chunk = r.user_start + (slot / 2) as usize * zone.chunk_size;
    if chunk < r.user_start || chunk + zone.chunk_size > r.user_end {
        diagnostic::chunk_out_of_range(zone.index, chunk);
    }
    let bm = r.bitmap_start as *mut u64;
    // SAFETY: the slot was just range-checked against the user region.
    let bits = unsafe { bitmap::read_group(bm, slot) };
    if bits & CHUNK_IN_USE != 0 {
        diagnostic::group_corrupt(zone.index, slot, bits);
    }
    if bits & CHUNK_CARRIES_CANARY != 0 {
        // The chunk was freed earlier; its canary must have survived,
        // and must not leak into the fresh allocation.
        // SAFETY: chunk is in range and holds two canary words.
        unsafe {
            canary::check(zone.index, zone.secret(), chunk, zone.chunk_size);
            canary::erase(chunk, zone.chunk_size);
        }
    }
    // SAFETY: slot is in range.
    unsafe { bitmap::write_group(bm, slot, CHUNK_IN_USE) };
    zone.next_free_slot = BAD_SLOT;
    chunk as *mut u8
}

fn free_inner(p: *mut u8, permanent: bool) {
    if p.is_null() {
        return;
    }
    root::with_root(|r| {
        let addr = p as usize;
        let Some(zi) = find_zone_range(r, addr) else {
            diagnostic::unknown_pointer(addr);
        };
        free_in_zone(&mut r.zones[zi], addr, permanent);
    });
}

/// The zone whose user region brackets `addr`. Retired zones are
/// excluded; a pointer into one is reported as unknown rather than
/// touching unmapped pages.
fn find_zone_range(root: &Root, addr: usize) -> Option<usize> {
    (0..root.zones_used)
        .find(|&i| !root.zones[i].flags.contains(ZoneFlags::RETIRED) && root.zones[i].contains(addr))
}

fn free_in_zone(zone: &mut Zone, addr: usize, permanent: bool) {
    let r = zone.regions();
    let offset = addr - r.user_start;
    if addr % ALIGNMENT != 0 || offset % zone.chunk_size != 0 {
        diagnostic::misaligned_free(zone.index, addr, zone.chunk_size);
    }
    let chunk_number = offset / zone.chunk_size;
    let slot = chunk_number as BitSlot * 2;
    let bm = r.bitmap_start as *mut u64;
    // SAFETY: the slot derives from an address inside the user region.
    let bits = unsafe { bitmap::read_group(bm, slot) };
    if bits & CHUNK_IN_USE == 0 {
        diagnostic::double_free(zone.index, addr, slot);
    }
    let bits = if permanent {
        // Keep the in-use bit: the chunk becomes a permanent canary.
        CHUNK_IN_USE | CHUNK_CARRIES_CANARY
    } else {
        CHUNK_CARRIES_CANARY
    };
    // SAFETY: slot is in range.
    unsafe { bitmap::write_group(bm, slot, bits) };

    // SAFETY: the chunk is ours again; poison the whole body, then lay
    // the canary over both ends.
    unsafe {
        ptr::write_bytes(addr as *mut u8, POISON_BYTE, zone.chunk_size);
        canary::write(zone.secret(), addr, zone.chunk_size);
    }

    // Freeing is the one moment we touch this neighborhood; verify the
    // canaries next door while their corruption is still attributable.
    for neighbor in [chunk_number.wrapping_sub(1), chunk_number + 1] {
        if neighbor >= zone.chunks {
            continue;
        }
        // SAFETY: neighbor is a valid chunk index.
        let nbits = unsafe { bitmap::read_group(bm, neighbor as BitSlot * 2) };
        if nbits & CHUNK_CARRIES_CANARY != 0 {
            // SAFETY: the neighbor chunk is inside the user region.
            unsafe {
                canary::check(
                    zone.index,
                    zone.secret(),
                    r.user_start + neighbor * zone.chunk_size,
                    zone.chunk_size,
                );
            }
        }
    }

    if !permanent {
        zone.cache.insert(slot, zone.index);
        zone.flags.remove(ZoneFlags::FULL);
    }
}
