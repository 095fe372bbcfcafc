//! The process-wide zone registry.
//!
//! One root exists per process, living in its own guard-page-bracketed
//! mapping. A single global lock serializes every public operation; the
//! lock word is a static next to the root pointer rather than a field
//! of the protectable mapping, so sealing the root can never corrupt
//! the lock itself — an allocation attempted while sealed faults on the
//! zone table instead.

use core::ptr;

use rand::SeedableRng;
use rand::rngs::SmallRng;
use spin::Mutex;

use crate::heap::config::{DEFAULT_ZONE_SIZES, MAX_ZONES};
use crate::heap::diagnostic;
use crate::heap::zone::Zone;
use crate::platform::{self, Protection};

#[repr(C)]
pub struct Root {
    pub zones: [Zone; MAX_ZONES],
    pub zones_used: usize,
    pub page_size: usize,
    /// XORed into zone indices exported to callers as opaque handles.
    pub handle_mask: u64,
    /// Weak PRNG for slot-position randomization only.
    pub rng: SmallRng,
}

struct RootCell(*mut Root);

// SAFETY: the cell is only reachable through the global lock, which
// serializes all access to the mapping it points at.
unsafe impl Send for RootCell {}

static ROOT: Mutex<RootCell> = Mutex::new(RootCell(ptr::null_mut()));

/// Run `f` on the root with the global lock held, constructing the root
/// first if this is the first use.
pub fn with_root<R>(f: impl FnOnce(&mut Root) -> R) -> R {
    let mut cell = ROOT.lock();
    if cell.0.is_null() {
        cell.0 = init_root();
    }
    // SAFETY: non-null and exclusively ours while the lock is held.
    f(unsafe { &mut *cell.0 })
}

fn root_len() -> usize {
    platform::round_to_pages(size_of::<Root>())
}

fn init_root() -> *mut Root {
    let page_size = platform::page_size();
    let root = platform::reserve_guarded(size_of::<Root>()) as *mut Root;

    // SAFETY: a zeroed mapping is a valid (if inert) Root; every write
    // below happens before the pointer escapes this function.
    let r = unsafe { &mut *root };
    r.zones_used = 0;
    r.page_size = page_size;
    r.handle_mask = platform::random_u64();
    r.rng = SmallRng::seed_from_u64(platform::clock_seed());

    for size in DEFAULT_ZONE_SIZES {
        create_zone(r, size, true);
    }

    log::info!(
        "heap initialized: {} default zones, page size {page_size}",
        DEFAULT_ZONE_SIZES.len()
    );
    root
}

/// Append a zone to the table. Aborts when the table is full.
pub fn create_zone(root: &mut Root, size: usize, internal: bool) -> u16 {
    if root.zones_used >= MAX_ZONES {
        diagnostic::zone_table_full();
    }
    let index = root.zones_used as u16;
    let zone = Zone::create(index, size, internal, &mut root.rng);
    root.zones[root.zones_used] = zone;
    root.zones_used += 1;
    index
}

/// Seal the root: its pages become inaccessible until
/// [`unprotect_root`], so stray writes into the registry fault.
pub fn protect_root() {
    let mut cell = ROOT.lock();
    if cell.0.is_null() {
        cell.0 = init_root();
    }
    platform::protect(cell.0 as *mut u8, root_len(), Protection::None);
}

pub fn unprotect_root() {
    let mut cell = ROOT.lock();
    if cell.0.is_null() {
        cell.0 = init_root();
        return;
    }
    platform::protect(cell.0 as *mut u8, root_len(), Protection::ReadWrite);
}

/// Verify every zone, release every zone, then the root itself. The
/// next heap operation after this starts from scratch.
///
/// # Safety
/// Every chunk the allocator ever handed out must be dead to its
/// users; their backing pages are gone after this returns.
pub unsafe fn teardown() {
    let mut cell = ROOT.lock();
    if cell.0.is_null() {
        return;
    }
    // SAFETY: non-null and exclusively ours while the lock is held.
    let root = unsafe { &mut *cell.0 };
    for i in 0..root.zones_used {
        root.zones[i].verify();
    }
    for i in 0..root.zones_used {
        root.zones[i].destroy();
    }
    // Unmap the root and its guards using the page size recorded at
    // init, not the platform cache.
    let page = root.page_size;
    let padded = (size_of::<Root>() + page - 1) & !(page - 1);
    // SAFETY: the root interior sits one page past the mapping base.
    let base = unsafe { (cell.0 as *mut u8).sub(page) };
    platform::release(base, padded + 2 * page);
    cell.0 = ptr::null_mut();
    log::info!("heap torn down");
}
