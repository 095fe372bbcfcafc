//! C ABI over the palisade heap, in libc malloc's shape.
//!
//! Chunks never move, so `palisade_realloc` is allocate-copy-free with
//! the copy length taken from the old chunk's size class.

#![cfg_attr(not(test), no_std)]

use core::ffi::c_void;

use palisade::heap;

#[unsafe(no_mangle)]
pub extern "C" fn palisade_malloc(size: usize) -> *mut c_void {
    heap::alloc(size) as *mut c_void
}

#[unsafe(no_mangle)]
pub extern "C" fn palisade_calloc(nmemb: usize, size: usize) -> *mut c_void {
    heap::calloc(nmemb, size) as *mut c_void
}

/// # Safety
/// `p` must be null or a live pointer from this allocator.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn palisade_free(p: *mut c_void) {
    // SAFETY: forwarded contract.
    unsafe { heap::free(p as *mut u8) }
}

/// # Safety
/// Same contract as [`palisade_free`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn palisade_free_permanent(p: *mut c_void) {
    // SAFETY: forwarded contract.
    unsafe { heap::free_permanent(p as *mut u8) }
}

/// # Safety
/// Same contract as [`palisade_free`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn palisade_realloc(p: *mut c_void, size: usize) -> *mut c_void {
    if p.is_null() {
        return palisade_malloc(size);
    }
    if size == 0 {
        // SAFETY: forwarded contract.
        unsafe { heap::free(p as *mut u8) };
        return core::ptr::null_mut();
    }
    let old_size = heap::chunk_size_of(p as *const u8);
    let fresh = heap::alloc(size);
    let copy = old_size.min(size);
    // SAFETY: both chunks are live and at least `copy` bytes long; a
    // fresh chunk never aliases a live one.
    unsafe { core::ptr::copy_nonoverlapping(p as *const u8, fresh, copy) };
    // SAFETY: forwarded contract.
    unsafe { heap::free(p as *mut u8) };
    fresh as *mut c_void
}

#[unsafe(no_mangle)]
pub extern "C" fn palisade_chunk_size(p: *const c_void) -> usize {
    heap::chunk_size_of(p as *const u8)
}

#[unsafe(no_mangle)]
pub extern "C" fn palisade_verify() {
    heap::verify_all();
}

#[unsafe(no_mangle)]
pub extern "C" fn palisade_protect_root() {
    heap::protect_root();
}

#[unsafe(no_mangle)]
pub extern "C" fn palisade_unprotect_root() {
    heap::unprotect_root();
}

#[unsafe(no_mangle)]
pub extern "C" fn palisade_new_zone(size: usize) -> u64 {
    heap::new_zone(size).into_raw()
}

/// # Safety
/// `handle` must come from [`palisade_new_zone`] in this process.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn palisade_zone_malloc(handle: u64, size: usize) -> *mut c_void {
    // SAFETY: forwarded contract.
    unsafe { heap::alloc_from_zone(heap::ZoneHandle::from_raw(handle), size) as *mut c_void }
}

/// # Safety
/// Same contract as [`palisade_zone_malloc`]; every chunk from the zone
/// must be dead to its users.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn palisade_zone_destroy(handle: u64) {
    // SAFETY: forwarded contract.
    unsafe { heap::destroy_zone(heap::ZoneHandle::from_raw(handle)) }
}

#[cfg(not(test))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    // SAFETY: abort never returns.
    unsafe { libc::abort() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn realloc_preserves_content_across_classes() {
        let p = palisade_malloc(16);
        unsafe {
            std::ptr::copy_nonoverlapping(b"palisade-growth!".as_ptr(), p as *mut u8, 16);
            let q = palisade_realloc(p, 5000);
            assert!(palisade_chunk_size(q) >= 5000);
            let mut copied = [0u8; 16];
            std::ptr::copy_nonoverlapping(q as *const u8, copied.as_mut_ptr(), 16);
            assert_eq!(&copied, b"palisade-growth!");
            palisade_free(q);
        }
        palisade_verify();
    }

    #[test]
    fn realloc_of_null_allocates_and_to_zero_frees() {
        unsafe {
            let p = palisade_realloc(std::ptr::null_mut(), 64);
            assert!(!p.is_null());
            assert!(palisade_realloc(p, 0).is_null());
        }
        palisade_verify();
    }
}
