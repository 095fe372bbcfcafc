//! Virtual-memory and process primitives the allocator is built on.
//!
//! Everything here treats failure as fatal: once the kernel refuses to
//! map or protect pages for us, the process has no meaningful way to
//! continue, so the caller gets a diagnostic and an abort instead of an
//! error value.

use core::ptr;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::heap::diagnostic;

/// Page protection modes the allocator uses.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    None,
    ReadWrite,
}

/// Access-pattern hints forwarded to `madvise`. Best effort only.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum Advice {
    WillNeed,
    Sequential,
    Random,
    DontNeed,
}

static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

pub fn page_size() -> usize {
    let cached = PAGE_SIZE.load(Ordering::Relaxed);
    if cached != 0 {
        return cached;
    }
    // SAFETY: sysconf has no memory preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
    PAGE_SIZE.store(size, Ordering::Relaxed);
    size
}

/// Round `n` up to a whole number of pages.
pub fn round_to_pages(n: usize) -> usize {
    let page = page_size();
    (n + page - 1) & !(page - 1)
}

/// Obtain an anonymous private read/write mapping of at least `n` bytes.
pub fn reserve_rw(n: usize) -> *mut u8 {
    let len = round_to_pages(n);
    // SAFETY: anonymous mapping, no fd, kernel picks the address.
    let p = unsafe {
        libc::mmap(
            ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if p == libc::MAP_FAILED {
        diagnostic::vm_failure("mmap", 0, len);
    }
    p as *mut u8
}

pub fn protect(p: *mut u8, n: usize, mode: Protection) {
    let prot = match mode {
        Protection::None => libc::PROT_NONE,
        Protection::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
    };
    // SAFETY: the caller passes a region it obtained from reserve_rw.
    if unsafe { libc::mprotect(p as *mut libc::c_void, n, prot) } != 0 {
        diagnostic::vm_failure("mprotect", p as usize, n);
    }
}

pub fn advise(p: *mut u8, n: usize, hint: Advice) {
    let advice = match hint {
        Advice::WillNeed => libc::MADV_WILLNEED,
        Advice::Sequential => libc::MADV_SEQUENTIAL,
        Advice::Random => libc::MADV_RANDOM,
        Advice::DontNeed => libc::MADV_DONTNEED,
    };
    // SAFETY: hints never invalidate memory; the kernel may ignore them.
    unsafe { libc::madvise(p as *mut libc::c_void, n, advice) };
}

pub fn release(p: *mut u8, n: usize) {
    // SAFETY: the caller passes a region it obtained from reserve_rw.
    if unsafe { libc::munmap(p as *mut libc::c_void, n) } != 0 {
        diagnostic::vm_failure("munmap", p as usize, n);
    }
}

/// Map `n` usable bytes bracketed by one inaccessible page on each side.
/// Returns the start of the usable interior.
pub fn reserve_guarded(n: usize) -> *mut u8 {
    let page = page_size();
    let padded = round_to_pages(n);
    let base = reserve_rw(padded + 2 * page);
    protect(base, page, Protection::None);
    // SAFETY: base + page + padded is the final page of the mapping.
    protect(unsafe { base.add(page + padded) }, page, Protection::None);
    // SAFETY: base + page is within the mapping.
    unsafe { base.add(page) }
}

/// Unmap a region obtained from `reserve_guarded`, guards included.
pub fn release_guarded(interior: *mut u8, n: usize) {
    let page = page_size();
    let padded = round_to_pages(n);
    // SAFETY: interior sits one page past the mapping base.
    let base = unsafe { interior.sub(page) };
    release(base, padded + 2 * page);
}

/// Fill `buf` from the OS entropy pool. Used for canary secrets and
/// pointer masks, which must not come from the slot-shuffling PRNG.
#[cfg(target_os = "linux")]
pub fn fill_random(buf: &mut [u8]) {
    let mut done = 0;
    while done < buf.len() {
        // SAFETY: the remainder of buf is valid writable memory.
        let n = unsafe {
            libc::getrandom(
                buf[done..].as_mut_ptr() as *mut libc::c_void,
                buf.len() - done,
                0,
            )
        };
        if n < 0 {
            diagnostic::vm_failure("getrandom", 0, buf.len());
        }
        done += n as usize;
    }
}

#[cfg(target_os = "macos")]
pub fn fill_random(buf: &mut [u8]) {
    // getentropy caps a single request at 256 bytes.
    for chunk in buf.chunks_mut(256) {
        // SAFETY: chunk is valid writable memory of len <= 256.
        if unsafe { libc::getentropy(chunk.as_mut_ptr() as *mut libc::c_void, chunk.len()) } != 0 {
            diagnostic::vm_failure("getentropy", 0, chunk.len());
        }
    }
}

pub fn random_u64() -> u64 {
    let mut buf = [0u8; 8];
    fill_random(&mut buf);
    u64::from_ne_bytes(buf)
}

fn time_of_day() -> (u64, u64) {
    let mut tv = libc::timeval {
        tv_sec: 0,
        tv_usec: 0,
    };
    // SAFETY: tv is a valid out-pointer; a null timezone is permitted.
    unsafe { libc::gettimeofday(&mut tv, ptr::null_mut()) };
    (tv.tv_sec as u64, tv.tv_usec as u64)
}

/// Seed for the slot-shuffling PRNG: two time-of-day samples mixed with
/// the pid. Deliberately weak; nothing secret may be derived from it.
pub fn clock_seed() -> u64 {
    let (s1, u1) = time_of_day();
    let (s2, u2) = time_of_day();
    // SAFETY: getpid has no preconditions.
    let pid = unsafe { libc::getpid() } as u64;
    let a = (s1 << 32) ^ u1;
    let b = (s2 << 32) ^ u2;
    a.rotate_left(17) ^ b ^ pid.wrapping_mul(0x9E37_79B9_7F4A_7C15)
}
