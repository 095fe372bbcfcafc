//! Fatal corruption diagnostics.
//!
//! Every detected safety violation ends here: a structured report goes
//! to stderr, then the process aborts. None of this may allocate or take
//! the heap lock — by the time a reporter runs, heap state is suspect.

use core::fmt::{self, Write};

const HEADER: &str = "\n\x1b[1;31m=== palisade heap ===\x1b[0m\n";

/// Writes straight to fd 2, bypassing any buffered or allocating sink.
struct Stderr;

impl fmt::Write for Stderr {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        // SAFETY: s points to s.len() readable bytes for the syscall.
        unsafe { libc::write(2, s.as_ptr() as *const libc::c_void, s.len()) };
        Ok(())
    }
}

fn abort() -> ! {
    let _ = Stderr.write_str("aborting.\n\n");
    // SAFETY: abort never returns.
    unsafe { libc::abort() }
}

macro_rules! report {
    ($($arg:tt)*) => {{
        let _ = write!(Stderr, $($arg)*);
    }};
}

pub fn canary_mismatch(zone_index: u16, chunk: usize, expected: u64, observed: u64) -> ! {
    report!("{HEADER}ERROR: canary mismatch\n");
    report!("  zone:     {zone_index}\n");
    report!("  chunk:    {chunk:#018x}\n");
    report!("  expected: {expected:#018x}\n");
    report!("  observed: {observed:#018x}\n");
    abort();
}

pub fn double_free(zone_index: u16, chunk: usize, slot: u64) -> ! {
    report!("{HEADER}ERROR: double free\n");
    report!("  zone:  {zone_index}\n");
    report!("  chunk: {chunk:#018x}\n");
    report!("  slot:  {slot}\n");
    abort();
}

pub fn unknown_pointer(addr: usize) -> ! {
    report!("{HEADER}ERROR: free of unknown pointer\n");
    report!("  address: {addr:#018x}\n");
    report!("  no zone's user region contains this address.\n");
    abort();
}

pub fn misaligned_free(zone_index: u16, addr: usize, chunk_size: usize) -> ! {
    report!("{HEADER}ERROR: free of misaligned pointer\n");
    report!("  zone:       {zone_index}\n");
    report!("  address:    {addr:#018x}\n");
    report!("  chunk size: {chunk_size}\n");
    report!("  the address is not a chunk boundary.\n");
    abort();
}

pub fn group_corrupt(zone_index: u16, slot: u64, bits: u8) -> ! {
    report!("{HEADER}ERROR: occupancy bits corrupt\n");
    report!("  zone: {zone_index}\n");
    report!("  slot: {slot}\n");
    report!("  bits: {bits:#04b}\n");
    abort();
}

pub fn chunk_out_of_range(zone_index: u16, chunk: usize) -> ! {
    report!("{HEADER}ERROR: chunk outside the zone's user region\n");
    report!("  zone:  {zone_index}\n");
    report!("  chunk: {chunk:#018x}\n");
    abort();
}

pub fn slot_cache_duplicate(zone_index: u16, slot: u64) -> ! {
    report!("{HEADER}ERROR: free slot already cached\n");
    report!("  zone: {zone_index}\n");
    report!("  slot: {slot}\n");
    abort();
}

pub fn no_free_slot(zone_index: u16) -> ! {
    report!("{HEADER}ERROR: zone reported usable but holds no free slot\n");
    report!("  zone: {zone_index}\n");
    abort();
}

pub fn zone_table_full() -> ! {
    report!("{HEADER}ERROR: zone table full\n");
    abort();
}

pub fn oversized_request(size: usize) -> ! {
    report!("{HEADER}ERROR: request exceeds the zone user size\n");
    report!("  requested: {size}\n");
    abort();
}

pub fn calloc_overflow(nmemb: usize, size: usize) -> ! {
    report!("{HEADER}ERROR: calloc size overflow\n");
    report!("  nmemb: {nmemb}\n");
    report!("  size:  {size}\n");
    abort();
}

pub fn bad_zone_handle(raw: u64) -> ! {
    report!("{HEADER}ERROR: invalid zone handle\n");
    report!("  handle: {raw:#018x}\n");
    abort();
}

pub fn vm_failure(op: &str, addr: usize, len: usize) -> ! {
    report!("{HEADER}ERROR: {op} failed\n");
    report!("  address: {addr:#018x}\n");
    report!("  length:  {len}\n");
    abort();
}
