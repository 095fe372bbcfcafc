//! Compile-time tunables.

/// Bytes of user-allocatable memory per zone.
pub const ZONE_USER_SIZE: usize = 4 * 1024 * 1024;

/// Default size classes, one zone each at startup. Requests above the
/// largest class get a dedicated zone rounded to [`ALIGNMENT`].
pub const DEFAULT_ZONE_SIZES: [usize; 9] = [16, 32, 64, 128, 256, 512, 1024, 2048, 4096];

/// Capacity of the root's zone table.
pub const MAX_ZONES: usize = 256;

/// Depth of the per-zone free-slot cache.
pub const BIT_SLOT_CACHE_SZ: usize = 255;

/// Roughly one chunk in this many is seeded as a permanent canary.
pub const CANARY_COUNT_DIV: usize = 100;

/// A zone whose chunk size is this many times the request is rejected
/// by the usability screen for requests above the 1024 class.
pub const WASTED_MULTIPLIER: usize = 8;

/// Fill byte for freed chunk bodies.
pub const POISON_BYTE: u8 = 0xDE;

/// Machine-word alignment every chunk size is a multiple of.
pub const ALIGNMENT: usize = 8;

/// Bytes of canary at each end of a canary-bearing chunk.
pub const CANARY_SIZE: usize = 8;

/// A chunk's position as the starting bit offset of its two-bit group.
pub type BitSlot = u64;

/// Sentinel for "no slot".
pub const BAD_SLOT: BitSlot = BitSlot::MAX;

/// Round `n` up to the next multiple of `to` (a power of two).
pub const fn round_up(n: usize, to: usize) -> usize {
    (n + to - 1) & !(to - 1)
}
