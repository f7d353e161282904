//! A small integer hash over address-valued keys, used to bucket allocated boundary
//! tags by their start address.
//!
//! This stands in for the generic hash primitive the arena allocator treats as an
//! external collaborator; it only needs to spread consecutive addresses across buckets
//! reasonably well, not to be cryptographically strong.

/// Hash an address-valued key down to `[0, num_buckets)`.
#[inline(always)]
pub fn hash_addr(key: usize, num_buckets: usize) -> usize {
    // Fibonacci hashing: multiply by the odd, golden-ratio-derived constant and take
    // the high bits, then reduce into the bucket count.
    const GOLDEN: usize = 0x9E3779B97F4A7C15;
    let mixed = key.wrapping_mul(GOLDEN);
    (mixed >> (usize::BITS - 32)) as usize % num_buckets
}
