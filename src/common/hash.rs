//! Hashing utilities for tpckv
//!
//! Keys are placed on the replica ring by a fixed multiplicative rolling
//! hash. The function must never change: every coordinator has to agree on
//! where a key lives.

/// Seed of the rolling hash (a large odd prime).
pub const RING_HASH_SEED: u64 = 1_125_899_906_842_597;

/// 64-bit rolling hash over the key's bytes, `h = 31*h + byte`.
///
/// Arithmetic wraps and the result is compared as unsigned everywhere.
pub fn ring_hash(key: &[u8]) -> u64 {
    key.iter().fold(RING_HASH_SEED, |h, &b| {
        h.wrapping_mul(31).wrapping_add(u64::from(b))
    })
}
