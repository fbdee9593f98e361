//! SipHash-2-4 helpers
//!
//! Used for the rate limiter's admission bins and the optional header
//! scrambler, both keyed with 128-bit keys held as two u64 words.

use std::hash::Hasher;

use siphasher::sip::SipHasher24;

/// SipHash-2-4 of a byte slice
pub fn siphash(k0: u64, k1: u64, data: &[u8]) -> u64 {
    let mut hasher = SipHasher24::new_with_keys(k0, k1);
    hasher.write(data);
    hasher.finish()
}

/// SipHash-2-4 of a single 64-bit word (little-endian)
pub fn siphash_u64(k0: u64, k1: u64, value: u64) -> u64 {
    siphash(k0, k1, &value.to_le_bytes())
}
