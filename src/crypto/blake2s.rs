//! BLAKE2s primitives for the handshake and cookie machinery
//!
//! Hash, keyed 16-byte MAC, RFC 2104 HMAC and the HKDF-style KDF chain the
//! Noise construction is built on.

use blake2::{
    digest::{consts::U16, FixedOutput, Mac as MacTrait, Update},
    Blake2s256, Blake2sMac, Digest,
};
use hmac::SimpleHmac;

/// HMAC-BLAKE2s (RFC 2104 HMAC with BLAKE2s-256)
type HmacBlake2s = SimpleHmac<Blake2s256>;

/// Length of BLAKE2s-256 output
pub const HASH_LEN: usize = 32;

/// Length of the truncated keyed MAC (mac1/mac2 fields)
pub const MAC_LEN: usize = 16;

/// BLAKE2s-256 hash of a single input
pub fn hash(data: &[u8]) -> [u8; HASH_LEN] {
    let mut hasher = Blake2s256::new();
    Digest::update(&mut hasher, data);
    hasher.finalize().into()
}

/// BLAKE2s-256 hash of two concatenated inputs: HASH(a || b)
pub fn hash_two(a: &[u8], b: &[u8]) -> [u8; HASH_LEN] {
    let mut hasher = Blake2s256::new();
    Digest::update(&mut hasher, a);
    Digest::update(&mut hasher, b);
    hasher.finalize().into()
}

/// BLAKE2s keyed MAC, 16 bytes of output.
///
/// Key is 32 bytes for mac1 (derived from a public key) and 16 bytes for
/// mac2 (the cookie itself); BLAKE2s accepts both.
pub fn mac16(key: &[u8], data: &[u8]) -> [u8; MAC_LEN] {
    let mut mac = Blake2sMac::<U16>::new_from_slice(key).expect("BLAKE2s key <= 32 bytes");
    MacTrait::update(&mut mac, data);
    mac.finalize_fixed().into()
}

/// HMAC-BLAKE2s keyed hash, full 32-byte output.
///
/// The whitepaper's `HMAC` function; used only through the KDF chain below.
pub fn hmac(key: &[u8], data: &[u8]) -> [u8; HASH_LEN] {
    let mut mac = HmacBlake2s::new_from_slice(key).expect("HMAC accepts any key length");
    Update::update(&mut mac, data);
    mac.finalize_fixed().into()
}

/// KDF1: one 32-byte output
pub fn kdf1(key: &[u8; HASH_LEN], input: &[u8]) -> [u8; HASH_LEN] {
    let temp = hmac(key, input);
    hmac(&temp, &[0x01])
}

/// KDF2: two 32-byte outputs
pub fn kdf2(key: &[u8; HASH_LEN], input: &[u8]) -> ([u8; HASH_LEN], [u8; HASH_LEN]) {
    let temp = hmac(key, input);
    let t1 = hmac(&temp, &[0x01]);
    let t2 = hmac(&temp, &chain_input(&t1, 0x02));
    (t1, t2)
}

/// KDF3: three 32-byte outputs
pub fn kdf3(
    key: &[u8; HASH_LEN],
    input: &[u8],
) -> ([u8; HASH_LEN], [u8; HASH_LEN], [u8; HASH_LEN]) {
    let temp = hmac(key, input);
    let t1 = hmac(&temp, &[0x01]);
    let t2 = hmac(&temp, &chain_input(&t1, 0x02));
    let t3 = hmac(&temp, &chain_input(&t2, 0x03));
    (t1, t2, t3)
}

// T(n) = HMAC(temp, T(n-1) || n)
fn chain_input(prev: &[u8; HASH_LEN], n: u8) -> [u8; HASH_LEN + 1] {
    let mut buf = [0u8; HASH_LEN + 1];
    buf[..HASH_LEN].copy_from_slice(prev);
    buf[HASH_LEN] = n;
    buf
}
