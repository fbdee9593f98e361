//! Optional header obfuscation
//!
//! XORs a SipHash-2-4 keystream over the leading bytes of every datagram
//! so the fixed WireGuard type fields do not appear on the wire. Keyed by
//! four u64 words derived from an operator-supplied passphrase, salted by
//! the datagram's final 8 bytes and its length. The transform is its own
//! inverse, and the salt region is never masked.

use crate::crypto::{blake2s, siphash};

/// Bytes of header covered by the mask
const MASK_LEN: usize = 16;

/// Trailing bytes used as the per-packet salt
const SALT_LEN: usize = 8;

pub struct Obfuscator {
    keys: [u64; 4],
}

impl Obfuscator {
    /// Derive the four scrambler keys from a passphrase.
    pub fn new(key: &str) -> Self {
        let digest = blake2s::hash(key.as_bytes());
        let word = |i: usize| {
            u64::from_le_bytes(digest[i * 8..(i + 1) * 8].try_into().expect("8 bytes"))
        };
        Self {
            keys: [word(0), word(1), word(2), word(3)],
        }
    }

    /// Scramble or unscramble `packet` in place.
    pub fn scramble(&self, packet: &mut [u8]) {
        if packet.len() <= SALT_LEN {
            return;
        }
        let salt_offset = packet.len() - SALT_LEN;
        let salt = u64::from_le_bytes(
            packet[salt_offset..].try_into().expect("8 bytes"),
        ) ^ packet.len() as u64;

        let mut mask = [0u8; MASK_LEN];
        mask[..8]
            .copy_from_slice(&siphash::siphash_u64(self.keys[0], self.keys[1], salt).to_le_bytes());
        mask[8..]
            .copy_from_slice(&siphash::siphash_u64(self.keys[2], self.keys[3], salt).to_le_bytes());

        let cover = MASK_LEN.min(salt_offset);
        for (byte, m) in packet[..cover].iter_mut().zip(mask.iter()) {
            *byte ^= m;
        }
    }
}
