//! Noise_IKpsk2 symmetric state
//!
//! Pattern: `Noise_IKpsk2_25519_ChaChaPoly_BLAKE2s`. Both handshake
//! directions drive the same symmetric state; the peer module owns the
//! message flow.

use super::{aead, blake2s};
use crate::error::CryptoError;

/// Noise protocol construction string
pub const CONSTRUCTION: &[u8] = b"Noise_IKpsk2_25519_ChaChaPoly_BLAKE2s";

/// WireGuard identifier string
pub const IDENTIFIER: &[u8] = b"WireGuard v1 zx2c4 Jason@zx2c4.com";

/// Label for mac1 key derivation
pub const LABEL_MAC1: &[u8] = b"mac1----";

/// Label for cookie key derivation
pub const LABEL_COOKIE: &[u8] = b"cookie--";

/// KDF label for the short-MAC compression keys
const LABEL_MAC_COMPRESS: &[u8] = b"mac-compress";

/// Hash length (also chaining key length)
pub const HASH_LEN: usize = 32;

/// Symmetric handshake state: chaining key plus transcript hash
#[derive(Clone)]
pub struct SymmetricState {
    /// Chaining key for key derivation
    pub chaining_key: [u8; HASH_LEN],
    /// Transcript hash accumulator
    pub hash: [u8; HASH_LEN],
}

impl SymmetricState {
    /// `Ci = HASH(CONSTRUCTION)`
    pub fn initial_chain_key() -> [u8; HASH_LEN] {
        blake2s::hash(CONSTRUCTION)
    }

    /// `Hi = HASH(HASH(Ci || IDENTIFIER) || Spub_responder)`
    ///
    /// Both sides seed the transcript with the responder's static key.
    pub fn new(responder_static: &[u8; 32]) -> Self {
        let ck = Self::initial_chain_key();
        let h = blake2s::hash_two(&blake2s::hash_two(&ck, IDENTIFIER), responder_static);
        Self {
            chaining_key: ck,
            hash: h,
        }
    }

    /// MixHash: `h = HASH(h || data)`
    pub fn mix_hash(&mut self, data: &[u8]) {
        self.hash = blake2s::hash_two(&self.hash, data);
    }

    /// Fold an ephemeral public key into the chain: `ck = KDF1(ck, e_pub)`
    pub fn mix_chain(&mut self, data: &[u8]) {
        self.chaining_key = blake2s::kdf1(&self.chaining_key, data);
    }

    /// MixKey: `(ck, k) = KDF2(ck, input)`; returns the derived key
    pub fn mix_key(&mut self, input: &[u8]) -> [u8; 32] {
        let (ck, key) = blake2s::kdf2(&self.chaining_key, input);
        self.chaining_key = ck;
        key
    }

    /// MixKeyAndHash for the PSK: `(ck, t, k) = KDF3(ck, psk)`, mixing `t`
    /// into the transcript
    pub fn mix_key_and_hash(&mut self, psk: &[u8; 32]) -> [u8; 32] {
        let (ck, temp_h, key) = blake2s::kdf3(&self.chaining_key, psk);
        self.chaining_key = ck;
        self.mix_hash(&temp_h);
        key
    }

    /// Encrypt with the transcript as AAD, then mix the ciphertext in
    pub fn encrypt_and_hash(
        &mut self,
        key: &[u8; 32],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let ciphertext = aead::encrypt(key, 0, plaintext, &self.hash)?;
        self.mix_hash(&ciphertext);
        Ok(ciphertext)
    }

    /// Decrypt with the transcript as AAD, then mix the ciphertext in
    pub fn decrypt_and_hash(
        &mut self,
        key: &[u8; 32],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let plaintext = aead::decrypt(key, 0, ciphertext, &self.hash)?;
        self.mix_hash(ciphertext);
        Ok(plaintext)
    }
}

/// Split the final chaining key into (send, recv) session keys.
///
/// The initiator sends under T1 and receives under T2; the responder is
/// mirrored.
pub fn derive_session_keys(
    chaining_key: &[u8; HASH_LEN],
    is_initiator: bool,
) -> ([u8; 32], [u8; 32]) {
    let (t1, t2) = blake2s::kdf2(chaining_key, &[]);
    if is_initiator {
        (t1, t2)
    } else {
        (t2, t1)
    }
}

/// Derive the short-MAC tag-compression key pairs, `[send, recv]`.
///
/// Pinned as `KDF2(ck, "mac-compress")` split into four little-endian u64
/// words; the initiator sends with the first pair, the responder with the
/// second, so both directions agree.
pub fn derive_compress_mac_keys(
    chaining_key: &[u8; HASH_LEN],
    is_initiator: bool,
) -> [[u64; 2]; 2] {
    let (a, b) = blake2s::kdf2(chaining_key, LABEL_MAC_COMPRESS);
    let pair_a = [
        u64::from_le_bytes(a[0..8].try_into().expect("8 bytes")),
        u64::from_le_bytes(a[8..16].try_into().expect("8 bytes")),
    ];
    let pair_b = [
        u64::from_le_bytes(b[0..8].try_into().expect("8 bytes")),
        u64::from_le_bytes(b[8..16].try_into().expect("8 bytes")),
    ];
    if is_initiator {
        [pair_a, pair_b]
    } else {
        [pair_b, pair_a]
    }
}

/// `mac1_key = HASH("mac1----" || Spub)`
pub fn mac1_key(peer_public: &[u8; 32]) -> [u8; 32] {
    blake2s::hash_two(LABEL_MAC1, peer_public)
}

/// `cookie_key = HASH("cookie--" || Spub)`
pub fn cookie_key(peer_public: &[u8; 32]) -> [u8; 32] {
    blake2s::hash_two(LABEL_COOKIE, peer_public)
}
