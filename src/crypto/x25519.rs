//! X25519 Diffie-Hellman key exchange
//!
//! Also carries the base64 key helpers, since every key that crosses a
//! configuration or log boundary travels in the standard encoding.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::rngs::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::CryptoError;

/// Key length for X25519 (both private and public keys)
pub const KEY_LEN: usize = 32;

/// Generate a new X25519 keypair, returned as (private, public)
pub fn generate_keypair() -> ([u8; KEY_LEN], [u8; KEY_LEN]) {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret);
    (secret.to_bytes(), public.to_bytes())
}

/// Derive the public key from a private key
pub fn public_key(private_key: &[u8; KEY_LEN]) -> [u8; KEY_LEN] {
    let secret = StaticSecret::from(*private_key);
    PublicKey::from(&secret).to_bytes()
}

/// X25519 DH: shared secret from our private key and their public key
pub fn dh(private_key: &[u8; KEY_LEN], public_key: &[u8; KEY_LEN]) -> [u8; KEY_LEN] {
    let secret = StaticSecret::from(*private_key);
    let public = PublicKey::from(*public_key);
    secret.diffie_hellman(&public).to_bytes()
}

/// Reject the all-zero public key (identity point); low-order point
/// handling is done inside the DH itself.
pub fn is_valid_public_key(key: &[u8; KEY_LEN]) -> bool {
    !key.iter().all(|&b| b == 0)
}

/// Parse a base64-encoded 32-byte key
pub fn key_from_base64(encoded: &str) -> Result<[u8; KEY_LEN], CryptoError> {
    let bytes = BASE64
        .decode(encoded.trim())
        .map_err(|_| CryptoError::InvalidKeyLength {
            expected: KEY_LEN,
            got: 0,
        })?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| CryptoError::InvalidKeyLength {
            expected: KEY_LEN,
            got: bytes.len(),
        })
}

/// Encode a key as base64
pub fn key_to_base64(key: &[u8; KEY_LEN]) -> String {
    BASE64.encode(key)
}

/// Short display form of a public key for logs (first 8 bytes)
pub fn key_fingerprint(key: &[u8; KEY_LEN]) -> String {
    BASE64.encode(&key[..8])
}
