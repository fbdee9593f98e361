//! AEAD layer: handshake encryption, cookie encryption and the
//! per-suite transport ciphers
//!
//! The handshake always runs ChaCha20-Poly1305 with full 16-byte tags.
//! Transport packets run whichever suite the handshake negotiated, and may
//! carry a compressed 8-byte tag when the short-MAC feature is on.

use aes_gcm::{Aes128Gcm, Aes256Gcm};
use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::ChaCha20;
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce, XChaCha20Poly1305, XNonce,
};
use poly1305::universal_hash::KeyInit as UhKeyInit;
use poly1305::Poly1305;
use subtle::ConstantTimeEq;

use crate::error::CryptoError;

/// Symmetric key length
pub const KEY_LEN: usize = 32;

/// Nonce length for the counter-based transport nonce
pub const NONCE_LEN: usize = 12;

/// Nonce length for XChaCha20-Poly1305 (cookie replies)
pub const XNONCE_LEN: usize = 24;

/// Full authentication tag length
pub const TAG_LEN: usize = 16;

/// Compressed tag length when the short-MAC feature is negotiated
pub const TAG_LEN_SHORT: usize = 8;

/// Negotiable transport cipher suites
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CipherSuite {
    /// Standard WireGuard transport cipher (mandatory)
    ChaCha20Poly1305 = 0x00,
    /// AES-GCM with a 128-bit key (first half of the session key)
    Aes128Gcm = 0x01,
    /// AES-GCM with a 256-bit key
    Aes256Gcm = 0x02,
    /// Poly1305 tag over a plaintext payload; no encryption step
    NonePoly1305 = 0x03,
}

impl CipherSuite {
    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            0x00 => Some(Self::ChaCha20Poly1305),
            0x01 => Some(Self::Aes128Gcm),
            0x02 => Some(Self::Aes256Gcm),
            0x03 => Some(Self::NonePoly1305),
            _ => None,
        }
    }

    pub fn id(self) -> u8 {
        self as u8
    }

    /// The AES-GCM suites keep their 16-byte GCM tag even when short-MAC
    /// is negotiated; tag compression is defined for the Poly1305 family.
    pub fn supports_short_tag(self) -> bool {
        matches!(self, Self::ChaCha20Poly1305 | Self::NonePoly1305)
    }
}

fn transport_nonce(counter: u64) -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    nonce[4..12].copy_from_slice(&counter.to_le_bytes());
    nonce
}

/// Encrypt with ChaCha20-Poly1305, counter nonce, 16-byte tag appended.
///
/// This is the handshake AEAD; transport packets go through
/// [`seal_transport`] instead.
pub fn encrypt(
    key: &[u8; KEY_LEN],
    counter: u64,
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let nonce = transport_nonce(counter);
    cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| CryptoError::Encryption)
}

/// Decrypt a ChaCha20-Poly1305 ciphertext produced by [`encrypt`]
pub fn decrypt(
    key: &[u8; KEY_LEN],
    counter: u64,
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.len() < TAG_LEN {
        return Err(CryptoError::Decryption);
    }
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let nonce = transport_nonce(counter);
    cipher
        .decrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| CryptoError::Decryption)
}

/// XChaCha20-Poly1305 encryption (cookie replies)
pub fn xencrypt(
    key: &[u8; KEY_LEN],
    nonce: &[u8; XNONCE_LEN],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .encrypt(
            XNonce::from_slice(nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| CryptoError::Encryption)
}

/// XChaCha20-Poly1305 decryption (cookie replies)
pub fn xdecrypt(
    key: &[u8; KEY_LEN],
    nonce: &[u8; XNONCE_LEN],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.len() < TAG_LEN {
        return Err(CryptoError::Decryption);
    }
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(
            XNonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| CryptoError::Decryption)
}

/// Compress a 16-byte tag to 8 bytes with a keyed 64-bit mix.
///
/// Sender and receiver hold mirrored key pairs so both arrive at the same
/// 8 bytes for a given full tag.
pub fn compress_tag(tag: &[u8; TAG_LEN], pair: &[u64; 2]) -> [u8; TAG_LEN_SHORT] {
    let t0 = u64::from_le_bytes(tag[0..8].try_into().expect("8 bytes"));
    let t1 = u64::from_le_bytes(tag[8..16].try_into().expect("8 bytes"));
    let a = (t0 ^ pair[0]).wrapping_mul(0x9e37_79b9_7f4a_7c15);
    let b = (t1 ^ pair[1]).wrapping_mul(0xc2b2_ae3d_27d4_eb4f);
    let mixed = (a ^ a.rotate_right(29)).wrapping_add(b ^ b.rotate_right(31));
    mixed.to_le_bytes()
}

// One-time Poly1305 key from ChaCha20 block 0; returns the cipher
// positioned at block 1 for the payload keystream.
fn poly_otk(key: &[u8; KEY_LEN], nonce: &[u8; NONCE_LEN]) -> ([u8; 32], ChaCha20) {
    let mut cipher = ChaCha20::new(key.into(), nonce.into());
    let mut block = [0u8; 64];
    cipher.apply_keystream(&mut block);
    let mut otk = [0u8; 32];
    otk.copy_from_slice(&block[..32]);
    (otk, cipher)
}

// RFC 8439 tag input: aad || pad16 || msg || pad16 || le64(|aad|) || le64(|msg|)
fn poly_tag(otk: &[u8; 32], aad: &[u8], msg: &[u8]) -> [u8; TAG_LEN] {
    let mut m = Vec::with_capacity(aad.len() + msg.len() + 32);
    m.extend_from_slice(aad);
    m.resize(m.len().next_multiple_of(16), 0);
    m.extend_from_slice(msg);
    m.resize(m.len().next_multiple_of(16), 0);
    m.extend_from_slice(&(aad.len() as u64).to_le_bytes());
    m.extend_from_slice(&(msg.len() as u64).to_le_bytes());
    let mac = Poly1305::new(poly1305::Key::from_slice(otk));
    mac.compute_unpadded(&m).into()
}

/// Encrypt a transport payload under the negotiated suite.
///
/// Returns ciphertext (or plaintext for the None suite) with a tag of
/// `tag_len` bytes appended. `tag_len` must be 8 or 16; 8 requires a suite
/// that supports short tags and the sender's compression key pair.
pub fn seal_transport(
    suite: CipherSuite,
    key: &[u8; KEY_LEN],
    counter: u64,
    plaintext: &[u8],
    aad: &[u8],
    tag_len: usize,
    compress_pair: &[u64; 2],
) -> Result<Vec<u8>, CryptoError> {
    match suite {
        CipherSuite::ChaCha20Poly1305 | CipherSuite::NonePoly1305 => {
            let nonce = transport_nonce(counter);
            let (otk, mut cipher) = poly_otk(key, &nonce);
            let mut body = plaintext.to_vec();
            if suite == CipherSuite::ChaCha20Poly1305 {
                cipher.apply_keystream(&mut body);
            }
            let tag = poly_tag(&otk, aad, &body);
            match tag_len {
                TAG_LEN => body.extend_from_slice(&tag),
                TAG_LEN_SHORT => body.extend_from_slice(&compress_tag(&tag, compress_pair)),
                _ => return Err(CryptoError::Encryption),
            }
            Ok(body)
        }
        CipherSuite::Aes128Gcm | CipherSuite::Aes256Gcm => {
            if tag_len != TAG_LEN {
                return Err(CryptoError::Encryption);
            }
            let nonce = transport_nonce(counter);
            let payload = Payload {
                msg: plaintext,
                aad,
            };
            let out = if suite == CipherSuite::Aes128Gcm {
                let cipher = Aes128Gcm::new_from_slice(&key[..16])
                    .map_err(|_| CryptoError::Encryption)?;
                cipher.encrypt(Nonce::from_slice(&nonce), payload)
            } else {
                let cipher =
                    Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::Encryption)?;
                cipher.encrypt(Nonce::from_slice(&nonce), payload)
            };
            out.map_err(|_| CryptoError::Encryption)
        }
    }
}

/// Decrypt a transport payload sealed by [`seal_transport`].
///
/// `packet` is ciphertext plus trailing tag of `tag_len` bytes.
pub fn open_transport(
    suite: CipherSuite,
    key: &[u8; KEY_LEN],
    counter: u64,
    packet: &[u8],
    aad: &[u8],
    tag_len: usize,
    compress_pair: &[u64; 2],
) -> Result<Vec<u8>, CryptoError> {
    if packet.len() < tag_len {
        return Err(CryptoError::Decryption);
    }
    match suite {
        CipherSuite::ChaCha20Poly1305 | CipherSuite::NonePoly1305 => {
            let (body, wire_tag) = packet.split_at(packet.len() - tag_len);
            let nonce = transport_nonce(counter);
            let (otk, mut cipher) = poly_otk(key, &nonce);
            let tag = poly_tag(&otk, aad, body);
            let ok = match tag_len {
                TAG_LEN => tag.ct_eq(wire_tag).into(),
                TAG_LEN_SHORT => {
                    compress_tag(&tag, compress_pair).ct_eq(wire_tag).into()
                }
                _ => false,
            };
            if !ok {
                return Err(CryptoError::Decryption);
            }
            let mut plaintext = body.to_vec();
            if suite == CipherSuite::ChaCha20Poly1305 {
                cipher.apply_keystream(&mut plaintext);
            }
            Ok(plaintext)
        }
        CipherSuite::Aes128Gcm | CipherSuite::Aes256Gcm => {
            if tag_len != TAG_LEN {
                return Err(CryptoError::Decryption);
            }
            let nonce = transport_nonce(counter);
            let payload = Payload { msg: packet, aad };
            let out = if suite == CipherSuite::Aes128Gcm {
                let cipher = Aes128Gcm::new_from_slice(&key[..16])
                    .map_err(|_| CryptoError::Decryption)?;
                cipher.decrypt(Nonce::from_slice(&nonce), payload)
            } else {
                let cipher =
                    Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::Decryption)?;
                cipher.decrypt(Nonce::from_slice(&nonce), payload)
            };
            out.map_err(|_| CryptoError::Decryption)
        }
    }
}
