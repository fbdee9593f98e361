//! Cookie-based DoS mitigation
//!
//! The responder side: a rotating 32-byte secret MACs source addresses
//! into cookies, mac2 verification accepts the current secret or, for a
//! short grace window, the one it replaced. The initiator side: a cache
//! of the last cookie received, good for two minutes of mac2 stamping.

use std::net::SocketAddr;

use rand::RngCore;
use subtle::ConstantTimeEq;

use crate::crypto::{aead, blake2s};
use crate::error::{CryptoError, FerrotunError, ProtocolError};
use crate::protocol::addr_bytes;
use crate::protocol::messages::HandshakeCookie;
use crate::protocol::timeouts::{COOKIE_SECRET_LATENCY_MS, COOKIE_SECRET_MAX_AGE_MS};

/// Cookie value length
pub const COOKIE_LEN: usize = 16;

/// Device-side rotating cookie secret
pub struct CookieSecret {
    secret: [u8; 32],
    secret_born_ms: u64,
    /// Previous secret and when it was retired, kept through the grace
    /// window so rotation does not invalidate in-flight cookies
    previous: Option<([u8; 32], u64)>,
}

impl CookieSecret {
    pub fn new(now_ms: u64) -> Self {
        Self {
            secret: fresh_secret(),
            secret_born_ms: now_ms,
            previous: None,
        }
    }

    /// Rotate if the secret is older than its maximum age. Returns true
    /// when a rotation happened.
    pub fn rotate_if_stale(&mut self, now_ms: u64) -> bool {
        if now_ms.saturating_sub(self.secret_born_ms) < COOKIE_SECRET_MAX_AGE_MS {
            return false;
        }
        self.previous = Some((self.secret, now_ms));
        self.secret = fresh_secret();
        self.secret_born_ms = now_ms;
        true
    }

    /// Cookie for a source address under the current secret
    pub fn cookie_for(&self, src: &SocketAddr) -> [u8; COOKIE_LEN] {
        blake2s::mac16(&self.secret, &addr_bytes(src))
    }

    /// Verify a mac2 against the current secret, falling back to the
    /// previous one within the grace window.
    pub fn verify_mac2(&self, now_ms: u64, src: &SocketAddr, region: &[u8], mac2: &[u8]) -> bool {
        let check = |secret: &[u8; 32]| {
            let cookie = blake2s::mac16(secret, &addr_bytes(src));
            let expected = blake2s::mac16(&cookie, region);
            bool::from(expected.ct_eq(mac2))
        };
        if check(&self.secret) {
            return true;
        }
        if let Some((prev, retired_ms)) = &self.previous {
            if now_ms.saturating_sub(*retired_ms) <= COOKIE_SECRET_LATENCY_MS && check(prev) {
                return true;
            }
        }
        false
    }
}

fn fresh_secret() -> [u8; 32] {
    let mut secret = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut secret);
    secret
}

/// Build a cookie reply for a failed-mac2 initiation.
///
/// `cookie_key` is the device's own `HASH("cookie--" || Spub)`;
/// `their_mac1` (from the offending message) binds the reply to it.
pub fn create_cookie_reply(
    secret: &CookieSecret,
    remote_key_id: u32,
    src: &SocketAddr,
    their_mac1: &[u8; 16],
    cookie_key: &[u8; 32],
) -> Result<HandshakeCookie, FerrotunError> {
    let cookie = secret.cookie_for(src);
    let mut nonce = [0u8; 24];
    rand::rngs::OsRng.fill_bytes(&mut nonce);

    let sealed = aead::xencrypt(cookie_key, &nonce, &cookie, their_mac1)?;
    let cookie_enc: [u8; 32] = sealed
        .as_slice()
        .try_into()
        .map_err(|_| CryptoError::Encryption)?;

    Ok(HandshakeCookie {
        receiver_key_id: remote_key_id,
        nonce,
        cookie_enc,
    })
}

/// Initiator-side cache of the cookie a responder handed back
#[derive(Debug, Clone, Default)]
pub struct CookieCache {
    cookie: Option<[u8; COOKIE_LEN]>,
    received_ms: u64,
}

impl CookieCache {
    /// The cached cookie, while it is still fresh
    pub fn get(&self, now_ms: u64) -> Option<&[u8; COOKIE_LEN]> {
        self.cookie.as_ref().filter(|_| {
            now_ms.saturating_sub(self.received_ms) < COOKIE_SECRET_MAX_AGE_MS
        })
    }

    /// Decrypt a cookie reply and store the cookie.
    ///
    /// `cookie_key` here is derived from the *peer's* public key, and
    /// `sent_mac1` is the mac1 of our own initiation the reply answers.
    pub fn consume_reply(
        &mut self,
        now_ms: u64,
        reply: &HandshakeCookie,
        sent_mac1: &[u8; 16],
        cookie_key: &[u8; 32],
    ) -> Result<(), FerrotunError> {
        let decrypted = aead::xdecrypt(cookie_key, &reply.nonce, &reply.cookie_enc, sent_mac1)?;
        let cookie: [u8; COOKIE_LEN] = decrypted
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::Decryption)?;

        self.cookie = Some(cookie);
        self.received_ms = now_ms;
        tracing::debug!("cached mac2 cookie from peer");
        Ok(())
    }

    pub fn clear(&mut self) {
        self.cookie = None;
    }
}

/// Verify a message's mac1 field against the receiver's precomputed key.
pub fn verify_mac1(
    mac1_key: &[u8; 32],
    region: &[u8],
    mac1: &[u8],
) -> Result<(), ProtocolError> {
    let expected = blake2s::mac16(mac1_key, region);
    if bool::from(expected.ct_eq(mac1)) {
        Ok(())
    } else {
        Err(ProtocolError::BadMac1)
    }
}
