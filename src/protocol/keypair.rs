//! Established session state
//!
//! One keypair per completed handshake: directional keys, the atomic send
//! counter, the replay window, the negotiated cipher/feature set and the
//! short-header bookkeeping. A keypair lives in exactly one of its peer's
//! three ring slots and is addressed from the tables by `(peer, key id)`.

use std::sync::atomic::{AtomicU64, Ordering};

use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::aead::{self, CipherSuite, TAG_LEN, TAG_LEN_SHORT};
use crate::crypto::noise;
use crate::error::{CryptoError, FerrotunError, ProtocolError};
use crate::protocol::extensions::{feature, CompressionHint, FEATURE_COUNT};
use crate::protocol::limits::{REJECT_AFTER_MESSAGES, REKEY_AFTER_MESSAGES};
use crate::protocol::replay::ReplayDetector;
use crate::protocol::timeouts::{REJECT_AFTER_TIME_MS, REKEY_AFTER_TIME_MS};

#[derive(Zeroize, ZeroizeOnDrop)]
struct SessionKeys {
    send: [u8; 32],
    recv: [u8; 32],
}

pub struct Keypair {
    /// Id the peer puts in packets meant for us
    pub local_key_id: u32,
    /// Id we put in packets meant for the peer
    pub remote_key_id: u32,
    /// Whether we initiated the handshake that produced this keypair
    pub is_initiator: bool,
    pub cipher_suite: CipherSuite,
    /// Wire tag length, 16 or 8
    pub auth_tag_len: usize,
    pub enabled_features: [bool; FEATURE_COUNT],
    pub created_ms: u64,

    keys: SessionKeys,
    /// `[send, recv]` pairs for 8-byte tag compression
    compress_mac_keys: [[u64; 2]; 2],
    send_ctr: AtomicU64,

    /// Highest counter the peer confirmed via ack piggyback
    pub send_ctr_acked: u64,
    pub replay: ReplayDetector,

    /// Back-reference into the address-binding table: `(addr id, slot)`
    pub addr_entry: Option<(u64, u8)>,
    /// Slot grant pending transmission to the peer (1-3, 0 none)
    pub broadcast_short_key: u8,
    /// Slot the peer granted us for short-header sends (1-3, 0 none)
    pub can_use_short_key: u8,
    /// Set once we tried to bind this keypair to the peer's address
    pub did_attempt_addr_binding: bool,
    pub incoming_packet_count: u32,

    /// The peer's compression hint, present when the ipzip feature was
    /// negotiated; consumed by the external codec
    pub compression: Option<CompressionHint>,
}

impl Keypair {
    /// Derive a keypair from the final chaining key of a handshake.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        is_initiator: bool,
        chaining_key: &[u8; 32],
        local_key_id: u32,
        remote_key_id: u32,
        cipher_suite: CipherSuite,
        enabled_features: [bool; FEATURE_COUNT],
        now_ms: u64,
    ) -> Self {
        let (send, recv) = noise::derive_session_keys(chaining_key, is_initiator);
        let compress_mac_keys = noise::derive_compress_mac_keys(chaining_key, is_initiator);
        let auth_tag_len = if enabled_features[feature::SHORT_MAC] && cipher_suite.supports_short_tag()
        {
            TAG_LEN_SHORT
        } else {
            TAG_LEN
        };
        Self {
            local_key_id,
            remote_key_id,
            is_initiator,
            cipher_suite,
            auth_tag_len,
            enabled_features,
            created_ms: now_ms,
            keys: SessionKeys { send, recv },
            compress_mac_keys,
            send_ctr: AtomicU64::new(0),
            send_ctr_acked: 0,
            replay: ReplayDetector::new(),
            addr_entry: None,
            broadcast_short_key: 0,
            can_use_short_key: 0,
            did_attempt_addr_binding: false,
            incoming_packet_count: 0,
            compression: None,
        }
    }

    /// Claim the next outbound counter.
    ///
    /// The fetch-add keeps nonces strictly increasing even with several
    /// workers encrypting for the same peer.
    pub fn next_send_counter(&self) -> Result<u64, ProtocolError> {
        let counter = self.send_ctr.fetch_add(1, Ordering::Relaxed);
        if counter >= REJECT_AFTER_MESSAGES {
            return Err(ProtocolError::SessionExpired);
        }
        Ok(counter)
    }

    pub fn send_counter(&self) -> u64 {
        self.send_ctr.load(Ordering::Relaxed)
    }

    /// Seal a payload under the send key; returns ciphertext plus tag.
    pub fn seal(&self, counter: u64, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        aead::seal_transport(
            self.cipher_suite,
            &self.keys.send,
            counter,
            plaintext,
            aad,
            self.auth_tag_len,
            &self.compress_mac_keys[0],
        )
    }

    /// Open a sealed payload, then run the replay check.
    ///
    /// A failed decryption never touches the replay window; a replayed
    /// counter never yields plaintext to the caller.
    pub fn open(
        &mut self,
        counter: u64,
        packet: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>, FerrotunError> {
        let plaintext = aead::open_transport(
            self.cipher_suite,
            &self.keys.recv,
            counter,
            packet,
            aad,
            self.auth_tag_len,
            &self.compress_mac_keys[1],
        )?;
        if !self.replay.check_replay(counter.wrapping_add(1)) {
            return Err(ProtocolError::ReplayRejected { counter }.into());
        }
        self.incoming_packet_count += 1;
        Ok(plaintext)
    }

    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.created_ms)
    }

    /// Past the hard expiry: nothing is encrypted or accepted any more.
    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.age_ms(now_ms) >= REJECT_AFTER_TIME_MS
    }

    /// Should the owning peer start a replacement handshake for this key?
    /// Only the initiator of a session rekeys it.
    pub fn wants_rekey(&self, now_ms: u64) -> bool {
        self.is_initiator
            && (self.age_ms(now_ms) >= REKEY_AFTER_TIME_MS
                || self.send_counter() >= REKEY_AFTER_MESSAGES)
    }

    /// Next counter the receive side expects, the anchor for truncated
    /// counter reconstruction.
    pub fn expected_recv_counter(&self) -> u64 {
        self.replay.expected_seq_nr()
    }

    /// Smallest wire width that lets the peer reconstruct the counter,
    /// given what it has acked so far. None means the gap outgrew four
    /// bytes and the full header must be used.
    pub fn short_counter_width(&self) -> Option<usize> {
        let gap = self.send_counter().saturating_sub(self.send_ctr_acked);
        if gap < 1 << 7 {
            Some(1)
        } else if gap < 1 << 15 {
            Some(2)
        } else if gap < 1 << 31 {
            Some(4)
        } else {
            None
        }
    }

    /// Record an acked counter from a piggyback, clamped to what we
    /// actually sent.
    pub fn record_ack(&mut self, acked: u64) {
        let sent = self.send_counter();
        let acked = acked.min(sent);
        if acked > self.send_ctr_acked {
            self.send_ctr_acked = acked;
        }
    }
}
