//! Per-peer state
//!
//! Everything mutable sits in `PeerInner` behind the peer mutex: the
//! three-slot keypair ring, the pending handshake transcript, timer
//! deadlines, the bounded send queue and the negotiation preferences.
//! The immutable identity (static key, precomputed DH, mac keys) lives
//! beside the mutex so lookups never need the lock.

use std::collections::VecDeque;
use std::net::SocketAddr;

use parking_lot::Mutex;

use crate::protocol::cookie::CookieCache;
use crate::protocol::extensions::FEATURE_COUNT;
use crate::protocol::handshake::{HandshakeTranscript, TIMESTAMP_LEN};
use crate::protocol::keypair::Keypair;
use crate::protocol::limits::{MAX_HANDSHAKE_ATTEMPTS, MAX_QUEUED_PACKETS_PER_PEER};
use crate::protocol::timeouts::{KEEPALIVE_TIMEOUT_MS, REKEY_TIMEOUT_MS};

/// Stable index of a peer in the device arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerHandle(pub(crate) usize);

/// Timer actions computed once per second
pub(crate) const ACTION_SEND_KEEPALIVE: u32 = 1;
pub(crate) const ACTION_SEND_HANDSHAKE: u32 = 2;
pub(crate) const ACTION_UNREACHABLE: u32 = 4;

/// The three-slot keypair ring.
///
/// Encrypt under `curr`; decrypt under whichever slot the incoming key id
/// selects; `next` holds a freshly negotiated session until its first
/// use promotes it.
#[derive(Default)]
pub(crate) struct KeyRing {
    pub prev: Option<Box<Keypair>>,
    pub curr: Option<Box<Keypair>>,
    pub next: Option<Box<Keypair>>,
}

impl KeyRing {
    /// Find the keypair carrying `local_key_id`; the flag is true when it
    /// sits in the `next` slot.
    pub fn find_mut(&mut self, local_key_id: u32) -> Option<(&mut Keypair, bool)> {
        for (slot, is_next) in [
            (&mut self.curr, false),
            (&mut self.prev, false),
            (&mut self.next, true),
        ] {
            if let Some(kp) = slot {
                if kp.local_key_id == local_key_id {
                    return Some((kp.as_mut(), is_next));
                }
            }
        }
        None
    }

    /// `prev ← curr`, `curr ← next`. Returns the keypair falling out of
    /// `prev` so the caller can unlink it from the tables.
    pub fn promote_next(&mut self) -> Option<Box<Keypair>> {
        let dropped = self.prev.take();
        self.prev = self.curr.take();
        self.curr = self.next.take();
        dropped
    }

    /// Install a fresh session in `next`, returning whatever it displaced.
    pub fn install_next(&mut self, keypair: Box<Keypair>) -> Option<Box<Keypair>> {
        self.next.replace(keypair)
    }

    /// Drop every keypair past its hard expiry.
    pub fn expire(&mut self, now_ms: u64) -> Vec<Box<Keypair>> {
        let mut dropped = Vec::new();
        for slot in [&mut self.prev, &mut self.curr, &mut self.next] {
            if slot.as_ref().is_some_and(|kp| kp.is_expired(now_ms)) {
                dropped.extend(slot.take());
            }
        }
        dropped
    }

    /// Remove every keypair, for a full peer reset.
    pub fn clear(&mut self) -> Vec<Box<Keypair>> {
        [&mut self.prev, &mut self.curr, &mut self.next]
            .into_iter()
            .filter_map(|slot| slot.take())
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Keypair> {
        [&self.prev, &self.curr, &self.next]
            .into_iter()
            .filter_map(|slot| slot.as_deref())
    }
}

pub(crate) struct PeerInner {
    pub ring: KeyRing,
    /// Initiator transcript while a response is outstanding
    pub transcript: Option<HandshakeTranscript>,

    pub endpoint: Option<SocketAddr>,
    /// Roam to the source address of authenticated inbound traffic
    pub allow_endpoint_change: bool,

    /// Our feature votes for the next negotiation
    pub features: [u8; FEATURE_COUNT],
    /// Our cipher preference list and whether it is a priority ordering
    pub ciphers: Vec<u8>,
    pub cipher_prio: bool,

    /// 0 disables the persistent keepalive
    pub persistent_keepalive_ms: u64,

    /// Packets waiting for a session, oldest first, bounded
    pub queued: VecDeque<Vec<u8>>,

    pub handshake_attempts: u8,
    pub total_handshake_attempts: u32,
    /// Set once attempts run out; cleared by an external trigger
    pub handshake_suppressed: bool,

    /// Highest TAI64N accepted from this peer, for cross-session replay
    pub last_timestamp: [u8; TIMESTAMP_LEN],

    pub cookie_cache: CookieCache,
    /// mac1 of our last outbound initiation, binds cookie replies
    pub sent_mac1: [u8; 16],
    pub expect_cookie_reply: bool,

    // Timer state, all in device milliseconds
    pub last_send_ms: u64,
    pub last_recv_ms: u64,
    /// Passive keepalive owed for received data; cleared by any send
    pub keepalive_due_ms: Option<u64>,
    /// When the outstanding initiation went out (None when idle)
    pub handshake_init_sent_ms: Option<u64>,
    pub last_handshake_init_recv_ms: u64,
    pub last_handshake_init_sent_ms: u64,
    pub last_complete_handshake_ms: u64,
    /// Rekey requested outside the timer (counter exhaustion)
    pub want_handshake: bool,
}

impl PeerInner {
    pub fn new() -> Self {
        Self {
            ring: KeyRing::default(),
            transcript: None,
            endpoint: None,
            allow_endpoint_change: true,
            features: [0u8; FEATURE_COUNT],
            ciphers: Vec::new(),
            cipher_prio: false,
            persistent_keepalive_ms: 0,
            queued: VecDeque::new(),
            handshake_attempts: 0,
            total_handshake_attempts: 0,
            handshake_suppressed: false,
            last_timestamp: [0u8; TIMESTAMP_LEN],
            cookie_cache: CookieCache::default(),
            sent_mac1: [0u8; 16],
            expect_cookie_reply: false,
            last_send_ms: 0,
            last_recv_ms: 0,
            keepalive_due_ms: None,
            handshake_init_sent_ms: None,
            last_handshake_init_recv_ms: 0,
            last_handshake_init_sent_ms: 0,
            last_complete_handshake_ms: 0,
            want_handshake: false,
        }
    }

    /// Enqueue a packet to send once a session exists.
    pub fn queue_packet(&mut self, packet: Vec<u8>) -> bool {
        if self.queued.len() >= MAX_QUEUED_PACKETS_PER_PEER {
            return false;
        }
        self.queued.push_back(packet);
        true
    }

    /// Bookkeeping after any outbound transport packet.
    pub fn on_packet_sent(&mut self, now_ms: u64) {
        self.last_send_ms = now_ms;
        self.keepalive_due_ms = None;
    }

    /// Bookkeeping after any authenticated inbound packet. Keepalives
    /// (empty payloads) satisfy liveness but owe no reply.
    pub fn on_packet_received(&mut self, now_ms: u64, is_keepalive: bool) {
        self.last_recv_ms = now_ms;
        if !is_keepalive && self.keepalive_due_ms.is_none() {
            self.keepalive_due_ms = Some(now_ms + KEEPALIVE_TIMEOUT_MS);
        }
    }

    /// Forget the in-flight handshake (key-id cleanup is the caller's).
    pub fn clear_handshake(&mut self) -> Option<u32> {
        self.handshake_init_sent_ms = None;
        self.expect_cookie_reply = false;
        self.transcript.take().map(|t| t.local_key_id)
    }

    /// Once-per-second decision, spec §4.8 step 2.
    pub fn check_timeouts(&mut self, now_ms: u64) -> u32 {
        let mut actions = 0;

        // Outstanding initiation: resend after the rekey timeout, or give
        // up after too many consecutive attempts.
        if let Some(sent_ms) = self.handshake_init_sent_ms {
            if now_ms.saturating_sub(sent_ms) >= REKEY_TIMEOUT_MS {
                if self.handshake_attempts >= MAX_HANDSHAKE_ATTEMPTS {
                    self.handshake_suppressed = true;
                    actions |= ACTION_UNREACHABLE;
                } else {
                    actions |= ACTION_SEND_HANDSHAKE;
                }
            }
        } else if !self.handshake_suppressed {
            let rekey_due = self
                .ring
                .curr
                .as_ref()
                .is_some_and(|kp| kp.wants_rekey(now_ms));
            if rekey_due || self.want_handshake {
                actions |= ACTION_SEND_HANDSHAKE;
            }
        }

        let has_session = self.ring.curr.is_some();

        // Passive keepalive for received data we never answered
        if let Some(due) = self.keepalive_due_ms {
            if now_ms >= due && has_session {
                actions |= ACTION_SEND_KEEPALIVE;
            }
        }

        // Persistent keepalive
        if self.persistent_keepalive_ms > 0
            && has_session
            && now_ms.saturating_sub(self.last_send_ms) >= self.persistent_keepalive_ms
        {
            actions |= ACTION_SEND_KEEPALIVE;
        }

        actions
    }
}

pub(crate) struct Peer {
    /// Remote static public key
    pub spub: [u8; 32],
    /// Pre-shared key, all zeros when unset
    pub psk: [u8; 32],
    /// Precomputed `DH(s_priv_local, spub)`
    pub precomputed_ss: [u8; 32],
    /// Stamps mac1 on messages we send to this peer
    pub mac1_key: [u8; 32],
    /// Opens cookie replies this peer sends us
    pub cookie_key: [u8; 32],

    pub inner: Mutex<PeerInner>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::aead::CipherSuite;
    use crate::protocol::timeouts::{PERSISTENT_KEEPALIVE_MS, REKEY_AFTER_TIME_MS};

    fn keypair(id: u32, is_initiator: bool, now_ms: u64) -> Box<Keypair> {
        Box::new(Keypair::new(
            is_initiator,
            &[id as u8; 32],
            id,
            id + 100,
            CipherSuite::ChaCha20Poly1305,
            [false; FEATURE_COUNT],
            now_ms,
        ))
    }

    #[test]
    fn ring_promotion_discipline() {
        let mut ring = KeyRing::default();
        ring.curr = Some(keypair(1, true, 0));
        assert!(ring.install_next(keypair(2, true, 10)).is_none());

        // Promote: 1 moves to prev, 2 becomes curr
        assert!(ring.promote_next().is_none());
        assert_eq!(ring.curr.as_ref().unwrap().local_key_id, 2);
        assert_eq!(ring.prev.as_ref().unwrap().local_key_id, 1);
        assert!(ring.next.is_none());

        // Another cycle drops the oldest
        ring.install_next(keypair(3, true, 20));
        let dropped = ring.promote_next().unwrap();
        assert_eq!(dropped.local_key_id, 1);
        assert_eq!(ring.curr.as_ref().unwrap().local_key_id, 3);
        assert_eq!(ring.prev.as_ref().unwrap().local_key_id, 2);
    }

    #[test]
    fn ring_lookup_covers_all_slots() {
        let mut ring = KeyRing::default();
        ring.prev = Some(keypair(1, true, 0));
        ring.curr = Some(keypair(2, true, 0));
        ring.next = Some(keypair(3, true, 0));

        assert!(!ring.find_mut(1).unwrap().1);
        assert!(!ring.find_mut(2).unwrap().1);
        assert!(ring.find_mut(3).unwrap().1);
        assert!(ring.find_mut(4).is_none());
    }

    #[test]
    fn ring_expires_by_age() {
        let mut ring = KeyRing::default();
        ring.prev = Some(keypair(1, true, 0));
        ring.curr = Some(keypair(2, true, 100_000));

        let dropped = ring.expire(crate::protocol::timeouts::REJECT_AFTER_TIME_MS);
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].local_key_id, 1);
        assert!(ring.curr.is_some());
    }

    #[test]
    fn queue_is_bounded() {
        let mut inner = PeerInner::new();
        for i in 0..MAX_QUEUED_PACKETS_PER_PEER {
            assert!(inner.queue_packet(vec![i as u8]));
        }
        assert!(!inner.queue_packet(vec![0xff]));
        assert_eq!(inner.queued.len(), MAX_QUEUED_PACKETS_PER_PEER);
    }

    #[test]
    fn passive_keepalive_fires_once_due() {
        let mut inner = PeerInner::new();
        inner.ring.curr = Some(keypair(1, false, 0));

        inner.on_packet_received(1_000, false);
        assert_eq!(inner.check_timeouts(1_000), 0);
        assert_eq!(
            inner.check_timeouts(1_000 + KEEPALIVE_TIMEOUT_MS),
            ACTION_SEND_KEEPALIVE
        );

        // Sending anything cancels the obligation
        inner.on_packet_received(20_000, false);
        inner.on_packet_sent(21_000);
        assert_eq!(inner.check_timeouts(20_000 + KEEPALIVE_TIMEOUT_MS), 0);
    }

    #[test]
    fn keepalive_packets_owe_no_reply() {
        let mut inner = PeerInner::new();
        inner.ring.curr = Some(keypair(1, false, 0));
        inner.on_packet_received(1_000, true);
        assert_eq!(inner.check_timeouts(1_000 + KEEPALIVE_TIMEOUT_MS), 0);
    }

    #[test]
    fn persistent_keepalive_interval() {
        let mut inner = PeerInner::new();
        inner.ring.curr = Some(keypair(1, true, 0));
        inner.persistent_keepalive_ms = PERSISTENT_KEEPALIVE_MS;
        inner.on_packet_sent(0);

        assert_eq!(inner.check_timeouts(PERSISTENT_KEEPALIVE_MS - 1), 0);
        assert_eq!(
            inner.check_timeouts(PERSISTENT_KEEPALIVE_MS),
            ACTION_SEND_KEEPALIVE
        );
    }

    #[test]
    fn rekey_when_current_session_ages() {
        let mut inner = PeerInner::new();
        inner.ring.curr = Some(keypair(1, true, 0));

        assert_eq!(inner.check_timeouts(REKEY_AFTER_TIME_MS - 1), 0);
        assert_eq!(
            inner.check_timeouts(REKEY_AFTER_TIME_MS),
            ACTION_SEND_HANDSHAKE
        );

        // Responder-side sessions do not self-rekey
        let mut responder = PeerInner::new();
        responder.ring.curr = Some(keypair(1, false, 0));
        assert_eq!(responder.check_timeouts(REKEY_AFTER_TIME_MS), 0);
    }

    #[test]
    fn handshake_retry_then_give_up() {
        let mut inner = PeerInner::new();
        inner.handshake_init_sent_ms = Some(0);
        inner.handshake_attempts = 1;

        assert_eq!(inner.check_timeouts(REKEY_TIMEOUT_MS - 1), 0);
        assert_eq!(
            inner.check_timeouts(REKEY_TIMEOUT_MS),
            ACTION_SEND_HANDSHAKE
        );

        inner.handshake_attempts = MAX_HANDSHAKE_ATTEMPTS;
        assert_eq!(
            inner.check_timeouts(2 * REKEY_TIMEOUT_MS),
            ACTION_UNREACHABLE
        );
        assert!(inner.handshake_suppressed);

        // Suppression blocks the rekey path too
        inner.clear_handshake();
        inner.want_handshake = true;
        assert_eq!(inner.check_timeouts(3 * REKEY_TIMEOUT_MS), 0);
    }
}
