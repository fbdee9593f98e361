//! The device: peer registry, lookup tables and datagram dispatch
//!
//! One `Device` per local static key. Incoming datagrams are classified,
//! MAC-checked, rate-limited and routed to the owning peer; outgoing
//! inner packets are encrypted under the peer's current session or queued
//! behind a handshake. All mutation of handshake and timer state belongs
//! to the main thread; packet workers only take shared table reads plus
//! the per-peer mutex around a single seal/open.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use ipnet::IpNet;
use parking_lot::{Mutex, RwLock};
use rand::RngCore;

use crate::crypto::aead::CipherSuite;
use crate::crypto::{blake2s, noise, x25519};
use crate::error::{FerrotunError, ProtocolError, Result};
use crate::protocol::cookie::{create_cookie_reply, verify_mac1, CookieSecret};
use crate::protocol::extensions::{
    feature, negotiate_cipher, negotiate_features, vote, CompressionHint, ExtensionSet,
};
use crate::protocol::handshake::{self, timestamp_from_ms};
use crate::protocol::ip_map::IpToPeerMap;
use crate::protocol::keypair::Keypair;
use crate::protocol::limits::{MAX_QUEUED_PACKETS_PER_PEER, REKEY_AFTER_MESSAGES};
use crate::protocol::messages::{
    classify, reconstruct_counter, DataHeader, HandshakeCookie, HandshakeInitiation,
    HandshakeResponse, MessageType, ShortAck, ShortHeader,
};
use crate::protocol::obfuscate::Obfuscator;
use crate::protocol::peer::{
    Peer, PeerHandle, PeerInner, ACTION_SEND_HANDSHAKE, ACTION_SEND_KEEPALIVE, ACTION_UNREACHABLE,
};
use crate::protocol::ratelimit::RateLimiter;
use crate::protocol::timeouts::MIN_HANDSHAKE_INTERVAL_MS;
use crate::protocol::{pack_addr, pack_ip};

/// Minimum time between two insertions into one address-binding entry,
/// which gives each of the three slots at least three minutes of
/// residency.
const ADDR_INSERT_INTERVAL_MS: u64 = 60_000;

/// Number of cipher suites a peer may list
const MAX_CIPHERS: usize = 4;

/// Upper-layer hook for packets from unknown static keys
pub trait DeviceDelegate: Send + Sync {
    /// Called on an authenticated initiation whose static key matches no
    /// registered peer. `Retry` means the caller took the packet and may
    /// resubmit it after resolving the peer; `Drop` discards it.
    fn on_unknown_peer(&self, public_key: &[u8; 32], datagram: &[u8]) -> UnknownPeerVerdict;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnknownPeerVerdict {
    Retry,
    Drop,
}

/// A datagram ready for the UDP socket
#[derive(Debug, Clone)]
pub struct Transmit {
    pub dst: SocketAddr,
    pub datagram: Vec<u8>,
}

/// Result of processing one incoming datagram
#[derive(Debug)]
pub enum Incoming {
    /// Protocol reply to send back (handshake response, cookie reply)
    Reply(Transmit),
    /// Decrypted inner packet for the TUN side
    Data { peer: PeerHandle, packet: Vec<u8> },
    /// Authenticated empty payload; liveness only
    KeepAlive { peer: PeerHandle },
    /// Initiator-side handshake completion; the queue was flushed
    Established {
        peer: PeerHandle,
        transmits: Vec<Transmit>,
    },
    /// State was updated, nothing to emit (cookie reply, delegate took it)
    Consumed,
}

/// Result of submitting an inner packet for encryption
#[derive(Debug)]
pub enum Outgoing {
    Sent(Transmit),
    /// No session yet: packet queued, optionally with the handshake that
    /// was kicked off
    Queued { handshake: Option<Transmit> },
}

/// Everything a timer tick wants transmitted or reported
#[derive(Debug, Default)]
pub struct TickOutcome {
    pub transmits: Vec<Transmit>,
    /// Peers whose handshakes ran out of attempts this tick
    pub unreachable: Vec<PeerHandle>,
}

/// Handshake and traffic statistics snapshot for one peer
#[derive(Debug, Clone, Copy, Default)]
pub struct PeerStats {
    pub last_handshake_init_ms: u64,
    pub last_complete_handshake_ms: u64,
    pub total_handshake_attempts: u32,
    pub last_packet_sent_ms: u64,
    pub last_packet_received_ms: u64,
    pub queued_packets: usize,
}

/// Key-id table value: which peer owns the id, and whether it already
/// names an established keypair (false = reserved by an in-flight
/// initiator handshake).
struct KeyIdEntry {
    peer: PeerHandle,
    established: bool,
}

/// Address-binding entry: up to three keypairs recently seen from one
/// `(ip, port)`, round-robin replaced.
struct AddrEntry {
    slots: [Option<(PeerHandle, u32)>; 3],
    next_slot: u8,
    /// Number of keypairs whose back-reference names this entry
    ref_count: u8,
    /// None = never inserted
    time_of_last_insertion: Option<u64>,
}

impl AddrEntry {
    fn new() -> Self {
        Self {
            slots: [None; 3],
            next_slot: 0,
            ref_count: 0,
            time_of_last_insertion: None,
        }
    }
}

/// BLAKE2s-based counter-mode PRNG for key ids.
///
/// Hashes a counter block seeded with random words, squeezing eight
/// 32-bit outputs per block; reseeded on every cookie-secret rotation.
struct KeyIdGen {
    input: [u8; 40],
    output: [u8; 32],
    slot: usize,
}

impl KeyIdGen {
    fn new() -> Self {
        let mut gen = Self {
            input: [0u8; 40],
            output: [0u8; 32],
            slot: 8,
        };
        gen.reseed();
        gen
    }

    fn reseed(&mut self) {
        rand::rngs::OsRng.fill_bytes(&mut self.input[8..]);
        self.slot = 8;
    }

    fn next(&mut self) -> u32 {
        if self.slot == 8 {
            let counter = u64::from_le_bytes(self.input[..8].try_into().expect("8 bytes"));
            self.input[..8].copy_from_slice(&(counter.wrapping_add(1)).to_le_bytes());
            self.output = blake2s::hash(&self.input);
            self.slot = 0;
        }
        let word =
            u32::from_le_bytes(self.output[self.slot * 4..self.slot * 4 + 4].try_into().expect("4 bytes"));
        self.slot += 1;
        word
    }
}

pub struct Device {
    s_priv: [u8; 32],
    s_pub: [u8; 32],
    /// Verifies mac1 on messages addressed to us
    own_mac1_key: [u8; 32],
    /// Seals the cookies we hand out
    own_cookie_key: [u8; 32],

    /// Peer arena; handles are indices, never reused within a device
    peers: RwLock<Vec<Arc<Peer>>>,
    key_id_table: RwLock<HashMap<u32, KeyIdEntry>>,
    addr_table: RwLock<HashMap<u64, AddrEntry>>,
    ip_map: RwLock<IpToPeerMap>,

    cookie_secret: Mutex<CookieSecret>,
    rate_limiter: Mutex<RateLimiter>,
    id_gen: Mutex<KeyIdGen>,

    obfuscator: RwLock<Option<Obfuscator>>,
    compression_hint: RwLock<Option<CompressionHint>>,
    delegate: RwLock<Option<Box<dyn DeviceDelegate>>>,
}

impl Device {
    /// Initialize with the local static private key. The only terminal
    /// failure in the engine: a key the curve rejects outright.
    pub fn new(private_key: [u8; 32]) -> Result<Self> {
        if private_key.iter().all(|&b| b == 0) {
            return Err(crate::error::CryptoError::InvalidKeyLength {
                expected: 32,
                got: 0,
            }
            .into());
        }
        let s_pub = x25519::public_key(&private_key);
        Ok(Self {
            s_priv: private_key,
            s_pub,
            own_mac1_key: noise::mac1_key(&s_pub),
            own_cookie_key: noise::cookie_key(&s_pub),
            peers: RwLock::new(Vec::new()),
            key_id_table: RwLock::new(HashMap::new()),
            addr_table: RwLock::new(HashMap::new()),
            ip_map: RwLock::new(IpToPeerMap::new()),
            cookie_secret: Mutex::new(CookieSecret::new(0)),
            rate_limiter: Mutex::new(RateLimiter::new()),
            id_gen: Mutex::new(KeyIdGen::new()),
            obfuscator: RwLock::new(None),
            compression_hint: RwLock::new(None),
            delegate: RwLock::new(None),
        })
    }

    /// Convenience keypair generator for callers wiring up configs.
    pub fn generate_keypair() -> ([u8; 32], [u8; 32]) {
        x25519::generate_keypair()
    }

    pub fn public_key(&self) -> &[u8; 32] {
        &self.s_pub
    }

    /// Register a peer by its static public key, with an optional PSK.
    pub fn add_peer(&self, spub: [u8; 32], psk: Option<[u8; 32]>) -> Result<PeerHandle> {
        if !x25519::is_valid_public_key(&spub) {
            return Err(crate::error::CryptoError::DiffieHellman.into());
        }
        let peer = Arc::new(Peer {
            spub,
            psk: psk.unwrap_or([0u8; 32]),
            precomputed_ss: x25519::dh(&self.s_priv, &spub),
            mac1_key: noise::mac1_key(&spub),
            cookie_key: noise::cookie_key(&spub),
            inner: Mutex::new(PeerInner::new()),
        });
        let mut peers = self.peers.write();
        peers.push(peer);
        let handle = PeerHandle(peers.len() - 1);
        tracing::debug!(
            peer = handle.0,
            key = %x25519::key_fingerprint(&spub),
            "peer added"
        );
        Ok(handle)
    }

    pub fn set_endpoint(&self, peer: PeerHandle, endpoint: SocketAddr) {
        if let Some(peer) = self.get_peer(peer) {
            peer.inner.lock().endpoint = Some(endpoint);
        }
    }

    pub fn set_endpoint_change_allowed(&self, peer: PeerHandle, allowed: bool) {
        if let Some(peer) = self.get_peer(peer) {
            peer.inner.lock().allow_endpoint_change = allowed;
        }
    }

    pub fn add_allowed_cidr(&self, peer: PeerHandle, cidr: IpNet) {
        self.ip_map.write().insert(cidr, peer);
    }

    /// Egress peer selection for an inner destination address.
    pub fn lookup_peer_by_inner_ip(&self, ip: std::net::IpAddr) -> Option<PeerHandle> {
        self.ip_map.read().lookup(ip)
    }

    /// Persistent keepalive interval in seconds; 0 disables.
    pub fn set_persistent_keepalive(&self, peer: PeerHandle, secs: u32) {
        if let Some(peer) = self.get_peer(peer) {
            peer.inner.lock().persistent_keepalive_ms = secs as u64 * 1000;
        }
    }

    /// Append a cipher suite to the peer's preference list.
    pub fn add_cipher(&self, peer: PeerHandle, suite: CipherSuite) -> bool {
        match self.get_peer(peer) {
            Some(peer) => {
                let mut inner = peer.inner.lock();
                if inner.ciphers.len() >= MAX_CIPHERS || inner.ciphers.contains(&suite.id()) {
                    return false;
                }
                inner.ciphers.push(suite.id());
                true
            }
            None => false,
        }
    }

    pub fn set_cipher_prio(&self, peer: PeerHandle, prio: bool) {
        if let Some(peer) = self.get_peer(peer) {
            peer.inner.lock().cipher_prio = prio;
        }
    }

    /// Vote for a boolean feature (`vote::OFF..=vote::ENFORCES`).
    pub fn set_feature(&self, peer: PeerHandle, feature_id: usize, value: u8) {
        if feature_id >= crate::protocol::extensions::FEATURE_COUNT || value > vote::ENFORCES {
            return;
        }
        if let Some(peer) = self.get_peer(peer) {
            peer.inner.lock().features[feature_id] = value;
        }
    }

    /// Enable or disable header obfuscation with a shared passphrase.
    pub fn set_header_obfuscation(&self, key: Option<&str>) {
        *self.obfuscator.write() = key.map(Obfuscator::new);
    }

    pub fn set_compression_hint(&self, hint: CompressionHint) {
        *self.compression_hint.write() = Some(hint);
    }

    pub fn set_delegate(&self, delegate: Box<dyn DeviceDelegate>) {
        *self.delegate.write() = Some(delegate);
    }

    /// Drop every session and any in-flight handshake for a peer,
    /// returning it to the idle state. Queued packets are discarded.
    pub fn clear_peer(&self, peer: PeerHandle) {
        let Some(peer) = self.get_peer(peer) else {
            return;
        };
        let mut inner = peer.inner.lock();
        for dead in inner.ring.clear() {
            self.unlink_keypair(dead);
        }
        if let Some(old_id) = inner.clear_handshake() {
            self.release_key_id(old_id);
        }
        inner.queued.clear();
        inner.want_handshake = false;
        inner.handshake_attempts = 0;
    }

    pub fn peer_stats(&self, peer: PeerHandle) -> Option<PeerStats> {
        let peer = self.get_peer(peer)?;
        let inner = peer.inner.lock();
        Some(PeerStats {
            last_handshake_init_ms: inner.last_handshake_init_sent_ms,
            last_complete_handshake_ms: inner.last_complete_handshake_ms,
            total_handshake_attempts: inner.total_handshake_attempts,
            last_packet_sent_ms: inner.last_send_ms,
            last_packet_received_ms: inner.last_recv_ms,
            queued_packets: inner.queued.len(),
        })
    }

    fn get_peer(&self, handle: PeerHandle) -> Option<Arc<Peer>> {
        self.peers.read().get(handle.0).cloned()
    }

    fn find_peer_by_spub(&self, spub: &[u8; 32]) -> Option<(PeerHandle, Arc<Peer>)> {
        self.peers
            .read()
            .iter()
            .enumerate()
            .find(|(_, p)| p.spub == *spub)
            .map(|(i, p)| (PeerHandle(i), Arc::clone(p)))
    }

    /// Reserve a fresh nonzero key id for a peer.
    fn fresh_key_id(&self, peer: PeerHandle, established: bool) -> u32 {
        let mut id_gen = self.id_gen.lock();
        let mut table = self.key_id_table.write();
        loop {
            let id = id_gen.next();
            if id == 0 || table.contains_key(&id) {
                continue;
            }
            table.insert(id, KeyIdEntry { peer, established });
            return id;
        }
    }

    fn release_key_id(&self, id: u32) {
        self.key_id_table.write().remove(&id);
    }

    /// Unlink a dead keypair from both tables, then drop it (the session
    /// keys zeroize on drop). Runs under the owning peer's lock, after
    /// which no worker can reach the keypair again.
    fn unlink_keypair(&self, keypair: Box<Keypair>) {
        self.release_key_id(keypair.local_key_id);
        if let Some((addr_id, slot)) = keypair.addr_entry {
            let mut table = self.addr_table.write();
            if let Some(entry) = table.get_mut(&addr_id) {
                // The slot may have been round-robined to a newer keypair
                let ours = entry.slots[slot as usize]
                    .is_some_and(|(_, key_id)| key_id == keypair.local_key_id);
                if ours {
                    entry.slots[slot as usize] = None;
                }
                entry.ref_count = entry.ref_count.saturating_sub(1);
                if entry.ref_count == 0 {
                    table.remove(&addr_id);
                }
            }
        }
    }

    /// Bind a keypair to its peer's source address so the peer may start
    /// omitting the key id. Throttled per entry; the granted slot is
    /// queued for the next ack piggyback.
    fn bind_addr(&self, now_ms: u64, src: &SocketAddr, peer: PeerHandle, keypair: &mut Keypair) {
        keypair.did_attempt_addr_binding = true;
        let addr_id = pack_addr(src);
        let mut table = self.addr_table.write();
        let entry = table.entry(addr_id).or_insert_with(AddrEntry::new);
        if let Some(last) = entry.time_of_last_insertion {
            if now_ms.saturating_sub(last) < ADDR_INSERT_INTERVAL_MS {
                return;
            }
        }
        let slot = entry.next_slot as usize;
        entry.slots[slot] = Some((peer, keypair.local_key_id));
        entry.next_slot = ((slot + 1) % 3) as u8;
        entry.ref_count += 1;
        entry.time_of_last_insertion = Some(now_ms);

        keypair.addr_entry = Some((addr_id, slot as u8));
        keypair.broadcast_short_key = slot as u8 + 1;
    }

    fn obfuscate_out(&self, datagram: &mut [u8]) {
        if let Some(obfuscator) = self.obfuscator.read().as_ref() {
            obfuscator.scramble(datagram);
        }
    }

    /// Our extension payload for a handshake with this peer.
    fn build_extension_payload(&self, inner: &PeerInner) -> Vec<u8> {
        let compression = if inner.features[feature::IPZIP] != vote::OFF {
            *self.compression_hint.read()
        } else {
            None
        };
        ExtensionSet {
            features: inner.features,
            ciphers: inner.ciphers.clone(),
            cipher_prio: inner.cipher_prio,
            compression,
        }
        .encode()
    }

    /// Kick off (or retry) a handshake. Public entry points through here
    /// clear the attempts-exceeded suppression; the timer path does not.
    pub fn initiate_handshake(&self, now_ms: u64, peer: PeerHandle) -> Result<Transmit> {
        let peer_arc = self
            .get_peer(peer)
            .ok_or(ProtocolError::UnknownPeer)?;
        let mut inner = peer_arc.inner.lock();
        inner.handshake_suppressed = false;
        inner.handshake_attempts = 0;
        self.create_initiation_locked(now_ms, peer, &peer_arc, &mut inner)
    }

    fn create_initiation_locked(
        &self,
        now_ms: u64,
        handle: PeerHandle,
        peer: &Peer,
        inner: &mut PeerInner,
    ) -> Result<Transmit> {
        let endpoint = inner.endpoint.ok_or(ProtocolError::NoEndpoint)?;

        // A resend abandons the previous attempt and its reserved id
        if let Some(old_id) = inner.clear_handshake() {
            self.release_key_id(old_id);
        }

        let local_key_id = self.fresh_key_id(handle, false);
        let ext = self.build_extension_payload(inner);
        let (msg, transcript) = handshake::create_initiation(
            &self.s_pub,
            &peer.spub,
            &peer.precomputed_ss,
            local_key_id,
            timestamp_from_ms(now_ms),
            &ext,
        )?;

        let mut datagram = msg.to_bytes();
        let mac1 =
            handshake::seal_macs(&mut datagram, &peer.mac1_key, inner.cookie_cache.get(now_ms));

        inner.sent_mac1 = mac1;
        inner.expect_cookie_reply = true;
        inner.transcript = Some(transcript);
        inner.handshake_attempts = inner.handshake_attempts.saturating_add(1);
        inner.total_handshake_attempts += 1;
        inner.handshake_init_sent_ms = Some(now_ms);
        inner.last_handshake_init_sent_ms = now_ms;
        inner.want_handshake = false;

        self.obfuscate_out(&mut datagram);
        tracing::debug!(peer = handle.0, attempt = inner.handshake_attempts, "initiation sent");
        Ok(Transmit {
            dst: endpoint,
            datagram,
        })
    }

    /// Classify, authenticate and route one received datagram.
    ///
    /// The buffer is deobfuscated in place when obfuscation is on.
    pub fn handle_incoming_datagram(
        &self,
        now_ms: u64,
        datagram: &mut [u8],
        src: SocketAddr,
    ) -> Result<Incoming> {
        if let Some(obfuscator) = self.obfuscator.read().as_ref() {
            obfuscator.scramble(datagram);
        }
        match classify(datagram)? {
            Some(MessageType::HandshakeInitiation) => self.handle_initiation(now_ms, datagram, src),
            Some(MessageType::HandshakeResponse) => self.handle_response(now_ms, datagram, src),
            Some(MessageType::HandshakeCookie) => self.handle_cookie(now_ms, datagram),
            Some(MessageType::Data) => self.handle_data(now_ms, datagram, src),
            None => self.handle_short_data(now_ms, datagram, src),
        }
    }

    fn handle_initiation(
        &self,
        now_ms: u64,
        datagram: &[u8],
        src: SocketAddr,
    ) -> Result<Incoming> {
        let msg = HandshakeInitiation::from_bytes(datagram)?;
        verify_mac1(
            &self.own_mac1_key,
            HandshakeInitiation::mac1_region(datagram),
            &msg.mac1,
        )?;

        // Under load every initiation must prove a recent cookie; the
        // failure reply costs one XChaCha seal and no state.
        if self.rate_limiter.lock().is_used() {
            let secret = self.cookie_secret.lock();
            if !secret.verify_mac2(
                now_ms,
                &src,
                HandshakeInitiation::mac2_region(datagram),
                &msg.mac2,
            ) {
                let reply = create_cookie_reply(
                    &secret,
                    msg.sender_key_id,
                    &src,
                    &msg.mac1,
                    &self.own_cookie_key,
                )?;
                drop(secret);
                let mut datagram = reply.to_bytes();
                self.obfuscate_out(&mut datagram);
                tracing::debug!("under load, sent cookie reply");
                return Ok(Incoming::Reply(Transmit {
                    dst: src,
                    datagram,
                }));
            }
        }

        {
            let mut limiter = self.rate_limiter.lock();
            let admission = limiter.check(pack_ip(&src.ip()));
            if admission.is_rate_limited() {
                return Err(ProtocolError::RateLimited.into());
            }
            limiter.commit(&admission);
        }

        let progress = handshake::consume_initiation(&self.s_priv, &self.s_pub, &msg)?;
        let (handle, peer) = match self.find_peer_by_spub(&progress.initiator_spub) {
            Some(found) => found,
            None => {
                let verdict = self
                    .delegate
                    .read()
                    .as_ref()
                    .map(|d| d.on_unknown_peer(&progress.initiator_spub, datagram));
                return match verdict {
                    Some(UnknownPeerVerdict::Retry) => Ok(Incoming::Consumed),
                    _ => Err(ProtocolError::UnknownPeer.into()),
                };
            }
        };

        let (timestamp, ext_raw, progress) =
            handshake::finish_initiation(progress, &peer.precomputed_ss, &msg.timestamp_ext_enc)?;

        let mut inner = peer.inner.lock();

        if now_ms.saturating_sub(inner.last_handshake_init_recv_ms) < MIN_HANDSHAKE_INTERVAL_MS
            && inner.last_handshake_init_recv_ms != 0
        {
            return Err(ProtocolError::HandshakeFlood.into());
        }
        if timestamp <= inner.last_timestamp {
            return Err(ProtocolError::HandshakeStale.into());
        }

        let remote_ext = ExtensionSet::parse(&ext_raw)?;
        let enabled = negotiate_features(&inner.features, &remote_ext.features)?;
        let suite = negotiate_cipher(
            (&remote_ext.ciphers, remote_ext.cipher_prio),
            (&inner.ciphers, inner.cipher_prio),
        );

        let local_key_id = self.fresh_key_id(handle, true);
        let our_ext = self.build_extension_payload(&inner);
        let (resp_msg, chaining_key) = match handshake::create_response(
            progress,
            &peer.psk,
            local_key_id,
            msg.sender_key_id,
            &our_ext,
        ) {
            Ok(done) => done,
            Err(err) => {
                self.release_key_id(local_key_id);
                return Err(err);
            }
        };

        let mut keypair = Keypair::new(
            false,
            &chaining_key,
            local_key_id,
            msg.sender_key_id,
            suite,
            enabled,
            now_ms,
        );
        if enabled[feature::IPZIP] {
            keypair.compression = remote_ext.compression;
        }
        if let Some(displaced) = inner.ring.install_next(Box::new(keypair)) {
            self.unlink_keypair(displaced);
        }

        inner.last_timestamp = timestamp;
        inner.last_handshake_init_recv_ms = now_ms;
        if inner.allow_endpoint_change || inner.endpoint.is_none() {
            inner.endpoint = Some(src);
        }

        let mut datagram = resp_msg.to_bytes();
        handshake::seal_macs(&mut datagram, &peer.mac1_key, inner.cookie_cache.get(now_ms));
        self.obfuscate_out(&mut datagram);
        tracing::info!(peer = handle.0, suite = suite.id(), "handshake response sent");
        Ok(Incoming::Reply(Transmit {
            dst: src,
            datagram,
        }))
    }

    fn handle_response(&self, now_ms: u64, datagram: &[u8], src: SocketAddr) -> Result<Incoming> {
        let msg = HandshakeResponse::from_bytes(datagram)?;
        verify_mac1(
            &self.own_mac1_key,
            HandshakeResponse::mac1_region(datagram),
            &msg.mac1,
        )?;

        let handle = {
            let table = self.key_id_table.read();
            table
                .get(&msg.receiver_key_id)
                .map(|entry| entry.peer)
                .ok_or(ProtocolError::UnknownKeyId {
                    key_id: msg.receiver_key_id,
                })?
        };
        let peer = self.get_peer(handle).ok_or(ProtocolError::UnknownPeer)?;
        let mut inner = peer.inner.lock();

        let transcript = inner
            .transcript
            .as_ref()
            .filter(|t| t.local_key_id == msg.receiver_key_id)
            .ok_or(ProtocolError::UnknownKeyId {
                key_id: msg.receiver_key_id,
            })?;

        let (chaining_key, ext_raw) =
            handshake::consume_response(transcript, &self.s_priv, &peer.psk, &msg)?;

        let remote_ext = ExtensionSet::parse(&ext_raw)?;
        let enabled = negotiate_features(&inner.features, &remote_ext.features)?;
        let suite = negotiate_cipher(
            (&inner.ciphers, inner.cipher_prio),
            (&remote_ext.ciphers, remote_ext.cipher_prio),
        );

        let mut keypair = Keypair::new(
            true,
            &chaining_key,
            msg.receiver_key_id,
            msg.sender_key_id,
            suite,
            enabled,
            now_ms,
        );
        if enabled[feature::IPZIP] {
            keypair.compression = remote_ext.compression;
        }
        self.key_id_table
            .write()
            .entry(msg.receiver_key_id)
            .and_modify(|entry| entry.established = true);
        if let Some(displaced) = inner.ring.install_next(Box::new(keypair)) {
            self.unlink_keypair(displaced);
        }

        inner.transcript = None;
        inner.handshake_init_sent_ms = None;
        inner.handshake_attempts = 0;
        inner.handshake_suppressed = false;
        inner.expect_cookie_reply = false;
        inner.last_complete_handshake_ms = now_ms;
        if inner.allow_endpoint_change || inner.endpoint.is_none() {
            inner.endpoint = Some(src);
        }
        tracing::info!(peer = handle.0, suite = suite.id(), "session established");

        // Flush everything that waited for the session; an empty queue
        // still owes the responder one packet so it can confirm the key.
        let pending: Vec<Vec<u8>> = inner.queued.drain(..).collect();
        let mut transmits = Vec::new();
        if pending.is_empty() {
            if let Ok(t) = self.seal_outgoing_locked(now_ms, &mut inner, &[]) {
                transmits.push(t);
            }
        } else {
            for packet in pending {
                match self.seal_outgoing_locked(now_ms, &mut inner, &packet) {
                    Ok(t) => transmits.push(t),
                    Err(err) => {
                        tracing::warn!(error = %err, "dropped queued packet");
                    }
                }
            }
        }
        Ok(Incoming::Established {
            peer: handle,
            transmits,
        })
    }

    fn handle_cookie(&self, now_ms: u64, datagram: &[u8]) -> Result<Incoming> {
        let msg = HandshakeCookie::from_bytes(datagram)?;
        let handle = {
            let table = self.key_id_table.read();
            table
                .get(&msg.receiver_key_id)
                .map(|entry| entry.peer)
                .ok_or(ProtocolError::UnknownKeyId {
                    key_id: msg.receiver_key_id,
                })?
        };
        let peer = self.get_peer(handle).ok_or(ProtocolError::UnknownPeer)?;
        let mut inner = peer.inner.lock();
        if !inner.expect_cookie_reply {
            return Err(ProtocolError::MalformedMessage {
                reason: "unsolicited cookie reply",
            }
            .into());
        }
        let sent_mac1 = inner.sent_mac1;
        inner
            .cookie_cache
            .consume_reply(now_ms, &msg, &sent_mac1, &peer.cookie_key)?;
        inner.expect_cookie_reply = false;
        Ok(Incoming::Consumed)
    }

    fn handle_data(&self, now_ms: u64, datagram: &[u8], src: SocketAddr) -> Result<Incoming> {
        let header = DataHeader::from_bytes(datagram)?;
        let handle = {
            let table = self.key_id_table.read();
            let entry = table
                .get(&header.receiver_key_id)
                .ok_or(ProtocolError::UnknownKeyId {
                    key_id: header.receiver_key_id,
                })?;
            if !entry.established {
                return Err(ProtocolError::UnknownKeyId {
                    key_id: header.receiver_key_id,
                }
                .into());
            }
            entry.peer
        };
        let peer = self.get_peer(handle).ok_or(ProtocolError::UnknownPeer)?;
        let mut inner = peer.inner.lock();

        let (plaintext, is_next) = {
            let (keypair, is_next) = inner
                .ring
                .find_mut(header.receiver_key_id)
                .ok_or(ProtocolError::UnknownKeyId {
                    key_id: header.receiver_key_id,
                })?;
            if keypair.is_expired(now_ms) {
                return Err(ProtocolError::SessionExpired.into());
            }
            let plaintext = keypair.open(
                header.counter,
                &datagram[DataHeader::SIZE..],
                &datagram[..DataHeader::SIZE],
            )?;
            if keypair.enabled_features[feature::SKIP_KEYID_IN]
                && !keypair.did_attempt_addr_binding
            {
                self.bind_addr(now_ms, &src, handle, keypair);
            }
            (plaintext, is_next)
        };

        self.finish_inbound(now_ms, handle, &mut inner, src, is_next, plaintext)
    }

    fn handle_short_data(
        &self,
        now_ms: u64,
        datagram: &[u8],
        src: SocketAddr,
    ) -> Result<Incoming> {
        let header = ShortHeader::parse(datagram)?;
        let (handle, key_id) = if let Some(key_id) = header.explicit_key_id {
            let table = self.key_id_table.read();
            let entry = table
                .get(&key_id)
                .ok_or(ProtocolError::UnknownKeyId { key_id })?;
            if !entry.established {
                return Err(ProtocolError::UnknownKeyId { key_id }.into());
            }
            (entry.peer, key_id)
        } else {
            let table = self.addr_table.read();
            table
                .get(&pack_addr(&src))
                .and_then(|entry| entry.slots[(header.key_slot - 1) as usize])
                .ok_or(ProtocolError::UnknownAddrBinding)?
        };
        let peer = self.get_peer(handle).ok_or(ProtocolError::UnknownPeer)?;
        let mut inner = peer.inner.lock();

        let (plaintext, is_next) = {
            let (keypair, is_next) =
                inner
                    .ring
                    .find_mut(key_id)
                    .ok_or(ProtocolError::UnknownKeyId { key_id })?;
            if keypair.is_expired(now_ms) {
                return Err(ProtocolError::SessionExpired.into());
            }
            let counter = reconstruct_counter(
                keypair.expected_recv_counter(),
                header.counter_low,
                header.counter_width,
            );
            let plaintext = keypair.open(
                counter,
                &datagram[header.header_len..],
                &datagram[..header.header_len],
            )?;
            if keypair.enabled_features[feature::SKIP_KEYID_IN]
                && !keypair.did_attempt_addr_binding
            {
                self.bind_addr(now_ms, &src, handle, keypair);
            }
            if let Some(ack) = header.ack {
                if ack.key_grant != 0 {
                    keypair.can_use_short_key = ack.key_grant;
                }
                if ack.acked_width > 0 {
                    let acked = reconstruct_counter(
                        keypair.send_counter(),
                        ack.acked_low,
                        ack.acked_width,
                    );
                    keypair.record_ack(acked);
                }
            }
            (plaintext, is_next)
        };

        self.finish_inbound(now_ms, handle, &mut inner, src, is_next, plaintext)
    }

    /// Shared tail of the two data paths: promotion, roaming, timers.
    fn finish_inbound(
        &self,
        now_ms: u64,
        handle: PeerHandle,
        inner: &mut PeerInner,
        src: SocketAddr,
        is_next: bool,
        plaintext: Vec<u8>,
    ) -> Result<Incoming> {
        if is_next {
            // First authenticated traffic under the new key: switch over
            if let Some(dropped) = inner.ring.promote_next() {
                self.unlink_keypair(dropped);
            }
            tracing::debug!(peer = handle.0, "promoted next keypair");
        }
        if inner.allow_endpoint_change {
            inner.endpoint = Some(src);
        }
        inner.on_packet_received(now_ms, plaintext.is_empty());

        if plaintext.is_empty() {
            Ok(Incoming::KeepAlive { peer: handle })
        } else {
            Ok(Incoming::Data {
                peer: handle,
                packet: plaintext,
            })
        }
    }

    /// Encrypt an inner packet to a peer, or queue it behind a handshake.
    pub fn encrypt_outgoing(
        &self,
        now_ms: u64,
        peer: PeerHandle,
        packet: &[u8],
    ) -> Result<Outgoing> {
        let peer_arc = self.get_peer(peer).ok_or(ProtocolError::UnknownPeer)?;
        let mut inner = peer_arc.inner.lock();

        match self.seal_outgoing_locked(now_ms, &mut inner, packet) {
            Ok(transmit) => Ok(Outgoing::Sent(transmit)),
            Err(FerrotunError::Protocol(ProtocolError::NoSession)) => {
                if inner.queued.len() >= MAX_QUEUED_PACKETS_PER_PEER {
                    return Err(ProtocolError::QueueFull.into());
                }
                inner.queue_packet(packet.to_vec());
                let handshake = if inner.transcript.is_none() && !inner.handshake_suppressed {
                    self.create_initiation_locked(now_ms, peer, &peer_arc, &mut inner)
                        .ok()
                } else {
                    None
                };
                Ok(Outgoing::Queued { handshake })
            }
            Err(err) => Err(err),
        }
    }

    /// Seal a payload under the peer's current session. Fails with
    /// `NoSession` when no usable keypair exists.
    fn seal_outgoing_locked(
        &self,
        now_ms: u64,
        inner: &mut PeerInner,
        payload: &[u8],
    ) -> Result<Transmit> {
        let endpoint = inner.endpoint.ok_or(ProtocolError::NoEndpoint)?;

        if inner
            .ring
            .curr
            .as_ref()
            .is_some_and(|kp| kp.is_expired(now_ms))
        {
            if let Some(dead) = inner.ring.curr.take() {
                self.unlink_keypair(dead);
            }
        }
        // As initiator we switch to the fresh key on our first send; as
        // responder we wait until the peer proves possession inbound.
        if inner
            .ring
            .next
            .as_ref()
            .is_some_and(|kp| kp.is_initiator && !kp.is_expired(now_ms))
        {
            if let Some(dropped) = inner.ring.promote_next() {
                self.unlink_keypair(dropped);
            }
        }

        let mut want_handshake = false;
        let sealed: Result<Vec<u8>> = (|| {
            let keypair = inner
                .ring
                .curr
                .as_mut()
                .ok_or(ProtocolError::NoSession)?;

            let counter = match keypair.next_send_counter() {
                Ok(counter) => counter,
                Err(err) => {
                    want_handshake = true;
                    return Err(err.into());
                }
            };
            if counter + 1 >= REKEY_AFTER_MESSAGES {
                want_handshake = true;
            }

            // Short framing once negotiated; the key id is dropped only
            // after the peer granted us an address-binding slot.
            let use_short = keypair.enabled_features[feature::SHORT_HEADER];
            let key_slot = if keypair.enabled_features[feature::SKIP_KEYID_OUT] {
                keypair.can_use_short_key
            } else {
                0
            };
            let mut datagram;
            if let (true, Some(width)) = (use_short, keypair.short_counter_width()) {
                let acked = keypair.replay.expected_seq_nr();
                let ack = if keypair.broadcast_short_key != 0 || acked != 0 {
                    let acked_width = if acked == 0 {
                        0
                    } else if acked < 1 << 15 {
                        2
                    } else if acked < 1 << 31 {
                        4
                    } else {
                        6
                    };
                    Some(ShortAck {
                        key_grant: keypair.broadcast_short_key,
                        acked_low: acked,
                        acked_width,
                    })
                } else {
                    None
                };
                let header = ShortHeader {
                    key_slot,
                    explicit_key_id: (key_slot == 0).then_some(keypair.remote_key_id),
                    counter_low: counter,
                    counter_width: width,
                    ack,
                    header_len: 0,
                };
                datagram = Vec::with_capacity(8 + payload.len() + keypair.auth_tag_len);
                header.write(&mut datagram);
                let header_len = datagram.len();
                let body = keypair.seal(counter, payload, &datagram[..header_len])?;
                datagram.extend_from_slice(&body);
                if ack.is_some() {
                    keypair.broadcast_short_key = 0;
                }
            } else {
                datagram =
                    Vec::with_capacity(DataHeader::SIZE + payload.len() + keypair.auth_tag_len);
                DataHeader {
                    receiver_key_id: keypair.remote_key_id,
                    counter,
                }
                .write(&mut datagram);
                let body = keypair.seal(counter, payload, &datagram[..DataHeader::SIZE])?;
                datagram.extend_from_slice(&body);
            }
            Ok(datagram)
        })();

        if want_handshake {
            inner.want_handshake = true;
        }
        let mut datagram = sealed?;
        inner.on_packet_sent(now_ms);
        self.obfuscate_out(&mut datagram);
        Ok(Transmit {
            dst: endpoint,
            datagram,
        })
    }

    /// Once-per-second maintenance: cookie rotation, rate-limiter decay,
    /// per-peer timers (rekey, keepalives, retries, expiry).
    pub fn tick(&self, now_ms: u64) -> TickOutcome {
        let mut outcome = TickOutcome::default();

        if self.cookie_secret.lock().rotate_if_stale(now_ms) {
            self.id_gen.lock().reseed();
            tracing::debug!("cookie secret rotated");
        }

        {
            let mut seed = [0u32; 5];
            let mut rng = rand::rngs::OsRng;
            for word in seed.iter_mut() {
                *word = rng.next_u32();
            }
            self.rate_limiter.lock().periodic(seed);
        }

        let peers: Vec<Arc<Peer>> = self.peers.read().clone();
        for (index, peer) in peers.iter().enumerate() {
            let handle = PeerHandle(index);
            let mut inner = peer.inner.lock();

            for dead in inner.ring.expire(now_ms) {
                tracing::debug!(peer = index, key_id = dead.local_key_id, "keypair expired");
                self.unlink_keypair(dead);
            }

            let actions = inner.check_timeouts(now_ms);
            if actions & ACTION_UNREACHABLE != 0 {
                if let Some(old_id) = inner.clear_handshake() {
                    self.release_key_id(old_id);
                }
                tracing::warn!(peer = index, "handshake attempts exceeded, giving up");
                outcome.unreachable.push(handle);
            }
            if actions & ACTION_SEND_HANDSHAKE != 0 {
                match self.create_initiation_locked(now_ms, handle, peer, &mut inner) {
                    Ok(transmit) => outcome.transmits.push(transmit),
                    Err(err) => tracing::debug!(peer = index, error = %err, "handshake deferred"),
                }
            }
            if actions & ACTION_SEND_KEEPALIVE != 0 {
                if let Ok(transmit) = self.seal_outgoing_locked(now_ms, &mut inner, &[]) {
                    outcome.transmits.push(transmit);
                }
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Mutex as StdMutex;

    use crate::crypto::aead::TAG_LEN_SHORT;
    use crate::protocol::limits::MAX_QUEUED_PACKETS_PER_PEER;
    use crate::protocol::timeouts::{
        REJECT_AFTER_TIME_MS, REKEY_AFTER_TIME_MS, REKEY_TIMEOUT_MS,
    };

    fn sock(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), port)
    }

    struct Pair {
        a: Device,
        b: Device,
        pa: PeerHandle,
        pb: PeerHandle,
        addr_a: SocketAddr,
        addr_b: SocketAddr,
    }

    fn pair_with_psk(psk_a: Option<[u8; 32]>, psk_b: Option<[u8; 32]>) -> Pair {
        let (a_priv, a_pub) = Device::generate_keypair();
        let (b_priv, b_pub) = Device::generate_keypair();
        let a = Device::new(a_priv).unwrap();
        let b = Device::new(b_priv).unwrap();
        let addr_a = sock(1111);
        let addr_b = sock(2222);
        let pa = a.add_peer(b_pub, psk_a).unwrap();
        a.set_endpoint(pa, addr_b);
        let pb = b.add_peer(a_pub, psk_b).unwrap();
        b.set_endpoint(pb, addr_a);
        Pair {
            a,
            b,
            pa,
            pb,
            addr_a,
            addr_b,
        }
    }

    fn pair() -> Pair {
        pair_with_psk(None, None)
    }

    fn deliver(
        device: &Device,
        now_ms: u64,
        transmit: &Transmit,
        from: SocketAddr,
    ) -> Result<Incoming> {
        let mut buf = transmit.datagram.clone();
        device.handle_incoming_datagram(now_ms, &mut buf, from)
    }

    /// Drive a full handshake from A; returns A's post-handshake flush.
    fn establish(p: &Pair, now_ms: u64) -> Vec<Transmit> {
        let init = p.a.initiate_handshake(now_ms, p.pa).unwrap();
        let reply = match deliver(&p.b, now_ms, &init, p.addr_a).unwrap() {
            Incoming::Reply(t) => t,
            other => panic!("expected response, got {other:?}"),
        };
        let flushed = match deliver(&p.a, now_ms + 1, &reply, p.addr_b).unwrap() {
            Incoming::Established { transmits, .. } => transmits,
            other => panic!("expected established, got {other:?}"),
        };
        // Settle the admission counters so later initiations in a test do
        // not trip the under-load cookie path
        p.a.rate_limiter.lock().periodic([0; 5]);
        p.b.rate_limiter.lock().periodic([0; 5]);
        flushed
    }

    fn sent(out: Outgoing) -> Transmit {
        match out {
            Outgoing::Sent(t) => t,
            other => panic!("expected sent, got {other:?}"),
        }
    }

    fn with_curr<R>(device: &Device, peer: PeerHandle, f: impl FnOnce(&Keypair) -> R) -> R {
        let arc = device.get_peer(peer).unwrap();
        let inner = arc.inner.lock();
        f(inner.ring.curr.as_ref().expect("current keypair"))
    }

    #[test]
    fn s1_clean_handshake_first_data_counter_zero() {
        let p = pair();

        // Data submitted before any session queues and starts the handshake
        let init = match p.a.encrypt_outgoing(0, p.pa, &[0xab; 100]).unwrap() {
            Outgoing::Queued {
                handshake: Some(t),
            } => t,
            other => panic!("expected queued with handshake, got {other:?}"),
        };
        let reply = match deliver(&p.b, 0, &init, p.addr_a).unwrap() {
            Incoming::Reply(t) => t,
            other => panic!("expected response, got {other:?}"),
        };
        let flushed = match deliver(&p.a, 1, &reply, p.addr_b).unwrap() {
            Incoming::Established { transmits, .. } => transmits,
            other => panic!("expected established, got {other:?}"),
        };
        assert_eq!(flushed.len(), 1);

        match deliver(&p.b, 2, &flushed[0], p.addr_a).unwrap() {
            Incoming::Data { packet, .. } => assert_eq!(packet, vec![0xab; 100]),
            other => panic!("expected data, got {other:?}"),
        }
        // Counter 0 accepted: window bit set, next expected is 1
        with_curr(&p.b, p.pb, |kp| assert_eq!(kp.expected_recv_counter(), 1));
    }

    #[test]
    fn s2_replay_rejected_without_window_movement() {
        let p = pair();
        let flushed = establish(&p, 0);
        deliver(&p.b, 1, &flushed[0], p.addr_a).unwrap();

        // Counters 1..=5; only counter 5 is delivered
        let mut last = None;
        for _ in 0..5 {
            last = Some(sent(p.a.encrypt_outgoing(2, p.pa, b"payload").unwrap()));
        }
        let t5 = last.unwrap();

        assert!(matches!(
            deliver(&p.b, 3, &t5, p.addr_a).unwrap(),
            Incoming::Data { .. }
        ));
        with_curr(&p.b, p.pb, |kp| assert_eq!(kp.expected_recv_counter(), 6));

        let err = deliver(&p.b, 4, &t5, p.addr_a).unwrap_err();
        assert!(matches!(
            err,
            FerrotunError::Protocol(ProtocolError::ReplayRejected { counter: 5 })
        ));
        with_curr(&p.b, p.pb, |kp| assert_eq!(kp.expected_recv_counter(), 6));
    }

    #[test]
    fn s3_cookie_under_load() {
        let p = pair();
        // Put B under load
        {
            let mut limiter = p.b.rate_limiter.lock();
            let admission = limiter.check(0x7f00_0099);
            limiter.commit(&admission);
        }
        assert!(p.b.rate_limiter.lock().is_used());

        // First initiation carries no mac2: answered by a cookie, no state
        let init = p.a.initiate_handshake(0, p.pa).unwrap();
        let cookie = match deliver(&p.b, 0, &init, p.addr_a).unwrap() {
            Incoming::Reply(t) => t,
            other => panic!("expected cookie reply, got {other:?}"),
        };
        assert_eq!(cookie.datagram.len(), HandshakeCookie::SIZE);
        assert_eq!(cookie.datagram[0], 3);
        {
            let arc = p.b.get_peer(p.pb).unwrap();
            let inner = arc.inner.lock();
            assert!(inner.ring.next.is_none() && inner.ring.curr.is_none());
        }

        // A caches the cookie and retries with a valid mac2
        assert!(matches!(
            deliver(&p.a, 1, &cookie, p.addr_b).unwrap(),
            Incoming::Consumed
        ));
        let retry = p.a.initiate_handshake(2, p.pa).unwrap();
        let reply = match deliver(&p.b, 2, &retry, p.addr_a).unwrap() {
            Incoming::Reply(t) => t,
            other => panic!("expected response after mac2, got {other:?}"),
        };
        assert_eq!(reply.datagram[0], 2);
        assert!(matches!(
            deliver(&p.a, 3, &reply, p.addr_b).unwrap(),
            Incoming::Established { .. }
        ));
    }

    #[test]
    fn s4_rekey_on_time() {
        let p = pair();
        let flushed = establish(&p, 0);
        deliver(&p.b, 1, &flushed[0], p.addr_a).unwrap();
        let old_id = with_curr(&p.a, p.pa, |kp| kp.local_key_id);

        assert!(p.a.tick(REKEY_AFTER_TIME_MS - 1).transmits.is_empty());

        // Session aged out: the tick starts the rekey handshake
        let outcome = p.a.tick(REKEY_AFTER_TIME_MS + 1);
        assert_eq!(outcome.transmits.len(), 1);

        let now = REKEY_AFTER_TIME_MS + 2;
        let reply = match deliver(&p.b, now, &outcome.transmits[0], p.addr_a).unwrap() {
            Incoming::Reply(t) => t,
            other => panic!("expected response, got {other:?}"),
        };
        let flushed = match deliver(&p.a, now + 1, &reply, p.addr_b).unwrap() {
            Incoming::Established { transmits, .. } => transmits,
            other => panic!("expected established, got {other:?}"),
        };

        // A switched on its first send under the new key
        let new_id = with_curr(&p.a, p.pa, |kp| kp.local_key_id);
        assert_ne!(new_id, old_id);

        // B switches on its first inbound under the new key
        deliver(&p.b, now + 2, &flushed[0], p.addr_a).unwrap();
        {
            let arc = p.b.get_peer(p.pb).unwrap();
            let inner = arc.inner.lock();
            assert!(inner.ring.prev.is_some());
            assert!(inner.ring.next.is_none());
        }
    }

    #[test]
    fn s5_attempts_exceeded_then_external_trigger() {
        let p = pair();
        p.a.initiate_handshake(0, p.pa).unwrap();

        let mut sent_initiations = 1;
        let mut now = 0;
        let mut gave_up = false;
        for _ in 0..40 {
            now += REKEY_TIMEOUT_MS;
            let outcome = p.a.tick(now);
            if !outcome.unreachable.is_empty() {
                assert_eq!(outcome.unreachable, vec![p.pa]);
                assert!(outcome.transmits.is_empty());
                gave_up = true;
                break;
            }
            sent_initiations += outcome.transmits.len();
        }
        assert!(gave_up);
        assert_eq!(sent_initiations, 20);

        // Suppressed: timers stay quiet
        let outcome = p.a.tick(now + REKEY_TIMEOUT_MS);
        assert!(outcome.transmits.is_empty() && outcome.unreachable.is_empty());

        // An explicit trigger re-arms the handshake
        assert!(p.a.initiate_handshake(now + 10_000, p.pa).is_ok());
    }

    #[test]
    fn s6_three_slot_overlap() {
        let p = pair();
        let flushed = establish(&p, 0);
        deliver(&p.b, 1, &flushed[0], p.addr_a).unwrap();

        // Rekey at t=10s
        let init = p.a.initiate_handshake(10_000, p.pa).unwrap();
        let reply = match deliver(&p.b, 10_000, &init, p.addr_a).unwrap() {
            Incoming::Reply(t) => t,
            other => panic!("expected response, got {other:?}"),
        };
        let flushed2 = match deliver(&p.a, 10_001, &reply, p.addr_b).unwrap() {
            Incoming::Established { transmits, .. } => transmits,
            other => panic!("expected established, got {other:?}"),
        };
        {
            let arc = p.a.get_peer(p.pa).unwrap();
            let inner = arc.inner.lock();
            assert!(inner.ring.prev.is_some() && inner.ring.curr.is_some());
        }

        // B has not switched yet and sends under the old key; A decrypts
        // through its prev slot
        let under_old = sent(p.b.encrypt_outgoing(10_002, p.pb, b"under old").unwrap());
        match deliver(&p.a, 10_003, &under_old, p.addr_b).unwrap() {
            Incoming::Data { packet, .. } => assert_eq!(packet, b"under old"),
            other => panic!("expected data, got {other:?}"),
        }

        // First inbound under the new key promotes on B
        deliver(&p.b, 10_004, &flushed2[0], p.addr_a).unwrap();
        let under_new = sent(p.b.encrypt_outgoing(10_005, p.pb, b"under new").unwrap());
        match deliver(&p.a, 10_006, &under_new, p.addr_b).unwrap() {
            Incoming::Data { packet, .. } => assert_eq!(packet, b"under new"),
            other => panic!("expected data, got {other:?}"),
        }

        // The demoted keypair dies 180 s after its creation
        p.a.tick(REJECT_AFTER_TIME_MS + 1);
        {
            let arc = p.a.get_peer(p.pa).unwrap();
            let inner = arc.inner.lock();
            assert!(inner.ring.prev.is_none());
            assert!(inner.ring.curr.is_some());
        }
    }

    #[test]
    fn outbound_mac1_verifies_under_recipient_key() {
        let p = pair();
        let init = p.a.initiate_handshake(0, p.pa).unwrap();
        let msg = HandshakeInitiation::from_bytes(&init.datagram).unwrap();
        assert!(verify_mac1(
            &p.b.own_mac1_key,
            HandshakeInitiation::mac1_region(&init.datagram),
            &msg.mac1
        )
        .is_ok());

        let mut corrupted = init.clone();
        corrupted.datagram[20] ^= 1;
        assert!(matches!(
            deliver(&p.b, 0, &corrupted, p.addr_a).unwrap_err(),
            FerrotunError::Protocol(ProtocolError::BadMac1)
        ));
    }

    #[test]
    fn initiation_replay_is_flood_then_stale() {
        let p = pair();
        let init = p.a.initiate_handshake(5_000, p.pa).unwrap();
        assert!(matches!(
            deliver(&p.b, 5_000, &init, p.addr_a).unwrap(),
            Incoming::Reply(_)
        ));

        // Within the minimum interval: flood-dropped
        p.b.rate_limiter.lock().periodic([0; 5]);
        assert!(matches!(
            deliver(&p.b, 5_010, &init, p.addr_a).unwrap_err(),
            FerrotunError::Protocol(ProtocolError::HandshakeFlood)
        ));
        // Past the interval: the repeated timestamp is stale
        p.b.rate_limiter.lock().periodic([0; 5]);
        assert!(matches!(
            deliver(&p.b, 5_100, &init, p.addr_a).unwrap_err(),
            FerrotunError::Protocol(ProtocolError::HandshakeStale)
        ));
    }

    #[test]
    fn expired_keypair_rejects_traffic() {
        let p = pair();
        let flushed = establish(&p, 0);
        deliver(&p.b, 1, &flushed[0], p.addr_a).unwrap();

        let late = sent(p.a.encrypt_outgoing(2, p.pa, b"late").unwrap());
        let err = deliver(&p.b, REJECT_AFTER_TIME_MS + 2, &late, p.addr_a).unwrap_err();
        assert!(matches!(
            err,
            FerrotunError::Protocol(ProtocolError::SessionExpired)
        ));
    }

    #[test]
    fn outgoing_without_session_queues_and_initiates() {
        let p = pair();
        assert!(matches!(
            p.a.encrypt_outgoing(0, p.pa, b"q1").unwrap(),
            Outgoing::Queued {
                handshake: Some(_)
            }
        ));
        // Handshake already in flight: queue silently
        assert!(matches!(
            p.a.encrypt_outgoing(1, p.pa, b"q2").unwrap(),
            Outgoing::Queued { handshake: None }
        ));

        for _ in 0..MAX_QUEUED_PACKETS_PER_PEER - 2 {
            p.a.encrypt_outgoing(2, p.pa, b"fill").unwrap();
        }
        assert!(matches!(
            p.a.encrypt_outgoing(3, p.pa, b"overflow").unwrap_err(),
            FerrotunError::Protocol(ProtocolError::QueueFull)
        ));
    }

    #[test]
    fn unknown_peer_without_delegate_drops() {
        let p = pair();
        let (c_priv, _c_pub) = Device::generate_keypair();
        let c = Device::new(c_priv).unwrap();
        let pc = c.add_peer(*p.b.public_key(), None).unwrap();
        c.set_endpoint(pc, p.addr_b);

        let init = c.initiate_handshake(0, pc).unwrap();
        assert!(matches!(
            deliver(&p.b, 0, &init, sock(3333)).unwrap_err(),
            FerrotunError::Protocol(ProtocolError::UnknownPeer)
        ));
    }

    #[test]
    fn unknown_peer_delegate_retry_consumes() {
        struct Recorder {
            seen: Arc<StdMutex<Option<[u8; 32]>>>,
        }
        impl DeviceDelegate for Recorder {
            fn on_unknown_peer(
                &self,
                public_key: &[u8; 32],
                _datagram: &[u8],
            ) -> UnknownPeerVerdict {
                *self.seen.lock().unwrap() = Some(*public_key);
                UnknownPeerVerdict::Retry
            }
        }

        let p = pair();
        let seen = Arc::new(StdMutex::new(None));
        p.b.set_delegate(Box::new(Recorder { seen: seen.clone() }));

        let (c_priv, c_pub) = Device::generate_keypair();
        let c = Device::new(c_priv).unwrap();
        let pc = c.add_peer(*p.b.public_key(), None).unwrap();
        c.set_endpoint(pc, p.addr_b);

        let init = c.initiate_handshake(0, pc).unwrap();
        assert!(matches!(
            deliver(&p.b, 0, &init, sock(3333)).unwrap(),
            Incoming::Consumed
        ));
        assert_eq!(seen.lock().unwrap().unwrap(), c_pub);
    }

    #[test]
    fn psk_must_match() {
        let good = pair_with_psk(Some([7u8; 32]), Some([7u8; 32]));
        establish(&good, 0);

        let bad = pair_with_psk(Some([1u8; 32]), Some([2u8; 32]));
        let init = bad.a.initiate_handshake(0, bad.pa).unwrap();
        let reply = match deliver(&bad.b, 0, &init, bad.addr_a).unwrap() {
            Incoming::Reply(t) => t,
            other => panic!("expected response, got {other:?}"),
        };
        // The PSK is mixed into the response; A cannot open it
        assert!(deliver(&bad.a, 1, &reply, bad.addr_b).is_err());
    }

    #[test]
    fn cipher_suite_negotiation_end_to_end() {
        let p = pair();
        p.a.add_cipher(p.pa, CipherSuite::Aes256Gcm);
        p.a.add_cipher(p.pa, CipherSuite::ChaCha20Poly1305);
        p.b.add_cipher(p.pb, CipherSuite::Aes128Gcm);
        p.b.add_cipher(p.pb, CipherSuite::Aes256Gcm);
        p.b.set_cipher_prio(p.pb, true);

        let flushed = establish(&p, 0);
        // Responder priority order picks its first overlap: AES-256-GCM
        with_curr(&p.a, p.pa, |kp| {
            assert_eq!(kp.cipher_suite, CipherSuite::Aes256Gcm)
        });
        deliver(&p.b, 1, &flushed[0], p.addr_a).unwrap();
        with_curr(&p.b, p.pb, |kp| {
            assert_eq!(kp.cipher_suite, CipherSuite::Aes256Gcm)
        });

        let t = sent(p.a.encrypt_outgoing(2, p.pa, b"over aes").unwrap());
        match deliver(&p.b, 3, &t, p.addr_a).unwrap() {
            Incoming::Data { packet, .. } => assert_eq!(packet, b"over aes"),
            other => panic!("expected data, got {other:?}"),
        }
    }

    #[test]
    fn short_header_negotiated_end_to_end() {
        let p = pair();
        for (dev, peer) in [(&p.a, p.pa), (&p.b, p.pb)] {
            dev.set_feature(peer, feature::SHORT_HEADER, vote::WANTS);
            dev.set_feature(peer, feature::SHORT_MAC, vote::WANTS);
            dev.set_feature(peer, feature::SKIP_KEYID_IN, vote::WANTS);
            dev.set_feature(peer, feature::SKIP_KEYID_OUT, vote::WANTS);
        }

        let flushed = establish(&p, 0);
        // Already short-framed, with the key id still explicit
        assert_ne!(flushed[0].datagram[0] & 0x80, 0);
        with_curr(&p.a, p.pa, |kp| assert_eq!(kp.auth_tag_len, TAG_LEN_SHORT));
        deliver(&p.b, 1, &flushed[0], p.addr_a).unwrap();

        // B's reply carries the address-binding grant for A
        let from_b = sent(p.b.encrypt_outgoing(2, p.pb, b"from b").unwrap());
        assert_ne!(from_b.datagram[0] & 0x80, 0);
        match deliver(&p.a, 3, &from_b, p.addr_b).unwrap() {
            Incoming::Data { packet, .. } => assert_eq!(packet, b"from b"),
            other => panic!("expected data, got {other:?}"),
        }

        // A now omits the key id entirely (slot bits set)
        let from_a = sent(p.a.encrypt_outgoing(4, p.pa, b"from a").unwrap());
        assert_ne!(from_a.datagram[0] & 0x60, 0);
        match deliver(&p.b, 5, &from_a, p.addr_a).unwrap() {
            Incoming::Data { packet, .. } => assert_eq!(packet, b"from a"),
            other => panic!("expected data, got {other:?}"),
        }
        with_curr(&p.a, p.pa, |kp| assert_ne!(kp.can_use_short_key, 0));
    }

    #[test]
    fn obfuscation_end_to_end() {
        let p = pair();
        p.a.set_header_obfuscation(Some("shared secret phrase"));
        p.b.set_header_obfuscation(Some("shared secret phrase"));

        let init = p.a.initiate_handshake(0, p.pa).unwrap();
        // The type field must not appear on the wire
        assert_ne!(&init.datagram[..4], &[1, 0, 0, 0]);

        let reply = match deliver(&p.b, 0, &init, p.addr_a).unwrap() {
            Incoming::Reply(t) => t,
            other => panic!("expected response, got {other:?}"),
        };
        let flushed = match deliver(&p.a, 1, &reply, p.addr_b).unwrap() {
            Incoming::Established { transmits, .. } => transmits,
            other => panic!("expected established, got {other:?}"),
        };
        assert!(matches!(
            deliver(&p.b, 2, &flushed[0], p.addr_a).unwrap(),
            Incoming::KeepAlive { .. }
        ));

        let t = sent(p.a.encrypt_outgoing(3, p.pa, b"obfuscated").unwrap());
        assert_ne!(t.datagram[0], 4);
        match deliver(&p.b, 4, &t, p.addr_a).unwrap() {
            Incoming::Data { packet, .. } => assert_eq!(packet, b"obfuscated"),
            other => panic!("expected data, got {other:?}"),
        }
    }

    #[test]
    fn key_ids_are_unique_and_released() {
        let p = pair();
        let flushed = establish(&p, 0);
        deliver(&p.b, 1, &flushed[0], p.addr_a).unwrap();

        let ids: Vec<u32> = {
            let arc = p.a.get_peer(p.pa).unwrap();
            let inner = arc.inner.lock();
            inner.ring.iter().map(|kp| kp.local_key_id).collect()
        };
        assert_eq!(ids.len(), 1);
        assert!(p.a.key_id_table.read().contains_key(&ids[0]));

        // Expiry removes both the slot and the table entry
        p.a.tick(REJECT_AFTER_TIME_MS + 1);
        assert!(!p.a.key_id_table.read().contains_key(&ids[0]));
    }

    #[test]
    fn device_is_shareable_across_workers() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Device>();
    }

    #[test]
    fn clear_peer_resets_to_idle() {
        let p = pair();
        let flushed = establish(&p, 0);
        deliver(&p.b, 1, &flushed[0], p.addr_a).unwrap();

        let stats = p.a.peer_stats(p.pa).unwrap();
        assert_eq!(stats.total_handshake_attempts, 1);
        assert_eq!(stats.last_complete_handshake_ms, 1);

        p.a.clear_peer(p.pa);
        assert!(p.a.key_id_table.read().is_empty());
        // Back to idle: new traffic queues behind a fresh handshake
        assert!(matches!(
            p.a.encrypt_outgoing(2, p.pa, b"data").unwrap(),
            Outgoing::Queued {
                handshake: Some(_)
            }
        ));
    }

    #[test]
    fn keepalive_roundtrip_after_establish() {
        let p = pair();
        let flushed = establish(&p, 0);
        // The confirmation flush is an empty payload
        match deliver(&p.b, 1, &flushed[0], p.addr_a).unwrap() {
            Incoming::KeepAlive { peer } => assert_eq!(peer, p.pb),
            other => panic!("expected keepalive, got {other:?}"),
        }
    }

    #[test]
    fn endpoint_roams_with_authenticated_traffic() {
        let p = pair();
        let flushed = establish(&p, 0);
        deliver(&p.b, 1, &flushed[0], p.addr_a).unwrap();

        // A moves to a new source address
        let roamed = sock(4444);
        let t = sent(p.a.encrypt_outgoing(2, p.pa, b"roam").unwrap());
        deliver(&p.b, 3, &t, roamed).unwrap();

        let reply = sent(p.b.encrypt_outgoing(4, p.pb, b"back").unwrap());
        assert_eq!(reply.dst, roamed);

        // Pinned endpoints do not move
        p.b.set_endpoint_change_allowed(p.pb, false);
        let t = sent(p.a.encrypt_outgoing(5, p.pa, b"again").unwrap());
        deliver(&p.b, 6, &t, sock(5555)).unwrap();
        let reply = sent(p.b.encrypt_outgoing(7, p.pb, b"still").unwrap());
        assert_eq!(reply.dst, roamed);
    }
}
