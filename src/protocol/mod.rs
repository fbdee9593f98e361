//! The protocol engine: peers, sessions, tables and timers
//!
//! Layered bottom-up: wire formats and the replay detector at the leaves,
//! the per-peer state machine above them, and the device dispatch on top.

pub mod cookie;
pub mod device;
pub mod extensions;
pub mod handshake;
pub mod ip_map;
pub mod keypair;
pub mod messages;
pub mod obfuscate;
pub mod ratelimit;
pub mod replay;

mod peer;

pub use device::{
    Device, DeviceDelegate, Incoming, Outgoing, PeerStats, TickOutcome, Transmit,
    UnknownPeerVerdict,
};
pub use keypair::Keypair;
pub use peer::PeerHandle;

use std::net::{IpAddr, SocketAddr};

/// Timer constants, all in milliseconds
pub mod timeouts {
    pub const COOKIE_SECRET_MAX_AGE_MS: u64 = 120_000;
    pub const COOKIE_SECRET_LATENCY_MS: u64 = 5_000;
    pub const REKEY_TIMEOUT_MS: u64 = 5_000;
    pub const KEEPALIVE_TIMEOUT_MS: u64 = 10_000;
    pub const REKEY_AFTER_TIME_MS: u64 = 120_000;
    pub const REJECT_AFTER_TIME_MS: u64 = 180_000;
    pub const PERSISTENT_KEEPALIVE_MS: u64 = 25_000;
    pub const MIN_HANDSHAKE_INTERVAL_MS: u64 = 20;
}

/// Hard protocol limits
pub mod limits {
    /// A session never encrypts at or past this counter
    pub const REJECT_AFTER_MESSAGES: u64 = u64::MAX - 2048;
    /// Counter threshold that requests a rekey
    pub const REKEY_AFTER_MESSAGES: u64 = u64::MAX - 0xffff;
    /// Consecutive unanswered handshakes before giving up
    pub const MAX_HANDSHAKE_ATTEMPTS: u8 = 20;
    /// Bounded send queue while no session exists
    pub const MAX_QUEUED_PACKETS_PER_PEER: usize = 128;
    /// Smallest well-formed long-header message
    pub const MESSAGE_MINIMUM_SIZE: usize = 16;
    /// Cap on the TLV extension field in handshake payloads
    pub const MAX_SIZE_OF_HANDSHAKE_EXTENSION: usize = 1024;
}

/// Pack a source IP into the 64-bit key the rate limiter bins on.
///
/// IPv4 maps directly; IPv6 folds the address through BLAKE2s so one /64
/// cannot trivially aim at chosen bins.
pub(crate) fn pack_ip(ip: &IpAddr) -> u64 {
    match ip {
        IpAddr::V4(v4) => u32::from_be_bytes(v4.octets()) as u64,
        IpAddr::V6(v6) => {
            let digest = crate::crypto::blake2s::hash(&v6.octets());
            u64::from_le_bytes(digest[..8].try_into().expect("8 bytes"))
        }
    }
}

/// Pack `(ip, port)` into the 64-bit key of the address-binding table
pub(crate) fn pack_addr(addr: &SocketAddr) -> u64 {
    match addr.ip() {
        IpAddr::V4(v4) => ((u32::from_be_bytes(v4.octets()) as u64) << 16) | addr.port() as u64,
        IpAddr::V6(v6) => {
            let mut buf = [0u8; 18];
            buf[..16].copy_from_slice(&v6.octets());
            buf[16..].copy_from_slice(&addr.port().to_be_bytes());
            let digest = crate::crypto::blake2s::hash(&buf);
            u64::from_le_bytes(digest[..8].try_into().expect("8 bytes"))
        }
    }
}

/// Canonical byte form of `(ip, port)` used for cookie MACs
pub(crate) fn addr_bytes(addr: &SocketAddr) -> Vec<u8> {
    let mut out = Vec::with_capacity(18);
    match addr.ip() {
        IpAddr::V4(v4) => out.extend_from_slice(&v4.octets()),
        IpAddr::V6(v6) => out.extend_from_slice(&v6.octets()),
    }
    out.extend_from_slice(&addr.port().to_be_bytes());
    out
}
