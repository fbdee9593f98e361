//! ferrotun - WireGuard-compatible VPN protocol engine
//!
//! The core state machine of a WireGuard endpoint with the TunSafe
//! handshake extensions: cipher-suite negotiation, boolean feature
//! negotiation, short-header data framing with truncated counters, the
//! 8-byte MAC option and optional header obfuscation.
//!
//! # Scope
//!
//! This crate is transport-agnostic. It consumes datagrams and a
//! millisecond clock, and produces datagrams, decrypted inner packets and
//! timer-driven transmissions; sockets, TUN devices and configuration
//! live in the embedding application.
//!
//! # Usage
//!
//! ```no_run
//! use ferrotun::{Device, Incoming};
//!
//! fn main() -> anyhow::Result<()> {
//!     let (private_key, _public) = Device::generate_keypair();
//!     let device = Device::new(private_key)?;
//!
//!     let (_, peer_public) = Device::generate_keypair();
//!     let peer = device.add_peer(peer_public, None)?;
//!     device.set_endpoint(peer, "203.0.113.7:51820".parse()?);
//!     device.add_allowed_cidr(peer, "10.0.0.0/24".parse()?);
//!
//!     // Main loop: feed received datagrams and drive the clock
//!     let mut datagram = recv_datagram();
//!     match device.handle_incoming_datagram(now_ms(), &mut datagram, source())? {
//!         Incoming::Reply(t) => send_datagram(t),
//!         Incoming::Data { packet, .. } => deliver_inner(packet),
//!         _ => {}
//!     }
//!     for t in device.tick(now_ms()).transmits {
//!         send_datagram(t);
//!     }
//!     Ok(())
//! }
//! # fn recv_datagram() -> Vec<u8> { Vec::new() }
//! # fn now_ms() -> u64 { 0 }
//! # fn source() -> std::net::SocketAddr { "127.0.0.1:1".parse().unwrap() }
//! # fn send_datagram(_t: ferrotun::Transmit) {}
//! # fn deliver_inner(_p: Vec<u8>) {}
//! ```

pub mod crypto;
pub mod error;
pub mod protocol;

pub use crypto::aead::CipherSuite;
pub use error::{CryptoError, FerrotunError, ProtocolError};
pub use protocol::extensions::{feature, vote, CompressionHint};
pub use protocol::{
    Device, DeviceDelegate, Incoming, Outgoing, PeerHandle, PeerStats, TickOutcome, Transmit,
    UnknownPeerVerdict,
};
