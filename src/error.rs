//! Error types for the ferrotun protocol engine

use thiserror::Error;

/// Top-level error type
#[derive(Error, Debug)]
pub enum FerrotunError {
    /// Cryptographic errors
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Protocol errors
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Cryptographic operation errors
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Key derivation failed")]
    KeyDerivation,

    #[error("Encryption failed")]
    Encryption,

    #[error("Decryption failed: invalid ciphertext or authentication tag")]
    Decryption,

    #[error("Invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },

    #[error("DH computation failed")]
    DiffieHellman,

    #[error("Unsupported cipher suite: {suite}")]
    UnsupportedCipherSuite { suite: u8 },
}

/// Protocol-level errors
///
/// Every variant maps to a drop reason; none of these are fatal at the
/// device level. Callers that just forward datagrams treat all of them as
/// "packet dropped" and may use the variant for counters and logs.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed message: {reason}")]
    MalformedMessage { reason: &'static str },

    #[error("Invalid message type: {msg_type}")]
    InvalidMessageType { msg_type: u32 },

    #[error("Invalid message length: expected {expected}, got {got}")]
    InvalidMessageLength { expected: usize, got: usize },

    #[error("MAC1 verification failed")]
    BadMac1,

    #[error("MAC2 required while under load")]
    BadMac2UnderLoad,

    #[error("Rate limited")]
    RateLimited,

    #[error("Replay attack detected: counter {counter} already seen")]
    ReplayRejected { counter: u64 },

    #[error("Unknown key id: {key_id}")]
    UnknownKeyId { key_id: u32 },

    #[error("Unknown peer public key")]
    UnknownPeer,

    #[error("Handshake timestamp not newer than last accepted")]
    HandshakeStale,

    #[error("Handshake flood: initiation within minimum interval")]
    HandshakeFlood,

    #[error("Handshake attempts exceeded, peer unreachable")]
    AttemptsExceeded,

    #[error("Session expired")]
    SessionExpired,

    #[error("No active session")]
    NoSession,

    #[error("Peer endpoint not set")]
    NoEndpoint,

    #[error("No address binding for source")]
    UnknownAddrBinding,

    #[error("Handshake extension rejected: {reason}")]
    ExtensionRejected { reason: &'static str },

    #[error("Feature negotiation failed: peer enforces feature {feature}")]
    FeatureEnforceMismatch { feature: usize },

    #[error("Cookie required but not available")]
    CookieRequired,

    #[error("Packet queue full")]
    QueueFull,
}

/// Result type alias for ferrotun operations
pub type Result<T> = std::result::Result<T, FerrotunError>;
