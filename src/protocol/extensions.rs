//! Handshake extension TLVs and negotiation
//!
//! A TLV field rides inside the first handshake AEAD payloads (after the
//! TAI64N timestamp in the initiation, alone in the response). Each entry
//! is `type(1) | length(1) | payload`. Unknown types are skipped so old
//! and new endpoints interoperate.

use crate::crypto::aead::CipherSuite;
use crate::error::ProtocolError;

/// Packet-compression hint (type 0x15), version 0x01
pub const EXT_PACKET_COMPRESSION: u8 = 0x15;
pub const EXT_PACKET_COMPRESSION_VER: u16 = 0x01;

/// Boolean feature votes (type 0x16)
pub const EXT_BOOLEAN_FEATURES: u8 = 0x16;

/// Supported cipher-suite ids (type 0x18)
pub const EXT_CIPHER_SUITES: u8 = 0x18;

/// Cipher list is an ordering preference (type 0x19)
pub const EXT_CIPHER_SUITES_PRIO: u8 = 0x19;

/// Number of negotiable boolean features
pub const FEATURE_COUNT: usize = 6;

/// Feature vector indices
pub mod feature {
    /// Short-header data framing
    pub const SHORT_HEADER: usize = 0;
    /// 8-byte compressed authentication tag
    pub const SHORT_MAC: usize = 1;
    /// Inner-packet compression
    pub const IPZIP: usize = 2;
    /// Peer may omit the key id on packets it sends us
    pub const SKIP_KEYID_IN: usize = 4;
    /// We may omit the key id on packets we send
    pub const SKIP_KEYID_OUT: usize = 5;
}

/// Per-feature vote strength
pub mod vote {
    pub const OFF: u8 = 0;
    pub const SUPPORTS: u8 = 1;
    pub const WANTS: u8 = 2;
    pub const ENFORCES: u8 = 3;
}

/// 24-byte compression hint: TTL guess, direction flags and the
/// endpoint addresses the codec predicts against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionHint {
    pub version: u16,
    pub ttl: u8,
    pub flags: u8,
    pub ipv4_addr: [u8; 4],
    pub ipv6_addr: [u8; 16],
}

impl CompressionHint {
    pub const SIZE: usize = 24;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..2].copy_from_slice(&self.version.to_le_bytes());
        buf[2] = self.ttl;
        buf[3] = self.flags;
        buf[4..8].copy_from_slice(&self.ipv4_addr);
        buf[8..24].copy_from_slice(&self.ipv6_addr);
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() != Self::SIZE {
            return None;
        }
        Some(Self {
            version: u16::from_le_bytes(data[0..2].try_into().ok()?),
            ttl: data[2],
            flags: data[3],
            ipv4_addr: data[4..8].try_into().ok()?,
            ipv6_addr: data[8..24].try_into().ok()?,
        })
    }
}

/// Everything one side advertises in its handshake extension field
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtensionSet {
    /// Feature votes, indexed by feature id; absent ids are `OFF`
    pub features: [u8; FEATURE_COUNT],
    /// Cipher-suite ids in preference order; empty means "suite 0 only"
    pub ciphers: Vec<u8>,
    /// Whether the cipher list was sent as a priority ordering
    pub cipher_prio: bool,
    /// Compression hint, when the ipzip feature is in play
    pub compression: Option<CompressionHint>,
}

impl ExtensionSet {
    /// True when there is anything worth putting on the wire
    pub fn is_empty(&self) -> bool {
        self.features.iter().all(|&v| v == vote::OFF)
            && self.ciphers.is_empty()
            && self.compression.is_none()
    }

    /// Serialize as a TLV stream; empty output for an empty set.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        if self.features.iter().any(|&v| v != vote::OFF) {
            out.push(EXT_BOOLEAN_FEATURES);
            out.push(FEATURE_COUNT as u8);
            out.extend_from_slice(&self.features);
        }
        if !self.ciphers.is_empty() {
            out.push(if self.cipher_prio {
                EXT_CIPHER_SUITES_PRIO
            } else {
                EXT_CIPHER_SUITES
            });
            out.push(self.ciphers.len() as u8);
            out.extend_from_slice(&self.ciphers);
        }
        if let Some(hint) = &self.compression {
            out.push(EXT_PACKET_COMPRESSION);
            out.push(CompressionHint::SIZE as u8);
            out.extend_from_slice(&hint.to_bytes());
        }
        out
    }

    /// Parse a TLV stream. Unknown types are skipped; truncated entries
    /// reject the whole field.
    pub fn parse(mut data: &[u8]) -> Result<Self, ProtocolError> {
        let mut set = Self::default();
        while !data.is_empty() {
            if data.len() < 2 {
                return Err(ProtocolError::ExtensionRejected {
                    reason: "truncated TLV header",
                });
            }
            let (kind, len) = (data[0], data[1] as usize);
            data = &data[2..];
            if data.len() < len {
                return Err(ProtocolError::ExtensionRejected {
                    reason: "truncated TLV payload",
                });
            }
            let (payload, rest) = data.split_at(len);
            data = rest;

            match kind {
                EXT_BOOLEAN_FEATURES => {
                    for (i, &v) in payload.iter().take(FEATURE_COUNT).enumerate() {
                        if v > vote::ENFORCES {
                            return Err(ProtocolError::ExtensionRejected {
                                reason: "feature vote out of range",
                            });
                        }
                        set.features[i] = v;
                    }
                }
                EXT_CIPHER_SUITES | EXT_CIPHER_SUITES_PRIO => {
                    set.ciphers = payload.to_vec();
                    set.cipher_prio = kind == EXT_CIPHER_SUITES_PRIO;
                }
                EXT_PACKET_COMPRESSION => {
                    let hint = CompressionHint::from_bytes(payload).ok_or(
                        ProtocolError::ExtensionRejected {
                            reason: "bad compression hint size",
                        },
                    )?;
                    if hint.version == EXT_PACKET_COMPRESSION_VER {
                        set.compression = Some(hint);
                    }
                }
                _ => {} // forward compatible
            }
        }
        Ok(set)
    }
}

/// Resolve the boolean feature vector of a session.
///
/// A feature turns on iff both sides vote at least `supports` and at
/// least one votes `wants`. A side that `enforces` against a side voting
/// `off` fails the whole negotiation (the handshake is rejected).
pub fn negotiate_features(
    local: &[u8; FEATURE_COUNT],
    remote: &[u8; FEATURE_COUNT],
) -> Result<[bool; FEATURE_COUNT], ProtocolError> {
    let mut enabled = [false; FEATURE_COUNT];
    for i in 0..FEATURE_COUNT {
        let (a, b) = (local[i], remote[i]);
        if (a == vote::ENFORCES && b == vote::OFF) || (b == vote::ENFORCES && a == vote::OFF) {
            return Err(ProtocolError::FeatureEnforceMismatch { feature: i });
        }
        enabled[i] =
            a >= vote::SUPPORTS && b >= vote::SUPPORTS && (a >= vote::WANTS || b >= vote::WANTS);
    }
    Ok(enabled)
}

/// Pick the transport cipher for a session.
///
/// Suite 0 is implicitly supported by everyone. When both sides flag a
/// priority ordering the responder's order wins; otherwise the flagged
/// side wins; with no flags the initiator's order is used.
pub fn negotiate_cipher(
    initiator: (&[u8], bool),
    responder: (&[u8], bool),
) -> CipherSuite {
    let with_default = |list: &[u8]| -> Vec<u8> {
        let mut v = list.to_vec();
        if !v.contains(&CipherSuite::ChaCha20Poly1305.id()) {
            v.push(CipherSuite::ChaCha20Poly1305.id());
        }
        v
    };
    let init_list = with_default(initiator.0);
    let resp_list = with_default(responder.0);

    let (winner, other) = if responder.1 {
        (&resp_list, &init_list)
    } else {
        (&init_list, &resp_list)
    };

    winner
        .iter()
        .find(|id| other.contains(id))
        .and_then(|&id| CipherSuite::from_id(id))
        .unwrap_or(CipherSuite::ChaCha20Poly1305)
}
