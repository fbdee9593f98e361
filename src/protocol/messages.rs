//! Wire formats
//!
//! Long-header messages (types 1–4, all little-endian) plus the
//! negotiated short-header data framing. Handshake messages may carry a
//! TLV extension field inside their AEAD payloads, which stretches the
//! base sizes of 148 / 92 bytes; the MAC fields always cover everything
//! before them.

use crate::error::ProtocolError;
use crate::protocol::limits::MAX_SIZE_OF_HANDSHAKE_EXTENSION;

/// Message types in the first 32-bit field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MessageType {
    HandshakeInitiation = 1,
    HandshakeResponse = 2,
    HandshakeCookie = 3,
    Data = 4,
}

impl TryFrom<u32> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::HandshakeInitiation),
            2 => Ok(Self::HandshakeResponse),
            3 => Ok(Self::HandshakeCookie),
            4 => Ok(Self::Data),
            _ => Err(ProtocolError::InvalidMessageType { msg_type: value }),
        }
    }
}

/// Handshake initiation (type 1), `148 + ext` bytes
///
/// ```text
/// type u32 | sender_key_id u32 | ephemeral 32 | static_enc 32+16 |
/// timestamp_ext_enc 12+ext+16 | mac1 16 | mac2 16
/// ```
#[derive(Debug, Clone)]
pub struct HandshakeInitiation {
    pub sender_key_id: u32,
    pub ephemeral: [u8; 32],
    pub static_enc: [u8; 48],
    /// TAI64N timestamp plus TLV extension field, sealed together
    pub timestamp_ext_enc: Vec<u8>,
    pub mac1: [u8; 16],
    pub mac2: [u8; 16],
}

impl HandshakeInitiation {
    /// Size with an empty extension field
    pub const BASE_SIZE: usize = 148;

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::BASE_SIZE + self.timestamp_ext_enc.len());
        buf.extend_from_slice(&(MessageType::HandshakeInitiation as u32).to_le_bytes());
        buf.extend_from_slice(&self.sender_key_id.to_le_bytes());
        buf.extend_from_slice(&self.ephemeral);
        buf.extend_from_slice(&self.static_enc);
        buf.extend_from_slice(&self.timestamp_ext_enc);
        buf.extend_from_slice(&self.mac1);
        buf.extend_from_slice(&self.mac2);
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < Self::BASE_SIZE
            || data.len() > Self::BASE_SIZE + MAX_SIZE_OF_HANDSHAKE_EXTENSION
        {
            return Err(ProtocolError::InvalidMessageLength {
                expected: Self::BASE_SIZE,
                got: data.len(),
            });
        }
        let macs = data.len() - 32;
        Ok(Self {
            sender_key_id: u32::from_le_bytes(data[4..8].try_into().expect("4 bytes")),
            ephemeral: data[8..40].try_into().expect("32 bytes"),
            static_enc: data[40..88].try_into().expect("48 bytes"),
            timestamp_ext_enc: data[88..macs].to_vec(),
            mac1: data[macs..macs + 16].try_into().expect("16 bytes"),
            mac2: data[macs + 16..].try_into().expect("16 bytes"),
        })
    }

    /// Portion covered by mac1 (everything before it)
    pub fn mac1_region(data: &[u8]) -> &[u8] {
        &data[..data.len() - 32]
    }

    /// Portion covered by mac2 (everything before it, mac1 included)
    pub fn mac2_region(data: &[u8]) -> &[u8] {
        &data[..data.len() - 16]
    }
}

/// Handshake response (type 2), `92 + ext` bytes
///
/// ```text
/// type u32 | sender_key_id u32 | receiver_key_id u32 | ephemeral 32 |
/// empty_ext_enc ext+16 | mac1 16 | mac2 16
/// ```
#[derive(Debug, Clone)]
pub struct HandshakeResponse {
    pub sender_key_id: u32,
    pub receiver_key_id: u32,
    pub ephemeral: [u8; 32],
    /// TLV extension field (possibly empty) sealed with the final
    /// handshake key
    pub empty_ext_enc: Vec<u8>,
    pub mac1: [u8; 16],
    pub mac2: [u8; 16],
}

impl HandshakeResponse {
    /// Size with an empty extension field
    pub const BASE_SIZE: usize = 92;

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::BASE_SIZE + self.empty_ext_enc.len());
        buf.extend_from_slice(&(MessageType::HandshakeResponse as u32).to_le_bytes());
        buf.extend_from_slice(&self.sender_key_id.to_le_bytes());
        buf.extend_from_slice(&self.receiver_key_id.to_le_bytes());
        buf.extend_from_slice(&self.ephemeral);
        buf.extend_from_slice(&self.empty_ext_enc);
        buf.extend_from_slice(&self.mac1);
        buf.extend_from_slice(&self.mac2);
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < Self::BASE_SIZE
            || data.len() > Self::BASE_SIZE + MAX_SIZE_OF_HANDSHAKE_EXTENSION
        {
            return Err(ProtocolError::InvalidMessageLength {
                expected: Self::BASE_SIZE,
                got: data.len(),
            });
        }
        let macs = data.len() - 32;
        Ok(Self {
            sender_key_id: u32::from_le_bytes(data[4..8].try_into().expect("4 bytes")),
            receiver_key_id: u32::from_le_bytes(data[8..12].try_into().expect("4 bytes")),
            ephemeral: data[12..44].try_into().expect("32 bytes"),
            empty_ext_enc: data[44..macs].to_vec(),
            mac1: data[macs..macs + 16].try_into().expect("16 bytes"),
            mac2: data[macs + 16..].try_into().expect("16 bytes"),
        })
    }

    pub fn mac1_region(data: &[u8]) -> &[u8] {
        &data[..data.len() - 32]
    }

    pub fn mac2_region(data: &[u8]) -> &[u8] {
        &data[..data.len() - 16]
    }
}

/// Cookie reply (type 3), fixed 64 bytes
#[derive(Debug, Clone)]
pub struct HandshakeCookie {
    pub receiver_key_id: u32,
    pub nonce: [u8; 24],
    pub cookie_enc: [u8; 32],
}

impl HandshakeCookie {
    pub const SIZE: usize = 64;

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        buf.extend_from_slice(&(MessageType::HandshakeCookie as u32).to_le_bytes());
        buf.extend_from_slice(&self.receiver_key_id.to_le_bytes());
        buf.extend_from_slice(&self.nonce);
        buf.extend_from_slice(&self.cookie_enc);
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() != Self::SIZE {
            return Err(ProtocolError::InvalidMessageLength {
                expected: Self::SIZE,
                got: data.len(),
            });
        }
        Ok(Self {
            receiver_key_id: u32::from_le_bytes(data[4..8].try_into().expect("4 bytes")),
            nonce: data[8..32].try_into().expect("24 bytes"),
            cookie_enc: data[32..64].try_into().expect("32 bytes"),
        })
    }
}

/// Long-header data message (type 4): 16-byte header then sealed payload
#[derive(Debug, Clone, Copy)]
pub struct DataHeader {
    pub receiver_key_id: u32,
    pub counter: u64,
}

impl DataHeader {
    pub const SIZE: usize = 16;

    pub fn write(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&(MessageType::Data as u32).to_le_bytes());
        buf.extend_from_slice(&self.receiver_key_id.to_le_bytes());
        buf.extend_from_slice(&self.counter.to_le_bytes());
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < Self::SIZE {
            return Err(ProtocolError::InvalidMessageLength {
                expected: Self::SIZE,
                got: data.len(),
            });
        }
        Ok(Self {
            receiver_key_id: u32::from_le_bytes(data[4..8].try_into().expect("4 bytes")),
            counter: u64::from_le_bytes(data[8..16].try_into().expect("8 bytes")),
        })
    }
}

/// First byte of a short-header packet
pub const SHORT_HEADER_BIT: u8 = 0x80;
/// Key-slot field: bits 6–5, zero reserved
pub const SHORT_KEY_MASK: u8 = 0x60;
pub const SHORT_KEY_SHIFT: u8 = 5;
/// ACK-piggyback present
pub const SHORT_ACK_BIT: u8 = 0x10;
/// Subtype / counter-width field: bits 3–0
pub const SHORT_TYPE_MASK: u8 = 0x0f;
pub const SHORT_CTR1: u8 = 0x00;
pub const SHORT_CTR2: u8 = 0x01;
pub const SHORT_CTR4: u8 = 0x02;

/// Second flags byte (present with the ACK bit): acked-counter width
pub const ACK_COUNTER_MASK: u8 = 0x0c;
pub const ACK_COUNTER_NONE: u8 = 0x00;
pub const ACK_COUNTER_2: u8 = 0x04;
pub const ACK_COUNTER_4: u8 = 0x08;
pub const ACK_COUNTER_6: u8 = 0x0c;
/// Short-key grant for the receiver's outgoing packets (bits 1–0)
pub const ACK_KEY_MASK: u8 = 0x03;

/// ACK piggyback carried in a short header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ShortAck {
    /// Slot (1–3) the receiver may use as its outgoing short key; 0 none
    pub key_grant: u8,
    /// Truncated acked counter and its byte width (0, 2, 4 or 6)
    pub acked_low: u64,
    pub acked_width: usize,
}

/// Parsed short-header prefix; payload plus tag follows `header_len`
///
/// Slot 0 in the key field means the 32-bit key id is carried explicitly
/// after the optional ack block; slots 1–3 select the binding the
/// receiver registered for this source address, and the key id is
/// omitted entirely.
#[derive(Debug, Clone, Copy)]
pub struct ShortHeader {
    /// Receiver-side address-binding slot (1–3), or 0 with an explicit id
    pub key_slot: u8,
    /// Present iff `key_slot == 0`
    pub explicit_key_id: Option<u32>,
    /// Truncated counter and its byte width (1, 2 or 4)
    pub counter_low: u64,
    pub counter_width: usize,
    pub ack: Option<ShortAck>,
    /// Bytes consumed by flags + ack + key id + counter
    pub header_len: usize,
}

impl ShortHeader {
    pub fn parse(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.is_empty() || data[0] & SHORT_HEADER_BIT == 0 {
            return Err(ProtocolError::MalformedMessage {
                reason: "not a short header",
            });
        }
        let flags = data[0];
        let key_slot = (flags & SHORT_KEY_MASK) >> SHORT_KEY_SHIFT;
        let counter_width = match flags & SHORT_TYPE_MASK {
            SHORT_CTR1 => 1,
            SHORT_CTR2 => 2,
            SHORT_CTR4 => 4,
            _ => {
                return Err(ProtocolError::MalformedMessage {
                    reason: "unknown short-header subtype",
                })
            }
        };

        let mut offset = 1;
        let ack = if flags & SHORT_ACK_BIT != 0 {
            let ack_flags = *data.get(offset).ok_or(ProtocolError::MalformedMessage {
                reason: "truncated ack flags",
            })?;
            offset += 1;
            let acked_width = match ack_flags & ACK_COUNTER_MASK {
                ACK_COUNTER_NONE => 0,
                ACK_COUNTER_2 => 2,
                ACK_COUNTER_4 => 4,
                _ => 6,
            };
            let acked_low = read_le_partial(data, &mut offset, acked_width)?;
            Some(ShortAck {
                key_grant: ack_flags & ACK_KEY_MASK,
                acked_low,
                acked_width,
            })
        } else {
            None
        };

        let explicit_key_id = if key_slot == 0 {
            Some(read_le_partial(data, &mut offset, 4)? as u32)
        } else {
            None
        };

        let counter_low = read_le_partial(data, &mut offset, counter_width)?;
        Ok(Self {
            key_slot,
            explicit_key_id,
            counter_low,
            counter_width,
            ack,
            header_len: offset,
        })
    }

    /// Serialize flags, optional ack, key id and truncated counter.
    pub fn write(&self, buf: &mut Vec<u8>) {
        let width_code = match self.counter_width {
            1 => SHORT_CTR1,
            2 => SHORT_CTR2,
            _ => SHORT_CTR4,
        };
        let mut flags = SHORT_HEADER_BIT | (self.key_slot << SHORT_KEY_SHIFT) | width_code;
        if self.ack.is_some() {
            flags |= SHORT_ACK_BIT;
        }
        buf.push(flags);
        if let Some(ack) = &self.ack {
            let width_code = match ack.acked_width {
                0 => ACK_COUNTER_NONE,
                2 => ACK_COUNTER_2,
                4 => ACK_COUNTER_4,
                _ => ACK_COUNTER_6,
            };
            buf.push(width_code | (ack.key_grant & ACK_KEY_MASK));
            buf.extend_from_slice(&ack.acked_low.to_le_bytes()[..ack.acked_width]);
        }
        if self.key_slot == 0 {
            buf.extend_from_slice(&self.explicit_key_id.unwrap_or(0).to_le_bytes());
        }
        buf.extend_from_slice(&self.counter_low.to_le_bytes()[..self.counter_width]);
    }
}

fn read_le_partial(
    data: &[u8],
    offset: &mut usize,
    width: usize,
) -> Result<u64, ProtocolError> {
    if data.len() < *offset + width {
        return Err(ProtocolError::MalformedMessage {
            reason: "truncated short-header field",
        });
    }
    let mut bytes = [0u8; 8];
    bytes[..width].copy_from_slice(&data[*offset..*offset + width]);
    *offset += width;
    Ok(u64::from_le_bytes(bytes))
}

/// Rebuild a full 64-bit counter from its `width`-byte truncation,
/// choosing the value congruent to `low` closest to `expected`.
///
/// Exact whenever `|true − expected| < 2^(8·width − 1)`, which the sender
/// guarantees by picking the width against the last acked counter.
pub fn reconstruct_counter(expected: u64, low: u64, width: usize) -> u64 {
    debug_assert!(width < 8);
    let span = 1u64 << (8 * width);
    let mask = span - 1;
    let candidate = (expected & !mask) | (low & mask);
    let half = span >> 1;

    if candidate + half < expected {
        candidate + span
    } else if candidate >= expected + half && candidate >= span {
        candidate - span
    } else {
        candidate
    }
}

/// Classify the leading byte: short-header data or a long-header type.
pub fn classify(data: &[u8]) -> Result<Option<MessageType>, ProtocolError> {
    if data.is_empty() {
        return Err(ProtocolError::InvalidMessageLength {
            expected: 1,
            got: 0,
        });
    }
    if data[0] & SHORT_HEADER_BIT != 0 {
        return Ok(None);
    }
    if data.len() < 4 {
        return Err(ProtocolError::InvalidMessageLength {
            expected: 4,
            got: data.len(),
        });
    }
    let kind = u32::from_le_bytes(data[..4].try_into().expect("4 bytes"));
    MessageType::try_from(kind).map(Some)
}
