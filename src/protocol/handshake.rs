//! Noise_IKpsk2 handshake message flow
//!
//! Pure construction and consumption of initiation/response messages;
//! table bookkeeping, ring insertion and timers stay with the peer and
//! device. The responder path is split in two around the static-key
//! decryption, since the peer (and its precomputed static-static DH) can
//! only be resolved once the initiator's identity is known.

use tai64::{Tai64, Tai64N};

use crate::crypto::{blake2s, noise, x25519};
use crate::error::{CryptoError, FerrotunError, ProtocolError};
use crate::protocol::limits::MAX_SIZE_OF_HANDSHAKE_EXTENSION;
use crate::protocol::messages::{HandshakeInitiation, HandshakeResponse};

/// TAI64N label offset (seconds since 1970 live at 2^62 + secs)
const TAI64_LABEL: u64 = 1 << 62;

/// Wire timestamp length
pub const TIMESTAMP_LEN: usize = 12;

/// Deterministic TAI64N encoding of a millisecond clock.
///
/// Big-endian, so byte-wise comparison orders timestamps; the engine uses
/// that for cross-session replay protection.
pub fn timestamp_from_ms(now_ms: u64) -> [u8; TIMESTAMP_LEN] {
    let stamp = Tai64N(Tai64(TAI64_LABEL + now_ms / 1000), (now_ms % 1000) as u32 * 1_000_000);
    stamp.to_bytes()
}

/// Initiator state kept on the peer while a response is outstanding
pub struct HandshakeTranscript {
    /// Transcript hash `Hi`
    pub hash: [u8; 32],
    /// Chaining key `Ci`
    pub chaining_key: [u8; 32],
    /// Ephemeral private key
    pub e_priv: [u8; 32],
    /// Key id reserved in the key-id table for this attempt
    pub local_key_id: u32,
}

/// Build an initiation message (macs still zeroed).
///
/// `precomputed_ss` is `DH(s_priv_local, spub_peer)`, computed once at
/// peer init. Returns the message and the transcript the response
/// consumption will need.
pub fn create_initiation(
    s_pub_local: &[u8; 32],
    peer_spub: &[u8; 32],
    precomputed_ss: &[u8; 32],
    local_key_id: u32,
    timestamp: [u8; TIMESTAMP_LEN],
    ext_payload: &[u8],
) -> Result<(HandshakeInitiation, HandshakeTranscript), FerrotunError> {
    let mut st = noise::SymmetricState::new(peer_spub);

    let (e_priv, e_pub) = x25519::generate_keypair();
    st.mix_hash(&e_pub);
    st.mix_chain(&e_pub);

    // es
    let key = st.mix_key(&x25519::dh(&e_priv, peer_spub));
    let static_enc: [u8; 48] = st
        .encrypt_and_hash(&key, s_pub_local)?
        .try_into()
        .map_err(|_| CryptoError::Encryption)?;

    // ss
    let key = st.mix_key(precomputed_ss);
    let mut payload = Vec::with_capacity(TIMESTAMP_LEN + ext_payload.len());
    payload.extend_from_slice(&timestamp);
    payload.extend_from_slice(ext_payload);
    let timestamp_ext_enc = st.encrypt_and_hash(&key, &payload)?;

    let msg = HandshakeInitiation {
        sender_key_id: local_key_id,
        ephemeral: e_pub,
        static_enc,
        timestamp_ext_enc,
        mac1: [0u8; 16],
        mac2: [0u8; 16],
    };
    let transcript = HandshakeTranscript {
        hash: st.hash,
        chaining_key: st.chaining_key,
        e_priv,
        local_key_id,
    };
    Ok((msg, transcript))
}

/// Responder state between static decryption and response creation
pub struct InitiationInProgress {
    st: noise::SymmetricState,
    e_remote: [u8; 32],
    /// The initiator's decrypted static public key; resolves the peer
    pub initiator_spub: [u8; 32],
}

/// Responder stage 1: unwrap the initiator's static key.
pub fn consume_initiation(
    s_priv_local: &[u8; 32],
    s_pub_local: &[u8; 32],
    msg: &HandshakeInitiation,
) -> Result<InitiationInProgress, FerrotunError> {
    if !x25519::is_valid_public_key(&msg.ephemeral) {
        return Err(CryptoError::DiffieHellman.into());
    }
    let mut st = noise::SymmetricState::new(s_pub_local);
    st.mix_hash(&msg.ephemeral);
    st.mix_chain(&msg.ephemeral);

    // es (from the responder's side of the same DH)
    let key = st.mix_key(&x25519::dh(s_priv_local, &msg.ephemeral));
    let initiator_spub: [u8; 32] = st
        .decrypt_and_hash(&key, &msg.static_enc)?
        .try_into()
        .map_err(|_| CryptoError::Decryption)?;

    Ok(InitiationInProgress {
        st,
        e_remote: msg.ephemeral,
        initiator_spub,
    })
}

/// Responder stage 2: with the peer resolved, unwrap timestamp and
/// extension field.
pub fn finish_initiation(
    mut progress: InitiationInProgress,
    precomputed_ss: &[u8; 32],
    timestamp_ext_enc: &[u8],
) -> Result<([u8; TIMESTAMP_LEN], Vec<u8>, InitiationInProgress), FerrotunError> {
    // ss
    let key = progress.st.mix_key(precomputed_ss);
    let payload = progress.st.decrypt_and_hash(&key, timestamp_ext_enc)?;
    if payload.len() < TIMESTAMP_LEN
        || payload.len() > TIMESTAMP_LEN + MAX_SIZE_OF_HANDSHAKE_EXTENSION
    {
        return Err(ProtocolError::MalformedMessage {
            reason: "bad initiation payload length",
        }
        .into());
    }
    let timestamp: [u8; TIMESTAMP_LEN] = payload[..TIMESTAMP_LEN]
        .try_into()
        .map_err(|_| CryptoError::Decryption)?;
    let ext = payload[TIMESTAMP_LEN..].to_vec();
    Ok((timestamp, ext, progress))
}

/// Responder stage 3: produce the response message (macs zeroed) and the
/// final chaining key for session derivation.
pub fn create_response(
    progress: InitiationInProgress,
    psk: &[u8; 32],
    local_key_id: u32,
    remote_key_id: u32,
    ext_payload: &[u8],
) -> Result<(HandshakeResponse, [u8; 32]), FerrotunError> {
    let mut st = progress.st;
    let (e_priv, e_pub) = x25519::generate_keypair();
    st.mix_hash(&e_pub);
    st.mix_chain(&e_pub);

    // ee
    st.mix_key(&x25519::dh(&e_priv, &progress.e_remote));
    // se
    st.mix_key(&x25519::dh(&e_priv, &progress.initiator_spub));
    // psk
    let key = st.mix_key_and_hash(psk);
    let empty_ext_enc = st.encrypt_and_hash(&key, ext_payload)?;

    let msg = HandshakeResponse {
        sender_key_id: local_key_id,
        receiver_key_id: remote_key_id,
        ephemeral: e_pub,
        empty_ext_enc,
        mac1: [0u8; 16],
        mac2: [0u8; 16],
    };
    Ok((msg, st.chaining_key))
}

/// Initiator: consume the response, yielding the final chaining key and
/// the responder's extension field.
pub fn consume_response(
    transcript: &HandshakeTranscript,
    s_priv_local: &[u8; 32],
    psk: &[u8; 32],
    msg: &HandshakeResponse,
) -> Result<([u8; 32], Vec<u8>), FerrotunError> {
    if !x25519::is_valid_public_key(&msg.ephemeral) {
        return Err(CryptoError::DiffieHellman.into());
    }
    let mut st = noise::SymmetricState {
        chaining_key: transcript.chaining_key,
        hash: transcript.hash,
    };
    st.mix_hash(&msg.ephemeral);
    st.mix_chain(&msg.ephemeral);

    // ee
    st.mix_key(&x25519::dh(&transcript.e_priv, &msg.ephemeral));
    // se
    st.mix_key(&x25519::dh(s_priv_local, &msg.ephemeral));
    // psk
    let key = st.mix_key_and_hash(psk);
    let ext = st.decrypt_and_hash(&key, &msg.empty_ext_enc)?;
    if ext.len() > MAX_SIZE_OF_HANDSHAKE_EXTENSION {
        return Err(ProtocolError::MalformedMessage {
            reason: "oversized response extension",
        }
        .into());
    }
    Ok((st.chaining_key, ext))
}

/// Stamp mac1 (and mac2 when a cookie is at hand) onto a serialized
/// handshake message. Returns the mac1 value for cookie bookkeeping.
pub fn seal_macs(bytes: &mut [u8], mac1_key: &[u8; 32], cookie: Option<&[u8; 16]>) -> [u8; 16] {
    let n = bytes.len();
    let mac1 = blake2s::mac16(mac1_key, &bytes[..n - 32]);
    bytes[n - 32..n - 16].copy_from_slice(&mac1);
    if let Some(cookie) = cookie {
        let mac2 = blake2s::mac16(cookie, &bytes[..n - 16]);
        bytes[n - 16..].copy_from_slice(&mac2);
    }
    mac1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::noise::derive_session_keys;

    struct Party {
        s_priv: [u8; 32],
        s_pub: [u8; 32],
    }

    fn party() -> Party {
        let (s_priv, s_pub) = x25519::generate_keypair();
        Party { s_priv, s_pub }
    }

    fn run_handshake(psk: [u8; 32], init_ext: &[u8], resp_ext: &[u8]) {
        let alice = party();
        let bob = party();
        let ss_alice = x25519::dh(&alice.s_priv, &bob.s_pub);
        let ss_bob = x25519::dh(&bob.s_priv, &alice.s_pub);
        assert_eq!(ss_alice, ss_bob);

        let (init_msg, transcript) = create_initiation(
            &alice.s_pub,
            &bob.s_pub,
            &ss_alice,
            0x11,
            timestamp_from_ms(5_000),
            init_ext,
        )
        .unwrap();

        // Over the wire
        let wire = init_msg.to_bytes();
        let received = HandshakeInitiation::from_bytes(&wire).unwrap();

        let progress = consume_initiation(&bob.s_priv, &bob.s_pub, &received).unwrap();
        assert_eq!(progress.initiator_spub, alice.s_pub);

        let (timestamp, ext, progress) =
            finish_initiation(progress, &ss_bob, &received.timestamp_ext_enc).unwrap();
        assert_eq!(timestamp, timestamp_from_ms(5_000));
        assert_eq!(ext, init_ext);

        let (resp_msg, ck_bob) =
            create_response(progress, &psk, 0x22, received.sender_key_id, resp_ext).unwrap();
        assert_eq!(resp_msg.receiver_key_id, 0x11);

        let wire = resp_msg.to_bytes();
        let received = HandshakeResponse::from_bytes(&wire).unwrap();

        let (ck_alice, ext) =
            consume_response(&transcript, &alice.s_priv, &psk, &received).unwrap();
        assert_eq!(ck_alice, ck_bob);
        assert_eq!(ext, resp_ext);

        // Directional keys line up
        let (a_send, a_recv) = derive_session_keys(&ck_alice, true);
        let (b_send, b_recv) = derive_session_keys(&ck_bob, false);
        assert_eq!(a_send, b_recv);
        assert_eq!(a_recv, b_send);
    }

    #[test]
    fn clean_handshake_no_psk() {
        run_handshake([0u8; 32], &[], &[]);
    }

    #[test]
    fn handshake_with_psk_and_extensions() {
        run_handshake([42u8; 32], b"\x16\x06\x02\x02\x00\x00\x00\x00", b"\x16\x06\x01\x01\x00\x00\x00\x00");
    }

    #[test]
    fn wrong_psk_fails_response() {
        let alice = party();
        let bob = party();
        let ss = x25519::dh(&alice.s_priv, &bob.s_pub);

        let (init_msg, transcript) = create_initiation(
            &alice.s_pub,
            &bob.s_pub,
            &ss,
            1,
            timestamp_from_ms(0),
            &[],
        )
        .unwrap();
        let progress = consume_initiation(&bob.s_priv, &bob.s_pub, &init_msg).unwrap();
        let (_, _, progress) =
            finish_initiation(progress, &ss, &init_msg.timestamp_ext_enc).unwrap();
        let (resp_msg, _) = create_response(progress, &[1u8; 32], 2, 1, &[]).unwrap();

        assert!(consume_response(&transcript, &alice.s_priv, &[2u8; 32], &resp_msg).is_err());
    }

    #[test]
    fn wrong_responder_key_fails_static_decryption() {
        let alice = party();
        let bob = party();
        let mallory = party();
        let ss = x25519::dh(&alice.s_priv, &bob.s_pub);

        let (init_msg, _) = create_initiation(
            &alice.s_pub,
            &bob.s_pub,
            &ss,
            1,
            timestamp_from_ms(0),
            &[],
        )
        .unwrap();
        // Initiation was aimed at bob; mallory cannot open it
        assert!(consume_initiation(&mallory.s_priv, &mallory.s_pub, &init_msg).is_err());
    }

    #[test]
    fn timestamps_are_ordered_bytewise() {
        let a = timestamp_from_ms(1_000);
        let b = timestamp_from_ms(1_001);
        let c = timestamp_from_ms(61_000);
        assert!(a < b);
        assert!(b < c);
        assert_eq!(a, timestamp_from_ms(1_000));
    }

    #[test]
    fn seal_macs_writes_both_fields() {
        let mac1_key = [8u8; 32];
        let mut bytes = vec![0u8; 148];
        let mac1 = seal_macs(&mut bytes, &mac1_key, Some(&[9u8; 16]));
        assert_eq!(&bytes[116..132], &mac1);
        assert_ne!(&bytes[132..148], &[0u8; 16]);

        let mut no_cookie = vec![0u8; 148];
        seal_macs(&mut no_cookie, &mac1_key, None);
        assert_eq!(&no_cookie[132..148], &[0u8; 16]);
    }
}
