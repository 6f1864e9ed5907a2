//! MAC wrap/unwrap of transport records.
//!
//! The MAC covers every field of the record that is not the MAC itself:
//!
//! ```text
//! mac = BLAKE3-keyed(session_key,
//!         LP(ciphertext) || LP(nonce) || LP(LE64 seq) || LP(LE64 timestamp) ||
//!         LP(auth_tag) || LP(header bytes) || LP(message_type))
//! ```
//!
//! `LP` is the LE32 length prefix of [`blake3::encode_multi_field`], so no
//! two distinct records share a MAC input.

use tessera_crypto::blake3;
use tessera_types::message::{EncryptedMessage, MessageType, RatchetHeader};
use tracing::warn;

use crate::engine::CiphertextBundle;
use crate::{RatchetError, Result};

/// A record whose MAC has been checked, ready for `decrypt_at`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VerifiedMessage {
    pub header: RatchetHeader,
    pub bundle: CiphertextBundle,
    pub sequence_number: u64,
    pub timestamp: u64,
    pub message_type: MessageType,
}

/// Compute the record MAC.
#[allow(clippy::too_many_arguments)]
pub fn compute_mac(
    session_key: &[u8; 32],
    ciphertext: &[u8],
    nonce: &[u8; 12],
    sequence_number: u64,
    timestamp: u64,
    auth_tag: &[u8; 16],
    header: &RatchetHeader,
    message_type: MessageType,
) -> [u8; 32] {
    let input = blake3::encode_multi_field(&[
        ciphertext,
        nonce,
        &sequence_number.to_le_bytes(),
        &timestamp.to_le_bytes(),
        auth_tag,
        &header.to_bytes(),
        &[message_type.as_byte()],
    ]);
    blake3::keyed_hash(session_key, &input)
}

/// Build the transport record for an encrypted bundle.
pub fn wrap(
    bundle: CiphertextBundle,
    header: RatchetHeader,
    session_key: &[u8; 32],
    sequence_number: u64,
    timestamp: u64,
    message_type: MessageType,
) -> EncryptedMessage {
    let mac = compute_mac(
        session_key,
        &bundle.ciphertext,
        &bundle.nonce,
        sequence_number,
        timestamp,
        &bundle.auth_tag,
        &header,
        message_type,
    );
    EncryptedMessage {
        ciphertext: bundle.ciphertext,
        nonce: bundle.nonce,
        auth_tag: bundle.auth_tag,
        ratchet_header: header,
        mac,
        sequence_number,
        timestamp,
        message_type,
    }
}

/// Check the MAC in constant time. Nothing is decrypted on failure.
pub fn unwrap(message: &EncryptedMessage, session_key: &[u8; 32]) -> Result<VerifiedMessage> {
    let expected = compute_mac(
        session_key,
        &message.ciphertext,
        &message.nonce,
        message.sequence_number,
        message.timestamp,
        &message.auth_tag,
        &message.ratchet_header,
        message.message_type,
    );
    if !blake3::digest_eq(&expected, &message.mac) {
        warn!(
            sequence_number = message.sequence_number,
            "Message MAC mismatch"
        );
        return Err(RatchetError::AuthenticationFailure);
    }
    Ok(VerifiedMessage {
        header: message.ratchet_header.clone(),
        bundle: CiphertextBundle {
            ciphertext: message.ciphertext.clone(),
            nonce: message.nonce,
            auth_tag: message.auth_tag,
        },
        sequence_number: message.sequence_number,
        timestamp: message.timestamp,
        message_type: message.message_type,
    })
}
