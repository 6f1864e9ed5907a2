//! Ratchet message wire records.

use serde::{Deserialize, Serialize};
use serde_with::{hex::Hex, serde_as};

use crate::WireError;

/// Size of the canonical header encoding.
pub const HEADER_SIZE: usize = 32 + 8 + 8 + 8;

/// Ratchet header carried in clear alongside every message.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RatchetHeader {
    /// Sender's current DH ratchet public key.
    #[serde_as(as = "Hex")]
    pub dh_public_key: [u8; 32],
    /// Number of sending DH steps the sender has taken, starting at 1 for its
    /// first chain. Lets a receiver tell a chain it cannot reach yet from a
    /// forgery.
    pub chain_index: u64,
    /// Session-global counter at which the sender's current chain began.
    pub previous_counter: u64,
    /// Session-global counter of this message.
    pub counter: u64,
}

impl RatchetHeader {
    /// Canonical fixed-width encoding:
    /// `dh_public_key || LE64(chain_index) || LE64(previous) || LE64(counter)`.
    ///
    /// Bound as AEAD associated data and into the message MAC.
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[..32].copy_from_slice(&self.dh_public_key);
        out[32..40].copy_from_slice(&self.chain_index.to_le_bytes());
        out[40..48].copy_from_slice(&self.previous_counter.to_le_bytes());
        out[48..].copy_from_slice(&self.counter.to_le_bytes());
        out
    }
}

/// Whether the message may still carry handshake material.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// Sent by the initiator before it has received any reply.
    Prekey,
    /// Any message on an established session.
    Message,
}

impl MessageType {
    /// Single-byte tag bound into the MAC.
    pub fn as_byte(self) -> u8 {
        match self {
            Self::Prekey => 0x01,
            Self::Message => 0x02,
        }
    }
}

/// An encrypted, authenticated message ready for transport.
///
/// Immutable once constructed; one per transmitted message.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedMessage {
    #[serde_as(as = "Hex")]
    pub ciphertext: Vec<u8>,
    #[serde_as(as = "Hex")]
    pub nonce: [u8; 12],
    #[serde_as(as = "Hex")]
    pub auth_tag: [u8; 16],
    pub ratchet_header: RatchetHeader,
    #[serde_as(as = "Hex")]
    pub mac: [u8; 32],
    /// Strictly increasing per conversation on the sending side.
    pub sequence_number: u64,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    pub message_type: MessageType,
}

impl EncryptedMessage {
    /// Encode as the JSON wire record.
    pub fn to_json(&self) -> Result<String, WireError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode from the JSON wire record.
    pub fn from_json(json: &str) -> Result<Self, WireError> {
        Ok(serde_json::from_str(json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> EncryptedMessage {
        EncryptedMessage {
            ciphertext: vec![0xde, 0xad, 0xbe, 0xef],
            nonce: [0xAB; 12],
            auth_tag: [0x01; 16],
            ratchet_header: RatchetHeader {
                dh_public_key: [0x0F; 32],
                chain_index: 1,
                previous_counter: 0,
                counter: 7,
            },
            mac: [0xFF; 32],
            sequence_number: 7,
            timestamp: 1_700_000_000_000,
            message_type: MessageType::Message,
        }
    }

    #[test]
    fn test_binary_fields_are_lowercase_hex() {
        let json = sample().to_json().expect("encode");
        let value: serde_json::Value = serde_json::from_str(&json).expect("parse");
        assert_eq!(value["ciphertext"], "deadbeef");
        assert_eq!(value["nonce"], "abababababababababababab");
        assert_eq!(value["ratchet_header"]["dh_public_key"], "0f".repeat(32));
        assert_eq!(value["ratchet_header"]["counter"], 7);
        assert_eq!(value["ratchet_header"]["chain_index"], 1);
        assert_eq!(value["message_type"], "message");
        assert_eq!(value["timestamp"], 1_700_000_000_000u64);
    }

    #[test]
    fn test_json_decode() {
        let msg = sample();
        let decoded = EncryptedMessage::from_json(&msg.to_json().expect("encode")).expect("decode");
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_wrong_length_hex_rejected() {
        let json = sample().to_json().expect("encode").replace(
            "abababababababababababab",
            "abab",
        );
        assert!(EncryptedMessage::from_json(&json).is_err());
    }

    #[test]
    fn test_header_bytes_layout() {
        let header = sample().ratchet_header;
        let bytes = header.to_bytes();
        assert_eq!(&bytes[..32], &[0x0F; 32]);
        assert_eq!(&bytes[32..40], &1u64.to_le_bytes());
        assert_eq!(&bytes[40..48], &0u64.to_le_bytes());
        assert_eq!(&bytes[48..], &7u64.to_le_bytes());
    }
}
