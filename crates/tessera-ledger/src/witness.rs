//! Timestamp authority and witnesses.
//!
//! Both attest to an entry with Ed25519 signatures over domain-separated,
//! length-prefixed messages:
//!
//! ```text
//! signer:    LP("Tessera v1 ledger-signature") || LP(payload_hash) || LP(LE64 ts)
//! authority: LP("Tessera v1 ledger-timestamp") || LP(entry_hash)   || LP(LE64 ts)
//! witness:   LP("Tessera v1 ledger-witness")   || LP(entry_hash)   || LP(root) || LP(LE64 ts)
//! ```
//!
//! [`LocalSigner`] implements both roles with an in-process key. Remote
//! authorities plug in through the same traits.

use tessera_crypto::blake3::{self, contexts};
use tessera_crypto::ed25519::{self, SigningKey};
use tessera_types::ledger::{TimestampProof, WitnessSignature};
use tessera_types::Hash;

use crate::Result;

/// Message signed by the transaction signer.
pub fn signature_message(payload_hash: &Hash, timestamp: u64) -> Vec<u8> {
    blake3::encode_multi_field(&[
        contexts::LEDGER_SIGNATURE.as_bytes(),
        payload_hash,
        &timestamp.to_le_bytes(),
    ])
}

/// Message signed by the timestamp authority.
pub fn timestamp_message(entry_hash: &Hash, timestamp: u64) -> Vec<u8> {
    blake3::encode_multi_field(&[
        contexts::LEDGER_TIMESTAMP.as_bytes(),
        entry_hash,
        &timestamp.to_le_bytes(),
    ])
}

/// Message signed by each witness.
pub fn witness_message(entry_hash: &Hash, merkle_root: &Hash, timestamp: u64) -> Vec<u8> {
    blake3::encode_multi_field(&[
        contexts::LEDGER_WITNESS.as_bytes(),
        entry_hash,
        merkle_root,
        &timestamp.to_le_bytes(),
    ])
}

/// Issues signed timestamps.
pub trait TimestampAuthority: Send + Sync {
    fn public_key(&self) -> [u8; 32];

    fn attest(&self, entry_hash: &Hash, timestamp: u64) -> Result<TimestampProof>;
}

/// Co-signs `(entry_hash, merkle_root, timestamp)`.
pub trait Witness: Send + Sync {
    fn public_key(&self) -> [u8; 32];

    /// `BLAKE3(public_key)`.
    fn witness_id(&self) -> Hash {
        blake3::hash(&self.public_key())
    }

    fn attest(&self, entry_hash: &Hash, merkle_root: &Hash, timestamp: u64)
        -> Result<WitnessSignature>;
}

/// In-process Ed25519 signer usable as authority or witness.
#[derive(Clone, Debug)]
pub struct LocalSigner {
    key: SigningKey,
}

impl LocalSigner {
    pub fn new(key: SigningKey) -> Self {
        Self { key }
    }

    pub fn generate() -> Self {
        Self::new(SigningKey::generate())
    }
}

impl TimestampAuthority for LocalSigner {
    fn public_key(&self) -> [u8; 32] {
        self.key.verifying_key().to_bytes()
    }

    fn attest(&self, entry_hash: &Hash, timestamp: u64) -> Result<TimestampProof> {
        let signature = self.key.sign(&timestamp_message(entry_hash, timestamp));
        Ok(TimestampProof {
            authority_public_key: TimestampAuthority::public_key(self),
            timestamp,
            signature: signature.to_bytes(),
        })
    }
}

impl Witness for LocalSigner {
    fn public_key(&self) -> [u8; 32] {
        self.key.verifying_key().to_bytes()
    }

    fn attest(
        &self,
        entry_hash: &Hash,
        merkle_root: &Hash,
        timestamp: u64,
    ) -> Result<WitnessSignature> {
        let signature = self
            .key
            .sign(&witness_message(entry_hash, merkle_root, timestamp));
        Ok(WitnessSignature {
            witness_id: self.witness_id(),
            public_key: Witness::public_key(self),
            signature: signature.to_bytes(),
        })
    }
}

/// Check a timestamp proof's signature.
pub fn verify_timestamp(proof: &TimestampProof, entry_hash: &Hash) -> bool {
    ed25519::verify_raw(
        &proof.authority_public_key,
        &timestamp_message(entry_hash, proof.timestamp),
        &proof.signature,
    )
    .is_ok()
}

/// Check one witness signature, including that its id matches its key.
pub fn verify_witness(
    witness: &WitnessSignature,
    entry_hash: &Hash,
    merkle_root: &Hash,
    timestamp: u64,
) -> bool {
    blake3::digest_eq(&witness.witness_id, &blake3::hash(&witness.public_key))
        && ed25519::verify_raw(
            &witness.public_key,
            &witness_message(entry_hash, merkle_root, timestamp),
            &witness.signature,
        )
        .is_ok()
}
