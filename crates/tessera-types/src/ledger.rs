//! Ledger entries, Merkle proofs and transaction seals.

use serde::{Deserialize, Serialize};
use serde_with::{hex::Hex, serde_as};

use crate::{Hash, WireError};

/// An append-only, hash-chained ledger entry.
///
/// Invariant: `entry[i].previous_hash == hash(entry[i - 1])` for all `i > 0`,
/// and the genesis entry's `previous_hash` is [`crate::GENESIS_HASH`].
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    #[serde_as(as = "Hex")]
    pub payload_hash: Hash,
    #[serde_as(as = "Hex")]
    pub previous_hash: Hash,
    pub chain_position: u64,
    /// Milliseconds since the Unix epoch at append time.
    pub timestamp: u64,
}

impl LedgerEntry {
    /// Canonical encoding hashed into the entry's leaf hash.
    pub fn canonical_bytes(&self) -> [u8; 80] {
        let mut out = [0u8; 80];
        out[..32].copy_from_slice(&self.payload_hash);
        out[32..64].copy_from_slice(&self.previous_hash);
        out[64..72].copy_from_slice(&self.chain_position.to_le_bytes());
        out[72..].copy_from_slice(&self.timestamp.to_le_bytes());
        out
    }

    /// Encode as JSON with hex hashes.
    pub fn to_json(&self) -> Result<String, WireError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode from JSON.
    pub fn from_json(json: &str) -> Result<Self, WireError> {
        Ok(serde_json::from_str(json)?)
    }
}

/// One step of a Merkle inclusion proof, ordered from leaf to root.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofStep {
    #[serde_as(as = "Hex")]
    pub sibling_hash: Hash,
    /// `true` if the sibling sits to the left of the running hash.
    pub is_left_sibling: bool,
    /// Tree level of the sibling (0 = leaves).
    pub level: u32,
}

/// Binding of an entry to its neighbours in the hash chain.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashChainValidation {
    #[serde_as(as = "Hex")]
    pub previous_hash: Hash,
    #[serde_as(as = "Hex")]
    pub current_hash: Hash,
    pub chain_position: u64,
}

/// Merkle inclusion proof captured at seal time.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CryptographicProof {
    pub merkle_path: Vec<ProofStep>,
    pub leaf_index: u64,
    /// Number of leaves in the tree when the proof was taken.
    pub tree_size: u64,
    #[serde_as(as = "Hex")]
    pub merkle_root: Hash,
    pub hash_chain_validation: HashChainValidation,
}

/// Signer's signature over `(payload_hash, timestamp)`.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigitalSignature {
    pub algorithm: String,
    #[serde_as(as = "Hex")]
    pub public_key: [u8; 32],
    #[serde_as(as = "Hex")]
    pub signature: [u8; 64],
    pub timestamp: u64,
}

/// Timestamp-authority attestation over `(entry_hash, timestamp)`.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimestampProof {
    #[serde_as(as = "Hex")]
    pub authority_public_key: [u8; 32],
    pub timestamp: u64,
    #[serde_as(as = "Hex")]
    pub signature: [u8; 64],
}

/// Witness attestation over `(entry_hash, merkle_root, timestamp)`.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WitnessSignature {
    #[serde_as(as = "Hex")]
    pub witness_id: Hash,
    #[serde_as(as = "Hex")]
    pub public_key: [u8; 32],
    #[serde_as(as = "Hex")]
    pub signature: [u8; 64],
}

/// Timestamp and witness proofs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImmutabilityProof {
    pub timestamp_proof: TimestampProof,
    pub witness_signatures: Vec<WitnessSignature>,
}

/// Category of a detected integrity violation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TamperKind {
    IntegrityHashMismatch,
    SealPayloadMismatch,
    SealUnreadable,
    SignatureInvalid,
    TimestampInvalid,
    WitnessInvalid,
    MerkleProofInvalid,
    RootMismatch,
    ChainMismatch,
}

/// A recorded integrity violation. Never removed once recorded.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TamperEvidence {
    pub detected_at: u64,
    pub kind: TamperKind,
    pub detail: String,
}

/// Encrypted seal payload plus its integrity hash.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AntiTamperingSeal {
    #[serde_as(as = "Hex")]
    pub seal_data: Vec<u8>,
    #[serde_as(as = "Hex")]
    pub seal_nonce: [u8; 12],
    #[serde_as(as = "Hex")]
    pub seal_tag: [u8; 16],
    /// Version of the seal key the payload was encrypted under.
    pub key_version: u32,
    /// `BLAKE3(seal_nonce || seal_data || seal_tag)`.
    #[serde_as(as = "Hex")]
    pub seal_integrity_hash: Hash,
    /// Append-only; any entry makes the seal permanently invalid.
    pub tamper_evidence: Vec<TamperEvidence>,
}

/// Everything that vouches for one ledger entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionSeal {
    pub entry: LedgerEntry,
    pub digital_signature: DigitalSignature,
    pub cryptographic_proof: CryptographicProof,
    pub immutability_proof: ImmutabilityProof,
    pub anti_tampering_seal: AntiTamperingSeal,
}

impl TransactionSeal {
    /// Whether any integrity violation has been recorded against this seal.
    pub fn is_tampered(&self) -> bool {
        !self.anti_tampering_seal.tamper_evidence.is_empty()
    }

    /// Append tamper evidence. Evidence is never cleared.
    pub fn record_tamper(&mut self, evidence: TamperEvidence) {
        self.anti_tampering_seal.tamper_evidence.push(evidence);
    }

    /// Encode as JSON.
    pub fn to_json(&self) -> Result<String, WireError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode from JSON.
    pub fn from_json(json: &str) -> Result<Self, WireError> {
        Ok(serde_json::from_str(json)?)
    }
}
