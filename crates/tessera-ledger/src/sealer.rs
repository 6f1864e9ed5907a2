//! Transaction sealing.
//!
//! A [`TransactionSeal`] vouches for one ledger entry four ways:
//!
//! 1. **Signature**: Ed25519 over `(payload_hash, timestamp)`.
//! 2. **Cryptographic proof**: the Merkle path, root and tree size at seal
//!    time, plus the entry's hash-chain triple.
//! 3. **Immutability proof**: a timestamp-authority signature and at least
//!    `min_witnesses` witness signatures.
//! 4. **Anti-tamper seal**: the fields above, CBOR-encoded and encrypted
//!    with the active `ledger-seal` managed key (version pinned), plus
//!    `BLAKE3(nonce || ciphertext || tag)`.
//!
//! [`TransactionSealer::verify`] records [`TamperEvidence`] on the seal for
//! every violation it finds. Evidence is never cleared, so a seal that
//! failed once fails forever.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tessera_crypto::blake3;
use tessera_crypto::chacha20::SealedBox;
use tessera_crypto::ed25519::{self, SigningKey};
use tessera_keys::{AtRestCipher, KeyError, KeyLifecycleManager, LEDGER_SEAL_KEY_ID};
use tessera_store::cbor;
use tessera_types::ledger::{
    AntiTamperingSeal, CryptographicProof, DigitalSignature, HashChainValidation,
    ImmutabilityProof, LedgerEntry, TamperEvidence, TamperKind, TimestampProof,
    TransactionSeal,
};
use tessera_types::Hash;
use tracing::{info, warn};

use crate::ledger::{entry_hash, MerkleLedger};
use crate::merkle::MerkleTree;
use crate::witness::{self, TimestampAuthority, Witness};
use crate::{LedgerError, Result};

/// Signature algorithm name recorded in seals.
pub const SIGNATURE_ALGORITHM: &str = "ed25519";

/// Sealer settings.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SealerConfig {
    /// Witness signatures a seal needs to be valid. Never zero.
    pub min_witnesses: usize,
    /// How far a seal timestamp may lie in the verifier's future.
    pub max_clock_skew_ms: u64,
}

impl Default for SealerConfig {
    fn default() -> Self {
        Self {
            min_witnesses: 2,
            max_clock_skew_ms: 5 * 60 * 1000,
        }
    }
}

/// The encrypted part of an anti-tamper seal.
#[derive(Serialize, Deserialize, PartialEq, Eq)]
struct SealPayload {
    entry: LedgerEntry,
    digital_signature: DigitalSignature,
    merkle_root: Hash,
    tree_size: u64,
    leaf_index: u64,
    timestamp_proof: TimestampProof,
}

impl SealPayload {
    fn from_seal(seal: &TransactionSeal) -> Self {
        Self {
            entry: seal.entry.clone(),
            digital_signature: seal.digital_signature.clone(),
            merkle_root: seal.cryptographic_proof.merkle_root,
            tree_size: seal.cryptographic_proof.tree_size,
            leaf_index: seal.cryptographic_proof.leaf_index,
            timestamp_proof: seal.immutability_proof.timestamp_proof.clone(),
        }
    }
}

fn seal_aad(entry_hash: &Hash, key_version: u32) -> Vec<u8> {
    blake3::encode_multi_field(&[entry_hash, &key_version.to_le_bytes()])
}

fn integrity_hash(nonce: &[u8; 12], ciphertext: &[u8], tag: &[u8; 16]) -> Hash {
    blake3::hash(&blake3::encode_multi_field(&[nonce, ciphertext, tag]))
}

fn tampered(kind: TamperKind, detail: impl Into<String>) -> LedgerError {
    LedgerError::Tampered {
        kind,
        detail: detail.into(),
    }
}

/// Seals ledger entries and verifies seals.
pub struct TransactionSealer {
    signer: SigningKey,
    authority: Arc<dyn TimestampAuthority>,
    witnesses: Vec<Arc<dyn Witness>>,
    cipher: AtRestCipher,
    config: SealerConfig,
}

impl TransactionSealer {
    /// # Errors
    ///
    /// Returns [`LedgerError::InvalidConfig`] if `config.min_witnesses` is
    /// zero: a seal is only valid with at least one witness signature.
    pub fn new(
        signer: SigningKey,
        authority: Arc<dyn TimestampAuthority>,
        witnesses: Vec<Arc<dyn Witness>>,
        keys: Arc<KeyLifecycleManager>,
        config: SealerConfig,
    ) -> Result<Self> {
        if config.min_witnesses == 0 {
            return Err(LedgerError::InvalidConfig(
                "min_witnesses must be at least 1".into(),
            ));
        }
        Ok(Self {
            signer,
            authority,
            witnesses,
            cipher: AtRestCipher::new(keys, LEDGER_SEAL_KEY_ID),
            config,
        })
    }

    pub fn config(&self) -> &SealerConfig {
        &self.config
    }

    pub fn signer_public_key(&self) -> [u8; 32] {
        self.signer.verifying_key().to_bytes()
    }

    /// Seal the entry at `position` against the ledger's current root.
    pub fn seal(&self, ledger: &MerkleLedger, position: u64, now: u64) -> Result<TransactionSeal> {
        let entry = ledger
            .entry(position)
            .cloned()
            .ok_or(LedgerError::EntryNotFound(position))?;
        let hash = entry_hash(&entry);
        let merkle_root = ledger.root();
        let tree_size = ledger.len() as u64;

        let signature = self
            .signer
            .sign(&witness::signature_message(&entry.payload_hash, now));
        let digital_signature = DigitalSignature {
            algorithm: SIGNATURE_ALGORITHM.to_string(),
            public_key: self.signer_public_key(),
            signature: signature.to_bytes(),
            timestamp: now,
        };

        let timestamp_proof = self.authority.attest(&hash, now)?;
        let mut witness_signatures = Vec::with_capacity(self.witnesses.len());
        for witness in &self.witnesses {
            match witness.attest(&hash, &merkle_root, now) {
                Ok(signature) => witness_signatures.push(signature),
                Err(e) => warn!(position, "Witness declined to attest: {e}"),
            }
        }
        if witness_signatures.len() < self.config.min_witnesses {
            return Err(LedgerError::InsufficientWitnesses {
                required: self.config.min_witnesses,
                got: witness_signatures.len(),
            });
        }

        let mut seal = TransactionSeal {
            cryptographic_proof: CryptographicProof {
                merkle_path: ledger.get_proof(position)?,
                leaf_index: position,
                tree_size,
                merkle_root,
                hash_chain_validation: HashChainValidation {
                    previous_hash: entry.previous_hash,
                    current_hash: hash,
                    chain_position: entry.chain_position,
                },
            },
            entry,
            digital_signature,
            immutability_proof: ImmutabilityProof {
                timestamp_proof,
                witness_signatures,
            },
            anti_tampering_seal: AntiTamperingSeal {
                seal_data: Vec::new(),
                seal_nonce: [0; 12],
                seal_tag: [0; 16],
                key_version: 0,
                seal_integrity_hash: [0; 32],
                tamper_evidence: Vec::new(),
            },
        };

        let payload = cbor::to_vec(&SealPayload::from_seal(&seal))?;
        let (key_version, sealed) = self
            .cipher
            .seal(&payload, |version| seal_aad(&hash, version))?;
        seal.anti_tampering_seal = AntiTamperingSeal {
            seal_integrity_hash: integrity_hash(&sealed.nonce, &sealed.ciphertext, &sealed.tag),
            seal_data: sealed.ciphertext,
            seal_nonce: sealed.nonce,
            seal_tag: sealed.tag,
            key_version,
            tamper_evidence: Vec::new(),
        };

        info!(
            position,
            tree_size,
            witnesses = seal.immutability_proof.witness_signatures.len(),
            key_version,
            "Sealed ledger entry"
        );
        Ok(seal)
    }

    /// Verify `seal`, recording tamper evidence on failure.
    ///
    /// Returns `false` for any failure. Failures that prove tampering append
    /// a [`TamperEvidence`]; operational failures (such as an expired seal
    /// key) are only logged.
    pub fn verify(&self, seal: &mut TransactionSeal, ledger: &MerkleLedger, now: u64) -> bool {
        match self.check(seal, ledger, now) {
            Ok(()) => true,
            Err(LedgerError::Tampered { kind, detail }) => {
                warn!(
                    position = seal.entry.chain_position,
                    ?kind,
                    "Seal verification failed: {detail}"
                );
                seal.record_tamper(TamperEvidence {
                    detected_at: now,
                    kind,
                    detail,
                });
                false
            }
            Err(e) => {
                warn!(
                    position = seal.entry.chain_position,
                    "Seal could not be verified: {e}"
                );
                false
            }
        }
    }

    /// Verify `seal` without recording evidence, returning the reason for
    /// the first failure.
    pub fn check(&self, seal: &TransactionSeal, ledger: &MerkleLedger, now: u64) -> Result<()> {
        if seal.is_tampered() {
            return Err(LedgerError::PreviouslyTampered(
                seal.anti_tampering_seal.tamper_evidence.len(),
            ));
        }
        self.check_anti_tamper(seal)?;
        self.check_signature(seal)?;
        let hash = entry_hash(&seal.entry);
        self.check_immutability(seal, &hash, now)?;
        check_embedded_proof(seal, &hash)?;
        check_against_ledger(seal, &hash, ledger)
    }

    fn check_anti_tamper(&self, seal: &TransactionSeal) -> Result<()> {
        let anti = &seal.anti_tampering_seal;
        let expected = integrity_hash(&anti.seal_nonce, &anti.seal_data, &anti.seal_tag);
        if !blake3::digest_eq(&expected, &anti.seal_integrity_hash) {
            return Err(tampered(
                TamperKind::IntegrityHashMismatch,
                "seal integrity hash mismatch",
            ));
        }

        let sealed = SealedBox {
            ciphertext: anti.seal_data.clone(),
            nonce: anti.seal_nonce,
            tag: anti.seal_tag,
        };
        let aad = seal_aad(&entry_hash(&seal.entry), anti.key_version);
        let plain = self
            .cipher
            .open(anti.key_version, &sealed, &aad)
            .map_err(|e| match e {
                KeyError::Crypto(_) => {
                    tampered(TamperKind::SealUnreadable, "seal payload failed to decrypt")
                }
                other => LedgerError::Key(other),
            })?;
        let payload: SealPayload = cbor::from_slice(&plain)
            .map_err(|e| tampered(TamperKind::SealUnreadable, e.to_string()))?;
        if payload != SealPayload::from_seal(seal) {
            return Err(tampered(
                TamperKind::SealPayloadMismatch,
                "sealed fields differ from seal",
            ));
        }
        Ok(())
    }

    fn check_signature(&self, seal: &TransactionSeal) -> Result<()> {
        let signature = &seal.digital_signature;
        if signature.algorithm != SIGNATURE_ALGORITHM {
            return Err(tampered(
                TamperKind::SignatureInvalid,
                format!("unsupported algorithm {}", signature.algorithm),
            ));
        }
        if signature.public_key != self.signer_public_key() {
            return Err(tampered(TamperKind::SignatureInvalid, "unknown signer"));
        }
        ed25519::verify_raw(
            &signature.public_key,
            &witness::signature_message(&seal.entry.payload_hash, signature.timestamp),
            &signature.signature,
        )
        .map_err(|_| tampered(TamperKind::SignatureInvalid, "bad transaction signature"))
    }

    fn check_immutability(&self, seal: &TransactionSeal, hash: &Hash, now: u64) -> Result<()> {
        let proof = &seal.immutability_proof.timestamp_proof;
        let invalid = |detail: &str| tampered(TamperKind::TimestampInvalid, detail);
        if proof.authority_public_key != self.authority.public_key() {
            return Err(invalid("unknown timestamp authority"));
        }
        if proof.timestamp != seal.digital_signature.timestamp {
            return Err(invalid("timestamp differs from signature timestamp"));
        }
        if proof.timestamp < seal.entry.timestamp {
            return Err(invalid("sealed before the entry existed"));
        }
        if proof.timestamp > now.saturating_add(self.config.max_clock_skew_ms) {
            return Err(invalid("timestamp in the future"));
        }
        if !witness::verify_timestamp(proof, hash) {
            return Err(invalid("bad timestamp signature"));
        }

        let trusted: Vec<[u8; 32]> = self.witnesses.iter().map(|w| w.public_key()).collect();
        let mut seen: Vec<Hash> = Vec::new();
        for signature in &seal.immutability_proof.witness_signatures {
            if !trusted.contains(&signature.public_key) {
                return Err(tampered(TamperKind::WitnessInvalid, "unknown witness"));
            }
            if seen.contains(&signature.witness_id) {
                return Err(tampered(TamperKind::WitnessInvalid, "duplicate witness"));
            }
            if !witness::verify_witness(
                signature,
                hash,
                &seal.cryptographic_proof.merkle_root,
                proof.timestamp,
            ) {
                return Err(tampered(TamperKind::WitnessInvalid, "bad witness signature"));
            }
            seen.push(signature.witness_id);
        }
        if seen.len() < self.config.min_witnesses {
            return Err(tampered(
                TamperKind::WitnessInvalid,
                format!(
                    "{} witnesses, {} required",
                    seen.len(),
                    self.config.min_witnesses
                ),
            ));
        }
        Ok(())
    }
}

fn check_embedded_proof(seal: &TransactionSeal, hash: &Hash) -> Result<()> {
    let proof = &seal.cryptographic_proof;
    let chain = &proof.hash_chain_validation;
    if !blake3::digest_eq(&chain.current_hash, hash)
        || chain.previous_hash != seal.entry.previous_hash
        || chain.chain_position != seal.entry.chain_position
        || proof.leaf_index != seal.entry.chain_position
    {
        return Err(tampered(
            TamperKind::ChainMismatch,
            "hash-chain triple disagrees with entry",
        ));
    }
    if proof.leaf_index >= proof.tree_size
        || !MerkleTree::verify_proof(hash, &proof.merkle_path, &proof.merkle_root)
    {
        return Err(tampered(
            TamperKind::MerkleProofInvalid,
            "embedded proof does not reach embedded root",
        ));
    }
    Ok(())
}

fn check_against_ledger(seal: &TransactionSeal, hash: &Hash, ledger: &MerkleLedger) -> Result<()> {
    let proof = &seal.cryptographic_proof;
    let historical = ledger
        .root_at(proof.tree_size)
        .map_err(|_| tampered(TamperKind::RootMismatch, "ledger shorter than sealed tree"))?;
    if !blake3::digest_eq(&historical, &proof.merkle_root) {
        return Err(tampered(
            TamperKind::RootMismatch,
            "sealed root differs from ledger history",
        ));
    }

    let position = seal.entry.chain_position;
    if ledger.entry(position) != Some(&seal.entry) {
        return Err(tampered(
            TamperKind::ChainMismatch,
            format!("ledger entry {position} differs from sealed entry"),
        ));
    }
    let current = ledger.get_proof(position)?;
    if !MerkleTree::verify_proof(hash, &current, &ledger.root()) {
        return Err(tampered(
            TamperKind::MerkleProofInvalid,
            "entry not provable against current root",
        ));
    }
    Ok(())
}
