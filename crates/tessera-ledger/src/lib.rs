//! # tessera-ledger
//!
//! Append-only transaction ledger with Merkle proofs and sealed entries.
//!
//! Entries are hash-chained (`entry[i].previous_hash == hash(entry[i - 1])`)
//! and every entry hash is a leaf of an incrementally maintained Merkle tree.
//! A [`TransactionSealer`] binds one entry to a signature, its Merkle proof,
//! a timestamp-authority attestation and witness signatures, and encrypts the
//! lot under the managed `ledger-seal` key.
//!
//! ## Modules
//!
//! - [`ledger`]: the [`MerkleLedger`] and its optional persistence
//! - [`merkle`]: incremental Merkle tree, proofs and historical roots
//! - [`sealer`]: seal creation and verification with tamper evidence
//! - [`witness`]: timestamp authority and witness roles

pub mod ledger;
pub mod merkle;
pub mod sealer;
pub mod witness;

pub use ledger::{entry_hash, LedgerSnapshot, MerkleLedger};
pub use merkle::{MerkleSnapshot, MerkleTree};
pub use sealer::{SealerConfig, TransactionSealer};
pub use witness::{LocalSigner, TimestampAuthority, Witness};

use tessera_types::ledger::TamperKind;

/// Error types for ledger operations.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// The hash chain or Merkle tree does not match the entries.
    #[error("integrity violation: {0}")]
    IntegrityViolation(String),

    #[error("no ledger entry at position {0}")]
    EntryNotFound(u64),

    #[error("tree size {requested} exceeds ledger length {available}")]
    InvalidTreeSize { requested: u64, available: u64 },

    /// Fewer witnesses attested than the sealer requires.
    #[error("insufficient witnesses: {got} of {required}")]
    InsufficientWitnesses { required: usize, got: usize },

    /// A seal failed verification.
    #[error("seal tampered ({kind:?}): {detail}")]
    Tampered { kind: TamperKind, detail: String },

    /// The seal already carries tamper evidence and can never verify again.
    #[error("seal carries {0} prior tamper record(s)")]
    PreviouslyTampered(usize),

    /// Sealer settings that could never produce a valid seal.
    #[error("invalid sealer configuration: {0}")]
    InvalidConfig(String),

    /// An authority or witness could not attest.
    #[error("attestation failed: {0}")]
    Attestation(String),

    #[error("store error: {0}")]
    Store(#[from] tessera_store::StoreError),

    #[error("key error: {0}")]
    Key(#[from] tessera_keys::KeyError),

    #[error("crypto error: {0}")]
    Crypto(#[from] tessera_crypto::CryptoError),
}

/// Convenience result type for ledger operations.
pub type Result<T> = std::result::Result<T, LedgerError>;
