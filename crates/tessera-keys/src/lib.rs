//! # tessera-keys
//!
//! Key lifecycle management for the Tessera workspace.
//!
//! Every symmetric key handed to the ratchet session store or the ledger
//! sealer is a *managed key*: a `key_id` with a sequence of versions, each
//! with its own metadata and 32 bytes of material wrapped under the device
//! master key. Rotation adds a version; superseded versions stay readable for
//! a retention window so in-flight ciphertexts can still be opened.
//!
//! ## Modules
//!
//! - [`at_rest`]: sealing records under a managed key's active version
//! - [`audit`]: size-capped rotation audit log
//! - [`clock`]: wall-clock abstraction with a manual clock for virtual time
//! - [`kms`]: optional external KMS collaborator
//! - [`lifecycle`]: the [`KeyLifecycleManager`]
//! - [`master`]: master-key initialisation (passphrase or local fallback)
//! - [`scheduler`]: Tokio task running due rotations and cleanup

pub mod at_rest;
pub mod audit;
pub mod clock;
pub mod kms;
pub mod lifecycle;
pub mod master;
pub mod scheduler;

pub use at_rest::AtRestCipher;
pub use clock::{Clock, ManualClock, SystemClock};
pub use lifecycle::{KeyLifecycleManager, KeyRotated, LifecycleConfig, VersionedKey};
pub use master::{MasterKey, MasterKeySource};
pub use scheduler::RotationScheduler;

/// Well-known key id of the key that encrypts ratchet state at rest.
pub const RATCHET_STATE_KEY_ID: &str = "ratchet-state";

/// Well-known key id of the key that encrypts ledger anti-tamper seals.
pub const LEDGER_SEAL_KEY_ID: &str = "ledger-seal";

/// Key lifecycle error types.
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("key not found: {0}")]
    KeyNotFound(String),

    #[error("key {key_id} v{version} expired; material is unrecoverable")]
    KeyExpired { key_id: String, version: u32 },

    #[error("key {key_id} v{version} has been revoked")]
    KeyRevoked { key_id: String, version: u32 },

    #[error("key already registered: {0}")]
    AlreadyRegistered(String),

    #[error("rotation of {key_id} failed: {reason}")]
    RotationFailure { key_id: String, reason: String },

    #[error("invalid status transition for {key_id} v{version}: {from:?} -> {to:?}")]
    InvalidTransition {
        key_id: String,
        version: u32,
        from: tessera_types::keys::KeyStatus,
        to: tessera_types::keys::KeyStatus,
    },

    #[error("refusing to revoke the last usable version of {0}")]
    LastActiveVersion(String),

    #[error("master key does not match the one this store was created with")]
    MasterKeyMismatch,

    #[error("KMS error: {0}")]
    Kms(String),

    #[error("store error: {0}")]
    Store(#[from] tessera_store::StoreError),

    #[error("crypto error: {0}")]
    Crypto(#[from] tessera_crypto::CryptoError),

    #[error("key manager lock poisoned")]
    Poisoned,
}

pub type Result<T> = std::result::Result<T, KeyError>;
