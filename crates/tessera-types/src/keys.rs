//! Key metadata and rotation audit records.

use serde::{Deserialize, Serialize};

use crate::KeyId;

/// Lifecycle status of one key version.
///
/// Transitions only move forward: `Active -> Deprecated -> Revoked`
/// (`Active -> Revoked` is allowed for emergency revocation).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStatus {
    Active,
    Deprecated,
    Revoked,
}

impl KeyStatus {
    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(self, next: KeyStatus) -> bool {
        next > self
    }
}

/// What a managed key is used for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyUsage {
    /// Symmetric encryption of data or state at rest.
    Encryption,
    /// Message authentication.
    Authentication,
    /// Root material for further derivation.
    Derivation,
    /// Wrapping other keys.
    KeyWrapping,
}

/// Algorithm the key material is intended for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyAlgorithm {
    #[serde(rename = "chacha20_poly1305")]
    ChaCha20Poly1305,
    Blake3Keyed,
}

/// Metadata for one version of a managed key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyMetadata {
    pub key_id: KeyId,
    /// Starts at 1; increases by exactly 1 per rotation.
    pub version: u32,
    pub previous_version: Option<u32>,
    pub algorithm: KeyAlgorithm,
    pub usage: KeyUsage,
    pub created_at: u64,
    pub rotation_due: u64,
    pub status: KeyStatus,
    pub deprecated_at: Option<u64>,
    pub revoked_at: Option<u64>,
    /// Key material has been destroyed by retention cleanup.
    pub material_destroyed: bool,
}

/// Why a rotation (or revocation) happened.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationReason {
    Scheduled,
    Emergency,
    Manual,
    Revocation,
    /// Mirror of a rotation against the external KMS.
    Kms,
}

/// Immutable audit record of a rotation attempt.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationEvent {
    pub event_id: String,
    pub key_id: KeyId,
    pub old_version: u32,
    pub new_version: u32,
    pub timestamp: u64,
    pub reason: RotationReason,
    pub success: bool,
    pub error: Option<String>,
}
