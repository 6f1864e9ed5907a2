//! Optional external KMS collaborator.
//!
//! When configured, rotations are mirrored to the KMS and each new version's
//! material is escrowed through [`KmsClient::encrypt_data_key`]. Local
//! rotation never waits on the KMS: an unavailable KMS is logged as a failed
//! [`RotationEvent`](tessera_types::keys::RotationEvent) and rotation carries
//! on locally.

use tessera_types::keys::KeyUsage;

use crate::Result;

/// External key-management service.
pub trait KmsClient: Send + Sync {
    /// Create a key on the KMS side and return its KMS identifier.
    fn create_key(&self, key_id: &str, usage: KeyUsage) -> Result<String>;

    /// Rotate the KMS-side key and return the KMS version.
    fn rotate(&self, key_id: &str) -> Result<u32>;

    /// Encrypt a data key for escrow.
    fn encrypt_data_key(&self, key_id: &str, data_key: &[u8]) -> Result<Vec<u8>>;

    /// Decrypt an escrowed data key.
    fn decrypt_data_key(&self, key_id: &str, wrapped: &[u8]) -> Result<Vec<u8>>;
}
