//! Encryption at rest under a managed key.
//!
//! Records are sealed under `derive_32(material, STATE_AT_REST)` of the
//! managed key's active version, and the version is returned so the caller
//! can pin it next to the record. The subkey of the active version lives in
//! a [`SealingKey`] for as long as that version stays active, so successive
//! records never share a nonce within its window.

use std::sync::{Arc, Mutex};

use tessera_crypto::chacha20::{self, SealedBox, SealingKey};
use tessera_crypto::kdf::{self, labels};
use tracing::debug;
use zeroize::Zeroizing;

use crate::lifecycle::KeyLifecycleManager;
use crate::{KeyError, Result};

/// Seals and opens records under one managed key id.
pub struct AtRestCipher {
    keys: Arc<KeyLifecycleManager>,
    key_id: String,
    active: Mutex<Option<(u32, SealingKey)>>,
}

impl AtRestCipher {
    pub fn new(keys: Arc<KeyLifecycleManager>, key_id: &str) -> Self {
        Self {
            keys,
            key_id: key_id.to_string(),
            active: Mutex::new(None),
        }
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub fn keys(&self) -> &Arc<KeyLifecycleManager> {
        &self.keys
    }

    /// Seal under the active version. `aad` builds the associated data from
    /// that version.
    pub fn seal(
        &self,
        plaintext: &[u8],
        aad: impl FnOnce(u32) -> Vec<u8>,
    ) -> Result<(u32, SealedBox)> {
        let key = self.keys.fetch(&self.key_id, None)?;
        let version = key.version();
        let mut active = self.active.lock().map_err(|_| KeyError::Poisoned)?;

        let stale = !matches!(active.as_ref(), Some((v, _)) if *v == version);
        if stale {
            let subkey = Zeroizing::new(kdf::derive_32(key.material(), labels::STATE_AT_REST)?);
            *active = Some((version, SealingKey::new(*subkey)));
            debug!(key_id = %self.key_id, version, "At-rest subkey switched");
        }
        match active.as_mut() {
            Some((_, sealing_key)) => Ok((version, sealing_key.seal(plaintext, &aad(version))?)),
            None => Err(KeyError::KeyNotFound(self.key_id.clone())),
        }
    }

    /// Open a record sealed under `version`.
    ///
    /// Key lifecycle failures (expired, revoked, unknown) come back as their
    /// own variants; a record that fails authentication comes back as
    /// [`KeyError::Crypto`].
    pub fn open(&self, version: u32, sealed: &SealedBox, aad: &[u8]) -> Result<Vec<u8>> {
        let key = self.keys.fetch(&self.key_id, Some(version))?;
        let subkey = Zeroizing::new(kdf::derive_32(key.material(), labels::STATE_AT_REST)?);
        Ok(chacha20::open_box(&subkey, sealed, aad)?)
    }
}

impl std::fmt::Debug for AtRestCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AtRestCipher")
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}
