//! Master-key initialisation.
//!
//! The master key wraps every managed key's material at rest. It comes from
//! one of two sources:
//!
//! - [`MasterKeySource::UserProvisioned`]: Argon2id over a user passphrase,
//!   salted with the device fingerprint.
//! - [`MasterKeySource::LocalFallback`]: a random secret persisted in the
//!   store, bound to the device fingerprint. Anyone who can read the store can
//!   rebuild this key, so it is reported loudly and exposed via
//!   [`MasterKey::source`] for callers that want to refuse it.
//!
//! A check value derived from the key is persisted on first use so that a
//! later start with a different key fails with
//! [`KeyError::MasterKeyMismatch`] instead of silently misreading material.

use std::sync::Mutex;

use rand::RngCore;
use tessera_crypto::argon2id::{self, CostParams};
use tessera_crypto::blake3::{self, contexts};
use tessera_crypto::chacha20::{self, SealedBox, SealingKey};
use tessera_crypto::CryptoError;
use tessera_store::{DeviceIdentity, KeyValueStore};
use tracing::{debug, error};
use zeroize::Zeroize;

use crate::{KeyError, Result};

/// Store key of the locally generated fallback secret.
pub const LOCAL_MASTER_SECRET_KEY: &str = "keys/local-master";

/// Store key of the master-key check value.
pub const MASTER_CHECK_KEY: &str = "keys/master-check";

/// Where the master key came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MasterKeySource {
    UserProvisioned,
    LocalFallback,
}

/// The 32-byte key that wraps managed key material at rest.
pub struct MasterKey {
    key: [u8; 32],
    source: MasterKeySource,
    wrapper: Mutex<SealingKey>,
}

impl MasterKey {
    /// Derive from a user passphrase, salted with the device fingerprint.
    pub fn from_passphrase(
        passphrase: &[u8],
        device: &dyn DeviceIdentity,
        params: CostParams,
    ) -> Result<Self> {
        let key = argon2id::derive_master_key(passphrase, &device.fingerprint(), params)?;
        Ok(Self::from_bytes(key, MasterKeySource::UserProvisioned))
    }

    /// Load (or create and persist) the local fallback secret and bind it to
    /// the device.
    pub fn local_fallback(store: &dyn KeyValueStore, device: &dyn DeviceIdentity) -> Result<Self> {
        let mut secret = match store.get(LOCAL_MASTER_SECRET_KEY)? {
            Some(bytes) if bytes.len() == 32 => bytes,
            Some(bytes) => {
                return Err(KeyError::Crypto(CryptoError::InvalidKeyLength {
                    expected: 32,
                    actual: bytes.len(),
                }))
            }
            None => {
                let mut fresh = vec![0u8; 32];
                rand::rngs::OsRng.fill_bytes(&mut fresh);
                store.set(LOCAL_MASTER_SECRET_KEY, &fresh)?;
                fresh
            }
        };
        let fingerprint = device.fingerprint();
        let mut input = blake3::encode_multi_field(&[&fingerprint, &secret]);
        let key = blake3::derive_key(contexts::DEVICE_BINDING, &input);
        input.zeroize();
        secret.zeroize();

        error!(
            "Master key is using the local fallback; material at rest is protected only by store access"
        );
        Ok(Self::from_bytes(key, MasterKeySource::LocalFallback))
    }

    /// Initialise the master key for a store.
    ///
    /// Uses the passphrase when given and derivation succeeds, otherwise the
    /// local fallback. The result is checked against (or recorded as) the
    /// store's master-key check value.
    pub fn initialize(
        passphrase: Option<&[u8]>,
        device: &dyn DeviceIdentity,
        store: &dyn KeyValueStore,
        params: CostParams,
    ) -> Result<Self> {
        let master = match passphrase {
            Some(passphrase) => match Self::from_passphrase(passphrase, device, params) {
                Ok(master) => master,
                Err(e) => {
                    error!(error = %e, "Passphrase derivation failed, falling back to local master key");
                    Self::local_fallback(store, device)?
                }
            },
            None => {
                error!("No passphrase provisioned");
                Self::local_fallback(store, device)?
            }
        };
        master.check_against(store)?;
        debug!(source = ?master.source, "Master key initialised");
        Ok(master)
    }

    /// Use pre-existing key bytes (e.g. unwrapped by an external KMS).
    pub fn from_bytes(key: [u8; 32], source: MasterKeySource) -> Self {
        Self {
            key,
            source,
            wrapper: Mutex::new(SealingKey::new(key)),
        }
    }

    pub fn source(&self) -> MasterKeySource {
        self.source
    }

    pub fn is_user_provisioned(&self) -> bool {
        self.source == MasterKeySource::UserProvisioned
    }

    /// Compare against the store's check value, recording it on first use.
    pub fn check_against(&self, store: &dyn KeyValueStore) -> Result<()> {
        let check = blake3::derive_key(contexts::MASTER_KEY_CHECK, &self.key);
        match store.get(MASTER_CHECK_KEY)? {
            Some(stored) => {
                let stored: [u8; 32] = stored
                    .as_slice()
                    .try_into()
                    .map_err(|_| KeyError::MasterKeyMismatch)?;
                if blake3::digest_eq(&stored, &check) {
                    Ok(())
                } else {
                    Err(KeyError::MasterKeyMismatch)
                }
            }
            None => {
                store.set(MASTER_CHECK_KEY, &check)?;
                Ok(())
            }
        }
    }

    /// Encrypt key material. `aad` binds the blob to its key id and version.
    pub fn wrap(&self, aad: &[u8], material: &[u8; 32]) -> Result<Vec<u8>> {
        let mut wrapper = self.wrapper.lock().map_err(|_| KeyError::Poisoned)?;
        Ok(wrapper.seal(material, aad)?.to_bytes())
    }

    /// Decrypt key material produced by [`MasterKey::wrap`].
    pub fn unwrap(&self, aad: &[u8], wrapped: &[u8]) -> Result<[u8; 32]> {
        let sealed = SealedBox::from_bytes(wrapped)?;
        let mut plain = chacha20::open_box(&self.key, &sealed, aad)?;
        let material: std::result::Result<[u8; 32], _> = plain.as_slice().try_into();
        let len = plain.len();
        plain.zeroize();
        material.map_err(|_| {
            KeyError::Crypto(CryptoError::InvalidKeyLength {
                expected: 32,
                actual: len,
            })
        })
    }
}

impl Drop for MasterKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterKey")
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}
