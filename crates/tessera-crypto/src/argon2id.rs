//! Argon2id passphrase hashing.
//!
//! Used to turn a user-provisioned passphrase into the master key that wraps
//! key material at rest. The device fingerprint is used as the salt so the
//! derived key is bound to the device; the fingerprint is never key material
//! on its own.

use argon2::{Algorithm, Argon2, Params, Version};

use crate::{CryptoError, Result};

/// Argon2id cost parameters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CostParams {
    /// Memory cost in KiB.
    pub m_cost: u32,
    /// Time cost (iterations).
    pub t_cost: u32,
    /// Parallelism lanes.
    pub p_cost: u32,
}

/// Default parameters for master-key derivation: m=64MB, t=3, p=4.
pub const MASTER_KEY_PARAMS: CostParams = CostParams {
    m_cost: 65536,
    t_cost: 3,
    p_cost: 4,
};

/// Master key output length.
pub const MASTER_KEY_LEN: usize = 32;

/// Derive the 32-byte master key from a passphrase.
///
/// # Arguments
///
/// * `passphrase` - User-provisioned secret
/// * `salt` - At least 8 bytes; the device fingerprint in practice
/// * `params` - Cost parameters ([`MASTER_KEY_PARAMS`] outside tests)
pub fn derive_master_key(
    passphrase: &[u8],
    salt: &[u8],
    params: CostParams,
) -> Result<[u8; MASTER_KEY_LEN]> {
    if passphrase.is_empty() {
        return Err(CryptoError::Argon2("empty passphrase".into()));
    }
    let params = Params::new(
        params.m_cost,
        params.t_cost,
        params.p_cost,
        Some(MASTER_KEY_LEN),
    )
    .map_err(|e| CryptoError::Argon2(e.to_string()))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut output = [0u8; MASTER_KEY_LEN];
    argon2
        .hash_password_into(passphrase, salt, &mut output)
        .map_err(|e| CryptoError::Argon2(e.to_string()))?;

    Ok(output)
}
