//! Labelled key derivation.
//!
//! `derive(input_key, label, iterations, output_len)` is the single derivation
//! primitive behind every ratchet transition:
//!
//! ```text
//! state_0 = input_key
//! state_i = BLAKE3::derive_key("Tessera v1 kdf-round",
//!                              LP(label) || LP(state_{i-1}) || LP(LE64(i)))
//! output  = BLAKE3::derive_key_xof("Tessera v1 kdf-output",
//!                                  LP(label) || LP(state_n))[..output_len]
//! ```
//!
//! where `LP` is the length-prefixed encoding of [`crate::blake3::encode_multi_field`].
//! The function is pure: equal inputs always produce equal outputs.

use zeroize::Zeroize;

use crate::blake3::{self, contexts};
use crate::{CryptoError, Result};

/// Derivation labels. Each use of [`derive`] names exactly one of these.
pub mod labels {
    /// Advances a sending or receiving chain key by one position.
    pub const CHAIN_KEY_ADVANCE: &str = "CHAIN_KEY_ADVANCE";
    /// Derives a single-use message key from a chain key and counter.
    pub const MESSAGE_KEY: &str = "MESSAGE_KEY";
    /// Folds a DH output into a root key after a DH-ratchet step.
    pub const ROOT_KEY_UPDATE: &str = "ROOT_KEY_UPDATE";
    /// Root key for the initiator-to-responder direction.
    pub const INITIATOR_ROOT: &str = "INITIATOR_ROOT";
    /// Root key for the responder-to-initiator direction.
    pub const RESPONDER_ROOT: &str = "RESPONDER_ROOT";
    /// Per-session message authentication key.
    pub const SESSION_MAC_KEY: &str = "SESSION_MAC_KEY";
    /// Wraps persisted state and key material at rest.
    pub const STATE_AT_REST: &str = "STATE_AT_REST";
}

/// Largest output a single derivation may produce.
pub const MAX_OUTPUT_LEN: usize = 1024;

/// Derive `output_len` bytes from `input_key` under `label`.
///
/// # Errors
///
/// Returns [`CryptoError::KeyDerivation`] if the label is empty, `iterations` is
/// zero, or `output_len` is outside `1..=MAX_OUTPUT_LEN`.
pub fn derive(
    input_key: &[u8],
    label: &str,
    iterations: u32,
    output_len: usize,
) -> Result<Vec<u8>> {
    if label.is_empty() {
        return Err(CryptoError::KeyDerivation("empty label".into()));
    }
    if iterations == 0 {
        return Err(CryptoError::KeyDerivation("iterations must be >= 1".into()));
    }
    if output_len == 0 || output_len > MAX_OUTPUT_LEN {
        return Err(CryptoError::KeyDerivation(format!(
            "output length {output_len} outside 1..={MAX_OUTPUT_LEN}"
        )));
    }

    let mut state = input_key.to_vec();
    for round in 1..=u64::from(iterations) {
        let round_bytes = round.to_le_bytes();
        let mut input = blake3::encode_multi_field(&[label.as_bytes(), &state, &round_bytes]);
        let next = blake3::derive_key(contexts::KDF_ROUND, &input);
        input.zeroize();
        state.zeroize();
        state = next.to_vec();
    }

    let mut input = blake3::encode_multi_field(&[label.as_bytes(), &state]);
    let mut output = vec![0u8; output_len];
    blake3::derive_key_xof(contexts::KDF_OUTPUT, &input, &mut output);
    input.zeroize();
    state.zeroize();
    Ok(output)
}

/// Derive a 32-byte key with a single round.
pub fn derive_32(input_key: &[u8; 32], label: &str) -> Result<[u8; 32]> {
    let mut derived = derive(input_key, label, 1, 32)?;
    let mut out = [0u8; 32];
    out.copy_from_slice(&derived);
    derived.zeroize();
    Ok(out)
}

/// Derive a 32-byte key bound to a counter position (message keys).
pub fn derive_at(input_key: &[u8; 32], label: &str, counter: u64) -> Result<[u8; 32]> {
    let counter_bytes = counter.to_le_bytes();
    let mut bound = blake3::encode_multi_field(&[input_key, &counter_bytes]);
    let derived = derive(&bound, label, 1, 32);
    bound.zeroize();
    let mut derived = derived?;
    let mut out = [0u8; 32];
    out.copy_from_slice(&derived);
    derived.zeroize();
    Ok(out)
}

/// Derive two independent 32-byte keys from one input (e.g. root + chain).
pub fn derive_pair(input_key: &[u8], label: &str) -> Result<([u8; 32], [u8; 32])> {
    let mut material = derive(input_key, label, 1, 64)?;
    let mut first = [0u8; 32];
    let mut second = [0u8; 32];
    first.copy_from_slice(&material[..32]);
    second.copy_from_slice(&material[32..]);
    material.zeroize();
    Ok((first, second))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_deterministic() {
        let a = derive(&[0x42; 32], labels::CHAIN_KEY_ADVANCE, 3, 32).expect("derive");
        let b = derive(&[0x42; 32], labels::CHAIN_KEY_ADVANCE, 3, 32).expect("derive");
        assert_eq!(a, b);
    }

    #[test]
    fn test_labels_separate_domains() {
        let input = [0x42u8; 32];
        let chain = derive_32(&input, labels::CHAIN_KEY_ADVANCE).expect("derive");
        let message = derive_32(&input, labels::MESSAGE_KEY).expect("derive");
        let root = derive_32(&input, labels::ROOT_KEY_UPDATE).expect("derive");
        assert_ne!(chain, message);
        assert_ne!(chain, root);
        assert_ne!(message, root);
    }

    #[test]
    fn test_iterations_change_output() {
        let one = derive(&[7; 32], labels::STATE_AT_REST, 1, 32).expect("derive");
        let two = derive(&[7; 32], labels::STATE_AT_REST, 2, 32).expect("derive");
        assert_ne!(one, two);
    }

    #[test]
    fn test_output_length_prefix_consistent() {
        let short = derive(&[9; 32], labels::MESSAGE_KEY, 1, 16).expect("derive");
        let long = derive(&[9; 32], labels::MESSAGE_KEY, 1, 64).expect("derive");
        assert_eq!(short.len(), 16);
        assert_eq!(long.len(), 64);
        assert_eq!(&long[..16], short.as_slice());
    }

    #[test]
    fn test_invalid_parameters_rejected() {
        assert!(derive(&[0; 32], "", 1, 32).is_err());
        assert!(derive(&[0; 32], labels::MESSAGE_KEY, 0, 32).is_err());
        assert!(derive(&[0; 32], labels::MESSAGE_KEY, 1, 0).is_err());
        assert!(derive(&[0; 32], labels::MESSAGE_KEY, 1, MAX_OUTPUT_LEN + 1).is_err());
    }

    #[test]
    fn test_derive_32_matches_derive() {
        let input = [0x33u8; 32];
        let full = derive(&input, labels::ROOT_KEY_UPDATE, 1, 32).expect("derive");
        assert_eq!(
            derive_32(&input, labels::ROOT_KEY_UPDATE).expect("derive").as_slice(),
            full.as_slice()
        );
    }

    #[test]
    fn test_derive_at_binds_counter() {
        let chain = [0x55u8; 32];
        let k0 = derive_at(&chain, labels::MESSAGE_KEY, 0).expect("derive");
        let k1 = derive_at(&chain, labels::MESSAGE_KEY, 1).expect("derive");
        assert_ne!(k0, k1);
        assert_eq!(k0, derive_at(&chain, labels::MESSAGE_KEY, 0).expect("derive"));
    }

    #[test]
    fn test_fixed_size_helpers_reject_empty_label() {
        assert!(matches!(
            derive_32(&[0x42; 32], ""),
            Err(CryptoError::KeyDerivation(_))
        ));
        assert!(matches!(
            derive_at(&[0x42; 32], "", 3),
            Err(CryptoError::KeyDerivation(_))
        ));
    }

    #[test]
    fn test_derive_pair_halves_differ() {
        let (a, b) = derive_pair(&[1; 32], labels::ROOT_KEY_UPDATE).expect("derive");
        assert_ne!(a, b);
    }
}
