//! X25519 key agreement (RFC 7748).
//!
//! Used for the initial session handshake and for every DH-ratchet step.

use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

use crate::{CryptoError, Result};

/// Size of X25519 public keys, secrets and shared secrets.
pub const KEY_SIZE: usize = 32;

/// An X25519 static secret key.
#[derive(Clone, Zeroize)]
#[zeroize(drop)]
pub struct X25519StaticSecret {
    inner: StaticSecret,
}

/// An X25519 public key.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct X25519PublicKey {
    bytes: [u8; 32],
}

/// An X25519 shared secret.
#[derive(Zeroize)]
#[zeroize(drop)]
pub struct SharedSecret {
    bytes: [u8; 32],
}

/// An X25519 key pair. Only the public half is ever serialized on the wire.
#[derive(Clone)]
pub struct KeyPair {
    pub secret: X25519StaticSecret,
    pub public: X25519PublicKey,
}

impl X25519StaticSecret {
    /// Generate a new random static secret.
    pub fn random() -> Self {
        Self {
            inner: StaticSecret::random_from_rng(OsRng),
        }
    }

    /// Create from raw bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self {
            inner: StaticSecret::from(bytes),
        }
    }

    /// Get the raw bytes of this secret.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.inner.to_bytes()
    }

    /// Compute the corresponding public key.
    pub fn public_key(&self) -> X25519PublicKey {
        let pk = PublicKey::from(&self.inner);
        X25519PublicKey {
            bytes: pk.to_bytes(),
        }
    }

    /// Perform Diffie-Hellman key agreement.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKeyMaterial`] if the peer key is a low-order
    /// point, which would make the shared secret independent of our secret.
    pub fn diffie_hellman(&self, their_public: &X25519PublicKey) -> Result<SharedSecret> {
        let pk = PublicKey::from(their_public.bytes);
        let shared = self.inner.diffie_hellman(&pk);
        if !shared.was_contributory() {
            return Err(CryptoError::InvalidKeyMaterial(
                "non-contributory peer public key".into(),
            ));
        }
        Ok(SharedSecret {
            bytes: *shared.as_bytes(),
        })
    }
}

impl X25519PublicKey {
    /// Create from raw bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self { bytes }
    }

    /// Create from a slice of untrusted length (e.g. hex-decoded wire input).
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; 32] = bytes.try_into().map_err(|_| {
            CryptoError::InvalidKeyMaterial(format!(
                "public key must be {KEY_SIZE} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self { bytes })
    }

    /// Get the raw bytes.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.bytes
    }

    /// Get the raw bytes as a slice.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.bytes
    }
}

impl SharedSecret {
    /// Get the raw bytes of the shared secret.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.bytes
    }
}

impl KeyPair {
    /// Rebuild a key pair from its secret half.
    pub fn from_secret(secret: X25519StaticSecret) -> Self {
        let public = secret.public_key();
        Self { secret, public }
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &hex::encode(self.public.as_bytes()))
            .finish()
    }
}

/// Generate a fresh key pair from OS randomness.
pub fn generate_key_pair() -> KeyPair {
    KeyPair::from_secret(X25519StaticSecret::random())
}

/// Compute the shared secret between our secret and a peer public key.
///
/// Deterministic and symmetric: `agree(a, B) == agree(b, A)`.
pub fn agree(secret: &X25519StaticSecret, peer_public: &X25519PublicKey) -> Result<SharedSecret> {
    secret.diffie_hellman(peer_public)
}

/// Compute X25519 basepoint multiplication (public key from secret).
pub fn basepoint_mult(secret: &[u8; 32]) -> [u8; 32] {
    let sk = StaticSecret::from(*secret);
    let pk = PublicKey::from(&sk);
    pk.to_bytes()
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn test_key_generation() {
        let pair = generate_key_pair();
        assert_ne!(pair.public.to_bytes(), [0u8; 32]);
        assert_eq!(pair.secret.public_key(), pair.public);
    }

    #[test]
    fn test_generated_pairs_are_distinct() {
        let publics: HashSet<[u8; 32]> = (0..64)
            .map(|_| generate_key_pair().public.to_bytes())
            .collect();
        assert_eq!(publics.len(), 64);
    }

    #[test]
    fn test_agreement_is_symmetric() {
        let alice = generate_key_pair();
        let bob = generate_key_pair();

        let alice_shared = agree(&alice.secret, &bob.public).expect("agree");
        let bob_shared = agree(&bob.secret, &alice.public).expect("agree");

        assert_eq!(alice_shared.as_bytes(), bob_shared.as_bytes());
    }

    #[test]
    fn test_agreement_is_deterministic() {
        let alice = generate_key_pair();
        let bob = generate_key_pair();
        let first = agree(&alice.secret, &bob.public).expect("agree");
        let second = agree(&alice.secret, &bob.public).expect("agree");
        assert_eq!(first.as_bytes(), second.as_bytes());
    }

    #[test]
    fn test_low_order_point_rejected() {
        let alice = generate_key_pair();
        let zero = X25519PublicKey::from_bytes([0u8; 32]);
        assert!(matches!(
            agree(&alice.secret, &zero),
            Err(CryptoError::InvalidKeyMaterial(_))
        ));
    }

    #[test]
    fn test_from_slice_wrong_length() {
        assert!(matches!(
            X25519PublicKey::from_slice(&[1u8; 31]),
            Err(CryptoError::InvalidKeyMaterial(_))
        ));
        assert!(X25519PublicKey::from_slice(&[9u8; 32]).is_ok());
    }

    #[test]
    fn test_from_bytes_roundtrip() {
        let secret = X25519StaticSecret::random();
        let restored = X25519StaticSecret::from_bytes(secret.to_bytes());
        assert_eq!(secret.public_key(), restored.public_key());
    }

    #[test]
    fn test_rfc7748_section6_1() {
        let alice_private = hex_literal::hex!(
            "77076d0a7318a57d3c16c17251b26645df4c2f87ebc0992ab177fba51db92c2a"
        );
        let alice_public = hex_literal::hex!(
            "8520f0098930a754748b7ddcb43ef75a0dbf3a0d26381af4eba4a98eaa9b4e6a"
        );
        let bob_private = hex_literal::hex!(
            "5dab087e624a8a4b79e17f8b83800ee66f3bb1292618b6fd1c2f8b27ff88e0eb"
        );
        let bob_public = hex_literal::hex!(
            "de9edb7d7b7dc1b4d35b61c2ece435373f8343c85b78674dadfc7e146f882b4f"
        );
        let shared = hex_literal::hex!(
            "4a5d9d5ba4ce2de1728e3bf480350f25e07e21c947d19e3376f09b3c1e161742"
        );

        assert_eq!(basepoint_mult(&alice_private), alice_public);
        assert_eq!(basepoint_mult(&bob_private), bob_public);

        let alice = X25519StaticSecret::from_bytes(alice_private);
        let computed = agree(&alice, &X25519PublicKey::from_bytes(bob_public)).expect("agree");
        assert_eq!(computed.as_bytes(), &shared);
    }
}
