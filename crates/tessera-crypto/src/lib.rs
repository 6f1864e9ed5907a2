//! # tessera-crypto
//!
//! Cryptographic primitives for the Tessera core.
//!
//! One fixed suite is used everywhere: X25519 for key agreement, ChaCha20-Poly1305
//! for authenticated encryption, BLAKE3 for hashing, MACs and key derivation, and
//! Ed25519 for signatures. There is no algorithm negotiation and no simulated
//! fallback primitive set.
//!
//! ## Modules
//!
//! - [`blake3`] — Domain-separated BLAKE3 hashing, keyed MAC, Merkle node hashing
//! - [`kdf`] — Labelled, iterated key derivation (chain keys, message keys, root keys)
//! - [`x25519`] — X25519 key pairs and key agreement (RFC 7748)
//! - [`chacha20`] — ChaCha20-Poly1305 AEAD with detached tags (RFC 8439)
//! - [`ed25519`] — Ed25519 signing and verification (RFC 8032)
//! - [`argon2id`] — Passphrase-to-key derivation for the master key

pub mod argon2id;
pub mod blake3;
pub mod chacha20;
pub mod ed25519;
pub mod kdf;
pub mod x25519;

/// Error types for cryptographic operations.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// Ed25519 signature verification failed.
    #[error("signature verification failed")]
    SignatureVerification,

    /// AEAD decryption failed (authentication tag mismatch).
    #[error("authentication failure: AEAD tag mismatch")]
    AeadDecryption,

    /// AEAD encryption failed.
    #[error("AEAD encryption failed")]
    AeadEncryption,

    /// A nonce was presented for the second time under the same key.
    #[error("nonce reuse under the same key is forbidden")]
    NonceReuse,

    /// Key bytes are malformed or produce a degenerate agreement.
    #[error("invalid key material: {0}")]
    InvalidKeyMaterial(String),

    /// Key derivation failed.
    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    /// Invalid key length.
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    /// Argon2id hashing failed.
    #[error("argon2id error: {0}")]
    Argon2(String),

    /// Invalid input data.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

pub type Result<T> = std::result::Result<T, CryptoError>;
