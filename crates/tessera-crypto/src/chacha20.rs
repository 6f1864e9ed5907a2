//! ChaCha20-Poly1305 AEAD encryption (RFC 8439).
//!
//! Used for ratchet message payloads, the ledger anti-tamper seal, and key
//! material and session state at rest.
//!
//! Every seal draws a fresh 96-bit nonce from OS randomness and returns the
//! ciphertext, nonce and 16-byte tag separately. Opening fails closed: a single
//! flipped bit anywhere in the ciphertext, nonce, tag or associated data yields
//! [`CryptoError::AeadDecryption`], never plaintext.

use std::collections::{HashSet, VecDeque};

use chacha20poly1305::{
    aead::{AeadInPlace, KeyInit},
    ChaCha20Poly1305, Key, Nonce, Tag,
};
use rand::RngCore;
use zeroize::Zeroize;

use crate::{CryptoError, Result};

/// Nonce size for ChaCha20-Poly1305 (96 bits = 12 bytes).
pub const NONCE_SIZE: usize = 12;

/// Key size for ChaCha20-Poly1305 (256 bits = 32 bytes).
pub const KEY_SIZE: usize = 32;

/// Authentication tag size (128 bits = 16 bytes).
pub const TAG_SIZE: usize = 16;

/// Output of a seal operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SealedBox {
    /// Encrypted payload, same length as the plaintext.
    pub ciphertext: Vec<u8>,
    /// The nonce used for this seal.
    pub nonce: [u8; NONCE_SIZE],
    /// The detached Poly1305 tag.
    pub tag: [u8; TAG_SIZE],
}

impl SealedBox {
    /// Concatenate `nonce || ciphertext || tag`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(NONCE_SIZE + self.ciphertext.len() + TAG_SIZE);
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.ciphertext);
        out.extend_from_slice(&self.tag);
        out
    }

    /// Split `nonce || ciphertext || tag`.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < NONCE_SIZE + TAG_SIZE {
            return Err(CryptoError::InvalidInput("sealed box too short".into()));
        }
        let (nonce, rest) = data.split_at(NONCE_SIZE);
        let (ciphertext, tag) = rest.split_at(rest.len() - TAG_SIZE);
        let mut out = Self {
            ciphertext: ciphertext.to_vec(),
            nonce: [0u8; NONCE_SIZE],
            tag: [0u8; TAG_SIZE],
        };
        out.nonce.copy_from_slice(nonce);
        out.tag.copy_from_slice(tag);
        Ok(out)
    }
}

/// Generate a random nonce.
pub fn random_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    nonce
}

fn seal_with(
    key: &[u8; KEY_SIZE],
    nonce: [u8; NONCE_SIZE],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<SealedBox> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let mut buffer = plaintext.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(Nonce::from_slice(&nonce), aad, &mut buffer)
        .map_err(|_| CryptoError::AeadEncryption)?;

    let mut tag_bytes = [0u8; TAG_SIZE];
    tag_bytes.copy_from_slice(tag.as_slice());
    Ok(SealedBox {
        ciphertext: buffer,
        nonce,
        tag: tag_bytes,
    })
}

/// Encrypt `plaintext` under `key` with a fresh random nonce.
///
/// # Arguments
///
/// * `key` - 32-byte encryption key
/// * `plaintext` - Data to encrypt
/// * `aad` - Additional authenticated data (not encrypted, but authenticated)
pub fn seal(key: &[u8; KEY_SIZE], plaintext: &[u8], aad: &[u8]) -> Result<SealedBox> {
    seal_with(key, random_nonce(), plaintext, aad)
}

/// Decrypt and authenticate.
///
/// # Errors
///
/// Returns [`CryptoError::AeadDecryption`] if any input was altered.
pub fn open(
    key: &[u8; KEY_SIZE],
    ciphertext: &[u8],
    nonce: &[u8; NONCE_SIZE],
    tag: &[u8; TAG_SIZE],
    aad: &[u8],
) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let mut buffer = ciphertext.to_vec();
    cipher
        .decrypt_in_place_detached(Nonce::from_slice(nonce), aad, &mut buffer, Tag::from_slice(tag))
        .map_err(|_| CryptoError::AeadDecryption)?;
    Ok(buffer)
}

/// Open a [`SealedBox`].
pub fn open_box(key: &[u8; KEY_SIZE], sealed: &SealedBox, aad: &[u8]) -> Result<Vec<u8>> {
    open(key, &sealed.ciphertext, &sealed.nonce, &sealed.tag, aad)
}

/// Nonces a [`SealingKey`] remembers by default.
pub const DEFAULT_NONCE_WINDOW: usize = 4096;

/// A long-lived key that refuses to seal twice under the same nonce.
///
/// Every key that encrypts more than one record (the master key, the
/// at-rest subkeys of managed keys) seals through one of these. The most
/// recent `window` nonces are remembered; a random draw that hits one is
/// redrawn and logged, and an explicit nonce that hits one is an error.
pub struct SealingKey {
    key: [u8; KEY_SIZE],
    recent: HashSet<[u8; NONCE_SIZE]>,
    order: VecDeque<[u8; NONCE_SIZE]>,
    window: usize,
    sealed: u64,
}

impl SealingKey {
    /// Wrap a raw key with the default nonce window.
    pub fn new(key: [u8; KEY_SIZE]) -> Self {
        Self::with_window(key, DEFAULT_NONCE_WINDOW)
    }

    /// Wrap a raw key remembering at most `window` nonces (minimum 1).
    pub fn with_window(key: [u8; KEY_SIZE], window: usize) -> Self {
        let window = window.max(1);
        Self {
            key,
            recent: HashSet::with_capacity(window),
            order: VecDeque::with_capacity(window),
            window,
            sealed: 0,
        }
    }

    /// Seal with a fresh random nonce, redrawing if it is still in the
    /// window.
    pub fn seal(&mut self, plaintext: &[u8], aad: &[u8]) -> Result<SealedBox> {
        let mut nonce = random_nonce();
        while self.recent.contains(&nonce) {
            tracing::error!("random nonce collision under a single key; redrawing");
            nonce = random_nonce();
        }
        self.seal_with_nonce(nonce, plaintext, aad)
    }

    /// Seal with an explicit nonce.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::NonceReuse`] if `nonce` is still in the window.
    pub fn seal_with_nonce(
        &mut self,
        nonce: [u8; NONCE_SIZE],
        plaintext: &[u8],
        aad: &[u8],
    ) -> Result<SealedBox> {
        if self.recent.contains(&nonce) {
            return Err(CryptoError::NonceReuse);
        }
        let sealed = seal_with(&self.key, nonce, plaintext, aad)?;
        self.remember(nonce);
        Ok(sealed)
    }

    fn remember(&mut self, nonce: [u8; NONCE_SIZE]) {
        self.recent.insert(nonce);
        self.order.push_back(nonce);
        while self.order.len() > self.window {
            if let Some(oldest) = self.order.pop_front() {
                self.recent.remove(&oldest);
            }
        }
        self.sealed += 1;
    }

    /// Open a box sealed under this key.
    pub fn open(&self, sealed: &SealedBox, aad: &[u8]) -> Result<Vec<u8>> {
        open_box(&self.key, sealed, aad)
    }

    /// Number of seals made with this key.
    pub fn seal_count(&self) -> u64 {
        self.sealed
    }

    /// Number of nonces currently remembered.
    pub fn nonces_tracked(&self) -> usize {
        self.order.len()
    }
}

impl Drop for SealingKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; KEY_SIZE] = [0x42u8; KEY_SIZE];

    #[test]
    fn test_seal_open_roundtrip() {
        let sealed = seal(&KEY, b"Hello, Tessera!", b"associated data").expect("seal");
        let opened = open_box(&KEY, &sealed, b"associated data").expect("open");
        assert_eq!(opened, b"Hello, Tessera!");
    }

    #[test]
    fn test_nonce_fresh_per_call() {
        let a = seal(&KEY, b"same", b"").expect("seal");
        let b = seal(&KEY, b"same", b"").expect("seal");
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn test_ciphertext_length() {
        let sealed = seal(&KEY, b"test", b"").expect("seal");
        assert_eq!(sealed.ciphertext.len(), 4);
    }

    #[test]
    fn test_wrong_key_fails() {
        let sealed = seal(&[0x01; KEY_SIZE], b"test", b"").expect("seal");
        assert!(matches!(
            open_box(&[0x02; KEY_SIZE], &sealed, b""),
            Err(CryptoError::AeadDecryption)
        ));
    }

    #[test]
    fn test_wrong_aad_fails() {
        let sealed = seal(&KEY, b"test", b"aad1").expect("seal");
        assert!(open_box(&KEY, &sealed, b"aad2").is_err());
    }

    #[test]
    fn test_every_single_bit_flip_fails() {
        let sealed = seal(&KEY, b"flip me", b"hdr").expect("seal");

        for i in 0..sealed.ciphertext.len() * 8 {
            let mut tampered = sealed.clone();
            tampered.ciphertext[i / 8] ^= 1 << (i % 8);
            assert!(open_box(&KEY, &tampered, b"hdr").is_err(), "ciphertext bit {i}");
        }
        for i in 0..NONCE_SIZE * 8 {
            let mut tampered = sealed.clone();
            tampered.nonce[i / 8] ^= 1 << (i % 8);
            assert!(open_box(&KEY, &tampered, b"hdr").is_err(), "nonce bit {i}");
        }
        for i in 0..TAG_SIZE * 8 {
            let mut tampered = sealed.clone();
            tampered.tag[i / 8] ^= 1 << (i % 8);
            assert!(open_box(&KEY, &tampered, b"hdr").is_err(), "tag bit {i}");
        }
    }

    #[test]
    fn test_empty_plaintext() {
        let sealed = seal(&KEY, b"", b"").expect("seal");
        assert!(sealed.ciphertext.is_empty());
        assert!(open_box(&KEY, &sealed, b"").expect("open").is_empty());
    }

    #[test]
    fn test_sealed_box_bytes_roundtrip() {
        let sealed = seal(&KEY, b"payload", b"").expect("seal");
        let restored = SealedBox::from_bytes(&sealed.to_bytes()).expect("parse");
        assert_eq!(sealed, restored);
        assert!(SealedBox::from_bytes(&[0u8; 10]).is_err());
    }

    #[test]
    fn test_sealing_key_rejects_nonce_reuse() {
        let mut key = SealingKey::new(KEY);
        let nonce = [0x07u8; NONCE_SIZE];
        key.seal_with_nonce(nonce, b"first", b"").expect("first seal");
        assert!(matches!(
            key.seal_with_nonce(nonce, b"second", b""),
            Err(CryptoError::NonceReuse)
        ));
        assert_eq!(key.seal_count(), 1);
    }

    #[test]
    fn test_sealing_key_window_is_bounded() {
        let mut key = SealingKey::with_window(KEY, 3);
        let first = [0x01u8; NONCE_SIZE];
        key.seal_with_nonce(first, b"a", b"").expect("seal");
        assert!(matches!(
            key.seal_with_nonce(first, b"b", b""),
            Err(CryptoError::NonceReuse)
        ));
        for i in 0..5 {
            key.seal(&[i], b"").expect("seal");
        }
        assert_eq!(key.nonces_tracked(), 3);
        assert_eq!(key.seal_count(), 6);
    }

    #[test]
    fn test_sealing_key_roundtrip() {
        let mut key = SealingKey::new(KEY);
        let a = key.seal(b"one", b"").expect("seal");
        let b = key.seal(b"two", b"").expect("seal");
        assert_ne!(a.nonce, b.nonce);
        assert_eq!(key.open(&a, b"").expect("open"), b"one");
        assert_eq!(key.open(&b, b"").expect("open"), b"two");
    }
}
