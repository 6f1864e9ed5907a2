//! Symmetric chain ratchet.
//!
//! Each ratchet step derives two keys from the current chain key:
//! - A **message key** for exactly one message, bound to its counter.
//! - A **new chain key** for the next step.
//!
//! ```text
//! message_key = derive_at(chain_key, "MESSAGE_KEY", counter)
//! chain_key'  = derive(chain_key, "CHAIN_KEY_ADVANCE")
//! ```
//!
//! The old chain key is overwritten on advance, so a later chain key cannot
//! reproduce earlier message keys.

use serde::{Deserialize, Serialize};
use tessera_crypto::kdf::{self, labels};
use tessera_crypto::Result;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// A single-use message key.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct MessageKey {
    key: [u8; 32],
    #[zeroize(skip)]
    counter: u64,
}

impl MessageKey {
    pub fn key(&self) -> &[u8; 32] {
        &self.key
    }

    /// Session-global counter of the message this key belongs to.
    pub fn counter(&self) -> u64 {
        self.counter
    }
}

impl std::fmt::Debug for MessageKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageKey")
            .field("counter", &self.counter)
            .finish_non_exhaustive()
    }
}

/// A sending or receiving chain key.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct ChainKey([u8; 32]);

impl ChainKey {
    pub fn new(key: [u8; 32]) -> Self {
        Self(key)
    }

    /// Derive the message key for `counter` without advancing.
    pub fn message_key(&self, counter: u64) -> Result<MessageKey> {
        Ok(MessageKey {
            key: kdf::derive_at(&self.0, labels::MESSAGE_KEY, counter)?,
            counter,
        })
    }

    /// The next chain key.
    pub fn advance(&self) -> Result<ChainKey> {
        Ok(ChainKey(kdf::derive_32(&self.0, labels::CHAIN_KEY_ADVANCE)?))
    }

    /// Derive the message key for `counter` and advance in place.
    pub fn derive_and_advance(&mut self, counter: u64) -> Result<MessageKey> {
        let message_key = self.message_key(counter)?;
        let mut next = self.advance()?;
        std::mem::swap(self, &mut next);
        Ok(message_key)
    }
}

impl std::fmt::Debug for ChainKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ChainKey(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key_at(chain: &ChainKey, counter: u64) -> [u8; 32] {
        *chain.message_key(counter).expect("message key").key()
    }

    #[test]
    fn test_message_key_deterministic() {
        let chain = ChainKey::new([0x42; 32]);
        assert_eq!(key_at(&chain, 0), key_at(&chain, 0));
        assert_ne!(key_at(&chain, 0), key_at(&chain, 1));
    }

    #[test]
    fn test_advance_changes_chain_key() {
        let chain = ChainKey::new([0x42; 32]);
        let advanced = chain.advance().expect("advance");
        assert_ne!(chain, advanced);
        assert_ne!(key_at(&chain, 0), key_at(&advanced, 0));
    }

    #[test]
    fn test_derive_and_advance() {
        let mut chain = ChainKey::new([0x42; 32]);
        let expected_next = chain.advance().expect("advance");

        let key0 = chain.derive_and_advance(0).expect("derive");
        assert_eq!(key0.counter(), 0);
        assert_eq!(chain, expected_next);

        let key1 = chain.derive_and_advance(1).expect("derive");
        assert_ne!(key0.key(), key1.key());
    }

    #[test]
    fn test_forward_secrecy() {
        // A later chain key must not reproduce an earlier message key.
        let chain0 = ChainKey::new([0xAA; 32]);
        let key0 = key_at(&chain0, 0);
        let chain1 = chain0.advance().expect("advance");
        assert_ne!(key_at(&chain1, 0), key0);
        assert_eq!(key_at(&ChainKey::new([0xAA; 32]), 0), key0);
    }

    #[test]
    fn test_different_roots_different_chains() {
        assert_ne!(
            key_at(&ChainKey::new([0x01; 32]), 0),
            key_at(&ChainKey::new([0x02; 32]), 0)
        );
    }

    #[test]
    fn test_debug_hides_key() {
        let chain = ChainKey::new([0x77; 32]);
        assert_eq!(format!("{chain:?}"), "ChainKey(..)");
    }
}
