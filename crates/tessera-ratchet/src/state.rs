//! Per-conversation ratchet state.
//!
//! Everything here is secret except the public halves of DH keys. The state
//! serializes for persistence (the arena encrypts it before it leaves memory)
//! and is zeroized on drop and on explicit teardown.

use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::chain::ChainKey;

/// Which side of the handshake this state belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Initiator,
    Responder,
}

/// A message key derived ahead of time for an out-of-order message.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct SkippedKey {
    /// Remote DH public key of the chain the key belongs to.
    pub(crate) dh_public: [u8; 32],
    pub(crate) counter: u64,
    pub(crate) key: [u8; 32],
}

/// Ratchet state for one conversation.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct RatchetState {
    #[zeroize(skip)]
    pub(crate) role: Role,
    /// Root of our sending direction.
    pub(crate) sending_root_key: [u8; 32],
    /// Root of the peer's sending direction.
    pub(crate) receiving_root_key: [u8; 32],
    pub(crate) sending_chain_key: Option<ChainKey>,
    /// Counter of the next message we send. Equals the number of messages sent.
    pub(crate) sending_counter: u64,
    /// Counter at which the current sending chain began.
    pub(crate) previous_sending_counter: u64,
    /// Sending DH steps taken so far; carried in every header.
    pub(crate) sending_chain_index: u64,
    pub(crate) receiving_chain_key: Option<ChainKey>,
    /// Counter of the next in-order message expected on the receiving chain.
    pub(crate) receiving_counter: u64,
    /// Chain index of the current receiving chain; 0 before the first message.
    pub(crate) receiving_chain_index: u64,
    /// Our current DH ratchet secret and public key.
    pub(crate) dh_secret: Option<[u8; 32]>,
    pub(crate) dh_public: Option<[u8; 32]>,
    /// Previous DH secrets, newest first, kept so a peer that has not yet
    /// seen our newest public key can still reach us.
    pub(crate) retained_dh_secrets: Vec<[u8; 32]>,
    pub(crate) remote_dh_public: Option<[u8; 32]>,
    /// A new remote key arrived since our last sending DH step.
    pub(crate) remote_key_changed: bool,
    /// Skipped message keys in insertion order (oldest first).
    pub(crate) skipped: Vec<SkippedKey>,
    pub(crate) closed: bool,
}

impl RatchetState {
    pub(crate) fn new(role: Role, sending_root_key: [u8; 32], receiving_root_key: [u8; 32]) -> Self {
        Self {
            role,
            sending_root_key,
            receiving_root_key,
            sending_chain_key: None,
            sending_counter: 0,
            previous_sending_counter: 0,
            sending_chain_index: 0,
            receiving_chain_key: None,
            receiving_counter: 0,
            receiving_chain_index: 0,
            dh_secret: None,
            dh_public: None,
            retained_dh_secrets: Vec::new(),
            remote_dh_public: None,
            remote_key_changed: false,
            skipped: Vec::new(),
            closed: false,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn sending_counter(&self) -> u64 {
        self.sending_counter
    }

    pub fn previous_sending_counter(&self) -> u64 {
        self.previous_sending_counter
    }

    pub fn receiving_counter(&self) -> u64 {
        self.receiving_counter
    }

    pub fn sending_chain_index(&self) -> u64 {
        self.sending_chain_index
    }

    pub fn receiving_chain_index(&self) -> u64 {
        self.receiving_chain_index
    }

    pub fn dh_public_key(&self) -> Option<[u8; 32]> {
        self.dh_public
    }

    pub fn remote_dh_public_key(&self) -> Option<[u8; 32]> {
        self.remote_dh_public
    }

    pub fn skipped_len(&self) -> usize {
        self.skipped.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Index of the skipped key for `(dh_public, counter)`, if cached.
    pub(crate) fn find_skipped(&self, dh_public: &[u8; 32], counter: u64) -> Option<usize> {
        self.skipped
            .iter()
            .position(|s| s.counter == counter && &s.dh_public == dh_public)
    }

    /// Remove and return a skipped key. The returned entry zeroizes on drop.
    pub(crate) fn take_skipped(&mut self, index: usize) -> SkippedKey {
        self.skipped.remove(index)
    }

    /// Cache a skipped key, purging the oldest entries beyond `max`.
    pub(crate) fn push_skipped(&mut self, dh_public: [u8; 32], counter: u64, key: [u8; 32], max: usize) {
        self.skipped.push(SkippedKey {
            dh_public,
            counter,
            key,
        });
        if self.skipped.len() > max {
            let excess = self.skipped.len() - max;
            // Drained entries zeroize on drop.
            self.skipped.drain(..excess);
        }
    }

    /// Own DH secrets to try against a new remote key, newest first.
    pub(crate) fn own_secrets(&self) -> Vec<[u8; 32]> {
        self.dh_secret
            .iter()
            .chain(self.retained_dh_secrets.iter())
            .copied()
            .collect()
    }

    /// Zeroize all key material and mark the state closed.
    pub(crate) fn teardown(&mut self) {
        self.zeroize();
        self.closed = true;
    }
}

impl std::fmt::Debug for RatchetState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RatchetState")
            .field("role", &self.role)
            .field("sending_counter", &self.sending_counter)
            .field("previous_sending_counter", &self.previous_sending_counter)
            .field("receiving_counter", &self.receiving_counter)
            .field("sending_chain_index", &self.sending_chain_index)
            .field("receiving_chain_index", &self.receiving_chain_index)
            .field("skipped", &self.skipped.len())
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_skipped_keys_bounded_oldest_first() {
        let mut state = RatchetState::new(Role::Initiator, [1; 32], [2; 32]);
        for counter in 0..5 {
            state.push_skipped([9; 32], counter, [counter as u8; 32], 3);
        }
        assert_eq!(state.skipped_len(), 3);
        assert!(state.find_skipped(&[9; 32], 0).is_none());
        assert!(state.find_skipped(&[9; 32], 1).is_none());
        assert_eq!(state.find_skipped(&[9; 32], 2), Some(0));
        assert!(state.find_skipped(&[8; 32], 2).is_none());
    }

    #[test]
    fn test_take_skipped_removes() {
        let mut state = RatchetState::new(Role::Responder, [1; 32], [2; 32]);
        state.push_skipped([9; 32], 7, [7; 32], 10);
        let idx = state.find_skipped(&[9; 32], 7).expect("cached");
        let taken = state.take_skipped(idx);
        assert_eq!(taken.key, [7; 32]);
        assert_eq!(state.skipped_len(), 0);
    }

    #[test]
    fn test_teardown_clears_material() {
        let mut state = RatchetState::new(Role::Initiator, [1; 32], [2; 32]);
        state.sending_chain_key = Some(ChainKey::new([3; 32]));
        state.dh_secret = Some([4; 32]);
        state.push_skipped([9; 32], 0, [5; 32], 10);
        state.teardown();

        assert!(state.is_closed());
        assert_eq!(state.sending_root_key, [0; 32]);
        assert_eq!(state.receiving_root_key, [0; 32]);
        assert!(state.sending_chain_key.is_none());
        assert!(state.dh_secret.is_none());
        assert_eq!(state.skipped_len(), 0);
    }

    #[test]
    fn test_own_secrets_newest_first() {
        let mut state = RatchetState::new(Role::Initiator, [1; 32], [2; 32]);
        state.dh_secret = Some([3; 32]);
        state.retained_dh_secrets = vec![[2; 32], [1; 32]];
        assert_eq!(state.own_secrets(), vec![[3; 32], [2; 32], [1; 32]]);
    }
}
