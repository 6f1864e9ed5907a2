//! Double Ratchet state machine.
//!
//! ## Initialisation
//!
//! Both sides start from the same 32-byte handshake secret and derive one
//! root key per direction:
//!
//! ```text
//! initiator -> responder root = derive(secret, "INITIATOR_ROOT")
//! responder -> initiator root = derive(secret, "RESPONDER_ROOT")
//! ```
//!
//! The initiator knows the responder's ratchet public key and performs its
//! first sending DH step immediately. The responder waits for a message.
//!
//! ## DH-ratchet step
//!
//! ```text
//! (root', chain) = derive_pair(LP(root) || LP(DH(own_secret, remote_public)), "ROOT_KEY_UPDATE")
//! ```
//!
//! A sending step happens when there is no sending chain, when a new remote
//! key arrived since the last sending step, or after `dh_ratchet_interval`
//! messages on the current chain. A receiving step happens when a header
//! carries an unseen remote key; each retained own secret is tried, newest
//! first, and the first that authenticates wins.
//!
//! Every header carries the sender's chain index (its count of sending DH
//! steps). Receiving roots advance once per chain, so a chain can only be
//! entered directly after its predecessor. A header whose chain index is
//! not the next one is answered with `KeyNotFound`, leaving the state
//! untouched so the message can be delivered again later.
//!
//! ## Failure semantics
//!
//! Receive work runs on a scratch copy of the state. The copy replaces the
//! live state only after AEAD open succeeds, so a forged or corrupted
//! message never advances a counter or consumes a message key.

use tessera_crypto::blake3;
use tessera_crypto::chacha20;
use tessera_crypto::kdf::{self, labels};
use tessera_crypto::x25519::{KeyPair, X25519PublicKey, X25519StaticSecret};
use tessera_types::message::RatchetHeader;
use tracing::{debug, warn};
use zeroize::Zeroize;

use crate::chain::ChainKey;
use crate::state::{RatchetState, Role};
use crate::{RatchetError, Result};

/// Ratchet tuning.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RatchetConfig {
    /// Messages per sending chain before a forced DH step.
    pub dh_ratchet_interval: u64,
    /// Largest counter gap a single message may skip over.
    pub max_skip: u64,
    /// Maximum cached skipped keys; the oldest are purged beyond this.
    pub max_skipped_keys: usize,
    /// Previous own DH secrets kept for peers that lag behind.
    pub retained_dh_keys: usize,
}

impl Default for RatchetConfig {
    fn default() -> Self {
        Self {
            dh_ratchet_interval: 100,
            max_skip: 1000,
            max_skipped_keys: 2000,
            retained_dh_keys: 4,
        }
    }
}

/// AEAD output for one message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CiphertextBundle {
    pub ciphertext: Vec<u8>,
    pub nonce: [u8; 12],
    pub auth_tag: [u8; 16],
}

/// One side of a Double Ratchet conversation.
#[derive(Clone)]
pub struct DoubleRatchet {
    state: RatchetState,
    config: RatchetConfig,
}

/// AEAD associated data: the canonical header plus caller-supplied data.
fn associated_data(header: &RatchetHeader, aad: &[u8]) -> Vec<u8> {
    blake3::encode_multi_field(&[&header.to_bytes(), aad])
}

/// Fold a DH output into `root`, returning the new root and chain key.
fn root_step(root: &[u8; 32], dh_output: &[u8; 32]) -> Result<([u8; 32], ChainKey)> {
    let mut input = blake3::encode_multi_field(&[root, dh_output]);
    let (new_root, chain) = kdf::derive_pair(&input, labels::ROOT_KEY_UPDATE)?;
    input.zeroize();
    Ok((new_root, ChainKey::new(chain)))
}

fn direction_roots(shared_secret: &[u8; 32]) -> Result<([u8; 32], [u8; 32])> {
    Ok((
        kdf::derive_32(shared_secret, labels::INITIATOR_ROOT)?,
        kdf::derive_32(shared_secret, labels::RESPONDER_ROOT)?,
    ))
}

impl DoubleRatchet {
    /// Start as the initiator, knowing the responder's ratchet public key.
    pub fn initiate(
        shared_secret: &[u8; 32],
        remote_ratchet_public: &X25519PublicKey,
        config: RatchetConfig,
    ) -> Result<Self> {
        let (to_responder, to_initiator) = direction_roots(shared_secret)?;
        let mut state = RatchetState::new(Role::Initiator, to_responder, to_initiator);
        state.remote_dh_public = Some(remote_ratchet_public.to_bytes());
        sending_dh_step(&mut state, &config)?;
        debug!("Ratchet initiated");
        Ok(Self { state, config })
    }

    /// Start as the responder, owning the ratchet key pair the initiator
    /// used.
    pub fn respond(
        shared_secret: &[u8; 32],
        own_ratchet: KeyPair,
        config: RatchetConfig,
    ) -> Result<Self> {
        let (to_responder, to_initiator) = direction_roots(shared_secret)?;
        let mut state = RatchetState::new(Role::Responder, to_initiator, to_responder);
        state.dh_secret = Some(own_ratchet.secret.to_bytes());
        state.dh_public = Some(own_ratchet.public.to_bytes());
        debug!("Ratchet awaiting first message");
        Ok(Self { state, config })
    }

    /// Resume from persisted state.
    pub fn from_state(state: RatchetState, config: RatchetConfig) -> Self {
        Self { state, config }
    }

    pub fn state(&self) -> &RatchetState {
        &self.state
    }

    pub fn config(&self) -> &RatchetConfig {
        &self.config
    }

    pub fn sending_counter(&self) -> u64 {
        self.state.sending_counter
    }

    pub fn receiving_counter(&self) -> u64 {
        self.state.receiving_counter
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed
    }

    /// Encrypt the next outbound message.
    pub fn encrypt_next(
        &mut self,
        plaintext: &[u8],
        aad: &[u8],
    ) -> Result<(CiphertextBundle, RatchetHeader)> {
        if self.state.closed {
            return Err(RatchetError::SessionClosed);
        }
        let mut next = self.state.clone();

        let chain_len = next.sending_counter - next.previous_sending_counter;
        if next.sending_chain_key.is_none()
            || next.remote_key_changed
            || chain_len >= self.config.dh_ratchet_interval
        {
            sending_dh_step(&mut next, &self.config)?;
        }

        let counter = next.sending_counter;
        let message_key = next
            .sending_chain_key
            .as_mut()
            .ok_or(RatchetError::NoSendingChain)?
            .derive_and_advance(counter)?;
        next.sending_counter += 1;

        let header = RatchetHeader {
            dh_public_key: next.dh_public.ok_or(RatchetError::NoSendingChain)?,
            chain_index: next.sending_chain_index,
            previous_counter: next.previous_sending_counter,
            counter,
        };
        let sealed = chacha20::seal(
            message_key.key(),
            plaintext,
            &associated_data(&header, aad),
        )?;

        self.state = next;
        Ok((
            CiphertextBundle {
                ciphertext: sealed.ciphertext,
                nonce: sealed.nonce,
                auth_tag: sealed.tag,
            },
            header,
        ))
    }

    /// Decrypt a message whose MAC has already been verified.
    pub fn decrypt_at(
        &mut self,
        header: &RatchetHeader,
        bundle: &CiphertextBundle,
        aad: &[u8],
    ) -> Result<Vec<u8>> {
        if self.state.closed {
            return Err(RatchetError::SessionClosed);
        }
        if header.counter < header.previous_counter {
            return Err(RatchetError::InvalidHeader(format!(
                "counter {} precedes chain start {}",
                header.counter, header.previous_counter
            )));
        }
        let ad = associated_data(header, aad);

        if let Some(index) = self
            .state
            .find_skipped(&header.dh_public_key, header.counter)
        {
            let plaintext = open(&self.state.skipped[index].key, bundle, &ad)?;
            drop(self.state.take_skipped(index));
            debug!(counter = header.counter, "Decrypted with skipped key");
            return Ok(plaintext);
        }

        if self.state.remote_dh_public != Some(header.dh_public_key) {
            return self.decrypt_with_new_remote_key(header, bundle, &ad);
        }

        let mut trial = self.state.clone();
        let plaintext = resolve_and_open(&mut trial, header, bundle, &ad, &self.config)?;
        self.state = trial;
        Ok(plaintext)
    }

    fn decrypt_with_new_remote_key(
        &mut self,
        header: &RatchetHeader,
        bundle: &CiphertextBundle,
        ad: &[u8],
    ) -> Result<Vec<u8>> {
        let expected = self.state.receiving_chain_index + 1;
        if header.chain_index != expected {
            debug!(
                chain_index = header.chain_index,
                expected, "Message from a chain that cannot be entered yet"
            );
            return Err(RatchetError::KeyNotFound {
                counter: header.counter,
            });
        }

        let mut base = self.state.clone();
        if base.receiving_chain_key.is_some() {
            if header.previous_counter < base.receiving_counter {
                return Err(RatchetError::InvalidHeader(format!(
                    "new chain starts at {} behind receiving counter {}",
                    header.previous_counter, base.receiving_counter
                )));
            }
            skip_until(&mut base, header.previous_counter, &self.config)?;
        }

        let remote = X25519PublicKey::from_bytes(header.dh_public_key);
        for mut secret in base.own_secrets() {
            let dh = X25519StaticSecret::from_bytes(secret).diffie_hellman(&remote);
            secret.zeroize();
            let dh = dh.map_err(|e| RatchetError::InvalidHeader(e.to_string()))?;

            let mut trial = base.clone();
            let (root, chain) = root_step(&trial.receiving_root_key, dh.as_bytes())?;
            trial.receiving_root_key = root;
            trial.receiving_chain_key = Some(chain);
            trial.receiving_counter = header.previous_counter;
            trial.receiving_chain_index = header.chain_index;
            trial.remote_dh_public = Some(header.dh_public_key);
            trial.remote_key_changed = true;

            match resolve_and_open(&mut trial, header, bundle, ad, &self.config) {
                Ok(plaintext) => {
                    debug!(
                        chain_start = header.previous_counter,
                        "Receiving DH-ratchet step"
                    );
                    self.state = trial;
                    return Ok(plaintext);
                }
                Err(RatchetError::AuthenticationFailure) => continue,
                Err(e) => return Err(e),
            }
        }
        warn!(counter = header.counter, "No retained DH secret authenticates message");
        Err(RatchetError::AuthenticationFailure)
    }

    /// Tear the session down, zeroizing all key material.
    pub fn close(&mut self) {
        self.state.teardown();
        debug!("Ratchet closed");
    }
}

impl std::fmt::Debug for DoubleRatchet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DoubleRatchet")
            .field("state", &self.state)
            .field("config", &self.config)
            .finish()
    }
}

fn open(key: &[u8; 32], bundle: &CiphertextBundle, ad: &[u8]) -> Result<Vec<u8>> {
    chacha20::open(key, &bundle.ciphertext, &bundle.nonce, &bundle.auth_tag, ad)
        .map_err(|_| RatchetError::AuthenticationFailure)
}

/// Generate a fresh key pair, agree with the remote key and fold the result
/// into the sending root.
fn sending_dh_step(state: &mut RatchetState, config: &RatchetConfig) -> Result<()> {
    let remote = state.remote_dh_public.ok_or(RatchetError::NoSendingChain)?;
    let fresh = X25519StaticSecret::random();
    let dh = fresh.diffie_hellman(&X25519PublicKey::from_bytes(remote))?;
    let (root, chain) = root_step(&state.sending_root_key, dh.as_bytes())?;

    if let Some(old) = state.dh_secret.take() {
        state.retained_dh_secrets.insert(0, old);
        while state.retained_dh_secrets.len() > config.retained_dh_keys {
            if let Some(mut dropped) = state.retained_dh_secrets.pop() {
                dropped.zeroize();
            }
        }
    }
    state.dh_secret = Some(fresh.to_bytes());
    state.dh_public = Some(fresh.public_key().to_bytes());
    state.sending_root_key = root;
    state.sending_chain_key = Some(chain);
    state.previous_sending_counter = state.sending_counter;
    state.sending_chain_index += 1;
    state.remote_key_changed = false;
    debug!(chain_start = state.sending_counter, "Sending DH-ratchet step");
    Ok(())
}

/// Cache message keys of the current receiving chain up to (excluding)
/// `until`, advancing the chain.
fn skip_until(state: &mut RatchetState, until: u64, config: &RatchetConfig) -> Result<()> {
    if until <= state.receiving_counter {
        return Ok(());
    }
    if until - state.receiving_counter > config.max_skip {
        return Err(RatchetError::KeyNotFound { counter: until });
    }
    let remote = state
        .remote_dh_public
        .ok_or(RatchetError::KeyNotFound { counter: until })?;
    let mut chain = state
        .receiving_chain_key
        .take()
        .ok_or(RatchetError::KeyNotFound { counter: until })?;
    while state.receiving_counter < until {
        let counter = state.receiving_counter;
        let message_key = chain.derive_and_advance(counter)?;
        state.push_skipped(remote, counter, *message_key.key(), config.max_skipped_keys);
        state.receiving_counter += 1;
    }
    state.receiving_chain_key = Some(chain);
    Ok(())
}

/// Resolve the message key for `header.counter` on the current receiving
/// chain and open the bundle.
fn resolve_and_open(
    state: &mut RatchetState,
    header: &RatchetHeader,
    bundle: &CiphertextBundle,
    ad: &[u8],
    config: &RatchetConfig,
) -> Result<Vec<u8>> {
    if header.counter < state.receiving_counter || state.receiving_chain_key.is_none() {
        return Err(RatchetError::KeyNotFound {
            counter: header.counter,
        });
    }
    skip_until(state, header.counter, config)?;

    let counter = header.counter;
    let message_key = state
        .receiving_chain_key
        .as_mut()
        .ok_or(RatchetError::KeyNotFound { counter })?
        .derive_and_advance(counter)?;
    state.receiving_counter = counter + 1;
    open(message_key.key(), bundle, ad)
}
