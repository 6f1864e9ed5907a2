//! # tessera-ratchet
//!
//! Pairwise Double Ratchet messaging.
//!
//! Each conversation owns a [`state::RatchetState`] combining a
//! Diffie-Hellman ratchet (fresh X25519 key pairs folded into per-direction
//! root keys) with symmetric chain ratchets (one message key per counter).
//! [`codec`] wraps each ciphertext into an authenticated
//! [`EncryptedMessage`](tessera_types::message::EncryptedMessage) and checks
//! the MAC before the ratchet ever sees it.
//!
//! ## Modules
//!
//! - [`arena`]: owns all sessions and persists them encrypted at rest
//! - [`chain`]: chain keys and single-use message keys
//! - [`codec`]: MAC wrap/unwrap of transport records
//! - [`engine`]: the ratchet state machine (`encrypt_next` / `decrypt_at`)
//! - [`session`]: engine + MAC key + sequence numbers for one conversation
//! - [`state`]: serializable, zeroizing ratchet state
//!
//! ## Key Concepts
//!
//! - **Root key**: one per direction, advanced by every DH-ratchet step.
//! - **Counter**: session-global; after N sends `sending_counter == N`.
//! - **Skipped keys**: message keys derived ahead of time for out-of-order
//!   delivery, bounded and used at most once.

pub mod arena;
pub mod chain;
pub mod codec;
pub mod engine;
pub mod session;
pub mod state;

pub use arena::SessionArena;
pub use engine::{CiphertextBundle, DoubleRatchet, RatchetConfig};
pub use session::Session;

/// Error types for ratchet operations.
#[derive(Debug, thiserror::Error)]
pub enum RatchetError {
    /// MAC or AEAD tag mismatch. No state was changed.
    #[error("authentication failure")]
    AuthenticationFailure,

    /// The message key for this counter is gone or out of reach; the message
    /// is undeliverable.
    #[error("no message key for counter {counter}")]
    KeyNotFound { counter: u64 },

    /// No remote ratchet key is known yet, so nothing can be sent.
    #[error("no sending chain established")]
    NoSendingChain,

    /// The ratchet header is inconsistent.
    #[error("invalid ratchet header: {0}")]
    InvalidHeader(String),

    /// The session has been torn down.
    #[error("session closed")]
    SessionClosed,

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("session already exists: {0}")]
    SessionExists(String),

    /// Durable persistence of ratchet state failed; the operation did not
    /// take effect.
    #[error("persistence failure: {0}")]
    Persistence(String),

    #[error("key error: {0}")]
    Key(#[from] tessera_keys::KeyError),

    #[error("crypto error: {0}")]
    Crypto(#[from] tessera_crypto::CryptoError),
}

/// Convenience result type for ratchet operations.
pub type Result<T> = std::result::Result<T, RatchetError>;
