//! # tessera-types
//!
//! Shared domain and wire types used across the Tessera workspace.
//!
//! Binary fields are serialized as lowercase hexadecimal strings, counters and
//! sequence numbers as unsigned 64-bit integers, and timestamps as milliseconds
//! since the Unix epoch.

pub mod keys;
pub mod ledger;
pub mod message;

/// A 32-byte BLAKE3 digest.
pub type Hash = [u8; 32];

/// Identifier of a ratchet session (conversation).
pub type SessionId = String;

/// Identifier of a managed key.
pub type KeyId = String;

/// The all-zero hash used as the genesis ledger entry's `previous_hash`.
pub const GENESIS_HASH: Hash = [0u8; 32];

/// Milliseconds per day.
pub const MILLIS_PER_DAY: u64 = 24 * 60 * 60 * 1000;

/// Errors converting records to and from their external representation.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// JSON encoding or decoding failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn unix_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
