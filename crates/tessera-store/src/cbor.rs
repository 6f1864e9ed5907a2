//! CBOR serialization helpers for stored records.
//!
//! Binary-heavy records (ratchet state, seal payloads) are stored as CBOR
//! (RFC 8949) rather than JSON.

use serde::{de::DeserializeOwned, Serialize};

use crate::StoreError;

/// Serialize a value to CBOR bytes.
///
/// # Errors
///
/// Returns [`StoreError::Serialization`] if the value cannot be serialized.
pub fn to_vec<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf)
        .map_err(|e| StoreError::Serialization(format!("CBOR serialization failed: {e}")))?;
    Ok(buf)
}

/// Deserialize a value from CBOR bytes.
///
/// # Errors
///
/// Returns [`StoreError::Deserialization`] if the bytes cannot be decoded
/// into the target type.
pub fn from_slice<T: DeserializeOwned>(data: &[u8]) -> Result<T, StoreError> {
    ciborium::from_reader(data)
        .map_err(|e| StoreError::Deserialization(format!("CBOR deserialization failed: {e}")))
}
