//! # tessera-store
//!
//! Persistence collaborators for the Tessera workspace.
//!
//! Components never touch a database directly: they read and write opaque
//! byte values through the [`KeyValueStore`] trait. Two implementations ship
//! here:
//!
//! - [`MemoryStore`]: a mutex-guarded ordered map, used by tests and
//!   ephemeral hosts.
//! - [`SqliteStore`]: a single SQLite database at
//!   `$TESSERA_DATA_DIR/tessera.db` (WAL mode, schema version in
//!   `PRAGMA user_version`).
//!
//! ## Modules
//!
//! - [`cbor`]: CBOR encode/decode helpers for stored records
//! - [`device`]: device-identity collaborator
//! - [`memory`]: in-memory store
//! - [`migrations`]: schema migrations
//! - [`schema`]: SQL schema definitions
//! - [`sqlite`]: SQLite-backed store

pub mod cbor;
pub mod device;
pub mod memory;
pub mod migrations;
pub mod schema;
pub mod sqlite;

pub use device::{DeviceIdentity, StaticDeviceIdentity};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Current schema version.
pub const SCHEMA_VERSION: u32 = 1;

/// Store error types.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("migration failed: {0}")]
    Migration(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("store lock poisoned")]
    Poisoned,

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Durable key-value persistence.
///
/// Keys are `/`-separated strings; values are opaque bytes. A successful
/// `set` must be durable before it returns.
pub trait KeyValueStore: Send + Sync {
    /// Read the value stored under `key`.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Insert or replace the value stored under `key`.
    fn set(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Remove `key`. Removing an absent key is not an error.
    fn delete(&self, key: &str) -> Result<()>;

    /// List every key starting with `prefix`, in ascending order.
    fn list_keys(&self, prefix: &str) -> Result<Vec<String>>;
}

impl<S: KeyValueStore + ?Sized> KeyValueStore for std::sync::Arc<S> {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        (**self).set(key, value)
    }

    fn delete(&self, key: &str) -> Result<()> {
        (**self).delete(key)
    }

    fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        (**self).list_keys(prefix)
    }
}

/// Read and decode a JSON record.
pub fn get_json<T: serde::de::DeserializeOwned>(
    store: &dyn KeyValueStore,
    key: &str,
) -> Result<Option<T>> {
    match store.get(key)? {
        Some(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| StoreError::Deserialization(format!("{key}: {e}"))),
        None => Ok(None),
    }
}

/// Encode and write a JSON record.
pub fn set_json<T: serde::Serialize>(store: &dyn KeyValueStore, key: &str, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec(value)
        .map_err(|e| StoreError::Serialization(format!("{key}: {e}")))?;
    store.set(key, &bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[derive(Debug, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Record {
        name: String,
        version: u32,
    }

    #[test]
    fn test_json_helpers() {
        let store = MemoryStore::new();
        let record = Record {
            name: "k1".into(),
            version: 3,
        };
        set_json(&store, "keys/meta/k1", &record).expect("set");
        let back: Option<Record> = get_json(&store, "keys/meta/k1").expect("get");
        assert_eq!(back, Some(record));

        let missing: Option<Record> = get_json(&store, "keys/meta/k2").expect("get");
        assert!(missing.is_none());
    }

    #[test]
    fn test_json_helpers_reject_garbage() {
        let store = MemoryStore::new();
        store.set("keys/meta/bad", b"\xff\x00").expect("set");
        let result: Result<Option<Record>> = get_json(&store, "keys/meta/bad");
        assert!(matches!(result, Err(StoreError::Deserialization(_))));
    }

    #[test]
    fn test_arc_store_delegates() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let shared = Arc::clone(&store);
        shared.set("a", b"1").expect("set");
        assert_eq!(store.get("a").expect("get"), Some(b"1".to_vec()));
    }
}
