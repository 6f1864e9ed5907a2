//! In-memory [`KeyValueStore`].

use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::{KeyValueStore, Result, StoreError};

/// Ordered map behind a mutex. Contents are lost on drop.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.entries.lock().map(|m| m.len()).unwrap_or(0)
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let entries = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        let mut entries = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        entries.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        entries.remove(key);
        Ok(())
    }

    fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let entries = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_delete() {
        let store = MemoryStore::new();
        assert!(store.is_empty());
        store.set("a/1", b"one").expect("set");
        assert_eq!(store.get("a/1").expect("get"), Some(b"one".to_vec()));

        store.set("a/1", b"uno").expect("overwrite");
        assert_eq!(store.get("a/1").expect("get"), Some(b"uno".to_vec()));

        store.delete("a/1").expect("delete");
        assert_eq!(store.get("a/1").expect("get"), None);
        store.delete("a/1").expect("deleting absent key is fine");
    }

    #[test]
    fn test_list_keys_prefix_ordered() {
        let store = MemoryStore::new();
        for key in ["ledger/entry/2", "ledger/entry/0", "keys/meta/x", "ledger/entry/1"] {
            store.set(key, b"").expect("set");
        }
        let keys = store.list_keys("ledger/entry/").expect("list");
        assert_eq!(keys, vec!["ledger/entry/0", "ledger/entry/1", "ledger/entry/2"]);
        assert_eq!(store.list_keys("").expect("list all").len(), 4);
        assert!(store.list_keys("nothing/").expect("list").is_empty());
    }
}
