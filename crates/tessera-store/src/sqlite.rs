//! SQLite-backed [`KeyValueStore`].

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};

use crate::{migrations, KeyValueStore, Result, StoreError};

/// Database file name inside the data directory.
pub const DB_FILE_NAME: &str = "tessera.db";

/// A single SQLite connection guarded by a mutex.
///
/// Writes use `synchronous = FULL` so a returned `set` survives power loss.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create the database at `path`.
    ///
    /// Configures WAL mode and runs any pending migrations.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        configure(&conn)?;
        migrations::run(&conn)?;
        tracing::debug!(path = %path.display(), "opened store");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open `tessera.db` inside `data_dir`, creating the directory if needed.
    pub fn open_in_dir(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)
            .map_err(|e| StoreError::Unavailable(format!("{}: {e}", data_dir.display())))?;
        Self::open(&data_dir.join(DB_FILE_NAME))
    }

    /// Open an in-memory database (for testing).
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        configure(&conn)?;
        migrations::run(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Schema version recorded in the database.
    pub fn schema_version(&self) -> Result<u32> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(conn.pragma_query_value(None, "user_version", |row| row.get(0))?)
    }
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish_non_exhaustive()
    }
}

fn configure(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = FULL;",
    )?;
    Ok(())
}

impl KeyValueStore for SqliteStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        let value = conn
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        conn.execute(
            "INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, tessera_types::unix_millis() as i64],
        )?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        conn.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        Ok(())
    }

    fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        let mut stmt = conn.prepare(
            "SELECT key FROM kv WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key ASC",
        )?;
        let keys = stmt
            .query_map(params![prefix], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SCHEMA_VERSION;

    #[test]
    fn test_open_memory() {
        let store = SqliteStore::open_memory().expect("open in-memory db");
        assert_eq!(store.schema_version().expect("version"), SCHEMA_VERSION);
    }

    #[test]
    fn test_set_get_overwrite_delete() {
        let store = SqliteStore::open_memory().expect("open");
        assert_eq!(store.get("missing").expect("get"), None);

        store.set("keys/meta/k1", b"v1").expect("set");
        store.set("keys/meta/k1", b"v2").expect("overwrite");
        assert_eq!(store.get("keys/meta/k1").expect("get"), Some(b"v2".to_vec()));

        store.delete("keys/meta/k1").expect("delete");
        assert_eq!(store.get("keys/meta/k1").expect("get"), None);
    }

    #[test]
    fn test_list_keys_by_prefix() {
        let store = SqliteStore::open_memory().expect("open");
        store.set("ledger/entry/00000000000000000001", b"b").expect("set");
        store.set("ledger/entry/00000000000000000000", b"a").expect("set");
        store.set("ledger/meta", b"m").expect("set");
        store.set("keys/meta/k1", b"k").expect("set");

        let keys = store.list_keys("ledger/entry/").expect("list");
        assert_eq!(
            keys,
            vec![
                "ledger/entry/00000000000000000000".to_string(),
                "ledger/entry/00000000000000000001".to_string(),
            ]
        );
    }

    #[test]
    fn test_prefix_with_like_wildcards_is_literal() {
        let store = SqliteStore::open_memory().expect("open");
        store.set("a_b/1", b"").expect("set");
        store.set("axb/1", b"").expect("set");
        assert_eq!(store.list_keys("a_b/").expect("list"), vec!["a_b/1".to_string()]);
    }

    #[test]
    fn test_values_survive_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let store = SqliteStore::open_in_dir(dir.path()).expect("open");
            store.set("sessions/alice", &[1, 2, 3]).expect("set");
        }
        let store = SqliteStore::open_in_dir(dir.path()).expect("reopen");
        assert_eq!(store.get("sessions/alice").expect("get"), Some(vec![1, 2, 3]));
    }
}
