//! Groupcast Storage
//!
//! Durable key → JSON persistence backed by SQLite

use anyhow::{anyhow, Result};
use rusqlite::OptionalExtension;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

pub mod keys {
    pub const SETTINGS: &str = "settings";
    pub const PROCESSED: &str = "processed";
    pub const FORWARD_QUEUE: &str = "forward_queue";
    pub const FORWARD_META: &str = "forward_meta";
    pub const BULK_STATE: &str = "bulk_state";
    pub const INTERACTIONS: &str = "interactions";
    pub const SKIPPED: &str = "skipped";
    pub const LAST_CHECKED: &str = "last_checked";
    pub const BRIDGE_OFFSET: &str = "bridge_offset";
}

/// Read/write contract the engine needs from persistence.
pub trait StateStore: Send + Sync {
    fn read_json(&self, key: &str) -> Result<Option<serde_json::Value>>;
    fn write_json(&self, key: &str, value: &serde_json::Value) -> Result<()>;
}

pub fn load<T: DeserializeOwned>(store: &dyn StateStore, key: &str) -> Result<Option<T>> {
    match store.read_json(key)? {
        Some(value) => {
            let parsed = serde_json::from_value(value)
                .map_err(|e| anyhow!("Corrupt value under key '{}': {}", key, e))?;
            Ok(Some(parsed))
        }
        None => Ok(None),
    }
}

pub fn save<T: Serialize>(store: &dyn StateStore, key: &str, value: &T) -> Result<()> {
    let value = serde_json::to_value(value)?;
    store.write_json(key, &value)
}

/// Append `entry` to the list stored under `key`, dropping the oldest entries beyond `max_len`.
pub fn append_limited<T: Serialize + DeserializeOwned>(
    store: &dyn StateStore,
    key: &str,
    entry: T,
    max_len: usize,
) -> Result<usize> {
    let mut current: Vec<T> = load(store, key)?.unwrap_or_default();
    current.push(entry);
    if current.len() > max_len {
        let excess = current.len() - max_len;
        current.drain(..excess);
    }
    save(store, key, &current)?;
    Ok(current.len())
}

pub struct SqliteStore {
    conn: Mutex<rusqlite::Connection>,
}

impl SqliteStore {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = rusqlite::Connection::open(db_path.as_ref())?;

        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
            );
            ",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, rusqlite::Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl StateStore for SqliteStore {
    fn read_json(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT value FROM kv WHERE key = ?1")?;
        let raw: Option<String> = stmt.query_row([key], |row| row.get(0)).optional()?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    fn write_json(&self, key: &str, value: &serde_json::Value) -> Result<()> {
        let raw = serde_json::to_string(value)?;
        self.conn().execute(
            "INSERT INTO kv (key, value) VALUES (?1, ?2)
             ON CONFLICT(key)
             DO UPDATE SET value = excluded.value, updated_at = CURRENT_TIMESTAMP",
            (key, raw),
        )?;
        Ok(())
    }
}

/// In-process store, used by tests and dry runs.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, serde_json::Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStore {
    fn read_json(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Ok(entries.get(key).cloned())
    }

    fn write_json(&self, key: &str, value: &serde_json::Value) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(key.to_string(), value.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{append_limited, keys, load, save, MemoryStore, SqliteStore, StateStore};
    use rusqlite::Connection;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_db_path(name: &str) -> std::path::PathBuf {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        std::env::temp_dir().join(format!("groupcast-storage-{}-{}.db", name, ts))
    }

    #[test]
    fn sqlite_store_overwrites_existing_key() {
        let path = temp_db_path("overwrite");
        let store = SqliteStore::new(&path).expect("storage init");

        save(&store, keys::BULK_STATE, &vec!["a", "b"]).expect("first write");
        save(&store, keys::BULK_STATE, &vec!["c"]).expect("second write");

        let value: Vec<String> = load(&store, keys::BULK_STATE)
            .expect("read")
            .expect("present");
        assert_eq!(value, vec!["c".to_string()]);

        let conn = Connection::open(&path).expect("open");
        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM kv", [], |row| row.get(0))
            .expect("count");
        assert_eq!(rows, 1);
    }

    #[test]
    fn sqlite_store_survives_reopen() {
        let path = temp_db_path("reopen");
        {
            let store = SqliteStore::new(&path).expect("storage init");
            save(&store, keys::FORWARD_QUEUE, &vec![1, 2, 3]).expect("write");
        }
        let store = SqliteStore::new(&path).expect("reopen");
        let value: Vec<u32> = load(&store, keys::FORWARD_QUEUE)
            .expect("read")
            .expect("present");
        assert_eq!(value, vec![1, 2, 3]);
    }

    #[test]
    fn missing_key_reads_as_none() {
        let store = MemoryStore::new();
        let value: Option<Vec<String>> = load(&store, keys::PROCESSED).expect("read");
        assert!(value.is_none());
    }

    #[test]
    fn corrupt_value_reports_key() {
        let path = temp_db_path("corrupt");
        let store = SqliteStore::new(&path).expect("storage init");
        store
            .write_json(keys::SETTINGS, &serde_json::json!("not-a-list"))
            .expect("write");

        let err = load::<Vec<u32>>(&store, keys::SETTINGS).expect_err("type mismatch");
        assert!(err.to_string().contains("settings"), "unexpected error: {}", err);
    }

    #[test]
    fn append_limited_drops_oldest_entries() {
        let store = MemoryStore::new();
        for i in 0..5 {
            append_limited(&store, keys::SKIPPED, i, 3).expect("append");
        }
        let value: Vec<u32> = load(&store, keys::SKIPPED).expect("read").expect("present");
        assert_eq!(value, vec![2, 3, 4]);
    }
}
