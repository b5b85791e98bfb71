//! Generic durable map consumed by the analysis core.
//!
//! The core only ever needs per-key get/put, a namespace scan, and a
//! monotonic sequence allocator; no transactions beyond per-key atomicity.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("store lock poisoned")]
    Poisoned,
    #[error("value decode failed for {ns}/{key}: {detail}")]
    Decode {
        ns: String,
        key: String,
        detail: String,
    },
}

/// Narrow durable-map interface. Implementations must be safe to share
/// across the worker pool.
pub trait KvStore: Send + Sync {
    fn get(&self, ns: &str, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    fn put(&self, ns: &str, key: &str, value: &[u8]) -> Result<(), StoreError>;

    /// All entries of one namespace. Order is key-ascending so callers can
    /// rely on stable iteration in tests.
    fn scan(&self, ns: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError>;

    /// Deletes one entry if present.
    fn remove(&self, ns: &str, key: &str) -> Result<(), StoreError>;

    /// Next value of a named monotonically increasing counter, starting at 1.
    fn next_seq(&self, counter: &str) -> Result<i64, StoreError>;
}

/// SQLite-backed store. A single connection behind a mutex is enough here:
/// every access is a short point read/write.
#[derive(Clone)]
pub struct SqliteKv {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteKv {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Self::from_conn(Connection::open(path)?)
    }

    /// In-memory database, used by tests and ephemeral runs.
    pub fn memory() -> Result<Self, StoreError> {
        Self::from_conn(Connection::open_in_memory()?)
    }

    fn from_conn(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv (
                 ns    TEXT NOT NULL,
                 key   TEXT NOT NULL,
                 value BLOB NOT NULL,
                 PRIMARY KEY (ns, key)
             );
             CREATE TABLE IF NOT EXISTS seq (
                 name  TEXT PRIMARY KEY,
                 value INTEGER NOT NULL
             );",
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }
}

impl KvStore for SqliteKv {
    fn get(&self, ns: &str, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached("SELECT value FROM kv WHERE ns = ?1 AND key = ?2")?;
        let mut rows = stmt.query(params![ns, key])?;
        match rows.next()? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }

    fn put(&self, ns: &str, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.prepare_cached(
            "INSERT INTO kv (ns, key, value) VALUES (?1, ?2, ?3)
             ON CONFLICT (ns, key) DO UPDATE SET value = excluded.value",
        )?
        .execute(params![ns, key, value])?;
        Ok(())
    }

    fn scan(&self, ns: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare_cached("SELECT key, value FROM kv WHERE ns = ?1 ORDER BY key ASC")?;
        let rows = stmt
            .query_map(params![ns], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn remove(&self, ns: &str, key: &str) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.prepare_cached("DELETE FROM kv WHERE ns = ?1 AND key = ?2")?
            .execute(params![ns, key])?;
        Ok(())
    }

    fn next_seq(&self, counter: &str) -> Result<i64, StoreError> {
        let conn = self.lock()?;
        let value = conn
            .prepare_cached(
                "INSERT INTO seq (name, value) VALUES (?1, 1)
                 ON CONFLICT (name) DO UPDATE SET value = value + 1
                 RETURNING value",
            )?
            .query_row(params![counter], |row| row.get(0))?;
        Ok(value)
    }
}

/// In-memory store with the same semantics as `SqliteKv`.
#[derive(Default)]
pub struct MemKv {
    maps: Mutex<HashMap<String, BTreeMap<String, Vec<u8>>>>,
    seqs: Mutex<HashMap<String, i64>>,
}

impl MemKv {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemKv {
    fn get(&self, ns: &str, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let maps = self.maps.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(maps.get(ns).and_then(|m| m.get(key)).cloned())
    }

    fn put(&self, ns: &str, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let mut maps = self.maps.lock().map_err(|_| StoreError::Poisoned)?;
        maps.entry(ns.to_string())
            .or_default()
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn scan(&self, ns: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        let maps = self.maps.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(maps
            .get(ns)
            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    fn remove(&self, ns: &str, key: &str) -> Result<(), StoreError> {
        let mut maps = self.maps.lock().map_err(|_| StoreError::Poisoned)?;
        if let Some(m) = maps.get_mut(ns) {
            m.remove(key);
        }
        Ok(())
    }

    fn next_seq(&self, counter: &str) -> Result<i64, StoreError> {
        let mut seqs = self.seqs.lock().map_err(|_| StoreError::Poisoned)?;
        let v = seqs.entry(counter.to_string()).or_insert(0);
        *v += 1;
        Ok(*v)
    }
}
