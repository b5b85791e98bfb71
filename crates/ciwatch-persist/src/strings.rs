//! Append-only string interning over the durable store.
//!
//! Every history and graph structure in the core keys on small integers
//! instead of strings. Ids are allocated once and never reused; the table
//! is warm-cached in both directions and written through to the store so
//! ids stay stable across restarts.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::debug;

use crate::kv::{KvStore, StoreError};

const NS_STR_TO_ID: &str = "strings.fwd";
const NS_ID_TO_STR: &str = "strings.rev";
const SEQ_NAME: &str = "strings";

#[derive(Clone)]
pub struct StringTable {
    store: Arc<dyn KvStore>,
    inner: Arc<RwLock<Maps>>,
}

#[derive(Default)]
struct Maps {
    str_to_id: HashMap<String, i32>,
    id_to_str: HashMap<i32, String>,
}

impl StringTable {
    /// Loads all previously interned strings into the in-memory maps.
    pub fn open(store: Arc<dyn KvStore>) -> Result<Self, StoreError> {
        let mut maps = Maps::default();
        for (key, value) in store.scan(NS_STR_TO_ID)? {
            let id = decode_id(NS_STR_TO_ID, &key, &value)?;
            maps.id_to_str.insert(id, key.clone());
            maps.str_to_id.insert(key, id);
        }
        Ok(Self {
            store,
            inner: Arc::new(RwLock::new(maps)),
        })
    }

    /// Id for `val`, interning it on first sight.
    pub fn id_of(&self, val: &str) -> Result<i32, StoreError> {
        if let Some(id) = self.lookup(val) {
            return Ok(id);
        }

        // Double-checked under the write lock: another thread may have
        // interned the same string between the read above and here.
        let mut maps = self.inner.write().map_err(|_| StoreError::Poisoned)?;
        if let Some(&id) = maps.str_to_id.get(val) {
            return Ok(id);
        }

        let id = self.store.next_seq(SEQ_NAME)? as i32;
        self.store.put(NS_STR_TO_ID, val, &id.to_be_bytes())?;
        self.store
            .put(NS_ID_TO_STR, &id.to_string(), val.as_bytes())?;
        maps.str_to_id.insert(val.to_string(), id);
        maps.id_to_str.insert(id, val.to_string());
        debug!(id, val, "interned string");
        Ok(id)
    }

    /// Id for `val` without interning; `None` for strings never seen.
    pub fn lookup(&self, val: &str) -> Option<i32> {
        self.inner
            .read()
            .ok()
            .and_then(|maps| maps.str_to_id.get(val).copied())
    }

    pub fn string_of(&self, id: i32) -> Option<String> {
        self.inner
            .read()
            .ok()
            .and_then(|maps| maps.id_to_str.get(&id).cloned())
    }
}

fn decode_id(ns: &str, key: &str, value: &[u8]) -> Result<i32, StoreError> {
    let bytes: [u8; 4] = value.try_into().map_err(|_| StoreError::Decode {
        ns: ns.to_string(),
        key: key.to_string(),
        detail: format!("expected 4 bytes, got {}", value.len()),
    })?;
    Ok(i32::from_be_bytes(bytes))
}
