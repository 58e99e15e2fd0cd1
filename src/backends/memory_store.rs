//! Memory Store - `DashMap` Record Backend
//!
//! A lightweight in-process backend using `DashMap` for concurrent access.
//! Expiry is tracked per entry and enforced lazily on read.
//!
//! **Use case**: tests and single-process runs, where a shared Redis brings
//! nothing. The advisory lock still works against it, so the full command
//! set behaves exactly as with Redis - minus cross-process visibility.

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::traits::{Record, RecordBackend, StoreError};

/// Stored entry with expiration tracking
#[derive(Debug, Clone)]
struct StoredRecord {
    record: Record,
    expires_at: Option<Instant>,
}

impl StoredRecord {
    fn new(record: Record, exptime: u64) -> Self {
        let expires_at = (exptime > 0).then(|| Instant::now() + Duration::from_secs(exptime));
        Self { record, expires_at }
    }

    fn is_expired(&self) -> bool {
        self.expires_at
            .is_some_and(|expires_at| Instant::now() > expires_at)
    }
}

/// In-process record store over a concurrent `HashMap`
///
/// Clones share the underlying map, mirroring how `RedisStore` clones share
/// one server.
#[derive(Clone, Default)]
pub struct MemoryStore {
    map: Arc<DashMap<String, StoredRecord>>,
}

impl MemoryStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordBackend for MemoryStore {
    async fn fetch(&self, key: &str) -> Result<Option<Record>, StoreError> {
        if let Some(entry) = self.map.get(key) {
            if !entry.is_expired() {
                return Ok(Some(entry.record.clone()));
            }
        }
        self.map.remove_if(key, |_, entry| entry.is_expired());
        Ok(None)
    }

    async fn store(&self, key: &str, record: &Record, exptime: u64) -> Result<(), StoreError> {
        self.map
            .insert(key.to_string(), StoredRecord::new(record.clone(), exptime));
        Ok(())
    }

    async fn rewrite(&self, key: &str, data: &[u8], token: &str) -> Result<(), StoreError> {
        if let Some(mut entry) = self.map.get_mut(key) {
            if !entry.is_expired() {
                entry.record.data = data.to_vec();
                entry.record.token = token.to_string();
                return Ok(());
            }
        }
        // Same as a Redis HSET on a free key: the hash appears with only
        // the written fields, and flags read back as "0".
        self.map.insert(
            key.to_string(),
            StoredRecord::new(
                Record {
                    data: data.to_vec(),
                    flags: "0".to_string(),
                    token: token.to_string(),
                },
                0,
            ),
        );
        Ok(())
    }

    async fn remove(&self, keys: &[String]) -> Result<usize, StoreError> {
        let mut removed = 0;
        for key in keys {
            if let Some((_, entry)) = self.map.remove(key) {
                if !entry.is_expired() {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.fetch(key).await?.is_some())
    }

    async fn expire(&self, key: &str, exptime: u64) -> Result<bool, StoreError> {
        if let Some(mut entry) = self.map.get_mut(key) {
            if !entry.is_expired() {
                entry.expires_at = Some(Instant::now() + Duration::from_secs(exptime));
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn persist(&self, key: &str) -> Result<(), StoreError> {
        if let Some(mut entry) = self.map.get_mut(key) {
            if !entry.is_expired() {
                entry.expires_at = None;
            }
        }
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &[u8],
        lease: Duration,
    ) -> Result<bool, StoreError> {
        let holder = StoredRecord {
            record: Record {
                data: value.to_vec(),
                flags: "0".to_string(),
                token: String::new(),
            },
            expires_at: Some(Instant::now() + lease),
        };
        match self.map.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired() {
                    occupied.insert(holder);
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(holder);
                Ok(true)
            }
        }
    }

    fn name(&self) -> &'static str {
        "Memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(data: &[u8]) -> Record {
        Record {
            data: data.to_vec(),
            flags: "7".to_string(),
            token: "1".to_string(),
        }
    }

    #[tokio::test]
    async fn store_and_fetch() {
        let store = MemoryStore::new();
        store.store("k", &record(b"v"), 0).await.unwrap();
        let fetched = store.fetch("k").await.unwrap().unwrap();
        assert_eq!(fetched.data, b"v");
        assert_eq!(fetched.flags, "7");
    }

    #[tokio::test]
    async fn rewrite_keeps_flags() {
        let store = MemoryStore::new();
        store.store("k", &record(b"v"), 0).await.unwrap();
        store.rewrite("k", b"vw", "2").await.unwrap();
        let fetched = store.fetch("k").await.unwrap().unwrap();
        assert_eq!(fetched.data, b"vw");
        assert_eq!(fetched.flags, "7");
        assert_eq!(fetched.token, "2");
    }

    #[tokio::test]
    async fn remove_counts_present_keys() {
        let store = MemoryStore::new();
        store.store("a", &record(b"v"), 0).await.unwrap();
        let keys = vec!["a".to_string(), "missing".to_string()];
        assert_eq!(store.remove(&keys).await.unwrap(), 1);
        assert_eq!(store.remove(&keys).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn set_if_absent_is_exclusive() {
        let store = MemoryStore::new();
        let lease = Duration::from_secs(1);
        assert!(store.set_if_absent("lock", b"a", lease).await.unwrap());
        assert!(!store.set_if_absent("lock", b"b", lease).await.unwrap());
        store.remove(&["lock".to_string()]).await.unwrap();
        assert!(store.set_if_absent("lock", b"c", lease).await.unwrap());
    }

    #[tokio::test]
    async fn expired_entries_read_as_missing() {
        let store = MemoryStore::new();
        store.store("k", &record(b"v"), 0).await.unwrap();
        // A zero-length lease expires immediately.
        assert!(store.expire("k", 0).await.unwrap());
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(store.fetch("k").await.unwrap(), None);
        assert!(!store.exists("k").await.unwrap());
    }
}
