//! Backend Traits
//!
//! This module defines the capability surface the round-tripper needs from a
//! key-value backend, plus the record shape stored under every backend key.
//!
//! # Architecture
//!
//! - `Record`: the three attributes stored per client key (payload, flags,
//!   CAS token)
//! - `RecordBackend`: async trait implemented by `RedisStore` and
//!   `MemoryStore`; implement it to plug in another store
//! - `StoreError`: what a backend operation can fail with; a missing key is
//!   *not* an error, it surfaces as `Ok(None)` / `Ok(false)`
//!
//! # Thread Safety
//!
//! Implementations must be `Send + Sync`; one handle is cloned into every
//! connection task.

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// Hash field holding the payload bytes
pub const FIELD_VALUE: &str = "value";
/// Hash field holding the flags text
pub const FIELD_FLAGS: &str = "flags";
/// Hash field holding the CAS token
pub const FIELD_TOKEN: &str = "token";

/// Errors surfaced by a backend or the lock service
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The backend failed (connectivity, timeout, protocol error)
    #[error("backend error: {0}")]
    Backend(String),

    /// The per-key lock could not be acquired before the wait ceiling
    #[error("lock wait ceiling reached for {0}")]
    LockTimeout(String),
}

/// The stored attributes of one client key
///
/// `flags` is carried as its decimal text form and never interpreted.
/// `token` is the decimal text of a random positive 63-bit integer; it is
/// regenerated on every successful store, so two stores of the same payload
/// still produce distinct tokens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Payload bytes
    pub data: Vec<u8>,
    /// Flags, preserved byte-for-byte between store and retrieve
    pub flags: String,
    /// CAS token
    pub token: String,
}

impl Record {
    /// Rebuild a record from the raw hash fields returned by the backend
    ///
    /// Returns `None` when the hash is empty or has no payload field.
    /// A missing `flags` field reads as `"0"`; a missing `token` field reads
    /// as empty (which can never match a client-supplied token).
    #[must_use]
    pub fn from_fields(mut fields: HashMap<String, Vec<u8>>) -> Option<Self> {
        let data = fields.remove(FIELD_VALUE)?;
        let flags = fields
            .remove(FIELD_FLAGS)
            .map_or_else(|| "0".to_string(), |raw| String::from_utf8_lossy(&raw).into_owned());
        let token = fields
            .remove(FIELD_TOKEN)
            .map(|raw| String::from_utf8_lossy(&raw).into_owned())
            .unwrap_or_default();
        Some(Self { data, flags, token })
    }
}

/// Capability surface over a key-value backend
///
/// Keys passed here are already mapped to the backend namespace (see
/// [`crate::Keyspace`]). Record keys and lock keys share one trait because
/// the advisory lock is stored in the same backend as the records it guards.
#[async_trait]
pub trait RecordBackend: Send + Sync {
    /// Read the full record under a key
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Backend` if the backend call fails. A missing
    /// key is `Ok(None)`.
    async fn fetch(&self, key: &str) -> Result<Option<Record>, StoreError>;

    /// Write all three record attributes and apply the expiration policy
    ///
    /// `exptime` is in seconds; `0` removes any TTL the key carried. The
    /// write and the TTL change are applied atomically, so no reader ever
    /// observes a half-written record.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Backend` if the backend call fails.
    async fn store(&self, key: &str, record: &Record, exptime: u64) -> Result<(), StoreError>;

    /// Replace only the payload and token, leaving flags and TTL untouched
    ///
    /// Used by read-modify-write commands (`append`, `prepend`, `incr`,
    /// `decr`), which always run under the per-key lock.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Backend` if the backend call fails.
    async fn rewrite(&self, key: &str, data: &[u8], token: &str) -> Result<(), StoreError>;

    /// Delete keys, returning how many were actually present
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Backend` if the backend call fails.
    async fn remove(&self, keys: &[String]) -> Result<usize, StoreError>;

    /// Whether a key currently exists
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Backend` if the backend call fails.
    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    /// Set a TTL of `exptime` seconds; `false` means the key was missing
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Backend` if the backend call fails.
    async fn expire(&self, key: &str, exptime: u64) -> Result<bool, StoreError>;

    /// Remove any TTL from a key
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Backend` if the backend call fails.
    async fn persist(&self, key: &str) -> Result<(), StoreError>;

    /// Create a key with a millisecond lease only if it does not exist
    ///
    /// This is the acquisition primitive of the advisory lock: `true` means
    /// the key was created and the caller holds it until it releases the key
    /// or the lease lapses.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Backend` if the backend call fails.
    async fn set_if_absent(
        &self,
        key: &str,
        value: &[u8],
        lease: Duration,
    ) -> Result<bool, StoreError>;

    /// Backend name, for logging
    fn name(&self) -> &'static str {
        "unknown"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, &[u8])]) -> HashMap<String, Vec<u8>> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.to_vec()))
            .collect()
    }

    #[test]
    fn full_record_round_trips() {
        let record = Record::from_fields(fields(&[
            (FIELD_VALUE, b"payload"),
            (FIELD_FLAGS, b"42"),
            (FIELD_TOKEN, b"123456789"),
        ]));
        assert_eq!(
            record,
            Some(Record {
                data: b"payload".to_vec(),
                flags: "42".to_string(),
                token: "123456789".to_string(),
            })
        );
    }

    #[test]
    fn missing_flags_defaults_to_zero() {
        let record =
            Record::from_fields(fields(&[(FIELD_VALUE, b"payload")])).expect("record present");
        assert_eq!(record.flags, "0");
        assert_eq!(record.token, "");
    }

    #[test]
    fn empty_hash_is_no_record() {
        assert_eq!(Record::from_fields(HashMap::new()), None);
    }
}
