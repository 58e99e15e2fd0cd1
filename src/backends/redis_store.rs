//! Redis Store - Distributed Record Backend
//!
//! Stores each record as one Redis hash, with `ConnectionManager` for
//! automatic reconnection.

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

use crate::traits::{FIELD_FLAGS, FIELD_TOKEN, FIELD_VALUE, Record, RecordBackend, StoreError};

/// Redis record store
///
/// One record is one hash: `value` / `flags` / `token` fields live under a
/// single backend key, so a reader always observes a complete record. TTL is
/// applied in the same MULTI/EXEC pipeline as the hash write.
#[derive(Clone)]
pub struct RedisStore {
    /// Redis connection manager - handles reconnection automatically
    conn_manager: ConnectionManager,
}

impl RedisStore {
    /// Connect to Redis and verify the connection with a PING
    ///
    /// # Errors
    ///
    /// Returns an error if the Redis client cannot be created or the
    /// connection (including the PING probe) fails.
    pub async fn connect(redis_url: &str) -> Result<Self> {
        info!(redis_url = %redis_url, "Initializing Redis record store");

        let client = Client::open(redis_url)
            .with_context(|| format!("Failed to create Redis client with URL: {redis_url}"))?;

        let conn_manager = ConnectionManager::new(client)
            .await
            .context("Failed to establish Redis connection manager")?;

        // Test connection
        let mut conn = conn_manager.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .context("Redis PING health check failed")?;

        info!(redis_url = %redis_url, "Redis record store connected (ConnectionManager enabled)");

        Ok(Self { conn_manager })
    }
}

fn backend_err(err: redis::RedisError) -> StoreError {
    StoreError::Backend(err.to_string())
}

#[async_trait]
impl RecordBackend for RedisStore {
    async fn fetch(&self, key: &str) -> Result<Option<Record>, StoreError> {
        let mut conn = self.conn_manager.clone();
        let fields: HashMap<String, Vec<u8>> =
            conn.hgetall(key).await.map_err(backend_err)?;
        Ok(Record::from_fields(fields))
    }

    async fn store(&self, key: &str, record: &Record, exptime: u64) -> Result<(), StoreError> {
        let mut conn = self.conn_manager.clone();

        // HSET and the TTL change ride one transaction; HSET alone would
        // leave a stale TTL behind when exptime is 0.
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("HSET")
            .arg(key)
            .arg(FIELD_VALUE)
            .arg(record.data.as_slice())
            .arg(FIELD_FLAGS)
            .arg(record.flags.as_bytes())
            .arg(FIELD_TOKEN)
            .arg(record.token.as_bytes())
            .ignore();
        if exptime > 0 {
            pipe.cmd("EXPIRE").arg(key).arg(exptime).ignore();
        } else {
            pipe.cmd("PERSIST").arg(key).ignore();
        }
        let () = pipe.query_async(&mut conn).await.map_err(backend_err)?;

        debug!(key = %key, exptime = exptime, "[Redis] Stored record");
        Ok(())
    }

    async fn rewrite(&self, key: &str, data: &[u8], token: &str) -> Result<(), StoreError> {
        let mut conn = self.conn_manager.clone();

        // Touching only value + token keeps flags and the hash TTL intact.
        let () = redis::cmd("HSET")
            .arg(key)
            .arg(FIELD_VALUE)
            .arg(data)
            .arg(FIELD_TOKEN)
            .arg(token.as_bytes())
            .query_async(&mut conn)
            .await
            .map_err(backend_err)?;
        Ok(())
    }

    async fn remove(&self, keys: &[String]) -> Result<usize, StoreError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn_manager.clone();
        let removed: usize = conn.del(keys).await.map_err(backend_err)?;
        debug!(count = removed, "[Redis] Removed keys");
        Ok(removed)
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn_manager.clone();
        conn.exists(key).await.map_err(backend_err)
    }

    async fn expire(&self, key: &str, exptime: u64) -> Result<bool, StoreError> {
        let mut conn = self.conn_manager.clone();
        let seconds = i64::try_from(exptime).unwrap_or(i64::MAX);
        conn.expire(key, seconds).await.map_err(backend_err)
    }

    async fn persist(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.conn_manager.clone();
        let _: bool = redis::cmd("PERSIST")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(backend_err)?;
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &[u8],
        lease: Duration,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn_manager.clone();
        let lease_ms = u64::try_from(lease.as_millis()).unwrap_or(u64::MAX);

        // SET key value NX PX lease - only set the key if it does not
        // already exist, with an automatic expiry as the lock lease.
        let granted: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(lease_ms)
            .query_async(&mut conn)
            .await
            .map_err(backend_err)?;
        Ok(granted.is_some())
    }

    fn name(&self) -> &'static str {
        "Redis"
    }
}
