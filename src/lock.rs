//! Per-key advisory locking
//!
//! Commands whose semantics span several backend operations (`add`,
//! `replace`, `cas`, `append`, `prepend`, `incr`, `decr`, and plain `set`
//! so it serializes with them) run inside a critical section guarded by a
//! distributed advisory lock. The lock is a plain backend key created with
//! SET NX PX, so every bridge instance sharing the backend observes the
//! same mutual exclusion.
//!
//! The lease is bounded: a process that dies while holding a lock frees it
//! automatically once the lease lapses. The flip side is best-effort
//! exclusion - a critical section that outlives its lease keeps running
//! without the lock, and the unconditional release can then drop a lock a
//! later holder acquired. Critical sections here are a handful of backend
//! round-trips and complete well inside the lease in practice.

use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::traits::{RecordBackend, StoreError};

/// How long an acquired lock is held at most before the backend expires it
pub const LOCK_LEASE: Duration = Duration::from_secs(1);

/// Pause between acquisition attempts
const RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Give up acquiring after this long and surface a server error
const ACQUIRE_CEILING: Duration = Duration::from_secs(3);

/// Lock service over a shared backend
#[derive(Clone)]
pub struct KeyLocks<B> {
    backend: B,
}

impl<B: RecordBackend> KeyLocks<B> {
    /// Create a lock service on top of a backend handle
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    /// Block until the named lock is granted, or fail at the ceiling
    ///
    /// Retries linearly every 100 ms. The returned guard must be released
    /// with [`KeyGuard::release`] on every exit path of the critical
    /// section; an unreleased guard only frees when its lease lapses.
    ///
    /// # Errors
    ///
    /// `StoreError::LockTimeout` when the ceiling is reached,
    /// `StoreError::Backend` when the acquisition write itself fails.
    pub async fn acquire(&self, lock_key: &str) -> Result<KeyGuard<'_, B>, StoreError> {
        let holder = format!("{:016x}", rand::random::<u64>());
        let started = Instant::now();
        loop {
            if self
                .backend
                .set_if_absent(lock_key, holder.as_bytes(), LOCK_LEASE)
                .await?
            {
                return Ok(KeyGuard {
                    locks: self,
                    key: lock_key.to_string(),
                });
            }
            if started.elapsed() >= ACQUIRE_CEILING {
                return Err(StoreError::LockTimeout(lock_key.to_string()));
            }
            debug!(lock = %lock_key, "lock busy, retrying");
            sleep(RETRY_INTERVAL).await;
        }
    }
}

/// A held per-key lock
#[must_use = "an unreleased lock blocks the key until its lease lapses"]
pub struct KeyGuard<'a, B: RecordBackend> {
    locks: &'a KeyLocks<B>,
    key: String,
}

impl<B: RecordBackend> KeyGuard<'_, B> {
    /// Release the lock
    ///
    /// A failed release is logged and swallowed: the lease bounds the
    /// damage, and the critical section's own result must not be clobbered
    /// by cleanup.
    pub async fn release(self) {
        if let Err(err) = self.locks.backend.remove(&[self.key.clone()]).await {
            warn!(lock = %self.key, cause = %err, "failed to release lock, lease will lapse");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryStore;
    use std::sync::Arc;

    #[tokio::test]
    async fn lock_is_mutually_exclusive() {
        let backend = MemoryStore::new();
        let locks = Arc::new(KeyLocks::new(backend.clone()));

        let guard = locks.acquire("__LOCK.k").await.unwrap();

        let contender = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                let guard = locks.acquire("__LOCK.k").await.unwrap();
                guard.release().await;
            })
        };

        // The contender keeps retrying while the lock is held.
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!contender.is_finished());

        guard.release().await;
        contender.await.unwrap();
    }

    #[tokio::test]
    async fn released_lock_is_immediately_reacquirable() {
        let locks = KeyLocks::new(MemoryStore::new());
        locks.acquire("__LOCK.k").await.unwrap().release().await;
        locks.acquire("__LOCK.k").await.unwrap().release().await;
    }

    #[tokio::test]
    async fn distinct_keys_do_not_contend() {
        let locks = KeyLocks::new(MemoryStore::new());
        let a = locks.acquire("__LOCK.a").await.unwrap();
        let b = locks.acquire("__LOCK.b").await.unwrap();
        a.release().await;
        b.release().await;
    }
}
