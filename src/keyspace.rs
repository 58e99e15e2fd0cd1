//! Backend key mapping
//!
//! Client keys are projected onto the backend namespace by a configured
//! prefix; advisory lock names live in a `__LOCK.` namespace beside them so
//! they can never collide with record keys.

/// Maps client keys to backend record keys and lock names
#[derive(Debug, Clone)]
pub struct Keyspace {
    prefix: String,
}

impl Keyspace {
    /// Create a keyspace with the given prefix (may be empty)
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Backend key holding the record for a client key
    #[must_use]
    pub fn record_key(&self, key: &str) -> String {
        format!("{}{key}", self.prefix)
    }

    /// Name of the advisory lock guarding a client key
    #[must_use]
    pub fn lock_key(&self, key: &str) -> String {
        format!("__LOCK.{}{key}", self.prefix)
    }
}
