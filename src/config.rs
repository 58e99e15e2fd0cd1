//! Process configuration
//!
//! All knobs come from the environment, matching the deployment style of the
//! caches this bridge stands in for.

use anyhow::{Context, Result};

/// Runtime configuration read from the environment
///
/// | Variable | Default | Meaning |
/// |---|---|---|
/// | `PORT` | `11211` | TCP listen port |
/// | `REDIS_URL` | `redis://127.0.0.1:6379/0` | backend connection string |
/// | `REDIS_PREFIX` | empty | namespace prefix for every backend key |
#[derive(Debug, Clone)]
pub struct Config {
    /// TCP listen port
    pub port: u16,
    /// Redis connection string
    pub redis_url: String,
    /// Key namespace prefix
    pub redis_prefix: String,
}

impl Config {
    /// Load configuration from environment variables, applying defaults
    ///
    /// # Errors
    ///
    /// Returns an error if `PORT` is set but is not a valid TCP port number.
    pub fn from_env() -> Result<Self> {
        let port = match std::env::var("PORT") {
            Ok(raw) => raw
                .parse::<u16>()
                .with_context(|| format!("PORT must be a TCP port number, got {raw:?}"))?,
            Err(_) => 11211,
        };

        let redis_url = std::env::var("REDIS_URL")
            .unwrap_or_else(|_| "redis://127.0.0.1:6379/0".to_string());
        let redis_prefix = std::env::var("REDIS_PREFIX").unwrap_or_default();

        Ok(Self {
            port,
            redis_url,
            redis_prefix,
        })
    }
}
