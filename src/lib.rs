//! membridge
//!
//! A protocol bridge that speaks the Memcached text protocol to clients and
//! fulfils every request against a Redis backend:
//! - **Wire codec**: Memcached text requests/responses over buffered TCP
//! - **Round-tripper**: per-request dispatch with full `flags`, CAS-token,
//!   expiration and numeric semantics
//! - **Per-key locking**: distributed advisory locks serialize
//!   read-modify-write commands across connections and bridge instances
//! - **Pluggable backends**: Redis (`ConnectionManager`) or in-process
//!   `DashMap` storage behind one trait
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use membridge::{Keyspace, RedisStore, server};
//! use tokio::net::TcpListener;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let backend = RedisStore::connect("redis://127.0.0.1:6379/0").await?;
//!     let listener = TcpListener::bind("0.0.0.0:11211").await?;
//!
//!     server::run(listener, backend, Keyspace::new(""), tokio::signal::ctrl_c()).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Storage shape
//!
//! ```text
//! client key K  →  one Redis hash at "<prefix>K"
//!                  fields: value (payload bytes)
//!                          flags (decimal text, preserved verbatim)
//!                          token (CAS token, fresh per successful store)
//! advisory lock →  "__LOCK.<prefix>K", SET NX PX with a bounded lease
//! ```

pub mod backends;
pub mod config;
pub mod keyspace;
pub mod lock;
pub mod round_tripper;
pub mod server;
pub mod traits;
pub mod wire;

pub use backends::{MemoryStore, RedisStore};
pub use config::Config;
pub use keyspace::Keyspace;
pub use lock::KeyLocks;
pub use round_tripper::{Reply, RoundTripper};
pub use traits::{Record, RecordBackend, StoreError};
pub use wire::{Command, Connection, Inbound, Request, Response, Value};

// Re-export async_trait for custom backend implementations
pub use async_trait::async_trait;
