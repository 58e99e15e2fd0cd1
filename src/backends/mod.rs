//! Backend implementations
//!
//! Two stores are provided behind the [`crate::RecordBackend`] trait:
//!
//! | Backend | Storage | Use case |
//! |---------|---------|----------|
//! | `RedisStore` | Redis hashes via `ConnectionManager` | production |
//! | `MemoryStore` | in-process `DashMap` | tests, single-process runs |

pub mod memory_store;
pub mod redis_store;

pub use memory_store::MemoryStore;
pub use redis_store::RedisStore;
