//! Named exclusive locks.
//!
//! Lock names are the only serialization mechanism between concurrent handlers,
//! so they must be stable for a logical resource: an aggregate id, a cache set key
//! or an entity type (`"CACHE-{EntityType}"`).

pub mod in_memory;
pub mod provider;
#[cfg(feature = "redis")]
pub mod redis;

pub use in_memory::InMemoryLockProvider;
pub use provider::{LockError, LockHandle, LockProvider, try_using, wait_for_release};
#[cfg(feature = "redis")]
pub use redis::RedisLockProvider;
