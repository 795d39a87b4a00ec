//! Cache-aside layer over a shared cache store.
//!
//! - [`CacheStore`]: the raw capability (values, member sets, expiry, prefix removal)
//! - [`CacheAdapter`]: cache-aside reads with crowd-collapsing on miss

pub mod adapter;
pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis;
pub mod store;

pub use adapter::{CacheAdapter, CacheError, EMPTY_SET_MARKER};
pub use in_memory::InMemoryCacheStore;
#[cfg(feature = "redis")]
pub use redis::RedisCacheStore;
pub use store::{CacheStore, CacheStoreError};
