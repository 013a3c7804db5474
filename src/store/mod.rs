//! Shared key-value store
//!
//! Every piece of state that more than one proxy instance touches lives
//! here: cached responses, coalescing locks and follower counters. All
//! cross-instance mutation goes through the atomic primitives of
//! [`SharedStore`]; nothing reads a lock and then writes it back.

mod memory;
mod redis_store;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

use async_trait::async_trait;
use std::time::Duration;

use crate::error::StoreResult;
use crate::fingerprint::Fingerprint;

#[async_trait]
pub trait SharedStore: Send + Sync + 'static {
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>>;

    async fn set_with_expiry(&self, key: &str, value: &[u8], ttl: Duration) -> StoreResult<()>;

    /// Returns the number of keys that existed.
    async fn delete(&self, keys: &[&str]) -> StoreResult<u64>;

    /// Atomically increment an integer counter, creating it at 0 first.
    async fn increment(&self, key: &str) -> StoreResult<i64>;

    /// Returns `false` if the key does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool>;

    /// Atomically create `key` only if it is absent (or expired).
    async fn set_if_absent_with_expiry(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> StoreResult<bool>;

    /// Live keys starting with `prefix`. O(n) in the keyspace; meant for
    /// observability, not the request path.
    async fn scan_prefix(&self, prefix: &str) -> StoreResult<Vec<String>>;
}

/// Key layout shared by every instance pointing at the same store.
pub mod keys {
    use super::Fingerprint;

    pub const CACHE_PREFIX: &str = "cache:";
    pub const LOCK_PREFIX: &str = "lock:";
    pub const FOLLOWERS_PREFIX: &str = "followers:";

    pub fn cache(fingerprint: &Fingerprint) -> String {
        format!("{}{}", CACHE_PREFIX, fingerprint)
    }

    pub fn lock(fingerprint: &Fingerprint) -> String {
        format!("{}{}", LOCK_PREFIX, fingerprint)
    }

    pub fn followers(fingerprint: &Fingerprint) -> String {
        format!("{}{}", FOLLOWERS_PREFIX, fingerprint)
    }

    /// Recover the fingerprint from a lock key returned by a scan.
    pub fn fingerprint_of_lock(key: &str) -> Option<Fingerprint> {
        key.strip_prefix(LOCK_PREFIX)
            .and_then(Fingerprint::from_hex)
    }
}
