//! In-process implementation of the shared store
//!
//! Backs single-instance deployments and tests. Expiry uses
//! `tokio::time::Instant`, so a paused test clock drives it.

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

use super::SharedStore;
use crate::error::{StoreError, StoreResult};

#[derive(Debug, Clone)]
struct StoredValue {
    data: Vec<u8>,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| now < at)
    }
}

/// Cloning gives a new handle to the same underlying map.
#[derive(Clone)]
pub struct MemoryStore {
    entries: Arc<DashMap<String, StoredValue>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let shard_count = (num_cpus::get() * 4).next_power_of_two();
        info!(shards = shard_count, "Initialized in-memory store");

        Self {
            entries: Arc::new(DashMap::with_shard_amount(shard_count)),
        }
    }

    /// Remove expired keys; returns how many were dropped.
    pub fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, value| value.is_live(now));
        let removed = before.saturating_sub(self.entries.len());

        if removed > 0 {
            debug!(count = removed, "Cleaned up expired store keys");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let now = Instant::now();
        Ok(self
            .entries
            .get(key)
            .filter(|value| value.is_live(now))
            .map(|value| value.data.clone()))
    }

    async fn set_with_expiry(&self, key: &str, value: &[u8], ttl: Duration) -> StoreResult<()> {
        self.entries.insert(
            key.to_string(),
            StoredValue {
                data: value.to_vec(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn delete(&self, keys: &[&str]) -> StoreResult<u64> {
        let now = Instant::now();
        let mut count = 0;
        for key in keys {
            if let Some((_, value)) = self.entries.remove(*key) {
                if value.is_live(now) {
                    count += 1;
                }
            }
        }
        Ok(count)
    }

    async fn increment(&self, key: &str) -> StoreResult<i64> {
        let now = Instant::now();
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| StoredValue {
                data: b"0".to_vec(),
                expires_at: None,
            });

        if !entry.is_live(now) {
            *entry = StoredValue {
                data: b"0".to_vec(),
                expires_at: None,
            };
        }

        let current: i64 = std::str::from_utf8(&entry.data)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| {
                StoreError::Backend(format!("value at {} is not an integer", key))
            })?;
        let next = current + 1;
        entry.data = next.to_string().into_bytes();
        Ok(next)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        let now = Instant::now();
        match self.entries.get_mut(key) {
            Some(mut value) if value.is_live(now) => {
                value.expires_at = Some(now + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn set_if_absent_with_expiry(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> StoreResult<bool> {
        let now = Instant::now();
        let fresh = StoredValue {
            data: value.to_vec(),
            expires_at: Some(now + ttl),
        };

        // The entry guard holds the shard lock, which makes check-and-set atomic.
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_live(now) {
                    Ok(false)
                } else {
                    occupied.insert(fresh);
                    Ok(true)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(fresh);
                Ok(true)
            }
        }
    }

    async fn scan_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let now = Instant::now();
        Ok(self
            .entries
            .iter()
            .filter(|entry| entry.key().starts_with(prefix) && entry.value().is_live(now))
            .map(|entry| entry.key().clone())
            .collect())
    }
}
