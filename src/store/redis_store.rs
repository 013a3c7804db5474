//! Redis implementation of the shared store
//!
//! Locks use `SET key value NX PX ttl`, counters use `INCR`, and key
//! enumeration uses cursor-based `SCAN` so large keyspaces are walked
//! incrementally.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use std::time::Duration;
use tracing::info;

use super::SharedStore;
use crate::error::{StoreError, StoreResult};

const SCAN_BATCH: usize = 500;

/// Optional namespace shared by every key this store touches.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct KeyNamespace(Option<String>);

impl KeyNamespace {
    fn new(prefix: Option<String>) -> Self {
        Self(prefix.filter(|p| !p.is_empty()))
    }

    fn key(&self, key: &str) -> String {
        match &self.0 {
            Some(prefix) => format!("{}:{}", prefix, key),
            None => key.to_string(),
        }
    }

    /// Inverse of `key`. Keys outside the namespace come back unchanged.
    fn strip(&self, key: String) -> String {
        match &self.0 {
            Some(prefix) => key
                .strip_prefix(prefix.as_str())
                .and_then(|rest| rest.strip_prefix(':'))
                .map(str::to_string)
                .unwrap_or(key),
            None => key,
        }
    }

    /// `SCAN MATCH` pattern for every key starting with `prefix`.
    fn scan_pattern(&self, prefix: &str) -> String {
        let mut pattern = escape_glob(&self.key(prefix));
        pattern.push('*');
        pattern
    }
}

fn escape_glob(literal: &str) -> String {
    let mut escaped = String::with_capacity(literal.len());
    for c in literal.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
    namespace: KeyNamespace,
}

impl RedisStore {
    pub async fn connect(url: &str, key_prefix: Option<String>) -> StoreResult<Self> {
        let client =
            redis::Client::open(url).map_err(|e| StoreError::Connection(e.to_string()))?;
        let connection = client
            .get_connection_manager()
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        info!(url = %url, prefix = ?key_prefix, "Connected to Redis store");

        Ok(Self {
            connection,
            namespace: KeyNamespace::new(key_prefix),
        })
    }

    fn prefixed_key(&self, key: &str) -> String {
        self.namespace.key(key)
    }
}

fn millis(ttl: Duration) -> u64 {
    // PX 0 is rejected by Redis
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let mut conn = self.connection.clone();
        let value: Option<Vec<u8>> = redis::cmd("GET")
            .arg(self.prefixed_key(key))
            .query_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn set_with_expiry(&self, key: &str, value: &[u8], ttl: Duration) -> StoreResult<()> {
        let mut conn = self.connection.clone();
        let _: () = redis::cmd("SET")
            .arg(self.prefixed_key(key))
            .arg(value)
            .arg("PX")
            .arg(millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn delete(&self, keys: &[&str]) -> StoreResult<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.connection.clone();
        let prefixed: Vec<String> = keys.iter().map(|k| self.prefixed_key(k)).collect();
        let count: u64 = redis::cmd("DEL")
            .arg(&prefixed)
            .query_async(&mut conn)
            .await?;
        Ok(count)
    }

    async fn increment(&self, key: &str) -> StoreResult<i64> {
        let mut conn = self.connection.clone();
        let value: i64 = redis::cmd("INCR")
            .arg(self.prefixed_key(key))
            .query_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        let mut conn = self.connection.clone();
        let updated: i64 = redis::cmd("PEXPIRE")
            .arg(self.prefixed_key(key))
            .arg(millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(updated == 1)
    }

    async fn set_if_absent_with_expiry(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> StoreResult<bool> {
        let mut conn = self.connection.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(self.prefixed_key(key))
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn scan_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.connection.clone();
        let pattern = self.namespace.scan_pattern(prefix);

        let mut found = Vec::new();
        let mut cursor = 0u64;
        loop {
            let (next_cursor, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await?;

            found.extend(keys.into_iter().map(|k| self.namespace.strip(k)));

            cursor = next_cursor;
            if cursor == 0 {
                break;
            }
        }

        Ok(found)
    }
}
