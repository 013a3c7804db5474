use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::fingerprint::Fingerprint;
use crate::origin::{HeaderList, OriginResponse, header_str};
use crate::store::{SharedStore, keys};

/// A stored upstream response. Never modified once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub status_code: u16,
    #[serde(default, with = "header_list")]
    pub headers: HeaderList,
    #[serde(with = "body_base64")]
    pub body: Bytes,
    pub stored_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn from_origin(response: &OriginResponse) -> Self {
        Self {
            status_code: response.status_code,
            headers: response.headers.clone(),
            body: response.body.clone(),
            stored_at: Utc::now(),
        }
    }

    /// First value of a header, if present and valid UTF-8.
    pub fn header(&self, name: &str) -> Option<&str> {
        header_str(&self.headers, name)
    }
}

mod body_base64 {
    use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64
            .decode(encoded.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

/// Header values are base64 on the wire so non-UTF-8 bytes survive.
mod header_list {
    use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(
        headers: &[(String, Vec<u8>)],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        headers
            .iter()
            .map(|(name, value)| (name.as_str(), BASE64.encode(value)))
            .collect::<Vec<_>>()
            .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<(String, Vec<u8>)>, D::Error> {
        Vec::<(String, String)>::deserialize(deserializer)?
            .into_iter()
            .map(|(name, value)| {
                BASE64
                    .decode(value.as_bytes())
                    .map(|value| (name, value))
                    .map_err(serde::de::Error::custom)
            })
            .collect()
    }
}

/// How a response was produced, reported in the `X-Cache` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    /// Served from the shared cache.
    Hit,
    /// This request led its coalescing group and called upstream.
    Miss,
    /// This request followed a leader and was served its result.
    Coalesced,
    /// Called upstream without caching or coordination.
    Bypass,
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStatus::Hit => "HIT",
            CacheStatus::Miss => "MISS",
            CacheStatus::Coalesced => "COALESCED",
            CacheStatus::Bypass => "BYPASS",
        }
    }
}

/// Response cache on top of the shared store.
///
/// Store failures never propagate: reads degrade to misses and writes are
/// dropped, both with a warning.
#[derive(Clone)]
pub struct ResponseCache {
    store: Arc<dyn SharedStore>,
}

impl ResponseCache {
    pub fn new(store: Arc<dyn SharedStore>) -> Self {
        Self { store }
    }

    pub async fn lookup(&self, fingerprint: &Fingerprint) -> Option<CacheEntry> {
        let key = keys::cache(fingerprint);

        let raw = match self.store.get(&key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                debug!(fingerprint = %fingerprint.short(), "Cache MISS");
                return None;
            }
            Err(e) => {
                warn!(fingerprint = %fingerprint, error = %e, "Cache read failed, treating as miss");
                return None;
            }
        };

        match serde_json::from_slice::<CacheEntry>(&raw) {
            Ok(entry) => {
                debug!(fingerprint = %fingerprint.short(), "Cache HIT");
                Some(entry)
            }
            Err(e) => {
                warn!(fingerprint = %fingerprint, error = %e, "Corrupt cache entry, treating as miss");
                None
            }
        }
    }

    /// Returns whether the entry was written.
    pub async fn store(&self, fingerprint: &Fingerprint, entry: &CacheEntry, ttl: Duration) -> bool {
        if ttl.is_zero() {
            return false;
        }

        let serialized = match serde_json::to_vec(entry) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(fingerprint = %fingerprint, error = %e, "Failed to serialize cache entry");
                return false;
            }
        };

        match self
            .store
            .set_with_expiry(&keys::cache(fingerprint), &serialized, ttl)
            .await
        {
            Ok(()) => {
                debug!(
                    fingerprint = %fingerprint.short(),
                    ttl_secs = ttl.as_secs(),
                    size = entry.body.len(),
                    "Cached entry"
                );
                true
            }
            Err(e) => {
                warn!(fingerprint = %fingerprint, error = %e, "Cache write failed");
                false
            }
        }
    }
}
