//! Request pipeline
//!
//! fingerprint → pre-flight TTL → cache lookup → coalescing coordinator →
//! upstream → post-flight TTL → cache write, with every completed request
//! accounted for exactly once in the metrics aggregator.

use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::cache::{CacheEntry, CacheStatus, ResponseCache};
use crate::coalesce::{Coalescer, LeaderOutcome, LockMetadata};
use crate::error::ProxyResult;
use crate::fingerprint::{Fingerprint, fingerprint};
use crate::metrics::MetricsAggregator;
use crate::origin::{ProxyRequest, Upstream};
use crate::ttl::TtlPolicy;

/// A response ready to be relayed downstream.
#[derive(Debug, Clone)]
pub struct Served {
    pub entry: CacheEntry,
    pub cache_status: CacheStatus,
}

pub struct Proxy {
    upstream: Arc<dyn Upstream>,
    cache: ResponseCache,
    coalescer: Arc<Coalescer>,
    ttl: TtlPolicy,
    metrics: Arc<MetricsAggregator>,
    cache_enabled: bool,
}

impl Proxy {
    pub fn new(
        upstream: Arc<dyn Upstream>,
        cache: ResponseCache,
        coalescer: Arc<Coalescer>,
        ttl: TtlPolicy,
        metrics: Arc<MetricsAggregator>,
        cache_enabled: bool,
    ) -> Self {
        Self {
            upstream,
            cache,
            coalescer,
            ttl,
            metrics,
            cache_enabled,
        }
    }

    pub async fn serve(&self, request: ProxyRequest) -> ProxyResult<Served> {
        let started = Instant::now();
        let fingerprint = fingerprint(&request);

        let (cache_status, result) = self.dispatch(&request, &fingerprint).await;

        let success = matches!(&result, Ok(entry) if entry.status_code < 400);
        self.metrics.record(cache_status, success, started.elapsed());

        match &result {
            Ok(entry) if entry.status_code >= 400 => warn!(
                fingerprint = %fingerprint,
                method = %request.method,
                path = %request.path(),
                status = entry.status_code,
                "Upstream returned an error status"
            ),
            Ok(_) => debug!(
                fingerprint = %fingerprint.short(),
                path = %request.path(),
                cache_status = cache_status.as_str(),
                "Request served"
            ),
            Err(e) => error!(
                fingerprint = %fingerprint,
                method = %request.method,
                path = %request.path(),
                cache_status = cache_status.as_str(),
                error = %e,
                "Request failed"
            ),
        }

        result.map(|entry| Served {
            entry,
            cache_status,
        })
    }

    async fn dispatch(
        &self,
        request: &ProxyRequest,
        fingerprint: &Fingerprint,
    ) -> (CacheStatus, ProxyResult<CacheEntry>) {
        let cacheable = self.cache_enabled && self.ttl.ttl_secs(request, None) > 0;
        if !cacheable {
            let result = self
                .upstream
                .send(request)
                .await
                .map(|response| CacheEntry::from_origin(&response));
            return (CacheStatus::Bypass, result);
        }

        if let Some(entry) = self.cache.lookup(fingerprint).await {
            return (CacheStatus::Hit, Ok(entry));
        }

        let metadata = LockMetadata::new(request.method.as_str(), &request.path_and_query);
        self.coalescer
            .execute(fingerprint, metadata, || {
                self.fetch_and_store(request, fingerprint)
            })
            .await
    }

    /// The leader's upstream call.
    async fn fetch_and_store(
        &self,
        request: &ProxyRequest,
        fingerprint: &Fingerprint,
    ) -> ProxyResult<LeaderOutcome> {
        let response = self.upstream.send(request).await?;
        let entry = CacheEntry::from_origin(&response);

        let ttl = self.ttl.ttl(request, Some(&response));
        let cached = self.cache.store(fingerprint, &entry, ttl).await;

        Ok(LeaderOutcome { entry, cached })
    }
}
