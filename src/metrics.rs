use chrono::Utc;
use prometheus::{CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::cache::CacheStatus;
use crate::coalesce::LockMetadata;
use crate::error::{ProxyError, ProxyResult};
use crate::store::{SharedStore, keys};

/// Process-lifetime request counters. Never decrease.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Counters {
    pub total_requests: u64,
    pub backend_calls: u64,
    pub cache_hits: u64,
    pub deduplicated_requests: u64,
    pub successful_responses: u64,
    pub error_responses: u64,
}

#[derive(Debug, Default)]
struct Tally {
    counters: Counters,
    cumulative_response_time: Duration,
    completed: u64,
}

/// A coalescing group currently holding a lock in the shared store.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InFlightQueue {
    pub fingerprint: String,
    pub url: String,
    pub method: String,
    pub status: &'static str,
    pub active_request_count: u64,
    pub requests: Vec<InFlightRequest>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InFlightRequest {
    pub id: String,
    pub status: &'static str,
}

/// The realtime feed payload.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    #[serde(flatten)]
    pub counters: Counters,
    pub cache_hit_ratio: f64,
    pub error_rate: f64,
    /// Milliseconds
    pub avg_response_time: f64,
    pub in_flight_count: usize,
    pub in_flight_queues: Vec<InFlightQueue>,
    /// Seconds
    pub uptime: u64,
    pub timestamp: String,
}

/// Single point of truth for request accounting. One instance per process,
/// shared by `Arc`.
pub struct MetricsAggregator {
    tally: Mutex<Tally>,
    started_at: Instant,
    store: Arc<dyn SharedStore>,
    changed: Notify,
    registry: Registry,
    requests_total: CounterVec,
    request_duration: HistogramVec,
}

impl MetricsAggregator {
    pub fn new(store: Arc<dyn SharedStore>) -> ProxyResult<Self> {
        let registry = Registry::new();

        let requests_total = CounterVec::new(
            Opts::new("herdguard_requests_total", "Total number of proxied requests"),
            &["cache_status", "outcome"],
        )
        .map_err(prometheus_error)?;

        let request_duration = HistogramVec::new(
            HistogramOpts::new(
                "herdguard_request_duration_seconds",
                "Request duration in seconds",
            )
            .buckets(vec![
                0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
            ]),
            &["cache_status"],
        )
        .map_err(prometheus_error)?;

        registry
            .register(Box::new(requests_total.clone()))
            .map_err(prometheus_error)?;
        registry
            .register(Box::new(request_duration.clone()))
            .map_err(prometheus_error)?;

        Ok(Self {
            tally: Mutex::new(Tally::default()),
            started_at: Instant::now(),
            store,
            changed: Notify::new(),
            registry,
            requests_total,
            request_duration,
        })
    }

    /// Account for one completed request.
    pub fn record(&self, cache_status: CacheStatus, success: bool, elapsed: Duration) {
        {
            let mut tally = self.tally.lock().unwrap_or_else(|e| e.into_inner());
            let counters = &mut tally.counters;
            counters.total_requests += 1;
            match cache_status {
                CacheStatus::Hit => counters.cache_hits += 1,
                CacheStatus::Coalesced => counters.deduplicated_requests += 1,
                CacheStatus::Miss | CacheStatus::Bypass => counters.backend_calls += 1,
            }
            if success {
                counters.successful_responses += 1;
            } else {
                counters.error_responses += 1;
            }
            tally.cumulative_response_time += elapsed;
            tally.completed += 1;
        }

        let outcome = if success { "success" } else { "error" };
        self.requests_total
            .with_label_values(&[cache_status.as_str(), outcome])
            .inc();
        self.request_duration
            .with_label_values(&[cache_status.as_str()])
            .observe(elapsed.as_secs_f64());

        self.changed.notify_one();
    }

    pub fn counters(&self) -> Counters {
        self.tally.lock().unwrap_or_else(|e| e.into_inner()).counters
    }

    /// Resolves after at least one request completed since the last call.
    pub async fn changed(&self) {
        self.changed.notified().await
    }

    pub async fn snapshot(&self) -> MetricsSnapshot {
        let (counters, avg_response_time) = {
            let tally = self.tally.lock().unwrap_or_else(|e| e.into_inner());
            let avg = if tally.completed == 0 {
                0.0
            } else {
                tally.cumulative_response_time.as_secs_f64() * 1000.0 / tally.completed as f64
            };
            (tally.counters, avg)
        };

        let in_flight_queues = self.in_flight_queues().await;

        MetricsSnapshot {
            counters,
            cache_hit_ratio: ratio(counters.cache_hits, counters.total_requests),
            error_rate: ratio(counters.error_responses, counters.total_requests),
            avg_response_time,
            in_flight_count: in_flight_queues.len(),
            in_flight_queues,
            uptime: self.started_at.elapsed().as_secs(),
            timestamp: Utc::now().to_rfc3339(),
        }
    }

    async fn in_flight_queues(&self) -> Vec<InFlightQueue> {
        let lock_keys = match self.store.scan_prefix(keys::LOCK_PREFIX).await {
            Ok(keys) => keys,
            Err(e) => {
                warn!(error = %e, "Failed to list coalescing locks");
                return Vec::new();
            }
        };

        let mut queues = Vec::with_capacity(lock_keys.len());
        for lock_key in lock_keys {
            let Some(fingerprint) = keys::fingerprint_of_lock(&lock_key) else {
                continue;
            };

            // Released between scan and read.
            let metadata = match self.store.get(&lock_key).await {
                Ok(Some(raw)) => serde_json::from_slice::<LockMetadata>(&raw).ok(),
                Ok(None) => continue,
                Err(e) => {
                    debug!(lock = %lock_key, error = %e, "Failed to read lock metadata");
                    None
                }
            };

            let active = match self.store.get(&keys::followers(&fingerprint)).await {
                Ok(Some(raw)) => std::str::from_utf8(&raw)
                    .ok()
                    .and_then(|s| s.parse::<u64>().ok())
                    .unwrap_or(1),
                _ => 1,
            };

            let (url, method) = metadata
                .map(|m| (m.url, m.method))
                .unwrap_or_else(|| (String::new(), String::new()));

            queues.push(InFlightQueue {
                requests: (0..active)
                    .map(|i| InFlightRequest {
                        id: format!("{}-{}", fingerprint.short(), i),
                        status: "In-Flight",
                    })
                    .collect(),
                fingerprint: fingerprint.to_string(),
                url,
                method,
                status: "Active",
                active_request_count: active,
            });
        }

        queues
    }

    /// Prometheus text exposition.
    pub fn gather(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            warn!(error = %e, "Failed to encode Prometheus metrics");
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

fn ratio(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64
    }
}

fn prometheus_error(err: prometheus::Error) -> ProxyError {
    ProxyError::Internal(format!("metrics registry: {}", err))
}
