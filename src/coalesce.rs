//! Request coalescing module
//!
//! Prevents the "thundering herd" problem by electing exactly one leader per
//! fingerprint to call upstream while every concurrent requester for the same
//! fingerprint waits for the leader's result to appear in the shared cache.
//!
//! Election is a lease-bounded lock in the shared store, created with an
//! atomic set-if-absent, so it holds across proxy instances. A leader that
//! crashes simply lets its lease run out. Followers poll the cache a bounded
//! number of times and never call upstream themselves.
//!
//! In front of the store sits a process-local waiter table: requests arriving
//! in the same process while a local request already owns the fingerprint
//! subscribe to it instead of making a store round trip. They are woken with
//! the cached entry as soon as it is written and otherwise fall back to the
//! same polling loop, so the outcome is the same as with the store alone.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cache::{CacheEntry, CacheStatus, ResponseCache};
use crate::config::CoalesceConfig;
use crate::error::{ProxyError, ProxyResult};
use crate::fingerprint::Fingerprint;
use crate::store::{SharedStore, keys};

/// Value stored under a coalescing lock, describing its owner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockMetadata {
    pub url: String,
    pub method: String,
    /// Unix milliseconds at acquisition.
    pub started_at: i64,
}

impl LockMetadata {
    pub fn new(method: &str, url: &str) -> Self {
        Self {
            url: url.to_string(),
            method: method.to_string(),
            started_at: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// What the leader produced upstream.
#[derive(Debug, Clone)]
pub struct LeaderOutcome {
    pub entry: CacheEntry,
    /// Whether the entry was written to the shared cache.
    pub cached: bool,
}

// ---------------------------------------------------------------------------
// Process-local waiter table
// ---------------------------------------------------------------------------

type Wakeup = Option<CacheEntry>;

/// Internal state for the local waiter table
struct LocalInner {
    /// Fingerprints owned by a request in this process
    in_flight: DashMap<String, broadcast::Sender<Wakeup>>,
    /// Waiters allowed per fingerprint before requests overflow to the store
    max_waiters: usize,
}

/// Coalesces requests of a single process before the shared store is asked.
#[derive(Clone)]
pub struct LocalWaiters {
    inner: Arc<LocalInner>,
}

/// Result of trying to own a fingerprint locally
pub enum LocalAcquire {
    /// No local request owns the fingerprint; this request does now
    Own(LocalGuard),
    /// Another local request owns it; wait to be woken
    Wait(broadcast::Receiver<Wakeup>),
    /// The owner already has `max_waiters` waiters; coordinate through the store
    Full,
}

impl LocalWaiters {
    pub fn new(max_waiters: usize) -> Self {
        Self {
            inner: Arc::new(LocalInner {
                in_flight: DashMap::new(),
                max_waiters: max_waiters.max(1),
            }),
        }
    }

    pub fn try_acquire(&self, fingerprint: &Fingerprint) -> LocalAcquire {
        match self.inner.in_flight.entry(fingerprint.as_str().to_string()) {
            Entry::Occupied(occupied) => {
                let sender = occupied.get();
                if sender.receiver_count() >= self.inner.max_waiters {
                    debug!(fingerprint = %fingerprint.short(), "Local waiter table full");
                    return LocalAcquire::Full;
                }
                debug!(fingerprint = %fingerprint.short(), "Joining local in-flight request");
                LocalAcquire::Wait(sender.subscribe())
            }
            Entry::Vacant(vacant) => {
                // A single wakeup is ever sent
                let (tx, _) = broadcast::channel(1);
                vacant.insert(tx);
                LocalAcquire::Own(LocalGuard {
                    key: fingerprint.as_str().to_string(),
                    inner: Arc::clone(&self.inner),
                    completed: false,
                })
            }
        }
    }

    pub fn stats(&self) -> LocalStats {
        let in_flight_requests = self.inner.in_flight.len();
        let total_waiters: usize = self
            .inner
            .in_flight
            .iter()
            .map(|entry| entry.value().receiver_count())
            .sum();

        LocalStats {
            in_flight_requests,
            total_waiters,
        }
    }
}

/// Ensures local waiters are woken when the owning request finishes
pub struct LocalGuard {
    key: String,
    inner: Arc<LocalInner>,
    completed: bool,
}

impl LocalGuard {
    /// Wake all local waiters, handing them the entry if one was cached.
    pub fn complete(mut self, cached: Option<CacheEntry>) {
        self.wake(cached);
        self.completed = true;
    }

    fn wake(&self, cached: Option<CacheEntry>) {
        if let Some((_, sender)) = self.inner.in_flight.remove(&self.key) {
            let waiters = sender.receiver_count();
            if waiters > 0 {
                info!(
                    fingerprint = %self.key,
                    waiters = waiters,
                    "Waking coalesced local waiters"
                );
            }
            let _ = sender.send(cached);
        }
    }
}

impl Drop for LocalGuard {
    fn drop(&mut self) {
        // Cancelled owner: waiters fall back to polling the cache.
        if !self.completed {
            self.wake(None);
        }
    }
}

/// Statistics about the local waiter table
#[derive(Debug, Clone, serde::Serialize)]
pub struct LocalStats {
    pub in_flight_requests: usize,
    pub total_waiters: usize,
}

// ---------------------------------------------------------------------------
// Distributed lock
// ---------------------------------------------------------------------------

enum LockAttempt {
    Acquired(LockLease),
    Held,
    /// The store could not be reached; proceed without coordination.
    Unavailable,
}

/// A held coalescing lock. Released explicitly by the leader; if the leader
/// is dropped mid-flight the release is spawned, and failing that the lease
/// expires on its own.
struct LockLease {
    store: Arc<dyn SharedStore>,
    lock_key: String,
    followers_key: String,
    released: bool,
}

impl LockLease {
    async fn release(mut self) {
        self.released = true;
        delete_lock(&self.store, &self.lock_key, &self.followers_key).await;
    }
}

impl Drop for LockLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let store = Arc::clone(&self.store);
            let lock_key = std::mem::take(&mut self.lock_key);
            let followers_key = std::mem::take(&mut self.followers_key);
            handle.spawn(async move {
                delete_lock(&store, &lock_key, &followers_key).await;
            });
        }
    }
}

async fn delete_lock(store: &Arc<dyn SharedStore>, lock_key: &str, followers_key: &str) {
    if let Err(e) = store.delete(&[lock_key, followers_key]).await {
        // The lease bounds how long this lock can linger.
        warn!(lock = %lock_key, error = %e, "Failed to release coalescing lock");
    }
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

/// Arbitrates one upstream call per fingerprint.
pub struct Coalescer {
    store: Arc<dyn SharedStore>,
    cache: ResponseCache,
    local: LocalWaiters,
    config: CoalesceConfig,
}

impl Coalescer {
    pub fn new(store: Arc<dyn SharedStore>, cache: ResponseCache, config: CoalesceConfig) -> Self {
        Self {
            store,
            cache,
            local: LocalWaiters::new(config.max_waiters),
            config,
        }
    }

    pub fn local_stats(&self) -> LocalStats {
        self.local.stats()
    }

    pub fn config(&self) -> &CoalesceConfig {
        &self.config
    }

    /// Run `fetch` at most once across all concurrent callers for
    /// `fingerprint`, returning how this caller was served.
    ///
    /// The caller is expected to have already missed the cache.
    pub async fn execute<F, Fut>(
        &self,
        fingerprint: &Fingerprint,
        metadata: LockMetadata,
        fetch: F,
    ) -> (CacheStatus, ProxyResult<CacheEntry>)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ProxyResult<LeaderOutcome>>,
    {
        if !self.config.enabled {
            let result = self.fetch_with_lease_timeout(fingerprint, fetch).await;
            return (CacheStatus::Bypass, result.map(|outcome| outcome.entry));
        }

        let local_guard = if self.config.local_waiters {
            match self.local.try_acquire(fingerprint) {
                LocalAcquire::Own(guard) => Some(guard),
                LocalAcquire::Wait(receiver) => {
                    let result = self.follow_local(fingerprint, receiver).await;
                    return (CacheStatus::Coalesced, result);
                }
                LocalAcquire::Full => None,
            }
        } else {
            None
        };

        let lease = match self.try_lock(fingerprint, &metadata).await {
            LockAttempt::Acquired(lease) => Some(lease),
            LockAttempt::Held => {
                debug!(fingerprint = %fingerprint.short(), "Lock held elsewhere, following");
                self.join_group(fingerprint).await;
                let result = self
                    .poll_cache(fingerprint, self.config.max_poll_attempts)
                    .await;
                if let Some(guard) = local_guard {
                    guard.complete(result.as_ref().ok().cloned());
                }
                return (CacheStatus::Coalesced, result);
            }
            LockAttempt::Unavailable => None,
        };

        if lease.is_some() {
            // Another leader may have finished between our miss and our lock.
            if let Some(entry) = self.cache.lookup(fingerprint).await {
                if let Some(lease) = lease {
                    lease.release().await;
                }
                if let Some(guard) = local_guard {
                    guard.complete(Some(entry.clone()));
                }
                return (CacheStatus::Hit, Ok(entry));
            }
        }

        let coordinated = lease.is_some();
        let result = self.fetch_with_lease_timeout(fingerprint, fetch).await;

        if let Some(lease) = lease {
            lease.release().await;
        }

        if let Some(guard) = local_guard {
            // Without a working store local waiters could never find the
            // entry, so an uncoordinated leader hands it over directly.
            let wakeup = match &result {
                Ok(outcome) if outcome.cached || !coordinated => Some(outcome.entry.clone()),
                _ => None,
            };
            guard.complete(wakeup);
        }

        let status = if coordinated {
            CacheStatus::Miss
        } else {
            CacheStatus::Bypass
        };
        (status, result.map(|outcome| outcome.entry))
    }

    async fn fetch_with_lease_timeout<F, Fut>(
        &self,
        fingerprint: &Fingerprint,
        fetch: F,
    ) -> ProxyResult<LeaderOutcome>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ProxyResult<LeaderOutcome>>,
    {
        match tokio::time::timeout(self.config.lease(), fetch()).await {
            Ok(result) => result,
            Err(_) => {
                warn!(fingerprint = %fingerprint, lease_secs = self.config.lease_secs, "Upstream call exceeded lease");
                Err(ProxyError::BackendTimeout(format!(
                    "upstream did not answer within {}s",
                    self.config.lease_secs
                )))
            }
        }
    }

    async fn try_lock(&self, fingerprint: &Fingerprint, metadata: &LockMetadata) -> LockAttempt {
        let lock_key = keys::lock(fingerprint);
        let followers_key = keys::followers(fingerprint);

        let value = match serde_json::to_vec(metadata) {
            Ok(value) => value,
            Err(e) => {
                warn!(fingerprint = %fingerprint, error = %e, "Failed to encode lock metadata");
                return LockAttempt::Unavailable;
            }
        };

        match self
            .store
            .set_if_absent_with_expiry(&lock_key, &value, self.config.lease())
            .await
        {
            Ok(true) => {
                debug!(fingerprint = %fingerprint.short(), url = %metadata.url, "Acquired coalescing lock");
                let lease = LockLease {
                    store: Arc::clone(&self.store),
                    lock_key,
                    followers_key,
                    released: false,
                };
                // The leader counts itself as the first member of the group.
                self.join_group(fingerprint).await;
                LockAttempt::Acquired(lease)
            }
            Ok(false) => LockAttempt::Held,
            Err(e) => {
                warn!(
                    fingerprint = %fingerprint,
                    url = %metadata.url,
                    error = %e,
                    "Lock store unavailable, bypassing coalescing"
                );
                LockAttempt::Unavailable
            }
        }
    }

    /// Bump the group's member counter. Observability only, so failures are
    /// ignored.
    async fn join_group(&self, fingerprint: &Fingerprint) {
        let key = keys::followers(fingerprint);
        if let Err(e) = self.store.increment(&key).await {
            debug!(fingerprint = %fingerprint.short(), error = %e, "Failed to bump follower counter");
            return;
        }
        // Without an expiry a counter recreated after release would linger.
        if let Err(e) = self.store.expire(&key, self.config.lease()).await {
            debug!(fingerprint = %fingerprint.short(), error = %e, "Failed to refresh follower counter expiry");
        }
    }

    async fn follow_local(
        &self,
        fingerprint: &Fingerprint,
        mut receiver: broadcast::Receiver<Wakeup>,
    ) -> ProxyResult<CacheEntry> {
        let deadline = Instant::now() + self.config.follower_budget();
        self.join_group(fingerprint).await;

        match tokio::time::timeout_at(deadline, receiver.recv()).await {
            Ok(Ok(Some(entry))) => Ok(entry),
            Ok(_) => {
                // Woken without an entry: keep polling for what's left of the budget.
                let remaining = deadline.saturating_duration_since(Instant::now());
                let attempts = attempts_within(remaining, self.config.poll_interval());
                self.poll_cache(fingerprint, attempts).await
            }
            Err(_) => Err(self.timeout_error(fingerprint)),
        }
    }

    /// Wait for the leader's result to appear in the cache.
    async fn poll_cache(&self, fingerprint: &Fingerprint, attempts: u32) -> ProxyResult<CacheEntry> {
        let interval = self.config.poll_interval();

        for attempt in 1..=attempts {
            tokio::time::sleep(interval).await;
            if let Some(entry) = self.cache.lookup(fingerprint).await {
                debug!(fingerprint = %fingerprint.short(), attempt = attempt, "Follower served from cache");
                return Ok(entry);
            }
        }

        Err(self.timeout_error(fingerprint))
    }

    fn timeout_error(&self, fingerprint: &Fingerprint) -> ProxyError {
        warn!(
            fingerprint = %fingerprint,
            budget_ms = self.config.follower_budget().as_millis() as u64,
            "Follower gave up waiting for leader"
        );
        ProxyError::CoalescingTimeout(format!(
            "no response for {} within {}ms",
            fingerprint.short(),
            self.config.follower_budget().as_millis()
        ))
    }
}

fn attempts_within(remaining: Duration, interval: Duration) -> u32 {
    if interval.is_zero() {
        return 0;
    }
    (remaining.as_millis() / interval.as_millis().max(1)) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::fingerprint;
    use crate::origin::ProxyRequest;
    use crate::store::MemoryStore;
    use axum::http::Method;
    use bytes::Bytes;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn entry(body: &'static str) -> CacheEntry {
        CacheEntry {
            status_code: 200,
            headers: Vec::new(),
            body: Bytes::from_static(body.as_bytes()),
            stored_at: Utc::now(),
        }
    }

    fn config() -> CoalesceConfig {
        CoalesceConfig {
            lease_secs: 5,
            poll_interval_ms: 100,
            max_poll_attempts: 10,
            ..Default::default()
        }
    }

    fn setup(config: CoalesceConfig) -> (Arc<MemoryStore>, ResponseCache, Arc<Coalescer>) {
        let store = Arc::new(MemoryStore::new());
        let cache = ResponseCache::new(store.clone());
        let coalescer = Arc::new(Coalescer::new(store.clone(), cache.clone(), config));
        (store, cache, coalescer)
    }

    async fn never_fetch() -> ProxyResult<LeaderOutcome> {
        panic!("this caller must not call upstream")
    }

    fn fp(path: &str) -> Fingerprint {
        fingerprint(&ProxyRequest::new(Method::GET, path))
    }

    #[test]
    fn test_local_single_owner() {
        let local = LocalWaiters::new(16);
        let key = fp("/api/v1/health");

        let guard = match local.try_acquire(&key) {
            LocalAcquire::Own(guard) => guard,
            _ => panic!("Should have owned the fingerprint"),
        };
        assert!(matches!(local.try_acquire(&key), LocalAcquire::Wait(_)));
        assert_eq!(local.stats().in_flight_requests, 1);

        guard.complete(None);
        assert_eq!(local.stats().in_flight_requests, 0);
        assert!(matches!(local.try_acquire(&key), LocalAcquire::Own(_)));
    }

    #[tokio::test]
    async fn test_local_waiters_receive_entry() {
        let local = LocalWaiters::new(16);
        let key = fp("/api/v1/feed/global-trending");

        let guard = match local.try_acquire(&key) {
            LocalAcquire::Own(guard) => guard,
            _ => panic!("Should have owned the fingerprint"),
        };
        let mut rx1 = match local.try_acquire(&key) {
            LocalAcquire::Wait(rx) => rx,
            _ => panic!("Should have waited"),
        };
        let mut rx2 = match local.try_acquire(&key) {
            LocalAcquire::Wait(rx) => rx,
            _ => panic!("Should have waited"),
        };
        assert_eq!(local.stats().total_waiters, 2);

        guard.complete(Some(entry("shared")));

        assert_eq!(rx1.recv().await.unwrap().unwrap().body, Bytes::from("shared"));
        assert_eq!(rx2.recv().await.unwrap().unwrap().body, Bytes::from("shared"));
    }

    #[tokio::test]
    async fn test_dropped_guard_wakes_waiters_empty() {
        let local = LocalWaiters::new(16);
        let key = fp("/api/v1/health");

        let guard = match local.try_acquire(&key) {
            LocalAcquire::Own(guard) => guard,
            _ => panic!("Should have owned the fingerprint"),
        };
        let mut rx = match local.try_acquire(&key) {
            LocalAcquire::Wait(rx) => rx,
            _ => panic!("Should have waited"),
        };

        drop(guard);
        assert_eq!(rx.recv().await.unwrap(), None);
        assert_eq!(local.stats().in_flight_requests, 0);
    }

    #[test]
    fn test_local_waiters_are_capped() {
        let local = LocalWaiters::new(2);
        let key = fp("/api/v1/feed/global-trending");

        let guard = match local.try_acquire(&key) {
            LocalAcquire::Own(guard) => guard,
            _ => panic!("Should have owned the fingerprint"),
        };
        let rx1 = local.try_acquire(&key);
        let rx2 = local.try_acquire(&key);
        assert!(matches!(rx1, LocalAcquire::Wait(_)));
        assert!(matches!(rx2, LocalAcquire::Wait(_)));
        assert!(matches!(local.try_acquire(&key), LocalAcquire::Full));
        assert_eq!(local.stats().total_waiters, 2);

        // A departed waiter frees its slot
        drop(rx1);
        assert!(matches!(local.try_acquire(&key), LocalAcquire::Wait(_)));

        guard.complete(None);
        drop(rx2);
        assert!(matches!(local.try_acquire(&key), LocalAcquire::Own(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_overflow_waiters_follow_through_store() {
        let config = CoalesceConfig {
            local_waiters: true,
            max_waiters: 1,
            ..config()
        };
        let (_store, cache, coalescer) = setup(config);
        let key = fp("/api/v1/feed/global-trending");
        let calls = Arc::new(AtomicUsize::new(0));

        let leader = {
            let (coalescer, cache, key, calls) =
                (coalescer.clone(), cache.clone(), key.clone(), calls.clone());
            tokio::spawn(async move {
                coalescer
                    .execute(&key, LockMetadata::new("GET", "/x"), || async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(300)).await;
                        let e = entry("trending");
                        let cached = cache.store(&key, &e, Duration::from_secs(60)).await;
                        Ok(LeaderOutcome { entry: e, cached })
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let followers: Vec<_> = (0..3)
            .map(|_| {
                let (coalescer, key) = (coalescer.clone(), key.clone());
                tokio::spawn(async move {
                    coalescer
                        .execute(&key, LockMetadata::new("GET", "/x"), never_fetch)
                        .await
                })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(coalescer.local_stats().total_waiters, 1);

        assert_eq!(leader.await.unwrap().0, CacheStatus::Miss);
        for follower in followers {
            let (status, result) = follower.await.unwrap();
            assert_eq!(status, CacheStatus::Coalesced);
            assert_eq!(result.unwrap().body, Bytes::from("trending"));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_leader_releases_lock_and_counter() {
        let (store, cache, coalescer) = setup(config());
        let key = fp("/api/v1/content/1/full-detail");

        let (status, result) = coalescer
            .execute(&key, LockMetadata::new("GET", "/api/v1/content/1/full-detail"), || async {
                assert!(store.get(&keys::lock(&key)).await.unwrap().is_some());
                assert_eq!(
                    store.get(&keys::followers(&key)).await.unwrap(),
                    Some(b"1".to_vec())
                );
                let e = entry("detail");
                let cached = cache.store(&key, &e, Duration::from_secs(60)).await;
                Ok(LeaderOutcome { entry: e, cached })
            })
            .await;

        assert_eq!(status, CacheStatus::Miss);
        assert_eq!(result.unwrap().body, Bytes::from("detail"));
        assert!(store.get(&keys::lock(&key)).await.unwrap().is_none());
        assert!(store.get(&keys::followers(&key)).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_leader_failure_still_releases() {
        let (store, _cache, coalescer) = setup(config());
        let key = fp("/api/v1/search/advanced?q=x");

        let (status, result) = coalescer
            .execute(&key, LockMetadata::new("GET", "/api/v1/search/advanced?q=x"), || async {
                Err(ProxyError::BackendError("connection refused".to_string()))
            })
            .await;

        assert_eq!(status, CacheStatus::Miss);
        assert!(matches!(result, Err(ProxyError::BackendError(_))));
        assert!(store.get(&keys::lock(&key)).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_follower_of_remote_leader_times_out_after_budget() {
        let config = config();
        let budget = config.follower_budget();
        let (store, _cache, coalescer) = setup(config);
        let key = fp("/api/v1/analytics/content-performance");

        // A leader in another process holds the lock and never finishes.
        store
            .set_if_absent_with_expiry(&keys::lock(&key), b"{}", Duration::from_secs(5))
            .await
            .unwrap();

        let calls = AtomicUsize::new(0);
        let start = Instant::now();
        let (status, result) = coalescer
            .execute(&key, LockMetadata::new("GET", "/x"), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(LeaderOutcome { entry: entry("never"), cached: false })
            })
            .await;

        assert_eq!(status, CacheStatus::Coalesced);
        assert!(matches!(result, Err(ProxyError::CoalescingTimeout(_))));
        assert_eq!(start.elapsed(), budget);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            store.get(&keys::followers(&key)).await.unwrap(),
            Some(b"1".to_vec())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_follower_picks_up_remote_leader_result() {
        let (store, cache, coalescer) = setup(config());
        let key = fp("/api/v1/user/u1/dashboard-summary");

        store
            .set_if_absent_with_expiry(&keys::lock(&key), b"{}", Duration::from_secs(5))
            .await
            .unwrap();

        let writer = {
            let cache = cache.clone();
            let key = key.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(250)).await;
                cache.store(&key, &entry("remote"), Duration::from_secs(10)).await;
            })
        };

        let (status, result) = coalescer
            .execute(&key, LockMetadata::new("GET", "/x"), never_fetch)
            .await;
        writer.await.unwrap();

        assert_eq!(status, CacheStatus::Coalesced);
        assert_eq!(result.unwrap().body, Bytes::from("remote"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_lease_is_reacquired() {
        let (store, _cache, coalescer) = setup(config());
        let key = fp("/api/v1/feed/global-trending");

        // Crashed leader: lock written, never released.
        store
            .set_if_absent_with_expiry(&keys::lock(&key), b"{}", Duration::from_secs(5))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(6)).await;

        let (status, result) = coalescer
            .execute(&key, LockMetadata::new("GET", "/api/v1/feed/global-trending"), || async {
                Ok(LeaderOutcome { entry: entry("fresh"), cached: false })
            })
            .await;

        assert_eq!(status, CacheStatus::Miss);
        assert_eq!(result.unwrap().body, Bytes::from("fresh"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_double_check_after_lock() {
        let (_store, cache, coalescer) = setup(config());
        let key = fp("/api/v1/health");
        cache.store(&key, &entry("cached"), Duration::from_secs(10)).await;

        let (status, result) = coalescer
            .execute(&key, LockMetadata::new("GET", "/api/v1/health"), never_fetch)
            .await;

        assert_eq!(status, CacheStatus::Hit);
        assert_eq!(result.unwrap().body, Bytes::from("cached"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_upstream_bounded_by_lease() {
        let (store, _cache, coalescer) = setup(config());
        let key = fp("/api/v1/slow");

        let start = Instant::now();
        let (_, result) = coalescer
            .execute(&key, LockMetadata::new("GET", "/api/v1/slow"), || async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(LeaderOutcome { entry: entry("late"), cached: false })
            })
            .await;

        assert!(matches!(result, Err(ProxyError::BackendTimeout(_))));
        assert_eq!(start.elapsed(), Duration::from_secs(5));
        assert!(store.get(&keys::lock(&key)).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_coalescing_bypasses() {
        let config = CoalesceConfig {
            enabled: false,
            ..config()
        };
        let (store, _cache, coalescer) = setup(config);
        let key = fp("/api/v1/health");

        let (status, result) = coalescer
            .execute(&key, LockMetadata::new("GET", "/api/v1/health"), || async {
                Ok(LeaderOutcome { entry: entry("direct"), cached: false })
            })
            .await;

        assert_eq!(status, CacheStatus::Bypass);
        assert!(result.is_ok());
        assert!(store.is_empty());
    }

    #[test]
    fn test_attempts_within() {
        let interval = Duration::from_millis(100);
        assert_eq!(attempts_within(Duration::from_millis(1000), interval), 10);
        assert_eq!(attempts_within(Duration::from_millis(250), interval), 2);
        assert_eq!(attempts_within(Duration::ZERO, interval), 0);
    }
}
