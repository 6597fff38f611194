//! Command result cache keyed by repository and command signature.
//!
//! Entries record the operation classes that make them stale and are dropped
//! the moment such an operation is reported. Each repository carries an
//! epoch bumped on every invalidation; a read that started under an older
//! epoch neither stores its result nor is joined by later requesters.
//! Storage is a `BoundedCache`, so eviction under pressure is
//! least-recently-used and both ceilings hold after every store.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::bounded::BoundedCache;
use super::flight::SingleFlight;
use crate::error::{GitError, Result};
use crate::git::{OperationClass, RepoId};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub ttl_ms: u64,
    pub max_entries: usize,
    pub max_memory_bytes: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_ms: 30_000,
            max_entries: 4_096,
            max_memory_bytes: 64 * 1024 * 1024,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub repo: RepoId,
    pub signature: String,
}

impl CacheKey {
    pub fn new(repo: &RepoId, signature: &str) -> Self {
        Self {
            repo: repo.clone(),
            signature: signature.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CachedResult {
    pub payload: Arc<str>,
    pub created_at: Instant,
    pub approx_size_bytes: usize,
    pub invalidated_by: Arc<[OperationClass]>,
}

impl CachedResult {
    fn new(key: &CacheKey, payload: Arc<str>, invalidated_by: Vec<OperationClass>) -> Self {
        let approx_size_bytes = std::mem::size_of::<CacheKey>()
            + std::mem::size_of::<CachedResult>()
            + key.signature.len()
            + key.repo.path().as_os_str().len()
            + payload.len()
            + invalidated_by.len() * std::mem::size_of::<OperationClass>();
        Self {
            payload,
            created_at: Instant::now(),
            approx_size_bytes,
            invalidated_by: invalidated_by.into(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStatistics {
    pub entries: usize,
    pub memory_bytes: usize,
    pub in_flight: usize,
    pub hits: u64,
    pub misses: u64,
    pub coalesced: u64,
    pub invalidations: u64,
    pub evictions: u64,
    pub rejected: u64,
}

struct Inner {
    config: CacheConfig,
    entries: BoundedCache<CacheKey, CachedResult>,
    epochs: DashMap<RepoId, u64>,
    flights: SingleFlight<(CacheKey, u64), Arc<str>>,
    hits: AtomicU64,
    misses: AtomicU64,
    coalesced: AtomicU64,
    invalidations: AtomicU64,
    rejected: AtomicU64,
}

impl Inner {
    fn epoch_for(&self, repo: &RepoId) -> u64 {
        *self.epochs.entry(repo.clone()).or_insert(0)
    }

    fn store(&self, key: CacheKey, payload: Arc<str>, classes: Vec<OperationClass>, epoch: u64) {
        let entry = CachedResult::new(&key, payload, classes);
        // Lock order: epochs, then entries. `invalidate` takes the same
        // order, so a store can never slip in behind an invalidation.
        let current = self.epochs.get(&key.repo);
        if current.as_deref() != Some(&epoch) {
            debug!(repo = %key.repo, "result invalidated while in flight, not stored");
            return;
        }
        let size = entry.approx_size_bytes;
        if !self.entries.set(key, entry) {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            debug!(size, "result larger than the cache, not stored");
        }
    }
}

/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct CommandCache {
    inner: Arc<Inner>,
}

impl CommandCache {
    pub fn new(config: CacheConfig) -> Self {
        let entries = BoundedCache::new(
            config.max_entries,
            config.max_memory_bytes,
            Arc::new(|entry: &CachedResult| entry.approx_size_bytes),
        );
        Self {
            inner: Arc::new(Inner {
                config,
                entries,
                epochs: DashMap::new(),
                flights: SingleFlight::new(),
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                coalesced: AtomicU64::new(0),
                invalidations: AtomicU64::new(0),
                rejected: AtomicU64::new(0),
            }),
        }
    }

    /// Cached payload, or the result of `work`. Concurrent callers with the
    /// same key share one execution of `work`. Failures are never cached.
    /// Dropping every caller before `work` finishes aborts it.
    pub async fn get_or_execute<F, Fut>(
        &self,
        repo: &RepoId,
        signature: &str,
        invalidated_by: &[OperationClass],
        work: F,
    ) -> Result<Arc<str>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<String>> + Send + 'static,
    {
        let key = CacheKey::new(repo, signature);
        if let Some(payload) = self.peek_key(&key) {
            debug!(repo = %repo, signature, "result cache hit");
            return Ok(payload);
        }

        let epoch = self.inner.epoch_for(repo);
        let inner = Arc::clone(&self.inner);
        let classes = invalidated_by.to_vec();
        let store_key = key.clone();
        let (flight, joined) = self.inner.flights.run((key, epoch), move || async move {
            let payload: Arc<str> = Arc::from(work().await?);
            inner.store(store_key, Arc::clone(&payload), classes, epoch);
            Ok::<_, GitError>(payload)
        });

        if joined {
            self.inner.coalesced.fetch_add(1, Ordering::Relaxed);
            debug!(repo = %repo, signature, "joined in-flight execution");
        } else {
            self.inner.misses.fetch_add(1, Ordering::Relaxed);
            debug!(repo = %repo, signature, "result cache miss");
        }
        flight.await
    }

    /// Cached payload if present and within TTL. A hit promotes the entry
    /// to most-recently-used.
    pub fn peek(&self, repo: &RepoId, signature: &str) -> Option<Arc<str>> {
        self.peek_key(&CacheKey::new(repo, signature))
    }

    fn peek_key(&self, key: &CacheKey) -> Option<Arc<str>> {
        let entry = self.inner.entries.get(key)?;
        if entry.created_at.elapsed() <= self.inner.config.ttl() {
            self.inner.hits.fetch_add(1, Ordering::Relaxed);
            return Some(entry.payload);
        }
        self.inner.entries.remove(key);
        None
    }

    /// Drops every entry of `repo` that `class` makes stale, and keeps any
    /// read already in flight from storing its result.
    pub fn invalidate(&self, repo: &RepoId, class: OperationClass) -> usize {
        let mut epoch = self.inner.epochs.entry(repo.clone()).or_insert(0);
        *epoch += 1;
        let removed = self.inner.entries.retain(|key, entry| {
            &key.repo != repo || !entry.invalidated_by.contains(&class)
        });
        drop(epoch);

        self.inner
            .invalidations
            .fetch_add(removed as u64, Ordering::Relaxed);
        debug!(repo = %repo, %class, removed, "invalidated cached results");
        removed
    }

    /// Drops every entry of a repository. The epoch survives so reads
    /// started before the eviction cannot store or be joined afterwards.
    pub fn evict_repository(&self, repo: &RepoId) -> usize {
        let mut epoch = self.inner.epochs.entry(repo.clone()).or_insert(0);
        *epoch += 1;
        let removed = self.inner.entries.retain(|key, _| &key.repo != repo);
        drop(epoch);
        removed
    }

    pub fn purge_expired(&self) -> usize {
        let ttl = self.inner.config.ttl();
        self.inner
            .entries
            .retain(|_, entry| entry.created_at.elapsed() <= ttl)
    }

    pub fn clear(&self) {
        self.inner.entries.clear();
    }

    pub fn statistics(&self) -> CacheStatistics {
        let inner = &self.inner;
        let entries = inner.entries.statistics();
        CacheStatistics {
            entries: entries.item_count,
            memory_bytes: entries.memory_usage_bytes,
            in_flight: inner.flights.in_flight(),
            hits: inner.hits.load(Ordering::Relaxed),
            misses: inner.misses.load(Ordering::Relaxed),
            coalesced: inner.coalesced.load(Ordering::Relaxed),
            invalidations: inner.invalidations.load(Ordering::Relaxed),
            evictions: entries.evictions,
            rejected: inner.rejected.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use tokio::sync::Notify;

    fn repo(name: &str) -> RepoId {
        RepoId::new(format!("/nonexistent/{name}"))
    }

    fn counted(
        counter: &Arc<AtomicU32>,
        value: &str,
    ) -> impl FnOnce() -> futures::future::Ready<Result<String>> + Send + 'static {
        let counter = Arc::clone(counter);
        let value = value.to_string();
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
            futures::future::ready(Ok(value))
        }
    }

    const LOG_INVALIDATORS: &[OperationClass] = &[OperationClass::Commit, OperationClass::Checkout];

    #[tokio::test]
    async fn test_second_read_is_a_hit() {
        let cache = CommandCache::new(CacheConfig::default());
        let calls = Arc::new(AtomicU32::new(0));
        let r = repo("a");

        let first = cache.get_or_execute(&r, "log", LOG_INVALIDATORS, counted(&calls, "v1")).await;
        let second = cache.get_or_execute(&r, "log", LOG_INVALIDATORS, counted(&calls, "v2")).await;

        assert_eq!(&*first.unwrap(), "v1");
        assert_eq!(&*second.unwrap(), "v1");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let stats = cache.statistics();
        assert_eq!((stats.hits, stats.misses, stats.entries), (1, 1, 1));
    }

    #[tokio::test]
    async fn test_concurrent_misses_coalesce() {
        let cache = CommandCache::new(CacheConfig::default());
        let calls = Arc::new(AtomicU32::new(0));
        let r = repo("a");

        let mut tasks = Vec::new();
        for _ in 0..10 {
            let cache = cache.clone();
            let calls = Arc::clone(&calls);
            let r = r.clone();
            tasks.push(tokio::spawn(async move {
                cache
                    .get_or_execute(&r, "status", &[OperationClass::Stage], move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok("clean".to_string())
                    })
                    .await
            }));
        }
        for task in tasks {
            assert_eq!(&*task.await.unwrap().unwrap(), "clean");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let stats = cache.statistics();
        assert_eq!(stats.misses + stats.coalesced + stats.hits, 10);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test]
    async fn test_invalidate_matches_class_and_repo() {
        let cache = CommandCache::new(CacheConfig::default());
        let calls = Arc::new(AtomicU32::new(0));
        let (a, b) = (repo("a"), repo("b"));

        cache.get_or_execute(&a, "log", LOG_INVALIDATORS, counted(&calls, "x")).await.unwrap();
        cache.get_or_execute(&a, "config", &[OperationClass::ConfigChange], counted(&calls, "x")).await.unwrap();
        cache.get_or_execute(&b, "log", LOG_INVALIDATORS, counted(&calls, "x")).await.unwrap();

        assert_eq!(cache.invalidate(&a, OperationClass::Commit), 1);
        assert!(cache.peek(&a, "log").is_none());
        assert!(cache.peek(&a, "config").is_some());
        assert!(cache.peek(&b, "log").is_some());
        assert_eq!(cache.statistics().invalidations, 1);
    }

    #[tokio::test]
    async fn test_read_after_invalidation_is_fresh() {
        let cache = CommandCache::new(CacheConfig::default());
        let calls = Arc::new(AtomicU32::new(0));
        let r = repo("a");

        cache.get_or_execute(&r, "log", LOG_INVALIDATORS, counted(&calls, "before")).await.unwrap();
        cache.invalidate(&r, OperationClass::Checkout);
        let after = cache
            .get_or_execute(&r, "log", LOG_INVALIDATORS, counted(&calls, "after"))
            .await
            .unwrap();
        assert_eq!(&*after, "after");
    }

    #[tokio::test]
    async fn test_invalidation_during_flight_is_not_stored_or_joined() {
        let cache = CommandCache::new(CacheConfig::default());
        let r = repo("a");
        let release = Arc::new(Notify::new());
        let started = Arc::new(Notify::new());

        let slow = {
            let cache = cache.clone();
            let r = r.clone();
            let release = Arc::clone(&release);
            let started = Arc::clone(&started);
            tokio::spawn(async move {
                cache
                    .get_or_execute(&r, "log", LOG_INVALIDATORS, move || async move {
                        started.notify_one();
                        release.notified().await;
                        Ok("stale".to_string())
                    })
                    .await
            })
        };
        started.notified().await;

        cache.invalidate(&r, OperationClass::Commit);
        let fresh = cache
            .get_or_execute(&r, "log", LOG_INVALIDATORS, || async { Ok("fresh".to_string()) })
            .await
            .unwrap();
        assert_eq!(&*fresh, "fresh");

        release.notify_one();
        assert_eq!(&*slow.await.unwrap().unwrap(), "stale");
        assert_eq!(cache.peek(&r, "log").as_deref(), Some("fresh"));
    }

    #[tokio::test]
    async fn test_failures_not_cached() {
        let cache = CommandCache::new(CacheConfig::default());
        let r = repo("a");
        let err = cache
            .get_or_execute(&r, "log", LOG_INVALIDATORS, || async {
                Err(GitError::Internal("boom".into()))
            })
            .await;
        assert!(err.is_err());
        assert_eq!(cache.statistics().entries, 0);
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let cache = CommandCache::new(CacheConfig { ttl_ms: 20, ..CacheConfig::default() });
        let calls = Arc::new(AtomicU32::new(0));
        let r = repo("a");

        cache.get_or_execute(&r, "log", LOG_INVALIDATORS, counted(&calls, "x")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(cache.peek(&r, "log").is_none());
        assert_eq!(cache.statistics().memory_bytes, 0);
        cache.get_or_execute(&r, "log", LOG_INVALIDATORS, counted(&calls, "x")).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(cache.purge_expired(), 1);
    }

    #[tokio::test]
    async fn test_entry_ceiling_evicts_least_recently_used() {
        let cache = CommandCache::new(CacheConfig { max_entries: 3, ..CacheConfig::default() });
        let calls = Arc::new(AtomicU32::new(0));
        let r = repo("a");
        for sig in ["one", "two", "three", "four"] {
            cache.get_or_execute(&r, sig, LOG_INVALIDATORS, counted(&calls, sig)).await.unwrap();
        }
        assert_eq!(cache.statistics().entries, 3);
        assert!(cache.peek(&r, "one").is_none());
        assert!(cache.peek(&r, "four").is_some());
    }

    #[tokio::test]
    async fn test_recently_read_entry_survives_eviction() {
        let cache = CommandCache::new(CacheConfig { max_entries: 3, ..CacheConfig::default() });
        let calls = Arc::new(AtomicU32::new(0));
        let r = repo("a");
        for sig in ["k1", "k2", "k3"] {
            cache.get_or_execute(&r, sig, LOG_INVALIDATORS, counted(&calls, sig)).await.unwrap();
        }
        assert!(cache.peek(&r, "k1").is_some());
        cache.get_or_execute(&r, "k4", LOG_INVALIDATORS, counted(&calls, "k4")).await.unwrap();

        assert!(cache.peek(&r, "k1").is_some());
        assert!(cache.peek(&r, "k2").is_none());
        assert_eq!(cache.statistics().evictions, 1);
    }

    #[tokio::test]
    async fn test_oversized_payload_is_returned_but_not_stored() {
        let cache = CommandCache::new(CacheConfig { max_memory_bytes: 4_096, ..CacheConfig::default() });
        let calls = Arc::new(AtomicU32::new(0));
        let r = repo("a");
        for sig in ["a", "b", "c"] {
            cache.get_or_execute(&r, sig, LOG_INVALIDATORS, counted(&calls, sig)).await.unwrap();
        }
        let before = cache.statistics().memory_bytes;

        let huge = "x".repeat(10_000);
        let payload = cache
            .get_or_execute(&r, "huge", LOG_INVALIDATORS, counted(&calls, &huge))
            .await
            .unwrap();
        assert_eq!(payload.len(), 10_000);

        let stats = cache.statistics();
        assert_eq!(stats.entries, 3);
        assert_eq!(stats.memory_bytes, before);
        assert_eq!(stats.rejected, 1);
        assert!(cache.peek(&r, "huge").is_none());
    }

    #[tokio::test]
    async fn test_memory_ceiling_holds() {
        let cache = CommandCache::new(CacheConfig { max_memory_bytes: 4_096, ..CacheConfig::default() });
        let calls = Arc::new(AtomicU32::new(0));
        let r = repo("a");
        let big = "x".repeat(1_500);
        for i in 0..6 {
            cache
                .get_or_execute(&r, &format!("q{i}"), LOG_INVALIDATORS, counted(&calls, &big))
                .await
                .unwrap();
            assert!(cache.statistics().memory_bytes <= 4_096);
        }
        assert!(cache.statistics().entries < 6);
    }

    #[tokio::test]
    async fn test_evict_repository() {
        let cache = CommandCache::new(CacheConfig::default());
        let calls = Arc::new(AtomicU32::new(0));
        let (a, b) = (repo("a"), repo("b"));
        cache.get_or_execute(&a, "log", LOG_INVALIDATORS, counted(&calls, "x")).await.unwrap();
        cache.get_or_execute(&b, "log", LOG_INVALIDATORS, counted(&calls, "x")).await.unwrap();

        assert_eq!(cache.evict_repository(&a), 1);
        assert!(cache.peek(&a, "log").is_none());
        assert!(cache.peek(&b, "log").is_some());
    }
}
