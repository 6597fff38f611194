//! Batch execution of independent read-only queries.
//!
//! Cache hits are answered first without spawning anything. Remaining misses
//! run sequentially when there are only a few, otherwise concurrently on a
//! `JoinSet` bounded by a semaphore. Each key gets exactly one result or one
//! failure; a failing key never aborts the batch.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error};

use crate::cache::CommandCache;
use crate::error::{GitError, Result};
use crate::git::Invocation;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Concurrent executions per batch.
    pub parallelism: usize,
    /// Fewer misses than this run one after another.
    pub sequential_threshold: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            parallelism: 4,
            sequential_threshold: 3,
        }
    }
}

#[derive(Debug)]
pub struct BatchOutcome<K: Hash + Eq> {
    pub results: HashMap<K, Arc<str>>,
    pub failures: HashMap<K, GitError>,
    pub cache_hits: usize,
}

impl<K: Hash + Eq> BatchOutcome<K> {
    fn new() -> Self {
        Self {
            results: HashMap::new(),
            failures: HashMap::new(),
            cache_hits: 0,
        }
    }

    /// Moves the outcome for `key` out of the batch.
    pub fn take(&mut self, key: &K) -> Result<Arc<str>> {
        if let Some(payload) = self.results.remove(key) {
            return Ok(payload);
        }
        Err(self
            .failures
            .remove(key)
            .unwrap_or_else(|| GitError::Internal("key missing from batch outcome".to_string())))
    }

    pub fn len(&self) -> usize {
        self.results.len() + self.failures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct BatchExecutor {
    config: BatchConfig,
    cache: CommandCache,
}

impl BatchExecutor {
    pub fn new(config: BatchConfig, cache: CommandCache) -> Self {
        Self { config, cache }
    }

    /// Runs every request through `work` unless its result is already
    /// cached. Mutating invocations are reported as failures.
    pub async fn execute<K, F, Fut>(&self, requests: Vec<(K, Invocation)>, work: F) -> BatchOutcome<K>
    where
        K: Hash + Eq + Clone + Send + 'static,
        F: Fn(Invocation) -> Fut + Clone + Send + 'static,
        Fut: Future<Output = Result<Arc<str>>> + Send + 'static,
    {
        let started = Instant::now();
        let requested = requests.len();
        let mut outcome = BatchOutcome::new();
        let mut misses = Vec::new();

        for (key, invocation) in requests {
            if invocation.command().is_mutating() {
                outcome.failures.insert(
                    key,
                    GitError::InvalidArgument(format!(
                        "{} is not a read-only query",
                        invocation.display()
                    )),
                );
                continue;
            }
            match self.cache.peek(&invocation.repo_id(), &invocation.signature()) {
                Some(payload) => {
                    outcome.cache_hits += 1;
                    outcome.results.insert(key, payload);
                }
                None => misses.push((key, invocation)),
            }
        }

        let miss_count = misses.len();
        if miss_count < self.config.sequential_threshold {
            for (key, invocation) in misses {
                match work(invocation).await {
                    Ok(payload) => {
                        outcome.results.insert(key, payload);
                    }
                    Err(e) => {
                        outcome.failures.insert(key, e);
                    }
                }
            }
        } else {
            self.run_concurrently(misses, work, &mut outcome).await;
        }

        debug!(
            requested,
            cache_hits = outcome.cache_hits,
            misses = miss_count,
            failures = outcome.failures.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "batch complete"
        );
        outcome
    }

    async fn run_concurrently<K, F, Fut>(
        &self,
        misses: Vec<(K, Invocation)>,
        work: F,
        outcome: &mut BatchOutcome<K>,
    ) where
        K: Hash + Eq + Clone + Send + 'static,
        F: Fn(Invocation) -> Fut + Clone + Send + 'static,
        Fut: Future<Output = Result<Arc<str>>> + Send + 'static,
    {
        let semaphore = Arc::new(Semaphore::new(self.config.parallelism.max(1)));
        let mut join_set = JoinSet::new();
        let mut pending: Vec<K> = Vec::with_capacity(misses.len());

        for (key, invocation) in misses {
            let semaphore = Arc::clone(&semaphore);
            let work = work.clone();
            pending.push(key.clone());
            join_set.spawn(async move {
                let result = match semaphore.acquire_owned().await {
                    Ok(_permit) => work(invocation).await,
                    Err(_) => Err(GitError::Internal("batch semaphore closed".to_string())),
                };
                (key, result)
            });
        }

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((key, Ok(payload))) => {
                    outcome.results.insert(key, payload);
                }
                Ok((key, Err(e))) => {
                    outcome.failures.insert(key, e);
                }
                Err(e) => error!(error = %e, "batch task panicked"),
            }
        }

        // a panicked task still owes its key an outcome
        for key in pending {
            if !outcome.results.contains_key(&key) && !outcome.failures.contains_key(&key) {
                outcome
                    .failures
                    .insert(key, GitError::Internal("batch task failed".to_string()));
            }
        }
    }
}
