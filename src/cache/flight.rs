//! Single-flight coalescing: concurrent requests for the same key share one
//! execution and its result.
//!
//! Each execution runs in its own task. Waiters are counted; when the last
//! one goes away before the result is ready, the task is aborted (which
//! kills any child process it owns) and the key is released.

use std::future::Future;
use std::hash::Hash;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tokio::task::AbortHandle;
use tracing::debug;

use crate::error::{GitError, Result};

type Outcome<V> = Shared<BoxFuture<'static, Result<V>>>;

struct InFlight<V> {
    id: u64,
    waiters: usize,
    outcome: Outcome<V>,
    task: AbortHandle,
}

type FlightMap<K, V> = DashMap<K, InFlight<V>>;

pub struct SingleFlight<K: Hash + Eq, V> {
    flights: Arc<FlightMap<K, V>>,
    next_id: AtomicU64,
}

impl<K, V> Default for SingleFlight<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> SingleFlight<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            flights: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Joins the flight for `key`, or spawns one running `work`. The second
    /// value is `true` when an existing flight was joined.
    ///
    /// The key is released as soon as the work completes, successfully or
    /// not, or when every waiter has been dropped. Must be called within a
    /// tokio runtime.
    pub fn run<F, Fut>(&self, key: K, work: F) -> (Waiter<K, V>, bool)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        match self.flights.entry(key.clone()) {
            Entry::Occupied(mut existing) => {
                let flight = existing.get_mut();
                flight.waiters += 1;
                let waiter = Waiter {
                    outcome: flight.outcome.clone(),
                    key,
                    id: flight.id,
                    flights: Arc::clone(&self.flights),
                };
                (waiter, true)
            }
            Entry::Vacant(slot) => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let flights = Arc::clone(&self.flights);
                let done_key = key.clone();
                // Blocks on the shard lock until the entry below is inserted.
                let task = tokio::spawn(async move {
                    let result = work().await;
                    flights.remove_if(&done_key, |_, flight| flight.id == id);
                    result
                });
                let abort = task.abort_handle();
                let outcome = async move {
                    match task.await {
                        Ok(result) => result,
                        Err(e) if e.is_cancelled() => Err(GitError::Cancelled),
                        Err(e) => Err(GitError::Internal(format!("in-flight execution failed: {e}"))),
                    }
                }
                .boxed()
                .shared();
                slot.insert(InFlight {
                    id,
                    waiters: 1,
                    outcome: outcome.clone(),
                    task: abort,
                });
                let waiter = Waiter {
                    outcome,
                    key,
                    id,
                    flights: Arc::clone(&self.flights),
                };
                (waiter, false)
            }
        }
    }

    pub fn in_flight(&self) -> usize {
        self.flights.len()
    }
}

/// One caller's share of a flight. Resolves to the flight's result;
/// dropping the last waiter of an unfinished flight aborts it.
pub struct Waiter<K: Hash + Eq, V> {
    outcome: Outcome<V>,
    key: K,
    id: u64,
    flights: Arc<FlightMap<K, V>>,
}

// `key` is never pinned.
impl<K: Hash + Eq, V> Unpin for Waiter<K, V> {}

impl<K: Hash + Eq, V: Clone> Future for Waiter<K, V> {
    type Output = Result<V>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.outcome.poll_unpin(cx)
    }
}

impl<K: Hash + Eq, V> Drop for Waiter<K, V> {
    fn drop(&mut self) {
        let last = match self.flights.get_mut(&self.key) {
            Some(mut flight) if flight.id == self.id => {
                flight.waiters = flight.waiters.saturating_sub(1);
                flight.waiters == 0
            }
            _ => false,
        };
        if !last {
            return;
        }
        let abandoned = self
            .flights
            .remove_if(&self.key, |_, flight| flight.id == self.id && flight.waiters == 0);
        if let Some((_, flight)) = abandoned {
            debug!(flight = flight.id, "every waiter left, aborting in-flight execution");
            flight.task.abort();
        }
    }
}
