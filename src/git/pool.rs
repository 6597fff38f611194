//! Per-repository pool of validated execution handles.
//!
//! A handle remembers what repository discovery found for a working
//! directory (git dir, work tree) together with the state it was validated
//! against. Reusing it lets git skip discovery. Any doubt about that state
//! discards the handle, and any pool problem degrades to an unpooled run.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::command::{GitCommand, PoolSafety};
use super::environment;
use super::invocation::{Invocation, RepoId};
use super::retry::GitLayout;
use super::runner::{CommandOutput, ExecContext, ProcessRunner};
use crate::error::{GitError, Result};

const MIN_HANDLES: usize = 3;
const MAX_HANDLES: usize = 16;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Clamped to 3..=16.
    pub max_handles_per_repo: usize,
    pub idle_timeout_secs: u64,
    /// A pooled execution that neither writes output nor exits within this
    /// long is treated as hung. Once git starts writing it may run on.
    pub liveness_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_handles_per_repo: 8,
            idle_timeout_secs: 300,
            liveness_timeout_ms: 30_000,
        }
    }
}

impl PoolConfig {
    pub fn capacity(&self) -> usize {
        self.max_handles_per_repo.clamp(MIN_HANDLES, MAX_HANDLES)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_millis(self.liveness_timeout_ms)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolStatistics {
    pub repositories: usize,
    pub idle_handles: usize,
    pub leased_handles: usize,
    pub created: u64,
    pub reused: u64,
    pub discarded: u64,
    pub fallbacks: u64,
}

/// What a handle was validated against when it was created.
#[derive(Debug, Clone)]
struct ValidatedState {
    working_dir: PathBuf,
    credential_fingerprint: String,
    config_mtime: Option<SystemTime>,
}

#[derive(Debug)]
struct PooledHandle {
    id: u64,
    state: ValidatedState,
    layout: GitLayout,
    context: ExecContext,
    last_used_at: Instant,
    uses: u64,
}

impl PooledHandle {
    /// `Err` carries the reason the handle may not be reused.
    fn validate(
        &self,
        working_dir: &Path,
        fingerprint: &str,
        safety: PoolSafety,
        idle_timeout: Duration,
    ) -> std::result::Result<(), &'static str> {
        if self.state.working_dir != working_dir {
            return Err("working directory differs");
        }
        if self.state.credential_fingerprint != fingerprint {
            return Err("credential environment changed");
        }
        if self.last_used_at.elapsed() > idle_timeout {
            return Err("idle timeout exceeded");
        }
        if !self.layout.git_dir.is_dir() {
            return Err("git directory missing");
        }
        if config_mtime(&self.layout) != self.state.config_mtime {
            return Err("repository config changed");
        }
        if safety == PoolSafety::ValidateFirst && !self.layout.lock_files().is_empty() {
            return Err("lock file present");
        }
        Ok(())
    }

    fn is_expired(&self, idle_timeout: Duration) -> bool {
        self.last_used_at.elapsed() > idle_timeout || !self.layout.git_dir.is_dir()
    }
}

#[derive(Debug)]
struct RepoSlot {
    generation: u64,
    idle: Vec<PooledHandle>,
    leased: usize,
}

#[derive(Debug, Default)]
struct PoolCounters {
    created: AtomicU64,
    reused: AtomicU64,
    discarded: AtomicU64,
    fallbacks: AtomicU64,
}

struct PoolInner {
    runner: Arc<ProcessRunner>,
    config: PoolConfig,
    slots: DashMap<RepoId, RepoSlot>,
    next_id: AtomicU64,
    counters: PoolCounters,
}

impl PoolInner {
    fn discard(&self, handle: &PooledHandle, reason: &str) {
        debug!(handle = handle.id, uses = handle.uses, reason, "discarding pooled handle");
        self.counters.discarded.fetch_add(1, Ordering::Relaxed);
    }

    fn checkin(&self, repo: &RepoId, generation: u64, handle: Option<PooledHandle>) {
        let Some(mut slot) = self.slots.get_mut(repo) else {
            if let Some(handle) = handle {
                self.discard(&handle, "repository evicted");
            }
            return;
        };
        if slot.generation != generation {
            if let Some(handle) = handle {
                self.discard(&handle, "repository evicted");
            }
            return;
        }
        slot.leased = slot.leased.saturating_sub(1);

        if let Some(mut handle) = handle {
            if config_mtime(&handle.layout) != handle.state.config_mtime {
                self.discard(&handle, "repository config changed");
                return;
            }
            handle.last_used_at = Instant::now();
            handle.uses += 1;
            slot.idle.push(handle);
        }
    }
}

/// A checked-out handle. Returned to its slot on drop.
struct Lease {
    pool: Arc<PoolInner>,
    repo: RepoId,
    generation: u64,
    handle: Option<PooledHandle>,
}

impl Lease {
    fn context(&self) -> Option<&ExecContext> {
        self.handle.as_ref().map(|h| &h.context)
    }

    fn git_dir_exists(&self) -> bool {
        self.handle
            .as_ref()
            .is_some_and(|h| h.layout.git_dir.is_dir())
    }

    /// Drops the handle instead of returning it; the slot is still released.
    fn discard(&mut self, reason: &str) {
        if let Some(handle) = self.handle.take() {
            self.pool.discard(&handle, reason);
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.pool
            .checkin(&self.repo, self.generation, self.handle.take());
    }
}

/// Shared across repositories; one slot per `RepoId`.
#[derive(Clone)]
pub struct ProcessPool {
    inner: Arc<PoolInner>,
}

impl ProcessPool {
    pub fn new(runner: Arc<ProcessRunner>, config: PoolConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                runner,
                config,
                slots: DashMap::new(),
                next_id: AtomicU64::new(1),
                counters: PoolCounters::default(),
            }),
        }
    }

    pub fn runner(&self) -> &Arc<ProcessRunner> {
        &self.inner.runner
    }

    /// Runs `invocation`, through a pooled handle when its command allows it.
    /// Non-zero exits are classified like `ProcessRunner::run`.
    pub async fn run(&self, invocation: &Invocation) -> Result<CommandOutput> {
        let safety = invocation.command().pool_safety();
        if safety == PoolSafety::NeverPool {
            return self.inner.runner.run(invocation).await;
        }

        let Some(mut lease) = self.checkout(invocation, safety).await else {
            return self.fallback(invocation, "no handle available").await;
        };
        let context = lease.context().cloned();

        let liveness = self.inner.config.liveness_timeout();
        match self
            .inner
            .runner
            .run_in(invocation, context.as_ref(), Some(liveness))
            .await
        {
            Ok(Some(output)) => Ok(output),
            Ok(None) => {
                warn!(
                    command = %invocation.display(),
                    liveness_ms = liveness.as_millis() as u64,
                    "pooled execution unresponsive, discarding handle"
                );
                lease.discard("liveness timeout");
                drop(lease);
                self.fallback(invocation, "liveness timeout").await
            }
            Err(e) if is_handle_failure(&e) && !lease.git_dir_exists() => {
                lease.discard("git directory vanished during execution");
                drop(lease);
                self.fallback(invocation, "pooled execution failed").await
            }
            Err(e) => Err(e),
        }
    }

    async fn fallback(&self, invocation: &Invocation, reason: &str) -> Result<CommandOutput> {
        debug!(command = %invocation.display(), reason, "running unpooled");
        self.inner.counters.fallbacks.fetch_add(1, Ordering::Relaxed);
        self.inner.runner.run(invocation).await
    }

    /// A valid idle handle, a freshly created one, or `None` when the
    /// repository is at capacity or discovery failed.
    async fn checkout(&self, invocation: &Invocation, safety: PoolSafety) -> Option<Lease> {
        let repo = invocation.repo_id();
        let fingerprint = environment::credential_fingerprint(invocation.env_overrides());
        let capacity = self.inner.config.capacity();
        let idle_timeout = self.inner.config.idle_timeout();

        loop {
            // Reserve under the shard lock, validate outside it.
            let (generation, candidate) = {
                let mut slot = self.inner.slots.entry(repo.clone()).or_insert_with(|| RepoSlot {
                    generation: self.inner.next_id.fetch_add(1, Ordering::Relaxed),
                    idle: Vec::new(),
                    leased: 0,
                });
                match slot.idle.pop() {
                    Some(handle) => {
                        slot.leased += 1;
                        (slot.generation, Some(handle))
                    }
                    None if slot.leased < capacity => {
                        slot.leased += 1;
                        (slot.generation, None)
                    }
                    None => {
                        debug!(repo = %repo, capacity, "pool at capacity");
                        return None;
                    }
                }
            };

            let mut lease = Lease {
                pool: Arc::clone(&self.inner),
                repo: repo.clone(),
                generation,
                handle: None,
            };

            match candidate {
                Some(handle) => {
                    match handle.validate(repo.path(), &fingerprint, safety, idle_timeout) {
                        Ok(()) => {
                            self.inner.counters.reused.fetch_add(1, Ordering::Relaxed);
                            lease.handle = Some(handle);
                            return Some(lease);
                        }
                        // the lease drops empty and releases the reservation
                        Err(reason) => self.inner.discard(&handle, reason),
                    }
                }
                None => {
                    let handle = self.create_handle(invocation, &repo, fingerprint.clone()).await?;
                    if safety == PoolSafety::ValidateFirst && !handle.layout.lock_files().is_empty()
                    {
                        self.inner.discard(&handle, "lock file present");
                        return None;
                    }
                    lease.handle = Some(handle);
                    return Some(lease);
                }
            }
        }
    }

    async fn create_handle(
        &self,
        invocation: &Invocation,
        repo: &RepoId,
        credential_fingerprint: String,
    ) -> Option<PooledHandle> {
        let rev_parse = |args: &[&str]| {
            let mut inv = Invocation::new(repo.path(), GitCommand::RevParse)
                .args(args.iter().copied())
                .timeout(self.inner.config.liveness_timeout());
            for (key, value) in invocation.env_overrides() {
                inv = inv.env(key.clone(), value.clone());
            }
            inv
        };

        let discovered = self
            .inner
            .runner
            .run(&rev_parse(&["--absolute-git-dir", "--is-bare-repository"]))
            .await;
        let output = match discovered {
            Ok(output) => output,
            Err(e) => {
                debug!(repo = %repo, error = %e, "repository discovery failed");
                return None;
            }
        };
        let mut lines = output.stdout.lines();
        let git_dir = PathBuf::from(lines.next()?.trim());
        let bare = lines.next().map(str::trim) == Some("true");

        let work_tree = if bare {
            None
        } else {
            let output = self.inner.runner.run(&rev_parse(&["--show-toplevel"])).await.ok()?;
            Some(PathBuf::from(output.stdout.trim()))
        };

        let layout = GitLayout::from_git_dir(git_dir.clone());
        let handle = PooledHandle {
            id: self.inner.next_id.fetch_add(1, Ordering::Relaxed),
            state: ValidatedState {
                working_dir: repo.path().to_path_buf(),
                credential_fingerprint,
                config_mtime: config_mtime(&layout),
            },
            layout,
            context: ExecContext { git_dir, work_tree },
            last_used_at: Instant::now(),
            uses: 0,
        };
        self.inner.counters.created.fetch_add(1, Ordering::Relaxed);
        debug!(repo = %repo, handle = handle.id, "created pooled handle");
        Some(handle)
    }

    /// Disposes idle handles past the idle timeout. Returns how many went.
    pub fn prune_idle(&self) -> usize {
        let idle_timeout = self.inner.config.idle_timeout();
        let mut pruned = 0;
        for mut slot in self.inner.slots.iter_mut() {
            let before = slot.idle.len();
            slot.idle.retain(|handle| !handle.is_expired(idle_timeout));
            pruned += before - slot.idle.len();
        }
        self.inner
            .slots
            .retain(|_, slot| !slot.idle.is_empty() || slot.leased > 0);
        if pruned > 0 {
            self.inner
                .counters
                .discarded
                .fetch_add(pruned as u64, Ordering::Relaxed);
            debug!(pruned, "pruned idle pooled handles");
        }
        pruned
    }

    /// Drops every handle for `repo`. Leased handles are discarded on return.
    pub fn evict_repository(&self, repo: &RepoId) {
        if let Some((_, slot)) = self.inner.slots.remove(repo) {
            self.inner
                .counters
                .discarded
                .fetch_add(slot.idle.len() as u64, Ordering::Relaxed);
            debug!(repo = %repo, idle = slot.idle.len(), "evicted repository from pool");
        }
    }

    pub fn statistics(&self) -> PoolStatistics {
        let (idle_handles, leased_handles) = self
            .inner
            .slots
            .iter()
            .fold((0, 0), |(idle, leased), slot| {
                (idle + slot.idle.len(), leased + slot.leased)
            });
        let counters = &self.inner.counters;
        PoolStatistics {
            repositories: self.inner.slots.len(),
            idle_handles,
            leased_handles,
            created: counters.created.load(Ordering::Relaxed),
            reused: counters.reused.load(Ordering::Relaxed),
            discarded: counters.discarded.load(Ordering::Relaxed),
            fallbacks: counters.fallbacks.load(Ordering::Relaxed),
        }
    }
}

fn config_mtime(layout: &GitLayout) -> Option<SystemTime> {
    std::fs::metadata(layout.config_path())
        .and_then(|meta| meta.modified())
        .ok()
}

/// Failures that may come from a stale handle rather than from git itself.
fn is_handle_failure(err: &GitError) -> bool {
    matches!(err, GitError::CommandFailure { .. } | GitError::Io(_))
}
