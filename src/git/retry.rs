//! Lock-aware retry with exponential backoff.
//!
//! Before every attempt the repository's lock files are inspected directly.
//! Abandoned locks (older than the staleness threshold) are removed without
//! consuming an attempt; active ones, and failures git reports as lock
//! contention, are waited out with capped exponential backoff.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use walkdir::WalkDir;

use super::invocation::Invocation;
use crate::error::{GitError, Result};

/// Lock files git takes directly under the git directory.
const FIXED_LOCKS: &[&str] = &[
    "index.lock",
    "HEAD.lock",
    "ORIG_HEAD.lock",
    "config.lock",
    "packed-refs.lock",
    "shallow.lock",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Locks older than this are treated as left behind by a crashed process.
    pub stale_lock_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 100,
            max_delay_ms: 5_000,
            stale_lock_secs: 600,
        }
    }
}

impl RetryPolicy {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_lock_secs)
    }
}

/// Where a working directory keeps its git metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitLayout {
    /// Per-worktree git directory (holds `index`, `HEAD`).
    pub git_dir: PathBuf,
    /// Shared directory (holds `config`, `refs`, `packed-refs`). Same as
    /// `git_dir` outside linked worktrees.
    pub common_dir: PathBuf,
}

impl GitLayout {
    /// Walks up from `start` the way git's own discovery does, without
    /// spawning git.
    pub fn discover(start: &Path) -> Option<GitLayout> {
        Self::locate(start).map(|(_, layout)| layout)
    }

    /// Like `discover`, also returning the repository root: the work-tree
    /// top level, or the git directory itself for a bare repository.
    pub fn locate(start: &Path) -> Option<(PathBuf, GitLayout)> {
        for dir in start.ancestors() {
            let dot_git = dir.join(".git");
            let git_dir = if dot_git.is_dir() {
                Some(dot_git)
            } else if dot_git.is_file() {
                read_gitdir_file(&dot_git, dir)
            } else if looks_bare(dir) {
                Some(dir.to_path_buf())
            } else {
                None
            };
            if let Some(git_dir) = git_dir {
                return Some((dir.to_path_buf(), Self::from_git_dir(git_dir)));
            }
        }
        None
    }

    pub fn from_git_dir(git_dir: PathBuf) -> GitLayout {
        let common_dir = std::fs::read_to_string(git_dir.join("commondir"))
            .ok()
            .map(|raw| {
                let raw = PathBuf::from(raw.trim());
                if raw.is_absolute() { raw } else { git_dir.join(raw) }
            })
            .unwrap_or_else(|| git_dir.clone());
        GitLayout { git_dir, common_dir }
    }

    pub fn config_path(&self) -> PathBuf {
        self.common_dir.join("config")
    }

    /// Every lock file currently present.
    pub fn lock_files(&self) -> Vec<PathBuf> {
        let mut locks: Vec<PathBuf> = FIXED_LOCKS
            .iter()
            .flat_map(|name| [self.git_dir.join(name), self.common_dir.join(name)])
            .filter(|path| path.is_file())
            .collect();
        locks.sort();
        locks.dedup();

        let refs = self.common_dir.join("refs");
        locks.extend(
            WalkDir::new(&refs)
                .into_iter()
                .filter_map(|entry| entry.ok())
                .filter(|entry| entry.file_type().is_file())
                .filter(|entry| entry.path().extension().is_some_and(|ext| ext == "lock"))
                .map(|entry| entry.into_path()),
        );
        locks
    }

    /// First lock file still held by a live process. Stale locks found on
    /// the way are deleted; a stale lock that cannot be deleted counts as
    /// active.
    pub fn active_lock(&self, stale_after: Duration) -> Option<PathBuf> {
        for lock in self.lock_files() {
            if !is_stale(&lock, stale_after) {
                return Some(lock);
            }
            match std::fs::remove_file(&lock) {
                Ok(()) => warn!(lock = %lock.display(), "removed stale git lock"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(lock = %lock.display(), error = %e, "failed to remove stale git lock");
                    return Some(lock);
                }
            }
        }
        None
    }
}

fn read_gitdir_file(dot_git: &Path, worktree: &Path) -> Option<PathBuf> {
    let content = std::fs::read_to_string(dot_git).ok()?;
    let target = content.trim().strip_prefix("gitdir:")?.trim();
    let target = PathBuf::from(target);
    Some(if target.is_absolute() {
        target
    } else {
        worktree.join(target)
    })
}

fn looks_bare(dir: &Path) -> bool {
    dir.join("HEAD").is_file() && dir.join("objects").is_dir() && dir.join("refs").is_dir()
}

/// `GitLayout::active_lock` off the async executor; it walks `refs/`.
async fn held_lock(layout: GitLayout, stale_after: Duration) -> Option<PathBuf> {
    tokio::task::spawn_blocking(move || layout.active_lock(stale_after))
        .await
        .ok()
        .flatten()
}

fn is_stale(lock: &Path, stale_after: Duration) -> bool {
    std::fs::metadata(lock)
        .and_then(|meta| meta.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .is_some_and(|age| age > stale_after)
}

/// Runs an operation, waiting out lock contention.
#[derive(Debug, Clone, Default)]
pub struct LockRetry {
    policy: RetryPolicy,
}

impl LockRetry {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Non-contention errors return immediately. After the last attempt the
    /// contention error is surfaced as-is.
    pub async fn run<T, F, Fut>(&self, invocation: &Invocation, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let working_dir = invocation.working_dir().to_path_buf();
        let layout = tokio::task::spawn_blocking(move || GitLayout::discover(&working_dir))
            .await
            .ok()
            .flatten();
        let max_attempts = self.policy.max_attempts.max(1);
        let mut delay = self.policy.initial_delay();
        let mut attempt = 0;

        loop {
            attempt += 1;

            let held = match &layout {
                Some(layout) => held_lock(layout.clone(), self.policy.stale_after()).await,
                None => None,
            };
            let result = match held {
                Some(lock) => Err(GitError::LockContention {
                    message: format!("lock file {} is held", lock.display()),
                }),
                None => operation().await,
            };

            match result {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_contention() => return Err(e),
                Err(e) if attempt >= max_attempts => {
                    debug!(command = %invocation.display(), attempts = attempt, "lock retries exhausted");
                    return Err(e);
                }
                Err(e) => {
                    debug!(
                        command = %invocation.display(),
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "lock contention, backing off"
                    );
                    self.backoff(invocation, delay).await?;
                    delay = (delay * 2).min(self.policy.max_delay());
                }
            }
        }
    }

    async fn backoff(&self, invocation: &Invocation, delay: Duration) -> Result<()> {
        match invocation.cancellation() {
            Some(token) => tokio::select! {
                _ = token.cancelled() => Err(GitError::Cancelled),
                _ = tokio::time::sleep(delay) => Ok(()),
            },
            None => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
        }
    }
}
