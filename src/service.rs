//! `GitService`: the single entry point consumers use.
//!
//! Reads go cache first, then through the process pool wrapped in the lock
//! retry. Mutations run on a fresh process, wrapped in the same retry, and
//! invalidate the result cache before returning. The pool, both caches and
//! the change notifier are shared by every repository the service touches.

use std::hash::Hash;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::batch::{BatchExecutor, BatchOutcome};
use crate::cache::{
    CacheStatistics, CommandCache, CommitGraph, GraphCache, GraphKey, graph::GraphStatistics,
};
use crate::config::ServiceConfig;
use crate::error::{GitError, Result};
use crate::git::history::{self, HistoryView};
use crate::git::pool::{PoolStatistics, ProcessPool};
use crate::git::retry::{GitLayout, LockRetry};
use crate::git::{CommandOutput, GitCommand, Invocation, OperationClass, ProcessRunner, RepoId};
use crate::notifier::{
    ChangeCategory, ChangeEvent, ChangeNotifier, NotifierStatistics, RefreshHandler,
};

#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatistics {
    pub pool: PoolStatistics,
    pub cache: CacheStatistics,
    pub graphs: GraphStatistics,
    pub notifier: NotifierStatistics,
}

/// Everything a read needs, cheap to clone into spawned work.
#[derive(Clone)]
struct ReadPath {
    cache: CommandCache,
    pool: ProcessPool,
    retry: LockRetry,
}

impl ReadPath {
    async fn query(&self, invocation: Invocation) -> Result<Arc<str>> {
        let own_cancel = invocation.cancellation().cloned();
        let invocation = Arc::new(invocation);

        let result = self.query_once(Arc::clone(&invocation), own_cancel.as_ref()).await;
        match result {
            // a coalesced leader was cancelled; this caller was not
            Err(GitError::Cancelled) if !invocation.is_cancelled() => {
                debug!(command = %invocation.display(), "shared read was cancelled, retrying");
                self.query_once(invocation, own_cancel.as_ref()).await
            }
            other => other,
        }
    }

    async fn query_once(
        &self,
        invocation: Arc<Invocation>,
        own_cancel: Option<&CancellationToken>,
    ) -> Result<Arc<str>> {
        let repo = invocation.repo_id();
        let signature = invocation.signature();
        let classes = invocation.invalidating_classes();

        let this = self.clone();
        let read = self
            .cache
            .get_or_execute(&repo, &signature, &classes, move || async move {
                this.execute(&invocation).await.map(|output| output.stdout)
            });

        match own_cancel {
            Some(token) => tokio::select! {
                _ = token.cancelled() => Err(GitError::Cancelled),
                result = read => result,
            },
            None => read.await,
        }
    }

    /// Pool plus retry, bypassing the result cache.
    async fn execute(&self, invocation: &Invocation) -> Result<CommandOutput> {
        self.retry
            .run(invocation, || self.pool.run(invocation))
            .await
    }
}

struct Maintenance {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct GitService {
    config: ServiceConfig,
    runner: Arc<ProcessRunner>,
    reads: ReadPath,
    graphs: Arc<GraphCache>,
    batch: BatchExecutor,
    notifier: ChangeNotifier,
    maintenance: Mutex<Option<Maintenance>>,
}

impl GitService {
    pub fn new(config: ServiceConfig) -> Self {
        let runner = Arc::new(ProcessRunner::new(&config.runner));
        let cache = CommandCache::new(config.cache.clone());
        let pool = ProcessPool::new(Arc::clone(&runner), config.pool.clone());
        let reads = ReadPath {
            cache: cache.clone(),
            pool,
            retry: LockRetry::new(config.retry.clone()),
        };

        let invalidate = cache.clone();
        let handler: RefreshHandler = Arc::new(move |repo: &RepoId, category: ChangeCategory| {
            for class in category.invalidating_classes() {
                invalidate.invalidate(repo, *class);
            }
        });

        Self {
            graphs: Arc::new(GraphCache::new(&config.graph)),
            batch: BatchExecutor::new(config.batch.clone(), cache),
            notifier: ChangeNotifier::new(config.notifier.clone(), handler),
            maintenance: Mutex::new(None),
            runner,
            reads,
            config,
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// The resolved git executable.
    pub fn git_program(&self) -> &Path {
        self.runner.program()
    }

    /// Starts the change notifier and the maintenance sweeper. Must be
    /// called from within a tokio runtime.
    pub fn start(&self) {
        self.notifier.start();

        let mut maintenance = self.maintenance.lock();
        if maintenance.is_some() {
            return;
        }
        let cancel = CancellationToken::new();
        let task = tokio::spawn(sweep(
            self.reads.clone(),
            self.config.maintenance.interval(),
            cancel.clone(),
        ));
        *maintenance = Some(Maintenance { cancel, task });
        info!(
            git = %self.runner.program().display(),
            interval_secs = self.config.maintenance.interval_secs,
            "git service started"
        );
    }

    /// Stops background work and waits for it to finish.
    pub async fn shutdown(&self) {
        self.notifier.shutdown().await;
        let maintenance = self.maintenance.lock().take();
        if let Some(Maintenance { cancel, task }) = maintenance {
            cancel.cancel();
            if let Err(e) = task.await {
                error!(error = %e, "maintenance task failed");
            }
        }
        info!("git service stopped");
    }

    /// Resolves a path to a repository identity, checking that it is inside
    /// a git repository.
    pub fn open(&self, path: &Path) -> Result<RepoId> {
        if !path.exists() {
            return Err(GitError::RepoNotFound(path.display().to_string()));
        }
        if !path.is_dir() {
            return Err(GitError::InvalidPath(format!(
                "{} is not a directory",
                path.display()
            )));
        }
        let repo = RepoId::new(path);
        GitLayout::discover(repo.path())
            .ok_or_else(|| GitError::RepoNotFound(path.display().to_string()))?;
        Ok(repo)
    }

    /// Runs a read-only command, answering from cache when possible.
    pub async fn query(&self, invocation: Invocation) -> Result<Arc<str>> {
        if invocation.command().is_mutating() {
            return Err(GitError::InvalidArgument(format!(
                "{} mutates the repository; use mutate",
                invocation.display()
            )));
        }
        if invocation.is_cancelled() {
            return Err(GitError::Cancelled);
        }
        self.reads.query(invocation).await
    }

    /// Runs independent reads, cache hits first, misses with bounded
    /// parallelism. Every key gets a result or a failure.
    pub async fn batch_query<K>(&self, requests: Vec<(K, Invocation)>) -> BatchOutcome<K>
    where
        K: Hash + Eq + Clone + Send + 'static,
    {
        let reads = self.reads.clone();
        self.batch
            .execute(requests, move |invocation| {
                let reads = reads.clone();
                async move {
                    if invocation.is_cancelled() {
                        return Err(GitError::Cancelled);
                    }
                    reads.query(invocation).await
                }
            })
            .await
    }

    /// Runs a mutating command. Cached reads the mutation makes stale are
    /// dropped before this returns, whether or not git succeeded. Mutations
    /// must not be cancelled once started.
    pub async fn mutate(&self, invocation: Invocation) -> Result<CommandOutput> {
        let Some(class) = invocation.command().operation_class() else {
            return Err(GitError::InvalidArgument(format!(
                "{} is read-only; use query",
                invocation.display()
            )));
        };
        let repo = invocation.repo_id();

        let result = self
            .reads
            .retry
            .run(&invocation, || self.runner.run(&invocation))
            .await;

        // a failed merge or rebase can still have moved refs
        if !matches!(result, Err(GitError::StartFailure { .. } | GitError::InvalidPath(_))) {
            self.invalidate(&repo, class);
            for category in ChangeCategory::touched_by(class) {
                self.notifier.mark_dirty(&repo, *category);
            }
        }
        result
    }

    pub fn invalidate(&self, repo: &RepoId, class: OperationClass) -> usize {
        self.reads.cache.invalidate(repo, class)
    }

    pub fn mark_dirty(&self, repo: &RepoId, category: ChangeCategory) {
        self.notifier.mark_dirty(repo, category);
    }

    /// Parsed history for `view`, built once per tip and commit count and
    /// shared between concurrent callers.
    pub async fn commit_graph(&self, repo: &RepoId, view: HistoryView) -> Result<Arc<CommitGraph>> {
        let tip = self.history_tip(repo, view).await?;
        let commit_count = match tip {
            Some(_) => self.commit_count(repo, view).await?,
            None => 0,
        };
        let key = GraphKey {
            repo: repo.clone(),
            tip: tip.clone().unwrap_or_default(),
            commit_count,
            view,
        };
        let reads = self.reads.clone();
        let working_dir = repo.path().to_path_buf();
        self.graphs
            .get_or_build(key, move || async move {
                let Some(tip) = tip else {
                    return Ok(CommitGraph::build(String::new(), Vec::new()));
                };
                let invocation = history::log_invocation(&working_dir, view, None);
                let output = reads.execute(&invocation).await?;
                Ok(CommitGraph::build(tip, history::parse_log(&output.stdout)?))
            })
            .await
    }

    /// Commits reachable in `view`; changes without the tip moving when a
    /// shallow clone is deepened.
    async fn commit_count(&self, repo: &RepoId, view: HistoryView) -> Result<usize> {
        let count = self
            .query(history::count_invocation(repo.path(), view))
            .await?;
        count
            .trim()
            .parse()
            .map_err(|e| GitError::Parse(format!("rev-list count {:?}: {e}", count.trim())))
    }

    /// HEAD's oid, or a digest of every ref tip for all-branch views. `None`
    /// when there is nothing to walk.
    async fn history_tip(&self, repo: &RepoId, view: HistoryView) -> Result<Option<String>> {
        if view.all_branches {
            let refs = self
                .query(
                    Invocation::new(repo.path(), GitCommand::ForEachRef)
                        .arg("--format=%(objectname) %(refname)"),
                )
                .await?;
            if refs.trim().is_empty() {
                return Ok(None);
            }
            return Ok(Some(hex::encode(Sha256::digest(refs.as_bytes()))));
        }

        let head = self
            .query(Invocation::new(repo.path(), GitCommand::RevParse).args([
                "--verify",
                "--quiet",
                "HEAD^{commit}",
            ]))
            .await;
        match head {
            Ok(oid) => Ok(Some(oid.trim().to_string())),
            // unborn branch
            Err(GitError::CommandFailure {
                exit_code: Some(1), ..
            }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Registers a filesystem watcher on the repository's git directory.
    pub fn watch(&self, repo: &RepoId) -> Result<()> {
        self.notifier.watch(repo)
    }

    /// Drops everything held for `repo`: pooled handles, cached results,
    /// commit graphs and its watcher.
    pub fn close_repository(&self, repo: &RepoId) {
        self.reads.pool.evict_repository(repo);
        let results = self.reads.cache.evict_repository(repo);
        let graphs = self.graphs.evict_repository(repo);
        self.notifier.unwatch(repo);
        info!(repo = %repo, results, graphs, "repository closed");
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.notifier.subscribe()
    }

    pub fn statistics(&self) -> ServiceStatistics {
        ServiceStatistics {
            pool: self.reads.pool.statistics(),
            cache: self.reads.cache.statistics(),
            graphs: self.graphs.statistics(),
            notifier: self.notifier.statistics(),
        }
    }
}

/// Periodically disposes idle pooled handles and expired cache entries.
async fn sweep(reads: ReadPath, interval: std::time::Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let handles = reads.pool.prune_idle();
                let results = reads.cache.purge_expired();
                if handles > 0 || results > 0 {
                    debug!(handles, results, "maintenance sweep");
                }
            }
        }
    }
}
