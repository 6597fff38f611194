//! Debounced change notification.
//!
//! Filesystem events under a repository's git directory and programmatic
//! `mark_dirty` calls land in one channel. A single background task keeps a
//! pending category set per repository; every new event pushes that
//! repository's deadline out by the debounce window. When a window elapses,
//! one refresh fires per pending category: the handler runs (cache
//! invalidation) and the change is broadcast to subscribers.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::{GitError, Result};
use crate::git::{OperationClass, RepoId};
use crate::git::retry::GitLayout;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChangeCategory {
    Head,
    Branches,
    Tags,
    Remotes,
    Index,
    WorkingTree,
    Stash,
    Config,
}

use ChangeCategory as Cat;
use OperationClass as Op;

impl ChangeCategory {
    pub const ALL: [ChangeCategory; 8] = [
        Cat::Head,
        Cat::Branches,
        Cat::Tags,
        Cat::Remotes,
        Cat::Index,
        Cat::WorkingTree,
        Cat::Stash,
        Cat::Config,
    ];

    /// Operation classes whose cached reads a change in this category makes
    /// stale.
    pub fn invalidating_classes(self) -> &'static [OperationClass] {
        match self {
            Cat::Head => &[Op::Checkout, Op::Commit, Op::Reset],
            Cat::Branches => &[Op::BranchCreate, Op::BranchDelete, Op::BranchRename, Op::Commit],
            Cat::Tags => &[Op::Tag],
            Cat::Remotes => &[Op::Fetch, Op::RemoteChange],
            Cat::Index | Cat::WorkingTree => &[Op::Stage],
            Cat::Stash => &[Op::Stash],
            Cat::Config => &[Op::ConfigChange],
        }
    }

    /// Categories a completed mutation of `class` touches.
    pub fn touched_by(class: OperationClass) -> &'static [ChangeCategory] {
        match class {
            Op::Stage => &[Cat::Index, Cat::WorkingTree],
            Op::Commit => &[Cat::Head, Cat::Branches, Cat::Index],
            Op::Checkout => &[Cat::Head, Cat::Index, Cat::WorkingTree],
            Op::BranchCreate | Op::BranchDelete | Op::BranchRename => &[Cat::Branches],
            Op::Merge | Op::Rebase | Op::Reset | Op::Pull => {
                &[Cat::Head, Cat::Branches, Cat::Index, Cat::WorkingTree]
            }
            Op::Stash => &[Cat::Stash, Cat::Index, Cat::WorkingTree],
            Op::Tag => &[Cat::Tags],
            Op::ConfigChange => &[Cat::Config],
            Op::RemoteChange => &[Cat::Remotes, Cat::Config],
            Op::Fetch | Op::Push => &[Cat::Remotes],
            Op::Worktree => &[Cat::Head, Cat::WorkingTree],
            Op::RepositoryCreate => &Self::ALL,
        }
    }
}

impl std::fmt::Display for ChangeCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Cat::Head => "head",
            Cat::Branches => "branches",
            Cat::Tags => "tags",
            Cat::Remotes => "remotes",
            Cat::Index => "index",
            Cat::WorkingTree => "working-tree",
            Cat::Stash => "stash",
            Cat::Config => "config",
        };
        f.write_str(name)
    }
}

/// Classifies a path reported by the filesystem watcher. `git_dirs` are the
/// metadata directories of one repository; anything outside them is the
/// working tree. Lock files and object writes yield nothing.
pub fn categories_for_path(git_dirs: &[&Path], path: &Path) -> &'static [ChangeCategory] {
    if path.extension().is_some_and(|ext| ext == "lock") {
        return &[];
    }
    let Some(relative) = git_dirs.iter().find_map(|dir| path.strip_prefix(dir).ok()) else {
        return &[Cat::WorkingTree];
    };

    let mut components = relative.components().map(|c| c.as_os_str().to_string_lossy());
    let first = components.next().unwrap_or_default();
    let second = components.next().unwrap_or_default();
    match (&*first, &*second) {
        ("HEAD" | "ORIG_HEAD" | "MERGE_HEAD" | "CHERRY_PICK_HEAD" | "REVERT_HEAD", _) => &[Cat::Head],
        ("rebase-merge" | "rebase-apply", _) => &[Cat::Head],
        ("FETCH_HEAD", _) => &[Cat::Remotes],
        ("index", _) => &[Cat::Index],
        ("config", _) => &[Cat::Config],
        ("packed-refs", _) => &[Cat::Branches, Cat::Tags, Cat::Remotes],
        ("refs", "heads") => &[Cat::Branches],
        ("refs", "tags") => &[Cat::Tags],
        ("refs", "remotes") => &[Cat::Remotes],
        ("refs", "stash") => &[Cat::Stash],
        // reflogs and objects always accompany a ref or index write
        _ => &[],
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifierConfig {
    pub debounce_ms: u64,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self { debounce_ms: 300 }
    }
}

impl NotifierConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

/// One fired refresh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangeEvent {
    pub repo: RepoId,
    pub category: ChangeCategory,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct NotifierStatistics {
    pub watched_repositories: usize,
    pub events_received: u64,
    pub refreshes_fired: u64,
    pub running: bool,
}

/// Runs once per fired refresh, before subscribers hear about it.
pub type RefreshHandler = Arc<dyn Fn(&RepoId, ChangeCategory) + Send + Sync>;

type Signal = (RepoId, ChangeCategory);

struct Counters {
    received: AtomicU64,
    fired: AtomicU64,
}

struct Background {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct ChangeNotifier {
    config: NotifierConfig,
    signals: mpsc::UnboundedSender<Signal>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<Signal>>>,
    events: broadcast::Sender<ChangeEvent>,
    handler: RefreshHandler,
    watchers: DashMap<RepoId, RecommendedWatcher>,
    background: Mutex<Option<Background>>,
    counters: Arc<Counters>,
}

impl ChangeNotifier {
    pub fn new(config: NotifierConfig, handler: RefreshHandler) -> Self {
        let (signals, receiver) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(256);
        Self {
            config,
            signals,
            receiver: Mutex::new(Some(receiver)),
            events,
            handler,
            watchers: DashMap::new(),
            background: Mutex::new(None),
            counters: Arc::new(Counters {
                received: AtomicU64::new(0),
                fired: AtomicU64::new(0),
            }),
        }
    }

    /// Spawns the debounce task. Must be called from within a tokio runtime.
    /// Calling it again, or after `shutdown`, does nothing.
    pub fn start(&self) {
        let Some(receiver) = self.receiver.lock().take() else {
            return;
        };
        let cancel = CancellationToken::new();
        let task = tokio::spawn(debounce_loop(
            receiver,
            self.config.debounce(),
            Arc::clone(&self.handler),
            self.events.clone(),
            Arc::clone(&self.counters),
            cancel.clone(),
        ));
        *self.background.lock() = Some(Background { cancel, task });
        debug!(debounce_ms = self.config.debounce_ms, "change notifier started");
    }

    /// Stops watching every repository and waits for the debounce task.
    /// Pending, not yet fired changes are dropped.
    pub async fn shutdown(&self) {
        self.watchers.clear();
        let background = self.background.lock().take();
        if let Some(Background { cancel, task }) = background {
            cancel.cancel();
            if let Err(e) = task.await {
                error!(error = %e, "change notifier task failed");
            }
        }
    }

    /// Feeds a change into the debounce window as if it had been observed
    /// on disk.
    pub fn mark_dirty(&self, repo: &RepoId, category: ChangeCategory) {
        if self.signals.send((repo.clone(), category)).is_err() {
            debug!(repo = %repo, %category, "notifier stopped, change dropped");
        }
    }

    /// Starts watching the git metadata of `repo`. Watching an already
    /// watched repository replaces its watcher.
    pub fn watch(&self, repo: &RepoId) -> Result<()> {
        let layout = GitLayout::discover(repo.path())
            .ok_or_else(|| GitError::RepoNotFound(repo.to_string()))?;
        let mut dirs: Vec<PathBuf> = vec![canonical(&layout.git_dir)];
        let common = canonical(&layout.common_dir);
        if common != dirs[0] {
            dirs.push(common);
        }

        let signals = self.signals.clone();
        let target = repo.clone();
        let roots = dirs.clone();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let event = match res {
                Ok(event) => event,
                Err(e) => {
                    error!(repo = %target, error = %e, "watch error");
                    return;
                }
            };
            if matches!(event.kind, EventKind::Access(_)) {
                return;
            }
            let roots: Vec<&Path> = roots.iter().map(PathBuf::as_path).collect();
            let mut seen = BTreeSet::new();
            for path in &event.paths {
                seen.extend(categories_for_path(&roots, path).iter().copied());
            }
            for category in seen {
                let _ = signals.send((target.clone(), category));
            }
        })
        .map_err(|e| GitError::Internal(format!("failed to create watcher: {e}")))?;

        for dir in &dirs {
            watcher
                .watch(dir, RecursiveMode::Recursive)
                .map_err(|e| GitError::Internal(format!("failed to watch {}: {e}", dir.display())))?;
        }
        self.watchers.insert(repo.clone(), watcher);
        info!(repo = %repo, git_dir = %dirs[0].display(), "watching repository");
        Ok(())
    }

    pub fn unwatch(&self, repo: &RepoId) -> bool {
        self.watchers.remove(repo).is_some()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.events.subscribe()
    }

    pub fn statistics(&self) -> NotifierStatistics {
        NotifierStatistics {
            watched_repositories: self.watchers.len(),
            events_received: self.counters.received.load(Ordering::Relaxed),
            refreshes_fired: self.counters.fired.load(Ordering::Relaxed),
            running: self.background.lock().is_some(),
        }
    }
}

fn canonical(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

struct Pending {
    categories: BTreeSet<ChangeCategory>,
    deadline: Instant,
}

async fn debounce_loop(
    mut receiver: mpsc::UnboundedReceiver<Signal>,
    window: Duration,
    handler: RefreshHandler,
    events: broadcast::Sender<ChangeEvent>,
    counters: Arc<Counters>,
    cancel: CancellationToken,
) {
    let mut pending: HashMap<RepoId, Pending> = HashMap::new();

    loop {
        let next_deadline = pending.values().map(|p| p.deadline).min();
        let window_elapsed = async {
            match next_deadline {
                Some(deadline) => sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => break,
            signal = receiver.recv() => {
                let Some((repo, category)) = signal else { break };
                counters.received.fetch_add(1, Ordering::Relaxed);
                let deadline = Instant::now() + window;
                let entry = pending.entry(repo).or_insert_with(|| Pending {
                    categories: BTreeSet::new(),
                    deadline,
                });
                entry.categories.insert(category);
                entry.deadline = deadline;
            }
            _ = window_elapsed => {
                let now = Instant::now();
                let due: Vec<RepoId> = pending
                    .iter()
                    .filter(|(_, p)| p.deadline <= now)
                    .map(|(repo, _)| repo.clone())
                    .collect();
                for repo in due {
                    if let Some(Pending { categories, .. }) = pending.remove(&repo) {
                        fire(&repo, categories, &handler, &events, &counters);
                    }
                }
            }
        }
    }
    debug!(dropped = pending.len(), "change notifier stopped");
}

fn fire(
    repo: &RepoId,
    categories: BTreeSet<ChangeCategory>,
    handler: &RefreshHandler,
    events: &broadcast::Sender<ChangeEvent>,
    counters: &Counters,
) {
    for category in categories {
        handler(repo, category);
        counters.fired.fetch_add(1, Ordering::Relaxed);
        info!(repo = %repo, %category, "refresh fired");
        // no subscribers is fine
        let _ = events.send(ChangeEvent {
            repo: repo.clone(),
            category,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recording_notifier(debounce_ms: u64) -> (ChangeNotifier, Arc<Mutex<Vec<ChangeEvent>>>) {
        let fired = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&fired);
        let handler: RefreshHandler = Arc::new(move |repo: &RepoId, category| {
            sink.lock().push(ChangeEvent {
                repo: repo.clone(),
                category,
            });
        });
        (ChangeNotifier::new(NotifierConfig { debounce_ms }, handler), fired)
    }

    #[test]
    fn test_path_classification() {
        let git_dir = Path::new("/work/repo/.git");
        let dirs = [git_dir];
        let classify = |rel: &str| categories_for_path(&dirs, &git_dir.join(rel));

        assert_eq!(classify("HEAD"), &[Cat::Head]);
        assert_eq!(classify("index"), &[Cat::Index]);
        assert_eq!(classify("config"), &[Cat::Config]);
        assert_eq!(classify("refs/heads/feature/x"), &[Cat::Branches]);
        assert_eq!(classify("refs/tags/v1"), &[Cat::Tags]);
        assert_eq!(classify("refs/remotes/origin/main"), &[Cat::Remotes]);
        assert_eq!(classify("refs/stash"), &[Cat::Stash]);
        assert_eq!(classify("packed-refs").len(), 3);
        assert!(classify("index.lock").is_empty());
        assert!(classify("refs/heads/main.lock").is_empty());
        assert!(classify("objects/ab/cdef").is_empty());
        assert!(classify("logs/HEAD").is_empty());
        assert_eq!(
            categories_for_path(&dirs, Path::new("/work/repo/src/main.rs")),
            &[Cat::WorkingTree]
        );
    }

    #[test]
    fn test_every_class_touches_something() {
        for class in OperationClass::ALL {
            assert!(!ChangeCategory::touched_by(class).is_empty(), "{class}");
        }
        for category in ChangeCategory::ALL {
            assert!(!category.invalidating_classes().is_empty(), "{category}");
        }
    }

    #[tokio::test]
    async fn test_burst_fires_one_refresh() {
        let (notifier, fired) = recording_notifier(50);
        notifier.start();
        let repo = RepoId::new("/nonexistent/repo");

        for _ in 0..25 {
            notifier.mark_dirty(&repo, Cat::Branches);
        }
        tokio::time::sleep(Duration::from_millis(250)).await;

        assert_eq!(fired.lock().len(), 1);
        let stats = notifier.statistics();
        assert_eq!(stats.events_received, 25);
        assert_eq!(stats.refreshes_fired, 1);
        notifier.shutdown().await;
    }

    #[tokio::test]
    async fn test_window_resets_on_each_event() {
        let (notifier, fired) = recording_notifier(150);
        notifier.start();
        let repo = RepoId::new("/nonexistent/repo");

        for _ in 0..4 {
            notifier.mark_dirty(&repo, Cat::Head);
            tokio::time::sleep(Duration::from_millis(60)).await;
        }
        // 240 ms of activity, yet each gap was shorter than the window
        assert!(fired.lock().is_empty());

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(fired.lock().len(), 1);
        notifier.shutdown().await;
    }

    #[tokio::test]
    async fn test_one_refresh_per_category_and_repo() {
        let (notifier, fired) = recording_notifier(40);
        let mut events = notifier.subscribe();
        notifier.start();
        let a = RepoId::new("/nonexistent/a");
        let b = RepoId::new("/nonexistent/b");

        notifier.mark_dirty(&a, Cat::Index);
        notifier.mark_dirty(&a, Cat::WorkingTree);
        notifier.mark_dirty(&a, Cat::Index);
        notifier.mark_dirty(&b, Cat::Index);
        tokio::time::sleep(Duration::from_millis(200)).await;

        let fired = fired.lock().clone();
        assert_eq!(fired.len(), 3);
        assert_eq!(fired.iter().filter(|e| e.repo == a).count(), 2);

        let mut broadcast = Vec::new();
        while let Ok(event) = events.try_recv() {
            broadcast.push(event);
        }
        assert_eq!(broadcast.len(), 3);
        notifier.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_stops_loop() {
        let (notifier, fired) = recording_notifier(20);
        notifier.start();
        assert!(notifier.statistics().running);
        notifier.shutdown().await;
        assert!(!notifier.statistics().running);

        notifier.mark_dirty(&RepoId::new("/nonexistent/repo"), Cat::Head);
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(fired.lock().is_empty());
    }

    #[tokio::test]
    async fn test_watch_classifies_ref_writes() {
        let dir = tempfile::tempdir().unwrap();
        let git_dir = dir.path().join(".git");
        std::fs::create_dir_all(git_dir.join("refs/heads")).unwrap();
        std::fs::create_dir_all(git_dir.join("objects")).unwrap();
        std::fs::write(git_dir.join("HEAD"), "ref: refs/heads/main\n").unwrap();

        let (notifier, _) = recording_notifier(50);
        let mut events = notifier.subscribe();
        notifier.start();
        let repo = RepoId::new(dir.path());
        notifier.watch(&repo).unwrap();
        assert_eq!(notifier.statistics().watched_repositories, 1);

        std::fs::write(git_dir.join("refs/heads/main.lock"), "x").unwrap();
        std::fs::write(git_dir.join("refs/heads/main"), "0000000000000000000000000000000000000000\n")
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("refresh within timeout")
            .unwrap();
        assert_eq!(event.category, Cat::Branches);
        assert_eq!(event.repo, repo);

        assert!(notifier.unwatch(&repo));
        notifier.shutdown().await;
    }
}
