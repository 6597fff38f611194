//! Commit graph cache for fast history queries.
//!
//! A history walk is parsed once into a `CommitGraph`; author filtering,
//! pagination and contributor lists are then answered in memory. Graphs are
//! keyed by the tip they were built from and its commit count, so a moved
//! HEAD or a deepened shallow clone simply misses. Closing a repository
//! bumps its epoch; builds started earlier are returned but not stored.
//!
//! Used by: `Repository::commits()`

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::bounded::{BoundedCache, BoundedStats};
use super::flight::SingleFlight;
use crate::error::{GitError, Result};
use crate::git::RepoId;
use crate::git::history::{HistoryView, LogCommit};
use crate::models::{AuthorInfo, CommitDetail, CommitListResponse, ContributorInfo};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    pub max_items: usize,
    pub max_memory_bytes: usize,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            max_items: 32,
            max_memory_bytes: 256 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GraphKey {
    pub repo: RepoId,
    /// HEAD oid, or a digest of every ref tip for all-branch views.
    pub tip: String,
    pub commit_count: usize,
    pub view: HistoryView,
}

/// Parsed history, newest first.
pub struct CommitGraph {
    pub tip: String,
    commits: Vec<LogCommit>,
    /// oid -> position in `commits`
    index: HashMap<String, usize>,
    /// Sorted by commit count, descending
    contributors: Vec<ContributorInfo>,
    size_bytes: usize,
    pub built_at: Instant,
}

impl CommitGraph {
    pub fn build(tip: String, commits: Vec<LogCommit>) -> Self {
        let index = commits
            .iter()
            .enumerate()
            .map(|(idx, commit)| (commit.oid.clone(), idx))
            .collect();

        let mut contributor_map: HashMap<&str, (&str, usize)> = HashMap::new();
        for commit in &commits {
            contributor_map
                .entry(commit.author_email.as_str())
                .and_modify(|(_, count)| *count += 1)
                .or_insert((commit.author_name.as_str(), 1));
        }
        let mut contributors: Vec<ContributorInfo> = contributor_map
            .into_iter()
            .map(|(email, (name, count))| ContributorInfo {
                name: name.to_string(),
                email: email.to_string(),
                commit_count: count,
            })
            .collect();
        contributors.sort_by(|a, b| {
            b.commit_count
                .cmp(&a.commit_count)
                .then_with(|| a.email.cmp(&b.email))
        });

        let size_bytes = std::mem::size_of::<Self>()
            + tip.len()
            + commits.iter().map(LogCommit::approx_size).sum::<usize>()
            + commits.iter().map(|c| c.oid.len() + 32).sum::<usize>()
            + contributors
                .iter()
                .map(|c| std::mem::size_of::<ContributorInfo>() + c.name.len() + c.email.len())
                .sum::<usize>();

        Self {
            tip,
            commits,
            index,
            contributors,
            size_bytes,
            built_at: Instant::now(),
        }
    }

    pub fn len(&self) -> usize {
        self.commits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commits.is_empty()
    }

    pub fn get(&self, oid: &str) -> Option<&LogCommit> {
        self.index.get(oid).map(|&idx| &self.commits[idx])
    }

    pub fn head(&self) -> Option<&LogCommit> {
        self.commits.first()
    }

    pub fn contributors(&self) -> &[ContributorInfo] {
        &self.contributors
    }

    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    /// Filtering and pagination, all in memory.
    pub fn query(
        &self,
        limit: usize,
        offset: usize,
        exclude_authors: Option<&[String]>,
    ) -> CommitListResponse {
        let exclude_set: HashSet<&str> = exclude_authors
            .map(|authors| authors.iter().map(String::as_str).collect())
            .unwrap_or_default();

        let total = self.commits.len();

        let filtered: Vec<&LogCommit> = self
            .commits
            .iter()
            .filter(|commit| !exclude_set.contains(commit.author_email.as_str()))
            .collect();
        let filtered_total = filtered.len();

        let commits: Vec<CommitDetail> = filtered
            .iter()
            .skip(offset)
            .take(limit)
            .map(|commit| commit.to_commit_detail())
            .collect();

        let contributors = self
            .contributors
            .iter()
            .map(|c| AuthorInfo {
                name: c.name.clone(),
                email: c.email.clone(),
            })
            .collect();

        CommitListResponse {
            commits,
            total,
            filtered_total,
            has_more: filtered_total > offset + limit,
            contributors,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GraphStatistics {
    #[serde(flatten)]
    pub cache: BoundedStats,
    pub builds_in_flight: usize,
}

/// Memory-bounded LRU of commit graphs with single-flight builds.
pub struct GraphCache {
    graphs: Arc<BoundedCache<GraphKey, Arc<CommitGraph>>>,
    epochs: Arc<DashMap<RepoId, u64>>,
    builds: SingleFlight<(GraphKey, u64), Arc<CommitGraph>>,
}

impl GraphCache {
    pub fn new(config: &GraphConfig) -> Self {
        Self {
            graphs: Arc::new(BoundedCache::new(
                config.max_items,
                config.max_memory_bytes,
                Arc::new(|graph: &Arc<CommitGraph>| graph.size_bytes()),
            )),
            epochs: Arc::new(DashMap::new()),
            builds: SingleFlight::new(),
        }
    }

    pub fn get(&self, key: &GraphKey) -> Option<Arc<CommitGraph>> {
        self.graphs.get(key)
    }

    /// Cached graph, or the one `build` produces. Concurrent callers for the
    /// same key share a single build.
    pub async fn get_or_build<F, Fut>(&self, key: GraphKey, build: F) -> Result<Arc<CommitGraph>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<CommitGraph>> + Send + 'static,
    {
        if let Some(graph) = self.graphs.get(&key) {
            return Ok(graph);
        }

        let epoch = *self.epochs.entry(key.repo.clone()).or_insert(0);
        let graphs = Arc::clone(&self.graphs);
        let epochs = Arc::clone(&self.epochs);
        let store_key = key.clone();
        let (flight, _) = self.builds.run((key, epoch), move || async move {
            let start = Instant::now();
            let graph = Arc::new(build().await?);
            info!(
                repo = %store_key.repo,
                commits = graph.len(),
                size_bytes = graph.size_bytes(),
                elapsed_ms = start.elapsed().as_millis() as u64,
                "commit graph built"
            );
            // Lock order: epochs, then graphs, as in `evict_repository`.
            let current = epochs.get(&store_key.repo);
            if current.as_deref() == Some(&epoch) {
                graphs.set(store_key, Arc::clone(&graph));
            } else {
                debug!(repo = %store_key.repo, "repository closed during build, not stored");
            }
            Ok::<_, GitError>(graph)
        });
        flight.await
    }

    /// Closing a repository drops its graphs.
    pub fn evict_repository(&self, repo: &RepoId) -> usize {
        let mut epoch = self.epochs.entry(repo.clone()).or_insert(0);
        *epoch += 1;
        let removed = self.graphs.retain(|key, _| &key.repo != repo);
        drop(epoch);
        removed
    }

    pub fn trim_excess(&self) -> usize {
        self.graphs.trim_excess()
    }

    pub fn clear(&self) {
        self.graphs.clear();
    }

    pub fn statistics(&self) -> GraphStatistics {
        GraphStatistics {
            cache: self.graphs.statistics(),
            builds_in_flight: self.builds.in_flight(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn commit(oid: &str, email: &str, parents: &[&str]) -> LogCommit {
        LogCommit {
            oid: oid.to_string(),
            message: format!("commit {oid}"),
            author_name: email.split('@').next().unwrap_or("").to_string(),
            author_email: email.to_string(),
            committer_name: "c".to_string(),
            committer_email: "c@example.com".to_string(),
            timestamp: 1_700_000_000,
            parents: parents.iter().map(|p| p.to_string()).collect(),
        }
    }

    fn sample_graph() -> CommitGraph {
        CommitGraph::build(
            "d".to_string(),
            vec![
                commit("d", "ada@example.com", &["c"]),
                commit("c", "bob@example.com", &["b"]),
                commit("b", "ada@example.com", &["a"]),
                commit("a", "ada@example.com", &[]),
            ],
        )
    }

    fn key(repo: &str, tip: &str) -> GraphKey {
        GraphKey {
            repo: RepoId::new(format!("/nonexistent/{repo}")),
            tip: tip.to_string(),
            commit_count: 4,
            view: HistoryView::default(),
        }
    }

    #[test]
    fn test_contributors_sorted_by_count() {
        let graph = sample_graph();
        let contributors = graph.contributors();
        assert_eq!(contributors[0].email, "ada@example.com");
        assert_eq!(contributors[0].commit_count, 3);
        assert_eq!(contributors[1].commit_count, 1);
        assert_eq!(graph.get("c").map(|c| c.parents.clone()), Some(vec!["b".to_string()]));
        assert_eq!(graph.head().map(|c| c.oid.as_str()), Some("d"));
    }

    #[test]
    fn test_query_filters_and_paginates() {
        let graph = sample_graph();

        let page = graph.query(2, 0, None);
        assert_eq!(page.total, 4);
        assert_eq!(page.commits.len(), 2);
        assert!(page.has_more);

        let excluded = vec!["ada@example.com".to_string()];
        let page = graph.query(10, 0, Some(&excluded));
        assert_eq!(page.filtered_total, 1);
        assert_eq!(page.commits[0].oid, "c");
        assert!(!page.has_more);
        assert_eq!(page.contributors.len(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_builds_share_one_walk() {
        let cache = Arc::new(GraphCache::new(&GraphConfig::default()));
        let builds = Arc::new(AtomicU32::new(0));

        let mut tasks = Vec::new();
        for _ in 0..5 {
            let cache = Arc::clone(&cache);
            let builds = Arc::clone(&builds);
            tasks.push(tokio::spawn(async move {
                cache
                    .get_or_build(key("r", "d"), move || async move {
                        builds.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        Ok(sample_graph())
                    })
                    .await
            }));
        }
        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap().len(), 4);
        }
        assert_eq!(builds.load(Ordering::SeqCst), 1);
        assert_eq!(cache.statistics().cache.item_count, 1);
    }

    #[tokio::test]
    async fn test_evict_repository_and_memory_ceiling() {
        let graph_size = sample_graph().size_bytes();
        let cache = GraphCache::new(&GraphConfig {
            max_items: 10,
            max_memory_bytes: graph_size * 2,
        });
        for (repo, tip) in [("a", "1"), ("a", "2"), ("b", "1")] {
            cache
                .get_or_build(key(repo, tip), || async { Ok(sample_graph()) })
                .await
                .unwrap();
        }
        let stats = cache.statistics().cache;
        assert_eq!(stats.item_count, 2);
        assert!(stats.memory_usage_bytes <= stats.max_memory_bytes);
        assert!(cache.get(&key("a", "1")).is_none());

        assert_eq!(cache.evict_repository(&key("a", "2").repo), 1);
        assert!(cache.get(&key("b", "1")).is_some());
    }

    #[tokio::test]
    async fn test_build_finishing_after_close_is_not_stored() {
        let cache = Arc::new(GraphCache::new(&GraphConfig::default()));
        let started = Arc::new(tokio::sync::Notify::new());
        let release = Arc::new(tokio::sync::Notify::new());

        let build = {
            let cache = Arc::clone(&cache);
            let started = Arc::clone(&started);
            let release = Arc::clone(&release);
            tokio::spawn(async move {
                cache
                    .get_or_build(key("a", "d"), move || async move {
                        started.notify_one();
                        release.notified().await;
                        Ok(sample_graph())
                    })
                    .await
            })
        };
        started.notified().await;
        cache.evict_repository(&key("a", "d").repo);
        release.notify_one();

        assert_eq!(build.await.unwrap().unwrap().len(), 4);
        assert!(cache.get(&key("a", "d")).is_none());
        assert_eq!(cache.statistics().cache.item_count, 0);

        // a build started after the close is kept
        cache
            .get_or_build(key("a", "d"), || async { Ok(sample_graph()) })
            .await
            .unwrap();
        assert!(cache.get(&key("a", "d")).is_some());
    }

    #[test]
    fn test_commit_count_is_part_of_the_key() {
        let shallow = key("a", "d");
        let deepened = GraphKey { commit_count: 40, ..key("a", "d") };
        assert_ne!(shallow, deepened);
    }
}
