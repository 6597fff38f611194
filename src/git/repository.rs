use std::path::Path;
use std::sync::Arc;

use crate::error::{GitError, Result};
use crate::git::history::{HistoryView, format_relative_time};
use crate::git::{GitCommand, Invocation, RepoId};
use crate::models::{
    BranchInfo, CommitInfo, CommitListResponse, RepositoryInfo, StatusEntry, WorkingTreeStatus,
};
use crate::service::GitService;

const BRANCH_FORMAT: &str =
    "--format=%(HEAD)%1f%(refname)%1f%(objectname)%1f%(authorname)%1f%(committerdate:unix)%1f%(subject)";

/// One repository as seen through a shared `GitService`.
pub struct Repository {
    service: Arc<GitService>,
    repo: RepoId,
    pub path: String,
}

impl Repository {
    pub fn open<P: AsRef<Path>>(service: Arc<GitService>, path: P) -> Result<Self> {
        let repo = service.open(path.as_ref())?;
        Ok(Self {
            path: repo.path().to_string_lossy().to_string(),
            service,
            repo,
        })
    }

    pub fn id(&self) -> &RepoId {
        &self.repo
    }

    pub fn service(&self) -> &Arc<GitService> {
        &self.service
    }

    fn invocation(&self, command: GitCommand) -> Invocation {
        Invocation::new(self.repo.path(), command)
    }

    pub async fn info(&self) -> Result<RepositoryInfo> {
        let name = self
            .repo
            .path()
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "Unknown".to_string());

        let mut outcome = self
            .service
            .batch_query(vec![
                (
                    "bare",
                    self.invocation(GitCommand::RevParse)
                        .arg("--is-bare-repository"),
                ),
                (
                    "branches",
                    self.invocation(GitCommand::ForEachRef)
                        .args([BRANCH_FORMAT, "refs/heads"]),
                ),
            ])
            .await;
        let is_bare = outcome.take(&"bare")?.trim() == "true";
        let head_branch = parse_branches(&outcome.take(&"branches")?)
            .into_iter()
            .find(|b| b.is_current)
            .map(|b| b.name);

        let graph = self
            .service
            .commit_graph(&self.repo, HistoryView::default())
            .await?;
        let head_commit = graph.head().map(|c| c.to_commit_info());

        Ok(RepositoryInfo {
            name,
            path: self.path.clone(),
            head_branch,
            is_empty: head_commit.is_none(),
            head_commit,
            is_bare,
        })
    }

    /// Local branches first (current one leading), then remote-tracking ones.
    pub async fn list_branches(&self) -> Result<Vec<BranchInfo>> {
        let output = self
            .service
            .query(
                self.invocation(GitCommand::ForEachRef)
                    .args([BRANCH_FORMAT, "refs/heads", "refs/remotes"]),
            )
            .await?;
        let mut branches = parse_branches(&output);
        branches.sort_by(|a, b| {
            a.is_remote
                .cmp(&b.is_remote)
                .then_with(|| b.is_current.cmp(&a.is_current))
                .then_with(|| a.name.cmp(&b.name))
        });
        Ok(branches)
    }

    pub async fn checkout_branch(&self, branch: &str) -> Result<()> {
        validate_branch_name(branch)?;
        // the trailing `--` keeps a branch name from being read as a path
        self.service
            .mutate(self.invocation(GitCommand::Checkout).args([branch, "--"]))
            .await?;
        Ok(())
    }

    /// Served from the commit graph; only the first call per HEAD walks history.
    pub async fn commits(
        &self,
        limit: usize,
        offset: usize,
        exclude_authors: Option<&[String]>,
    ) -> Result<CommitListResponse> {
        let graph = self
            .service
            .commit_graph(&self.repo, HistoryView::default())
            .await?;
        Ok(graph.query(limit, offset, exclude_authors))
    }

    pub async fn status(&self) -> Result<WorkingTreeStatus> {
        let output = self
            .service
            .query(
                self.invocation(GitCommand::Status)
                    .args(["--porcelain=v1", "-z", "--branch", "--untracked-files=all"]),
            )
            .await?;
        parse_status(&output)
    }
}

pub type SharedRepo = Arc<Repository>;

fn validate_branch_name(branch: &str) -> Result<()> {
    if branch.is_empty() {
        return Err(GitError::InvalidArgument("branch name is empty".to_string()));
    }
    if branch.starts_with('-') {
        return Err(GitError::InvalidArgument(format!(
            "branch name cannot start with '-': {branch}"
        )));
    }
    if branch.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(GitError::InvalidArgument(format!(
            "branch name contains whitespace or control characters: {branch:?}"
        )));
    }
    Ok(())
}

/// Parses `for-each-ref` output in `BRANCH_FORMAT`. Symbolic remote HEADs
/// are skipped.
pub fn parse_branches(output: &str) -> Vec<BranchInfo> {
    output
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.splitn(6, '\u{1f}').collect();
            let [head, refname, oid, author, date, subject] = fields.as_slice() else {
                return None;
            };
            let (name, is_remote) = if let Some(name) = refname.strip_prefix("refs/heads/") {
                (name, false)
            } else if let Some(name) = refname.strip_prefix("refs/remotes/") {
                if name.ends_with("/HEAD") {
                    return None;
                }
                (name, true)
            } else {
                return None;
            };

            let timestamp = date.parse::<i64>().unwrap_or(0);
            Some(BranchInfo {
                name: name.to_string(),
                is_current: *head == "*",
                is_remote,
                last_commit: Some(CommitInfo {
                    oid: oid.to_string(),
                    message: subject.to_string(),
                    author: author.to_string(),
                    timestamp,
                    relative_time: format_relative_time(timestamp),
                }),
            })
        })
        .collect()
}

/// Parses `status --porcelain=v1 -z --branch`.
pub fn parse_status(output: &str) -> Result<WorkingTreeStatus> {
    let mut status = WorkingTreeStatus::default();
    let mut records = output.split('\0').filter(|r| !r.is_empty());

    while let Some(record) = records.next() {
        if let Some(header) = record.strip_prefix("## ") {
            parse_branch_header(header, &mut status);
            continue;
        }

        let mut chars = record.chars();
        let (Some(index_status), Some(worktree_status)) = (chars.next(), chars.next()) else {
            return Err(GitError::Parse(format!("short status record: {record:?}")));
        };
        let path = record
            .get(3..)
            .filter(|p| !p.is_empty())
            .ok_or_else(|| GitError::Parse(format!("status record without path: {record:?}")))?;

        // renames and copies are followed by their source path
        let original_path = if matches!(index_status, 'R' | 'C') || matches!(worktree_status, 'R' | 'C')
        {
            records.next().map(str::to_string)
        } else {
            None
        };

        status.entries.push(StatusEntry {
            path: path.to_string(),
            original_path,
            index_status,
            worktree_status,
        });
    }

    status.is_clean = status.entries.is_empty();
    Ok(status)
}

/// `main...origin/main [ahead 1, behind 2]`, `No commits yet on main`,
/// or `HEAD (no branch)`.
fn parse_branch_header(header: &str, status: &mut WorkingTreeStatus) {
    let (names, tracking) = match header.split_once(" [") {
        Some((names, rest)) => (names, rest.trim_end_matches(']')),
        None => (header, ""),
    };

    let names = names
        .strip_prefix("No commits yet on ")
        .or_else(|| names.strip_prefix("Initial commit on "))
        .unwrap_or(names);
    if names.starts_with("HEAD (no branch)") {
        status.branch = None;
    } else {
        match names.split_once("...") {
            Some((branch, upstream)) => {
                status.branch = Some(branch.to_string());
                status.upstream = Some(upstream.to_string());
            }
            None => status.branch = Some(names.to_string()),
        }
    }

    for part in tracking.split(", ") {
        if let Some(n) = part.strip_prefix("ahead ") {
            status.ahead = n.parse().unwrap_or(0);
        } else if let Some(n) = part.strip_prefix("behind ") {
            status.behind = n.parse().unwrap_or(0);
        }
    }
}
