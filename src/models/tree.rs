//! Repository-related DTOs.
//!
//! - `RepositoryInfo`: Repo metadata (header display)
//! - `CommitInfo`: Basic commit info (head commit, branch tips)
//! - `ContributorInfo`: Author with commit count
//! - `BranchInfo`: Local or remote-tracking branch

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitInfo {
    pub oid: String,
    pub message: String,
    pub author: String,
    pub timestamp: i64,
    pub relative_time: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryInfo {
    pub name: String,
    pub path: String,
    pub head_branch: Option<String>,
    pub head_commit: Option<CommitInfo>,
    pub is_bare: bool,
    pub is_empty: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContributorInfo {
    pub name: String,
    pub email: String,
    pub commit_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchInfo {
    pub name: String,
    pub is_current: bool,
    pub is_remote: bool,
    pub last_commit: Option<CommitInfo>,
}
