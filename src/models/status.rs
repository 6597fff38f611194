//! Working tree status DTOs, parsed from porcelain v1 output.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusEntry {
    pub path: String,
    /// Source path of a rename or copy.
    pub original_path: Option<String>,
    /// `X` column: staged state. `?` for untracked, `!` for ignored.
    pub index_status: char,
    /// `Y` column: unstaged state.
    pub worktree_status: char,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkingTreeStatus {
    /// `None` when HEAD is detached.
    pub branch: Option<String>,
    pub upstream: Option<String>,
    pub ahead: u32,
    pub behind: u32,
    pub entries: Vec<StatusEntry>,
    pub is_clean: bool,
}
