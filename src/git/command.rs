//! Static classification of every git command the broker issues.
//!
//! Each `GitCommand` carries, without looking at its arguments:
//! - the git subcommand tokens it expands to
//! - whether it mutates the repository, and which `OperationClass` it belongs to
//! - how the process pool may treat it (`PoolSafety`)
//! - which operation classes invalidate its cached output (reads only)

use std::fmt;

use serde::{Deserialize, Serialize};

/// Category of mutation a command performs; drives cache invalidation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationClass {
    Stage,
    Commit,
    Checkout,
    BranchCreate,
    BranchDelete,
    BranchRename,
    Merge,
    Rebase,
    Reset,
    Stash,
    Tag,
    ConfigChange,
    RemoteChange,
    Fetch,
    Pull,
    Push,
    Worktree,
    RepositoryCreate,
}

impl OperationClass {
    pub const ALL: [OperationClass; 18] = [
        OperationClass::Stage,
        OperationClass::Commit,
        OperationClass::Checkout,
        OperationClass::BranchCreate,
        OperationClass::BranchDelete,
        OperationClass::BranchRename,
        OperationClass::Merge,
        OperationClass::Rebase,
        OperationClass::Reset,
        OperationClass::Stash,
        OperationClass::Tag,
        OperationClass::ConfigChange,
        OperationClass::RemoteChange,
        OperationClass::Fetch,
        OperationClass::Pull,
        OperationClass::Push,
        OperationClass::Worktree,
        OperationClass::RepositoryCreate,
    ];
}

impl fmt::Display for OperationClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationClass::Stage => "stage",
            OperationClass::Commit => "commit",
            OperationClass::Checkout => "checkout",
            OperationClass::BranchCreate => "branch-create",
            OperationClass::BranchDelete => "branch-delete",
            OperationClass::BranchRename => "branch-rename",
            OperationClass::Merge => "merge",
            OperationClass::Rebase => "rebase",
            OperationClass::Reset => "reset",
            OperationClass::Stash => "stash",
            OperationClass::Tag => "tag",
            OperationClass::ConfigChange => "config-change",
            OperationClass::RemoteChange => "remote-change",
            OperationClass::Fetch => "fetch",
            OperationClass::Pull => "pull",
            OperationClass::Push => "push",
            OperationClass::Worktree => "worktree",
            OperationClass::RepositoryCreate => "repository-create",
        };
        f.write_str(name)
    }
}

/// How the process pool may treat a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PoolSafety {
    /// Pure reads.
    AlwaysSafeToPool,
    /// Local commands that may write repository state; reuse needs a lock check.
    ValidateFirst,
    /// Network, credential, repository-creating or cwd-changing commands.
    NeverPool,
}

use OperationClass as Op;

/// Everything that can change any ref.
const REF_WRITERS: &[OperationClass] = &[
    Op::Commit,
    Op::Checkout,
    Op::Merge,
    Op::Rebase,
    Op::Reset,
    Op::Pull,
    Op::BranchCreate,
    Op::BranchDelete,
    Op::BranchRename,
    Op::Tag,
    Op::Fetch,
    Op::Push,
    Op::RemoteChange,
    Op::Stash,
    Op::Worktree,
];

/// Everything that can change the index or the checked-out files.
const WORKTREE_WRITERS: &[OperationClass] = &[
    Op::Stage,
    Op::Commit,
    Op::Checkout,
    Op::Merge,
    Op::Rebase,
    Op::Reset,
    Op::Pull,
    Op::Stash,
    Op::BranchRename,
    Op::Worktree,
];

const CONFIG_WRITERS: &[OperationClass] = &[Op::ConfigChange, Op::RemoteChange, Op::BranchCreate];

const STASH_WRITERS: &[OperationClass] = &[Op::Stash, Op::Reset];

/// Every git command type the broker knows how to issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum GitCommand {
    // Reads
    Status,
    Log,
    RevParse,
    RevList,
    ForEachRef,
    ShowRef,
    Show,
    Diff,
    LsFiles,
    ConfigGet,
    Describe,
    CatFile,
    MergeBase,
    BranchList,
    TagList,
    RemoteList,
    StashList,
    // Local mutations
    Add,
    Restore,
    Commit,
    Checkout,
    Switch,
    BranchCreate,
    BranchDelete,
    BranchRename,
    Merge,
    Rebase,
    CherryPick,
    Revert,
    Reset,
    StashPush,
    StashPop,
    StashDrop,
    TagCreate,
    TagDelete,
    ConfigSet,
    RemoteAdd,
    RemoteRemove,
    // Network, repository-creating, cwd-changing
    Fetch,
    Pull,
    Push,
    Clone,
    Init,
    WorktreeAdd,
}

impl GitCommand {
    /// Subcommand tokens placed before the caller's arguments.
    pub fn leading_args(self) -> &'static [&'static str] {
        match self {
            GitCommand::Status => &["status"],
            GitCommand::Log => &["log"],
            GitCommand::RevParse => &["rev-parse"],
            GitCommand::RevList => &["rev-list"],
            GitCommand::ForEachRef => &["for-each-ref"],
            GitCommand::ShowRef => &["show-ref"],
            GitCommand::Show => &["show"],
            GitCommand::Diff => &["diff"],
            GitCommand::LsFiles => &["ls-files"],
            GitCommand::ConfigGet => &["config", "--get"],
            GitCommand::Describe => &["describe"],
            GitCommand::CatFile => &["cat-file"],
            GitCommand::MergeBase => &["merge-base"],
            GitCommand::BranchList => &["branch", "--list"],
            GitCommand::TagList => &["tag", "--list"],
            GitCommand::RemoteList => &["remote", "-v"],
            GitCommand::StashList => &["stash", "list"],
            GitCommand::Add => &["add"],
            GitCommand::Restore => &["restore"],
            GitCommand::Commit => &["commit"],
            GitCommand::Checkout => &["checkout"],
            GitCommand::Switch => &["switch"],
            GitCommand::BranchCreate => &["branch"],
            GitCommand::BranchDelete => &["branch", "--delete"],
            GitCommand::BranchRename => &["branch", "--move"],
            GitCommand::Merge => &["merge"],
            GitCommand::Rebase => &["rebase"],
            GitCommand::CherryPick => &["cherry-pick"],
            GitCommand::Revert => &["revert"],
            GitCommand::Reset => &["reset"],
            GitCommand::StashPush => &["stash", "push"],
            GitCommand::StashPop => &["stash", "pop"],
            GitCommand::StashDrop => &["stash", "drop"],
            GitCommand::TagCreate => &["tag"],
            GitCommand::TagDelete => &["tag", "--delete"],
            GitCommand::ConfigSet => &["config"],
            GitCommand::RemoteAdd => &["remote", "add"],
            GitCommand::RemoteRemove => &["remote", "remove"],
            GitCommand::Fetch => &["fetch"],
            GitCommand::Pull => &["pull"],
            GitCommand::Push => &["push"],
            GitCommand::Clone => &["clone"],
            GitCommand::Init => &["init"],
            GitCommand::WorktreeAdd => &["worktree", "add"],
        }
    }

    /// `None` for read-only commands.
    pub fn operation_class(self) -> Option<OperationClass> {
        let class = match self {
            GitCommand::Status
            | GitCommand::Log
            | GitCommand::RevParse
            | GitCommand::RevList
            | GitCommand::ForEachRef
            | GitCommand::ShowRef
            | GitCommand::Show
            | GitCommand::Diff
            | GitCommand::LsFiles
            | GitCommand::ConfigGet
            | GitCommand::Describe
            | GitCommand::CatFile
            | GitCommand::MergeBase
            | GitCommand::BranchList
            | GitCommand::TagList
            | GitCommand::RemoteList
            | GitCommand::StashList => return None,
            GitCommand::Add | GitCommand::Restore => Op::Stage,
            GitCommand::Commit | GitCommand::CherryPick | GitCommand::Revert => Op::Commit,
            GitCommand::Checkout | GitCommand::Switch => Op::Checkout,
            GitCommand::BranchCreate => Op::BranchCreate,
            GitCommand::BranchDelete => Op::BranchDelete,
            GitCommand::BranchRename => Op::BranchRename,
            GitCommand::Merge => Op::Merge,
            GitCommand::Rebase => Op::Rebase,
            GitCommand::Reset => Op::Reset,
            GitCommand::StashPush | GitCommand::StashPop | GitCommand::StashDrop => Op::Stash,
            GitCommand::TagCreate | GitCommand::TagDelete => Op::Tag,
            GitCommand::ConfigSet => Op::ConfigChange,
            GitCommand::RemoteAdd | GitCommand::RemoteRemove => Op::RemoteChange,
            GitCommand::Fetch => Op::Fetch,
            GitCommand::Pull => Op::Pull,
            GitCommand::Push => Op::Push,
            GitCommand::Clone | GitCommand::Init => Op::RepositoryCreate,
            GitCommand::WorktreeAdd => Op::Worktree,
        };
        Some(class)
    }

    pub fn is_mutating(self) -> bool {
        self.operation_class().is_some()
    }

    pub fn pool_safety(self) -> PoolSafety {
        match self {
            GitCommand::Fetch
            | GitCommand::Pull
            | GitCommand::Push
            | GitCommand::Clone
            | GitCommand::Init
            | GitCommand::WorktreeAdd => PoolSafety::NeverPool,
            // status refreshes the index stat cache and may take index.lock
            GitCommand::Status => PoolSafety::ValidateFirst,
            cmd if cmd.is_mutating() => PoolSafety::ValidateFirst,
            _ => PoolSafety::AlwaysSafeToPool,
        }
    }

    /// Talks to a remote.
    pub fn is_network(self) -> bool {
        matches!(
            self,
            GitCommand::Fetch | GitCommand::Pull | GitCommand::Push | GitCommand::Clone
        )
    }

    /// Push must be able to prompt for credentials; every other command runs
    /// with prompts suppressed unless the invocation asks otherwise.
    pub fn needs_interactive_credentials(self) -> bool {
        matches!(self, GitCommand::Push)
    }

    /// Operation classes whose completion makes this read's output stale.
    pub fn invalidated_by(self) -> &'static [OperationClass] {
        match self {
            GitCommand::Status | GitCommand::Diff | GitCommand::LsFiles => WORKTREE_WRITERS,
            GitCommand::ConfigGet | GitCommand::RemoteList => CONFIG_WRITERS,
            GitCommand::StashList => STASH_WRITERS,
            GitCommand::RevParse | GitCommand::Describe => REF_WRITERS,
            GitCommand::Log
            | GitCommand::RevList
            | GitCommand::ForEachRef
            | GitCommand::ShowRef
            | GitCommand::Show
            | GitCommand::CatFile
            | GitCommand::MergeBase
            | GitCommand::BranchList
            | GitCommand::TagList => REF_WRITERS,
            _ => &[],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reads_have_no_operation_class() {
        for cmd in [
            GitCommand::Status,
            GitCommand::Log,
            GitCommand::RevParse,
            GitCommand::ForEachRef,
        ] {
            assert!(!cmd.is_mutating(), "{cmd:?} should be a read");
            assert!(!cmd.invalidated_by().is_empty(), "{cmd:?} needs invalidators");
        }
    }

    #[test]
    fn test_pool_classification() {
        assert_eq!(GitCommand::Log.pool_safety(), PoolSafety::AlwaysSafeToPool);
        assert_eq!(GitCommand::Status.pool_safety(), PoolSafety::ValidateFirst);
        assert_eq!(GitCommand::Commit.pool_safety(), PoolSafety::ValidateFirst);
        assert_eq!(GitCommand::Push.pool_safety(), PoolSafety::NeverPool);
        assert_eq!(GitCommand::Clone.pool_safety(), PoolSafety::NeverPool);
        assert_eq!(GitCommand::WorktreeAdd.pool_safety(), PoolSafety::NeverPool);
    }

    #[test]
    fn test_network_commands_never_pool() {
        for cmd in [
            GitCommand::Fetch,
            GitCommand::Pull,
            GitCommand::Push,
            GitCommand::Clone,
        ] {
            assert!(cmd.is_network());
            assert_eq!(cmd.pool_safety(), PoolSafety::NeverPool);
        }
    }

    #[test]
    fn test_only_push_keeps_credential_prompts() {
        assert!(GitCommand::Push.needs_interactive_credentials());
        assert!(!GitCommand::Fetch.needs_interactive_credentials());
        assert!(!GitCommand::Log.needs_interactive_credentials());
    }

    #[test]
    fn test_log_is_invalidated_by_commit_and_checkout() {
        let classes = GitCommand::Log.invalidated_by();
        assert!(classes.contains(&OperationClass::Commit));
        assert!(classes.contains(&OperationClass::Checkout));
        assert!(classes.contains(&OperationClass::BranchCreate));
        assert!(!classes.contains(&OperationClass::ConfigChange));
    }

    #[test]
    fn test_operation_class_serde_names() {
        let json = serde_json::to_string(&OperationClass::BranchCreate).unwrap();
        assert_eq!(json, "\"branch-create\"");
        let parsed: OperationClass = serde_json::from_str("\"config-change\"").unwrap();
        assert_eq!(parsed, OperationClass::ConfigChange);
        assert_eq!(OperationClass::ConfigChange.to_string(), "config-change");
    }
}
