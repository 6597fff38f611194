//! Data transfer objects (DTOs) for API responses.
//!
//! These structs are serialized to JSON by the HTTP routes and the CLI.
//! - `tree`: RepositoryInfo, CommitInfo, ContributorInfo, BranchInfo
//! - `commit`: CommitDetail, CommitListResponse, AuthorInfo
//! - `status`: WorkingTreeStatus, StatusEntry

pub mod commit;
pub mod status;
pub mod tree;

pub use commit::*;
pub use status::*;
pub use tree::*;
