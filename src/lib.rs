//! git-broker: a concurrent broker in front of the `git` executable.
//!
//! - `git`: command classification, process runner, lock retry, process pool
//! - `cache`: result cache with single-flight and operation-class invalidation,
//!   bounded LRU and commit graphs
//! - `batch`: bounded-parallel batches of independent queries
//! - `notifier`: debounced change notification from filesystem watchers
//! - `service`: `GitService`, the entry point tying the above together
//! - `models`, `routes`: JSON DTOs and the HTTP surface

pub mod batch;
pub mod cache;
pub mod config;
pub mod error;
pub mod git;
pub mod models;
pub mod notifier;
pub mod routes;
pub mod service;

pub use config::ServiceConfig;
pub use error::{GitError, Result};
pub use service::GitService;
