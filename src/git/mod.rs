//! Everything that talks to the git executable.
//!
//! - `command`: static classification of git commands (mutation class, pool safety)
//! - `classify`: what git's stderr says about a failure
//! - `environment`: environment variables every spawned git receives
//! - `invocation`: one request to run a command, and repository identity
//! - `runner`: spawns git with the environment contract, timeouts and cancellation
//! - `retry`: lock-file inspection and contention backoff
//! - `pool`: per-repository reuse of validated execution handles
//! - `history`: commit log format and parser
//! - `repository`: typed repository operations built on `GitService`

pub mod classify;
pub mod command;
pub mod environment;
pub mod history;
pub mod invocation;
pub mod pool;
pub mod repository;
pub mod retry;
pub mod runner;

pub use command::{GitCommand, OperationClass, PoolSafety};
pub use invocation::{Invocation, RepoId};
pub use repository::{Repository, SharedRepo};
pub use runner::{CommandOutput, OutputLine, ProcessRunner, RunnerConfig};
