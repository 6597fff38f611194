//! Error types shared by every layer of the broker, plus HTTP response mapping.
//!
//! `GitError` is `Clone` so a single in-flight query can hand the same outcome
//! to every coalesced caller.
//!
//! Error mappings:
//! - `RepoNotFound` → 404
//! - `InvalidPath`, `InvalidArgument` → 400
//! - `CredentialsRequired` → 401
//! - `Timeout` → 408
//! - `LockContention` → 409
//! - `Cancelled` → 503
//! - everything else → 500

use std::sync::Arc;
use std::time::Duration;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum GitError {
    #[error("Failed to start {program}: {message}")]
    StartFailure { program: String, message: String },

    #[error("Repository is busy: another git process holds a lock ({message})")]
    LockContention { message: String },

    #[error("{command} failed (exit code {}): {stderr}", exit_code.map_or("none".to_string(), |c| c.to_string()))]
    CommandFailure {
        command: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("{operation} needs credentials that are not configured. {hint}")]
    CredentialsRequired { operation: String, hint: String },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("{command} timed out after {elapsed:?}")]
    Timeout { command: String, elapsed: Duration },

    #[error("Repository not found: {0}")]
    RepoNotFound(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Unexpected git output: {0}")]
    Parse(String),

    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl GitError {
    /// Transient failures the lock-aware retry wrapper absorbs.
    pub fn is_contention(&self) -> bool {
        matches!(self, GitError::LockContention { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, GitError::Cancelled)
    }
}

impl From<std::io::Error> for GitError {
    fn from(err: std::io::Error) -> Self {
        GitError::Io(Arc::new(err))
    }
}

impl IntoResponse for GitError {
    fn into_response(self) -> Response {
        let status = match &self {
            GitError::RepoNotFound(_) => StatusCode::NOT_FOUND,
            GitError::InvalidPath(_) | GitError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            GitError::CredentialsRequired { .. } => StatusCode::UNAUTHORIZED,
            GitError::Timeout { .. } => StatusCode::REQUEST_TIMEOUT,
            GitError::LockContention { .. } => StatusCode::CONFLICT,
            GitError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
            GitError::StartFailure { .. }
            | GitError::CommandFailure { .. }
            | GitError::Parse(_)
            | GitError::Io(_)
            | GitError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(json!({
            "error": self.to_string(),
        }));

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, GitError>;
