//! API route handlers - maps HTTP endpoints to git operations.
//!
//! Each submodule defines routes for a feature area:
//! - `repository`: Basic repo info (GET /api/v1/repository)
//! - `branches`: Branch listing and switching
//! - `commits`: Commit history with filtering, served from the graph cache
//! - `status`: Working tree status
//! - `stats`: Cache and pool statistics, manual invalidation

pub mod branches;
pub mod commits;
pub mod repository;
pub mod stats;
pub mod status;

use axum::Router;

use crate::git::SharedRepo;

pub fn create_router(repo: SharedRepo) -> Router {
    Router::new()
        .merge(repository::routes(repo.clone()))
        .merge(branches::routes(repo.clone()))
        .merge(commits::routes(repo.clone()))
        .merge(status::routes(repo.clone()))
        .merge(stats::routes(repo))
}
