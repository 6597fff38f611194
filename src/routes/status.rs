//! Working tree status endpoint.
//!
//! GET /api/v1/repository/status
//!
//! Returns the current branch, its upstream with ahead/behind counts, and
//! every changed, staged or untracked path.

use axum::{extract::State, routing::get, Json, Router};

use crate::error::Result;
use crate::git::SharedRepo;
use crate::models::WorkingTreeStatus;

pub fn routes(repo: SharedRepo) -> Router {
    Router::new()
        .route("/api/v1/repository/status", get(get_status))
        .with_state(repo)
}

async fn get_status(State(repo): State<SharedRepo>) -> Result<Json<WorkingTreeStatus>> {
    let status = repo.status().await?;
    Ok(Json(status))
}
