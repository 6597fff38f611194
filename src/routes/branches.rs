//! Branch listing and switching endpoints.
//!
//! - GET /api/v1/repository/branches
//!   Lists all local and remote branches with current branch flagged.
//!
//! - POST /api/v1/repository/checkout { branch: string }
//!   Switches to a local branch. Cached reads that depend on HEAD are
//!   invalidated before the response is sent.

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;

use crate::error::Result;
use crate::git::SharedRepo;
use crate::models::BranchInfo;

pub fn routes(repo: SharedRepo) -> Router {
    Router::new()
        .route("/api/v1/repository/branches", get(list_branches))
        .route("/api/v1/repository/checkout", post(checkout_branch))
        .with_state(repo)
}

async fn list_branches(State(repo): State<SharedRepo>) -> Result<Json<Vec<BranchInfo>>> {
    let branches = repo.list_branches().await?;
    Ok(Json(branches))
}

#[derive(Debug, Deserialize)]
struct CheckoutRequest {
    branch: String,
}

async fn checkout_branch(
    State(repo): State<SharedRepo>,
    Json(request): Json<CheckoutRequest>,
) -> Result<Json<()>> {
    repo.checkout_branch(&request.branch).await?;
    Ok(Json(()))
}
