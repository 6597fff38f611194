//! Broker introspection and manual cache control.
//!
//! - GET /api/v1/stats
//!   Pool, result cache, graph cache and notifier statistics.
//!
//! - POST /api/v1/repository/invalidate { class: "commit" | "checkout" | ... }
//!   Drops cached reads made stale by an operation class. Returns how many went.
//!
//! - POST /api/v1/repository/dirty { category: "head" | "branches" | ... }
//!   Reports an outside change; refreshes fire after the debounce window.

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::git::{OperationClass, SharedRepo};
use crate::notifier::ChangeCategory;
use crate::service::ServiceStatistics;

pub fn routes(repo: SharedRepo) -> Router {
    Router::new()
        .route("/api/v1/stats", get(get_stats))
        .route("/api/v1/repository/invalidate", post(invalidate))
        .route("/api/v1/repository/dirty", post(mark_dirty))
        .with_state(repo)
}

async fn get_stats(State(repo): State<SharedRepo>) -> Json<ServiceStatistics> {
    Json(repo.service().statistics())
}

#[derive(Debug, Deserialize)]
struct InvalidateRequest {
    class: OperationClass,
}

#[derive(Debug, Serialize)]
struct InvalidateResponse {
    removed: usize,
}

async fn invalidate(
    State(repo): State<SharedRepo>,
    Json(request): Json<InvalidateRequest>,
) -> Result<Json<InvalidateResponse>> {
    let removed = repo.service().invalidate(repo.id(), request.class);
    Ok(Json(InvalidateResponse { removed }))
}

#[derive(Debug, Deserialize)]
struct DirtyRequest {
    category: ChangeCategory,
}

async fn mark_dirty(
    State(repo): State<SharedRepo>,
    Json(request): Json<DirtyRequest>,
) -> Result<Json<()>> {
    repo.service().mark_dirty(repo.id(), request.category);
    Ok(Json(()))
}
