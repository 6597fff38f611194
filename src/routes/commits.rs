use axum::{
    extract::{Query, State},
    routing::get,
    Json, Router,
};
use serde::Deserialize;

use crate::error::Result;
use crate::git::SharedRepo;
use crate::models::CommitListResponse;

pub fn routes(repo: SharedRepo) -> Router {
    Router::new()
        .route("/api/v1/repository/commits", get(get_commits))
        .with_state(repo)
}

#[derive(Debug, Deserialize)]
struct CommitsQuery {
    #[serde(default = "default_limit")]
    limit: usize,
    #[serde(default)]
    offset: usize,
    /// Comma-separated author emails to hide.
    exclude_authors: Option<String>,
}

fn default_limit() -> usize {
    50
}

async fn get_commits(
    State(repo): State<SharedRepo>,
    Query(query): Query<CommitsQuery>,
) -> Result<Json<CommitListResponse>> {
    let excluded: Option<Vec<String>> = query.exclude_authors.as_deref().map(|raw| {
        raw.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    });
    let response = repo
        .commits(query.limit, query.offset, excluded.as_deref())
        .await?;
    Ok(Json(response))
}
