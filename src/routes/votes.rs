//! Vote routes.
//!
//! POST /votes/{id} - Cast a pass or reject decision on a vote

use std::sync::Arc;

use axum::extract::Path;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Extension, Json, Router};

use crate::models::{ApiResponse, CastVoteRequest, VoteResponse};
use crate::routes::error_status;
use crate::service::BackOffice;
use crate::store::BackOfficeStore;

/// Build the votes router.
pub fn router<S: BackOfficeStore>() -> Router {
    Router::new().route("/votes/{id}", post(cast_vote::<S>))
}

async fn cast_vote<S: BackOfficeStore>(
    Extension(office): Extension<Arc<BackOffice<S>>>,
    Path(id): Path<i64>,
    Json(req): Json<CastVoteRequest>,
) -> Result<Json<ApiResponse<VoteResponse>>, StatusCode> {
    let outcome = office
        .cast_vote(id, req.voter, req.decision)
        .await
        .map_err(|e| error_status("cast vote", &e))?;

    let message = if outcome.resolved() {
        format!(
            "Node resolved, flow instance {} is {:?}",
            outcome.instance.id, outcome.instance.status
        )
    } else {
        "Vote recorded, node still pending".to_string()
    };

    Ok(Json(ApiResponse {
        data: VoteResponse {
            vote_id: outcome.vote.id,
            node_result: outcome.node_case.result,
            node_case_id: outcome.node_case.id,
        },
        message,
    }))
}
