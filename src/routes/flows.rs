//! Approval flow routes.
//!
//! POST /flows             - Start a flow instance on a template
//! POST /flows/{id}/cancel - Cancel a pending instance (initiator only)

use std::sync::Arc;

use axum::extract::Path;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Extension, Json, Router};
use tracing::info;

use crate::models::{
    ApiResponse, CancelFlowRequest, CreateFlowRequest, FlowCreatedResponse, FlowInstance,
};
use crate::routes::error_status;
use crate::service::BackOffice;
use crate::store::BackOfficeStore;

/// Build the flows router.
pub fn router<S: BackOfficeStore>() -> Router {
    Router::new()
        .route("/flows", post(create_flow::<S>))
        .route("/flows/{id}/cancel", post(cancel_flow::<S>))
}

async fn create_flow<S: BackOfficeStore>(
    Extension(office): Extension<Arc<BackOffice<S>>>,
    Json(req): Json<CreateFlowRequest>,
) -> Result<(StatusCode, Json<ApiResponse<FlowCreatedResponse>>), StatusCode> {
    let instance = office
        .create_from_template(req.template_id, req.initiator)
        .await
        .map_err(|e| error_status("create flow instance", &e))?;

    info!(
        "Flow instance {} created via API on template {}",
        instance.id, req.template_id
    );

    Ok((
        StatusCode::CREATED,
        Json(ApiResponse {
            data: FlowCreatedResponse {
                instance_id: instance.id,
            },
            message: "Flow instance created".to_string(),
        }),
    ))
}

async fn cancel_flow<S: BackOfficeStore>(
    Extension(office): Extension<Arc<BackOffice<S>>>,
    Path(id): Path<i64>,
    Json(req): Json<CancelFlowRequest>,
) -> Result<Json<ApiResponse<FlowInstance>>, StatusCode> {
    let instance = office
        .cancel(id, req.requester)
        .await
        .map_err(|e| error_status("cancel flow instance", &e))?;

    Ok(Json(ApiResponse {
        data: instance,
        message: "Flow instance cancelled".to_string(),
    }))
}
