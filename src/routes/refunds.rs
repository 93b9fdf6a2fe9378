//! Refund routes.
//!
//! POST /refunds - Submit a refund and start its approval flow

use std::sync::Arc;

use axum::http::StatusCode;
use axum::routing::post;
use axum::{Extension, Json, Router};
use tracing::info;

use crate::models::{ApiResponse, RefundSubmission, RefundSubmittedResponse};
use crate::routes::error_status;
use crate::service::BackOffice;
use crate::store::BackOfficeStore;

/// Build the refunds router.
pub fn router<S: BackOfficeStore>() -> Router {
    Router::new().route("/refunds", post(submit_refund::<S>))
}

async fn submit_refund<S: BackOfficeStore>(
    Extension(office): Extension<Arc<BackOffice<S>>>,
    Json(req): Json<RefundSubmission>,
) -> Result<(StatusCode, Json<ApiResponse<RefundSubmittedResponse>>), StatusCode> {
    let (refund, instance) = office
        .submit_refund(&req)
        .await
        .map_err(|e| error_status("submit refund", &e))?;

    info!(
        "Refund {} submitted via API for order {}",
        refund.id, refund.order_id
    );

    Ok((
        StatusCode::CREATED,
        Json(ApiResponse {
            data: RefundSubmittedResponse {
                refund_order_id: refund.id,
                flow_instance_id: instance.id,
            },
            message: "Refund submitted for approval".to_string(),
        }),
    ))
}
