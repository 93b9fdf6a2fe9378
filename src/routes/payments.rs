//! Payment allocation routes.
//!
//! POST /payments/allocate - Split a confirmed payment across child orders

use std::sync::Arc;

use axum::http::StatusCode;
use axum::routing::post;
use axum::{Extension, Json, Router};

use crate::ledger::allocation::AllocationSummary;
use crate::models::{ApiResponse, SaleAllocation};
use crate::routes::error_status;
use crate::service::BackOffice;
use crate::store::BackOfficeStore;

/// Build the payments router.
pub fn router<S: BackOfficeStore>() -> Router {
    Router::new().route("/payments/allocate", post(allocate_payment::<S>))
}

async fn allocate_payment<S: BackOfficeStore>(
    Extension(office): Extension<Arc<BackOffice<S>>>,
    Json(req): Json<SaleAllocation>,
) -> Result<Json<ApiResponse<AllocationSummary>>, StatusCode> {
    let summary = office
        .allocate_sale(&req)
        .await
        .map_err(|e| error_status("allocate payment", &e))?;

    let message = if summary.duplicate {
        "Payment already allocated".to_string()
    } else {
        format!("Payment allocated across {} child orders", summary.entries.len())
    };

    Ok(Json(ApiResponse {
        data: summary,
        message,
    }))
}
