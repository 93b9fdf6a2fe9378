//! HTTP route modules for the back office.
//!
//! - `flows`: start and cancel approval flows
//! - `votes`: cast approver votes
//! - `payments`: split-allocate confirmed payments
//! - `refunds`: submit refunds into their approval flow

pub mod flows;
pub mod payments;
pub mod refunds;
pub mod votes;

use axum::http::StatusCode;
use tracing::{error, warn};

use crate::error::{BackOfficeError, StorageError};

/// Map an operation error onto a response status, logging it on the way.
pub(crate) fn error_status(operation: &str, err: &BackOfficeError) -> StatusCode {
    use BackOfficeError::*;

    let status = match err {
        TemplateNotFound(_) | FlowInstanceNotFound(_) | VoteNotFound(_) | OrderNotFound(_)
        | RefundNotFound(_) => StatusCode::NOT_FOUND,
        NotAuthorizedApprover { .. } | NotInitiator { .. } => StatusCode::FORBIDDEN,
        TemplateDisabled(_) | FlowClosed { .. } | AlreadyVoted(_) | NotCancellable { .. } => {
            StatusCode::CONFLICT
        }
        NoApproversConfigured { .. }
        | RefundAmountMismatch { .. }
        | InvalidRefund(_)
        | InvalidAmount(_) => StatusCode::UNPROCESSABLE_ENTITY,
        Storage(StorageError::Conflict(_)) => StatusCode::CONFLICT,
        InsufficientLedgerCoverage { .. } | Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };

    if status.is_server_error() {
        error!("Failed to {}: {}", operation, err);
    } else {
        warn!("Rejected {}: {}", operation, err);
    }
    status
}

#[cfg(test)]
mod tests {
    use super::*;
    use bigdecimal::BigDecimal;
    use crate::models::FlowStatus;

    #[test]
    fn errors_map_to_status_classes() {
        assert_eq!(
            error_status("test", &BackOfficeError::VoteNotFound(1)),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            error_status(
                "test",
                &BackOfficeError::NotAuthorizedApprover { vote_id: 1, voter: 2 }
            ),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            error_status(
                "test",
                &BackOfficeError::NotCancellable {
                    instance_id: 1,
                    status: FlowStatus::Approved
                }
            ),
            StatusCode::CONFLICT
        );
        assert_eq!(
            error_status("test", &BackOfficeError::InvalidRefund("x".into())),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            error_status("test", &BackOfficeError::InvalidAmount(BigDecimal::from(0))),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            error_status(
                "test",
                &BackOfficeError::Storage(StorageError::Conflict("dup".into()))
            ),
            StatusCode::CONFLICT
        );
        assert_eq!(
            error_status(
                "test",
                &BackOfficeError::Storage(StorageError::Backend("down".into()))
            ),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
