//! Error types for the back office core.
//!
//! `StorageError` is what a `BackOfficeStore` backend returns; `BackOfficeError`
//! is the taxonomy every facade operation reports to its caller. Nothing is
//! retried: an error aborts the surrounding snapshot and is returned as-is.

use bigdecimal::BigDecimal;

use crate::models::FlowStatus;

/// Errors produced by a storage backend.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// A row the backend was asked to update does not exist.
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    /// A uniqueness or state constraint rejected the write.
    #[error("storage conflict: {0}")]
    Conflict(String),

    /// Connection, serialization or any other backend failure.
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Errors returned by the workflow and ledger operations.
#[derive(Debug, thiserror::Error)]
pub enum BackOfficeError {
    #[error("flow template {0} not found")]
    TemplateNotFound(i64),

    #[error("flow template {0} is disabled")]
    TemplateDisabled(i64),

    #[error("no approvers configured for node {sort_key} of template {template_id}")]
    NoApproversConfigured { template_id: i64, sort_key: i32 },

    #[error("flow instance {0} not found")]
    FlowInstanceNotFound(i64),

    #[error("flow instance {instance_id} is {status:?} and no longer accepts votes")]
    FlowClosed { instance_id: i64, status: FlowStatus },

    #[error("vote {0} not found")]
    VoteNotFound(i64),

    #[error("principal {voter} is not the approver of vote {vote_id}")]
    NotAuthorizedApprover { vote_id: i64, voter: i64 },

    #[error("vote {0} has already been cast")]
    AlreadyVoted(i64),

    #[error("principal {requester} did not initiate flow instance {instance_id}")]
    NotInitiator { instance_id: i64, requester: i64 },

    #[error("flow instance {instance_id} is {status:?} and cannot be cancelled")]
    NotCancellable { instance_id: i64, status: FlowStatus },

    #[error("order {0} not found")]
    OrderNotFound(i64),

    #[error("refund order {0} not found")]
    RefundNotFound(i64),

    #[error("refund items total {items} but payment withdrawals total {payments}")]
    RefundAmountMismatch {
        items: BigDecimal,
        payments: BigDecimal,
    },

    #[error("invalid refund: {0}")]
    InvalidRefund(String),

    /// A money amount that is not positive or carries fractions of a cent.
    #[error("invalid amount {0}: must be positive with at most two decimals")]
    InvalidAmount(BigDecimal),

    /// Internal consistency check: the ledger cannot back a refund that the
    /// reconciliation pass was asked to apply.
    #[error("insufficient ledger coverage on order {order_id}: {detail}")]
    InsufficientLedgerCoverage { order_id: i64, detail: String },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

pub type Result<T, E = BackOfficeError> = std::result::Result<T, E>;
