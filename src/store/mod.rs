//! Storage contract for the back office core.
//!
//! A `BackOfficeStore` provides transactional access to the workflow tables,
//! the order/refund tables owned by the surrounding system, and the
//! append-only allocation ledger.
//!
//! ## Snapshot Semantics
//!
//! Every operation takes `&mut Self::Snapshot`, an in-progress transaction:
//!
//! 1. `begin_snapshot()` starts the transaction
//! 2. reads and writes go through `&mut snapshot`
//! 3. `commit_snapshot(snapshot)` makes them durable, or
//!    `abort_snapshot(snapshot)` discards them
//!
//! A snapshot dropped without commit is rolled back.
//!
//! ## Locking
//!
//! Methods named `*_for_update` take an exclusive row lock held until the
//! snapshot ends (`SELECT ... FOR UPDATE`).

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};

use crate::error::StorageError;
use crate::models::{
    CcRecord, ChildOrder, ChildOrderStatus, FlowInstance, FlowTemplate, LedgerEntry,
    NewFlowInstance, NewLedgerEntry, NewRefundOrder, NodeCase, NodeVote, Order, OrderStatus,
    Payment, PaymentSource, RefundItem, RefundOrder, RefundPayment, RefundStatus, SaleAllocation,
    SignMode,
};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

pub(crate) fn payment_conflict(payment: &SaleAllocation, recorded_order_id: i64) -> StorageError {
    StorageError::Conflict(format!(
        "payment {} ({:?}) is recorded on order {}, not order {}",
        payment.payment_id, payment.source, recorded_order_id, payment.order_id
    ))
}

#[async_trait]
pub trait BackOfficeStore: Send + Sync + 'static {
    /// The snapshot (transaction) type used by this backend.
    type Snapshot: Send;

    // ── Snapshot lifecycle ────────────────────────────────────────────────────

    async fn begin_snapshot(&self) -> Result<Self::Snapshot, StorageError>;

    async fn commit_snapshot(&self, snapshot: Self::Snapshot) -> Result<(), StorageError>;

    async fn abort_snapshot(&self, snapshot: Self::Snapshot) -> Result<(), StorageError>;

    // ── Templates (read-only) ─────────────────────────────────────────────────

    /// Load a template with its nodes, approver sets and notify list.
    async fn get_template(
        &self,
        snapshot: &mut Self::Snapshot,
        template_id: i64,
    ) -> Result<Option<FlowTemplate>, StorageError>;

    // ── Flow instances ────────────────────────────────────────────────────────

    async fn insert_flow_instance(
        &self,
        snapshot: &mut Self::Snapshot,
        instance: NewFlowInstance,
    ) -> Result<FlowInstance, StorageError>;

    async fn get_flow_instance_for_update(
        &self,
        snapshot: &mut Self::Snapshot,
        instance_id: i64,
    ) -> Result<Option<FlowInstance>, StorageError>;

    /// Persist `status`, `current_step` and `completed_at` of an instance.
    async fn update_flow_instance(
        &self,
        snapshot: &mut Self::Snapshot,
        instance: &FlowInstance,
    ) -> Result<(), StorageError>;

    // ── Node cases and votes ──────────────────────────────────────────────────

    /// Open a node case and materialize one pending vote per approver.
    async fn open_node_case(
        &self,
        snapshot: &mut Self::Snapshot,
        flow_instance_id: i64,
        sign_mode: SignMode,
        sort_key: i32,
        approvers: &[i64],
        opened_at: DateTime<Utc>,
    ) -> Result<(NodeCase, Vec<NodeVote>), StorageError>;

    async fn get_node_case(
        &self,
        snapshot: &mut Self::Snapshot,
        node_case_id: i64,
    ) -> Result<Option<NodeCase>, StorageError>;

    /// Persist `result` and `resolved_at` of a node case.
    async fn update_node_case(
        &self,
        snapshot: &mut Self::Snapshot,
        node_case: &NodeCase,
    ) -> Result<(), StorageError>;

    async fn get_vote_for_update(
        &self,
        snapshot: &mut Self::Snapshot,
        vote_id: i64,
    ) -> Result<Option<NodeVote>, StorageError>;

    /// Persist `decision` and `cast_at` of a vote.
    async fn update_vote(
        &self,
        snapshot: &mut Self::Snapshot,
        vote: &NodeVote,
    ) -> Result<(), StorageError>;

    async fn list_votes(
        &self,
        snapshot: &mut Self::Snapshot,
        node_case_id: i64,
    ) -> Result<Vec<NodeVote>, StorageError>;

    /// Delete the still-pending votes of a node case. Returns how many went.
    async fn delete_pending_votes(
        &self,
        snapshot: &mut Self::Snapshot,
        node_case_id: i64,
    ) -> Result<u64, StorageError>;

    async fn insert_cc_records(
        &self,
        snapshot: &mut Self::Snapshot,
        records: &[CcRecord],
    ) -> Result<(), StorageError>;

    // ── Orders and payments ───────────────────────────────────────────────────

    async fn get_order(
        &self,
        snapshot: &mut Self::Snapshot,
        order_id: i64,
    ) -> Result<Option<Order>, StorageError>;

    /// Child orders of an order, ascending by id.
    async fn list_child_orders(
        &self,
        snapshot: &mut Self::Snapshot,
        order_id: i64,
    ) -> Result<Vec<ChildOrder>, StorageError>;

    async fn update_order_status(
        &self,
        snapshot: &mut Self::Snapshot,
        order_id: i64,
        status: OrderStatus,
    ) -> Result<(), StorageError>;

    async fn update_child_order_status(
        &self,
        snapshot: &mut Self::Snapshot,
        child_order_id: i64,
        status: ChildOrderStatus,
    ) -> Result<(), StorageError>;

    /// Record a confirmed payment unless `(id, source)` is already known.
    /// A known payment that belongs to another order is a `Conflict`.
    async fn record_payment(
        &self,
        snapshot: &mut Self::Snapshot,
        payment: &SaleAllocation,
        confirmed_at: DateTime<Utc>,
    ) -> Result<(), StorageError>;

    /// Confirmed payments of an order, ascending by payment id.
    async fn list_payments(
        &self,
        snapshot: &mut Self::Snapshot,
        order_id: i64,
    ) -> Result<Vec<Payment>, StorageError>;

    // ── Ledger ────────────────────────────────────────────────────────────────

    /// All ledger entries of an order, ascending by entry id.
    async fn list_ledger_entries(
        &self,
        snapshot: &mut Self::Snapshot,
        order_id: i64,
    ) -> Result<Vec<LedgerEntry>, StorageError>;

    /// Whether any Sale entry exists for `(payment_id, order_id, source)`.
    async fn sale_exists(
        &self,
        snapshot: &mut Self::Snapshot,
        payment_id: i64,
        order_id: i64,
        source: PaymentSource,
    ) -> Result<bool, StorageError>;

    async fn append_ledger_entries(
        &self,
        snapshot: &mut Self::Snapshot,
        entries: &[NewLedgerEntry],
        created_at: DateTime<Utc>,
    ) -> Result<Vec<LedgerEntry>, StorageError>;

    // ── Refunds ───────────────────────────────────────────────────────────────

    async fn insert_refund_order(
        &self,
        snapshot: &mut Self::Snapshot,
        refund: NewRefundOrder,
    ) -> Result<RefundOrder, StorageError>;

    async fn get_refund_order(
        &self,
        snapshot: &mut Self::Snapshot,
        refund_order_id: i64,
    ) -> Result<Option<RefundOrder>, StorageError>;

    async fn find_refund_by_flow_instance(
        &self,
        snapshot: &mut Self::Snapshot,
        flow_instance_id: i64,
    ) -> Result<Option<RefundOrder>, StorageError>;

    /// Most recently submitted refund without a linked flow instance whose
    /// submission time lies in `[from, to]`.
    async fn find_unlinked_refund_submitted_between(
        &self,
        snapshot: &mut Self::Snapshot,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Option<RefundOrder>, StorageError>;

    async fn list_refund_items(
        &self,
        snapshot: &mut Self::Snapshot,
        refund_order_id: i64,
    ) -> Result<Vec<RefundItem>, StorageError>;

    async fn list_refund_payments(
        &self,
        snapshot: &mut Self::Snapshot,
        refund_order_id: i64,
    ) -> Result<Vec<RefundPayment>, StorageError>;

    /// Payment withdrawal rows of every approved refund order of an order.
    async fn list_approved_refund_payments(
        &self,
        snapshot: &mut Self::Snapshot,
        order_id: i64,
    ) -> Result<Vec<RefundPayment>, StorageError>;

    /// Set the status of a refund order together with its items and
    /// payment withdrawal rows.
    async fn set_refund_status(
        &self,
        snapshot: &mut Self::Snapshot,
        refund_order_id: i64,
        status: RefundStatus,
    ) -> Result<(), StorageError>;

    /// Total amount of every approved refund order of an order.
    async fn approved_refund_total(
        &self,
        snapshot: &mut Self::Snapshot,
        order_id: i64,
    ) -> Result<BigDecimal, StorageError>;
}
