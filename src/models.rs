//! Domain models for the back office core.
//!
//! Database rows derive `sqlx::FromRow` and map onto the tables created in
//! `migrations/`; status enums map onto the matching Postgres enum types.
//! Request/response shapes for the HTTP shell live at the bottom.

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Enumerations
// ============================================================================

/// How a node's approver set signs off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "sign_mode", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SignMode {
    /// Countersign: every approver must pass.
    All,
    /// Or-sign: one pass is enough.
    Any,
}

/// Business category of a template; selects the completion handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "flow_category", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum FlowCategory {
    Refund,
    General,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "flow_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum FlowStatus {
    Pending,
    Approved,
    Rejected,
    Cancelled,
}

impl FlowStatus {
    pub fn is_terminal(self) -> bool {
        self != FlowStatus::Pending
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "node_result", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum NodeResult {
    Pending,
    Passed,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "vote_decision", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum VoteDecision {
    Pending,
    Pass,
    Reject,
}

/// A decision an approver can actually cast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Ballot {
    Pass,
    Reject,
}

impl From<Ballot> for VoteDecision {
    fn from(ballot: Ballot) -> Self {
        match ballot {
            Ballot::Pass => VoteDecision::Pass,
            Ballot::Reject => VoteDecision::Reject,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "payment_source", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PaymentSource {
    Regular,
    Marketplace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "entry_kind", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Sale,
    Chargeback,
    Refund,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "child_order_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ChildOrderStatus {
    Unpaid,
    Partial,
    Paid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "order_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Unpaid,
    PartialPaid,
    Paid,
    /// Set while a refund awaits its approval flow.
    Refunding,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "refund_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RefundStatus {
    Pending,
    Approved,
    Rejected,
}

// ============================================================================
// Workflow templates (owned by the surrounding system, read here)
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateNode {
    pub sort_key: i32,
    pub sign_mode: SignMode,
    pub approvers: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotifyTarget {
    pub principal_id: i64,
    pub note: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowTemplate {
    pub id: i64,
    pub name: String,
    pub category: FlowCategory,
    pub enabled: bool,
    pub nodes: Vec<TemplateNode>,
    pub notify: Vec<NotifyTarget>,
}

impl FlowTemplate {
    /// Immutable copy of the template taken when an instance starts.
    pub fn snapshot(&self) -> TemplateSnapshot {
        let mut nodes = self.nodes.clone();
        nodes.sort_by_key(|node| node.sort_key);
        TemplateSnapshot {
            template_name: self.name.clone(),
            nodes,
            notify: self.notify.clone(),
        }
    }
}

/// Node list, approver sets and notify list frozen into a flow instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateSnapshot {
    pub template_name: String,
    /// Sorted by ascending `sort_key`.
    pub nodes: Vec<TemplateNode>,
    pub notify: Vec<NotifyTarget>,
}

impl TemplateSnapshot {
    pub fn first_node(&self) -> Option<&TemplateNode> {
        self.nodes.first()
    }

    pub fn node_after(&self, sort_key: i32) -> Option<&TemplateNode> {
        self.nodes.iter().find(|node| node.sort_key > sort_key)
    }
}

// ============================================================================
// Workflow runtime rows
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct FlowInstance {
    pub id: i64,
    pub template_id: i64,
    pub category: FlowCategory,
    pub current_step: i32,
    pub status: FlowStatus,
    pub initiator: i64,
    #[sqlx(json)]
    pub template: TemplateSnapshot,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewFlowInstance {
    pub template_id: i64,
    pub category: FlowCategory,
    pub initiator: i64,
    pub template: TemplateSnapshot,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct NodeCase {
    pub id: i64,
    pub flow_instance_id: i64,
    pub sign_mode: SignMode,
    pub sort_key: i32,
    pub result: NodeResult,
    pub opened_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct NodeVote {
    pub id: i64,
    pub node_case_id: i64,
    pub approver_id: i64,
    pub decision: VoteDecision,
    pub cast_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct CcRecord {
    pub flow_instance_id: i64,
    pub principal_id: i64,
    pub note: String,
}

// ============================================================================
// Orders, payments and the allocation ledger
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Order {
    pub id: i64,
    pub student_id: i64,
    pub receivable: BigDecimal,
    pub status: OrderStatus,
}

/// One line item of an order, tracked for payment on its own.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ChildOrder {
    pub id: i64,
    pub order_id: i64,
    pub goods_id: i64,
    pub receivable: BigDecimal,
    pub status: ChildOrderStatus,
}

/// A confirmed regular or marketplace payment against an order.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Payment {
    pub id: i64,
    pub order_id: i64,
    pub student_id: i64,
    pub source: PaymentSource,
    pub amount: BigDecimal,
    pub confirmed_at: DateTime<Utc>,
}

/// A row of the append-only "separate account" ledger.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct LedgerEntry {
    pub id: i64,
    pub student_id: i64,
    pub order_id: i64,
    pub child_order_id: i64,
    pub payment_id: i64,
    pub payment_source: PaymentSource,
    pub goods_id: i64,
    pub amount: BigDecimal,
    pub kind: EntryKind,
    pub parent_entry_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewLedgerEntry {
    pub student_id: i64,
    pub order_id: i64,
    pub child_order_id: i64,
    pub payment_id: i64,
    pub payment_source: PaymentSource,
    pub goods_id: i64,
    pub amount: BigDecimal,
    pub kind: EntryKind,
    pub parent_entry_id: Option<i64>,
}

// ============================================================================
// Refunds
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct RefundOrder {
    pub id: i64,
    pub order_id: i64,
    pub student_id: i64,
    pub amount: BigDecimal,
    pub status: RefundStatus,
    pub reason: String,
    /// Flow instance spawned for this refund, when it was linked at submission.
    pub flow_instance_id: Option<i64>,
    pub submitted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct RefundItem {
    pub id: i64,
    pub refund_order_id: i64,
    pub child_order_id: i64,
    pub amount: BigDecimal,
    pub status: RefundStatus,
}

/// How much of one original payment a refund claws back.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct RefundPayment {
    pub id: i64,
    pub refund_order_id: i64,
    pub payment_id: i64,
    pub payment_source: PaymentSource,
    pub amount: BigDecimal,
    pub status: RefundStatus,
}

#[derive(Debug, Clone)]
pub struct NewRefundOrder {
    pub order_id: i64,
    pub student_id: i64,
    pub amount: BigDecimal,
    pub reason: String,
    pub flow_instance_id: Option<i64>,
    pub submitted_at: DateTime<Utc>,
    pub items: Vec<RefundItemInput>,
    pub payments: Vec<RefundPaymentInput>,
}

// ============================================================================
// Operation inputs (also the JSON request bodies)
// ============================================================================

/// Arguments of `AllocateSale`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaleAllocation {
    pub payment_id: i64,
    pub order_id: i64,
    pub source: PaymentSource,
    pub student_id: i64,
    pub amount: BigDecimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefundItemInput {
    pub child_order_id: i64,
    pub amount: BigDecimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefundPaymentInput {
    pub payment_id: i64,
    pub source: PaymentSource,
    pub amount: BigDecimal,
}

/// A refund request together with the template its approval flow runs on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefundSubmission {
    pub order_id: i64,
    pub student_id: i64,
    pub template_id: i64,
    pub initiator: i64,
    pub reason: String,
    pub items: Vec<RefundItemInput>,
    pub payments: Vec<RefundPaymentInput>,
}

#[derive(Debug, Deserialize)]
pub struct CreateFlowRequest {
    pub template_id: i64,
    pub initiator: i64,
}

#[derive(Debug, Deserialize)]
pub struct CancelFlowRequest {
    pub requester: i64,
}

#[derive(Debug, Deserialize)]
pub struct CastVoteRequest {
    pub voter: i64,
    pub decision: Ballot,
}

// ============================================================================
// Response Models
// ============================================================================

/// Generic API response wrapper.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub data: T,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FlowCreatedResponse {
    pub instance_id: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct VoteResponse {
    pub vote_id: i64,
    /// `pending`, `passed` or `rejected` for the node the vote belongs to.
    pub node_result: NodeResult,
    pub node_case_id: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RefundSubmittedResponse {
    pub refund_order_id: i64,
    pub flow_instance_id: i64,
}
