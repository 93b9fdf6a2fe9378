//! Shared fixtures for the back office integration tests.
//!
//! Every test runs against a fresh `MemoryStore` seeded with one order
//! (id 1, student 7) made of child orders C1 (id 11) and C2 (id 12).

#![allow(dead_code)]

use std::str::FromStr;
use std::sync::Arc;

use bigdecimal::BigDecimal;
use chrono::{DateTime, Duration, Utc};

use tutor_backoffice::models::{
    Ballot, ChildOrder, ChildOrderStatus, FlowCategory, FlowTemplate, LedgerEntry, NodeResult,
    NodeVote, NotifyTarget, Order, OrderStatus, PaymentSource, RefundItem, RefundItemInput,
    RefundOrder, RefundPayment, RefundPaymentInput, RefundStatus, RefundSubmission,
    SaleAllocation, SignMode, TemplateNode, VoteDecision,
};
use tutor_backoffice::{BackOffice, MemoryStore};

pub const ORDER_ID: i64 = 1;
pub const STUDENT_ID: i64 = 7;
pub const C1: i64 = 11;
pub const C2: i64 = 12;

pub const REFUND_TEMPLATE: i64 = 100;
pub const GENERAL_TEMPLATE: i64 = 200;
pub const FINANCE_APPROVER: i64 = 501;
pub const CLERK: i64 = 42;

pub type Office = Arc<BackOffice<MemoryStore>>;

pub fn money(value: &str) -> BigDecimal {
    BigDecimal::from_str(value).unwrap()
}

pub fn node(sort_key: i32, sign_mode: SignMode, approvers: &[i64]) -> TemplateNode {
    TemplateNode {
        sort_key,
        sign_mode,
        approvers: approvers.to_vec(),
    }
}

pub fn template(id: i64, category: FlowCategory, nodes: Vec<TemplateNode>) -> FlowTemplate {
    FlowTemplate {
        id,
        name: format!("template-{id}"),
        category,
        enabled: true,
        nodes,
        notify: vec![NotifyTarget {
            principal_id: 900,
            note: "finance desk".to_string(),
        }],
    }
}

/// A back office over an empty store.
pub fn empty_office() -> Office {
    Arc::new(BackOffice::new(
        Arc::new(MemoryStore::new()),
        Duration::seconds(5),
    ))
}

/// A back office seeded with the order, a one-node refund template approved
/// by `FINANCE_APPROVER`, and a one-node general template.
pub async fn office_with_order(c1: &str, c2: &str) -> Office {
    let office = empty_office();
    let store = office.store();
    store
        .add_order(
            Order {
                id: ORDER_ID,
                student_id: STUDENT_ID,
                receivable: money(c1) + money(c2),
                status: OrderStatus::Unpaid,
            },
            vec![child(C1, c1), child(C2, c2)],
        )
        .await;
    store
        .add_template(template(
            REFUND_TEMPLATE,
            FlowCategory::Refund,
            vec![node(10, SignMode::Any, &[FINANCE_APPROVER])],
        ))
        .await;
    store
        .add_template(template(
            GENERAL_TEMPLATE,
            FlowCategory::General,
            vec![node(10, SignMode::All, &[1, 2])],
        ))
        .await;
    office
}

fn child(id: i64, receivable: &str) -> ChildOrder {
    ChildOrder {
        id,
        order_id: ORDER_ID,
        goods_id: id * 100,
        receivable: money(receivable),
        status: ChildOrderStatus::Unpaid,
    }
}

pub fn payment(payment_id: i64, amount: &str) -> SaleAllocation {
    SaleAllocation {
        payment_id,
        order_id: ORDER_ID,
        source: PaymentSource::Regular,
        student_id: STUDENT_ID,
        amount: money(amount),
    }
}

pub fn refund_request(items: &[(i64, &str)], payments: &[(i64, &str)]) -> RefundSubmission {
    RefundSubmission {
        order_id: ORDER_ID,
        student_id: STUDENT_ID,
        template_id: REFUND_TEMPLATE,
        initiator: CLERK,
        reason: "course cancelled".to_string(),
        items: items
            .iter()
            .map(|(child_order_id, amount)| RefundItemInput {
                child_order_id: *child_order_id,
                amount: money(amount),
            })
            .collect(),
        payments: payments
            .iter()
            .map(|(payment_id, amount)| RefundPaymentInput {
                payment_id: *payment_id,
                source: PaymentSource::Regular,
                amount: money(amount),
            })
            .collect(),
    }
}

/// Seed a refund order stored without a link to any flow instance.
pub async fn seed_unlinked_refund(
    office: &Office,
    id: i64,
    submitted_at: DateTime<Utc>,
    child_order_id: i64,
    payment_id: i64,
    amount: &str,
) {
    office
        .store()
        .add_refund_order(
            RefundOrder {
                id,
                order_id: ORDER_ID,
                student_id: STUDENT_ID,
                amount: money(amount),
                status: RefundStatus::Pending,
                reason: "legacy submission".to_string(),
                flow_instance_id: None,
                submitted_at,
            },
            vec![RefundItem {
                id: id + 1,
                refund_order_id: id,
                child_order_id,
                amount: money(amount),
                status: RefundStatus::Pending,
            }],
            vec![RefundPayment {
                id: id + 2,
                refund_order_id: id,
                payment_id,
                payment_source: PaymentSource::Regular,
                amount: money(amount),
                status: RefundStatus::Pending,
            }],
        )
        .await;
}

/// Votes still awaiting a decision on the open node of an instance.
pub async fn open_votes(office: &Office, instance_id: i64) -> Vec<NodeVote> {
    let state = office.store().read().await;
    state
        .node_cases_for(instance_id)
        .into_iter()
        .filter(|case| case.result == NodeResult::Pending)
        .flat_map(|case| state.votes_for(case.id))
        .filter(|vote| vote.decision == VoteDecision::Pending)
        .collect()
}

pub async fn ledger(office: &Office) -> Vec<LedgerEntry> {
    office.store().read().await.ledger_for(ORDER_ID)
}

pub async fn order_status(office: &Office) -> OrderStatus {
    office.store().read().await.orders[&ORDER_ID].status
}

pub async fn child_status(office: &Office, child_order_id: i64) -> ChildOrderStatus {
    office.store().read().await.child_orders[&child_order_id].status
}

pub async fn refund_status(office: &Office, refund_order_id: i64) -> RefundStatus {
    office.store().read().await.refund_orders[&refund_order_id].status
}

/// Submit a refund and approve (or reject) its one-node flow.
pub async fn decide_refund(office: &Office, request: RefundSubmission, approve: bool) -> i64 {
    let (refund, instance) = office.submit_refund(&request).await.unwrap();
    let votes = open_votes(office, instance.id).await;
    assert_eq!(votes.len(), 1);
    let ballot = if approve { Ballot::Pass } else { Ballot::Reject };
    office
        .cast_vote(votes[0].id, FINANCE_APPROVER, ballot)
        .await
        .unwrap();
    refund.id
}
