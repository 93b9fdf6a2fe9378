//! In-memory implementation of `BackOfficeStore`.
//!
//! Deterministic and test-friendly. A snapshot holds the store-wide lock for
//! its whole lifetime and works on a private copy of the state, which replaces
//! the shared state on commit. Snapshots are therefore fully serialized, which
//! subsumes the row locks the Postgres backend takes.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::error::StorageError;
use crate::models::{
    CcRecord, ChildOrder, ChildOrderStatus, EntryKind, FlowInstance, FlowStatus, FlowTemplate,
    LedgerEntry, NewFlowInstance, NewLedgerEntry, NewRefundOrder, NodeCase, NodeResult, NodeVote,
    Order, OrderStatus, Payment, PaymentSource, RefundItem, RefundOrder, RefundPayment,
    RefundStatus, SaleAllocation, SignMode, VoteDecision,
};
use crate::store::{payment_conflict, BackOfficeStore};

/// Every table of the back office, held in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryState {
    pub templates: BTreeMap<i64, FlowTemplate>,
    pub flow_instances: BTreeMap<i64, FlowInstance>,
    pub node_cases: BTreeMap<i64, NodeCase>,
    pub votes: BTreeMap<i64, NodeVote>,
    pub cc_records: Vec<CcRecord>,
    pub orders: BTreeMap<i64, Order>,
    pub child_orders: BTreeMap<i64, ChildOrder>,
    pub payments: Vec<Payment>,
    pub ledger: Vec<LedgerEntry>,
    pub refund_orders: BTreeMap<i64, RefundOrder>,
    pub refund_items: Vec<RefundItem>,
    pub refund_payments: Vec<RefundPayment>,
    next_id: i64,
}

impl MemoryState {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn reserve(&mut self, id: i64) {
        self.next_id = self.next_id.max(id);
    }

    /// Ledger entries of one order, in insertion order.
    pub fn ledger_for(&self, order_id: i64) -> Vec<LedgerEntry> {
        self.ledger
            .iter()
            .filter(|entry| entry.order_id == order_id)
            .cloned()
            .collect()
    }

    /// Node cases of one instance, in opening order.
    pub fn node_cases_for(&self, flow_instance_id: i64) -> Vec<NodeCase> {
        self.node_cases
            .values()
            .filter(|case| case.flow_instance_id == flow_instance_id)
            .cloned()
            .collect()
    }

    pub fn votes_for(&self, node_case_id: i64) -> Vec<NodeVote> {
        self.votes
            .values()
            .filter(|vote| vote.node_case_id == node_case_id)
            .cloned()
            .collect()
    }
}

/// Snapshot of a `MemoryStore`: the held lock plus the working copy.
pub struct MemorySnapshot {
    guard: OwnedMutexGuard<MemoryState>,
    working: MemoryState,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the committed state.
    pub async fn read(&self) -> MemoryState {
        self.state.lock().await.clone()
    }

    pub async fn add_template(&self, template: FlowTemplate) {
        let mut state = self.state.lock().await;
        state.reserve(template.id);
        state.templates.insert(template.id, template);
    }

    pub async fn add_order(&self, order: Order, child_orders: Vec<ChildOrder>) {
        let mut state = self.state.lock().await;
        state.reserve(order.id);
        for child in child_orders {
            state.reserve(child.id);
            state.child_orders.insert(child.id, child);
        }
        state.orders.insert(order.id, order);
    }

    /// Seed a refund order as the submission step of the surrounding system
    /// would have stored it.
    pub async fn add_refund_order(
        &self,
        refund: RefundOrder,
        items: Vec<RefundItem>,
        payments: Vec<RefundPayment>,
    ) {
        let mut state = self.state.lock().await;
        state.reserve(refund.id);
        for item in &items {
            state.reserve(item.id);
        }
        for payment in &payments {
            state.reserve(payment.id);
        }
        state.refund_items.extend(items);
        state.refund_payments.extend(payments);
        state.refund_orders.insert(refund.id, refund);
    }
}

fn not_found(entity: &'static str, id: i64) -> StorageError {
    StorageError::NotFound { entity, id }
}

#[async_trait]
impl BackOfficeStore for MemoryStore {
    type Snapshot = MemorySnapshot;

    async fn begin_snapshot(&self) -> Result<MemorySnapshot, StorageError> {
        let guard = self.state.clone().lock_owned().await;
        let working = guard.clone();
        Ok(MemorySnapshot { guard, working })
    }

    async fn commit_snapshot(&self, snapshot: MemorySnapshot) -> Result<(), StorageError> {
        let MemorySnapshot { mut guard, working } = snapshot;
        *guard = working;
        Ok(())
    }

    async fn abort_snapshot(&self, snapshot: MemorySnapshot) -> Result<(), StorageError> {
        drop(snapshot);
        Ok(())
    }

    async fn get_template(
        &self,
        snapshot: &mut MemorySnapshot,
        template_id: i64,
    ) -> Result<Option<FlowTemplate>, StorageError> {
        Ok(snapshot.working.templates.get(&template_id).cloned())
    }

    async fn insert_flow_instance(
        &self,
        snapshot: &mut MemorySnapshot,
        instance: NewFlowInstance,
    ) -> Result<FlowInstance, StorageError> {
        let state = &mut snapshot.working;
        let record = FlowInstance {
            id: state.next_id(),
            template_id: instance.template_id,
            category: instance.category,
            current_step: 0,
            status: FlowStatus::Pending,
            initiator: instance.initiator,
            template: instance.template,
            created_at: instance.created_at,
            completed_at: None,
        };
        state.flow_instances.insert(record.id, record.clone());
        Ok(record)
    }

    async fn get_flow_instance_for_update(
        &self,
        snapshot: &mut MemorySnapshot,
        instance_id: i64,
    ) -> Result<Option<FlowInstance>, StorageError> {
        Ok(snapshot.working.flow_instances.get(&instance_id).cloned())
    }

    async fn update_flow_instance(
        &self,
        snapshot: &mut MemorySnapshot,
        instance: &FlowInstance,
    ) -> Result<(), StorageError> {
        let stored = snapshot
            .working
            .flow_instances
            .get_mut(&instance.id)
            .ok_or_else(|| not_found("flow instance", instance.id))?;
        stored.status = instance.status;
        stored.current_step = instance.current_step;
        stored.completed_at = instance.completed_at;
        Ok(())
    }

    async fn open_node_case(
        &self,
        snapshot: &mut MemorySnapshot,
        flow_instance_id: i64,
        sign_mode: SignMode,
        sort_key: i32,
        approvers: &[i64],
        opened_at: DateTime<Utc>,
    ) -> Result<(NodeCase, Vec<NodeVote>), StorageError> {
        let state = &mut snapshot.working;
        let node_case = NodeCase {
            id: state.next_id(),
            flow_instance_id,
            sign_mode,
            sort_key,
            result: NodeResult::Pending,
            opened_at,
            resolved_at: None,
        };
        state.node_cases.insert(node_case.id, node_case.clone());

        let mut votes = Vec::with_capacity(approvers.len());
        for approver_id in approvers {
            let vote = NodeVote {
                id: state.next_id(),
                node_case_id: node_case.id,
                approver_id: *approver_id,
                decision: VoteDecision::Pending,
                cast_at: None,
            };
            state.votes.insert(vote.id, vote.clone());
            votes.push(vote);
        }
        Ok((node_case, votes))
    }

    async fn get_node_case(
        &self,
        snapshot: &mut MemorySnapshot,
        node_case_id: i64,
    ) -> Result<Option<NodeCase>, StorageError> {
        Ok(snapshot.working.node_cases.get(&node_case_id).cloned())
    }

    async fn update_node_case(
        &self,
        snapshot: &mut MemorySnapshot,
        node_case: &NodeCase,
    ) -> Result<(), StorageError> {
        let stored = snapshot
            .working
            .node_cases
            .get_mut(&node_case.id)
            .ok_or_else(|| not_found("node case", node_case.id))?;
        stored.result = node_case.result;
        stored.resolved_at = node_case.resolved_at;
        Ok(())
    }

    async fn get_vote_for_update(
        &self,
        snapshot: &mut MemorySnapshot,
        vote_id: i64,
    ) -> Result<Option<NodeVote>, StorageError> {
        Ok(snapshot.working.votes.get(&vote_id).cloned())
    }

    async fn update_vote(
        &self,
        snapshot: &mut MemorySnapshot,
        vote: &NodeVote,
    ) -> Result<(), StorageError> {
        let stored = snapshot
            .working
            .votes
            .get_mut(&vote.id)
            .ok_or_else(|| not_found("vote", vote.id))?;
        stored.decision = vote.decision;
        stored.cast_at = vote.cast_at;
        Ok(())
    }

    async fn list_votes(
        &self,
        snapshot: &mut MemorySnapshot,
        node_case_id: i64,
    ) -> Result<Vec<NodeVote>, StorageError> {
        Ok(snapshot.working.votes_for(node_case_id))
    }

    async fn delete_pending_votes(
        &self,
        snapshot: &mut MemorySnapshot,
        node_case_id: i64,
    ) -> Result<u64, StorageError> {
        let votes = &mut snapshot.working.votes;
        let before = votes.len();
        votes.retain(|_, vote| {
            !(vote.node_case_id == node_case_id && vote.decision == VoteDecision::Pending)
        });
        Ok((before - votes.len()) as u64)
    }

    async fn insert_cc_records(
        &self,
        snapshot: &mut MemorySnapshot,
        records: &[CcRecord],
    ) -> Result<(), StorageError> {
        snapshot.working.cc_records.extend_from_slice(records);
        Ok(())
    }

    async fn get_order(
        &self,
        snapshot: &mut MemorySnapshot,
        order_id: i64,
    ) -> Result<Option<Order>, StorageError> {
        Ok(snapshot.working.orders.get(&order_id).cloned())
    }

    async fn list_child_orders(
        &self,
        snapshot: &mut MemorySnapshot,
        order_id: i64,
    ) -> Result<Vec<ChildOrder>, StorageError> {
        Ok(snapshot
            .working
            .child_orders
            .values()
            .filter(|child| child.order_id == order_id)
            .cloned()
            .collect())
    }

    async fn update_order_status(
        &self,
        snapshot: &mut MemorySnapshot,
        order_id: i64,
        status: OrderStatus,
    ) -> Result<(), StorageError> {
        let order = snapshot
            .working
            .orders
            .get_mut(&order_id)
            .ok_or_else(|| not_found("order", order_id))?;
        order.status = status;
        Ok(())
    }

    async fn update_child_order_status(
        &self,
        snapshot: &mut MemorySnapshot,
        child_order_id: i64,
        status: ChildOrderStatus,
    ) -> Result<(), StorageError> {
        let child = snapshot
            .working
            .child_orders
            .get_mut(&child_order_id)
            .ok_or_else(|| not_found("child order", child_order_id))?;
        child.status = status;
        Ok(())
    }

    async fn record_payment(
        &self,
        snapshot: &mut MemorySnapshot,
        payment: &SaleAllocation,
        confirmed_at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let payments = &mut snapshot.working.payments;
        if let Some(known) = payments
            .iter()
            .find(|p| p.id == payment.payment_id && p.source == payment.source)
        {
            if known.order_id != payment.order_id {
                return Err(payment_conflict(payment, known.order_id));
            }
            return Ok(());
        }
        payments.push(Payment {
            id: payment.payment_id,
            order_id: payment.order_id,
            student_id: payment.student_id,
            source: payment.source,
            amount: payment.amount.clone(),
            confirmed_at,
        });
        Ok(())
    }

    async fn list_payments(
        &self,
        snapshot: &mut MemorySnapshot,
        order_id: i64,
    ) -> Result<Vec<Payment>, StorageError> {
        let mut payments: Vec<Payment> = snapshot
            .working
            .payments
            .iter()
            .filter(|p| p.order_id == order_id)
            .cloned()
            .collect();
        payments.sort_by_key(|p| (p.id, p.source));
        Ok(payments)
    }

    async fn list_ledger_entries(
        &self,
        snapshot: &mut MemorySnapshot,
        order_id: i64,
    ) -> Result<Vec<LedgerEntry>, StorageError> {
        Ok(snapshot.working.ledger_for(order_id))
    }

    async fn sale_exists(
        &self,
        snapshot: &mut MemorySnapshot,
        payment_id: i64,
        order_id: i64,
        source: PaymentSource,
    ) -> Result<bool, StorageError> {
        Ok(snapshot.working.ledger.iter().any(|entry| {
            entry.kind == EntryKind::Sale
                && entry.payment_id == payment_id
                && entry.order_id == order_id
                && entry.payment_source == source
        }))
    }

    async fn append_ledger_entries(
        &self,
        snapshot: &mut MemorySnapshot,
        entries: &[NewLedgerEntry],
        created_at: DateTime<Utc>,
    ) -> Result<Vec<LedgerEntry>, StorageError> {
        let state = &mut snapshot.working;
        let mut written = Vec::with_capacity(entries.len());
        for entry in entries {
            let record = LedgerEntry {
                id: state.next_id(),
                student_id: entry.student_id,
                order_id: entry.order_id,
                child_order_id: entry.child_order_id,
                payment_id: entry.payment_id,
                payment_source: entry.payment_source,
                goods_id: entry.goods_id,
                amount: entry.amount.clone(),
                kind: entry.kind,
                parent_entry_id: entry.parent_entry_id,
                created_at,
            };
            state.ledger.push(record.clone());
            written.push(record);
        }
        Ok(written)
    }

    async fn insert_refund_order(
        &self,
        snapshot: &mut MemorySnapshot,
        refund: NewRefundOrder,
    ) -> Result<RefundOrder, StorageError> {
        let state = &mut snapshot.working;
        let record = RefundOrder {
            id: state.next_id(),
            order_id: refund.order_id,
            student_id: refund.student_id,
            amount: refund.amount,
            status: RefundStatus::Pending,
            reason: refund.reason,
            flow_instance_id: refund.flow_instance_id,
            submitted_at: refund.submitted_at,
        };
        for item in refund.items {
            let id = state.next_id();
            state.refund_items.push(RefundItem {
                id,
                refund_order_id: record.id,
                child_order_id: item.child_order_id,
                amount: item.amount,
                status: RefundStatus::Pending,
            });
        }
        for payment in refund.payments {
            let id = state.next_id();
            state.refund_payments.push(RefundPayment {
                id,
                refund_order_id: record.id,
                payment_id: payment.payment_id,
                payment_source: payment.source,
                amount: payment.amount,
                status: RefundStatus::Pending,
            });
        }
        state.refund_orders.insert(record.id, record.clone());
        Ok(record)
    }

    async fn get_refund_order(
        &self,
        snapshot: &mut MemorySnapshot,
        refund_order_id: i64,
    ) -> Result<Option<RefundOrder>, StorageError> {
        Ok(snapshot.working.refund_orders.get(&refund_order_id).cloned())
    }

    async fn find_refund_by_flow_instance(
        &self,
        snapshot: &mut MemorySnapshot,
        flow_instance_id: i64,
    ) -> Result<Option<RefundOrder>, StorageError> {
        Ok(snapshot
            .working
            .refund_orders
            .values()
            .find(|refund| refund.flow_instance_id == Some(flow_instance_id))
            .cloned())
    }

    async fn find_unlinked_refund_submitted_between(
        &self,
        snapshot: &mut MemorySnapshot,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Option<RefundOrder>, StorageError> {
        Ok(snapshot
            .working
            .refund_orders
            .values()
            .filter(|refund| {
                refund.flow_instance_id.is_none()
                    && refund.submitted_at >= from
                    && refund.submitted_at <= to
            })
            .max_by_key(|refund| (refund.submitted_at, refund.id))
            .cloned())
    }

    async fn list_refund_items(
        &self,
        snapshot: &mut MemorySnapshot,
        refund_order_id: i64,
    ) -> Result<Vec<RefundItem>, StorageError> {
        Ok(snapshot
            .working
            .refund_items
            .iter()
            .filter(|item| item.refund_order_id == refund_order_id)
            .cloned()
            .collect())
    }

    async fn list_refund_payments(
        &self,
        snapshot: &mut MemorySnapshot,
        refund_order_id: i64,
    ) -> Result<Vec<RefundPayment>, StorageError> {
        Ok(snapshot
            .working
            .refund_payments
            .iter()
            .filter(|payment| payment.refund_order_id == refund_order_id)
            .cloned()
            .collect())
    }

    async fn list_approved_refund_payments(
        &self,
        snapshot: &mut MemorySnapshot,
        order_id: i64,
    ) -> Result<Vec<RefundPayment>, StorageError> {
        let state = &snapshot.working;
        Ok(state
            .refund_payments
            .iter()
            .filter(|payment| {
                state
                    .refund_orders
                    .get(&payment.refund_order_id)
                    .is_some_and(|refund| {
                        refund.order_id == order_id && refund.status == RefundStatus::Approved
                    })
            })
            .cloned()
            .collect())
    }

    async fn set_refund_status(
        &self,
        snapshot: &mut MemorySnapshot,
        refund_order_id: i64,
        status: RefundStatus,
    ) -> Result<(), StorageError> {
        let state = &mut snapshot.working;
        let refund = state
            .refund_orders
            .get_mut(&refund_order_id)
            .ok_or_else(|| not_found("refund order", refund_order_id))?;
        refund.status = status;
        for item in state
            .refund_items
            .iter_mut()
            .filter(|item| item.refund_order_id == refund_order_id)
        {
            item.status = status;
        }
        for payment in state
            .refund_payments
            .iter_mut()
            .filter(|payment| payment.refund_order_id == refund_order_id)
        {
            payment.status = status;
        }
        Ok(())
    }

    async fn approved_refund_total(
        &self,
        snapshot: &mut MemorySnapshot,
        order_id: i64,
    ) -> Result<BigDecimal, StorageError> {
        Ok(snapshot
            .working
            .refund_orders
            .values()
            .filter(|refund| refund.order_id == order_id && refund.status == RefundStatus::Approved)
            .map(|refund| refund.amount.clone())
            .sum())
    }
}
