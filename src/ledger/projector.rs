//! Payment status projections derived from the ledger.

use std::collections::HashSet;

use bigdecimal::{BigDecimal, Zero};
use tracing::debug;

use crate::error::Result;
use crate::ledger::LedgerView;
use crate::models::{ChildOrder, ChildOrderStatus, Order, OrderStatus};
use crate::store::BackOfficeStore;

pub fn project_child_order_status(net_allocated: &BigDecimal, receivable: &BigDecimal) -> ChildOrderStatus {
    if *net_allocated <= BigDecimal::zero() {
        ChildOrderStatus::Unpaid
    } else if net_allocated >= receivable {
        ChildOrderStatus::Paid
    } else {
        ChildOrderStatus::Partial
    }
}

/// Order-level counterpart of [`project_child_order_status`]. Never yields
/// `Refunding`, which only the refund submission sets.
pub fn project_order_status(net_paid: &BigDecimal, receivable: &BigDecimal) -> OrderStatus {
    match project_child_order_status(net_paid, receivable) {
        ChildOrderStatus::Unpaid => OrderStatus::Unpaid,
        ChildOrderStatus::Partial => OrderStatus::PartialPaid,
        ChildOrderStatus::Paid => OrderStatus::Paid,
    }
}

/// Re-project and persist child order statuses. With `only`, child orders
/// outside the set are left alone.
pub async fn refresh_child_statuses<S: BackOfficeStore>(
    store: &S,
    snapshot: &mut S::Snapshot,
    child_orders: &[ChildOrder],
    view: &LedgerView<'_>,
    only: Option<&HashSet<i64>>,
) -> Result<()> {
    for child in child_orders {
        if only.is_some_and(|ids| !ids.contains(&child.id)) {
            continue;
        }
        let status = project_child_order_status(&view.net_allocated(child.id), &child.receivable);
        if status != child.status {
            debug!(
                "Child order {} status {:?} -> {:?}",
                child.id, child.status, status
            );
        }
        store
            .update_child_order_status(snapshot, child.id, status)
            .await?;
    }
    Ok(())
}

/// Net amount actually paid on an order: confirmed payments minus every
/// approved refund.
pub async fn net_order_paid<S: BackOfficeStore>(
    store: &S,
    snapshot: &mut S::Snapshot,
    order_id: i64,
) -> Result<BigDecimal> {
    let paid: BigDecimal = store
        .list_payments(snapshot, order_id)
        .await?
        .into_iter()
        .map(|payment| payment.amount)
        .sum();
    let refunded = store.approved_refund_total(snapshot, order_id).await?;
    Ok(paid - refunded)
}

/// Re-project and persist the status of an order. Returns the new status.
pub async fn refresh_order_status<S: BackOfficeStore>(
    store: &S,
    snapshot: &mut S::Snapshot,
    order: &Order,
) -> Result<OrderStatus> {
    let net_paid = net_order_paid(store, snapshot, order.id).await?;
    let status = project_order_status(&net_paid, &order.receivable);
    store.update_order_status(snapshot, order.id, status).await?;
    debug!(
        "Order {} net paid {} of {}: {:?}",
        order.id, net_paid, order.receivable, status
    );
    Ok(status)
}
