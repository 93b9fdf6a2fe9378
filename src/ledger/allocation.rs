//! Split-allocation of one confirmed payment across an order's child orders.
//!
//! Child orders are served first-come in ascending id order, each up to what
//! it still lacks. A payment is allocated at most once per
//! `(payment, order, source)`: a repeated call finds its Sale entries and
//! returns without writing.

use std::collections::HashSet;

use bigdecimal::{BigDecimal, Zero};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::error::{BackOfficeError, Result};
use crate::ledger::projector::{refresh_child_statuses, refresh_order_status};
use crate::ledger::{distribute, is_valid_money, LedgerView, Need, Payer, PaymentKey};
use crate::models::{ChildOrder, LedgerEntry, NewLedgerEntry, SaleAllocation};
use crate::store::BackOfficeStore;

/// Result of one `AllocateSale` call.
#[derive(Debug, Clone, Serialize)]
pub struct AllocationSummary {
    pub payment_id: i64,
    pub order_id: i64,
    /// The payment had already been allocated; nothing was written.
    pub duplicate: bool,
    pub entries: Vec<LedgerEntry>,
    /// Part of the payment no child order needed.
    pub unallocated: BigDecimal,
}

/// Sale entries for `payment` given the order's current ledger.
pub fn plan_sale(
    payment: &SaleAllocation,
    child_orders: &[ChildOrder],
    view: &LedgerView<'_>,
) -> (Vec<NewLedgerEntry>, BigDecimal) {
    let mut needs: Vec<Need<'_>> = child_orders
        .iter()
        .map(|child| Need {
            child,
            remaining: &child.receivable - view.net_allocated(child.id),
        })
        .collect();
    let payer = Payer {
        key: PaymentKey::new(payment.payment_id, payment.source),
        student_id: payment.student_id,
    };
    distribute(payment.order_id, payer, payment.amount.clone(), &mut needs)
}

pub async fn allocate_sale<S: BackOfficeStore>(
    store: &S,
    snapshot: &mut S::Snapshot,
    payment: &SaleAllocation,
    now: DateTime<Utc>,
) -> Result<AllocationSummary> {
    if !is_valid_money(&payment.amount) {
        return Err(BackOfficeError::InvalidAmount(payment.amount.clone()));
    }
    let order = store
        .get_order(snapshot, payment.order_id)
        .await?
        .ok_or(BackOfficeError::OrderNotFound(payment.order_id))?;

    if store
        .sale_exists(snapshot, payment.payment_id, order.id, payment.source)
        .await?
    {
        info!(
            "Payment {} ({:?}) already allocated on order {}, skipping",
            payment.payment_id, payment.source, order.id
        );
        return Ok(AllocationSummary {
            payment_id: payment.payment_id,
            order_id: order.id,
            duplicate: true,
            entries: Vec::new(),
            unallocated: BigDecimal::zero(),
        });
    }

    store.record_payment(snapshot, payment, now).await?;

    let child_orders = store.list_child_orders(snapshot, order.id).await?;
    let ledger = store.list_ledger_entries(snapshot, order.id).await?;
    let (planned, unallocated) = plan_sale(payment, &child_orders, &LedgerView::new(&ledger));
    let written = store
        .append_ledger_entries(snapshot, &planned, now)
        .await?;

    let touched: HashSet<i64> = written.iter().map(|entry| entry.child_order_id).collect();
    let ledger = store.list_ledger_entries(snapshot, order.id).await?;
    refresh_child_statuses(
        store,
        snapshot,
        &child_orders,
        &LedgerView::new(&ledger),
        Some(&touched),
    )
    .await?;
    let status = refresh_order_status(store, snapshot, &order).await?;

    info!(
        "Allocated payment {} ({:?}) of {} on order {}: {} entries, {} unallocated, order {:?}",
        payment.payment_id,
        payment.source,
        payment.amount,
        order.id,
        written.len(),
        unallocated,
        status
    );

    Ok(AllocationSummary {
        payment_id: payment.payment_id,
        order_id: order.id,
        duplicate: false,
        entries: written,
        unallocated,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::test_support::{child, entry, money};
    use crate::models::{EntryKind, PaymentSource};

    fn payment(id: i64, amount: &str) -> SaleAllocation {
        SaleAllocation {
            payment_id: id,
            order_id: 1,
            source: PaymentSource::Regular,
            student_id: 7,
            amount: money(amount),
        }
    }

    #[test]
    fn fills_child_orders_in_id_order() {
        let children = vec![child(11, "100"), child(12, "200")];
        let (entries, left) = plan_sale(&payment(1, "250"), &children, &LedgerView::new(&[]));

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].child_order_id, 11);
        assert_eq!(entries[0].amount, money("100"));
        assert_eq!(entries[1].child_order_id, 12);
        assert_eq!(entries[1].amount, money("150"));
        assert!(left.is_zero());
        assert!(entries.iter().all(|e| e.kind == EntryKind::Sale && e.goods_id == e.child_order_id * 10));
    }

    #[test]
    fn skips_child_orders_already_covered() {
        let children = vec![child(11, "100"), child(12, "200")];
        let ledger = vec![entry(1, 11, 9, "100", EntryKind::Sale, None)];
        let (entries, left) = plan_sale(&payment(2, "50"), &children, &LedgerView::new(&ledger));

        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].child_order_id, 12);
        assert_eq!(entries[0].amount, money("50"));
        assert!(left.is_zero());
    }

    #[test]
    fn overpayment_leaves_remainder_unallocated() {
        let children = vec![child(11, "100")];
        let (entries, left) = plan_sale(&payment(1, "130.50"), &children, &LedgerView::new(&[]));

        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].amount, money("100"));
        assert_eq!(left, money("30.50"));
    }

    #[test]
    fn refunded_amount_reopens_need() {
        let children = vec![child(11, "100")];
        let ledger = vec![
            entry(1, 11, 9, "100", EntryKind::Sale, None),
            entry(2, 11, 9, "-40", EntryKind::Refund, Some(1)),
        ];
        let (entries, _) = plan_sale(&payment(3, "100"), &children, &LedgerView::new(&ledger));

        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].amount, money("40"));
    }
}
