//! Refund reconciliation.
//!
//! An approved refund withdraws money from specific original payments
//! (`refund_payments`) and removes it from specific child orders
//! (`refund_items`). When the active Sale entries already route enough of
//! each withdrawn payment onto the refunded child orders, the refund is booked
//! directly against them. Otherwise the order's distribution is rebuilt first:
//!
//! 1. every active Sale is charged back;
//! 2. pass 1 books each withdrawn amount onto the refunded child orders;
//! 3. pass 2 redistributes every payment's remaining balance over every child
//!    order's remaining need.
//!
//! Either way Refund entries are then written FIFO by payment id against the
//! refunded child orders' active Sales, and all statuses are re-projected.
//! A rejected refund only restores statuses.

use std::collections::{BTreeMap, HashMap};

use bigdecimal::{BigDecimal, Zero};
use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::error::{BackOfficeError, Result};
use crate::ledger::projector::{refresh_child_statuses, refresh_order_status};
use crate::ledger::{distribute, floor_money, LedgerView, Need, Payer, PaymentKey};
use crate::models::{
    ChildOrder, EntryKind, NewLedgerEntry, OrderStatus, Payment, RefundItem, RefundPayment,
    RefundStatus,
};
use crate::store::BackOfficeStore;

/// Refund amount per child order, ascending by child order id.
pub fn refund_by_child(items: &[RefundItem]) -> BTreeMap<i64, BigDecimal> {
    let mut totals: BTreeMap<i64, BigDecimal> = BTreeMap::new();
    for item in items {
        *totals.entry(item.child_order_id).or_insert_with(BigDecimal::zero) += &item.amount;
    }
    totals
}

/// Withdrawal per original payment, ascending by payment id.
pub fn withdrawal_by_payment(payments: &[RefundPayment]) -> BTreeMap<PaymentKey, BigDecimal> {
    let mut totals: BTreeMap<PaymentKey, BigDecimal> = BTreeMap::new();
    for payment in payments {
        *totals
            .entry(PaymentKey::new(payment.payment_id, payment.payment_source))
            .or_insert_with(BigDecimal::zero) += &payment.amount;
    }
    totals
}

/// Whether the current distribution cannot carry the refund as it stands:
/// some withdrawn payment has less left on the refunded child orders than is
/// being withdrawn from it.
pub fn chargeback_required(
    view: &LedgerView<'_>,
    refund_items: &BTreeMap<i64, BigDecimal>,
    withdrawals: &BTreeMap<PaymentKey, BigDecimal>,
) -> bool {
    withdrawals.iter().any(|(key, requested)| {
        let covered: BigDecimal = view
            .active_sales()
            .filter(|sale| PaymentKey::of(sale) == *key)
            .filter(|sale| refund_items.contains_key(&sale.child_order_id))
            .map(|sale| view.unconsumed(sale))
            .sum();
        covered < *requested
    })
}

/// One Chargeback per active Sale, mirroring its amount.
pub fn plan_chargebacks(view: &LedgerView<'_>) -> Vec<NewLedgerEntry> {
    view.active_sales()
        .map(|sale| NewLedgerEntry {
            student_id: sale.student_id,
            order_id: sale.order_id,
            child_order_id: sale.child_order_id,
            payment_id: sale.payment_id,
            payment_source: sale.payment_source,
            goods_id: sale.goods_id,
            amount: -sale.amount.clone(),
            kind: EntryKind::Chargeback,
            parent_entry_id: Some(sale.id),
        })
        .collect()
}

/// Fresh Sale entries for an order whose active Sales have all been charged
/// back: pass 1 then pass 2.
pub fn plan_redistribution(
    order_id: i64,
    child_orders: &[ChildOrder],
    payments: &[Payment],
    refund_items: &BTreeMap<i64, BigDecimal>,
    withdrawals: &BTreeMap<PaymentKey, BigDecimal>,
) -> Result<Vec<NewLedgerEntry>> {
    let by_key: HashMap<PaymentKey, &Payment> = payments
        .iter()
        .map(|payment| (PaymentKey::new(payment.id, payment.source), payment))
        .collect();

    for (key, withdrawn) in withdrawals {
        let payment = by_key.get(key).ok_or_else(|| coverage_error(
            order_id,
            format!("refund withdraws from unknown payment {} ({:?})", key.payment_id, key.source),
        ))?;
        if *withdrawn > payment.amount {
            return Err(coverage_error(
                order_id,
                format!(
                    "refund withdraws {} from payment {} of only {}",
                    withdrawn, payment.id, payment.amount
                ),
            ));
        }
    }

    let mut entries = Vec::new();

    // Pass 1: withdrawn amounts go to the refunded child orders first.
    let mut refund_needs: Vec<Need<'_>> = child_orders
        .iter()
        .filter_map(|child| {
            refund_items.get(&child.id).map(|amount| Need {
                child,
                remaining: amount.clone(),
            })
        })
        .collect();
    for (key, withdrawn) in withdrawals {
        let payer = Payer {
            key: *key,
            student_id: by_key[key].student_id,
        };
        let (planned, _) = distribute(order_id, payer, withdrawn.clone(), &mut refund_needs);
        entries.extend(planned);
    }

    // Pass 2: what is left of every payment covers the rest of every child order.
    let mut needs: Vec<Need<'_>> = child_orders
        .iter()
        .map(|child| {
            let refunded = refund_items.get(&child.id).cloned().unwrap_or_else(BigDecimal::zero);
            let remaining = &child.receivable - refunded;
            Need {
                child,
                remaining: remaining.max(BigDecimal::zero()),
            }
        })
        .collect();
    let mut ordered: Vec<&Payment> = payments.iter().collect();
    ordered.sort_by_key(|payment| (payment.id, payment.source));
    for payment in ordered {
        let key = PaymentKey::new(payment.id, payment.source);
        let withdrawn = withdrawals.get(&key).cloned().unwrap_or_else(BigDecimal::zero);
        let balance = &payment.amount - withdrawn;
        if balance <= BigDecimal::zero() {
            continue;
        }
        let payer = Payer {
            key,
            student_id: payment.student_id,
        };
        let (planned, _) = distribute(order_id, payer, balance, &mut needs);
        entries.extend(planned);
    }

    Ok(entries)
}

/// Refund entries consuming each refunded child order's active Sales FIFO by
/// payment id. Each entry points at the Sale it consumed.
pub fn plan_refund_entries(
    order_id: i64,
    view: &LedgerView<'_>,
    refund_items: &BTreeMap<i64, BigDecimal>,
) -> Result<Vec<NewLedgerEntry>> {
    let zero = BigDecimal::zero();
    let mut entries = Vec::new();

    for (child_order_id, amount) in refund_items {
        let mut sales: Vec<_> = view
            .active_sales()
            .filter(|sale| sale.child_order_id == *child_order_id)
            .collect();
        sales.sort_by_key(|sale| (sale.payment_id, sale.payment_source, sale.id));

        let mut left = amount.clone();
        for sale in sales {
            if left <= zero {
                break;
            }
            let available = view.unconsumed(sale);
            if available <= zero {
                continue;
            }
            let consumed = floor_money(&available.min(left.clone()));
            entries.push(NewLedgerEntry {
                student_id: sale.student_id,
                order_id,
                child_order_id: *child_order_id,
                payment_id: sale.payment_id,
                payment_source: sale.payment_source,
                goods_id: sale.goods_id,
                amount: -consumed.clone(),
                kind: EntryKind::Refund,
                parent_entry_id: Some(sale.id),
            });
            left -= &consumed;
        }

        if left > zero {
            return Err(coverage_error(
                order_id,
                format!(
                    "child order {} lacks {} of active sales to refund {}",
                    child_order_id, left, amount
                ),
            ));
        }
    }

    Ok(entries)
}

fn coverage_error(order_id: i64, detail: String) -> BackOfficeError {
    BackOfficeError::InsufficientLedgerCoverage { order_id, detail }
}

/// Apply the decision of a refund's approval flow.
pub async fn on_refund_decision<S: BackOfficeStore>(
    store: &S,
    snapshot: &mut S::Snapshot,
    refund_order_id: i64,
    order_id: i64,
    approved: bool,
    now: DateTime<Utc>,
) -> Result<()> {
    let refund = store
        .get_refund_order(snapshot, refund_order_id)
        .await?
        .ok_or(BackOfficeError::RefundNotFound(refund_order_id))?;
    if refund.order_id != order_id {
        return Err(BackOfficeError::InvalidRefund(format!(
            "refund order {} belongs to order {}, not {}",
            refund.id, refund.order_id, order_id
        )));
    }
    if refund.status != RefundStatus::Pending {
        return Err(BackOfficeError::InvalidRefund(format!(
            "refund order {} was already {:?}",
            refund.id, refund.status
        )));
    }
    let order = store
        .get_order(snapshot, order_id)
        .await?
        .ok_or(BackOfficeError::OrderNotFound(order_id))?;

    if !approved {
        store
            .set_refund_status(snapshot, refund.id, RefundStatus::Rejected)
            .await?;
        store
            .update_order_status(snapshot, order.id, OrderStatus::PartialPaid)
            .await?;
        info!("Refund {} on order {} rejected", refund.id, order.id);
        return Ok(());
    }

    store
        .set_refund_status(snapshot, refund.id, RefundStatus::Approved)
        .await?;

    let child_orders = store.list_child_orders(snapshot, order.id).await?;
    let payments = store.list_payments(snapshot, order.id).await?;
    let refund_items = refund_by_child(&store.list_refund_items(snapshot, refund.id).await?);
    let withdrawals =
        withdrawal_by_payment(&store.list_refund_payments(snapshot, refund.id).await?);

    let ledger = store.list_ledger_entries(snapshot, order.id).await?;
    let view = LedgerView::new(&ledger);
    if chargeback_required(&view, &refund_items, &withdrawals) {
        let chargebacks = plan_chargebacks(&view);
        let sales = plan_redistribution(
            order.id,
            &child_orders,
            &payments,
            &refund_items,
            &withdrawals,
        )?;
        warn!(
            "Refund {} cannot be carried by the current distribution of order {}: charging back {} sales, re-allocating {} entries",
            refund.id,
            order.id,
            chargebacks.len(),
            sales.len()
        );
        store
            .append_ledger_entries(snapshot, &chargebacks, now)
            .await?;
        store.append_ledger_entries(snapshot, &sales, now).await?;
    }

    let ledger = store.list_ledger_entries(snapshot, order.id).await?;
    let refunds = plan_refund_entries(order.id, &LedgerView::new(&ledger), &refund_items)?;
    store.append_ledger_entries(snapshot, &refunds, now).await?;

    let ledger = store.list_ledger_entries(snapshot, order.id).await?;
    refresh_child_statuses(store, snapshot, &child_orders, &LedgerView::new(&ledger), None)
        .await?;
    let status = refresh_order_status(store, snapshot, &order).await?;

    info!(
        "Refund {} of {} on order {} approved: {} refund entries, order {:?}",
        refund.id,
        refund.amount,
        order.id,
        refunds.len(),
        status
    );
    Ok(())
}
