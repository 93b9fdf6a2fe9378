//! Refund submission: the step that feeds a refund into its approval flow.

use std::collections::{BTreeMap, HashMap, HashSet};

use bigdecimal::{BigDecimal, Zero};
use chrono::{DateTime, Utc};
use tracing::info;

use crate::error::{BackOfficeError, Result};
use crate::ledger::{is_valid_money, PaymentKey};
use crate::models::{
    FlowCategory, FlowInstance, NewRefundOrder, OrderStatus, RefundOrder, RefundSubmission,
};
use crate::store::BackOfficeStore;
use crate::workflow::instance::create_from_template;

/// Validate a refund request, start its approval flow and store the refund
/// order linked to that flow. The order is marked `Refunding` until the flow
/// completes.
pub async fn submit_refund<S: BackOfficeStore>(
    store: &S,
    snapshot: &mut S::Snapshot,
    submission: &RefundSubmission,
    now: DateTime<Utc>,
) -> Result<(RefundOrder, FlowInstance)> {
    let order = store
        .get_order(snapshot, submission.order_id)
        .await?
        .ok_or(BackOfficeError::OrderNotFound(submission.order_id))?;

    if submission.items.is_empty() || submission.payments.is_empty() {
        return Err(BackOfficeError::InvalidRefund(
            "a refund needs at least one item and one payment withdrawal".to_string(),
        ));
    }
    if submission
        .items
        .iter()
        .map(|item| &item.amount)
        .chain(submission.payments.iter().map(|payment| &payment.amount))
        .any(|amount| !is_valid_money(amount))
    {
        return Err(BackOfficeError::InvalidRefund(
            "refund amounts must be positive with at most two decimals".to_string(),
        ));
    }

    let items_total: BigDecimal = submission.items.iter().map(|item| &item.amount).sum();
    let payments_total: BigDecimal = submission
        .payments
        .iter()
        .map(|payment| &payment.amount)
        .sum();
    if items_total != payments_total {
        return Err(BackOfficeError::RefundAmountMismatch {
            items: items_total,
            payments: payments_total,
        });
    }

    let child_ids: HashSet<i64> = store
        .list_child_orders(snapshot, order.id)
        .await?
        .into_iter()
        .map(|child| child.id)
        .collect();
    if let Some(item) = submission
        .items
        .iter()
        .find(|item| !child_ids.contains(&item.child_order_id))
    {
        return Err(BackOfficeError::InvalidRefund(format!(
            "child order {} does not belong to order {}",
            item.child_order_id, order.id
        )));
    }

    // What each confirmed payment still holds after earlier approved refunds.
    let mut available: HashMap<PaymentKey, BigDecimal> = store
        .list_payments(snapshot, order.id)
        .await?
        .into_iter()
        .map(|payment| (PaymentKey::new(payment.id, payment.source), payment.amount))
        .collect();
    for withdrawn in store
        .list_approved_refund_payments(snapshot, order.id)
        .await?
    {
        if let Some(left) =
            available.get_mut(&PaymentKey::new(withdrawn.payment_id, withdrawn.payment_source))
        {
            *left -= &withdrawn.amount;
        }
    }

    let mut requested: BTreeMap<PaymentKey, BigDecimal> = BTreeMap::new();
    for payment in &submission.payments {
        *requested
            .entry(PaymentKey::new(payment.payment_id, payment.source))
            .or_insert_with(BigDecimal::zero) += &payment.amount;
    }
    for (key, amount) in &requested {
        let left = available.get(key).ok_or_else(|| {
            BackOfficeError::InvalidRefund(format!(
                "payment {} ({:?}) is not a confirmed payment of order {}",
                key.payment_id, key.source, order.id
            ))
        })?;
        if amount > left {
            return Err(BackOfficeError::InvalidRefund(format!(
                "withdrawal of {} exceeds the {} left on payment {} ({:?})",
                amount, left, key.payment_id, key.source
            )));
        }
    }

    let instance = create_from_template(
        store,
        snapshot,
        submission.template_id,
        submission.initiator,
        now,
    )
    .await?;
    if instance.category != FlowCategory::Refund {
        return Err(BackOfficeError::InvalidRefund(format!(
            "template {} is not a refund template",
            submission.template_id
        )));
    }

    let refund = store
        .insert_refund_order(
            snapshot,
            NewRefundOrder {
                order_id: order.id,
                student_id: submission.student_id,
                amount: items_total,
                reason: submission.reason.clone(),
                flow_instance_id: Some(instance.id),
                submitted_at: now,
                items: submission.items.clone(),
                payments: submission.payments.clone(),
            },
        )
        .await?;
    store
        .update_order_status(snapshot, order.id, OrderStatus::Refunding)
        .await?;

    info!(
        "Refund {} of {} submitted on order {}, awaiting flow instance {}",
        refund.id, refund.amount, order.id, instance.id
    );
    Ok((refund, instance))
}
