//! The "separate account" ledger: payment allocation, refund reconciliation
//! and the status projections derived from it.
//!
//! Ledger rows are append-only. Every figure the engines need (what is still
//! allocated to a child order, how much of a Sale a refund already consumed)
//! is recomputed from the rows through [`LedgerView`].

use std::collections::{HashMap, HashSet};

use bigdecimal::{BigDecimal, RoundingMode, Zero};

use crate::models::{ChildOrder, EntryKind, LedgerEntry, NewLedgerEntry, PaymentSource};

pub mod allocation;
pub mod projector;
pub mod reconcile;

/// Truncate a money amount to cents. A slice cut this way never exceeds its source.
pub fn floor_money(value: &BigDecimal) -> BigDecimal {
    value.with_scale_round(2, RoundingMode::Down)
}

/// Whether `value` is a positive amount expressible in whole cents.
pub fn is_valid_money(value: &BigDecimal) -> bool {
    *value > BigDecimal::zero() && floor_money(value) == *value
}

/// The payment a Sale entry is drawn from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PaymentKey {
    pub payment_id: i64,
    pub source: PaymentSource,
}

impl PaymentKey {
    pub fn new(payment_id: i64, source: PaymentSource) -> Self {
        Self { payment_id, source }
    }

    pub fn of(entry: &LedgerEntry) -> Self {
        Self::new(entry.payment_id, entry.payment_source)
    }
}

/// Read model over the ledger entries of one order.
pub struct LedgerView<'a> {
    entries: &'a [LedgerEntry],
    charged_back: HashSet<i64>,
    consumed: HashMap<i64, BigDecimal>,
}

impl<'a> LedgerView<'a> {
    pub fn new(entries: &'a [LedgerEntry]) -> Self {
        let mut charged_back = HashSet::new();
        let mut consumed: HashMap<i64, BigDecimal> = HashMap::new();
        for entry in entries {
            match (entry.kind, entry.parent_entry_id) {
                (EntryKind::Chargeback, Some(parent)) => {
                    charged_back.insert(parent);
                }
                (EntryKind::Refund, Some(parent)) => {
                    *consumed.entry(parent).or_insert_with(BigDecimal::zero) -= &entry.amount;
                }
                _ => {}
            }
        }
        Self {
            entries,
            charged_back,
            consumed,
        }
    }

    pub fn is_active_sale(&self, entry: &LedgerEntry) -> bool {
        entry.kind == EntryKind::Sale && !self.charged_back.contains(&entry.id)
    }

    /// Sale entries that have not been charged back, in ledger order.
    pub fn active_sales(&self) -> impl Iterator<Item = &'a LedgerEntry> + '_ {
        self.entries.iter().filter(|entry| self.is_active_sale(entry))
    }

    /// Part of a Sale not yet consumed by Refund entries.
    pub fn unconsumed(&self, sale: &LedgerEntry) -> BigDecimal {
        match self.consumed.get(&sale.id) {
            Some(consumed) => &sale.amount - consumed,
            None => sale.amount.clone(),
        }
    }

    /// Active Sale amounts plus Refund amounts booked on a child order.
    pub fn net_allocated(&self, child_order_id: i64) -> BigDecimal {
        self.entries
            .iter()
            .filter(|entry| entry.child_order_id == child_order_id)
            .filter(|entry| entry.kind == EntryKind::Refund || self.is_active_sale(entry))
            .map(|entry| entry.amount.clone())
            .sum()
    }
}

/// Who a Sale entry is booked for.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Payer {
    pub key: PaymentKey,
    pub student_id: i64,
}

/// Outstanding amount a child order can still absorb during a distribution.
#[derive(Debug, Clone)]
pub(crate) struct Need<'a> {
    pub child: &'a ChildOrder,
    pub remaining: BigDecimal,
}

/// Spread `balance` over `needs` in order, writing one Sale per child order
/// touched. Needs are decremented in place so a following payment carries on
/// where this one stopped. Returns the entries and the undistributed balance.
pub(crate) fn distribute(
    order_id: i64,
    payer: Payer,
    mut balance: BigDecimal,
    needs: &mut [Need<'_>],
) -> (Vec<NewLedgerEntry>, BigDecimal) {
    let zero = BigDecimal::zero();
    let mut entries = Vec::new();
    for need in needs.iter_mut() {
        if balance <= zero {
            break;
        }
        if need.remaining <= zero {
            continue;
        }
        let allocated = floor_money(&balance.clone().min(need.remaining.clone()));
        if allocated <= zero {
            continue;
        }
        entries.push(NewLedgerEntry {
            student_id: payer.student_id,
            order_id,
            child_order_id: need.child.id,
            payment_id: payer.key.payment_id,
            payment_source: payer.key.source,
            goods_id: need.child.goods_id,
            amount: allocated.clone(),
            kind: EntryKind::Sale,
            parent_entry_id: None,
        });
        need.remaining -= &allocated;
        balance -= &allocated;
    }
    (entries, balance)
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::str::FromStr;

    use bigdecimal::BigDecimal;
    use chrono::Utc;

    use crate::models::{ChildOrder, ChildOrderStatus, EntryKind, LedgerEntry, PaymentSource};

    pub fn money(value: &str) -> BigDecimal {
        BigDecimal::from_str(value).unwrap()
    }

    pub fn child(id: i64, receivable: &str) -> ChildOrder {
        ChildOrder {
            id,
            order_id: 1,
            goods_id: id * 10,
            receivable: money(receivable),
            status: ChildOrderStatus::Unpaid,
        }
    }

    pub fn entry(
        id: i64,
        child_order_id: i64,
        payment_id: i64,
        amount: &str,
        kind: EntryKind,
        parent_entry_id: Option<i64>,
    ) -> LedgerEntry {
        LedgerEntry {
            id,
            student_id: 7,
            order_id: 1,
            child_order_id,
            payment_id,
            payment_source: PaymentSource::Regular,
            goods_id: child_order_id * 10,
            amount: money(amount),
            kind,
            parent_entry_id,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{child, entry, money};
    use super::*;

    #[test]
    fn net_allocated_ignores_charged_back_sales_and_counts_refunds() {
        let entries = vec![
            entry(1, 11, 100, "100.00", EntryKind::Sale, None),
            entry(2, 11, 100, "-100.00", EntryKind::Chargeback, Some(1)),
            entry(3, 11, 100, "80.00", EntryKind::Sale, None),
            entry(4, 11, 100, "-30.00", EntryKind::Refund, Some(3)),
        ];
        let view = LedgerView::new(&entries);

        assert_eq!(view.net_allocated(11), money("50.00"));
        assert_eq!(view.active_sales().count(), 1);
        assert_eq!(view.unconsumed(&entries[2]), money("50.00"));
    }

    #[test]
    fn money_validity_requires_positive_whole_cents() {
        assert!(is_valid_money(&money("100.05")));
        assert!(is_valid_money(&money("100.500")));
        assert!(!is_valid_money(&money("100.005")));
        assert!(!is_valid_money(&money("0")));
        assert!(!is_valid_money(&money("-1")));
    }

    #[test]
    fn distribute_never_books_more_than_the_balance() {
        let children = vec![child(11, "100"), child(12, "200")];
        let mut needs: Vec<Need<'_>> = children
            .iter()
            .map(|child| Need {
                child,
                remaining: child.receivable.clone(),
            })
            .collect();
        let payer = Payer {
            key: PaymentKey::new(1, PaymentSource::Regular),
            student_id: 7,
        };

        let (entries, left) = distribute(1, payer, money("100.005"), &mut needs);

        let booked: BigDecimal = entries.iter().map(|e| e.amount.clone()).sum();
        assert_eq!(entries.len(), 1);
        assert_eq!(booked, money("100"));
        assert_eq!(left, money("0.005"));
    }

    #[test]
    fn distribute_carries_need_across_payments() {
        let children = vec![child(11, "100"), child(12, "200")];
        let mut needs: Vec<Need<'_>> = children
            .iter()
            .map(|child| Need {
                child,
                remaining: child.receivable.clone(),
            })
            .collect();

        let first = Payer {
            key: PaymentKey::new(1, PaymentSource::Regular),
            student_id: 7,
        };
        let (entries, left) = distribute(1, first, money("130"), &mut needs);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].amount, money("30"));
        assert!(left.is_zero());

        let second = Payer {
            key: PaymentKey::new(2, PaymentSource::Marketplace),
            student_id: 7,
        };
        let (entries, left) = distribute(1, second, money("500"), &mut needs);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].child_order_id, 12);
        assert_eq!(entries[0].amount, money("170"));
        assert_eq!(left, money("330"));
    }
}
