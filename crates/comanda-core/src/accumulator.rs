//! # Session Accumulator
//!
//! Derives the amount a table owes from the order ledger.
//!
//! ## Source of Truth
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  Ledger (orders + lines)                                               │
//! │       │                                                                 │
//! │       │  filter: same table number snapshot, branch, restaurant        │
//! │       │          ledger_at >= session_start                            │
//! │       │          status shown in the session view                      │
//! │       ▼                                                                 │
//! │  accumulate() ← THIS MODULE                                            │
//! │       │                                                                 │
//! │       ├── total        (cancelled orders EXCLUDED)                     │
//! │       └── per_product  (cancelled orders INCLUDED, flagged, for audit) │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  Table.cached_running_total  ← a copy, refreshed on every write        │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The functions here are pure: same ledger in, same totals out. Calling them
//! twice changes nothing, which is what makes them safe to run inside any
//! transaction that needs a fresh total.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::error::{CoreError, CoreResult};
use crate::money::Money;
use crate::types::{LedgerOrder, SessionKey};

// =============================================================================
// Output Types
// =============================================================================

/// Per-product breakdown of a session, for display and audit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct ProductSubtotal {
    pub product_id: String,
    pub product_name: String,
    /// Units ordered in the session, cancelled orders included.
    pub quantity: i64,
    /// Value of those units, cancelled orders included.
    pub subtotal: Money,
    /// Units that belong to cancelled orders.
    pub cancelled_quantity: i64,
    /// Value that belongs to cancelled orders.
    pub cancelled_subtotal: Money,
}

impl ProductSubtotal {
    /// What this product contributes to the bill.
    pub fn billable_subtotal(&self) -> Money {
        self.subtotal - self.cancelled_subtotal
    }
}

/// The authoritative view of one session's money.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct SessionTotals {
    /// Sum of line subtotals over billable (non-cancelled) orders.
    pub total: Money,
    /// Billable orders in the session.
    pub order_count: usize,
    /// Lines of billable orders.
    pub line_count: usize,
    /// Cancelled orders kept in the view for transparency.
    pub cancelled_order_count: usize,
    pub per_product: Vec<ProductSubtotal>,
}

impl SessionTotals {
    /// The all-zero result returned alongside `NoActiveSession`.
    pub fn empty() -> Self {
        SessionTotals::default()
    }

    /// Merges several sessions into one view (group prefactura).
    ///
    /// Products are matched by id; the first session listing a product
    /// decides its position.
    pub fn combine<'a, I>(sessions: I) -> SessionTotals
    where
        I: IntoIterator<Item = &'a SessionTotals>,
    {
        let mut combined = SessionTotals::empty();
        let mut index: HashMap<String, usize> = HashMap::new();

        for session in sessions {
            combined.total += session.total;
            combined.order_count += session.order_count;
            combined.line_count += session.line_count;
            combined.cancelled_order_count += session.cancelled_order_count;

            for product in &session.per_product {
                match index.get(&product.product_id) {
                    Some(&i) => {
                        let entry = &mut combined.per_product[i];
                        entry.quantity += product.quantity;
                        entry.subtotal += product.subtotal;
                        entry.cancelled_quantity += product.cancelled_quantity;
                        entry.cancelled_subtotal += product.cancelled_subtotal;
                    }
                    None => {
                        index.insert(product.product_id.clone(), combined.per_product.len());
                        combined.per_product.push(product.clone());
                    }
                }
            }
        }

        combined
    }
}

// =============================================================================
// Filtering
// =============================================================================

/// Whether an order belongs to the session identified by `key`.
pub fn in_session(key: &SessionKey, entry: &LedgerOrder) -> bool {
    let order = &entry.order;
    order.table_number_snapshot == Some(key.table_number)
        && order.branch_id == key.branch_id
        && order.restaurant_id == key.restaurant_id
        && order.ledger_at() >= key.since
        && order.status.in_session_view()
}

/// The ledger slice of a session, in ledger order.
///
/// Corrupt rows are surfaced, never skipped.
pub fn session_slice<'a>(
    key: &SessionKey,
    ledger: &'a [LedgerOrder],
) -> CoreResult<Vec<&'a LedgerOrder>> {
    let mut slice = Vec::new();
    for entry in ledger {
        entry.order.check_integrity()?;
        if in_session(key, entry) {
            slice.push(entry);
        }
    }
    slice.sort_by_key(|e| e.order.ledger_at());
    Ok(slice)
}

// =============================================================================
// Accumulate
// =============================================================================

/// Computes the running bill of a table session.
///
/// ## Arguments
/// * `table_id` - For error context only
/// * `key` - The table's session key; `None` when the table has no session
/// * `ledger` - Candidate orders with their lines (may contain other sessions)
///
/// ## Returns
/// * `Ok(SessionTotals)` - The session's totals
/// * `Err(CoreError::NoActiveSession)` - `key` is `None`; treat totals as zero
/// * `Err(CoreError::CorruptOrderRecord)` - A ledger row needs manual review
///
/// ## Example
/// ```rust,ignore
/// let totals = accumulate(&table.id, table.session_key().as_ref(), &ledger)?;
/// assert_eq!(totals.total, Money::from_cents(6000));
/// ```
pub fn accumulate(
    table_id: &str,
    key: Option<&SessionKey>,
    ledger: &[LedgerOrder],
) -> CoreResult<SessionTotals> {
    let key = key.ok_or_else(|| CoreError::NoActiveSession {
        table_id: table_id.to_string(),
    })?;

    let mut totals = SessionTotals::empty();
    let mut index: HashMap<&str, usize> = HashMap::new();

    for entry in session_slice(key, ledger)? {
        let cancelled = !entry.order.status.is_billable();

        if cancelled {
            totals.cancelled_order_count += 1;
        } else {
            totals.order_count += 1;
            totals.line_count += entry.lines.len();
        }

        for line in &entry.lines {
            if !cancelled {
                totals.total += line.subtotal;
            }

            let i = *index.entry(line.product_id.as_str()).or_insert_with(|| {
                totals.per_product.push(ProductSubtotal {
                    product_id: line.product_id.clone(),
                    product_name: line.product_name.clone(),
                    quantity: 0,
                    subtotal: Money::zero(),
                    cancelled_quantity: 0,
                    cancelled_subtotal: Money::zero(),
                });
                totals.per_product.len() - 1
            });

            let product = &mut totals.per_product[i];
            product.quantity += line.quantity;
            product.subtotal += line.subtotal;
            if cancelled {
                product.cancelled_quantity += line.quantity;
                product.cancelled_subtotal += line.subtotal;
            }
        }
    }

    Ok(totals)
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::*;
    use chrono::{DateTime, Duration, Utc};

    fn key(since: DateTime<Utc>) -> SessionKey {
        SessionKey {
            table_number: 5,
            branch_id: "branch".to_string(),
            restaurant_id: "resto".to_string(),
            since,
        }
    }

    fn entry(
        id: &str,
        at: DateTime<Utc>,
        status: OrderStatus,
        lines: &[(&str, i64, i64)],
    ) -> LedgerOrder {
        let lines: Vec<OrderLine> = lines
            .iter()
            .enumerate()
            .map(|(i, (product, qty, price))| OrderLine {
                id: format!("{id}-l{i}"),
                order_id: id.to_string(),
                product_id: product.to_string(),
                product_name: product.to_uppercase(),
                quantity: *qty,
                unit_price: Money::from_cents(*price),
                subtotal: Money::from_cents(*price).multiply_quantity(*qty),
                notes: None,
                created_at: at,
            })
            .collect();
        LedgerOrder {
            order: Order {
                id: id.to_string(),
                table_id: Some("t-5".to_string()),
                table_number_snapshot: Some(5),
                branch_id: "branch".to_string(),
                restaurant_id: "resto".to_string(),
                server_actor_id: "waiter".to_string(),
                payment_method_id: None,
                service_type: ServiceType::Table,
                status,
                payment_timing: PaymentTiming::Immediate,
                payment_state: PaymentState::Pending,
                total: lines.iter().map(|l| l.subtotal).sum(),
                created_at: at,
                moved_at: None,
                rejection_reason: None,
            },
            lines,
        }
    }

    #[test]
    fn test_no_session_is_signalled() {
        let err = accumulate("t-5", None, &[]).unwrap_err();
        assert!(matches!(err, CoreError::NoActiveSession { .. }));
    }

    #[test]
    fn test_burger_and_soda_scenario() {
        let start = Utc::now();
        let ledger = vec![
            entry("o1", start, OrderStatus::Received, &[("burger", 2, 2500)]),
            entry(
                "o2",
                start + Duration::seconds(30),
                OrderStatus::Received,
                &[("soda", 1, 1000)],
            ),
        ];

        let totals = accumulate("t-5", Some(&key(start)), &ledger).unwrap();
        assert_eq!(totals.total, Money::from_cents(6000));
        assert_eq!(totals.order_count, 2);
        assert_eq!(totals.line_count, 2);
        assert_eq!(totals.per_product[0].product_id, "burger");
        assert_eq!(totals.per_product[0].quantity, 2);
        assert_eq!(totals.per_product[0].subtotal, Money::from_cents(5000));
    }

    #[test]
    fn test_orders_before_session_start_are_excluded() {
        let start = Utc::now();
        let ledger = vec![
            entry(
                "old",
                start - Duration::minutes(90),
                OrderStatus::Delivered,
                &[("burger", 4, 2500)],
            ),
            entry("new", start, OrderStatus::Received, &[("soda", 1, 1000)]),
        ];

        let totals = accumulate("t-5", Some(&key(start)), &ledger).unwrap();
        assert_eq!(totals.total, Money::from_cents(1000));
        assert_eq!(totals.order_count, 1);
    }

    #[test]
    fn test_moved_order_counts_from_move_time() {
        let start = Utc::now();
        let mut moved = entry(
            "moved",
            start - Duration::minutes(10),
            OrderStatus::Received,
            &[("wine", 1, 3000)],
        );
        moved.order.moved_at = Some(start + Duration::seconds(1));

        let totals = accumulate("t-5", Some(&key(start)), &[moved]).unwrap();
        assert_eq!(totals.total, Money::from_cents(3000));
    }

    #[test]
    fn test_cancelled_excluded_from_total_but_kept_in_audit() {
        let start = Utc::now();
        let mut ledger = vec![
            entry("o1", start, OrderStatus::Received, &[("burger", 2, 2500)]),
            entry("o2", start, OrderStatus::Received, &[("burger", 1, 2500)]),
        ];
        let before = accumulate("t-5", Some(&key(start)), &ledger).unwrap();

        ledger[1].order.status = OrderStatus::Cancelled;
        let after = accumulate("t-5", Some(&key(start)), &ledger).unwrap();

        assert_eq!(before.total - after.total, Money::from_cents(2500));
        assert_eq!(after.per_product[0].quantity, before.per_product[0].quantity);
        assert_eq!(after.per_product[0].subtotal, before.per_product[0].subtotal);
        assert_eq!(after.per_product[0].cancelled_quantity, 1);
        assert_eq!(
            after.per_product[0].billable_subtotal(),
            Money::from_cents(5000)
        );
        assert_eq!(after.cancelled_order_count, 1);
        assert_eq!(after.order_count, 1);
    }

    #[test]
    fn test_pending_approval_and_rejected_are_invisible() {
        let start = Utc::now();
        let ledger = vec![
            entry("p", start, OrderStatus::PendingApproval, &[("soda", 1, 1000)]),
            entry("r", start, OrderStatus::Rejected, &[("soda", 1, 1000)]),
        ];
        let totals = accumulate("t-5", Some(&key(start)), &ledger).unwrap();
        assert_eq!(totals, SessionTotals::empty());
    }

    #[test]
    fn test_other_tables_and_branches_are_ignored() {
        let start = Utc::now();
        let mut other_table = entry("a", start, OrderStatus::Received, &[("soda", 1, 1000)]);
        other_table.order.table_number_snapshot = Some(6);
        let mut other_branch = entry("b", start, OrderStatus::Received, &[("soda", 1, 1000)]);
        other_branch.order.branch_id = "elsewhere".to_string();

        let totals =
            accumulate("t-5", Some(&key(start)), &[other_table, other_branch]).unwrap();
        assert!(totals.total.is_zero());
    }

    #[test]
    fn test_corrupt_row_is_surfaced() {
        let start = Utc::now();
        let mut corrupt = entry("c", start, OrderStatus::Received, &[("soda", 1, 1000)]);
        corrupt.order.table_number_snapshot = None;

        let err = accumulate("t-5", Some(&key(start)), &[corrupt]).unwrap_err();
        assert!(matches!(err, CoreError::CorruptOrderRecord { .. }));
    }

    #[test]
    fn test_accumulate_is_idempotent() {
        let start = Utc::now();
        let ledger = vec![entry("o1", start, OrderStatus::Received, &[("burger", 2, 2500)])];
        let first = accumulate("t-5", Some(&key(start)), &ledger).unwrap();
        let second = accumulate("t-5", Some(&key(start)), &ledger).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_combine_merges_products() {
        let start = Utc::now();
        let a = accumulate(
            "t-5",
            Some(&key(start)),
            &[entry("o1", start, OrderStatus::Received, &[("burger", 2, 2500)])],
        )
        .unwrap();
        let b = accumulate(
            "t-5",
            Some(&key(start)),
            &[entry(
                "o2",
                start,
                OrderStatus::Received,
                &[("burger", 1, 2500), ("soda", 1, 1000)],
            )],
        )
        .unwrap();

        let combined = SessionTotals::combine([&a, &b]);
        assert_eq!(combined.total, Money::from_cents(8500));
        assert_eq!(combined.order_count, 2);
        assert_eq!(combined.per_product.len(), 2);
        assert_eq!(combined.per_product[0].quantity, 3);
    }
}
