//! # Settlement
//!
//! Takes payment for a table session and frees the table.
//!
//! ## Deferred Orders
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  settle(table, { method: "cash" })                                      │
//! │        │                                                                │
//! │        ▼                                                                │
//! │  deferred + pending orders in the session?                              │
//! │        │ yes, some without a resolution                                 │
//! │        ├──────────────► Err(DeferredPaymentsOutstanding { pending })    │
//! │        │                (nothing written; caller asks for methods)      │
//! │        │                                                                │
//! │  settle(table, { method: "cash", resolutions: {o-7: "card"} })          │
//! │        │ all resolved                                                   │
//! │        ▼                                                                │
//! │  one transaction:                                                       │
//! │    deferred orders   -> Paid with their own method                      │
//! │    immediate orders  -> Paid with the main method                       │
//! │    prefactura        -> Closed, total frozen                            │
//! │    [consolidated]    -> settlement order carrying the frozen total      │
//! │    table             -> Free                                            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::HashSet;

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use comanda_core::accumulator::{accumulate, session_slice};
use comanda_core::validation::{validate_payment_method, validate_uuid};
use comanda_core::{
    Actor, Order, OrderStatus, PaymentState, PaymentTiming, PreBill, PreBillState, ServiceType,
};

use crate::config::SettlementMode;
use crate::engine::{state_changed, TableSessionEngine};
use crate::error::{PendingOrder, SessionError, SessionResult};
use crate::model::{SettleOutcome, SettleRequest};

impl TableSessionEngine {
    /// Settles the current session of a table.
    ///
    /// ## Returns
    /// * `Err(SessionError::TableNotAvailable)` - The table has no session
    /// * `Err(SessionError::DeferredPaymentsOutstanding)` - Resolve these first
    /// * `Err(SessionError::UnknownSettlementOrder)` - A resolution names an
    ///   order that is not pending in this session
    pub async fn settle(
        &self,
        actor: &Actor,
        table_id: &str,
        request: SettleRequest,
    ) -> SessionResult<SettleOutcome> {
        validate_uuid("table_id", table_id)?;
        self.authorize(actor, "settle")?;
        validate_payment_method(&request.payment_method_id)?;
        for method in request.resolutions.values() {
            validate_payment_method(method)?;
        }

        let mode = request.mode.unwrap_or(self.config.settlement_mode);

        let (outcome, previous) = self
            .run("settle", async {
                let mut tx = self.db.begin_write().await?;
                let mut table = self.lock_table(&mut *tx, actor, table_id).await?;
                let previous = table.state;

                if !previous.has_session() {
                    return Err(SessionError::not_available(table_id, "settle", previous));
                }

                let (key, prebill) = self.resolve_session(&mut *tx, &table).await?;
                let key = key.ok_or_else(|| SessionError::NoActiveSession {
                    table_id: table.id.clone(),
                })?;

                let orders = self.db.orders();
                let ledger = orders.query_orders_since(&mut *tx, &key).await?;
                let totals = accumulate(&table.id, Some(&key), &ledger)?;
                let payable: Vec<&Order> = session_slice(&key, &ledger)?
                    .into_iter()
                    .map(|entry| &entry.order)
                    .filter(|o| o.status.is_billable() && o.payment_state == PaymentState::Pending)
                    .collect();

                let deferred: HashSet<&str> = payable
                    .iter()
                    .filter(|o| o.payment_timing == PaymentTiming::Deferred)
                    .map(|o| o.id.as_str())
                    .collect();

                if let Some(unknown) = request
                    .resolutions
                    .keys()
                    .find(|id| !deferred.contains(id.as_str()))
                {
                    return Err(SessionError::UnknownSettlementOrder {
                        table_id: table.id.clone(),
                        order_id: unknown.clone(),
                    });
                }

                let outstanding: Vec<PendingOrder> = payable
                    .iter()
                    .filter(|o| {
                        o.payment_timing == PaymentTiming::Deferred
                            && !request.resolutions.contains_key(&o.id)
                    })
                    .map(|o| PendingOrder {
                        order_id: o.id.clone(),
                        total: o.total,
                    })
                    .collect();
                if !outstanding.is_empty() {
                    return Err(SessionError::DeferredPaymentsOutstanding {
                        table_id: table.id.clone(),
                        pending: outstanding,
                    });
                }

                let now = Utc::now();

                let mut paid_order_ids = Vec::with_capacity(payable.len());
                for order in &payable {
                    let method = match order.payment_timing {
                        PaymentTiming::Deferred => request
                            .resolutions
                            .get(&order.id)
                            .map(String::as_str)
                            .unwrap_or(request.payment_method_id.as_str()),
                        PaymentTiming::Immediate => request.payment_method_id.as_str(),
                    };
                    orders
                        .update_order_payment_state(&mut *tx, &order.id, PaymentState::Paid, Some(method))
                        .await?;
                    paid_order_ids.push(order.id.clone());
                }

                let prebills = self.db.prebills();
                let prebill_id = match prebill {
                    Some(open) => {
                        prebills.close(&mut *tx, &open.id, totals.total, now).await?;
                        open.id
                    }
                    None => {
                        warn!(
                            table_id = %table.id,
                            "Settling without an open prebill, recording a closed one"
                        );
                        let closed = PreBill {
                            id: Uuid::new_v4().to_string(),
                            table_id: table.id.clone(),
                            restaurant_id: table.restaurant_id.clone(),
                            opening_order_ref: table.current_order_ref.clone(),
                            state: PreBillState::Closed,
                            session_start: Some(key.since),
                            closed_total: Some(totals.total),
                            opened_at: key.since,
                            closed_at: Some(now),
                        };
                        prebills.insert(&mut *tx, &closed).await?;
                        closed.id
                    }
                };

                let settlement_order_id = match mode {
                    SettlementMode::MarkPaid => None,
                    SettlementMode::Consolidated => {
                        let settlement = Order {
                            id: Uuid::new_v4().to_string(),
                            table_id: Some(table.id.clone()),
                            table_number_snapshot: Some(table.number),
                            branch_id: table.branch_id.clone(),
                            restaurant_id: table.restaurant_id.clone(),
                            server_actor_id: actor.user_id.clone(),
                            payment_method_id: Some(request.payment_method_id.clone()),
                            service_type: ServiceType::Table,
                            status: OrderStatus::Delivered,
                            payment_timing: PaymentTiming::Immediate,
                            payment_state: PaymentState::Paid,
                            total: totals.total,
                            created_at: now,
                            moved_at: None,
                            rejection_reason: None,
                        };
                        settlement.check_integrity()?;
                        orders.insert_order(&mut *tx, &settlement).await?;
                        Some(settlement.id)
                    }
                };

                table.reset_to_free(now);
                self.db.tables().update(&mut *tx, &table).await?;
                tx.commit().await?;

                Ok((
                    SettleOutcome {
                        table,
                        total: totals.total,
                        prebill_id,
                        mode,
                        paid_order_ids,
                        settlement_order_id,
                    },
                    previous,
                ))
            })
            .await?;

        info!(
            table_id = %outcome.table.id,
            prebill_id = %outcome.prebill_id,
            total = outcome.total.cents(),
            orders = outcome.paid_order_ids.len(),
            mode = ?outcome.mode,
            "Table settled"
        );
        self.publish(vec![state_changed(&outcome.table, previous)]);

        Ok(outcome)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::*;
    use crate::model::AddOrderRequest;
    use comanda_core::{Money, NewOrderLine, TableState};

    fn order_of(product: &str, qty: i64) -> AddOrderRequest {
        AddOrderRequest::new(vec![NewOrderLine::new(product, qty)])
    }

    #[tokio::test]
    async fn test_settle_marks_orders_paid_and_freezes_total() {
        let fx = Fixture::new().await;
        let t1 = fx.table(1).await;
        let actor = cashier();

        let a = fx.engine.add_order(&actor, &t1, order_of(BURGER, 2)).await.unwrap();
        let b = fx.engine.add_order(&actor, &t1, order_of(SODA, 1)).await.unwrap();

        let outcome = fx
            .engine
            .settle(&actor, &t1, SettleRequest::new("cash"))
            .await
            .unwrap();
        assert_eq!(outcome.total, Money::from_cents(6000));
        assert_eq!(outcome.mode, SettlementMode::MarkPaid);
        assert!(outcome.settlement_order_id.is_none());
        assert_eq!(outcome.paid_order_ids.len(), 2);

        for id in [&a.order.id, &b.order.id] {
            let stored = fx
                .engine
                .database()
                .orders()
                .find_with_lines(RESTAURANT, id)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(stored.order.payment_state, PaymentState::Paid);
            assert_eq!(stored.order.payment_method_id.as_deref(), Some("cash"));
        }

        let prebills = fx.engine.database().prebills().list_for_table(&t1).await.unwrap();
        assert_eq!(prebills.len(), 1);
        assert_eq!(prebills[0].state, PreBillState::Closed);
        assert_eq!(prebills[0].closed_total, Some(Money::from_cents(6000)));

        let table = fx.get(&t1).await;
        assert_eq!(table.state, TableState::Free);
        assert!(table.session_start.is_none());
    }

    #[tokio::test]
    async fn test_deferred_orders_need_two_calls() {
        let fx = Fixture::new().await;
        let t1 = fx.table(1).await;
        let actor = cashier();

        fx.engine.add_order(&actor, &t1, order_of(BURGER, 1)).await.unwrap();
        let tab = fx
            .engine
            .add_order(&actor, &t1, order_of(SODA, 3).deferred())
            .await
            .unwrap();

        let err = fx
            .engine
            .settle(&actor, &t1, SettleRequest::new("cash"))
            .await
            .unwrap_err();
        match err {
            SessionError::DeferredPaymentsOutstanding { pending, .. } => {
                assert_eq!(
                    pending,
                    vec![PendingOrder {
                        order_id: tab.order.id.clone(),
                        total: Money::from_cents(3000),
                    }]
                );
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(fx.get(&t1).await.state, TableState::Occupied);

        let outcome = fx
            .engine
            .settle(
                &actor,
                &t1,
                SettleRequest::new("cash").resolve(&tab.order.id, "card"),
            )
            .await
            .unwrap();
        assert_eq!(outcome.total, Money::from_cents(5500));

        let stored = fx
            .engine
            .database()
            .orders()
            .find_with_lines(RESTAURANT, &tab.order.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.order.payment_state, PaymentState::Paid);
        assert_eq!(stored.order.payment_method_id.as_deref(), Some("card"));
        assert_eq!(fx.get(&t1).await.state, TableState::Free);
    }

    #[tokio::test]
    async fn test_unknown_resolution_is_refused() {
        let fx = Fixture::new().await;
        let t1 = fx.table(1).await;
        let actor = cashier();
        let paid_now = fx.engine.add_order(&actor, &t1, order_of(BURGER, 1)).await.unwrap();

        let err = fx
            .engine
            .settle(
                &actor,
                &t1,
                SettleRequest::new("cash").resolve(&paid_now.order.id, "card"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::UnknownSettlementOrder { .. }));
        assert_eq!(fx.get(&t1).await.state, TableState::Occupied);
    }

    #[tokio::test]
    async fn test_consolidated_settlement_writes_one_order() {
        let fx = Fixture::new().await;
        let t1 = fx.table(1).await;
        let actor = cashier();
        fx.engine.add_order(&actor, &t1, order_of(FRIES, 2)).await.unwrap();

        let outcome = fx
            .engine
            .settle(
                &actor,
                &t1,
                SettleRequest::new("card").with_mode(SettlementMode::Consolidated),
            )
            .await
            .unwrap();
        let id = outcome.settlement_order_id.unwrap();

        let settlement = fx
            .engine
            .database()
            .orders()
            .find_with_lines(RESTAURANT, &id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(settlement.order.total, Money::from_cents(1600));
        assert_eq!(settlement.order.payment_state, PaymentState::Paid);
        assert_eq!(settlement.order.service_type, ServiceType::Table);
        assert!(settlement.lines.is_empty());

        // The next session starts clean.
        fx.engine.open(&actor, &t1).await.unwrap();
        let bill = fx.engine.generate_prebill(&actor, &t1).await.unwrap();
        assert!(bill.totals.total.is_zero());
    }

    #[tokio::test]
    async fn test_settle_guards() {
        let fx = Fixture::new().await;
        let t1 = fx.table(1).await;

        let err = fx
            .engine
            .settle(&cashier(), &t1, SettleRequest::new("cash"))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::TableNotAvailable { attempted: "settle", .. }));

        fx.engine.add_order(&waiter(), &t1, order_of(SODA, 1)).await.unwrap();

        let err = fx
            .engine
            .settle(&waiter(), &t1, SettleRequest::new("cash"))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Forbidden { action: "settle", .. }));

        let err = fx
            .engine
            .settle(&cashier(), &t1, SettleRequest::new("  "))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Validation(_)));
        assert_eq!(fx.get(&t1).await.state, TableState::Occupied);
    }

    #[tokio::test]
    async fn test_settle_from_pending_payment_emits_state_change() {
        let fx = Fixture::new().await;
        let t1 = fx.table(1).await;
        let actor = cashier();
        fx.engine.add_order(&actor, &t1, order_of(BURGER, 1)).await.unwrap();
        fx.engine.request_bill(&actor, &t1).await.unwrap();

        fx.engine
            .settle(&actor, &t1, SettleRequest::new("cash"))
            .await
            .unwrap();

        let last = fx.sink.events().pop().unwrap();
        assert_eq!(
            last,
            comanda_core::TableEvent::TableStateChanged {
                table_id: t1.clone(),
                table_number: 1,
                restaurant_id: RESTAURANT.to_string(),
                branch_id: BRANCH.to_string(),
                previous: TableState::PendingPayment,
                state: TableState::Free,
            }
        );
    }
}
