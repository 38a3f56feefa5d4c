//! # Transfers
//!
//! Moves money between tables without creating or losing any.
//!
//! ```text
//! transfer_line(line, dest)                transfer_order(order, dest)
//!
//!  source order ──line──► new dest order    order.table_id       := dest
//!  (kept, maybe empty)    (same status,     order.number snapshot := dest.number
//!                          same timing)     order.moved_at        := now
//!
//!  both tables locked (ascending id), both cached totals recomputed,
//!  one commit
//! ```
//!
//! A free destination is opened in the same transaction. Only billable,
//! unpaid orders of the source's current session can move.

use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;
use tracing::info;
use uuid::Uuid;

use comanda_core::validation::validate_uuid;
use comanda_core::{
    Actor, Order, PaymentState, ServiceType, Table, TableEvent, TableState, ValidationError,
};

use crate::engine::{state_changed, TableSessionEngine};
use crate::error::{SessionError, SessionResult};
use crate::model::TransferOutcome;

impl TableSessionEngine {
    /// Moves one order line to another table.
    ///
    /// The line lands on a fresh order at the destination; the source order
    /// stays in the ledger even when it ends up with no lines.
    pub async fn transfer_line(
        &self,
        actor: &Actor,
        line_id: &str,
        destination_table_id: &str,
    ) -> SessionResult<TransferOutcome> {
        validate_uuid("line_id", line_id)?;
        validate_uuid("destination_table_id", destination_table_id)?;

        let (outcome, events) = self
            .run("transfer_line", async {
                let mut tx = self.db.begin_write().await?;
                let orders = self.db.orders();

                let line = orders
                    .get_line(&mut *tx, line_id)
                    .await?
                    .ok_or_else(|| SessionError::LineNotFound {
                        line_id: line_id.to_string(),
                    })?;
                // A line of another restaurant does not exist for this actor.
                let source_order = orders
                    .get_order(&mut *tx, &actor.restaurant_id, &line.order_id)
                    .await?
                    .ok_or_else(|| SessionError::LineNotFound {
                        line_id: line_id.to_string(),
                    })?;

                let (mut source, mut destination) = self
                    .lock_endpoints(&mut *tx, actor, &source_order, destination_table_id)
                    .await?;
                self.ensure_transferable(&mut *tx, &source_order, &source)
                    .await?;

                let now = Utc::now();
                let (previous, opened) = self
                    .prepare_destination(&mut *tx, &mut destination, now)
                    .await?;

                let moved = Order {
                    id: Uuid::new_v4().to_string(),
                    table_id: Some(destination.id.clone()),
                    table_number_snapshot: Some(destination.number),
                    branch_id: destination.branch_id.clone(),
                    restaurant_id: destination.restaurant_id.clone(),
                    server_actor_id: source_order.server_actor_id.clone(),
                    payment_method_id: None,
                    service_type: ServiceType::Table,
                    status: source_order.status,
                    payment_timing: source_order.payment_timing,
                    payment_state: PaymentState::Pending,
                    total: line.subtotal,
                    created_at: now,
                    moved_at: None,
                    rejection_reason: None,
                };
                moved.check_integrity()?;
                orders.insert_order(&mut *tx, &moved).await?;
                orders.move_line(&mut *tx, &line.id, &moved.id).await?;
                orders.refresh_order_total(&mut *tx, &source_order.id).await?;
                orders.refresh_order_total(&mut *tx, &moved.id).await?;

                if let Some(prebill_id) = &opened {
                    self.db
                        .prebills()
                        .set_opening_order(&mut *tx, prebill_id, &moved.id)
                        .await?;
                }
                destination.current_order_ref = Some(moved.id.clone());

                self.finish_transfer(&mut *tx, &mut source, &mut destination, now)
                    .await?;
                tx.commit().await?;

                let opened = opened.is_some();
                let events = transfer_events(&destination, previous, opened);
                Ok((
                    TransferOutcome {
                        source,
                        destination,
                        order_id: moved.id,
                        amount: line.subtotal,
                        destination_opened: opened,
                    },
                    events,
                ))
            })
            .await?;

        info!(
            line_id = %line_id,
            table_id = %outcome.source.id,
            destination = %outcome.destination.id,
            order_id = %outcome.order_id,
            total = outcome.amount.cents(),
            "Line transferred"
        );
        self.publish(events);

        Ok(outcome)
    }

    /// Moves a whole order to another table.
    ///
    /// `created_at` is kept; `moved_at` places the order in the destination
    /// session.
    pub async fn transfer_order(
        &self,
        actor: &Actor,
        order_id: &str,
        destination_table_id: &str,
    ) -> SessionResult<TransferOutcome> {
        validate_uuid("order_id", order_id)?;
        validate_uuid("destination_table_id", destination_table_id)?;

        let (outcome, events) = self
            .run("transfer_order", async {
                let mut tx = self.db.begin_write().await?;
                let orders = self.db.orders();

                let order = orders
                    .get_order(&mut *tx, &actor.restaurant_id, order_id)
                    .await?
                    .ok_or_else(|| SessionError::order_not_found(order_id))?;

                let (mut source, mut destination) = self
                    .lock_endpoints(&mut *tx, actor, &order, destination_table_id)
                    .await?;
                self.ensure_transferable(&mut *tx, &order, &source).await?;

                let now = Utc::now();
                let (previous, opened) = self
                    .prepare_destination(&mut *tx, &mut destination, now)
                    .await?;

                orders
                    .move_order(&mut *tx, &order.id, &destination.id, destination.number, now)
                    .await?;
                if let Some(prebill_id) = &opened {
                    self.db
                        .prebills()
                        .set_opening_order(&mut *tx, prebill_id, &order.id)
                        .await?;
                }
                destination.current_order_ref = Some(order.id.clone());

                self.finish_transfer(&mut *tx, &mut source, &mut destination, now)
                    .await?;
                tx.commit().await?;

                let opened = opened.is_some();
                let events = transfer_events(&destination, previous, opened);
                Ok((
                    TransferOutcome {
                        source,
                        destination,
                        order_id: order.id,
                        amount: order.total,
                        destination_opened: opened,
                    },
                    events,
                ))
            })
            .await?;

        info!(
            order_id = %outcome.order_id,
            table_id = %outcome.source.id,
            destination = %outcome.destination.id,
            total = outcome.amount.cents(),
            "Order transferred"
        );
        self.publish(events);

        Ok(outcome)
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    /// Locks the order's table and the destination, returned as
    /// `(source, destination)`.
    async fn lock_endpoints(
        &self,
        conn: &mut SqliteConnection,
        actor: &Actor,
        order: &Order,
        destination_table_id: &str,
    ) -> SessionResult<(Table, Table)> {
        let source_id = order
            .table_id
            .clone()
            .ok_or_else(|| not_transferable(order, "not bound to a table"))?;

        if source_id == destination_table_id {
            return Err(SessionError::SameTableTransfer {
                table_id: source_id,
            });
        }

        let (source, destination) = self
            .lock_pair(conn, actor, &source_id, destination_table_id)
            .await?;

        // Session queries match on branch; a cross-branch move would drop the
        // order from both bills.
        if destination.branch_id != source.branch_id {
            return Err(ValidationError::InvalidFormat {
                field: "destination_table_id".to_string(),
                reason: "destination must belong to the source table's branch".to_string(),
            }
            .into());
        }

        Ok((source, destination))
    }

    /// Only unpaid, billable orders of the source's running session move.
    async fn ensure_transferable(
        &self,
        conn: &mut SqliteConnection,
        order: &Order,
        source: &Table,
    ) -> SessionResult<()> {
        order.check_integrity()?;

        if !order.status.is_billable() {
            return Err(not_transferable(order, &format!("order is {}", order.status)));
        }
        if order.payment_state == PaymentState::Paid {
            return Err(not_transferable(order, "order is already paid"));
        }

        let (key, _) = self.resolve_session(conn, source).await?;
        let in_current_session = key.is_some_and(|key| {
            order.table_number_snapshot == Some(key.table_number)
                && order.branch_id == key.branch_id
                && order.ledger_at() >= key.since
        });
        if !in_current_session {
            return Err(not_transferable(
                order,
                "order is not part of the table's current session",
            ));
        }

        Ok(())
    }

    /// Opens a free destination; refuses anything that is not free or occupied.
    /// Returns the destination's previous state and, when it was opened here,
    /// the id of its new pre-bill.
    async fn prepare_destination(
        &self,
        conn: &mut SqliteConnection,
        destination: &mut Table,
        now: DateTime<Utc>,
    ) -> SessionResult<(TableState, Option<String>)> {
        let previous = destination.state;
        match previous {
            TableState::Free => {
                let prebill_id = self.open_locked(conn, destination, now).await?;
                Ok((previous, Some(prebill_id)))
            }
            TableState::Occupied => Ok((previous, None)),
            current => Err(SessionError::DestinationTableUnavailable {
                table_id: destination.id.clone(),
                current,
            }),
        }
    }

    async fn finish_transfer(
        &self,
        conn: &mut SqliteConnection,
        source: &mut Table,
        destination: &mut Table,
        now: DateTime<Utc>,
    ) -> SessionResult<()> {
        self.recompute(conn, source).await?;
        self.recompute(conn, destination).await?;
        source.updated_at = now;
        destination.updated_at = now;

        let tables = self.db.tables();
        tables.update(conn, source).await?;
        tables.update(conn, destination).await?;
        Ok(())
    }
}

fn not_transferable(order: &Order, reason: &str) -> SessionError {
    SessionError::OrderNotTransferable {
        order_id: order.id.clone(),
        reason: reason.to_string(),
    }
}

fn transfer_events(destination: &Table, previous: TableState, opened: bool) -> Vec<TableEvent> {
    if opened {
        vec![state_changed(destination, previous)]
    } else {
        Vec::new()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::*;
    use crate::model::{AddOrderOutcome, AddOrderRequest};
    use comanda_core::{Money, NewOrderLine, OrderStatus};

    async fn place(fx: &Fixture, table_id: &str, items: &[(&str, i64)]) -> AddOrderOutcome {
        let lines = items
            .iter()
            .map(|(product, qty)| NewOrderLine::new(*product, *qty))
            .collect();
        fx.engine
            .add_order(&waiter(), table_id, AddOrderRequest::new(lines))
            .await
            .unwrap()
    }

    async fn cached(fx: &Fixture, table_id: &str) -> Money {
        fx.get(table_id).await.cached_running_total
    }

    #[tokio::test]
    async fn test_line_to_free_table_opens_it() {
        let fx = Fixture::new().await;
        let t1 = fx.table(1).await;
        let t9 = fx.table(9).await;

        let placed = place(&fx, &t1, &[(BURGER, 2), (SODA, 1)]).await;
        let soda_line = placed.lines.iter().find(|l| l.product_id == SODA).unwrap();

        let outcome = fx
            .engine
            .transfer_line(&waiter(), &soda_line.id, &t9)
            .await
            .unwrap();
        assert!(outcome.destination_opened);
        assert_eq!(outcome.amount, Money::from_cents(1000));
        assert_eq!(outcome.destination.state, TableState::Occupied);

        assert_eq!(cached(&fx, &t1).await, Money::from_cents(5000));
        assert_eq!(cached(&fx, &t9).await, Money::from_cents(1000));

        let bill = fx.engine.generate_prebill(&waiter(), &t9).await.unwrap();
        assert_eq!(bill.orders.len(), 1);
        assert_eq!(bill.orders[0].order.id, outcome.order_id);
        assert_eq!(bill.orders[0].lines.len(), 1);
        assert_eq!(bill.orders[0].order.status, OrderStatus::Received);

        let source_order = fx
            .engine
            .database()
            .orders()
            .find_with_lines(RESTAURANT, &placed.order.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(source_order.order.total, Money::from_cents(5000));
        assert_eq!(source_order.lines.len(), 1);

        let last = fx.sink.events().pop().unwrap();
        assert!(matches!(
            last,
            TableEvent::TableStateChanged { ref table_id, previous: TableState::Free, state: TableState::Occupied, .. } if *table_id == t9
        ));
    }

    #[tokio::test]
    async fn test_emptied_source_order_stays_in_ledger() {
        let fx = Fixture::new().await;
        let t1 = fx.table(1).await;
        let t2 = fx.table(2).await;
        place(&fx, &t2, &[(FRIES, 1)]).await;

        let placed = place(&fx, &t1, &[(BURGER, 1)]).await;
        fx.engine
            .transfer_line(&waiter(), &placed.lines[0].id, &t2)
            .await
            .unwrap();

        let emptied = fx
            .engine
            .database()
            .orders()
            .find_with_lines(RESTAURANT, &placed.order.id)
            .await
            .unwrap()
            .unwrap();
        assert!(emptied.lines.is_empty());
        assert!(emptied.order.total.is_zero());

        assert!(cached(&fx, &t1).await.is_zero());
        assert_eq!(cached(&fx, &t2).await, Money::from_cents(3300));
    }

    #[tokio::test]
    async fn test_transfers_conserve_money() {
        let fx = Fixture::new().await;
        let t1 = fx.table(1).await;
        let t2 = fx.table(2).await;

        let a = place(&fx, &t1, &[(BURGER, 2), (SODA, 2)]).await;
        place(&fx, &t2, &[(FRIES, 1)]).await;

        let before = cached(&fx, &t1).await + cached(&fx, &t2).await;

        fx.engine
            .transfer_line(&waiter(), &a.lines[1].id, &t2)
            .await
            .unwrap();
        let mid = cached(&fx, &t1).await + cached(&fx, &t2).await;
        assert_eq!(before, mid);

        fx.engine
            .transfer_order(&waiter(), &a.order.id, &t2)
            .await
            .unwrap();
        let after = cached(&fx, &t1).await + cached(&fx, &t2).await;
        assert_eq!(before, after);
        assert!(cached(&fx, &t1).await.is_zero());
        assert_eq!(cached(&fx, &t2).await, Money::from_cents(7800));
    }

    #[tokio::test]
    async fn test_transfer_order_moves_it_into_destination_session() {
        let fx = Fixture::new().await;
        let t1 = fx.table(1).await;
        let t5 = fx.table(5).await;

        let placed = place(&fx, &t1, &[(BURGER, 1)]).await;
        let outcome = fx
            .engine
            .transfer_order(&waiter(), &placed.order.id, &t5)
            .await
            .unwrap();
        assert!(outcome.destination_opened);
        assert_eq!(outcome.order_id, placed.order.id);

        let moved = fx
            .engine
            .database()
            .orders()
            .find_with_lines(RESTAURANT, &placed.order.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(moved.order.table_id.as_deref(), Some(t5.as_str()));
        assert_eq!(moved.order.table_number_snapshot, Some(5));
        assert_eq!(moved.order.created_at, placed.order.created_at);
        assert!(moved.order.moved_at.is_some());

        let bill = fx.engine.generate_prebill(&waiter(), &t5).await.unwrap();
        assert_eq!(bill.totals.total, Money::from_cents(2500));
        let source_bill = fx.engine.generate_prebill(&waiter(), &t1).await.unwrap();
        assert!(source_bill.totals.total.is_zero());
    }

    #[tokio::test]
    async fn test_transfer_guards() {
        let fx = Fixture::new().await;
        let t1 = fx.table(1).await;
        let t2 = fx.table(2).await;
        let placed = place(&fx, &t1, &[(BURGER, 1)]).await;

        let err = fx
            .engine
            .transfer_line(&waiter(), &placed.lines[0].id, &t1)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::SameTableTransfer { .. }));

        let missing = Uuid::new_v4().to_string();
        let err = fx
            .engine
            .transfer_line(&waiter(), &missing, &t2)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::LineNotFound { .. }));

        fx.engine
            .set_table_availability(&cashier(), &t2, TableState::Maintenance)
            .await
            .unwrap();
        let err = fx
            .engine
            .transfer_order(&waiter(), &placed.order.id, &t2)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SessionError::DestinationTableUnavailable { current: TableState::Maintenance, .. }
        ));

        fx.engine
            .update_order_status(&waiter(), &placed.order.id, OrderStatus::Cancelled)
            .await
            .unwrap();
        fx.engine
            .set_table_availability(&cashier(), &t2, TableState::Free)
            .await
            .unwrap();
        let err = fx
            .engine
            .transfer_order(&waiter(), &placed.order.id, &t2)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::OrderNotTransferable { .. }));

        // Nothing moved, nothing opened.
        assert_eq!(fx.get(&t2).await.state, TableState::Free);
    }

    #[tokio::test]
    async fn test_transfer_stays_within_branch() {
        let fx = Fixture::new().await;
        let t1 = fx.table(1).await;
        let terrace = fx
            .engine
            .database()
            .tables()
            .create(RESTAURANT, "b-2", 7, 4)
            .await
            .unwrap()
            .id;
        let placed = place(&fx, &t1, &[(BURGER, 2)]).await;

        let err = fx
            .engine
            .transfer_order(&waiter(), &placed.order.id, &terrace)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Validation(_)));

        let err = fx
            .engine
            .transfer_line(&waiter(), &placed.lines[0].id, &terrace)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Validation(_)));

        // The order is still billed at its own table and the other stays free.
        assert_eq!(cached(&fx, &t1).await, Money::from_cents(5000));
        let bill = fx.engine.generate_prebill(&waiter(), &t1).await.unwrap();
        assert_eq!(bill.totals.total, Money::from_cents(5000));
        let other = fx
            .engine
            .database()
            .tables()
            .find(RESTAURANT, &terrace)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(other.state, TableState::Free);
    }

    #[tokio::test]
    async fn test_order_of_previous_session_cannot_move() {
        let fx = Fixture::new().await;
        let t1 = fx.table(1).await;
        let t2 = fx.table(2).await;

        let old = place(&fx, &t1, &[(BURGER, 1)]).await;
        fx.engine.liberate(&cashier(), &t1).await.unwrap();
        place(&fx, &t1, &[(SODA, 1)]).await;

        let err = fx
            .engine
            .transfer_order(&waiter(), &old.order.id, &t2)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::OrderNotTransferable { .. }));
    }
}
