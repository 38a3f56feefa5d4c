//! Kitchen workflow and waiter-order approval.
//!
//! Only `status` changes here; amounts and lines are never touched. When the
//! order's table has a running session its cached total is recomputed in the
//! same transaction, since cancelling or approving changes what is owed.

use tracing::info;

use comanda_core::validation::{validate_notes, validate_uuid};
use comanda_core::{Actor, Order, OrderStatus, TableEvent};

use crate::engine::TableSessionEngine;
use crate::error::{SessionError, SessionResult};

impl TableSessionEngine {
    /// Moves an order along the kitchen workflow or cancels it.
    ///
    /// Orders waiting for approval are decided through `approve_order` and
    /// `reject_order` instead.
    pub async fn update_order_status(
        &self,
        actor: &Actor,
        order_id: &str,
        status: OrderStatus,
    ) -> SessionResult<Order> {
        validate_uuid("order_id", order_id)?;
        self.change_status(actor, order_id, status, None, false).await
    }

    /// Accepts a waiter's order; it starts counting toward the bill.
    pub async fn approve_order(&self, actor: &Actor, order_id: &str) -> SessionResult<Order> {
        validate_uuid("order_id", order_id)?;
        self.authorize(actor, "approve orders")?;
        self.change_status(actor, order_id, OrderStatus::Received, None, true)
            .await
    }

    /// Turns a waiter's order down with a reason.
    pub async fn reject_order(
        &self,
        actor: &Actor,
        order_id: &str,
        reason: &str,
    ) -> SessionResult<Order> {
        validate_uuid("order_id", order_id)?;
        validate_notes("reason", reason)?;
        self.authorize(actor, "reject orders")?;
        self.change_status(actor, order_id, OrderStatus::Rejected, Some(reason), true)
            .await
    }

    async fn change_status(
        &self,
        actor: &Actor,
        order_id: &str,
        next: OrderStatus,
        reason: Option<&str>,
        deciding_approval: bool,
    ) -> SessionResult<Order> {
        let (order, previous) = self
            .run("update_order_status", async {
                let mut tx = self.db.begin_write().await?;
                let orders = self.db.orders();

                let mut order = orders
                    .get_order(&mut *tx, &actor.restaurant_id, order_id)
                    .await?
                    .ok_or_else(|| SessionError::order_not_found(order_id))?;

                let awaiting_approval = order.status == OrderStatus::PendingApproval;
                if awaiting_approval != deciding_approval {
                    return Err(SessionError::InvalidStatusTransition {
                        order_id: order.id.clone(),
                        from: order.status.to_string(),
                        to: next.to_string(),
                    });
                }

                let mut table = match order.table_id.clone() {
                    Some(table_id) => Some(self.lock_table(&mut *tx, actor, &table_id).await?),
                    None => None,
                };

                let previous = order.transition_to(next)?;
                if reason.is_some() {
                    order.rejection_reason = reason.map(str::to_string);
                }
                orders
                    .update_order_status(&mut *tx, &order.id, next, reason)
                    .await?;

                if let Some(table) = table.as_mut() {
                    if table.state.has_session() {
                        self.recompute(&mut *tx, table).await?;
                        self.db.tables().update(&mut *tx, table).await?;
                    }
                }

                tx.commit().await?;
                Ok((order, previous))
            })
            .await?;

        info!(
            order_id = %order.id,
            table_id = ?order.table_id,
            previous = %previous,
            status = %order.status,
            "Order status changed"
        );
        self.publish(vec![TableEvent::OrderStatusChanged {
            order_id: order.id.clone(),
            table_id: order.table_id.clone(),
            restaurant_id: order.restaurant_id.clone(),
            branch_id: order.branch_id.clone(),
            previous,
            status: order.status,
        }]);

        Ok(order)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
