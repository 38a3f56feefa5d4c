//! # Table Lifecycle
//!
//! Open, add orders, read the running bill, request the bill and liberate.
//!
//! ```text
//!   open / add_order        request_bill
//! Free ─────────────► Occupied ─────────► PendingPayment
//!  ▲                     │                     │
//!  └──── liberate ───────┴──── liberate ───────┘
//!  └──── settle (settlement.rs) ───────────────┘
//!
//! Free ◄──► Reserved / Maintenance   (set_table_availability)
//! ```

use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use comanda_core::accumulator::{accumulate, session_slice};
use comanda_core::validation::{
    validate_order_lines, validate_price_cents, validate_uuid,
};
use comanda_core::{
    Actor, EventProduct, LedgerOrder, Money, NewOrderLine, Order, OrderLine, OrderStatus,
    PaymentState, Role, ServiceType, Table, TableEvent, TableState, ValidationError,
};
use comanda_db::TableStatistics;

use crate::engine::{state_changed, TableSessionEngine};
use crate::error::{SessionError, SessionResult};
use crate::model::{
    AddOrderOutcome, AddOrderRequest, LiberateOutcome, OpenOutcome, PeekTotal, PreBillView,
};

/// Upper bound on the rows a history request returns.
const MAX_HISTORY: u32 = 200;

impl TableSessionEngine {
    /// Starts a session on a free table.
    ///
    /// ## Returns
    /// * `Err(SessionError::TableNotAvailable)` - The table is not free
    pub async fn open(&self, actor: &Actor, table_id: &str) -> SessionResult<OpenOutcome> {
        validate_uuid("table_id", table_id)?;

        let outcome = self
            .run("open", async {
                let mut tx = self.db.begin_write().await?;
                let mut table = self.lock_table(&mut *tx, actor, table_id).await?;

                if table.state != TableState::Free {
                    return Err(SessionError::not_available(table_id, "open", table.state));
                }

                let now = Utc::now();
                let prebill_id = self.open_locked(&mut *tx, &mut table, now).await?;
                self.db.tables().update(&mut *tx, &table).await?;
                tx.commit().await?;

                Ok(OpenOutcome { table, prebill_id })
            })
            .await?;

        info!(
            table_id = %outcome.table.id,
            number = outcome.table.number,
            prebill_id = %outcome.prebill_id,
            "Table opened"
        );
        self.publish(vec![state_changed(&outcome.table, TableState::Free)]);

        Ok(outcome)
    }

    /// Places an order at a table, opening it first when it is free.
    ///
    /// Prices and names come from the catalog and are frozen on the lines.
    /// The order, its lines and the new cached total commit together.
    pub async fn add_order(
        &self,
        actor: &Actor,
        table_id: &str,
        request: AddOrderRequest,
    ) -> SessionResult<AddOrderOutcome> {
        validate_uuid("table_id", table_id)?;
        validate_order_lines(&request.lines)?;

        let order_id = Uuid::new_v4().to_string();
        let mut lines = self.price_lines(actor, &order_id, &request.lines)?;

        let status = if self.config.waiter_orders_need_approval && actor.role == Role::Waiter {
            OrderStatus::PendingApproval
        } else {
            OrderStatus::Received
        };

        let (outcome, table) = self
            .run("add_order", async {
                let mut tx = self.db.begin_write().await?;
                let mut table = self.lock_table(&mut *tx, actor, table_id).await?;

                if !table.state.accepts_orders() {
                    return Err(SessionError::not_available(
                        table_id,
                        "add an order to",
                        table.state,
                    ));
                }

                // Stamped under the lock so the order can never predate the session.
                let now = Utc::now();
                for line in &mut lines {
                    line.created_at = now;
                }

                let opened = table.state == TableState::Free;
                if opened {
                    self.open_locked(&mut *tx, &mut table, now).await?;
                }

                let order = Order {
                    id: order_id.clone(),
                    table_id: Some(table.id.clone()),
                    table_number_snapshot: Some(table.number),
                    branch_id: table.branch_id.clone(),
                    restaurant_id: table.restaurant_id.clone(),
                    server_actor_id: actor.user_id.clone(),
                    payment_method_id: None,
                    service_type: ServiceType::Table,
                    status,
                    payment_timing: request.payment_timing,
                    payment_state: PaymentState::Pending,
                    total: lines.iter().map(|l| l.subtotal).sum(),
                    created_at: now,
                    moved_at: None,
                    rejection_reason: None,
                };
                order.check_integrity()?;

                let orders = self.db.orders();
                orders.insert_order(&mut *tx, &order).await?;
                orders.insert_order_lines(&mut *tx, &lines).await?;

                if let Some(prebill) = self.db.prebills().find_open(&mut *tx, &table.id).await? {
                    self.db
                        .prebills()
                        .set_opening_order(&mut *tx, &prebill.id, &order.id)
                        .await?;
                }

                table.current_order_ref = Some(order.id.clone());
                let totals = self.recompute(&mut *tx, &mut table).await?;
                table.updated_at = now;
                self.db.tables().update(&mut *tx, &table).await?;

                tx.commit().await?;

                Ok((
                    AddOrderOutcome {
                        order,
                        lines,
                        running_total: totals.total,
                        opened,
                    },
                    table,
                ))
            })
            .await?;

        info!(
            table_id = %table.id,
            order_id = %outcome.order.id,
            status = %outcome.order.status,
            total = outcome.running_total.cents(),
            "Order added"
        );

        let mut events = Vec::with_capacity(2);
        if outcome.opened {
            events.push(state_changed(&table, TableState::Free));
        }
        events.push(TableEvent::NewOrder {
            order_id: outcome.order.id.clone(),
            table_id: table.id.clone(),
            table_number: table.number,
            restaurant_id: table.restaurant_id.clone(),
            branch_id: table.branch_id.clone(),
            status: outcome.order.status,
            products: outcome
                .lines
                .iter()
                .map(|l| EventProduct {
                    product_id: l.product_id.clone(),
                    product_name: l.product_name.clone(),
                    quantity: l.quantity,
                    notes: l.notes.clone(),
                })
                .collect(),
        });
        self.publish(events);

        Ok(outcome)
    }

    /// Looks every requested product up in the catalog.
    fn price_lines(
        &self,
        actor: &Actor,
        order_id: &str,
        requested: &[NewOrderLine],
    ) -> SessionResult<Vec<OrderLine>> {
        let now = Utc::now();
        requested
            .iter()
            .map(|line| {
                let entry = self
                    .catalog
                    .lookup(&actor.restaurant_id, &line.product_id)
                    .ok_or_else(|| SessionError::ProductNotFound {
                        product_id: line.product_id.clone(),
                    })?;
                validate_price_cents(entry.unit_price.cents())?;

                Ok(OrderLine {
                    id: Uuid::new_v4().to_string(),
                    order_id: order_id.to_string(),
                    product_id: line.product_id.clone(),
                    product_name: entry.name,
                    quantity: line.quantity,
                    unit_price: entry.unit_price,
                    subtotal: entry.unit_price.multiply_quantity(line.quantity),
                    notes: line.notes.clone(),
                    created_at: now,
                })
            })
            .collect()
    }

    /// The authoritative running bill, computed from the ledger.
    ///
    /// Never reads the cached total for the figures it returns.
    ///
    /// ## Returns
    /// * `Err(SessionError::NoActiveSession)` - Treat the bill as zero
    pub async fn generate_prebill(&self, actor: &Actor, table_id: &str) -> SessionResult<PreBillView> {
        validate_uuid("table_id", table_id)?;

        self.run("generate_prebill", async {
            let mut tx = self.db.pool().begin().await?;
            let table = self
                .db
                .tables()
                .get_by_id(&mut *tx, &actor.restaurant_id, table_id)
                .await?
                .ok_or_else(|| SessionError::table_not_found(table_id))?;

            let (key, prebill) = self.resolve_session(&mut *tx, &table).await?;
            let key = key.ok_or_else(|| SessionError::NoActiveSession {
                table_id: table.id.clone(),
            })?;

            let ledger = self.db.orders().query_orders_since(&mut *tx, &key).await?;
            let totals = accumulate(&table.id, Some(&key), &ledger)?;
            let orders: Vec<LedgerOrder> = session_slice(&key, &ledger)?
                .into_iter()
                .cloned()
                .collect();
            tx.rollback().await?;

            Ok(PreBillView {
                table_id: table.id,
                table_number: table.number,
                state: table.state,
                session_start: key.since,
                prebill_id: prebill.map(|p| p.id),
                totals,
                orders,
                cached_total: table.cached_running_total,
            })
        })
        .await
    }

    /// The cached running total, for polling screens.
    pub async fn peek_total(&self, actor: &Actor, table_id: &str) -> SessionResult<PeekTotal> {
        validate_uuid("table_id", table_id)?;

        let table = self
            .db
            .tables()
            .find(&actor.restaurant_id, table_id)
            .await?
            .ok_or_else(|| SessionError::table_not_found(table_id))?;

        Ok(PeekTotal {
            table_id: table.id,
            table_number: table.number,
            state: table.state,
            cached_running_total: table.cached_running_total,
            updated_at: table.updated_at,
        })
    }

    /// Frees a table without billing it.
    ///
    /// The open prefactura closes with a zero total and a new one waits for
    /// the next occupancy. Liberating a free table changes nothing.
    pub async fn liberate(&self, actor: &Actor, table_id: &str) -> SessionResult<LiberateOutcome> {
        validate_uuid("table_id", table_id)?;
        self.authorize(actor, "liberate")?;

        let (outcome, previous) = self
            .run("liberate", async {
                let mut tx = self.db.begin_write().await?;
                let mut table = self.lock_table(&mut *tx, actor, table_id).await?;
                let previous = table.state;

                if previous == TableState::Free {
                    tx.rollback().await?;
                    return Ok((
                        LiberateOutcome {
                            table,
                            already_free: true,
                            closed_prebill_id: None,
                        },
                        previous,
                    ));
                }

                let now = Utc::now();
                let prebills = self.db.prebills();
                let closed_prebill_id = match prebills.find_open(&mut *tx, &table.id).await? {
                    Some(open) => {
                        prebills.close(&mut *tx, &open.id, Money::zero(), now).await?;
                        Some(open.id)
                    }
                    None => None,
                };
                self.insert_prebill(&mut *tx, &table, None, now).await?;

                table.reset_to_free(now);
                self.db.tables().update(&mut *tx, &table).await?;
                tx.commit().await?;

                Ok((
                    LiberateOutcome {
                        table,
                        already_free: false,
                        closed_prebill_id,
                    },
                    previous,
                ))
            })
            .await?;

        if !outcome.already_free {
            info!(
                table_id = %outcome.table.id,
                previous = %previous,
                prebill_id = ?outcome.closed_prebill_id,
                "Table liberated"
            );
            self.publish(vec![state_changed(&outcome.table, previous)]);
        }

        Ok(outcome)
    }

    /// Moves an occupied table to pending payment and refreshes its cache.
    pub async fn request_bill(&self, actor: &Actor, table_id: &str) -> SessionResult<PreBillView> {
        validate_uuid("table_id", table_id)?;

        let table = self
            .run("request_bill", async {
                let mut tx = self.db.begin_write().await?;
                let mut table = self.lock_table(&mut *tx, actor, table_id).await?;

                if table.state != TableState::Occupied {
                    return Err(SessionError::not_available(
                        table_id,
                        "request the bill for",
                        table.state,
                    ));
                }

                self.recompute(&mut *tx, &mut table).await?;
                table.state = TableState::PendingPayment;
                table.updated_at = Utc::now();
                self.db.tables().update(&mut *tx, &table).await?;
                tx.commit().await?;

                Ok(table)
            })
            .await?;

        info!(
            table_id = %table.id,
            total = table.cached_running_total.cents(),
            "Bill requested"
        );
        self.publish(vec![state_changed(&table, TableState::Occupied)]);

        self.generate_prebill(actor, table_id).await
    }

    /// Administrative holds: moves a table between free, reserved and
    /// maintenance. Tables with a running session are refused.
    pub async fn set_table_availability(
        &self,
        actor: &Actor,
        table_id: &str,
        target: TableState,
    ) -> SessionResult<Table> {
        validate_uuid("table_id", table_id)?;
        self.authorize(actor, "change table availability")?;

        if target.has_session() {
            return Err(ValidationError::InvalidFormat {
                field: "state".to_string(),
                reason: "must be free, reserved or maintenance".to_string(),
            }
            .into());
        }

        let (table, previous) = self
            .run("set_table_availability", async {
                let mut tx = self.db.begin_write().await?;
                let mut table = self.lock_table(&mut *tx, actor, table_id).await?;
                let previous = table.state;

                if previous == target {
                    tx.rollback().await?;
                    return Ok((table, previous));
                }
                if previous.has_session() {
                    return Err(SessionError::not_available(
                        table_id,
                        "change availability of",
                        previous,
                    ));
                }

                table.state = target;
                table.updated_at = Utc::now();
                self.db.tables().update(&mut *tx, &table).await?;
                tx.commit().await?;

                Ok((table, previous))
            })
            .await?;

        if previous != target {
            info!(table_id = %table.id, previous = %previous, state = %target, "Table availability changed");
            self.publish(vec![state_changed(&table, previous)]);
        }

        Ok(table)
    }

    /// Orders ever placed under the table's number, newest first.
    pub async fn table_history(
        &self,
        actor: &Actor,
        table_id: &str,
        limit: u32,
    ) -> SessionResult<Vec<LedgerOrder>> {
        validate_uuid("table_id", table_id)?;

        let mut conn = self.db.pool().acquire().await?;
        let table = self
            .db
            .tables()
            .get_by_id(&mut conn, &actor.restaurant_id, table_id)
            .await?
            .ok_or_else(|| SessionError::table_not_found(table_id))?;

        let history = self
            .db
            .orders()
            .history_for_table_number(
                &mut conn,
                &table.restaurant_id,
                &table.branch_id,
                table.number,
                limit.clamp(1, MAX_HISTORY),
            )
            .await?;

        Ok(history)
    }

    /// Floor overview of a branch of the actor's restaurant.
    pub async fn table_statistics(
        &self,
        actor: &Actor,
        branch_id: &str,
    ) -> SessionResult<TableStatistics> {
        let mut conn = self.db.pool().acquire().await?;
        let stats = self
            .db
            .tables()
            .statistics(&mut conn, &actor.restaurant_id, branch_id)
            .await?;
        Ok(stats)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
