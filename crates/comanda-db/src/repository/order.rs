//! # Order Repository
//!
//! The order ledger ("ventas") and its lines.
//!
//! ## Session Queries
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  query_orders_since(key)                                                │
//! │                                                                         │
//! │    WHERE restaurant_id = key.restaurant_id                             │
//! │      AND branch_id = key.branch_id                                     │
//! │      AND table_number_snapshot = key.table_number                      │
//! │      AND COALESCE(moved_at, created_at) >= key.since                   │
//! │                                                                         │
//! │  Status filtering and the arithmetic live in comanda-core's            │
//! │  accumulator; this query only narrows the candidate rows.              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqlitePool};
use tracing::debug;

use crate::error::DbResult;
use comanda_core::{LedgerOrder, Money, Order, OrderLine, OrderStatus, PaymentState, SessionKey};

macro_rules! order_columns {
    () => {
        "id, table_id, table_number_snapshot, branch_id, restaurant_id, server_actor_id, \
         payment_method_id, service_type, status, payment_timing, payment_state, total, \
         created_at, moved_at, rejection_reason"
    };
}

macro_rules! line_columns {
    () => {
        "id, order_id, product_id, product_name, quantity, unit_price, subtotal, notes, created_at"
    };
}

/// Repository for the order ledger.
#[derive(Debug, Clone)]
pub struct OrderRepository {
    pool: SqlitePool,
}

impl OrderRepository {
    /// Creates a new OrderRepository.
    pub fn new(pool: SqlitePool) -> Self {
        OrderRepository { pool }
    }

    // =========================================================================
    // Inserts
    // =========================================================================

    /// Inserts an order header.
    pub async fn insert_order(&self, conn: &mut SqliteConnection, order: &Order) -> DbResult<()> {
        debug!(id = %order.id, table = ?order.table_number_snapshot, "Inserting order");

        sqlx::query(
            r#"
            INSERT INTO orders (
                id, table_id, table_number_snapshot, branch_id, restaurant_id,
                server_actor_id, payment_method_id, service_type, status,
                payment_timing, payment_state, total, created_at, moved_at,
                rejection_reason
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
            "#,
        )
        .bind(&order.id)
        .bind(&order.table_id)
        .bind(order.table_number_snapshot)
        .bind(&order.branch_id)
        .bind(&order.restaurant_id)
        .bind(&order.server_actor_id)
        .bind(&order.payment_method_id)
        .bind(order.service_type)
        .bind(order.status)
        .bind(order.payment_timing)
        .bind(order.payment_state)
        .bind(order.total)
        .bind(order.created_at)
        .bind(order.moved_at)
        .bind(&order.rejection_reason)
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    /// Inserts the lines of an order.
    pub async fn insert_order_lines(
        &self,
        conn: &mut SqliteConnection,
        lines: &[OrderLine],
    ) -> DbResult<()> {
        for line in lines {
            sqlx::query(
                r#"
                INSERT INTO order_lines (
                    id, order_id, product_id, product_name, quantity,
                    unit_price, subtotal, notes, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                "#,
            )
            .bind(&line.id)
            .bind(&line.order_id)
            .bind(&line.product_id)
            .bind(&line.product_name)
            .bind(line.quantity)
            .bind(line.unit_price)
            .bind(line.subtotal)
            .bind(&line.notes)
            .bind(line.created_at)
            .execute(&mut *conn)
            .await?;
        }

        Ok(())
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Reads an order header, scoped to a restaurant.
    pub async fn get_order(
        &self,
        conn: &mut SqliteConnection,
        restaurant_id: &str,
        id: &str,
    ) -> DbResult<Option<Order>> {
        let order = sqlx::query_as::<_, Order>(concat!(
            "SELECT ",
            order_columns!(),
            " FROM orders WHERE id = ?1 AND restaurant_id = ?2"
        ))
        .bind(id)
        .bind(restaurant_id)
        .fetch_optional(&mut *conn)
        .await?;

        Ok(order)
    }

    /// Reads an order with its lines. Uses its own connection.
    pub async fn find_with_lines(
        &self,
        restaurant_id: &str,
        id: &str,
    ) -> DbResult<Option<LedgerOrder>> {
        let mut conn = self.pool.acquire().await?;
        let Some(order) = self.get_order(&mut conn, restaurant_id, id).await? else {
            return Ok(None);
        };
        let lines = self.lines_for_order(&mut conn, id).await?;
        Ok(Some(LedgerOrder { order, lines }))
    }

    /// Reads a single line.
    pub async fn get_line(
        &self,
        conn: &mut SqliteConnection,
        line_id: &str,
    ) -> DbResult<Option<OrderLine>> {
        let line = sqlx::query_as::<_, OrderLine>(concat!(
            "SELECT ",
            line_columns!(),
            " FROM order_lines WHERE id = ?1"
        ))
        .bind(line_id)
        .fetch_optional(&mut *conn)
        .await?;

        Ok(line)
    }

    /// Lines of one order in insertion order.
    pub async fn lines_for_order(
        &self,
        conn: &mut SqliteConnection,
        order_id: &str,
    ) -> DbResult<Vec<OrderLine>> {
        let lines = sqlx::query_as::<_, OrderLine>(concat!(
            "SELECT ",
            line_columns!(),
            " FROM order_lines WHERE order_id = ?1 ORDER BY created_at, id"
        ))
        .bind(order_id)
        .fetch_all(&mut *conn)
        .await?;

        Ok(lines)
    }

    /// Candidate ledger rows for a session, with their lines.
    ///
    /// Includes every status; the accumulator decides what counts.
    pub async fn query_orders_since(
        &self,
        conn: &mut SqliteConnection,
        key: &SessionKey,
    ) -> DbResult<Vec<LedgerOrder>> {
        let orders = sqlx::query_as::<_, Order>(concat!(
            "SELECT ",
            order_columns!(),
            " FROM orders",
            " WHERE restaurant_id = ?1 AND branch_id = ?2 AND table_number_snapshot = ?3",
            "   AND COALESCE(moved_at, created_at) >= ?4",
            " ORDER BY COALESCE(moved_at, created_at), id"
        ))
        .bind(&key.restaurant_id)
        .bind(&key.branch_id)
        .bind(key.table_number)
        .bind(key.since)
        .fetch_all(&mut *conn)
        .await?;

        let lines = sqlx::query_as::<_, OrderLine>(concat!(
            "SELECT l.id, l.order_id, l.product_id, l.product_name, l.quantity,",
            "       l.unit_price, l.subtotal, l.notes, l.created_at",
            " FROM order_lines l JOIN orders o ON o.id = l.order_id",
            " WHERE o.restaurant_id = ?1 AND o.branch_id = ?2 AND o.table_number_snapshot = ?3",
            "   AND COALESCE(o.moved_at, o.created_at) >= ?4",
            " ORDER BY l.created_at, l.id"
        ))
        .bind(&key.restaurant_id)
        .bind(&key.branch_id)
        .bind(key.table_number)
        .bind(key.since)
        .fetch_all(&mut *conn)
        .await?;

        Ok(attach_lines(orders, lines))
    }

    /// Most recent orders ever placed under a table number, newest first.
    pub async fn history_for_table_number(
        &self,
        conn: &mut SqliteConnection,
        restaurant_id: &str,
        branch_id: &str,
        table_number: i64,
        limit: u32,
    ) -> DbResult<Vec<LedgerOrder>> {
        let orders = sqlx::query_as::<_, Order>(concat!(
            "SELECT ",
            order_columns!(),
            " FROM orders",
            " WHERE restaurant_id = ?1 AND branch_id = ?2 AND table_number_snapshot = ?3",
            " ORDER BY COALESCE(moved_at, created_at) DESC, id DESC",
            " LIMIT ?4"
        ))
        .bind(restaurant_id)
        .bind(branch_id)
        .bind(table_number)
        .bind(limit as i64)
        .fetch_all(&mut *conn)
        .await?;

        let mut history = Vec::with_capacity(orders.len());
        for order in orders {
            let lines = self.lines_for_order(conn, &order.id).await?;
            history.push(LedgerOrder { order, lines });
        }
        Ok(history)
    }

    // =========================================================================
    // Updates
    // =========================================================================

    /// Sets the status of an order (and the rejection reason, if any).
    pub async fn update_order_status(
        &self,
        conn: &mut SqliteConnection,
        id: &str,
        status: OrderStatus,
        rejection_reason: Option<&str>,
    ) -> DbResult<()> {
        debug!(id = %id, status = %status, "Updating order status");

        sqlx::query(
            r#"
            UPDATE orders
            SET status = ?2, rejection_reason = COALESCE(?3, rejection_reason)
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .bind(status)
        .bind(rejection_reason)
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    /// Records how an order was paid.
    pub async fn update_order_payment_state(
        &self,
        conn: &mut SqliteConnection,
        id: &str,
        state: PaymentState,
        payment_method_id: Option<&str>,
    ) -> DbResult<()> {
        sqlx::query(
            r#"
            UPDATE orders
            SET payment_state = ?2, payment_method_id = COALESCE(?3, payment_method_id)
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .bind(state)
        .bind(payment_method_id)
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    /// Re-parents a line onto another order.
    pub async fn move_line(
        &self,
        conn: &mut SqliteConnection,
        line_id: &str,
        to_order_id: &str,
    ) -> DbResult<()> {
        sqlx::query("UPDATE order_lines SET order_id = ?2 WHERE id = ?1")
            .bind(line_id)
            .bind(to_order_id)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    /// Redirects a whole order to another table.
    ///
    /// `created_at` stays; `moved_at` places the order in the destination
    /// session.
    pub async fn move_order(
        &self,
        conn: &mut SqliteConnection,
        id: &str,
        table_id: &str,
        table_number: i64,
        moved_at: DateTime<Utc>,
    ) -> DbResult<()> {
        sqlx::query(
            r#"
            UPDATE orders
            SET table_id = ?2, table_number_snapshot = ?3, moved_at = ?4
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .bind(table_id)
        .bind(table_number)
        .bind(moved_at)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    /// Recomputes `orders.total` from the lines currently attached.
    pub async fn refresh_order_total(
        &self,
        conn: &mut SqliteConnection,
        id: &str,
    ) -> DbResult<Money> {
        let total = sqlx::query_scalar::<_, Money>(
            r#"
            UPDATE orders
            SET total = (SELECT COALESCE(SUM(subtotal), 0) FROM order_lines WHERE order_id = ?1)
            WHERE id = ?1
            RETURNING total
            "#,
        )
        .bind(id)
        .fetch_one(&mut *conn)
        .await?;

        Ok(total)
    }
}

/// Groups lines under their orders, keeping order sequence.
fn attach_lines(orders: Vec<Order>, lines: Vec<OrderLine>) -> Vec<LedgerOrder> {
    let mut by_order: HashMap<String, Vec<OrderLine>> = HashMap::new();
    for line in lines {
        by_order.entry(line.order_id.clone()).or_default().push(line);
    }

    orders
        .into_iter()
        .map(|order| {
            let lines = by_order.remove(&order.id).unwrap_or_default();
            LedgerOrder { order, lines }
        })
        .collect()
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Database, DbConfig};
    use chrono::Duration;
    use comanda_core::{PaymentTiming, ServiceType};
    use uuid::Uuid;

    fn order_at(number: i64, at: DateTime<Utc>) -> Order {
        Order {
            id: Uuid::new_v4().to_string(),
            table_id: None,
            table_number_snapshot: Some(number),
            branch_id: "b1".to_string(),
            restaurant_id: "r1".to_string(),
            server_actor_id: "waiter".to_string(),
            payment_method_id: None,
            service_type: ServiceType::Table,
            status: OrderStatus::Received,
            payment_timing: PaymentTiming::Immediate,
            payment_state: PaymentState::Pending,
            total: Money::zero(),
            created_at: at,
            moved_at: None,
            rejection_reason: None,
        }
    }

    fn line(order: &Order, product: &str, qty: i64, price: i64) -> OrderLine {
        OrderLine {
            id: Uuid::new_v4().to_string(),
            order_id: order.id.clone(),
            product_id: product.to_string(),
            product_name: product.to_string(),
            quantity: qty,
            unit_price: Money::from_cents(price),
            subtotal: Money::from_cents(price * qty),
            notes: None,
            created_at: order.created_at,
        }
    }

    fn key(number: i64, since: DateTime<Utc>) -> SessionKey {
        SessionKey {
            table_number: number,
            branch_id: "b1".to_string(),
            restaurant_id: "r1".to_string(),
            since,
        }
    }

    #[tokio::test]
    async fn test_query_orders_since_filters_by_session() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.orders();
        let mut conn = db.pool().acquire().await.unwrap();

        let start = Utc::now();
        let old = order_at(5, start - Duration::hours(2));
        let current = order_at(5, start + Duration::seconds(1));
        let other_table = order_at(6, start + Duration::seconds(1));

        for order in [&old, &current, &other_table] {
            repo.insert_order(&mut conn, order).await.unwrap();
            repo.insert_order_lines(&mut conn, &[line(order, "soda", 1, 1000)])
                .await
                .unwrap();
        }

        let ledger = repo.query_orders_since(&mut conn, &key(5, start)).await.unwrap();
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger[0].order.id, current.id);
        assert_eq!(ledger[0].lines.len(), 1);
    }

    #[tokio::test]
    async fn test_move_line_and_refresh_totals() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.orders();
        let mut conn = db.pool().acquire().await.unwrap();

        let now = Utc::now();
        let source = order_at(5, now);
        let dest = order_at(6, now);
        repo.insert_order(&mut conn, &source).await.unwrap();
        repo.insert_order(&mut conn, &dest).await.unwrap();

        let burger = line(&source, "burger", 2, 2500);
        let soda = line(&source, "soda", 1, 1000);
        repo.insert_order_lines(&mut conn, &[burger.clone(), soda])
            .await
            .unwrap();
        assert_eq!(repo.refresh_order_total(&mut conn, &source.id).await.unwrap().cents(), 6000);

        repo.move_line(&mut conn, &burger.id, &dest.id).await.unwrap();
        assert_eq!(repo.refresh_order_total(&mut conn, &source.id).await.unwrap().cents(), 1000);
        assert_eq!(repo.refresh_order_total(&mut conn, &dest.id).await.unwrap().cents(), 5000);

        let moved = repo.get_line(&mut conn, &burger.id).await.unwrap().unwrap();
        assert_eq!(moved.order_id, dest.id);
    }

    #[tokio::test]
    async fn test_moved_order_joins_later_session() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.orders();
        let table = db.tables().create("r1", "b1", 9, 4).await.unwrap();
        let mut conn = db.pool().acquire().await.unwrap();

        let created = Utc::now() - Duration::minutes(30);
        let order = order_at(5, created);
        repo.insert_order(&mut conn, &order).await.unwrap();

        let dest_start = Utc::now();
        let moved_at = dest_start + Duration::seconds(1);
        repo.move_order(&mut conn, &order.id, &table.id, 9, moved_at)
            .await
            .unwrap();

        let ledger = repo
            .query_orders_since(&mut conn, &key(9, dest_start))
            .await
            .unwrap();
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger[0].order.created_at, created);
        assert!(repo
            .query_orders_since(&mut conn, &key(5, created))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_status_and_payment_updates() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.orders();
        let mut conn = db.pool().acquire().await.unwrap();

        let order = order_at(5, Utc::now());
        repo.insert_order(&mut conn, &order).await.unwrap();

        repo.update_order_status(&mut conn, &order.id, OrderStatus::Rejected, Some("no stock"))
            .await
            .unwrap();
        repo.update_order_payment_state(&mut conn, &order.id, PaymentState::Paid, Some("cash"))
            .await
            .unwrap();

        let stored = repo.get_order(&mut conn, "r1", &order.id).await.unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::Rejected);
        assert_eq!(stored.rejection_reason.as_deref(), Some("no stock"));
        assert_eq!(stored.payment_state, PaymentState::Paid);
        assert_eq!(stored.payment_method_id.as_deref(), Some("cash"));
        assert!(repo.get_order(&mut conn, "r2", &order.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_history_is_newest_first() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.orders();
        let mut conn = db.pool().acquire().await.unwrap();

        let now = Utc::now();
        let first = order_at(5, now - Duration::hours(3));
        let second = order_at(5, now);
        repo.insert_order(&mut conn, &first).await.unwrap();
        repo.insert_order(&mut conn, &second).await.unwrap();

        let history = repo
            .history_for_table_number(&mut conn, "r1", "b1", 5, 10)
            .await
            .unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].order.id, second.id);

        let limited = repo
            .history_for_table_number(&mut conn, "r1", "b1", 5, 1)
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);
    }
}
