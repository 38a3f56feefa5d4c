//! # Table Repository
//!
//! The Table Registry: physical tables and their session fields.
//!
//! ## Locking
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  lock_and_get(table)                                                    │
//! │                                                                         │
//! │    UPDATE tables SET lock_version = lock_version + 1                   │
//! │    WHERE id = ? AND restaurant_id = ?                                  │
//! │    RETURNING ...                                                        │
//! │                                                                         │
//! │  A write, so the row is read under the transaction's write lock and    │
//! │  nobody else can change it until COMMIT / ROLLBACK.                    │
//! │                                                                         │
//! │  Operations that touch two tables lock them in ascending id order.     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{SqliteConnection, SqlitePool};
use tracing::debug;
use uuid::Uuid;

use crate::error::DbResult;
use comanda_core::{Money, Table, TableState};

macro_rules! table_columns {
    () => {
        "id, number, capacity, branch_id, restaurant_id, state, session_start, \
         cached_running_total, current_order_ref, group_ref, created_at, updated_at"
    };
}

/// Floor overview for a branch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct TableStatistics {
    pub total: i64,
    pub free: i64,
    pub occupied: i64,
    pub pending_payment: i64,
    pub reserved: i64,
    pub maintenance: i64,
    /// Sum of cached running totals. Indicative only.
    pub open_amount: Money,
}

/// Repository for table registry operations.
#[derive(Debug, Clone)]
pub struct TableRepository {
    pool: SqlitePool,
}

impl TableRepository {
    /// Creates a new TableRepository.
    pub fn new(pool: SqlitePool) -> Self {
        TableRepository { pool }
    }

    /// Registers a new free table. Uses its own connection.
    ///
    /// ## Returns
    /// * `Err(DbError::UniqueViolation)` - The number is taken in this branch
    pub async fn create(
        &self,
        restaurant_id: &str,
        branch_id: &str,
        number: i64,
        capacity: i64,
    ) -> DbResult<Table> {
        let now = Utc::now();
        let table = Table {
            id: Uuid::new_v4().to_string(),
            number,
            capacity,
            branch_id: branch_id.to_string(),
            restaurant_id: restaurant_id.to_string(),
            state: TableState::Free,
            session_start: None,
            cached_running_total: Money::zero(),
            current_order_ref: None,
            group_ref: None,
            created_at: now,
            updated_at: now,
        };

        let mut conn = self.pool.acquire().await?;
        self.insert(&mut conn, &table).await?;
        Ok(table)
    }

    /// Inserts a table row.
    pub async fn insert(&self, conn: &mut SqliteConnection, table: &Table) -> DbResult<()> {
        debug!(id = %table.id, number = table.number, "Inserting table");

        sqlx::query(
            r#"
            INSERT INTO tables (
                id, number, capacity, branch_id, restaurant_id, state, session_start,
                cached_running_total, current_order_ref, group_ref, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
        )
        .bind(&table.id)
        .bind(table.number)
        .bind(table.capacity)
        .bind(&table.branch_id)
        .bind(&table.restaurant_id)
        .bind(table.state)
        .bind(table.session_start)
        .bind(table.cached_running_total)
        .bind(&table.current_order_ref)
        .bind(&table.group_ref)
        .bind(table.created_at)
        .bind(table.updated_at)
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    /// Reads a table without locking it. Uses its own connection.
    pub async fn find(&self, restaurant_id: &str, id: &str) -> DbResult<Option<Table>> {
        let mut conn = self.pool.acquire().await?;
        self.get_by_id(&mut conn, restaurant_id, id).await
    }

    /// Reads a table, scoped to a restaurant.
    pub async fn get_by_id(
        &self,
        conn: &mut SqliteConnection,
        restaurant_id: &str,
        id: &str,
    ) -> DbResult<Option<Table>> {
        let table = sqlx::query_as::<_, Table>(concat!(
            "SELECT ",
            table_columns!(),
            " FROM tables WHERE id = ?1 AND restaurant_id = ?2"
        ))
        .bind(id)
        .bind(restaurant_id)
        .fetch_optional(&mut *conn)
        .await?;

        Ok(table)
    }

    /// Looks a table up by its business number within a branch.
    pub async fn get_by_number(
        &self,
        conn: &mut SqliteConnection,
        restaurant_id: &str,
        branch_id: &str,
        number: i64,
    ) -> DbResult<Option<Table>> {
        let table = sqlx::query_as::<_, Table>(concat!(
            "SELECT ",
            table_columns!(),
            " FROM tables WHERE restaurant_id = ?1 AND branch_id = ?2 AND number = ?3"
        ))
        .bind(restaurant_id)
        .bind(branch_id)
        .bind(number)
        .fetch_optional(&mut *conn)
        .await?;

        Ok(table)
    }

    /// All tables of a branch, by number.
    pub async fn list_by_branch(
        &self,
        conn: &mut SqliteConnection,
        restaurant_id: &str,
        branch_id: &str,
    ) -> DbResult<Vec<Table>> {
        let tables = sqlx::query_as::<_, Table>(concat!(
            "SELECT ",
            table_columns!(),
            " FROM tables WHERE restaurant_id = ?1 AND branch_id = ?2 ORDER BY number"
        ))
        .bind(restaurant_id)
        .bind(branch_id)
        .fetch_all(&mut *conn)
        .await?;

        Ok(tables)
    }

    /// Locks a table row for the rest of the transaction and returns it.
    ///
    /// ## Returns
    /// * `Ok(None)` - No such table for this restaurant
    pub async fn lock_and_get(
        &self,
        conn: &mut SqliteConnection,
        restaurant_id: &str,
        id: &str,
    ) -> DbResult<Option<Table>> {
        let table = sqlx::query_as::<_, Table>(concat!(
            "UPDATE tables SET lock_version = lock_version + 1 ",
            "WHERE id = ?1 AND restaurant_id = ?2 RETURNING ",
            table_columns!()
        ))
        .bind(id)
        .bind(restaurant_id)
        .fetch_optional(&mut *conn)
        .await?;

        Ok(table)
    }

    /// Writes back every mutable field of a table.
    pub async fn update(&self, conn: &mut SqliteConnection, table: &Table) -> DbResult<()> {
        debug!(
            id = %table.id,
            state = %table.state,
            total = table.cached_running_total.cents(),
            "Updating table"
        );

        sqlx::query(
            r#"
            UPDATE tables SET
                number = ?2,
                capacity = ?3,
                state = ?4,
                session_start = ?5,
                cached_running_total = ?6,
                current_order_ref = ?7,
                group_ref = ?8,
                updated_at = ?9
            WHERE id = ?1
            "#,
        )
        .bind(&table.id)
        .bind(table.number)
        .bind(table.capacity)
        .bind(table.state)
        .bind(table.session_start)
        .bind(table.cached_running_total)
        .bind(&table.current_order_ref)
        .bind(&table.group_ref)
        .bind(table.updated_at)
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    /// Sets or clears the group reference of a table.
    pub async fn set_group_ref(
        &self,
        conn: &mut SqliteConnection,
        id: &str,
        group_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> DbResult<()> {
        sqlx::query("UPDATE tables SET group_ref = ?2, updated_at = ?3 WHERE id = ?1")
            .bind(id)
            .bind(group_id)
            .bind(now)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    /// Counts tables per state for a branch.
    pub async fn statistics(
        &self,
        conn: &mut SqliteConnection,
        restaurant_id: &str,
        branch_id: &str,
    ) -> DbResult<TableStatistics> {
        let stats = sqlx::query_as::<_, TableStatistics>(
            r#"
            SELECT
                COUNT(*) AS total,
                COALESCE(SUM(state = 'free'), 0) AS free,
                COALESCE(SUM(state = 'occupied'), 0) AS occupied,
                COALESCE(SUM(state = 'pending_payment'), 0) AS pending_payment,
                COALESCE(SUM(state = 'reserved'), 0) AS reserved,
                COALESCE(SUM(state = 'maintenance'), 0) AS maintenance,
                COALESCE(SUM(cached_running_total), 0) AS open_amount
            FROM tables
            WHERE restaurant_id = ?1 AND branch_id = ?2
            "#,
        )
        .bind(restaurant_id)
        .bind(branch_id)
        .fetch_one(&mut *conn)
        .await?;

        Ok(stats)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
