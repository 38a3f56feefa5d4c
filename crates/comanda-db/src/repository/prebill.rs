//! # PreBill Repository
//!
//! Prefacturas bracket a table session. At most one is open per table
//! (enforced by a partial unique index); once closed, its total is frozen.

use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqlitePool};
use tracing::debug;

use crate::error::DbResult;
use comanda_core::{Money, PreBill};

macro_rules! prebill_columns {
    () => {
        "id, table_id, restaurant_id, opening_order_ref, state, session_start, \
         closed_total, opened_at, closed_at"
    };
}

/// Repository for prefacturas.
#[derive(Debug, Clone)]
pub struct PreBillRepository {
    pool: SqlitePool,
}

impl PreBillRepository {
    /// Creates a new PreBillRepository.
    pub fn new(pool: SqlitePool) -> Self {
        PreBillRepository { pool }
    }

    /// The open prefactura of a table, if any.
    pub async fn find_open(
        &self,
        conn: &mut SqliteConnection,
        table_id: &str,
    ) -> DbResult<Option<PreBill>> {
        let prebill = sqlx::query_as::<_, PreBill>(concat!(
            "SELECT ",
            prebill_columns!(),
            " FROM prebills WHERE table_id = ?1 AND state = 'open'"
        ))
        .bind(table_id)
        .fetch_optional(&mut *conn)
        .await?;

        Ok(prebill)
    }

    /// Every prefactura of a table, oldest first. Uses its own connection.
    pub async fn list_for_table(&self, table_id: &str) -> DbResult<Vec<PreBill>> {
        let prebills = sqlx::query_as::<_, PreBill>(concat!(
            "SELECT ",
            prebill_columns!(),
            " FROM prebills WHERE table_id = ?1 ORDER BY opened_at, id"
        ))
        .bind(table_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(prebills)
    }

    /// Inserts a prefactura.
    ///
    /// ## Returns
    /// * `Err(DbError::UniqueViolation)` - The table already has an open one
    pub async fn insert(&self, conn: &mut SqliteConnection, prebill: &PreBill) -> DbResult<()> {
        debug!(id = %prebill.id, table_id = %prebill.table_id, "Inserting prebill");

        sqlx::query(
            r#"
            INSERT INTO prebills (
                id, table_id, restaurant_id, opening_order_ref, state,
                session_start, closed_total, opened_at, closed_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
        )
        .bind(&prebill.id)
        .bind(&prebill.table_id)
        .bind(&prebill.restaurant_id)
        .bind(&prebill.opening_order_ref)
        .bind(prebill.state)
        .bind(prebill.session_start)
        .bind(prebill.closed_total)
        .bind(prebill.opened_at)
        .bind(prebill.closed_at)
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    /// Stamps the session start on a waiting prefactura.
    pub async fn start_session(
        &self,
        conn: &mut SqliteConnection,
        id: &str,
        session_start: DateTime<Utc>,
    ) -> DbResult<()> {
        sqlx::query("UPDATE prebills SET session_start = ?2 WHERE id = ?1 AND state = 'open'")
            .bind(id)
            .bind(session_start)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    /// Records the first order of the session, if none is recorded yet.
    pub async fn set_opening_order(
        &self,
        conn: &mut SqliteConnection,
        id: &str,
        order_id: &str,
    ) -> DbResult<()> {
        sqlx::query(
            "UPDATE prebills SET opening_order_ref = COALESCE(opening_order_ref, ?2) WHERE id = ?1",
        )
        .bind(id)
        .bind(order_id)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    /// Closes a prefactura and freezes its total.
    pub async fn close(
        &self,
        conn: &mut SqliteConnection,
        id: &str,
        total: Money,
        now: DateTime<Utc>,
    ) -> DbResult<()> {
        debug!(id = %id, total = total.cents(), "Closing prebill");

        sqlx::query(
            r#"
            UPDATE prebills
            SET state = 'closed', closed_total = ?2, closed_at = ?3
            WHERE id = ?1 AND state = 'open'
            "#,
        )
        .bind(id)
        .bind(total)
        .bind(now)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
