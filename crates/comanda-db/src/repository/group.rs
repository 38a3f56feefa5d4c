//! # Group Repository
//!
//! Table groups and the membership index. The authoritative "which group is
//! this table in" answer is `tables.group_ref`; `group_members` lists the
//! tables of a group without the group row holding a list.

use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqlitePool};
use tracing::debug;

use crate::error::DbResult;
use comanda_core::Group;

macro_rules! group_columns {
    () => {
        "id, restaurant_id, branch_id, responsible_server_id, state, created_at, closed_at"
    };
}

/// Repository for table groups.
#[derive(Debug, Clone)]
pub struct GroupRepository {
    pool: SqlitePool,
}

impl GroupRepository {
    /// Creates a new GroupRepository.
    pub fn new(pool: SqlitePool) -> Self {
        GroupRepository { pool }
    }

    /// Inserts a group header.
    pub async fn insert(&self, conn: &mut SqliteConnection, group: &Group) -> DbResult<()> {
        debug!(id = %group.id, "Inserting group");

        sqlx::query(
            r#"
            INSERT INTO table_groups (
                id, restaurant_id, branch_id, responsible_server_id, state, created_at, closed_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(&group.id)
        .bind(&group.restaurant_id)
        .bind(&group.branch_id)
        .bind(&group.responsible_server_id)
        .bind(group.state)
        .bind(group.created_at)
        .bind(group.closed_at)
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    /// Reads a group, scoped to a restaurant.
    pub async fn get(
        &self,
        conn: &mut SqliteConnection,
        restaurant_id: &str,
        id: &str,
    ) -> DbResult<Option<Group>> {
        let group = sqlx::query_as::<_, Group>(concat!(
            "SELECT ",
            group_columns!(),
            " FROM table_groups WHERE id = ?1 AND restaurant_id = ?2"
        ))
        .bind(id)
        .bind(restaurant_id)
        .fetch_optional(&mut *conn)
        .await?;

        Ok(group)
    }

    /// Reads a group. Uses its own connection.
    pub async fn find(&self, restaurant_id: &str, id: &str) -> DbResult<Option<Group>> {
        let mut conn = self.pool.acquire().await?;
        self.get(&mut conn, restaurant_id, id).await
    }

    /// Table ids of a group, sorted ascending (the lock order).
    pub async fn members(
        &self,
        conn: &mut SqliteConnection,
        group_id: &str,
    ) -> DbResult<Vec<String>> {
        let members = sqlx::query_scalar::<_, String>(
            "SELECT table_id FROM group_members WHERE group_id = ?1 ORDER BY table_id",
        )
        .bind(group_id)
        .fetch_all(&mut *conn)
        .await?;

        Ok(members)
    }

    pub async fn add_member(
        &self,
        conn: &mut SqliteConnection,
        group_id: &str,
        table_id: &str,
        now: DateTime<Utc>,
    ) -> DbResult<()> {
        sqlx::query(
            "INSERT INTO group_members (group_id, table_id, joined_at) VALUES (?1, ?2, ?3)",
        )
        .bind(group_id)
        .bind(table_id)
        .bind(now)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    pub async fn remove_member(
        &self,
        conn: &mut SqliteConnection,
        group_id: &str,
        table_id: &str,
    ) -> DbResult<()> {
        sqlx::query("DELETE FROM group_members WHERE group_id = ?1 AND table_id = ?2")
            .bind(group_id)
            .bind(table_id)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    /// Marks a group closed. Membership rows are kept as history.
    pub async fn close(
        &self,
        conn: &mut SqliteConnection,
        id: &str,
        now: DateTime<Utc>,
    ) -> DbResult<()> {
        debug!(id = %id, "Closing group");

        sqlx::query(
            "UPDATE table_groups SET state = 'closed', closed_at = ?2 WHERE id = ?1 AND state = 'active'",
        )
        .bind(id)
        .bind(now)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    /// The active group listing a table as member, looked up through the
    /// membership index.
    pub async fn active_group_for_table(
        &self,
        conn: &mut SqliteConnection,
        table_id: &str,
    ) -> DbResult<Option<Group>> {
        let group = sqlx::query_as::<_, Group>(
            r#"
            SELECT g.id, g.restaurant_id, g.branch_id, g.responsible_server_id,
                   g.state, g.created_at, g.closed_at
            FROM table_groups g
            JOIN group_members m ON m.group_id = g.id
            WHERE m.table_id = ?1 AND g.state = 'active'
            "#,
        )
        .bind(table_id)
        .fetch_optional(&mut *conn)
        .await?;

        Ok(group)
    }

    /// Active groups of a branch, oldest first.
    pub async fn list_active(
        &self,
        conn: &mut SqliteConnection,
        restaurant_id: &str,
        branch_id: &str,
    ) -> DbResult<Vec<Group>> {
        let groups = sqlx::query_as::<_, Group>(concat!(
            "SELECT ",
            group_columns!(),
            " FROM table_groups",
            " WHERE restaurant_id = ?1 AND branch_id = ?2 AND state = 'active'",
            " ORDER BY created_at, id"
        ))
        .bind(restaurant_id)
        .bind(branch_id)
        .fetch_all(&mut *conn)
        .await?;

        Ok(groups)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
