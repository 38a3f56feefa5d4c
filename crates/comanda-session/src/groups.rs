//! # Group Coordinator
//!
//! Groups bill two or more tables together. A group is an overlay: it never
//! changes a member's state or session, it only sets `group_ref`.
//!
//! ## Membership Rules
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  create / add      table must not be in another active group           │
//! │                    all members share one branch                        │
//! │                                                                         │
//! │  remove            table must be a member                              │
//! │                    fewer than 2 left ──► group closes, refs cleared     │
//! │                                                                         │
//! │  close             refs cleared, membership rows kept as history       │
//! │                                                                         │
//! │  split(source, others)                                                  │
//! │                    create(source ∪ others) where source is seated and   │
//! │                    every other table is free                            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every operation that touches several tables locks them in ascending id
//! order.

use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;
use tracing::info;
use uuid::Uuid;

use comanda_core::accumulator::accumulate;
use comanda_core::validation::{validate_group_tables, validate_uuid};
use comanda_core::{
    Actor, Group, GroupState, Money, SessionTotals, Table, TableState, ValidationError,
    MIN_GROUP_TABLES,
};

use crate::engine::TableSessionEngine;
use crate::error::{SessionError, SessionResult};
use crate::model::{ActiveGroupSummary, GroupPreBillView, GroupView, MemberPreBill};

impl TableSessionEngine {
    /// Bills several tables as one.
    ///
    /// ## Returns
    /// * `Err(SessionError::TableAlreadyGrouped)` - Lists every offending table
    pub async fn create_group(
        &self,
        actor: &Actor,
        table_ids: &[String],
        responsible_server_id: &str,
    ) -> SessionResult<GroupView> {
        validate_group_tables(table_ids)?;
        for id in table_ids {
            validate_uuid("table_id", id)?;
        }
        if responsible_server_id.trim().is_empty() {
            return Err(ValidationError::Required {
                field: "responsible_server_id".to_string(),
            }
            .into());
        }

        let view = self
            .run("create_group", async {
                let mut tx = self.db.begin_write().await?;
                let tables = self.lock_all(&mut *tx, actor, table_ids).await?;

                let view = self
                    .create_group_locked(&mut *tx, &tables, responsible_server_id, Utc::now())
                    .await?;
                tx.commit().await?;
                Ok(view)
            })
            .await?;

        info!(
            group_id = %view.group.id,
            tables = view.table_ids.len(),
            responsible = %view.group.responsible_server_id,
            "Group created"
        );
        Ok(view)
    }

    /// Adds one more table to an active group.
    pub async fn add_table_to_group(
        &self,
        actor: &Actor,
        group_id: &str,
        table_id: &str,
    ) -> SessionResult<GroupView> {
        validate_uuid("group_id", group_id)?;
        validate_uuid("table_id", table_id)?;

        let view = self
            .run("add_table_to_group", async {
                let mut tx = self.db.begin_write().await?;
                let groups = self.db.groups();
                let group = self.active_group(&mut *tx, actor, group_id).await?;
                let table = self.lock_table(&mut *tx, actor, table_id).await?;

                if table.branch_id != group.branch_id {
                    return Err(other_branch());
                }
                self.ensure_ungrouped(&mut *tx, std::slice::from_ref(&table))
                    .await?;

                let now = Utc::now();
                groups.add_member(&mut *tx, &group.id, &table.id, now).await?;
                self.db
                    .tables()
                    .set_group_ref(&mut *tx, &table.id, Some(group.id.as_str()), now)
                    .await?;

                let table_ids = groups.members(&mut *tx, &group.id).await?;
                tx.commit().await?;
                Ok(GroupView { group, table_ids })
            })
            .await?;

        info!(group_id = %view.group.id, table_id = %table_id, "Table added to group");
        Ok(view)
    }

    /// Takes a table out of its group. A group left with a single table is
    /// dissolved.
    pub async fn remove_table_from_group(
        &self,
        actor: &Actor,
        group_id: &str,
        table_id: &str,
    ) -> SessionResult<GroupView> {
        validate_uuid("group_id", group_id)?;
        validate_uuid("table_id", table_id)?;

        let view = self
            .run("remove_table_from_group", async {
                let mut tx = self.db.begin_write().await?;
                let groups = self.db.groups();
                let mut group = self.active_group(&mut *tx, actor, group_id).await?;

                let members = groups.members(&mut *tx, &group.id).await?;
                if !members.iter().any(|m| m == table_id) {
                    return Err(SessionError::NotGroupMember {
                        group_id: group.id.clone(),
                        table_id: table_id.to_string(),
                    });
                }
                self.lock_all(&mut *tx, actor, &members).await?;

                let now = Utc::now();
                groups.remove_member(&mut *tx, &group.id, table_id).await?;
                self.db
                    .tables()
                    .set_group_ref(&mut *tx, table_id, None, now)
                    .await?;

                let remaining: Vec<String> =
                    members.into_iter().filter(|m| m != table_id).collect();
                if remaining.len() < MIN_GROUP_TABLES {
                    self.dissolve(&mut *tx, &mut group, &remaining, now).await?;
                }

                tx.commit().await?;
                Ok(GroupView {
                    group,
                    table_ids: remaining,
                })
            })
            .await?;

        info!(
            group_id = %view.group.id,
            table_id = %table_id,
            dissolved = view.group.state == GroupState::Closed,
            "Table removed from group"
        );
        Ok(view)
    }

    /// Ends a group. Billing stays per table (or via the group prefactura
    /// taken before closing).
    pub async fn close_group(&self, actor: &Actor, group_id: &str) -> SessionResult<GroupView> {
        validate_uuid("group_id", group_id)?;

        let view = self
            .run("close_group", async {
                let mut tx = self.db.begin_write().await?;
                let mut group = self.active_group(&mut *tx, actor, group_id).await?;

                let members = self.db.groups().members(&mut *tx, &group.id).await?;
                self.lock_all(&mut *tx, actor, &members).await?;
                self.dissolve(&mut *tx, &mut group, &members, Utc::now())
                    .await?;

                tx.commit().await?;
                Ok(GroupView {
                    group,
                    table_ids: members,
                })
            })
            .await?;

        info!(group_id = %view.group.id, tables = view.table_ids.len(), "Group closed");
        Ok(view)
    }

    /// Seats a party across a seated table and free neighbours: a group whose
    /// responsible server is the caller.
    pub async fn split(
        &self,
        actor: &Actor,
        source_table_id: &str,
        other_table_ids: &[String],
    ) -> SessionResult<GroupView> {
        let mut table_ids = Vec::with_capacity(other_table_ids.len() + 1);
        table_ids.push(source_table_id.to_string());
        table_ids.extend(other_table_ids.iter().cloned());

        validate_group_tables(&table_ids)?;
        for id in &table_ids {
            validate_uuid("table_id", id)?;
        }

        let view = self
            .run("split", async {
                let mut tx = self.db.begin_write().await?;
                let tables = self.lock_all(&mut *tx, actor, &table_ids).await?;

                for table in &tables {
                    let allowed = if table.id == source_table_id {
                        table.state.has_session()
                    } else {
                        table.state == TableState::Free
                    };
                    if !allowed {
                        return Err(SessionError::not_available(&table.id, "split", table.state));
                    }
                }

                let view = self
                    .create_group_locked(&mut *tx, &tables, &actor.user_id, Utc::now())
                    .await?;
                tx.commit().await?;
                Ok(view)
            })
            .await?;

        info!(
            group_id = %view.group.id,
            source = %source_table_id,
            tables = view.table_ids.len(),
            "Table split into group"
        );
        Ok(view)
    }

    /// Consolidated prefactura: each member's authoritative totals and their
    /// sum. Members without a session contribute nothing.
    pub async fn generate_group_prebill(
        &self,
        actor: &Actor,
        group_id: &str,
    ) -> SessionResult<GroupPreBillView> {
        validate_uuid("group_id", group_id)?;

        self.run("generate_group_prebill", async {
            let mut tx = self.db.pool().begin().await?;
            let group = self
                .db
                .groups()
                .get(&mut *tx, &actor.restaurant_id, group_id)
                .await?
                .ok_or_else(|| SessionError::group_not_found(group_id))?;

            let mut members = Vec::new();
            for table_id in self.db.groups().members(&mut *tx, &group.id).await? {
                let table = self
                    .db
                    .tables()
                    .get_by_id(&mut *tx, &actor.restaurant_id, &table_id)
                    .await?
                    .ok_or_else(|| SessionError::table_not_found(&table_id))?;

                let totals = match self.resolve_session(&mut *tx, &table).await?.0 {
                    Some(key) => {
                        let ledger = self.db.orders().query_orders_since(&mut *tx, &key).await?;
                        accumulate(&table.id, Some(&key), &ledger)?
                    }
                    None => SessionTotals::empty(),
                };

                members.push(MemberPreBill {
                    table_id: table.id,
                    table_number: table.number,
                    state: table.state,
                    totals,
                });
            }
            tx.rollback().await?;

            let combined = SessionTotals::combine(members.iter().map(|m| &m.totals));
            Ok(GroupPreBillView {
                group_id: group.id,
                members,
                combined,
            })
        })
        .await
    }

    /// The active group a table belongs to, if any.
    pub async fn group_for_table(
        &self,
        actor: &Actor,
        table_id: &str,
    ) -> SessionResult<Option<GroupView>> {
        validate_uuid("table_id", table_id)?;

        let mut conn = self.db.pool().acquire().await?;
        let table = self
            .db
            .tables()
            .get_by_id(&mut conn, &actor.restaurant_id, table_id)
            .await?
            .ok_or_else(|| SessionError::table_not_found(table_id))?;

        let groups = self.db.groups();
        let Some(group) = groups.active_group_for_table(&mut conn, &table.id).await? else {
            return Ok(None);
        };
        let table_ids = groups.members(&mut conn, &group.id).await?;
        Ok(Some(GroupView { group, table_ids }))
    }

    /// Active groups of the actor's branch with their cached totals.
    pub async fn list_active_groups(&self, actor: &Actor) -> SessionResult<Vec<ActiveGroupSummary>> {
        let mut conn = self.db.pool().acquire().await?;
        let groups = self.db.groups();

        let mut summaries = Vec::new();
        for group in groups
            .list_active(&mut conn, &actor.restaurant_id, &actor.branch_id)
            .await?
        {
            let table_ids = groups.members(&mut conn, &group.id).await?;
            let mut cached_total = Money::zero();
            for id in &table_ids {
                if let Some(table) = self
                    .db
                    .tables()
                    .get_by_id(&mut conn, &actor.restaurant_id, id)
                    .await?
                {
                    cached_total += table.cached_running_total;
                }
            }
            summaries.push(ActiveGroupSummary {
                group,
                table_ids,
                cached_total,
            });
        }

        Ok(summaries)
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    async fn active_group(
        &self,
        conn: &mut SqliteConnection,
        actor: &Actor,
        group_id: &str,
    ) -> SessionResult<Group> {
        let group = self
            .db
            .groups()
            .get(conn, &actor.restaurant_id, group_id)
            .await?
            .ok_or_else(|| SessionError::group_not_found(group_id))?;

        if group.state == GroupState::Closed {
            return Err(SessionError::GroupClosed {
                group_id: group.id,
            });
        }
        Ok(group)
    }

    /// Refuses tables that already belong to an active group.
    async fn ensure_ungrouped(
        &self,
        conn: &mut SqliteConnection,
        tables: &[Table],
    ) -> SessionResult<()> {
        let mut grouped = Vec::new();
        for table in tables {
            let indexed = self
                .db
                .groups()
                .active_group_for_table(conn, &table.id)
                .await?;
            if table.group_ref.is_some() || indexed.is_some() {
                grouped.push(table.id.clone());
            }
        }

        if grouped.is_empty() {
            Ok(())
        } else {
            Err(SessionError::TableAlreadyGrouped { table_ids: grouped })
        }
    }

    async fn create_group_locked(
        &self,
        conn: &mut SqliteConnection,
        tables: &[Table],
        responsible_server_id: &str,
        now: DateTime<Utc>,
    ) -> SessionResult<GroupView> {
        let Some(first) = tables.first() else {
            return Err(ValidationError::TooFew {
                field: "table_ids".to_string(),
                min: MIN_GROUP_TABLES,
            }
            .into());
        };
        if tables.iter().any(|t| t.branch_id != first.branch_id) {
            return Err(other_branch());
        }
        self.ensure_ungrouped(conn, tables).await?;

        let group = Group {
            id: Uuid::new_v4().to_string(),
            restaurant_id: first.restaurant_id.clone(),
            branch_id: first.branch_id.clone(),
            responsible_server_id: responsible_server_id.to_string(),
            state: GroupState::Active,
            created_at: now,
            closed_at: None,
        };

        let groups = self.db.groups();
        groups.insert(conn, &group).await?;
        for table in tables {
            groups.add_member(conn, &group.id, &table.id, now).await?;
            self.db
                .tables()
                .set_group_ref(conn, &table.id, Some(group.id.as_str()), now)
                .await?;
        }

        let table_ids = groups.members(conn, &group.id).await?;
        Ok(GroupView { group, table_ids })
    }

    /// Closes a group and clears the refs of `members`.
    async fn dissolve(
        &self,
        conn: &mut SqliteConnection,
        group: &mut Group,
        members: &[String],
        now: DateTime<Utc>,
    ) -> SessionResult<()> {
        for table_id in members {
            self.db
                .tables()
                .set_group_ref(conn, table_id, None, now)
                .await?;
        }
        self.db.groups().close(conn, &group.id, now).await?;

        group.state = GroupState::Closed;
        group.closed_at = Some(now);
        Ok(())
    }
}

fn other_branch() -> SessionError {
    ValidationError::InvalidFormat {
        field: "table_ids".to_string(),
        reason: "all tables of a group must belong to one branch".to_string(),
    }
    .into()
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::*;
    use crate::model::AddOrderRequest;
    use comanda_core::NewOrderLine;

    #[tokio::test]
    async fn test_create_and_auto_dissolve() {
        let fx = Fixture::new().await;
        let t3 = fx.table(3).await;
        let t4 = fx.table(4).await;
        let actor = waiter();

        fx.engine.open(&cashier(), &t3).await.unwrap();
        fx.engine.open(&cashier(), &t4).await.unwrap();

        let view = fx
            .engine
            .create_group(&actor, &[t3.clone(), t4.clone()], "server-7")
            .await
            .unwrap();
        assert_eq!(view.group.state, GroupState::Active);
        assert_eq!(view.group.responsible_server_id, "server-7");

        for id in [&t3, &t4] {
            let table = fx.get(id).await;
            assert_eq!(table.group_ref.as_deref(), Some(view.group.id.as_str()));
            assert_eq!(table.state, TableState::Occupied);
        }

        let after = fx
            .engine
            .remove_table_from_group(&actor, &view.group.id, &t3)
            .await
            .unwrap();
        assert_eq!(after.group.state, GroupState::Closed);
        assert_eq!(after.table_ids, vec![t4.clone()]);
        assert!(fx.get(&t3).await.group_ref.is_none());
        assert!(fx.get(&t4).await.group_ref.is_none());
        assert_eq!(fx.get(&t4).await.state, TableState::Occupied);
    }

    #[tokio::test]
    async fn test_table_cannot_join_two_groups() {
        let fx = Fixture::new().await;
        let t1 = fx.table(1).await;
        let t2 = fx.table(2).await;
        let t3 = fx.table(3).await;
        let actor = waiter();

        let group = fx
            .engine
            .create_group(&actor, &[t1.clone(), t2.clone()], "server-7")
            .await
            .unwrap();

        let err = fx
            .engine
            .create_group(&actor, &[t2.clone(), t3.clone()], "server-8")
            .await
            .unwrap_err();
        match err {
            SessionError::TableAlreadyGrouped { table_ids } => assert_eq!(table_ids, vec![t2.clone()]),
            other => panic!("unexpected error: {other}"),
        }
        assert!(fx.get(&t3).await.group_ref.is_none());

        let view = fx
            .engine
            .add_table_to_group(&actor, &group.group.id, &t3)
            .await
            .unwrap();
        assert_eq!(view.table_ids.len(), 3);

        let err = fx
            .engine
            .add_table_to_group(&actor, &group.group.id, &t3)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::TableAlreadyGrouped { .. }));
    }

    #[tokio::test]
    async fn test_group_validation() {
        let fx = Fixture::new().await;
        let t1 = fx.table(1).await;
        let actor = waiter();

        let err = fx
            .engine
            .create_group(&actor, &[t1.clone()], "server-7")
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Validation(ValidationError::TooFew { .. })));

        let err = fx
            .engine
            .create_group(&actor, &[t1.clone(), t1.clone()], "server-7")
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Validation(ValidationError::Duplicate { .. })));

        let elsewhere = fx
            .engine
            .database()
            .tables()
            .create(RESTAURANT, "terrace", 1, 2)
            .await
            .unwrap();
        let err = fx
            .engine
            .create_group(&actor, &[t1.clone(), elsewhere.id], "server-7")
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Validation(ValidationError::InvalidFormat { .. })));
    }

    #[tokio::test]
    async fn test_remove_and_close_errors() {
        let fx = Fixture::new().await;
        let t1 = fx.table(1).await;
        let t2 = fx.table(2).await;
        let t3 = fx.table(3).await;
        let t9 = fx.table(9).await;
        let actor = waiter();

        let group = fx
            .engine
            .create_group(&actor, &[t1.clone(), t2.clone(), t3.clone()], "server-7")
            .await
            .unwrap()
            .group;

        let err = fx
            .engine
            .remove_table_from_group(&actor, &group.id, &t9)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::NotGroupMember { .. }));

        // Three members: removing one keeps the group alive.
        let view = fx
            .engine
            .remove_table_from_group(&actor, &group.id, &t1)
            .await
            .unwrap();
        assert_eq!(view.group.state, GroupState::Active);
        assert_eq!(view.table_ids.len(), 2);

        let closed = fx.engine.close_group(&actor, &group.id).await.unwrap();
        assert_eq!(closed.group.state, GroupState::Closed);
        assert!(fx.get(&t2).await.group_ref.is_none());
        assert!(fx.get(&t3).await.group_ref.is_none());

        let err = fx.engine.close_group(&actor, &group.id).await.unwrap_err();
        assert!(matches!(err, SessionError::GroupClosed { .. }));

        let missing = Uuid::new_v4().to_string();
        let err = fx.engine.close_group(&actor, &missing).await.unwrap_err();
        assert!(matches!(err, SessionError::GroupNotFound { .. }));
    }

    #[tokio::test]
    async fn test_split_requires_free_neighbours() {
        let fx = Fixture::new().await;
        let source = fx.table(1).await;
        let free = fx.table(2).await;
        let busy = fx.table(3).await;
        let actor = waiter();

        fx.engine.open(&cashier(), &source).await.unwrap();
        fx.engine.open(&cashier(), &busy).await.unwrap();

        let err = fx
            .engine
            .split(&actor, &source, &[free.clone(), busy.clone()])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SessionError::TableNotAvailable { ref table_id, attempted: "split", current: TableState::Occupied } if *table_id == busy
        ));

        let view = fx.engine.split(&actor, &source, &[free.clone()]).await.unwrap();
        assert_eq!(view.group.responsible_server_id, actor.user_id);
        assert_eq!(fx.get(&free).await.state, TableState::Free);
        assert!(fx.get(&free).await.group_ref.is_some());
    }

    #[tokio::test]
    async fn test_group_for_table() {
        let fx = Fixture::new().await;
        let t1 = fx.table(1).await;
        let t2 = fx.table(2).await;
        let t3 = fx.table(3).await;
        let actor = waiter();

        assert!(fx.engine.group_for_table(&actor, &t1).await.unwrap().is_none());

        let group = fx
            .engine
            .create_group(&actor, &[t1.clone(), t2.clone()], "server-7")
            .await
            .unwrap()
            .group;

        let found = fx.engine.group_for_table(&actor, &t2).await.unwrap().unwrap();
        assert_eq!(found.group.id, group.id);
        assert_eq!(found.table_ids.len(), 2);
        assert!(fx.engine.group_for_table(&actor, &t3).await.unwrap().is_none());

        fx.engine.close_group(&actor, &group.id).await.unwrap();
        assert!(fx.engine.group_for_table(&actor, &t1).await.unwrap().is_none());

        let missing = Uuid::new_v4().to_string();
        let err = fx.engine.group_for_table(&actor, &missing).await.unwrap_err();
        assert!(matches!(err, SessionError::TableNotFound { .. }));
    }

    #[tokio::test]
    async fn test_group_prebill_sums_members() {
        let fx = Fixture::new().await;
        let t1 = fx.table(1).await;
        let t2 = fx.table(2).await;
        let t3 = fx.table(3).await;
        let actor = waiter();

        fx.engine
            .add_order(&actor, &t1, AddOrderRequest::new(vec![NewOrderLine::new(BURGER, 2)]))
            .await
            .unwrap();
        fx.engine
            .add_order(
                &actor,
                &t2,
                AddOrderRequest::new(vec![NewOrderLine::new(BURGER, 1), NewOrderLine::new(SODA, 2)]),
            )
            .await
            .unwrap();

        let group = fx
            .engine
            .create_group(&actor, &[t1.clone(), t2.clone(), t3.clone()], "server-7")
            .await
            .unwrap()
            .group;

        let bill = fx.engine.generate_group_prebill(&actor, &group.id).await.unwrap();
        assert_eq!(bill.members.len(), 3);
        assert_eq!(bill.combined.total, Money::from_cents(9500));

        let burgers = bill
            .combined
            .per_product
            .iter()
            .find(|p| p.product_id == BURGER)
            .unwrap();
        assert_eq!(burgers.quantity, 3);

        let free_member = bill.members.iter().find(|m| m.table_id == t3).unwrap();
        assert!(free_member.totals.total.is_zero());

        let active = fx.engine.list_active_groups(&actor).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].cached_total, Money::from_cents(9500));
        assert_eq!(active[0].table_ids.len(), 3);
    }
}
