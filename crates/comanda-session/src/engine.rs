//! # Table Session Engine
//!
//! The handle every operation hangs off, plus the helpers they share.
//!
//! ## Operation Shape
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  validate request (no I/O)                                              │
//! │         │                                                               │
//! │         ▼                                                               │
//! │  timeout(operation_timeout, async {                                     │
//! │      tx = db.begin_write()          ◄── SQLite write lock, waits up to  │
//! │      table = lock_table(tx, id)         busy_timeout                    │
//! │      check preconditions            ◄── nothing written yet             │
//! │      ledger / registry writes                                           │
//! │      recompute(tx, table)           ◄── accumulator, same transaction   │
//! │      tx.commit()                                                        │
//! │  })                                 ◄── expiry drops tx = ROLLBACK      │
//! │         │                                                               │
//! │         ▼                                                               │
//! │  publish(events)                    ◄── best effort, after commit       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Session Boundary
//! The ledger is filtered by the start of the current occupancy. The open
//! prefactura's `session_start` wins; when it is missing the table's own
//! `session_start` is used and a warning is logged. A table without either
//! has no session.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;
use tracing::{debug, warn};
use uuid::Uuid;

use comanda_core::accumulator::accumulate;
use comanda_core::{
    Actor, Money, NotificationSink, PreBill, PreBillState, PriceCatalog, SessionKey,
    SessionTotals, Table, TableEvent, TableState,
};
use comanda_db::{Database, DbError};

use crate::config::EngineConfig;
use crate::error::{SessionError, SessionResult};

/// The table session engine.
///
/// Cheap to clone; clones share the pool, the sink and the catalog.
///
/// ## Usage
/// ```rust,ignore
/// let engine = TableSessionEngine::connect(
///     EngineConfig::from_env()?,
///     Arc::new(TracingSink),
///     Arc::new(catalog),
/// ).await?;
///
/// engine.open(&actor, &table_id).await?;
/// engine.add_order(&actor, &table_id, AddOrderRequest::new(lines)).await?;
/// let bill = engine.generate_prebill(&actor, &table_id).await?;
/// ```
#[derive(Clone)]
pub struct TableSessionEngine {
    pub(crate) db: Database,
    pub(crate) sink: Arc<dyn NotificationSink>,
    pub(crate) catalog: Arc<dyn PriceCatalog>,
    pub(crate) config: EngineConfig,
}

impl std::fmt::Debug for TableSessionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableSessionEngine")
            .field("db", &self.db)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl TableSessionEngine {
    /// Wraps an existing database handle.
    pub fn new(
        db: Database,
        sink: Arc<dyn NotificationSink>,
        catalog: Arc<dyn PriceCatalog>,
        config: EngineConfig,
    ) -> Self {
        TableSessionEngine {
            db,
            sink,
            catalog,
            config,
        }
    }

    /// Opens the database described by `config` and builds an engine on it.
    pub async fn connect(
        config: EngineConfig,
        sink: Arc<dyn NotificationSink>,
        catalog: Arc<dyn PriceCatalog>,
    ) -> SessionResult<Self> {
        let db = Database::new(config.db_config()).await?;
        Ok(Self::new(db, sink, catalog, config))
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // =========================================================================
    // Execution
    // =========================================================================

    /// Runs one operation under the configured deadline.
    ///
    /// The future owns its transaction; when the deadline fires the future is
    /// dropped and the transaction rolls back with it.
    pub(crate) async fn run<T, F>(&self, operation: &'static str, fut: F) -> SessionResult<T>
    where
        F: Future<Output = SessionResult<T>>,
    {
        let deadline = self.config.operation_timeout;
        match tokio::time::timeout(deadline, fut).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    operation,
                    timeout_ms = deadline.as_millis() as u64,
                    "Operation timed out, transaction rolled back"
                );
                Err(SessionError::TransactionFailed {
                    source: DbError::TransactionFailed(format!(
                        "{operation} timed out after {} ms",
                        deadline.as_millis()
                    )),
                })
            }
        }
    }

    /// Hands committed events to the sink. Failures are logged, never returned.
    pub(crate) fn publish(&self, events: Vec<TableEvent>) {
        for event in events {
            if let Err(e) = self.sink.emit(&event) {
                warn!(
                    event = event.kind(),
                    restaurant_id = %event.restaurant_id(),
                    error = %e,
                    "Notification delivery failed"
                );
            }
        }
    }

    /// Refuses actors that may not take money or close tables.
    pub(crate) fn authorize(&self, actor: &Actor, action: &'static str) -> SessionResult<()> {
        if actor.role.can_settle() {
            Ok(())
        } else {
            Err(SessionError::Forbidden {
                action,
                role: actor.role,
            })
        }
    }

    // =========================================================================
    // Locking
    // =========================================================================

    /// Locks a table of the actor's restaurant for the rest of the transaction.
    pub(crate) async fn lock_table(
        &self,
        conn: &mut SqliteConnection,
        actor: &Actor,
        table_id: &str,
    ) -> SessionResult<Table> {
        self.db
            .tables()
            .lock_and_get(conn, &actor.restaurant_id, table_id)
            .await?
            .ok_or_else(|| SessionError::table_not_found(table_id))
    }

    /// Locks two tables in ascending id order, returned as `(first, second)`.
    pub(crate) async fn lock_pair(
        &self,
        conn: &mut SqliteConnection,
        actor: &Actor,
        first_id: &str,
        second_id: &str,
    ) -> SessionResult<(Table, Table)> {
        if first_id <= second_id {
            let first = self.lock_table(conn, actor, first_id).await?;
            let second = self.lock_table(conn, actor, second_id).await?;
            Ok((first, second))
        } else {
            let second = self.lock_table(conn, actor, second_id).await?;
            let first = self.lock_table(conn, actor, first_id).await?;
            Ok((first, second))
        }
    }

    /// Locks many tables in ascending id order.
    pub(crate) async fn lock_all(
        &self,
        conn: &mut SqliteConnection,
        actor: &Actor,
        table_ids: &[String],
    ) -> SessionResult<Vec<Table>> {
        let mut ids: Vec<&String> = table_ids.iter().collect();
        ids.sort();

        let mut tables = Vec::with_capacity(ids.len());
        for id in ids {
            tables.push(self.lock_table(conn, actor, id).await?);
        }
        Ok(tables)
    }

    // =========================================================================
    // Session helpers
    // =========================================================================

    /// The session key of a table and its open prefactura, if any.
    pub(crate) async fn resolve_session(
        &self,
        conn: &mut SqliteConnection,
        table: &Table,
    ) -> SessionResult<(Option<SessionKey>, Option<PreBill>)> {
        if !table.state.has_session() {
            return Ok((None, None));
        }

        let prebill = self.db.prebills().find_open(conn, &table.id).await?;
        let key = match prebill.as_ref().and_then(|p| p.session_start) {
            Some(since) => Some(SessionKey {
                table_number: table.number,
                branch_id: table.branch_id.clone(),
                restaurant_id: table.restaurant_id.clone(),
                since,
            }),
            None => {
                let fallback = table.session_key();
                if fallback.is_some() {
                    warn!(
                        table_id = %table.id,
                        "No open prebill with a session start, using the table's own session_start"
                    );
                }
                fallback
            }
        };

        Ok((key, prebill))
    }

    /// Recomputes the authoritative total and stores it in the table's cache
    /// field. The caller writes the table back.
    pub(crate) async fn recompute(
        &self,
        conn: &mut SqliteConnection,
        table: &mut Table,
    ) -> SessionResult<SessionTotals> {
        let (key, _) = self.resolve_session(conn, table).await?;
        let Some(key) = key else {
            table.cached_running_total = Money::zero();
            return Ok(SessionTotals::empty());
        };

        let ledger = self.db.orders().query_orders_since(conn, &key).await?;
        let totals = accumulate(&table.id, Some(&key), &ledger)?;

        debug!(
            table_id = %table.id,
            cached = table.cached_running_total.cents(),
            total = totals.total.cents(),
            "Recomputed running total"
        );
        table.cached_running_total = totals.total;
        Ok(totals)
    }

    /// Starts a session on a locked free table and returns its prefactura id.
    ///
    /// A waiting prefactura (no session start yet) is adopted. One that
    /// already carries a start is left over from an interrupted session and
    /// gets closed with a zero total first.
    pub(crate) async fn open_locked(
        &self,
        conn: &mut SqliteConnection,
        table: &mut Table,
        now: DateTime<Utc>,
    ) -> SessionResult<String> {
        let prebills = self.db.prebills();

        let prebill_id = match prebills.find_open(conn, &table.id).await? {
            Some(waiting) if waiting.session_start.is_none() => {
                prebills.start_session(conn, &waiting.id, now).await?;
                waiting.id
            }
            Some(stale) => {
                warn!(
                    table_id = %table.id,
                    prebill_id = %stale.id,
                    "Closing stale open prebill before opening a new session"
                );
                prebills.close(conn, &stale.id, Money::zero(), now).await?;
                self.insert_prebill(conn, table, Some(now), now).await?
            }
            None => self.insert_prebill(conn, table, Some(now), now).await?,
        };

        table.open_session(now);
        Ok(prebill_id)
    }

    /// Inserts an open prefactura. `session_start` is `None` for one that
    /// waits for the next occupancy.
    pub(crate) async fn insert_prebill(
        &self,
        conn: &mut SqliteConnection,
        table: &Table,
        session_start: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> SessionResult<String> {
        let prebill = PreBill {
            id: Uuid::new_v4().to_string(),
            table_id: table.id.clone(),
            restaurant_id: table.restaurant_id.clone(),
            opening_order_ref: None,
            state: PreBillState::Open,
            session_start,
            closed_total: None,
            opened_at: now,
            closed_at: None,
        };
        self.db.prebills().insert(conn, &prebill).await?;
        Ok(prebill.id)
    }
}

/// Event for a table whose state moved from `previous`.
pub(crate) fn state_changed(table: &Table, previous: TableState) -> TableEvent {
    TableEvent::TableStateChanged {
        table_id: table.id.clone(),
        table_number: table.number,
        restaurant_id: table.restaurant_id.clone(),
        branch_id: table.branch_id.clone(),
        previous,
        state: table.state,
    }
}

// =============================================================================
// Test Fixtures
// =============================================================================


// =============================================================================
// Unit Tests
// =============================================================================
