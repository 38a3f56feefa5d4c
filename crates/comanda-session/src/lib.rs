//! # comanda-session: Table Session & Running-Bill Engine
//!
//! Owns every state change of a restaurant table and every write to the
//! order ledger that goes with it.
//!
//! ## Lifecycle
//! ```text
//!            open / add_order                request_bill
//!   ┌──────┐ ──────────────────► ┌──────────┐ ───────────► ┌────────────────┐
//!   │ Free │                     │ Occupied │              │ PendingPayment │
//!   └──────┘ ◄────────────────── └──────────┘              └────────────────┘
//!      ▲  ▲        liberate           │                            │
//!      │  └───────────────────────────┼──── settle / liberate ─────┘
//!      │                              │
//!      │   set_table_availability     │ transfer_line / transfer_order
//!   ┌──┴──────────────────────┐       ▼ (free destinations open)
//!   │ Reserved / Maintenance  │   another table
//!   └─────────────────────────┘
//! ```
//!
//! ## Operation Shape
//! ```text
//! validate ─► begin_write ─► lock tables (ascending id) ─► check state
//!          ─► write ledger ─► recompute cached total ─► commit ─► publish
//! ```
//!
//! Each operation is one transaction bounded by the configured timeout.
//! Events go out only after commit; a failing sink never fails the caller.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use comanda_session::{AddOrderRequest, EngineConfig, TableSessionEngine};
//!
//! let engine = TableSessionEngine::connect(EngineConfig::from_env()?, sink, catalog).await?;
//! engine.add_order(&actor, &table_id, AddOrderRequest::new(lines)).await?;
//! let bill = engine.generate_prebill(&actor, &table_id).await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod config;
pub mod error;
pub mod model;

mod engine;
mod groups;
mod orders;
mod session;
mod settlement;
mod transfer;

// =============================================================================
// Re-exports
// =============================================================================

pub use config::{ConfigError, EngineConfig, SettlementMode};
pub use engine::TableSessionEngine;
pub use error::{ErrorBody, ErrorCode, PendingOrder, SessionError, SessionResult};
pub use model::*;

// =============================================================================
// Engine Tests (file-backed database)
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::*;
    use comanda_core::{Money, NewOrderLine};
    use comanda_db::{Database, DbError};
    use std::path::PathBuf;
    use std::time::Duration;

    /// Temporary WAL database, removed on drop.
    struct TempDb {
        path: PathBuf,
    }

    impl TempDb {
        fn new() -> Self {
            let path = std::env::temp_dir().join(format!("comanda-{}.db", uuid::Uuid::new_v4()));
            TempDb { path }
        }

        fn config(&self) -> EngineConfig {
            EngineConfig {
                database_path: self.path.clone(),
                ..EngineConfig::default()
            }
        }
    }

    impl Drop for TempDb {
        fn drop(&mut self) {
            for suffix in ["", "-wal", "-shm"] {
                let mut file = self.path.clone().into_os_string();
                file.push(suffix);
                let _ = std::fs::remove_file(file);
            }
        }
    }

    async fn fixture(config: EngineConfig) -> Fixture {
        let db = Database::new(config.db_config()).await.unwrap();
        Fixture::with_db(db, config)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_orders_are_all_counted() {
        let temp = TempDb::new();
        let fx = fixture(temp.config()).await;
        let t1 = fx.table(1).await;

        let mut handles = Vec::new();
        for _ in 0..12 {
            let engine = fx.engine.clone();
            let table_id = t1.clone();
            handles.push(tokio::spawn(async move {
                let request = AddOrderRequest::new(vec![NewOrderLine::new(BURGER, 1)]);
                engine.add_order(&waiter(), &table_id, request).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let expected = Money::from_cents(12 * 2500);
        assert_eq!(fx.get(&t1).await.cached_running_total, expected);

        let bill = fx.engine.generate_prebill(&waiter(), &t1).await.unwrap();
        assert_eq!(bill.totals.total, expected);
        assert_eq!(bill.orders.len(), 12);

        // Exactly one of the racing calls opened the table.
        let opened = fx
            .sink
            .events()
            .iter()
            .filter(|e| e.kind() == "table_state_changed")
            .count();
        assert_eq!(opened, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_blocked_writer_times_out_and_leaves_no_trace() {
        let temp = TempDb::new();
        let config = EngineConfig {
            operation_timeout: Duration::from_millis(200),
            busy_timeout: Duration::from_secs(1),
            ..temp.config()
        };
        let fx = fixture(config).await;
        let t1 = fx.table(1).await;

        let blocker = fx.engine.database().begin_write().await.unwrap();
        let err = fx.engine.open(&cashier(), &t1).await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::TransactionFailed {
                source: DbError::TransactionFailed(_)
            }
        ));
        assert_eq!(err.code(), ErrorCode::TransactionFailed);
        blocker.rollback().await.unwrap();

        let table = fx.get(&t1).await;
        assert_eq!(table.state, comanda_core::TableState::Free);
        assert!(fx.sink.events().is_empty());

        // The lock is gone; the same call now goes through.
        let outcome = fx.engine.open(&cashier(), &t1).await.unwrap();
        assert_eq!(outcome.table.state, comanda_core::TableState::Occupied);
    }
}
