//! # Repository Module
//!
//! Database repository implementations for the table session engine.
//!
//! ## Repository Pattern
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Engine operation                                                       │
//! │       │                                                                 │
//! │       │  let mut tx = db.begin_write().await?;                         │
//! │       │  db.tables().lock_and_get(&mut *tx, ...)                       │
//! │       │  db.orders().insert_order(&mut *tx, ...)                       │
//! │       │  tx.commit()                                                    │
//! │       ▼                                                                 │
//! │  Repositories hold the SQL. Every method that takes a connection runs  │
//! │  on whatever the caller hands it, so several repositories can share   │
//! │  one transaction.                                                      │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  SQLite Database                                                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Available Repositories
//!
//! - [`TableRepository`](table::TableRepository) - Table registry and row locks
//! - [`OrderRepository`](order::OrderRepository) - Order ledger and lines
//! - [`PreBillRepository`](prebill::PreBillRepository) - Prefacturas
//! - [`GroupRepository`](group::GroupRepository) - Table groups and membership

pub mod group;
pub mod order;
pub mod prebill;
pub mod table;
