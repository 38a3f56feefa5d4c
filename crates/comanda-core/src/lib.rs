//! # comanda-core: Pure Business Logic for the Table Session Engine
//!
//! This crate holds the domain model of a restaurant floor: tables, the
//! order ledger, prefacturas and table groups, plus the one computation
//! everything else depends on, the session accumulator.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     Table Session Engine                                │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                 Callers (API layer, POS terminals)              │   │
//! │  │      open ──► add_order ──► prebill ──► settle / liberate      │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │            comanda-session (transactions, events)               │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ comanda-core (THIS CRATE) ★                     │   │
//! │  │                                                                 │   │
//! │  │  ┌──────────┐ ┌──────────┐ ┌─────────────┐ ┌──────────────┐    │   │
//! │  │  │  types   │ │  money   │ │ accumulator │ │  validation  │    │   │
//! │  │  │  Table   │ │  Money   │ │ SessionTot. │ │    rules     │    │   │
//! │  │  │  Order   │ └──────────┘ └─────────────┘ └──────────────┘    │   │
//! │  │  └──────────┘ ┌──────────┐ ┌─────────────┐                     │   │
//! │  │               │  events  │ │   catalog   │                     │   │
//! │  │               └──────────┘ └─────────────┘                     │   │
//! │  │                                                                 │   │
//! │  │   NO DATABASE • NO NETWORK • PURE FUNCTIONS                    │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │              comanda-db (SQLite, migrations, repos)             │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Domain types (Table, Order, PreBill, Group, ...)
//! - [`money`] - Integer money
//! - [`accumulator`] - Session totals derived from the ledger
//! - [`events`] - Table events and the notification sink seam
//! - [`catalog`] - Price lookup seam
//! - [`error`] - Domain error types
//! - [`validation`] - Boundary validation
//!
//! ## Example Usage
//!
//! ```rust
//! use comanda_core::accumulator::accumulate;
//!
//! // A free table has no session key; the accumulator says so explicitly.
//! let result = accumulate("table-1", None, &[]);
//! assert!(result.is_err());
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod accumulator;
pub mod catalog;
pub mod error;
pub mod events;
pub mod money;
pub mod types;
pub mod validation;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use accumulator::{accumulate, ProductSubtotal, SessionTotals};
pub use catalog::{CatalogEntry, PriceCatalog, StaticCatalog};
pub use error::{CoreError, ValidationError};
pub use events::{
    ChannelSink, EventProduct, MemorySink, NotificationSink, SinkError, TableEvent, TracingSink,
};
pub use money::Money;
pub use types::*;

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Maximum lines in a single order.
pub const MAX_ORDER_LINES: usize = 100;

/// Maximum quantity on a single line.
///
/// ## Business Reason
/// Catches a waiter typing 100 instead of 10.
pub const MAX_ITEM_QUANTITY: i64 = 999;

/// Maximum length of line notes and rejection reasons.
pub const MAX_NOTES_LEN: usize = 200;

/// A group bills at least this many tables together.
pub const MIN_GROUP_TABLES: usize = 2;
