//! # Engine Error Type
//!
//! Every operation of the engine returns `SessionResult<T>`.
//!
//! ## Error Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  operation(actor, ...)                                                  │
//! │         │                                                               │
//! │         ├── boundary validation ──── ValidationError ───┐              │
//! │         │                                                │              │
//! │         ├── precondition check ──── TableNotAvailable,  │              │
//! │         │   (before any write)       SameTableTransfer, ├─► SessionError│
//! │         │                            ...                 │              │
//! │         ├── accumulator ──────────── CoreError ─────────┤              │
//! │         │                                                │              │
//! │         └── sqlx / commit / timeout ─ DbError ──────────┘              │
//! │                                        (TransactionFailed, rolled back) │
//! │                                                                         │
//! │  SessionError::code() ──► ErrorCode ("TABLE_NOT_AVAILABLE", ...)        │
//! │  SessionError::body() ──► { "code": ..., "message": ... }               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Precondition failures carry the ids and states a UI needs to render an
//! actionable message. The engine itself renders nothing.

use serde::Serialize;
use thiserror::Error;
use ts_rs::TS;

use comanda_core::{CoreError, Money, Role, TableState, ValidationError};
use comanda_db::DbError;

/// A deferred order that still needs a payment method.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, TS)]
#[ts(export)]
pub struct PendingOrder {
    pub order_id: String,
    pub total: Money,
}

/// Errors returned by engine operations.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Table not found: {table_id}")]
    TableNotFound { table_id: String },

    #[error("Cannot {attempted} table {table_id}: table is {current}")]
    TableNotAvailable {
        table_id: String,
        attempted: &'static str,
        current: TableState,
    },

    #[error("Table {table_id} has {} deferred order(s) awaiting a payment method", pending.len())]
    DeferredPaymentsOutstanding {
        table_id: String,
        pending: Vec<PendingOrder>,
    },

    #[error("Order {order_id} is not a pending deferred order of table {table_id}")]
    UnknownSettlementOrder { table_id: String, order_id: String },

    #[error("Already in an active group: {}", table_ids.join(", "))]
    TableAlreadyGrouped { table_ids: Vec<String> },

    #[error("Table {table_id} is not a member of group {group_id}")]
    NotGroupMember { group_id: String, table_id: String },

    #[error("Group not found: {group_id}")]
    GroupNotFound { group_id: String },

    #[error("Group {group_id} is closed")]
    GroupClosed { group_id: String },

    #[error("Source and destination are the same table: {table_id}")]
    SameTableTransfer { table_id: String },

    #[error("Order line not found: {line_id}")]
    LineNotFound { line_id: String },

    #[error("Order not found: {order_id}")]
    OrderNotFound { order_id: String },

    #[error("Destination table {table_id} is {current}")]
    DestinationTableUnavailable {
        table_id: String,
        current: TableState,
    },

    #[error("Order {order_id} cannot be transferred: {reason}")]
    OrderNotTransferable { order_id: String, reason: String },

    #[error("Order {order_id} cannot go from {from} to {to}")]
    InvalidStatusTransition {
        order_id: String,
        from: String,
        to: String,
    },

    #[error("Table {table_id} has no active session")]
    NoActiveSession { table_id: String },

    #[error("Corrupt order record {order_id}: {reason}")]
    CorruptOrderRecord { order_id: String, reason: String },

    #[error("Product not found: {product_id}")]
    ProductNotFound { product_id: String },

    #[error("Role {role:?} may not {action}")]
    Forbidden { action: &'static str, role: Role },

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Transaction failed: {source}")]
    TransactionFailed {
        #[source]
        source: DbError,
    },
}

/// Result alias for engine operations.
pub type SessionResult<T> = Result<T, SessionError>;

/// Stable, machine-readable error codes.
///
/// ```typescript
/// switch (e.code) {
///   case 'DEFERRED_PAYMENTS_OUTSTANDING':
///     askForPaymentMethods(e);
///     break;
///   case 'TABLE_NOT_AVAILABLE':
///     refreshFloor();
///     break;
/// }
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, TS)]
#[ts(export)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    TableNotFound,
    TableNotAvailable,
    DeferredPaymentsOutstanding,
    UnknownSettlementOrder,
    TableAlreadyGrouped,
    NotGroupMember,
    GroupNotFound,
    GroupClosed,
    SameTableTransfer,
    LineNotFound,
    OrderNotFound,
    DestinationTableUnavailable,
    OrderNotTransferable,
    InvalidStatusTransition,
    NoActiveSession,
    CorruptOrderRecord,
    ProductNotFound,
    Forbidden,
    ValidationError,
    TransactionFailed,
}

/// What a UI layer receives when an operation fails.
#[derive(Debug, Clone, Serialize, TS)]
#[ts(export)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
}

impl SessionError {
    pub fn code(&self) -> ErrorCode {
        match self {
            SessionError::TableNotFound { .. } => ErrorCode::TableNotFound,
            SessionError::TableNotAvailable { .. } => ErrorCode::TableNotAvailable,
            SessionError::DeferredPaymentsOutstanding { .. } => {
                ErrorCode::DeferredPaymentsOutstanding
            }
            SessionError::UnknownSettlementOrder { .. } => ErrorCode::UnknownSettlementOrder,
            SessionError::TableAlreadyGrouped { .. } => ErrorCode::TableAlreadyGrouped,
            SessionError::NotGroupMember { .. } => ErrorCode::NotGroupMember,
            SessionError::GroupNotFound { .. } => ErrorCode::GroupNotFound,
            SessionError::GroupClosed { .. } => ErrorCode::GroupClosed,
            SessionError::SameTableTransfer { .. } => ErrorCode::SameTableTransfer,
            SessionError::LineNotFound { .. } => ErrorCode::LineNotFound,
            SessionError::OrderNotFound { .. } => ErrorCode::OrderNotFound,
            SessionError::DestinationTableUnavailable { .. } => {
                ErrorCode::DestinationTableUnavailable
            }
            SessionError::OrderNotTransferable { .. } => ErrorCode::OrderNotTransferable,
            SessionError::InvalidStatusTransition { .. } => ErrorCode::InvalidStatusTransition,
            SessionError::NoActiveSession { .. } => ErrorCode::NoActiveSession,
            SessionError::CorruptOrderRecord { .. } => ErrorCode::CorruptOrderRecord,
            SessionError::ProductNotFound { .. } => ErrorCode::ProductNotFound,
            SessionError::Forbidden { .. } => ErrorCode::Forbidden,
            SessionError::Validation(_) => ErrorCode::ValidationError,
            SessionError::TransactionFailed { .. } => ErrorCode::TransactionFailed,
        }
    }

    /// Serializable form for the API layer.
    ///
    /// Transaction failures are logged here and reported with a generic
    /// message; the underlying cause stays in the logs.
    pub fn body(&self) -> ErrorBody {
        let message = match self {
            SessionError::TransactionFailed { source } => {
                tracing::error!(error = %source, "Transaction failed");
                "Database transaction failed".to_string()
            }
            other => other.to_string(),
        };
        ErrorBody {
            code: self.code(),
            message,
        }
    }

    pub(crate) fn table_not_found(table_id: &str) -> Self {
        SessionError::TableNotFound {
            table_id: table_id.to_string(),
        }
    }

    pub(crate) fn order_not_found(order_id: &str) -> Self {
        SessionError::OrderNotFound {
            order_id: order_id.to_string(),
        }
    }

    pub(crate) fn group_not_found(group_id: &str) -> Self {
        SessionError::GroupNotFound {
            group_id: group_id.to_string(),
        }
    }

    pub(crate) fn not_available(table_id: &str, attempted: &'static str, current: TableState) -> Self {
        SessionError::TableNotAvailable {
            table_id: table_id.to_string(),
            attempted,
            current,
        }
    }
}

/// Any storage failure inside an operation aborts its transaction.
impl From<DbError> for SessionError {
    fn from(source: DbError) -> Self {
        SessionError::TransactionFailed { source }
    }
}

impl From<sqlx::Error> for SessionError {
    fn from(err: sqlx::Error) -> Self {
        SessionError::TransactionFailed { source: err.into() }
    }
}

impl From<CoreError> for SessionError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::NoActiveSession { table_id } => SessionError::NoActiveSession { table_id },
            CoreError::CorruptOrderRecord { order_id, reason } => {
                SessionError::CorruptOrderRecord { order_id, reason }
            }
            CoreError::InvalidStatusTransition { order_id, from, to } => {
                SessionError::InvalidStatusTransition { order_id, from, to }
            }
            CoreError::ProductNotFound(product_id) => SessionError::ProductNotFound { product_id },
            CoreError::Validation(e) => SessionError::Validation(e),
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
