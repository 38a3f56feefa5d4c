//! # Domain Types
//!
//! Core domain types for the table session engine.
//!
//! ## Type Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Domain Types                                    │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │     Table       │   │     Order       │   │   OrderLine     │       │
//! │  │  ─────────────  │   │  ─────────────  │   │  ─────────────  │       │
//! │  │  id (UUID)      │◄──│  table_id       │◄──│  order_id       │       │
//! │  │  number         │   │  number snapshot│   │  unit_price     │       │
//! │  │  state          │   │  status         │   │  subtotal       │       │
//! │  │  session_start  │   │  payment_state  │   └─────────────────┘       │
//! │  │  group_ref ─────┼─┐ └─────────────────┘                             │
//! │  └─────────────────┘ │                                                  │
//! │                      │ ┌─────────────────┐   ┌─────────────────┐       │
//! │                      └►│     Group       │   │    PreBill      │       │
//! │                        │  state, members │   │  Open / Closed  │       │
//! │                        └─────────────────┘   └─────────────────┘       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Ownership
//! References only point one way. A table holds the id of its latest order
//! and of its group; an order holds a *snapshot* of the table number, never a
//! live back-reference. Group membership is an index table, not a list on the
//! group row.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::error::{CoreError, CoreResult};
use crate::money::Money;

// =============================================================================
// Actor
// =============================================================================

/// Role of the authenticated user performing an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Manager,
    Cashier,
    Waiter,
}

impl Role {
    /// Whether this role may take money or close a table.
    pub fn can_settle(&self) -> bool {
        matches!(self, Role::Admin | Role::Manager | Role::Cashier)
    }
}

/// The opaque caller identity handed to every operation.
///
/// Tenant resolution happens outside this crate; the engine only trusts
/// `restaurant_id` and `branch_id` for row scoping.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Actor {
    pub user_id: String,
    pub restaurant_id: String,
    pub branch_id: String,
    pub role: Role,
}

impl Actor {
    pub fn new(
        user_id: impl Into<String>,
        restaurant_id: impl Into<String>,
        branch_id: impl Into<String>,
        role: Role,
    ) -> Self {
        Actor {
            user_id: user_id.into(),
            restaurant_id: restaurant_id.into(),
            branch_id: branch_id.into(),
            role,
        }
    }
}

// =============================================================================
// Table
// =============================================================================

/// Lifecycle state of a physical table.
///
/// ```text
///            open / add_order
///   Free ─────────────────────► Occupied ──┐ add_order
///    ▲                             │   ◄───┘
///    │          request_bill       ▼
///    ├──────────────────────── PendingPayment
///    │   settle / liberate
///    │
///    └── Reserved / Maintenance (administrative holds)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum TableState {
    Free,
    Occupied,
    PendingPayment,
    Reserved,
    Maintenance,
}

impl TableState {
    /// States in which a session is running and money may be owed.
    pub fn has_session(&self) -> bool {
        matches!(self, TableState::Occupied | TableState::PendingPayment)
    }

    /// States that accept new orders (a free table is opened implicitly).
    pub fn accepts_orders(&self) -> bool {
        matches!(self, TableState::Free | TableState::Occupied)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TableState::Free => "free",
            TableState::Occupied => "occupied",
            TableState::PendingPayment => "pending_payment",
            TableState::Reserved => "reserved",
            TableState::Maintenance => "maintenance",
        }
    }
}

impl Default for TableState {
    fn default() -> Self {
        TableState::Free
    }
}

impl std::fmt::Display for TableState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A physical seating unit in the Table Registry.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[ts(export)]
pub struct Table {
    /// Unique identifier (UUID v4).
    pub id: String,

    /// Business number, unique within the branch.
    pub number: i64,

    pub capacity: i64,
    pub branch_id: String,
    pub restaurant_id: String,
    pub state: TableState,

    /// Start of the current occupancy. `None` while the table is free.
    #[ts(as = "Option<String>")]
    pub session_start: Option<DateTime<Utc>>,

    /// Denormalized running total. Good for polling, never for billing.
    pub cached_running_total: Money,

    /// Id of the most recent order placed at this table (informational).
    pub current_order_ref: Option<String>,

    /// Active group this table is billed under, if any.
    pub group_ref: Option<String>,

    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,

    #[ts(as = "String")]
    pub updated_at: DateTime<Utc>,
}

impl Table {
    /// Starts a new occupancy at `now`.
    pub fn open_session(&mut self, now: DateTime<Utc>) {
        self.state = TableState::Occupied;
        self.session_start = Some(now);
        self.cached_running_total = Money::zero();
        self.current_order_ref = None;
        self.updated_at = now;
    }

    /// Ends the occupancy and resets every session field.
    pub fn reset_to_free(&mut self, now: DateTime<Utc>) {
        self.state = TableState::Free;
        self.session_start = None;
        self.cached_running_total = Money::zero();
        self.current_order_ref = None;
        self.updated_at = now;
    }

    /// The key the ledger is filtered by for this table's current session.
    pub fn session_key(&self) -> Option<SessionKey> {
        self.session_start.map(|since| SessionKey {
            table_number: self.number,
            branch_id: self.branch_id.clone(),
            restaurant_id: self.restaurant_id.clone(),
            since,
        })
    }
}

/// Identifies one session in the ledger: a table number within a branch,
/// from a start timestamp onwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionKey {
    pub table_number: i64,
    pub branch_id: String,
    pub restaurant_id: String,
    pub since: DateTime<Utc>,
}

// =============================================================================
// Order
// =============================================================================

/// Kitchen / service status of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Received,
    InPreparation,
    ReadyToServe,
    Delivered,
    Cancelled,
    PendingApproval,
    Rejected,
}

impl OrderStatus {
    /// Statuses that appear in the session view (cancelled included, for audit).
    pub fn in_session_view(&self) -> bool {
        !matches!(self, OrderStatus::PendingApproval | OrderStatus::Rejected)
    }

    /// Statuses whose lines count toward the amount owed.
    pub fn is_billable(&self) -> bool {
        self.in_session_view() && *self != OrderStatus::Cancelled
    }

    pub fn is_final(&self) -> bool {
        matches!(
            self,
            OrderStatus::Delivered | OrderStatus::Cancelled | OrderStatus::Rejected
        )
    }

    /// Legal status transitions.
    ///
    /// ```text
    /// PendingApproval ──► Received ──► InPreparation ──► ReadyToServe ──► Delivered
    ///        │               │               │                 │
    ///        ▼               └───────────────┴─────────────────┴──► Cancelled
    ///     Rejected
    /// ```
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        match (self, next) {
            (PendingApproval, Received) | (PendingApproval, Rejected) => true,
            (Received, InPreparation) | (Received, ReadyToServe) | (Received, Delivered) => true,
            (InPreparation, ReadyToServe) | (InPreparation, Delivered) => true,
            (ReadyToServe, Delivered) => true,
            (Received, Cancelled) | (InPreparation, Cancelled) | (ReadyToServe, Cancelled) => {
                true
            }
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Received => "received",
            OrderStatus::InPreparation => "in_preparation",
            OrderStatus::ReadyToServe => "ready_to_serve",
            OrderStatus::Delivered => "delivered",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::PendingApproval => "pending_approval",
            OrderStatus::Rejected => "rejected",
        }
    }
}

impl Default for OrderStatus {
    fn default() -> Self {
        OrderStatus::Received
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum ServiceType {
    Table,
    TakeAway,
    Delivery,
}

/// When the customer pays for an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum PaymentTiming {
    /// Paid when the table settles.
    Immediate,
    /// Runs on a tab; must be resolved explicitly at settle time.
    Deferred,
}

impl Default for PaymentTiming {
    fn default() -> Self {
        PaymentTiming::Immediate
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum PaymentState {
    Paid,
    Pending,
}

/// One checkout event in the ledger ("venta").
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[ts(export)]
pub struct Order {
    pub id: String,

    /// Table the order is directed at; `None` for take-away and delivery.
    pub table_id: Option<String>,

    /// Table number frozen at creation. Session queries match on this,
    /// so renumbering a table never rewrites history.
    pub table_number_snapshot: Option<i64>,

    pub branch_id: String,
    pub restaurant_id: String,
    pub server_actor_id: String,
    pub payment_method_id: Option<String>,
    pub service_type: ServiceType,
    pub status: OrderStatus,
    pub payment_timing: PaymentTiming,
    pub payment_state: PaymentState,

    /// Sum of the line subtotals currently attached to this order.
    pub total: Money,

    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,

    /// Set when the whole order is relocated to another table.
    #[ts(as = "Option<String>")]
    pub moved_at: Option<DateTime<Utc>>,

    pub rejection_reason: Option<String>,
}

impl Order {
    /// Timestamp the session boundary is compared against.
    ///
    /// A relocated order belongs to the destination session from the moment
    /// it was moved; `created_at` itself is never rewritten.
    pub fn ledger_at(&self) -> DateTime<Utc> {
        self.moved_at.unwrap_or(self.created_at)
    }

    /// Moves the order to `next`, returning the previous status.
    pub fn transition_to(&mut self, next: OrderStatus) -> CoreResult<OrderStatus> {
        if !self.status.can_transition_to(next) {
            return Err(CoreError::InvalidStatusTransition {
                order_id: self.id.clone(),
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        let previous = self.status;
        self.status = next;
        Ok(previous)
    }

    /// Rejects the one shape of order that must never enter or leave the ledger:
    /// a table-service order with no table number snapshot.
    pub fn check_integrity(&self) -> CoreResult<()> {
        if self.service_type == ServiceType::Table && self.table_number_snapshot.is_none() {
            return Err(CoreError::CorruptOrderRecord {
                order_id: self.id.clone(),
                reason: "table-service order without a table number snapshot".to_string(),
            });
        }
        Ok(())
    }
}

/// One product line within an order.
/// Uses the snapshot pattern: name and price are frozen at order time.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[ts(export)]
pub struct OrderLine {
    pub id: String,
    pub order_id: String,
    pub product_id: String,
    /// Product name at time of order (frozen).
    pub product_name: String,
    pub quantity: i64,
    /// Unit price at time of order (frozen).
    pub unit_price: Money,
    /// `unit_price × quantity`.
    pub subtotal: Money,
    pub notes: Option<String>,
    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,
}

/// An order together with its lines, as returned by ledger queries.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct LedgerOrder {
    pub order: Order,
    pub lines: Vec<OrderLine>,
}

impl LedgerOrder {
    pub fn line_total(&self) -> Money {
        self.lines.iter().map(|l| l.subtotal).sum()
    }
}

// =============================================================================
// PreBill
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum PreBillState {
    Open,
    Closed,
}

/// Open/closed marker bracketing a table session ("prefactura").
///
/// Never financial truth while open; `closed_total` is frozen on close.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[ts(export)]
pub struct PreBill {
    pub id: String,
    pub table_id: String,
    pub restaurant_id: String,
    pub opening_order_ref: Option<String>,
    pub state: PreBillState,

    /// `None` while the prebill waits for the next occupancy.
    #[ts(as = "Option<String>")]
    pub session_start: Option<DateTime<Utc>>,

    pub closed_total: Option<Money>,

    #[ts(as = "String")]
    pub opened_at: DateTime<Utc>,

    #[ts(as = "Option<String>")]
    pub closed_at: Option<DateTime<Utc>>,
}

// =============================================================================
// Group
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum GroupState {
    Active,
    Closed,
}

/// Two or more tables billed as one. Members live in a separate index.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[ts(export)]
pub struct Group {
    pub id: String,
    pub restaurant_id: String,
    pub branch_id: String,
    pub responsible_server_id: String,
    pub state: GroupState,
    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,
    #[ts(as = "Option<String>")]
    pub closed_at: Option<DateTime<Utc>>,
}

// =============================================================================
// Requests
// =============================================================================

/// One line of an AddOrder request. Price and name come from the catalog.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct NewOrderLine {
    pub product_id: String,
    pub quantity: i64,
    #[serde(default)]
    pub notes: Option<String>,
}

impl NewOrderLine {
    pub fn new(product_id: impl Into<String>, quantity: i64) -> Self {
        NewOrderLine {
            product_id: product_id.into(),
            quantity,
            notes: None,
        }
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn table_order(snapshot: Option<i64>) -> Order {
        Order {
            id: "o-1".to_string(),
            table_id: Some("t-1".to_string()),
            table_number_snapshot: snapshot,
            branch_id: "b".to_string(),
            restaurant_id: "r".to_string(),
            server_actor_id: "u".to_string(),
            payment_method_id: None,
            service_type: ServiceType::Table,
            status: OrderStatus::Received,
            payment_timing: PaymentTiming::Immediate,
            payment_state: PaymentState::Pending,
            total: Money::zero(),
            created_at: Utc::now(),
            moved_at: None,
            rejection_reason: None,
        }
    }

    #[test]
    fn test_table_order_without_snapshot_is_corrupt() {
        let err = table_order(None).check_integrity().unwrap_err();
        assert!(matches!(err, CoreError::CorruptOrderRecord { .. }));
        assert!(table_order(Some(5)).check_integrity().is_ok());
    }

    #[test]
    fn test_take_away_order_needs_no_snapshot() {
        let mut order = table_order(None);
        order.table_id = None;
        order.service_type = ServiceType::TakeAway;
        assert!(order.check_integrity().is_ok());
    }

    #[test]
    fn test_ledger_at_prefers_moved_at() {
        let mut order = table_order(Some(1));
        assert_eq!(order.ledger_at(), order.created_at);
        let later = order.created_at + chrono::Duration::minutes(5);
        order.moved_at = Some(later);
        assert_eq!(order.ledger_at(), later);
    }

    #[test]
    fn test_status_transitions() {
        use OrderStatus::*;
        assert!(Received.can_transition_to(InPreparation));
        assert!(ReadyToServe.can_transition_to(Cancelled));
        assert!(PendingApproval.can_transition_to(Rejected));
        assert!(!Delivered.can_transition_to(Cancelled));
        assert!(!Cancelled.can_transition_to(Received));
        assert!(!PendingApproval.can_transition_to(Cancelled));
    }

    #[test]
    fn test_transition_to() {
        let mut order = table_order(Some(1));
        let previous = order.transition_to(OrderStatus::InPreparation).unwrap();
        assert_eq!(previous, OrderStatus::Received);
        assert_eq!(order.status, OrderStatus::InPreparation);

        order.transition_to(OrderStatus::Delivered).unwrap();
        let err = order.transition_to(OrderStatus::Cancelled).unwrap_err();
        assert!(matches!(err, CoreError::InvalidStatusTransition { .. }));
        assert_eq!(order.status, OrderStatus::Delivered);
    }

    #[test]
    fn test_billable_statuses() {
        assert!(OrderStatus::Delivered.is_billable());
        assert!(!OrderStatus::Cancelled.is_billable());
        assert!(OrderStatus::Cancelled.in_session_view());
        assert!(!OrderStatus::PendingApproval.in_session_view());
        assert!(!OrderStatus::Rejected.in_session_view());
    }

    #[test]
    fn test_table_session_lifecycle() {
        let now = Utc::now();
        let mut table = Table {
            id: "t-1".to_string(),
            number: 5,
            capacity: 4,
            branch_id: "b".to_string(),
            restaurant_id: "r".to_string(),
            state: TableState::Free,
            session_start: None,
            cached_running_total: Money::from_cents(999),
            current_order_ref: Some("stale".to_string()),
            group_ref: None,
            created_at: now,
            updated_at: now,
        };
        assert!(table.session_key().is_none());

        table.open_session(now);
        assert_eq!(table.state, TableState::Occupied);
        assert!(table.cached_running_total.is_zero());
        let key = table.session_key().unwrap();
        assert_eq!(key.table_number, 5);
        assert_eq!(key.since, now);

        table.reset_to_free(now);
        assert_eq!(table.state, TableState::Free);
        assert!(table.session_start.is_none());
    }

    #[test]
    fn test_state_serializes_snake_case() {
        let json = serde_json::to_string(&TableState::PendingPayment).unwrap();
        assert_eq!(json, "\"pending_payment\"");
    }
}
