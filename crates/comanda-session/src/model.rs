//! Request and response types of the engine operations.
//!
//! Requests are validated at the boundary before any transaction opens.
//! Responses are plain data; timestamps export to TypeScript as strings.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use comanda_core::{
    Group, LedgerOrder, Money, NewOrderLine, Order, OrderLine, PaymentTiming, SessionTotals,
    Table, TableState,
};

use crate::config::SettlementMode;

// =============================================================================
// Table lifecycle
// =============================================================================

#[derive(Debug, Clone, Serialize, TS)]
#[ts(export)]
pub struct OpenOutcome {
    pub table: Table,
    /// The prefactura bracketing the new session.
    pub prebill_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct AddOrderRequest {
    pub lines: Vec<NewOrderLine>,
    #[serde(default)]
    pub payment_timing: PaymentTiming,
}

impl AddOrderRequest {
    pub fn new(lines: Vec<NewOrderLine>) -> Self {
        AddOrderRequest {
            lines,
            payment_timing: PaymentTiming::Immediate,
        }
    }

    /// Puts the order on the tab.
    pub fn deferred(mut self) -> Self {
        self.payment_timing = PaymentTiming::Deferred;
        self
    }
}

#[derive(Debug, Clone, Serialize, TS)]
#[ts(export)]
pub struct AddOrderOutcome {
    pub order: Order,
    pub lines: Vec<OrderLine>,
    /// Authoritative session total after this order.
    pub running_total: Money,
    /// The table was free and got opened by this order.
    pub opened: bool,
}

/// Authoritative running bill of one table.
#[derive(Debug, Clone, Serialize, TS)]
#[ts(export)]
pub struct PreBillView {
    pub table_id: String,
    pub table_number: i64,
    pub state: TableState,
    #[ts(as = "String")]
    pub session_start: DateTime<Utc>,
    pub prebill_id: Option<String>,
    /// Totals grouped by product.
    pub totals: SessionTotals,
    /// The raw ledger slice the totals were computed from.
    pub orders: Vec<LedgerOrder>,
    /// What the registry cache says, for comparison only.
    pub cached_total: Money,
}

/// Cached total for UI polling. Never use it to bill.
#[derive(Debug, Clone, Serialize, TS)]
#[ts(export)]
pub struct PeekTotal {
    pub table_id: String,
    pub table_number: i64,
    pub state: TableState,
    pub cached_running_total: Money,
    #[ts(as = "String")]
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, TS)]
#[ts(export)]
pub struct LiberateOutcome {
    pub table: Table,
    /// The table was already free; nothing changed.
    pub already_free: bool,
    pub closed_prebill_id: Option<String>,
}

// =============================================================================
// Settlement
// =============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct SettleRequest {
    /// Method used for every immediate order.
    pub payment_method_id: String,

    /// Overrides the configured settlement mode.
    #[serde(default)]
    pub mode: Option<SettlementMode>,

    /// Deferred order id -> payment method id.
    #[serde(default)]
    pub resolutions: HashMap<String, String>,
}

impl SettleRequest {
    pub fn new(payment_method_id: impl Into<String>) -> Self {
        SettleRequest {
            payment_method_id: payment_method_id.into(),
            ..Default::default()
        }
    }

    pub fn with_mode(mut self, mode: SettlementMode) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn resolve(mut self, order_id: impl Into<String>, payment_method_id: impl Into<String>) -> Self {
        self.resolutions
            .insert(order_id.into(), payment_method_id.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, TS)]
#[ts(export)]
pub struct SettleOutcome {
    pub table: Table,
    /// Frozen on the closed prefactura.
    pub total: Money,
    pub prebill_id: String,
    pub mode: SettlementMode,
    /// Orders marked paid by this settle.
    pub paid_order_ids: Vec<String>,
    /// Present in consolidated mode.
    pub settlement_order_id: Option<String>,
}

// =============================================================================
// Groups
// =============================================================================

#[derive(Debug, Clone, Serialize, TS)]
#[ts(export)]
pub struct GroupView {
    pub group: Group,
    pub table_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, TS)]
#[ts(export)]
pub struct MemberPreBill {
    pub table_id: String,
    pub table_number: i64,
    pub state: TableState,
    pub totals: SessionTotals,
}

/// Consolidated prefactura of a group.
#[derive(Debug, Clone, Serialize, TS)]
#[ts(export)]
pub struct GroupPreBillView {
    pub group_id: String,
    pub members: Vec<MemberPreBill>,
    pub combined: SessionTotals,
}

#[derive(Debug, Clone, Serialize, TS)]
#[ts(export)]
pub struct ActiveGroupSummary {
    pub group: Group,
    pub table_ids: Vec<String>,
    /// Sum of the members' cached totals.
    pub cached_total: Money,
}

// =============================================================================
// Transfers
// =============================================================================

#[derive(Debug, Clone, Serialize, TS)]
#[ts(export)]
pub struct TransferOutcome {
    pub source: Table,
    pub destination: Table,
    /// Order now holding the moved amount on the destination.
    pub order_id: String,
    pub amount: Money,
    pub destination_opened: bool,
}
