//! # Table Events
//!
//! Notifications published after a transaction commits.
//!
//! ## Delivery Model
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  engine operation                                                       │
//! │     │                                                                   │
//! │     ├── BEGIN ... COMMIT          (state is durable here)              │
//! │     │                                                                   │
//! │     └── sink.emit(event)          best effort, at most once            │
//! │            │                                                            │
//! │            ├── Ok                                                       │
//! │            └── Err(SinkError) ──► logged, never returned to caller     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Consumers (kitchen displays, floor plans) must tolerate gaps and re-read
//! state if they need certainty.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use ts_rs::TS;

use crate::types::{OrderStatus, TableState};

// =============================================================================
// Event Payloads
// =============================================================================

/// A product line as the kitchen sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct EventProduct {
    pub product_id: String,
    pub product_name: String,
    pub quantity: i64,
    pub notes: Option<String>,
}

/// Everything the engine announces.
///
/// Serialized with an internal `type` tag:
/// `{"type":"new_order","order_id":"...",...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TableEvent {
    /// An order entered the ledger.
    NewOrder {
        order_id: String,
        table_id: String,
        table_number: i64,
        restaurant_id: String,
        branch_id: String,
        status: OrderStatus,
        products: Vec<EventProduct>,
    },

    /// Kitchen workflow moved an order forward (or cancelled it).
    OrderStatusChanged {
        order_id: String,
        table_id: Option<String>,
        restaurant_id: String,
        branch_id: String,
        previous: OrderStatus,
        status: OrderStatus,
    },

    /// A table changed lifecycle state.
    TableStateChanged {
        table_id: String,
        table_number: i64,
        restaurant_id: String,
        branch_id: String,
        previous: TableState,
        state: TableState,
    },
}

impl TableEvent {
    /// Tenant the event belongs to; used for routing.
    pub fn restaurant_id(&self) -> &str {
        match self {
            TableEvent::NewOrder { restaurant_id, .. }
            | TableEvent::OrderStatusChanged { restaurant_id, .. }
            | TableEvent::TableStateChanged { restaurant_id, .. } => restaurant_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            TableEvent::NewOrder { .. } => "new_order",
            TableEvent::OrderStatusChanged { .. } => "order_status_changed",
            TableEvent::TableStateChanged { .. } => "table_state_changed",
        }
    }
}

// =============================================================================
// Sink Seam
// =============================================================================

#[derive(Debug, Error)]
pub enum SinkError {
    /// Nobody is listening.
    #[error("No subscribers for {0} event")]
    NoSubscribers(&'static str),

    /// Transport failure.
    #[error("Event delivery failed: {0}")]
    Delivery(String),
}

/// Where events go after commit.
pub trait NotificationSink: Send + Sync {
    fn emit(&self, event: &TableEvent) -> Result<(), SinkError>;
}

/// Logs each event as JSON. The default when no transport is wired up.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl NotificationSink for TracingSink {
    fn emit(&self, event: &TableEvent) -> Result<(), SinkError> {
        let payload =
            serde_json::to_string(event).map_err(|e| SinkError::Delivery(e.to_string()))?;
        tracing::info!(
            target: "comanda::events",
            kind = event.kind(),
            restaurant_id = event.restaurant_id(),
            %payload,
            "Table event"
        );
        Ok(())
    }
}

/// Fans events out to in-process subscribers (websocket hubs, displays).
#[derive(Debug, Clone)]
pub struct ChannelSink {
    sender: broadcast::Sender<TableEvent>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        ChannelSink { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TableEvent> {
        self.sender.subscribe()
    }
}

impl NotificationSink for ChannelSink {
    fn emit(&self, event: &TableEvent) -> Result<(), SinkError> {
        self.sender
            .send(event.clone())
            .map(|_| ())
            .map_err(|_| SinkError::NoSubscribers(event.kind()))
    }
}

/// Keeps every event in memory. Handy for embedding and for tests.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<TableEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything emitted so far.
    pub fn events(&self) -> Vec<TableEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl NotificationSink for MemorySink {
    fn emit(&self, event: &TableEvent) -> Result<(), SinkError> {
        let mut events = self
            .events
            .lock()
            .map_err(|e| SinkError::Delivery(e.to_string()))?;
        events.push(event.clone());
        Ok(())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
