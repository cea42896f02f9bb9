//! Store change notifications.

use serde::Serialize;

use super::types::TradeState;

/// Emitted after a confirmed local change. Dropping the receiver unsubscribes.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum StoreEvent {
    TradeAdded {
        trade_id: String,
        state: TradeState,
    },
    TradeTransitioned {
        trade_id: String,
        from: TradeState,
        to: TradeState,
    },
    TradeUpdated {
        trade_id: String,
    },
    TradeRemoved {
        trade_id: String,
    },
    Reconciled {
        active: usize,
        history: usize,
        expired: usize,
    },
    FocusChanged {
        trade_id: Option<String>,
    },
}

impl StoreEvent {
    /// Trade the event concerns, if any.
    pub fn trade_id(&self) -> Option<&str> {
        match self {
            StoreEvent::TradeAdded { trade_id, .. }
            | StoreEvent::TradeTransitioned { trade_id, .. }
            | StoreEvent::TradeUpdated { trade_id }
            | StoreEvent::TradeRemoved { trade_id } => Some(trade_id),
            StoreEvent::FocusChanged { trade_id } => trade_id.as_deref(),
            StoreEvent::Reconciled { .. } => None,
        }
    }
}
