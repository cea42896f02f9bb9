//! Trade lifecycle tracking.
//!
//! - `types`: trades, lifecycle states, audit updates and patches
//! - `repository`: the remote `TradeRepository` seam and an in-memory implementation
//! - `events`: change notifications published by the store
//! - `store`: `TradeLifecycleStore`, the local mirror and state machine

mod events;
mod repository;
mod store;
mod types;

pub use events::StoreEvent;
pub use repository::{InMemoryTradeRepository, TradeRepository};
#[cfg(test)]
pub use repository::MockTradeRepository;
pub use store::{ReconcileOutcome, ReconcileSummary, StoreError, TradeLifecycleStore, TradeLists};
pub use types::{
    next_trade_id, Trade, TradeList, TradePatch, TradeState, TradeUpdate, TradeUpdateKind,
};
