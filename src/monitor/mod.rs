//! Fixed-interval monitoring of entered trades.
//!
//! - `orchestrator`: `MonitoringOrchestrator`, the tick loop and store-event follower

mod orchestrator;

pub use orchestrator::{MonitorStats, MonitoringOrchestrator, TickReport, TradeEvaluation};
