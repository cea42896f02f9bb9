//! # Options Cockpit
//!
//! Trade lifecycle tracking and risk escalation for single-leg option trades.
//!
//! ## Architecture
//!
//! - `config`: Configuration management and validation
//! - `market`: Market data provider seam, mock provider and paper feed
//! - `analysis`: Greeks validation, IV history and gating, order-flow analysis
//! - `trade`: Trade model, repository seam and the lifecycle store
//! - `escalation`: Rule-based alert generation with cooldowns
//! - `automation`: Rule-triggered position adjustments behind approval
//! - `monitor`: Fixed-interval monitoring loop
//! - `notify`: Alert delivery channels
//! - `persistence`: SQLite trade repository
//! - `utils`: Shared utilities and decimal arithmetic

pub mod analysis;
pub mod automation;
pub mod config;
pub mod escalation;
pub mod market;
pub mod monitor;
pub mod notify;
pub mod persistence;
pub mod trade;
pub mod utils;

pub use config::Config;
