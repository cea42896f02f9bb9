//! Market data provider seam.
//!
//! Quote/bar transport lives outside this crate. Anything that can supply
//! bars, quotes and options-chain snapshots can drive the monitor.

use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;

use super::types::{Bar, OptionContract, OptionSnapshot, Quote};

/// Source of market context for monitored trades.
#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    /// Most recent `limit` bars for a symbol, oldest first.
    async fn get_bars(&self, symbol: &str, timeframe: &str, limit: usize) -> anyhow::Result<Vec<Bar>>;

    /// Latest quote for a symbol.
    async fn get_quote(&self, symbol: &str) -> anyhow::Result<Quote>;

    /// Options-chain snapshot (price, raw Greeks, IV) for one contract.
    async fn get_option_snapshot(&self, contract: &OptionContract) -> anyhow::Result<OptionSnapshot>;

    /// Underlying close on a given session date, if one can be resolved.
    async fn get_daily_close(&self, symbol: &str, date: NaiveDate) -> anyhow::Result<Option<Decimal>>;

    /// Aggregate 0-100 confluence score for a symbol.
    async fn get_confluence(&self, _symbol: &str) -> anyhow::Result<Option<f64>> {
        Ok(None)
    }

    /// Calendar days until the next earnings report.
    async fn days_to_earnings(&self, _symbol: &str) -> anyhow::Result<Option<u32>> {
        Ok(None)
    }
}
