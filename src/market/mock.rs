//! In-memory market data provider for paper trading and tests.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

use super::traits::MarketDataProvider;
use super::types::{Bar, OptionContract, OptionSnapshot, Quote, RawGreeks};

#[derive(Debug, Default)]
struct MockMarketState {
    bars: HashMap<String, Vec<Bar>>,
    quotes: HashMap<String, Quote>,
    /// Keyed by OCC symbol
    snapshots: HashMap<String, OptionSnapshot>,
    daily_closes: HashMap<(String, NaiveDate), Decimal>,
    confluence: HashMap<String, f64>,
    earnings: HashMap<String, u32>,
    failing: HashSet<String>,
    latency: HashMap<String, Duration>,
}

/// Mock provider whose data is pushed in by the caller.
#[derive(Clone, Default)]
pub struct MockMarketData {
    state: Arc<RwLock<MockMarketState>>,
}

impl MockMarketData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the bar history for a symbol.
    pub async fn set_bars(&self, symbol: &str, bars: Vec<Bar>) {
        self.state.write().await.bars.insert(symbol.to_string(), bars);
    }

    /// Append one bar to a symbol's history.
    pub async fn push_bar(&self, symbol: &str, bar: Bar) {
        self.state
            .write()
            .await
            .bars
            .entry(symbol.to_string())
            .or_default()
            .push(bar);
    }

    pub async fn set_quote(&self, quote: Quote) {
        self.state.write().await.quotes.insert(quote.symbol.clone(), quote);
    }

    /// Set the option price and Greeks for a contract.
    pub async fn set_option_snapshot(
        &self,
        contract: &OptionContract,
        option_price: Decimal,
        underlying_price: Decimal,
        greeks: RawGreeks,
    ) {
        let snapshot = OptionSnapshot {
            contract: contract.clone(),
            option_price,
            underlying_price,
            greeks,
            timestamp: Utc::now(),
        };
        self.state
            .write()
            .await
            .snapshots
            .insert(contract.occ_symbol(), snapshot);
    }

    /// Update just the option price of an existing snapshot.
    pub async fn set_option_price(&self, contract: &OptionContract, option_price: Decimal) {
        if let Some(snapshot) = self.state.write().await.snapshots.get_mut(&contract.occ_symbol()) {
            snapshot.option_price = option_price;
            snapshot.timestamp = Utc::now();
        }
    }

    pub async fn set_daily_close(&self, symbol: &str, date: NaiveDate, close: Decimal) {
        self.state
            .write()
            .await
            .daily_closes
            .insert((symbol.to_string(), date), close);
    }

    pub async fn set_confluence(&self, symbol: &str, score: f64) {
        self.state.write().await.confluence.insert(symbol.to_string(), score);
    }

    pub async fn set_days_to_earnings(&self, symbol: &str, days: u32) {
        self.state.write().await.earnings.insert(symbol.to_string(), days);
    }

    /// Make every request for `symbol` fail until cleared.
    pub async fn fail_symbol(&self, symbol: &str) {
        self.state.write().await.failing.insert(symbol.to_string());
    }

    pub async fn clear_failure(&self, symbol: &str) {
        self.state.write().await.failing.remove(symbol);
    }

    /// Delay every request for `symbol` by `latency`.
    pub async fn set_latency(&self, symbol: &str, latency: Duration) {
        self.state.write().await.latency.insert(symbol.to_string(), latency);
    }

    async fn simulate(&self, symbol: &str) -> Result<()> {
        let (failing, latency) = {
            let state = self.state.read().await;
            (state.failing.contains(symbol), state.latency.get(symbol).copied())
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if failing {
            return Err(anyhow!("simulated market data failure for {}", symbol));
        }
        Ok(())
    }
}

#[async_trait]
impl MarketDataProvider for MockMarketData {
    async fn get_bars(&self, symbol: &str, _timeframe: &str, limit: usize) -> Result<Vec<Bar>> {
        self.simulate(symbol).await?;
        let state = self.state.read().await;
        let bars = state.bars.get(symbol).cloned().unwrap_or_default();
        let skip = bars.len().saturating_sub(limit);
        Ok(bars.into_iter().skip(skip).collect())
    }

    async fn get_quote(&self, symbol: &str) -> Result<Quote> {
        self.simulate(symbol).await?;
        self.state
            .read()
            .await
            .quotes
            .get(symbol)
            .cloned()
            .ok_or_else(|| anyhow!("no quote for {}", symbol))
    }

    async fn get_option_snapshot(&self, contract: &OptionContract) -> Result<OptionSnapshot> {
        self.simulate(&contract.underlying).await?;
        let occ = contract.occ_symbol();
        let snapshot = self.state.read().await.snapshots.get(&occ).cloned();
        debug!(contract = %occ, found = snapshot.is_some(), "Mock option snapshot lookup");
        snapshot.ok_or_else(|| anyhow!("no option snapshot for {}", occ))
    }

    async fn get_daily_close(&self, symbol: &str, date: NaiveDate) -> Result<Option<Decimal>> {
        self.simulate(symbol).await?;
        Ok(self
            .state
            .read()
            .await
            .daily_closes
            .get(&(symbol.to_string(), date))
            .copied())
    }

    async fn get_confluence(&self, symbol: &str) -> Result<Option<f64>> {
        Ok(self.state.read().await.confluence.get(symbol).copied())
    }

    async fn days_to_earnings(&self, symbol: &str) -> Result<Option<u32>> {
        Ok(self.state.read().await.earnings.get(symbol).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::OptionType;
    use rust_decimal_macros::dec;

    fn bar(close: f64) -> Bar {
        Bar {
            timestamp: Utc::now(),
            open: close,
            high: close,
            low: close,
            close,
            volume: 1000.0,
        }
    }

    #[tokio::test]
    async fn test_bars_are_limited_to_most_recent() {
        let market = MockMarketData::new();
        market.set_bars("SPY", vec![bar(1.0), bar(2.0), bar(3.0)]).await;

        let bars = market.get_bars("SPY", "5m", 2).await.unwrap();
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].close, 2.0);
        assert_eq!(bars[1].close, 3.0);
    }

    #[tokio::test]
    async fn test_snapshot_lookup_and_failure() {
        let market = MockMarketData::new();
        let contract = OptionContract::new(
            "SPY",
            dec!(450),
            NaiveDate::from_ymd_opt(2030, 1, 18).unwrap(),
            OptionType::Call,
        );
        market
            .set_option_snapshot(&contract, dec!(3.2), dec!(451), RawGreeks::default())
            .await;

        let snapshot = market.get_option_snapshot(&contract).await.unwrap();
        assert_eq!(snapshot.option_price, dec!(3.2));

        market.fail_symbol("SPY").await;
        assert!(market.get_option_snapshot(&contract).await.is_err());
    }
}
