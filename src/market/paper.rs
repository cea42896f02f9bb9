//! Deterministic simulated quotes for paper mode.
//!
//! Each underlying oscillates around the first strike seen for it. Option
//! prices are intrinsic value plus a time value that decays with days to expiry.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::f64::consts::PI;
use tracing::debug;

use super::mock::MockMarketData;
use super::types::{Bar, OptionContract, OptionType, RawGreeks};
use crate::utils::decimal::{from_f64_price, to_f64};

const DEFAULT_AMPLITUDE: f64 = 0.04;
const DEFAULT_PERIOD: u64 = 60;
const MIN_OPTION_PRICE: f64 = 0.05;

#[derive(Debug, Clone)]
struct Walk {
    base: f64,
    /// Phase offset so different underlyings do not move in lockstep
    phase: f64,
    last_close: f64,
}

/// Drives a `MockMarketData` with a sine-wave price walk.
pub struct PaperFeed {
    market: MockMarketData,
    walks: HashMap<String, Walk>,
    step: u64,
    amplitude: f64,
    period: u64,
}

impl PaperFeed {
    pub fn new(market: MockMarketData) -> Self {
        Self {
            market,
            walks: HashMap::new(),
            step: 0,
            amplitude: DEFAULT_AMPLITUDE,
            period: DEFAULT_PERIOD,
        }
    }

    /// Peak move as a fraction of the base price, and the cycle length in steps.
    pub fn with_wave(mut self, amplitude: f64, period: u64) -> Self {
        self.amplitude = amplitude.abs();
        self.period = period.max(2);
        self
    }

    pub fn step(&self) -> u64 {
        self.step
    }

    fn wave(&self, phase: f64) -> f64 {
        (2.0 * PI * self.step as f64 / self.period as f64 + phase).sin()
    }

    fn underlying_price(&self, walk: &Walk) -> f64 {
        walk.base * (1.0 + self.amplitude * self.wave(walk.phase))
    }

    /// Advance one step and publish bars, option snapshots and confluence
    /// for every contract given.
    pub async fn advance(&mut self, contracts: &[OptionContract], now: DateTime<Utc>) -> usize {
        self.step += 1;
        let mut published = 0;
        let mut barred: HashSet<String> = HashSet::new();

        for contract in contracts {
            let next_phase = self.walks.len() as f64 * 0.9;
            let walk = self
                .walks
                .entry(contract.underlying.clone())
                .or_insert_with(|| {
                    let base = to_f64(contract.strike).max(1.0);
                    Walk {
                        base,
                        phase: next_phase,
                        last_close: base,
                    }
                })
                .clone();

            let underlying = self.underlying_price(&walk);
            let pressure = self.wave(walk.phase + PI / 4.0);

            // One bar per underlying per step
            if barred.insert(contract.underlying.clone()) {
                let bar = Bar {
                    timestamp: now,
                    open: walk.last_close,
                    high: walk.last_close.max(underlying),
                    low: walk.last_close.min(underlying),
                    close: underlying,
                    volume: 10_000.0 * (1.0 + 0.5 * pressure.abs()),
                };
                self.market.push_bar(&contract.underlying, bar).await;
                if let Some(w) = self.walks.get_mut(&contract.underlying) {
                    w.last_close = underlying;
                }
                self.market
                    .set_confluence(&contract.underlying, 60.0 + 25.0 * pressure)
                    .await;
            }

            let days = contract.days_to_expiry(now).max(0) as f64;
            let (option_price, greeks) = Self::price_option(contract, underlying, days, pressure);

            let (Some(option_price), Some(underlying_price)) =
                (from_f64_price(option_price), from_f64_price(underlying))
            else {
                debug!(contract = %contract, "Simulated price not representable, skipping");
                continue;
            };
            self.market
                .set_option_snapshot(contract, option_price, underlying_price, greeks)
                .await;
            published += 1;
        }

        debug!(step = self.step, published, "Paper feed advanced");
        published
    }

    fn price_option(contract: &OptionContract, underlying: f64, days: f64, pressure: f64) -> (f64, RawGreeks) {
        let strike = to_f64(contract.strike);
        let intrinsic = match contract.option_type {
            OptionType::Call => (underlying - strike).max(0.0),
            OptionType::Put => (strike - underlying).max(0.0),
        };
        let time_value = underlying * 0.02 * ((days + 1.0) / 30.0).sqrt();
        let price = (intrinsic + time_value).max(MIN_OPTION_PRICE);

        let moneyness = ((underlying - strike) / strike.max(1.0) * 5.0).clamp(-0.45, 0.45);
        let delta = match contract.option_type {
            OptionType::Call => 0.5 + moneyness,
            OptionType::Put => -0.5 + moneyness,
        };

        let greeks = RawGreeks {
            delta: Some(delta),
            gamma: Some(0.02 + 0.01 * (1.0 - moneyness.abs() * 2.0)),
            theta: Some(-time_value / (days + 1.0)),
            vega: Some(0.1),
            rho: Some(0.01),
            implied_volatility: Some(0.25 + 0.05 * pressure),
        };
        (price, greeks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::MarketDataProvider;
    use chrono::{Duration, NaiveDate};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn contract() -> OptionContract {
        OptionContract::new(
            "SPY",
            dec!(450),
            NaiveDate::from_ymd_opt(2099, 6, 18).unwrap(),
            OptionType::Call,
        )
    }

    #[tokio::test]
    async fn test_advance_publishes_snapshot_and_bars() {
        let market = MockMarketData::new();
        let mut feed = PaperFeed::new(market.clone());
        let now = Utc::now();

        assert_eq!(feed.advance(&[contract()], now).await, 1);
        feed.advance(&[contract()], now + Duration::seconds(5)).await;

        let snapshot = market.get_option_snapshot(&contract()).await.unwrap();
        assert!(snapshot.option_price > Decimal::ZERO);
        assert!(snapshot.greeks.gamma.unwrap() > 0.0);

        let bars = market.get_bars("SPY", "1Min", 10).await.unwrap();
        assert_eq!(bars.len(), 2);
        assert!(market.get_confluence("SPY").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_walk_stays_within_amplitude() {
        let market = MockMarketData::new();
        let mut feed = PaperFeed::new(market.clone()).with_wave(0.1, 8);
        let now = Utc::now();

        for _ in 0..16 {
            feed.advance(&[contract()], now).await;
            let underlying = to_f64(market.get_option_snapshot(&contract()).await.unwrap().underlying_price);
            assert!((405.0..=495.0).contains(&underlying));
        }
        assert_eq!(feed.step(), 16);
    }
}
