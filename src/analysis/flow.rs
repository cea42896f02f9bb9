//! Order-flow pressure derived from bar closes and volume.
//!
//! Each new bar produces a snapshot whose buy/sell pressure leans toward the
//! side the close moved, proportional to the percent change. A rolling window
//! of snapshots yields a baseline, velocity, divergence and exhaustion.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use tracing::trace;

use crate::market::Bar;

pub const DEFAULT_WINDOW: usize = 20;
/// Pressure points per 1% price change
const PRESSURE_SENSITIVITY: f64 = 10.0;
/// Minimum buy/sell gap for flow to count as directional
const DIVERGENCE_MARGIN: f64 = 10.0;
/// Readings used for divergence price direction and exhaustion slope
const RECENT_READINGS: usize = 5;
const EXHAUSTION_START_LEVEL: f64 = 70.0;
/// Pressure points lost per bar before a side counts as exhausted
const EXHAUSTION_SLOPE: f64 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowSide {
    Buy,
    Sell,
}

/// Pressure derived from one bar.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlowSnapshot {
    pub timestamp: DateTime<Utc>,
    pub close: f64,
    pub price_change_pct: f64,
    pub volume: f64,
    /// 0-100
    pub buy_pressure: f64,
    /// 0-100, always `100 - buy_pressure`
    pub sell_pressure: f64,
    pub buy_volume: f64,
    pub sell_volume: f64,
}

impl FlowSnapshot {
    pub fn dominant_side(&self) -> FlowSide {
        if self.buy_pressure >= self.sell_pressure {
            FlowSide::Buy
        } else {
            FlowSide::Sell
        }
    }

    pub fn dominant_pressure(&self) -> f64 {
        self.buy_pressure.max(self.sell_pressure)
    }
}

/// Simple average over the window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlowBaseline {
    pub buy_pressure: f64,
    pub sell_pressure: f64,
    pub volume: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DivergenceKind {
    /// Price falling while flow is buy-dominant
    Bullish,
    /// Price rising while flow is sell-dominant
    Bearish,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlowDivergence {
    pub kind: DivergenceKind,
    pub strength: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlowExhaustion {
    pub side: FlowSide,
    pub slope: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlowMetrics {
    pub symbol: String,
    pub current: FlowSnapshot,
    pub baseline: FlowBaseline,
    /// Current volume relative to baseline (1.0 = normal)
    pub velocity: f64,
    pub divergence: Option<FlowDivergence>,
    pub exhaustion: Option<FlowExhaustion>,
    pub sample_count: usize,
}

#[derive(Debug, Default)]
struct SymbolFlow {
    last_close: Option<f64>,
    last_timestamp: Option<DateTime<Utc>>,
    window: VecDeque<FlowSnapshot>,
}

/// Per-symbol rolling flow windows.
#[derive(Debug)]
pub struct FlowAnalyzer {
    window_size: usize,
    symbols: HashMap<String, SymbolFlow>,
}

impl Default for FlowAnalyzer {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}

/// Least-squares slope of `values` against their index.
pub fn regression_slope(values: &[f64]) -> f64 {
    let n = values.len();
    if n < 2 {
        return 0.0;
    }
    let x_mean = (n - 1) as f64 / 2.0;
    let y_mean = values.iter().sum::<f64>() / n as f64;

    let (num, den) = values
        .iter()
        .enumerate()
        .fold((0.0, 0.0), |(num, den), (i, y)| {
            let dx = i as f64 - x_mean;
            (num + dx * (y - y_mean), den + dx * dx)
        });

    if den == 0.0 {
        0.0
    } else {
        num / den
    }
}

impl FlowAnalyzer {
    pub fn new(window_size: usize) -> Self {
        Self {
            window_size: window_size.max(2),
            symbols: HashMap::new(),
        }
    }

    /// Feed bars (oldest first). Bars at or before the last seen timestamp are ignored,
    /// so the same history can be re-fetched every tick.
    pub fn ingest_bars(&mut self, symbol: &str, bars: &[Bar]) -> usize {
        bars.iter().filter(|bar| self.record_bar(symbol, bar)).count()
    }

    /// Feed one bar. Returns false if it was stale or unusable.
    pub fn record_bar(&mut self, symbol: &str, bar: &Bar) -> bool {
        if !bar.close.is_finite() || bar.close <= 0.0 || !bar.volume.is_finite() {
            return false;
        }

        let window_size = self.window_size;
        let flow = self.symbols.entry(symbol.to_string()).or_default();
        if flow.last_timestamp.is_some_and(|ts| bar.timestamp <= ts) {
            return false;
        }

        if let Some(prev) = flow.last_close {
            let price_change_pct = (bar.close - prev) / prev * 100.0;
            let buy_pressure = (50.0 + price_change_pct * PRESSURE_SENSITIVITY).clamp(0.0, 100.0);
            let sell_pressure = 100.0 - buy_pressure;
            let volume = bar.volume.max(0.0);

            flow.window.push_back(FlowSnapshot {
                timestamp: bar.timestamp,
                close: bar.close,
                price_change_pct,
                volume,
                buy_pressure,
                sell_pressure,
                buy_volume: volume * buy_pressure / 100.0,
                sell_volume: volume * sell_pressure / 100.0,
            });
            while flow.window.len() > window_size {
                flow.window.pop_front();
            }
            trace!(symbol = %symbol, buy_pressure, sell_pressure, "Flow snapshot");
        }

        flow.last_close = Some(bar.close);
        flow.last_timestamp = Some(bar.timestamp);
        true
    }

    /// Flow metrics, or `None` until at least two bars have been seen.
    pub fn analyze(&self, symbol: &str) -> Option<FlowMetrics> {
        let flow = self.symbols.get(symbol)?;
        let current = flow.window.back()?.clone();
        let n = flow.window.len() as f64;

        let baseline = FlowBaseline {
            buy_pressure: flow.window.iter().map(|s| s.buy_pressure).sum::<f64>() / n,
            sell_pressure: flow.window.iter().map(|s| s.sell_pressure).sum::<f64>() / n,
            volume: flow.window.iter().map(|s| s.volume).sum::<f64>() / n,
        };

        let velocity = if baseline.volume > 0.0 {
            current.volume / baseline.volume
        } else {
            1.0
        };

        let recent: Vec<&FlowSnapshot> = flow
            .window
            .iter()
            .skip(flow.window.len().saturating_sub(RECENT_READINGS))
            .collect();

        Some(FlowMetrics {
            symbol: symbol.to_string(),
            divergence: detect_divergence(&recent, &current),
            exhaustion: detect_exhaustion(&recent),
            sample_count: flow.window.len(),
            current,
            baseline,
            velocity,
        })
    }

    pub fn clear(&mut self, symbol: &str) {
        self.symbols.remove(symbol);
    }
}

fn detect_divergence(recent: &[&FlowSnapshot], current: &FlowSnapshot) -> Option<FlowDivergence> {
    let price_move: f64 = recent.iter().map(|s| s.price_change_pct).sum();
    let flow_bias = current.buy_pressure - current.sell_pressure;

    if price_move < 0.0 && flow_bias > DIVERGENCE_MARGIN {
        Some(FlowDivergence {
            kind: DivergenceKind::Bullish,
            strength: current.buy_pressure,
        })
    } else if price_move > 0.0 && flow_bias < -DIVERGENCE_MARGIN {
        Some(FlowDivergence {
            kind: DivergenceKind::Bearish,
            strength: current.sell_pressure,
        })
    } else {
        None
    }
}

fn detect_exhaustion(recent: &[&FlowSnapshot]) -> Option<FlowExhaustion> {
    if recent.len() < RECENT_READINGS {
        return None;
    }

    for side in [FlowSide::Buy, FlowSide::Sell] {
        let readings: Vec<f64> = recent
            .iter()
            .map(|s| match side {
                FlowSide::Buy => s.buy_pressure,
                FlowSide::Sell => s.sell_pressure,
            })
            .collect();

        let slope = regression_slope(&readings);
        if readings[0] > EXHAUSTION_START_LEVEL && slope < -EXHAUSTION_SLOPE {
            return Some(FlowExhaustion { side, slope });
        }
    }
    None
}
