//! Rolling implied-volatility history per symbol.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use tracing::{debug, warn};

pub const DEFAULT_CAPACITY: usize = 100;
pub const DEFAULT_MIN_SAMPLES: usize = 10;
pub const DEFAULT_LOOKBACK: usize = 5;
/// Drop (percent of the lookback mean) that counts as a crush
pub const CRUSH_THRESHOLD_PCT: f64 = 20.0;
/// Rise (percent of the lookback mean) that counts as a spike
pub const SPIKE_THRESHOLD_PCT: f64 = 30.0;

/// One IV observation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct IvReading {
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

/// Summary statistics for a symbol's IV history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IvStats {
    pub current: f64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub std_dev: f64,
    /// Percent of samples strictly below `current` (0-100)
    pub percentile: f64,
    /// Position of `current` within [min, max] (0-100)
    pub rank: f64,
    pub sample_count: usize,
}

/// Latest reading compared against the mean of the preceding readings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct IvChange {
    pub detected: bool,
    /// Size of the move as a percent of the lookback mean (always >= 0)
    pub magnitude_pct: f64,
}

impl IvChange {
    /// Same move, with `detected` decided against `threshold_pct`.
    pub fn judged(self, threshold_pct: f64) -> Self {
        Self {
            detected: self.magnitude_pct > threshold_pct,
            ..self
        }
    }
}

/// Fixed-capacity IV ring buffer per symbol.
#[derive(Debug)]
pub struct IvHistoryTracker {
    capacity: usize,
    min_samples: usize,
    history: HashMap<String, VecDeque<IvReading>>,
}

impl Default for IvHistoryTracker {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_MIN_SAMPLES)
    }
}

impl IvHistoryTracker {
    pub fn new(capacity: usize, min_samples: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            min_samples: min_samples.max(1),
            history: HashMap::new(),
        }
    }

    /// Record a reading now. Returns false if the value was rejected.
    pub fn record(&mut self, symbol: &str, iv: f64) -> bool {
        self.record_at(symbol, iv, Utc::now())
    }

    /// Record a reading at an explicit time.
    pub fn record_at(&mut self, symbol: &str, iv: f64, timestamp: DateTime<Utc>) -> bool {
        if !iv.is_finite() || iv < 0.0 {
            warn!(symbol = %symbol, iv = iv, "Rejecting invalid IV reading");
            return false;
        }

        let buffer = self.history.entry(symbol.to_string()).or_default();
        buffer.push_back(IvReading { value: iv, timestamp });
        while buffer.len() > self.capacity {
            buffer.pop_front();
        }

        debug!(symbol = %symbol, iv = iv, samples = buffer.len(), "Recorded IV");
        true
    }

    pub fn sample_count(&self, symbol: &str) -> usize {
        self.history.get(symbol).map_or(0, VecDeque::len)
    }

    pub fn latest(&self, symbol: &str) -> Option<IvReading> {
        self.history.get(symbol).and_then(|h| h.back().copied())
    }

    /// Statistics, or `None` below the minimum sample size.
    pub fn stats(&self, symbol: &str) -> Option<IvStats> {
        let buffer = self.history.get(symbol)?;
        if buffer.len() < self.min_samples {
            return None;
        }

        let values: Vec<f64> = buffer.iter().map(|r| r.value).collect();
        let n = values.len() as f64;
        let current = *values.last()?;

        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let mean = values.iter().sum::<f64>() / n;
        let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;

        let below = values.iter().filter(|v| **v < current).count() as f64;
        let percentile = 100.0 * below / n;
        let rank = if max > min {
            100.0 * (current - min) / (max - min)
        } else {
            50.0
        };

        Some(IvStats {
            current,
            min,
            max,
            mean,
            std_dev: variance.sqrt(),
            percentile,
            rank,
            sample_count: values.len(),
        })
    }

    /// Compare the latest reading to the mean of the `lookback` readings before it.
    fn change(&self, symbol: &str, lookback: usize) -> Option<(f64, f64)> {
        let buffer = self.history.get(symbol)?;
        let lookback = lookback.max(1);
        if buffer.len() < lookback + 1 {
            return None;
        }

        let latest = buffer.back()?.value;
        let prior: f64 = buffer
            .iter()
            .rev()
            .skip(1)
            .take(lookback)
            .map(|r| r.value)
            .sum::<f64>()
            / lookback as f64;

        if prior <= 0.0 {
            return None;
        }
        Some((latest, prior))
    }

    /// IV crush: latest reading dropped more than 20% below the recent mean.
    pub fn detect_crush(&self, symbol: &str, lookback: usize) -> Option<IvChange> {
        let (latest, prior) = self.change(symbol, lookback)?;
        let drop_pct = ((prior - latest) / prior * 100.0).max(0.0);
        Some(IvChange {
            detected: drop_pct > CRUSH_THRESHOLD_PCT,
            magnitude_pct: drop_pct,
        })
    }

    /// IV spike: latest reading rose more than 30% above the recent mean.
    pub fn detect_spike(&self, symbol: &str, lookback: usize) -> Option<IvChange> {
        let (latest, prior) = self.change(symbol, lookback)?;
        let rise_pct = ((latest - prior) / prior * 100.0).max(0.0);
        Some(IvChange {
            detected: rise_pct > SPIKE_THRESHOLD_PCT,
            magnitude_pct: rise_pct,
        })
    }

    pub fn clear(&mut self, symbol: &str) {
        self.history.remove(symbol);
    }
}
