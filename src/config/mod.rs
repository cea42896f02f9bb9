//! Configuration management for the options cockpit.
//!
//! Loads settings from environment variables and config files.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Main application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Monitoring loop settings
    #[serde(default)]
    pub monitor: MonitorConfig,
    /// Alert deduplication and retention
    #[serde(default)]
    pub escalation: EscalationConfig,
    /// IV history and gating thresholds
    #[serde(default)]
    pub iv: IvConfig,
    /// Flow analysis window
    #[serde(default)]
    pub flow: FlowConfig,
    /// Trade store behaviour
    #[serde(default)]
    pub store: StoreConfig,
    /// Alert delivery
    #[serde(default)]
    pub notifications: NotificationConfig,
    /// Trade repository location
    #[serde(default)]
    pub database: DatabaseConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Seconds between monitoring ticks
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Upper bound on one trade's evaluation within a tick
    #[serde(default = "default_tick_timeout_secs")]
    pub tick_timeout_secs: u64,
    /// Owner of the trades loaded from the repository
    #[serde(default = "default_user_id")]
    pub user_id: String,
    /// Bar timeframe fed to the flow analyzer
    #[serde(default = "default_bar_timeframe")]
    pub bar_timeframe: String,
    /// Bars requested per tick
    #[serde(default = "default_bar_limit")]
    pub bar_limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationConfig {
    /// Suppress repeats of the same (trade, category, severity) within this window
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    /// Alerts retained per trade before the oldest is evicted
    #[serde(default = "default_max_alerts_per_trade")]
    pub max_alerts_per_trade: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IvConfig {
    /// Readings kept per symbol
    #[serde(default = "default_iv_capacity")]
    pub capacity: usize,
    /// Readings required before stats are produced
    #[serde(default = "default_iv_min_samples")]
    pub min_samples: usize,
    /// Readings averaged for crush/spike comparison
    #[serde(default = "default_iv_lookback")]
    pub lookback: usize,
    /// Drop vs recent mean (percent) that gates as a crush
    #[serde(default = "default_crush_threshold_pct")]
    pub crush_threshold_pct: f64,
    /// Rise vs recent mean (percent) that gates as a spike
    #[serde(default = "default_spike_threshold_pct")]
    pub spike_threshold_pct: f64,
    /// Percentile at or above which IV is elevated
    #[serde(default = "default_high_percentile")]
    pub high_percentile: f64,
    /// Percentile at or below which IV is cheap
    #[serde(default = "default_low_percentile")]
    pub low_percentile: f64,
    /// Lower edge of the optimal buying band
    #[serde(default = "default_optimal_low")]
    pub optimal_low: f64,
    /// Upper edge of the optimal buying band
    #[serde(default = "default_optimal_high")]
    pub optimal_high: f64,
    /// Earnings within this many days gate as WARN_EARNINGS
    #[serde(default = "default_earnings_warning_days")]
    pub earnings_warning_days: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowConfig {
    /// Snapshots kept per symbol
    #[serde(default = "default_flow_window")]
    pub window: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Panic on list-membership violations instead of self-healing
    #[serde(default = "default_strict_invariants")]
    pub strict_invariants: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotificationConfig {
    /// Chat webhook receiving alerts; alerts are only logged when unset
    #[serde(default)]
    pub webhook_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite file holding trades
    #[serde(default = "default_database_path")]
    pub path: String,
}

// Default value functions
fn default_interval_secs() -> u64 {
    5
}

fn default_tick_timeout_secs() -> u64 {
    4 // Under the interval so a slow trade never overlaps the next tick
}

fn default_user_id() -> String {
    "local".to_string()
}

fn default_bar_timeframe() -> String {
    "5m".to_string()
}

fn default_bar_limit() -> usize {
    30
}

fn default_cooldown_secs() -> u64 {
    60
}

fn default_max_alerts_per_trade() -> usize {
    10
}

fn default_iv_capacity() -> usize {
    100
}

fn default_iv_min_samples() -> usize {
    10
}

fn default_iv_lookback() -> usize {
    5
}

fn default_crush_threshold_pct() -> f64 {
    20.0
}

fn default_spike_threshold_pct() -> f64 {
    30.0
}

fn default_high_percentile() -> f64 {
    75.0
}

fn default_low_percentile() -> f64 {
    25.0
}

fn default_optimal_low() -> f64 {
    25.0
}

fn default_optimal_high() -> f64 {
    50.0
}

fn default_earnings_warning_days() -> u32 {
    7
}

fn default_flow_window() -> usize {
    20
}

fn default_strict_invariants() -> bool {
    cfg!(debug_assertions)
}

fn default_database_path() -> String {
    "data/trades.db".to_string()
}

impl Config {
    /// Load configuration from environment variables and config files.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::default().separator("__").prefix("COCKPIT"))
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.monitor.interval_secs > 0, "interval_secs must be positive");

        anyhow::ensure!(
            self.monitor.tick_timeout_secs > 0,
            "tick_timeout_secs must be positive"
        );

        anyhow::ensure!(
            self.escalation.max_alerts_per_trade > 0,
            "max_alerts_per_trade must be positive"
        );

        anyhow::ensure!(
            self.iv.min_samples >= 1 && self.iv.min_samples <= self.iv.capacity,
            "iv.min_samples must be between 1 and iv.capacity"
        );

        anyhow::ensure!(
            self.iv.low_percentile < self.iv.high_percentile,
            "iv.low_percentile must be below iv.high_percentile"
        );

        anyhow::ensure!(
            self.iv.optimal_low <= self.iv.optimal_high,
            "iv.optimal_low must not exceed iv.optimal_high"
        );

        anyhow::ensure!(self.flow.window >= 5, "flow.window must hold at least 5 snapshots");

        Ok(())
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            tick_timeout_secs: default_tick_timeout_secs(),
            user_id: default_user_id(),
            bar_timeframe: default_bar_timeframe(),
            bar_limit: default_bar_limit(),
        }
    }
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: default_cooldown_secs(),
            max_alerts_per_trade: default_max_alerts_per_trade(),
        }
    }
}

impl Default for IvConfig {
    fn default() -> Self {
        Self {
            capacity: default_iv_capacity(),
            min_samples: default_iv_min_samples(),
            lookback: default_iv_lookback(),
            crush_threshold_pct: default_crush_threshold_pct(),
            spike_threshold_pct: default_spike_threshold_pct(),
            high_percentile: default_high_percentile(),
            low_percentile: default_low_percentile(),
            optimal_low: default_optimal_low(),
            optimal_high: default_optimal_high(),
            earnings_warning_days: default_earnings_warning_days(),
        }
    }
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            window: default_flow_window(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            strict_invariants: default_strict_invariants(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}
