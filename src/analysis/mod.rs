//! Market signal analyzers.
//!
//! - `greeks`: validation and safe bounding of upstream Greeks
//! - `iv_history`: rolling IV history with percentile and crush/spike detection
//! - `iv_gating`: IV-driven buy/sell/avoid decisions
//! - `flow`: buy/sell pressure, velocity, divergence and exhaustion

mod flow;
mod greeks;
mod iv_gating;
mod iv_history;

pub use flow::{
    regression_slope, DivergenceKind, FlowAnalyzer, FlowBaseline, FlowDivergence,
    FlowExhaustion, FlowMetrics, FlowSide, FlowSnapshot,
};
pub use greeks::{
    GreeksSnapshot, GreeksValidation, GreeksValidator, SafeGreeks, ValidationStats,
    FALLBACK_GAMMA,
};
pub use iv_gating::{
    GatingDecision, IvAnalysis, IvGatingAdvisor, IvRegime, OptionStrategy,
    StrategyRecommendation, Suitability,
};
pub use iv_history::{IvChange, IvHistoryTracker, IvReading, IvStats};
