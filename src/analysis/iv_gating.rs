//! IV-based entry gating.
//!
//! Turns a symbol's IV history into a buy/sell/avoid decision, strategy
//! suitability hints and a multiplicative score modifier.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::iv_history::{IvChange, IvHistoryTracker, IvStats};
use crate::config::IvConfig;

/// Gating decision, in precedence order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GatingDecision {
    WarnEarnings,
    WarnCrush,
    WarnSpike,
    SellPremium,
    BuyOptimal,
    BuyOk,
}

impl GatingDecision {
    /// Whether buying premium is discouraged.
    pub fn discourages_buying(&self) -> bool {
        matches!(
            self,
            GatingDecision::WarnEarnings | GatingDecision::WarnSpike | GatingDecision::SellPremium
        )
    }
}

impl fmt::Display for GatingDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            GatingDecision::WarnEarnings => "WARN_EARNINGS",
            GatingDecision::WarnCrush => "WARN_CRUSH",
            GatingDecision::WarnSpike => "WARN_SPIKE",
            GatingDecision::SellPremium => "SELL_PREMIUM",
            GatingDecision::BuyOptimal => "BUY_OPTIMAL",
            GatingDecision::BuyOk => "BUY_OK",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Suitability {
    Avoid,
    Poor,
    Neutral,
    Good,
    Excellent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptionStrategy {
    LongCall,
    LongPut,
    DebitSpread,
    LongStraddle,
    CreditSpread,
    IronCondor,
    CoveredCall,
    CashSecuredPut,
}

impl OptionStrategy {
    pub const ALL: [OptionStrategy; 8] = [
        OptionStrategy::LongCall,
        OptionStrategy::LongPut,
        OptionStrategy::DebitSpread,
        OptionStrategy::LongStraddle,
        OptionStrategy::CreditSpread,
        OptionStrategy::IronCondor,
        OptionStrategy::CoveredCall,
        OptionStrategy::CashSecuredPut,
    ];

    /// Long/debit strategies pay premium; short/credit strategies collect it.
    pub fn is_long_premium(&self) -> bool {
        matches!(
            self,
            OptionStrategy::LongCall
                | OptionStrategy::LongPut
                | OptionStrategy::DebitSpread
                | OptionStrategy::LongStraddle
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StrategyRecommendation {
    pub strategy: OptionStrategy,
    pub suitability: Suitability,
    pub reason: String,
}

/// Percentile bucket used to drive both the decision and recommendations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IvRegime {
    Elevated,
    Cheap,
    Optimal,
    Neutral,
    Unknown,
}

/// Full IV assessment for one symbol.
#[derive(Debug, Clone, Serialize)]
pub struct IvAnalysis {
    pub symbol: String,
    pub current_iv: Option<f64>,
    pub stats: Option<IvStats>,
    pub regime: IvRegime,
    pub is_elevated: bool,
    pub is_cheap: bool,
    pub is_optimal: bool,
    pub near_earnings: bool,
    pub days_to_earnings: Option<u32>,
    pub crush: Option<IvChange>,
    pub spike: Option<IvChange>,
    pub recent_crush: bool,
    pub recent_spike: bool,
    pub gating_decision: GatingDecision,
    pub reason: String,
    pub recommendations: Vec<StrategyRecommendation>,
}

impl IvAnalysis {
    pub fn percentile(&self) -> Option<f64> {
        self.stats.as_ref().map(|s| s.percentile)
    }
}

/// Stateless advisor over an [`IvHistoryTracker`].
#[derive(Debug, Clone)]
pub struct IvGatingAdvisor {
    config: IvConfig,
}

impl IvGatingAdvisor {
    pub fn new(config: IvConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &IvConfig {
        &self.config
    }

    pub fn analyze(
        &self,
        tracker: &IvHistoryTracker,
        symbol: &str,
        days_to_earnings: Option<u32>,
    ) -> IvAnalysis {
        let cfg = &self.config;
        let stats = tracker.stats(symbol);
        // Detection is re-judged against the configured thresholds
        let crush = tracker
            .detect_crush(symbol, cfg.lookback)
            .map(|c| c.judged(cfg.crush_threshold_pct));
        let spike = tracker
            .detect_spike(symbol, cfg.lookback)
            .map(|s| s.judged(cfg.spike_threshold_pct));

        let near_earnings = days_to_earnings.is_some_and(|d| d <= cfg.earnings_warning_days);
        let recent_crush = crush.is_some_and(|c| c.detected);
        let recent_spike = spike.is_some_and(|s| s.detected);

        let regime = match stats.as_ref().map(|s| s.percentile) {
            None => IvRegime::Unknown,
            Some(p) if p >= cfg.high_percentile => IvRegime::Elevated,
            Some(p) if p <= cfg.low_percentile => IvRegime::Cheap,
            Some(p) if p >= cfg.optimal_low && p <= cfg.optimal_high => IvRegime::Optimal,
            Some(_) => IvRegime::Neutral,
        };

        let (gating_decision, reason) = if near_earnings {
            (
                GatingDecision::WarnEarnings,
                format!(
                    "Earnings in {} days, IV likely to collapse after the report",
                    days_to_earnings.unwrap_or_default()
                ),
            )
        } else if recent_crush {
            (
                GatingDecision::WarnCrush,
                format!(
                    "IV dropped {:.1}% vs recent average",
                    crush.map_or(0.0, |c| c.magnitude_pct)
                ),
            )
        } else if recent_spike {
            (
                GatingDecision::WarnSpike,
                format!(
                    "IV rose {:.1}% vs recent average",
                    spike.map_or(0.0, |s| s.magnitude_pct)
                ),
            )
        } else {
            match regime {
                IvRegime::Elevated => (
                    GatingDecision::SellPremium,
                    "IV percentile elevated, premium is expensive".to_string(),
                ),
                IvRegime::Cheap => (
                    GatingDecision::BuyOk,
                    "IV percentile low, premium is cheap".to_string(),
                ),
                IvRegime::Optimal => (
                    GatingDecision::BuyOptimal,
                    "IV percentile in the optimal band".to_string(),
                ),
                IvRegime::Neutral => (GatingDecision::BuyOk, "IV percentile neutral".to_string()),
                IvRegime::Unknown => (
                    GatingDecision::BuyOk,
                    "Insufficient IV history".to_string(),
                ),
            }
        };

        IvAnalysis {
            symbol: symbol.to_string(),
            current_iv: tracker.latest(symbol).map(|r| r.value),
            recommendations: recommend(regime, near_earnings),
            is_elevated: regime == IvRegime::Elevated,
            is_cheap: regime == IvRegime::Cheap,
            is_optimal: regime == IvRegime::Optimal,
            stats,
            regime,
            near_earnings,
            days_to_earnings,
            crush,
            spike,
            recent_crush,
            recent_spike,
            gating_decision,
            reason,
        }
    }

    /// Multiplicative score adjustment, clamped to [0.5, 1.2].
    pub fn score_modifier(&self, analysis: &IvAnalysis) -> f64 {
        let mut modifier: f64 = 1.0;
        if analysis.is_optimal {
            modifier *= 1.10;
        }
        if analysis.is_cheap {
            modifier *= 1.05;
        }
        if analysis.is_elevated {
            modifier *= 0.85;
        }
        if analysis.near_earnings {
            modifier *= 0.70;
        }
        if analysis.recent_crush {
            modifier *= 1.10;
        }
        if analysis.recent_spike {
            modifier *= 0.90;
        }
        modifier.clamp(0.5, 1.2)
    }
}

fn recommend(regime: IvRegime, near_earnings: bool) -> Vec<StrategyRecommendation> {
    OptionStrategy::ALL
        .iter()
        .map(|&strategy| {
            let long = strategy.is_long_premium();
            let (suitability, reason) = if near_earnings {
                if long {
                    (Suitability::Avoid, "Earnings IV crush will erode long premium")
                } else {
                    (Suitability::Good, "Collect inflated pre-earnings premium")
                }
            } else {
                match (regime, long) {
                    (IvRegime::Elevated, true) if strategy == OptionStrategy::LongStraddle => {
                        (Suitability::Avoid, "Paying peak volatility on both legs")
                    }
                    (IvRegime::Elevated, true) => (Suitability::Poor, "Premium is expensive"),
                    (IvRegime::Elevated, false) => (Suitability::Excellent, "Selling rich premium"),
                    (IvRegime::Cheap, true) => (Suitability::Excellent, "Buying cheap premium"),
                    (IvRegime::Cheap, false) => (Suitability::Poor, "Little premium to collect"),
                    (IvRegime::Optimal, true) => (Suitability::Good, "IV fairly priced for buyers"),
                    (IvRegime::Optimal, false) => (Suitability::Neutral, "Average premium"),
                    (IvRegime::Neutral, _) | (IvRegime::Unknown, _) => {
                        (Suitability::Neutral, "No IV edge")
                    }
                }
            };
            StrategyRecommendation {
                strategy,
                suitability,
                reason: reason.to_string(),
            }
        })
        .collect()
}
