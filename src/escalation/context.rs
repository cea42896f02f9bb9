//! Per-trade evaluation context.
//!
//! A point-in-time merge of the trade, its current mark and whatever market
//! signals were available this tick. Missing signals stay `None`; rules that
//! need them report a missing input instead of guessing.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

use crate::analysis::{
    FlowDivergence, FlowExhaustion, FlowMetrics, FlowSide, GatingDecision, GreeksSnapshot,
    IvAnalysis,
};
use crate::market::{OptionContract, OptionType};
use crate::trade::Trade;
use crate::utils::decimal::{percent_change, to_f64};

/// Flow signals relevant to one trade.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlowContext {
    pub velocity: f64,
    pub buy_pressure: f64,
    pub sell_pressure: f64,
    pub dominant_side: FlowSide,
    pub divergence: Option<FlowDivergence>,
    pub exhaustion: Option<FlowExhaustion>,
}

impl From<&FlowMetrics> for FlowContext {
    fn from(metrics: &FlowMetrics) -> Self {
        Self {
            velocity: metrics.velocity,
            buy_pressure: metrics.current.buy_pressure,
            sell_pressure: metrics.current.sell_pressure,
            dominant_side: metrics.current.dominant_side(),
            divergence: metrics.divergence.clone(),
            exhaustion: metrics.exhaustion.clone(),
        }
    }
}

/// IV signals relevant to one trade.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IvContext {
    pub current_iv: Option<f64>,
    pub percentile: Option<f64>,
    pub gating_decision: GatingDecision,
    /// Magnitude of a detected crush, percent
    pub crush_pct: Option<f64>,
    pub spike_pct: Option<f64>,
}

impl From<&IvAnalysis> for IvContext {
    fn from(analysis: &IvAnalysis) -> Self {
        Self {
            current_iv: analysis.current_iv,
            percentile: analysis.percentile(),
            gating_decision: analysis.gating_decision,
            crush_pct: analysis
                .crush
                .filter(|_| analysis.recent_crush)
                .map(|c| c.magnitude_pct),
            spike_pct: analysis
                .spike
                .filter(|_| analysis.recent_spike)
                .map(|c| c.magnitude_pct),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TradeContext {
    pub trade_id: String,
    pub ticker: String,
    pub contract: OptionContract,
    pub entry_price: Decimal,
    pub current_price: Decimal,
    pub stop_loss: Option<Decimal>,
    pub target_price: Option<Decimal>,
    pub pnl_pct: f64,
    pub days_to_expiry: i64,
    /// Signed, negative once breached
    pub distance_to_stop_pct: Option<f64>,
    /// Signed, negative once exceeded
    pub distance_to_target_pct: Option<f64>,
    pub confluence: Option<f64>,
    pub previous_confluence: Option<f64>,
    pub flow: Option<FlowContext>,
    pub greeks: Option<GreeksSnapshot>,
    pub iv: Option<IvContext>,
    pub as_of: DateTime<Utc>,
}

impl TradeContext {
    /// Base context from a trade marked at `current_price`.
    ///
    /// Returns `None` for trades without an entry price; there is no P&L to evaluate.
    pub fn build(trade: &Trade, current_price: Decimal, as_of: DateTime<Utc>) -> Option<Self> {
        let entry_price = trade.entry_price?;
        let pnl_pct = percent_change(entry_price, current_price)?;

        Some(Self {
            trade_id: trade.id.clone(),
            ticker: trade.ticker.clone(),
            contract: trade.contract.clone(),
            entry_price,
            current_price,
            stop_loss: trade.stop_loss,
            target_price: trade.target_price,
            pnl_pct,
            days_to_expiry: trade.days_to_expiry(as_of),
            distance_to_stop_pct: trade.distance_to_stop_pct(current_price),
            distance_to_target_pct: trade.distance_to_target_pct(current_price),
            confluence: trade.confluence_score,
            previous_confluence: None,
            flow: None,
            greeks: None,
            iv: None,
            as_of,
        })
    }

    pub fn with_confluence(mut self, current: Option<f64>, previous: Option<f64>) -> Self {
        if current.is_some() {
            self.confluence = current;
        }
        self.previous_confluence = previous;
        self
    }

    pub fn with_flow(mut self, metrics: Option<&FlowMetrics>) -> Self {
        self.flow = metrics.map(FlowContext::from);
        self
    }

    pub fn with_greeks(mut self, greeks: Option<GreeksSnapshot>) -> Self {
        self.greeks = greeks;
        self
    }

    pub fn with_iv(mut self, analysis: Option<&IvAnalysis>) -> Self {
        self.iv = analysis.map(IvContext::from);
        self
    }

    /// Points lost since the previous tick (positive when falling).
    pub fn confluence_drop(&self) -> Option<f64> {
        Some(self.previous_confluence? - self.confluence?)
    }

    /// Flow direction that helps this position.
    pub fn favorable_side(&self) -> FlowSide {
        match self.contract.option_type {
            OptionType::Call => FlowSide::Buy,
            OptionType::Put => FlowSide::Sell,
        }
    }

    /// Daily theta decay as a percent of the option's mark.
    pub fn theta_burn_pct(&self) -> Option<f64> {
        let greeks = self.greeks.as_ref()?;
        let price = to_f64(self.current_price);
        if price <= 0.0 {
            return None;
        }
        Some(greeks.theta.abs() / price * 100.0)
    }

    pub fn is_estimated(&self) -> bool {
        self.greeks.as_ref().is_some_and(|g| g.is_estimated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trade::TradeState;
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;

    fn entered(option_type: OptionType) -> Trade {
        let contract = OptionContract::new(
            "QQQ",
            dec!(400),
            NaiveDate::from_ymd_opt(2099, 6, 18).unwrap(),
            option_type,
        );
        let mut trade = Trade::watching("user-1", contract, Utc::now())
            .with_levels(Some(dec!(3)), Some(dec!(1.5)));
        trade.state = TradeState::Entered;
        trade.entry_price = Some(dec!(2));
        trade
    }

    #[test]
    fn test_build_requires_entry() {
        let mut trade = entered(OptionType::Call);
        trade.entry_price = None;
        assert!(TradeContext::build(&trade, dec!(2), Utc::now()).is_none());
    }

    #[test]
    fn test_build_derives_pnl_and_distances() {
        let trade = entered(OptionType::Call);
        let ctx = TradeContext::build(&trade, dec!(2.5), Utc::now()).unwrap();
        assert_eq!(ctx.pnl_pct, 25.0);
        assert_eq!(ctx.distance_to_stop_pct, Some(40.0));
        assert_eq!(ctx.distance_to_target_pct, Some(20.0));
        assert_eq!(ctx.favorable_side(), FlowSide::Buy);
    }

    #[test]
    fn test_confluence_drop() {
        let trade = entered(OptionType::Put);
        let ctx = TradeContext::build(&trade, dec!(2), Utc::now())
            .unwrap()
            .with_confluence(Some(55.0), Some(75.0));
        assert_eq!(ctx.confluence_drop(), Some(20.0));
        assert_eq!(ctx.favorable_side(), FlowSide::Sell);
    }
}
