//! Declarative escalation rules.
//!
//! Each rule is data: a condition descriptor interpreted against a
//! `TradeContext`, a severity tier, a message template and optional
//! actionability metadata.

use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

use super::alert::{AlertAction, AlertActionType, AlertCategory, AlertSeverity};
use super::context::TradeContext;
use crate::analysis::{DivergenceKind, FlowSide};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RuleError {
    #[error("rule needs {0} data, none available")]
    MissingInput(&'static str),

    #[error("rule {0} is already registered")]
    DuplicateRule(String),

    #[error("invalid rule parameter: {0}")]
    InvalidParameter(String),
}

/// Condition descriptors. Thresholds are percents unless noted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuleCondition {
    PnlAtOrBelow { pct: f64 },
    PnlAtOrAbove { pct: f64 },
    /// `above_pct < pnl <= at_or_below_pct`
    PnlBand { above_pct: f64, at_or_below_pct: f64 },
    /// Still above the stop, by less than `pct`
    StopWithin { pct: f64 },
    StopBreached,
    /// Within `pct` of the target, or past it
    TargetWithin { pct: f64 },
    /// Daily theta as a percent of the option mark
    ThetaBurnAbove { pct: f64 },
    GammaRisk { min_gamma: f64, max_days_to_expiry: i64 },
    /// A crush the IV advisor flagged, of at least `min_pct`
    IvCrush { min_pct: f64 },
    /// Price/flow divergence pointing against the position
    FlowAgainstPosition { min_strength: f64 },
    /// The side carrying the position is fading
    FlowExhaustion,
    /// Current pressure vs baseline (1.0 = normal)
    UnusualFlow { min_velocity: f64 },
    /// Confluence fell by at least `points` since the last tick
    ConfluenceDrop { points: f64 },
    ExpiresWithin { days: i64 },
    All(Vec<RuleCondition>),
    Any(Vec<RuleCondition>),
}

impl RuleCondition {
    pub fn evaluate(&self, ctx: &TradeContext) -> Result<bool, RuleError> {
        match self {
            RuleCondition::PnlAtOrBelow { pct } => Ok(ctx.pnl_pct <= *pct),
            RuleCondition::PnlAtOrAbove { pct } => Ok(ctx.pnl_pct >= *pct),
            RuleCondition::PnlBand {
                above_pct,
                at_or_below_pct,
            } => Ok(ctx.pnl_pct > *above_pct && ctx.pnl_pct <= *at_or_below_pct),
            RuleCondition::StopWithin { pct } => {
                let distance = ctx.distance_to_stop_pct.ok_or(RuleError::MissingInput("stop"))?;
                Ok(distance > 0.0 && distance < *pct)
            }
            RuleCondition::StopBreached => {
                let stop = ctx.stop_loss.ok_or(RuleError::MissingInput("stop"))?;
                Ok(ctx.current_price <= stop)
            }
            RuleCondition::TargetWithin { pct } => {
                let distance = ctx
                    .distance_to_target_pct
                    .ok_or(RuleError::MissingInput("target"))?;
                Ok(distance <= *pct)
            }
            RuleCondition::ThetaBurnAbove { pct } => {
                let burn = ctx.theta_burn_pct().ok_or(RuleError::MissingInput("greeks"))?;
                Ok(burn >= *pct)
            }
            RuleCondition::GammaRisk {
                min_gamma,
                max_days_to_expiry,
            } => {
                let greeks = ctx.greeks.as_ref().ok_or(RuleError::MissingInput("greeks"))?;
                Ok(greeks.gamma >= *min_gamma && ctx.days_to_expiry <= *max_days_to_expiry)
            }
            RuleCondition::IvCrush { min_pct } => {
                let iv = ctx.iv.as_ref().ok_or(RuleError::MissingInput("iv"))?;
                Ok(iv.crush_pct.is_some_and(|m| m >= *min_pct))
            }
            RuleCondition::FlowAgainstPosition { min_strength } => {
                let flow = ctx.flow.as_ref().ok_or(RuleError::MissingInput("flow"))?;
                let against = match ctx.favorable_side() {
                    FlowSide::Buy => DivergenceKind::Bearish,
                    FlowSide::Sell => DivergenceKind::Bullish,
                };
                Ok(flow
                    .divergence
                    .as_ref()
                    .is_some_and(|d| d.kind == against && d.strength >= *min_strength))
            }
            RuleCondition::FlowExhaustion => {
                let flow = ctx.flow.as_ref().ok_or(RuleError::MissingInput("flow"))?;
                let favorable = ctx.favorable_side();
                Ok(flow.exhaustion.as_ref().is_some_and(|e| e.side == favorable))
            }
            RuleCondition::UnusualFlow { min_velocity } => {
                let flow = ctx.flow.as_ref().ok_or(RuleError::MissingInput("flow"))?;
                Ok(flow.velocity >= *min_velocity)
            }
            RuleCondition::ConfluenceDrop { points } => {
                let drop = ctx
                    .confluence_drop()
                    .ok_or(RuleError::MissingInput("confluence"))?;
                Ok(drop >= *points)
            }
            RuleCondition::ExpiresWithin { days } => Ok(ctx.days_to_expiry <= *days),
            RuleCondition::All(conditions) => {
                for condition in conditions {
                    if !condition.evaluate(ctx)? {
                        return Ok(false);
                    }
                }
                Ok(!conditions.is_empty())
            }
            RuleCondition::Any(conditions) => {
                let mut last_err = None;
                for condition in conditions {
                    match condition.evaluate(ctx) {
                        Ok(true) => return Ok(true),
                        Ok(false) => {}
                        Err(e) => last_err = Some(e),
                    }
                }
                match last_err {
                    Some(e) => Err(e),
                    None => Ok(false),
                }
            }
        }
    }
}

/// Actionability metadata; the payload is built from the context at fire time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionTemplate {
    pub label: String,
    pub action_type: AlertActionType,
    /// Percent of the position, for trims
    #[serde(default)]
    pub trim_percent: Option<u32>,
}

impl ActionTemplate {
    pub fn new(label: &str, action_type: AlertActionType) -> Self {
        Self {
            label: label.to_string(),
            action_type,
            trim_percent: None,
        }
    }

    pub fn trim(label: &str, percent: u32) -> Self {
        Self {
            label: label.to_string(),
            action_type: AlertActionType::Trim,
            trim_percent: Some(percent),
        }
    }

    pub fn build(&self, ctx: &TradeContext) -> AlertAction {
        let payload = match self.action_type {
            AlertActionType::Exit => json!({
                "tradeId": ctx.trade_id,
                "price": ctx.current_price.to_string(),
            }),
            AlertActionType::Trim => json!({
                "tradeId": ctx.trade_id,
                "price": ctx.current_price.to_string(),
                "percent": self.trim_percent.unwrap_or(50),
            }),
            AlertActionType::MoveStop => json!({
                "tradeId": ctx.trade_id,
                "stopLoss": ctx.entry_price.to_string(),
            }),
            AlertActionType::Review => json!({ "tradeId": ctx.trade_id }),
        };

        AlertAction {
            label: self.label.clone(),
            action_type: self.action_type,
            payload,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationRule {
    pub id: String,
    pub category: AlertCategory,
    pub severity: AlertSeverity,
    pub condition: RuleCondition,
    pub title: String,
    /// `{placeholder}` tokens are filled from the context
    pub message_template: String,
    #[serde(default)]
    pub action: Option<ActionTemplate>,
}

impl EscalationRule {
    pub fn new(
        id: &str,
        category: AlertCategory,
        severity: AlertSeverity,
        condition: RuleCondition,
        title: &str,
        message_template: &str,
    ) -> Self {
        Self {
            id: id.to_string(),
            category,
            severity,
            condition,
            title: title.to_string(),
            message_template: message_template.to_string(),
            action: None,
        }
    }

    pub fn with_action(mut self, action: ActionTemplate) -> Self {
        self.action = Some(action);
        self
    }

    pub fn validate(&self) -> Result<(), RuleError> {
        if self.id.trim().is_empty() {
            return Err(RuleError::InvalidParameter("rule id is empty".into()));
        }
        if self.title.trim().is_empty() {
            return Err(RuleError::InvalidParameter(format!("rule {} has no title", self.id)));
        }
        Ok(())
    }

    pub fn evaluate(&self, ctx: &TradeContext) -> Result<bool, RuleError> {
        self.condition.evaluate(ctx)
    }

    pub fn render_message(&self, ctx: &TradeContext) -> String {
        render_template(&self.message_template, ctx)
    }
}

fn fmt_opt(value: Option<f64>) -> String {
    value.map_or_else(|| "n/a".to_string(), |v| format!("{:.1}", v))
}

/// Fill `{placeholder}` tokens. Unknown tokens are left as written.
pub fn render_template(template: &str, ctx: &TradeContext) -> String {
    let greeks = ctx.greeks.as_ref();
    let replacements: [(&str, String); 16] = [
        ("{ticker}", ctx.ticker.clone()),
        ("{contract}", ctx.contract.to_string()),
        ("{pnl}", format!("{:.1}", ctx.pnl_pct)),
        ("{price}", ctx.current_price.to_string()),
        ("{entry}", ctx.entry_price.to_string()),
        ("{stop}", ctx.stop_loss.map_or("n/a".into(), |s| s.to_string())),
        ("{target}", ctx.target_price.map_or("n/a".into(), |t| t.to_string())),
        ("{dte}", ctx.days_to_expiry.to_string()),
        ("{stop_distance}", fmt_opt(ctx.distance_to_stop_pct)),
        ("{target_distance}", fmt_opt(ctx.distance_to_target_pct)),
        ("{theta_burn}", fmt_opt(ctx.theta_burn_pct())),
        ("{gamma}", greeks.map_or("n/a".into(), |g| format!("{:.3}", g.gamma))),
        ("{iv_crush}", fmt_opt(ctx.iv.as_ref().and_then(|iv| iv.crush_pct))),
        ("{velocity}", ctx.flow.as_ref().map_or("n/a".into(), |f| format!("{:.2}", f.velocity))),
        ("{confluence}", fmt_opt(ctx.confluence)),
        ("{confluence_drop}", fmt_opt(ctx.confluence_drop())),
    ];

    replacements
        .iter()
        .fold(template.to_string(), |acc, (token, value)| acc.replace(token, value))
}

/// The built-in rule set.
pub fn default_rules() -> Vec<EscalationRule> {
    use AlertCategory as C;
    use AlertSeverity as S;

    vec![
        EscalationRule::new(
            "heavy-loss",
            C::Loss,
            S::Critical,
            RuleCondition::PnlAtOrBelow { pct: -30.0 },
            "Heavy Loss",
            "{ticker} P&L is {pnl}% ({entry} -> {price}). Consider cutting the position.",
        )
        .with_action(ActionTemplate::new("Exit Position", AlertActionType::Exit)),
        EscalationRule::new(
            "moderate-loss",
            C::Loss,
            S::Warning,
            RuleCondition::PnlBand {
                above_pct: -30.0,
                at_or_below_pct: -15.0,
            },
            "Moderate Loss",
            "{ticker} P&L is {pnl}%. Review the thesis and the {stop} stop.",
        )
        .with_action(ActionTemplate::new("Review", AlertActionType::Review)),
        EscalationRule::new(
            "stop-breached",
            C::StopLoss,
            S::Critical,
            RuleCondition::StopBreached,
            "Stop Loss Breached",
            "{ticker} traded at {price}, through the {stop} stop.",
        )
        .with_action(ActionTemplate::new("Exit Position", AlertActionType::Exit)),
        EscalationRule::new(
            "stop-proximity",
            C::StopLoss,
            S::Urgent,
            RuleCondition::StopWithin { pct: 5.0 },
            "Approaching Stop",
            "{ticker} at {price} is {stop_distance}% above the {stop} stop.",
        ),
        EscalationRule::new(
            "target-near",
            C::Target,
            S::Info,
            RuleCondition::TargetWithin { pct: 5.0 },
            "Target Near",
            "{ticker} at {price} is within {target_distance}% of the {target} target.",
        )
        .with_action(ActionTemplate::trim("Trim 50%", 50)),
        EscalationRule::new(
            "big-winner",
            C::Profit,
            S::Info,
            RuleCondition::PnlAtOrAbove { pct: 50.0 },
            "Big Winner",
            "{ticker} is up {pnl}%. Consider moving the stop to breakeven at {entry}.",
        )
        .with_action(ActionTemplate::new("Move Stop to Breakeven", AlertActionType::MoveStop)),
        EscalationRule::new(
            "theta-burn",
            C::Theta,
            S::Warning,
            RuleCondition::ThetaBurnAbove { pct: 5.0 },
            "Theta Burn",
            "{contract} is losing {theta_burn}% of its value per day to decay.",
        ),
        EscalationRule::new(
            "gamma-risk",
            C::Gamma,
            S::Warning,
            RuleCondition::GammaRisk {
                min_gamma: 0.10,
                max_days_to_expiry: 3,
            },
            "Gamma Risk",
            "{contract} has gamma {gamma} with {dte} days left. Expect sharp swings.",
        ),
        EscalationRule::new(
            "iv-crush",
            C::Volatility,
            S::Warning,
            RuleCondition::IvCrush { min_pct: 0.0 },
            "IV Crush",
            "Implied volatility on {ticker} dropped {iv_crush}% against its recent average.",
        ),
        EscalationRule::new(
            "flow-divergence",
            C::Flow,
            S::Warning,
            RuleCondition::FlowAgainstPosition { min_strength: 60.0 },
            "Flow Divergence",
            "Order flow on {ticker} diverges from price against the position.",
        )
        .with_action(ActionTemplate::new("Review", AlertActionType::Review)),
        EscalationRule::new(
            "flow-exhaustion",
            C::Momentum,
            S::Info,
            RuleCondition::FlowExhaustion,
            "Momentum Fading",
            "Pressure behind {ticker} is fading while the position is {pnl}%.",
        )
        .with_action(ActionTemplate::trim("Trim 25%", 25)),
        EscalationRule::new(
            "unusual-flow",
            C::Flow,
            S::Info,
            RuleCondition::UnusualFlow { min_velocity: 2.0 },
            "Unusual Flow",
            "{ticker} flow is running at {velocity}x its baseline.",
        ),
        EscalationRule::new(
            "confluence-drop",
            C::Confluence,
            S::Warning,
            RuleCondition::ConfluenceDrop { points: 15.0 },
            "Confluence Dropped",
            "{ticker} confluence fell {confluence_drop} points to {confluence}.",
        ),
        EscalationRule::new(
            "expiring-today",
            C::Expiration,
            S::Urgent,
            RuleCondition::ExpiresWithin { days: 0 },
            "Expires Today",
            "{contract} expires today. Close or roll before the bell.",
        )
        .with_action(ActionTemplate::new("Exit Position", AlertActionType::Exit)),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{FlowDivergence, GreeksSnapshot, IvGatingAdvisor, IvHistoryTracker};
    use crate::config::IvConfig;
    use crate::escalation::context::FlowContext;
    use crate::market::{OptionContract, OptionType};
    use crate::trade::{Trade, TradeState};
    use chrono::{NaiveDate, Utc};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn ctx(entry: Decimal, current: Decimal, stop: Option<Decimal>) -> TradeContext {
        let contract = OptionContract::new(
            "SPY",
            dec!(450),
            NaiveDate::from_ymd_opt(2099, 1, 16).unwrap(),
            OptionType::Call,
        );
        let mut trade = Trade::watching("user-1", contract, Utc::now()).with_levels(None, stop);
        trade.state = TradeState::Entered;
        trade.entry_price = Some(entry);
        TradeContext::build(&trade, current, Utc::now()).unwrap()
    }

    fn rule(id: &str) -> EscalationRule {
        default_rules().into_iter().find(|r| r.id == id).unwrap()
    }

    #[test]
    fn test_loss_bands_do_not_overlap() {
        let heavy = rule("heavy-loss");
        let moderate = rule("moderate-loss");

        let at_thirty = ctx(dec!(100), dec!(70), None);
        assert!(heavy.evaluate(&at_thirty).unwrap());
        assert!(!moderate.evaluate(&at_thirty).unwrap());

        let at_twenty = ctx(dec!(100), dec!(80), None);
        assert!(!heavy.evaluate(&at_twenty).unwrap());
        assert!(moderate.evaluate(&at_twenty).unwrap());
    }

    #[test]
    fn test_stop_rules() {
        let near = ctx(dec!(4), dec!(3.10), Some(dec!(3)));
        assert!(rule("stop-proximity").evaluate(&near).unwrap());
        assert!(!rule("stop-breached").evaluate(&near).unwrap());

        let through = ctx(dec!(4), dec!(2.90), Some(dec!(3)));
        assert!(!rule("stop-proximity").evaluate(&through).unwrap());
        assert!(rule("stop-breached").evaluate(&through).unwrap());

        let no_stop = ctx(dec!(4), dec!(3), None);
        assert_eq!(
            rule("stop-breached").evaluate(&no_stop),
            Err(RuleError::MissingInput("stop"))
        );
    }

    #[test]
    fn test_greeks_rules_need_greeks() {
        let base = ctx(dec!(2), dec!(2), None);
        assert_eq!(
            rule("theta-burn").evaluate(&base),
            Err(RuleError::MissingInput("greeks"))
        );

        let with_greeks = base.with_greeks(Some(GreeksSnapshot {
            delta: 0.5,
            gamma: 0.02,
            theta: -0.15,
            vega: 0.1,
            rho: 0.01,
            implied_volatility: 0.3,
            underlying_price: 450.0,
            option_price: 2.0,
            days_to_expiry: 10,
            is_estimated: false,
            as_of: Utc::now(),
        }));
        // 0.15 / 2.00 = 7.5% a day
        assert!(rule("theta-burn").evaluate(&with_greeks).unwrap());
        assert!(!rule("gamma-risk").evaluate(&with_greeks).unwrap());
    }

    #[test]
    fn test_flow_against_call_is_bearish_divergence() {
        let mut c = ctx(dec!(2), dec!(2), None);
        c.flow = Some(FlowContext {
            velocity: 1.0,
            buy_pressure: 30.0,
            sell_pressure: 70.0,
            dominant_side: FlowSide::Sell,
            divergence: Some(FlowDivergence {
                kind: DivergenceKind::Bearish,
                strength: 70.0,
            }),
            exhaustion: None,
        });
        assert!(rule("flow-divergence").evaluate(&c).unwrap());

        c.contract.option_type = OptionType::Put;
        assert!(!rule("flow-divergence").evaluate(&c).unwrap());
    }

    #[test]
    fn test_iv_crush_follows_configured_threshold() {
        let mut tracker = IvHistoryTracker::default();
        for _ in 0..20 {
            tracker.record("SPY", 0.40);
        }
        // 15% below the recent mean
        tracker.record("SPY", 0.34);

        let sensitive = IvGatingAdvisor::new(IvConfig {
            crush_threshold_pct: 10.0,
            ..IvConfig::default()
        });
        let analysis = sensitive.analyze(&tracker, "SPY", None);
        let c = ctx(dec!(2), dec!(2), None).with_iv(Some(&analysis));
        let crush = c.iv.as_ref().and_then(|iv| iv.crush_pct).unwrap();
        assert!((crush - 15.0).abs() < 1e-6);
        assert!(rule("iv-crush").evaluate(&c).unwrap());

        let analysis = IvGatingAdvisor::new(IvConfig::default()).analyze(&tracker, "SPY", None);
        let c = ctx(dec!(2), dec!(2), None).with_iv(Some(&analysis));
        assert_eq!(c.iv.as_ref().and_then(|iv| iv.crush_pct), None);
        assert!(!rule("iv-crush").evaluate(&c).unwrap());
    }

    #[test]
    fn test_composite_conditions() {
        let c = ctx(dec!(100), dec!(60), None);
        let all = RuleCondition::All(vec![
            RuleCondition::PnlAtOrBelow { pct: -30.0 },
            RuleCondition::ExpiresWithin { days: 100_000 },
        ]);
        assert!(all.evaluate(&c).unwrap());

        let any = RuleCondition::Any(vec![
            RuleCondition::StopBreached,
            RuleCondition::PnlAtOrBelow { pct: -30.0 },
        ]);
        assert!(any.evaluate(&c).unwrap());
        assert!(!RuleCondition::All(Vec::new()).evaluate(&c).unwrap());
    }

    #[test]
    fn test_render_template() {
        let c = ctx(dec!(100), dec!(70), None);
        let message = rule("heavy-loss").render_message(&c);
        assert_eq!(
            message,
            "SPY P&L is -30.0% (100 -> 70). Consider cutting the position."
        );
    }

    #[test]
    fn test_exit_payload() {
        let c = ctx(dec!(100), dec!(70), None);
        let action = rule("heavy-loss").action.unwrap().build(&c);
        assert_eq!(action.action_type, AlertActionType::Exit);
        assert_eq!(action.payload["price"], "70");
    }
}
