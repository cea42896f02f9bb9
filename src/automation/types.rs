//! Automation rules and the actions they propose.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

use crate::trade::{StoreError, Trade};
use crate::utils::decimal::{round_to_tick, PRICE_TICK};

static AUTOMATION_COUNTER: AtomicU64 = AtomicU64::new(1);

fn next_id(prefix: &str, now: DateTime<Utc>) -> String {
    format!(
        "{}-{}-{}",
        prefix,
        now.timestamp_millis(),
        AUTOMATION_COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}

#[derive(Debug, Error)]
pub enum AutomationError {
    #[error("automation rule {0} not found")]
    RuleNotFound(String),

    #[error("action {0} not found")]
    ActionNotFound(String),

    #[error("action {id} is {actual}, expected {expected}")]
    InvalidStatus {
        id: String,
        actual: ActionStatus,
        expected: ActionStatus,
    },

    #[error("invalid automation rule: {0}")]
    InvalidRule(String),

    #[error("trade {0} is not open")]
    TradeNotOpen(String),

    #[error("execution of action {action_id} failed: {source}")]
    Execution {
        action_id: String,
        #[source]
        source: StoreError,
    },
}

/// Trigger thresholds. Any satisfied threshold triggers the rule.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AutoRuleConditions {
    #[serde(default)]
    pub pnl_above: Option<f64>,
    #[serde(default)]
    pub pnl_below: Option<f64>,
    #[serde(default)]
    pub confluence_below: Option<f64>,
    /// Points lost since the previous reading
    #[serde(default)]
    pub confluence_drop: Option<f64>,
    /// Percent of price still above the stop
    #[serde(default)]
    pub stop_distance_below: Option<f64>,
}

impl AutoRuleConditions {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Reason for the first satisfied threshold, if any.
    pub fn triggered_by(
        &self,
        pnl_pct: Option<f64>,
        confluence: Option<f64>,
        previous_confluence: Option<f64>,
        stop_distance_pct: Option<f64>,
    ) -> Option<String> {
        if let (Some(limit), Some(pnl)) = (self.pnl_above, pnl_pct) {
            if pnl >= limit {
                return Some(format!("P&L {:.1}% reached {:.1}%", pnl, limit));
            }
        }
        if let (Some(limit), Some(pnl)) = (self.pnl_below, pnl_pct) {
            if pnl <= limit {
                return Some(format!("P&L {:.1}% fell to {:.1}%", pnl, limit));
            }
        }
        if let (Some(limit), Some(score)) = (self.confluence_below, confluence) {
            if score < limit {
                return Some(format!("Confluence {:.0} below {:.0}", score, limit));
            }
        }
        if let (Some(limit), Some(score), Some(previous)) =
            (self.confluence_drop, confluence, previous_confluence)
        {
            let drop = previous - score;
            if drop >= limit {
                return Some(format!("Confluence dropped {:.0} points", drop));
            }
        }
        if let (Some(limit), Some(distance)) = (self.stop_distance_below, stop_distance_pct) {
            if distance < limit {
                return Some(format!("Price {:.1}% from stop", distance));
            }
        }
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "to", rename_all = "snake_case")]
pub enum StopTarget {
    Breakeven,
    Price { price: Decimal },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum TrailMode {
    Breakeven,
    /// Give back at most `fraction` of the move since entry
    Retrace { fraction: f64 },
}

impl TrailMode {
    /// New stop for a position entered at `entry` and marked at `current`.
    ///
    /// `None` when there is no gain to protect.
    pub fn stop_for(&self, entry: Decimal, current: Decimal) -> Option<Decimal> {
        if current <= entry {
            return None;
        }
        let stop = match self {
            TrailMode::Breakeven => entry,
            TrailMode::Retrace { fraction } => {
                let fraction = Decimal::from_f64_retain(fraction.clamp(0.0, 1.0))?;
                entry + (current - entry) * (dec!(1) - fraction)
            }
        };
        Some(round_to_tick(stop, PRICE_TICK))
    }
}

/// What a rule does when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AutoRuleAction {
    Trim { percent: u32 },
    Exit,
    #[serde(rename = "MOVE_SL")]
    MoveStopLoss { target: StopTarget },
    TrailStop { trail: TrailMode },
}

impl AutoRuleAction {
    pub fn type_name(&self) -> &'static str {
        match self {
            AutoRuleAction::Trim { .. } => "TRIM",
            AutoRuleAction::Exit => "EXIT",
            AutoRuleAction::MoveStopLoss { .. } => "MOVE_SL",
            AutoRuleAction::TrailStop { .. } => "TRAIL_STOP",
        }
    }
}

/// A user-defined automation policy scoped to one trade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoRule {
    pub id: String,
    pub trade_id: String,
    pub name: String,
    pub enabled: bool,
    pub conditions: AutoRuleConditions,
    pub action: AutoRuleAction,
    pub created_at: DateTime<Utc>,
    pub last_triggered: Option<DateTime<Utc>>,
}

impl AutoRule {
    pub fn new(trade_id: &str, name: &str, conditions: AutoRuleConditions, action: AutoRuleAction) -> Self {
        let now = Utc::now();
        Self {
            id: next_id("rule", now),
            trade_id: trade_id.to_string(),
            name: name.to_string(),
            enabled: true,
            conditions,
            action,
            created_at: now,
            last_triggered: None,
        }
    }

    pub fn validate(&self) -> Result<(), AutomationError> {
        if self.conditions.is_empty() {
            return Err(AutomationError::InvalidRule(format!(
                "rule {} has no trigger conditions",
                self.name
            )));
        }
        match self.action {
            AutoRuleAction::Trim { percent } if percent == 0 || percent >= 100 => {
                Err(AutomationError::InvalidRule(format!(
                    "trim percent {} must be between 1 and 99",
                    percent
                )))
            }
            AutoRuleAction::TrailStop {
                trail: TrailMode::Retrace { fraction },
            } if !(0.0..=1.0).contains(&fraction) => Err(AutomationError::InvalidRule(format!(
                "retrace fraction {} must be within 0..1",
                fraction
            ))),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ActionStatus {
    Pending,
    Approved,
    Executed,
    Rejected,
}

impl ActionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ActionStatus::Executed | ActionStatus::Rejected)
    }
}

impl fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ActionStatus::Pending => "PENDING",
            ActionStatus::Approved => "APPROVED",
            ActionStatus::Executed => "EXECUTED",
            ActionStatus::Rejected => "REJECTED",
        };
        write!(f, "{}", s)
    }
}

/// Type-specific parameters, computed when the action is proposed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionPayload {
    Trim { percent: u32, price: Decimal },
    Exit { price: Decimal },
    #[serde(rename = "MOVE_SL")]
    MoveStopLoss { stop_loss: Decimal },
    TrailStop { stop_loss: Decimal, trail: TrailMode },
}

impl ActionPayload {
    /// Build the payload for `action` on `trade` at `price`.
    ///
    /// `None` when the action cannot apply, e.g. trailing a losing position.
    pub fn build(action: &AutoRuleAction, trade: &Trade, price: Decimal) -> Option<Self> {
        match *action {
            AutoRuleAction::Trim { percent } => Some(ActionPayload::Trim { percent, price }),
            AutoRuleAction::Exit => Some(ActionPayload::Exit { price }),
            AutoRuleAction::MoveStopLoss { target } => {
                let stop_loss = match target {
                    StopTarget::Breakeven => trade.entry_price?,
                    StopTarget::Price { price } => price,
                };
                Some(ActionPayload::MoveStopLoss { stop_loss })
            }
            AutoRuleAction::TrailStop { trail } => {
                let stop_loss = trail.stop_for(trade.entry_price?, price)?;
                Some(ActionPayload::TrailStop { stop_loss, trail })
            }
        }
    }

    pub fn describe(&self, ticker: &str) -> String {
        match self {
            ActionPayload::Trim { percent, price } => {
                format!("Trim {}% of {} at {}", percent, ticker, price)
            }
            ActionPayload::Exit { price } => format!("Exit {} at {}", ticker, price),
            ActionPayload::MoveStopLoss { stop_loss } => {
                format!("Move {} stop loss to {}", ticker, stop_loss)
            }
            ActionPayload::TrailStop { stop_loss, .. } => {
                format!("Trail {} stop loss to {}", ticker, stop_loss)
            }
        }
    }
}

/// A proposed adjustment awaiting, or past, human approval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoAction {
    pub id: String,
    pub rule_id: String,
    pub trade_id: String,
    pub ticker: String,
    pub status: ActionStatus,
    pub description: String,
    pub payload: ActionPayload,
    pub trigger_reason: String,
    pub created_at: DateTime<Utc>,
    pub approved_by: Option<String>,
    pub approved_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub rejection_reason: Option<String>,
}

impl AutoAction {
    pub fn pending(rule: &AutoRule, trade: &Trade, payload: ActionPayload, trigger_reason: String) -> Self {
        let now = Utc::now();
        Self {
            id: next_id("action", now),
            rule_id: rule.id.clone(),
            trade_id: trade.id.clone(),
            ticker: trade.ticker.clone(),
            status: ActionStatus::Pending,
            description: payload.describe(&trade.ticker),
            payload,
            trigger_reason,
            created_at: now,
            approved_by: None,
            approved_at: None,
            resolved_at: None,
            rejection_reason: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == ActionStatus::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trail_modes() {
        assert_eq!(TrailMode::Breakeven.stop_for(dec!(4), dec!(6)), Some(dec!(4)));
        assert_eq!(
            TrailMode::Retrace { fraction: 0.5 }.stop_for(dec!(4), dec!(6)),
            Some(dec!(5))
        );
        assert_eq!(
            TrailMode::Retrace { fraction: 0.25 }.stop_for(dec!(2), dec!(3)),
            Some(dec!(2.75))
        );
        assert_eq!(TrailMode::Breakeven.stop_for(dec!(4), dec!(3.5)), None);
    }

    #[test]
    fn test_conditions_any_triggers() {
        let conditions = AutoRuleConditions {
            pnl_above: Some(50.0),
            confluence_drop: Some(20.0),
            ..Default::default()
        };
        assert!(conditions.triggered_by(Some(10.0), Some(70.0), Some(75.0), None).is_none());
        assert!(conditions.triggered_by(Some(55.0), None, None, None).is_some());
        let reason = conditions
            .triggered_by(Some(10.0), Some(50.0), Some(75.0), None)
            .unwrap();
        assert!(reason.contains("25"));
    }

    #[test]
    fn test_rule_validation() {
        let empty = AutoRule::new("t", "empty", AutoRuleConditions::default(), AutoRuleAction::Exit);
        assert!(empty.validate().is_err());

        let conditions = AutoRuleConditions {
            pnl_below: Some(-20.0),
            ..Default::default()
        };
        let bad_trim = AutoRule::new("t", "trim", conditions.clone(), AutoRuleAction::Trim { percent: 100 });
        assert!(bad_trim.validate().is_err());

        let ok = AutoRule::new("t", "exit", conditions, AutoRuleAction::Exit);
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn test_action_type_wire_names() {
        let action = AutoRuleAction::MoveStopLoss {
            target: StopTarget::Breakeven,
        };
        let json = serde_json::to_value(action).unwrap();
        assert_eq!(json["type"], "MOVE_SL");
        assert_eq!(action.type_name(), "MOVE_SL");
        assert_eq!(serde_json::to_value(ActionStatus::Pending).unwrap(), "PENDING");
    }
}
