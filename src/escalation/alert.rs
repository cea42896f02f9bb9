//! Alert records produced by the escalation engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{error, info, warn};

static ALERT_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Severity tiers, lowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AlertSeverity {
    Info,
    Warning,
    Urgent,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Info => "INFO",
            AlertSeverity::Warning => "WARNING",
            AlertSeverity::Urgent => "URGENT",
            AlertSeverity::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertCategory {
    Loss,
    StopLoss,
    Target,
    Profit,
    Theta,
    Gamma,
    Volatility,
    Flow,
    Momentum,
    Confluence,
    Expiration,
}

impl AlertCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertCategory::Loss => "loss",
            AlertCategory::StopLoss => "stop_loss",
            AlertCategory::Target => "target",
            AlertCategory::Profit => "profit",
            AlertCategory::Theta => "theta",
            AlertCategory::Gamma => "gamma",
            AlertCategory::Volatility => "volatility",
            AlertCategory::Flow => "flow",
            AlertCategory::Momentum => "momentum",
            AlertCategory::Confluence => "confluence",
            AlertCategory::Expiration => "expiration",
        }
    }
}

impl fmt::Display for AlertCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What the alert's button does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AlertActionType {
    Exit,
    Trim,
    MoveStop,
    Review,
}

impl AlertActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertActionType::Exit => "exit",
            AlertActionType::Trim => "trim",
            AlertActionType::MoveStop => "move-stop",
            AlertActionType::Review => "review",
        }
    }
}

/// Actionability metadata attached to an alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertAction {
    pub label: String,
    pub action_type: AlertActionType,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub trade_id: String,
    pub ticker: String,
    pub rule_id: String,
    pub severity: AlertSeverity,
    pub category: AlertCategory,
    pub title: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
    pub read: bool,
    pub dismissed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<AlertAction>,
    /// Built from estimated Greeks or stale data
    #[serde(default)]
    pub estimated: bool,
}

impl Alert {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        trade_id: &str,
        ticker: &str,
        rule_id: &str,
        severity: AlertSeverity,
        category: AlertCategory,
        title: String,
        message: String,
        created_at: DateTime<Utc>,
    ) -> Self {
        let id = format!(
            "alert-{}-{}",
            created_at.timestamp_millis(),
            ALERT_COUNTER.fetch_add(1, Ordering::Relaxed)
        );

        Self {
            id,
            trade_id: trade_id.to_string(),
            ticker: ticker.to_string(),
            rule_id: rule_id.to_string(),
            severity,
            category,
            title,
            message,
            created_at,
            read: false,
            dismissed: false,
            action: None,
            estimated: false,
        }
    }

    pub fn with_action(mut self, action: Option<AlertAction>) -> Self {
        self.action = action;
        self
    }

    pub fn with_estimated(mut self, estimated: bool) -> Self {
        self.estimated = estimated;
        self
    }

    /// Same trade, category and severity.
    pub fn same_kind(&self, other: &Alert) -> bool {
        self.trade_id == other.trade_id
            && self.category == other.category
            && self.severity == other.severity
    }

    /// Emit as structured log for downstream parsing.
    pub fn emit(&self) {
        let json = serde_json::to_string(self).unwrap_or_default();

        match self.severity {
            AlertSeverity::Info => info!(target: "cockpit_alert", "TRADE_ALERT: {}", json),
            AlertSeverity::Warning => warn!(target: "cockpit_alert", "TRADE_ALERT: {}", json),
            AlertSeverity::Urgent => error!(target: "cockpit_alert", "TRADE_ALERT: {}", json),
            AlertSeverity::Critical => error!(target: "cockpit_alert", "TRADE_ALERT: {}", json),
        }
    }
}
