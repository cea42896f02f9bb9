//! Escalation rule engine.
//!
//! Evaluates every registered rule against a trade context and keeps the
//! resulting alerts per trade, with cooldown deduplication and a per-trade cap.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use tracing::{debug, info, warn};

use super::alert::Alert;
use super::context::TradeContext;
use super::rules::{default_rules, EscalationRule, RuleError};
use crate::config::EscalationConfig;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EscalationStats {
    pub evaluations: u64,
    pub alerts_created: u64,
    pub suppressed_by_cooldown: u64,
    pub evicted: u64,
    pub rule_errors: u64,
}

pub struct EscalationRuleEngine {
    config: EscalationConfig,
    rules: Vec<EscalationRule>,
    /// Oldest first
    alerts: HashMap<String, VecDeque<Alert>>,
    stats: EscalationStats,
}

impl EscalationRuleEngine {
    /// Engine with the built-in rule set.
    pub fn new(config: EscalationConfig) -> Self {
        let mut engine = Self::empty(config);
        engine.rules = default_rules();
        engine
    }

    /// Engine with no rules registered.
    pub fn empty(config: EscalationConfig) -> Self {
        Self {
            config,
            rules: Vec::new(),
            alerts: HashMap::new(),
            stats: EscalationStats::default(),
        }
    }

    /// Add a rule at runtime. Registered rules are never replaced.
    pub fn register_rule(&mut self, rule: EscalationRule) -> Result<(), RuleError> {
        rule.validate()?;
        if self.rules.iter().any(|r| r.id == rule.id) {
            return Err(RuleError::DuplicateRule(rule.id));
        }
        info!(rule_id = %rule.id, severity = %rule.severity, "Registered escalation rule");
        self.rules.push(rule);
        Ok(())
    }

    pub fn rules(&self) -> &[EscalationRule] {
        &self.rules
    }

    pub fn check_escalation(&mut self, ctx: &TradeContext) -> Vec<Alert> {
        self.check_escalation_at(ctx, Utc::now())
    }

    /// Evaluate all rules and store the alerts that survive deduplication.
    ///
    /// A rule that cannot be evaluated is logged and skipped.
    pub fn check_escalation_at(&mut self, ctx: &TradeContext, now: DateTime<Utc>) -> Vec<Alert> {
        self.stats.evaluations += 1;

        let mut fired = Vec::new();
        for rule in &self.rules {
            match rule.evaluate(ctx) {
                Ok(true) => fired.push(
                    Alert::new(
                        &ctx.trade_id,
                        &ctx.ticker,
                        &rule.id,
                        rule.severity,
                        rule.category,
                        rule.title.clone(),
                        rule.render_message(ctx),
                        now,
                    )
                    .with_action(rule.action.as_ref().map(|a| a.build(ctx)))
                    .with_estimated(ctx.is_estimated()),
                ),
                Ok(false) => {}
                Err(RuleError::MissingInput(input)) => {
                    debug!(rule_id = %rule.id, trade_id = %ctx.trade_id, input, "Rule skipped, input unavailable");
                }
                Err(e) => {
                    self.stats.rule_errors += 1;
                    warn!(rule_id = %rule.id, trade_id = %ctx.trade_id, error = %e, "Rule evaluation failed");
                }
            }
        }

        let mut created = Vec::new();
        for alert in fired {
            if self.in_cooldown(&alert, now) {
                self.stats.suppressed_by_cooldown += 1;
                debug!(
                    trade_id = %alert.trade_id,
                    category = %alert.category,
                    severity = %alert.severity,
                    "Alert suppressed by cooldown"
                );
                continue;
            }
            self.store(alert.clone());
            self.stats.alerts_created += 1;
            created.push(alert);
        }
        created
    }

    fn in_cooldown(&self, alert: &Alert, now: DateTime<Utc>) -> bool {
        let window = Duration::seconds(self.config.cooldown_secs as i64);
        self.alerts.get(&alert.trade_id).is_some_and(|alerts| {
            alerts
                .iter()
                .any(|a| a.same_kind(alert) && !a.dismissed && now - a.created_at < window)
        })
    }

    fn store(&mut self, alert: Alert) {
        let max = self.config.max_alerts_per_trade.max(1);
        let alerts = self.alerts.entry(alert.trade_id.clone()).or_default();

        while alerts.len() >= max {
            let victim = alerts
                .iter()
                .position(|a| !a.dismissed)
                .unwrap_or(0);
            if let Some(evicted) = alerts.remove(victim) {
                self.stats.evicted += 1;
                debug!(alert_id = %evicted.id, trade_id = %evicted.trade_id, "Evicted alert at per-trade cap");
            }
        }
        alerts.push_back(alert);
    }

    fn find_mut(&mut self, alert_id: &str) -> Option<&mut Alert> {
        self.alerts
            .values_mut()
            .flat_map(|alerts| alerts.iter_mut())
            .find(|a| a.id == alert_id)
    }

    /// Returns false if the alert no longer exists.
    pub fn mark_read(&mut self, alert_id: &str) -> bool {
        match self.find_mut(alert_id) {
            Some(alert) => {
                alert.read = true;
                true
            }
            None => false,
        }
    }

    pub fn dismiss(&mut self, alert_id: &str) -> bool {
        match self.find_mut(alert_id) {
            Some(alert) => {
                alert.dismissed = true;
                alert.read = true;
                true
            }
            None => false,
        }
    }

    /// Drop every alert for a closed trade. Returns how many were removed.
    pub fn clear_trade(&mut self, trade_id: &str) -> usize {
        let removed = self.alerts.remove(trade_id).map_or(0, |a| a.len());
        if removed > 0 {
            info!(trade_id = %trade_id, removed, "Cleared alerts for closed trade");
        }
        removed
    }

    /// Oldest first.
    pub fn alerts_for_trade(&self, trade_id: &str) -> Vec<Alert> {
        self.alerts
            .get(trade_id)
            .map(|a| a.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Non-dismissed alerts across all trades, newest first.
    pub fn active_alerts(&self) -> Vec<Alert> {
        let mut alerts: Vec<Alert> = self
            .alerts
            .values()
            .flat_map(|a| a.iter())
            .filter(|a| !a.dismissed)
            .cloned()
            .collect();
        alerts.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        alerts
    }

    pub fn unread_count(&self) -> usize {
        self.alerts
            .values()
            .flat_map(|a| a.iter())
            .filter(|a| !a.read && !a.dismissed)
            .count()
    }

    pub fn tracked_trades(&self) -> Vec<String> {
        self.alerts.keys().cloned().collect()
    }

    pub fn stats(&self) -> EscalationStats {
        self.stats
    }
}
