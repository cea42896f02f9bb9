//! Human-approved position automation.
//!
//! Rules propose actions; nothing touches a trade until an action is approved.
//! Action states: PENDING -> APPROVED -> EXECUTED, or PENDING -> REJECTED.
//! A failed execution ends in REJECTED.
//!
//! Rules and actions are process-local and do not survive a restart.

use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::types::{
    ActionPayload, ActionStatus, AutoAction, AutoRule, AutomationError,
};
use crate::trade::{StoreError, Trade, TradeLifecycleStore, TradeState};

#[derive(Debug, Default)]
struct AutomationBook {
    rules: Vec<AutoRule>,
    actions: Vec<AutoAction>,
}

impl AutomationBook {
    fn action_mut(&mut self, id: &str) -> Result<&mut AutoAction, AutomationError> {
        self.actions
            .iter_mut()
            .find(|a| a.id == id)
            .ok_or_else(|| AutomationError::ActionNotFound(id.to_string()))
    }

    fn has_pending(&self, rule_id: &str) -> bool {
        self.actions
            .iter()
            .any(|a| a.rule_id == rule_id && a.is_pending())
    }
}

fn reject(action: &mut AutoAction, reason: &str) {
    action.status = ActionStatus::Rejected;
    action.rejection_reason = Some(reason.to_string());
    action.resolved_at = Some(Utc::now());
}

/// Owns automation rules and the action approval pipeline.
#[derive(Clone)]
pub struct AutoPositionManager {
    store: Arc<TradeLifecycleStore>,
    book: Arc<RwLock<AutomationBook>>,
}

impl AutoPositionManager {
    pub fn new(store: Arc<TradeLifecycleStore>) -> Self {
        Self {
            store,
            book: Arc::new(RwLock::new(AutomationBook::default())),
        }
    }

    // ------------------------------------------------------------------
    // Rules
    // ------------------------------------------------------------------

    pub async fn add_rule(&self, rule: AutoRule) -> Result<AutoRule, AutomationError> {
        rule.validate()?;
        info!(
            rule_id = %rule.id,
            trade_id = %rule.trade_id,
            action = rule.action.type_name(),
            "Automation rule added"
        );
        self.book.write().await.rules.push(rule.clone());
        Ok(rule)
    }

    /// Remove a rule; its pending action, if any, is rejected.
    pub async fn remove_rule(&self, rule_id: &str) -> Result<AutoRule, AutomationError> {
        let mut book = self.book.write().await;
        let pos = book
            .rules
            .iter()
            .position(|r| r.id == rule_id)
            .ok_or_else(|| AutomationError::RuleNotFound(rule_id.to_string()))?;
        let rule = book.rules.remove(pos);

        for action in book
            .actions
            .iter_mut()
            .filter(|a| a.rule_id == rule_id && a.is_pending())
        {
            reject(action, "rule removed");
        }
        info!(rule_id = %rule_id, "Automation rule removed");
        Ok(rule)
    }

    /// Flip a rule's enabled flag. Returns the new value.
    pub async fn toggle_rule(&self, rule_id: &str) -> Result<bool, AutomationError> {
        let mut book = self.book.write().await;
        let rule = book
            .rules
            .iter_mut()
            .find(|r| r.id == rule_id)
            .ok_or_else(|| AutomationError::RuleNotFound(rule_id.to_string()))?;
        rule.enabled = !rule.enabled;
        debug!(rule_id = %rule_id, enabled = rule.enabled, "Automation rule toggled");
        Ok(rule.enabled)
    }

    pub async fn rules_for_trade(&self, trade_id: &str) -> Vec<AutoRule> {
        self.book
            .read()
            .await
            .rules
            .iter()
            .filter(|r| r.trade_id == trade_id)
            .cloned()
            .collect()
    }

    // ------------------------------------------------------------------
    // Triggering
    // ------------------------------------------------------------------

    /// Evaluate the trade's enabled rules and propose actions for those that fire.
    ///
    /// Returns only newly created actions.
    pub async fn check_rules(
        &self,
        trade: &Trade,
        current_price: Decimal,
        confluence: Option<f64>,
        previous_confluence: Option<f64>,
    ) -> Vec<AutoAction> {
        if trade.state != TradeState::Entered {
            return Vec::new();
        }

        let pnl = trade.pnl_pct_at(current_price);
        let stop_distance = trade.distance_to_stop_pct(current_price);

        let triggered: Vec<(AutoRule, String)> = {
            let book = self.book.read().await;
            book.rules
                .iter()
                .filter(|r| r.enabled && r.trade_id == trade.id)
                .filter_map(|r| {
                    r.conditions
                        .triggered_by(pnl, confluence, previous_confluence, stop_distance)
                        .map(|reason| (r.clone(), reason))
                })
                .collect()
        };

        let mut created = Vec::new();
        for (rule, reason) in triggered {
            if let Some(action) = self
                .create_pending_action(&rule, trade, current_price, reason)
                .await
            {
                created.push(action);
            }
        }
        created
    }

    /// Propose an action for a fired rule.
    ///
    /// Does nothing while the rule already has a PENDING action, or when the
    /// action cannot apply at this price.
    pub async fn create_pending_action(
        &self,
        rule: &AutoRule,
        trade: &Trade,
        price: Decimal,
        reason: String,
    ) -> Option<AutoAction> {
        let Some(payload) = ActionPayload::build(&rule.action, trade, price) else {
            debug!(rule_id = %rule.id, trade_id = %trade.id, "Rule fired but action does not apply");
            return None;
        };

        let mut book = self.book.write().await;
        if book.has_pending(&rule.id) {
            debug!(rule_id = %rule.id, "Pending action already outstanding");
            return None;
        }

        let action = AutoAction::pending(rule, trade, payload, reason);
        if let Some(stored) = book.rules.iter_mut().find(|r| r.id == rule.id) {
            stored.last_triggered = Some(action.created_at);
        }
        book.actions.push(action.clone());

        info!(
            action_id = %action.id,
            rule_id = %rule.id,
            trade_id = %trade.id,
            description = %action.description,
            reason = %action.trigger_reason,
            "Automation action proposed"
        );
        Some(action)
    }

    // ------------------------------------------------------------------
    // Approval pipeline
    // ------------------------------------------------------------------

    /// PENDING -> APPROVED, then execute in the background.
    pub async fn approve_action(
        &self,
        action_id: &str,
        approver: &str,
    ) -> Result<JoinHandle<Result<AutoAction, AutomationError>>, AutomationError> {
        {
            let mut book = self.book.write().await;
            let action = book.action_mut(action_id)?;
            if action.status != ActionStatus::Pending {
                return Err(AutomationError::InvalidStatus {
                    id: action_id.to_string(),
                    actual: action.status,
                    expected: ActionStatus::Pending,
                });
            }
            action.status = ActionStatus::Approved;
            action.approved_by = Some(approver.to_string());
            action.approved_at = Some(Utc::now());
            info!(action_id = %action_id, approver = %approver, "Automation action approved");
        }

        let manager = self.clone();
        let id = action_id.to_string();
        Ok(tokio::spawn(async move { manager.execute(&id).await }))
    }

    /// PENDING -> REJECTED. Terminal.
    pub async fn reject_action(&self, action_id: &str, reason: &str) -> Result<AutoAction, AutomationError> {
        let mut book = self.book.write().await;
        let action = book.action_mut(action_id)?;
        if action.status != ActionStatus::Pending {
            return Err(AutomationError::InvalidStatus {
                id: action_id.to_string(),
                actual: action.status,
                expected: ActionStatus::Pending,
            });
        }
        reject(action, reason);
        info!(action_id = %action_id, reason = %reason, "Automation action rejected");
        Ok(action.clone())
    }

    /// APPROVED -> EXECUTED by applying the effect through the store.
    ///
    /// Any failure moves the action to REJECTED.
    async fn execute(&self, action_id: &str) -> Result<AutoAction, AutomationError> {
        let action = {
            let book = self.book.read().await;
            let action = book
                .actions
                .iter()
                .find(|a| a.id == action_id)
                .cloned()
                .ok_or_else(|| AutomationError::ActionNotFound(action_id.to_string()))?;
            if action.status != ActionStatus::Approved {
                return Err(AutomationError::InvalidStatus {
                    id: action_id.to_string(),
                    actual: action.status,
                    expected: ActionStatus::Approved,
                });
            }
            action
        };

        let outcome = self.apply_effect(&action).await;

        let mut book = self.book.write().await;
        let stored = book.action_mut(action_id)?;
        match outcome {
            Ok(()) => {
                stored.status = ActionStatus::Executed;
                stored.resolved_at = Some(Utc::now());
                info!(
                    action_id = %action_id,
                    trade_id = %stored.trade_id,
                    description = %stored.description,
                    "Automation action executed"
                );
                Ok(stored.clone())
            }
            Err(e) => {
                reject(stored, &format!("execution failed: {}", e));
                error!(action_id = %action_id, error = %e, "Automation action failed, rejected");
                Err(e)
            }
        }
    }

    async fn apply_effect(&self, action: &AutoAction) -> Result<(), AutomationError> {
        let trade = self
            .store
            .get_trade(&action.trade_id)
            .await
            .filter(|t| t.state == TradeState::Entered)
            .ok_or_else(|| AutomationError::TradeNotOpen(action.trade_id.clone()))?;
        let mark = |proposed: Decimal| trade.current_price.unwrap_or(proposed);

        let result = match action.payload {
            ActionPayload::Trim { percent, price } => self
                .store
                .trim_trade(&trade.id, mark(price), percent)
                .await
                .map(|_| ()),
            ActionPayload::Exit { price } => self.store.exit_trade(&trade.id, mark(price)).await.map(|_| ()),
            ActionPayload::MoveStopLoss { stop_loss } => {
                self.store.update_stop(&trade.id, stop_loss).await.map(|_| ())
            }
            ActionPayload::TrailStop { stop_loss, trail } => {
                // Recompute from the latest mark; keep the proposal if the gain is gone
                let recomputed = trade
                    .entry_price
                    .zip(trade.current_price)
                    .and_then(|(entry, current)| trail.stop_for(entry, current))
                    .map_or(stop_loss, |s| s.max(stop_loss));
                self.store.trail_stop(&trade.id, recomputed).await.map(|_| ())
            }
        };

        match result {
            Ok(()) => Ok(()),
            // Applied locally; the repository catches up on the next reconcile
            Err(StoreError::Repository { context, source }) => {
                warn!(action_id = %action.id, context = %context, error = %source, "Action applied locally only");
                Ok(())
            }
            Err(source) => Err(AutomationError::Execution {
                action_id: action.id.clone(),
                source,
            }),
        }
    }

    // ------------------------------------------------------------------
    // Queries and cleanup
    // ------------------------------------------------------------------

    pub async fn get_action(&self, action_id: &str) -> Option<AutoAction> {
        self.book
            .read()
            .await
            .actions
            .iter()
            .find(|a| a.id == action_id)
            .cloned()
    }

    pub async fn pending_actions(&self) -> Vec<AutoAction> {
        self.book
            .read()
            .await
            .actions
            .iter()
            .filter(|a| a.is_pending())
            .cloned()
            .collect()
    }

    pub async fn actions_for_trade(&self, trade_id: &str) -> Vec<AutoAction> {
        self.book
            .read()
            .await
            .actions
            .iter()
            .filter(|a| a.trade_id == trade_id)
            .cloned()
            .collect()
    }

    /// Drop a closed trade's rules and reject its pending actions.
    ///
    /// Returns (rules removed, actions rejected).
    pub async fn clear_trade(&self, trade_id: &str) -> (usize, usize) {
        let mut book = self.book.write().await;
        let before = book.rules.len();
        book.rules.retain(|r| r.trade_id != trade_id);
        let removed = before - book.rules.len();

        let mut rejected = 0;
        for action in book
            .actions
            .iter_mut()
            .filter(|a| a.trade_id == trade_id && a.is_pending())
        {
            reject(action, "trade closed");
            rejected += 1;
        }

        if removed > 0 || rejected > 0 {
            info!(trade_id = %trade_id, removed, rejected, "Cleared automation for closed trade");
        }
        (removed, rejected)
    }
}
