//! Risk escalation for open trades.
//!
//! - `context`: per-trade snapshot of price, P&L, flow, Greeks and IV
//! - `rules`: declarative rule descriptors and the built-in rule set
//! - `alert`: severity-tiered alert records
//! - `engine`: rule evaluation with cooldown and per-trade caps

mod alert;
mod context;
mod engine;
mod rules;

pub use alert::{Alert, AlertAction, AlertActionType, AlertCategory, AlertSeverity};
pub use context::{FlowContext, IvContext, TradeContext};
pub use engine::{EscalationRuleEngine, EscalationStats};
pub use rules::{default_rules, render_template, ActionTemplate, EscalationRule, RuleCondition, RuleError};
