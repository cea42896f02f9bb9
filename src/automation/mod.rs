//! Automated position adjustments behind an approval gate.
//!
//! - `types`: rules, trigger conditions, proposed actions and their statuses
//! - `manager`: `AutoPositionManager`, rule evaluation and the approval pipeline

mod manager;
mod types;

pub use manager::AutoPositionManager;
pub use types::{
    ActionPayload, ActionStatus, AutoAction, AutoRule, AutoRuleAction, AutoRuleConditions,
    AutomationError, StopTarget, TrailMode,
};
