//! Trade records, lifecycle states and patches.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::market::OptionContract;
use crate::utils::decimal::{percent_change, to_f64};

static TRADE_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Generate a locally unique trade id.
pub fn next_trade_id(now: DateTime<Utc>) -> String {
    format!(
        "trade-{}-{:04}",
        now.timestamp_millis(),
        TRADE_COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}

/// Lifecycle state. Determines which store list a trade lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeState {
    Watching,
    Loaded,
    Entered,
    Exited,
}

/// The three store lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeList {
    Preview,
    Active,
    History,
}

impl TradeState {
    /// The list a trade in this state must live in.
    pub fn list(&self) -> TradeList {
        match self {
            TradeState::Watching => TradeList::Preview,
            TradeState::Loaded | TradeState::Entered => TradeList::Active,
            TradeState::Exited => TradeList::History,
        }
    }

    pub fn can_transition_to(&self, next: TradeState) -> bool {
        use TradeState::*;
        matches!(
            (self, next),
            (Watching, Watching)
                | (Loaded, Loaded)
                | (Entered, Entered)
                | (Exited, Exited)
                | (Watching, Loaded)
                | (Watching, Entered)
                | (Loaded, Entered)
                | (Loaded, Exited)
                | (Entered, Exited)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TradeState::Watching => "WATCHING",
            TradeState::Loaded => "LOADED",
            TradeState::Entered => "ENTERED",
            TradeState::Exited => "EXITED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "WATCHING" => Some(TradeState::Watching),
            "LOADED" => Some(TradeState::Loaded),
            "ENTERED" => Some(TradeState::Entered),
            "EXITED" => Some(TradeState::Exited),
            _ => None,
        }
    }
}

impl fmt::Display for TradeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TradeUpdateKind {
    Enter,
    Exit,
    Trim,
    Add,
    UpdateStop,
    TrailStop,
    TpNear,
}

/// Append-only audit entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeUpdate {
    pub kind: TradeUpdateKind,
    pub timestamp: DateTime<Utc>,
    pub price: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pnl_pct: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl TradeUpdate {
    pub fn new(kind: TradeUpdateKind, price: Decimal, timestamp: DateTime<Utc>) -> Self {
        Self {
            kind,
            timestamp,
            price,
            pnl_pct: None,
            note: None,
        }
    }

    pub fn with_pnl(mut self, pnl_pct: Option<f64>) -> Self {
        self.pnl_pct = pnl_pct;
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}

/// A tracked option position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub id: String,
    pub user_id: String,
    pub ticker: String,
    pub contract: OptionContract,
    pub state: TradeState,
    pub entry_price: Option<Decimal>,
    pub entry_time: Option<DateTime<Utc>>,
    pub exit_price: Option<Decimal>,
    pub exit_time: Option<DateTime<Utc>>,
    pub current_price: Option<Decimal>,
    pub target_price: Option<Decimal>,
    pub stop_loss: Option<Decimal>,
    #[serde(default)]
    pub updates: Vec<TradeUpdate>,
    /// Percent move of the option price since entry
    #[serde(default)]
    pub move_pct: Option<f64>,
    #[serde(default)]
    pub confluence_score: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Trade {
    /// A fresh, unpersisted preview.
    pub fn watching(user_id: &str, contract: OptionContract, now: DateTime<Utc>) -> Self {
        Self {
            id: next_trade_id(now),
            user_id: user_id.to_string(),
            ticker: contract.underlying.clone(),
            contract,
            state: TradeState::Watching,
            entry_price: None,
            entry_time: None,
            exit_price: None,
            exit_time: None,
            current_price: None,
            target_price: None,
            stop_loss: None,
            updates: Vec::new(),
            move_pct: None,
            confluence_score: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_levels(mut self, target_price: Option<Decimal>, stop_loss: Option<Decimal>) -> Self {
        self.target_price = target_price;
        self.stop_loss = stop_loss;
        self
    }

    pub fn days_to_expiry(&self, now: DateTime<Utc>) -> i64 {
        self.contract.days_to_expiry(now)
    }

    /// P&L percent if the position were marked at `price`.
    pub fn pnl_pct_at(&self, price: Decimal) -> Option<f64> {
        percent_change(self.entry_price?, price)
    }

    /// P&L percent at the exit price if exited, otherwise at the current price.
    pub fn pnl_pct(&self) -> Option<f64> {
        let mark = if self.state == TradeState::Exited {
            self.exit_price
        } else {
            self.current_price
        };
        self.pnl_pct_at(mark?)
    }

    /// Signed room above the stop as a percent of `price` (negative once breached).
    pub fn distance_to_stop_pct(&self, price: Decimal) -> Option<f64> {
        let stop = self.stop_loss?;
        if price <= Decimal::ZERO {
            return None;
        }
        Some(to_f64((price - stop) / price * dec!(100)))
    }

    /// Signed room below the target as a percent of `price` (negative once exceeded).
    pub fn distance_to_target_pct(&self, price: Decimal) -> Option<f64> {
        let target = self.target_price?;
        if price <= Decimal::ZERO {
            return None;
        }
        Some(to_f64((target - price) / price * dec!(100)))
    }

    pub fn is_open(&self) -> bool {
        self.state == TradeState::Entered
    }

    /// Recompute derived fields from prices.
    pub fn refresh_derived(&mut self) {
        self.move_pct = self.pnl_pct();
    }
}

/// Partial update applied atomically by the store and forwarded to the repository.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TradePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<TradeState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_price: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_price: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_price: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_price: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_loss: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confluence_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub append_updates: Vec<TradeUpdate>,
}

impl TradePatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(mut self, state: TradeState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn entry(mut self, price: Decimal, at: DateTime<Utc>) -> Self {
        self.entry_price = Some(price);
        self.entry_time = Some(at);
        self
    }

    pub fn exit(mut self, price: Decimal, at: DateTime<Utc>) -> Self {
        self.exit_price = Some(price);
        self.exit_time = Some(at);
        self
    }

    pub fn exit_price(mut self, price: Decimal) -> Self {
        self.exit_price = Some(price);
        self
    }

    pub fn current_price(mut self, price: Decimal) -> Self {
        self.current_price = Some(price);
        self
    }

    pub fn target_price(mut self, price: Decimal) -> Self {
        self.target_price = Some(price);
        self
    }

    pub fn stop_loss(mut self, price: Decimal) -> Self {
        self.stop_loss = Some(price);
        self
    }

    pub fn confluence(mut self, score: f64) -> Self {
        self.confluence_score = Some(score);
        self
    }

    pub fn append(mut self, update: TradeUpdate) -> Self {
        self.append_updates.push(update);
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Merge into `trade`. Updates are appended, never rewritten.
    pub fn apply_to(&self, trade: &mut Trade) {
        if let Some(state) = self.state {
            trade.state = state;
        }
        if let Some(price) = self.entry_price {
            trade.entry_price = Some(price);
        }
        if let Some(at) = self.entry_time {
            trade.entry_time = Some(at);
        }
        if let Some(price) = self.exit_price {
            trade.exit_price = Some(price);
        }
        if let Some(at) = self.exit_time {
            trade.exit_time = Some(at);
        }
        if let Some(price) = self.current_price {
            trade.current_price = Some(price);
        }
        if let Some(price) = self.target_price {
            trade.target_price = Some(price);
        }
        if let Some(price) = self.stop_loss {
            trade.stop_loss = Some(price);
        }
        if let Some(score) = self.confluence_score {
            trade.confluence_score = Some(score);
        }
        trade.updates.extend(self.append_updates.iter().cloned());
        trade.refresh_derived();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::OptionType;
    use chrono::NaiveDate;

    fn trade() -> Trade {
        let contract = OptionContract::new(
            "SPY",
            dec!(450),
            NaiveDate::from_ymd_opt(2030, 1, 18).unwrap(),
            OptionType::Call,
        );
        Trade::watching("user-1", contract, Utc::now())
    }

    #[test]
    fn test_state_lists() {
        assert_eq!(TradeState::Watching.list(), TradeList::Preview);
        assert_eq!(TradeState::Loaded.list(), TradeList::Active);
        assert_eq!(TradeState::Entered.list(), TradeList::Active);
        assert_eq!(TradeState::Exited.list(), TradeList::History);
    }

    #[test]
    fn test_transitions() {
        assert!(TradeState::Watching.can_transition_to(TradeState::Loaded));
        assert!(TradeState::Loaded.can_transition_to(TradeState::Entered));
        assert!(TradeState::Entered.can_transition_to(TradeState::Exited));
        assert!(!TradeState::Exited.can_transition_to(TradeState::Entered));
        assert!(!TradeState::Entered.can_transition_to(TradeState::Watching));
        assert!(!TradeState::Entered.can_transition_to(TradeState::Loaded));
    }

    #[test]
    fn test_ids_are_unique() {
        let now = Utc::now();
        assert_ne!(next_trade_id(now), next_trade_id(now));
    }

    #[test]
    fn test_pnl_and_distances() {
        let mut t = trade().with_levels(Some(dec!(6)), Some(dec!(3)));
        t.entry_price = Some(dec!(4));
        t.current_price = Some(dec!(5));

        assert_eq!(t.pnl_pct(), Some(25.0));
        assert_eq!(t.distance_to_stop_pct(dec!(5)), Some(40.0));
        assert_eq!(t.distance_to_target_pct(dec!(5)), Some(20.0));
        assert_eq!(t.distance_to_stop_pct(dec!(2.5)), Some(-20.0));
    }

    #[test]
    fn test_patch_appends_updates() {
        let mut t = trade();
        let now = Utc::now();
        TradePatch::new()
            .state(TradeState::Entered)
            .entry(dec!(2.5), now)
            .current_price(dec!(3))
            .append(TradeUpdate::new(TradeUpdateKind::Enter, dec!(2.5), now))
            .apply_to(&mut t);

        assert_eq!(t.state, TradeState::Entered);
        assert_eq!(t.updates.len(), 1);
        assert_eq!(t.move_pct, Some(20.0));

        TradePatch::new()
            .append(TradeUpdate::new(TradeUpdateKind::Trim, dec!(3), now).with_note("Trimmed 50%"))
            .apply_to(&mut t);
        assert_eq!(t.updates.len(), 2);
        assert_eq!(t.updates[0].kind, TradeUpdateKind::Enter);
    }

    #[test]
    fn test_update_kind_wire_names() {
        let json = serde_json::to_string(&TradeUpdateKind::UpdateStop).unwrap();
        assert_eq!(json, "\"update-stop\"");
        let json = serde_json::to_string(&TradeState::Entered).unwrap();
        assert_eq!(json, "\"ENTERED\"");
    }
}
