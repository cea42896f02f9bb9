//! Trade lifecycle store.
//!
//! Local mirror of the repository's trades, split across three lists:
//! - preview: at most one unpersisted WATCHING trade
//! - active: LOADED and ENTERED trades
//! - history: EXITED trades
//!
//! A trade id lives in exactly one list, and that list always matches its
//! state. Every mutation runs as one read-modify-write under the write lock
//! with no await point inside, then writes through to the repository.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, error, info, warn};

use super::events::StoreEvent;
use super::repository::TradeRepository;
use super::types::{Trade, TradeList, TradePatch, TradeState, TradeUpdate, TradeUpdateKind};
use crate::config::StoreConfig;
use crate::market::{MarketDataProvider, OptionContract};

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("trade {0} not found")]
    NotFound(String),

    #[error("invalid transition for trade {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: TradeState,
        to: TradeState,
    },

    #[error("invalid price {price} for trade {id}")]
    InvalidPrice { id: String, price: Decimal },

    /// The local change was kept; the repository did not accept it.
    #[error("repository error ({context}): {source}")]
    Repository {
        context: String,
        #[source]
        source: anyhow::Error,
    },
}

/// The three lists plus the focus pointer.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TradeLists {
    pub preview: Option<Trade>,
    pub active: Vec<Trade>,
    pub history: Vec<Trade>,
    pub focused_trade_id: Option<String>,
}

impl TradeLists {
    pub fn locate(&self, id: &str) -> Option<TradeList> {
        if self.preview.as_ref().is_some_and(|t| t.id == id) {
            Some(TradeList::Preview)
        } else if self.active.iter().any(|t| t.id == id) {
            Some(TradeList::Active)
        } else if self.history.iter().any(|t| t.id == id) {
            Some(TradeList::History)
        } else {
            None
        }
    }

    pub fn get(&self, id: &str) -> Option<&Trade> {
        self.preview
            .iter()
            .chain(self.active.iter())
            .chain(self.history.iter())
            .find(|t| t.id == id)
    }

    /// Remove a trade from whichever list holds it.
    fn take(&mut self, id: &str) -> Option<Trade> {
        if self.preview.as_ref().is_some_and(|t| t.id == id) {
            return self.preview.take();
        }
        if let Some(pos) = self.active.iter().position(|t| t.id == id) {
            return Some(self.active.remove(pos));
        }
        if let Some(pos) = self.history.iter().position(|t| t.id == id) {
            return Some(self.history.remove(pos));
        }
        None
    }

    /// Insert into the list matching the trade's state. A previous preview is discarded.
    fn place(&mut self, trade: Trade) {
        match trade.state.list() {
            TradeList::Preview => {
                if let Some(old) = self.preview.replace(trade) {
                    debug!(trade_id = %old.id, "Discarded previous preview");
                }
            }
            TradeList::Active => self.active.push(trade),
            TradeList::History => self.history.push(trade),
        }
    }

    fn all(&self) -> impl Iterator<Item = (TradeList, &Trade)> {
        self.preview
            .iter()
            .map(|t| (TradeList::Preview, t))
            .chain(self.active.iter().map(|t| (TradeList::Active, t)))
            .chain(self.history.iter().map(|t| (TradeList::History, t)))
    }

    /// Every id appears once, in the list its state selects.
    pub fn check_invariants(&self) -> Result<(), String> {
        let mut seen = HashSet::new();
        for (list, trade) in self.all() {
            if !seen.insert(trade.id.as_str()) {
                return Err(format!("trade {} appears in more than one list", trade.id));
            }
            if trade.state.list() != list {
                return Err(format!(
                    "trade {} in {:?} list has state {}",
                    trade.id, list, trade.state
                ));
            }
        }
        Ok(())
    }

    /// Recompute membership from state, keeping the most recently updated copy of each id.
    fn rebuild(&mut self) {
        let mut latest: HashMap<String, Trade> = HashMap::new();
        let mut order = Vec::new();
        for trade in self
            .preview
            .take()
            .into_iter()
            .chain(self.active.drain(..))
            .chain(self.history.drain(..))
        {
            match latest.get(&trade.id) {
                Some(existing) if existing.updated_at >= trade.updated_at => {}
                Some(_) => {
                    latest.insert(trade.id.clone(), trade);
                }
                None => {
                    order.push(trade.id.clone());
                    latest.insert(trade.id.clone(), trade);
                }
            }
        }
        for id in order {
            if let Some(trade) = latest.remove(&id) {
                self.place(trade);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.active.len() + self.history.len() + usize::from(self.preview.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Counts from one reconciliation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileSummary {
    pub active: usize,
    pub history: usize,
    pub preview_kept: bool,
    /// Local trades the repository no longer reports
    pub dropped: usize,
    /// Open trades moved to EXITED because their contract expired
    pub expired: usize,
    pub duplicates: usize,
    /// Local copies kept over an older remote copy
    pub kept_local: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Applied(ReconcileSummary),
    /// Another reconciliation was already running
    Skipped,
}

/// An open trade closed during reconciliation because its contract expired.
#[derive(Debug, Clone)]
struct ExpiredTrade {
    trade_id: String,
    from: TradeState,
    patch: TradePatch,
}

/// Result of one atomic mutation.
#[derive(Debug, Clone)]
struct Mutation {
    before: Trade,
    after: Trade,
}

/// Clears the in-flight flag when dropped.
struct ReconcileGuard<'a>(&'a AtomicBool);

impl<'a> ReconcileGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for ReconcileGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Authoritative in-memory mirror of the trade repository.
pub struct TradeLifecycleStore {
    user_id: String,
    repository: Arc<dyn TradeRepository>,
    settlement_source: Option<Arc<dyn MarketDataProvider>>,
    lists: RwLock<TradeLists>,
    reconciling: AtomicBool,
    events: broadcast::Sender<StoreEvent>,
    strict_invariants: bool,
}

impl TradeLifecycleStore {
    pub fn new(user_id: &str, repository: Arc<dyn TradeRepository>, config: &StoreConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            user_id: user_id.to_string(),
            repository,
            settlement_source: None,
            lists: RwLock::new(TradeLists::default()),
            reconciling: AtomicBool::new(false),
            events,
            strict_invariants: config.strict_invariants,
        }
    }

    /// Resolve expired contracts' exit prices from underlying closes.
    pub fn with_settlement_source(mut self, market: Arc<dyn MarketDataProvider>) -> Self {
        self.settlement_source = Some(market);
        self
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Receive store events. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: StoreEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }

    fn verify(&self, lists: &mut TradeLists) {
        if let Err(violation) = lists.check_invariants() {
            if self.strict_invariants {
                panic!("trade list invariant violated: {}", violation);
            }
            error!(violation = %violation, "Trade list invariant violated, rebuilding membership");
            lists.rebuild();
        }
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    pub async fn get_trade(&self, id: &str) -> Option<Trade> {
        self.lists.read().await.get(id).cloned()
    }

    pub async fn locate(&self, id: &str) -> Option<TradeList> {
        self.lists.read().await.locate(id)
    }

    pub async fn preview(&self) -> Option<Trade> {
        self.lists.read().await.preview.clone()
    }

    pub async fn active_trades(&self) -> Vec<Trade> {
        self.lists.read().await.active.clone()
    }

    pub async fn history(&self) -> Vec<Trade> {
        self.lists.read().await.history.clone()
    }

    /// Active trades in the ENTERED state.
    pub async fn entered_trades(&self) -> Vec<Trade> {
        self.lists
            .read()
            .await
            .active
            .iter()
            .filter(|t| t.state == TradeState::Entered)
            .cloned()
            .collect()
    }

    pub async fn focused_trade(&self) -> Option<Trade> {
        let lists = self.lists.read().await;
        let id = lists.focused_trade_id.as_deref()?;
        lists.get(id).cloned()
    }

    /// Consistent copy of all lists.
    pub async fn snapshot(&self) -> TradeLists {
        self.lists.read().await.clone()
    }

    // ------------------------------------------------------------------
    // Focus and preview
    // ------------------------------------------------------------------

    /// Create a WATCHING preview for a contract and focus it.
    pub async fn create_preview(
        &self,
        contract: OptionContract,
        target_price: Option<Decimal>,
        stop_loss: Option<Decimal>,
    ) -> Trade {
        let trade = Trade::watching(&self.user_id, contract, Utc::now())
            .with_levels(target_price, stop_loss);
        self.focus_preview(trade.clone()).await;
        trade
    }

    /// Replace the preview slot and point focus at it in one step.
    pub async fn focus_preview(&self, mut trade: Trade) {
        trade.state = TradeState::Watching;
        let id = trade.id.clone();
        {
            let mut lists = self.lists.write().await;
            // The id must not survive elsewhere
            lists.take(&id);
            lists.place(trade);
            lists.focused_trade_id = Some(id.clone());
            self.verify(&mut lists);
        }
        self.publish(StoreEvent::TradeAdded {
            trade_id: id.clone(),
            state: TradeState::Watching,
        });
        self.publish(StoreEvent::FocusChanged { trade_id: Some(id) });
    }

    /// Focus an existing trade. A different preview is discarded in the same step.
    pub async fn set_focused_trade(&self, id: &str) -> Result<(), StoreError> {
        {
            let mut lists = self.lists.write().await;
            if lists.get(id).is_none() {
                return Err(StoreError::NotFound(id.to_string()));
            }
            if lists.preview.as_ref().is_some_and(|p| p.id != id) {
                lists.preview = None;
            }
            lists.focused_trade_id = Some(id.to_string());
            self.verify(&mut lists);
        }
        self.publish(StoreEvent::FocusChanged {
            trade_id: Some(id.to_string()),
        });
        Ok(())
    }

    /// Clear focus and the preview slot together.
    pub async fn clear_focus(&self) {
        {
            let mut lists = self.lists.write().await;
            lists.focused_trade_id = None;
            lists.preview = None;
            self.verify(&mut lists);
        }
        self.publish(StoreEvent::FocusChanged { trade_id: None });
    }

    // ------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------

    /// Atomic read-modify-write of one trade, moving it to the list its new state selects.
    async fn mutate<F>(&self, id: &str, f: F) -> Result<Mutation, StoreError>
    where
        F: FnOnce(&mut Trade),
    {
        let now = Utc::now();
        let mut lists = self.lists.write().await;

        let before = lists
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        let mut after = before.clone();
        f(&mut after);

        if !before.state.can_transition_to(after.state) {
            return Err(StoreError::InvalidTransition {
                id: id.to_string(),
                from: before.state,
                to: after.state,
            });
        }

        after.updated_at = now;
        after.refresh_derived();

        lists.take(id);
        lists.place(after.clone());
        self.verify(&mut lists);

        Ok(Mutation { before, after })
    }

    fn publish_mutation(&self, mutation: &Mutation) {
        let trade_id = mutation.after.id.clone();
        if mutation.before.state != mutation.after.state {
            info!(
                trade_id = %trade_id,
                from = %mutation.before.state,
                to = %mutation.after.state,
                "Trade transitioned"
            );
            self.publish(StoreEvent::TradeTransitioned {
                trade_id,
                from: mutation.before.state,
                to: mutation.after.state,
            });
        } else {
            self.publish(StoreEvent::TradeUpdated { trade_id });
        }
    }

    /// Write a confirmed local change through to the repository.
    async fn persist(&self, mutation: &Mutation, patch: &TradePatch) -> Result<(), StoreError> {
        let id = &mutation.after.id;
        let result = match (mutation.before.state, mutation.after.state) {
            (_, TradeState::Watching) => return Ok(()),
            (TradeState::Watching, _) => self.repository.create(&mutation.after).await.map(|_| ()),
            _ => self.repository.update(id, patch).await,
        };

        result.map_err(|source| {
            warn!(trade_id = %id, error = %source, "Repository write failed, keeping local state");
            StoreError::Repository {
                context: format!("write trade {}", id),
                source,
            }
        })
    }

    /// Merge fields into a trade, move it to the list its state selects and persist.
    ///
    /// On a repository failure the local change is kept and the error returned.
    pub async fn apply_patch(&self, id: &str, patch: TradePatch) -> Result<Trade, StoreError> {
        let now = Utc::now();
        let mut patch = patch;
        let mutation = self
            .mutate(id, |trade| {
                let exiting = patch.state == Some(TradeState::Exited) && trade.state != TradeState::Exited;
                if exiting && patch.exit_time.is_none() && trade.exit_time.is_none() {
                    patch.exit_time = Some(now);
                }
                patch.apply_to(trade);
            })
            .await?;

        self.publish_mutation(&mutation);
        self.persist(&mutation, &patch).await?;
        Ok(mutation.after)
    }

    /// Alias kept for callers that think in terms of "update".
    pub async fn update_trade(&self, id: &str, patch: TradePatch) -> Result<Trade, StoreError> {
        self.apply_patch(id, patch).await
    }

    fn require_price(id: &str, price: Decimal) -> Result<(), StoreError> {
        if price <= Decimal::ZERO {
            return Err(StoreError::InvalidPrice {
                id: id.to_string(),
                price,
            });
        }
        Ok(())
    }

    /// WATCHING -> LOADED. First persistence of a preview.
    pub async fn load_trade(&self, id: &str) -> Result<Trade, StoreError> {
        self.apply_patch(id, TradePatch::new().state(TradeState::Loaded)).await
    }

    /// Open the position at `price`.
    pub async fn enter_trade(&self, id: &str, price: Decimal) -> Result<Trade, StoreError> {
        Self::require_price(id, price)?;
        let now = Utc::now();
        let patch = TradePatch::new()
            .state(TradeState::Entered)
            .entry(price, now)
            .current_price(price)
            .append(TradeUpdate::new(TradeUpdateKind::Enter, price, now));
        self.apply_patch(id, patch).await
    }

    /// Close the position at `price`.
    pub async fn exit_trade(&self, id: &str, price: Decimal) -> Result<Trade, StoreError> {
        let now = Utc::now();
        let pnl = self.get_trade(id).await.and_then(|t| t.pnl_pct_at(price));
        let patch = TradePatch::new()
            .state(TradeState::Exited)
            .exit(price, now)
            .current_price(price)
            .append(TradeUpdate::new(TradeUpdateKind::Exit, price, now).with_pnl(pnl));
        self.apply_patch(id, patch).await
    }

    /// Record a partial exit. The position stays open.
    pub async fn trim_trade(&self, id: &str, price: Decimal, percent: u32) -> Result<Trade, StoreError> {
        Self::require_price(id, price)?;
        let now = Utc::now();
        let pnl = self.get_trade(id).await.and_then(|t| t.pnl_pct_at(price));
        let patch = TradePatch::new().current_price(price).append(
            TradeUpdate::new(TradeUpdateKind::Trim, price, now)
                .with_pnl(pnl)
                .with_note(format!("Trimmed {}% of position", percent)),
        );
        self.apply_patch(id, patch).await
    }

    /// Record adding to the position.
    pub async fn add_to_trade(&self, id: &str, price: Decimal) -> Result<Trade, StoreError> {
        Self::require_price(id, price)?;
        let now = Utc::now();
        let patch = TradePatch::new()
            .current_price(price)
            .append(TradeUpdate::new(TradeUpdateKind::Add, price, now));
        self.apply_patch(id, patch).await
    }

    pub async fn update_stop(&self, id: &str, stop_loss: Decimal) -> Result<Trade, StoreError> {
        let now = Utc::now();
        let patch = TradePatch::new()
            .stop_loss(stop_loss)
            .append(TradeUpdate::new(TradeUpdateKind::UpdateStop, stop_loss, now));
        self.apply_patch(id, patch).await
    }

    pub async fn trail_stop(&self, id: &str, stop_loss: Decimal) -> Result<Trade, StoreError> {
        let now = Utc::now();
        let patch = TradePatch::new()
            .stop_loss(stop_loss)
            .append(TradeUpdate::new(TradeUpdateKind::TrailStop, stop_loss, now));
        self.apply_patch(id, patch).await
    }

    /// Note that price is approaching the target.
    pub async fn flag_target_near(&self, id: &str, price: Decimal) -> Result<Trade, StoreError> {
        let now = Utc::now();
        let pnl = self.get_trade(id).await.and_then(|t| t.pnl_pct_at(price));
        let patch = TradePatch::new()
            .current_price(price)
            .append(TradeUpdate::new(TradeUpdateKind::TpNear, price, now).with_pnl(pnl));
        self.apply_patch(id, patch).await
    }

    /// Local-only price refresh from the polling loop. Not persisted, no event.
    pub async fn record_mark(&self, id: &str, price: Decimal) -> Result<Trade, StoreError> {
        Self::require_price(id, price)?;
        let mutation = self
            .mutate(id, |trade| trade.current_price = Some(price))
            .await?;
        Ok(mutation.after)
    }

    /// Remove a trade from every list and from the repository.
    pub async fn delete_trade(&self, id: &str) -> Result<Trade, StoreError> {
        let removed = {
            let mut lists = self.lists.write().await;
            let removed = lists
                .take(id)
                .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
            if lists.focused_trade_id.as_deref() == Some(id) {
                lists.focused_trade_id = None;
            }
            self.verify(&mut lists);
            removed
        };

        info!(trade_id = %id, state = %removed.state, "Trade deleted");
        self.publish(StoreEvent::TradeRemoved {
            trade_id: id.to_string(),
        });

        if removed.state != TradeState::Watching {
            self.repository
                .delete(id)
                .await
                .map_err(|source| StoreError::Repository {
                    context: format!("delete trade {}", id),
                    source,
                })?;
        }
        Ok(removed)
    }

    // ------------------------------------------------------------------
    // Reconciliation
    // ------------------------------------------------------------------

    /// Fetch the user's trades and reconcile. Coalesced with any run already in flight.
    pub async fn reload(&self) -> Result<ReconcileOutcome, StoreError> {
        let Some(_guard) = ReconcileGuard::acquire(&self.reconciling) else {
            debug!("Reconciliation already in flight, skipping reload");
            return Ok(ReconcileOutcome::Skipped);
        };

        let fetched_at = Utc::now();
        let remote = self
            .repository
            .list_trades(&self.user_id)
            .await
            .map_err(|source| StoreError::Repository {
                context: format!("list trades for {}", self.user_id),
                source,
            })?;

        Ok(ReconcileOutcome::Applied(
            self.reconcile_unguarded(remote, fetched_at).await,
        ))
    }

    /// Merge an authoritative snapshot into the local lists.
    pub async fn reconcile(&self, remote: Vec<Trade>) -> ReconcileOutcome {
        let Some(_guard) = ReconcileGuard::acquire(&self.reconciling) else {
            debug!("Reconciliation already in flight, skipping");
            return ReconcileOutcome::Skipped;
        };
        let taken_at = Utc::now();
        ReconcileOutcome::Applied(self.reconcile_unguarded(remote, taken_at).await)
    }

    /// `fetched_at` is when the snapshot was requested; local changes after it win.
    async fn reconcile_unguarded(
        &self,
        remote: Vec<Trade>,
        fetched_at: DateTime<Utc>,
    ) -> ReconcileSummary {
        let now = Utc::now();
        let settlements = self.resolve_settlements(&remote, now).await;

        let (summary, expired) = {
            let mut lists = self.lists.write().await;
            let result = merge_remote(&mut lists, remote, &settlements, fetched_at, now);
            self.verify(&mut lists);
            result
        };

        for exit in &expired {
            self.publish(StoreEvent::TradeTransitioned {
                trade_id: exit.trade_id.clone(),
                from: exit.from,
                to: TradeState::Exited,
            });
        }
        self.publish(StoreEvent::Reconciled {
            active: summary.active,
            history: summary.history,
            expired: summary.expired,
        });

        for exit in expired {
            if let Err(e) = self.repository.update(&exit.trade_id, &exit.patch).await {
                warn!(trade_id = %exit.trade_id, error = %e, "Failed to persist expiry exit");
            }
        }

        info!(
            active = summary.active,
            history = summary.history,
            dropped = summary.dropped,
            expired = summary.expired,
            kept_local = summary.kept_local,
            "Reconciled trades"
        );
        summary
    }

    /// Underlying closes for open trades whose contract has expired.
    async fn resolve_settlements(
        &self,
        remote: &[Trade],
        now: DateTime<Utc>,
    ) -> HashMap<String, Decimal> {
        let mut closes = HashMap::new();
        let Some(market) = &self.settlement_source else {
            return closes;
        };

        for trade in remote
            .iter()
            .filter(|t| t.state != TradeState::Exited && t.contract.is_expired(now))
        {
            match market
                .get_daily_close(&trade.contract.underlying, trade.contract.expiry)
                .await
            {
                Ok(Some(close)) => {
                    closes.insert(trade.id.clone(), close);
                }
                Ok(None) => {
                    debug!(trade_id = %trade.id, "No settlement close available");
                }
                Err(e) => {
                    warn!(trade_id = %trade.id, error = %e, "Settlement close lookup failed");
                }
            }
        }
        closes
    }
}

/// Patch that closes an expired trade at intrinsic value.
fn expiry_patch(trade: &Trade, settlement_close: Option<Decimal>) -> TradePatch {
    let at = trade.contract.expiry_datetime();
    let (price, estimated) = match settlement_close {
        Some(close) => (trade.contract.intrinsic_value(close), false),
        None => (trade.current_price.unwrap_or(Decimal::ZERO), true),
    };

    let note = if estimated {
        "Contract expired, exit price estimated (no settlement close)"
    } else {
        "Contract expired"
    };
    let update = TradeUpdate::new(TradeUpdateKind::Exit, price, at)
        .with_pnl(trade.pnl_pct_at(price))
        .with_note(note);

    TradePatch::new()
        .state(TradeState::Exited)
        .exit(price, at)
        .current_price(price)
        .append(update)
}

/// Collapse repeated ids to the most recently updated copy, keeping first-seen order.
fn latest_by_id(remote: Vec<Trade>) -> (Vec<Trade>, usize) {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut unique: Vec<Trade> = Vec::with_capacity(remote.len());
    let mut duplicates = 0;

    for trade in remote {
        match index.get(&trade.id) {
            Some(&i) => {
                warn!(trade_id = %trade.id, "Repository returned duplicate trade id");
                duplicates += 1;
                if trade.updated_at > unique[i].updated_at {
                    unique[i] = trade;
                }
            }
            None => {
                index.insert(trade.id.clone(), unique.len());
                unique.push(trade);
            }
        }
    }
    (unique, duplicates)
}

/// Choose between the local and remote copy of one trade.
///
/// Returns the winner and whether it was the local copy.
fn prefer_local(local: &Trade, mut remote: Trade, fetched_at: DateTime<Utc>) -> (Trade, bool) {
    if local.updated_at > fetched_at {
        debug!(trade_id = %local.id, "Local change is newer than the snapshot, keeping it");
        return (local.clone(), true);
    }
    if local.state == TradeState::Exited && remote.state != TradeState::Exited {
        warn!(
            trade_id = %local.id,
            remote_state = %remote.state,
            "Repository still reports a locally exited trade as open, keeping the exit"
        );
        return (local.clone(), true);
    }

    // Marks are local-only, so the local one stands unless the record moved on since
    if let Some(mark) = local.current_price {
        if remote.current_price.is_none() || local.updated_at > remote.updated_at {
            remote.current_price = Some(mark);
        }
    }
    (remote, false)
}

/// Replace the lists with the remote snapshot.
///
/// Deterministic for a given (lists, remote, settlements, fetched_at): applying
/// the same snapshot twice yields the same lists. Local trades changed after
/// `fetched_at` are newer than the snapshot and are kept as they are, and a
/// local EXITED trade never goes back to an open state.
fn merge_remote(
    lists: &mut TradeLists,
    remote: Vec<Trade>,
    settlements: &HashMap<String, Decimal>,
    fetched_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> (ReconcileSummary, Vec<ExpiredTrade>) {
    let mut summary = ReconcileSummary::default();
    let mut expired = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    let local: HashMap<&str, &Trade> = lists
        .active
        .iter()
        .chain(lists.history.iter())
        .map(|t| (t.id.as_str(), t))
        .collect();

    let mut next = TradeLists {
        focused_trade_id: lists.focused_trade_id.clone(),
        ..TradeLists::default()
    };

    let (remote, duplicates) = latest_by_id(remote);
    summary.duplicates = duplicates;

    for remote_trade in remote {
        seen.insert(remote_trade.id.clone());

        if remote_trade.state == TradeState::Watching {
            if lists.preview.as_ref().is_some_and(|p| p.id == remote_trade.id) {
                next.preview = Some(remote_trade);
            } else {
                warn!(trade_id = %remote_trade.id, "Ignoring persisted WATCHING trade");
            }
            continue;
        }

        let mut trade = match local.get(remote_trade.id.as_str()) {
            Some(mine) => {
                let (winner, kept) = prefer_local(mine, remote_trade, fetched_at);
                summary.kept_local += usize::from(kept);
                winner
            }
            None => remote_trade,
        };

        if trade.state != TradeState::Exited && trade.contract.is_expired(now) {
            let from = trade.state;
            let patch = expiry_patch(&trade, settlements.get(&trade.id).copied());
            patch.apply_to(&mut trade);
            info!(
                trade_id = %trade.id,
                exit_price = ?trade.exit_price,
                "Expired contract moved to history"
            );
            summary.expired += 1;
            expired.push(ExpiredTrade {
                trade_id: trade.id.clone(),
                from,
                patch,
            });
        }

        trade.refresh_derived();
        next.place(trade);
    }

    // Created or changed after the fetch started, so the snapshot cannot know them yet
    for trade in lists
        .active
        .iter()
        .chain(lists.history.iter())
    {
        if !(trade.updated_at > fetched_at && !seen.contains(&trade.id)) {
            continue;
        }
        debug!(trade_id = %trade.id, "Keeping local trade newer than the snapshot");
        seen.insert(trade.id.clone());
        summary.kept_local += 1;
        next.place(trade.clone());
    }

    if next.preview.is_none() {
        if let Some(preview) = lists.preview.take() {
            if !seen.contains(&preview.id) {
                next.preview = Some(preview);
            }
        }
    }
    summary.preview_kept = next.preview.is_some();

    summary.dropped = lists
        .active
        .iter()
        .chain(lists.history.iter())
        .filter(|t| !seen.contains(&t.id))
        .count();

    if let Some(focused) = next.focused_trade_id.as_deref() {
        if next.get(focused).is_none() {
            next.focused_trade_id = None;
        }
    }

    summary.active = next.active.len();
    summary.history = next.history.len();
    *lists = next;
    (summary, expired)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::{MockMarketData, OptionType};
    use crate::trade::repository::{InMemoryTradeRepository, MockTradeRepository};
    use anyhow::anyhow;
    use async_trait::async_trait;
    use chrono::{Duration, NaiveDate};
    use rust_decimal_macros::dec;
    use tokio::sync::Notify;

    /// Repository whose listing pauses until released, to interleave local writes.
    struct PausedListing {
        trades: Vec<Trade>,
        listing: Notify,
        release: Notify,
    }

    impl PausedListing {
        fn new(trades: Vec<Trade>) -> Self {
            Self {
                trades,
                listing: Notify::new(),
                release: Notify::new(),
            }
        }
    }

    #[async_trait]
    impl TradeRepository for PausedListing {
        async fn list_trades(&self, _user_id: &str) -> anyhow::Result<Vec<Trade>> {
            let snapshot = self.trades.clone();
            self.listing.notify_one();
            self.release.notified().await;
            Ok(snapshot)
        }

        async fn create(&self, trade: &Trade) -> anyhow::Result<Trade> {
            Ok(trade.clone())
        }

        async fn update(&self, _id: &str, _patch: &TradePatch) -> anyhow::Result<()> {
            Ok(())
        }

        async fn delete(&self, _id: &str) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn contract(expiry: NaiveDate) -> OptionContract {
        OptionContract::new("SPY", dec!(450), expiry, OptionType::Call)
    }

    fn future_contract() -> OptionContract {
        contract(NaiveDate::from_ymd_opt(2099, 1, 16).unwrap())
    }

    fn stored(state: TradeState) -> Trade {
        let mut trade = Trade::watching("user-1", future_contract(), Utc::now());
        trade.state = state;
        if state != TradeState::Loaded {
            trade.entry_price = Some(dec!(4));
        }
        if state == TradeState::Exited {
            trade.exit_price = Some(dec!(5));
        }
        trade
    }

    fn store_with(repo: InMemoryTradeRepository) -> TradeLifecycleStore {
        TradeLifecycleStore::new(
            "user-1",
            Arc::new(repo),
            &StoreConfig {
                strict_invariants: true,
            },
        )
    }

    async fn assert_consistent(store: &TradeLifecycleStore) {
        let snapshot = store.snapshot().await;
        assert!(snapshot.check_invariants().is_ok(), "{:?}", snapshot.check_invariants());
    }

    #[tokio::test]
    async fn test_reconcile_places_by_state() {
        let loaded = stored(TradeState::Loaded);
        let entered = stored(TradeState::Entered);
        let exited = stored(TradeState::Exited);
        let store = store_with(InMemoryTradeRepository::with_trades(vec![
            loaded.clone(),
            entered.clone(),
            exited.clone(),
        ]));

        let outcome = store.reload().await.unwrap();
        let ReconcileOutcome::Applied(summary) = outcome else {
            panic!("reload skipped");
        };
        assert_eq!(summary.active, 2);
        assert_eq!(summary.history, 1);

        assert_eq!(store.locate(&loaded.id).await, Some(TradeList::Active));
        assert_eq!(store.locate(&entered.id).await, Some(TradeList::Active));
        assert_eq!(store.locate(&exited.id).await, Some(TradeList::History));
        assert_eq!(store.entered_trades().await.len(), 1);
        assert_consistent(&store).await;
    }

    #[tokio::test]
    async fn test_reconcile_is_idempotent() {
        let mut expired = stored(TradeState::Entered);
        expired.contract = contract(NaiveDate::from_ymd_opt(2020, 3, 20).unwrap());
        expired.current_price = Some(dec!(1.5));

        let remote = vec![
            stored(TradeState::Entered),
            stored(TradeState::Exited),
            expired,
        ];
        let store = store_with(InMemoryTradeRepository::new());

        store.reconcile(remote.clone()).await;
        let first = store.snapshot().await;
        store.reconcile(remote).await;
        let second = store.snapshot().await;

        assert_eq!(first, second);
        assert_eq!(first.history.len(), 2);
    }

    #[tokio::test]
    async fn test_reconcile_drops_trades_missing_remotely() {
        let keep = stored(TradeState::Entered);
        let gone = stored(TradeState::Entered);
        let store = store_with(InMemoryTradeRepository::new());

        store.reconcile(vec![keep.clone(), gone.clone()]).await;
        store.set_focused_trade(&gone.id).await.unwrap();

        let ReconcileOutcome::Applied(summary) = store.reconcile(vec![keep.clone()]).await else {
            panic!("reconcile skipped");
        };
        assert_eq!(summary.dropped, 1);
        assert!(store.get_trade(&gone.id).await.is_none());
        assert!(store.focused_trade().await.is_none());
    }

    #[tokio::test]
    async fn test_reconcile_keeps_local_preview() {
        let store = store_with(InMemoryTradeRepository::new());
        let preview = store.create_preview(future_contract(), None, None).await;

        store.reconcile(vec![stored(TradeState::Entered)]).await;
        assert_eq!(store.preview().await.map(|p| p.id), Some(preview.id));
        assert_consistent(&store).await;
    }

    #[tokio::test]
    async fn test_expired_contract_exits_at_intrinsic_value() {
        let expiry = NaiveDate::from_ymd_opt(2020, 3, 20).unwrap();
        let mut trade = stored(TradeState::Entered);
        trade.contract = contract(expiry);

        let market = MockMarketData::new();
        market.set_daily_close("SPY", expiry, dec!(456.25)).await;

        let repo = InMemoryTradeRepository::with_trades(vec![trade.clone()]);
        let store = store_with(repo.clone()).with_settlement_source(Arc::new(market));
        store.reload().await.unwrap();

        let exited = store.get_trade(&trade.id).await.unwrap();
        assert_eq!(exited.state, TradeState::Exited);
        assert_eq!(exited.exit_price, Some(dec!(6.25)));
        assert_eq!(exited.exit_time, Some(contract(expiry).expiry_datetime()));
        assert_eq!(store.locate(&trade.id).await, Some(TradeList::History));

        // Written back to the repository
        assert_eq!(repo.get(&trade.id).await.unwrap().state, TradeState::Exited);
    }

    #[tokio::test]
    async fn test_expired_without_close_uses_last_mark() {
        let mut trade = stored(TradeState::Entered);
        trade.contract = contract(NaiveDate::from_ymd_opt(2020, 3, 20).unwrap());
        trade.current_price = Some(dec!(0.35));
        let store = store_with(InMemoryTradeRepository::new());

        store.reconcile(vec![trade.clone()]).await;
        let exited = store.get_trade(&trade.id).await.unwrap();
        assert_eq!(exited.exit_price, Some(dec!(0.35)));
        assert!(exited
            .updates
            .last()
            .and_then(|u| u.note.as_deref())
            .unwrap()
            .contains("estimated"));
    }

    #[tokio::test]
    async fn test_concurrent_reload_is_coalesced() {
        let store = store_with(InMemoryTradeRepository::new());
        let _held = ReconcileGuard::acquire(&store.reconciling).unwrap();

        assert_eq!(store.reload().await.unwrap(), ReconcileOutcome::Skipped);
        assert_eq!(store.reconcile(Vec::new()).await, ReconcileOutcome::Skipped);
    }

    #[tokio::test]
    async fn test_patch_exit_moves_to_history() {
        let trade = stored(TradeState::Entered);
        let store = store_with(InMemoryTradeRepository::with_trades(vec![trade.clone()]));
        store.reload().await.unwrap();

        let patch = TradePatch::new()
            .state(TradeState::Exited)
            .exit_price(dec!(5));
        let updated = store.apply_patch(&trade.id, patch).await.unwrap();
        assert_eq!(updated.state, TradeState::Exited);
        assert!(updated.exit_time.is_some());

        let snapshot = store.snapshot().await;
        assert!(snapshot.active.iter().all(|t| t.id != trade.id));
        let copies: Vec<_> = snapshot.history.iter().filter(|t| t.id == trade.id).collect();
        assert_eq!(copies.len(), 1);
        assert_eq!(copies[0].state, TradeState::Exited);
        assert_consistent(&store).await;
    }

    #[tokio::test]
    async fn test_full_lifecycle_persists() {
        let repo = InMemoryTradeRepository::new();
        let store = store_with(repo.clone());

        let preview = store
            .create_preview(future_contract(), Some(dec!(8)), Some(dec!(2)))
            .await;
        assert_eq!(store.locate(&preview.id).await, Some(TradeList::Preview));
        assert_eq!(repo.len().await, 0);

        store.load_trade(&preview.id).await.unwrap();
        assert_eq!(store.locate(&preview.id).await, Some(TradeList::Active));
        assert!(store.preview().await.is_none());
        assert_eq!(repo.len().await, 1);

        store.enter_trade(&preview.id, dec!(4)).await.unwrap();
        store.trim_trade(&preview.id, dec!(6), 50).await.unwrap();
        store.update_stop(&preview.id, dec!(4)).await.unwrap();
        let exited = store.exit_trade(&preview.id, dec!(7)).await.unwrap();

        assert_eq!(exited.updates.len(), 4);
        assert_eq!(exited.updates[3].pnl_pct, Some(75.0));
        assert_eq!(store.locate(&preview.id).await, Some(TradeList::History));

        let persisted = repo.get(&preview.id).await.unwrap();
        assert_eq!(persisted.state, TradeState::Exited);
        assert_eq!(persisted.stop_loss, Some(dec!(4)));
        assert_eq!(persisted.updates.len(), 4);
    }

    #[tokio::test]
    async fn test_invalid_transition_rejected() {
        let trade = stored(TradeState::Exited);
        let store = store_with(InMemoryTradeRepository::with_trades(vec![trade.clone()]));
        store.reload().await.unwrap();

        let err = store.enter_trade(&trade.id, dec!(3)).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
        assert_eq!(store.locate(&trade.id).await, Some(TradeList::History));
    }

    #[tokio::test]
    async fn test_repository_failure_keeps_local_change() {
        let trade = stored(TradeState::Entered);
        let mut repo = MockTradeRepository::new();
        let listed = vec![trade.clone()];
        repo.expect_list_trades()
            .returning(move |_| Ok(listed.clone()));
        repo.expect_update()
            .times(1)
            .returning(|_, _| Err(anyhow!("connection reset")));

        let store = TradeLifecycleStore::new(
            "user-1",
            Arc::new(repo),
            &StoreConfig {
                strict_invariants: true,
            },
        );
        store.reload().await.unwrap();

        let err = store.update_stop(&trade.id, dec!(3)).await.unwrap_err();
        assert!(matches!(err, StoreError::Repository { .. }));
        assert_eq!(store.get_trade(&trade.id).await.unwrap().stop_loss, Some(dec!(3)));
    }

    #[tokio::test]
    async fn test_focus_and_preview_move_together() {
        let entered = stored(TradeState::Entered);
        let store = store_with(InMemoryTradeRepository::with_trades(vec![entered.clone()]));
        store.reload().await.unwrap();

        let preview = store.create_preview(future_contract(), None, None).await;
        assert_eq!(store.focused_trade().await.map(|t| t.id), Some(preview.id.clone()));

        store.set_focused_trade(&entered.id).await.unwrap();
        assert!(store.preview().await.is_none());
        assert_eq!(store.focused_trade().await.map(|t| t.id), Some(entered.id.clone()));

        store.create_preview(future_contract(), None, None).await;
        store.clear_focus().await;
        assert!(store.preview().await.is_none());
        assert!(store.focused_trade().await.is_none());
        assert!(store.set_focused_trade("missing").await.is_err());
    }

    #[tokio::test]
    async fn test_delete_removes_everywhere() {
        let trade = stored(TradeState::Entered);
        let repo = InMemoryTradeRepository::with_trades(vec![trade.clone()]);
        let store = store_with(repo.clone());
        store.reload().await.unwrap();
        store.set_focused_trade(&trade.id).await.unwrap();

        store.delete_trade(&trade.id).await.unwrap();
        assert!(store.locate(&trade.id).await.is_none());
        assert!(store.focused_trade().await.is_none());
        assert_eq!(repo.len().await, 0);
        assert!(matches!(
            store.delete_trade(&trade.id).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_record_mark_is_local_and_silent() {
        let trade = stored(TradeState::Entered);
        let repo = InMemoryTradeRepository::with_trades(vec![trade.clone()]);
        let store = store_with(repo.clone());
        store.reload().await.unwrap();
        let mut events = store.subscribe();

        let marked = store.record_mark(&trade.id, dec!(5)).await.unwrap();
        assert_eq!(marked.move_pct, Some(25.0));
        assert_eq!(repo.get(&trade.id).await.unwrap().current_price, None);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_exit_during_reload_is_not_reverted() {
        let trade = stored(TradeState::Entered);
        let repo = Arc::new(PausedListing::new(vec![trade.clone()]));
        let store = Arc::new(TradeLifecycleStore::new(
            "user-1",
            repo.clone(),
            &StoreConfig {
                strict_invariants: true,
            },
        ));
        store.reconcile(vec![trade.clone()]).await;

        let reload = tokio::spawn({
            let store = store.clone();
            async move { store.reload().await }
        });
        repo.listing.notified().await;
        store.exit_trade(&trade.id, dec!(5)).await.unwrap();
        repo.release.notify_one();

        let ReconcileOutcome::Applied(summary) = reload.await.unwrap().unwrap() else {
            panic!("reload skipped");
        };
        assert_eq!(summary.kept_local, 1);

        let after = store.get_trade(&trade.id).await.unwrap();
        assert_eq!(after.state, TradeState::Exited);
        assert_eq!(after.exit_price, Some(dec!(5)));
        assert_eq!(store.locate(&trade.id).await, Some(TradeList::History));
        assert!(store.active_trades().await.is_empty());
        assert_consistent(&store).await;
    }

    #[tokio::test]
    async fn test_trade_entered_during_reload_is_kept() {
        let repo = Arc::new(PausedListing::new(Vec::new()));
        let store = Arc::new(TradeLifecycleStore::new(
            "user-1",
            repo.clone(),
            &StoreConfig {
                strict_invariants: true,
            },
        ));

        let reload = tokio::spawn({
            let store = store.clone();
            async move { store.reload().await }
        });
        repo.listing.notified().await;
        let preview = store.create_preview(future_contract(), None, None).await;
        store.enter_trade(&preview.id, dec!(3)).await.unwrap();
        repo.release.notify_one();
        reload.await.unwrap().unwrap();

        assert_eq!(store.locate(&preview.id).await, Some(TradeList::Active));
        assert_consistent(&store).await;
    }

    #[tokio::test]
    async fn test_stale_remote_never_reopens_exited_trade() {
        let trade = stored(TradeState::Entered);
        let store = store_with(InMemoryTradeRepository::new());
        store.reconcile(vec![trade.clone()]).await;
        store.exit_trade(&trade.id, dec!(5)).await.unwrap();

        // The remote copy still says ENTERED, and is fetched after the exit
        store.reconcile(vec![trade.clone()]).await;
        let after = store.get_trade(&trade.id).await.unwrap();
        assert_eq!(after.state, TradeState::Exited);
        assert_eq!(store.locate(&trade.id).await, Some(TradeList::History));
    }

    #[tokio::test]
    async fn test_reload_keeps_local_mark() {
        let trade = stored(TradeState::Entered);
        let repo = InMemoryTradeRepository::with_trades(vec![trade.clone()]);
        let store = store_with(repo.clone());
        store.reload().await.unwrap();

        store.record_mark(&trade.id, dec!(5)).await.unwrap();
        store.reload().await.unwrap();
        let after = store.get_trade(&trade.id).await.unwrap();
        assert_eq!(after.current_price, Some(dec!(5)));
        assert_eq!(after.move_pct, Some(25.0));

        // A newer write from elsewhere carries its own price
        let mut elsewhere = repo.get(&trade.id).await.unwrap();
        elsewhere.current_price = Some(dec!(6));
        elsewhere.updated_at = Utc::now();
        repo.put(elsewhere).await;
        store.reload().await.unwrap();
        assert_eq!(
            store.get_trade(&trade.id).await.unwrap().current_price,
            Some(dec!(6))
        );
    }

    #[tokio::test]
    async fn test_duplicate_ids_keep_latest_copy() {
        let trade = stored(TradeState::Entered);
        let mut newer = trade.clone();
        newer.stop_loss = Some(dec!(2));
        newer.updated_at = trade.updated_at + Duration::seconds(5);
        let store = store_with(InMemoryTradeRepository::new());

        let ReconcileOutcome::Applied(summary) =
            store.reconcile(vec![trade.clone(), newer]).await
        else {
            panic!("reconcile skipped");
        };
        assert_eq!(summary.duplicates, 1);
        assert_eq!(
            store.get_trade(&trade.id).await.unwrap().stop_loss,
            Some(dec!(2))
        );
    }

    #[tokio::test]
    async fn test_events_on_transition() {
        let trade = stored(TradeState::Entered);
        let store = store_with(InMemoryTradeRepository::with_trades(vec![trade.clone()]));
        store.reload().await.unwrap();
        let mut events = store.subscribe();

        store.exit_trade(&trade.id, dec!(3)).await.unwrap();
        assert_eq!(
            events.recv().await.unwrap(),
            StoreEvent::TradeTransitioned {
                trade_id: trade.id.clone(),
                from: TradeState::Entered,
                to: TradeState::Exited,
            }
        );
    }

    #[tokio::test]
    async fn test_lenient_store_self_heals() {
        let store = TradeLifecycleStore::new(
            "user-1",
            Arc::new(InMemoryTradeRepository::new()),
            &StoreConfig {
                strict_invariants: false,
            },
        );
        let trade = stored(TradeState::Entered);
        let mut stale = trade.clone();
        stale.updated_at = trade.updated_at - Duration::seconds(5);
        {
            let mut lists = store.lists.write().await;
            lists.active.push(trade.clone());
            lists.history.push(stale);
            store.verify(&mut lists);
        }

        let snapshot = store.snapshot().await;
        assert!(snapshot.check_invariants().is_ok());
        assert_eq!(snapshot.len(), 1);
        assert_eq!(store.locate(&trade.id).await, Some(TradeList::Active));
    }

    #[tokio::test]
    #[should_panic(expected = "invariant violated")]
    async fn test_strict_store_fails_fast() {
        let store = store_with(InMemoryTradeRepository::new());
        let trade = stored(TradeState::Entered);
        let mut lists = store.lists.write().await;
        lists.history.push(trade);
        store.verify(&mut lists);
    }
}
