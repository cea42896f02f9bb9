//! Monitoring orchestration.
//!
//! The MonitoringOrchestrator drives one fixed-interval loop over all ENTERED
//! trades. Per trade, strictly in order:
//! - market context fetch (option snapshot, bars, confluence, earnings)
//! - flow analysis and IV gating
//! - Greeks validation
//! - context build and rule evaluation
//! - automation checks
//!
//! Trades are evaluated concurrently within a tick, each under a timeout.
//! A tick that fires while the previous one is still running is skipped.

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use futures_util::future::join_all;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::analysis::{
    FlowAnalyzer, GreeksValidator, IvGatingAdvisor, IvHistoryTracker, ValidationStats,
};
use crate::automation::{AutoAction, AutoPositionManager};
use crate::config::Config;
use crate::escalation::{Alert, EscalationRuleEngine, TradeContext};
use crate::market::MarketDataProvider;
use crate::notify::NotificationChannel;
use crate::trade::{StoreEvent, Trade, TradeLifecycleStore, TradeState};
use crate::utils::decimal::to_f64;

/// Rolling analyzer state shared across ticks.
struct Analyzers {
    flow: FlowAnalyzer,
    /// IV history per contract (OCC symbol); strikes and sides never share a series
    iv: IvHistoryTracker,
    /// Trade id -> OCC symbol it records IV under
    iv_keys: HashMap<String, String>,
    advisor: IvGatingAdvisor,
    /// Confluence seen on the previous tick, per trade
    last_confluence: HashMap<String, f64>,
}

/// Counters since construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MonitorStats {
    pub ticks_run: u64,
    pub ticks_skipped: u64,
    pub trades_evaluated: u64,
    pub trade_failures: u64,
    pub alerts_raised: u64,
    pub actions_proposed: u64,
    pub restarts: u64,
}

#[derive(Debug, Default)]
struct StatCounters {
    ticks_run: AtomicU64,
    ticks_skipped: AtomicU64,
    trades_evaluated: AtomicU64,
    trade_failures: AtomicU64,
    alerts_raised: AtomicU64,
    actions_proposed: AtomicU64,
    restarts: AtomicU64,
}

impl StatCounters {
    fn snapshot(&self) -> MonitorStats {
        MonitorStats {
            ticks_run: self.ticks_run.load(Ordering::Relaxed),
            ticks_skipped: self.ticks_skipped.load(Ordering::Relaxed),
            trades_evaluated: self.trades_evaluated.load(Ordering::Relaxed),
            trade_failures: self.trade_failures.load(Ordering::Relaxed),
            alerts_raised: self.alerts_raised.load(Ordering::Relaxed),
            actions_proposed: self.actions_proposed.load(Ordering::Relaxed),
            restarts: self.restarts.load(Ordering::Relaxed),
        }
    }
}

/// Outcome of one trade's evaluation.
#[derive(Debug, Clone)]
pub enum TradeEvaluation {
    Completed {
        trade_id: String,
        alerts: Vec<Alert>,
        actions: Vec<AutoAction>,
    },
    /// The run that started this evaluation was stopped; results were discarded
    Stale { trade_id: String },
}

/// Summary of one tick.
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    pub generation: u64,
    pub skipped: bool,
    pub evaluated: usize,
    pub failed: usize,
    pub stale: usize,
    pub alerts: Vec<Alert>,
    pub actions: Vec<AutoAction>,
}

/// Clears the in-flight flag when dropped.
struct TickGuard<'a>(&'a AtomicBool);

impl<'a> TickGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for TickGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Top-level scheduler for trade monitoring.
pub struct MonitoringOrchestrator {
    interval: Duration,
    tick_timeout: Duration,
    bar_timeframe: String,
    bar_limit: usize,

    store: Arc<TradeLifecycleStore>,
    market: Arc<dyn MarketDataProvider>,
    engine: Arc<Mutex<EscalationRuleEngine>>,
    automation: AutoPositionManager,
    notifiers: Vec<Box<dyn NotificationChannel>>,
    greeks: GreeksValidator,
    analyzers: Mutex<Analyzers>,

    /// Bumped on every start/stop; evaluations from an older run are discarded
    generation: AtomicU64,
    running: AtomicBool,
    tick_in_flight: AtomicBool,
    loop_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
    entered_ids: Mutex<HashSet<String>>,
    stats: StatCounters,
}

impl MonitoringOrchestrator {
    pub fn new(
        config: &Config,
        store: Arc<TradeLifecycleStore>,
        market: Arc<dyn MarketDataProvider>,
        engine: Arc<Mutex<EscalationRuleEngine>>,
        automation: AutoPositionManager,
        notifiers: Vec<Box<dyn NotificationChannel>>,
    ) -> Self {
        Self {
            interval: Duration::from_secs(config.monitor.interval_secs),
            tick_timeout: Duration::from_secs(config.monitor.tick_timeout_secs),
            bar_timeframe: config.monitor.bar_timeframe.clone(),
            bar_limit: config.monitor.bar_limit,
            store,
            market,
            engine,
            automation,
            notifiers,
            greeks: GreeksValidator::new(),
            analyzers: Mutex::new(Analyzers {
                flow: FlowAnalyzer::new(config.flow.window),
                iv: IvHistoryTracker::new(config.iv.capacity, config.iv.min_samples),
                iv_keys: HashMap::new(),
                advisor: IvGatingAdvisor::new(config.iv.clone()),
                last_confluence: HashMap::new(),
            }),
            generation: AtomicU64::new(0),
            running: AtomicBool::new(false),
            tick_in_flight: AtomicBool::new(false),
            loop_handle: std::sync::Mutex::new(None),
            entered_ids: Mutex::new(HashSet::new()),
            stats: StatCounters::default(),
        }
    }

    /// Override the per-trade timeout (the config only has whole seconds).
    pub fn with_tick_timeout(mut self, timeout: Duration) -> Self {
        self.tick_timeout = timeout;
        self
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> MonitorStats {
        self.stats.snapshot()
    }

    pub fn greeks_quality(&self) -> ValidationStats {
        self.greeks.stats()
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Begin the fixed-interval loop. No-op if already running.
    pub fn start(self: &Arc<Self>) {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Monitor already running");
            return;
        }

        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if !this.is_current(generation) {
                    break;
                }
                let run = Arc::clone(&this);
                tokio::spawn(async move {
                    run.run_tick(generation).await;
                });
            }
            debug!(generation, "Monitor loop exited");
        });

        if let Ok(mut slot) = self.loop_handle.lock() {
            if let Some(old) = slot.replace(handle) {
                old.abort();
            }
        }
        info!(generation, interval_secs = self.interval.as_secs(), "Monitor started");
    }

    /// Stop scheduling ticks. Idempotent; an in-flight tick finishes but its results are dropped.
    pub fn stop(&self) {
        let was_running = self.running.swap(false, Ordering::AcqRel);
        self.generation.fetch_add(1, Ordering::AcqRel);

        if let Ok(mut slot) = self.loop_handle.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
        if was_running {
            info!("Monitor stopped");
        }
    }

    pub fn restart(self: &Arc<Self>) {
        self.stop();
        self.stats.restarts.fetch_add(1, Ordering::Relaxed);
        self.start();
    }

    fn is_current(&self, generation: u64) -> bool {
        self.running.load(Ordering::Acquire) && self.generation.load(Ordering::Acquire) == generation
    }

    fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    // ------------------------------------------------------------------
    // Ticks
    // ------------------------------------------------------------------

    /// Run one tick now, outside the timer.
    pub async fn tick_now(&self) -> TickReport {
        self.run_tick(self.current_generation()).await
    }

    async fn run_tick(&self, generation: u64) -> TickReport {
        let Some(_guard) = TickGuard::acquire(&self.tick_in_flight) else {
            self.stats.ticks_skipped.fetch_add(1, Ordering::Relaxed);
            debug!(generation, "Previous tick still running, skipping");
            return TickReport {
                generation,
                skipped: true,
                ..TickReport::default()
            };
        };
        self.stats.ticks_run.fetch_add(1, Ordering::Relaxed);

        let trades = self.store.entered_trades().await;
        let evaluations = trades.iter().map(|trade| async move {
            let result = tokio::time::timeout(self.tick_timeout, self.evaluate_trade(trade, generation)).await;
            (trade.id.clone(), result)
        });

        let mut report = TickReport {
            generation,
            ..TickReport::default()
        };

        for (trade_id, result) in join_all(evaluations).await {
            match result {
                Ok(Ok(TradeEvaluation::Completed { alerts, actions, .. })) => {
                    report.evaluated += 1;
                    report.alerts.extend(alerts);
                    report.actions.extend(actions);
                }
                Ok(Ok(TradeEvaluation::Stale { .. })) => {
                    report.stale += 1;
                }
                Ok(Err(e)) => {
                    report.failed += 1;
                    warn!(trade_id = %trade_id, error = %e, "Trade evaluation failed, skipping");
                }
                Err(_) => {
                    report.failed += 1;
                    warn!(
                        trade_id = %trade_id,
                        timeout_ms = self.tick_timeout.as_millis() as u64,
                        "Trade evaluation timed out, retrying next tick"
                    );
                }
            }
        }

        self.stats
            .trades_evaluated
            .fetch_add(report.evaluated as u64, Ordering::Relaxed);
        self.stats
            .trade_failures
            .fetch_add(report.failed as u64, Ordering::Relaxed);
        self.stats
            .alerts_raised
            .fetch_add(report.alerts.len() as u64, Ordering::Relaxed);
        self.stats
            .actions_proposed
            .fetch_add(report.actions.len() as u64, Ordering::Relaxed);

        debug!(
            generation,
            trades = trades.len(),
            evaluated = report.evaluated,
            failed = report.failed,
            alerts = report.alerts.len(),
            "Tick complete"
        );
        report
    }

    /// Flow -> context -> rules -> automation for one trade.
    async fn evaluate_trade(&self, trade: &Trade, generation: u64) -> Result<TradeEvaluation> {
        let underlying = trade.contract.underlying.as_str();
        let iv_key = trade.contract.occ_symbol();
        let now = Utc::now();

        let snapshot = self
            .market
            .get_option_snapshot(&trade.contract)
            .await
            .with_context(|| format!("option snapshot for {}", iv_key))?;

        let bars = match self
            .market
            .get_bars(underlying, &self.bar_timeframe, self.bar_limit)
            .await
        {
            Ok(bars) => bars,
            Err(e) => {
                debug!(trade_id = %trade.id, error = %e, "Bars unavailable, evaluating without flow");
                Vec::new()
            }
        };
        let confluence = self.market.get_confluence(underlying).await.unwrap_or_else(|e| {
            debug!(trade_id = %trade.id, error = %e, "Confluence unavailable");
            None
        });
        let days_to_earnings = self
            .market
            .days_to_earnings(underlying)
            .await
            .unwrap_or_default();

        if generation != self.current_generation() {
            return Ok(TradeEvaluation::Stale {
                trade_id: trade.id.clone(),
            });
        }

        let (flow, iv, previous_confluence) = {
            let mut analyzers = self.analyzers.lock().await;
            analyzers.flow.ingest_bars(underlying, &bars);
            let flow = analyzers.flow.analyze(underlying);

            if let Some(iv) = snapshot.greeks.implied_volatility {
                analyzers.iv.record(&iv_key, iv);
                analyzers.iv_keys.insert(trade.id.clone(), iv_key.clone());
            }
            let iv = analyzers
                .advisor
                .analyze(&analyzers.iv, &iv_key, days_to_earnings);

            let previous = match confluence {
                Some(score) => analyzers.last_confluence.insert(trade.id.clone(), score),
                None => analyzers.last_confluence.get(&trade.id).copied(),
            };
            (flow, iv, previous)
        };

        let greeks = self
            .greeks
            .create_safe_greeks(&snapshot.greeks, trade.contract.option_type)
            .into_snapshot(
                to_f64(snapshot.underlying_price),
                to_f64(snapshot.option_price),
                trade.days_to_expiry(now),
                now,
            );

        let price = snapshot.option_price;
        if price <= Decimal::ZERO {
            return Err(anyhow!("non-positive option price {}", price));
        }
        let marked = self
            .store
            .record_mark(&trade.id, price)
            .await
            .with_context(|| format!("marking trade {}", trade.id))?;

        let ctx = TradeContext::build(&marked, price, now)
            .ok_or_else(|| anyhow!("trade {} has no entry price", trade.id))?
            .with_confluence(confluence, previous_confluence)
            .with_flow(flow.as_ref())
            .with_greeks(Some(greeks))
            .with_iv(iv.stats.is_some().then_some(&iv));

        // Last chance to notice a stop before applying results
        if generation != self.current_generation() {
            return Ok(TradeEvaluation::Stale {
                trade_id: trade.id.clone(),
            });
        }

        let alerts = self.engine.lock().await.check_escalation(&ctx);
        for alert in &alerts {
            self.deliver(alert).await;
        }

        let actions = self
            .automation
            .check_rules(&marked, price, ctx.confluence, previous_confluence)
            .await;

        Ok(TradeEvaluation::Completed {
            trade_id: trade.id.clone(),
            alerts,
            actions,
        })
    }

    async fn deliver(&self, alert: &Alert) {
        for channel in &self.notifiers {
            if let Err(e) = channel.send(alert).await {
                warn!(channel = channel.name(), alert_id = %alert.id, error = %e, "Alert delivery failed");
            }
        }
    }

    // ------------------------------------------------------------------
    // Store events
    // ------------------------------------------------------------------

    /// Follow store events: clean up after closed trades and restart the
    /// loop when the set of entered trades changes.
    pub fn spawn_event_listener(self: &Arc<Self>) -> JoinHandle<()> {
        let mut events = self.store.subscribe();
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.sync_entered_set().await;
            loop {
                match events.recv().await {
                    Ok(event) => this.handle_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "Store events lagged, resyncing");
                        this.collect_garbage().await;
                        this.sync_entered_set().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!("Store event listener exited");
        })
    }

    async fn handle_event(self: &Arc<Self>, event: StoreEvent) {
        match event {
            StoreEvent::TradeTransitioned {
                trade_id,
                to: TradeState::Exited,
                ..
            }
            | StoreEvent::TradeRemoved { trade_id } => {
                self.release_trade(&trade_id).await;
                self.sync_entered_set().await;
            }
            StoreEvent::TradeTransitioned { .. } | StoreEvent::TradeAdded { .. } => {
                self.sync_entered_set().await;
            }
            StoreEvent::Reconciled { .. } => {
                self.collect_garbage().await;
                self.sync_entered_set().await;
            }
            StoreEvent::TradeUpdated { .. } | StoreEvent::FocusChanged { .. } => {}
        }
    }

    /// Drop alerts, automation and analyzer state for a trade that left the active list.
    async fn release_trade(&self, trade_id: &str) {
        let alerts = self.engine.lock().await.clear_trade(trade_id);
        let (rules, actions) = self.automation.clear_trade(trade_id).await;
        {
            let mut analyzers = self.analyzers.lock().await;
            analyzers.last_confluence.remove(trade_id);
            if let Some(key) = analyzers.iv_keys.remove(trade_id) {
                if !analyzers.iv_keys.values().any(|k| *k == key) {
                    analyzers.iv.clear(&key);
                }
            }
        }
        debug!(trade_id = %trade_id, alerts, rules, actions, "Released closed trade");
    }

    /// Release every trade the engine tracks that is no longer active.
    async fn collect_garbage(&self) {
        let active: HashSet<String> = self
            .store
            .active_trades()
            .await
            .into_iter()
            .map(|t| t.id)
            .collect();
        let tracked = self.engine.lock().await.tracked_trades();
        for trade_id in tracked.into_iter().filter(|id| !active.contains(id)) {
            self.release_trade(&trade_id).await;
        }
    }

    async fn sync_entered_set(self: &Arc<Self>) {
        let current: HashSet<String> = self
            .store
            .entered_trades()
            .await
            .into_iter()
            .map(|t| t.id)
            .collect();

        let changed = {
            let mut known = self.entered_ids.lock().await;
            if *known == current {
                false
            } else {
                *known = current;
                true
            }
        };

        if changed && self.is_running() {
            info!("Entered trade set changed, restarting monitor");
            self.restart();
        }
    }
}

impl Drop for MonitoringOrchestrator {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.loop_handle.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automation::{AutoRule, AutoRuleAction, AutoRuleConditions};
    use crate::config::EscalationConfig;
    use crate::market::{MockMarketData, OptionContract, OptionType, RawGreeks};
    use crate::notify::LogNotifier;
    use crate::trade::InMemoryTradeRepository;
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;

    struct Harness {
        orchestrator: Arc<MonitoringOrchestrator>,
        store: Arc<TradeLifecycleStore>,
        market: MockMarketData,
        engine: Arc<Mutex<EscalationRuleEngine>>,
        automation: AutoPositionManager,
    }

    fn entered(underlying: &str, entry: Decimal) -> Trade {
        entered_contract(underlying, dec!(100), OptionType::Call, entry)
    }

    fn entered_contract(
        underlying: &str,
        strike: Decimal,
        option_type: OptionType,
        entry: Decimal,
    ) -> Trade {
        let contract = OptionContract::new(
            underlying,
            strike,
            NaiveDate::from_ymd_opt(2099, 1, 16).unwrap(),
            option_type,
        );
        let mut trade = Trade::watching("local", contract, Utc::now());
        trade.state = TradeState::Entered;
        trade.entry_price = Some(entry);
        trade
    }

    fn greeks() -> RawGreeks {
        RawGreeks {
            delta: Some(0.45),
            gamma: Some(0.03),
            theta: Some(-0.02),
            vega: Some(0.12),
            rho: Some(0.01),
            implied_volatility: Some(0.28),
        }
    }

    async fn harness(trades: Vec<Trade>) -> Harness {
        let mut config = Config::default();
        config.store.strict_invariants = true;

        let store = Arc::new(TradeLifecycleStore::new(
            "local",
            Arc::new(InMemoryTradeRepository::with_trades(trades)),
            &config.store,
        ));
        store.reload().await.unwrap();

        let market = MockMarketData::new();
        let engine = Arc::new(Mutex::new(EscalationRuleEngine::new(EscalationConfig::default())));
        let automation = AutoPositionManager::new(store.clone());
        let orchestrator = Arc::new(
            MonitoringOrchestrator::new(
                &config,
                store.clone(),
                Arc::new(market.clone()),
                engine.clone(),
                automation.clone(),
                vec![Box::new(LogNotifier)],
            )
            .with_tick_timeout(Duration::from_millis(300)),
        );

        Harness {
            orchestrator,
            store,
            market,
            engine,
            automation,
        }
    }

    #[tokio::test]
    async fn test_tick_raises_alerts_and_marks_price() {
        let trade = entered("SPY", dec!(4));
        let h = harness(vec![trade.clone()]).await;
        h.market
            .set_option_snapshot(&trade.contract, dec!(2.5), dec!(98), greeks())
            .await;

        let report = h.orchestrator.tick_now().await;
        assert_eq!(report.evaluated, 1);
        assert!(report.alerts.iter().any(|a| a.title == "Heavy Loss"));

        let marked = h.store.get_trade(&trade.id).await.unwrap();
        assert_eq!(marked.current_price, Some(dec!(2.5)));
        assert_eq!(h.orchestrator.stats().alerts_raised, report.alerts.len() as u64);
        assert_eq!(h.orchestrator.greeks_quality().total, 1);
    }

    #[tokio::test]
    async fn test_failing_trade_does_not_abort_tick() {
        let good = entered("SPY", dec!(4));
        let bad = entered("QQQ", dec!(4));
        let h = harness(vec![good.clone(), bad.clone()]).await;
        h.market
            .set_option_snapshot(&good.contract, dec!(4.2), dec!(101), greeks())
            .await;
        h.market
            .set_option_snapshot(&bad.contract, dec!(4.2), dec!(101), greeks())
            .await;
        h.market.fail_symbol("QQQ").await;

        let report = h.orchestrator.tick_now().await;
        assert_eq!(report.evaluated, 1);
        assert_eq!(report.failed, 1);
    }

    #[tokio::test]
    async fn test_slow_trade_times_out() {
        let slow = entered("IWM", dec!(4));
        let h = harness(vec![slow.clone()]).await;
        h.market
            .set_option_snapshot(&slow.contract, dec!(4), dec!(100), greeks())
            .await;
        h.market.set_latency("IWM", Duration::from_secs(2)).await;

        let report = h.orchestrator.tick_now().await;
        assert_eq!(report.failed, 1);
        assert_eq!(report.evaluated, 0);
    }

    #[tokio::test]
    async fn test_overlapping_tick_is_skipped() {
        let h = harness(Vec::new()).await;
        let _held = TickGuard::acquire(&h.orchestrator.tick_in_flight).unwrap();

        let report = h.orchestrator.tick_now().await;
        assert!(report.skipped);
        assert_eq!(h.orchestrator.stats().ticks_skipped, 1);
    }

    #[tokio::test]
    async fn test_stale_generation_discards_results() {
        let trade = entered("SPY", dec!(4));
        let h = harness(vec![trade.clone()]).await;
        h.market
            .set_option_snapshot(&trade.contract, dec!(2), dec!(95), greeks())
            .await;

        let old_generation = h.orchestrator.current_generation();
        h.orchestrator.stop();

        let report = h.orchestrator.run_tick(old_generation).await;
        assert_eq!(report.stale, 1);
        assert!(report.alerts.is_empty());
        assert!(h.engine.lock().await.alerts_for_trade(&trade.id).is_empty());
    }

    #[tokio::test]
    async fn test_automation_proposals_come_from_tick() {
        let trade = entered("SPY", dec!(4));
        let h = harness(vec![trade.clone()]).await;
        h.automation
            .add_rule(AutoRule::new(
                &trade.id,
                "lock gains",
                AutoRuleConditions {
                    pnl_above: Some(25.0),
                    ..Default::default()
                },
                AutoRuleAction::Trim { percent: 50 },
            ))
            .await
            .unwrap();
        h.market
            .set_option_snapshot(&trade.contract, dec!(5.5), dec!(104), greeks())
            .await;

        let first = h.orchestrator.tick_now().await;
        let second = h.orchestrator.tick_now().await;
        assert_eq!(first.actions.len(), 1);
        assert!(second.actions.is_empty());
    }

    #[tokio::test]
    async fn test_exit_releases_alerts_and_rules() {
        let trade = entered("SPY", dec!(4));
        let h = harness(vec![trade.clone()]).await;
        h.automation
            .add_rule(AutoRule::new(
                &trade.id,
                "cut",
                AutoRuleConditions {
                    pnl_below: Some(-20.0),
                    ..Default::default()
                },
                AutoRuleAction::Exit,
            ))
            .await
            .unwrap();
        h.market
            .set_option_snapshot(&trade.contract, dec!(2.5), dec!(95), greeks())
            .await;
        let listener = h.orchestrator.spawn_event_listener();

        let report = h.orchestrator.tick_now().await;
        assert!(!report.alerts.is_empty());
        assert_eq!(report.actions.len(), 1);

        h.store.exit_trade(&trade.id, dec!(2.5)).await.unwrap();

        let mut released = false;
        for _ in 0..50 {
            if h.engine.lock().await.alerts_for_trade(&trade.id).is_empty()
                && h.automation.rules_for_trade(&trade.id).await.is_empty()
            {
                released = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(released);
        listener.abort();
    }

    #[tokio::test]
    async fn test_iv_history_is_kept_per_contract() {
        let call = entered_contract("SPY", dec!(450), OptionType::Call, dec!(4));
        let put = entered_contract("SPY", dec!(400), OptionType::Put, dec!(4));
        let h = harness(vec![call.clone(), put.clone()]).await;
        h.market
            .set_option_snapshot(
                &call.contract,
                dec!(4),
                dec!(430),
                RawGreeks {
                    implied_volatility: Some(0.20),
                    ..greeks()
                },
            )
            .await;
        h.market
            .set_option_snapshot(
                &put.contract,
                dec!(4),
                dec!(430),
                RawGreeks {
                    implied_volatility: Some(0.40),
                    ..greeks()
                },
            )
            .await;

        let mut crush_alerts = 0;
        // Enough ticks for IV stats to reach the rules
        for _ in 0..12 {
            let report = h.orchestrator.tick_now().await;
            assert_eq!(report.evaluated, 2);
            crush_alerts += report.alerts.iter().filter(|a| a.title == "IV Crush").count();
        }
        assert_eq!(crush_alerts, 0);

        let analyzers = h.orchestrator.analyzers.lock().await;
        for (trade, iv) in [(&call, 0.20), (&put, 0.40)] {
            let key = trade.contract.occ_symbol();
            assert_eq!(analyzers.iv.sample_count(&key), 12);
            assert_eq!(analyzers.iv.latest(&key).map(|r| r.value), Some(iv));
            let analysis = analyzers.advisor.analyze(&analyzers.iv, &key, None);
            assert!(!analysis.recent_crush);
            assert!(!analysis.recent_spike);
        }
        assert_eq!(analyzers.iv.sample_count("SPY"), 0);
    }

    #[tokio::test]
    async fn test_exit_clears_contract_iv_history() {
        let trade = entered("SPY", dec!(4));
        let h = harness(vec![trade.clone()]).await;
        h.market
            .set_option_snapshot(&trade.contract, dec!(4), dec!(100), greeks())
            .await;
        h.orchestrator.tick_now().await;
        let key = trade.contract.occ_symbol();
        assert_eq!(h.orchestrator.analyzers.lock().await.iv.sample_count(&key), 1);

        h.orchestrator.release_trade(&trade.id).await;
        assert_eq!(h.orchestrator.analyzers.lock().await.iv.sample_count(&key), 0);
    }

    #[tokio::test]
    async fn test_start_stop_are_idempotent() {
        let h = harness(Vec::new()).await;
        h.orchestrator.start();
        h.orchestrator.start();
        assert!(h.orchestrator.is_running());

        h.orchestrator.stop();
        h.orchestrator.stop();
        assert!(!h.orchestrator.is_running());

        h.orchestrator.restart();
        assert!(h.orchestrator.is_running());
        assert_eq!(h.orchestrator.stats().restarts, 1);
        h.orchestrator.stop();
    }
}
