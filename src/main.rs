//! Options Cockpit - Main Entry Point
//!
//! Paper monitoring loop plus trade management commands against the SQLite store.

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use options_cockpit::automation::{AutoPositionManager, AutoRule, AutoRuleAction, AutoRuleConditions};
use options_cockpit::config::Config;
use options_cockpit::escalation::EscalationRuleEngine;
use options_cockpit::market::{
    MarketDataProvider, MockMarketData, OptionContract, OptionType, PaperFeed,
};
use options_cockpit::monitor::MonitoringOrchestrator;
use options_cockpit::notify::channels_from_config;
use options_cockpit::persistence::SqliteTradeRepository;
use options_cockpit::trade::{
    InMemoryTradeRepository, Trade, TradeLifecycleStore, TradeRepository, TradeState,
};
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

/// Store reload cadence in paper-feed steps
const RELOAD_EVERY_STEPS: u64 = 12;
/// Status line cadence in paper-feed steps
const STATUS_EVERY_STEPS: u64 = 6;

/// Options Cockpit CLI
#[derive(Parser)]
#[command(name = "options-cockpit")]
#[command(version, about = "Options trade lifecycle tracking and risk escalation")]
struct Cli {
    /// Path to SQLite database (defaults to database.path from config)
    #[arg(long, global = true)]
    db: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Side {
    Call,
    Put,
}

impl From<Side> for OptionType {
    fn from(side: Side) -> Self {
        match side {
            Side::Call => OptionType::Call,
            Side::Put => OptionType::Put,
        }
    }
}

#[derive(clap::Args, Debug, Clone)]
struct ContractArgs {
    /// Underlying symbol
    #[arg(short, long)]
    ticker: String,

    /// Strike price
    #[arg(short, long)]
    strike: Decimal,

    /// Expiry date (YYYY-MM-DD)
    #[arg(short, long)]
    expiry: String,

    #[arg(long, value_enum, default_value = "call")]
    side: Side,

    /// Target option price
    #[arg(long)]
    target: Option<Decimal>,

    /// Stop-loss option price
    #[arg(long)]
    stop: Option<Decimal>,
}

impl ContractArgs {
    fn contract(&self) -> Result<OptionContract> {
        let expiry = NaiveDate::parse_from_str(&self.expiry, "%Y-%m-%d")
            .with_context(|| format!("Invalid expiry date: {}", self.expiry))?;
        Ok(OptionContract::new(&self.ticker, self.strike, expiry, self.side.into()))
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run the paper monitoring loop (default)
    Run {
        /// Approve automation proposals without review
        #[arg(long)]
        auto_approve: bool,

        /// Install trim/exit guard rules on every entered trade
        #[arg(long)]
        guard_rules: bool,
    },

    /// List trades in the store
    Status {
        /// Include closed trades and update history
        #[arg(short, long)]
        verbose: bool,
    },

    /// Preview a contract with simulated pricing, without saving it
    Watch {
        #[command(flatten)]
        contract: ContractArgs,
    },

    /// Save a contract as a LOADED trade
    Load {
        #[command(flatten)]
        contract: ContractArgs,
    },

    /// Record an entry fill
    Enter {
        /// Trade id
        id: String,

        #[arg(short, long)]
        price: Decimal,
    },

    /// Record an exit fill
    Exit {
        /// Trade id
        id: String,

        #[arg(short, long)]
        price: Decimal,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging()?;

    let config = Config::load()?;
    config.validate()?;
    let db_path = cli.db.clone().unwrap_or_else(|| config.database.path.clone());

    match cli.command {
        Some(Commands::Status { verbose }) => show_status(&config, &db_path, verbose).await,
        Some(Commands::Watch { contract }) => watch_contract(&config, &contract).await,
        Some(Commands::Load { contract }) => load_contract(&config, &db_path, &contract).await,
        Some(Commands::Enter { id, price }) => {
            let store = open_store(&config, &db_path, None).await?;
            let trade = store.enter_trade(&id, price).await?;
            println!("✅ Entered {} ({}) at {}", trade.id, trade.contract, price);
            Ok(())
        }
        Some(Commands::Exit { id, price }) => {
            let store = open_store(&config, &db_path, None).await?;
            let trade = store.exit_trade(&id, price).await?;
            let pnl = trade
                .pnl_pct()
                .map(|p| format!("{:+.1}%", p))
                .unwrap_or_else(|| "n/a".into());
            println!("✅ Exited {} ({}) at {}, P&L {}", trade.id, trade.contract, price, pnl);
            Ok(())
        }
        Some(Commands::Run {
            auto_approve,
            guard_rules,
        }) => run_paper(config, &db_path, auto_approve, guard_rules).await,
        None => run_paper(config, &db_path, false, false).await,
    }
}

/// Initialize logging to stdout and an hourly rolling file.
fn init_logging() -> Result<()> {
    use tracing_subscriber::fmt::writer::MakeWriterExt;

    std::fs::create_dir_all("logs")?;

    let file_appender = tracing_appender::rolling::hourly("logs", "options-cockpit.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    // Keep the writer alive for the program duration
    Box::leak(Box::new(guard));

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("options_cockpit=debug".parse()?)
                .add_directive(Level::INFO.into()),
        )
        .with_writer(std::io::stdout.and(file_writer))
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .init();

    Ok(())
}

fn log_config(config: &Config, db_path: &str) {
    info!("📋 Configuration:");
    info!("   User: {}", config.monitor.user_id);
    info!(
        "   Monitor Interval: {}s (per-trade timeout {}s)",
        config.monitor.interval_secs, config.monitor.tick_timeout_secs
    );
    info!(
        "   Alert Cooldown: {}s, Max Alerts/Trade: {}",
        config.escalation.cooldown_secs, config.escalation.max_alerts_per_trade
    );
    info!(
        "   IV Percentiles: low {:.0} / high {:.0}, crush {:.0}%",
        config.iv.low_percentile, config.iv.high_percentile, config.iv.crush_threshold_pct
    );
    info!("   Strict Invariants: {}", config.store.strict_invariants);
    info!("   Database: {}", db_path);
}

async fn open_store(
    config: &Config,
    db_path: &str,
    market: Option<Arc<MockMarketData>>,
) -> Result<Arc<TradeLifecycleStore>> {
    if let Some(parent) = std::path::Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let repository = Arc::new(SqliteTradeRepository::new(db_path)?);
    let mut store = TradeLifecycleStore::new(&config.monitor.user_id, repository, &config.store);
    if let Some(market) = market {
        store = store.with_settlement_source(market);
    }
    let store = Arc::new(store);
    store.reload().await.context("Failed to load trades")?;
    Ok(store)
}

async fn watch_contract(config: &Config, args: &ContractArgs) -> Result<()> {
    let contract = args.contract()?;
    let market = MockMarketData::new();
    let mut feed = PaperFeed::new(market.clone());
    feed.advance(std::slice::from_ref(&contract), Utc::now()).await;

    let store = TradeLifecycleStore::new(
        &config.monitor.user_id,
        Arc::new(InMemoryTradeRepository::new()),
        &config.store,
    );
    let preview = store.create_preview(contract.clone(), args.target, args.stop).await;

    let snapshot = market.get_option_snapshot(&contract).await?;
    println!("👀 Preview {}", preview.id);
    println!("   ├─ Contract:   {} ({})", contract, contract.occ_symbol());
    println!("   ├─ Underlying: ${}", snapshot.underlying_price);
    println!("   ├─ Option:     ${} (simulated)", snapshot.option_price);
    println!("   ├─ Expires in: {}d", contract.days_to_expiry(Utc::now()));
    if let Some(target) = args.target {
        println!("   ├─ Target:     ${}", target);
    }
    if let Some(stop) = args.stop {
        println!("   ├─ Stop:       ${}", stop);
    }
    println!("   └─ Not saved; use `load` to track it");
    Ok(())
}

async fn load_contract(config: &Config, db_path: &str, args: &ContractArgs) -> Result<()> {
    let contract = args.contract()?;
    let store = open_store(config, db_path, None).await?;
    let preview = store.create_preview(contract, args.target, args.stop).await;
    let trade = store.load_trade(&preview.id).await?;
    println!("✅ Loaded {} ({})", trade.id, trade.contract);
    Ok(())
}

async fn show_status(config: &Config, db_path: &str, verbose: bool) -> Result<()> {
    println!("╔════════════════════════════════════════════════════════════╗");
    println!("║              OPTIONS COCKPIT STATUS                        ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    if !std::path::Path::new(db_path).exists() {
        println!("\n❌ Database not found: {}", db_path);
        println!("   No trades have been loaded yet, or the database path is incorrect.");
        return Ok(());
    }

    let repository = SqliteTradeRepository::new(db_path)?;
    let trades = repository.list_trades(&config.monitor.user_id).await?;
    let (open, closed): (Vec<&Trade>, Vec<&Trade>) =
        trades.iter().partition(|t| t.state != TradeState::Exited);

    println!("\n📊 Summary");
    println!("   ├─ Open Trades:    {}", open.len());
    println!("   └─ Closed Trades:  {}", closed.len());

    if !open.is_empty() {
        println!("\n🔓 Open Trades");
        for trade in &open {
            print_trade(trade, verbose);
        }
    }

    if verbose && !closed.is_empty() {
        println!("\n📁 History");
        for trade in &closed {
            print_trade(trade, verbose);
        }
    }

    println!();
    Ok(())
}

fn print_trade(trade: &Trade, verbose: bool) {
    let price = |p: Option<Decimal>| p.map(|v| format!("${}", v)).unwrap_or_else(|| "-".into());
    println!("   ┌─ {} [{}]", trade.id, trade.state);
    println!("   ├─ Contract: {}", trade.contract);
    println!(
        "   ├─ Entry: {}  Current: {}  Exit: {}",
        price(trade.entry_price),
        price(trade.current_price),
        price(trade.exit_price)
    );
    println!(
        "   ├─ Target: {}  Stop: {}",
        price(trade.target_price),
        price(trade.stop_loss)
    );
    match trade.pnl_pct() {
        Some(pnl) => println!("   └─ P&L: {:+.1}%", pnl),
        None => println!("   └─ P&L: n/a"),
    }
    if verbose {
        for update in &trade.updates {
            println!(
                "       {} {:?} @ ${} {}",
                update.timestamp.format("%Y-%m-%d %H:%M"),
                update.kind,
                update.price,
                update.note.as_deref().unwrap_or("")
            );
        }
    }
}

/// Take profits at +50% and cut at -50%.
fn guard_rules_for(trade_id: &str) -> [AutoRule; 2] {
    [
        AutoRule::new(
            trade_id,
            "take half at +50%",
            AutoRuleConditions {
                pnl_above: Some(50.0),
                ..Default::default()
            },
            AutoRuleAction::Trim { percent: 50 },
        ),
        AutoRule::new(
            trade_id,
            "cut at -50%",
            AutoRuleConditions {
                pnl_below: Some(-50.0),
                ..Default::default()
            },
            AutoRuleAction::Exit,
        ),
    ]
}

async fn run_paper(config: Config, db_path: &str, auto_approve: bool, guard_rules: bool) -> Result<()> {
    info!("╔════════════════════════════════════════════════════════════╗");
    info!(
        "║       Options Cockpit v{} - Paper Monitoring             ║",
        env!("CARGO_PKG_VERSION")
    );
    info!("╚════════════════════════════════════════════════════════════╝");
    log_config(&config, db_path);

    warn!("Automation rules and pending approvals are held in memory only and are lost on restart");

    let market = Arc::new(MockMarketData::new());
    let store = open_store(&config, db_path, Some(market.clone())).await?;
    info!(
        active = store.active_trades().await.len(),
        entered = store.entered_trades().await.len(),
        "📂 Trades loaded"
    );

    let engine = Arc::new(Mutex::new(EscalationRuleEngine::new(config.escalation.clone())));
    let automation = AutoPositionManager::new(store.clone());
    let notifiers = channels_from_config(&config.notifications)?;

    let orchestrator = Arc::new(MonitoringOrchestrator::new(
        &config,
        store.clone(),
        market.clone(),
        engine.clone(),
        automation.clone(),
        notifiers,
    ));

    let mut feed = PaperFeed::new((*market).clone());
    let contracts: Vec<OptionContract> = store
        .active_trades()
        .await
        .into_iter()
        .map(|t| t.contract)
        .collect();
    feed.advance(&contracts, Utc::now()).await;

    let listener = orchestrator.spawn_event_listener();
    orchestrator.start();

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("🛑 Shutdown signal received");
        shutdown_clone.store(true, Ordering::SeqCst);
    });

    info!("🚀 Starting paper monitoring loop...");

    let mut ticker = tokio::time::interval(Duration::from_secs(config.monitor.interval_secs));
    while !shutdown.load(Ordering::SeqCst) {
        ticker.tick().await;

        let active = store.active_trades().await;
        if guard_rules {
            for trade in active.iter().filter(|t| t.state == TradeState::Entered) {
                if automation.rules_for_trade(&trade.id).await.is_empty() {
                    for rule in guard_rules_for(&trade.id) {
                        if let Err(e) = automation.add_rule(rule).await {
                            warn!(trade_id = %trade.id, error = %e, "Failed to install guard rule");
                        }
                    }
                }
            }
        }

        let contracts: Vec<OptionContract> = active.into_iter().map(|t| t.contract).collect();
        feed.advance(&contracts, Utc::now()).await;

        for action in automation.pending_actions().await {
            if auto_approve {
                match automation.approve_action(&action.id, "paper-auto").await {
                    Ok(handle) => match handle.await {
                        Ok(Ok(done)) => info!(action_id = %done.id, status = %done.status, "🤖 {}", done.description),
                        Ok(Err(e)) => error!(action_id = %action.id, error = %e, "Automation execution failed"),
                        Err(e) => error!(action_id = %action.id, error = %e, "Automation task panicked"),
                    },
                    Err(e) => warn!(action_id = %action.id, error = %e, "Approval rejected"),
                }
            } else {
                info!(
                    action_id = %action.id,
                    trade_id = %action.trade_id,
                    reason = %action.trigger_reason,
                    "⏳ Awaiting approval: {}",
                    action.description
                );
            }
        }

        if feed.step() % RELOAD_EVERY_STEPS == 0 {
            if let Err(e) = store.reload().await {
                warn!(error = %e, "Store reload failed, keeping local state");
            }
        }

        if feed.step() % STATUS_EVERY_STEPS == 0 {
            let stats = orchestrator.stats();
            let escalation = engine.lock().await.stats();
            let greeks = orchestrator.greeks_quality();
            info!(
                ticks = stats.ticks_run,
                skipped = stats.ticks_skipped,
                evaluated = stats.trades_evaluated,
                failures = stats.trade_failures,
                alerts = escalation.alerts_created,
                suppressed = escalation.suppressed_by_cooldown,
                greeks_estimated = greeks.estimated,
                "📊 Monitor status"
            );
        }
    }

    orchestrator.stop();
    listener.abort();
    info!("👋 Options Cockpit shutdown complete");
    Ok(())
}
