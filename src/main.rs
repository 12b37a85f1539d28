// =============================================================================
// Aegis Trader — Main Entry Point
// =============================================================================
//
// The engine starts in Paused mode for safety regardless of the persisted
// runtime config: an operator must explicitly resume trading via the
// dashboard/API once the data feed and macro regime look sane.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod broker;
mod clock;
mod config;
mod decision;
mod errors;
mod executor;
mod indicators;
mod notifier;
mod order_log;
mod position;
mod reconcile;
mod signals;
mod sizing;
mod state;
mod strategist;
mod tick_table;
mod types;
mod watcher;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use parking_lot::RwLock;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::{AppState, TradingMode};
use crate::broker::rate_limit::TokenBucket;
use crate::broker::ws::{run_market_feed, MarketFeed};
use crate::broker::{BrokerClient, KisClient};
use crate::clock::{Clock, DailyEvent, Scheduler};
use crate::config::{BrokerEnv, RiskLevel, RuntimeConfig};
use crate::executor::Executor;
use crate::notifier::Notifier;
use crate::order_log::OrderLog;
use crate::strategist::Strategist;
use crate::watcher::{MarketWatcher, QuantitativeOnlyAdjudicator, RegimeSnapshotSource};

const CONFIG_PATH: &str = "runtime_config.json";
const TOKEN_CACHE_PATH: &str = "kis_token_cache.json";
const ORDER_LOG_DIR: &str = "order_logs";
const RECONCILE_INTERVAL_SECS: u64 = 60;
const SCHEDULER_POLL_INTERVAL: Duration = Duration::from_millis(1500);

/// Thin CLI wrapper (spec §4.4.2/§6): `--dry-run` suppresses real broker
/// writes, `--paper`/`--real` override `USE_PAPER`.
#[derive(Parser, Debug)]
#[command(name = "aegis-trader")]
struct Cli {
    /// Suppress real broker writes — every order placement reports success
    /// with the full requested fill.
    #[arg(long)]
    dry_run: bool,
    /// Force paper-trading credentials, overriding USE_PAPER.
    #[arg(long)]
    paper: bool,
    /// Force live-trading credentials, overriding USE_PAPER. Mutually
    /// exclusive with `--paper`; `--real` wins if both are passed.
    #[arg(long)]
    real: bool,
}

/// Category-1 (configuration) vs. everything else, so `main` can exit with
/// the process codes spec §4.4.2/§6 promises: 0 normal, 1 fatal config
/// error, 2 unhandled runtime error.
enum AppError {
    Config(anyhow::Error),
    Runtime(anyhow::Error),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => std::process::exit(0),
        Err(AppError::Config(e)) => {
            eprintln!("fatal configuration error: {e:#}");
            std::process::exit(1);
        }
        Err(AppError::Runtime(e)) => {
            eprintln!("unhandled runtime error: {e:#}");
            std::process::exit(2);
        }
    }
}

async fn run(cli: Cli) -> Result<(), AppError> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("aegis-trader starting up");

    if cli.real {
        std::env::set_var("USE_PAPER", "false");
    } else if cli.paper {
        std::env::set_var("USE_PAPER", "true");
    }

    let mut config = RuntimeConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load runtime config, using defaults");
        RuntimeConfig::default()
    });
    config.broker_params.dry_run = cli.dry_run;

    if let Ok(syms) = std::env::var("AEGIS_SYMBOLS") {
        config.symbols = syms.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect();
    }

    let broker_env = BrokerEnv::from_env().map_err(AppError::Config)?;
    info!(
        account_mode = %broker_env.mode,
        dry_run = cli.dry_run,
        symbols = ?config.symbols,
        "engine starting in SAFE mode (Paused)"
    );

    // ── 2. Build shared state and broker client ──────────────────────────
    let shared_state = Arc::new(state::SharedState::new());

    let rate_limiter = Arc::new(TokenBucket::new(
        config.broker_params.rate_limit_capacity,
        config.broker_params.rate_limit_refill_per_sec,
    ));
    let kis_client = Arc::new(KisClient::new(
        broker_env.clone(),
        TOKEN_CACHE_PATH,
        rate_limiter,
        Duration::from_millis(config.broker_params.rate_limit_acquire_timeout_ms),
        Duration::from_millis(config.broker_params.http_timeout_ms),
        config.broker_params.http_max_retries,
        config.broker_params.http_backoff_factor,
    ));

    if let Err(e) = kis_client.pre_warm().await {
        warn!(error = %e, "broker pre-warm failed, continuing — first live request will retry");
    }

    let feed = Arc::new(MarketFeed::new());
    let notifier = Arc::new(Notifier::from_env());
    let order_log = OrderLog::spawn(ORDER_LOG_DIR);
    let executor = Arc::new(Executor::new(
        kis_client.clone() as Arc<dyn BrokerClient>,
        feed.clone(),
        order_log,
        config.broker_params.clone(),
        broker_env.mode,
        shared_state.clone(),
        notifier.clone(),
    ));

    // ── 3. Market watcher (macro Risk-Off/recovery state machine) ────────
    let watcher = Arc::new(MarketWatcher::new(
        shared_state.clone(),
        notifier.clone(),
        Arc::new(RegimeSnapshotSource::new(shared_state.clone())),
        Arc::new(QuantitativeOnlyAdjudicator),
        config.watcher_params.clone(),
    ));
    tokio::spawn(Arc::clone(&watcher).run());

    // ── 4. Strategist ─────────────────────────────────────────────────────
    let strategist = Arc::new(Strategist::new(
        shared_state.clone(),
        executor.clone(),
        feed.clone(),
        notifier.clone(),
        watcher.clone(),
        config.strategy_params.clone(),
        config.max_concurrent_positions,
        config.max_daily_loss_pct,
    ));

    let runtime_config = Arc::new(RwLock::new(config.clone()));
    let app_state = Arc::new(AppState::new(shared_state.clone(), strategist.clone(), runtime_config.clone(), broker_env.mode));

    // ── 5. Real-time market feed ─────────────────────────────────────────
    {
        let feed = feed.clone();
        let symbols = config.symbols.clone();
        let feed_state = shared_state.clone();
        let feed_notifier = notifier.clone();
        let ws_url = std::env::var("KIS_WS_URL").unwrap_or_else(|_| "wss://ops.koreainvestment.com:21000".to_string());
        tokio::spawn(async move {
            loop {
                if let Err(e) = run_market_feed(&ws_url, &broker_env.app_key, &symbols, feed.clone()).await {
                    error!(error = %e, "market feed exhausted reconnect attempts, retrying in 30s");
                    // Category-6 cascade (spec.md:292/332/336): a dead feed
                    // means entries are being sized off stale quotes. Block
                    // new entries and page; `run_exit_pass` keeps managing
                    // whatever positions are already open until close.
                    feed_state.set_risk_off(true);
                    feed_state.update_risk_params(|p| {
                        p.risk_level = RiskLevel::Critical;
                        p.pyramiding_allowed = false;
                    });
                    feed_notifier
                        .send(&format!("FATAL: market feed exhausted reconnect attempts: {e}. New entries blocked."))
                        .await;
                }
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
        });
    }

    // ── 6. Dashboard API server ───────────────────────────────────────────
    {
        let api_state = app_state.clone();
        let bind_addr = std::env::var("AEGIS_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3001".to_string());
        tokio::spawn(async move {
            let app = api::rest::router(api_state);
            let listener = tokio::net::TcpListener::bind(&bind_addr).await.expect("failed to bind API server");
            info!(addr = %bind_addr, "dashboard API listening");
            axum::serve(listener, app).await.expect("dashboard API server failed");
        });
    }

    // ── 7. Reconciliation loop ────────────────────────────────────────────
    {
        let recon_broker = kis_client.clone();
        let recon_state = shared_state.clone();
        let recon_app = app_state.clone();
        tokio::spawn(async move {
            let mut previous_balance = None;
            let mut interval = tokio::time::interval(Duration::from_secs(RECONCILE_INTERVAL_SECS));
            loop {
                interval.tick().await;
                match reconcile::reconcile_once(recon_broker.as_ref(), &recon_state, &previous_balance).await {
                    Ok((result, balance)) => {
                        previous_balance = Some(balance);
                        *recon_app.last_reconcile_ok.write() = Some(std::time::Instant::now());
                        *recon_app.last_reconcile_error.write() = None;
                        if result.orphan_holdings > 0 || result.balance_drift {
                            recon_app.push_error(format!(
                                "reconciliation drift: {} orphan holdings, balance_drift={}",
                                result.orphan_holdings, result.balance_drift
                            ));
                        }
                        recon_app.increment_version();
                    }
                    Err(e) => {
                        *recon_app.last_reconcile_error.write() = Some(format!("{e}"));
                        recon_app.push_error(format!("reconciliation failed: {e}"));
                        warn!(error = %e, "reconciliation cycle failed");
                    }
                }
            }
        });
    }

    // ── 8. Scheduler: daily events + tick loop ───────────────────────────
    {
        let scheduler_strategist = strategist.clone();
        let tick_strategist = strategist.clone();
        let tick_app_state = app_state.clone();
        let clock = Clock::new();
        let scheduler = Scheduler::new(clock);

        let on_event = move |event: DailyEvent| {
            let strategist = scheduler_strategist.clone();
            async move {
                match event {
                    DailyEvent::MacroReady => strategist.reset_daily(),
                    DailyEvent::Track2Evaluation => strategist.handle_track2_evaluation().await,
                    DailyEvent::Track1ForceClose => strategist.handle_force_close().await,
                    DailyEvent::EndOfDayReport => strategist.handle_end_of_day_report().await,
                    DailyEvent::ScannerFirst
                    | DailyEvent::TradingStart
                    | DailyEvent::OpeningRushEnd
                    | DailyEvent::ScannerSecond
                    | DailyEvent::MarketClose => {}
                }
            }
        };

        let on_tick = move || {
            let strategist = tick_strategist.clone();
            let app_state = tick_app_state.clone();
            async move {
                // Dashboard must actually gate the engine: a restart always
                // comes back Paused (see `app_state::AppState::new`), and
                // ticks are no-ops until an operator explicitly resumes.
                if *app_state.trading_mode.read() != TradingMode::Live {
                    return;
                }
                let clock = Clock::new();
                strategist.tick_cycle(clock.now_time_kst(), clock.today_kst()).await;
            }
        };

        tokio::spawn(clock::run_scheduler(scheduler, SCHEDULER_POLL_INTERVAL, on_event, on_tick));
    }

    info!("all subsystems running, press Ctrl+C to stop");

    // ── 9. Graceful shutdown ──────────────────────────────────────────────
    tokio::signal::ctrl_c().await.map_err(|e| AppError::Runtime(e.into()))?;
    warn!("shutdown signal received — stopping gracefully");

    if let Err(e) = runtime_config.read().save(CONFIG_PATH) {
        error!(error = %e, "failed to save runtime config on shutdown");
    }

    info!("aegis-trader shut down complete");
    Ok(())
}
