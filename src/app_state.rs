// =============================================================================
// Dashboard State Aggregator
// =============================================================================
//
// Ties the engine's subsystems together for the read-only HTTP/websocket
// surface. Holds no trading authority of its own — every mutation that
// matters to the strategy runs through `SharedState`/`Strategist` directly;
// `AppState` only aggregates a snapshot of it plus the bookkeeping the
// dashboard itself needs (push-on-change versioning, recent errors, the
// reconciliation heartbeat, websocket connection state).
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;

use crate::config::{RiskParams, RuntimeConfig};
use crate::decision::DecisionRecord;
use crate::state::{Position, RegimeSnapshot, SharedState, WatchlistEntry};
use crate::strategist::Strategist;
use crate::types::AccountMode;

const MAX_RECENT_ERRORS: usize = 100;

#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub timestamp: chrono::DateTime<Utc>,
    pub message: String,
}

/// Coarse operator control, independent of the persisted `RuntimeConfig` —
/// a restart always comes back Paused regardless of what was saved, matching
/// the "safe by default" startup policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TradingMode {
    Paused,
    Live,
    Killed,
}

impl std::fmt::Display for TradingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TradingMode::Paused => write!(f, "paused"),
            TradingMode::Live => write!(f, "live"),
            TradingMode::Killed => write!(f, "killed"),
        }
    }
}

pub struct AppState {
    pub state: Arc<SharedState>,
    pub strategist: Arc<Strategist>,
    pub runtime_config: Arc<RwLock<RuntimeConfig>>,
    pub account_mode: AccountMode,

    pub trading_mode: RwLock<TradingMode>,
    ws_sequence_number: AtomicU64,
    pub recent_errors: RwLock<Vec<ErrorRecord>>,
    pub ws_user_connected: RwLock<bool>,
    pub last_ws_user_event: RwLock<Instant>,
    pub last_reconcile_ok: RwLock<Option<Instant>>,
    pub last_reconcile_error: RwLock<Option<String>>,
    start_time: Instant,
}

impl AppState {
    pub fn new(
        state: Arc<SharedState>,
        strategist: Arc<Strategist>,
        runtime_config: Arc<RwLock<RuntimeConfig>>,
        account_mode: AccountMode,
    ) -> Self {
        Self {
            state,
            strategist,
            runtime_config,
            account_mode,
            trading_mode: RwLock::new(TradingMode::Paused),
            ws_sequence_number: AtomicU64::new(0),
            recent_errors: RwLock::new(Vec::new()),
            ws_user_connected: RwLock::new(false),
            last_ws_user_event: RwLock::new(Instant::now()),
            last_reconcile_ok: RwLock::new(None),
            last_reconcile_error: RwLock::new(None),
            start_time: Instant::now(),
        }
    }

    /// Monotonic version the websocket push loop polls for: the core engine's
    /// own version counter (positions/watchlist/regime/etc.) plus
    /// control-plane changes the dashboard makes directly (pause/resume,
    /// heartbeat, connection state).
    pub fn current_state_version(&self) -> u64 {
        self.state.version() + self.ws_sequence_number.load(Ordering::Relaxed)
    }

    pub fn increment_version(&self) {
        self.ws_sequence_number.fetch_add(1, Ordering::Relaxed);
    }

    pub fn push_error(&self, message: impl Into<String>) {
        let mut errors = self.recent_errors.write();
        if errors.len() >= MAX_RECENT_ERRORS {
            errors.remove(0);
        }
        errors.push(ErrorRecord { timestamp: Utc::now(), message: message.into() });
        drop(errors);
        self.increment_version();
    }

    pub fn build_snapshot(&self) -> StateSnapshot {
        let config = self.runtime_config.read().clone();
        let positions: Vec<Position> = self.state.get_positions().into_values().collect();

        StateSnapshot {
            state_version: self.current_state_version(),
            server_time: Utc::now(),
            uptime_secs: self.start_time.elapsed().as_secs(),
            account_mode: self.account_mode,
            trading_mode: *self.trading_mode.read(),
            risk_off: self.state.is_risk_off(),
            daily_loss_pct: self.state.daily_loss_pct(),
            open_position_count: positions.len(),
            positions,
            watchlist: self.state.get_watchlist(),
            regime: self.state.get_regime(),
            recent_decisions: self.strategist.recent_decisions(),
            risk_params: self.state.get_risk_params(),
            runtime_config: RuntimeConfigSummary::from(&config),
            recent_errors: self.recent_errors.read().clone(),
            ws_user_connected: *self.ws_user_connected.read(),
            last_reconcile_ok_secs_ago: self.last_reconcile_ok.read().map(|t| t.elapsed().as_secs()),
            last_reconcile_error: self.last_reconcile_error.read().clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RuntimeConfigSummary {
    pub symbols: Vec<String>,
    pub max_concurrent_positions: u32,
    pub max_daily_loss_pct: f64,
}

impl From<&RuntimeConfig> for RuntimeConfigSummary {
    fn from(config: &RuntimeConfig) -> Self {
        Self {
            symbols: config.symbols.clone(),
            max_concurrent_positions: config.max_concurrent_positions,
            max_daily_loss_pct: config.max_daily_loss_pct,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    pub state_version: u64,
    pub server_time: chrono::DateTime<Utc>,
    pub uptime_secs: u64,
    pub account_mode: AccountMode,
    pub trading_mode: TradingMode,
    pub risk_off: bool,
    pub daily_loss_pct: f64,
    pub open_position_count: usize,
    pub positions: Vec<Position>,
    pub watchlist: Vec<WatchlistEntry>,
    pub regime: RegimeSnapshot,
    pub recent_decisions: Vec<DecisionRecord>,
    pub risk_params: RiskParams,
    pub runtime_config: RuntimeConfigSummary,
    pub recent_errors: Vec<ErrorRecord>,
    pub ws_user_connected: bool,
    pub last_reconcile_ok_secs_ago: Option<u64>,
    pub last_reconcile_error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::ws::MarketFeed;
    use crate::broker::BrokerClient;
    use crate::config::{BrokerParams, StrategyParams, WatcherParams};
    use crate::errors::CoreResult;
    use crate::executor::Executor;
    use crate::notifier::Notifier;
    use crate::order_log::OrderLog;
    use crate::types::{Bar, BalanceSnapshot, OrderStatus, OrderStatusSnapshot};
    use crate::watcher::{MarketWatcher, QuantitativeOnlyAdjudicator, RegimeSnapshotSource};
    use async_trait::async_trait;

    struct StubBroker;

    #[async_trait]
    impl BrokerClient for StubBroker {
        async fn buy_ioc(&self, _code: &str, _qty: u64, _price: f64) -> CoreResult<String> {
            Ok("1".into())
        }
        async fn buy_market(&self, _code: &str, _qty: u64) -> CoreResult<String> {
            Ok("1".into())
        }
        async fn sell_market(&self, _code: &str, _qty: u64) -> CoreResult<String> {
            Ok("1".into())
        }
        async fn sell_ioc(&self, _code: &str, _qty: u64, _price: f64) -> CoreResult<String> {
            Ok("1".into())
        }
        async fn cancel_order(&self, _order_no: &str, _code: &str, _qty: u64, _price: f64) -> CoreResult<()> {
            Ok(())
        }
        async fn get_balance(&self) -> CoreResult<BalanceSnapshot> {
            Ok(BalanceSnapshot { cash_krw: 0.0, positions: vec![], total_evaluation_krw: 0.0 })
        }
        async fn get_order_status(&self, _order_no: &str) -> CoreResult<OrderStatusSnapshot> {
            Ok(OrderStatusSnapshot { filled_qty: 0.0, remaining_qty: 0.0, status: OrderStatus::Filled, avg_fill_price: None })
        }
        async fn inquire_minute_bars(&self, _code: &str, _count: u32) -> CoreResult<Vec<Bar>> {
            Ok(vec![])
        }
        async fn pre_warm(&self) -> CoreResult<()> {
            Ok(())
        }
    }

    fn make_app_state() -> AppState {
        let state = Arc::new(SharedState::new());
        let feed = Arc::new(MarketFeed::new());
        let log = OrderLog::spawn(std::env::temp_dir());
        let executor = Arc::new(Executor::new(
            Arc::new(StubBroker),
            feed.clone(),
            log,
            BrokerParams::default(),
            AccountMode::Paper,
        ));
        let notifier = Arc::new(Notifier::from_env());
        let watcher = Arc::new(MarketWatcher::new(
            state.clone(),
            notifier.clone(),
            Arc::new(RegimeSnapshotSource::new(state.clone())),
            Arc::new(QuantitativeOnlyAdjudicator),
            WatcherParams::default(),
        ));
        let strategist = Arc::new(Strategist::new(
            state.clone(),
            executor,
            feed,
            notifier,
            watcher,
            StrategyParams::default(),
            5,
            3.0,
        ));
        let runtime_config = Arc::new(RwLock::new(RuntimeConfig::default()));
        AppState::new(state, strategist, runtime_config, AccountMode::Paper)
    }

    #[test]
    fn new_app_state_starts_paused() {
        let app = make_app_state();
        assert_eq!(*app.trading_mode.read(), TradingMode::Paused);
    }

    #[test]
    fn increment_version_bumps_state_version() {
        let app = make_app_state();
        let v0 = app.current_state_version();
        app.increment_version();
        assert!(app.current_state_version() > v0);
    }

    #[test]
    fn build_snapshot_reflects_risk_off() {
        let app = make_app_state();
        app.state.set_risk_off(true);
        let snap = app.build_snapshot();
        assert!(snap.risk_off);
    }

    #[test]
    fn push_error_caps_at_max() {
        let app = make_app_state();
        for i in 0..MAX_RECENT_ERRORS + 5 {
            app.push_error(format!("err {i}"));
        }
        assert_eq!(app.build_snapshot().recent_errors.len(), MAX_RECENT_ERRORS);
    }
}
