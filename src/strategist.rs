// =============================================================================
// Strategist (C6) — the tick-cycle orchestrator
// =============================================================================
//
// Wires C2 (shared state), C4 (executor), C5 (position lifecycle), the signal
// layer, and the sizing pipeline into the per-tick decision loop (spec
// §4.6.1) plus the two scheduled handlers it owns: the 14:30 Track-2
// transition and the 15:10 Track-1 force close. The macro analyst, the
// candidate scanner and the market watcher are independent upstream/sibling
// components; this module only reacts to what they've already written into
// `SharedState`.
// =============================================================================

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use chrono::{NaiveDate, NaiveTime, Utc};
use parking_lot::RwLock;
use tracing::{info, warn};

use crate::broker::ws::MarketFeed;
use crate::clock::DailyEvent;
use crate::config::StrategyParams;
use crate::decision::DecisionRecord;
use crate::executor::Executor;
use crate::notifier::Notifier;
use crate::position::{self, ExitReason, ExitSignal};
use crate::signals::alignment::Alignment;
use crate::signals::intensity;
use crate::sizing;
use crate::state::{Position, RegimeSnapshot, SharedState, Track, TrackInfo};
use crate::types::{Code, EvalGrade, Quote, QUOTE_STALE_SECONDS};
use crate::watcher::MarketWatcher;

/// Minimum trade-intensity reading required for a fresh entry (spec §4.7.2).
/// Stricter than the 0.60 bar used for Track-2 qualification.
const ENTRY_INTENSITY_THRESHOLD: f64 = 0.70;
const MAX_DECISION_LOG_LEN: usize = 500;

fn parse_hhmm(s: &str) -> NaiveTime {
    NaiveTime::parse_from_str(s, "%H:%M").unwrap_or(NaiveTime::from_hms_opt(0, 0, 0).unwrap())
}

fn quote_is_stale(quote: &Quote) -> bool {
    (Utc::now().timestamp() - quote.tick_timestamp_epoch_s) > QUOTE_STALE_SECONDS
}

pub struct Strategist {
    state: Arc<SharedState>,
    executor: Arc<Executor>,
    feed: Arc<MarketFeed>,
    notifier: Arc<Notifier>,
    watcher: Arc<MarketWatcher>,
    params: StrategyParams,
    max_concurrent_positions: u32,
    max_daily_loss_pct: f64,
    decisions: RwLock<VecDeque<DecisionRecord>>,
    /// One-shot-per-day notification guards, keyed by event name.
    daily_flags: RwLock<HashMap<String, NaiveDate>>,
    /// Codes whose next-day Track-2 gap has already been evaluated today.
    gap_checked: RwLock<HashSet<Code>>,
}

impl Strategist {
    pub fn new(
        state: Arc<SharedState>,
        executor: Arc<Executor>,
        feed: Arc<MarketFeed>,
        notifier: Arc<Notifier>,
        watcher: Arc<MarketWatcher>,
        params: StrategyParams,
        max_concurrent_positions: u32,
        max_daily_loss_pct: f64,
    ) -> Self {
        Self {
            state,
            executor,
            feed,
            notifier,
            watcher,
            params,
            max_concurrent_positions,
            max_daily_loss_pct,
            decisions: RwLock::new(VecDeque::with_capacity(MAX_DECISION_LOG_LEN)),
            daily_flags: RwLock::new(HashMap::new()),
            gap_checked: RwLock::new(HashSet::new()),
        }
    }

    /// Most recent decisions, newest last, for the dashboard/audit surface.
    pub fn recent_decisions(&self) -> Vec<DecisionRecord> {
        self.decisions.read().iter().cloned().collect()
    }

    /// Reset per-day bookkeeping; called from the pre-open (`MacroReady`)
    /// scheduled event.
    pub fn reset_daily(&self) {
        self.state.reset_daily();
        self.gap_checked.write().clear();
        self.daily_flags.write().clear();
    }

    fn push_decision(&self, record: DecisionRecord) {
        let mut log = self.decisions.write();
        if log.len() >= MAX_DECISION_LOG_LEN {
            log.pop_front();
        }
        log.push_back(record);
    }

    fn notify_once_per_day(&self, key: &str, today: NaiveDate, message: &str) {
        {
            let mut flags = self.daily_flags.write();
            if flags.get(key) == Some(&today) {
                return;
            }
            flags.insert(key.to_string(), today);
        }
        warn!("{message}");
    }

    // -- Tick cycle (spec §4.6.1) --------------------------------------------

    /// Run one tick of the strategist loop. `now_kst`/`today` are the
    /// caller's KST wall-clock snapshot, passed in rather than read from a
    /// clock so the cycle is deterministic to test.
    pub async fn tick_cycle(&self, now_kst: NaiveTime, today: NaiveDate) {
        let regime = self.state.get_regime();
        let risk_params = self.state.get_risk_params();

        if regime.urgent_action == crate::state::UrgentAction::ExitAll || risk_params.emergency_liquidate {
            self.emergency_liquidate().await;
            return;
        }

        let daily_loss_tripped = self.state.daily_loss_pct() >= self.max_daily_loss_pct;
        if daily_loss_tripped {
            self.liquidate_all(ExitReason::ForceClose, false).await;
            self.notify_once_per_day(
                "daily_loss_circuit",
                today,
                "daily-loss circuit tripped: new entries blocked and the book is being flattened",
            );
            return;
        }

        self.run_exit_pass(now_kst, today).await;

        if self.state.is_risk_off() {
            return;
        }

        if now_kst < DailyEvent::OpeningRushEnd.time() {
            return;
        }

        let filter = match sizing::apply_regime_filters(&regime) {
            Some(f) => f,
            None => {
                self.notify_once_per_day(
                    "neutral_regime_block",
                    today,
                    "NEUTRAL_REGIME_BLOCK: regime neutral, new entries blocked this cycle",
                );
                return;
            }
        };

        self.run_entry_pass(now_kst, today, &regime, &filter, self.watcher.is_recovered()).await;
    }

    async fn emergency_liquidate(&self) {
        warn!("EMERGENCY LIQUIDATION triggered");
        self.liquidate_all(ExitReason::Emergency, true).await;
        self.notifier
            .send("EMERGENCY LIQUIDATION: all positions flattened, codes blacklisted for the session.")
            .await;
    }

    async fn liquidate_all(&self, reason: ExitReason, blacklist_after: bool) {
        let positions = self.state.get_positions();
        for (code, pos) in positions {
            self.execute_exit(&code, &pos, ExitSignal { reason, price: 0.0 }).await;
            if blacklist_after {
                self.state.add_to_blacklist(&code);
            }
        }
    }

    async fn run_exit_pass(&self, now_kst: NaiveTime, today: NaiveDate) {
        let deadline = parse_hhmm(&self.params.track2_deadline_hhmm);
        let no_pyramid_after = parse_hhmm(&self.params.no_pyramid_after_hhmm);
        let pyramiding_allowed = self.state.get_risk_params().pyramiding_allowed;

        for (code, mut pos) in self.state.get_positions() {
            let Some(quote) = self.feed.latest_quote(&code) else { continue };
            if quote_is_stale(&quote) {
                continue;
            }

            match pos.track {
                Track::One => {
                    if let Some(signal) = position::evaluate_exit(&mut pos, quote.last_price, &self.params) {
                        self.execute_exit(&code, &pos, signal).await;
                        continue;
                    }
                    self.state.update_position(&code, |p| {
                        p.stop_price = pos.stop_price;
                        p.peak_price = pos.peak_price;
                    });
                    if position::should_pyramid(&pos, quote.last_price, &self.params, pyramiding_allowed, now_kst, no_pyramid_after) {
                        self.execute_pyramid(&code, &pos, quote.ask1).await;
                    }
                }
                Track::Two => {
                    if pos.entry_date < today && !self.gap_checked.read().contains(&code) {
                        self.gap_checked.write().insert(code.clone());
                        let prior_close = self.state.get_track(&code).and_then(|t| t.prior_close);
                        if let Some(prior_close) = prior_close {
                            if let Some(signal) = position::track2_gap_down_exit(prior_close, quote.last_price, &self.params) {
                                self.execute_exit(&code, &pos, signal).await;
                                continue;
                            }
                        }
                    }

                    if now_kst >= deadline {
                        self.execute_exit(&code, &pos, ExitSignal { reason: ExitReason::Track2Deadline, price: quote.last_price }).await;
                        continue;
                    }

                    if let Some(signal) = position::track2_trail_exit(&mut pos, quote.last_price, &self.params) {
                        self.execute_exit(&code, &pos, signal).await;
                    } else {
                        self.state.update_position(&code, |p| p.peak_price = pos.peak_price);
                    }
                }
            }
        }
    }

    async fn execute_exit(&self, code: &str, pos: &Position, signal: ExitSignal) {
        match self.executor.sell_market(code, pos.quantity.max(0.0) as u64).await {
            Ok(_) => {
                if signal.price > 0.0 {
                    let pnl_pct = (signal.price - pos.avg_cost) / pos.avg_cost;
                    self.state.add_realized_pnl_pct(pnl_pct);
                }
                self.state.remove_position(code);
                self.push_decision(DecisionRecord::allow(code, "SELL", pos.quantity_fraction));
                info!(code, reason = ?signal.reason, "position exited");
            }
            Err(e) => {
                warn!(code, error = %e, "exit order failed, position remains open");
            }
        }
    }

    async fn execute_pyramid(&self, code: &str, pos: &Position, ask1: f64) {
        let add_qty = (pos.quantity * self.params.pyramid_add_ratio).floor();
        if add_qty < 1.0 {
            return;
        }
        let result = self.executor.buy_with_fallback(code, add_qty as u64, ask1).await;
        if result.success {
            let fill_price = if result.final_price > 0.0 { result.final_price } else { ask1 };
            let params = self.params.clone();
            self.state
                .update_position(code, move |p| position::apply_pyramid_add(p, result.filled_qty as f64, fill_price, &params));
            info!(code, add_qty = result.filled_qty, "pyramid add executed");
        }
    }

    async fn run_entry_pass(
        &self,
        now_kst: NaiveTime,
        today: NaiveDate,
        regime: &RegimeSnapshot,
        filter: &sizing::RegimeFilterResult,
        recovery_active: bool,
    ) {
        let cap = sizing::effective_position_cap(self.max_concurrent_positions, self.params.macro_boost_cap, filter.macro_boost_active);
        let mut open_count = self.state.open_position_count() as u32;
        if open_count >= cap {
            return;
        }

        let equity = match self.executor.get_balance().await {
            Ok(balance) => balance.total_evaluation_krw,
            Err(e) => {
                warn!(error = %e, "balance lookup failed, skipping entry pass");
                return;
            }
        };

        let time_weight = sizing::time_of_day_weight(now_kst);

        for entry in self.state.get_watchlist() {
            if open_count >= cap {
                break;
            }
            if matches!(entry.eval_grade, EvalGrade::D | EvalGrade::F) {
                continue;
            }
            if self.state.get_position(&entry.code).is_some() {
                continue;
            }
            if self.state.is_blacklisted(&entry.code) {
                self.push_decision(DecisionRecord::skip(&entry.code, "BUY", "risk", "blacklisted for the session"));
                continue;
            }

            let Some(quote) = self.feed.latest_quote(&entry.code) else {
                self.push_decision(DecisionRecord::skip(&entry.code, "BUY", "signal", "no quote available"));
                continue;
            };
            if quote_is_stale(&quote) {
                self.push_decision(DecisionRecord::skip(&entry.code, "BUY", "signal", "quote stale"));
                continue;
            }

            let alignment = self.state.get_alignment(&entry.code).unwrap_or(Alignment::Neutral);
            if alignment != Alignment::Up {
                self.push_decision(DecisionRecord::skip(&entry.code, "BUY", "signal", "not 15m-aligned"));
                continue;
            }
            let intensity_score = self.state.get_trade_intensity(&entry.code);
            if !intensity::intensity_allows_entry(intensity_score, ENTRY_INTENSITY_THRESHOLD) {
                self.push_decision(DecisionRecord::skip(&entry.code, "BUY", "signal", "trade intensity below threshold"));
                continue;
            }

            let event_mult = sizing::event_multiplier(Some(entry.day_return_pct), entry.vol_ratio);
            let fraction = sizing::final_position_fraction(
                &self.params,
                filter.multiplier,
                entry.suggested_position_fraction,
                time_weight,
                event_mult,
                regime.strategy_label.as_deref(),
                recovery_active,
                filter.macro_boost_active,
            );
            if fraction <= 0.0 {
                self.push_decision(DecisionRecord::skip(&entry.code, "BUY", "sizing", "final fraction below minimum tradeable size"));
                continue;
            }

            let qty = sizing::quantity_from_fraction(equity, fraction, quote.ask1);
            if qty == 0 {
                self.push_decision(DecisionRecord::skip(&entry.code, "BUY", "sizing", "quantity rounds to zero shares"));
                continue;
            }

            let result = self.executor.buy_with_fallback(&entry.code, qty, quote.ask1).await;
            if result.success {
                let fill_price = if result.final_price > 0.0 { result.final_price } else { quote.ask1 };
                let pos = position::open_position(
                    entry.code.clone(),
                    fill_price,
                    result.filled_qty as f64,
                    fraction,
                    entry.entry_atr,
                    &self.params,
                    Utc::now(),
                    today,
                );
                self.state.add_position(pos);
                self.push_decision(DecisionRecord::allow(&entry.code, "BUY", fraction));
                open_count += 1;
            } else {
                self.push_decision(DecisionRecord::skip(&entry.code, "BUY", "sizing", "entry execution failed"));
            }
        }
    }

    // -- Scheduled handlers (spec §4.5) --------------------------------------

    /// 14:30 Track-2 transition evaluation, Track-1 positions only.
    pub async fn handle_track2_evaluation(&self) {
        let positions = self.state.get_positions();
        let population = positions.values().filter(|p| p.track == Track::Two).count() as u32;
        let watchlist = self.state.get_watchlist();

        for (code, pos) in positions {
            if pos.track != Track::One {
                continue;
            }
            let Some(quote) = self.feed.latest_quote(&code) else { continue };
            let alignment = self.state.get_alignment(&code).unwrap_or(Alignment::Neutral);
            let intensity_score = self.state.get_trade_intensity(&code);
            let entry = watchlist.iter().find(|w| w.code == code);
            let has_catalyst = entry.map(|e| e.catalyst.is_some()).unwrap_or(false);
            let eval_score = entry.map(|e| e.eval_score);

            let qualification = position::evaluate_track2_transition(
                &pos,
                quote.last_price,
                alignment == Alignment::Up,
                intensity_score,
                has_catalyst,
                eval_score,
                population,
                &self.params,
            );

            if qualification.qualifies() {
                self.state.update_position(&code, |p| {
                    p.track = Track::Two;
                    p.peak_price = quote.last_price;
                });
                self.state.set_track(
                    &code,
                    TrackInfo {
                        code: code.clone(),
                        track: Track::Two,
                        entry_price: pos.entry_price,
                        entry_time_hhmmss: Utc::now().format("%H:%M:%S").to_string(),
                        max_pnl_pct_seen: 0.0,
                        prior_close: None,
                    },
                );
                info!(code, "transitioned to Track 2");
            }
        }
    }

    /// 15:10 force close: every remaining Track-1 position exits at market.
    pub async fn handle_force_close(&self) {
        for (code, pos) in self.state.get_positions() {
            if pos.track == Track::One {
                self.execute_exit(&code, &pos, ExitSignal { reason: ExitReason::ForceClose, price: 0.0 }).await;
            }
        }
    }

    /// 15:45 end-of-day report: capture each Track-2 position's closing
    /// quote as `prior_close` for tomorrow's gap-down check.
    pub async fn handle_end_of_day_report(&self) {
        for (code, pos) in self.state.get_positions() {
            if pos.track != Track::Two {
                continue;
            }
            let Some(quote) = self.feed.latest_quote(&code) else { continue };
            let mut info = self.state.get_track(&code).unwrap_or(TrackInfo {
                code: code.clone(),
                track: Track::Two,
                entry_price: pos.entry_price,
                entry_time_hhmmss: String::new(),
                max_pnl_pct_seen: 0.0,
                prior_close: None,
            });
            info.prior_close = Some(quote.last_price);
            self.state.set_track(&code, info);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::broker::BrokerClient;
    use crate::errors::CoreResult;
    use crate::order_log::OrderLog;
    use crate::state::{MacroRisk, RegimeLabel, UrgentAction, WatchlistEntry};
    use crate::types::{AccountMode, BalanceSnapshot, Bar, OrderStatusSnapshot};

    struct StubBroker {
        buy_calls: AtomicU32,
        sell_calls: AtomicU32,
        equity: f64,
    }

    #[async_trait]
    impl BrokerClient for StubBroker {
        async fn buy_ioc(&self, _code: &str, qty: u64, price: f64) -> CoreResult<String> {
            self.buy_calls.fetch_add(1, Ordering::SeqCst);
            let _ = (qty, price);
            Ok("order-buy".to_string())
        }
        async fn buy_market(&self, _code: &str, _qty: u64) -> CoreResult<String> {
            Ok("order-market".to_string())
        }
        async fn sell_market(&self, _code: &str, _qty: u64) -> CoreResult<String> {
            self.sell_calls.fetch_add(1, Ordering::SeqCst);
            Ok("order-sell".to_string())
        }
        async fn sell_ioc(&self, _code: &str, _qty: u64, _price: f64) -> CoreResult<String> {
            Ok("order-sell-ioc".to_string())
        }
        async fn cancel_order(&self, _order_no: &str, _code: &str, _qty: u64, _price: f64) -> CoreResult<()> {
            Ok(())
        }
        async fn get_balance(&self) -> CoreResult<BalanceSnapshot> {
            Ok(BalanceSnapshot { cash_krw: self.equity, positions: vec![], total_evaluation_krw: self.equity })
        }
        async fn get_order_status(&self, _order_no: &str) -> CoreResult<OrderStatusSnapshot> {
            Ok(OrderStatusSnapshot {
                filled_qty: 10.0,
                remaining_qty: 0.0,
                status: crate::types::OrderStatus::Filled,
                avg_fill_price: Some(72_300.0),
            })
        }
        async fn inquire_minute_bars(&self, _code: &str, _count: u32) -> CoreResult<Vec<Bar>> {
            Ok(vec![])
        }
        async fn pre_warm(&self) -> CoreResult<()> {
            Ok(())
        }
    }

    fn make_strategist(equity: f64) -> (Arc<Strategist>, Arc<MarketFeed>, Arc<SharedState>) {
        let state = Arc::new(SharedState::new());
        let feed = Arc::new(MarketFeed::new());
        let broker: Arc<dyn BrokerClient> = Arc::new(StubBroker { buy_calls: AtomicU32::new(0), sell_calls: AtomicU32::new(0), equity });
        let tmp = std::env::temp_dir().join(format!("strategist_test_{}", uuid::Uuid::new_v4()));
        let log = OrderLog::spawn(tmp);
        let mut broker_params = crate::config::BrokerParams::default();
        broker_params.stage1_settle_ms = 1;
        broker_params.stage2_presleep_ms = 1;
        broker_params.stage3_presleep_ms = 1;
        let executor = Arc::new(Executor::new(broker, feed.clone(), log, broker_params, AccountMode::Paper));
        let notifier = Arc::new(Notifier::from_env());
        let watcher = Arc::new(MarketWatcher::new(
            state.clone(),
            notifier.clone(),
            Arc::new(crate::watcher::RegimeSnapshotSource::new(state.clone())),
            Arc::new(crate::watcher::QuantitativeOnlyAdjudicator),
            crate::config::WatcherParams::default(),
        ));
        let strategist = Arc::new(Strategist::new(state.clone(), executor, feed.clone(), notifier, watcher, StrategyParams::default(), 5, 0.03));
        (strategist, feed, state)
    }

    fn set_quote(feed: &MarketFeed, code: &str, price: f64) {
        feed.ingest_trade(code, price, 1000.0, Utc::now().timestamp());
        feed.ingest_orderbook(code, price, price, Utc::now().timestamp());
    }

    fn up_regime() -> RegimeSnapshot {
        RegimeSnapshot {
            risk: MacroRisk::On,
            urgent_action: UrgentAction::None,
            sectors_favored: vec![],
            sectors_avoid: vec![],
            sector_multipliers: HashMap::new(),
            regime_label: RegimeLabel::RiskOn,
            kospi_5d_change_pct: 1.0,
            usd_krw_change_pct: 0.0,
            usd_above_ma20: false,
            strategy_label: None,
            suggested_position_multiplier: Some(1.0),
        }
    }

    fn watchlist_entry(code: &str) -> WatchlistEntry {
        WatchlistEntry {
            code: code.to_string(),
            eval_grade: EvalGrade::A,
            eval_score: 80,
            suggested_position_fraction: 1.0,
            sector: "반도체".to_string(),
            entry_atr: 1_000.0,
            day_return_pct: 0.02,
            vol_ratio: 4.0,
            catalyst: Some("실적 서프라이즈".to_string()),
        }
    }

    #[tokio::test]
    async fn entry_pass_opens_a_position_on_full_qualification() {
        let (strategist, feed, state) = make_strategist(100_000_000.0);
        state.set_regime(up_regime());
        state.set_watchlist(vec![watchlist_entry("005930")]);
        state.set_alignment("005930", Alignment::Up);
        state.set_trade_intensity("005930", 0.9);
        set_quote(&feed, "005930", 72_000.0);

        let now = NaiveTime::from_hms_opt(10, 0, 0).unwrap();
        strategist.tick_cycle(now, Utc::now().date_naive()).await;

        assert!(state.get_position("005930").is_some());
        assert!(strategist.recent_decisions().iter().any(|d| d.final_decision == "ALLOW"));
    }

    #[tokio::test]
    async fn entry_blocked_before_opening_rush_end() {
        let (strategist, feed, state) = make_strategist(100_000_000.0);
        state.set_regime(up_regime());
        state.set_watchlist(vec![watchlist_entry("005930")]);
        state.set_alignment("005930", Alignment::Up);
        state.set_trade_intensity("005930", 0.9);
        set_quote(&feed, "005930", 72_000.0);

        let now = NaiveTime::from_hms_opt(9, 15, 0).unwrap();
        strategist.tick_cycle(now, Utc::now().date_naive()).await;

        assert!(state.get_position("005930").is_none());
    }

    #[tokio::test]
    async fn neutral_regime_blocks_entries_and_notifies_once() {
        let (strategist, feed, state) = make_strategist(100_000_000.0);
        let mut regime = up_regime();
        regime.regime_label = RegimeLabel::Neutral;
        state.set_regime(regime);
        state.set_watchlist(vec![watchlist_entry("005930")]);
        state.set_alignment("005930", Alignment::Up);
        state.set_trade_intensity("005930", 0.9);
        set_quote(&feed, "005930", 72_000.0);

        let now = NaiveTime::from_hms_opt(10, 0, 0).unwrap();
        strategist.tick_cycle(now, Utc::now().date_naive()).await;

        assert!(state.get_position("005930").is_none());
    }

    #[tokio::test]
    async fn misaligned_signal_is_skipped_with_reason() {
        let (strategist, feed, state) = make_strategist(100_000_000.0);
        state.set_regime(up_regime());
        state.set_watchlist(vec![watchlist_entry("005930")]);
        state.set_alignment("005930", Alignment::Down);
        set_quote(&feed, "005930", 72_000.0);

        let now = NaiveTime::from_hms_opt(10, 0, 0).unwrap();
        strategist.tick_cycle(now, Utc::now().date_naive()).await;

        assert!(state.get_position("005930").is_none());
        let decisions = strategist.recent_decisions();
        assert!(decisions.iter().any(|d| d.final_decision == "SKIP" && d.signal_verdict.starts_with("FAIL")));
    }

    #[tokio::test]
    async fn emergency_liquidation_flattens_and_blacklists() {
        let (strategist, feed, state) = make_strategist(100_000_000.0);
        let mut regime = up_regime();
        regime.urgent_action = UrgentAction::ExitAll;
        state.set_regime(regime);
        state.update_risk_params(|p| p.emergency_liquidate = true);

        let pos = position::open_position("005930", 72_000.0, 10.0, 0.2, 1_000.0, &StrategyParams::default(), Utc::now(), Utc::now().date_naive());
        state.add_position(pos);
        set_quote(&feed, "005930", 72_000.0);

        strategist.tick_cycle(NaiveTime::from_hms_opt(10, 0, 0).unwrap(), Utc::now().date_naive()).await;

        assert!(state.get_position("005930").is_none());
        assert!(state.is_blacklisted("005930"));
    }

    #[tokio::test]
    async fn daily_loss_circuit_flattens_book_without_blacklisting() {
        let (strategist, feed, state) = make_strategist(100_000_000.0);
        state.set_regime(up_regime());
        state.add_realized_pnl_pct(-0.05);

        let pos = position::open_position("005930", 72_000.0, 10.0, 0.2, 1_000.0, &StrategyParams::default(), Utc::now(), Utc::now().date_naive());
        state.add_position(pos);
        set_quote(&feed, "005930", 72_000.0);

        strategist.tick_cycle(NaiveTime::from_hms_opt(10, 0, 0).unwrap(), Utc::now().date_naive()).await;

        assert!(state.get_position("005930").is_none());
        assert!(!state.is_blacklisted("005930"));
    }

    #[tokio::test]
    async fn track2_evaluation_transitions_qualifying_position() {
        let (strategist, feed, state) = make_strategist(100_000_000.0);
        let params = StrategyParams::default();
        let pos = position::open_position("005930", 72_000.0, 10.0, 0.2, 1_000.0, &params, Utc::now(), Utc::now().date_naive());
        state.add_position(pos);
        state.set_alignment("005930", Alignment::Up);
        state.set_trade_intensity("005930", 0.90);
        state.set_watchlist(vec![watchlist_entry("005930")]);
        set_quote(&feed, "005930", 72_000.0 * 1.04);

        strategist.handle_track2_evaluation().await;

        let pos = state.get_position("005930").unwrap();
        assert_eq!(pos.track, Track::Two);
    }

    #[tokio::test]
    async fn force_close_exits_remaining_track1_positions() {
        let (strategist, feed, state) = make_strategist(100_000_000.0);
        let pos = position::open_position("005930", 72_000.0, 10.0, 0.2, 1_000.0, &StrategyParams::default(), Utc::now(), Utc::now().date_naive());
        state.add_position(pos);
        set_quote(&feed, "005930", 72_100.0);

        strategist.handle_force_close().await;

        assert!(state.get_position("005930").is_none());
    }
}
