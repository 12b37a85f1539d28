// =============================================================================
// Order Executor (C4) — three-stage fallback chain, TWAP, parallel entries
// =============================================================================
//
// Ported from `tools/order_executor.py`'s `buy_with_fallback`/`buy_twap`:
// same stage boundaries and sleep timings (150ms settle after stage 1/2,
// 200ms presleep before stage 2, 50ms presleep before stage 3 — tunable via
// `BrokerParams` but defaulted to the original's constants), same
// volume-ratio split-count thresholds for TWAP.
// =============================================================================

use std::sync::Arc;

use chrono::Utc;
use futures_util::future::join_all;
use tracing::{info, warn};

use crate::broker::ws::MarketFeed;
use crate::broker::BrokerClient;
use crate::config::{BrokerParams, RiskLevel};
use crate::errors::{CoreError, CoreResult};
use crate::notifier::Notifier;
use crate::order_log::{OrderLog, OrderLogRecord};
use crate::state::SharedState;
use crate::tick_table::limit_price;
use crate::types::{AccountMode, BalanceSnapshot, Bar, OrderStatusSnapshot};

#[derive(Debug, Clone)]
pub struct FallbackResult {
    pub success: bool,
    pub code: String,
    pub requested_qty: u64,
    pub filled_qty: u64,
    pub stage_used: u8,
    pub final_price: f64,
}

pub struct Executor {
    broker: Arc<dyn BrokerClient>,
    feed: Arc<MarketFeed>,
    log: OrderLog,
    params: BrokerParams,
    mode: AccountMode,
    state: Arc<SharedState>,
    notifier: Arc<Notifier>,
}

impl Executor {
    pub fn new(
        broker: Arc<dyn BrokerClient>,
        feed: Arc<MarketFeed>,
        log: OrderLog,
        params: BrokerParams,
        mode: AccountMode,
        state: Arc<SharedState>,
        notifier: Arc<Notifier>,
    ) -> Self {
        Self { broker, feed, log, params, mode, state, notifier }
    }

    /// Category-6 cascade (spec.md:292/332/336): a `CoreError::Fatal` —
    /// rate-limiter starvation or a reconnect exhaustion bubbling up through
    /// the broker client — blocks new entries and pages, but does not itself
    /// force-liquidate open positions (`run_exit_pass` keeps managing those).
    async fn escalate_fatal(&self, context: &str, detail: &str) {
        warn!(context, detail, "FATAL broker fault, escalating to Risk-Off");
        self.state.set_risk_off(true);
        self.state.update_risk_params(|p| {
            p.risk_level = RiskLevel::Critical;
            p.pyramiding_allowed = false;
        });
        self.notifier
            .send(&format!("FATAL: {context}: {detail}. New entries blocked."))
            .await;
    }

    fn record(&self, kind: &str, success: bool, code: &str, qty: u64, price: f64, order_no: Option<String>, message: Option<String>) {
        self.log.log(OrderLogRecord {
            kind: kind.to_string(),
            success,
            code: code.to_string(),
            qty,
            price,
            mode: self.mode.to_string(),
            timestamp: Utc::now(),
            order_no,
            message,
        });
    }

    /// Poll filled quantity for a just-placed order, tolerating the broker
    /// not yet having settled the fill.
    async fn filled_qty(&self, order_no: &str) -> u64 {
        match self.broker.get_order_status(order_no).await {
            Ok(OrderStatusSnapshot { filled_qty, .. }) => filled_qty as u64,
            Err(e) => {
                warn!(order_no, error = %e, "order status lookup failed, assuming 0 filled");
                0
            }
        }
    }

    /// Three-stage fallback chain: IOC+3ticks -> IOC+5ticks -> market.
    /// `ask1` should be a recent quote; staleness is the caller's concern.
    ///
    /// Determinism (spec §4.4.2/§8): in dry-run mode every call reports
    /// success with the full requested qty and `stage_used = 1` — "Stage-1
    /// success when price is accommodating" — without placing any broker
    /// order.
    pub async fn buy_with_fallback(&self, code: &str, qty: u64, ask1: f64) -> FallbackResult {
        if self.params.dry_run {
            let price = limit_price(ask1, 3);
            self.record("BUY_IOC", true, code, qty, price, None, Some("dry-run".to_string()));
            return FallbackResult {
                success: true,
                code: code.to_string(),
                requested_qty: qty,
                filled_qty: qty,
                stage_used: 1,
                final_price: price,
            };
        }

        let mut remaining = qty;
        let mut filled_total: u64 = 0;

        // ---- Stage 1: IOC + 3 ticks ----------------------------------------
        let price1 = limit_price(ask1, 3);
        info!(code, qty = remaining, price1, "stage1 IOC buy");
        match self.broker.buy_ioc(code, remaining, price1).await {
            Ok(order_no) => {
                self.record("BUY_IOC", true, code, remaining, price1, Some(order_no.clone()), None);
                tokio::time::sleep(std::time::Duration::from_millis(self.params.stage1_settle_ms)).await;
                let filled = self.filled_qty(&order_no).await;
                filled_total += filled;
                if filled >= remaining {
                    return FallbackResult {
                        success: true,
                        code: code.to_string(),
                        requested_qty: qty,
                        filled_qty: filled_total,
                        stage_used: 1,
                        final_price: price1,
                    };
                }
                remaining = remaining.saturating_sub(filled);
            }
            Err(e) => {
                if let CoreError::Fatal(detail) = &e {
                    self.escalate_fatal("stage1 IOC buy", detail).await;
                }
                self.record("BUY_IOC", false, code, remaining, price1, None, Some(e.to_string()));
            }
        }

        // ---- Stage 2: IOC + 5 ticks ------------------------------------------
        tokio::time::sleep(std::time::Duration::from_millis(self.params.stage2_presleep_ms)).await;
        let price2 = limit_price(ask1, 5);
        info!(code, qty = remaining, price2, "stage2 IOC buy");
        match self.broker.buy_ioc(code, remaining, price2).await {
            Ok(order_no) => {
                self.record("BUY_IOC", true, code, remaining, price2, Some(order_no.clone()), None);
                tokio::time::sleep(std::time::Duration::from_millis(self.params.stage1_settle_ms)).await;
                let filled = self.filled_qty(&order_no).await;
                filled_total += filled;
                if filled >= remaining {
                    return FallbackResult {
                        success: true,
                        code: code.to_string(),
                        requested_qty: qty,
                        filled_qty: filled_total,
                        stage_used: 2,
                        final_price: price2,
                    };
                }
                remaining = remaining.saturating_sub(filled);
            }
            Err(e) => {
                if let CoreError::Fatal(detail) = &e {
                    self.escalate_fatal("stage2 IOC buy", detail).await;
                }
                self.record("BUY_IOC", false, code, remaining, price2, None, Some(e.to_string()));
            }
        }

        // ---- Stage 3: market, last resort -------------------------------------
        tokio::time::sleep(std::time::Duration::from_millis(self.params.stage3_presleep_ms)).await;
        warn!(code, qty = remaining, "stage3 market buy, slippage uncapped");
        match self.broker.buy_market(code, remaining).await {
            Ok(order_no) => {
                self.record("BUY_MARKET", true, code, remaining, 0.0, Some(order_no), None);
                filled_total += remaining;
                FallbackResult {
                    success: true,
                    code: code.to_string(),
                    requested_qty: qty,
                    filled_qty: filled_total,
                    stage_used: 3,
                    final_price: 0.0,
                }
            }
            Err(e) => {
                if let CoreError::Fatal(detail) = &e {
                    self.escalate_fatal("stage3 market buy", detail).await;
                }
                self.record("BUY_MARKET", false, code, remaining, 0.0, None, Some(e.to_string()));
                FallbackResult {
                    success: filled_total > 0,
                    code: code.to_string(),
                    requested_qty: qty,
                    filled_qty: filled_total,
                    stage_used: 0,
                    final_price: 0.0,
                }
            }
        }
    }

    /// Fan out several entries concurrently (spec §4.4.3, max 5 concurrent
    /// candidates). Any entry's failure does not affect the others.
    pub async fn buy_parallel_entries(&self, entries: &[(String, u64, f64)]) -> Vec<FallbackResult> {
        let futures = entries
            .iter()
            .map(|(code, qty, ask1)| self.buy_with_fallback(code, *qty, *ask1));
        join_all(futures).await
    }

    pub async fn sell_market(&self, code: &str, qty: u64) -> CoreResult<String> {
        let order_no = self.broker.sell_market(code, qty).await;
        match &order_no {
            Ok(no) => self.record("SELL_MARKET", true, code, qty, 0.0, Some(no.clone()), None),
            Err(e) => self.record("SELL_MARKET", false, code, qty, 0.0, None, Some(e.to_string())),
        }
        order_no
    }

    pub async fn sell_ioc(&self, code: &str, qty: u64, price: f64) -> CoreResult<String> {
        let order_no = self.broker.sell_ioc(code, qty, price).await;
        match &order_no {
            Ok(no) => self.record("SELL_IOC", true, code, qty, price, Some(no.clone()), None),
            Err(e) => self.record("SELL_IOC", false, code, qty, price, None, Some(e.to_string())),
        }
        order_no
    }

    pub async fn cancel_order(&self, order_no: &str, code: &str, qty: u64, price: f64) -> CoreResult<()> {
        self.broker.cancel_order(order_no, code, qty, price).await
    }

    pub async fn get_balance(&self) -> CoreResult<BalanceSnapshot> {
        self.broker.get_balance().await
    }

    pub async fn get_order_status(&self, order_no: &str) -> CoreResult<OrderStatusSnapshot> {
        self.broker.get_order_status(order_no).await
    }

    pub async fn inquire_minute_bars(&self, code: &str, count: u32) -> CoreResult<Vec<Bar>> {
        self.broker.inquire_minute_bars(code, count).await
    }

    /// Decide the TWAP split count from the original's volume-ratio
    /// thresholds (spec §4.4.5): order_ratio < threshold -> 1 split,
    /// < threshold*5 -> 2 splits, otherwise the configured max.
    fn twap_split_count(&self, total_qty: u64, avg_daily_volume: u64) -> u32 {
        if avg_daily_volume == 0 {
            return 1;
        }
        let ratio = total_qty as f64 / avg_daily_volume as f64;
        if ratio < self.params.twap_volume_threshold {
            1
        } else if ratio < self.params.twap_volume_threshold * 5.0 {
            2
        } else {
            self.params.twap_max_splits
        }
    }

    /// Micro-TWAP entry: split `total_qty` across `buy_with_fallback` calls,
    /// pausing `twap_interval_secs` between splits and bailing out early if
    /// tick speed drops below `twap_tick_speed_min`.
    pub async fn buy_twap(
        &self,
        code: &str,
        total_qty: u64,
        ask1: f64,
        avg_daily_volume: u64,
    ) -> Vec<FallbackResult> {
        let num_splits = self.twap_split_count(total_qty, avg_daily_volume).max(1);
        let base = total_qty / num_splits as u64;
        let remainder = total_qty % num_splits as u64;
        let mut quantities = vec![base; num_splits as usize];
        if let Some(last) = quantities.last_mut() {
            *last += remainder;
        }

        info!(code, total_qty, num_splits, "TWAP entry starting");
        let mut results = Vec::with_capacity(quantities.len());

        for (i, qty) in quantities.into_iter().enumerate() {
            if i > 0 {
                let speed = self.feed.tick_speed(code);
                if speed < self.params.twap_tick_speed_min {
                    warn!(code, split = i + 1, speed, "TWAP tick speed too low, stopping split");
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_secs(self.params.twap_interval_secs)).await;
            }

            let result = self.buy_with_fallback(code, qty, ask1).await;
            let succeeded = result.success;
            results.push(result);
            if !succeeded {
                warn!(code, split = i + 1, "TWAP split failed, skipping remainder");
                break;
            }
        }

        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct StubBroker {
        buy_calls: AtomicU32,
        fail_ioc: bool,
    }

    #[async_trait]
    impl BrokerClient for StubBroker {
        async fn buy_ioc(&self, _code: &str, qty: u64, price: f64) -> CoreResult<String> {
            self.buy_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_ioc {
                return Err(CoreError::BrokerLogical("no liquidity".into()));
            }
            let _ = (qty, price);
            Ok("order-1".to_string())
        }
        async fn buy_market(&self, _code: &str, _qty: u64) -> CoreResult<String> {
            Ok("order-market".to_string())
        }
        async fn sell_market(&self, _code: &str, _qty: u64) -> CoreResult<String> {
            Ok("sell-1".to_string())
        }
        async fn sell_ioc(&self, _code: &str, _qty: u64, _price: f64) -> CoreResult<String> {
            Ok("sell-2".to_string())
        }
        async fn cancel_order(&self, _order_no: &str, _code: &str, _qty: u64, _price: f64) -> CoreResult<()> {
            Ok(())
        }
        async fn get_balance(&self) -> CoreResult<BalanceSnapshot> {
            Ok(BalanceSnapshot { cash_krw: 0.0, positions: vec![], total_evaluation_krw: 0.0 })
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

    fn make_executor(fail_ioc: bool) -> Executor {
        let broker: Arc<dyn BrokerClient> = Arc::new(StubBroker { buy_calls: AtomicU32::new(0), fail_ioc });
        let feed = Arc::new(MarketFeed::new());
        let tmp = std::env::temp_dir().join(format!("executor_test_{}", uuid::Uuid::new_v4()));
        let log = OrderLog::spawn(tmp);
        let mut params = BrokerParams::default();
        params.stage1_settle_ms = 1;
        params.stage2_presleep_ms = 1;
        params.stage3_presleep_ms = 1;
        params.twap_interval_secs = 0;
        Executor::new(broker, feed, log, params, AccountMode::Paper, Arc::new(SharedState::new()), Arc::new(Notifier::from_env()))
    }

    #[tokio::test]
    async fn stage1_fill_short_circuits_fallback() {
        let executor = make_executor(false);
        let result = executor.buy_with_fallback("005930", 10, 72_000.0).await;
        assert!(result.success);
        assert_eq!(result.stage_used, 1);
        assert_eq!(result.filled_qty, 10);
    }

    #[tokio::test]
    async fn all_ioc_stages_failing_falls_to_market() {
        let executor = make_executor(true);
        let result = executor.buy_with_fallback("005930", 10, 72_000.0).await;
        assert!(result.success);
        assert_eq!(result.stage_used, 3);
    }

    #[tokio::test]
    async fn dry_run_always_reports_stage1_full_fill_without_calling_broker() {
        let broker: Arc<dyn BrokerClient> = Arc::new(StubBroker { buy_calls: AtomicU32::new(0), fail_ioc: true });
        let feed = Arc::new(MarketFeed::new());
        let tmp = std::env::temp_dir().join(format!("executor_test_{}", uuid::Uuid::new_v4()));
        let log = OrderLog::spawn(tmp);
        let params = BrokerParams { dry_run: true, ..BrokerParams::default() };
        let executor = Executor::new(broker, feed, log, params, AccountMode::Paper, Arc::new(SharedState::new()), Arc::new(Notifier::from_env()));

        let result = executor.buy_with_fallback("005930", 10, 72_000.0).await;
        assert!(result.success);
        assert_eq!(result.stage_used, 1);
        assert_eq!(result.filled_qty, 10);
    }

    #[tokio::test]
    async fn fatal_broker_fault_escalates_risk_off_and_blocks_entries() {
        struct FatalBroker;
        #[async_trait]
        impl BrokerClient for FatalBroker {
            async fn buy_ioc(&self, _code: &str, _qty: u64, _price: f64) -> CoreResult<String> {
                Err(CoreError::Fatal("rate limiter acquire timed out".into()))
            }
            async fn buy_market(&self, _code: &str, _qty: u64) -> CoreResult<String> {
                Err(CoreError::Fatal("rate limiter acquire timed out".into()))
            }
            async fn sell_market(&self, _code: &str, _qty: u64) -> CoreResult<String> {
                Ok("sell-1".to_string())
            }
            async fn sell_ioc(&self, _code: &str, _qty: u64, _price: f64) -> CoreResult<String> {
                Ok("sell-2".to_string())
            }
            async fn cancel_order(&self, _order_no: &str, _code: &str, _qty: u64, _price: f64) -> CoreResult<()> {
                Ok(())
            }
            async fn get_balance(&self) -> CoreResult<BalanceSnapshot> {
                Ok(BalanceSnapshot { cash_krw: 0.0, positions: vec![], total_evaluation_krw: 0.0 })
            }
            async fn get_order_status(&self, _order_no: &str) -> CoreResult<OrderStatusSnapshot> {
                Ok(OrderStatusSnapshot { filled_qty: 0.0, remaining_qty: 0.0, status: crate::types::OrderStatus::Rejected, avg_fill_price: None })
            }
            async fn inquire_minute_bars(&self, _code: &str, _count: u32) -> CoreResult<Vec<Bar>> {
                Ok(vec![])
            }
            async fn pre_warm(&self) -> CoreResult<()> {
                Ok(())
            }
        }

        let state = Arc::new(SharedState::new());
        let tmp = std::env::temp_dir().join(format!("executor_test_{}", uuid::Uuid::new_v4()));
        let log = OrderLog::spawn(tmp);
        let mut params = BrokerParams::default();
        params.stage1_settle_ms = 1;
        params.stage2_presleep_ms = 1;
        params.stage3_presleep_ms = 1;
        let executor = Executor::new(Arc::new(FatalBroker), Arc::new(MarketFeed::new()), log, params, AccountMode::Paper, state.clone(), Arc::new(Notifier::from_env()));

        let result = executor.buy_with_fallback("005930", 10, 72_000.0).await;
        assert!(!result.success);
        assert!(state.is_risk_off());
        assert_eq!(state.get_risk_params().risk_level, RiskLevel::Critical);
        assert!(!state.get_risk_params().pyramiding_allowed);
    }

    #[test]
    fn twap_split_count_thresholds() {
        let executor = make_executor(false);
        assert_eq!(executor.twap_split_count(100, 0), 1);
        assert_eq!(executor.twap_split_count(100, 1_000_000), 1);
        assert_eq!(executor.twap_split_count(3_000, 1_000_000), 2);
        assert_eq!(executor.twap_split_count(50_000, 1_000_000), executor.params.twap_max_splits);
    }
}
