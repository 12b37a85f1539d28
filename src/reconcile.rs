// =============================================================================
// Reconciliation — compare internal state against the broker
// =============================================================================
//
// SAFETY POLICY: this module logs warnings for any drift it discovers but
// never automatically cancels orders or closes positions. A human operator
// or an explicit dashboard control action resolves discrepancies.
// =============================================================================

use std::collections::HashSet;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::broker::BrokerClient;
use crate::errors::CoreResult;
use crate::state::SharedState;
use crate::types::BalanceSnapshot;

/// Summary of a single reconciliation pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileResult {
    /// Internal positions whose code also shows up in the broker's holdings.
    pub positions_matched: u32,
    /// Broker holdings with no corresponding internal position.
    pub orphan_holdings: u32,
    /// Whether the evaluated balance drifted from the previous snapshot.
    pub balance_drift: bool,
    pub timestamp: String,
}

/// Run one reconciliation cycle: fetch the broker balance, cross-check it
/// against `state`'s open positions, and report drift relative to
/// `previous_balance`.
pub async fn reconcile_once(
    broker: &dyn BrokerClient,
    state: &SharedState,
    previous_balance: &Option<BalanceSnapshot>,
) -> CoreResult<(ReconcileResult, BalanceSnapshot)> {
    let now = Utc::now().to_rfc3339();
    info!(timestamp = %now, "reconciliation cycle started");

    let balance = broker.get_balance().await?;
    debug!(holding_count = balance.positions.len(), "broker balance fetched");

    let broker_codes: HashSet<&str> = balance.positions.iter().map(|p| p.code.as_str()).collect();
    let internal = state.get_positions();

    let mut matched: u32 = 0;
    for code in internal.keys() {
        if broker_codes.contains(code.as_str()) {
            matched += 1;
        } else {
            warn!(code = %code, "internal position has no matching broker holding — possible drift");
        }
    }

    let internal_codes: HashSet<&str> = internal.keys().map(|c| c.as_str()).collect();
    let mut orphan: u32 = 0;
    for holding in &balance.positions {
        if !internal_codes.contains(holding.code.as_str()) {
            orphan += 1;
            warn!(code = %holding.code, qty = holding.quantity, "orphan broker holding — no matching internal position");
        }
    }

    let balance_drift = detect_balance_drift(previous_balance.as_ref(), &balance);
    if balance_drift {
        warn!("balance drift detected during reconciliation");
    } else {
        debug!("balance refreshed — no significant drift");
    }

    let result = ReconcileResult {
        positions_matched: matched,
        orphan_holdings: orphan,
        balance_drift,
        timestamp: now.clone(),
    };

    info!(
        positions_matched = matched,
        orphan_holdings = orphan,
        balance_drift,
        timestamp = %now,
        "reconciliation cycle completed"
    );

    Ok((result, balance))
}

/// Relative change in total evaluation beyond 0.01% counts as drift; a first
/// run (no previous snapshot) never reports drift.
fn detect_balance_drift(old: Option<&BalanceSnapshot>, new: &BalanceSnapshot) -> bool {
    let Some(old) = old else { return false };
    if old.total_evaluation_krw <= 0.0 {
        return new.total_evaluation_krw > 0.0;
    }
    let pct_change = ((new.total_evaluation_krw - old.total_evaluation_krw) / old.total_evaluation_krw).abs();
    pct_change > 0.0001
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Position;
    use crate::types::{Bar, BrokerPosition, OrderStatus, OrderStatusSnapshot, Track};
    use async_trait::async_trait;

    struct StubBroker {
        balance: BalanceSnapshot,
    }

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
            Ok(self.balance.clone())
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

    fn sample_position(code: &str) -> Position {
        Position {
            code: code.to_string(),
            entry_price: 10_000.0,
            avg_cost: 10_000.0,
            quantity_fraction: 0.1,
            quantity: 10.0,
            entry_atr: 200.0,
            stop_price: 9_600.0,
            peak_price: 10_000.0,
            hold_days: 0,
            pyramid_count: 0,
            track: Track::One,
            entry_timestamp: Utc::now(),
            entry_date: Utc::now().date_naive(),
        }
    }

    #[tokio::test]
    async fn matches_internal_positions_to_broker_holdings() {
        let state = SharedState::new();
        state.add_position(sample_position("005930"));
        let broker = StubBroker {
            balance: BalanceSnapshot {
                cash_krw: 1_000_000.0,
                positions: vec![BrokerPosition { code: "005930".to_string(), quantity: 10.0, avg_price: 10_000.0 }],
                total_evaluation_krw: 1_100_000.0,
            },
        };
        let (result, _) = reconcile_once(&broker, &state, &None).await.unwrap();
        assert_eq!(result.positions_matched, 1);
        assert_eq!(result.orphan_holdings, 0);
        assert!(!result.balance_drift);
    }

    #[tokio::test]
    async fn flags_orphan_holding_with_no_internal_position() {
        let state = SharedState::new();
        let broker = StubBroker {
            balance: BalanceSnapshot {
                cash_krw: 1_000_000.0,
                positions: vec![BrokerPosition { code: "000660".to_string(), quantity: 5.0, avg_price: 50_000.0 }],
                total_evaluation_krw: 1_250_000.0,
            },
        };
        let (result, _) = reconcile_once(&broker, &state, &None).await.unwrap();
        assert_eq!(result.positions_matched, 0);
        assert_eq!(result.orphan_holdings, 1);
    }

    #[test]
    fn no_drift_without_a_previous_snapshot() {
        let new = BalanceSnapshot { cash_krw: 0.0, positions: vec![], total_evaluation_krw: 500_000.0 };
        assert!(!detect_balance_drift(None, &new));
    }

    #[test]
    fn drift_detected_past_threshold() {
        let old = BalanceSnapshot { cash_krw: 0.0, positions: vec![], total_evaluation_krw: 1_000_000.0 };
        let new = BalanceSnapshot { cash_krw: 0.0, positions: vec![], total_evaluation_krw: 990_000.0 };
        assert!(detect_balance_drift(Some(&old), &new));
    }

    #[test]
    fn no_drift_within_threshold() {
        let old = BalanceSnapshot { cash_krw: 0.0, positions: vec![], total_evaluation_krw: 1_000_000.0 };
        let new = BalanceSnapshot { cash_krw: 0.0, positions: vec![], total_evaluation_krw: 1_000_000.5 };
        assert!(!detect_balance_drift(Some(&old), &new));
    }
}
