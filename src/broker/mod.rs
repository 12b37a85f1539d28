// =============================================================================
// Rate-Limited Broker Client (C3)
// =============================================================================
//
// `BrokerClient` is the seam between the strategy/executor layer and the
// concrete REST transport, so `executor.rs` and `position.rs` never see a
// KIS-specific type. `KisClient` is the only implementation today; the trait
// exists so reconcile.rs and tests can run against a fake.
// =============================================================================

pub mod auth;
pub mod client;
pub mod rate_limit;
pub mod ws;

use async_trait::async_trait;

use crate::errors::CoreResult;
use crate::types::{Bar, BalanceSnapshot, OrderStatusSnapshot};

pub use client::KisClient;

/// Transport-agnostic operations the rest of the engine depends on.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// IOC-priced limit buy. Returns the broker order number on acceptance.
    async fn buy_ioc(&self, code: &str, qty: u64, price: f64) -> CoreResult<String>;

    /// Market buy — last resort of the fallback chain.
    async fn buy_market(&self, code: &str, qty: u64) -> CoreResult<String>;

    /// Market sell.
    async fn sell_market(&self, code: &str, qty: u64) -> CoreResult<String>;

    /// IOC-priced limit sell.
    async fn sell_ioc(&self, code: &str, qty: u64, price: f64) -> CoreResult<String>;

    /// Cancel a resting order.
    async fn cancel_order(&self, order_no: &str, code: &str, qty: u64, price: f64) -> CoreResult<()>;

    /// Current account balance and holdings.
    async fn get_balance(&self) -> CoreResult<BalanceSnapshot>;

    /// Fill/cancel state for a previously placed order.
    async fn get_order_status(&self, order_no: &str) -> CoreResult<OrderStatusSnapshot>;

    /// Recent 1-minute bars for `code`, oldest first.
    async fn inquire_minute_bars(&self, code: &str, count: u32) -> CoreResult<Vec<Bar>>;

    /// Issue the first authenticated request of the day to warm the TCP
    /// connection and confirm credentials before the market opens.
    async fn pre_warm(&self) -> CoreResult<()>;
}
