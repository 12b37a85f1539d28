// =============================================================================
// Shared primitive types
// =============================================================================

use serde::{Deserialize, Serialize};
use std::fmt;

/// A 6-character immutable numeric security identifier. Primary key for
/// everything position-related.
pub type Code = String;

/// Scanner-assigned quality label. D/F grades must never appear in a live
/// watchlist — the scanner filters them upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EvalGrade {
    #[serde(rename = "A+")]
    APlus,
    A,
    B,
    C,
    D,
    F,
}

impl fmt::Display for EvalGrade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EvalGrade::APlus => "A+",
            EvalGrade::A => "A",
            EvalGrade::B => "B",
            EvalGrade::C => "C",
            EvalGrade::D => "D",
            EvalGrade::F => "F",
        };
        write!(f, "{s}")
    }
}

/// Intraday-only vs overnight-eligible lifecycle track for a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum Track {
    One = 1,
    Two = 2,
}

/// Side of an order or signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

/// Order kind placed by the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderKind {
    BuyIoc,
    BuyMarket,
    SellIoc,
    SellMarket,
    Cancel,
}

/// Time-in-force for a broker order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeInForce {
    Ioc,
    Day,
}

/// Normalized broker order status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Pending,
    Partial,
    Filled,
    Rejected,
    Cancelled,
    Unknown,
    Error,
}

/// Account/trading mode, switched together from `USE_PAPER`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum AccountMode {
    #[default]
    Paper,
    Live,
}

impl fmt::Display for AccountMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccountMode::Paper => write!(f, "paper"),
            AccountMode::Live => write!(f, "live"),
        }
    }
}

/// Normalized account balance snapshot (spec §4.4.4 `get_balance`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceSnapshot {
    pub cash_krw: f64,
    pub positions: Vec<BrokerPosition>,
    pub total_evaluation_krw: f64,
}

/// A single broker-reported holding, as returned by `inquire_balance`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerPosition {
    pub code: Code,
    pub quantity: f64,
    pub avg_price: f64,
}

/// Normalized order-status read (spec §4.4.4 `get_order_status`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderStatusSnapshot {
    pub filled_qty: f64,
    pub remaining_qty: f64,
    pub status: OrderStatus,
    pub avg_fill_price: Option<f64>,
}

/// One OHLCV bar, broker-agnostic.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Bar {
    pub open_time_epoch_s: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Quote snapshot from the websocket fan-out. Never mutated after
/// construction; staleness &gt; 30 s makes it unusable for new entries.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Quote {
    pub code_seq: u64,
    pub last_price: f64,
    pub ask1: f64,
    pub bid1: f64,
    pub volume: f64,
    pub tick_timestamp_epoch_s: i64,
}

pub const QUOTE_STALE_SECONDS: i64 = 30;
