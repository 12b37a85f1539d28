// =============================================================================
// Typed error taxonomy — see spec category table (§7 of the design doc)
// =============================================================================
//
// Configuration errors (category 1) are not represented here: they surface as
// `anyhow::Error` at startup and the process refuses to run. Everything a
// running component can fail with after that point is a `CoreError` variant,
// so callers match on `kind()` instead of downcasting opaque errors.
// =============================================================================

use thiserror::Error;

/// Every fault a core component can report once the process is running.
#[derive(Debug, Error)]
pub enum CoreError {
    /// HTTP 429/5xx, network timeout, websocket drop. Retried by the caller;
    /// if persistent, escalated to a Risk-Off block by the market watcher.
    #[error("transient broker fault: {0}")]
    TransientBroker(String),

    /// Explicit broker rejection (insufficient balance, invalid qty, market
    /// closed). Never retried.
    #[error("broker rejected request: {0}")]
    BrokerLogical(String),

    /// Quote older than the staleness window, or an empty bar series. Entry
    /// declined, not fatal.
    #[error("stale or missing market data: {0}")]
    DataStale(String),

    /// Rate-limit acquire exceeded its timeout, or reconnects exhausted.
    /// Sets `risk_level = CRITICAL` and blocks new entries.
    #[error("fatal fault: {0}")]
    Fatal(String),

    /// Wraps lower-level I/O/serialization faults that don't fit a category
    /// above (order log write, token cache read).
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Internal, non-fatal refusal by a policy guard (blacklist, max positions,
/// neutral regime, daily-loss limit). Not an error: reported as a
/// `skip_reason` field on the decision log, category 4 in the taxonomy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkipReason(pub String);

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl SkipReason {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
