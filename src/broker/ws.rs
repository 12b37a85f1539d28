// =============================================================================
// KIS real-time websocket fan-out
// =============================================================================
//
// One connection carries every subscribed code's trade (H0STCNT0) and
// orderbook (H0STASP0) feeds, fanned out into per-code state the strategist
// loop reads lock-free. Reconnects up to 3 times with a 1s delay between
// attempts (spec §4.3); exhausting retries is a terminal fault — the caller
// is expected to declare Risk-Off and stop trading, not just log a warning.
// =============================================================================

use std::collections::VecDeque;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{error, info, warn};

use crate::types::Quote;

const RECONNECT_ATTEMPTS: u32 = 3;
const RECONNECT_DELAY: std::time::Duration = std::time::Duration::from_secs(1);
const TICK_TIMESTAMP_RING_LEN: usize = 100;

struct CodeState {
    quote: RwLock<Option<Quote>>,
    tick_timestamps: RwLock<VecDeque<i64>>,
}

impl CodeState {
    fn new() -> Self {
        Self {
            quote: RwLock::new(None),
            tick_timestamps: RwLock::new(VecDeque::with_capacity(TICK_TIMESTAMP_RING_LEN)),
        }
    }

    fn record_tick(&self, quote: Quote) {
        *self.quote.write() = Some(quote);
        let mut ring = self.tick_timestamps.write();
        if ring.len() == TICK_TIMESTAMP_RING_LEN {
            ring.pop_front();
        }
        ring.push_back(quote.tick_timestamp_epoch_s);
    }
}

/// Shared, lock-free-to-read tick/quote fan-out for every subscribed code.
pub struct MarketFeed {
    codes: RwLock<std::collections::HashMap<String, Arc<CodeState>>>,
}

impl MarketFeed {
    pub fn new() -> Self {
        Self { codes: RwLock::new(std::collections::HashMap::new()) }
    }

    fn state_for(&self, code: &str) -> Arc<CodeState> {
        if let Some(s) = self.codes.read().get(code) {
            return s.clone();
        }
        let mut map = self.codes.write();
        map.entry(code.to_string()).or_insert_with(|| Arc::new(CodeState::new())).clone()
    }

    pub fn latest_quote(&self, code: &str) -> Option<Quote> {
        self.codes.read().get(code).and_then(|s| *s.quote.read())
    }

    /// Count of ticks observed in the last 1.0s, used by the TWAP splitter to
    /// decide whether the market is fast enough to continue splitting (spec
    /// §4.4.5, `TWAP_TICK_SPEED_MIN`). A rate averaged over the whole ring
    /// never decays to zero once the market actually stops ticking; this
    /// counts only timestamps within the trailing window, same as the
    /// original's `len([t for t in timestamps if now - t <= 1.0])`.
    pub fn tick_speed(&self, code: &str) -> f64 {
        let Some(state) = self.codes.read().get(code).cloned() else {
            return 0.0;
        };
        let now = chrono::Utc::now().timestamp();
        let ring = state.tick_timestamps.read();
        ring.iter().filter(|&&t| now - t <= 1).count() as f64
    }

    pub(crate) fn ingest_trade(&self, code: &str, price: f64, volume: f64, epoch_s: i64) {
        let state = self.state_for(code);
        let prev = state.quote.read().clone();
        let (ask1, bid1) = prev.map(|q| (q.ask1, q.bid1)).unwrap_or((price, price));
        state.record_tick(Quote {
            code_seq: epoch_s as u64,
            last_price: price,
            ask1,
            bid1,
            volume,
            tick_timestamp_epoch_s: epoch_s,
        });
    }

    pub(crate) fn ingest_orderbook(&self, code: &str, ask1: f64, bid1: f64, epoch_s: i64) {
        let state = self.state_for(code);
        let mut guard = state.quote.write();
        let last_price = guard.map(|q| q.last_price).unwrap_or(ask1);
        let volume = guard.map(|q| q.volume).unwrap_or(0.0);
        *guard = Some(Quote {
            code_seq: epoch_s as u64,
            last_price,
            ask1,
            bid1,
            volume,
            tick_timestamp_epoch_s: epoch_s,
        });
    }
}

impl Default for MarketFeed {
    fn default() -> Self {
        Self::new()
    }
}

/// Drive the KIS real-time feed for `codes`, retrying on disconnect. Returns
/// only after `RECONNECT_ATTEMPTS` consecutive failures — a terminal fault
/// for the caller to react to.
pub async fn run_market_feed(
    ws_url: &str,
    approval_key: &str,
    codes: &[String],
    feed: Arc<MarketFeed>,
) -> Result<()> {
    let mut attempt = 0;
    loop {
        match run_once(ws_url, approval_key, codes, &feed).await {
            Ok(()) => {
                warn!("market feed stream ended cleanly, reconnecting");
                attempt = 0;
            }
            Err(e) => {
                attempt += 1;
                error!(attempt, error = %e, "market feed connection failed");
                if attempt >= RECONNECT_ATTEMPTS {
                    bail!("market feed exhausted {RECONNECT_ATTEMPTS} reconnect attempts: {e}");
                }
            }
        }
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}

async fn run_once(
    ws_url: &str,
    approval_key: &str,
    codes: &[String],
    feed: &Arc<MarketFeed>,
) -> Result<()> {
    let (ws_stream, _response) = connect_async(ws_url)
        .await
        .context("failed to connect to KIS real-time feed")?;
    info!(codes = ?codes, "KIS market feed connected");
    let (mut write, mut read) = ws_stream.split();

    for code in codes {
        write.send(Message::Text(subscribe_payload(approval_key, "H0STCNT0", code))).await?;
        write.send(Message::Text(subscribe_payload(approval_key, "H0STASP0", code))).await?;
    }

    while let Some(msg) = read.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                if let Err(e) = handle_frame(&text, feed) {
                    warn!(error = %e, "failed to parse KIS feed frame");
                }
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Ok(Message::Close(_)) => {
                warn!("KIS feed sent close frame");
                return Ok(());
            }
            Ok(_) => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

fn subscribe_payload(approval_key: &str, tr_id: &str, code: &str) -> String {
    serde_json::json!({
        "header": {
            "approval_key": approval_key,
            "custtype": "P",
            "tr_type": "1",
            "content-type": "utf-8",
        },
        "body": {
            "input": { "tr_id": tr_id, "tr_key": code }
        }
    })
    .to_string()
}

/// KIS pipe-delimited real-time frames look like
/// `0|H0STCNT0|001|005930^153000^71500^...`. JSON control frames (ACK,
/// PINGPONG) are ignored here; only data frames feed the tick state.
fn handle_frame(text: &str, feed: &Arc<MarketFeed>) -> Result<()> {
    if !text.starts_with('0') && !text.starts_with('1') {
        return Ok(()); // control/ack frame
    }
    let mut parts = text.splitn(4, '|');
    let _encrypt_flag = parts.next();
    let tr_id = parts.next().context("missing tr_id")?;
    let _count = parts.next();
    let payload = parts.next().context("missing payload")?;
    let fields: Vec<&str> = payload.split('^').collect();

    match tr_id {
        "H0STCNT0" => {
            let code = fields.first().context("missing code")?.to_string();
            let time_str = fields.get(1).context("missing time")?;
            let price: f64 = fields.get(2).context("missing price")?.parse()?;
            let volume: f64 = fields.get(12).unwrap_or(&"0").parse().unwrap_or(0.0);
            let epoch_s = today_hms_to_epoch(time_str)?;
            feed.ingest_trade(&code, price, volume, epoch_s);
        }
        "H0STASP0" => {
            let code = fields.first().context("missing code")?.to_string();
            let ask1: f64 = fields.get(3).context("missing ask1")?.parse()?;
            let bid1: f64 = fields.get(13).context("missing bid1")?.parse()?;
            feed.ingest_orderbook(&code, ask1, bid1, chrono::Utc::now().timestamp());
        }
        _ => {}
    }
    Ok(())
}

fn today_hms_to_epoch(hms: &str) -> Result<i64> {
    if hms.len() != 6 {
        bail!("malformed HHMMSS timestamp: {hms}");
    }
    let today = chrono::Utc::now().format("%Y%m%d").to_string();
    let naive = chrono::NaiveDateTime::parse_from_str(&format!("{today}{hms}"), "%Y%m%d%H%M%S")?;
    Ok(naive.and_utc().timestamp())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ingest_trade_then_orderbook_merges_fields() {
        let feed = MarketFeed::new();
        feed.ingest_trade("005930", 71500.0, 10.0, 1000);
        feed.ingest_orderbook("005930", 71600.0, 71400.0, 1001);
        let q = feed.latest_quote("005930").unwrap();
        assert!((q.last_price - 71500.0).abs() < f64::EPSILON);
        assert!((q.ask1 - 71600.0).abs() < f64::EPSILON);
        assert!((q.bid1 - 71400.0).abs() < f64::EPSILON);
    }

    #[test]
    fn tick_speed_zero_with_no_ticks() {
        let feed = MarketFeed::new();
        assert_eq!(feed.tick_speed("005930"), 0.0);
        assert_eq!(feed.tick_speed("000660"), 0.0);
    }

    #[test]
    fn tick_speed_counts_only_ticks_within_last_second() {
        let feed = MarketFeed::new();
        let now = chrono::Utc::now().timestamp();
        // Stale ticks outside the 1s window must not count.
        feed.ingest_trade("005930", 71500.0, 1.0, now - 10);
        feed.ingest_trade("005930", 71500.0, 1.0, now - 5);
        assert_eq!(feed.tick_speed("005930"), 0.0);

        for _ in 0..5 {
            feed.ingest_trade("005930", 71500.0, 1.0, now);
        }
        assert_eq!(feed.tick_speed("005930"), 5.0);
    }

    #[test]
    fn subscribe_payload_contains_tr_id_and_code() {
        let payload = subscribe_payload("key", "H0STCNT0", "005930");
        assert!(payload.contains("H0STCNT0"));
        assert!(payload.contains("005930"));
    }
}
