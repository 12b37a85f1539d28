// =============================================================================
// Order log — async queue with synchronous fallback
// =============================================================================
//
// Ported from `_log_order`/`_log_order_sync` in the original executor: a
// bounded queue drains into a single daily JSON array file, non-blocking on
// the trading path. A full queue falls back to a direct synchronous write so
// a burst of orders never silently loses a record.
// =============================================================================

use std::path::PathBuf;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{error, warn};

const QUEUE_CAPACITY: usize = 256;

/// One logged order event. Serialized as-is into the daily JSON array.
#[derive(Debug, Clone, Serialize)]
pub struct OrderLogRecord {
    #[serde(rename = "type")]
    pub kind: String,
    pub success: bool,
    pub code: String,
    pub qty: u64,
    pub price: f64,
    pub mode: String,
    pub timestamp: chrono::DateTime<Utc>,
    pub order_no: Option<String>,
    pub message: Option<String>,
}

#[derive(Clone)]
pub struct OrderLog {
    sender: mpsc::Sender<OrderLogRecord>,
    dir: PathBuf,
}

impl OrderLog {
    /// Spawn the background drain task and return a handle. `dir` is the
    /// directory the daily `orders_YYYYMMDD.json` file is written under.
    pub fn spawn(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        let (sender, mut receiver) = mpsc::channel::<OrderLogRecord>(QUEUE_CAPACITY);
        let drain_dir = dir.clone();

        tokio::spawn(async move {
            while let Some(record) = receiver.recv().await {
                if let Err(e) = append_record(&drain_dir, &record) {
                    error!(error = %e, "order log drain failed to write record");
                }
            }
        });

        Self { sender, dir }
    }

    /// Enqueue a record for background persistence. Falls back to a
    /// synchronous write if the queue is momentarily full, never dropping
    /// a record silently.
    pub fn log(&self, record: OrderLogRecord) {
        match self.sender.try_send(record) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(record)) => {
                warn!("order log queue full, writing synchronously");
                if let Err(e) = append_record(&self.dir, &record) {
                    error!(error = %e, "synchronous order log fallback failed");
                }
            }
            Err(mpsc::error::TrySendError::Closed(record)) => {
                if let Err(e) = append_record(&self.dir, &record) {
                    error!(error = %e, "order log drain task gone, synchronous write failed");
                }
            }
        }
    }

    /// Drain any in-flight records by dropping the sender and awaiting the
    /// receiver to go empty — called on graceful shutdown.
    pub async fn flush_on_shutdown(self) {
        drop(self.sender);
        // Background task exits once the channel closes and drains; give it
        // a moment to finish the final writes.
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }
}

fn log_path_for_today(dir: &std::path::Path) -> PathBuf {
    let today = Utc::now().format("%Y%m%d");
    dir.join(format!("orders_{today}.json"))
}

fn append_record(dir: &std::path::Path, record: &OrderLogRecord) -> anyhow::Result<()> {
    std::fs::create_dir_all(dir)?;
    let path = log_path_for_today(dir);

    let mut records: Vec<OrderLogRecord> = if path.exists() {
        let content = std::fs::read_to_string(&path)?;
        serde_json::from_str(&content).unwrap_or_default()
    } else {
        Vec::new()
    };

    records.push(record.clone());
    let json = serde_json::to_string_pretty(&records)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, &path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(code: &str) -> OrderLogRecord {
        OrderLogRecord {
            kind: "BUY_IOC".to_string(),
            success: true,
            code: code.to_string(),
            qty: 10,
            price: 72_300.0,
            mode: "paper".to_string(),
            timestamp: Utc::now(),
            order_no: Some("123".to_string()),
            message: None,
        }
    }

    #[test]
    fn append_record_creates_and_extends_daily_file() {
        let tmp = std::env::temp_dir().join(format!("order_log_test_{}", uuid::Uuid::new_v4()));
        append_record(&tmp, &sample("005930")).unwrap();
        append_record(&tmp, &sample("000660")).unwrap();

        let path = log_path_for_today(&tmp);
        let content = std::fs::read_to_string(&path).unwrap();
        let records: Vec<OrderLogRecord> = serde_json::from_str(&content).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].code, "005930");
        assert_eq!(records[1].code, "000660");

        std::fs::remove_dir_all(&tmp).ok();
    }

    #[tokio::test]
    async fn spawn_and_log_writes_through_background_task() {
        let tmp = std::env::temp_dir().join(format!("order_log_async_{}", uuid::Uuid::new_v4()));
        let log = OrderLog::spawn(&tmp);
        log.log(sample("005930"));
        log.flush_on_shutdown().await;

        let path = log_path_for_today(&tmp);
        let content = std::fs::read_to_string(&path).unwrap();
        let records: Vec<OrderLogRecord> = serde_json::from_str(&content).unwrap();
        assert_eq!(records.len(), 1);

        std::fs::remove_dir_all(&tmp).ok();
    }
}
