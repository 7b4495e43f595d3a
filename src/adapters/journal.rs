//! Trade journal
//!
//! Append-only record of executed round trips for analytics. Producers hand
//! records to a bounded queue and move on; a worker delivers them to the sink
//! with bounded retry. Delivery is at-least-once, downstream dedupes on
//! `record_id`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::coordination::RetryPolicy;
use crate::domain::PositionSide;

/// One closed (or partially closed) trade
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub record_id: Uuid,
    pub strategy: String,
    pub symbol: String,
    pub side: PositionSide,
    pub size: Decimal,
    pub entry_price: Decimal,
    pub exit_price: Decimal,
    pub pnl: Decimal,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Destination of journal records
#[async_trait]
pub trait JournalSink: Send + Sync {
    async fn record(&self, trade: &TradeRecord) -> Result<(), String>;

    async fn flush(&self) -> Result<(), String> {
        Ok(())
    }
}

/// JSON-lines file sink
pub struct JsonlJournal {
    path: PathBuf,
    file: Mutex<Option<tokio::fs::File>>,
}

impl JsonlJournal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: Mutex::new(None),
        }
    }
}

#[async_trait]
impl JournalSink for JsonlJournal {
    async fn record(&self, trade: &TradeRecord) -> Result<(), String> {
        let mut line = serde_json::to_string(trade).map_err(|e| e.to_string())?;
        line.push('\n');

        let mut guard = self.file.lock().await;
        if guard.is_none() {
            if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| e.to_string())?;
            }
            let file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await
                .map_err(|e| format!("{}: {}", self.path.display(), e))?;
            *guard = Some(file);
        }

        let Some(file) = guard.as_mut() else {
            return Err("journal file unavailable".into());
        };
        if let Err(e) = file.write_all(line.as_bytes()).await {
            // Reopen on the next attempt
            *guard = None;
            return Err(e.to_string());
        }
        Ok(())
    }

    async fn flush(&self) -> Result<(), String> {
        if let Some(file) = self.file.lock().await.as_mut() {
            file.sync_data().await.map_err(|e| e.to_string())?;
        }
        Ok(())
    }
}

/// Sink that only logs, used when no journal path is configured
pub struct TracingJournal;

#[async_trait]
impl JournalSink for TracingJournal {
    async fn record(&self, trade: &TradeRecord) -> Result<(), String> {
        info!(
            record_id = %trade.record_id,
            strategy = %trade.strategy,
            symbol = %trade.symbol,
            side = %trade.side,
            entry = %trade.entry_price,
            exit = %trade.exit_price,
            pnl = %trade.pnl,
            "Trade closed"
        );
        Ok(())
    }
}

/// Cheap, cloneable producer side of the journal
#[derive(Clone)]
pub struct JournalHandle {
    tx: mpsc::Sender<TradeRecord>,
    dropped: Arc<AtomicU64>,
}

impl JournalHandle {
    /// Enqueue without waiting; a full queue drops the record
    pub fn record(&self, trade: TradeRecord) {
        if let Err(e) = self.tx.try_send(trade) {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            match e {
                mpsc::error::TrySendError::Full(t) => warn!(
                    record_id = %t.record_id,
                    dropped,
                    "Journal queue full, dropping trade record"
                ),
                mpsc::error::TrySendError::Closed(t) => warn!(
                    record_id = %t.record_id,
                    "Journal worker stopped, dropping trade record"
                ),
            }
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Start the delivery worker. The worker exits once every handle is dropped
/// and the queue is empty.
pub fn spawn_journal(
    sink: Arc<dyn JournalSink>,
    capacity: usize,
    retry: RetryPolicy,
) -> (JournalHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let handle = JournalHandle {
        tx,
        dropped: Arc::new(AtomicU64::new(0)),
    };
    let worker = tokio::spawn(run_worker(sink, rx, retry));
    (handle, worker)
}

async fn run_worker(
    sink: Arc<dyn JournalSink>,
    mut rx: mpsc::Receiver<TradeRecord>,
    retry: RetryPolicy,
) {
    while let Some(trade) = rx.recv().await {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match sink.record(&trade).await {
                Ok(()) => {
                    debug!(record_id = %trade.record_id, "Journal record delivered");
                    break;
                }
                Err(e) if retry.should_retry(attempt) => {
                    warn!(
                        record_id = %trade.record_id,
                        attempt,
                        "Journal delivery failed, retrying: {}",
                        e
                    );
                    tokio::time::sleep(retry.delay_for(attempt)).await;
                }
                Err(e) => {
                    error!(
                        record_id = %trade.record_id,
                        attempts = attempt,
                        "Journal delivery failed, giving up: {}",
                        e
                    );
                    break;
                }
            }
        }
    }

    if let Err(e) = sink.flush().await {
        warn!("Journal flush failed: {}", e);
    }
    debug!("Journal worker stopped");
}
