//! Batch writer: drains the tick buffer and persists batches with retry.
//!
//! One writer task per tick kind. A flush fires on the configured interval
//! or when a queue crosses its high-water mark, whichever comes first.
//! Transient store failures retry the whole batch with exponential backoff;
//! permanent failures fall back to row-by-row salvage and dead-letter the
//! offending rows. A batch that exhausts its retries is returned to the
//! buffer's remaining capacity rather than lost outright.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::buffer::TickBuffer;
use crate::error::StoreError;
use crate::models::{DepthSnapshot, QuoteTick, TradeTick};
use crate::shutdown::Shutdown;
use crate::store::TickStore;

/// Retries per batch on transient failure.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

#[derive(Debug)]
pub struct WriterStats {
    pub quotes_written: AtomicU64,
    pub trades_written: AtomicU64,
    pub depth_written: AtomicU64,
    pub batches_flushed: AtomicU64,
    pub transient_retries: AtomicU64,
    pub dead_lettered: AtomicU64,
    pub dropped_after_retry: AtomicU64,
    /// Epoch millis of the last successful store write; drives the health
    /// endpoint's degraded transition.
    pub last_success_ms: AtomicI64,
}

impl WriterStats {
    pub fn new() -> Self {
        Self {
            quotes_written: AtomicU64::new(0),
            trades_written: AtomicU64::new(0),
            depth_written: AtomicU64::new(0),
            batches_flushed: AtomicU64::new(0),
            transient_retries: AtomicU64::new(0),
            dead_lettered: AtomicU64::new(0),
            dropped_after_retry: AtomicU64::new(0),
            last_success_ms: AtomicI64::new(Utc::now().timestamp_millis()),
        }
    }

    fn record_success(&self) {
        self.last_success_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn last_success_age(&self) -> Duration {
        let last = self.last_success_ms.load(Ordering::Relaxed);
        let delta = Utc::now().timestamp_millis().saturating_sub(last);
        Duration::from_millis(delta.max(0) as u64)
    }
}

impl Default for WriterStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Backoff schedule for transient store failures: 1 s, 2 s, 4 s.
pub fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_secs(1u64 << attempt.min(6))
}

/// Split rows into store-valid rows and rows destined for the dead letter.
pub fn partition_valid<T>(
    rows: Vec<T>,
    validate: impl Fn(&T) -> Result<(), String>,
) -> (Vec<T>, Vec<(T, String)>) {
    let mut valid = Vec::with_capacity(rows.len());
    let mut invalid = Vec::new();
    for row in rows {
        match validate(&row) {
            Ok(()) => valid.push(row),
            Err(reason) => invalid.push((row, reason)),
        }
    }
    (valid, invalid)
}

pub struct BatchWriter {
    store: Arc<TickStore>,
    buffer: Arc<TickBuffer>,
    flush_interval: Duration,
    max_retries: u32,
    pub stats: Arc<WriterStats>,
}

impl BatchWriter {
    pub fn new(store: Arc<TickStore>, buffer: Arc<TickBuffer>, flush_interval: Duration) -> Self {
        Self {
            store,
            buffer,
            flush_interval,
            max_retries: DEFAULT_MAX_RETRIES,
            stats: Arc::new(WriterStats::new()),
        }
    }

    /// Quote writer task.
    pub async fn run_quotes(self: Arc<Self>, mut shutdown: Shutdown) {
        let mut ticker = interval(self.flush_interval);
        loop {
            tokio::select! {
                _ = shutdown.triggered() => break,
                _ = ticker.tick() => {}
                _ = self.buffer.flush_needed() => {}
            }
            self.flush_quotes().await;
        }
        debug!("quote_writer_stopped");
    }

    /// Trade writer task.
    pub async fn run_trades(self: Arc<Self>, mut shutdown: Shutdown) {
        let mut ticker = interval(self.flush_interval);
        loop {
            tokio::select! {
                _ = shutdown.triggered() => break,
                _ = ticker.tick() => {}
                _ = self.buffer.flush_needed() => {}
            }
            self.flush_trades().await;
        }
        debug!("trade_writer_stopped");
    }

    pub async fn flush_quotes(&self) {
        let batch = self.buffer.drain_quotes(usize::MAX);
        if batch.is_empty() {
            return;
        }
        let (valid, invalid) = partition_valid(batch, QuoteTick::validate);
        for (row, reason) in invalid {
            self.dead_letter("quote", serde_json::json!(row), &reason).await;
        }
        if valid.is_empty() {
            return;
        }

        match self.write_with_retry("quotes", &valid, |rows| self.store.insert_quotes(rows)).await {
            Some(written) => {
                self.stats.quotes_written.fetch_add(written, Ordering::Relaxed);
                self.stats.batches_flushed.fetch_add(1, Ordering::Relaxed);
            }
            None => {
                let total = valid.len();
                let dropped = self.buffer.requeue_quotes(valid);
                self.stats
                    .dropped_after_retry
                    .fetch_add(dropped as u64, Ordering::Relaxed);
                error!(
                    batch = total,
                    requeued = total - dropped,
                    dropped,
                    "quote_batch_exhausted_retries"
                );
            }
        }
    }

    pub async fn flush_trades(&self) {
        let batch = self.buffer.drain_trades(usize::MAX);
        if batch.is_empty() {
            return;
        }
        let (valid, invalid) = partition_valid(batch, TradeTick::validate);
        for (row, reason) in invalid {
            self.dead_letter("trade", serde_json::json!(row), &reason).await;
        }
        if valid.is_empty() {
            return;
        }

        match self.write_with_retry("trades", &valid, |rows| self.store.insert_trades(rows)).await {
            Some(written) => {
                self.stats.trades_written.fetch_add(written, Ordering::Relaxed);
                self.stats.batches_flushed.fetch_add(1, Ordering::Relaxed);
            }
            None => {
                let total = valid.len();
                let dropped = self.buffer.requeue_trades(valid);
                self.stats
                    .dropped_after_retry
                    .fetch_add(dropped as u64, Ordering::Relaxed);
                error!(
                    batch = total,
                    requeued = total - dropped,
                    dropped,
                    "trade_batch_exhausted_retries"
                );
            }
        }
    }

    /// Persist a depth batch on behalf of the snapshotter, with the same
    /// retry policy as tick batches. Depth has no buffer to return to, so an
    /// exhausted batch is dropped and counted.
    pub async fn write_depth(&self, rows: Vec<DepthSnapshot>) {
        if rows.is_empty() {
            return;
        }
        match self.write_with_retry("depth", &rows, |r| self.store.insert_depth(r)).await {
            Some(written) => {
                self.stats.depth_written.fetch_add(written, Ordering::Relaxed);
            }
            None => {
                self.stats
                    .dropped_after_retry
                    .fetch_add(rows.len() as u64, Ordering::Relaxed);
                error!(batch = rows.len(), "depth_batch_exhausted_retries");
            }
        }
    }

    /// Retry loop shared by all three kinds. Returns rows written, or `None`
    /// once transient retries are exhausted (caller decides requeue/drop).
    async fn write_with_retry<'a, T, F, Fut>(
        &self,
        kind: &str,
        rows: &'a [T],
        write: F,
    ) -> Option<u64>
    where
        T: serde::Serialize,
        F: Fn(&'a [T]) -> Fut,
        Fut: std::future::Future<Output = Result<u64, StoreError>>,
    {
        let mut attempt = 0u32;
        loop {
            match write(rows).await {
                Ok(written) => {
                    self.stats.record_success();
                    return Some(written);
                }
                Err(StoreError::Transient(msg)) => {
                    if attempt >= self.max_retries {
                        return None;
                    }
                    let delay = backoff_delay(attempt);
                    self.stats.transient_retries.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        kind,
                        attempt,
                        delay_secs = delay.as_secs(),
                        error = %msg,
                        "store_write_retry"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(StoreError::Permanent(msg)) => {
                    // A bad row poisons the batch; salvage row by row so the
                    // rest of the batch still lands.
                    warn!(kind, error = %msg, "store_write_permanent, salvaging per row");
                    return Some(self.salvage_rows(kind, rows, &write).await);
                }
            }
        }
    }

    async fn salvage_rows<'a, T, F, Fut>(&self, kind: &str, rows: &'a [T], write: &F) -> u64
    where
        T: serde::Serialize,
        F: Fn(&'a [T]) -> Fut,
        Fut: std::future::Future<Output = Result<u64, StoreError>>,
    {
        let mut written = 0;
        for (i, row) in rows.iter().enumerate() {
            match write(&rows[i..i + 1]).await {
                Ok(n) => written += n,
                Err(StoreError::Permanent(msg)) => {
                    self.dead_letter(kind, serde_json::json!(row), &msg).await;
                }
                Err(StoreError::Transient(msg)) => {
                    // The store went away mid-salvage; stop burning attempts.
                    warn!(kind, remaining = rows.len() - i, error = %msg, "salvage_interrupted");
                    break;
                }
            }
        }
        if written > 0 {
            self.stats.record_success();
        }
        written
    }

    async fn dead_letter(&self, kind: &str, payload: serde_json::Value, reason: &str) {
        self.stats.dead_lettered.fetch_add(1, Ordering::Relaxed);
        error!(kind, reason, "row_dead_lettered");
        if let Err(e) = self.store.dead_letter(kind, payload, reason).await {
            error!(kind, error = %e, "dead_letter_write_failed");
        }
    }

    /// Shutdown phase: flush whatever remains under a hard deadline. Rows
    /// still buffered at the deadline are dropped with an error-logged count.
    pub async fn final_flush(&self, deadline: Duration) {
        let flushed = tokio::time::timeout(deadline, async {
            self.flush_quotes().await;
            self.flush_trades().await;
        })
        .await;

        let remaining = self.buffer.quotes_len() + self.buffer.trades_len();
        match flushed {
            Ok(()) if remaining == 0 => info!("final_flush_complete"),
            _ => error!(unwritten = remaining, "final_flush_incomplete"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TakerSide;
    use chrono::TimeZone;

    #[test]
    fn backoff_schedule_is_one_two_four() {
        assert_eq!(backoff_delay(0), Duration::from_secs(1));
        assert_eq!(backoff_delay(1), Duration::from_secs(2));
        assert_eq!(backoff_delay(2), Duration::from_secs(4));
    }

    #[test]
    fn partition_valid_splits_bad_rows() {
        let ts = chrono::Utc.timestamp_millis_opt(1_719_561_600_000).unwrap();
        let good = TradeTick {
            ts,
            instrument: "BTC-PERPETUAL".to_string(),
            trade_id: "T-1".to_string(),
            price: 100.0,
            size: 1.0,
            side: TakerSide::Buy,
            iv: None,
            index_price: None,
        };
        let mut bad = good.clone();
        bad.price = -5.0;
        bad.trade_id = "T-2".to_string();

        let (valid, invalid) = partition_valid(vec![good, bad], TradeTick::validate);
        assert_eq!(valid.len(), 1);
        assert_eq!(invalid.len(), 1);
        assert_eq!(valid[0].trade_id, "T-1");
        assert!(invalid[0].1.contains("price"));
    }

    #[test]
    fn last_success_age_starts_near_zero() {
        let stats = WriterStats::new();
        assert!(stats.last_success_age() < Duration::from_secs(5));
    }
}
