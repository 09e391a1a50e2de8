//! Bounded in-memory tick buffer between decode and store write.
//!
//! Two lock-free queues, one per tick kind. Pushes never block: on overflow
//! the oldest entry is evicted so the decoder keeps the connection alive and
//! only very stale ticks are lost. A flush detaches the current contents
//! while producers keep writing.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crossbeam::queue::ArrayQueue;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::warn;

use crate::models::{QuoteTick, TradeTick};

/// Queue fill ratio that triggers an early flush.
const HIGH_WATER_PCT: usize = 80;

/// Minimum gap between overflow warnings per queue.
const DROP_WARN_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Default)]
pub struct BufferStats {
    pub pushed_quotes: AtomicU64,
    pub pushed_trades: AtomicU64,
    pub dropped_quotes: AtomicU64,
    pub dropped_trades: AtomicU64,
}

pub struct TickBuffer {
    quotes: ArrayQueue<QuoteTick>,
    trades: ArrayQueue<TradeTick>,
    quote_capacity: usize,
    trade_capacity: usize,
    pub stats: BufferStats,
    flush_signal: Notify,
    last_quote_warn: Mutex<Option<Instant>>,
    last_trade_warn: Mutex<Option<Instant>>,
}

impl TickBuffer {
    pub fn new(quote_capacity: usize, trade_capacity: usize) -> Self {
        Self {
            quotes: ArrayQueue::new(quote_capacity),
            trades: ArrayQueue::new(trade_capacity),
            quote_capacity,
            trade_capacity,
            stats: BufferStats::default(),
            flush_signal: Notify::new(),
            last_quote_warn: Mutex::new(None),
            last_trade_warn: Mutex::new(None),
        }
    }

    /// Admit a quote, evicting the oldest entry on overflow.
    pub fn push_quote(&self, quote: QuoteTick) {
        let mut item = quote;
        loop {
            match self.quotes.push(item) {
                Ok(()) => break,
                Err(rejected) => {
                    item = rejected;
                    if self.quotes.pop().is_some() {
                        let dropped = self.stats.dropped_quotes.fetch_add(1, Ordering::Relaxed) + 1;
                        self.warn_drop("quotes", dropped, &self.last_quote_warn);
                    }
                }
            }
        }
        self.stats.pushed_quotes.fetch_add(1, Ordering::Relaxed);
        if self.quotes_over_high_water() {
            self.flush_signal.notify_waiters();
        }
    }

    /// Admit a trade, evicting the oldest entry on overflow.
    pub fn push_trade(&self, trade: TradeTick) {
        let mut item = trade;
        loop {
            match self.trades.push(item) {
                Ok(()) => break,
                Err(rejected) => {
                    item = rejected;
                    if self.trades.pop().is_some() {
                        let dropped = self.stats.dropped_trades.fetch_add(1, Ordering::Relaxed) + 1;
                        self.warn_drop("trades", dropped, &self.last_trade_warn);
                    }
                }
            }
        }
        self.stats.pushed_trades.fetch_add(1, Ordering::Relaxed);
        if self.trades_over_high_water() {
            self.flush_signal.notify_waiters();
        }
    }

    fn warn_drop(&self, queue: &str, dropped_total: u64, last: &Mutex<Option<Instant>>) {
        let mut last = last.lock();
        let now = Instant::now();
        let due = match *last {
            Some(prev) => now.duration_since(prev) >= DROP_WARN_INTERVAL,
            None => true,
        };
        if due {
            *last = Some(now);
            warn!(queue, dropped_total, "tick_buffer_overflow");
        }
    }

    /// Detach up to `max` quotes. Producers may keep pushing during the drain.
    pub fn drain_quotes(&self, max: usize) -> Vec<QuoteTick> {
        let n = self.quotes.len().min(max);
        let mut out = Vec::with_capacity(n);
        while out.len() < n {
            match self.quotes.pop() {
                Some(q) => out.push(q),
                None => break,
            }
        }
        out
    }

    /// Detach up to `max` trades.
    pub fn drain_trades(&self, max: usize) -> Vec<TradeTick> {
        let n = self.trades.len().min(max);
        let mut out = Vec::with_capacity(n);
        while out.len() < n {
            match self.trades.pop() {
                Some(t) => out.push(t),
                None => break,
            }
        }
        out
    }

    /// Re-admit rows that failed a write and are being returned to the
    /// overflow region. Anything beyond capacity is dropped and counted.
    pub fn requeue_quotes(&self, rows: Vec<QuoteTick>) -> usize {
        let mut dropped = 0;
        for row in rows {
            if self.quotes.push(row).is_err() {
                dropped += 1;
            }
        }
        if dropped > 0 {
            self.stats
                .dropped_quotes
                .fetch_add(dropped as u64, Ordering::Relaxed);
        }
        dropped
    }

    pub fn requeue_trades(&self, rows: Vec<TradeTick>) -> usize {
        let mut dropped = 0;
        for row in rows {
            if self.trades.push(row).is_err() {
                dropped += 1;
            }
        }
        if dropped > 0 {
            self.stats
                .dropped_trades
                .fetch_add(dropped as u64, Ordering::Relaxed);
        }
        dropped
    }

    pub fn quotes_len(&self) -> usize {
        self.quotes.len()
    }

    pub fn trades_len(&self) -> usize {
        self.trades.len()
    }

    pub fn quotes_over_high_water(&self) -> bool {
        self.quotes.len() * 100 >= self.quote_capacity * HIGH_WATER_PCT
    }

    pub fn trades_over_high_water(&self) -> bool {
        self.trades.len() * 100 >= self.trade_capacity * HIGH_WATER_PCT
    }

    /// Resolves when a producer crosses a high-water mark.
    pub async fn flush_needed(&self) {
        self.flush_signal.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn quote(seq: i64) -> QuoteTick {
        QuoteTick {
            ts: Utc.timestamp_millis_opt(seq).unwrap(),
            instrument: "BTC-PERPETUAL".to_string(),
            bid_price: Some(seq as f64),
            bid_size: Some(1.0),
            ask_price: Some(seq as f64 + 1.0),
            ask_size: Some(1.0),
            mark_price: None,
            index_price: None,
            delta: None,
            gamma: None,
            theta: None,
            vega: None,
            rho: None,
            bid_iv: None,
            ask_iv: None,
            mark_iv: None,
            open_interest: None,
            last_price: None,
        }
    }

    #[test]
    fn drains_in_fifo_order() {
        let buffer = TickBuffer::new(10, 10);
        for i in 0..5 {
            buffer.push_quote(quote(i));
        }
        let batch = buffer.drain_quotes(100);
        assert_eq!(batch.len(), 5);
        for (i, q) in batch.iter().enumerate() {
            assert_eq!(q.ts.timestamp_millis(), i as i64);
        }
        assert_eq!(buffer.quotes_len(), 0);
    }

    #[test]
    fn overflow_drops_oldest_and_admits_newest() {
        let buffer = TickBuffer::new(3, 3);
        for i in 0..4 {
            buffer.push_quote(quote(i));
        }
        assert_eq!(buffer.stats.dropped_quotes.load(Ordering::Relaxed), 1);

        let batch = buffer.drain_quotes(100);
        let seqs: Vec<i64> = batch.iter().map(|q| q.ts.timestamp_millis()).collect();
        // Oldest (0) evicted; newest admitted.
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[test]
    fn high_water_mark_at_eighty_percent() {
        let buffer = TickBuffer::new(10, 10);
        for i in 0..7 {
            buffer.push_quote(quote(i));
        }
        assert!(!buffer.quotes_over_high_water());
        buffer.push_quote(quote(7));
        assert!(buffer.quotes_over_high_water());
    }

    #[test]
    fn drain_respects_max_and_leaves_rest() {
        let buffer = TickBuffer::new(10, 10);
        for i in 0..6 {
            buffer.push_quote(quote(i));
        }
        let first = buffer.drain_quotes(4);
        assert_eq!(first.len(), 4);
        assert_eq!(buffer.quotes_len(), 2);
        // Buffer stays writable mid-drain.
        buffer.push_quote(quote(6));
        let rest = buffer.drain_quotes(100);
        assert_eq!(rest.len(), 3);
    }

    #[test]
    fn requeue_drops_beyond_capacity() {
        let buffer = TickBuffer::new(3, 3);
        buffer.push_quote(quote(0));
        buffer.push_quote(quote(1));
        let dropped = buffer.requeue_quotes(vec![quote(2), quote(3)]);
        assert_eq!(dropped, 1);
        assert_eq!(buffer.quotes_len(), 3);
    }
}
