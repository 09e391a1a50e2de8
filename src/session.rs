//! Streaming session: state machine, reconnect backoff, heartbeat watch,
//! and the per-session WebSocket task.
//!
//! Each session owns one long-lived connection and its subscription budget.
//! Outside callers never touch the socket; they queue subscribe/unsubscribe
//! commands that the session task drains between network reads. Whenever a
//! session (re)connects it re-issues its full intended instrument set.
//! That re-hydration is the canonical recovery mechanism, so commands queued
//! while disconnected are simply discarded.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeZone, Utc};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::buffer::TickBuffer;
use crate::decoder::{
    decode, heartbeat_answer_frame, set_heartbeat_frame, subscribe_frame, unsubscribe_frame,
};
use crate::models::{instrument_channels, StreamEvent, CHANNELS_PER_INSTRUMENT};
use crate::shutdown::Shutdown;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DRAIN_DEADLINE: Duration = Duration::from_secs(5);
const HEARTBEAT_CHECK: Duration = Duration::from_secs(5);

/// Instruments per subscribe frame during re-hydration.
const REHYDRATE_CHUNK: usize = 50;

// =============================================================================
// STATE MACHINE
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Before the first connection attempt.
    Idle,
    /// TCP + TLS + WebSocket upgrade and initial re-subscription in progress.
    Connecting,
    /// Actively receiving frames.
    Connected,
    /// Graceful shutdown: no new subs, draining in-flight decode.
    Draining,
    /// Connection lost; waiting out the reconnect backoff.
    Broken,
    /// Terminal; only reached through pool shutdown.
    Stopped,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Draining => write!(f, "draining"),
            Self::Broken => write!(f, "broken"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

// =============================================================================
// RECONNECT BACKOFF
// =============================================================================

/// Exponential backoff: base 1 s, doubling, 60 s cap, ±20% jitter, unbounded
/// retries. Jitter keeps a fleet of collectors from thundering the exchange
/// after a shared outage.
#[derive(Debug)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
    rng_state: u64,
}

impl Backoff {
    pub fn new() -> Self {
        Self::with_base_cap(Duration::from_secs(1), Duration::from_secs(60))
    }

    pub fn with_base_cap(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            attempt: 0,
            rng_state: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_nanos() as u64)
                .unwrap_or(0x9E3779B9)
                | 1,
        }
    }

    /// xorshift64; enough entropy for jitter.
    #[inline]
    fn next_random(&mut self) -> f64 {
        self.rng_state ^= self.rng_state << 13;
        self.rng_state ^= self.rng_state >> 7;
        self.rng_state ^= self.rng_state << 17;
        (self.rng_state as f64) / (u64::MAX as f64)
    }

    pub fn next_delay(&mut self) -> Duration {
        let exp = self.base.as_secs_f64() * 2f64.powi(self.attempt.min(30) as i32);
        let capped = exp.min(self.cap.as_secs_f64());
        let jitter = (self.next_random() * 2.0 - 1.0) * 0.2 * capped;
        self.attempt = self.attempt.saturating_add(1);
        Duration::from_secs_f64((capped + jitter).max(0.0))
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// SHARED SESSION STATE
// =============================================================================

#[derive(Debug, Default)]
pub struct SessionStats {
    pub frames: AtomicU64,
    pub quotes: AtomicU64,
    pub trades: AtomicU64,
    pub decode_errors: AtomicU64,
    pub reconnects: AtomicU64,
    pub capacity_breaches: AtomicU64,
}

/// Mutations the pool queues onto a session task. Payloads are channel names.
#[derive(Debug, Clone)]
pub enum SessionCommand {
    Subscribe(Vec<String>),
    Unsubscribe(Vec<String>),
}

/// The pool-visible half of a session. The intended instrument set recorded
/// here is the source of truth for re-hydration and capacity accounting.
pub struct SessionShared {
    pub id: usize,
    pub intended: Mutex<BTreeSet<String>>,
    state: Mutex<SessionState>,
    pub connected: AtomicBool,
    pub broken_since: Mutex<Option<Instant>>,
    pub last_event_ms: AtomicI64,
    /// Channel cap currently honored; halved on an exchange-side
    /// "subscription" error frame until the next reconnect.
    pub effective_cap: AtomicUsize,
    configured_cap: usize,
    pub cmd_tx: mpsc::UnboundedSender<SessionCommand>,
    pub stats: SessionStats,
}

impl SessionShared {
    pub fn new(
        id: usize,
        configured_cap: usize,
        cmd_tx: mpsc::UnboundedSender<SessionCommand>,
    ) -> Self {
        Self {
            id,
            intended: Mutex::new(BTreeSet::new()),
            state: Mutex::new(SessionState::Idle),
            connected: AtomicBool::new(false),
            broken_since: Mutex::new(None),
            last_event_ms: AtomicI64::new(0),
            effective_cap: AtomicUsize::new(configured_cap),
            configured_cap,
            cmd_tx,
            stats: SessionStats::default(),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn set_state(&self, new_state: SessionState) {
        let old = {
            let mut state = self.state.lock();
            std::mem::replace(&mut *state, new_state)
        };
        if old != new_state {
            info!(session_id = self.id, from = %old, to = %new_state, "session_state");
        }
        match new_state {
            SessionState::Connected => {
                self.connected.store(true, Ordering::SeqCst);
                *self.broken_since.lock() = None;
            }
            SessionState::Broken => {
                self.connected.store(false, Ordering::SeqCst);
                let mut since = self.broken_since.lock();
                if since.is_none() {
                    *since = Some(Instant::now());
                }
            }
            _ => {
                self.connected.store(false, Ordering::SeqCst);
            }
        }
    }

    pub fn channels(&self) -> usize {
        self.intended.lock().len() * CHANNELS_PER_INSTRUMENT
    }

    pub fn instrument_count(&self) -> usize {
        self.intended.lock().len()
    }

    /// Exchange flagged a subscription overflow: halve the cap estimate
    /// until reconnect restores the configured value.
    pub fn note_capacity_breach(&self) {
        let halved = (self.configured_cap / 2).max(CHANNELS_PER_INSTRUMENT);
        self.effective_cap.store(halved, Ordering::SeqCst);
        self.stats.capacity_breaches.fetch_add(1, Ordering::Relaxed);
        warn!(
            session_id = self.id,
            effective_cap = halved,
            "session_capacity_estimate_halved"
        );
    }

    fn restore_capacity(&self) {
        self.effective_cap
            .store(self.configured_cap, Ordering::SeqCst);
    }

    pub fn record_market_event(&self) {
        self.last_event_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn last_event(&self) -> Option<DateTime<Utc>> {
        let ms = self.last_event_ms.load(Ordering::Relaxed);
        if ms == 0 {
            None
        } else {
            Utc.timestamp_millis_opt(ms).single()
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let instruments: Vec<String> = self.intended.lock().iter().cloned().collect();
        SessionSnapshot {
            session_id: self.id,
            state: self.state().to_string(),
            connected: self.connected.load(Ordering::SeqCst),
            instruments_count: instruments.len(),
            channels: instruments.len() * CHANNELS_PER_INSTRUMENT,
            instruments,
            last_event_instant: self.last_event(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub session_id: usize,
    pub state: String,
    pub connected: bool,
    pub instruments_count: usize,
    pub channels: usize,
    pub instruments: Vec<String>,
    pub last_event_instant: Option<DateTime<Utc>>,
}

// =============================================================================
// SESSION TASK
// =============================================================================

pub struct SessionRunner {
    shared: Arc<SessionShared>,
    ws_url: String,
    buffer: Arc<TickBuffer>,
    heartbeat_interval: Duration,
    cmd_rx: mpsc::UnboundedReceiver<SessionCommand>,
    backoff: Backoff,
    next_request_id: u64,
}

impl SessionRunner {
    pub fn new(
        shared: Arc<SessionShared>,
        ws_url: String,
        buffer: Arc<TickBuffer>,
        heartbeat_interval: Duration,
        cmd_rx: mpsc::UnboundedReceiver<SessionCommand>,
    ) -> Self {
        Self {
            shared,
            ws_url,
            buffer,
            heartbeat_interval,
            cmd_rx,
            backoff: Backoff::new(),
            next_request_id: 0,
        }
    }

    fn request_id(&mut self) -> u64 {
        self.next_request_id += 1;
        self.next_request_id
    }

    pub async fn run(mut self, mut shutdown: Shutdown) {
        while !shutdown.is_triggered() {
            self.shared.set_state(SessionState::Connecting);
            match self.connect_and_stream(&mut shutdown).await {
                Ok(()) => break,
                Err(err) => {
                    if shutdown.is_triggered() {
                        break;
                    }
                    self.shared.set_state(SessionState::Broken);
                    self.shared.stats.reconnects.fetch_add(1, Ordering::Relaxed);
                    let delay = self.backoff.next_delay();
                    warn!(
                        session_id = self.shared.id,
                        error = %err,
                        delay_ms = delay.as_millis() as u64,
                        attempt = self.backoff.attempt(),
                        "session_broken_reconnecting"
                    );
                    tokio::select! {
                        _ = shutdown.triggered() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
        self.shared.set_state(SessionState::Stopped);
    }

    /// One connection lifetime: handshake, re-hydrate, stream until broken
    /// or shut down. `Ok(())` means a clean drain; any error reconnects.
    async fn connect_and_stream(&mut self, shutdown: &mut Shutdown) -> anyhow::Result<()> {
        let connect = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(self.ws_url.as_str()));
        let (ws, _response) = tokio::select! {
            _ = shutdown.triggered() => return Ok(()),
            result = connect => match result {
                Ok(Ok(ok)) => ok,
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => anyhow::bail!("connect timeout"),
            },
        };

        let (mut sink, mut stream) = ws.split();

        // Ask the server for its heartbeat cadence, then re-issue the full
        // intended set. Commands queued while disconnected are superseded by
        // this re-hydration, so drop them first.
        while self.cmd_rx.try_recv().is_ok() {}

        let hb_id = self.request_id();
        sink.send(Message::Text(set_heartbeat_frame(
            hb_id,
            self.heartbeat_interval.as_secs(),
        )))
        .await?;

        let intended: Vec<String> = self.shared.intended.lock().iter().cloned().collect();
        for chunk in intended.chunks(REHYDRATE_CHUNK) {
            let channels: Vec<String> = chunk
                .iter()
                .flat_map(|name| instrument_channels(name))
                .collect();
            let id = self.request_id();
            sink.send(Message::Text(subscribe_frame(id, &channels))).await?;
        }

        self.shared.restore_capacity();
        self.backoff.reset();
        self.shared.set_state(SessionState::Connected);
        info!(
            session_id = self.shared.id,
            instruments = intended.len(),
            "subscriptions_rehydrated"
        );

        let mut last_frame = Instant::now();
        let read_deadline = self.heartbeat_interval * 2;
        let mut hb_check = tokio::time::interval(HEARTBEAT_CHECK);

        loop {
            tokio::select! {
                _ = shutdown.triggered() => {
                    return self.drain(sink, stream).await;
                }

                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(SessionCommand::Subscribe(channels)) => {
                            let id = self.request_id();
                            sink.send(Message::Text(subscribe_frame(id, &channels))).await?;
                        }
                        Some(SessionCommand::Unsubscribe(channels)) => {
                            let id = self.request_id();
                            sink.send(Message::Text(unsubscribe_frame(id, &channels))).await?;
                        }
                        None => anyhow::bail!("command channel closed"),
                    }
                }

                _ = hb_check.tick() => {
                    if last_frame.elapsed() > read_deadline {
                        anyhow::bail!(
                            "heartbeat timeout: no frames for {:?}",
                            last_frame.elapsed()
                        );
                    }
                }

                msg = stream.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            last_frame = Instant::now();
                            if let Some(answer) = self.handle_frame(&text) {
                                sink.send(Message::Text(answer)).await?;
                            }
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            last_frame = Instant::now();
                            sink.send(Message::Pong(payload)).await?;
                        }
                        Some(Ok(Message::Pong(_))) => {
                            last_frame = Instant::now();
                        }
                        Some(Ok(Message::Close(frame))) => {
                            anyhow::bail!("server close: {:?}", frame);
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(e.into()),
                        None => anyhow::bail!("stream ended"),
                    }
                }
            }
        }
    }

    /// Decode one frame, route ticks to the buffer, and return an outbound
    /// answer frame when the server requires one.
    fn handle_frame(&mut self, text: &str) -> Option<String> {
        self.shared.stats.frames.fetch_add(1, Ordering::Relaxed);
        match decode(text) {
            Ok(StreamEvent::Quote(quote)) => {
                self.shared.record_market_event();
                self.shared.stats.quotes.fetch_add(1, Ordering::Relaxed);
                self.buffer.push_quote(quote);
                None
            }
            Ok(StreamEvent::Trades(trades)) => {
                self.shared.record_market_event();
                self.shared
                    .stats
                    .trades
                    .fetch_add(trades.len() as u64, Ordering::Relaxed);
                for trade in trades {
                    self.buffer.push_trade(trade);
                }
                None
            }
            Ok(StreamEvent::TestRequest) => {
                let id = self.request_id();
                Some(heartbeat_answer_frame(id))
            }
            Ok(StreamEvent::Heartbeat) => None,
            Ok(StreamEvent::SubscriptionAck(channels)) => {
                debug!(
                    session_id = self.shared.id,
                    channels = channels.len(),
                    "subscription_ack"
                );
                None
            }
            Ok(StreamEvent::ProtocolError { message }) => {
                if message.contains("subscription") {
                    self.shared.note_capacity_breach();
                } else {
                    warn!(session_id = self.shared.id, message = %message, "exchange_error_frame");
                }
                None
            }
            Err(err) => {
                self.shared
                    .stats
                    .decode_errors
                    .fetch_add(1, Ordering::Relaxed);
                debug!(session_id = self.shared.id, reason = %err.reason, "undecodable_frame");
                None
            }
        }
    }

    /// Graceful close: stop accepting commands, flush in-flight decode
    /// within the drain deadline, then stop.
    async fn drain<Si, St>(&mut self, mut sink: Si, mut stream: St) -> anyhow::Result<()>
    where
        Si: SinkExt<Message> + Unpin,
        St: StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        self.shared.set_state(SessionState::Draining);
        let _ = sink.send(Message::Close(None)).await;

        let deadline = tokio::time::sleep(DRAIN_DEADLINE);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => break,
                msg = stream.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        self.handle_frame(&text);
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                },
            }
        }
        info!(session_id = self.shared.id, "session_drained");
        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_doubling_with_jitter() {
        let mut backoff = Backoff::new();
        let d1 = backoff.next_delay();
        assert!(d1 >= Duration::from_millis(800) && d1 <= Duration::from_millis(1200));
        let d2 = backoff.next_delay();
        assert!(d2 >= Duration::from_millis(1600) && d2 <= Duration::from_millis(2400));
        let d3 = backoff.next_delay();
        assert!(d3 >= Duration::from_millis(3200) && d3 <= Duration::from_millis(4800));
    }

    #[test]
    fn backoff_caps_at_sixty_seconds() {
        let mut backoff = Backoff::new();
        for _ in 0..10 {
            backoff.next_delay();
        }
        // Well past the cap: every further delay stays at 60s ± 20%.
        for _ in 0..5 {
            let d = backoff.next_delay();
            assert!(d >= Duration::from_secs(48), "delay {:?} below cap band", d);
            assert!(d <= Duration::from_secs(72), "delay {:?} above cap band", d);
        }
    }

    #[test]
    fn backoff_reset_restarts_schedule() {
        let mut backoff = Backoff::new();
        for _ in 0..8 {
            backoff.next_delay();
        }
        backoff.reset();
        let d = backoff.next_delay();
        assert!(d <= Duration::from_millis(1200));
        assert_eq!(backoff.attempt(), 1);
    }

    #[test]
    fn capacity_breach_halves_until_restore() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let shared = SessionShared::new(0, 500, tx);
        assert_eq!(shared.effective_cap.load(Ordering::SeqCst), 500);
        shared.note_capacity_breach();
        assert_eq!(shared.effective_cap.load(Ordering::SeqCst), 250);
        shared.restore_capacity();
        assert_eq!(shared.effective_cap.load(Ordering::SeqCst), 500);
    }

    #[test]
    fn state_transitions_track_connected_and_broken() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let shared = SessionShared::new(2, 500, tx);
        assert_eq!(shared.state(), SessionState::Idle);

        shared.set_state(SessionState::Connecting);
        assert!(!shared.connected.load(Ordering::SeqCst));

        shared.set_state(SessionState::Connected);
        assert!(shared.connected.load(Ordering::SeqCst));
        assert!(shared.broken_since.lock().is_none());

        shared.set_state(SessionState::Broken);
        assert!(!shared.connected.load(Ordering::SeqCst));
        assert!(shared.broken_since.lock().is_some());

        shared.set_state(SessionState::Connected);
        assert!(shared.broken_since.lock().is_none());
    }

    #[test]
    fn snapshot_reflects_intended_set() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let shared = SessionShared::new(1, 500, tx);
        shared.intended.lock().insert("BTC-PERPETUAL".to_string());
        shared
            .intended
            .lock()
            .insert("BTC-27JUN25-100000-C".to_string());

        let snap = shared.snapshot();
        assert_eq!(snap.session_id, 1);
        assert_eq!(snap.instruments_count, 2);
        assert_eq!(snap.channels, 4);
        assert_eq!(snap.last_event_instant, None);
    }
}
