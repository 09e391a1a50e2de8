//! Connection pool: owns the N streaming sessions and the subscription
//! accounting against each session's channel cap.
//!
//! The pool records the intended instrument set per session and queues wire
//! commands onto the owning session task. Capacity checks happen here,
//! synchronously, against the intended set; the session task only ever
//! executes mutations the pool has already admitted.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::buffer::TickBuffer;
use crate::config::Config;
use crate::error::SubscribeError;
use crate::models::{instrument_channels, CHANNELS_PER_INSTRUMENT};
use crate::session::{SessionCommand, SessionRunner, SessionShared, SessionSnapshot};
use crate::shutdown::Shutdown;

/// A session is degraded once broken for this long.
const DEGRADED_AFTER: Duration = Duration::from_secs(60);

#[derive(Debug, Default)]
pub struct PoolStats {
    pub subscribes_applied: AtomicU64,
    pub unsubscribes_applied: AtomicU64,
    pub capacity_rejections: AtomicU64,
}

/// Result of a subscribe/unsubscribe request: partial success is normal and
/// the control response enumerates every bucket.
#[derive(Debug, Default, Clone, Serialize)]
pub struct SubscriptionOutcome {
    /// Instruments the mutation actually changed.
    pub applied: Vec<String>,
    /// Instruments already in the requested state; silently skipped.
    pub skipped: Vec<String>,
    pub failed: Vec<FailedInstrument>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedInstrument {
    pub name: String,
    pub reason: String,
}

pub struct ConnectionPool {
    sessions: Vec<Arc<SessionShared>>,
    runners: Mutex<Vec<SessionRunner>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    pub stats: PoolStats,
}

impl ConnectionPool {
    pub fn new(config: &Config, buffer: Arc<TickBuffer>) -> Self {
        let mut sessions = Vec::with_capacity(config.session_count);
        let mut runners = Vec::with_capacity(config.session_count);

        for id in 0..config.session_count {
            let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
            let shared = Arc::new(SessionShared::new(id, config.session_cap, cmd_tx));
            runners.push(SessionRunner::new(
                shared.clone(),
                config.ws_url.clone(),
                buffer.clone(),
                config.heartbeat_interval(),
                cmd_rx,
            ));
            sessions.push(shared);
        }

        Self {
            sessions,
            runners: Mutex::new(runners),
            handles: Mutex::new(Vec::new()),
            stats: PoolStats::default(),
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn session(&self, id: usize) -> Option<&Arc<SessionShared>> {
        self.sessions.get(id)
    }

    /// Spawn every session task and wait until all are connected or the
    /// deadline elapses (startup proceeds either way; stragglers keep
    /// reconnecting in the background).
    pub async fn start(&self, shutdown: &Shutdown, deadline: Duration) {
        let runners: Vec<SessionRunner> = self.runners.lock().drain(..).collect();
        if runners.is_empty() {
            warn!("pool_already_started");
            return;
        }

        let mut handles = self.handles.lock();
        for runner in runners {
            handles.push(tokio::spawn(runner.run(shutdown.clone())));
        }
        drop(handles);

        let started = Instant::now();
        loop {
            let connected = self
                .sessions
                .iter()
                .filter(|s| s.connected.load(Ordering::SeqCst))
                .count();
            if connected == self.sessions.len() {
                info!(sessions = connected, "pool_connected");
                return;
            }
            if started.elapsed() >= deadline {
                warn!(
                    connected,
                    total = self.sessions.len(),
                    "pool_start_deadline_elapsed"
                );
                return;
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    }

    /// Add instruments to a session. Idempotent; instruments that would
    /// push the channel count past the session's (possibly halved) cap are
    /// rejected individually.
    pub fn subscribe(
        &self,
        session_id: usize,
        instruments: &[String],
    ) -> Result<SubscriptionOutcome, SubscribeError> {
        let session = self
            .sessions
            .get(session_id)
            .ok_or(SubscribeError::UnknownSession(session_id))?;

        let cap = session.effective_cap.load(Ordering::SeqCst);
        let mut outcome = SubscriptionOutcome::default();
        let mut new_channels = Vec::new();

        {
            let mut intended = session.intended.lock();
            for name in instruments {
                if intended.contains(name) {
                    outcome.skipped.push(name.clone());
                    continue;
                }
                if (intended.len() + 1) * CHANNELS_PER_INSTRUMENT > cap {
                    self.stats.capacity_rejections.fetch_add(1, Ordering::Relaxed);
                    let rejection = SubscribeError::CapacityExceeded {
                        session_id,
                        channels: intended.len() * CHANNELS_PER_INSTRUMENT,
                        cap,
                    };
                    outcome.failed.push(FailedInstrument {
                        name: name.clone(),
                        reason: rejection.to_string(),
                    });
                    continue;
                }
                intended.insert(name.clone());
                new_channels.extend(instrument_channels(name));
                outcome.applied.push(name.clone());
            }
        }

        if !new_channels.is_empty() {
            self.stats
                .subscribes_applied
                .fetch_add(outcome.applied.len() as u64, Ordering::Relaxed);
            // Send failures mean the session task is gone; re-hydration on
            // restart replays the intended set anyway.
            let _ = session.cmd_tx.send(SessionCommand::Subscribe(new_channels));
        }
        Ok(outcome)
    }

    /// Remove instruments from a session. Idempotent; absent instruments
    /// are silently skipped.
    pub fn unsubscribe(
        &self,
        session_id: usize,
        instruments: &[String],
    ) -> Result<SubscriptionOutcome, SubscribeError> {
        let session = self
            .sessions
            .get(session_id)
            .ok_or(SubscribeError::UnknownSession(session_id))?;

        let mut outcome = SubscriptionOutcome::default();
        let mut removed_channels = Vec::new();

        {
            let mut intended = session.intended.lock();
            for name in instruments {
                if intended.remove(name) {
                    removed_channels.extend(instrument_channels(name));
                    outcome.applied.push(name.clone());
                } else {
                    outcome.skipped.push(name.clone());
                }
            }
        }

        if !removed_channels.is_empty() {
            self.stats
                .unsubscribes_applied
                .fetch_add(outcome.applied.len() as u64, Ordering::Relaxed);
            let _ = session
                .cmd_tx
                .send(SessionCommand::Unsubscribe(removed_channels));
        }
        Ok(outcome)
    }

    /// Read-only view of every session.
    pub fn session_state(&self) -> Vec<SessionSnapshot> {
        self.sessions.iter().map(|s| s.snapshot()).collect()
    }

    /// Instruments per session, indexed by session id.
    pub fn instrument_counts(&self) -> Vec<usize> {
        self.sessions.iter().map(|s| s.instrument_count()).collect()
    }

    /// Which session currently intends to stream `name`.
    pub fn find_session(&self, name: &str) -> Option<usize> {
        self.sessions
            .iter()
            .position(|s| s.intended.lock().contains(name))
    }

    /// Per-session intended sets, for rebalance planning.
    pub fn assignment(&self) -> Vec<Vec<String>> {
        self.sessions
            .iter()
            .map(|s| s.intended.lock().iter().cloned().collect())
            .collect()
    }

    /// Union of all intended sets; the snapshotter sweeps this.
    pub fn tracked_instruments(&self) -> Vec<String> {
        let mut out = Vec::new();
        for session in &self.sessions {
            out.extend(session.intended.lock().iter().cloned());
        }
        out
    }

    /// True once any session has been broken for longer than the health
    /// threshold.
    pub fn is_degraded(&self) -> bool {
        self.sessions.iter().any(|s| {
            s.broken_since
                .lock()
                .map(|since| since.elapsed() > DEGRADED_AFTER)
                .unwrap_or(false)
        })
    }

    /// Wait for session tasks to finish draining, bounded by `deadline`.
    pub async fn join(&self, deadline: Duration) {
        let handles: Vec<JoinHandle<()>> = self.handles.lock().drain(..).collect();
        let join_all = async {
            for handle in handles {
                let _ = handle.await;
            }
        };
        if tokio::time::timeout(deadline, join_all).await.is_err() {
            warn!("pool_join_deadline_elapsed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn test_config(session_count: usize, session_cap: usize) -> Config {
        Config {
            currency: "BTC".to_string(),
            database_url: "postgres://unused".to_string(),
            session_count,
            session_cap,
            buffer_capacity_quotes: 1024,
            buffer_capacity_trades: 1024,
            flush_interval: Duration::from_secs(3),
            depth_interval: Duration::from_secs(300),
            lifecycle_interval: Duration::from_secs(300),
            rebalance_interval: Duration::from_secs(3600),
            expiry_buffer: Duration::from_secs(300),
            rate_limit_rps: 20.0,
            base_port: 9300,
            ws_url: "wss://unused.invalid/ws".to_string(),
            rest_url: "https://unused.invalid/api".to_string(),
            lifecycle_event_retention_days: 90,
        }
    }

    fn pool(session_count: usize, session_cap: usize) -> ConnectionPool {
        let buffer = Arc::new(TickBuffer::new(1024, 1024));
        ConnectionPool::new(&test_config(session_count, session_cap), buffer)
    }

    fn names(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("BTC-27JUN25-{}000-C", i)).collect()
    }

    #[test]
    fn subscribe_accepts_up_to_cap_and_rejects_rest() {
        // Cap 100 channels = 50 instruments; 101 requested -> 50/51 split.
        let pool = pool(1, 100);
        let outcome = pool.subscribe(0, &names(101)).unwrap();
        assert_eq!(outcome.applied.len(), 50);
        assert_eq!(outcome.failed.len(), 51);
        assert!(outcome.skipped.is_empty());
        assert_eq!(pool.instrument_counts(), vec![50]);
        for failure in &outcome.failed {
            assert!(failure.reason.contains("capacity"));
        }
    }

    #[test]
    fn subscribe_at_exact_cap_changes_nothing_further() {
        let pool = pool(1, 4);
        let accepted = pool.subscribe(0, &names(2)).unwrap();
        assert_eq!(accepted.applied.len(), 2);

        let rejected = pool.subscribe(0, &names(3)).unwrap();
        assert_eq!(rejected.skipped.len(), 2);
        assert_eq!(rejected.failed.len(), 1);
        assert_eq!(pool.instrument_counts(), vec![2]);
    }

    #[test]
    fn subscribe_is_idempotent() {
        let pool = pool(1, 100);
        let first = pool.subscribe(0, &names(3)).unwrap();
        assert_eq!(first.applied.len(), 3);

        let second = pool.subscribe(0, &names(3)).unwrap();
        assert!(second.applied.is_empty());
        assert_eq!(second.skipped.len(), 3);
        assert_eq!(pool.instrument_counts(), vec![3]);
    }

    #[test]
    fn unsubscribe_skips_absent_instruments() {
        let pool = pool(1, 100);
        pool.subscribe(0, &names(2)).unwrap();

        let mut request = names(2);
        request.push("BTC-PERPETUAL".to_string());
        let outcome = pool.unsubscribe(0, &request).unwrap();
        assert_eq!(outcome.applied.len(), 2);
        assert_eq!(outcome.skipped, vec!["BTC-PERPETUAL".to_string()]);
        assert_eq!(pool.instrument_counts(), vec![0]);
    }

    #[test]
    fn unknown_session_is_an_error() {
        let pool = pool(2, 100);
        assert!(matches!(
            pool.subscribe(5, &names(1)),
            Err(SubscribeError::UnknownSession(5))
        ));
    }

    #[test]
    fn find_session_locates_owner() {
        let pool = pool(3, 100);
        pool.subscribe(1, &names(1)).unwrap();
        assert_eq!(pool.find_session(&names(1)[0]), Some(1));
        assert_eq!(pool.find_session("BTC-PERPETUAL"), None);
    }

    #[test]
    fn halved_cap_limits_new_subscribes() {
        let pool = pool(1, 8);
        pool.subscribe(0, &names(2)).unwrap();
        pool.session(0).unwrap().note_capacity_breach();

        // Effective cap is now 4 channels = 2 instruments; both slots taken.
        let outcome = pool.subscribe(0, &names(3)).unwrap();
        assert_eq!(outcome.applied.len(), 0);
        assert_eq!(outcome.skipped.len(), 2);
        assert_eq!(outcome.failed.len(), 1);
    }

    #[test]
    fn fresh_pool_is_not_degraded() {
        let pool = pool(2, 100);
        assert!(!pool.is_degraded());
    }
}
