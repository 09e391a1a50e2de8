//! Periodic full-depth snapshot sweeps over the tracked instrument set.
//!
//! One sweep per interval, paced by a dedicated token bucket at half the
//! endpoint budget so the lifecycle manager always has headroom. Sweeps
//! never stack: if one overruns its interval the next tick is skipped and a
//! warning logged. The sweep iterates a copy of the tracked set taken at
//! sweep start; instruments added mid-sweep wait for the next one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::catalog::CatalogClient;
use crate::error::CatalogError;
use crate::models::DepthSnapshot;
use crate::pool::ConnectionPool;
use crate::shutdown::Shutdown;
use crate::writer::BatchWriter;

/// Exchange API ceiling on ladder depth.
const MAX_DEPTH_LEVELS: usize = 20;

/// Rows accumulated before an intermediate write during a sweep.
const SWEEP_WRITE_CHUNK: usize = 256;

#[derive(Debug, Default)]
pub struct SnapshotterStats {
    pub sweeps_completed: AtomicU64,
    pub sweeps_overran: AtomicU64,
    pub snapshots_taken: AtomicU64,
    pub snapshot_errors: AtomicU64,
    pub instruments_gone: AtomicU64,
}

pub struct DepthSnapshotter {
    catalog: Arc<CatalogClient>,
    writer: Arc<BatchWriter>,
    pool: Arc<ConnectionPool>,
    sweep_interval: Duration,
    pacer: crate::limiter::TokenBucket,
    pub stats: Arc<SnapshotterStats>,
}

impl DepthSnapshotter {
    pub fn new(
        catalog: Arc<CatalogClient>,
        writer: Arc<BatchWriter>,
        pool: Arc<ConnectionPool>,
        sweep_interval: Duration,
        pace_rps: f64,
    ) -> Self {
        Self {
            catalog,
            writer,
            pool,
            sweep_interval,
            pacer: crate::limiter::TokenBucket::new(pace_rps, pace_rps.max(1.0)),
            stats: Arc::new(SnapshotterStats::default()),
        }
    }

    pub async fn run(self: Arc<Self>, mut shutdown: Shutdown) {
        let mut ticker = interval(self.sweep_interval);
        // An overrunning sweep eats its own tick; never let sweeps stack.
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.triggered() => break,
                _ = ticker.tick() => {}
            }
            if shutdown.is_triggered() {
                break;
            }

            let started = Instant::now();
            self.sweep(&mut shutdown).await;
            let elapsed = started.elapsed();

            if elapsed > self.sweep_interval {
                self.stats.sweeps_overran.fetch_add(1, Ordering::Relaxed);
                warn!(
                    sweep_secs = elapsed.as_secs(),
                    interval_secs = self.sweep_interval.as_secs(),
                    "depth_sweep_overran_interval, next tick skipped"
                );
            }
        }
        debug!("snapshotter_stopped");
    }

    async fn sweep(&self, shutdown: &mut Shutdown) {
        // Snapshot of the tracked set at sweep start; mid-sweep mutations
        // are picked up next time.
        let instruments = self.pool.tracked_instruments();
        if instruments.is_empty() {
            return;
        }
        let total = instruments.len();
        let mut batch: Vec<DepthSnapshot> = Vec::with_capacity(SWEEP_WRITE_CHUNK);
        let mut taken = 0usize;

        for name in instruments {
            tokio::select! {
                _ = shutdown.triggered() => break,
                _ = self.pacer.acquire() => {}
            }

            match self.catalog.fetch_depth(&name, MAX_DEPTH_LEVELS).await {
                Ok(snapshot) => {
                    taken += 1;
                    self.stats.snapshots_taken.fetch_add(1, Ordering::Relaxed);
                    batch.push(snapshot);
                    if batch.len() >= SWEEP_WRITE_CHUNK {
                        self.writer.write_depth(std::mem::take(&mut batch)).await;
                    }
                }
                Err(CatalogError::NotFound(_)) => {
                    // Expired between listing and this call; the lifecycle
                    // manager will retire it on its next pass.
                    self.stats.instruments_gone.fetch_add(1, Ordering::Relaxed);
                    debug!(instrument = %name, "depth_instrument_gone");
                }
                Err(err) => {
                    self.stats.snapshot_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(instrument = %name, error = %err, "depth_fetch_failed");
                }
            }
        }

        self.writer.write_depth(batch).await;
        self.stats.sweeps_completed.fetch_add(1, Ordering::Relaxed);
        info!(taken, total, "depth_sweep_complete");
    }
}
