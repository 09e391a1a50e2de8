//! Lifecycle manager: keeps the tracked set aligned with the exchange's
//! live universe, one currency per manager.
//!
//! Each iteration lists the live universe, diffs it against the active rows
//! in `instrument_metadata`, and drives subscribe/unsubscribe through the
//! control surface. Instruments inside the expiry buffer are unsubscribed
//! proactively, before the exchange's settlement window starts emitting
//! messages with different semantics. Every action lands in the
//! `lifecycle_events` audit log, failures included.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::catalog::CatalogClient;
use crate::control::ControlApi;
use crate::models::{
    InstrumentDescriptor, InstrumentKind, LifecycleEvent, LifecycleEventKind, TrackedInstrument,
};
use crate::partitioner::Partitioner;
use crate::shutdown::Shutdown;
use crate::store::TickStore;

const PRUNE_INTERVAL: Duration = Duration::from_secs(24 * 3600);

#[derive(Debug, Default)]
pub struct LifecycleStats {
    pub reconcile_runs: AtomicU64,
    pub reconcile_failures: AtomicU64,
    pub instruments_listed: AtomicU64,
    pub instruments_expired: AtomicU64,
    pub resubscribes: AtomicU64,
    pub rebalances: AtomicU64,
    pub moves_applied: AtomicU64,
}

/// The actions one reconciliation iteration will take. Planning is pure;
/// all store/pool effects happen in the executor.
#[derive(Debug, Default)]
pub struct ReconcilePlan {
    /// Tracked instruments to retire: absent from the universe, or inside
    /// the expiry buffer (even if still listed).
    pub expire: Vec<String>,
    /// Fresh listings to upsert and subscribe (already outside the buffer).
    pub listed: Vec<InstrumentDescriptor>,
    /// Active, still-listed instruments that lost their session assignment
    /// (e.g. an earlier subscribe failed); retried every iteration.
    pub resubscribe: Vec<String>,
    /// Names still present in the universe; `last_seen_at` refresh.
    pub touch: Vec<String>,
}

impl ReconcilePlan {
    pub fn is_empty(&self) -> bool {
        self.expire.is_empty()
            && self.listed.is_empty()
            && self.resubscribe.is_empty()
    }
}

fn within_expiry_buffer(
    expiry: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    buffer: Duration,
) -> bool {
    match expiry {
        Some(at) => {
            let buffer = chrono::Duration::from_std(buffer).unwrap_or_else(|_| chrono::Duration::zero());
            at <= now + buffer
        }
        None => false,
    }
}

/// Diff the tracked set against the live universe.
pub fn plan_reconciliation(
    local: &[TrackedInstrument],
    exchange: &[InstrumentDescriptor],
    assigned: &HashSet<String>,
    now: DateTime<Utc>,
    expiry_buffer: Duration,
) -> ReconcilePlan {
    let exchange_names: HashSet<&str> = exchange.iter().map(|d| d.name.as_str()).collect();
    let local_names: HashSet<&str> = local.iter().map(|t| t.name.as_str()).collect();

    let mut plan = ReconcilePlan::default();

    for tracked in local {
        let listed = exchange_names.contains(tracked.name.as_str());
        let expiring = within_expiry_buffer(tracked.expiry, now, expiry_buffer);

        // Retire when inside the buffer (proactively, even while still
        // listed), or when delisted with no expiry to wait out.
        if expiring || (!listed && tracked.expiry.is_none()) {
            plan.expire.push(tracked.name.clone());
            continue;
        }

        if listed {
            plan.touch.push(tracked.name.clone());
            if !assigned.contains(&tracked.name) {
                plan.resubscribe.push(tracked.name.clone());
            }
        }
    }

    for desc in exchange {
        if local_names.contains(desc.name.as_str()) {
            continue;
        }
        // Never subscribe something already inside its settlement window.
        if within_expiry_buffer(desc.expiry, now, expiry_buffer) {
            continue;
        }
        plan.listed.push(desc.clone());
    }

    plan
}

pub struct LifecycleManager {
    catalog: Arc<CatalogClient>,
    store: Arc<TickStore>,
    control: Arc<ControlApi>,
    partitioner: Arc<Partitioner>,
    currency: String,
    reconcile_interval: Duration,
    expiry_buffer: Duration,
    rebalance_interval: Duration,
    retention_days: i64,
    pub stats: Arc<LifecycleStats>,
}

impl LifecycleManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        catalog: Arc<CatalogClient>,
        store: Arc<TickStore>,
        control: Arc<ControlApi>,
        partitioner: Arc<Partitioner>,
        currency: &str,
        reconcile_interval: Duration,
        expiry_buffer: Duration,
        rebalance_interval: Duration,
        retention_days: i64,
    ) -> Self {
        Self {
            catalog,
            store,
            control,
            partitioner,
            currency: currency.to_string(),
            reconcile_interval,
            expiry_buffer,
            rebalance_interval,
            retention_days,
            stats: Arc::new(LifecycleStats::default()),
        }
    }

    pub async fn run(self: Arc<Self>, mut shutdown: Shutdown) {
        let mut ticker = interval(self.reconcile_interval);
        let mut last_rebalance = Instant::now();
        let mut last_prune = Instant::now();

        loop {
            tokio::select! {
                _ = shutdown.triggered() => break,
                _ = ticker.tick() => {}
            }
            if shutdown.is_triggered() {
                break;
            }

            self.stats.reconcile_runs.fetch_add(1, Ordering::Relaxed);
            if let Err(err) = self.reconcile().await {
                // Transient by construction: permanent per-unit failures are
                // consumed inside the iteration. Retry next tick.
                self.stats.reconcile_failures.fetch_add(1, Ordering::Relaxed);
                warn!(currency = %self.currency, error = %err, "reconcile_failed");
            }

            if last_rebalance.elapsed() >= self.rebalance_interval {
                last_rebalance = Instant::now();
                self.maybe_rebalance().await;
            }

            if last_prune.elapsed() >= PRUNE_INTERVAL {
                last_prune = Instant::now();
                self.prune_audit_log().await;
            }
        }
        debug!(currency = %self.currency, "lifecycle_manager_stopped");
    }

    async fn reconcile(&self) -> anyhow::Result<()> {
        let now = Utc::now();

        let mut exchange = self
            .catalog
            .list_active(&self.currency, InstrumentKind::Option)
            .await?;
        exchange.extend(
            self.catalog
                .list_active(&self.currency, InstrumentKind::Perpetual)
                .await?,
        );

        let local = self.store.active_instruments().await?;
        let assigned: HashSet<String> = self
            .control
            .pool()
            .tracked_instruments()
            .into_iter()
            .collect();

        let plan = plan_reconciliation(&local, &exchange, &assigned, now, self.expiry_buffer);
        if plan.is_empty() {
            self.store.touch_instruments(&plan.touch, now).await?;
            debug!(currency = %self.currency, tracked = plan.touch.len(), "universe_in_sync");
            return Ok(());
        }

        info!(
            currency = %self.currency,
            expired = plan.expire.len(),
            listed = plan.listed.len(),
            resubscribe = plan.resubscribe.len(),
            "reconcile_plan"
        );

        for name in &plan.expire {
            self.retire_instrument(name, now).await?;
        }

        for desc in &plan.listed {
            self.store.upsert_instrument(desc, now).await?;
            self.record(LifecycleEvent::new(LifecycleEventKind::InstrumentListed, &self.currency)
                .instrument(&desc.name))
                .await;
            self.stats.instruments_listed.fetch_add(1, Ordering::Relaxed);
            self.subscribe_instrument(&desc.name).await;
        }

        for name in &plan.resubscribe {
            self.stats.resubscribes.fetch_add(1, Ordering::Relaxed);
            self.subscribe_instrument(name).await;
        }

        self.store.touch_instruments(&plan.touch, now).await?;
        Ok(())
    }

    /// Unsubscribe (best effort), mark inactive, audit. Historical tick
    /// rows are untouched; only the metadata row flips.
    async fn retire_instrument(&self, name: &str, now: DateTime<Utc>) -> anyhow::Result<()> {
        if let Some(session_id) = self.control.pool().find_session(name) {
            let removal = self
                .control
                .unsubscribe(session_id, std::slice::from_ref(&name.to_string()));
            let event = LifecycleEvent::new(
                LifecycleEventKind::SubscriptionRemoved,
                &self.currency,
            )
            .instrument(name)
            .session(session_id);
            match removal {
                Ok(_) => self.record(event).await,
                Err(err) => {
                    // Keep retiring: the session sheds the channel on its
                    // next reconnect regardless.
                    warn!(instrument = %name, error = %err, "unsubscribe_failed");
                    self.record(event.failed(err.to_string())).await;
                }
            }
        }

        self.store.expire_instrument(name, now).await?;
        self.stats.instruments_expired.fetch_add(1, Ordering::Relaxed);
        self.record(
            LifecycleEvent::new(LifecycleEventKind::InstrumentExpired, &self.currency)
                .instrument(name),
        )
        .await;
        Ok(())
    }

    /// Ask the partitioner for a target and subscribe. On failure the
    /// instrument stays active with no assignment, so the next iteration
    /// retries it via the resubscribe path.
    async fn subscribe_instrument(&self, name: &str) {
        let counts = self.control.pool().instrument_counts();
        let target = match self.partitioner.assign(name, &counts) {
            Some(target) => target,
            None => {
                warn!(instrument = %name, "no_session_capacity");
                self.record(
                    LifecycleEvent::new(
                        LifecycleEventKind::SubscriptionAdded,
                        &self.currency,
                    )
                    .instrument(name)
                    .failed("all sessions at capacity"),
                )
                .await;
                return;
            }
        };

        let event = LifecycleEvent::new(LifecycleEventKind::SubscriptionAdded, &self.currency)
            .instrument(name)
            .session(target);
        match self
            .control
            .subscribe(target, std::slice::from_ref(&name.to_string()))
        {
            Ok(outcome) if outcome.failed.is_empty() => self.record(event).await,
            Ok(outcome) => {
                let reason = outcome
                    .failed
                    .first()
                    .map(|f| f.reason.clone())
                    .unwrap_or_else(|| "unknown".to_string());
                warn!(instrument = %name, session_id = target, reason = %reason, "subscribe_rejected");
                self.record(event.failed(reason)).await;
            }
            Err(err) => {
                warn!(instrument = %name, session_id = target, error = %err, "subscribe_failed");
                self.record(event.failed(err.to_string())).await;
            }
        }
    }

    /// Evaluate drift and execute the minimum-movement diff,
    /// unsubscribe-first per move.
    async fn maybe_rebalance(&self) {
        let counts = self.control.pool().instrument_counts();
        if !self.partitioner.needs_rebalance(&counts) {
            return;
        }
        if !self.partitioner.try_begin_rebalance() {
            debug!("rebalance_rate_limited");
            return;
        }

        let assignment = self.control.pool().assignment();
        let moves = self.partitioner.plan_rebalance(&assignment);
        if moves.is_empty() {
            return;
        }

        let mut migrated = 0usize;
        for mv in &moves {
            if let Err(err) = self.control.unsubscribe(mv.from, &mv.instruments) {
                warn!(from = mv.from, error = %err, "rebalance_unsubscribe_failed");
                continue;
            }
            match self.control.subscribe(mv.to, &mv.instruments) {
                Ok(outcome) => {
                    migrated += outcome.applied.len();
                    // Rejected leftovers are unassigned now; the next
                    // reconcile iteration re-homes them.
                    if !outcome.failed.is_empty() {
                        warn!(
                            to = mv.to,
                            rejected = outcome.failed.len(),
                            "rebalance_subscribe_partial"
                        );
                    }
                }
                Err(err) => warn!(to = mv.to, error = %err, "rebalance_subscribe_failed"),
            }
        }

        self.stats.rebalances.fetch_add(1, Ordering::Relaxed);
        self.stats
            .moves_applied
            .fetch_add(migrated as u64, Ordering::Relaxed);
        info!(moves = moves.len(), migrated, "rebalance_executed");
        self.record(
            LifecycleEvent::new(LifecycleEventKind::RebalanceTriggered, &self.currency).details(
                json!({
                    "moves": moves.len(),
                    "instruments_migrated": migrated,
                }),
            ),
        )
        .await;
    }

    async fn prune_audit_log(&self) {
        let cutoff = Utc::now() - chrono::Duration::days(self.retention_days);
        match self.store.prune_lifecycle_events(cutoff).await {
            Ok(pruned) if pruned > 0 => info!(pruned, "lifecycle_events_pruned"),
            Ok(_) => {}
            Err(err) => warn!(error = %err, "lifecycle_event_prune_failed"),
        }
    }

    /// Audit-log writes are best effort; a failed audit write never stops
    /// the reconciliation itself.
    async fn record(&self, event: LifecycleEvent) {
        if let Err(err) = self.store.record_lifecycle_event(&event).await {
            warn!(kind = event.kind.as_str(), error = %err, "lifecycle_event_write_failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const BUFFER: Duration = Duration::from_secs(300);

    fn now() -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_719_561_600_000).unwrap()
    }

    fn tracked(name: &str, expiry_offset_secs: Option<i64>) -> TrackedInstrument {
        TrackedInstrument {
            name: name.to_string(),
            expiry: expiry_offset_secs.map(|s| now() + chrono::Duration::seconds(s)),
        }
    }

    fn descriptor(name: &str, expiry_offset_secs: Option<i64>) -> InstrumentDescriptor {
        InstrumentDescriptor {
            name: name.to_string(),
            currency: "BTC".to_string(),
            kind: if expiry_offset_secs.is_some() {
                InstrumentKind::Option
            } else {
                InstrumentKind::Perpetual
            },
            strike: expiry_offset_secs.map(|_| 100_000.0),
            expiry: expiry_offset_secs.map(|s| now() + chrono::Duration::seconds(s)),
            option_side: None,
            is_active: true,
        }
    }

    fn assigned(names: &[&str]) -> HashSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn plans_listing_and_expiry_diffs() {
        let local = vec![
            tracked("BTC-OLD-50000-C", Some(3600)),
            tracked("BTC-GONE-60000-C", Some(100)),
        ];
        let exchange = vec![
            descriptor("BTC-OLD-50000-C", Some(3600)),
            descriptor("BTC-NEW-70000-C", Some(7200)),
        ];
        let plan = plan_reconciliation(
            &local,
            &exchange,
            &assigned(&["BTC-OLD-50000-C"]),
            now(),
            BUFFER,
        );

        // Gone from the universe and inside the buffer: expired.
        assert_eq!(plan.expire, vec!["BTC-GONE-60000-C".to_string()]);
        assert_eq!(plan.listed.len(), 1);
        assert_eq!(plan.listed[0].name, "BTC-NEW-70000-C");
        assert_eq!(plan.touch, vec!["BTC-OLD-50000-C".to_string()]);
        assert!(plan.resubscribe.is_empty());
    }

    #[test]
    fn expires_proactively_inside_buffer_even_when_still_listed() {
        // 4 minutes to expiry, 5 minute buffer, still in the universe.
        let local = vec![tracked("BTC-24H-100000-C", Some(240))];
        let exchange = vec![descriptor("BTC-24H-100000-C", Some(240))];
        let plan = plan_reconciliation(
            &local,
            &exchange,
            &assigned(&["BTC-24H-100000-C"]),
            now(),
            BUFFER,
        );

        assert_eq!(plan.expire, vec!["BTC-24H-100000-C".to_string()]);
        assert!(plan.touch.is_empty());
        assert!(plan.listed.is_empty());
    }

    #[test]
    fn expiry_exactly_at_buffer_boundary_is_inside() {
        let local = vec![tracked("BTC-EDGE-90000-C", Some(300))];
        let plan = plan_reconciliation(&local, &[], &HashSet::new(), now(), BUFFER);
        assert_eq!(plan.expire.len(), 1);
    }

    #[test]
    fn never_lists_an_instrument_already_inside_its_buffer() {
        let exchange = vec![descriptor("BTC-DYING-80000-C", Some(120))];
        let plan = plan_reconciliation(&[], &exchange, &HashSet::new(), now(), BUFFER);
        assert!(plan.listed.is_empty());
        assert!(plan.is_empty());
    }

    #[test]
    fn delisted_perpetual_without_expiry_is_retired() {
        let local = vec![tracked("BTC-PERPETUAL", None)];
        let plan = plan_reconciliation(&local, &[], &HashSet::new(), now(), BUFFER);
        assert_eq!(plan.expire, vec!["BTC-PERPETUAL".to_string()]);
    }

    #[test]
    fn unassigned_active_instruments_are_resubscribed() {
        let local = vec![
            tracked("BTC-A-50000-C", Some(7200)),
            tracked("BTC-B-60000-C", Some(7200)),
        ];
        let exchange = vec![
            descriptor("BTC-A-50000-C", Some(7200)),
            descriptor("BTC-B-60000-C", Some(7200)),
        ];
        // Only A made it onto a session; B's earlier subscribe failed.
        let plan = plan_reconciliation(
            &local,
            &exchange,
            &assigned(&["BTC-A-50000-C"]),
            now(),
            BUFFER,
        );

        assert_eq!(plan.resubscribe, vec!["BTC-B-60000-C".to_string()]);
        assert!(plan.expire.is_empty());
        assert!(plan.listed.is_empty());
    }

    #[test]
    fn reconciliation_is_idempotent_with_stable_universe() {
        let exchange = vec![
            descriptor("BTC-A-50000-C", Some(7200)),
            descriptor("BTC-PERPETUAL", None),
        ];

        // First pass from empty local state: everything is a listing.
        let first = plan_reconciliation(&[], &exchange, &HashSet::new(), now(), BUFFER);
        assert_eq!(first.listed.len(), 2);

        // Simulate applying the plan.
        let local: Vec<TrackedInstrument> = first
            .listed
            .iter()
            .map(|d| TrackedInstrument {
                name: d.name.clone(),
                expiry: d.expiry,
            })
            .collect();
        let assigned: HashSet<String> =
            first.listed.iter().map(|d| d.name.clone()).collect();

        // Second pass with no universe change: zero move commands.
        let second = plan_reconciliation(&local, &exchange, &assigned, now(), BUFFER);
        assert!(second.is_empty());
        assert_eq!(second.touch.len(), 2);
    }
}
