//! Collector entrypoint: build the pipeline from the environment, run it
//! until a shutdown signal, then stop in phases: scheduling first, session
//! drains second, final buffer flush last.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use optick::{
    buffer::TickBuffer,
    catalog::CatalogClient,
    config::Config,
    control::{serve_session_api, ControlApi},
    lifecycle::LifecycleManager,
    limiter::TokenBucket,
    partitioner::Partitioner,
    pool::ConnectionPool,
    shutdown,
    snapshotter::DepthSnapshotter,
    store::TickStore,
    writer::BatchWriter,
};

/// Deadline for all sessions to reach Connected at startup.
const START_DEADLINE: Duration = Duration::from_secs(30);
/// Phase 2: session close + in-flight decode drain.
const SESSION_DRAIN_DEADLINE: Duration = Duration::from_secs(10);
/// Phase 3: final buffer flush into the store.
const FINAL_FLUSH_DEADLINE: Duration = Duration::from_secs(15);

fn init_tracing() {
    // LOG_LEVEL takes precedence, then RUST_LOG, then info.
    let filter = std::env::var("LOG_LEVEL")
        .ok()
        .and_then(|level| level.parse::<tracing_subscriber::EnvFilter>().ok())
        .or_else(|| tracing_subscriber::EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "configuration_error");
            std::process::exit(1);
        }
    };
    info!(
        currency = %config.currency,
        sessions = config.session_count,
        session_cap = config.session_cap,
        "collector_starting"
    );

    // Store connectivity is a startup requirement; the orchestrator restarts
    // us if it is not there.
    let store = match TickStore::connect(&config.database_url, &config.currency).await {
        Ok(store) => Arc::new(store),
        Err(err) => {
            error!(error = %err, "store_unreachable");
            std::process::exit(1);
        }
    };
    store
        .init_schema()
        .await
        .context("schema bootstrap failed")?;

    // Shared pipeline pieces.
    let buffer = Arc::new(TickBuffer::new(
        config.buffer_capacity_quotes,
        config.buffer_capacity_trades,
    ));
    let rest_limiter = Arc::new(TokenBucket::new(config.rate_limit_rps, config.rate_limit_rps));
    let catalog = Arc::new(
        CatalogClient::new(&config.rest_url, rest_limiter)
            .context("failed to build catalog client")?,
    );
    let pool = Arc::new(ConnectionPool::new(&config, buffer.clone()));
    let writer = Arc::new(BatchWriter::new(
        store.clone(),
        buffer.clone(),
        config.flush_interval,
    ));
    let partitioner = Arc::new(Partitioner::new(config.session_count, config.session_cap));
    let control = Arc::new(ControlApi::new(
        pool.clone(),
        writer.stats.clone(),
        &config.currency,
    ));
    let snapshotter = Arc::new(DepthSnapshotter::new(
        catalog.clone(),
        writer.clone(),
        pool.clone(),
        config.depth_interval,
        config.snapshot_rate_rps(),
    ));
    let lifecycle = Arc::new(LifecycleManager::new(
        catalog,
        store.clone(),
        control.clone(),
        partitioner,
        &config.currency,
        config.lifecycle_interval,
        config.expiry_buffer,
        config.rebalance_interval,
        config.lifecycle_event_retention_days,
    ));

    let (shutdown_handle, shutdown) = shutdown::channel();

    // Supervisor signal -> shutdown trigger.
    {
        let mut signal_shutdown = shutdown_handle.subscribe();
        tokio::spawn(async move {
            wait_for_signal(&mut signal_shutdown).await;
            shutdown_handle.trigger();
        });
    }

    // Sessions first, so the lifecycle manager has something to subscribe on.
    pool.start(&shutdown, START_DEADLINE).await;

    let mut workers = Vec::new();
    workers.push(tokio::spawn(writer.clone().run_quotes(shutdown.clone())));
    workers.push(tokio::spawn(writer.clone().run_trades(shutdown.clone())));
    workers.push(tokio::spawn(snapshotter.run(shutdown.clone())));
    workers.push(tokio::spawn(lifecycle.run(shutdown.clone())));
    for session_id in 0..pool.session_count() {
        workers.push(tokio::spawn(serve_session_api(
            control.clone(),
            session_id,
            config.base_port,
            shutdown.clone(),
        )));
    }
    info!("collector_running");

    let mut main_shutdown = shutdown.clone();
    main_shutdown.triggered().await;

    // Phase 1: stop scheduling new work. The shutdown token already stops
    // the lifecycle manager and snapshotter; the control API refuses new
    // mutations from here on.
    info!("shutdown_phase1_stop_scheduling");
    control.stop_accepting();

    // Phase 2: sessions close gracefully and drain in-flight decode.
    info!("shutdown_phase2_drain_sessions");
    pool.join(SESSION_DRAIN_DEADLINE).await;

    // Phase 3: flush what remains, then drop the store connection. Workers
    // have all observed the token by now; wait for them so no flush races
    // the final one.
    info!("shutdown_phase3_final_flush");
    for worker in workers {
        let _ = worker.await;
    }
    writer.final_flush(FINAL_FLUSH_DEADLINE).await;
    store.close().await;

    info!("collector_stopped");
    Ok(())
}

async fn wait_for_signal(shutdown: &mut optick::shutdown::Shutdown) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("sigint_received"),
                    _ = sigterm.recv() => info!("sigterm_received"),
                    _ = shutdown.triggered() => {}
                }
                return;
            }
            Err(err) => warn!(error = %err, "sigterm_handler_unavailable"),
        }
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("sigint_received"),
        _ = shutdown.triggered() => {}
    }
}
