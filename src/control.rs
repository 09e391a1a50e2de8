//! Control API: the in-process operations surface the lifecycle manager
//! drives, also exposed over HTTP for operability.
//!
//! Session `i` serves `BASE_PORT + i`; each server answers subscribe,
//! unsubscribe, status, and health for its own session. During shutdown
//! phase 1 the API refuses new mutations with 503.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use crate::error::SubscribeError;
use crate::pool::{ConnectionPool, SubscriptionOutcome};
use crate::shutdown::Shutdown;
use crate::writer::WriterStats;

/// Writer silence past this age flips health to degraded.
const WRITE_STALL_SECS: u64 = 60;

/// In-process control surface over the pool. The lifecycle manager calls
/// this directly; the HTTP layer is a thin veneer over the same methods.
pub struct ControlApi {
    pool: Arc<ConnectionPool>,
    writer_stats: Arc<WriterStats>,
    currency: String,
    accepting: AtomicBool,
}

impl ControlApi {
    pub fn new(
        pool: Arc<ConnectionPool>,
        writer_stats: Arc<WriterStats>,
        currency: &str,
    ) -> Self {
        Self {
            pool,
            writer_stats,
            currency: currency.to_string(),
            accepting: AtomicBool::new(true),
        }
    }

    /// Shutdown phase 1: refuse new mutations.
    pub fn stop_accepting(&self) {
        self.accepting.store(false, Ordering::SeqCst);
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    pub fn subscribe(
        &self,
        session_id: usize,
        instruments: &[String],
    ) -> Result<SubscriptionOutcome, SubscribeError> {
        self.pool.subscribe(session_id, instruments)
    }

    pub fn unsubscribe(
        &self,
        session_id: usize,
        instruments: &[String],
    ) -> Result<SubscriptionOutcome, SubscribeError> {
        self.pool.unsubscribe(session_id, instruments)
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Process-wide health: degraded when any session has been broken past
    /// the threshold or the writer has not landed a batch recently.
    pub fn health(&self) -> HealthResponse {
        let stalled = self.writer_stats.last_success_age().as_secs() > WRITE_STALL_SECS;
        let status = if self.pool.is_degraded() || stalled {
            "degraded"
        } else {
            "healthy"
        };
        HealthResponse {
            status: status.to_string(),
            timestamp: Utc::now().to_rfc3339(),
        }
    }

    fn status(&self, session_id: usize) -> Option<StatusResponse> {
        let snapshot = self.pool.session(session_id)?.snapshot();
        let session = self.pool.session(session_id)?;
        Some(StatusResponse {
            currency: self.currency.clone(),
            session_id,
            instruments_count: snapshot.instruments_count,
            instruments: snapshot.instruments.clone(),
            connected: snapshot.connected,
            last_event_instant: snapshot.last_event_instant.map(|t| t.to_rfc3339()),
            stats: json!({
                "state": snapshot.state,
                "channels": snapshot.channels,
                "frames": session.stats.frames.load(Ordering::Relaxed),
                "quotes": session.stats.quotes.load(Ordering::Relaxed),
                "trades": session.stats.trades.load(Ordering::Relaxed),
                "decode_errors": session.stats.decode_errors.load(Ordering::Relaxed),
                "reconnects": session.stats.reconnects.load(Ordering::Relaxed),
                "capacity_breaches": session.stats.capacity_breaches.load(Ordering::Relaxed),
            }),
        })
    }
}

// =============================================================================
// HTTP LAYER
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct MutationRequest {
    pub instruments: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct SubscribeResponse {
    pub subscribed: Vec<String>,
    pub already_subscribed: Vec<String>,
    pub failed: Vec<FailedEntry>,
}

#[derive(Debug, Serialize)]
pub struct UnsubscribeResponse {
    pub unsubscribed: Vec<String>,
    pub not_subscribed: Vec<String>,
    pub failed: Vec<FailedEntry>,
}

#[derive(Debug, Serialize)]
pub struct FailedEntry {
    pub name: String,
    pub reason: String,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub currency: String,
    pub session_id: usize,
    pub instruments_count: usize,
    pub instruments: Vec<String>,
    pub connected: bool,
    pub last_event_instant: Option<String>,
    pub stats: Value,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: String,
}

fn failed_entries(outcome: &SubscriptionOutcome) -> Vec<FailedEntry> {
    outcome
        .failed
        .iter()
        .map(|f| FailedEntry {
            name: f.name.clone(),
            reason: f.reason.clone(),
        })
        .collect()
}

#[derive(Clone)]
struct SessionApiState {
    api: Arc<ControlApi>,
    session_id: usize,
}

async fn subscribe_handler(
    State(state): State<SessionApiState>,
    Json(request): Json<MutationRequest>,
) -> Result<Json<SubscribeResponse>, StatusCode> {
    if !state.api.is_accepting() {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }
    let outcome = state
        .api
        .subscribe(state.session_id, &request.instruments)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(Json(SubscribeResponse {
        failed: failed_entries(&outcome),
        subscribed: outcome.applied,
        already_subscribed: outcome.skipped,
    }))
}

async fn unsubscribe_handler(
    State(state): State<SessionApiState>,
    Json(request): Json<MutationRequest>,
) -> Result<Json<UnsubscribeResponse>, StatusCode> {
    if !state.api.is_accepting() {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }
    let outcome = state
        .api
        .unsubscribe(state.session_id, &request.instruments)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(Json(UnsubscribeResponse {
        failed: failed_entries(&outcome),
        unsubscribed: outcome.applied,
        not_subscribed: outcome.skipped,
    }))
}

async fn status_handler(
    State(state): State<SessionApiState>,
) -> Result<Json<StatusResponse>, StatusCode> {
    state
        .api
        .status(state.session_id)
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

async fn health_handler(State(state): State<SessionApiState>) -> Json<HealthResponse> {
    Json(state.api.health())
}

/// Serve one session's control endpoints on `base_port + session_id`.
pub async fn serve_session_api(
    api: Arc<ControlApi>,
    session_id: usize,
    base_port: u16,
    mut shutdown: Shutdown,
) {
    let port = base_port + session_id as u16;
    let state = SessionApiState { api, session_id };

    let app = Router::new()
        .route("/subscribe", post(subscribe_handler))
        .route("/unsubscribe", post(unsubscribe_handler))
        .route("/status", get(status_handler))
        .route("/health", get(health_handler))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = match TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(port, error = %e, "control_api_bind_failed");
            return;
        }
    };
    info!(session_id, port, "control_api_listening");

    let server = axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.triggered().await });
    if let Err(e) = server.await {
        error!(session_id, error = %e, "control_api_server_error");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::FailedInstrument;

    #[test]
    fn response_shapes_mirror_outcome() {
        let outcome = SubscriptionOutcome {
            applied: vec!["A".to_string()],
            skipped: vec!["B".to_string()],
            failed: vec![FailedInstrument {
                name: "C".to_string(),
                reason: "capacity exceeded: 500/500 channels".to_string(),
            }],
        };

        let failed = failed_entries(&outcome);
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].name, "C");

        let response = SubscribeResponse {
            failed,
            subscribed: outcome.applied.clone(),
            already_subscribed: outcome.skipped.clone(),
        };
        let body = serde_json::to_value(&response).unwrap();
        assert_eq!(body["subscribed"][0], "A");
        assert_eq!(body["already_subscribed"][0], "B");
        assert_eq!(body["failed"][0]["reason"], "capacity exceeded: 500/500 channels");
    }
}
