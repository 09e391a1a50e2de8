//! Application configuration, built once at startup from the environment.

use std::env;
use std::time::Duration;

use crate::error::ConfigError;

/// Default exchange endpoints; overridable for test harnesses.
const DEFAULT_WS_URL: &str = "wss://www.deribit.com/ws/api/v2";
const DEFAULT_REST_URL: &str = "https://www.deribit.com/api/v2/public";

/// Collector configuration. Constructed by [`Config::from_env`] and passed
/// by reference; no component reads the environment after startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Currency tag this collector instance operates on (`BTC`, `ETH`, ...).
    pub currency: String,
    /// Store connection string.
    pub database_url: String,
    /// Number of streaming sessions.
    pub session_count: usize,
    /// Per-session channel cap.
    pub session_cap: usize,
    pub buffer_capacity_quotes: usize,
    pub buffer_capacity_trades: usize,
    /// Batch writer cadence.
    pub flush_interval: Duration,
    /// Depth snapshot sweep cadence (floor 60 s).
    pub depth_interval: Duration,
    /// Universe reconciliation cadence (floor 60 s).
    pub lifecycle_interval: Duration,
    /// Rebalance evaluation cadence.
    pub rebalance_interval: Duration,
    /// Pre-expiry unsubscribe window.
    pub expiry_buffer: Duration,
    /// Endpoint-wide request budget (requests/second).
    pub rate_limit_rps: f64,
    /// Control API base port; session `i` listens on `base_port + i`.
    pub base_port: u16,
    pub ws_url: String,
    pub rest_url: String,
    /// Retention for the lifecycle-event audit log, in days.
    pub lifecycle_event_retention_days: i64,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(v) => v.parse().unwrap_or(default),
        Err(_) => default,
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();

        let currency = env::var("CURRENCY")
            .map_err(|_| ConfigError::MissingVar("CURRENCY"))?
            .to_uppercase();
        if currency.is_empty() || !currency.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(ConfigError::InvalidVar {
                var: "CURRENCY",
                value: currency,
            });
        }

        let database_url =
            env::var("DATABASE_URL").map_err(|_| ConfigError::MissingVar("DATABASE_URL"))?;

        let session_count = env_parse("SESSION_COUNT", 3usize).max(1);
        let session_cap = env_parse("SESSION_CAP", 500usize).max(2);

        // Snapshot sweeps and reconciliation have a 60 s floor; anything
        // faster is infeasible under the documented endpoint rate limit.
        let depth_interval = Duration::from_secs(env_parse("DEPTH_INTERVAL_SEC", 300u64).max(60));
        let lifecycle_interval =
            Duration::from_secs(env_parse("LIFECYCLE_INTERVAL_SEC", 300u64).max(60));

        Ok(Self {
            currency,
            database_url,
            session_count,
            session_cap,
            buffer_capacity_quotes: env_parse("BUFFER_CAPACITY_QUOTES", 200_000usize).max(1),
            buffer_capacity_trades: env_parse("BUFFER_CAPACITY_TRADES", 100_000usize).max(1),
            flush_interval: Duration::from_secs(env_parse("FLUSH_INTERVAL_SEC", 3u64).max(1)),
            depth_interval,
            lifecycle_interval,
            rebalance_interval: Duration::from_secs(env_parse("REBALANCE_INTERVAL_SEC", 3600u64)),
            expiry_buffer: Duration::from_secs(env_parse("EXPIRY_BUFFER_MIN", 5u64) * 60),
            rate_limit_rps: env_parse("RATE_LIMIT_RPS", 20.0f64).max(1.0),
            base_port: env_parse("BASE_PORT", 8080u16),
            ws_url: env::var("EXCHANGE_WS_URL").unwrap_or_else(|_| DEFAULT_WS_URL.to_string()),
            rest_url: env::var("EXCHANGE_REST_URL")
                .unwrap_or_else(|_| DEFAULT_REST_URL.to_string()),
            lifecycle_event_retention_days: env_parse("LIFECYCLE_EVENT_RETENTION_DAYS", 90i64)
                .max(1),
        })
    }

    /// Snapshot sweep pacing: half the endpoint budget, leaving headroom for
    /// the lifecycle manager's catalog calls.
    pub fn snapshot_rate_rps(&self) -> f64 {
        (self.rate_limit_rps / 2.0).max(1.0)
    }

    /// The exchange's heartbeat cadence; a session is broken after two
    /// silent intervals.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(20)
    }
}
