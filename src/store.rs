//! Time-series store access: schema bootstrap, idempotent batch upserts,
//! instrument metadata, and the lifecycle-event audit log.
//!
//! One `PgPool` for the process. One transaction per batch per kind, with
//! explicit `ON CONFLICT` clauses: quotes and depth snapshots use
//! replacement semantics, trades are insert-once. Partitioning and
//! compression policies belong to the provided store and are not created
//! here.

use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};

use crate::error::{ConfigError, StoreError};
use crate::models::{
    kind_from_name, DepthSnapshot, InstrumentDescriptor, InstrumentKind, LifecycleEvent,
    QuoteTick, TradeTick, TrackedInstrument,
};

/// Upsert chunk sizes, kept well under the wire-protocol bind limit.
const QUOTE_CHUNK: usize = 500;
const TRADE_CHUNK: usize = 1000;
const DEPTH_CHUNK: usize = 500;

/// Logical table names for one collector instance: per-currency option
/// tables plus the shared perpetuals tables.
#[derive(Debug, Clone)]
pub struct TableSet {
    pub option_quotes: String,
    pub option_trades: String,
    pub option_depth: String,
    pub perp_quotes: String,
    pub perp_trades: String,
    pub perp_depth: String,
}

impl TableSet {
    pub fn new(currency: &str) -> Self {
        let c = currency.to_lowercase();
        Self {
            option_quotes: format!("{}_option_quotes", c),
            option_trades: format!("{}_option_trades", c),
            option_depth: format!("{}_option_orderbook_depth", c),
            perp_quotes: "perpetuals_quotes".to_string(),
            perp_trades: "perpetuals_trades".to_string(),
            perp_depth: "perpetuals_depth".to_string(),
        }
    }
}

pub struct TickStore {
    pool: PgPool,
    tables: TableSet,
    currency: String,
}

impl TickStore {
    /// Connect and verify reachability. An unreachable store at startup is a
    /// configuration error: the process exits and the orchestrator restarts it.
    pub async fn connect(database_url: &str, currency: &str) -> Result<Self, ConfigError> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .acquire_timeout(Duration::from_secs(10))
            .after_connect(|conn, _meta| {
                Box::pin(async move {
                    // Store writes carry an explicit deadline.
                    sqlx::query("SET statement_timeout = 30000")
                        .execute(conn)
                        .await?;
                    Ok(())
                })
            })
            .connect(database_url)
            .await
            .map_err(|e| ConfigError::StoreUnreachable(e.to_string()))?;

        sqlx::query("SELECT 1")
            .execute(&pool)
            .await
            .map_err(|e| ConfigError::StoreUnreachable(e.to_string()))?;

        Ok(Self {
            pool,
            tables: TableSet::new(currency),
            currency: currency.to_string(),
        })
    }

    pub fn tables(&self) -> &TableSet {
        &self.tables
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Idempotent DDL for every table this instance writes.
    pub async fn init_schema(&self) -> Result<(), StoreError> {
        for statement in schema_sql(&self.tables) {
            sqlx::query(&statement)
                .execute(&self.pool)
                .await
                .map_err(StoreError::from_sqlx)?;
        }
        Ok(())
    }

    // -- tick batches --------------------------------------------------------

    /// Upsert a quote batch; a later re-observation of `(ts, instrument)`
    /// overwrites. Returns rows written.
    pub async fn insert_quotes(&self, rows: &[QuoteTick]) -> Result<u64, StoreError> {
        let (options, perps): (Vec<&QuoteTick>, Vec<&QuoteTick>) = rows
            .iter()
            .partition(|r| kind_from_name(&r.instrument) == InstrumentKind::Option);

        let mut written = 0;
        written += self.insert_quote_rows(&self.tables.option_quotes, &options).await?;
        written += self.insert_quote_rows(&self.tables.perp_quotes, &perps).await?;
        Ok(written)
    }

    async fn insert_quote_rows(
        &self,
        table: &str,
        rows: &[&QuoteTick],
    ) -> Result<u64, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut written = 0;
        let mut tx = self.pool.begin().await.map_err(StoreError::from_sqlx)?;
        for chunk in rows.chunks(QUOTE_CHUNK) {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(format!(
                "INSERT INTO {} (ts, instrument_name, bid_price, bid_size, ask_price, ask_size, \
                 mark_price, index_price, delta, gamma, theta, vega, rho, bid_iv, ask_iv, \
                 mark_iv, open_interest, last_price) ",
                table
            ));
            qb.push_values(chunk, |mut b, row| {
                b.push_bind(row.ts)
                    .push_bind(&row.instrument)
                    .push_bind(row.bid_price)
                    .push_bind(row.bid_size)
                    .push_bind(row.ask_price)
                    .push_bind(row.ask_size)
                    .push_bind(row.mark_price)
                    .push_bind(row.index_price)
                    .push_bind(row.delta)
                    .push_bind(row.gamma)
                    .push_bind(row.theta)
                    .push_bind(row.vega)
                    .push_bind(row.rho)
                    .push_bind(row.bid_iv)
                    .push_bind(row.ask_iv)
                    .push_bind(row.mark_iv)
                    .push_bind(row.open_interest)
                    .push_bind(row.last_price);
            });
            qb.push(
                " ON CONFLICT (ts, instrument_name) DO UPDATE SET \
                 bid_price = EXCLUDED.bid_price, bid_size = EXCLUDED.bid_size, \
                 ask_price = EXCLUDED.ask_price, ask_size = EXCLUDED.ask_size, \
                 mark_price = EXCLUDED.mark_price, index_price = EXCLUDED.index_price, \
                 delta = EXCLUDED.delta, gamma = EXCLUDED.gamma, theta = EXCLUDED.theta, \
                 vega = EXCLUDED.vega, rho = EXCLUDED.rho, bid_iv = EXCLUDED.bid_iv, \
                 ask_iv = EXCLUDED.ask_iv, mark_iv = EXCLUDED.mark_iv, \
                 open_interest = EXCLUDED.open_interest, last_price = EXCLUDED.last_price",
            );
            let result = qb
                .build()
                .execute(&mut *tx)
                .await
                .map_err(StoreError::from_sqlx)?;
            written += result.rows_affected();
        }
        tx.commit().await.map_err(StoreError::from_sqlx)?;
        Ok(written)
    }

    /// Insert a trade batch. Trades are immutable once acknowledged, so
    /// replays conflict-and-skip on `(ts, trade_id, instrument)`.
    pub async fn insert_trades(&self, rows: &[TradeTick]) -> Result<u64, StoreError> {
        let (options, perps): (Vec<&TradeTick>, Vec<&TradeTick>) = rows
            .iter()
            .partition(|r| kind_from_name(&r.instrument) == InstrumentKind::Option);

        let mut written = 0;
        written += self.insert_trade_rows(&self.tables.option_trades, &options).await?;
        written += self.insert_trade_rows(&self.tables.perp_trades, &perps).await?;
        Ok(written)
    }

    async fn insert_trade_rows(
        &self,
        table: &str,
        rows: &[&TradeTick],
    ) -> Result<u64, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut written = 0;
        let mut tx = self.pool.begin().await.map_err(StoreError::from_sqlx)?;
        for chunk in rows.chunks(TRADE_CHUNK) {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(format!(
                "INSERT INTO {} (ts, trade_id, instrument_name, price, size, side, iv, index_price) ",
                table
            ));
            qb.push_values(chunk, |mut b, row| {
                b.push_bind(row.ts)
                    .push_bind(&row.trade_id)
                    .push_bind(&row.instrument)
                    .push_bind(row.price)
                    .push_bind(row.size)
                    .push_bind(row.side.as_str())
                    .push_bind(row.iv)
                    .push_bind(row.index_price);
            });
            qb.push(" ON CONFLICT (ts, trade_id, instrument_name) DO NOTHING");
            let result = qb
                .build()
                .execute(&mut *tx)
                .await
                .map_err(StoreError::from_sqlx)?;
            written += result.rows_affected();
        }
        tx.commit().await.map_err(StoreError::from_sqlx)?;
        Ok(written)
    }

    /// Upsert a depth snapshot batch on `(ts, instrument)`.
    pub async fn insert_depth(&self, rows: &[DepthSnapshot]) -> Result<u64, StoreError> {
        let (options, perps): (Vec<&DepthSnapshot>, Vec<&DepthSnapshot>) = rows
            .iter()
            .partition(|r| kind_from_name(&r.instrument) == InstrumentKind::Option);

        let mut written = 0;
        written += self.insert_depth_rows(&self.tables.option_depth, &options).await?;
        written += self.insert_depth_rows(&self.tables.perp_depth, &perps).await?;
        Ok(written)
    }

    async fn insert_depth_rows(
        &self,
        table: &str,
        rows: &[&DepthSnapshot],
    ) -> Result<u64, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut written = 0;
        let mut tx = self.pool.begin().await.map_err(StoreError::from_sqlx)?;
        for chunk in rows.chunks(DEPTH_CHUNK) {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(format!(
                "INSERT INTO {} (ts, instrument_name, bids, asks, mark_price, index_price, \
                 open_interest, volume_24h) ",
                table
            ));
            qb.push_values(chunk, |mut b, row| {
                b.push_bind(row.ts)
                    .push_bind(&row.instrument)
                    .push_bind(serde_json::json!(row.bids))
                    .push_bind(serde_json::json!(row.asks))
                    .push_bind(row.mark_price)
                    .push_bind(row.index_price)
                    .push_bind(row.open_interest)
                    .push_bind(row.volume_24h);
            });
            qb.push(
                " ON CONFLICT (ts, instrument_name) DO UPDATE SET \
                 bids = EXCLUDED.bids, asks = EXCLUDED.asks, \
                 mark_price = EXCLUDED.mark_price, index_price = EXCLUDED.index_price, \
                 open_interest = EXCLUDED.open_interest, volume_24h = EXCLUDED.volume_24h",
            );
            let result = qb
                .build()
                .execute(&mut *tx)
                .await
                .map_err(StoreError::from_sqlx)?;
            written += result.rows_affected();
        }
        tx.commit().await.map_err(StoreError::from_sqlx)?;
        Ok(written)
    }

    /// Park a permanently-failing row for operator replay.
    pub async fn dead_letter(
        &self,
        kind: &str,
        payload: serde_json::Value,
        error: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO dead_letter_rows (ts, kind, payload, error) VALUES ($1, $2, $3, $4)",
        )
        .bind(Utc::now())
        .bind(kind)
        .bind(payload)
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(StoreError::from_sqlx)?;
        Ok(())
    }

    // -- instrument metadata -------------------------------------------------

    /// All active instruments for this collector's currency.
    pub async fn active_instruments(&self) -> Result<Vec<TrackedInstrument>, StoreError> {
        let rows = sqlx::query(
            "SELECT instrument_name, expiry FROM instrument_metadata \
             WHERE currency = $1 AND is_active = TRUE",
        )
        .bind(&self.currency)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::from_sqlx)?;

        rows.into_iter()
            .map(|row| {
                Ok(TrackedInstrument {
                    name: row.try_get("instrument_name").map_err(StoreError::from_sqlx)?,
                    expiry: row.try_get("expiry").map_err(StoreError::from_sqlx)?,
                })
            })
            .collect()
    }

    /// Upsert a newly-listed instrument. `listed_at` is preserved on
    /// re-listing; activation clears any previous expiry mark.
    pub async fn upsert_instrument(
        &self,
        desc: &InstrumentDescriptor,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO instrument_metadata \
             (instrument_name, currency, kind, strike, expiry, option_side, is_active, \
              listed_at, last_seen_at) \
             VALUES ($1, $2, $3, $4, $5, $6, TRUE, $7, $7) \
             ON CONFLICT (instrument_name) DO UPDATE SET \
             is_active = TRUE, last_seen_at = EXCLUDED.last_seen_at, expired_at = NULL",
        )
        .bind(&desc.name)
        .bind(&desc.currency)
        .bind(desc.kind.as_str())
        .bind(desc.strike)
        .bind(desc.expiry)
        .bind(desc.option_side.map(|s| s.as_str()))
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(StoreError::from_sqlx)?;
        Ok(())
    }

    /// Mark an instrument expired. Historical tick rows are never touched.
    pub async fn expire_instrument(
        &self,
        name: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE instrument_metadata SET is_active = FALSE, expired_at = $2 \
             WHERE instrument_name = $1",
        )
        .bind(name)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(StoreError::from_sqlx)?;
        Ok(())
    }

    /// Refresh `last_seen_at` for instruments still present in the universe.
    pub async fn touch_instruments(
        &self,
        names: &[String],
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        if names.is_empty() {
            return Ok(());
        }
        sqlx::query(
            "UPDATE instrument_metadata SET last_seen_at = $2 WHERE instrument_name = ANY($1)",
        )
        .bind(names)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(StoreError::from_sqlx)?;
        Ok(())
    }

    // -- lifecycle audit log -------------------------------------------------

    pub async fn record_lifecycle_event(&self, event: &LifecycleEvent) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO lifecycle_events \
             (ts, kind, instrument_name, currency, session_id, details, success, error) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(event.ts)
        .bind(event.kind.as_str())
        .bind(&event.instrument)
        .bind(&event.currency)
        .bind(event.session_id.map(|s| s as i32))
        .bind(&event.details)
        .bind(event.success)
        .bind(&event.error)
        .execute(&self.pool)
        .await
        .map_err(StoreError::from_sqlx)?;
        Ok(())
    }

    /// Prune audit rows past retention. Tick and depth tables are never
    /// pruned by the collector.
    pub async fn prune_lifecycle_events(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM lifecycle_events WHERE ts < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(StoreError::from_sqlx)?;
        Ok(result.rows_affected())
    }
}

/// DDL statements for one collector instance. `IF NOT EXISTS` throughout, so
/// several instances of the same currency can race on startup.
fn schema_sql(tables: &TableSet) -> Vec<String> {
    let mut out = Vec::new();

    for table in [
        &tables.option_quotes,
        &tables.perp_quotes,
    ] {
        out.push(format!(
            "CREATE TABLE IF NOT EXISTS {t} (
                ts TIMESTAMPTZ NOT NULL,
                instrument_name TEXT NOT NULL,
                bid_price DOUBLE PRECISION,
                bid_size DOUBLE PRECISION,
                ask_price DOUBLE PRECISION,
                ask_size DOUBLE PRECISION,
                mark_price DOUBLE PRECISION,
                index_price DOUBLE PRECISION,
                delta DOUBLE PRECISION,
                gamma DOUBLE PRECISION,
                theta DOUBLE PRECISION,
                vega DOUBLE PRECISION,
                rho DOUBLE PRECISION,
                bid_iv DOUBLE PRECISION,
                ask_iv DOUBLE PRECISION,
                mark_iv DOUBLE PRECISION,
                open_interest DOUBLE PRECISION,
                last_price DOUBLE PRECISION,
                PRIMARY KEY (ts, instrument_name)
            )",
            t = table
        ));
        out.push(format!(
            "CREATE INDEX IF NOT EXISTS idx_{t}_instrument_ts ON {t} (instrument_name, ts DESC)",
            t = table
        ));
    }

    for table in [&tables.option_trades, &tables.perp_trades] {
        out.push(format!(
            "CREATE TABLE IF NOT EXISTS {t} (
                ts TIMESTAMPTZ NOT NULL,
                trade_id TEXT NOT NULL,
                instrument_name TEXT NOT NULL,
                price DOUBLE PRECISION NOT NULL,
                size DOUBLE PRECISION NOT NULL,
                side TEXT NOT NULL,
                iv DOUBLE PRECISION,
                index_price DOUBLE PRECISION,
                PRIMARY KEY (ts, trade_id, instrument_name)
            )",
            t = table
        ));
        out.push(format!(
            "CREATE INDEX IF NOT EXISTS idx_{t}_instrument_ts ON {t} (instrument_name, ts DESC)",
            t = table
        ));
    }

    for table in [&tables.option_depth, &tables.perp_depth] {
        out.push(format!(
            "CREATE TABLE IF NOT EXISTS {t} (
                ts TIMESTAMPTZ NOT NULL,
                instrument_name TEXT NOT NULL,
                bids JSONB NOT NULL,
                asks JSONB NOT NULL,
                mark_price DOUBLE PRECISION,
                index_price DOUBLE PRECISION,
                open_interest DOUBLE PRECISION,
                volume_24h DOUBLE PRECISION,
                PRIMARY KEY (ts, instrument_name)
            )",
            t = table
        ));
        out.push(format!(
            "CREATE INDEX IF NOT EXISTS idx_{t}_instrument_ts ON {t} (instrument_name, ts DESC)",
            t = table
        ));
    }

    out.push(
        "CREATE TABLE IF NOT EXISTS instrument_metadata (
            instrument_name TEXT PRIMARY KEY,
            currency TEXT NOT NULL,
            kind TEXT NOT NULL,
            strike DOUBLE PRECISION,
            expiry TIMESTAMPTZ,
            option_side TEXT,
            is_active BOOLEAN NOT NULL DEFAULT TRUE,
            listed_at TIMESTAMPTZ NOT NULL,
            last_seen_at TIMESTAMPTZ NOT NULL,
            expired_at TIMESTAMPTZ
        )"
        .to_string(),
    );
    out.push(
        "CREATE INDEX IF NOT EXISTS idx_instrument_metadata_active \
         ON instrument_metadata (currency, is_active)"
            .to_string(),
    );

    out.push(
        "CREATE TABLE IF NOT EXISTS lifecycle_events (
            id BIGSERIAL PRIMARY KEY,
            ts TIMESTAMPTZ NOT NULL,
            kind TEXT NOT NULL,
            instrument_name TEXT,
            currency TEXT NOT NULL,
            session_id INTEGER,
            details JSONB NOT NULL DEFAULT '{}',
            success BOOLEAN NOT NULL,
            error TEXT
        )"
        .to_string(),
    );
    out.push(
        "CREATE INDEX IF NOT EXISTS idx_lifecycle_events_ts ON lifecycle_events (ts DESC)"
            .to_string(),
    );

    out.push(
        "CREATE TABLE IF NOT EXISTS dead_letter_rows (
            id BIGSERIAL PRIMARY KEY,
            ts TIMESTAMPTZ NOT NULL,
            kind TEXT NOT NULL,
            payload JSONB NOT NULL,
            error TEXT NOT NULL
        )"
        .to_string(),
    );

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_names_follow_currency() {
        let tables = TableSet::new("BTC");
        assert_eq!(tables.option_quotes, "btc_option_quotes");
        assert_eq!(tables.option_trades, "btc_option_trades");
        assert_eq!(tables.option_depth, "btc_option_orderbook_depth");
        assert_eq!(tables.perp_quotes, "perpetuals_quotes");
    }

    #[test]
    fn schema_covers_every_table() {
        let tables = TableSet::new("ETH");
        let ddl = schema_sql(&tables).join("\n");
        for name in [
            "eth_option_quotes",
            "eth_option_trades",
            "eth_option_orderbook_depth",
            "perpetuals_quotes",
            "perpetuals_trades",
            "perpetuals_depth",
            "instrument_metadata",
            "lifecycle_events",
            "dead_letter_rows",
        ] {
            assert!(ddl.contains(name), "missing DDL for {}", name);
        }
        // The trade key must carry the timestamp; the store is time-partitioned.
        assert!(ddl.contains("PRIMARY KEY (ts, trade_id, instrument_name)"));
    }
}
