//! Exchange request/response client: instrument listings and one-shot
//! full-depth orderbook reads.
//!
//! All endpoints are unauthenticated. Every call passes through the shared
//! per-endpoint token bucket, so the snapshotter and the lifecycle manager
//! cannot stack request storms. No caching here; the lifecycle manager owns
//! its own universe snapshot.

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;

use crate::error::CatalogError;
use crate::limiter::TokenBucket;
use crate::models::{
    DepthLevel, DepthSnapshot, InstrumentDescriptor, InstrumentKind, OptionSide,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const TOTAL_TIMEOUT: Duration = Duration::from_secs(15);

pub struct CatalogClient {
    http: Client,
    base_url: String,
    limiter: Arc<TokenBucket>,
}

#[derive(Debug, Deserialize)]
struct RawInstrument {
    instrument_name: String,
    #[serde(default)]
    base_currency: Option<String>,
    kind: String,
    #[serde(default)]
    strike: Option<f64>,
    #[serde(default)]
    expiration_timestamp: Option<i64>,
    #[serde(default)]
    option_type: Option<String>,
    #[serde(default = "default_true")]
    is_active: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct RawOrderBook {
    timestamp: i64,
    #[serde(default)]
    bids: Vec<[f64; 2]>,
    #[serde(default)]
    asks: Vec<[f64; 2]>,
    #[serde(default)]
    mark_price: Option<f64>,
    #[serde(default)]
    index_price: Option<f64>,
    #[serde(default)]
    open_interest: Option<f64>,
    #[serde(default)]
    stats: Option<RawBookStats>,
}

#[derive(Debug, Deserialize)]
struct RawBookStats {
    #[serde(default)]
    volume: Option<f64>,
}

impl CatalogClient {
    pub fn new(base_url: &str, limiter: Arc<TokenBucket>) -> Result<Self, CatalogError> {
        let http = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(TOTAL_TIMEOUT)
            .pool_max_idle_per_host(4)
            .build()
            .map_err(|e| CatalogError::Permanent(format!("failed to build http client: {}", e)))?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            limiter,
        })
    }

    /// List all currently-listed instruments for a currency + kind.
    pub async fn list_active(
        &self,
        currency: &str,
        kind: InstrumentKind,
    ) -> Result<Vec<InstrumentDescriptor>, CatalogError> {
        self.limiter.acquire().await;

        let url = format!("{}/get_instruments", self.base_url);
        // Boolean query parameters must be lowercase strings, not native
        // booleans; the endpoint rejects `?expired=False`.
        let resp = self
            .http
            .get(&url)
            .query(&[
                ("currency", currency),
                ("kind", kind.as_str()),
                ("expired", "false"),
            ])
            .send()
            .await
            .map_err(classify_reqwest)?;

        let status = resp.status();
        if !status.is_success() {
            return Err(classify_status(status, "get_instruments"));
        }

        let body: Value = resp
            .json()
            .await
            .map_err(|e| CatalogError::Permanent(format!("get_instruments body: {}", e)))?;
        parse_instruments(&body)
    }

    /// One-shot full-depth read for a single instrument.
    pub async fn fetch_depth(
        &self,
        instrument: &str,
        max_levels: usize,
    ) -> Result<DepthSnapshot, CatalogError> {
        self.limiter.acquire().await;

        let url = format!("{}/get_order_book", self.base_url);
        let depth = max_levels.to_string();
        let resp = self
            .http
            .get(&url)
            .query(&[("instrument_name", instrument), ("depth", depth.as_str())])
            .send()
            .await
            .map_err(classify_reqwest)?;

        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Err(CatalogError::NotFound(instrument.to_string()));
        }
        if !status.is_success() {
            return Err(classify_status(status, "get_order_book"));
        }

        let body: Value = resp
            .json()
            .await
            .map_err(|e| CatalogError::Permanent(format!("get_order_book body: {}", e)))?;

        // Expired-between-listing-and-call surfaces as an error body, not 404.
        if let Some(message) = body
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(|m| m.as_str())
        {
            if message.contains("not_found") || message.contains("instrument") {
                return Err(CatalogError::NotFound(instrument.to_string()));
            }
            return Err(CatalogError::Permanent(format!(
                "get_order_book error: {}",
                message
            )));
        }

        parse_order_book(&body, instrument, max_levels)
    }
}

fn classify_reqwest(err: reqwest::Error) -> CatalogError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        CatalogError::Transient(err.to_string())
    } else if err.is_decode() {
        CatalogError::Permanent(err.to_string())
    } else {
        CatalogError::Transient(err.to_string())
    }
}

fn classify_status(status: StatusCode, endpoint: &str) -> CatalogError {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        CatalogError::Transient(format!("{} returned {}", endpoint, status))
    } else {
        CatalogError::Permanent(format!("{} returned {}", endpoint, status))
    }
}

fn parse_instruments(body: &Value) -> Result<Vec<InstrumentDescriptor>, CatalogError> {
    let result = body
        .get("result")
        .ok_or_else(|| CatalogError::Permanent("get_instruments: missing result".to_string()))?;
    let raw: Vec<RawInstrument> = serde_json::from_value(result.clone())
        .map_err(|e| CatalogError::Permanent(format!("get_instruments result: {}", e)))?;

    let mut out = Vec::with_capacity(raw.len());
    for r in raw {
        let kind = match r.kind.as_str() {
            "option" => InstrumentKind::Option,
            "perpetual" => InstrumentKind::Perpetual,
            "future" => {
                if r.instrument_name.ends_with("-PERPETUAL") {
                    InstrumentKind::Perpetual
                } else {
                    InstrumentKind::Future
                }
            }
            other => {
                return Err(CatalogError::Permanent(format!(
                    "unknown instrument kind: {}",
                    other
                )))
            }
        };
        let option_side = match r.option_type.as_deref() {
            Some("call") => Some(OptionSide::Call),
            Some("put") => Some(OptionSide::Put),
            Some(other) => {
                return Err(CatalogError::Permanent(format!(
                    "unknown option type: {}",
                    other
                )))
            }
            None => None,
        };
        let expiry = match r.expiration_timestamp {
            Some(ms) => Some(Utc.timestamp_millis_opt(ms).single().ok_or_else(|| {
                CatalogError::Permanent(format!("bad expiration_timestamp: {}", ms))
            })?),
            None => None,
        };
        let currency = r.base_currency.unwrap_or_else(|| {
            r.instrument_name
                .split('-')
                .next()
                .unwrap_or_default()
                .to_string()
        });

        out.push(InstrumentDescriptor {
            name: r.instrument_name,
            currency,
            kind,
            strike: r.strike,
            expiry,
            option_side,
            is_active: r.is_active,
        });
    }
    Ok(out)
}

fn parse_order_book(
    body: &Value,
    instrument: &str,
    max_levels: usize,
) -> Result<DepthSnapshot, CatalogError> {
    let result = body
        .get("result")
        .ok_or_else(|| CatalogError::Permanent("get_order_book: missing result".to_string()))?;
    let raw: RawOrderBook = serde_json::from_value(result.clone())
        .map_err(|e| CatalogError::Permanent(format!("get_order_book result: {}", e)))?;

    let ts = Utc
        .timestamp_millis_opt(raw.timestamp)
        .single()
        .ok_or_else(|| {
            CatalogError::Permanent(format!("bad order book timestamp: {}", raw.timestamp))
        })?;

    let mut bids: Vec<DepthLevel> = raw
        .bids
        .into_iter()
        .map(|[price, size]| DepthLevel { price, size })
        .collect();
    let mut asks: Vec<DepthLevel> = raw
        .asks
        .into_iter()
        .map(|[price, size]| DepthLevel { price, size })
        .collect();

    // Ladder ordering is part of the row contract: bids descending, asks ascending.
    bids.sort_by(|a, b| b.price.partial_cmp(&a.price).unwrap_or(std::cmp::Ordering::Equal));
    asks.sort_by(|a, b| a.price.partial_cmp(&b.price).unwrap_or(std::cmp::Ordering::Equal));
    bids.truncate(max_levels);
    asks.truncate(max_levels);

    Ok(DepthSnapshot {
        ts,
        instrument: instrument.to_string(),
        bids,
        asks,
        mark_price: raw.mark_price,
        index_price: raw.index_price,
        open_interest: raw.open_interest,
        volume_24h: raw.stats.and_then(|s| s.volume),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_instrument_listing() {
        let body: Value = serde_json::from_str(
            r#"{
                "result": [
                    {
                        "instrument_name": "BTC-27JUN25-100000-C",
                        "base_currency": "BTC",
                        "kind": "option",
                        "strike": 100000.0,
                        "expiration_timestamp": 1750982400000,
                        "option_type": "call",
                        "is_active": true
                    },
                    {
                        "instrument_name": "BTC-PERPETUAL",
                        "base_currency": "BTC",
                        "kind": "perpetual",
                        "is_active": true
                    }
                ]
            }"#,
        )
        .unwrap();

        let instruments = parse_instruments(&body).unwrap();
        assert_eq!(instruments.len(), 2);

        let opt = &instruments[0];
        assert_eq!(opt.kind, InstrumentKind::Option);
        assert_eq!(opt.strike, Some(100000.0));
        assert_eq!(opt.option_side, Some(OptionSide::Call));
        assert_eq!(opt.expiry.unwrap().timestamp_millis(), 1_750_982_400_000);

        let perp = &instruments[1];
        assert_eq!(perp.kind, InstrumentKind::Perpetual);
        assert_eq!(perp.expiry, None);
        assert_eq!(perp.option_side, None);
    }

    #[test]
    fn listing_with_unknown_kind_is_permanent() {
        let body: Value = serde_json::from_str(
            r#"{"result": [{"instrument_name": "X", "kind": "swap"}]}"#,
        )
        .unwrap();
        match parse_instruments(&body) {
            Err(CatalogError::Permanent(_)) => {}
            other => panic!("expected permanent error, got {:?}", other),
        }
    }

    #[test]
    fn missing_result_is_permanent() {
        let body: Value = serde_json::from_str(r#"{"unexpected": true}"#).unwrap();
        assert!(matches!(
            parse_instruments(&body),
            Err(CatalogError::Permanent(_))
        ));
    }

    #[test]
    fn parses_order_book_and_orders_ladders() {
        let body: Value = serde_json::from_str(
            r#"{
                "result": {
                    "timestamp": 1719561600123,
                    "bids": [[63990.0, 5.0], [64000.0, 10.0]],
                    "asks": [[64020.0, 2.0], [64010.0, 7.0]],
                    "mark_price": 64005.0,
                    "index_price": 64003.2,
                    "open_interest": 120000.0,
                    "stats": {"volume": 54321.0}
                }
            }"#,
        )
        .unwrap();

        let snap = parse_order_book(&body, "BTC-PERPETUAL", 20).unwrap();
        assert_eq!(snap.instrument, "BTC-PERPETUAL");
        // Bids descending, asks ascending regardless of response order.
        assert_eq!(snap.bids[0].price, 64000.0);
        assert_eq!(snap.bids[1].price, 63990.0);
        assert_eq!(snap.asks[0].price, 64010.0);
        assert_eq!(snap.asks[1].price, 64020.0);
        assert_eq!(snap.volume_24h, Some(54321.0));
    }

    #[test]
    fn order_book_truncates_to_max_levels() {
        let bids: Vec<[f64; 2]> = (0..30).map(|i| [1000.0 - i as f64, 1.0]).collect();
        let body = serde_json::json!({
            "result": {
                "timestamp": 1719561600123i64,
                "bids": bids,
                "asks": [],
            }
        });
        let snap = parse_order_book(&body, "BTC-PERPETUAL", 20).unwrap();
        assert_eq!(snap.bids.len(), 20);
        assert!(snap.asks.is_empty());
    }

    #[test]
    fn status_classification() {
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, "x").is_transient());
        assert!(classify_status(StatusCode::BAD_GATEWAY, "x").is_transient());
        assert!(!classify_status(StatusCode::BAD_REQUEST, "x").is_transient());
    }
}
