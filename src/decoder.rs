//! Wire codec for the exchange streaming protocol.
//!
//! Decoding is pure: a text frame goes in, a typed [`StreamEvent`] or a
//! [`DecodeError`] comes out. No I/O, no shared state. Heartbeats and
//! subscription acks are surfaced as their own variants so the session loop
//! can answer/track them; unknown frame shapes are a `DecodeError` the
//! caller counts and skips.
//!
//! The small set of outbound frames (subscribe, unsubscribe, heartbeat
//! answer) is built here too so the wire format lives in one module.

use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::Value;

use crate::error::DecodeError;
use crate::models::{parse_channel, ChannelKind, QuoteTick, StreamEvent, TakerSide, TradeTick};

#[derive(Debug, Deserialize)]
struct RawFrame {
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<Value>,
    #[serde(default)]
    id: Option<u64>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RawError>,
}

#[derive(Debug, Deserialize)]
struct RawError {
    #[serde(default)]
    code: Option<i64>,
    message: String,
}

#[derive(Debug, Deserialize)]
struct RawSubscription {
    channel: String,
    data: Value,
}

#[derive(Debug, Deserialize)]
struct RawQuote {
    timestamp: i64,
    #[serde(default)]
    instrument_name: Option<String>,
    #[serde(default)]
    best_bid_price: Option<f64>,
    #[serde(default)]
    best_bid_amount: Option<f64>,
    #[serde(default)]
    best_ask_price: Option<f64>,
    #[serde(default)]
    best_ask_amount: Option<f64>,
    #[serde(default)]
    mark_price: Option<f64>,
    #[serde(default)]
    index_price: Option<f64>,
    #[serde(default)]
    greeks: Option<RawGreeks>,
    #[serde(default)]
    bid_iv: Option<f64>,
    #[serde(default)]
    ask_iv: Option<f64>,
    #[serde(default)]
    mark_iv: Option<f64>,
    #[serde(default)]
    open_interest: Option<f64>,
    #[serde(default)]
    last_price: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RawGreeks {
    #[serde(default)]
    delta: Option<f64>,
    #[serde(default)]
    gamma: Option<f64>,
    #[serde(default)]
    theta: Option<f64>,
    #[serde(default)]
    vega: Option<f64>,
    #[serde(default)]
    rho: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RawTrade {
    trade_id: String,
    timestamp: i64,
    #[serde(default)]
    instrument_name: Option<String>,
    price: f64,
    amount: f64,
    direction: String,
    #[serde(default)]
    iv: Option<f64>,
    #[serde(default)]
    index_price: Option<f64>,
}

/// Normalize an exchange millisecond epoch to UTC with millisecond precision.
fn ts_from_millis(ms: i64) -> Result<DateTime<Utc>, DecodeError> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| DecodeError::new(format!("timestamp out of range: {}", ms)))
}

/// Decode one inbound text frame.
pub fn decode(frame: &str) -> Result<StreamEvent, DecodeError> {
    let raw: RawFrame = serde_json::from_str(frame)
        .map_err(|e| DecodeError::new(format!("invalid json: {}", e)))?;

    if let Some(err) = raw.error {
        return Ok(StreamEvent::ProtocolError {
            message: match err.code {
                Some(code) => format!("{} (code {})", err.message, code),
                None => err.message,
            },
        });
    }

    match raw.method.as_deref() {
        Some("subscription") => {
            let params = raw
                .params
                .ok_or_else(|| DecodeError::new("subscription frame without params"))?;
            let sub: RawSubscription = serde_json::from_value(params)
                .map_err(|e| DecodeError::new(format!("bad subscription params: {}", e)))?;
            decode_subscription(&sub.channel, sub.data)
        }
        Some("heartbeat") => {
            let kind = raw
                .params
                .as_ref()
                .and_then(|p| p.get("type"))
                .and_then(|t| t.as_str())
                .unwrap_or("heartbeat");
            if kind == "test_request" {
                Ok(StreamEvent::TestRequest)
            } else {
                Ok(StreamEvent::Heartbeat)
            }
        }
        Some(other) => Err(DecodeError::new(format!("unknown method: {}", other))),
        None => {
            // Request/response path: a numbered result frame acks a
            // subscribe/unsubscribe (the result lists the affected channels).
            match (raw.id, raw.result) {
                (Some(_), Some(Value::Array(items))) => {
                    let channels = items
                        .into_iter()
                        .filter_map(|v| v.as_str().map(str::to_string))
                        .collect();
                    Ok(StreamEvent::SubscriptionAck(channels))
                }
                (Some(_), Some(_)) => Ok(StreamEvent::SubscriptionAck(Vec::new())),
                _ => Err(DecodeError::new("frame without method, result, or error")),
            }
        }
    }
}

fn decode_subscription(channel: &str, data: Value) -> Result<StreamEvent, DecodeError> {
    let (kind, instrument) = parse_channel(channel)
        .ok_or_else(|| DecodeError::new(format!("unparseable channel: {}", channel)))?;
    let instrument = instrument.to_string();

    match kind {
        ChannelKind::Quote => {
            let raw: RawQuote = serde_json::from_value(data)
                .map_err(|e| DecodeError::new(format!("bad quote payload: {}", e)))?;
            Ok(StreamEvent::Quote(QuoteTick {
                ts: ts_from_millis(raw.timestamp)?,
                instrument: raw.instrument_name.unwrap_or(instrument),
                bid_price: raw.best_bid_price,
                bid_size: raw.best_bid_amount,
                ask_price: raw.best_ask_price,
                ask_size: raw.best_ask_amount,
                mark_price: raw.mark_price,
                index_price: raw.index_price,
                delta: raw.greeks.as_ref().and_then(|g| g.delta),
                gamma: raw.greeks.as_ref().and_then(|g| g.gamma),
                theta: raw.greeks.as_ref().and_then(|g| g.theta),
                vega: raw.greeks.as_ref().and_then(|g| g.vega),
                rho: raw.greeks.as_ref().and_then(|g| g.rho),
                bid_iv: raw.bid_iv,
                ask_iv: raw.ask_iv,
                mark_iv: raw.mark_iv,
                open_interest: raw.open_interest,
                last_price: raw.last_price,
            }))
        }
        ChannelKind::Trades => {
            let raw: Vec<RawTrade> = serde_json::from_value(data)
                .map_err(|e| DecodeError::new(format!("bad trades payload: {}", e)))?;
            let mut trades = Vec::with_capacity(raw.len());
            for t in raw {
                let side = TakerSide::parse(&t.direction)
                    .ok_or_else(|| DecodeError::new(format!("bad direction: {}", t.direction)))?;
                trades.push(TradeTick {
                    ts: ts_from_millis(t.timestamp)?,
                    instrument: t.instrument_name.unwrap_or_else(|| instrument.clone()),
                    trade_id: t.trade_id,
                    price: t.price,
                    size: t.amount,
                    side,
                    iv: t.iv,
                    index_price: t.index_price,
                });
            }
            Ok(StreamEvent::Trades(trades))
        }
        ChannelKind::Book => Err(DecodeError::new(format!(
            "unexpected book channel frame: {}",
            channel
        ))),
    }
}

// ---------------------------------------------------------------------------
// Outbound frames
// ---------------------------------------------------------------------------

pub fn subscribe_frame(id: u64, channels: &[String]) -> String {
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": "public/subscribe",
        "params": { "channels": channels },
    })
    .to_string()
}

pub fn unsubscribe_frame(id: u64, channels: &[String]) -> String {
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": "public/unsubscribe",
        "params": { "channels": channels },
    })
    .to_string()
}

/// Answer to a server `test_request`; any response within the heartbeat
/// window keeps the session alive.
pub fn heartbeat_answer_frame(id: u64) -> String {
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": "public/test",
        "params": {},
    })
    .to_string()
}

/// Ask the server to emit heartbeats on the given cadence.
pub fn set_heartbeat_frame(id: u64, interval_secs: u64) -> String {
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": "public/set_heartbeat",
        "params": { "interval": interval_secs },
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_quote_with_greeks() {
        let frame = r#"{
            "jsonrpc": "2.0",
            "method": "subscription",
            "params": {
                "channel": "quote.BTC-27JUN25-100000-C.raw",
                "data": {
                    "timestamp": 1719561600123,
                    "instrument_name": "BTC-27JUN25-100000-C",
                    "best_bid_price": 0.043,
                    "best_bid_amount": 5.0,
                    "best_ask_price": 0.0445,
                    "best_ask_amount": 12.3,
                    "mark_price": 0.0438,
                    "index_price": 64123.55,
                    "greeks": {"delta": 0.42, "gamma": 0.00001, "theta": -22.1, "vega": 110.5, "rho": 40.2},
                    "bid_iv": 55.2,
                    "ask_iv": 57.8,
                    "mark_iv": 56.4,
                    "open_interest": 1523.0,
                    "last_price": 0.044
                }
            }
        }"#;

        let event = decode(frame).unwrap();
        match event {
            StreamEvent::Quote(q) => {
                assert_eq!(q.instrument, "BTC-27JUN25-100000-C");
                assert_eq!(q.ts.timestamp_millis(), 1_719_561_600_123);
                assert_eq!(q.bid_price, Some(0.043));
                assert_eq!(q.ask_size, Some(12.3));
                assert_eq!(q.delta, Some(0.42));
                assert_eq!(q.mark_iv, Some(56.4));
                assert_eq!(q.open_interest, Some(1523.0));
            }
            other => panic!("expected quote, got {:?}", other),
        }
    }

    #[test]
    fn decodes_quote_with_missing_optionals() {
        let frame = r#"{
            "method": "subscription",
            "params": {
                "channel": "quote.BTC-PERPETUAL.raw",
                "data": {"timestamp": 1719561600000, "best_bid_price": 64000.5, "best_bid_amount": 100.0}
            }
        }"#;

        match decode(frame).unwrap() {
            StreamEvent::Quote(q) => {
                assert_eq!(q.instrument, "BTC-PERPETUAL");
                assert_eq!(q.ask_price, None);
                assert_eq!(q.delta, None);
            }
            other => panic!("expected quote, got {:?}", other),
        }
    }

    #[test]
    fn decodes_trade_list_in_order() {
        let frame = r#"{
            "method": "subscription",
            "params": {
                "channel": "trades.BTC-PERPETUAL.raw",
                "data": [
                    {"trade_id": "BTC-1", "timestamp": 1719561600001, "price": 64000.0, "amount": 10.0, "direction": "buy", "index_price": 64001.0},
                    {"trade_id": "BTC-2", "timestamp": 1719561600002, "price": 64001.5, "amount": 2.5, "direction": "sell"}
                ]
            }
        }"#;

        match decode(frame).unwrap() {
            StreamEvent::Trades(trades) => {
                assert_eq!(trades.len(), 2);
                assert_eq!(trades[0].trade_id, "BTC-1");
                assert_eq!(trades[0].side, TakerSide::Buy);
                assert_eq!(trades[1].trade_id, "BTC-2");
                assert_eq!(trades[1].side, TakerSide::Sell);
                assert!(trades[0].ts < trades[1].ts);
            }
            other => panic!("expected trades, got {:?}", other),
        }
    }

    #[test]
    fn decodes_heartbeat_and_test_request() {
        let hb = r#"{"method": "heartbeat", "params": {"type": "heartbeat"}}"#;
        assert!(matches!(decode(hb).unwrap(), StreamEvent::Heartbeat));

        let tr = r#"{"method": "heartbeat", "params": {"type": "test_request"}}"#;
        assert!(matches!(decode(tr).unwrap(), StreamEvent::TestRequest));
    }

    #[test]
    fn decodes_subscription_ack() {
        let frame = r#"{"jsonrpc": "2.0", "id": 7, "result": ["quote.BTC-PERPETUAL.raw", "trades.BTC-PERPETUAL.raw"]}"#;
        match decode(frame).unwrap() {
            StreamEvent::SubscriptionAck(channels) => assert_eq!(channels.len(), 2),
            other => panic!("expected ack, got {:?}", other),
        }
    }

    #[test]
    fn decodes_error_frame() {
        let frame =
            r#"{"jsonrpc": "2.0", "id": 9, "error": {"code": 11044, "message": "subscription limit exceeded"}}"#;
        match decode(frame).unwrap() {
            StreamEvent::ProtocolError { message } => {
                assert!(message.contains("subscription"));
            }
            other => panic!("expected error, got {:?}", other),
        }
    }

    #[test]
    fn rejects_unknown_shapes_without_panicking() {
        assert!(decode("not json").is_err());
        assert!(decode(r#"{"method": "mystery"}"#).is_err());
        assert!(decode(r#"{"jsonrpc": "2.0"}"#).is_err());
        // Book frames are never subscribed on the stream path.
        let book = r#"{"method": "subscription", "params": {"channel": "book.BTC-PERPETUAL.100ms", "data": {}}}"#;
        assert!(decode(book).is_err());
    }

    #[test]
    fn rejects_bad_trade_direction() {
        let frame = r#"{
            "method": "subscription",
            "params": {
                "channel": "trades.BTC-PERPETUAL.raw",
                "data": [{"trade_id": "T", "timestamp": 1719561600001, "price": 1.0, "amount": 1.0, "direction": "hold"}]
            }
        }"#;
        assert!(decode(frame).is_err());
    }

    #[test]
    fn subscribe_frame_lists_channels() {
        let frame = subscribe_frame(3, &["quote.BTC-PERPETUAL.raw".to_string()]);
        let v: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(v["method"], "public/subscribe");
        assert_eq!(v["params"]["channels"][0], "quote.BTC-PERPETUAL.raw");
        assert_eq!(v["id"], 3);
    }
}
