//! Core data model: instruments, ticks, depth snapshots, lifecycle events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Contract kind as advertised by the exchange catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstrumentKind {
    Option,
    Perpetual,
    Future,
}

impl InstrumentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstrumentKind::Option => "option",
            InstrumentKind::Perpetual => "perpetual",
            InstrumentKind::Future => "future",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptionSide {
    Call,
    Put,
}

impl OptionSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OptionSide::Call => "call",
            OptionSide::Put => "put",
        }
    }
}

/// Classify an instrument by its exchange-assigned name.
///
/// Option names carry a strike and a C/P suffix (`BTC-27JUN25-100000-C`),
/// perpetuals end in `-PERPETUAL`, everything else is a dated future.
pub fn kind_from_name(name: &str) -> InstrumentKind {
    if name.ends_with("-PERPETUAL") {
        return InstrumentKind::Perpetual;
    }
    let parts: Vec<&str> = name.split('-').collect();
    if parts.len() >= 4 && matches!(*parts.last().unwrap(), "C" | "P") {
        return InstrumentKind::Option;
    }
    InstrumentKind::Future
}

/// One tradable contract as listed by the exchange catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentDescriptor {
    pub name: String,
    pub currency: String,
    pub kind: InstrumentKind,
    pub strike: Option<f64>,
    pub expiry: Option<DateTime<Utc>>,
    pub option_side: Option<OptionSide>,
    pub is_active: bool,
}

/// An instrument row as tracked in `instrument_metadata`.
#[derive(Debug, Clone)]
pub struct TrackedInstrument {
    pub name: String,
    pub expiry: Option<DateTime<Utc>>,
}

/// Point-in-time best bid/ask observation. Immutable once written;
/// unique on `(ts, instrument)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuoteTick {
    pub ts: DateTime<Utc>,
    pub instrument: String,
    pub bid_price: Option<f64>,
    pub bid_size: Option<f64>,
    pub ask_price: Option<f64>,
    pub ask_size: Option<f64>,
    pub mark_price: Option<f64>,
    pub index_price: Option<f64>,
    pub delta: Option<f64>,
    pub gamma: Option<f64>,
    pub theta: Option<f64>,
    pub vega: Option<f64>,
    pub rho: Option<f64>,
    pub bid_iv: Option<f64>,
    pub ask_iv: Option<f64>,
    pub mark_iv: Option<f64>,
    pub open_interest: Option<f64>,
    pub last_price: Option<f64>,
}

impl QuoteTick {
    /// Row-level validity: crossed books and negative sizes never reach the store.
    pub fn validate(&self) -> Result<(), String> {
        if let (Some(bid), Some(ask)) = (self.bid_price, self.ask_price) {
            if bid > ask {
                return Err(format!("crossed quote: bid {} > ask {}", bid, ask));
            }
        }
        for (label, size) in [("bid_size", self.bid_size), ("ask_size", self.ask_size)] {
            if let Some(s) = size {
                if s < 0.0 {
                    return Err(format!("negative {}: {}", label, s));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TakerSide {
    Buy,
    Sell,
}

impl TakerSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            TakerSide::Buy => "buy",
            TakerSide::Sell => "sell",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "buy" => Some(TakerSide::Buy),
            "sell" => Some(TakerSide::Sell),
            _ => None,
        }
    }
}

/// An executed trade. Idempotent on replay; unique on `(ts, trade_id, instrument)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeTick {
    pub ts: DateTime<Utc>,
    pub instrument: String,
    pub trade_id: String,
    pub price: f64,
    pub size: f64,
    pub side: TakerSide,
    pub iv: Option<f64>,
    pub index_price: Option<f64>,
}

impl TradeTick {
    pub fn validate(&self) -> Result<(), String> {
        if !(self.price > 0.0) {
            return Err(format!("non-positive trade price: {}", self.price));
        }
        if !(self.size > 0.0) {
            return Err(format!("non-positive trade size: {}", self.size));
        }
        if self.trade_id.is_empty() {
            return Err("empty trade_id".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DepthLevel {
    pub price: f64,
    pub size: f64,
}

/// Full orderbook snapshot, bid ladder price-descending, ask ladder
/// price-ascending, at most 20 levels per side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepthSnapshot {
    pub ts: DateTime<Utc>,
    pub instrument: String,
    pub bids: Vec<DepthLevel>,
    pub asks: Vec<DepthLevel>,
    pub mark_price: Option<f64>,
    pub index_price: Option<f64>,
    pub open_interest: Option<f64>,
    pub volume_24h: Option<f64>,
}

/// Audit record kinds, append-only in `lifecycle_events`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleEventKind {
    SubscriptionAdded,
    SubscriptionRemoved,
    InstrumentExpired,
    InstrumentListed,
    RebalanceTriggered,
}

impl LifecycleEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleEventKind::SubscriptionAdded => "subscription_added",
            LifecycleEventKind::SubscriptionRemoved => "subscription_removed",
            LifecycleEventKind::InstrumentExpired => "instrument_expired",
            LifecycleEventKind::InstrumentListed => "instrument_listed",
            LifecycleEventKind::RebalanceTriggered => "rebalance_triggered",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub ts: DateTime<Utc>,
    pub kind: LifecycleEventKind,
    pub instrument: Option<String>,
    pub currency: String,
    pub session_id: Option<usize>,
    pub details: serde_json::Value,
    pub success: bool,
    pub error: Option<String>,
}

impl LifecycleEvent {
    pub fn new(kind: LifecycleEventKind, currency: &str) -> Self {
        Self {
            ts: Utc::now(),
            kind,
            instrument: None,
            currency: currency.to_string(),
            session_id: None,
            details: serde_json::json!({}),
            success: true,
            error: None,
        }
    }

    pub fn instrument(mut self, name: &str) -> Self {
        self.instrument = Some(name.to_string());
        self
    }

    pub fn session(mut self, session_id: usize) -> Self {
        self.session_id = Some(session_id);
        self
    }

    pub fn details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }

    pub fn failed(mut self, error: impl Into<String>) -> Self {
        self.success = false;
        self.error = Some(error.into());
        self
    }
}

/// Streamed channel kinds. Each subscribed instrument occupies one channel
/// per kind, and quote + trades are always subscribed together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    Quote,
    Trades,
    Book,
}

/// Channels consumed per streamed instrument (quote + trades).
pub const CHANNELS_PER_INSTRUMENT: usize = 2;

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::Quote => "quote",
            ChannelKind::Trades => "trades",
            ChannelKind::Book => "book",
        }
    }
}

/// Build a channel name: `{kind}.{instrument}.{label}` where the label is
/// `raw` for quote/trades and an aggregation interval for book channels.
pub fn channel_name(kind: ChannelKind, instrument: &str) -> String {
    match kind {
        ChannelKind::Book => format!("book.{}.100ms", instrument),
        _ => format!("{}.{}.raw", kind.as_str(), instrument),
    }
}

/// Split a channel name back into its kind and instrument.
pub fn parse_channel(channel: &str) -> Option<(ChannelKind, &str)> {
    let (kind, rest) = channel.split_once('.')?;
    let (instrument, _label) = rest.rsplit_once('.')?;
    if instrument.is_empty() {
        return None;
    }
    let kind = match kind {
        "quote" => ChannelKind::Quote,
        "trades" => ChannelKind::Trades,
        "book" => ChannelKind::Book,
        _ => return None,
    };
    Some((kind, instrument))
}

/// The two stream channels for one instrument.
pub fn instrument_channels(instrument: &str) -> [String; 2] {
    [
        channel_name(ChannelKind::Quote, instrument),
        channel_name(ChannelKind::Trades, instrument),
    ]
}

/// A typed stream frame after decoding.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Quote(QuoteTick),
    /// Trade channels may carry several executions in one frame; order preserved.
    Trades(Vec<TradeTick>),
    SubscriptionAck(Vec<String>),
    /// Server heartbeat that must be answered within the heartbeat window.
    TestRequest,
    Heartbeat,
    /// Exchange-side error frame; text is matched for capacity breaches.
    ProtocolError { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn quote(bid: Option<f64>, ask: Option<f64>) -> QuoteTick {
        QuoteTick {
            ts: Utc.timestamp_millis_opt(1_719_561_600_123).unwrap(),
            instrument: "BTC-27JUN25-100000-C".to_string(),
            bid_price: bid,
            bid_size: bid.map(|_| 1.0),
            ask_price: ask,
            ask_size: ask.map(|_| 2.0),
            mark_price: None,
            index_price: None,
            delta: None,
            gamma: None,
            theta: None,
            vega: None,
            rho: None,
            bid_iv: None,
            ask_iv: None,
            mark_iv: None,
            open_interest: None,
            last_price: None,
        }
    }

    #[test]
    fn classifies_instrument_kind_from_name() {
        assert_eq!(kind_from_name("BTC-PERPETUAL"), InstrumentKind::Perpetual);
        assert_eq!(
            kind_from_name("BTC-27JUN25-100000-C"),
            InstrumentKind::Option
        );
        assert_eq!(kind_from_name("ETH-27JUN25-4000-P"), InstrumentKind::Option);
        assert_eq!(kind_from_name("BTC-27JUN25"), InstrumentKind::Future);
    }

    #[test]
    fn quote_validation_rejects_crossed_book() {
        assert!(quote(Some(0.05), Some(0.06)).validate().is_ok());
        assert!(quote(Some(0.06), Some(0.05)).validate().is_err());
        // One-sided and empty books are fine.
        assert!(quote(Some(0.05), None).validate().is_ok());
        assert!(quote(None, None).validate().is_ok());
    }

    #[test]
    fn quote_validation_rejects_negative_size() {
        let mut q = quote(Some(0.05), Some(0.06));
        q.bid_size = Some(-1.0);
        assert!(q.validate().is_err());
    }

    #[test]
    fn trade_validation() {
        let trade = TradeTick {
            ts: Utc::now(),
            instrument: "BTC-PERPETUAL".to_string(),
            trade_id: "BTC-100".to_string(),
            price: 64000.0,
            size: 10.0,
            side: TakerSide::Buy,
            iv: None,
            index_price: None,
        };
        assert!(trade.validate().is_ok());

        let mut bad = trade.clone();
        bad.price = 0.0;
        assert!(bad.validate().is_err());

        let mut bad = trade.clone();
        bad.size = -1.0;
        assert!(bad.validate().is_err());

        let mut bad = trade;
        bad.trade_id.clear();
        assert!(bad.validate().is_err());
    }

    #[test]
    fn channel_names_round_trip() {
        let name = channel_name(ChannelKind::Quote, "BTC-27JUN25-100000-C");
        assert_eq!(name, "quote.BTC-27JUN25-100000-C.raw");
        let (kind, instrument) = parse_channel(&name).unwrap();
        assert_eq!(kind, ChannelKind::Quote);
        assert_eq!(instrument, "BTC-27JUN25-100000-C");

        let book = channel_name(ChannelKind::Book, "BTC-PERPETUAL");
        assert_eq!(book, "book.BTC-PERPETUAL.100ms");

        assert!(parse_channel("garbage").is_none());
        assert!(parse_channel("quote.").is_none());
    }
}
