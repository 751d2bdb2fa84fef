//! # Canonical Market Events
//!
//! Typed events replayed by the engine. Every event carries the exchange
//! clock (`event_time_ms`) and, when the capture recorded it, the local
//! receive clock (`received_time_ns`) used only as a merge tie-break.
//!
//! ## Event Types
//! - `DepthUpdate` - sparse L2 deltas keyed by `final_update_id`
//! - `Trade` - the public trade tape (drives the maker queue model)
//! - `MarkPrice` - mark/index/funding snapshot (drives funding settlement)
//! - `Ticker` / `OpenInterest` / `Liquidation` - latched context snapshots
//!
//! `MarketEvent` is the sum type the engine loop dispatches on; its accessor
//! methods (`event_time_ms`, `received_time_ns`, `type_rank`, `tie_id`)
//! define the deterministic merge ordering.

use serde::{Deserialize, Serialize};

/// Order / trade side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// The opposite side.
    pub fn flip(self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    /// Sign convention used by position accounting: buy = +1, sell = -1.
    pub fn sign(self) -> f64 {
        match self {
            Side::Buy => 1.0,
            Side::Sell => -1.0,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

/// Sparse L2 depth delta.
///
/// One `DepthUpdate` per exchange diff message (`final_update_id`). A level
/// update with `qty == 0.0` removes that price level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepthUpdate {
    /// Exchange event time (ms UTC). Canonical engine clock.
    pub event_time_ms: i64,
    /// Local receive time (ns UTC), when captured. Merge tie-break only.
    #[serde(default)]
    pub received_time_ns: Option<i64>,
    /// Matching-engine transaction time (ms UTC), when provided.
    #[serde(default)]
    pub transaction_time_ms: Option<i64>,
    pub symbol: String,
    #[serde(default)]
    pub first_update_id: Option<i64>,
    /// Sequence id of this diff; also the merge tie-break identifier.
    pub final_update_id: i64,
    /// `final_update_id` of the previous diff in the stream. Used by the
    /// book guard to detect sequence gaps.
    #[serde(default)]
    pub prev_final_update_id: Option<i64>,
    /// `(price, qty)` pairs; `qty == 0.0` removes the level.
    pub bid_updates: Vec<(f64, f64)>,
    pub ask_updates: Vec<(f64, f64)>,
}

/// Public trade tape entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub event_time_ms: i64,
    #[serde(default)]
    pub received_time_ns: Option<i64>,
    pub symbol: String,
    pub trade_id: i64,
    pub price: f64,
    pub quantity: f64,
    /// Binance semantics: `true` means the buyer was the resting maker, so
    /// the aggressor was a seller (a downtick hitting bids).
    pub is_buyer_maker: bool,
}

impl Trade {
    /// Side of the aggressor that produced this print.
    pub fn aggressor_side(&self) -> Side {
        if self.is_buyer_maker { Side::Sell } else { Side::Buy }
    }
}

/// Mark-price / funding snapshot for a perpetual contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarkPrice {
    pub event_time_ms: i64,
    #[serde(default)]
    pub received_time_ns: Option<i64>,
    pub symbol: String,
    pub mark_price: f64,
    pub index_price: f64,
    pub funding_rate: f64,
    /// Timestamp (ms UTC) of the upcoming funding settlement this snapshot
    /// is quoting for. The engine applies funding at the first mark event at
    /// or after this timestamp, once per (symbol, timestamp).
    pub next_funding_time_ms: i64,
}

/// 24h rolling ticker statistics. Latched into context; no other engine
/// side effect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticker {
    pub event_time_ms: i64,
    #[serde(default)]
    pub received_time_ns: Option<i64>,
    pub symbol: String,
    pub price_change: f64,
    pub price_change_percent: f64,
    pub weighted_average_price: f64,
    pub last_price: f64,
    pub last_quantity: f64,
    pub open_price: f64,
    pub high_price: f64,
    pub low_price: f64,
    pub base_asset_volume: f64,
    pub quote_asset_volume: f64,
    pub statistics_open_time_ms: i64,
    pub statistics_close_time_ms: i64,
    pub first_trade_id: i64,
    pub last_trade_id: i64,
    pub total_trades: i64,
}

/// Open-interest snapshot. Latched into context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenInterest {
    pub event_time_ms: i64,
    #[serde(default)]
    pub received_time_ns: Option<i64>,
    /// Sampling timestamp reported by the venue (ms UTC). May lag
    /// `event_time_ms` when the adapter models availability delay.
    pub timestamp_ms: i64,
    pub symbol: String,
    pub sum_open_interest: f64,
    pub sum_open_interest_value: f64,
}

/// Forced-liquidation order event. Latched into context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Liquidation {
    pub event_time_ms: i64,
    #[serde(default)]
    pub received_time_ns: Option<i64>,
    pub symbol: String,
    pub side: String,
    pub order_type: String,
    pub time_in_force: String,
    pub quantity: f64,
    pub price: f64,
    pub average_price: f64,
    pub order_status: String,
    pub last_filled_quantity: f64,
    pub filled_quantity: f64,
    pub trade_time_ms: i64,
}

// =============================================================================
// Event sum type
// =============================================================================

/// Tagged union of every event kind the engine understands.
///
/// The engine loop matches on the variant; strategies receive the variant
/// and discriminate the same way.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MarketEvent {
    Depth(DepthUpdate),
    Trade(Trade),
    Mark(MarkPrice),
    Ticker(Ticker),
    OpenInterest(OpenInterest),
    Liquidation(Liquidation),
}

impl MarketEvent {
    /// Canonical event time (ms UTC).
    pub fn event_time_ms(&self) -> i64 {
        match self {
            MarketEvent::Depth(e) => e.event_time_ms,
            MarketEvent::Trade(e) => e.event_time_ms,
            MarketEvent::Mark(e) => e.event_time_ms,
            MarketEvent::Ticker(e) => e.event_time_ms,
            MarketEvent::OpenInterest(e) => e.event_time_ms,
            MarketEvent::Liquidation(e) => e.event_time_ms,
        }
    }

    /// Receive time (ns UTC), when the capture recorded one.
    pub fn received_time_ns(&self) -> Option<i64> {
        match self {
            MarketEvent::Depth(e) => e.received_time_ns,
            MarketEvent::Trade(e) => e.received_time_ns,
            MarketEvent::Mark(e) => e.received_time_ns,
            MarketEvent::Ticker(e) => e.received_time_ns,
            MarketEvent::OpenInterest(e) => e.received_time_ns,
            MarketEvent::Liquidation(e) => e.received_time_ns,
        }
    }

    pub fn symbol(&self) -> &str {
        match self {
            MarketEvent::Depth(e) => &e.symbol,
            MarketEvent::Trade(e) => &e.symbol,
            MarketEvent::Mark(e) => &e.symbol,
            MarketEvent::Ticker(e) => &e.symbol,
            MarketEvent::OpenInterest(e) => &e.symbol,
            MarketEvent::Liquidation(e) => &e.symbol,
        }
    }

    /// Merge priority among events with equal timestamps: book state must be
    /// refreshed before trades evaluated against it, and before mark updates.
    pub fn type_rank(&self) -> u8 {
        match self {
            MarketEvent::Depth(_) => 0,
            MarketEvent::Trade(_) => 1,
            MarketEvent::Mark(_) => 2,
            MarketEvent::Ticker(_) => 3,
            MarketEvent::OpenInterest(_) => 4,
            MarketEvent::Liquidation(_) => 5,
        }
    }

    /// Type-specific identifier used as the fourth merge tie-break:
    /// `final_update_id` for depth, `trade_id` for trades, zero otherwise.
    pub fn tie_id(&self) -> i64 {
        match self {
            MarketEvent::Depth(e) => e.final_update_id,
            MarketEvent::Trade(e) => e.trade_id,
            _ => 0,
        }
    }

    /// Short label for counters and log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            MarketEvent::Depth(_) => "depth",
            MarketEvent::Trade(_) => "trade",
            MarketEvent::Mark(_) => "mark_price",
            MarketEvent::Ticker(_) => "ticker",
            MarketEvent::OpenInterest(_) => "open_interest",
            MarketEvent::Liquidation(_) => "liquidation",
        }
    }
}

impl From<DepthUpdate> for MarketEvent {
    fn from(e: DepthUpdate) -> Self {
        MarketEvent::Depth(e)
    }
}

impl From<Trade> for MarketEvent {
    fn from(e: Trade) -> Self {
        MarketEvent::Trade(e)
    }
}

impl From<MarkPrice> for MarketEvent {
    fn from(e: MarkPrice) -> Self {
        MarketEvent::Mark(e)
    }
}

impl From<Ticker> for MarketEvent {
    fn from(e: Ticker) -> Self {
        MarketEvent::Ticker(e)
    }
}

impl From<OpenInterest> for MarketEvent {
    fn from(e: OpenInterest) -> Self {
        MarketEvent::OpenInterest(e)
    }
}

impl From<Liquidation> for MarketEvent {
    fn from(e: Liquidation) -> Self {
        MarketEvent::Liquidation(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggressor_side_follows_buyer_maker_flag() {
        let mut t = Trade {
            event_time_ms: 1,
            received_time_ns: None,
            symbol: "BTCUSDT".to_string(),
            trade_id: 1,
            price: 100.0,
            quantity: 1.0,
            is_buyer_maker: true,
        };
        assert_eq!(t.aggressor_side(), Side::Sell);
        t.is_buyer_maker = false;
        assert_eq!(t.aggressor_side(), Side::Buy);
    }

    #[test]
    fn type_rank_orders_depth_before_trades_before_mark() {
        let depth = MarketEvent::Depth(DepthUpdate {
            event_time_ms: 1,
            received_time_ns: None,
            transaction_time_ms: None,
            symbol: "X".to_string(),
            first_update_id: None,
            final_update_id: 1,
            prev_final_update_id: None,
            bid_updates: vec![],
            ask_updates: vec![],
        });
        let trade = MarketEvent::Trade(Trade {
            event_time_ms: 1,
            received_time_ns: None,
            symbol: "X".to_string(),
            trade_id: 1,
            price: 1.0,
            quantity: 1.0,
            is_buyer_maker: false,
        });
        let mark = MarketEvent::Mark(MarkPrice {
            event_time_ms: 1,
            received_time_ns: None,
            symbol: "X".to_string(),
            mark_price: 1.0,
            index_price: 1.0,
            funding_rate: 0.0,
            next_funding_time_ms: 0,
        });
        assert!(depth.type_rank() < trade.type_rank());
        assert!(trade.type_rank() < mark.type_rank());
    }

    #[test]
    fn depth_update_round_trips_through_json() {
        let ev = DepthUpdate {
            event_time_ms: 1_000,
            received_time_ns: Some(1_000_000_123),
            transaction_time_ms: Some(999),
            symbol: "BTCUSDT".to_string(),
            first_update_id: Some(10),
            final_update_id: 12,
            prev_final_update_id: Some(9),
            bid_updates: vec![(100.0, 2.0), (99.5, 0.0)],
            ask_updates: vec![(100.5, 1.0)],
        };
        let json = serde_json::to_string(&ev).unwrap();
        let back: DepthUpdate = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ev);
    }

    #[test]
    fn depth_update_optional_fields_default_when_absent() {
        let row = r#"{
            "event_time_ms": 1000,
            "symbol": "BTCUSDT",
            "final_update_id": 7,
            "bid_updates": [[100.0, 1.0]],
            "ask_updates": []
        }"#;
        let ev: DepthUpdate = serde_json::from_str(row).unwrap();
        assert_eq!(ev.final_update_id, 7);
        assert!(ev.received_time_ns.is_none());
        assert!(ev.prev_final_update_id.is_none());
    }
}
