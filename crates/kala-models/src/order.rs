//! # Orders, Fills and Rejections
//!
//! Order intents submitted by strategies, the execution fills the simulated
//! broker appends, and the rejection records used to report non-fatal submit
//! failures back to the strategy.
//!
//! Order lifecycle: pending-submit -> active -> {filled, cancelled,
//! rejected}. Fills are append-only.

use serde::{Deserialize, Serialize};

use crate::events::Side;

/// Order type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Market,
    Limit,
}

/// Time in force for limit orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TimeInForce {
    /// Good-till-cancel: rests on the book until filled or cancelled.
    Gtc,
    /// Immediate-or-cancel: takes what it can up to the limit, residue
    /// cancelled.
    Ioc,
    /// Fill-or-kill: fills the full quantity immediately or is rejected
    /// with no book impact.
    Fok,
}

/// Which side of the trade provided liquidity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Liquidity {
    Maker,
    Taker,
}

/// Order intent.
///
/// `id` is caller-supplied and must be unique across the broker's lifetime;
/// duplicates are rejected as invalid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub quantity: f64,
    #[serde(default)]
    pub limit_price: Option<f64>,
    #[serde(default = "default_tif")]
    pub time_in_force: TimeInForce,
    /// Reject at activation if the order would grow the absolute position.
    #[serde(default)]
    pub reduce_only: bool,
    /// Maker-only: never take liquidity. Behavior for a marketable
    /// post-only limit is a broker configuration decision.
    #[serde(default)]
    pub post_only: bool,
}

fn default_tif() -> TimeInForce {
    TimeInForce::Gtc
}

impl Order {
    /// Market order with GTC defaults.
    pub fn market(id: impl Into<String>, symbol: impl Into<String>, side: Side, qty: f64) -> Self {
        Self {
            id: id.into(),
            symbol: symbol.into(),
            side,
            order_type: OrderType::Market,
            quantity: qty,
            limit_price: None,
            time_in_force: TimeInForce::Gtc,
            reduce_only: false,
            post_only: false,
        }
    }

    /// Limit order with GTC defaults.
    pub fn limit(
        id: impl Into<String>,
        symbol: impl Into<String>,
        side: Side,
        qty: f64,
        price: f64,
    ) -> Self {
        Self {
            id: id.into(),
            symbol: symbol.into(),
            side,
            order_type: OrderType::Limit,
            quantity: qty,
            limit_price: Some(price),
            time_in_force: TimeInForce::Gtc,
            reduce_only: false,
            post_only: false,
        }
    }

    pub fn ioc(mut self) -> Self {
        self.time_in_force = TimeInForce::Ioc;
        self
    }

    pub fn fok(mut self) -> Self {
        self.time_in_force = TimeInForce::Fok;
        self
    }

    pub fn post_only(mut self) -> Self {
        self.post_only = true;
        self
    }

    pub fn reduce_only(mut self) -> Self {
        self.reduce_only = true;
        self
    }
}

/// Execution fill record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    pub order_id: String,
    pub symbol: String,
    pub side: Side,
    pub price: f64,
    pub quantity: f64,
    pub fee_usdt: f64,
    pub liquidity: Liquidity,
    pub event_time_ms: i64,
}

impl Fill {
    pub fn notional_usdt(&self) -> f64 {
        self.price * self.quantity
    }
}

/// Why a submit (or a latent activation) did not result in a working order.
///
/// These are reported to the strategy and recorded by the broker; none of
/// them terminate the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RejectReason {
    /// Order references a symbol with no book.
    UnknownSymbol,
    /// Malformed order: non-positive quantity, duplicate id, market +
    /// post_only, limit without a price, reduce-only that would grow the
    /// position, post-only that would cross (in `Reject` mode).
    InvalidOrder { detail: String },
    /// The book guard vetoed the submit; `reason` is the guard's reason code
    /// (cooldown, warmup, stale, missing_side, crossed, spread).
    GuardBlocked { reason: String },
    /// FOK could not fully fill. Partial market/IOC fills are not rejections.
    InsufficientLiquidity,
    /// Submit fell outside the configured trading window.
    OutsideTradingWindow,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::UnknownSymbol => write!(f, "unknown symbol"),
            RejectReason::InvalidOrder { detail } => write!(f, "invalid order: {detail}"),
            RejectReason::GuardBlocked { reason } => write!(f, "guard blocked: {reason}"),
            RejectReason::InsufficientLiquidity => write!(f, "insufficient liquidity"),
            RejectReason::OutsideTradingWindow => write!(f, "outside trading window"),
        }
    }
}

/// Rejection record appended by the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rejection {
    pub order_id: String,
    pub symbol: String,
    pub event_time_ms: i64,
    pub reason: RejectReason,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builders_set_expected_fields() {
        let o = Order::limit("o1", "BTCUSDT", Side::Buy, 1.5, 100.0)
            .ioc()
            .reduce_only();
        assert_eq!(o.order_type, OrderType::Limit);
        assert_eq!(o.limit_price, Some(100.0));
        assert_eq!(o.time_in_force, TimeInForce::Ioc);
        assert!(o.reduce_only);
        assert!(!o.post_only);
    }

    #[test]
    fn order_defaults_apply_when_deserializing_sparse_json() {
        let o: Order = serde_json::from_str(
            r#"{"id":"o1","symbol":"BTCUSDT","side":"buy","order_type":"market","quantity":1.0}"#,
        )
        .unwrap();
        assert_eq!(o.time_in_force, TimeInForce::Gtc);
        assert!(!o.reduce_only);
        assert!(o.limit_price.is_none());
    }
}
