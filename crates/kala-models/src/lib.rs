//! # Kala Models
//!
//! Canonical data model shared by the kala backtest engine and its adapters:
//!
//! - Market events (`DepthUpdate`, `Trade`, `MarkPrice`, `Ticker`,
//!   `OpenInterest`, `Liquidation`) and the `MarketEvent` sum type the engine
//!   dispatches on.
//! - Order, fill and rejection records for the simulated broker.
//! - The `EngineError` taxonomy shared across the engine and adapters.
//!
//! ## Clocks
//! Two clocks coexist on every event. `event_time_ms` (exchange clock,
//! milliseconds UTC) is the canonical engine clock; `received_time_ns`
//! (nanoseconds UTC) is a secondary merge tie-break only. Both are plain
//! 64-bit integers so replays are deterministic across platforms.
//!
//! ## Units
//! Prices and quantities are `f64`. Fees and PnL are denominated in the quote
//! currency (USDT).

pub mod error;
pub mod events;
pub mod order;

pub use error::EngineError;
pub use events::{
    DepthUpdate, Liquidation, MarkPrice, MarketEvent, OpenInterest, Side, Ticker, Trade,
};
pub use order::{Fill, Liquidity, Order, OrderType, RejectReason, Rejection, TimeInForce};
