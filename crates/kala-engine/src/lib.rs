//! # Kala Engine
//!
//! Event-driven market-data backtest engine for crypto perpetual futures.
//! Replays a merged, time-ordered stream of L2 depth deltas, trades and
//! mark-price/funding snapshots against a user strategy, simulating order
//! submission, fills, fees, PnL and funding settlement.
//!
//! ## Subsystems
//! - [`merge`] - k-way merge of per-source iterators with deterministic
//!   tie-breaks, plus time-window slicing.
//! - [`book`] - in-memory L2 ladders updated by sparse deltas; best/mid,
//!   impact VWAP, taker walk with self-impact.
//! - [`broker`] - simulated broker: taker fills via book consumption, maker
//!   fills via a queue-ahead model driven by the trade tape, submit/cancel
//!   latency, rejection records.
//! - [`engine`] - the discrete-tick loop: trading-window gating, event
//!   dispatch, funding application, strict-time enforcement.
//! - [`guard`] - runtime book sanity filter (spread/staleness/cross/
//!   sequence) with cooldown and warmup.
//! - [`replay`] - JSONL segment adapter producing the merged stream.
//! - [`report`] - round trips, drawdown and summaries over the fill record.
//! - [`strategies`] - reference strategies used by the integration tests.
//!
//! ## Example
//! ```no_run
//! use kala_engine::engine::{BacktestEngine, EngineConfig};
//! use kala_engine::replay::{SegmentReplayConfig, open_segment};
//! use kala_engine::strategies::MaCrossStrategy;
//!
//! # fn main() -> anyhow::Result<()> {
//! let events = open_segment(
//!     std::path::Path::new("data/segments/btc_20260801"),
//!     &SegmentReplayConfig::default(),
//! )?;
//! let mut strategy = MaCrossStrategy::new("BTCUSDT", 0.5, 300_000, 9);
//! let result = BacktestEngine::with_default_broker(EngineConfig::default())
//!     .run(events, &mut strategy)?;
//! println!("realized: {:.2}", result.ctx.broker.portfolio.realized_pnl_usdt);
//! # Ok(())
//! # }
//! ```
//!
//! The engine is single-threaded; it installs no logging subscriber and
//! keeps no state across runs.

pub mod book;
pub mod broker;
pub mod engine;
pub mod guard;
pub mod merge;
pub mod portfolio;
pub mod queue;
pub mod replay;
pub mod report;
pub mod strategies;

pub use book::L2Book;
pub use broker::{BrokerConfig, PostOnlyCrossing, SimBroker};
pub use engine::{
    BacktestEngine, BacktestResult, BrokerTimeMode, EngineConfig, EngineContext, EventCounts,
    Strategy, TradingWindowMode,
};
pub use guard::{BookGuard, BookGuardConfig, BookGuardStats};
pub use merge::{MergedEventStream, merge_event_streams, slice_event_stream};
pub use portfolio::{Portfolio, Position};
pub use replay::{SegmentReplayConfig, SortMode, open_segment};

pub use kala_models as models;
