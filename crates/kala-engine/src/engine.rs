//! # Backtest Engine Loop
//!
//! Drives a merged, time-ordered event stream against a strategy: discrete
//! ticks on a fixed grid, trading-window gating, broker-time ordering, event
//! dispatch, funding settlement and strict-time enforcement.
//!
//! The loop is single-threaded and cooperative: events are processed
//! sequentially, strategies run synchronously inside `on_event`/`on_tick`,
//! and the clock advances only on events and ticks. The engine instance is
//! the sole owner of broker, books and portfolio, so multiple engines can
//! run in one process without interference.

use std::collections::HashMap;

use kala_models::{
    EngineError, Liquidation, MarkPrice, MarketEvent, OpenInterest, Order, RejectReason, Ticker,
};
use serde::{Deserialize, Serialize};

use crate::book::L2Book;
use crate::broker::SimBroker;
use crate::guard::{BookGuard, BookGuardConfig};
use crate::merge::EventResult;

/// What happens to submits outside the trading window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradingWindowMode {
    /// Only position-reducing orders are allowed outside the window.
    #[default]
    EntryOnly,
    /// All submits outside the window are rejected.
    BlockAll,
}

/// When `broker.on_time` runs relative to applying each event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrokerTimeMode {
    BeforeEvent,
    /// Default: latent orders activate against the book the event produced.
    #[default]
    AfterEvent,
}

/// Engine configuration. Every default is explicit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Tick grid spacing in ms, anchored at the first observed event
    /// timestamp (not floored). 0 disables ticks.
    pub tick_interval_ms: i64,
    /// Trading window `[start_ms, end_ms)`; `None` leaves that edge open.
    pub trading_start_ms: Option<i64>,
    pub trading_end_ms: Option<i64>,
    pub trading_window_mode: TradingWindowMode,
    /// Qualifier for `EntryOnly`: when false, it degrades to `BlockAll`.
    pub allow_reducing_outside_trading_window: bool,
    pub broker_time_mode: BrokerTimeMode,
    /// Fail the run on any event-time regression.
    pub strict_event_time_monotonic: bool,
    /// Enables the book guard (on `book_guard_symbol`, or all symbols).
    pub book_guard: Option<BookGuardConfig>,
    pub book_guard_symbol: Option<String>,
    /// Emit one final grid tick after the stream ends so grid strategies
    /// can settle.
    pub emit_final_tick: bool,
    /// Progress log cadence in events.
    pub log_interval_events: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1_000,
            trading_start_ms: None,
            trading_end_ms: None,
            trading_window_mode: TradingWindowMode::EntryOnly,
            allow_reducing_outside_trading_window: true,
            broker_time_mode: BrokerTimeMode::AfterEvent,
            strict_event_time_monotonic: false,
            book_guard: None,
            book_guard_symbol: None,
            emit_final_tick: true,
            log_interval_events: 1_000_000,
        }
    }
}

/// Events processed, by type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventCounts {
    pub depth_updates: u64,
    pub trades: u64,
    pub mark_prices: u64,
    pub tickers: u64,
    pub open_interest: u64,
    pub liquidations: u64,
}

impl EventCounts {
    pub fn total(&self) -> u64 {
        self.depth_updates
            + self.trades
            + self.mark_prices
            + self.tickers
            + self.open_interest
            + self.liquidations
    }
}

/// Capability record handed to strategies.
///
/// Owns the per-symbol books (read access for strategies), the broker, the
/// optional guard, and the latched last-known snapshot maps. `submit` is the
/// trading-window/guard proxy in front of the broker.
#[derive(Debug)]
pub struct EngineContext {
    pub config: EngineConfig,
    pub now_ms: i64,
    pub books: HashMap<String, L2Book>,
    pub broker: SimBroker,
    pub guard: Option<BookGuard>,

    /// Latest snapshot per symbol.
    pub mark: HashMap<String, MarkPrice>,
    pub ticker: HashMap<String, Ticker>,
    pub open_interest: HashMap<String, OpenInterest>,
    pub liquidation: HashMap<String, Liquidation>,

    pub event_counts: EventCounts,

    /// Funding settlements already applied, per symbol.
    funding_applied_ms: HashMap<String, i64>,
}

impl EngineContext {
    fn new(config: EngineConfig, broker: SimBroker) -> Self {
        let guard = config.book_guard.clone().map(|cfg| {
            BookGuard::new(config.book_guard_symbol.clone(), cfg)
        });
        Self {
            config,
            now_ms: 0,
            books: HashMap::new(),
            broker,
            guard,
            mark: HashMap::new(),
            ticker: HashMap::new(),
            open_interest: HashMap::new(),
            liquidation: HashMap::new(),
            event_counts: EventCounts::default(),
            funding_applied_ms: HashMap::new(),
        }
    }

    pub fn book(&self, symbol: &str) -> Option<&L2Book> {
        self.books.get(symbol)
    }

    pub fn mid(&self, symbol: &str) -> Option<f64> {
        self.books.get(symbol).and_then(|b| b.mid())
    }

    pub fn position_qty(&self, symbol: &str) -> f64 {
        self.broker.portfolio.position_qty(symbol)
    }

    pub fn fills(&self) -> &[kala_models::Fill] {
        &self.broker.fills
    }

    pub fn rejections(&self) -> &[kala_models::Rejection] {
        &self.broker.rejections
    }

    /// Whether `now_ms` falls inside the `[start, end)` trading window.
    pub fn is_trading_time(&self) -> bool {
        if let Some(start) = self.config.trading_start_ms
            && self.now_ms < start
        {
            return false;
        }
        if let Some(end) = self.config.trading_end_ms
            && self.now_ms >= end
        {
            return false;
        }
        true
    }

    /// Submit an order through the trading-window and book-guard proxy.
    ///
    /// Rejections are recorded on the broker and also returned so the
    /// strategy can react inline. None of them terminate the run.
    pub fn submit(&mut self, order: Order) -> Result<(), RejectReason> {
        if !self.is_trading_time() {
            let mut mode = self.config.trading_window_mode;
            if mode == TradingWindowMode::EntryOnly
                && !self.config.allow_reducing_outside_trading_window
            {
                mode = TradingWindowMode::BlockAll;
            }
            let admitted =
                mode == TradingWindowMode::EntryOnly && self.broker.is_reducing_order(&order);
            if !admitted {
                let reason = RejectReason::OutsideTradingWindow;
                self.broker
                    .record_rejection(&order.id, &order.symbol, self.now_ms, reason.clone());
                return Err(reason);
            }
        }

        let Some(book) = self.books.get_mut(&order.symbol) else {
            let reason = RejectReason::UnknownSymbol;
            self.broker
                .record_rejection(&order.id, &order.symbol, self.now_ms, reason.clone());
            return Err(reason);
        };

        if let Some(guard) = &mut self.guard
            && let Err(why) = guard.check_submit(&order.symbol, self.now_ms, book, &mut self.broker)
        {
            let reason = RejectReason::GuardBlocked {
                reason: why.to_string(),
            };
            self.broker
                .record_rejection(&order.id, &order.symbol, self.now_ms, reason.clone());
            return Err(reason);
        }

        self.broker.submit(order, book, self.now_ms)
    }

    /// Cancel through to the broker (no window gating on cancels).
    pub fn cancel(&mut self, order_id: &str) {
        self.broker.cancel(order_id, self.now_ms);
    }

    fn broker_on_time(&mut self, now_ms: i64) {
        self.broker.on_time(now_ms, &mut self.books);
    }

    /// Funding settles at the first mark event at or after
    /// `next_funding_time_ms`, once per (symbol, funding timestamp). Applies
    /// only to the symbol whose mark arrived.
    fn apply_funding_if_due(&mut self, mp: &MarkPrice) -> f64 {
        if mp.next_funding_time_ms <= 0 || mp.event_time_ms < mp.next_funding_time_ms {
            return 0.0;
        }
        let last_applied = self
            .funding_applied_ms
            .get(&mp.symbol)
            .copied()
            .unwrap_or(i64::MIN);
        if mp.next_funding_time_ms <= last_applied {
            return 0.0;
        }
        self.funding_applied_ms
            .insert(mp.symbol.clone(), mp.next_funding_time_ms);

        let pnl = self
            .broker
            .portfolio
            .apply_funding(&mp.symbol, mp.mark_price, mp.funding_rate);
        if pnl != 0.0 {
            tracing::debug!(
                symbol = %mp.symbol,
                funding_time_ms = mp.next_funding_time_ms,
                rate = mp.funding_rate,
                pnl,
                "funding applied"
            );
        }
        pnl
    }

    fn apply_event(&mut self, event: &MarketEvent) {
        match event {
            MarketEvent::Depth(u) => {
                self.event_counts.depth_updates += 1;
                let book = self.books.entry(u.symbol.clone()).or_default();
                if let Some(guard) = &mut self.guard {
                    guard.pre_depth_update(u, book, &mut self.broker);
                }
                self.broker.on_depth_update(u, book);
                if let Some(guard) = &mut self.guard {
                    guard.post_depth_update(u, book, &mut self.broker);
                }
            }
            MarketEvent::Trade(t) => {
                self.event_counts.trades += 1;
                self.broker.on_trade(t, self.now_ms);
            }
            MarketEvent::Mark(m) => {
                self.event_counts.mark_prices += 1;
                self.mark.insert(m.symbol.clone(), m.clone());
                self.apply_funding_if_due(m);
            }
            MarketEvent::Ticker(t) => {
                self.event_counts.tickers += 1;
                self.ticker.insert(t.symbol.clone(), t.clone());
            }
            MarketEvent::OpenInterest(oi) => {
                self.event_counts.open_interest += 1;
                self.open_interest.insert(oi.symbol.clone(), oi.clone());
            }
            MarketEvent::Liquidation(l) => {
                self.event_counts.liquidations += 1;
                self.liquidation.insert(l.symbol.clone(), l.clone());
            }
        }
    }
}

/// Strategy callbacks. Every hook is optional: implement only what the
/// strategy needs.
pub trait Strategy {
    fn on_start(&mut self, _ctx: &mut EngineContext) {}

    /// Called once per event, after the event has been applied - the book
    /// already reflects it.
    fn on_event(&mut self, _event: &MarketEvent, _ctx: &mut EngineContext) {}

    /// Called on the tick grid (when `tick_interval_ms > 0`), after broker
    /// time has advanced to the tick.
    fn on_tick(&mut self, _now_ms: i64, _ctx: &mut EngineContext) {}

    fn on_end(&mut self, _ctx: &mut EngineContext) {}

    fn name(&self) -> &str {
        "unnamed_strategy"
    }
}

/// Final state of a run.
#[derive(Debug)]
pub struct BacktestResult {
    pub ctx: EngineContext,
}

/// The engine. Owns configuration; per-run state lives in `EngineContext`.
pub struct BacktestEngine {
    config: EngineConfig,
    broker: SimBroker,
}

impl BacktestEngine {
    pub fn new(config: EngineConfig, broker: SimBroker) -> Self {
        Self { config, broker }
    }

    pub fn with_default_broker(config: EngineConfig) -> Self {
        Self::new(config, SimBroker::new(Default::default()))
    }

    /// Replay `events` against `strategy`.
    ///
    /// `events` must be non-decreasing in `event_time_ms` (enforced when
    /// `strict_event_time_monotonic` is set). Adapter errors in the stream
    /// are fatal and surface here.
    pub fn run<I, S>(self, events: I, strategy: &mut S) -> Result<BacktestResult, EngineError>
    where
        I: IntoIterator<Item = EventResult>,
        S: Strategy + ?Sized,
    {
        let config = self.config.clone();
        let mut ctx = EngineContext::new(self.config, self.broker);

        tracing::info!(
            strategy = strategy.name(),
            tick_interval_ms = config.tick_interval_ms,
            broker_time_mode = ?config.broker_time_mode,
            "backtest start"
        );

        strategy.on_start(&mut ctx);

        let tick_interval = config.tick_interval_ms;
        let mut next_tick_ms: Option<i64> = None;
        let mut last_event_ms: Option<i64> = None;

        for item in events {
            let event = item?;
            let now = event.event_time_ms();

            if let Some(last) = last_event_ms
                && now < last
            {
                if config.strict_event_time_monotonic {
                    return Err(EngineError::OutOfOrderEvent {
                        event_time_ms: now,
                        last_ms: last,
                    });
                }
                tracing::warn!(event_time_ms = now, last_ms = last, "event time regressed");
            }
            last_event_ms = Some(now);

            // Drive the tick grid up to and including the current event
            // time. The anchor is the first observed event timestamp.
            if tick_interval > 0 {
                let mut tick = next_tick_ms.unwrap_or(now);
                while tick <= now {
                    ctx.now_ms = tick;
                    ctx.broker_on_time(tick);
                    strategy.on_tick(tick, &mut ctx);
                    tick += tick_interval;
                }
                next_tick_ms = Some(tick);
            }

            ctx.now_ms = now;
            if config.broker_time_mode == BrokerTimeMode::BeforeEvent {
                ctx.broker_on_time(now);
            }

            ctx.apply_event(&event);

            if config.broker_time_mode == BrokerTimeMode::AfterEvent {
                ctx.broker_on_time(now);
            }

            strategy.on_event(&event, &mut ctx);

            let total = ctx.event_counts.total();
            if config.log_interval_events > 0 && total % config.log_interval_events == 0 {
                tracing::info!(
                    events = total,
                    fills = ctx.broker.fills.len(),
                    realized_pnl = ctx.broker.portfolio.realized_pnl_usdt,
                    "replay progress"
                );
            }
        }

        // One last grid tick so strategies can settle after the stream.
        if config.emit_final_tick
            && tick_interval > 0
            && let Some(tick) = next_tick_ms
        {
            ctx.now_ms = tick;
            ctx.broker_on_time(tick);
            strategy.on_tick(tick, &mut ctx);
        }

        strategy.on_end(&mut ctx);

        tracing::info!(
            strategy = strategy.name(),
            events = ctx.event_counts.total(),
            fills = ctx.broker.fills.len(),
            rejections = ctx.broker.rejections.len(),
            realized_pnl = ctx.broker.portfolio.realized_pnl_usdt,
            fees = ctx.broker.portfolio.fees_paid_usdt,
            "backtest complete"
        );

        Ok(BacktestResult { ctx })
    }
}
