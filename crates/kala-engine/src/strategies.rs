//! # Reference Strategies
//!
//! Two small strategies that exercise the full engine surface and double as
//! usage documentation: a scheduled entry/exit cycler and a moving-average
//! cross over fixed-timeframe bars. Both trade with market orders and
//! sample an equity curve on mark-price events.

use kala_models::{MarkPrice, MarketEvent, Order, Side};

use crate::engine::{EngineContext, Strategy};

fn sample_equity(curve: &mut Vec<(i64, f64)>, symbol: &str, mp: &MarkPrice, ctx: &EngineContext) {
    if mp.symbol != symbol {
        return;
    }
    let pf = &ctx.broker.portfolio;
    let unreal = pf
        .positions
        .get(symbol)
        .filter(|p| p.qty != 0.0)
        .map(|p| p.qty * (mp.mark_price - p.avg_price))
        .unwrap_or(0.0);
    curve.push((mp.event_time_ms, pf.realized_pnl_usdt + unreal));
}

fn book_ready(ctx: &EngineContext, symbol: &str) -> bool {
    ctx.book(symbol)
        .is_some_and(|b| b.best_bid().is_some() && b.best_ask().is_some())
}

// =============================================================================
// Scheduled entry/exit
// =============================================================================

/// Enters and exits one symbol on a fixed schedule of
/// `(enter_ms, exit_ms)` cycles, with market orders.
pub struct EntryExitStrategy {
    symbol: String,
    direction: Side,
    target_qty: f64,
    schedule_ms: Vec<(i64, i64)>,
    force_close_on_end: bool,

    cycle: usize,
    in_position: bool,
    /// PnL samples `(event_time_ms, equity_usdt)`, taken on mark events.
    pub equity_curve: Vec<(i64, f64)>,
}

impl EntryExitStrategy {
    pub fn new(
        symbol: impl Into<String>,
        direction: Side,
        target_qty: f64,
        schedule_ms: Vec<(i64, i64)>,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            direction,
            target_qty,
            schedule_ms,
            force_close_on_end: true,
            cycle: 0,
            in_position: false,
            equity_curve: Vec::new(),
        }
    }

    pub fn force_close_on_end(mut self, yes: bool) -> Self {
        self.force_close_on_end = yes;
        self
    }

    fn submit_entry(&mut self, ctx: &mut EngineContext) {
        let _ = ctx.submit(Order::market(
            format!("entry_{}", self.cycle),
            self.symbol.clone(),
            self.direction,
            self.target_qty,
        ));
        // Market fills are immediate when there is depth.
        self.in_position = ctx.position_qty(&self.symbol) != 0.0;
    }

    fn submit_exit(&mut self, ctx: &mut EngineContext) {
        let pos = ctx.position_qty(&self.symbol);
        if pos == 0.0 {
            self.in_position = false;
            return;
        }
        let side = if pos > 0.0 { Side::Sell } else { Side::Buy };
        let _ = ctx.submit(Order::market(
            format!("exit_{}", self.cycle),
            self.symbol.clone(),
            side,
            pos.abs(),
        ));
        self.in_position = ctx.position_qty(&self.symbol) != 0.0;
    }
}

impl Strategy for EntryExitStrategy {
    fn name(&self) -> &str {
        "entry_exit"
    }

    fn on_event(&mut self, event: &MarketEvent, ctx: &mut EngineContext) {
        match event {
            MarketEvent::Mark(mp) => {
                sample_equity(&mut self.equity_curve, &self.symbol, mp, ctx);
            }
            MarketEvent::Depth(u) if u.symbol == self.symbol => {
                let Some(&(enter_ms, exit_ms)) = self.schedule_ms.get(self.cycle) else {
                    return;
                };
                if !book_ready(ctx, &self.symbol) {
                    return;
                }

                if !self.in_position && ctx.now_ms >= enter_ms {
                    self.submit_entry(ctx);
                } else if self.in_position && ctx.now_ms >= exit_ms {
                    self.submit_exit(ctx);
                    if !self.in_position {
                        self.cycle += 1;
                    }
                }
            }
            _ => {}
        }
    }

    fn on_end(&mut self, ctx: &mut EngineContext) {
        if self.force_close_on_end && ctx.position_qty(&self.symbol) != 0.0 {
            self.submit_exit(ctx);
        }
    }
}

// =============================================================================
// Bars + MA cross
// =============================================================================

/// Fixed-timeframe OHLC bar.
#[derive(Debug, Clone, PartialEq)]
pub struct Bar {
    pub start_ms: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

/// Builds timeframe bars from a price stream. A bar closes when the first
/// tick of the next bar arrives.
#[derive(Debug)]
pub struct BarBuilder {
    tf_ms: i64,
    fill_missing: bool,
    bar_id: Option<i64>,
    bar: Option<Bar>,
}

impl BarBuilder {
    pub fn new(tf_ms: i64, fill_missing: bool) -> Self {
        assert!(tf_ms > 0, "bar timeframe must be positive");
        Self {
            tf_ms,
            fill_missing,
            bar_id: None,
            bar: None,
        }
    }

    /// Feed one price; returns the bars this price closed (possibly several
    /// when `fill_missing` bridges a gap with flat bars).
    pub fn on_price(&mut self, t_ms: i64, price: f64) -> Vec<Bar> {
        let bid = t_ms.div_euclid(self.tf_ms);
        let mut closed = Vec::new();

        let Some(cur_id) = self.bar_id else {
            self.bar_id = Some(bid);
            self.bar = Some(Bar {
                start_ms: bid * self.tf_ms,
                open: price,
                high: price,
                low: price,
                close: price,
            });
            return closed;
        };

        let bar = self.bar.as_mut().expect("bar exists whenever bar_id does");
        if bid == cur_id {
            bar.high = bar.high.max(price);
            bar.low = bar.low.min(price);
            bar.close = price;
            return closed;
        }

        closed.push(bar.clone());

        if self.fill_missing && bid > cur_id + 1 {
            let last_close = bar.close;
            for mid in (cur_id + 1)..bid {
                closed.push(Bar {
                    start_ms: mid * self.tf_ms,
                    open: last_close,
                    high: last_close,
                    low: last_close,
                    close: last_close,
                });
            }
        }

        self.bar_id = Some(bid);
        self.bar = Some(Bar {
            start_ms: bid * self.tf_ms,
            open: price,
            high: price,
            low: price,
            close: price,
        });
        closed
    }
}

/// Which prints feed the bar stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarPriceSource {
    Mark,
    Trade,
}

/// Signal rule: trade only on a cross, or always hold the MA side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaCrossRule {
    Cross,
    State,
}

/// Moving-average cross over closed bars, targeting a fixed position size
/// via market orders.
pub struct MaCrossStrategy {
    symbol: String,
    qty: f64,
    ma_len: usize,
    rule: MaCrossRule,
    long_only: bool,
    price_source: BarPriceSource,

    builder: BarBuilder,
    closes: Vec<f64>,
    prev_diff: Option<f64>,
    order_seq: u64,
    pub equity_curve: Vec<(i64, f64)>,
}

impl MaCrossStrategy {
    pub fn new(symbol: impl Into<String>, qty: f64, tf_ms: i64, ma_len: usize) -> Self {
        assert!(qty > 0.0, "qty must be positive");
        assert!(ma_len > 0, "ma_len must be positive");
        Self {
            symbol: symbol.into(),
            qty,
            ma_len,
            rule: MaCrossRule::Cross,
            long_only: false,
            price_source: BarPriceSource::Mark,
            builder: BarBuilder::new(tf_ms, false),
            closes: Vec::new(),
            prev_diff: None,
            order_seq: 0,
            equity_curve: Vec::new(),
        }
    }

    pub fn rule(mut self, rule: MaCrossRule) -> Self {
        self.rule = rule;
        self
    }

    pub fn long_only(mut self, yes: bool) -> Self {
        self.long_only = yes;
        self
    }

    pub fn price_source(mut self, source: BarPriceSource) -> Self {
        self.price_source = source;
        self
    }

    fn set_target(&mut self, ctx: &mut EngineContext, target_qty: f64, reason: &str) {
        if !book_ready(ctx, &self.symbol) {
            return;
        }
        let delta = target_qty - ctx.position_qty(&self.symbol);
        if delta.abs() <= 1e-12 {
            return;
        }
        let side = if delta > 0.0 { Side::Buy } else { Side::Sell };
        self.order_seq += 1;
        let _ = ctx.submit(Order::market(
            format!("ma_{}_{}", reason, self.order_seq),
            self.symbol.clone(),
            side,
            delta.abs(),
        ));
    }

    fn on_closed_bar(&mut self, bar: &Bar, ctx: &mut EngineContext) {
        self.closes.push(bar.close);
        if self.closes.len() < self.ma_len {
            return;
        }

        let window = &self.closes[self.closes.len() - self.ma_len..];
        let ma = window.iter().sum::<f64>() / window.len() as f64;
        let diff = bar.close - ma;

        let desired = match self.rule {
            MaCrossRule::State => Some(if diff >= 0.0 { Side::Buy } else { Side::Sell }),
            MaCrossRule::Cross => match self.prev_diff {
                Some(prev) if prev <= 0.0 && diff > 0.0 => Some(Side::Buy),
                Some(prev) if prev >= 0.0 && diff < 0.0 => Some(Side::Sell),
                Some(_) => None,
                // First eligible bar picks a side from completed history.
                None if diff > 0.0 => Some(Side::Buy),
                None if diff < 0.0 => Some(Side::Sell),
                None => None,
            },
        };
        self.prev_diff = Some(diff);

        match desired {
            Some(Side::Buy) => self.set_target(ctx, self.qty, "long"),
            Some(Side::Sell) if self.long_only => self.set_target(ctx, 0.0, "flat"),
            Some(Side::Sell) => self.set_target(ctx, -self.qty, "short"),
            None => {}
        }
    }
}

impl Strategy for MaCrossStrategy {
    fn name(&self) -> &str {
        "ma_cross"
    }

    fn on_event(&mut self, event: &MarketEvent, ctx: &mut EngineContext) {
        if let MarketEvent::Mark(mp) = event {
            sample_equity(&mut self.equity_curve, &self.symbol, mp, ctx);
        }

        let (t_ms, price) = match (self.price_source, event) {
            (BarPriceSource::Mark, MarketEvent::Mark(mp)) if mp.symbol == self.symbol => {
                (mp.event_time_ms, mp.mark_price)
            }
            (BarPriceSource::Trade, MarketEvent::Trade(t)) if t.symbol == self.symbol => {
                (t.event_time_ms, t.price)
            }
            _ => return,
        };

        for bar in self.builder.on_price(t_ms, price) {
            self.on_closed_bar(&bar, ctx);
        }
    }

    fn on_end(&mut self, ctx: &mut EngineContext) {
        // Flat at the end regardless of rule.
        self.set_target(ctx, 0.0, "end");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bar_closes_on_first_tick_of_next_bar() {
        let mut bb = BarBuilder::new(1_000, false);
        assert!(bb.on_price(0, 10.0).is_empty());
        assert!(bb.on_price(500, 12.0).is_empty());
        assert!(bb.on_price(900, 9.0).is_empty());

        let closed = bb.on_price(1_000, 11.0);
        assert_eq!(closed.len(), 1);
        let b = &closed[0];
        assert_eq!(b.start_ms, 0);
        assert_eq!(b.open, 10.0);
        assert_eq!(b.high, 12.0);
        assert_eq!(b.low, 9.0);
        assert_eq!(b.close, 9.0);
    }

    #[test]
    fn gap_fill_repeats_last_close() {
        let mut bb = BarBuilder::new(1_000, true);
        bb.on_price(0, 10.0);
        let closed = bb.on_price(3_500, 20.0);
        // Bar 0 closes, bars 1 and 2 are flat at the last close.
        assert_eq!(closed.len(), 3);
        assert_eq!(closed[1].start_ms, 1_000);
        assert_eq!(closed[1].open, 10.0);
        assert_eq!(closed[2].close, 10.0);
    }

    #[test]
    fn no_gap_fill_without_flag() {
        let mut bb = BarBuilder::new(1_000, false);
        bb.on_price(0, 10.0);
        let closed = bb.on_price(3_500, 20.0);
        assert_eq!(closed.len(), 1);
    }
}
