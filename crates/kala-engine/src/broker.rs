//! # Simulated Broker
//!
//! Order execution simulator with three collections: pending submits
//! (orders whose submit latency has not elapsed), active makers (resting
//! limit orders tracked by the queue model), and append-only fills.
//!
//! Taker fills walk the L2 book and apply self-impact; maker fills are
//! driven by the public trade tape through [`MakerQueueOrder`]. Submit and
//! cancel latency are modeled with due-time heaps drained by `on_time`,
//! cancels first. Non-fatal failures become [`Rejection`] records instead of
//! errors.

use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeMap, BinaryHeap, HashMap, HashSet};

use kala_models::{
    DepthUpdate, Fill, Liquidity, Order, OrderType, RejectReason, Rejection, Side, TimeInForce,
    Trade,
};
use serde::{Deserialize, Serialize};

use crate::book::{EPS_QTY, L2Book, price_key};
use crate::portfolio::Portfolio;
use crate::queue::MakerQueueOrder;

/// What to do with a post-only limit that would cross the spread.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostOnlyCrossing {
    /// Reject the order (exchange-conservative default).
    #[default]
    Reject,
    /// Re-peg the price to the same-side best and rest there.
    Reprice,
}

/// Broker simulation parameters. Every default is explicit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Maker fee as a fraction of notional (0.0002 = 2 bps).
    pub maker_fee_frac: f64,
    /// Taker fee as a fraction of notional (0.0005 = 5 bps).
    pub taker_fee_frac: f64,
    /// Delay between `submit` and activation. 0 activates inline.
    pub submit_latency_ms: i64,
    /// Delay between `cancel` and removal. 0 cancels inline.
    pub cancel_latency_ms: i64,
    /// Multiplier on the visible level quantity when initializing maker
    /// queue ahead.
    pub maker_queue_ahead_factor: f64,
    /// Constant padding added to the initial maker queue ahead.
    pub maker_queue_ahead_extra_qty: f64,
    /// Fraction of each matching trade print credited toward our queue
    /// position, in (0, 1].
    pub maker_trade_participation: f64,
    /// Marketable post-only handling.
    pub post_only_crossing: PostOnlyCrossing,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            maker_fee_frac: 0.0002,
            taker_fee_frac: 0.0005,
            submit_latency_ms: 0,
            cancel_latency_ms: 0,
            maker_queue_ahead_factor: 1.0,
            maker_queue_ahead_extra_qty: 0.0,
            maker_trade_participation: 1.0,
            post_only_crossing: PostOnlyCrossing::Reject,
        }
    }
}

/// A submit waiting out its latency.
#[derive(Debug, Clone)]
struct PendingSubmit {
    due_ms: i64,
    seq: u64,
    order: Order,
}

impl PartialEq for PendingSubmit {
    fn eq(&self, other: &Self) -> bool {
        self.due_ms == other.due_ms && self.seq == other.seq
    }
}

impl Eq for PendingSubmit {}

impl PartialOrd for PendingSubmit {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PendingSubmit {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.due_ms, self.seq).cmp(&(other.due_ms, other.seq))
    }
}

/// A cancel waiting out its latency.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PendingCancel {
    due_ms: i64,
    seq: u64,
    order_id: String,
}

impl PartialOrd for PendingCancel {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PendingCancel {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.due_ms, self.seq).cmp(&(other.due_ms, other.seq))
    }
}

/// Order execution simulator.
#[derive(Debug)]
pub struct SimBroker {
    cfg: BrokerConfig,
    pub portfolio: Portfolio,
    /// Append-only execution record.
    pub fills: Vec<Fill>,
    /// Append-only rejection record (reported back to the strategy).
    pub rejections: Vec<Rejection>,

    makers: HashMap<String, MakerQueueOrder>,
    /// (symbol, side) -> price_key -> order ids in arrival order.
    level_index: HashMap<(String, Side), BTreeMap<i64, Vec<String>>>,

    pending_submits: BinaryHeap<Reverse<PendingSubmit>>,
    pending_cancels: BinaryHeap<Reverse<PendingCancel>>,
    /// Lazy cancellation watermarks: a pending submit whose sequence is at
    /// or below the relevant cutoff never activates.
    cancel_cutoff_by_id: HashMap<String, u64>,
    cancel_cutoff_by_symbol: HashMap<String, u64>,

    used_order_ids: HashSet<String>,
    seq: u64,
    maker_seq: u64,
}

impl SimBroker {
    pub fn new(cfg: BrokerConfig) -> Self {
        Self {
            cfg,
            portfolio: Portfolio::new(),
            fills: Vec::new(),
            rejections: Vec::new(),
            makers: HashMap::new(),
            level_index: HashMap::new(),
            pending_submits: BinaryHeap::new(),
            pending_cancels: BinaryHeap::new(),
            cancel_cutoff_by_id: HashMap::new(),
            cancel_cutoff_by_symbol: HashMap::new(),
            used_order_ids: HashSet::new(),
            seq: 0,
            maker_seq: 0,
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.cfg
    }

    // -------------------------------------------------------------------------
    // Submit / cancel
    // -------------------------------------------------------------------------

    /// Submit an order.
    ///
    /// Synchronous validation failures (duplicate id, bad quantity,
    /// market+post_only, limit without price) are recorded and returned as
    /// `Err`. A valid order is accepted for processing: with
    /// `submit_latency_ms > 0` it activates later via `on_time`, otherwise
    /// it activates inline. Activation-time failures (FOK shortfall,
    /// reduce-only violation, post-only cross) are recorded as rejections
    /// but do not fail the submit call.
    pub fn submit(
        &mut self,
        order: Order,
        book: &mut L2Book,
        now_ms: i64,
    ) -> Result<(), RejectReason> {
        if let Some(detail) = self.validate(&order) {
            let reason = RejectReason::InvalidOrder { detail };
            self.record_rejection(&order.id, &order.symbol, now_ms, reason.clone());
            return Err(reason);
        }

        self.used_order_ids.insert(order.id.clone());

        if self.cfg.submit_latency_ms > 0 {
            self.seq += 1;
            self.pending_submits.push(Reverse(PendingSubmit {
                due_ms: now_ms + self.cfg.submit_latency_ms,
                seq: self.seq,
                order,
            }));
        } else {
            self.activate(order, book, now_ms);
        }
        Ok(())
    }

    /// Cancel an order by id. Idempotent: cancelling an unknown or already
    /// completed id is a no-op success. With `cancel_latency_ms > 0` the
    /// cancellation applies later via `on_time`.
    pub fn cancel(&mut self, order_id: &str, now_ms: i64) {
        if self.cfg.cancel_latency_ms > 0 {
            self.seq += 1;
            self.pending_cancels.push(Reverse(PendingCancel {
                due_ms: now_ms + self.cfg.cancel_latency_ms,
                seq: self.seq,
                order_id: order_id.to_string(),
            }));
        } else {
            self.cancel_now(order_id);
        }
    }

    /// Advance broker time: apply due cancels first (conservative when a
    /// cancel and a submit become due together), then activate due submits
    /// in (due, insertion) order.
    pub fn on_time(&mut self, now_ms: i64, books: &mut HashMap<String, L2Book>) {
        while self
            .pending_cancels
            .peek()
            .is_some_and(|Reverse(pc)| pc.due_ms <= now_ms)
        {
            let Reverse(pc) = self.pending_cancels.pop().expect("peeked non-empty");
            self.cancel_now(&pc.order_id);
        }

        while self
            .pending_submits
            .peek()
            .is_some_and(|Reverse(ps)| ps.due_ms <= now_ms)
        {
            let Reverse(ps) = self.pending_submits.pop().expect("peeked non-empty");
            if self.submit_is_cancelled(&ps) {
                continue;
            }
            match books.get_mut(&ps.order.symbol) {
                Some(book) => self.activate(ps.order, book, now_ms),
                None => {
                    let (id, symbol) = (ps.order.id.clone(), ps.order.symbol.clone());
                    self.record_rejection(&id, &symbol, now_ms, RejectReason::UnknownSymbol);
                }
            }
        }
    }

    /// Cancel broker state tied to one symbol. Used by the book guard:
    /// pending submits for the symbol are invalidated so they never fire
    /// after a cooldown; active makers go too only when asked.
    pub fn cancel_symbol_orders(
        &mut self,
        symbol: &str,
        cancel_active_makers: bool,
        cancel_pending_submits: bool,
    ) {
        if cancel_active_makers {
            let ids: Vec<String> = self
                .makers
                .values()
                .filter(|mo| mo.symbol == symbol)
                .map(|mo| mo.order_id.clone())
                .collect();
            for id in ids {
                self.cancel_now(&id);
            }
        }
        if cancel_pending_submits {
            let cutoff = self.cancel_cutoff_by_symbol.entry(symbol.to_string()).or_insert(0);
            *cutoff = (*cutoff).max(self.seq);
        }
    }

    // -------------------------------------------------------------------------
    // Market-data hooks
    // -------------------------------------------------------------------------

    /// Apply a depth delta to the book, then refresh maker queue estimates
    /// for the touched levels on the matching side. Depth never fills
    /// makers.
    pub fn on_depth_update(&mut self, update: &DepthUpdate, book: &mut L2Book) {
        book.apply_update(update);

        for &(price, qty) in &update.bid_updates {
            self.refresh_level(&update.symbol, Side::Buy, price, qty);
        }
        for &(price, qty) in &update.ask_updates {
            self.refresh_level(&update.symbol, Side::Sell, price, qty);
        }
    }

    /// Progress maker queues from one trade print.
    ///
    /// A downtick (`is_buyer_maker`) ages resting buys at or above the trade
    /// price; an uptick ages resting sells at or below it. Better-priced
    /// orders consume the shared trade budget first, then arrival order
    /// within a level.
    pub fn on_trade(&mut self, trade: &Trade, now_ms: i64) {
        let maker_side = if trade.is_buyer_maker { Side::Buy } else { Side::Sell };
        let key = (trade.symbol.clone(), maker_side);
        let Some(ladder) = self.level_index.get(&key) else {
            return;
        };

        let tkey = price_key(trade.price);
        let candidate_ids: Vec<String> = match maker_side {
            // Buy makers with limit >= trade price, best (highest) first.
            Side::Buy => ladder
                .range(tkey..)
                .rev()
                .flat_map(|(_, ids)| ids.iter().cloned())
                .collect(),
            // Sell makers with limit <= trade price, best (lowest) first.
            Side::Sell => ladder
                .range(..=tkey)
                .flat_map(|(_, ids)| ids.iter().cloned())
                .collect(),
        };
        if candidate_ids.is_empty() {
            return;
        }

        let participation = self.cfg.maker_trade_participation;
        let mut remaining_budget = trade.quantity;
        let mut completed: Vec<String> = Vec::new();

        for order_id in candidate_ids {
            if remaining_budget <= 0.0 {
                break;
            }
            let Some(mo) = self.makers.get_mut(&order_id) else {
                continue;
            };

            let (fill_qty, consumed) = mo.on_trade_budgeted(trade, participation, remaining_budget);
            remaining_budget = (remaining_budget - consumed).max(0.0);

            if fill_qty > 0.0 {
                // Maker fills execute at exactly the resting limit price.
                let price = mo.limit_price;
                let (symbol, side) = (mo.symbol.clone(), mo.side);
                let filled_out = mo.is_filled();
                let fee = fill_qty * price * self.cfg.maker_fee_frac;
                self.portfolio.apply_fill(&symbol, side, fill_qty, price, fee);
                self.fills.push(Fill {
                    order_id: order_id.clone(),
                    symbol,
                    side,
                    price,
                    quantity: fill_qty,
                    fee_usdt: fee,
                    liquidity: Liquidity::Maker,
                    event_time_ms: now_ms,
                });
                tracing::debug!(
                    order_id = %order_id,
                    price,
                    qty = fill_qty,
                    fee,
                    "maker fill"
                );
                if filled_out {
                    completed.push(order_id);
                }
            }
        }

        for order_id in completed {
            self.makers.remove(&order_id);
            self.remove_from_level_index(&order_id);
        }
    }

    // -------------------------------------------------------------------------
    // Introspection
    // -------------------------------------------------------------------------

    pub fn maker_order(&self, order_id: &str) -> Option<&MakerQueueOrder> {
        self.makers.get(order_id)
    }

    pub fn active_maker_count(&self) -> usize {
        self.makers.len()
    }

    /// Whether any pending submits remain that have not been lazily
    /// cancelled, optionally filtered by symbol.
    pub fn has_pending_orders(&self, symbol: Option<&str>) -> bool {
        self.pending_submits.iter().any(|Reverse(ps)| {
            symbol.is_none_or(|s| ps.order.symbol == s) && !self.submit_is_cancelled(ps)
        })
    }

    pub fn has_open_orders(&self) -> bool {
        !self.makers.is_empty() || self.has_pending_orders(None)
    }

    pub fn record_rejection(
        &mut self,
        order_id: &str,
        symbol: &str,
        now_ms: i64,
        reason: RejectReason,
    ) {
        tracing::debug!(order_id, symbol, %reason, "order rejected");
        self.rejections.push(Rejection {
            order_id: order_id.to_string(),
            symbol: symbol.to_string(),
            event_time_ms: now_ms,
            reason,
        });
    }

    /// Whether an order would reduce the current absolute position.
    pub fn is_reducing_order(&self, order: &Order) -> bool {
        let pos = self.portfolio.position_qty(&order.symbol);
        if pos == 0.0 || order.quantity <= 0.0 {
            return false;
        }
        let opposite = (pos > 0.0 && order.side == Side::Sell)
            || (pos < 0.0 && order.side == Side::Buy);
        opposite && order.quantity <= pos.abs() + 1e-12
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn validate(&self, order: &Order) -> Option<String> {
        if order.id.is_empty() {
            return Some("order id must be non-empty".to_string());
        }
        if self.used_order_ids.contains(&order.id) {
            return Some(format!("duplicate order id: {}", order.id));
        }
        if !(order.quantity.is_finite() && order.quantity > 0.0) {
            return Some("quantity must be positive and finite".to_string());
        }
        match order.order_type {
            OrderType::Market => {
                if order.post_only {
                    return Some("market order cannot be post-only".to_string());
                }
            }
            OrderType::Limit => match order.limit_price {
                None => return Some("limit order requires a limit price".to_string()),
                Some(px) if !(px.is_finite() && px > 0.0) => {
                    return Some("limit price must be positive and finite".to_string());
                }
                _ => {}
            },
        }
        None
    }

    fn submit_is_cancelled(&self, ps: &PendingSubmit) -> bool {
        let by_id = self
            .cancel_cutoff_by_id
            .get(&ps.order.id)
            .copied()
            .unwrap_or(0);
        let by_symbol = self
            .cancel_cutoff_by_symbol
            .get(&ps.order.symbol)
            .copied()
            .unwrap_or(0);
        ps.seq <= by_id.max(by_symbol)
    }

    fn activate(&mut self, order: Order, book: &mut L2Book, now_ms: i64) {
        if order.reduce_only && !self.is_reducing_order(&order) {
            self.record_rejection(
                &order.id,
                &order.symbol,
                now_ms,
                RejectReason::InvalidOrder {
                    detail: "reduce-only order would increase absolute position".to_string(),
                },
            );
            return;
        }

        let limit_px = match order.order_type {
            OrderType::Market => {
                self.fill_taker(&order, book, now_ms, None);
                return;
            }
            OrderType::Limit => order.limit_price.expect("validated at submit"),
        };

        // Buy crosses if it reaches the ask; sell crosses if it reaches the
        // bid.
        let crosses = match order.side {
            Side::Buy => book.best_ask().is_some_and(|ask| limit_px >= ask),
            Side::Sell => book.best_bid().is_some_and(|bid| limit_px <= bid),
        };

        if order.post_only && crosses {
            match self.cfg.post_only_crossing {
                PostOnlyCrossing::Reject => {
                    self.record_rejection(
                        &order.id,
                        &order.symbol,
                        now_ms,
                        RejectReason::InvalidOrder {
                            detail: "post-only limit would cross the spread".to_string(),
                        },
                    );
                }
                PostOnlyCrossing::Reprice => {
                    let peg = match order.side {
                        Side::Buy => book.best_bid(),
                        Side::Sell => book.best_ask(),
                    };
                    match peg {
                        Some(px) => self.open_maker(&order, px, order.quantity, book),
                        None => self.record_rejection(
                            &order.id,
                            &order.symbol,
                            now_ms,
                            RejectReason::InvalidOrder {
                                detail: "post-only reprice has no same-side reference".to_string(),
                            },
                        ),
                    }
                }
            }
            return;
        }

        match order.time_in_force {
            TimeInForce::Fok => {
                // All-or-nothing: probe without touching the book first.
                let available = book
                    .simulate_taker_fill(order.side, order.quantity, Some(limit_px))
                    .map(|(_, qty)| qty)
                    .unwrap_or(0.0);
                if available + EPS_QTY < order.quantity {
                    self.record_rejection(
                        &order.id,
                        &order.symbol,
                        now_ms,
                        RejectReason::InsufficientLiquidity,
                    );
                } else {
                    self.fill_taker(&order, book, now_ms, Some(limit_px));
                }
            }
            TimeInForce::Ioc => {
                // Taker up to the limit; any residue is cancelled.
                self.fill_taker(&order, book, now_ms, Some(limit_px));
            }
            TimeInForce::Gtc => {
                if crosses {
                    let filled = self.fill_taker(&order, book, now_ms, Some(limit_px));
                    let remaining = order.quantity - filled;
                    if remaining > EPS_QTY {
                        // Unfilled portion of a crossing limit rests on the
                        // book, as on a real exchange.
                        self.open_maker(&order, limit_px, remaining, book);
                    }
                } else {
                    self.open_maker(&order, limit_px, order.quantity, book);
                }
            }
        }
    }

    fn fill_taker(
        &mut self,
        order: &Order,
        book: &mut L2Book,
        now_ms: i64,
        limit_price: Option<f64>,
    ) -> f64 {
        let Some((avg_px, filled)) = book.consume_taker_fill(order.side, order.quantity, limit_price)
        else {
            return 0.0;
        };

        let fee = filled * avg_px * self.cfg.taker_fee_frac;
        self.portfolio
            .apply_fill(&order.symbol, order.side, filled, avg_px, fee);
        self.fills.push(Fill {
            order_id: order.id.clone(),
            symbol: order.symbol.clone(),
            side: order.side,
            price: avg_px,
            quantity: filled,
            fee_usdt: fee,
            liquidity: Liquidity::Taker,
            event_time_ms: now_ms,
        });
        tracing::debug!(
            order_id = %order.id,
            side = %order.side,
            avg_px,
            qty = filled,
            fee,
            "taker fill"
        );
        filled
    }

    fn open_maker(&mut self, order: &Order, price: f64, qty: f64, book: &L2Book) {
        let visible = book.level_qty(order.side, price);
        let queue_ahead =
            visible * self.cfg.maker_queue_ahead_factor + self.cfg.maker_queue_ahead_extra_qty;

        let mo = MakerQueueOrder::new(
            order.id.clone(),
            order.symbol.clone(),
            order.side,
            price,
            qty,
            queue_ahead,
            self.maker_seq,
        );
        self.maker_seq += 1;

        self.level_index
            .entry((order.symbol.clone(), order.side))
            .or_default()
            .entry(price_key(price))
            .or_default()
            .push(order.id.clone());
        self.makers.insert(order.id.clone(), mo);
    }

    fn refresh_level(&mut self, symbol: &str, side: Side, price: f64, new_qty: f64) {
        let Some(ladder) = self.level_index.get(&(symbol.to_string(), side)) else {
            return;
        };
        let Some(ids) = ladder.get(&price_key(price)) else {
            return;
        };
        let ids: Vec<String> = ids.clone();
        for id in ids {
            if let Some(mo) = self.makers.get_mut(&id) {
                mo.on_book_qty_update(new_qty);
            }
        }
    }

    fn cancel_now(&mut self, order_id: &str) {
        if self.makers.remove(order_id).is_some() {
            self.remove_from_level_index(order_id);
        }
        // Lazily invalidate any not-yet-activated submit with this id.
        let cutoff = self
            .cancel_cutoff_by_id
            .entry(order_id.to_string())
            .or_insert(0);
        *cutoff = (*cutoff).max(self.seq);
    }

    fn remove_from_level_index(&mut self, order_id: &str) {
        for ladder in self.level_index.values_mut() {
            ladder.retain(|_, ids| {
                ids.retain(|id| id != order_id);
                !ids.is_empty()
            });
        }
        self.level_index.retain(|_, ladder| !ladder.is_empty());
    }
}
