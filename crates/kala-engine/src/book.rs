//! # L2 Order Book
//!
//! In-memory bid/ask price ladders updated by sparse depth deltas, plus the
//! derived queries the broker and strategies need: best bid/ask, mid,
//! impact VWAP, and the taker walk (with and without self-impact).
//!
//! Ladders are `BTreeMap`s keyed by a normalized integer price key so float
//! prices index deterministically; bids iterate descending, asks ascending.
//! Stored quantities are strictly positive - a delta with `qty == 0` removes
//! its level.

use std::collections::BTreeMap;

use kala_models::{DepthUpdate, Side};

/// Fixed-point scale for normalizing float prices into ladder keys.
const PRICE_KEY_SCALE: f64 = 1e9;

/// Quantities at or below this are treated as zero when consuming levels.
pub const EPS_QTY: f64 = 1e-12;

/// Normalize a float price into a deterministic integer ladder key.
#[inline]
pub fn price_key(price: f64) -> i64 {
    (price * PRICE_KEY_SCALE).round() as i64
}

#[inline]
fn key_price(key: i64) -> f64 {
    key as f64 / PRICE_KEY_SCALE
}

/// Per-symbol aggregated L2 book.
#[derive(Debug, Clone, Default)]
pub struct L2Book {
    /// price_key -> qty, best bid = highest key.
    bids: BTreeMap<i64, f64>,
    /// price_key -> qty, best ask = lowest key.
    asks: BTreeMap<i64, f64>,
    /// `final_update_id` of the last applied delta, if any.
    pub last_update_id: Option<i64>,
    /// `event_time_ms` of the last applied delta, if any.
    pub last_event_time_ms: Option<i64>,
}

impl L2Book {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one sparse delta: `qty > 0` sets the level, otherwise removes
    /// it. Application order within a single update does not affect the
    /// resulting state.
    pub fn apply_depth_update(&mut self, bid_updates: &[(f64, f64)], ask_updates: &[(f64, f64)]) {
        for &(price, qty) in bid_updates {
            self.apply_level(Side::Buy, price, qty);
        }
        for &(price, qty) in ask_updates {
            self.apply_level(Side::Sell, price, qty);
        }
    }

    /// Apply a full `DepthUpdate` event, tracking sequence/time bookkeeping.
    pub fn apply_update(&mut self, update: &DepthUpdate) {
        self.apply_depth_update(&update.bid_updates, &update.ask_updates);
        self.last_update_id = Some(update.final_update_id);
        self.last_event_time_ms = Some(update.event_time_ms);
    }

    /// Set or remove a single level. `side` is the book side the level lives
    /// on (`Buy` = bids, `Sell` = asks).
    pub fn apply_level(&mut self, side: Side, price: f64, qty: f64) {
        let ladder = match side {
            Side::Buy => &mut self.bids,
            Side::Sell => &mut self.asks,
        };
        let key = price_key(price);
        if qty > 0.0 {
            ladder.insert(key, qty);
        } else {
            ladder.remove(&key);
        }
    }

    pub fn best_bid(&self) -> Option<f64> {
        self.bids.iter().next_back().map(|(&k, _)| key_price(k))
    }

    pub fn best_ask(&self) -> Option<f64> {
        self.asks.iter().next().map(|(&k, _)| key_price(k))
    }

    pub fn best_bid_qty(&self) -> Option<f64> {
        self.bids.iter().next_back().map(|(_, &q)| q)
    }

    pub fn best_ask_qty(&self) -> Option<f64> {
        self.asks.iter().next().map(|(_, &q)| q)
    }

    /// Mid price; defined only when both sides exist.
    pub fn mid(&self) -> Option<f64> {
        match (self.best_bid(), self.best_ask()) {
            (Some(b), Some(a)) => Some((b + a) / 2.0),
            _ => None,
        }
    }

    pub fn spread(&self) -> Option<f64> {
        match (self.best_bid(), self.best_ask()) {
            (Some(b), Some(a)) => Some(a - b),
            _ => None,
        }
    }

    /// A book is crossed iff best_bid >= best_ask. Detected, never
    /// auto-corrected here; the book guard decides what to do.
    pub fn is_crossed(&self) -> bool {
        match (self.best_bid(), self.best_ask()) {
            (Some(b), Some(a)) => b >= a,
            _ => false,
        }
    }

    /// Visible quantity at an exact price on one side (0.0 if absent).
    pub fn level_qty(&self, side: Side, price: f64) -> f64 {
        let ladder = match side {
            Side::Buy => &self.bids,
            Side::Sell => &self.asks,
        };
        ladder.get(&price_key(price)).copied().unwrap_or(0.0)
    }

    pub fn bid_levels(&self) -> usize {
        self.bids.len()
    }

    pub fn ask_levels(&self) -> usize {
        self.asks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }

    /// Drop all levels (book guard reset path). Sequence bookkeeping is
    /// cleared too so a rebuild starts from a clean slate.
    pub fn clear(&mut self) {
        self.bids.clear();
        self.asks.clear();
        self.last_update_id = None;
        self.last_event_time_ms = None;
    }

    /// Iterate bids best-first as `(price, qty)`.
    pub fn iter_bids(&self) -> impl Iterator<Item = (f64, f64)> + '_ {
        self.bids.iter().rev().map(|(&k, &q)| (key_price(k), q))
    }

    /// Iterate asks best-first as `(price, qty)`.
    pub fn iter_asks(&self) -> impl Iterator<Item = (f64, f64)> + '_ {
        self.asks.iter().map(|(&k, &q)| (key_price(k), q))
    }

    // -------------------------------------------------------------------------
    // Impact VWAP
    // -------------------------------------------------------------------------

    /// Volume-weighted price to execute `target_notional` (quote units)
    /// against current depth.
    ///
    /// A buy walks asks ascending, a sell walks bids descending,
    /// accumulating `price * qty` until the target is reached (the boundary
    /// level is taken fractionally). Returns `(vwap, filled_notional)`, or
    /// `None` when the walked depth cannot cover the target.
    ///
    /// When `max_levels` limits the walk and comes up short, the walk is
    /// retried against the full book before declaring the target
    /// unreachable. `eps_notional` absorbs float residue on the boundary.
    pub fn impact_vwap(
        &self,
        side: Side,
        target_notional: f64,
        max_levels: Option<usize>,
        eps_notional: f64,
    ) -> Option<(f64, f64)> {
        if target_notional <= 0.0 {
            return None;
        }

        match self.impact_vwap_walk(side, target_notional, max_levels, eps_notional) {
            Some(out) => Some(out),
            None if max_levels.is_some() => {
                self.impact_vwap_walk(side, target_notional, None, eps_notional)
            }
            None => None,
        }
    }

    fn impact_vwap_walk(
        &self,
        side: Side,
        target_notional: f64,
        max_levels: Option<usize>,
        eps_notional: f64,
    ) -> Option<(f64, f64)> {
        let levels: Box<dyn Iterator<Item = (f64, f64)>> = match side {
            Side::Buy => Box::new(self.iter_asks()),
            Side::Sell => Box::new(self.iter_bids()),
        };

        let mut notional = 0.0_f64;
        let mut qty = 0.0_f64;

        for (walked, (price, level_qty)) in levels.enumerate() {
            if let Some(limit) = max_levels
                && walked >= limit
            {
                break;
            }

            let remaining = target_notional - notional;
            if remaining <= eps_notional {
                break;
            }

            let level_notional = price * level_qty;
            if level_notional >= remaining {
                // Boundary level: take just enough quantity to hit target.
                qty += remaining / price;
                notional = target_notional;
                break;
            }
            notional += level_notional;
            qty += level_qty;
        }

        if notional + eps_notional < target_notional || qty <= 0.0 {
            return None;
        }
        Some((notional / qty, notional))
    }

    // -------------------------------------------------------------------------
    // Taker walk
    // -------------------------------------------------------------------------

    /// Simulate a taker fill without touching the book.
    ///
    /// A buy consumes asks from low to high, a sell consumes bids from high
    /// to low. With `limit_price` the walk never crosses it (IOC-like).
    /// Returns `(avg_price, filled_qty)`, or `None` when nothing fills.
    pub fn simulate_taker_fill(
        &self,
        side: Side,
        quantity: f64,
        limit_price: Option<f64>,
    ) -> Option<(f64, f64)> {
        if quantity <= 0.0 {
            return None;
        }

        let levels: Box<dyn Iterator<Item = (f64, f64)>> = match side {
            Side::Buy => Box::new(self.iter_asks()),
            Side::Sell => Box::new(self.iter_bids()),
        };

        let mut remaining = quantity;
        let mut filled = 0.0_f64;
        let mut cost = 0.0_f64;

        for (price, level_qty) in levels {
            if remaining <= 0.0 || crosses_limit(side, price, limit_price) {
                break;
            }
            let take = level_qty.min(remaining);
            filled += take;
            cost += take * price;
            remaining -= take;
        }

        if filled <= 0.0 {
            return None;
        }
        Some((cost / filled, filled))
    }

    /// Same walk as [`simulate_taker_fill`], but decrements consumed levels
    /// in place so subsequent fills in the run see the depleted book
    /// (self-impact). Levels that fall to `<= EPS_QTY` are removed.
    ///
    /// [`simulate_taker_fill`]: L2Book::simulate_taker_fill
    pub fn consume_taker_fill(
        &mut self,
        side: Side,
        quantity: f64,
        limit_price: Option<f64>,
    ) -> Option<(f64, f64)> {
        if quantity <= 0.0 {
            return None;
        }

        let opposite: Side = side.flip();
        let mut remaining = quantity;
        let mut filled = 0.0_f64;
        let mut cost = 0.0_f64;

        while remaining > 0.0 {
            let best = match side {
                Side::Buy => self.best_ask(),
                Side::Sell => self.best_bid(),
            };
            let Some(price) = best else { break };
            if crosses_limit(side, price, limit_price) {
                break;
            }

            let level_qty = self.level_qty(opposite, price);
            if level_qty <= EPS_QTY {
                self.apply_level(opposite, price, 0.0);
                continue;
            }

            let take = level_qty.min(remaining);
            filled += take;
            cost += take * price;
            remaining -= take;

            let new_qty = level_qty - take;
            if new_qty <= EPS_QTY {
                self.apply_level(opposite, price, 0.0);
            } else {
                self.apply_level(opposite, price, new_qty);
            }
        }

        if filled <= 0.0 {
            return None;
        }
        Some((cost / filled, filled))
    }
}

#[inline]
fn crosses_limit(side: Side, price: f64, limit_price: Option<f64>) -> bool {
    match (side, limit_price) {
        (Side::Buy, Some(limit)) => price > limit,
        (Side::Sell, Some(limit)) => price < limit,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn book(bids: &[(f64, f64)], asks: &[(f64, f64)]) -> L2Book {
        let mut b = L2Book::new();
        b.apply_depth_update(bids, asks);
        b
    }

    #[test]
    fn best_bid_ask_and_mid() {
        let b = book(&[(100.0, 1.0)], &[(101.0, 2.0)]);
        assert_eq!(b.best_bid(), Some(100.0));
        assert_eq!(b.best_ask(), Some(101.0));
        assert_eq!(b.mid(), Some(100.5));
        assert_eq!(b.spread(), Some(1.0));
        assert!(!b.is_crossed());
    }

    #[test]
    fn zero_qty_removes_level() {
        let mut b = book(&[(100.0, 2.0)], &[(101.0, 3.0)]);
        b.apply_depth_update(&[(100.0, 0.0)], &[]);
        assert_eq!(b.best_bid(), None);
        assert_eq!(b.best_ask(), Some(101.0));
        assert_eq!(b.bid_levels(), 0);
        assert!(b.mid().is_none());
    }

    #[test]
    fn crossed_book_is_detected_not_corrected() {
        let b = book(&[(101.0, 1.0)], &[(100.0, 1.0)]);
        assert!(b.is_crossed());
        assert_eq!(b.best_bid(), Some(101.0));
        assert_eq!(b.best_ask(), Some(100.0));
    }

    #[test]
    fn impact_vwap_partial_boundary_level() {
        // Asks: 1 @ 100, 1 @ 101. Buy notional 150 => 1 @ 100 + 50/101 @ 101.
        let b = book(&[], &[(100.0, 1.0), (101.0, 1.0)]);
        let (vwap, notional) = b.impact_vwap(Side::Buy, 150.0, Some(10), 1e-9).unwrap();
        let expected = 150.0 / (1.0 + 50.0 / 101.0);
        assert!((vwap - expected).abs() < 1e-9);
        assert!((notional - 150.0).abs() < 1e-9);
    }

    #[test]
    fn impact_vwap_insufficient_depth_is_undefined() {
        let b = book(&[], &[(100.0, 0.5)]);
        assert!(b.impact_vwap(Side::Buy, 100.0, Some(10), 1e-9).is_none());
    }

    #[test]
    fn impact_vwap_retries_with_full_book_when_max_levels_limits() {
        let b = book(&[], &[(100.0, 1.0), (101.0, 1.0), (102.0, 1.0)]);
        // One level is not enough for 150 notional, full depth is.
        let (vwap, _) = b.impact_vwap(Side::Buy, 150.0, Some(1), 1e-9).unwrap();
        let expected = 150.0 / (1.0 + 50.0 / 101.0);
        assert!((vwap - expected).abs() < 1e-9);
    }

    #[test]
    fn impact_vwap_is_stable_in_max_levels_beyond_sufficient_depth() {
        let b = book(&[], &[(100.0, 1.0), (101.0, 1.0), (102.0, 1.0)]);
        let a = b.impact_vwap(Side::Buy, 150.0, Some(2), 1e-9).unwrap();
        let c = b.impact_vwap(Side::Buy, 150.0, Some(100), 1e-9).unwrap();
        let d = b.impact_vwap(Side::Buy, 150.0, None, 1e-9).unwrap();
        assert_eq!(a, c);
        assert_eq!(c, d);
    }

    #[test]
    fn impact_vwap_sell_walks_bids_descending() {
        let b = book(&[(100.0, 1.0), (99.0, 2.0)], &[]);
        let (vwap, notional) = b.impact_vwap(Side::Sell, 150.0, None, 1e-9).unwrap();
        // 1 @ 100 + 50/99 @ 99.
        let expected = 150.0 / (1.0 + 50.0 / 99.0);
        assert!((vwap - expected).abs() < 1e-9);
        assert!((notional - 150.0).abs() < 1e-9);
    }

    #[test]
    fn simulate_taker_fill_walks_asks_for_buys() {
        let b = book(&[(99.0, 1.0)], &[(100.0, 1.0), (101.0, 1.0)]);
        let (avg, qty) = b.simulate_taker_fill(Side::Buy, 1.5, None).unwrap();
        assert!((qty - 1.5).abs() < 1e-12);
        assert!((avg - (100.0 + 101.0 * 0.5) / 1.5).abs() < 1e-12);
        // Simulation leaves the book untouched.
        assert_eq!(b.level_qty(Side::Sell, 100.0), 1.0);
    }

    #[test]
    fn simulate_taker_fill_respects_limit_price() {
        let b = book(&[], &[(100.0, 1.0), (101.0, 1.0)]);
        let (avg, qty) = b.simulate_taker_fill(Side::Buy, 2.0, Some(100.0)).unwrap();
        assert_eq!(qty, 1.0);
        assert_eq!(avg, 100.0);
    }

    #[test]
    fn consume_taker_fill_applies_self_impact() {
        let mut b = book(&[], &[(101.0, 1.0), (102.0, 5.0)]);
        let (avg, qty) = b.consume_taker_fill(Side::Buy, 3.0, None).unwrap();
        assert!((qty - 3.0).abs() < 1e-12);
        assert!((avg - (101.0 + 102.0 * 2.0) / 3.0).abs() < 1e-9);
        // 101 level fully consumed, 102 level reduced to 3.
        assert_eq!(b.best_ask(), Some(102.0));
        assert!((b.level_qty(Side::Sell, 102.0) - 3.0).abs() < 1e-12);
    }

    #[test]
    fn consume_taker_fill_partial_when_book_runs_out() {
        let mut b = book(&[(100.0, 1.0)], &[]);
        let (avg, qty) = b.consume_taker_fill(Side::Sell, 2.5, None).unwrap();
        assert_eq!(qty, 1.0);
        assert_eq!(avg, 100.0);
        assert!(b.is_empty());
    }

    #[test]
    fn taker_avg_price_bounded_by_walked_levels() {
        let mut b = book(&[], &[(100.0, 1.0), (105.0, 2.0)]);
        let (avg, qty) = b.consume_taker_fill(Side::Buy, 2.0, None).unwrap();
        assert!(qty <= 2.0 + 1e-12);
        assert!((100.0..=105.0).contains(&avg));
    }

    #[test]
    fn repeated_level_updates_keep_one_entry() {
        let mut b = L2Book::new();
        for _ in 0..1_000 {
            b.apply_level(Side::Sell, 101.0, 1.0);
        }
        for _ in 0..100 {
            b.apply_level(Side::Sell, 101.0, 0.0);
            b.apply_level(Side::Sell, 101.0, 1.0);
        }
        assert_eq!(b.ask_levels(), 1);
        assert_eq!(b.best_ask(), Some(101.0));
    }
}
