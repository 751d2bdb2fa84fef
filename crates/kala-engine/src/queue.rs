//! # Maker Queue Model
//!
//! Approximate fill model for resting limit orders, driven by the visible
//! book and the public trade tape.
//!
//! When an order is placed we assume it rests behind the currently visible
//! quantity at its price (`queue_ahead_qty`, scaled and padded by broker
//! config). Trades at or through the order's price on the correct side
//! consume queue ahead first; only the excess fills the order, always at
//! exactly its limit price. Depth updates never fill makers - they may only
//! lower the queue-ahead estimate, and only on the first level observation
//! after submission.

use kala_models::{Side, Trade};

/// A resting limit order tracked by the queue-position approximation.
#[derive(Debug, Clone)]
pub struct MakerQueueOrder {
    pub order_id: String,
    pub symbol: String,
    /// `Buy` rests on the bid ladder, `Sell` on the ask ladder.
    pub side: Side,
    pub limit_price: f64,
    pub quantity: f64,
    pub filled_qty: f64,
    /// Estimated quantity resting ahead of us at our price.
    pub queue_ahead_qty: f64,
    /// Whether the one allowed post-submit queue refresh has been consumed.
    refreshed_from_book: bool,
    /// Lower sequence = earlier submission = earlier fill priority.
    pub priority_seq: u64,
}

impl MakerQueueOrder {
    pub fn new(
        order_id: String,
        symbol: String,
        side: Side,
        limit_price: f64,
        quantity: f64,
        queue_ahead_qty: f64,
        priority_seq: u64,
    ) -> Self {
        Self {
            order_id,
            symbol,
            side,
            limit_price,
            quantity,
            filled_qty: 0.0,
            queue_ahead_qty,
            refreshed_from_book: false,
            priority_seq,
        }
    }

    pub fn remaining_qty(&self) -> f64 {
        (self.quantity - self.filled_qty).max(0.0)
    }

    pub fn is_filled(&self) -> bool {
        self.remaining_qty() <= 0.0
    }

    /// Refresh the queue-ahead estimate from a visible-quantity update at
    /// our level. Only the first observation after submission is used, and
    /// only decreases are taken; later shrinkage is assumed to happen behind
    /// us, which keeps the model conservative.
    pub fn on_book_qty_update(&mut self, new_visible_qty: f64) {
        if self.refreshed_from_book {
            return;
        }
        self.refreshed_from_book = true;
        if new_visible_qty >= 0.0 && new_visible_qty < self.queue_ahead_qty {
            self.queue_ahead_qty = new_visible_qty;
        }
    }

    /// Whether a trade print can age this order: price at or through our
    /// level, aggressor on the opposite side. A buy limit ages on downticks
    /// (`is_buyer_maker == true`), a sell limit on upticks.
    pub fn matches_trade(&self, trade: &Trade) -> bool {
        if trade.symbol != self.symbol || self.is_filled() {
            return false;
        }
        match self.side {
            Side::Buy => trade.is_buyer_maker && trade.price <= self.limit_price + 1e-9,
            Side::Sell => !trade.is_buyer_maker && trade.price >= self.limit_price - 1e-9,
        }
    }

    /// Consume trade tape with a participation fraction and a shared
    /// per-trade volume budget.
    ///
    /// Returns `(fill_qty, consumed_qty)`: quantity credited to this order
    /// and total trade quantity consumed at this level (queue + fill).
    pub fn on_trade_budgeted(
        &mut self,
        trade: &Trade,
        participation: f64,
        max_trade_qty: f64,
    ) -> (f64, f64) {
        if !self.matches_trade(trade) {
            return (0.0, 0.0);
        }

        let volume = (trade.quantity * participation).min(max_trade_qty.max(0.0));
        if volume <= 0.0 {
            return (0.0, 0.0);
        }

        // Queue ahead is consumed first.
        if self.queue_ahead_qty >= volume {
            self.queue_ahead_qty -= volume;
            return (0.0, volume);
        }

        let queue_consumed = self.queue_ahead_qty;
        let excess = volume - queue_consumed;
        self.queue_ahead_qty = 0.0;

        let fill = self.remaining_qty().min(excess);
        self.filled_qty += fill;
        (fill, queue_consumed + fill)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order(side: Side, price: f64, qty: f64, queue_ahead: f64) -> MakerQueueOrder {
        MakerQueueOrder::new(
            "m1".to_string(),
            "BTCUSDT".to_string(),
            side,
            price,
            qty,
            queue_ahead,
            0,
        )
    }

    fn downtick(price: f64, qty: f64) -> Trade {
        Trade {
            event_time_ms: 1_000,
            received_time_ns: None,
            symbol: "BTCUSDT".to_string(),
            trade_id: 1,
            price,
            quantity: qty,
            is_buyer_maker: true,
        }
    }

    fn uptick(price: f64, qty: f64) -> Trade {
        Trade {
            is_buyer_maker: false,
            ..downtick(price, qty)
        }
    }

    #[test]
    fn queue_ahead_absorbs_then_excess_fills() {
        // Resting buy at 100, qty 1, queue ahead 2; two 1.5 downticks.
        let mut mo = order(Side::Buy, 100.0, 1.0, 2.0);

        let (fill, consumed) = mo.on_trade_budgeted(&downtick(100.0, 1.5), 1.0, f64::MAX);
        assert_eq!(fill, 0.0);
        assert!((consumed - 1.5).abs() < 1e-12);
        assert!((mo.queue_ahead_qty - 0.5).abs() < 1e-12);

        let (fill, consumed) = mo.on_trade_budgeted(&downtick(100.0, 1.5), 1.0, f64::MAX);
        assert!((fill - 1.0).abs() < 1e-12);
        assert!((consumed - 1.5).abs() < 1e-12);
        assert!(mo.is_filled());
    }

    #[test]
    fn buy_limit_ignores_upticks_and_prices_above_level() {
        let mut mo = order(Side::Buy, 100.0, 1.0, 0.0);
        assert_eq!(mo.on_trade_budgeted(&uptick(100.0, 5.0), 1.0, f64::MAX).0, 0.0);
        assert_eq!(
            mo.on_trade_budgeted(&downtick(100.5, 5.0), 1.0, f64::MAX).0,
            0.0
        );
        // Trade through the level does fill.
        assert!(mo.on_trade_budgeted(&downtick(99.5, 5.0), 1.0, f64::MAX).0 > 0.0);
    }

    #[test]
    fn sell_limit_ages_on_upticks_at_or_through() {
        let mut mo = order(Side::Sell, 100.0, 1.0, 0.0);
        assert_eq!(mo.on_trade_budgeted(&downtick(100.0, 5.0), 1.0, f64::MAX).0, 0.0);
        let (fill, _) = mo.on_trade_budgeted(&uptick(100.5, 5.0), 1.0, f64::MAX);
        assert!((fill - 1.0).abs() < 1e-12);
    }

    #[test]
    fn participation_scales_consumed_volume() {
        let mut mo = order(Side::Buy, 100.0, 2.0, 1.0);
        let (fill, consumed) = mo.on_trade_budgeted(&downtick(100.0, 4.0), 0.5, f64::MAX);
        // 0.5 participation of 4.0 => 2.0: 1.0 queue + 1.0 fill.
        assert!((fill - 1.0).abs() < 1e-12);
        assert!((consumed - 2.0).abs() < 1e-12);
    }

    #[test]
    fn trade_budget_caps_consumption() {
        let mut mo = order(Side::Buy, 100.0, 2.0, 0.0);
        let (fill, consumed) = mo.on_trade_budgeted(&downtick(100.0, 4.0), 1.0, 0.5);
        assert!((fill - 0.5).abs() < 1e-12);
        assert!((consumed - 0.5).abs() < 1e-12);
    }

    #[test]
    fn book_refresh_only_first_observation_and_only_decreases() {
        let mut mo = order(Side::Buy, 100.0, 1.0, 3.0);
        mo.on_book_qty_update(2.0);
        assert!((mo.queue_ahead_qty - 2.0).abs() < 1e-12);
        // Later observations are ignored, even lower ones.
        mo.on_book_qty_update(0.5);
        assert!((mo.queue_ahead_qty - 2.0).abs() < 1e-12);

        let mut mo2 = order(Side::Buy, 100.0, 1.0, 1.0);
        // Increases never raise the estimate.
        mo2.on_book_qty_update(5.0);
        assert!((mo2.queue_ahead_qty - 1.0).abs() < 1e-12);
    }
}
