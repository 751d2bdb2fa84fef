//! # Portfolio Accounting
//!
//! Signed per-symbol positions with average-entry accounting, realized PnL
//! and fee tracking, and periodic funding settlement for perpetuals.
//!
//! Realized PnL changes only on position-reducing fills and funding events;
//! fees accumulate separately and are never netted into realized PnL.

use std::collections::HashMap;

use kala_models::Side;
use serde::{Deserialize, Serialize};

/// Per-symbol position state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Position {
    /// Net quantity, positive = long, negative = short.
    pub qty: f64,
    /// Average entry price of the open quantity (0.0 when flat).
    pub avg_price: f64,
    /// Last observed mark price, latched by funding application.
    pub last_mark_price: Option<f64>,
}

/// Portfolio owned by the simulated broker.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Portfolio {
    pub positions: HashMap<String, Position>,
    pub realized_pnl_usdt: f64,
    pub fees_paid_usdt: f64,
}

impl Portfolio {
    pub fn new() -> Self {
        Self::default()
    }

    /// Net signed quantity for a symbol (0.0 when no position exists).
    pub fn position_qty(&self, symbol: &str) -> f64 {
        self.positions.get(symbol).map(|p| p.qty).unwrap_or(0.0)
    }

    /// Apply one fill with average-entry accounting.
    ///
    /// Same-direction fills re-average the entry price. Reducing fills
    /// realize `(price - avg) * closed_qty` (sign-adjusted for shorts). A
    /// fill that flips the position realizes the closed leg and re-opens the
    /// remainder at the fill price.
    pub fn apply_fill(&mut self, symbol: &str, side: Side, qty: f64, price: f64, fee_usdt: f64) {
        debug_assert!(qty > 0.0, "fill quantity must be positive");

        self.fees_paid_usdt += fee_usdt;

        let pos = self.positions.entry(symbol.to_string()).or_default();
        let delta = side.sign() * qty;
        let prior = pos.qty;

        if prior == 0.0 || prior.signum() == delta.signum() {
            // Opening or adding: volume-weighted average entry.
            let total = prior.abs() + qty;
            pos.avg_price = (pos.avg_price * prior.abs() + price * qty) / total;
            pos.qty = prior + delta;
            return;
        }

        // Reducing (possibly through zero).
        let closed = qty.min(prior.abs());
        self.realized_pnl_usdt += (price - pos.avg_price) * closed * prior.signum();
        pos.qty = prior + delta;

        if pos.qty == 0.0 {
            pos.avg_price = 0.0;
        } else if pos.qty.signum() != prior.signum() {
            // Flipped: remainder opens at the fill price.
            pos.avg_price = price;
        }
        // Partial reduction keeps the original average entry.
    }

    /// Apply one funding settlement: `-qty * mark * rate` (longs pay when
    /// the rate is positive). Returns the PnL applied, 0.0 when flat.
    pub fn apply_funding(&mut self, symbol: &str, mark_price: f64, funding_rate: f64) -> f64 {
        let Some(pos) = self.positions.get_mut(symbol) else {
            return 0.0;
        };
        pos.last_mark_price = Some(mark_price);
        if pos.qty == 0.0 {
            return 0.0;
        }
        let pnl = -pos.qty * mark_price * funding_rate;
        self.realized_pnl_usdt += pnl;
        pnl
    }

    /// Mark-to-last-mark unrealized PnL across all open positions. Symbols
    /// that never saw a mark price contribute zero.
    pub fn unrealized_pnl_usdt(&self) -> f64 {
        self.positions
            .values()
            .filter(|p| p.qty != 0.0)
            .filter_map(|p| p.last_mark_price.map(|m| (m - p.avg_price) * p.qty))
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reduction_realizes_pnl_and_keeps_avg() {
        let mut pf = Portfolio::new();
        pf.apply_fill("BTCUSDT", Side::Buy, 2.0, 100.0, 0.0);
        pf.apply_fill("BTCUSDT", Side::Sell, 0.5, 110.0, 0.0);

        let pos = &pf.positions["BTCUSDT"];
        assert!((pos.qty - 1.5).abs() < 1e-12);
        assert!((pos.avg_price - 100.0).abs() < 1e-12);
        assert!((pf.realized_pnl_usdt - 5.0).abs() < 1e-12);
    }

    #[test]
    fn close_realizes_loss_and_resets_avg() {
        let mut pf = Portfolio::new();
        pf.apply_fill("BTCUSDT", Side::Buy, 1.0, 100.0, 0.0);
        pf.apply_fill("BTCUSDT", Side::Sell, 1.0, 90.0, 0.0);

        let pos = &pf.positions["BTCUSDT"];
        assert_eq!(pos.qty, 0.0);
        assert_eq!(pos.avg_price, 0.0);
        assert!((pf.realized_pnl_usdt - (-10.0)).abs() < 1e-12);
    }

    #[test]
    fn flip_realizes_closed_leg_and_reopens_at_fill_price() {
        let mut pf = Portfolio::new();
        pf.apply_fill("BTCUSDT", Side::Buy, 1.0, 100.0, 0.0);
        pf.apply_fill("BTCUSDT", Side::Sell, 2.0, 110.0, 0.0);

        let pos = &pf.positions["BTCUSDT"];
        assert!((pos.qty - (-1.0)).abs() < 1e-12);
        assert!((pos.avg_price - 110.0).abs() < 1e-12);
        assert!((pf.realized_pnl_usdt - 10.0).abs() < 1e-12);
    }

    #[test]
    fn adding_reaverages_entry_price() {
        let mut pf = Portfolio::new();
        pf.apply_fill("BTCUSDT", Side::Sell, 1.0, 100.0, 0.0);
        pf.apply_fill("BTCUSDT", Side::Sell, 1.0, 110.0, 0.0);

        let pos = &pf.positions["BTCUSDT"];
        assert!((pos.qty - (-2.0)).abs() < 1e-12);
        assert!((pos.avg_price - 105.0).abs() < 1e-12);
        assert_eq!(pf.realized_pnl_usdt, 0.0);
    }

    #[test]
    fn positive_funding_penalizes_longs_and_pays_shorts() {
        let mut long_pf = Portfolio::new();
        long_pf.apply_fill("BTCUSDT", Side::Buy, 1.0, 100.0, 0.0);
        let paid = long_pf.apply_funding("BTCUSDT", 100.0, 0.01);
        assert!((paid - (-1.0)).abs() < 1e-12);
        assert!((long_pf.realized_pnl_usdt - (-1.0)).abs() < 1e-12);

        let mut short_pf = Portfolio::new();
        short_pf.apply_fill("BTCUSDT", Side::Sell, 1.0, 100.0, 0.0);
        let received = short_pf.apply_funding("BTCUSDT", 100.0, 0.01);
        assert!((received - 1.0).abs() < 1e-12);
        assert!((short_pf.realized_pnl_usdt - 1.0).abs() < 1e-12);
    }

    #[test]
    fn funding_on_flat_symbol_is_zero() {
        let mut pf = Portfolio::new();
        assert_eq!(pf.apply_funding("BTCUSDT", 100.0, 0.01), 0.0);
        pf.apply_fill("BTCUSDT", Side::Buy, 1.0, 100.0, 0.0);
        pf.apply_fill("BTCUSDT", Side::Sell, 1.0, 100.0, 0.0);
        assert_eq!(pf.apply_funding("BTCUSDT", 100.0, 0.01), 0.0);
    }

    #[test]
    fn fees_accumulate_separately_from_realized_pnl() {
        let mut pf = Portfolio::new();
        pf.apply_fill("BTCUSDT", Side::Buy, 1.0, 100.0, 0.05);
        pf.apply_fill("BTCUSDT", Side::Sell, 1.0, 100.0, 0.05);
        assert!((pf.fees_paid_usdt - 0.1).abs() < 1e-12);
        assert_eq!(pf.realized_pnl_usdt, 0.0);
    }

    #[test]
    fn unrealized_marks_open_positions_at_last_mark() {
        let mut pf = Portfolio::new();
        pf.apply_fill("BTCUSDT", Side::Buy, 2.0, 100.0, 0.0);
        pf.apply_funding("BTCUSDT", 105.0, 0.0);
        assert!((pf.unrealized_pnl_usdt() - 10.0).abs() < 1e-12);
    }
}
