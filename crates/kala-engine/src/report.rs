//! # Fill Analytics
//!
//! Post-run analytics over the broker's append-only fill record: round-trip
//! extraction, equity-curve drawdown and a summary. Consumes fills only -
//! funding and other portfolio-level cash flows are deliberately outside a
//! round trip.

use kala_models::{Fill, Side};
use serde::{Deserialize, Serialize};

/// Equity curve samples as `(event_time_ms, equity_usdt)` pairs.
pub type EquityCurve = Vec<(i64, f64)>;

/// One completed position episode: flat -> open -> flat (or flip).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundTrip {
    pub symbol: String,
    /// Entry side: `Buy` = long trade, `Sell` = short trade.
    pub direction: Side,
    pub open_time_ms: i64,
    pub close_time_ms: i64,
    /// Volume-weighted entry / exit prices.
    pub entry_price: f64,
    pub exit_price: f64,
    pub quantity: f64,
    pub gross_pnl_usdt: f64,
    pub fees_usdt: f64,
    pub net_pnl_usdt: f64,
    pub duration_ms: i64,
}

/// Running per-symbol episode state.
#[derive(Debug, Clone, Default)]
struct Episode {
    qty: f64,
    open_time_ms: i64,
    close_time_ms: i64,
    entry_cost: f64,
    entry_qty: f64,
    exit_cost: f64,
    exit_qty: f64,
    fees: f64,
}

impl Episode {
    fn emit(&self, symbol: &str, direction_sign: f64) -> RoundTrip {
        let entry_price = self.entry_cost / self.entry_qty;
        let exit_price = self.exit_cost / self.exit_qty;
        let gross = (exit_price - entry_price) * self.exit_qty * direction_sign;
        RoundTrip {
            symbol: symbol.to_string(),
            direction: if direction_sign > 0.0 { Side::Buy } else { Side::Sell },
            open_time_ms: self.open_time_ms,
            close_time_ms: self.close_time_ms,
            entry_price,
            exit_price,
            quantity: self.exit_qty,
            gross_pnl_usdt: gross,
            fees_usdt: self.fees,
            net_pnl_usdt: gross - self.fees,
            duration_ms: self.close_time_ms - self.open_time_ms,
        }
    }
}

/// Extract round trips from fills by tracking the signed position per
/// symbol. A fill that flips the position closes the running trade and
/// opens a new one with the remainder; its fee is split pro rata.
pub fn round_trips_from_fills(fills: &[Fill]) -> Vec<RoundTrip> {
    let mut trips = Vec::new();
    let mut episodes: std::collections::HashMap<String, Episode> =
        std::collections::HashMap::new();

    for fill in fills {
        if fill.quantity <= 0.0 {
            continue;
        }
        let delta = fill.side.sign() * fill.quantity;
        let ep = episodes.entry(fill.symbol.clone()).or_default();

        if ep.qty == 0.0 || ep.qty.signum() == delta.signum() {
            if ep.qty == 0.0 {
                ep.open_time_ms = fill.event_time_ms;
            }
            ep.entry_cost += fill.price * fill.quantity;
            ep.entry_qty += fill.quantity;
            ep.fees += fill.fee_usdt;
            ep.qty += delta;
            continue;
        }

        // Reducing fill: close as much as the open quantity allows.
        let closed = fill.quantity.min(ep.qty.abs());
        let closed_frac = closed / fill.quantity;
        ep.exit_cost += fill.price * closed;
        ep.exit_qty += closed;
        ep.fees += fill.fee_usdt * closed_frac;
        ep.close_time_ms = fill.event_time_ms;

        let direction_sign = ep.qty.signum();
        let new_qty = ep.qty + delta;

        if new_qty == 0.0 {
            trips.push(ep.emit(&fill.symbol, direction_sign));
            *ep = Episode::default();
        } else if new_qty.signum() != direction_sign {
            trips.push(ep.emit(&fill.symbol, direction_sign));
            // The flip remainder opens a fresh trade at the fill price.
            *ep = Episode {
                qty: new_qty,
                open_time_ms: fill.event_time_ms,
                entry_cost: fill.price * new_qty.abs(),
                entry_qty: new_qty.abs(),
                fees: fill.fee_usdt * (1.0 - closed_frac),
                ..Episode::default()
            };
        } else {
            ep.qty = new_qty;
        }
    }

    trips
}

/// Largest peak-to-trough equity decline. Returned as a non-positive
/// number (`-5.0` means a 5 USDT drawdown); `0.0` for a curve that never
/// falls below its running peak.
pub fn max_drawdown(equity_curve: &[(i64, f64)]) -> f64 {
    let mut peak = f64::NEG_INFINITY;
    let mut worst = 0.0f64;
    for &(_, equity) in equity_curve {
        peak = peak.max(equity);
        worst = worst.min(equity - peak);
    }
    worst
}

/// Aggregate round-trip statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoundTripSummary {
    pub trades: usize,
    pub wins: usize,
    pub losses: usize,
    pub win_rate: f64,
    pub gross_pnl_usdt: f64,
    pub fees_usdt: f64,
    pub net_pnl_usdt: f64,
    pub avg_net_pnl_usdt: f64,
}

pub fn summarize_round_trips(trips: &[RoundTrip]) -> RoundTripSummary {
    if trips.is_empty() {
        return RoundTripSummary::default();
    }

    let mut out = RoundTripSummary {
        trades: trips.len(),
        ..RoundTripSummary::default()
    };
    for t in trips {
        if t.net_pnl_usdt >= 0.0 {
            out.wins += 1;
        } else {
            out.losses += 1;
        }
        out.gross_pnl_usdt += t.gross_pnl_usdt;
        out.fees_usdt += t.fees_usdt;
        out.net_pnl_usdt += t.net_pnl_usdt;
    }
    out.win_rate = out.wins as f64 / out.trades as f64;
    out.avg_net_pnl_usdt = out.net_pnl_usdt / out.trades as f64;
    out
}
