//! # Book Guard
//!
//! Runtime sanity filter between the strategy and the broker. Watches every
//! depth update for sequence gaps and crossed books, and vets each submit
//! against spread, staleness and warmup conditions.
//!
//! A trip starts a cooldown window during which submits are blocked,
//! re-arms the warmup counter, optionally resets the book for a rebuild,
//! and invalidates pending submits for the symbol so latent orders never
//! fire into a book that was just declared unhealthy.

use std::collections::HashMap;

use kala_models::DepthUpdate;
use serde::{Deserialize, Serialize};

use crate::book::L2Book;
use crate::broker::SimBroker;

/// Guard thresholds. Every default is explicit; `None` disables a check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookGuardConfig {
    /// Absolute spread ceiling (quote units).
    pub max_spread: Option<f64>,
    /// Spread ceiling as basis points of mid.
    pub max_spread_bps: Option<f64>,
    /// Maximum age of the last depth update at submit time. 0 disables.
    pub max_staleness_ms: i64,
    /// Post-trip quiet period blocking submits. 0 disables.
    pub cooldown_ms: i64,
    /// Depth updates required (after start or after a trip) before submits
    /// are allowed. 0 disables.
    pub warmup_depth_updates: u32,
    /// Rebuild the book from scratch after a sequence mismatch.
    pub reset_on_mismatch: bool,
    /// Rebuild the book from scratch after a crossed-book trip.
    pub reset_on_crossed: bool,
    /// Also cancel active maker orders on a trip (pending submits are
    /// always invalidated).
    pub cancel_active_makers_on_trip: bool,
}

impl Default for BookGuardConfig {
    fn default() -> Self {
        Self {
            max_spread: None,
            max_spread_bps: Some(5.0),
            max_staleness_ms: 500,
            cooldown_ms: 1_000,
            warmup_depth_updates: 1_000,
            reset_on_mismatch: true,
            reset_on_crossed: true,
            cancel_active_makers_on_trip: false,
        }
    }
}

/// Trip and block counters, by reason.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BookGuardStats {
    pub resets: u64,
    pub mismatch_trips: u64,
    pub cross_trips: u64,
    pub missing_side_trips: u64,
    pub spread_trips: u64,
    pub stale_trips: u64,
    pub blocked_submits: u64,
    pub blocked_by_reason: HashMap<String, u64>,
}

impl BookGuardStats {
    fn block(&mut self, reason: &str) {
        self.blocked_submits += 1;
        *self.blocked_by_reason.entry(reason.to_string()).or_insert(0) += 1;
    }
}

/// Sanity gate for one symbol (or all symbols when none is pinned).
#[derive(Debug)]
pub struct BookGuard {
    /// When set, guard checks apply only to this symbol.
    symbol: Option<String>,
    cfg: BookGuardConfig,
    pub stats: BookGuardStats,

    blocked_until_ms: HashMap<String, i64>,
    warmup_remaining: HashMap<String, u32>,
    last_final_update_id: HashMap<String, i64>,
    last_depth_event_ms: HashMap<String, i64>,
}

impl BookGuard {
    pub fn new(symbol: Option<String>, cfg: BookGuardConfig) -> Self {
        let mut warmup_remaining = HashMap::new();
        if let Some(sym) = &symbol
            && cfg.warmup_depth_updates > 0
        {
            warmup_remaining.insert(sym.clone(), cfg.warmup_depth_updates);
        }
        Self {
            symbol,
            cfg,
            stats: BookGuardStats::default(),
            blocked_until_ms: HashMap::new(),
            warmup_remaining,
            last_final_update_id: HashMap::new(),
            last_depth_event_ms: HashMap::new(),
        }
    }

    pub fn config(&self) -> &BookGuardConfig {
        &self.cfg
    }

    pub fn applies_to(&self, symbol: &str) -> bool {
        self.symbol.as_deref().is_none_or(|s| s == symbol)
    }

    /// Sequence bookkeeping before the delta is applied to the book.
    ///
    /// Records the depth timestamp, burns one warmup credit, and trips on a
    /// `prev_final_update_id` that disagrees with the last seen
    /// `final_update_id` (a mismatch reset clears the book *before* the
    /// current delta lands, so the rebuilt book starts from this delta).
    pub fn pre_depth_update(
        &mut self,
        update: &DepthUpdate,
        book: &mut L2Book,
        broker: &mut SimBroker,
    ) {
        if !self.applies_to(&update.symbol) {
            return;
        }
        let sym = update.symbol.clone();
        self.last_depth_event_ms
            .insert(sym.clone(), update.event_time_ms);

        let warmup = self
            .warmup_remaining
            .entry(sym.clone())
            .or_insert(self.cfg.warmup_depth_updates);
        if *warmup > 0 {
            *warmup -= 1;
        }

        if let (Some(prev), Some(&last)) = (
            update.prev_final_update_id,
            self.last_final_update_id.get(&sym),
        ) && prev != last
        {
            self.stats.mismatch_trips += 1;
            self.trip(&sym, update.event_time_ms, "mismatch", book, broker);
        }

        self.last_final_update_id
            .insert(sym, update.final_update_id);
    }

    /// Crossed-book detection after the delta has been applied.
    pub fn post_depth_update(
        &mut self,
        update: &DepthUpdate,
        book: &mut L2Book,
        broker: &mut SimBroker,
    ) {
        if !self.applies_to(&update.symbol) {
            return;
        }
        if book.is_crossed() {
            self.stats.cross_trips += 1;
            self.trip(&update.symbol, update.event_time_ms, "crossed", book, broker);
        }
    }

    /// Vet one submit. `Err(reason)` means the submit must be rejected as
    /// guard-blocked. Unhealthy books discovered here (stale, missing side,
    /// crossed, wide) also trip.
    pub fn check_submit(
        &mut self,
        symbol: &str,
        now_ms: i64,
        book: &mut L2Book,
        broker: &mut SimBroker,
    ) -> Result<(), &'static str> {
        if !self.applies_to(symbol) {
            return Ok(());
        }

        if now_ms < self.blocked_until_ms.get(symbol).copied().unwrap_or(0) {
            self.stats.block("cooldown");
            return Err("cooldown");
        }

        let warmup = self
            .warmup_remaining
            .get(symbol)
            .copied()
            .unwrap_or(self.cfg.warmup_depth_updates);
        if warmup > 0 {
            self.stats.block("warmup");
            return Err("warmup");
        }

        if self.cfg.max_staleness_ms > 0 {
            let fresh = self
                .last_depth_event_ms
                .get(symbol)
                .is_some_and(|&last| now_ms - last <= self.cfg.max_staleness_ms);
            if !fresh {
                self.stats.block("stale");
                self.stats.stale_trips += 1;
                self.trip(symbol, now_ms, "stale", book, broker);
                return Err("stale");
            }
        }

        let (bid, ask) = match (book.best_bid(), book.best_ask()) {
            (Some(b), Some(a)) => (b, a),
            _ => {
                self.stats.block("missing_side");
                self.stats.missing_side_trips += 1;
                self.trip(symbol, now_ms, "missing_side", book, broker);
                return Err("missing_side");
            }
        };

        if bid >= ask {
            self.stats.block("crossed");
            self.stats.cross_trips += 1;
            self.trip(symbol, now_ms, "crossed", book, broker);
            return Err("crossed");
        }

        let spread = ask - bid;
        if let Some(max_spread) = self.cfg.max_spread
            && spread > max_spread
        {
            self.stats.block("spread");
            self.stats.spread_trips += 1;
            self.trip(symbol, now_ms, "spread", book, broker);
            return Err("spread");
        }

        if let Some(max_bps) = self.cfg.max_spread_bps {
            let mid = (bid + ask) / 2.0;
            if mid > 0.0 && (spread / mid) * 10_000.0 > max_bps {
                self.stats.block("spread");
                self.stats.spread_trips += 1;
                self.trip(symbol, now_ms, "spread", book, broker);
                return Err("spread");
            }
        }

        Ok(())
    }

    /// Enter (or extend) the cooldown, re-arm warmup, optionally reset the
    /// book, and invalidate latent submits for the symbol.
    ///
    /// Extending via `max` keeps trips idempotent inside one window: two
    /// identical trips yield one cooldown interval, not two back to back.
    fn trip(
        &mut self,
        symbol: &str,
        now_ms: i64,
        reason: &'static str,
        book: &mut L2Book,
        broker: &mut SimBroker,
    ) {
        tracing::warn!(symbol, reason, now_ms, "book guard trip");

        if self.cfg.cooldown_ms > 0 {
            let until = self.blocked_until_ms.entry(symbol.to_string()).or_insert(0);
            *until = (*until).max(now_ms + self.cfg.cooldown_ms);
        }
        if self.cfg.warmup_depth_updates > 0 {
            let warmup = self.warmup_remaining.entry(symbol.to_string()).or_insert(0);
            *warmup = (*warmup).max(self.cfg.warmup_depth_updates);
        }

        let reset = match reason {
            "mismatch" => self.cfg.reset_on_mismatch,
            "crossed" => self.cfg.reset_on_crossed,
            _ => false,
        };
        if reset {
            book.clear();
            self.stats.resets += 1;
        }

        broker.cancel_symbol_orders(symbol, self.cfg.cancel_active_makers_on_trip, true);
    }
}
