//! # Engine Error Taxonomy
//!
//! One closed error enum shared by the engine core and the dataset adapter.
//!
//! Propagation policy: `OutOfOrderEvent`, `ResourceExhausted`, `SchemaError`
//! and `Io` are fatal - they terminate the run and surface to the caller.
//! `UnknownSymbol`, `InvalidOrder`, `GuardBlocked` and
//! `InsufficientLiquidity` are reported to the submitting strategy as
//! rejection records and never terminate the run.

use thiserror::Error;

/// Errors surfaced by the engine core and the replay adapter.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Strict monotonic replay violated: an event moved backwards in time.
    #[error("out-of-order event: event_time_ms {event_time_ms} after {last_ms}")]
    OutOfOrderEvent { event_time_ms: i64, last_ms: i64 },

    /// Order references a symbol with no book.
    #[error("unknown symbol: {0}")]
    UnknownSymbol(String),

    /// Malformed order.
    #[error("invalid order: {0}")]
    InvalidOrder(String),

    /// FOK order could not fully fill against available depth.
    #[error(
        "insufficient liquidity for order {order_id}: requested {requested}, available {available}"
    )]
    InsufficientLiquidity {
        order_id: String,
        requested: f64,
        available: f64,
    },

    /// Submit vetoed by the book guard.
    #[error("book guard blocked submit on {symbol}: {reason}")]
    GuardBlocked { symbol: String, reason: String },

    /// Adapter exceeded its in-memory sort budget.
    #[error("resource exhausted in {context}: {rows} rows exceeds sort limit {limit}")]
    ResourceExhausted {
        context: String,
        rows: usize,
        limit: usize,
    },

    /// Adapter row missing a required column or otherwise unparseable.
    #[error("schema error in {context}: {detail}")]
    SchemaError { context: String, detail: String },

    /// I/O failure while streaming an adapter source.
    #[error("i/o error in {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl EngineError {
    /// Whether this error terminates a run (versus being reportable to the
    /// strategy as a rejection).
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::OutOfOrderEvent { .. }
                | EngineError::ResourceExhausted { .. }
                | EngineError::SchemaError { .. }
                | EngineError::Io { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatality_split_matches_propagation_policy() {
        assert!(
            EngineError::OutOfOrderEvent {
                event_time_ms: 1,
                last_ms: 2
            }
            .is_fatal()
        );
        assert!(
            EngineError::ResourceExhausted {
                context: "trades".to_string(),
                rows: 10,
                limit: 5
            }
            .is_fatal()
        );
        assert!(!EngineError::UnknownSymbol("ETHUSDT".to_string()).is_fatal());
        assert!(!EngineError::InsufficientLiquidity {
            order_id: "o1".to_string(),
            requested: 2.0,
            available: 1.0,
        }
        .is_fatal());
    }
}
