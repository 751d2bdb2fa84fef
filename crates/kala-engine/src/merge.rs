//! # Event Stream Merge
//!
//! K-way merge of per-source event iterators into one stream ordered by
//! `event_time_ms`, plus time-window slicing.
//!
//! Each source must be individually non-decreasing in `event_time_ms`. The
//! merge keeps exactly one buffered event per source and pops via a min-heap
//! keyed by the deterministic tie-break tuple:
//!
//! 1. `event_time_ms`
//! 2. `received_time_ns` (missing values sort last)
//! 3. type rank (depth < trade < mark < ticker < open interest < liquidation)
//! 4. type-specific id (`final_update_id` / `trade_id`)
//! 5. source index (the order sources were passed in)
//!
//! Merging the same inputs twice yields an identical output sequence.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use kala_models::{EngineError, MarketEvent};

/// Item type flowing through merged streams: adapter sources can fail
/// mid-stream and those failures are fatal downstream.
pub type EventResult = Result<MarketEvent, EngineError>;

/// Boxed source iterator as handed to the merge.
pub type EventSource = Box<dyn Iterator<Item = EventResult> + Send>;

/// Deterministic ordering key per the merge tie-break tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct MergeKey {
    event_time_ms: i64,
    received_time_ns: i64,
    type_rank: u8,
    tie_id: i64,
    source_idx: usize,
}

impl MergeKey {
    fn for_event(ev: &MarketEvent, source_idx: usize) -> Self {
        Self {
            event_time_ms: ev.event_time_ms(),
            // Missing receive timestamps sort after any recorded one.
            received_time_ns: ev.received_time_ns().unwrap_or(i64::MAX),
            type_rank: ev.type_rank(),
            tie_id: ev.tie_id(),
            source_idx,
        }
    }
}

struct SourceSlot {
    iter: EventSource,
    current: Option<MarketEvent>,
}

impl std::fmt::Debug for SourceSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceSlot")
            .field("current", &self.current)
            .finish()
    }
}

impl SourceSlot {
    /// Pull the next event into the buffer. A source error is returned for
    /// immediate emission; the source is left drained.
    fn advance(&mut self) -> Result<(), EngineError> {
        match self.iter.next() {
            Some(Ok(ev)) => {
                self.current = Some(ev);
                Ok(())
            }
            Some(Err(e)) => {
                self.current = None;
                Err(e)
            }
            None => {
                self.current = None;
                Ok(())
            }
        }
    }
}

/// Merged, time-ordered event stream.
#[derive(Debug)]
pub struct MergedEventStream {
    sources: Vec<SourceSlot>,
    heap: BinaryHeap<Reverse<MergeKey>>,
    /// First source error, emitted before any further events.
    pending_error: Option<EngineError>,
}

impl MergedEventStream {
    /// Merge the given sources. Source index is the tie-break of last
    /// resort, so pass sources in a stable order.
    pub fn new(sources: Vec<EventSource>) -> Self {
        let mut slots: Vec<SourceSlot> = sources
            .into_iter()
            .map(|iter| SourceSlot { iter, current: None })
            .collect();

        let mut heap = BinaryHeap::with_capacity(slots.len());
        let mut pending_error = None;

        for (idx, slot) in slots.iter_mut().enumerate() {
            if let Err(e) = slot.advance() {
                if pending_error.is_none() {
                    pending_error = Some(e);
                }
                continue;
            }
            if let Some(ev) = &slot.current {
                heap.push(Reverse(MergeKey::for_event(ev, idx)));
            }
        }

        Self {
            sources: slots,
            heap,
            pending_error,
        }
    }
}

impl Iterator for MergedEventStream {
    type Item = EventResult;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(e) = self.pending_error.take() {
            return Some(Err(e));
        }

        let Reverse(key) = self.heap.pop()?;
        let slot = &mut self.sources[key.source_idx];
        let ev = slot
            .current
            .take()
            .expect("heap entry implies a buffered event");

        match slot.advance() {
            Ok(()) => {
                if let Some(next_ev) = &slot.current {
                    self.heap
                        .push(Reverse(MergeKey::for_event(next_ev, key.source_idx)));
                }
            }
            Err(e) => self.pending_error = Some(e),
        }

        Some(Ok(ev))
    }
}

/// Merge already-materialized per-source event vectors. Convenience for
/// callers that do not stream from files.
pub fn merge_event_streams(sources: Vec<Vec<MarketEvent>>) -> MergedEventStream {
    MergedEventStream::new(
        sources
            .into_iter()
            .map(|events| Box::new(events.into_iter().map(Ok)) as EventSource)
            .collect(),
    )
}

/// Slice a time-ordered stream to the half-open window `[start_ms, end_ms)`.
///
/// Events before `start_ms` are skipped; iteration stops at the first event
/// at or after `end_ms` (sources are ordered, so early exit is safe).
/// Errors pass through untouched.
pub struct SlicedEventStream<I> {
    inner: I,
    start_ms: Option<i64>,
    end_ms: Option<i64>,
    done: bool,
}

impl<I> Iterator for SlicedEventStream<I>
where
    I: Iterator<Item = EventResult>,
{
    type Item = EventResult;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            match self.inner.next()? {
                Ok(ev) => {
                    let t = ev.event_time_ms();
                    if let Some(start) = self.start_ms
                        && t < start
                    {
                        continue;
                    }
                    if let Some(end) = self.end_ms
                        && t >= end
                    {
                        self.done = true;
                        return None;
                    }
                    return Some(Ok(ev));
                }
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

pub fn slice_event_stream<I>(
    events: I,
    start_ms: Option<i64>,
    end_ms: Option<i64>,
) -> SlicedEventStream<I::IntoIter>
where
    I: IntoIterator<Item = EventResult>,
{
    SlicedEventStream {
        inner: events.into_iter(),
        start_ms,
        end_ms,
        done: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kala_models::{DepthUpdate, MarkPrice, Trade};

    fn trade(t: i64, id: i64) -> MarketEvent {
        MarketEvent::Trade(Trade {
            event_time_ms: t,
            received_time_ns: None,
            symbol: "BTCUSDT".to_string(),
            trade_id: id,
            price: 100.0,
            quantity: 1.0,
            is_buyer_maker: true,
        })
    }

    fn trade_recv(t: i64, id: i64, recv_ns: i64) -> MarketEvent {
        match trade(t, id) {
            MarketEvent::Trade(mut tr) => {
                tr.received_time_ns = Some(recv_ns);
                MarketEvent::Trade(tr)
            }
            _ => unreachable!(),
        }
    }

    fn depth(t: i64, final_id: i64) -> MarketEvent {
        MarketEvent::Depth(DepthUpdate {
            event_time_ms: t,
            received_time_ns: None,
            transaction_time_ms: None,
            symbol: "BTCUSDT".to_string(),
            first_update_id: None,
            final_update_id: final_id,
            prev_final_update_id: None,
            bid_updates: vec![],
            ask_updates: vec![],
        })
    }

    fn mark(t: i64) -> MarketEvent {
        MarketEvent::Mark(MarkPrice {
            event_time_ms: t,
            received_time_ns: None,
            symbol: "BTCUSDT".to_string(),
            mark_price: 100.0,
            index_price: 100.0,
            funding_rate: 0.0,
            next_funding_time_ms: 0,
        })
    }

    fn collect_times(stream: MergedEventStream) -> Vec<i64> {
        stream.map(|r| r.unwrap().event_time_ms()).collect()
    }

    #[test]
    fn merge_orders_by_event_time() {
        let out = collect_times(merge_event_streams(vec![
            vec![trade(1, 1), trade(3, 3)],
            vec![trade(2, 2), trade(4, 4)],
        ]));
        assert_eq!(out, vec![1, 2, 3, 4]);
    }

    #[test]
    fn tie_breaks_by_received_time_when_available() {
        let out: Vec<_> = merge_event_streams(vec![
            vec![trade_recv(1_000, 9, 200)],
            vec![trade_recv(1_000, 9, 100)],
        ])
        .map(|r| r.unwrap().received_time_ns().unwrap())
        .collect();
        assert_eq!(out, vec![100, 200]);
    }

    #[test]
    fn missing_received_time_sorts_last() {
        let out: Vec<_> = merge_event_streams(vec![
            vec![trade(1_000, 9)],
            vec![trade_recv(1_000, 9, 100)],
        ])
        .map(|r| r.unwrap().received_time_ns())
        .collect();
        assert_eq!(out, vec![Some(100), None]);
    }

    #[test]
    fn tie_breaks_by_type_priority_depth_before_trade_before_mark() {
        let out: Vec<_> = merge_event_streams(vec![
            vec![mark(1_000)],
            vec![trade(1_000, 1)],
            vec![depth(1_000, 1)],
        ])
        .map(|r| r.unwrap().kind())
        .collect();
        assert_eq!(out, vec!["depth", "trade", "mark_price"]);
    }

    #[test]
    fn tie_breaks_by_type_specific_id() {
        let out: Vec<_> =
            merge_event_streams(vec![vec![trade(1_000, 200)], vec![trade(1_000, 100)]])
                .map(|r| match r.unwrap() {
                    MarketEvent::Trade(t) => t.trade_id,
                    _ => unreachable!(),
                })
                .collect();
        assert_eq!(out, vec![100, 200]);
    }

    #[test]
    fn tie_breaks_by_source_index_last() {
        // Identical events: source order decides.
        let out: Vec<_> =
            merge_event_streams(vec![vec![trade(1_000, 5)], vec![trade(1_000, 5)]]).collect();
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn merge_is_deterministic_across_runs() {
        let build = || {
            merge_event_streams(vec![
                vec![depth(1, 1), depth(2, 3), trade(2, 9)],
                vec![trade(1, 4), mark(2)],
            ])
            .map(|r| r.unwrap())
            .collect::<Vec<_>>()
        };
        assert_eq!(build(), build());
    }

    #[test]
    fn slice_no_window_yields_all() {
        let events: Vec<EventResult> = (1..=3).map(|t| Ok(trade(t, t))).collect();
        let out: Vec<_> = slice_event_stream(events, None, None)
            .map(|r| r.unwrap().event_time_ms())
            .collect();
        assert_eq!(out, vec![1, 2, 3]);
    }

    #[test]
    fn slice_window_is_half_open() {
        let events: Vec<EventResult> = (1..=4).map(|t| Ok(trade(t, t))).collect();
        let out: Vec<_> = slice_event_stream(events, Some(2), Some(4))
            .map(|r| r.unwrap().event_time_ms())
            .collect();
        assert_eq!(out, vec![2, 3]);
    }

    #[test]
    fn slice_stops_early_at_end() {
        let events: Vec<EventResult> = vec![Ok(trade(1, 1)), Ok(trade(5, 5)), Ok(trade(2, 2))];
        // The stream is assumed ordered; once end is reached iteration fuses.
        let out: Vec<_> = slice_event_stream(events, None, Some(3))
            .map(|r| r.unwrap().event_time_ms())
            .collect();
        assert_eq!(out, vec![1]);
    }

    #[test]
    fn source_error_surfaces_and_is_fatal() {
        let bad: EventSource = Box::new(
            vec![
                Ok(trade(1, 1)),
                Err(EngineError::SchemaError {
                    context: "trades.jsonl".to_string(),
                    detail: "missing field `price`".to_string(),
                }),
            ]
            .into_iter(),
        );
        let good: EventSource = Box::new(vec![Ok(trade(2, 2))].into_iter());
        let results: Vec<_> = MergedEventStream::new(vec![bad, good]).collect();
        assert!(results.iter().any(|r| r.is_err()));
    }
}
