//! # Segment Replay Adapter
//!
//! Reads captured JSONL market-data segments and hands the engine one
//! merged, time-ordered event stream.
//!
//! Segment layout: one subdirectory per symbol, each holding optional
//! per-source files (`depth.jsonl`, `trades.jsonl`, `mark_price.jsonl`,
//! `ticker.jsonl`, `open_interest.jsonl`, `liquidations.jsonl`), one JSON
//! object per line in the canonical event schema.
//!
//! Captures are not always physically ordered (writer interleaving), so
//! each source is checked against its natural sort key - depth by
//! `final_update_id`, trades by `trade_id`, the rest by `event_time_ms` -
//! and re-sorted in memory when needed. The in-memory sort is bounded by
//! `sort_row_limit`; exceeding it fails with `ResourceExhausted` rather
//! than silently ballooning. Ordered files stream lazily, one buffered line
//! at a time, and their handles close when the stream is dropped.

use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::DateTime;
use kala_models::{
    DepthUpdate, EngineError, Liquidation, MarkPrice, MarketEvent, OpenInterest, Ticker, Trade,
};
use serde::{Deserialize, Serialize};

use crate::merge::{EventResult, EventSource, MergedEventStream, slice_event_stream};

/// Per-source re-sort policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortMode {
    /// Scan each file first; re-sort only the ones that need it.
    #[default]
    Auto,
    /// Always load and re-sort (still bounded by the row limit).
    Always,
    /// Trust the physical order and stream directly.
    Never,
}

/// Replay configuration. Every default is explicit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentReplayConfig {
    pub include_depth: bool,
    pub include_trades: bool,
    pub include_mark_price: bool,
    pub include_ticker: bool,
    pub include_open_interest: bool,
    pub include_liquidations: bool,
    /// Half-open replay window `[start_ms, end_ms)`, applied per source
    /// before merging.
    pub start_ms: Option<i64>,
    pub end_ms: Option<i64>,
    pub sort_mode: SortMode,
    /// Ceiling on rows a single source may hold in memory for re-sorting.
    pub sort_row_limit: usize,
}

impl Default for SegmentReplayConfig {
    fn default() -> Self {
        Self {
            include_depth: true,
            include_trades: true,
            include_mark_price: false,
            include_ticker: false,
            include_open_interest: false,
            include_liquidations: false,
            start_ms: None,
            end_ms: None,
            sort_mode: SortMode::Auto,
            sort_row_limit: 5_000_000,
        }
    }
}

/// The event sources a segment may contain, in merge order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SourceKind {
    Depth,
    Trades,
    MarkPrice,
    Ticker,
    OpenInterest,
    Liquidations,
}

impl SourceKind {
    const ALL: [SourceKind; 6] = [
        SourceKind::Depth,
        SourceKind::Trades,
        SourceKind::MarkPrice,
        SourceKind::Ticker,
        SourceKind::OpenInterest,
        SourceKind::Liquidations,
    ];

    fn file_name(self) -> &'static str {
        match self {
            SourceKind::Depth => "depth.jsonl",
            SourceKind::Trades => "trades.jsonl",
            SourceKind::MarkPrice => "mark_price.jsonl",
            SourceKind::Ticker => "ticker.jsonl",
            SourceKind::OpenInterest => "open_interest.jsonl",
            SourceKind::Liquidations => "liquidations.jsonl",
        }
    }

    fn enabled(self, cfg: &SegmentReplayConfig) -> bool {
        match self {
            SourceKind::Depth => cfg.include_depth,
            SourceKind::Trades => cfg.include_trades,
            SourceKind::MarkPrice => cfg.include_mark_price,
            SourceKind::Ticker => cfg.include_ticker,
            SourceKind::OpenInterest => cfg.include_open_interest,
            SourceKind::Liquidations => cfg.include_liquidations,
        }
    }

    fn parse(self, line: &str, context: &str) -> EventResult {
        let parsed = match self {
            SourceKind::Depth => serde_json::from_str::<DepthUpdate>(line).map(MarketEvent::Depth),
            SourceKind::Trades => serde_json::from_str::<Trade>(line).map(MarketEvent::Trade),
            SourceKind::MarkPrice => serde_json::from_str::<MarkPrice>(line).map(MarketEvent::Mark),
            SourceKind::Ticker => serde_json::from_str::<Ticker>(line).map(MarketEvent::Ticker),
            SourceKind::OpenInterest => {
                serde_json::from_str::<OpenInterest>(line).map(MarketEvent::OpenInterest)
            }
            SourceKind::Liquidations => {
                serde_json::from_str::<Liquidation>(line).map(MarketEvent::Liquidation)
            }
        };
        parsed.map_err(|e| EngineError::SchemaError {
            context: context.to_string(),
            detail: e.to_string(),
        })
    }

    /// Natural per-source ordering key: captures interleave physically, and
    /// this key restores the exchange stream order.
    fn sort_key(self, event: &MarketEvent) -> i64 {
        match (self, event) {
            (SourceKind::Depth, MarketEvent::Depth(d)) => d.final_update_id,
            (SourceKind::Trades, MarketEvent::Trade(t)) => t.trade_id,
            _ => event.event_time_ms(),
        }
    }
}

/// Lazy line-by-line event iterator over one JSONL file.
struct JsonlEventIter {
    lines: Lines<BufReader<File>>,
    kind: SourceKind,
    context: String,
}

impl JsonlEventIter {
    fn open(path: &Path, kind: SourceKind, context: String) -> Result<Self, EngineError> {
        let file = File::open(path).map_err(|e| EngineError::Io {
            context: context.clone(),
            source: e,
        })?;
        Ok(Self {
            lines: BufReader::new(file).lines(),
            kind,
            context,
        })
    }
}

impl Iterator for JsonlEventIter {
    type Item = EventResult;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.lines.next()? {
                Ok(line) if line.trim().is_empty() => continue,
                Ok(line) => return Some(self.kind.parse(&line, &self.context)),
                Err(e) => {
                    return Some(Err(EngineError::Io {
                        context: self.context.clone(),
                        source: e,
                    }));
                }
            }
        }
    }
}

/// Outcome of the cheap ordering scan.
struct ScanOutcome {
    rows: usize,
    sorted: bool,
}

fn scan_source(path: &Path, kind: SourceKind, context: &str) -> Result<ScanOutcome, EngineError> {
    let mut rows = 0usize;
    let mut sorted = true;
    let mut prev_key: Option<i64> = None;

    for item in JsonlEventIter::open(path, kind, context.to_string())? {
        let event = item?;
        rows += 1;
        let key = kind.sort_key(&event);
        if let Some(prev) = prev_key
            && key < prev
        {
            sorted = false;
        }
        prev_key = Some(key);
    }

    Ok(ScanOutcome { rows, sorted })
}

fn load_sorted(
    path: &Path,
    kind: SourceKind,
    context: &str,
    row_limit: usize,
) -> Result<Vec<MarketEvent>, EngineError> {
    let mut events = Vec::new();
    for item in JsonlEventIter::open(path, kind, context.to_string())? {
        events.push(item?);
        if events.len() > row_limit {
            return Err(EngineError::ResourceExhausted {
                context: context.to_string(),
                rows: events.len(),
                limit: row_limit,
            });
        }
    }
    // Stable sort: rows sharing a key keep their physical order.
    events.sort_by_key(|ev| kind.sort_key(ev));
    Ok(events)
}

/// Open one source file as an ordered event iterator.
///
/// `Auto` scans first and re-sorts only when the physical order is broken;
/// disordered files (and `Always`) are loaded in memory, bounded by
/// `sort_row_limit`.
fn open_source(
    path: &Path,
    kind: SourceKind,
    cfg: &SegmentReplayConfig,
) -> Result<EventSource, EngineError> {
    let context = path.display().to_string();

    let needs_sort = match cfg.sort_mode {
        SortMode::Always => true,
        SortMode::Never => false,
        SortMode::Auto => {
            let scan = scan_source(path, kind, &context)?;
            if !scan.sorted {
                // The sort budget only applies when a sort is actually
                // needed; ordered files stream at any size.
                if scan.rows > cfg.sort_row_limit {
                    return Err(EngineError::ResourceExhausted {
                        context,
                        rows: scan.rows,
                        limit: cfg.sort_row_limit,
                    });
                }
                tracing::debug!(source = %context, rows = scan.rows, "source needs re-sort");
            }
            !scan.sorted
        }
    };

    if needs_sort {
        let events = load_sorted(path, kind, &context, cfg.sort_row_limit)?;
        Ok(Box::new(events.into_iter().map(Ok)))
    } else {
        Ok(Box::new(JsonlEventIter::open(path, kind, context)?))
    }
}

/// Open a segment directory and build the merged replay stream.
///
/// Symbol subdirectories are discovered in name order and each enabled
/// source becomes one merge input, time-sliced to the configured window
/// before merging. Fails when the directory yields no sources at all.
pub fn open_segment(segment_dir: &Path, cfg: &SegmentReplayConfig) -> Result<MergedEventStream> {
    let mut symbol_dirs: Vec<PathBuf> = Vec::new();
    for entry in std::fs::read_dir(segment_dir)
        .with_context(|| format!("open segment directory {segment_dir:?}"))?
    {
        let path = entry?.path();
        if !path.is_dir() {
            continue;
        }
        let name_is_symbol = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| !n.is_empty() && n.chars().all(|c| c.is_alphanumeric()));
        if name_is_symbol {
            symbol_dirs.push(path);
        }
    }
    // Directory read order is filesystem-dependent; sort so the merge
    // tie-break of last resort (source index) is reproducible.
    symbol_dirs.sort();

    let mut sources: Vec<EventSource> = Vec::new();
    for dir in &symbol_dirs {
        for kind in SourceKind::ALL {
            if !kind.enabled(cfg) {
                continue;
            }
            let path = dir.join(kind.file_name());
            if !path.exists() {
                continue;
            }
            let source = open_source(&path, kind, cfg)?;
            if cfg.start_ms.is_some() || cfg.end_ms.is_some() {
                sources.push(Box::new(slice_event_stream(source, cfg.start_ms, cfg.end_ms)));
            } else {
                sources.push(source);
            }
        }
    }

    if sources.is_empty() {
        anyhow::bail!("no event sources found in segment directory {segment_dir:?}");
    }

    tracing::info!(
        segment = %segment_dir.display(),
        sources = sources.len(),
        window = %describe_window(cfg.start_ms, cfg.end_ms),
        "segment opened"
    );

    Ok(MergedEventStream::new(sources))
}

fn describe_window(start_ms: Option<i64>, end_ms: Option<i64>) -> String {
    let fmt = |ms: Option<i64>| {
        ms.and_then(DateTime::from_timestamp_millis)
            .map(|dt| dt.to_rfc3339())
            .unwrap_or_else(|| "open".to_string())
    };
    format!("[{}, {})", fmt(start_ms), fmt(end_ms))
}
