//! Full-pipeline test: JSONL segment -> merged replay -> engine ->
//! reference strategy -> fill analytics.

use std::fs::File;
use std::io::Write;

use kala_engine::broker::{BrokerConfig, SimBroker};
use kala_engine::engine::{BacktestEngine, EngineConfig};
use kala_engine::replay::{SegmentReplayConfig, open_segment};
use kala_engine::report::{max_drawdown, round_trips_from_fills, summarize_round_trips};
use kala_engine::strategies::EntryExitStrategy;
use kala_models::Side;
use tempfile::TempDir;

fn depth_row(t: i64, id: i64, bid: f64, ask: f64) -> String {
    // Sets the new touch and removes the previous one level below it.
    format!(
        r#"{{"event_time_ms":{t},"symbol":"BTCUSDT","final_update_id":{id},"prev_final_update_id":{prev},"bid_updates":[[{bid},5.0],[{old_bid},0.0]],"ask_updates":[[{ask},5.0],[{old_ask},0.0]]}}"#,
        prev = id - 1,
        old_bid = bid - 1.0,
        old_ask = ask - 1.0,
    )
}

fn mark_row(t: i64, price: f64) -> String {
    format!(
        r#"{{"event_time_ms":{t},"symbol":"BTCUSDT","mark_price":{price},"index_price":{price},"funding_rate":0.0,"next_funding_time_ms":0}}"#
    )
}

fn write_segment() -> TempDir {
    let dir = TempDir::new().unwrap();
    let sym = dir.path().join("BTCUSDT");
    std::fs::create_dir_all(&sym).unwrap();

    let mut depth = File::create(sym.join("depth.jsonl")).unwrap();
    // Price grinds up from 100/101 to 104/105 over five updates.
    for (i, px) in [100.0, 101.0, 102.0, 103.0, 104.0].iter().enumerate() {
        writeln!(
            depth,
            "{}",
            depth_row(1_000 + i as i64 * 1_000, i as i64 + 1, *px, px + 1.0)
        )
        .unwrap();
    }

    let mut mark = File::create(sym.join("mark_price.jsonl")).unwrap();
    for (i, px) in [100.5, 101.5, 102.5, 103.5, 104.5].iter().enumerate() {
        writeln!(mark, "{}", mark_row(1_500 + i as i64 * 1_000, *px)).unwrap();
    }

    dir
}

#[test]
fn segment_replay_drives_strategy_and_analytics() {
    let dir = write_segment();
    let replay_cfg = SegmentReplayConfig {
        include_trades: false,
        include_mark_price: true,
        ..SegmentReplayConfig::default()
    };
    let events = open_segment(dir.path(), &replay_cfg).unwrap();

    // Long 1.0 from t=1000, out at t>=3000: buys the ask at 101, sells the
    // bid at 102 or later.
    let mut strategy = EntryExitStrategy::new(
        "BTCUSDT",
        Side::Buy,
        1.0,
        vec![(1_000, 3_000)],
    );

    let engine = BacktestEngine::new(
        EngineConfig {
            tick_interval_ms: 0,
            ..EngineConfig::default()
        },
        SimBroker::new(BrokerConfig {
            maker_fee_frac: 0.0,
            taker_fee_frac: 0.0,
            ..BrokerConfig::default()
        }),
    );
    let result = engine.run(events, &mut strategy).unwrap();

    let fills = result.ctx.fills();
    assert_eq!(fills.len(), 2);
    assert_eq!(fills[0].order_id, "entry_0");
    assert_eq!(fills[0].price, 101.0);
    assert_eq!(fills[1].order_id, "exit_0");
    assert_eq!(fills[1].price, 102.0);
    assert_eq!(result.ctx.broker.portfolio.position_qty("BTCUSDT"), 0.0);

    // One winning long round trip, +1.0 net.
    let trips = round_trips_from_fills(fills);
    assert_eq!(trips.len(), 1);
    assert_eq!(trips[0].direction, Side::Buy);
    assert!((trips[0].net_pnl_usdt - 1.0).abs() < 1e-12);

    let summary = summarize_round_trips(&trips);
    assert_eq!((summary.trades, summary.wins, summary.losses), (1, 1, 0));

    // The equity curve was sampled on mark events and never draws down in
    // this rising tape.
    assert!(!strategy.equity_curve.is_empty());
    assert_eq!(max_drawdown(&strategy.equity_curve), 0.0);
}

#[test]
fn pipeline_is_deterministic_end_to_end() {
    let dir = write_segment();
    let replay_cfg = SegmentReplayConfig {
        include_trades: false,
        include_mark_price: true,
        ..SegmentReplayConfig::default()
    };

    let run = || {
        let events = open_segment(dir.path(), &replay_cfg).unwrap();
        let mut strategy =
            EntryExitStrategy::new("BTCUSDT", Side::Buy, 1.0, vec![(1_000, 3_000)]);
        let engine = BacktestEngine::new(
            EngineConfig {
                tick_interval_ms: 0,
                ..EngineConfig::default()
            },
            SimBroker::new(BrokerConfig {
                maker_fee_frac: 0.0,
                taker_fee_frac: 0.0,
                ..BrokerConfig::default()
            }),
        );
        let result = engine.run(events, &mut strategy).unwrap();
        (result.ctx.fills().to_vec(), strategy.equity_curve)
    };

    let (fills_a, curve_a) = run();
    let (fills_b, curve_b) = run();
    assert_eq!(fills_a, fills_b);
    assert_eq!(curve_a, curve_b);
}
