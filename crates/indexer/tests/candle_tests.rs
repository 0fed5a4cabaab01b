mod common;

use std::{sync::Arc, time::Duration};

use ammlook_indexer::{
    candles::{CandleEngine, RolloverScheduler},
    clock::ManualClock,
    metrics::IndexerMetrics,
    models::{Candle, Pair, Reserves, TradeRecord},
    registry::PairRegistry,
    resolution::{Resolution, ResolutionSet},
    store::{RuntimeStore, Store},
};
use bigdecimal::BigDecimal;
use common::*;
use proptest::prelude::*;
use tokio_util::sync::CancellationToken;

fn engine(store: &RuntimeStore, clock: &ManualClock, resolutions: &[&str]) -> CandleEngine {
    CandleEngine::new(
        Arc::new(store.clone()),
        ResolutionSet::parse(resolutions).unwrap(),
        10,
        Arc::new(clock.clone()),
        IndexerMetrics::unregistered().unwrap(),
    )
}

fn ohlcv(candle: &Candle) -> [String; 5] {
    [
        candle.open.to_string(),
        candle.high.to_string(),
        candle.low.to_string(),
        candle.close.to_string(),
        candle.volume.to_string(),
    ]
}

#[tokio::test]
async fn hourly_candle_follows_carried_close_then_goes_flat() {
    let trades = vec![
        trade("con_x", "8.0", "1", 5_400),
        trade("con_x", "10", "2", 7_250),
        trade("con_x", "9", "3", 7_300),
    ];

    // bulk path
    let bulk = RuntimeStore::new();
    bulk.insert_trades(&trades).await.unwrap();
    let clock = ManualClock::new(10_900);
    engine(&bulk, &clock, &["1h"])
        .backfill_contract("con_x")
        .await
        .unwrap();

    let candles = bulk.candles("con_x", "1h", None, None).await.unwrap();
    let epochs: Vec<i64> = candles.iter().map(|c| c.epoch).collect();
    assert_eq!(epochs, vec![1, 2, 3]);
    assert_eq!(candles[1].time, 7_200);
    assert_eq!(candles[1].open, dec("8.0"));
    assert_eq!(candles[1].high, dec("10"));
    assert_eq!(candles[1].low, dec("8.0"));
    assert_eq!(candles[1].close, dec("9"));
    assert_eq!(candles[1].volume, dec("5"));
    assert_eq!(ohlcv(&candles[2]), ["9", "9", "9", "9", "0"]);
    assert_eq!(bulk.candle_meta("con_x").await.unwrap().unwrap().precision, 0);

    // live path: carried close 8.0 at 7200, two trades, then a rollover
    let live = RuntimeStore::new();
    let clock = ManualClock::new(7_200);
    let live_engine = engine(&live, &clock, &["1h"]);
    live_engine.seed_genesis("con_x", &dec("8.0")).await.unwrap();
    live_engine.apply_trade(&trades[1]).await.unwrap();
    live_engine.apply_trade(&trades[2]).await.unwrap();
    clock.set(10_900);
    let hourly: Resolution = "1h".parse().unwrap();
    live_engine
        .roll_over(&hourly, 3, &["con_x".to_string()])
        .await
        .unwrap();

    let live_candles = live.candles("con_x", "1h", None, None).await.unwrap();
    assert_eq!(live_candles, candles[1..].to_vec());
}

#[tokio::test(start_paused = true)]
async fn rollover_scheduler_opens_the_next_epoch_and_stops_on_cancel() {
    let store = RuntimeStore::new();
    store
        .upsert_pairs(&[Pair {
            contract_name: "con_x".into(),
            token_symbol: "X".into(),
            reserves: Reserves::zero(),
        }])
        .await
        .unwrap();
    let clock = ManualClock::new(10_000);
    let engine = Arc::new(engine(&store, &clock, &["1h"]));
    engine.seed_genesis("con_x", &dec("4.2")).await.unwrap();

    let registry = Arc::new(PairRegistry::new());
    registry.refresh(&store).await.unwrap();

    let cancel = CancellationToken::new();
    let scheduler = RolloverScheduler::start(engine.clone(), registry, cancel.clone());
    assert_eq!(scheduler.resolutions(), ["1h"]);
    assert_eq!(scheduler.len(), 1);

    // timers alone do not roll over while the wall clock is behind
    tokio::time::sleep(Duration::from_secs(900)).await;
    assert_eq!(store.latest_candle("con_x", "1h").await.unwrap().unwrap().epoch, 2);

    clock.set(10_800);
    tokio::time::sleep(Duration::from_secs(900)).await;
    let active = store.latest_candle("con_x", "1h").await.unwrap().unwrap();
    assert_eq!(active.epoch, 3);
    assert_eq!(active.time, 10_800);
    assert_eq!(ohlcv(&active), ["4.2", "4.2", "4.2", "4.2", "0"]);

    scheduler.shutdown().await;
    assert!(cancel.is_cancelled());
}

fn price_strategy() -> impl Strategy<Value = String> {
    (1u32..2_000_000).prop_map(|units| format!("{}.{:03}", units / 1_000, units % 1_000))
}

fn trades_strategy() -> impl Strategy<Value = Vec<(i64, String, u32)>> {
    prop::collection::vec((0i64..5_400, price_strategy(), 0u32..500), 1..40)
}

fn build_trades(steps: &[(i64, String, u32)]) -> Vec<TradeRecord> {
    let mut time = 1_000_000;
    steps
        .iter()
        .map(|(gap, price, amount)| {
            time += gap;
            trade("con_p", price, &amount.to_string(), time)
        })
        .collect()
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

const PROP_RESOLUTIONS: &[&str] = &["15m", "1h", "1d"];

async fn bulk_candles(trades: &[TradeRecord], now: i64) -> RuntimeStore {
    let store = RuntimeStore::new();
    store.insert_trades(trades).await.unwrap();
    let clock = ManualClock::new(now);
    engine(&store, &clock, PROP_RESOLUTIONS)
        .backfill_contract("con_p")
        .await
        .unwrap();
    store
}

/// Feeds trades one at a time, rolling each resolution over when a trade
/// crosses into a new epoch, the way a live process would.
async fn replayed_candles(trades: &[TradeRecord], now: i64) -> RuntimeStore {
    let store = RuntimeStore::new();
    let clock = ManualClock::new(trades[0].time);
    let engine = engine(&store, &clock, PROP_RESOLUTIONS);
    let contracts = vec!["con_p".to_string()];

    engine.seed_genesis("con_p", &trades[0].price).await.unwrap();
    for trade in trades {
        clock.set(trade.time);
        for resolution in engine.resolutions() {
            engine
                .roll_over(resolution, resolution.epoch_of(trade.time), &contracts)
                .await
                .unwrap();
        }
        engine.apply_trade(trade).await.unwrap();
    }
    clock.set(now);
    for resolution in engine.resolutions() {
        engine
            .roll_over(resolution, resolution.epoch_of(now), &contracts)
            .await
            .unwrap();
    }
    store
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn bulk_backfill_matches_incremental_replay(steps in trades_strategy(), tail in 0i64..200_000) {
        let trades = build_trades(&steps);
        let now = trades.last().unwrap().time + tail;
        runtime().block_on(async {
            let bulk = bulk_candles(&trades, now).await;
            let replayed = replayed_candles(&trades, now).await;
            for resolution in PROP_RESOLUTIONS {
                let expected = bulk.candles("con_p", resolution, None, None).await.unwrap();
                let actual = replayed.candles("con_p", resolution, None, None).await.unwrap();
                prop_assert_eq!(expected, actual, "resolution {}", resolution);
            }
            Ok(())
        })?;
    }

    #[test]
    fn candles_are_bounded_continuous_and_sum_volume(steps in trades_strategy(), tail in 0i64..200_000) {
        let trades = build_trades(&steps);
        let now = trades.last().unwrap().time + tail;
        runtime().block_on(async {
            let store = bulk_candles(&trades, now).await;
            for label in PROP_RESOLUTIONS {
                let resolution: Resolution = label.parse().unwrap();
                let candles = store.candles("con_p", label, None, None).await.unwrap();
                prop_assert_eq!(candles.last().unwrap().epoch, resolution.epoch_of(now));

                for pair in candles.windows(2) {
                    prop_assert_eq!(pair[1].epoch, pair[0].epoch + 1);
                    prop_assert_eq!(&pair[1].open, &pair[0].close);
                }
                for candle in &candles {
                    prop_assert!(candle.low <= candle.open.clone().min(candle.close.clone()));
                    prop_assert!(candle.high >= candle.open.clone().max(candle.close.clone()));
                    let start = resolution.bucket_start(candle.epoch);
                    let end = resolution.bucket_end(candle.epoch);
                    let in_window: Vec<&TradeRecord> = trades
                        .iter()
                        .filter(|t| t.time >= start && t.time < end)
                        .collect();
                    let volume: BigDecimal = in_window.iter().map(|t| t.amount.clone()).sum();
                    prop_assert_eq!(&candle.volume, &volume);
                    if in_window.is_empty() {
                        prop_assert_eq!(&candle.high, &candle.open);
                        prop_assert_eq!(&candle.low, &candle.open);
                        prop_assert_eq!(&candle.close, &candle.open);
                    }
                }
            }
            Ok(())
        })?;
    }
}
