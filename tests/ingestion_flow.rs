//! End-to-end ingestion through the public surface: events in, tracker state
//! and sink rows out.

use chrono::Utc;
use std::sync::Arc;

use pumpwatch::config::{ProcessorSettings, TrackerSettings};
use pumpwatch::core::{MarketEvent, NewTokenEvent, Platform, TradeEvent};
use pumpwatch::platform::PlatformDetector;
use pumpwatch::processor::ProcessorWorker;
use pumpwatch::query::QueryFacade;
use pumpwatch::sink::MemorySink;
use pumpwatch::tracker::Tracker;
use pumpwatch::transport::EventBus;

fn pump_mint(prefix: &str) -> String {
    let mut mint = prefix.to_string();
    while mint.len() < 40 {
        mint.push('A');
    }
    mint.push_str("pump");
    mint
}

fn token_event(mint: &str, price: f64, volume: f64) -> MarketEvent {
    MarketEvent::NewToken(NewTokenEvent {
        mint: mint.to_string(),
        symbol: "TEST".to_string(),
        name: "Test Token".to_string(),
        price: Some(price),
        volume_24h: Some(volume),
        market_cap: Some(1_000.0),
        liquidity: Some(500.0),
        holders: Some(3),
        uri: None,
        timestamp: Utc::now(),
    })
}

fn trade_event(mint: &str, side: &str) -> MarketEvent {
    MarketEvent::Trade(TradeEvent {
        mint: mint.to_string(),
        side: side.to_string(),
        amount: 50.0,
        price: 0.4,
        wallet: "TraderWallet".to_string(),
        signature: "SignatureSignature".to_string(),
        timestamp: Utc::now(),
    })
}

struct Pipeline {
    processor: pumpwatch::DataProcessor,
    tracker: Arc<Tracker>,
    sink: Arc<MemorySink>,
}

fn start_pipeline() -> Pipeline {
    let sink = Arc::new(MemorySink::new());
    let bus = EventBus::new();
    let tracker = Arc::new(
        Tracker::new(
            TrackerSettings {
                min_tokens_to_keep: 1,
                ..TrackerSettings::default()
            },
            60_000,
            sink.clone(),
            bus,
        )
        .unwrap(),
    );
    let detector = Arc::new(PlatformDetector::new(None, 3_600, 1_000));
    let (processor, worker) = ProcessorWorker::new(
        ProcessorSettings::default(),
        None,
        tracker.clone(),
        detector,
        None,
        sink.clone(),
    );
    tokio::spawn(worker.run());
    Pipeline {
        processor,
        tracker,
        sink,
    }
}

#[tokio::test]
async fn events_flow_from_submit_to_tracker_and_sink() {
    let pipeline = start_pipeline();
    let mint_a = pump_mint("FlowAAA");
    let mint_b = pump_mint("FlowBBB");

    pipeline
        .processor
        .submit(token_event(&mint_a, 1.2, 50.0))
        .await
        .unwrap();
    pipeline
        .processor
        .submit(token_event(&mint_b, 0.8, 25.0))
        .await
        .unwrap();
    pipeline
        .processor
        .submit(trade_event(&mint_a, "buy"))
        .await
        .unwrap();
    pipeline.processor.flush().await.unwrap();

    assert_eq!(pipeline.tracker.tracked_count(), 2);
    assert_eq!(pipeline.sink.snapshot_count(), 2);
    assert_eq!(pipeline.sink.price_point_count(), 2);
    assert_eq!(pipeline.sink.trade_count(), 1);

    let snapshot = pipeline.tracker.get_snapshot(&mint_a).unwrap();
    assert_eq!(snapshot.platform, Platform::Pump);
    assert_eq!(snapshot.price, 1.2);

    let stats = pipeline.processor.stats();
    assert_eq!(stats.processed, 3);
    assert_eq!(stats.validation_errors, 0);
}

#[tokio::test]
async fn resubmission_within_dedup_window_is_a_pure_no_op() {
    let pipeline = start_pipeline();
    let mint = pump_mint("DupFlow");

    pipeline
        .processor
        .submit(token_event(&mint, 1.0, 50.0))
        .await
        .unwrap();
    pipeline
        .processor
        .submit(token_event(&mint, 9.0, 999.0))
        .await
        .unwrap();
    pipeline.processor.flush().await.unwrap();

    // One accepted update: one snapshot row, one price point, and the
    // tracker never saw the duplicate's payload.
    assert_eq!(pipeline.sink.snapshot_count(), 1);
    assert_eq!(pipeline.sink.price_point_count(), 1);
    assert_eq!(pipeline.tracker.get_snapshot(&mint).unwrap().price, 1.0);
    assert_eq!(pipeline.processor.stats().dedup_drops, 1);

    let health = pipeline.tracker.get_health(&mint).unwrap();
    assert_eq!(health.peak_price, 1.0);
}

#[tokio::test]
async fn facade_serves_queries_over_live_state() {
    let pipeline = start_pipeline();
    let mint = pump_mint("QueryMe");

    pipeline
        .processor
        .submit(token_event(&mint, 2.0, 75.0))
        .await
        .unwrap();
    pipeline.processor.flush().await.unwrap();

    let facade = QueryFacade::new(
        pipeline.tracker.clone(),
        pipeline.sink.clone(),
        Some(pipeline.processor.clone()),
    );

    let response = facade.current_tokens(Some(Platform::Pump), Some(10));
    assert!(response.success);
    assert_eq!(response.data["tokens"].as_array().unwrap().len(), 1);

    let response = facade.token(&mint);
    assert!(response.success);
    assert_eq!(response.data["snapshot"]["price"], 2.0);

    let response = facade.stats();
    assert!(response.success);
    assert_eq!(response.data["tracker"]["tracked"], 1);
    assert_eq!(response.data["processor"]["processed"], 1);
}

#[tokio::test]
async fn stop_drains_and_then_refuses_submissions() {
    let pipeline = start_pipeline();
    let mint = pump_mint("StopFlow");

    pipeline
        .processor
        .submit(token_event(&mint, 1.0, 10.0))
        .await
        .unwrap();
    pipeline.processor.stop().await;

    // Give the worker a moment to drain and exit.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(pipeline.sink.snapshot_count(), 1);

    let result = pipeline
        .processor
        .submit(token_event(&pump_mint("TooLate"), 1.0, 10.0))
        .await;
    assert!(result.is_err());
}
