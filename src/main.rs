//! Composition root: wires the feed, processor, tracker, analyzer, and
//! cleanup driver together over the event bus.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tokio::time::{interval, Duration};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pumpwatch::config::Config;
use pumpwatch::ingest::{FeedConfig, FeedEvent, PumpFeedClient};
use pumpwatch::platform::{
    DetectionRetryWorker, HttpProgramDirectory, PlatformDetector, ProgramDirectory, RetryPolicy,
};
use pumpwatch::processor::{ProcessorError, ProcessorWorker};
use pumpwatch::query::QueryFacade;
use pumpwatch::sink::{MemorySink, TimeSeriesSink};
use pumpwatch::tracker::{Tracker, TrendAnalyzer};
use pumpwatch::transport::{BusEvent, EventBus};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_file(false)
                .with_line_number(false),
        )
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pumpwatch=info,warn".into()),
        )
        .init();

    info!("👀 Starting pumpwatch - live token stream tracker");

    let config = match std::env::args().nth(1) {
        Some(path) => Config::load_from_file(&path)
            .with_context(|| format!("loading config from {}", path))?,
        None => Config::from_env().context("building config from environment")?,
    };
    for warning in config.validate().context("validating configuration")? {
        warn!(warning = %warning, "configuration warning");
    }

    let bus = EventBus::new();
    let sink: Arc<dyn TimeSeriesSink> = Arc::new(MemorySink::new());

    let directory = config
        .platform
        .directory_url
        .clone()
        .map(|url| Arc::new(HttpProgramDirectory::new(url)) as Arc<dyn ProgramDirectory>);
    let detector = Arc::new(PlatformDetector::new(
        directory,
        config.platform.detection_cache_ttl_secs,
        config.platform.detection_cache_max_entries,
    ));
    let (retry_handle, retry_worker) =
        DetectionRetryWorker::new(detector.clone(), bus.clone(), RetryPolicy::default());

    let tracker = Arc::new(
        Tracker::new(
            config.tracker.clone(),
            config.analysis.analysis_interval_ms,
            sink.clone(),
            bus.clone(),
        )
        .context("constructing tracker")?,
    );

    let (processor, processor_worker) = ProcessorWorker::new(
        config.processor.clone(),
        config.platform.fallback_platform,
        tracker.clone(),
        detector.clone(),
        Some(retry_handle),
        sink.clone(),
    );

    let (feed_handle, feed_client, mut feed_events) =
        PumpFeedClient::new(FeedConfig::from(&config.feed));
    let analyzer = TrendAnalyzer::new(
        tracker.clone(),
        sink.clone(),
        bus.clone(),
        config.analysis.analysis_interval_ms,
    );
    let facade = QueryFacade::new(tracker.clone(), sink.clone(), Some(processor.clone()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(processor_worker.run());
    tokio::spawn(retry_worker.run(shutdown_rx.clone()));
    tokio::spawn(analyzer.run(shutdown_rx.clone()));
    {
        let tracker = tracker.clone();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { tracker.run_cleanup_loop(shutdown).await });
    }
    tokio::spawn(async move {
        if let Err(e) = feed_client.run().await {
            error!(error = %e, "feed client terminated");
        }
    });

    // Feed → processor pump.
    {
        let processor = processor.clone();
        let bus = bus.clone();
        tokio::spawn(async move {
            while let Some(event) = feed_events.recv().await {
                match event {
                    FeedEvent::Market(event) => match processor.submit(event).await {
                        Ok(()) => {}
                        Err(ProcessorError::Backpressure) => {
                            warn!("processor backpressure; feed event dropped");
                        }
                        Err(ProcessorError::Stopped) => break,
                    },
                    FeedEvent::Ready => info!("feed ready; subscriptions re-asserted"),
                    FeedEvent::Connected { url } => info!(url = %url, "feed connected"),
                    FeedEvent::Disconnected { reason } => {
                        warn!(reason = %reason, "feed disconnected");
                    }
                    FeedEvent::SubscriptionAck { .. } => {}
                    FeedEvent::MaxReconnectsExceeded { attempts } => {
                        bus.publish(BusEvent::FeedError {
                            error: format!("feed gave up after {} reconnect attempts", attempts),
                        });
                    }
                }
            }
        });
    }

    // Bus → feed routing: the tracker never references the client directly.
    {
        let feed_handle = feed_handle.clone();
        let tracker = tracker.clone();
        let mut bus_events = bus.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = bus_events.recv().await {
                match event {
                    BusEvent::TokenTracked { mint, .. } => {
                        feed_handle.subscribe(vec![mint]);
                    }
                    BusEvent::TokenCleanedUp { mint, reason, details, .. } => {
                        info!(mint = %mint, reason = %reason, details = %details, "token cleaned up");
                        feed_handle.unsubscribe(vec![mint]);
                    }
                    BusEvent::PlatformResolved { mint, platform, confidence } => {
                        tracker.update_platform(&mint, platform, confidence);
                    }
                    BusEvent::AlertTriggered { alert, snapshot } => {
                        info!(
                            alert_id = %alert.id,
                            mint = %alert.mint,
                            price = snapshot.price,
                            "🔔 alert triggered"
                        );
                    }
                    BusEvent::TrendDetected { trend } => {
                        info!(
                            mint = %trend.mint,
                            window = %trend.window,
                            direction = ?trend.direction,
                            change_percent = trend.change_percent,
                            "trend detected"
                        );
                    }
                    BusEvent::FeedError { error } => {
                        error!(error = %error, "feed error; reads and cleanup continue");
                    }
                    _ => {}
                }
            }
        });
    }

    // Periodic status report plus graceful shutdown on CTRL+C.
    let mut status_timer = interval(Duration::from_secs(300));
    status_timer.tick().await;
    loop {
        tokio::select! {
            _ = status_timer.tick() => {
                let stats = facade.stats();
                info!(stats = %stats.data, "📊 status");
            }
            _ = signal::ctrl_c() => {
                info!("🛑 shutdown signal received");
                break;
            }
        }
    }

    let _ = shutdown_tx.send(true);
    processor.stop().await;
    feed_handle.disconnect();
    info!("pumpwatch shutdown complete");
    Ok(())
}
