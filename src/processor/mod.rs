//! Ingestion processor: the single entry point from the feed into the core.
//!
//! A bounded FIFO feeds one consumer task that validates, deduplicates,
//! fans out to the tracker, and persists batches to the sink. Validation
//! failures are counted and dropped, never propagated.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

use crate::config::ProcessorSettings;
use crate::core::{
    MarketEvent, NewTokenEvent, Platform, TokenSnapshot, Trade, TradeEvent, TradeSide,
};
use crate::platform::{PlatformDetector, RetryQueueHandle};
use crate::sink::{TimeSeriesSink, WriteBatch};
use crate::tracker::{TrackOutcome, Tracker};

const BASE58_ALPHABET: &str = "123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";
const MIN_SIGNATURE_LEN: usize = 10;

#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("ingestion queue full; backpressure applied")]
    Backpressure,
    #[error("processor is stopped")]
    Stopped,
}

enum Input {
    Event(MarketEvent),
    Flush(oneshot::Sender<()>),
    Stop,
}

#[derive(Debug, Default)]
struct SharedCounters {
    processed: AtomicU64,
    validation_errors: AtomicU64,
    dedup_drops: AtomicU64,
    platform_rejections: AtomicU64,
    database_errors: AtomicU64,
    batches_flushed: AtomicU64,
    batches_requeued: AtomicU64,
    queue_depth: AtomicUsize,
}

/// Point-in-time processor counters.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProcessorStats {
    pub processed: u64,
    pub validation_errors: u64,
    pub dedup_drops: u64,
    pub platform_rejections: u64,
    pub database_errors: u64,
    pub batches_flushed: u64,
    pub batches_requeued: u64,
    pub queue_depth: usize,
}

/// Submission handle. Cheap to clone; the worker owns all processing state.
#[derive(Clone)]
pub struct DataProcessor {
    tx: mpsc::Sender<Input>,
    counters: Arc<SharedCounters>,
    submit_deadline: Duration,
}

impl DataProcessor {
    /// Non-blocking enqueue. Waits up to the configured deadline for a queue
    /// slot before reporting backpressure.
    pub async fn submit(&self, event: MarketEvent) -> Result<(), ProcessorError> {
        match self.tx.try_send(Input::Event(event)) {
            Ok(()) => {
                self.counters.queue_depth.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(input)) => {
                match timeout(self.submit_deadline, self.tx.send(input)).await {
                    Ok(Ok(())) => {
                        self.counters.queue_depth.fetch_add(1, Ordering::Relaxed);
                        Ok(())
                    }
                    Ok(Err(_)) => Err(ProcessorError::Stopped),
                    Err(_) => Err(ProcessorError::Backpressure),
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(ProcessorError::Stopped),
        }
    }

    /// Drain everything queued so far and force the batch to the sink.
    pub async fn flush(&self) -> Result<(), ProcessorError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(Input::Flush(ack_tx))
            .await
            .map_err(|_| ProcessorError::Stopped)?;
        ack_rx.await.map_err(|_| ProcessorError::Stopped)
    }

    /// Drain, then quiesce. Further submissions fail with `Stopped`.
    pub async fn stop(&self) {
        let _ = self.tx.send(Input::Stop).await;
    }

    pub fn stats(&self) -> ProcessorStats {
        ProcessorStats {
            processed: self.counters.processed.load(Ordering::Relaxed),
            validation_errors: self.counters.validation_errors.load(Ordering::Relaxed),
            dedup_drops: self.counters.dedup_drops.load(Ordering::Relaxed),
            platform_rejections: self.counters.platform_rejections.load(Ordering::Relaxed),
            database_errors: self.counters.database_errors.load(Ordering::Relaxed),
            batches_flushed: self.counters.batches_flushed.load(Ordering::Relaxed),
            batches_requeued: self.counters.batches_requeued.load(Ordering::Relaxed),
            queue_depth: self.counters.queue_depth.load(Ordering::Relaxed),
        }
    }
}

/// Consumer side. One per processor; owns dedup state and the batch buffer.
pub struct ProcessorWorker {
    rx: mpsc::Receiver<Input>,
    settings: ProcessorSettings,
    fallback_platform: Option<Platform>,
    tracker: Arc<Tracker>,
    detector: Arc<PlatformDetector>,
    retry_queue: Option<RetryQueueHandle>,
    sink: Arc<dyn TimeSeriesSink>,
    counters: Arc<SharedCounters>,
    dedup: HashMap<String, Instant>,
    pending: Vec<MarketEvent>,
    requeued: Option<WriteBatch>,
    consecutive_sink_failures: u32,
    sink_unavailable: bool,
}

impl ProcessorWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: ProcessorSettings,
        fallback_platform: Option<Platform>,
        tracker: Arc<Tracker>,
        detector: Arc<PlatformDetector>,
        retry_queue: Option<RetryQueueHandle>,
        sink: Arc<dyn TimeSeriesSink>,
    ) -> (DataProcessor, Self) {
        let capacity = settings.batch_size.max(1) * 10;
        let (tx, rx) = mpsc::channel(capacity);
        let counters = Arc::new(SharedCounters::default());
        let submit_deadline = Duration::from_millis(settings.submit_deadline_ms);

        let handle = DataProcessor {
            tx,
            counters: counters.clone(),
            submit_deadline,
        };
        let worker = Self {
            rx,
            settings,
            fallback_platform,
            tracker,
            detector,
            retry_queue,
            sink,
            counters,
            dedup: HashMap::new(),
            pending: Vec::new(),
            requeued: None,
            consecutive_sink_failures: 0,
            sink_unavailable: false,
        };
        (handle, worker)
    }

    /// Consumer loop: accumulate until the batch fills or the flush timer
    /// fires, then process the batch as one unit.
    #[instrument(skip(self))]
    pub async fn run(mut self) {
        info!(
            batch_size = self.settings.batch_size,
            flush_interval_ms = self.settings.flush_interval_ms,
            "📦 data processor started"
        );
        let mut flush_timer = interval(Duration::from_millis(self.settings.flush_interval_ms));
        flush_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        flush_timer.tick().await;

        loop {
            tokio::select! {
                input = self.rx.recv() => {
                    match input {
                        Some(Input::Event(event)) => {
                            self.counters.queue_depth.fetch_sub(1, Ordering::Relaxed);
                            self.pending.push(event);
                            if self.pending.len() >= self.settings.batch_size {
                                self.process_batch().await;
                            }
                        }
                        Some(Input::Flush(ack)) => {
                            self.process_batch().await;
                            let _ = ack.send(());
                        }
                        Some(Input::Stop) | None => {
                            self.process_batch().await;
                            info!("data processor stopped");
                            return;
                        }
                    }
                }
                _ = flush_timer.tick() => {
                    self.process_batch().await;
                    self.sweep_dedup();
                }
            }
        }
    }

    /// Process everything accumulated: fan events to the tracker and submit
    /// the three write vectors to the sink in one call.
    async fn process_batch(&mut self) {
        // A batch that failed last cycle goes back at the head.
        let mut batch = self.requeued.take().unwrap_or_default();

        for event in std::mem::take(&mut self.pending) {
            match event {
                MarketEvent::NewToken(event) => self.process_token_event(event, &mut batch),
                MarketEvent::Trade(event) => self.process_trade_event(event, &mut batch),
            }
        }

        self.write_to_sink(batch).await;
    }

    fn process_token_event(&mut self, event: NewTokenEvent, batch: &mut WriteBatch) {
        if let Err(reason) = validate_token_event(&event) {
            self.counters.validation_errors.fetch_add(1, Ordering::Relaxed);
            debug!(mint = %event.mint, reason, "token event dropped");
            return;
        }

        // Arrival-order dedup on a wall clock; late duplicates are dropped
        // regardless of embedded event time.
        let now = Instant::now();
        let window = Duration::from_millis(self.settings.dedup_window_ms);
        if let Some(accepted_at) = self.dedup.get(&event.mint) {
            if now.duration_since(*accepted_at) < window {
                self.counters.dedup_drops.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }

        let (platform, confidence) = match self.resolve_platform(&event.mint) {
            Some(resolved) => resolved,
            None => {
                self.counters.platform_rejections.fetch_add(1, Ordering::Relaxed);
                debug!(mint = %event.mint, "token event rejected: no concrete platform");
                return;
            }
        };

        self.dedup.insert(event.mint.clone(), now);

        let snapshot = TokenSnapshot {
            mint: event.mint,
            symbol: event.symbol,
            name: event.name,
            platform,
            platform_confidence: confidence,
            price: event.price.unwrap_or(0.0),
            volume_24h: event.volume_24h.unwrap_or(0.0),
            market_cap: event.market_cap.unwrap_or(0.0),
            liquidity: event.liquidity.unwrap_or(0.0),
            price_change_24h: 0.0,
            volume_change_24h: 0.0,
            holders: event.holders.unwrap_or(0),
            timestamp: event.timestamp,
            uri: event.uri,
            twitter: None,
            telegram: None,
            website: None,
        };

        match self.tracker.track_token(snapshot.clone()) {
            TrackOutcome::Tracked { price_point, .. } => {
                batch.snapshots.push(snapshot);
                if let Some(point) = price_point {
                    batch.price_points.push(point);
                }
                self.counters.processed.fetch_add(1, Ordering::Relaxed);
            }
            TrackOutcome::SkippedEvaluating => {
                // The feed re-delivers state on its next tick; nothing to
                // persist for a skipped update.
            }
        }
    }

    fn process_trade_event(&mut self, event: TradeEvent, batch: &mut WriteBatch) {
        let side = match validate_trade_event(&event) {
            Ok(side) => side,
            Err(reason) => {
                self.counters.validation_errors.fetch_add(1, Ordering::Relaxed);
                debug!(mint = %event.mint, reason, "trade event dropped");
                return;
            }
        };

        let platform = self
            .tracker
            .get_snapshot(&event.mint)
            .map(|s| s.platform)
            .or_else(|| {
                let detection = self.detector.detect_fast(&event.mint);
                detection.platform.is_known().then_some(detection.platform)
            })
            .or(self.fallback_platform)
            .unwrap_or(Platform::Unknown);

        let trade = Trade {
            mint: event.mint,
            platform,
            side,
            amount: event.amount,
            price: event.price,
            value: event.amount * event.price,
            wallet: event.wallet,
            signature: event.signature,
            timestamp: event.timestamp,
        };

        self.tracker.record_trade(&trade);
        batch.trades.push(trade);
        self.counters.processed.fetch_add(1, Ordering::Relaxed);
    }

    /// Fast-path platform resolution. Unresolved mints are parked for the
    /// retry worker and take the configured fallback, or are rejected when
    /// none is configured.
    fn resolve_platform(&self, mint: &str) -> Option<(Platform, f64)> {
        let detection = self.detector.detect_fast(mint);
        if detection.platform.is_known() {
            return Some((detection.platform, detection.confidence));
        }
        if let Some(retry) = &self.retry_queue {
            retry.enqueue(mint);
        }
        self.fallback_platform.map(|platform| (platform, 0.0))
    }

    async fn write_to_sink(&mut self, batch: WriteBatch) {
        if batch.is_empty() {
            return;
        }

        if self.sink_unavailable {
            match self.sink.health_check().await {
                Ok(()) => {
                    info!("sink recovered; resuming writes");
                    self.sink_unavailable = false;
                    self.consecutive_sink_failures = 0;
                }
                Err(_) => {
                    self.counters.database_errors.fetch_add(1, Ordering::Relaxed);
                    debug!(dropped = batch.len(), "sink unavailable; batch dropped");
                    return;
                }
            }
        }

        match self.sink.write_batch(batch.clone()).await {
            Ok(()) => {
                self.consecutive_sink_failures = 0;
                self.counters.batches_flushed.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.counters.database_errors.fetch_add(1, Ordering::Relaxed);
                self.consecutive_sink_failures += 1;
                if self.consecutive_sink_failures >= 2 {
                    warn!(error = %e, "second consecutive sink failure; failing fast until recovery");
                    self.sink_unavailable = true;
                } else {
                    warn!(error = %e, size = batch.len(), "batch write failed; re-queued at head");
                    self.counters.batches_requeued.fetch_add(1, Ordering::Relaxed);
                    self.requeued = Some(batch);
                }
            }
        }
    }

    fn sweep_dedup(&mut self) {
        let horizon = Duration::from_millis(self.settings.dedup_window_ms * 2);
        let now = Instant::now();
        self.dedup
            .retain(|_, accepted_at| now.duration_since(*accepted_at) < horizon);
    }
}

/// Opaque mint format check: base58 alphabet, mint-key length.
pub fn is_valid_mint(mint: &str) -> bool {
    (32..=44).contains(&mint.len()) && mint.chars().all(|c| BASE58_ALPHABET.contains(c))
}

fn validate_token_event(event: &NewTokenEvent) -> Result<(), &'static str> {
    if !is_valid_mint(&event.mint) {
        return Err("malformed mint");
    }
    if event.symbol.trim().is_empty() {
        return Err("empty symbol");
    }
    if event.price.is_some_and(|p| !p.is_finite() || p < 0.0) {
        return Err("negative price");
    }
    if event.volume_24h.is_some_and(|v| !v.is_finite() || v < 0.0) {
        return Err("negative volume");
    }
    Ok(())
}

fn validate_trade_event(event: &TradeEvent) -> Result<TradeSide, &'static str> {
    if !is_valid_mint(&event.mint) {
        return Err("malformed mint");
    }
    let side = event.side.parse::<TradeSide>().map_err(|_| "bad side")?;
    if !event.amount.is_finite() || event.amount < 0.0 {
        return Err("negative amount");
    }
    if !event.price.is_finite() || event.price < 0.0 {
        return Err("negative price");
    }
    if event.signature.len() < MIN_SIGNATURE_LEN {
        return Err("short signature");
    }
    Ok(side)
}


#[cfg(test)]
impl ProcessorWorker {
    /// Drain whatever is queued right now and run one batch cycle.
    async fn process_one_for_tests(&mut self) {
        while let Ok(input) = self.rx.try_recv() {
            match input {
                Input::Event(event) => {
                    self.counters.queue_depth.fetch_sub(1, Ordering::Relaxed);
                    self.pending.push(event);
                }
                Input::Flush(ack) => {
                    let _ = ack.send(());
                }
                Input::Stop => {}
            }
        }
        self.process_batch().await;
    }
}
