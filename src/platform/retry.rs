//! Deferred re-detection for mints the fast path could not resolve.
//!
//! Unresolved mints are parked here and retried against the authoritative
//! directory on a fixed delay ladder. Resolutions are announced on the event
//! bus; callers keep their provisional `Unknown` until then.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, Instant};
use tracing::{debug, info, instrument, warn};

use super::detector::PlatformDetector;
use crate::transport::{BusEvent, EventBus};

/// Delay ladder and give-up bounds for deferred detection.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub delays: [Duration; 3],
    pub max_age: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            delays: [
                Duration::from_secs(10),
                Duration::from_secs(30),
                Duration::from_secs(60),
            ],
            max_age: Duration::from_secs(300),
        }
    }
}

#[derive(Debug)]
struct PendingRetry {
    mint: String,
    attempts: u32,
    enqueued_at: Instant,
    next_due: Instant,
}

/// Cheap cloneable handle for enqueueing mints from the hot ingestion path.
#[derive(Clone)]
pub struct RetryQueueHandle {
    tx: mpsc::UnboundedSender<String>,
}

impl RetryQueueHandle {
    pub fn enqueue(&self, mint: &str) {
        if self.tx.send(mint.to_string()).is_err() {
            warn!(mint, "detection retry worker is gone; dropping mint");
        }
    }
}

/// Bounded worker that owns the retry queue. One per process.
pub struct DetectionRetryWorker {
    rx: mpsc::UnboundedReceiver<String>,
    detector: Arc<PlatformDetector>,
    bus: EventBus,
    policy: RetryPolicy,
    pending: VecDeque<PendingRetry>,
}

impl DetectionRetryWorker {
    pub fn new(
        detector: Arc<PlatformDetector>,
        bus: EventBus,
        policy: RetryPolicy,
    ) -> (RetryQueueHandle, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            RetryQueueHandle { tx },
            Self {
                rx,
                detector,
                bus,
                policy,
                pending: VecDeque::new(),
            },
        )
    }

    #[instrument(skip(self, shutdown))]
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("detection retry worker started");
        let mut tick = interval(Duration::from_secs(1));

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!(pending = self.pending.len(), "detection retry worker stopping");
                        return;
                    }
                }
                mint = self.rx.recv() => {
                    match mint {
                        Some(mint) => self.admit(mint),
                        None => {
                            info!("retry queue closed; detection retry worker stopping");
                            return;
                        }
                    }
                }
                _ = tick.tick() => {
                    self.process_due().await;
                }
            }
        }
    }

    fn admit(&mut self, mint: String) {
        if self.pending.iter().any(|p| p.mint == mint) {
            return;
        }
        let now = Instant::now();
        debug!(mint = %mint, "mint parked for deferred platform detection");
        self.pending.push_back(PendingRetry {
            mint,
            attempts: 0,
            enqueued_at: now,
            next_due: now + self.policy.delays[0],
        });
    }

    async fn process_due(&mut self) {
        let now = Instant::now();
        let mut remaining = VecDeque::with_capacity(self.pending.len());

        while let Some(mut entry) = self.pending.pop_front() {
            if now.duration_since(entry.enqueued_at) >= self.policy.max_age {
                debug!(mint = %entry.mint, attempts = entry.attempts, "giving up on detection: too old");
                continue;
            }
            if entry.next_due > now {
                remaining.push_back(entry);
                continue;
            }

            entry.attempts += 1;
            let detection = self.detector.detect(&entry.mint).await;
            if detection.platform.is_known() {
                info!(
                    mint = %entry.mint,
                    platform = %detection.platform,
                    attempts = entry.attempts,
                    "deferred detection resolved"
                );
                self.bus.publish(BusEvent::PlatformResolved {
                    mint: entry.mint,
                    platform: detection.platform,
                    confidence: detection.confidence,
                });
                continue;
            }

            if entry.attempts as usize >= self.policy.delays.len() {
                debug!(mint = %entry.mint, "giving up on detection: attempts exhausted");
                continue;
            }
            entry.next_due = now + self.policy.delays[entry.attempts as usize];
            remaining.push_back(entry);
        }

        self.pending = remaining;
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Platform;
    use crate::platform::detector::{DetectorError, ProgramDirectory, PUMP_PROGRAM};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Directory that misses until `succeed_after` calls have been made.
    struct EventualDirectory {
        calls: AtomicU32,
        succeed_after: u32,
    }

    #[async_trait]
    impl ProgramDirectory for EventualDirectory {
        async fn resolve_program(&self, _mint: &str) -> Result<Option<String>, DetectorError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n >= self.succeed_after {
                Ok(Some(PUMP_PROGRAM.to_string()))
            } else {
                Ok(None)
            }
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            delays: [
                Duration::from_millis(0),
                Duration::from_millis(0),
                Duration::from_millis(0),
            ],
            max_age: Duration::from_secs(60),
        }
    }

    #[tokio::test]
    async fn resolved_mint_is_published_on_the_bus() {
        let directory: Arc<dyn ProgramDirectory> = Arc::new(EventualDirectory {
            calls: AtomicU32::new(0),
            succeed_after: 2,
        });
        let detector = Arc::new(PlatformDetector::new(Some(directory), 60, 100));
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        let (handle, mut worker) =
            DetectionRetryWorker::new(detector, bus.clone(), fast_policy());
        handle.enqueue("UnresolvedMint1");
        let mint = worker.rx.recv().await.unwrap();
        worker.admit(mint);

        // First pass misses, second resolves.
        worker.process_due().await;
        assert_eq!(worker.pending_len(), 1);
        worker.process_due().await;
        assert_eq!(worker.pending_len(), 0);

        match rx.recv().await.unwrap() {
            BusEvent::PlatformResolved { mint, platform, confidence } => {
                assert_eq!(mint, "UnresolvedMint1");
                assert_eq!(platform, Platform::Pump);
                assert_eq!(confidence, 0.95);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn gives_up_after_three_attempts() {
        let directory: Arc<dyn ProgramDirectory> = Arc::new(EventualDirectory {
            calls: AtomicU32::new(0),
            succeed_after: u32::MAX,
        });
        let detector = Arc::new(PlatformDetector::new(Some(directory), 60, 100));
        let bus = EventBus::new();

        let (_handle, mut worker) =
            DetectionRetryWorker::new(detector, bus, fast_policy());
        worker.admit("NeverResolves1".to_string());

        worker.process_due().await;
        worker.process_due().await;
        worker.process_due().await;
        assert_eq!(worker.pending_len(), 0);
    }

    #[tokio::test]
    async fn duplicate_enqueues_collapse() {
        let detector = Arc::new(PlatformDetector::new(None, 60, 100));
        let bus = EventBus::new();
        let (_handle, mut worker) = DetectionRetryWorker::new(detector, bus, fast_policy());

        worker.admit("SameMint11".to_string());
        worker.admit("SameMint11".to_string());
        assert_eq!(worker.pending_len(), 1);
    }
}
