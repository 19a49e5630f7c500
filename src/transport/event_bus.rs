//! Broadcast event bus carrying tracker and pipeline events.
//!
//! The tracker never holds a reference to the feed client; untrack output
//! travels over this bus and the composition root routes it back into the
//! client as an unsubscribe command.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::core::{
    Alert, CleanupMetrics, CleanupReason, Platform, TokenSnapshot, Trend,
};

/// Events emitted by the core. Consumers subscribe through [`EventBus`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BusEvent {
    TokenTracked {
        mint: String,
        price: f64,
    },
    AlertTriggered {
        alert: Alert,
        snapshot: TokenSnapshot,
    },
    TrendDetected {
        trend: Trend,
    },
    TokenCleanedUp {
        mint: String,
        symbol: String,
        platform: Platform,
        reason: CleanupReason,
        details: String,
    },
    CleanupMetricsReady {
        metrics: CleanupMetrics,
    },
    PlatformResolved {
        mint: String,
        platform: Platform,
        confidence: f64,
    },
    EmergencyStop {
        reason: String,
    },
    EmergencyCleanupCompleted {
        removed: u64,
        reason: String,
    },
    EmergencyWhitelistUpdated {
        mints: Vec<String>,
        added: bool,
        reason: String,
    },
    FeedError {
        error: String,
    },
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BusEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1000);
        debug!("EventBus initialized with capacity: 1000");
        Self { tx }
    }

    /// Publish an event to all subscribers. Lagging or absent subscribers are
    /// not an error; a send failure only means nobody is listening.
    pub fn publish(&self, event: BusEvent) {
        match self.tx.send(event) {
            Ok(subscriber_count) => {
                debug!(subscriber_count, "published bus event");
            }
            Err(_) => {
                warn!("bus event dropped: no active subscribers");
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(BusEvent::TokenTracked {
            mint: "MintA".to_string(),
            price: 0.5,
        });

        match rx.recv().await.unwrap() {
            BusEvent::TokenTracked { mint, price } => {
                assert_eq!(mint, "MintA");
                assert_eq!(price, 0.5);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn publish_without_subscribers_does_not_panic() {
        let bus = EventBus::new();
        bus.publish(BusEvent::FeedError {
            error: "closed".to_string(),
        });
    }
}
