//! WebSocket feed client.
//!
//! Maintains the upstream connection, re-asserts subscriptions after every
//! reconnect, keeps the socket alive with ping/pong, and forwards parsed
//! market events to the processor. Control flows in through a command
//! channel so the tracker never holds a direct reference to the client.

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval, sleep, timeout, MissedTickBehavior};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, instrument, warn};

use super::parser::{parse_frame, FeedMessage};
use crate::config::FeedSettings;
use crate::core::MarketEvent;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("gave up reconnecting after {attempts} attempts")]
    MaxReconnects { attempts: u32 },
}

#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub url: String,
    pub reconnect_delay_ms: u64,
    pub max_reconnect_attempts: u32,
    pub heartbeat_ms: u64,
    pub connect_timeout_ms: u64,
}

impl From<&FeedSettings> for FeedConfig {
    fn from(settings: &FeedSettings) -> Self {
        Self {
            url: settings.url.clone(),
            reconnect_delay_ms: settings.reconnect_delay_ms,
            max_reconnect_attempts: settings.max_reconnect_attempts,
            heartbeat_ms: settings.heartbeat_ms,
            connect_timeout_ms: settings.connect_timeout_ms,
        }
    }
}

/// Events surfaced by the client.
#[derive(Debug, Clone)]
pub enum FeedEvent {
    Market(MarketEvent),
    Connected { url: String },
    /// Subscriptions re-asserted; the connection is serving.
    Ready,
    Disconnected { reason: String },
    SubscriptionAck { message: String },
    MaxReconnectsExceeded { attempts: u32 },
}

#[derive(Debug, Clone)]
pub enum FeedCommand {
    Subscribe(Vec<String>),
    Unsubscribe(Vec<String>),
    Disconnect,
}

#[derive(Debug, Clone, Default)]
pub struct FeedStats {
    pub connection_attempts: u32,
    pub successful_connections: u32,
    pub messages_received: u64,
    pub messages_sent: u64,
}

/// Cloneable control surface over the running client.
#[derive(Clone)]
pub struct FeedHandle {
    command_tx: mpsc::UnboundedSender<FeedCommand>,
    connected: Arc<AtomicBool>,
    subscribed: Arc<RwLock<HashSet<String>>>,
    stats: Arc<RwLock<FeedStats>>,
}

impl FeedHandle {
    pub fn subscribe(&self, mints: Vec<String>) {
        {
            let mut set = self.subscribed.write().unwrap();
            set.extend(mints.iter().cloned());
        }
        let _ = self.command_tx.send(FeedCommand::Subscribe(mints));
    }

    pub fn unsubscribe(&self, mints: Vec<String>) {
        {
            let mut set = self.subscribed.write().unwrap();
            for mint in &mints {
                set.remove(mint);
            }
        }
        let _ = self.command_tx.send(FeedCommand::Unsubscribe(mints));
    }

    pub fn disconnect(&self) {
        let _ = self.command_tx.send(FeedCommand::Disconnect);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn subscribed_mints(&self) -> Vec<String> {
        self.subscribed.read().unwrap().iter().cloned().collect()
    }

    pub fn stats(&self) -> FeedStats {
        self.stats.read().unwrap().clone()
    }
}

enum ConnectionExit {
    Requested,
    Dropped(String),
}

pub struct PumpFeedClient {
    config: FeedConfig,
    event_tx: mpsc::UnboundedSender<FeedEvent>,
    command_rx: mpsc::UnboundedReceiver<FeedCommand>,
    connected: Arc<AtomicBool>,
    subscribed: Arc<RwLock<HashSet<String>>>,
    stats: Arc<RwLock<FeedStats>>,
}

impl PumpFeedClient {
    pub fn new(config: FeedConfig) -> (FeedHandle, Self, mpsc::UnboundedReceiver<FeedEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(false));
        let subscribed = Arc::new(RwLock::new(HashSet::new()));
        let stats = Arc::new(RwLock::new(FeedStats::default()));

        let handle = FeedHandle {
            command_tx,
            connected: connected.clone(),
            subscribed: subscribed.clone(),
            stats: stats.clone(),
        };
        let client = Self {
            config,
            event_tx,
            command_rx,
            connected,
            subscribed,
            stats,
        };
        (handle, client, event_rx)
    }

    /// Connection loop. Returns `Ok` on a requested disconnect, `Err` once
    /// the reconnect budget is exhausted.
    #[instrument(skip(self), fields(url = %self.config.url))]
    pub async fn run(mut self) -> Result<(), FeedError> {
        info!("feed client starting");
        let mut failures: u32 = 0;

        loop {
            self.stats.write().unwrap().connection_attempts += 1;
            let connect = connect_async(self.config.url.as_str());
            match timeout(Duration::from_millis(self.config.connect_timeout_ms), connect).await {
                Ok(Ok((ws, _))) => {
                    info!("feed connected");
                    self.stats.write().unwrap().successful_connections += 1;
                    let _ = self.event_tx.send(FeedEvent::Connected {
                        url: self.config.url.clone(),
                    });

                    let exit = self.handle_connection(ws, &mut failures).await;
                    self.connected.store(false, Ordering::Relaxed);
                    match exit {
                        ConnectionExit::Requested => {
                            let _ = self.event_tx.send(FeedEvent::Disconnected {
                                reason: "disconnect requested".to_string(),
                            });
                            info!("feed client stopped on request");
                            return Ok(());
                        }
                        ConnectionExit::Dropped(reason) => {
                            warn!(reason = %reason, "feed connection dropped");
                            let _ = self.event_tx.send(FeedEvent::Disconnected { reason });
                        }
                    }
                }
                Ok(Err(e)) => {
                    warn!(error = %e, "feed connection failed");
                }
                Err(_) => {
                    warn!(
                        timeout_ms = self.config.connect_timeout_ms,
                        "feed connection timed out"
                    );
                }
            }

            failures += 1;
            if failures >= self.config.max_reconnect_attempts {
                error!(attempts = failures, "feed reconnect budget exhausted");
                let _ = self
                    .event_tx
                    .send(FeedEvent::MaxReconnectsExceeded { attempts: failures });
                return Err(FeedError::MaxReconnects { attempts: failures });
            }
            let delay = reconnect_delay(failures, self.config.reconnect_delay_ms);
            info!(attempt = failures, delay_ms = delay.as_millis() as u64, "scheduling reconnect");
            sleep(delay).await;
        }
    }

    async fn handle_connection(
        &mut self,
        ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
        failures: &mut u32,
    ) -> ConnectionExit {
        let (mut write, mut read) = ws.split();

        // Re-assert the full subscription set before declaring ready.
        if let Err(e) = self.send_subscriptions(&mut write).await {
            return ConnectionExit::Dropped(format!("resubscription failed: {}", e));
        }
        self.connected.store(true, Ordering::Relaxed);
        *failures = 0;
        let _ = self.event_tx.send(FeedEvent::Ready);

        let mut heartbeat = interval(Duration::from_millis(self.config.heartbeat_ms));
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        heartbeat.tick().await; // first tick fires immediately
        let mut missed_pongs: u32 = 0;

        loop {
            tokio::select! {
                frame = read.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            self.stats.write().unwrap().messages_received += 1;
                            self.handle_frame(&text);
                        }
                        Some(Ok(Message::Ping(data))) => {
                            if write.send(Message::Pong(data)).await.is_err() {
                                return ConnectionExit::Dropped("pong send failed".to_string());
                            }
                        }
                        Some(Ok(Message::Pong(_))) => {
                            missed_pongs = 0;
                        }
                        Some(Ok(Message::Close(_))) => {
                            return ConnectionExit::Dropped("closed by remote".to_string());
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            return ConnectionExit::Dropped(e.to_string());
                        }
                        None => {
                            return ConnectionExit::Dropped("stream ended".to_string());
                        }
                    }
                }
                command = self.command_rx.recv() => {
                    match command {
                        Some(FeedCommand::Subscribe(mints)) => {
                            if let Err(e) = self.send_trade_subscription(&mut write, &mints, true).await {
                                return ConnectionExit::Dropped(format!("subscribe failed: {}", e));
                            }
                        }
                        Some(FeedCommand::Unsubscribe(mints)) => {
                            if let Err(e) = self.send_trade_subscription(&mut write, &mints, false).await {
                                return ConnectionExit::Dropped(format!("unsubscribe failed: {}", e));
                            }
                        }
                        Some(FeedCommand::Disconnect) | None => {
                            let _ = write.send(Message::Close(None)).await;
                            return ConnectionExit::Requested;
                        }
                    }
                }
                _ = heartbeat.tick() => {
                    missed_pongs += 1;
                    if missed_pongs > 2 {
                        return ConnectionExit::Dropped("heartbeat timed out".to_string());
                    }
                    if write.send(Message::Ping(Vec::new())).await.is_err() {
                        return ConnectionExit::Dropped("ping send failed".to_string());
                    }
                }
            }
        }
    }

    fn handle_frame(&self, text: &str) {
        match parse_frame(text) {
            FeedMessage::NewToken(event) => {
                let _ = self
                    .event_tx
                    .send(FeedEvent::Market(MarketEvent::NewToken(event)));
            }
            FeedMessage::Trade(event) => {
                let _ = self
                    .event_tx
                    .send(FeedEvent::Market(MarketEvent::Trade(event)));
            }
            FeedMessage::SubscriptionAck { message } => {
                debug!(message = %message, "subscription acknowledged");
                let _ = self.event_tx.send(FeedEvent::SubscriptionAck { message });
            }
            FeedMessage::Unknown { tx_type } => {
                debug!(tx_type = ?tx_type, "dropping unrecognized feed frame");
            }
        }
    }

    async fn send_subscriptions(
        &self,
        write: &mut WsSink,
    ) -> Result<(), tokio_tungstenite::tungstenite::Error> {
        let frame = serde_json::json!({"method": "subscribeNewToken"});
        write.send(Message::Text(frame.to_string())).await?;
        self.stats.write().unwrap().messages_sent += 1;

        let mints = self.subscribed.read().unwrap().iter().cloned().collect::<Vec<_>>();
        if !mints.is_empty() {
            self.send_trade_subscription(&mut *write, &mints, true).await?;
        }
        Ok(())
    }

    async fn send_trade_subscription(
        &self,
        write: &mut WsSink,
        mints: &[String],
        subscribe: bool,
    ) -> Result<(), tokio_tungstenite::tungstenite::Error> {
        if mints.is_empty() {
            return Ok(());
        }
        let method = if subscribe {
            "subscribeTokenTrade"
        } else {
            "unsubscribeTokenTrade"
        };
        let frame = serde_json::json!({"method": method, "keys": mints});
        write.send(Message::Text(frame.to_string())).await?;
        self.stats.write().unwrap().messages_sent += 1;
        debug!(method, count = mints.len(), "trade subscription updated");
        Ok(())
    }
}

/// Capped exponential backoff: `min(base · 2^(attempt-1), 60s)`.
fn reconnect_delay(attempt: u32, base_ms: u64) -> Duration {
    let factor = 1u64 << (attempt.saturating_sub(1)).min(16);
    Duration::from_millis(base_ms.saturating_mul(factor).min(60_000))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps_at_sixty_seconds() {
        assert_eq!(reconnect_delay(1, 5_000), Duration::from_millis(5_000));
        assert_eq!(reconnect_delay(2, 5_000), Duration::from_millis(10_000));
        assert_eq!(reconnect_delay(3, 5_000), Duration::from_millis(20_000));
        assert_eq!(reconnect_delay(4, 5_000), Duration::from_millis(40_000));
        assert_eq!(reconnect_delay(5, 5_000), Duration::from_millis(60_000));
        assert_eq!(reconnect_delay(30, 5_000), Duration::from_millis(60_000));
    }

    #[test]
    fn handle_tracks_subscription_set() {
        let config = FeedConfig {
            url: "wss://feed.example/api/data".to_string(),
            reconnect_delay_ms: 5_000,
            max_reconnect_attempts: 10,
            heartbeat_ms: 30_000,
            connect_timeout_ms: 30_000,
        };
        let (handle, mut client, _events) = PumpFeedClient::new(config);

        handle.subscribe(vec!["A".to_string(), "B".to_string()]);
        handle.unsubscribe(vec!["A".to_string()]);

        assert_eq!(handle.subscribed_mints(), vec!["B".to_string()]);
        assert!(!handle.is_connected());

        // Both commands were queued for the connection task in order.
        assert!(matches!(
            client.command_rx.try_recv().unwrap(),
            FeedCommand::Subscribe(m) if m.len() == 2
        ));
        assert!(matches!(
            client.command_rx.try_recv().unwrap(),
            FeedCommand::Unsubscribe(m) if m == vec!["A".to_string()]
        ));
    }
}
