//! Core domain types shared across the ingestion pipeline and tracker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Origin venue of a tracked token.
///
/// `Unknown` is a transient detection state. Ingestion never stores it on an
/// accepted snapshot unless the configured fallback platform is `Unknown`
/// itself, which configuration validation rejects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Pump,
    Bonk,
    Raydium,
    Unknown,
}

impl Platform {
    pub fn is_known(&self) -> bool {
        !matches!(self, Platform::Unknown)
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Platform::Pump => write!(f, "pump"),
            Platform::Bonk => write!(f, "bonk"),
            Platform::Raydium => write!(f, "raydium"),
            Platform::Unknown => write!(f, "unknown"),
        }
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pump" => Ok(Platform::Pump),
            "bonk" => Ok(Platform::Bonk),
            "raydium" => Ok(Platform::Raydium),
            "unknown" => Ok(Platform::Unknown),
            other => Err(format!("unrecognized platform: {}", other)),
        }
    }
}

/// Canonical record of a token at a timestamp.
///
/// Created on the first accepted new-token event for a mint, overwritten in
/// place on every accepted update, removed only by the cleanup protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenSnapshot {
    pub mint: String,
    pub symbol: String,
    pub name: String,
    pub platform: Platform,
    pub platform_confidence: f64,
    pub price: f64,
    pub volume_24h: f64,
    pub market_cap: f64,
    pub liquidity: f64,
    pub price_change_24h: f64,
    pub volume_change_24h: f64,
    pub holders: u64,
    pub timestamp: DateTime<Utc>,
    pub uri: Option<String>,
    pub twitter: Option<String>,
    pub telegram: Option<String>,
    pub website: Option<String>,
}

/// Single observed price for a mint, appended to the tracker's per-mint ring
/// and persisted to the sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricePoint {
    pub mint: String,
    pub platform: Platform,
    pub price: f64,
    pub volume: f64,
    pub timestamp: DateTime<Utc>,
    pub source: String,
}

/// Direction of a trade as reported by the feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl fmt::Display for TradeSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TradeSide::Buy => write!(f, "buy"),
            TradeSide::Sell => write!(f, "sell"),
        }
    }
}

impl FromStr for TradeSide {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "buy" => Ok(TradeSide::Buy),
            "sell" => Ok(TradeSide::Sell),
            other => Err(format!("unrecognized trade side: {}", other)),
        }
    }
}

/// Executed trade observed on the feed. Write-only from the tracker's
/// perspective: it advances `Health.last_trade_time` and is persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub mint: String,
    pub platform: Platform,
    pub side: TradeSide,
    pub amount: f64,
    pub price: f64,
    pub value: f64,
    pub wallet: String,
    pub signature: String,
    pub timestamp: DateTime<Utc>,
}

/// Per-mint lifecycle bookkeeping owned by the tracker. Never persisted.
#[derive(Debug, Clone)]
pub struct Health {
    pub mint: String,
    pub first_seen_time: DateTime<Utc>,
    pub last_trade_time: DateTime<Utc>,
    pub consecutive_zero_volume_periods: u32,
    pub peak_price: f64,
    pub peak_volume_24h: f64,
    pub current_liquidity: f64,
    pub is_whitelisted: bool,
    pub is_being_evaluated: bool,
}

/// Alert kind: absolute price threshold or percent change from the oldest
/// point in the in-memory price ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertKind {
    Threshold,
    Percentage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertCondition {
    Above,
    Below,
}

/// One-shot price alert. Once `triggered` flips it stays fired until removed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub mint: String,
    pub symbol: String,
    pub kind: AlertKind,
    pub condition: AlertCondition,
    pub value: f64,
    pub enabled: bool,
    pub triggered: bool,
    pub created_at: DateTime<Utc>,
    pub triggered_at: Option<DateTime<Utc>>,
}

/// Caller-supplied alert parameters; id and bookkeeping fields are assigned
/// by the tracker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertSpec {
    pub mint: String,
    pub symbol: String,
    pub kind: AlertKind,
    pub condition: AlertCondition,
    pub value: f64,
}

/// Lookback window used by trend analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrendWindow {
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "24h")]
    H24,
    #[serde(rename = "7d")]
    D7,
}

impl TrendWindow {
    pub const ALL: [TrendWindow; 3] = [TrendWindow::H1, TrendWindow::H24, TrendWindow::D7];

    /// Window length.
    pub fn duration(&self) -> chrono::Duration {
        match self {
            TrendWindow::H1 => chrono::Duration::hours(1),
            TrendWindow::H24 => chrono::Duration::hours(24),
            TrendWindow::D7 => chrono::Duration::days(7),
        }
    }

    /// Aggregation bucket used when reading history for this window.
    pub fn bucket(&self) -> chrono::Duration {
        match self {
            TrendWindow::H1 => chrono::Duration::minutes(5),
            TrendWindow::H24 => chrono::Duration::hours(1),
            TrendWindow::D7 => chrono::Duration::hours(4),
        }
    }
}

impl fmt::Display for TrendWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrendWindow::H1 => write!(f, "1h"),
            TrendWindow::H24 => write!(f, "24h"),
            TrendWindow::D7 => write!(f, "7d"),
        }
    }
}

impl FromStr for TrendWindow {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1h" => Ok(TrendWindow::H1),
            "24h" => Ok(TrendWindow::H24),
            "7d" => Ok(TrendWindow::D7),
            other => Err(format!("unrecognized trend window: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrendDirection {
    Up,
    Down,
    Sideways,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrendStrength {
    Weak,
    Moderate,
    Strong,
}

/// Computed trend for one `(mint, window)` key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trend {
    pub mint: String,
    pub symbol: String,
    pub platform: Platform,
    pub window: TrendWindow,
    pub direction: TrendDirection,
    pub strength: TrendStrength,
    pub change: f64,
    pub change_percent: f64,
    pub confidence: f64,
    pub start_price: f64,
    pub end_price: f64,
    pub volume: f64,
    pub timestamp: DateTime<Utc>,
}

/// Reason a token was untracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupReason {
    Rugged,
    Inactive,
    LowVolume,
}

impl fmt::Display for CleanupReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CleanupReason::Rugged => write!(f, "rugged"),
            CleanupReason::Inactive => write!(f, "inactive"),
            CleanupReason::LowVolume => write!(f, "low_volume"),
        }
    }
}

/// Audit record written on every successful untrack.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupEvent {
    pub mint: String,
    pub symbol: String,
    pub platform: Platform,
    pub reason: CleanupReason,
    pub details: String,
    pub timestamp: DateTime<Utc>,
    pub final_price: f64,
    pub final_volume: f64,
    pub final_liquidity: f64,
    pub final_market_cap: f64,
    pub peak_price: f64,
    pub peak_volume: f64,
    pub tracked_duration_secs: i64,
    pub total_trades: u64,
}

/// Per-cleanup-cycle aggregate, written once per cycle when any candidate
/// was evaluated.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CleanupMetrics {
    pub total_evaluated: u64,
    pub rugged_detected: u64,
    pub inactive_detected: u64,
    pub low_volume_detected: u64,
    pub actually_removed: u64,
    pub saved_by_whitelist: u64,
    pub saved_by_grace_period: u64,
    pub saved_by_limit: u64,
    pub execution_time_ms: u64,
}

/// Normalized new-token / token-update event from the feed, before platform
/// assignment and validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTokenEvent {
    pub mint: String,
    pub symbol: String,
    pub name: String,
    pub price: Option<f64>,
    pub volume_24h: Option<f64>,
    pub market_cap: Option<f64>,
    pub liquidity: Option<f64>,
    pub holders: Option<u64>,
    pub uri: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Normalized trade event from the feed, before validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeEvent {
    pub mint: String,
    pub side: String,
    pub amount: f64,
    pub price: f64,
    pub wallet: String,
    pub signature: String,
    pub timestamp: DateTime<Utc>,
}

/// Closed sum of everything the processor accepts from the feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MarketEvent {
    NewToken(NewTokenEvent),
    Trade(TradeEvent),
}

impl MarketEvent {
    pub fn mint(&self) -> &str {
        match self {
            MarketEvent::NewToken(e) => &e.mint,
            MarketEvent::Trade(e) => &e.mint,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_round_trips_through_display() {
        for p in [Platform::Pump, Platform::Bonk, Platform::Raydium, Platform::Unknown] {
            assert_eq!(p.to_string().parse::<Platform>().unwrap(), p);
        }
    }

    #[test]
    fn cleanup_reason_uses_snake_case() {
        assert_eq!(CleanupReason::LowVolume.to_string(), "low_volume");
        assert_eq!(CleanupReason::Rugged.to_string(), "rugged");
    }

    #[test]
    fn trend_window_durations_are_ordered() {
        assert!(TrendWindow::H1.duration() < TrendWindow::H24.duration());
        assert!(TrendWindow::H24.duration() < TrendWindow::D7.duration());
        assert!(TrendWindow::H1.bucket() < TrendWindow::D7.bucket());
    }
}
