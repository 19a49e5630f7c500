//! Time-series sink interface.
//!
//! The core only depends on this trait. Implementations may be SQL,
//! time-series, in-memory, or a hybrid; `write_batch` is atomic per call and
//! every operation surfaces failure to the caller.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::{CleanupEvent, CleanupMetrics, CleanupReason, Platform, PricePoint, TokenSnapshot, Trade};

pub use memory::MemorySink;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink unavailable: {0}")]
    Unavailable(String),
    #[error("write failed: {0}")]
    Write(String),
    #[error("query failed: {0}")]
    Query(String),
}

/// One atomic write unit produced by the processor's batch cycle.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    pub snapshots: Vec<TokenSnapshot>,
    pub price_points: Vec<PricePoint>,
    pub trades: Vec<Trade>,
}

impl WriteBatch {
    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty() && self.price_points.is_empty() && self.trades.is_empty()
    }

    pub fn len(&self) -> usize {
        self.snapshots.len() + self.price_points.len() + self.trades.len()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts <= self.end
    }

    /// Trailing range ending now.
    pub fn last(window: chrono::Duration) -> Self {
        let end = Utc::now();
        Self {
            start: end - window,
            end,
        }
    }
}

/// One aggregated bucket of price history. Only non-empty buckets are
/// returned; `sample_count` is always at least 1.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceBucket {
    pub bucket_start: DateTime<Utc>,
    pub mean_price: f64,
    pub volume: f64,
    pub sample_count: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnapshotFilter {
    pub mint: Option<String>,
    pub platform: Option<Platform>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeRow {
    pub mint: String,
    pub platform: Platform,
    pub total_volume: f64,
    pub buy_volume: f64,
    pub sell_volume: f64,
    pub trade_count: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VolumeFilter {
    pub mint: Option<String>,
    pub platform: Option<Platform>,
    pub range: Option<TimeRange>,
    pub min_total_volume: Option<f64>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CleanupFilter {
    pub mint: Option<String>,
    pub reason: Option<CleanupReason>,
    pub range: Option<TimeRange>,
    pub limit: Option<usize>,
}

#[async_trait]
pub trait TimeSeriesSink: Send + Sync {
    /// Persist one processor batch. All-or-nothing per call.
    async fn write_batch(&self, batch: WriteBatch) -> Result<(), SinkError>;

    async fn write_cleanup_event(&self, event: &CleanupEvent) -> Result<(), SinkError>;

    async fn write_cleanup_metrics(&self, metrics: &CleanupMetrics) -> Result<(), SinkError>;

    async fn query_token_snapshots(
        &self,
        filter: &SnapshotFilter,
    ) -> Result<Vec<TokenSnapshot>, SinkError>;

    /// Bucketed mean-price aggregation over `range`.
    async fn query_price_history(
        &self,
        mint: &str,
        range: TimeRange,
        bucket: chrono::Duration,
    ) -> Result<Vec<PriceBucket>, SinkError>;

    async fn query_volume_analysis(
        &self,
        filter: &VolumeFilter,
    ) -> Result<Vec<VolumeRow>, SinkError>;

    async fn query_cleanup_events(
        &self,
        filter: &CleanupFilter,
    ) -> Result<Vec<CleanupEvent>, SinkError>;

    /// Cheap probe used to recover from the fail-fast state after consecutive
    /// write failures.
    async fn health_check(&self) -> Result<(), SinkError>;
}
