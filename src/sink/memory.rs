//! In-memory sink implementation backing tests and single-process runs.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

use super::{
    CleanupFilter, PriceBucket, SinkError, SnapshotFilter, TimeRange, TimeSeriesSink, VolumeFilter,
    VolumeRow, WriteBatch,
};
use crate::core::{CleanupEvent, CleanupMetrics, PricePoint, TokenSnapshot, Trade, TradeSide};

/// Append-only tables guarded by one lock; `write_batch` is atomic by
/// construction.
#[derive(Default)]
struct Tables {
    snapshots: Vec<TokenSnapshot>,
    price_points: Vec<PricePoint>,
    trades: Vec<Trade>,
    cleanup_events: Vec<CleanupEvent>,
    cleanup_metrics: Vec<CleanupMetrics>,
}

#[derive(Default)]
pub struct MemorySink {
    tables: Mutex<Tables>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot_count(&self) -> usize {
        self.tables.lock().unwrap().snapshots.len()
    }

    pub fn price_point_count(&self) -> usize {
        self.tables.lock().unwrap().price_points.len()
    }

    pub fn trade_count(&self) -> usize {
        self.tables.lock().unwrap().trades.len()
    }

    pub fn cleanup_events(&self) -> Vec<CleanupEvent> {
        self.tables.lock().unwrap().cleanup_events.clone()
    }

    pub fn cleanup_metrics(&self) -> Vec<CleanupMetrics> {
        self.tables.lock().unwrap().cleanup_metrics.clone()
    }
}

#[async_trait]
impl TimeSeriesSink for MemorySink {
    async fn write_batch(&self, batch: WriteBatch) -> Result<(), SinkError> {
        if batch.is_empty() {
            return Ok(());
        }
        let written = batch.len();
        let mut tables = self.tables.lock().unwrap();
        tables.snapshots.extend(batch.snapshots);
        tables.price_points.extend(batch.price_points);
        tables.trades.extend(batch.trades);
        debug!(written, "memory sink absorbed batch");
        Ok(())
    }

    async fn write_cleanup_event(&self, event: &CleanupEvent) -> Result<(), SinkError> {
        self.tables.lock().unwrap().cleanup_events.push(event.clone());
        Ok(())
    }

    async fn write_cleanup_metrics(&self, metrics: &CleanupMetrics) -> Result<(), SinkError> {
        self.tables.lock().unwrap().cleanup_metrics.push(metrics.clone());
        Ok(())
    }

    async fn query_token_snapshots(
        &self,
        filter: &SnapshotFilter,
    ) -> Result<Vec<TokenSnapshot>, SinkError> {
        let tables = self.tables.lock().unwrap();
        let mut rows: Vec<TokenSnapshot> = tables
            .snapshots
            .iter()
            .filter(|s| filter.mint.as_deref().is_none_or(|m| s.mint == m))
            .filter(|s| filter.platform.is_none_or(|p| s.platform == p))
            .filter(|s| filter.since.is_none_or(|t| s.timestamp >= t))
            .cloned()
            .collect();
        rows.sort_by_key(|s| s.timestamp);
        if let Some(limit) = filter.limit {
            if rows.len() > limit {
                rows.drain(..rows.len() - limit);
            }
        }
        Ok(rows)
    }

    async fn query_price_history(
        &self,
        mint: &str,
        range: TimeRange,
        bucket: chrono::Duration,
    ) -> Result<Vec<PriceBucket>, SinkError> {
        let bucket_ms = bucket.num_milliseconds();
        if bucket_ms <= 0 {
            return Err(SinkError::Query("bucket must be positive".to_string()));
        }

        let tables = self.tables.lock().unwrap();
        let mut buckets: HashMap<i64, (f64, f64, u64)> = HashMap::new();
        for point in tables
            .price_points
            .iter()
            .filter(|p| p.mint == mint && range.contains(p.timestamp))
        {
            let offset_ms = (point.timestamp - range.start).num_milliseconds();
            let slot = offset_ms / bucket_ms;
            let entry = buckets.entry(slot).or_insert((0.0, 0.0, 0));
            entry.0 += point.price;
            entry.1 += point.volume;
            entry.2 += 1;
        }

        let mut rows: Vec<PriceBucket> = buckets
            .into_iter()
            .map(|(slot, (price_sum, volume, count))| PriceBucket {
                bucket_start: range.start + chrono::Duration::milliseconds(slot * bucket_ms),
                mean_price: price_sum / count as f64,
                volume,
                sample_count: count,
            })
            .collect();
        rows.sort_by_key(|b| b.bucket_start);
        Ok(rows)
    }

    async fn query_volume_analysis(
        &self,
        filter: &VolumeFilter,
    ) -> Result<Vec<VolumeRow>, SinkError> {
        let tables = self.tables.lock().unwrap();
        let mut per_mint: HashMap<String, VolumeRow> = HashMap::new();
        for trade in tables
            .trades
            .iter()
            .filter(|t| filter.mint.as_deref().is_none_or(|m| t.mint == m))
            .filter(|t| filter.platform.is_none_or(|p| t.platform == p))
            .filter(|t| filter.range.is_none_or(|r| r.contains(t.timestamp)))
        {
            let row = per_mint.entry(trade.mint.clone()).or_insert_with(|| VolumeRow {
                mint: trade.mint.clone(),
                platform: trade.platform,
                total_volume: 0.0,
                buy_volume: 0.0,
                sell_volume: 0.0,
                trade_count: 0,
            });
            row.total_volume += trade.value;
            match trade.side {
                TradeSide::Buy => row.buy_volume += trade.value,
                TradeSide::Sell => row.sell_volume += trade.value,
            }
            row.trade_count += 1;
        }

        let mut rows: Vec<VolumeRow> = per_mint
            .into_values()
            .filter(|r| filter.min_total_volume.is_none_or(|v| r.total_volume >= v))
            .collect();
        rows.sort_by(|a, b| b.total_volume.total_cmp(&a.total_volume));
        if let Some(limit) = filter.limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }

    async fn query_cleanup_events(
        &self,
        filter: &CleanupFilter,
    ) -> Result<Vec<CleanupEvent>, SinkError> {
        let tables = self.tables.lock().unwrap();
        let mut rows: Vec<CleanupEvent> = tables
            .cleanup_events
            .iter()
            .filter(|e| filter.mint.as_deref().is_none_or(|m| e.mint == m))
            .filter(|e| filter.reason.is_none_or(|r| e.reason == r))
            .filter(|e| filter.range.is_none_or(|r| r.contains(e.timestamp)))
            .cloned()
            .collect();
        rows.sort_by_key(|e| e.timestamp);
        if let Some(limit) = filter.limit {
            if rows.len() > limit {
                rows.drain(..rows.len() - limit);
            }
        }
        Ok(rows)
    }

    async fn health_check(&self) -> Result<(), SinkError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Platform;
    use chrono::{Duration, Utc};

    fn point(mint: &str, price: f64, volume: f64, ts: chrono::DateTime<Utc>) -> PricePoint {
        PricePoint {
            mint: mint.to_string(),
            platform: Platform::Pump,
            price,
            volume,
            timestamp: ts,
            source: "test".to_string(),
        }
    }

    #[tokio::test]
    async fn price_history_buckets_by_mean() {
        let sink = MemorySink::new();
        let start = Utc::now() - Duration::minutes(10);
        let batch = WriteBatch {
            price_points: vec![
                point("A", 1.0, 10.0, start + Duration::minutes(1)),
                point("A", 3.0, 10.0, start + Duration::minutes(2)),
                point("A", 5.0, 5.0, start + Duration::minutes(6)),
                point("B", 100.0, 1.0, start + Duration::minutes(1)),
            ],
            ..Default::default()
        };
        sink.write_batch(batch).await.unwrap();

        let range = TimeRange::new(start, start + Duration::minutes(10));
        let buckets = sink
            .query_price_history("A", range, Duration::minutes(5))
            .await
            .unwrap();

        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[0].mean_price, 2.0);
        assert_eq!(buckets[0].sample_count, 2);
        assert_eq!(buckets[1].mean_price, 5.0);
        assert_eq!(buckets[1].volume, 5.0);
    }

    #[tokio::test]
    async fn volume_analysis_aggregates_by_side() {
        let sink = MemorySink::new();
        let now = Utc::now();
        let trade = |side, value: f64| Trade {
            mint: "A".to_string(),
            platform: Platform::Pump,
            side,
            amount: value,
            price: 1.0,
            value,
            wallet: "W".to_string(),
            signature: "S".repeat(12),
            timestamp: now,
        };
        sink.write_batch(WriteBatch {
            trades: vec![
                trade(TradeSide::Buy, 30.0),
                trade(TradeSide::Sell, 10.0),
                trade(TradeSide::Buy, 5.0),
            ],
            ..Default::default()
        })
        .await
        .unwrap();

        let rows = sink
            .query_volume_analysis(&VolumeFilter::default())
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].total_volume, 45.0);
        assert_eq!(rows[0].buy_volume, 35.0);
        assert_eq!(rows[0].sell_volume, 10.0);
        assert_eq!(rows[0].trade_count, 3);
    }

    #[tokio::test]
    async fn snapshot_filter_honors_limit_keeping_latest() {
        let sink = MemorySink::new();
        let now = Utc::now();
        let snap = |ts| TokenSnapshot {
            mint: "A".to_string(),
            symbol: "A".to_string(),
            name: "A".to_string(),
            platform: Platform::Pump,
            platform_confidence: 0.99,
            price: 1.0,
            volume_24h: 0.0,
            market_cap: 0.0,
            liquidity: 0.0,
            price_change_24h: 0.0,
            volume_change_24h: 0.0,
            holders: 0,
            timestamp: ts,
            uri: None,
            twitter: None,
            telegram: None,
            website: None,
        };
        sink.write_batch(WriteBatch {
            snapshots: vec![
                snap(now - Duration::minutes(3)),
                snap(now - Duration::minutes(2)),
                snap(now - Duration::minutes(1)),
            ],
            ..Default::default()
        })
        .await
        .unwrap();

        let rows = sink
            .query_token_snapshots(&SnapshotFilter {
                limit: Some(2),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].timestamp, now - Duration::minutes(1));
    }
}
