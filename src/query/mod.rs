//! Read-only query projections over tracker state and sink history.
//!
//! Every projection folds failure into a structured response instead of an
//! error type, so a tool caller always gets `{success, query_type, ...}`.

use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tracing::debug;

use crate::core::{Platform, TrendWindow};
use crate::processor::DataProcessor;
use crate::sink::{CleanupFilter, TimeRange, TimeSeriesSink, VolumeFilter};
use crate::tracker::Tracker;

#[derive(Debug, Clone, Serialize)]
pub struct QueryResponse {
    pub success: bool,
    pub query_type: String,
    pub data: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl QueryResponse {
    fn ok(query_type: &str, data: serde_json::Value) -> Self {
        Self {
            success: true,
            query_type: query_type.to_string(),
            data,
            error: None,
        }
    }

    fn err(query_type: &str, error: String) -> Self {
        Self {
            success: false,
            query_type: query_type.to_string(),
            data: serde_json::Value::Null,
            error: Some(error),
        }
    }
}

pub struct QueryFacade {
    tracker: Arc<Tracker>,
    sink: Arc<dyn TimeSeriesSink>,
    processor: Option<DataProcessor>,
}

impl QueryFacade {
    pub fn new(
        tracker: Arc<Tracker>,
        sink: Arc<dyn TimeSeriesSink>,
        processor: Option<DataProcessor>,
    ) -> Self {
        Self {
            tracker,
            sink,
            processor,
        }
    }

    /// Currently tracked tokens, optionally filtered by platform, sorted by
    /// 24h volume descending.
    pub fn current_tokens(&self, platform: Option<Platform>, limit: Option<usize>) -> QueryResponse {
        let mut tokens = self.tracker.get_all();
        if let Some(platform) = platform {
            tokens.retain(|t| t.platform == platform);
        }
        tokens.sort_by(|a, b| b.volume_24h.total_cmp(&a.volume_24h));
        if let Some(limit) = limit {
            tokens.truncate(limit);
        }
        debug!(count = tokens.len(), "current tokens query");
        QueryResponse::ok("current_tokens", json!({ "tokens": tokens }))
    }

    pub fn token(&self, mint: &str) -> QueryResponse {
        match self.tracker.get_snapshot(mint) {
            Some(snapshot) => QueryResponse::ok(
                "token",
                json!({
                    "snapshot": snapshot,
                    "history_points": self.tracker.get_history(mint, 100),
                }),
            ),
            None => QueryResponse::err("token", format!("mint {} is not tracked", mint)),
        }
    }

    /// Bucketed price history for one trend window, straight from the sink.
    pub async fn price_history(&self, mint: &str, window: TrendWindow) -> QueryResponse {
        let range = TimeRange::last(window.duration());
        match self
            .sink
            .query_price_history(mint, range, window.bucket())
            .await
        {
            Ok(buckets) => QueryResponse::ok(
                "price_history",
                json!({ "mint": mint, "window": window.to_string(), "buckets": buckets }),
            ),
            Err(e) => QueryResponse::err("price_history", e.to_string()),
        }
    }

    pub fn trends(&self, mint: Option<&str>) -> QueryResponse {
        let trends = match mint {
            Some(mint) => TrendWindow::ALL
                .iter()
                .filter_map(|w| self.tracker.get_trend(mint, *w))
                .collect(),
            None => self.tracker.get_all_trends(),
        };
        QueryResponse::ok("trends", json!({ "trends": trends }))
    }

    pub async fn volume_analysis(&self, filter: VolumeFilter) -> QueryResponse {
        match self.sink.query_volume_analysis(&filter).await {
            Ok(rows) => QueryResponse::ok("volume_analysis", json!({ "rows": rows })),
            Err(e) => QueryResponse::err("volume_analysis", e.to_string()),
        }
    }

    pub async fn cleanup_history(&self, limit: Option<usize>) -> QueryResponse {
        let filter = CleanupFilter {
            limit,
            ..Default::default()
        };
        match self.sink.query_cleanup_events(&filter).await {
            Ok(events) => QueryResponse::ok("cleanup_history", json!({ "events": events })),
            Err(e) => QueryResponse::err("cleanup_history", e.to_string()),
        }
    }

    pub fn stats(&self) -> QueryResponse {
        let tracker = self.tracker.stats();
        let processor = self.processor.as_ref().map(|p| p.stats());
        QueryResponse::ok(
            "stats",
            json!({ "tracker": tracker, "processor": processor }),
        )
    }
}
