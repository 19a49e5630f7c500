//! Periodic trend analysis over the sink's aggregated price history.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

use super::Tracker;
use crate::core::{Trend, TrendDirection, TrendStrength, TrendWindow};
use crate::sink::{PriceBucket, TimeRange, TimeSeriesSink};
use crate::transport::{BusEvent, EventBus};

/// Computed trend figures before they are attached to a mint.
#[derive(Debug)]
struct TrendFigures {
    direction: TrendDirection,
    strength: TrendStrength,
    change: f64,
    change_percent: f64,
    confidence: f64,
    start_price: f64,
    end_price: f64,
    volume: f64,
}

pub struct TrendAnalyzer {
    tracker: Arc<Tracker>,
    sink: Arc<dyn TimeSeriesSink>,
    bus: EventBus,
    interval_ms: u64,
}

impl TrendAnalyzer {
    pub fn new(
        tracker: Arc<Tracker>,
        sink: Arc<dyn TimeSeriesSink>,
        bus: EventBus,
        interval_ms: u64,
    ) -> Self {
        Self {
            tracker,
            sink,
            bus,
            interval_ms,
        }
    }

    #[instrument(skip(self, shutdown))]
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_ms = self.interval_ms, "📈 trend analyzer started");
        let mut timer = interval(Duration::from_millis(self.interval_ms));
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        timer.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("trend analyzer stopping");
                        return;
                    }
                }
                _ = timer.tick() => {
                    let emitted = self.analyze_once().await;
                    if emitted > 0 {
                        debug!(emitted, "trend pass emitted changes");
                    }
                }
            }
        }
    }

    /// One full pass over every tracked mint and window. Returns how many
    /// trends were announced.
    pub async fn analyze_once(&self) -> usize {
        let mut emitted = 0;
        for snapshot in self.tracker.get_all() {
            for window in TrendWindow::ALL {
                match self.analyze_window(&snapshot.mint, window).await {
                    Some(figures) => {
                        let trend = Trend {
                            mint: snapshot.mint.clone(),
                            symbol: snapshot.symbol.clone(),
                            platform: snapshot.platform,
                            window,
                            direction: figures.direction,
                            strength: figures.strength,
                            change: figures.change,
                            change_percent: figures.change_percent,
                            confidence: figures.confidence,
                            start_price: figures.start_price,
                            end_price: figures.end_price,
                            volume: figures.volume,
                            timestamp: chrono::Utc::now(),
                        };
                        if self.tracker.install_trend(trend.clone()) {
                            emitted += 1;
                            self.bus.publish(BusEvent::TrendDetected { trend });
                        }
                    }
                    None => continue,
                }
            }
        }
        emitted
    }

    async fn analyze_window(&self, mint: &str, window: TrendWindow) -> Option<TrendFigures> {
        let range = TimeRange::last(window.duration());
        let buckets = match self
            .sink
            .query_price_history(mint, range, window.bucket())
            .await
        {
            Ok(buckets) => buckets,
            Err(e) => {
                warn!(mint, window = %window, error = %e, "price history query failed");
                return None;
            }
        };
        compute_trend(&buckets)
    }
}

/// Pure trend math over aggregated buckets. Needs at least two buckets and a
/// positive starting price.
fn compute_trend(buckets: &[PriceBucket]) -> Option<TrendFigures> {
    if buckets.len() < 2 {
        return None;
    }
    let start_price = buckets.first()?.mean_price;
    let end_price = buckets.last()?.mean_price;
    if start_price <= 0.0 {
        return None;
    }

    let change = end_price - start_price;
    let change_percent = 100.0 * change / start_price;

    let direction = if change_percent > 2.0 {
        TrendDirection::Up
    } else if change_percent < -2.0 {
        TrendDirection::Down
    } else {
        TrendDirection::Sideways
    };

    let volatility = returns_volatility(buckets);
    let strength = if change_percent.abs() > 20.0 && volatility < 0.1 {
        TrendStrength::Strong
    } else if change_percent.abs() > 10.0 && volatility < 0.2 {
        TrendStrength::Moderate
    } else {
        TrendStrength::Weak
    };

    // Coverage half: buckets seen against a 20-bucket yardstick. Density
    // half: full credit only when every bucket carried samples.
    let coverage = (buckets.len() as f64 / 20.0).min(1.0);
    let density = if buckets.iter().all(|b| b.sample_count > 0) {
        1.0
    } else {
        0.5
    };
    let confidence = (coverage + density) / 2.0;

    Some(TrendFigures {
        direction,
        strength,
        change,
        change_percent,
        confidence,
        start_price,
        end_price,
        volume: buckets.iter().map(|b| b.volume).sum(),
    })
}

/// Sample standard deviation of per-bucket returns.
fn returns_volatility(buckets: &[PriceBucket]) -> f64 {
    let returns: Vec<f64> = buckets
        .windows(2)
        .filter(|w| w[0].mean_price > 0.0)
        .map(|w| (w[1].mean_price - w[0].mean_price) / w[0].mean_price)
        .collect();
    if returns.len() < 2 {
        return 0.0;
    }
    let mean = returns.iter().sum::<f64>() / returns.len() as f64;
    let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>()
        / (returns.len() - 1) as f64;
    variance.sqrt()
}
