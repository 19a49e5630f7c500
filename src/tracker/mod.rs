//! In-memory token population and every policy that decides whether a
//! tracked token continues to be tracked.
//!
//! All mutable state sits behind one `RwLock`; mutations never interleave.
//! Methods that touch the sink (cleanup, trend installation) do their IO
//! outside the lock so readers stay unblocked.

pub mod alerts;
pub mod cleanup;
pub mod health;
pub mod trends;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::config::TrackerSettings;
use crate::core::{
    Alert, AlertSpec, Health, PricePoint, TokenSnapshot, Trade, Trend, TrendWindow,
};
use crate::sink::TimeSeriesSink;
use crate::transport::{BusEvent, EventBus};

pub use trends::TrendAnalyzer;

/// Per-mint price ring capacity.
pub(crate) const PRICE_HISTORY_CAP: usize = 1_000;

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("invalid tracker configuration: {0}")]
    Config(String),
    #[error("mint {0} is already tracked")]
    AlreadyTracked(String),
    #[error("cleanup percentage {0} outside (0, 0.5]")]
    InvalidPercentage(f64),
    #[error("emergency stop is latched: {0}")]
    EmergencyStopped(String),
}

/// Outcome of one `track_token` call, consumed by the processor.
#[derive(Debug)]
pub enum TrackOutcome {
    Tracked {
        is_new: bool,
        price_point: Option<PricePoint>,
    },
    /// The mint is under cleanup evaluation; the update was dropped and the
    /// feed will re-deliver state on the next tick.
    SkippedEvaluating,
}

/// Five derived index sets, rebuilt per accepted update.
#[derive(Debug, Default)]
pub(crate) struct Indices {
    pub new_tokens: HashSet<String>,
    pub recently_active: HashSet<String>,
    pub inactive: HashSet<String>,
    pub low_volume: HashSet<String>,
    pub rugged_candidates: HashSet<String>,
}

impl Indices {
    fn remove(&mut self, mint: &str) {
        self.new_tokens.remove(mint);
        self.recently_active.remove(mint);
        self.inactive.remove(mint);
        self.low_volume.remove(mint);
        self.rugged_candidates.remove(mint);
    }
}

#[derive(Debug, Default)]
pub(crate) struct EmergencyState {
    pub stopped: bool,
    pub stop_reason: Option<String>,
    pub cleanup_paused: bool,
    pub disable_all_cleanup: bool,
    pub force_minimum_tokens: bool,
    pub emergency_whitelist: HashSet<String>,
}

/// Override toggles settable at runtime.
#[derive(Debug, Clone, Copy)]
pub enum Override {
    DisableAllCleanup(bool),
    ForceMinimumTokens(bool),
}

#[derive(Debug, Default)]
pub(crate) struct TrackerState {
    pub current: HashMap<String, TokenSnapshot>,
    pub history: HashMap<String, VecDeque<PricePoint>>,
    pub health: HashMap<String, Health>,
    pub alerts: HashMap<String, Alert>,
    pub trends: HashMap<(String, TrendWindow), Trend>,
    pub trade_counts: HashMap<String, u64>,
    pub indices: Indices,
    pub emergency: EmergencyState,
}

/// Point-in-time counters for the query surface.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TrackerStats {
    pub tracked: usize,
    pub max_tokens_tracked: usize,
    pub new_tokens: usize,
    pub recently_active: usize,
    pub inactive: usize,
    pub low_volume: usize,
    pub rugged_candidates: usize,
    pub alerts: usize,
    pub trends: usize,
    pub cleanup_cycles: u64,
    pub total_untracked: u64,
    pub cleanup_paused: bool,
    pub emergency_stopped: bool,
}

pub struct Tracker {
    pub(crate) settings: TrackerSettings,
    pub(crate) state: RwLock<TrackerState>,
    pub(crate) sink: Arc<dyn TimeSeriesSink>,
    pub(crate) bus: EventBus,
    pub(crate) whitelist: HashSet<String>,
    alert_seq: AtomicU64,
    pub(crate) cleanup_gate: tokio::sync::Mutex<()>,
    pub(crate) cleanup_cycles: AtomicU64,
    pub(crate) total_untracked: AtomicU64,
}

impl Tracker {
    /// Construct and validate. Warnings are logged; hard errors refuse start.
    pub fn new(
        settings: TrackerSettings,
        analysis_interval_ms: u64,
        sink: Arc<dyn TimeSeriesSink>,
        bus: EventBus,
    ) -> Result<Self, TrackerError> {
        let warnings = settings
            .validate(analysis_interval_ms)
            .map_err(|e| TrackerError::Config(e.to_string()))?;
        for warning in &warnings {
            warn!(warning = %warning, "tracker configuration warning");
        }

        let whitelist: HashSet<String> = settings.whitelist.iter().cloned().collect();
        info!(
            grace_period_ms = settings.grace_period_ms,
            inactivity_threshold_ms = settings.inactivity_threshold_ms,
            cleanup_interval_ms = settings.cleanup_interval_ms,
            whitelist = whitelist.len(),
            "tracker initialized"
        );

        Ok(Self {
            settings,
            state: RwLock::new(TrackerState::default()),
            sink,
            bus,
            whitelist,
            alert_seq: AtomicU64::new(1),
            cleanup_gate: tokio::sync::Mutex::new(()),
            cleanup_cycles: AtomicU64::new(0),
            total_untracked: AtomicU64::new(0),
        })
    }

    // ---------------------------------------------------------------- update

    /// Upsert a snapshot: overwrite current, advance health, append to the
    /// price ring, fire alerts, rebuild index membership.
    #[instrument(skip(self, snapshot), fields(mint = %snapshot.mint))]
    pub fn track_token(&self, snapshot: TokenSnapshot) -> TrackOutcome {
        let mint = snapshot.mint.clone();
        let (is_new, price_point, triggered) = {
            let mut state = self.state.write().unwrap();

            if state
                .health
                .get(&mint)
                .map(|h| h.is_being_evaluated)
                .unwrap_or(false)
            {
                debug!("update skipped: mint under cleanup evaluation");
                return TrackOutcome::SkippedEvaluating;
            }

            let is_new = !state.current.contains_key(&mint);
            state.apply_snapshot(&snapshot, &self.whitelist, &self.settings);

            let price_point = if snapshot.price > 0.0 {
                let point = PricePoint {
                    mint: mint.clone(),
                    platform: snapshot.platform,
                    price: snapshot.price,
                    volume: snapshot.volume_24h,
                    timestamp: snapshot.timestamp,
                    source: "feed".to_string(),
                };
                state.append_price_point(point.clone());
                Some(point)
            } else {
                None
            };

            let triggered = alerts::evaluate_for_mint(&mut state, &mint);
            state.rebuild_indices_for(&mint, &self.settings);

            (is_new, price_point, triggered)
        };

        if is_new {
            self.bus.publish(BusEvent::TokenTracked {
                mint: mint.clone(),
                price: price_point.as_ref().map(|p| p.price).unwrap_or(0.0),
            });
        }
        for (alert, snapshot) in triggered {
            info!(alert_id = %alert.id, mint = %alert.mint, "alert triggered");
            self.bus.publish(BusEvent::AlertTriggered { alert, snapshot });
        }

        TrackOutcome::Tracked { is_new, price_point }
    }

    /// Advance `last_trade_time` for the traded mint. Unknown mints are a
    /// no-op; the feed may deliver trades for tokens that were untracked a
    /// moment earlier.
    pub fn record_trade(&self, trade: &Trade) {
        let mut state = self.state.write().unwrap();
        let Some(health) = state.health.get_mut(&trade.mint) else {
            return;
        };
        if trade.timestamp > health.last_trade_time {
            health.last_trade_time = trade.timestamp;
        }
        *state.trade_counts.entry(trade.mint.clone()).or_insert(0) += 1;
        let mint = trade.mint.clone();
        state.rebuild_indices_for(&mint, &self.settings);
    }

    /// Re-admit a previously untracked mint with fresh health, as if seen for
    /// the first time.
    pub fn retrack_token(
        &self,
        snapshot: TokenSnapshot,
        reason: Option<&str>,
    ) -> Result<(), TrackerError> {
        {
            let state = self.state.read().unwrap();
            if state.current.contains_key(&snapshot.mint) {
                return Err(TrackerError::AlreadyTracked(snapshot.mint));
            }
        }
        info!(mint = %snapshot.mint, reason = reason.unwrap_or("unspecified"), "re-tracking token");
        self.track_token(snapshot);
        Ok(())
    }

    /// Apply a deferred platform resolution to an already-tracked snapshot.
    pub fn update_platform(
        &self,
        mint: &str,
        platform: crate::core::Platform,
        confidence: f64,
    ) -> bool {
        let mut state = self.state.write().unwrap();
        match state.current.get_mut(mint) {
            Some(snapshot) => {
                snapshot.platform = platform;
                snapshot.platform_confidence = confidence;
                true
            }
            None => false,
        }
    }

    // ----------------------------------------------------------------- reads

    pub fn get_snapshot(&self, mint: &str) -> Option<TokenSnapshot> {
        self.state.read().unwrap().current.get(mint).cloned()
    }

    pub fn get_all(&self) -> Vec<TokenSnapshot> {
        self.state.read().unwrap().current.values().cloned().collect()
    }

    pub fn tracked_count(&self) -> usize {
        self.state.read().unwrap().current.len()
    }

    pub fn tracked_mints(&self) -> Vec<String> {
        self.state.read().unwrap().current.keys().cloned().collect()
    }

    /// Most recent `limit` points for a mint, oldest first.
    pub fn get_history(&self, mint: &str, limit: usize) -> Vec<PricePoint> {
        let state = self.state.read().unwrap();
        match state.history.get(mint) {
            Some(ring) => {
                let skip = ring.len().saturating_sub(limit);
                ring.iter().skip(skip).cloned().collect()
            }
            None => Vec::new(),
        }
    }

    pub fn get_health(&self, mint: &str) -> Option<Health> {
        self.state.read().unwrap().health.get(mint).cloned()
    }

    pub fn stats(&self) -> TrackerStats {
        let state = self.state.read().unwrap();
        TrackerStats {
            tracked: state.current.len(),
            max_tokens_tracked: self.settings.max_tokens_tracked,
            new_tokens: state.indices.new_tokens.len(),
            recently_active: state.indices.recently_active.len(),
            inactive: state.indices.inactive.len(),
            low_volume: state.indices.low_volume.len(),
            rugged_candidates: state.indices.rugged_candidates.len(),
            alerts: state.alerts.len(),
            trends: state.trends.len(),
            cleanup_cycles: self.cleanup_cycles.load(Ordering::Relaxed),
            total_untracked: self.total_untracked.load(Ordering::Relaxed),
            cleanup_paused: state.emergency.cleanup_paused,
            emergency_stopped: state.emergency.stopped,
        }
    }

    // ---------------------------------------------------------------- alerts

    /// Register a one-shot alert. Ids are a monotonic counter plus a random
    /// suffix so restarts never collide with persisted references.
    pub fn add_alert(&self, spec: AlertSpec) -> String {
        let seq = self.alert_seq.fetch_add(1, Ordering::Relaxed);
        let id = format!("alert-{}-{:08x}", seq, rand::random::<u32>());
        let alert = Alert {
            id: id.clone(),
            mint: spec.mint,
            symbol: spec.symbol,
            kind: spec.kind,
            condition: spec.condition,
            value: spec.value,
            enabled: true,
            triggered: false,
            created_at: chrono::Utc::now(),
            triggered_at: None,
        };
        self.state.write().unwrap().alerts.insert(id.clone(), alert);
        id
    }

    pub fn remove_alert(&self, id: &str) -> bool {
        self.state.write().unwrap().alerts.remove(id).is_some()
    }

    pub fn get_alerts(&self) -> Vec<Alert> {
        self.state.read().unwrap().alerts.values().cloned().collect()
    }

    // ---------------------------------------------------------------- trends

    pub fn get_trend(&self, mint: &str, window: TrendWindow) -> Option<Trend> {
        self.state
            .read()
            .unwrap()
            .trends
            .get(&(mint.to_string(), window))
            .cloned()
    }

    pub fn get_all_trends(&self) -> Vec<Trend> {
        self.state.read().unwrap().trends.values().cloned().collect()
    }

    /// Install a freshly computed trend. Returns true when the change is
    /// significant enough to announce: no prior trend, direction or strength
    /// flipped, or the percent change moved by more than five points.
    pub fn install_trend(&self, trend: Trend) -> bool {
        let mut state = self.state.write().unwrap();
        let key = (trend.mint.clone(), trend.window);
        let emit = match state.trends.get(&key) {
            None => true,
            Some(prior) => {
                prior.direction != trend.direction
                    || prior.strength != trend.strength
                    || (prior.change_percent - trend.change_percent).abs() > 5.0
            }
        };
        state.trends.insert(key, trend);
        emit
    }

    // ----------------------------------------------------- emergency control

    /// Latch the emergency stop. Cleanup refuses to run until
    /// [`Tracker::resume_cleanup`].
    pub fn emergency_stop(&self, reason: &str) {
        warn!(reason, "🛑 emergency stop engaged");
        {
            let mut state = self.state.write().unwrap();
            state.emergency.stopped = true;
            state.emergency.stop_reason = Some(reason.to_string());
        }
        self.bus.publish(BusEvent::EmergencyStop {
            reason: reason.to_string(),
        });
    }

    pub fn pause_cleanup(&self, reason: &str) {
        info!(reason, "cleanup paused");
        self.state.write().unwrap().emergency.cleanup_paused = true;
    }

    /// Clears both the pause flag and a latched emergency stop.
    pub fn resume_cleanup(&self, reason: &str) {
        info!(reason, "cleanup resumed");
        let mut state = self.state.write().unwrap();
        state.emergency.cleanup_paused = false;
        state.emergency.stopped = false;
        state.emergency.stop_reason = None;
    }

    pub fn set_override(&self, setting: Override, reason: &str) {
        info!(?setting, reason, "cleanup override updated");
        let mut state = self.state.write().unwrap();
        match setting {
            Override::DisableAllCleanup(v) => state.emergency.disable_all_cleanup = v,
            Override::ForceMinimumTokens(v) => state.emergency.force_minimum_tokens = v,
        }
    }

    pub fn add_emergency_whitelist(&self, mints: Vec<String>, reason: &str) {
        info!(count = mints.len(), reason, "emergency whitelist extended");
        {
            let mut state = self.state.write().unwrap();
            state.emergency.emergency_whitelist.extend(mints.iter().cloned());
        }
        self.bus.publish(BusEvent::EmergencyWhitelistUpdated {
            mints,
            added: true,
            reason: reason.to_string(),
        });
    }

    pub fn remove_emergency_whitelist(&self, mints: Vec<String>, reason: &str) {
        info!(count = mints.len(), reason, "emergency whitelist reduced");
        {
            let mut state = self.state.write().unwrap();
            for mint in &mints {
                state.emergency.emergency_whitelist.remove(mint);
            }
        }
        self.bus.publish(BusEvent::EmergencyWhitelistUpdated {
            mints,
            added: false,
            reason: reason.to_string(),
        });
    }

}
