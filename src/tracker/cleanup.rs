//! Rule-based lifecycle cleanup.
//!
//! One transaction per cycle: evaluate candidates read-only under the
//! concurrent-update guard, confirm and untrack within the per-cycle limit
//! and population floor, then write metrics. Guard flags are cleared on
//! every exit path, including unwind.

use chrono::{Duration, Utc};
use std::collections::BTreeSet;
use std::sync::atomic::Ordering;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

use super::{health, Tracker, TrackerError};
use crate::config::TrackerSettings;
use crate::core::{CleanupEvent, CleanupMetrics, CleanupReason, Health, TokenSnapshot};
use crate::transport::BusEvent;

struct EvaluationOutcome {
    tracked_before: usize,
    effective_min: usize,
    /// Mints with a confirmed reason, in deterministic order.
    candidates: Vec<String>,
    tagged: Vec<String>,
    metrics: CleanupMetrics,
}

/// Clears `is_being_evaluated` for every tagged mint when dropped, so the
/// guard survives early returns and unwinding alike.
struct EvaluationGuard<'a> {
    tracker: &'a Tracker,
    mints: Vec<String>,
}

impl Drop for EvaluationGuard<'_> {
    fn drop(&mut self) {
        let mut state = self
            .tracker
            .state
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for mint in &self.mints {
            if let Some(health) = state.health.get_mut(mint) {
                health.is_being_evaluated = false;
            }
        }
    }
}

impl Tracker {
    /// One scheduled cleanup transaction. Returns `None` when cleanup was
    /// gated off (disabled, paused, stopped, already running).
    #[instrument(skip(self))]
    pub async fn run_cleanup(&self) -> Result<Option<CleanupMetrics>, TrackerError> {
        let Ok(_gate) = self.cleanup_gate.try_lock() else {
            debug!("cleanup already running; skipping cycle");
            return Ok(None);
        };
        if !self.settings.cleanup_enabled {
            return Ok(None);
        }
        {
            let state = self.state.read().unwrap();
            if state.emergency.stopped
                || state.emergency.cleanup_paused
                || state.emergency.disable_all_cleanup
            {
                debug!("cleanup gated off by emergency controls");
                return Ok(None);
            }
        }
        let metrics = self
            .cleanup_cycle(self.settings.max_cleanup_percentage)
            .await?;
        Ok(Some(metrics))
    }

    /// One immediate transaction with the removal cap overridden for this
    /// call only. Pause and disable flags are bypassed; a latched emergency
    /// stop and the population floor are not.
    #[instrument(skip(self))]
    pub async fn force_cleanup(
        &self,
        percentage: f64,
        reason: &str,
    ) -> Result<CleanupMetrics, TrackerError> {
        if !(percentage > 0.0 && percentage <= 0.5) {
            return Err(TrackerError::InvalidPercentage(percentage));
        }
        {
            let state = self.state.read().unwrap();
            if state.emergency.stopped {
                return Err(TrackerError::EmergencyStopped(
                    state
                        .emergency
                        .stop_reason
                        .clone()
                        .unwrap_or_else(|| "unspecified".to_string()),
                ));
            }
        }

        let _gate = self.cleanup_gate.lock().await;
        warn!(percentage, reason, "⚠️ forced cleanup requested");
        let metrics = self.cleanup_cycle(percentage).await?;
        self.bus.publish(BusEvent::EmergencyCleanupCompleted {
            removed: metrics.actually_removed,
            reason: reason.to_string(),
        });
        Ok(metrics)
    }

    /// Periodic driver. Dispatches one transaction per interval tick until
    /// shutdown flips.
    pub async fn run_cleanup_loop(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut timer = tokio::time::interval(std::time::Duration::from_millis(
            self.settings.cleanup_interval_ms,
        ));
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        timer.tick().await; // skip the immediate tick
        info!(
            interval_ms = self.settings.cleanup_interval_ms,
            "🧹 cleanup driver started"
        );

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("cleanup driver stopping");
                        return;
                    }
                }
                _ = timer.tick() => {
                    match self.run_cleanup().await {
                        Ok(Some(metrics)) if metrics.actually_removed > 0 => {
                            info!(
                                removed = metrics.actually_removed,
                                evaluated = metrics.total_evaluated,
                                "cleanup cycle completed"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "cleanup cycle failed"),
                    }
                }
            }
        }
    }

    async fn cleanup_cycle(&self, max_percentage: f64) -> Result<CleanupMetrics, TrackerError> {
        let started = Instant::now();
        self.cleanup_cycles.fetch_add(1, Ordering::Relaxed);

        // Phase 1: evaluate read-only, tagging candidates.
        let Some(outcome) = self.evaluate_candidates() else {
            return Ok(CleanupMetrics::default());
        };
        let guard = EvaluationGuard {
            tracker: self,
            mints: outcome.tagged,
        };
        let mut metrics = outcome.metrics;

        // Phase 2: apply the per-cycle limit, honoring the population floor
        // as a whole. When removing the capped count would breach the floor,
        // nothing is removed this cycle.
        let limit = (outcome.tracked_before as f64 * max_percentage).floor() as usize;
        let allowed = if outcome.tracked_before.saturating_sub(limit) >= outcome.effective_min {
            limit
        } else {
            0
        };
        let selected = outcome.candidates.len().min(allowed);
        metrics.saved_by_limit = (outcome.candidates.len() - selected) as u64;

        for mint in &outcome.candidates[..selected] {
            if let Some(event) = self.confirm_and_untrack(mint).await {
                metrics.actually_removed += 1;
                debug!(mint = %event.mint, reason = %event.reason, "token untracked");
            }
        }
        metrics.execution_time_ms = started.elapsed().as_millis() as u64;

        // Phase 3: metrics out, guard flags cleared by the guard drop below.
        if metrics.total_evaluated > 0 {
            if let Err(e) = self.sink.write_cleanup_metrics(&metrics).await {
                warn!(error = %e, "cleanup metrics write failed");
            }
            self.bus.publish(BusEvent::CleanupMetricsReady {
                metrics: metrics.clone(),
            });
        }
        drop(guard);
        Ok(metrics)
    }

    /// Phase 1. Tags every candidate with the concurrent-update guard, then
    /// derives reasons with whitelist and grace rails applied. Returns `None`
    /// when the population is at or below the effective floor.
    fn evaluate_candidates(&self) -> Option<EvaluationOutcome> {
        let mut state = self.state.write().unwrap();
        let tracked_before = state.current.len();
        let effective_min = if state.emergency.force_minimum_tokens {
            self.settings.min_tokens_to_keep * 2
        } else {
            self.settings.min_tokens_to_keep
        };
        if tracked_before <= effective_min {
            debug!(
                tracked = tracked_before,
                floor = effective_min,
                "population at floor; skipping evaluation"
            );
            return None;
        }

        // Deterministic candidate order keeps the per-cycle cap reproducible.
        let candidate_set: BTreeSet<String> = state
            .indices
            .rugged_candidates
            .iter()
            .chain(state.indices.inactive.iter())
            .chain(state.indices.low_volume.iter())
            .cloned()
            .collect();

        let mut metrics = CleanupMetrics {
            total_evaluated: candidate_set.len() as u64,
            ..Default::default()
        };
        let mut tagged = Vec::with_capacity(candidate_set.len());
        for mint in &candidate_set {
            if let Some(health) = state.health.get_mut(mint) {
                health.is_being_evaluated = true;
                tagged.push(mint.clone());
            }
        }

        let now = Utc::now();
        let mut candidates = Vec::new();
        for mint in &tagged {
            let Some(health) = state.health.get(mint) else {
                continue;
            };
            let Some(snapshot) = state.current.get(mint) else {
                continue;
            };

            if self.whitelist.contains(mint)
                || state.emergency.emergency_whitelist.contains(mint)
                || health.is_whitelisted
            {
                metrics.saved_by_whitelist += 1;
                continue;
            }
            let age = now - health.first_seen_time;
            if age < Duration::milliseconds(self.settings.grace_period_ms as i64) {
                metrics.saved_by_grace_period += 1;
                continue;
            }

            if let Some((reason, _details)) = derive_reason(health, snapshot, &self.settings) {
                match reason {
                    CleanupReason::Rugged => metrics.rugged_detected += 1,
                    CleanupReason::Inactive => metrics.inactive_detected += 1,
                    CleanupReason::LowVolume => metrics.low_volume_detected += 1,
                }
                candidates.push(mint.clone());
            }
        }

        Some(EvaluationOutcome {
            tracked_before,
            effective_min,
            candidates,
            tagged,
            metrics,
        })
    }

    /// Phase 2 for one candidate: re-check against the current snapshot,
    /// excise the mint, then write the audit record and announce. In-memory
    /// removal is authoritative; the event write is best-effort.
    async fn confirm_and_untrack(&self, mint: &str) -> Option<CleanupEvent> {
        let event = {
            let mut state = self.state.write().unwrap();
            let fresh = {
                let health = state.health.get(mint)?;
                let snapshot = state.current.get(mint)?;
                derive_reason(health, snapshot, &self.settings)?
            };
            let (snapshot, health, total_trades) = state.remove_mint(mint)?;
            build_cleanup_event(snapshot, health, total_trades, fresh.0, fresh.1)
        };

        if let Err(e) = self.sink.write_cleanup_event(&event).await {
            warn!(mint = %event.mint, error = %e, "cleanup event write failed; removal stands");
        }
        self.total_untracked.fetch_add(1, Ordering::Relaxed);
        info!(
            mint = %event.mint,
            symbol = %event.symbol,
            reason = %event.reason,
            details = %event.details,
            "🧹 token untracked"
        );
        self.bus.publish(BusEvent::TokenCleanedUp {
            mint: event.mint.clone(),
            symbol: event.symbol.clone(),
            platform: event.platform,
            reason: event.reason,
            details: event.details.clone(),
        });
        Some(event)
    }
}

/// Authoritative reason derivation. Rugged takes precedence over inactive,
/// which takes precedence over low volume; within rugged, the price rule
/// wins the reason string, then liquidity, then volume.
fn derive_reason(
    health: &Health,
    snapshot: &TokenSnapshot,
    settings: &TrackerSettings,
) -> Option<(CleanupReason, String)> {
    let price_drop = health::price_drop_fraction(health, snapshot);
    if price_drop >= settings.rug_price_drop {
        return Some((
            CleanupReason::Rugged,
            format!("Price dropped {:.2}% from peak", price_drop * 100.0),
        ));
    }
    if health.current_liquidity < settings.liq_threshold {
        return Some((
            CleanupReason::Rugged,
            format!(
                "Liquidity ${:.2} below ${:.2} floor",
                health.current_liquidity, settings.liq_threshold
            ),
        ));
    }
    let volume_drop = health::volume_drop_fraction(health, snapshot);
    if health.peak_volume_24h > 0.0 && volume_drop >= settings.rug_volume_drop {
        return Some((
            CleanupReason::Rugged,
            format!("Volume dropped {:.2}% from peak", volume_drop * 100.0),
        ));
    }

    let since_trade = Utc::now() - health.last_trade_time;
    if since_trade > Duration::milliseconds(settings.inactivity_threshold_ms as i64) {
        return Some((
            CleanupReason::Inactive,
            format!("No trades for {} minutes", since_trade.num_minutes()),
        ));
    }

    if snapshot.volume_24h < settings.min_volume_24h
        && health.consecutive_zero_volume_periods >= settings.consecutive_zero_volume_periods
    {
        return Some((
            CleanupReason::LowVolume,
            format!(
                "24h volume ${:.2} under ${:.2} for {} consecutive periods",
                snapshot.volume_24h,
                settings.min_volume_24h,
                health.consecutive_zero_volume_periods
            ),
        ));
    }

    None
}

fn build_cleanup_event(
    snapshot: TokenSnapshot,
    health: Health,
    total_trades: u64,
    reason: CleanupReason,
    details: String,
) -> CleanupEvent {
    let now = Utc::now();
    CleanupEvent {
        mint: snapshot.mint,
        symbol: snapshot.symbol,
        platform: snapshot.platform,
        reason,
        details,
        timestamp: now,
        final_price: snapshot.price,
        final_volume: snapshot.volume_24h,
        final_liquidity: health.current_liquidity,
        final_market_cap: snapshot.market_cap,
        peak_price: health.peak_price,
        peak_volume: health.peak_volume_24h,
        tracked_duration_secs: (now - health.first_seen_time).num_seconds(),
        total_trades,
    }
}
