//! Health bookkeeping and derived-index maintenance.
//!
//! Index membership is recomputed on the write path only; cleanup evaluation
//! reads the sets without mutating counters.

use chrono::{Duration, Utc};

use super::{TrackerState, PRICE_HISTORY_CAP};
use crate::config::TrackerSettings;
use crate::core::{Health, PricePoint, TokenSnapshot};

impl TrackerState {
    /// Install the snapshot and advance health. Callers have already
    /// rejected updates for mints under evaluation.
    pub(crate) fn apply_snapshot(
        &mut self,
        snapshot: &TokenSnapshot,
        whitelist: &std::collections::HashSet<String>,
        settings: &TrackerSettings,
    ) {
        let now = Utc::now();
        let mint = snapshot.mint.clone();

        match self.health.get_mut(&mint) {
            Some(health) => {
                health.last_trade_time = now;
                health.peak_price = health.peak_price.max(snapshot.price);
                health.peak_volume_24h = health.peak_volume_24h.max(snapshot.volume_24h);
                health.current_liquidity = snapshot.liquidity;
                bump_zero_volume_counter(health, snapshot.volume_24h, settings.min_volume_24h);
            }
            None => {
                let mut health = Health {
                    mint: mint.clone(),
                    first_seen_time: now,
                    last_trade_time: now,
                    consecutive_zero_volume_periods: 0,
                    peak_price: snapshot.price,
                    peak_volume_24h: snapshot.volume_24h,
                    current_liquidity: snapshot.liquidity,
                    is_whitelisted: whitelist.contains(&mint),
                    is_being_evaluated: false,
                };
                bump_zero_volume_counter(&mut health, snapshot.volume_24h, settings.min_volume_24h);
                self.health.insert(mint.clone(), health);
            }
        }

        self.current.insert(mint, snapshot.clone());
    }

    /// Append to the bounded per-mint ring, preserving time order even when
    /// the feed delivers a stale timestamp.
    pub(crate) fn append_price_point(&mut self, point: PricePoint) {
        let ring = self.history.entry(point.mint.clone()).or_default();
        let position = ring
            .iter()
            .rposition(|p| p.timestamp <= point.timestamp)
            .map(|i| i + 1)
            .unwrap_or(0);
        if position == ring.len() {
            ring.push_back(point);
        } else {
            ring.insert(position, point);
        }
        while ring.len() > PRICE_HISTORY_CAP {
            ring.pop_front();
        }
    }

    /// Atomically re-derive index membership for one mint: drop from all
    /// five sets, then insert where it belongs.
    pub(crate) fn rebuild_indices_for(&mut self, mint: &str, settings: &TrackerSettings) {
        self.indices.remove(mint);
        let (Some(health), Some(snapshot)) = (self.health.get(mint), self.current.get(mint))
        else {
            return;
        };

        let now = Utc::now();
        let age = now - health.first_seen_time;
        if age < Duration::milliseconds(settings.grace_period_ms as i64) {
            // Grace membership suppresses every failure index.
            self.indices.new_tokens.insert(mint.to_string());
            return;
        }

        let since_trade = now - health.last_trade_time;
        let inactivity = Duration::milliseconds(settings.inactivity_threshold_ms as i64);
        if since_trade < inactivity / 2 {
            self.indices.recently_active.insert(mint.to_string());
        }
        if since_trade > inactivity {
            self.indices.inactive.insert(mint.to_string());
        }

        if snapshot.volume_24h < settings.min_volume_24h
            && health.consecutive_zero_volume_periods >= settings.consecutive_zero_volume_periods
        {
            self.indices.low_volume.insert(mint.to_string());
        }

        if is_rug_candidate(health, snapshot, settings) {
            self.indices.rugged_candidates.insert(mint.to_string());
        }
    }

    /// Excise every trace of a mint. Returns what is needed for the audit
    /// record, or `None` if the mint was not tracked.
    pub(crate) fn remove_mint(&mut self, mint: &str) -> Option<(TokenSnapshot, Health, u64)> {
        let snapshot = self.current.remove(mint)?;
        let health = self.health.remove(mint)?;
        self.history.remove(mint);
        let trades = self.trade_counts.remove(mint).unwrap_or(0);
        self.indices.remove(mint);
        self.alerts.retain(|_, alert| alert.mint != mint);
        self.trends.retain(|(m, _), _| m != mint);
        Some((snapshot, health, trades))
    }
}

/// Low-volume confirmation counter: a period below the volume floor
/// increments, a period at or above it resets. Strictly below, so volume
/// exactly at the floor never increments.
fn bump_zero_volume_counter(health: &mut Health, volume_24h: f64, min_volume_24h: f64) {
    if volume_24h < min_volume_24h {
        health.consecutive_zero_volume_periods += 1;
    } else {
        health.consecutive_zero_volume_periods = 0;
    }
}

pub(crate) fn price_drop_fraction(health: &Health, snapshot: &TokenSnapshot) -> f64 {
    if health.peak_price > 0.0 {
        (health.peak_price - snapshot.price) / health.peak_price
    } else {
        0.0
    }
}

pub(crate) fn volume_drop_fraction(health: &Health, snapshot: &TokenSnapshot) -> f64 {
    if health.peak_volume_24h > 0.0 {
        (health.peak_volume_24h - snapshot.volume_24h) / health.peak_volume_24h
    } else {
        0.0
    }
}

pub(crate) fn is_rug_candidate(
    health: &Health,
    snapshot: &TokenSnapshot,
    settings: &TrackerSettings,
) -> bool {
    health.current_liquidity < settings.liq_threshold
        || price_drop_fraction(health, snapshot) >= settings.rug_price_drop
        || (health.peak_volume_24h > 0.0
            && volume_drop_fraction(health, snapshot) >= settings.rug_volume_drop)
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use chrono::{Duration, Utc};

    #[test]
    fn fresh_token_sits_only_in_new_tokens() {
        let (tracker, _sink, _bus) = tracker_with(settings_for_tests());
        // Near-zero liquidity would qualify as a rug candidate, but grace
        // membership suppresses the failure indices.
        tracker.track_token(snapshot("MintA", 1.0, 0.0, 0.0));

        let state = tracker.state.read().unwrap();
        assert!(state.indices.new_tokens.contains("MintA"));
        assert!(!state.indices.rugged_candidates.contains("MintA"));
        assert!(!state.indices.low_volume.contains("MintA"));
        assert!(!state.indices.inactive.contains("MintA"));
        assert!(!state.indices.recently_active.contains("MintA"));
    }

    #[test]
    fn aged_idle_token_lands_in_inactive() {
        let (tracker, _sink, _bus) = tracker_with(settings_for_tests());
        tracker.track_token(snapshot("MintA", 1.0, 100.0, 1_000.0));
        let now = Utc::now();
        rewind_health(
            &tracker,
            "MintA",
            now - Duration::hours(2),
            now - Duration::minutes(65),
        );

        let state = tracker.state.read().unwrap();
        assert!(state.indices.inactive.contains("MintA"));
        assert!(!state.indices.new_tokens.contains("MintA"));
        assert!(!state.indices.recently_active.contains("MintA"));
    }

    #[test]
    fn recent_trade_keeps_token_in_recently_active() {
        let (tracker, _sink, _bus) = tracker_with(settings_for_tests());
        tracker.track_token(snapshot("MintA", 1.0, 100.0, 1_000.0));
        let now = Utc::now();
        rewind_health(&tracker, "MintA", now - Duration::hours(2), now - Duration::minutes(5));

        let state = tracker.state.read().unwrap();
        assert!(state.indices.recently_active.contains("MintA"));
        assert!(!state.indices.inactive.contains("MintA"));
    }

    #[test]
    fn volume_at_floor_does_not_increment_counter() {
        let (tracker, _sink, _bus) = tracker_with(settings_for_tests());
        tracker.track_token(snapshot("MintA", 1.0, 10.0, 1_000.0));
        assert_eq!(
            tracker.get_health("MintA").unwrap().consecutive_zero_volume_periods,
            0
        );

        tracker.track_token(snapshot("MintA", 1.0, 9.99, 1_000.0));
        assert_eq!(
            tracker.get_health("MintA").unwrap().consecutive_zero_volume_periods,
            1
        );

        tracker.track_token(snapshot("MintA", 1.0, 10.0, 1_000.0));
        assert_eq!(
            tracker.get_health("MintA").unwrap().consecutive_zero_volume_periods,
            0
        );
    }

    #[test]
    fn three_low_volume_periods_index_the_mint() {
        let (tracker, _sink, _bus) = tracker_with(settings_for_tests());
        for _ in 0..3 {
            tracker.track_token(snapshot("MintA", 1.0, 5.0, 1_000.0));
        }
        let now = Utc::now();
        rewind_health(&tracker, "MintA", now - Duration::hours(2), now - Duration::minutes(1));

        let state = tracker.state.read().unwrap();
        assert!(state.indices.low_volume.contains("MintA"));
    }

    #[test]
    fn deep_price_drop_marks_rug_candidate() {
        let (tracker, _sink, _bus) = tracker_with(settings_for_tests());
        tracker.track_token(snapshot("MintA", 1.0, 100.0, 1_000.0));
        tracker.track_token(snapshot("MintA", 0.04, 100.0, 1_000.0));
        let now = Utc::now();
        rewind_health(&tracker, "MintA", now - Duration::hours(2), now);

        let state = tracker.state.read().unwrap();
        assert!(state.indices.rugged_candidates.contains("MintA"));
    }

    #[test]
    fn removal_excises_every_trace() {
        let (tracker, _sink, _bus) = tracker_with(settings_for_tests());
        tracker.track_token(snapshot("MintA", 1.0, 100.0, 1_000.0));
        tracker.add_alert(crate::core::AlertSpec {
            mint: "MintA".to_string(),
            symbol: "MA".to_string(),
            kind: crate::core::AlertKind::Threshold,
            condition: crate::core::AlertCondition::Above,
            value: 5.0,
        });

        let mut state = tracker.state.write().unwrap();
        assert!(state.remove_mint("MintA").is_some());
        assert!(state.current.is_empty());
        assert!(state.health.is_empty());
        assert!(state.history.is_empty());
        assert!(state.alerts.is_empty());
        assert!(!state.indices.new_tokens.contains("MintA"));
        assert!(state.remove_mint("MintA").is_none());
    }
}
