//! One-shot alert evaluation on the snapshot update path.

use chrono::Utc;
use tracing::debug;

use super::TrackerState;
use crate::core::{Alert, AlertCondition, AlertKind, TokenSnapshot};

/// Check every enabled, unfired alert for `mint` against the snapshot just
/// installed. Fired alerts latch until removed. Returns the alerts to
/// announce, paired with the snapshot that tripped them.
pub(crate) fn evaluate_for_mint(
    state: &mut TrackerState,
    mint: &str,
) -> Vec<(Alert, TokenSnapshot)> {
    let Some(snapshot) = state.current.get(mint).cloned() else {
        return Vec::new();
    };
    // Percentage alerts measure from the oldest point still in the ring.
    let baseline = state
        .history
        .get(mint)
        .and_then(|ring| ring.front())
        .map(|point| point.price);

    let mut triggered = Vec::new();
    for alert in state.alerts.values_mut() {
        if alert.mint != mint || !alert.enabled || alert.triggered {
            continue;
        }
        if condition_holds(alert, snapshot.price, baseline) {
            alert.triggered = true;
            alert.triggered_at = Some(Utc::now());
            debug!(alert_id = %alert.id, price = snapshot.price, "alert condition met");
            triggered.push((alert.clone(), snapshot.clone()));
        }
    }
    triggered
}

fn condition_holds(alert: &Alert, price: f64, baseline: Option<f64>) -> bool {
    match alert.kind {
        AlertKind::Threshold => match alert.condition {
            AlertCondition::Above => price > alert.value,
            AlertCondition::Below => price < alert.value,
        },
        AlertKind::Percentage => {
            let Some(baseline) = baseline else {
                return false;
            };
            if baseline <= 0.0 {
                return false;
            }
            let change_percent = 100.0 * (price - baseline) / baseline;
            match alert.condition {
                AlertCondition::Above => change_percent >= alert.value,
                AlertCondition::Below => change_percent <= -alert.value,
            }
        }
    }
}
