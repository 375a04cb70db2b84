//! Edge-triggered threshold evaluation
//!
//! Each position key carries a small amount of state between ticks so a
//! condition that stays breached alerts once, not on every poll.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::debug;

use crate::domain::PositionSnapshot;
use crate::supervisor::{Alert, AlertLevel, AlertMetric};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertThresholds {
    pub liquidation_warning_pct: Decimal,
    pub pnl_change_alert_pct: Decimal,
    pub enable_alerts: bool,
}

#[derive(Debug, Clone)]
struct TrackedPosition {
    in_liquidation_zone: bool,
    pnl_baseline: Decimal,
}

#[derive(Debug, Default)]
pub struct ThresholdTracker {
    tracked: HashMap<String, TrackedPosition>,
}

impl ThresholdTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of positions with carried state
    pub fn tracked_count(&self) -> usize {
        self.tracked.len()
    }

    /// Evaluate a full snapshot set and return newly breached conditions.
    ///
    /// Positions absent from `snapshots` lose their state. State is always
    /// updated; alerts are only returned when `enable_alerts` is set.
    pub fn evaluate(
        &mut self,
        snapshots: &[PositionSnapshot],
        thresholds: &AlertThresholds,
        now: DateTime<Utc>,
    ) -> Vec<Alert> {
        let mut alerts = Vec::new();
        let live: HashSet<String> = snapshots.iter().map(|p| p.key()).collect();
        self.tracked.retain(|key, _| live.contains(key));

        for snapshot in snapshots {
            let key = snapshot.key();
            let entry = self.tracked.entry(key).or_insert_with(|| TrackedPosition {
                in_liquidation_zone: false,
                pnl_baseline: snapshot.unrealized_pnl_pct,
            });

            // Liquidation proximity
            let in_zone = snapshot
                .liquidation_distance_pct
                .map(|d| d <= thresholds.liquidation_warning_pct)
                .unwrap_or(false);
            if in_zone && !entry.in_liquidation_zone {
                if let Some(distance) = snapshot.liquidation_distance_pct {
                    alerts.push(
                        Alert::new(
                            AlertLevel::Critical,
                            &snapshot.symbol,
                            AlertMetric::LiquidationDistance,
                            distance,
                            thresholds.liquidation_warning_pct,
                            format!(
                                "{} {} is {}% from liquidation",
                                snapshot.symbol,
                                snapshot.side,
                                distance.round_dp(2)
                            ),
                        )
                        .at(now),
                    );
                }
            } else if !in_zone && entry.in_liquidation_zone {
                debug!("{} left the liquidation warning zone", snapshot.key());
            }
            entry.in_liquidation_zone = in_zone;

            // P&L movement since baseline
            let moved = snapshot
                .unrealized_pnl_pct
                .checked_sub(entry.pnl_baseline)
                .unwrap_or(Decimal::MAX);
            if moved.abs() >= thresholds.pnl_change_alert_pct {
                alerts.push(
                    Alert::new(
                        AlertLevel::Warning,
                        &snapshot.symbol,
                        AlertMetric::PnlChange,
                        snapshot.unrealized_pnl_pct,
                        thresholds.pnl_change_alert_pct,
                        format!(
                            "{} {} P&L moved {}% (from {}% to {}%)",
                            snapshot.symbol,
                            snapshot.side,
                            moved.round_dp(2),
                            entry.pnl_baseline.round_dp(2),
                            snapshot.unrealized_pnl_pct.round_dp(2)
                        ),
                    )
                    .at(now),
                );
                entry.pnl_baseline = snapshot.unrealized_pnl_pct;
            }
        }

        if !thresholds.enable_alerts {
            alerts.clear();
        }
        alerts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{BackendPosition, PositionSide};
    use rust_decimal_macros::dec;

    fn thresholds(liq: Decimal, pnl: Decimal) -> AlertThresholds {
        AlertThresholds {
            liquidation_warning_pct: liq,
            pnl_change_alert_pct: pnl,
            enable_alerts: true,
        }
    }

    fn btc_long(current: Decimal) -> PositionSnapshot {
        let raw = BackendPosition {
            symbol: "BTC".to_string(),
            side: PositionSide::Long,
            quantity: dec!(1),
            entry_price: dec!(100),
            current_price: current,
            leverage: dec!(10),
            margin: dec!(10),
            liquidation_price: Some(dec!(90)),
            position_id: None,
        };
        PositionSnapshot::from_backend(&raw, Utc::now()).unwrap()
    }

    #[test]
    fn test_liquidation_alert_fires_once() {
        let mut tracker = ThresholdTracker::new();
        let t = thresholds(dec!(5), dec!(1000));

        // 100 -> 10% away
        assert!(tracker.evaluate(&[btc_long(dec!(100))], &t, Utc::now()).is_empty());
        // 94 -> ~4.26% away, crosses
        let alerts = tracker.evaluate(&[btc_long(dec!(94))], &t, Utc::now());
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].metric, AlertMetric::LiquidationDistance);
        assert_eq!(alerts[0].severity, AlertLevel::Critical);
        // still inside the zone
        assert!(tracker.evaluate(&[btc_long(dec!(93))], &t, Utc::now()).is_empty());
    }

    #[test]
    fn test_liquidation_alert_rearms_after_recovery() {
        let mut tracker = ThresholdTracker::new();
        let t = thresholds(dec!(5), dec!(1000));

        assert_eq!(tracker.evaluate(&[btc_long(dec!(94))], &t, Utc::now()).len(), 1);
        assert!(tracker.evaluate(&[btc_long(dec!(100))], &t, Utc::now()).is_empty());
        assert_eq!(tracker.evaluate(&[btc_long(dec!(94))], &t, Utc::now()).len(), 1);
    }

    #[test]
    fn test_pnl_change_moves_baseline() {
        let mut tracker = ThresholdTracker::new();
        let t = thresholds(dec!(0), dec!(50));

        // margin 10, so each 1.0 of price is 10% of P&L
        assert!(tracker.evaluate(&[btc_long(dec!(100))], &t, Utc::now()).is_empty());
        assert!(tracker.evaluate(&[btc_long(dec!(104))], &t, Utc::now()).is_empty());
        let alerts = tracker.evaluate(&[btc_long(dec!(105))], &t, Utc::now());
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].metric, AlertMetric::PnlChange);
        assert_eq!(alerts[0].value, dec!(50));
        // baseline is now 50%
        assert!(tracker.evaluate(&[btc_long(dec!(108))], &t, Utc::now()).is_empty());
        assert_eq!(tracker.evaluate(&[btc_long(dec!(110))], &t, Utc::now()).len(), 1);
    }

    #[test]
    fn test_rows_with_distinct_ids_track_separately() {
        let mut tracker = ThresholdTracker::new();
        let t = thresholds(dec!(5), dec!(1000));

        let mut safe = btc_long(dec!(100));
        safe.position_id = Some("sub-a".to_string());
        let mut near = btc_long(dec!(94));
        near.position_id = Some("sub-b".to_string());

        let alerts = tracker.evaluate(&[safe.clone(), near.clone()], &t, Utc::now());
        assert_eq!(alerts.len(), 1);
        assert_eq!(tracker.tracked_count(), 2);
        // sub-b staying in the zone does not re-alert; sub-a is unaffected
        assert!(tracker.evaluate(&[safe, near], &t, Utc::now()).is_empty());
    }

    #[test]
    fn test_vanished_positions_are_forgotten() {
        let mut tracker = ThresholdTracker::new();
        let t = thresholds(dec!(5), dec!(1000));

        assert_eq!(tracker.evaluate(&[btc_long(dec!(94))], &t, Utc::now()).len(), 1);
        tracker.evaluate(&[], &t, Utc::now());
        assert_eq!(tracker.tracked_count(), 0);
        // reappearing in the zone alerts again
        assert_eq!(tracker.evaluate(&[btc_long(dec!(94))], &t, Utc::now()).len(), 1);
    }

    #[test]
    fn test_disabled_alerts_still_track() {
        let mut tracker = ThresholdTracker::new();
        let mut t = thresholds(dec!(5), dec!(1000));
        t.enable_alerts = false;

        assert!(tracker.evaluate(&[btc_long(dec!(94))], &t, Utc::now()).is_empty());
        assert_eq!(tracker.tracked_count(), 1);

        // re-enabling does not replay the crossing that already happened
        t.enable_alerts = true;
        assert!(tracker.evaluate(&[btc_long(dec!(94))], &t, Utc::now()).is_empty());
    }
}
