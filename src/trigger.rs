//! Rebalance trigger.
//!
//! At most one trigger kind is reported per date. Until the first rebalance
//! executes, every date fires a forced (initial construction) attempt, so a
//! skipped start is retried on the next date rather than at the next period
//! boundary. After that a calendar boundary fires a scheduled rebalance, and
//! drift beyond the tolerance band fires an opportunistic one. When both
//! conditions hold on the same date the event is recorded as scheduled.

use crate::config::{DriftBand, RebalanceFrequency, TriggerConfig};
use crate::types::TriggerKind;
use chrono::{Datelike, NaiveDate};
use std::collections::BTreeMap;

/// Weights below this are treated as closed positions when measuring drift.
const NEGLIGIBLE_WEIGHT: f64 = 1e-6;

/// Inputs for one trigger evaluation.
#[derive(Debug, Clone, Copy)]
pub struct TriggerContext<'a> {
    pub date: NaiveDate,
    /// Previous simulated date, `None` on the first day.
    pub previous_date: Option<NaiveDate>,
    /// Date of the last executed rebalance.
    pub last_rebalance: Option<NaiveDate>,
    /// Marked-to-market weights as of `date`.
    pub current_weights: &'a BTreeMap<String, f64>,
    /// Target weights of the last executed rebalance.
    pub target_weights: Option<&'a BTreeMap<String, f64>>,
}

/// Per-asset and summed absolute drift.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Drift {
    pub max: f64,
    pub total: f64,
}

/// Measure drift of `current` from `target`.
pub fn measure_drift(current: &BTreeMap<String, f64>, target: &BTreeMap<String, f64>) -> Drift {
    let mut drift = Drift::default();
    for (symbol, &t) in target {
        let d = (current.get(symbol).copied().unwrap_or(0.0) - t).abs();
        drift.max = drift.max.max(d);
        drift.total += d;
    }
    for (symbol, &c) in current {
        if !target.contains_key(symbol) && c > NEGLIGIBLE_WEIGHT {
            drift.max = drift.max.max(c);
            drift.total += c;
        }
    }
    drift
}

#[derive(Debug, Clone)]
pub struct RebalanceTrigger {
    frequency: RebalanceFrequency,
    drift: Option<DriftBand>,
}

impl RebalanceTrigger {
    pub fn new(config: &TriggerConfig) -> Self {
        Self {
            frequency: config.frequency,
            drift: config.drift.clone(),
        }
    }

    /// True when `date` opens a new period of the configured cadence.
    pub fn is_scheduled(&self, date: NaiveDate, previous_date: Option<NaiveDate>) -> bool {
        match previous_date {
            Some(prev) => period_key(self.frequency, prev) != period_key(self.frequency, date),
            None => false,
        }
    }

    /// True when the drift band is configured and breached.
    pub fn drift_breached(&self, ctx: &TriggerContext<'_>) -> bool {
        let (Some(band), Some(target)) = (&self.drift, ctx.target_weights) else {
            return false;
        };
        if let Some(last) = ctx.last_rebalance {
            if (ctx.date - last).num_days() < i64::from(band.min_days_between) {
                return false;
            }
        }

        let drift = measure_drift(ctx.current_weights, target);
        drift.max > band.threshold || band.max_total_drift.is_some_and(|cap| drift.total > cap)
    }

    /// The trigger kind firing on `ctx.date`, if any.
    pub fn evaluate(&self, ctx: &TriggerContext<'_>) -> Option<TriggerKind> {
        if ctx.last_rebalance.is_none() {
            Some(TriggerKind::Forced)
        } else if self.is_scheduled(ctx.date, ctx.previous_date) {
            Some(TriggerKind::Scheduled)
        } else if self.drift_breached(ctx) {
            Some(TriggerKind::Opportunistic)
        } else {
            None
        }
    }
}

/// Identifier of the calendar period containing `date`.
fn period_key(frequency: RebalanceFrequency, date: NaiveDate) -> (i32, u32) {
    match frequency {
        RebalanceFrequency::Daily => (date.year(), date.ordinal()),
        RebalanceFrequency::Weekly => {
            let week = date.iso_week();
            (week.year(), week.week())
        }
        RebalanceFrequency::Monthly => (date.year(), date.month()),
        RebalanceFrequency::Quarterly => (date.year(), (date.month() - 1) / 3),
        RebalanceFrequency::Annual => (date.year(), 0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn trigger(frequency: RebalanceFrequency, drift: Option<DriftBand>) -> RebalanceTrigger {
        RebalanceTrigger::new(&TriggerConfig { frequency, drift })
    }

    fn weights(pairs: &[(&str, f64)]) -> BTreeMap<String, f64> {
        pairs.iter().map(|(s, w)| (s.to_string(), *w)).collect()
    }

    #[test]
    fn test_schedule_boundaries() {
        let monthly = trigger(RebalanceFrequency::Monthly, None);
        assert!(monthly.is_scheduled(d(2024, 2, 1), Some(d(2024, 1, 31))));
        assert!(!monthly.is_scheduled(d(2024, 1, 31), Some(d(2024, 1, 30))));
        // Gap over a weekend into the new month
        assert!(monthly.is_scheduled(d(2024, 6, 3), Some(d(2024, 5, 31))));

        let weekly = trigger(RebalanceFrequency::Weekly, None);
        // Friday to Monday
        assert!(weekly.is_scheduled(d(2024, 1, 8), Some(d(2024, 1, 5))));
        assert!(!weekly.is_scheduled(d(2024, 1, 9), Some(d(2024, 1, 8))));

        let quarterly = trigger(RebalanceFrequency::Quarterly, None);
        assert!(quarterly.is_scheduled(d(2024, 4, 1), Some(d(2024, 3, 28))));
        assert!(!quarterly.is_scheduled(d(2024, 3, 1), Some(d(2024, 2, 29))));

        let annual = trigger(RebalanceFrequency::Annual, None);
        assert!(annual.is_scheduled(d(2025, 1, 2), Some(d(2024, 12, 31))));

        let daily = trigger(RebalanceFrequency::Daily, None);
        assert!(daily.is_scheduled(d(2024, 1, 3), Some(d(2024, 1, 2))));
    }

    #[test]
    fn test_first_day_is_forced() {
        let t = trigger(RebalanceFrequency::Monthly, None);
        let current = BTreeMap::new();
        let ctx = TriggerContext {
            date: d(2024, 1, 15),
            previous_date: None,
            last_rebalance: None,
            current_weights: &current,
            target_weights: None,
        };
        assert_eq!(t.evaluate(&ctx), Some(TriggerKind::Forced));
    }

    #[test]
    fn test_forced_until_first_rebalance_executes() {
        let t = trigger(RebalanceFrequency::Monthly, None);
        let current = BTreeMap::new();
        // Mid-month, no boundary: still forced while nothing has executed
        let pending = TriggerContext {
            date: d(2024, 1, 17),
            previous_date: Some(d(2024, 1, 16)),
            last_rebalance: None,
            current_weights: &current,
            target_weights: None,
        };
        assert_eq!(t.evaluate(&pending), Some(TriggerKind::Forced));

        let target = weights(&[("A", 1.0)]);
        let held = weights(&[("A", 1.0)]);
        let done = TriggerContext {
            last_rebalance: Some(d(2024, 1, 16)),
            current_weights: &held,
            target_weights: Some(&target),
            ..pending
        };
        assert_eq!(t.evaluate(&done), None);
    }

    #[test]
    fn test_drift_fires_opportunistic() {
        let t = trigger(
            RebalanceFrequency::Monthly,
            Some(DriftBand {
                threshold: 0.05,
                max_total_drift: None,
                min_days_between: 1,
            }),
        );
        let target = weights(&[("A", 0.5), ("B", 0.5)]);
        let drifted = weights(&[("A", 0.57), ("B", 0.43)]);
        let ctx = TriggerContext {
            date: d(2024, 1, 10),
            previous_date: Some(d(2024, 1, 9)),
            last_rebalance: Some(d(2024, 1, 2)),
            current_weights: &drifted,
            target_weights: Some(&target),
        };
        assert_eq!(t.evaluate(&ctx), Some(TriggerKind::Opportunistic));

        let calm = weights(&[("A", 0.52), ("B", 0.48)]);
        let quiet = TriggerContext {
            current_weights: &calm,
            ..ctx
        };
        assert_eq!(t.evaluate(&quiet), None);
    }

    #[test]
    fn test_drift_respects_min_days_between() {
        let t = trigger(
            RebalanceFrequency::Monthly,
            Some(DriftBand {
                threshold: 0.05,
                max_total_drift: None,
                min_days_between: 5,
            }),
        );
        let target = weights(&[("A", 0.5), ("B", 0.5)]);
        let drifted = weights(&[("A", 0.7), ("B", 0.3)]);
        let ctx = TriggerContext {
            date: d(2024, 1, 5),
            previous_date: Some(d(2024, 1, 4)),
            last_rebalance: Some(d(2024, 1, 2)),
            current_weights: &drifted,
            target_weights: Some(&target),
        };
        assert!(!t.drift_breached(&ctx));
    }

    #[test]
    fn test_total_drift_band() {
        let t = trigger(
            RebalanceFrequency::Annual,
            Some(DriftBand {
                threshold: 0.5,
                max_total_drift: Some(0.10),
                min_days_between: 0,
            }),
        );
        let target = weights(&[("A", 0.25), ("B", 0.25), ("C", 0.25), ("D", 0.25)]);
        let drifted = weights(&[("A", 0.28), ("B", 0.28), ("C", 0.22), ("D", 0.22)]);
        let ctx = TriggerContext {
            date: d(2024, 1, 5),
            previous_date: Some(d(2024, 1, 4)),
            last_rebalance: Some(d(2024, 1, 2)),
            current_weights: &drifted,
            target_weights: Some(&target),
        };
        assert!(t.drift_breached(&ctx));
    }

    #[test]
    fn test_scheduled_wins_over_drift() {
        let t = trigger(RebalanceFrequency::Monthly, Some(DriftBand::default()));
        let target = weights(&[("A", 0.5), ("B", 0.5)]);
        let drifted = weights(&[("A", 0.9), ("B", 0.1)]);
        let ctx = TriggerContext {
            date: d(2024, 2, 1),
            previous_date: Some(d(2024, 1, 31)),
            last_rebalance: Some(d(2024, 1, 2)),
            current_weights: &drifted,
            target_weights: Some(&target),
        };
        assert!(t.drift_breached(&ctx));
        assert_eq!(t.evaluate(&ctx), Some(TriggerKind::Scheduled));
    }

    #[test]
    fn test_closed_positions_count_as_drift() {
        let target = weights(&[("A", 1.0)]);
        let current = weights(&[("A", 0.8), ("GONE", 0.2)]);
        let drift = measure_drift(&current, &target);
        assert!((drift.max - 0.2).abs() < 1e-12);
        assert!((drift.total - 0.4).abs() < 1e-12);
    }
}
