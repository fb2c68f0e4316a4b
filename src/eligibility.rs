//! Point-in-time eligibility.
//!
//! An asset is eligible at date `t` only when the history strictly before `t`
//! meets every threshold. Anything that cannot be established (no rows, a
//! missing series, a stale last print) makes the asset ineligible.

use crate::config::EligibilityConfig;
use crate::data::PriceHistory;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Eligibility of one asset at one date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EligibilityRecord {
    pub symbol: String,
    pub as_of: NaiveDate,
    /// Observations strictly before `as_of`.
    pub rows: usize,
    /// Calendar days from the first observation to `as_of`.
    pub span_days: i64,
    pub eligible: bool,
    /// Why the asset was excluded, if it was.
    pub reason: Option<String>,
}

/// Evaluates eligibility thresholds.
#[derive(Debug, Clone)]
pub struct EligibilityFilter {
    config: EligibilityConfig,
}

impl EligibilityFilter {
    pub fn new(config: EligibilityConfig) -> Self {
        Self { config }
    }

    /// Evaluate a single asset.
    pub fn evaluate_one(
        &self,
        history: &PriceHistory,
        symbol: &str,
        as_of: NaiveDate,
    ) -> EligibilityRecord {
        let before = history.history_before(symbol, as_of);
        let rows = before.len();

        let (span_days, staleness) = match (before.first(), before.last()) {
            (Some(first), Some(last)) => (
                (as_of - first.date).num_days(),
                Some((as_of - last.date).num_days()),
            ),
            _ => (0, None),
        };

        let reason = if rows == 0 {
            Some("no history before as-of date".to_string())
        } else if rows < self.config.min_price_rows {
            Some(format!(
                "{} rows < min_price_rows {}",
                rows, self.config.min_price_rows
            ))
        } else if span_days < i64::from(self.config.min_history_days) {
            Some(format!(
                "{} days of history < min_history_days {}",
                span_days, self.config.min_history_days
            ))
        } else if let (Some(limit), Some(stale)) = (self.config.max_stale_days, staleness) {
            (stale > i64::from(limit)).then(|| {
                format!("last observation {} days old > max_stale_days {}", stale, limit)
            })
        } else {
            None
        };

        EligibilityRecord {
            symbol: symbol.to_string(),
            as_of,
            rows,
            span_days,
            eligible: reason.is_none(),
            reason,
        }
    }

    /// Evaluate every asset in the history, alphabetically.
    pub fn evaluate(&self, history: &PriceHistory, as_of: NaiveDate) -> Vec<EligibilityRecord> {
        history
            .symbols()
            .map(|s| self.evaluate_one(history, s, as_of))
            .collect()
    }

    /// Alphabetical list of eligible assets.
    pub fn eligible_symbols(&self, history: &PriceHistory, as_of: NaiveDate) -> Vec<String> {
        self.evaluate(history, as_of)
            .into_iter()
            .filter(|r| r.eligible)
            .map(|r| r.symbol)
            .collect()
    }
}
