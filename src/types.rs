//! Core data types for the rebalancing simulator.

use crate::error::ErrorKind;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A single daily observation for one asset.
///
/// `ret` is the simple return from the previous observation; it is NaN for the
/// first observation of a series.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub date: NaiveDate,
    pub price: f64,
    pub ret: f64,
}

impl Observation {
    pub fn new(date: NaiveDate, price: f64, ret: f64) -> Self {
        Self { date, price, ret }
    }

    /// Whether the return is usable for statistics.
    pub fn has_return(&self) -> bool {
        self.ret.is_finite()
    }
}

/// Trade direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

/// Why a rebalance fired on a given date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    /// Calendar cadence boundary.
    Scheduled,
    /// Weights drifted outside the tolerance band.
    Opportunistic,
    /// Explicit request, e.g. the initial construction.
    Forced,
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerKind::Scheduled => write!(f, "scheduled"),
            TriggerKind::Opportunistic => write!(f, "opportunistic"),
            TriggerKind::Forced => write!(f, "forced"),
        }
    }
}

/// An executed trade, priced at the rebalance date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub symbol: String,
    pub side: Side,
    /// Signed change in units held (positive = bought).
    pub quantity_delta: f64,
    pub price: f64,
    /// Absolute traded notional.
    pub value: f64,
    pub commission: f64,
    pub slippage: f64,
}

impl Trade {
    /// Total cost charged for this trade.
    pub fn cost(&self) -> f64 {
        self.commission + self.slippage
    }
}

/// A soft constraint that was knowingly relaxed while resolving a rebalance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstraintOverride {
    /// The rule that yielded.
    pub rule: String,
    pub symbols: Vec<String>,
    pub detail: String,
}

/// Append-only record of an executed rebalance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RebalanceEvent {
    pub date: NaiveDate,
    pub trigger: TriggerKind,
    pub trades: Vec<Trade>,
    pub total_cost: f64,
    /// Portfolio value before trading (marked at the rebalance date).
    pub pre_value: f64,
    /// Portfolio value after trading and costs.
    pub post_value: f64,
    /// Weights proposed by the allocator.
    pub target_weights: BTreeMap<String, f64>,
    /// Weights actually held after execution.
    pub weights_after: BTreeMap<String, f64>,
    pub added: Vec<String>,
    pub removed: Vec<String>,
    /// One-way turnover of the executed trades.
    pub turnover: f64,
    /// True when the turnover cap blended the target toward current weights.
    pub partial: bool,
    pub overrides: Vec<ConstraintOverride>,
}

/// A rebalance whose pipeline failed; prior weights were retained.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedRebalance {
    pub date: NaiveDate,
    pub trigger: TriggerKind,
    pub kind: ErrorKind,
    pub reason: String,
}

/// Point on the equity curve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquityPoint {
    pub date: NaiveDate,
    pub equity: f64,
    pub cash: f64,
    pub positions_value: f64,
    pub drawdown: f64,
    pub drawdown_pct: f64,
}

/// Lifecycle of a simulation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Initialized,
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunState::Initialized => "initialized",
            RunState::Running => "running",
            RunState::Completed => "completed",
            RunState::Cancelled => "cancelled",
            RunState::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trade_cost() {
        let trade = Trade {
            symbol: "AAA".to_string(),
            side: Side::Buy,
            quantity_delta: 10.0,
            price: 100.0,
            value: 1000.0,
            commission: 1.5,
            slippage: 0.5,
        };
        assert!((trade.cost() - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_trigger_kind_serde() {
        let json = serde_json::to_string(&TriggerKind::Opportunistic).unwrap();
        assert_eq!(json, "\"opportunistic\"");
    }

    #[test]
    fn test_observation_has_return() {
        let d = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        assert!(!Observation::new(d, 10.0, f64::NAN).has_return());
        assert!(Observation::new(d, 10.0, 0.01).has_return());
    }
}
