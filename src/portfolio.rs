//! Portfolio state: quantities, cash and holding periods.
//!
//! Mark-to-market only refreshes prices; holdings change exclusively through
//! [`PortfolioState::execute`], which plans the full trade list before touching
//! any state so a failed rebalance leaves the portfolio as it was.

use crate::costs::TransactionCostModel;
use crate::data::PriceHistory;
use crate::error::{Result, SimulationError};
use crate::membership::HoldingInfo;
use crate::types::{EquityPoint, Trade};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Positions worth less than this are closed out.
const DUST_VALUE: f64 = 1e-8;

/// Fixed-point passes used to net costs out of the investable value.
const MAX_COST_ITERATIONS: usize = 16;

/// Value of the portfolio at one date.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Valuation {
    pub date: NaiveDate,
    pub cash: f64,
    pub positions_value: f64,
    pub equity: f64,
}

/// Result of executing one rebalance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub trades: Vec<Trade>,
    pub total_cost: f64,
    pub pre_value: f64,
    pub post_value: f64,
    pub weights_after: BTreeMap<String, f64>,
    /// One-way turnover, half the summed absolute weight change.
    pub turnover: f64,
}

/// Outcome of applying a turnover cap to a proposed target.
#[derive(Debug, Clone, PartialEq)]
pub struct CappedTarget {
    pub weights: BTreeMap<String, f64>,
    /// Turnover the uncapped target would have caused.
    pub proposed_turnover: f64,
    /// Held assets outside the universe, sold in full regardless of the cap.
    pub exited: Vec<String>,
    /// Turnover spent on those exits.
    pub exit_turnover: f64,
    /// True when the target was blended toward current weights.
    pub partial: bool,
}

/// One-way turnover between two weight maps.
pub fn turnover(current: &BTreeMap<String, f64>, target: &BTreeMap<String, f64>) -> f64 {
    let symbols: BTreeSet<&String> = current.keys().chain(target.keys()).collect();
    symbols
        .into_iter()
        .map(|s| {
            let c = current.get(s).copied().unwrap_or(0.0);
            let t = target.get(s).copied().unwrap_or(0.0);
            (t - c).abs()
        })
        .sum::<f64>()
        / 2.0
}

/// Blend `target` toward `current` so turnover does not exceed `max_turnover`.
///
/// Holdings outside `universe` are exits and are always sold in full; only
/// the budget left after them is used to move universe members toward the
/// target. When exits alone exceed the cap, universe members keep their
/// current weights. Weights not reallocated stay in cash.
pub fn apply_turnover_cap(
    current: &BTreeMap<String, f64>,
    target: &BTreeMap<String, f64>,
    universe: &[String],
    max_turnover: Option<f64>,
) -> CappedTarget {
    let members: BTreeSet<&str> = universe.iter().map(String::as_str).collect();
    let (kept, exits): (BTreeMap<String, f64>, BTreeMap<String, f64>) = current
        .iter()
        .map(|(s, w)| (s.clone(), *w))
        .partition(|(s, _)| members.contains(s.as_str()));
    let exit_turnover = exits.values().sum::<f64>() / 2.0;
    let exited: Vec<String> = exits.into_keys().collect();

    let proposed = turnover(current, target);
    let cap = match max_turnover {
        Some(cap) if proposed > cap => cap,
        _ => {
            return CappedTarget {
                weights: target.clone(),
                proposed_turnover: proposed,
                exited,
                exit_turnover,
                partial: false,
            }
        }
    };

    let remaining = turnover(&kept, target);
    let lambda = if remaining > 0.0 {
        ((cap - exit_turnover).max(0.0) / remaining).min(1.0)
    } else {
        0.0
    };
    let symbols: BTreeSet<&String> = kept.keys().chain(target.keys()).collect();
    let weights = symbols
        .into_iter()
        .filter_map(|s| {
            let c = kept.get(s).copied().unwrap_or(0.0);
            let t = target.get(s).copied().unwrap_or(0.0);
            let w = c + lambda * (t - c);
            (w > 0.0).then(|| (s.clone(), w))
        })
        .collect();

    CappedTarget {
        weights,
        proposed_turnover: proposed,
        exited,
        exit_turnover,
        partial: true,
    }
}

/// Holdings, cash and last marks of a simulated portfolio.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioState {
    initial_capital: f64,
    cash: f64,
    quantities: BTreeMap<String, f64>,
    holdings: BTreeMap<String, HoldingInfo>,
    /// Last price used to value each position.
    marks: BTreeMap<String, f64>,
    as_of: Option<NaiveDate>,
    target: Option<BTreeMap<String, f64>>,
    last_rebalance: Option<NaiveDate>,
    peak_equity: f64,
}

impl PortfolioState {
    pub fn new(initial_capital: f64) -> Self {
        Self {
            initial_capital,
            cash: initial_capital,
            quantities: BTreeMap::new(),
            holdings: BTreeMap::new(),
            marks: BTreeMap::new(),
            as_of: None,
            target: None,
            last_rebalance: None,
            peak_equity: initial_capital,
        }
    }

    pub fn initial_capital(&self) -> f64 {
        self.initial_capital
    }

    pub fn cash(&self) -> f64 {
        self.cash
    }

    pub fn quantities(&self) -> &BTreeMap<String, f64> {
        &self.quantities
    }

    pub fn quantity(&self, symbol: &str) -> f64 {
        self.quantities.get(symbol).copied().unwrap_or(0.0)
    }

    /// Current holdings with their holding periods.
    pub fn holdings(&self) -> &BTreeMap<String, HoldingInfo> {
        &self.holdings
    }

    pub fn as_of(&self) -> Option<NaiveDate> {
        self.as_of
    }

    /// Target weights of the last executed rebalance.
    pub fn target(&self) -> Option<&BTreeMap<String, f64>> {
        self.target.as_ref()
    }

    pub fn last_rebalance(&self) -> Option<NaiveDate> {
        self.last_rebalance
    }

    pub fn is_invested(&self) -> bool {
        !self.quantities.is_empty()
    }

    /// Market value of all positions at the last marks.
    pub fn positions_value(&self) -> f64 {
        self.quantities
            .iter()
            .map(|(s, q)| q * self.marks.get(s).copied().unwrap_or(0.0))
            .sum()
    }

    pub fn equity(&self) -> f64 {
        self.cash + self.positions_value()
    }

    /// Weight of each position in total equity, cash excluded.
    pub fn weights(&self) -> BTreeMap<String, f64> {
        let equity = self.equity();
        if equity <= 0.0 {
            return BTreeMap::new();
        }
        self.quantities
            .iter()
            .map(|(s, q)| {
                let price = self.marks.get(s).copied().unwrap_or(0.0);
                (s.clone(), q * price / equity)
            })
            .collect()
    }

    /// Revalue holdings at the latest price on or before `date`.
    ///
    /// Assets without a new print keep their previous mark.
    pub fn mark_to_market(&mut self, history: &PriceHistory, date: NaiveDate) -> Valuation {
        for symbol in self.quantities.keys() {
            if let Some(price) = history.price_on_or_before(symbol, date) {
                self.marks.insert(symbol.clone(), price);
            }
        }
        self.as_of = Some(date);

        let positions_value = self.positions_value();
        Valuation {
            date,
            cash: self.cash,
            positions_value,
            equity: self.cash + positions_value,
        }
    }

    /// Turn a valuation into an equity curve point, tracking the running peak.
    pub fn record_equity(&mut self, valuation: &Valuation) -> EquityPoint {
        self.peak_equity = self.peak_equity.max(valuation.equity);
        let drawdown = self.peak_equity - valuation.equity;
        let drawdown_pct = if self.peak_equity > 0.0 {
            drawdown / self.peak_equity * 100.0
        } else {
            0.0
        };

        EquityPoint {
            date: valuation.date,
            equity: valuation.equity,
            cash: valuation.cash,
            positions_value: valuation.positions_value,
            drawdown,
            drawdown_pct,
        }
    }

    /// Trade to `target` weights at prices on or before `date`.
    ///
    /// Costs are paid from the portfolio, so the invested value is the
    /// pre-trade value net of the costs of reaching it. Weights summing to
    /// less than one leave the remainder in cash.
    pub fn execute(
        &mut self,
        history: &PriceHistory,
        date: NaiveDate,
        target: &BTreeMap<String, f64>,
        costs: &TransactionCostModel,
    ) -> Result<ExecutionReport> {
        let symbols: BTreeSet<&String> = self.quantities.keys().chain(target.keys()).collect();
        let mut prices = BTreeMap::new();
        for symbol in symbols {
            let price = history
                .price_on_or_before(symbol, date)
                .or_else(|| self.marks.get(symbol).copied())
                .ok_or_else(|| {
                    SimulationError::InsufficientData(format!(
                        "no price for {} on or before {}",
                        symbol, date
                    ))
                })?;
            prices.insert(symbol.clone(), price);
        }

        let pre_value: f64 = self.cash
            + self
                .quantities
                .iter()
                .map(|(s, q)| q * prices[s])
                .sum::<f64>();
        if !(pre_value.is_finite() && pre_value > 0.0) {
            return Err(SimulationError::ConstraintViolation(format!(
                "portfolio value {} is not positive",
                pre_value
            )));
        }

        let trade_values = |investable: f64| -> Vec<f64> {
            prices
                .iter()
                .map(|(s, p)| {
                    let current = self.quantity(s) * p;
                    target.get(s).copied().unwrap_or(0.0) * investable - current
                })
                .collect()
        };

        let mut investable = pre_value;
        for _ in 0..MAX_COST_ITERATIONS {
            let next = pre_value - costs.estimate(trade_values(investable));
            let converged = (next - investable).abs() <= 1e-12 * pre_value;
            investable = next;
            if converged {
                break;
            }
        }

        // Plan everything before mutating
        let mut trades = Vec::new();
        let mut quantities = BTreeMap::new();
        let mut cash = self.cash;
        for (symbol, &price) in &prices {
            let current = self.quantity(symbol);
            let weight = target.get(symbol).copied().unwrap_or(0.0);
            let mut desired = weight * investable / price;
            if desired * price < DUST_VALUE {
                desired = 0.0;
            }

            if let Some(trade) = costs.price_trade(symbol, desired - current, price) {
                cash -= trade.quantity_delta * price + trade.cost();
                trades.push(trade);
            } else {
                desired = current;
            }
            if desired > 0.0 {
                quantities.insert(symbol.clone(), desired);
            }
        }

        let total_cost = TransactionCostModel::total_cost(&trades);
        let traded: f64 = trades.iter().map(|t| t.value).sum();

        let holdings = quantities
            .keys()
            .map(|s| {
                let periods_held = self.holdings.get(s).map_or(0, |h| h.periods_held) + 1;
                (s.clone(), HoldingInfo { periods_held })
            })
            .collect();

        self.cash = cash;
        self.quantities = quantities;
        self.holdings = holdings;
        self.marks = prices;
        self.as_of = Some(date);
        self.target = Some(target.clone());
        self.last_rebalance = Some(date);

        let post_value = self.equity();
        debug!(
            "Executed {} trades on {}: cost {:.2}, value {:.2} -> {:.2}",
            trades.len(),
            date,
            total_cost,
            pre_value,
            post_value
        );

        Ok(ExecutionReport {
            trades,
            total_cost,
            pre_value,
            post_value,
            weights_after: self.weights(),
            turnover: traded / (2.0 * pre_value),
        })
    }
}
