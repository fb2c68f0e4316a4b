//! Allocator contract and reference allocators.
//!
//! The simulation loop knows allocators only through [`Allocator`]: given the
//! resolved universe and a return window that ends strictly before the
//! rebalance date, produce long-only weights summing to 1, or fail. Failures
//! are converted into skipped rebalances by the loop.

use crate::data::ReturnWindow;
use crate::error::{Result, SimulationError};
use crate::stats::{sample_std, WindowStatistics, TRADING_DAYS};
use chrono::NaiveDate;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Tolerance for the sum-to-one check on allocator output.
pub const WEIGHT_TOLERANCE: f64 = 1e-6;

const MIN_VOLATILITY: f64 = 1e-8;

/// Everything an allocator may look at for one rebalance.
#[derive(Debug, Clone, Copy)]
pub struct AllocationInput<'a> {
    pub date: NaiveDate,
    /// Resolved universe, alphabetical.
    pub universe: &'a [String],
    /// Returns restricted to the universe, all dated before `date`.
    pub window: &'a ReturnWindow,
    /// Present when the allocator asked for statistics.
    pub statistics: Option<&'a WindowStatistics>,
    /// Weights held going into the rebalance.
    pub current_weights: &'a BTreeMap<String, f64>,
}

impl AllocationInput<'_> {
    fn require_statistics(&self, allocator: &str) -> Result<&WindowStatistics> {
        self.statistics.ok_or_else(|| {
            SimulationError::Optimization(format!("{} needs window statistics", allocator))
        })
    }
}

/// Portfolio construction strategy.
pub trait Allocator: Send + Sync {
    fn name(&self) -> &str;

    /// Whether the loop should fetch covariance and expected returns first.
    fn requires_statistics(&self) -> bool {
        false
    }

    /// Target weights for the universe.
    ///
    /// # Errors
    /// `Optimization` when the method fails to converge, `InsufficientData` when
    /// the window cannot support it.
    fn construct(&self, input: &AllocationInput<'_>) -> Result<BTreeMap<String, f64>>;
}

/// Check allocator output against the universe.
pub fn validate_weights(weights: &BTreeMap<String, f64>, universe: &[String]) -> Result<()> {
    if weights.is_empty() {
        return Err(SimulationError::ConstraintViolation(
            "allocator returned no weights".to_string(),
        ));
    }
    let members: BTreeSet<&str> = universe.iter().map(String::as_str).collect();

    for (symbol, &w) in weights {
        if !members.contains(symbol.as_str()) {
            return Err(SimulationError::ConstraintViolation(format!(
                "weight for {} outside the resolved universe",
                symbol
            )));
        }
        if !w.is_finite() || w < -WEIGHT_TOLERANCE {
            return Err(SimulationError::ConstraintViolation(format!(
                "invalid weight {} for {}",
                w, symbol
            )));
        }
    }

    let total: f64 = weights.values().sum();
    if (total - 1.0).abs() > WEIGHT_TOLERANCE {
        return Err(SimulationError::ConstraintViolation(format!(
            "weights sum to {:.8}, expected 1",
            total
        )));
    }
    Ok(())
}

fn normalized(symbols: &[String], raw: &[f64]) -> BTreeMap<String, f64> {
    let total: f64 = raw.iter().sum();
    symbols
        .iter()
        .zip(raw)
        .map(|(s, w)| (s.clone(), w / total))
        .collect()
}

fn non_empty(universe: &[String]) -> Result<()> {
    if universe.is_empty() {
        return Err(SimulationError::InsufficientData(
            "membership resolved to an empty universe".to_string(),
        ));
    }
    Ok(())
}

/// 1/N across the universe.
#[derive(Debug, Clone, Copy, Default)]
pub struct EqualWeightAllocator;

impl Allocator for EqualWeightAllocator {
    fn name(&self) -> &str {
        "Equal Weight"
    }

    fn construct(&self, input: &AllocationInput<'_>) -> Result<BTreeMap<String, f64>> {
        non_empty(input.universe)?;
        let w = 1.0 / input.universe.len() as f64;
        Ok(input.universe.iter().map(|s| (s.clone(), w)).collect())
    }
}

/// Weights proportional to 1 / realized volatility.
#[derive(Debug, Clone, Copy)]
pub struct InverseVolatilityAllocator {
    /// Minimum valid returns per asset.
    pub min_periods: usize,
}

impl Default for InverseVolatilityAllocator {
    fn default() -> Self {
        Self { min_periods: 20 }
    }
}

impl Allocator for InverseVolatilityAllocator {
    fn name(&self) -> &str {
        "Inverse Volatility"
    }

    fn construct(&self, input: &AllocationInput<'_>) -> Result<BTreeMap<String, f64>> {
        non_empty(input.universe)?;
        let mut inverse = Vec::with_capacity(input.universe.len());
        for symbol in input.universe {
            let column = input.window.column(symbol).unwrap_or(&[]);
            let valid = column.iter().filter(|r| r.is_finite()).count();
            let vol = match sample_std(column) {
                Some(sd) if valid >= self.min_periods.max(2) => sd * TRADING_DAYS.sqrt(),
                _ => {
                    return Err(SimulationError::InsufficientData(format!(
                        "{}: {} valid returns, need {} for volatility",
                        symbol, valid, self.min_periods
                    )))
                }
            };
            inverse.push(1.0 / vol.max(MIN_VOLATILITY));
        }
        Ok(normalized(input.universe, &inverse))
    }
}

/// Equal risk contribution by cyclical coordinate descent.
#[derive(Debug, Clone, Copy)]
pub struct RiskParityAllocator {
    pub max_iterations: usize,
    /// Largest allowed gap between any asset's risk share and 1/N.
    pub tolerance: f64,
}

impl Default for RiskParityAllocator {
    fn default() -> Self {
        Self {
            max_iterations: 1_000,
            tolerance: 1e-8,
        }
    }
}

impl RiskParityAllocator {
    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Solve for ERC weights over `stats.symbols`.
    pub fn solve(&self, stats: &WindowStatistics) -> Result<BTreeMap<String, f64>> {
        let cov = &stats.covariance;
        let n = stats.symbols.len();
        if n == 0 {
            return Err(SimulationError::InsufficientData(
                "risk parity on an empty universe".to_string(),
            ));
        }
        if let Some(i) = (0..n).find(|&i| !(cov[i][i] > 0.0)) {
            return Err(SimulationError::Optimization(format!(
                "{} has non-positive variance",
                stats.symbols[i]
            )));
        }

        let budget = 1.0 / n as f64;
        let mut x: Vec<f64> = (0..n).map(|i| 1.0 / cov[i][i].sqrt()).collect();

        for iteration in 1..=self.max_iterations {
            for i in 0..n {
                let sigma = stats.portfolio_variance(&x).sqrt();
                let c: f64 = (0..n).filter(|&j| j != i).map(|j| cov[i][j] * x[j]).sum();
                x[i] = (-c + (c * c + 4.0 * cov[i][i] * budget * sigma).sqrt()) / (2.0 * cov[i][i]);
            }

            let gap = risk_shares(stats, &x)?
                .iter()
                .map(|s| (s - budget).abs())
                .fold(0.0, f64::max);
            if gap < self.tolerance {
                debug!("Risk parity converged after {} iterations", iteration);
                return Ok(normalized(&stats.symbols, &x));
            }
        }

        Err(SimulationError::Optimization(format!(
            "risk parity did not converge in {} iterations",
            self.max_iterations
        )))
    }
}

/// Fraction of portfolio variance contributed by each asset.
pub fn risk_shares(stats: &WindowStatistics, weights: &[f64]) -> Result<Vec<f64>> {
    let total = stats.portfolio_variance(weights);
    if !(total.is_finite() && total > 0.0) {
        return Err(SimulationError::Optimization(format!(
            "portfolio variance {} is not positive",
            total
        )));
    }
    let n = weights.len();
    Ok((0..n)
        .map(|i| {
            let marginal: f64 = (0..n).map(|j| stats.covariance[i][j] * weights[j]).sum();
            weights[i] * marginal / total
        })
        .collect())
}

impl Allocator for RiskParityAllocator {
    fn name(&self) -> &str {
        "Risk Parity"
    }

    fn requires_statistics(&self) -> bool {
        true
    }

    fn construct(&self, input: &AllocationInput<'_>) -> Result<BTreeMap<String, f64>> {
        non_empty(input.universe)?;
        self.solve(input.require_statistics(self.name())?)
    }
}

/// Long-only minimum variance, solved as a quadratic program.
///
/// Minimizes `wᵀΣw` subject to `Σw = 1` and `w >= 0` with the Clarabel
/// interior-point solver.
#[derive(Debug, Clone, Copy)]
pub struct MinimumVarianceAllocator {
    pub max_iterations: u32,
}

impl Default for MinimumVarianceAllocator {
    fn default() -> Self {
        Self {
            max_iterations: 200,
        }
    }
}

impl MinimumVarianceAllocator {
    pub fn solve(&self, stats: &WindowStatistics) -> Result<BTreeMap<String, f64>> {
        use clarabel::algebra::*;
        use clarabel::solver::*;

        let cov = &stats.covariance;
        let n = stats.symbols.len();
        if n == 0 {
            return Err(SimulationError::InsufficientData(
                "minimum variance on an empty universe".to_string(),
            ));
        }
        if cov.iter().flatten().any(|v| !v.is_finite()) {
            return Err(SimulationError::Optimization(
                "covariance matrix has non-finite entries".to_string(),
            ));
        }

        // P in CSC form, upper triangle only
        let mut p_data = Vec::new();
        let mut p_indices = Vec::new();
        let mut p_indptr = vec![0];
        for j in 0..n {
            for (i, row) in cov.iter().enumerate().take(j + 1) {
                if row[j].abs() > 1e-14 {
                    p_data.push(row[j]);
                    p_indices.push(i);
                }
            }
            p_indptr.push(p_data.len());
        }
        let p = CscMatrix::new(n, n, p_indptr, p_indices, p_data);
        let q = vec![0.0; n];

        // Row 0: sum(w) = 1. Rows 1..=n: -w <= 0.
        let mut a_data = Vec::with_capacity(2 * n);
        let mut a_indices = Vec::with_capacity(2 * n);
        let mut a_indptr = vec![0];
        for j in 0..n {
            a_data.push(1.0);
            a_indices.push(0);
            a_data.push(-1.0);
            a_indices.push(1 + j);
            a_indptr.push(a_data.len());
        }
        let a = CscMatrix::new(1 + n, n, a_indptr, a_indices, a_data);

        let mut b = vec![1.0];
        b.extend(vec![0.0; n]);
        let cones = [ZeroConeT(1), NonnegativeConeT(n)];

        let settings = DefaultSettingsBuilder::default()
            .max_iter(self.max_iterations)
            .verbose(false)
            .build()
            .map_err(|e| {
                SimulationError::Optimization(format!("failed to build solver settings: {}", e))
            })?;

        let mut solver = DefaultSolver::new(&p, &q, &a, &b, &cones, settings).map_err(|e| {
            SimulationError::Optimization(format!("failed to create solver: {:?}", e))
        })?;
        solver.solve();

        if !matches!(solver.solution.status, SolverStatus::Solved) {
            return Err(SimulationError::Optimization(format!(
                "minimum variance failed with status {:?}",
                solver.solution.status
            )));
        }
        debug!(
            "Minimum variance solved in {} iterations",
            solver.solution.iterations
        );

        // Clip solver noise below zero
        let raw: Vec<f64> = solver.solution.x.iter().map(|w| w.max(0.0)).collect();
        if !(raw.iter().sum::<f64>() > 0.0) {
            return Err(SimulationError::Optimization(
                "minimum variance returned no positive weight".to_string(),
            ));
        }
        Ok(normalized(&stats.symbols, &raw))
    }
}

impl Allocator for MinimumVarianceAllocator {
    fn name(&self) -> &str {
        "Minimum Variance"
    }

    fn requires_statistics(&self) -> bool {
        true
    }

    fn construct(&self, input: &AllocationInput<'_>) -> Result<BTreeMap<String, f64>> {
        non_empty(input.universe)?;
        self.solve(input.require_statistics(self.name())?)
    }
}
