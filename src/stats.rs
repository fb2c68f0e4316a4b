//! Return statistics shared by the factor scores, the statistics cache and the
//! reference allocators.

use crate::data::ReturnWindow;
use crate::error::{Result, SimulationError};
use serde::{Deserialize, Serialize};

/// Periods per year used to annualize daily statistics.
pub const TRADING_DAYS: f64 = 252.0;

/// Mean of the finite values, or NaN when there are none.
pub fn mean(values: &[f64]) -> f64 {
    let (sum, n) = values
        .iter()
        .filter(|v| v.is_finite())
        .fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    if n == 0 {
        f64::NAN
    } else {
        sum / n as f64
    }
}

/// Sample standard deviation (n - 1) of the finite values.
pub fn sample_std(values: &[f64]) -> Option<f64> {
    let finite: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if finite.len() < 2 {
        return None;
    }
    let m = finite.iter().sum::<f64>() / finite.len() as f64;
    let var = finite.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (finite.len() - 1) as f64;
    Some(var.sqrt())
}

/// Compounded return of the finite values.
pub fn cumulative_return(values: &[f64]) -> f64 {
    values
        .iter()
        .filter(|v| v.is_finite())
        .fold(1.0, |acc, r| acc * (1.0 + r))
        - 1.0
}

/// Number of finite values.
pub fn valid_count(values: &[f64]) -> usize {
    values.iter().filter(|v| v.is_finite()).count()
}

/// Cross-sectional z-scores.
///
/// NaN inputs stay NaN and are excluded from the mean and deviation. When the
/// deviation is zero every finite input maps to 0.0.
pub fn zscores(values: &[f64]) -> Vec<f64> {
    let finite: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if finite.is_empty() {
        return vec![f64::NAN; values.len()];
    }
    let m = finite.iter().sum::<f64>() / finite.len() as f64;
    let sd = (finite.iter().map(|v| (v - m).powi(2)).sum::<f64>() / finite.len() as f64).sqrt();

    values
        .iter()
        .map(|v| {
            if !v.is_finite() {
                f64::NAN
            } else if sd <= f64::EPSILON {
                0.0
            } else {
                (v - m) / sd
            }
        })
        .collect()
}

/// Expected returns and covariance for one window and asset set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowStatistics {
    /// Symbols in the order of the vectors below.
    pub symbols: Vec<String>,
    /// Annualized mean returns.
    pub expected_returns: Vec<f64>,
    /// Annualized covariance matrix (n × n).
    pub covariance: Vec<Vec<f64>>,
    /// Rows on which every asset had a return.
    pub observations: usize,
}

impl WindowStatistics {
    /// Annualized volatility per asset, from the covariance diagonal.
    pub fn volatilities(&self) -> Vec<f64> {
        (0..self.symbols.len())
            .map(|i| self.covariance[i][i].max(0.0).sqrt())
            .collect()
    }

    /// Portfolio variance for weights given in symbol order.
    pub fn portfolio_variance(&self, weights: &[f64]) -> f64 {
        let n = weights.len();
        let mut var = 0.0;
        for i in 0..n {
            for j in 0..n {
                var += weights[i] * weights[j] * self.covariance[i][j];
            }
        }
        var
    }
}

/// Compute annualized expected returns and covariance from a window.
///
/// Only rows where every asset has a finite return are used, so the matrix is
/// always positive semi-definite.
pub fn compute_statistics(window: &ReturnWindow) -> Result<WindowStatistics> {
    let symbols = window.symbols().to_vec();
    let n = symbols.len();
    if n == 0 {
        return Err(SimulationError::InsufficientData(
            "no assets to estimate statistics for".to_string(),
        ));
    }

    let columns: Vec<&[f64]> = symbols
        .iter()
        .filter_map(|s| window.column(s))
        .collect();

    let complete_rows: Vec<usize> = (0..window.rows())
        .filter(|&r| columns.iter().all(|c| c[r].is_finite()))
        .collect();
    let t = complete_rows.len();
    if t < 2 {
        return Err(SimulationError::InsufficientData(format!(
            "need at least 2 complete return rows for covariance, have {}",
            t
        )));
    }

    let means: Vec<f64> = columns
        .iter()
        .map(|c| complete_rows.iter().map(|&r| c[r]).sum::<f64>() / t as f64)
        .collect();

    let mut covariance = vec![vec![0.0; n]; n];
    for i in 0..n {
        for j in i..n {
            let cov = complete_rows
                .iter()
                .map(|&r| (columns[i][r] - means[i]) * (columns[j][r] - means[j]))
                .sum::<f64>()
                / (t - 1) as f64
                * TRADING_DAYS;
            covariance[i][j] = cov;
            covariance[j][i] = cov;
        }
    }

    Ok(WindowStatistics {
        symbols,
        expected_returns: means.iter().map(|m| m * TRADING_DAYS).collect(),
        covariance,
        observations: t,
    })
}
