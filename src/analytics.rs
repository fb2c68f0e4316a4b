//! Run summary metrics and report formatting.

use crate::engine::SimulationResult;
use crate::stats::TRADING_DAYS;
use crate::types::RunState;
use serde::{Deserialize, Serialize};
use tabled::{builder::Builder, settings::Style};

/// Headline numbers for one simulation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub allocator: String,
    pub run_state: RunState,
    pub days: usize,
    pub initial_capital: f64,
    pub final_equity: f64,
    pub total_return_pct: f64,
    pub annual_return_pct: f64,
    pub max_drawdown_pct: f64,
    /// Annualized, zero risk-free rate.
    pub sharpe_ratio: f64,
    pub volatility_pct: f64,
    pub rebalances: usize,
    pub skipped: usize,
    pub partial_rebalances: usize,
    pub total_costs: f64,
    pub avg_turnover: f64,
    pub all_rebalances_skipped: bool,
}

/// Compute summary metrics from a finished run.
pub fn summarize(result: &SimulationResult) -> RunSummary {
    let curve = &result.equity_curve;
    let initial = result.initial_capital;
    let final_equity = result.final_equity;

    let total_return_pct = if initial > 0.0 {
        (final_equity - initial) / initial * 100.0
    } else {
        0.0
    };

    let annual_return_pct = match (result.start_date, result.end_date) {
        (Some(start), Some(end)) if end > start && initial > 0.0 => {
            let years = (end - start).num_days() as f64 / 365.0;
            ((final_equity / initial).powf(1.0 / years) - 1.0) * 100.0
        }
        _ => 0.0,
    };

    let max_drawdown_pct = curve
        .iter()
        .map(|p| p.drawdown_pct)
        .fold(0.0_f64, f64::max);

    let returns: Vec<f64> = curve
        .windows(2)
        .filter(|w| w[0].equity > 0.0)
        .map(|w| (w[1].equity - w[0].equity) / w[0].equity)
        .collect();

    let total_costs: f64 = result.rebalances.iter().map(|e| e.total_cost).sum();
    let avg_turnover = if result.rebalances.is_empty() {
        0.0
    } else {
        result.rebalances.iter().map(|e| e.turnover).sum::<f64>() / result.rebalances.len() as f64
    };

    RunSummary {
        allocator: result.allocator.clone(),
        run_state: result.run_state,
        days: curve.len(),
        initial_capital: initial,
        final_equity,
        total_return_pct,
        annual_return_pct,
        max_drawdown_pct,
        sharpe_ratio: sharpe_ratio(&returns),
        volatility_pct: std_dev(&returns) * TRADING_DAYS.sqrt() * 100.0,
        rebalances: result.rebalances.len(),
        skipped: result.skipped.len(),
        partial_rebalances: result.rebalances.iter().filter(|e| e.partial).count(),
        total_costs,
        avg_turnover,
        all_rebalances_skipped: result.all_rebalances_skipped,
    }
}

fn std_dev(returns: &[f64]) -> f64 {
    if returns.is_empty() {
        return 0.0;
    }
    let mean = returns.iter().sum::<f64>() / returns.len() as f64;
    let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / returns.len() as f64;
    variance.sqrt()
}

/// Annualized Sharpe ratio of daily returns.
pub fn sharpe_ratio(returns: &[f64]) -> f64 {
    let sd = std_dev(returns);
    if sd == 0.0 {
        return 0.0;
    }
    let mean = returns.iter().sum::<f64>() / returns.len() as f64;
    (mean / sd) * TRADING_DAYS.sqrt()
}

/// Plain-text tables for the command line.
pub struct ResultFormatter;

impl ResultFormatter {
    pub fn summary_table(summary: &RunSummary) -> String {
        let mut builder = Builder::new();
        builder.push_record(["Metric", "Value"]);
        let rows = [
            ("Allocator", summary.allocator.clone()),
            ("State", summary.run_state.to_string()),
            ("Days", summary.days.to_string()),
            ("Initial capital", format!("{:.2}", summary.initial_capital)),
            ("Final equity", format!("{:.2}", summary.final_equity)),
            ("Total return %", format!("{:.2}", summary.total_return_pct)),
            ("Annual return %", format!("{:.2}", summary.annual_return_pct)),
            ("Max drawdown %", format!("{:.2}", -summary.max_drawdown_pct)),
            ("Volatility %", format!("{:.2}", summary.volatility_pct)),
            ("Sharpe", format!("{:.2}", summary.sharpe_ratio)),
            ("Rebalances", summary.rebalances.to_string()),
            ("Partial", summary.partial_rebalances.to_string()),
            ("Skipped", summary.skipped.to_string()),
            ("Total costs", format!("{:.2}", summary.total_costs)),
            ("Avg turnover", format!("{:.4}", summary.avg_turnover)),
        ];
        for (name, value) in rows {
            builder.push_record([name.to_string(), value]);
        }
        builder.build().with(Style::rounded()).to_string()
    }

    /// Every skipped rebalance with its reason, or `None` when nothing was skipped.
    pub fn skipped_table(result: &SimulationResult) -> Option<String> {
        if result.skipped.is_empty() {
            return None;
        }
        let mut builder = Builder::new();
        builder.push_record(["Date", "Trigger", "Kind", "Reason"]);
        for skip in &result.skipped {
            builder.push_record([
                skip.date.to_string(),
                skip.trigger.to_string(),
                skip.kind.to_string(),
                skip.reason.clone(),
            ]);
        }
        Some(builder.build().with(Style::rounded()).to_string())
    }

    /// Summary plus skip list, with a banner when every rebalance was skipped.
    pub fn report(result: &SimulationResult) -> String {
        let summary = summarize(result);
        let mut out = String::new();
        if summary.all_rebalances_skipped {
            out.push_str("WARNING: every rebalance was skipped; the portfolio never traded\n\n");
        }
        out.push_str(&Self::summary_table(&summary));
        if let Some(skips) = Self::skipped_table(result) {
            out.push_str("\n\nSkipped rebalances\n");
            out.push_str(&skips);
        }
        out.push('\n');
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheStats;
    use crate::error::ErrorKind;
    use crate::portfolio::PortfolioState;
    use crate::types::{EquityPoint, SkippedRebalance, TriggerKind};
    use chrono::NaiveDate;

    fn day(n: i64) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 1).unwrap() + chrono::Duration::days(n)
    }

    fn result_with_curve(equities: &[f64]) -> SimulationResult {
        let mut peak = equities[0];
        let equity_curve: Vec<EquityPoint> = equities
            .iter()
            .enumerate()
            .map(|(i, &e)| {
                peak = peak.max(e);
                EquityPoint {
                    date: day(i as i64),
                    equity: e,
                    cash: 0.0,
                    positions_value: e,
                    drawdown: peak - e,
                    drawdown_pct: (peak - e) / peak * 100.0,
                }
            })
            .collect();

        SimulationResult {
            run_state: RunState::Completed,
            allocator: "Equal Weight".to_string(),
            start_date: equity_curve.first().map(|p| p.date),
            end_date: equity_curve.last().map(|p| p.date),
            initial_capital: equities[0],
            final_equity: *equities.last().unwrap(),
            equity_curve,
            rebalances: Vec::new(),
            skipped: Vec::new(),
            slice_materializations: 0,
            cache_stats: CacheStats::default(),
            final_state: PortfolioState::new(equities[0]),
            all_rebalances_skipped: false,
        }
    }

    #[test]
    fn test_summary_metrics() {
        let result = result_with_curve(&[100.0, 110.0, 99.0, 120.0]);
        let summary = summarize(&result);
        assert!((summary.total_return_pct - 20.0).abs() < 1e-9);
        assert!((summary.max_drawdown_pct - 10.0).abs() < 1e-9);
        assert!(summary.sharpe_ratio > 0.0);
        assert_eq!(summary.days, 4);
    }

    #[test]
    fn test_flat_curve_has_zero_sharpe() {
        let result = result_with_curve(&[100.0, 100.0, 100.0]);
        let summary = summarize(&result);
        assert_eq!(summary.sharpe_ratio, 0.0);
        assert_eq!(summary.max_drawdown_pct, 0.0);
    }

    #[test]
    fn test_report_lists_skips() {
        let mut result = result_with_curve(&[100.0, 100.0]);
        result.skipped.push(SkippedRebalance {
            date: day(1),
            trigger: TriggerKind::Scheduled,
            kind: ErrorKind::InsufficientData,
            reason: "no scores".to_string(),
        });
        result.all_rebalances_skipped = true;

        let report = ResultFormatter::report(&result);
        assert!(report.starts_with("WARNING"));
        assert!(report.contains("no scores"));
        assert!(report.contains("insufficient_data"));
    }
}
