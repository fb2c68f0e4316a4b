//! Factor scoring and top-K preselection.
//!
//! Scores are computed only from a [`ReturnWindow`], whose rows all precede
//! the rebalance date. Ranking is by score descending with ties broken by
//! ascending symbol, so the same inputs always produce the same ranking.

use crate::config::{FactorMethod, Preselection, PreselectionConfig};
use crate::data::ReturnWindow;
use crate::error::{Result, SimulationError};
use crate::stats::{cumulative_return, sample_std, valid_count, zscores};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use tracing::debug;

/// Volatility floor so a flat series gets a large but finite low-vol score.
const MIN_VOLATILITY: f64 = 1e-8;

/// Factor values for one asset. NaN marks an unscoreable factor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactorScore {
    pub symbol: String,
    pub momentum: f64,
    pub low_vol: f64,
    /// Value used for ranking under the configured method.
    pub score: f64,
}

impl FactorScore {
    pub fn is_valid(&self) -> bool {
        self.score.is_finite()
    }
}

/// Output of preselection for one rebalance date.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RankedCandidates {
    /// Rankable candidates, best first. Rank of `ranking[i]` is `i + 1`.
    pub ranking: Vec<String>,
    /// Core selection: the first `top_k` of the ranking, or everything on passthrough.
    pub selected: Vec<String>,
    /// Scores of every eligible asset, alphabetical. Empty on passthrough.
    pub scores: Vec<FactorScore>,
    /// True when no factor ranking was applied.
    pub passthrough: bool,
}

impl RankedCandidates {
    /// Passthrough of an eligible set, ranked alphabetically.
    pub fn passthrough(eligible: &[String]) -> Self {
        let mut ranking = eligible.to_vec();
        ranking.sort();
        ranking.dedup();
        Self {
            selected: ranking.clone(),
            ranking,
            scores: Vec::new(),
            passthrough: true,
        }
    }

    /// 1-based rank of `symbol`, if it is rankable.
    pub fn rank_of(&self, symbol: &str) -> Option<usize> {
        self.ranking.iter().position(|s| s == symbol).map(|i| i + 1)
    }
}

/// Order by score descending, then symbol ascending.
pub fn rank_order(a: (&str, f64), b: (&str, f64)) -> Ordering {
    b.1.total_cmp(&a.1).then_with(|| a.0.cmp(b.0))
}

/// Sort valid scores and return the symbols in rank order.
///
/// NaN scores are dropped.
pub fn rank_scores(scores: &[(String, f64)]) -> Vec<String> {
    let mut valid: Vec<(&str, f64)> = scores
        .iter()
        .filter(|(_, s)| s.is_finite())
        .map(|(sym, s)| (sym.as_str(), *s))
        .collect();
    valid.sort_by(|a, b| rank_order(*a, *b));
    valid.into_iter().map(|(s, _)| s.to_string()).collect()
}

/// Take the best `top_k` of `scores`, or all valid ones when fewer exist.
pub fn select_top_k(scores: &[(String, f64)], top_k: usize) -> Vec<String> {
    let mut ranked = rank_scores(scores);
    ranked.truncate(top_k);
    ranked
}

/// Runs the configured preselection.
#[derive(Debug, Clone)]
pub struct PreselectionEngine {
    preselection: Preselection,
}

impl PreselectionEngine {
    pub fn new(preselection: Preselection) -> Self {
        Self { preselection }
    }

    /// Rank `eligible` using `window`.
    ///
    /// Fails with `InsufficientData` when preselection is active and no asset
    /// has enough history to be scored.
    pub fn run(&self, eligible: &[String], window: &ReturnWindow) -> Result<RankedCandidates> {
        let cfg = match &self.preselection {
            Preselection::Disabled => return Ok(RankedCandidates::passthrough(eligible)),
            Preselection::Enabled(cfg) if cfg.top_k == 0 => {
                return Ok(RankedCandidates::passthrough(eligible))
            }
            Preselection::Enabled(cfg) => cfg,
        };

        let mut symbols = eligible.to_vec();
        symbols.sort();
        symbols.dedup();

        let scores = score_assets(cfg, &symbols, window);
        let pairs: Vec<(String, f64)> = scores
            .iter()
            .map(|s| (s.symbol.clone(), s.score))
            .collect();
        let ranking = rank_scores(&pairs);

        if ranking.is_empty() {
            return Err(SimulationError::InsufficientData(format!(
                "no asset out of {} eligible has {} valid returns for {:?} scoring before {}",
                symbols.len(),
                cfg.min_periods,
                cfg.method,
                window.cutoff()
            )));
        }

        let selected: Vec<String> = ranking.iter().take(cfg.top_k).cloned().collect();
        debug!(
            "Preselection on {}: {} scored, {} selected (top_k = {})",
            window.cutoff(),
            ranking.len(),
            selected.len(),
            cfg.top_k
        );

        Ok(RankedCandidates {
            ranking,
            selected,
            scores,
            passthrough: false,
        })
    }
}

/// Momentum: compounded return over `[t - lookback, t - skip)`.
pub fn momentum_score(window: &ReturnWindow, symbol: &str, cfg: &PreselectionConfig) -> f64 {
    match window.tail(symbol, cfg.lookback, cfg.skip) {
        Some(returns) if valid_count(returns) >= cfg.min_periods => cumulative_return(returns),
        _ => f64::NAN,
    }
}

/// Low volatility: inverse sample deviation of returns over `[t - lookback, t)`.
pub fn low_vol_score(window: &ReturnWindow, symbol: &str, cfg: &PreselectionConfig) -> f64 {
    match window.tail(symbol, cfg.lookback, 0) {
        Some(returns) if valid_count(returns) >= cfg.min_periods => sample_std(returns)
            .map(|sd| 1.0 / sd.max(MIN_VOLATILITY))
            .unwrap_or(f64::NAN),
        _ => f64::NAN,
    }
}

/// Score every symbol under the configured method.
pub fn score_assets(
    cfg: &PreselectionConfig,
    symbols: &[String],
    window: &ReturnWindow,
) -> Vec<FactorScore> {
    let momentum: Vec<f64> = match cfg.method {
        FactorMethod::LowVol => vec![f64::NAN; symbols.len()],
        _ => symbols
            .iter()
            .map(|s| momentum_score(window, s, cfg))
            .collect(),
    };
    let low_vol: Vec<f64> = match cfg.method {
        FactorMethod::Momentum => vec![f64::NAN; symbols.len()],
        _ => symbols
            .iter()
            .map(|s| low_vol_score(window, s, cfg))
            .collect(),
    };

    let score: Vec<f64> = match cfg.method {
        FactorMethod::Momentum => momentum.clone(),
        FactorMethod::LowVol => low_vol.clone(),
        FactorMethod::Combined => combine(cfg, &momentum, &low_vol),
    };

    symbols
        .iter()
        .enumerate()
        .map(|(i, s)| FactorScore {
            symbol: s.clone(),
            momentum: momentum[i],
            low_vol: low_vol[i],
            score: score[i],
        })
        .collect()
}

/// Weighted sum of cross-sectional z-scores over assets with both factors.
fn combine(cfg: &PreselectionConfig, momentum: &[f64], low_vol: &[f64]) -> Vec<f64> {
    let both: Vec<bool> = momentum
        .iter()
        .zip(low_vol)
        .map(|(m, l)| m.is_finite() && l.is_finite())
        .collect();
    let mask = |values: &[f64]| -> Vec<f64> {
        values
            .iter()
            .zip(&both)
            .map(|(v, ok)| if *ok { *v } else { f64::NAN })
            .collect()
    };

    let zm = zscores(&mask(momentum));
    let zl = zscores(&mask(low_vol));
    zm.iter()
        .zip(&zl)
        .map(|(m, l)| cfg.momentum_weight * m + cfg.low_vol_weight * l)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::PriceHistory;
    use chrono::NaiveDate;

    fn day(n: i64) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 1).unwrap() + chrono::Duration::days(n)
    }

    fn add_returns(history: &mut PriceHistory, symbol: &str, returns: &[f64]) {
        let mut price = 100.0;
        let mut prices = vec![(day(0), price)];
        for (i, r) in returns.iter().enumerate() {
            price *= 1.0 + r;
            prices.push((day(i as i64 + 1), price));
        }
        history.add_prices(symbol, &prices).unwrap();
    }

    fn window_for(history: &PriceHistory, cutoff: NaiveDate, rows: usize) -> ReturnWindow {
        let calendar = history.calendar();
        let symbols: Vec<String> = history.symbols().map(str::to_string).collect();
        history.materialize_window(&calendar, &symbols, cutoff, rows)
    }

    fn momentum_cfg(top_k: usize, lookback: usize, skip: usize) -> PreselectionConfig {
        PreselectionConfig {
            method: FactorMethod::Momentum,
            top_k,
            lookback,
            skip,
            min_periods: 2,
            ..Default::default()
        }
    }

    fn strs(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_tie_break_alphabetical() {
        let scores = vec![
            ("C".to_string(), 0.4),
            ("B".to_string(), 0.5),
            ("A".to_string(), 0.5),
        ];
        assert_eq!(select_top_k(&scores, 2), strs(&["A", "B"]));
    }

    #[test]
    fn test_fewer_valid_than_top_k() {
        let scores = vec![("A".to_string(), f64::NAN), ("B".to_string(), 0.1)];
        assert_eq!(select_top_k(&scores, 5), strs(&["B"]));
    }

    #[test]
    fn test_momentum_respects_skip() {
        let mut h = PriceHistory::new();
        // Strong recent rally in the skipped region only
        add_returns(&mut h, "AAA", &[0.01, 0.01, 0.01, 0.01, 0.50]);
        add_returns(&mut h, "BBB", &[0.02, 0.02, 0.02, 0.02, -0.10]);
        let window = window_for(&h, day(6), 10);
        let cfg = momentum_cfg(1, 5, 1);

        let engine = PreselectionEngine::new(Preselection::Enabled(cfg));
        let ranked = engine.run(&strs(&["AAA", "BBB"]), &window).unwrap();
        assert_eq!(ranked.selected, strs(&["BBB"]));
        assert_eq!(ranked.rank_of("AAA"), Some(2));
    }

    #[test]
    fn test_low_vol_prefers_calm_asset() {
        let mut h = PriceHistory::new();
        add_returns(&mut h, "CALM", &[0.001, -0.001, 0.001, -0.001, 0.001]);
        add_returns(&mut h, "WILD", &[0.05, -0.05, 0.05, -0.05, 0.05]);
        let window = window_for(&h, day(6), 10);
        let cfg = PreselectionConfig {
            method: FactorMethod::LowVol,
            top_k: 1,
            lookback: 5,
            skip: 0,
            min_periods: 3,
            ..Default::default()
        };
        let ranked = PreselectionEngine::new(Preselection::Enabled(cfg))
            .run(&strs(&["CALM", "WILD"]), &window)
            .unwrap();
        assert_eq!(ranked.selected, strs(&["CALM"]));
    }

    #[test]
    fn test_combined_rewards_both_factors() {
        let mut h = PriceHistory::new();
        // BBB has both higher drift and lower volatility
        add_returns(&mut h, "AAA", &[0.01, 0.03, 0.01, 0.03, 0.01]);
        add_returns(&mut h, "BBB", &[0.02, 0.025, 0.02, 0.025, 0.02]);
        let window = window_for(&h, day(6), 10);
        let cfg = PreselectionConfig {
            method: FactorMethod::Combined,
            top_k: 2,
            lookback: 5,
            skip: 0,
            min_periods: 3,
            momentum_weight: 0.5,
            low_vol_weight: 0.5,
        };
        let scores = score_assets(&cfg, &strs(&["AAA", "BBB"]), &window);
        assert!(scores.iter().all(|s| s.score.is_finite()));
        assert!(scores[1].score > scores[0].score);
    }

    #[test]
    fn test_all_unscoreable_is_insufficient_data() {
        let mut h = PriceHistory::new();
        add_returns(&mut h, "AAA", &[0.01]);
        let window = window_for(&h, day(2), 10);
        let engine = PreselectionEngine::new(Preselection::Enabled(momentum_cfg(3, 5, 0)));
        let err = engine.run(&strs(&["AAA"]), &window).unwrap_err();
        assert!(matches!(err, SimulationError::InsufficientData(_)));

        let empty = engine.run(&[], &window).unwrap_err();
        assert!(matches!(empty, SimulationError::InsufficientData(_)));
    }

    #[test]
    fn test_passthrough_modes() {
        let h = PriceHistory::new();
        let window = window_for(&h, day(1), 5);
        let eligible = strs(&["ZZZ", "AAA"]);

        let disabled = PreselectionEngine::new(Preselection::Disabled)
            .run(&eligible, &window)
            .unwrap();
        assert!(disabled.passthrough);
        assert_eq!(disabled.selected, strs(&["AAA", "ZZZ"]));

        let zero = PreselectionEngine::new(Preselection::Enabled(momentum_cfg(0, 5, 0)))
            .run(&eligible, &window)
            .unwrap();
        assert!(zero.passthrough);
        assert_eq!(zero.ranking, strs(&["AAA", "ZZZ"]));
    }
}
