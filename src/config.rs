//! Simulation configuration.
//!
//! Everything the engine needs is described by [`SimulationConfig`], which can be
//! built in code or loaded from a TOML file. A config must pass
//! [`SimulationConfig::validate`] to become a [`ValidatedConfig`], the only form
//! the engine accepts. Invalid combinations are rejected here, before any
//! simulated day runs.

use crate::error::{Result, SimulationError};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::info;

const WEIGHT_SUM_TOLERANCE: f64 = 1e-9;

/// Calendar cadence for scheduled rebalances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RebalanceFrequency {
    Daily,
    Weekly,
    #[default]
    Monthly,
    Quarterly,
    Annual,
}

/// Factor used to rank eligible assets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FactorMethod {
    #[default]
    Momentum,
    LowVol,
    Combined,
}

impl FactorMethod {
    fn uses_momentum(self) -> bool {
        matches!(self, FactorMethod::Momentum | FactorMethod::Combined)
    }
}

/// Factor preselection parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreselectionConfig {
    pub method: FactorMethod,
    /// Number of candidates to keep. Zero turns preselection into a passthrough.
    pub top_k: usize,
    /// Rows of history feeding the factor scores.
    pub lookback: usize,
    /// Most recent rows excluded from the momentum window.
    pub skip: usize,
    pub momentum_weight: f64,
    pub low_vol_weight: f64,
    /// Minimum valid returns an asset needs to be scored.
    pub min_periods: usize,
}

impl Default for PreselectionConfig {
    fn default() -> Self {
        Self {
            method: FactorMethod::Momentum,
            top_k: 20,
            lookback: 252,
            skip: 21,
            momentum_weight: 0.5,
            low_vol_weight: 0.5,
            min_periods: 60,
        }
    }
}

/// Optional preselection stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Preselection {
    #[default]
    Disabled,
    Enabled(PreselectionConfig),
}

impl Preselection {
    /// Size of the core set, when preselection actually ranks.
    pub fn top_k(&self) -> Option<usize> {
        match self {
            Preselection::Disabled => None,
            Preselection::Enabled(cfg) if cfg.top_k == 0 => None,
            Preselection::Enabled(cfg) => Some(cfg.top_k),
        }
    }

    /// Rows of history preselection reads.
    pub fn lookback(&self) -> usize {
        match self {
            Preselection::Disabled => 0,
            Preselection::Enabled(cfg) => cfg.lookback,
        }
    }
}

/// Membership (hysteresis and turnover) policy parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct MembershipConfig {
    /// Held assets ranked at or above this boundary are kept.
    pub buffer_rank: Option<usize>,
    /// Rebalances an asset must be held before it can be dropped.
    pub min_holding_periods: usize,
    /// Cap on one-way weight turnover per rebalance (fraction of the portfolio).
    pub max_turnover: Option<f64>,
    pub max_new_assets: Option<usize>,
    pub max_removed_assets: Option<usize>,
}

/// Transaction cost parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CostConfig {
    /// Commission as a fraction of traded value (0.001 = 10 bps).
    pub commission_pct: f64,
    /// Minimum commission per trade, in currency.
    pub commission_min: f64,
    /// Slippage in basis points of traded value.
    pub slippage_bps: f64,
}

impl Default for CostConfig {
    fn default() -> Self {
        Self {
            commission_pct: 0.001,
            commission_min: 0.0,
            slippage_bps: 5.0,
        }
    }
}

/// Point-in-time eligibility thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EligibilityConfig {
    /// Calendar days between the first observation and the as-of date.
    pub min_history_days: u32,
    /// Observations strictly before the as-of date.
    pub min_price_rows: usize,
    /// Assets whose latest observation is older than this are ineligible.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_stale_days: Option<u32>,
}

impl Default for EligibilityConfig {
    fn default() -> Self {
        Self {
            min_history_days: 0,
            min_price_rows: 1,
            max_stale_days: Some(10),
        }
    }
}

/// Statistics cache settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    /// Maximum number of cached windows before least-recently-used eviction.
    pub capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: 64,
        }
    }
}

/// Drift tolerance band for opportunistic rebalances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriftBand {
    /// Per-asset absolute drift that fires a rebalance (0.05 = 5 points of weight).
    pub threshold: f64,
    /// Optional cap on the summed absolute drift.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_total_drift: Option<f64>,
    /// Calendar days that must separate two rebalances for drift to fire.
    pub min_days_between: u32,
}

impl Default for DriftBand {
    fn default() -> Self {
        Self {
            threshold: 0.05,
            max_total_drift: Some(0.10),
            min_days_between: 1,
        }
    }
}

/// Rebalance trigger settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TriggerConfig {
    pub frequency: RebalanceFrequency,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub drift: Option<DriftBand>,
}

/// General run settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationSettings {
    /// First simulated date (defaults to the first calendar date of the data).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_date: Option<NaiveDate>,
    /// Last simulated date (defaults to the last calendar date of the data).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_date: Option<NaiveDate>,
    pub initial_capital: f64,
    /// Rows of history used for covariance and expected returns.
    pub covariance_lookback: usize,
    pub show_progress: bool,
}

impl Default for SimulationSettings {
    fn default() -> Self {
        Self {
            start_date: None,
            end_date: None,
            initial_capital: 1_000_000.0,
            covariance_lookback: 126,
            show_progress: false,
        }
    }
}

/// Complete simulation configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SimulationConfig {
    #[serde(default)]
    pub simulation: SimulationSettings,
    #[serde(default)]
    pub preselection: Preselection,
    #[serde(default)]
    pub membership: MembershipConfig,
    #[serde(default)]
    pub costs: CostConfig,
    #[serde(default)]
    pub eligibility: EligibilityConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub trigger: TriggerConfig,
}

impl SimulationConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!("Loading configuration from: {}", path.display());

        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| SimulationError::Config(e.to_string()))?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Check every parameter combination and freeze the result.
    pub fn validate(self) -> Result<ValidatedConfig> {
        self.validate_settings()?;
        self.validate_preselection()?;
        self.validate_membership()?;
        self.validate_costs()?;
        self.validate_eligibility()?;
        self.validate_cache()?;
        self.validate_trigger()?;
        Ok(ValidatedConfig(self))
    }

    fn validate_settings(&self) -> Result<()> {
        let s = &self.simulation;
        if !(s.initial_capital.is_finite() && s.initial_capital > 0.0) {
            return Err(config_err(format!(
                "initial_capital must be positive, got {}",
                s.initial_capital
            )));
        }
        if s.covariance_lookback < 2 {
            return Err(config_err("covariance_lookback must be at least 2"));
        }
        if let (Some(start), Some(end)) = (s.start_date, s.end_date) {
            if start > end {
                return Err(config_err(format!(
                    "start_date {} is after end_date {}",
                    start, end
                )));
            }
        }
        Ok(())
    }

    fn validate_preselection(&self) -> Result<()> {
        let cfg = match &self.preselection {
            Preselection::Disabled => return Ok(()),
            Preselection::Enabled(cfg) => cfg,
        };

        if cfg.lookback < 2 {
            return Err(config_err("preselection lookback must be at least 2"));
        }
        if cfg.skip >= cfg.lookback {
            return Err(config_err(format!(
                "preselection skip ({}) must be smaller than lookback ({})",
                cfg.skip, cfg.lookback
            )));
        }
        if cfg.min_periods < 2 {
            return Err(config_err("preselection min_periods must be at least 2"));
        }
        let window = if cfg.method.uses_momentum() {
            cfg.lookback - cfg.skip
        } else {
            cfg.lookback
        };
        if cfg.min_periods > window {
            return Err(config_err(format!(
                "preselection min_periods ({}) exceeds the scoring window ({})",
                cfg.min_periods, window
            )));
        }

        for (name, w) in [
            ("momentum_weight", cfg.momentum_weight),
            ("low_vol_weight", cfg.low_vol_weight),
        ] {
            if !w.is_finite() || w < 0.0 {
                return Err(config_err(format!("{} must be non-negative, got {}", name, w)));
            }
        }
        if cfg.method == FactorMethod::Combined {
            let sum = cfg.momentum_weight + cfg.low_vol_weight;
            if (sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
                return Err(config_err(format!(
                    "momentum_weight + low_vol_weight must equal 1.0, got {}",
                    sum
                )));
            }
        }
        Ok(())
    }

    fn validate_membership(&self) -> Result<()> {
        let m = &self.membership;
        if let (Some(buffer), Some(top_k)) = (m.buffer_rank, self.preselection.top_k()) {
            if buffer < top_k {
                return Err(config_err(format!(
                    "buffer_rank ({}) must be at least top_k ({})",
                    buffer, top_k
                )));
            }
        }
        if let Some(turnover) = m.max_turnover {
            if !(turnover.is_finite() && turnover > 0.0 && turnover <= 1.0) {
                return Err(config_err(format!(
                    "max_turnover must be in (0, 1], got {}",
                    turnover
                )));
            }
        }
        Ok(())
    }

    fn validate_costs(&self) -> Result<()> {
        let c = &self.costs;
        if !(c.commission_pct.is_finite() && (0.0..1.0).contains(&c.commission_pct)) {
            return Err(config_err(format!(
                "commission_pct must be in [0, 1), got {}",
                c.commission_pct
            )));
        }
        if !(c.commission_min.is_finite() && c.commission_min >= 0.0) {
            return Err(config_err("commission_min must be non-negative"));
        }
        if !(c.slippage_bps.is_finite() && (0.0..10_000.0).contains(&c.slippage_bps)) {
            return Err(config_err(format!(
                "slippage_bps must be in [0, 10000), got {}",
                c.slippage_bps
            )));
        }
        Ok(())
    }

    fn validate_eligibility(&self) -> Result<()> {
        if self.eligibility.min_price_rows == 0 {
            return Err(config_err("min_price_rows must be at least 1"));
        }
        Ok(())
    }

    fn validate_cache(&self) -> Result<()> {
        if self.cache.enabled && self.cache.capacity == 0 {
            return Err(config_err("cache capacity must be positive when enabled"));
        }
        Ok(())
    }

    fn validate_trigger(&self) -> Result<()> {
        if let Some(band) = &self.trigger.drift {
            if !(band.threshold.is_finite() && band.threshold > 0.0 && band.threshold <= 1.0) {
                return Err(config_err(format!(
                    "drift threshold must be in (0, 1], got {}",
                    band.threshold
                )));
            }
            if let Some(total) = band.max_total_drift {
                if !(total.is_finite() && total > 0.0) {
                    return Err(config_err("max_total_drift must be positive"));
                }
            }
        }
        Ok(())
    }
}

fn config_err(msg: impl Into<String>) -> SimulationError {
    SimulationError::Config(msg.into())
}

/// A configuration that passed validation. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidatedConfig(SimulationConfig);

impl ValidatedConfig {
    pub fn settings(&self) -> &SimulationSettings {
        &self.0.simulation
    }

    pub fn preselection(&self) -> &Preselection {
        &self.0.preselection
    }

    pub fn membership(&self) -> &MembershipConfig {
        &self.0.membership
    }

    pub fn costs(&self) -> &CostConfig {
        &self.0.costs
    }

    pub fn eligibility(&self) -> &EligibilityConfig {
        &self.0.eligibility
    }

    pub fn cache(&self) -> &CacheConfig {
        &self.0.cache
    }

    pub fn trigger(&self) -> &TriggerConfig {
        &self.0.trigger
    }

    /// The underlying configuration.
    pub fn as_config(&self) -> &SimulationConfig {
        &self.0
    }

    /// Rows of pre-cutoff history one rebalance needs materialized.
    pub fn history_rows(&self) -> usize {
        self.0
            .preselection
            .lookback()
            .max(self.0.simulation.covariance_lookback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn combined(momentum_weight: f64, low_vol_weight: f64) -> SimulationConfig {
        SimulationConfig {
            preselection: Preselection::Enabled(PreselectionConfig {
                method: FactorMethod::Combined,
                momentum_weight,
                low_vol_weight,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        let validated = SimulationConfig::default().validate().unwrap();
        assert_eq!(validated.history_rows(), 126);
        assert_eq!(validated.preselection().top_k(), None);
    }

    #[test]
    fn test_combined_weights_must_sum_to_one() {
        assert!(combined(0.6, 0.4).validate().is_ok());
        let err = combined(0.6, 0.6).validate().unwrap_err();
        assert!(matches!(err, SimulationError::Config(_)));
    }

    #[test]
    fn test_skip_must_be_below_lookback() {
        let config = SimulationConfig {
            preselection: Preselection::Enabled(PreselectionConfig {
                lookback: 20,
                skip: 20,
                min_periods: 5,
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(SimulationError::Config(_))));
    }

    #[test]
    fn test_min_periods_bounded_by_window() {
        let config = SimulationConfig {
            preselection: Preselection::Enabled(PreselectionConfig {
                lookback: 30,
                skip: 10,
                min_periods: 25,
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_buffer_rank_below_top_k_rejected() {
        let config = SimulationConfig {
            preselection: Preselection::Enabled(PreselectionConfig {
                top_k: 30,
                ..Default::default()
            }),
            membership: MembershipConfig {
                buffer_rank: Some(20),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_top_k_is_passthrough() {
        let pre = Preselection::Enabled(PreselectionConfig {
            top_k: 0,
            ..Default::default()
        });
        assert_eq!(pre.top_k(), None);
    }

    #[test]
    fn test_start_after_end_rejected() {
        let mut config = SimulationConfig::default();
        config.simulation.start_date = NaiveDate::from_ymd_opt(2024, 6, 1);
        config.simulation.end_date = NaiveDate::from_ymd_opt(2024, 1, 1);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_costs_rejected() {
        let mut config = SimulationConfig::default();
        config.costs.commission_pct = -0.1;
        assert!(config.clone().validate().is_err());

        let mut config = SimulationConfig::default();
        config.costs.slippage_bps = f64::NAN;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_history_rows_takes_longest_window() {
        let config = SimulationConfig {
            preselection: Preselection::Enabled(PreselectionConfig {
                lookback: 300,
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(config.validate().unwrap().history_rows(), 300);
    }

    #[test]
    fn test_toml_round_trip() {
        let mut config = combined(0.7, 0.3);
        config.simulation.start_date = NaiveDate::from_ymd_opt(2020, 1, 1);
        config.trigger.drift = Some(DriftBand::default());
        config.membership.buffer_rank = Some(40);

        let file = NamedTempFile::new().unwrap();
        config.save(file.path()).unwrap();
        let loaded = SimulationConfig::load(file.path()).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_parse_minimal_toml() {
        let text = r#"
            [simulation]
            initial_capital = 50000.0
            start_date = "2021-01-04"

            [preselection]
            mode = "enabled"
            method = "low_vol"
            top_k = 5
            lookback = 60
            skip = 0
            min_periods = 20

            [trigger]
            frequency = "quarterly"
        "#;
        let config = SimulationConfig::from_toml_str(text).unwrap();
        assert_eq!(config.trigger.frequency, RebalanceFrequency::Quarterly);
        match &config.preselection {
            Preselection::Enabled(cfg) => {
                assert_eq!(cfg.method, FactorMethod::LowVol);
                assert_eq!(cfg.top_k, 5);
            }
            Preselection::Disabled => panic!("expected enabled preselection"),
        }
        assert!(config.validate().is_ok());
    }
}
