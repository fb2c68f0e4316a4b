//! Simulation loop.
//!
//! A run walks the calendar one date at a time. Every date is marked to
//! market and appended to the equity curve; on dates where the trigger fires,
//! the rebalance pipeline runs once, end to end:
//!
//! eligibility → window materialization → preselection → membership →
//! statistics → allocation → turnover cap → execution
//!
//! The return window is built once per rebalance attempt and shared by every
//! step, so slice construction scales with the number of rebalances rather
//! than the number of simulated days. Any pipeline failure becomes a
//! [`SkippedRebalance`] record and the prior holdings are kept.

use crate::allocator::{validate_weights, AllocationInput, Allocator};
use crate::cache::{CacheStats, SharedStatisticsCache, StatisticsCache, StatisticsProvider, Uncached};
use crate::config::{SimulationConfig, ValidatedConfig};
use crate::costs::TransactionCostModel;
use crate::data::PriceHistory;
use crate::eligibility::EligibilityFilter;
use crate::error::{Result, SimulationError};
use crate::membership::MembershipPolicy;
use crate::portfolio::{apply_turnover_cap, PortfolioState};
use crate::preselection::PreselectionEngine;
use crate::trigger::{RebalanceTrigger, TriggerContext};
use crate::types::{
    ConstraintOverride, EquityPoint, RebalanceEvent, RunState, SkippedRebalance, TriggerKind,
};
use chrono::NaiveDate;
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Cooperative stop signal, checked once per simulated date.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Everything a run produces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationResult {
    pub run_state: RunState,
    pub allocator: String,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub initial_capital: f64,
    pub final_equity: f64,
    pub equity_curve: Vec<EquityPoint>,
    pub rebalances: Vec<RebalanceEvent>,
    pub skipped: Vec<SkippedRebalance>,
    /// Historical return windows built during the run.
    pub slice_materializations: usize,
    pub cache_stats: CacheStats,
    pub final_state: PortfolioState,
    /// Set when rebalances were attempted and none executed.
    pub all_rebalances_skipped: bool,
}

impl SimulationResult {
    /// Serialize for an external reporting collaborator.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Rebalance attempts, executed or skipped.
    pub fn attempts(&self) -> usize {
        self.rebalances.len() + self.skipped.len()
    }
}

/// Per-run pipeline components and counters.
struct Pipeline<'a> {
    history: &'a PriceHistory,
    calendar: &'a [NaiveDate],
    allocator: &'a dyn Allocator,
    eligibility: EligibilityFilter,
    preselection: PreselectionEngine,
    membership: MembershipPolicy,
    costs: TransactionCostModel,
    statistics: Box<dyn StatisticsProvider + 'a>,
    history_rows: usize,
    covariance_rows: usize,
    max_turnover: Option<f64>,
    materializations: usize,
}

impl Pipeline<'_> {
    /// Run the full pipeline for one date. The portfolio changes only if every
    /// step succeeds.
    fn rebalance(
        &mut self,
        portfolio: &mut PortfolioState,
        date: NaiveDate,
        trigger: TriggerKind,
    ) -> Result<RebalanceEvent> {
        let eligible = self.eligibility.eligible_symbols(self.history, date);

        let mut symbols: BTreeSet<String> = eligible.iter().cloned().collect();
        symbols.extend(portfolio.holdings().keys().cloned());
        let symbols: Vec<String> = symbols.into_iter().collect();

        self.materializations += 1;
        let window = self
            .history
            .materialize_window(self.calendar, &symbols, date, self.history_rows);
        debug!(
            "{}: {} eligible, window {} rows x {} assets",
            date,
            eligible.len(),
            window.rows(),
            window.symbols().len()
        );

        let candidates = self.preselection.run(&eligible, &window)?;
        let decision = self.membership.decide(portfolio.holdings(), &candidates);

        let universe_window = window.select(&decision.universe, self.covariance_rows);
        let statistics = if self.allocator.requires_statistics() {
            Some(self.statistics.statistics(&universe_window)?)
        } else {
            None
        };

        let current_weights = portfolio.weights();
        let input = AllocationInput {
            date,
            universe: &decision.universe,
            window: &universe_window,
            statistics: statistics.as_deref(),
            current_weights: &current_weights,
        };
        let target = self.allocator.construct(&input)?;
        validate_weights(&target, &decision.universe)?;

        let capped = apply_turnover_cap(
            &current_weights,
            &target,
            &decision.universe,
            self.max_turnover,
        );
        let mut overrides = decision.overrides;
        if capped.partial {
            debug!(
                "{}: turnover {:.4} capped, executing partial rebalance",
                date, capped.proposed_turnover
            );
            if let Some(cap) = self.max_turnover.filter(|cap| capped.exit_turnover > *cap) {
                overrides.push(ConstraintOverride {
                    rule: "max_turnover".to_string(),
                    symbols: capped.exited.clone(),
                    detail: format!(
                        "selling {} assets outside the universe takes turnover {:.4} past the cap of {:.4}",
                        capped.exited.len(),
                        capped.exit_turnover,
                        cap
                    ),
                });
            }
        }

        let report = portfolio.execute(self.history, date, &capped.weights, &self.costs)?;

        // A capped blend may leave an addition unbought
        let added = decision
            .added
            .into_iter()
            .filter(|s| report.weights_after.contains_key(s))
            .collect();
        let removed = decision
            .removed
            .into_iter()
            .filter(|s| !report.weights_after.contains_key(s))
            .collect();

        Ok(RebalanceEvent {
            date,
            trigger,
            trades: report.trades,
            total_cost: report.total_cost,
            pre_value: report.pre_value,
            post_value: report.post_value,
            target_weights: target,
            weights_after: report.weights_after,
            added,
            removed,
            turnover: report.turnover,
            partial: capped.partial,
            overrides,
        })
    }
}

/// Runs one simulation for a validated configuration.
pub struct SimulationEngine {
    config: ValidatedConfig,
    state: RunState,
    cancel: CancellationToken,
    shared_cache: Option<SharedStatisticsCache>,
}

impl SimulationEngine {
    pub fn new(config: ValidatedConfig) -> Self {
        Self {
            config,
            state: RunState::Initialized,
            cancel: CancellationToken::new(),
            shared_cache: None,
        }
    }

    /// Validate `config` and build an engine. Invalid configurations never
    /// reach the loop.
    pub fn from_config(config: SimulationConfig) -> Result<Self> {
        Ok(Self::new(config.validate()?))
    }

    /// Use an external cancellation token.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Use a cache shared with other runs instead of a private one.
    pub fn with_shared_cache(mut self, cache: SharedStatisticsCache) -> Self {
        self.shared_cache = Some(cache);
        self
    }

    pub fn config(&self) -> &ValidatedConfig {
        &self.config
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn statistics_provider(&self) -> Box<dyn StatisticsProvider> {
        match (&self.shared_cache, self.config.cache()) {
            (Some(shared), _) => Box::new(shared.clone()),
            (None, cache) if cache.enabled => Box::new(StatisticsCache::new(cache.capacity)),
            (None, _) => Box::new(Uncached::default()),
        }
    }

    /// Simulation dates: calendar dates inside the configured range.
    fn simulation_dates(&self, calendar: &[NaiveDate]) -> Vec<NaiveDate> {
        let settings = self.config.settings();
        calendar
            .iter()
            .copied()
            .filter(|d| settings.start_date.map_or(true, |s| *d >= s))
            .filter(|d| settings.end_date.map_or(true, |e| *d <= e))
            .collect()
    }

    /// Run the simulation.
    ///
    /// Returns `Err` only for problems found before the loop starts (no data,
    /// no dates in range). Every error raised while rebalancing is reported in
    /// [`SimulationResult::skipped`] and the run continues.
    pub fn run(
        &mut self,
        history: &PriceHistory,
        allocator: &dyn Allocator,
    ) -> Result<SimulationResult> {
        match self.run_inner(history, allocator) {
            Ok(result) => {
                self.state = result.run_state;
                Ok(result)
            }
            Err(e) => {
                self.state = RunState::Failed;
                Err(e)
            }
        }
    }

    fn run_inner(
        &mut self,
        history: &PriceHistory,
        allocator: &dyn Allocator,
    ) -> Result<SimulationResult> {
        if history.is_empty() {
            return Err(SimulationError::NoData);
        }
        let calendar = history.calendar();
        let dates = self.simulation_dates(&calendar);
        if dates.is_empty() {
            return Err(SimulationError::Data(
                "no trading dates inside the configured range".to_string(),
            ));
        }

        self.state = RunState::Running;
        let settings = self.config.settings().clone();
        info!(
            "Running simulation: {} on {} assets ({} days, {} to {})",
            allocator.name(),
            history.len(),
            dates.len(),
            dates[0],
            dates[dates.len() - 1]
        );

        let mut pipeline = Pipeline {
            history,
            calendar: &calendar,
            allocator,
            eligibility: EligibilityFilter::new(self.config.eligibility().clone()),
            preselection: PreselectionEngine::new(self.config.preselection().clone()),
            membership: MembershipPolicy::new(self.config.membership().clone()),
            costs: TransactionCostModel::from_config(self.config.costs()),
            statistics: self.statistics_provider(),
            history_rows: self.config.history_rows(),
            covariance_rows: settings.covariance_lookback,
            max_turnover: self.config.membership().max_turnover,
            materializations: 0,
        };
        let trigger = RebalanceTrigger::new(self.config.trigger());
        let mut portfolio = PortfolioState::new(settings.initial_capital);

        let progress = if settings.show_progress {
            let pb = ProgressBar::new(dates.len() as u64);
            if let Ok(style) = ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
            {
                pb.set_style(style.progress_chars("#>-"));
            }
            Some(pb)
        } else {
            None
        };

        let mut equity_curve = Vec::with_capacity(dates.len());
        let mut rebalances = Vec::new();
        let mut skipped = Vec::new();
        let mut previous_date = None;
        let mut run_state = RunState::Completed;

        for &date in &dates {
            if self.cancel.is_cancelled() {
                warn!("Simulation cancelled at {}", date);
                run_state = RunState::Cancelled;
                break;
            }

            let mut valuation = portfolio.mark_to_market(history, date);

            let fired = {
                let current = portfolio.weights();
                trigger.evaluate(&TriggerContext {
                    date,
                    previous_date,
                    last_rebalance: portfolio.last_rebalance(),
                    current_weights: &current,
                    target_weights: portfolio.target(),
                })
            };

            if let Some(kind) = fired {
                match pipeline.rebalance(&mut portfolio, date, kind) {
                    Ok(event) => {
                        info!(
                            "{} rebalance on {}: {} trades, cost {:.2}, +{} -{}",
                            kind,
                            date,
                            event.trades.len(),
                            event.total_cost,
                            event.added.len(),
                            event.removed.len()
                        );
                        for o in &event.overrides {
                            warn!("{}: {} overridden: {}", date, o.rule, o.detail);
                        }
                        rebalances.push(event);
                        valuation = portfolio.mark_to_market(history, date);
                    }
                    Err(e) => {
                        if e.is_recoverable() {
                            warn!("Skipping {} rebalance on {}: {}", kind, date, e);
                        } else {
                            error!("Skipping {} rebalance on {}: {}", kind, date, e);
                        }
                        skipped.push(SkippedRebalance {
                            date,
                            trigger: kind,
                            kind: e.kind(),
                            reason: e.to_string(),
                        });
                    }
                }
            }

            equity_curve.push(portfolio.record_equity(&valuation));
            previous_date = Some(date);

            if let Some(pb) = &progress {
                pb.inc(1);
            }
        }

        if let Some(pb) = progress {
            pb.finish_with_message("Simulation complete");
        }

        let all_rebalances_skipped = rebalances.is_empty() && !skipped.is_empty();
        if all_rebalances_skipped {
            warn!(
                "Every rebalance was skipped ({} attempts); the portfolio never traded",
                skipped.len()
            );
        }

        let final_equity = equity_curve
            .last()
            .map(|p: &EquityPoint| p.equity)
            .unwrap_or(settings.initial_capital);
        info!(
            "Simulation {}: {} rebalances, {} skipped, final equity {:.2}",
            run_state,
            rebalances.len(),
            skipped.len(),
            final_equity
        );

        Ok(SimulationResult {
            run_state,
            allocator: allocator.name().to_string(),
            start_date: equity_curve.first().map(|p| p.date),
            end_date: equity_curve.last().map(|p| p.date),
            initial_capital: settings.initial_capital,
            final_equity,
            equity_curve,
            rebalances,
            skipped,
            slice_materializations: pipeline.materializations,
            cache_stats: pipeline.statistics.cache_stats(),
            final_state: portfolio,
            all_rebalances_skipped,
        })
    }
}

/// Run independent simulations in parallel, one per configuration.
///
/// Each run owns its portfolio. Runs share `cache` when one is given and use a
/// private cache otherwise. Results are returned in input order.
pub fn run_sweep(
    history: &PriceHistory,
    configs: &[ValidatedConfig],
    allocator: &dyn Allocator,
    cache: Option<&SharedStatisticsCache>,
) -> Vec<Result<SimulationResult>> {
    info!("Running sweep of {} simulations", configs.len());
    configs
        .par_iter()
        .map(|config| {
            let mut config = config.as_config().clone();
            config.simulation.show_progress = false;
            let mut engine = SimulationEngine::from_config(config)?;
            if let Some(shared) = cache {
                engine = engine.with_shared_cache(shared.clone());
            }
            let result = engine.run(history, allocator);
            if let Err(e) = &result {
                warn!("Sweep run failed: {}", e);
            }
            result
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::EqualWeightAllocator;
    use crate::config::{Preselection, PreselectionConfig, RebalanceFrequency};
    use chrono::Datelike;
    use std::collections::BTreeMap;

    fn day(n: i64) -> NaiveDate {
        NaiveDate::from_ymd_opt(2023, 1, 2).unwrap() + chrono::Duration::days(n)
    }

    fn create_test_history(assets: usize, days: i64) -> PriceHistory {
        let mut history = PriceHistory::new();
        for a in 0..assets {
            let prices: Vec<(NaiveDate, f64)> = (0..days)
                .map(|i| {
                    let t = i as f64;
                    let drift = 1.0 + 0.0002 * (a as f64 + 1.0) * t;
                    let wave = 1.0 + 0.01 * ((t * 0.3) + a as f64).sin();
                    (day(i), 100.0 * drift * wave)
                })
                .collect();
            history.add_prices(format!("S{:02}", a), &prices).unwrap();
        }
        history
    }

    fn monthly_config() -> SimulationConfig {
        let mut config = SimulationConfig::default();
        config.simulation.initial_capital = 100_000.0;
        config.simulation.covariance_lookback = 20;
        config.trigger.frequency = RebalanceFrequency::Monthly;
        config
    }

    struct FailingAllocator;

    impl Allocator for FailingAllocator {
        fn name(&self) -> &str {
            "Failing"
        }

        fn construct(&self, _input: &AllocationInput<'_>) -> Result<BTreeMap<String, f64>> {
            Err(SimulationError::Optimization("did not converge".to_string()))
        }
    }

    /// Equal weights, except for a data error during one month.
    struct DataErrorAllocator {
        month: u32,
    }

    impl Allocator for DataErrorAllocator {
        fn name(&self) -> &str {
            "DataError"
        }

        fn construct(&self, input: &AllocationInput<'_>) -> Result<BTreeMap<String, f64>> {
            if input.date.month() == self.month {
                return Err(SimulationError::Data(format!("corrupt window on {}", input.date)));
            }
            EqualWeightAllocator.construct(input)
        }
    }

    #[test]
    fn test_run_completes() {
        let history = create_test_history(4, 120);
        let mut engine = SimulationEngine::from_config(monthly_config()).unwrap();
        assert_eq!(engine.state(), RunState::Initialized);

        let result = engine.run(&history, &EqualWeightAllocator).unwrap();
        assert_eq!(engine.state(), RunState::Completed);
        assert_eq!(result.run_state, RunState::Completed);
        assert_eq!(result.equity_curve.len(), 120);
        assert!(!result.rebalances.is_empty());
        assert_eq!(result.slice_materializations, result.attempts());
        assert!(!result.all_rebalances_skipped);
    }

    #[test]
    fn test_first_rebalance_is_forced_and_may_skip() {
        // With a minimum row requirement nothing is eligible on day 0
        let history = create_test_history(3, 60);
        let mut config = monthly_config();
        config.eligibility.min_price_rows = 5;
        let result = SimulationEngine::from_config(config)
            .unwrap()
            .run(&history, &EqualWeightAllocator)
            .unwrap();

        // Retried daily until day 5 has five prior rows
        let skipped: Vec<NaiveDate> = result.skipped.iter().map(|s| s.date).collect();
        assert_eq!(skipped, (0..5).map(day).collect::<Vec<_>>());
        assert!(result.skipped.iter().all(|s| s.trigger == TriggerKind::Forced));

        assert_eq!(result.rebalances[0].date, day(5));
        assert_eq!(result.rebalances[0].trigger, TriggerKind::Forced);
        assert!(result.rebalances[1..]
            .iter()
            .all(|e| e.trigger == TriggerKind::Scheduled));
    }

    #[test]
    fn test_data_errors_become_skips() {
        // Feb 2023 rebalances fail with a data error
        let history = create_test_history(3, 120);
        let allocator = DataErrorAllocator { month: 2 };
        let mut engine = SimulationEngine::from_config(monthly_config()).unwrap();
        let result = engine.run(&history, &allocator).unwrap();

        assert_eq!(engine.state(), RunState::Completed);
        assert_eq!(result.equity_curve.len(), 120);

        let data_skips: Vec<_> = result
            .skipped
            .iter()
            .filter(|s| s.kind == crate::error::ErrorKind::Data)
            .collect();
        assert_eq!(data_skips.len(), 1);
        assert_eq!(data_skips[0].date, NaiveDate::from_ymd_opt(2023, 2, 1).unwrap());
        assert_eq!(data_skips[0].trigger, TriggerKind::Scheduled);

        // Later periods still rebalance
        assert!(result
            .rebalances
            .iter()
            .any(|e| e.date == NaiveDate::from_ymd_opt(2023, 3, 1).unwrap()));
    }

    #[test]
    fn test_failures_become_skips() {
        let history = create_test_history(3, 90);
        let mut engine = SimulationEngine::from_config(monthly_config()).unwrap();
        let result = engine.run(&history, &FailingAllocator).unwrap();

        assert_eq!(engine.state(), RunState::Completed);
        assert!(result.rebalances.is_empty());
        assert!(!result.skipped.is_empty());
        assert!(result.all_rebalances_skipped);
        assert_eq!(result.skipped[0].kind, crate::error::ErrorKind::Optimization);
        // Never traded: equity stays at the initial capital
        assert!(result
            .equity_curve
            .iter()
            .all(|p| (p.equity - 100_000.0).abs() < 1e-9));
    }

    #[test]
    fn test_invalid_config_fails_before_running() {
        let mut config = monthly_config();
        config.preselection = Preselection::Enabled(PreselectionConfig {
            lookback: 10,
            skip: 10,
            ..Default::default()
        });
        assert!(matches!(
            SimulationEngine::from_config(config),
            Err(SimulationError::Config(_))
        ));
    }

    #[test]
    fn test_empty_history_fails() {
        let mut engine = SimulationEngine::from_config(monthly_config()).unwrap();
        let err = engine.run(&PriceHistory::new(), &EqualWeightAllocator);
        assert!(matches!(err, Err(SimulationError::NoData)));
        assert_eq!(engine.state(), RunState::Failed);
    }

    #[test]
    fn test_cancellation_before_start() {
        let history = create_test_history(2, 30);
        let token = CancellationToken::new();
        token.cancel();
        let mut engine = SimulationEngine::from_config(monthly_config())
            .unwrap()
            .with_cancellation(token);
        let result = engine.run(&history, &EqualWeightAllocator).unwrap();
        assert_eq!(result.run_state, RunState::Cancelled);
        assert_eq!(engine.state(), RunState::Cancelled);
        assert!(result.equity_curve.is_empty());
    }

    #[test]
    fn test_date_range_respected() {
        let history = create_test_history(2, 60);
        let mut config = monthly_config();
        config.simulation.start_date = Some(day(10));
        config.simulation.end_date = Some(day(19));
        let result = SimulationEngine::from_config(config)
            .unwrap()
            .run(&history, &EqualWeightAllocator)
            .unwrap();
        assert_eq!(result.equity_curve.len(), 10);
        assert_eq!(result.start_date, Some(day(10)));
        assert_eq!(result.end_date, Some(day(19)));
    }

    #[test]
    fn test_result_serializes() {
        let history = create_test_history(2, 40);
        let result = SimulationEngine::from_config(monthly_config())
            .unwrap()
            .run(&history, &EqualWeightAllocator)
            .unwrap();
        let json = result.to_json().unwrap();
        assert!(json.contains("\"run_state\": \"completed\""));
        assert!(json.contains("slice_materializations"));
    }
}
