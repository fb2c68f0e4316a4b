//! Rebalancer - a point-in-time portfolio rebalancing simulator.
//!
//! # Overview
//!
//! Rebalancer walks a daily price history and, on trigger dates, rebuilds a
//! portfolio through a fixed pipeline:
//!
//! - **Eligibility**: assets need enough history strictly before the date
//! - **Preselection**: optional momentum, low-volatility or combined factor ranking
//! - **Membership**: buffer-zone hysteresis, minimum holding periods, add/remove caps
//! - **Allocation**: any [`allocator::Allocator`], fed from a bounded statistics cache
//! - **Execution**: commission and slippage, optional turnover cap
//!
//! Every decision at date `t` reads only data dated before `t`. Pipeline
//! failures on one date are recorded as skipped rebalances and the run goes on.
//!
//! # Quick Start
//!
//! ```no_run
//! use rebalancer::{
//!     allocator::EqualWeightAllocator,
//!     config::SimulationConfig,
//!     data::{load_long_csv, CsvOptions},
//!     engine::SimulationEngine,
//! };
//!
//! let config = SimulationConfig::load("rebalancer.toml").unwrap();
//! let mut engine = SimulationEngine::from_config(config).unwrap();
//!
//! let history = load_long_csv("prices.csv", &CsvOptions::default()).unwrap();
//! let result = engine.run(&history, &EqualWeightAllocator).unwrap();
//!
//! println!("Final equity: {:.2}", result.final_equity);
//! println!("Skipped rebalances: {}", result.skipped.len());
//! ```
//!
//! # Custom Allocators
//!
//! ```
//! use rebalancer::allocator::{AllocationInput, Allocator};
//! use rebalancer::error::Result;
//! use std::collections::BTreeMap;
//!
//! struct FirstAsset;
//!
//! impl Allocator for FirstAsset {
//!     fn name(&self) -> &str {
//!         "First Asset"
//!     }
//!
//!     fn construct(&self, input: &AllocationInput<'_>) -> Result<BTreeMap<String, f64>> {
//!         let mut weights = BTreeMap::new();
//!         if let Some(first) = input.universe.first() {
//!             weights.insert(first.clone(), 1.0);
//!         }
//!         Ok(weights)
//!     }
//! }
//! ```

pub mod allocator;
pub mod analytics;
pub mod cache;
pub mod config;
pub mod costs;
pub mod data;
pub mod eligibility;
pub mod engine;
pub mod error;
pub mod membership;
pub mod portfolio;
pub mod preselection;
pub mod stats;
pub mod trigger;
pub mod types;

pub use allocator::{
    Allocator, EqualWeightAllocator, InverseVolatilityAllocator, MinimumVarianceAllocator,
    RiskParityAllocator,
};
pub use config::{SimulationConfig, ValidatedConfig};
pub use data::PriceHistory;
pub use engine::{run_sweep, CancellationToken, SimulationEngine, SimulationResult};
pub use error::{Result, SimulationError};
pub use types::{RebalanceEvent, RunState, SkippedRebalance, TriggerKind};
