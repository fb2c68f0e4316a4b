//! Transaction cost model.

use crate::config::CostConfig;
use crate::types::{Side, Trade};
use serde::{Deserialize, Serialize};

/// Traded notional below this is treated as no trade.
pub const MIN_TRADE_VALUE: f64 = 1e-9;

/// Commission and slippage charged on traded notional.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TransactionCostModel {
    /// Commission as a fraction of trade value.
    pub commission_pct: f64,
    /// Minimum commission per executed trade.
    pub commission_min: f64,
    /// Slippage as a fraction of trade value.
    pub slippage_rate: f64,
}

impl Default for TransactionCostModel {
    fn default() -> Self {
        Self::from_config(&CostConfig::default())
    }
}

impl TransactionCostModel {
    pub fn from_config(config: &CostConfig) -> Self {
        Self {
            commission_pct: config.commission_pct,
            commission_min: config.commission_min,
            slippage_rate: config.slippage_bps / 10_000.0,
        }
    }

    /// A model that charges nothing.
    pub fn zero() -> Self {
        Self {
            commission_pct: 0.0,
            commission_min: 0.0,
            slippage_rate: 0.0,
        }
    }

    /// Commission for one trade; zero when nothing trades.
    pub fn calculate_commission(&self, trade_value: f64) -> f64 {
        let value = trade_value.abs();
        if value < MIN_TRADE_VALUE {
            return 0.0;
        }
        (value * self.commission_pct).max(self.commission_min)
    }

    pub fn calculate_slippage(&self, trade_value: f64) -> f64 {
        let value = trade_value.abs();
        if value < MIN_TRADE_VALUE {
            return 0.0;
        }
        value * self.slippage_rate
    }

    /// Price a change of `quantity_delta` units at `price`.
    ///
    /// Returns `None` for a zero-size trade.
    pub fn price_trade(&self, symbol: &str, quantity_delta: f64, price: f64) -> Option<Trade> {
        let value = (quantity_delta * price).abs();
        if value < MIN_TRADE_VALUE {
            return None;
        }
        Some(Trade {
            symbol: symbol.to_string(),
            side: if quantity_delta > 0.0 { Side::Buy } else { Side::Sell },
            quantity_delta,
            price,
            value,
            commission: self.calculate_commission(value),
            slippage: self.calculate_slippage(value),
        })
    }

    /// Cost of a set of trades, e.g. the executed subset of a rebalance.
    pub fn total_cost(trades: &[Trade]) -> f64 {
        trades.iter().map(Trade::cost).sum()
    }

    /// Cost of trading each notional in `values`.
    pub fn estimate(&self, values: impl IntoIterator<Item = f64>) -> f64 {
        values
            .into_iter()
            .map(|v| self.calculate_commission(v) + self.calculate_slippage(v))
            .sum()
    }
}
