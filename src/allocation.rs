use crate::config::TRADING_DAYS;
use crate::error::{OptimizerError, Result};
use crate::frontier::FrontierPoint;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The selected portfolio, mapped onto a budget. Immutable once built.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OptimizationResult {
    pub weights: BTreeMap<String, f64>,
    pub sharpe_ratio: f64,
    /// Currency amount per ticker, `weight × budget`.
    pub budget_allocation: BTreeMap<String, f64>,
    /// Per-period (daily) target return of the selected point.
    pub target_return: f64,
    /// Annualized standard deviation.
    pub volatility: f64,
    pub annualized_return: f64,
    pub budget: f64,
}

pub fn annualize_volatility(std_dev: f64) -> f64 {
    std_dev * TRADING_DAYS.sqrt()
}

pub fn annualize_return(period_return: f64) -> f64 {
    period_return * TRADING_DAYS
}

pub fn map_result(point: &FrontierPoint, sharpe_ratio: f64, budget: f64) -> Result<OptimizationResult> {
    if !budget.is_finite() || budget < 0.0 {
        return Err(OptimizerError::InvalidInput(format!(
            "budget must be a finite non-negative amount, got {}",
            budget
        )));
    }

    let budget_allocation = point
        .weights
        .iter()
        .map(|(ticker, w)| (ticker.clone(), w * budget))
        .collect();

    Ok(OptimizationResult {
        weights: point.weights.clone(),
        sharpe_ratio,
        budget_allocation,
        target_return: point.target_return,
        volatility: annualize_volatility(point.std_dev),
        annualized_return: annualize_return(point.target_return),
        budget,
    })
}
