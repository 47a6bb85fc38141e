use crate::config::TRADING_DAYS;
use crate::error::{OptimizerError, Result};
use crate::frontier::FrontierPoint;

/// Converts an annual risk-free rate into the daily rate matching daily returns.
pub fn daily_risk_free(annual_rate: f64) -> f64 {
    annual_rate / TRADING_DAYS
}

/// `(target_return - risk_free) / std_dev`, or `None` when the ratio is undefined.
pub fn sharpe_ratio(point: &FrontierPoint, risk_free: f64) -> Option<f64> {
    if point.std_dev > 0.0 && point.std_dev.is_finite() {
        let ratio = (point.target_return - risk_free) / point.std_dev;
        ratio.is_finite().then_some(ratio)
    } else {
        None
    }
}

/// The winning frontier point and its ratio.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Selection<'a> {
    pub index: usize,
    pub point: &'a FrontierPoint,
    pub sharpe_ratio: f64,
}

/// Scans the frontier in ascending target-return order and keeps the first
/// strict maximum, so among equal ratios the lowest target return wins.
pub fn select_max_sharpe(frontier: &[FrontierPoint], risk_free: f64) -> Result<Selection<'_>> {
    if frontier.is_empty() {
        return Err(OptimizerError::EmptyFrontier { skipped: 0 });
    }

    let mut best: Option<Selection<'_>> = None;
    for (index, point) in frontier.iter().enumerate() {
        let Some(ratio) = sharpe_ratio(point, risk_free) else {
            continue;
        };
        if best.is_none_or(|b| ratio > b.sharpe_ratio) {
            best = Some(Selection {
                index,
                point,
                sharpe_ratio: ratio,
            });
        }
    }

    best.ok_or(OptimizerError::NoValidPortfolio {
        points: frontier.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn point(target_return: f64, std_dev: f64) -> FrontierPoint {
        FrontierPoint {
            target_return,
            realized_return: target_return,
            variance: std_dev * std_dev,
            std_dev,
            weights: BTreeMap::from([("A".to_string(), 1.0)]),
            iterations: 1,
        }
    }

    #[test]
    fn test_selects_highest_ratio() {
        let frontier = vec![point(0.001, 0.02), point(0.002, 0.02), point(0.003, 0.05)];
        let selection = select_max_sharpe(&frontier, 0.0).unwrap();

        assert_eq!(selection.index, 1);
        assert!((selection.sharpe_ratio - 0.1).abs() < 1e-12);
        for p in &frontier {
            assert!(selection.sharpe_ratio >= sharpe_ratio(p, 0.0).unwrap());
        }
    }

    #[test]
    fn test_tie_goes_to_lowest_target_return() {
        // Both have ratio 0.1.
        let frontier = vec![point(0.001, 0.01), point(0.002, 0.02), point(0.0005, 0.02)];
        let selection = select_max_sharpe(&frontier, 0.0).unwrap();
        assert_eq!(selection.index, 0);
        assert_eq!(selection.point.target_return, 0.001);
    }

    #[test]
    fn test_zero_std_points_never_selected() {
        let frontier = vec![point(0.01, 0.0), point(0.001, 0.02)];
        let selection = select_max_sharpe(&frontier, 0.0).unwrap();
        assert_eq!(selection.index, 1);
    }

    #[test]
    fn test_negative_ratios_still_selectable() {
        let frontier = vec![point(0.0001, 0.02), point(0.0002, 0.01)];
        let selection = select_max_sharpe(&frontier, 0.001).unwrap();
        assert_eq!(selection.index, 0);
        assert!(selection.sharpe_ratio < 0.0);
    }

    #[test]
    fn test_empty_frontier_error() {
        assert_eq!(
            select_max_sharpe(&[], 0.0),
            Err(OptimizerError::EmptyFrontier { skipped: 0 })
        );
    }

    #[test]
    fn test_no_valid_portfolio_error() {
        let frontier = vec![point(0.001, 0.0), point(0.002, 0.0)];
        assert_eq!(
            select_max_sharpe(&frontier, 0.0),
            Err(OptimizerError::NoValidPortfolio { points: 2 })
        );
    }

    #[test]
    fn test_daily_risk_free() {
        assert!((daily_risk_free(0.03) - 0.03 / 252.0).abs() < 1e-15);
    }
}
