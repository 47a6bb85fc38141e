use crate::error::SkipReason;
use crate::events::{EventSink, PipelineEvent};
use crate::returns::ReturnStatistics;
use crate::solver::{MeanVarianceQp, SolverSettings};
use rayon::prelude::*;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// A minimum-variance portfolio for one target return.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FrontierPoint {
    pub target_return: f64,
    /// `μ·w`; equals the target within solver tolerance.
    pub realized_return: f64,
    pub variance: f64,
    pub std_dev: f64,
    pub weights: BTreeMap<String, f64>,
    /// Active-set iterations spent on this point.
    pub iterations: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SkippedPoint {
    pub target_return: f64,
    pub reason: SkipReason,
}

/// Outcome of a single grid point.
#[derive(Clone, Debug, PartialEq)]
pub enum GridPointOutcome {
    Solved(FrontierPoint),
    Skipped(SkippedPoint),
}

/// Solved points in ascending target-return order, plus what was dropped.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Frontier {
    pub points: Vec<FrontierPoint>,
    pub skipped: Vec<SkippedPoint>,
}

impl Frontier {
    /// Splits outcomes and orders both halves by target return, whatever
    /// order the workers finished in.
    pub fn from_outcomes(outcomes: impl IntoIterator<Item = GridPointOutcome>) -> Self {
        let mut frontier = Self::default();
        for outcome in outcomes {
            match outcome {
                GridPointOutcome::Solved(point) => frontier.points.push(point),
                GridPointOutcome::Skipped(skipped) => frontier.skipped.push(skipped),
            }
        }
        frontier
            .points
            .sort_by(|a, b| a.target_return.total_cmp(&b.target_return));
        frontier
            .skipped
            .sort_by(|a, b| a.target_return.total_cmp(&b.target_return));
        frontier
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// `n_points` targets spaced linearly from the lowest to the highest single-asset mean.
pub fn target_grid(mean: &[f64], n_points: usize) -> Vec<f64> {
    if mean.is_empty() || n_points == 0 {
        return Vec::new();
    }
    let lo = mean.iter().copied().fold(f64::INFINITY, f64::min);
    let hi = mean.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if n_points == 1 {
        return vec![lo];
    }
    let step = (hi - lo) / (n_points - 1) as f64;
    (0..n_points)
        .map(|i| if i + 1 == n_points { hi } else { lo + step * i as f64 })
        .collect()
}

pub fn portfolio_return(weights: &[f64], means: &[f64]) -> f64 {
    weights.iter().zip(means.iter()).map(|(w, r)| w * r).sum()
}

pub fn portfolio_variance(weights: &[f64], cov: &[Vec<f64>]) -> f64 {
    let n = weights.len();
    let mut var = 0.0;
    for i in 0..n {
        for j in 0..n {
            var += weights[i] * weights[j] * cov[i][j];
        }
    }
    var
}

/// Builds the efficient frontier over one set of return statistics.
#[derive(Clone, Debug)]
pub struct FrontierSolver<'a> {
    stats: &'a ReturnStatistics,
    qp: MeanVarianceQp,
    point_deadline: Option<Duration>,
}

impl<'a> FrontierSolver<'a> {
    pub fn new(stats: &'a ReturnStatistics, allow_short: bool, settings: SolverSettings) -> Self {
        Self {
            stats,
            qp: MeanVarianceQp::new(&stats.mean, &stats.covariance, allow_short, settings),
            point_deadline: None,
        }
    }

    /// Budget for each grid point; running over counts as non-convergence.
    pub fn with_point_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.point_deadline = deadline;
        self
    }

    pub fn solve_point(&self, target: f64) -> GridPointOutcome {
        let deadline = self.point_deadline.map(|d| Instant::now() + d);
        match self.qp.solve(target, deadline) {
            Ok(solution) => {
                let w = &solution.weights;
                let variance = portfolio_variance(w, &self.stats.covariance).max(0.0);
                let weights = self
                    .stats
                    .tickers
                    .iter()
                    .cloned()
                    .zip(w.iter().copied())
                    .collect();
                GridPointOutcome::Solved(FrontierPoint {
                    target_return: target,
                    realized_return: portfolio_return(w, &self.stats.mean),
                    variance,
                    std_dev: variance.sqrt(),
                    weights,
                    iterations: solution.iterations,
                })
            }
            Err(reason) => GridPointOutcome::Skipped(SkippedPoint {
                target_return: target,
                reason,
            }),
        }
    }

    /// Solves every grid point in parallel. Points are independent; the
    /// result is re-sorted so selection does not depend on completion order.
    pub fn solve(&self, n_points: usize, sink: &dyn EventSink) -> Frontier {
        let grid = target_grid(&self.stats.mean, n_points);

        let outcomes: Vec<GridPointOutcome> = grid
            .par_iter()
            .map(|&target| {
                let outcome = self.solve_point(target);
                sink.emit(&match &outcome {
                    GridPointOutcome::Solved(point) => PipelineEvent::PointSolved {
                        target_return: point.target_return,
                        std_dev: point.std_dev,
                        iterations: point.iterations,
                    },
                    GridPointOutcome::Skipped(skipped) => PipelineEvent::PointSkipped {
                        target_return: skipped.target_return,
                        reason: skipped.reason.clone(),
                    },
                });
                outcome
            })
            .collect();

        let frontier = Frontier::from_outcomes(outcomes);
        sink.emit(&PipelineEvent::FrontierComplete {
            solved: frontier.points.len(),
            skipped: frontier.skipped.len(),
        });
        frontier
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{NullSink, RecordingSink};
    use approx::assert_relative_eq;

    fn two_asset_stats() -> ReturnStatistics {
        ReturnStatistics::from_moments(
            vec!["A".into(), "B".into()],
            vec![0.0010, 0.0020],
            vec![vec![0.0004, 0.0001], vec![0.0001, 0.0009]],
        )
        .unwrap()
    }

    fn four_asset_stats() -> ReturnStatistics {
        ReturnStatistics::from_moments(
            vec!["W".into(), "X".into(), "Y".into(), "Z".into()],
            vec![0.0008, 0.0012, 0.0015, 0.0020],
            vec![
                vec![0.00040, 0.00010, 0.00005, 0.00002],
                vec![0.00010, 0.00050, 0.00012, 0.00008],
                vec![0.00005, 0.00012, 0.00070, 0.00015],
                vec![0.00002, 0.00008, 0.00015, 0.00120],
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_target_grid_spans_means() {
        let grid = target_grid(&[0.002, 0.001, 0.0015], 5);
        assert_eq!(grid.len(), 5);
        assert_eq!(grid[0], 0.001);
        assert_eq!(grid[4], 0.002);
        assert!(grid.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_target_grid_single_point_is_minimum() {
        assert_eq!(target_grid(&[0.002, 0.001], 1), vec![0.001]);
        assert!(target_grid(&[0.002, 0.001], 0).is_empty());
    }

    #[test]
    fn test_two_asset_frontier_properties() {
        let stats = two_asset_stats();
        let frontier = FrontierSolver::new(&stats, false, SolverSettings::default()).solve(50, &NullSink);

        assert_eq!(frontier.points.len(), 50);
        assert!(frontier.skipped.is_empty());
        assert_eq!(frontier.points[0].target_return, 0.0010);
        assert_eq!(frontier.points[49].target_return, 0.0020);

        for pair in frontier.points.windows(2) {
            assert!(pair[0].target_return <= pair[1].target_return);
        }
        for point in &frontier.points {
            let sum: f64 = point.weights.values().sum();
            assert!((sum - 1.0).abs() < 1e-6);
            assert!(point.weights.values().all(|&w| w >= -1e-9));
            assert!((point.realized_return - point.target_return).abs() < 1e-9);
            assert_relative_eq!(point.std_dev, point.variance.sqrt());
        }
    }

    #[test]
    fn test_long_only_frontier_is_efficient_against_short() {
        let stats = four_asset_stats();
        let long_only = FrontierSolver::new(&stats, false, SolverSettings::default()).solve(20, &NullSink);
        let short = FrontierSolver::new(&stats, true, SolverSettings::default()).solve(20, &NullSink);

        assert_eq!(long_only.points.len(), 20);
        assert_eq!(short.points.len(), 20);
        for (lo, sh) in long_only.points.iter().zip(short.points.iter()) {
            assert!(lo.weights.values().all(|&w| w >= -1e-9));
            for point in [lo, sh] {
                assert!((point.weights.values().sum::<f64>() - 1.0).abs() < 1e-6);
                assert!((point.realized_return - point.target_return).abs() < 1e-9);
            }
            // Dropping the sign constraint can only lower the variance.
            assert!(sh.variance <= lo.variance + 1e-15);
        }
    }

    #[test]
    fn test_frontier_is_deterministic() {
        let stats = four_asset_stats();
        let solver = FrontierSolver::new(&stats, false, SolverSettings::default());
        let first = solver.solve(30, &NullSink);
        let second = solver.solve(30, &NullSink);

        for (a, b) in first.points.iter().zip(second.points.iter()) {
            for (wa, wb) in a.weights.values().zip(b.weights.values()) {
                assert!((wa - wb).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn test_from_outcomes_restores_grid_order() {
        let point = |t: f64| {
            GridPointOutcome::Solved(FrontierPoint {
                target_return: t,
                realized_return: t,
                variance: 0.0001,
                std_dev: 0.01,
                weights: BTreeMap::new(),
                iterations: 1,
            })
        };
        let skipped = GridPointOutcome::Skipped(SkippedPoint {
            target_return: 0.0015,
            reason: SkipReason::Infeasible,
        });

        let frontier = Frontier::from_outcomes(vec![point(0.003), skipped, point(0.001), point(0.002)]);
        let targets: Vec<f64> = frontier.points.iter().map(|p| p.target_return).collect();
        assert_eq!(targets, vec![0.001, 0.002, 0.003]);
        assert_eq!(frontier.skipped.len(), 1);
    }

    #[test]
    fn test_zero_deadline_skips_every_point() {
        let stats = two_asset_stats();
        let frontier = FrontierSolver::new(&stats, false, SolverSettings::default())
            .with_point_deadline(Some(Duration::ZERO))
            .solve(10, &NullSink);

        assert!(frontier.is_empty());
        assert_eq!(frontier.skipped.len(), 10);
        assert!(frontier
            .skipped
            .iter()
            .all(|s| matches!(s.reason, SkipReason::DeadlineExceeded { .. })));
    }

    #[test]
    fn test_iteration_limit_drops_points_but_keeps_the_rest() {
        // One iteration settles the endpoints (a single eligible asset) but
        // not interior points, which must move before they can stop.
        let stats = four_asset_stats();
        let settings = SolverSettings {
            max_iterations: 1,
            ..SolverSettings::default()
        };
        let frontier = FrontierSolver::new(&stats, false, settings).solve(10, &NullSink);

        assert_eq!(frontier.points.len() + frontier.skipped.len(), 10);
        assert!(!frontier.skipped.is_empty());
        assert!(frontier
            .skipped
            .iter()
            .all(|s| s.reason == SkipReason::IterationLimit { iterations: 1 }));
    }

    #[test]
    fn test_events_emitted_per_point() {
        let stats = two_asset_stats();
        let sink = RecordingSink::new();
        FrontierSolver::new(&stats, false, SolverSettings::default()).solve(7, &sink);

        let events = sink.events();
        assert_eq!(events.len(), 8);
        let solved = events
            .iter()
            .filter(|e| matches!(e, PipelineEvent::PointSolved { .. }))
            .count();
        assert_eq!(solved, 7);
        assert_eq!(
            events.last(),
            Some(&PipelineEvent::FrontierComplete { solved: 7, skipped: 0 })
        );
    }
}
