use crate::allocation::{OptimizationResult, map_result};
use crate::config::OptimizerConfig;
use crate::data::{AssetSeries, Market, PriceProvider, TickerNormalizer, fetch_all};
use crate::error::{OptimizerError, Result};
use crate::events::{EventSink, PipelineEvent, TracingSink};
use crate::frontier::{Frontier, FrontierPoint, FrontierSolver};
use crate::returns::{self, ReturnStatistics};
use crate::sharpe::{sharpe_ratio, select_max_sharpe};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::info;

// ──────────────────────────────────────────────────────────────────────────────
// Data Structures
// ──────────────────────────────────────────────────────────────────────────────

/// The selected portfolio together with the frontier it was picked from.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct OptimizationRun {
    pub result: OptimizationResult,
    /// Solved points in ascending target-return order, plus the skipped ones.
    pub frontier: Frontier,
}

/// Runs the estimate → frontier → select → allocate pipeline.
///
/// Holds no state between calls besides its configuration and event sink,
/// so one instance can serve concurrent requests.
#[derive(Clone)]
pub struct PortfolioOptimizer {
    config: OptimizerConfig,
    sink: Arc<dyn EventSink>,
}

impl std::fmt::Debug for PortfolioOptimizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortfolioOptimizer")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Default for PortfolioOptimizer {
    fn default() -> Self {
        Self::new(OptimizerConfig::default())
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Pipeline
// ──────────────────────────────────────────────────────────────────────────────

impl PortfolioOptimizer {
    pub fn new(config: OptimizerConfig) -> Self {
        Self {
            config,
            sink: Arc::new(TracingSink),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    /// Fetches every ticker, then optimizes on a blocking thread.
    pub async fn optimize<P, N>(
        &self,
        provider: &P,
        normalizer: &N,
        tickers: &[String],
        market: Market,
    ) -> Result<OptimizationRun>
    where
        P: PriceProvider,
        N: TickerNormalizer + ?Sized,
    {
        self.config.validate()?;
        validate_tickers(normalizer, tickers, market)?;

        info!(
            tickers = ?tickers,
            market = market.as_str(),
            range = %self.config.lookback_range,
            "Fetching price history"
        );
        let series = fetch_all(provider, normalizer, tickers, market, &self.config.lookback_range).await?;
        self.sink.emit(&PipelineEvent::FetchComplete {
            tickers: series.len(),
            observations: series.iter().map(AssetSeries::len).sum(),
        });

        let optimizer = self.clone();
        tokio::task::spawn_blocking(move || optimizer.optimize_series(&series))
            .await
            .map_err(|e| OptimizerError::TaskFailed(e.to_string()))?
    }

    /// Estimates return statistics from price histories and optimizes them.
    pub fn optimize_series(&self, series: &[AssetSeries]) -> Result<OptimizationRun> {
        self.config.validate()?;
        let stats = returns::estimate(series)?;
        self.sink.emit(&PipelineEvent::ReturnsEstimated {
            rows: stats.returns.n_rows(),
            assets: stats.n_assets(),
        });
        self.optimize_statistics(&stats)
    }

    /// Optimizes precomputed mean returns and covariance.
    pub fn optimize_statistics(&self, stats: &ReturnStatistics) -> Result<OptimizationRun> {
        self.config.validate()?;
        if stats.n_assets() == 1 {
            return self.single_asset(stats);
        }

        let frontier = FrontierSolver::new(stats, self.config.allow_short, self.config.solver)
            .with_point_deadline(self.config.point_deadline)
            .solve(self.config.n_points, self.sink.as_ref());
        if frontier.is_empty() {
            return Err(OptimizerError::EmptyFrontier {
                skipped: frontier.skipped.len(),
            });
        }

        let selection = select_max_sharpe(&frontier.points, self.config.risk_free_rate)?;
        self.sink.emit(&PipelineEvent::SelectionMade {
            target_return: selection.point.target_return,
            sharpe_ratio: selection.sharpe_ratio,
        });
        let result = map_result(selection.point, selection.sharpe_ratio, self.config.budget)?;

        Ok(OptimizationRun { result, frontier })
    }

    /// A lone asset is its own frontier: full weight, its own mean and variance.
    fn single_asset(&self, stats: &ReturnStatistics) -> Result<OptimizationRun> {
        let variance = stats.variance(0).max(0.0);
        let point = FrontierPoint {
            target_return: stats.mean[0],
            realized_return: stats.mean[0],
            variance,
            std_dev: variance.sqrt(),
            weights: BTreeMap::from([(stats.tickers[0].clone(), 1.0)]),
            iterations: 0,
        };
        let sharpe = sharpe_ratio(&point, self.config.risk_free_rate)
            .ok_or(OptimizerError::NoValidPortfolio { points: 1 })?;
        self.sink.emit(&PipelineEvent::SelectionMade {
            target_return: point.target_return,
            sharpe_ratio: sharpe,
        });

        let result = map_result(&point, sharpe, self.config.budget)?;
        Ok(OptimizationRun {
            result,
            frontier: Frontier {
                points: vec![point],
                skipped: Vec::new(),
            },
        })
    }
}

fn validate_tickers<N>(normalizer: &N, tickers: &[String], market: Market) -> Result<()>
where
    N: TickerNormalizer + ?Sized,
{
    if tickers.is_empty() {
        return Err(OptimizerError::InvalidInput("no tickers supplied".into()));
    }
    let mut seen = HashSet::new();
    for ticker in tickers {
        if ticker.trim().is_empty() {
            return Err(OptimizerError::InvalidInput("empty ticker".into()));
        }
        if !seen.insert(normalizer.normalize(ticker, market)) {
            return Err(OptimizerError::InvalidInput(format!("duplicate ticker {}", ticker)));
        }
    }
    Ok(())
}

// ──────────────────────────────────────────────────────────────────────────────
// Output
// ──────────────────────────────────────────────────────────────────────────────

/// Pretty-prints the selected allocation to stdout.
pub fn print_allocation(run: &OptimizationRun) {
    let result = &run.result;
    println!("\n╔════════════════════════════════════════════════════════════╗");
    println!("║              Max-Sharpe Portfolio Allocation               ║");
    println!("╠════════════════════════════════════════════════════════════╣");
    println!(
        "║  Annualized Return      : {:>+7.2}%                         ║",
        result.annualized_return * 100.0
    );
    println!(
        "║  Annualized Volatility  : {:>7.2}%                         ║",
        result.volatility * 100.0
    );
    println!(
        "║  Sharpe Ratio (daily)   : {:>7.4}                          ║",
        result.sharpe_ratio
    );
    println!(
        "║  Frontier Points        : {:>4} solved / {:>4} skipped       ║",
        run.frontier.points.len(),
        run.frontier.skipped.len()
    );
    println!("╠════════════════════════════════════════════════════════════╣");
    println!("║  Ticker        Weight        Allocation                    ║");
    println!("╠════════════════════════════════════════════════════════════╣");

    let mut sorted: Vec<_> = result.weights.iter().collect();
    sorted.sort_by(|a, b| b.1.total_cmp(a.1));

    for (ticker, w) in sorted {
        let amount = result.budget_allocation.get(ticker).copied().unwrap_or(0.0);
        println!(
            "║  {:<10} {:>8.2}%   {:>14.2}                      ║",
            ticker,
            w * 100.0,
            amount
        );
    }

    println!("╠════════════════════════════════════════════════════════════╣");
    println!(
        "║  Budget: {:>14.2}                                    ║",
        result.budget
    );
    println!("╚════════════════════════════════════════════════════════════╝");
    println!();
    println!("⚠  Educational use only. Not financial advice.");
}

/// Prints every frontier point, marking the selected one.
pub fn print_frontier(run: &OptimizationRun, risk_free: f64) {
    println!("\n  Target Ret    Std Dev     Sharpe");
    for point in &run.frontier.points {
        let marker = if point.target_return == run.result.target_return {
            "◀"
        } else {
            ""
        };
        let sharpe = sharpe_ratio(point, risk_free)
            .map(|s| format!("{:>8.4}", s))
            .unwrap_or_else(|| format!("{:>8}", "n/a"));
        println!(
            "  {:>+10.6}  {:>9.6}  {}  {}",
            point.target_return, point.std_dev, sharpe, marker
        );
    }
    for skipped in &run.frontier.skipped {
        println!("  {:>+10.6}  skipped: {}", skipped.target_return, skipped.reason);
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Tests
// ──────────────────────────────────────────────────────────────────────────────
