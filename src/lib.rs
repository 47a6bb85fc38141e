//! Efficient-frontier portfolio optimization.
//!
//! Price histories are aligned into daily returns, a minimum-variance
//! frontier is solved over a grid of target returns, and the point with the
//! highest Sharpe ratio is mapped onto a budget.

pub mod allocation;
pub mod config;
pub mod data;
pub mod error;
pub mod events;
pub mod frontier;
pub mod portfolio;
pub mod returns;
pub mod sharpe;
pub mod solver;

pub use allocation::OptimizationResult;
pub use config::OptimizerConfig;
pub use data::{
    AssetSeries, InMemoryProvider, Market, PricePoint, PriceProvider, SuffixNormalizer,
    TickerNormalizer, YahooProvider,
};
pub use error::{OptimizerError, SkipReason};
pub use events::{EventSink, NullSink, PipelineEvent, RecordingSink, TracingSink};
pub use frontier::{Frontier, FrontierPoint, GridPointOutcome, SkippedPoint};
pub use portfolio::{OptimizationRun, PortfolioOptimizer};
pub use returns::ReturnStatistics;
pub use solver::SolverSettings;
