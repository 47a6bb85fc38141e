use anyhow::{Context, Result};
use clap::Parser;
use sharpe_frontier::config::{self, OptimizerConfig};
use sharpe_frontier::portfolio::{self, PortfolioOptimizer};
use sharpe_frontier::{Market, SuffixNormalizer, YahooProvider};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Max-Sharpe portfolio allocation from the efficient frontier",
    after_help = "EXAMPLES:
    # Long-only allocation of $10,000 across three US tickers
    cargo run --release -- --tickers NVDA,GOOGL,AAPL

    # Saudi listings with short selling and the full frontier table
    cargo run --release -- --tickers 2222,1120,2010 --market sr --allow-short --frontier"
)]
struct Args {
    /// Comma-separated tickers (e.g., NVDA,GOOGL,AAPL)
    #[arg(long, value_delimiter = ',', required = true)]
    tickers: Vec<String>,

    /// Market the tickers are listed on (us|sr)
    #[arg(long, default_value = "us")]
    market: Market,

    /// Amount of money to allocate
    #[arg(long)]
    budget: Option<f64>,

    /// Number of target returns on the frontier grid
    #[arg(long)]
    points: Option<usize>,

    /// Allow negative weights
    #[arg(long)]
    allow_short: bool,

    /// Lookback range of daily history (e.g., 6mo, 1y, 5y)
    #[arg(long)]
    range: Option<String>,

    /// Annual risk-free rate, converted to a daily rate internally
    #[arg(long)]
    risk_free_annual: Option<f64>,

    /// Per-point solver deadline in milliseconds
    #[arg(long)]
    deadline_ms: Option<u64>,

    /// Directory for cached price responses
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Disable the on-disk price cache
    #[arg(long)]
    no_cache: bool,

    /// Print the run as JSON instead of a table
    #[arg(long)]
    json: bool,

    /// Also print every frontier point
    #[arg(long)]
    frontier: bool,
}

impl Args {
    fn apply(&self, mut config: OptimizerConfig) -> OptimizerConfig {
        if let Some(budget) = self.budget {
            config = config.with_budget(budget);
        }
        if let Some(points) = self.points {
            config = config.with_points(points);
        }
        if self.allow_short {
            config = config.with_allow_short(true);
        }
        if let Some(range) = &self.range {
            config = config.with_lookback_range(range.clone());
        }
        if let Some(rate) = self.risk_free_annual {
            config = config.with_annual_risk_free_rate(rate);
        }
        if let Some(ms) = self.deadline_ms {
            config = config.with_point_deadline(Some(Duration::from_millis(ms)));
        }
        config
    }

    fn provider(&self, mut provider: YahooProvider) -> YahooProvider {
        if let Some(dir) = &self.cache_dir {
            provider = provider.with_cache_dir(Some(dir.clone()));
        }
        if self.no_cache {
            provider = provider.with_cache_dir(None);
        }
        provider
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            eprintln!("Failed to load .env: {}", e);
        }
    }

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("sharpe_frontier=info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();
    config::init_cpu_parallelism();

    let args = Args::parse();
    let config = args.apply(OptimizerConfig::from_env());
    config.validate().context("invalid configuration")?;

    let provider = args.provider(YahooProvider::from_env());
    let optimizer = PortfolioOptimizer::new(config);

    let run = match optimizer
        .optimize(&provider, &SuffixNormalizer, &args.tickers, args.market)
        .await
    {
        Ok(run) => run,
        Err(e) => {
            error!("Portfolio optimization failed: {}", e);
            return Err(e.into());
        }
    };
    info!(
        target_return = run.result.target_return,
        sharpe_ratio = run.result.sharpe_ratio,
        "Portfolio optimization completed."
    );

    if args.json {
        println!("{}", serde_json::to_string_pretty(&run)?);
    } else {
        portfolio::print_allocation(&run);
        if args.frontier {
            portfolio::print_frontier(&run, optimizer.config().risk_free_rate);
        }
    }

    Ok(())
}
