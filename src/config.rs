use crate::error::{OptimizerError, Result};
use crate::solver::SolverSettings;
use rayon::ThreadPoolBuilder;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{info, warn};

static RAYON_INIT: OnceLock<()> = OnceLock::new();

/// Sizes the global rayon pool to every logical core. Safe to call more than once.
pub fn init_cpu_parallelism() {
    RAYON_INIT.get_or_init(|| {
        let num_threads = num_cpus::get().max(1);
        match ThreadPoolBuilder::new().num_threads(num_threads).build_global() {
            Ok(_) => info!(
                "Initialized Rayon thread pool with {} threads (all logical CPU cores)",
                num_threads
            ),
            Err(e) => warn!(
                "Rayon thread pool already initialized or unavailable ({}). Using existing configuration.",
                e
            ),
        }
    });
}

/// Annual trading days for annualization.
pub const TRADING_DAYS: f64 = 252.0;
/// Risk-free annual rate used when none is given.
pub const DEFAULT_ANNUAL_RISK_FREE: f64 = 0.03;
/// Number of target returns on the frontier grid.
pub const DEFAULT_GRID_POINTS: usize = 50;
pub const DEFAULT_BUDGET: f64 = 10_000.0;
/// Range of historical data to fetch (e.g., "6mo", "1y", "5y")
pub const DEFAULT_LOOKBACK_RANGE: &str = "1y";

pub const ENV_POINTS: &str = "SHARPE_FRONTIER_POINTS";
pub const ENV_RISK_FREE_ANNUAL: &str = "SHARPE_FRONTIER_RISK_FREE_ANNUAL";
pub const ENV_ALLOW_SHORT: &str = "SHARPE_FRONTIER_ALLOW_SHORT";
pub const ENV_RANGE: &str = "SHARPE_FRONTIER_RANGE";

/// Everything one optimization call needs besides the price data.
#[derive(Clone, Debug, PartialEq)]
pub struct OptimizerConfig {
    pub n_points: usize,
    pub allow_short: bool,
    /// Per-period (daily) rate, consistent with the return data.
    pub risk_free_rate: f64,
    pub budget: f64,
    pub point_deadline: Option<Duration>,
    pub solver: SolverSettings,
    pub lookback_range: String,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            n_points: DEFAULT_GRID_POINTS,
            allow_short: false,
            risk_free_rate: DEFAULT_ANNUAL_RISK_FREE / TRADING_DAYS,
            budget: DEFAULT_BUDGET,
            point_deadline: None,
            solver: SolverSettings::default(),
            lookback_range: DEFAULT_LOOKBACK_RANGE.to_string(),
        }
    }
}

impl OptimizerConfig {
    pub fn with_points(mut self, n_points: usize) -> Self {
        self.n_points = n_points;
        self
    }

    pub fn with_allow_short(mut self, allow_short: bool) -> Self {
        self.allow_short = allow_short;
        self
    }

    pub fn with_risk_free_rate(mut self, daily_rate: f64) -> Self {
        self.risk_free_rate = daily_rate;
        self
    }

    pub fn with_annual_risk_free_rate(mut self, annual_rate: f64) -> Self {
        self.risk_free_rate = annual_rate / TRADING_DAYS;
        self
    }

    pub fn with_budget(mut self, budget: f64) -> Self {
        self.budget = budget;
        self
    }

    pub fn with_point_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.point_deadline = deadline;
        self
    }

    pub fn with_solver(mut self, solver: SolverSettings) -> Self {
        self.solver = solver;
        self
    }

    pub fn with_lookback_range(mut self, range: impl Into<String>) -> Self {
        self.lookback_range = range.into();
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.n_points == 0 {
            return Err(OptimizerError::InvalidInput(
                "frontier needs at least one grid point".into(),
            ));
        }
        if !self.budget.is_finite() || self.budget < 0.0 {
            return Err(OptimizerError::InvalidInput(format!(
                "budget must be a finite non-negative amount, got {}",
                self.budget
            )));
        }
        if !self.risk_free_rate.is_finite() {
            return Err(OptimizerError::InvalidInput(format!(
                "risk-free rate must be finite, got {}",
                self.risk_free_rate
            )));
        }
        if self.solver.max_iterations == 0 {
            return Err(OptimizerError::InvalidInput(
                "solver needs at least one iteration".into(),
            ));
        }
        if self.lookback_range.trim().is_empty() {
            return Err(OptimizerError::InvalidInput("lookback range is empty".into()));
        }
        Ok(())
    }

    /// Defaults overridden by `SHARPE_FRONTIER_*` environment variables.
    pub fn from_env() -> Self {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Applies overrides from `lookup`. Unparsable values are logged and ignored.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        if let Some(raw) = get(ENV_POINTS) {
            match raw.parse::<usize>() {
                Ok(n) if n > 0 => self.n_points = n,
                _ => warn!(key = ENV_POINTS, value = %raw, "Ignoring invalid grid size"),
            }
        }
        if let Some(raw) = get(ENV_RISK_FREE_ANNUAL) {
            match raw.parse::<f64>() {
                Ok(rate) if rate.is_finite() => self.risk_free_rate = rate / TRADING_DAYS,
                _ => warn!(key = ENV_RISK_FREE_ANNUAL, value = %raw, "Ignoring invalid risk-free rate"),
            }
        }
        if let Some(raw) = get(ENV_ALLOW_SHORT) {
            match parse_flag(&raw) {
                Some(flag) => self.allow_short = flag,
                None => warn!(key = ENV_ALLOW_SHORT, value = %raw, "Ignoring invalid flag"),
            }
        }
        if let Some(raw) = get(ENV_RANGE) {
            self.lookback_range = raw;
        }
        self
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
