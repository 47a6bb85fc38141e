use crate::error::{OptimizerError, Result};
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use futures_util::future::try_join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

/// A single daily closing price.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PricePoint {
    pub date: DateTime<Utc>,
    pub close: f64,
}

/// Ordered closing-price history for one ticker.
#[derive(Clone, Debug, PartialEq)]
pub struct AssetSeries {
    pub ticker: String,
    pub history: Vec<PricePoint>,
}

impl AssetSeries {
    /// Builds a series, ordering the observations by date.
    pub fn new(ticker: impl Into<String>, mut history: Vec<PricePoint>) -> Self {
        history.sort_by_key(|p| p.date);
        Self {
            ticker: ticker.into(),
            history,
        }
    }

    /// One close per consecutive calendar day starting at `start`.
    pub fn from_closes(ticker: impl Into<String>, start: DateTime<Utc>, closes: &[f64]) -> Self {
        let history = closes
            .iter()
            .enumerate()
            .map(|(i, &close)| PricePoint {
                date: start + ChronoDuration::days(i as i64),
                close,
            })
            .collect();
        Self::new(ticker, history)
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Markets & ticker normalization
// ──────────────────────────────────────────────────────────────────────────────

/// Exchange region a ticker list belongs to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Market {
    #[default]
    Us,
    Saudi,
}

impl Market {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Us => "US",
            Self::Saudi => "SR",
        }
    }
}

impl FromStr for Market {
    type Err = OptimizerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "US" => Ok(Self::Us),
            "SR" | "SA" | "SAUDI" => Ok(Self::Saudi),
            other => Err(OptimizerError::InvalidInput(format!(
                "unknown market '{}', expected US or SR",
                other
            ))),
        }
    }
}

/// Maps a caller-facing ticker onto the symbol a price provider expects.
pub trait TickerNormalizer: Send + Sync {
    fn normalize(&self, ticker: &str, market: Market) -> String;
}

/// Uppercases tickers and appends the exchange suffix (`.SR` for Saudi listings).
#[derive(Clone, Copy, Debug, Default)]
pub struct SuffixNormalizer;

impl TickerNormalizer for SuffixNormalizer {
    fn normalize(&self, ticker: &str, market: Market) -> String {
        let symbol = ticker.trim().to_uppercase();
        match market {
            Market::Us => symbol,
            Market::Saudi if symbol.ends_with(".SR") => symbol,
            Market::Saudi => format!("{}.SR", symbol),
        }
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Providers
// ──────────────────────────────────────────────────────────────────────────────

/// Source of daily closing-price histories.
pub trait PriceProvider: Send + Sync {
    fn fetch_history(
        &self,
        symbol: &str,
        range: &str,
    ) -> impl Future<Output = Result<AssetSeries>> + Send;
}

/// Fetches every ticker concurrently. Series come back in ticker order, keyed
/// by the caller's ticker rather than the provider symbol. The first failure
/// aborts the whole fetch.
pub async fn fetch_all<P, N>(
    provider: &P,
    normalizer: &N,
    tickers: &[String],
    market: Market,
    range: &str,
) -> Result<Vec<AssetSeries>>
where
    P: PriceProvider,
    N: TickerNormalizer + ?Sized,
{
    let requests = tickers.iter().map(|ticker| {
        let symbol = normalizer.normalize(ticker, market);
        async move {
            let mut series = provider.fetch_history(&symbol, range).await?;
            if series.is_empty() {
                return Err(OptimizerError::data_fetch(ticker, "provider returned no prices"));
            }
            series.ticker = ticker.clone();
            Ok::<_, OptimizerError>(series)
        }
    });

    try_join_all(requests).await
}

/// In-memory provider keyed by provider symbol. Ignores the requested range.
#[derive(Clone, Debug, Default)]
pub struct InMemoryProvider {
    series: HashMap<String, AssetSeries>,
}

impl InMemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, series: AssetSeries) {
        self.series.insert(series.ticker.clone(), series);
    }

    pub fn with_series(mut self, series: AssetSeries) -> Self {
        self.insert(series);
        self
    }
}

impl PriceProvider for InMemoryProvider {
    async fn fetch_history(&self, symbol: &str, _range: &str) -> Result<AssetSeries> {
        self.series
            .get(symbol)
            .cloned()
            .ok_or_else(|| OptimizerError::data_fetch(symbol, "unknown symbol"))
    }
}

#[derive(Deserialize, Serialize, Debug)]
struct YahooChartResponse {
    chart: YahooChart,
}

#[derive(Deserialize, Serialize, Debug)]
struct YahooChart {
    result: Option<Vec<YahooResult>>,
    error: Option<YahooChartError>,
}

#[derive(Deserialize, Serialize, Debug)]
struct YahooChartError {
    code: Option<String>,
    description: Option<String>,
}

#[derive(Deserialize, Serialize, Debug)]
struct YahooResult {
    #[serde(default)]
    timestamp: Vec<i64>,
    indicators: YahooIndicators,
}

#[derive(Deserialize, Serialize, Debug)]
struct YahooIndicators {
    #[serde(default)]
    quote: Vec<YahooQuote>,
    #[serde(default)]
    adjclose: Vec<YahooAdjClose>,
}

#[derive(Deserialize, Serialize, Debug)]
struct YahooQuote {
    #[serde(default)]
    close: Vec<Option<f64>>,
}

#[derive(Deserialize, Serialize, Debug)]
struct YahooAdjClose {
    #[serde(default)]
    adjclose: Vec<Option<f64>>,
}

pub const DEFAULT_CACHE_DIR: &str = ".cache";
pub const ENV_CACHE_DIR: &str = "SHARPE_FRONTIER_CACHE_DIR";
pub const ENV_FETCH_ATTEMPTS: &str = "SHARPE_FRONTIER_FETCH_ATTEMPTS";

/// Daily history from the Yahoo Finance chart API, cached on disk as JSON.
#[derive(Clone, Debug)]
pub struct YahooProvider {
    client: reqwest::Client,
    cache_dir: Option<PathBuf>,
    cache_ttl: Duration,
    max_attempts: usize,
    retry_delay: Duration,
}

impl Default for YahooProvider {
    fn default() -> Self {
        Self {
            client: reqwest::Client::new(),
            cache_dir: Some(PathBuf::from(DEFAULT_CACHE_DIR)),
            cache_ttl: Duration::from_secs(86_400),
            max_attempts: 3,
            retry_delay: Duration::from_secs(2),
        }
    }
}

impl YahooProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` disables the disk cache.
    pub fn with_cache_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.cache_dir = dir;
        self
    }

    pub fn with_retries(mut self, max_attempts: usize, retry_delay: Duration) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.retry_delay = retry_delay;
        self
    }

    /// Defaults overridden by `SHARPE_FRONTIER_CACHE_DIR` and
    /// `SHARPE_FRONTIER_FETCH_ATTEMPTS`.
    pub fn from_env() -> Self {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Applies overrides from `lookup`. A cache dir of `off` or `none`
    /// disables caching; unparsable attempt counts are logged and ignored.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        if let Some(raw) = get(ENV_CACHE_DIR) {
            let dir = match raw.to_ascii_lowercase().as_str() {
                "off" | "none" => None,
                _ => Some(PathBuf::from(raw)),
            };
            self = self.with_cache_dir(dir);
        }
        if let Some(raw) = get(ENV_FETCH_ATTEMPTS) {
            match raw.parse::<usize>() {
                Ok(n) if n > 0 => {
                    let delay = self.retry_delay;
                    self = self.with_retries(n, delay);
                }
                _ => warn!(key = ENV_FETCH_ATTEMPTS, value = %raw, "Ignoring invalid attempt count"),
            }
        }
        self
    }

    fn cache_path(&self, symbol: &str, range: &str) -> Option<PathBuf> {
        self.cache_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}_{}.json", symbol, range)))
    }

    fn load_fresh_cache(&self, path: &Path) -> Option<YahooChartResponse> {
        let modified = std::fs::metadata(path).and_then(|m| m.modified()).ok()?;
        let age = std::time::SystemTime::now().duration_since(modified).ok()?;
        if age >= self.cache_ttl {
            return None;
        }
        let file = std::fs::File::open(path).ok()?;
        match serde_json::from_reader(std::io::BufReader::new(file)) {
            Ok(response) => Some(response),
            Err(e) => {
                warn!("Ignoring unreadable cache file {}: {}", path.display(), e);
                None
            }
        }
    }

    fn store_cache(&self, path: &Path, response: &YahooChartResponse) {
        let written = path
            .parent()
            .map_or(Ok(()), std::fs::create_dir_all)
            .and_then(|_| std::fs::File::create(path))
            .map_err(|e| e.to_string())
            .and_then(|file| {
                serde_json::to_writer(std::io::BufWriter::new(file), response)
                    .map_err(|e| e.to_string())
            });
        if let Err(e) = written {
            warn!("Failed to write cache file {}: {}", path.display(), e);
        }
    }

    async fn fetch_from_api(&self, symbol: &str, range: &str) -> Result<YahooChartResponse> {
        let url = format!(
            "https://query1.finance.yahoo.com/v8/finance/chart/{}?range={}&interval=1d",
            symbol, range
        );

        let mut attempts = 0;
        loop {
            attempts += 1;
            let outcome = match self
                .client
                .get(&url)
                .header("User-Agent", "Mozilla/5.0")
                .send()
                .await
            {
                Ok(resp) => resp.json::<YahooChartResponse>().await,
                Err(e) => Err(e),
            };

            match outcome {
                Ok(response) => return Ok(response),
                Err(e) if attempts >= self.max_attempts => {
                    return Err(OptimizerError::data_fetch(symbol, e));
                }
                Err(e) => {
                    warn!(
                        "Failed to fetch data for {} (attempt {}/{}): {}",
                        symbol, attempts, self.max_attempts, e
                    );
                }
            }

            tokio::time::sleep(self.retry_delay).await;
        }
    }
}

impl PriceProvider for YahooProvider {
    async fn fetch_history(&self, symbol: &str, range: &str) -> Result<AssetSeries> {
        let cache_path = self.cache_path(symbol, range);

        let cached = cache_path.as_deref().and_then(|p| self.load_fresh_cache(p));
        let response = match cached {
            Some(response) => {
                info!("Loading {} from cache...", symbol);
                response
            }
            None => {
                info!("Cache miss for {}, fetching...", symbol);
                let response = self.fetch_from_api(symbol, range).await?;
                // Only cache payloads that actually parse into a series.
                parse_chart(symbol, &response)?;
                if let Some(path) = cache_path.as_deref() {
                    self.store_cache(path, &response);
                }
                response
            }
        };

        parse_chart(symbol, &response)
    }
}

/// Converts a chart payload into a series, preferring split/dividend-adjusted
/// closes when the payload carries them. Rows with a null close are skipped.
fn parse_chart(symbol: &str, response: &YahooChartResponse) -> Result<AssetSeries> {
    if let Some(err) = &response.chart.error {
        return Err(OptimizerError::data_fetch(
            symbol,
            format!(
                "{}: {}",
                err.code.as_deref().unwrap_or("error"),
                err.description.as_deref().unwrap_or("no description")
            ),
        ));
    }

    let result = response
        .chart
        .result
        .as_ref()
        .and_then(|r| r.first())
        .ok_or_else(|| OptimizerError::data_fetch(symbol, "no data found"))?;

    let closes = match result.indicators.adjclose.first() {
        Some(adj) if adj.adjclose.len() == result.timestamp.len() => &adj.adjclose,
        _ => {
            let quote = result
                .indicators
                .quote
                .first()
                .ok_or_else(|| OptimizerError::data_fetch(symbol, "missing quote block"))?;
            &quote.close
        }
    };

    if closes.len() != result.timestamp.len() {
        return Err(OptimizerError::data_fetch(
            symbol,
            format!(
                "malformed payload: {} timestamps but {} closes",
                result.timestamp.len(),
                closes.len()
            ),
        ));
    }

    let history: Vec<PricePoint> = result
        .timestamp
        .iter()
        .zip(closes.iter())
        .filter_map(|(&ts, close)| {
            let close = (*close)?;
            let date = Utc.timestamp_opt(ts, 0).single()?;
            Some(PricePoint { date, close })
        })
        .collect();

    if history.is_empty() {
        return Err(OptimizerError::data_fetch(symbol, "no closing prices in payload"));
    }

    Ok(AssetSeries::new(symbol.to_uppercase(), history))
}
