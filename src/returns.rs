use crate::data::AssetSeries;
use crate::error::{OptimizerError, Result};
use chrono::NaiveDate;
use std::collections::{BTreeMap, BTreeSet, HashSet};

/// Period-over-period returns. Every row carries a value for every ticker.
#[derive(Clone, Debug, PartialEq)]
pub struct ReturnsMatrix {
    pub tickers: Vec<String>,
    /// Date each return row ends on.
    pub dates: Vec<NaiveDate>,
    pub rows: Vec<Vec<f64>>,
}

impl ReturnsMatrix {
    pub fn n_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn column(&self, j: usize) -> Vec<f64> {
        self.rows.iter().map(|row| row[j]).collect()
    }
}

/// Mean vector and covariance matrix over a returns matrix.
#[derive(Clone, Debug, PartialEq)]
pub struct ReturnStatistics {
    pub tickers: Vec<String>,
    /// Empty when the statistics were supplied directly.
    pub returns: ReturnsMatrix,
    pub mean: Vec<f64>,
    pub covariance: Vec<Vec<f64>>,
}

impl ReturnStatistics {
    /// Wraps externally estimated moments.
    pub fn from_moments(
        tickers: Vec<String>,
        mean: Vec<f64>,
        covariance: Vec<Vec<f64>>,
    ) -> Result<Self> {
        let n = tickers.len();
        if n == 0 {
            return Err(OptimizerError::InvalidInput("no tickers".into()));
        }
        if mean.len() != n || covariance.len() != n || covariance.iter().any(|row| row.len() != n) {
            return Err(OptimizerError::InvalidInput(format!(
                "moment dimensions do not match {} tickers",
                n
            )));
        }
        if mean.iter().chain(covariance.iter().flatten()).any(|v| !v.is_finite()) {
            return Err(OptimizerError::InvalidInput("non-finite moment".into()));
        }
        for i in 0..n {
            for j in (i + 1)..n {
                let (a, b) = (covariance[i][j], covariance[j][i]);
                if (a - b).abs() > 1e-12 * a.abs().max(b.abs()).max(1.0) {
                    return Err(OptimizerError::InvalidInput(format!(
                        "covariance is not symmetric at ({}, {})",
                        i, j
                    )));
                }
            }
        }

        Ok(Self {
            returns: ReturnsMatrix {
                tickers: tickers.clone(),
                dates: Vec::new(),
                rows: Vec::new(),
            },
            tickers,
            mean,
            covariance,
        })
    }

    pub fn n_assets(&self) -> usize {
        self.tickers.len()
    }

    pub fn variance(&self, i: usize) -> f64 {
        self.covariance[i][i]
    }
}

/// Longest run of missing days a series is forward-filled across.
pub const MAX_FILL_GAP: usize = 1;

/// Aligns closes on their common calendar days.
///
/// A missing day is filled from the series' previous close, at most
/// `MAX_FILL_GAP` days in a row. Days where some ticker has no value after
/// that (not started yet, or stopped reporting) are dropped. Multiple
/// observations on one day keep the last.
pub fn align_prices(series: &[AssetSeries]) -> (Vec<NaiveDate>, Vec<Vec<f64>>) {
    let by_day: Vec<BTreeMap<NaiveDate, f64>> = series
        .iter()
        .map(|s| s.history.iter().map(|p| (p.date.date_naive(), p.close)).collect())
        .collect();

    let all_days: BTreeSet<NaiveDate> = by_day.iter().flat_map(|m| m.keys().copied()).collect();

    // Last close per ticker and how many consecutive days it has been carried.
    let mut last_seen: Vec<Option<(f64, usize)>> = vec![None; series.len()];
    let mut dates = Vec::with_capacity(all_days.len());
    let mut rows = Vec::with_capacity(all_days.len());

    for day in all_days {
        for (slot, prices) in last_seen.iter_mut().zip(by_day.iter()) {
            *slot = match (prices.get(&day), *slot) {
                (Some(&price), _) => Some((price, 0)),
                (None, Some((price, filled))) => Some((price, filled + 1)),
                (None, None) => None,
            };
        }
        let row: Option<Vec<f64>> = last_seen
            .iter()
            .map(|slot| slot.filter(|&(_, filled)| filled <= MAX_FILL_GAP).map(|(p, _)| p))
            .collect();
        if let Some(row) = row {
            dates.push(day);
            rows.push(row);
        }
    }

    (dates, rows)
}

/// Percentage change between consecutive rows. A row whose previous price is
/// not a positive finite number has no defined return and is dropped.
pub fn pct_change(dates: &[NaiveDate], prices: &[Vec<f64>]) -> (Vec<NaiveDate>, Vec<Vec<f64>>) {
    let mut out_dates = Vec::with_capacity(prices.len().saturating_sub(1));
    let mut out_rows = Vec::with_capacity(prices.len().saturating_sub(1));

    for t in 1..prices.len() {
        let row: Option<Vec<f64>> = prices[t - 1]
            .iter()
            .zip(prices[t].iter())
            .map(|(&prev, &cur)| {
                let r = (cur - prev) / prev;
                (prev > 0.0 && r.is_finite()).then_some(r)
            })
            .collect();
        if let Some(row) = row {
            out_dates.push(dates[t]);
            out_rows.push(row);
        }
    }

    (out_dates, out_rows)
}

pub fn sample_mean(rows: &[Vec<f64>], n_assets: usize) -> Vec<f64> {
    let n_obs = rows.len() as f64;
    (0..n_assets)
        .map(|j| rows.iter().map(|r| r[j]).sum::<f64>() / n_obs)
        .collect()
}

/// Sample covariance with an `n - 1` denominator. Each unordered pair is
/// computed once, so the result is exactly symmetric.
pub fn sample_covariance(rows: &[Vec<f64>], means: &[f64]) -> Vec<Vec<f64>> {
    let n = means.len();
    let denom = rows.len() as f64 - 1.0;
    let mut cov = vec![vec![0.0; n]; n];
    for i in 0..n {
        for j in i..n {
            let sum: f64 = rows
                .iter()
                .map(|r| (r[i] - means[i]) * (r[j] - means[j]))
                .sum();
            let covariance = sum / denom;
            cov[i][j] = covariance;
            cov[j][i] = covariance;
        }
    }
    cov
}

/// Aligns the series and estimates mean returns and their covariance.
pub fn estimate(series: &[AssetSeries]) -> Result<ReturnStatistics> {
    if series.is_empty() {
        return Err(OptimizerError::InvalidInput("no price series supplied".into()));
    }

    let mut seen = HashSet::new();
    for s in series {
        if !seen.insert(s.ticker.as_str()) {
            return Err(OptimizerError::InvalidInput(format!(
                "duplicate ticker {}",
                s.ticker
            )));
        }
        if s.len() < 2 {
            return Err(OptimizerError::insufficient(s.ticker.clone(), s.len()));
        }
    }

    let (dates, prices) = align_prices(series);
    if prices.len() < 2 {
        return Err(OptimizerError::insufficient("aligned prices", prices.len()));
    }

    let (return_dates, rows) = pct_change(&dates, &prices);
    if rows.len() < 2 {
        return Err(OptimizerError::insufficient("aligned returns", rows.len()));
    }

    let tickers: Vec<String> = series.iter().map(|s| s.ticker.clone()).collect();
    let mean = sample_mean(&rows, tickers.len());
    let covariance = sample_covariance(&rows, &mean);

    Ok(ReturnStatistics {
        returns: ReturnsMatrix {
            tickers: tickers.clone(),
            dates: return_dates,
            rows,
        },
        tickers,
        mean,
        covariance,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::testing::{mock_series, start_date};
    use crate::data::{AssetSeries, PricePoint};
    use approx::assert_relative_eq;
    use chrono::Duration;

    fn point(day: i64, close: f64) -> PricePoint {
        PricePoint {
            date: start_date() + Duration::days(day),
            close,
        }
    }

    #[test]
    fn test_pct_change_not_log_returns() {
        let a = AssetSeries::from_closes("A", start_date(), &[100.0, 110.0, 99.0]);
        let b = AssetSeries::from_closes("B", start_date(), &[50.0, 50.0, 55.0]);
        let stats = estimate(&[a, b]).unwrap();

        assert_eq!(stats.returns.n_rows(), 2);
        assert_relative_eq!(stats.returns.rows[0][0], 0.10, epsilon = 1e-12);
        assert_relative_eq!(stats.returns.rows[1][0], -0.10, epsilon = 1e-12);
        assert_relative_eq!(stats.returns.rows[1][1], 0.10, epsilon = 1e-12);
        assert_relative_eq!(stats.mean[0], 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_forward_fill_and_leading_gap_drop() {
        // B starts a day late and misses day 2.
        let a = AssetSeries::new("A", vec![point(0, 10.0), point(1, 11.0), point(2, 12.0), point(3, 13.0)]);
        let b = AssetSeries::new("B", vec![point(1, 20.0), point(3, 22.0)]);

        let (dates, prices) = align_prices(&[a, b]);
        assert_eq!(dates.len(), 3);
        assert_eq!(prices, vec![vec![11.0, 20.0], vec![12.0, 20.0], vec![13.0, 22.0]]);
    }

    #[test]
    fn test_single_day_interior_gap_is_filled() {
        let a = AssetSeries::new("A", (0..5).map(|d| point(d, 10.0 + d as f64)).collect());
        let b = AssetSeries::new(
            "B",
            vec![point(0, 20.0), point(1, 21.0), point(3, 23.0), point(4, 24.0)],
        );

        let (dates, prices) = align_prices(&[a, b]);
        assert_eq!(dates.len(), 5);
        assert_eq!(prices[2], vec![12.0, 21.0]);
    }

    #[test]
    fn test_longer_gap_rows_dropped() {
        // B misses days 2-4; only day 2 may be filled.
        let a = AssetSeries::new("A", (0..6).map(|d| point(d, 10.0 + d as f64)).collect());
        let b = AssetSeries::new("B", vec![point(0, 20.0), point(1, 21.0), point(5, 25.0)]);

        let (dates, prices) = align_prices(&[a, b]);
        let days: Vec<i64> = dates
            .iter()
            .map(|d| (*d - start_date().date_naive()).num_days())
            .collect();
        assert_eq!(days, vec![0, 1, 2, 5]);
        assert_eq!(prices[2], vec![12.0, 21.0]);
        assert_eq!(prices[3], vec![15.0, 25.0]);
    }

    #[test]
    fn test_ticker_that_stops_reporting_is_not_extended() {
        let a = mock_series("A", 120, 0.0005, 0.02, 41);
        let mut b = mock_series("B", 120, 0.0005, 0.02, 42);
        b.history.truncate(10);

        let stats = estimate(&[a, b]).unwrap();
        // Ten observed days plus one filled day.
        assert_eq!(stats.returns.n_rows(), 10);
        let flat = stats.returns.column(1).iter().filter(|&&r| r == 0.0).count();
        assert!(flat <= MAX_FILL_GAP);
    }

    #[test]
    fn test_same_day_observations_keep_last() {
        let mut late = point(0, 12.0);
        late.date += Duration::hours(6);
        let a = AssetSeries::new("A", vec![point(0, 10.0), late, point(1, 13.0)]);

        let (_, prices) = align_prices(&[a]);
        assert_eq!(prices, vec![vec![12.0], vec![13.0]]);
    }

    #[test]
    fn test_covariance_matrix_symmetry() {
        let series = vec![
            mock_series("AAA", 120, 0.001, 0.02, 1),
            mock_series("BBB", 120, 0.0005, 0.015, 2),
            mock_series("CCC", 120, 0.0, 0.01, 3),
        ];
        let stats = estimate(&series).unwrap();

        assert_eq!(stats.mean.len(), 3);
        assert_eq!(stats.covariance.len(), 3);
        for i in 0..3 {
            assert!(stats.covariance[i][i] > 0.0, "Variance should be positive");
            for j in 0..3 {
                assert_eq!(stats.covariance[i][j], stats.covariance[j][i]);
            }
        }
    }

    #[test]
    fn test_variance_uses_sample_denominator() {
        let a = AssetSeries::from_closes("A", start_date(), &[100.0, 101.0, 99.0, 102.0]);
        let stats = estimate(&[a]).unwrap();

        let r = stats.returns.column(0);
        let mean = r.iter().sum::<f64>() / 3.0;
        let expected = r.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / 2.0;
        assert_relative_eq!(stats.variance(0), expected, epsilon = 1e-15);
    }

    #[test]
    fn test_insufficient_data_after_alignment() {
        // Overlap is a single day.
        let a = AssetSeries::new("A", vec![point(0, 10.0), point(1, 11.0)]);
        let b = AssetSeries::new("B", vec![point(1, 20.0), point(1, 20.0)]);
        let err = estimate(&[a, b]).unwrap_err();
        assert!(matches!(err, OptimizerError::InsufficientData { rows: 1, .. }));
    }

    #[test]
    fn test_single_observation_series_rejected() {
        let a = mock_series("A", 30, 0.0, 0.01, 7);
        let b = AssetSeries::new("B", vec![point(0, 10.0)]);
        let err = estimate(&[a, b]).unwrap_err();
        assert_eq!(err, OptimizerError::insufficient("B", 1));
    }

    #[test]
    fn test_two_prices_give_too_few_returns() {
        let a = AssetSeries::from_closes("A", start_date(), &[10.0, 11.0]);
        let err = estimate(&[a]).unwrap_err();
        assert_eq!(err, OptimizerError::insufficient("aligned returns", 1));
    }

    #[test]
    fn test_zero_price_row_dropped() {
        let a = AssetSeries::from_closes("A", start_date(), &[10.0, 0.0, 5.0, 6.0, 7.0]);
        let (dates, prices) = align_prices(&[a]);
        let (_, rows) = pct_change(&dates, &prices);
        // 10 -> 0 is -100%, 0 -> 5 is undefined.
        assert_eq!(rows.len(), 3);
        assert_relative_eq!(rows[0][0], -1.0);
        assert_relative_eq!(rows[1][0], 0.2, epsilon = 1e-12);
    }

    #[test]
    fn test_duplicate_tickers_rejected() {
        let a = mock_series("A", 10, 0.0, 0.01, 1);
        let err = estimate(&[a.clone(), a]).unwrap_err();
        assert!(matches!(err, OptimizerError::InvalidInput(_)));
    }

    #[test]
    fn test_from_moments_validates_shape() {
        let ok = ReturnStatistics::from_moments(
            vec!["A".into(), "B".into()],
            vec![0.001, 0.002],
            vec![vec![0.0004, 0.0001], vec![0.0001, 0.0009]],
        );
        assert!(ok.is_ok());

        let bad = ReturnStatistics::from_moments(
            vec!["A".into(), "B".into()],
            vec![0.001],
            vec![vec![0.0004, 0.0001], vec![0.0001, 0.0009]],
        );
        assert!(matches!(bad, Err(OptimizerError::InvalidInput(_))));

        let asym = ReturnStatistics::from_moments(
            vec!["A".into(), "B".into()],
            vec![0.001, 0.002],
            vec![vec![0.0004, 0.0002], vec![0.0001, 0.0009]],
        );
        assert!(matches!(asym, Err(OptimizerError::InvalidInput(_))));
    }
}
