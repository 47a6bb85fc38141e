use serde::Serialize;
use thiserror::Error;

/// Fatal failures of an optimization call. Nothing partial is returned alongside any of these.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OptimizerError {
    #[error("price data unavailable for {ticker}: {reason}")]
    DataFetch { ticker: String, reason: String },

    #[error("insufficient data for {scope}: {rows} observation(s), need at least 2")]
    InsufficientData { scope: String, rows: usize },

    #[error("efficient frontier has no solved points ({skipped} grid point(s) skipped)")]
    EmptyFrontier { skipped: usize },

    #[error("no valid portfolio: none of {points} frontier point(s) has positive standard deviation")]
    NoValidPortfolio { points: usize },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("optimization task failed: {0}")]
    TaskFailed(String),
}

impl OptimizerError {
    pub fn data_fetch(ticker: &str, reason: impl ToString) -> Self {
        Self::DataFetch {
            ticker: ticker.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn insufficient(scope: impl Into<String>, rows: usize) -> Self {
        Self::InsufficientData {
            scope: scope.into(),
            rows,
        }
    }
}

pub type Result<T> = std::result::Result<T, OptimizerError>;

/// Why a single frontier grid point was dropped. Recorded, never propagated.
#[derive(Error, Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    #[error("did not converge within {iterations} iterations")]
    IterationLimit { iterations: usize },

    #[error("deadline exceeded after {elapsed_ms} ms")]
    DeadlineExceeded { elapsed_ms: u128 },

    #[error("target return is not attainable under the weight constraints")]
    Infeasible,

    #[error("numerical failure: {0}")]
    NumericalFailure(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages_name_the_cause() {
        let err = OptimizerError::data_fetch("NVDA", "HTTP 404");
        assert_eq!(err.to_string(), "price data unavailable for NVDA: HTTP 404");

        let err = OptimizerError::EmptyFrontier { skipped: 0 };
        assert_eq!(
            err.to_string(),
            "efficient frontier has no solved points (0 grid point(s) skipped)"
        );

        let err = OptimizerError::insufficient("aligned returns", 1);
        assert!(err.to_string().contains("aligned returns: 1 observation(s)"));
    }

    #[test]
    fn test_skip_reason_serializes() {
        let json = serde_json::to_string(&SkipReason::IterationLimit { iterations: 500 }).unwrap();
        assert_eq!(json, r#"{"iteration_limit":{"iterations":500}}"#);

        let json = serde_json::to_string(&SkipReason::NumericalFailure("SVD did not converge".into())).unwrap();
        assert_eq!(json, r#"{"numerical_failure":"SVD did not converge"}"#);

        assert_eq!(serde_json::to_string(&SkipReason::Infeasible).unwrap(), r#""infeasible""#);
    }
}
