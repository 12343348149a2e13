//! Market and economic data access.
//!
//! Providers implement [`MarketDataProvider`]; [`ResilientDataAccess`]
//! layers caching, per-provider breakers, rate limits, retries and a
//! last-known-good fallback over an ordered list of them.

mod resilient;
mod rest;
mod synthetic;

pub use resilient::ResilientDataAccess;
pub use rest::RestDataProvider;
pub use synthetic::SyntheticDataProvider;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{DataError, DataResult};

// ============================================================================
// Data types
// ============================================================================

/// Bar interval for price history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Interval {
    #[default]
    #[serde(rename = "1d")]
    Daily,
    #[serde(rename = "1wk")]
    Weekly,
    #[serde(rename = "1mo")]
    Monthly,
}

impl Interval {
    /// Convert to string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Interval::Daily => "1d",
            Interval::Weekly => "1wk",
            Interval::Monthly => "1mo",
        }
    }
}

impl std::fmt::Display for Interval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Interval {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "1d" | "daily" => Ok(Interval::Daily),
            "1wk" | "weekly" => Ok(Interval::Weekly),
            "1mo" | "monthly" => Ok(Interval::Monthly),
            _ => Err(format!("Unknown interval: {}", s)),
        }
    }
}

/// One price bar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OhlcvBar {
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// One observation of an economic series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesPoint {
    pub date: NaiveDate,
    pub value: f64,
}

/// Payload returned by a provider.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Dataset {
    Ohlcv(Vec<OhlcvBar>),
    Fundamentals(BTreeMap<String, f64>),
    Series(Vec<SeriesPoint>),
}

impl Dataset {
    /// Number of rows or metrics.
    pub fn len(&self) -> usize {
        match self {
            Dataset::Ohlcv(bars) => bars.len(),
            Dataset::Fundamentals(metrics) => metrics.len(),
            Dataset::Series(points) => points.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A dataset plus where it came from.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Fetched {
    pub data: Dataset,
    /// Provider name
    pub source: String,
    /// Served from a cache rather than a live call
    pub is_cached: bool,
    /// When the data was originally fetched
    pub fetched_at: DateTime<Utc>,
    /// Set when serving stale data
    pub warning: Option<String>,
}

/// What a query needs fetched before its code runs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DataRequirement {
    Ohlcv {
        symbol: String,
        start: NaiveDate,
        end: NaiveDate,
        #[serde(default)]
        interval: Interval,
    },
    Fundamentals {
        symbol: String,
    },
    Series {
        series_id: String,
        start: NaiveDate,
        end: NaiveDate,
    },
}

impl DataRequirement {
    /// Name the dataset is bound to inside the executed program.
    pub fn binding_key(&self) -> String {
        match self {
            DataRequirement::Ohlcv { symbol, .. } => symbol.to_uppercase(),
            DataRequirement::Fundamentals { symbol } => {
                format!("{}_fundamentals", symbol.to_uppercase())
            }
            DataRequirement::Series { series_id, .. } => series_id.to_uppercase(),
        }
    }

    /// Reject requirements no provider could serve.
    pub fn validate(&self) -> DataResult<()> {
        match self {
            DataRequirement::Ohlcv { start, end, .. } | DataRequirement::Series { start, end, .. } => {
                check_range(*start, *end)
            }
            DataRequirement::Fundamentals { .. } => Ok(()),
        }
    }
}

// ============================================================================
// Provider trait
// ============================================================================

/// A single source of market or economic data.
///
/// Providers report "nothing found" as [`DataError::NoData`] and
/// unsupported operations as [`DataError::Unsupported`]; both move the
/// resilient layer on to the next provider without counting as a failure.
#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    /// Provider name used in logs and `Fetched::source`.
    fn name(&self) -> &str;

    /// Minimum spacing between calls, if the provider has a quota.
    fn min_interval(&self) -> Option<Duration> {
        None
    }

    /// Price history for `[start, end]`.
    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
        interval: Interval,
    ) -> DataResult<Vec<OhlcvBar>>;

    /// Latest fundamental metrics.
    async fn fetch_fundamentals(&self, _symbol: &str) -> DataResult<BTreeMap<String, f64>> {
        Err(DataError::Unsupported {
            provider: self.name().to_string(),
            operation: "fundamentals".to_string(),
        })
    }

    /// Economic series observations for `[start, end]`.
    async fn fetch_series(
        &self,
        _series_id: &str,
        _start: NaiveDate,
        _end: NaiveDate,
    ) -> DataResult<Vec<SeriesPoint>> {
        Err(DataError::Unsupported {
            provider: self.name().to_string(),
            operation: "economic series".to_string(),
        })
    }
}

// ============================================================================
// Ticker extraction
// ============================================================================

static TICKER: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"\$?\b([A-Z]{1,5}(?:\.[A-Z])?)\b").ok());

/// Upper-case words that look like tickers but are not.
const NOT_TICKERS: &[&str] = &[
    "A", "AI", "AN", "AND", "API", "AS", "AT", "ATH", "AVG", "BY", "CAC", "CAGR", "CEO", "CFO",
    "CPI", "DAX", "E", "EMA", "EPS", "ETF", "EU", "EUR", "FED", "FOR", "FTSE", "GDP", "HOW", "I", "IN",
    "IPO", "IS", "IT", "JSON", "MACD", "MAX", "MIN", "NAV", "NYSE", "OF", "OK", "ON", "OR", "P",
    "PE", "Q", "QOQ", "ROE", "ROI", "RSI", "S", "SEC", "SMA", "THE", "TO", "UK", "US", "USA",
    "USD", "VAR", "VS", "WHAT", "WHY", "Y", "YOY", "YTD",
];

/// Ticker-like symbols in order of first appearance.
pub fn extract_tickers(text: &str) -> Vec<String> {
    let Some(re) = TICKER.as_ref() else {
        return Vec::new();
    };

    let mut seen = Vec::new();
    for caps in re.captures_iter(text) {
        let Some(m) = caps.get(1) else { continue };
        let symbol = m.as_str();
        if NOT_TICKERS.contains(&symbol) || seen.iter().any(|s: &String| s == symbol) {
            continue;
        }
        seen.push(symbol.to_string());
    }
    seen
}

pub(crate) fn check_range(start: NaiveDate, end: NaiveDate) -> DataResult<()> {
    if start > end {
        return Err(DataError::InvalidRange {
            message: format!("start {start} is after end {end}"),
        });
    }
    Ok(())
}
