use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate, Weekday};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use sha2::{Digest, Sha256};

use super::{check_range, Interval, MarketDataProvider, OhlcvBar, SeriesPoint};
use crate::error::{DataError, DataResult};

/// Deterministic offline data source.
///
/// Prices are a seeded random walk over business days; the same symbol and
/// range always produce the same bars. Used for `--offline` runs and tests.
#[derive(Debug, Clone, Default)]
pub struct SyntheticDataProvider;

impl SyntheticDataProvider {
    pub fn new() -> Self {
        Self
    }
}

/// Generator seeded from a SHA-256 of the key.
fn seeded_rng(key: &str) -> ChaCha8Rng {
    let digest = Sha256::digest(key.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    ChaCha8Rng::seed_from_u64(u64::from_le_bytes(bytes))
}

fn valid_symbol(symbol: &str) -> bool {
    !symbol.is_empty()
        && symbol.len() <= 12
        && symbol
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '^' | '='))
}

fn business_days(start: NaiveDate, end: NaiveDate) -> impl Iterator<Item = NaiveDate> {
    start
        .iter_days()
        .take_while(move |d| *d <= end)
        .filter(|d| !matches!(d.weekday(), Weekday::Sat | Weekday::Sun))
}

fn daily_bars(symbol: &str, start: NaiveDate, end: NaiveDate) -> Vec<OhlcvBar> {
    let mut rng = seeded_rng(&format!("ohlcv:{symbol}:{start}"));
    let mut price = rng.gen_range(40.0..400.0);
    let drift = rng.gen_range(-0.0002..0.0008);
    let volatility = rng.gen_range(0.01..0.03);
    let base_volume: f64 = rng.gen_range(1.0e6..5.0e7);

    business_days(start, end)
        .map(|date| {
            // uniform shock scaled to unit variance
            let shock = (rng.gen::<f64>() * 2.0 - 1.0) * 3f64.sqrt();
            let open = price;
            let close = (open * (1.0 + drift + volatility * shock)).max(0.01);
            let wick = open.max(close) * volatility * rng.gen::<f64>() * 0.5;
            let high = open.max(close) + wick;
            let low = (open.min(close) - wick).max(0.005);
            let volume = (base_volume * rng.gen_range(0.5..1.5)).round();
            price = close;
            OhlcvBar {
                date,
                open: round4(open),
                high: round4(high),
                low: round4(low),
                close: round4(close),
                volume,
            }
        })
        .collect()
}

fn aggregate(bars: Vec<OhlcvBar>, interval: Interval) -> Vec<OhlcvBar> {
    let bucket = |d: &NaiveDate| -> (i32, u32) {
        match interval {
            Interval::Daily => (d.year(), d.ordinal()),
            Interval::Weekly => (d.iso_week().year(), d.iso_week().week()),
            Interval::Monthly => (d.year(), d.month()),
        }
    };

    let mut out: Vec<OhlcvBar> = Vec::new();
    let mut current: Option<(i32, u32)> = None;

    for bar in bars {
        let key = bucket(&bar.date);
        match out.last_mut() {
            Some(last) if current == Some(key) => {
                last.high = last.high.max(bar.high);
                last.low = last.low.min(bar.low);
                last.close = bar.close;
                last.volume += bar.volume;
            }
            _ => {
                current = Some(key);
                out.push(bar);
            }
        }
    }
    out
}

fn round4(x: f64) -> f64 {
    (x * 10_000.0).round() / 10_000.0
}

/// Rough anchor levels for common macro series.
fn series_anchor(series_id: &str) -> Option<(f64, f64)> {
    match series_id {
        "CPIAUCSL" => Some((300.0, 0.002)),
        "UNRATE" => Some((3.9, 0.05)),
        "DGS10" => Some((4.2, 0.08)),
        "FEDFUNDS" => Some((5.3, 0.02)),
        "GDP" => Some((27_000.0, 0.005)),
        "T10Y2Y" => Some((-0.3, 0.1)),
        _ => None,
    }
}

#[async_trait]
impl MarketDataProvider for SyntheticDataProvider {
    fn name(&self) -> &str {
        "synthetic"
    }

    fn min_interval(&self) -> Option<std::time::Duration> {
        Some(std::time::Duration::ZERO)
    }

    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
        interval: Interval,
    ) -> DataResult<Vec<OhlcvBar>> {
        check_range(start, end)?;
        if !valid_symbol(symbol) {
            return Err(DataError::NoData {
                key: symbol.to_string(),
            });
        }

        let bars = aggregate(daily_bars(symbol, start, end), interval);
        if bars.is_empty() {
            return Err(DataError::NoData {
                key: format!("{symbol} {start}..{end}"),
            });
        }
        Ok(bars)
    }

    async fn fetch_fundamentals(&self, symbol: &str) -> DataResult<BTreeMap<String, f64>> {
        if !valid_symbol(symbol) {
            return Err(DataError::NoData {
                key: symbol.to_string(),
            });
        }

        let mut rng = seeded_rng(&format!("fundamentals:{symbol}"));
        let eps = rng.gen_range(0.5..12.0);
        let pe = rng.gen_range(8.0..45.0);
        let shares = rng.gen_range(2.0e8..1.5e10);
        let price = eps * pe;

        let mut metrics = BTreeMap::new();
        metrics.insert("eps".to_string(), round4(eps));
        metrics.insert("pe_ratio".to_string(), round4(pe));
        metrics.insert("price".to_string(), round4(price));
        metrics.insert("market_cap".to_string(), (price * shares).round());
        metrics.insert("beta".to_string(), round4(rng.gen_range(0.5..1.8)));
        metrics.insert("dividend_yield".to_string(), round4(rng.gen_range(0.0..0.04)));
        metrics.insert("revenue_growth".to_string(), round4(rng.gen_range(-0.1..0.35)));
        metrics.insert("debt_to_equity".to_string(), round4(rng.gen_range(0.1..2.5)));
        Ok(metrics)
    }

    async fn fetch_series(
        &self,
        series_id: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> DataResult<Vec<SeriesPoint>> {
        check_range(start, end)?;
        let mut rng = seeded_rng(&format!("series:{series_id}"));
        let (mut level, step) = series_anchor(series_id)
            .unwrap_or_else(|| (rng.gen_range(1.0..100.0), rng.gen_range(0.005..0.05)));

        let mut points = Vec::new();
        let mut date = NaiveDate::from_ymd_opt(start.year(), start.month(), 1);
        while let Some(d) = date {
            if d > end {
                break;
            }
            if d >= start {
                points.push(SeriesPoint {
                    date: d,
                    value: round4(level),
                });
            }
            level *= 1.0 + step * (rng.gen::<f64>() * 2.0 - 1.0);
            date = d.checked_add_months(chrono::Months::new(1));
        }

        if points.is_empty() {
            return Err(DataError::NoData {
                key: format!("{series_id} {start}..{end}"),
            });
        }
        Ok(points)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[tokio::test]
    async fn test_ohlcv_is_deterministic() {
        let provider = SyntheticDataProvider::new();
        let a = provider
            .fetch_ohlcv("AAPL", date(2024, 1, 1), date(2024, 3, 31), Interval::Daily)
            .await
            .unwrap();
        let b = provider
            .fetch_ohlcv("AAPL", date(2024, 1, 1), date(2024, 3, 31), Interval::Daily)
            .await
            .unwrap();
        assert_eq!(a, b);

        let other = provider
            .fetch_ohlcv("MSFT", date(2024, 1, 1), date(2024, 3, 31), Interval::Daily)
            .await
            .unwrap();
        assert_ne!(a[0].open, other[0].open);
    }

    #[test]
    fn test_seeded_rng_depends_only_on_key() {
        let draw = |key: &str| -> Vec<u32> {
            let mut rng = seeded_rng(key);
            (0..4).map(|_| rng.gen_range(0..1_000_000)).collect()
        };
        assert_eq!(draw("ohlcv:AAPL:2024-01-01"), draw("ohlcv:AAPL:2024-01-01"));
        assert_ne!(draw("ohlcv:AAPL:2024-01-01"), draw("ohlcv:AAPL:2024-01-02"));
    }

    #[tokio::test]
    async fn test_ohlcv_skips_weekends_and_is_consistent() {
        let bars = SyntheticDataProvider::new()
            .fetch_ohlcv("SPY", date(2024, 1, 1), date(2024, 1, 31), Interval::Daily)
            .await
            .unwrap();
        assert_eq!(bars.len(), 23);
        for bar in &bars {
            assert!(!matches!(bar.date.weekday(), Weekday::Sat | Weekday::Sun));
            assert!(bar.high >= bar.open.max(bar.close));
            assert!(bar.low <= bar.open.min(bar.close));
            assert!(bar.low > 0.0);
        }
    }

    #[tokio::test]
    async fn test_monthly_aggregation() {
        let bars = SyntheticDataProvider::new()
            .fetch_ohlcv("QQQ", date(2024, 1, 1), date(2024, 6, 30), Interval::Monthly)
            .await
            .unwrap();
        assert_eq!(bars.len(), 6);
        assert_eq!(bars[0].date, date(2024, 1, 1));
    }

    #[tokio::test]
    async fn test_weekend_only_range_has_no_data() {
        let err = SyntheticDataProvider::new()
            .fetch_ohlcv("AAPL", date(2024, 1, 6), date(2024, 1, 7), Interval::Daily)
            .await
            .unwrap_err();
        assert!(matches!(err, DataError::NoData { .. }));
    }

    #[tokio::test]
    async fn test_invalid_symbol_has_no_data() {
        let err = SyntheticDataProvider::new()
            .fetch_fundamentals("not a ticker")
            .await
            .unwrap_err();
        assert!(matches!(err, DataError::NoData { .. }));
    }

    #[tokio::test]
    async fn test_series_is_monthly() {
        let points = SyntheticDataProvider::new()
            .fetch_series("UNRATE", date(2023, 1, 15), date(2023, 12, 31))
            .await
            .unwrap();
        assert_eq!(points.len(), 11);
        assert_eq!(points[0].date, date(2023, 2, 1));
        assert!((points[0].value - 3.9).abs() < 1.0);
    }

    #[tokio::test]
    async fn test_fundamentals_price_matches_ratios() {
        let metrics = SyntheticDataProvider::new()
            .fetch_fundamentals("NVDA")
            .await
            .unwrap();
        let implied = metrics["eps"] * metrics["pe_ratio"];
        assert!((implied - metrics["price"]).abs() / metrics["price"] < 0.01);
    }
}
