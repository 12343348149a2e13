use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, info};

use super::{check_range, Interval, MarketDataProvider, OhlcvBar, SeriesPoint};
use crate::config::RequestConfig;
use crate::error::{DataError, DataResult};

#[derive(Debug, Deserialize)]
struct BarsResponse {
    #[serde(default)]
    bars: Vec<OhlcvBar>,
}

#[derive(Debug, Deserialize)]
struct FundamentalsResponse {
    #[serde(default)]
    metrics: BTreeMap<String, f64>,
}

#[derive(Debug, Deserialize)]
struct ObservationsResponse {
    #[serde(default)]
    observations: Vec<SeriesPoint>,
}

/// JSON-over-HTTP market data provider.
///
/// Endpoints, relative to the base URL:
/// - `GET /v1/ohlcv/{symbol}?start=&end=&interval=` → `{"bars": [...]}`
/// - `GET /v1/fundamentals/{symbol}` → `{"metrics": {...}}`
/// - `GET /v1/series/{id}?start=&end=` → `{"observations": [...]}`
#[derive(Clone)]
pub struct RestDataProvider {
    client: Client,
    name: String,
    base_url: String,
    api_key: Option<String>,
    min_interval: Option<Duration>,
}

impl RestDataProvider {
    /// Create a provider for `base_url`.
    pub fn new(
        name: impl Into<String>,
        base_url: &str,
        api_key: Option<String>,
        request_config: &RequestConfig,
    ) -> DataResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(request_config.timeout_ms))
            .build()
            .map_err(DataError::Http)?;

        Ok(Self {
            client,
            name: name.into(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            min_interval: None,
        })
    }

    /// Override the per-provider rate limit.
    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = Some(interval);
        self
    }

    /// Get the base URL (for testing)
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
        key: &str,
    ) -> DataResult<T> {
        let url = format!("{}{}", self.base_url, path);
        debug!(provider = %self.name, url = %url, "Requesting market data");

        let start = Instant::now();
        let mut request = self.client.get(&url).query(query);
        if let Some(api_key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {}", api_key));
        }

        let response = request.send().await?;
        let status = response.status();

        if status == StatusCode::NOT_FOUND {
            return Err(DataError::NoData {
                key: key.to_string(),
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DataError::Provider {
                provider: self.name.clone(),
                message: format!("HTTP {}: {}", status.as_u16(), body),
            });
        }

        let parsed = response.json::<T>().await.map_err(|e| DataError::Provider {
            provider: self.name.clone(),
            message: format!("Failed to parse response: {}", e),
        })?;

        info!(
            provider = %self.name,
            latency_ms = start.elapsed().as_millis() as u64,
            "Market data request succeeded"
        );
        Ok(parsed)
    }
}

#[async_trait]
impl MarketDataProvider for RestDataProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn min_interval(&self) -> Option<Duration> {
        self.min_interval
    }

    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
        interval: Interval,
    ) -> DataResult<Vec<OhlcvBar>> {
        check_range(start, end)?;
        let response: BarsResponse = self
            .get_json(
                &format!("/v1/ohlcv/{symbol}"),
                &[
                    ("start", start.to_string()),
                    ("end", end.to_string()),
                    ("interval", interval.as_str().to_string()),
                ],
                symbol,
            )
            .await?;

        if response.bars.is_empty() {
            return Err(DataError::NoData {
                key: symbol.to_string(),
            });
        }
        Ok(response.bars)
    }

    async fn fetch_fundamentals(&self, symbol: &str) -> DataResult<BTreeMap<String, f64>> {
        let response: FundamentalsResponse = self
            .get_json(&format!("/v1/fundamentals/{symbol}"), &[], symbol)
            .await?;

        if response.metrics.is_empty() {
            return Err(DataError::NoData {
                key: symbol.to_string(),
            });
        }
        Ok(response.metrics)
    }

    async fn fetch_series(
        &self,
        series_id: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> DataResult<Vec<SeriesPoint>> {
        check_range(start, end)?;
        let response: ObservationsResponse = self
            .get_json(
                &format!("/v1/series/{series_id}"),
                &[("start", start.to_string()), ("end", end.to_string())],
                series_id,
            )
            .await?;

        if response.observations.is_empty() {
            return Err(DataError::NoData {
                key: series_id.to_string(),
            });
        }
        Ok(response.observations)
    }
}
