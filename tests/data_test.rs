//! Integration tests for market data access
//!
//! The REST provider runs against wiremock; the resilient layer is tested
//! with two REST providers to exercise fallback and caching.

use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use serde_json::json;
use tokio_test::{assert_err, assert_ok};
use wiremock::{
    matchers::{header, method, path, query_param},
    Mock, MockServer, ResponseTemplate,
};

use finverify::config::{CircuitBreakerConfig, DataConfig, RequestConfig};
use finverify::data::{
    DataRequirement, Dataset, Interval, MarketDataProvider, ResilientDataAccess, RestDataProvider,
};
use finverify::error::DataError;
use finverify::resilience::RetryPolicy;

fn request_config() -> RequestConfig {
    RequestConfig {
        timeout_ms: 5000,
        max_retries: 0,
        retry_delay_ms: 10,
    }
}

fn provider(name: &str, server: &MockServer, api_key: Option<&str>) -> RestDataProvider {
    RestDataProvider::new(name, &server.uri(), api_key.map(str::to_string), &request_config())
        .expect("Failed to create provider")
        .with_min_interval(Duration::ZERO)
}

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

fn bars_body() -> serde_json::Value {
    json!({
        "bars": [
            { "date": "2024-01-02", "open": 187.15, "high": 188.44, "low": 183.89, "close": 185.64, "volume": 82488700.0 },
            { "date": "2024-01-03", "open": 184.22, "high": 185.88, "low": 183.43, "close": 184.25, "volume": 58414500.0 }
        ]
    })
}

#[cfg(test)]
mod rest_tests {
    use super::*;

    #[tokio::test]
    async fn test_fetch_ohlcv() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/v1/ohlcv/AAPL"))
            .and(query_param("start", "2024-01-01"))
            .and(query_param("end", "2024-01-31"))
            .and(query_param("interval", "1d"))
            .and(header("Authorization", "Bearer data-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(bars_body()))
            .expect(1)
            .mount(&mock_server)
            .await;

        let provider = provider("rest", &mock_server, Some("data-key"));
        let bars = provider
            .fetch_ohlcv("AAPL", date(2024, 1, 1), date(2024, 1, 31), Interval::Daily)
            .await
            .unwrap();

        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].date, date(2024, 1, 2));
        assert_eq!(bars[1].close, 184.25);
    }

    #[tokio::test]
    async fn test_not_found_is_no_data() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/v1/fundamentals/ZZZZ"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&mock_server)
            .await;

        let err = assert_err!(provider("rest", &mock_server, None).fetch_fundamentals("ZZZZ").await);
        assert!(matches!(err, DataError::NoData { .. }));
    }

    #[tokio::test]
    async fn test_server_error_is_provider_error() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/v1/series/DGS10"))
            .respond_with(ResponseTemplate::new(500).set_body_string("upstream down"))
            .mount(&mock_server)
            .await;

        let err = provider("rest", &mock_server, None)
            .fetch_series("DGS10", date(2024, 1, 1), date(2024, 3, 1))
            .await
            .unwrap_err();
        match err {
            DataError::Provider { provider, message } => {
                assert_eq!(provider, "rest");
                assert!(message.contains("500"));
                assert!(message.contains("upstream down"));
            }
            other => panic!("Expected Provider error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_inverted_range_never_calls_out() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(bars_body()))
            .expect(0)
            .mount(&mock_server)
            .await;

        let err = assert_err!(
            provider("rest", &mock_server, None)
                .fetch_ohlcv("AAPL", date(2024, 2, 1), date(2024, 1, 1), Interval::Daily)
                .await
        );
        assert!(matches!(err, DataError::InvalidRange { .. }));
    }
}

#[cfg(test)]
mod resilient_tests {
    use super::*;

    fn access(primary: &MockServer, secondary: &MockServer) -> ResilientDataAccess {
        ResilientDataAccess::new(
            &DataConfig::default(),
            CircuitBreakerConfig {
                failure_threshold: 1,
                recovery_timeout_ms: 60_000,
                half_open_max_calls: 1,
            },
            RetryPolicy::none(),
        )
        .with_provider(Arc::new(provider("primary", primary, None)))
        .with_provider(Arc::new(provider("secondary", secondary, None)))
    }

    fn requirement() -> DataRequirement {
        DataRequirement::Ohlcv {
            symbol: "aapl".to_string(),
            start: date(2024, 1, 1),
            end: date(2024, 1, 31),
            interval: Interval::Daily,
        }
    }

    #[tokio::test]
    async fn test_falls_back_and_opens_primary_breaker() {
        let primary = MockServer::start().await;
        let secondary = MockServer::start().await;

        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .expect(1)
            .mount(&primary)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/ohlcv/AAPL"))
            .respond_with(ResponseTemplate::new(200).set_body_json(bars_body()))
            .mount(&secondary)
            .await;

        let access = access(&primary, &secondary);
        let fetched = access.get(&requirement()).await.unwrap();

        assert_eq!(fetched.source, "secondary");
        assert!(!fetched.is_cached);
        assert!(matches!(fetched.data, Dataset::Ohlcv(ref bars) if bars.len() == 2));

        let summaries = access.breaker_summaries();
        assert_eq!(summaries["provider:primary"].state.as_str(), "open");
        assert_eq!(summaries["provider:secondary"].state.as_str(), "closed");
    }

    #[tokio::test]
    async fn test_second_request_served_from_cache() {
        let primary = MockServer::start().await;
        let secondary = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/v1/ohlcv/AAPL"))
            .respond_with(ResponseTemplate::new(200).set_body_json(bars_body()))
            .expect(1)
            .mount(&primary)
            .await;

        let access = access(&primary, &secondary);
        let first = assert_ok!(access.get(&requirement()).await);
        let second = assert_ok!(access.get(&requirement()).await);

        assert!(!first.is_cached);
        assert!(second.is_cached);
        assert_eq!(second.source, "primary");
    }

    #[tokio::test]
    async fn test_all_providers_failing_is_exhausted() {
        let primary = MockServer::start().await;
        let secondary = MockServer::start().await;

        for server in [&primary, &secondary] {
            Mock::given(method("GET"))
                .respond_with(ResponseTemplate::new(500))
                .mount(server)
                .await;
        }

        let err = access(&primary, &secondary)
            .get(&requirement())
            .await
            .unwrap_err();

        match err {
            DataError::Exhausted { key, attempts } => {
                assert!(key.contains("AAPL"));
                assert!(attempts.contains("primary"));
                assert!(attempts.contains("secondary"));
            }
            other => panic!("Expected Exhausted, got {other:?}"),
        }
    }
}
