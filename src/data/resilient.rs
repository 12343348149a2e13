use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use moka::future::Cache;
use tracing::{debug, info, warn};

use super::{check_range, DataRequirement, Dataset, Fetched, Interval, MarketDataProvider};
use crate::config::{CircuitBreakerConfig, DataConfig};
use crate::error::{DataError, DataResult};
use crate::resilience::{retry_with_backoff, CircuitBreakerSummary, RateLimiter, RetryPolicy, SharedBreaker};

type ProviderCall = dyn Fn(Arc<dyn MarketDataProvider>) -> BoxFuture<'static, DataResult<Dataset>>
    + Send
    + Sync;

struct ProviderSlot {
    provider: Arc<dyn MarketDataProvider>,
    breaker: SharedBreaker,
    limiter: RateLimiter,
}

/// Cache-first, multi-provider data access.
///
/// Lookup order for every request:
/// 1. TTL cache (market data and macro series have separate TTLs)
/// 2. each provider in priority order, skipping any whose breaker is open,
///    behind that provider's rate limiter and the shared retry policy
/// 3. last-known-good value, tagged stale
/// 4. [`DataError::Exhausted`]
pub struct ResilientDataAccess {
    providers: Vec<ProviderSlot>,
    market_cache: Cache<String, Fetched>,
    macro_cache: Cache<String, Fetched>,
    /// Latest live result per key; capacity-bounded, never expires
    last_known_good: Cache<String, Fetched>,
    retry: RetryPolicy,
    default_interval: Duration,
    breaker_config: CircuitBreakerConfig,
}

impl ResilientDataAccess {
    /// Create an access layer with no providers.
    pub fn new(config: &DataConfig, breaker_config: CircuitBreakerConfig, retry: RetryPolicy) -> Self {
        let market_cache = Cache::builder()
            .max_capacity(config.cache_capacity)
            .time_to_live(Duration::from_secs(config.market_cache_ttl_secs))
            .build();
        let macro_cache = Cache::builder()
            .max_capacity(config.cache_capacity)
            .time_to_live(Duration::from_secs(config.macro_cache_ttl_secs))
            .build();
        let last_known_good = Cache::builder()
            .max_capacity(config.cache_capacity)
            .build();

        Self {
            providers: Vec::new(),
            market_cache,
            macro_cache,
            last_known_good,
            retry,
            default_interval: Duration::from_millis(config.min_interval_ms),
            breaker_config,
        }
    }

    /// Append a provider with its own breaker.
    pub fn with_provider(self, provider: Arc<dyn MarketDataProvider>) -> Self {
        let breaker = SharedBreaker::new(
            format!("provider:{}", provider.name()),
            self.breaker_config.clone(),
        );
        self.with_provider_breaker(provider, breaker)
    }

    /// Append a provider guarded by an existing breaker.
    pub fn with_provider_breaker(
        mut self,
        provider: Arc<dyn MarketDataProvider>,
        breaker: SharedBreaker,
    ) -> Self {
        let interval = provider.min_interval().unwrap_or(self.default_interval);
        self.providers.push(ProviderSlot {
            provider,
            breaker,
            limiter: RateLimiter::new(interval),
        });
        self
    }

    /// Provider names in priority order.
    pub fn provider_names(&self) -> Vec<String> {
        self.providers
            .iter()
            .map(|slot| slot.provider.name().to_string())
            .collect()
    }

    /// Breaker summaries keyed by breaker name.
    pub fn breaker_summaries(&self) -> BTreeMap<String, CircuitBreakerSummary> {
        self.providers
            .iter()
            .map(|slot| (slot.breaker.name().to_string(), slot.breaker.summary()))
            .collect()
    }

    /// Price history for a symbol.
    pub async fn get_ohlcv(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
        interval: Interval,
    ) -> DataResult<Fetched> {
        check_range(start, end)?;
        let symbol = symbol.trim().to_uppercase();
        let key = format!("ohlcv:{symbol}:{start}:{end}:{interval}");

        let call = move |provider: Arc<dyn MarketDataProvider>| {
            let symbol = symbol.clone();
            async move {
                provider
                    .fetch_ohlcv(&symbol, start, end, interval)
                    .await
                    .map(Dataset::Ohlcv)
            }
            .boxed()
        };
        self.fetch(&key, &self.market_cache, &call).await
    }

    /// Fundamental metrics for a symbol.
    pub async fn get_fundamentals(&self, symbol: &str) -> DataResult<Fetched> {
        let symbol = symbol.trim().to_uppercase();
        let key = format!("fundamentals:{symbol}");

        let call = move |provider: Arc<dyn MarketDataProvider>| {
            let symbol = symbol.clone();
            async move {
                provider
                    .fetch_fundamentals(&symbol)
                    .await
                    .map(Dataset::Fundamentals)
            }
            .boxed()
        };
        self.fetch(&key, &self.market_cache, &call).await
    }

    /// Economic series observations.
    pub async fn get_economic_series(
        &self,
        series_id: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> DataResult<Fetched> {
        check_range(start, end)?;
        let series_id = series_id.trim().to_uppercase();
        let key = format!("series:{series_id}:{start}:{end}");

        let call = move |provider: Arc<dyn MarketDataProvider>| {
            let series_id = series_id.clone();
            async move {
                provider
                    .fetch_series(&series_id, start, end)
                    .await
                    .map(Dataset::Series)
            }
            .boxed()
        };
        self.fetch(&key, &self.macro_cache, &call).await
    }

    /// Resolve one declared requirement.
    pub async fn get(&self, requirement: &DataRequirement) -> DataResult<Fetched> {
        match requirement {
            DataRequirement::Ohlcv {
                symbol,
                start,
                end,
                interval,
            } => self.get_ohlcv(symbol, *start, *end, *interval).await,
            DataRequirement::Fundamentals { symbol } => self.get_fundamentals(symbol).await,
            DataRequirement::Series {
                series_id,
                start,
                end,
            } => self.get_economic_series(series_id, *start, *end).await,
        }
    }

    async fn fetch(
        &self,
        key: &str,
        cache: &Cache<String, Fetched>,
        call: &ProviderCall,
    ) -> DataResult<Fetched> {
        if let Some(mut hit) = cache.get(key).await {
            debug!(key = %key, source = %hit.source, "Data cache hit");
            hit.is_cached = true;
            return Ok(hit);
        }

        let mut attempts = Vec::new();

        for slot in &self.providers {
            let name = slot.provider.name().to_string();

            let Some(permit) = slot.breaker.try_acquire() else {
                debug!(provider = %name, state = %slot.breaker.state(), "Skipping provider, circuit not closed");
                attempts.push(format!("{name}: circuit {}", slot.breaker.state()));
                continue;
            };

            let limiter = &slot.limiter;
            let provider = slot.provider.clone();
            let outcome = retry_with_backoff(self.retry, &name, move || {
                let provider = provider.clone();
                async move {
                    limiter.acquire().await;
                    call(provider).await
                }
            })
            .await;

            match outcome {
                Ok(data) if data.is_empty() => {
                    permit.success();
                    attempts.push(format!("{name}: empty result"));
                }
                Ok(data) => {
                    permit.success();
                    let fetched = Fetched {
                        data,
                        source: name.clone(),
                        is_cached: false,
                        fetched_at: Utc::now(),
                        warning: None,
                    };
                    cache.insert(key.to_string(), fetched.clone()).await;
                    self.last_known_good
                        .insert(key.to_string(), fetched.clone())
                        .await;
                    info!(key = %key, provider = %name, rows = fetched.data.len(), "Data fetched");
                    return Ok(fetched);
                }
                Err(exhausted) => match exhausted.last_error {
                    DataError::InvalidRange { .. } => {
                        permit.release();
                        return Err(exhausted.last_error);
                    }
                    DataError::NoData { .. } => {
                        permit.success();
                        attempts.push(format!("{name}: {}", exhausted.last_error));
                    }
                    DataError::Unsupported { .. } => {
                        permit.release();
                        attempts.push(format!("{name}: {}", exhausted.last_error));
                    }
                    other => {
                        permit.failure();
                        warn!(
                            provider = %name,
                            key = %key,
                            attempts = exhausted.attempts,
                            error = %other,
                            "Provider failed, trying next"
                        );
                        attempts.push(format!("{name}: {other}"));
                    }
                },
            }
        }

        if let Some(mut stale) = self.last_known_good.get(key).await {
            let warning = format!(
                "All providers failed; serving last known good data from {} fetched at {}",
                stale.source,
                stale.fetched_at.to_rfc3339()
            );
            warn!(key = %key, source = %stale.source, "Serving stale data");
            stale.is_cached = true;
            stale.warning = Some(warning);
            return Ok(stale);
        }

        if attempts.is_empty() {
            attempts.push("no providers configured".to_string());
        }
        Err(DataError::Exhausted {
            key: key.to_string(),
            attempts: attempts.join("; "),
        })
    }

    #[cfg(test)]
    pub(crate) async fn clear_caches(&self) {
        self.market_cache.invalidate_all();
        self.macro_cache.invalidate_all();
        self.market_cache.run_pending_tasks().await;
        self.macro_cache.run_pending_tasks().await;
    }
}
