use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::AppError;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub llm: LlmConfig,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    pub request: RequestConfig,
    pub sandbox: SandboxConfig,
    pub breakers: BreakersConfig,
    pub data: DataConfig,
    pub pipeline: PipelineConfig,
}

/// Code/analysis generation API configuration (OpenAI-compatible)
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_key: String,
    pub base_url: String,
    pub code_model: String,
    pub analysis_model: String,
}

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    pub max_connections: u32,
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

/// Log output format
#[derive(Debug, Clone, PartialEq)]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Retry policy for external calls
#[derive(Debug, Clone)]
pub struct RequestConfig {
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
}

/// Which isolation runtime executes generated code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxRuntime {
    Docker,
    Process,
}

/// Sandbox resource limits
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub runtime: SandboxRuntime,
    pub image: String,
    pub python: String,
    pub timeout_secs: u64,
    pub memory_mb: u64,
    pub cpus: f64,
    pub allow_network: bool,
    pub max_output_bytes: usize,
}

/// Circuit breaker parameters for one dependency
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout_ms: u64,
    pub half_open_max_calls: u32,
}

/// One breaker per external dependency
#[derive(Debug, Clone)]
pub struct BreakersConfig {
    pub market_data: CircuitBreakerConfig,
    pub llm: CircuitBreakerConfig,
}

/// Data provider and cache configuration
#[derive(Debug, Clone)]
pub struct DataConfig {
    /// Optional REST provider; synthetic data is used when unset
    pub api_base_url: Option<String>,
    pub api_key: Option<String>,
    pub min_interval_ms: u64,
    pub market_cache_ttl_secs: u64,
    pub macro_cache_ttl_secs: u64,
    pub cache_capacity: u64,
}

/// Orchestrator limits
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub max_retries: u32,
    pub query_timeout_secs: u64,
    /// Queries in flight at once for batch and split runs
    pub max_concurrency: usize,
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.to_lowercase().as_str(), "true" | "1" | "yes"))
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, AppError> {
        Self::load(false)
    }

    /// Load configuration for offline runs, where no API key is needed
    pub fn from_env_offline() -> Result<Self, AppError> {
        Self::load(true)
    }

    fn load(offline: bool) -> Result<Self, AppError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let api_key = match env::var("LLM_API_KEY") {
            Ok(key) => key,
            Err(_) if offline => String::new(),
            Err(_) => {
                return Err(AppError::Config {
                    message: "LLM_API_KEY is required".to_string(),
                })
            }
        };

        let llm = LlmConfig {
            api_key,
            base_url: env::var("LLM_BASE_URL")
                .unwrap_or_else(|_| "https://api.openai.com".to_string()),
            code_model: env::var("LLM_CODE_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string()),
            analysis_model: env::var("LLM_ANALYSIS_MODEL")
                .unwrap_or_else(|_| "gpt-4o-mini".to_string()),
        };

        let database = DatabaseConfig {
            path: PathBuf::from(
                env::var("DATABASE_PATH").unwrap_or_else(|_| "./data/finverify.db".to_string()),
            ),
            max_connections: env_or("DATABASE_MAX_CONNECTIONS", 5),
        };

        let logging = LoggingConfig {
            level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            format: match env::var("LOG_FORMAT")
                .unwrap_or_else(|_| "pretty".to_string())
                .to_lowercase()
                .as_str()
            {
                "json" => LogFormat::Json,
                _ => LogFormat::Pretty,
            },
        };

        let request = RequestConfig {
            timeout_ms: env_or("REQUEST_TIMEOUT_MS", 30000),
            max_retries: env_or("MAX_RETRIES", 3),
            retry_delay_ms: env_or("RETRY_DELAY_MS", 1000),
        };

        let defaults = SandboxConfig::default();
        let sandbox = SandboxConfig {
            runtime: match env::var("SANDBOX_RUNTIME")
                .unwrap_or_else(|_| "docker".to_string())
                .to_lowercase()
                .as_str()
            {
                "process" | "local" => SandboxRuntime::Process,
                _ => SandboxRuntime::Docker,
            },
            image: env::var("SANDBOX_IMAGE").unwrap_or(defaults.image),
            python: env::var("SANDBOX_PYTHON").unwrap_or(defaults.python),
            timeout_secs: env_or("SANDBOX_TIMEOUT_SECS", defaults.timeout_secs),
            memory_mb: env_or("SANDBOX_MEMORY_MB", defaults.memory_mb),
            cpus: env_or("SANDBOX_CPUS", defaults.cpus),
            allow_network: env_flag("SANDBOX_ALLOW_NETWORK", false),
            max_output_bytes: env_or("SANDBOX_MAX_OUTPUT_BYTES", defaults.max_output_bytes),
        };

        let breaker_defaults = BreakersConfig::default();
        let breakers = BreakersConfig {
            market_data: CircuitBreakerConfig::from_env_prefix(
                "MARKET_BREAKER",
                breaker_defaults.market_data,
            ),
            llm: CircuitBreakerConfig::from_env_prefix("LLM_BREAKER", breaker_defaults.llm),
        };

        let data_defaults = DataConfig::default();
        let data = DataConfig {
            api_base_url: env::var("DATA_API_BASE_URL").ok().filter(|s| !s.is_empty()),
            api_key: env::var("DATA_API_KEY").ok().filter(|s| !s.is_empty()),
            min_interval_ms: env_or("DATA_MIN_INTERVAL_MS", data_defaults.min_interval_ms),
            market_cache_ttl_secs: env_or(
                "MARKET_CACHE_TTL_SECS",
                data_defaults.market_cache_ttl_secs,
            ),
            macro_cache_ttl_secs: env_or("MACRO_CACHE_TTL_SECS", data_defaults.macro_cache_ttl_secs),
            cache_capacity: env_or("DATA_CACHE_CAPACITY", data_defaults.cache_capacity),
        };

        let pipeline = PipelineConfig {
            max_retries: env_or("PIPELINE_MAX_RETRIES", 2),
            query_timeout_secs: env_or("QUERY_TIMEOUT_SECS", 120),
            max_concurrency: env_or::<usize>("PIPELINE_MAX_CONCURRENCY", 4).max(1),
        };

        Ok(Config {
            llm,
            database,
            logging,
            request,
            sandbox,
            breakers,
            data,
            pipeline,
        })
    }
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30000,
            max_retries: 3,
            retry_delay_ms: 1000,
        }
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            runtime: SandboxRuntime::Docker,
            image: "python:3.12-slim".to_string(),
            python: "python3".to_string(),
            timeout_secs: 30,
            memory_mb: 512,
            cpus: 1.0,
            allow_network: false,
            max_output_bytes: 1024 * 1024,
        }
    }
}

impl SandboxConfig {
    /// Wall-clock limit as a `Duration`.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_ms: 60_000,
            half_open_max_calls: 1,
        }
    }
}

impl CircuitBreakerConfig {
    /// Read `<PREFIX>_FAILURE_THRESHOLD`, `<PREFIX>_RECOVERY_TIMEOUT_MS`
    /// and `<PREFIX>_HALF_OPEN_MAX_CALLS`, falling back to `defaults`.
    pub fn from_env_prefix(prefix: &str, defaults: Self) -> Self {
        Self {
            failure_threshold: env_or(
                &format!("{}_FAILURE_THRESHOLD", prefix),
                defaults.failure_threshold,
            ),
            recovery_timeout_ms: env_or(
                &format!("{}_RECOVERY_TIMEOUT_MS", prefix),
                defaults.recovery_timeout_ms,
            ),
            half_open_max_calls: env_or(
                &format!("{}_HALF_OPEN_MAX_CALLS", prefix),
                defaults.half_open_max_calls,
            ),
        }
    }

    /// Recovery timeout as a `Duration`.
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }
}

impl Default for BreakersConfig {
    fn default() -> Self {
        Self {
            market_data: CircuitBreakerConfig::default(),
            llm: CircuitBreakerConfig {
                failure_threshold: 3,
                recovery_timeout_ms: 30_000,
                half_open_max_calls: 1,
            },
        }
    }
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            api_base_url: None,
            api_key: None,
            min_interval_ms: 250,
            market_cache_ttl_secs: 300,
            macro_cache_ttl_secs: 86_400,
            cache_capacity: 10_000,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            query_timeout_secs: 120,
            max_concurrency: 4,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sandbox_defaults_are_locked_down() {
        let config = SandboxConfig::default();
        assert!(!config.allow_network);
        assert_eq!(config.runtime, SandboxRuntime::Docker);
        assert_eq!(config.timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_breaker_defaults() {
        let breakers = BreakersConfig::default();
        assert_eq!(breakers.market_data.failure_threshold, 5);
        assert_eq!(breakers.llm.failure_threshold, 3);
        assert_eq!(
            breakers.llm.recovery_timeout(),
            Duration::from_millis(30_000)
        );
    }

    #[test]
    fn test_pipeline_defaults() {
        let pipeline = PipelineConfig::default();
        assert_eq!(pipeline.max_retries, 2);
        assert_eq!(pipeline.max_concurrency, 4);
    }

    #[test]
    fn test_cache_ttls() {
        let data = DataConfig::default();
        assert_eq!(data.market_cache_ttl_secs, 300);
        assert_eq!(data.macro_cache_ttl_secs, 86_400);
    }
}
