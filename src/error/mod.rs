use thiserror::Error;

/// Application-level errors
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Data error: {0}")]
    Data(#[from] DataError),

    #[error("Sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Storage layer errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database connection failed: {message}")]
    Connection { message: String },

    #[error("Query failed: {message}")]
    Query { message: String },

    #[error("Fact not found: {fact_id}")]
    FactNotFound { fact_id: String },

    #[error("Migration failed: {message}")]
    Migration { message: String },

    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

/// Code/analysis generation errors
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("LLM unavailable: {message} (retries: {retries})")]
    Unavailable { message: String, retries: u32 },

    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    #[error("Invalid response: {message}")]
    InvalidResponse { message: String },

    #[error("Request timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Market and economic data errors
#[derive(Debug, Error)]
pub enum DataError {
    #[error("No data for {key}")]
    NoData { key: String },

    #[error("Provider {provider} does not support {operation}")]
    Unsupported { provider: String, operation: String },

    #[error("Provider {provider} failed: {message}")]
    Provider { provider: String, message: String },

    #[error("All data sources exhausted for {key}: {attempts}")]
    Exhausted { key: String, attempts: String },

    #[error("Invalid date range: {message}")]
    InvalidRange { message: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Sandboxed execution infrastructure errors.
///
/// These describe failures to run the sandbox at all. A program that runs
/// and fails is reported through `ExecutionResult`, not through this type.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Failed to spawn sandbox runtime '{runtime}': {message}")]
    Spawn { runtime: String, message: String },

    #[error("Sandbox I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Why the safety gatekeeper refused a query
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefusalReason {
    Jailbreak,
    Illegal,
    ImpossiblePrediction,
    Manipulation,
    InvalidInput,
}

impl RefusalReason {
    /// Convert to string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            RefusalReason::Jailbreak => "jailbreak",
            RefusalReason::Illegal => "illegal",
            RefusalReason::ImpossiblePrediction => "impossible_prediction",
            RefusalReason::Manipulation => "manipulation",
            RefusalReason::InvalidInput => "invalid_input",
        }
    }
}

impl std::fmt::Display for RefusalReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Pipeline node failures.
///
/// Node-local errors are converted into state transitions by the
/// orchestrator; this type never escapes the driver loop as a panic.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Plan failed: {message}")]
    Plan { message: String },

    #[error("Fetch failed: {message}")]
    Fetch { message: String },

    #[error("Execution failed: {message}")]
    Execution { message: String },

    #[error("Validation failed: {message}")]
    Validation { message: String },

    #[error("Hallucination rejected: {message}")]
    HallucinationRejection { message: String },

    #[error("Query refused ({reason}): {message}")]
    Refusal {
        reason: RefusalReason,
        message: String,
    },

    #[error("Circuit breaker '{breaker}' is {state}")]
    CircuitOpen { breaker: String, state: String },

    #[error("Query timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },
}

impl PipelineError {
    /// Whether the driver loop may retry the query from PLAN.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            PipelineError::Refusal { .. } | PipelineError::Timeout { .. }
        )
    }

    /// Short machine-readable kind.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Plan { .. } => "plan_error",
            PipelineError::Fetch { .. } => "fetch_error",
            PipelineError::Execution { .. } => "execution_error",
            PipelineError::Validation { .. } => "validation_error",
            PipelineError::HallucinationRejection { .. } => "hallucination_rejection",
            PipelineError::Refusal { .. } => "refusal",
            PipelineError::CircuitOpen { .. } => "circuit_open",
            PipelineError::Timeout { .. } => "timeout",
        }
    }
}

/// Errors that the shared retry utility may retry.
pub trait Retryable {
    /// Whether another attempt could succeed.
    fn is_retryable(&self) -> bool {
        true
    }
}

impl Retryable for LlmError {
    fn is_retryable(&self) -> bool {
        match self {
            // Client errors will not change on retry, except rate limiting
            LlmError::Api { status, .. } => *status == 429 || *status >= 500,
            LlmError::InvalidResponse { .. } => false,
            _ => true,
        }
    }
}

impl Retryable for DataError {
    fn is_retryable(&self) -> bool {
        matches!(self, DataError::Provider { .. } | DataError::Http(_))
    }
}

impl From<LlmError> for PipelineError {
    fn from(err: LlmError) -> Self {
        PipelineError::Plan {
            message: err.to_string(),
        }
    }
}

impl From<DataError> for PipelineError {
    fn from(err: DataError) -> Self {
        PipelineError::Fetch {
            message: err.to_string(),
        }
    }
}

impl From<SandboxError> for PipelineError {
    fn from(err: SandboxError) -> Self {
        PipelineError::Execution {
            message: err.to_string(),
        }
    }
}

/// Result type alias for application errors
pub type AppResult<T> = Result<T, AppError>;

/// Result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Result type alias for LLM operations
pub type LlmResult<T> = Result<T, LlmError>;

/// Result type alias for data access
pub type DataResult<T> = Result<T, DataError>;

/// Result type alias for sandbox operations
pub type SandboxResult<T> = Result<T, SandboxError>;

/// Result type alias for pipeline nodes
pub type PipelineResult<T> = Result<T, PipelineError>;
