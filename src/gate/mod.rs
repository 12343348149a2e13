//! Truth-boundary gate.
//!
//! The only path from an [`ExecutionResult`] to a [`VerifiedFact`]:
//! [`TruthGate::validate`] decides whether a run is trustworthy and recovers
//! its values, and [`create_verified_fact`] refuses anything that did not
//! pass. Nothing here reads the user's query or model prose.

mod fact;
mod parser;

pub use fact::{FactStatus, FactValue, VerifiedFact};
pub use parser::ParseMethod;

pub(crate) use fact::FactParts;

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{PipelineError, PipelineResult};
use crate::sandbox::{ExecutionResult, ExecutionStatus};

/// Why a run was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GateFailure {
    /// Program exited with an error
    ExecutionFailed,
    /// Program hit the wall-clock limit
    Timeout,
    /// Successful exit but output not source-verified
    HallucinationRejection,
    /// Nothing parseable in stdout
    NoExtractableValues,
}

impl GateFailure {
    /// Convert to string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            GateFailure::ExecutionFailed => "execution_failed",
            GateFailure::Timeout => "timeout",
            GateFailure::HallucinationRejection => "hallucination_rejection",
            GateFailure::NoExtractableValues => "no_extractable_values",
        }
    }
}

/// Verdict on one execution result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationResult {
    is_valid: bool,
    extracted_values: BTreeMap<String, FactValue>,
    parse_method: Option<ParseMethod>,
    failure: Option<GateFailure>,
    error: Option<String>,
    code_hash: String,
    code: String,
    execution_time_ms: u64,
    memory_used_mb: Option<f64>,
    source_verified: bool,
}

impl ValidationResult {
    fn rejected(execution: &ExecutionResult, failure: GateFailure, error: String) -> Self {
        Self {
            is_valid: false,
            extracted_values: BTreeMap::new(),
            parse_method: None,
            failure: Some(failure),
            error: Some(error),
            code_hash: execution.code_hash().to_string(),
            code: execution.code().to_string(),
            execution_time_ms: execution.duration_ms(),
            memory_used_mb: execution.peak_memory_mb(),
            source_verified: execution.source_verified(),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid
    }

    pub fn extracted_values(&self) -> &BTreeMap<String, FactValue> {
        &self.extracted_values
    }

    pub fn parse_method(&self) -> Option<ParseMethod> {
        self.parse_method
    }

    pub fn failure(&self) -> Option<GateFailure> {
        self.failure
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn code_hash(&self) -> &str {
        &self.code_hash
    }

    pub fn execution_time_ms(&self) -> u64 {
        self.execution_time_ms
    }

    pub fn memory_used_mb(&self) -> Option<f64> {
        self.memory_used_mb
    }

    /// Pipeline error for a rejected result.
    pub fn to_error(&self) -> Option<PipelineError> {
        let message = self.error.clone().unwrap_or_default();
        self.failure.map(|failure| match failure {
            GateFailure::ExecutionFailed | GateFailure::Timeout => {
                PipelineError::Execution { message }
            }
            GateFailure::HallucinationRejection => {
                PipelineError::HallucinationRejection { message }
            }
            GateFailure::NoExtractableValues => PipelineError::Validation { message },
        })
    }
}

/// Stateless validator for execution results.
#[derive(Debug, Clone, Copy, Default)]
pub struct TruthGate;

impl TruthGate {
    /// Create a gate.
    pub fn new() -> Self {
        Self
    }

    /// Validate one run. Pure: the same input always yields the same output.
    pub fn validate(&self, execution: &ExecutionResult) -> ValidationResult {
        match execution.status() {
            ExecutionStatus::Error => {
                let error = execution
                    .error_text()
                    .unwrap_or_else(|| "execution failed".to_string());
                return ValidationResult::rejected(execution, GateFailure::ExecutionFailed, error);
            }
            ExecutionStatus::Timeout => {
                let error = execution
                    .error_text()
                    .unwrap_or_else(|| "execution timed out".to_string());
                return ValidationResult::rejected(execution, GateFailure::Timeout, error);
            }
            ExecutionStatus::Success => {}
        }

        if !execution.source_verified() {
            let reason = if execution.ambiguity_detected() {
                "output contains ambiguity signatures"
            } else {
                "output contains error signatures"
            };
            warn!(code_hash = %execution.code_hash(), reason, "Rejected unverified output");
            return ValidationResult::rejected(
                execution,
                GateFailure::HallucinationRejection,
                format!("Execution output is not source-verified: {reason}"),
            );
        }

        let Some((values, method)) = parser::extract_values(execution.stdout()) else {
            return ValidationResult::rejected(
                execution,
                GateFailure::NoExtractableValues,
                "No numeric values could be extracted from program output".to_string(),
            );
        };

        debug!(
            code_hash = %execution.code_hash(),
            method = method.as_str(),
            value_count = values.len(),
            "Execution output validated"
        );

        ValidationResult {
            is_valid: true,
            extracted_values: values,
            parse_method: Some(method),
            failure: None,
            error: None,
            code_hash: execution.code_hash().to_string(),
            code: execution.code().to_string(),
            execution_time_ms: execution.duration_ms(),
            memory_used_mb: execution.peak_memory_mb(),
            source_verified: true,
        }
    }
}

/// Turn a passing validation into a fact. Rejected validations are an error.
pub fn create_verified_fact(
    validation: &ValidationResult,
    query_id: &str,
    plan_id: &str,
) -> PipelineResult<VerifiedFact> {
    if !validation.is_valid || !validation.source_verified {
        return Err(validation.to_error().unwrap_or(PipelineError::Validation {
            message: "Cannot create a fact from an invalid validation result".to_string(),
        }));
    }

    Ok(VerifiedFact::from_gate(
        query_id,
        plan_id,
        &validation.code_hash,
        validation.extracted_values.clone(),
        validation.execution_time_ms,
        validation.memory_used_mb,
        &validation.code,
    ))
}
