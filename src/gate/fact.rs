use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An extracted value: numeric or textual.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FactValue {
    Number(f64),
    Text(String),
}

impl FactValue {
    /// Numeric value, if any.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FactValue::Number(n) => Some(*n),
            FactValue::Text(_) => None,
        }
    }
}

impl std::fmt::Display for FactValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FactValue::Number(n) => write!(f, "{n}"),
            FactValue::Text(s) => write!(f, "{s}"),
        }
    }
}

/// Lifecycle status of a fact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactStatus {
    /// Produced by the gate
    Verified,
    /// Confidence adjusted by a debate
    Debated,
}

impl FactStatus {
    /// Convert to string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            FactStatus::Verified => "verified",
            FactStatus::Debated => "debated",
        }
    }
}

impl std::fmt::Display for FactStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for FactStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "verified" => Ok(FactStatus::Verified),
            "debated" => Ok(FactStatus::Debated),
            _ => Err(format!("Unknown fact status: {}", s)),
        }
    }
}

/// A result proven to come out of a clean sandboxed run.
///
/// Only the gate and the store can build one. Adjusting confidence yields a
/// new fact whose `derived_from` points back at this one.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VerifiedFact {
    fact_id: String,
    query_id: String,
    plan_id: String,
    code_hash: String,
    status: FactStatus,
    extracted_values: BTreeMap<String, FactValue>,
    execution_time_ms: u64,
    memory_used_mb: Option<f64>,
    created_at: DateTime<Utc>,
    error_message: Option<String>,
    confidence: Option<f64>,
    source_code: Option<String>,
    derived_from: Option<String>,
}

/// Row-level parts used to rebuild a stored fact.
#[derive(Debug, Clone)]
pub(crate) struct FactParts {
    pub fact_id: String,
    pub query_id: String,
    pub plan_id: String,
    pub code_hash: String,
    pub status: FactStatus,
    pub extracted_values: BTreeMap<String, FactValue>,
    pub execution_time_ms: u64,
    pub memory_used_mb: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub error_message: Option<String>,
    pub confidence: Option<f64>,
    pub source_code: Option<String>,
    pub derived_from: Option<String>,
}

impl VerifiedFact {
    pub(crate) fn from_gate(
        query_id: &str,
        plan_id: &str,
        code_hash: &str,
        extracted_values: BTreeMap<String, FactValue>,
        execution_time_ms: u64,
        memory_used_mb: Option<f64>,
        source_code: &str,
    ) -> Self {
        Self {
            fact_id: Uuid::new_v4().to_string(),
            query_id: query_id.to_string(),
            plan_id: plan_id.to_string(),
            code_hash: code_hash.to_string(),
            status: FactStatus::Verified,
            extracted_values,
            execution_time_ms,
            memory_used_mb,
            created_at: Utc::now(),
            error_message: None,
            confidence: None,
            source_code: Some(source_code.to_string()),
            derived_from: None,
        }
    }

    pub(crate) fn restore(parts: FactParts) -> Self {
        Self {
            fact_id: parts.fact_id,
            query_id: parts.query_id,
            plan_id: parts.plan_id,
            code_hash: parts.code_hash,
            status: parts.status,
            extracted_values: parts.extracted_values,
            execution_time_ms: parts.execution_time_ms,
            memory_used_mb: parts.memory_used_mb,
            created_at: parts.created_at,
            error_message: parts.error_message,
            confidence: parts.confidence,
            source_code: parts.source_code,
            derived_from: parts.derived_from,
        }
    }

    /// New fact with an adjusted confidence, derived from this one.
    pub fn with_confidence(&self, confidence: f64) -> Self {
        Self {
            fact_id: Uuid::new_v4().to_string(),
            status: FactStatus::Debated,
            created_at: Utc::now(),
            confidence: Some(confidence.clamp(0.0, 1.0)),
            derived_from: Some(self.fact_id.clone()),
            ..self.clone()
        }
    }

    pub fn fact_id(&self) -> &str {
        &self.fact_id
    }

    pub fn query_id(&self) -> &str {
        &self.query_id
    }

    pub fn plan_id(&self) -> &str {
        &self.plan_id
    }

    /// Hash of the code that produced the values.
    pub fn code_hash(&self) -> &str {
        &self.code_hash
    }

    pub fn status(&self) -> FactStatus {
        self.status
    }

    pub fn extracted_values(&self) -> &BTreeMap<String, FactValue> {
        &self.extracted_values
    }

    /// Numeric value by name.
    pub fn number(&self, key: &str) -> Option<f64> {
        self.extracted_values.get(key).and_then(FactValue::as_f64)
    }

    pub fn execution_time_ms(&self) -> u64 {
        self.execution_time_ms
    }

    pub fn memory_used_mb(&self) -> Option<f64> {
        self.memory_used_mb
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    pub fn confidence(&self) -> Option<f64> {
        self.confidence
    }

    pub fn source_code(&self) -> Option<&str> {
        self.source_code.as_deref()
    }

    /// Fact this one was derived from.
    pub fn derived_from(&self) -> Option<&str> {
        self.derived_from.as_deref()
    }
}
