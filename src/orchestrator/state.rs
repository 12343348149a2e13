use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::data::Fetched;
use crate::debate::{DebateReport, Synthesis};
use crate::error::{PipelineError, RefusalReason};
use crate::gate::{ValidationResult, VerifiedFact};
use crate::llm::Plan;
use crate::sandbox::ExecutionResult;

// ============================================================================
// Status
// ============================================================================

/// Where a query is in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Initialized,
    Planning,
    Fetching,
    Executing,
    Validating,
    Debating,
    Completed,
    Failed,
    /// Transient: a failed attempt about to be retried
    Error,
    /// Stopped by the safety screen before planning
    Refused,
}

impl PipelineStatus {
    /// Convert to string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStatus::Initialized => "initialized",
            PipelineStatus::Planning => "planning",
            PipelineStatus::Fetching => "fetching",
            PipelineStatus::Executing => "executing",
            PipelineStatus::Validating => "validating",
            PipelineStatus::Debating => "debating",
            PipelineStatus::Completed => "completed",
            PipelineStatus::Failed => "failed",
            PipelineStatus::Error => "error",
            PipelineStatus::Refused => "refused",
        }
    }

    /// Fraction of the pipeline done on entering this status.
    pub fn progress(&self) -> f64 {
        match self {
            PipelineStatus::Initialized | PipelineStatus::Error => 0.0,
            PipelineStatus::Planning => 0.1,
            PipelineStatus::Fetching => 0.3,
            PipelineStatus::Executing => 0.5,
            PipelineStatus::Validating => 0.7,
            PipelineStatus::Debating => 0.85,
            PipelineStatus::Completed | PipelineStatus::Failed | PipelineStatus::Refused => 1.0,
        }
    }

    /// Whether the pipeline has stopped for good.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PipelineStatus::Completed | PipelineStatus::Failed | PipelineStatus::Refused
        )
    }
}

impl std::fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for PipelineStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "initialized" => Ok(PipelineStatus::Initialized),
            "planning" => Ok(PipelineStatus::Planning),
            "fetching" => Ok(PipelineStatus::Fetching),
            "executing" => Ok(PipelineStatus::Executing),
            "validating" => Ok(PipelineStatus::Validating),
            "debating" => Ok(PipelineStatus::Debating),
            "completed" => Ok(PipelineStatus::Completed),
            "failed" => Ok(PipelineStatus::Failed),
            "error" => Ok(PipelineStatus::Error),
            "refused" => Ok(PipelineStatus::Refused),
            _ => Err(format!("Unknown pipeline status: {}", s)),
        }
    }
}

// ============================================================================
// State
// ============================================================================

/// Working state of one query. Owned by a single driver loop.
#[derive(Debug, Clone)]
pub struct PipelineState {
    pub query_id: String,
    pub query: String,
    pub status: PipelineStatus,
    pub current_node: Option<String>,
    pub plan: Option<Plan>,
    /// Datasets by binding key
    pub fetched_data: BTreeMap<String, Fetched>,
    pub execution: Option<ExecutionResult>,
    pub validation: Option<ValidationResult>,
    /// Fact produced by the gate
    pub verified_fact: Option<VerifiedFact>,
    pub debate_reports: Vec<DebateReport>,
    pub synthesis: Option<Synthesis>,
    /// Gate fact with its debated confidence
    pub debated_fact: Option<VerifiedFact>,
    pub degraded: bool,
    /// Failed attempts so far
    pub error_count: u32,
    pub error_message: Option<String>,
    pub error_kind: Option<&'static str>,
    /// Whether the last failure may be retried
    pub retryable: bool,
    pub refusal: Option<RefusalReason>,
    pub visited_nodes: Vec<String>,
    pub started_at: DateTime<Utc>,
}

impl PipelineState {
    pub fn new(query: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), query)
    }

    pub fn with_id(query_id: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            query_id: query_id.into(),
            query: query.into(),
            status: PipelineStatus::Initialized,
            current_node: None,
            plan: None,
            fetched_data: BTreeMap::new(),
            execution: None,
            validation: None,
            verified_fact: None,
            debate_reports: Vec::new(),
            synthesis: None,
            debated_fact: None,
            degraded: false,
            error_count: 0,
            error_message: None,
            error_kind: None,
            retryable: false,
            refusal: None,
            visited_nodes: Vec::new(),
            started_at: Utc::now(),
        }
    }

    /// Move into `status` at `node`.
    pub fn enter(&mut self, status: PipelineStatus, node: &str) {
        self.status = status;
        self.current_node = Some(node.to_string());
        self.visited_nodes.push(node.to_string());
    }

    /// Record a node failure.
    pub fn fail(&mut self, error: PipelineError) {
        self.status = PipelineStatus::Failed;
        self.error_kind = Some(error.kind());
        self.retryable = error.is_retryable();
        self.error_message = Some(error.to_string());
    }

    /// Forget the last failure once a node has recovered from it.
    pub fn clear_error(&mut self) {
        self.error_message = None;
        self.error_kind = None;
        self.retryable = false;
    }

    /// Rewind to `Initialized` for another attempt.
    ///
    /// The plan and error stay as feedback for the next PLAN; everything
    /// downstream of it is dropped.
    pub fn reset_for_retry(&mut self) {
        self.status = PipelineStatus::Initialized;
        self.current_node = None;
        self.fetched_data.clear();
        self.execution = None;
        self.validation = None;
        self.verified_fact = None;
        self.debate_reports.clear();
        self.synthesis = None;
        self.debated_fact = None;
        self.degraded = false;
    }

    /// Facts this run produced.
    pub fn verified_fact_count(&self) -> usize {
        usize::from(self.verified_fact.is_some())
    }

    /// The most refined fact, if any.
    pub fn final_fact(&self) -> Option<&VerifiedFact> {
        self.debated_fact.as_ref().or(self.verified_fact.as_ref())
    }

    pub fn elapsed_ms(&self) -> u64 {
        (Utc::now() - self.started_at).num_milliseconds().max(0) as u64
    }

    /// Stable JSON-ready summary.
    pub fn report(&self) -> StatusReport {
        StatusReport {
            query_id: self.query_id.clone(),
            query: self.query.clone(),
            status: self.status,
            progress: self.status.progress(),
            verified_fact_count: self.verified_fact_count(),
            error: self.error_message.clone(),
            error_kind: self.error_kind.map(str::to_string),
            refusal_reason: self.refusal,
            visited_nodes: self.visited_nodes.clone(),
            error_count: self.error_count,
            fact: self.final_fact().cloned(),
            synthesis: self.synthesis.clone(),
            degraded: self.degraded,
            started_at: self.started_at,
            duration_ms: self.elapsed_ms(),
        }
    }
}

// ============================================================================
// Report
// ============================================================================

/// Terminal status object for a query.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub query_id: String,
    pub query: String,
    pub status: PipelineStatus,
    pub progress: f64,
    pub verified_fact_count: usize,
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refusal_reason: Option<RefusalReason>,
    pub visited_nodes: Vec<String>,
    pub error_count: u32,
    pub fact: Option<VerifiedFact>,
    pub synthesis: Option<Synthesis>,
    pub degraded: bool,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for status in [
            PipelineStatus::Initialized,
            PipelineStatus::Fetching,
            PipelineStatus::Completed,
            PipelineStatus::Refused,
        ] {
            assert_eq!(status.as_str().parse::<PipelineStatus>().unwrap(), status);
        }
        assert!("done".parse::<PipelineStatus>().is_err());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(PipelineStatus::Completed.is_terminal());
        assert!(PipelineStatus::Failed.is_terminal());
        assert!(PipelineStatus::Refused.is_terminal());
        assert!(!PipelineStatus::Error.is_terminal());
        assert!(!PipelineStatus::Debating.is_terminal());
    }

    #[test]
    fn test_fail_and_retry_reset() {
        let mut state = PipelineState::new("Sharpe of AAPL");
        state.enter(PipelineStatus::Planning, "plan");
        state.fail(PipelineError::Execution {
            message: "ZeroDivisionError".to_string(),
        });
        assert_eq!(state.status, PipelineStatus::Failed);
        assert_eq!(state.error_kind, Some("execution_error"));
        assert!(state.retryable);

        state.reset_for_retry();
        assert_eq!(state.status, PipelineStatus::Initialized);
        // Kept as feedback for the next plan
        assert!(state.error_message.is_some());
        assert_eq!(state.visited_nodes, vec!["plan"]);
    }

    #[test]
    fn test_report_shape() {
        let mut state = PipelineState::with_id("q-1", "x");
        state.fail(PipelineError::Timeout { timeout_secs: 5 });
        let json = serde_json::to_value(state.report()).unwrap();

        assert_eq!(json["query_id"], "q-1");
        assert_eq!(json["status"], "failed");
        assert_eq!(json["progress"], 1.0);
        assert_eq!(json["verified_fact_count"], 0);
        assert_eq!(json["error"], "Query timed out after 5s");
        assert!(json["fact"].is_null());
    }
}
