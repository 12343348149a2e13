//! Multi-perspective debate over a verified fact.
//!
//! Optimistic and skeptical analysts argue concurrently, a neutral
//! moderator follows, and [`synthesize`] folds the three reports into a
//! conservatively adjusted confidence.

mod evidence;
mod llm;
mod local;
mod protocol;
mod synthesis;

pub use evidence::{classify_claims, Claim, EvidenceProfile, EvidenceTier};
pub use llm::LlmAnalysisProvider;
pub use local::LocalAnalysisProvider;
pub use protocol::{DebateOutcome, DebateProtocol};
pub use synthesis::{synthesize, ConfidenceAdjustment, DebateReport, Synthesis};

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::LlmResult;
use crate::gate::{FactValue, VerifiedFact};

/// Debate role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Perspective {
    Optimistic,
    Skeptical,
    Neutral,
}

impl Perspective {
    /// Convert to string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Perspective::Optimistic => "optimistic",
            Perspective::Skeptical => "skeptical",
            Perspective::Neutral => "neutral",
        }
    }
}

impl std::fmt::Display for Perspective {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One analyst's raw output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerspectiveAnalysis {
    pub perspective: Perspective,
    pub analysis_text: String,
    pub confidence: f64,
    pub key_points: Vec<String>,
}

/// What every analyst sees.
#[derive(Debug, Clone, Serialize)]
pub struct DebateContext {
    pub query: String,
    pub values: BTreeMap<String, FactValue>,
    pub execution_time_ms: u64,
    pub code_hash: String,
    /// Earlier analyses, given to the moderator
    pub prior: Vec<PerspectiveAnalysis>,
}

impl DebateContext {
    /// Context for debating `fact`.
    pub fn from_fact(query: &str, fact: &VerifiedFact) -> Self {
        Self {
            query: query.to_string(),
            values: fact.extracted_values().clone(),
            execution_time_ms: fact.execution_time_ms(),
            code_hash: fact.code_hash().to_string(),
            prior: Vec::new(),
        }
    }

    /// Copy with earlier analyses attached.
    pub fn with_prior(&self, prior: Vec<PerspectiveAnalysis>) -> Self {
        Self {
            prior,
            ..self.clone()
        }
    }

    /// Plain-text rendering for prompts.
    pub fn render(&self) -> String {
        let mut out = format!("Question: {}\n\nVerified metrics:\n", self.query);
        for (key, value) in &self.values {
            out.push_str(&format!("- {key}: {value}\n"));
        }
        out.push_str(&format!(
            "\nExecution time: {}ms\nCode hash: {}\n",
            self.execution_time_ms, self.code_hash
        ));
        for analysis in &self.prior {
            out.push_str(&format!(
                "\n{} position (confidence {:.2}): {}\n",
                analysis.perspective, analysis.confidence, analysis.analysis_text
            ));
            for point in &analysis.key_points {
                out.push_str(&format!("  - {point}\n"));
            }
        }
        out
    }
}

/// Produces one perspective's analysis.
#[async_trait]
pub trait AnalysisProvider: Send + Sync {
    /// Provider name for reports and logs.
    fn name(&self) -> &str;

    /// Analyze the context from one perspective.
    async fn analyze(
        &self,
        perspective: Perspective,
        context: &DebateContext,
    ) -> LlmResult<PerspectiveAnalysis>;
}
