use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use super::evidence::EvidenceProfile;
use super::local::LocalAnalysisProvider;
use super::synthesis::{synthesize, DebateReport, Synthesis};
use super::{AnalysisProvider, DebateContext, Perspective, PerspectiveAnalysis};
use crate::gate::VerifiedFact;
use crate::resilience::SharedBreaker;

/// Everything a debate produced.
#[derive(Debug, Clone, Serialize)]
pub struct DebateOutcome {
    pub reports: Vec<DebateReport>,
    pub synthesis: Synthesis,
    /// The fact with its adjusted confidence
    pub fact: VerifiedFact,
    /// At least one perspective came from the local fallback
    pub degraded: bool,
}

/// Runs the three-perspective debate behind the analysis breaker.
#[derive(Clone)]
pub struct DebateProtocol {
    primary: Arc<dyn AnalysisProvider>,
    fallback: LocalAnalysisProvider,
    breaker: SharedBreaker,
}

struct Analyzed {
    analysis: PerspectiveAnalysis,
    provider: String,
    degraded: bool,
}

impl DebateProtocol {
    pub fn new(primary: Arc<dyn AnalysisProvider>, breaker: SharedBreaker) -> Self {
        Self {
            primary,
            fallback: LocalAnalysisProvider::new(),
            breaker,
        }
    }

    /// Breaker guarding the primary provider.
    pub fn breaker(&self) -> &SharedBreaker {
        &self.breaker
    }

    /// Debate `fact` and return it with an adjusted confidence.
    ///
    /// Never fails: perspectives the primary provider cannot produce are
    /// filled in by the local fallback and the outcome is marked degraded.
    pub async fn run(&self, fact: &VerifiedFact, query: &str) -> DebateOutcome {
        let context = DebateContext::from_fact(query, fact);
        let profile = EvidenceProfile::from_values(&context.values, context.execution_time_ms);

        let (bull, bear) = tokio::join!(
            self.analyze(Perspective::Optimistic, &context),
            self.analyze(Perspective::Skeptical, &context),
        );

        let moderator_context =
            context.with_prior(vec![bull.analysis.clone(), bear.analysis.clone()]);
        let neutral = self.analyze(Perspective::Neutral, &moderator_context).await;

        let reports: Vec<DebateReport> = [bull, bear, neutral]
            .into_iter()
            .map(|a| {
                DebateReport::from_analysis(
                    a.analysis,
                    &context.values,
                    &profile,
                    &a.provider,
                    a.degraded,
                )
            })
            .collect();

        let original = fact.confidence().unwrap_or_else(|| {
            reports.iter().map(|r| r.confidence).sum::<f64>() / reports.len() as f64
        });
        let synthesis = synthesize(&reports, original);
        let degraded = synthesis.degraded;

        info!(
            fact_id = %fact.fact_id(),
            original = synthesis.original_confidence,
            adjusted = synthesis.adjusted_confidence,
            quality = synthesis.quality_score,
            degraded,
            "Debate synthesized"
        );

        DebateOutcome {
            fact: fact.with_confidence(synthesis.adjusted_confidence),
            reports,
            synthesis,
            degraded,
        }
    }

    async fn analyze(&self, perspective: Perspective, context: &DebateContext) -> Analyzed {
        let Some(permit) = self.breaker.try_acquire() else {
            warn!(
                breaker = %self.breaker.name(),
                state = %self.breaker.state(),
                perspective = %perspective,
                "Analysis breaker open, using local fallback"
            );
            return self.fall_back(perspective, context);
        };

        match self.primary.analyze(perspective, context).await {
            Ok(analysis) => {
                permit.success();
                Analyzed {
                    analysis,
                    provider: self.primary.name().to_string(),
                    degraded: false,
                }
            }
            Err(e) => {
                permit.failure();
                warn!(
                    provider = %self.primary.name(),
                    perspective = %perspective,
                    error = %e,
                    "Analysis failed, using local fallback"
                );
                self.fall_back(perspective, context)
            }
        }
    }

    fn fall_back(&self, perspective: Perspective, context: &DebateContext) -> Analyzed {
        Analyzed {
            analysis: self.fallback.analyze_local(perspective, context),
            provider: self.fallback.name().to_string(),
            degraded: true,
        }
    }
}
