use async_trait::async_trait;

use super::{AnalysisProvider, DebateContext, Perspective, PerspectiveAnalysis};
use crate::error::LlmResult;

const BASE_CONFIDENCE: f64 = 0.7;
const FAST_EXECUTION_MS: u64 = 5;
const MAX_POINTS: usize = 5;

/// Deterministic rule-based analyst.
///
/// Used when no model is configured and as the fallback whenever the
/// analysis breaker is open or a model call fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalAnalysisProvider;

impl LocalAnalysisProvider {
    pub fn new() -> Self {
        Self
    }

    /// Synchronous form of [`AnalysisProvider::analyze`]; never fails.
    pub fn analyze_local(
        &self,
        perspective: Perspective,
        context: &DebateContext,
    ) -> PerspectiveAnalysis {
        local_analysis(perspective, context)
    }
}

#[async_trait]
impl AnalysisProvider for LocalAnalysisProvider {
    fn name(&self) -> &str {
        "local"
    }

    async fn analyze(
        &self,
        perspective: Perspective,
        context: &DebateContext,
    ) -> LlmResult<PerspectiveAnalysis> {
        Ok(self.analyze_local(perspective, context))
    }
}

fn local_analysis(perspective: Perspective, context: &DebateContext) -> PerspectiveAnalysis {
    let suspicious = context.execution_time_ms < FAST_EXECUTION_MS;

    let mut confidence = BASE_CONFIDENCE
        + match perspective {
            Perspective::Optimistic => 0.1,
            Perspective::Skeptical => -0.1,
            Perspective::Neutral => 0.0,
        };
    if suspicious {
        confidence -= 0.2;
    }

    let numbers: Vec<(&String, f64)> = context
        .values
        .iter()
        .filter_map(|(key, value)| value.as_f64().map(|v| (key, v)))
        .take(MAX_POINTS)
        .collect();

    let mut key_points: Vec<String> = numbers
        .iter()
        .map(|(key, value)| match perspective {
            Perspective::Optimistic => {
                format!("{key} of {value:.4} was computed from fetched data and supports the result")
            }
            Perspective::Skeptical => {
                format!("{key} of {value:.4} reflects one historical window and may not persist")
            }
            Perspective::Neutral => format!("{key} measured at {value:.4}"),
        })
        .collect();

    if perspective == Perspective::Skeptical {
        key_points.push("Past performance does not guarantee future results".to_string());
    }
    if suspicious {
        key_points.push(format!(
            "Execution finished in {}ms, fast enough to suggest hardcoded output",
            context.execution_time_ms
        ));
    }

    let analysis_text = match perspective {
        Perspective::Optimistic => format!(
            "The {} verified metric(s) were produced by sandboxed code and support the question as asked.",
            numbers.len()
        ),
        Perspective::Skeptical => format!(
            "The {} verified metric(s) cover a single sample; treat them as descriptive, not predictive.",
            numbers.len()
        ),
        Perspective::Neutral if context.prior.is_empty() => format!(
            "The {} verified metric(s) are reported as computed.",
            numbers.len()
        ),
        Perspective::Neutral => {
            let prior_avg = context.prior.iter().map(|p| p.confidence).sum::<f64>()
                / context.prior.len() as f64;
            format!(
                "Weighing {} earlier position(s) averaging {:.2} confidence against {} verified metric(s).",
                context.prior.len(),
                prior_avg,
                numbers.len()
            )
        }
    };

    PerspectiveAnalysis {
        perspective,
        analysis_text,
        confidence: confidence.clamp(0.0, 1.0),
        key_points,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::FactValue;

    fn context(execution_time_ms: u64) -> DebateContext {
        DebateContext {
            query: "Sharpe of AAPL".to_string(),
            values: [
                ("sharpe_ratio".to_string(), FactValue::Number(1.95)),
                ("symbol".to_string(), FactValue::Text("AAPL".to_string())),
            ]
            .into(),
            execution_time_ms,
            code_hash: "abc".to_string(),
            prior: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_confidence_by_perspective() {
        let provider = LocalAnalysisProvider::new();
        let ctx = context(120);

        let bull = provider.analyze(Perspective::Optimistic, &ctx).await.unwrap();
        let bear = provider.analyze(Perspective::Skeptical, &ctx).await.unwrap();
        let neutral = provider.analyze(Perspective::Neutral, &ctx).await.unwrap();

        assert!((bull.confidence - 0.8).abs() < 1e-9);
        assert!((bear.confidence - 0.6).abs() < 1e-9);
        assert!((neutral.confidence - 0.7).abs() < 1e-9);
        assert_eq!(bull.key_points.len(), 1);
        assert!(bull.key_points[0].contains("sharpe_ratio"));
        assert_eq!(bear.key_points.len(), 2);
    }

    #[tokio::test]
    async fn test_fast_execution_lowers_confidence() {
        let analysis = LocalAnalysisProvider::new()
            .analyze(Perspective::Neutral, &context(1))
            .await
            .unwrap();
        assert!((analysis.confidence - 0.5).abs() < 1e-9);
        assert!(analysis.key_points.iter().any(|p| p.contains("hardcoded")));
    }

    #[tokio::test]
    async fn test_deterministic() {
        let provider = LocalAnalysisProvider::new();
        let ctx = context(50);
        let a = provider.analyze(Perspective::Skeptical, &ctx).await.unwrap();
        let b = provider.analyze(Perspective::Skeptical, &ctx).await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_moderator_reads_prior_positions() {
        let provider = LocalAnalysisProvider::new();
        let ctx = context(50);
        let bull = provider.analyze(Perspective::Optimistic, &ctx).await.unwrap();
        let moderated = provider
            .analyze(Perspective::Neutral, &ctx.with_prior(vec![bull]))
            .await
            .unwrap();
        assert!(moderated.analysis_text.contains("1 earlier position"));
    }
}
