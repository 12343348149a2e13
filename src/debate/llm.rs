use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use super::{AnalysisProvider, DebateContext, Perspective, PerspectiveAnalysis};
use crate::error::{LlmError, LlmResult};
use crate::llm::{extract_json_from_completion, CodeGenerator};
use crate::prompts::{NEUTRAL_PROMPT, OPTIMISTIC_PROMPT, SKEPTICAL_PROMPT};

#[derive(Debug, Deserialize)]
struct AnalysisPayload {
    analysis: String,
    confidence: f64,
    #[serde(default)]
    key_points: Vec<String>,
}

/// Model-backed analyst driven by the perspective prompts.
#[derive(Clone)]
pub struct LlmAnalysisProvider {
    generator: Arc<dyn CodeGenerator>,
    name: String,
}

impl LlmAnalysisProvider {
    pub fn new(generator: Arc<dyn CodeGenerator>) -> Self {
        Self {
            generator,
            name: "llm".to_string(),
        }
    }

    /// Override the provider name shown in reports.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    fn prompt_for(perspective: Perspective) -> &'static str {
        match perspective {
            Perspective::Optimistic => OPTIMISTIC_PROMPT,
            Perspective::Skeptical => SKEPTICAL_PROMPT,
            Perspective::Neutral => NEUTRAL_PROMPT,
        }
    }
}

#[async_trait]
impl AnalysisProvider for LlmAnalysisProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn analyze(
        &self,
        perspective: Perspective,
        context: &DebateContext,
    ) -> LlmResult<PerspectiveAnalysis> {
        let generation = self
            .generator
            .generate(Self::prompt_for(perspective), &context.render())
            .await?;

        let json = extract_json_from_completion(&generation.content)
            .map_err(|message| LlmError::InvalidResponse { message })?;
        let payload: AnalysisPayload =
            serde_json::from_str(json).map_err(|e| LlmError::InvalidResponse {
                message: format!("Failed to parse {perspective} analysis: {e}"),
            })?;

        if !payload.confidence.is_finite() {
            return Err(LlmError::InvalidResponse {
                message: format!("Non-finite {perspective} confidence"),
            });
        }

        debug!(
            perspective = %perspective,
            confidence = payload.confidence,
            key_points = payload.key_points.len(),
            "Analysis received"
        );

        Ok(PerspectiveAnalysis {
            perspective,
            analysis_text: payload.analysis,
            confidence: payload.confidence.clamp(0.0, 1.0),
            key_points: payload.key_points,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::FactValue;
    use crate::llm::{Generation, MockCodeGenerator};
    use mockall::predicate::*;

    fn context() -> DebateContext {
        DebateContext {
            query: "Volatility of MSFT".to_string(),
            values: [("volatility".to_string(), FactValue::Number(0.24))].into(),
            execution_time_ms: 80,
            code_hash: "abc".to_string(),
            prior: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_parses_analysis() {
        let mut generator = MockCodeGenerator::new();
        generator
            .expect_generate()
            .with(eq(SKEPTICAL_PROMPT), function(|ctx: &str| ctx.contains("volatility: 0.24")))
            .times(1)
            .returning(|_, _| {
                Ok(Generation::new(
                    r#"```json
{"analysis": "One year is thin.", "confidence": 1.3, "key_points": ["volatility may spike"]}
```"#,
                ))
            });

        let analysis = LlmAnalysisProvider::new(Arc::new(generator))
            .analyze(Perspective::Skeptical, &context())
            .await
            .unwrap();
        assert_eq!(analysis.perspective, Perspective::Skeptical);
        assert_eq!(analysis.confidence, 1.0);
        assert_eq!(analysis.key_points, vec!["volatility may spike"]);
    }

    #[tokio::test]
    async fn test_invalid_json_is_error() {
        let mut generator = MockCodeGenerator::new();
        generator
            .expect_generate()
            .returning(|_, _| Ok(Generation::new("I think it's fine.")));

        let err = LlmAnalysisProvider::new(Arc::new(generator))
            .analyze(Perspective::Optimistic, &context())
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::InvalidResponse { .. }));
    }
}
