use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use super::types::Usage;
use super::{extract_code_block, extract_json_from_completion, CodeGenerator};
use crate::data::DataRequirement;
use crate::error::{PipelineError, PipelineResult};
use crate::prompts::{PLANNER_PROMPT, PLANNER_RETRY_NOTE};

/// An executable plan for one query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Plan {
    pub plan_id: String,
    /// Program to run in the sandbox
    pub code: String,
    /// Datasets to fetch before running
    pub data_requirements: Vec<DataRequirement>,
    pub metadata: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl Plan {
    /// Whether the FETCH stage has anything to do.
    pub fn needs_data(&self) -> bool {
        !self.data_requirements.is_empty()
    }
}

/// What went wrong with the previous attempt.
#[derive(Debug, Clone)]
pub struct PlanFeedback {
    pub previous_code: String,
    pub error: String,
}

#[derive(Debug, Deserialize)]
struct PlanPayload {
    #[serde(default)]
    code: String,
    #[serde(default)]
    data_requirements: Vec<DataRequirement>,
    #[serde(default)]
    metadata: Option<serde_json::Value>,
}

/// Turns generator output into [`Plan`]s.
#[derive(Clone)]
pub struct Planner {
    generator: Arc<dyn CodeGenerator>,
}

impl Planner {
    pub fn new(generator: Arc<dyn CodeGenerator>) -> Self {
        Self { generator }
    }

    /// Generate a plan for `query`, using feedback from a failed attempt.
    pub async fn plan(&self, query: &str, feedback: Option<&PlanFeedback>) -> PipelineResult<Plan> {
        let context = build_context(query, feedback);
        let generation = self.generator.generate(PLANNER_PROMPT, &context).await?;

        let (code, data_requirements, metadata) = parse_plan(&generation.content)?;
        let plan = Plan {
            plan_id: Uuid::new_v4().to_string(),
            code,
            data_requirements,
            metadata,
            usage: generation.usage,
        };

        info!(
            plan_id = %plan.plan_id,
            requirements = plan.data_requirements.len(),
            retry = feedback.is_some(),
            "Plan generated"
        );
        Ok(plan)
    }
}

fn build_context(query: &str, feedback: Option<&PlanFeedback>) -> String {
    let mut context = format!(
        "Query: {}\nToday: {}\n",
        query.trim(),
        Utc::now().date_naive()
    );
    if let Some(feedback) = feedback {
        context.push_str(&format!(
            "\n{PLANNER_RETRY_NOTE}\n\nError:\n{}\n\nPrevious code:\n```python\n{}\n```\n",
            feedback.error, feedback.previous_code
        ));
    }
    context
}

type ParsedPlan = (String, Vec<DataRequirement>, serde_json::Value);

/// JSON payload first, then a fenced code block.
fn parse_plan(content: &str) -> PipelineResult<ParsedPlan> {
    let from_json = extract_json_from_completion(content)
        .ok()
        .and_then(|json| serde_json::from_str::<PlanPayload>(json).ok());

    if let Some(payload) = from_json {
        if !payload.code.trim().is_empty() {
            let metadata = payload
                .metadata
                .unwrap_or_else(|| serde_json::Value::Object(Default::default()));
            return Ok((payload.code, payload.data_requirements, metadata));
        }
    }

    match extract_code_block(content) {
        Some(code) => {
            warn!("Plan response was not JSON; using fenced code without data requirements");
            Ok((code, Vec::new(), serde_json::json!({ "format": "code_block" })))
        }
        None => Err(PipelineError::Plan {
            message: format!(
                "Generator returned no code. First 100 chars: '{}'",
                content.chars().take(100).collect::<String>()
            ),
        }),
    }
}
