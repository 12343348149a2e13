//! Pipeline nodes.
//!
//! Each node takes the state, does one stage of work and returns the state.
//! Failures are caught here and recorded as `Failed` with an error message;
//! nothing propagates out as an `Err`.

use std::collections::BTreeMap;

use futures::future::join_all;
use tracing::{debug, info, warn};

use super::state::{PipelineState, PipelineStatus};
use super::Orchestrator;
use crate::data::Fetched;
use crate::error::{DataError, PipelineError};
use crate::gate::create_verified_fact;
use crate::llm::PlanFeedback;

impl Orchestrator {
    /// PLAN: generate code, using the previous attempt's failure as feedback.
    pub async fn plan_node(&self, mut state: PipelineState) -> PipelineState {
        let feedback = match (&state.plan, &state.error_message) {
            (Some(plan), Some(error)) => Some(PlanFeedback {
                previous_code: plan.code.clone(),
                error: error.clone(),
            }),
            _ => None,
        };

        self.enter(&mut state, PipelineStatus::Planning, "plan");

        match self.ctx.planner.plan(&state.query, feedback.as_ref()).await {
            Ok(plan) => {
                state.plan = Some(plan);
                state.clear_error();
            }
            Err(e) => state.fail(e),
        }
        state
    }

    /// FETCH: load every dataset the plan declared, behind the market data breaker.
    pub async fn fetch_node(&self, mut state: PipelineState) -> PipelineState {
        self.enter(&mut state, PipelineStatus::Fetching, "fetch");

        let requirements = match &state.plan {
            Some(plan) => plan.data_requirements.clone(),
            None => {
                state.fail(PipelineError::Fetch {
                    message: "no plan to fetch data for".to_string(),
                });
                return state;
            }
        };

        // Bad requirements are the plan's fault, not the data source's
        if let Some(e) = requirements.iter().find_map(|r| r.validate().err()) {
            state.fail(e.into());
            return state;
        }

        let breaker = &self.ctx.market_breaker;
        let Some(permit) = breaker.try_acquire() else {
            let summary = breaker.summary();
            warn!(
                query_id = %state.query_id,
                breaker = %breaker.name(),
                state = %summary,
                "Market data breaker open, failing fetch"
            );
            state.fail(PipelineError::CircuitOpen {
                breaker: breaker.name().to_string(),
                state: summary.state.to_string(),
            });
            return state;
        };

        let results = join_all(requirements.iter().map(|r| self.ctx.data.get(r))).await;

        let mut fetched = BTreeMap::new();
        for (requirement, result) in requirements.iter().zip(results) {
            match result {
                Ok(data) => {
                    if let Some(warning) = &data.warning {
                        warn!(key = %requirement.binding_key(), warning = %warning, "Serving stale data");
                    }
                    fetched.insert(requirement.binding_key(), data);
                }
                Err(e) => {
                    if matches!(e, DataError::Exhausted { .. }) {
                        permit.failure();
                    } else {
                        permit.release();
                    }
                    state.fail(e.into());
                    return state;
                }
            }
        }

        permit.success();
        info!(
            query_id = %state.query_id,
            datasets = fetched.len(),
            "Data fetched"
        );
        state.fetched_data = fetched;
        state
    }

    /// EXECUTE: run the plan's code with fetched data bound as `DATA`.
    pub async fn execute_node(&self, mut state: PipelineState) -> PipelineState {
        self.enter(&mut state, PipelineStatus::Executing, "execute");

        let Some(plan) = &state.plan else {
            state.fail(PipelineError::Execution {
                message: "no plan to execute".to_string(),
            });
            return state;
        };

        let script = match with_data_binding(&plan.code, &state.fetched_data) {
            Ok(script) => script,
            Err(e) => {
                state.fail(e);
                return state;
            }
        };

        match self
            .ctx
            .sandbox
            .execute(&script, self.ctx.sandbox_timeout, false)
            .await
        {
            Ok(execution) => {
                info!(
                    query_id = %state.query_id,
                    status = %execution.status(),
                    duration_ms = execution.duration_ms(),
                    runtime = self.ctx.sandbox.runtime_name(),
                    "Code executed"
                );
                state.execution = Some(execution);
            }
            Err(e) => state.fail(e.into()),
        }
        state
    }

    /// VALIDATE: pass the execution through the truth gate.
    pub async fn validate_node(&self, mut state: PipelineState) -> PipelineState {
        self.enter(&mut state, PipelineStatus::Validating, "validate");

        let (Some(execution), Some(plan)) = (&state.execution, &state.plan) else {
            state.fail(PipelineError::Validation {
                message: "nothing was executed".to_string(),
            });
            return state;
        };

        let validation = self.ctx.gate.validate(execution);
        let fact = create_verified_fact(&validation, &state.query_id, &plan.plan_id);
        state.validation = Some(validation);

        match fact {
            Ok(fact) => {
                debug!(fact_id = %fact.fact_id(), values = fact.extracted_values().len(), "Fact verified");
                state.verified_fact = Some(fact);
            }
            Err(e) => state.fail(e),
        }
        state
    }

    /// DEBATE: adjust the fact's confidence. Degrades instead of failing.
    pub async fn debate_node(&self, mut state: PipelineState) -> PipelineState {
        self.enter(&mut state, PipelineStatus::Debating, "debate");

        let Some(fact) = &state.verified_fact else {
            state.fail(PipelineError::Validation {
                message: "no verified fact to debate".to_string(),
            });
            return state;
        };

        let outcome = self.ctx.debate.run(fact, &state.query).await;
        if outcome.degraded {
            warn!(query_id = %state.query_id, "Debate degraded to local analysis");
        }

        state.debate_reports = outcome.reports;
        state.synthesis = Some(outcome.synthesis);
        state.debated_fact = Some(outcome.fact);
        state.degraded = outcome.degraded;

        self.enter(&mut state, PipelineStatus::Completed, "complete");
        state
    }
}

/// Prefix `code` with a `DATA` dict holding the fetched datasets.
pub(crate) fn with_data_binding(
    code: &str,
    fetched: &BTreeMap<String, Fetched>,
) -> Result<String, PipelineError> {
    if fetched.is_empty() {
        return Ok(code.to_string());
    }

    let data: BTreeMap<&str, _> = fetched.iter().map(|(k, v)| (k.as_str(), &v.data)).collect();
    let to_execution_error = |e: serde_json::Error| PipelineError::Execution {
        message: format!("Failed to encode fetched data: {}", e),
    };
    let json = serde_json::to_string(&data).map_err(to_execution_error)?;
    // A JSON string literal is also a valid Python string literal
    let literal = serde_json::to_string(&json).map_err(to_execution_error)?;

    Ok(format!("import json\nDATA = json.loads({literal})\n\n{code}"))
}
