//! Query orchestration.
//!
//! Drives a query through the pipeline:
//!
//! ```text
//! safety ─► PLAN ─► [FETCH] ─► EXECUTE ─► VALIDATE ─► DEBATE ─► Completed
//!             ▲                                          │
//!             └──── Error (retryable, retries left) ◄────┘ Failed
//! ```
//!
//! FETCH runs only when the plan declares data requirements. Each node
//! catches its own errors; the driver decides whether a failed attempt is
//! retried or terminal. The whole loop runs under the query timeout.

mod nodes;
mod progress;
mod state;

pub use progress::{ChannelProgressSink, ProgressSink, ProgressUpdate, TracingProgressSink};
pub use state::{PipelineState, PipelineStatus, StatusReport};

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use tracing::{error, info, warn};

use crate::context::AppContext;
use crate::data::extract_tickers;
use crate::error::{PipelineError, RefusalReason};
use crate::storage::RunRecord;

/// Words that make a multi-ticker query one question about the pair.
const PAIRWISE_INTENT: &[&str] = &[
    "correlat",
    "versus",
    "compar",
    "relative to",
    "between",
    "beta",
    "spread",
];

static PAIRWISE_VS: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"(?i)\bvs\.?\b").ok());

// ============================================================================
// Stages
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Plan,
    Fetch,
    Execute,
    Validate,
    Debate,
}

impl Stage {
    const ALL: [Stage; 5] = [
        Stage::Plan,
        Stage::Fetch,
        Stage::Execute,
        Stage::Validate,
        Stage::Debate,
    ];

    fn node(&self) -> &'static str {
        match self {
            Stage::Plan => "plan",
            Stage::Fetch => "fetch",
            Stage::Execute => "execute",
            Stage::Validate => "validate",
            Stage::Debate => "debate",
        }
    }
}

/// What the driver knows if the query times out mid-node.
#[derive(Debug, Default)]
struct Checkpoint {
    visited_nodes: Vec<String>,
    error_count: u32,
    in_flight: Option<&'static str>,
}

// ============================================================================
// Orchestrator
// ============================================================================

/// Runs queries against a shared [`AppContext`].
#[derive(Clone)]
pub struct Orchestrator {
    ctx: Arc<AppContext>,
    progress: Option<Arc<dyn ProgressSink>>,
}

impl Orchestrator {
    pub fn new(ctx: Arc<AppContext>) -> Self {
        Self {
            ctx,
            progress: None,
        }
    }

    /// Publish progress to `sink` on every transition.
    pub fn with_progress(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.progress = Some(sink);
        self
    }

    pub fn context(&self) -> &AppContext {
        &self.ctx
    }

    /// Run one query to a terminal status.
    pub async fn run(&self, query: &str) -> StatusReport {
        self.run_state(query).await.report()
    }

    /// Run several queries, at most `max_concurrency` at a time.
    ///
    /// Each query gets its own state; one failing does not affect the
    /// others. Reports come back in input order.
    pub async fn run_many(&self, queries: &[String]) -> Vec<StatusReport> {
        let limit = self.ctx.pipeline.max_concurrency.max(1);
        stream::iter(queries)
            .map(|q| self.run(q))
            .buffered(limit)
            .collect()
            .await
    }

    /// Run one query and return its full final state.
    pub async fn run_state(&self, query: &str) -> PipelineState {
        let mut state = PipelineState::new(query);
        info!(query_id = %state.query_id, query = %state.query, "Query received");
        self.publish(&state);

        let verdict = self.ctx.safety.screen(query);
        if verdict.should_refuse {
            let reason = verdict.reason.unwrap_or(RefusalReason::InvalidInput);
            state.enter(PipelineStatus::Refused, "safety");
            state.fail(PipelineError::Refusal {
                reason,
                message: verdict.message,
            });
            state.status = PipelineStatus::Refused;
            state.refusal = Some(reason);
            self.publish(&state);
            self.persist(&state).await;
            return state;
        }

        let query_id = state.query_id.clone();
        let started_at = state.started_at;
        let timeout_secs = self.ctx.pipeline.query_timeout_secs;
        let checkpoint = Mutex::new(Checkpoint::default());

        let state = match tokio::time::timeout(
            Duration::from_secs(timeout_secs),
            self.drive(state, &checkpoint),
        )
        .await
        {
            Ok(state) => state,
            Err(_) => {
                let checkpoint = checkpoint.lock();
                let mut state = PipelineState::with_id(query_id, query);
                state.started_at = started_at;
                state.visited_nodes = checkpoint.visited_nodes.clone();
                state.visited_nodes.extend(checkpoint.in_flight.map(str::to_string));
                state.error_count = checkpoint.error_count + 1;
                state.current_node = checkpoint.in_flight.map(str::to_string);
                state.fail(PipelineError::Timeout { timeout_secs });
                warn!(
                    query_id = %state.query_id,
                    node = ?checkpoint.in_flight,
                    timeout_secs,
                    "Query timed out"
                );
                state
            }
        };

        self.publish(&state);
        self.persist(&state).await;

        match state.status {
            PipelineStatus::Completed => info!(
                query_id = %state.query_id,
                duration_ms = state.elapsed_ms(),
                retries = state.error_count,
                degraded = state.degraded,
                "Query completed"
            ),
            _ => error!(
                query_id = %state.query_id,
                status = %state.status,
                error = ?state.error_message,
                attempts = state.error_count,
                "Query failed"
            ),
        }
        state
    }

    /// Attempt loop with retries from PLAN.
    async fn drive(&self, mut state: PipelineState, checkpoint: &Mutex<Checkpoint>) -> PipelineState {
        loop {
            state = self.attempt(state, checkpoint).await;
            if state.status != PipelineStatus::Failed {
                return state;
            }

            state.error_count += 1;
            checkpoint.lock().error_count = state.error_count;

            if !state.retryable || state.error_count > self.ctx.pipeline.max_retries {
                return state;
            }

            warn!(
                query_id = %state.query_id,
                attempt = state.error_count,
                max_retries = self.ctx.pipeline.max_retries,
                error = ?state.error_message,
                "Attempt failed, retrying"
            );
            state.status = PipelineStatus::Error;
            self.publish(&state);
            state.reset_for_retry();
        }
    }

    /// One pass over the stages. Stops at the first failure.
    async fn attempt(&self, mut state: PipelineState, checkpoint: &Mutex<Checkpoint>) -> PipelineState {
        for stage in Stage::ALL {
            if stage == Stage::Fetch && !state.plan.as_ref().is_some_and(|p| p.needs_data()) {
                continue;
            }

            checkpoint.lock().in_flight = Some(stage.node());
            state = match stage {
                Stage::Plan => self.plan_node(state).await,
                Stage::Fetch => self.fetch_node(state).await,
                Stage::Execute => self.execute_node(state).await,
                Stage::Validate => self.validate_node(state).await,
                Stage::Debate => self.debate_node(state).await,
            };
            {
                let mut checkpoint = checkpoint.lock();
                checkpoint.visited_nodes = state.visited_nodes.clone();
                checkpoint.in_flight = None;
            }

            if state.status == PipelineStatus::Failed {
                return state;
            }
        }
        state
    }

    /// Enter a status and publish it.
    fn enter(&self, state: &mut PipelineState, status: PipelineStatus, node: &str) {
        state.enter(status, node);
        self.publish(state);
    }

    fn publish(&self, state: &PipelineState) {
        if let Some(sink) = &self.progress {
            sink.publish(&ProgressUpdate::from_state(state));
        }
    }

    /// Store the run's facts and report. Failures are logged, never raised.
    async fn persist(&self, state: &PipelineState) {
        let Some(store) = &self.ctx.store else {
            return;
        };

        if let Some(fact) = &state.verified_fact {
            if let Err(e) = store.save_fact(fact).await {
                warn!(error = %e, fact_id = %fact.fact_id(), "Failed to persist verified fact");
            }
        }

        if let Some(fact) = &state.debated_fact {
            if let Err(e) = store.save_fact(fact).await {
                warn!(error = %e, fact_id = %fact.fact_id(), "Failed to persist debated fact");
            } else if let Some(synthesis) = &state.synthesis {
                if let Err(e) = store.save_synthesis(fact.fact_id(), synthesis).await {
                    warn!(error = %e, fact_id = %fact.fact_id(), "Failed to persist synthesis");
                }
            }
        }

        let report = match serde_json::to_value(state.report()) {
            Ok(report) => report,
            Err(e) => {
                warn!(error = %e, query_id = %state.query_id, "Failed to encode run report");
                return;
            }
        };
        let run = RunRecord::new(&state.query_id, &state.query, state.status.as_str(), report);
        if let Err(e) = store.save_run(&run).await {
            warn!(error = %e, query_id = %state.query_id, "Failed to persist run");
        }
    }
}

// ============================================================================
// Decomposition
// ============================================================================

/// Split a query about several tickers into one query per ticker.
///
/// The span from the first to the last ticker is replaced by each ticker
/// in turn. Queries with fewer than two tickers, or that ask about the
/// tickers jointly (correlation, comparison, spreads), come back whole.
pub fn decompose_query(query: &str) -> Vec<String> {
    let tickers = extract_tickers(query);
    if tickers.len() < 2 || has_pairwise_intent(query) {
        return vec![query.to_string()];
    }

    let positions: Vec<(usize, usize)> = tickers
        .iter()
        .filter_map(|t| {
            Regex::new(&format!(r"\$?\b{}\b", regex::escape(t)))
                .ok()?
                .find(query)
                .map(|m| (m.start(), m.end()))
        })
        .collect();
    let (Some(start), Some(end)) = (
        positions.iter().map(|p| p.0).min(),
        positions.iter().map(|p| p.1).max(),
    ) else {
        return vec![query.to_string()];
    };

    let (head, tail) = (&query[..start], &query[end..]);
    tickers
        .iter()
        .map(|ticker| format!("{head}{ticker}{tail}"))
        .collect()
}

fn has_pairwise_intent(query: &str) -> bool {
    let q = query.to_lowercase();
    PAIRWISE_INTENT.iter().any(|word| q.contains(word))
        || PAIRWISE_VS.as_ref().is_some_and(|re| re.is_match(query))
}
