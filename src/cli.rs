//! Command-line commands.
//!
//! Every command prints JSON to stdout; logs go to stderr.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use clap::Subcommand;
use serde_json::json;
use tracing::info;

use crate::context::AppContext;
use crate::gate::FactStatus;
use crate::orchestrator::{decompose_query, Orchestrator, PipelineStatus, TracingProgressSink};
use crate::storage::FactStore;

/// CLI subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Answer one question
    Ask {
        /// The question
        query: String,

        /// Split multi-ticker questions into one run per ticker
        #[arg(long)]
        split: bool,

        /// Log each pipeline transition
        #[arg(long)]
        progress: bool,
    },

    /// Answer every question in a file, one per line, concurrently
    Batch {
        /// Path to the question file
        file: std::path::PathBuf,
    },

    /// Show a stored fact with its synthesis and lineage
    Fact {
        /// Fact ID
        fact_id: String,
    },

    /// List stored facts
    Facts {
        /// Facts produced for this query ID
        #[arg(long, conflicts_with_all = ["status", "since"])]
        query_id: Option<String>,

        /// Facts with this status: verified or debated
        #[arg(long, conflicts_with = "since")]
        status: Option<String>,

        /// Facts created at or after this RFC3339 time
        #[arg(long)]
        since: Option<DateTime<Utc>>,

        /// Upper bound for --since (defaults to now)
        #[arg(long, requires = "since")]
        until: Option<DateTime<Utc>>,
    },

    /// Show the stored report of a past run
    Run {
        /// Query ID
        query_id: String,
    },

    /// Delete a stored fact with its synthesis and lineage links
    Purge {
        /// Fact ID
        fact_id: String,
    },
}

/// Result of CLI command execution.
pub struct CliResult {
    /// Exit code (0 = success)
    pub exit_code: i32,
    /// Output written to stdout
    pub output: String,
}

impl CliResult {
    fn success(value: serde_json::Value) -> Self {
        Self {
            exit_code: 0,
            output: render(&value),
        }
    }

    /// A completed command whose outcome was unsuccessful.
    fn failure(value: serde_json::Value) -> Self {
        Self {
            exit_code: 1,
            output: render(&value),
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self::failure(json!({ "error": message.into() }))
    }
}

fn render(value: &serde_json::Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

/// Execute a CLI command.
pub async fn execute_command(command: Commands, ctx: Arc<AppContext>) -> CliResult {
    match command {
        Commands::Ask {
            query,
            split,
            progress,
        } => execute_ask(ctx, &query, split, progress).await,
        Commands::Batch { file } => execute_batch(ctx, &file).await,
        Commands::Fact { fact_id } => with_store(&ctx, |store| execute_fact(store, fact_id)).await,
        Commands::Facts {
            query_id,
            status,
            since,
            until,
        } => with_store(&ctx, |store| execute_facts(store, query_id, status, since, until)).await,
        Commands::Run { query_id } => with_store(&ctx, |store| execute_run(store, query_id)).await,
        Commands::Purge { fact_id } => with_store(&ctx, |store| execute_purge(store, fact_id)).await,
    }
}

async fn with_store<F, Fut>(ctx: &AppContext, f: F) -> CliResult
where
    F: FnOnce(Arc<dyn FactStore>) -> Fut,
    Fut: std::future::Future<Output = CliResult>,
{
    match &ctx.store {
        Some(store) => f(store.clone()).await,
        None => CliResult::error("Fact store is unavailable; check DATABASE_PATH"),
    }
}

async fn execute_ask(ctx: Arc<AppContext>, query: &str, split: bool, progress: bool) -> CliResult {
    let mut orchestrator = Orchestrator::new(ctx);
    if progress {
        orchestrator = orchestrator.with_progress(Arc::new(TracingProgressSink));
    }

    let queries = if split {
        decompose_query(query)
    } else {
        vec![query.to_string()]
    };

    if queries.len() == 1 {
        let report = orchestrator.run(&queries[0]).await;
        let completed = report.status == PipelineStatus::Completed;
        let value = serde_json::to_value(&report).unwrap_or_else(|e| json!({ "error": e.to_string() }));
        return if completed {
            CliResult::success(value)
        } else {
            CliResult::failure(value)
        };
    }

    info!(sub_queries = queries.len(), "Query split by ticker");
    reports_result(orchestrator.run_many(&queries).await)
}

async fn execute_batch(ctx: Arc<AppContext>, file: &std::path::Path) -> CliResult {
    let content = match tokio::fs::read_to_string(file).await {
        Ok(content) => content,
        Err(e) => return CliResult::error(format!("Failed to read {}: {}", file.display(), e)),
    };

    let queries: Vec<String> = content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect();
    if queries.is_empty() {
        return CliResult::error(format!("No queries in {}", file.display()));
    }

    info!(count = queries.len(), file = %file.display(), "Running batch");
    reports_result(Orchestrator::new(ctx).run_many(&queries).await)
}

fn reports_result(reports: Vec<crate::orchestrator::StatusReport>) -> CliResult {
    let completed = reports
        .iter()
        .filter(|r| r.status == PipelineStatus::Completed)
        .count();
    let value = json!({
        "total": reports.len(),
        "completed": completed,
        "reports": reports,
    });
    if completed == reports.len() {
        CliResult::success(value)
    } else {
        CliResult::failure(value)
    }
}

async fn execute_fact(store: Arc<dyn FactStore>, fact_id: String) -> CliResult {
    let fact = match store.get_fact(&fact_id).await {
        Ok(Some(fact)) => fact,
        Ok(None) => return CliResult::error(format!("Fact not found: {fact_id}")),
        Err(e) => return CliResult::error(e.to_string()),
    };

    let synthesis = match store.get_synthesis(&fact_id).await {
        Ok(synthesis) => synthesis,
        Err(e) => return CliResult::error(e.to_string()),
    };
    let lineage = match store.lineage_of(&fact_id).await {
        Ok(lineage) => lineage,
        Err(e) => return CliResult::error(e.to_string()),
    };

    CliResult::success(json!({
        "fact": fact,
        "synthesis": synthesis,
        "lineage": lineage,
    }))
}

async fn execute_facts(
    store: Arc<dyn FactStore>,
    query_id: Option<String>,
    status: Option<String>,
    since: Option<DateTime<Utc>>,
    until: Option<DateTime<Utc>>,
) -> CliResult {
    let result = match (query_id, status, since) {
        (Some(query_id), _, _) => store.facts_by_query(&query_id).await,
        (None, Some(status), _) => match status.parse::<FactStatus>() {
            Ok(status) => store.facts_by_status(status).await,
            Err(e) => return CliResult::error(e),
        },
        (None, None, Some(since)) => {
            store
                .facts_in_range(since, until.unwrap_or_else(Utc::now))
                .await
        }
        (None, None, None) => store.facts_by_status(FactStatus::Debated).await,
    };

    match result {
        Ok(facts) => CliResult::success(json!({ "count": facts.len(), "facts": facts })),
        Err(e) => CliResult::error(e.to_string()),
    }
}

async fn execute_run(store: Arc<dyn FactStore>, query_id: String) -> CliResult {
    match store.get_run(&query_id).await {
        Ok(Some(run)) => CliResult::success(json!({
            "query_id": run.query_id,
            "query": run.query,
            "status": run.status,
            "created_at": run.created_at,
            "report": run.report,
        })),
        Ok(None) => CliResult::error(format!("Run not found: {query_id}")),
        Err(e) => CliResult::error(e.to_string()),
    }
}

async fn execute_purge(store: Arc<dyn FactStore>, fact_id: String) -> CliResult {
    match store.purge_fact(&fact_id).await {
        Ok(true) => CliResult::success(json!({ "purged": fact_id })),
        Ok(false) => CliResult::error(format!("Fact not found: {fact_id}")),
        Err(e) => CliResult::error(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::storage::SqliteFactStore;

    async fn offline_context(dir: &tempfile::TempDir) -> AppContext {
        let mut config = Config::from_env_offline().unwrap();
        config.database.path = dir.path().join("cli.db");
        AppContext::from_config(&config, true).await.unwrap()
    }

    async fn context_with_store() -> (Arc<AppContext>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = offline_context(&dir).await;
        ctx.store = Some(Arc::new(SqliteFactStore::new_in_memory().await.unwrap()));
        (Arc::new(ctx), dir)
    }

    #[tokio::test]
    async fn test_missing_fact() {
        let (ctx, _dir) = context_with_store().await;
        let result = execute_command(
            Commands::Fact {
                fact_id: "nope".to_string(),
            },
            ctx,
        )
        .await;
        assert_eq!(result.exit_code, 1);
        assert!(result.output.contains("Fact not found: nope"));
    }

    #[tokio::test]
    async fn test_bad_status_filter() {
        let (ctx, _dir) = context_with_store().await;
        let result = execute_command(
            Commands::Facts {
                query_id: None,
                status: Some("bogus".to_string()),
                since: None,
                until: None,
            },
            ctx,
        )
        .await;
        assert_eq!(result.exit_code, 1);
    }

    #[tokio::test]
    async fn test_commands_without_store() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = offline_context(&dir).await;
        ctx.store = None;
        let result = execute_command(
            Commands::Run {
                query_id: "q".to_string(),
            },
            Arc::new(ctx),
        )
        .await;
        assert_eq!(result.exit_code, 1);
        assert!(result.output.contains("unavailable"));
    }

    #[tokio::test]
    async fn test_empty_batch_file() {
        let (ctx, _dir) = context_with_store().await;
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), "# comment only\n\n").unwrap();

        let result = execute_command(
            Commands::Batch {
                file: file.path().to_path_buf(),
            },
            ctx,
        )
        .await;
        assert_eq!(result.exit_code, 1);
        assert!(result.output.contains("No queries"));
    }
}
