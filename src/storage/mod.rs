//! Durable storage for verified facts, syntheses and pipeline runs.
//!
//! The pipeline treats persistence as best-effort: a failed write is
//! logged by the orchestrator, never turned into a query failure.

mod sqlite;

pub use sqlite::SqliteFactStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::debate::Synthesis;
use crate::error::StorageResult;
use crate::gate::{FactStatus, VerifiedFact};

/// Terminal record of one pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub query_id: String,
    pub query: String,
    /// Terminal status name (`completed`, `failed`, `refused`)
    pub status: String,
    /// Full status report as JSON
    pub report: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl RunRecord {
    pub fn new(
        query_id: impl Into<String>,
        query: impl Into<String>,
        status: impl Into<String>,
        report: serde_json::Value,
    ) -> Self {
        Self {
            query_id: query_id.into(),
            query: query.into(),
            status: status.into(),
            report,
            created_at: Utc::now(),
        }
    }
}

/// Fact and lineage persistence.
#[async_trait]
pub trait FactStore: Send + Sync {
    // Facts

    /// Store a fact. Saving the same fact twice is a no-op.
    async fn save_fact(&self, fact: &VerifiedFact) -> StorageResult<()>;
    /// Get a fact by ID.
    async fn get_fact(&self, fact_id: &str) -> StorageResult<Option<VerifiedFact>>;
    /// All facts produced for a query, oldest first.
    async fn facts_by_query(&self, query_id: &str) -> StorageResult<Vec<VerifiedFact>>;
    /// All facts with a given status, newest first.
    async fn facts_by_status(&self, status: FactStatus) -> StorageResult<Vec<VerifiedFact>>;
    /// Facts created within `[from, to]`, oldest first.
    async fn facts_in_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StorageResult<Vec<VerifiedFact>>;
    /// Remove a fact with its synthesis and lineage links.
    ///
    /// Returns whether a fact was removed.
    async fn purge_fact(&self, fact_id: &str) -> StorageResult<bool>;

    // Syntheses

    /// Store the synthesis that produced a fact's confidence.
    async fn save_synthesis(&self, fact_id: &str, synthesis: &Synthesis) -> StorageResult<()>;
    /// Get the synthesis attached to a fact.
    async fn get_synthesis(&self, fact_id: &str) -> StorageResult<Option<Synthesis>>;

    // Lineage

    /// Record that `child_id` derives from `parent_id`. Both must exist.
    async fn link_derivation(&self, child_id: &str, parent_id: &str) -> StorageResult<()>;
    /// Ancestors of a fact, nearest first.
    async fn lineage_of(&self, fact_id: &str) -> StorageResult<Vec<VerifiedFact>>;

    // Runs

    /// Store a run's terminal report, replacing an earlier one for the query.
    async fn save_run(&self, run: &RunRecord) -> StorageResult<()>;
    /// Get a run by query ID.
    async fn get_run(&self, query_id: &str) -> StorageResult<Option<RunRecord>>;
}
