use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use tracing::{debug, info};

use super::{FactStore, RunRecord};
use crate::config::DatabaseConfig;
use crate::debate::Synthesis;
use crate::error::{StorageError, StorageResult};
use crate::gate::{FactParts, FactStatus, VerifiedFact};

/// Static migrator that embeds migrations at compile time
static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Guard against cyclic lineage links.
const MAX_LINEAGE_DEPTH: i64 = 64;

const FACT_COLUMNS: &str = "fact_id, query_id, plan_id, code_hash, status, extracted_values, \
     execution_time_ms, memory_used_mb, created_at, error_message, confidence, source_code, derived_from";

/// SQLite-backed fact store
#[derive(Clone)]
pub struct SqliteFactStore {
    pool: SqlitePool,
}

impl SqliteFactStore {
    /// Create a new SQLite store
    pub async fn new(config: &DatabaseConfig) -> StorageResult<Self> {
        // Ensure parent directory exists
        if let Some(parent) = config.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::Connection {
                message: format!("Failed to create database directory: {}", e),
            })?;
        }

        let database_url = format!("sqlite://{}?mode=rwc", config.path.display());

        let options = SqliteConnectOptions::from_str(&database_url)
            .map_err(|e| StorageError::Connection {
                message: format!("Invalid database URL: {}", e),
            })?
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Connection {
                message: format!("Failed to connect to database: {}", e),
            })?;

        let store = Self { pool };
        store.run_migrations().await?;

        Ok(store)
    }

    /// Create a store backed by a private in-memory database
    pub async fn new_in_memory() -> StorageResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StorageError::Connection {
                message: format!("Invalid database URL: {}", e),
            })?
            .foreign_keys(true);

        // Every connection would open its own empty database
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Connection {
                message: format!("Failed to open in-memory database: {}", e),
            })?;

        let store = Self { pool };
        store.run_migrations().await?;

        Ok(store)
    }

    /// Run database migrations using embedded sqlx migrations
    async fn run_migrations(&self) -> StorageResult<()> {
        info!("Running database migrations...");

        MIGRATOR.run(&self.pool).await.map_err(|e| StorageError::Migration {
            message: format!("Failed to run migrations: {}", e),
        })?;

        info!("Database migrations completed successfully");
        Ok(())
    }

    /// Get the underlying pool for advanced queries
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn fact_exists(&self, fact_id: &str) -> StorageResult<bool> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM facts WHERE fact_id = ?")
            .bind(fact_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn fetch_facts(&self, sql: &str, bind: Vec<String>) -> StorageResult<Vec<VerifiedFact>> {
        let mut query = sqlx::query_as::<_, FactRow>(sql);
        for value in bind {
            query = query.bind(value);
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.into_iter().map(VerifiedFact::try_from).collect()
    }
}

/// Fixed-width UTC timestamps so text comparison orders correctly.
fn timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(s: &str) -> StorageResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StorageError::Query {
            message: format!("Corrupt timestamp '{}': {}", s, e),
        })
}

fn to_json<T: serde::Serialize>(value: &T) -> StorageResult<String> {
    serde_json::to_string(value).map_err(|e| StorageError::Query {
        message: format!("Failed to serialize: {}", e),
    })
}

#[async_trait]
impl FactStore for SqliteFactStore {
    async fn save_fact(&self, fact: &VerifiedFact) -> StorageResult<()> {
        let values = to_json(fact.extracted_values())?;

        let mut tx = self.pool.begin().await?;

        sqlx::query(&format!(
            "INSERT INTO facts ({FACT_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(fact_id) DO NOTHING"
        ))
        .bind(fact.fact_id())
        .bind(fact.query_id())
        .bind(fact.plan_id())
        .bind(fact.code_hash())
        .bind(fact.status().as_str())
        .bind(&values)
        .bind(fact.execution_time_ms() as i64)
        .bind(fact.memory_used_mb())
        .bind(timestamp(fact.created_at()))
        .bind(fact.error_message())
        .bind(fact.confidence())
        .bind(fact.source_code())
        .bind(fact.derived_from())
        .execute(&mut *tx)
        .await?;

        if let Some(parent_id) = fact.derived_from() {
            sqlx::query(
                r#"
                INSERT OR IGNORE INTO fact_lineage (child_id, parent_id, created_at)
                VALUES (?, ?, ?)
                "#,
            )
            .bind(fact.fact_id())
            .bind(parent_id)
            .bind(timestamp(Utc::now()))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        debug!(fact_id = %fact.fact_id(), status = %fact.status(), "Fact saved");
        Ok(())
    }

    async fn get_fact(&self, fact_id: &str) -> StorageResult<Option<VerifiedFact>> {
        let row: Option<FactRow> =
            sqlx::query_as(&format!("SELECT {FACT_COLUMNS} FROM facts WHERE fact_id = ?"))
                .bind(fact_id)
                .fetch_optional(&self.pool)
                .await?;

        row.map(VerifiedFact::try_from).transpose()
    }

    async fn facts_by_query(&self, query_id: &str) -> StorageResult<Vec<VerifiedFact>> {
        self.fetch_facts(
            &format!(
                "SELECT {FACT_COLUMNS} FROM facts WHERE query_id = ? ORDER BY created_at ASC"
            ),
            vec![query_id.to_string()],
        )
        .await
    }

    async fn facts_by_status(&self, status: FactStatus) -> StorageResult<Vec<VerifiedFact>> {
        self.fetch_facts(
            &format!("SELECT {FACT_COLUMNS} FROM facts WHERE status = ? ORDER BY created_at DESC"),
            vec![status.as_str().to_string()],
        )
        .await
    }

    async fn facts_in_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StorageResult<Vec<VerifiedFact>> {
        self.fetch_facts(
            &format!(
                "SELECT {FACT_COLUMNS} FROM facts \
                 WHERE created_at >= ? AND created_at <= ? ORDER BY created_at ASC"
            ),
            vec![timestamp(from), timestamp(to)],
        )
        .await
    }

    async fn purge_fact(&self, fact_id: &str) -> StorageResult<bool> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM syntheses WHERE fact_id = ?")
            .bind(fact_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM fact_lineage WHERE child_id = ? OR parent_id = ?")
            .bind(fact_id)
            .bind(fact_id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM facts WHERE fact_id = ?")
            .bind(fact_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        let removed = result.rows_affected() > 0;
        if removed {
            info!(fact_id = %fact_id, "Fact purged");
        }
        Ok(removed)
    }

    async fn save_synthesis(&self, fact_id: &str, synthesis: &Synthesis) -> StorageResult<()> {
        if !self.fact_exists(fact_id).await? {
            return Err(StorageError::FactNotFound {
                fact_id: fact_id.to_string(),
            });
        }

        sqlx::query(
            r#"
            INSERT INTO syntheses (fact_id, synthesis, adjusted_confidence, quality_score, created_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(fact_id) DO UPDATE SET
                synthesis = excluded.synthesis,
                adjusted_confidence = excluded.adjusted_confidence,
                quality_score = excluded.quality_score,
                created_at = excluded.created_at
            "#,
        )
        .bind(fact_id)
        .bind(to_json(synthesis)?)
        .bind(synthesis.adjusted_confidence)
        .bind(synthesis.quality_score)
        .bind(timestamp(Utc::now()))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_synthesis(&self, fact_id: &str) -> StorageResult<Option<Synthesis>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT synthesis FROM syntheses WHERE fact_id = ?")
                .bind(fact_id)
                .fetch_optional(&self.pool)
                .await?;

        row.map(|(json,)| {
            serde_json::from_str(&json).map_err(|e| StorageError::Query {
                message: format!("Corrupt synthesis for {}: {}", fact_id, e),
            })
        })
        .transpose()
    }

    async fn link_derivation(&self, child_id: &str, parent_id: &str) -> StorageResult<()> {
        for id in [child_id, parent_id] {
            if !self.fact_exists(id).await? {
                return Err(StorageError::FactNotFound {
                    fact_id: id.to_string(),
                });
            }
        }

        sqlx::query(
            r#"
            INSERT OR IGNORE INTO fact_lineage (child_id, parent_id, created_at)
            VALUES (?, ?, ?)
            "#,
        )
        .bind(child_id)
        .bind(parent_id)
        .bind(timestamp(Utc::now()))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn lineage_of(&self, fact_id: &str) -> StorageResult<Vec<VerifiedFact>> {
        let columns = FACT_COLUMNS
            .split(", ")
            .map(|c| format!("f.{}", c.trim()))
            .collect::<Vec<_>>()
            .join(", ");

        let rows: Vec<FactRow> = sqlx::query_as(&format!(
            r#"
            WITH RECURSIVE ancestors(id, depth) AS (
                SELECT parent_id, 1 FROM fact_lineage WHERE child_id = ?
                UNION
                SELECT l.parent_id, a.depth + 1
                FROM fact_lineage l JOIN ancestors a ON l.child_id = a.id
                WHERE a.depth < ?
            )
            SELECT {columns}
            FROM facts f JOIN (SELECT id, MIN(depth) AS depth FROM ancestors GROUP BY id) a
                ON f.fact_id = a.id
            ORDER BY a.depth ASC
            "#
        ))
        .bind(fact_id)
        .bind(MAX_LINEAGE_DEPTH)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(VerifiedFact::try_from).collect()
    }

    async fn save_run(&self, run: &RunRecord) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO pipeline_runs (query_id, query, status, report, created_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(query_id) DO UPDATE SET
                status = excluded.status,
                report = excluded.report,
                created_at = excluded.created_at
            "#,
        )
        .bind(&run.query_id)
        .bind(&run.query)
        .bind(&run.status)
        .bind(to_json(&run.report)?)
        .bind(timestamp(run.created_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_run(&self, query_id: &str) -> StorageResult<Option<RunRecord>> {
        let row: Option<RunRow> = sqlx::query_as(
            r#"
            SELECT query_id, query, status, report, created_at
            FROM pipeline_runs
            WHERE query_id = ?
            "#,
        )
        .bind(query_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(RunRecord::try_from).transpose()
    }
}

// Internal row types for SQLx mapping
#[derive(sqlx::FromRow)]
struct FactRow {
    fact_id: String,
    query_id: String,
    plan_id: String,
    code_hash: String,
    status: String,
    extracted_values: String,
    execution_time_ms: i64,
    memory_used_mb: Option<f64>,
    created_at: String,
    error_message: Option<String>,
    confidence: Option<f64>,
    source_code: Option<String>,
    derived_from: Option<String>,
}

impl TryFrom<FactRow> for VerifiedFact {
    type Error = StorageError;

    fn try_from(row: FactRow) -> Result<Self, Self::Error> {
        let status = FactStatus::from_str(&row.status)
            .map_err(|message| StorageError::Query { message })?;
        let extracted_values =
            serde_json::from_str(&row.extracted_values).map_err(|e| StorageError::Query {
                message: format!("Corrupt values for fact {}: {}", row.fact_id, e),
            })?;

        Ok(VerifiedFact::restore(FactParts {
            fact_id: row.fact_id,
            query_id: row.query_id,
            plan_id: row.plan_id,
            code_hash: row.code_hash,
            status,
            extracted_values,
            execution_time_ms: row.execution_time_ms.max(0) as u64,
            memory_used_mb: row.memory_used_mb,
            created_at: parse_timestamp(&row.created_at)?,
            error_message: row.error_message,
            confidence: row.confidence,
            source_code: row.source_code,
            derived_from: row.derived_from,
        }))
    }
}

#[derive(sqlx::FromRow)]
struct RunRow {
    query_id: String,
    query: String,
    status: String,
    report: String,
    created_at: String,
}

impl TryFrom<RunRow> for RunRecord {
    type Error = StorageError;

    fn try_from(row: RunRow) -> Result<Self, Self::Error> {
        let report = serde_json::from_str(&row.report).map_err(|e| StorageError::Query {
            message: format!("Corrupt report for run {}: {}", row.query_id, e),
        })?;
        let created_at = parse_timestamp(&row.created_at)?;

        Ok(Self {
            query_id: row.query_id,
            query: row.query,
            status: row.status,
            report,
            created_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamps_sort_as_text() {
        let later = DateTime::parse_from_rfc3339("2026-01-01T00:00:01.5Z")
            .unwrap()
            .with_timezone(&Utc);
        let earlier = DateTime::parse_from_rfc3339("2026-01-01T00:00:01.45Z")
            .unwrap()
            .with_timezone(&Utc);
        assert!(timestamp(earlier) < timestamp(later));
        assert_eq!(timestamp(later), "2026-01-01T00:00:01.500000Z");
    }

    #[test]
    fn test_parse_timestamp_round_trip() {
        let now = Utc::now();
        let parsed = parse_timestamp(&timestamp(now)).unwrap();
        assert_eq!(parsed.timestamp_micros(), now.timestamp_micros());
    }

    #[test]
    fn test_parse_timestamp_rejects_garbage() {
        let err = parse_timestamp("yesterday").unwrap_err();
        assert!(matches!(err, StorageError::Query { .. }));
        assert!(err.to_string().contains("yesterday"));
    }

    #[tokio::test]
    async fn test_corrupt_run_row_is_an_error() {
        let store = SqliteFactStore::new_in_memory().await.unwrap();
        sqlx::query(
            "INSERT INTO pipeline_runs (query_id, query, status, report, created_at) \
             VALUES ('q-bad-report', 'q', 'completed', 'not json', '2026-01-01T00:00:00.000000Z'), \
                    ('q-bad-time', 'q', 'completed', '{}', 'not a time')",
        )
        .execute(store.pool())
        .await
        .unwrap();

        let err = store.get_run("q-bad-report").await.unwrap_err();
        assert!(err.to_string().contains("Corrupt report for run q-bad-report"));
        let err = store.get_run("q-bad-time").await.unwrap_err();
        assert!(err.to_string().contains("Corrupt timestamp 'not a time'"));
    }

    #[tokio::test]
    async fn test_corrupt_fact_timestamp_is_an_error() {
        let store = SqliteFactStore::new_in_memory().await.unwrap();
        sqlx::query(
            "INSERT INTO facts (fact_id, query_id, plan_id, code_hash, status, \
             extracted_values, execution_time_ms, created_at) \
             VALUES ('f-1', 'q-1', 'p-1', 'abc', 'verified', '{}', 10, '')",
        )
        .execute(store.pool())
        .await
        .unwrap();

        let err = store.get_fact("f-1").await.unwrap_err();
        assert!(matches!(err, StorageError::Query { .. }));
    }

    #[tokio::test]
    async fn test_in_memory_store_migrates() {
        let store = SqliteFactStore::new_in_memory().await.unwrap();
        let tables: Vec<(String,)> =
            sqlx::query_as("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
                .fetch_all(store.pool())
                .await
                .unwrap();
        let names: Vec<&str> = tables.iter().map(|(n,)| n.as_str()).collect();
        for table in ["fact_lineage", "facts", "pipeline_runs", "syntheses"] {
            assert!(names.contains(&table), "missing table {table}");
        }
    }
}
