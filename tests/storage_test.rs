//! Integration tests for the SQLite fact store
//!
//! Facts are produced the way the pipeline produces them: a captured run
//! passes through the truth gate, and debated facts come out of the debate
//! protocol.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;

use finverify::config::{CircuitBreakerConfig, DatabaseConfig};
use finverify::debate::{DebateProtocol, LocalAnalysisProvider};
use finverify::error::StorageError;
use finverify::gate::{create_verified_fact, FactStatus, TruthGate, VerifiedFact};
use finverify::resilience::SharedBreaker;
use finverify::sandbox::{ExecutionResult, RawCapture};
use finverify::storage::{FactStore, RunRecord, SqliteFactStore};

/// Create an in-memory store for testing
async fn create_test_store() -> SqliteFactStore {
    SqliteFactStore::new_in_memory()
        .await
        .expect("Failed to create in-memory store")
}

/// Gate-verified fact for `query_id` from a program printing `stdout`
fn verified_fact(query_id: &str, stdout: &str) -> VerifiedFact {
    let code = format!("print('''{stdout}''')");
    let execution = ExecutionResult::from_capture(
        &code,
        RawCapture {
            exit_code: 0,
            stdout: stdout.to_string(),
            stderr: String::new(),
            duration: Duration::from_millis(85),
            peak_memory_kb: Some(30_720),
            timed_out: false,
            truncated: false,
        },
    );
    let validation = TruthGate::new().validate(&execution);
    create_verified_fact(&validation, query_id, "plan-1").expect("gate should accept output")
}

fn debate() -> DebateProtocol {
    DebateProtocol::new(
        Arc::new(LocalAnalysisProvider::new()),
        SharedBreaker::new("llm", CircuitBreakerConfig::default()),
    )
}

#[cfg(test)]
mod fact_tests {
    use super::*;

    #[tokio::test]
    async fn test_save_and_get_fact() {
        let store = create_test_store().await;
        let fact = verified_fact("q-1", r#"{"sharpe_ratio": 1.42, "sample_size": 250}"#);

        store.save_fact(&fact).await.unwrap();
        let loaded = store.get_fact(fact.fact_id()).await.unwrap().unwrap();

        assert_eq!(loaded.fact_id(), fact.fact_id());
        assert_eq!(loaded.query_id(), "q-1");
        assert_eq!(loaded.code_hash(), fact.code_hash());
        assert_eq!(loaded.status(), FactStatus::Verified);
        assert_eq!(loaded.number("sharpe_ratio"), Some(1.42));
        assert_eq!(loaded.extracted_values(), fact.extracted_values());
    }

    #[tokio::test]
    async fn test_get_missing_fact() {
        let store = create_test_store().await;
        assert!(store.get_fact("nonexistent").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_is_idempotent() {
        let store = create_test_store().await;
        let fact = verified_fact("q-1", "x: 1");

        store.save_fact(&fact).await.unwrap();
        store.save_fact(&fact).await.unwrap();

        assert_eq!(store.facts_by_query("q-1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_facts_by_query_oldest_first() {
        let store = create_test_store().await;
        let first = verified_fact("q-1", "x: 1");
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = verified_fact("q-1", "x: 2");
        let other = verified_fact("q-2", "x: 3");

        store.save_fact(&second).await.unwrap();
        store.save_fact(&first).await.unwrap();
        store.save_fact(&other).await.unwrap();

        let facts = store.facts_by_query("q-1").await.unwrap();
        let ids: Vec<&str> = facts.iter().map(|f| f.fact_id()).collect();
        assert_eq!(ids, vec![first.fact_id(), second.fact_id()]);
    }

    #[tokio::test]
    async fn test_facts_in_range() {
        let store = create_test_store().await;
        let before = Utc::now();
        let fact = verified_fact("q-1", "x: 1");
        store.save_fact(&fact).await.unwrap();
        let after = Utc::now();

        assert_eq!(store.facts_in_range(before, after).await.unwrap().len(), 1);
        assert!(store
            .facts_in_range(after + chrono::Duration::seconds(1), after + chrono::Duration::hours(1))
            .await
            .unwrap()
            .is_empty());
    }
}

#[cfg(test)]
mod debate_tests {
    use super::*;

    #[tokio::test]
    async fn test_debated_fact_lineage_and_synthesis() {
        let store = create_test_store().await;
        let fact = verified_fact("q-1", r#"{"correlation": 0.82, "p_value": 0.001, "sample_size": 250}"#);
        let outcome = debate().run(&fact, "Correlation of NVDA and AMD").await;

        store.save_fact(&fact).await.unwrap();
        store.save_fact(&outcome.fact).await.unwrap();
        store
            .save_synthesis(outcome.fact.fact_id(), &outcome.synthesis)
            .await
            .unwrap();

        let debated = store.facts_by_status(FactStatus::Debated).await.unwrap();
        assert_eq!(debated.len(), 1);
        assert_eq!(debated[0].derived_from(), Some(fact.fact_id()));

        let lineage = store.lineage_of(outcome.fact.fact_id()).await.unwrap();
        assert_eq!(lineage.len(), 1);
        assert_eq!(lineage[0].fact_id(), fact.fact_id());

        let synthesis = store
            .get_synthesis(outcome.fact.fact_id())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(synthesis.adjusted_confidence, outcome.synthesis.adjusted_confidence);
        assert_eq!(synthesis.narrative, outcome.synthesis.narrative);
    }

    #[tokio::test]
    async fn test_purge_removes_synthesis() {
        let store = create_test_store().await;
        let fact = verified_fact("q-1", "x: 1");
        let outcome = debate().run(&fact, "x").await;

        store.save_fact(&fact).await.unwrap();
        store.save_fact(&outcome.fact).await.unwrap();
        store
            .save_synthesis(outcome.fact.fact_id(), &outcome.synthesis)
            .await
            .unwrap();

        assert!(store.purge_fact(outcome.fact.fact_id()).await.unwrap());
        assert!(store.get_fact(outcome.fact.fact_id()).await.unwrap().is_none());
        assert!(store
            .get_synthesis(outcome.fact.fact_id())
            .await
            .unwrap()
            .is_none());
        assert!(!store.purge_fact(outcome.fact.fact_id()).await.unwrap());

        // The parent survives
        assert!(store.get_fact(fact.fact_id()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_link_requires_both_facts() {
        let store = create_test_store().await;
        let fact = verified_fact("q-1", "x: 1");
        store.save_fact(&fact).await.unwrap();

        let result = store.link_derivation(fact.fact_id(), "missing").await;
        assert!(matches!(result, Err(StorageError::FactNotFound { .. })));
    }
}

#[cfg(test)]
mod run_tests {
    use super::*;

    #[tokio::test]
    async fn test_save_run_replaces_previous() {
        let store = create_test_store().await;

        store
            .save_run(&RunRecord::new("q-1", "Sharpe of AAPL", "failed", json!({"error_count": 1})))
            .await
            .unwrap();
        store
            .save_run(&RunRecord::new("q-1", "Sharpe of AAPL", "completed", json!({"error_count": 0})))
            .await
            .unwrap();

        let run = store.get_run("q-1").await.unwrap().unwrap();
        assert_eq!(run.status, "completed");
        assert_eq!(run.report["error_count"], 0);
        assert!(store.get_run("q-2").await.unwrap().is_none());
    }
}

#[cfg(test)]
mod file_tests {
    use super::*;

    #[tokio::test]
    async fn test_file_store_persists_across_connections() {
        let dir = tempfile::tempdir().unwrap();
        let config = DatabaseConfig {
            path: dir.path().join("nested").join("facts.db"),
            max_connections: 2,
        };
        let fact = verified_fact("q-1", "x: 1");

        {
            let store = SqliteFactStore::new(&config).await.unwrap();
            store.save_fact(&fact).await.unwrap();
            store.pool().close().await;
        }

        let store = SqliteFactStore::new(&config).await.unwrap();
        let loaded = store.get_fact(fact.fact_id()).await.unwrap();
        assert!(loaded.is_some());
    }
}
