//! # finverify
//!
//! Verified answers to financial questions. A question becomes a program,
//! the program runs in a sandbox, and only numbers that come out of a clean
//! run are reported. Each answer is then argued over by three analysts whose
//! agreement adjusts its confidence.
//!
//! ## Pipeline
//!
//! ```text
//! query → safety screen → PLAN → FETCH → EXECUTE → VALIDATE → DEBATE
//!                           │       │        │          │         │
//!                       generator  data   sandbox   truth gate  analysts
//!                                   │                              │
//!                            circuit breakers                SQLite (facts)
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use finverify::{AppContext, Config, Orchestrator};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env_offline()?;
//!     let ctx = Arc::new(AppContext::from_config(&config, true).await?);
//!     let report = Orchestrator::new(ctx).run("Sharpe ratio of AAPL in 2023").await;
//!     println!("{}", serde_json::to_string_pretty(&report)?);
//!     Ok(())
//! }
//! ```

/// Command-line commands.
pub mod cli;
/// Configuration from the environment.
pub mod config;
/// Shared application context.
pub mod context;
/// Market and economic data access.
pub mod data;
/// Multi-perspective debate and synthesis.
pub mod debate;
/// Error types and result aliases.
pub mod error;
/// Truth-boundary gate and verified facts.
pub mod gate;
/// Code generation and model clients.
pub mod llm;
/// Pipeline state machine.
pub mod orchestrator;
/// System prompts.
pub mod prompts;
/// Circuit breakers, retries and rate limiting.
pub mod resilience;
/// Pre-pipeline query screening.
pub mod safety;
/// Sandboxed code execution.
pub mod sandbox;
/// Fact persistence.
pub mod storage;

pub use config::Config;
pub use context::AppContext;
pub use error::{AppError, AppResult};
pub use orchestrator::{Orchestrator, StatusReport};
