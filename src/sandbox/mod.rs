//! Sandboxed execution of generated code.
//!
//! Every number the system reports comes out of an [`ExecutionResult`]. The
//! result's flags are computed here from the captured output and cannot be
//! set by callers; [`ExecutionResult::source_verified`] is the single value
//! the truth-boundary gate trusts.
//!
//! Two runtimes implement [`Sandbox`]:
//! - [`DockerSandbox`]: read-only, network-less container with CPU/memory caps
//! - [`ProcessSandbox`]: local interpreter under `ulimit`, for development

mod docker;
mod preamble;
mod process;
mod runner;

pub use docker::DockerSandbox;
pub use process::ProcessSandbox;
pub use runner::RawCapture;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::SandboxResult;

/// Substrings that mark a run as errored.
const ERROR_SIGNATURES: &[&str] = &["Traceback", "Exception", "Error"];

/// Substrings that mark output as unsafe to parse.
///
/// Truth-value ambiguity errors from numeric libraries print partial output
/// before failing; a naive parser would read the partial numbers as results.
const AMBIGUITY_SIGNATURES: &[&str] = &["ambiguous", "ValueError", "TypeError", "KeyError", "IndexError"];

/// Terminal status of one sandboxed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Success,
    Error,
    Timeout,
}

impl ExecutionStatus {
    /// Convert to string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Success => "success",
            ExecutionStatus::Error => "error",
            ExecutionStatus::Timeout => "timeout",
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Immutable record of one sandboxed run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionResult {
    status: ExecutionStatus,
    exit_code: i32,
    stdout: String,
    stderr: String,
    duration_ms: u64,
    peak_memory_mb: Option<f64>,
    code_hash: String,
    code: String,
    source_verified: bool,
    error_detected: bool,
    ambiguity_detected: bool,
    output_truncated: bool,
    executed_at: DateTime<Utc>,
}

impl ExecutionResult {
    /// Build a result from a raw capture, deriving status and flags.
    pub fn from_capture(code: &str, capture: RawCapture) -> Self {
        let status = if capture.timed_out {
            ExecutionStatus::Timeout
        } else if capture.exit_code != 0 {
            ExecutionStatus::Error
        } else {
            ExecutionStatus::Success
        };

        let error_detected = capture.exit_code != 0
            || contains_any(&capture.stdout, ERROR_SIGNATURES)
            || contains_any(&capture.stderr, ERROR_SIGNATURES);
        let ambiguity_detected = contains_any(&capture.stdout, AMBIGUITY_SIGNATURES)
            || contains_any(&capture.stderr, AMBIGUITY_SIGNATURES);

        let source_verified = capture.exit_code == 0
            && !error_detected
            && !ambiguity_detected
            && status == ExecutionStatus::Success;

        Self {
            status,
            exit_code: capture.exit_code,
            stdout: capture.stdout,
            stderr: capture.stderr,
            duration_ms: capture.duration.as_millis() as u64,
            peak_memory_mb: capture.peak_memory_kb.map(|kb| kb as f64 / 1024.0),
            code_hash: code_hash(code),
            code: code.to_string(),
            source_verified,
            error_detected,
            ambiguity_detected,
            output_truncated: capture.truncated,
            executed_at: Utc::now(),
        }
    }

    /// Run status.
    pub fn status(&self) -> ExecutionStatus {
        self.status
    }

    /// Process exit code (-1 when killed).
    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }

    /// Captured standard output.
    pub fn stdout(&self) -> &str {
        &self.stdout
    }

    /// Captured standard error.
    pub fn stderr(&self) -> &str {
        &self.stderr
    }

    /// Wall-clock duration in milliseconds.
    pub fn duration_ms(&self) -> u64 {
        self.duration_ms
    }

    /// Peak resident memory, when the runtime reported it.
    pub fn peak_memory_mb(&self) -> Option<f64> {
        self.peak_memory_mb
    }

    /// SHA-256 of the executed code.
    pub fn code_hash(&self) -> &str {
        &self.code_hash
    }

    /// The executed code.
    pub fn code(&self) -> &str {
        &self.code
    }

    /// Successful, error-free, unambiguous run.
    pub fn source_verified(&self) -> bool {
        self.source_verified
    }

    /// Non-zero exit or error tokens in the output.
    pub fn error_detected(&self) -> bool {
        self.error_detected
    }

    /// Ambiguity signatures in the output.
    pub fn ambiguity_detected(&self) -> bool {
        self.ambiguity_detected
    }

    /// Whether output exceeded the capture limit.
    pub fn output_truncated(&self) -> bool {
        self.output_truncated
    }

    /// When the run finished.
    pub fn executed_at(&self) -> DateTime<Utc> {
        self.executed_at
    }

    /// Human-readable failure description for non-successful runs.
    pub fn error_text(&self) -> Option<String> {
        match self.status {
            ExecutionStatus::Timeout => Some(format!(
                "execution timed out after {}ms",
                self.duration_ms
            )),
            ExecutionStatus::Error => {
                let tail = last_lines(&self.stderr, 5);
                if tail.is_empty() {
                    Some(format!("process exited with code {}", self.exit_code))
                } else {
                    Some(tail)
                }
            }
            ExecutionStatus::Success => None,
        }
    }
}

/// Hex-encoded SHA-256 of a code string.
pub fn code_hash(code: &str) -> String {
    hex::encode(Sha256::digest(code.as_bytes()))
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

fn last_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}

/// Isolated runtime for untrusted code.
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Runtime name for logs and audit.
    fn runtime_name(&self) -> &'static str;

    /// Run `code` with a wall-clock limit.
    ///
    /// A program that fails is still `Ok`; `Err` means the sandbox itself
    /// could not run. The underlying process is gone when this returns or
    /// when the returned future is dropped.
    async fn execute(
        &self,
        code: &str,
        timeout: Duration,
        allow_subprocess: bool,
    ) -> SandboxResult<ExecutionResult>;
}
