use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use super::preamble::{build_script, ScriptPolicy};
use super::runner::run_child;
use super::{ExecutionResult, Sandbox};
use crate::config::SandboxConfig;
use crate::error::SandboxResult;

const RUNTIME: &str = "process";
const SAFE_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Runs each program as a local interpreter process under `ulimit`.
///
/// Intended for development hosts without a container runtime. Isolation is
/// weaker than [`super::DockerSandbox`]: the environment is cleared, virtual
/// memory and CPU time are capped, and the preamble blocks subprocess and
/// socket APIs, but the filesystem is the host's.
#[derive(Debug, Clone)]
pub struct ProcessSandbox {
    config: SandboxConfig,
}

impl ProcessSandbox {
    /// Create a local-process sandbox.
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    fn shell_command(&self, timeout: Duration) -> String {
        let memory_kb = self.config.memory_mb.saturating_mul(1024);
        let cpu_secs = timeout.as_secs().saturating_add(1);
        format!(
            "ulimit -v {memory_kb} 2>/dev/null; ulimit -t {cpu_secs} 2>/dev/null; exec {} -I -",
            self.config.python
        )
    }
}

#[async_trait]
impl Sandbox for ProcessSandbox {
    fn runtime_name(&self) -> &'static str {
        RUNTIME
    }

    async fn execute(
        &self,
        code: &str,
        timeout: Duration,
        allow_subprocess: bool,
    ) -> SandboxResult<ExecutionResult> {
        let script = build_script(
            code,
            ScriptPolicy {
                allow_subprocess,
                allow_network: self.config.allow_network,
            },
        );

        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(self.shell_command(timeout))
            .env_clear()
            .env("PATH", SAFE_PATH)
            .env("PYTHONDONTWRITEBYTECODE", "1")
            .env("PYTHONIOENCODING", "utf-8")
            .current_dir(std::env::temp_dir());

        info!(
            runtime = RUNTIME,
            timeout_ms = timeout.as_millis() as u64,
            "Starting sandboxed execution"
        );

        let capture = run_child(
            command,
            script,
            timeout,
            self.config.max_output_bytes,
            RUNTIME,
        )
        .await?;

        let result = ExecutionResult::from_capture(code, capture);
        debug!(
            status = %result.status(),
            exit_code = result.exit_code(),
            duration_ms = result.duration_ms(),
            source_verified = result.source_verified(),
            "Sandboxed execution finished"
        );
        Ok(result)
    }
}
