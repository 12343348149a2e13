use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};
use uuid::Uuid;

use super::preamble::{build_script, ScriptPolicy};
use super::runner::run_child;
use super::{ExecutionResult, Sandbox};
use crate::config::SandboxConfig;
use crate::error::SandboxResult;

const RUNTIME: &str = "docker";
const PIDS_LIMIT: u32 = 64;

/// Runs each program in a fresh, locked-down container.
///
/// The container has a read-only root, a small writable `/tmp`, no network
/// (unless configured), no capabilities, no privilege escalation, and CPU,
/// memory and process-count caps. It is force-removed if the run is
/// abandoned.
#[derive(Debug, Clone)]
pub struct DockerSandbox {
    config: SandboxConfig,
    binary: String,
}

impl DockerSandbox {
    /// Create a docker-backed sandbox.
    pub fn new(config: SandboxConfig) -> Self {
        Self {
            config,
            binary: "docker".to_string(),
        }
    }

    /// Use a different container CLI (e.g. `podman`).
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    fn container_args(&self, name: &str) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "-i".to_string(),
            "--name".to_string(),
            name.to_string(),
            "--read-only".to_string(),
            "--tmpfs".to_string(),
            "/tmp:rw,noexec,nosuid,size=64m".to_string(),
        ];
        if !self.config.allow_network {
            args.push("--network=none".to_string());
        }
        args.extend([
            "--memory".to_string(),
            format!("{}m", self.config.memory_mb),
            "--memory-swap".to_string(),
            format!("{}m", self.config.memory_mb),
            "--cpus".to_string(),
            format!("{}", self.config.cpus),
            "--pids-limit".to_string(),
            PIDS_LIMIT.to_string(),
            "--cap-drop".to_string(),
            "ALL".to_string(),
            "--security-opt".to_string(),
            "no-new-privileges".to_string(),
            "--user".to_string(),
            "65534:65534".to_string(),
            "--workdir".to_string(),
            "/tmp".to_string(),
            self.config.image.clone(),
            self.config.python.clone(),
            "-I".to_string(),
            "-".to_string(),
        ]);
        args
    }
}

#[async_trait]
impl Sandbox for DockerSandbox {
    fn runtime_name(&self) -> &'static str {
        RUNTIME
    }

    async fn execute(
        &self,
        code: &str,
        timeout: Duration,
        allow_subprocess: bool,
    ) -> SandboxResult<ExecutionResult> {
        let name = format!("finverify-{}", Uuid::new_v4());
        let script = build_script(
            code,
            ScriptPolicy {
                allow_subprocess,
                allow_network: self.config.allow_network,
            },
        );

        let mut command = Command::new(&self.binary);
        command.args(self.container_args(&name));

        info!(
            runtime = RUNTIME,
            container = %name,
            image = %self.config.image,
            timeout_ms = timeout.as_millis() as u64,
            "Starting sandboxed execution"
        );

        let mut guard = ContainerGuard::new(self.binary.clone(), name);
        let capture = run_child(
            command,
            script,
            timeout,
            self.config.max_output_bytes,
            RUNTIME,
        )
        .await?;

        if !capture.timed_out {
            guard.disarm();
        }

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

/// Removes the container when a run is abandoned or times out.
///
/// Killing the CLI client does not stop the container itself.
struct ContainerGuard {
    binary: String,
    name: String,
    armed: bool,
}

impl ContainerGuard {
    fn new(binary: String, name: String) -> Self {
        Self {
            binary,
            name,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let binary = std::mem::take(&mut self.binary);
        let name = std::mem::take(&mut self.name);
        debug!(container = %name, "Force-removing sandbox container");

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let _ = Command::new(&binary)
                        .args(["rm", "-f", name.as_str()])
                        .output()
                        .await;
                });
            }
            Err(_) => {
                let _ = std::process::Command::new(&binary)
                    .args(["rm", "-f", name.as_str()])
                    .output();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_is_locked_down() {
        let sandbox = DockerSandbox::new(SandboxConfig::default());
        let args = sandbox.container_args("finverify-test");

        assert!(args.contains(&"--read-only".to_string()));
        assert!(args.contains(&"--network=none".to_string()));
        assert!(args.contains(&"no-new-privileges".to_string()));
        assert!(args.windows(2).any(|w| w[0] == "--cap-drop" && w[1] == "ALL"));
        assert!(args.windows(2).any(|w| w[0] == "--memory" && w[1] == "512m"));
        assert!(args.windows(2).any(|w| w[0] == "--cpus" && w[1] == "1"));
        assert_eq!(args.last().map(String::as_str), Some("-"));
    }

    #[test]
    fn test_network_flag_omitted_when_allowed() {
        let config = SandboxConfig {
            allow_network: true,
            ..SandboxConfig::default()
        };
        let args = DockerSandbox::new(config).container_args("c");
        assert!(!args.iter().any(|a| a.starts_with("--network")));
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_error() {
        let sandbox =
            DockerSandbox::new(SandboxConfig::default()).with_binary("/nonexistent/docker-cli");
        let err = sandbox
            .execute("print(1)", Duration::from_secs(1), false)
            .await
            .unwrap_err();
        assert!(matches!(err, crate::error::SandboxError::Spawn { .. }));
    }
}
