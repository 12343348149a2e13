//! Child-process plumbing shared by the sandbox runtimes.

use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::preamble::take_peak_memory;
use crate::error::{SandboxError, SandboxResult};

const READER_GRACE: Duration = Duration::from_millis(500);

/// Raw outcome of one child process, before flag analysis.
#[derive(Debug, Clone, PartialEq)]
pub struct RawCapture {
    /// Exit code, -1 when the process was killed
    pub exit_code: i32,
    /// Standard output (lossy UTF-8)
    pub stdout: String,
    /// Standard error with the memory sentinel removed
    pub stderr: String,
    /// Wall-clock time
    pub duration: Duration,
    /// Peak RSS reported by the program
    pub peak_memory_kb: Option<u64>,
    /// Killed at the wall-clock limit
    pub timed_out: bool,
    /// Output exceeded the capture limit
    pub truncated: bool,
}

/// Spawn `command`, feed `script` on stdin, and collect bounded output.
///
/// On timeout the child is killed and reaped before returning. The command
/// is spawned with `kill_on_drop`, so dropping this future also kills it.
pub(crate) async fn run_child(
    mut command: Command,
    script: String,
    timeout: Duration,
    max_output_bytes: usize,
    runtime: &str,
) -> SandboxResult<RawCapture> {
    command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let start = Instant::now();
    let mut child = command.spawn().map_err(|e| SandboxError::Spawn {
        runtime: runtime.to_string(),
        message: e.to_string(),
    })?;

    if let Some(mut stdin) = child.stdin.take() {
        // The interpreter reads the whole program before running it
        if let Err(e) = stdin.write_all(script.as_bytes()).await {
            debug!(error = %e, "Child closed stdin early");
        }
        drop(stdin);
    }

    let stdout = child.stdout.take().map(|out| tokio::spawn(read_capped(out, max_output_bytes)));
    let stderr = child.stderr.take().map(|err| tokio::spawn(read_capped(err, max_output_bytes)));

    let (exit_code, timed_out) = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => (status.code().unwrap_or(-1), false),
        Ok(Err(e)) => return Err(SandboxError::Io(e)),
        Err(_) => {
            warn!(
                runtime = %runtime,
                timeout_ms = timeout.as_millis() as u64,
                "Sandboxed program exceeded wall-clock limit, killing"
            );
            if let Err(e) = child.kill().await {
                warn!(error = %e, "Failed to kill sandboxed program");
            }
            (-1, true)
        }
    };
    let duration = start.elapsed();

    // Grandchildren of a killed program can hold the pipes open
    let grace = timed_out.then_some(READER_GRACE);
    let (stdout, out_truncated) = join_reader(stdout, grace).await;
    let (stderr, err_truncated) = join_reader(stderr, grace).await;
    let (stderr, peak_memory_kb) = take_peak_memory(&stderr);

    Ok(RawCapture {
        exit_code,
        stdout,
        stderr,
        duration,
        peak_memory_kb,
        timed_out,
        truncated: out_truncated || err_truncated,
    })
}

async fn read_capped<R>(mut reader: R, limit: usize) -> (Vec<u8>, bool)
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    if let Err(e) = (&mut reader).take(limit as u64).read_to_end(&mut buf).await {
        warn!(error = %e, bytes_read = buf.len(), "Failed to read sandbox output");
        return (buf, false);
    }

    // Keep draining so the child never blocks on a full pipe
    let rest = match tokio::io::copy(&mut reader, &mut tokio::io::sink()).await {
        Ok(rest) => rest,
        Err(e) => {
            warn!(error = %e, "Failed to drain sandbox output past the limit");
            return (buf, false);
        }
    };
    (buf, rest > 0)
}

async fn join_reader(
    handle: Option<JoinHandle<(Vec<u8>, bool)>>,
    grace: Option<Duration>,
) -> (String, bool) {
    let Some(mut handle) = handle else {
        return (String::new(), false);
    };

    let joined = match grace {
        Some(grace) => match tokio::time::timeout(grace, &mut handle).await {
            Ok(joined) => joined,
            Err(_) => {
                handle.abort();
                return (String::new(), false);
            }
        },
        None => handle.await,
    };

    match joined {
        Ok((bytes, truncated)) => (String::from_utf8_lossy(&bytes).into_owned(), truncated),
        Err(e) => {
            warn!(error = %e, "Output reader task failed");
            (String::new(), false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_capped_truncates() {
        let data: &[u8] = b"0123456789";
        let (buf, truncated) = read_capped(data, 4).await;
        assert_eq!(buf, b"0123");
        assert!(truncated);
    }

    #[tokio::test]
    async fn test_read_capped_within_limit() {
        let data: &[u8] = b"abc";
        let (buf, truncated) = read_capped(data, 10).await;
        assert_eq!(buf, b"abc");
        assert!(!truncated);
    }

    #[tokio::test]
    async fn test_read_error_keeps_partial_output() {
        let reader = tokio_test::io::Builder::new()
            .read(b"abc")
            .read_error(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed"))
            .build();
        let (buf, truncated) = read_capped(reader, 10).await;
        assert_eq!(buf, b"abc");
        assert!(!truncated);
    }

    #[tokio::test]
    async fn test_spawn_failure_is_sandbox_error() {
        let command = Command::new("/nonexistent/finverify-interpreter");
        let err = run_child(command, String::new(), Duration::from_secs(1), 1024, "process")
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Spawn { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shell_child_is_captured() {
        let mut command = Command::new("sh");
        command.arg("-s");
        let capture = run_child(
            command,
            "echo out; echo err 1>&2; exit 3\n".to_string(),
            Duration::from_secs(5),
            1024,
            "process",
        )
        .await
        .unwrap();
        assert_eq!(capture.exit_code, 3);
        assert_eq!(capture.stdout, "out\n");
        assert_eq!(capture.stderr, "err\n");
        assert!(!capture.timed_out);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_kills_child() {
        let mut command = Command::new("sh");
        command.arg("-s");
        let capture = run_child(
            command,
            "sleep 30\n".to_string(),
            Duration::from_millis(200),
            1024,
            "process",
        )
        .await
        .unwrap();
        assert!(capture.timed_out);
        assert_eq!(capture.exit_code, -1);
        assert!(capture.duration < Duration::from_secs(10));
    }
}
