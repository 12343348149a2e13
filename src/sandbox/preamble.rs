//! Python preamble prepended to every sandboxed program.
//!
//! The preamble runs before the generated code and:
//! - reports peak RSS on exit through a sentinel line on stderr
//! - replaces every process-spawning entry point when subprocesses are off
//! - refuses socket connections when network access is off
//!
//! The code hash is always computed over the generated code alone.

/// Sentinel prefix for the peak-memory report.
pub(crate) const PEAK_RSS_SENTINEL: &str = "__FV_PEAK_RSS_KB__=";

const PEAK_MEMORY_REPORT: &str = r#"import atexit as _fv_atexit
def _fv_report_peak():
    try:
        import resource, sys
        peak = resource.getrusage(resource.RUSAGE_SELF).ru_maxrss
        if sys.platform == "darwin":
            peak //= 1024
        sys.stderr.write("\n__FV_PEAK_RSS_KB__=%d\n" % peak)
        sys.stderr.flush()
    except BaseException:
        pass
_fv_atexit.register(_fv_report_peak)
del _fv_atexit
"#;

// `os` re-exports these from `posix`/`nt`, so both module objects are patched.
const DENY_SUBPROCESS: &str = r#"def _fv_denied(*_a, **_k):
    raise PermissionError("subprocess creation is disabled in this sandbox")
import os as _fv_os, subprocess as _fv_subprocess
_fv_targets = [_fv_os]
for _fv_module_name in ("posix", "nt"):
    try:
        _fv_targets.append(__import__(_fv_module_name))
    except ImportError:
        pass
for _fv_target in _fv_targets:
    for _fv_name in ("system", "popen", "fork", "forkpty", "execl", "execle", "execlp",
                     "execlpe", "execv", "execve", "execvp", "execvpe", "spawnl", "spawnle",
                     "spawnlp", "spawnlpe", "spawnv", "spawnve", "spawnvp", "spawnvpe",
                     "posix_spawn", "posix_spawnp", "startfile"):
        if hasattr(_fv_target, _fv_name):
            setattr(_fv_target, _fv_name, _fv_denied)
for _fv_name in ("Popen", "run", "call", "check_call", "check_output",
                 "getoutput", "getstatusoutput"):
    setattr(_fv_subprocess, _fv_name, _fv_denied)
try:
    import _posixsubprocess as _fv_posixsubprocess
    _fv_posixsubprocess.fork_exec = _fv_denied
    del _fv_posixsubprocess
except ImportError:
    pass
try:
    import _winapi as _fv_winapi
    _fv_winapi.CreateProcess = _fv_denied
    del _fv_winapi
except ImportError:
    pass
del _fv_name, _fv_target, _fv_targets, _fv_module_name, _fv_os, _fv_subprocess
"#;

const DENY_NETWORK: &str = r#"import socket as _fv_socket, _socket as _fv_rawsocket
def _fv_no_network(*_a, **_k):
    raise PermissionError("network access is disabled in this sandbox")
for _fv_name in ("connect", "connect_ex", "bind", "sendto"):
    setattr(_fv_socket.socket, _fv_name, _fv_no_network)
class _fv_RawSocket(_fv_rawsocket.socket):
    connect = connect_ex = bind = sendto = _fv_no_network
_fv_rawsocket.socket = _fv_RawSocket
_fv_rawsocket.getaddrinfo = _fv_no_network
_fv_socket.create_connection = _fv_no_network
_fv_socket.getaddrinfo = _fv_no_network
del _fv_name, _fv_socket, _fv_rawsocket
"#;

/// What the preamble must lock down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ScriptPolicy {
    pub allow_subprocess: bool,
    pub allow_network: bool,
}

/// Generated code wrapped with the preamble.
pub(crate) fn build_script(code: &str, policy: ScriptPolicy) -> String {
    let mut script = String::with_capacity(code.len() + 2048);
    script.push_str(PEAK_MEMORY_REPORT);
    if !policy.allow_subprocess {
        script.push_str(DENY_SUBPROCESS);
    }
    if !policy.allow_network {
        script.push_str(DENY_NETWORK);
    }
    script.push_str(code);
    if !code.ends_with('\n') {
        script.push('\n');
    }
    script
}

/// Remove the sentinel line from stderr and return the reported peak (KB).
pub(crate) fn take_peak_memory(stderr: &str) -> (String, Option<u64>) {
    let mut peak = None;
    let mut kept = Vec::new();

    for line in stderr.lines() {
        match line.strip_prefix(PEAK_RSS_SENTINEL) {
            Some(value) => peak = value.trim().parse().ok(),
            None => kept.push(line),
        }
    }

    let mut cleaned = kept.join("\n");
    // Drop the blank line the sentinel was written after
    while cleaned.ends_with('\n') {
        cleaned.pop();
    }
    if !cleaned.is_empty() {
        cleaned.push('\n');
    }
    (cleaned, peak)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_locked_down_script_contains_guards() {
        let script = build_script(
            "print('x: 1')",
            ScriptPolicy {
                allow_subprocess: false,
                allow_network: false,
            },
        );
        assert!(script.contains("_fv_denied"));
        assert!(script.contains(r#"("posix", "nt")"#));
        assert!(script.contains("_fv_posixsubprocess.fork_exec"));
        assert!(script.contains("_fv_no_network"));
        assert!(script.contains("_fv_rawsocket.socket = _fv_RawSocket"));
        assert!(script.ends_with("print('x: 1')\n"));
    }

    #[test]
    fn test_permissive_script_omits_guards() {
        let script = build_script(
            "print(1)\n",
            ScriptPolicy {
                allow_subprocess: true,
                allow_network: true,
            },
        );
        assert!(!script.contains("_fv_denied"));
        assert!(!script.contains("_fv_no_network"));
        assert!(script.contains(PEAK_RSS_SENTINEL));
    }

    #[test]
    fn test_memory_hook_keeps_no_module_globals() {
        let script = build_script(
            "print(1)\n",
            ScriptPolicy {
                allow_subprocess: false,
                allow_network: false,
            },
        );
        // The hook runs at exit, after the preamble's names are deleted
        let hook = script
            .split("_fv_atexit.register")
            .next()
            .unwrap_or_default();
        assert!(hook.contains("import resource, sys"));
        assert!(!script.contains("_fv_sys"));
    }

    #[test]
    fn test_take_peak_memory_strips_sentinel() {
        let stderr = "warning: slow\n\n__FV_PEAK_RSS_KB__=10240\n";
        let (cleaned, peak) = take_peak_memory(stderr);
        assert_eq!(peak, Some(10240));
        assert_eq!(cleaned, "warning: slow\n");
    }

    #[test]
    fn test_take_peak_memory_without_sentinel() {
        let (cleaned, peak) = take_peak_memory("");
        assert_eq!(peak, None);
        assert_eq!(cleaned, "");
    }
}
