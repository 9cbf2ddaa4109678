//! Timeout-bounded invocation of external tools.
//!
//! Arguments are always passed as a typed list, never through a shell. The
//! exit path decides the error class: a tool that runs and exits non-zero is
//! rejecting its input unless its exit code or stderr points at the host
//! (missing interpreter module, full disk, exhausted memory). Those, like
//! timeouts, signals and spawn failures, are infrastructure problems worth
//! retrying.

pub mod transcoder;
pub mod voice;

use std::collections::HashMap;
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{PipelineError, Result};

pub use transcoder::{AudioTranscoder, FfmpegTranscoder};
pub use voice::{CommandVoiceDetector, VoiceActivitySummary, VoiceDetector};

/// Longest stderr tail carried inside an error value.
const STDERR_TAIL_BYTES: usize = 4 * 1024;

/// Shell conventions for "could not execute" and "command not found".
const EXEC_FAILURE_CODES: [i32; 2] = [126, 127];

/// Stderr fragments that blame the environment rather than the input.
const HOST_FAILURE_MARKERS: [&str; 8] = [
    "No space left on device",
    "Disk quota exceeded",
    "Cannot allocate memory",
    "Too many open files",
    "Resource temporarily unavailable",
    "ModuleNotFoundError",
    "ImportError",
    "MemoryError",
];

/// A fully specified external command.
#[derive(Clone, Debug)]
pub struct ToolInvocation {
    /// Short name used in logs and errors.
    pub tool: String,
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub env: HashMap<String, String>,
    pub timeout: Duration,
}

impl ToolInvocation {
    pub fn new(
        tool: impl Into<String>,
        program: impl Into<PathBuf>,
        timeout: Duration,
    ) -> Self {
        Self {
            tool: tool.into(),
            program: program.into(),
            args: Vec::new(),
            env: HashMap::new(),
            timeout,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn envs(mut self, env: &HashMap<String, String>) -> Self {
        self.env.extend(env.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    fn rendered(&self) -> String {
        let mut out = self.program.display().to_string();
        for arg in &self.args {
            out.push(' ');
            out.push_str(&arg.to_string_lossy());
        }
        out
    }
}

/// Captured result of a successful run.
#[derive(Clone, Debug)]
pub struct ToolOutput {
    pub stdout: Vec<u8>,
    pub stderr: String,
    pub elapsed: Duration,
}

/// Runs `invocation` to completion or until its timeout elapses.
///
/// On timeout the child is killed when its handle is dropped.
pub async fn run_tool(invocation: &ToolInvocation) -> Result<ToolOutput> {
    let rendered = invocation.rendered();
    debug!(tool = %invocation.tool, command = %rendered, "spawning external tool");

    let mut command = Command::new(&invocation.program);
    command
        .args(&invocation.args)
        .envs(&invocation.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let started = Instant::now();
    let child = command.spawn().map_err(|e| PipelineError::ToolCrashed {
        tool: invocation.tool.clone(),
        detail: format!("failed to spawn `{rendered}`: {e}"),
    })?;

    let output =
        match tokio::time::timeout(invocation.timeout, child.wait_with_output())
            .await
        {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(PipelineError::ToolCrashed {
                    tool: invocation.tool.clone(),
                    detail: format!("failed waiting for `{rendered}`: {e}"),
                });
            }
            Err(_) => {
                warn!(
                    tool = %invocation.tool,
                    timeout_ms = saturating_ms(invocation.timeout),
                    "external tool timed out; killing"
                );
                return Err(PipelineError::ToolTimedOut {
                    tool: invocation.tool.clone(),
                    timeout_ms: saturating_ms(invocation.timeout),
                });
            }
        };

    let elapsed = started.elapsed();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    if !stderr.is_empty() {
        debug!(tool = %invocation.tool, stderr = %stderr_tail(&stderr), "tool stderr");
    }

    match output.status.code() {
        Some(0) => Ok(ToolOutput {
            stdout: output.stdout,
            stderr,
            elapsed,
        }),
        Some(code) => Err(exit_error(&invocation.tool, code, &stderr)),
        None => Err(PipelineError::ToolCrashed {
            tool: invocation.tool.clone(),
            detail: format!(
                "terminated by signal ({}): {}",
                output.status,
                stderr_tail(&stderr)
            ),
        }),
    }
}

/// Classifies a non-zero exit.
fn exit_error(tool: &str, code: i32, stderr: &str) -> PipelineError {
    let tail = stderr_tail(stderr);
    let host_failure = EXEC_FAILURE_CODES.contains(&code)
        || HOST_FAILURE_MARKERS.iter().any(|marker| stderr.contains(marker));
    if host_failure {
        warn!(tool, code, "external tool failed on the host, not the input");
        PipelineError::ToolCrashed {
            tool: tool.to_string(),
            detail: format!("exit code {code}: {tail}"),
        }
    } else {
        PipelineError::ToolRejected {
            tool: tool.to_string(),
            code,
            stderr: tail.to_string(),
        }
    }
}

fn stderr_tail(stderr: &str) -> &str {
    let trimmed = stderr.trim_end();
    if trimmed.len() <= STDERR_TAIL_BYTES {
        return trimmed;
    }
    let mut start = trimmed.len() - STDERR_TAIL_BYTES;
    while !trimmed.is_char_boundary(start) {
        start += 1;
    }
    &trimmed[start..]
}

fn saturating_ms(duration: Duration) -> u64 {
    duration.as_millis().try_into().unwrap_or(u64::MAX)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::error::ErrorClass;

    fn sh(script: &str, timeout: Duration) -> ToolInvocation {
        ToolInvocation::new("sh", "sh", timeout).arg("-c").arg(script)
    }

    #[tokio::test]
    async fn captures_stdout_of_successful_run() {
        let out = run_tool(&sh("printf hello", Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(out.stdout, b"hello");
    }

    #[tokio::test]
    async fn non_zero_exit_is_a_content_error_with_stderr() {
        let err = run_tool(&sh(
            "echo 'Invalid data found' >&2; exit 1",
            Duration::from_secs(5),
        ))
        .await
        .unwrap_err();
        assert_eq!(err.class(), ErrorClass::Content);
        match err {
            PipelineError::ToolRejected { code, stderr, .. } => {
                assert_eq!(code, 1);
                assert!(stderr.contains("Invalid data found"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn timeout_is_retryable() {
        let err = run_tool(&sh("sleep 5", Duration::from_millis(100)))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::ToolTimedOut { timeout_ms: 100, .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn killed_by_signal_is_retryable() {
        let err = run_tool(&sh("kill -9 $$", Duration::from_secs(5)))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::ToolCrashed { .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn missing_program_is_retryable() {
        let invocation = ToolInvocation::new(
            "missing",
            "/nonexistent/cadenza-tool",
            Duration::from_secs(1),
        );
        let err = run_tool(&invocation).await.unwrap_err();
        assert!(matches!(err, PipelineError::ToolCrashed { .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn host_failures_behind_a_non_zero_exit_are_retryable() {
        let cases = [
            "echo 'av_interleaved_write_frame(): No space left on device' >&2; exit 1",
            "echo \"ModuleNotFoundError: No module named 'webrtcvad'\" >&2; exit 1",
            "exit 127",
        ];
        for script in cases {
            let err = run_tool(&sh(script, Duration::from_secs(5)))
                .await
                .unwrap_err();
            assert!(
                matches!(err, PipelineError::ToolCrashed { .. }),
                "{script}: {err:?}"
            );
            assert!(err.is_retryable(), "{script}");
        }
    }

    #[tokio::test]
    async fn environment_is_passed_through() {
        let mut env = HashMap::new();
        env.insert("CADENZA_MARKER".to_string(), "42".to_string());
        let invocation =
            sh("printf \"$CADENZA_MARKER\"", Duration::from_secs(5)).envs(&env);
        let out = run_tool(&invocation).await.unwrap();
        assert_eq!(out.stdout, b"42");
    }

    #[test]
    fn stderr_tail_keeps_the_end() {
        let long = format!("{}END", "x".repeat(STDERR_TAIL_BYTES * 2));
        let tail = stderr_tail(&long);
        assert_eq!(tail.len(), STDERR_TAIL_BYTES);
        assert!(tail.ends_with("END"));
    }
}
