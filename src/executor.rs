//! Synchronous command execution (`shell_execute`): spawn, drain, timeout,
//! graceful-then-forceful termination, encoding-aware decoding.

use crate::config::Config;
use crate::io_util::{self, IoUtilError};
use crate::spawn::{self, SpawnSpec};
use crate::validator::{self, ValidationError};
use nix::sys::signal::Signal;
use serde::Serialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;

/// Time allowed between a graceful SIGTERM and escalating to SIGKILL.
const GRACE_PERIOD: Duration = Duration::from_secs(1);

/// A single execution request, matching the `shell_execute` tool schema.
#[derive(Debug, Clone)]
pub struct ExecuteRequest {
    pub command: Vec<String>,
    pub directory: String,
    pub stdin: Option<String>,
    pub timeout_secs: u64,
    pub encoding: Option<String>,
    pub envs: HashMap<String, String>,
    pub limit_lines: usize,
}

impl ExecuteRequest {
    pub const DEFAULT_TIMEOUT_SECS: u64 = 15;
    pub const DEFAULT_LIMIT_LINES: usize = 500;
}

/// Terminal status of a synchronous execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Success,
    Failure,
    Timeout,
    Error,
}

/// The outcome of running a [`ExecuteRequest`].
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub execution_time: f64,
    pub status: ExecutionStatus,
}

/// A failure that occurs before or during spawn -- distinct from a
/// validation rejection, which is reported separately and never spawns.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct ExecError(pub String);

/// A validation error, surfaced separately from spawn/runtime errors per
/// the error taxonomy.
#[derive(Debug, Clone, Error)]
pub enum PreflightError {
    #[error("{0}")]
    Validation(#[from] ValidationError),
    #[error("{0}")]
    Encoding(#[from] IoUtilError),
}

/// Run a synchronous command to completion (or timeout).
///
/// Validation failures are returned as [`PreflightError`] before any child
/// is spawned. Spawn/runtime failures are folded into an `Err(ExecError)`;
/// per the error taxonomy this becomes a single `error: ...` block, never
/// an [`ExecutionResult`].
pub async fn execute(
    req: &ExecuteRequest,
    config: &Config,
) -> Result<ExecutionResult, PreflightKind> {
    validator::validate_command(&req.command, &config.allowed_commands)
        .map_err(PreflightError::Validation)?;
    let directory =
        validator::validate_directory(&req.directory).map_err(PreflightError::Validation)?;
    let encoding = io_util::resolve_encoding(req.encoding.as_deref(), &config.default_encoding)
        .map_err(PreflightError::Encoding)?;

    let start = Instant::now();
    let spec = SpawnSpec {
        argv: &req.command,
        directory: &directory,
        envs: &req.envs,
        shell_path: &config.shell_path,
    };
    let mut cmd = spawn::build_command(&spec);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => return Err(PreflightKind::Spawn(ExecError(format!("{e}")))),
    };

    let mut stdin_pipe = child.stdin.take();
    if let Some(ref text) = req.stdin {
        let text = text.clone();
        if let Some(mut stdin) = stdin_pipe.take() {
            let _ = stdin.write_all(text.as_bytes()).await;
            let _ = stdin.shutdown().await;
        }
    } else {
        drop(stdin_pipe.take());
    }

    let mut stdout_pipe = child.stdout.take().expect("stdout was piped");
    let mut stderr_pipe = child.stderr.take().expect("stderr was piped");

    let stdout_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = stdout_pipe.read_to_end(&mut buf).await;
        buf
    });
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = stderr_pipe.read_to_end(&mut buf).await;
        buf
    });

    let (timed_out, exit_code) =
        match tokio::time::timeout(Duration::from_secs(req.timeout_secs), child.wait()).await {
            Ok(Ok(status)) => (false, status.code().unwrap_or(-1)),
            Ok(Err(e)) => return Err(PreflightKind::Spawn(ExecError(format!("{e}")))),
            Err(_) => {
                if let Some(os_pid) = child.id() {
                    let _ = spawn::signal_process_group(os_pid, Signal::SIGTERM);
                    let escalate =
                        tokio::time::timeout(GRACE_PERIOD, child.wait()).await;
                    if escalate.is_err() {
                        let _ = spawn::signal_process_group(os_pid, Signal::SIGKILL);
                        let _ = child.wait().await;
                    }
                } else {
                    let _ = child.kill().await;
                }
                (true, -1)
            }
        };

    let stdout_bytes = stdout_task.await.unwrap_or_default();
    let stderr_bytes = stderr_task.await.unwrap_or_default();

    let mut stdout = io_util::decode_lossy(&stdout_bytes, encoding);
    let mut stderr = io_util::decode_lossy(&stderr_bytes, encoding);

    if timed_out {
        if !stderr.is_empty() && !stderr.ends_with('\n') {
            stderr.push('\n');
        }
        stderr.push_str(&format!("Command timed out after {}s", req.timeout_secs));
    }

    let status = if timed_out {
        ExecutionStatus::Timeout
    } else if exit_code == 0 {
        ExecutionStatus::Success
    } else {
        ExecutionStatus::Failure
    };

    if req.limit_lines > 0 {
        stdout = io_util::clamp_block_text(&stdout, req.limit_lines);
        stderr = io_util::clamp_block_text(&stderr, req.limit_lines);
    }

    Ok(ExecutionResult {
        exit_code,
        stdout,
        stderr,
        execution_time: start.elapsed().as_secs_f64(),
        status,
    })
}

/// Union of the distinct failure kinds `execute` can produce, kept separate
/// so callers can format the three message shapes the spec's error
/// taxonomy requires without re-deriving them from a single flat string.
#[derive(Debug, Clone, Error)]
pub enum PreflightKind {
    #[error("{0}")]
    Preflight(#[from] PreflightError),
    #[error("{0}")]
    Spawn(ExecError),
}

/// Render an [`ExecutionResult`] into the fixed `TextContent` block strings
/// the wire contract requires (§4.D step 8 / §6).
#[must_use]
pub fn format_blocks(id_result: &ExecutionResult) -> Vec<String> {
    let mut blocks = vec![format!("**exit with {}**", id_result.exit_code)];
    if !id_result.stdout.is_empty() {
        blocks.push(format!("---\nstdout:\n---\n{}", id_result.stdout));
    }
    if !id_result.stderr.is_empty() {
        blocks.push(format!("---\nstderr:\n---\n{}", id_result.stderr));
    }
    blocks
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn config(allowed: &[&str]) -> Config {
        Config {
            allowed_commands: allowed.iter().map(|s| s.to_string()).collect(),
            process_retention_seconds: 3600,
            default_encoding: "utf-8".to_string(),
            shell_path: "/bin/sh".to_string(),
        }
    }

    fn req(command: &[&str]) -> ExecuteRequest {
        ExecuteRequest {
            command: command.iter().map(|s| s.to_string()).collect(),
            directory: "/tmp".to_string(),
            stdin: None,
            timeout_secs: 15,
            encoding: None,
            envs: HashMap::new(),
            limit_lines: 500,
        }
    }

    #[tokio::test]
    async fn allowed_echo_succeeds() {
        let config = config(&["echo"]);
        let result = execute(&req(&["echo", "hi"]), &config).await.unwrap();
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.status, ExecutionStatus::Success);
        assert_eq!(result.stdout.trim_end(), "hi");
    }

    #[tokio::test]
    async fn disallowed_command_never_spawns() {
        let config = config(&["ls"]);
        let err = execute(&req(&["rm", "-rf", "/"]), &config)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Command not allowed: rm");
    }

    #[tokio::test]
    async fn empty_allow_list_rejects_everything() {
        let config = config(&[]);
        let err = execute(&req(&["echo", "hi"]), &config).await.unwrap_err();
        assert_eq!(err.to_string(), "Command not allowed: echo");
    }

    #[tokio::test]
    async fn timeout_reports_minus_one_and_annotates_stderr() {
        let config = config(&["sleep"]);
        let mut request = req(&["sleep", "10"]);
        request.timeout_secs = 1;
        let start = Instant::now();
        let result = execute(&request, &config).await.unwrap();
        assert_eq!(result.exit_code, -1);
        assert_eq!(result.status, ExecutionStatus::Timeout);
        assert!(result.stderr.contains("Command timed out after 1s"));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn stdin_is_piped_through() {
        let config = config(&["cat"]);
        let mut request = req(&["cat"]);
        request.stdin = Some("hello from stdin".to_string());
        let result = execute(&request, &config).await.unwrap();
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout, "hello from stdin");
    }

    #[tokio::test]
    async fn env_overlay_replaces_parent_value() {
        let config = config(&["sh"]);
        // SAFETY: test-local, single-threaded effect on this process's env.
        unsafe { std::env::set_var("SHELL_GATEWAY_TEST_VAR", "parent") };
        let mut request = req(&["sh", "-c", "echo $SHELL_GATEWAY_TEST_VAR"]);
        request
            .envs
            .insert("SHELL_GATEWAY_TEST_VAR".to_string(), "overlaid".to_string());
        let result = execute(&request, &config).await.unwrap();
        assert_eq!(result.stdout.trim_end(), "overlaid");
        unsafe { std::env::remove_var("SHELL_GATEWAY_TEST_VAR") };
    }

    #[tokio::test]
    async fn pipeline_with_one_disallowed_head_fails() {
        let config = config(&["cat"]);
        let err = execute(&req(&["cat", "a", "|", "rm", "b"]), &config)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Command not allowed: rm");
    }

    #[test]
    fn format_blocks_omits_empty_sections() {
        let result = ExecutionResult {
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
            execution_time: 0.01,
            status: ExecutionStatus::Success,
        };
        let blocks = format_blocks(&result);
        assert_eq!(blocks, vec!["**exit with 0**".to_string()]);
    }

    #[test]
    fn format_blocks_includes_nonempty_sections() {
        let result = ExecutionResult {
            exit_code: 0,
            stdout: "hi\n".to_string(),
            stderr: String::new(),
            execution_time: 0.01,
            status: ExecutionStatus::Success,
        };
        let blocks = format_blocks(&result);
        assert_eq!(
            blocks,
            vec!["**exit with 0**".to_string(), "---\nstdout:\n---\nhi\n".to_string()]
        );
    }
}
