//! MCP server: tool definitions using rmcp macros.
//!
//! Defines `ShellGatewayServer` with the five tool-dispatch surfaces:
//! `shell_execute` for synchronous commands and `shell_bg_start` /
//! `shell_bg_list` / `shell_bg_stop` / `shell_bg_logs` / `shell_bg_clean` /
//! `shell_bg_detail` for the background process lifecycle.

use crate::config::Config;
use crate::executor::{self, ExecuteRequest, PreflightKind};
use crate::record::ProcessStatus;
use crate::supervisor::{CleanOutcome, ListFilters, LogsFilter, ProcessSupervisor, StartSpec};
use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::*;
use rmcp::schemars;
use rmcp::tool;
use rmcp::tool_handler;
use rmcp::tool_router;
use rmcp::{ErrorData as McpError, ServerHandler};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

// ---------------------------------------------------------------------------
// Parameter structs (deserialized from MCP tool call arguments)
// ---------------------------------------------------------------------------

/// Parameters for the `shell_execute` tool.
#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct ShellExecuteParams {
    /// Argument vector: the executable basename followed by its arguments.
    /// Never shell-interpreted; pipelines use the literal tokens
    /// `;`, `&&`, `||`, `|` as separate array entries.
    pub command: Vec<String>,
    /// Absolute working directory for the child process.
    pub directory: String,
    /// Text written to the child's stdin, then the pipe is closed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdin: Option<String>,
    /// Seconds to wait before terminating the child. Defaults to 15.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    /// Encoding used to decode stdout/stderr. Defaults to the server config.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
    /// Environment variables overlaid onto the child's inherited environment.
    #[serde(default)]
    pub envs: HashMap<String, String>,
    /// Keep only the last N lines of each output stream. Defaults to 500;
    /// 0 disables clamping.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit_lines: Option<usize>,
}

/// Parameters for the `shell_bg_start` tool.
#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct ShellBgStartParams {
    /// Argument vector, identical contract to `shell_execute`'s `command`.
    pub command: Vec<String>,
    /// Absolute working directory for the child process.
    pub directory: String,
    /// Human-readable note describing what this process is for.
    pub description: String,
    /// Labels usable later to filter `shell_bg_list`.
    #[serde(default)]
    pub labels: Vec<String>,
    /// Text written to the child's stdin, then the pipe is closed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdin: Option<String>,
    /// Environment variables overlaid onto the child's inherited environment.
    #[serde(default)]
    pub envs: HashMap<String, String>,
    /// Encoding used to decode output. Defaults to the server config.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
    /// If set, the process is stopped automatically after this many seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

/// Parameters for the `shell_bg_list` tool.
#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct ShellBgListParams {
    /// Only include processes carrying every one of these labels.
    #[serde(default)]
    pub labels: Vec<String>,
    /// Only include processes in this exact status.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

/// Parameters for the `shell_bg_stop` tool.
#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct ShellBgStopParams {
    /// Supervisor-assigned pid of the process to stop.
    pub pid: u64,
    /// Skip the graceful grace window and kill immediately.
    #[serde(default)]
    pub force: bool,
}

/// Parameters for the `shell_bg_logs` tool.
#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct ShellBgLogsParams {
    /// Supervisor-assigned pid of the process to read logs from.
    pub pid: u64,
    /// Keep only the last N entries after time filtering. 0 means all.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tail: Option<usize>,
    /// Drop lines captured before this Unix timestamp (seconds).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<f64>,
    /// Drop lines captured after this Unix timestamp (seconds).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub until: Option<f64>,
    /// Include the stdout section. Defaults to true.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub with_stdout: Option<bool>,
    /// Include the stderr section. Defaults to false.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub with_stderr: Option<bool>,
    /// Prepend a formatted timestamp to each line. Defaults to true.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub add_time_prefix: Option<bool>,
    /// strftime-compatible format for the time prefix.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_prefix_format: Option<String>,
    /// How long to wait for new output before returning. Defaults to 1.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub follow_seconds: Option<u64>,
    /// Line-limit clamp applied after time filtering. Defaults to 500.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit_lines: Option<usize>,
}

/// Parameters for the `shell_bg_clean` tool.
#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct ShellBgCleanParams {
    /// Pids to remove from the registry, if not currently running.
    pub pids: Vec<u64>,
}

/// Parameters for the `shell_bg_detail` tool.
#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct ShellBgDetailParams {
    /// Supervisor-assigned pid of the process to describe.
    pub pid: u64,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn text_result(blocks: Vec<String>) -> Result<CallToolResult, McpError> {
    Ok(CallToolResult::success(
        blocks.into_iter().map(Content::text).collect(),
    ))
}

fn err_result(msg: impl Into<String>) -> Result<CallToolResult, McpError> {
    Ok(CallToolResult::error(vec![Content::text(format!(
        "error: {}",
        msg.into()
    ))]))
}

fn parse_status(name: &str) -> Option<ProcessStatus> {
    match name {
        "running" => Some(ProcessStatus::Running),
        "completed" => Some(ProcessStatus::Completed),
        "failed" => Some(ProcessStatus::Failed),
        "terminated" => Some(ProcessStatus::Terminated),
        "error" => Some(ProcessStatus::Error),
        _ => None,
    }
}

fn unix_secs_to_system_time(secs: f64) -> SystemTime {
    if secs >= 0.0 {
        UNIX_EPOCH + Duration::from_secs_f64(secs)
    } else {
        UNIX_EPOCH - Duration::from_secs_f64(-secs)
    }
}

fn render_list(records: &[crate::record::ProcessRecord]) -> String {
    if records.is_empty() {
        return "no matching processes".to_string();
    }
    records
        .iter()
        .map(|r| {
            format!(
                "pid={} status={:?} description={:?} labels={:?} command={:?}",
                r.pid, r.status, r.description, r.labels, r.command
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn render_clean(outcomes: HashMap<u64, CleanOutcome>) -> String {
    let mut cleaned = Vec::new();
    let mut still_running = Vec::new();
    let mut not_found = Vec::new();
    for (pid, outcome) in outcomes {
        match outcome {
            CleanOutcome::Cleaned => cleaned.push(pid),
            CleanOutcome::StillRunning => still_running.push(pid),
            CleanOutcome::NotFound => not_found.push(pid),
        }
    }
    cleaned.sort_unstable();
    still_running.sort_unstable();
    not_found.sort_unstable();
    format!(
        "cleaned: {cleaned:?}\nstill_running: {still_running:?}\nnot_found: {not_found:?}"
    )
}

// ---------------------------------------------------------------------------
// MCP Server
// ---------------------------------------------------------------------------

/// The shell-gateway MCP server. Holds the immutable [`Config`] and the
/// shared [`ProcessSupervisor`] handle; never exposes either as ambient
/// process-wide state.
#[derive(Clone)]
pub struct ShellGatewayServer {
    config: Config,
    supervisor: Arc<ProcessSupervisor>,
    tool_router: ToolRouter<ShellGatewayServer>,
}

impl ShellGatewayServer {
    /// Create a new server instance, spawning the supervisor's retention
    /// sweep task.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let supervisor = Arc::new(ProcessSupervisor::new(config.clone()));
        supervisor.spawn_retention_sweep();
        Self {
            config,
            supervisor,
            tool_router: Self::tool_router(),
        }
    }

    /// Forcibly kill every running supervised process. Called at shutdown.
    pub async fn shutdown(&self) {
        self.supervisor.shutdown().await;
    }

    /// A handle to the shared supervisor, for the admin HTTP surface.
    #[must_use]
    pub fn supervisor_handle(&self) -> Arc<ProcessSupervisor> {
        self.supervisor.clone()
    }
}

#[tool_router]
impl ShellGatewayServer {
    #[tool(
        description = "Run a command synchronously in a fresh process, no shell interpretation, no state between calls. The argument vector's first token must be on the server's command allow-list; pipelines (`|`, `&&`, `||`, `;` as literal array entries) are validated head-by-head. Blocks until the process exits or `timeout` seconds elapse, then returns an exit-status block plus stdout/stderr sections (omitted if empty)."
    )]
    async fn shell_execute(
        &self,
        Parameters(params): Parameters<ShellExecuteParams>,
    ) -> Result<CallToolResult, McpError> {
        let request = ExecuteRequest {
            command: params.command,
            directory: params.directory,
            stdin: params.stdin,
            timeout_secs: params.timeout.unwrap_or(ExecuteRequest::DEFAULT_TIMEOUT_SECS),
            encoding: params.encoding,
            envs: params.envs,
            limit_lines: params
                .limit_lines
                .unwrap_or(ExecuteRequest::DEFAULT_LIMIT_LINES),
        };

        tracing::info!(command = ?request.command, directory = %request.directory, "shell_execute");

        match executor::execute(&request, &self.config).await {
            Ok(result) => {
                tracing::info!(
                    exit_code = result.exit_code,
                    status = ?result.status,
                    "shell_execute completed"
                );
                text_result(executor::format_blocks(&result))
            }
            Err(PreflightKind::Preflight(e)) => err_result(e.to_string()),
            Err(PreflightKind::Spawn(e)) => err_result(e.to_string()),
        }
    }

    #[tool(
        description = "Start a command as a supervised background process and return immediately with a pid. The process is tracked until explicitly stopped, cleaned, or swept by retention. Use shell_bg_logs to read its output, shell_bg_detail for status, and shell_bg_stop to terminate it."
    )]
    async fn shell_bg_start(
        &self,
        Parameters(params): Parameters<ShellBgStartParams>,
    ) -> Result<CallToolResult, McpError> {
        let spec = StartSpec {
            command: params.command,
            directory: params.directory,
            description: params.description,
            labels: params.labels,
            stdin: params.stdin,
            envs: params.envs,
            encoding: params.encoding,
            timeout: params.timeout,
        };

        tracing::info!(command = ?spec.command, description = %spec.description, "shell_bg_start");

        match self.supervisor.start(spec).await {
            Ok(pid) => {
                tracing::info!(pid, "shell_bg_start assigned pid");
                text_result(vec![format!("started pid={pid}")])
            }
            Err(e) => err_result(e.to_string()),
        }
    }

    #[tool(
        description = "List supervised background processes, optionally filtered by label (every listed label must be present) and/or exact status (running/completed/failed/terminated/error)."
    )]
    async fn shell_bg_list(
        &self,
        Parameters(params): Parameters<ShellBgListParams>,
    ) -> Result<CallToolResult, McpError> {
        let labels = if params.labels.is_empty() {
            None
        } else {
            Some(params.labels.into_iter().collect::<HashSet<_>>())
        };
        let status = match params.status.as_deref() {
            None => None,
            Some(name) => match parse_status(name) {
                Some(s) => Some(s),
                None => return err_result(format!("Unknown status: {name}")),
            },
        };

        let records = self.supervisor.list(&ListFilters { labels, status }).await;
        text_result(vec![render_list(&records)])
    }

    #[tool(
        description = "Stop a background process by pid. Sends a graceful terminate signal and returns immediately; after a short grace window the process is force-killed if it has not exited. Pass force=true to skip the grace window. Errors if the pid is unknown or already terminal."
    )]
    async fn shell_bg_stop(
        &self,
        Parameters(params): Parameters<ShellBgStopParams>,
    ) -> Result<CallToolResult, McpError> {
        tracing::info!(pid = params.pid, force = params.force, "shell_bg_stop");
        match self.supervisor.stop(params.pid, params.force).await {
            Ok(()) => text_result(vec![format!("stop requested for pid={}", params.pid)]),
            Err(e) => err_result(e.to_string()),
        }
    }

    #[tool(
        description = "Read captured stdout/stderr from a background process, with optional time-window filtering (since/until as Unix timestamps), tail limiting, and timestamp prefixes. If the process is still running and follow_seconds > 0 (default 1), waits briefly for new output before returning."
    )]
    async fn shell_bg_logs(
        &self,
        Parameters(params): Parameters<ShellBgLogsParams>,
    ) -> Result<CallToolResult, McpError> {
        let filter = LogsFilter {
            tail: params.tail.unwrap_or(0),
            since: params.since.map(unix_secs_to_system_time),
            until: params.until.map(unix_secs_to_system_time),
            with_stdout: params.with_stdout.unwrap_or(true),
            with_stderr: params.with_stderr.unwrap_or(false),
            add_time_prefix: params.add_time_prefix.unwrap_or(true),
            time_prefix_format: params.time_prefix_format,
            follow_seconds: params.follow_seconds.unwrap_or(1),
            limit_lines: params.limit_lines.unwrap_or(500),
        };

        match self.supervisor.logs(params.pid, &filter).await {
            Ok(result) => {
                let mut blocks = vec![result.header];
                if let Some(stdout_block) = result.stdout_block {
                    blocks.push(stdout_block);
                }
                if let Some(stderr_block) = result.stderr_block {
                    blocks.push(stderr_block);
                }
                text_result(blocks)
            }
            Err(e) => err_result(e.to_string()),
        }
    }

    #[tool(
        description = "Remove finished background processes from the registry by pid. Running processes are refused (still_running); unknown pids are reported as not_found. Returns the classification for every requested pid."
    )]
    async fn shell_bg_clean(
        &self,
        Parameters(params): Parameters<ShellBgCleanParams>,
    ) -> Result<CallToolResult, McpError> {
        let outcomes = self.supervisor.clean(&params.pids).await;
        text_result(vec![render_clean(outcomes)])
    }

    #[tool(
        description = "Describe a single background process: pid, status, command, description, labels, start/end time, duration, working directory, exit code. Does not inline log output -- use shell_bg_logs for that."
    )]
    async fn shell_bg_detail(
        &self,
        Parameters(params): Parameters<ShellBgDetailParams>,
    ) -> Result<CallToolResult, McpError> {
        match self.supervisor.detail(params.pid).await {
            Ok(detail) => text_result(vec![detail]),
            Err(e) => err_result(e.to_string()),
        }
    }
}

#[tool_handler]
impl ServerHandler for ShellGatewayServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "shell-gateway-mcp".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                ..Default::default()
            },
            instructions: Some(
                "shell-gateway-mcp runs allow-listed commands for an agent, never through a \
                 shell -- every command is an explicit argument vector, executed directly.\n\n\
                 shell_execute runs a command synchronously and returns its exit code, stdout, \
                 and stderr. Use it for quick, bounded commands.\n\n\
                 shell_bg_start/list/stop/logs/clean/detail manage long-running commands as \
                 supervised background processes: start one, poll shell_bg_logs or \
                 shell_bg_detail for progress, and shell_bg_stop or shell_bg_clean when done.\n\n\
                 Every command's first token must be on the server's allow-list or the call \
                 fails validation before anything is spawned."
                    .to_string(),
            ),
        }
    }
}
