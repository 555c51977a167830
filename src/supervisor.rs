//! Background process supervisor: the registry of supervised child
//! processes, each with two bounded timestamped log streams, a status
//! state machine, filtered log retrieval, and retention-based cleanup.

use crate::config::Config;
use crate::io_util::{self, LineSplitter};
use crate::record::{BoundedLog, LogLine, ProcessRecord, ProcessStatus};
use crate::spawn::{self, SpawnSpec};
use crate::validator::{self, ValidationError};
use nix::sys::signal::Signal;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;

/// Default grace window between a cooperative stop request and forceful kill.
const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(5);
/// Upper bound on how long `logs` will wait for new output before returning.
const MAX_FOLLOW_SECONDS: u64 = 30;
const FOLLOW_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Request to start a new background process, matching `shell_bg_start`.
#[derive(Debug, Clone)]
pub struct StartSpec {
    pub command: Vec<String>,
    pub directory: String,
    pub description: String,
    pub labels: Vec<String>,
    pub stdin: Option<String>,
    pub envs: HashMap<String, String>,
    pub encoding: Option<String>,
    pub timeout: Option<u64>,
}

/// Filters accepted by `shell_bg_list`.
#[derive(Debug, Clone, Default)]
pub struct ListFilters {
    pub labels: Option<HashSet<String>>,
    pub status: Option<ProcessStatus>,
}

/// Filters accepted by `shell_bg_logs`.
#[derive(Debug, Clone)]
pub struct LogsFilter {
    pub tail: usize,
    pub since: Option<SystemTime>,
    pub until: Option<SystemTime>,
    pub with_stdout: bool,
    pub with_stderr: bool,
    pub add_time_prefix: bool,
    pub time_prefix_format: Option<String>,
    pub follow_seconds: u64,
    pub limit_lines: usize,
}

impl Default for LogsFilter {
    fn default() -> Self {
        Self {
            tail: 0,
            since: None,
            until: None,
            with_stdout: true,
            with_stderr: false,
            add_time_prefix: true,
            time_prefix_format: None,
            follow_seconds: 1,
            limit_lines: 500,
        }
    }
}

/// Rendered result of a `logs` call: header plus optional stdout/stderr blocks.
#[derive(Debug, Clone)]
pub struct LogsResult {
    pub header: String,
    pub stdout_block: Option<String>,
    pub stderr_block: Option<String>,
}

/// Per-pid classification for `shell_bg_clean`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanOutcome {
    Cleaned,
    StillRunning,
    NotFound,
}

/// Errors the supervisor reports, whose `Display` text is the exact wire
/// string tool handlers surface.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct SupervisorError(pub String);

impl From<ValidationError> for SupervisorError {
    fn from(e: ValidationError) -> Self {
        SupervisorError(e.0)
    }
}

type SharedRecord = Arc<Mutex<ProcessRecord>>;

/// The process registry, safe under concurrent callers. Holds one
/// [`Arc<Mutex<ProcessRecord>>`] per tracked pid so long operations (I/O,
/// waits) never happen while holding the outer map lock.
pub struct ProcessSupervisor {
    config: Config,
    records: Mutex<HashMap<u64, SharedRecord>>,
    next_pid: AtomicU64,
}

impl ProcessSupervisor {
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            config,
            records: Mutex::new(HashMap::new()),
            next_pid: AtomicU64::new(1),
        }
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Start a new background process. Returns the assigned `pid`
    /// immediately; a spawn failure still allocates a pid and records the
    /// process in `Error` status rather than failing the call (§7 item 2).
    pub async fn start(self: &Arc<Self>, spec: StartSpec) -> Result<u64, SupervisorError> {
        validator::validate_command(&spec.command, &self.config.allowed_commands)?;
        let directory = validator::validate_directory(&spec.directory)?;
        let encoding = io_util::resolve_encoding(spec.encoding.as_deref(), &self.config.default_encoding)
            .map_err(|e| SupervisorError(e.0))?;

        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        let encoding_name = spec.encoding.clone().unwrap_or_else(|| self.config.default_encoding.clone());

        let spawn_spec = SpawnSpec {
            argv: &spec.command,
            directory: &directory,
            envs: &spec.envs,
            shell_path: &self.config.shell_path,
        };
        let mut cmd = spawn::build_command(&spawn_spec);

        let base_record = ProcessRecord {
            pid,
            os_pid: None,
            command: spec.command.clone(),
            directory: spec.directory.clone(),
            description: spec.description.clone(),
            labels: spec.labels.clone(),
            stdin: spec.stdin.clone(),
            envs: spec.envs.clone(),
            encoding: encoding_name,
            timeout: spec.timeout,
            status: ProcessStatus::Running,
            start_time: SystemTime::now(),
            end_time: None,
            exit_code: None,
            stdout_log: BoundedLog::new(),
            stderr_log: BoundedLog::new(),
            error_message: None,
            stop_requested: false,
        };

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                let mut record = base_record;
                record.status = ProcessStatus::Error;
                record.end_time = Some(SystemTime::now());
                record.error_message = Some(format!("failed to spawn process: {e}"));
                self.records
                    .lock()
                    .await
                    .insert(pid, Arc::new(Mutex::new(record)));
                return Ok(pid);
            }
        };

        let mut record = base_record;
        record.os_pid = child.id();

        if let Some(text) = spec.stdin.clone() {
            if let Some(mut stdin) = child.stdin.take() {
                let _ = stdin.write_all(text.as_bytes()).await;
                let _ = stdin.shutdown().await;
            }
        } else {
            drop(child.stdin.take());
        }

        let shared = Arc::new(Mutex::new(record));
        self.records.lock().await.insert(pid, shared.clone());

        let stdout_pipe = child.stdout.take().expect("stdout was piped");
        let stderr_pipe = child.stderr.take().expect("stderr was piped");

        let supervisor = self.clone();
        tokio::spawn(reader_task(supervisor.clone(), pid, stdout_pipe, encoding, true));
        let supervisor = self.clone();
        tokio::spawn(reader_task(supervisor.clone(), pid, stderr_pipe, encoding, false));

        if let Some(timeout_secs) = spec.timeout {
            let supervisor = self.clone();
            tokio::spawn(watchdog_task(supervisor, pid, timeout_secs));
        }

        let supervisor = self.clone();
        tokio::spawn(completion_task(supervisor, pid, child));

        Ok(pid)
    }

    /// Snapshot of tracked records matching `filters`, ordered by start time.
    pub async fn list(&self, filters: &ListFilters) -> Vec<ProcessRecord> {
        let records = self.records.lock().await;
        let mut snapshot = Vec::new();
        for shared in records.values() {
            let record = shared.lock().await.clone();
            if let Some(ref wanted_labels) = filters.labels {
                if !wanted_labels.iter().all(|l| record.labels.contains(l)) {
                    continue;
                }
            }
            if let Some(wanted_status) = filters.status {
                if record.status != wanted_status {
                    continue;
                }
            }
            snapshot.push(record);
        }
        snapshot.sort_by_key(|r| r.start_time);
        snapshot
    }

    /// Request termination of a running process. Non-blocking: returns
    /// once the request has been issued, before the process has actually
    /// exited.
    pub async fn stop(self: &Arc<Self>, pid: u64, force: bool) -> Result<(), SupervisorError> {
        let shared = self.find(pid).await?;
        let os_pid = {
            let mut record = shared.lock().await;
            if record.status.is_terminal() {
                return Err(SupervisorError("Process is not running".to_string()));
            }
            record.stop_requested = true;
            record.os_pid
        };
        let Some(os_pid) = os_pid else {
            return Err(SupervisorError("Process is not running".to_string()));
        };

        if force {
            let _ = spawn::signal_process_group(os_pid, Signal::SIGKILL);
            return Ok(());
        }

        let _ = spawn::signal_process_group(os_pid, Signal::SIGTERM);

        let supervisor = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(DEFAULT_STOP_GRACE).await;
            let Ok(shared) = supervisor.find(pid).await else {
                return;
            };
            let mut record = shared.lock().await;
            if !record.status.is_terminal() {
                if let Some(os_pid) = record.os_pid {
                    let _ = spawn::signal_process_group(os_pid, Signal::SIGKILL);
                }
                record.error_message = Some("escalated to force kill".to_string());
            }
        });

        Ok(())
    }

    /// Retrieve filtered, optionally time-prefixed logs for `pid`.
    pub async fn logs(&self, pid: u64, filter: &LogsFilter) -> Result<LogsResult, SupervisorError> {
        let shared = self.find(pid).await?;

        let follow = filter.follow_seconds.min(MAX_FOLLOW_SECONDS);
        if follow > 0 {
            let is_running = shared.lock().await.status == ProcessStatus::Running;
            if is_running {
                let (initial_out, initial_err) = {
                    let record = shared.lock().await;
                    (record.stdout_log.snapshot().len(), record.stderr_log.snapshot().len())
                };
                let deadline = tokio::time::Instant::now() + Duration::from_secs(follow);
                loop {
                    if tokio::time::Instant::now() >= deadline {
                        break;
                    }
                    tokio::time::sleep(FOLLOW_POLL_INTERVAL).await;
                    let record = shared.lock().await;
                    let grown = record.stdout_log.snapshot().len() > initial_out
                        || record.stderr_log.snapshot().len() > initial_err;
                    if grown || record.status.is_terminal() {
                        break;
                    }
                }
            }
        }

        let record = shared.lock().await.clone();

        let header = render_header(&record);

        let stdout_block = if filter.with_stdout {
            render_stream_block("stdout", &record.stdout_log.snapshot(), filter)
        } else {
            None
        };
        let stderr_block = if filter.with_stderr {
            render_stream_block("stderr", &record.stderr_log.snapshot(), filter)
        } else {
            None
        };

        Ok(LogsResult {
            header,
            stdout_block,
            stderr_block,
        })
    }

    /// Classify and remove the given pids. Running processes are never
    /// removed.
    pub async fn clean(&self, pids: &[u64]) -> HashMap<u64, CleanOutcome> {
        let mut records = self.records.lock().await;
        let mut outcomes = HashMap::new();
        for &pid in pids {
            let outcome = match records.get(&pid) {
                None => CleanOutcome::NotFound,
                Some(shared) => {
                    let is_running = shared.lock().await.status == ProcessStatus::Running;
                    if is_running {
                        CleanOutcome::StillRunning
                    } else {
                        records.remove(&pid);
                        CleanOutcome::Cleaned
                    }
                }
            };
            outcomes.insert(pid, outcome);
        }
        outcomes
    }

    /// Formatted detail block for `pid`. Log content is never inlined.
    pub async fn detail(&self, pid: u64) -> Result<String, SupervisorError> {
        let shared = self.find(pid).await?;
        let record = shared.lock().await.clone();
        Ok(render_detail(&record))
    }

    /// Periodic retention sweep: removes terminal records older than
    /// `process_retention_seconds`. Running records are never swept.
    pub fn spawn_retention_sweep(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let supervisor = self.clone();
        let period = Duration::from_secs(supervisor.config.process_retention_seconds.min(60).max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                supervisor.sweep_once().await;
            }
        })
    }

    async fn sweep_once(&self) {
        let retention = Duration::from_secs(self.config.process_retention_seconds);
        let mut records = self.records.lock().await;
        let mut to_remove = Vec::new();
        for (&pid, shared) in records.iter() {
            let record = shared.lock().await;
            if let Some(end_time) = record.end_time {
                if record.status.is_terminal()
                    && end_time.elapsed().unwrap_or(Duration::ZERO) >= retention
                {
                    to_remove.push(pid);
                }
            }
        }
        for pid in to_remove {
            records.remove(&pid);
        }
    }

    async fn find(&self, pid: u64) -> Result<SharedRecord, SupervisorError> {
        self.records
            .lock()
            .await
            .get(&pid)
            .cloned()
            .ok_or_else(|| SupervisorError(format!("Process {pid} not found")))
    }

    /// Forcibly kill every running record. Used at shutdown.
    pub async fn shutdown(&self) {
        let records = self.records.lock().await;
        for shared in records.values() {
            let record = shared.lock().await;
            if !record.status.is_terminal() {
                if let Some(os_pid) = record.os_pid {
                    let _ = spawn::signal_process_group(os_pid, Signal::SIGKILL);
                }
            }
        }
    }
}

async fn reader_task(
    supervisor: Arc<ProcessSupervisor>,
    pid: u64,
    mut pipe: impl tokio::io::AsyncRead + Unpin,
    encoding: &'static encoding_rs::Encoding,
    is_stdout: bool,
) {
    let mut splitter = LineSplitter::new(encoding);
    let mut buf = [0u8; 4096];
    loop {
        match pipe.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let lines = splitter.push_bytes(&buf[..n]);
                append_lines(&supervisor, pid, is_stdout, lines).await;
            }
            Err(_) => break,
        }
    }
    if let Some(last) = splitter.flush() {
        append_lines(&supervisor, pid, is_stdout, vec![last]).await;
    }
}

async fn append_lines(supervisor: &Arc<ProcessSupervisor>, pid: u64, is_stdout: bool, lines: Vec<String>) {
    if lines.is_empty() {
        return;
    }
    let Ok(shared) = supervisor.find(pid).await else {
        return;
    };
    let mut record = shared.lock().await;
    for text in lines {
        let line = LogLine {
            timestamp: SystemTime::now(),
            text,
        };
        if is_stdout {
            record.stdout_log.push(line);
        } else {
            record.stderr_log.push(line);
        }
    }
}

async fn watchdog_task(supervisor: Arc<ProcessSupervisor>, pid: u64, timeout_secs: u64) {
    tokio::time::sleep(Duration::from_secs(timeout_secs)).await;
    let Ok(shared) = supervisor.find(pid).await else {
        return;
    };
    let is_running = shared.lock().await.status == ProcessStatus::Running;
    if is_running {
        let _ = supervisor.stop(pid, false).await;
    }
}

async fn completion_task(supervisor: Arc<ProcessSupervisor>, pid: u64, mut child: tokio::process::Child) {
    let wait_result = child.wait().await;

    let Ok(shared) = supervisor.find(pid).await else {
        return;
    };
    let mut record = shared.lock().await;
    match wait_result {
        Ok(status) => {
            // A signal-killed child has no exit code; terminal states still
            // need a non-null one, so fall back to -1 as the teacher does.
            let exit_code = status.code().unwrap_or(-1);
            if record.stop_requested {
                record.finish(ProcessStatus::Terminated, Some(exit_code));
            } else if exit_code == 0 {
                record.finish(ProcessStatus::Completed, Some(exit_code));
            } else {
                record.finish(ProcessStatus::Failed, Some(exit_code));
            }
        }
        Err(e) => {
            record.error_message = Some(format!("wait failed: {e}"));
            record.finish(ProcessStatus::Error, None);
        }
    }
}

fn render_header(record: &ProcessRecord) -> String {
    let state_note = if record.status == ProcessStatus::Running {
        "running".to_string()
    } else {
        format!("terminal: {:?}", record.status).to_lowercase()
    };
    format!(
        "pid={} status={:?} command={:?} description={:?} labels={:?} ({state_note})",
        record.pid, record.status, record.command, record.description, record.labels
    )
}

fn render_stream_block(name: &str, lines: &[LogLine], filter: &LogsFilter) -> Option<String> {
    let filtered: Vec<&LogLine> = lines
        .iter()
        .filter(|l| filter.since.map(|s| l.timestamp >= s).unwrap_or(true))
        .filter(|l| filter.until.map(|u| l.timestamp <= u).unwrap_or(true))
        .collect();

    let tailed: Vec<&LogLine> = if filter.tail > 0 && filtered.len() > filter.tail {
        filtered[filtered.len() - filter.tail..].to_vec()
    } else {
        filtered
    };

    let rendered: Vec<String> = tailed
        .iter()
        .map(|l| {
            if filter.add_time_prefix {
                let format = filter
                    .time_prefix_format
                    .as_deref()
                    .unwrap_or(io_util::DEFAULT_TIME_FORMAT);
                format!("{}{}", io_util::format_time_prefix(l.timestamp, format), l.text)
            } else {
                l.text.clone()
            }
        })
        .collect();

    if rendered.is_empty() {
        return None;
    }

    let (mut kept, dropped) = io_util::clamp_tail(&rendered, Some(filter.limit_lines).filter(|&l| l > 0));
    if dropped > 0 {
        kept.insert(0, format!("… {dropped} earlier lines omitted …"));
    }

    Some(format!("---\n{name}:\n---\n{}", kept.join("\n")))
}

fn render_detail(record: &ProcessRecord) -> String {
    let duration = record.duration().as_secs_f64();
    format!(
        "pid: {}\nstatus: {:?}\ncommand: {:?}\ndescription: {}\nlabels: {:?}\nstart_time: {:?}\nend_time: {:?}\nduration_seconds: {:.3}\ndirectory: {}\nexit_code: {:?}\n(use shell_bg_logs for output)",
        record.pid,
        record.status,
        record.command,
        record.description,
        record.labels,
        record.start_time,
        record.end_time,
        duration,
        record.directory,
        record.exit_code,
    )
}
