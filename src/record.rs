//! Background process records: status state machine and bounded,
//! timestamped log buffers.

use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::time::SystemTime;

/// Maximum number of lines retained per stream before the oldest are
/// evicted in favor of a truncation sentinel.
const MAX_LOG_LINES: usize = 10_000;
/// Maximum number of bytes retained per stream, whichever limit is hit first.
const MAX_LOG_BYTES: usize = 1024 * 1024;

const TRUNCATION_SENTINEL: &str = "… log truncated …";

/// One decoded, timestamped line of captured output.
#[derive(Debug, Clone, Serialize)]
pub struct LogLine {
    pub timestamp: SystemTime,
    pub text: String,
}

/// Terminal and non-terminal states of a supervised background process.
/// Once a record leaves `Running` it never transitions again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    Running,
    Completed,
    Failed,
    Terminated,
    Error,
}

impl ProcessStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, ProcessStatus::Running)
    }
}

/// A bounded, append-only log stream. Oldest lines are evicted once either
/// the line-count or byte-size cap is exceeded, leaving a single sentinel
/// line at the head marking that truncation occurred.
#[derive(Debug, Clone, Default)]
pub struct BoundedLog {
    lines: VecDeque<LogLine>,
    bytes: usize,
    truncated: bool,
}

impl BoundedLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, line: LogLine) {
        self.bytes += line.text.len();
        self.lines.push_back(line);
        while self.lines.len() > MAX_LOG_LINES || self.bytes > MAX_LOG_BYTES {
            if let Some(evicted) = self.lines.pop_front() {
                self.bytes = self.bytes.saturating_sub(evicted.text.len());
                self.truncated = true;
            } else {
                break;
            }
        }
    }

    /// A consistent snapshot of the current contents, with the truncation
    /// sentinel prepended if any lines have ever been evicted.
    #[must_use]
    pub fn snapshot(&self) -> Vec<LogLine> {
        let mut out = Vec::with_capacity(self.lines.len() + 1);
        if self.truncated {
            out.push(LogLine {
                timestamp: self
                    .lines
                    .front()
                    .map(|l| l.timestamp)
                    .unwrap_or_else(SystemTime::now),
                text: TRUNCATION_SENTINEL.to_string(),
            });
        }
        out.extend(self.lines.iter().cloned());
        out
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

/// The full state of one supervised background process.
#[derive(Debug, Clone)]
pub struct ProcessRecord {
    pub pid: u64,
    pub os_pid: Option<u32>,
    pub command: Vec<String>,
    pub directory: String,
    pub description: String,
    pub labels: Vec<String>,
    pub stdin: Option<String>,
    pub envs: HashMap<String, String>,
    pub encoding: String,
    pub timeout: Option<u64>,

    pub status: ProcessStatus,
    pub start_time: SystemTime,
    pub end_time: Option<SystemTime>,
    pub exit_code: Option<i32>,

    pub stdout_log: BoundedLog,
    pub stderr_log: BoundedLog,

    pub error_message: Option<String>,
    /// Set once a `stop` has been requested, so the completion task knows
    /// to record `Terminated` rather than `Completed`/`Failed`.
    pub stop_requested: bool,
}

impl ProcessRecord {
    /// Transition this record to a terminal status. No-op (logs a warning)
    /// if the record is already terminal -- the state machine forbids
    /// leaving a terminal state.
    pub fn finish(&mut self, status: ProcessStatus, exit_code: Option<i32>) {
        if self.status.is_terminal() {
            tracing::warn!(
                pid = self.pid,
                current = ?self.status,
                attempted = ?status,
                "ignoring transition out of terminal state"
            );
            return;
        }
        self.status = status;
        self.exit_code = exit_code;
        self.end_time = Some(SystemTime::now());
    }

    /// Duration since start, or total runtime if the process has finished.
    #[must_use]
    pub fn duration(&self) -> std::time::Duration {
        let end = self.end_time.unwrap_or_else(SystemTime::now);
        end.duration_since(self.start_time)
            .unwrap_or(std::time::Duration::ZERO)
    }
}
