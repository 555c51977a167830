//! Process-global configuration, parsed once at startup.
//!
//! The resulting [`Config`] is an immutable snapshot: a later mutation of
//! the process environment has no effect on a running server.

use std::collections::HashSet;

/// Default grace period, in seconds, before a terminal background process
/// is swept from the registry.
const DEFAULT_RETENTION_SECONDS: u64 = 3600;

/// Immutable server configuration, built once from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// Executable basenames permitted as the head of any command segment.
    /// Empty means no command is allowed.
    pub allowed_commands: HashSet<String>,
    /// How long a terminal [`crate::record::ProcessRecord`] is kept before
    /// the retention sweep removes it.
    pub process_retention_seconds: u64,
    /// Encoding used to decode child output when a request doesn't specify one.
    pub default_encoding: String,
    /// Propagated into the child's `SHELL` environment variable only; never
    /// used to interpret a command.
    pub shell_path: String,
}

impl Config {
    /// Build configuration from the current process environment.
    pub fn from_env() -> Self {
        let mut allowed_commands = parse_command_list(std::env::var("ALLOW_COMMANDS").ok());
        allowed_commands.extend(parse_command_list(
            std::env::var("ALLOWED_COMMANDS").ok(),
        ));

        let process_retention_seconds = std::env::var("PROCESS_RETENTION_SECONDS")
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .unwrap_or_else(|| {
                tracing::debug!(
                    default = DEFAULT_RETENTION_SECONDS,
                    "PROCESS_RETENTION_SECONDS not set or invalid, using default"
                );
                DEFAULT_RETENTION_SECONDS
            });

        let default_encoding = std::env::var("DEFAULT_ENCODING")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| "utf-8".to_string());

        let shell_path = default_shell_path();

        tracing::info!(
            allowed_commands = allowed_commands.len(),
            process_retention_seconds,
            default_encoding = %default_encoding,
            "configuration loaded"
        );

        Self {
            allowed_commands,
            process_retention_seconds,
            default_encoding,
            shell_path,
        }
    }
}

/// Split a comma-separated command list, trimming whitespace and dropping
/// empty tokens.
fn parse_command_list(raw: Option<String>) -> HashSet<String> {
    raw.unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(unix)]
fn default_shell_path() -> String {
    std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
}

#[cfg(windows)]
fn default_shell_path() -> String {
    std::env::var("COMSPEC").unwrap_or_else(|_| "cmd.exe".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_command_list_trims_and_drops_empty() {
        let parsed = parse_command_list(Some(" echo, ls ,, cat".to_string()));
        assert_eq!(
            parsed,
            ["echo", "ls", "cat"].into_iter().map(String::from).collect()
        );
    }

    #[test]
    fn parse_command_list_none_is_empty() {
        assert!(parse_command_list(None).is_empty());
    }
}
