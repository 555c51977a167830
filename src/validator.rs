//! Command allow-list validation and directory checks.
//!
//! Commands are never interpreted by a shell. An argument vector is
//! tokenized on exact-match shell-operator tokens into segments, and the
//! head of every segment must be a member of the configured allow-list.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// The only tokens recognized as shell-operator delimiters. Recognized by
/// exact whole-token match only -- a token like `"|nope"` is a plain
/// argument, not an operator.
pub const SHELL_OPERATORS: [&str; 4] = [";", "&&", "||", "|"];

/// A validation failure, carrying the exact human-readable reason that is
/// part of the tool response wire contract.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct ValidationError(pub String);

fn is_operator(token: &str) -> bool {
    SHELL_OPERATORS.contains(&token)
}

/// Validate a full command argument vector against the allow-list.
///
/// `argv` is partitioned into segments delimited by exact-match operator
/// tokens; every segment's head must be present in `allowed`.
pub fn validate_command(
    argv: &[String],
    allowed: &HashSet<String>,
) -> Result<(), ValidationError> {
    if argv.is_empty() {
        return Err(ValidationError("No command provided".to_string()));
    }

    let mut segment: Vec<&str> = Vec::new();
    let mut segments: Vec<Vec<&str>> = Vec::new();

    for token in argv {
        if is_operator(token) {
            segments.push(std::mem::take(&mut segment));
        } else {
            segment.push(token.as_str());
        }
    }
    segments.push(segment);

    for seg in &segments {
        if seg.is_empty() {
            return Err(ValidationError(
                "Empty command between shell operators".to_string(),
            ));
        }
        let head = seg[0];
        if head.is_empty() || !allowed.contains(head) {
            return Err(ValidationError(format!("Command not allowed: {head}")));
        }
    }

    Ok(())
}

/// Validate a working directory: non-empty, absolute, and an existing
/// directory.
pub fn validate_directory(dir: &str) -> Result<PathBuf, ValidationError> {
    if dir.is_empty() {
        return Err(ValidationError("Directory is not absolute".to_string()));
    }
    let path = Path::new(dir);
    if !path.is_absolute() {
        return Err(ValidationError("Directory is not absolute".to_string()));
    }
    match std::fs::metadata(path) {
        Ok(meta) if meta.is_dir() => Ok(path.to_path_buf()),
        _ => Err(ValidationError("Directory does not exist".to_string())),
    }
}
