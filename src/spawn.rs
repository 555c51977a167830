//! Shared child-process construction used by both the synchronous executor
//! and the background supervisor: always a direct argv exec, never a shell.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;

/// Everything needed to build a [`tokio::process::Command`] for a validated
/// request. `argv` must already have passed [`crate::validator::validate_command`].
pub struct SpawnSpec<'a> {
    pub argv: &'a [String],
    pub directory: &'a Path,
    pub envs: &'a HashMap<String, String>,
    pub shell_path: &'a str,
}

/// Build a [`Command`] that execs `argv[0]` directly with `argv[1..]` as
/// arguments -- no shell interpolation of any kind. The parent environment
/// is inherited and overlaid, per key, by `spec.envs`; `SHELL` is set from
/// the server's configured shell path if not already overridden by the
/// caller. The child is placed in its own process group (POSIX `setsid`)
/// so the whole tree can be signaled together.
pub fn build_command(spec: &SpawnSpec<'_>) -> Command {
    let mut cmd = Command::new(&spec.argv[0]);
    cmd.args(&spec.argv[1..]);
    cmd.current_dir(spec.directory);
    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    cmd.env("SHELL", spec.shell_path);
    for (key, value) in spec.envs {
        cmd.env(key, value);
    }

    // SAFETY: pre_exec runs after fork, before exec, in the child process
    // only -- no other threads are running in that address space yet.
    unsafe {
        cmd.pre_exec(|| {
            nix::unistd::setsid().map_err(std::io::Error::other)?;
            Ok(())
        });
    }

    cmd
}

/// Send a signal to a child's process group (negative of its OS pid, valid
/// because [`build_command`] always calls `setsid`).
pub fn signal_process_group(os_pid: u32, signal: nix::sys::signal::Signal) -> Result<(), String> {
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(-(os_pid as i32)), signal)
        .map_err(|e| format!("failed to signal process group {os_pid}: {e}"))
}
