//! External process primitives for the supervisor.
//!
//! The tool is started in a fresh process group so that a stop signal
//! reaches it together with anything it forked. Arguments go straight to
//! `execve`; no shell is involved.

use std::process::Stdio;

use tokio::process::{Child, ChildStderr, ChildStdout, Command};

use crate::command::CommandLine;

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("spawned process exited before its pid could be read")]
    MissingPid,

    #[error("failed to signal process group {pgid}: {source}")]
    Signal {
        pgid: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("process group signalling is not supported on this platform")]
    Unsupported,
}

/// How a stop request is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    /// SIGINT: the tool prints its summary and exits.
    Graceful,
    /// SIGKILL.
    Forced,
}

/// A live child with its output pipes detached for separate readers.
#[derive(Debug)]
pub struct SpawnedProcess {
    pub child: Child,
    pub pid: u32,
    pub stdout: Option<ChildStdout>,
    pub stderr: Option<ChildStderr>,
}

/// Spawn `command` as the leader of a new process group.
///
/// `kill_on_drop` is set so a supervisor that unwinds never leaks the
/// child.
pub fn spawn(command: &CommandLine) -> Result<SpawnedProcess, ProcessError> {
    let mut cmd = Command::new(&command.program);
    cmd.args(&command.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd.spawn().map_err(|source| ProcessError::Spawn {
        program: command.program.clone(),
        source,
    })?;
    let pid = child.id().ok_or(ProcessError::MissingPid)?;
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    Ok(SpawnedProcess {
        child,
        pid,
        stdout,
        stderr,
    })
}

/// Signal every process in the group led by `pgid`.
///
/// Returns `Ok(false)` when the group no longer exists.
#[cfg(unix)]
pub fn signal_group(pgid: u32, mode: StopMode) -> Result<bool, ProcessError> {
    let signal = match mode {
        StopMode::Graceful => libc::SIGINT,
        StopMode::Forced => libc::SIGKILL,
    };
    // SAFETY: killpg has no memory-safety preconditions; an invalid pgid is
    // reported through errno.
    let rc = unsafe { libc::killpg(pgid as libc::pid_t, signal) };
    if rc == 0 {
        return Ok(true);
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(false)
    } else {
        Err(ProcessError::Signal { pgid, source: err })
    }
}

#[cfg(not(unix))]
pub fn signal_group(_pgid: u32, _mode: StopMode) -> Result<bool, ProcessError> {
    Err(ProcessError::Unsupported)
}
