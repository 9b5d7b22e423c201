//! Real command executor implementation.
//!
//! This module provides [`RealCommandExecutor`], which executes commands
//! using `std::process::Command` with real-time output streaming, output
//! capture and an optional wall-clock budget.

use std::os::unix::process::CommandExt;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::Result;
use rustix::process::{Pid, Signal, kill_process_group};
use which::which;

use super::pipe::{StreamType, panic_message, read_pipe_to_log};
use super::{CapturedOutput, CommandExecutor, CommandSpec, ExecutionResult};
use crate::error::EnvstrapError;

/// How often a budgeted child is polled for completion.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Time a terminated process group gets before it is killed outright.
const TERMINATE_GRACE: Duration = Duration::from_secs(2);

/// Time reader threads get to drain once a timed-out child is gone.
const READER_GRACE: Duration = Duration::from_secs(2);

/// Sends `signal` to the process group led by `child`.
fn signal_group(child: &Child, signal: Signal) {
    let pid = Pid::from_child(child);
    if let Err(e) = kill_process_group(pid, signal) {
        tracing::debug!(
            pgid = child.id(),
            "signalling process group returned error (group may have already exited): {}",
            e
        );
    }
}

/// Stops the child and everything it spawned.
///
/// The group gets `SIGTERM` first so wrappers such as `sudo` can relay it,
/// then `SIGKILL` once [`TERMINATE_GRACE`] has passed.
fn terminate_group(child: &mut Child) -> std::io::Result<ExitStatus> {
    signal_group(child, Signal::TERM);
    let grace_end = Instant::now() + TERMINATE_GRACE;
    while Instant::now() < grace_end {
        if let Some(status) = child.try_wait()? {
            // the leader is gone but its descendants may not be
            signal_group(child, Signal::KILL);
            return Ok(status);
        }
        thread::sleep(POLL_INTERVAL);
    }
    signal_group(child, Signal::KILL);
    if let Err(e) = child.kill() {
        tracing::debug!("kill returned error (process may have already exited): {}", e);
    }
    child.wait()
}

/// Cleans up a child process and its associated reader threads.
///
/// Kills the child's process group, waits for the child to terminate, and
/// joins all reader threads to prevent resource leaks.
fn cleanup_child_process<I>(child: &mut Child, handles: I)
where
    I: IntoIterator<Item = JoinHandle<Vec<String>>>,
{
    let pid = child.id();
    signal_group(child, Signal::KILL);
    if let Err(e) = child.kill() {
        tracing::debug!(pid = pid, "kill returned error (process may have already exited): {}", e);
    }
    if let Err(e) = child.wait() {
        tracing::warn!(pid = pid, "failed to wait for child process after kill: {}", e);
    }
    for handle in handles {
        if let Err(e) = handle.join() {
            tracing::warn!("reader thread panicked during cleanup: {}", panic_message(&*e));
        }
    }
}

/// Waits for the child, terminating its process group once `budget` is
/// exhausted.
///
/// A budget too large to represent as a deadline is treated as no budget.
/// Returns the exit status and whether the budget was exceeded.
fn wait_with_budget(
    child: &mut Child,
    budget: Option<Duration>,
) -> std::io::Result<(ExitStatus, bool)> {
    let bounded = budget.and_then(|budget| Some((budget, Instant::now().checked_add(budget)?)));
    let Some((budget, deadline)) = bounded else {
        return child.wait().map(|status| (status, false));
    };

    loop {
        if let Some(status) = child.try_wait()? {
            return Ok((status, false));
        }
        let now = Instant::now();
        if now >= deadline {
            tracing::warn!(pid = child.id(), "command exceeded budget of {:?}, killing", budget);
            return terminate_group(child).map(|status| (status, true));
        }
        thread::sleep(POLL_INTERVAL.min(deadline - now));
    }
}

/// Waits up to `grace` for every reader to finish.
///
/// A reader still blocked afterwards belongs to a process that escaped the
/// group kill (for example one that re-parented itself under a privileged
/// wrapper); it is detached and its stream is reported empty.
fn join_readers_within(
    handles: [(&'static str, JoinHandle<Vec<String>>); 2],
    grace: Duration,
) -> Vec<(&'static str, Option<std::thread::Result<Vec<String>>>)> {
    let grace_end = Instant::now() + grace;
    while Instant::now() < grace_end && !handles.iter().all(|(_, h)| h.is_finished()) {
        thread::sleep(POLL_INTERVAL.min(grace));
    }
    handles
        .into_iter()
        .map(|(name, handle)| {
            if handle.is_finished() {
                (name, Some(handle.join()))
            } else {
                tracing::warn!(stream = name, "reader still blocked after timeout, detaching");
                (name, None)
            }
        })
        .collect()
}

/// Command executor that runs actual system commands.
///
/// When `dry_run` is true, commands are logged but not executed,
/// and `execute()` returns a result without an exit status.
pub struct RealCommandExecutor {
    pub dry_run: bool,
}

impl RealCommandExecutor {
    fn execution_error(spec: &CommandSpec, status: String) -> anyhow::Error {
        EnvstrapError::Execution {
            command: spec.display(),
            status,
        }
        .into()
    }
}

impl CommandExecutor for RealCommandExecutor {
    fn execute(&self, spec: &CommandSpec) -> Result<ExecutionResult> {
        if self.dry_run {
            tracing::info!("dry run: {}", spec.display());
            return Ok(ExecutionResult::default());
        }

        let (program, args) = match spec.privilege {
            Some(method) => method.wrap(&spec.command, &spec.args),
            None => (spec.command.clone(), spec.args.clone()),
        };

        let cmd = which(&program).map_err(|_| EnvstrapError::CommandNotFound {
            command: program.clone(),
        })?;
        tracing::trace!("command found: {}: {}", program, cmd.to_string_lossy());

        let mut command = Command::new(cmd);
        command.args(&args);
        for (key, value) in &spec.env {
            command.env(key, value);
        }
        command.stdin(Stdio::null());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        // own process group, so a timeout reaches every descendant
        command.process_group(0);

        let mut child = command
            .spawn()
            .map_err(|e| Self::execution_error(spec, format!("failed to spawn: {}", e)))?;

        tracing::trace!("spawned command: {}: pid={}", program, child.id());

        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();

        let stdout_handle = match thread::Builder::new()
            .name("stdout-reader".to_string())
            .spawn(move || read_pipe_to_log(stdout_pipe, StreamType::Stdout))
        {
            Ok(handle) => handle,
            Err(e) => {
                cleanup_child_process(&mut child, []);
                return Err(Self::execution_error(
                    spec,
                    format!("failed to spawn stdout reader thread: {}", e),
                ));
            }
        };

        let stderr_handle = match thread::Builder::new()
            .name("stderr-reader".to_string())
            .spawn(move || read_pipe_to_log(stderr_pipe, StreamType::Stderr))
        {
            Ok(handle) => handle,
            Err(e) => {
                cleanup_child_process(&mut child, [stdout_handle]);
                return Err(Self::execution_error(
                    spec,
                    format!("failed to spawn stderr reader thread: {}", e),
                ));
            }
        };

        let (status, timed_out) = match wait_with_budget(&mut child, spec.timeout) {
            Ok(waited) => waited,
            Err(e) => {
                cleanup_child_process(&mut child, [stdout_handle, stderr_handle]);
                return Err(Self::execution_error(
                    spec,
                    format!("failed to wait for command: {}", e),
                ));
            }
        };

        let handles = [("stdout", stdout_handle), ("stderr", stderr_handle)];
        let joined: Vec<_> = if timed_out {
            join_readers_within(handles, READER_GRACE)
        } else {
            handles
                .into_iter()
                .map(|(name, handle)| (name, Some(handle.join())))
                .collect()
        };

        let mut output = CapturedOutput::default();
        let mut panicked_streams = Vec::new();
        for (name, joined) in joined {
            match joined {
                None => {}
                Some(Ok(lines)) if name == "stdout" => output.stdout = lines,
                Some(Ok(lines)) => output.stderr = lines,
                Some(Err(e)) => {
                    let msg = panic_message(&*e);
                    tracing::error!(stream = name, panic = msg, "reader thread panicked");
                    panicked_streams.push(format!("{}: {}", name, msg));
                }
            }
        }

        if !panicked_streams.is_empty() {
            return Err(Self::execution_error(
                spec,
                format!(
                    "reader thread(s) panicked during command execution: {}",
                    panicked_streams.join(", ")
                ),
            ));
        }

        tracing::trace!(
            "executed command: {}: success={} timed_out={}",
            program,
            status.success(),
            timed_out
        );

        Ok(ExecutionResult {
            status: Some(status),
            output,
            timed_out,
        })
    }
}
