//! Command execution abstraction for envstrap.
//!
//! This module provides:
//! - [`CommandSpec`]: Specification for commands to execute
//! - [`ExecutionResult`]: Result of command execution, including captured output
//! - [`CommandExecutor`]: Trait for command execution strategies
//! - [`RealCommandExecutor`]: Production implementation using `std::process::Command`

mod pipe;
mod real;

use std::process::ExitStatus;
use std::time::Duration;

use anyhow::Result;

use crate::privilege::PrivilegeMethod;

pub use real::RealCommandExecutor;

/// Maximum number of trailing output lines kept in a diagnostic.
pub const DIAGNOSTIC_TAIL_LINES: usize = 40;

/// Formats string arguments into a space-separated, debug-quoted string.
///
/// Used by error messages and dry-run output to consistently format
/// command arguments (e.g., `"run" "--rm" "runtime:X"`).
pub(crate) fn format_command_args(args: &[String]) -> String {
    args.iter()
        .map(|a| format!("{:?}", a))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Specification for a command to be executed
#[derive(Debug, Clone)]
pub struct CommandSpec {
    /// The command to execute (e.g., "docker")
    pub command: String,
    /// Command arguments
    pub args: Vec<String>,
    /// Environment variables to set (in addition to inherited environment)
    pub env: Vec<(String, String)>,
    /// Privilege escalation method to wrap the command
    pub privilege: Option<PrivilegeMethod>,
    /// Wall-clock budget; the process group is killed when it is exceeded
    pub timeout: Option<Duration>,
}

impl CommandSpec {
    /// Creates a new CommandSpec with command and args
    #[must_use]
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            env: Vec::new(),
            privilege: None,
            timeout: None,
        }
    }

    /// Sets the privilege escalation method
    #[must_use]
    pub fn with_privilege(mut self, privilege: Option<PrivilegeMethod>) -> Self {
        self.privilege = privilege;
        self
    }

    /// Sets the wall-clock budget
    #[must_use]
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Adds an environment variable
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Returns the command line as it will be displayed in logs and errors.
    pub fn display(&self) -> String {
        format!("{} {}", self.command, format_command_args(&self.args))
    }
}

/// Lines captured from a child process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
}

impl CapturedOutput {
    /// Returns the captured stdout joined with newlines.
    pub fn stdout_text(&self) -> String {
        self.stdout.join("\n")
    }

    /// Returns a diagnostic built from the last lines of stderr, or of
    /// stdout when stderr is empty.
    pub fn diagnostic(&self) -> String {
        let lines = if self.stderr.is_empty() {
            &self.stdout
        } else {
            &self.stderr
        };
        let start = lines.len().saturating_sub(DIAGNOSTIC_TAIL_LINES);
        lines[start..].join("\n")
    }
}

/// Result of command execution
#[derive(Debug, Default)]
pub struct ExecutionResult {
    /// Exit status of the command (None in dry-run mode)
    pub status: Option<ExitStatus>,
    /// Output captured while the command ran
    pub output: CapturedOutput,
    /// Set when the command was killed for exceeding its budget
    pub timed_out: bool,
}

impl ExecutionResult {
    /// Returns true if the command executed successfully.
    ///
    /// In dry-run mode (status is None), this always returns true.
    pub fn success(&self) -> bool {
        !self.timed_out && self.status.is_none_or(|s| s.success())
    }

    /// Returns the exit code if available
    pub fn code(&self) -> Option<i32> {
        self.status.and_then(|s| s.code())
    }
}

/// Trait for command execution.
///
/// Implementations must be `Send + Sync` so the executor can be shared
/// as `Arc<dyn CommandExecutor>`.
pub trait CommandExecutor: Send + Sync {
    /// Executes a command with the given specification.
    fn execute(&self, spec: &CommandSpec) -> Result<ExecutionResult>;
}
