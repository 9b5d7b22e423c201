//! Domain-specific error types for envstrap.
//!
//! This module defines `EnvstrapError`, a `thiserror`-based enum for the
//! failure modes that sit outside a build's step sequence: profile loading,
//! validation, and command execution plumbing. Failures of the provisioning
//! steps themselves are reported through [`crate::result::BuildError`].
//!
//! `EnvstrapError` implements `Into<anyhow::Error>`, so the `?` operator
//! converts it automatically at trait boundaries that return `anyhow::Result`.

use std::io;

/// Formats an IO error kind into a human-readable message.
///
/// Provides consistent messages for common IO error kinds
/// (e.g., "I/O error: not found") instead of the OS-level messages
/// (e.g., "No such file or directory (os error 2)").
pub(crate) fn io_error_kind_message(err: &io::Error) -> String {
    match err.kind() {
        io::ErrorKind::NotFound => "I/O error: not found".to_string(),
        io::ErrorKind::PermissionDenied => "I/O error: permission denied".to_string(),
        io::ErrorKind::IsADirectory => "I/O error: is a directory".to_string(),
        _ => format!("I/O error: {}", err),
    }
}

/// Domain-specific error type for envstrap.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum EnvstrapError {
    /// A validation constraint was violated.
    #[error("validation error: {0}")]
    Validation(String),

    /// A command execution failed (spawn failure, wait failure, thread panic, etc.).
    #[error("command execution failed: {command}: {status}")]
    Execution {
        /// The command that was executed.
        command: String,
        /// Human-readable reason for the failure.
        status: String,
    },

    /// The command was not found in `PATH`.
    #[error("command not found in PATH: {command}")]
    CommandNotFound {
        /// The command that was looked up.
        command: String,
    },

    /// A configuration file could not be loaded or parsed.
    #[error("configuration error: {0}")]
    Config(String),

    /// An I/O operation failed with contextual information.
    #[error("{context}: {message}")]
    Io {
        /// What was being done when the error occurred, usually including a path.
        context: String,
        /// Human-readable description derived from [`io_error_kind_message`].
        message: String,
        /// The underlying I/O error, preserved for programmatic inspection.
        #[source]
        source: std::io::Error,
    },
}

impl EnvstrapError {
    /// Creates an `Io` variant with the `message` field derived from `source`.
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            message: io_error_kind_message(&source),
            source,
        }
    }
}
