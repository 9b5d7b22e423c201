//! Privilege escalation configuration.
//!
//! Container engines frequently require root (a rootful `docker` daemon socket,
//! for instance). The engine configuration may name a privilege escalation
//! method that wraps every engine invocation.

use serde::{Deserialize, Serialize};

/// Privilege escalation method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrivilegeMethod {
    /// Use `sudo` for privilege escalation.
    Sudo,
    /// Use `doas` for privilege escalation.
    Doas,
}

impl PrivilegeMethod {
    /// Returns the command name for this privilege method.
    pub fn command_name(&self) -> &'static str {
        match self {
            Self::Sudo => "sudo",
            Self::Doas => "doas",
        }
    }

    /// Wraps `command` and `args` so they run through this method.
    ///
    /// Returns the program to execute and its full argument list.
    pub fn wrap(&self, command: &str, args: &[String]) -> (String, Vec<String>) {
        let mut wrapped = Vec::with_capacity(args.len() + 2);
        if *self == Self::Sudo {
            // keep explicitly passed variables such as DEBIAN_FRONTEND
            wrapped.push("--preserve-env".to_string());
        }
        wrapped.push(command.to_string());
        wrapped.extend(args.iter().cloned());
        (self.command_name().to_string(), wrapped)
    }
}

impl std::fmt::Display for PrivilegeMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.command_name())
    }
}
