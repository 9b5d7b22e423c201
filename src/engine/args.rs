//! Argument builder for engine client invocations.

/// Defines how a flag and its value are rendered in command arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagValueStyle {
    /// Render flag and value as separate arguments: `--flag value`.
    Separate,
    /// Render flag and value as a single argument with equals: `--flag=value`.
    Equals,
}

/// Builder for assembling engine client arguments.
#[derive(Debug, Default)]
pub struct CommandArgsBuilder {
    args: Vec<String>,
}

impl CommandArgsBuilder {
    pub fn new() -> Self {
        Self { args: Vec::new() }
    }

    /// Append a raw argument.
    pub fn push_arg(&mut self, arg: impl Into<String>) -> &mut Self {
        self.args.push(arg.into());
        self
    }

    /// Append a flag only when `enabled` is set.
    pub fn push_flag_if(&mut self, flag: &str, enabled: bool) -> &mut Self {
        if enabled {
            self.args.push(flag.to_string());
        }
        self
    }

    /// Append a flag with value if the value is not empty.
    pub fn push_flag_value(&mut self, flag: &str, value: &str, style: FlagValueStyle) -> &mut Self {
        if value.is_empty() {
            return self;
        }

        match style {
            FlagValueStyle::Separate => {
                self.args.push(flag.to_string());
                self.args.push(value.to_string());
            }
            FlagValueStyle::Equals => {
                self.args.push(format!("{}={}", flag, value));
            }
        }
        self
    }

    /// Append `flag KEY=VALUE` for each pair, e.g. `--build-arg HTTP_PROXY=...`.
    pub fn push_key_values(&mut self, flag: &str, pairs: &[(String, String)]) -> &mut Self {
        for (key, value) in pairs {
            self.push_flag_value(flag, &format!("{}={}", key, value), FlagValueStyle::Separate);
        }
        self
    }

    /// Return the collected arguments.
    pub fn into_args(self) -> Vec<String> {
        self.args
    }
}
