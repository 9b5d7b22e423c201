//! Renders step actions into the commands that run inside the image.

use camino::Utf8Path;

use crate::config::{EnvironmentConfig, ToolchainConfig};
use crate::manifest::normalize_name;
use crate::step::StepAction;

/// Directory inside the build where the manifest is bind-mounted.
pub const MANIFEST_MOUNT_DIR: &str = "/tmp/envstrap";

/// Directory inside the build where secret files appear.
pub const SECRETS_DIR: &str = "/run/secrets";

/// Secret carrying the installer's package index URL.
pub const INDEX_URL_SECRET: &str = "envstrap_index_url";

/// Quotes `arg` for a POSIX shell, leaving plain words untouched.
pub(crate) fn shell_quote(arg: &str) -> String {
    let plain = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_@%+=:,./-".contains(c));
    if plain {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

/// A command with the variables it runs with.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepCommand {
    pub argv: Vec<String>,
    pub env: Vec<(String, String)>,
    /// Variables read from a secret file at run time, as `(variable, secret id)`.
    pub secret_env: Vec<(String, String)>,
}

impl StepCommand {
    /// Renders `VAR=value ... argv` as a single shell line.
    ///
    /// Variables set this way apply to the command only and are not
    /// recorded in the image configuration. Secret variables are expanded
    /// from their file inside the build, so only the file path is recorded.
    pub fn shell_line(&self) -> String {
        self.env
            .iter()
            .map(|(key, value)| format!("{}={}", key, shell_quote(value)))
            .chain(self.secret_env.iter().map(|(key, id)| {
                format!("{}=\"$(cat {}/{})\"", key, SECRETS_DIR, id)
            }))
            .chain(self.argv.iter().map(|arg| shell_quote(arg)))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Ids of the secrets this command reads.
    pub fn secret_ids(&self) -> impl Iterator<Item = &str> {
        self.secret_env.iter().map(|(_, id)| id.as_str())
    }
}

/// Path of the manifest inside the build.
pub fn manifest_target(manifest: &Utf8Path) -> String {
    format!("{}/{}", MANIFEST_MOUNT_DIR, manifest.file_name().unwrap_or("requirements.txt"))
}

fn strings(argv: &[&str]) -> Vec<String> {
    argv.iter().map(|s| s.to_string()).collect()
}

/// Command renderer for one toolchain and environment.
#[derive(Debug, Clone, Copy)]
pub struct Toolchain<'a> {
    config: &'a ToolchainConfig,
    environment: &'a EnvironmentConfig,
}

impl<'a> Toolchain<'a> {
    pub fn new(config: &'a ToolchainConfig, environment: &'a EnvironmentConfig) -> Self {
        Self {
            config,
            environment,
        }
    }

    fn pip(&self, args: &[&str]) -> Vec<String> {
        let mut argv = vec![self.config.python.clone(), "-m".to_string(), "pip".to_string()];
        argv.extend(strings(args));
        argv
    }

    fn base_env(&self) -> Vec<(String, String)> {
        self.environment
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    fn pip_env(&self) -> Vec<(String, String)> {
        let mut env = self.base_env();
        env.push(("PIP_DISABLE_PIP_VERSION_CHECK".to_string(), "1".to_string()));
        env.push(("PIP_ROOT_USER_ACTION".to_string(), "ignore".to_string()));
        env
    }

    /// The mirror reaches the installer through a secret so credentials in
    /// the URL stay out of the image history.
    fn pip_secret_env(&self) -> Vec<(String, String)> {
        match self.environment.index_url {
            Some(_) => vec![("PIP_INDEX_URL".to_string(), INDEX_URL_SECRET.to_string())],
            None => Vec::new(),
        }
    }

    /// Value of the secret `id`, if this environment provides it.
    pub fn secret(&self, id: &str) -> Option<String> {
        match id {
            INDEX_URL_SECRET => self.environment.index_url.clone(),
            _ => None,
        }
    }

    /// Renders the command for `action`.
    pub fn render(&self, action: &StepAction) -> StepCommand {
        let system = self.config.system;
        match action {
            StepAction::RefreshIndex => StepCommand {
                argv: system.refresh_command(),
                env: self.base_env(),
                ..Default::default()
            },
            // nothing to install, but the step still commits its layer
            StepAction::InstallSystemPackages(packages) if packages.is_empty() => StepCommand {
                argv: vec!["true".to_string()],
                env: self.base_env(),
                ..Default::default()
            },
            StepAction::InstallSystemPackages(packages) => {
                let mut env = self.base_env();
                env.extend(system.noninteractive_env());
                StepCommand {
                    argv: system.install_command(packages),
                    env,
                    ..Default::default()
                }
            }
            StepAction::UpgradeInstaller => StepCommand {
                argv: self.pip(&["install", "--upgrade", "pip"]),
                env: self.pip_env(),
                secret_env: self.pip_secret_env(),
            },
            StepAction::InstallManifest { manifest, no_cache } => {
                let mut argv = self.pip(&["install"]);
                let mut env = self.pip_env();
                if *no_cache {
                    argv.push("--no-cache-dir".to_string());
                    env.push(("PIP_NO_CACHE_DIR".to_string(), "1".to_string()));
                }
                argv.push("-r".to_string());
                argv.push(manifest_target(manifest));
                StepCommand {
                    argv,
                    env,
                    secret_env: self.pip_secret_env(),
                }
            }
        }
    }

    /// Command listing installed system packages.
    pub fn system_query(&self) -> Vec<String> {
        self.config.system.query_command()
    }

    /// Parses one line of [`system_query`](Self::system_query) output.
    pub fn parse_system_line(&self, line: &str) -> Option<(String, String)> {
        self.config.system.parse_query_line(line)
    }

    /// Command listing installed dependencies as `name==version` lines.
    pub fn dependency_query(&self) -> Vec<String> {
        self.pip(&["list", "--format=freeze", "--disable-pip-version-check"])
    }

    /// Parses one `name==version` line into a normalized name and version.
    pub fn parse_dependency_line(&self, line: &str) -> Option<(String, String)> {
        let (name, version) = line.trim().split_once("==")?;
        Some((normalize_name(name), version.trim().to_string()))
    }
}
