//! Profile configuration.
//!
//! A profile is a YAML document describing one build: the base image, the
//! system package set, the dependency manifest and the explicit environment
//! the steps run with. Nothing is read from ambient environment variables;
//! proxies and mirrors are part of the profile.

use std::collections::BTreeMap;
use std::fs;
use std::sync::Arc;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::engine::{CliEngine, ContainerEngine, EngineKind};
use crate::error::EnvstrapError;
use crate::executor::CommandExecutor;
use crate::image::BaseImage;
use crate::manifest::DependencyManifest;
use crate::packages::{SystemPackageManager, SystemPackageSet};
use crate::privilege::PrivilegeMethod;

/// Directory, relative to the profile, used for engine scratch files.
pub const DEFAULT_WORK_DIR: &str = ".envstrap";

const DEFAULT_PYTHON: &str = "python3";
const DEFAULT_STEP_TIMEOUT_SECS: u64 = 3600;
const DEFAULT_INDEX_RETRIES: u32 = 3;
const DEFAULT_RETRY_DELAY_SECS: u64 = 5;
const MAX_INDEX_RETRIES: u32 = 10;
/// One week.
const MAX_STEP_TIMEOUT_SECS: u64 = 7 * 24 * 60 * 60;

/// Options for an engine driven through its command-line client.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CliEngineConfig {
    /// Wrap every engine invocation with `sudo` or `doas`.
    #[serde(default)]
    pub privilege: Option<PrivilegeMethod>,
    /// Scratch directory for generated build files (relative to the profile).
    #[serde(default)]
    pub work_dir: Option<Utf8PathBuf>,
}

/// Container engine configuration.
///
/// The `type` field in YAML selects the engine. Defaults to docker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum EngineConfig {
    Docker(CliEngineConfig),
    Podman(CliEngineConfig),
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::Docker(CliEngineConfig::default())
    }
}

impl EngineConfig {
    fn kind_and_options(&self) -> (EngineKind, &CliEngineConfig) {
        match self {
            Self::Docker(cfg) => (EngineKind::Docker, cfg),
            Self::Podman(cfg) => (EngineKind::Podman, cfg),
        }
    }

    fn options_mut(&mut self) -> &mut CliEngineConfig {
        match self {
            Self::Docker(cfg) | Self::Podman(cfg) => cfg,
        }
    }

    /// Returns a boxed engine that runs its client through `executor`.
    ///
    /// Should only be called after [`load_profile`] resolved the work directory.
    pub fn as_engine(&self, executor: Arc<dyn CommandExecutor>) -> Box<dyn ContainerEngine> {
        let (kind, cfg) = self.kind_and_options();
        let work_dir = cfg
            .work_dir
            .clone()
            .unwrap_or_else(|| Utf8PathBuf::from(DEFAULT_WORK_DIR));
        Box::new(CliEngine::new(kind, executor, work_dir).with_privilege(cfg.privilege))
    }
}

/// Package managers used inside the image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToolchainConfig {
    /// OS-level package manager (defaults to apt)
    #[serde(default)]
    pub system: SystemPackageManager,
    /// Python interpreter that runs `-m pip`
    #[serde(default = "default_python")]
    pub python: String,
}

fn default_python() -> String {
    DEFAULT_PYTHON.to_string()
}

impl Default for ToolchainConfig {
    fn default() -> Self {
        Self {
            system: SystemPackageManager::default(),
            python: default_python(),
        }
    }
}

/// Network environment the steps run with.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnvironmentConfig {
    #[serde(default)]
    pub http_proxy: Option<String>,
    #[serde(default)]
    pub https_proxy: Option<String>,
    #[serde(default)]
    pub no_proxy: Option<String>,
    /// Package index mirror for the language-level installer.
    #[serde(default)]
    pub index_url: Option<String>,
    /// Additional variables set for every step.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl EnvironmentConfig {
    /// Proxy settings as build-time variables, in both spellings tools look for.
    pub fn proxy_vars(&self) -> Vec<(String, String)> {
        let settings = [
            ("HTTP_PROXY", &self.http_proxy),
            ("HTTPS_PROXY", &self.https_proxy),
            ("NO_PROXY", &self.no_proxy),
        ];
        let mut vars = Vec::new();
        for (key, value) in settings {
            if let Some(value) = value {
                vars.push((key.to_string(), value.clone()));
                vars.push((key.to_lowercase(), value.clone()));
            }
        }
        vars
    }

    pub fn validate(&self) -> Result<(), EnvstrapError> {
        let urls = [
            ("http_proxy", &self.http_proxy),
            ("https_proxy", &self.https_proxy),
            ("index_url", &self.index_url),
        ];
        for (label, value) in urls {
            if let Some(value) = value {
                Url::parse(value).map_err(|e| {
                    EnvstrapError::Validation(format!(
                        "environment.{} '{}' is not a valid URL: {}",
                        label, value, e
                    ))
                })?;
            }
        }

        for key in self.env.keys() {
            let valid = key
                .chars()
                .next()
                .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
                && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
            if !valid {
                return Err(EnvstrapError::Validation(format!(
                    "environment.env key '{}' is not a valid variable name",
                    key
                )));
            }
        }
        Ok(())
    }
}

/// Execution policy for the step sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyConfig {
    /// Wall-clock budget per step; `null` disables the budget.
    #[serde(default = "default_step_timeout")]
    pub step_timeout_secs: Option<u64>,
    /// Additional attempts for the package index refresh.
    #[serde(default = "default_index_retries")]
    pub index_retries: u32,
    /// Pause between index refresh attempts.
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,
}

fn default_step_timeout() -> Option<u64> {
    Some(DEFAULT_STEP_TIMEOUT_SECS)
}

fn default_index_retries() -> u32 {
    DEFAULT_INDEX_RETRIES
}

fn default_retry_delay() -> u64 {
    DEFAULT_RETRY_DELAY_SECS
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            step_timeout_secs: default_step_timeout(),
            index_retries: default_index_retries(),
            retry_delay_secs: default_retry_delay(),
        }
    }
}

impl PolicyConfig {
    pub fn step_timeout(&self) -> Option<Duration> {
        self.step_timeout_secs.map(Duration::from_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn validate(&self) -> Result<(), EnvstrapError> {
        if self.step_timeout_secs == Some(0) {
            return Err(EnvstrapError::Validation(
                "policy.step_timeout_secs must be greater than 0".to_string(),
            ));
        }
        if let Some(secs) = self.step_timeout_secs.filter(|secs| *secs > MAX_STEP_TIMEOUT_SECS) {
            return Err(EnvstrapError::Validation(format!(
                "policy.step_timeout_secs must be at most {}, got {}",
                MAX_STEP_TIMEOUT_SECS, secs
            )));
        }
        if self.index_retries > MAX_INDEX_RETRIES {
            return Err(EnvstrapError::Validation(format!(
                "policy.index_retries must be at most {}, got {}",
                MAX_INDEX_RETRIES, self.index_retries
            )));
        }
        Ok(())
    }
}

/// Everything the provisioner needs besides its three inputs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProvisionConfig {
    pub toolchain: ToolchainConfig,
    pub environment: EnvironmentConfig,
    pub policy: PolicyConfig,
    /// Tag applied to the final image.
    pub tag: Option<String>,
}

/// A build profile loaded from YAML.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Profile {
    /// Directory containing the profile file; relative paths resolve against it.
    #[serde(skip)]
    pub dir: Utf8PathBuf,
    pub base: BaseImage,
    #[serde(default)]
    pub system_packages: SystemPackageSet,
    pub manifest: Utf8PathBuf,
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub toolchain: ToolchainConfig,
    #[serde(default)]
    pub environment: EnvironmentConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
}

impl Profile {
    /// Resolves relative paths against `base_dir`.
    pub fn resolve_paths(&mut self, base_dir: &Utf8Path) {
        self.dir = base_dir.to_owned();
        if self.manifest.is_relative() {
            self.manifest = base_dir.join(&self.manifest);
        }
        let options = self.engine.options_mut();
        let work_dir = options
            .work_dir
            .take()
            .unwrap_or_else(|| Utf8PathBuf::from(DEFAULT_WORK_DIR));
        options.work_dir = Some(if work_dir.is_relative() {
            base_dir.join(work_dir)
        } else {
            work_dir
        });
    }

    /// The explicit configuration object handed to the provisioner.
    pub fn provision_config(&self) -> ProvisionConfig {
        ProvisionConfig {
            toolchain: self.toolchain.clone(),
            environment: self.environment.clone(),
            policy: self.policy.clone(),
            tag: self.tag.clone(),
        }
    }

    /// Validates the profile.
    ///
    /// Checks that the manifest is a readable, self-contained regular file
    /// and that every environment and policy setting is usable.
    pub fn validate(&self) -> Result<(), EnvstrapError> {
        validate_manifest_file(&self.manifest)?;
        DependencyManifest::load(&self.manifest)?.ensure_self_contained()?;

        let python = self.toolchain.python.as_str();
        if python.is_empty() || python.chars().any(|c| c.is_whitespace()) {
            return Err(EnvstrapError::Validation(format!(
                "toolchain.python '{}' must be a single non-empty command",
                python
            )));
        }

        if let Some(tag) = &self.tag {
            validate_tag(tag)?;
        }

        self.environment.validate()?;
        self.policy.validate()?;

        if !self.base.is_pinned() {
            tracing::debug!(
                "base image {} is pinned by tag; pin by digest for byte-identical bases",
                self.base
            );
        }
        Ok(())
    }
}

/// Validates that the manifest exists, is a regular file and is not a symlink.
fn validate_manifest_file(path: &Utf8Path) -> Result<(), EnvstrapError> {
    let metadata = fs::symlink_metadata(path)
        .map_err(|e| EnvstrapError::io(format!("failed to read manifest metadata: {}", path), e))?;
    if metadata.is_symlink() {
        return Err(EnvstrapError::Validation(format!(
            "manifest path '{}' is a symlink, which cannot be bind-mounted reliably",
            path
        )));
    }
    if !metadata.is_file() {
        return Err(EnvstrapError::Validation(format!("manifest is not a file: {}", path)));
    }
    if path.file_name().is_none() {
        return Err(EnvstrapError::Validation(format!("manifest path has no file name: {}", path)));
    }
    Ok(())
}

/// Validates an output tag in `name:tag` or `name` form.
fn validate_tag(tag: &str) -> Result<(), EnvstrapError> {
    let valid = !tag.is_empty()
        && !tag.starts_with('-')
        && !tag.contains('@')
        && !tag.chars().any(|c| c.is_whitespace() || c.is_ascii_uppercase());
    if !valid {
        return Err(EnvstrapError::Validation(format!("tag '{}' is not a valid image name", tag)));
    }
    Ok(())
}

/// Loads a profile from a YAML file and resolves its relative paths.
pub fn load_profile(path: &Utf8Path) -> Result<Profile, EnvstrapError> {
    let content = fs::read_to_string(path)
        .map_err(|e| EnvstrapError::io(format!("failed to read profile: {}", path), e))?;
    let mut profile: Profile = serde_yaml::from_str(&content)
        .map_err(|e| EnvstrapError::Config(format!("failed to parse {}: {}", path, e)))?;

    let base_dir = match path.parent() {
        Some(parent) if !parent.as_str().is_empty() => parent.to_owned(),
        _ => Utf8PathBuf::from("."),
    };
    profile.resolve_paths(&base_dir);
    Ok(profile)
}
