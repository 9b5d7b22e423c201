//! Engine driven through the docker or podman command-line client.
//!
//! Each step is a single-instruction build on top of the parent layer:
//!
//! ```text
//! FROM <parent reference>
//! RUN [--mount=type=bind,...] [--mount=type=secret,...] VAR=value ... command args...
//! ```
//!
//! Variables are set inline on the `RUN` line and proxies are passed as
//! build arguments, so neither ends up in the image configuration. Secrets
//! are mounted as files for the one step that reads them. The new layer id
//! is read back from `--iidfile`.
//!
//! `FROM` needs a name the builder resolves locally, so every layer is also
//! tagged `envstrap-build/<random>:<step>` and later layers build from that
//! tag. These working tags are dropped again in
//! [`release`](ContainerEngine::release).

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, anyhow};
use camino::{Utf8Path, Utf8PathBuf};

use super::args::{CommandArgsBuilder, FlagValueStyle};
use super::{BindMount, BuildSecret, ContainerEngine, EngineError, EngineKind, StepRequest};
use crate::executor::{CommandExecutor, CommandSpec, ExecutionResult};
use crate::image::{BaseImage, ImageId};
use crate::privilege::PrivilegeMethod;

/// Repository holding the working tag of every committed layer.
pub const WORK_REPOSITORY: &str = "envstrap-build";

/// Removes a generated file when dropped.
struct TempFileGuard {
    path: Utf8PathBuf,
}

impl TempFileGuard {
    fn new(path: Utf8PathBuf) -> Self {
        Self { path }
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => tracing::debug!("cleaned up temp file: {}", self.path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::error!(
                    path = %self.path,
                    error_kind = ?e.kind(),
                    "failed to cleanup temp file: {}",
                    e,
                );
            }
        }
    }
}

/// Renders the single-step build file.
pub(crate) fn render_build_file(
    parent: &str,
    shell_line: &str,
    mounts: &[BindMount],
    secrets: &[BuildSecret],
) -> String {
    let mut out = String::new();
    if !mounts.is_empty() || !secrets.is_empty() {
        // RUN --mount needs the current frontend on docker
        out.push_str("# syntax=docker/dockerfile:1\n");
    }
    out.push_str(&format!("FROM {}\n", parent));
    out.push_str("RUN");
    for mount in mounts {
        let source = mount.source.file_name().unwrap_or(mount.source.as_str());
        out.push_str(&format!(
            " --mount=type=bind,source={},target={},readonly",
            source, mount.target
        ));
    }
    for secret in secrets {
        out.push_str(&format!(" --mount=type=secret,id={}", secret.id));
    }
    out.push(' ');
    out.push_str(shell_line);
    out.push('\n');
    out
}

/// Returns the directory every mount source lives in.
fn mount_context(mounts: &[BindMount]) -> anyhow::Result<Option<Utf8PathBuf>> {
    let mut context: Option<Utf8PathBuf> = None;
    for mount in mounts {
        let parent = mount
            .source
            .parent()
            .filter(|p| !p.as_str().is_empty())
            .unwrap_or(Utf8Path::new("."));
        match &context {
            None => context = Some(parent.to_owned()),
            Some(existing) if existing == parent => {}
            Some(existing) => {
                return Err(anyhow!(
                    "bind mounts must share one directory: {} and {}",
                    existing,
                    parent
                ));
            }
        }
    }
    Ok(context)
}

/// Writes `value` to a file only the current user can read.
fn write_secret_file(path: &Utf8Path, value: &str) -> anyhow::Result<()> {
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)
        .with_context(|| format!("failed to create secret file {}", path))?;
    file.write_all(value.as_bytes())
        .with_context(|| format!("failed to write secret file {}", path))
}

/// A local name for an image.
#[derive(Debug, Clone)]
struct LocalReference {
    name: String,
    /// Created by this engine, so it is ours to remove.
    owned: bool,
}

/// Docker or podman, invoked through a [`CommandExecutor`].
pub struct CliEngine {
    kind: EngineKind,
    executor: Arc<dyn CommandExecutor>,
    work_dir: Utf8PathBuf,
    privilege: Option<PrivilegeMethod>,
    references: Mutex<HashMap<ImageId, LocalReference>>,
}

impl CliEngine {
    pub fn new(kind: EngineKind, executor: Arc<dyn CommandExecutor>, work_dir: Utf8PathBuf) -> Self {
        Self {
            kind,
            executor,
            work_dir,
            privilege: None,
            references: Mutex::new(HashMap::new()),
        }
    }

    /// Wraps every client invocation with `privilege`.
    #[must_use]
    pub fn with_privilege(mut self, privilege: Option<PrivilegeMethod>) -> Self {
        self.privilege = privilege;
        self
    }

    pub fn kind(&self) -> EngineKind {
        self.kind
    }

    pub fn work_dir(&self) -> &Utf8Path {
        &self.work_dir
    }

    fn spec(&self, args: Vec<String>, budget: Option<Duration>) -> CommandSpec {
        let spec = CommandSpec::new(self.kind.command_name(), args)
            .with_privilege(self.privilege)
            .with_timeout(budget);
        match self.kind {
            EngineKind::Docker => spec.with_env("DOCKER_BUILDKIT", "1"),
            EngineKind::Podman => spec,
        }
    }

    /// Runs the client and maps an unsuccessful run to an [`EngineError`].
    fn run(&self, spec: &CommandSpec) -> Result<ExecutionResult, EngineError> {
        let result = self.executor.execute(spec)?;
        if result.timed_out {
            return Err(EngineError::TimedOut {
                diagnostic: result.output.diagnostic(),
            });
        }
        if !result.success() {
            return Err(EngineError::CommandFailed {
                status: result.code(),
                diagnostic: result.output.diagnostic(),
            });
        }
        Ok(result)
    }

    fn ensure_dir(path: &Utf8Path) -> anyhow::Result<()> {
        fs::create_dir_all(path).with_context(|| format!("failed to create directory {}", path))
    }

    fn remember(&self, image: &ImageId, name: String, owned: bool) {
        self.references
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(image.clone(), LocalReference { name, owned });
    }

    /// Name under which `image` resolves locally; the id itself if none is known.
    pub fn reference_for(&self, image: &ImageId) -> String {
        self.references
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(image)
            .map(|reference| reference.name.clone())
            .unwrap_or_else(|| image.to_string())
    }

    fn untag_args(&self, image: &ImageId, reference: &str) -> Vec<String> {
        match self.kind {
            // removing the last name of a layer with children only untags it
            EngineKind::Docker => vec!["image".to_string(), "rm".to_string(), reference.to_string()],
            EngineKind::Podman => vec!["untag".to_string(), image.to_string(), reference.to_string()],
        }
    }
}

impl ContainerEngine for CliEngine {
    fn name(&self) -> &str {
        self.kind.command_name()
    }

    fn pull(&self, base: &BaseImage, budget: Option<Duration>) -> Result<ImageId, EngineError> {
        let reference = base.to_string();
        self.run(&self.spec(vec!["pull".to_string(), reference.clone()], budget))?;

        let mut args = CommandArgsBuilder::new();
        args.push_arg("image")
            .push_arg("inspect")
            .push_flag_value("--format", "{{.Id}}", FlagValueStyle::Equals)
            .push_arg(reference.as_str());
        let result = self.run(&self.spec(args.into_args(), budget))?;
        if result.status.is_none() {
            return Ok(ImageId::new("dry-run-resolve-base"));
        }

        let id = result.output.stdout_text().trim().to_string();
        if id.is_empty() {
            return Err(EngineError::Other(anyhow!(
                "{} image inspect returned no id for {}",
                self.name(),
                reference
            )));
        }
        let id = ImageId::new(id);
        self.remember(&id, reference, false);
        Ok(id)
    }

    fn run_step(&self, parent: &ImageId, request: &StepRequest) -> Result<ImageId, EngineError> {
        let step = request.action.step();
        Self::ensure_dir(&self.work_dir)?;

        let name = uuid::Uuid::new_v4().simple().to_string();
        let build_file = self.work_dir.join(format!("{}.Dockerfile", name));
        let iid_file = self.work_dir.join(format!("{}.iid", name));
        let context = match mount_context(&request.mounts)? {
            Some(dir) => dir,
            None => {
                let dir = self.work_dir.join("context");
                Self::ensure_dir(&dir)?;
                dir
            }
        };

        let contents = render_build_file(
            &self.reference_for(parent),
            &request.command.shell_line(),
            &request.mounts,
            &request.secrets,
        );
        fs::write(&build_file, &contents)
            .with_context(|| format!("failed to write build file {}", build_file))?;
        let _build_file_guard = TempFileGuard::new(build_file.clone());
        let _iid_guard = TempFileGuard::new(iid_file.clone());
        tracing::debug!(step = %step, "build file:\n{}", contents);

        let mut secret_guards = Vec::with_capacity(request.secrets.len());
        let mut secret_args = Vec::with_capacity(request.secrets.len());
        for secret in &request.secrets {
            let path = self.work_dir.join(format!("{}.{}.secret", name, secret.id));
            write_secret_file(&path, &secret.value)?;
            secret_args.push(format!("id={},src={}", secret.id, path));
            secret_guards.push(TempFileGuard::new(path));
        }

        let reference = format!("{}/{}:{}", WORK_REPOSITORY, name, step);
        let mut args = CommandArgsBuilder::new();
        args.push_arg("build")
            .push_flag_value("--file", build_file.as_str(), FlagValueStyle::Separate)
            .push_flag_value("--iidfile", iid_file.as_str(), FlagValueStyle::Separate)
            .push_flag_value("--tag", &reference, FlagValueStyle::Separate)
            .push_flag_if("--no-cache", request.no_cache)
            .push_key_values("--build-arg", &request.build_args);
        for secret_arg in &secret_args {
            args.push_flag_value("--secret", secret_arg, FlagValueStyle::Separate);
        }
        args.push_arg(context.as_str());
        let result = self.run(&self.spec(args.into_args(), request.budget))?;
        if result.status.is_none() {
            let id = ImageId::new(format!("dry-run-{}", step));
            self.remember(&id, reference, true);
            return Ok(id);
        }

        let id = fs::read_to_string(&iid_file)
            .with_context(|| format!("failed to read image id from {}", iid_file))?;
        let id = id.trim();
        if id.is_empty() {
            return Err(EngineError::Other(anyhow!("{} wrote an empty image id", self.name())));
        }
        let id = ImageId::new(id);
        self.remember(&id, reference, true);
        Ok(id)
    }

    fn query(
        &self,
        image: &ImageId,
        argv: &[String],
        budget: Option<Duration>,
    ) -> Result<String, EngineError> {
        let (entrypoint, rest) = argv
            .split_first()
            .ok_or_else(|| anyhow!("query command must not be empty"))?;
        let mut args = CommandArgsBuilder::new();
        args.push_arg("run")
            .push_arg("--rm")
            .push_flag_value("--network", "none", FlagValueStyle::Equals)
            .push_flag_value("--entrypoint", entrypoint, FlagValueStyle::Separate)
            .push_arg(self.reference_for(image));
        for arg in rest {
            args.push_arg(arg.as_str());
        }
        let result = self.run(&self.spec(args.into_args(), budget))?;
        Ok(result.output.stdout_text())
    }

    fn tag(&self, image: &ImageId, tag: &str) -> Result<(), EngineError> {
        let args = vec!["tag".to_string(), self.reference_for(image), tag.to_string()];
        self.run(&self.spec(args, None))?;
        Ok(())
    }

    fn release(&self, images: &[ImageId]) {
        for image in images {
            let reference = {
                let mut references = self.references.lock().unwrap_or_else(PoisonError::into_inner);
                let owned = references.get(image).is_some_and(|reference| reference.owned);
                if owned {
                    references.remove(image)
                } else {
                    None
                }
            };
            let Some(reference) = reference else {
                continue;
            };
            let args = self.untag_args(image, &reference.name);
            match self.run(&self.spec(args, None)) {
                Ok(_) => tracing::debug!(image = %image, "released {}", reference.name),
                Err(e) => tracing::warn!(
                    image = %image,
                    "failed to release {}: {}",
                    reference.name,
                    e.diagnostic()
                ),
            }
        }
    }
}
