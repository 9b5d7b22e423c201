//! The provisioning sequence.
//!
//! [`Provisioner::build`] runs five steps in a fixed order, each on top of
//! the layer left by the previous one:
//!
//! 1. **resolve-base**: pull the base image
//! 2. **refresh-index**: refresh the OS package index (retried)
//! 3. **install-system-packages**: install the system package set
//! 4. **upgrade-installer**: upgrade the language-level installer
//! 5. **install-dependencies**: install the manifest with caching disabled
//!
//! Any failure halts the sequence. The engine's layer cache is never
//! consulted for step 5, and neither is the installer's download cache.

use std::thread;

use camino::Utf8Path;
use tracing::{error, info, warn};

use crate::config::ProvisionConfig;
use crate::engine::{BindMount, BuildSecret, ContainerEngine, EngineError, Inventory, StepRequest};
use crate::error::EnvstrapError;
use crate::image::{BaseImage, Digest, DigestBuilder, ImageId};
use crate::layer::LayerStack;
use crate::manifest::DependencyManifest;
use crate::packages::SystemPackageSet;
use crate::result::{BuildError, BuildFailure, BuildResult, BuiltImage};
use crate::step::{Step, StepAction};
use crate::toolchain::{Toolchain, manifest_target};

/// Number of steps in the sequence.
pub const STEP_COUNT: usize = 5;

/// Fingerprint of the three build inputs.
pub fn input_digest(
    base: &BaseImage,
    packages: &SystemPackageSet,
    manifest: &DependencyManifest,
) -> Digest {
    let mut builder = DigestBuilder::new();
    builder.update(base.to_string().as_bytes());
    builder.update(&(packages.len() as u64).to_le_bytes());
    for package in packages.iter() {
        builder.update(package.as_bytes());
    }
    builder.update(manifest.digest().to_hex().as_bytes());
    builder.finish()
}

/// Runs the provisioning sequence against a container engine.
pub struct Provisioner<'a> {
    engine: &'a dyn ContainerEngine,
    config: ProvisionConfig,
}

impl<'a> Provisioner<'a> {
    pub fn new(engine: &'a dyn ContainerEngine, config: ProvisionConfig) -> Self {
        Self { engine, config }
    }

    pub fn config(&self) -> &ProvisionConfig {
        &self.config
    }

    fn toolchain(&self) -> Toolchain<'_> {
        Toolchain::new(&self.config.toolchain, &self.config.environment)
    }

    /// Builds an image from `base`, `packages` and the manifest at `manifest_path`.
    ///
    /// The manifest is read before any step runs; an unreadable manifest is
    /// reported as a failure of step 5 without touching the engine.
    pub fn build(
        &self,
        base: &BaseImage,
        packages: &SystemPackageSet,
        manifest_path: &Utf8Path,
    ) -> BuildResult {
        let mut layers = LayerStack::new();
        let outcome = self.try_build(base, packages, manifest_path, &mut layers);
        self.release(&layers, outcome.as_ref().ok());
        match outcome {
            Ok(built) => {
                info!(image = %built.image, inputs = %built.inputs, "build completed successfully");
                BuildResult::Success(built)
            }
            Err(failure) => {
                error!(
                    step = %failure.step(),
                    "build failed at step {}/{}: {}",
                    failure.step_index(),
                    STEP_COUNT,
                    failure.error()
                );
                BuildResult::Failure(failure)
            }
        }
    }

    fn try_build(
        &self,
        base: &BaseImage,
        packages: &SystemPackageSet,
        manifest_path: &Utf8Path,
        layers: &mut LayerStack,
    ) -> Result<BuiltImage, BuildFailure> {
        let manifest = DependencyManifest::load(manifest_path).map_err(|e| {
            BuildFailure::new(
                Step::InstallDependencies,
                BuildError::DependencyInstall {
                    entry: manifest_path.to_string(),
                    line: None,
                },
                e.to_string(),
            )
        })?;
        if let Some(reference) = manifest.file_references().first() {
            return Err(BuildFailure::new(
                Step::InstallDependencies,
                BuildError::DependencyInstall {
                    entry: reference.text.clone(),
                    line: Some(reference.line),
                },
                "the manifest refers to another file, which is not available to the installer",
            ));
        }
        let inputs = input_digest(base, packages, &manifest);
        info!(
            engine = self.engine.name(),
            base = %base,
            packages = packages.len(),
            dependencies = manifest.entries().len(),
            "starting build"
        );

        log_step(Step::ResolveBase);
        let base_id = self
            .engine
            .pull(base, self.config.policy.step_timeout())
            .map_err(|e| {
                self.failure(Step::ResolveBase, e, |_| BuildError::BaseImageUnavailable {
                    image: base.to_string(),
                })
            })?;
        commit(layers, Step::ResolveBase, base_id.clone())?;

        let mut top = self.refresh_index(&base_id)?;
        commit(layers, Step::RefreshIndex, top.clone())?;

        for action in [
            StepAction::InstallSystemPackages(packages.to_vec()),
            StepAction::UpgradeInstaller,
            StepAction::InstallManifest {
                manifest: manifest_path.to_owned(),
                no_cache: true,
            },
        ] {
            let step = action.step();
            top = self.apply_step(&top, action, &manifest)?;
            commit(layers, step, top.clone())?;
        }

        let inventory = self.inventory(&top)?;

        if let Some(tag) = &self.config.tag {
            self.engine.tag(&top, tag).map_err(|e| {
                let message = format!("failed to tag image as {}", tag);
                self.failure(Step::InstallDependencies, e, |_| engine_error(&message))
            })?;
            info!(image = %top, tag = %tag, "tagged image");
        }

        Ok(BuiltImage {
            image: top,
            tag: self.config.tag.clone(),
            inputs,
            layers: layers.clone(),
            inventory,
        })
    }

    /// Hands every layer above the base back to the engine, except an
    /// untagged final image, whose working reference is its only name.
    fn release(&self, layers: &LayerStack, built: Option<&BuiltImage>) {
        let keep = built.filter(|built| built.tag.is_none()).map(|built| &built.image);
        let released: Vec<ImageId> = layers
            .iter()
            .filter(|layer| layer.step() != Step::ResolveBase)
            .map(|layer| layer.image().clone())
            .filter(|image| Some(image) != keep)
            .collect();
        if !released.is_empty() {
            self.engine.release(&released);
        }
    }

    /// Renders `action` into a request against the configured environment.
    pub fn request(&self, action: StepAction) -> StepRequest {
        let toolchain = self.toolchain();
        let command = toolchain.render(&action);
        let secrets = command
            .secret_ids()
            .filter_map(|id| {
                toolchain.secret(id).map(|value| BuildSecret {
                    id: id.to_string(),
                    value,
                })
            })
            .collect();
        let (mounts, no_cache) = match &action {
            StepAction::InstallManifest { manifest, no_cache } => (
                vec![BindMount {
                    source: manifest.clone(),
                    target: manifest_target(manifest),
                }],
                *no_cache,
            ),
            _ => (Vec::new(), false),
        };
        StepRequest {
            action,
            command,
            build_args: self.config.environment.proxy_vars(),
            mounts,
            secrets,
            no_cache,
            budget: self.config.policy.step_timeout(),
        }
    }

    /// Applies one of steps 3 to 5 on top of `parent` and returns the new layer.
    ///
    /// `manifest` is used only to attribute a step 5 failure to an entry.
    pub fn apply_step(
        &self,
        parent: &ImageId,
        action: StepAction,
        manifest: &DependencyManifest,
    ) -> Result<ImageId, BuildFailure> {
        let step = action.step();
        log_step(step);
        let request = self.request(action);
        self.engine.run_step(parent, &request).map_err(|e| {
            self.failure(step, e, |diagnostic| match &request.action {
                StepAction::RefreshIndex => BuildError::SystemPackageIndex { attempts: 1 },
                StepAction::InstallSystemPackages(requested) => BuildError::SystemPackageInstall {
                    package: self.config.toolchain.system.failed_package(diagnostic, requested),
                },
                StepAction::UpgradeInstaller => BuildError::InstallerUpgrade,
                StepAction::InstallManifest { .. } => match manifest.failed_entry(diagnostic) {
                    Some(entry) => BuildError::DependencyInstall {
                        entry: entry.requirement.clone(),
                        line: Some(entry.line),
                    },
                    None => BuildError::DependencyInstall {
                        entry: manifest.path().to_string(),
                        line: None,
                    },
                },
            })
        })
    }

    /// Step 2, retried up to `policy.index_retries` extra times.
    ///
    /// Only unsuccessful refreshes are retried; a timeout ends the build.
    fn refresh_index(&self, parent: &ImageId) -> Result<ImageId, BuildFailure> {
        log_step(Step::RefreshIndex);
        let request = self.request(StepAction::RefreshIndex);
        let max_attempts = self.config.policy.index_retries + 1;
        let mut attempt = 1;
        loop {
            match self.engine.run_step(parent, &request) {
                Ok(id) => return Ok(id),
                Err(EngineError::CommandFailed { diagnostic, .. }) if attempt < max_attempts => {
                    warn!(
                        "package index refresh failed (attempt {}/{}), retrying in {}s: {}",
                        attempt,
                        max_attempts,
                        self.config.policy.retry_delay_secs,
                        diagnostic.lines().last().unwrap_or_default()
                    );
                    thread::sleep(self.config.policy.retry_delay());
                    attempt += 1;
                }
                Err(e) => {
                    return Err(self.failure(Step::RefreshIndex, e, |_| {
                        BuildError::SystemPackageIndex { attempts: attempt }
                    }));
                }
            }
        }
    }

    /// Reads the installed system packages and dependencies from `image`.
    fn inventory(&self, image: &ImageId) -> Result<Inventory, BuildFailure> {
        let toolchain = self.toolchain();
        let budget = self.config.policy.step_timeout();
        let query = |argv: Vec<String>| {
            self.engine.query(image, &argv, budget).map_err(|e| {
                let message = format!("failed to query installed packages: {}", e);
                self.failure(Step::InstallDependencies, e, |_| engine_error(&message))
            })
        };

        let mut inventory = Inventory::default();
        for line in query(toolchain.system_query())?.lines() {
            if let Some((name, version)) = toolchain.parse_system_line(line) {
                inventory.system.insert(name, version);
            }
        }
        for line in query(toolchain.dependency_query())?.lines() {
            if let Some((name, version)) = toolchain.parse_dependency_line(line) {
                inventory.dependencies.insert(name, version);
            }
        }
        tracing::debug!(
            system = inventory.system.len(),
            dependencies = inventory.dependencies.len(),
            "collected inventory"
        );
        Ok(inventory)
    }

    /// Maps an engine error to the failure of `step`.
    ///
    /// `classify` receives the diagnostic of a command that exited
    /// unsuccessfully; timeouts and engine errors map the same way for
    /// every step.
    fn failure(
        &self,
        step: Step,
        err: EngineError,
        classify: impl FnOnce(&str) -> BuildError,
    ) -> BuildFailure {
        let diagnostic = err.diagnostic();
        let error = match &err {
            EngineError::CommandFailed { .. } => classify(&diagnostic),
            EngineError::TimedOut { .. } => BuildError::StepTimeout {
                step,
                budget_secs: self.config.policy.step_timeout_secs.unwrap_or_default(),
            },
            EngineError::Other(e) => BuildError::Engine {
                message: format!("{:#}", e),
            },
        };
        BuildFailure::new(step, error, diagnostic)
    }
}

fn engine_error(message: &str) -> BuildError {
    BuildError::Engine {
        message: message.to_string(),
    }
}

fn log_step(step: Step) {
    info!("running step {}/{}: {}", step.index(), STEP_COUNT, step);
}

/// Records a committed layer; an out-of-order push is an engine failure.
fn commit(layers: &mut LayerStack, step: Step, image: ImageId) -> Result<(), BuildFailure> {
    layers
        .push(step, image)
        .map(|_| ())
        .map_err(|e: EnvstrapError| BuildFailure::new(step, engine_error(&e.to_string()), e.to_string()))
}
