//! Shared test infrastructure.
//!
//! - [`FakeEngine`]: an in-memory container engine with a small package
//!   catalog, recording every call
//! - [`MockExecutor`]: a command executor that records argv and plays the
//!   part of a successful engine client
//! - profile writing helpers

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};
use envstrap::engine::{ContainerEngine, EngineError, StepRequest};
use envstrap::executor::{CapturedOutput, CommandExecutor, CommandSpec, ExecutionResult};
use envstrap::image::{BaseImage, Digest, ImageId};
use envstrap::manifest::{DependencyManifest, normalize_name};
use envstrap::step::{Step, StepAction};

// =============================================================================
// Version constraints
// =============================================================================

fn version_key(version: &str) -> Vec<u64> {
    version
        .split('.')
        .map(|part| part.parse().unwrap_or(0))
        .collect()
}

/// Evaluates a comma-separated constraint such as `>=1.0, !=1.1`.
pub fn satisfies(version: &str, constraint: &str) -> bool {
    const OPERATORS: [&str; 6] = ["==", "!=", ">=", "<=", ">", "<"];
    constraint
        .split(',')
        .map(str::trim)
        .filter(|clause| !clause.is_empty())
        .all(|clause| {
            let Some(op) = OPERATORS.iter().find(|op| clause.starts_with(**op)) else {
                return false;
            };
            let wanted = version_key(clause[op.len()..].trim());
            let have = version_key(version);
            match *op {
                "==" => have == wanted,
                "!=" => have != wanted,
                ">=" => have >= wanted,
                "<=" => have <= wanted,
                ">" => have > wanted,
                "<" => have < wanted,
                _ => false,
            }
        })
}

// =============================================================================
// FakeEngine
// =============================================================================

/// Filesystem state of one fake image.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageState {
    pub index_fresh: bool,
    pub system: BTreeMap<String, String>,
    pub installer: String,
    pub dependencies: BTreeMap<String, String>,
}

/// A call received by the fake engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Pull(String),
    Step {
        step: Step,
        parent: String,
        no_cache: bool,
        shell_line: String,
        mounts: Vec<String>,
    },
    Query(String),
    Tag(String, String),
}

#[derive(Default)]
struct FakeState {
    images: BTreeMap<String, ImageState>,
    calls: Vec<Call>,
    index_failures: u32,
    timeout_on: Option<Step>,
}

/// In-memory engine resolving packages against a fixed catalog.
///
/// Layers are never modified once created: every step derives a new
/// state from its parent and stores it under a new id.
pub struct FakeEngine {
    bases: BTreeSet<String>,
    system_catalog: BTreeMap<String, String>,
    index_catalog: BTreeMap<String, Vec<String>>,
    latest_installer: String,
    state: Mutex<FakeState>,
}

impl FakeEngine {
    pub fn new() -> Self {
        let system_catalog = [
            ("vcs-client", "2.39.2-1"),
            ("pkg-bootstrap", "23.0.1-1"),
            ("git", "1:2.39.2-1.1"),
            ("curl", "7.88.1-10"),
        ];
        let index_catalog: [(&str, &[&str]); 4] = [
            ("libfoo", &["0.9", "1.0", "1.2"]),
            ("libbar", &["2.0.1"]),
            ("pyyaml", &["5.4", "6.0.1"]),
            ("lib-native", &["0.3"]),
        ];
        Self {
            bases: ["runtime:X".to_string()].into(),
            system_catalog: system_catalog
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            index_catalog: index_catalog
                .iter()
                .map(|(k, vs)| (k.to_string(), vs.iter().map(|v| v.to_string()).collect()))
                .collect(),
            latest_installer: "24.2".to_string(),
            state: Mutex::new(FakeState::default()),
        }
    }

    /// Fails the next `count` index refreshes.
    pub fn with_index_failures(self, count: u32) -> Self {
        self.state.lock().unwrap().index_failures = count;
        self
    }

    /// Makes `step` exceed its budget.
    pub fn with_timeout_on(self, step: Step) -> Self {
        self.state.lock().unwrap().timeout_on = Some(step);
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Steps that reached the engine, in order, including step 1.
    pub fn steps_run(&self) -> Vec<Step> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Pull(_) => Some(Step::ResolveBase),
                Call::Step { step, .. } => Some(step),
                _ => None,
            })
            .collect()
    }

    pub fn image(&self, id: &ImageId) -> Option<ImageState> {
        self.state.lock().unwrap().images.get(id.as_str()).cloned()
    }

    pub fn image_count(&self) -> usize {
        self.state.lock().unwrap().images.len()
    }

    fn failed(diagnostic: impl Into<String>) -> EngineError {
        EngineError::CommandFailed {
            status: Some(100),
            diagnostic: diagnostic.into(),
        }
    }

    fn resolve(&self, requirement: &str, name: &str, constraint: Option<&str>) -> Result<String, EngineError> {
        let available = self
            .index_catalog
            .get(&normalize_name(name))
            .cloned()
            .unwrap_or_default();
        available
            .iter()
            .filter(|v| constraint.is_none_or(|c| satisfies(v, c)))
            .max_by_key(|v| version_key(v))
            .cloned()
            .ok_or_else(|| {
                Self::failed(format!(
                    "ERROR: Could not find a version that satisfies the requirement {} (from versions: {})\nERROR: No matching distribution found for {}",
                    requirement,
                    if available.is_empty() { "none".to_string() } else { available.join(", ") },
                    requirement
                ))
            })
    }

    fn apply(&self, parent: &ImageState, request: &StepRequest, index_failures: &mut u32) -> Result<ImageState, EngineError> {
        let mut next = parent.clone();
        match &request.action {
            StepAction::RefreshIndex => {
                if *index_failures > 0 {
                    *index_failures -= 1;
                    return Err(Self::failed(
                        "Err:1 http://deb.example stable InRelease\n  Temporary failure resolving 'deb.example'\nE: Failed to fetch http://deb.example/dists/stable/InRelease",
                    ));
                }
                next.index_fresh = true;
            }
            StepAction::InstallSystemPackages(packages) => {
                if !next.index_fresh && !packages.is_empty() {
                    return Err(Self::failed(format!("E: Unable to locate package {}", packages[0])));
                }
                for package in packages {
                    let Some(version) = self.system_catalog.get(package) else {
                        return Err(Self::failed(format!(
                            "Reading package lists...\nE: Unable to locate package {}",
                            package
                        )));
                    };
                    next.system.insert(package.clone(), version.clone());
                }
            }
            StepAction::UpgradeInstaller => {
                next.installer = self.latest_installer.clone();
            }
            StepAction::InstallManifest { .. } => {
                let mount = request
                    .mounts
                    .first()
                    .ok_or_else(|| Self::failed("ERROR: Could not open requirements file"))?;
                let text = std::fs::read_to_string(&mount.source)
                    .map_err(|e| Self::failed(format!("ERROR: Could not open requirements file: {}", e)))?;
                let manifest = DependencyManifest::parse(&mount.source, &text);
                for entry in manifest.entries() {
                    let version = self.resolve(&entry.requirement, &entry.name, entry.constraint())?;
                    next.dependencies.insert(normalize_name(&entry.name), version);
                }
            }
        }
        Ok(next)
    }
}

fn layer_id(parent: &str, shell_line: &str) -> String {
    Digest::compute(format!("{}\n{}", parent, shell_line).as_bytes()).to_string()
}

impl ContainerEngine for FakeEngine {
    fn name(&self) -> &str {
        "fake"
    }

    fn pull(&self, base: &BaseImage, _budget: Option<Duration>) -> Result<ImageId, EngineError> {
        let reference = base.to_string();
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::Pull(reference.clone()));
        if !self.bases.contains(&reference) {
            return Err(Self::failed(format!(
                "Error response from daemon: manifest for {} not found: manifest unknown",
                reference
            )));
        }
        let id = Digest::compute(reference.as_bytes()).to_string();
        let base_state = ImageState {
            system: [("python3".to_string(), "3.11.2-1".to_string())].into(),
            installer: "23.0.1".to_string(),
            ..Default::default()
        };
        state.images.entry(id.clone()).or_insert(base_state);
        Ok(ImageId::new(id))
    }

    fn run_step(&self, parent: &ImageId, request: &StepRequest) -> Result<ImageId, EngineError> {
        let step = request.action.step();
        let shell_line = request.command.shell_line();
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::Step {
            step,
            parent: parent.to_string(),
            no_cache: request.no_cache,
            shell_line: shell_line.clone(),
            mounts: request.mounts.iter().map(|m| m.target.clone()).collect(),
        });

        if state.timeout_on == Some(step) {
            return Err(EngineError::TimedOut {
                diagnostic: "Collecting libfoo\n  Downloading ...".to_string(),
            });
        }
        let parent_state = state
            .images
            .get(parent.as_str())
            .cloned()
            .ok_or_else(|| EngineError::Other(anyhow::anyhow!("no such image: {}", parent)))?;

        let mut index_failures = state.index_failures;
        let next = self.apply(&parent_state, request, &mut index_failures);
        state.index_failures = index_failures;
        let next = next?;

        let id = layer_id(parent.as_str(), &shell_line);
        state.images.insert(id.clone(), next);
        Ok(ImageId::new(id))
    }

    fn query(&self, image: &ImageId, argv: &[String], _budget: Option<Duration>) -> Result<String, EngineError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::Query(argv.join(" ")));
        let image_state = state
            .images
            .get(image.as_str())
            .ok_or_else(|| Self::failed(format!("Unable to find image '{}' locally", image)))?;
        let lines: Vec<String> = if argv.first().map(String::as_str) == Some("dpkg-query") {
            image_state
                .system
                .iter()
                .map(|(name, version)| format!("{}\t{}", name, version))
                .collect()
        } else {
            std::iter::once(format!("pip=={}", image_state.installer))
                .chain(
                    image_state
                        .dependencies
                        .iter()
                        .map(|(name, version)| format!("{}=={}", name, version)),
                )
                .collect()
        };
        Ok(lines.join("\n"))
    }

    fn tag(&self, image: &ImageId, tag: &str) -> Result<(), EngineError> {
        self.state
            .lock()
            .unwrap()
            .calls
            .push(Call::Tag(image.to_string(), tag.to_string()));
        Ok(())
    }
}

// =============================================================================
// MockExecutor
// =============================================================================

/// Records executed commands; answers like a working engine client.
///
/// `build` invocations get an image id written to their `--iidfile`, and
/// `image inspect` prints one. Build files and secret files are read while
/// they still exist.
pub struct MockExecutor {
    calls: Mutex<Vec<Vec<String>>>,
    envs: Mutex<Vec<Vec<(String, String)>>>,
    build_files: Mutex<Vec<String>>,
    secrets: Mutex<Vec<(String, String)>>,
    /// If set, the Nth call (0-indexed) exits with status 1.
    fail_on_call: Option<usize>,
    timeout_on_call: Option<usize>,
}

impl MockExecutor {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            envs: Mutex::new(Vec::new()),
            build_files: Mutex::new(Vec::new()),
            secrets: Mutex::new(Vec::new()),
            fail_on_call: None,
            timeout_on_call: None,
        }
    }

    pub fn failing_on(call_index: usize) -> Self {
        Self {
            fail_on_call: Some(call_index),
            ..Self::new()
        }
    }

    pub fn timing_out_on(call_index: usize) -> Self {
        Self {
            timeout_on_call: Some(call_index),
            ..Self::new()
        }
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().clone()
    }

    pub fn envs(&self) -> Vec<Vec<(String, String)>> {
        self.envs.lock().unwrap().clone()
    }

    /// Contents of every build file, in invocation order.
    pub fn build_files(&self) -> Vec<String> {
        self.build_files.lock().unwrap().clone()
    }

    /// `(id, contents)` of every secret passed to a build.
    pub fn secrets(&self) -> Vec<(String, String)> {
        self.secrets.lock().unwrap().clone()
    }

    fn record_build_inputs(&self, args: &[String]) -> Result<()> {
        for (flag, value) in args.iter().zip(args.iter().skip(1)) {
            match flag.as_str() {
                "--file" => self.build_files.lock().unwrap().push(std::fs::read_to_string(value)?),
                "--secret" => {
                    let (id, src) = value
                        .strip_prefix("id=")
                        .and_then(|rest| rest.split_once(",src="))
                        .ok_or_else(|| anyhow::anyhow!("malformed --secret {}", value))?;
                    let contents = std::fs::read_to_string(src)?;
                    self.secrets.lock().unwrap().push((id.to_string(), contents));
                }
                _ => {}
            }
        }
        Ok(())
    }
}

impl CommandExecutor for MockExecutor {
    fn execute(&self, spec: &CommandSpec) -> Result<ExecutionResult> {
        let mut calls = self.calls.lock().unwrap();
        let index = calls.len();
        let mut args = vec![spec.command.clone()];
        args.extend(spec.args.iter().cloned());
        calls.push(args);
        drop(calls);
        self.envs.lock().unwrap().push(spec.env.clone());
        if spec.args.first().map(String::as_str) == Some("build") {
            self.record_build_inputs(&spec.args)?;
        }

        if self.timeout_on_call == Some(index) {
            return Ok(ExecutionResult {
                status: Some(ExitStatus::from_raw(9)),
                output: CapturedOutput::default(),
                timed_out: true,
            });
        }
        if self.fail_on_call == Some(index) {
            return Ok(ExecutionResult {
                status: Some(ExitStatus::from_raw(1 << 8)),
                output: CapturedOutput {
                    stdout: Vec::new(),
                    stderr: vec![format!("simulated failure on call {}", index)],
                },
                timed_out: false,
            });
        }

        let mut stdout = Vec::new();
        if let Some(pos) = spec.args.iter().position(|a| a == "--iidfile") {
            std::fs::write(&spec.args[pos + 1], format!("sha256:layer{}\n", index))?;
        }
        if spec.args.first().map(String::as_str) == Some("image") {
            stdout.push("sha256:base".to_string());
        }
        Ok(ExecutionResult {
            status: Some(ExitStatus::from_raw(0)),
            output: CapturedOutput {
                stdout,
                stderr: Vec::new(),
            },
            timed_out: false,
        })
    }
}

// =============================================================================
// Profiles
// =============================================================================

/// Writes `manifest` and a profile referencing it into `dir`.
///
/// `extra` is appended verbatim to the profile YAML.
pub fn write_profile(dir: &Utf8Path, manifest: &str, extra: &str) -> Utf8PathBuf {
    std::fs::write(dir.join("requirements.txt"), manifest).unwrap();
    let profile = dir.join("envstrap.yaml");
    let yaml = format!(
        "base: runtime:X\nsystem_packages: [vcs-client, pkg-bootstrap]\nmanifest: requirements.txt\n{}",
        extra
    );
    std::fs::write(&profile, yaml).unwrap();
    profile
}

/// Creates a temporary directory with a UTF-8 path.
pub fn utf8_tempdir() -> (tempfile::TempDir, Utf8PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
    (dir, path)
}

/// Writes a manifest file into `dir` and returns its path.
pub fn write_manifest(dir: &Utf8Path, text: &str) -> Utf8PathBuf {
    let path = dir.join("requirements.txt");
    std::fs::write(&path, text).unwrap();
    path
}
