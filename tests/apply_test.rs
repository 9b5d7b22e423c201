//! End-to-end tests of `run_apply` and `run_validate` with a recording executor.

mod helpers;

use std::sync::Arc;

use envstrap::cli::{ApplyArgs, LogLevel, ValidateArgs};
use envstrap::executor::CommandExecutor;
use envstrap::{run_apply, run_validate};
use helpers::{MockExecutor, utf8_tempdir, write_profile};

fn apply_args(file: camino::Utf8PathBuf, result: Option<camino::Utf8PathBuf>) -> ApplyArgs {
    ApplyArgs {
        file,
        log_level: LogLevel::Error,
        dry_run: false,
        result,
    }
}

#[test]
fn run_apply_drives_engine_and_writes_result() {
    let (_dir, path) = utf8_tempdir();
    let profile = write_profile(&path, "libfoo>=1.0\nlibbar\n", "tag: ml-env:latest\n");
    let result_path = path.join("result.yaml");
    let executor = Arc::new(MockExecutor::new());
    let dyn_executor: Arc<dyn CommandExecutor> = executor.clone();

    let result = run_apply(&apply_args(profile, Some(result_path.clone())), dyn_executor)
        .expect("run_apply should succeed");

    assert!(result.is_success());
    let calls = executor.calls();
    assert_eq!(calls[0], vec!["docker", "pull", "runtime:X"]);
    let tag = calls.iter().find(|c| c[1] == "tag").expect("final image is tagged");
    assert!(tag[2].starts_with("envstrap-build/"), "got: {:?}", tag);
    assert_eq!(tag[3], "ml-env:latest");
    // working tags are dropped once the user tag is in place
    assert_eq!(calls.iter().filter(|c| c[1] == "image" && c[2] == "rm").count(), 4);

    let written = std::fs::read_to_string(&result_path).unwrap();
    assert!(written.contains("status: success"), "got: {}", written);
    assert!(written.contains("image: sha256:layer5"), "got: {}", written);
    assert!(written.contains("step: install-dependencies"), "got: {}", written);
}

#[test]
fn run_apply_reports_failure_and_still_writes_result() {
    let (_dir, path) = utf8_tempdir();
    let profile = write_profile(&path, "libfoo\n", "policy:\n  index_retries: 0\n");
    let result_path = path.join("result.yaml");
    // calls: pull, inspect, refresh
    let executor: Arc<dyn CommandExecutor> = Arc::new(MockExecutor::failing_on(2));

    let err = run_apply(&apply_args(profile, Some(result_path.clone())), executor).unwrap_err();

    let message = format!("{:#}", err);
    assert!(message.contains("step 2 (refresh-index) failed"), "got: {}", message);
    let written = std::fs::read_to_string(&result_path).unwrap();
    assert!(written.contains("status: failure"), "got: {}", written);
    assert!(written.contains("kind: system-package-index"), "got: {}", written);
    assert!(!written.contains("image:"), "failed build must not carry an image: {}", written);
}

#[test]
fn run_apply_rejects_invalid_profile_before_running() {
    let (_dir, path) = utf8_tempdir();
    let profile = write_profile(&path, "", "environment:\n  http_proxy: nope\n");
    let executor = Arc::new(MockExecutor::new());
    let dyn_executor: Arc<dyn CommandExecutor> = executor.clone();

    let err = run_apply(&apply_args(profile, None), dyn_executor).unwrap_err();

    assert!(format!("{:#}", err).contains("profile validation failed"));
    assert!(executor.calls().is_empty());
}

#[test]
fn run_validate_succeeds_on_valid_profile() {
    let (_dir, path) = utf8_tempdir();
    let opts = ValidateArgs {
        file: write_profile(&path, "libfoo\n", ""),
        log_level: LogLevel::Error,
    };

    run_validate(&opts).expect("run_validate should succeed for sample profile");
}
