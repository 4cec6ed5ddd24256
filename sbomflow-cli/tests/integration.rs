use std::path::PathBuf;
use std::process::Command;

use tempfile::TempDir;

fn fixture(name: &str) -> String {
    let dir = env!("CARGO_MANIFEST_DIR");
    format!("{dir}/tests/fixtures/{name}")
}

/// Settings file pointing the generator at a fixture script.
fn settings_with(generator: &str) -> (TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sbomflow.toml");
    std::fs::write(
        &path,
        format!("[generator]\ncommand = \"sh {}\"\n", fixture(generator)),
    )
    .unwrap();
    (dir, path)
}

fn sbomflow() -> Command {
    let mut command = Command::new(env!("CARGO_BIN_EXE_sbomflow"));
    command.env_remove("RUST_LOG");
    command
}

fn run_sbomflow(args: &[&str]) -> std::process::Output {
    sbomflow().args(args).output().expect("failed to execute")
}

fn stdout_of(args: &[&str]) -> String {
    let output = run_sbomflow(args);
    assert!(output.status.success(), "command failed: {}", String::from_utf8_lossy(&output.stderr));
    String::from_utf8(output.stdout).unwrap()
}

#[test]
fn single_module_is_one_project_named_after_argument() {
    let (_dir, settings) = settings_with("fake-cdxgen.sh");
    let stdout = stdout_of(&[
        "analyze",
        &fixture("single-module"),
        "--name",
        "widgets",
        "--settings",
        settings.to_str().unwrap(),
    ]);
    assert!(stdout.contains("widgets (.)"), "unexpected output: {stdout}");
    assert!(stdout.contains("sbom: acme:widgets:1.0, 1 components"));
}

#[test]
fn repository_config_splits_into_sub_projects() {
    let (_dir, settings) = settings_with("fake-cdxgen.sh");
    let stdout = stdout_of(&[
        "analyze",
        &fixture("multi-module"),
        "--name",
        "widgets",
        "--settings",
        settings.to_str().unwrap(),
        "--json",
    ]);
    let parsed: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    let entries = parsed.as_array().unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0]["project_name"], "widgets-api");
    assert_eq!(entries[0]["analysis_dir"], "api");
    assert_eq!(entries[0]["status"], "generated");
    assert_eq!(entries[1]["project_name"], "widgets-web");
    assert_eq!(entries[1]["component"], "acme:widgets-web:1.0");
}

#[test]
fn analysis_leaves_source_directory_untouched() {
    let (_dir, settings) = settings_with("fake-cdxgen.sh");
    stdout_of(&[
        "analyze",
        &fixture("multi-module"),
        "--name",
        "widgets",
        "--settings",
        settings.to_str().unwrap(),
    ]);
    assert!(PathBuf::from(fixture("multi-module/.github/sbomflow.yml")).is_file());
    assert!(!PathBuf::from(fixture("multi-module/api/sbom.json")).exists());
}

#[test]
fn explicit_repo_config_overrides_directory_config() {
    let (_dir, settings) = settings_with("fake-cdxgen.sh");
    let stdout = stdout_of(&[
        "analyze",
        &fixture("multi-module"),
        "--name",
        "widgets",
        "--settings",
        settings.to_str().unwrap(),
        "--repo-config",
        &fixture("disabled.yml"),
        "--json",
    ]);
    let parsed: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert!(parsed.as_array().unwrap().is_empty());
}

#[test]
fn failing_generator_exits_non_zero() {
    let (_dir, settings) = settings_with("failing-cdxgen.sh");
    let output = run_sbomflow(&[
        "analyze",
        &fixture("single-module"),
        "--name",
        "widgets",
        "--settings",
        settings.to_str().unwrap(),
    ]);
    assert!(!output.status.success());
    let stdout = String::from_utf8(output.stdout).unwrap();
    assert!(stdout.contains("failed:"), "unexpected output: {stdout}");
}

#[test]
fn missing_directory_is_an_error() {
    let (_dir, settings) = settings_with("fake-cdxgen.sh");
    let output = run_sbomflow(&[
        "analyze",
        "/does/not/exist",
        "--name",
        "widgets",
        "--settings",
        settings.to_str().unwrap(),
    ]);
    assert!(!output.status.success());
    let stderr = String::from_utf8(output.stderr).unwrap();
    assert!(stderr.contains("is not a directory"), "unexpected stderr: {stderr}");
}

#[test]
fn name_is_required() {
    let output = run_sbomflow(&["analyze", &fixture("single-module")]);
    assert!(!output.status.success());
}
