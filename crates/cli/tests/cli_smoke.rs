//! CLI smoke tests for patchstack.
//!
//! These tests verify that commands parse, fail cleanly without a project and
//! return the documented exit codes.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use tempfile::TempDir;

fn patchstack_cmd(temp: &TempDir) -> Command {
  let mut cmd = cargo_bin_cmd!("patchstack");
  cmd.current_dir(temp.path());
  cmd.env("PATCHSTACK_CACHE", temp.path().join("cache"));
  cmd.env_remove("RUST_LOG");
  cmd
}

const DIR_CONFIG: &str = r#"
[upstream]
source = "dir"
path = "upstream"

[[module]]
name = "API"
patches = "patches/api"
output = "Fork-API"
"#;

// =============================================================================
// Help & Version
// =============================================================================

#[test]
fn help_flag_works() {
  let temp = TempDir::new().unwrap();
  patchstack_cmd(&temp)
    .arg("--help")
    .assert()
    .success()
    .stdout(predicate::str::contains("Usage"))
    .stdout(predicate::str::contains("rederive"));
}

#[test]
fn version_flag_works() {
  let temp = TempDir::new().unwrap();
  patchstack_cmd(&temp)
    .arg("--version")
    .assert()
    .success()
    .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn subcommand_help_works() {
  let temp = TempDir::new().unwrap();
  for sub in ["sync", "rebuild", "apply", "rederive", "status", "gc", "evict", "launch"] {
    patchstack_cmd(&temp).args([sub, "--help"]).assert().success();
  }
}

#[test]
fn unknown_subcommand_fails() {
  let temp = TempDir::new().unwrap();
  patchstack_cmd(&temp).arg("frobnicate").assert().failure();
}

// =============================================================================
// Missing or invalid project
// =============================================================================

#[test]
fn status_without_config_fails() {
  let temp = TempDir::new().unwrap();
  patchstack_cmd(&temp)
    .arg("status")
    .assert()
    .code(1)
    .stderr(predicate::str::contains("Failed to load config"));
}

#[test]
fn invalid_config_fails() {
  let temp = TempDir::new().unwrap();
  std::fs::write(temp.path().join("patchstack.toml"), "[upstream]\nsource = \"dir\"\n").unwrap();
  patchstack_cmd(&temp)
    .arg("status")
    .assert()
    .code(1)
    .stderr(predicate::str::contains("path"));
}

#[test]
fn explicit_config_path_is_used() {
  let temp = TempDir::new().unwrap();
  let project = temp.path().join("project");
  std::fs::create_dir_all(project.join("upstream")).unwrap();
  std::fs::write(project.join("fork.toml"), DIR_CONFIG).unwrap();

  patchstack_cmd(&temp)
    .args(["--config", "project/fork.toml", "status"])
    .assert()
    .success()
    .stderr(predicate::str::contains("No lock file"));
}

#[test]
fn missing_upstream_dir_is_snapshot_unavailable() {
  let temp = TempDir::new().unwrap();
  std::fs::write(temp.path().join("patchstack.toml"), DIR_CONFIG).unwrap();
  patchstack_cmd(&temp).arg("sync").assert().code(5);
}

#[test]
fn launch_missing_artifact_fails() {
  let temp = TempDir::new().unwrap();
  patchstack_cmd(&temp)
    .args(["launch", "nope.zip"])
    .assert()
    .code(1)
    .stderr(predicate::str::contains("nope.zip"));
}
