//! Shared test helpers for CLI integration tests.

use std::path::{Path, PathBuf};

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use tempfile::TempDir;

/// Two modules over a directory upstream; Server builds on API's tree.
pub const PROJECT_CONFIG: &str = r#"
[upstream]
source = "dir"
path = "upstream"

[[module]]
name = "API"
patches = "patches/api"
output = "Fork-API"

[[module]]
name = "Server"
patches = "patches/server"
output = "Fork-Server"
upstream = "API"
"#;

/// Isolated project with its own cache directory.
pub struct TestEnv {
  pub temp: TempDir,
}

impl TestEnv {
  /// A project using [`PROJECT_CONFIG`] plus `extra` config text.
  pub fn project(extra: &str) -> Self {
    let env = Self {
      temp: TempDir::new().unwrap(),
    };
    env.write_file("patchstack.toml", &format!("{}{}", PROJECT_CONFIG, extra));
    env
  }

  pub fn root(&self) -> &Path {
    self.temp.path()
  }

  /// Write a file relative to the project root.
  pub fn write_file(&self, relative_path: &str, content: &str) {
    let path = self.root().join(relative_path);
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(&path, content).unwrap();
  }

  pub fn read_file(&self, relative_path: &str) -> String {
    std::fs::read_to_string(self.root().join(relative_path))
      .unwrap_or_else(|e| panic!("Failed to read {}: {}", relative_path, e))
  }

  /// `.patch` files in a module's patch directory.
  pub fn patch_files(&self, dir: &str) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(self.root().join("patches").join(dir)) else {
      return Vec::new();
    };
    let mut files: Vec<_> = entries
      .flatten()
      .map(|e| e.path())
      .filter(|p| p.extension().is_some_and(|e| e == "patch"))
      .collect();
    files.sort();
    files
  }

  /// Cache path (isolated per test).
  pub fn cache_path(&self) -> PathBuf {
    self.root().join("cache")
  }

  /// Get a pre-configured Command for the patchstack binary.
  ///
  /// Runs in the project root with `PATCHSTACK_CACHE` pointing at the
  /// test's own cache.
  pub fn cmd(&self) -> Command {
    let mut cmd: Command = cargo_bin_cmd!("patchstack");
    cmd.current_dir(self.root());
    cmd.env("PATCHSTACK_CACHE", self.cache_path());
    cmd.env_remove("RUST_LOG");
    cmd
  }

  /// Run `args` and require success.
  pub fn run(&self, args: &[&str]) {
    self.cmd().args(args).assert().success();
  }

  /// Sync, write working trees and capture one edit per module as patches.
  pub fn with_edits(&self) {
    self.write_file("upstream/Foo.txt", "hello\n");
    self.run(&["sync"]);
    self.run(&["apply"]);
    self.write_file("Fork-API/Foo.txt", "hello world\n");
    self.write_file("Fork-Server/Foo.txt", "hello world\n");
    self.write_file("Fork-Server/Server.txt", "server\n");
    self.run(&["rederive"]);
  }
}
