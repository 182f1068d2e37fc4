#![cfg(unix)]

use predicates::prelude::*;

use super::common::TestEnv;

const RUNTIME: &str = "echo \"upstream $1\"\n";

/// A project whose Server module forks `run.sh` and ships it as the runtime.
fn artifact_project() -> TestEnv {
  let env = TestEnv::project("");
  let extra = format!(
    r#"
[artifact]
path = "dist/fork.zip"
runtime_module = "Server"
runtime_file = "run.sh"

[bootstrap]
original_url = "file://{}"
original_version = "1.0.0"
original_file = "original.sh"
runtime_path = "1.0.0/run.sh"
launcher = ["sh"]
"#,
    env.root().join("original.sh").display()
  );
  env.write_file("patchstack.toml", &format!("{}{}", super::common::PROJECT_CONFIG, extra));
  env.write_file("upstream/run.sh", RUNTIME);
  env.write_file("original.sh", RUNTIME);

  env.run(&["sync"]);
  env.run(&["apply"]);
  env.write_file("Fork-Server/run.sh", "echo \"forked $1\"\nexit 7\n");
  env.run(&["rederive"]);
  env
    .cmd()
    .arg("rebuild")
    .assert()
    .success()
    .stdout(predicate::str::contains("Artifact"));
  env
}

#[test]
fn launch_runs_reconstructed_runtime() {
  let env = artifact_project();
  assert!(env.root().join("dist/fork.zip").exists());

  env
    .cmd()
    .args(["launch", "dist/fork.zip", "--", "hi"])
    .assert()
    .code(7)
    .stdout(predicate::str::contains("forked hi"));
  assert!(env.cache_path().join("runtime/1.0.0/run.sh").exists());
}

#[test]
fn launch_rejects_tampered_original() {
  let env = artifact_project();
  env.write_file("original.sh", "echo \"someone else\"\n");

  env
    .cmd()
    .args(["launch", "dist/fork.zip"])
    .assert()
    .code(4)
    .stderr(predicate::str::contains("original binary"));
  assert!(!env.cache_path().join("runtime/1.0.0/run.sh").exists());
}
