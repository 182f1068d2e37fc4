use predicates::prelude::*;

use super::common::TestEnv;

#[test]
fn sync_pins_upstream_in_lock_file() {
  let env = TestEnv::project("");
  env.write_file("upstream/Foo.txt", "hello\n");

  env
    .cmd()
    .arg("sync")
    .assert()
    .success()
    .stdout(predicate::str::contains("Synced to dir:"));
  assert!(env.read_file("patchstack.lock").contains("dir:"));

  env
    .cmd()
    .arg("sync")
    .assert()
    .success()
    .stdout(predicate::str::contains("Already at"));
}

#[test]
fn apply_and_rederive_round_trip_edits() {
  let env = TestEnv::project("");
  env.with_edits();

  assert_eq!(env.patch_files("api").len(), 1);
  assert_eq!(env.patch_files("server").len(), 1);

  std::fs::remove_dir_all(env.root().join("Fork-Server")).unwrap();
  env
    .cmd()
    .arg("apply")
    .assert()
    .success()
    .stdout(predicate::str::contains("Wrote 2 working tree(s)"));
  assert_eq!(env.read_file("Fork-Server/Foo.txt"), "hello world\n");
  assert_eq!(env.read_file("Fork-Server/Server.txt"), "server\n");
}

#[test]
fn rederive_without_working_trees_fails() {
  let env = TestEnv::project("");
  env.write_file("upstream/Foo.txt", "hello\n");
  env.run(&["sync"]);

  env
    .cmd()
    .arg("rederive")
    .assert()
    .code(1)
    .stderr(predicate::str::contains("run apply first"));
}

#[test]
fn rebuild_reuses_cached_modules() {
  let env = TestEnv::project("");
  env.with_edits();

  env
    .cmd()
    .arg("rebuild")
    .assert()
    .success()
    .stdout(predicate::str::contains("Built 2 module(s)"))
    .stdout(predicate::str::contains("(compiled)"));

  env
    .cmd()
    .args(["rebuild", "-o", "json"])
    .assert()
    .success()
    .stdout(predicate::str::contains("\"cached\": true"))
    .stdout(predicate::str::contains("\"cached\": false").not());
}

#[test]
fn status_reports_pinned_upstream() {
  let env = TestEnv::project("");
  env.with_edits();

  env
    .cmd()
    .arg("status")
    .assert()
    .success()
    .stdout(predicate::str::contains("Pinned to dir:"))
    .stdout(predicate::str::contains("2 module(s) need a rebuild"));

  env.run(&["rebuild"]);
  env
    .cmd()
    .args(["status", "-o", "json"])
    .assert()
    .success()
    .stdout(predicate::str::contains("\"module\": \"Server\""))
    .stdout(predicate::str::contains("\"upstream\": \"API\""))
    .stdout(predicate::str::contains("\"cached\": false").not());
}

#[test]
fn conflicting_upstream_change_exits_with_conflict() {
  let env = TestEnv::project("");
  env.with_edits();
  let lock = env.read_file("patchstack.lock");
  let patch = std::fs::read_to_string(&env.patch_files("api")[0]).unwrap();

  env.write_file("upstream/Foo.txt", "goodbye\n");
  env
    .cmd()
    .arg("sync")
    .assert()
    .code(2)
    .stderr(predicate::str::contains("API"));

  assert_eq!(env.read_file("patchstack.lock"), lock);
  assert_eq!(std::fs::read_to_string(&env.patch_files("api")[0]).unwrap(), patch);
}

#[test]
fn failing_toolchain_exits_with_compile_failure() {
  let env = TestEnv::project("\n[toolchain]\nkind = \"command\"\nprogram = \"patchstack-no-such-compiler\"\n");
  env.write_file("upstream/Foo.txt", "hello\n");
  env.run(&["sync"]);

  env
    .cmd()
    .arg("rebuild")
    .assert()
    .code(3)
    .stderr(predicate::str::contains("compilation of 'API' failed"));
}
