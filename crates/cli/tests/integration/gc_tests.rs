use predicates::prelude::*;

use super::common::TestEnv;

#[test]
fn gc_with_empty_cache_succeeds() {
  let env = TestEnv::project("");

  env
    .cmd()
    .arg("gc")
    .assert()
    .success()
    .stdout(predicate::str::contains("Garbage collection complete"));
}

#[test]
fn gc_dry_run_keeps_everything() {
  let env = TestEnv::project("");
  env.with_edits();
  env.run(&["rebuild"]);
  env.write_file("Fork-API/Foo.txt", "hello again\n");
  env.write_file("Fork-Server/Foo.txt", "hello again\n");
  env.run(&["rederive"]);

  env
    .cmd()
    .args(["gc", "--dry-run"])
    .assert()
    .success()
    .stdout(predicate::str::contains("Dry run"))
    .stdout(predicate::str::contains("Builds removed: 2"));
  let builds = std::fs::read_dir(env.cache_path().join("builds"))
    .unwrap()
    .flatten()
    .filter(|e| e.path().is_dir() && !e.file_name().to_string_lossy().starts_with('.'))
    .count();
  assert_eq!(builds, 2);
}

#[test]
fn gc_removes_builds_for_stale_fingerprints() {
  let env = TestEnv::project("");
  env.with_edits();
  env.run(&["rebuild"]);
  env.write_file("Fork-API/Foo.txt", "hello again\n");
  env.write_file("Fork-Server/Foo.txt", "hello again\n");
  env.run(&["rederive"]);
  env.run(&["rebuild"]);

  env
    .cmd()
    .args(["gc", "-o", "json"])
    .assert()
    .success()
    .stdout(predicate::str::contains("\"builds_deleted\": 2"))
    .stdout(predicate::str::contains("deleted_paths"));

  env
    .cmd()
    .arg("status")
    .assert()
    .success()
    .stdout(predicate::str::contains("need a rebuild").not());
}

#[test]
fn evict_reports_missing_token() {
  let env = TestEnv::project("");

  env
    .cmd()
    .args(["evict", "dir:/nowhere#0000"])
    .assert()
    .success()
    .stdout(predicate::str::contains("is not cached"));
}
