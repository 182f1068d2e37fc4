//! Cache garbage collection.
//!
//! Live data is whatever the current lock file and patch files point at: the
//! pinned snapshot and the builds for the modules' current fingerprints.
//! Everything else under the cache root may go.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::{fs, io};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::cache::{CacheError, Fingerprint, RebuildCache};
use crate::consts::BUILD_COMPLETE_MARKER;
use crate::snapshot::{SnapshotError, SnapshotStore, UpstreamLock};
use crate::util::hash::ObjectHash;

#[derive(Debug, Error)]
pub enum GcError {
  #[error(transparent)]
  Snapshot(#[from] SnapshotError),

  #[error(transparent)]
  Cache(#[from] CacheError),

  #[error("failed to read '{path}': {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: io::Error,
  },
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct GcStats {
  pub snapshots_scanned: usize,
  pub snapshots_deleted: usize,
  pub builds_scanned: usize,
  pub builds_deleted: usize,
  pub staging_deleted: usize,
  pub bytes_freed: u64,
  pub deleted_paths: Vec<PathBuf>,
}

impl GcStats {
  pub fn total_deleted(&self) -> usize {
    self.snapshots_deleted + self.builds_deleted + self.staging_deleted
  }
}

fn dir_size(path: &Path) -> u64 {
  WalkDir::new(path)
    .into_iter()
    .filter_map(|e| e.ok())
    .filter(|e| e.file_type().is_file())
    .filter_map(|e| e.metadata().ok())
    .map(|m| m.len())
    .sum()
}

/// Delete everything not reachable from `lock` and `live`.
///
/// `work_dir` holds toolchain scratch directories; nothing in it outlives a
/// build, so it is removed wholesale.
pub fn collect_garbage(
  snapshots: &SnapshotStore,
  cache: &RebuildCache,
  lock: Option<&UpstreamLock>,
  live: &HashSet<Fingerprint>,
  work_dir: &Path,
  dry_run: bool,
) -> Result<GcStats, GcError> {
  let mut stats = GcStats::default();

  sweep_snapshots(snapshots, lock, dry_run, &mut stats)?;
  sweep_builds(cache, live, dry_run, &mut stats)?;

  if !dry_run {
    stats.staging_deleted += cache.clean_staging()?;
  }
  if work_dir.is_dir() {
    let size = dir_size(work_dir);
    if dry_run || fs::remove_dir_all(work_dir).is_ok() {
      stats.staging_deleted += 1;
      stats.bytes_freed += size;
      stats.deleted_paths.push(work_dir.to_path_buf());
    }
  }

  info!(
    snapshots_deleted = stats.snapshots_deleted,
    builds_deleted = stats.builds_deleted,
    bytes_freed = stats.bytes_freed,
    dry_run,
    "garbage collection complete"
  );
  Ok(stats)
}

fn sweep_snapshots(
  snapshots: &SnapshotStore,
  lock: Option<&UpstreamLock>,
  dry_run: bool,
  stats: &mut GcStats,
) -> Result<(), GcError> {
  for manifest in snapshots.entries()? {
    stats.snapshots_scanned += 1;
    if lock.is_some_and(|l| l.token == manifest.token) {
      continue;
    }

    let path = snapshots.entry_dir(&manifest.token);
    let size = dir_size(&path);
    debug!(token = %manifest.token, "removing unpinned snapshot");

    if dry_run || snapshots.evict(&manifest.token)? {
      stats.snapshots_deleted += 1;
      stats.bytes_freed += size;
      stats.deleted_paths.push(path);
    }
  }
  Ok(())
}

fn sweep_builds(
  cache: &RebuildCache,
  live: &HashSet<Fingerprint>,
  dry_run: bool,
  stats: &mut GcStats,
) -> Result<(), GcError> {
  let root = cache.root();
  let entries = match fs::read_dir(root) {
    Ok(entries) => entries,
    Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
    Err(source) => {
      return Err(GcError::Read {
        path: root.to_path_buf(),
        source,
      });
    }
  };

  for entry in entries.flatten() {
    let path = entry.path();
    let name = entry.file_name().to_string_lossy().to_string();
    if !path.is_dir() || name.starts_with('.') {
      continue;
    }
    stats.builds_scanned += 1;

    let complete = path.join(BUILD_COMPLETE_MARKER).exists();
    if complete && live.contains(&ObjectHash(name.clone())) {
      continue;
    }

    let size = dir_size(&path);
    if complete {
      debug!(path = %path.display(), "removing unreferenced build");
    } else {
      debug!(path = %path.display(), "removing incomplete build");
    }

    if dry_run {
      stats.builds_deleted += 1;
      stats.bytes_freed += size;
      stats.deleted_paths.push(path);
      continue;
    }
    match fs::remove_dir_all(&path) {
      Ok(()) => {
        stats.builds_deleted += 1;
        stats.bytes_freed += size;
        stats.deleted_paths.push(path);
      }
      Err(e) => warn!(path = %path.display(), error = %e, "failed to delete build directory"),
    }
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::snapshot::DirSource;
  use crate::tree::Tree;
  use std::sync::Arc;
  use tempfile::TempDir;

  fn record(cache: &RebuildCache, temp: &TempDir, fp: &str) -> Fingerprint {
    let compiled = temp.path().join(format!("out-{}", fp));
    fs::create_dir_all(&compiled).unwrap();
    fs::write(compiled.join("a.class"), fp).unwrap();
    let mut tree = Tree::new();
    tree.insert("A.java", fp);
    let fp = ObjectHash(fp.to_string());
    cache.record(&fp, "API", &tree, &compiled).unwrap();
    fp
  }

  #[test]
  fn removes_unreferenced_and_incomplete_builds() {
    let temp = TempDir::new().unwrap();
    let cache_dir = temp.path().join("cache");
    let cache = RebuildCache::new(&cache_dir);
    let snapshots = SnapshotStore::new(&cache_dir, Arc::new(DirSource::new(temp.path())));

    let keep = record(&cache, &temp, "aaaaaaaaaaaaaaaaaaaa");
    let stale = record(&cache, &temp, "bbbbbbbbbbbbbbbbbbbb");
    fs::create_dir_all(cache.root().join("cccccccccccccccccccc/tree")).unwrap();
    fs::create_dir_all(cache.root().join(".staging-dddd-1")).unwrap();

    let live = HashSet::from([keep.clone()]);
    let stats = collect_garbage(&snapshots, &cache, None, &live, &cache_dir.join("work"), false).unwrap();

    assert_eq!(stats.builds_scanned, 3);
    assert_eq!(stats.builds_deleted, 2);
    assert_eq!(stats.staging_deleted, 1);
    assert!(!cache.should_rebuild(&keep));
    assert!(cache.should_rebuild(&stale));
    assert!(!cache.entry_dir(&stale).exists());
  }

  #[test]
  fn dry_run_deletes_nothing() {
    let temp = TempDir::new().unwrap();
    let cache_dir = temp.path().join("cache");
    let cache = RebuildCache::new(&cache_dir);
    let snapshots = SnapshotStore::new(&cache_dir, Arc::new(DirSource::new(temp.path())));
    let stale = record(&cache, &temp, "bbbbbbbbbbbbbbbbbbbb");

    let stats = collect_garbage(&snapshots, &cache, None, &HashSet::new(), &cache_dir.join("work"), true).unwrap();

    assert_eq!(stats.builds_deleted, 1);
    assert!(!cache.should_rebuild(&stale));
  }

  #[tokio::test]
  async fn keeps_only_the_pinned_snapshot() {
    let temp = TempDir::new().unwrap();
    let upstream = temp.path().join("upstream");
    fs::create_dir_all(&upstream).unwrap();
    fs::write(upstream.join("Foo.txt"), "hello").unwrap();

    let cache_dir = temp.path().join("cache");
    let cache = RebuildCache::new(&cache_dir);
    let snapshots = SnapshotStore::new(&cache_dir, Arc::new(DirSource::new(&upstream)));

    let old = snapshots.resolve("local").await.unwrap();
    snapshots.retrieve(&old, None).await.unwrap();
    fs::write(upstream.join("Foo.txt"), "hello world").unwrap();
    let current = snapshots.resolve("local").await.unwrap();
    let snapshot = snapshots.retrieve(&current, None).await.unwrap();
    assert_ne!(old, current);

    let lock = UpstreamLock::new("local", current.clone(), snapshot.tree_hash.clone());
    let stats = collect_garbage(&snapshots, &cache, Some(&lock), &HashSet::new(), &cache_dir.join("work"), false).unwrap();

    assert_eq!(stats.snapshots_scanned, 2);
    assert_eq!(stats.snapshots_deleted, 1);
    assert!(snapshots.entry_dir(&current).exists());
    assert!(!snapshots.entry_dir(&old).exists());
  }
}
