//! Content-verified snapshot cache.
//!
//! ```text
//! {cache}/snapshots/<key>/
//!   snapshot.json   # SnapshotManifest
//!   tree/           # upstream files
//! ```

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::tree::Tree;
use crate::util::fs::{replace_dir, write_atomic};
use crate::util::hash::ContentHash;

use super::source::SnapshotSource;
use super::types::{Snapshot, SnapshotError, SnapshotManifest, VersionToken};

const SNAPSHOTS_DIR: &str = "snapshots";
const MANIFEST_FILE: &str = "snapshot.json";
const TREE_DIR: &str = "tree";
const MANIFEST_VERSION: u32 = 1;

type Cell = Arc<OnceCell<Arc<Snapshot>>>;

/// Retrieves and caches upstream snapshots.
///
/// Retrieval is single-flight per token: concurrent callers for the same token
/// share one fetch, and every later call in the process reuses its result.
pub struct SnapshotStore {
  root: PathBuf,
  source: Arc<dyn SnapshotSource>,
  cells: StdMutex<HashMap<VersionToken, Cell>>,
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> SnapshotError + '_ {
  move |source| SnapshotError::Io {
    path: path.to_path_buf(),
    source,
  }
}

impl SnapshotStore {
  pub fn new(cache_dir: &Path, source: Arc<dyn SnapshotSource>) -> Self {
    Self {
      root: cache_dir.join(SNAPSHOTS_DIR),
      source,
      cells: StdMutex::new(HashMap::new()),
    }
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  pub fn entry_dir(&self, token: &VersionToken) -> PathBuf {
    self.root.join(&token.key().0)
  }

  /// Pin `reference` through the configured source.
  pub async fn resolve(&self, reference: &str) -> Result<VersionToken, SnapshotError> {
    let source = self.source.clone();
    let owned = reference.to_string();
    tokio::task::spawn_blocking(move || source.resolve(&owned))
      .await
      .map_err(|e| SnapshotError::Join(e.to_string()))?
      .map_err(|e| SnapshotError::Unavailable {
        token: reference.to_string(),
        reason: e.to_string(),
      })
  }

  /// Return the snapshot for `token`, fetching it on first use.
  ///
  /// When `expected` is given, the tree must hash to it; a cached entry is
  /// additionally checked file by file against its manifest.
  pub async fn retrieve(
    &self,
    token: &VersionToken,
    expected: Option<&ContentHash>,
  ) -> Result<Arc<Snapshot>, SnapshotError> {
    let cell = {
      let mut cells = self.cells.lock().unwrap_or_else(|p| p.into_inner());
      cells.entry(token.clone()).or_default().clone()
    };

    let snapshot = cell.get_or_try_init(|| self.load_or_fetch(token)).await?.clone();

    if let Some(expected) = expected
      && &snapshot.tree_hash != expected
    {
      return Err(SnapshotError::unavailable(
        token,
        format!("tree hash {} does not match locked {}", snapshot.tree_hash, expected),
      ));
    }
    Ok(snapshot)
  }

  async fn load_or_fetch(&self, token: &VersionToken) -> Result<Arc<Snapshot>, SnapshotError> {
    let entry = self.entry_dir(token);
    if entry.join(MANIFEST_FILE).exists() {
      let owned_entry = entry.clone();
      let owned_token = token.clone();
      let loaded = tokio::task::spawn_blocking(move || load_entry(&owned_entry, &owned_token))
        .await
        .map_err(|e| SnapshotError::Join(e.to_string()))??;
      debug!(%token, "snapshot cache hit");
      return Ok(Arc::new(loaded));
    }

    info!(%token, "fetching snapshot");
    let source = self.source.clone();
    let owned_token = token.clone();
    let tree = tokio::task::spawn_blocking(move || source.fetch(&owned_token))
      .await
      .map_err(|e| SnapshotError::Join(e.to_string()))?
      .map_err(|e| SnapshotError::unavailable(token, e))?;

    let snapshot = Snapshot::new(token.clone(), tree);
    let root = self.root.clone();
    let stored = snapshot.clone();
    tokio::task::spawn_blocking(move || store_entry(&root, &entry, &stored))
      .await
      .map_err(|e| SnapshotError::Join(e.to_string()))??;

    info!(%token, files = snapshot.tree.len(), hash = %snapshot.tree_hash, "cached snapshot");
    Ok(Arc::new(snapshot))
  }

  /// Manifests of every cached snapshot.
  pub fn entries(&self) -> Result<Vec<SnapshotManifest>, SnapshotError> {
    let read = match fs::read_dir(&self.root) {
      Ok(read) => read,
      Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
      Err(e) => return Err(io_err(&self.root)(e)),
    };

    let mut out = Vec::new();
    for entry in read {
      let entry = entry.map_err(io_err(&self.root))?;
      let path = entry.path().join(MANIFEST_FILE);
      if !path.exists() {
        continue;
      }
      match read_manifest(&path) {
        Ok(manifest) => out.push(manifest),
        Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable snapshot"),
      }
    }
    out.sort_by(|a, b| a.token.cmp(&b.token));
    Ok(out)
  }

  /// Remove the cached entry for `token`. Returns whether anything was removed.
  pub fn evict(&self, token: &VersionToken) -> Result<bool, SnapshotError> {
    self
      .cells
      .lock()
      .unwrap_or_else(|p| p.into_inner())
      .remove(token);

    let entry = self.entry_dir(token);
    match fs::remove_dir_all(&entry) {
      Ok(()) => {
        info!(%token, "evicted snapshot");
        Ok(true)
      }
      Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
      Err(e) => Err(io_err(&entry)(e)),
    }
  }
}

fn read_manifest(path: &Path) -> Result<SnapshotManifest, SnapshotError> {
  let content = fs::read(path).map_err(io_err(path))?;
  serde_json::from_slice(&content).map_err(|source| SnapshotError::Manifest {
    path: path.to_path_buf(),
    source,
  })
}

/// Load a cached entry and check every file against its manifest.
fn load_entry(entry: &Path, token: &VersionToken) -> Result<Snapshot, SnapshotError> {
  let manifest = read_manifest(&entry.join(MANIFEST_FILE))?;
  if &manifest.token != token {
    return Err(SnapshotError::unavailable(
      token,
      format!("cache entry belongs to '{}'", manifest.token),
    ));
  }

  let tree = Tree::load(&entry.join(TREE_DIR), &[]).map_err(|e| SnapshotError::unavailable(token, e))?;
  let snapshot = Snapshot::new(token.clone(), tree);

  if snapshot.file_hashes != manifest.files || snapshot.tree_hash != manifest.tree_hash {
    let changed = snapshot
      .file_hashes
      .iter()
      .filter(|(path, hash)| manifest.files.get(*path) != Some(*hash))
      .count()
      + manifest
        .files
        .keys()
        .filter(|path| !snapshot.file_hashes.contains_key(*path))
        .count();
    return Err(SnapshotError::unavailable(
      token,
      format!("cached tree failed verification ({} files differ)", changed),
    ));
  }

  Ok(snapshot)
}

/// Write a snapshot into a staging directory, then rename it into place.
fn store_entry(root: &Path, entry: &Path, snapshot: &Snapshot) -> Result<(), SnapshotError> {
  fs::create_dir_all(root).map_err(io_err(root))?;
  let key = entry
    .file_name()
    .map(|n| n.to_string_lossy().to_string())
    .unwrap_or_default();
  let staging = root.join(format!(".staging-{}-{}", key, std::process::id()));
  if staging.exists() {
    fs::remove_dir_all(&staging).map_err(io_err(&staging))?;
  }

  let manifest = SnapshotManifest {
    version: MANIFEST_VERSION,
    token: snapshot.token.clone(),
    tree_hash: snapshot.tree_hash.clone(),
    files: snapshot.file_hashes.clone(),
    fetched_at_unix: SystemTime::now()
      .duration_since(UNIX_EPOCH)
      .unwrap_or_default()
      .as_secs(),
  };

  let result = (|| {
    snapshot
      .tree
      .write_to(&staging.join(TREE_DIR))
      .map_err(|e| SnapshotError::unavailable(&snapshot.token, e))?;
    let json = serde_json::to_vec_pretty(&manifest).map_err(|source| SnapshotError::Manifest {
      path: staging.join(MANIFEST_FILE),
      source,
    })?;
    write_atomic(&staging.join(MANIFEST_FILE), &json).map_err(io_err(&staging))?;
    replace_dir(&staging, entry).map_err(io_err(entry))
  })();

  if result.is_err() {
    let _ = fs::remove_dir_all(&staging);
  }
  result
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::snapshot::types::SourceError;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::time::Duration;
  use tempfile::TempDir;

  /// In-memory source that counts fetches and can be slowed down.
  struct FakeSource {
    tree: Tree,
    fetches: AtomicUsize,
    delay: Duration,
  }

  impl FakeSource {
    fn new(delay: Duration) -> Self {
      let mut tree = Tree::new();
      tree.insert("Foo.txt", "hello");
      tree.insert("src/World.java", "class World {}\n");
      Self {
        tree,
        fetches: AtomicUsize::new(0),
        delay,
      }
    }
  }

  impl SnapshotSource for FakeSource {
    fn resolve(&self, reference: &str) -> Result<VersionToken, SourceError> {
      match reference {
        "main" => Ok(VersionToken::new("fake:upstream#1")),
        other => Err(SourceError::Resolve {
          reference: other.to_string(),
          message: "unknown".to_string(),
        }),
      }
    }

    fn fetch(&self, token: &VersionToken) -> Result<Tree, SourceError> {
      if token.as_str() != "fake:upstream#1" {
        return Err(SourceError::ForeignToken(token.to_string()));
      }
      self.fetches.fetch_add(1, Ordering::SeqCst);
      std::thread::sleep(self.delay);
      Ok(self.tree.clone())
    }
  }

  fn token() -> VersionToken {
    VersionToken::new("fake:upstream#1")
  }

  #[tokio::test]
  async fn retrieve_fetches_once_and_caches() {
    let temp = TempDir::new().unwrap();
    let source = Arc::new(FakeSource::new(Duration::ZERO));
    let store = SnapshotStore::new(temp.path(), source.clone());

    let first = store.retrieve(&token(), None).await.unwrap();
    let second = store.retrieve(&token(), None).await.unwrap();

    assert_eq!(source.fetches.load(Ordering::SeqCst), 1);
    assert_eq!(first.tree_hash, second.tree_hash);
    assert!(store.entry_dir(&token()).join(MANIFEST_FILE).exists());

    // A fresh store in another "process" reads the disk cache.
    let reopened = SnapshotStore::new(temp.path(), source.clone());
    let third = reopened.retrieve(&token(), Some(&first.tree_hash)).await.unwrap();
    assert_eq!(third.tree, first.tree);
    assert_eq!(source.fetches.load(Ordering::SeqCst), 1);
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
  async fn concurrent_retrieval_is_single_flight() {
    let temp = TempDir::new().unwrap();
    let source = Arc::new(FakeSource::new(Duration::from_millis(100)));
    let store = Arc::new(SnapshotStore::new(temp.path(), source.clone()));

    let mut handles = Vec::new();
    for _ in 0..8 {
      let store = store.clone();
      handles.push(tokio::spawn(async move { store.retrieve(&token(), None).await }));
    }
    for handle in handles {
      handle.await.unwrap().unwrap();
    }

    assert_eq!(source.fetches.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn tampered_cache_is_unavailable() {
    let temp = TempDir::new().unwrap();
    let source = Arc::new(FakeSource::new(Duration::ZERO));
    let store = SnapshotStore::new(temp.path(), source.clone());
    store.retrieve(&token(), None).await.unwrap();

    fs::write(store.entry_dir(&token()).join("tree/Foo.txt"), "tampered").unwrap();

    let reopened = SnapshotStore::new(temp.path(), source);
    let err = reopened.retrieve(&token(), None).await.unwrap_err();
    assert!(matches!(err, SnapshotError::Unavailable { .. }));
    assert!(err.to_string().contains("1 files differ"));
  }

  #[tokio::test]
  async fn lock_hash_mismatch_is_unavailable() {
    let temp = TempDir::new().unwrap();
    let store = SnapshotStore::new(temp.path(), Arc::new(FakeSource::new(Duration::ZERO)));
    let wrong = crate::util::hash::hash_bytes(b"other");

    let err = store.retrieve(&token(), Some(&wrong)).await.unwrap_err();
    assert!(matches!(err, SnapshotError::Unavailable { .. }));
  }

  #[tokio::test]
  async fn unknown_token_is_unavailable() {
    let temp = TempDir::new().unwrap();
    let store = SnapshotStore::new(temp.path(), Arc::new(FakeSource::new(Duration::ZERO)));

    let err = store.retrieve(&VersionToken::new("fake:gone#9"), None).await.unwrap_err();
    assert!(matches!(err, SnapshotError::Unavailable { .. }));
    assert!(!store.entry_dir(&VersionToken::new("fake:gone#9")).exists());
  }

  #[tokio::test]
  async fn resolve_goes_through_source() {
    let temp = TempDir::new().unwrap();
    let store = SnapshotStore::new(temp.path(), Arc::new(FakeSource::new(Duration::ZERO)));

    assert_eq!(store.resolve("main").await.unwrap(), token());
    assert!(matches!(
      store.resolve("nope").await,
      Err(SnapshotError::Unavailable { .. })
    ));
  }

  #[tokio::test]
  async fn evict_removes_entry() {
    let temp = TempDir::new().unwrap();
    let source = Arc::new(FakeSource::new(Duration::ZERO));
    let store = SnapshotStore::new(temp.path(), source.clone());
    store.retrieve(&token(), None).await.unwrap();

    assert_eq!(store.entries().unwrap().len(), 1);
    assert!(store.evict(&token()).unwrap());
    assert!(!store.evict(&token()).unwrap());
    assert!(store.entries().unwrap().is_empty());

    store.retrieve(&token(), None).await.unwrap();
    assert_eq!(source.fetches.load(Ordering::SeqCst), 2);
  }
}
