//! Rebuild cache.
//!
//! Each module build is keyed by its [`Fingerprint`]. A completed entry holds
//! the patched source tree and the toolchain's compiled output:
//!
//! ```text
//! {cache}/builds/<fingerprint>/
//!   tree/                  # working tree the toolchain compiled
//!   compiled/              # toolchain output
//!   .patchstack-complete   # BuildMarker, written last
//! ```
//!
//! Entries are assembled in a staging directory and renamed into place before
//! the marker is written, so an interrupted build never looks complete.

mod fingerprint;

pub use fingerprint::{Fingerprint, fingerprint};

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::consts::BUILD_COMPLETE_MARKER;
use crate::tree::{Tree, TreeError};
use crate::util::fs::{copy_dir, replace_dir, write_atomic};
use crate::util::hash::{ContentHash, DirHashError, ObjectHash, hash_directory};

const BUILDS_DIR: &str = "builds";
const TREE_DIR: &str = "tree";
const COMPILED_DIR: &str = "compiled";
const MARKER_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum CacheError {
  #[error("cache I/O error at '{path}': {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error(transparent)]
  Tree(#[from] TreeError),

  #[error("failed to hash cache entry: {0}")]
  Hash(#[from] DirHashError),

  #[error("failed to serialize build marker: {0}")]
  Marker(#[from] serde_json::Error),
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> CacheError + '_ {
  move |source| CacheError::Io {
    path: path.to_path_buf(),
    source,
  }
}

/// Contents of the completion marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildMarker {
  pub version: u32,
  pub fingerprint: Fingerprint,
  pub module: String,
  pub tree_hash: ContentHash,
  pub compiled_hash: ContentHash,
  pub created_at_unix: u64,
}

/// A verified, completed cache entry.
#[derive(Debug, Clone)]
pub struct CachedBuild {
  pub marker: BuildMarker,
  pub tree_dir: PathBuf,
  pub compiled_dir: PathBuf,
}

impl CachedBuild {
  /// Load the cached working tree into memory.
  pub fn load_tree(&self) -> Result<Tree, CacheError> {
    Ok(Tree::load(&self.tree_dir, &[])?)
  }
}

/// Fingerprint-addressed store of module builds.
#[derive(Debug)]
pub struct RebuildCache {
  root: PathBuf,
  locks: StdMutex<HashMap<Fingerprint, Arc<Mutex<()>>>>,
}

impl RebuildCache {
  /// Open the rebuild cache below `cache_dir`.
  pub fn new(cache_dir: &Path) -> Self {
    Self {
      root: cache_dir.join(BUILDS_DIR),
      locks: StdMutex::new(HashMap::new()),
    }
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  pub fn entry_dir(&self, fp: &Fingerprint) -> PathBuf {
    self.root.join(&fp.0)
  }

  /// Serialize work on one fingerprint within this process.
  ///
  /// Different fingerprints never contend.
  pub async fn lock(&self, fp: &Fingerprint) -> OwnedMutexGuard<()> {
    let mutex = {
      let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
      locks.entry(fp.clone()).or_default().clone()
    };
    mutex.lock_owned().await
  }

  /// Whether `fp` must be (re)built.
  ///
  /// False only for a complete entry whose marker names `fp` and whose
  /// directories still hash to the recorded values.
  pub fn should_rebuild(&self, fp: &Fingerprint) -> bool {
    match self.lookup(fp) {
      Ok(Some(_)) => false,
      Ok(None) => true,
      Err(e) => {
        warn!(fingerprint = %fp, error = %e, "unreadable cache entry, rebuilding");
        true
      }
    }
  }

  /// Return the verified entry for `fp`, if there is one.
  pub fn lookup(&self, fp: &Fingerprint) -> Result<Option<CachedBuild>, CacheError> {
    let entry = self.entry_dir(fp);
    let marker_path = entry.join(BUILD_COMPLETE_MARKER);

    let content = match fs::read(&marker_path) {
      Ok(content) => content,
      Err(e) if e.kind() == io::ErrorKind::NotFound => {
        debug!(fingerprint = %fp, "cache miss");
        return Ok(None);
      }
      Err(e) => return Err(io_err(&marker_path)(e)),
    };

    let marker: BuildMarker = match serde_json::from_slice(&content) {
      Ok(marker) => marker,
      Err(e) => {
        warn!(fingerprint = %fp, error = %e, "corrupt build marker");
        return Ok(None);
      }
    };

    if marker.version != MARKER_VERSION || &marker.fingerprint != fp {
      warn!(fingerprint = %fp, "build marker does not match entry");
      return Ok(None);
    }

    let build = CachedBuild {
      tree_dir: entry.join(TREE_DIR),
      compiled_dir: entry.join(COMPILED_DIR),
      marker,
    };

    if !build.tree_dir.is_dir() || !build.compiled_dir.is_dir() {
      warn!(fingerprint = %fp, "cache entry is missing directories");
      return Ok(None);
    }
    if hash_directory(&build.tree_dir)? != build.marker.tree_hash
      || hash_directory(&build.compiled_dir)? != build.marker.compiled_hash
    {
      warn!(fingerprint = %fp, "cache entry content changed since it was recorded");
      return Ok(None);
    }

    debug!(fingerprint = %fp, module = %build.marker.module, "cache hit");
    Ok(Some(build))
  }

  /// Record a completed build for `fp`.
  ///
  /// `compiled` is copied, not moved, so the toolchain's scratch space can be
  /// discarded independently.
  pub fn record(&self, fp: &Fingerprint, module: &str, tree: &Tree, compiled: &Path) -> Result<CachedBuild, CacheError> {
    fs::create_dir_all(&self.root).map_err(io_err(&self.root))?;

    let staging = self.root.join(format!(".staging-{}-{}", fp.0, std::process::id()));
    if staging.exists() {
      fs::remove_dir_all(&staging).map_err(io_err(&staging))?;
    }

    let result = self.populate(&staging, tree, compiled);
    let (tree_hash, compiled_hash) = match result {
      Ok(hashes) => hashes,
      Err(e) => {
        let _ = fs::remove_dir_all(&staging);
        return Err(e);
      }
    };

    let entry = self.entry_dir(fp);
    replace_dir(&staging, &entry).map_err(io_err(&entry))?;

    let marker = BuildMarker {
      version: MARKER_VERSION,
      fingerprint: fp.clone(),
      module: module.to_string(),
      tree_hash,
      compiled_hash,
      created_at_unix: SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs(),
    };
    let marker_path = entry.join(BUILD_COMPLETE_MARKER);
    write_atomic(&marker_path, &serde_json::to_vec_pretty(&marker)?).map_err(io_err(&marker_path))?;

    info!(fingerprint = %fp, module, "recorded build");
    Ok(CachedBuild {
      tree_dir: entry.join(TREE_DIR),
      compiled_dir: entry.join(COMPILED_DIR),
      marker,
    })
  }

  fn populate(&self, staging: &Path, tree: &Tree, compiled: &Path) -> Result<(ContentHash, ContentHash), CacheError> {
    let tree_dir = staging.join(TREE_DIR);
    let compiled_dir = staging.join(COMPILED_DIR);

    tree.write_to(&tree_dir)?;
    copy_dir(compiled, &compiled_dir).map_err(io_err(compiled))?;

    Ok((hash_directory(&tree_dir)?, hash_directory(&compiled_dir)?))
  }

  /// Fingerprints of every complete-looking entry (marker present).
  pub fn entries(&self) -> Result<Vec<Fingerprint>, CacheError> {
    let read = match fs::read_dir(&self.root) {
      Ok(read) => read,
      Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
      Err(e) => return Err(io_err(&self.root)(e)),
    };

    let mut out = Vec::new();
    for entry in read {
      let entry = entry.map_err(io_err(&self.root))?;
      let name = entry.file_name().to_string_lossy().to_string();
      if name.starts_with('.') {
        continue;
      }
      if entry.path().join(BUILD_COMPLETE_MARKER).exists() {
        out.push(ObjectHash(name));
      }
    }
    out.sort();
    Ok(out)
  }

  /// Delete the entry for `fp`. Returns whether anything was removed.
  pub fn remove(&self, fp: &Fingerprint) -> Result<bool, CacheError> {
    let entry = self.entry_dir(fp);
    match fs::remove_dir_all(&entry) {
      Ok(()) => {
        info!(fingerprint = %fp, "removed build entry");
        Ok(true)
      }
      Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
      Err(e) => Err(io_err(&entry)(e)),
    }
  }

  /// Remove leftover staging directories from interrupted builds.
  pub fn clean_staging(&self) -> Result<usize, CacheError> {
    let read = match fs::read_dir(&self.root) {
      Ok(read) => read,
      Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
      Err(e) => return Err(io_err(&self.root)(e)),
    };

    let mut removed = 0;
    for entry in read {
      let entry = entry.map_err(io_err(&self.root))?;
      if entry.file_name().to_string_lossy().starts_with(".staging-") {
        fs::remove_dir_all(entry.path()).map_err(io_err(&entry.path()))?;
        removed += 1;
      }
    }
    Ok(removed)
  }
}
