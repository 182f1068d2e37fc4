//! In-memory file trees.
//!
//! A [`Tree`] is the unit every pipeline stage exchanges: snapshots hold one,
//! the patch engine transforms one, the rebuild cache persists one. Paths are
//! relative and always `/`-separated regardless of platform.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;
use walkdir::WalkDir;

use crate::util::hash::{ContentHash, hash_bytes, tree_hash};

/// Errors from loading or materializing a tree.
#[derive(Debug, Error)]
pub enum TreeError {
  #[error("failed to walk '{path}': {message}")]
  Walk { path: PathBuf, message: String },

  #[error("failed to read '{path}': {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to write '{path}': {source}")]
  Write {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("invalid tree path '{0}'")]
  InvalidPath(String),
}

/// An ordered map of relative file paths to file contents.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tree {
  files: BTreeMap<String, Vec<u8>>,
}

impl Tree {
  pub fn new() -> Self {
    Self::default()
  }

  /// Load every regular file below `root`.
  ///
  /// Top-level entries named in `exclude` are skipped, as are symlinks and
  /// special files. Nested entries with the same names are ordinary content.
  pub fn load(root: &Path, exclude: &[&str]) -> Result<Self, TreeError> {
    let mut files = BTreeMap::new();

    let walker = WalkDir::new(root).sort_by_file_name().into_iter().filter_entry(|e| {
      e.depth() != 1
        || e
          .file_name()
          .to_str()
          .map(|name| !exclude.contains(&name))
          .unwrap_or(true)
    });

    for entry in walker {
      let entry = entry.map_err(|e| TreeError::Walk {
        path: root.to_path_buf(),
        message: e.to_string(),
      })?;

      if !entry.file_type().is_file() {
        if entry.file_type().is_symlink() {
          debug!(path = %entry.path().display(), "skipping symlink");
        }
        continue;
      }

      let rel = entry
        .path()
        .strip_prefix(root)
        .unwrap_or(entry.path())
        .to_string_lossy()
        .replace('\\', "/");

      let content = fs::read(entry.path()).map_err(|e| TreeError::Read {
        path: entry.path().to_path_buf(),
        source: e,
      })?;
      files.insert(rel, content);
    }

    Ok(Self { files })
  }

  /// Write every file below `root`, creating parent directories.
  ///
  /// Existing files not in the tree are left alone; callers that need an exact
  /// mirror write into a fresh directory.
  pub fn write_to(&self, root: &Path) -> Result<(), TreeError> {
    fs::create_dir_all(root).map_err(|e| TreeError::Write {
      path: root.to_path_buf(),
      source: e,
    })?;

    for (rel, content) in &self.files {
      let path = resolve(root, rel)?;
      if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| TreeError::Write {
          path: parent.to_path_buf(),
          source: e,
        })?;
      }
      fs::write(&path, content).map_err(|e| TreeError::Write { path, source: e })?;
    }

    Ok(())
  }

  pub fn get(&self, path: &str) -> Option<&[u8]> {
    self.files.get(path).map(Vec::as_slice)
  }

  pub fn contains(&self, path: &str) -> bool {
    self.files.contains_key(path)
  }

  pub fn insert(&mut self, path: impl Into<String>, content: impl Into<Vec<u8>>) -> Option<Vec<u8>> {
    self.files.insert(path.into(), content.into())
  }

  pub fn remove(&mut self, path: &str) -> Option<Vec<u8>> {
    self.files.remove(path)
  }

  pub fn paths(&self) -> impl Iterator<Item = &str> {
    self.files.keys().map(String::as_str)
  }

  pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
    self.files.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
  }

  pub fn len(&self) -> usize {
    self.files.len()
  }

  pub fn is_empty(&self) -> bool {
    self.files.is_empty()
  }

  /// Per-file SHA-256 hashes keyed by path.
  pub fn file_hashes(&self) -> BTreeMap<String, ContentHash> {
    self.files.iter().map(|(k, v)| (k.clone(), hash_bytes(v))).collect()
  }

  /// Deterministic hash of the whole tree.
  ///
  /// Equal to [`crate::util::hash::hash_directory`] of the tree written to an
  /// empty directory.
  pub fn content_hash(&self) -> ContentHash {
    let hashes = self.file_hashes();
    tree_hash(hashes.iter().map(|(path, hash)| (path.as_str(), hash)))
  }
}

impl FromIterator<(String, Vec<u8>)> for Tree {
  fn from_iter<I: IntoIterator<Item = (String, Vec<u8>)>>(iter: I) -> Self {
    Self {
      files: iter.into_iter().collect(),
    }
  }
}

/// Join a relative tree path onto `root`, refusing absolute paths and `..`.
pub fn resolve(root: &Path, rel: &str) -> Result<PathBuf, TreeError> {
  if rel.is_empty() || rel.starts_with('/') || rel.split('/').any(|c| c == ".." || c.is_empty()) {
    return Err(TreeError::InvalidPath(rel.to_string()));
  }
  Ok(rel.split('/').fold(root.to_path_buf(), |acc, c| acc.join(c)))
}
