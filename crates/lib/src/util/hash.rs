//! SHA-256 content hashes.
//!
//! [`ContentHash`] is the full digest and verifies file and tree contents.
//! [`ObjectHash`] is a short prefix of one and names cache directories
//! (snapshot keys, build fingerprints).
//!
//! A tree hash is the digest of one `F:<path>:<file hash>` line per file in
//! path order. Directories are not recorded, so empty ones are invisible.

use std::fmt;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use walkdir::WalkDir;

use crate::consts::OBJ_HASH_PREFIX_LEN;

/// Serializing a value for [`object_hash`] failed.
pub type HashError = serde_json::Error;

/// Short hash used as a cache directory name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectHash(pub String);

/// Full lowercase-hex SHA-256.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ContentHash(pub String);

impl fmt::Display for ObjectHash {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl fmt::Display for ContentHash {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

#[derive(Debug, Error)]
pub enum DirHashError {
  #[error("failed to walk '{path}': {message}")]
  Walk { path: PathBuf, message: String },

  #[error("failed to read '{path}': {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: io::Error,
  },
}

fn finish(hasher: Sha256) -> ContentHash {
  ContentHash(hex::encode(hasher.finalize()))
}

pub fn hash_bytes(data: &[u8]) -> ContentHash {
  finish(Sha256::new_with_prefix(data))
}

/// Truncated [`hash_bytes`].
pub fn truncated_hash(data: &[u8]) -> ObjectHash {
  ObjectHash(hash_bytes(data).0[..OBJ_HASH_PREFIX_LEN].to_string())
}

/// Short hash of `value`'s JSON form. Field order is declaration order, so
/// the result is stable for a given type.
pub fn object_hash<T: Serialize + ?Sized>(value: &T) -> Result<ObjectHash, HashError> {
  Ok(truncated_hash(&serde_json::to_vec(value)?))
}

/// Stream a file through SHA-256.
pub fn hash_file(path: &Path) -> Result<ContentHash, DirHashError> {
  let read = |source| DirHashError::Read {
    path: path.to_path_buf(),
    source,
  };
  let mut file = File::open(path).map_err(read)?;
  let mut hasher = Sha256::new();
  io::copy(&mut file, &mut hasher).map_err(read)?;
  Ok(finish(hasher))
}

/// Combine `(path, file hash)` pairs, which must already be in path order.
pub(crate) fn tree_hash<'a>(files: impl IntoIterator<Item = (&'a str, &'a ContentHash)>) -> ContentHash {
  let mut hasher = Sha256::new();
  for (path, hash) in files {
    hasher.update(format!("F:{}:{}\n", path, hash.0).as_bytes());
  }
  finish(hasher)
}

/// Tree hash of every regular file below `root`.
///
/// Agrees with [`crate::tree::Tree::content_hash`] for the same files, which
/// is how cache entries on disk are checked against their markers.
pub fn hash_directory(root: &Path) -> Result<ContentHash, DirHashError> {
  let mut files = Vec::new();
  for entry in WalkDir::new(root).sort_by_file_name() {
    let entry = entry.map_err(|e| DirHashError::Walk {
      path: root.to_path_buf(),
      message: e.to_string(),
    })?;
    if !entry.file_type().is_file() {
      continue;
    }
    let rel = entry
      .path()
      .strip_prefix(root)
      .unwrap_or(entry.path())
      .to_string_lossy()
      .replace('\\', "/");
    files.push((rel, hash_file(entry.path())?));
  }
  // Walk order is per directory; tree order is over the whole path.
  files.sort_by(|a, b| a.0.cmp(&b.0));
  Ok(tree_hash(files.iter().map(|(p, h)| (p.as_str(), h))))
}
