use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::tree::{Tree, TreeError};
use crate::util::hash::{ContentHash, ObjectHash, truncated_hash};

/// Opaque, stable identifier of one upstream version.
///
/// Produced by a [`super::SnapshotSource`] when it pins a reference, e.g.
/// `git+https://host/repo.git#<commit>` or `dir:/abs/path#<tree hash>`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionToken(String);

impl VersionToken {
  pub fn new(token: impl Into<String>) -> Self {
    Self(token.into())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }

  /// Cache directory name for this token.
  pub fn key(&self) -> ObjectHash {
    truncated_hash(self.0.as_bytes())
  }

  /// Split into `(scheme, location, pin)`, e.g. `("git+https", "//host/repo.git", "abc")`.
  pub fn parts(&self) -> Option<(&str, &str, &str)> {
    let (scheme, rest) = self.0.split_once(':')?;
    let (location, pin) = rest.rsplit_once('#')?;
    Some((scheme, location, pin))
  }
}

impl fmt::Display for VersionToken {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// An immutable upstream tree identified by its token.
#[derive(Debug, Clone)]
pub struct Snapshot {
  pub token: VersionToken,
  pub tree: Tree,
  pub file_hashes: BTreeMap<String, ContentHash>,
  pub tree_hash: ContentHash,
}

impl Snapshot {
  pub fn new(token: VersionToken, tree: Tree) -> Self {
    Self {
      file_hashes: tree.file_hashes(),
      tree_hash: tree.content_hash(),
      token,
      tree,
    }
  }
}

/// `snapshot.json`, stored next to the snapshot's files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotManifest {
  pub version: u32,
  pub token: VersionToken,
  pub tree_hash: ContentHash,
  pub files: BTreeMap<String, ContentHash>,
  pub fetched_at_unix: u64,
}

/// Failures reported by a snapshot source.
#[derive(Debug, Error)]
pub enum SourceError {
  #[error("cannot resolve '{reference}': {message}")]
  Resolve { reference: String, message: String },

  #[error("token '{0}' does not belong to this source")]
  ForeignToken(String),

  #[error("git error for '{url}': {source}")]
  Git {
    url: String,
    #[source]
    source: Box<dyn std::error::Error + Send + Sync>,
  },

  #[error(transparent)]
  Tree(#[from] TreeError),
}

#[derive(Debug, Error)]
pub enum SnapshotError {
  /// The token cannot be fetched, or its content fails verification.
  #[error("snapshot '{token}' unavailable: {reason}")]
  Unavailable { token: String, reason: String },

  #[error("snapshot cache I/O error at '{path}': {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("invalid snapshot manifest '{path}': {source}")]
  Manifest {
    path: PathBuf,
    #[source]
    source: serde_json::Error,
  },

  #[error("snapshot task failed: {0}")]
  Join(String),
}

impl SnapshotError {
  pub(crate) fn unavailable(token: &VersionToken, reason: impl fmt::Display) -> Self {
    Self::Unavailable {
      token: token.to_string(),
      reason: reason.to_string(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn token_parts() {
    let token = VersionToken::new("git+https://example.com/upstream.git#0123abcd");
    let (scheme, location, pin) = token.parts().unwrap();
    assert_eq!(scheme, "git+https");
    assert_eq!(location, "//example.com/upstream.git");
    assert_eq!(pin, "0123abcd");
    assert!(VersionToken::new("no-scheme").parts().is_none());
  }

  #[test]
  fn key_is_stable_and_short() {
    let token = VersionToken::new("dir:/srv/upstream#abc");
    assert_eq!(token.key(), token.clone().key());
    assert_eq!(token.key().0.len(), crate::consts::OBJ_HASH_PREFIX_LEN);
  }

  #[test]
  fn snapshot_hashes_match_tree() {
    let mut tree = Tree::new();
    tree.insert("a.txt", "a");
    let snapshot = Snapshot::new(VersionToken::new("dir:/x#1"), tree.clone());
    assert_eq!(snapshot.tree_hash, tree.content_hash());
    assert_eq!(snapshot.file_hashes.len(), 1);
  }
}
