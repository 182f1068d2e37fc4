//! Where upstream trees come from.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::consts::WORKTREE_IGNORED;
use crate::tree::Tree;
use crate::util::hash::truncated_hash;

use super::types::{SourceError, VersionToken};

/// A provider of upstream snapshots.
///
/// Implementations do blocking I/O; async callers run them on the blocking pool.
pub trait SnapshotSource: Send + Sync {
  /// Pin a reference (branch, tag, commit, path) to a stable token.
  fn resolve(&self, reference: &str) -> Result<VersionToken, SourceError>;

  /// Produce the tree a previously resolved token names.
  fn fetch(&self, token: &VersionToken) -> Result<Tree, SourceError>;
}

/// A local directory used as the upstream.
///
/// The token pins both the path and the content hash, so editing the
/// directory yields a new token on the next resolve.
#[derive(Debug, Clone)]
pub struct DirSource {
  root: PathBuf,
}

impl DirSource {
  pub fn new(root: impl Into<PathBuf>) -> Self {
    Self { root: root.into() }
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  /// Current tree plus the `(location, pin)` a token for it carries.
  fn load(&self) -> Result<(Tree, String, String), SourceError> {
    let tree = Tree::load(&self.root, WORKTREE_IGNORED)?;
    let pin = truncated_hash(tree.content_hash().0.as_bytes()).0;
    let location = dunce::canonicalize(&self.root)
      .unwrap_or_else(|_| self.root.clone())
      .display()
      .to_string();
    Ok((tree, location, pin))
  }
}

impl SnapshotSource for DirSource {
  fn resolve(&self, reference: &str) -> Result<VersionToken, SourceError> {
    if !self.root.is_dir() {
      return Err(SourceError::Resolve {
        reference: reference.to_string(),
        message: format!("'{}' is not a directory", self.root.display()),
      });
    }
    let (tree, location, pin) = self.load()?;
    let token = VersionToken::new(format!("dir:{}#{}", location, pin));
    debug!(%token, files = tree.len(), "resolved directory upstream");
    Ok(token)
  }

  /// The directory only holds its current content, so a token pinned to
  /// earlier content can no longer be fetched.
  fn fetch(&self, token: &VersionToken) -> Result<Tree, SourceError> {
    let Some(("dir", location, pinned)) = token.parts() else {
      return Err(SourceError::ForeignToken(token.to_string()));
    };
    let (tree, current_location, pin) = self.load()?;
    if location != current_location {
      return Err(SourceError::ForeignToken(token.to_string()));
    }
    if pinned != pin {
      return Err(SourceError::Resolve {
        reference: token.to_string(),
        message: format!("directory content changed (now {})", pin),
      });
    }
    Ok(tree)
  }
}
