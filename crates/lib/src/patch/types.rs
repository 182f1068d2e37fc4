use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::util::hash::{ContentHash, hash_bytes};

/// State of one file at a point in the stack: absent, or present with a hash.
///
/// `Absent` doubles as the "empty" sentinel a creation patch expects as its base.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "state", content = "hash")]
pub enum FileChecksum {
  Absent,
  Sha256(ContentHash),
}

impl FileChecksum {
  pub fn of(content: Option<&[u8]>) -> Self {
    match content {
      Some(bytes) => Self::Sha256(hash_bytes(bytes)),
      None => Self::Absent,
    }
  }

  /// Parse the `Base:` header form (`absent` or `sha256:<hex>`).
  pub fn parse(s: &str) -> Option<Self> {
    if s == "absent" {
      return Some(Self::Absent);
    }
    let hex = s.strip_prefix("sha256:")?;
    if hex.len() == 64 && hex.bytes().all(|b| b.is_ascii_hexdigit()) {
      Some(Self::Sha256(ContentHash(hex.to_ascii_lowercase())))
    } else {
      None
    }
  }
}

impl fmt::Display for FileChecksum {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Absent => write!(f, "absent"),
      Self::Sha256(hash) => write!(f, "sha256:{}", hash.0),
    }
  }
}

/// What a patch does to its target file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchOp {
  Modify,
  Create,
  Delete,
}

/// One named transformation of exactly one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Patch {
  /// Human-readable name (the `Subject:` line without `[PATCH]`).
  pub name: String,
  /// Position within the module's stack, starting at 0.
  pub ordinal: usize,
  /// Relative `/`-separated path of the file this patch changes.
  pub target: String,
  /// State the target must be in before this patch applies.
  pub base: FileChecksum,
  pub op: PatchOp,
  /// Unified diff body with `a/` and `b/` labels.
  pub diff: String,
  /// Header block as read from disk when it differs from the one this crate
  /// writes (another `From`, extra headers, an explicit `Operation`). Written
  /// back verbatim; generated patches have none.
  pub header: Option<String>,
}

/// An ordered sequence of patches for one module.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatchStack {
  patches: Vec<Patch>,
}

impl PatchStack {
  pub fn new(patches: Vec<Patch>) -> Self {
    Self { patches }
  }

  /// Build a stack and number ordinals by position.
  pub fn renumbered(patches: impl IntoIterator<Item = Patch>) -> Self {
    let patches = patches
      .into_iter()
      .enumerate()
      .map(|(ordinal, mut patch)| {
        patch.ordinal = ordinal;
        patch
      })
      .collect();
    Self { patches }
  }

  pub fn iter(&self) -> std::slice::Iter<'_, Patch> {
    self.patches.iter()
  }

  pub fn len(&self) -> usize {
    self.patches.len()
  }

  pub fn is_empty(&self) -> bool {
    self.patches.is_empty()
  }

  pub fn get(&self, index: usize) -> Option<&Patch> {
    self.patches.get(index)
  }

  pub fn into_inner(self) -> Vec<Patch> {
    self.patches
  }

  /// `(ordinal, checksum of the serialized patch file)` in stack order.
  pub fn checksums(&self) -> Vec<(usize, ContentHash)> {
    self
      .patches
      .iter()
      .map(|p| (p.ordinal, hash_bytes(super::format::to_file_string(p).as_bytes())))
      .collect()
  }
}

impl<'a> IntoIterator for &'a PatchStack {
  type Item = &'a Patch;
  type IntoIter = std::slice::Iter<'a, Patch>;

  fn into_iter(self) -> Self::IntoIter {
    self.patches.iter()
  }
}

/// A patch's expected base does not match the tree.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("patch {ordinal} ('{name}') expects {path} at {expected}, found {actual}")]
pub struct ConflictError {
  pub ordinal: usize,
  pub name: String,
  pub path: String,
  pub expected: FileChecksum,
  pub actual: FileChecksum,
}

/// Errors from applying, deriving or rebasing a stack.
#[derive(Debug, Error)]
pub enum ApplyError {
  #[error(transparent)]
  Conflict(#[from] ConflictError),

  /// The base checksum matched but the hunks do not apply: the patch file is corrupt.
  #[error("patch {ordinal} ({path}) rejected: {message}")]
  Rejected {
    ordinal: usize,
    path: String,
    message: String,
  },

  #[error("patch {ordinal} ({path}) has an unreadable diff: {message}")]
  Malformed {
    ordinal: usize,
    path: String,
    message: String,
  },

  #[error("{path} is not UTF-8 text and cannot be diffed")]
  Binary { path: String },
}

impl ApplyError {
  pub fn as_conflict(&self) -> Option<&ConflictError> {
    match self {
      Self::Conflict(c) => Some(c),
      _ => None,
    }
  }
}

/// Result of a successful stack application.
#[derive(Debug, Clone)]
pub struct AppliedStack {
  pub tree: crate::tree::Tree,
  /// Checksum of each patch's target after it applied, in stack order.
  pub results: Vec<FileChecksum>,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn checksum_header_round_trip() {
    let hash = FileChecksum::of(Some(b"hello"));
    let parsed = FileChecksum::parse(&hash.to_string()).unwrap();
    assert_eq!(parsed, hash);
    assert_eq!(FileChecksum::parse("absent"), Some(FileChecksum::Absent));
  }

  #[test]
  fn checksum_parse_rejects_garbage() {
    assert_eq!(FileChecksum::parse("sha256:xyz"), None);
    assert_eq!(FileChecksum::parse("md5:abc"), None);
  }

  #[test]
  fn conflict_message_names_ordinal_and_path() {
    let err = ConflictError {
      ordinal: 3,
      name: "Fix spawn".to_string(),
      path: "src/World.java".to_string(),
      expected: FileChecksum::Absent,
      actual: FileChecksum::of(Some(b"x")),
    };
    let msg = err.to_string();
    assert!(msg.contains("patch 3"));
    assert!(msg.contains("src/World.java"));
  }
}
